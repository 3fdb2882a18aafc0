//! Key derivation as seen through wrapped operations.

use proptest::prelude::*;
use recall_cache::{Args, Cache, CacheSettings, CallOptions, Cached, OperationId};
use recall_test_utils::generators::{arb_args, arb_arg_value};
use std::future::Ready;

type Echo = Cached<Args, usize, String, fn(Args) -> Ready<Result<usize, String>>>;

fn echo(args: Args) -> Ready<Result<usize, String>> {
    std::future::ready(Ok(args.positional_count()))
}

fn wrapped(options: CallOptions) -> Echo {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    cache
        .wrap(OperationId::new("keys", "echo"), options, echo as fn(Args) -> Ready<Result<usize, String>>)
        .expect("wrap should succeed")
}

proptest! {
    #[test]
    fn prop_equal_args_equal_keys(args in arb_args()) {
        let echo = wrapped(CallOptions::new());
        let first = echo.key_for(&args).expect("key should derive");
        let second = echo.key_for(&args.clone()).expect("key should derive");
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_excluded_named_arg_never_changes_key(
        args in arb_args(),
        left in arb_arg_value(),
        right in arb_arg_value(),
    ) {
        let echo = wrapped(CallOptions::new().exclude("session"));
        let with_left = args.clone().named("session", left);
        let with_right = args.clone().named("session", right);
        let key = echo.key_for(&with_left).expect("key should derive");
        prop_assert_eq!(&key, &echo.key_for(&with_right).expect("key should derive"));
        prop_assert_eq!(key, echo.key_for(&args).expect("key should derive"));
    }

    #[test]
    fn prop_keys_carry_the_prefix(args in arb_args()) {
        let echo = wrapped(CallOptions::new().with_key_prefix("svc"));
        let key = echo.key_for(&args).expect("key should derive");
        prop_assert!(key.as_str().starts_with("svc:"));
    }
}

#[test]
fn different_operations_never_share_keys() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let args = Args::new().arg(1).named("mode", "full");
    let keys: Vec<_> = ["echo", "echo_v2"]
        .iter()
        .map(|name| {
            cache
                .wrap(
                    OperationId::new("keys", *name),
                    CallOptions::new(),
                    echo as fn(Args) -> Ready<Result<usize, String>>,
                )
                .expect("wrap should succeed")
                .key_for(&args)
                .expect("key should derive")
        })
        .collect();
    assert_ne!(keys[0], keys[1]);
}
