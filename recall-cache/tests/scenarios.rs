//! End-to-end behaviour of wrapped operations.

use recall_cache::{
    Args, BackendRegistration, Cache, CacheKey, CacheSettings, CallOptions, CircuitBreakerConfig, CircuitState,
    EventKind, LmdbStore, MemoryStore, OperationId, StampedeConfig, Store,
};
use recall_core::{KeyGenerationError, StoreOp};
use recall_test_utils::{CountingStore, FlakyStore, RecordingHandler, StoreLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn op(name: &str) -> OperationId {
    OperationId::new("scenarios", name)
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[tokio::test]
async fn square_twice_executes_once_with_miss_then_hit() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let recorder = RecordingHandler::attach_all(cache.events());
    let runs = counter();
    let seen = Arc::clone(&runs);
    let square = cache
        .wrap(op("square"), CallOptions::new().with_ttl(Duration::from_secs(60)), move |x: i64| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(x * x)
            }
        })
        .expect("wrap should succeed");

    assert_eq!(square.call(4).await, Ok(16));
    assert_eq!(square.call(4).await, Ok(16));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let lookups: Vec<EventKind> = recorder
        .kinds()
        .into_iter()
        .filter(|k| matches!(k, EventKind::CacheMiss | EventKind::CacheHit))
        .collect();
    assert_eq!(lookups, vec![EventKind::CacheMiss, EventKind::CacheHit]);

    let events = recorder.events();
    let end = events
        .iter()
        .find(|e| e.kind == EventKind::FunctionCallEnd)
        .expect("call end should be published");
    assert!(end.duration.is_some());
    assert_eq!(end.function, "scenarios::square");
}

#[tokio::test]
async fn failing_store_still_returns_result() {
    let cache = Cache::builder(CacheSettings::default())
        .backend("flaky", BackendRegistration::new(FlakyStore::broken()))
        .build()
        .expect("cache should build");
    let recorder = RecordingHandler::attach_all(cache.events());
    let square = cache
        .wrap(op("square_broken"), CallOptions::new().with_backend("flaky"), |x: i64| async move {
            Ok::<_, String>(x * x)
        })
        .expect("wrap should succeed");

    assert_eq!(square.call(4).await, Ok(16));
    let errors: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::CacheError)
        .collect();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|e| e.backend.as_deref() == Some("flaky")));
    assert!(errors.iter().any(|e| e.operation == Some(StoreOp::Get)));
    assert_eq!(recorder.count(EventKind::CacheSet), 0);
}

#[tokio::test]
async fn operation_error_reaches_caller_unchanged() {
    #[derive(Debug, Clone, PartialEq)]
    struct Refused(u32);

    impl std::fmt::Display for Refused {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "refused with code {}", self.0)
        }
    }

    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let recorder = RecordingHandler::attach_all(cache.events());
    let refuse = cache
        .wrap(op("refuse"), CallOptions::new(), |code: u32| async move { Err::<u8, _>(Refused(code)) })
        .expect("wrap should succeed");

    assert_eq!(refuse.call(7).await, Err(Refused(7)));
    let failure = recorder
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::FunctionError)
        .expect("function error should be published");
    assert_eq!(failure.error.as_deref(), Some("refused with code 7"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_execution() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let runs = counter();
    let seen = Arc::clone(&runs);
    let slow = cache
        .wrap(op("slow"), CallOptions::new(), move |x: u64| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(x + 1)
            }
        })
        .expect("wrap should succeed");

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let slow = slow.clone();
            tokio::spawn(async move { slow.call(41).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.expect("task should not panic"), Ok(42));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn breaker_short_circuits_then_allows_one_trial() {
    let settings = CacheSettings {
        circuit_breaker: CircuitBreakerConfig::new(3, Duration::from_millis(200)),
        ..CacheSettings::default()
    };
    let flaky = Arc::new(FlakyStore::broken());
    let cache = Cache::builder(settings)
        .backend("flaky", BackendRegistration::from_arc(Arc::clone(&flaky) as Arc<dyn Store>))
        .build()
        .expect("cache should build");
    let double = cache
        .wrap(op("double"), CallOptions::new().with_backend("flaky"), |x: i64| async move {
            Ok::<_, String>(x * 2)
        })
        .expect("wrap should succeed");

    // get + set fail on the first call, get fails on the second.
    assert_eq!(double.call(1).await, Ok(2));
    assert_eq!(double.call(1).await, Ok(2));
    assert_eq!(cache.circuit_state("flaky"), Some(CircuitState::Open));

    let before = flaky.calls();
    for _ in 0..3 {
        assert_eq!(double.call(1).await, Ok(2));
    }
    assert_eq!(flaky.calls(), before, "open circuit must not touch the store");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(double.call(1).await, Ok(2));
    assert_eq!(flaky.calls(), before + 1, "exactly one trial call");
    assert_eq!(cache.circuit_state("flaky"), Some(CircuitState::Open));

    tokio::time::sleep(Duration::from_millis(250)).await;
    flaky.fail_all(false);
    assert_eq!(double.call(1).await, Ok(2));
    assert_eq!(cache.circuit_state("flaky"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn hit_in_slow_tier_is_promoted() {
    let tiers: Vec<Arc<CountingStore>> = (0..3).map(|_| Arc::new(CountingStore::memory())).collect();
    let mut builder = Cache::builder(CacheSettings::default());
    for (idx, store) in tiers.iter().enumerate() {
        builder = builder.backend(
            format!("l{idx}"),
            BackendRegistration::from_arc(Arc::clone(store) as Arc<dyn Store>),
        );
    }
    let cache = builder.build().expect("cache should build");
    let recorder = RecordingHandler::attach_all(cache.events());
    let runs = counter();
    let seen = Arc::clone(&runs);
    let lookup = cache
        .wrap(op("lookup"), CallOptions::new().with_tiers(["l0", "l1", "l2"]), move |id: u32| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(format!("user-{id}"))
            }
        })
        .expect("wrap should succeed");

    assert_eq!(lookup.call(9).await, Ok("user-9".to_string()));
    for store in &tiers {
        assert_eq!(store.counts().set, 1, "write goes through every tier");
    }

    let key = lookup.key_for(&9).expect("key should derive");
    tiers[0].clear().await.expect("clear should succeed");
    tiers[1].clear().await.expect("clear should succeed");

    assert_eq!(lookup.call(9).await, Ok("user-9".to_string()));
    let hit_tiers: Vec<Option<usize>> = recorder
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::CacheHit)
        .map(|e| e.tier)
        .collect();
    assert_eq!(hit_tiers, vec![Some(2)]);
    assert!(tiers[0].get(&key).await.expect("get should succeed").is_some());
    assert!(tiers[1].get(&key).await.expect("get should succeed").is_some());

    assert_eq!(lookup.call(9).await, Ok("user-9".to_string()));
    let last_hit = recorder
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::CacheHit)
        .last()
        .expect("hit should be published");
    assert_eq!(last_hit.tier, Some(0));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn excluded_arguments_do_not_change_the_key() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let runs = counter();
    let seen = Arc::clone(&runs);
    let fetch = cache
        .wrap(
            op("fetch"),
            CallOptions::new()
                .with_signature(["user", "request_id"])
                .exclude("request_id")
                .exclude("trace"),
            move |args: Args| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(args.positional_count())
                }
            },
        )
        .expect("wrap should succeed");

    let first = Args::new().arg(1).arg("req-a").named("trace", "t1");
    let second = Args::new().arg(1).arg("req-b").named("trace", "t2");
    assert_eq!(
        fetch.key_for(&first).expect("key should derive"),
        fetch.key_for(&second).expect("key should derive")
    );
    fetch.call(first).await.expect("call should succeed");
    fetch.call(second).await.expect("call should succeed");
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    fetch.call(Args::new().arg(2).arg("req-a")).await.expect("call should succeed");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let runs = counter();
    let seen = Arc::clone(&runs);
    let now = cache
        .wrap(op("now"), CallOptions::new().with_ttl(Duration::from_millis(50)), move |_: ()| {
            let seen = Arc::clone(&seen);
            async move { Ok::<_, String>(seen.fetch_add(1, Ordering::SeqCst)) }
        })
        .expect("wrap should succeed");

    assert_eq!(now.call(()).await, Ok(0));
    assert_eq!(now.call(()).await, Ok(0));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(now.call(()).await, Ok(1));
}

#[tokio::test]
async fn custom_key_builder_decides_the_key() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let runs = counter();
    let seen = Arc::clone(&runs);
    let options = CallOptions::new().with_key_builder(|op: &OperationId, _: &Args| {
        Ok::<_, KeyGenerationError>(CacheKey::new(format!("custom:{}", op.name())))
    });
    let config = cache
        .wrap(op("config"), options, move |section: String| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(section)
            }
        })
        .expect("wrap should succeed");

    assert_eq!(config.key_for(&"a".to_string()).expect("key should derive").as_str(), "custom:config");
    assert_eq!(config.call("a".to_string()).await, Ok("a".to_string()));
    assert_eq!(config.call("b".to_string()).await, Ok("a".to_string()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tag_invalidation_spans_operations() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let runs = counter();
    let make = |name: &str| {
        let seen = Arc::clone(&runs);
        cache
            .wrap(op(name), CallOptions::new().with_tag("profile"), move |id: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(id)
                }
            })
            .expect("wrap should succeed")
    };
    let name = make("name");
    let avatar = make("avatar");

    name.call(1).await.expect("call should succeed");
    avatar.call(1).await.expect("call should succeed");
    assert_eq!(cache.invalidate_tag("profile").await.attempted, 2);

    name.call(1).await.expect("call should succeed");
    avatar.call(1).await.expect("call should succeed");
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn lmdb_backend_serves_new_contexts() {
    let dir = tempfile::TempDir::new().expect("tempdir should be created");
    let store: Arc<dyn Store> = Arc::new(LmdbStore::open(dir.path(), 16).expect("lmdb should open"));
    let runs = counter();

    for _ in 0..2 {
        let cache = Cache::builder(CacheSettings::default())
            .backend("disk", BackendRegistration::from_arc(Arc::clone(&store)).with_compression(true))
            .build()
            .expect("cache should build");
        let seen = Arc::clone(&runs);
        let report = cache
            .wrap(op("report"), CallOptions::new().with_backend("disk"), move |year: u16| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(vec![format!("{year}-q1"), format!("{year}-q2")])
                }
            })
            .expect("wrap should succeed");
        assert_eq!(
            report.call(2024).await,
            Ok(vec!["2024-q1".to_string(), "2024-q2".to_string()])
        );
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wrap_blocking_shares_the_async_path() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let runs = counter();
    let seen = Arc::clone(&runs);
    let checksum = cache
        .wrap_blocking(op("checksum"), CallOptions::new(), move |data: String| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(data.bytes().map(u64::from).sum::<u64>())
        })
        .expect("wrap should succeed");

    assert_eq!(checksum.call("abc".to_string()).await, Ok(294));
    assert_eq!(checksum.call("abc".to_string()).await, Ok(294));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_backend_fails_at_wrap_time() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let err = cache
        .wrap(
            op("orphan"),
            CallOptions::new().with_tiers(["memory", "redis"]),
            |_: ()| async { Ok::<u8, String>(0) },
        )
        .expect_err("unknown tier should fail");
    assert_eq!(err.type_name(), "ConfigError");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distributed_lock_coordinates_separate_contexts() {
    let shared: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let runs = counter();
    let contexts: Vec<Cache> = (0..2)
        .map(|_| {
            Cache::builder(CacheSettings::default())
                .backend("shared", BackendRegistration::from_arc(Arc::clone(&shared)))
                .build()
                .expect("cache should build")
        })
        .collect();

    let handles: Vec<_> = contexts
        .iter()
        .map(|cache| {
            let seen = Arc::clone(&runs);
            let build = cache
                .wrap(
                    op("build"),
                    CallOptions::new()
                        .with_backend("shared")
                        .with_distributed_lock(Duration::from_secs(2)),
                    move |target: String| {
                        let seen = Arc::clone(&seen);
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, String>(format!("built {target}"))
                        }
                    },
                )
                .expect("wrap should succeed");
            tokio::spawn(async move { build.call("app".to_string()).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.expect("task should not panic"), Ok("built app".to_string()));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lock_timeout_falls_back_to_local_execution() {
    let shared = Arc::new(MemoryStore::new());
    let cache = Cache::builder(CacheSettings::default())
        .backend("shared", BackendRegistration::from_arc(Arc::clone(&shared) as Arc<dyn Store>))
        .build()
        .expect("cache should build");
    let recorder = RecordingHandler::attach_all(cache.events());
    let job = cache
        .wrap(
            op("job"),
            CallOptions::new()
                .with_backend("shared")
                .with_distributed_lock(Duration::from_millis(50)),
            |n: u8| async move { Ok::<_, String>(n) },
        )
        .expect("wrap should succeed");

    let key = job.key_for(&5).expect("key should derive");
    let held = shared
        .acquire_lock(&key, Duration::from_millis(10))
        .await
        .expect("lock should be free");

    assert_eq!(job.call(5).await, Ok(5));
    assert!(recorder
        .events()
        .iter()
        .any(|e| e.kind == EventKind::CacheError && e.operation == Some(StoreOp::Lock)));
    held.release().await.expect("release should succeed");
}

#[tokio::test]
async fn near_expiry_hits_refresh_in_background() {
    let cache = Cache::new(CacheSettings::default()).expect("cache should build");
    let runs = counter();
    let seen = Arc::clone(&runs);
    let options = CallOptions::new()
        .with_ttl(Duration::from_secs(1))
        .with_stampede(StampedeConfig {
            enabled: true,
            window: 1.0,
        });
    let version = cache
        .wrap(op("version"), options, move |_: ()| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, String>(seen.fetch_add(1, Ordering::SeqCst) + 1)
            }
        })
        .expect("wrap should succeed");

    assert_eq!(version.call(()).await, Ok(1));
    tokio::time::sleep(Duration::from_millis(850)).await;

    for _ in 0..40 {
        let value = version.call(()).await.expect("call should succeed");
        assert!(value == 1 || value == 2, "unexpected value {value}");
        if runs.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(version.call(()).await, Ok(2));
}
