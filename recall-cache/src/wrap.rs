//! Wrapping operations.
//!
//! [`Cache::wrap`] resolves an operation's configuration and tiers once and
//! returns a [`Cached`] handle that runs every call through the cache.
//!
//! ```ignore
//! let square = cache.wrap(operation_id!("square"), CallOptions::new(), |x: i64| async move {
//!     Ok::<_, String>(x * x)
//! })?;
//! assert_eq!(square.call(4).await, Ok(16));
//! ```

use crate::cache::Cache;
use futures_util::future::{BoxFuture, FutureExt};
use recall_core::{
    generate_key, ArgValue, Args, CacheConfig, CacheEvent, CacheKey, CallOptions, EventKind, OperationId,
    RecallResult,
};
use recall_storage::{TierReport, TieredRouter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

// ============================================================================
// CALL ARGUMENTS
// ============================================================================

/// Input of a wrapped operation, as seen by key derivation.
pub trait CallArgs {
    fn to_args(&self) -> Args;
}

impl CallArgs for Args {
    fn to_args(&self) -> Args {
        self.clone()
    }
}

impl CallArgs for () {
    fn to_args(&self) -> Args {
        Args::new()
    }
}

macro_rules! impl_call_args_scalar {
    ($($ty:ty),*) => {
        $(impl CallArgs for $ty {
            fn to_args(&self) -> Args {
                Args::new().arg(self.clone())
            }
        })*
    };
}

impl_call_args_scalar!(bool, i8, i16, i32, i64, u8, u16, u32, u64, isize, usize, f32, f64, String, &'static str);

macro_rules! impl_call_args_tuple {
    ($($name:ident),+) => {
        impl<$($name),+> CallArgs for ($($name,)+)
        where
            $($name: Clone + Into<ArgValue>),+
        {
            #[allow(non_snake_case)]
            fn to_args(&self) -> Args {
                let ($($name,)+) = self;
                Args::new()$(.arg($name.clone()))+
            }
        }
    };
}

impl_call_args_tuple!(A);
impl_call_args_tuple!(A, B);
impl_call_args_tuple!(A, B, C);
impl_call_args_tuple!(A, B, C, D);
impl_call_args_tuple!(A, B, C, D, E);

// ============================================================================
// CACHED OPERATION
// ============================================================================

/// An operation bound to a cache with its resolved configuration.
pub struct Cached<I, T, E, F> {
    cache: Cache,
    operation: OperationId,
    config: Arc<CacheConfig>,
    router: Arc<TieredRouter>,
    func: Arc<F>,
    _marker: PhantomData<fn(I) -> Result<T, E>>,
}

impl<I, T, E, F> Clone for Cached<I, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            operation: self.operation.clone(),
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            func: Arc::clone(&self.func),
            _marker: PhantomData,
        }
    }
}

impl<I, T, E, F> std::fmt::Debug for Cached<I, T, E, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cached")
            .field("operation", &self.operation)
            .field("config", &self.config)
            .finish()
    }
}

impl<I, T, E, F, Fut> Cached<I, T, E, F>
where
    I: CallArgs + Send + 'static,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    E: Display + Clone + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    pub async fn call(&self, input: I) -> Result<T, E> {
        let args = input.to_args();
        let func = Arc::clone(&self.func);
        self.cache
            .run_routed(
                &self.operation,
                &args,
                Arc::clone(&self.config),
                Arc::clone(&self.router),
                move || (*func)(input),
            )
            .await
    }
}

impl<I, T, E, F> Cached<I, T, E, F>
where
    I: CallArgs,
{
    pub fn operation(&self) -> &OperationId {
        &self.operation
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key a call with `input` would use.
    pub fn key_for(&self, input: &I) -> RecallResult<CacheKey> {
        Ok(generate_key(&self.operation, &input.to_args(), self.config.key_policy())?)
    }

    /// Delete the entry for `input` from every tier of this operation.
    pub async fn invalidate(&self, input: &I) -> RecallResult<TierReport> {
        let key = self.key_for(input)?;
        let function = self.operation.to_string();
        let report = self.router.delete(&function, &key).await;
        self.cache.inner.tags.forget(&key);
        self.cache
            .events()
            .publish(CacheEvent::new(EventKind::CacheDelete, function).with_key(&key));
        Ok(report)
    }

    /// Clear every tier this operation uses.
    ///
    /// Tiers are cleared whole, so other operations sharing them lose their
    /// entries too.
    pub async fn clear(&self) -> TierReport {
        let function = self.operation.to_string();
        let report = self.router.clear(&function).await;
        self.cache.inner.tags.forget_tiers(self.config.tiers());
        for backend in self.config.tiers() {
            self.cache
                .events()
                .publish(CacheEvent::new(EventKind::CacheClear, &function).with_backend(backend.clone()));
        }
        report
    }
}

/// Async adapter around a blocking operation.
pub type BlockingFn<I, T, E> = Box<dyn Fn(I) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

impl Cache {
    /// Bind an async operation to this cache.
    ///
    /// Fails when a backend named by `options` is not registered.
    pub fn wrap<I, T, E, F, Fut>(&self, operation: OperationId, options: CallOptions, func: F) -> RecallResult<Cached<I, T, E, F>>
    where
        I: CallArgs,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let config = self.resolve(&operation, &options)?;
        let router = self.router_for(&config)?;
        tracing::debug!(
            function = %operation,
            tiers = ?config.tiers(),
            ttl = ?config.ttl(),
            "Wrapped operation"
        );
        Ok(Cached {
            cache: self.clone(),
            operation,
            config: Arc::new(config),
            router: Arc::new(router),
            func: Arc::new(func),
            _marker: PhantomData,
        })
    }

    /// Bind a blocking operation. Each execution runs on the blocking pool.
    pub fn wrap_blocking<I, T, E, G>(
        &self,
        operation: OperationId,
        options: CallOptions,
        func: G,
    ) -> RecallResult<Cached<I, T, E, BlockingFn<I, T, E>>>
    where
        I: CallArgs + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        G: Fn(I) -> Result<T, E> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        let adapter: BlockingFn<I, T, E> = Box::new(move |input: I| {
            let func = Arc::clone(&func);
            async move {
                settle_blocking(tokio::task::spawn_blocking(move || (*func)(input)).await)
            }
            .boxed()
        });
        self.wrap(operation, options, adapter)
    }
}

/// Unwrap a blocking-pool join, re-raising the operation's own panic.
///
/// A blocking task is only cancelled when its runtime shuts down before the
/// task starts. The operation never ran and `E` has no value to report that
/// with, so the caller panics with a message naming the cause.
fn settle_blocking<R>(joined: Result<R, tokio::task::JoinError>) -> R {
    match joined {
        Ok(outcome) => outcome,
        Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
        Err(join) => {
            tracing::error!(error = %join, "Blocking operation cancelled before it ran");
            panic!("blocking operation cancelled by runtime shutdown: {join}");
        }
    }
}
