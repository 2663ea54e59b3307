//! The batch-fetch contract — the one integration point between a [`Loader`]
//! and the data source behind it.
//!
//! A domain loader ("users by id", "documents by slug", …) supplies a
//! [`BatchFn`]. The loader calls it with an ordered list of unique keys and
//! expects back one result per key, position-aligned with the input.
//!
//! Any async closure of the shape `Fn(FetchContext, Vec<K>) -> Future` is a
//! [`BatchFn`] through the blanket impl below, so most callers never name the
//! trait:
//!
//! ```rust,no_run
//! use dataloader::{FetchContext, FetchError, Loader};
//!
//! # async fn demo() {
//! let loader = Loader::new(|_ctx: FetchContext, ids: Vec<u64>| async move {
//!     let names: Vec<Result<String, FetchError>> =
//!         ids.into_iter().map(|id| Ok(format!("user-{id}"))).collect();
//!     Ok::<_, FetchError>(names)
//! });
//! let name = loader.load(7).await;
//! # }
//! ```
//!
//! [`Loader`]: crate::loader::Loader

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one batch invocation.
///
/// The outer `Err` fails the whole batch; the inner vector carries one
/// result per requested key, in request order.
pub type BatchResult<V> = Result<Vec<Result<V, FetchError>>, FetchError>;

/// An error reported by a batch-fetch function, either for a single key or
/// for the whole batch.
///
/// Cloning is cheap: source errors are reference-counted so the same error
/// can be handed to every caller waiting on a key.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The backing store has no record for the key.
    #[error("not found")]
    NotFound,

    /// A free-form failure description.
    #[error("{0}")]
    Message(String),

    /// A failure carrying the underlying error from the backing store.
    #[error("{0}")]
    Source(Arc<dyn StdError + Send + Sync + 'static>),
}

impl FetchError {
    /// Wraps any error from the backing store.
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Source(Arc::new(err))
    }

    /// Builds an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Returns `true` for [`FetchError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Execution context handed to every batch-fetch invocation.
///
/// The context is cancelled when the owning loader is dropped. The fetch
/// then has 50 ms to return before its task is aborted; whatever it returns
/// is discarded and its callers see `LoadError::Cancelled`. When the loader
/// is configured with a fetch timeout, [`deadline`](Self::deadline) tells the
/// fetch function when the loader will abort it.
#[derive(Debug, Clone)]
pub struct FetchContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    generation: u64,
}

impl FetchContext {
    pub(crate) fn new(
        cancel: CancellationToken,
        deadline: Option<Instant>,
        generation: u64,
    ) -> Self {
        Self {
            cancel,
            deadline,
            generation,
        }
    }

    /// A detached context, useful when calling a fetch function directly.
    pub fn background() -> Self {
        Self::new(CancellationToken::new(), None, 0)
    }

    /// The token that fires when the loader gives up on this batch.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` once the batch has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the batch is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Instant at which the loader aborts the fetch, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Generation number of the batch being fetched.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A batch-fetch function: loads many keys in one round trip.
///
/// # Contract
///
/// - The returned vector **must** have the same length as `keys` and be
///   position-aligned with it. A short vector is tolerated: the loader fails
///   every unaccounted key with [`LoadError::MissingResult`] instead of
///   leaving its callers waiting.
/// - Returning `Err` fails every key in the batch.
/// - The function is invoked outside the loader's lock and may perform
///   arbitrary I/O. It should stop early once `ctx` is cancelled; a fetch
///   still running shortly after cancellation is aborted.
///
/// [`LoadError::MissingResult`]: crate::loader::LoadError::MissingResult
pub trait BatchFn<K, V>: Send + Sync + 'static {
    /// Loads `keys`, returning one result per key in the same order.
    fn load(&self, ctx: FetchContext, keys: Vec<K>) -> impl Future<Output = BatchResult<V>> + Send;
}

impl<K, V, T, F> BatchFn<K, V> for T
where
    T: Fn(FetchContext, Vec<K>) -> F + Send + Sync + 'static,
    F: Future<Output = BatchResult<V>> + Send + 'static,
{
    fn load(&self, ctx: FetchContext, keys: Vec<K>) -> impl Future<Output = BatchResult<V>> + Send {
        (self)(ctx, keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl BatchFn<u32, u32> for Doubler {
        async fn load(&self, _ctx: FetchContext, keys: Vec<u32>) -> BatchResult<u32> {
            Ok(keys.into_iter().map(|k| Ok(k * 2)).collect())
        }
    }

    #[tokio::test]
    async fn closure_is_batch_fn() {
        let f = |_ctx: FetchContext, keys: Vec<u32>| async move {
            let values: Vec<Result<u32, FetchError>> =
                keys.into_iter().map(|k| Ok(k + 1)).collect();
            Ok::<_, FetchError>(values)
        };
        let out = f.load(FetchContext::background(), vec![1, 2]).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), &2);
        assert_eq!(out[1].as_ref().unwrap(), &3);
    }

    #[tokio::test]
    async fn struct_is_batch_fn() {
        let out = Doubler
            .load(FetchContext::background(), vec![5])
            .await
            .unwrap();
        assert_eq!(out[0].as_ref().unwrap(), &10);
    }

    #[test]
    fn fetch_error_display() {
        assert_eq!(FetchError::NotFound.to_string(), "not found");
        assert_eq!(FetchError::msg("db down").to_string(), "db down");
        let io = std::io::Error::other("socket closed");
        assert_eq!(FetchError::new(io).to_string(), "socket closed");
        assert!(FetchError::NotFound.is_not_found());
    }

    #[test]
    fn background_context_is_live() {
        let ctx = FetchContext::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.deadline().is_none());
        ctx.cancellation().cancel();
        assert!(ctx.is_cancelled());
    }
}
