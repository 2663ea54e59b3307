//! # dataloader
//!
//! A batching and caching data access engine for async Rust.
//!
//! A [`Loader`] coalesces many "fetch by key" calls made within a short
//! window into one call of a user-supplied batch function, and memoizes the
//! results so the same key is never fetched twice. It is the usual cure for
//! N+1 query storms in resolvers and request handlers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dataloader::{FetchContext, FetchError, Loader};
//!
//! #[tokio::main]
//! async fn main() {
//!     let users = Loader::new(|_ctx: FetchContext, ids: Vec<u64>| async move {
//!         // One query for the whole batch: SELECT … WHERE id IN (…)
//!         let rows: Vec<Result<String, FetchError>> =
//!             ids.iter().map(|id| Ok(format!("user-{id}"))).collect();
//!         Ok::<_, FetchError>(rows)
//!     });
//!
//!     let results = users.load_many([1, 2, 3]).await;
//!     assert_eq!(results.len(), 3);
//!     println!("{:?}", users.stats());
//! }
//! ```

pub mod cache;
pub mod config;
pub mod fetch;
pub mod loader;
pub mod stats;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, LoaderConfig};
pub use fetch::{BatchFn, BatchResult, FetchContext, FetchError};
pub use loader::{LoadError, Loader};
pub use stats::{StatsCollector, StatsSnapshot};
