//! Batch executor — runs one flushed batch through the fetch function.
//!
//! The fetch function runs on its own Tokio task, outside the dispatcher
//! lock, raced against the loader's cancellation token and the optional
//! fetch deadline. Whatever happens, the executor produces exactly one
//! result per key so every waiter gets resolved.
//!
//! Cancellation is cooperative first: the fetch sees its [`FetchContext`]
//! cancelled and has [`CANCEL_GRACE`] to wind down before its task is
//! aborted. An expired deadline aborts the task right away.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use super::LoadError;
use crate::fetch::{BatchFn, FetchContext, FetchError};

/// How long a cancelled fetch may keep running before its task is aborted.
pub(crate) const CANCEL_GRACE: Duration = Duration::from_millis(50);

/// Invokes `fetch` on `keys` and returns one result per key, in key order.
///
/// - A whole-batch `Err`, a panic inside the fetch function, cancellation
///   or an expired deadline fail every key with the same error.
/// - A short result vector fails each unaccounted key with
///   [`LoadError::MissingResult`]; surplus results are discarded.
pub(crate) async fn execute<K, V, F>(
    fetch: Arc<F>,
    ctx: FetchContext,
    keys: Vec<K>,
) -> Vec<Result<V, LoadError>>
where
    K: Send + 'static,
    V: Send + 'static,
    F: BatchFn<K, V>,
{
    let expected = keys.len();
    let generation = ctx.generation();
    let cancel = ctx.cancellation().clone();
    let deadline = ctx.deadline();

    let mut task = tokio::spawn(async move { F::load(&fetch, ctx, keys).await });

    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            // Whatever the fetch returns now is discarded.
            if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
                warn!(generation, "fetch ignored cancellation, aborting it");
                task.abort();
            }
            Err(LoadError::Cancelled)
        }
        _ = expired => {
            task.abort();
            Err(LoadError::FetchTimeout)
        }
        joined = &mut task => match joined {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(err)) => Err(LoadError::Batch(err)),
            Err(join) => Err(LoadError::Batch(FetchError::msg(format!(
                "batch function panicked: {join}"
            )))),
        },
    };

    match outcome {
        Ok(values) => align(values, expected, generation),
        Err(err) => {
            error!(generation, keys = expected, error = %err, "batch failed");
            (0..expected).map(|_| Err(err.clone())).collect()
        }
    }
}

// Maps per-key fetch results onto the requested keys, padding short output.
fn align<V>(
    values: Vec<Result<V, FetchError>>,
    expected: usize,
    generation: u64,
) -> Vec<Result<V, LoadError>> {
    let returned = values.len();
    if returned < expected {
        warn!(generation, returned, expected, "batch function returned too few results");
    } else if returned > expected {
        warn!(generation, returned, expected, "batch function returned extra results");
    }

    let mut results: Vec<Result<V, LoadError>> = values
        .into_iter()
        .take(expected)
        .map(|r| r.map_err(LoadError::Fetch))
        .collect();
    results.extend((returned..expected).map(|position| {
        Err(LoadError::MissingResult {
            position,
            returned,
            expected,
        })
    }));
    results
}
