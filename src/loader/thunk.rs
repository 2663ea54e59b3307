//! Single-assignment result handles.
//!
//! Registering a key hands the caller a [`Thunk`] and stores the matching
//! [`Resolver`] in the key's waiter list. The executor resolves every waiter
//! of a key with the same result. Dropping a thunk only abandons that one
//! wait; the resolver's send then fails quietly.

use tokio::sync::oneshot;

use super::LoadError;

/// Producer half: delivers exactly one result.
#[derive(Debug)]
pub(crate) struct Resolver<V> {
    tx: oneshot::Sender<Result<V, LoadError>>,
}

impl<V> Resolver<V> {
    /// Delivers `result`. Returns `false` if the waiter has gone away.
    pub(crate) fn resolve(self, result: Result<V, LoadError>) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Consumer half: a deferred result for one key.
#[derive(Debug)]
pub(crate) enum Thunk<V> {
    Ready(Result<V, LoadError>),
    Waiting(oneshot::Receiver<Result<V, LoadError>>),
}

impl<V> Thunk<V> {
    /// Creates a connected resolver/thunk pair.
    pub(crate) fn channel() -> (Resolver<V>, Self) {
        let (tx, rx) = oneshot::channel();
        (Resolver { tx }, Self::Waiting(rx))
    }

    /// A thunk that already holds its result (cache hit).
    pub(crate) fn ready(result: Result<V, LoadError>) -> Self {
        Self::Ready(result)
    }

    /// Waits for the result.
    ///
    /// If the resolver is dropped without sending (the loader went away
    /// mid-batch), the wait ends with [`LoadError::Dropped`].
    pub(crate) async fn wait(self) -> Result<V, LoadError> {
        match self {
            Self::Ready(result) => result,
            Self::Waiting(rx) => rx.await.unwrap_or(Err(LoadError::Dropped)),
        }
    }
}
