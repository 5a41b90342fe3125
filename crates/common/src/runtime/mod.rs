//! Runtime trait for abstracting away OS-esque features and allow different
//! implementations for test and prod.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::future::FusedFuture;
use rand::Rng;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            return JoinError::Canceled;
        }
        let payload = e.into_panic();
        let message = match payload.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(payload) => match payload.downcast::<String>() {
                Ok(msg) => *msg,
                Err(_) => "panic with a non-string payload".to_owned(),
            },
        };
        JoinError::Panicked(anyhow::anyhow!(message))
    }
}

pub trait SpawnHandle: Send + Sync {
    type Future: Future<Output = Result<(), JoinError>> + Send;
    fn shutdown(&mut self);
    fn into_join_future(self) -> Self::Future;
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: impl SpawnHandle) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.into_join_future().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// A Runtime can be considered somewhat like an operating system abstraction
/// for our codebase. Time, randomness and task spawning behave differently
/// between test and prod: in test `wait` advances a paused clock instead of
/// sleeping. Maintenance code is parameterized by a runtime so the same loops
/// run deterministically under test.
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Spawn handle type returned by `spawn`.
    type Handle: SpawnHandle;

    /// Source of randomness associated with the runtime.
    type Rng: Rng;

    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle;

    /// Return (a potentially-virtualized) system time.
    fn system_time(&self) -> SystemTime;

    /// Return (a potentially-virtualized) reading from a monotonic clock.
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// Use the runtime's source of randomness.
    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R;
}
