use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        LazyLock,
        Weak,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
    TryFutureExt,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use tokio::runtime::Builder;

use super::{
    JoinError,
    Runtime,
    SpawnHandle,
};

pub static TEST_EPOCH: LazyLock<SystemTime> =
    LazyLock::new(|| SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));

/// Owns a current-thread tokio runtime with a paused clock. Timers never
/// really sleep: when every task is idle tokio jumps to the next deadline, so
/// retry delays and backoffs run instantly and deterministically.
pub struct TestDriver {
    tokio_runtime: Option<tokio::runtime::Runtime>,
    state: Arc<Mutex<TestRuntimeState>>,
}

impl TestDriver {
    pub fn new() -> Self {
        Self::new_with_seed(0)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        let tokio_runtime = Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("Failed to create Tokio runtime");
        let creation_time = {
            let _handle = tokio_runtime.enter();
            tokio::time::Instant::now()
        };
        Self {
            tokio_runtime: Some(tokio_runtime),
            state: Arc::new(Mutex::new(TestRuntimeState {
                rng: ChaCha12Rng::seed_from_u64(seed),
                creation_time,
            })),
        }
    }

    pub fn rt(&self) -> TestRuntime {
        TestRuntime {
            tokio_handle: self
                .tokio_runtime
                .as_ref()
                .expect("tokio_runtime disappeared?")
                .handle()
                .clone(),
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn run_until<F: Future>(&self, f: F) -> F::Output {
        self.tokio_runtime
            .as_ref()
            .expect("tokio_runtime disappeared?")
            .block_on(f)
    }
}

impl Drop for TestDriver {
    fn drop(&mut self) {
        if let Some(rt) = self.tokio_runtime.take() {
            rt.shutdown_background();
        }
    }
}

struct TestRuntimeState {
    creation_time: tokio::time::Instant,
    rng: ChaCha12Rng,
}

#[derive(Clone)]
pub struct TestRuntime {
    tokio_handle: tokio::runtime::Handle,
    state: Weak<Mutex<TestRuntimeState>>,
}

impl TestRuntime {
    fn with_state<R>(&self, f: impl FnOnce(&mut TestRuntimeState) -> R) -> R {
        let state = self
            .state
            .upgrade()
            .expect("TestRuntime is used after `TestDriver` has been dropped");
        let mut state = state.lock();
        f(&mut state)
    }

    pub async fn advance_time(&self, duration: Duration) {
        tokio::time::advance(duration).await
    }
}

impl Runtime for TestRuntime {
    type Handle = TestFutureHandle;
    type Rng = ChaCha12Rng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle {
        TestFutureHandle {
            handle: self.tokio_handle.spawn(f),
        }
    }

    fn system_time(&self) -> SystemTime {
        let elapsed = tokio::time::Instant::now() - self.with_state(|state| state.creation_time);
        *TEST_EPOCH + elapsed
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        self.with_state(|state| f(&mut state.rng))
    }
}

pub struct TestFutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for TestFutureHandle {
    type Future = Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>;

    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self) -> Self::Future {
        self.handle.map_err(|e| e.into()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TestDriver;
    use crate::runtime::{
        shutdown_and_join,
        JoinError,
        Runtime,
        SpawnHandle,
    };

    #[test]
    fn test_paused_clock_advances_on_wait() {
        let td = TestDriver::new();
        let rt = td.rt();
        td.run_until(async {
            let before = rt.monotonic_now();
            rt.wait(Duration::from_secs(3600)).await;
            assert!(rt.monotonic_now() - before >= Duration::from_secs(3600));
        });
    }

    #[test]
    fn test_shutdown_and_join() -> anyhow::Result<()> {
        let td = TestDriver::new();
        let rt = td.rt();
        td.run_until(async {
            let handle = rt.spawn("forever", futures::future::pending());
            shutdown_and_join(handle).await?;

            let handle = rt.spawn("panics", async { panic!("boom") });
            let Err(JoinError::Panicked(e)) = handle.into_join_future().await else {
                panic!("Expected JoinError::Panicked");
            };
            assert!(e.to_string().contains("boom"));
            Ok(())
        })
    }
}
