//! Production implementation of the Runtime trait.

use std::{
    future::Future,
    pin::Pin,
    time::SystemTime,
};

use common::{
    knobs::{
        RUNTIME_STACK_SIZE,
        RUNTIME_WORKER_THREADS,
    },
    runtime::{
        JoinError,
        Runtime,
        SpawnHandle,
    },
};
use futures::{
    future::FusedFuture,
    FutureExt,
    TryFutureExt,
};
use metrics::{
    log_counter_with_labels,
    register_node_counter,
    MetricLabel,
};
use rand::rngs::ThreadRng;
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::{
        sleep,
        Duration,
    },
};

register_node_counter!(
    RUNTIME_SPAWNED_TASKS_TOTAL,
    "Number of futures spawned on the production runtime",
    &["name"]
);

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    type Future = Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>;

    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self) -> Self::Future {
        self.handle.map_err(|e| e.into()).boxed()
    }
}

/// Runtime for running in production that sleeps for wallclock time, uses the
/// thread rng and spawns onto a multi-threaded tokio runtime.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        anyhow::ensure!(
            TokioRuntimeHandle::try_current().is_err(),
            "Tried to create a `ProdRuntime` from within a Tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`?"
        );
        let mut tokio_builder = Builder::new_multi_thread();
        tokio_builder.thread_stack_size(*RUNTIME_STACK_SIZE);
        if *RUNTIME_WORKER_THREADS > 0 {
            tokio_builder.worker_threads(*RUNTIME_WORKER_THREADS);
        }
        let tokio_rt = tokio_builder.enable_all().build()?;
        Ok(tokio_rt)
    }

    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, name: &'static str, f: F) -> F::Output {
        tracing::debug!("Blocking on {name}");
        self.rt.block_on(f)
    }
}

impl Runtime for ProdRuntime {
    type Handle = FutureHandle;
    type Rng = ThreadRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> FutureHandle {
        log_counter_with_labels(
            &RUNTIME_SPAWNED_TASKS_TOTAL,
            1,
            vec![MetricLabel::new_const("name", name)],
        );
        FutureHandle {
            handle: self.rt.spawn(f),
        }
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        let mut rng = rand::rng();
        f(&mut rng)
    }
}
