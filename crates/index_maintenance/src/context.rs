use std::{
    future::Future,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use common::{
    catalog::MetadataCatalog,
    kv_store::StorageEnvironment,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    shutdown::ShutdownSignal,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::MaintenanceConfig,
    registry::HandleRegistry,
    routing::RoutingTable,
};

/// Everything the background loops of one node share.
pub(crate) struct MaintenanceContext<RT: Runtime> {
    pub rt: RT,
    pub env: Arc<dyn StorageEnvironment>,
    pub catalog: Arc<dyn MetadataCatalog>,
    pub config: MaintenanceConfig,
    pub routing: RoutingTable,
    pub registry: HandleRegistry,
    pub shutdown: ShutdownSignal,
    /// Cancelled once the manager shuts down. Every background loop listens
    /// on a child of this token.
    pub cancel: CancellationToken,
    /// The running reconciler. Restarted whenever the catalog or the
    /// replication role changes.
    pub reconciler: tokio::sync::Mutex<Option<BackgroundWorker<RT>>>,
    next_task_id: AtomicU64,
}

impl<RT: Runtime> MaintenanceContext<RT> {
    pub fn new(
        rt: RT,
        env: Arc<dyn StorageEnvironment>,
        catalog: Arc<dyn MetadataCatalog>,
        config: MaintenanceConfig,
        routing: RoutingTable,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            rt,
            env,
            catalog,
            config,
            routing,
            registry: HandleRegistry::default(),
            shutdown,
            cancel: CancellationToken::new(),
            reconciler: tokio::sync::Mutex::new(None),
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A spawned loop that stops cooperatively: it watches its token and returns
/// at the next point where no transaction is open.
pub(crate) struct BackgroundWorker<RT: Runtime> {
    name: &'static str,
    cancel: CancellationToken,
    handle: RT::Handle,
}

impl<RT: Runtime> BackgroundWorker<RT> {
    pub fn spawn(
        rt: &RT,
        name: &'static str,
        cancel: CancellationToken,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        Self {
            name,
            cancel,
            handle: rt.spawn(name, f),
        }
    }

    pub async fn stop_and_join(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.into_join_future().await {
            tracing::error!("{} did not stop cleanly: {e}", self.name);
        }
    }
}
