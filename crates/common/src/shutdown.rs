use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::report_error_sync;

/// The node-level fault handler. Background loops signal it with errors they
/// cannot recover from; the process owner decides whether to restart.
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown_tx: Option<Arc<Mutex<Option<mpsc::UnboundedSender<ShutdownMessage>>>>>,
    node_name: String,
}

#[derive(Debug)]
pub struct ShutdownMessage {
    pub error: anyhow::Error,
    pub node_name: String,
}

impl ShutdownSignal {
    pub fn new(shutdown_tx: mpsc::UnboundedSender<ShutdownMessage>, node_name: String) -> Self {
        Self {
            shutdown_tx: Some(Arc::new(Mutex::new(Some(shutdown_tx)))),
            node_name,
        }
    }

    pub fn signal(&self, mut fatal_error: anyhow::Error) {
        report_error_sync(&mut fatal_error);
        if let Some(ref shutdown_tx_mutex) = self.shutdown_tx {
            let Some(shutdown_tx) = shutdown_tx_mutex.lock().take() else {
                // Already signaled once for this node.
                return;
            };
            _ = shutdown_tx.send(ShutdownMessage {
                error: fatal_error,
                node_name: self.node_name.clone(),
            });
        } else {
            panic!("Shutting down due to fatal error: {fatal_error:#}");
        }
    }

    /// A ShutdownSignal that panics when signaled.
    pub fn panic() -> Self {
        Self {
            shutdown_tx: None,
            node_name: "".to_owned(),
        }
    }
}
