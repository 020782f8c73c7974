//! Ordered shutdown: drain sessions, cancel background tasks, wait for them.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gateway::SessionGateway;

/// What a graceful shutdown achieved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions closed with 1001.
    pub closed_sessions: usize,
    /// Background tasks that finished on their own.
    pub finished_tasks: usize,
    /// Background tasks aborted after the timeout, by name.
    pub aborted_tasks: Vec<&'static str>,
}

impl ShutdownReport {
    /// Whether every tracked task stopped before the timeout.
    pub fn is_clean(&self) -> bool {
        self.aborted_tasks.is_empty()
    }
}

/// Owns the server-wide cancellation token and the background tasks that
/// observe it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled once shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Track a background task so shutdown waits for it.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    /// Number of tracked tasks not yet collected by a shutdown.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Close every session, cancel the token, then wait up to `timeout` for
    /// tracked tasks. Tasks still running after that are aborted.
    ///
    /// Calling it again only collects tasks tracked since the last call.
    pub async fn graceful_shutdown(
        &self,
        gateway: &SessionGateway,
        timeout: Duration,
    ) -> ShutdownReport {
        let closed_sessions = gateway.shutdown();
        self.token.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            closed_sessions,
            task_count = tasks.len(),
            timeout_ms = timeout.as_millis() as u64,
            "shutting down"
        );

        let drain = futures::future::join_all(tasks.iter_mut().map(|(_, handle)| handle));
        let _ = tokio::time::timeout(timeout, drain).await;

        let mut finished_tasks = 0;
        let mut aborted_tasks = Vec::new();
        for (name, handle) in &tasks {
            if handle.is_finished() {
                finished_tasks += 1;
            } else {
                handle.abort();
                aborted_tasks.push(*name);
            }
        }
        if !aborted_tasks.is_empty() {
            warn!(?aborted_tasks, "shutdown timed out, aborted remaining tasks");
        }

        ShutdownReport {
            closed_sessions,
            finished_tasks,
            aborted_tasks,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
