use super::types::{ComponentState, ShutdownReason};
use super::RollcamOrchestrator;
use crate::error::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Hard ceiling on the whole worker-stop phase; survivors are force-killed
/// by each worker's own SIGKILL escalation
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

impl RollcamOrchestrator {
    /// Ordered graceful shutdown: triggers first, then capture workers
    /// under a bounded deadline, then the supervisor and monitors. The
    /// buffer index and its files are left intact so a successor process
    /// can reclaim them.
    pub(super) async fn shutdown(&mut self, reason: &ShutdownReason) -> Result<i32> {
        info!("Beginning graceful shutdown");

        // (i) stop accepting new trigger requests
        self.set_component_state("trigger", ComponentState::Stopping)
            .await;
        if let Some(keyboard) = &self.keyboard {
            keyboard.stop();
        }
        self.trigger_cancel.cancel();
        self.set_component_state("trigger", ComponentState::Stopped)
            .await;

        // (ii) graceful stop for every worker, in parallel
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            handles.push((
                worker.camera_id().to_string(),
                tokio::spawn(async move { worker.stop().await }),
            ));
        }

        // (iii) wait up to the total deadline, (iv) survivors were already
        // escalated to SIGKILL inside worker.stop()
        let started = Instant::now();
        for (camera_id, handle) in handles {
            self.set_component_state(&camera_id, ComponentState::Stopping)
                .await;
            let remaining = SHUTDOWN_DEADLINE
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(100));
            match timeout(remaining, handle).await {
                Ok(Ok(Ok(()))) => {
                    self.set_component_state(&camera_id, ComponentState::Stopped)
                        .await;
                    info!("Worker {} stopped", camera_id);
                }
                Ok(Ok(Err(e))) => {
                    self.set_component_state(&camera_id, ComponentState::Failed)
                        .await;
                    error!("Error stopping worker {}: {}", camera_id, e);
                }
                Ok(Err(e)) => {
                    self.set_component_state(&camera_id, ComponentState::Failed)
                        .await;
                    error!("Worker {} stop task panicked: {}", camera_id, e);
                }
                Err(_) => {
                    self.set_component_state(&camera_id, ComponentState::Failed)
                        .await;
                    warn!("Worker {} did not stop within the deadline", camera_id);
                }
            }
        }

        // Stop the supervisor and the directory monitors
        self.cancel.cancel();
        self.set_component_state("supervisor", ComponentState::Stopped)
            .await;

        // (v) buffer files intentionally left on disk for a successor

        let exit_code = if self.supervisor.gave_up() {
            2
        } else {
            reason.exit_code()
        };
        info!("Graceful shutdown completed with exit code {}", exit_code);
        Ok(exit_code)
    }
}
