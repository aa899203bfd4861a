use super::types::ComponentState;
use super::RollcamOrchestrator;
use crate::error::Result;
use std::time::Duration;
use tracing::{error, info, warn};

/// Gap between successive worker launches, to avoid a synchronized restart
/// storm after power-on
const WORKER_LAUNCH_STAGGER: Duration = Duration::from_millis(500);

impl RollcamOrchestrator {
    /// Register cameras and reclaim segments a previous process left in the
    /// memory-backed store
    pub async fn initialize(&self) -> Result<()> {
        info!(
            "Initializing rollcam: {} cameras, {}s window at {}",
            self.config.cameras.len(),
            self.config.buffer_seconds,
            self.config.temp_dir.display()
        );

        for camera in &self.config.cameras {
            self.index.register_camera(&camera.camera_id).await;
            self.store.ensure_camera_dir(&camera.camera_id).await?;
            self.set_component_state(&camera.camera_id, ComponentState::Stopped)
                .await;

            // Recovery: a predecessor may have left usable segments behind
            let listed = self.store.list(&camera.camera_id).await?;
            if !listed.is_empty() {
                self.index
                    .seed(&camera.camera_id, listed, self.config.chunk())
                    .await?;
            }
        }

        self.set_component_state("supervisor", ComponentState::Stopped)
            .await;
        self.set_component_state("trigger", ComponentState::Stopped)
            .await;

        info!("Initialization complete");
        Ok(())
    }

    /// Start the supervisor, the capture workers (staggered), and the
    /// configured trigger front-ends
    pub async fn start(&self) -> Result<()> {
        // Supervisor first, so even a failed first launch gets retried
        self.set_component_state("supervisor", ComponentState::Starting)
            .await;
        tokio::spawn(std::sync::Arc::clone(&self.supervisor).run());
        self.set_component_state("supervisor", ComponentState::Running)
            .await;

        for (i, worker) in self.workers.iter().enumerate() {
            let worker = std::sync::Arc::clone(worker);
            let delay = WORKER_LAUNCH_STAGGER * i as u32;
            let camera_id = worker.camera_id().to_string();
            self.set_component_state(&camera_id, ComponentState::Starting)
                .await;
            tokio::spawn(async move {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                if let Err(e) = worker.start().await {
                    // The supervisor picks it up from the Failed state
                    warn!("Initial launch failed for {}: {}", camera_id, e);
                }
            });
        }
        for worker in &self.workers {
            self.set_component_state(worker.camera_id(), ComponentState::Running)
                .await;
        }

        self.set_component_state("trigger", ComponentState::Starting)
            .await;

        if let Some(keyboard) = &self.keyboard {
            keyboard.start()?;
        }

        if let Some(http) = &self.http {
            let http = std::sync::Arc::clone(http);
            tokio::spawn(async move {
                if let Err(e) = http.serve().await {
                    error!("Trigger HTTP server failed: {}", e);
                }
            });
        }

        self.set_component_state("trigger", ComponentState::Running)
            .await;

        info!(
            "Rollcam started: trigger mode {}, clips to {}",
            self.config.trigger_mode.as_str(),
            self.config.clips_dir.display()
        );
        Ok(())
    }
}
