use super::types::ShutdownReason;
use super::RollcamOrchestrator;
use crate::error::{Result, RollcamError};
use crate::events::RollcamEvent;
use crate::trigger::{ClipRequest, ClipTarget};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

impl RollcamOrchestrator {
    /// Main loop: dispatch clip requests and wait for a shutdown cause
    /// (signal, keyboard quit, or supervisor give-up)
    pub async fn run(&mut self) -> Result<i32> {
        self.spawn_signal_handlers();

        let mut requests = self
            .requests
            .take()
            .ok_or_else(|| RollcamError::system("clip request channel already taken"))?;
        let mut events = self.events.subscribe();

        let reason = loop {
            tokio::select! {
                request = requests.recv() => {
                    match request {
                        Some(request) => self.dispatch_clip_request(request),
                        None => warn!("Clip request channel closed"),
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(RollcamEvent::ShutdownRequested { reason, .. }) => {
                            break classify_shutdown(&reason, self.supervisor.gave_up());
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Event loop lagged; skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            break ShutdownReason::Error("event bus closed".to_string());
                        }
                    }
                }
            }
        };

        info!("Shutdown initiated: {:?}", reason);
        self.shutdown(&reason).await
    }

    /// Keyboard requests fan out here; HTTP requests are answered inline by
    /// the trigger server
    fn dispatch_clip_request(&self, request: ClipRequest) {
        let assembler = Arc::clone(&self.assembler);
        tokio::spawn(async move {
            match request.target {
                ClipTarget::All => {
                    let results = assembler
                        .assemble_all(request.duration_s, request.request_time)
                        .await;
                    let saved = results.iter().filter(|r| r.result.is_ok()).count();
                    info!("Trigger processed: {}/{} clips saved", saved, results.len());
                }
                ClipTarget::Camera(camera_id) => {
                    // Success and failure are published on the event bus
                    let _ = assembler
                        .assemble(&camera_id, request.duration_s, request.request_time, None)
                        .await;
                }
            }
        });
    }

    fn spawn_signal_handlers(&self) {
        #[cfg(unix)]
        {
            let events = self.events.clone();
            tokio::spawn(async move {
                let Ok(mut sigterm) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                else {
                    warn!("Failed to register SIGTERM handler");
                    return;
                };
                if sigterm.recv().await.is_some() {
                    let _ = events.publish(RollcamEvent::ShutdownRequested {
                        timestamp: Utc::now(),
                        reason: "SIGTERM".to_string(),
                    });
                }
            });
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = events.publish(RollcamEvent::ShutdownRequested {
                    timestamp: Utc::now(),
                    reason: "SIGINT".to_string(),
                });
            }
        });
    }
}

fn classify_shutdown(reason: &str, gave_up: bool) -> ShutdownReason {
    if gave_up {
        ShutdownReason::SupervisorGaveUp
    } else if reason.starts_with("SIG") {
        ShutdownReason::Signal(reason.to_string())
    } else {
        ShutdownReason::UserRequest(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_classification() {
        assert!(matches!(
            classify_shutdown("SIGTERM", false),
            ShutdownReason::Signal(_)
        ));
        assert!(matches!(
            classify_shutdown("SIGINT", false),
            ShutdownReason::Signal(_)
        ));
        assert!(matches!(
            classify_shutdown("user requested via keyboard", false),
            ShutdownReason::UserRequest(_)
        ));
        assert!(matches!(
            classify_shutdown("all cameras permanently failed", true),
            ShutdownReason::SupervisorGaveUp
        ));
    }

    #[test]
    fn test_give_up_wins_over_signal() {
        // A signal arriving after the supervisor gave up keeps exit code 2
        let reason = classify_shutdown("SIGTERM", true);
        assert_eq!(reason.exit_code(), 2);
    }
}
