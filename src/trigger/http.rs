use crate::buffer::{BufferIndex, CameraBufferStatus};
use crate::capture::{WorkerShared, WorkerState};
use crate::clip::ClipAssembler;
use crate::error::{ClipError, Result, RollcamError, TriggerError};
use crate::supervisor::ResilienceSupervisor;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ClipTarget;

/// Shared state for the trigger HTTP surface
#[derive(Clone)]
pub struct TriggerState {
    pub assembler: Arc<ClipAssembler>,
    pub index: Arc<BufferIndex>,
    pub workers: Arc<Vec<Arc<WorkerShared>>>,
    pub supervisor: Arc<ResilienceSupervisor>,
    pub chunk_seconds: u32,
}

/// Optional JSON body for `POST /save-clip`
#[derive(Debug, Deserialize, Default)]
pub struct SaveClipBody {
    pub camera_id: Option<String>,
    pub duration: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SaveClipResponse {
    pub success: bool,
    pub message: String,
    pub trigger_time: String,
    pub camera_id: String,
}

/// HTTP trigger front-end serving clip requests, status, and health
pub struct HttpTrigger {
    port: u16,
    state: TriggerState,
    cancel: CancellationToken,
}

impl HttpTrigger {
    pub fn new(port: u16, state: TriggerState, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    pub fn router(state: TriggerState) -> Router {
        Router::new()
            .route("/save-clip", post(save_clip_handler))
            .route("/status", get(status_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }

    /// Bind and serve until cancelled
    pub async fn serve(&self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            RollcamError::Trigger(TriggerError::BindFailed {
                address: addr.clone(),
                source: e,
            })
        })?;

        info!("Trigger HTTP server listening on {}", addr);

        let cancel = self.cancel.clone();
        axum::serve(listener, Self::router(self.state.clone()))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| {
                RollcamError::Trigger(TriggerError::ServerFailed {
                    details: e.to_string(),
                })
            })?;

        info!("Trigger HTTP server stopped");
        Ok(())
    }
}

async fn save_clip_handler(
    State(state): State<TriggerState>,
    body: Option<Json<SaveClipBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let trigger_time = Utc::now();
    let target = ClipTarget::parse(body.camera_id.as_deref());
    let camera_label = match &target {
        ClipTarget::All => "all".to_string(),
        ClipTarget::Camera(id) => id.clone(),
    };

    info!(
        "HTTP clip trigger for {} at {} (duration {:?})",
        camera_label, trigger_time, body.duration
    );

    if body.duration == Some(0) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SaveClipResponse {
                success: false,
                message: "duration must be greater than zero".to_string(),
                trigger_time: trigger_time.to_rfc3339(),
                camera_id: camera_label,
            }),
        );
    }

    let (status, success, message) = match target {
        ClipTarget::Camera(camera_id) => {
            if !state.index.camera_ids().await.contains(&camera_id) {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(SaveClipResponse {
                        success: false,
                        message: format!("unknown camera: {}", camera_id),
                        trigger_time: trigger_time.to_rfc3339(),
                        camera_id,
                    }),
                );
            }
            match state
                .assembler
                .assemble(&camera_id, body.duration, trigger_time, None)
                .await
            {
                Ok(path) => (
                    StatusCode::OK,
                    true,
                    format!("Clip saved to {}", path.display()),
                ),
                Err(e) => (clip_error_status(&e), false, e.to_string()),
            }
        }
        ClipTarget::All => {
            let results = Arc::clone(&state.assembler)
                .assemble_all(body.duration, trigger_time)
                .await;
            let failures: Vec<String> = results
                .iter()
                .filter_map(|r| {
                    r.result
                        .as_ref()
                        .err()
                        .map(|e| format!("{}: {}", r.camera_id, e))
                })
                .collect();

            if failures.is_empty() {
                (
                    StatusCode::OK,
                    true,
                    format!("Saved {} clips", results.len()),
                )
            } else {
                let status = results
                    .iter()
                    .filter_map(|r| r.result.as_ref().err())
                    .map(clip_error_status)
                    .max()
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (
                    status,
                    false,
                    format!(
                        "{}/{} clips failed: {}",
                        failures.len(),
                        results.len(),
                        failures.join("; ")
                    ),
                )
            }
        }
    };

    (
        status,
        Json(SaveClipResponse {
            success,
            message,
            trigger_time: trigger_time.to_rfc3339(),
            camera_id: camera_label,
        }),
    )
}

fn clip_error_status(error: &ClipError) -> StatusCode {
    match error {
        ClipError::InsufficientBuffer { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct CameraStatusEntry {
    #[serde(flatten)]
    buffer: CameraBufferStatus,
    worker_state: String,
    backoff_attempt: u32,
    backoff_delay_seconds: u64,
}

async fn status_handler(State(state): State<TriggerState>) -> impl IntoResponse {
    let buffers = state.index.status().await;

    let mut worker_info: HashMap<String, (String, u32, u64)> = HashMap::new();
    for shared in state.workers.iter() {
        let backoff = shared.backoff().await;
        worker_info.insert(
            shared.camera_id.clone(),
            (
                shared.state().await.as_str().to_string(),
                backoff.attempt,
                backoff.current_delay.as_secs(),
            ),
        );
    }

    let cameras: Vec<CameraStatusEntry> = buffers
        .into_iter()
        .map(|buffer| {
            let (worker_state, backoff_attempt, backoff_delay_seconds) = worker_info
                .get(&buffer.camera_id)
                .cloned()
                .unwrap_or_else(|| ("unknown".to_string(), 0, 0));
            CameraStatusEntry {
                buffer,
                worker_state,
                backoff_attempt,
                backoff_delay_seconds,
            }
        })
        .collect();

    let storage = state.supervisor.storage_status().await;
    let report = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "cameras": cameras,
        "buffer_totals": state.index.stats(),
        "storage": storage,
        "clips": state.assembler.stats(),
    });

    (StatusCode::OK, Json(report))
}

async fn health_handler(State(state): State<TriggerState>) -> impl IntoResponse {
    let buffers = state.index.status().await;
    let newest_by_camera: HashMap<String, Option<f64>> = buffers
        .into_iter()
        .map(|b| (b.camera_id.clone(), b.newest_age_seconds))
        .collect();

    let mut entries = Vec::with_capacity(state.workers.len());
    for shared in state.workers.iter() {
        entries.push((
            shared.camera_id.clone(),
            shared.state().await,
            newest_by_camera.get(&shared.camera_id).copied().flatten(),
        ));
    }

    let reasons = health_reasons(&entries, state.chunk_seconds);
    if reasons.is_empty() {
        (StatusCode::OK, Json(serde_json::json!({"status": "healthy"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "reasons": reasons,
            })),
        )
    }
}

/// Healthy iff every worker is running and its newest segment is fresher
/// than twice the chunk duration
pub fn health_reasons(
    entries: &[(String, WorkerState, Option<f64>)],
    chunk_seconds: u32,
) -> Vec<String> {
    let limit = (chunk_seconds * 2) as f64;
    let mut reasons = Vec::new();

    for (camera_id, state, newest_age) in entries {
        if *state != WorkerState::Running {
            reasons.push(format!("{} is {}", camera_id, state.as_str()));
            continue;
        }
        match newest_age {
            Some(age) if *age < limit => {}
            Some(age) => reasons.push(format!(
                "{} newest segment is {:.1}s old (limit {:.0}s)",
                camera_id, age, limit
            )),
            None => reasons.push(format!("{} has no segments yet", camera_id)),
        }
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_all_running_and_fresh() {
        let entries = vec![
            ("camera_1".to_string(), WorkerState::Running, Some(3.0)),
            ("camera_2".to_string(), WorkerState::Running, Some(7.5)),
        ];
        assert!(health_reasons(&entries, 5).is_empty());
    }

    #[test]
    fn test_health_stale_segment() {
        let entries = vec![("camera_1".to_string(), WorkerState::Running, Some(12.0))];
        let reasons = health_reasons(&entries, 5);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("12.0s old"));
    }

    #[test]
    fn test_health_not_running() {
        let entries = vec![
            ("camera_1".to_string(), WorkerState::Running, Some(1.0)),
            ("camera_2".to_string(), WorkerState::Backoff, Some(1.0)),
        ];
        let reasons = health_reasons(&entries, 5);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("camera_2 is backoff"));
    }

    #[test]
    fn test_health_no_segments() {
        let entries = vec![("camera_1".to_string(), WorkerState::Running, None)];
        let reasons = health_reasons(&entries, 5);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("no segments"));
    }

    #[test]
    fn test_save_clip_body_parsing() {
        let body: SaveClipBody =
            serde_json::from_str(r#"{"camera_id": "camera_2", "duration": 10}"#).unwrap();
        assert_eq!(body.camera_id.as_deref(), Some("camera_2"));
        assert_eq!(body.duration, Some(10));

        let empty: SaveClipBody = serde_json::from_str("{}").unwrap();
        assert!(empty.camera_id.is_none());
        assert!(empty.duration.is_none());
    }

    #[test]
    fn test_clip_error_status_mapping() {
        let insufficient = ClipError::InsufficientBuffer {
            camera_id: "camera_1".to_string(),
            needed_seconds: 25,
            available_seconds: 10,
        };
        assert_eq!(
            clip_error_status(&insufficient),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let ffmpeg = ClipError::FfmpegFailed {
            stage: "concat".to_string(),
            status: 1,
            stderr: "boom".to_string(),
        };
        assert_eq!(clip_error_status(&ffmpeg), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
