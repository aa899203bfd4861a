use crate::error::TriggerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events that flow between rollcam components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RollcamEvent {
    /// A closed segment was appended to a camera's buffer
    SegmentRecorded {
        camera_id: String,
        start_time: DateTime<Utc>,
        size_bytes: u64,
    },
    /// A capture worker changed lifecycle state
    WorkerStateChanged {
        camera_id: String,
        state: String,
        timestamp: DateTime<Utc>,
    },
    /// A clip was assembled and persisted
    ClipSaved {
        camera_id: String,
        path: String,
        duration_seconds: u32,
    },
    /// A clip request failed for one camera
    ClipFailed {
        camera_id: String,
        reason: String,
    },
    /// Free space on the memory-backed store fell below the floor
    StoragePressure {
        free_percent: f64,
        timestamp: DateTime<Utc>,
    },
    /// A system error occurred in a component
    SystemError { component: String, error: String },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

impl RollcamEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            RollcamEvent::SegmentRecorded {
                camera_id,
                start_time,
                size_bytes,
            } => {
                format!(
                    "Segment recorded for {} at {} ({} bytes)",
                    camera_id, start_time, size_bytes
                )
            }
            RollcamEvent::WorkerStateChanged {
                camera_id, state, ..
            } => {
                format!("Worker {} is now {}", camera_id, state)
            }
            RollcamEvent::ClipSaved {
                camera_id,
                path,
                duration_seconds,
            } => {
                format!(
                    "Clip saved for {}: {} ({}s)",
                    camera_id, path, duration_seconds
                )
            }
            RollcamEvent::ClipFailed { camera_id, reason } => {
                format!("Clip failed for {}: {}", camera_id, reason)
            }
            RollcamEvent::StoragePressure { free_percent, .. } => {
                format!("Storage pressure: {:.1}% free", free_percent)
            }
            RollcamEvent::SystemError { component, error } => {
                format!("Error in {}: {}", component, error)
            }
            RollcamEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            RollcamEvent::SegmentRecorded { .. } => "segment_recorded",
            RollcamEvent::WorkerStateChanged { .. } => "worker_state_changed",
            RollcamEvent::ClipSaved { .. } => "clip_saved",
            RollcamEvent::ClipFailed { .. } => "clip_failed",
            RollcamEvent::StoragePressure { .. } => "storage_pressure",
            RollcamEvent::SystemError { .. } => "system_error",
            RollcamEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<RollcamEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RollcamEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RollcamEvent) -> Result<usize, TriggerError> {
        // Log important events at appropriate levels
        match &event {
            RollcamEvent::SystemError { component, error } => {
                error!("System error in {}: {}", component, error);
            }
            RollcamEvent::StoragePressure { free_percent, .. } => {
                warn!("Storage pressure: {:.1}% free on buffer store", free_percent);
            }
            RollcamEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            RollcamEvent::ClipFailed { camera_id, reason } => {
                warn!("Clip failed for {}: {}", camera_id, reason);
            }
            _ => {
                debug!("Event: {}", event.description());
            }
        }

        self.sender
            .send(event)
            .map_err(|_| TriggerError::ChannelClosed)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();

        bus.publish(RollcamEvent::ClipFailed {
            camera_id: "camera_1".to_string(),
            reason: "insufficient buffer".to_string(),
        })
        .unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "clip_failed");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_fails() {
        let bus = EventBus::new(16);
        let result = bus.publish(RollcamEvent::SystemError {
            component: "test".to_string(),
            error: "nobody listening".to_string(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_all_events() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(RollcamEvent::ShutdownRequested {
            timestamp: Utc::now(),
            reason: "test".to_string(),
        })
        .unwrap();

        assert_eq!(a.recv().await.unwrap().event_type(), "shutdown_requested");
        assert_eq!(b.recv().await.unwrap().event_type(), "shutdown_requested");
    }

    #[test]
    fn test_event_descriptions() {
        let event = RollcamEvent::SegmentRecorded {
            camera_id: "camera_2".to_string(),
            start_time: Utc::now(),
            size_bytes: 123_456,
        };
        assert!(event.description().contains("camera_2"));
        assert!(event.description().contains("123456"));
        assert_eq!(event.event_type(), "segment_recorded");
    }
}
