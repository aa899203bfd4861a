pub mod app;
pub mod buffer;
pub mod capture;
pub mod clip;
pub mod config;
pub mod error;
pub mod events;
pub mod segment;
pub mod store;
pub mod supervisor;
pub mod trigger;

pub use app::{ComponentState, RollcamOrchestrator, ShutdownReason};
pub use buffer::{AppendOutcome, BufferIndex, BufferStatsSnapshot, CameraBufferStatus};
pub use capture::{BackoffState, CaptureWorker, WorkerShared, WorkerState};
pub use clip::{plan_clip, ClipAssembler, ClipPlan, ClipStatsSnapshot};
pub use config::{
    CameraConfig, EncoderConfig, ReconnectConfig, RollcamConfig, RtspTransport, TriggerMode,
};
pub use error::{Result, RollcamError};
pub use events::{EventBus, RollcamEvent};
pub use segment::Segment;
pub use store::{ListedSegment, SegmentStore};
pub use supervisor::{ResilienceSupervisor, StorageStatus};
pub use trigger::{ClipRequest, ClipTarget, HttpTrigger, KeyboardTrigger};
