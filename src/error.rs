use std::time::Duration;
use thiserror::Error;

/// Main error type for the rollcam system
#[derive(Error, Debug)]
pub enum RollcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Clip assembly error: {0}")]
    Clip(#[from] ClipError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },

    #[error("Graceful shutdown requested")]
    Shutdown,
}

/// Capture worker and encoder subprocess error types
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Camera {camera_id} unreachable at {url}")]
    CameraUnreachable { camera_id: String, url: String },

    #[error("Encoder for {camera_id} exited with status {status}")]
    EncoderExited { camera_id: String, status: i32 },

    #[error("Failed to spawn encoder for {camera_id}: {details}")]
    EncoderSpawn { camera_id: String, details: String },

    #[error("Capture for {camera_id} stalled: no segment for {age:?}")]
    Stalled { camera_id: String, age: Duration },

    #[error("Encoder for {camera_id} did not stop within {timeout:?}")]
    StopTimeout { camera_id: String, timeout: Duration },

    #[error("Camera {camera_id} quarantined after {attempts} reconnect attempts")]
    Quarantined { camera_id: String, attempts: u32 },
}

/// Buffer index error types
#[derive(Error, Debug, Clone)]
pub enum BufferError {
    #[error("Unknown camera: {camera_id}")]
    UnknownCamera { camera_id: String },

    #[error("Segment file missing: {path}")]
    SegmentMissing { path: String },

    #[error("Segment start {start} not after newest {newest} for {camera_id}")]
    NonMonotonic {
        camera_id: String,
        start: i64,
        newest: i64,
    },
}

/// Clip assembler error types
#[derive(Error, Debug, Clone)]
pub enum ClipError {
    #[error(
        "Insufficient buffer for {camera_id}: need {needed_seconds}s, have {available_seconds}s"
    )]
    InsufficientBuffer {
        camera_id: String,
        needed_seconds: u32,
        available_seconds: u32,
    },

    #[error("Segment vanished during assembly: {path}")]
    SegmentMissing { path: String },

    #[error("Clip assembly for {camera_id} timed out after {timeout:?}")]
    Timeout { camera_id: String, timeout: Duration },

    #[error("ffmpeg {stage} failed with status {status}: {stderr}")]
    FfmpegFailed {
        stage: String,
        status: i32,
        stderr: String,
    },

    #[error("Output duration {actual:.3}s deviates from requested {requested}s beyond tolerance")]
    DurationMismatch { requested: u32, actual: f64 },
}

/// Trigger interface error types
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Trigger server error: {details}")]
    ServerFailed { details: String },

    #[error("Invalid clip request: {details}")]
    InvalidRequest { details: String },

    #[error("Trigger channel closed")]
    ChannelClosed,
}

/// Segment store error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create store directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        source: std::io::Error,
    },

    #[error("Directory scan failed for {path}: {source}")]
    DirectoryScan {
        path: String,
        source: std::io::Error,
    },

    #[error("File deletion failed for {path}: {source}")]
    FileDeletion {
        path: String,
        source: std::io::Error,
    },

    #[error("Free space check failed for {path}: {details}")]
    SpaceCheck { path: String, details: String },

    #[error("Storage pressure: {free_percent:.1}% free below {floor_percent}% floor")]
    Pressure {
        free_percent: f64,
        floor_percent: u8,
    },
}

impl RollcamError {
    /// Create a system error with a message
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Create a component error with component name and message
    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            RollcamError::Capture(CaptureError::CameraUnreachable { .. }) => true,
            RollcamError::Capture(CaptureError::EncoderExited { .. }) => true,
            RollcamError::Capture(CaptureError::EncoderSpawn { .. }) => true,
            RollcamError::Capture(CaptureError::Stalled { .. }) => true,
            RollcamError::Capture(CaptureError::StopTimeout { .. }) => true,
            RollcamError::Capture(CaptureError::Quarantined { .. }) => false,
            RollcamError::Buffer(BufferError::SegmentMissing { .. }) => true,
            RollcamError::Clip(ClipError::SegmentMissing { .. }) => true,
            RollcamError::Clip(ClipError::Timeout { .. }) => true,
            RollcamError::Clip(ClipError::InsufficientBuffer { .. }) => true,
            RollcamError::Storage(StorageError::Pressure { .. }) => true,
            RollcamError::Io(_) => true,
            RollcamError::Config(_) => false,
            RollcamError::Shutdown => false,
            RollcamError::System { .. } => false,
            _ => false,
        }
    }

    /// Get the component name associated with this error
    pub fn component_name(&self) -> String {
        match self {
            RollcamError::Config(_) => "config".to_string(),
            RollcamError::Capture(_) => "capture".to_string(),
            RollcamError::Buffer(_) => "buffer".to_string(),
            RollcamError::Clip(_) => "clip".to_string(),
            RollcamError::Trigger(_) => "trigger".to_string(),
            RollcamError::Storage(_) => "storage".to_string(),
            RollcamError::Component { component, .. } => component.clone(),
            _ => "system".to_string(),
        }
    }

    /// Get error severity level for structured logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RollcamError::Shutdown => ErrorSeverity::Info,
            RollcamError::Config(_) => ErrorSeverity::Critical,
            RollcamError::Capture(CaptureError::Quarantined { .. }) => ErrorSeverity::Critical,
            RollcamError::Clip(ClipError::InsufficientBuffer { .. }) => ErrorSeverity::Warning,
            RollcamError::Storage(StorageError::Pressure { .. }) => ErrorSeverity::Warning,
            _ if self.is_recoverable() => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Info => tracing::Level::INFO,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Critical => tracing::Level::ERROR,
        }
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, RollcamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let capture_error = RollcamError::Capture(CaptureError::EncoderExited {
            camera_id: "camera_1".to_string(),
            status: 1,
        });
        assert_eq!(
            capture_error.to_string(),
            "Capture error: Encoder for camera_1 exited with status 1"
        );

        let clip_error = RollcamError::Clip(ClipError::InsufficientBuffer {
            camera_id: "camera_2".to_string(),
            needed_seconds: 25,
            available_seconds: 15,
        });
        assert_eq!(
            clip_error.to_string(),
            "Clip assembly error: Insufficient buffer for camera_2: need 25s, have 15s"
        );

        let system_error = RollcamError::system("Test system error");
        assert_eq!(system_error.to_string(), "System error: Test system error");
    }

    #[test]
    fn test_error_source_chains() {
        use std::error::Error;

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let rollcam_error = RollcamError::Io(io_error);

        assert!(rollcam_error.source().is_some());
        assert_eq!(
            rollcam_error.source().unwrap().to_string(),
            "File not found"
        );
    }

    #[test]
    fn test_recoverable_error_classification() {
        // Recoverable errors feed the backoff loop or are retried
        assert!(RollcamError::Capture(CaptureError::EncoderExited {
            camera_id: "camera_1".to_string(),
            status: 255
        })
        .is_recoverable());
        assert!(RollcamError::Capture(CaptureError::CameraUnreachable {
            camera_id: "camera_1".to_string(),
            url: "rtsp://10.0.0.2/stream".to_string()
        })
        .is_recoverable());
        assert!(RollcamError::Clip(ClipError::SegmentMissing {
            path: "/dev/shm/video_buffer/camera_1/0000000005.mp4".to_string()
        })
        .is_recoverable());
        assert!(RollcamError::Storage(StorageError::Pressure {
            free_percent: 4.2,
            floor_percent: 10
        })
        .is_recoverable());

        // Non-recoverable errors
        assert!(!RollcamError::system("fatal").is_recoverable());
        assert!(!RollcamError::Shutdown.is_recoverable());
        assert!(!RollcamError::Capture(CaptureError::Quarantined {
            camera_id: "camera_1".to_string(),
            attempts: 12
        })
        .is_recoverable());
    }

    #[test]
    fn test_component_name_extraction() {
        assert_eq!(
            RollcamError::Capture(CaptureError::Stalled {
                camera_id: "camera_1".to_string(),
                age: Duration::from_secs(20)
            })
            .component_name(),
            "capture"
        );
        assert_eq!(
            RollcamError::Buffer(BufferError::UnknownCamera {
                camera_id: "camera_9".to_string()
            })
            .component_name(),
            "buffer"
        );
        assert_eq!(RollcamError::system("test").component_name(), "system");
        assert_eq!(
            RollcamError::component("custom", "test").component_name(),
            "custom"
        );
    }

    #[test]
    fn test_error_severity_levels() {
        use ErrorSeverity::*;

        assert_eq!(RollcamError::Shutdown.severity(), Info);
        assert_eq!(
            RollcamError::Capture(CaptureError::Quarantined {
                camera_id: "camera_1".to_string(),
                attempts: 5
            })
            .severity(),
            Critical
        );
        assert_eq!(
            RollcamError::Clip(ClipError::InsufficientBuffer {
                camera_id: "camera_1".to_string(),
                needed_seconds: 25,
                available_seconds: 10
            })
            .severity(),
            Warning
        );
        assert_eq!(RollcamError::system("error").severity(), Error);
    }

    #[test]
    fn test_error_severity_to_tracing_level() {
        use ErrorSeverity::*;

        assert_eq!(Info.to_tracing_level(), tracing::Level::INFO);
        assert_eq!(Warning.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(Critical.to_tracing_level(), tracing::Level::ERROR);
    }
}
