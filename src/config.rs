use config::{Config, ConfigError, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Complete system configuration, immutable after load.
///
/// The on-disk format is a flat `KEY=value` file (default `rollcam.env`);
/// process environment variables override file values key for key.
#[derive(Debug, Clone, PartialEq)]
pub struct RollcamConfig {
    /// Configured cameras, in declaration order (`CAMERA_1_URL`, `CAMERA_2_URL`, ...)
    pub cameras: Vec<CameraConfig>,

    /// Segment length in seconds
    pub chunk_duration: u32,

    /// Retention window per camera in seconds
    pub buffer_seconds: u32,

    /// Default clip length in seconds
    pub final_clip_duration: u32,

    /// Root of the memory-backed segment store
    pub temp_dir: PathBuf,

    /// Persistent clip output root
    pub clips_dir: PathBuf,

    /// Trigger front-end selection
    pub trigger_mode: TriggerMode,

    /// Listen port for the HTTP trigger
    pub http_port: u16,

    /// RTSP transport preference
    pub rtsp_transport: RtspTransport,

    /// Encoder restart backoff policy
    pub reconnect: ReconnectConfig,

    /// Encoder tuning passed through to ffmpeg
    pub encoder: EncoderConfig,
}

/// A single camera, identified by a stable `camera_N` id
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub camera_id: String,
    pub url: String,
}

/// Backoff policy for encoder restarts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial restart delay in seconds
    pub initial_delay: u64,
    /// Cap on the restart delay in seconds
    pub max_delay: u64,
    /// Retry cap; 0 retries forever
    pub max_attempts: u32,
}

/// ffmpeg encoder tuning
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Forced keyframe cadence in seconds, so segment boundaries start on a keyframe
    pub keyframe_interval: u32,
    /// libx264 preset
    pub preset: String,
    /// libx264 CRF quality
    pub crf: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Keyboard,
    Http,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Keyboard => "keyboard",
            TriggerMode::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

impl RollcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("rollcam.env")
    }

    /// Load configuration from a specific flat key/value file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("chunk_duration", default_chunk_duration() as i64)?
            .set_default("buffer_seconds", default_buffer_seconds() as i64)?
            .set_default("final_clip_duration", default_final_clip_duration() as i64)?
            .set_default("clips_dir", default_clips_dir())?
            .set_default("trigger_mode", "keyboard")?
            .set_default("http_port", default_http_port() as i64)?
            .set_default("rtsp_transport", "tcp")?
            .set_default("reconnect_initial_delay", default_reconnect_initial() as i64)?
            .set_default("reconnect_max_delay", default_reconnect_max_delay() as i64)?
            .set_default("reconnect_max_attempts", 0_i64)?
            .set_default("ffmpeg_keyframe_interval", default_keyframe_interval() as i64)?
            .set_default("ffmpeg_preset", default_preset())?
            .set_default("ffmpeg_crf", default_crf() as i64)?
            // Flat KEY=value file; a sectionless INI is exactly that shape
            .add_source(File::new(&path_str, FileFormat::Ini).required(false))
            // Environment variables override the file
            .add_source(Environment::default())
            .build()?;

        // Cameras are declared as CAMERA_1_URL, CAMERA_2_URL, ... with no gaps
        let mut cameras = Vec::new();
        let mut n = 1u32;
        while let Ok(url) = settings.get_string(&format!("camera_{}_url", n)) {
            cameras.push(CameraConfig {
                camera_id: format!("camera_{}", n),
                url,
            });
            n += 1;
        }

        let temp_dir = match settings.get_string("temp_dir") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_temp_dir(),
        };

        let trigger_mode = parse_trigger_mode(&settings.get_string("trigger_mode")?)?;
        let rtsp_transport = parse_rtsp_transport(&settings.get_string("rtsp_transport")?)?;

        let config = RollcamConfig {
            cameras,
            chunk_duration: get_u32(&settings, "chunk_duration")?,
            buffer_seconds: get_u32(&settings, "buffer_seconds")?,
            final_clip_duration: get_u32(&settings, "final_clip_duration")?,
            temp_dir,
            clips_dir: PathBuf::from(settings.get_string("clips_dir")?),
            trigger_mode,
            http_port: get_u32(&settings, "http_port")? as u16,
            rtsp_transport,
            reconnect: ReconnectConfig {
                initial_delay: get_u32(&settings, "reconnect_initial_delay")? as u64,
                max_delay: get_u32(&settings, "reconnect_max_delay")? as u64,
                max_attempts: get_u32(&settings, "reconnect_max_attempts")?,
            },
            encoder: EncoderConfig {
                keyframe_interval: get_u32(&settings, "ffmpeg_keyframe_interval")?,
                preset: settings.get_string("ffmpeg_preset")?,
                crf: get_u32(&settings, "ffmpeg_crf")?,
            },
        };

        config.validate()?;

        info!(
            "Configuration loaded: {} cameras, {}s chunks, {}s window",
            config.cameras.len(),
            config.chunk_duration,
            config.buffer_seconds
        );
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::Message(
                "No cameras configured; set at least CAMERA_1_URL".to_string(),
            ));
        }

        for camera in &self.cameras {
            if !camera.url.starts_with("rtsp://") {
                return Err(ConfigError::Message(format!(
                    "{} URL must start with 'rtsp://'",
                    camera.camera_id.to_uppercase()
                )));
            }
        }

        if self.chunk_duration == 0 {
            return Err(ConfigError::Message(
                "CHUNK_DURATION must be greater than 0".to_string(),
            ));
        }

        if self.buffer_seconds == 0 {
            return Err(ConfigError::Message(
                "BUFFER_SECONDS must be greater than 0".to_string(),
            ));
        }

        if self.final_clip_duration == 0 {
            return Err(ConfigError::Message(
                "FINAL_CLIP_DURATION must be greater than 0".to_string(),
            ));
        }

        if self.final_clip_duration > self.buffer_seconds {
            return Err(ConfigError::Message(
                "FINAL_CLIP_DURATION cannot exceed BUFFER_SECONDS".to_string(),
            ));
        }

        if self.reconnect.initial_delay == 0 {
            return Err(ConfigError::Message(
                "RECONNECT_INITIAL_DELAY must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(ConfigError::Message(
                "RECONNECT_MAX_DELAY must be at least RECONNECT_INITIAL_DELAY".to_string(),
            ));
        }

        if self.encoder.keyframe_interval == 0 {
            return Err(ConfigError::Message(
                "FFMPEG_KEYFRAME_INTERVAL must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create the store and clips directories if they do not exist
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.temp_dir)?;
        std::fs::create_dir_all(&self.clips_dir)?;
        Ok(())
    }

    /// Nominal segment duration
    pub fn chunk(&self) -> Duration {
        Duration::from_secs(self.chunk_duration as u64)
    }

    /// Retention window
    pub fn buffer_window(&self) -> Duration {
        Duration::from_secs(self.buffer_seconds as u64)
    }

    /// Number of whole chunks covered by the retention window
    pub fn buffer_chunks(&self) -> u32 {
        self.buffer_seconds / self.chunk_duration.max(1)
    }

    /// Look up a camera by id
    pub fn camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.camera_id == camera_id)
    }

    /// Render the effective configuration in the flat on-disk format
    pub fn to_flat_format(&self) -> String {
        let mut out = String::new();
        for camera in &self.cameras {
            out.push_str(&format!(
                "{}_URL={}\n",
                camera.camera_id.to_uppercase(),
                camera.url
            ));
        }
        out.push_str(&format!("CHUNK_DURATION={}\n", self.chunk_duration));
        out.push_str(&format!("BUFFER_SECONDS={}\n", self.buffer_seconds));
        out.push_str(&format!(
            "FINAL_CLIP_DURATION={}\n",
            self.final_clip_duration
        ));
        out.push_str(&format!("TEMP_DIR={}\n", self.temp_dir.display()));
        out.push_str(&format!("CLIPS_DIR={}\n", self.clips_dir.display()));
        out.push_str(&format!("TRIGGER_MODE={}\n", self.trigger_mode.as_str()));
        out.push_str(&format!("HTTP_PORT={}\n", self.http_port));
        out.push_str(&format!(
            "RTSP_TRANSPORT={}\n",
            self.rtsp_transport.as_str()
        ));
        out.push_str(&format!(
            "RECONNECT_INITIAL_DELAY={}\n",
            self.reconnect.initial_delay
        ));
        out.push_str(&format!(
            "RECONNECT_MAX_DELAY={}\n",
            self.reconnect.max_delay
        ));
        out.push_str(&format!(
            "RECONNECT_MAX_ATTEMPTS={}\n",
            self.reconnect.max_attempts
        ));
        out.push_str(&format!(
            "FFMPEG_KEYFRAME_INTERVAL={}\n",
            self.encoder.keyframe_interval
        ));
        out.push_str(&format!("FFMPEG_PRESET={}\n", self.encoder.preset));
        out.push_str(&format!("FFMPEG_CRF={}\n", self.encoder.crf));
        out
    }
}

impl Default for RollcamConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            chunk_duration: default_chunk_duration(),
            buffer_seconds: default_buffer_seconds(),
            final_clip_duration: default_final_clip_duration(),
            temp_dir: default_temp_dir(),
            clips_dir: PathBuf::from(default_clips_dir()),
            trigger_mode: TriggerMode::Keyboard,
            http_port: default_http_port(),
            rtsp_transport: RtspTransport::Tcp,
            reconnect: ReconnectConfig {
                initial_delay: default_reconnect_initial(),
                max_delay: default_reconnect_max_delay(),
                max_attempts: 0,
            },
            encoder: EncoderConfig {
                keyframe_interval: default_keyframe_interval(),
                preset: default_preset(),
                crf: default_crf(),
            },
        }
    }
}

fn get_u32(settings: &Config, key: &str) -> Result<u32, ConfigError> {
    let value = settings.get_int(key)?;
    u32::try_from(value)
        .map_err(|_| ConfigError::Message(format!("{} must be a non-negative integer", key.to_uppercase())))
}

fn parse_trigger_mode(value: &str) -> Result<TriggerMode, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "keyboard" => Ok(TriggerMode::Keyboard),
        "http" => Ok(TriggerMode::Http),
        other => Err(ConfigError::Message(format!(
            "TRIGGER_MODE must be 'keyboard' or 'http', got '{}'",
            other
        ))),
    }
}

fn parse_rtsp_transport(value: &str) -> Result<RtspTransport, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(RtspTransport::Tcp),
        "udp" => Ok(RtspTransport::Udp),
        other => Err(ConfigError::Message(format!(
            "RTSP_TRANSPORT must be 'tcp' or 'udp', got '{}'",
            other
        ))),
    }
}

// Default value functions
fn default_chunk_duration() -> u32 {
    5
}
fn default_buffer_seconds() -> u32 {
    30
}
fn default_final_clip_duration() -> u32 {
    25
}
fn default_clips_dir() -> String {
    "./clips".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_reconnect_initial() -> u64 {
    2
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_keyframe_interval() -> u32 {
    1
}
fn default_preset() -> String {
    "ultrafast".to_string()
}
fn default_crf() -> u32 {
    23
}

/// Prefer tmpfs when available so the rolling buffer never touches flash
fn default_temp_dir() -> PathBuf {
    if Path::new("/dev/shm").exists() {
        PathBuf::from("/dev/shm/video_buffer")
    } else {
        std::env::temp_dir().join("video_buffer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config(cameras: usize) -> RollcamConfig {
        RollcamConfig {
            cameras: (1..=cameras)
                .map(|n| CameraConfig {
                    camera_id: format!("camera_{}", n),
                    url: format!("rtsp://10.0.0.{}/stream1", n),
                })
                .collect(),
            ..RollcamConfig::default()
        }
    }

    #[test]
    fn test_default_config_with_camera_validates() {
        let config = test_config(2);
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_duration, 5);
        assert_eq!(config.buffer_seconds, 30);
        assert_eq!(config.final_clip_duration, 25);
        assert_eq!(config.buffer_chunks(), 6);
    }

    #[test]
    fn test_validation_requires_cameras() {
        let config = RollcamConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CAMERA_1_URL"));
    }

    #[test]
    fn test_validation_rejects_non_rtsp_url() {
        let mut config = test_config(1);
        config.cameras[0].url = "http://10.0.0.1/stream".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_clip_longer_than_buffer() {
        let mut config = test_config(1);
        config.final_clip_duration = 60;
        config.buffer_seconds = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("FINAL_CLIP_DURATION"));
    }

    #[test]
    fn test_validation_rejects_zero_durations() {
        let mut config = test_config(1);
        config.chunk_duration = 0;
        assert!(config.validate().is_err());

        let mut config = test_config(1);
        config.buffer_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_backoff_inversion() {
        let mut config = test_config(1);
        config.reconnect.initial_delay = 60;
        config.reconnect.max_delay = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_mode_parsing() {
        assert_eq!(parse_trigger_mode("keyboard").unwrap(), TriggerMode::Keyboard);
        assert_eq!(parse_trigger_mode("HTTP").unwrap(), TriggerMode::Http);
        assert!(parse_trigger_mode("webhook").is_err());
    }

    #[test]
    fn test_rtsp_transport_parsing() {
        assert_eq!(parse_rtsp_transport("tcp").unwrap(), RtspTransport::Tcp);
        assert_eq!(parse_rtsp_transport("UDP").unwrap(), RtspTransport::Udp);
        assert!(parse_rtsp_transport("quic").is_err());
    }

    #[test]
    fn test_load_from_flat_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CAMERA_1_URL=rtsp://192.168.1.10:554/stream1").unwrap();
        writeln!(file, "CAMERA_2_URL=rtsp://192.168.1.11:554/stream1").unwrap();
        writeln!(file, "CHUNK_DURATION=4").unwrap();
        writeln!(file, "BUFFER_SECONDS=40").unwrap();
        writeln!(file, "FINAL_CLIP_DURATION=20").unwrap();
        writeln!(file, "RTSP_TRANSPORT=udp").unwrap();
        writeln!(file, "RECONNECT_MAX_ATTEMPTS=8").unwrap();
        file.flush().unwrap();

        let config = RollcamConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[0].camera_id, "camera_1");
        assert_eq!(config.cameras[1].url, "rtsp://192.168.1.11:554/stream1");
        assert_eq!(config.chunk_duration, 4);
        assert_eq!(config.buffer_seconds, 40);
        assert_eq!(config.final_clip_duration, 20);
        assert_eq!(config.rtsp_transport, RtspTransport::Udp);
        assert_eq!(config.reconnect.max_attempts, 8);
        // Untouched keys keep their defaults
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.encoder.preset, "ultrafast");
    }

    #[test]
    fn test_load_missing_file_fails_without_cameras() {
        let result = RollcamConfig::load_from_file("/nonexistent/rollcam.env");
        assert!(result.is_err());
    }

    #[test]
    fn test_flat_format_round_trip_keys() {
        let config = test_config(1);
        let rendered = config.to_flat_format();
        assert!(rendered.contains("CAMERA_1_URL=rtsp://10.0.0.1/stream1"));
        assert!(rendered.contains("CHUNK_DURATION=5"));
        assert!(rendered.contains("TRIGGER_MODE=keyboard"));
        assert!(rendered.contains("RECONNECT_MAX_ATTEMPTS=0"));
    }

    #[test]
    fn test_camera_lookup() {
        let config = test_config(3);
        assert!(config.camera("camera_2").is_some());
        assert!(config.camera("camera_7").is_none());
    }
}
