use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Container extension for all segment files
pub const SEGMENT_EXT: &str = "mp4";

/// Width of the zero-padded epoch-second filename stem. Ten digits keeps
/// lexicographic order equal to chronological order for any current date.
const STEM_WIDTH: usize = 10;

/// A single encoded segment file in the rolling buffer.
///
/// The file on disk must exist for the descriptor's entire visible lifetime
/// in the buffer index; eviction unlinks the file before the descriptor is
/// dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Owning camera
    pub camera_id: String,
    /// Wall-clock UTC start, aligned to a multiple of the segment duration
    pub start_time: DateTime<Utc>,
    /// Nominal duration (equal to the configured chunk duration)
    pub duration: Duration,
    /// Absolute path in the segment store
    pub path: PathBuf,
    /// File size at the time the segment was observed closed
    pub size_bytes: u64,
    /// When the descriptor was created
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn new(
        camera_id: impl Into<String>,
        start_time: DateTime<Utc>,
        duration: Duration,
        path: PathBuf,
        size_bytes: u64,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            start_time,
            duration,
            path,
            size_bytes,
            created_at: Utc::now(),
        }
    }

    /// End of the covered interval
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time
            + chrono::Duration::from_std(self.duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Whether the covered interval `[start, end)` contains `instant`
    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start_time && instant < self.end_time()
    }

    /// Whether `next` starts exactly where this segment ends
    pub fn is_contiguous_with(&self, next: &Segment) -> bool {
        next.start_time == self.end_time()
    }

    /// Age of the segment's end relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.end_time()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Canonical filename for this segment's start time
    pub fn filename(&self) -> String {
        encode_filename(self.start_time)
    }
}

/// Encode a segment start time into its on-disk filename
pub fn encode_filename(start_time: DateTime<Utc>) -> String {
    format!(
        "{:0width$}.{}",
        start_time.timestamp(),
        SEGMENT_EXT,
        width = STEM_WIDTH
    )
}

/// Parse a segment start time out of a store filename.
///
/// Returns `None` for foreign files: wrong extension, non-numeric stem, or a
/// timestamp outside the representable range.
pub fn parse_start_time(path: &Path) -> Option<DateTime<Utc>> {
    if path.extension()?.to_str()? != SEGMENT_EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let epoch: i64 = stem.parse().ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}

/// Floor a timestamp to the nearest multiple of the chunk duration.
///
/// The encoder's clock-aligned segmenter cuts on these boundaries; this is
/// the same arithmetic used when validating observed segment names.
pub fn align_to_chunk(instant: DateTime<Utc>, chunk: Duration) -> DateTime<Utc> {
    let chunk_secs = chunk.as_secs().max(1) as i64;
    let aligned = instant.timestamp() - instant.timestamp().rem_euclid(chunk_secs);
    Utc.timestamp_opt(aligned, 0).single().unwrap_or(instant)
}
