use crate::error::BufferError;
use crate::segment::Segment;
use crate::store::{ListedSegment, SegmentStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of appending a segment to a camera's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Appended at the tail
    Appended,
    /// Same start time as an existing segment; the newer descriptor won
    ReplacedDuplicate,
    /// Start time regressed behind the newest segment; dropped and unlinked
    DroppedNonMonotonic,
}

/// Aggregate statistics for monitoring
#[derive(Debug, Default)]
struct BufferStats {
    segments_appended: AtomicU64,
    segments_evicted: AtomicU64,
    segments_dropped: AtomicU64,
    bytes_processed: AtomicU64,
}

/// Snapshot of buffer statistics
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatsSnapshot {
    pub segments_appended: u64,
    pub segments_evicted: u64,
    pub segments_dropped: u64,
    pub bytes_processed: u64,
}

/// Per-camera status for the HTTP surface
#[derive(Debug, Clone, Serialize)]
pub struct CameraBufferStatus {
    pub camera_id: String,
    pub segment_count: usize,
    pub covered_seconds: u64,
    pub newest_age_seconds: Option<f64>,
    pub total_bytes: u64,
    pub gaps_recorded: u64,
    pub oversized_flagged: u64,
}

struct CameraBuffer {
    segments: VecDeque<Segment>,
    gaps_recorded: u64,
    oversized_flagged: u64,
}

impl CameraBuffer {
    fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            gaps_recorded: 0,
            oversized_flagged: 0,
        }
    }

    fn covered(&self) -> Duration {
        self.segments.iter().map(|s| s.duration).sum()
    }

    fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }
}

/// In-process registry mapping camera → ordered segment descriptors.
///
/// One writer per camera (the owning capture worker) mutates the sequence;
/// readers observe consistent snapshots. Eviction unlinks the file before the
/// descriptor leaves the sequence, both under the lock, so a snapshot never
/// names a file that was already missing at snapshot time.
pub struct BufferIndex {
    store: SegmentStore,
    window: Duration,
    cameras: RwLock<BTreeMap<String, CameraBuffer>>,
    stats: BufferStats,
}

impl BufferIndex {
    pub fn new(store: SegmentStore, window: Duration) -> Self {
        Self {
            store,
            window,
            cameras: RwLock::new(BTreeMap::new()),
            stats: BufferStats::default(),
        }
    }

    /// Register a camera before its worker starts appending
    pub async fn register_camera(&self, camera_id: &str) {
        let mut cameras = self.cameras.write().await;
        cameras
            .entry(camera_id.to_string())
            .or_insert_with(CameraBuffer::new);
    }

    /// Registered camera ids, in stable order
    pub async fn camera_ids(&self) -> Vec<String> {
        self.cameras.read().await.keys().cloned().collect()
    }

    /// Append a closed segment observed on disk.
    ///
    /// Enforces the retention window afterwards: oldest segments are evicted
    /// (file unlinked, then descriptor dropped) until covered duration is
    /// back within the window.
    pub async fn append(&self, segment: Segment) -> Result<AppendOutcome, BufferError> {
        let mut cameras = self.cameras.write().await;
        let buffer = cameras
            .get_mut(&segment.camera_id)
            .ok_or_else(|| BufferError::UnknownCamera {
                camera_id: segment.camera_id.clone(),
            })?;

        let newest_bounds = buffer.segments.back().map(|s| (s.start_time, s.end_time()));
        if let Some((newest_start, newest_end)) = newest_bounds {
            if segment.start_time < newest_start {
                warn!(
                    "Dropping non-monotonic segment for {}: start {} behind newest {}",
                    segment.camera_id, segment.start_time, newest_start
                );
                self.stats.segments_dropped.fetch_add(1, Ordering::Relaxed);
                let _ = self.store.remove(&segment.path).await;
                return Ok(AppendOutcome::DroppedNonMonotonic);
            }

            if segment.start_time == newest_start {
                // Same start means the same store path; keep the newer
                // descriptor, which carries the final observed size.
                debug!(
                    "Duplicate start {} for {}; retaining newer descriptor",
                    segment.start_time, segment.camera_id
                );
                if let Some(newest) = buffer.segments.back_mut() {
                    *newest = segment;
                }
                return Ok(AppendOutcome::ReplacedDuplicate);
            }

            if segment.start_time > newest_end {
                buffer.gaps_recorded += 1;
                warn!(
                    "Capture gap for {}: {} .. {}",
                    segment.camera_id, newest_end, segment.start_time
                );
            }
        }

        // A single segment far larger than its peers suggests the encoder
        // overran its boundary; accept it but flag it.
        let count = buffer.segments.len() as u64;
        if count > 0 {
            let mean = buffer.total_bytes() / count;
            if mean > 0 && segment.size_bytes > mean * 2 {
                buffer.oversized_flagged += 1;
                warn!(
                    "Oversized segment for {}: {} bytes vs mean {}",
                    segment.camera_id, segment.size_bytes, mean
                );
            }
        }

        self.stats.segments_appended.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_processed
            .fetch_add(segment.size_bytes, Ordering::Relaxed);
        buffer.segments.push_back(segment);

        // Restore the retention window
        while buffer.covered() > self.window {
            let oldest = buffer.segments.front().cloned();
            let Some(oldest) = oldest else { break };
            let _ = self.store.remove(&oldest.path).await;
            buffer.segments.pop_front();
            self.stats.segments_evicted.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Evicted segment {} for {} (window {}s)",
                oldest.filename(),
                oldest.camera_id,
                self.window.as_secs()
            );
        }

        Ok(AppendOutcome::Appended)
    }

    /// Immutable view of a camera's current sequence. Files named by the
    /// snapshot may be unlinked by eviction afterwards; readers must treat a
    /// missing file as a recoverable skip.
    pub async fn snapshot(&self, camera_id: &str) -> Result<Vec<Segment>, BufferError> {
        let cameras = self.cameras.read().await;
        let buffer = cameras
            .get(camera_id)
            .ok_or_else(|| BufferError::UnknownCamera {
                camera_id: camera_id.to_string(),
            })?;
        Ok(buffer.segments.iter().cloned().collect())
    }

    /// Start time of the newest segment, if any
    pub async fn newest_start(&self, camera_id: &str) -> Option<chrono::DateTime<Utc>> {
        let cameras = self.cameras.read().await;
        cameras
            .get(camera_id)
            .and_then(|b| b.segments.back().map(|s| s.start_time))
    }

    /// Evict the single oldest segment of a camera regardless of the
    /// retention window. Used by the supervisor under storage pressure.
    pub async fn evict_oldest(&self, camera_id: &str) -> Result<Option<Segment>, BufferError> {
        let mut cameras = self.cameras.write().await;
        let buffer = cameras
            .get_mut(camera_id)
            .ok_or_else(|| BufferError::UnknownCamera {
                camera_id: camera_id.to_string(),
            })?;
        let Some(oldest) = buffer.segments.front().cloned() else {
            return Ok(None);
        };
        let _ = self.store.remove(&oldest.path).await;
        buffer.segments.pop_front();
        self.stats.segments_evicted.fetch_add(1, Ordering::Relaxed);
        Ok(Some(oldest))
    }

    /// Seed a camera's buffer from files a previous process left in the
    /// store. Retention applies immediately, so stale surplus is evicted.
    pub async fn seed(
        &self,
        camera_id: &str,
        listed: Vec<ListedSegment>,
        chunk: Duration,
    ) -> Result<usize, BufferError> {
        let mut recovered = 0;
        for entry in listed {
            let segment = Segment::new(
                camera_id,
                entry.start_time,
                chunk,
                entry.path,
                entry.size_bytes,
            );
            if self.append(segment).await? == AppendOutcome::Appended {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(
                "Recovered {} surviving segments for {}",
                recovered, camera_id
            );
        }
        Ok(recovered)
    }

    /// Per-camera status, in stable camera order
    pub async fn status(&self) -> Vec<CameraBufferStatus> {
        let now = Utc::now();
        let cameras = self.cameras.read().await;
        cameras
            .iter()
            .map(|(camera_id, buffer)| CameraBufferStatus {
                camera_id: camera_id.clone(),
                segment_count: buffer.segments.len(),
                covered_seconds: buffer.covered().as_secs(),
                newest_age_seconds: buffer
                    .segments
                    .back()
                    .map(|s| s.age(now).as_secs_f64()),
                total_bytes: buffer.total_bytes(),
                gaps_recorded: buffer.gaps_recorded,
                oversized_flagged: buffer.oversized_flagged,
            })
            .collect()
    }

    /// Aggregate counters since startup
    pub fn stats(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            segments_appended: self.stats.segments_appended.load(Ordering::Relaxed),
            segments_evicted: self.stats.segments_evicted.load(Ordering::Relaxed),
            segments_dropped: self.stats.segments_dropped.load(Ordering::Relaxed),
            bytes_processed: self.stats.bytes_processed.load(Ordering::Relaxed),
        }
    }
}
