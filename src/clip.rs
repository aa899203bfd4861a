use crate::buffer::BufferIndex;
use crate::config::EncoderConfig;
use crate::error::ClipError;
use crate::events::{EventBus, RollcamEvent};
use crate::segment::Segment;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Subprocess runtime is bounded by clip duration times this factor
const CLIP_TIMEOUT_FACTOR: u64 = 4;

/// Floor for the subprocess timeout regardless of clip length
const CLIP_TIMEOUT_MIN: Duration = Duration::from_secs(60);

/// Duration verification assumes this frame rate for the one-frame tolerance
const ASSUMED_FPS: f64 = 30.0;

/// A resolved clip plan: which segments to use and how to cut them.
///
/// The fast path applies when the requested interval lands exactly on
/// segment boundaries; everything is then byte-concatenated with no decode.
/// Otherwise only the partial edge segments are re-encoded and the interior
/// is stream-copied.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipPlan {
    pub camera_id: String,
    pub target_start: DateTime<Utc>,
    pub anchor_end: DateTime<Utc>,
    /// Minimal contiguous covering run, oldest first
    pub segments: Vec<Segment>,
    /// Offset into the first segment, when the cut starts mid-segment
    pub head_trim: Option<Duration>,
    /// Length to keep of the last segment, when the cut ends mid-segment
    pub tail_take: Option<Duration>,
}

impl ClipPlan {
    /// True when no re-encode is needed at either edge
    pub fn is_fast_path(&self) -> bool {
        self.head_trim.is_none() && self.tail_take.is_none()
    }
}

/// Select the minimal contiguous segment run covering the requested window.
///
/// The anchor end is the end of the newest closed segment, clamped to the
/// request time so a clip never extends past the moment it was asked for.
pub fn plan_clip(
    camera_id: &str,
    snapshot: &[Segment],
    duration: Duration,
    request_time: DateTime<Utc>,
) -> Result<ClipPlan, ClipError> {
    let needed_seconds = duration.as_secs() as u32;
    let insufficient = |available: Duration| ClipError::InsufficientBuffer {
        camera_id: camera_id.to_string(),
        needed_seconds,
        available_seconds: available.as_secs() as u32,
    };

    let Some(newest) = snapshot.last() else {
        return Err(insufficient(Duration::ZERO));
    };

    let anchor_end = newest.end_time().min(request_time);
    let target_start =
        anchor_end - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());

    // Last segment that actually covers part of the window
    let Some(j) = snapshot
        .iter()
        .rposition(|s| s.start_time < anchor_end)
    else {
        return Err(insufficient(Duration::ZERO));
    };

    // Walk backwards to the segment containing the target start, requiring
    // contiguity; a gap inside the window means no covering run exists.
    let mut i = j;
    while snapshot[i].start_time > target_start {
        if i == 0 {
            let covered = contiguous_tail_covered(&snapshot[..=j]);
            return Err(insufficient(covered));
        }
        if !snapshot[i - 1].is_contiguous_with(&snapshot[i]) {
            let covered = contiguous_tail_covered(&snapshot[..=j]);
            return Err(insufficient(covered));
        }
        i -= 1;
    }

    let segments: Vec<Segment> = snapshot[i..=j].to_vec();
    let first = &segments[0];
    let last = segments.last().unwrap();

    let head_trim = if first.start_time == target_start {
        None
    } else {
        Some(
            (target_start - first.start_time)
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    };
    let tail_take = if last.end_time() == anchor_end {
        None
    } else {
        Some(
            (anchor_end - last.start_time)
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    };

    Ok(ClipPlan {
        camera_id: camera_id.to_string(),
        target_start,
        anchor_end,
        segments,
        head_trim,
        tail_take,
    })
}

/// Covered duration of the contiguous run ending at the newest segment
fn contiguous_tail_covered(snapshot: &[Segment]) -> Duration {
    let mut covered = Duration::ZERO;
    for idx in (0..snapshot.len()).rev() {
        covered += snapshot[idx].duration;
        if idx > 0 && !snapshot[idx - 1].is_contiguous_with(&snapshot[idx]) {
            break;
        }
    }
    covered
}

/// Canonical clip filename: `<camera_id>_<UTC-timestamp>Z.mp4`
pub fn clip_filename(camera_id: &str, request_time: DateTime<Utc>) -> String {
    format!(
        "{}_{}Z.mp4",
        camera_id,
        request_time.format("%Y%m%d_%H%M%S")
    )
}

/// Whether a measured container duration is within one frame interval of the
/// requested length
pub fn duration_within_tolerance(actual: f64, requested: Duration) -> bool {
    (actual - requested.as_secs_f64()).abs() <= 1.0 / ASSUMED_FPS + 1e-3
}

fn clip_timeout(duration: Duration) -> Duration {
    CLIP_TIMEOUT_MIN.max(duration * CLIP_TIMEOUT_FACTOR as u32)
}

/// Per-camera result of an ALL fan-out
#[derive(Debug)]
pub struct CameraClipResult {
    pub camera_id: String,
    pub result: Result<PathBuf, ClipError>,
}

/// Clip generation statistics for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct ClipStatsSnapshot {
    pub clips_generated: u64,
    pub clips_failed: u64,
    pub total_processing_seconds: f64,
    pub average_processing_seconds: f64,
}

#[derive(Debug, Default)]
struct ClipStats {
    generated: AtomicU64,
    failed: AtomicU64,
    processing_ms: AtomicU64,
}

/// Assembles exact-duration clips from buffer snapshots.
///
/// Reads segment files concurrently with possible eviction: a vanished file
/// triggers one retry from a fresh snapshot before surfacing as
/// `InsufficientBuffer`.
pub struct ClipAssembler {
    index: Arc<BufferIndex>,
    clips_dir: PathBuf,
    encoder: EncoderConfig,
    default_duration: u32,
    events: EventBus,
    stats: ClipStats,
}

impl ClipAssembler {
    pub fn new(
        index: Arc<BufferIndex>,
        clips_dir: PathBuf,
        encoder: EncoderConfig,
        default_duration: u32,
        events: EventBus,
    ) -> Self {
        Self {
            index,
            clips_dir,
            encoder,
            default_duration,
            events,
            stats: ClipStats::default(),
        }
    }

    pub fn default_duration(&self) -> u32 {
        self.default_duration
    }

    /// Assemble a clip for one camera. `duration_s` falls back to the
    /// configured default; `deadline` aborts the whole operation when set.
    pub async fn assemble(
        &self,
        camera_id: &str,
        duration_s: Option<u32>,
        request_time: DateTime<Utc>,
        deadline: Option<Duration>,
    ) -> Result<PathBuf, ClipError> {
        let duration_s = duration_s.unwrap_or(self.default_duration);
        let duration = Duration::from_secs(duration_s as u64);
        let started = Instant::now();

        let work = self.assemble_inner(camera_id, duration, request_time);
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(ClipError::Timeout {
                    camera_id: camera_id.to_string(),
                    timeout: deadline,
                }),
            },
            None => work.await,
        };

        match &result {
            Ok(path) => {
                let elapsed = started.elapsed();
                self.stats.generated.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .processing_ms
                    .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
                info!(
                    "Clip for {} saved to {} in {:.2}s",
                    camera_id,
                    path.display(),
                    elapsed.as_secs_f64()
                );
                let _ = self.events.publish(RollcamEvent::ClipSaved {
                    camera_id: camera_id.to_string(),
                    path: path.display().to_string(),
                    duration_seconds: duration_s,
                });
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let _ = self.events.publish(RollcamEvent::ClipFailed {
                    camera_id: camera_id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        result
    }

    /// Fan a request out to every registered camera, reporting per-camera
    /// results independently.
    pub async fn assemble_all(
        self: Arc<Self>,
        duration_s: Option<u32>,
        request_time: DateTime<Utc>,
    ) -> Vec<CameraClipResult> {
        let cameras = self.index.camera_ids().await;
        let mut handles = Vec::with_capacity(cameras.len());

        for camera_id in cameras {
            let assembler = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let result = assembler
                    .assemble(&camera_id, duration_s, request_time, None)
                    .await;
                CameraClipResult { camera_id, result }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(result) = handle.await {
                results.push(result);
            }
        }
        results
    }

    async fn assemble_inner(
        &self,
        camera_id: &str,
        duration: Duration,
        request_time: DateTime<Utc>,
    ) -> Result<PathBuf, ClipError> {
        let mut last_missing: Option<String> = None;

        for attempt in 0..2 {
            let snapshot = self.index.snapshot(camera_id).await.map_err(|_| {
                ClipError::InsufficientBuffer {
                    camera_id: camera_id.to_string(),
                    needed_seconds: duration.as_secs() as u32,
                    available_seconds: 0,
                }
            })?;

            let plan = plan_clip(camera_id, &snapshot, duration, request_time)?;
            debug!(
                "Clip plan for {}: {} segments, {} path, window {} .. {}",
                camera_id,
                plan.segments.len(),
                if plan.is_fast_path() { "fast" } else { "slow" },
                plan.target_start,
                plan.anchor_end
            );

            match self.execute(&plan, duration, request_time).await {
                Ok(path) => return Ok(path),
                Err(ClipError::SegmentMissing { path }) => {
                    warn!(
                        "Segment vanished during clip assembly for {} (attempt {}): {}",
                        camera_id,
                        attempt + 1,
                        path
                    );
                    last_missing = Some(path);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        // Two passes lost a segment each time; the window is not coverable
        debug!(
            "Giving up on {} after repeated eviction ({:?})",
            camera_id, last_missing
        );
        Err(ClipError::InsufficientBuffer {
            camera_id: camera_id.to_string(),
            needed_seconds: duration.as_secs() as u32,
            available_seconds: 0,
        })
    }

    async fn execute(
        &self,
        plan: &ClipPlan,
        duration: Duration,
        request_time: DateTime<Utc>,
    ) -> Result<PathBuf, ClipError> {
        // Eviction may have unlinked files the snapshot still names
        for segment in &plan.segments {
            if !tokio::fs::try_exists(&segment.path).await.unwrap_or(false) {
                return Err(ClipError::SegmentMissing {
                    path: segment.path.display().to_string(),
                });
            }
        }

        let scratch = tempfile::tempdir().map_err(|e| ClipError::FfmpegFailed {
            stage: "workspace".to_string(),
            status: -1,
            stderr: e.to_string(),
        })?;

        tokio::fs::create_dir_all(&self.clips_dir)
            .await
            .map_err(|e| ClipError::FfmpegFailed {
                stage: "workspace".to_string(),
                status: -1,
                stderr: e.to_string(),
            })?;

        let staging = self
            .clips_dir
            .join(format!(".{}.part", clip_filename(&plan.camera_id, request_time)));
        let timeout = clip_timeout(duration);

        if plan.is_fast_path() {
            let paths: Vec<&Path> = plan.segments.iter().map(|s| s.path.as_path()).collect();
            self.concat_copy(&plan.camera_id, &paths, scratch.path(), &staging, timeout)
                .await?;
        } else if plan.segments.len() == 1 {
            // Single segment covering the whole window: one trim pass
            let offset = plan.head_trim.unwrap_or(Duration::ZERO);
            self.trim_reencode(
                &plan.camera_id,
                &plan.segments[0].path,
                Some(offset),
                Some(duration),
                &staging,
                timeout,
            )
            .await?;
        } else {
            // Re-encode only the partial edges; stream-copy the interior
            let mut parts: Vec<PathBuf> = Vec::with_capacity(plan.segments.len());

            if let Some(offset) = plan.head_trim {
                let head = scratch.path().join("head.mp4");
                self.trim_reencode(
                    &plan.camera_id,
                    &plan.segments[0].path,
                    Some(offset),
                    None,
                    &head,
                    timeout,
                )
                .await?;
                parts.push(head);
            } else {
                parts.push(plan.segments[0].path.clone());
            }

            for segment in &plan.segments[1..plan.segments.len() - 1] {
                parts.push(segment.path.clone());
            }

            let last = plan.segments.last().unwrap();
            if let Some(take) = plan.tail_take {
                let tail = scratch.path().join("tail.mp4");
                self.trim_reencode(
                    &plan.camera_id,
                    &last.path,
                    None,
                    Some(take),
                    &tail,
                    timeout,
                )
                .await?;
                parts.push(tail);
            } else {
                parts.push(last.path.clone());
            }

            let paths: Vec<&Path> = parts.iter().map(|p| p.as_path()).collect();
            self.concat_copy(&plan.camera_id, &paths, scratch.path(), &staging, timeout)
                .await?;
        }

        // Verify the container-reported duration against the request
        let actual = self.probe_duration(&plan.camera_id, &staging, timeout).await?;
        if !duration_within_tolerance(actual, duration) {
            warn!(
                "Clip for {} measured {:.3}s against requested {}s; falling back to full re-encode",
                plan.camera_id,
                actual,
                duration.as_secs()
            );
            self.full_reencode_fallback(plan, duration, scratch.path(), &staging, timeout)
                .await?;

            let actual = self.probe_duration(&plan.camera_id, &staging, timeout).await?;
            if !duration_within_tolerance(actual, duration) {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(ClipError::DurationMismatch {
                    requested: duration.as_secs() as u32,
                    actual,
                });
            }
        }

        // Atomic rename into the clips directory under the canonical name
        let final_path = self.clips_dir.join(clip_filename(&plan.camera_id, request_time));
        tokio::fs::rename(&staging, &final_path)
            .await
            .map_err(|e| ClipError::FfmpegFailed {
                stage: "rename".to_string(),
                status: -1,
                stderr: e.to_string(),
            })?;

        Ok(final_path)
    }

    /// Byte-concatenate inputs through the concat demuxer in stream-copy mode
    async fn concat_copy(
        &self,
        camera_id: &str,
        inputs: &[&Path],
        scratch: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), ClipError> {
        let list_path = scratch.join("concat.txt");
        let mut list = String::new();
        for input in inputs {
            list.push_str(&format!("file '{}'\n", input.display()));
        }
        let mut file = tokio::fs::File::create(&list_path).await.map_err(|e| {
            ClipError::FfmpegFailed {
                stage: "concat-list".to_string(),
                status: -1,
                stderr: e.to_string(),
            }
        })?;
        file.write_all(list.as_bytes())
            .await
            .map_err(|e| ClipError::FfmpegFailed {
                stage: "concat-list".to_string(),
                status: -1,
                stderr: e.to_string(),
            })?;
        file.flush().await.ok();

        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_path.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            output.display().to_string(),
        ];

        run_ffmpeg(camera_id, "concat", args, timeout).await
    }

    /// Re-encode a partial segment: from `offset` (when set) for `length`
    /// (when set), preserving the capture encoder settings
    async fn trim_reencode(
        &self,
        camera_id: &str,
        input: &Path,
        offset: Option<Duration>,
        length: Option<Duration>,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), ClipError> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
        ];
        // Output-side seek decodes up to the cut, which keeps it frame-exact
        if let Some(offset) = offset {
            args.push("-ss".to_string());
            args.push(format!("{:.3}", offset.as_secs_f64()));
        }
        if let Some(length) = length {
            args.push("-t".to_string());
            args.push(format!("{:.3}", length.as_secs_f64()));
        }
        args.extend([
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.encoder.preset.clone(),
            "-crf".to_string(),
            self.encoder.crf.to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            output.display().to_string(),
        ]);

        run_ffmpeg(camera_id, "trim", args, timeout).await
    }

    /// Last resort: concatenate everything, then cut the exact window in a
    /// single re-encode pass
    async fn full_reencode_fallback(
        &self,
        plan: &ClipPlan,
        duration: Duration,
        scratch: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), ClipError> {
        let joined = scratch.join("joined.mp4");
        let paths: Vec<&Path> = plan.segments.iter().map(|s| s.path.as_path()).collect();
        self.concat_copy(&plan.camera_id, &paths, scratch, &joined, timeout)
            .await?;

        let offset = (plan.target_start - plan.segments[0].start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.trim_reencode(
            &plan.camera_id,
            &joined,
            Some(offset),
            Some(duration),
            output,
            timeout,
        )
        .await
    }

    /// Container-reported duration in seconds
    async fn probe_duration(
        &self,
        camera_id: &str,
        path: &Path,
        timeout: Duration,
    ) -> Result<f64, ClipError> {
        let mut cmd = Command::new("ffprobe");
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ClipError::FfmpegFailed {
            stage: "probe".to_string(),
            status: -1,
            stderr: e.to_string(),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ClipError::FfmpegFailed {
                    stage: "probe".to_string(),
                    status: -1,
                    stderr: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ClipError::Timeout {
                    camera_id: camera_id.to_string(),
                    timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ClipError::FfmpegFailed {
                stage: "probe".to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: tail_of(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|e| ClipError::FfmpegFailed {
                stage: "probe".to_string(),
                status: -1,
                stderr: format!("unparseable duration: {}", e),
            })
    }

    /// Remove clips older than `max_age_days` from the clips directory
    pub async fn prune_old_clips(&self, max_age_days: u32) -> std::io::Result<(u64, u64)> {
        let cutoff = std::time::SystemTime::now()
            - Duration::from_secs(max_age_days as u64 * 24 * 60 * 60);
        let mut removed = 0u64;
        let mut bytes_freed = 0u64;

        let mut entries = match tokio::fs::read_dir(&self.clips_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(crate::segment::SEGMENT_EXT) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if modified < cutoff {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                    bytes_freed += metadata.len();
                    debug!("Pruned old clip {}", path.display());
                }
            }
        }

        if removed > 0 {
            info!(
                "Pruned {} old clips ({} bytes) past {} days",
                removed, bytes_freed, max_age_days
            );
        }
        Ok((removed, bytes_freed))
    }

    pub fn stats(&self) -> ClipStatsSnapshot {
        let generated = self.stats.generated.load(Ordering::Relaxed);
        let total_ms = self.stats.processing_ms.load(Ordering::Relaxed);
        ClipStatsSnapshot {
            clips_generated: generated,
            clips_failed: self.stats.failed.load(Ordering::Relaxed),
            total_processing_seconds: total_ms as f64 / 1000.0,
            average_processing_seconds: if generated > 0 {
                (total_ms as f64 / 1000.0) / generated as f64
            } else {
                0.0
            },
        }
    }
}

async fn run_ffmpeg(
    camera_id: &str,
    stage: &str,
    args: Vec<String>,
    timeout: Duration,
) -> Result<(), ClipError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| ClipError::FfmpegFailed {
        stage: stage.to_string(),
        status: -1,
        stderr: e.to_string(),
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ClipError::FfmpegFailed {
                stage: stage.to_string(),
                status: -1,
                stderr: e.to_string(),
            })
        }
        Err(_) => {
            return Err(ClipError::Timeout {
                camera_id: camera_id.to_string(),
                timeout,
            })
        }
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if stderr.contains("No such file or directory") {
        // A selected segment was evicted between planning and reading
        return Err(ClipError::SegmentMissing {
            path: stderr
                .lines()
                .find(|l| l.contains("No such file"))
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    Err(ClipError::FfmpegFailed {
        stage: stage.to_string(),
        status: output.status.code().unwrap_or(-1),
        stderr: tail_of(&stderr),
    })
}

fn tail_of(text: &str) -> String {
    const TAIL: usize = 500;
    if text.len() <= TAIL {
        return text.to_string();
    }
    let mut start = text.len() - TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
