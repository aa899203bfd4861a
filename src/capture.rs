use crate::buffer::BufferIndex;
use crate::config::{CameraConfig, EncoderConfig, ReconnectConfig, RtspTransport};
use crate::error::{CaptureError, Result, RollcamError};
use crate::events::{EventBus, RollcamEvent};
use crate::segment::Segment;
use crate::store::{ListedSegment, SegmentStore};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Directory polling cadence for segment observation
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a graceful encoder stop may take before escalating to SIGKILL
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls a file size must hold steady before the segment counts as closed
const STABLE_POLLS: u32 = 2;

/// Segments smaller than this are encoder artifacts, not video
const MIN_SEGMENT_BYTES: u64 = 1024;

/// The segmenter GOP math assumes this frame rate
const ASSUMED_FPS: u32 = 30;

/// Capture worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Failed,
    Backoff,
    Stopped,
    Quarantined,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Failed => "failed",
            WorkerState::Backoff => "backoff",
            WorkerState::Stopped => "stopped",
            WorkerState::Quarantined => "quarantined",
        }
    }
}

/// Exponential backoff bookkeeping for encoder restarts
#[derive(Debug, Clone)]
pub struct BackoffState {
    /// Restart attempts since the last stable run
    pub attempt: u32,
    /// Delay applied by the most recent schedule
    pub current_delay: Duration,
    /// Earliest instant the next restart may run
    pub next_attempt_at: Option<Instant>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            current_delay: Duration::ZERO,
            next_attempt_at: None,
        }
    }

    /// Compute the delay for the next restart: `min(initial · 2^attempt, max)`
    pub fn schedule(&mut self, policy: &ReconnectConfig, now: Instant) -> Duration {
        let exp = self.attempt.min(32);
        let delay_secs = policy
            .initial_delay
            .saturating_mul(1u64 << exp)
            .min(policy.max_delay);
        let delay = Duration::from_secs(delay_secs);
        self.attempt += 1;
        self.current_delay = delay;
        self.next_attempt_at = Some(now + delay);
        delay
    }

    /// Whether the retry cap is exhausted (0 retries forever)
    pub fn exhausted(&self, policy: &ReconnectConfig) -> bool {
        policy.max_attempts > 0 && self.attempt >= policy.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = Duration::ZERO;
        self.next_attempt_at = None;
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between a worker's tasks, the supervisor, and the HTTP
/// status surface
pub struct WorkerShared {
    pub camera_id: String,
    state: RwLock<WorkerState>,
    stop_request: RwLock<Option<WorkerState>>,
    pid: RwLock<Option<u32>>,
    last_heartbeat: RwLock<Option<Instant>>,
    last_segment_start: RwLock<Option<DateTime<Utc>>>,
    running_since: RwLock<Option<Instant>>,
    backoff: RwLock<BackoffState>,
}

impl WorkerShared {
    fn new(camera_id: String) -> Self {
        Self {
            camera_id,
            state: RwLock::new(WorkerState::Stopped),
            stop_request: RwLock::new(None),
            pid: RwLock::new(None),
            last_heartbeat: RwLock::new(None),
            last_segment_start: RwLock::new(None),
            running_since: RwLock::new(None),
            backoff: RwLock::new(BackoffState::new()),
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: WorkerState, events: &EventBus) {
        let mut current = self.state.write().await;
        if *current == state {
            return;
        }
        debug!(
            "Worker {} state: {} -> {}",
            self.camera_id,
            current.as_str(),
            state.as_str()
        );
        *current = state;
        let _ = events.publish(RollcamEvent::WorkerStateChanged {
            camera_id: self.camera_id.clone(),
            state: state.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }

    pub async fn touch_heartbeat(&self) {
        *self.last_heartbeat.write().await = Some(Instant::now());
    }

    pub async fn heartbeat_age(&self) -> Option<Duration> {
        self.last_heartbeat.read().await.map(|t| t.elapsed())
    }

    pub async fn record_segment(&self, start: DateTime<Utc>) {
        *self.last_segment_start.write().await = Some(start);
        self.touch_heartbeat().await;
    }

    pub async fn last_segment_start(&self) -> Option<DateTime<Utc>> {
        *self.last_segment_start.read().await
    }

    pub async fn running_for(&self) -> Option<Duration> {
        self.running_since.read().await.map(|t| t.elapsed())
    }

    pub async fn backoff(&self) -> BackoffState {
        self.backoff.read().await.clone()
    }

    pub async fn with_backoff<R>(&self, f: impl FnOnce(&mut BackoffState) -> R) -> R {
        let mut backoff = self.backoff.write().await;
        f(&mut backoff)
    }

    async fn pid(&self) -> Option<u32> {
        *self.pid.read().await
    }
}

/// One capture worker per camera. Spawns and owns the encoder subprocess,
/// observes the store for closed segments, and publishes them into the
/// buffer index.
pub struct CaptureWorker {
    camera: CameraConfig,
    transport: RtspTransport,
    encoder: EncoderConfig,
    chunk: Duration,
    store: SegmentStore,
    index: Arc<BufferIndex>,
    events: EventBus,
    shared: Arc<WorkerShared>,
    cancel: CancellationToken,
    monitor_started: AtomicBool,
}

impl CaptureWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: CameraConfig,
        transport: RtspTransport,
        encoder: EncoderConfig,
        chunk: Duration,
        store: SegmentStore,
        index: Arc<BufferIndex>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(WorkerShared::new(camera.camera_id.clone()));
        Self {
            camera,
            transport,
            encoder,
            chunk,
            store,
            index,
            events,
            shared,
            cancel,
            monitor_started: AtomicBool::new(false),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera.camera_id
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    /// Spawn the encoder subprocess. Idempotent while an encoder is live.
    /// The directory monitor starts on first call and survives encoder
    /// restarts, so segments written by an orphaned encoder are still
    /// observed after a worker crash-restart.
    pub async fn start(&self) -> Result<()> {
        match self.shared.state().await {
            WorkerState::Starting | WorkerState::Running => {
                debug!("Worker {} already running", self.camera.camera_id);
                return Ok(());
            }
            _ => {}
        }

        if let Err(e) = self.store.ensure_camera_dir(&self.camera.camera_id).await {
            self.shared
                .set_state(WorkerState::Failed, &self.events)
                .await;
            return Err(RollcamError::Storage(e));
        }

        self.shared
            .set_state(WorkerState::Starting, &self.events)
            .await;

        let args = build_encoder_args(
            &self.camera,
            self.transport,
            &self.encoder,
            self.chunk.as_secs() as u32,
            &self.store.output_template(&self.camera.camera_id),
        );

        info!(
            "Starting encoder for {}: ffmpeg {} ...",
            self.camera.camera_id,
            args[..8.min(args.len())].join(" ")
        );

        let mut cmd = Command::new("ffmpeg");
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so termination reliably reaps the encoder even
        // after an abnormal worker exit.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // The supervisor schedules the retry from the Failed state
                self.shared
                    .set_state(WorkerState::Failed, &self.events)
                    .await;
                return Err(CaptureError::EncoderSpawn {
                    camera_id: self.camera.camera_id.clone(),
                    details: e.to_string(),
                }
                .into());
            }
        };

        *self.shared.pid.write().await = child.id();
        *self.shared.running_since.write().await = Some(Instant::now());
        self.shared
            .set_state(WorkerState::Running, &self.events)
            .await;
        self.shared.touch_heartbeat().await;

        // Encoder stderr doubles as a liveness signal
        if let Some(stderr) = child.stderr.take() {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    shared.touch_heartbeat().await;
                    trace!("[ffmpeg {}] {}", shared.camera_id, line);
                }
            });
        }

        // Reap the child and publish the exit
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            *shared.pid.write().await = None;
            *shared.running_since.write().await = None;

            let requested = shared.stop_request.write().await.take();
            match requested {
                Some(final_state) => {
                    shared.set_state(final_state, &events).await;
                }
                None => {
                    let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                    warn!(
                        "Encoder for {} exited with status {}",
                        shared.camera_id, code
                    );
                    let _ = events.publish(RollcamEvent::SystemError {
                        component: "capture".to_string(),
                        error: CaptureError::EncoderExited {
                            camera_id: shared.camera_id.clone(),
                            status: code,
                        }
                        .to_string(),
                    });
                    shared.set_state(WorkerState::Failed, &events).await;
                }
            }
        });

        if !self.monitor_started.swap(true, Ordering::SeqCst) {
            self.spawn_monitor();
        }

        Ok(())
    }

    /// Graceful stop: SIGTERM to the encoder's process group, bounded wait,
    /// then SIGKILL. Half-written segments newer than the last closed one
    /// are removed.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown_encoder(WorkerState::Stopped).await;
        self.cleanup_partial_segments().await;
        Ok(())
    }

    /// Terminate a stalled encoder and leave the worker `Failed` so the
    /// supervisor schedules a restart.
    pub async fn kill_stalled(&self) {
        self.shutdown_encoder(WorkerState::Failed).await;
        self.cleanup_partial_segments().await;
    }

    async fn shutdown_encoder(&self, final_state: WorkerState) {
        let Some(pid) = self.shared.pid().await else {
            self.shared.set_state(final_state, &self.events).await;
            return;
        };

        info!(
            "Stopping encoder for {} (pid {})",
            self.camera.camera_id, pid
        );
        *self.shared.stop_request.write().await = Some(final_state);
        signal_process_group(pid, libc::SIGTERM);

        if !self.wait_until_reaped(GRACEFUL_STOP_TIMEOUT).await {
            warn!(
                "Encoder for {} ignored SIGTERM; escalating to SIGKILL",
                self.camera.camera_id
            );
            signal_process_group(pid, libc::SIGKILL);
            if !self.wait_until_reaped(Duration::from_secs(2)).await {
                // The reaper task did not observe the exit; force the state
                // so shutdown cannot hang on a zombie.
                error!(
                    "Encoder for {} not reaped after SIGKILL",
                    self.camera.camera_id
                );
                let _ = self.shared.stop_request.write().await.take();
                self.shared.set_state(final_state, &self.events).await;
            }
        }
    }

    async fn wait_until_reaped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.shared.pid().await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.shared.pid().await.is_none()
    }

    /// Remove half-written segment files newer than the last closed segment
    async fn cleanup_partial_segments(&self) {
        let newest_closed = self.index.newest_start(&self.camera.camera_id).await;
        let listed = match self.store.list(&self.camera.camera_id).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(
                    "Partial cleanup scan failed for {}: {}",
                    self.camera.camera_id, e
                );
                return;
            }
        };

        for entry in partial_segments(&listed, newest_closed) {
            debug!(
                "Removing half-written segment {} for {}",
                entry.path.display(),
                self.camera.camera_id
            );
            let _ = self.store.remove(&entry.path).await;
        }
    }

    /// Start the directory observer that detects closed segments and appends
    /// them to the buffer index
    fn spawn_monitor(&self) {
        let camera_id = self.camera.camera_id.clone();
        let store = self.store.clone();
        let index = Arc::clone(&self.index);
        let events = self.events.clone();
        let shared = Arc::clone(&self.shared);
        let chunk = self.chunk;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut tracker = SegmentTracker::new();
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Segment monitor for {} stopping", camera_id);
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let listed = match store.list(&camera_id).await {
                    Ok(listed) => listed,
                    Err(e) => {
                        warn!("Segment scan failed for {}: {}", camera_id, e);
                        continue;
                    }
                };

                for closed in tracker.observe(&listed) {
                    if closed.size_bytes < MIN_SEGMENT_BYTES {
                        debug!(
                            "Skipping undersized segment {} ({} bytes)",
                            closed.path.display(),
                            closed.size_bytes
                        );
                        continue;
                    }

                    let segment = Segment::new(
                        camera_id.clone(),
                        closed.start_time,
                        chunk,
                        closed.path.clone(),
                        closed.size_bytes,
                    );

                    match index.append(segment).await {
                        Ok(_) => {
                            shared.record_segment(closed.start_time).await;
                            let _ = events.publish(RollcamEvent::SegmentRecorded {
                                camera_id: camera_id.clone(),
                                start_time: closed.start_time,
                                size_bytes: closed.size_bytes,
                            });
                        }
                        Err(e) => {
                            warn!("Failed to append segment for {}: {}", camera_id, e);
                        }
                    }
                }
            }
        });
    }
}

/// Build the ffmpeg argument list for clock-aligned segmented capture
pub fn build_encoder_args(
    camera: &CameraConfig,
    transport: RtspTransport,
    encoder: &EncoderConfig,
    chunk_seconds: u32,
    output_template: &std::path::Path,
) -> Vec<String> {
    let gop = encoder.keyframe_interval * ASSUMED_FPS;
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-y".to_string(),
        // RTSP input
        "-rtsp_transport".to_string(),
        transport.as_str().to_string(),
        "-i".to_string(),
        camera.url.clone(),
        // Video encode; keyframe cadence makes segment boundaries cuttable
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        encoder.preset.clone(),
        "-crf".to_string(),
        encoder.crf.to_string(),
        "-g".to_string(),
        gop.to_string(),
        "-keyint_min".to_string(),
        gop.to_string(),
        "-force_key_frames".to_string(),
        format!("expr:gte(t,n_forced*{})", encoder.keyframe_interval),
        // Audio
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        // Clock-aligned segmentation; %s expands to epoch seconds
        "-f".to_string(),
        "segment".to_string(),
        "-segment_time".to_string(),
        chunk_seconds.to_string(),
        "-segment_format".to_string(),
        "mp4".to_string(),
        "-segment_atclocktime".to_string(),
        "1".to_string(),
        "-strftime".to_string(),
        "1".to_string(),
        output_template.display().to_string(),
    ]
}

/// Send a signal to the encoder's process group
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: i32) {
    unsafe {
        libc::killpg(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _signal: i32) {}

/// Files newer than the last closed segment are half-written; with nothing
/// closed yet, everything on disk is
fn partial_segments(
    listed: &[ListedSegment],
    newest_closed: Option<DateTime<Utc>>,
) -> Vec<ListedSegment> {
    listed
        .iter()
        .filter(|entry| match newest_closed {
            Some(closed) => entry.start_time > closed,
            None => true,
        })
        .cloned()
        .collect()
}

/// Tracks observed segment files across polls and decides when a segment is
/// closed: a newer file exists, or its size held steady for two polls.
struct SegmentTracker {
    appended: HashSet<PathBuf>,
    pending: HashMap<PathBuf, (u64, u32)>,
}

impl SegmentTracker {
    fn new() -> Self {
        Self {
            appended: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    fn observe(&mut self, listed: &[ListedSegment]) -> Vec<ListedSegment> {
        let mut closed = Vec::new();
        let newest_start = listed.last().map(|s| s.start_time);

        for entry in listed {
            if self.appended.contains(&entry.path) {
                continue;
            }

            let has_newer = newest_start.is_some_and(|newest| newest > entry.start_time);
            if has_newer {
                self.pending.remove(&entry.path);
                self.appended.insert(entry.path.clone());
                closed.push(entry.clone());
                continue;
            }

            match self.pending.get_mut(&entry.path) {
                Some((size, stable)) if *size == entry.size_bytes => {
                    *stable += 1;
                    if *stable >= STABLE_POLLS {
                        self.pending.remove(&entry.path);
                        self.appended.insert(entry.path.clone());
                        closed.push(entry.clone());
                    }
                }
                Some((size, stable)) => {
                    *size = entry.size_bytes;
                    *stable = 0;
                }
                None => {
                    self.pending
                        .insert(entry.path.clone(), (entry.size_bytes, 0));
                }
            }
        }

        // Paths evicted from the store no longer need tracking
        let live: HashSet<_> = listed.iter().map(|s| s.path.clone()).collect();
        self.appended.retain(|p| live.contains(p));
        self.pending.retain(|p, _| live.contains(p));

        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(epoch: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch, 0).unwrap()
    }

    fn listed(epoch: i64, size: u64) -> ListedSegment {
        ListedSegment {
            start_time: at(epoch),
            path: PathBuf::from(format!("/buf/camera_1/{:010}.mp4", epoch)),
            size_bytes: size,
        }
    }

    fn test_camera() -> CameraConfig {
        CameraConfig {
            camera_id: "camera_1".to_string(),
            url: "rtsp://10.0.0.2:554/stream1".to_string(),
        }
    }

    fn test_encoder() -> EncoderConfig {
        EncoderConfig {
            keyframe_interval: 1,
            preset: "ultrafast".to_string(),
            crf: 23,
        }
    }

    #[test]
    fn test_encoder_args_shape() {
        let args = build_encoder_args(
            &test_camera(),
            RtspTransport::Tcp,
            &test_encoder(),
            5,
            std::path::Path::new("/dev/shm/video_buffer/camera_1/%s.mp4"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));
        assert!(joined.contains("-i rtsp://10.0.0.2:554/stream1"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-preset ultrafast"));
        assert!(joined.contains("-crf 23"));
        assert!(joined.contains("-force_key_frames expr:gte(t,n_forced*1)"));
        assert!(joined.contains("-segment_time 5"));
        assert!(joined.contains("-segment_atclocktime 1"));
        assert!(joined.contains("-strftime 1"));
        assert!(joined.ends_with("/dev/shm/video_buffer/camera_1/%s.mp4"));
    }

    #[test]
    fn test_encoder_args_transport_udp() {
        let args = build_encoder_args(
            &test_camera(),
            RtspTransport::Udp,
            &test_encoder(),
            5,
            std::path::Path::new("/tmp/%s.mp4"),
        );
        assert!(args.join(" ").contains("-rtsp_transport udp"));
    }

    #[test]
    fn test_tracker_newer_file_closes_predecessor() {
        let mut tracker = SegmentTracker::new();

        // Only one file: still growing, nothing closed
        let closed = tracker.observe(&[listed(0, 100)]);
        assert!(closed.is_empty());

        // A newer file appears: predecessor closes immediately
        let closed = tracker.observe(&[listed(0, 150), listed(5, 20)]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].start_time, at(0));
        assert_eq!(closed[0].size_bytes, 150);
    }

    #[test]
    fn test_tracker_stable_size_closes_tail() {
        let mut tracker = SegmentTracker::new();

        assert!(tracker.observe(&[listed(0, 100)]).is_empty());
        assert!(tracker.observe(&[listed(0, 100)]).is_empty());
        // Third poll with the same size: two stable intervals observed
        let closed = tracker.observe(&[listed(0, 100)]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].start_time, at(0));
    }

    #[test]
    fn test_tracker_growth_resets_stability() {
        let mut tracker = SegmentTracker::new();

        assert!(tracker.observe(&[listed(0, 100)]).is_empty());
        assert!(tracker.observe(&[listed(0, 100)]).is_empty());
        // Grew again: stability counter restarts
        assert!(tracker.observe(&[listed(0, 200)]).is_empty());
        assert!(tracker.observe(&[listed(0, 200)]).is_empty());
        let closed = tracker.observe(&[listed(0, 200)]);
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_tracker_does_not_reclose() {
        let mut tracker = SegmentTracker::new();

        tracker.observe(&[listed(0, 100), listed(5, 20)]);
        // Same listing again: the closed segment is not re-emitted
        let closed = tracker.observe(&[listed(0, 100), listed(5, 20)]);
        assert!(closed.is_empty());
    }

    #[test]
    fn test_tracker_handles_eviction() {
        let mut tracker = SegmentTracker::new();

        tracker.observe(&[listed(0, 100), listed(5, 20)]);
        // Segment 0 evicted from the store; tracker forgets it
        let closed = tracker.observe(&[listed(5, 20), listed(10, 30)]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].start_time, at(5));
        assert!(!tracker.appended.contains(&listed(0, 0).path));
    }

    #[test]
    fn test_tracker_closes_multiple_backlogged() {
        // A worker restart can find several already-closed segments at once
        let mut tracker = SegmentTracker::new();
        let closed = tracker.observe(&[listed(0, 100), listed(5, 110), listed(10, 10)]);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].start_time, at(0));
        assert_eq!(closed[1].start_time, at(5));
    }

    #[test]
    fn test_partial_segment_selection() {
        let files = vec![listed(0, 100), listed(5, 100), listed(10, 40)];

        let partials = partial_segments(&files, Some(at(5)));
        assert_eq!(partials.len(), 1);
        assert_eq!(partials[0].start_time, at(10));

        // Nothing ever closed: everything is half-written
        let partials = partial_segments(&files, None);
        assert_eq!(partials.len(), 3);

        let partials = partial_segments(&files, Some(at(10)));
        assert!(partials.is_empty());
    }

    #[test]
    fn test_backoff_monotonicity() {
        let policy = ReconnectConfig {
            initial_delay: 2,
            max_delay: 30,
            max_attempts: 0,
        };
        let mut backoff = BackoffState::new();
        let now = Instant::now();

        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.schedule(&policy, now).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.attempt, 6);
    }

    #[test]
    fn test_backoff_reset() {
        let policy = ReconnectConfig {
            initial_delay: 2,
            max_delay: 30,
            max_attempts: 0,
        };
        let mut backoff = BackoffState::new();
        let now = Instant::now();

        backoff.schedule(&policy, now);
        backoff.schedule(&policy, now);
        backoff.reset();
        assert_eq!(backoff.attempt, 0);
        assert!(backoff.next_attempt_at.is_none());
        assert_eq!(backoff.schedule(&policy, now).as_secs(), 2);
    }

    #[test]
    fn test_backoff_exhaustion() {
        let unbounded = ReconnectConfig {
            initial_delay: 2,
            max_delay: 30,
            max_attempts: 0,
        };
        let capped = ReconnectConfig {
            initial_delay: 2,
            max_delay: 30,
            max_attempts: 3,
        };
        let mut backoff = BackoffState::new();
        let now = Instant::now();

        for _ in 0..10 {
            backoff.schedule(&unbounded, now);
        }
        assert!(!backoff.exhausted(&unbounded));
        assert!(backoff.exhausted(&capped));
    }

    #[test]
    fn test_backoff_no_overflow_at_high_attempts() {
        let policy = ReconnectConfig {
            initial_delay: 2,
            max_delay: 30,
            max_attempts: 0,
        };
        let mut backoff = BackoffState::new();
        backoff.attempt = 1000;
        let delay = backoff.schedule(&policy, Instant::now());
        assert_eq!(delay.as_secs(), 30);
    }

    #[test]
    fn test_worker_state_strings() {
        assert_eq!(WorkerState::Running.as_str(), "running");
        assert_eq!(WorkerState::Backoff.as_str(), "backoff");
        assert_eq!(WorkerState::Quarantined.as_str(), "quarantined");
    }

    #[tokio::test]
    async fn test_worker_shared_transitions() {
        let events = EventBus::new(8);
        let shared = WorkerShared::new("camera_1".to_string());
        assert_eq!(shared.state().await, WorkerState::Stopped);

        let mut receiver = events.subscribe();
        shared.set_state(WorkerState::Starting, &events).await;
        assert_eq!(shared.state().await, WorkerState::Starting);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "worker_state_changed");

        // Setting the same state again publishes nothing
        shared.set_state(WorkerState::Starting, &events).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_worker_shared_heartbeat_and_segment() {
        let shared = WorkerShared::new("camera_1".to_string());
        assert!(shared.heartbeat_age().await.is_none());
        assert!(shared.last_segment_start().await.is_none());

        shared.record_segment(at(100)).await;
        assert_eq!(shared.last_segment_start().await, Some(at(100)));
        assert!(shared.heartbeat_age().await.unwrap() < Duration::from_secs(1));
    }
}
