use crate::buffer::BufferIndex;
use crate::capture::{BackoffState, CaptureWorker, WorkerState};
use crate::clip::ClipAssembler;
use crate::config::ReconnectConfig;
use crate::error::CaptureError;
use crate::events::{EventBus, RollcamEvent};
use crate::store::SegmentStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health evaluation cadence
pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(10);

/// A worker is stalled when its newest segment is older than chunk × this
pub const STALL_FACTOR: u32 = 3;

/// Free-space floor on the memory-backed store, in percent
pub const STORAGE_FLOOR_PERCENT: f64 = 10.0;

/// A run longer than this resets the backoff attempt counter
pub const STABILITY_THRESHOLD: Duration = Duration::from_secs(30);

/// An encoder totally silent for this long is stalled even without segments
const HEARTBEAT_STALL_FACTOR: u32 = 6;

/// Clip pruning runs once per this many timer cycles (~1 hour at 10 s)
const CLIP_PRUNE_CYCLES: u32 = 360;

/// Clips older than this are pruned from the persistent directory
const CLIP_MAX_AGE_DAYS: u32 = 30;

/// Per-worker health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Producing segments; nothing to do
    Healthy,
    /// Process alive but segments not advancing
    Stalled,
    /// Not running, by request or terminal decision
    Inactive,
}

/// Next step for a worker in the `Failed`/`Backoff` states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedAction {
    /// Retry cap exhausted; give up on this camera
    Quarantine,
    /// No restart scheduled yet; compute the backoff delay
    Schedule,
    /// The scheduled delay has elapsed
    RestartNow,
    /// Scheduled but not yet due
    Wait,
}

/// Assess a running worker from its observable signals.
///
/// Fresh starts get a grace window of the same length as the stall
/// threshold; an encoder needs time to connect and cut its first segment.
pub fn assess_running(
    newest_segment_age: Option<Duration>,
    heartbeat_age: Option<Duration>,
    running_for: Duration,
    chunk: Duration,
) -> HealthVerdict {
    let stall_window = chunk * STALL_FACTOR;

    if running_for <= stall_window {
        return HealthVerdict::Healthy;
    }

    let segments_stalled = match newest_segment_age {
        Some(age) => age > stall_window,
        // Never produced a segment and past the grace window
        None => true,
    };
    if segments_stalled {
        return HealthVerdict::Stalled;
    }

    if let Some(age) = heartbeat_age {
        if age > chunk * HEARTBEAT_STALL_FACTOR {
            return HealthVerdict::Stalled;
        }
    }

    HealthVerdict::Healthy
}

/// Decide what to do with a failed worker
pub fn decide_failed_action(
    backoff: &BackoffState,
    policy: &ReconnectConfig,
    now: Instant,
) -> FailedAction {
    if backoff.exhausted(policy) {
        return FailedAction::Quarantine;
    }
    match backoff.next_attempt_at {
        None => FailedAction::Schedule,
        Some(due) if now >= due => FailedAction::RestartNow,
        Some(_) => FailedAction::Wait,
    }
}

/// Storage pressure status for the HTTP surface
#[derive(Debug, Clone, Serialize, Default)]
pub struct StorageStatus {
    pub free_percent: Option<f64>,
    pub pressure: bool,
}

/// Periodic health evaluator for all capture workers and global resource
/// pressure. Restarts failed encoders with bounded exponential backoff and
/// evicts round-robin under storage pressure.
pub struct ResilienceSupervisor {
    workers: Vec<Arc<CaptureWorker>>,
    index: Arc<BufferIndex>,
    store: SegmentStore,
    assembler: Arc<ClipAssembler>,
    events: EventBus,
    policy: ReconnectConfig,
    chunk: Duration,
    cancel: CancellationToken,
    gave_up: AtomicBool,
    storage: RwLock<StorageStatus>,
    pressure_cycles: AtomicU32,
    timer_cycles: AtomicU32,
}

impl ResilienceSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workers: Vec<Arc<CaptureWorker>>,
        index: Arc<BufferIndex>,
        store: SegmentStore,
        assembler: Arc<ClipAssembler>,
        events: EventBus,
        policy: ReconnectConfig,
        chunk: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workers,
            index,
            store,
            assembler,
            events,
            policy,
            chunk,
            cancel,
            gave_up: AtomicBool::new(false),
            storage: RwLock::new(StorageStatus::default()),
            pressure_cycles: AtomicU32::new(0),
            timer_cycles: AtomicU32::new(0),
        }
    }

    /// Whether every camera has been quarantined (exit code 2)
    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::SeqCst)
    }

    pub async fn storage_status(&self) -> StorageStatus {
        self.storage.read().await.clone()
    }

    /// Run the supervision loop until cancelled. Evaluates on the fixed
    /// interval, when the nearest scheduled restart comes due, and
    /// immediately on worker failure events.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Resilience supervisor running ({}s interval, stall factor {})",
            SUPERVISOR_INTERVAL.as_secs(),
            STALL_FACTOR
        );
        let mut failures = self.events.subscribe();
        let mut ticker = tokio::time::interval(SUPERVISOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let restart_in = self.nearest_restart_delay().await;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Supervisor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let cycles = self.timer_cycles.fetch_add(1, Ordering::Relaxed) + 1;
                    if cycles % CLIP_PRUNE_CYCLES == 0 {
                        if let Err(e) = self.assembler.prune_old_clips(CLIP_MAX_AGE_DAYS).await {
                            warn!("Clip pruning failed: {}", e);
                        }
                    }
                }
                _ = async {
                    match restart_in {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
                event = failures.recv() => {
                    match event {
                        Ok(RollcamEvent::WorkerStateChanged { state, .. })
                            if state == WorkerState::Failed.as_str() => {}
                        _ => continue,
                    }
                }
            }

            self.evaluate_workers().await;
            self.evaluate_storage().await;
        }
    }

    /// Delay until the nearest scheduled restart among failed workers
    async fn nearest_restart_delay(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut nearest: Option<Duration> = None;
        for worker in &self.workers {
            let shared = worker.shared();
            let state = shared.state().await;
            if state != WorkerState::Backoff && state != WorkerState::Failed {
                continue;
            }
            if let Some(due) = shared.backoff().await.next_attempt_at {
                let delay = due
                    .saturating_duration_since(now)
                    .max(Duration::from_millis(50));
                nearest = Some(match nearest {
                    Some(current) => current.min(delay),
                    None => delay,
                });
            }
        }
        nearest
    }

    async fn evaluate_workers(&self) {
        let now = Instant::now();
        let mut quarantined = 0usize;

        for worker in &self.workers {
            let shared = worker.shared();
            match shared.state().await {
                WorkerState::Running => {
                    let newest_age = match shared.last_segment_start().await {
                        Some(start) => {
                            let end = start
                                + chrono::Duration::from_std(self.chunk)
                                    .unwrap_or_else(|_| chrono::Duration::zero());
                            Some((Utc::now() - end).to_std().unwrap_or(Duration::ZERO))
                        }
                        None => None,
                    };
                    let heartbeat_age = shared.heartbeat_age().await;
                    let running_for = shared.running_for().await.unwrap_or(Duration::ZERO);

                    match assess_running(newest_age, heartbeat_age, running_for, self.chunk) {
                        HealthVerdict::Healthy => {
                            if running_for > STABILITY_THRESHOLD {
                                shared
                                    .with_backoff(|b| {
                                        if b.attempt > 0 {
                                            info!(
                                                "Worker {} stable for {:?}; resetting backoff",
                                                shared.camera_id, running_for
                                            );
                                            b.reset();
                                        }
                                    })
                                    .await;
                            }
                        }
                        HealthVerdict::Stalled => {
                            warn!(
                                "Worker {} stalled (newest segment age {:?}); terminating encoder",
                                shared.camera_id, newest_age
                            );
                            let _ = self.events.publish(RollcamEvent::SystemError {
                                component: "supervisor".to_string(),
                                error: CaptureError::Stalled {
                                    camera_id: shared.camera_id.clone(),
                                    age: newest_age.unwrap_or(running_for),
                                }
                                .to_string(),
                            });
                            worker.kill_stalled().await;
                        }
                        HealthVerdict::Inactive => {}
                    }
                }
                WorkerState::Failed | WorkerState::Backoff => {
                    let backoff = shared.backoff().await;
                    match decide_failed_action(&backoff, &self.policy, now) {
                        FailedAction::Quarantine => {
                            error!(
                                "Worker {} exceeded {} reconnect attempts; quarantining",
                                shared.camera_id, self.policy.max_attempts
                            );
                            let _ = self.events.publish(RollcamEvent::SystemError {
                                component: "supervisor".to_string(),
                                error: CaptureError::Quarantined {
                                    camera_id: shared.camera_id.clone(),
                                    attempts: backoff.attempt,
                                }
                                .to_string(),
                            });
                            shared.set_state(WorkerState::Quarantined, &self.events).await;
                            quarantined += 1;
                        }
                        FailedAction::Schedule => {
                            let delay = shared
                                .with_backoff(|b| b.schedule(&self.policy, now))
                                .await;
                            let attempt = shared.backoff().await.attempt;
                            info!(
                                "Scheduling restart for {} in {:?} (attempt {})",
                                shared.camera_id, delay, attempt
                            );
                            shared.set_state(WorkerState::Backoff, &self.events).await;
                        }
                        FailedAction::RestartNow => {
                            shared.with_backoff(|b| b.next_attempt_at = None).await;
                            info!("Restarting encoder for {}", shared.camera_id);
                            if let Err(e) = worker.start().await {
                                warn!(
                                    "Restart failed for {}: {}",
                                    shared.camera_id, e
                                );
                                shared.set_state(WorkerState::Failed, &self.events).await;
                            }
                        }
                        FailedAction::Wait => {}
                    }
                }
                WorkerState::Quarantined => quarantined += 1,
                WorkerState::Stopped => {}
                WorkerState::Starting => {}
            }
        }

        // Permanent failure of every camera means the process cannot fulfil
        // its purpose; request shutdown with the dedicated exit code.
        if !self.workers.is_empty()
            && quarantined == self.workers.len()
            && !self.gave_up.swap(true, Ordering::SeqCst)
        {
            error!("All cameras quarantined; giving up");
            let _ = self.events.publish(RollcamEvent::ShutdownRequested {
                timestamp: Utc::now(),
                reason: "all cameras permanently failed".to_string(),
            });
        }
    }

    async fn evaluate_storage(&self) {
        let free = match self.store.free_space_percent().await {
            Ok(free) => free,
            Err(e) => {
                debug!("Free space probe failed: {}", e);
                return;
            }
        };

        if free >= STORAGE_FLOOR_PERCENT {
            self.pressure_cycles.store(0, Ordering::Relaxed);
            let mut storage = self.storage.write().await;
            storage.free_percent = Some(free);
            storage.pressure = false;
            return;
        }

        let cycles = self.pressure_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if cycles > 1 {
            warn!(
                "Storage pressure persists ({} cycles): {:.1}% free",
                cycles, free
            );
        }
        let _ = self.events.publish(RollcamEvent::StoragePressure {
            free_percent: free,
            timestamp: Utc::now(),
        });

        {
            let mut storage = self.storage.write().await;
            storage.free_percent = Some(free);
            storage.pressure = true;
        }

        // Round-robin eviction: one oldest segment per camera per pass, no
        // camera priority, until the floor clears or buffers are empty.
        loop {
            let evicted = emergency_evict_pass(&self.index).await;
            if evicted == 0 {
                warn!("Storage pressure but no segments left to evict");
                break;
            }
            match self.store.free_space_percent().await {
                Ok(free) if free >= STORAGE_FLOOR_PERCENT => {
                    info!("Emergency eviction cleared pressure ({:.1}% free)", free);
                    let mut storage = self.storage.write().await;
                    storage.free_percent = Some(free);
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

/// Evict the oldest segment of each camera once, in stable camera order.
/// Returns how many segments were dropped.
pub async fn emergency_evict_pass(index: &BufferIndex) -> usize {
    let mut evicted = 0;
    for camera_id in index.camera_ids().await {
        match index.evict_oldest(&camera_id).await {
            Ok(Some(segment)) => {
                debug!(
                    "Emergency-evicted {} from {}",
                    segment.filename(),
                    camera_id
                );
                evicted += 1;
            }
            Ok(None) => {}
            Err(e) => warn!("Emergency eviction failed for {}: {}", camera_id, e),
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use chrono::TimeZone;
    use std::path::PathBuf;

    const CHUNK: Duration = Duration::from_secs(5);

    fn policy(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: 2,
            max_delay: 30,
            max_attempts,
        }
    }

    #[test]
    fn test_fresh_start_has_grace_window() {
        // No segments yet, but only just started: healthy
        let verdict = assess_running(None, None, Duration::from_secs(5), CHUNK);
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn test_no_segments_past_grace_is_stalled() {
        let verdict = assess_running(None, None, Duration::from_secs(20), CHUNK);
        assert_eq!(verdict, HealthVerdict::Stalled);
    }

    #[test]
    fn test_recent_segment_is_healthy() {
        let verdict = assess_running(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(1)),
            Duration::from_secs(120),
            CHUNK,
        );
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn test_old_segment_is_stalled() {
        // Newest segment 20s old against a 15s stall window
        let verdict = assess_running(
            Some(Duration::from_secs(20)),
            Some(Duration::from_secs(1)),
            Duration::from_secs(120),
            CHUNK,
        );
        assert_eq!(verdict, HealthVerdict::Stalled);
    }

    #[test]
    fn test_segment_age_boundary() {
        // Exactly at the threshold is still healthy; strictly past it stalls
        let at_threshold = assess_running(
            Some(CHUNK * STALL_FACTOR),
            None,
            Duration::from_secs(120),
            CHUNK,
        );
        assert_eq!(at_threshold, HealthVerdict::Healthy);

        let past = assess_running(
            Some(CHUNK * STALL_FACTOR + Duration::from_secs(1)),
            None,
            Duration::from_secs(120),
            CHUNK,
        );
        assert_eq!(past, HealthVerdict::Stalled);
    }

    #[test]
    fn test_silent_encoder_is_stalled() {
        // Segments fine is impossible with a dead heartbeat this old, but
        // the heartbeat rule alone must also trip
        let verdict = assess_running(
            Some(Duration::from_secs(1)),
            Some(CHUNK * HEARTBEAT_STALL_FACTOR + Duration::from_secs(1)),
            Duration::from_secs(120),
            CHUNK,
        );
        assert_eq!(verdict, HealthVerdict::Stalled);
    }

    #[test]
    fn test_failed_action_lifecycle() {
        let now = Instant::now();
        let mut backoff = BackoffState::new();

        // Fresh failure: schedule a restart
        assert_eq!(
            decide_failed_action(&backoff, &policy(0), now),
            FailedAction::Schedule
        );

        let delay = backoff.schedule(&policy(0), now);
        assert_eq!(delay.as_secs(), 2);

        // Not yet due
        assert_eq!(
            decide_failed_action(&backoff, &policy(0), now),
            FailedAction::Wait
        );

        // Due
        assert_eq!(
            decide_failed_action(&backoff, &policy(0), now + Duration::from_secs(3)),
            FailedAction::RestartNow
        );
    }

    #[test]
    fn test_failed_action_quarantine_after_cap() {
        let now = Instant::now();
        let mut backoff = BackoffState::new();
        for _ in 0..3 {
            backoff.schedule(&policy(3), now);
        }
        assert_eq!(
            decide_failed_action(&backoff, &policy(3), now),
            FailedAction::Quarantine
        );
        // Unbounded policy never quarantines
        assert_ne!(
            decide_failed_action(&backoff, &policy(0), now),
            FailedAction::Quarantine
        );
    }

    #[tokio::test]
    async fn test_emergency_evict_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let index = BufferIndex::new(store.clone(), Duration::from_secs(300));

        for camera in ["camera_1", "camera_2"] {
            index.register_camera(camera).await;
            store.ensure_camera_dir(camera).await.unwrap();
            for i in 0..3 {
                let start = Utc.timestamp_opt(i * 5, 0).unwrap();
                let path = store.path_for(camera, start);
                tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();
                index
                    .append(Segment::new(camera, start, CHUNK, path, 100))
                    .await
                    .unwrap();
            }
        }

        // One pass drops exactly one (the oldest) segment per camera
        let evicted = emergency_evict_pass(&index).await;
        assert_eq!(evicted, 2);
        for camera in ["camera_1", "camera_2"] {
            let snapshot = index.snapshot(camera).await.unwrap();
            assert_eq!(snapshot.len(), 2);
            assert_eq!(snapshot[0].start_time, Utc.timestamp_opt(5, 0).unwrap());
        }

        // Draining passes eventually return zero
        assert_eq!(emergency_evict_pass(&index).await, 2);
        assert_eq!(emergency_evict_pass(&index).await, 2);
        assert_eq!(emergency_evict_pass(&index).await, 0);
    }

    #[tokio::test]
    async fn test_emergency_evict_unlinks_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let index = BufferIndex::new(store.clone(), Duration::from_secs(300));
        index.register_camera("camera_1").await;
        store.ensure_camera_dir("camera_1").await.unwrap();

        let start = Utc.timestamp_opt(0, 0).unwrap();
        let path: PathBuf = store.path_for("camera_1", start);
        tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();
        index
            .append(Segment::new("camera_1", start, CHUNK, path.clone(), 100))
            .await
            .unwrap();

        emergency_evict_pass(&index).await;
        assert!(!path.exists());
    }
}
