use super::types::ComponentState;
use crate::buffer::BufferIndex;
use crate::capture::{CaptureWorker, WorkerShared};
use crate::clip::ClipAssembler;
use crate::config::{RollcamConfig, TriggerMode};
use crate::error::Result;
use crate::events::EventBus;
use crate::store::SegmentStore;
use crate::supervisor::ResilienceSupervisor;
use crate::trigger::{ClipRequest, HttpTrigger, KeyboardTrigger, TriggerState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const EVENT_BUS_CAPACITY: usize = 64;
const CLIP_REQUEST_QUEUE: usize = 16;

/// Lifecycle glue: builds every component from the configuration, starts
/// workers with staggered launch, wires the supervisor, dispatches trigger
/// events, and drives graceful shutdown.
pub struct RollcamOrchestrator {
    pub(super) config: RollcamConfig,
    pub(super) events: EventBus,
    pub(super) store: SegmentStore,
    pub(super) index: Arc<BufferIndex>,
    pub(super) workers: Vec<Arc<CaptureWorker>>,
    pub(super) assembler: Arc<ClipAssembler>,
    pub(super) supervisor: Arc<ResilienceSupervisor>,
    pub(super) keyboard: Option<KeyboardTrigger>,
    pub(super) http: Option<Arc<HttpTrigger>>,
    pub(super) requests: Option<mpsc::Receiver<ClipRequest>>,

    // Cancellation, scoped so triggers stop before capture does
    pub(super) cancel: CancellationToken,
    pub(super) trigger_cancel: CancellationToken,

    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
}

impl RollcamOrchestrator {
    /// Build all components. Directories are created here; a failure is a
    /// fatal startup error.
    pub fn new(config: RollcamConfig) -> Result<Self> {
        config.ensure_directories()?;

        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let cancel = CancellationToken::new();
        let trigger_cancel = cancel.child_token();

        let store = SegmentStore::new(&config.temp_dir);
        let index = Arc::new(BufferIndex::new(store.clone(), config.buffer_window()));

        let workers: Vec<Arc<CaptureWorker>> = config
            .cameras
            .iter()
            .map(|camera| {
                Arc::new(CaptureWorker::new(
                    camera.clone(),
                    config.rtsp_transport,
                    config.encoder.clone(),
                    config.chunk(),
                    store.clone(),
                    Arc::clone(&index),
                    events.clone(),
                    cancel.child_token(),
                ))
            })
            .collect();

        let assembler = Arc::new(ClipAssembler::new(
            Arc::clone(&index),
            config.clips_dir.clone(),
            config.encoder.clone(),
            config.final_clip_duration,
            events.clone(),
        ));

        let supervisor = Arc::new(ResilienceSupervisor::new(
            workers.clone(),
            Arc::clone(&index),
            store.clone(),
            Arc::clone(&assembler),
            events.clone(),
            config.reconnect.clone(),
            config.chunk(),
            cancel.child_token(),
        ));

        let (requests_tx, requests_rx) = mpsc::channel(CLIP_REQUEST_QUEUE);

        // Keyboard stays available in HTTP mode for local control
        let keyboard = Some(KeyboardTrigger::new(
            requests_tx,
            events.clone(),
            trigger_cancel.child_token(),
        ));

        let http = match config.trigger_mode {
            TriggerMode::Http => {
                let worker_shared: Vec<Arc<WorkerShared>> =
                    workers.iter().map(|w| w.shared()).collect();
                Some(Arc::new(HttpTrigger::new(
                    config.http_port,
                    TriggerState {
                        assembler: Arc::clone(&assembler),
                        index: Arc::clone(&index),
                        workers: Arc::new(worker_shared),
                        supervisor: Arc::clone(&supervisor),
                        chunk_seconds: config.chunk_duration,
                    },
                    trigger_cancel.child_token(),
                )))
            }
            TriggerMode::Keyboard => None,
        };

        Ok(Self {
            config,
            events,
            store,
            index,
            workers,
            assembler,
            supervisor,
            keyboard,
            http,
            requests: Some(requests_rx),
            cancel,
            trigger_cancel,
            component_states: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &RollcamConfig {
        &self.config
    }

    pub(super) async fn set_component_state(&self, component: &str, state: ComponentState) {
        let mut states = self.component_states.lock().await;
        states.insert(component.to_string(), state);
    }

    /// Current component states, for diagnostics
    pub async fn component_states(&self) -> HashMap<String, ComponentState> {
        self.component_states.lock().await.clone()
    }
}
