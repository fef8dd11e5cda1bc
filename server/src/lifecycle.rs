//! Worker lifecycle: versions, state transitions and cutover
//!
//! Each manifest version runs inside a [`ServiceWorker`] that moves through
//! `Installing → Waiting → Active → Redundant`. The [`WorkerRegistry`] owns
//! the active and waiting workers and decides when a waiting worker takes
//! over request handling.

use crate::precache::{
    ActivateReport, FetchRequest, FetchResponse, InstallReport, Network, PrecacheError, PrecacheManager,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Installing,
    Waiting,
    Active,
    Redundant,
    /// Install or activation failed; the worker never serves
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Installing => "installing",
            WorkerState::Waiting => "waiting",
            WorkerState::Active => "active",
            WorkerState::Redundant => "redundant",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inbound control messages
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate the waiting worker without waiting for sessions to close
    SkipWaiting,
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse a message payload; anything that is not a known message is `Unknown`
    pub fn parse(payload: &serde_json::Value) -> Self {
        ControlMessage::deserialize(payload).unwrap_or(ControlMessage::Unknown)
    }
}

/// Events the hosting platform delivers to a worker
#[derive(Debug)]
pub enum LifecycleEvent<'a> {
    Install,
    Activate,
    Fetch(&'a FetchRequest),
    Message(ControlMessage),
}

#[derive(Debug)]
pub enum EventResult {
    Installed(InstallReport),
    Activated(ActivateReport),
    Response(FetchResponse),
    MessageHandled,
}

/// One manifest version and its lifecycle state
#[derive(Debug)]
pub struct ServiceWorker {
    id: Uuid,
    version: String,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
    precache: PrecacheManager,
}

impl ServiceWorker {
    pub fn new(precache: PrecacheManager) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: precache.manifest().version(),
            state: Mutex::new(WorkerState::Installing),
            skip_waiting: AtomicBool::new(false),
            precache,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fingerprint of the manifest this worker serves
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> WorkerState {
        *lock_state(&self.state)
    }

    fn set_state(&self, state: WorkerState) {
        let mut current = lock_state(&self.state);
        debug!("Worker {} {} -> {}", self.id, *current, state);
        *current = state;
    }

    fn expect_state(&self, expected: WorkerState, operation: &'static str) -> Result<(), PrecacheError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(PrecacheError::InvalidState {
                worker: self.id.to_string(),
                operation,
                state,
            })
        }
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Run the handler for `event`
    pub async fn dispatch(&self, event: LifecycleEvent<'_>) -> Result<EventResult, PrecacheError> {
        match event {
            LifecycleEvent::Install => self.on_install().await.map(EventResult::Installed),
            LifecycleEvent::Activate => self.on_activate().await.map(EventResult::Activated),
            LifecycleEvent::Fetch(request) => self.on_fetch(request).await.map(EventResult::Response),
            LifecycleEvent::Message(message) => {
                self.on_message(message);
                Ok(EventResult::MessageHandled)
            }
        }
    }

    async fn on_install(&self) -> Result<InstallReport, PrecacheError> {
        self.expect_state(WorkerState::Installing, "install")?;

        match self.precache.install().await {
            Ok(report) => {
                self.set_state(WorkerState::Waiting);
                Ok(report)
            }
            Err(e) => {
                self.set_state(WorkerState::Failed);
                Err(e)
            }
        }
    }

    async fn on_activate(&self) -> Result<ActivateReport, PrecacheError> {
        self.expect_state(WorkerState::Waiting, "activate")?;

        match self.precache.activate().await {
            Ok(report) => {
                self.set_state(WorkerState::Active);
                Ok(report)
            }
            Err(e) => {
                self.set_state(WorkerState::Failed);
                Err(e)
            }
        }
    }

    async fn on_fetch(&self, request: &FetchRequest) -> Result<FetchResponse, PrecacheError> {
        self.expect_state(WorkerState::Active, "fetch")?;
        self.precache.handle_fetch(request).await
    }

    fn on_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::SkipWaiting => {
                info!("⏩ Worker {} asked to skip waiting", self.id);
                self.skip_waiting.store(true, Ordering::SeqCst);
            }
            ControlMessage::Unknown => debug!("Worker {} ignoring unknown message", self.id),
        }
    }

    fn retire(&self) {
        self.set_state(WorkerState::Redundant);
    }
}

fn lock_state(state: &Mutex<WorkerState>) -> MutexGuard<'_, WorkerState> {
    // The guarded value is a plain enum, a poisoned lock still holds a valid state.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An open client of the active worker
///
/// While any session is open a waiting worker is only promoted when asked to
/// skip waiting.
#[derive(Debug)]
pub struct ClientSession {
    sessions: Arc<AtomicUsize>,
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub version: String,
    pub state: WorkerState,
}

impl From<&ServiceWorker> for WorkerInfo {
    fn from(worker: &ServiceWorker) -> Self {
        Self {
            id: worker.id(),
            version: worker.version().to_string(),
            state: worker.state(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub active: Option<WorkerInfo>,
    pub waiting: Option<WorkerInfo>,
    pub open_sessions: usize,
}

#[derive(Default)]
struct Slots {
    active: Option<Arc<ServiceWorker>>,
    waiting: Option<Arc<ServiceWorker>>,
}

/// Owns the active and waiting workers for one scope
pub struct WorkerRegistry {
    slots: Mutex<Slots>,
    sessions: Arc<AtomicUsize>,
    // Serialises install and activate
    lifecycle: AsyncMutex<()>,
    // Fetches hold the read side; activation takes the write side
    gate: RwLock<()>,
    network: Arc<dyn Network>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("status", &self.status())
            .field("network", &"<dyn Network>")
            .finish()
    }
}

impl WorkerRegistry {
    /// `network` answers requests while no worker is active
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            sessions: Arc::new(AtomicUsize::new(0)),
            lifecycle: AsyncMutex::new(()),
            gate: RwLock::new(()),
            network,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // Slots only hold Arcs; a panic elsewhere cannot leave them half-written.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.slots().active.clone()
    }

    pub fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        self.slots().waiting.clone()
    }

    pub fn status(&self) -> RegistryStatus {
        let slots = self.slots();
        RegistryStatus {
            active: slots.active.as_deref().map(WorkerInfo::from),
            waiting: slots.waiting.as_deref().map(WorkerInfo::from),
            open_sessions: self.sessions.load(Ordering::SeqCst),
        }
    }

    pub fn open_session(&self) -> ClientSession {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        ClientSession {
            sessions: self.sessions.clone(),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Install a new worker version and hand over to it when allowed
    ///
    /// A failed install leaves the current active worker in control.
    pub async fn register(&self, worker: ServiceWorker) -> Result<InstallReport, PrecacheError> {
        let worker = Arc::new(worker);
        info!("🆕 Registering worker {} (version {})", worker.id(), short(worker.version()));

        let report = {
            let _lifecycle = self.lifecycle.lock().await;

            let report = match worker.dispatch(LifecycleEvent::Install).await {
                Ok(EventResult::Installed(report)) => report,
                Ok(other) => unreachable!("install produced {:?}", other),
                Err(e) => {
                    error!("❌ Install of worker {} failed, keeping current worker: {}", worker.id(), e);
                    return Err(e);
                }
            };

            let replaced = self.slots().waiting.replace(worker.clone());
            if let Some(replaced) = replaced {
                info!("Worker {} superseded while waiting", replaced.id());
                replaced.retire();
            }
            report
        };

        self.try_handoff().await?;
        Ok(report)
    }

    /// Whether a waiting worker is free to take over
    fn handoff_allowed(&self, waiting: &ServiceWorker) -> bool {
        self.active().is_none() || self.open_sessions() == 0 || waiting.skip_waiting_requested()
    }

    /// Promote the waiting worker if nothing holds the active one in place
    ///
    /// Returns whether a promotion happened.
    pub async fn try_handoff(&self) -> Result<bool, PrecacheError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.handoff_locked().await
    }

    // Caller holds the lifecycle lock
    async fn handoff_locked(&self) -> Result<bool, PrecacheError> {
        let Some(waiting) = self.waiting() else {
            return Ok(false);
        };

        if !self.handoff_allowed(&waiting) {
            debug!("Worker {} waiting for {} open sessions", waiting.id(), self.open_sessions());
            return Ok(false);
        }

        let _gate = self.gate.write().await;
        match waiting.dispatch(LifecycleEvent::Activate).await {
            Ok(_) => {
                let previous = {
                    let mut slots = self.slots();
                    slots.waiting = None;
                    slots.active.replace(waiting.clone())
                };
                if let Some(previous) = previous {
                    previous.retire();
                }
                info!("🚀 Worker {} is now active", waiting.id());
                Ok(true)
            }
            Err(e) => {
                error!("❌ Activation of worker {} failed, keeping current worker: {}", waiting.id(), e);
                self.slots().waiting = None;
                Err(e)
            }
        }
    }

    /// Route a request through the active worker
    ///
    /// The request counts as an open session while it is handled. Without an
    /// active worker it goes straight to the network.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, PrecacheError> {
        let pending = self.waiting().is_some_and(|waiting| self.handoff_allowed(&waiting));
        if pending {
            // An install in progress holds the lock; the handoff waits for a later request.
            if let Ok(_lifecycle) = self.lifecycle.try_lock() {
                if let Err(e) = self.handoff_locked().await {
                    warn!("Handoff before fetch failed: {}", e);
                }
            }
        }

        let _session = self.open_session();
        let _gate = self.gate.read().await;
        match self.active() {
            Some(worker) => match worker.dispatch(LifecycleEvent::Fetch(request)).await? {
                EventResult::Response(response) => Ok(response),
                other => unreachable!("fetch produced {:?}", other),
            },
            None => {
                debug!("No active worker, passing {} to the network", request.url);
                self.network.fetch(request).await
            }
        }
    }

    /// Deliver a control message to the waiting worker
    pub async fn post_message(&self, payload: &serde_json::Value) -> Result<(), PrecacheError> {
        let message = ControlMessage::parse(payload);
        if message == ControlMessage::Unknown {
            debug!("Ignoring unrecognized control message: {}", payload);
            return Ok(());
        }

        let Some(waiting) = self.waiting() else {
            debug!("No waiting worker for {:?}", message);
            return Ok(());
        };

        waiting.dispatch(LifecycleEvent::Message(message)).await?;
        self.try_handoff().await?;
        Ok(())
    }
}

fn short(version: &str) -> &str {
    &version[..version.len().min(12)]
}
