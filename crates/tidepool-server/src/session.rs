//! Per-client server sessions: the non-reentrant active guard, batch
//! dispatch, the parked long poll and the per-cycle GC run, plus the
//! registry correlating transport-level session ids to live sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tidepool_model::{EventOrigin, ModelError, ModelStore};
use tidepool_proto::{BeanId, Command, CommandKind, ControllerId, PmValue};

use crate::config::{BusyPolicy, ServerConfig};
use crate::contract::{Controller, ControllerError, ControllerFactory};
use crate::dispatch::{CommandDispatcher, SessionContext};
use crate::gc::{CollectionVeto, GarbageCollector, InstanceArena};
use crate::tasks::{SessionTask, TaskQueue};

/// Attribute on the platform bean carrying the most recent action failure.
pub const ERROR_ATTRIBUTE: &str = "last_action_error";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is busy with another call")]
    Busy,
    #[error("create_context must precede any other command")]
    NoContext,
    #[error("no handler registered for {0}")]
    Unhandled(CommandKind),
    #[error("controller failure: {0}")]
    Controller(#[from] ControllerError),
    #[error("model failure: {0}")]
    Model(#[from] ModelError),
}

pub struct ControllerEntry {
    pub controller: Box<dyn Controller>,
    pub model_root: BeanId,
    pub parent: Option<ControllerId>,
}

/// Everything behind the session's active guard.
pub struct SessionState {
    pub store: Arc<ModelStore>,
    pub controllers: HashMap<ControllerId, ControllerEntry>,
    pub arena: InstanceArena,
    pub error_bean: Option<BeanId>,
    pub context_created: bool,
    pub destroyed: bool,
    next_controller_id: u64,
    poll_cycles: u64,
}

impl SessionState {
    fn new(store: Arc<ModelStore>) -> Self {
        Self {
            store,
            controllers: HashMap::new(),
            arena: InstanceArena::new(),
            error_bean: None,
            context_created: false,
            destroyed: false,
            next_controller_id: 0,
            poll_cycles: 0,
        }
    }

    /// Lazily sets up the platform bean repository for this session. The
    /// error-flag bean is held so the collector never reaps it.
    pub fn init_context(&mut self) {
        if self.context_created {
            return;
        }
        let error_bean = self.store.create_bean();
        if let Err(err) = self
            .store
            .add_property(error_bean, ERROR_ATTRIBUTE, PmValue::Null)
        {
            warn!(error = %err, "failed to seed platform error bean");
        }
        self.arena.hold(error_bean);
        self.error_bean = Some(error_bean);
        self.context_created = true;
    }

    pub fn alloc_controller_id(&mut self) -> ControllerId {
        let id = ControllerId(self.next_controller_id);
        self.next_controller_id += 1;
        id
    }

    /// Records an action failure on the platform bean; the resulting
    /// `ValueChanged` rides back to the client with the batch response.
    pub fn record_action_error(&mut self, message: &str) {
        let Some(error_bean) = self.error_bean else {
            return;
        };
        if let Err(err) =
            self.store
                .set_value(error_bean, ERROR_ATTRIBUTE, PmValue::Text(message.into()))
        {
            warn!(error = %err, "failed to record action error flag");
        }
    }

    /// Explicitly destroys a controller and its children. The freed model
    /// beans become unreachable and fall to the next GC cycle; no command
    /// is emitted for them.
    pub fn destroy_controller(&mut self, controller_id: ControllerId) {
        if !self.controllers.contains_key(&controller_id) {
            warn!(controller_id = %controller_id, "destroy for unknown controller");
            return;
        }
        let mut doomed = vec![controller_id];
        let mut index = 0;
        while index < doomed.len() {
            let parent = doomed[index];
            for (child_id, entry) in &self.controllers {
                if entry.parent == Some(parent) && !doomed.contains(child_id) {
                    doomed.push(*child_id);
                }
            }
            index += 1;
        }
        let store = Arc::clone(&self.store);
        for id in doomed {
            if let Some(mut entry) = self.controllers.remove(&id) {
                entry.controller.destroy(&store);
            }
        }
    }

    pub fn destroy_all_controllers(&mut self) {
        let store = Arc::clone(&self.store);
        for (_, mut entry) in self.controllers.drain() {
            entry.controller.destroy(&store);
        }
    }

    /// Current GC roots: the model beans of every active controller.
    pub fn roots(&self) -> Vec<BeanId> {
        self.controllers
            .values()
            .map(|entry| entry.model_root)
            .collect()
    }
}

/// Result of one processed batch.
pub struct BatchOutcome {
    pub commands: Vec<Command>,
    pub destroyed: bool,
}

pub struct ServerSession {
    id: Uuid,
    config: ServerConfig,
    dispatcher: Arc<CommandDispatcher>,
    factory: Arc<dyn ControllerFactory>,
    gc: GarbageCollector,
    /// The non-reentrant active guard: at most one command batch executes
    /// per session at a time. The out-of-band interrupt bypasses it.
    state: Mutex<SessionState>,
    tasks: TaskQueue,
    outbox: Arc<parking_lot::Mutex<Vec<Command>>>,
    destroyed: AtomicBool,
    last_activity: AtomicU64,
}

impl ServerSession {
    pub fn new(
        id: Uuid,
        config: ServerConfig,
        dispatcher: Arc<CommandDispatcher>,
        factory: Arc<dyn ControllerFactory>,
        veto: Option<Arc<dyn CollectionVeto>>,
    ) -> Self {
        let store = Arc::new(ModelStore::new());
        let outbox = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&outbox);
        // local mutations (controllers, tasks, GC-era platform beans) feed
        // the outgoing buffer; remote applies never echo
        store.subscribe(Box::new(move |event| {
            if event.origin != EventOrigin::Local {
                return;
            }
            if let Some(command) = event.change.as_command() {
                sink.lock().push(command);
            }
        }));
        let gc = match veto {
            Some(veto) => GarbageCollector::with_veto(veto),
            None => GarbageCollector::new(),
        };
        Self {
            id,
            config,
            dispatcher,
            factory,
            gc,
            state: Mutex::new(SessionState::new(store)),
            tasks: TaskQueue::new(),
            outbox,
            destroyed: AtomicBool::new(false),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Releases a parked long poll for this session. Called from the
    /// interrupt HTTP handler on a separate connection, so it must not
    /// take the active guard.
    pub fn interrupt(&self) {
        self.tasks.interrupt();
    }

    /// Hands server-originated work to the session. The task runs on the
    /// parked long-poll worker under the active guard; commands produced
    /// by its mutations ride back on that poll's response.
    pub fn push_task(&self, task: SessionTask) {
        self.tasks.push(task);
    }

    /// Handle to the session's model store. Takes the active guard, so it
    /// briefly serializes with batch processing.
    pub async fn store(&self) -> Arc<ModelStore> {
        Arc::clone(&self.state.lock().await.store)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Dispatches one deserialized batch and returns the accumulated
    /// response commands, the server half of the client's round trip.
    pub async fn process_batch(&self, commands: Vec<Command>) -> Result<BatchOutcome, SessionError> {
        let mut state = match self.config.busy_policy {
            BusyPolicy::Wait => self.state.lock().await,
            BusyPolicy::Reject => self.state.try_lock().map_err(|_| SessionError::Busy)?,
        };
        self.touch();

        let mut park_requested = false;
        for command in commands {
            let kind = command.kind();
            counter!("tidepool_commands_total", 1, "kind" => kind.to_string());
            if !state.context_created && kind != CommandKind::CreateContext {
                return Err(SessionError::NoContext);
            }
            match command {
                Command::StartLongPoll => park_requested = true,
                Command::InterruptLongPoll => self.tasks.interrupt(),
                other => {
                    let mut ctx = SessionContext {
                        state: &mut *state,
                        factory: self.factory.as_ref(),
                    };
                    self.dispatcher.dispatch(&mut ctx, other)?;
                }
            }
        }

        if park_requested {
            if self.outbox_is_empty() {
                self.park(&mut state).await;
            }
            state.poll_cycles += 1;
            if self.config.gc_every_polls > 0
                && state.poll_cycles % self.config.gc_every_polls == 0
            {
                self.run_gc(&mut state);
            }
        }

        if state.destroyed {
            self.destroyed.store(true, Ordering::Release);
        }
        self.touch();
        Ok(BatchOutcome {
            commands: self.drain_outbox(),
            destroyed: state.destroyed,
        })
    }

    /// Parks the worker against the task queue until a task becomes
    /// runnable, `max_poll_time` elapses or an interrupt arrives. Never
    /// blocks past the bound.
    async fn park(&self, state: &mut SessionState) {
        counter!("tidepool_long_polls_parked_total", 1);
        let deadline = Instant::now() + self.config.max_poll_time;
        loop {
            if self.tasks.take_interrupt() {
                counter!("tidepool_long_polls_interrupted_total", 1);
                return;
            }
            if let Some(task) = self.tasks.pop() {
                task(state);
                if !self.outbox_is_empty() {
                    return;
                }
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                counter!("tidepool_long_polls_expired_total", 1);
                return;
            }
            tokio::select! {
                _ = self.tasks.notified() => {}
                _ = tokio::time::sleep(remaining) => {
                    counter!("tidepool_long_polls_expired_total", 1);
                    return;
                }
            }
        }
    }

    fn run_gc(&self, state: &mut SessionState) {
        let roots = state.roots();
        let SessionState { store, arena, .. } = state;
        let stats = self.gc.collect(store, arena, &roots);
        if stats.collected > 0 || stats.vetoed > 0 || stats.lists_collected > 0 {
            debug!(
                session_id = %self.id,
                collected = stats.collected,
                lists_collected = stats.lists_collected,
                vetoed = stats.vetoed,
                retained = stats.retained,
                "gc cycle"
            );
        }
        counter!("tidepool_gc_collected_total", stats.collected as u64);
    }

    fn outbox_is_empty(&self) -> bool {
        self.outbox.lock().is_empty()
    }

    fn drain_outbox(&self) -> Vec<Command> {
        std::mem::take(&mut *self.outbox.lock())
    }
}

/// Correlates transport-level session ids with live sessions. Sessions
/// are created lazily on first contact and recycled when destroyed or
/// idle past the configured timeout.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<Uuid, Arc<ServerSession>>,
    config: ServerConfig,
    dispatcher: Arc<CommandDispatcher>,
    factory: Arc<dyn ControllerFactory>,
    veto: Option<Arc<dyn CollectionVeto>>,
}

impl SessionRegistry {
    pub fn new(config: ServerConfig, factory: Arc<dyn ControllerFactory>) -> Self {
        Self::with_parts(
            config,
            factory,
            Arc::new(CommandDispatcher::with_defaults()),
            None,
        )
    }

    pub fn with_parts(
        config: ServerConfig,
        factory: Arc<dyn ControllerFactory>,
        dispatcher: Arc<CommandDispatcher>,
        veto: Option<Arc<dyn CollectionVeto>>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                config,
                dispatcher,
                factory,
                veto,
            }),
        }
    }

    /// Fetches the session for `id`, creating it on first contact.
    pub fn session(&self, id: Uuid) -> Arc<ServerSession> {
        let session = match self.inner.sessions.entry(id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                info!(session_id = %id, "creating session");
                let session = Arc::new(ServerSession::new(
                    id,
                    self.inner.config.clone(),
                    Arc::clone(&self.inner.dispatcher),
                    Arc::clone(&self.inner.factory),
                    self.inner.veto.clone(),
                ));
                entry.insert(Arc::clone(&session));
                session
            }
        };
        gauge!("tidepool_sessions_active", self.inner.sessions.len() as f64);
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ServerSession>> {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: Uuid) {
        if self.inner.sessions.remove(&id).is_some() {
            info!(session_id = %id, "removed session");
        }
        gauge!("tidepool_sessions_active", self.inner.sessions.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Background sweep for destroyed and idle sessions.
    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(registry.inner.config.recycle_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let idle_timeout = registry.inner.config.session_idle_timeout;
                let stale: Vec<Uuid> = registry
                    .inner
                    .sessions
                    .iter()
                    .filter(|entry| {
                        entry.value().is_destroyed() || entry.value().idle_for() > idle_timeout
                    })
                    .map(|entry| *entry.key())
                    .collect();
                for id in stale {
                    registry.remove(id);
                }
            }
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
