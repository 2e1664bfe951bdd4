//! The client half of the long-poll round trip: a sender loop that drains
//! the command queue and POSTs it, and an interrupt loop that fires the
//! out-of-band GET releasing a parked server poll. Decoded commands apply
//! on the UI-affine executor before the next round trip starts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use tidepool_model::{EventOrigin, ModelEvent, ModelStore};
use tidepool_proto::{BeanId, Command, CommandCodec, JsonCodec, ListId};

use crate::queue::{CommandQueue, Completion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnecting => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Status(StatusCode),
    #[error("codec failure: {0}")]
    Codec(#[from] tidepool_proto::CodecError),
    #[error("invalid session endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
}

/// The UI-affine execution context. Decoded commands and completions run
/// here; the sender blocks until the submitted task finishes, so round
/// trip N is fully applied before round trip N+1 begins.
pub trait UiExecutor: Send + Sync {
    fn run(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs tasks inline on the calling thread. Suits headless clients and
/// tests; GUI embedders provide their own dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl UiExecutor for DirectExecutor {
    fn run(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

pub type ErrorHandler = Box<dyn Fn(ClientError) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-session command endpoint; POST carries batches, GET interrupts.
    pub endpoint: Url,
    /// Outer bound on a single HTTP round trip. Must exceed the server's
    /// `max_poll_time` or idle long polls will be cut short.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            request_timeout: Duration::from_secs(90),
        }
    }
}

struct ClientShared {
    http: reqwest::Client,
    config: ClientConfig,
    codec: Arc<dyn CommandCodec>,
    queue: CommandQueue,
    store: Arc<ModelStore>,
    ui: Arc<dyn UiExecutor>,
    on_error: Mutex<Option<ErrorHandler>>,
    state: AtomicU8,
    connected: AtomicBool,
    interrupt: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    roots: Mutex<HashSet<BeanId>>,
}

/// Client endpoint of the remoting engine. Owns the outgoing queue, the
/// client-side model store and the two background loops.
#[derive(Clone)]
pub struct RemotingClient {
    shared: Arc<ClientShared>,
}

impl RemotingClient {
    pub fn new(config: ClientConfig, store: Arc<ModelStore>, ui: Arc<dyn UiExecutor>) -> Self {
        Self::with_codec(config, store, ui, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        config: ClientConfig,
        store: Arc<ModelStore>,
        ui: Arc<dyn UiExecutor>,
        codec: Arc<dyn CommandCodec>,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            http: reqwest::Client::new(),
            config,
            codec,
            queue: CommandQueue::new(),
            store,
            ui,
            on_error: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            connected: AtomicBool::new(false),
            interrupt: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            roots: Mutex::new(HashSet::new()),
        });
        Self { shared }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.shared.store
    }

    /// Pins a bean as a client-side root. The server never emits a delete
    /// for a collected bean, so after each applied round trip the client
    /// drops every bean and list unreachable from its pinned roots (ids
    /// touched by that response get one cycle of grace to be pinned).
    /// With no roots pinned the sweep is disabled.
    pub fn retain(&self, bean_id: BeanId) {
        self.shared.roots.lock().insert(bean_id);
    }

    /// Releases a pinned root. Whatever only it kept alive falls to the
    /// sweep after the next round trip.
    pub fn release(&self, bean_id: BeanId) {
        self.shared.roots.lock().remove(&bean_id);
    }

    /// Registers the single error callback. Any failure in either loop
    /// funnels here exactly once, invoked on the UI executor; the loops
    /// then exit to `Disconnected` with no automatic retry.
    pub fn on_error(&self, handler: ErrorHandler) {
        *self.shared.on_error.lock() = Some(handler);
    }

    /// Transitions to `Connected`, enqueues `CreateContext` as the first
    /// command and spawns the sender and interrupt loops. Local model
    /// mutations are forwarded onto the queue from here on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<(), ClientError> {
        let previous = self.shared.state.compare_exchange(
            ConnectionState::Disconnected.as_u8(),
            ConnectionState::Connected.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if previous.is_err() {
            return Err(ClientError::AlreadyConnected);
        }
        self.shared.connected.store(true, Ordering::Release);
        self.shared.queue.enqueue(Command::CreateContext, None);

        let forward = Arc::clone(&self.shared);
        self.shared.store.subscribe(Box::new(move |event| {
            forward_local_event(&forward, event);
        }));

        let sender = Arc::clone(&self.shared);
        let interrupt = Arc::clone(&self.shared);
        let mut tasks = self.shared.tasks.lock();
        tasks.push(tokio::spawn(sender_loop(sender)));
        tasks.push(tokio::spawn(interrupt_loop(interrupt)));
        Ok(())
    }

    /// Enqueues a command, merging against the buffer. If the queue was
    /// empty the sender is likely parked in an idle long poll, so the
    /// interrupt loop is nudged to release it.
    pub fn send(&self, command: Command, on_complete: Option<Completion>) -> Result<(), ClientError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }
        if self.shared.queue.enqueue(command, on_complete) {
            self.shared.interrupt.notify_one();
        }
        Ok(())
    }

    /// Tears the connection down: stops both loops, cancels any in-flight
    /// HTTP call and sends a best-effort `DestroyContext`. Resuming
    /// requires a fresh client.
    pub async fn disconnect(&self) {
        self.shared
            .state
            .store(ConnectionState::Disconnecting.as_u8(), Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);
        // wake the interrupt loop so its connected re-check lets it exit
        self.shared.interrupt.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.tasks.lock());
        for handle in handles {
            handle.abort();
        }

        if let Err(err) = destroy_context(&self.shared).await {
            debug!(error = %err, "destroy context on disconnect failed");
        }
        self.shared
            .state
            .store(ConnectionState::Disconnected.as_u8(), Ordering::Release);
    }
}

/// Translates a locally-originated model event into its wire command.
/// Remote-originated events are applies of server commands and must not
/// echo back.
fn forward_local_event(shared: &Arc<ClientShared>, event: &ModelEvent) {
    if event.origin != EventOrigin::Local {
        return;
    }
    let Some(command) = event.change.as_command() else {
        return;
    };
    if !shared.connected.load(Ordering::Acquire) {
        debug!(kind = %command.kind(), "dropping local edit while disconnected");
        return;
    }
    if shared.queue.enqueue(command, None) {
        shared.interrupt.notify_one();
    }
}

/// While connected: drain → encode → POST → decode → apply on the UI
/// executor → fire completions → repeat immediately. An empty drain turns
/// into `[StartLongPoll]` so the same request doubles as the long-poll
/// pull.
async fn sender_loop(shared: Arc<ClientShared>) {
    while shared.connected.load(Ordering::Acquire) {
        let (mut commands, completions) = shared.queue.drain();
        if commands.is_empty() {
            commands.push(Command::StartLongPoll);
        }
        match round_trip(&shared, &commands).await {
            Ok(incoming) => apply_round_trip(&shared, incoming, completions).await,
            Err(err) => {
                fail(&shared, err);
                return;
            }
        }
    }
    shared
        .state
        .store(ConnectionState::Disconnected.as_u8(), Ordering::Release);
}

async fn round_trip(
    shared: &Arc<ClientShared>,
    commands: &[Command],
) -> Result<Vec<Command>, ClientError> {
    let body = shared.codec.encode(commands)?;
    let response = shared
        .http
        .post(shared.config.endpoint.clone())
        .header(CONTENT_TYPE, shared.codec.content_type())
        .timeout(shared.config.request_timeout)
        .body(body)
        .send()
        .await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(ClientError::Status(status));
    }
    let bytes = response.bytes().await?;
    Ok(shared.codec.decode(&bytes)?)
}

/// Blocking run-and-wait handoff to the UI executor: decoding, the
/// unreferenced-copy sweep and completions finish before the sender
/// proceeds to the next round trip.
async fn apply_round_trip(
    shared: &Arc<ClientShared>,
    incoming: Vec<Command>,
    completions: Vec<Completion>,
) {
    let roots: Vec<BeanId> = shared.roots.lock().iter().copied().collect();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let store = Arc::clone(&shared.store);
    shared.ui.run(Box::new(move || {
        for command in &incoming {
            if let Err(err) = store.apply(command) {
                warn!(error = %err, kind = %command.kind(), "failed to apply server command");
            }
        }
        if !roots.is_empty() {
            let (mut bean_roots, list_roots) = response_targets(&incoming);
            bean_roots.extend(roots);
            let dropped = store.retain_reachable(&bean_roots, &list_roots);
            if dropped > 0 {
                debug!(dropped, "dropped unreferenced model copies");
            }
        }
        for completion in completions {
            completion();
        }
        let _ = done_tx.send(());
    }));
    let _ = done_rx.await;
}

/// Graph targets named by a response batch. Beans and lists materialized
/// by this round trip count as sweep roots once, so a fresh instance is
/// never dropped before the application had a chance to pin it.
fn response_targets(commands: &[Command]) -> (Vec<BeanId>, Vec<ListId>) {
    let mut beans = Vec::new();
    let mut lists = Vec::new();
    for command in commands {
        match command {
            Command::ValueChanged { bean_id, .. } => beans.push(*bean_id),
            Command::ListAdd { list_id, .. }
            | Command::ListRemove { list_id, .. }
            | Command::ListReplace { list_id, .. } => lists.push(*list_id),
            _ => {}
        }
    }
    (beans, lists)
}

/// Parks on the interrupt condition; a wakeup triggers the bodyless GET
/// that unblocks the matching parked server poll. The connected guard is
/// re-checked after every wakeup, before any network call, so a disconnect
/// racing a pending interrupt cannot cause a spurious transmit.
async fn interrupt_loop(shared: Arc<ClientShared>) {
    loop {
        shared.interrupt.notified().await;
        if !shared.connected.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = send_interrupt(&shared).await {
            fail(&shared, err);
            return;
        }
    }
}

async fn send_interrupt(shared: &Arc<ClientShared>) -> Result<(), ClientError> {
    let response = shared
        .http
        .get(shared.config.endpoint.clone())
        .timeout(Duration::from_secs(10))
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status(status));
    }
    Ok(())
}

async fn destroy_context(shared: &Arc<ClientShared>) -> Result<(), ClientError> {
    let body = shared.codec.encode(&[Command::DestroyContext])?;
    let response = shared
        .http
        .post(shared.config.endpoint.clone())
        .header(CONTENT_TYPE, shared.codec.content_type())
        .timeout(Duration::from_secs(5))
        .body(body)
        .send()
        .await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(ClientError::Status(status));
    }
    Ok(())
}

/// Funnels a loop failure to the registered error handler exactly once and
/// drops the connection. No silent retry: a fresh client is required.
fn fail(shared: &Arc<ClientShared>, err: ClientError) {
    shared.connected.store(false, Ordering::Release);
    shared
        .state
        .store(ConnectionState::Disconnected.as_u8(), Ordering::Release);
    let handler = shared.on_error.lock().take();
    match handler {
        Some(handler) => {
            shared.ui.run(Box::new(move || handler(err)));
        }
        None => warn!(error = %err, "remoting loop failed with no error handler registered"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_proto::PmValue;

    fn test_client(store: Arc<ModelStore>) -> RemotingClient {
        let config = ClientConfig::new(Url::parse("http://127.0.0.1:1/sessions/x").expect("url"));
        RemotingClient::new(config, store, Arc::new(DirectExecutor))
    }

    fn materialize(bean: u64, attribute: &str, value: PmValue) -> Command {
        Command::ValueChanged {
            bean_id: BeanId(bean),
            attribute: attribute.into(),
            old_value: PmValue::Null,
            new_value: value,
        }
    }

    #[test]
    fn response_targets_name_mutated_beans_and_lists() {
        let commands = vec![
            materialize(4, "count", PmValue::Int(0)),
            Command::ListAdd {
                list_id: ListId(9),
                index: 0,
                values: vec![PmValue::Int(1)],
            },
            Command::StartLongPoll,
        ];
        let (beans, lists) = response_targets(&commands);
        assert_eq!(beans, vec![BeanId(4)]);
        assert_eq!(lists, vec![ListId(9)]);
    }

    #[tokio::test]
    async fn sweep_drops_beans_the_client_no_longer_references() {
        let store = Arc::new(ModelStore::new());
        let client = test_client(Arc::clone(&store));

        // a response materializes the platform bean plus a root and child
        let incoming = vec![
            materialize(0, "status", PmValue::Null),
            materialize(1, "count", PmValue::Int(0)),
            materialize(2, "label", PmValue::Text("counter".into())),
            materialize(1, "child", PmValue::BeanRef(BeanId(2))),
        ];
        client.retain(BeanId(0));
        client.retain(BeanId(1));
        apply_round_trip(&client.shared, incoming, Vec::new()).await;
        assert!(store.contains_bean(BeanId(1)));
        assert!(store.contains_bean(BeanId(2)));

        // the server collects the pair without emitting any command; the
        // client drops its copies once it stops referencing the root
        client.release(BeanId(1));
        apply_round_trip(&client.shared, Vec::new(), Vec::new()).await;
        assert!(store.contains_bean(BeanId(0)));
        assert!(!store.contains_bean(BeanId(1)));
        assert!(!store.contains_bean(BeanId(2)));
    }

    #[tokio::test]
    async fn unpinned_store_is_never_swept() {
        let store = Arc::new(ModelStore::new());
        let client = test_client(Arc::clone(&store));
        apply_round_trip(
            &client.shared,
            vec![materialize(1, "count", PmValue::Int(0))],
            Vec::new(),
        )
        .await;
        apply_round_trip(&client.shared, Vec::new(), Vec::new()).await;
        assert!(store.contains_bean(BeanId(1)));
    }

    #[tokio::test]
    async fn second_connect_reports_already_connected() {
        let store = Arc::new(ModelStore::new());
        let client = test_client(store);
        client.connect().expect("first connect");
        assert!(matches!(
            client.connect(),
            Err(ClientError::AlreadyConnected)
        ));
        client.disconnect().await;
    }

    #[test]
    fn connection_state_round_trips_through_atomic_repr() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let store = Arc::new(ModelStore::new());
        let config = ClientConfig::new(Url::parse("http://127.0.0.1:1/sessions/x").expect("url"));
        let client = RemotingClient::new(config, store, Arc::new(DirectExecutor));
        assert!(matches!(
            client.send(Command::StartLongPoll, None),
            Err(ClientError::NotConnected)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
