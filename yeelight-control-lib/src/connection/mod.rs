//! Sessions with a single device.
//!
//! A [`Connection`] moves through `Disconnected -> Connecting -> Connected ->
//! Disconnected`. While connected it owns the socket through two tasks: a
//! reader that decodes frames and a writer that drains the outgoing command
//! queue. Listener callbacks are queued and delivered by a third, per
//! connection dispatcher task, in the order the state changes happened.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::ConnectionConfig;
use crate::device::{SharedDevice, WeakDevice};
use crate::error::ConnectionError;
use crate::protocol::codec::YeelightCodec;
use crate::protocol::command::Command;
use crate::protocol::reply::Reply;
use crate::util::traits::ConnectionListener;

pub mod auto;
pub mod pool;

pub use auto::AutoConnection;
pub use pool::{ConnectionPool, PooledConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Handle returned by [`Connection::add_interceptor`] to detach
/// the interceptor again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Interceptors in registration order, followed by the primary listener.
#[derive(Default)]
struct ConnectionListenerChain {
    interceptors: Mutex<Vec<(ListenerId, Arc<dyn ConnectionListener>)>>,
    primary: Mutex<Option<Arc<dyn ConnectionListener>>>,
    next_id: AtomicU64,
}

impl ConnectionListenerChain {
    fn add_interceptor(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.interceptors).push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut interceptors = lock(&self.interceptors);
        let before = interceptors.len();
        interceptors.retain(|(existing, _)| *existing != id);
        before != interceptors.len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        let mut listeners: Vec<_> = lock(&self.interceptors)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        listeners.extend(lock(&self.primary).clone());
        listeners
    }
}

enum Event {
    Connected,
    Disconnected(Option<ConnectionError>),
    Response(Reply),
    Error(ConnectionError, Option<Command>),
}

async fn dispatch_events(
    device_id: u64,
    listeners: Arc<ConnectionListenerChain>,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events.recv().await {
        for listener in listeners.snapshot() {
            match &event {
                Event::Connected => listener.on_connected(device_id),
                Event::Disconnected(cause) => listener.on_disconnected(device_id, cause.as_ref()),
                Event::Response(reply) => listener.on_response(device_id, reply),
                Event::Error(error, command) => {
                    listener.on_connection_error(device_id, error, command.as_ref())
                }
            }
        }
    }
}

struct PendingCommand {
    command: Command,
    submitted_at: Instant,
    reply_tx: oneshot::Sender<Result<Reply, ConnectionError>>,
}

struct Session {
    generation: u64,
    writer_tx: mpsc::UnboundedSender<Command>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

enum SessionState {
    Disconnected,
    Connecting { attempt: u64, task: JoinHandle<()> },
    Connected(Session),
}

impl SessionState {
    fn public(&self) -> ConnectionState {
        match self {
            SessionState::Disconnected => ConnectionState::Disconnected,
            SessionState::Connecting { .. } => ConnectionState::Connecting,
            SessionState::Connected(_) => ConnectionState::Connected,
        }
    }
}

struct Inner {
    device_id: u64,
    device: Mutex<WeakDevice>,
    endpoint: Mutex<SocketAddr>,
    /// Locked before `pending` whenever both are needed.
    state: Mutex<SessionState>,
    state_tx: watch::Sender<ConnectionState>,
    pending: Mutex<HashMap<u32, PendingCommand>>,
    last_error: Mutex<Option<ConnectionError>>,
    listeners: Arc<ConnectionListenerChain>,
    events: mpsc::UnboundedSender<Event>,
    next_command_id: AtomicU32,
    next_attempt: AtomicU64,
    released: AtomicBool,
    config: ConnectionConfig,
    runtime: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn emit(&self, event: Event) {
        // Only fails once the dispatcher is gone, i.e. during teardown.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: &mut SessionState, next: SessionState) -> SessionState {
        let previous = std::mem::replace(state, next);
        self.state_tx.send_replace(state.public());
        previous
    }

    fn finish_connect(
        self: &Arc<Self>,
        attempt: u64,
        result: Result<TcpStream, ConnectionError>,
    ) {
        let mut state = lock(&self.state);
        match &*state {
            SessionState::Connecting { attempt: current, .. } if *current == attempt => {}
            _ => {
                debug!("device {:#x}: discarding stale connect attempt", self.device_id);
                return;
            }
        }
        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("device {:#x}: could not disable nagle: {}", self.device_id, e);
                }
                let (read_half, write_half) = stream.into_split();
                let (writer_tx, writer_rx) = mpsc::unbounded_channel();
                let reader = self.runtime.spawn(read_loop(
                    Arc::downgrade(self),
                    attempt,
                    FramedRead::new(read_half, YeelightCodec::new()),
                ));
                let writer = self.runtime.spawn(write_loop(
                    Arc::downgrade(self),
                    attempt,
                    FramedWrite::new(write_half, YeelightCodec::new()),
                    writer_rx,
                ));
                *lock(&self.last_error) = None;
                self.set_state(
                    &mut state,
                    SessionState::Connected(Session {
                        generation: attempt,
                        writer_tx,
                        reader,
                        writer,
                    }),
                );
                info!("device {:#x}: connected", self.device_id);
                self.emit(Event::Connected);
            }
            Err(e) => {
                warn!("device {:#x}: {}", self.device_id, e);
                *lock(&self.last_error) = Some(e.clone());
                self.set_state(&mut state, SessionState::Disconnected);
                self.emit(Event::Error(e, None));
            }
        }
    }

    /**
    Ends the current session or connect attempt.

    With a `generation`, only the session of that generation is closed, so a
    late failure of an old session can not tear down a newer one. Returns
    whether anything was closed.
     */
    fn close_session(
        &self,
        generation: Option<u64>,
        cause: Option<ConnectionError>,
        failed_command: Option<Command>,
    ) -> bool {
        let mut state = lock(&self.state);
        let matches = match &*state {
            SessionState::Connected(session) => generation.map_or(true, |g| g == session.generation),
            SessionState::Connecting { .. } => generation.is_none(),
            SessionState::Disconnected => false,
        };
        if !matches {
            return false;
        }

        let drained: Vec<PendingCommand> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        match self.set_state(&mut state, SessionState::Disconnected) {
            SessionState::Connecting { task, .. } => {
                task.abort();
                debug!("device {:#x}: connect attempt cancelled", self.device_id);
            }
            SessionState::Connected(session) => {
                session.abort();
                match &cause {
                    Some(cause) => info!("device {:#x}: disconnected: {}", self.device_id, cause),
                    None => info!("device {:#x}: disconnected", self.device_id),
                }
                if let (Some(cause), Some(command)) = (&cause, failed_command) {
                    self.emit(Event::Error(cause.clone(), Some(command)));
                }
                self.emit(Event::Disconnected(cause));
            }
            SessionState::Disconnected => {}
        }
        drop(state);

        for pending in drained {
            let _ = pending.reply_tx.send(Err(ConnectionError::Closed(self.device_id)));
        }
        true
    }

    fn handle_reply(&self, reply: Reply) {
        let reply = match reply.id {
            Some(id) => {
                let Some(pending) = lock(&self.pending).remove(&id) else {
                    warn!(
                        "device {:#x}: dropping reply {} without a pending command",
                        self.device_id, id
                    );
                    return;
                };
                debug!(
                    "device {:#x}: {} answered after {:?}",
                    self.device_id,
                    pending.command,
                    pending.submitted_at.elapsed()
                );
                let reply = reply.correlate(&pending.command);
                let _ = pending.reply_tx.send(Ok(reply.clone()));
                reply
            }
            None => reply,
        };

        if let Some(props) = &reply.props {
            let device = lock(&self.device).upgrade();
            match device {
                Some(device) => {
                    device.write().apply_props(props);
                }
                None => warn!(
                    "device {:#x}: no longer registered, skipping snapshot update",
                    self.device_id
                ),
            }
        }
        self.emit(Event::Response(reply));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        match state {
            SessionState::Connected(session) => session.abort(),
            SessionState::Connecting { task, .. } => task.abort(),
            SessionState::Disconnected => {}
        }
    }
}

async fn open_socket(
    device_id: u64,
    endpoint: SocketAddr,
    config: &ConnectionConfig,
) -> Result<TcpStream, ConnectionError> {
    debug!("device {:#x}: connecting to {}", device_id, endpoint);
    match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ConnectionError::Connect {
            address: endpoint.to_string(),
            source: Arc::new(e),
        }),
        Err(_) => Err(ConnectionError::ConnectTimeout(endpoint.to_string())),
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut frames: FramedRead<OwnedReadHalf, YeelightCodec>,
) {
    loop {
        let next = frames.next().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match next {
            Some(Ok(Ok(reply))) => inner.handle_reply(reply),
            Some(Ok(Err(e))) => warn!("device {:#x}: skipping frame: {}", inner.device_id, e),
            Some(Err(e)) => {
                inner.close_session(Some(generation), Some(ConnectionError::io(e)), None);
                return;
            }
            None => {
                inner.close_session(Some(generation), Some(ConnectionError::ClosedByPeer), None);
                return;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    inner: Weak<Inner>,
    generation: u64,
    mut sink: FramedWrite<W, YeelightCodec>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = sink.send(&command).await {
            if let Some(inner) = inner.upgrade() {
                warn!("device {:#x}: failed to write {}: {}", inner.device_id, command, e);
                inner.close_session(Some(generation), Some(ConnectionError::io(e)), Some(command));
            }
            return;
        }
    }
}

/// Reply of a sent command.
///
/// Resolves with [`ConnectionError::Closed`] when the session ends first.
/// Dropping it does not cancel the command.
#[derive(Debug)]
pub struct PendingReply {
    id: u32,
    device_id: u64,
    rx: oneshot::Receiver<Result<Reply, ConnectionError>>,
}

impl PendingReply {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Reply, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let device_id = self.device_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ConnectionError::Closed(device_id))))
    }
}

/// Connection to one device. Cloning yields another handle to the same
/// session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates a disconnected connection. Tasks are spawned on `runtime`.
    pub fn new(device: &SharedDevice, config: ConnectionConfig, runtime: Handle) -> Self {
        let (device_id, endpoint) = {
            let device = device.read();
            (device.id(), device.endpoint())
        };
        let listeners = Arc::new(ConnectionListenerChain::default());
        let (events, events_rx) = mpsc::unbounded_channel();
        runtime.spawn(dispatch_events(device_id, listeners.clone(), events_rx));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Connection {
            inner: Arc::new(Inner {
                device_id,
                device: Mutex::new(device.downgrade()),
                endpoint: Mutex::new(endpoint),
                state: Mutex::new(SessionState::Disconnected),
                state_tx,
                pending: Mutex::new(HashMap::new()),
                last_error: Mutex::new(None),
                listeners,
                events,
                next_command_id: AtomicU32::new(1),
                next_attempt: AtomicU64::new(1),
                released: AtomicBool::new(false),
                config,
                runtime,
            }),
        }
    }

    pub fn device_id(&self) -> u64 {
        self.inner.device_id
    }

    /// The device this connection talks to, unless it was dropped.
    pub fn device(&self) -> Option<SharedDevice> {
        lock(&self.inner.device).upgrade()
    }

    /// Re-points the connection at another snapshot of the same device. The
    /// next connect uses its address. Returns `false` for a different device.
    pub fn set_device(&self, device: &SharedDevice) -> bool {
        let (id, endpoint) = {
            let device = device.read();
            (device.id(), device.endpoint())
        };
        if id != self.inner.device_id {
            warn!(
                "device {:#x}: refusing to re-point at device {:#x}",
                self.inner.device_id, id
            );
            return false;
        }
        *lock(&self.inner.device) = device.downgrade();
        *lock(&self.inner.endpoint) = endpoint;
        true
    }

    /// Address used by the next connect.
    pub fn endpoint(&self) -> SocketAddr {
        match self.device() {
            Some(device) => device.read().endpoint(),
            None => *lock(&self.inner.endpoint),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).public()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Number of commands awaiting a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Allocates a command id. Ids increase monotonically per connection.
    pub fn next_command_id(&self) -> u32 {
        self.inner.next_command_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Replaces the primary listener, which is notified after all
    /// interceptors.
    pub fn set_listener(&self, listener: Option<Arc<dyn ConnectionListener>>) {
        *lock(&self.inner.listeners.primary) = listener;
    }

    pub fn add_interceptor(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.inner.listeners.add_interceptor(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /**
    Starts connecting in the background.

    Does nothing unless the connection is disconnected. The outcome is reported
    through `on_connected` or `on_connection_error`. Returns whether a new
    attempt was started.
     */
    pub fn connect(&self) -> bool {
        let inner = &self.inner;
        if self.is_released() {
            warn!("device {:#x}: connection was released", inner.device_id);
            return false;
        }
        let endpoint = self.endpoint();
        let mut state = lock(&inner.state);
        if !matches!(*state, SessionState::Disconnected) {
            return false;
        }
        *lock(&inner.endpoint) = endpoint;
        *lock(&inner.last_error) = None;

        let attempt = inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(inner);
        let device_id = inner.device_id;
        let config = inner.config.clone();
        let task = inner.runtime.spawn(async move {
            let result = open_socket(device_id, endpoint, &config).await;
            match weak.upgrade() {
                Some(inner) => inner.finish_connect(attempt, result),
                None => debug!("device {:#x}: connection dropped while connecting", device_id),
            }
        });
        inner.set_state(&mut state, SessionState::Connecting { attempt, task });
        true
    }

    /// Connects and waits for the outcome. Returns immediately when already
    /// connected.
    pub async fn connect_and_wait(&self) -> Result<(), ConnectionError> {
        if self.is_released() {
            return Err(ConnectionError::Released(self.inner.device_id));
        }
        let mut state = self.subscribe_state();
        self.connect();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    let error = lock(&self.inner.last_error).clone();
                    return Err(error.unwrap_or(ConnectionError::NotConnected(self.inner.device_id)));
                }
                ConnectionState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(ConnectionError::NotConnected(self.inner.device_id));
            }
        }
    }

    /**
    Queues a command for writing and returns without waiting.

    Fails with [`ConnectionError::NotConnected`] unless connected, and with
    [`ConnectionError::DuplicateCommandId`] while another command with the same
    id awaits its reply. In both cases nothing is queued.
     */
    pub fn send(&self, command: Command) -> Result<PendingReply, ConnectionError> {
        let inner = &self.inner;
        let state = lock(&inner.state);
        let SessionState::Connected(session) = &*state else {
            return Err(ConnectionError::NotConnected(inner.device_id));
        };

        let id = command.id();
        let (reply_tx, rx) = oneshot::channel();
        match lock(&inner.pending).entry(id) {
            Entry::Occupied(_) => return Err(ConnectionError::DuplicateCommandId(id)),
            Entry::Vacant(entry) => {
                entry.insert(PendingCommand {
                    command: command.clone(),
                    submitted_at: Instant::now(),
                    reply_tx,
                });
            }
        }
        if session.writer_tx.send(command).is_err() {
            lock(&inner.pending).remove(&id);
            return Err(ConnectionError::NotConnected(inner.device_id));
        }
        Ok(PendingReply {
            id,
            device_id: inner.device_id,
            rx,
        })
    }

    /// Closes the session, or cancels a running connect attempt.
    ///
    /// Pending commands resolve with [`ConnectionError::Closed`]. Listeners
    /// see `on_disconnected` once per session, no matter how many callers race
    /// here. Returns whether anything was closed.
    pub fn disconnect(&self) -> bool {
        self.inner.close_session(None, None, None)
    }

    /// Disconnects and refuses any further connect.
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::AcqRel) {
            debug!("device {:#x}: releasing connection", self.inner.device_id);
        }
        self.disconnect();
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device_id", &format_args!("{:#x}", self.inner.device_id))
            .field("state", &self.state())
            .finish()
    }
}

/// Reference to a connection that does not keep it alive.
#[derive(Clone, Default)]
pub struct WeakConnection(Weak<Inner>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}
