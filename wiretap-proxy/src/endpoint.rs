use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EndpointConfig, TimeoutConfig};
use crate::error::ProxyError;
use crate::handler::SocketHandler;
use crate::intercept::PacketInterceptor;
use crate::output::OutputSink;
use crate::role::SocketRole;

/// How often the accept loop polls while a wait is in progress.
const POLL_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Listening,
    Connected,
    Disconnected,
    ShuttingDown,
    Dead,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Listening => write!(f, "listening"),
            LifecycleState::Connected => write!(f, "connected"),
            LifecycleState::Disconnected => write!(f, "disconnected"),
            LifecycleState::ShuttingDown => write!(f, "shutting down"),
            LifecycleState::Dead => write!(f, "dead"),
        }
    }
}

/// One configured proxy: a listening socket, a remote target and at most one
/// relayed connection at a time.
///
/// The accept loop runs on its own thread and is the only place handlers are
/// created, joined and dropped; `disconnect()` from other threads merely
/// requests a teardown under the endpoint lock. Dropping the endpoint
/// requests shutdown but does not wait — call `shutdown()` + `join()` to
/// know the listening port is released.
pub struct ProxyEndpoint {
    shared: Arc<EndpointShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct EndpointShared {
    id: Uuid,
    name: RwLock<String>,
    bind_host: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    timeouts: TimeoutConfig,
    read_buffer_size: usize,
    listener: Mutex<Option<TcpListener>>,
    interceptor: RwLock<Arc<dyn PacketInterceptor>>,
    output: Arc<dyn OutputSink>,
    shutdown: AtomicBool,
    conn: Mutex<Connection>,
}

struct Connection {
    client: Option<SocketHandler>,
    server: Option<SocketHandler>,
    connected: bool,
    disconnect_requested: bool,
    state: LifecycleState,
}

impl ProxyEndpoint {
    /// Binds the listening socket. A bind failure is fatal: the endpoint is
    /// never usable and no thread has been started.
    pub fn new(
        config: EndpointConfig,
        interceptor: Arc<dyn PacketInterceptor>,
        output: Arc<dyn OutputSink>,
    ) -> Result<Self, ProxyError> {
        if config.name.is_empty() {
            return Err(ProxyError::Config("endpoint name must not be empty".into()));
        }
        let addr = format!("{}:{}", config.listen.host, config.listen.port);
        let listener = bind_listener(&addr).map_err(|source| ProxyError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        // Resolves port 0 to the actual assignment.
        let local_port = listener.local_addr()?.port();

        let shared = Arc::new(EndpointShared {
            id: Uuid::new_v4(),
            name: RwLock::new(config.name),
            bind_host: config.listen.host,
            local_port,
            remote_host: config.remote.host,
            remote_port: config.remote.port,
            timeouts: config.timeouts,
            read_buffer_size: config.read_buffer_size,
            listener: Mutex::new(Some(listener)),
            interceptor: RwLock::new(interceptor),
            output,
            shutdown: AtomicBool::new(false),
            conn: Mutex::new(Connection {
                client: None,
                server: None,
                connected: false,
                disconnect_requested: false,
                state: LifecycleState::Listening,
            }),
        });
        shared.report(format!("listening on {}:{}", shared.bind_host, local_port));
        Ok(Self {
            shared,
            thread: Mutex::new(None),
        })
    }

    /// Begins the accept loop thread.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(&self) {
        let mut slot = lock(&self.thread);
        if slot.is_some() {
            panic!("endpoint {} started twice", self.shared.name());
        }
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("endpoint-{}", shared.name()))
            .spawn(move || accept_loop(shared))
            .expect("failed to spawn endpoint thread");
        *slot = Some(thread);
    }

    /// Requests termination. Non-blocking and idempotent; pair with `join`
    /// to know all sockets are released.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut conn = self.shared.lock_conn();
        if conn.state != LifecycleState::Dead {
            conn.state = LifecycleState::ShuttingDown;
        }
    }

    /// Waits for the accept loop thread to finish. No-op if it never started
    /// or was already joined.
    pub fn join(&self) {
        let thread = lock(&self.thread).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("endpoint {} accept loop panicked", self.shared.name());
            }
        }
    }

    /// Tears down the active connection, if any, without touching the
    /// listening socket. Calling it when nothing is connected is a no-op.
    pub fn disconnect(&self) {
        self.shared.request_disconnect();
    }

    /// Queues bytes on the handler for `role`. Silently discards the data
    /// when that side is not connected: there is no destination for it.
    pub fn send_data(&self, role: SocketRole, data: Vec<u8>) {
        self.shared.send_data(role, data);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock_conn().connected
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lock_conn().state
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> String {
        self.shared.name()
    }

    /// Renames the endpoint. Sockets and threads are unaffected; uniqueness
    /// is the registry's concern.
    pub fn set_name(&self, name: impl Into<String>) {
        *self
            .shared
            .name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn bind(&self) -> (String, u16) {
        (self.shared.bind_host.clone(), self.shared.local_port)
    }

    pub fn remote(&self) -> (String, u16) {
        (self.shared.remote_host.clone(), self.shared.remote_port)
    }

    pub fn client_peer(&self) -> Option<SocketAddr> {
        self.shared
            .lock_conn()
            .client
            .as_ref()
            .map(SocketHandler::peer)
    }

    pub fn server_peer(&self) -> Option<SocketAddr> {
        self.shared
            .lock_conn()
            .server
            .as_ref()
            .map(SocketHandler::peer)
    }

    /// Swaps the interception callback, returning the previous one. Takes
    /// effect on the next received packet; in-flight dispatches finish with
    /// the old instance.
    pub fn swap_interceptor(
        &self,
        interceptor: Arc<dyn PacketInterceptor>,
    ) -> Arc<dyn PacketInterceptor> {
        let mut current = self
            .shared
            .interceptor
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, interceptor)
    }

    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ProxyEndpoint {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name())
            .field("bind_host", &self.shared.bind_host)
            .field("local_port", &self.shared.local_port)
            .field("remote_host", &self.shared.remote_host)
            .field("remote_port", &self.shared.remote_port)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.shared.name();
        let conn = self.shared.lock_conn();
        let port = self.shared.local_port;
        let remote = format!("{}:{}", self.shared.remote_host, self.shared.remote_port);
        match conn.state {
            LifecycleState::ShuttingDown | LifecycleState::Dead => write!(f, "{name} [DEAD]"),
            LifecycleState::Connected => {
                let client = peer_label(conn.client.as_ref());
                write!(f, "{name} [E] {client} <---> :{port} <---> {remote}")
            }
            _ if conn.client.is_some() => {
                let client = peer_label(conn.client.as_ref());
                write!(f, "{name} [C] {client} <---> :{port} >---> {remote}")
            }
            _ => {
                let bind = &self.shared.bind_host;
                write!(f, "{name} [L] {bind} >---> :{port} X---X {remote}")
            }
        }
    }
}

fn peer_label(handler: Option<&SocketHandler>) -> String {
    match handler {
        Some(handler) => handler.peer().to_string(),
        None => "?".to_string(),
    }
}

/// Cloneable view of an endpoint handed to interceptors and handler threads.
#[derive(Clone)]
pub struct EndpointHandle {
    shared: Arc<EndpointShared>,
}

impl EndpointHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> String {
        self.shared.name()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock_conn().connected
    }

    pub fn send_data(&self, role: SocketRole, data: Vec<u8>) {
        self.shared.send_data(role, data);
    }

    pub fn send_to_client(&self, data: Vec<u8>) {
        self.send_data(SocketRole::Client, data);
    }

    pub fn send_to_server(&self, data: Vec<u8>) {
        self.send_data(SocketRole::Server, data);
    }

    pub fn disconnect(&self) {
        self.shared.request_disconnect();
    }

    pub(crate) fn interceptor(&self) -> Arc<dyn PacketInterceptor> {
        Arc::clone(
            &self
                .shared
                .interceptor
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub(crate) fn emit(&self, lines: Vec<String>) {
        self.shared.output.emit(lines);
    }

    pub(crate) fn report(&self, line: String) {
        self.shared.report(line);
    }

    pub(crate) fn request_disconnect(&self) {
        self.shared.request_disconnect();
    }

    pub(crate) fn write_timeout(&self) -> Duration {
        self.shared.timeouts.write_timeout()
    }

    pub(crate) fn idle_sleep(&self) -> Duration {
        self.shared.timeouts.idle_sleep()
    }

    pub(crate) fn drain_pause(&self) -> Duration {
        self.shared.timeouts.drain_pause()
    }

    pub(crate) fn read_buffer_size(&self) -> usize {
        self.shared.read_buffer_size
    }
}

impl EndpointShared {
    fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, line: String) {
        self.output.emit(vec![format!("[{}]: {line}", self.name())]);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn send_data(&self, role: SocketRole, data: Vec<u8>) {
        let conn = self.lock_conn();
        let handler = match role {
            SocketRole::Client => conn.client.as_ref(),
            SocketRole::Server => conn.server.as_ref(),
        };
        if let Some(handler) = handler {
            let _ = handler.try_send(data);
        }
    }

    /// Stops both handlers and flags the connection for teardown. The accept
    /// loop performs the joins; this must never block on a handler thread,
    /// since it may be called from one.
    fn request_disconnect(&self) {
        let mut conn = self.lock_conn();
        if conn.client.is_none() && conn.server.is_none() && !conn.connected {
            return;
        }
        if let Some(client) = conn.client.as_ref() {
            client.stop();
        }
        if let Some(server) = conn.server.as_ref() {
            server.stop();
        }
        conn.connected = false;
        conn.disconnect_requested = true;
        if conn.state == LifecycleState::Connected {
            conn.state = LifecycleState::Disconnected;
        }
    }

    /// Returns true while an active connection still needs the accept loop
    /// to stay away from `accept`. Performs the teardown (join + clear) once
    /// a disconnect was requested or a handler died.
    fn service_connection(&self) -> bool {
        let mut conn = self.lock_conn();
        if conn.client.is_none() && conn.server.is_none() {
            return false;
        }
        let teardown = conn.disconnect_requested
            || self.is_shutdown()
            || conn.client.as_ref().is_some_and(SocketHandler::is_finished)
            || conn.server.as_ref().is_some_and(SocketHandler::is_finished);
        if !teardown {
            return true;
        }
        let client = conn.client.take();
        let server = conn.server.take();
        conn.connected = false;
        conn.disconnect_requested = false;
        conn.state = LifecycleState::Disconnected;
        // Joining with the lock held would deadlock against a handler
        // blocked in send_data or request_disconnect.
        drop(conn);
        stop_and_join(client);
        stop_and_join(server);
        let mut conn = self.lock_conn();
        conn.state = if self.is_shutdown() {
            LifecycleState::ShuttingDown
        } else {
            LifecycleState::Listening
        };
        drop(conn);
        self.report("disconnected".to_string());
        false
    }

    /// One bounded accept wait. Returns `None` on timeout or shutdown.
    fn wait_for_client(&self) -> Option<TcpStream> {
        let deadline = Instant::now() + self.timeouts.accept_timeout();
        loop {
            if self.is_shutdown() {
                return None;
            }
            let attempt = {
                let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
                match listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return None,
                }
            };
            match attempt {
                Ok((socket, peer)) => {
                    debug!("accepted connection from {peer}");
                    return Some(socket);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    thread::sleep(POLL_SLICE);
                }
                Err(err) => {
                    self.report(format!("accept error: {err}"));
                    thread::sleep(POLL_SLICE);
                }
            }
        }
    }
}

fn accept_loop(shared: Arc<EndpointShared>) {
    debug!("accept loop started for {}", shared.name());
    while !shared.is_shutdown() {
        if shared.service_connection() {
            thread::sleep(POLL_SLICE);
            continue;
        }
        let Some(socket) = shared.wait_for_client() else {
            continue;
        };
        attach_client(&shared, socket);
    }
    finish(&shared);
    debug!("accept loop finished for {}", shared.name());
}

/// Dials the remote and starts both handlers, or discards the client again.
/// Runs only on the accept loop thread.
fn attach_client(shared: &Arc<EndpointShared>, socket: TcpStream) {
    let mut client = match SocketHandler::new(socket, SocketRole::Client) {
        Ok(client) => client,
        Err(err) => {
            shared.report(format!("new client rejected: {err}"));
            return;
        }
    };
    shared.report(format!("client connected: {}", client.peer()));
    shared.report(format!(
        "connecting to {}:{}",
        shared.remote_host, shared.remote_port
    ));

    let dial = TcpStream::connect((shared.remote_host.as_str(), shared.remote_port))
        .and_then(|socket| SocketHandler::new(socket, SocketRole::Server));
    let mut server = match dial {
        Ok(server) => server,
        Err(err) => {
            // Dropping the never-started client handler closes its socket;
            // the endpoint keeps listening.
            shared.report(format!(
                "unable to connect to {}:{}: {err}",
                shared.remote_host, shared.remote_port
            ));
            return;
        }
    };

    let handle = EndpointHandle {
        shared: Arc::clone(shared),
    };
    let mut conn = shared.lock_conn();
    client.start(handle.clone());
    server.start(handle);
    conn.client = Some(client);
    conn.server = Some(server);
    conn.connected = true;
    conn.disconnect_requested = false;
    conn.state = LifecycleState::Connected;
    drop(conn);
    shared.report("connection established".to_string());
}

/// Final teardown on shutdown: stop and join any handlers, close the
/// listening socket, mark the endpoint dead.
fn finish(shared: &EndpointShared) {
    let mut conn = shared.lock_conn();
    let client = conn.client.take();
    let server = conn.server.take();
    conn.connected = false;
    conn.disconnect_requested = false;
    drop(conn);
    stop_and_join(client);
    stop_and_join(server);
    shared
        .listener
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    shared.lock_conn().state = LifecycleState::Dead;
    shared.report("shut down".to_string());
}

fn stop_and_join(handler: Option<SocketHandler>) {
    if let Some(mut handler) = handler {
        handler.stop();
        handler.join();
    }
}

/// Builds the listening socket with `SO_REUSEADDR` so a freshly shut down
/// endpoint's port can be rebound immediately.
fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let resolved = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "address resolved to nothing"))?;
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(resolved),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&resolved.into())?;
    socket.listen(1)?;
    Ok(socket.into())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
