use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::endpoint::EndpointHandle;
use crate::queue::OutboundQueue;
use crate::role::SocketRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopping,
    Finished,
}

/// Owns one side's connected socket and its outbound queue.
///
/// The socket itself is touched only by the handler's own loop thread; every
/// other thread interacts through the queue and the lock-protected run
/// state. `stop()` only requests termination — the loop performs the final
/// drain and the socket close itself.
pub struct SocketHandler {
    role: SocketRole,
    peer: SocketAddr,
    shared: Arc<HandlerShared>,
    socket: Option<TcpStream>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct HandlerShared {
    role: SocketRole,
    peer: SocketAddr,
    queue: OutboundQueue,
    state: Mutex<RunState>,
}

impl HandlerShared {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        *self.lock_state() == RunState::Running
    }

    fn set_state(&self, state: RunState) {
        *self.lock_state() = state;
    }
}

impl SocketHandler {
    /// Wraps an already-connected socket. The peer address is captured once
    /// here so it stays available after the socket goes away.
    pub fn new(socket: TcpStream, role: SocketRole) -> io::Result<Self> {
        let peer = socket.peer_addr()?;
        Ok(Self {
            role,
            peer,
            shared: Arc::new(HandlerShared {
                role,
                peer,
                queue: OutboundQueue::new(),
                state: Mutex::new(RunState::Idle),
            }),
            socket: Some(socket),
            thread: None,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues bytes for transmission in FIFO order.
    ///
    /// # Panics
    ///
    /// Panics if the handler has already shut down its socket; sending on a
    /// closed handler is a programming error.
    pub fn send(&self, data: Vec<u8>) {
        if !self.try_send(data) {
            panic!("send on closed {} handler [{}]", self.role, self.peer);
        }
    }

    /// Like `send`, but silently discards the buffer once the handler has
    /// closed its socket. Used by the endpoint, where data addressed to a
    /// side that is going away simply has no destination any more.
    pub(crate) fn try_send(&self, data: Vec<u8>) -> bool {
        if *self.shared.lock_state() == RunState::Finished {
            return false;
        }
        self.shared.queue.enqueue(data);
        true
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.lock_state() == RunState::Finished
    }

    /// Starts the I/O loop thread.
    ///
    /// # Panics
    ///
    /// Panics if called twice; a handler is never reused after it stops.
    pub fn start(&mut self, endpoint: EndpointHandle) {
        {
            let mut state = self.shared.lock_state();
            if *state != RunState::Idle {
                panic!("{} handler [{}] started twice", self.role, self.peer);
            }
            *state = RunState::Running;
        }
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => panic!("{} handler [{}] has no socket", self.role, self.peer),
        };
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("{}-handler-{}", self.role, self.peer))
            .spawn(move || run_loop(socket, shared, endpoint))
            .expect("failed to spawn handler thread");
        self.thread = Some(thread);
    }

    /// Requests the loop to stop. Non-blocking; pair with `join` to know the
    /// socket is closed.
    pub fn stop(&self) {
        let mut state = self.shared.lock_state();
        match *state {
            RunState::Running => *state = RunState::Stopping,
            RunState::Idle => *state = RunState::Finished,
            RunState::Stopping | RunState::Finished => {}
        }
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(
                    "{} handler [{}] loop thread panicked",
                    self.role, self.peer
                );
            }
        }
    }
}

fn run_loop(mut socket: TcpStream, shared: Arc<HandlerShared>, endpoint: EndpointHandle) {
    let label = format!("{} [{}]", shared.role, shared.peer);
    if let Err(err) = socket
        .set_nonblocking(true)
        .and_then(|()| socket.set_write_timeout(Some(endpoint.write_timeout())))
    {
        endpoint.report(format!("could not configure socket for {label}: {err}"));
        shared.set_state(RunState::Finished);
        endpoint.request_disconnect();
        return;
    }

    let idle_sleep = endpoint.idle_sleep();
    let mut buf = vec![0u8; endpoint.read_buffer_size()];
    debug!("handler loop started for {label}");

    loop {
        let mut did_work = false;
        let mut fatal = false;

        match socket.read(&mut buf) {
            // Zero-length read means the peer closed; never forwarded as an
            // empty packet.
            Ok(0) => {
                endpoint.report(format!("connection closed by {label}"));
                fatal = true;
            }
            Ok(n) => {
                did_work = true;
                dispatch(&buf[..n], &shared, &endpoint, &label);
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(err) => {
                endpoint.report(format!("recv error on {label}: {err}"));
                fatal = true;
            }
        }

        if !fatal && !shared.queue.is_empty() {
            match flush_queue(&mut socket, &shared.queue) {
                Ok(wrote) => did_work = did_work || wrote,
                Err(err) => {
                    endpoint.report(format!("send error on {label}: {err}"));
                    fatal = true;
                }
            }
        }

        if fatal {
            endpoint.request_disconnect();
            break;
        }
        if !did_work {
            thread::sleep(idle_sleep);
        }
        if !shared.is_running() {
            break;
        }
    }

    // Drain whatever is still queued, best effort, then close. Only this
    // thread ever touches the socket, so no lock is needed here.
    let pause = endpoint.drain_pause();
    thread::sleep(pause);
    if let Err(err) = flush_queue(&mut socket, &shared.queue) {
        debug!("final drain failed for {label}: {err}");
    }
    thread::sleep(pause);
    let _ = socket.shutdown(Shutdown::Both);
    shared.set_state(RunState::Finished);
    debug!("handler loop finished for {label}");
}

fn dispatch(data: &[u8], shared: &HandlerShared, endpoint: &EndpointHandle, label: &str) {
    let interceptor = endpoint.interceptor();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        interceptor.on_packet(data, endpoint, shared.role)
    }));
    match result {
        Ok(lines) => endpoint.emit(lines),
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            endpoint.emit(vec![
                format!("interceptor panicked on data from {label}: {reason}"),
                format!(
                    "offending packet: {} bytes from {}",
                    data.len(),
                    shared.role
                ),
            ]);
            endpoint.request_disconnect();
        }
    }
}

/// Writes every queued buffer in enqueue order. The socket is flipped to
/// blocking mode for the writes so a buffer is never left half-sent; the
/// write timeout bounds how long a stalled peer can hold the loop.
fn flush_queue(socket: &mut TcpStream, queue: &OutboundQueue) -> io::Result<bool> {
    let pending = queue.drain_pending();
    if pending.is_empty() {
        return Ok(false);
    }
    socket.set_nonblocking(false)?;
    let result = write_all_buffers(socket, &pending);
    socket.set_nonblocking(true)?;
    result.map(|()| true)
}

fn write_all_buffers(socket: &mut TcpStream, buffers: &[Vec<u8>]) -> io::Result<()> {
    for buffer in buffers {
        socket.write_all(buffer)?;
    }
    socket.flush()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    use crate::config::EndpointConfig;
    use crate::endpoint::ProxyEndpoint;
    use crate::intercept::Passthrough;
    use crate::output::output_channel;
    use crate::role::SocketRole;

    use super::SocketHandler;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (dialed, accepted)
    }

    fn idle_endpoint() -> ProxyEndpoint {
        let (sink, _lines) = output_channel();
        let config = EndpointConfig::new("handler-test", "127.0.0.1", 0, "127.0.0.1", 1);
        ProxyEndpoint::new(config, Arc::new(Passthrough::default()), Arc::new(sink)).unwrap()
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn starting_twice_panics() {
        let endpoint = idle_endpoint();
        let (socket, _other) = connected_pair();
        let mut handler = SocketHandler::new(socket, SocketRole::Client).unwrap();
        handler.start(endpoint.handle());
        handler.start(endpoint.handle());
    }

    #[test]
    #[should_panic(expected = "send on closed")]
    fn sending_after_close_panics() {
        let endpoint = idle_endpoint();
        let (socket, _other) = connected_pair();
        let mut handler = SocketHandler::new(socket, SocketRole::Server).unwrap();
        handler.start(endpoint.handle());
        handler.stop();
        handler.join();
        assert!(handler.is_finished());
        handler.send(b"too late".to_vec());
    }

    #[test]
    fn stop_before_start_finishes_immediately() {
        let (socket, _other) = connected_pair();
        let handler = SocketHandler::new(socket, SocketRole::Client).unwrap();
        handler.stop();
        assert!(handler.is_finished());
        assert!(!handler.try_send(b"dropped".to_vec()));
    }
}
