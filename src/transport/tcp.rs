//! The TCP stream transport: listen/accept, connect, dual-socket handshake
//! pairing, and non-blocking framed I/O.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Socket, Type};

use crate::config::TcpOptions;
use crate::error::{CoreError, TransportError};
use crate::header::TlvFrame;
use crate::id::SessionId;
use crate::nexus::{Nexus, NexusEvent};
use crate::task::TaskPool;
use crate::transport::handshake::{HandshakeMessage, SockType, HANDSHAKE_WIRE_SIZE};
use crate::transport::pending::PendingConnection;

/// Linux `EINPROGRESS`; a non-blocking `connect()` in flight surfaces this
/// raw errno rather than `WouldBlock` on most platforms.
const EINPROGRESS: i32 = 115;

/// Lifecycle of a stream transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Listen,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Destroyed,
}

enum SocketHandle {
    Single(TcpStream),
    Dual { ctl: TcpStream, data: TcpStream },
}

impl SocketHandle {
    fn fds(&self) -> Vec<RawFd> {
        match self {
            Self::Single(s) => vec![s.as_raw_fd()],
            Self::Dual { ctl, data } => vec![ctl.as_raw_fd(), data.as_raw_fd()],
        }
    }
}

fn is_connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(EINPROGRESS)
}

fn resolve_uri(uri: &str) -> Result<SocketAddr, TransportError> {
    let stripped = uri.strip_prefix("tcp://").unwrap_or(uri);
    stripped
        .to_socket_addrs()
        .map_err(TransportError::AddressResolution)?
        .next()
        .ok_or(TransportError::InvalidArgument("uri resolved to no addresses"))
}

/// AF_INET, nonblocking, `SO_REUSEADDR`, plus the configurable knobs.
fn new_nonblocking_socket(options: &TcpOptions) -> Result<Socket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(TransportError::Io)?;
    socket.set_nonblocking(true).map_err(TransportError::Io)?;
    socket.set_reuse_address(true).map_err(TransportError::Io)?;
    if options.tcp_no_delay {
        socket.set_tcp_nodelay(true).map_err(TransportError::Io)?;
    }
    if options.tcp_so_sndbuf > 0 {
        socket.set_send_buffer_size(options.tcp_so_sndbuf as usize).map_err(TransportError::Io)?;
    }
    if options.tcp_so_rcvbuf > 0 {
        socket.set_recv_buffer_size(options.tcp_so_rcvbuf as usize).map_err(TransportError::Io)?;
    }
    Ok(socket)
}

/// Hold `/dev/cpu_dma_latency` open at zero to pin the CPU in C0.
/// Best-effort: unavailable on most non-bare-metal hosts, so failures are
/// logged, never fatal.
fn hold_cpu_dma_latency(options: &TcpOptions) -> Option<std::fs::File> {
    if !options.enable_dma_latency {
        return None;
    }
    match std::fs::OpenOptions::new().write(true).open("/dev/cpu_dma_latency") {
        Ok(mut file) => match file.write_all(&0i32.to_ne_bytes()) {
            Ok(()) => Some(file),
            Err(e) => {
                log::warn!("failed to pin cpu_dma_latency: {e}");
                None
            }
        },
        Err(e) => {
            log::warn!("cpu_dma_latency unavailable: {e}");
            None
        }
    }
}

/// The server-side listen/accept/pairing state machine.
pub struct TcpListenerTransport {
    listener: TcpListener,
    dual_sock: bool,
    pending: RefCell<Vec<PendingConnection>>,
    task_pool: Rc<TaskPool>,
    nexus: Rc<Nexus>,
    _dma_latency_guard: Option<std::fs::File>,
}

impl TcpListenerTransport {
    pub fn listen(uri: &str, dual_sock: bool, options: &TcpOptions, nexus: Rc<Nexus>) -> Result<Self, TransportError> {
        let options = options.snapshot()?;
        let addr = resolve_uri(uri)?;
        let socket = new_nonblocking_socket(options)?;
        socket.bind(&addr.into()).map_err(TransportError::Io)?;
        socket.listen(128).map_err(TransportError::Io)?;
        let listener: TcpListener = socket.into();
        Ok(Self {
            listener,
            dual_sock,
            pending: RefCell::new(Vec::new()),
            task_pool: Rc::new(TaskPool::new()),
            nexus,
            _dma_latency_guard: hold_cpu_dma_latency(options),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::Io)
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn task_pool(&self) -> Rc<TaskPool> {
        self.task_pool.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Drain every ready accept, then attempt handshake pairing.
    pub fn accept_ready(&self) -> Result<Vec<TcpTransport>, TransportError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    stream.set_nonblocking(true).map_err(TransportError::Io)?;
                    self.pending.borrow_mut().push(PendingConnection::new(stream, peer_addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        self.pump_handshakes()
    }

    fn pump_handshakes(&self) -> Result<Vec<TcpTransport>, TransportError> {
        let mut ready_single = Vec::new();
        let mut finished = Vec::new();
        {
            let mut pending = self.pending.borrow_mut();
            let mut i = 0;
            while i < pending.len() {
                match pending[i].try_read_handshake() {
                    Ok(Some(handshake)) => {
                        if !self.dual_sock || handshake.sock_type == SockType::Single {
                            let entry = pending.remove(i);
                            ready_single.push(entry);
                            continue;
                        }
                        finished.push(i);
                        i += 1;
                    }
                    Ok(None) => i += 1,
                    Err(e) => {
                        log::warn!("pending connection handshake failed: {e}");
                        pending.remove(i);
                    }
                }
            }
        }

        let mut children = Vec::with_capacity(ready_single.len());
        for entry in ready_single {
            children.push(self.spawn_single(entry)?);
        }
        children.extend(self.pair_pending(finished)?);

        // `connection_index` here is this batch's position in `children`,
        // which the caller receives in the same call and can correlate by.
        for connection_index in 0..children.len() {
            self.nexus.broadcast(NexusEvent::NewConnection { connection_index });
        }

        Ok(children)
    }

    /// O(n²) scan over handshake-complete pending connections, pairing ctl
    /// and data halves by peer address and cross-checked second port.
    /// Acceptable since n is the accept-burst size, not total connections.
    fn pair_pending(&self, finished_indices: Vec<usize>) -> Result<Vec<TcpTransport>, TransportError> {
        let mut pending = self.pending.borrow_mut();
        let mut handshakes: Vec<(usize, HandshakeMessage)> = Vec::new();
        for idx in finished_indices {
            if let Ok(Some(h)) = pending[idx].try_read_handshake() {
                handshakes.push((idx, h));
            }
        }

        let mut consumed = vec![false; handshakes.len()];
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut abandoned: Vec<usize> = Vec::new();
        for a in 0..handshakes.len() {
            if consumed[a] {
                continue;
            }
            for b in (a + 1)..handshakes.len() {
                if consumed[b] {
                    continue;
                }
                let (ia, ha) = &handshakes[a];
                let (ib, hb) = &handshakes[b];
                let addr_a = pending[*ia].peer_addr;
                let addr_b = pending[*ib].peer_addr;
                if addr_a.ip() != addr_b.ip() {
                    continue;
                }
                if addr_a.port() != hb.second_port || addr_b.port() != ha.second_port {
                    log::warn!("dual-socket handshake port mismatch between {addr_a} and {addr_b}, abandoning both");
                    consumed[a] = true;
                    consumed[b] = true;
                    abandoned.push(*ia);
                    abandoned.push(*ib);
                    break;
                }
                consumed[a] = true;
                consumed[b] = true;
                let (ctl_idx, data_idx) = if ha.sock_type == SockType::Ctl { (*ia, *ib) } else { (*ib, *ia) };
                pairs.push((ctl_idx, data_idx));
                break;
            }
        }

        let mut indices: Vec<usize> = pairs.iter().flat_map(|(c, d)| [*c, *d]).chain(abandoned.iter().copied()).collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let mut removed: HashMap<usize, PendingConnection> = HashMap::new();
        for idx in indices {
            removed.insert(idx, pending.remove(idx));
        }
        drop(pending);

        for idx in &abandoned {
            if let Some(entry) = removed.remove(idx) {
                let _ = entry.stream.shutdown(std::net::Shutdown::Both);
            }
        }

        let mut children = Vec::with_capacity(pairs.len());
        for (ctl_idx, data_idx) in pairs {
            let ctl_entry = removed.remove(&ctl_idx).expect("paired ctl entry present");
            let data_entry = removed.remove(&data_idx).expect("paired data entry present");
            children.push(self.spawn_dual(ctl_entry, data_entry)?);
        }
        Ok(children)
    }

    fn spawn_single(&self, entry: PendingConnection) -> Result<TcpTransport, TransportError> {
        let local_addr = entry.stream.local_addr().map_err(TransportError::Io)?;
        Ok(TcpTransport::from_accepted(SocketHandle::Single(entry.stream), entry.peer_addr, local_addr, self.task_pool.clone()))
    }

    fn spawn_dual(&self, ctl: PendingConnection, data: PendingConnection) -> Result<TcpTransport, TransportError> {
        let local_addr = ctl.stream.local_addr().map_err(TransportError::Io)?;
        let peer_addr = ctl.peer_addr;
        Ok(TcpTransport::from_accepted(
            SocketHandle::Dual { ctl: ctl.stream, data: data.stream },
            peer_addr,
            local_addr,
            self.task_pool.clone(),
        ))
    }
}

/// A connected (or connecting) stream transport handle: the per-endpoint
/// state, whether reached by accept or by `connect`.
pub struct TcpTransport {
    state: RefCell<TransportState>,
    sockets: SocketHandle,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    task_pool: Rc<TaskPool>,
    /// This transport's own nexus. Never shared with sibling transports: a
    /// shared nexus would leak one connection's broadcasts onto another's
    /// subscribers.
    nexus: Rc<Nexus>,
    /// Session id and connection index this transport has been bound to,
    /// once the caller has allocated a [`crate::connection::Connection`] for
    /// it. `None` before that: events are broadcast with a placeholder index
    /// since nothing is subscribed to this fresh nexus yet.
    bound: RefCell<Option<(SessionId, usize)>>,
    rx_scratch: RefCell<HashMap<RawFd, Vec<u8>>>,
    tx_backlog: RefCell<HashMap<RawFd, VecDeque<u8>>>,
}

impl TcpTransport {
    fn from_accepted(sockets: SocketHandle, peer_addr: SocketAddr, local_addr: SocketAddr, task_pool: Rc<TaskPool>) -> Self {
        Self {
            state: RefCell::new(TransportState::Connected),
            sockets,
            peer_addr,
            local_addr,
            task_pool,
            nexus: Rc::new(Nexus::new()),
            bound: RefCell::new(None),
            rx_scratch: RefCell::new(HashMap::new()),
            tx_backlog: RefCell::new(HashMap::new()),
        }
    }

    /// Bind this transport to a session/connection index, so further events
    /// are published to that session alone instead of broadcast.
    pub fn bind(&self, session_id: SessionId, connection_index: usize) {
        *self.bound.borrow_mut() = Some((session_id, connection_index));
    }

    /// This transport's own nexus; subscribe a session to it after [`bind`](Self::bind).
    pub fn nexus(&self) -> Rc<Nexus> {
        self.nexus.clone()
    }

    /// Publish a lifecycle event scoped to whatever this transport is bound
    /// to, or broadcast it with a placeholder index if unbound.
    fn notify(&self, make_event: impl FnOnce(usize) -> NexusEvent) {
        match *self.bound.borrow() {
            Some((session_id, connection_index)) => self.nexus.publish(session_id, make_event(connection_index)),
            None => self.nexus.broadcast(make_event(0)),
        }
    }

    /// Poll `fd` for inbound frames and publish them (or a fatal read error)
    /// to this transport's nexus. Only meaningful once [`bind`](Self::bind)
    /// has been called; before that, nothing is subscribed to observe it.
    pub fn poll_inbound(&self, fd: RawFd) {
        match self.rx_poll(fd) {
            Ok(frames) => {
                if let Some((session_id, connection_index)) = *self.bound.borrow() {
                    for frame in frames {
                        self.nexus.publish(session_id, NexusEvent::NewMessage { connection_index, frame });
                    }
                }
            }
            Err(e) => {
                let connection_index = self.bound.borrow().map(|(_, idx)| idx);
                self.nexus.broadcast(NexusEvent::Error { connection_index, error: CoreError::from(e) });
            }
        }
    }

    /// Client-side connect. Dual mode opens the data fd first, then the
    /// control fd, each a separate non-blocking connect; completion is
    /// driven by [`try_complete_connect`](Self::try_complete_connect).
    pub fn connect(uri: &str, dual_sock: bool, options: &TcpOptions, task_pool: Rc<TaskPool>) -> Result<Self, TransportError> {
        let options = options.snapshot()?;
        let addr = resolve_uri(uri)?;

        let sockets = if dual_sock {
            let data_socket = new_nonblocking_socket(options)?;
            begin_connect(&data_socket, &addr)?;
            let ctl_socket = new_nonblocking_socket(options)?;
            begin_connect(&ctl_socket, &addr)?;
            SocketHandle::Dual { ctl: ctl_socket.into(), data: data_socket.into() }
        } else {
            let socket = new_nonblocking_socket(options)?;
            begin_connect(&socket, &addr)?;
            SocketHandle::Single(socket.into())
        };

        let local_addr = match &sockets {
            SocketHandle::Single(s) => s.local_addr(),
            SocketHandle::Dual { ctl, .. } => ctl.local_addr(),
        }
        .map_err(TransportError::Io)?;

        Ok(Self {
            state: RefCell::new(TransportState::Connecting),
            sockets,
            peer_addr: addr,
            local_addr,
            task_pool,
            nexus: Rc::new(Nexus::new()),
            bound: RefCell::new(None),
            rx_scratch: RefCell::new(HashMap::new()),
            tx_backlog: RefCell::new(HashMap::new()),
        })
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.sockets.fds()
    }

    pub fn task_pool(&self) -> Rc<TaskPool> {
        self.task_pool.clone()
    }

    fn stream_for(&self, fd: RawFd) -> &TcpStream {
        match &self.sockets {
            SocketHandle::Single(s) => s,
            SocketHandle::Dual { ctl, data } => {
                if ctl.as_raw_fd() == fd {
                    ctl
                } else {
                    data
                }
            }
        }
    }

    /// `getsockopt(SO_ERROR)` check; on success sends the dual-socket
    /// handshake(s), transitions to `Connected` and announces `Established`.
    /// Idempotent: calling this again once already `Connected` just
    /// re-confirms success.
    pub fn try_complete_connect(&self) -> Result<bool, TransportError> {
        if matches!(*self.state.borrow(), TransportState::Connected) {
            return Ok(true);
        }
        let streams: Vec<&TcpStream> = match &self.sockets {
            SocketHandle::Single(s) => vec![s],
            SocketHandle::Dual { ctl, data } => vec![ctl, data],
        };
        for stream in streams {
            match stream.take_error() {
                Ok(Some(e)) => return Err(TransportError::Connect(e)),
                Ok(None) => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        self.send_connect_handshake()?;
        *self.state.borrow_mut() = TransportState::Connected;
        self.notify(|connection_index| NexusEvent::Established { connection_index });
        Ok(true)
    }

    /// Announce this fd's role to the peer's accept-side pairing logic.
    fn send_connect_handshake(&self) -> Result<(), TransportError> {
        match &self.sockets {
            SocketHandle::Single(stream) => {
                let mut bytes = [0u8; HANDSHAKE_WIRE_SIZE];
                HandshakeMessage { sock_type: SockType::Single, second_port: 0 }.pack(&mut bytes)?;
                write_all_blocking(stream, &bytes)
            }
            SocketHandle::Dual { ctl, data } => {
                let ctl_port = ctl.local_addr().map_err(TransportError::Io)?.port();
                let data_port = data.local_addr().map_err(TransportError::Io)?.port();

                let mut data_bytes = [0u8; HANDSHAKE_WIRE_SIZE];
                HandshakeMessage { sock_type: SockType::Data, second_port: ctl_port }.pack(&mut data_bytes)?;
                write_all_blocking(data, &data_bytes)?;

                let mut ctl_bytes = [0u8; HANDSHAKE_WIRE_SIZE];
                HandshakeMessage { sock_type: SockType::Ctl, second_port: data_port }.pack(&mut ctl_bytes)?;
                write_all_blocking(ctl, &ctl_bytes)
            }
        }
    }

    /// Non-blocking read-and-reassemble for one fd, capped at
    /// `RX_POLL_NR_MAX` decode iterations per call so one very chatty peer
    /// cannot starve the other fds sharing this reactor tick.
    pub fn rx_poll(&self, fd: RawFd) -> Result<Vec<TlvFrame>, TransportError> {
        const RX_POLL_NR_MAX: usize = 64;
        let mut stream = self.stream_for(fd);
        let mut buf = [0u8; 4096];
        let mut rx_scratch = self.rx_scratch.borrow_mut();
        let scratch = rx_scratch.entry(fd).or_default();
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Err(TransportError::PeerDisconnected),
                Ok(n) => scratch.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        let mut frames = Vec::new();
        let mut count = 0;
        while count < RX_POLL_NR_MAX {
            match TlvFrame::try_decode(scratch)? {
                Some((frame, consumed)) => {
                    scratch.drain(0..consumed);
                    frames.push(frame);
                    count += 1;
                }
                None => break,
            }
        }
        Ok(frames)
    }

    /// Queue frames for transmit and attempt to drain them immediately.
    pub fn send_frames(&self, fd: RawFd, frames: &[TlvFrame]) -> Result<(), TransportError> {
        {
            let mut backlog = self.tx_backlog.borrow_mut();
            let queue = backlog.entry(fd).or_default();
            for frame in frames {
                queue.extend(frame.encode());
            }
        }
        self.pump_tx(fd)
    }

    /// Drain the per-fd outbound byte backlog once the fd is write-ready.
    pub fn pump_tx(&self, fd: RawFd) -> Result<(), TransportError> {
        let mut stream = self.stream_for(fd);
        let mut backlog = self.tx_backlog.borrow_mut();
        let queue = backlog.entry(fd).or_default();
        while !queue.is_empty() {
            let chunk: Vec<u8> = queue.iter().copied().collect();
            match stream.write(&chunk) {
                Ok(0) => return Err(TransportError::PeerDisconnected),
                Ok(n) => {
                    queue.drain(0..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }

    /// Cascades `Listen|Connected → Disconnected → Closed`. Idempotent.
    pub fn on_sock_disconnected(&self, passive: bool) {
        if matches!(*self.state.borrow(), TransportState::Disconnected | TransportState::Closed | TransportState::Destroyed) {
            return;
        }
        *self.state.borrow_mut() = TransportState::Closed;
        if !passive {
            for fd in self.fds() {
                let _ = self.stream_for(fd).shutdown(std::net::Shutdown::Both);
            }
        }
        if passive {
            self.notify(|connection_index| NexusEvent::Disconnected { connection_index });
        }
    }

    /// Flushing task queues is the caller's responsibility (the connection
    /// owns them, not the transport); this only fires the `Closed`
    /// notification and retires the handle.
    pub fn on_sock_close(&self) {
        self.notify(|connection_index| NexusEvent::Closed { connection_index });
        *self.state.borrow_mut() = TransportState::Destroyed;
    }
}

/// Write `bytes` to a non-blocking stream, spinning past `WouldBlock`. Only
/// used for the few-byte handshake message, never for payload data.
fn write_all_blocking(mut stream: &TcpStream, bytes: &[u8]) -> Result<(), TransportError> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(TransportError::PeerDisconnected),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(())
}

fn begin_connect(socket: &Socket, addr: &SocketAddr) -> Result<(), TransportError> {
    match socket.connect(&(*addr).into()) {
        Ok(()) => Ok(()),
        Err(e) if is_connect_in_progress(&e) => Ok(()),
        Err(e) => Err(TransportError::Connect(e)),
    }
}
