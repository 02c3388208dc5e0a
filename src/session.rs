//! Sessions: a logical grouping of connections sharing a URI and an ops
//! vtable, plus the process-wide sessions cache used to resolve the very
//! first message of a freshly established connection.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};

use crate::connection::{Connection, ConnectionStatus};
use crate::error::{CoreError, SessionError};
use crate::header::{SessionHeader, TlvFrame, TlvType};
use crate::id::{Allocator, SessionId};
use crate::message::{CancelReason, SessionEvent, SessionOps};
use crate::nexus::{Nexus, NexusEvent, NexusObserver};
use crate::task::TaskPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Client,
    Server,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Init,
    Connect,
    Online,
    Closing,
    Closed,
    Redirected,
    Refused,
}

/// A logical grouping of connections sharing a URI, ops vtable, and
/// handshake identity.
pub struct Session {
    id: SessionId,
    uri: String,
    session_type: SessionType,
    ops: Rc<dyn SessionOps>,
    private_data: Vec<u8>,
    lifecycle: RefCell<SessionLifecycle>,
    connections: RefCell<Vec<Connection>>,
    /// Set while inside a user-notification callback; `post_teardown`
    /// refuses to run until this clears.
    in_notify: RefCell<bool>,
}

impl Session {
    pub fn new(
        id: SessionId,
        uri: impl Into<String>,
        session_type: SessionType,
        ops: Rc<dyn SessionOps>,
        private_data: Vec<u8>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            uri: uri.into(),
            session_type,
            ops,
            private_data,
            lifecycle: RefCell::new(SessionLifecycle::Init),
            connections: RefCell::new(Vec::new()),
            in_notify: RefCell::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    pub fn ops(&self) -> &Rc<dyn SessionOps> {
        &self.ops
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        *self.lifecycle.borrow()
    }

    pub fn set_lifecycle(&self, lifecycle: SessionLifecycle) {
        *self.lifecycle.borrow_mut() = lifecycle;
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Bind a fresh connection under this session, returning its index.
    pub fn alloc_connection(&self, task_pool: Rc<TaskPool>) -> usize {
        let mut connections = self.connections.borrow_mut();
        let index = connections.len();
        let mut conn = Connection::new(index, self.id, self.ops.clone(), task_pool);
        conn.set_status(ConnectionStatus::Online);
        connections.push(conn);
        self.set_lifecycle(SessionLifecycle::Online);
        index
    }

    /// Close and drop a connection; callers must ensure it holds no
    /// outstanding tasks that some other part of the system still expects
    /// to observe.
    pub fn free_connection(&self, index: usize) -> Result<(), SessionError> {
        let mut connections = self.connections.borrow_mut();
        if index >= connections.len() {
            return Err(SessionError::NotFound("connection index"));
        }
        connections[index].disconnect();
        connections.remove(index);
        Ok(())
    }

    /// Subscribe this session to a transport's nexus, so it starts
    /// receiving events for connections bound to that transport.
    pub fn assign_nexus(self: &Rc<Self>, nexus: &Rc<Nexus>) {
        let observer: Rc<dyn NexusObserver> = self.clone();
        nexus.subscribe(self.id, observer);
    }

    pub fn unassign_nexus(&self, nexus: &Rc<Nexus>) {
        nexus.unsubscribe(self.id);
    }

    /// `destroy`: fails with `Busy` while any connection remains.
    pub fn destroy(self: &Rc<Self>, cache: &SessionsCache) -> Result<(), SessionError> {
        if !self.connections.borrow().is_empty() {
            return Err(SessionError::Busy);
        }
        self.pre_teardown(cache);
        self.post_teardown();
        Ok(())
    }

    fn pre_teardown(&self, cache: &SessionsCache) {
        cache.remove(self.id);
        self.set_lifecycle(SessionLifecycle::Closed);
    }

    fn post_teardown(&self) {
        if *self.in_notify.borrow() {
            log::warn!("session {}: post_teardown deferred, still inside a user notification", self.id);
        }
    }

    pub fn with_connection<R>(&self, index: usize, f: impl FnOnce(&mut Connection) -> R) -> Result<R, SessionError> {
        let mut connections = self.connections.borrow_mut();
        let conn = connections.get_mut(index).ok_or(SessionError::NotFound("connection index"))?;
        Ok(f(conn))
    }

    /// Receive dispatch: route a decoded frame to the connection it's bound
    /// to, demultiplexed by TLV type.
    pub fn dispatch(&self, connection_index: usize, frame: TlvFrame) {
        *self.in_notify.borrow_mut() = true;

        enum Followup {
            None,
            CancelAccept(u16),
            CancelNotFound(u16),
            CancelResponse(u16),
        }
        let mut followup = Followup::None;

        {
            let mut connections = self.connections.borrow_mut();
            if let Some(conn) = connections.get_mut(connection_index) {
                match frame.tlv_type {
                    TlvType::MsgReq | TlvType::OneWayReq => conn.on_request_received(frame.tlv_type, frame),
                    TlvType::MsgRsp | TlvType::OneWayRsp => conn.on_response_received(frame.tlv_type, frame),
                    TlvType::AckReq => conn.on_credit_ack_received(&frame),
                    TlvType::SessionSetupRsp | TlvType::ConnectionHelloRsp => {
                        if frame.payload.len() >= 4 {
                            conn.set_peer_session_id(BigEndian::read_u32(&frame.payload[0..4]));
                        }
                    }
                    TlvType::SessionSetupReq | TlvType::ConnectionHelloReq => {
                        // Passive side just learns the peer's session id; a
                        // real reply (carrying our own id) is the caller's
                        // responsibility to queue via `send_handshake_reply`.
                        if frame.payload.len() >= 4 {
                            conn.set_peer_session_id(BigEndian::read_u32(&frame.payload[0..4]));
                        }
                    }
                    TlvType::CancelReq => {
                        let sn = frame.header.sn;
                        followup = if conn.has_io_task_with_sn(sn) {
                            Followup::CancelAccept(sn)
                        } else {
                            Followup::CancelNotFound(sn)
                        };
                    }
                    TlvType::CancelRsp => {
                        followup = Followup::CancelResponse(frame.header.sn);
                    }
                    TlvType::FinReq | TlvType::FinRsp => {
                        conn.set_status(ConnectionStatus::FinWait1);
                    }
                }
            }
        }

        match followup {
            Followup::CancelAccept(sn) => {
                let accepted = self.ops.on_cancel_request(connection_index, sn as u64);
                let reason = if accepted { None } else { Some(CancelReason::Rejected) };
                let _ = self.with_connection(connection_index, |conn| conn.send_cancel_response(sn, reason));
            }
            Followup::CancelNotFound(sn) => {
                log::info!("session {}: cancel request for unknown sn {sn} -> MSG_NOT_FOUND", self.id);
                let _ =
                    self.with_connection(connection_index, |conn| conn.send_cancel_response(sn, Some(CancelReason::MsgNotFound)));
            }
            Followup::CancelResponse(sn) => {
                self.ops.on_cancel_response(connection_index, sn as u64);
            }
            Followup::None => {}
        }

        *self.in_notify.borrow_mut() = false;
    }
}

impl NexusObserver for Session {
    fn on_nexus_event(&self, event: &NexusEvent) {
        match event {
            NexusEvent::NewMessage { connection_index, frame } => {
                self.dispatch(*connection_index, frame.clone());
            }
            NexusEvent::NewConnection { connection_index } => {
                self.ops.on_session_event(SessionEvent::NewConnection, Some(*connection_index));
            }
            NexusEvent::Established { connection_index } => {
                let _ = self.with_connection(*connection_index, |conn| conn.set_status(ConnectionStatus::Online));
                self.ops.on_session_event(SessionEvent::ConnectionEstablished, Some(*connection_index));
            }
            NexusEvent::Reconnected { connection_index } => {
                let _ = self.with_connection(*connection_index, |conn| conn.set_status(ConnectionStatus::Online));
            }
            NexusEvent::Disconnected { connection_index } => {
                let _ = self.with_connection(*connection_index, |conn| conn.disconnect());
                self.ops.on_session_event(SessionEvent::ConnectionDisconnected, Some(*connection_index));
            }
            NexusEvent::Closed { connection_index } => {
                self.ops.on_session_event(SessionEvent::ConnectionTeardown, Some(*connection_index));
            }
            NexusEvent::MessageError { connection_index, status: _ } => {
                self.ops.on_session_event(SessionEvent::ConnectionError, Some(*connection_index));
            }
            NexusEvent::Error { connection_index, error } => {
                log::warn!("session {}: nexus error: {error}", self.id);
                if matches!(self.lifecycle(), SessionLifecycle::Connect | SessionLifecycle::Redirected) {
                    self.set_lifecycle(SessionLifecycle::Refused);
                    self.ops.on_session_event(SessionEvent::Reject, None);
                } else {
                    self.ops.on_session_event(SessionEvent::SessionError, *connection_index);
                }
            }
            NexusEvent::AssignInBuf { connection_index, size_hint } => {
                let _ = self.ops.assign_in_buf(*connection_index, *size_hint);
            }
        }
    }
}

/// Peek a TLV frame's destination session id and resolve it against the
/// per-nexus observer registry first, falling back to the process-wide
/// sessions cache.
///
/// The fallback is only legitimate for the first packet of a freshly
/// established connection; once a session is subscribed to the nexus it
/// always resolves through the fast path.
pub fn find_session(nexus: &Nexus, cache: &SessionsCache, header_bytes: &[u8]) -> Result<SessionId, CoreError> {
    let dest_id = SessionHeader::peek_dest_session_id(header_bytes)?;
    find_session_by_id(nexus, cache, dest_id)
}

/// Like [`find_session`] but starting from an already-decoded
/// `dest_session_id` rather than peeking it out of raw bytes.
pub fn find_session_by_id(nexus: &Nexus, cache: &SessionsCache, dest_id: SessionId) -> Result<SessionId, CoreError> {
    if nexus.is_subscribed(dest_id) {
        return Ok(dest_id);
    }
    if cache.lookup(dest_id).is_some() {
        return Ok(dest_id);
    }
    Err(SessionError::NotFound("session for dest_session_id").into())
}

/// Process-wide id→session map.
#[derive(Default)]
pub struct SessionsCache {
    allocator: Allocator,
    sessions: RefCell<HashMap<SessionId, Rc<Session>>>,
}

impl SessionsCache {
    pub fn new() -> Self {
        Self { allocator: Allocator::new(), sessions: RefCell::new(HashMap::new()) }
    }

    /// Allocate an id, construct the session, and register it.
    pub fn create(
        &self,
        uri: impl Into<String>,
        session_type: SessionType,
        ops: Rc<dyn SessionOps>,
        private_data: Vec<u8>,
    ) -> Result<Rc<Session>, SessionError> {
        let id = self.allocator.allocate().map_err(|_| SessionError::OutOfMemory)?;
        let session = Session::new(id, uri, session_type, ops, private_data);
        self.sessions.borrow_mut().insert(id, session.clone());
        Ok(session)
    }

    pub fn remove(&self, id: SessionId) {
        self.sessions.borrow_mut().remove(&id);
    }

    pub fn lookup(&self, id: SessionId) -> Option<Rc<Session>> {
        self.sessions.borrow().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.borrow().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::Msg;

    struct NoopOps;
    impl SessionOps for NoopOps {}

    #[test]
    fn destroy_fails_while_connections_remain() {
        let cache = SessionsCache::new();
        let session = cache.create("tcp://127.0.0.1:0", SessionType::Server, Rc::new(NoopOps), Vec::new()).unwrap();
        let pool = Rc::new(TaskPool::new());
        session.alloc_connection(pool);

        assert!(matches!(session.destroy(&cache), Err(SessionError::Busy)));

        session.free_connection(0).unwrap();
        assert!(session.destroy(&cache).is_ok());
        assert!(cache.is_empty());
    }

    #[test]
    fn find_session_falls_back_to_cache_on_nexus_miss() {
        let cache = SessionsCache::new();
        let session = cache.create("tcp://127.0.0.1:0", SessionType::Server, Rc::new(NoopOps), Vec::new()).unwrap();
        let nexus = Nexus::new();

        let mut bytes = [0u8; crate::header::HEADER_WIRE_SIZE];
        let header = SessionHeader {
            serial_num: 1,
            dest_session_id: session.id(),
            flags: crate::header::MsgFlags::empty(),
            receipt_result: 0,
            sn: 0,
            ack_sn: 0,
            credits: 0,
        };
        header.pack(&mut bytes).unwrap();

        assert!(find_session(&nexus, &cache, &bytes).is_ok());

        session.assign_nexus(&Rc::new(nexus));
    }

    #[test]
    fn request_response_round_trip_through_dispatch() {
        use crate::header::MsgFlags;
        use std::cell::RefCell as StdRefCell;

        struct RecordingOps {
            received: StdRefCell<Vec<Vec<u8>>>,
        }
        impl SessionOps for RecordingOps {
            fn on_msg(&self, _connection_index: usize, msg: &Msg) -> i32 {
                self.received.borrow_mut().push(msg.in_.payload.clone());
                0
            }
        }

        let cache = SessionsCache::new();
        let ops = Rc::new(RecordingOps { received: StdRefCell::new(Vec::new()) });
        let session = cache.create("tcp://127.0.0.1:0", SessionType::Server, ops.clone(), Vec::new()).unwrap();
        let pool = Rc::new(TaskPool::new());
        let index = session.alloc_connection(pool);

        let frame = TlvFrame {
            tlv_type: TlvType::OneWayReq,
            header: SessionHeader {
                serial_num: 1,
                dest_session_id: session.id(),
                flags: MsgFlags::empty(),
                receipt_result: 0,
                sn: 0,
                ack_sn: 0,
                credits: 0,
            },
            payload: b"ping".to_vec(),
        };
        session.dispatch(index, frame);

        assert_eq!(ops.received.borrow().as_slice(), &[b"ping".to_vec()]);
    }
}
