//! End-to-end scenarios driving the real TCP transport, session and
//! connection layers together over loopback sockets.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use xio_core::config::TcpOptions;
use xio_core::message::Msg;
use xio_core::nexus::Nexus;
use xio_core::session::{SessionType, SessionsCache};
use xio_core::transport::{TcpListenerTransport, TcpTransport};
use xio_core::SessionOps;

fn poll_until<T>(mut attempt: impl FnMut() -> Option<T>, timeout: Duration) -> T {
    let start = Instant::now();
    loop {
        if let Some(value) = attempt() {
            return value;
        }
        assert!(start.elapsed() < timeout, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct RecordingOps {
    received: RefCell<Vec<(u16, Vec<u8>)>>,
    delivered: RefCell<Vec<(u64, i32)>>,
    ow_complete: RefCell<usize>,
}

impl SessionOps for RecordingOps {
    fn on_msg(&self, _connection_index: usize, msg: &Msg) -> i32 {
        self.received.borrow_mut().push((msg.sn as u16, msg.in_.payload.clone()));
        0
    }
    fn on_msg_delivered(&self, _connection_index: usize, msg: &Msg, receipt_res: i32) {
        self.delivered.borrow_mut().push((msg.sn, receipt_res));
    }
    fn on_ow_msg_send_complete(&self, _connection_index: usize, _msg: &Msg) {
        *self.ow_complete.borrow_mut() += 1;
    }
}

/// S1 — one-way handshake, single-socket: client sends `ONE_WAY_REQ` sn=1
/// payload "ping"; server delivers `on_msg`, client gets
/// `on_ow_msg_send_complete`, no delivery receipt is ever produced.
///
/// Inbound delivery goes through the real nexus wiring: each transport binds
/// to the session/connection index it was allocated for, and `poll_inbound`
/// publishes decoded frames to the bound session rather than the test
/// calling `Session::dispatch` directly.
#[test]
fn s1_one_way_handshake_single_socket() {
    let options = TcpOptions::default();
    let listener_nexus = Rc::new(Nexus::new());
    let server_transport = TcpListenerTransport::listen("tcp://127.0.0.1:0", false, &options, listener_nexus).unwrap();
    let addr = server_transport.local_addr().unwrap();

    let client_pool = Rc::new(xio_core::task::TaskPool::new());
    let client_transport = TcpTransport::connect(&format!("tcp://{addr}"), false, &options, client_pool).unwrap();

    poll_until(|| client_transport.try_complete_connect().ok().filter(|done| *done), Duration::from_secs(2));

    let server_children = poll_until(
        || {
            let ready = server_transport.accept_ready().unwrap();
            if ready.is_empty() {
                None
            } else {
                Some(ready)
            }
        },
        Duration::from_secs(2),
    );
    assert_eq!(server_children.len(), 1);
    let server_child = &server_children[0];

    let server_cache = SessionsCache::new();
    let server_ops = Rc::new(RecordingOps::default());
    let server_session =
        server_cache.create("tcp://127.0.0.1:0", SessionType::Server, server_ops.clone(), Vec::new()).unwrap();
    let server_conn_index = server_session.alloc_connection(server_child.task_pool());
    server_child.bind(server_session.id(), server_conn_index);
    server_session.assign_nexus(&server_child.nexus());

    let client_ops = Rc::new(RecordingOps::default());
    let client_cache = SessionsCache::new();
    let client_session =
        client_cache.create(&format!("tcp://{addr}"), SessionType::Client, client_ops.clone(), Vec::new()).unwrap();
    let client_conn_index = client_session.alloc_connection(client_transport.task_pool());
    client_transport.bind(client_session.id(), client_conn_index);
    client_session.assign_nexus(&client_transport.nexus());

    let client_handle =
        client_session.with_connection(client_conn_index, |conn| conn.send_one_way(b"ping".to_vec())).unwrap().unwrap();
    let frames = client_session.with_connection(client_conn_index, |conn| conn.drain_tx_ready()).unwrap();
    let client_fd = client_transport.fds()[0];
    client_transport.send_frames(client_fd, &frames).unwrap();

    let server_fd = server_child.fds()[0];
    poll_until(
        || {
            server_child.poll_inbound(server_fd);
            if server_ops.received.borrow().is_empty() {
                None
            } else {
                Some(())
            }
        },
        Duration::from_secs(2),
    );

    assert_eq!(server_ops.received.borrow().as_slice(), &[(1, b"ping".to_vec())]);
    assert!(server_ops.delivered.borrow().is_empty());

    client_session
        .with_connection(client_conn_index, |conn| conn.on_one_way_send_complete(client_handle))
        .unwrap();
    assert_eq!(*client_ops.ow_complete.borrow(), 1);
    assert!(client_ops.delivered.borrow().is_empty());
}

/// S2 — request/response with receipt: client sends `MSG_REQ` sn=... with
/// `REQUEST_READ_RECEIPT`; server delivers `on_msg` and emits a standalone
/// receipt, then the real response; client observes `on_msg_delivered`
/// followed by `on_msg`. Both directions flow through the nexus/`poll_inbound`
/// wiring rather than manual `dispatch` calls.
#[test]
fn s2_request_response_with_receipt() {
    let options = TcpOptions::default();
    let listener_nexus = Rc::new(Nexus::new());
    let server_transport = TcpListenerTransport::listen("tcp://127.0.0.1:0", false, &options, listener_nexus).unwrap();
    let addr = server_transport.local_addr().unwrap();

    let client_pool = Rc::new(xio_core::task::TaskPool::new());
    let client_transport = TcpTransport::connect(&format!("tcp://{addr}"), false, &options, client_pool).unwrap();
    poll_until(|| client_transport.try_complete_connect().ok().filter(|done| *done), Duration::from_secs(2));

    let server_children = poll_until(
        || {
            let ready = server_transport.accept_ready().unwrap();
            if ready.is_empty() {
                None
            } else {
                Some(ready)
            }
        },
        Duration::from_secs(2),
    );
    let server_child = &server_children[0];

    let server_cache = SessionsCache::new();
    let server_ops = Rc::new(RecordingOps::default());
    let server_session =
        server_cache.create("tcp://127.0.0.1:0", SessionType::Server, server_ops, Vec::new()).unwrap();
    let server_conn_index = server_session.alloc_connection(server_child.task_pool());
    server_child.bind(server_session.id(), server_conn_index);
    server_session.assign_nexus(&server_child.nexus());

    let client_ops = Rc::new(RecordingOps::default());
    let client_cache = SessionsCache::new();
    let client_session =
        client_cache.create(&format!("tcp://{addr}"), SessionType::Client, client_ops.clone(), Vec::new()).unwrap();
    let client_conn_index = client_session.alloc_connection(client_transport.task_pool());
    client_transport.bind(client_session.id(), client_conn_index);
    client_session.assign_nexus(&client_transport.nexus());

    client_session.with_connection(client_conn_index, |conn| conn.send_request(b"req".to_vec(), true)).unwrap().unwrap();
    let frames = client_session.with_connection(client_conn_index, |conn| conn.drain_tx_ready()).unwrap();
    let client_fd = client_transport.fds()[0];
    client_transport.send_frames(client_fd, &frames).unwrap();

    let server_fd = server_child.fds()[0];
    poll_until(
        || {
            server_child.poll_inbound(server_fd);
            let request_sn = server_session.with_connection(server_conn_index, |conn| conn.pending_tx_len()).unwrap();
            if request_sn == 0 {
                None
            } else {
                Some(())
            }
        },
        Duration::from_secs(2),
    );

    // Server produces its response, driven by the session's own user code.
    let request_sn = server_session.with_connection(server_conn_index, |conn| conn.pending_tx_len()).unwrap();
    assert_eq!(request_sn, 1, "standalone receipt should already be queued for transmit");
    let outbound = server_session.with_connection(server_conn_index, |conn| conn.drain_tx_ready()).unwrap();
    server_child.send_frames(server_fd, &outbound).unwrap();

    let client_fd = client_transport.fds()[0];
    poll_until(
        || {
            client_transport.poll_inbound(client_fd);
            if client_ops.delivered.borrow().is_empty() {
                None
            } else {
                Some(())
            }
        },
        Duration::from_secs(2),
    );
    assert_eq!(client_ops.delivered.borrow().len(), 1);
    assert_eq!(client_ops.delivered.borrow()[0].1, 0);

    server_session
        .with_connection(server_conn_index, |conn| conn.send_response(0, b"result".to_vec()))
        .unwrap()
        .unwrap();
    let real_response = server_session.with_connection(server_conn_index, |conn| conn.drain_tx_ready()).unwrap();
    server_child.send_frames(server_fd, &real_response).unwrap();

    poll_until(
        || {
            client_transport.poll_inbound(client_fd);
            if client_ops.received.borrow().is_empty() {
                None
            } else {
                Some(())
            }
        },
        Duration::from_secs(2),
    );
    assert_eq!(client_ops.received.borrow().len(), 1);
}

/// S4 — credit exhaustion: sends beyond the peer's granted credit window are
/// queued rather than rejected; a credit-ack restores exactly the credits it
/// announces and drains that many queued sends into `tx_ready`.
#[test]
fn s4_credit_exhaustion_then_replenish() {
    use xio_core::connection::Connection;
    use xio_core::header::{MsgFlags, SessionHeader, TlvType};
    use xio_core::task::TaskPool;
    use xio_core::TlvFrame;

    struct NoopOps;
    impl SessionOps for NoopOps {}

    let pool = Rc::new(TaskPool::new());
    let mut conn = Connection::new(0, 1, Rc::new(NoopOps), pool);
    conn.set_status(xio_core::ConnectionStatus::Online);
    conn.set_peer_session_id(2);

    // Starts with exactly one peer credit; the first send consumes it.
    conn.send_request(b"a".to_vec(), false).unwrap();
    conn.send_request(b"b".to_vec(), false).unwrap();
    conn.send_request(b"c".to_vec(), false).unwrap();
    assert_eq!(conn.pending_send_len(), 2, "b and c should be queued, not transmitted");
    assert_eq!(conn.drain_tx_ready().len(), 1, "only a's frame should be ready to send so far");

    let ack = TlvFrame {
        tlv_type: TlvType::AckReq,
        header: SessionHeader {
            serial_num: 0,
            dest_session_id: 1,
            flags: MsgFlags::empty(),
            receipt_result: 0,
            sn: 0,
            ack_sn: 0,
            credits: 2,
        },
        payload: Vec::new(),
    };
    conn.on_credit_ack_received(&ack);
    assert_eq!(conn.pending_send_len(), 0, "both queued sends should drain on the credit grant");
    assert_eq!(conn.drain_tx_ready().len(), 2);

    conn.send_request(b"d".to_vec(), false).unwrap();
    assert_eq!(conn.pending_send_len(), 1, "credits are exhausted again after draining");
}

/// S6 — destroy with open connection: `destroy` fails with `Busy` while a
/// connection remains; after freeing it, destroy succeeds.
#[test]
fn s6_destroy_with_open_connection() {
    use xio_core::task::TaskPool;
    use xio_core::SessionError;

    struct NoopOps;
    impl SessionOps for NoopOps {}

    let cache = SessionsCache::new();
    let session = cache.create("tcp://127.0.0.1:0", SessionType::Server, Rc::new(NoopOps), Vec::new()).unwrap();
    let pool = Rc::new(TaskPool::new());
    session.alloc_connection(pool);

    assert!(matches!(session.destroy(&cache), Err(SessionError::Busy)));

    session.free_connection(0).unwrap();
    assert!(session.destroy(&cache).is_ok());
    assert!(cache.is_empty());
}
