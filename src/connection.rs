//! A connection: one logical flow bound to a context and a stream
//! transport, owning per-peer sequence numbers, credits, and the in-flight
//! and io queues.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{ConnectionError, TaskError};
use crate::header::{MsgFlags, SessionHeader, TlvFrame, TlvType};
use crate::id::SessionId;
use crate::message::{CancelReason, SessionOps};
use crate::task::{TaskHandle, TaskLifecycle, TaskPool};

/// Where a connection sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Init,
    Online,
    FinWait1,
    FinWait2,
    Disconnected,
    Closed,
}

/// A logical flow within a session.
///
/// Tasks are borrowed, not owned: the transport's [`TaskPool`] owns the
/// backing storage, the connection only holds handles in its queues.
pub struct Connection {
    pub index: usize,
    own_session_id: SessionId,
    peer_session_id: Option<SessionId>,
    ops: Rc<dyn SessionOps>,
    task_pool: Rc<TaskPool>,
    status: ConnectionStatus,
    peer_credits: u32,
    local_credits: u32,
    tx_sn: u16,
    exp_sn: u16,
    ack_sn: u16,
    /// Requests and one-way messages awaiting a response/ack/send-complete.
    in_flight: VecDeque<TaskHandle>,
    /// Received requests whose response is still being produced.
    io_queue: VecDeque<TaskHandle>,
    /// Queued for the transport to drain and write to the socket.
    tx_ready: VecDeque<TaskHandle>,
    /// Sends that exhausted the peer's credit window at enqueue time; drained
    /// into `tx_ready` as credit grants arrive.
    pending_send: VecDeque<TaskHandle>,
    tx_queued_msgs: u32,
}

impl Connection {
    /// Accumulated local credits at or above this are announced to the peer
    /// via the next outgoing header.
    const CREDIT_ACK_THRESHOLD: u32 = 4;
    /// Initial peer credit grant assumed until the peer's first header
    /// updates it; conservative default matching `snd_queue_depth`-style
    /// session configuration.
    const INITIAL_PEER_CREDITS: u32 = 1;

    pub fn new(index: usize, own_session_id: SessionId, ops: Rc<dyn SessionOps>, task_pool: Rc<TaskPool>) -> Self {
        Self {
            index,
            own_session_id,
            peer_session_id: None,
            ops,
            task_pool,
            status: ConnectionStatus::Init,
            peer_credits: Self::INITIAL_PEER_CREDITS,
            local_credits: 0,
            tx_sn: 0,
            exp_sn: 0,
            ack_sn: 0,
            in_flight: VecDeque::new(),
            io_queue: VecDeque::new(),
            tx_ready: VecDeque::new(),
            pending_send: VecDeque::new(),
            tx_queued_msgs: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    pub fn own_session_id(&self) -> SessionId {
        self.own_session_id
    }

    pub fn set_peer_session_id(&mut self, id: SessionId) {
        self.peer_session_id = Some(id);
    }

    pub fn peer_credits(&self) -> u32 {
        self.peer_credits
    }

    pub fn tx_queued_msgs(&self) -> u32 {
        self.tx_queued_msgs
    }

    pub fn exp_sn(&self) -> u16 {
        self.exp_sn
    }

    pub fn ack_sn(&self) -> u16 {
        self.ack_sn
    }

    pub fn pending_tx_len(&self) -> usize {
        self.tx_ready.len()
    }

    /// Sends still waiting on a peer credit grant.
    pub fn pending_send_len(&self) -> usize {
        self.pending_send.len()
    }

    fn next_tx_sn(&mut self) -> u16 {
        let sn = self.tx_sn;
        self.tx_sn = self.tx_sn.wrapping_add(1);
        sn
    }

    /// Consume one peer credit if available. Returns whether one was taken.
    fn try_consume_credit(&mut self) -> bool {
        if self.peer_credits == 0 {
            return false;
        }
        self.peer_credits -= 1;
        true
    }

    /// Move queued sends into `tx_ready` as long as peer credit allows.
    fn drain_pending_send(&mut self) {
        while !self.pending_send.is_empty() && self.try_consume_credit() {
            let handle = self.pending_send.pop_front().expect("checked non-empty above");
            self.tx_ready.push_back(handle);
        }
    }

    fn take_credit_grant(&mut self) -> u16 {
        let grant = self.local_credits.min(u16::MAX as u32) as u16;
        self.local_credits = 0;
        grant
    }

    fn grant_local_credit(&mut self) {
        self.local_credits += 1;
    }

    fn ensure_online(&self) -> Result<(), ConnectionError> {
        if self.status != ConnectionStatus::Online {
            return Err(ConnectionError::NotOnline);
        }
        Ok(())
    }

    /// Apply an incoming header's sn/credits accounting. Returns whether the
    /// sn was the expected one.
    fn accept_header(&mut self, header: &SessionHeader) -> bool {
        if header.sn == self.exp_sn {
            self.exp_sn = self.exp_sn.wrapping_add(1);
            self.ack_sn = header.sn;
            self.peer_credits = self.peer_credits.saturating_add(header.credits as u32);
            self.drain_pending_send();
            true
        } else {
            log::warn!(
                "connection {}: out-of-order sn {} (expected {}), dropping advance",
                self.index,
                header.sn,
                self.exp_sn
            );
            false
        }
    }

    /// Enqueue a new request. If the peer's credit window is exhausted the
    /// task is held in `pending_send` and released as credit grants arrive,
    /// rather than rejected.
    pub fn send_request(&mut self, payload: Vec<u8>, request_read_receipt: bool) -> Result<TaskHandle, ConnectionError> {
        self.ensure_online()?;
        let sn = self.next_tx_sn();
        let handle = self.task_pool.acquire(TlvType::MsgReq);
        self.task_pool.with_mut(handle, |task| {
            task.sn = sn;
            task.dest_session_id = self.peer_session_id;
            task.flags = if request_read_receipt { MsgFlags::REQUEST_READ_RECEIPT } else { MsgFlags::empty() };
            task.msg.sn = sn as u64;
            task.msg.request_read_receipt = request_read_receipt;
            task.msg.out.payload = payload;
        });
        self.in_flight.push_back(handle);
        if self.try_consume_credit() {
            self.tx_ready.push_back(handle);
        } else {
            self.pending_send.push_back(handle);
        }
        self.tx_queued_msgs += 1;
        Ok(handle)
    }

    /// Enqueue a one-way message. Like a request it sits in `in_flight` until
    /// its local send completes and queues in `pending_send` rather than
    /// erroring out when the peer's credit window is exhausted.
    pub fn send_one_way(&mut self, payload: Vec<u8>) -> Result<TaskHandle, ConnectionError> {
        self.ensure_online()?;
        let sn = self.next_tx_sn();
        let handle = self.task_pool.acquire(TlvType::OneWayReq);
        self.task_pool.with_mut(handle, |task| {
            task.sn = sn;
            task.dest_session_id = self.peer_session_id;
            task.msg.sn = sn as u64;
            task.msg.out.payload = payload;
        });
        self.in_flight.push_back(handle);
        if self.try_consume_credit() {
            self.tx_ready.push_back(handle);
        } else {
            self.pending_send.push_back(handle);
        }
        self.tx_queued_msgs += 1;
        Ok(handle)
    }

    /// Build a response to a previously received request, identified by its
    /// connection-local sn (correlated via the `sender_task` back-pointer).
    pub fn send_response(&mut self, request_sn: u16, payload: Vec<u8>) -> Result<TaskHandle, TaskError> {
        let request_handle = self
            .io_queue
            .iter()
            .copied()
            .find(|h| self.task_pool.with(*h, |t| t.sn == request_sn))
            .ok_or(TaskError::NotFound("request task for response"))?;

        let sn = self.next_tx_sn();
        let handle = self.task_pool.acquire(TlvType::MsgRsp);
        self.task_pool.with_mut(handle, |task| {
            task.sn = sn;
            task.dest_session_id = self.peer_session_id;
            task.sender_task = Some(request_handle);
            task.flags = MsgFlags::RSP_FLAG_FIRST | MsgFlags::RSP_FLAG_LAST;
            task.msg.sn = request_sn as u64;
            task.msg.out.payload = payload;
        });
        self.tx_ready.push_back(handle);
        Ok(handle)
    }

    /// Build and queue a `CANCEL_RSP` reply to a peer's `CANCEL_REQ` for
    /// `request_sn`. `reason` is `None` when the cancellation was accepted.
    pub fn send_cancel_response(&mut self, request_sn: u16, reason: Option<CancelReason>) -> TaskHandle {
        let sn = self.next_tx_sn();
        let handle = self.task_pool.acquire(TlvType::CancelRsp);
        self.task_pool.with_mut(handle, |task| {
            task.sn = sn;
            task.dest_session_id = self.peer_session_id;
            task.receipt_result = match reason {
                None => 0,
                Some(CancelReason::MsgNotFound) => 1,
                Some(CancelReason::Rejected) => 2,
            };
            task.msg.sn = request_sn as u64;
        });
        self.tx_ready.push_back(handle);
        handle
    }

    /// Drain every task currently queued for transmit into wire frames.
    /// Credits were already accounted for at enqueue time; this only
    /// attaches the header's `ack_sn`/`credits` announcement.
    pub fn drain_tx_ready(&mut self) -> Vec<TlvFrame> {
        let mut frames = Vec::with_capacity(self.tx_ready.len());
        while let Some(handle) = self.tx_ready.pop_front() {
            if !self.task_pool.contains(handle) {
                continue;
            }
            let ack_sn = self.ack_sn;
            let credits = self.take_credit_grant();
            let frame = self.task_pool.with(handle, |task| TlvFrame {
                tlv_type: task.tlv_type,
                header: SessionHeader {
                    serial_num: task.msg.sn,
                    dest_session_id: task.dest_session_id.unwrap_or(0),
                    flags: task.flags,
                    receipt_result: task.receipt_result,
                    sn: task.sn,
                    ack_sn,
                    credits,
                },
                payload: task.msg.out.payload.clone(),
            });
            frames.push(frame);
        }
        frames
    }

    /// Handle an inbound `MSG_REQ`/`ONE_WAY_REQ` frame.
    pub fn on_request_received(&mut self, tlv_type: TlvType, frame: TlvFrame) {
        self.accept_header(&frame.header);
        self.grant_local_credit();

        let request_receipt = frame.header.flags.contains(MsgFlags::REQUEST_READ_RECEIPT);
        let handle = self.task_pool.acquire(tlv_type);
        self.task_pool.with_mut(handle, |task| {
            task.sn = frame.header.sn;
            task.flags = frame.header.flags;
            task.msg.sn = frame.header.serial_num;
            task.msg.in_.payload = frame.payload;
            task.msg.request_read_receipt = request_receipt;
            task.lifecycle = TaskLifecycle::Delivered;
        });
        if tlv_type == TlvType::MsgReq {
            self.io_queue.push_back(handle);
        }
        if request_receipt {
            self.task_pool.addref(handle);
        }

        let status = self.task_pool.with(handle, |t| t.status);
        let msg_snapshot = self.task_pool.with(handle, |t| t.msg.clone());
        if status != 0 {
            self.ops.on_msg_error(self.index, &msg_snapshot, status);
            self.task_pool.with_mut(handle, |t| t.status = 0);
        } else {
            self.ops.on_msg(self.index, &msg_snapshot);
        }

        if request_receipt {
            let still_delivered = self.task_pool.with(handle, |t| t.lifecycle == TaskLifecycle::Delivered);
            if still_delivered {
                self.emit_standalone_receipt(handle);
            }
            self.task_pool.put(handle);
        }

        if tlv_type == TlvType::OneWayReq {
            self.task_pool.put(handle);
        }

        self.maybe_queue_credit_ack();
    }

    fn emit_standalone_receipt(&mut self, handle: TaskHandle) {
        let (serial, receipt_result) = self.task_pool.with(handle, |t| (t.msg.sn, t.status));
        let sn = self.next_tx_sn();
        let rsp_handle = self.task_pool.acquire(TlvType::MsgRsp);
        self.task_pool.with_mut(rsp_handle, |task| {
            task.sn = sn;
            task.dest_session_id = self.peer_session_id;
            task.flags = MsgFlags::RSP_FLAG_FIRST;
            task.receipt_result = receipt_result;
            task.msg.sn = serial;
        });
        self.tx_ready.push_back(rsp_handle);
    }

    /// Handle an inbound `MSG_RSP`/`ONE_WAY_RSP` frame.
    pub fn on_response_received(&mut self, tlv_type: TlvType, frame: TlvFrame) {
        if !matches!(self.status, ConnectionStatus::Online | ConnectionStatus::FinWait1) {
            return;
        }
        self.accept_header(&frame.header);
        self.grant_local_credit();

        let serial = frame.header.serial_num;
        let request_handle = self.in_flight.iter().copied().find(|h| self.task_pool.with(*h, |t| t.msg.sn == serial));
        let Some(request_handle) = request_handle else {
            return;
        };

        match tlv_type {
            TlvType::OneWayRsp => {
                if !frame.header.flags.contains(MsgFlags::RSP_FLAG_FIRST) {
                    log::warn!("connection {}: ONE_WAY_RSP missing FIRST flag", self.index);
                }
                let request_receipt = self.task_pool.with(request_handle, |t| t.msg.request_read_receipt);
                let msg_snapshot = self.task_pool.with(request_handle, |t| t.msg.clone());
                if request_receipt {
                    self.ops.on_msg_delivered(self.index, &msg_snapshot, frame.header.receipt_result);
                } else {
                    self.ops.on_ow_msg_send_complete(self.index, &msg_snapshot);
                }
                self.tx_queued_msgs = self.tx_queued_msgs.saturating_sub(1);
                self.in_flight.retain(|h| *h != request_handle);
                self.task_pool.put(request_handle);
            }
            TlvType::MsgRsp => {
                let first = frame.header.flags.contains(MsgFlags::RSP_FLAG_FIRST);
                let last = frame.header.flags.contains(MsgFlags::RSP_FLAG_LAST);
                if first {
                    let msg_snapshot = self.task_pool.with(request_handle, |t| t.msg.clone());
                    self.ops.on_msg_delivered(self.index, &msg_snapshot, frame.header.receipt_result);
                }
                if first && !last {
                    // Standalone receipt only: the request stays in_flight,
                    // its stashed "in"/"out" sides untouched until the real
                    // response arrives.
                    self.maybe_queue_credit_ack();
                    return;
                }
                if last {
                    let mut msg_snapshot = self.task_pool.with(request_handle, |t| t.msg.clone());
                    msg_snapshot.request = Some(Box::new(crate::message::VMsg::new(frame.payload)));
                    if frame.header.receipt_result != 0 {
                        self.ops.on_msg_error(self.index, &msg_snapshot, frame.header.receipt_result);
                    } else {
                        self.ops.on_msg(self.index, &msg_snapshot);
                    }
                    self.tx_queued_msgs = self.tx_queued_msgs.saturating_sub(1);
                    self.in_flight.retain(|h| *h != request_handle);
                    self.task_pool.put(request_handle);
                }
            }
            _ => {}
        }
        self.maybe_queue_credit_ack();
    }

    /// Whether a received request with this connection-local sn is still
    /// sitting in the io-queue awaiting a response.
    pub fn has_io_task_with_sn(&self, sn: u16) -> bool {
        self.io_queue.iter().any(|h| self.task_pool.with(*h, |t| t.sn == sn))
    }

    /// Handle an inbound `ACK_REQ` frame: credit-only update, no task
    /// allocated.
    pub fn on_credit_ack_received(&mut self, frame: &TlvFrame) {
        self.accept_header(&frame.header);
    }

    fn maybe_queue_credit_ack(&mut self) {
        if self.local_credits < Self::CREDIT_ACK_THRESHOLD {
            return;
        }
        let sn = self.next_tx_sn();
        let handle = self.task_pool.acquire(TlvType::AckReq);
        self.task_pool.with_mut(handle, |task| {
            task.sn = sn;
            task.dest_session_id = self.peer_session_id;
            task.msg.sn = sn as u64;
        });
        self.tx_ready.push_back(handle);
    }

    /// Local send completion for a response task.
    pub fn on_response_send_complete(&mut self, handle: TaskHandle) {
        let (sender, is_standalone_receipt) = self.task_pool.with(handle, |t| {
            (t.sender_task, t.flags.contains(MsgFlags::RSP_FLAG_FIRST) && !t.flags.contains(MsgFlags::RSP_FLAG_LAST))
        });
        if is_standalone_receipt {
            self.task_pool.put(handle);
            return;
        }
        let msg_snapshot = self.task_pool.with(handle, |t| t.msg.clone());
        self.ops.on_msg_send_complete(self.index, &msg_snapshot);
        self.task_pool.put(handle);
        if let Some(req) = sender {
            self.io_queue.retain(|h| *h != req);
            self.task_pool.put(req);
        }
    }

    /// Local send completion for an outgoing one-way message, generalized to
    /// also cover requests whose real completion is instead the eventual
    /// response.
    pub fn on_one_way_send_complete(&mut self, handle: TaskHandle) {
        let request_receipt = self.task_pool.with(handle, |t| t.msg.request_read_receipt);
        self.in_flight.retain(|h| *h != handle);
        if request_receipt {
            self.task_pool.put(handle);
            return;
        }
        self.tx_queued_msgs = self.tx_queued_msgs.saturating_sub(1);
        let msg_snapshot = self.task_pool.with(handle, |t| t.msg.clone());
        self.ops.on_ow_msg_send_complete(self.index, &msg_snapshot);
        self.task_pool.put(handle);
    }

    /// Release every queued task and transition to `Disconnected`.
    /// Idempotent.
    pub fn disconnect(&mut self) {
        if matches!(self.status, ConnectionStatus::Disconnected | ConnectionStatus::Closed) {
            return;
        }
        self.status = ConnectionStatus::Disconnected;
        self.pending_send.clear();
        while let Some(handle) = self.in_flight.pop_front() {
            let msg_snapshot = self.task_pool.with(handle, |t| t.msg.clone());
            self.ops.on_msg_error(self.index, &msg_snapshot, -1);
            self.task_pool.put(handle);
        }
        while let Some(handle) = self.io_queue.pop_front() {
            self.task_pool.put(handle);
        }
        while let Some(handle) = self.tx_ready.pop_front() {
            self.task_pool.put(handle);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::Msg;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingOps {
        delivered: RefCell<Vec<(i32, u64)>>,
        received: RefCell<Vec<Vec<u8>>>,
        ow_complete: RefCell<usize>,
        errors: RefCell<usize>,
    }

    impl SessionOps for RecordingOps {
        fn on_msg(&self, _connection_index: usize, msg: &Msg) -> i32 {
            self.received.borrow_mut().push(msg.in_.payload.clone());
            0
        }
        fn on_msg_delivered(&self, _connection_index: usize, msg: &Msg, receipt_res: i32) {
            self.delivered.borrow_mut().push((receipt_res, msg.sn));
        }
        fn on_ow_msg_send_complete(&self, _connection_index: usize, _msg: &Msg) {
            *self.ow_complete.borrow_mut() += 1;
        }
        fn on_msg_error(&self, _connection_index: usize, _msg: &Msg, _status: i32) {
            *self.errors.borrow_mut() += 1;
        }
    }

    fn online_connection(ops: Rc<RecordingOps>) -> (Connection, Rc<TaskPool>) {
        let pool = Rc::new(TaskPool::new());
        let mut conn = Connection::new(0, 1, ops, pool.clone());
        conn.set_status(ConnectionStatus::Online);
        conn.set_peer_session_id(2);
        (conn, pool)
    }

    #[test]
    fn exhausted_credits_are_queued_not_rejected() {
        let ops = Rc::new(RecordingOps::default());
        let (mut conn, _pool) = online_connection(ops);
        conn.peer_credits = 0;
        conn.send_request(b"hi".to_vec(), false).unwrap();
        assert_eq!(conn.pending_send_len(), 1);
        assert!(conn.drain_tx_ready().is_empty());

        let ack = TlvFrame {
            tlv_type: TlvType::AckReq,
            header: SessionHeader {
                serial_num: 0,
                dest_session_id: 1,
                flags: MsgFlags::empty(),
                receipt_result: 0,
                sn: 0,
                ack_sn: 0,
                credits: 1,
            },
            payload: Vec::new(),
        };
        conn.on_credit_ack_received(&ack);
        assert_eq!(conn.pending_send_len(), 0);
        let frames = conn.drain_tx_ready();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn one_way_send_then_local_complete_notifies_sender() {
        let ops = Rc::new(RecordingOps::default());
        let (mut conn, _pool) = online_connection(ops.clone());
        let handle = conn.send_one_way(b"ping".to_vec()).unwrap();
        let frames = conn.drain_tx_ready();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tlv_type, TlvType::OneWayReq);

        conn.on_one_way_send_complete(handle);
        assert_eq!(*ops.ow_complete.borrow(), 1);
        assert_eq!(conn.tx_queued_msgs(), 0);
    }

    #[test]
    fn out_of_order_sn_does_not_advance_exp_sn() {
        let ops = Rc::new(RecordingOps::default());
        let (mut conn, _pool) = online_connection(ops.clone());
        let bogus = TlvFrame {
            tlv_type: TlvType::OneWayReq,
            header: SessionHeader {
                serial_num: 1,
                dest_session_id: 1,
                flags: MsgFlags::empty(),
                receipt_result: 0,
                sn: 5,
                ack_sn: 0,
                credits: 0,
            },
            payload: b"out of order".to_vec(),
        };
        conn.on_request_received(TlvType::OneWayReq, bogus);
        assert_eq!(conn.exp_sn(), 0);
        assert!(ops.received.borrow().is_empty());
    }

    #[test]
    fn request_receipt_then_full_response_delivers_both_callbacks() {
        let ops = Rc::new(RecordingOps::default());
        let (mut conn, _pool) = online_connection(ops.clone());
        conn.send_request(b"req".to_vec(), true).unwrap();
        let sent = conn.drain_tx_ready();
        assert_eq!(sent.len(), 1);

        let receipt = TlvFrame {
            tlv_type: TlvType::MsgRsp,
            header: SessionHeader {
                serial_num: sent[0].header.serial_num,
                dest_session_id: 1,
                flags: MsgFlags::RSP_FLAG_FIRST,
                receipt_result: 0,
                sn: 0,
                ack_sn: 0,
                credits: 0,
            },
            payload: Vec::new(),
        };
        conn.on_response_received(TlvType::MsgRsp, receipt);
        assert_eq!(ops.delivered.borrow().len(), 1);
        assert!(ops.received.borrow().is_empty());

        let real_response = TlvFrame {
            tlv_type: TlvType::MsgRsp,
            header: SessionHeader {
                serial_num: sent[0].header.serial_num,
                dest_session_id: 1,
                flags: MsgFlags::RSP_FLAG_FIRST | MsgFlags::RSP_FLAG_LAST,
                receipt_result: 0,
                sn: 1,
                ack_sn: 0,
                credits: 0,
            },
            payload: b"result".to_vec(),
        };
        conn.on_response_received(TlvType::MsgRsp, real_response);
        assert_eq!(ops.received.borrow().len(), 1);
    }

    #[test]
    fn disconnect_flushes_in_flight_with_errors() {
        let ops = Rc::new(RecordingOps::default());
        let (mut conn, _pool) = online_connection(ops.clone());
        conn.send_request(b"req".to_vec(), false).unwrap();
        conn.disconnect();
        assert_eq!(*ops.errors.borrow(), 1);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let ops = Rc::new(RecordingOps::default());
        let (mut conn, _pool) = online_connection(ops);
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }
}
