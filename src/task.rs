//! Tasks: one per TLV frame in flight, allocated from a transport-scoped pool.
//!
//! A task is refcounted rather than owned by a single queue because a
//! request task is referenced by both the in-flight queue (waiting for a
//! response/ack) and, once the response is being sent back, by the
//! connection's io queue — both references must be released ("put") before
//! the slot is recycled.

use std::cell::RefCell;

use slab::Slab;

use crate::header::{MsgFlags, TlvType};
use crate::id::SessionId;
use crate::message::Msg;

/// Opaque handle into a [`TaskPool`]. Cheap to copy, stored in queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(usize);

/// Where a task currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLifecycle {
    /// Allocated, not yet fully sent or received.
    Init,
    /// Inbound payload fully received and handed to the user callback.
    Delivered,
    /// Outbound payload fully written to the transport.
    SendComplete,
    /// Returned to the pool; handle is no longer valid.
    Recycled,
}

/// One TLV frame's worth of bookkeeping.
#[derive(Debug, Clone)]
pub struct Task {
    pub tlv_type: TlvType,
    pub session_id: Option<SessionId>,
    pub connection_index: Option<usize>,
    /// For a response task, the originating request task: a back-pointer
    /// used to restore the stashed request on send-complete / standalone-
    /// receipt correlation.
    pub sender_task: Option<TaskHandle>,
    pub msg: Msg,
    pub lifecycle: TaskLifecycle,
    /// Non-zero delivery status, surfaced via `on_msg_error` instead of
    /// `on_msg` when set.
    pub status: i32,
    /// Flags snapshot taken at send time.
    pub flags: MsgFlags,
    pub receipt_result: i32,
    /// The connection-local sequence number this task was sent or received
    /// with.
    pub sn: u16,
    /// For an outbound task, the remote peer's session id to stamp into the
    /// wire header.
    pub dest_session_id: Option<SessionId>,
}

impl Task {
    fn new(tlv_type: TlvType) -> Self {
        Self {
            tlv_type,
            session_id: None,
            connection_index: None,
            sender_task: None,
            msg: Msg::default(),
            lifecycle: TaskLifecycle::Init,
            status: 0,
            flags: MsgFlags::empty(),
            receipt_result: 0,
            sn: 0,
            dest_session_id: None,
        }
    }
}

struct Entry {
    task: Task,
    refcount: u32,
}

/// A slab-backed pool of [`Task`]s, scoped to one transport.
///
/// Not `Sync`: tasks are only ever touched from the single context thread
/// that owns the transport.
#[derive(Default)]
pub struct TaskPool {
    slab: RefCell<Slab<Entry>>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self { slab: RefCell::new(Slab::new()) }
    }

    /// Allocate a fresh task with refcount 1. Corresponds to a `get`.
    pub fn acquire(&self, tlv_type: TlvType) -> TaskHandle {
        let entry = Entry { task: Task::new(tlv_type), refcount: 1 };
        TaskHandle(self.slab.borrow_mut().insert(entry))
    }

    /// Take an additional reference on an already-acquired task.
    pub fn addref(&self, handle: TaskHandle) {
        self.slab.borrow_mut()[handle.0].refcount += 1;
    }

    /// Release one reference. Returns `true` if this was the last one and
    /// the slot was recycled.
    pub fn put(&self, handle: TaskHandle) -> bool {
        let mut slab = self.slab.borrow_mut();
        let refcount = {
            let entry = &mut slab[handle.0];
            entry.refcount -= 1;
            entry.refcount
        };
        if refcount == 0 {
            let mut entry = slab.remove(handle.0);
            entry.task.lifecycle = TaskLifecycle::Recycled;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.slab.borrow().contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.slab.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.borrow().is_empty()
    }

    pub fn with<R>(&self, handle: TaskHandle, f: impl FnOnce(&Task) -> R) -> R {
        let slab = self.slab.borrow();
        f(&slab[handle.0].task)
    }

    pub fn with_mut<R>(&self, handle: TaskHandle, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut slab = self.slab.borrow_mut();
        f(&mut slab[handle.0].task)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_then_put_recycles_immediately() {
        let pool = TaskPool::new();
        let handle = pool.acquire(TlvType::MsgReq);
        assert_eq!(pool.len(), 1);
        assert!(pool.put(handle));
        assert!(!pool.contains(handle));
        assert!(pool.is_empty());
    }

    #[test]
    fn addref_requires_matching_put_before_recycle() {
        let pool = TaskPool::new();
        let handle = pool.acquire(TlvType::MsgReq);
        pool.addref(handle);

        assert!(!pool.put(handle));
        assert!(pool.contains(handle));

        assert!(pool.put(handle));
        assert!(!pool.contains(handle));
    }

    #[test]
    fn with_mut_updates_are_visible_through_with() {
        let pool = TaskPool::new();
        let handle = pool.acquire(TlvType::OneWayReq);
        pool.with_mut(handle, |task| task.lifecycle = TaskLifecycle::Delivered);
        pool.with(handle, |task| assert_eq!(task.lifecycle, TaskLifecycle::Delivered));
        pool.put(handle);
    }

    #[test]
    fn slots_are_reused_after_recycling() {
        let pool = TaskPool::new();
        let first = pool.acquire(TlvType::MsgReq);
        pool.put(first);
        let second = pool.acquire(TlvType::MsgRsp);
        assert_eq!(pool.len(), 1);
        pool.put(second);
    }
}
