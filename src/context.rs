//! The event loop / context: a per-thread readiness-based reactor with
//! timers and deferred work items, external to the core and consumed
//! through a small interface.
//!
//! [`Context`] is that small interface. The core (transport, session,
//! connection) only ever calls through it; it never assumes a particular
//! reactor implementation. [`PollContext`] is a minimal single-threaded
//! reference implementation suitable for tests and small deployments — not
//! a production-grade `epoll`/`kqueue` multiplexer, just the stand-in this
//! crate ships so the core is exercisable on its own.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Handle returned by registration methods, used to later deregister.
pub type HandlerId = u64;

type Callback = Rc<RefCell<dyn FnMut()>>;

/// The reactor interface the core depends on.
///
/// All methods are non-blocking: registration just records interest, it does
/// not wait for readiness. Handlers are invoked from [`Context`]'s own driving
/// loop (e.g. [`PollContext::run_once`]), never synchronously from inside a
/// registration call.
pub trait Context {
    /// Register interest in read-readiness for `fd`. `handler` is invoked
    /// whenever the context believes `fd` may be readable; the handler itself
    /// must tolerate spurious wakeups (treat `WouldBlock` as "nothing to do").
    fn add_read_handler(&self, fd: RawFd, handler: Callback) -> HandlerId;

    /// Register interest in write-readiness for `fd`.
    fn add_write_handler(&self, fd: RawFd, handler: Callback) -> HandlerId;

    /// Remove a previously registered read or write handler.
    fn del_handler(&self, id: HandlerId);

    /// Schedule `handler` to run once, no sooner than `delay` from now.
    /// Handlers that need to keep running (e.g. a deferred control-channel
    /// reassembly retry) call [`defer`](Self::defer) again from inside
    /// themselves.
    fn defer(&self, delay: Duration, handler: Callback) -> HandlerId;

    /// Cancel a deferred work item before it fires.
    fn cancel_deferred(&self, id: HandlerId);
}

enum Registration {
    Read(RawFd, Callback),
    Write(RawFd, Callback),
    Deferred(Instant, Callback),
}

/// Minimal single-threaded reference [`Context`].
///
/// `run_once` drives one iteration: it invokes every registered read/write
/// handler unconditionally (handlers themselves discover "nothing to do" via
/// `WouldBlock`, since all core sockets are non-blocking), then fires any
/// deferred work items whose delay has elapsed.
#[derive(Default)]
pub struct PollContext {
    next_id: RefCell<HandlerId>,
    registrations: RefCell<HashMap<HandlerId, Registration>>,
}

impl PollContext {
    pub fn new() -> Self {
        Self { next_id: RefCell::new(1), registrations: RefCell::new(HashMap::new()) }
    }

    fn next_id(&self) -> HandlerId {
        let mut next = self.next_id.borrow_mut();
        let id = *next;
        *next += 1;
        id
    }

    /// Run one pass over all registered handlers. Returns the number of
    /// handlers invoked.
    pub fn run_once(&self) -> usize {
        let now = Instant::now();
        let mut ran = 0;
        let due: Vec<(HandlerId, Callback)> = {
            let regs = self.registrations.borrow();
            regs.iter()
                .filter_map(|(id, reg)| match reg {
                    Registration::Read(_, cb) | Registration::Write(_, cb) => Some((*id, cb.clone())),
                    Registration::Deferred(fire_at, cb) if *fire_at <= now => Some((*id, cb.clone())),
                    Registration::Deferred(_, _) => None,
                })
                .collect()
        };
        for (id, cb) in due {
            let is_deferred = matches!(
                self.registrations.borrow().get(&id),
                Some(Registration::Deferred(_, _))
            );
            if is_deferred {
                self.registrations.borrow_mut().remove(&id);
            }
            (cb.borrow_mut())();
            ran += 1;
        }
        ran
    }

    /// Run [`run_once`](Self::run_once) repeatedly until `deadline` elapses or
    /// `stop` returns `true`, whichever comes first. Convenience for tests
    /// that need to pump the loop until some condition becomes true.
    pub fn run_until(&self, deadline: Duration, mut stop: impl FnMut() -> bool) {
        let start = Instant::now();
        while !stop() && start.elapsed() < deadline {
            self.run_once();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Context for PollContext {
    fn add_read_handler(&self, fd: RawFd, handler: Callback) -> HandlerId {
        let id = self.next_id();
        self.registrations.borrow_mut().insert(id, Registration::Read(fd, handler));
        id
    }

    fn add_write_handler(&self, fd: RawFd, handler: Callback) -> HandlerId {
        let id = self.next_id();
        self.registrations.borrow_mut().insert(id, Registration::Write(fd, handler));
        id
    }

    fn del_handler(&self, id: HandlerId) {
        self.registrations.borrow_mut().remove(&id);
    }

    fn defer(&self, delay: Duration, handler: Callback) -> HandlerId {
        let id = self.next_id();
        let fire_at = Instant::now() + delay;
        self.registrations.borrow_mut().insert(id, Registration::Deferred(fire_at, handler));
        id
    }

    fn cancel_deferred(&self, id: HandlerId) {
        self.registrations.borrow_mut().remove(&id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn deferred_work_fires_after_delay_not_before() {
        let ctx = PollContext::new();
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        ctx.defer(Duration::from_millis(20), Rc::new(RefCell::new(move || fired_clone.set(true))));

        ctx.run_once();
        assert!(!fired.get());

        std::thread::sleep(Duration::from_millis(25));
        ctx.run_once();
        assert!(fired.get());
    }

    #[test]
    fn cancelled_deferred_work_never_fires() {
        let ctx = PollContext::new();
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        let id = ctx.defer(Duration::from_millis(1), Rc::new(RefCell::new(move || fired_clone.set(true))));
        ctx.cancel_deferred(id);

        std::thread::sleep(Duration::from_millis(5));
        ctx.run_once();
        assert!(!fired.get());
    }
}
