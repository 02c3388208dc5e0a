//! Session id allocation.
//!
//! Session ids are process-unique 32-bit values. Connections are
//! addressed by their index within the owning session's connection list, so
//! they need no separate allocator.

use std::sync::atomic::{AtomicU32, Ordering};

/// A process-unique session identifier.
pub type SessionId = u32;

/// All possible session ids have been used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfIdsError();

impl std::fmt::Display for OutOfIdsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session id allocator ran out of ids")
    }
}

impl std::error::Error for OutOfIdsError {}

/// Monotonic process-wide allocator for [`SessionId`]s.
///
/// Unlike a per-session connection index, session ids are never reused within
/// a process lifetime: the sessions cache keys on them for the lifetime of
/// the process, and a freed id reappearing while a stale reference is still
/// in flight would misroute a message to the wrong session.
#[derive(Debug)]
pub struct Allocator {
    next: AtomicU32,
}

impl Allocator {
    /// Construct an allocator that will hand out ids starting from `1`.
    ///
    /// `0` is reserved as "no session id".
    pub const fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    /// Assign a new, never-before-used [`SessionId`].
    pub fn allocate(&self) -> Result<SessionId, OutOfIdsError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // wrapped all the way around
            Err(OutOfIdsError())
        } else {
            Ok(id)
        }
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocator_hands_out_distinct_ids() {
        let allocator = Allocator::new();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn allocator_never_hands_out_zero() {
        let allocator = Allocator::new();
        assert_ne!(allocator.allocate().unwrap(), 0);
    }
}
