//! Configuration knobs for the stream transport.
//!
//! This is a plain-struct options table, not a file/CLI parser — parsing is
//! an external concern. `TRANS_BUF_THRESHOLD` becomes read-only after the
//! first transport opens: [`TcpOptions::snapshot`] takes that once-only
//! read-only copy.

use std::sync::OnceLock;

use crate::error::TransportError;

/// Global knobs accepted by the stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    /// Route buffer allocations through the external mempool rather than
    /// per-task `Vec<u8>` allocation.
    pub enable_mem_pool: bool,
    /// Hold `/dev/cpu_dma_latency` open for the process lifetime to pin the
    /// CPU in C0.
    pub enable_dma_latency: bool,
    /// Validate memory-registration handles before use (no-op unless the
    /// transport is built with registered-memory support).
    pub enable_mr_check: bool,
    /// Byte threshold past which a task's payload is considered "large" for
    /// buffer-pool accounting purposes. Valid range `0..=65536`.
    pub trans_buf_threshold: u32,
    /// Maximum number of inbound iovec entries per task.
    pub max_in_iovlen: u32,
    /// Maximum number of outbound iovec entries per task.
    pub max_out_iovlen: u32,
    /// `TCP_NODELAY`.
    pub tcp_no_delay: bool,
    /// `SO_SNDBUF`, `0` leaves the OS default in place.
    pub tcp_so_sndbuf: u32,
    /// `SO_RCVBUF`, `0` leaves the OS default in place.
    pub tcp_so_rcvbuf: u32,
    /// Use two sockets (control + data) per connection instead of one.
    pub tcp_dual_stream: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            enable_mem_pool: true,
            enable_dma_latency: false,
            enable_mr_check: false,
            trans_buf_threshold: 4096,
            max_in_iovlen: 16,
            max_out_iovlen: 16,
            tcp_no_delay: true,
            tcp_so_sndbuf: 0,
            tcp_so_rcvbuf: 0,
            tcp_dual_stream: false,
        }
    }
}

impl TcpOptions {
    /// Validate the option set, in particular the bound on
    /// `trans_buf_threshold`.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.trans_buf_threshold > 65536 {
            return Err(TransportError::InvalidArgument("trans_buf_threshold out of [0, 65536]"));
        }
        if self.max_in_iovlen == 0 || self.max_out_iovlen == 0 {
            return Err(TransportError::InvalidArgument("iovlen must be non-zero"));
        }
        Ok(())
    }

    /// Take (or return the already-taken) read-only snapshot of this option
    /// set. The first call wins: subsequent calls, even with a different
    /// `self`, return the originally snapshotted value, modeling a snapshot
    /// taken once at first-transport-open.
    pub fn snapshot(&self) -> Result<&'static TcpOptions, TransportError> {
        self.validate()?;
        static SNAPSHOT: OnceLock<TcpOptions> = OnceLock::new();
        Ok(SNAPSHOT.get_or_init(|| *self))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert!(TcpOptions::default().validate().is_ok());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let mut opts = TcpOptions::default();
        opts.trans_buf_threshold = 65537;
        assert!(matches!(opts.validate(), Err(TransportError::InvalidArgument(_))));
    }

    #[test]
    fn zero_iovlen_is_rejected() {
        let mut opts = TcpOptions::default();
        opts.max_in_iovlen = 0;
        assert!(opts.validate().is_err());
    }
}
