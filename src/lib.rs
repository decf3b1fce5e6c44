//! stunprobe — STUN-based NAT discovery
//!
//! A client implementation of STUN (RFC 3489, RFC 5389, RFC 5780) that
//! discovers how the local host is mapped and filtered by NATs and
//! firewalls: the classic RFC 3489 decision tree over UDP, and the
//! RFC 5780 mapping/filtering behavior tests over UDP or (for binding and
//! mapping) TCP.
//!
//! The network seam is the [`transport::StunTransport`] trait; everything
//! above it is deterministic decoding and decision logic, which is what
//! the unit tests drive with scripted transports.

#![warn(clippy::all)]

pub mod behavior;
pub mod classic;
pub mod error;
pub mod resolver;
pub mod stun;
pub mod transaction;
pub mod transport;

use std::time::Duration;

// Re-export the result and client types callers actually touch
pub use behavior::{
    BehaviorClient, BehaviorProbeResult, BindingTestResult, FilteringBehavior, MappingBehavior,
};
pub use classic::{ClassicClient, ClassicProbeResult, NatType};
pub use error::{NatError, NatResult, StunError};
pub use stun::{Attribute, Message, MessageType, TransactionId, MAGIC_COOKIE};
pub use transport::{ProbeTransport, StunTransport, TcpConnector, UdpTransport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default STUN port
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Timing knobs shared by both classifiers
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Deadline for each send/receive attempt, measured from the send.
    /// Kept short: a full discovery run is several sequential tests, and
    /// some of them are expected to time out on purpose.
    pub recv_timeout: Duration,

    /// Whole send/receive attempts per logical test. No backoff between
    /// attempts; one attempt is the default contract.
    pub attempts: u32,

    /// TCP connection establishment deadline
    pub connect_timeout: Duration,

    /// Listening window for discarding residual datagrams between tests
    pub drain_grace: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(1600),
            attempts: 1,
            connect_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_millis(50),
        }
    }
}

/// Initialize the logging system
///
/// # Arguments
/// * `level` - log level (trace/debug/info/warn/error), overridden by
///   `RUST_LOG` when set
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
