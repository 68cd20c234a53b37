//! Transport agents: retransmission-aware UDP and connection-per-call TCP
//! request/indication transports operating on pre-encoded wire bytes.
//!
//! Both agents return the first raw bytes received, after a syntactic STUN
//! check; matching responses to requests by transaction ID is the caller's
//! job.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

pub use tcp::TcpAgent;
pub use udp::UdpAgent;

/// Default retransmission timeout base (RTO).
pub const DEFAULT_RTO_MS: u64 = 3000;

/// Default retransmission attempt cap (Rc).
pub const DEFAULT_RC: u32 = 7;

/// Default overall-timeout multiplier (Rm).
pub const DEFAULT_RM: u32 = 16;

/// Default TCP response timeout (Ti).
pub const DEFAULT_TI_MS: u64 = 39500;

/// Transport protocol carried by an agent or an allocation five-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// Unordered, unreliable datagrams.
    Udp,
    /// Ordered byte stream, one connection per call.
    Tcp,
}

/// Agent configuration.
///
/// `rto`, `rc` and `rm` govern UDP retransmission; `ti` is the TCP response
/// timeout. Constants above carry the defaults.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Destination transport address.
    pub dest: SocketAddr,
    /// Retransmission timeout base.
    pub rto: Duration,
    /// Hard cap on send attempts.
    pub rc: u32,
    /// Overall timeout is `rto * rm` from the first send.
    pub rm: u32,
    /// TCP response timeout.
    pub ti: Duration,
}

impl AgentConfig {
    /// Configuration with the RFC default timers.
    pub fn new(dest: SocketAddr) -> Self {
        Self {
            dest,
            rto: Duration::from_millis(DEFAULT_RTO_MS),
            rc: DEFAULT_RC,
            rm: DEFAULT_RM,
            ti: Duration::from_millis(DEFAULT_TI_MS),
        }
    }

    /// Override the UDP retransmission timers.
    pub fn with_udp_timers(mut self, rto: Duration, rc: u32, rm: u32) -> Self {
        self.rto = rto;
        self.rc = rc;
        self.rm = rm;
        self
    }

    /// Override the TCP response timeout.
    pub fn with_tcp_timeout(mut self, ti: Duration) -> Self {
        self.ti = ti;
        self
    }
}
