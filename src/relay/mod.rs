//! TURN relay engine: allocation manager, long-term credential
//! authentication and the request/indication handlers.

pub mod allocation;
pub mod auth;
pub mod handlers;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub use allocation::{Allocation, AllocationManager, FiveTuple};
pub use auth::{AuthConfig, AuthOutcome, Authenticator};
pub use handlers::{
    data_indication, error_response, handle_allocate, handle_create_permission, handle_send,
};

/// Default maximum allocation lifetime in seconds.
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 3600;

/// Allocation manager configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host address relay sockets bind on (ephemeral ports).
    pub relay_host: IpAddr,
    /// Server transport address clients talk to; part of every five-tuple.
    pub server_addr: SocketAddr,
    /// Upper bound on allocation lifetime; requested lifetimes are clamped.
    pub max_lifetime: Duration,
}

impl RelayConfig {
    /// Configuration with the default lifetime bound.
    pub fn new(relay_host: IpAddr, server_addr: SocketAddr) -> Self {
        Self { relay_host, server_addr, max_lifetime: Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS) }
    }

    /// Override the maximum allocation lifetime.
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }
}
