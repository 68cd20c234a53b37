//! STUN/TURN protocol stack for NAT traversal.
//!
//! Codec for STUN messages (header bit-packing, TLV attributes, XOR address
//! obfuscation, HMAC-SHA1 integrity, CRC32 fingerprint), retransmitting
//! UDP/TCP transaction agents, and a TURN relay engine with allocations,
//! IP-scoped permissions and long-term credential authentication.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod error;
pub mod message;
pub mod relay;

pub use agent::{AgentConfig, TcpAgent, TransportProtocol, UdpAgent};
pub use error::{Result, StunError};
pub use message::{
    Attribute, AttributeType, MessageBuilder, MessageClass, MessageHeader, Method, StunMessage,
    TransactionId, MAGIC_COOKIE, MAX_MESSAGE_SIZE,
};
pub use relay::{
    Allocation, AllocationManager, AuthConfig, AuthOutcome, Authenticator, FiveTuple, RelayConfig,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with an `EnvFilter`-driven subscriber.
///
/// `RUST_LOG` takes precedence over `level`; noisy dependency targets are
/// pinned to `warn`.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}
