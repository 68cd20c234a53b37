//! UDP transport agent with RFC 5389 style retransmission.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::AgentConfig;
use crate::error::{Result, StunError};
use crate::message::{validate_wire, MAX_MESSAGE_SIZE};

/// UDP agent bound to one ephemeral local socket for its lifetime.
///
/// `request` races a retransmission schedule against the first inbound
/// datagram under two independent deadlines: a hard cap of `rc` send
/// attempts and an overall timeout of `rto * rm` from the first send.
/// Whichever is reached first without a response wins.
pub struct UdpAgent {
    socket: Arc<UdpSocket>,
    config: AgentConfig,
    cancel: CancellationToken,
}

impl UdpAgent {
    /// Bind an ephemeral local socket matching the destination's family.
    pub async fn bind(config: AgentConfig) -> Result<Self> {
        let local: SocketAddr = if config.dest.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local).await?;
        debug!("udp agent bound on {} for {}", socket.local_addr()?, config.dest);
        Ok(Self { socket: Arc::new(socket), config, cancel: CancellationToken::new() })
    }

    /// Local address of the agent's socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Fire-and-forget send of pre-encoded bytes. No retransmission, no
    /// response expected.
    pub async fn indicate(&self, msg: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StunError::AgentClosed);
        }
        self.socket.send_to(msg, self.config.dest).await?;
        Ok(())
    }

    /// Send pre-encoded bytes and wait for the first inbound datagram.
    ///
    /// Attempt k+1 goes out when `rto * k` has elapsed since the first
    /// send. Reaching the attempt cap yields [`StunError::MaxAttemptsExceeded`];
    /// the overall deadline yields [`StunError::Timeout`]. Any inbound
    /// datagram resolves the call immediately after a syntactic STUN check,
    /// cancelling all pending timers; the caller filters transaction IDs.
    pub async fn request(&self, msg: &[u8]) -> Result<Bytes> {
        if self.cancel.is_cancelled() {
            return Err(StunError::AgentClosed);
        }

        let rto = self.config.rto;
        let overall = rto * self.config.rm;

        self.socket.send_to(msg, self.config.dest).await?;
        let first_send = Instant::now();
        let mut attempts: u32 = 1;
        trace!("request attempt 1 to {}", self.config.dest);

        let deadline = sleep_until(first_send + overall);
        tokio::pin!(deadline);
        let retransmit = sleep_until(first_send + rto);
        tokio::pin!(retransmit);

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            // On a tick where the retransmission timer and the overall
            // deadline are both due, the retransmission is serviced first
            // and the deadline wins on the next poll.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("request to {} cancelled by close", self.config.dest);
                    return Err(StunError::AgentClosed);
                }
                recv = self.socket.recv_from(&mut buf) => {
                    let (len, from) = recv?;
                    trace!("response candidate: {} bytes from {}", len, from);
                    validate_wire(&buf[..len])?;
                    return Ok(Bytes::copy_from_slice(&buf[..len]));
                }
                _ = &mut retransmit => {
                    if attempts >= self.config.rc {
                        debug!(
                            "request to {} exhausted {} attempts",
                            self.config.dest, attempts
                        );
                        return Err(StunError::MaxAttemptsExceeded(self.config.rc));
                    }
                    self.socket.send_to(msg, self.config.dest).await?;
                    attempts += 1;
                    trace!("request attempt {} to {}", attempts, self.config.dest);
                    retransmit.as_mut().reset(first_send + rto * attempts);
                }
                _ = &mut deadline => {
                    debug!(
                        "request to {} timed out after {:?} ({} attempts)",
                        self.config.dest, overall, attempts
                    );
                    return Err(StunError::Timeout(overall));
                }
            }
        }
    }

    /// Cancel all pending timers and stop the agent. Synchronous: any
    /// in-flight `request` settles with [`StunError::AgentClosed`] and no
    /// timer fires afterwards.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for UdpAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
