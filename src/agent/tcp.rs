//! TCP transport agent: one fresh connection per call, no reuse.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::AgentConfig;
use crate::error::{Result, StunError};
use crate::message::{validate_wire, MAX_MESSAGE_SIZE};

/// TCP agent. Each `indicate`/`request` opens its own connection and closes
/// it before returning; connection errors propagate to the caller.
pub struct TcpAgent {
    config: AgentConfig,
    cancel: CancellationToken,
}

impl TcpAgent {
    /// Create an agent for the configured destination.
    pub fn new(config: AgentConfig) -> Self {
        Self { config, cancel: CancellationToken::new() }
    }

    /// Destination this agent connects to.
    pub fn dest(&self) -> SocketAddr {
        self.config.dest
    }

    /// Connect, write the bytes, close. No response expected.
    pub async fn indicate(&self, msg: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StunError::AgentClosed);
        }
        let mut stream = TcpStream::connect(self.config.dest).await?;
        stream.write_all(msg).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Connect, write the bytes, then wait for the first inbound data or
    /// the `ti` timeout, whichever comes first. The connection is closed
    /// either way.
    pub async fn request(&self, msg: &[u8]) -> Result<Bytes> {
        if self.cancel.is_cancelled() {
            return Err(StunError::AgentClosed);
        }
        let mut stream = TcpStream::connect(self.config.dest).await?;
        stream.write_all(msg).await?;
        trace!("request sent to {} over tcp", self.config.dest);

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("tcp request to {} cancelled by close", self.config.dest);
                Err(StunError::AgentClosed)
            }
            read = stream.read(&mut buf) => {
                let len = read?;
                if len == 0 {
                    return Err(StunError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed before any response data",
                    )));
                }
                validate_wire(&buf[..len])?;
                Ok(Bytes::copy_from_slice(&buf[..len]))
            }
            _ = sleep(self.config.ti) => {
                debug!("tcp request to {} timed out after {:?}", self.config.dest, self.config.ti);
                Err(StunError::Timeout(self.config.ti))
            }
        }
    }

    /// Stop the agent; any in-flight `request` settles with
    /// [`StunError::AgentClosed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TcpAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn indicate_writes_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            peer.read_to_end(&mut received).await.unwrap();
            received
        });

        let agent = TcpAgent::new(AgentConfig::new(dest));
        agent.indicate(b"indication-bytes").await.unwrap();
        assert_eq!(accept.await.unwrap(), b"indication-bytes");
    }

    #[tokio::test]
    async fn request_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            // Hold the connection open without answering.
            sleep(Duration::from_millis(200)).await;
            drop(peer);
        });

        let agent =
            TcpAgent::new(AgentConfig::new(dest).with_tcp_timeout(Duration::from_millis(50)));
        let err = agent.request(b"probe").await.unwrap_err();
        assert!(matches!(err, StunError::Timeout(_)));
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn connect_error_propagates() {
        // Nothing listens on this port.
        let agent = TcpAgent::new(AgentConfig::new("127.0.0.1:1".parse().unwrap()));
        assert!(matches!(agent.request(b"probe").await.unwrap_err(), StunError::Io(_)));
    }
}
