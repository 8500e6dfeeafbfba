//! The agent's end of the relay socket.
//!
//! Injection agents dial the relay and read input frames. The relay's
//! keepalive counts as traffic; silence past the ping timeout means the
//! relay is gone and the agent should redial.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};

use crate::codec::{AgentCodec, AgentFrame};
use crate::error::RelayError;

/// Longest silence tolerated from the relay.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug)]
pub struct AgentClient {
    frames: FramedRead<TcpStream, AgentCodec>,
    ping_timeout: Duration,
}

impl AgentClient {
    pub async fn connect(addr: SocketAddr, ping_timeout: Duration) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("agent connected to relay at {addr}");
        Ok(Self {
            frames: FramedRead::new(stream, AgentCodec),
            ping_timeout,
        })
    }

    /// Next key or pointer frame, skipping keepalives.
    ///
    /// `Ok(None)` means the relay closed the connection.
    pub async fn next_event(&mut self) -> Result<Option<AgentFrame>, RelayError> {
        loop {
            let next = tokio::time::timeout(self.ping_timeout, self.frames.next())
                .await
                .map_err(|_| RelayError::Timeout(self.ping_timeout))?;
            match next {
                Some(Ok(AgentFrame::Keepalive)) => trace!("relay keepalive"),
                Some(Ok(frame)) => return Ok(Some(frame)),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KeyEvent, KeyState};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn ephemeral_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn skips_keepalives_and_decodes_frames() {
        let (listener, addr) = ephemeral_listener().await;
        let relay = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"\0\0K65,1|\0").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut client = AgentClient::connect(addr, DEFAULT_PING_TIMEOUT).await.unwrap();
        assert_eq!(
            client.next_event().await.unwrap(),
            Some(AgentFrame::Key(KeyEvent::new(65, KeyState::Pressed)))
        );
        assert_eq!(client.next_event().await.unwrap(), None);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn silent_relay_times_out() {
        let (listener, addr) = ephemeral_listener().await;
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let mut client = AgentClient::connect(addr, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(
            client.next_event().await,
            Err(RelayError::Timeout(_))
        ));
        relay.await.unwrap();
    }
}
