use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::auth::{ConfigFrame, Credentials, FrameError, STATUS_ERROR};
use crate::cipher::{self, CipherError};
use crate::monitor::TransferCounter;
use crate::session::SessionKey;
use crate::MAX_UDP_SIZE;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed: incorrect credentials")]
    AuthenticationFailed,
    #[error("no reply from server")]
    Timeout,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel client: performs the one round-trip handshake and then seals
/// and opens raw IP datagrams for the OS layer. Creating the virtual
/// adapter itself is up to the caller.
pub struct Client {
    socket: UdpSocket,
    server: SocketAddr,
}

/// An established client-side tunnel: the assigned virtual address, the
/// network's subnet mask, the session key, and transfer counters for
/// reporting.
pub struct ClientSession {
    socket: UdpSocket,
    server: SocketAddr,
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
    key: SessionKey,
    pub monitor: Arc<TransferCounter>,
}

impl Client {
    pub async fn new(server: SocketAddr) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self { socket, server })
    }

    /// Sends the credential frame and waits for the configuration
    /// reply. A single error byte, or no reply within the timeout, ends
    /// the attempt; retrying is safe because re-authentication simply
    /// supersedes the stale session on the server.
    pub async fn authenticate(
        self,
        username: &str,
        password: &str,
    ) -> Result<ClientSession, ClientError> {
        let frame = Credentials::new(username, password).encode()?;
        self.socket.send_to(&frame, self.server).await?;

        let mut buf = vec![0u8; MAX_UDP_SIZE];
        let (len, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout)??;

        if len <= 1 {
            if len == 1 && buf[0] != STATUS_ERROR {
                log::warn!("unexpected status byte {:#04x} from server", buf[0]);
            }
            return Err(ClientError::AuthenticationFailed);
        }

        let config = ConfigFrame::decode(&buf[..len])?;
        log::info!(
            "connected: address {} mask {}",
            config.address,
            config.mask
        );

        Ok(ClientSession {
            socket: self.socket,
            server: self.server,
            address: config.address,
            mask: config.mask,
            key: config.key,
            monitor: Arc::new(TransferCounter::new()),
        })
    }
}

impl ClientSession {
    /// Seals one raw IP datagram and sends it into the tunnel.
    pub async fn send(&self, datagram: &[u8]) -> Result<(), ClientError> {
        let wire = cipher::seal(&self.key, datagram)?;
        let sent = self.socket.send_to(&wire, self.server).await?;
        self.monitor.record_upload(sent);
        Ok(())
    }

    /// Receives and opens the next tunnel payload. Undecryptable
    /// datagrams surface as `Cipher` errors; the session stays usable.
    pub async fn recv(&self) -> Result<Vec<u8>, ClientError> {
        let mut buf = vec![0u8; MAX_UDP_SIZE];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        let datagram = cipher::open(&self.key, &buf[..len])?;
        self.monitor.record_download(datagram.len());
        Ok(datagram)
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    #[cfg(test)]
    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}
