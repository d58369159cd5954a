use std::net::Ipv4Addr;

use crate::account::{Account, AccountStore};
use crate::session::{SessionKey, SESSION_KEY_LEN};

/// Marker a client puts on a credential frame.
pub const STATUS_PENDING: u8 = 0x01;
/// Single-byte acknowledgement of a successful authentication.
pub const STATUS_SUCCESS: u8 = 0x02;
/// Single-byte rejection; deliberately the same for unknown users and
/// wrong passwords.
pub const STATUS_ERROR: u8 = 0x03;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is truncated or has inconsistent lengths")]
    Malformed,
    #[error("credential field longer than 255 bytes")]
    FieldTooLong,
    #[error("credential field is not valid UTF-8")]
    Encoding,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown user or wrong password; reported to the client as the
    /// error status byte, never distinguished further.
    #[error("bad credentials")]
    Rejected,
    /// The frame could not be decoded at all; dropped without a reply.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Plaintext credentials carried by the wire frame
/// `[pending][ulen][username][plen][password]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.username.len() > 255 || self.password.len() > 255 {
            return Err(FrameError::FieldTooLong);
        }

        let mut frame = Vec::with_capacity(3 + self.username.len() + self.password.len());
        frame.push(STATUS_PENDING);
        frame.push(self.username.len() as u8);
        frame.extend_from_slice(self.username.as_bytes());
        frame.push(self.password.len() as u8);
        frame.extend_from_slice(self.password.as_bytes());
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < 3 || frame[0] != STATUS_PENDING {
            return Err(FrameError::Malformed);
        }

        let ulen = frame[1] as usize;
        let username_end = 2 + ulen;
        if frame.len() < username_end + 1 {
            return Err(FrameError::Malformed);
        }

        let plen = frame[username_end] as usize;
        let password_end = username_end + 1 + plen;
        if frame.len() < password_end {
            return Err(FrameError::Malformed);
        }

        let username = std::str::from_utf8(&frame[2..username_end])
            .map_err(|_| FrameError::Encoding)?
            .to_owned();
        let password = std::str::from_utf8(&frame[username_end + 1..password_end])
            .map_err(|_| FrameError::Encoding)?
            .to_owned();

        Ok(Self { username, password })
    }
}

/// Handshake reply: assigned address, subnet mask and the session key,
/// `[ip:4][mask:4][key:32]`. Sent exactly once per successful
/// authentication; the key bytes are opaque to this codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFrame {
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub key: SessionKey,
}

impl ConfigFrame {
    pub const LEN: usize = 8 + SESSION_KEY_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(Self::LEN);
        frame.extend_from_slice(&self.address.octets());
        frame.extend_from_slice(&self.mask.octets());
        frame.extend_from_slice(&self.key);
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != Self::LEN {
            return Err(FrameError::Malformed);
        }

        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&frame[8..]);

        Ok(Self {
            address: Ipv4Addr::new(frame[0], frame[1], frame[2], frame[3]),
            mask: Ipv4Addr::new(frame[4], frame[5], frame[6], frame[7]),
            key,
        })
    }
}

/// Decodes a credential frame and checks it against the store. A lookup
/// miss and a failed password check are both `Rejected`.
pub async fn check_credentials(
    store: &dyn AccountStore,
    frame: &[u8],
) -> Result<Account, AuthError> {
    let credentials = Credentials::decode(frame)?;

    let account = store
        .lookup(&credentials.username)
        .await
        .ok_or(AuthError::Rejected)?;

    if store.verify_password(&account, &credentials.password).await {
        Ok(account)
    } else {
        Err(AuthError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MemoryStore;

    #[test]
    fn test_credentials_round_trip() {
        let credentials = Credentials::new("alice", "sécret…");
        let frame = credentials.encode().unwrap();

        assert_eq!(frame[0], STATUS_PENDING);
        assert_eq!(Credentials::decode(&frame).unwrap(), credentials);
    }

    #[test]
    fn test_credentials_max_length() {
        let credentials = Credentials::new("u".repeat(255), "p".repeat(255));
        let frame = credentials.encode().unwrap();
        assert_eq!(Credentials::decode(&frame).unwrap(), credentials);

        let too_long = Credentials::new("u".repeat(256), "p");
        assert_eq!(too_long.encode(), Err(FrameError::FieldTooLong));
    }

    #[test]
    fn test_credentials_truncated() {
        let frame = Credentials::new("alice", "secret").encode().unwrap();

        for len in 0..frame.len() {
            assert!(Credentials::decode(&frame[..len]).is_err());
        }
    }

    #[test]
    fn test_credentials_bad_status() {
        let mut frame = Credentials::new("alice", "secret").encode().unwrap();
        frame[0] = STATUS_SUCCESS;
        assert_eq!(Credentials::decode(&frame), Err(FrameError::Malformed));
    }

    #[test]
    fn test_credentials_declared_length_exceeds_buffer() {
        // ulen claims 200 bytes of username in a 10 byte frame.
        let frame = [STATUS_PENDING, 200, b'a', b'b', b'c', 3, b'x', b'y', b'z', 0];
        assert_eq!(Credentials::decode(&frame), Err(FrameError::Malformed));
    }

    #[test]
    fn test_config_frame_round_trip() {
        let frame = ConfigFrame {
            address: Ipv4Addr::new(10, 0, 0, 1),
            mask: Ipv4Addr::new(255, 255, 255, 248),
            key: [0x42; SESSION_KEY_LEN],
        };

        let encoded = frame.encode();
        assert_eq!(encoded.len(), ConfigFrame::LEN);
        assert_eq!(ConfigFrame::decode(&encoded).unwrap(), frame);
        assert_eq!(
            ConfigFrame::decode(&encoded[..10]),
            Err(FrameError::Malformed)
        );
    }

    #[tokio::test]
    async fn test_check_credentials() {
        let store = MemoryStore::new();
        store.create("alice", "secret").await.unwrap();

        let good = Credentials::new("alice", "secret").encode().unwrap();
        assert!(check_credentials(&store, &good).await.is_ok());

        let wrong = Credentials::new("alice", "nope").encode().unwrap();
        assert!(matches!(
            check_credentials(&store, &wrong).await,
            Err(AuthError::Rejected)
        ));

        let unknown = Credentials::new("mallory", "secret").encode().unwrap();
        assert!(matches!(
            check_credentials(&store, &unknown).await,
            Err(AuthError::Rejected)
        ));

        assert!(matches!(
            check_credentials(&store, &[0x00, 0x01]).await,
            Err(AuthError::Frame(_))
        ));
    }
}
