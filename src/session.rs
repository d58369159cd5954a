use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::account::AccountId;
use crate::registry::NetworkId;

/// Length of a session key in bytes. The same bytes are handed to the
/// client in the configuration frame and used as the ChaCha20-Poly1305
/// key for all tunnel payloads of the session.
pub const SESSION_KEY_LEN: usize = 32;

pub type SessionKey = [u8; SESSION_KEY_LEN];

/// Live binding between a transport endpoint and an authenticated
/// account, including the virtual address bound on the joined network
/// and the cipher key issued for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub endpoint: SocketAddr,
    pub account: AccountId,
    pub network: NetworkId,
    pub address: Ipv4Addr,
    pub key: SessionKey,
}

#[derive(Default)]
struct Tables {
    by_endpoint: HashMap<SocketAddr, Arc<Session>>,
    by_account: HashMap<AccountId, SocketAddr>,
}

/// Single source of truth for which transport endpoints are connected.
/// An account holds at most one session: re-authentication supersedes
/// the previous entry. Sessions persist until removed or superseded,
/// there is no idle timeout.
#[derive(Default)]
pub struct SessionTable {
    tables: RwLock<Tables>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_endpoint(&self, endpoint: &SocketAddr) -> Option<Arc<Session>> {
        self.tables.read().by_endpoint.get(endpoint).cloned()
    }

    pub fn lookup_account(&self, account: AccountId) -> Option<Arc<Session>> {
        let tables = self.tables.read();
        let endpoint = tables.by_account.get(&account)?;
        tables.by_endpoint.get(endpoint).cloned()
    }

    /// Creates a session with a fresh random key. Any prior session of
    /// the same account, at whatever endpoint, is removed under the same
    /// write lock, so two concurrent authentications cannot leave two
    /// live sessions behind.
    pub fn establish(
        &self,
        endpoint: SocketAddr,
        account: AccountId,
        network: NetworkId,
        address: Ipv4Addr,
    ) -> Arc<Session> {
        let mut key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut key);

        let session = Arc::new(Session {
            endpoint,
            account,
            network,
            address,
            key,
        });

        let mut tables = self.tables.write();
        if let Some(old) = tables.by_account.insert(account, endpoint) {
            tables.by_endpoint.remove(&old);
        }
        if let Some(displaced) = tables.by_endpoint.insert(endpoint, Arc::clone(&session)) {
            // The endpoint was reused by a different account; its former
            // holder must not keep resolving to this endpoint.
            if displaced.account != account
                && tables.by_account.get(&displaced.account) == Some(&endpoint)
            {
                tables.by_account.remove(&displaced.account);
            }
        }
        session
    }

    pub fn remove(&self, endpoint: &SocketAddr) -> Option<Arc<Session>> {
        let mut tables = self.tables.write();
        let session = tables.by_endpoint.remove(endpoint)?;
        // Only drop the account index if it still points here; it may
        // already belong to a superseding session.
        if tables.by_account.get(&session.account) == Some(endpoint) {
            tables.by_account.remove(&session.account);
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
