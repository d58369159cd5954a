use std::collections::HashMap;
use std::net::Ipv4Addr;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::registry::NetworkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub u64);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "account-{}", self.0)
    }
}

/// An account's membership in one network. The address stays unset until
/// the account first connects, unless an operator fixed one; `temporary`
/// marks auto-assigned addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub network: NetworkId,
    pub is_owner: bool,
    pub address: Option<Ipv4Addr>,
    pub temporary: bool,
}

/// An identity known to the server. The password is kept only in hashed
/// form; memberships are ordered and the front one is the connect target.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub password_hash: String,
    pub networks: Vec<Membership>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account not found")]
    AccountNotFound,
    #[error("username {0:?} already exists")]
    UsernameTaken(String),
    #[error("account has no membership in network {0}")]
    NotAMember(NetworkId),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Identity and credential backend. Any implementation satisfying this
/// contract is interchangeable; the core never sees a plaintext password
/// hash algorithm, only this interface.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn lookup(&self, username: &str) -> Option<Account>;

    async fn get(&self, id: AccountId) -> Option<Account>;

    async fn verify_password(&self, account: &Account, candidate: &str) -> bool;

    async fn create(&self, username: &str, password: &str) -> Result<AccountId, StoreError>;

    async fn list_all(&self) -> Vec<Account>;

    /// Adds a network membership at the end of the account's list. A
    /// fixed address marks the membership as permanent.
    async fn add_membership(
        &self,
        account: AccountId,
        network: NetworkId,
        is_owner: bool,
        fixed_address: Option<Ipv4Addr>,
    ) -> Result<(), StoreError>;

    /// Moves the given membership to the front of the list so it becomes
    /// the network joined on the next connect.
    async fn switch_network(&self, account: AccountId, network: NetworkId)
        -> Result<(), StoreError>;

    /// Records the virtual address bound to the account on a network.
    async fn set_address(
        &self,
        account: AccountId,
        network: NetworkId,
        address: Ipv4Addr,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    by_id: HashMap<AccountId, Account>,
    by_name: HashMap<String, AccountId>,
}

/// In-memory `AccountStore` backend with argon2id password hashing.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<R>(
        &self,
        id: AccountId,
        f: impl FnOnce(&mut Account) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut inner = self.inner.write();
        let account = inner.by_id.get_mut(&id).ok_or(StoreError::AccountNotFound)?;
        f(account)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn lookup(&self, username: &str) -> Option<Account> {
        let inner = self.inner.read();
        let id = inner.by_name.get(username)?;
        inner.by_id.get(id).cloned()
    }

    async fn get(&self, id: AccountId) -> Option<Account> {
        self.inner.read().by_id.get(&id).cloned()
    }

    async fn verify_password(&self, account: &Account, candidate: &str) -> bool {
        let Ok(hash) = PasswordHash::new(&account.password_hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(candidate.as_bytes(), &hash)
            .is_ok()
    }

    async fn create(&self, username: &str, password: &str) -> Result<AccountId, StoreError> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| StoreError::Hash(e.to_string()))?
            .to_string();

        let mut inner = self.inner.write();
        if inner.by_name.contains_key(username) {
            return Err(StoreError::UsernameTaken(username.to_owned()));
        }

        let id = AccountId(inner.next_id);
        inner.next_id += 1;
        inner.by_name.insert(username.to_owned(), id);
        inner.by_id.insert(
            id,
            Account {
                id,
                username: username.to_owned(),
                password_hash,
                networks: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn list_all(&self) -> Vec<Account> {
        let mut accounts: Vec<_> = self.inner.read().by_id.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    async fn add_membership(
        &self,
        account: AccountId,
        network: NetworkId,
        is_owner: bool,
        fixed_address: Option<Ipv4Addr>,
    ) -> Result<(), StoreError> {
        self.with_account(account, |account| {
            if account.networks.iter().all(|m| m.network != network) {
                account.networks.push(Membership {
                    network,
                    is_owner,
                    address: fixed_address,
                    temporary: fixed_address.is_none(),
                });
            }
            Ok(())
        })
    }

    async fn switch_network(
        &self,
        account: AccountId,
        network: NetworkId,
    ) -> Result<(), StoreError> {
        self.with_account(account, |account| {
            let index = account
                .networks
                .iter()
                .position(|m| m.network == network)
                .ok_or(StoreError::NotAMember(network))?;
            let membership = account.networks.remove(index);
            account.networks.insert(0, membership);
            Ok(())
        })
    }

    async fn set_address(
        &self,
        account: AccountId,
        network: NetworkId,
        address: Ipv4Addr,
    ) -> Result<(), StoreError> {
        self.with_account(account, |account| {
            let membership = account
                .networks
                .iter_mut()
                .find(|m| m.network == network)
                .ok_or(StoreError::NotAMember(network))?;
            membership.address = Some(address);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_verify() {
        let store = MemoryStore::new();
        let id = store.create("alice", "secret").await.unwrap();

        let account = store.lookup("alice").await.unwrap();
        assert_eq!(account.id, id);
        assert_ne!(account.password_hash, "secret");
        assert!(store.verify_password(&account, "secret").await);
        assert!(!store.verify_password(&account, "wrong").await);
    }

    #[tokio::test]
    async fn test_duplicate_username() {
        let store = MemoryStore::new();
        store.create("alice", "one").await.unwrap();
        assert!(matches!(
            store.create("alice", "two").await,
            Err(StoreError::UsernameTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_usernames_case_sensitive() {
        let store = MemoryStore::new();
        store.create("alice", "secret").await.unwrap();
        assert!(store.lookup("Alice").await.is_none());
    }

    #[tokio::test]
    async fn test_memberships() {
        let store = MemoryStore::new();
        let id = store.create("alice", "secret").await.unwrap();
        store
            .add_membership(id, NetworkId(1), true, None)
            .await
            .unwrap();
        store
            .add_membership(id, NetworkId(2), false, Some(Ipv4Addr::new(10, 0, 0, 7)))
            .await
            .unwrap();
        // Adding the same network twice is a no-op.
        store
            .add_membership(id, NetworkId(1), false, None)
            .await
            .unwrap();

        let account = store.get(id).await.unwrap();
        assert_eq!(account.networks.len(), 2);
        assert!(account.networks[0].temporary);
        assert!(!account.networks[1].temporary);

        store.switch_network(id, NetworkId(2)).await.unwrap();
        let account = store.get(id).await.unwrap();
        assert_eq!(account.networks[0].network, NetworkId(2));
    }

    #[tokio::test]
    async fn test_set_address() {
        let store = MemoryStore::new();
        let id = store.create("alice", "secret").await.unwrap();
        store
            .add_membership(id, NetworkId(1), false, None)
            .await
            .unwrap();
        store
            .set_address(id, NetworkId(1), Ipv4Addr::new(10, 0, 0, 3))
            .await
            .unwrap();

        let account = store.get(id).await.unwrap();
        assert_eq!(account.networks[0].address, Some(Ipv4Addr::new(10, 0, 0, 3)));

        assert!(matches!(
            store
                .set_address(id, NetworkId(9), Ipv4Addr::new(10, 0, 0, 3))
                .await,
            Err(StoreError::NotAMember(_))
        ));
    }
}
