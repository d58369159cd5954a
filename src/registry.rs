use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::account::AccountId;
use crate::addr::{first_free_address, AddrError, RangeSpec, Subnet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u64);

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "network-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("network {0} not found")]
    NetworkNotFound(NetworkId),
    #[error("address pool of {0} is exhausted")]
    PoolExhausted(NetworkId),
    #[error("address {0} is already bound")]
    AddressConflict(Ipv4Addr),
    #[error(transparent)]
    Addr(#[from] AddrError),
}

/// One private network: its derived subnet, its capacity and the live
/// map of which account currently holds which virtual address.
pub struct Network {
    pub id: NetworkId,
    pub subnet: Subnet,
    pub capacity: u32,
    bindings: Mutex<IndexMap<AccountId, Ipv4Addr>>,
}

impl Network {
    /// Returns the account's bound address, reserving a new one if it
    /// has none. A previously recorded binding is always returned as-is,
    /// so reconnecting yields a stable address. A fixed address reserves
    /// exactly that address or fails with `AddressConflict`. The whole
    /// operation runs under the network's binding lock.
    pub fn bind_address(
        &self,
        account: AccountId,
        fixed: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, RegistryError> {
        let mut bindings = self.bindings.lock();

        if let Some(address) = bindings.get(&account) {
            return Ok(*address);
        }

        // Every new binding counts against the capacity, fixed or not.
        if bindings.len() as u32 >= self.capacity {
            return Err(RegistryError::PoolExhausted(self.id));
        }

        let address = match fixed {
            Some(address) => {
                if bindings.values().any(|a| *a == address) {
                    return Err(RegistryError::AddressConflict(address));
                }
                address
            }
            None => first_free_address(self.subnet.base, self.capacity, |a| {
                bindings.values().any(|b| *b == a)
            })
            .ok_or(RegistryError::PoolExhausted(self.id))?,
        };

        bindings.insert(account, address);
        Ok(address)
    }

    pub fn address_of(&self, account: AccountId) -> Option<Ipv4Addr> {
        self.bindings.lock().get(&account).copied()
    }

    /// Reverse lookup: which account holds this virtual address.
    pub fn account_at(&self, address: Ipv4Addr) -> Option<AccountId> {
        self.bindings
            .lock()
            .iter()
            .find(|(_, a)| **a == address)
            .map(|(id, _)| *id)
    }

    pub fn bindings(&self) -> Vec<(AccountId, Ipv4Addr)> {
        self.bindings
            .lock()
            .iter()
            .map(|(id, a)| (*id, *a))
            .collect()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }
}

/// Owns all network records. Binding maps are mutated only through
/// `Network::bind_address`, each under its own lock.
#[derive(Default)]
pub struct NetworkRegistry {
    networks: RwLock<HashMap<NetworkId, Arc<Network>>>,
    next_id: AtomicU64,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_network(
        &self,
        spec: Option<RangeSpec>,
        capacity: u32,
    ) -> Result<NetworkId, RegistryError> {
        let subnet = Subnet::derive(spec)?;
        let id = NetworkId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.networks.write().insert(
            id,
            Arc::new(Network {
                id,
                subnet,
                capacity,
                bindings: Mutex::new(IndexMap::new()),
            }),
        );
        Ok(id)
    }

    pub fn get(&self, id: NetworkId) -> Result<Arc<Network>, RegistryError> {
        self.networks
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NetworkNotFound(id))
    }

    pub fn list_networks(&self) -> Vec<Arc<Network>> {
        let mut networks: Vec<_> = self.networks.read().values().cloned().collect();
        networks.sort_by_key(|n| n.id);
        networks
    }
}
