/*!
 * Connection registry for devlink.
 *
 * Tracks which transports currently hold which device addresses, so that
 * two transports sharing an address know about each other. A registry is
 * created by the application and handed to each transport that should take
 * part; there is no process-wide instance.
 */
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::debug;

use devlink_core::types::Id;

/// Event types for the connection registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// An owner started holding an address
    Acquired {
        /// The device address
        address: String,
        /// The owner that acquired it
        owner: Id,
        /// Holders after the change
        holders: usize,
    },
    /// An owner stopped holding an address
    Released {
        /// The device address
        address: String,
        /// The owner that released it
        owner: Id,
        /// Holders after the change
        holders: usize,
    },
}

/// Reference-counted record of held device addresses
#[derive(Debug)]
pub struct ConnectionRegistry {
    /// Owners per address
    holders: RwLock<HashMap<String, HashSet<Id>>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            holders: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashSet<Id>>> {
        self.holders.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashSet<Id>>> {
        self.holders.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `owner` as holding `address`. Returns the number of holders
    /// afterwards; acquiring twice counts once.
    pub fn acquire(&self, address: &str, owner: &Id) -> usize {
        let count = {
            let mut holders = self.write();
            let owners = holders.entry(address.to_string()).or_default();
            if !owners.insert(owner.clone()) {
                return owners.len();
            }
            owners.len()
        };

        debug!("{} acquired {} ({} holders)", owner, address, count);
        let _ = self.event_sender.send(RegistryEvent::Acquired {
            address: address.to_string(),
            owner: owner.clone(),
            holders: count,
        });
        count
    }

    /// Drop `owner`'s hold on `address`. Returns the number of holders
    /// remaining.
    pub fn release(&self, address: &str, owner: &Id) -> usize {
        let (removed, count) = {
            let mut holders = self.write();
            match holders.get_mut(address) {
                Some(owners) => {
                    let removed = owners.remove(owner);
                    let count = owners.len();
                    if count == 0 {
                        holders.remove(address);
                    }
                    (removed, count)
                }
                None => (false, 0),
            }
        };

        if removed {
            debug!("{} released {} ({} holders)", owner, address, count);
            let _ = self.event_sender.send(RegistryEvent::Released {
                address: address.to_string(),
                owner: owner.clone(),
                holders: count,
            });
        }
        count
    }

    /// Number of owners holding `address`
    pub fn holders(&self, address: &str) -> usize {
        self.read().get(address).map_or(0, HashSet::len)
    }

    /// Whether anyone holds `address`
    pub fn is_held(&self, address: &str) -> bool {
        self.holders(address) > 0
    }

    /// Every held address
    pub fn addresses(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared connection registry that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedConnectionRegistry(Arc<ConnectionRegistry>);

impl SharedConnectionRegistry {
    /// Create a new shared registry
    pub fn new() -> Self {
        Self(Arc::new(ConnectionRegistry::new()))
    }

    /// Get a reference to the registry
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.0
    }
}

impl AsRef<ConnectionRegistry> for SharedConnectionRegistry {
    fn as_ref(&self) -> &ConnectionRegistry {
        self.registry()
    }
}
