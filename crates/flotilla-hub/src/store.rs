//! Persistent hub storage using sled
//!
//! Hub records live under `hubs/<map>/<hub id>`, raw gossip messages under
//! `rawmsg/<map>/<hub id>/<kind>` and the local identity under
//! `identity/local`. Update hooks fire after every put or delete so the
//! navigator can keep its map in sync.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::identity::{HubId, Identity};
use crate::records::Hub;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("no identity stored")]
    NoIdentity,
}

/// A change to a stored hub, delivered to update hooks
#[derive(Clone, Debug)]
pub enum HubUpdate {
    /// A hub record was created or updated
    Put(Hub),
    /// A hub record was deleted
    Removed(HubId),
}

type UpdateHook = Box<dyn Fn(&str, &HubUpdate) + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    signing_seed: [u8; 32],
    exchange_seed: [u8; 32],
}

/// Storage backend for hub records and gossip state
pub struct HubStore {
    db: Db,
    /// Hub tree: `<map>/<hub id>` -> Hub
    hubs: sled::Tree,
    /// Raw message tree: `<map>/<hub id>/<kind>` -> bytes
    raw_msgs: sled::Tree,
    /// Identity tree
    identity: sled::Tree,
    /// Hooks fired on every hub change
    hooks: RwLock<Vec<UpdateHook>>,
}

impl HubStore {
    /// Open storage at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let hubs = db.open_tree("hubs")?;
        let raw_msgs = db.open_tree("rawmsg")?;
        let identity = db.open_tree("identity")?;

        Ok(Self { db, hubs, raw_msgs, identity, hooks: RwLock::new(Vec::new()) })
    }

    /// Register a hook that runs after every hub put or delete.
    pub fn register_update_hook(&self, hook: impl Fn(&str, &HubUpdate) + Send + Sync + 'static) {
        self.hooks.write().push(Box::new(hook));
    }

    fn fire_hooks(&self, map: &str, update: &HubUpdate) {
        for hook in self.hooks.read().iter() {
            hook(map, update);
        }
    }

    fn hub_key(map: &str, id: &HubId) -> String {
        format!("{}/{}", map, id.to_hex())
    }

    /// Store a hub record and notify hooks.
    pub fn put_hub(&self, map: &str, hub: &Hub) -> Result<(), StoreError> {
        let value = postcard::to_allocvec(hub)?;
        self.hubs.insert(Self::hub_key(map, &hub.id), value)?;
        debug!(hub = %hub.id, map, "stored hub record");
        self.fire_hooks(map, &HubUpdate::Put(hub.clone()));
        Ok(())
    }

    /// Get a hub record.
    pub fn get_hub(&self, map: &str, id: &HubId) -> Result<Option<Hub>, StoreError> {
        match self.hubs.get(Self::hub_key(map, id))? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a hub record and its raw messages, notifying hooks.
    pub fn remove_hub(&self, map: &str, id: &HubId) -> Result<(), StoreError> {
        self.hubs.remove(Self::hub_key(map, id))?;
        for kind in ["announcement", "status"] {
            self.raw_msgs.remove(format!("{}/{}/{}", map, id.to_hex(), kind))?;
        }
        self.fire_hooks(map, &HubUpdate::Removed(*id));
        Ok(())
    }

    /// Iterate all hubs of a map.
    pub fn all_hubs(&self, map: &str) -> Result<Vec<Hub>, StoreError> {
        let prefix = format!("{map}/");
        let mut hubs = Vec::new();
        for entry in self.hubs.scan_prefix(&prefix) {
            let (_, bytes) = entry?;
            hubs.push(postcard::from_bytes(&bytes)?);
        }
        Ok(hubs)
    }

    /// Store the raw gossip bytes a record arrived as.
    pub fn put_raw_msg(
        &self,
        map: &str,
        id: &HubId,
        kind: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.raw_msgs
            .insert(format!("{}/{}/{}", map, id.to_hex(), kind), data)?;
        Ok(())
    }

    /// Get the raw gossip bytes of a record, for re-forwarding.
    pub fn get_raw_msg(
        &self,
        map: &str,
        id: &HubId,
        kind: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .raw_msgs
            .get(format!("{}/{}/{}", map, id.to_hex(), kind))?
            .map(|v| v.to_vec()))
    }

    /// Persist the local identity.
    pub fn put_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let stored = StoredIdentity {
            signing_seed: identity.signing_seed(),
            exchange_seed: identity.exchange_seed(),
        };
        self.identity.insert("local", postcard::to_allocvec(&stored)?)?;
        Ok(())
    }

    /// Load the local identity.
    pub fn get_identity(&self) -> Result<Identity, StoreError> {
        let bytes = self.identity.get("local")?.ok_or(StoreError::NoIdentity)?;
        let stored: StoredIdentity = postcard::from_bytes(&bytes)?;
        Ok(Identity::from_parts(&stored.signing_seed, &stored.exchange_seed))
    }

    /// Flush all pending writes.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn hub_roundtrip() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();

        let identity = Identity::from_seed(&[1; 32]);
        let hub = Hub::new(identity.hub_id());
        store.put_hub("main", &hub).unwrap();

        let loaded = store.get_hub("main", &hub.id).unwrap().unwrap();
        assert_eq!(loaded.id, hub.id);
        assert_eq!(store.all_hubs("main").unwrap().len(), 1);

        store.remove_hub("main", &hub.id).unwrap();
        assert!(store.get_hub("main", &hub.id).unwrap().is_none());
    }

    #[test]
    fn hooks_fire_on_changes() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();

        let puts = Arc::new(AtomicUsize::new(0));
        let removes = Arc::new(AtomicUsize::new(0));
        let (p, r) = (puts.clone(), removes.clone());
        store.register_update_hook(move |_, update| match update {
            HubUpdate::Put(_) => {
                p.fetch_add(1, Ordering::SeqCst);
            }
            HubUpdate::Removed(_) => {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        let hub = Hub::new(Identity::from_seed(&[2; 32]).hub_id());
        store.put_hub("main", &hub).unwrap();
        store.remove_hub("main", &hub.id).unwrap();

        assert_eq!(puts.load(Ordering::SeqCst), 1);
        assert_eq!(removes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn identity_persistence() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();

        assert!(matches!(store.get_identity(), Err(StoreError::NoIdentity)));

        let identity = Identity::from_seed(&[3; 32]);
        store.put_identity(&identity).unwrap();
        let loaded = store.get_identity().unwrap();
        assert_eq!(loaded.hub_id(), identity.hub_id());
        assert_eq!(loaded.exchange_public(), identity.exchange_public());
    }

    #[test]
    fn raw_msgs_roundtrip() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();

        let id = Identity::from_seed(&[4; 32]).hub_id();
        store.put_raw_msg("main", &id, "status", b"raw bytes").unwrap();
        assert_eq!(
            store.get_raw_msg("main", &id, "status").unwrap().unwrap(),
            b"raw bytes"
        );
        assert!(store.get_raw_msg("main", &id, "announcement").unwrap().is_none());
    }
}
