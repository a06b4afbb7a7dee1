//! Hub gossip import and relay
//!
//! Hub records travel as opaque blobs through the controller terminal of
//! every active crane. Receivers verify and persist them, then forward
//! records that were new or changed to all other assigned cranes.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flotilla_core::{Error, Result};
use flotilla_hub::records::{apply_announcement, apply_status};
use flotilla_hub::{Hub, HubId, HubStore, Scope};
use flotilla_terminal::op::{register_op_type, OpParams, OpTerminal, Operation, TerminalPermission};

use crate::crane::Crane;
use crate::registry;

/// Type name of the gossip relay operation
pub const GOSSIP_OP_TYPE: &str = "gossip";

/// Import context attached to gossip-relaying cranes
pub struct GossipContext {
    /// Record store
    pub store: Arc<HubStore>,
    /// Map the records belong to
    pub map: String,
    /// Gossip scope of this crane's network
    pub scope: Scope,
}

/// A gossip message carrying raw record blobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipMsg {
    /// Hub the records claim to describe
    pub hub_id: Option<HubId>,
    /// Raw signed announcement envelope
    pub announcement: Option<Vec<u8>>,
    /// Raw signed status envelope
    pub status: Option<Vec<u8>>,
}

fn import_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn apply_records(
    existing: Option<Hub>,
    announcement: Option<&[u8]>,
    status: Option<&[u8]>,
    scope: Scope,
) -> Result<(Hub, bool)> {
    let mut forward = false;
    let mut hub = existing;

    // The announcement goes first so a fresh hub has its identity data.
    if let Some(data) = announcement {
        let (applied, fresh) = apply_announcement(hub, data, scope)?;
        forward |= fresh;
        hub = Some(applied);
    }
    if let Some(data) = status {
        let (applied, fresh) = apply_status(hub, data, scope)?;
        forward |= fresh;
        hub = Some(applied);
    }

    Ok((hub.expect("at least one record was applied"), forward))
}

/// Import and verify hub records, returning the hub and whether the data
/// was new and should be forwarded.
///
/// The import is serialized process-wide, since the same hub is often
/// learned from several gossip channels at once. Re-importing identical
/// records is idempotent and yields `forward = false`.
pub fn import_and_verify_hub_info(
    store: &HubStore,
    map: &str,
    hub_id: Option<HubId>,
    announcement: Option<&[u8]>,
    status: Option<&[u8]>,
    scope: Scope,
) -> Result<(Hub, bool)> {
    let _guard = import_lock().lock();

    if announcement.is_none() && status.is_none() {
        return Err(Error::Internal("no announcement or status supplied".to_string()));
    }

    let load = |id: &HubId| {
        store
            .get_hub(map, id)
            .map_err(|err| Error::Internal(format!("store read failed: {err}")))
    };

    let existing = match hub_id {
        Some(id) => load(&id)?,
        None => None,
    };
    let (mut hub, mut forward) = apply_records(existing, announcement, status, scope)?;

    // When the caller did not name the hub, the records reveal the ID;
    // retry against the stored state so replay protection holds.
    if hub_id.is_none() {
        if let Some(stored) = load(&hub.id)? {
            (hub, forward) = apply_records(Some(stored), announcement, status, scope)?;
        }
    }

    if let Some(id) = hub_id {
        if hub.id != id {
            return Err(Error::Internal(format!(
                "hub mismatch: records describe {}, message claimed {}",
                hub.id, id
            )));
        }
    }

    store
        .put_hub(map, &hub)
        .map_err(|err| Error::Internal(format!("failed to persist hub: {err}")))?;
    if let Some(data) = announcement {
        if let Err(err) = store.put_raw_msg(map, &hub.id, "announcement", data) {
            warn!(%err, "failed to save raw announcement msg");
        }
    }
    if let Some(data) = status {
        if let Err(err) = store.put_raw_msg(map, &hub.id, "status", data) {
            warn!(%err, "failed to save raw status msg");
        }
    }

    Ok((hub, forward))
}

/// Send a gossip message through a crane's controller terminal.
pub async fn send_gossip(crane: &Crane, msg: &GossipMsg) -> Result<()> {
    let controller = crane
        .controller()
        .ok_or_else(|| Error::Stopping(format!("crane {} has no controller", crane.id())))?;
    let data = postcard::to_allocvec(msg)
        .map_err(|err| Error::Internal(format!("failed to encode gossip msg: {err}")))?;

    // One-shot: the peer acks by ending the op.
    let op = Arc::new(GossipSendOp { id: controller.allocate_op_id() });
    controller.op_init(op, data).await?;
    controller.flush().await;
    Ok(())
}

/// Forward a gossip message to all assigned cranes except the source.
pub fn forward_gossip(msg: GossipMsg, except_crane_id: Option<String>) {
    for (hub_id, crane) in registry::all_assigned_cranes() {
        if except_crane_id.as_deref() == Some(crane.id()) || crane.is_stopping() {
            continue;
        }
        let msg = msg.clone();
        tokio::spawn(async move {
            if let Err(err) = send_gossip(&crane, &msg).await {
                debug!(hub = %hub_id, %err, "gossip forward failed");
            }
        });
    }
}

/// Register the receiving side in the op-type registry.
pub fn register_gossip_op() {
    register_op_type(OpParams {
        type_name: GOSSIP_OP_TYPE,
        requires: TerminalPermission::IS_CRANE_CONTROLLER,
        start: Arc::new(|terminal, op_id, data| {
            let msg: GossipMsg = postcard::from_bytes(&data)
                .map_err(|err| Error::MalformedData(format!("invalid gossip msg: {err}")))?;

            let crane = terminal
                .host()
                .and_then(|host| host.downcast::<Crane>().ok())
                .ok_or_else(|| Error::Internal("gossip op without crane host".to_string()))?;
            let ctx = crane.gossip_context().ok_or_else(|| {
                Error::IncorrectUsage("crane does not relay gossip".to_string())
            })?;

            let crane_id = crane.id().to_string();
            let terminal2 = terminal.clone();
            tokio::task::spawn_blocking(move || {
                let import = || {
                    import_and_verify_hub_info(
                        &ctx.store,
                        &ctx.map,
                        msg.hub_id,
                        msg.announcement.as_deref(),
                        msg.status.as_deref(),
                        ctx.scope,
                    )
                };
                let mut result = import();
                if matches!(result, Err(Error::TryAgainLater(_))) {
                    // Temporary validation failures get one retry after a
                    // short backoff.
                    std::thread::sleep(std::time::Duration::from_secs(1));
                    result = import();
                }
                match result {
                    Ok((hub, true)) => {
                        debug!(hub = %hub, "gossip imported, forwarding");
                        forward_gossip(msg, Some(crane_id));
                    }
                    Ok((_, false)) => {}
                    // Outdated records are normal gossip churn.
                    Err(Error::OldData(reason)) => {
                        debug!(reason, "dropping outdated gossip");
                    }
                    Err(err) => {
                        warn!(%err, "dropping invalid gossip");
                    }
                }
                // Ack by ending the op.
                tokio::spawn(async move {
                    terminal2.op_end(op_id, None).await;
                });
            });

            Ok(Arc::new(GossipReceiveOp { id: op_id }) as Arc<dyn Operation>)
        }),
    });
}

/// Sender side of a one-shot gossip exchange
struct GossipSendOp {
    id: u32,
}

impl Operation for GossipSendOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        GOSSIP_OP_TYPE
    }

    fn deliver(&self, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}
}

/// Receiver side of a one-shot gossip exchange
struct GossipReceiveOp {
    id: u32,
}

impl Operation for GossipReceiveOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        GOSSIP_OP_TYPE
    }

    fn deliver(&self, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_hub::records::{export_announcement, export_status, Announcement, Status};
    use flotilla_hub::Identity;
    use tempfile::tempdir;

    fn records_for(identity: &Identity, timestamp: u64) -> (Vec<u8>, Vec<u8>) {
        let announcement = Announcement {
            id: identity.hub_id(),
            timestamp,
            name: "gossip-test".to_string(),
            transports: vec!["tcp:17".to_string()],
            ipv4: Some(std::net::Ipv4Addr::new(192, 0, 2, 7)),
            ipv6: None,
            exchange_keys: vec![identity.exchange_public()],
        };
        let status = Status {
            id: identity.hub_id(),
            timestamp,
            version: "0.3.0".to_string(),
            load: 20,
            lanes: vec![],
            flags: vec![],
        };
        (
            export_announcement(identity, &announcement).unwrap(),
            export_status(identity, &status).unwrap(),
        )
    }

    #[test]
    fn import_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();
        let identity = Identity::from_seed(&[5; 32]);
        let (announcement, status) = records_for(&identity, 1000);

        let (hub, forward) = import_and_verify_hub_info(
            &store,
            "main",
            Some(identity.hub_id()),
            Some(&announcement),
            Some(&status),
            Scope::Test,
        )
        .unwrap();
        assert!(forward);
        assert_eq!(hub.id, identity.hub_id());

        // Same records again: same hub, no forwarding.
        let (hub2, forward2) = import_and_verify_hub_info(
            &store,
            "main",
            Some(identity.hub_id()),
            Some(&announcement),
            Some(&status),
            Scope::Test,
        )
        .unwrap();
        assert_eq!(hub2.id, hub.id);
        assert!(!forward2);
    }

    #[test]
    fn old_status_is_rejected() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();
        let identity = Identity::from_seed(&[6; 32]);

        let (announcement, status) = records_for(&identity, 2000);
        import_and_verify_hub_info(
            &store,
            "main",
            Some(identity.hub_id()),
            Some(&announcement),
            Some(&status),
            Scope::Test,
        )
        .unwrap();

        let (_, old_status) = records_for(&identity, 1999);
        let err = import_and_verify_hub_info(
            &store,
            "main",
            Some(identity.hub_id()),
            None,
            Some(&old_status),
            Scope::Test,
        )
        .unwrap_err();
        assert!(matches!(err, Error::OldData(_)));
    }

    #[test]
    fn mismatching_hub_id_is_rejected() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();
        let identity = Identity::from_seed(&[7; 32]);
        let other = Identity::from_seed(&[8; 32]);
        let (announcement, _) = records_for(&identity, 1000);

        let err = import_and_verify_hub_info(
            &store,
            "main",
            Some(other.hub_id()),
            Some(&announcement),
            None,
            Scope::Test,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn raw_messages_are_persisted() {
        let dir = tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();
        let identity = Identity::from_seed(&[9; 32]);
        let (announcement, status) = records_for(&identity, 1000);

        import_and_verify_hub_info(
            &store,
            "main",
            None,
            Some(&announcement),
            Some(&status),
            Scope::Test,
        )
        .unwrap();

        let id = identity.hub_id();
        assert_eq!(
            store.get_raw_msg("main", &id, "announcement").unwrap().unwrap(),
            announcement
        );
        assert_eq!(store.get_raw_msg("main", &id, "status").unwrap().unwrap(), status);
    }
}
