//! Process-wide crane registry and update hook
//!
//! The registry maps hub IDs to the crane assigned to them, which the
//! expand operation and gossip forwarding use to reach peers. The update
//! hook lets the layer above (the navigator integration) react to crane
//! lifecycle changes.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::error;

use flotilla_hub::HubId;

use crate::crane::Crane;

fn assigned() -> &'static RwLock<HashMap<HubId, Arc<Crane>>> {
    static ASSIGNED: OnceLock<RwLock<HashMap<HubId, Arc<Crane>>>> = OnceLock::new();
    ASSIGNED.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Assign a crane to a hub, replacing any previous assignment.
pub fn assign_crane(hub_id: HubId, crane: Arc<Crane>) {
    assigned().write().insert(hub_id, crane);
}

/// Remove an assignment, but only if it still points at `crane_id`.
pub fn unassign_crane(hub_id: &HubId, crane_id: &str) {
    let mut map = assigned().write();
    if map.get(hub_id).is_some_and(|crane| crane.id() == crane_id) {
        map.remove(hub_id);
    }
}

/// Get the crane assigned to a hub.
pub fn get_assigned_crane(hub_id: &HubId) -> Option<Arc<Crane>> {
    assigned().read().get(hub_id).cloned()
}

/// All current assignments.
pub fn all_assigned_cranes() -> Vec<(HubId, Arc<Crane>)> {
    assigned()
        .read()
        .iter()
        .map(|(id, crane)| (*id, crane.clone()))
        .collect()
}

type CraneUpdateHook = Box<dyn Fn(&Crane) + Send + Sync>;

fn update_hook() -> &'static Mutex<Option<CraneUpdateHook>> {
    static HOOK: OnceLock<Mutex<Option<CraneUpdateHook>>> = OnceLock::new();
    HOOK.get_or_init(|| Mutex::new(None))
}

/// Register the hook receiving crane updates. Only one may be registered.
pub fn register_crane_update_hook(hook: impl Fn(&Crane) + Send + Sync + 'static) {
    let mut slot = update_hook().lock();
    if slot.is_none() {
        *slot = Some(Box::new(hook));
    } else {
        error!("crane update hook already registered");
    }
}

/// Reset the hook for receiving crane updates.
pub fn reset_crane_update_hook() {
    *update_hook().lock() = None;
}

/// Invoke the registered crane update hook.
pub fn notify_update(crane: &Crane) {
    let slot = update_hook().lock();
    if let Some(hook) = slot.as_ref() {
        hook(crane);
    }
}
