//! The map: the authoritative local view of the hub graph
//!
//! One reader-writer lock guards the whole graph. Pins and lanes mutate
//! only under the write lock; the router works on a read view. Lanes are
//! shared pairs looked up by peer ID, never owning pointers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use flotilla_core::{Error, Result};
use flotilla_hub::records::{now_millis, AdvertisedLane};
use flotilla_hub::{BootstrapEntry, Hub, HubId};

use crate::cost::{hub_cost, lane_cost};
use crate::geo::{GeoLocation, GeoLocator};
use crate::pin::{Lane, Pin, PinState, DEFAULT_FAILING_DURATION};

/// Floor applied when one lane endpoint has no latency measurement
pub const MIN_UNCONFIRMED_LATENCY: Duration = Duration::from_millis(10);

/// Ceiling applied when one lane endpoint has no capacity measurement
pub const MAX_UNCONFIRMED_CAPACITY: u64 = 100_000_000;

pub(crate) struct MapInner {
    pub(crate) all: HashMap<HubId, Pin>,
    pub(crate) home: Option<HubId>,
    pub(crate) home_location: Option<GeoLocation>,
    trusted: HashSet<HubId>,
    disregarded: HashSet<HubId>,
}

type PinChangeHook = Box<dyn Fn(&Pin) + Send + Sync>;

/// The hub graph
pub struct Map {
    name: String,
    measuring_enabled: bool,
    geo: Arc<dyn GeoLocator>,
    inner: RwLock<MapInner>,
    pin_hooks: parking_lot::Mutex<Vec<PinChangeHook>>,
}

impl Map {
    /// Create an empty map.
    pub fn new(name: impl Into<String>, geo: Arc<dyn GeoLocator>, measuring_enabled: bool) -> Self {
        Self {
            name: name.into(),
            measuring_enabled,
            geo,
            inner: RwLock::new(MapInner {
                all: HashMap::new(),
                home: None,
                home_location: None,
                trusted: HashSet::new(),
                disregarded: HashSet::new(),
            }),
            pin_hooks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to pin changes; fired after a pin was updated.
    pub fn register_pin_change_hook(&self, hook: impl Fn(&Pin) + Send + Sync + 'static) {
        self.pin_hooks.lock().push(Box::new(hook));
    }

    fn push_pin_changes(&self, id: &HubId) {
        let hooks = self.pin_hooks.lock();
        if hooks.is_empty() {
            return;
        }
        if let Some(pin) = self.inner.read().all.get(id) {
            for hook in hooks.iter() {
                hook(pin);
            }
        }
    }

    /// The map's name, used as its store prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the map has no pins.
    pub fn is_empty(&self) -> bool {
        self.inner.read().all.is_empty()
    }

    /// Number of pins on the map.
    pub fn pin_count(&self) -> usize {
        self.inner.read().all.len()
    }

    /// Snapshot of a pin.
    pub fn pin(&self, id: &HubId) -> Option<Pin> {
        self.inner.read().all.get(id).cloned()
    }

    /// The current home hub.
    pub fn home(&self) -> Option<HubId> {
        self.inner.read().home
    }

    pub(crate) fn read_inner(&self) -> RwLockReadGuard<'_, MapInner> {
        self.inner.read()
    }

    /// Declare `id` the home hub and recompute reachability from it.
    pub fn set_home(&self, id: HubId) -> bool {
        let mut inner = self.inner.write();
        if !inner.all.contains_key(&id) {
            return false;
        }

        for pin in inner.all.values_mut() {
            pin.remove_states(PinState::HOME);
        }
        let pin = inner.all.get_mut(&id).expect("checked above");
        pin.add_states(PinState::HOME);
        let location = pin.location_v4.clone().or_else(|| pin.location_v6.clone());

        inner.home = Some(id);
        inner.home_location = location;
        recalculate_reachability(&mut inner);
        info!(map = %self.name, home = %id, "home hub set");
        true
    }

    /// Replace the intel lists and refresh the derived state bits.
    pub fn set_intel(&self, trusted: Vec<HubId>, disregarded: Vec<HubId>) {
        let mut inner = self.inner.write();
        inner.trusted = trusted.into_iter().collect();
        inner.disregarded = disregarded.into_iter().collect();

        let trusted = inner.trusted.clone();
        let disregarded = inner.disregarded.clone();
        for (id, pin) in inner.all.iter_mut() {
            pin.set_states(PinState::TRUSTED, trusted.contains(id));
            pin.set_states(PinState::DISREGARD, disregarded.contains(id));
        }
    }

    /// Update a hub on the map: refresh pin data, states and lanes.
    ///
    /// Hubs need both an announcement and a status to appear on the map.
    pub fn update_hub(&self, hub: Hub) {
        let Some(announcement) = hub.announcement.clone() else { return };
        let Some(status) = hub.status.clone() else { return };
        let id = hub.id;

        let location_v4 = announcement.ipv4.and_then(|ip| self.geo.locate(IpAddr::V4(ip)));
        let location_v6 = announcement.ipv6.and_then(|ip| self.geo.locate(IpAddr::V6(ip)));

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        // 1. Pin data.
        let pin = inner.all.entry(id).or_insert_with(|| Pin::new(hub.clone()));
        pin.hub = hub;
        pin.location_v4 = location_v4;
        pin.location_v6 = location_v6;
        pin.cost = hub_cost(status.load);

        if self.measuring_enabled {
            let measurements = pin.hub.measurements.clone();
            let latency = measurements.latency().unwrap_or_default();
            let capacity = measurements.capacity().unwrap_or_default();
            measurements.set_calculated_cost(lane_cost(latency, capacity));

            if let Some(home_location) = &inner.home_location {
                if let Some(location) =
                    pin.location_v4.as_ref().or(pin.location_v6.as_ref())
                {
                    measurements.set_geo_proximity(home_location.estimate_proximity(location));
                }
            }
        }

        // 2. Pin states.
        pin.update_status_states(now_millis());
        let trusted = inner.trusted.contains(&id);
        let disregarded = inner.disregarded.contains(&id);
        let pin = inner.all.get_mut(&id).expect("just inserted");
        pin.set_states(PinState::TRUSTED, trusted);
        pin.set_states(PinState::DISREGARD, disregarded);

        // 3. Lanes: mark all inactive, reactivate those advertised by both
        // peers, then drop the leftovers.
        for lane in pin.lanes.values_mut() {
            lane.active = false;
        }
        for advertised in &status.lanes {
            if advertised.peer == id {
                continue;
            }
            update_lane(&mut inner.all, id, advertised);
        }

        let inactive: Vec<HubId> = inner.all[&id]
            .lanes
            .iter()
            .filter(|(_, lane)| !lane.active)
            .map(|(peer, _)| *peer)
            .collect();
        let removed_lanes = !inactive.is_empty();
        for peer_id in inactive {
            inner.all.get_mut(&id).expect("exists").lanes.remove(&peer_id);
            if let Some(peer) = inner.all.get_mut(&peer_id) {
                peer.lanes.remove(&id);
            }
        }
        if removed_lanes {
            recalculate_reachability(inner);
        }

        // 4. States that depend on other pins.
        update_superseded(inner, id);
        drop(guard);

        self.push_pin_changes(&id);
    }

    /// Remove a hub and its lanes from the map.
    pub fn remove_hub(&self, id: &HubId) {
        let mut inner = self.inner.write();
        let Some(pin) = inner.all.remove(id) else { return };

        for peer_id in pin.lanes.keys() {
            if let Some(peer) = inner.all.get_mut(peer_id) {
                peer.lanes.remove(id);
            }
        }
        if inner.home == Some(*id) {
            inner.home = None;
            inner.home_location = None;
        }
        recalculate_reachability(&mut inner);
        debug!(map = %self.name, hub = %id, "removed hub");
    }

    /// Add bootstrap hubs; they are never garbage collected.
    pub fn add_bootstrap_hubs(&self, entries: &[String]) -> Result<()> {
        let (parsed, errors) = BootstrapEntry::parse_all(entries);
        for err in &errors {
            warn!(map = %self.name, %err, "invalid bootstrap entry");
        }
        if parsed.is_empty() {
            return match errors.into_iter().next() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        for entry in parsed {
            self.add_bootstrap_hub(entry)?;
        }
        Ok(())
    }

    fn add_bootstrap_hub(&self, entry: BootstrapEntry) -> Result<()> {
        use flotilla_hub::records::{Announcement, Status};

        let mut inner = self.inner.write();
        let hub = match inner.all.get(&entry.hub_id) {
            Some(pin) => {
                // Existing hub: the entry must not contradict its address.
                let announcement = pin.hub.announcement.as_ref();
                let matches = match entry.ip {
                    IpAddr::V4(ip) => {
                        announcement.and_then(|a| a.ipv4).map_or(true, |known| known == ip)
                    }
                    IpAddr::V6(ip) => {
                        announcement.and_then(|a| a.ipv6).map_or(true, |known| known == ip)
                    }
                };
                if !matches {
                    return Err(Error::MalformedData(format!(
                        "bootstrap entry for {} has mismatching IP {}",
                        entry.hub_id, entry.ip
                    )));
                }
                return Ok(());
            }
            None => {
                let mut hub = Hub::new(entry.hub_id);
                hub.announcement = Some(Announcement {
                    id: entry.hub_id,
                    timestamp: 0,
                    name: String::new(),
                    transports: vec![entry.transport.clone()],
                    ipv4: match entry.ip {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    },
                    ipv6: match entry.ip {
                        IpAddr::V6(ip) => Some(ip),
                        IpAddr::V4(_) => None,
                    },
                    exchange_keys: vec![],
                });
                hub.status = Some(Status {
                    id: entry.hub_id,
                    timestamp: 0,
                    version: String::new(),
                    load: 0,
                    lanes: vec![],
                    flags: vec![],
                });
                hub
            }
        };

        let id = hub.id;
        inner.all.insert(id, Pin::new(hub));
        info!(map = %self.name, hub = %id, "added bootstrap hub");
        Ok(())
    }

    /// Mark a pin failing, e.g. after a failed connection attempt.
    pub fn mark_pin_failing(&self, id: &HubId, duration: Option<Duration>) {
        let mut inner = self.inner.write();
        if let Some(pin) = inner.all.get_mut(id) {
            pin.mark_failing(Instant::now(), duration.unwrap_or(DEFAULT_FAILING_DURATION));
        }
    }

    /// Clear the failing state on all pins.
    pub fn reset_failing_states(&self) {
        let mut inner = self.inner.write();
        for pin in inner.all.values_mut() {
            pin.reset_failing();
        }
    }

    /// Clear failing states whose expiry passed.
    pub fn update_failing_states(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        for pin in inner.all.values_mut() {
            if pin.state.contains(PinState::FAILING) && !pin.is_failing(now) {
                pin.reset_failing();
            }
        }
    }

    /// Refresh derived states and garbage-collect obsolete hubs.
    ///
    /// Returns the IDs of removed hubs so the caller can delete their
    /// records from the store.
    pub fn update_states(&self) -> Vec<HubId> {
        let now_ms = now_millis();
        let mut inner = self.inner.write();

        for pin in inner.all.values_mut() {
            pin.update_status_states(now_ms);
        }

        let to_delete: Vec<HubId> = inner
            .all
            .values()
            .filter(|pin| {
                !pin.state.intersects(PinState::ACTIVE | PinState::HOME)
                    && pin.hub.obsolete(now_ms)
            })
            .map(Pin::id)
            .collect();

        for id in &to_delete {
            if let Some(pin) = inner.all.remove(id) {
                info!(map = %self.name, hub = %pin.hub, "deleting obsolete hub");
                for peer_id in pin.lanes.keys() {
                    if let Some(peer) = inner.all.get_mut(peer_id) {
                        peer.lanes.remove(id);
                    }
                }
            }
        }

        recalculate_reachability(&mut inner);
        to_delete
    }
}

/// Reconcile one advertised lane; inserts the combined lane at both
/// endpoints when both sides advertise each other.
fn update_lane(all: &mut HashMap<HubId, Pin>, id: HubId, advertised: &AdvertisedLane) {
    let peer_id = advertised.peer;
    let Some(peer) = all.get(&peer_id) else {
        // Wait for the peer to be added to the map.
        return;
    };

    let peer_advertised = peer
        .hub
        .status
        .as_ref()
        .and_then(|status| status.lanes.iter().find(|lane| lane.peer == id))
        .cloned();
    let Some(peer_advertised) = peer_advertised else {
        // The peer does not advertise a lane back; abandon it for now.
        all.get_mut(&id).expect("caller's pin exists").lanes.remove(&peer_id);
        return;
    };

    // Combined latency: the greater value, with a floor when unconfirmed.
    let mut latency_ms = advertised.latency_ms.max(peer_advertised.latency_ms);
    let unconfirmed_latency = advertised.latency_ms == 0 || peer_advertised.latency_ms == 0;
    if unconfirmed_latency && u64::from(latency_ms) < MIN_UNCONFIRMED_LATENCY.as_millis() as u64 {
        latency_ms = MIN_UNCONFIRMED_LATENCY.as_millis() as u32;
    }

    // Combined capacity: the lesser existing value, with a ceiling when
    // unconfirmed.
    let mut capacity = advertised.capacity_bps;
    if capacity == 0
        || (peer_advertised.capacity_bps > 0 && peer_advertised.capacity_bps < capacity)
    {
        capacity = peer_advertised.capacity_bps;
    }
    let unconfirmed_capacity = advertised.capacity_bps == 0 || peer_advertised.capacity_bps == 0;
    if unconfirmed_capacity && capacity > MAX_UNCONFIRMED_CAPACITY {
        capacity = MAX_UNCONFIRMED_CAPACITY;
    }

    let latency = Duration::from_millis(u64::from(latency_ms));
    let cost = lane_cost(latency, capacity);

    let (pin_reachable, pin_hops) = {
        let pin = &all[&id];
        (pin.state.contains(PinState::REACHABLE), pin.hop_distance)
    };
    let (peer_reachable, peer_hops) = {
        let peer = &all[&peer_id];
        (peer.state.contains(PinState::REACHABLE), peer.hop_distance)
    };

    all.get_mut(&id).expect("exists").lanes.insert(
        peer_id,
        Lane { peer: peer_id, latency, capacity_bps: capacity, cost, active: true },
    );
    all.get_mut(&peer_id).expect("exists").lanes.insert(
        id,
        Lane { peer: id, latency, capacity_bps: capacity, cost, active: true },
    );

    if pin_reachable {
        all.get_mut(&peer_id).expect("exists").mark_reachable(pin_hops + 1);
    }
    if peer_reachable {
        all.get_mut(&id).expect("exists").mark_reachable(peer_hops + 1);
    }
}

/// Full reachability recomputation: BFS over active lanes from home.
fn recalculate_reachability(inner: &mut MapInner) {
    for pin in inner.all.values_mut() {
        pin.mark_unreachable();
    }
    let Some(home) = inner.home else { return };
    let Some(home_pin) = inner.all.get_mut(&home) else { return };

    home_pin.mark_reachable(1);
    let mut queue = VecDeque::from([home]);
    while let Some(current) = queue.pop_front() {
        let (hops, neighbors): (u32, Vec<HubId>) = {
            let pin = &inner.all[&current];
            (
                pin.hop_distance,
                pin.lanes
                    .iter()
                    .filter(|(_, lane)| lane.active)
                    .map(|(peer, _)| *peer)
                    .collect(),
            )
        };
        for neighbor in neighbors {
            if let Some(peer) = inner.all.get_mut(&neighbor) {
                if !peer.state.contains(PinState::REACHABLE) {
                    peer.mark_reachable(hops + 1);
                    queue.push_back(neighbor);
                }
            }
        }
    }
}

/// A hub is superseded when another hub at the same address carries a
/// newer announcement.
fn update_superseded(inner: &mut MapInner, id: HubId) {
    let Some(ipv4) = inner
        .all
        .get(&id)
        .and_then(|pin| pin.hub.announcement.as_ref())
        .and_then(|announcement| announcement.ipv4)
    else {
        return;
    };

    let mut sharing: Vec<(HubId, u64)> = inner
        .all
        .values()
        .filter_map(|pin| {
            let announcement = pin.hub.announcement.as_ref()?;
            (announcement.ipv4 == Some(ipv4)).then_some((pin.id(), announcement.timestamp))
        })
        .collect();
    if sharing.len() < 2 {
        if let Some(pin) = inner.all.get_mut(&id) {
            pin.remove_states(PinState::SUPERSEDED);
        }
        return;
    }

    sharing.sort_by_key(|(_, timestamp)| std::cmp::Reverse(*timestamp));
    let newest = sharing[0].0;
    for (other, _) in sharing {
        if let Some(pin) = inner.all.get_mut(&other) {
            pin.set_states(PinState::SUPERSEDED, other != newest);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geo::StaticGeoLocator;
    use flotilla_hub::records::{Announcement, Status};
    use flotilla_hub::Identity;

    pub(crate) fn test_hub(seed: u8, lanes: Vec<AdvertisedLane>) -> Hub {
        let identity = Identity::from_seed(&[seed; 32]);
        let mut hub = Hub::new(identity.hub_id());
        hub.announcement = Some(Announcement {
            id: hub.id,
            timestamp: 1000,
            name: format!("hub-{seed}"),
            transports: vec!["tcp:17".to_string()],
            ipv4: Some(std::net::Ipv4Addr::new(192, 0, 2, seed)),
            ipv6: None,
            exchange_keys: vec![identity.exchange_public()],
        });
        hub.status = Some(Status {
            id: hub.id,
            timestamp: now_millis(),
            version: "0.3.0".to_string(),
            load: 10,
            lanes,
            flags: vec![],
        });
        hub
    }

    pub(crate) fn lane_to(hub: &Hub, latency_ms: u32, capacity_bps: u64) -> AdvertisedLane {
        AdvertisedLane { peer: hub.id, latency_ms, capacity_bps }
    }

    fn test_map() -> Map {
        Map::new("test", Arc::new(StaticGeoLocator::new()), false)
    }

    #[test]
    fn lanes_need_both_sides() {
        let map = test_map();

        let hub_b = test_hub(2, vec![]);
        let hub_a = test_hub(1, vec![lane_to(&hub_b, 20, 100_000_000)]);

        // Only A advertises: no lane yet.
        map.update_hub(hub_b.clone());
        map.update_hub(hub_a.clone());
        assert!(map.pin(&hub_a.id).unwrap().lanes.is_empty());

        // B advertises back: the lane appears on both pins.
        let hub_b = test_hub(2, vec![lane_to(&hub_a, 30, 50_000_000)]);
        map.update_hub(hub_b.clone());
        let pin_a = map.pin(&hub_a.id).unwrap();
        let pin_b = map.pin(&hub_b.id).unwrap();

        let lane_ab = pin_a.lanes.get(&hub_b.id).unwrap();
        let lane_ba = pin_b.lanes.get(&hub_a.id).unwrap();

        // Combined: latency is the max, capacity the min.
        assert_eq!(lane_ab.latency, Duration::from_millis(30));
        assert_eq!(lane_ab.capacity_bps, 50_000_000);
        assert_eq!(lane_ba.latency, lane_ab.latency);
        assert_eq!(lane_ba.capacity_bps, lane_ab.capacity_bps);
    }

    #[test]
    fn unconfirmed_lane_values_are_clamped() {
        let map = test_map();

        let hub_b = test_hub(2, vec![]);
        let hub_a = test_hub(1, vec![lane_to(&hub_b, 0, 0)]);
        map.update_hub(hub_a.clone());
        // B has no measurements either.
        let hub_b = test_hub(2, vec![AdvertisedLane {
            peer: hub_a.id,
            latency_ms: 0,
            capacity_bps: 1_000_000_000,
        }]);
        map.update_hub(hub_b.clone());
        map.update_hub(hub_a.clone());

        let lane = map.pin(&hub_a.id).unwrap().lanes.get(&hub_b.id).cloned().unwrap();
        assert_eq!(lane.latency, MIN_UNCONFIRMED_LATENCY);
        assert_eq!(lane.capacity_bps, MAX_UNCONFIRMED_CAPACITY);
    }

    #[test]
    fn reachability_follows_active_lanes() {
        let map = test_map();

        // home - a - b, with c disconnected.
        let hub_a = test_hub(2, vec![]);
        let hub_b = test_hub(3, vec![]);
        let hub_c = test_hub(4, vec![]);

        let hub_home = test_hub(1, vec![lane_to(&hub_a, 20, 0)]);
        let hub_a = test_hub(2, vec![lane_to(&hub_home, 20, 0), lane_to(&hub_b, 20, 0)]);
        let hub_b = test_hub(3, vec![lane_to(&hub_a, 20, 0)]);

        for hub in [&hub_home, &hub_a, &hub_b, &hub_c] {
            map.update_hub(hub.clone());
        }
        // Second pass so every pin sees its peers.
        for hub in [&hub_home, &hub_a, &hub_b] {
            map.update_hub(hub.clone());
        }
        assert!(map.set_home(hub_home.id));

        let pin_b = map.pin(&hub_b.id).unwrap();
        assert!(pin_b.state.contains(PinState::REACHABLE));
        assert_eq!(pin_b.hop_distance, 3);
        assert!(!map.pin(&hub_c.id).unwrap().state.contains(PinState::REACHABLE));

        // Cutting a -> b severs b.
        let hub_a = test_hub(2, vec![lane_to(&hub_home, 20, 0)]);
        map.update_hub(hub_a);
        assert!(!map.pin(&hub_b.id).unwrap().state.contains(PinState::REACHABLE));
    }

    #[test]
    fn bootstrap_hubs_survive_gc() {
        let map = test_map();
        let id = Identity::from_seed(&[9; 32]).hub_id();
        let entry = format!("tcp://{}@192.0.2.9:17", id.to_hex());

        map.add_bootstrap_hubs(&[entry]).unwrap();
        assert_eq!(map.pin_count(), 1);

        // Not active, but first_seen is fresh, so GC keeps it.
        let removed = map.update_states();
        assert!(removed.is_empty());
        assert_eq!(map.pin_count(), 1);

        // A conflicting IP for the same hub is rejected.
        let conflict = format!("tcp://{}@192.0.2.200:17", id.to_hex());
        assert!(map.add_bootstrap_hubs(&[conflict]).is_err());
    }

    #[test]
    fn obsolete_hubs_are_collected() {
        let map = test_map();
        let mut hub = test_hub(5, vec![]);
        hub.status.as_mut().unwrap().timestamp = 1;
        hub.first_seen = 1;
        map.update_hub(hub.clone());

        let removed = map.update_states();
        assert_eq!(removed, vec![hub.id]);
        assert!(map.pin(&hub.id).is_none());
    }

    #[test]
    fn store_hooks_keep_the_map_in_sync() {
        use flotilla_hub::{HubStore, HubUpdate};

        let dir = tempfile::tempdir().unwrap();
        let store = HubStore::open(dir.path()).unwrap();
        let map = Arc::new(test_map());

        let map2 = map.clone();
        store.register_update_hook(move |map_name, update| {
            if map_name != map2.name() {
                return;
            }
            match update {
                HubUpdate::Put(hub) => map2.update_hub(hub.clone()),
                HubUpdate::Removed(id) => map2.remove_hub(id),
            }
        });

        let hub = test_hub(8, vec![]);
        store.put_hub("test", &hub).unwrap();
        assert!(map.pin(&hub.id).is_some());

        store.remove_hub("test", &hub.id).unwrap();
        assert!(map.pin(&hub.id).is_none());
    }

    #[test]
    fn measuring_derives_cost_and_proximity() {
        use crate::geo::GeoLocation;

        let geo = Arc::new(StaticGeoLocator::new());
        geo.insert(
            "192.0.2.1".parse().unwrap(),
            GeoLocation { country: "DE".to_string(), latitude: 52.52, longitude: 13.40 },
        );
        geo.insert(
            "192.0.2.2".parse().unwrap(),
            GeoLocation { country: "PT".to_string(), latitude: 38.72, longitude: -9.14 },
        );
        let map = Map::new("measured", geo, true);

        let home = test_hub(1, vec![]);
        let other = test_hub(2, vec![]);
        map.update_hub(home.clone());
        assert!(map.set_home(home.id));

        let other_measurements = other.measurements.clone();
        other_measurements.set_latency(Duration::from_millis(25));
        other_measurements.set_capacity(100_000_000);
        map.update_hub(other.clone());

        assert_eq!(
            other_measurements.calculated_cost(),
            Some(lane_cost(Duration::from_millis(25), 100_000_000))
        );
        let proximity = other_measurements.geo_proximity().expect("proximity set");
        assert!(proximity > 80.0 && proximity < 100.0, "got {proximity}");
    }

    #[test]
    fn pin_change_hooks_fire() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let map = test_map();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        map.register_pin_change_hook(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        map.update_hub(test_hub(9, vec![]));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn superseded_by_newer_hub_at_same_address() {
        let map = test_map();

        let mut old = test_hub(6, vec![]);
        let mut new = test_hub(7, vec![]);
        // Same IPv4, different identities, the newer announcement wins.
        let shared_ip = std::net::Ipv4Addr::new(192, 0, 2, 66);
        old.announcement.as_mut().unwrap().ipv4 = Some(shared_ip);
        old.announcement.as_mut().unwrap().timestamp = 1000;
        new.announcement.as_mut().unwrap().ipv4 = Some(shared_ip);
        new.announcement.as_mut().unwrap().timestamp = 2000;

        map.update_hub(old.clone());
        map.update_hub(new.clone());

        assert!(map.pin(&old.id).unwrap().state.contains(PinState::SUPERSEDED));
        assert!(!map.pin(&new.id).unwrap().state.contains(PinState::SUPERSEDED));
    }
}
