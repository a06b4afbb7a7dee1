//! Pins and lanes: the map's view of a hub

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use flotilla_hub::records::StatusFlag;
use flotilla_hub::{Hub, HubId};

use crate::geo::GeoLocation;

/// Status records older than this no longer count as active
pub const ACTIVE_STATUS_WINDOW: Duration = Duration::from_secs(3 * 60 * 60);

/// How long a pin stays failing after being marked
pub const DEFAULT_FAILING_DURATION: Duration = Duration::from_secs(15 * 60);

bitflags! {
    /// State bits of a pin
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PinState: u16 {
        /// Records failed validation
        const INVALID = 1 << 0;
        /// The hub announced itself offline
        const OFFLINE = 1 << 1;
        /// A path of active lanes from home exists
        const REACHABLE = 1 << 2;
        /// This pin is the home hub
        const HOME = 1 << 3;
        /// The hub has a recent status
        const ACTIVE = 1 << 4;
        /// Recent connection attempts failed
        const FAILING = 1 << 5;
        /// The hub reports connectivity issues
        const CONNECTIVITY_ISSUES = 1 << 6;
        /// A newer hub at the same address supersedes this one
        const SUPERSEDED = 1 << 7;
        /// Marked trusted by intel
        const TRUSTED = 1 << 8;
        /// Excluded from routing by intel
        const DISREGARD = 1 << 9;
    }
}

impl PinState {
    /// States that exclude a pin from route exploration.
    pub fn unusable() -> Self {
        Self::INVALID | Self::OFFLINE | Self::FAILING | Self::SUPERSEDED | Self::DISREGARD
    }
}

/// A directed, measured edge to a peer pin
#[derive(Clone, Debug)]
pub struct Lane {
    /// The peer at the far end, looked up by ID, never owned
    pub peer: HubId,
    /// Combined latency: the greater of both advertisements
    pub latency: Duration,
    /// Combined capacity: the lesser of both advertisements
    pub capacity_bps: u64,
    /// Computed lane cost
    pub cost: f32,
    /// Reconciliation mark; inactive lanes are dropped
    pub active: bool,
}

/// A hub's node on the map
#[derive(Clone, Debug)]
pub struct Pin {
    /// The hub record
    pub hub: Hub,
    /// State bits
    pub state: PinState,
    /// Location of the advertised IPv4 address
    pub location_v4: Option<GeoLocation>,
    /// Location of the advertised IPv6 address
    pub location_v6: Option<GeoLocation>,
    /// Cost of routing through this hub, from its load
    pub cost: f32,
    /// Hops from the home pin, meaningful when reachable
    pub hop_distance: u32,
    /// Outbound lanes by peer ID
    pub lanes: HashMap<HubId, Lane>,
    /// When the failing state expires
    pub failing_until: Option<Instant>,
}

impl Pin {
    /// Create a pin for a hub.
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            state: PinState::empty(),
            location_v4: None,
            location_v6: None,
            cost: 0.0,
            hop_distance: 0,
            lanes: HashMap::new(),
            failing_until: None,
        }
    }

    /// The pin's hub ID.
    pub fn id(&self) -> HubId {
        self.hub.id
    }

    /// Add state bits.
    pub fn add_states(&mut self, states: PinState) {
        self.state |= states;
    }

    /// Remove state bits.
    pub fn remove_states(&mut self, states: PinState) {
        self.state &= !states;
    }

    /// Set or clear state bits in one call.
    pub fn set_states(&mut self, states: PinState, on: bool) {
        if on {
            self.add_states(states);
        } else {
            self.remove_states(states);
        }
    }

    /// Whether the pin may appear on routes at all.
    pub fn is_regarded(&self) -> bool {
        !self.state.intersects(PinState::unusable())
    }

    /// Mark the pin failing for `duration`.
    pub fn mark_failing(&mut self, now: Instant, duration: Duration) {
        self.add_states(PinState::FAILING);
        self.failing_until = Some(now + duration);
    }

    /// Whether the failing mark is still in force.
    pub fn is_failing(&self, now: Instant) -> bool {
        match self.failing_until {
            Some(until) => now < until,
            None => false,
        }
    }

    /// Clear the failing mark.
    pub fn reset_failing(&mut self) {
        self.remove_states(PinState::FAILING);
        self.failing_until = None;
    }

    /// Recompute the state bits derived from the hub's status.
    pub fn update_status_states(&mut self, now_ms: u64) {
        let Some(status) = self.hub.status.as_ref() else {
            self.remove_states(PinState::ACTIVE);
            return;
        };

        let is_offline = status.is_offline();
        let has_net_error = status.has_flag(StatusFlag::NetError);
        let fresh = now_ms.saturating_sub(status.timestamp)
            <= ACTIVE_STATUS_WINDOW.as_millis() as u64;

        self.set_states(PinState::OFFLINE, is_offline);
        self.set_states(PinState::CONNECTIVITY_ISSUES, has_net_error);
        self.set_states(PinState::ACTIVE, fresh && !is_offline);
    }

    /// Mark the pin reachable at the given hop distance, keeping the
    /// smaller distance when already reachable.
    pub fn mark_reachable(&mut self, hop_distance: u32) {
        if !self.state.contains(PinState::REACHABLE) || hop_distance < self.hop_distance {
            self.hop_distance = hop_distance;
        }
        self.add_states(PinState::REACHABLE);
    }

    /// Clear reachability.
    pub fn mark_unreachable(&mut self) {
        self.remove_states(PinState::REACHABLE);
        self.hop_distance = 0;
    }
}

impl std::fmt::Display for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{:?}]", self.hub, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_hub::records::{Status, VERSION_OFFLINE};
    use flotilla_hub::Identity;

    fn test_pin() -> Pin {
        Pin::new(Hub::new(Identity::from_seed(&[1; 32]).hub_id()))
    }

    #[test]
    fn state_bit_operations() {
        let mut pin = test_pin();
        assert!(pin.is_regarded());

        pin.add_states(PinState::REACHABLE | PinState::ACTIVE);
        assert!(pin.state.contains(PinState::REACHABLE));
        assert!(pin.is_regarded());

        pin.add_states(PinState::FAILING);
        assert!(!pin.is_regarded());

        pin.remove_states(PinState::FAILING);
        assert!(pin.is_regarded());
    }

    #[test]
    fn failing_expires() {
        let mut pin = test_pin();
        let now = Instant::now();
        pin.mark_failing(now, Duration::from_secs(60));

        assert!(pin.is_failing(now));
        assert!(!pin.is_failing(now + Duration::from_secs(61)));

        pin.reset_failing();
        assert!(!pin.state.contains(PinState::FAILING));
    }

    #[test]
    fn status_states_follow_record() {
        let mut pin = test_pin();
        let now_ms = 10_000_000;

        pin.hub.status = Some(Status {
            id: pin.id(),
            timestamp: now_ms - 1000,
            version: "0.3.0".to_string(),
            load: 10,
            lanes: vec![],
            flags: vec![],
        });
        pin.update_status_states(now_ms);
        assert!(pin.state.contains(PinState::ACTIVE));
        assert!(!pin.state.contains(PinState::OFFLINE));

        // Offline version clears active and sets offline.
        pin.hub.status.as_mut().unwrap().version = VERSION_OFFLINE.to_string();
        pin.update_status_states(now_ms);
        assert!(pin.state.contains(PinState::OFFLINE));
        assert!(!pin.state.contains(PinState::ACTIVE));

        // A stale status is not active.
        let mut pin = test_pin();
        pin.hub.status = Some(Status {
            id: pin.id(),
            timestamp: 0,
            version: "0.3.0".to_string(),
            load: 10,
            lanes: vec![],
            flags: vec![],
        });
        pin.update_status_states(now_ms + ACTIVE_STATUS_WINDOW.as_millis() as u64);
        assert!(!pin.state.contains(PinState::ACTIVE));
    }

    #[test]
    fn reachability_keeps_best_distance() {
        let mut pin = test_pin();
        pin.mark_reachable(3);
        assert_eq!(pin.hop_distance, 3);

        pin.mark_reachable(5);
        assert_eq!(pin.hop_distance, 3);

        pin.mark_reachable(2);
        assert_eq!(pin.hop_distance, 2);

        pin.mark_unreachable();
        assert!(!pin.state.contains(PinState::REACHABLE));
    }
}
