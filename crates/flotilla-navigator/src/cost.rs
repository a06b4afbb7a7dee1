//! Cost model for hubs, lanes and destinations

use std::time::Duration;

const MBIT: f32 = 1_000_000.0;

/// Capacity break points and their cost contribution. Lower capacity costs
/// more; values between points interpolate linearly.
const CAPACITY_COSTS: [(f32, f32); 5] = [
    (MBIT, 90.0),
    (10.0 * MBIT, 40.0),
    (100.0 * MBIT, 15.0),
    (1_000.0 * MBIT, 5.0),
    (10_000.0 * MBIT, 0.0),
];

/// Cost a lane contributes when its latency is unknown
const UNKNOWN_LATENCY_COST: f32 = 30.0;

/// Cost of routing through a hub based on its reported load.
pub fn hub_cost(load: u8) -> f32 {
    match load {
        0..=79 => 0.0,
        80..=94 => 10.0 + f32::from(load - 80),
        _ => 200.0,
    }
}

/// Cost of a lane from its combined latency and capacity.
pub fn lane_cost(latency: Duration, capacity_bps: u64) -> f32 {
    let latency_cost = if latency.is_zero() {
        UNKNOWN_LATENCY_COST
    } else {
        latency.as_millis() as f32 * 0.5
    };

    // Unknown capacity reads as the unconfirmed maximum of 100 Mbit/s.
    let capacity = if capacity_bps == 0 {
        100.0 * MBIT
    } else {
        capacity_bps as f32
    };

    let capacity_cost = if capacity <= CAPACITY_COSTS[0].0 {
        CAPACITY_COSTS[0].1
    } else if capacity >= CAPACITY_COSTS[CAPACITY_COSTS.len() - 1].0 {
        0.0
    } else {
        let mut cost = 0.0;
        for pair in CAPACITY_COSTS.windows(2) {
            let (low_cap, low_cost) = pair[0];
            let (high_cap, high_cost) = pair[1];
            if capacity <= high_cap {
                let t = (capacity - low_cap) / (high_cap - low_cap);
                cost = low_cost + t * (high_cost - low_cost);
                break;
            }
        }
        cost
    };

    latency_cost + capacity_cost
}

/// Cost of a destination based on geo proximity to the true target,
/// `proximity ∈ [0, 100]`.
pub fn destination_cost(proximity: f32) -> f32 {
    (100.0 - proximity.clamp(0.0, 100.0)) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_cost_bands() {
        assert_eq!(hub_cost(0), 0.0);
        assert_eq!(hub_cost(79), 0.0);
        assert_eq!(hub_cost(80), 10.0);
        assert_eq!(hub_cost(94), 24.0);
        assert_eq!(hub_cost(95), 200.0);
        assert_eq!(hub_cost(100), 200.0);
    }

    #[test]
    fn lane_cost_prefers_fast_fat_lanes() {
        let fast = lane_cost(Duration::from_millis(20), 100_000_000);
        let medium = lane_cost(Duration::from_millis(30), 50_000_000);
        let slow = lane_cost(Duration::from_millis(40), 10_000_000);
        assert!(fast < medium, "{fast} < {medium}");
        assert!(medium < slow, "{medium} < {slow}");
    }

    #[test]
    fn capacity_interpolates_between_break_points() {
        let at_10mbit = lane_cost(Duration::from_millis(10), 10_000_000);
        let at_55mbit = lane_cost(Duration::from_millis(10), 55_000_000);
        let at_100mbit = lane_cost(Duration::from_millis(10), 100_000_000);
        assert!(at_10mbit > at_55mbit && at_55mbit > at_100mbit);
    }

    #[test]
    fn unknown_values_carry_penalties() {
        assert_eq!(
            lane_cost(Duration::ZERO, 100_000_000),
            UNKNOWN_LATENCY_COST + 15.0
        );
        // Unknown capacity is treated as 100 Mbit/s.
        assert_eq!(
            lane_cost(Duration::from_millis(10), 0),
            lane_cost(Duration::from_millis(10), 100_000_000)
        );
    }

    #[test]
    fn destination_cost_scales_with_distance() {
        assert_eq!(destination_cost(100.0), 0.0);
        assert_eq!(destination_cost(0.0), 50.0);
        assert!(destination_cost(30.0) > destination_cost(80.0));
    }
}
