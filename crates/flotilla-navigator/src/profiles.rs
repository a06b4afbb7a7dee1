//! Routing profiles
//!
//! A profile budgets route search: hop bounds plus the extra cost and
//! extra hops allowed beyond the best route found so far. Hop counts
//! include the home hub.

use tracing::warn;

use crate::router::Route;

/// A routing algorithm budget
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoutingProfile {
    /// Profile name
    pub name: &'static str,
    /// Minimum hops a route must have, home included
    pub min_hops: usize,
    /// Maximum hops a route may have, home included
    pub max_hops: usize,
    /// Extra hops allowed beyond the currently best route
    pub max_extra_hops: usize,
    /// Extra cost allowed beyond the currently best route
    pub max_extra_cost: f32,
}

/// The default profile: three to five hops with moderate alternatives
pub const ROUTING_PROFILE_DEFAULT: RoutingProfile = RoutingProfile {
    name: "default",
    min_hops: 3,
    max_hops: 5,
    max_extra_hops: 2,
    max_extra_cost: 100.0,
};

/// The shortest profile: anything from a direct connection up
pub const ROUTING_PROFILE_SHORTEST: RoutingProfile = RoutingProfile {
    name: "shortest",
    min_hops: 1,
    max_hops: 5,
    max_extra_hops: 1,
    max_extra_cost: 100.0,
};

/// Look a profile up by name, falling back to the default.
pub fn routing_profile(name: &str) -> &'static RoutingProfile {
    match name {
        "default" => &ROUTING_PROFILE_DEFAULT,
        "shortest" => &ROUTING_PROFILE_SHORTEST,
        other => {
            warn!(profile = other, "unknown routing profile, falling back to default");
            &ROUTING_PROFILE_DEFAULT
        }
    }
}

/// Verdict on a candidate route
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RouteCompliance {
    /// Fully compliant, usable as is
    Ok,
    /// Not compliant yet, but adding hops might change that
    NonCompliant,
    /// Cannot become compliant, stop exploring this branch
    Disqualified,
}

impl RoutingProfile {
    pub(crate) fn check_route_compliance(
        &self,
        route: &Route,
        best: Option<&Route>,
    ) -> RouteCompliance {
        if route.path.len() < self.min_hops {
            return RouteCompliance::NonCompliant;
        }
        if route.path.len() > self.max_hops {
            return RouteCompliance::Disqualified;
        }

        // No hub re-use on a route.
        if let Some((last, rest)) = route.path.split_last() {
            if rest.iter().any(|hop| hop.hub_id == last.hub_id) {
                return RouteCompliance::Disqualified;
            }
        }

        // Abort exploration outside the optimization boundaries.
        if let Some(best) = best {
            if route.total_cost > best.total_cost + self.max_extra_cost {
                return RouteCompliance::Disqualified;
            }
            if route.path.len() > best.path.len() + self.max_extra_hops {
                return RouteCompliance::Disqualified;
            }
        }

        RouteCompliance::Ok
    }
}
