//! Hub map and route planning for the flotilla overlay
//!
//! This crate provides:
//! - The [`map::Map`] of pins and lanes with reachability tracking
//! - The [`cost`] model for hubs, lanes and destinations
//! - The depth-first [`router`] with branch-and-bound pruning
//! - [`profiles`] budgeting route search
//! - The [`geo`] oracle seam

pub mod cost;
pub mod geo;
pub mod map;
pub mod pin;
pub mod profiles;
pub mod router;

pub use geo::{GeoLocation, GeoLocator, StaticGeoLocator};
pub use map::Map;
pub use pin::{Lane, Pin, PinState};
pub use profiles::{routing_profile, RoutingProfile, ROUTING_PROFILE_DEFAULT, ROUTING_PROFILE_SHORTEST};
pub use router::{find_routes, Route, RouteHop, Routes};
