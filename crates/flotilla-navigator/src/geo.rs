//! Geo lookup oracle
//!
//! The navigator never talks to a geo-IP database directly; it asks a
//! [`GeoLocator`] for coordinates and derives proximities from them.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;

/// A located point with country attribution
#[derive(Clone, Debug, PartialEq)]
pub struct GeoLocation {
    /// ISO country code
    pub country: String,
    /// Degrees north
    pub latitude: f32,
    /// Degrees east
    pub longitude: f32,
}

impl GeoLocation {
    /// Estimate network proximity to another location in `[0, 100]`,
    /// higher meaning closer.
    pub fn estimate_proximity(&self, other: &GeoLocation) -> f32 {
        let km = self.distance_km(other);
        // Antipodal distance maps to 0, same point to 100.
        (100.0 * (1.0 - (km / 20_000.0))).clamp(0.0, 100.0)
    }

    /// Great-circle distance in kilometers.
    pub fn distance_km(&self, other: &GeoLocation) -> f32 {
        let (lat1, lon1) = (self.latitude.to_radians(), self.longitude.to_radians());
        let (lat2, lon2) = (other.latitude.to_radians(), other.longitude.to_radians());

        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        6371.0 * c
    }
}

/// Oracle resolving addresses to locations
pub trait GeoLocator: Send + Sync {
    /// Locate an address; `None` when unknown.
    fn locate(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// Table-backed locator, used in tests and for static deployments
#[derive(Default)]
pub struct StaticGeoLocator {
    entries: RwLock<HashMap<IpAddr, GeoLocation>>,
}

impl StaticGeoLocator {
    /// Create an empty locator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&self, ip: IpAddr, location: GeoLocation) {
        self.entries.write().insert(ip, location);
    }
}

impl GeoLocator for StaticGeoLocator {
    fn locate(&self, ip: IpAddr) -> Option<GeoLocation> {
        self.entries.read().get(&ip).cloned()
    }
}
