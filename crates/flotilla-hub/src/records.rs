//! Hub gossip records: announcements and statuses
//!
//! Both record kinds travel as signed envelopes. A record is accepted only
//! if its signature verifies against the embedded key, the key hashes to
//! the record's hub ID, and its timestamp strictly exceeds the stored one.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use flotilla_core::{Error, Result};

use crate::identity::{HubId, Identity};

/// Status version advertised by hubs that are shutting down
pub const VERSION_OFFLINE: &str = "offline";

/// Age after which a hub without an active status is garbage collected
pub const HUB_OBSOLETE_AFTER: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Gossip scope a record was received in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// The public overlay
    Public,
    /// Isolated test networks
    Test,
}

/// A lane advertised by one endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedLane {
    /// Peer hub at the far end
    pub peer: HubId,
    /// Measured latency in milliseconds, 0 when unmeasured
    pub latency_ms: u32,
    /// Measured capacity in bits per second, 0 when unmeasured
    pub capacity_bps: u64,
}

/// Status flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusFlag {
    /// The hub reports connectivity issues
    NetError,
}

/// A hub's self-description, signed by its identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Hub identifier
    pub id: HubId,
    /// Unix millis at creation; replay protection
    pub timestamp: u64,
    /// Human-readable name
    pub name: String,
    /// Transport descriptors, e.g. `tcp:17`
    pub transports: Vec<String>,
    /// Advertised IPv4 address
    pub ipv4: Option<Ipv4Addr>,
    /// Advertised IPv6 address
    pub ipv6: Option<Ipv6Addr>,
    /// X25519 exchange keys for session handshakes
    pub exchange_keys: Vec<[u8; 32]>,
}

/// A hub's current operational state, signed by its identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Hub identifier
    pub id: HubId,
    /// Unix millis at creation; replay protection
    pub timestamp: u64,
    /// Software version, [`VERSION_OFFLINE`] when shutting down
    pub version: String,
    /// Load in percent, 0-100
    pub load: u8,
    /// Advertised lanes to other hubs
    pub lanes: Vec<AdvertisedLane>,
    /// Status flags
    pub flags: Vec<StatusFlag>,
}

impl Status {
    /// Whether the hub announced itself offline.
    pub fn is_offline(&self) -> bool {
        self.version == VERSION_OFFLINE
    }

    /// Whether a flag is set.
    pub fn has_flag(&self, flag: StatusFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Signed wrapper around an encoded record
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignedEnvelope {
    content: Vec<u8>,
    public_key: [u8; 32],
    signature: Vec<u8>,
}

impl SignedEnvelope {
    fn seal<T: Serialize>(identity: &Identity, record: &T) -> Result<Vec<u8>> {
        let content = postcard::to_allocvec(record)
            .map_err(|err| Error::Internal(format!("failed to encode record: {err}")))?;
        let signature = identity.sign(&content).to_vec();
        postcard::to_allocvec(&SignedEnvelope {
            content,
            public_key: identity.public_key(),
            signature,
        })
        .map_err(|err| Error::Internal(format!("failed to encode envelope: {err}")))
    }

    /// Verify the envelope and return content and signer.
    fn open(data: &[u8]) -> Result<(Vec<u8>, HubId)> {
        let envelope: SignedEnvelope = postcard::from_bytes(data)
            .map_err(|err| Error::MalformedData(format!("invalid envelope: {err}")))?;
        Identity::verify(&envelope.public_key, &envelope.content, &envelope.signature)?;
        let signer = HubId::from_public_key(&envelope.public_key);
        Ok((envelope.content, signer))
    }
}

/// Shared measurements of a hub, updated by probes
#[derive(Debug, Default)]
pub struct Measurements {
    inner: Mutex<MeasurementsInner>,
}

#[derive(Debug, Default, Clone)]
struct MeasurementsInner {
    latency: Option<Duration>,
    capacity_bps: Option<u64>,
    calculated_cost: Option<f32>,
    geo_proximity: Option<f32>,
}

impl Measurements {
    /// Record a latency measurement.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = Some(latency);
    }

    /// Last measured latency.
    pub fn latency(&self) -> Option<Duration> {
        self.inner.lock().latency
    }

    /// Record a capacity measurement.
    pub fn set_capacity(&self, capacity_bps: u64) {
        self.inner.lock().capacity_bps = Some(capacity_bps);
    }

    /// Last measured capacity.
    pub fn capacity(&self) -> Option<u64> {
        self.inner.lock().capacity_bps
    }

    /// Store the cost derived from latency and capacity.
    pub fn set_calculated_cost(&self, cost: f32) {
        self.inner.lock().calculated_cost = Some(cost);
    }

    /// Cost derived from measurements.
    pub fn calculated_cost(&self) -> Option<f32> {
        self.inner.lock().calculated_cost
    }

    /// Store the geo proximity to the home location.
    pub fn set_geo_proximity(&self, proximity: f32) {
        self.inner.lock().geo_proximity = Some(proximity);
    }

    /// Geo proximity to the home location.
    pub fn geo_proximity(&self) -> Option<f32> {
        self.inner.lock().geo_proximity
    }
}

/// A known hub: identity plus the latest accepted records
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hub {
    /// Hub identifier
    pub id: HubId,
    /// Latest verified announcement
    pub announcement: Option<Announcement>,
    /// Latest verified status
    pub status: Option<Status>,
    /// Whether the advertised IPs have been verified
    pub verified_ips: bool,
    /// Unix millis when this hub was first seen; bootstrap hubs get the
    /// insertion time so they are never garbage collected
    pub first_seen: u64,
    /// Probe measurements, not persisted
    #[serde(skip)]
    pub measurements: Arc<Measurements>,
}

impl Hub {
    /// Create an empty hub shell.
    pub fn new(id: HubId) -> Self {
        Self {
            id,
            announcement: None,
            status: None,
            verified_ips: false,
            first_seen: now_millis(),
            measurements: Arc::new(Measurements::default()),
        }
    }

    /// Whether the hub announced itself offline.
    pub fn is_offline(&self) -> bool {
        self.status.as_ref().is_some_and(Status::is_offline)
    }

    /// Whether this hub has aged out: no recent status and first seen long ago.
    pub fn obsolete(&self, now_ms: u64) -> bool {
        let newest = self
            .status
            .as_ref()
            .map(|s| s.timestamp)
            .unwrap_or(self.first_seen)
            .max(self.first_seen);
        now_ms.saturating_sub(newest) > HUB_OBSOLETE_AFTER.as_millis() as u64
    }

    /// The first advertised exchange key, if any.
    pub fn exchange_key(&self) -> Option<[u8; 32]> {
        self.announcement
            .as_ref()
            .and_then(|ann| ann.exchange_keys.first().copied())
    }
}

impl std::fmt::Display for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.announcement {
            Some(ann) if !ann.name.is_empty() => write!(f, "{} ({})", ann.name, self.id),
            _ => write!(f, "hub {}", self.id),
        }
    }
}

/// Export a signed announcement envelope.
pub fn export_announcement(identity: &Identity, announcement: &Announcement) -> Result<Vec<u8>> {
    SignedEnvelope::seal(identity, announcement)
}

/// Export a signed status envelope.
pub fn export_status(identity: &Identity, status: &Status) -> Result<Vec<u8>> {
    SignedEnvelope::seal(identity, status)
}

/// Apply a received announcement envelope to a hub.
///
/// Returns the updated hub and whether the record is new and should be
/// forwarded to other cranes. A byte-identical re-import is accepted with
/// `forward = false`; an older or same-aged differing record fails with
/// [`Error::OldData`].
pub fn apply_announcement(existing: Option<Hub>, data: &[u8], _scope: Scope) -> Result<(Hub, bool)> {
    let (content, signer) = SignedEnvelope::open(data)?;
    let announcement: Announcement = postcard::from_bytes(&content)
        .map_err(|err| Error::MalformedData(format!("invalid announcement: {err}")))?;
    if announcement.id != signer {
        return Err(Error::Integrity("announcement not signed by its hub".to_string()));
    }
    if announcement.transports.is_empty() {
        return Err(Error::MalformedData("announcement is missing transports".to_string()));
    }
    if announcement.ipv4.is_none() && announcement.ipv6.is_none() {
        return Err(Error::MalformedData("announcement is missing IPs".to_string()));
    }

    let mut hub = existing.unwrap_or_else(|| Hub::new(announcement.id));
    if hub.id != announcement.id {
        return Err(Error::Integrity("announcement for a different hub".to_string()));
    }

    if let Some(stored) = &hub.announcement {
        if announcement.timestamp <= stored.timestamp {
            if announcement == *stored {
                return Ok((hub, false));
            }
            return Err(Error::OldData(format!(
                "announcement timestamp {} <= stored {}",
                announcement.timestamp, stored.timestamp
            )));
        }
    }

    hub.announcement = Some(announcement);
    Ok((hub, true))
}

/// Apply a received status envelope to a hub.
///
/// Same replay rules as [`apply_announcement`].
pub fn apply_status(existing: Option<Hub>, data: &[u8], _scope: Scope) -> Result<(Hub, bool)> {
    let (content, signer) = SignedEnvelope::open(data)?;
    let status: Status = postcard::from_bytes(&content)
        .map_err(|err| Error::MalformedData(format!("invalid status: {err}")))?;
    if status.id != signer {
        return Err(Error::Integrity("status not signed by its hub".to_string()));
    }
    if status.load > 100 {
        return Err(Error::MalformedData(format!("load {} out of range", status.load)));
    }

    let mut hub = existing.unwrap_or_else(|| Hub::new(status.id));
    if hub.id != status.id {
        return Err(Error::Integrity("status for a different hub".to_string()));
    }

    if let Some(stored) = &hub.status {
        if status.timestamp <= stored.timestamp {
            if status == *stored {
                return Ok((hub, false));
            }
            return Err(Error::OldData(format!(
                "status timestamp {} <= stored {}",
                status.timestamp, stored.timestamp
            )));
        }
    }

    hub.status = Some(status);
    Ok((hub, true))
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_announcement(identity: &Identity, timestamp: u64) -> Announcement {
        Announcement {
            id: identity.hub_id(),
            timestamp,
            name: "test-hub".to_string(),
            transports: vec!["tcp:17".to_string()],
            ipv4: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ipv6: None,
            exchange_keys: vec![identity.exchange_public()],
        }
    }

    fn test_status(identity: &Identity, timestamp: u64) -> Status {
        Status {
            id: identity.hub_id(),
            timestamp,
            version: "0.3.0".to_string(),
            load: 10,
            lanes: vec![],
            flags: vec![],
        }
    }

    #[test]
    fn announcement_roundtrip() {
        let identity = Identity::from_seed(&[1; 32]);
        let ann = test_announcement(&identity, 1000);

        let data = export_announcement(&identity, &ann).unwrap();
        let (hub, forward) = apply_announcement(None, &data, Scope::Test).unwrap();
        assert!(forward);
        assert_eq!(hub.announcement.unwrap(), ann);
    }

    #[test]
    fn tampered_envelope_fails_integrity() {
        let identity = Identity::from_seed(&[1; 32]);
        let mut data = export_announcement(&identity, &test_announcement(&identity, 1000)).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert!(apply_announcement(None, &data, Scope::Test).is_err());
    }

    #[test]
    fn status_supersession() {
        let identity = Identity::from_seed(&[1; 32]);

        let newer = export_status(&identity, &test_status(&identity, 2000)).unwrap();
        let (hub, forward) = apply_status(None, &newer, Scope::Test).unwrap();
        assert!(forward);

        // Older status is rejected as outdated.
        let older = export_status(&identity, &test_status(&identity, 1999)).unwrap();
        let err = apply_status(Some(hub.clone()), &older, Scope::Test).unwrap_err();
        assert!(matches!(err, Error::OldData(_)));

        // Byte-identical re-import is idempotent.
        let (_, forward) = apply_status(Some(hub), &newer, Scope::Test).unwrap();
        assert!(!forward);
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let identity = Identity::from_seed(&[1; 32]);
        let imposter = Identity::from_seed(&[2; 32]);

        // Record claims identity's hub id but is signed by the imposter.
        let ann = test_announcement(&identity, 1000);
        let data = export_announcement(&imposter, &ann).unwrap();
        assert!(matches!(
            apply_announcement(None, &data, Scope::Test),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn obsolete_hub_ages_out() {
        let identity = Identity::from_seed(&[1; 32]);
        let mut hub = Hub::new(identity.hub_id());
        hub.first_seen = 0;
        assert!(hub.obsolete(HUB_OBSOLETE_AFTER.as_millis() as u64 + 1));

        hub.status = Some(test_status(&identity, 5000));
        assert!(!hub.obsolete(HUB_OBSOLETE_AFTER.as_millis() as u64));
    }
}
