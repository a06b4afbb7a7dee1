//! Hub identity and gossip records for the flotilla overlay
//!
//! This crate provides:
//! - Hub identities (Ed25519 signing key + X25519 exchange key)
//! - Announcement and Status records with signed envelopes
//! - Replay-protected record application
//! - A sled-backed store with update hooks
//! - Bootstrap entry parsing

pub mod bootstrap;
pub mod identity;
pub mod records;
pub mod store;

pub use bootstrap::BootstrapEntry;
pub use identity::{HubId, Identity};
pub use records::{AdvertisedLane, Announcement, Hub, Scope, Status, StatusFlag};
pub use store::{HubStore, HubUpdate};
