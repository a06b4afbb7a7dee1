//! Cranes and relay operations for the flotilla overlay
//!
//! This crate provides:
//! - The [`ship::Ship`] transport abstraction (TCP and in-memory test pair)
//! - The [`crane::Crane`] multiplexing terminals over one ship
//! - The process-wide crane [`registry`] and update hook
//! - The latency, verification, gossip and expand operations

pub mod crane;
pub mod gossip;
pub mod op_expand;
pub mod op_latency;
pub mod op_verify;
pub mod registry;
pub mod ship;

pub use crane::{Crane, CraneOpts, CraneState};
pub use gossip::{import_and_verify_hub_info, GossipContext, GossipMsg};
pub use op_expand::{active_expand_ops, ExpandClientOp, ExpandRequest};
pub use op_latency::{LatencyOpts, LatencyTestOp};
pub use ship::{Ship, TcpShip, TestShip};

/// Register every operation type this crate provides.
///
/// Idempotent; call once during startup before cranes accept traffic.
pub fn register_op_types() {
    flotilla_terminal::op_counter::CounterOp::register();
    op_latency::register_latency_op();
    op_verify::register_verify_op();
    op_expand::register_expand_op();
    gossip::register_gossip_op();
}
