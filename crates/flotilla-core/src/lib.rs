//! Core primitives for the flotilla overlay network
//!
//! This crate provides:
//! - The shared error taxonomy used across all layers
//! - Varint helpers for the wire format
//! - Terminal message and crane frame codecs
//! - The seal/open session riding on X25519 + ChaCha20-Poly1305

pub mod error;
pub mod frame;
pub mod session;
pub mod varint;

pub use error::{Error, Result};
pub use frame::{CraneFrame, CraneFrameCodec, MsgType, TerminalMsg};
pub use session::{Session, StaticExchangeKey};
