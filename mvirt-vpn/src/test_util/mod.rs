//! Test utilities for the TUN ingestion path
//!
//! Packet builders and a scripted stand-in for the TUN device, usable from
//! unit tests and from the integration tests under `tests/`.

pub mod packets;
pub mod tunnel;

pub use tunnel::{ScriptedTunnel, TunnelScript, scripted_tunnel};
