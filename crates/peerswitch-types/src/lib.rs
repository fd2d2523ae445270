//! Core types for PeerSwitch.
//!
//! This crate defines the shared data model used by the wire layer, the
//! handoff kernel and the CLI: device snapshots, discovered peers, registered
//! hosts, the command vocabulary, state machines, errors and configuration.
//! It contains no networking or business logic.

pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod message;
pub mod peer;
pub mod state;
