//! Connection management for client connections.
//!
//! This module handles the lifecycle of client connections: the per-connection
//! object and the registry that assigns and recycles dense connection ids.

pub mod client;
pub mod registry;

pub use client::{Connection, Outbound};
pub use registry::ConnectionRegistry;
