//! Server façade and the per-connection I/O tasks it spawns.

pub mod core;
pub mod pump;

pub use self::core::{BattleServer, ServerStats};
pub use pump::{TransportEvent, TransportEventKind};
