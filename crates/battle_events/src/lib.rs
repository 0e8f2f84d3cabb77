//! # Battle Events
//!
//! Shared vocabulary of the battle server ecosystem. Everything that crosses a
//! crate boundary lives here: connection and battle identifiers, the immutable
//! battle inputs (players, challenge, teams), the events the server emits to
//! plugins, and the [`Plugin`] contract itself.
//!
//! Plugin crates depend only on this crate. They implement [`Plugin`] and
//! export it with [`export_plugin!`] so the server can load them at runtime:
//!
//! ```rust,ignore
//! use battle_events::{export_plugin, EventVerdict, Plugin, PluginError, ServerEvent};
//!
//! #[derive(Default)]
//! pub struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl Plugin for Greeter {
//!     fn name(&self) -> &str { "greeter" }
//!     fn version(&self) -> &str { "1.0.0" }
//!     async fn on_event(&mut self, event: &ServerEvent) -> Result<EventVerdict, PluginError> {
//!         Ok(EventVerdict::Continue)
//!     }
//! }
//!
//! export_plugin!(Greeter);
//! ```

pub mod events;
pub mod plugin;
pub mod types;

pub use events::{DisconnectReason, ServerEvent};
pub use plugin::{panic_to_error, EventVerdict, Plugin, PluginError, PLUGIN_ENTRY_SYMBOL};
pub use types::{
    AbortReason, BattleId, BattleMode, BattleOutcome, BattlePlayer, BattleResult, ChallengeInfo,
    ConnectionId, Side, TeamBattle, TeamMember,
};

/// Returns the current Unix timestamp in seconds.
///
/// Falls back to zero if the system clock reports a time before the epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
