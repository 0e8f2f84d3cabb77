//! Battle execution: the rules-engine boundary, per-battle sessions, and the
//! dispatcher that owns them.

pub mod dispatcher;
pub mod engine;
pub mod session;

pub use dispatcher::{BattleConclusion, BattleDispatcher, BattleRequest, BattleSummary};
pub use engine::{
    BattleSetup, BattleStep, EngineError, PlayerInput, Recipient, RelayEngine, RulesEngine,
};
pub use session::{BattleHandle, SessionState};
