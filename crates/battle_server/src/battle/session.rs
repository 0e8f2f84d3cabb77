//! Per-battle state and the task that drives one battle.

use super::engine::{BattleSetup, BattleStep, PlayerInput, Recipient, RulesEngine};
use crate::connection::Connection;
use battle_events::{AbortReason, BattleId, BattleOutcome, BattleResult, Side};
use futures::stream::StreamExt;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, warn};

/// Lifecycle of a battle session.
///
/// `Created → Running → {Completed | Aborted}`; both end states are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Completed(BattleOutcome),
    Aborted(AbortReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed(_) | SessionState::Aborted(_))
    }

    pub fn result(&self) -> Option<BattleResult> {
        match self {
            SessionState::Completed(outcome) => Some(BattleResult::Completed(outcome.clone())),
            SessionState::Aborted(reason) => Some(BattleResult::Aborted(reason.clone())),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Completed(_) => "completed",
            SessionState::Aborted(_) => "aborted",
        }
    }
}

impl From<BattleResult> for SessionState {
    fn from(result: BattleResult) -> Self {
        match result {
            BattleResult::Completed(outcome) => SessionState::Completed(outcome),
            BattleResult::Aborted(reason) => SessionState::Aborted(reason),
        }
    }
}

/// Observer for one battle, returned when it starts.
#[derive(Debug, Clone)]
pub struct BattleHandle {
    battle_id: BattleId,
    state: watch::Receiver<SessionState>,
}

impl BattleHandle {
    pub(crate) fn new(battle_id: BattleId, state: watch::Receiver<SessionState>) -> Self {
        Self { battle_id, state }
    }

    pub fn battle_id(&self) -> &BattleId {
        &self.battle_id
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Wait for the battle to reach a terminal state.
    pub async fn finished(&mut self) -> BattleResult {
        let terminal = self
            .state
            .wait_for(SessionState::is_terminal)
            .await
            .map(|state| state.clone())
            .ok();
        terminal
            .unwrap_or_else(|| self.state.borrow().clone())
            .result()
            .unwrap_or(BattleResult::Aborted(AbortReason::EngineStopped))
    }
}

/// Both seats of a battle. A vacated seat holds `None`.
pub(crate) type Seats = Arc<RwLock<[Option<Arc<Connection>>; 2]>>;

/// Everything the battle task owns.
pub(crate) struct SessionTask {
    pub setup: BattleSetup,
    pub engine: Arc<dyn RulesEngine>,
    pub inputs: mpsc::UnboundedReceiver<PlayerInput>,
    pub seats: Seats,
    pub cancel: oneshot::Receiver<AbortReason>,
}

/// How the task ended.
pub(crate) enum TaskExit {
    /// The engine reached a result on its own
    Concluded(BattleResult),
    /// Someone else terminated the battle
    Cancelled,
}

impl SessionTask {
    /// Drive the engine until it finishes, fails, or the battle is cancelled.
    pub async fn run(self) -> TaskExit {
        let SessionTask {
            setup,
            engine,
            inputs,
            seats,
            mut cancel,
        } = self;
        let battle_id = setup.battle_id.clone();

        let started = std::panic::catch_unwind(AssertUnwindSafe(|| engine.run(setup, inputs)));
        let mut steps = match started {
            Ok(steps) => steps,
            Err(_) => {
                return TaskExit::Concluded(BattleResult::Aborted(AbortReason::EngineFault(
                    "engine panicked while starting".to_string(),
                )))
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut cancel => return TaskExit::Cancelled,
                next = AssertUnwindSafe(steps.next()).catch_unwind() => next,
            };

            let step = match next {
                Ok(Some(Ok(step))) => step,
                Ok(Some(Err(e))) => {
                    warn!("Battle {} engine failed: {}", battle_id, e);
                    return TaskExit::Concluded(BattleResult::Aborted(AbortReason::EngineFault(
                        e.to_string(),
                    )));
                }
                Ok(None) => {
                    return TaskExit::Concluded(BattleResult::Aborted(AbortReason::EngineStopped))
                }
                Err(_) => {
                    warn!("Battle {} engine panicked", battle_id);
                    return TaskExit::Concluded(BattleResult::Aborted(AbortReason::EngineFault(
                        "engine panicked".to_string(),
                    )));
                }
            };

            match step {
                BattleStep::Send { to, frame } => route(&battle_id, &seats, to, frame).await,
                BattleStep::Finished(outcome) => {
                    return TaskExit::Concluded(BattleResult::Completed(outcome))
                }
            }
        }
    }
}

/// Queue `frame` on every seated connection `to` addresses.
async fn route(battle_id: &BattleId, seats: &Seats, to: Recipient, frame: Vec<u8>) {
    let seats = seats.read().await;
    for side in Side::BOTH {
        if !to.includes(side) {
            continue;
        }
        match &seats[side.index()] {
            Some(conn) => {
                if !conn.send(frame.clone()) {
                    debug!("Battle {} side {}: connection {} is closed", battle_id, side, conn.id());
                }
            }
            None => debug!("Battle {} side {} is vacant; frame dropped", battle_id, side),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!SessionState::Created.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::Aborted(AbortReason::Shutdown).is_terminal());

        let state = SessionState::from(BattleResult::Completed(BattleOutcome::Tie));
        assert_eq!(state, SessionState::Completed(BattleOutcome::Tie));
        assert_eq!(state.result(), Some(BattleResult::Completed(BattleOutcome::Tie)));
        assert_eq!(SessionState::Running.result(), None);
    }

    #[tokio::test]
    async fn handle_waits_for_terminal_state() {
        let (tx, rx) = watch::channel(SessionState::Created);
        let mut handle = BattleHandle::new(BattleId::from("b9"), rx);

        let waiter = tokio::spawn(async move { handle.finished().await });
        tx.send_replace(SessionState::Running);
        tx.send_replace(SessionState::Aborted(AbortReason::Shutdown));

        assert_eq!(
            waiter.await.unwrap(),
            BattleResult::Aborted(AbortReason::Shutdown)
        );
    }
}
