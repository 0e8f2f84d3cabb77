//! Boundary to the external rules engine.
//!
//! The dispatcher hands an engine everything it needs for one battle and gets
//! back a stream of steps. The engine never sees connections; it addresses
//! output by side and receives player input as `(side, frame)` pairs.

use battle_events::{BattleId, BattleOutcome, BattlePlayer, ChallengeInfo, Side, TeamBattle};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

/// Immutable inputs for one battle.
#[derive(Debug, Clone)]
pub struct BattleSetup {
    pub battle_id: BattleId,
    /// Players indexed by [`Side::index`]
    pub players: [BattlePlayer; 2],
    pub challenge: ChallengeInfo,
    pub teams: [TeamBattle; 2],
    /// Backing store selected when the battle started
    pub backing_store: String,
}

impl BattleSetup {
    pub fn player(&self, side: Side) -> &BattlePlayer {
        &self.players[side.index()]
    }

    pub fn team(&self, side: Side) -> &TeamBattle {
        &self.teams[side.index()]
    }
}

/// A frame sent by a seated player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInput {
    pub side: Side,
    pub frame: Vec<u8>,
}

/// Who a step's frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Side(Side),
    Both,
}

impl Recipient {
    pub fn includes(self, side: Side) -> bool {
        match self {
            Recipient::Both => true,
            Recipient::Side(s) => s == side,
        }
    }
}

/// One unit of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BattleStep {
    Send { to: Recipient, frame: Vec<u8> },
    /// Terminal; nothing after it is read
    Finished(BattleOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rules engine error: {0}")]
pub struct EngineError(pub String);

/// The rules engine capability.
///
/// `run` is called once per battle, inside that battle's task. The returned
/// stream is polled until it yields [`BattleStep::Finished`], errors, or ends;
/// ending without an outcome aborts the battle. Dropping the stream is how
/// the dispatcher stops an engine.
pub trait RulesEngine: Send + Sync {
    fn run(
        &self,
        setup: BattleSetup,
        inputs: mpsc::UnboundedReceiver<PlayerInput>,
    ) -> BoxStream<'static, Result<BattleStep, EngineError>>;
}

/// Pass-through engine: announces the battle to both sides, then forwards each
/// player's frames to the opponent. A `/forfeit` frame ends the battle.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayEngine;

impl RelayEngine {
    pub const FORFEIT: &'static [u8] = b"/forfeit";
}

impl RulesEngine for RelayEngine {
    fn run(
        &self,
        setup: BattleSetup,
        inputs: mpsc::UnboundedReceiver<PlayerInput>,
    ) -> BoxStream<'static, Result<BattleStep, EngineError>> {
        let intro = format!(
            "battle {} {}: {} vs {}",
            setup.battle_id,
            setup.challenge.tier,
            setup.player(Side::A).name,
            setup.player(Side::B).name
        );
        let announce = stream::once(async move {
            Ok::<_, EngineError>(BattleStep::Send {
                to: Recipient::Both,
                frame: intro.into_bytes(),
            })
        });

        let relay = stream::unfold(Some(inputs), |inputs| async move {
            let mut inputs = inputs?;
            let input = inputs.recv().await?;
            if input.frame == RelayEngine::FORFEIT {
                let outcome = BattleOutcome::Forfeit(input.side);
                return Some((Ok::<_, EngineError>(BattleStep::Finished(outcome)), None));
            }
            let step = BattleStep::Send {
                to: Recipient::Side(input.side.opponent()),
                frame: input.frame,
            };
            Some((Ok(step), Some(inputs)))
        });

        announce.chain(relay).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use battle_events::ConnectionId;

    fn setup() -> BattleSetup {
        BattleSetup {
            battle_id: BattleId::from("b1"),
            players: [
                BattlePlayer::new(ConnectionId(0), "red"),
                BattlePlayer::new(ConnectionId(1), "blue"),
            ],
            challenge: ChallengeInfo::new("ou"),
            teams: [TeamBattle::default(), TeamBattle::default()],
            backing_store: "sqlite".to_string(),
        }
    }

    #[tokio::test]
    async fn relay_forwards_to_opponent_until_forfeit() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut steps = RelayEngine.run(setup(), rx);

        match steps.next().await {
            Some(Ok(BattleStep::Send { to: Recipient::Both, frame })) => {
                assert_eq!(String::from_utf8(frame).unwrap(), "battle b1 ou: red vs blue");
            }
            other => panic!("unexpected step: {other:?}"),
        }

        tx.send(PlayerInput { side: Side::A, frame: b"move 1".to_vec() }).unwrap();
        assert_eq!(
            steps.next().await,
            Some(Ok(BattleStep::Send {
                to: Recipient::Side(Side::B),
                frame: b"move 1".to_vec()
            }))
        );

        tx.send(PlayerInput { side: Side::B, frame: RelayEngine::FORFEIT.to_vec() }).unwrap();
        assert_eq!(
            steps.next().await,
            Some(Ok(BattleStep::Finished(BattleOutcome::Forfeit(Side::B))))
        );
        assert_eq!(steps.next().await, None);
    }

    #[tokio::test]
    async fn relay_ends_when_inputs_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut steps = RelayEngine.run(setup(), rx);
        assert!(steps.next().await.is_some());
        drop(tx);
        assert_eq!(steps.next().await, None);
    }

    #[test]
    fn recipients() {
        assert!(Recipient::Both.includes(Side::A));
        assert!(Recipient::Side(Side::B).includes(Side::B));
        assert!(!Recipient::Side(Side::B).includes(Side::A));
    }
}
