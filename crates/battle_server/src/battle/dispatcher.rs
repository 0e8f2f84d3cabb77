//! Battle dispatcher.
//!
//! Every battle runs as its own tokio task on the shared runtime, so a slow
//! or faulty engine only ever holds up its own battle. The dispatcher keeps
//! one table of live sessions behind a single mutex. Ending a battle means
//! removing its entry from that table: normal completion and forced
//! termination both race for the removal, and whoever gets the entry runs the
//! teardown. The loser finds nothing and does nothing.

use super::engine::{BattleSetup, PlayerInput, RulesEngine};
use super::session::{BattleHandle, Seats, SessionState, SessionTask, TaskExit};
use crate::connection::Connection;
use crate::error::BattleError;
use battle_events::{
    AbortReason, BattleId, BattlePlayer, BattleResult, ChallengeInfo, ConnectionId, ServerEvent,
    Side, TeamBattle,
};
use plugin_system::PluginManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Request to start one battle.
#[derive(Debug, Clone)]
pub struct BattleRequest {
    pub server_id: ConnectionId,
    pub battle_id: BattleId,
    pub players: [BattlePlayer; 2],
    pub challenge: ChallengeInfo,
    pub teams: [TeamBattle; 2],
}

/// Sent to the server façade whenever a battle ends.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleConclusion {
    pub battle_id: BattleId,
    pub result: BattleResult,
    pub duration: Duration,
}

/// Snapshot of a running battle for operator listings.
#[derive(Debug, Clone)]
pub struct BattleSummary {
    pub battle_id: BattleId,
    pub tier: String,
    pub players: [String; 2],
    /// Connection currently seated per side
    pub seated: [Option<ConnectionId>; 2],
    pub state: SessionState,
    pub elapsed: Duration,
}

struct SessionEntry {
    /// Distinguishes this session from an earlier one with the same id
    serial: u64,
    battle_id: BattleId,
    players: [BattlePlayer; 2],
    challenge: ChallengeInfo,
    seats: Seats,
    inputs: mpsc::UnboundedSender<PlayerInput>,
    cancel: Option<oneshot::Sender<AbortReason>>,
    task: Option<JoinHandle<()>>,
    state: watch::Sender<SessionState>,
    /// Flips once plugins have seen `BattleStarted`
    announced: watch::Receiver<bool>,
    /// Bumped whenever a seat is vacated or refilled; stale grace timers
    /// compare against it
    seat_generation: [u64; 2],
    started_at: Instant,
}

/// Creates and tears down battle sessions.
pub struct BattleDispatcher {
    engine: Arc<dyn RulesEngine>,
    plugins: Arc<PluginManager>,
    sessions: Mutex<HashMap<BattleId, SessionEntry>>,
    conclusions: mpsc::UnboundedSender<BattleConclusion>,
    terminate_grace: Duration,
    disconnect_grace: Duration,
    next_serial: AtomicU64,
}

impl BattleDispatcher {
    pub fn new(
        engine: Arc<dyn RulesEngine>,
        plugins: Arc<PluginManager>,
        conclusions: mpsc::UnboundedSender<BattleConclusion>,
        terminate_grace: Duration,
        disconnect_grace: Duration,
    ) -> Self {
        Self {
            engine,
            plugins,
            sessions: Mutex::new(HashMap::new()),
            conclusions,
            terminate_grace,
            disconnect_grace,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Start a battle between two live connections.
    ///
    /// Returns as soon as the battle task is spawned. `connections` must be
    /// ordered like `request.players`.
    pub async fn start_battle(
        self: &Arc<Self>,
        request: BattleRequest,
        connections: [Arc<Connection>; 2],
        backing_store: String,
    ) -> Result<BattleHandle, BattleError> {
        let BattleRequest {
            server_id,
            battle_id,
            players,
            challenge,
            teams,
        } = request;

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let (announced_tx, announced_rx) = watch::channel(false);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        // Binding and closing are both decided under this lock; see `battle_of`.
        let seats: Seats = {
            let mut sessions = self.sessions.lock().await;

            if sessions.contains_key(&battle_id) {
                return Err(BattleError::DuplicateBattle(battle_id));
            }
            for conn in &connections {
                if conn.is_closed() {
                    return Err(BattleError::ConnectionNotFound(conn.id()));
                }
                if let Some(current) = conn.battle().await {
                    return Err(BattleError::AlreadyBattling {
                        connection: conn.id(),
                        battle: current,
                    });
                }
            }

            for conn in &connections {
                conn.set_battle(Some(battle_id.clone())).await;
            }

            let [conn_a, conn_b] = connections;
            let seats: Seats = Arc::new(RwLock::new([Some(conn_a), Some(conn_b)]));
            sessions.insert(
                battle_id.clone(),
                SessionEntry {
                    serial,
                    battle_id: battle_id.clone(),
                    players: players.clone(),
                    challenge: challenge.clone(),
                    seats: seats.clone(),
                    inputs: inputs_tx,
                    cancel: Some(cancel_tx),
                    task: None,
                    state: state_tx,
                    announced: announced_rx,
                    seat_generation: [0; 2],
                    started_at: Instant::now(),
                },
            );
            seats
        };

        // Plugins hear about the battle before it can possibly end; `finish`
        // waits on `announced` before reporting the end.
        let started = ServerEvent::BattleStarted {
            battle_id: battle_id.clone(),
            server_id,
            players: players.clone(),
            challenge: challenge.clone(),
        };
        let report = self.plugins.dispatch(&started).await;
        for (plugin, e) in &report.failed {
            warn!("Plugin {} failed on battle_started for {}: {}", plugin, battle_id, e);
        }
        announced_tx.send_replace(true);

        let task = SessionTask {
            setup: BattleSetup {
                battle_id: battle_id.clone(),
                players,
                challenge,
                teams,
                backing_store,
            },
            engine: self.engine.clone(),
            inputs: inputs_rx,
            seats,
            cancel: cancel_rx,
        };

        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions
            .get_mut(&battle_id)
            .filter(|entry| entry.serial == serial)
        else {
            debug!("Battle {} was terminated before its task started", battle_id);
            return Ok(BattleHandle::new(battle_id, state_rx));
        };

        entry.state.send_replace(SessionState::Running);
        let dispatcher = Arc::clone(self);
        let task_battle = battle_id.clone();
        entry.task = Some(tokio::spawn(async move {
            if let TaskExit::Concluded(result) = task.run().await {
                dispatcher.conclude(&task_battle, serial, result).await;
            }
        }));

        info!("⚔️ Battle {} started ({} battles running)", battle_id, sessions.len());
        Ok(BattleHandle::new(battle_id, state_rx))
    }

    /// The battle `conn` is bound to, read under the session lock so it
    /// cannot interleave with [`start_battle`](Self::start_battle) binding it.
    ///
    /// Callers mark the connection closed first; after that a battle either
    /// shows up here or never binds the connection at all.
    pub async fn battle_of(&self, conn: &Connection) -> Option<BattleId> {
        let _sessions = self.sessions.lock().await;
        conn.battle().await
    }

    /// Stop a battle from outside.
    ///
    /// Safe to call at any time. Returns `false` if the battle already ended
    /// or never existed. The battle's task gets `terminate_grace` to stop on
    /// its own before it is aborted.
    pub async fn force_terminate(&self, battle_id: &BattleId, reason: AbortReason) -> bool {
        let entry = self.sessions.lock().await.remove(battle_id);
        let Some(mut entry) = entry else {
            debug!("Battle {} already ended; nothing to terminate", battle_id);
            return false;
        };

        if let Some(cancel) = entry.cancel.take() {
            let _ = cancel.send(reason.clone());
        }
        if let Some(task) = entry.task.take() {
            self.reap(battle_id.clone(), task);
        }

        self.finish(entry, BattleResult::Aborted(reason)).await;
        true
    }

    /// Force-terminate every running battle.
    pub async fn terminate_all(&self, reason: AbortReason) -> usize {
        let ids: Vec<BattleId> = self.sessions.lock().await.keys().cloned().collect();
        let mut terminated = 0;
        for id in ids {
            if self.force_terminate(&id, reason.clone()).await {
                terminated += 1;
            }
        }
        terminated
    }

    /// Feed a frame from `conn` to the engine of the battle it is seated in.
    pub async fn forward_input(&self, conn: &Connection, frame: Vec<u8>) -> bool {
        let Some(battle_id) = conn.battle().await else {
            return false;
        };
        let sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get(&battle_id) else {
            return false;
        };
        let Some(side) = seat_of(&entry.seats, conn).await else {
            return false;
        };
        entry.inputs.send(PlayerInput { side, frame }).is_ok()
    }

    /// Take `conn` out of its battle without ending it.
    ///
    /// The seat stays vacant for `disconnect_grace`; if nobody rejoins by then
    /// the battle is aborted with [`AbortReason::RejoinTimeout`].
    pub async fn vacate_seat(self: &Arc<Self>, conn: &Connection) -> Option<(BattleId, Side)> {
        let battle_id = conn.battle().await?;
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(&battle_id)?;
        let side = seat_of(&entry.seats, conn).await?;

        entry.seats.write().await[side.index()] = None;
        entry.seat_generation[side.index()] += 1;
        let generation = entry.seat_generation[side.index()];
        let serial = entry.serial;
        drop(sessions);

        conn.leave_battle(&battle_id).await;
        info!(
            "🪑 Battle {} side {} vacated by connection {}; waiting {:?} for a rejoin",
            battle_id,
            side,
            conn.id(),
            self.disconnect_grace
        );

        let dispatcher = Arc::clone(self);
        let timer_battle = battle_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(dispatcher.disconnect_grace).await;
            dispatcher
                .expire_seat(&timer_battle, serial, side, generation)
                .await;
        });

        Some((battle_id, side))
    }

    async fn expire_seat(&self, battle_id: &BattleId, serial: u64, side: Side, generation: u64) {
        let still_vacant = {
            let sessions = self.sessions.lock().await;
            match sessions.get(battle_id) {
                Some(entry) if entry.serial == serial => {
                    entry.seat_generation[side.index()] == generation
                        && entry.seats.read().await[side.index()].is_none()
                }
                _ => false,
            }
        };
        if still_vacant {
            warn!("Battle {} side {} was not reclaimed in time", battle_id, side);
            self.force_terminate(battle_id, AbortReason::RejoinTimeout(side))
                .await;
        }
    }

    /// Seat `conn` on the vacant `side` of a running battle.
    pub async fn rejoin(
        &self,
        battle_id: &BattleId,
        side: Side,
        conn: Arc<Connection>,
    ) -> Result<(), BattleError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(battle_id)
            .ok_or_else(|| BattleError::NotFound(battle_id.clone()))?;

        if conn.is_closed() {
            return Err(BattleError::ConnectionNotFound(conn.id()));
        }
        if let Some(current) = conn.battle().await {
            return Err(BattleError::AlreadyBattling {
                connection: conn.id(),
                battle: current,
            });
        }

        let mut seats = entry.seats.write().await;
        if seats[side.index()].is_some() {
            return Err(BattleError::Invalid(format!(
                "side {side} of battle {battle_id} is occupied"
            )));
        }

        conn.set_battle(Some(battle_id.clone())).await;
        info!("🔁 Connection {} rejoined battle {} as side {}", conn.id(), battle_id, side);
        seats[side.index()] = Some(conn);
        entry.seat_generation[side.index()] += 1;
        Ok(())
    }

    pub async fn is_running(&self, battle_id: &BattleId) -> bool {
        self.sessions.lock().await.contains_key(battle_id)
    }

    pub async fn running_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Running battles, ordered by id.
    pub async fn battles(&self) -> Vec<BattleSummary> {
        let sessions = self.sessions.lock().await;
        let mut summaries = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            let seats = entry.seats.read().await;
            summaries.push(BattleSummary {
                battle_id: entry.battle_id.clone(),
                tier: entry.challenge.tier.clone(),
                players: [entry.players[0].name.clone(), entry.players[1].name.clone()],
                seated: [
                    seats[0].as_ref().map(|c| c.id()),
                    seats[1].as_ref().map(|c| c.id()),
                ],
                state: entry.state.borrow().clone(),
                elapsed: entry.started_at.elapsed(),
            });
        }
        summaries.sort_by(|a, b| a.battle_id.cmp(&b.battle_id));
        summaries
    }

    /// Normal-completion path, run by the battle's own task.
    async fn conclude(&self, battle_id: &BattleId, serial: u64, result: BattleResult) {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(battle_id) {
                Some(entry) if entry.serial == serial => sessions.remove(battle_id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => self.finish(entry, result).await,
            None => debug!("Battle {} was already terminated", battle_id),
        }
    }

    /// Teardown shared by both termination paths. Runs exactly once per session.
    async fn finish(&self, entry: SessionEntry, result: BattleResult) {
        let SessionEntry {
            battle_id,
            seats,
            state,
            mut announced,
            started_at,
            ..
        } = entry;

        let seated: Vec<Arc<Connection>> = seats
            .write()
            .await
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for conn in &seated {
            conn.leave_battle(&battle_id).await;
        }

        state.send_replace(SessionState::from(result.clone()));

        match &result {
            BattleResult::Completed(outcome) => {
                info!("🏁 Battle {} completed: {:?}", battle_id, outcome)
            }
            BattleResult::Aborted(reason) => info!("🛑 Battle {} aborted: {}", battle_id, reason),
        }

        // Errors only if the starter went away, in which case nobody announces.
        let _ = announced.wait_for(|sent| *sent).await;
        let ended = ServerEvent::BattleEnded {
            battle_id: battle_id.clone(),
            result: result.clone(),
        };
        let report = self.plugins.dispatch(&ended).await;
        for (plugin, e) in &report.failed {
            warn!("Plugin {} failed on battle_ended for {}: {}", plugin, battle_id, e);
        }

        let conclusion = BattleConclusion {
            battle_id,
            result,
            duration: started_at.elapsed(),
        };
        if self.conclusions.send(conclusion).is_err() {
            debug!("No listener for battle conclusions");
        }
    }

    /// Give a cancelled task `terminate_grace` to wind down, then abort it.
    fn reap(&self, battle_id: BattleId, mut task: JoinHandle<()>) {
        let grace = self.terminate_grace;
        tokio::spawn(async move {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => error!("Battle {} task panicked: {}", battle_id, e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(
                        "Battle {} did not stop within {:?}; cancelling its task",
                        battle_id, grace
                    );
                    task.abort();
                }
            }
        });
    }
}

async fn seat_of(seats: &Seats, conn: &Connection) -> Option<Side> {
    let seats = seats.read().await;
    Side::BOTH.into_iter().find(|side| {
        seats[side.index()]
            .as_ref()
            .is_some_and(|seated| seated.serial() == conn.serial())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::engine::{BattleStep, EngineError, Recipient};
    use crate::connection::Outbound;
    use async_trait::async_trait;
    use battle_events::{BattleOutcome, EventVerdict, Plugin, PluginError};
    use futures::stream::{self, BoxStream, StreamExt};
    use plugin_system::{PluginLoader, PluginModule};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Engine that never finishes on its own.
    struct Stalled;

    impl RulesEngine for Stalled {
        fn run(
            &self,
            _setup: BattleSetup,
            _inputs: mpsc::UnboundedReceiver<PlayerInput>,
        ) -> BoxStream<'static, Result<BattleStep, EngineError>> {
            stream::pending().boxed()
        }
    }

    /// Engine that greets both sides then waits for a `win` frame.
    struct FirstToWin;

    impl RulesEngine for FirstToWin {
        fn run(
            &self,
            _setup: BattleSetup,
            inputs: mpsc::UnboundedReceiver<PlayerInput>,
        ) -> BoxStream<'static, Result<BattleStep, EngineError>> {
            let hello = stream::iter([Ok(BattleStep::Send {
                to: Recipient::Both,
                frame: b"start".to_vec(),
            })]);
            let rest = stream::unfold(inputs, |mut inputs| async move {
                let input = inputs.recv().await?;
                let step = if input.frame == b"win" {
                    BattleStep::Finished(BattleOutcome::Win(input.side))
                } else {
                    BattleStep::Send {
                        to: Recipient::Side(input.side.opponent()),
                        frame: input.frame,
                    }
                };
                Some((Ok(step), inputs))
            });
            hello.chain(rest).boxed()
        }
    }

    struct Fixture {
        dispatcher: Arc<BattleDispatcher>,
        conclusions: mpsc::UnboundedReceiver<BattleConclusion>,
    }

    fn fixture(engine: impl RulesEngine + 'static, disconnect_grace: Duration) -> Fixture {
        fixture_with_plugins(
            engine,
            disconnect_grace,
            Arc::new(PluginManager::with_dylib_loader()),
        )
    }

    fn fixture_with_plugins(
        engine: impl RulesEngine + 'static,
        disconnect_grace: Duration,
        plugins: Arc<PluginManager>,
    ) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(BattleDispatcher::new(
            Arc::new(engine),
            plugins,
            tx,
            Duration::from_millis(100),
            disconnect_grace,
        ));
        Fixture {
            dispatcher,
            conclusions: rx,
        }
    }

    fn connection(id: u32) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(ConnectionId(id), "127.0.0.1:7000".parse().unwrap(), tx);
        (Arc::new(conn), rx)
    }

    fn request(battle_id: &str, a: &Connection, b: &Connection) -> BattleRequest {
        BattleRequest {
            server_id: a.id(),
            battle_id: BattleId::from(battle_id),
            players: [
                BattlePlayer::new(a.id(), "red"),
                BattlePlayer::new(b.id(), "blue"),
            ],
            challenge: ChallengeInfo::new("ou"),
            teams: [TeamBattle::default(), TeamBattle::default()],
        }
    }

    #[tokio::test]
    async fn completes_and_releases_both_connections() {
        let mut fx = fixture(FirstToWin, Duration::from_secs(5));
        let (a, mut a_rx) = connection(0);
        let (b, mut b_rx) = connection(1);

        let mut handle = fx
            .dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await
            .unwrap();

        assert_eq!(a_rx.recv().await, Some(Outbound::Frame(b"start".to_vec())));
        assert_eq!(b_rx.recv().await, Some(Outbound::Frame(b"start".to_vec())));

        assert!(fx.dispatcher.forward_input(&a, b"hi".to_vec()).await);
        assert_eq!(b_rx.recv().await, Some(Outbound::Frame(b"hi".to_vec())));

        assert!(fx.dispatcher.forward_input(&b, b"win".to_vec()).await);
        assert_eq!(
            handle.finished().await,
            BattleResult::Completed(BattleOutcome::Win(Side::B))
        );

        let conclusion = fx.conclusions.recv().await.unwrap();
        assert_eq!(conclusion.battle_id, BattleId::from("b1"));
        assert!(conclusion.result.is_completed());
        assert_eq!(a.battle().await, None);
        assert_eq!(b.battle().await, None);
        assert!(!fx.dispatcher.is_running(&BattleId::from("b1")).await);
    }

    #[tokio::test]
    async fn rejects_duplicates_and_busy_players() {
        let fx = fixture(Stalled, Duration::from_secs(5));
        let (a, _a_rx) = connection(0);
        let (b, _b_rx) = connection(1);
        let (c, _c_rx) = connection(2);

        fx.dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await
            .unwrap();

        let dup = fx
            .dispatcher
            .start_battle(request("b1", &c, &c), [c.clone(), c.clone()], "sqlite".into())
            .await;
        assert_eq!(dup.err(), Some(BattleError::DuplicateBattle(BattleId::from("b1"))));

        let busy = fx
            .dispatcher
            .start_battle(request("b2", &a, &c), [a.clone(), c.clone()], "sqlite".into())
            .await;
        assert_eq!(
            busy.err(),
            Some(BattleError::AlreadyBattling {
                connection: ConnectionId(0),
                battle: BattleId::from("b1"),
            })
        );
        assert_eq!(c.battle().await, None);
        assert_eq!(fx.dispatcher.running_count().await, 1);
    }

    #[tokio::test]
    async fn force_terminate_wins_exactly_once() {
        let mut fx = fixture(Stalled, Duration::from_secs(5));
        let (a, _a_rx) = connection(0);
        let (b, _b_rx) = connection(1);
        let id = BattleId::from("b1");

        let mut handle = fx
            .dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await
            .unwrap();
        assert_eq!(handle.state(), SessionState::Running);

        let reason = AbortReason::Administrative("test".into());
        let (first, second) = tokio::join!(
            fx.dispatcher.force_terminate(&id, reason.clone()),
            fx.dispatcher.force_terminate(&id, reason.clone()),
        );
        assert!(first ^ second);
        assert_eq!(handle.finished().await, BattleResult::Aborted(reason));
        assert!(!fx.dispatcher.force_terminate(&id, AbortReason::Shutdown).await);

        assert!(fx.conclusions.recv().await.unwrap().result.is_aborted());
        assert!(fx.conclusions.try_recv().is_err());
        assert_eq!(a.battle().await, None);
    }

    #[tokio::test]
    async fn engine_ending_without_outcome_aborts() {
        struct Quits;
        impl RulesEngine for Quits {
            fn run(
                &self,
                _setup: BattleSetup,
                _inputs: mpsc::UnboundedReceiver<PlayerInput>,
            ) -> BoxStream<'static, Result<BattleStep, EngineError>> {
                stream::empty().boxed()
            }
        }

        let fx = fixture(Quits, Duration::from_secs(5));
        let (a, _a_rx) = connection(0);
        let (b, _b_rx) = connection(1);
        let mut handle = fx
            .dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await
            .unwrap();

        assert_eq!(
            handle.finished().await,
            BattleResult::Aborted(AbortReason::EngineStopped)
        );
    }

    #[tokio::test]
    async fn vacated_seat_can_be_rejoined() {
        let fx = fixture(FirstToWin, Duration::from_secs(30));
        let (a, _a_rx) = connection(0);
        let (b, mut b_rx) = connection(1);
        let (a2, mut a2_rx) = connection(2);
        let id = BattleId::from("b1");

        let mut handle = fx
            .dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await
            .unwrap();
        assert_eq!(b_rx.recv().await, Some(Outbound::Frame(b"start".to_vec())));

        assert_eq!(fx.dispatcher.vacate_seat(&a).await, Some((id.clone(), Side::A)));
        assert_eq!(a.battle().await, None);
        assert!(fx.dispatcher.is_running(&id).await);

        let occupied = fx.dispatcher.rejoin(&id, Side::B, a2.clone()).await;
        assert!(matches!(occupied, Err(BattleError::Invalid(_))));

        fx.dispatcher.rejoin(&id, Side::A, a2.clone()).await.unwrap();
        assert_eq!(a2.battle().await, Some(id.clone()));

        assert!(fx.dispatcher.forward_input(&b, b"hello again".to_vec()).await);
        assert_eq!(a2_rx.recv().await, Some(Outbound::Frame(b"hello again".to_vec())));

        assert!(fx.dispatcher.forward_input(&a2, b"win".to_vec()).await);
        assert_eq!(
            handle.finished().await,
            BattleResult::Completed(BattleOutcome::Win(Side::A))
        );
    }

    #[tokio::test]
    async fn vacant_seat_times_out() {
        let fx = fixture(Stalled, Duration::from_millis(50));
        let (a, _a_rx) = connection(0);
        let (b, _b_rx) = connection(1);

        let mut handle = fx
            .dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await
            .unwrap();
        fx.dispatcher.vacate_seat(&b).await.unwrap();

        assert_eq!(
            handle.finished().await,
            BattleResult::Aborted(AbortReason::RejoinTimeout(Side::B))
        );
        assert_eq!(a.battle().await, None);
    }

    /// Holds `battle_started` for battle `slow` until released.
    struct SlowAnnouncer {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        journal: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for SlowAnnouncer {
        fn name(&self) -> &str {
            "slow_announcer"
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        async fn on_event(&mut self, event: &ServerEvent) -> Result<EventVerdict, PluginError> {
            match event {
                ServerEvent::BattleStarted { battle_id, .. } => {
                    if *battle_id == BattleId::from("slow") {
                        self.entered.notify_one();
                        self.release.notified().await;
                    }
                    self.journal.lock().unwrap().push(format!("started:{battle_id}"));
                }
                ServerEvent::BattleEnded { battle_id, .. } => {
                    self.journal.lock().unwrap().push(format!("ended:{battle_id}"));
                }
                _ => {}
            }
            Ok(EventVerdict::Continue)
        }
    }

    /// Hands out one prepared plugin.
    struct Preloaded(StdMutex<Option<Box<dyn Plugin>>>);

    impl PluginLoader for Preloaded {
        fn load(&self, path: &Path) -> Result<PluginModule, PluginError> {
            let plugin = self
                .0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| PluginError::LoadError("already taken".to_string()))?;
            Ok(PluginModule::in_process(plugin, path))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_announcement_does_not_stall_other_battles() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let journal = Arc::new(StdMutex::new(Vec::new()));
        let announcer: Box<dyn Plugin> = Box::new(SlowAnnouncer {
            entered: entered.clone(),
            release: release.clone(),
            journal: journal.clone(),
        });
        let plugins = Arc::new(PluginManager::new(Arc::new(Preloaded(StdMutex::new(Some(
            announcer,
        ))))));
        plugins.load("slow_announcer").await.unwrap();
        let fx = fixture_with_plugins(FirstToWin, Duration::from_secs(5), plugins);

        let (a, _a_rx) = connection(0);
        let (b, mut b_rx) = connection(1);
        let (c, _c_rx) = connection(2);
        let (d, _d_rx) = connection(3);
        fx.dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await
            .unwrap();
        assert_eq!(b_rx.recv().await, Some(Outbound::Frame(b"start".to_vec())));

        let starting = {
            let dispatcher = fx.dispatcher.clone();
            let (c, d) = (c.clone(), d.clone());
            tokio::spawn(async move {
                dispatcher
                    .start_battle(request("slow", &c, &d), [c.clone(), d.clone()], "sqlite".into())
                    .await
            })
        };
        entered.notified().await;

        // The running battle keeps taking input while `slow` is announced.
        let forwarded = tokio::time::timeout(
            Duration::from_secs(1),
            fx.dispatcher.forward_input(&a, b"hi".to_vec()),
        )
        .await
        .expect("input stalled behind a plugin");
        assert!(forwarded);
        assert_eq!(b_rx.recv().await, Some(Outbound::Frame(b"hi".to_vec())));

        // Terminated mid-announcement: the end is still reported after the start.
        let terminating = {
            let dispatcher = fx.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .force_terminate(&BattleId::from("slow"), AbortReason::Shutdown)
                    .await
            })
        };
        wait_until_gone(&fx.dispatcher, "slow").await;
        release.notify_one();

        assert!(terminating.await.unwrap());
        let mut handle = starting.await.unwrap().unwrap();
        assert_eq!(
            handle.finished().await,
            BattleResult::Aborted(AbortReason::Shutdown)
        );
        assert_eq!(c.battle().await, None);

        let journal = journal.lock().unwrap().clone();
        let started = journal.iter().position(|e| e == "started:slow").unwrap();
        let ended = journal.iter().position(|e| e == "ended:slow").unwrap();
        assert!(started < ended, "{journal:?}");
    }

    async fn wait_until_gone(dispatcher: &BattleDispatcher, battle: &str) {
        let id = BattleId::from(battle);
        tokio::time::timeout(Duration::from_secs(1), async {
            while dispatcher.is_running(&id).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("battle still registered");
    }

    #[tokio::test]
    async fn closed_connection_is_never_bound() {
        let fx = fixture(Stalled, Duration::from_secs(5));
        let (a, _a_rx) = connection(0);
        let (b, _b_rx) = connection(1);

        assert!(b.mark_closed());
        let refused = fx
            .dispatcher
            .start_battle(request("b1", &a, &b), [a.clone(), b.clone()], "sqlite".into())
            .await;
        assert_eq!(refused.err(), Some(BattleError::ConnectionNotFound(ConnectionId(1))));
        assert_eq!(fx.dispatcher.battle_of(&a).await, None);
        assert_eq!(fx.dispatcher.running_count().await, 0);

        let (c, _c_rx) = connection(2);
        fx.dispatcher
            .start_battle(request("b2", &a, &c), [a.clone(), c.clone()], "sqlite".into())
            .await
            .unwrap();
        assert_eq!(fx.dispatcher.battle_of(&c).await, Some(BattleId::from("b2")));
    }
}
