use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::coordinator::{pending_rotation, Coordinator, Intent, Outcome};
use crate::liveness::LivenessMonitor;
use crate::lobby::{self, LobbyError};
use crate::model::{
    CountryCode, GameState, MoveKind, PlayerId, Question, RoomId, RoomStatus, STARTING_LIVES,
};
use crate::projection::CountryStatusMap;
use crate::questions::QuestionPool;
use crate::session::{SessionError, SessionEvent, SessionSnapshot};
use crate::store::{Change, SharedStore, Subscription};
use crate::view::RoomView;

pub(crate) enum Command {
    Start {
        initial: Option<Question>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Submit {
        intent: Intent,
        reply: oneshot::Sender<Result<Outcome, SessionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owns one room's view and serializes every local action against it.
pub(crate) struct RoomDriver {
    me: PlayerId,
    room_id: RoomId,
    store: SharedStore,
    config: SessionConfig,
    view: RoomView,
    coordinator: Coordinator,
    monitor: LivenessMonitor,
    subscription: Subscription,
    commands: mpsc::Receiver<Command>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    pool: QuestionPool,
    rng: StdRng,
    clock: Option<u32>,
    /// Pending move without its rotation, and when it was first seen.
    stalled: Option<(Uuid, Instant)>,
    failed_country: Option<CountryCode>,
}

pub(crate) struct DriverParts {
    pub me: PlayerId,
    pub store: SharedStore,
    pub config: SessionConfig,
    pub view: RoomView,
    pub subscription: Subscription,
    pub commands: mpsc::Receiver<Command>,
    pub snapshot: Arc<watch::Sender<SessionSnapshot>>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

impl RoomDriver {
    pub(crate) fn new(parts: DriverParts) -> Self {
        let DriverParts {
            me,
            store,
            config,
            view,
            subscription,
            commands,
            snapshot,
            events,
        } = parts;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(2)),
            None => StdRng::from_entropy(),
        };
        let clock = view
            .game
            .as_ref()
            .filter(|_| view.is_playing())
            .map(|g| g.time_left);
        Self {
            me,
            room_id: subscription.room_id(),
            coordinator: Coordinator::new(me, &config),
            monitor: LivenessMonitor::new(me, &config),
            pool: config.question_pool(),
            store,
            config,
            view,
            subscription,
            commands,
            snapshot,
            events,
            rng,
            clock,
            stalled: None,
            failed_country: None,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("Driver for room {} started", self.room_id);
        // The snapshot may predate a departure that happened while joining.
        self.check_liveness().await;
        self.publish();

        let mut tick = tokio::time::interval_at(Instant::now() + self.config.tick, self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let settle = self.coordinator.settle_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                change = self.subscription.recv() => match change {
                    Some(change) => {
                        if !self.handle_change(change).await {
                            break;
                        }
                    }
                    None => {
                        tracing::info!("Change feed for room {} closed", self.room_id);
                        self.emit(SessionEvent::RoomClosed);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(settle.unwrap_or_else(Instant::now)), if settle.is_some() => {
                    self.complete_settle().await;
                }
                _ = tick.tick() => {
                    if !self.on_tick().await {
                        break;
                    }
                }
            }
            self.publish();
        }

        self.snapshot.send_replace(SessionSnapshot::default());
        tracing::debug!("Driver for room {} stopped", self.room_id);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { initial, reply } => {
                let result = self.start_game(initial).await;
                let _ = reply.send(result);
            }
            Command::Submit { intent, reply } => {
                let result = self.submit(intent).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn submit(&mut self, intent: Intent) -> Result<Outcome, SessionError> {
        let outcome = self
            .coordinator
            .submit(self.store.as_ref(), &self.view, intent)
            .await?;
        Ok(outcome)
    }

    async fn start_game(&mut self, initial: Option<Question>) -> Result<(), SessionError> {
        let room = self.view.room.clone().ok_or(LobbyError::NotInRoom)?;
        lobby::check_start(&room, &self.view.roster, self.me)?;

        let mut question = match initial {
            Some(question) => question,
            None => self
                .pool
                .pick(&CountryStatusMap::new(), None, &mut self.rng)
                .ok_or(SessionError::EmptyCatalog)?,
        };
        question.mode = room.mode;
        let first = self
            .view
            .roster
            .choose(&mut self.rng)
            .map(|p| p.player_id)
            .ok_or(LobbyError::NotEnoughPlayers)?;

        let store = self.store.as_ref();
        store.reset_roster(room.id, STARTING_LIVES, 0).await?;
        store.clear_moves(room.id).await?;
        // Game state goes in before the status flip so nobody sees a playing
        // room with the previous game's turn.
        store
            .put_game_state(GameState {
                room_id: room.id,
                current_turn: first,
                question,
                round: 1,
                time_left: self.config.turn_seconds,
                version: 0,
                updated_at: Utc::now(),
            })
            .await?;
        store
            .update_room_status(room.id, RoomStatus::Playing, Some(room.status))
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    SessionError::Lobby(LobbyError::GameInProgress)
                } else {
                    SessionError::StoreWrite(e)
                }
            })?;
        tracing::info!(
            "Game started in room {} with {} players; {} goes first",
            room.code,
            self.view.roster.len(),
            first
        );
        Ok(())
    }

    /// Applies one notification. Returns false once the room is gone.
    async fn handle_change(&mut self, change: Change) -> bool {
        let prev_status = self.view.room.as_ref().map(|r| r.status);
        let prev_version = self.view.game.as_ref().map(|g| g.version);
        if !self.view.apply(&change) {
            return true;
        }

        match change {
            Change::RoomUpdated(room) => {
                if prev_status != Some(room.status) {
                    match room.status {
                        RoomStatus::Playing => {
                            self.coordinator.reset();
                            self.stalled = None;
                            self.failed_country = None;
                            self.clock = self.view.game.as_ref().map(|g| g.time_left);
                            self.emit(SessionEvent::GameStarted);
                        }
                        RoomStatus::Finished => {
                            self.clock = None;
                            let winner = self.view.leader().map(|p| p.player_id);
                            self.emit(SessionEvent::GameFinished { winner });
                        }
                        RoomStatus::Waiting => {}
                    }
                }
                self.emit(SessionEvent::RoomUpdated(room));
            }
            Change::RoomDeleted { .. } => {
                self.coordinator.reset();
                self.emit(SessionEvent::RoomClosed);
                return false;
            }
            Change::PlayerJoined(player) => self.emit(SessionEvent::PlayerJoined(player)),
            Change::PlayerUpdated(player) => self.emit(SessionEvent::PlayerUpdated(player)),
            Change::PlayerLeft { player_id, .. } => self.emit(SessionEvent::PlayerLeft(player_id)),
            Change::MoveInserted(mv) => {
                let current_round = self.view.game.as_ref().map(|g| g.round);
                if mv.kind == MoveKind::AllFailed && Some(mv.round) == current_round {
                    if let Some(country) = &mv.target {
                        self.failed_country = Some(country.clone());
                        self.emit(SessionEvent::AllFailed(country.clone()));
                    }
                }
                self.emit(SessionEvent::MoveRecorded(mv));
            }
            Change::MovesCleared { .. } => self.failed_country = None,
            Change::GameStateChanged(state) => {
                if prev_version != Some(state.version) {
                    self.failed_country = None;
                    self.stalled = None;
                    self.clock = self.view.is_playing().then_some(state.time_left);
                    self.emit(SessionEvent::TurnChanged {
                        player_id: state.current_turn,
                        round: state.round,
                        question: state.question,
                    });
                }
            }
        }

        self.coordinator.observe(&self.view);
        self.check_liveness().await;
        true
    }

    async fn check_liveness(&mut self) {
        match self.monitor.act(self.store.as_ref(), &self.view).await {
            Ok(Some(desync)) => tracing::debug!("Corrected room {}: {:?}", self.room_id, desync),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Liveness correction in room {} failed: {}", self.room_id, e);
                self.emit(SessionEvent::Error(format!("liveness correction failed: {}", e)));
            }
        }
    }

    async fn complete_settle(&mut self) {
        if let Err(e) = self
            .coordinator
            .complete_all_failed(self.store.as_ref(), &self.view)
            .await
        {
            tracing::warn!("Rotation after all-failed in room {} failed: {}", self.room_id, e);
            self.emit(SessionEvent::Error(e.to_string()));
        }
    }

    /// Returns false once a resync finds the room gone.
    async fn on_tick(&mut self) -> bool {
        let now = Instant::now();
        if self.coordinator.expire(now) && !self.resync().await {
            return false;
        }

        if let Some(left) = self.clock.as_mut() {
            *left = left.saturating_sub(1);
        }
        if self.config.auto_timeout
            && self.clock == Some(0)
            && self.view.is_turn_of(self.me)
            && !self.coordinator.is_busy()
            && pending_rotation(&self.view).is_none()
        {
            self.clock = None;
            tracing::info!("Turn clock ran out in room {}; submitting timeout", self.room_id);
            if let Err(e) = self.submit(Intent::Timeout).await {
                tracing::warn!("Timeout submission failed: {}", e);
                self.emit(SessionEvent::Error(e.reason()));
            }
        }

        self.check_stalled(now).await;
        true
    }

    /// Any client rotates for a holder whose move has waited too long.
    async fn check_stalled(&mut self, now: Instant) {
        let Some(mv) = pending_rotation(&self.view) else {
            self.stalled = None;
            return;
        };
        let since = match self.stalled {
            Some((id, since)) if id == mv.id => since,
            _ => {
                self.stalled = Some((mv.id, now));
                return;
            }
        };
        let mut threshold = self.config.stale_after;
        if mv.kind == MoveKind::AllFailed {
            threshold += self.config.settle_delay;
        }
        if now.duration_since(since) < threshold {
            return;
        }

        let stalled_id = mv.id;
        match self.coordinator.recover(self.store.as_ref(), &self.view).await {
            Ok(_) => self.stalled = None,
            Err(e) => {
                tracing::warn!("Recovery in room {} failed: {}", self.room_id, e);
                self.stalled = Some((stalled_id, now));
            }
        }
    }

    async fn resync(&mut self) -> bool {
        let store = Arc::clone(&self.store);
        let mut changes = Vec::new();
        match store.room(self.room_id).await {
            Ok(Some(room)) => changes.push(Change::RoomUpdated(room)),
            Ok(None) => changes.push(Change::RoomDeleted { room_id: self.room_id }),
            Err(e) => tracing::warn!("Resync of room {} failed: {}", self.room_id, e),
        }
        if let Ok(moves) = store.moves(self.room_id).await {
            changes.extend(moves.into_iter().map(Change::MoveInserted));
        }
        if let Ok(Some(state)) = store.game_state(self.room_id).await {
            changes.push(Change::GameStateChanged(state));
        }
        for change in changes {
            if !self.handle_change(change).await {
                return false;
            }
        }
        true
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let view = &self.view;
        let playing = view.is_playing();
        let next = SessionSnapshot {
            room: view.room.clone(),
            roster: view.roster.clone(),
            game_state: view.game.clone(),
            country_status: view.projection.country_status.clone(),
            attempts: view.projection.attempts.clone(),
            my_turn: view.is_turn_of(self.me),
            time_remaining: if playing { self.clock } else { None },
            failed_country: self.failed_country.clone(),
            resolving: self.coordinator.is_busy(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
