use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::coordinator::{CoordinatorError, Intent, Outcome, RejectedMove};
use crate::driver::{Command, DriverParts, RoomDriver};
use crate::lobby::{self, JoinKind, LobbyError};
use crate::model::{
    CountryCode, GameState, Move, Player, PlayerDelta, PlayerId, Question, Room, RoomId,
    RoomStatus,
};
use crate::projection::CountryStatusMap;
use crate::store::{SharedStore, StoreError};
use crate::view::RoomView;

const CREATE_ATTEMPTS: usize = 5;

/// Read-only picture of the current room, republished after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub room: Option<Room>,
    pub roster: Vec<Player>,
    pub game_state: Option<GameState>,
    pub country_status: CountryStatusMap,
    pub attempts: BTreeSet<PlayerId>,
    pub my_turn: bool,
    /// Local countdown of the current turn.
    pub time_remaining: Option<u32>,
    /// Country everyone missed; shown until the next turn lands.
    pub failed_country: Option<CountryCode>,
    /// A local move is being resolved.
    pub resolving: bool,
}

impl SessionSnapshot {
    pub fn player(&self, player_id: PlayerId) -> Option<&Player> {
        self.roster.iter().find(|p| p.player_id == player_id)
    }

    pub fn current_turn(&self) -> Option<PlayerId> {
        self.game_state.as_ref().map(|g| g.current_turn)
    }

    pub fn status(&self) -> Option<RoomStatus> {
        self.room.as_ref().map(|r| r.status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoomUpdated(Room),
    PlayerJoined(Player),
    PlayerUpdated(Player),
    PlayerLeft(PlayerId),
    MoveRecorded(Move),
    TurnChanged {
        player_id: PlayerId,
        round: u32,
        question: Question,
    },
    AllFailed(CountryCode),
    GameStarted,
    GameFinished { winner: Option<PlayerId> },
    RoomClosed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error(transparent)]
    Rejected(#[from] RejectedMove),
    #[error("store write failed: {0}")]
    StoreWrite(#[from] StoreError),
    #[error("move recorded but the turn did not advance: {0}")]
    Rotation(StoreError),
    #[error("move recorded but score and lives were not updated: {0}")]
    PlayerUpdate(StoreError),
    #[error("already in a room")]
    AlreadyInRoom,
    #[error("question catalog is empty")]
    EmptyCatalog,
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Human-readable reason for UI surfaces.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<CoordinatorError> for SessionError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::Rejected(reason) => SessionError::Rejected(reason),
            CoordinatorError::StoreWrite(e) => SessionError::StoreWrite(e),
            CoordinatorError::Rotation(e) => SessionError::Rotation(e),
            CoordinatorError::PlayerUpdate(e) => SessionError::PlayerUpdate(e),
        }
    }
}

struct ActiveRoom {
    room_id: RoomId,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// One local player's view of the game. Lobby operations talk to the store
/// directly; moves go through the room driver so they are handled one at a
/// time against the confirmed view.
pub struct Session {
    me: PlayerId,
    name: String,
    store: SharedStore,
    config: SessionConfig,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    active: Option<ActiveRoom>,
}

impl Session {
    pub fn new(
        store: SharedStore,
        me: PlayerId,
        name: impl Into<String>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let session = Self {
            me,
            name: name.into(),
            store,
            config,
            snapshot: Arc::new(snapshot),
            events,
            active: None,
        };
        (session, events_rx)
    }

    pub fn me(&self) -> PlayerId {
        self.me
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.active.as_ref().map(|a| a.room_id)
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn room(&self) -> Option<Room> {
        self.snapshot.borrow().room.clone()
    }

    pub fn roster(&self) -> Vec<Player> {
        self.snapshot.borrow().roster.clone()
    }

    pub fn game_state(&self) -> Option<GameState> {
        self.snapshot.borrow().game_state.clone()
    }

    pub fn country_status(&self) -> CountryStatusMap {
        self.snapshot.borrow().country_status.clone()
    }

    pub fn my_turn(&self) -> bool {
        self.snapshot.borrow().my_turn
    }

    // -- Lobby --

    /// Creates a room hosted by this player and returns its join code.
    pub async fn create_room(&mut self) -> Result<String, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyInRoom);
        }
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ self.me.as_u128() as u64),
            None => StdRng::from_entropy(),
        };

        let mut attempt = 0;
        let room = loop {
            let candidate = Room {
                id: Uuid::new_v4(),
                code: lobby::generate_join_code(&mut rng),
                host_id: self.me,
                status: RoomStatus::Waiting,
                max_players: self.config.max_players,
                mode: self.config.mode,
                created_at: Utc::now(),
            };
            match self.store.create_room(candidate).await {
                Ok(room) => break room,
                Err(e) if e.is_conflict() && attempt + 1 < CREATE_ATTEMPTS => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        };

        self.store
            .insert_player(Player::new(room.id, self.me, self.name.clone(), true))
            .await?;
        tracing::info!("Created room {} ({})", room.code, room.id);
        self.attach(room.id).await?;
        Ok(room.code)
    }

    pub async fn join_room(&mut self, code: &str) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyInRoom);
        }
        let room = self
            .store
            .find_room_by_code(code)
            .await?
            .ok_or(LobbyError::RoomNotFound)?;
        let roster = self.store.roster(room.id).await?;

        match lobby::check_join(&room, &roster, self.me)? {
            JoinKind::Rejoin => {
                self.store
                    .update_player(room.id, self.me, PlayerDelta::ready(true))
                    .await?;
                tracing::info!("Rejoined room {}", room.code);
            }
            JoinKind::New => {
                let player = Player::new(room.id, self.me, self.name.clone(), false);
                match self.store.insert_player(player).await {
                    Ok(_) => tracing::info!("Joined room {}", room.code),
                    Err(StoreError::Rejected(_)) => return Err(LobbyError::RoomFull.into()),
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.attach(room.id).await
    }

    /// Stops the room driver, then removes this player from the roster.
    /// A move already being written finishes first.
    pub async fn leave_room(&mut self) -> Result<(), SessionError> {
        let active = self.active.take().ok_or(LobbyError::NotInRoom)?;
        let (reply, done) = oneshot::channel();
        if active.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        let _ = active.task.await;
        self.snapshot.send_replace(SessionSnapshot::default());

        match self.store.remove_player(active.room_id, self.me).await {
            Ok(()) => {
                tracing::info!("Left room {}", active.room_id);
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_ready(&self, ready: bool) -> Result<(), SessionError> {
        let room_id = self.room_id().ok_or(LobbyError::NotInRoom)?;
        self.store
            .update_player(room_id, self.me, PlayerDelta::ready(ready))
            .await?;
        Ok(())
    }

    /// Host only. `initial` overrides the randomly picked first question.
    pub async fn start_game(&self, initial: Option<Question>) -> Result<(), SessionError> {
        self.request(|reply| Command::Start { initial, reply }).await
    }

    // -- Moves --

    /// `Ok` means the move was recorded; the resulting state arrives through
    /// the snapshot.
    pub async fn submit_guess(&self, country: CountryCode) -> Result<(), SessionError> {
        self.submit(Intent::Guess(country)).await
    }

    pub async fn submit_timeout(&self) -> Result<(), SessionError> {
        self.submit(Intent::Timeout).await
    }

    pub async fn submit_surrender(&self) -> Result<(), SessionError> {
        self.submit(Intent::Surrender).await
    }

    async fn submit(&self, intent: Intent) -> Result<(), SessionError> {
        let outcome: Outcome = self.request(|reply| Command::Submit { intent, reply }).await?;
        tracing::debug!("Move outcome: {:?}", outcome);
        Ok(())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> Command,
    ) -> Result<T, SessionError> {
        let active = self.active.as_ref().ok_or(LobbyError::NotInRoom)?;
        let (reply, rx) = oneshot::channel();
        active
            .commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Subscribes before reading the snapshot; the view drops whatever
    /// overlaps.
    async fn attach(&mut self, room_id: RoomId) -> Result<(), SessionError> {
        let subscription = self.store.subscribe(room_id).await?;
        let room = self
            .store
            .room(room_id)
            .await?
            .ok_or(LobbyError::RoomNotFound)?;
        let roster = self.store.roster(room_id).await?;
        let game = self.store.game_state(room_id).await?;
        let moves = self.store.moves(room_id).await?;
        let view = RoomView::from_snapshot(room, roster, game, moves);

        let (commands, commands_rx) = mpsc::channel(16);
        let driver = RoomDriver::new(DriverParts {
            me: self.me,
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            view,
            subscription,
            commands: commands_rx,
            snapshot: Arc::clone(&self.snapshot),
            events: self.events.clone(),
        });
        let task = tokio::spawn(driver.run());
        self.active = Some(ActiveRoom {
            room_id,
            commands,
            task,
        });
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}
