use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use uuid::Uuid;

use crate::config::{RetryPolicy, SessionConfig};
use crate::memory_store::MemoryStore;
use crate::model::{
    CountryCode, GameState, GameStatePatch, Move, NewMove, Player, PlayerDelta, PlayerId,
    Question, QuestionMode, Room, RoomId, RoomStatus, STARTING_LIVES, TURN_SECONDS,
};
use crate::store::{Change, Store, StoreError, StoreResult, Subscription};
use crate::view::RoomView;

/// Which store call a `FlakyStore` should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    InsertMove,
    UpdatePlayer,
    UpdateGameState,
}

/// Wraps a `MemoryStore` and fails selected calls a set number of times.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    insert_move: AtomicU32,
    update_player: AtomicU32,
    update_game_state: AtomicU32,
    /// Player updates that land but report `Unavailable`, like a late reply.
    lost_player_replies: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            insert_move: AtomicU32::new(0),
            update_player: AtomicU32::new(0),
            update_game_state: AtomicU32::new(0),
            lost_player_replies: AtomicU32::new(0),
        }
    }

    pub fn lose_player_replies(&self, times: u32) {
        self.lost_player_replies.store(times, Ordering::SeqCst);
    }

    pub fn fail(&self, fault: Fault, times: u32) {
        self.counter(fault).store(times, Ordering::SeqCst);
    }

    fn counter(&self, fault: Fault) -> &AtomicU32 {
        match fault {
            Fault::InsertMove => &self.insert_move,
            Fault::UpdatePlayer => &self.update_player,
            Fault::UpdateGameState => &self.update_game_state,
        }
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        let counter = self.counter(fault);
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable(format!("injected {:?} failure", fault)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_room(&self, room: Room) -> StoreResult<Room> {
        self.inner.create_room(room).await
    }

    async fn room(&self, room_id: RoomId) -> StoreResult<Option<Room>> {
        self.inner.room(room_id).await
    }

    async fn find_room_by_code(&self, code: &str) -> StoreResult<Option<Room>> {
        self.inner.find_room_by_code(code).await
    }

    async fn update_room_status(
        &self,
        room_id: RoomId,
        status: RoomStatus,
        expected: Option<RoomStatus>,
    ) -> StoreResult<Room> {
        self.inner.update_room_status(room_id, status, expected).await
    }

    async fn roster(&self, room_id: RoomId) -> StoreResult<Vec<Player>> {
        self.inner.roster(room_id).await
    }

    async fn insert_player(&self, player: Player) -> StoreResult<Player> {
        self.inner.insert_player(player).await
    }

    async fn remove_player(&self, room_id: RoomId, player_id: PlayerId) -> StoreResult<()> {
        self.inner.remove_player(room_id, player_id).await
    }

    async fn update_player(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        delta: PlayerDelta,
    ) -> StoreResult<Player> {
        self.check(Fault::UpdatePlayer)?;
        let player = self.inner.update_player(room_id, player_id, delta).await?;
        let lost = self
            .lost_player_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StoreError::Unavailable("player update timed out".into()));
        }
        Ok(player)
    }

    async fn reset_roster(&self, room_id: RoomId, lives: u8, score: u32) -> StoreResult<Vec<Player>> {
        self.inner.reset_roster(room_id, lives, score).await
    }

    async fn insert_move(&self, mv: NewMove) -> StoreResult<Move> {
        self.check(Fault::InsertMove)?;
        self.inner.insert_move(mv).await
    }

    async fn moves(&self, room_id: RoomId) -> StoreResult<Vec<Move>> {
        self.inner.moves(room_id).await
    }

    async fn clear_moves(&self, room_id: RoomId) -> StoreResult<()> {
        self.inner.clear_moves(room_id).await
    }

    async fn put_game_state(&self, state: GameState) -> StoreResult<GameState> {
        self.inner.put_game_state(state).await
    }

    async fn game_state(&self, room_id: RoomId) -> StoreResult<Option<GameState>> {
        self.inner.game_state(room_id).await
    }

    async fn update_game_state(&self, room_id: RoomId, patch: GameStatePatch) -> StoreResult<GameState> {
        self.check(Fault::UpdateGameState)?;
        self.inner.update_game_state(room_id, patch).await
    }

    async fn subscribe(&self, room_id: RoomId) -> StoreResult<Subscription> {
        self.inner.subscribe(room_id).await
    }
}

pub fn catalog(codes: &[&str]) -> Vec<CountryCode> {
    codes.iter().map(|c| CountryCode::new(c)).collect()
}

/// Config for deterministic tests: small catalog, fast retries, no auto timeout.
pub fn test_config(codes: &[&str]) -> SessionConfig {
    SessionConfig {
        retry: RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        },
        auto_timeout: false,
        catalog: catalog(codes),
        seed: Some(11),
        ..SessionConfig::default()
    }
}

/// A room already in play, with a view kept in sync by `sync`.
pub struct Table {
    pub memory: Arc<MemoryStore>,
    pub room_id: RoomId,
    /// Join order; index 0 is the host.
    pub players: Vec<PlayerId>,
    pub view: RoomView,
    sub: Subscription,
}

impl Table {
    /// Seats `n` players and starts play with `players[turn]` holding `target`.
    pub async fn new(n: usize, turn: usize, target: &str) -> Table {
        let memory = Arc::new(MemoryStore::new());
        let players: Vec<PlayerId> = (0..n).map(|_| Uuid::new_v4()).collect();
        let room = memory
            .create_room(Room {
                id: Uuid::new_v4(),
                code: "TABLE1".into(),
                host_id: players[0],
                status: RoomStatus::Waiting,
                max_players: 6,
                mode: QuestionMode::Flag,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        for (i, id) in players.iter().enumerate() {
            memory
                .insert_player(Player::new(room.id, *id, format!("P{}", i + 1), true))
                .await
                .unwrap();
        }
        memory.reset_roster(room.id, STARTING_LIVES, 0).await.unwrap();
        memory
            .put_game_state(GameState {
                room_id: room.id,
                current_turn: players[turn],
                question: Question {
                    target: CountryCode::new(target),
                    mode: QuestionMode::Flag,
                },
                round: 1,
                time_left: TURN_SECONDS,
                version: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        memory
            .update_room_status(room.id, RoomStatus::Playing, None)
            .await
            .unwrap();

        let sub = memory.subscribe(room.id).await.unwrap();
        let view = RoomView::from_snapshot(
            memory.room(room.id).await.unwrap().unwrap(),
            memory.roster(room.id).await.unwrap(),
            memory.game_state(room.id).await.unwrap(),
            memory.moves(room.id).await.unwrap(),
        );
        Table {
            memory,
            room_id: room.id,
            players,
            view,
            sub,
        }
    }

    /// Applies every pending notification; returns them.
    pub fn sync(&mut self) -> Vec<Change> {
        let mut changes = Vec::new();
        while let Some(change) = self.sub.try_recv() {
            self.view.apply(&change);
            changes.push(change);
        }
        changes
    }

    pub fn game(&self) -> &GameState {
        self.view.game.as_ref().expect("game state")
    }

    pub fn lives(&self, player_id: PlayerId) -> u8 {
        self.view.player(player_id).map(|p| p.lives).unwrap_or(0)
    }

    pub async fn set_lives(&mut self, player_id: PlayerId, lives: u8) {
        let current = self.lives(player_id);
        let delta = PlayerDelta {
            lives: i32::from(lives) - i32::from(current),
            ..PlayerDelta::default()
        };
        self.memory
            .update_player(self.room_id, player_id, delta)
            .await
            .unwrap();
        self.sync();
    }

    pub fn all_failed_count(&self) -> usize {
        self.view
            .moves
            .iter()
            .filter(|m| m.kind == crate::model::MoveKind::AllFailed)
            .count()
    }
}

/// Log lines written while the guard returned by `capture_logs` is alive.
#[derive(Clone, Default)]
pub struct Logs(Arc<Mutex<Vec<u8>>>);

impl Logs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Logs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Logs {
    type Writer = Logs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Routes this thread's `tracing` output at debug level into a buffer.
pub fn capture_logs() -> (Logs, DefaultGuard) {
    let logs = Logs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
