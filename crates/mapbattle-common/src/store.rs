use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{
    GameState, GameStatePatch, Move, NewMove, Player, PlayerDelta, PlayerId, Room, RoomId,
    RoomStatus,
};

/// Change notification pushed to room subscribers, in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    RoomUpdated(Room),
    RoomDeleted { room_id: RoomId },
    PlayerJoined(Player),
    PlayerUpdated(Player),
    PlayerLeft { room_id: RoomId, player_id: PlayerId },
    MoveInserted(Move),
    MovesCleared { room_id: RoomId },
    GameStateChanged(GameState),
}

impl Change {
    pub fn room_id(&self) -> RoomId {
        match self {
            Change::RoomUpdated(room) => room.id,
            Change::RoomDeleted { room_id }
            | Change::PlayerLeft { room_id, .. }
            | Change::MovesCleared { room_id } => *room_id,
            Change::PlayerJoined(p) | Change::PlayerUpdated(p) => p.room_id,
            Change::MoveInserted(mv) => mv.room_id,
            Change::GameStateChanged(state) => state.room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// A conditional write lost the race, or a uniqueness rule was hit.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered change feed for one room. Ends when the store drops the room or
/// the transport closes.
#[derive(Debug)]
pub struct Subscription {
    room_id: RoomId,
    rx: mpsc::UnboundedReceiver<Change>,
}

impl Subscription {
    pub fn new(room_id: RoomId, rx: mpsc::UnboundedReceiver<Change>) -> Self {
        Self { room_id, rx }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Change> {
        self.rx.try_recv().ok()
    }
}

/// Durable room records plus the append-only move log.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_room(&self, room: Room) -> StoreResult<Room>;
    async fn room(&self, room_id: RoomId) -> StoreResult<Option<Room>>;
    async fn find_room_by_code(&self, code: &str) -> StoreResult<Option<Room>>;
    /// Conditional on `expected` when given.
    async fn update_room_status(
        &self,
        room_id: RoomId,
        status: RoomStatus,
        expected: Option<RoomStatus>,
    ) -> StoreResult<Room>;

    /// Roster in join order.
    async fn roster(&self, room_id: RoomId) -> StoreResult<Vec<Player>>;
    async fn insert_player(&self, player: Player) -> StoreResult<Player>;
    /// Removes the entry, migrates the host and deletes the room once empty.
    async fn remove_player(&self, room_id: RoomId, player_id: PlayerId) -> StoreResult<()>;
    async fn update_player(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        delta: PlayerDelta,
    ) -> StoreResult<Player>;
    async fn reset_roster(&self, room_id: RoomId, lives: u8, score: u32) -> StoreResult<Vec<Player>>;

    async fn insert_move(&self, mv: NewMove) -> StoreResult<Move>;
    async fn moves(&self, room_id: RoomId) -> StoreResult<Vec<Move>>;
    async fn clear_moves(&self, room_id: RoomId) -> StoreResult<()>;

    /// Creates or replaces the room's game state; the version keeps counting.
    async fn put_game_state(&self, state: GameState) -> StoreResult<GameState>;
    async fn game_state(&self, room_id: RoomId) -> StoreResult<Option<GameState>>;
    async fn update_game_state(&self, room_id: RoomId, patch: GameStatePatch) -> StoreResult<GameState>;

    async fn subscribe(&self, room_id: RoomId) -> StoreResult<Subscription>;
}

pub type SharedStore = Arc<dyn Store>;
