use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::lobby;
use crate::model::{
    GameState, GameStatePatch, Move, MoveKind, NewMove, Player, PlayerDelta, PlayerId, Room,
    RoomId, RoomStatus,
};
use crate::store::{Change, Store, StoreError, StoreResult, Subscription};

struct RoomRecord {
    room: Room,
    roster: Vec<Player>,
    moves: Vec<Move>,
    game: Option<GameState>,
    /// Moves whose player delta has been applied.
    settled: HashSet<Uuid>,
    next_seq: u64,
    last_version: u64,
    clock: DateTime<Utc>,
    subscribers: Vec<mpsc::UnboundedSender<Change>>,
}

impl RoomRecord {
    fn new(room: Room) -> Self {
        let clock = room.created_at;
        Self {
            room,
            roster: Vec::new(),
            moves: Vec::new(),
            game: None,
            settled: HashSet::new(),
            next_seq: 1,
            last_version: 0,
            clock,
            subscribers: Vec::new(),
        }
    }

    /// Strictly increasing per-room timestamp.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock + Duration::microseconds(1)
        };
        self.clock
    }

    fn publish(&mut self, change: Change) {
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn player_mut(&mut self, player_id: PlayerId) -> StoreResult<&mut Player> {
        self.roster
            .iter_mut()
            .find(|p| p.player_id == player_id)
            .ok_or_else(|| StoreError::NotFound(format!("player {}", player_id)))
    }
}

/// In-process store. Every operation runs under one lock, so writes are
/// atomic and notifications leave in commit order.
pub struct MemoryStore {
    rooms: Mutex<HashMap<RoomId, RoomRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn room_not_found(room_id: RoomId) -> StoreError {
    StoreError::NotFound(format!("room {}", room_id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_room(&self, room: Room) -> StoreResult<Room> {
        let mut rooms = self.rooms.lock().await;
        let code = lobby::normalize_join_code(&room.code);
        if rooms.values().any(|r| r.room.code == code) {
            return Err(StoreError::Conflict(format!("join code {} in use", code)));
        }
        if rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict(format!("room {} exists", room.id)));
        }
        let room = Room {
            code,
            max_players: lobby::clamp_max_players(room.max_players),
            ..room
        };
        rooms.insert(room.id, RoomRecord::new(room.clone()));
        Ok(room)
    }

    async fn room(&self, room_id: RoomId) -> StoreResult<Option<Room>> {
        Ok(self.rooms.lock().await.get(&room_id).map(|r| r.room.clone()))
    }

    async fn find_room_by_code(&self, code: &str) -> StoreResult<Option<Room>> {
        let code = lobby::normalize_join_code(code);
        Ok(self
            .rooms
            .lock()
            .await
            .values()
            .find(|r| r.room.code == code)
            .map(|r| r.room.clone()))
    }

    async fn update_room_status(
        &self,
        room_id: RoomId,
        status: RoomStatus,
        expected: Option<RoomStatus>,
    ) -> StoreResult<Room> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(room_id))?;
        if let Some(expected) = expected {
            if record.room.status != expected {
                return Err(StoreError::Conflict(format!(
                    "room status is {:?}, expected {:?}",
                    record.room.status, expected
                )));
            }
        }
        record.room.status = status;
        let room = record.room.clone();
        record.publish(Change::RoomUpdated(room.clone()));
        Ok(room)
    }

    async fn roster(&self, room_id: RoomId) -> StoreResult<Vec<Player>> {
        let rooms = self.rooms.lock().await;
        let record = rooms.get(&room_id).ok_or_else(|| room_not_found(room_id))?;
        Ok(record.roster.clone())
    }

    async fn insert_player(&self, player: Player) -> StoreResult<Player> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms
            .get_mut(&player.room_id)
            .ok_or_else(|| room_not_found(player.room_id))?;
        if record.roster.iter().any(|p| p.player_id == player.player_id) {
            return Err(StoreError::Conflict(format!(
                "player {} already in room",
                player.player_id
            )));
        }
        if record.roster.len() >= usize::from(record.room.max_players) {
            return Err(StoreError::Rejected("room full".into()));
        }
        let player = Player {
            joined_at: record.stamp(),
            ..player
        };
        record.roster.push(player.clone());
        record.publish(Change::PlayerJoined(player.clone()));
        Ok(player)
    }

    async fn remove_player(&self, room_id: RoomId, player_id: PlayerId) -> StoreResult<()> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(room_id))?;
        if !record.roster.iter().any(|p| p.player_id == player_id) {
            return Err(StoreError::NotFound(format!("player {}", player_id)));
        }

        let next_host = lobby::next_host(&record.room, &record.roster, player_id);
        record.roster.retain(|p| p.player_id != player_id);
        record.publish(Change::PlayerLeft { room_id, player_id });

        match next_host {
            Some(host) if host != record.room.host_id => {
                record.room.host_id = host;
                let room = record.room.clone();
                record.publish(Change::RoomUpdated(room));
            }
            Some(_) => {}
            None => {
                record.publish(Change::RoomDeleted { room_id });
                rooms.remove(&room_id);
            }
        }
        Ok(())
    }

    async fn update_player(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        delta: PlayerDelta,
    ) -> StoreResult<Player> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(room_id))?;
        let settled = delta.move_id.is_some_and(|id| record.settled.contains(&id));
        let player = record.player_mut(player_id)?;
        if settled {
            return Ok(player.clone());
        }
        delta.apply(player);
        let player = player.clone();
        if let Some(id) = delta.move_id {
            record.settled.insert(id);
        }
        record.publish(Change::PlayerUpdated(player.clone()));
        Ok(player)
    }

    async fn reset_roster(&self, room_id: RoomId, lives: u8, score: u32) -> StoreResult<Vec<Player>> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(room_id))?;
        for p in record.roster.iter_mut() {
            p.lives = lives;
            p.score = score;
        }
        let roster = record.roster.clone();
        for p in &roster {
            record.publish(Change::PlayerUpdated(p.clone()));
        }
        Ok(roster)
    }

    async fn insert_move(&self, mv: NewMove) -> StoreResult<Move> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms
            .get_mut(&mv.room_id)
            .ok_or_else(|| room_not_found(mv.room_id))?;

        if mv.kind == MoveKind::AllFailed
            && record.moves.iter().any(|m| {
                m.kind == MoveKind::AllFailed && m.round == mv.round && m.target == mv.target
            })
        {
            return Err(StoreError::Conflict(format!(
                "all_failed already recorded for round {}",
                mv.round
            )));
        }

        let stored = Move {
            id: Uuid::new_v4(),
            room_id: mv.room_id,
            player_id: mv.player_id,
            kind: mv.kind,
            target: mv.target,
            correct: mv.correct,
            round: mv.round,
            seq: record.next_seq,
            created_at: record.stamp(),
        };
        record.next_seq += 1;
        record.moves.push(stored.clone());
        record.publish(Change::MoveInserted(stored.clone()));
        Ok(stored)
    }

    async fn moves(&self, room_id: RoomId) -> StoreResult<Vec<Move>> {
        let rooms = self.rooms.lock().await;
        let record = rooms.get(&room_id).ok_or_else(|| room_not_found(room_id))?;
        Ok(record.moves.clone())
    }

    async fn clear_moves(&self, room_id: RoomId) -> StoreResult<()> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(room_id))?;
        record.moves.clear();
        record.settled.clear();
        record.publish(Change::MovesCleared { room_id });
        Ok(())
    }

    async fn put_game_state(&self, state: GameState) -> StoreResult<GameState> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms
            .get_mut(&state.room_id)
            .ok_or_else(|| room_not_found(state.room_id))?;
        record.last_version += 1;
        let state = GameState {
            version: record.last_version,
            updated_at: record.stamp(),
            ..state
        };
        record.game = Some(state.clone());
        record.publish(Change::GameStateChanged(state.clone()));
        Ok(state)
    }

    async fn game_state(&self, room_id: RoomId) -> StoreResult<Option<GameState>> {
        let rooms = self.rooms.lock().await;
        let record = rooms.get(&room_id).ok_or_else(|| room_not_found(room_id))?;
        Ok(record.game.clone())
    }

    async fn update_game_state(&self, room_id: RoomId, patch: GameStatePatch) -> StoreResult<GameState> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(room_id))?;
        let current_version = match &record.game {
            Some(game) => game.version,
            None => return Err(StoreError::NotFound(format!("game state for room {}", room_id))),
        };
        if let Some(expected) = patch.expected_version {
            if expected != current_version {
                return Err(StoreError::Conflict(format!(
                    "game state version {} (expected {})",
                    current_version, expected
                )));
            }
        }
        record.last_version += 1;
        let version = record.last_version;
        let updated_at = record.stamp();
        let state = match record.game.as_mut() {
            Some(game) => {
                patch.apply(game);
                game.version = version;
                game.updated_at = updated_at;
                game.clone()
            }
            None => return Err(StoreError::NotFound(format!("game state for room {}", room_id))),
        };
        record.publish(Change::GameStateChanged(state.clone()));
        Ok(state)
    }

    async fn subscribe(&self, room_id: RoomId) -> StoreResult<Subscription> {
        let mut rooms = self.rooms.lock().await;
        let record = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(room_id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        record.subscribers.push(tx);
        Ok(Subscription::new(room_id, rx))
    }
}
