use crate::model::{GameState, Move, Player, PlayerId, Room, RoomStatus};
use crate::projection::{self, Projection};
use crate::store::Change;

/// Confirmed, store-derived picture of one room.
///
/// Built from a snapshot and kept current by applying change notifications.
/// `apply` is idempotent, so notifications that overlap the snapshot or
/// arrive twice leave the view unchanged.
#[derive(Debug, Clone, Default)]
pub struct RoomView {
    pub room: Option<Room>,
    /// Join order.
    pub roster: Vec<Player>,
    pub game: Option<GameState>,
    /// Log order.
    pub moves: Vec<Move>,
    pub projection: Projection,
}

impl RoomView {
    pub fn from_snapshot(
        room: Room,
        roster: Vec<Player>,
        game: Option<GameState>,
        moves: Vec<Move>,
    ) -> Self {
        let mut view = Self {
            room: Some(room),
            roster,
            game,
            moves,
            projection: Projection::default(),
        };
        view.roster.sort_by_key(|p| p.joined_at);
        projection::sort_log(&mut view.moves);
        view.moves.dedup_by_key(|m| m.id);
        view.reproject();
        view
    }

    /// Returns whether the view changed.
    pub fn apply(&mut self, change: &Change) -> bool {
        match change {
            Change::RoomUpdated(room) => {
                if self.room.as_ref() == Some(room) {
                    return false;
                }
                self.room = Some(room.clone());
            }
            Change::RoomDeleted { .. } => {
                if self.room.is_none() {
                    return false;
                }
                *self = Self::default();
            }
            Change::PlayerJoined(player) | Change::PlayerUpdated(player) => {
                match self.roster.iter_mut().find(|p| p.player_id == player.player_id) {
                    Some(existing) if existing == player => return false,
                    Some(existing) => *existing = player.clone(),
                    None => {
                        self.roster.push(player.clone());
                        self.roster.sort_by_key(|p| p.joined_at);
                    }
                }
            }
            Change::PlayerLeft { player_id, .. } => {
                let before = self.roster.len();
                self.roster.retain(|p| p.player_id != *player_id);
                if self.roster.len() == before {
                    return false;
                }
            }
            Change::MoveInserted(mv) => {
                if self.moves.iter().any(|m| m.id == mv.id) {
                    return false;
                }
                let at = self
                    .moves
                    .partition_point(|m| projection::log_order(m, mv).is_lt());
                self.moves.insert(at, mv.clone());
                self.reproject();
            }
            Change::MovesCleared { .. } => {
                if self.moves.is_empty() {
                    return false;
                }
                self.moves.clear();
                self.reproject();
            }
            Change::GameStateChanged(state) => {
                // Older versions can arrive after a resync; keep the newest.
                if let Some(current) = &self.game {
                    if state.version <= current.version {
                        return false;
                    }
                }
                let round_changed = self.game.as_ref().map(|g| g.round) != Some(state.round);
                self.game = Some(state.clone());
                if round_changed {
                    self.reproject();
                }
            }
        }
        true
    }

    fn reproject(&mut self) {
        let round = self.game.as_ref().map(|g| g.round).unwrap_or(0);
        self.projection = projection::project(&self.moves, round);
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&Player> {
        self.roster.iter().find(|p| p.player_id == player_id)
    }

    pub fn is_playing(&self) -> bool {
        self.room.as_ref().map(|r| r.status) == Some(RoomStatus::Playing)
    }

    pub fn is_host(&self, player_id: PlayerId) -> bool {
        self.room.as_ref().is_some_and(|r| r.is_host(player_id))
    }

    pub fn eligible(&self) -> impl Iterator<Item = &Player> {
        self.roster.iter().filter(|p| p.is_eligible())
    }

    pub fn current_turn(&self) -> Option<PlayerId> {
        self.game.as_ref().map(|g| g.current_turn)
    }

    pub fn is_turn_of(&self, player_id: PlayerId) -> bool {
        self.is_playing() && self.current_turn() == Some(player_id)
    }

    /// Highest score wins; ties go to the earlier joiner.
    pub fn leader(&self) -> Option<&Player> {
        self.roster
            .iter()
            .rev()
            .max_by_key(|p| p.score)
    }
}
