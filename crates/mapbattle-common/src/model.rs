use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RoomId = Uuid;
pub type PlayerId = Uuid;

pub const STARTING_LIVES: u8 = 3;
pub const CORRECT_GUESS_SCORE: u32 = 1000;
pub const TURN_SECONDS: u32 = 15;
pub const MAX_PLAYERS: u8 = 6;
pub const MIN_PLAYERS: u8 = 2;

/// ISO 3166-1 alpha-3 country code, always upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CountryCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

// -- Room --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionMode {
    /// Locate the country whose flag is shown.
    Flag,
    /// Locate the country by its name.
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub code: String,
    pub host_id: PlayerId,
    pub status: RoomStatus,
    pub max_players: u8,
    pub mode: QuestionMode,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_host(&self, player_id: PlayerId) -> bool {
        self.host_id == player_id
    }
}

// -- Roster --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub name: String,
    pub score: u32,
    pub lives: u8,
    pub ready: bool,
    pub joined_at: DateTime<Utc>,
}

impl Player {
    pub fn new(room_id: RoomId, player_id: PlayerId, name: String, ready: bool) -> Self {
        Self {
            room_id,
            player_id,
            name,
            score: 0,
            lives: STARTING_LIVES,
            ready,
            joined_at: Utc::now(),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.lives > 0
    }
}

/// Relative change applied to a roster entry by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDelta {
    pub score: i64,
    pub lives: i32,
    pub ready: Option<bool>,
    /// Move this delta settles. The store applies each move's delta once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_id: Option<Uuid>,
}

impl PlayerDelta {
    pub fn score(points: u32) -> Self {
        Self {
            score: i64::from(points),
            ..Self::default()
        }
    }

    pub fn lose_lives(count: u8) -> Self {
        Self {
            lives: -i32::from(count),
            ..Self::default()
        }
    }

    pub fn ready(ready: bool) -> Self {
        Self {
            ready: Some(ready),
            ..Self::default()
        }
    }

    pub fn for_move(self, move_id: Uuid) -> Self {
        Self {
            move_id: Some(move_id),
            ..self
        }
    }

    /// Applies the delta, clamping score and lives at zero.
    pub fn apply(&self, player: &mut Player) {
        player.score = (i64::from(player.score) + self.score).clamp(0, i64::from(u32::MAX)) as u32;
        player.lives = (i32::from(player.lives) + self.lives).clamp(0, i32::from(u8::MAX)) as u8;
        if let Some(ready) = self.ready {
            player.ready = ready;
        }
    }
}

// -- Move log --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveKind {
    Guess,
    Timeout,
    Surrender,
    AllFailed,
}

/// A move as submitted; the store assigns id, sequence and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMove {
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub kind: MoveKind,
    pub target: Option<CountryCode>,
    pub correct: bool,
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub id: Uuid,
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub kind: MoveKind,
    pub target: Option<CountryCode>,
    pub correct: bool,
    pub round: u32,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl Move {
    /// Terminal moves resolve the question they target.
    pub fn is_terminal(&self) -> bool {
        matches!(
            (self.kind, self.correct),
            (MoveKind::Guess, true) | (MoveKind::AllFailed, _)
        )
    }
}

// -- Game state --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub target: CountryCode,
    pub mode: QuestionMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub room_id: RoomId,
    pub current_turn: PlayerId,
    pub question: Question,
    pub round: u32,
    pub time_left: u32,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Rotation command. `expected_version` makes the write conditional on the
/// record not having moved since the writer last observed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStatePatch {
    pub current_turn: Option<PlayerId>,
    pub question: Option<Question>,
    pub round: Option<u32>,
    pub time_left: Option<u32>,
    pub expected_version: Option<u64>,
}

impl GameStatePatch {
    pub fn apply(&self, state: &mut GameState) {
        if let Some(turn) = self.current_turn {
            state.current_turn = turn;
        }
        if let Some(question) = &self.question {
            state.question = question.clone();
        }
        if let Some(round) = self.round {
            state.round = round;
        }
        if let Some(time_left) = self.time_left {
            state.time_left = time_left;
        }
    }
}
