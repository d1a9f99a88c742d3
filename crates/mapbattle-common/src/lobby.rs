use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::{Player, PlayerId, Room, RoomStatus, MAX_PLAYERS, MIN_PLAYERS};

pub const JOIN_CODE_LEN: usize = 6;
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn generate_join_code(rng: &mut impl Rng) -> String {
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn normalize_join_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn clamp_max_players(max_players: u8) -> u8 {
    max_players.clamp(MIN_PLAYERS, MAX_PLAYERS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Already on the roster; a reconnect only refreshes the ready flag.
    Rejoin,
    New,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum LobbyError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room full")]
    RoomFull,
    #[error("game already in progress")]
    GameInProgress,
    #[error("only the host can start the game")]
    NotHost,
    #[error("not enough players (need 2-6)")]
    NotEnoughPlayers,
    #[error("not all players ready")]
    NotAllReady,
    #[error("not in a room")]
    NotInRoom,
}

pub fn check_join(room: &Room, roster: &[Player], player_id: PlayerId) -> Result<JoinKind, LobbyError> {
    if roster.iter().any(|p| p.player_id == player_id) {
        return Ok(JoinKind::Rejoin);
    }
    if roster.len() >= usize::from(room.max_players) {
        return Err(LobbyError::RoomFull);
    }
    if room.status != RoomStatus::Waiting {
        return Err(LobbyError::GameInProgress);
    }
    Ok(JoinKind::New)
}

pub fn check_start(room: &Room, roster: &[Player], player_id: PlayerId) -> Result<(), LobbyError> {
    if !room.is_host(player_id) {
        return Err(LobbyError::NotHost);
    }
    if room.status == RoomStatus::Playing {
        return Err(LobbyError::GameInProgress);
    }
    if roster.len() < usize::from(MIN_PLAYERS) {
        return Err(LobbyError::NotEnoughPlayers);
    }
    if !roster.iter().all(|p| p.ready) {
        return Err(LobbyError::NotAllReady);
    }
    Ok(())
}

/// Host after `leaving` drops out: unchanged unless the host left, in which
/// case the earliest-joined remaining player takes over.
pub fn next_host(room: &Room, roster: &[Player], leaving: PlayerId) -> Option<PlayerId> {
    if room.host_id != leaving {
        return Some(room.host_id);
    }
    roster
        .iter()
        .filter(|p| p.player_id != leaving)
        .min_by_key(|p| p.joined_at)
        .map(|p| p.player_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rand::SeedableRng;
    use uuid::Uuid;

    use crate::model::QuestionMode;

    fn room(host: PlayerId, status: RoomStatus) -> Room {
        Room {
            id: Uuid::new_v4(),
            code: "ABC123".into(),
            host_id: host,
            status,
            max_players: 3,
            mode: QuestionMode::Flag,
            created_at: Utc::now(),
        }
    }

    fn roster(room: &Room, n: usize, ready: bool) -> Vec<Player> {
        let base = Utc::now();
        (0..n)
            .map(|i| {
                let id = if i == 0 { room.host_id } else { Uuid::new_v4() };
                let mut p = Player::new(room.id, id, format!("Player{}", i + 1), ready);
                p.joined_at = base + Duration::seconds(i as i64);
                p
            })
            .collect()
    }

    #[test]
    fn test_join_code_shape() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let code = generate_join_code(&mut rng);
        assert_eq!(code.len(), JOIN_CODE_LEN);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert_eq!(normalize_join_code(" abc12z "), "ABC12Z");
    }

    #[test]
    fn test_max_players_clamped() {
        assert_eq!(clamp_max_players(1), 2);
        assert_eq!(clamp_max_players(10), 6);
        assert_eq!(clamp_max_players(4), 4);
    }

    #[test]
    fn test_join_rules() {
        let r = room(Uuid::new_v4(), RoomStatus::Waiting);
        let players = roster(&r, 2, false);
        assert_eq!(check_join(&r, &players, Uuid::new_v4()), Ok(JoinKind::New));
        assert_eq!(check_join(&r, &players, players[1].player_id), Ok(JoinKind::Rejoin));

        let full = roster(&r, 3, false);
        assert_eq!(check_join(&r, &full, Uuid::new_v4()), Err(LobbyError::RoomFull));

        let playing = room(Uuid::new_v4(), RoomStatus::Playing);
        let players = roster(&playing, 2, true);
        assert_eq!(check_join(&playing, &players, Uuid::new_v4()), Err(LobbyError::GameInProgress));
        assert_eq!(check_join(&playing, &players, players[1].player_id), Ok(JoinKind::Rejoin));
    }

    #[test]
    fn test_start_rules() {
        let host = Uuid::new_v4();
        let r = room(host, RoomStatus::Waiting);

        let players = roster(&r, 1, true);
        assert_eq!(check_start(&r, &players, host), Err(LobbyError::NotEnoughPlayers));

        let mut players = roster(&r, 3, true);
        assert_eq!(check_start(&r, &players, players[1].player_id), Err(LobbyError::NotHost));
        players[2].ready = false;
        let err = check_start(&r, &players, host).unwrap_err();
        assert_eq!(err.to_string(), "not all players ready");

        players[2].ready = true;
        assert!(check_start(&r, &players, host).is_ok());

        let finished = Room {
            status: RoomStatus::Finished,
            ..r.clone()
        };
        assert!(check_start(&finished, &players, host).is_ok());
    }

    #[test]
    fn test_host_migrates_to_earliest_joined() {
        let host = Uuid::new_v4();
        let r = room(host, RoomStatus::Playing);
        let players = roster(&r, 3, true);
        assert_eq!(next_host(&r, &players, players[2].player_id), Some(host));
        assert_eq!(next_host(&r, &players, host), Some(players[1].player_id));
        assert_eq!(next_host(&r, &players[..1], host), None);
    }
}
