use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::model::{
    GameState, GameStatePatch, Move, NewMove, Player, PlayerDelta, PlayerId, Room, RoomId,
    RoomStatus,
};
use crate::store::{Change, StoreError};

pub const PROTOCOL_VERSION: &str = "0.1.0";

// -- Framing --

pub type Transport = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed_transport(stream: TcpStream) -> Transport {
    LengthDelimitedCodec::builder()
        .max_frame_length(64 * 1024)
        .new_framed(stream)
}

// -- Store operations --

/// One store call, mirroring the `Store` trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreRequest {
    CreateRoom(Room),
    Room {
        room_id: RoomId,
    },
    FindRoomByCode {
        code: String,
    },
    UpdateRoomStatus {
        room_id: RoomId,
        status: RoomStatus,
        expected: Option<RoomStatus>,
    },

    Roster {
        room_id: RoomId,
    },
    InsertPlayer(Player),
    RemovePlayer {
        room_id: RoomId,
        player_id: PlayerId,
    },
    UpdatePlayer {
        room_id: RoomId,
        player_id: PlayerId,
        delta: PlayerDelta,
    },
    ResetRoster {
        room_id: RoomId,
        lives: u8,
        score: u32,
    },

    InsertMove(NewMove),
    Moves {
        room_id: RoomId,
    },
    ClearMoves {
        room_id: RoomId,
    },

    PutGameState(GameState),
    GameState {
        room_id: RoomId,
    },
    UpdateGameState {
        room_id: RoomId,
        patch: GameStatePatch,
    },

    Subscribe {
        room_id: RoomId,
    },
    Unsubscribe {
        room_id: RoomId,
    },
}

impl StoreRequest {
    pub fn name(&self) -> &'static str {
        match self {
            StoreRequest::CreateRoom(_) => "create_room",
            StoreRequest::Room { .. } => "room",
            StoreRequest::FindRoomByCode { .. } => "find_room_by_code",
            StoreRequest::UpdateRoomStatus { .. } => "update_room_status",
            StoreRequest::Roster { .. } => "roster",
            StoreRequest::InsertPlayer(_) => "insert_player",
            StoreRequest::RemovePlayer { .. } => "remove_player",
            StoreRequest::UpdatePlayer { .. } => "update_player",
            StoreRequest::ResetRoster { .. } => "reset_roster",
            StoreRequest::InsertMove(_) => "insert_move",
            StoreRequest::Moves { .. } => "moves",
            StoreRequest::ClearMoves { .. } => "clear_moves",
            StoreRequest::PutGameState(_) => "put_game_state",
            StoreRequest::GameState { .. } => "game_state",
            StoreRequest::UpdateGameState { .. } => "update_game_state",
            StoreRequest::Subscribe { .. } => "subscribe",
            StoreRequest::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreReply {
    Done,
    Room(Option<Room>),
    Roster(Vec<Player>),
    Player(Player),
    Move(Move),
    Moves(Vec<Move>),
    GameState(Option<GameState>),
    Subscribed { room_id: RoomId },
}

impl StoreReply {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreReply::Done => "done",
            StoreReply::Room(_) => "room",
            StoreReply::Roster(_) => "roster",
            StoreReply::Player(_) => "player",
            StoreReply::Move(_) => "move",
            StoreReply::Moves(_) => "moves",
            StoreReply::GameState(_) => "game_state",
            StoreReply::Subscribed { .. } => "subscribed",
        }
    }
}

// -- Client -> Server Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    // Handshake
    Hello {
        user_id: PlayerId,
        version: String,
    },

    Request {
        request_id: u64,
        request: StoreRequest,
    },

    // Connection
    Ping,
    Disconnect,
}

// -- Server -> Client Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    // Handshake
    Welcome {
        user_id: PlayerId,
        server_version: String,
    },
    HandshakeError {
        reason: String,
    },

    Response {
        request_id: u64,
        result: Result<StoreReply, StoreError>,
    },
    /// Pushed for every room the connection subscribed to.
    Change(Change),

    // Connection
    Pong,
}

// -- Serialization helpers --

pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    Ok(Bytes::from(json))
}

pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    data: &[u8],
) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}

// -- Transport helpers --

pub async fn send_message<T: Serialize>(
    transport: &mut Transport,
    msg: &T,
) -> anyhow::Result<()> {
    let bytes = serialize_message(msg).map_err(|e| anyhow::anyhow!("serialize error: {}", e))?;
    transport
        .send(bytes)
        .await
        .map_err(|e| anyhow::anyhow!("send error: {}", e))
}

pub async fn recv_message<T: for<'de> Deserialize<'de>>(
    transport: &mut Transport,
) -> anyhow::Result<Option<T>> {
    match transport.next().await {
        Some(Ok(frame)) => {
            let msg = deserialize_message(&frame)
                .map_err(|e| anyhow::anyhow!("deserialize error: {}", e))?;
            Ok(Some(msg))
        }
        Some(Err(e)) => Err(anyhow::anyhow!("recv error: {}", e)),
        None => Ok(None),
    }
}
