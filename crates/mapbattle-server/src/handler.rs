use uuid::Uuid;

use mapbattle_common::model::{PlayerId, RoomId};
use mapbattle_common::protocol::{ClientMessage, ServerMessage, StoreReply, StoreRequest};
use mapbattle_common::store::{Store, StoreError, StoreResult};

use crate::server::SharedState;

pub async fn handle_message(
    conn_id: Uuid,
    msg: ClientMessage,
    state: &SharedState,
) -> anyhow::Result<()> {
    match msg {
        ClientMessage::Request {
            request_id,
            request,
        } => {
            let name = request.name();
            let result = handle_request(conn_id, request, state).await;
            if let Err(e) = &result {
                tracing::debug!("{} #{} failed: {}", name, request_id, e);
            }
            send_to_connection(conn_id, ServerMessage::Response { request_id, result }, state).await;
        }

        ClientMessage::Ping => {
            send_to_connection(conn_id, ServerMessage::Pong, state).await;
        }

        ClientMessage::Disconnect => {
            handle_disconnect(conn_id, state).await;
        }

        ClientMessage::Hello { user_id, .. } => {
            tracing::warn!("Ignoring repeated Hello from {}", user_id);
        }
    }

    Ok(())
}

pub async fn handle_request(
    conn_id: Uuid,
    request: StoreRequest,
    state: &SharedState,
) -> StoreResult<StoreReply> {
    let store = state.store.as_ref();
    match request {
        StoreRequest::CreateRoom(room) => store.create_room(room).await.map(|r| StoreReply::Room(Some(r))),
        StoreRequest::Room { room_id } => store.room(room_id).await.map(StoreReply::Room),
        StoreRequest::FindRoomByCode { code } => store.find_room_by_code(&code).await.map(StoreReply::Room),
        StoreRequest::UpdateRoomStatus {
            room_id,
            status,
            expected,
        } => store
            .update_room_status(room_id, status, expected)
            .await
            .map(|r| StoreReply::Room(Some(r))),

        StoreRequest::Roster { room_id } => store.roster(room_id).await.map(StoreReply::Roster),
        StoreRequest::InsertPlayer(player) => {
            let player = store.insert_player(player).await?;
            take_seat(conn_id, player.room_id, player.player_id, state).await;
            Ok(StoreReply::Player(player))
        }
        StoreRequest::RemovePlayer { room_id, player_id } => {
            store.remove_player(room_id, player_id).await?;
            leave_seat(conn_id, room_id, player_id, state).await;
            Ok(StoreReply::Done)
        }
        StoreRequest::UpdatePlayer {
            room_id,
            player_id,
            delta,
        } => store
            .update_player(room_id, player_id, delta)
            .await
            .map(StoreReply::Player),
        StoreRequest::ResetRoster {
            room_id,
            lives,
            score,
        } => store
            .reset_roster(room_id, lives, score)
            .await
            .map(StoreReply::Roster),

        StoreRequest::InsertMove(mv) => store.insert_move(mv).await.map(StoreReply::Move),
        StoreRequest::Moves { room_id } => store.moves(room_id).await.map(StoreReply::Moves),
        StoreRequest::ClearMoves { room_id } => store.clear_moves(room_id).await.map(|_| StoreReply::Done),

        StoreRequest::PutGameState(game) => store
            .put_game_state(game)
            .await
            .map(|g| StoreReply::GameState(Some(g))),
        StoreRequest::GameState { room_id } => store.game_state(room_id).await.map(StoreReply::GameState),
        StoreRequest::UpdateGameState { room_id, patch } => store
            .update_game_state(room_id, patch)
            .await
            .map(|g| StoreReply::GameState(Some(g))),

        StoreRequest::Subscribe { room_id } => subscribe(conn_id, room_id, state).await,
        StoreRequest::Unsubscribe { room_id } => {
            let mut conns = state.connections.write().await;
            if let Some(feed) = conns.get_mut(&conn_id).and_then(|c| c.feeds.remove(&room_id)) {
                feed.abort();
            }
            Ok(StoreReply::Done)
        }
    }
}

async fn subscribe(conn_id: Uuid, room_id: RoomId, state: &SharedState) -> StoreResult<StoreReply> {
    let mut sub = state.store.subscribe(room_id).await?;
    let seated = state.store.roster(room_id).await?;

    let mut conns = state.connections.write().await;
    let conn = conns
        .get_mut(&conn_id)
        .ok_or_else(|| StoreError::Unavailable("connection closed".into()))?;
    let tx = conn.tx.clone();
    let feed = tokio::spawn(async move {
        while let Some(change) = sub.recv().await {
            if tx.send(ServerMessage::Change(change)).await.is_err() {
                break;
            }
        }
    });
    if let Some(previous) = conn.feeds.insert(room_id, feed) {
        previous.abort();
    }
    // A reconnecting user takes its seat back through this connection.
    if seated.iter().any(|p| p.player_id == conn.user_id) {
        conn.seats.insert(room_id);
    }
    Ok(StoreReply::Subscribed { room_id })
}

async fn take_seat(conn_id: Uuid, room_id: RoomId, player_id: PlayerId, state: &SharedState) {
    let mut conns = state.connections.write().await;
    if let Some(conn) = conns.get_mut(&conn_id) {
        if conn.user_id == player_id {
            conn.seats.insert(room_id);
        }
    }
}

async fn leave_seat(conn_id: Uuid, room_id: RoomId, player_id: PlayerId, state: &SharedState) {
    let mut conns = state.connections.write().await;
    if let Some(conn) = conns.get_mut(&conn_id) {
        if conn.user_id == player_id {
            conn.seats.remove(&room_id);
        }
    }
}

/// Drops the connection and vacates the seats it held, unless another live
/// connection of the same user holds them too.
pub async fn handle_disconnect(conn_id: Uuid, state: &SharedState) {
    let (handle, still_held) = {
        let mut conns = state.connections.write().await;
        let Some(handle) = conns.remove(&conn_id) else {
            return;
        };
        let still_held: Vec<RoomId> = handle
            .seats
            .iter()
            .copied()
            .filter(|room_id| {
                conns
                    .values()
                    .any(|c| c.user_id == handle.user_id && c.seats.contains(room_id))
            })
            .collect();
        (handle, still_held)
    };

    for feed in handle.feeds.values() {
        feed.abort();
    }

    for room_id in handle.seats.iter().filter(|r| !still_held.contains(r)) {
        match state.store.remove_player(*room_id, handle.user_id).await {
            Ok(()) => tracing::info!("Vacated seat of {} in room {}", handle.user_id, room_id),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => tracing::warn!("Failed to vacate seat of {} in room {}: {}", handle.user_id, room_id, e),
        }
    }
}

async fn send_to_connection(conn_id: Uuid, msg: ServerMessage, state: &SharedState) {
    let tx = {
        let conns = state.connections.read().await;
        conns.get(&conn_id).map(|c| c.tx.clone())
    };
    if let Some(tx) = tx {
        let _ = tx.send(msg).await;
    }
}
