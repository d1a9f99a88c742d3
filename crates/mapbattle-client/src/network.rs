use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use mapbattle_common::model::{
    GameState, GameStatePatch, Move, NewMove, Player, PlayerDelta, PlayerId, Room, RoomId,
    RoomStatus,
};
use mapbattle_common::protocol::{
    self, deserialize_message, framed_transport, serialize_message, ClientMessage, ServerMessage,
    StoreReply, StoreRequest, PROTOCOL_VERSION,
};
use mapbattle_common::store::{Change, Store, StoreError, StoreResult, Subscription};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<StoreResult<StoreReply>>>>>;
type Feeds = Arc<Mutex<HashMap<RoomId, mpsc::UnboundedSender<Change>>>>;

/// Store backed by a mapbattle server. Requests are correlated with their
/// responses by id; pushed changes are routed to the room's subscription.
pub struct RemoteStore {
    outbound: mpsc::Sender<ClientMessage>,
    pending: Pending,
    feeds: Feeds,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
}

impl RemoteStore {
    /// Connect, introduce ourselves as `user_id` and start the I/O tasks.
    pub async fn connect(addr: &str, user_id: PlayerId) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut transport = framed_transport(stream);

        protocol::send_message(
            &mut transport,
            &ClientMessage::Hello {
                user_id,
                version: PROTOCOL_VERSION.to_string(),
            },
        )
        .await?;
        match protocol::recv_message::<ServerMessage>(&mut transport).await? {
            Some(ServerMessage::Welcome { server_version, .. }) => {
                tracing::info!("Connected to {} (server {})", addr, server_version);
            }
            Some(ServerMessage::HandshakeError { reason }) => {
                anyhow::bail!("server rejected handshake: {}", reason)
            }
            Some(other) => anyhow::bail!("unexpected handshake reply: {:?}", other),
            None => anyhow::bail!("server closed the connection during handshake"),
        }

        let (mut sink, mut stream) = transport.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(64);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let feeds: Feeds = Arc::new(Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(1));
        let closed = Arc::new(AtomicBool::new(false));

        // Writer task: outbound_rx -> TCP sink
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                match serialize_message(&msg) {
                    Ok(bytes) => {
                        if sink.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize client message: {}", e);
                    }
                }
            }
        });

        // Reader task: TCP stream -> pending replies and room feeds
        let router = Router {
            outbound: outbound.clone(),
            pending: pending.clone(),
            feeds: feeds.clone(),
            next_id: next_id.clone(),
        };
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                match deserialize_message::<ServerMessage>(&frame) {
                    Ok(msg) => router.route(msg).await,
                    Err(e) => {
                        tracing::warn!("Failed to parse server message: {}", e);
                    }
                }
            }
            tracing::warn!("Connection to server lost");
            reader_closed.store(true, Ordering::SeqCst);
            router.fail_all().await;
        });

        Ok(Self {
            outbound,
            pending,
            feeds,
            next_id,
            closed,
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tell the server we are leaving so it vacates our seats right away.
    pub async fn disconnect(&self) {
        let _ = self.outbound.send(ClientMessage::Disconnect).await;
    }

    async fn call(&self, request: StoreRequest) -> StoreResult<StoreReply> {
        if self.is_closed() {
            return Err(connection_lost());
        }
        let name = request.name();
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self
            .outbound
            .send(ClientMessage::Request {
                request_id,
                request,
            })
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&request_id);
            return Err(connection_lost());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(connection_lost()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                tracing::warn!("{} #{} timed out", name, request_id);
                Err(StoreError::Unavailable(format!("{} timed out", name)))
            }
        }
    }
}

struct Router {
    outbound: mpsc::Sender<ClientMessage>,
    pending: Pending,
    feeds: Feeds,
    next_id: Arc<AtomicU64>,
}

impl Router {
    async fn route(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Response {
                request_id,
                result,
            } => {
                let waiter = self.pending.lock().await.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => tracing::debug!("Dropping late response #{}", request_id),
                }
            }
            ServerMessage::Change(change) => {
                let room_id = change.room_id();
                let mut feeds = self.feeds.lock().await;
                let Some(feed) = feeds.get(&room_id) else {
                    return;
                };
                if feed.send(change).is_err() {
                    // Subscription dropped locally; stop the server pushing.
                    feeds.remove(&room_id);
                    let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let _ = self.outbound.try_send(ClientMessage::Request {
                        request_id,
                        request: StoreRequest::Unsubscribe { room_id },
                    });
                }
            }
            ServerMessage::Pong => {}
            other => tracing::warn!("Unexpected message from server: {:?}", other),
        }
    }

    async fn fail_all(&self) {
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(connection_lost()));
        }
        // Dropping the senders ends every subscription.
        self.feeds.lock().await.clear();
    }
}

fn connection_lost() -> StoreError {
    StoreError::Unavailable("connection to server lost".into())
}

fn unexpected(reply: StoreReply) -> StoreError {
    StoreError::Unavailable(format!("unexpected reply: {}", reply.kind()))
}

#[async_trait]
impl Store for RemoteStore {
    async fn create_room(&self, room: Room) -> StoreResult<Room> {
        match self.call(StoreRequest::CreateRoom(room)).await? {
            StoreReply::Room(Some(room)) => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    async fn room(&self, room_id: RoomId) -> StoreResult<Option<Room>> {
        match self.call(StoreRequest::Room { room_id }).await? {
            StoreReply::Room(room) => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    async fn find_room_by_code(&self, code: &str) -> StoreResult<Option<Room>> {
        let request = StoreRequest::FindRoomByCode {
            code: code.to_string(),
        };
        match self.call(request).await? {
            StoreReply::Room(room) => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    async fn update_room_status(
        &self,
        room_id: RoomId,
        status: RoomStatus,
        expected: Option<RoomStatus>,
    ) -> StoreResult<Room> {
        let request = StoreRequest::UpdateRoomStatus {
            room_id,
            status,
            expected,
        };
        match self.call(request).await? {
            StoreReply::Room(Some(room)) => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    async fn roster(&self, room_id: RoomId) -> StoreResult<Vec<Player>> {
        match self.call(StoreRequest::Roster { room_id }).await? {
            StoreReply::Roster(players) => Ok(players),
            other => Err(unexpected(other)),
        }
    }

    async fn insert_player(&self, player: Player) -> StoreResult<Player> {
        match self.call(StoreRequest::InsertPlayer(player)).await? {
            StoreReply::Player(player) => Ok(player),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_player(&self, room_id: RoomId, player_id: PlayerId) -> StoreResult<()> {
        match self
            .call(StoreRequest::RemovePlayer { room_id, player_id })
            .await?
        {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn update_player(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        delta: PlayerDelta,
    ) -> StoreResult<Player> {
        let request = StoreRequest::UpdatePlayer {
            room_id,
            player_id,
            delta,
        };
        match self.call(request).await? {
            StoreReply::Player(player) => Ok(player),
            other => Err(unexpected(other)),
        }
    }

    async fn reset_roster(&self, room_id: RoomId, lives: u8, score: u32) -> StoreResult<Vec<Player>> {
        let request = StoreRequest::ResetRoster {
            room_id,
            lives,
            score,
        };
        match self.call(request).await? {
            StoreReply::Roster(players) => Ok(players),
            other => Err(unexpected(other)),
        }
    }

    async fn insert_move(&self, mv: NewMove) -> StoreResult<Move> {
        match self.call(StoreRequest::InsertMove(mv)).await? {
            StoreReply::Move(mv) => Ok(mv),
            other => Err(unexpected(other)),
        }
    }

    async fn moves(&self, room_id: RoomId) -> StoreResult<Vec<Move>> {
        match self.call(StoreRequest::Moves { room_id }).await? {
            StoreReply::Moves(moves) => Ok(moves),
            other => Err(unexpected(other)),
        }
    }

    async fn clear_moves(&self, room_id: RoomId) -> StoreResult<()> {
        match self.call(StoreRequest::ClearMoves { room_id }).await? {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn put_game_state(&self, state: GameState) -> StoreResult<GameState> {
        match self.call(StoreRequest::PutGameState(state)).await? {
            StoreReply::GameState(Some(state)) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    async fn game_state(&self, room_id: RoomId) -> StoreResult<Option<GameState>> {
        match self.call(StoreRequest::GameState { room_id }).await? {
            StoreReply::GameState(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    async fn update_game_state(&self, room_id: RoomId, patch: GameStatePatch) -> StoreResult<GameState> {
        match self
            .call(StoreRequest::UpdateGameState { room_id, patch })
            .await?
        {
            StoreReply::GameState(Some(state)) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, room_id: RoomId) -> StoreResult<Subscription> {
        // Register the feed first so changes pushed ahead of the reply land.
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().await.insert(room_id, tx);
        match self.call(StoreRequest::Subscribe { room_id }).await {
            Ok(StoreReply::Subscribed { .. }) => Ok(Subscription::new(room_id, rx)),
            Ok(other) => {
                self.feeds.lock().await.remove(&room_id);
                Err(unexpected(other))
            }
            Err(e) => {
                self.feeds.lock().await.remove(&room_id);
                Err(e)
            }
        }
    }
}
