use std::collections::{HashMap, HashSet};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use mapbattle_common::model::{PlayerId, RoomId};
use mapbattle_common::protocol::{
    self, framed_transport, serialize_message, ClientMessage, ServerMessage, PROTOCOL_VERSION,
};

use crate::handler;
use crate::server::SharedState;

pub struct ConnectionHandle {
    pub user_id: PlayerId,
    pub tx: mpsc::Sender<ServerMessage>,
    /// Rooms where this connection holds its user's roster entry.
    pub seats: HashSet<RoomId>,
    /// Change forwarders, one per subscribed room.
    pub feeds: HashMap<RoomId, JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn new(user_id: PlayerId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            user_id,
            tx,
            seats: HashSet::new(),
            feeds: HashMap::new(),
        }
    }
}

pub async fn handle_connection(stream: TcpStream, state: SharedState) -> anyhow::Result<()> {
    let mut transport = framed_transport(stream);

    // Step 1: Handshake -- expect Hello
    let hello: ClientMessage = match protocol::recv_message(&mut transport).await? {
        Some(msg) => msg,
        None => return Ok(()),
    };

    let user_id = match hello {
        ClientMessage::Hello { user_id, version } if version == PROTOCOL_VERSION => {
            tracing::info!("User {} connected (protocol {})", user_id, version);
            protocol::send_message(
                &mut transport,
                &ServerMessage::Welcome {
                    user_id,
                    server_version: env!("CARGO_PKG_VERSION").to_string(),
                },
            )
            .await?;
            user_id
        }
        ClientMessage::Hello { version, .. } => {
            protocol::send_message(
                &mut transport,
                &ServerMessage::HandshakeError {
                    reason: format!("unsupported protocol {} (server speaks {})", version, PROTOCOL_VERSION),
                },
            )
            .await?;
            return Ok(());
        }
        _ => {
            protocol::send_message(
                &mut transport,
                &ServerMessage::HandshakeError {
                    reason: "Expected Hello message".into(),
                },
            )
            .await?;
            return Ok(());
        }
    };

    // Step 2: Create mpsc channel for outbound messages
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(256);
    let conn_id = Uuid::new_v4();
    state
        .connections
        .write()
        .await
        .insert(conn_id, ConnectionHandle::new(user_id, tx));

    // Step 3: Split transport for independent read/write
    let (mut sink, mut stream) = transport.split();

    // Writer task: drains rx and writes to sink
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serialize_message(&msg) {
                Ok(bytes) => {
                    if sink.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                }
            }
        }
    });

    // Step 4: Reader loop
    loop {
        match stream.next().await {
            Some(Ok(frame)) => match protocol::deserialize_message::<ClientMessage>(&frame) {
                Ok(msg) => {
                    if let Err(e) = handler::handle_message(conn_id, msg, &state).await {
                        tracing::error!("Handler error for {}: {}", user_id, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse message from {}: {}", user_id, e);
                }
            },
            Some(Err(e)) => {
                tracing::warn!("Read error from {}: {}", user_id, e);
                break;
            }
            None => {
                tracing::info!("User {} disconnected", user_id);
                break;
            }
        }
    }

    // Cleanup
    handler::handle_disconnect(conn_id, &state).await;
    write_task.abort();
    Ok(())
}
