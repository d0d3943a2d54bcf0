//! HTTP surface: the room WebSocket endpoint and a health probe

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use confab_sfu::{ChannelId, FrameSink, FrameSource, Hub, Identity, Room, RoomId};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

pub fn create_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws/{channel_id}/{room_id}", get(ws_handler))
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub })
}

/// Identity asserted by the authenticating gateway
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

async fn ws_handler(
    Path((channel_id, room_id)): Path<(String, String)>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let channel_id = ChannelId::new(channel_id);
    let room_id = RoomId::new(room_id);

    let Some(room) = state.hub.get_room(&channel_id, &room_id) else {
        debug!(channel_id = %channel_id, room_id = %room_id, "Unknown room requested");
        return (StatusCode::NOT_FOUND, "room not found").into_response();
    };

    let identity = Identity::new(query.id, query.name, query.avatar);
    ws.on_upgrade(move |socket| handle_socket(socket, room, identity))
}

async fn handle_socket(socket: WebSocket, room: Arc<Room>, identity: Identity) {
    let (sink, stream) = socket.split();
    let (participant, handle) = room.join(identity, WsSource { stream }, WsSink { sink });

    info!(
        room_id = %room.id(),
        session = %participant.session(),
        participant = %participant.id(),
        "WebSocket connected"
    );

    let _ = tokio::join!(handle.read, handle.write);

    info!(
        room_id = %room.id(),
        session = %participant.session(),
        "WebSocket disconnected"
    );
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "channels": state.hub.channel_ids().len(),
        "rooms": state.hub.room_count(),
    }))
}

/// Inbound half of a client WebSocket
struct WsSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<confab_sfu::Result<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes())));
                }
                Some(Ok(Message::Binary(bytes))) => return Some(Ok(bytes)),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(confab_sfu::Error::Transport(format!("WebSocket error: {e}"))));
                }
                // Pings are answered by axum
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Outbound half of a client WebSocket
struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> confab_sfu::Result<()> {
        self.sink
            .send(frame_message(frame))
            .await
            .map_err(|e| confab_sfu::Error::Transport(format!("WebSocket error: {e}")))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Frames are JSON, so they go out as text without copying
fn frame_message(frame: Bytes) -> Message {
    match Utf8Bytes::try_from(frame.clone()) {
        Ok(text) => Message::Text(text),
        Err(_) => Message::Binary(frame),
    }
}
