//! Connection handlers for Murmur server.
//!
//! This module handles the connection lifecycle and frame processing: the
//! `connect` handshake, the per-connection event loop and the disconnect
//! cascade.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_core::{
    outbox, ChatError, Collaborators, ConnectionId, Hub, Identity, IdentityProvider, Inbox,
};
use murmur_core::identity::now_millis;
use murmur_core::memory::TrustedTokenProvider;
use murmur_protocol::{
    codec, codes, ClientFrame, DirectMessage, Encoded, Encoding, RoomMessage, ServerFrame,
    PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Shared server state.
pub struct AppState {
    /// The chat hub.
    pub hub: Hub,
    /// Resolves connect tokens to identities.
    pub identities: Arc<dyn IdentityProvider>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state backed by in-memory collaborators.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Hub::new(Collaborators::in_memory(), config.hub()),
            identities: Arc::new(TrustedTokenProvider),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Murmur server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
    }))
}

/// Hub statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.hub.stats())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let active = state.hub.registry().connection_count();
    if active >= state.config.limits.max_connections {
        warn!(active, "Connection limit reached, refusing upgrade");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Write half of a connection, answering in the client's encoding.
struct Connection {
    id: ConnectionId,
    encoding: Encoding,
    sink: WsSink,
}

impl Connection {
    async fn send(&mut self, frame: &ServerFrame) -> Result<()> {
        send_encoded(&mut self.sink, self.encoding, frame).await
    }
}

async fn send_encoded(sink: &mut WsSink, encoding: Encoding, frame: &ServerFrame) -> Result<()> {
    let message = match encoding.encode(frame)? {
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
        Encoded::Text(text) => Message::Text(text),
    };
    let size = match &message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    };
    metrics::record_frame(size, "outbound");
    sink.send(message).await?;
    Ok(())
}

/// First frame of a connection, with what it arrived in.
struct Opening {
    encoding: Encoding,
    frame: Result<ClientFrame, codec::ProtocolError>,
    /// Binary bytes received past the first frame.
    rest: BytesMut,
}

/// Read until the first complete client frame.
///
/// Binary input is a length-prefixed stream, so a frame may span messages
/// and a message may carry several frames. Returns `None` if the socket
/// closed or stayed silent past `deadline`.
async fn read_opening(
    stream: &mut WsStream,
    connection_id: &ConnectionId,
    deadline: Duration,
) -> Option<Opening> {
    let expires = tokio::time::Instant::now() + deadline;
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let message = match tokio::time::timeout_at(expires, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                warn!(connection = %connection_id, error = %e, "WebSocket error during handshake");
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                debug!(connection = %connection_id, "No connect frame before timeout");
                return None;
            }
        };

        match message {
            Message::Binary(data) => {
                metrics::record_frame(data.len(), "inbound");
                let Some(frame) = buffer_opening(&mut buffer, &data) else {
                    continue;
                };
                return Some(Opening {
                    encoding: Encoding::MessagePack,
                    frame,
                    rest: buffer,
                });
            }
            Message::Text(text) => {
                metrics::record_frame(text.len(), "inbound");
                return Some(Opening {
                    encoding: Encoding::Json,
                    frame: codec::decode_json(&text),
                    rest: buffer,
                });
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

/// Append binary input and take the first frame once it is complete.
fn buffer_opening(
    buffer: &mut BytesMut,
    data: &[u8],
) -> Option<Result<ClientFrame, codec::ProtocolError>> {
    buffer.extend_from_slice(data);
    codec::decode_from::<ClientFrame>(buffer).transpose()
}

/// Wait for the `connect` frame and resolve its token.
///
/// Returns the identity, the client's encoding and any binary bytes that
/// followed the `connect` frame. On rejection the error frame has already
/// been sent.
async fn handshake(
    stream: &mut WsStream,
    sink: &mut WsSink,
    state: &AppState,
    connection_id: &ConnectionId,
) -> Option<(Identity, Encoding, BytesMut)> {
    let deadline = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let Opening {
        encoding,
        frame,
        rest,
    } = read_opening(stream, connection_id, deadline).await?;

    let rejection = match frame {
        Ok(ClientFrame::Connect { version, token }) => {
            if !PROTOCOL_VERSION.accepts_major(version) {
                ServerFrame::error(
                    0,
                    codes::INCOMPATIBLE_VERSION,
                    format!("Unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}"),
                )
            } else {
                match state.identities.resolve(&token).await {
                    Ok(Some(identity)) => return Some((identity, encoding, rest)),
                    Ok(None) => ServerFrame::error(0, codes::UNAUTHORIZED, "Invalid token"),
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Identity provider failed");
                        ServerFrame::error(0, codes::PERSISTENCE_FAILURE, e.to_string())
                    }
                }
            }
        }
        Ok(other) => ServerFrame::error(
            0,
            codes::NOT_BOUND,
            format!("Expected connect, got {}", other.event()),
        ),
        Err(e) => ServerFrame::error(0, codes::MALFORMED_FRAME, e.to_string()),
    };

    metrics::record_error("handshake");
    if let Err(e) = send_encoded(sink, encoding, &rejection).await {
        debug!(connection = %connection_id, error = %e, "Failed to send handshake rejection");
    }
    None
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let Some((identity, encoding, read_buffer)) =
        handshake(&mut stream, &mut sink, &state, &connection_id).await
    else {
        let _ = sink.close().await;
        return;
    };

    let (tx, inbox) = outbox();
    if let Err(e) = state.hub.connect(&connection_id, &identity, tx) {
        error!(connection = %connection_id, error = %e, "Bind failed");
        return;
    }

    let mut conn = Connection {
        id: connection_id,
        encoding,
        sink,
    };

    let connected = ServerFrame::Connected {
        connection_id: conn.id.to_string(),
        identity: identity.to_string(),
        version: PROTOCOL_VERSION.major,
        heartbeat: u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
        typing_timeout: u32::try_from(state.config.typing.timeout_ms).unwrap_or(u32::MAX),
    };
    if conn.send(&connected).await.is_ok() {
        info!(connection = %conn.id, identity = %identity, "Client connected");
        run_connection(&mut conn, &mut stream, inbox, read_buffer, &state).await;
    } else {
        error!(connection = %conn.id, "Failed to send Connected frame");
    }

    if let Some(unbound) = state.hub.disconnect(&conn.id).await {
        debug!(
            connection = %conn.id,
            identity = %unbound.identity,
            rooms = unbound.rooms.len(),
            last = unbound.last_connection,
            connected_ms = now_millis().saturating_sub(unbound.bound_at),
            "Connection unwound"
        );
    }
    metrics::set_active_rooms(state.hub.stats().active_rooms);

    debug!(connection = %conn.id, "WebSocket disconnected");
}

/// Pump events and frames until the socket goes away or idles out.
///
/// `read_buffer` holds binary bytes that arrived with the `connect` frame.
async fn run_connection(
    conn: &mut Connection,
    stream: &mut WsStream,
    mut inbox: Inbox,
    mut read_buffer: BytesMut,
    state: &AppState,
) {
    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    if !read_buffer.is_empty() && !drain_buffer(conn, &mut read_buffer, state).await {
        return;
    }

    loop {
        tokio::select! {
            biased;

            Some(event) = inbox.recv() => {
                if conn.send(&event.to_frame()).await.is_err() {
                    break;
                }
            }

            msg = stream.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        if !drain_buffer(conn, &mut read_buffer, state).await {
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_frame(text.len(), "inbound");

                        let handled = match codec::decode_json::<ClientFrame>(&text) {
                            Ok(frame) => handle_frame(frame, conn, state).await,
                            Err(e) => reject_malformed(conn, &e).await,
                        };
                        if let Err(e) = handled {
                            warn!(connection = %conn.id, error = %e, "Frame handling error");
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if conn.sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn.id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn.id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %conn.id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            () = &mut idle => {
                debug!(connection = %conn.id, "Heartbeat timeout");
                break;
            }
        }
    }
}

/// Handle every complete binary frame in `buffer`.
///
/// A partial frame stays buffered for the next message. Returns `false` once
/// the connection should close.
async fn drain_buffer(conn: &mut Connection, buffer: &mut BytesMut, state: &AppState) -> bool {
    loop {
        match codec::decode_from::<ClientFrame>(buffer) {
            Ok(Some(frame)) => {
                if let Err(e) = handle_frame(frame, conn, state).await {
                    warn!(connection = %conn.id, error = %e, "Frame handling error");
                    return false;
                }
            }
            Ok(None) => return true,
            Err(e) => {
                buffer.clear();
                return reject_malformed(conn, &e).await.is_ok();
            }
        }
    }
}

async fn reject_malformed(conn: &mut Connection, error: &codec::ProtocolError) -> Result<()> {
    debug!(connection = %conn.id, error = %error, "Malformed frame");
    metrics::record_error("decode");
    conn.send(&ServerFrame::error(0, codes::MALFORMED_FRAME, error.to_string()))
        .await
}

/// Error frame for a failed request.
fn reject(id: u64, error: &ChatError) -> ServerFrame {
    if let ChatError::PersistenceFailure(e) = error {
        error!(error = %e, "Store failure");
        metrics::record_error("persistence");
    }
    ServerFrame::error(id, error.code(), error.to_string())
}

/// Handle a decoded frame.
async fn handle_frame(frame: ClientFrame, conn: &mut Connection, state: &AppState) -> Result<()> {
    let hub = &state.hub;
    let event = frame.event();
    debug!(connection = %conn.id, frame = event, "Frame received");

    let reply = match frame {
        ClientFrame::Connect { .. } => Some(ServerFrame::error(
            0,
            codes::ALREADY_BOUND,
            "Connection is already bound",
        )),

        ClientFrame::Join { id, room } => Some(match hub.join(&conn.id, &room).await {
            Ok(_) => {
                metrics::record_join();
                metrics::set_active_rooms(hub.stats().active_rooms);
                ServerFrame::ack(id)
            }
            Err(e) => reject(id, &e),
        }),

        ClientFrame::Leave { id, room } => Some(match hub.leave(&conn.id, &room).await {
            Ok(()) => {
                metrics::set_active_rooms(hub.stats().active_rooms);
                ServerFrame::ack(id)
            }
            Err(e) => reject(id, &e),
        }),

        ClientFrame::Message { id, room, text } => {
            Some(match hub.submit(&conn.id, &room, &text).await {
                Ok(sequence) => {
                    metrics::record_message("room");
                    ServerFrame::ack_sequence(id, sequence)
                }
                Err(e) => reject(id, &e),
            })
        }

        ClientFrame::Typing { room } => hub
            .start_typing(&conn.id, &room)
            .await
            .err()
            .map(|e| reject(0, &e)),

        ClientFrame::StopTyping { room } => hub
            .stop_typing(&conn.id, &room)
            .await
            .err()
            .map(|e| reject(0, &e)),

        ClientFrame::PrivateJoin { id, with } => {
            Some(match hub.private_join(&conn.id, &Identity::new(with)).await {
                Ok(_) => ServerFrame::ack(id),
                Err(e) => reject(id, &e),
            })
        }

        ClientFrame::PrivateMessage { id, to, text } => Some(
            match hub.private_send(&conn.id, &Identity::new(to), &text).await {
                Ok(sequence) => {
                    metrics::record_message("private");
                    ServerFrame::ack_sequence(id, sequence)
                }
                Err(e) => reject(id, &e),
            },
        ),

        ClientFrame::GetHistory { id, room, since } => {
            Some(match hub.history(&conn.id, &room, since).await {
                Ok(messages) => ServerFrame::History {
                    id,
                    room,
                    messages: messages.iter().map(RoomMessage::from).collect(),
                },
                Err(e) => reject(id, &e),
            })
        }

        ClientFrame::GetPrivateHistory { id, with } => {
            let other = Identity::new(with);
            Some(match hub.private_history(&conn.id, &other).await {
                Ok(messages) => ServerFrame::PrivateHistory {
                    id,
                    with: other.to_string(),
                    messages: messages.iter().map(DirectMessage::from).collect(),
                },
                Err(e) => reject(id, &e),
            })
        }

        ClientFrame::GetUnreadCounts { id } => Some(match hub.unread_counts(&conn.id).await {
            Ok(counts) => ServerFrame::UnreadCounts { id, counts },
            Err(e) => reject(id, &e),
        }),

        ClientFrame::Ping { timestamp } => Some(ServerFrame::pong(timestamp)),
    };

    match reply {
        Some(reply) => conn.send(&reply).await,
        None => Ok(()),
    }
}
