//! HTTP/WebSocket server wiring.
//!
//! One task pair per connection: the drive loop reads inbound frames and
//! session events, the writer task owns the socket sink and stamps the
//! per-connection sequence counter just before serialization.

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use confab_core::store::{
    ConversationRepository, MessageRepository, Notifier, UserRepository,
};
use confab_core::{
    ConnectionId, ConnectionRegistry, RateLimiter, ReadStateEngine, TokenVerifier,
};
use confab_protocol::{encode_server, ServerEnvelope};

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::session::{Session, SessionEvent};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Live connections and fan-out.
    pub registry: ConnectionRegistry,
    /// Admission control.
    pub limiter: RateLimiter,
    /// Pagination and read receipts.
    pub reads: ReadStateEngine,
    pub users: Arc<dyn UserRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub tokens: Arc<dyn TokenVerifier>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    /// Create app state over the given collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        users: Arc<dyn UserRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        tokens: Arc<dyn TokenVerifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            limiter: RateLimiter::new((&config.rate_limits).into()),
            reads: ReadStateEngine::new(messages.clone(), conversations.clone()),
            config,
            users,
            conversations,
            messages,
            tokens,
            notifier,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.websocket.path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    // Start metrics server if enabled
    if state.config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(state.config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = state.config.bind_addr();
    let ws_path = state.config.websocket.path.clone();
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;

    info!("confab server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection for its whole lifetime.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let conn = ConnectionId::generate();
    debug!(connection = %conn, "WebSocket connected");

    let (sink, mut receiver) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_outbound(sink, out_rx));

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let deadline = {
        let events = ev_tx.clone();
        let grace = state.config.auth.handshake_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(SessionEvent::AuthDeadline);
        })
    };

    let mut session = Session::new(state, conn, out_tx, ev_tx);

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_text(&text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // The protocol is JSON text; tolerate text-in-binary.
                        match String::from_utf8(data) {
                            Ok(text) => session.handle_text(&text).await,
                            Err(_) => {
                                debug!(connection = %conn, "Ignoring non-UTF-8 binary frame");
                            }
                        }
                    }
                    // Control frames are answered by the protocol stack.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %conn, "WebSocket stream ended");
                        break;
                    }
                }
            }

            Some(event) = ev_rx.recv() => {
                if session.handle_event(event).await.is_break() {
                    break;
                }
            }
        }
    }

    deadline.abort();
    session.cleanup().await;
    // Dropping the session releases the last queue sender; the writer drains
    // what is already queued and exits.
    drop(session);
    let _ = writer.await;

    debug!(connection = %conn, "WebSocket disconnected");
}

/// Forward queued envelopes to the socket, stamping sequence numbers.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerEnvelope>,
) {
    let mut sequence: u64 = 0;
    while let Some(mut envelope) = outbound.recv().await {
        stamp_sequence(&mut envelope, &mut sequence);
        let text = match encode_server(&envelope) {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, "Failed to encode outbound envelope");
                continue;
            }
        };
        metrics::record_envelope(text.len(), "outbound");
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

/// Advance the per-connection counter for substantive envelopes only.
fn stamp_sequence(envelope: &mut ServerEnvelope, sequence: &mut u64) {
    if envelope.is_sequenced() {
        *sequence += 1;
        envelope.set_sequence(*sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::memory::{MemoryStore, NullNotifier, StaticTokenVerifier};
    use futures_util::stream::SplitStream;
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    #[test]
    fn test_sequence_skips_heartbeat() {
        let mut sequence = 0;

        let mut pong = ServerEnvelope::Pong;
        stamp_sequence(&mut pong, &mut sequence);
        assert_eq!(pong.sequence(), None);
        assert_eq!(sequence, 0);

        let mut first = ServerEnvelope::error(confab_protocol::ErrorCode::InternalError, "x");
        let mut second = first.clone();
        stamp_sequence(&mut first, &mut sequence);
        stamp_sequence(&mut second, &mut sequence);
        assert_eq!(first.sequence(), Some(1));
        assert_eq!(second.sequence(), Some(2));
    }

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_server() -> (std::net::SocketAddr, Arc<MemoryStore>, Arc<StaticTokenVerifier>)
    {
        let store = Arc::new(MemoryStore::new());
        let tokens = Arc::new(StaticTokenVerifier::new());
        let mut config = crate::config::Config::default();
        config.metrics.enabled = false;
        let state = Arc::new(AppState::new(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            tokens.clone(),
            Arc::new(NullNotifier),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, store, tokens)
    }

    async fn connect(addr: std::net::SocketAddr) -> ClientSocket {
        let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        socket
    }

    async fn next_json(socket: &mut SplitStream<ClientSocket>) -> Value {
        loop {
            match socket.next().await.expect("socket closed").unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_message_delivery() {
        let (addr, store, tokens) = spawn_server().await;
        let alice = store.add_user("Alice");
        let bob = store.add_user("Bob");
        let conv = store.add_conversation(&[alice, bob]);
        tokens.grant("ta", alice);
        tokens.grant("tb", bob);

        let (mut a_tx, mut a_rx) = connect(addr).await.split();
        let (mut b_tx, mut b_rx) = connect(addr).await.split();

        a_tx.send(WsMessage::Text(r#"{"type":"auth","token":"ta"}"#.into()))
            .await
            .unwrap();
        b_tx.send(WsMessage::Text(r#"{"type":"auth","token":"tb"}"#.into()))
            .await
            .unwrap();

        let a_auth = next_json(&mut a_rx).await;
        assert_eq!(a_auth["type"], "auth_success");
        assert_eq!(a_auth["user_id"], alice.to_string());
        assert_eq!(a_auth["sequence"], 1);

        let b_auth = next_json(&mut b_rx).await;
        assert_eq!(b_auth["type"], "auth_success");

        a_tx.send(WsMessage::Text(format!(
            r#"{{"type":"message","conversation_id":"{conv}","content":"hello"}}"#
        )))
        .await
        .unwrap();

        // Sender echo and participant delivery, each with its own
        // per-connection sequence.
        let echo = next_json(&mut a_rx).await;
        assert_eq!(echo["type"], "message");
        assert_eq!(echo["content"], "hello");
        assert_eq!(echo["sequence"], 2);

        let delivered = next_json(&mut b_rx).await;
        assert_eq!(delivered["type"], "message");
        assert_eq!(delivered["content"], "hello");
        assert_eq!(delivered["sender_id"], alice.to_string());
        assert_eq!(delivered["sequence"], 2);
    }

    #[tokio::test]
    async fn test_end_to_end_ping_pong_unsequenced() {
        let (addr, _store, _tokens) = spawn_server().await;
        let (mut tx, mut rx) = connect(addr).await.split();

        tx.send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        let pong = next_json(&mut rx).await;
        assert_eq!(pong["type"], "pong");
        assert!(pong.get("sequence").is_none());
    }

    #[tokio::test]
    async fn test_end_to_end_unauthenticated_rejected() {
        let (addr, store, _tokens) = spawn_server().await;
        let alice = store.add_user("Alice");
        let conv = store.add_conversation(&[alice]);

        let (mut tx, mut rx) = connect(addr).await.split();
        tx.send(WsMessage::Text(format!(
            r#"{{"type":"message","conversation_id":"{conv}","content":"hi"}}"#
        )))
        .await
        .unwrap();

        let err = next_json(&mut rx).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, _store, _tokens) = spawn_server().await;
        let body = reqwest_health(addr).await;
        assert_eq!(body["status"], "ok");
    }

    // Minimal GET without pulling an HTTP client crate into dev-deps.
    async fn reqwest_health(addr: std::net::SocketAddr) -> Value {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nhost: confab\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        serde_json::from_str(body).unwrap()
    }
}
