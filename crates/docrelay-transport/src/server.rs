//! WebSocket relay server
//!
//! One task per connection. The URL path selects the document; frames from
//! the peer go through a [`SyncSession`], frames from other peers arrive on
//! the room's broadcast channel and are forwarded unless they originated
//! here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use docrelay_core::{ConnId, DocName, Registry};

use crate::session::SyncSession;

/// WebSocket relay server
pub struct RelayServer {
    registry: Arc<Registry>,
    addr: SocketAddr,
    allowed_origins: Vec<String>,
    // 0 is reserved for server-originated frames
    conn_counter: AtomicU64,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::Metrics>>,
}

impl RelayServer {
    pub fn new(registry: Arc<Registry>, addr: SocketAddr) -> Self {
        Self {
            registry,
            addr,
            allowed_origins: Vec::new(),
            conn_counter: AtomicU64::new(1),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Restrict websocket upgrades to the given Origin header values.
    /// An empty list accepts any origin.
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind the configured address and accept connections until the task
    /// is cancelled.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Relay listening");
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
                    let registry = self.registry.clone();
                    let allowed_origins = self.allowed_origins.clone();
                    #[cfg(feature = "metrics")]
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        #[cfg(feature = "metrics")]
                        let result = handle_connection(
                            stream, peer_addr, conn_id, registry, allowed_origins, metrics,
                        )
                        .await;
                        #[cfg(not(feature = "metrics"))]
                        let result = handle_connection(
                            stream, peer_addr, conn_id, registry, allowed_origins,
                        )
                        .await;
                        if let Err(e) = result {
                            debug!(conn = conn_id, peer = %peer_addr, error = %e,
                                   "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

fn origin_allowed(allowed: &[String], request: &Request) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match request.headers().get("Origin").and_then(|v| v.to_str().ok()) {
        Some(origin) => allowed.iter().any(|a| a == origin),
        // Non-browser clients send no Origin header; let them through
        None => true,
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: ConnId,
    registry: Arc<Registry>,
    allowed_origins: Vec<String>,
    #[cfg(feature = "metrics")] metrics: Option<Arc<crate::metrics::Metrics>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        if !origin_allowed(&allowed_origins, request) {
            warn!(peer = %peer_addr, "Rejected upgrade from disallowed origin");
            let mut forbidden = ErrorResponse::new(Some("Forbidden".to_string()));
            *forbidden.status_mut() = StatusCode::FORBIDDEN;
            return Err(forbidden);
        }
        path = request.uri().path().to_string();
        Ok(response)
    })
    .await?;

    let doc_name = match DocName::from_path(&path) {
        Ok(name) => name,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "Closing connection with invalid document name");
            return Ok(());
        }
    };
    let room = registry.get_or_create(doc_name.clone());
    let mut session = SyncSession::new(conn_id, room.clone());

    // Subscribe before the handshake frames go out so nothing is missed
    // between our SyncStep1 and the peer's first update.
    let mut frames_rx = room.subscribe();

    info!(conn = conn_id, peer = %peer_addr, doc = %doc_name, "Peer connected");
    #[cfg(feature = "metrics")]
    if let Some(m) = &metrics {
        m.record_connection();
    }

    let (mut write, mut read) = ws_stream.split();

    for frame in session.connect_frames() {
        write.send(Message::Binary(frame)).await?;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        #[cfg(feature = "metrics")]
                        if let Some(m) = &metrics {
                            m.record_frame_received(data.len());
                        }
                        for reply in session.handle_frame(&data) {
                            write.send(Message::Binary(reply)).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(conn = conn_id, doc = %doc_name, "Peer disconnected");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text and pong frames are not part of the protocol
                    }
                    Some(Err(e)) => {
                        debug!(conn = conn_id, error = %e, "WebSocket read error");
                        break;
                    }
                }
            }

            result = frames_rx.recv() => {
                match result {
                    Ok(frame) => {
                        if frame.from == conn_id {
                            continue;
                        }
                        #[cfg(feature = "metrics")]
                        if let Some(m) = &metrics {
                            m.record_frame_forwarded(frame.data.len());
                        }
                        if let Err(e) = write.send(Message::Binary(frame.data.to_vec())).await {
                            debug!(conn = conn_id, error = %e, "WebSocket write error");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The peer fell too far behind; a reconnect resyncs it
                        warn!(conn = conn_id, doc = %doc_name, missed,
                              "Peer lagged behind broadcast, disconnecting");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    session.close();
    #[cfg(feature = "metrics")]
    if let Some(m) = &metrics {
        m.record_disconnection();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    fn request_with_origin(origin: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri("ws://localhost/room1");
        if let Some(o) = origin {
            builder = builder.header("Origin", o);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_empty_allowlist_accepts_any_origin() {
        let req = request_with_origin(Some("https://evil.example"));
        assert!(origin_allowed(&[], &req));
    }

    #[test]
    fn test_allowlist_filters_origins() {
        let allowed = vec!["https://app.example".to_string()];
        assert!(origin_allowed(&allowed, &request_with_origin(Some("https://app.example"))));
        assert!(!origin_allowed(&allowed, &request_with_origin(Some("https://evil.example"))));
    }

    #[test]
    fn test_missing_origin_header_is_accepted() {
        let allowed = vec!["https://app.example".to_string()];
        assert!(origin_allowed(&allowed, &request_with_origin(None)));
    }

    async fn next_binary(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
    ) -> Vec<u8> {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        msg.into_data()
    }

    #[tokio::test]
    async fn test_update_reaches_other_peers_but_never_echoes() {
        use docrelay_core::Replica;
        use docrelay_protocol as protocol;
        use docrelay_storage::MemoryStore;
        use tokio_tungstenite::connect_async;

        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
        let server = RelayServer::new(registry, "127.0.0.1:0".parse().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let url = format!("ws://{}/room1", addr);
        let (mut alice, _) = connect_async(&url).await.unwrap();
        let (mut bob, _) = connect_async(&url).await.unwrap();

        // Both peers are greeted with the server's SyncStep1
        for ws in [&mut alice, &mut bob] {
            let greeting = next_binary(ws).await;
            match protocol::decode(&greeting).unwrap() {
                protocol::Message::Sync(protocol::SyncMessage::SyncStep1(_)) => {}
                other => panic!("expected SyncStep1 greeting, got {:?}", other),
            }
        }

        let editor = Replica::new();
        let delta = editor.insert_text("index.js", 0, "hello");
        alice
            .send(Message::Binary(protocol::sync_update(delta)))
            .await
            .unwrap();

        // The other peer receives the update and can materialize it
        let forwarded = next_binary(&mut bob).await;
        match protocol::decode(&forwarded).unwrap() {
            protocol::Message::Sync(protocol::SyncMessage::Update(payload)) => {
                let mirror = Replica::new();
                mirror.apply_update(&payload).unwrap();
                assert_eq!(mirror.file_text("index.js").unwrap(), "hello");
            }
            other => panic!("expected a sync update, got {:?}", other),
        }

        // The sender gets nothing back for its own update
        let echo = tokio::time::timeout(std::time::Duration::from_millis(300), alice.next()).await;
        assert!(echo.is_err(), "the sender's own update came back to it");
    }
}
