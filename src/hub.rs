//! Relay hub: room state, participant tracking, WebSocket fan-out.
//!
//! ## Design
//! - RoomStore: `Arc<Mutex<HashMap<String, Room>>>` shared across all connections
//! - Each Room has a `tokio::sync::broadcast` sender for fan-out
//! - Every frame a client sends is passed through [`relay_event`], stamped
//!   with the sender's participant id and broadcast; each connection skips
//!   frames stamped with its own id
//!
//! ## Room lifecycle
//! 1. Client connects to `ws://host/ws/ROOM?name=ada`
//! 2. The room is created on first join; the client gets `welcome`
//! 3. Everyone else sees `participant-joined`
//! 4. On disconnect everyone else sees `participant-left`; the room is
//!    removed once empty

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::channel::CHANNEL_CAPACITY;
use crate::error::{Result, SyncError};
use crate::protocol::{ChannelEvent, Envelope, PeerInfo};

/// How many times to re-peek a request head that arrived in pieces.
const PEEK_ATTEMPTS: usize = 50;

/// Shared room store: room code → Room.
pub type RoomStore = Arc<Mutex<HashMap<String, Room>>>;

/// A connected participant.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub joined_at: DateTime<Utc>,
}

pub struct Room {
    pub code: String,
    pub members: Vec<Member>,
    pub created_at: DateTime<Utc>,
    /// Clone to get a receiver for a new subscriber.
    pub broadcast_tx: broadcast::Sender<Envelope>,
}

pub fn new_room_store() -> RoomStore {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Decide what the hub forwards for an event a client sent.
///
/// `send-message` goes out as `receive-message`; document and presence
/// events pass through unchanged. Hub-originated events (`welcome`,
/// `participant-*`, `receive-message`) are never accepted from clients.
pub fn relay_event(event: ChannelEvent) -> Option<ChannelEvent> {
    match event {
        ChannelEvent::SendMessage { message } => Some(ChannelEvent::ReceiveMessage { message }),
        ev @ (ChannelEvent::FileUpdated { .. } | ChannelEvent::TypingStart(_) | ChannelEvent::TypingPause(_)) => {
            Some(ev)
        }
        other => {
            tracing::debug!(event = other.name(), "dropping client-sent hub event");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Room operations
// ---------------------------------------------------------------------------

/// Add a participant to a room, creating the room if needed.
pub fn join_room(store: &RoomStore, code: &str, name: &str) -> Result<(Member, broadcast::Receiver<Envelope>)> {
    let mut guard = store
        .lock()
        .map_err(|_| SyncError::TransportUnavailable("internal: room store poisoned".into()))?;

    let room = guard.entry(code.to_string()).or_insert_with(|| {
        tracing::info!(room = %code, "room created");
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Room {
            code: code.to_string(),
            members: Vec::new(),
            created_at: Utc::now(),
            broadcast_tx: tx,
        }
    });

    let member = Member {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        joined_at: Utc::now(),
    };
    let rx = room.broadcast_tx.subscribe();
    room.members.push(member.clone());
    Ok((member, rx))
}

/// Remove a participant. Returns the room's sender so the caller can
/// announce the departure; the room itself is dropped from the store when
/// this was its last member.
pub fn leave_room(store: &RoomStore, code: &str, participant_id: &str) -> Option<broadcast::Sender<Envelope>> {
    let mut guard = store.lock().ok()?;
    let room = guard.get_mut(code)?;
    room.members.retain(|m| m.id != participant_id);
    let tx = room.broadcast_tx.clone();
    if room.members.is_empty() {
        guard.remove(code);
        tracing::info!(room = %code, "room closed");
    }
    Some(tx)
}

/// Send an envelope to every subscriber of the room.
pub fn broadcast(store: &RoomStore, code: &str, envelope: Envelope) {
    if let Ok(guard) = store.lock() {
        if let Some(room) = guard.get(code) {
            let _ = room.broadcast_tx.send(envelope);
        }
    }
}

pub fn member_count(store: &RoomStore, code: &str) -> usize {
    store
        .lock()
        .ok()
        .and_then(|g| g.get(code).map(|r| r.members.len()))
        .unwrap_or(0)
}

/// Everyone in the room except `participant_id`, in join order.
pub fn room_peers(store: &RoomStore, code: &str, participant_id: &str) -> Vec<PeerInfo> {
    let Ok(guard) = store.lock() else {
        return Vec::new();
    };
    guard
        .get(code)
        .map(|room| {
            room.members
                .iter()
                .filter(|m| m.id != participant_id)
                .map(|m| PeerInfo {
                    participant_id: m.id.clone(),
                    username: m.name.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn room_exists(store: &RoomStore, code: &str) -> bool {
    store.lock().map(|g| g.contains_key(code)).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// Percent-decoding for query values. Invalid escapes are dropped.
pub fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => bytes.push(b' '),
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                if hex.len() == 2 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                        bytes.push(byte);
                    }
                }
            }
            _ => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse a query string into key-value pairs.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((key.to_string(), url_decode(val)))
        })
        .collect()
}

/// Extract `(room, username)` from a request path like `/ws/ROOM?name=ada`.
pub fn parse_ws_path(path_and_query: &str) -> Option<(String, String)> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, q),
        None => (path_and_query, ""),
    };
    let code = url_decode(path.strip_prefix("/ws/")?.trim_end_matches('/'));
    if code.is_empty() || code.contains('/') {
        return None;
    }
    let name = parse_query(query)
        .remove("name")
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "guest".to_string());
    Some((code, name))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bind `addr` and serve rooms until the process exits.
pub async fn serve(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "hub listening");
    serve_listener(listener, new_room_store()).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_listener(listener: TcpListener, store: RoomStore) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, store).await {
                tracing::warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, store: RoomStore) -> Result<()> {
    // Peek at the request line to route the upgrade before the handshake
    // consumes it.
    let mut peek_buf = [0u8; 1024];
    let mut peek_n = 0;
    for _ in 0..PEEK_ATTEMPTS {
        peek_n = stream.peek(&mut peek_buf).await?;
        let head_complete = peek_buf[..peek_n].windows(4).any(|w| w == b"\r\n\r\n");
        if peek_n == 0 || peek_n == peek_buf.len() || head_complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let head = String::from_utf8_lossy(&peek_buf[..peek_n]);
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let is_upgrade = head.to_ascii_lowercase().contains("upgrade: websocket");

    match parse_ws_path(&target) {
        Some((code, name)) if is_upgrade => {
            let ws_stream = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(|e| SyncError::TransportUnavailable(format!("handshake failed: {e}")))?;
            handle_ws(ws_stream, store, code, name).await;
            Ok(())
        }
        _ => {
            let body = "roomsync hub: connect with a WebSocket to /ws/<room>?name=<you>\n";
            let response = format!(
                "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body,
            );
            stream.write_all(response.as_bytes()).await?;
            Ok(())
        }
    }
}

/// Drive one participant's connection until it closes.
pub async fn handle_ws(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    store: RoomStore,
    code: String,
    name: String,
) {
    let (member, mut room_rx) = match join_room(&store, &code, &name) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(room = %code, error = %e, "join failed");
            return;
        }
    };
    let participant_id = member.id.clone();
    tracing::info!(room = %code, participant = %participant_id, name = %name, "participant joined");

    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let welcome = Envelope::local(ChannelEvent::Welcome {
        participant_id: participant_id.clone(),
        members: room_peers(&store, &code, &participant_id),
    });
    if let Ok(text) = welcome.encode() {
        let _ = ws_sink.send(WsMessage::Text(text)).await;
    }

    broadcast(
        &store,
        &code,
        Envelope::from_participant(
            ChannelEvent::ParticipantJoined {
                participant_id: participant_id.clone(),
                username: member.name.clone(),
            },
            participant_id.clone(),
        ),
    );

    loop {
        tokio::select! {
            msg = ws_source.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let envelope = match Envelope::decode(&text) {
                            Ok(env) => env,
                            Err(e) => {
                                tracing::debug!(participant = %participant_id, error = %e, "ignoring malformed frame");
                                continue;
                            }
                        };
                        if let Some(relayed) = relay_event(envelope.event) {
                            broadcast(&store, &code, Envelope::from_participant(relayed, participant_id.clone()));
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }

            bcast = room_rx.recv() => {
                match bcast {
                    Ok(env) => {
                        if env.from.as_deref() == Some(participant_id.as_str()) {
                            continue;
                        }
                        match env.encode() {
                            Ok(text) => {
                                if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::error!(error = %e, "failed to encode relayed event"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(participant = %participant_id, missed, "relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if let Some(tx) = leave_room(&store, &code, &participant_id) {
        let _ = tx.send(Envelope::from_participant(
            ChannelEvent::ParticipantLeft {
                participant_id: participant_id.clone(),
            },
            participant_id.clone(),
        ));
    }
    tracing::info!(room = %code, participant = %participant_id, "participant left");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatEntry, Origin, PresencePayload};

    fn chat(body: &str) -> ChatEntry {
        ChatEntry::new("ada", body, Origin::User, String::new())
    }

    // -- relay_event ---------------------------------------------------------

    #[test]
    fn test_relay_send_message_becomes_receive_message() {
        let entry = chat("hi");
        let out = relay_event(ChannelEvent::SendMessage { message: entry.clone() });
        assert_eq!(out, Some(ChannelEvent::ReceiveMessage { message: entry }));
    }

    #[test]
    fn test_relay_passes_document_and_presence_events() {
        let file = ChannelEvent::FileUpdated { file_id: "f1".into(), new_content: "x".into() };
        assert_eq!(relay_event(file.clone()), Some(file));
        let typing = ChannelEvent::TypingStart(PresencePayload { cursor_position: Some(3), file_id: None });
        assert_eq!(relay_event(typing.clone()), Some(typing));
    }

    #[test]
    fn test_relay_drops_hub_only_events() {
        assert!(relay_event(ChannelEvent::Welcome { participant_id: "p".into(), members: vec![] }).is_none());
        assert!(relay_event(ChannelEvent::ParticipantLeft { participant_id: "p".into() }).is_none());
        assert!(relay_event(ChannelEvent::ReceiveMessage { message: chat("spoof") }).is_none());
    }

    // -- room store ----------------------------------------------------------

    #[test]
    fn test_new_room_store_is_empty() {
        assert!(new_room_store().lock().unwrap().is_empty());
    }

    #[test]
    fn test_join_creates_room_on_first_join() {
        let store = new_room_store();
        assert!(!room_exists(&store, "ABC"));
        let (member, _rx) = join_room(&store, "ABC", "ada").unwrap();
        assert!(room_exists(&store, "ABC"));
        assert_eq!(member.name, "ada");
        assert_eq!(member_count(&store, "ABC"), 1);
    }

    #[test]
    fn test_join_assigns_unique_ids() {
        let store = new_room_store();
        let (a, _ra) = join_room(&store, "R", "ada").unwrap();
        let (b, _rb) = join_room(&store, "R", "ada").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(member_count(&store, "R"), 2);
    }

    #[test]
    fn test_leave_last_member_removes_room() {
        let store = new_room_store();
        let (a, _ra) = join_room(&store, "R", "ada").unwrap();
        let (b, _rb) = join_room(&store, "R", "bob").unwrap();
        assert!(leave_room(&store, "R", &a.id).is_some());
        assert!(room_exists(&store, "R"));
        assert!(leave_room(&store, "R", &b.id).is_some());
        assert!(!room_exists(&store, "R"));
    }

    #[test]
    fn test_room_peers_excludes_self() {
        let store = new_room_store();
        let (a, _ra) = join_room(&store, "R", "ada").unwrap();
        let (b, _rb) = join_room(&store, "R", "bob").unwrap();
        let peers = room_peers(&store, "R", &b.id);
        assert_eq!(peers, vec![PeerInfo { participant_id: a.id.clone(), username: "ada".into() }]);
        assert!(room_peers(&store, "missing", &a.id).is_empty());
    }

    #[test]
    fn test_leave_unknown_room_is_none() {
        let store = new_room_store();
        assert!(leave_room(&store, "nope", "id").is_none());
    }

    #[test]
    fn test_broadcast_reaches_room_subscribers_only() {
        let store = new_room_store();
        let (_a, mut ra) = join_room(&store, "R1", "ada").unwrap();
        let (_b, mut rb) = join_room(&store, "R2", "bob").unwrap();
        broadcast(&store, "R1", Envelope::local(ChannelEvent::Welcome { participant_id: "x".into(), members: vec![] }));
        assert!(ra.try_recv().is_ok());
        assert!(rb.try_recv().is_err());
    }

    // -- request parsing -----------------------------------------------------

    #[test]
    fn test_url_decode_plus_and_percent() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("a%20b"), "a b");
        assert_eq!(url_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn test_url_decode_drops_short_or_signed_escapes() {
        assert_eq!(url_decode("ab%2"), "ab");
        assert_eq!(url_decode("%+1x"), "x");
        assert_eq!(url_decode("%zzok"), "ok");
        assert_eq!(url_decode("%41"), "A");
    }

    #[test]
    fn test_parse_query_pairs() {
        let q = parse_query("name=ada&x=1&flag");
        assert_eq!(q.get("name").map(String::as_str), Some("ada"));
        assert_eq!(q.get("x").map(String::as_str), Some("1"));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_ws_path_room_and_name() {
        assert_eq!(parse_ws_path("/ws/lobby?name=Ada+L"), Some(("lobby".into(), "Ada L".into())));
    }

    #[test]
    fn test_parse_ws_path_defaults_name() {
        assert_eq!(parse_ws_path("/ws/lobby"), Some(("lobby".into(), "guest".into())));
        assert_eq!(parse_ws_path("/ws/lobby?name=%20"), Some(("lobby".into(), "guest".into())));
    }

    #[test]
    fn test_parse_ws_path_rejects_other_paths() {
        assert!(parse_ws_path("/").is_none());
        assert!(parse_ws_path("/ws/").is_none());
        assert!(parse_ws_path("/ws/a/b").is_none());
        assert!(parse_ws_path("/api/ws/x").is_none());
    }
}
