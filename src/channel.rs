//! Event channel adapter.
//!
//! [`EventChannel`] is the only way a session talks to other participants.
//! Two implementations:
//! - [`WsChannel`]: tokio-tungstenite client connected to a [`crate::hub`] server
//! - [`LoopbackHub`] / [`LoopbackChannel`]: in-process hub with the same relay
//!   rules, for embedding and tests
//!
//! Publishing never blocks. Each channel owns its background tasks and
//! aborts them when dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Result, SyncError};
use crate::hub::relay_event;
use crate::protocol::{ChannelEvent, Envelope};

/// Capacity of the fan-out channel behind every subscription.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Bidirectional, per-connection ordered event transport.
pub trait EventChannel: Send + Sync {
    fn publish(&self, event: ChannelEvent) -> Result<()>;
    fn subscribe(&self) -> Result<Subscription>;

    /// Participant id assigned by the hub, when known without a `welcome`.
    fn participant_id(&self) -> Option<String> {
        None
    }
}

/// Stream of inbound envelopes for one subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
    skip_from: Option<String>,
}

impl Subscription {
    fn new(rx: broadcast::Receiver<Envelope>, skip_from: Option<String>) -> Self {
        Self { rx, skip_from }
    }

    /// Next inbound envelope, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(env) => {
                    if self.skip_from.is_some() && env.from == self.skip_from {
                        continue;
                    }
                    return Some(env);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscription lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for synchronous callers.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(env) => {
                    if self.skip_from.is_some() && env.from == self.skip_from {
                        continue;
                    }
                    return Some(env);
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscription lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket client
// ---------------------------------------------------------------------------

/// Client side of a hub connection.
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: broadcast::Sender<Envelope>,
    // Created before the reader starts so frames sent right after the
    // handshake (the hub's welcome) reach the first subscriber.
    initial: Mutex<Option<broadcast::Receiver<Envelope>>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsChannel {
    /// Connect to a full room URL such as `ws://host:8787/ws/ROOM?name=ada`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::TransportUnavailable(format!("{url}: {e}")))?;
        tracing::info!(url, "connected to hub");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound, initial) = broadcast::channel(CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let writer_flag = Arc::clone(&connected);
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            writer_flag.store(false, Ordering::SeqCst);
            let _ = sink.close().await;
        });

        let reader_flag = Arc::clone(&connected);
        let reader_tx = inbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match Envelope::decode(&text) {
                        Ok(env) => {
                            let _ = reader_tx.send(env);
                        }
                        Err(e) => tracing::debug!(error = %e, "dropping undecodable frame"),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            reader_flag.store(false, Ordering::SeqCst);
            tracing::warn!("hub connection closed");
        });

        Ok(Self {
            outbound,
            inbound,
            initial: Mutex::new(Some(initial)),
            connected,
            tasks: vec![writer, reader],
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl EventChannel for WsChannel {
    fn publish(&self, event: ChannelEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::TransportUnavailable("hub connection closed".into()));
        }
        let text = Envelope::local(event).encode()?;
        self.outbound
            .send(text)
            .map_err(|_| SyncError::TransportUnavailable("writer task stopped".into()))
    }

    fn subscribe(&self) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(SyncError::TransportUnavailable("hub connection closed".into()));
        }
        let rx = self
            .initial
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or_else(|| self.inbound.subscribe());
        Ok(Subscription::new(rx, None))
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// In-process hub
// ---------------------------------------------------------------------------

/// A hub living in the same process. Relays exactly like the network hub.
#[derive(Clone)]
pub struct LoopbackHub {
    tx: broadcast::Sender<Envelope>,
    members: Arc<Mutex<Vec<String>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            members: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Join the hub under a fresh participant id.
    pub fn connect(&self, username: &str) -> LoopbackChannel {
        let participant_id = uuid::Uuid::new_v4().to_string();
        if let Ok(mut members) = self.members.lock() {
            members.push(participant_id.clone());
        }
        let _ = self.tx.send(Envelope::from_participant(
            ChannelEvent::ParticipantJoined {
                participant_id: participant_id.clone(),
                username: username.to_string(),
            },
            participant_id.clone(),
        ));
        LoopbackChannel {
            hub: self.clone(),
            participant_id,
            connected: AtomicBool::new(true),
        }
    }

    pub fn participant_count(&self) -> usize {
        self.members.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackChannel {
    hub: LoopbackHub,
    participant_id: String,
    connected: AtomicBool,
}

impl LoopbackChannel {
    pub fn id(&self) -> &str {
        &self.participant_id
    }

    /// Leave the hub; later publish/subscribe calls fail with
    /// `TransportUnavailable`.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Ok(mut members) = self.hub.members.lock() {
                members.retain(|id| id != &self.participant_id);
            }
            let _ = self.hub.tx.send(Envelope::from_participant(
                ChannelEvent::ParticipantLeft {
                    participant_id: self.participant_id.clone(),
                },
                self.participant_id.clone(),
            ));
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::TransportUnavailable("loopback channel disconnected".into()))
        }
    }
}

impl EventChannel for LoopbackChannel {
    fn publish(&self, event: ChannelEvent) -> Result<()> {
        self.ensure_connected()?;
        if let Some(relayed) = relay_event(event) {
            let _ = self
                .hub
                .tx
                .send(Envelope::from_participant(relayed, self.participant_id.clone()));
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<Subscription> {
        self.ensure_connected()?;
        Ok(Subscription::new(
            self.hub.tx.subscribe(),
            Some(self.participant_id.clone()),
        ))
    }

    fn participant_id(&self) -> Option<String> {
        Some(self.participant_id.clone())
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatEntry, Origin, PresencePayload};

    fn message(body: &str) -> ChatEntry {
        ChatEntry::new("ada", body, Origin::User, String::new())
    }

    #[test]
    fn test_loopback_send_message_arrives_as_receive_message() {
        let hub = LoopbackHub::new();
        let a = hub.connect("ada");
        let b = hub.connect("bob");
        let mut sub_b = b.subscribe().unwrap();

        let entry = message("hi");
        a.publish(ChannelEvent::SendMessage { message: entry.clone() }).unwrap();

        let env = sub_b.try_recv().unwrap();
        assert_eq!(env.from.as_deref(), Some(a.id()));
        assert_eq!(env.event, ChannelEvent::ReceiveMessage { message: entry });
    }

    #[test]
    fn test_loopback_sender_does_not_see_own_events() {
        let hub = LoopbackHub::new();
        let a = hub.connect("ada");
        let mut sub_a = a.subscribe().unwrap();
        a.publish(ChannelEvent::TypingStart(PresencePayload::default())).unwrap();
        assert!(sub_a.try_recv().is_none());
    }

    #[test]
    fn test_loopback_preserves_per_sender_order() {
        let hub = LoopbackHub::new();
        let a = hub.connect("ada");
        let b = hub.connect("bob");
        let mut sub_b = b.subscribe().unwrap();
        for i in 0..20 {
            a.publish(ChannelEvent::FileUpdated {
                file_id: "f1".into(),
                new_content: i.to_string(),
            })
            .unwrap();
        }
        for i in 0..20 {
            match sub_b.try_recv().unwrap().event {
                ChannelEvent::FileUpdated { new_content, .. } => assert_eq!(new_content, i.to_string()),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_disconnected_channel_is_transport_unavailable() {
        let hub = LoopbackHub::new();
        let a = hub.connect("ada");
        a.disconnect();
        assert!(a.publish(ChannelEvent::TypingPause(PresencePayload::default())).unwrap_err().is_transport());
        assert!(matches!(a.subscribe(), Err(SyncError::TransportUnavailable(_))));
    }

    #[test]
    fn test_disconnect_announces_participant_left() {
        let hub = LoopbackHub::new();
        let a = hub.connect("ada");
        let b = hub.connect("bob");
        let mut sub_b = b.subscribe().unwrap();
        let a_id = a.id().to_string();
        drop(a);
        assert_eq!(hub.participant_count(), 1);
        assert_eq!(
            sub_b.try_recv().unwrap().event,
            ChannelEvent::ParticipantLeft { participant_id: a_id }
        );
    }

    #[test]
    fn test_client_originated_control_events_are_not_relayed() {
        let hub = LoopbackHub::new();
        let a = hub.connect("ada");
        let b = hub.connect("bob");
        let mut sub_b = b.subscribe().unwrap();
        a.publish(ChannelEvent::Welcome { participant_id: "forged".into(), members: vec![] }).unwrap();
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_ws_connect_to_closed_port_is_transport_unavailable() {
        let err = WsChannel::connect("ws://127.0.0.1:1/ws/ROOM").await.err().unwrap();
        assert!(err.is_transport());
    }
}
