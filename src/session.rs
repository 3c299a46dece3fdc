//! One participant's view of a room.
//!
//! [`SyncSession`] owns every per-participant component: the channel
//! subscription, transcript, command router, document state, presence timer
//! and the at-most-one in-flight completion call. All mutation happens on the
//! task that drives [`SyncSession::tick`]; other participants are reached only
//! through the [`EventChannel`].
//!
//! Suspension points inside `tick` are the inbound channel, the pending
//! completion call, and the presence quiet-period timer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::channel::{EventChannel, LoopbackHub, Subscription, WsChannel};
use crate::config::SyncConfig;
use crate::document::{DocumentSyncSession, RemoteApply};
use crate::error::{Result, SyncError};
use crate::gateway::{CommandRequest, CompletionGateway};
use crate::presence::PresenceDebouncer;
use crate::protocol::{ChannelEvent, ChatEntry, DocumentSnapshot, Envelope, PresenceKind, TimestampFormatter};
use crate::router::{CommandOutcome, CommandRouter, Dispatch};
use crate::transcript::TranscriptStore;

/// Something the session did that a front end may want to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The hub assigned this participant an id.
    Joined { participant_id: String },
    /// A peer's chat entry was appended.
    Chat(ChatEntry),
    /// A peer's entry was already in the transcript.
    Duplicate { id: String },
    /// A completion call finished and its entry was appended.
    Assistant(CommandOutcome),
    Document { file_id: String, applied: RemoteApply },
    PeerTyping { participant_id: String, typing: bool },
    PeerJoined { participant_id: String, username: String },
    PeerLeft { participant_id: String },
    /// Local typing went quiet and `typing-pause` was published.
    PresenceSent(PresenceKind),
    /// The inbound stream ended.
    Disconnected,
}

pub struct SyncSession {
    username: String,
    participant_id: Option<String>,
    channel: Arc<dyn EventChannel>,
    subscription: Option<Subscription>,
    transcript: TranscriptStore,
    router: CommandRouter,
    document: DocumentSyncSession,
    gateway: Arc<dyn CompletionGateway>,
    pending: Option<JoinHandle<Result<String>>>,
    peers: HashMap<String, String>,
}

impl SyncSession {
    pub fn new(
        config: &SyncConfig,
        channel: Arc<dyn EventChannel>,
        gateway: Arc<dyn CompletionGateway>,
    ) -> Self {
        let subscription = match channel.subscribe() {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(error = %e, "event channel not established, skipping subscription");
                None
            }
        };
        let formatter = TimestampFormatter::new(&config.timestamps);
        Self {
            username: config.username.clone(),
            participant_id: channel.participant_id(),
            channel,
            subscription,
            transcript: TranscriptStore::new(),
            router: CommandRouter::new(&config.assistant, formatter),
            document: DocumentSyncSession::new(PresenceDebouncer::new(config.presence.quiet_period())),
            gateway,
            pending: None,
            peers: HashMap::new(),
        }
    }

    /// Connect to the configured hub. When the hub cannot be reached the
    /// session runs solo on a private in-process hub.
    pub async fn connect(config: &SyncConfig, gateway: Arc<dyn CompletionGateway>) -> Self {
        let url = config.room_url();
        let channel: Arc<dyn EventChannel> = match WsChannel::connect(&url).await {
            Ok(ws) => Arc::new(ws),
            Err(e) => {
                tracing::warn!(error = %e, "hub unreachable, continuing offline");
                Arc::new(LoopbackHub::new().connect(&config.username))
            }
        };
        Self::new(config, channel, gateway)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut TranscriptStore {
        &mut self.transcript
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn document(&self) -> &DocumentSyncSession {
        &self.document
    }

    /// Display name of a connected peer.
    pub fn peer_name(&self, participant_id: &str) -> Option<&str> {
        self.peers.get(participant_id).map(String::as_str)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Something can still arrive: inbound events, a completion or a pause.
    pub fn has_pending_work(&self) -> bool {
        self.subscription.is_some() || self.pending.is_some() || self.document.presence_pending()
    }

    /// A completion call is in flight.
    pub fn awaiting_assistant(&self) -> bool {
        self.pending.is_some()
    }

    /// Submit a chat line typed by the local user.
    pub fn submit_message(&mut self, text: &str) -> Result<()> {
        let dispatch = self
            .router
            .submit_local(&mut self.transcript, self.channel.as_ref(), &self.username, text)?;
        self.dispatch(dispatch);
        Ok(())
    }

    pub fn open_file(&mut self, snapshot: DocumentSnapshot) {
        self.document.activate(snapshot);
    }

    pub fn apply_local_edit(&mut self, file_id: &str, new_content: &str, cursor_offset: usize) -> Result<()> {
        self.document
            .apply_local_edit(self.channel.as_ref(), file_id, new_content, cursor_offset)
    }

    /// Route one inbound envelope to the component that owns it.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> Option<SessionUpdate> {
        if envelope.from.is_some() && envelope.from.as_deref() == self.participant_id.as_deref() {
            return None;
        }
        match envelope.event {
            ChannelEvent::Welcome { participant_id, members } => {
                tracing::info!(participant = %participant_id, peers = members.len(), "joined room");
                self.participant_id = Some(participant_id.clone());
                self.peers
                    .extend(members.into_iter().map(|p| (p.participant_id, p.username)));
                Some(SessionUpdate::Joined { participant_id })
            }
            ChannelEvent::ReceiveMessage { message } | ChannelEvent::SendMessage { message } => {
                if self.transcript.contains(&message.id) {
                    // Still routed so the store logs the suppression.
                    let id = message.id.clone();
                    self.router.observe_remote(&mut self.transcript, message);
                    return Some(SessionUpdate::Duplicate { id });
                }
                let shown = message.clone();
                let dispatch = self.router.observe_remote(&mut self.transcript, message);
                self.dispatch(dispatch);
                Some(SessionUpdate::Chat(shown))
            }
            ChannelEvent::FileUpdated { file_id, new_content } => {
                let applied = self.document.on_remote_content_update(&file_id, &new_content);
                Some(SessionUpdate::Document { file_id, applied })
            }
            ChannelEvent::TypingStart(payload) | ChannelEvent::TypingPause(payload) if envelope.from.is_none() => {
                tracing::debug!(?payload, "presence without sender ignored");
                None
            }
            ChannelEvent::TypingStart(payload) => {
                let participant_id = envelope.from.unwrap_or_default();
                self.document
                    .on_remote_cursor(&participant_id, payload.file_id.as_deref(), payload.cursor_position, true);
                Some(SessionUpdate::PeerTyping { participant_id, typing: true })
            }
            ChannelEvent::TypingPause(payload) => {
                let participant_id = envelope.from.unwrap_or_default();
                self.document
                    .on_remote_cursor(&participant_id, payload.file_id.as_deref(), payload.cursor_position, false);
                Some(SessionUpdate::PeerTyping { participant_id, typing: false })
            }
            ChannelEvent::ParticipantJoined { participant_id, username } => {
                self.peers.insert(participant_id.clone(), username.clone());
                Some(SessionUpdate::PeerJoined { participant_id, username })
            }
            ChannelEvent::ParticipantLeft { participant_id } => {
                self.peers.remove(&participant_id);
                self.document.forget_participant(&participant_id);
                Some(SessionUpdate::PeerLeft { participant_id })
            }
        }
    }

    /// Wait for the next thing to happen and apply it.
    ///
    /// Returns `None` immediately when there is nothing left to wait for.
    pub async fn tick(&mut self) -> Option<SessionUpdate> {
        if !self.has_pending_work() {
            return None;
        }
        loop {
            tokio::select! {
                env = next_envelope(&mut self.subscription) => {
                    match env {
                        Some(env) => {
                            if let Some(update) = self.handle_envelope(env) {
                                return Some(update);
                            }
                        }
                        None => {
                            tracing::warn!("event channel closed");
                            self.subscription = None;
                            return Some(SessionUpdate::Disconnected);
                        }
                    }
                }
                result = join_pending(&mut self.pending) => {
                    self.pending = None;
                    let outcome = self.router.resolve(&mut self.transcript, result);
                    return Some(SessionUpdate::Assistant(outcome));
                }
                signal = self.document.presence_paused() => {
                    let kind = signal.kind;
                    self.document.publish_presence(self.channel.as_ref(), signal);
                    return Some(SessionUpdate::PresenceSent(kind));
                }
            }
        }
    }

    /// Tick until the in-flight completion (if any) resolves, returning its
    /// outcome. Other updates are applied along the way.
    pub async fn wait_for_assistant(&mut self) -> Option<CommandOutcome> {
        while self.pending.is_some() {
            if let Some(SessionUpdate::Assistant(outcome)) = self.tick().await {
                return Some(outcome);
            }
        }
        None
    }

    /// Release the subscription, the presence timer and any in-flight call.
    pub fn shutdown(&mut self) {
        self.document.teardown();
        self.subscription = None;
        if let Some(handle) = self.pending.take() {
            handle.abort();
            self.router.cancel();
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        let Dispatch::Request(request) = dispatch else {
            return;
        };
        tracing::info!(query_len = request.query.len(), "dispatching assistant command");
        self.pending = Some(spawn_completion(Arc::clone(&self.gateway), request));
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_completion(gateway: Arc<dyn CompletionGateway>, request: CommandRequest) -> JoinHandle<Result<String>> {
    tokio::spawn(async move { gateway.complete(&request).await })
}

async fn next_envelope(subscription: &mut Option<Subscription>) -> Option<Envelope> {
    match subscription.as_mut() {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_pending(pending: &mut Option<JoinHandle<Result<String>>>) -> Result<String> {
    match pending.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::AssistantUnavailable(format!("completion task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}
