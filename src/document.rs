//! Shared document state for one participant.
//!
//! Holds the single active [`DocumentSnapshot`], a queue of remote content
//! for files that are not active, and an advisory table of peer cursors.
//!
//! Remote content replaces the local snapshot wholesale. Concurrent edits on
//! the same file from two participants overwrite each other: whichever update
//! is delivered last wins. There is no merge.

use std::collections::HashMap;

use crate::channel::EventChannel;
use crate::error::{Result, SyncError};
use crate::presence::PresenceDebouncer;
use crate::protocol::{ChannelEvent, DocumentSnapshot, PresenceSignal};

/// Last cursor report from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub file_id: Option<String>,
    pub offset: Option<usize>,
    pub typing: bool,
}

/// What happened to a remote content update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Replaced the active snapshot.
    Applied,
    /// Stored until the file is activated.
    Queued,
}

pub struct DocumentSyncSession {
    active: Option<DocumentSnapshot>,
    queued: HashMap<String, String>,
    cursors: HashMap<String, RemoteCursor>,
    presence: PresenceDebouncer,
}

impl DocumentSyncSession {
    pub fn new(presence: PresenceDebouncer) -> Self {
        Self {
            active: None,
            queued: HashMap::new(),
            cursors: HashMap::new(),
            presence,
        }
    }

    pub fn active(&self) -> Option<&DocumentSnapshot> {
        self.active.as_ref()
    }

    pub fn active_file_id(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.file_id.as_str())
    }

    /// Make `snapshot` the active document. Content queued for this file
    /// while it was inactive wins over the supplied content.
    pub fn activate(&mut self, mut snapshot: DocumentSnapshot) {
        if let Some(content) = self.queued.remove(&snapshot.file_id) {
            tracing::debug!(file_id = %snapshot.file_id, "applying queued remote content");
            snapshot.content = content;
        }
        self.active = Some(snapshot);
    }

    /// Content waiting for `file_id` to become active.
    pub fn queued_content(&self, file_id: &str) -> Option<&str> {
        self.queued.get(file_id).map(String::as_str)
    }

    /// Apply an edit made by the local user and broadcast it.
    ///
    /// The snapshot is updated first, then the debouncer sees the activity
    /// (publishing `typing-start` when it opens a burst), then the full
    /// content goes out as `file-updated`. Publish failures are logged; the
    /// local state stands.
    pub fn apply_local_edit(
        &mut self,
        channel: &dyn EventChannel,
        file_id: &str,
        new_content: &str,
        cursor_offset: usize,
    ) -> Result<()> {
        let active = match self.active.as_mut() {
            Some(snap) if snap.file_id == file_id => snap,
            _ => {
                return Err(SyncError::InactiveFile {
                    file_id: file_id.to_string(),
                })
            }
        };
        active.content = new_content.to_string();

        if let Some(start) = self.presence.notify_activity(Some(cursor_offset), Some(file_id)) {
            publish_logged(channel, start.into_event());
        }
        publish_logged(
            channel,
            ChannelEvent::FileUpdated {
                file_id: file_id.to_string(),
                new_content: new_content.to_string(),
            },
        );
        Ok(())
    }

    pub fn on_remote_content_update(&mut self, file_id: &str, new_content: &str) -> RemoteApply {
        match self.active.as_mut() {
            Some(snap) if snap.file_id == file_id => {
                snap.content = new_content.to_string();
                RemoteApply::Applied
            }
            _ => {
                tracing::debug!(file_id, "queueing update for inactive file");
                self.queued.insert(file_id.to_string(), new_content.to_string());
                RemoteApply::Queued
            }
        }
    }

    /// Record a peer's cursor. Unknown participants and files are accepted.
    pub fn on_remote_cursor(&mut self, participant_id: &str, file_id: Option<&str>, cursor_offset: Option<usize>, typing: bool) {
        let cursor = self.cursors.entry(participant_id.to_string()).or_insert(RemoteCursor {
            file_id: None,
            offset: None,
            typing,
        });
        if let Some(id) = file_id {
            cursor.file_id = Some(id.to_string());
        }
        if cursor_offset.is_some() {
            cursor.offset = cursor_offset;
        }
        cursor.typing = typing;
    }

    pub fn forget_participant(&mut self, participant_id: &str) {
        self.cursors.remove(participant_id);
    }

    pub fn cursor(&self, participant_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(participant_id)
    }

    pub fn cursors(&self) -> impl Iterator<Item = (&str, &RemoteCursor)> {
        self.cursors.iter().map(|(id, c)| (id.as_str(), c))
    }

    pub fn presence_pending(&self) -> bool {
        self.presence.is_active()
    }

    /// Resolves with the pause signal once local typing goes quiet.
    /// Cancel-safe; pending forever when nobody is typing.
    pub async fn presence_paused(&mut self) -> PresenceSignal {
        self.presence.pause_elapsed().await
    }

    pub fn publish_presence(&self, channel: &dyn EventChannel, signal: PresenceSignal) {
        publish_logged(channel, signal.into_event());
    }

    /// Drop the pending pause without emitting it.
    pub fn teardown(&mut self) {
        self.presence.teardown();
    }
}

fn publish_logged(channel: &dyn EventChannel, event: ChannelEvent) {
    let name = event.name();
    if let Err(e) = channel.publish(event) {
        tracing::warn!(event = name, error = %e, "publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackHub;
    use crate::protocol::{PresenceKind, PresencePayload};
    use std::time::Duration;

    fn session() -> DocumentSyncSession {
        DocumentSyncSession::new(PresenceDebouncer::new(Duration::from_millis(1000)))
    }

    #[tokio::test]
    async fn test_local_then_remote_last_write_wins() {
        let hub = LoopbackHub::new();
        let chan = hub.connect("ada");
        let mut doc = session();
        doc.activate(DocumentSnapshot::new("f1", ""));

        doc.apply_local_edit(&chan, "f1", "hello", 5).unwrap();
        assert_eq!(doc.active().unwrap().content, "hello");
        assert_eq!(doc.on_remote_content_update("f1", "world"), RemoteApply::Applied);
        assert_eq!(doc.active().unwrap().content, "world");
    }

    #[tokio::test]
    async fn test_local_edit_publishes_start_once_and_full_content_every_call() {
        let hub = LoopbackHub::new();
        let chan = hub.connect("ada");
        let peer = hub.connect("bob");
        let mut sub = peer.subscribe().unwrap();
        let mut doc = session();
        doc.activate(DocumentSnapshot::new("f1", ""));

        doc.apply_local_edit(&chan, "f1", "h", 1).unwrap();
        doc.apply_local_edit(&chan, "f1", "he", 2).unwrap();

        let mut events = Vec::new();
        while let Some(env) = sub.try_recv() {
            events.push(env.event);
        }
        assert_eq!(
            events,
            vec![
                ChannelEvent::TypingStart(PresencePayload { cursor_position: Some(1), file_id: Some("f1".into()) }),
                ChannelEvent::FileUpdated { file_id: "f1".into(), new_content: "h".into() },
                ChannelEvent::FileUpdated { file_id: "f1".into(), new_content: "he".into() },
            ]
        );
        assert!(doc.presence_pending());
    }

    #[tokio::test]
    async fn test_edit_on_inactive_file_is_rejected() {
        let hub = LoopbackHub::new();
        let chan = hub.connect("ada");
        let mut doc = session();
        let err = doc.apply_local_edit(&chan, "f1", "x", 1).unwrap_err();
        assert!(matches!(err, SyncError::InactiveFile { ref file_id } if file_id == "f1"));

        doc.activate(DocumentSnapshot::new("f2", ""));
        assert!(doc.apply_local_edit(&chan, "f1", "x", 1).is_err());
    }

    #[test]
    fn test_remote_update_for_inactive_file_is_queued_then_applied() {
        let mut doc = session();
        doc.activate(DocumentSnapshot::new("f1", "one"));
        assert_eq!(doc.on_remote_content_update("f2", "first"), RemoteApply::Queued);
        assert_eq!(doc.on_remote_content_update("f2", "second"), RemoteApply::Queued);
        assert_eq!(doc.active().unwrap().content, "one");
        assert_eq!(doc.queued_content("f2"), Some("second"));

        doc.activate(DocumentSnapshot::new("f2", "stale"));
        assert_eq!(doc.active().unwrap().content, "second");
        assert!(doc.queued_content("f2").is_none());
    }

    #[test]
    fn test_remote_cursor_tolerates_unknown_participants() {
        let mut doc = session();
        doc.on_remote_cursor("ghost", Some("nowhere"), Some(99), true);
        doc.on_remote_cursor("ghost", None, None, false);
        let c = doc.cursor("ghost").unwrap();
        assert_eq!(c.file_id.as_deref(), Some("nowhere"));
        assert_eq!(c.offset, Some(99));
        assert!(!c.typing);

        doc.forget_participant("ghost");
        doc.forget_participant("never-seen");
        assert!(doc.cursor("ghost").is_none());
    }

    #[test]
    fn test_cursor_updates_never_touch_content() {
        let mut doc = session();
        doc.activate(DocumentSnapshot::new("f1", "body"));
        doc.on_remote_cursor("p", Some("f1"), Some(2), true);
        assert_eq!(doc.active().unwrap().content, "body");
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_pause_after_quiet_period() {
        let hub = LoopbackHub::new();
        let chan = hub.connect("ada");
        let mut doc = session();
        doc.activate(DocumentSnapshot::new("f1", ""));
        doc.apply_local_edit(&chan, "f1", "a", 1).unwrap();
        doc.apply_local_edit(&chan, "f1", "ab", 2).unwrap();

        let pause = doc.presence_paused().await;
        assert_eq!(pause.kind, PresenceKind::ActivityPause);
        assert_eq!(pause.cursor_offset, Some(2));
        assert!(!doc.presence_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_drops_pending_pause() {
        let hub = LoopbackHub::new();
        let chan = hub.connect("ada");
        let mut doc = session();
        doc.activate(DocumentSnapshot::new("f1", ""));
        doc.apply_local_edit(&chan, "f1", "a", 1).unwrap();
        doc.teardown();
        let res = tokio::time::timeout(Duration::from_secs(5), doc.presence_paused()).await;
        assert!(res.is_err());
    }
}
