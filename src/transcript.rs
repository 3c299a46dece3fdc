//! Ordered, append-only chat transcript with scroll bookkeeping.
//!
//! ## Guarantees
//! - View order equals append order; entries are never reordered or removed
//! - A second append with an already-seen id is ignored (debug-logged)
//!
//! ## Scroll model
//! The renderer reports its viewport through [`Viewport`]. Before each append
//! the store notes whether the viewer sat at the bottom; the next
//! [`TranscriptStore::redraw`] then either snaps to the new bottom or keeps
//! the stored manual offset exactly.

use std::collections::HashSet;

use crate::protocol::ChatEntry;

/// Geometry reported by whatever renders the transcript, in arbitrary units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewport {
    pub scroll_offset: u64,
    pub client_height: u64,
    pub content_height: u64,
}

impl Viewport {
    /// Content end coincides with the visible end.
    pub fn at_bottom(&self) -> bool {
        self.content_height.saturating_sub(self.scroll_offset) <= self.client_height
    }

    pub fn bottom_offset(&self) -> u64 {
        self.content_height.saturating_sub(self.client_height)
    }
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Added,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct TranscriptStore {
    entries: Vec<ChatEntry>,
    seen: HashSet<String>,
    has_unread: bool,
    last_scroll_offset: u64,
    viewport: Viewport,
    snap_to_bottom: bool,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the end of the log.
    ///
    /// Duplicate ids leave the log untouched. The unread flag is raised unless
    /// the viewer was already looking at the bottom of the transcript.
    pub fn append(&mut self, entry: ChatEntry) -> Appended {
        if !self.seen.insert(entry.id.clone()) {
            tracing::debug!(id = %entry.id, "ignoring duplicate chat entry");
            return Appended::Duplicate;
        }

        let at_bottom = self.viewport.at_bottom();
        self.snap_to_bottom = self.snap_to_bottom || at_bottom;
        if !at_bottom {
            self.has_unread = true;
        }
        self.entries.push(entry);
        Appended::Added
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ChatEntry> {
        self.entries.last()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn has_unread(&self) -> bool {
        self.has_unread
    }

    pub fn last_scroll_offset(&self) -> u64 {
        self.last_scroll_offset
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Store a manual scroll offset reported by the viewer.
    pub fn record_scroll_position(&mut self, offset: u64) {
        self.last_scroll_offset = offset;
        self.viewport.scroll_offset = offset;
    }

    /// Update the visible height without touching the scroll offset.
    pub fn set_client_height(&mut self, client_height: u64) {
        self.viewport.client_height = client_height;
    }

    /// Apply a redraw with the new total content height and return the scroll
    /// offset the renderer must use.
    pub fn redraw(&mut self, content_height: u64) -> u64 {
        self.viewport.content_height = content_height;
        let offset = if std::mem::take(&mut self.snap_to_bottom) {
            // The snapped position becomes the one later redraws hold.
            self.last_scroll_offset = self.viewport.bottom_offset();
            self.last_scroll_offset
        } else {
            self.last_scroll_offset
        };
        self.viewport.scroll_offset = offset;
        offset
    }

    /// Clear the unread flag and return the stored manual offset to restore.
    pub fn acknowledge_unread(&mut self) -> u64 {
        self.has_unread = false;
        self.viewport.scroll_offset = self.last_scroll_offset;
        self.last_scroll_offset
    }
}
