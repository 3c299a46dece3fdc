//! Debounced typing presence.
//!
//! Collapses a burst of local edit activity into one `activity-start` (sent
//! on the first call of the burst) and one `activity-pause` (sent once the
//! quiet period elapses with no further activity).
//!
//! The debouncer owns exactly one pending deadline. Re-arming replaces it,
//! and dropping or tearing down the debouncer discards it, so a pause can
//! never be emitted after disposal. The owner drives expiry either by
//! awaiting [`PresenceDebouncer::pause_elapsed`] inside its event loop or by
//! calling [`PresenceDebouncer::poll_expired`] with a clock reading.

use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{PresenceKind, PresenceSignal};

/// Reference quiet period.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(1000);

#[derive(Debug)]
pub struct PresenceDebouncer {
    quiet_period: Duration,
    deadline: Option<Instant>,
    last_cursor: Option<usize>,
    file_id: Option<String>,
}

impl PresenceDebouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            deadline: None,
            last_cursor: None,
            file_id: None,
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// True while a pause is pending, i.e. inside a burst.
    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// Record one unit of local activity.
    ///
    /// Re-arms the single pending timer. Returns the `activity-start` signal
    /// when this call opens a new burst, `None` otherwise.
    pub fn notify_activity(&mut self, cursor_offset: Option<usize>, file_id: Option<&str>) -> Option<PresenceSignal> {
        self.notify_activity_at(Instant::now(), cursor_offset, file_id)
    }

    pub fn notify_activity_at(
        &mut self,
        now: Instant,
        cursor_offset: Option<usize>,
        file_id: Option<&str>,
    ) -> Option<PresenceSignal> {
        let opens_burst = self.deadline.is_none();
        self.deadline = Some(now + self.quiet_period);
        if cursor_offset.is_some() {
            self.last_cursor = cursor_offset;
        }
        if let Some(id) = file_id {
            self.file_id = Some(id.to_string());
        }

        opens_burst.then(|| PresenceSignal {
            kind: PresenceKind::ActivityStart,
            cursor_offset,
            file_id: self.file_id.clone(),
        })
    }

    /// Emit the pause if the deadline has passed at `now`.
    pub fn poll_expired(&mut self, now: Instant) -> Option<PresenceSignal> {
        match self.deadline {
            Some(deadline) if now >= deadline => Some(self.fire()),
            _ => None,
        }
    }

    /// Resolves with the `activity-pause` signal once the quiet period passes
    /// uninterrupted. Pending forever when no burst is active.
    ///
    /// Cancel-safe: state only changes after the sleep completes, so it can
    /// be raced in `tokio::select!` and re-polled on the next loop turn.
    pub async fn pause_elapsed(&mut self) -> PresenceSignal {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.fire()
            }
            None => std::future::pending().await,
        }
    }

    /// Cancel any pending timer without emitting.
    pub fn teardown(&mut self) {
        if self.deadline.take().is_some() {
            tracing::debug!("presence timer cancelled on teardown");
        }
        self.last_cursor = None;
        self.file_id = None;
    }

    fn fire(&mut self) -> PresenceSignal {
        self.deadline = None;
        PresenceSignal {
            kind: PresenceKind::ActivityPause,
            cursor_offset: self.last_cursor.take(),
            file_id: self.file_id.take(),
        }
    }
}

impl Default for PresenceDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}

impl Drop for PresenceDebouncer {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: Duration = Duration::from_millis(1000);

    #[test]
    fn test_first_activity_emits_start() {
        let mut d = PresenceDebouncer::new(P);
        let t0 = Instant::now();
        let sig = d.notify_activity_at(t0, Some(4), Some("f1")).unwrap();
        assert_eq!(sig.kind, PresenceKind::ActivityStart);
        assert_eq!(sig.cursor_offset, Some(4));
        assert_eq!(sig.file_id.as_deref(), Some("f1"));
        assert!(d.is_active());
    }

    #[test]
    fn test_burst_emits_single_start() {
        let mut d = PresenceDebouncer::new(P);
        let t0 = Instant::now();
        let starts = (0..10)
            .filter_map(|i| d.notify_activity_at(t0 + Duration::from_millis(i * 200), Some(i as usize), None))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_pause_fires_once_after_last_activity() {
        let mut d = PresenceDebouncer::new(P);
        let t0 = Instant::now();
        d.notify_activity_at(t0, Some(1), None);
        d.notify_activity_at(t0 + Duration::from_millis(900), Some(2), None);

        // 1000ms after the first call but only 100ms after the last: still quiet.
        assert!(d.poll_expired(t0 + Duration::from_millis(1000)).is_none());

        let pause = d.poll_expired(t0 + Duration::from_millis(1900)).unwrap();
        assert_eq!(pause.kind, PresenceKind::ActivityPause);
        assert_eq!(pause.cursor_offset, Some(2));
        assert!(d.poll_expired(t0 + Duration::from_millis(5000)).is_none());
        assert!(!d.is_active());
    }

    #[test]
    fn test_new_burst_after_pause_emits_start_again() {
        let mut d = PresenceDebouncer::new(P);
        let t0 = Instant::now();
        assert!(d.notify_activity_at(t0, None, None).is_some());
        d.poll_expired(t0 + P).unwrap();
        assert!(d.notify_activity_at(t0 + P * 2, None, None).is_some());
    }

    #[test]
    fn test_teardown_cancels_pending_pause() {
        let mut d = PresenceDebouncer::new(P);
        let t0 = Instant::now();
        d.notify_activity_at(t0, Some(1), None);
        d.teardown();
        assert!(d.poll_expired(t0 + P * 3).is_none());
        assert!(!d.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_elapsed_waits_full_quiet_period() {
        let mut d = PresenceDebouncer::new(P);
        let start = Instant::now();
        d.notify_activity(Some(9), Some("f1"));
        let pause = d.pause_elapsed().await;
        assert!(start.elapsed() >= P);
        assert_eq!(pause.kind, PresenceKind::ActivityPause);
        assert_eq!(pause.file_id.as_deref(), Some("f1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_elapsed_is_pending_without_activity() {
        let mut d = PresenceDebouncer::new(P);
        let res = tokio::time::timeout(P * 5, d.pause_elapsed()).await;
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_timer_instead_of_stacking() {
        let mut d = PresenceDebouncer::new(P);
        d.notify_activity(None, None);
        tokio::time::advance(Duration::from_millis(600)).await;
        d.notify_activity(None, None);
        let before = Instant::now();
        d.pause_elapsed().await;
        assert!(before.elapsed() >= Duration::from_millis(1000));
        // Exactly one pause: a second wait finds nothing pending.
        assert!(tokio::time::timeout(P * 3, d.pause_elapsed()).await.is_err());
    }
}
