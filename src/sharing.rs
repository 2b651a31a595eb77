//! Keep-alive policy deciding when a per-key actor starts and stops.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingCommand {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Started,
    /// No subscribers since the given instant; stop once keep-alive elapses.
    Draining(Instant),
}

/// Debounced state machine over a subscriber count.
///
/// Emits [`SharingCommand::Start`] when the count goes from zero to non-zero and
/// [`SharingCommand::Stop`] only after the count stayed at zero for the whole
/// keep-alive window. Re-subscribing inside the window cancels the pending stop
/// without emitting anything, so in-flight work survives a quick reattach.
#[derive(Debug)]
pub struct ActorSharingStarted {
    keep_alive: Duration,
    phase: Phase,
}

impl ActorSharingStarted {
    pub fn new(keep_alive: Duration) -> Self {
        ActorSharingStarted {
            keep_alive,
            phase: Phase::Stopped,
        }
    }

    /// Start in the started phase, for an owner that already has a subscriber.
    ///
    /// If the count is already zero when first observed, a stop follows after
    /// the keep-alive window instead of waiting for a subscriber forever.
    pub fn started(keep_alive: Duration) -> Self {
        ActorSharingStarted {
            keep_alive,
            phase: Phase::Started,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn is_started(&self) -> bool {
        self.phase != Phase::Stopped
    }

    /// Hold off the next stop until `deadline`, for an owner that found the
    /// count went back to zero later than this policy observed.
    pub fn hold_until(&mut self, deadline: Instant) {
        self.phase = Phase::Draining(deadline);
    }

    /// Wait for the next command. Returns `None` once the count sender is dropped.
    pub async fn next(&mut self, counts: &mut watch::Receiver<usize>) -> Option<SharingCommand> {
        loop {
            let count = *counts.borrow_and_update();
            match (self.phase, count) {
                (Phase::Stopped, 0) => {
                    counts.changed().await.ok()?;
                }
                (Phase::Stopped, _) => {
                    self.phase = Phase::Started;
                    return Some(SharingCommand::Start);
                }
                (Phase::Started, 0) => {
                    self.phase = Phase::Draining(Instant::now() + self.keep_alive);
                }
                (Phase::Started, _) => {
                    counts.changed().await.ok()?;
                }
                (Phase::Draining(_), n) if n > 0 => {
                    self.phase = Phase::Started;
                }
                (Phase::Draining(deadline), _) => {
                    tokio::select! {
                        changed = counts.changed() => {
                            changed.ok()?;
                            // A subscriber may have come and gone before this
                            // wake, so the window restarts from now.
                            self.phase = Phase::Started;
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            self.phase = Phase::Stopped;
                            return Some(SharingCommand::Stop);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_on_first_subscriber() {
        let (tx, mut rx) = watch::channel(0usize);
        let mut sharing = ActorSharingStarted::new(Duration::from_secs(5));

        tx.send_replace(1);
        assert_eq!(sharing.next(&mut rx).await, Some(SharingCommand::Start));
        assert!(sharing.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_keep_alive() {
        let (tx, mut rx) = watch::channel(1usize);
        let mut sharing = ActorSharingStarted::new(Duration::from_secs(5));
        assert_eq!(sharing.next(&mut rx).await, Some(SharingCommand::Start));

        let released = Instant::now();
        tx.send_replace(0);
        assert_eq!(sharing.next(&mut rx).await, Some(SharingCommand::Stop));
        assert!(released.elapsed() >= Duration::from_secs(5));
        assert!(!sharing.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_within_window_cancels_stop() {
        let (tx, mut rx) = watch::channel(1usize);
        let mut sharing = ActorSharingStarted::new(Duration::from_secs(5));
        assert_eq!(sharing.next(&mut rx).await, Some(SharingCommand::Start));

        let task = tokio::spawn(async move {
            let cmd = sharing.next(&mut rx).await;
            (cmd, Instant::now())
        });

        let begin = Instant::now();
        tx.send_replace(0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send_replace(1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send_replace(0);

        let (cmd, stopped_at) = task.await.unwrap();
        assert_eq!(cmd, Some(SharingCommand::Stop));
        // The stop is measured from the second release, not the first.
        assert!(stopped_at - begin >= Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_and_release_between_polls_restarts_window() {
        let (tx, mut rx) = watch::channel(1usize);
        let mut sharing = ActorSharingStarted::new(Duration::from_secs(1));
        assert_eq!(sharing.next(&mut rx).await, Some(SharingCommand::Start));

        let task = tokio::spawn(async move {
            let cmd = sharing.next(&mut rx).await;
            (cmd, Instant::now())
        });

        let begin = Instant::now();
        tx.send_replace(0);
        tokio::time::sleep(Duration::from_millis(800)).await;
        // The policy never observes the 1: both sends land before it polls.
        tx.send_replace(1);
        tx.send_replace(0);

        let (cmd, stopped_at) = task.await.unwrap();
        assert_eq!(cmd, Some(SharingCommand::Stop));
        assert!(stopped_at - begin >= Duration::from_millis(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_until_delays_stop() {
        let (_tx, mut rx) = watch::channel(0usize);
        let mut sharing = ActorSharingStarted::new(Duration::from_secs(1));

        let begin = Instant::now();
        sharing.hold_until(begin + Duration::from_secs(3));
        assert_eq!(sharing.next(&mut rx).await, Some(SharingCommand::Stop));
        assert!(begin.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_owner_stops_without_ever_seeing_a_subscriber() {
        let (_tx, mut rx) = watch::channel(0usize);
        let mut sharing = ActorSharingStarted::started(Duration::from_secs(2));
        assert!(sharing.is_started());

        let begin = Instant::now();
        assert_eq!(sharing.next(&mut rx).await, Some(SharingCommand::Stop));
        assert!(begin.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_dropped_ends_stream() {
        let (tx, mut rx) = watch::channel(0usize);
        let mut sharing = ActorSharingStarted::new(Duration::from_secs(1));
        drop(tx);
        assert_eq!(sharing.next(&mut rx).await, None);
    }
}
