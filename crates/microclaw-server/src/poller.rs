//! Periodic device status request.
//!
//! The reply is not awaited here: it comes back through the read loop as a
//! `SYS_INFO` event. A tick while the link is closed or an exclusive run is
//! active does nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::SessionManager;

/// Default time between status requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Poller {
    session: Arc<SessionManager>,
    interval: Duration,
}

impl Poller {
    pub fn new(session: Arc<SessionManager>, interval: Duration) -> Self {
        Self { session, interval }
    }

    /// Issue one status request if allowed. Returns whether one was written.
    pub async fn tick(&self) -> bool {
        match self.session.request_status().await {
            Ok(sent) => sent,
            Err(e) => {
                // The session has already closed the link and reported it.
                debug!("Status request failed: {}", e);
                false
            }
        }
    }

    /// Tick every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        debug!("Poller started ({:?})", self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BroadcastHub;
    use crate::link::MemoryOpener;

    const PORT: &str = "/dev/ttyACM0";

    fn poller() -> (Poller, Arc<SessionManager>, MemoryOpener) {
        let opener = MemoryOpener::new([PORT]);
        let session = Arc::new(SessionManager::new(
            Arc::new(opener.clone()),
            Arc::new(BroadcastHub::new()),
        ));
        let poller = Poller::new(Arc::clone(&session), DEFAULT_POLL_INTERVAL);
        (poller, session, opener)
    }

    #[tokio::test]
    async fn test_tick_skips_closed_link() {
        let (poller, _session, opener) = poller();
        assert!(!poller.tick().await);
        assert_eq!(opener.written(), "");
    }

    #[tokio::test]
    async fn test_tick_requests_status_silently() {
        let (poller, session, opener) = poller();
        session.connect(PORT).await.unwrap();
        let mut sub = session.hub().subscribe();

        assert!(poller.tick().await);
        assert_eq!(opener.written_lines(), vec!["system_info"]);
        // Status requests are not echoed to observers.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_tick_skips_while_exclusive() {
        let (poller, session, opener) = poller();
        session.connect(PORT).await.unwrap();
        let _guard = session.exclusive().try_acquire().unwrap();

        assert!(!poller.tick().await);
        assert_eq!(opener.written(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_on_interval() {
        let (poller, session, opener) = poller();
        session.connect(PORT).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(opener.written_lines().is_empty());

        tokio::time::sleep(DEFAULT_POLL_INTERVAL * 2).await;
        assert_eq!(opener.written_lines().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
