//! SSH keep-alive implementation.
//!
//! Sends a `keepalive@openssh.com` global request whenever an interval passes
//! without any inbound packet, and gives up on the peer after too many
//! silent intervals in a row.

use crate::ssh::config::KeepaliveConfig;
use async_trait::async_trait;
use latch_platform::LatchResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Global request name used for probes.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// What the keep-alive task needs from a session.
#[async_trait]
pub(crate) trait KeepaliveProbe: Send + Sync {
    /// Monotonic count of inbound packets.
    fn activity(&self) -> u64;

    /// Sends one probe without waiting for its reply.
    async fn probe(&self) -> LatchResult<()>;

    /// Called once the peer stayed silent for more than `count_max` intervals.
    fn expire(&self, missed: u32);
}

/// Keep-alive task handle.
///
/// Manages a background task that probes an idle peer.
pub(crate) struct KeepaliveTask {
    config: KeepaliveConfig,
    stop_signal: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a new keep-alive task (but doesn't start it).
    pub(crate) fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Starts the keep-alive task.
    pub(crate) fn start<P>(&mut self, target: P)
    where
        P: KeepaliveProbe + 'static,
    {
        let KeepaliveConfig {
            interval,
            count_max,
        } = self.config;
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            debug!("Keep-alive task started with interval: {:?}", interval);
            let mut last_seen = target.activity();
            let mut missed = 0u32;

            loop {
                tokio::time::sleep(interval).await;

                if stop_signal.load(Ordering::Relaxed) {
                    debug!("Keep-alive task stopping");
                    break;
                }

                let seen = target.activity();
                if seen != last_seen {
                    last_seen = seen;
                    missed = 0;
                    continue;
                }

                missed += 1;
                if missed > count_max {
                    warn!(missed, "Peer unresponsive - giving up");
                    target.expire(missed);
                    break;
                }

                if let Err(e) = target.probe().await {
                    warn!("Keep-alive failed: {} - stopping task", e);
                    break;
                }
                debug!(missed, "Keep-alive probe sent");
            }

            debug!("Keep-alive task stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Stops the keep-alive task.
    pub(crate) fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);

        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latch_platform::LatchError;
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use std::time::Duration;

    #[derive(Default)]
    struct FakePeer {
        activity: AtomicU64,
        probes: AtomicU32,
        expired: AtomicU32,
        answers: bool,
        fail: AtomicBool,
    }

    #[async_trait]
    impl KeepaliveProbe for Arc<FakePeer> {
        fn activity(&self) -> u64 {
            self.activity.load(Ordering::Relaxed)
        }

        async fn probe(&self) -> LatchResult<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(LatchError::Closed("Simulated error".to_string()));
            }
            self.probes.fetch_add(1, Ordering::Relaxed);
            if self.answers {
                self.activity.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }

        fn expire(&self, missed: u32) {
            self.expired.store(missed, Ordering::Relaxed);
        }
    }

    fn config(ms: u64, count_max: u32) -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_millis(ms),
            count_max,
        }
    }

    #[test]
    fn test_keepalive_task_creation() {
        let task = KeepaliveTask::new(KeepaliveConfig::default());
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_expires() {
        let peer = Arc::new(FakePeer::default());
        let mut task = KeepaliveTask::new(config(100, 2));
        task.start(Arc::clone(&peer));
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(peer.probes.load(Ordering::Relaxed), 2);
        assert_eq!(peer.expired.load(Ordering::Relaxed), 3);
        tokio::task::yield_now().await;
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answering_peer_stays_alive() {
        let peer = Arc::new(FakePeer {
            answers: true,
            ..FakePeer::default()
        });
        let mut task = KeepaliveTask::new(config(100, 1));
        task.start(Arc::clone(&peer));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(peer.expired.load(Ordering::Relaxed), 0);
        assert!(peer.probes.load(Ordering::Relaxed) >= 4);
        assert!(task.is_running());

        task.stop();
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_task_stops_on_error() {
        let peer = Arc::new(FakePeer::default());
        peer.fail.store(true, Ordering::Relaxed);
        let mut task = KeepaliveTask::new(config(50, 5));
        task.start(Arc::clone(&peer));

        tokio::time::sleep(Duration::from_millis(120)).await;
        tokio::task::yield_now().await;
        assert!(!task.is_running());
        assert_eq!(peer.expired.load(Ordering::Relaxed), 0);
    }
}
