//! Push feed intake and its de-duplication against the periodic scan

use super::{ManagerEvent, ProcessManager};
use crate::collector::{NewProcessEvent, ProcessInfo};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

impl ProcessManager {
    pub(super) fn start_push_feed(self: &Arc<Self>) {
        let Some(feed) = self.feed.clone() else {
            debug!("no push feed configured");
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = feed.start(tx, self.cancel.child_token()) {
            error!("Process event feed unavailable, relying on periodic scans: {}", e);
            self.emit(ManagerEvent::PushFeedFailed {
                reason: e.to_string(),
            });
            return;
        }
        self.push_feed_active.store(true, Ordering::Release);

        let manager = Arc::clone(self);
        self.track_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            manager.observe_new(event);
                        }
                        None => {
                            if !manager.cancel.is_cancelled() {
                                error!("Process event feed stopped, relying on periodic scans");
                                manager.emit(ManagerEvent::PushFeedFailed {
                                    reason: "feed closed".to_string(),
                                });
                            }
                            break;
                        }
                    },
                }
            }
            manager.push_feed_active.store(false, Ordering::Release);
        }));
        info!("Push discovery enabled");
    }

    pub fn is_push_feed_active(&self) -> bool {
        self.push_feed_active.load(Ordering::Acquire)
    }

    /// Was `pid` delivered by the push feed within the block window?
    pub(super) fn is_push_blocked(&self, pid: u32, now: Instant) -> bool {
        let block = self.config.general.push_block();
        self.push_seen
            .get(&pid)
            .map_or(false, |seen| now.saturating_duration_since(*seen) < block)
    }

    /// A new process reported by the push feed.
    ///
    /// Returns false when the process was not handed to triage: already being
    /// triaged, reported again within the block window, or already gone.
    pub fn observe_new(self: &Arc<Self>, event: NewProcessEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let pid = event.pid;
        if pid == self.self_pid {
            return false;
        }
        let now = Instant::now();
        if self.in_flight.contains(&pid) {
            debug!(pid, "already pending triage, push event dropped");
            return false;
        }
        if self.is_push_blocked(pid, now) {
            trace!(pid, "duplicate push event dropped");
            return false;
        }
        self.push_seen.insert(pid, now);

        let info = match (event.name, event.start_time) {
            (Some(name), Some(start_time)) => ProcessInfo {
                pid,
                name,
                start_time,
            },
            _ => match self.collector.get_process(pid) {
                Some(info) => info,
                None => {
                    trace!(pid, "exited before triage");
                    return false;
                }
            },
        };

        let manager = Arc::clone(self);
        let path = event.path;
        tokio::spawn(async move {
            manager.triage(info, path).await;
        });
        true
    }
}
