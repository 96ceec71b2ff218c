//! Desktop notification sender

use notify_rust::Notification;
use tracing::debug;

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Show a notification. Failures are logged and otherwise ignored; a
    /// headless host has no notification daemon.
    pub fn send(&self, summary: &str, body: &str) {
        if !self.enabled {
            return;
        }
        if let Err(e) = Notification::new()
            .summary(summary)
            .body(body)
            .appname("taskwarden")
            .show()
        {
            debug!("notification not shown: {}", e);
        }
    }
}
