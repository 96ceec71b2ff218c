//! Foreground (active window) notifications

use serde::{Deserialize, Serialize};

/// The active process changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundEvent {
    pub pid: u32,
    #[serde(default)]
    pub fullscreen: bool,
}
