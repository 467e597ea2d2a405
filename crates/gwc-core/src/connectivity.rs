use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    #[default]
    Loading,
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Loading => "loading",
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, ConnectivityState::Loading)
    }

    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved shared verdict wins; while it is still loading the view's own
/// poll decides.
pub fn reconcile(shared: ConnectivityState, poll: ConnectivityState) -> ConnectivityState {
    if shared.is_resolved() {
        shared
    } else {
        poll
    }
}

/// Turns heartbeat probe outcomes into the shared connectivity verdict.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    offline_after_misses: u32,
    consecutive_misses: u32,
    state: ConnectivityState,
}

impl HeartbeatTracker {
    pub fn new(offline_after_misses: u32) -> Self {
        Self {
            offline_after_misses: offline_after_misses.max(1),
            consecutive_misses: 0,
            state: ConnectivityState::Loading,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn record_success(&mut self) -> ConnectivityState {
        self.consecutive_misses = 0;
        self.state = ConnectivityState::Online;
        self.state
    }

    /// A single miss after a success keeps the last verdict; a miss before the
    /// first success leaves the tracker loading until the threshold is hit.
    pub fn record_failure(&mut self) -> ConnectivityState {
        self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        if self.consecutive_misses >= self.offline_after_misses {
            self.state = ConnectivityState::Offline;
        }
        self.state
    }
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new(2)
    }
}
