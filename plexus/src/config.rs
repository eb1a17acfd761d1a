//! Configuration of spaces, replication and invitations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration of the [`ReplicationScheduler`](crate::docs::ReplicationScheduler).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Time between the first local change and the flush that sends it.
    ///
    /// All changes within this window are coalesced into one batch per peer.
    pub debounce: Duration,
    /// Pause after a non-empty flush before the next flush may start.
    pub settle: Duration,
    /// Initial delay before retrying a failed dispatch.
    pub retry_min_delay: Duration,
    /// Upper bound of the delay between dispatch retries.
    pub retry_max_delay: Duration,
    /// Retries of a failed dispatch before the failure is surfaced.
    pub max_dispatch_retries: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            settle: Duration::from_millis(50),
            // same envelope as restarting a failed feed replicator
            retry_min_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(5),
            max_dispatch_retries: 5,
        }
    }
}

impl ReplicationConfig {
    /// Set the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the settle delay.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the number of dispatch retries.
    pub fn with_max_dispatch_retries(mut self, retries: usize) -> Self {
        self.max_dispatch_retries = retries;
        self
    }
}

/// Configuration of invitations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvitationConfig {
    /// Hard deadline of an invitation session, on both host and guest.
    pub timeout: Duration,
    /// Number of ended invitations whose outcome is still reported.
    pub retain_finished: usize,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retain_finished: 64,
        }
    }
}

impl InvitationConfig {
    /// Set the session deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how many ended invitations are remembered.
    pub fn with_retain_finished(mut self, count: usize) -> Self {
        self.retain_finished = count;
        self
    }
}

/// Configuration of a [`SpaceManager`](crate::space::SpaceManager).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Replication settings for every space.
    pub replication: ReplicationConfig,
    /// Invitation settings.
    pub invitation: InvitationConfig,
}
