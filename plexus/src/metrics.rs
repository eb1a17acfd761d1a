//! Metrics tracked by spaces, invitations and replication.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked for spaces, their credential chains, invitations and replication.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "plexus")]
pub struct Metrics {
    /// Number of spaces created locally.
    pub spaces_created: Counter,
    /// Number of spaces reopened from persisted metadata.
    pub spaces_opened: Counter,
    /// Number of spaces accepted after an invitation.
    pub spaces_accepted: Counter,
    /// Number of spaces marked unusable after an integrity failure.
    pub spaces_failed: Counter,

    /// Number of credentials folded into a chain.
    pub credentials_applied: Counter,
    /// Number of credentials rejected by a chain.
    pub credentials_rejected: Counter,

    /// Number of invitations created by this node.
    pub invitations_created: Counter,
    /// Number of invitations that admitted a guest.
    pub invitations_succeeded: Counter,
    /// Number of invitations that ended in error, timeout or cancellation.
    pub invitations_failed: Counter,

    /// Number of mutation batches handed to the dispatcher.
    pub batches_dispatched: Counter,
    /// Number of mutations sent to peers.
    pub mutations_sent: Counter,
    /// Number of mutations applied from peers.
    pub mutations_received: Counter,
    /// Number of batches dropped because the sender is not an admitted device.
    pub batches_refused: Counter,
    /// Number of dispatch attempts that were retried.
    pub dispatch_retries: Counter,
    /// Number of batches given up on after exhausting retries.
    pub dispatch_failures: Counter,
}
