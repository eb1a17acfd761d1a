//! Messages of the invitation handshake and the channels carrying them.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, RwLock},
};

use n0_future::boxed::BoxFuture;
use plexus_base::{DeviceKey, FeedKey, IdentityKey, InvitationId, InvitationTicket, SpaceKey};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use super::{InvitationError, SharedSecret, TransportSnafu};
use crate::credential::Credential;

const CHANNEL_CAP: usize = 8;

/// Messages sent by the guest.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
pub enum GuestMessage {
    /// Open the session for an invitation.
    Introduce {
        /// The invitation from the ticket.
        invitation_id: InvitationId,
        /// The guest's identity.
        identity_key: IdentityKey,
        /// The guest's device.
        device_key: DeviceKey,
        /// Handshake version spoken by the guest.
        version: u16,
    },
    /// The secret requested by the host.
    Authenticate {
        /// The secret entered on the guest.
        secret: SharedSecret,
    },
    /// Ask for the admission of the guest's feeds.
    Admit {
        /// The guest's control feed.
        control_feed: FeedKey,
        /// The guest's data feed.
        data_feed: FeedKey,
    },
}

/// Messages sent by the host.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
pub enum HostMessage {
    /// The space the invitation admits into.
    Introduction {
        /// The space.
        space_key: SpaceKey,
        /// The feed holding the genesis credential.
        genesis_feed: FeedKey,
        /// The host's member identity, the owner of the host device.
        identity_key: IdentityKey,
    },
    /// Ask the guest for the shared secret.
    RequestSecret,
    /// The secret was accepted.
    Authenticated,
    /// The guest was admitted. Carries every credential of the space, in fold order.
    Admitted {
        /// The credentials.
        credentials: Vec<Credential>,
    },
    /// The session ended without admission.
    Rejected {
        /// Why.
        reason: RejectReason,
    },
}

/// Why a host ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    /// The secret did not match.
    SecretMismatch,
    /// The invitation was used before.
    InvitationConsumed,
    /// The invitation expired.
    Timeout,
    /// The host cancelled the invitation.
    Cancelled,
    /// The credential chain refused the admission.
    AdmissionRejected,
    /// The space was closed while admitting.
    SpaceClosed,
    /// The host does not know the invitation.
    UnknownInvitation,
    /// The guest speaks another handshake version.
    UnsupportedVersion,
    /// The guest sent an unexpected message.
    Protocol,
}

/// One end of an invitation session: sends `S`, receives `R`.
#[derive(Debug)]
pub struct Channel<S, R> {
    tx: mpsc::Sender<S>,
    rx: mpsc::Receiver<R>,
}

/// The host end of a session.
pub type HostChannel = Channel<HostMessage, GuestMessage>;
/// The guest end of a session.
pub type GuestChannel = Channel<GuestMessage, HostMessage>;

impl<S: Debug, R: Debug> Channel<S, R> {
    /// Send a message to the other end.
    pub async fn send(&self, msg: S) -> Result<(), InvitationError> {
        trace!(?msg, "send");
        self.tx.send(msg).await.map_err(|_| {
            TransportSnafu {
                message: "session closed by peer",
            }
            .build()
        })
    }

    /// Receive the next message from the other end.
    pub async fn recv(&mut self) -> Result<R, InvitationError> {
        let msg = self.rx.recv().await.ok_or_else(|| {
            TransportSnafu {
                message: "session closed by peer",
            }
            .build()
        })?;
        trace!(?msg, "recv");
        Ok(msg)
    }
}

/// Create a connected pair of channels.
pub fn channel_pair() -> (GuestChannel, HostChannel) {
    let (guest_tx, host_rx) = mpsc::channel(CHANNEL_CAP);
    let (host_tx, guest_rx) = mpsc::channel(CHANNEL_CAP);
    (
        Channel {
            tx: guest_tx,
            rx: guest_rx,
        },
        Channel {
            tx: host_tx,
            rx: host_rx,
        },
    )
}

/// Opens invitation sessions to hosts.
pub trait InvitationTransport: Debug + Send + Sync + 'static {
    /// Connect to the host named in `ticket`.
    fn connect(&self, ticket: &InvitationTicket) -> BoxFuture<Result<GuestChannel, InvitationError>>;
}

/// Connects guests and hosts living in the same process.
///
/// Hosts [`bind`](Self::bind) their device key and receive a [`HostChannel`] per
/// connecting guest.
#[derive(Debug, Clone, Default)]
pub struct MemTransport {
    hosts: Arc<RwLock<BTreeMap<DeviceKey, mpsc::Sender<HostChannel>>>>,
}

impl MemTransport {
    /// Create a transport without hosts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept sessions for `host`. Replaces an earlier binding.
    pub fn bind(&self, host: DeviceKey) -> mpsc::Receiver<HostChannel> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAP);
        self.hosts.write().expect("poisoned").insert(host, tx);
        rx
    }

    /// Stop accepting sessions for `host`.
    pub fn unbind(&self, host: &DeviceKey) -> bool {
        self.hosts.write().expect("poisoned").remove(host).is_some()
    }
}

impl InvitationTransport for MemTransport {
    fn connect(&self, ticket: &InvitationTicket) -> BoxFuture<Result<GuestChannel, InvitationError>> {
        let host = ticket.host();
        let listener = self.hosts.read().expect("poisoned").get(&host).cloned();
        Box::pin(async move {
            let unreachable = || {
                TransportSnafu {
                    message: format!("host {} is unreachable", host.fmt_short()),
                }
                .build()
            };
            let listener = listener.ok_or_else(unreachable)?;
            let (guest, host_end) = channel_pair();
            listener.send(host_end).await.map_err(|_| unreachable())?;
            Ok(guest)
        })
    }
}
