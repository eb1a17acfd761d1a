//! Local-first replicated spaces with credential-gated membership.
//!
//! A [`Space`] is a shared container of replicated documents. Who may write to it is
//! decided by a chain of signed credentials stored in append-only feeds: the genesis
//! credential makes the space key the root of trust, and every further member, device
//! and feed is admitted by a credential signed by someone already admitted.
//!
//! The [`SpaceManager`] creates, opens and closes the spaces of one node. Documents of
//! a space are kept in sync with the peers of the space by its
//! [`ReplicationScheduler`](docs::ReplicationScheduler), which batches local changes
//! and hands them to a [`BatchDispatcher`](docs::BatchDispatcher). New members join
//! through single-use [`Invitations`] authenticated by a short shared secret.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(plexus_docsrs, feature(doc_cfg))]

pub mod config;
pub mod credential;
pub mod docs;
pub mod feed;
pub mod invitation;
pub mod metrics;
pub mod space;
pub mod topology;

#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(plexus_docsrs, doc(cfg(any(test, feature = "test-utils"))))]
pub mod test_utils;

pub use plexus_base::{
    DeviceKey, FeedKey, IdentityKey, InvitationId, InvitationTicket, PeerId, PublicKey,
    SecretKey, SpaceKey, Ticket,
};

pub use self::{
    config::Config,
    docs::{DocHandle, DocId, Document, MapDocument},
    invitation::{InvitationHandle, InvitationState, Invitations, SharedSecret},
    space::{Identity, Space, SpaceManager, SpaceState},
};
