//! Base types and utilities for plexus

#![cfg_attr(plexus_docsrs, feature(doc_cfg))]

#[cfg(feature = "key")]
pub mod key;
#[cfg(feature = "ticket")]
pub mod ticket;

#[cfg(feature = "key")]
pub use self::key::{
    DeviceKey, FeedKey, IdentityKey, KeyParsingError, PeerId, PublicKey, SecretKey, Signature,
    SignatureError, SpaceKey,
};
#[cfg(feature = "ticket")]
pub use self::ticket::{InvitationId, InvitationTicket, Ticket};
