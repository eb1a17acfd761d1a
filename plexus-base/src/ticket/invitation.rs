//! Tickets for invitations into a space.

use std::{fmt, str::FromStr};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::{
    key::{DeviceKey, SpaceKey},
    ticket::{self, ParseError, Ticket},
};

/// Identifier of a single invitation session.
///
/// It doubles as the rendezvous topic under which guest and host meet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvitationId([u8; 16]);

impl InvitationId {
    /// Create a new random invitation id.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create an invitation id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex form for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..4])
    }
}

impl fmt::Display for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvitationId({})", self.fmt_short())
    }
}

/// A compact, URL-safe descriptor of an invitation.
///
/// The ticket names the invitation, the space it admits into and the device hosting the
/// invitation. The shared secret is deliberately absent: it travels only over the
/// session established from this ticket.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{}", Ticket::serialize(self))]
pub struct InvitationTicket {
    version: u16,
    invitation_id: InvitationId,
    space_key: SpaceKey,
    host: DeviceKey,
}

/// Wire format for [`InvitationTicket`].
#[derive(Serialize, Deserialize)]
enum TicketWireFormat {
    Variant0(Variant0InvitationTicket),
}

#[derive(Serialize, Deserialize)]
struct Variant0InvitationTicket {
    version: u16,
    invitation_id: InvitationId,
    space_key: SpaceKey,
    host: DeviceKey,
}

impl Ticket for InvitationTicket {
    const KIND: &'static str = "invite";

    fn to_bytes(&self) -> Vec<u8> {
        let data = TicketWireFormat::Variant0(Variant0InvitationTicket {
            version: self.version,
            invitation_id: self.invitation_id,
            space_key: self.space_key,
            host: self.host,
        });
        postcard::to_stdvec(&data).expect("postcard serialization failed")
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let res: TicketWireFormat = postcard::from_bytes(bytes)?;
        let TicketWireFormat::Variant0(Variant0InvitationTicket {
            version,
            invitation_id,
            space_key,
            host,
        }) = res;
        if version != Self::PROTOCOL_VERSION {
            return Err(ParseError::verification_failed(
                "unsupported invitation protocol version",
            ));
        }
        Ok(Self {
            version,
            invitation_id,
            space_key,
            host,
        })
    }
}

impl FromStr for InvitationTicket {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ticket::Ticket::deserialize(s)
    }
}

impl InvitationTicket {
    /// Version of the invitation handshake this ticket speaks.
    pub const PROTOCOL_VERSION: u16 = 1;

    /// Creates a new ticket for the current protocol version.
    pub fn new(invitation_id: InvitationId, space_key: SpaceKey, host: DeviceKey) -> Self {
        Self {
            version: Self::PROTOCOL_VERSION,
            invitation_id,
            space_key,
            host,
        }
    }

    /// The handshake protocol version.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// The id of the invitation session.
    pub fn invitation_id(&self) -> InvitationId {
        self.invitation_id
    }

    /// The space the invitation admits into.
    pub fn space_key(&self) -> SpaceKey {
        self.space_key
    }

    /// The device hosting the invitation.
    pub fn host(&self) -> DeviceKey {
        self.host
    }
}

impl Serialize for InvitationTicket {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            let InvitationTicket {
                version,
                invitation_id,
                space_key,
                host,
            } = self;
            (version, invitation_id, space_key, host).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for InvitationTicket {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let (version, invitation_id, space_key, host) =
                Deserialize::deserialize(deserializer)?;
            Ok(Self {
                version,
                invitation_id,
                space_key,
                host,
            })
        }
    }
}
