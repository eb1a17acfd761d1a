//! Signed statements governing who may write to a space.
//!
//! A space's authorization state is the left-fold of its credentials in log order. The
//! first credential is a self-signed [`Assertion::SpaceGenesis`]; every later credential
//! must be issued by a key the fold already authorizes. See [`CredentialChain`].

use plexus_base::{DeviceKey, FeedKey, IdentityKey, PublicKey, SecretKey, Signature, SpaceKey};
use serde::{Deserialize, Serialize};

pub mod chain;

pub use self::chain::{
    Applied, AuthState, ChainError, ChainEvent, CredentialChain, FeedInfo, Intake,
    RejectedCredential,
};

/// The role of an admitted feed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum FeedDesignation {
    /// Carries credentials.
    Control,
    /// Carries document mutations.
    Data,
}

/// The statement a [`Credential`] makes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Assertion {
    /// The space exists and its control log starts at `control_feed`.
    SpaceGenesis {
        /// The space.
        space_key: SpaceKey,
        /// The genesis (control) feed of the creator.
        control_feed: FeedKey,
    },
    /// `feed_key` may carry records of the space.
    FeedAdmission {
        /// The space.
        space_key: SpaceKey,
        /// The admitted feed.
        feed_key: FeedKey,
        /// What the feed carries.
        designation: FeedDesignation,
    },
    /// `identity_key` is a member of the space, writing from `device_key`.
    MemberAdmission {
        /// The space.
        space_key: SpaceKey,
        /// The member identity, which becomes an authorized issuer.
        identity_key: IdentityKey,
        /// The device the member replicates from.
        device_key: DeviceKey,
    },
}

impl Assertion {
    /// The space this assertion is about.
    pub fn space_key(&self) -> SpaceKey {
        match self {
            Assertion::SpaceGenesis { space_key, .. }
            | Assertion::FeedAdmission { space_key, .. }
            | Assertion::MemberAdmission { space_key, .. } => *space_key,
        }
    }

    /// Short name of the assertion kind, for logging.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// A signed [`Assertion`].
///
/// This is the record format of control feeds: postcard bytes of the assertion (kind tag
/// plus payload), the issuer's public key and the issuer's signature over the assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    assertion: Assertion,
    issuer: PublicKey,
    signature: Signature,
}

impl Credential {
    /// Sign `assertion` with `issuer`.
    pub fn sign(assertion: Assertion, issuer: &SecretKey) -> Self {
        let signature = issuer.sign(&signing_bytes(&assertion));
        Self {
            assertion,
            issuer: issuer.public(),
            signature,
        }
    }

    /// Check the issuer's signature.
    pub fn verify(&self) -> bool {
        self.issuer
            .verify(&signing_bytes(&self.assertion), &self.signature)
            .is_ok()
    }

    /// The signed statement.
    pub fn assertion(&self) -> &Assertion {
        &self.assertion
    }

    /// The key that signed this credential.
    pub fn issuer(&self) -> PublicKey {
        self.issuer
    }

    /// The signature, which also identifies the credential.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The space this credential is about.
    pub fn space_key(&self) -> SpaceKey {
        self.assertion.space_key()
    }

    /// Encode as a control feed record.
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_stdvec(self).expect("postcard serialization failed")
    }

    /// Decode a control feed record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

fn signing_bytes(assertion: &Assertion) -> Vec<u8> {
    postcard::to_stdvec(assertion).expect("postcard serialization failed")
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn credential_signature() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3u64);
        let space = SecretKey::generate(&mut rng);
        let feed = SecretKey::generate(&mut rng).public();
        let credential = Credential::sign(
            Assertion::SpaceGenesis {
                space_key: space.public(),
                control_feed: feed,
            },
            &space,
        );
        assert!(credential.verify());
        assert_eq!(credential.assertion().kind(), "space_genesis");

        let decoded = Credential::from_bytes(&credential.to_bytes()).unwrap();
        assert_eq!(decoded, credential);

        // re-targeting the assertion breaks the signature
        let forged = Credential {
            assertion: Assertion::FeedAdmission {
                space_key: space.public(),
                feed_key: feed,
                designation: FeedDesignation::Data,
            },
            ..credential
        };
        assert!(!forged.verify());
    }
}
