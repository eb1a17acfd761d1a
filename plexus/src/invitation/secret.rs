//! The out-of-band secret that authenticates a guest.

use std::fmt;

use n0_future::boxed::BoxFuture;
use rand::Rng;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Number of digits of a generated [`SharedSecret`].
pub const SECRET_DIGITS: usize = 6;

/// A short code the host shares with the guest out of band.
#[derive(Clone, Serialize, Deserialize)]
pub struct SharedSecret(String);

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl From<&str> for SharedSecret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl SharedSecret {
    /// Wrap an existing code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Generate a random numeric code of [`SECRET_DIGITS`] digits.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let code = (0..SECRET_DIGITS)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        Self(code)
    }

    /// The code, for display to the user.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare in constant time.
    pub fn verify(&self, other: &SharedSecret) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

/// Decides on the host whether a secret supplied by a guest is valid.
pub trait SecretValidator: Send + Sync + 'static {
    /// Whether `secret` authenticates the guest.
    fn validate(&self, secret: &SharedSecret) -> bool;
}

impl SecretValidator for SharedSecret {
    fn validate(&self, secret: &SharedSecret) -> bool {
        self.verify(secret)
    }
}

impl<F> SecretValidator for F
where
    F: Fn(&SharedSecret) -> bool + Send + Sync + 'static,
{
    fn validate(&self, secret: &SharedSecret) -> bool {
        self(secret)
    }
}

/// Supplies the secret on the guest, typically by asking the user.
pub trait SecretProvider: Send + Sync + 'static {
    /// The secret, or `None` if the user gave up.
    fn provide(&self) -> BoxFuture<Option<SharedSecret>>;
}

impl SecretProvider for SharedSecret {
    fn provide(&self) -> BoxFuture<Option<SharedSecret>> {
        let secret = self.clone();
        Box::pin(async move { Some(secret) })
    }
}

impl<F> SecretProvider for F
where
    F: Fn() -> BoxFuture<Option<SharedSecret>> + Send + Sync + 'static,
{
    fn provide(&self) -> BoxFuture<Option<SharedSecret>> {
        self()
    }
}
