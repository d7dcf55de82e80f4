//! This crate implements the cryptographic core of an anonymity-oriented
//! mixnet: two independent constructions for carrying a payload through a
//! chosen sequence of relay nodes so that each relay learns only its
//! immediate neighbours, the payload is readable only by the final
//! recipient, and the bytes on the wire are rewritten at every hop.
//!
//! The [`cyclic`] module builds routes on top of the commutative prime-field
//! cipher in [`field`]: every hop contributes a key to a shared cipher, and
//! because the cipher commutes the keys may be applied in any order. The
//! [`onion`] module is a classic layered construction in the spirit of
//! Sphinx \[1\], with a fixed-size shrinking header, replay detection, and
//! receiver-anonymous reply routes.
//!
//! Neither construction performs I/O. Node discovery, transport, and message
//! framing belong to the embedding system; this crate only encodes, rewrites,
//! and decodes route packages.
//!
//! \[1\]: Sphinx: A Compact and Provably Secure Mix Format - George Danezis,
//! Ian Goldberg
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub mod crypto;
pub mod cyclic;
pub mod field;
pub mod onion;

pub use field::Cipher;

/// Main error type for fallible routing operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The cipher data is not a whole number of field segments.
    #[error("cipher data must be a multiple of the prime length")]
    WrongLength,

    /// A header transform was applied to something that is not a whole
    /// number of packets.
    #[error("header length must be a multiple of the packet length")]
    BadPackets,

    /// An authenticated decryption did not verify, or a header field could
    /// not be parsed.
    #[error("decryption failed")]
    DecryptionFailed,

    /// A send-route layer was presented to the same node twice.
    #[error("route has exhausted its replay count")]
    Replay,

    /// The system random source failed.
    ///
    /// Routing steps never substitute a deterministic value for a missing
    /// nonce or blinder; the failure is surfaced instead.
    #[error(transparent)]
    Rng(#[from] rand::Error),
}

/// Result type with the error defaulting to [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The length in bytes of node and route identifiers.
pub const ID_LENGTH: usize = 10;

/// A routing identifier.
///
/// Nodes derive theirs from the digest of their public exchange key, so the
/// same key pair always yields the same identifier. Receive routes are named
/// by a random identifier drawn from the same space.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Identifier([u8; ID_LENGTH]);

impl Identifier {
    /// The all-zero identifier, used on the wire to mark the end of a send
    /// route.
    pub const ZERO: Identifier = Identifier([0; ID_LENGTH]);

    /// Derive the identifier for a public exchange key.
    pub fn for_key(key: &crypto::XchgPub) -> Identifier {
        let digest = crypto::digest(key.as_bytes());
        let mut id = [0; ID_LENGTH];
        id.copy_from_slice(&digest[..ID_LENGTH]);
        Identifier(id)
    }

    /// Draw a random identifier, e.g. to name a receive route.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Result<Identifier> {
        let mut id = [0; ID_LENGTH];
        rng.try_fill_bytes(&mut id)?;
        Ok(Identifier(id))
    }

    /// Parse an identifier from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Identifier> {
        let id = bytes.try_into().map_err(|_| Error::DecryptionFailed)?;
        Ok(Identifier(id))
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Whether this is the end-of-route sentinel, compared in constant time.
    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&Identifier::ZERO.0).into()
    }
}

impl fmt::Display for Identifier {
    /// Renders the URL-safe unpadded base64 form used as a dictionary key.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}
