//! The cryptographic primitives both routers are built from.
//!
//! This module pins the exchange, AEAD, and stream primitives to concrete
//! algorithms (X25519, XChaCha20-Poly1305, XChaCha20) and exposes them under
//! the small vocabulary the routing code speaks: exchange pairs, shared
//! symmetric keys, nonces, and anonymous sealed boxes. The routing modules
//! never touch the underlying crates directly.
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// The size in bytes of exchange keys and symmetric keys.
pub const KEY_LENGTH: usize = 32;

/// The size in bytes of a nonce.
pub const NONCE_LENGTH: usize = 24;

/// The number of bytes an authenticated seal adds to its plaintext.
pub const AEAD_OVERHEAD: usize = 16;

/// The keystream used for unauthenticated, length-preserving re-encryption.
type StreamXor = chacha20::XChaCha20;

/// Hash bytes with the digest the crate derives identifiers from.
pub fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// A public exchange key, safe to publish and to place in route headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XchgPub([u8; KEY_LENGTH]);

impl XchgPub {
    /// Parse a public key from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<XchgPub> {
        let key = bytes.try_into().map_err(|_| Error::DecryptionFailed)?;
        Ok(XchgPub(key))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Seal a message so that only the matching private key can read it and
    /// the sender stays anonymous.
    ///
    /// A fresh ephemeral exchange pair is generated per call; its public key
    /// is carried in front of the ciphertext, so the output is
    /// `KEY_LENGTH + AEAD_OVERHEAD` bytes longer than the message.
    pub fn anon_seal<R: Rng + CryptoRng>(&self, rng: &mut R, msg: &[u8]) -> Result<Vec<u8>> {
        let ephemeral = XchgPair::generate(rng)?;
        let shared = ephemeral.shared(self);
        let nonce = sealed_box_nonce(ephemeral.public().as_bytes(), self.as_bytes());
        let mut out = ephemeral.public().as_bytes().to_vec();
        out.extend_from_slice(&shared.seal(msg, &nonce));
        Ok(out)
    }

    fn dalek(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

/// A private exchange key.
#[derive(Clone)]
pub struct XchgPriv(StaticSecret);

impl XchgPriv {
    /// The public half of this key.
    pub fn public(&self) -> XchgPub {
        XchgPub(PublicKey::from(&self.0).to_bytes())
    }

    /// Compute the shared symmetric key with a peer's public key.
    ///
    /// The exchange commutes: our private key against their public key gives
    /// the same [`Symmetric`] as their private key against ours.
    pub fn shared(&self, peer: &XchgPub) -> Symmetric {
        Symmetric(self.0.diffie_hellman(&peer.dalek()).to_bytes())
    }

    /// Open a message sealed with [`XchgPub::anon_seal`].
    pub fn anon_open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < KEY_LENGTH + AEAD_OVERHEAD {
            return Err(Error::DecryptionFailed);
        }
        let ephemeral = XchgPub::from_slice(&sealed[..KEY_LENGTH])?;
        let shared = self.shared(&ephemeral);
        let nonce = sealed_box_nonce(ephemeral.as_bytes(), self.public().as_bytes());
        shared.open(&sealed[KEY_LENGTH..], &nonce)
    }
}

/// An exchange key pair.
pub struct XchgPair {
    secret: XchgPriv,
    public: XchgPub,
}

impl XchgPair {
    /// Generate a fresh exchange pair from the given randomness source.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Result<XchgPair> {
        let mut seed = [0u8; KEY_LENGTH];
        rng.try_fill_bytes(&mut seed)?;
        let secret = StaticSecret::from(seed);
        seed.zeroize();
        let public = XchgPub(PublicKey::from(&secret).to_bytes());
        Ok(XchgPair {
            secret: XchgPriv(secret),
            public,
        })
    }

    /// The public half of the pair.
    pub fn public(&self) -> XchgPub {
        self.public
    }

    /// Compute the shared symmetric key with a peer's public key.
    pub fn shared(&self, peer: &XchgPub) -> Symmetric {
        self.secret.shared(peer)
    }

    /// Open a message sealed with [`XchgPub::anon_seal`].
    pub fn anon_open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.secret.anon_open(sealed)
    }

    /// Discard the public half and keep the private key.
    pub fn into_priv(self) -> XchgPriv {
        self.secret
    }
}

/// A shared symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct Symmetric([u8; KEY_LENGTH]);

impl Symmetric {
    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Authenticated encryption; the output carries an `AEAD_OVERHEAD`-byte
    /// tag after the ciphertext.
    pub fn seal(&self, plain: &[u8], nonce: &Nonce) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .encrypt(XNonce::from_slice(nonce.as_bytes()), plain)
            .expect("in-memory sealing cannot fail")
    }

    /// Authenticated decryption; verifies the tag.
    pub fn open(&self, sealed: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(XNonce::from_slice(nonce.as_bytes()), sealed)
            .map_err(|_| Error::DecryptionFailed)
    }

    /// Length-preserving re-encryption without authentication.
    ///
    /// Used where a layer of confidentiality is stacked onto bytes that are
    /// already opaque and whose integrity is checked elsewhere, and where the
    /// length must not change.
    pub fn unmacd_seal(&self, data: &mut [u8], nonce: &Nonce) {
        self.keystream(data, nonce);
    }

    /// Inverse of [`Symmetric::unmacd_seal`].
    pub fn unmacd_open(&self, data: &mut [u8], nonce: &Nonce) {
        self.keystream(data, nonce);
    }

    fn keystream(&self, data: &mut [u8], nonce: &Nonce) {
        let mut cipher = StreamXor::new((&self.0).into(), nonce.as_bytes().into());
        cipher.apply_keystream(data);
    }
}

/// A nonce.
///
/// Hop nonces double as replay-table keys, hence `Eq + Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_LENGTH]);

impl Nonce {
    /// Draw a random nonce from the given randomness source.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Result<Nonce> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rng.try_fill_bytes(&mut nonce)?;
        Ok(Nonce(nonce))
    }

    /// Parse a nonce from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Nonce> {
        let nonce = bytes.try_into().map_err(|_| Error::DecryptionFailed)?;
        Ok(Nonce(nonce))
    }

    /// The raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_LENGTH] {
        &self.0
    }
}

/// The sealed-box nonce binds the ephemeral and recipient keys, so neither
/// side stores nonces for anonymous messages.
fn sealed_box_nonce(ephemeral: &[u8], recipient: &[u8]) -> Nonce {
    let mut hasher = Sha256::new();
    hasher.update(ephemeral);
    hasher.update(recipient);
    let digest: [u8; 32] = hasher.finalize().into();
    Nonce(digest[..NONCE_LENGTH].try_into().expect("digest is wide enough"))
}
