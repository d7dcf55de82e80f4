//! Routes that decrypt through the commutative field cipher.
//!
//! A route is built backwards, from the destination to the first hop. Each
//! [`RouteBuilder::push`] wraps the header in a layer only that hop can
//! open and appends a per-hop cipher key; the header's length is fixed once
//! building ends, and every hop restores it by refilling the freed tail with
//! random bytes, so the header is the same size everywhere on the wire.
//!
//! Because the field cipher commutes, the hops apply their keys in route
//! order while the sender pre-compensated for them in any order at all; the
//! party holding the full key list recovers the payload with
//! [`Cipher::finalize`].
use std::fmt;

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{Nonce, Symmetric, XchgPair, XchgPub, AEAD_OVERHEAD, KEY_LENGTH, NONCE_LENGTH};
use crate::field::{self, Cipher};
use crate::{Error, Identifier, Result, ID_LENGTH};

/// The byte length of the sealed next-hop identifier in a header layer.
pub const BOX_ID_LEN: usize = AEAD_OVERHEAD + ID_LENGTH;

/// The unencrypted prefix of a header layer: ephemeral key and nonce.
const LAYER_HEAD: usize = KEY_LENGTH + NONCE_LENGTH;

/// A relay's private identity: its identifier and exchange key pair.
pub struct Node {
    id: Identifier,
    key: XchgPair,
}

impl Node {
    /// Create a node; the identifier is derived from the public exchange
    /// key.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Result<Node> {
        let key = XchgPair::generate(rng)?;
        Ok(Node {
            id: Identifier::for_key(&key.public()),
            key,
        })
    }

    /// This node's identifier.
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// The data this node publishes to the network.
    pub fn public(&self) -> PublicNode {
        PublicNode {
            id: self.id,
            key: self.key.public(),
        }
    }

    /// Process a package at this hop.
    ///
    /// The package is rewritten in place: the next-hop identifier is
    /// extracted, the header is unwrapped and padded back to length, and
    /// this hop's key is cycled into the cipher. When the sealed next-hop
    /// field does not open this node is the end of the route; that is a
    /// termination signal, not an error, and the hop still contributes its
    /// cipher key so the route owner's [`Cipher::finalize`] balances.
    pub fn route<R: Rng + CryptoRng>(&self, rng: &mut R, pkg: &mut RoutePackage) -> Result<()> {
        if pkg.map.len() < LAYER_HEAD {
            return Err(Error::DecryptionFailed);
        }
        let ephemeral = XchgPub::from_slice(&pkg.map[..KEY_LENGTH])?;
        let shared = self.key.shared(&ephemeral);
        let nonce = Nonce::from_slice(&pkg.map[KEY_LENGTH..LAYER_HEAD])?;
        let body = &pkg.map[LAYER_HEAD..];

        let opened = if body.len() < BOX_ID_LEN {
            None
        } else {
            shared.open(&body[..BOX_ID_LEN], &nonce).ok()
        };
        match opened {
            Some(next) => {
                let next = Identifier::from_slice(&next)?;
                let mut remainder = body[BOX_ID_LEN..].to_vec();
                let mut tail = vec![0u8; pkg.map.len() - remainder.len()];
                rng.try_fill_bytes(&mut tail)?;

                shared.unmacd_open(&mut remainder, &nonce);
                let keep = remainder.len();
                pkg.map[..keep].copy_from_slice(&remainder);
                pkg.map[keep..].copy_from_slice(&tail);
                pkg.next = Some(next);
            }
            None => {
                debug!(node = %self.id, "next-hop box did not open; terminal hop");
                pkg.next = None;
                pkg.map.clear();
            }
        }

        pkg.cipher.cycle(rng, &cipher_key(&shared, &nonce))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// The data a node publishes: its identifier and public exchange key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PublicNode {
    /// The node's identifier.
    pub id: Identifier,
    /// The node's public exchange key.
    pub key: XchgPub,
}

impl fmt::Display for PublicNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// Accumulates hops into a route, destination first.
///
/// A receiver can build the tail of a route to itself, collapse the keys
/// with [`RouteBuilder::sum_keys`], and publish the builder; a sender then
/// pushes its own hops in front without learning anything about the tail.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RouteBuilder {
    next: Option<Identifier>,
    map: Vec<u8>,
    keys: Vec<Vec<u8>>,
}

impl RouteBuilder {
    /// An empty route.
    pub fn new() -> RouteBuilder {
        RouteBuilder::default()
    }

    /// Add a hop in front of the route.
    ///
    /// The layer carries an ephemeral exchange key, a nonce, the sealed
    /// identifier of the following hop, and the re-encrypted prior header;
    /// the hop's cipher key is the shared key salted with the nonce.
    pub fn push<R: Rng + CryptoRng>(&mut self, rng: &mut R, node: &PublicNode) -> Result<()> {
        let ephemeral = XchgPair::generate(rng)?;
        let shared = ephemeral.shared(&node.key);
        let nonce = Nonce::random(rng)?;

        let next: &[u8] = match &self.next {
            Some(id) => id.as_bytes(),
            None => &[],
        };
        let sealed_next = shared.seal(next, &nonce);
        shared.unmacd_seal(&mut self.map, &nonce);

        let mut layer =
            Vec::with_capacity(LAYER_HEAD + sealed_next.len() + self.map.len());
        layer.extend_from_slice(ephemeral.public().as_bytes());
        layer.extend_from_slice(nonce.as_bytes());
        layer.extend_from_slice(&sealed_next);
        layer.append(&mut self.map);
        self.map = layer;

        self.next = Some(node.id);
        self.keys.push(cipher_key(&shared, &nonce));
        Ok(())
    }

    /// Replace the key list with its field sum, so the builder can be
    /// shared without revealing the per-hop keys.
    pub fn sum_keys(&mut self) {
        self.keys = vec![field::sum_keys(&self.keys)];
    }

    /// The cipher keys the builder currently holds.
    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    /// Finish building and wrap a message for the route.
    pub fn build<R: Rng + CryptoRng>(&self, rng: &mut R, msg: &[u8]) -> Result<RoutePackage> {
        let cipher = Cipher::start(rng, &self.keys, msg)?;
        Ok(RoutePackage {
            map: self.map.clone(),
            cipher,
            next: self.next,
        })
    }
}

/// A message in the process of being routed.
///
/// The header and cipher travel between nodes; `next` is local routing
/// state that each hop overwrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePackage {
    /// The per-hop routing header.
    pub map: Vec<u8>,
    /// The enciphered payload.
    pub cipher: Cipher,
    /// Where to send the package next; `None` once the route ends.
    #[serde(skip)]
    pub next: Option<Identifier>,
}

/// The nonce doubles as a salt so two routes through the same pair of
/// nodes still cycle distinct keys.
fn cipher_key(shared: &Symmetric, nonce: &Nonce) -> Vec<u8> {
    let mut key = shared.as_bytes().to_vec();
    key.extend_from_slice(nonce.as_bytes());
    key
}
