//! Onion routing with a fixed-size shrinking header and reply routes.
//!
//! Headers are a whole number of fixed-size packets, outermost hop first.
//! Each hop opens its own packet, slides the remainder forward, refills the
//! freed tail with random bytes, and re-randomizes every remaining packet
//! with a keystream, so headers of equal length are unlinkable between hops.
//!
//! Send routes peel a layer of payload encryption at every hop. Receive
//! routes run the other way: each hop *adds* a layer under a fresh nonce it
//! records in the header, and the route owner, holding the [`KeySet`], peels
//! them all at once. A receive route is published as a [`SendRouteBuilder`]
//! so a sender can extend it with hops of their own and reach the owner
//! without either party learning the other's half of the path.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{
    Nonce, Symmetric, XchgPair, XchgPriv, XchgPub, AEAD_OVERHEAD, KEY_LENGTH, NONCE_LENGTH,
};
use crate::{Error, Identifier, Result, ID_LENGTH};

/// The byte length of the sealed direction-and-next-hop box.
pub const BOX_ID_LEN: usize = AEAD_OVERHEAD + ID_LENGTH + 1;

/// The byte length of one header packet: ephemeral key, nonce, sealed box.
pub const PACKET_LENGTH: usize = KEY_LENGTH + NONCE_LENGTH + BOX_ID_LEN;

/// What a hop does to the payload when it processes its packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Direction {
    /// The hop peels a layer of payload encryption (send routes).
    RemoveEncryption = 0,
    /// The hop adds a layer of payload encryption (receive routes).
    AddEncryption = 1,
}

/// A per-hop key/nonce binding.
///
/// The same pair seals the hop's next-hop box, re-encrypts the payload, and
/// re-randomizes the remaining header packets.
#[derive(Clone, Serialize, Deserialize)]
pub struct Kn {
    /// The shared symmetric key with the hop.
    pub key: Symmetric,
    /// The nonce recorded in the hop's packet.
    pub nonce: Nonce,
}

impl Kn {
    /// Re-encrypt every header packet in place.
    pub fn seal_packets(&self, packets: &mut [u8]) -> Result<()> {
        self.each_packet(packets, Symmetric::unmacd_seal)
    }

    /// Inverse of [`Kn::seal_packets`].
    pub fn open_packets(&self, packets: &mut [u8]) -> Result<()> {
        self.each_packet(packets, Symmetric::unmacd_open)
    }

    fn each_packet(
        &self,
        packets: &mut [u8],
        transform: fn(&Symmetric, &mut [u8], &Nonce),
    ) -> Result<()> {
        if packets.len() % PACKET_LENGTH != 0 {
            return Err(Error::BadPackets);
        }
        for packet in packets.chunks_mut(PACKET_LENGTH) {
            transform(&self.key, packet, &self.nonce);
        }
        Ok(())
    }
}

/// Everything the owner of a receive route needs to invert a reply.
pub struct KeySet {
    kns: Vec<Kn>,
    base_key: XchgPriv,
}

impl KeySet {
    /// Peel the layers the receive-route hops added and open the anonymous
    /// inner seal.
    ///
    /// Each hop recorded its fresh payload nonce in the header, so the
    /// header is consumed alongside the payload: one packet re-sealed and
    /// truncated per recorded hop.
    pub fn open(&self, pkg: &mut RoutePackage) -> Result<Vec<u8>> {
        for kn in &self.kns {
            kn.seal_packets(&mut pkg.map)?;
            if pkg.map.len() < PACKET_LENGTH {
                return Err(Error::BadPackets);
            }
            let tail = pkg.map.len() - PACKET_LENGTH;
            let nonce = Nonce::from_slice(&pkg.map[tail..tail + NONCE_LENGTH])?;
            pkg.map.truncate(tail);
            kn.key.unmacd_open(&mut pkg.payload, &nonce);
        }
        self.base_key.anon_open(&pkg.payload)
    }
}

/// A relay's private identity plus the per-node state routing needs: the
/// replay table for send-route nonces and the cache of owned receive
/// routes.
///
/// Both tables sit behind locks so one node can process many packages
/// concurrently.
pub struct Node {
    id: Identifier,
    key: XchgPair,
    cache: RwLock<HashMap<Identifier, KeySet>>,
    seen: Mutex<HashMap<Nonce, u8>>,
}

impl Node {
    /// Create a node; the identifier is derived from the public exchange
    /// key.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Result<Node> {
        let key = XchgPair::generate(rng)?;
        Ok(Node {
            id: Identifier::for_key(&key.public()),
            key,
            cache: RwLock::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
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

    /// Remember the [`KeySet`] for a receive route this node owns, so
    /// packages addressed to the route terminate here.
    pub fn register(&self, route: Identifier, keys: KeySet) {
        self.cache.write().expect("route cache lock").insert(route, keys);
    }

    /// Whether a package addressed to `next` should be forwarded.
    ///
    /// False for the zero sentinel and for receive routes this node owns.
    pub fn should_continue(&self, next: Identifier) -> bool {
        !next.is_zero()
            && !self
                .cache
                .read()
                .expect("route cache lock")
                .contains_key(&next)
    }

    /// Open a package that terminated at this node.
    ///
    /// Uses the registered [`KeySet`] when the package arrived over an owned
    /// receive route, and the node's own exchange key otherwise.
    pub fn open(&self, pkg: &mut RoutePackage) -> Result<Vec<u8>> {
        let cache = self.cache.read().expect("route cache lock");
        if let Some(keys) = cache.get(&pkg.next) {
            return keys.open(pkg);
        }
        self.key.anon_open(&pkg.payload)
    }

    /// Start a receive route terminating at this node.
    ///
    /// The route is named by a fresh random identifier, and the node itself
    /// is the first (innermost) hop.
    pub fn receive_route<R: Rng + CryptoRng>(&self, rng: &mut R) -> Result<ReceiveRouteBuilder> {
        let id = Identifier::random(rng)?;
        let mut builder = ReceiveRouteBuilder {
            id,
            next: id,
            map: Vec::new(),
            kns: Vec::new(),
        };
        builder.push(rng, &self.public())?;
        Ok(builder)
    }

    /// Process a package at this hop.
    ///
    /// The package is rewritten in place: the hop's packet is opened, the
    /// payload gains or loses a layer according to the packet's direction,
    /// and the header is slid, refilled, and re-randomized so its length
    /// never changes. All checks run before the package is touched; a
    /// replayed send-route nonce fails with [`Error::Replay`] and leaves
    /// the package intact.
    pub fn route<R: Rng + CryptoRng>(&self, rng: &mut R, pkg: &mut RoutePackage) -> Result<()> {
        if pkg.map.is_empty() || pkg.map.len() % PACKET_LENGTH != 0 {
            return Err(Error::BadPackets);
        }
        let ephemeral = XchgPub::from_slice(&pkg.map[..KEY_LENGTH])?;
        let kn = Kn {
            key: self.key.shared(&ephemeral),
            nonce: Nonce::from_slice(&pkg.map[KEY_LENGTH..KEY_LENGTH + NONCE_LENGTH])?,
        };

        let boxed = kn
            .key
            .open(&pkg.map[KEY_LENGTH + NONCE_LENGTH..PACKET_LENGTH], &kn.nonce)?;
        let direction = Direction::from_u8(boxed[0]).ok_or(Error::DecryptionFailed)?;
        let next = Identifier::from_slice(&boxed[1..])?;

        let keep = pkg.map.len() - PACKET_LENGTH;
        match direction {
            Direction::AddEncryption => {
                let msg_nonce = Nonce::random(rng)?;
                let mut filler = vec![0u8; PACKET_LENGTH - NONCE_LENGTH];
                rng.try_fill_bytes(&mut filler)?;

                kn.key.unmacd_seal(&mut pkg.payload, &msg_nonce);
                pkg.map.copy_within(PACKET_LENGTH.., 0);
                pkg.map[keep..keep + NONCE_LENGTH].copy_from_slice(msg_nonce.as_bytes());
                pkg.map[keep + NONCE_LENGTH..].copy_from_slice(&filler);
                // The nonce slot rides along in the re-randomization; the
                // route owner undoes it packet-wise when peeling.
                kn.open_packets(&mut pkg.map)?;
            }
            Direction::RemoveEncryption => {
                {
                    let mut seen = self.seen.lock().expect("replay table lock");
                    if seen.get(&kn.nonce) == Some(&0) {
                        debug!(node = %self.id, "send nonce seen before");
                        return Err(Error::Replay);
                    }
                    seen.insert(kn.nonce, 0);
                }
                let mut filler = vec![0u8; PACKET_LENGTH];
                rng.try_fill_bytes(&mut filler)?;

                kn.key.unmacd_open(&mut pkg.payload, &kn.nonce);
                pkg.map.copy_within(PACKET_LENGTH.., 0);
                kn.open_packets(&mut pkg.map[..keep])?;
                pkg.map[keep..].copy_from_slice(&filler);
            }
        }
        pkg.next = next;
        Ok(())
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

/// Builds an outbound route, destination first.
///
/// Also the published form of a receive route: [`ReceiveRouteBuilder::receive`]
/// hands back one of these carrying the receive header and the anonymous
/// base key, and a sender extends it with hops of their own.
#[derive(Default, Serialize, Deserialize)]
pub struct SendRouteBuilder {
    next: Identifier,
    map: Vec<u8>,
    kns: Vec<Kn>,
    base_key: Option<XchgPub>,
}

impl SendRouteBuilder {
    /// An empty send route; the innermost next-hop is the zero sentinel.
    pub fn new() -> SendRouteBuilder {
        SendRouteBuilder::default()
    }

    /// Add a hop in front of the route.
    pub fn push<R: Rng + CryptoRng>(&mut self, rng: &mut R, node: &PublicNode) -> Result<()> {
        let kn = push_layer(rng, &mut self.map, self.next, Direction::RemoveEncryption, node)?;
        self.next = node.id;
        self.kns.push(kn);
        Ok(())
    }

    /// Wrap a message for the route.
    ///
    /// When the builder extends a receive route, the message is first
    /// sealed anonymously to the route owner's base key; either way it is
    /// then layered once per pushed hop, innermost first.
    pub fn send<R: Rng + CryptoRng>(&self, rng: &mut R, msg: &[u8]) -> Result<RoutePackage> {
        let mut payload = match &self.base_key {
            Some(base) => base.anon_seal(rng, msg)?,
            None => msg.to_vec(),
        };
        for kn in &self.kns {
            kn.key.unmacd_seal(&mut payload, &kn.nonce);
        }
        Ok(RoutePackage {
            map: self.map.clone(),
            payload,
            next: self.next,
        })
    }
}

/// Builds the receiver-owned tail of a route.
///
/// Created by [`Node::receive_route`]; hops pushed here add payload
/// encryption when traversed. [`ReceiveRouteBuilder::receive`] consumes the
/// builder, so a frozen route cannot be extended with more receive hops by
/// accident.
pub struct ReceiveRouteBuilder {
    id: Identifier,
    next: Identifier,
    map: Vec<u8>,
    kns: Vec<Kn>,
}

impl ReceiveRouteBuilder {
    /// The route's identifier.
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Add a hop in front of the route.
    pub fn push<R: Rng + CryptoRng>(&mut self, rng: &mut R, node: &PublicNode) -> Result<()> {
        let kn = push_layer(rng, &mut self.map, self.next, Direction::AddEncryption, node)?;
        self.next = node.id;
        self.kns.push(kn);
        Ok(())
    }

    /// Freeze the receive route.
    ///
    /// Returns the route identifier, the [`KeySet`] the owner keeps (the
    /// recorded hop bindings plus a fresh anonymous base key), and the
    /// publishable [`SendRouteBuilder`] that carries the header and the
    /// base public key but none of the hop keys.
    pub fn receive<R: Rng + CryptoRng>(
        self,
        rng: &mut R,
    ) -> Result<(Identifier, KeySet, SendRouteBuilder)> {
        let base = XchgPair::generate(rng)?;
        let public = base.public();
        let keys = KeySet {
            kns: self.kns,
            base_key: base.into_priv(),
        };
        let sender = SendRouteBuilder {
            next: self.next,
            map: self.map,
            kns: Vec::new(),
            base_key: Some(public),
        };
        Ok((self.id, keys, sender))
    }
}

/// A message in the process of being routed.
///
/// The header and payload travel between nodes; `next` is local routing
/// state that each hop overwrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePackage {
    /// The header: a whole number of packets, outermost hop first.
    pub map: Vec<u8>,
    /// The layered payload.
    pub payload: Vec<u8>,
    /// Where to send the package next; zero or a cached route id once the
    /// route ends.
    #[serde(skip)]
    pub next: Identifier,
}

/// Wrap the header in one more hop layer and return the hop's binding.
fn push_layer<R: Rng + CryptoRng>(
    rng: &mut R,
    map: &mut Vec<u8>,
    next: Identifier,
    direction: Direction,
    node: &PublicNode,
) -> Result<Kn> {
    let ephemeral = XchgPair::generate(rng)?;
    let kn = Kn {
        key: ephemeral.shared(&node.key),
        nonce: Nonce::random(rng)?,
    };
    kn.seal_packets(map)?;

    let mut boxed = [0u8; ID_LENGTH + 1];
    boxed[0] = direction as u8;
    boxed[1..].copy_from_slice(next.as_bytes());
    let sealed = kn.key.seal(&boxed, &kn.nonce);

    let mut layer = Vec::with_capacity(map.len() + PACKET_LENGTH);
    layer.extend_from_slice(ephemeral.public().as_bytes());
    layer.extend_from_slice(kn.nonce.as_bytes());
    layer.extend_from_slice(&sealed);
    layer.append(map);
    *map = layer;
    Ok(kn)
}
