//! A commutative cipher over a fixed prime field.
//!
//! Data is processed in segments interpreted as integers below a public
//! prime `p`. Applying a key multiplies each segment by `r^k mod p`, where
//! `r` is a per-segment primitive root; because multiplication in the group
//! commutes, any set of keys can be applied in any order, and a route of
//! relays can each contribute a key without coordinating. [`Cipher::start`]
//! pre-applies the negated key sum and [`Cipher::finalize`] cancels the
//! random blinders, so once every key has been applied exactly once the
//! original segments fall out.
//!
//! The per-segment primitive roots depend only on `p` and are memoized in a
//! process-wide table, so every cipher instance sees the same sequence.
use std::sync::RwLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The byte length of the prime; all cipher data is a multiple of this.
pub const PRIME_LENGTH: usize = 41;

/// Big-endian bytes of the field prime, (2 * 571)^32 + 1.
///
/// 70035030982873223990326147545273826083163227324677473758120515445066011271064596346550284227444737
const PRIME_BYTES: [u8; PRIME_LENGTH] = [
    32, 201, 195, 52, 180, 51, 194, 228, 73, 211, 71, 87, 253, 82, 32, 232, 27, 223, 96, 40, 188,
    105, 158, 196, 189, 36, 148, 33, 216, 20, 50, 221, 59, 70, 142, 71, 129, 0, 0, 0, 1,
];

static PRIME: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&PRIME_BYTES));

/// Euler's totient of the prime, p - 1.
static PHI: Lazy<BigUint> = Lazy::new(|| &*PRIME - 1u32);

/// The prime factors of phi; phi = 2^32 * 571^32.
static PHI_FACTORS: Lazy<[BigUint; 2]> =
    Lazy::new(|| [BigUint::from(2u32), BigUint::from(571u32)]);

/// The memoized primitive roots, in ascending order. Extension happens under
/// the write lock so every observer sees one consistent sequence.
static ROOTS: Lazy<RwLock<Vec<BigUint>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Holds the enciphered segments and the blinder accumulator.
///
/// The accumulator is the running sum (mod phi) of the random blinders mixed
/// into each [`Cipher::cycle`]; it travels with the data so that
/// [`Cipher::finalize`] can cancel them. It reveals nothing about the keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cipher {
    data: Vec<u8>,
    acc: BigUint,
}

impl Cipher {
    /// Begin a cipher over `msg` that the keys in `keys` will cooperatively
    /// decrypt.
    ///
    /// The message is blocked into field segments and one compensating cycle
    /// is applied with the negated key sum, so that after every key has been
    /// cycled exactly once the total exponent is zero.
    pub fn start<R: Rng + CryptoRng>(rng: &mut R, keys: &[Vec<u8>], msg: &[u8]) -> Result<Cipher> {
        let sum = key_sum(keys);
        let compensation = (&*PHI - sum) % &*PHI;
        let mut cipher = Cipher {
            data: block(msg),
            acc: BigUint::zero(),
        };
        cipher.cycle(rng, &compensation.to_bytes_be())?;
        Ok(cipher)
    }

    /// Apply one key to the cipher.
    ///
    /// A random blinder is folded into the key and recorded in the
    /// accumulator, so the bytes produced by the same key differ every call.
    pub fn cycle<R: Rng + CryptoRng>(&mut self, rng: &mut R, key: &[u8]) -> Result<()> {
        if self.data.len() % PRIME_LENGTH != 0 {
            return Err(Error::WrongLength);
        }
        let blinder = random_below(rng, &PHI)?;
        let blinded = (BigUint::from_bytes_be(key) + &blinder) % &*PHI;
        self.acc = (&self.acc + blinder) % &*PHI;
        self.apply(&blinded);
        Ok(())
    }

    /// Cancel the accumulated blinders and unblock the segments.
    ///
    /// The output is the original message followed by its zero tail padding;
    /// callers strip the tail via a known message length.
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        if self.data.len() % PRIME_LENGTH != 0 {
            return Err(Error::WrongLength);
        }
        let compensation = (&*PHI - &self.acc) % &*PHI;
        self.apply(&compensation);
        Ok(unblock(&self.data))
    }

    /// The enciphered segment bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Deterministically multiply each segment by `root_i ^ key`.
    fn apply(&mut self, key: &BigUint) {
        let mut roots = Roots::new();
        for segment in self.data.chunks_mut(PRIME_LENGTH) {
            let factor = roots.next_root().modpow(key, &PRIME);
            let value = (BigUint::from_bytes_be(segment) * factor) % &*PRIME;
            let bytes = value.to_bytes_be();
            segment.fill(0);
            segment[PRIME_LENGTH - bytes.len()..].copy_from_slice(&bytes);
        }
    }
}

/// The field sum (mod phi) of a set of keys, as big-endian bytes.
///
/// Cycling with the sum decrypts exactly as cycling with each key, which
/// lets a receiver publish a route without revealing the per-hop keys.
pub fn sum_keys(keys: &[Vec<u8>]) -> Vec<u8> {
    key_sum(keys).to_bytes_be()
}

fn key_sum(keys: &[Vec<u8>]) -> BigUint {
    keys.iter()
        .fold(BigUint::zero(), |sum, key| sum + BigUint::from_bytes_be(key))
        % &*PHI
}

fn random_below<R: Rng + CryptoRng>(rng: &mut R, bound: &BigUint) -> Result<BigUint> {
    let mut buf = [0u8; PRIME_LENGTH + 1];
    rng.try_fill_bytes(&mut buf)?;
    Ok(BigUint::from_bytes_be(&buf) % bound)
}

/// Yields the primitive roots of the field in ascending order, starting over
/// from the smallest.
///
/// The n-th root depends only on the prime, never on which thread first
/// asked for it.
#[derive(Debug, Default)]
pub struct Roots {
    index: usize,
}

impl Roots {
    /// A generator positioned at the first root.
    pub fn new() -> Roots {
        Roots::default()
    }

    /// The next primitive root.
    pub fn next_root(&mut self) -> BigUint {
        let root = nth_root(self.index);
        self.index += 1;
        root
    }
}

/// Pre-populate the root table for ciphers of up to `segments` segments,
/// keeping later cycles off the table's write lock.
pub fn warm_roots(segments: usize) {
    if segments > 0 {
        nth_root(segments - 1);
    }
}

fn nth_root(index: usize) -> BigUint {
    {
        let table = ROOTS.read().expect("root table lock");
        if let Some(root) = table.get(index) {
            return root.clone();
        }
    }

    // Re-check under the write lock; another thread may have extended the
    // table since the read above.
    let mut table = ROOTS.write().expect("root table lock");
    while table.len() <= index {
        let mut candidate = table.last().cloned().unwrap_or_else(BigUint::one);
        loop {
            candidate += 1u32;
            if is_primitive_root(&candidate) {
                break;
            }
        }
        table.push(candidate);
    }
    table[index].clone()
}

/// `r` is a primitive root iff `r^(phi/q) != 1 (mod p)` for every prime
/// factor `q` of phi.
fn is_primitive_root(candidate: &BigUint) -> bool {
    PHI_FACTORS
        .iter()
        .all(|factor| !candidate.modpow(&(&*PHI / factor), &PRIME).is_one())
}

/// Block a message into field segments.
///
/// Each segment takes `PRIME_LENGTH - 1` message bytes behind a zero byte,
/// guaranteeing the segment value is below the prime; the tail is padded
/// with zeros to fill the last segment.
fn block(msg: &[u8]) -> Vec<u8> {
    const CHUNK: usize = PRIME_LENGTH - 1;
    let segments = (msg.len() + CHUNK - 1) / CHUNK;
    let mut out = vec![0u8; segments * PRIME_LENGTH];
    for (i, chunk) in msg.chunks(CHUNK).enumerate() {
        out[i * PRIME_LENGTH + 1..i * PRIME_LENGTH + 1 + chunk.len()].copy_from_slice(chunk);
    }
    out
}

/// Strip the leading zero byte of each segment. Tail padding stays.
fn unblock(data: &[u8]) -> Vec<u8> {
    const CHUNK: usize = PRIME_LENGTH - 1;
    let mut out = vec![0u8; (data.len() / PRIME_LENGTH) * CHUNK];
    for (i, segment) in data.chunks(PRIME_LENGTH).enumerate() {
        out[i * CHUNK..(i + 1) * CHUNK].copy_from_slice(&segment[1..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(571)
    }

    fn random_keys(rng: &mut ChaCha20Rng, n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|_| {
                let mut key = vec![0u8; PRIME_LENGTH - 1];
                rng.fill_bytes(&mut key);
                key
            })
            .collect()
    }

    #[test]
    fn prime_constant_is_consistent() {
        assert_eq!(PRIME.to_bytes_be().len(), PRIME_LENGTH);
        assert_eq!(
            &*PHI,
            &BigUint::from(2u32 * 571).pow(32),
            "phi must be (2 * 571)^32",
        );
    }

    #[test]
    fn block_roundtrip_aligned() {
        let mut rng = rng();
        let mut msg = vec![0u8; (PRIME_LENGTH - 1) * 7];
        rng.fill_bytes(&mut msg);
        assert_eq!(unblock(&block(&msg)), msg);
    }

    #[test]
    fn block_roundtrip_padded() {
        let msg = b"shorter than a segment";
        let out = unblock(&block(msg));
        assert_eq!(out.len(), PRIME_LENGTH - 1);
        assert_eq!(&out[..msg.len()], msg);
        assert!(out[msg.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn cycles_recover_message() {
        let mut rng = rng();
        let keys = random_keys(&mut rng, 5);
        let mut msg = vec![0u8; 500];
        rng.fill_bytes(&mut msg);

        let mut cipher = Cipher::start(&mut rng, &keys, &msg).unwrap();
        for key in &keys {
            cipher.cycle(&mut rng, key).unwrap();
        }
        let out = cipher.finalize().unwrap();
        assert_eq!(&out[..msg.len()], &msg[..]);
    }

    #[test]
    fn cycle_order_is_irrelevant() {
        let mut rng = rng();
        let keys = random_keys(&mut rng, 3);
        let msg = b"any permutation of the keys decrypts";

        let mut forward = Cipher::start(&mut rng, &keys, msg).unwrap();
        for key in [&keys[0], &keys[1], &keys[2]] {
            forward.cycle(&mut rng, key).unwrap();
        }

        let mut shuffled = Cipher::start(&mut rng, &keys, msg).unwrap();
        for key in [&keys[2], &keys[0], &keys[1]] {
            shuffled.cycle(&mut rng, key).unwrap();
        }

        let forward = forward.finalize().unwrap();
        assert_eq!(forward, shuffled.finalize().unwrap());
        assert_eq!(&forward[..msg.len()], msg);
    }

    #[test]
    fn summed_keys_decrypt_like_the_parts() {
        let mut rng = rng();
        let keys = random_keys(&mut rng, 4);
        let msg = b"one key to stand for four";

        let mut cipher = Cipher::start(&mut rng, &keys, msg).unwrap();
        cipher.cycle(&mut rng, &sum_keys(&keys)).unwrap();
        let out = cipher.finalize().unwrap();
        assert_eq!(&out[..msg.len()], msg);
    }

    #[test]
    fn blinders_change_the_wire_bytes() {
        let mut rng = rng();
        let keys = random_keys(&mut rng, 1);
        let msg = b"same key, different ciphertext";

        let mut a = Cipher::start(&mut rng, &keys, msg).unwrap();
        let mut b = Cipher::start(&mut rng, &keys, msg).unwrap();
        a.cycle(&mut rng, &keys[0]).unwrap();
        b.cycle(&mut rng, &keys[0]).unwrap();
        assert_ne!(a.data(), b.data());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut rng = rng();
        let mut cipher = Cipher {
            data: vec![0u8; PRIME_LENGTH + 1],
            acc: BigUint::zero(),
        };
        assert!(matches!(
            cipher.cycle(&mut rng, &[1]),
            Err(Error::WrongLength)
        ));
        assert!(matches!(cipher.finalize(), Err(Error::WrongLength)));
    }

    #[test]
    fn roots_are_ascending_primitive_and_stable() {
        warm_roots(4);
        let mut generator = Roots::new();
        let mut previous = BigUint::one();
        for _ in 0..8 {
            let root = generator.next_root();
            assert!(root > previous);
            assert!(is_primitive_root(&root));
            previous = root;
        }

        let mut replay = Roots::new();
        assert_eq!(replay.next_root(), nth_root(0));
        assert_eq!(replay.next_root(), nth_root(1));
    }

    #[test]
    fn root_table_is_consistent_across_threads() {
        let sequences: Vec<Vec<BigUint>> = std::thread::scope(|scope| {
            (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut generator = Roots::new();
                        (0..12).map(|_| generator.next_root()).collect()
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });
        for sequence in &sequences[1..] {
            assert_eq!(sequence, &sequences[0]);
        }
    }

    #[test]
    fn cipher_serializes_with_its_accumulator() {
        let mut rng = rng();
        let keys = random_keys(&mut rng, 2);
        let mut cipher = Cipher::start(&mut rng, &keys, b"on the wire").unwrap();
        cipher.cycle(&mut rng, &keys[0]).unwrap();

        let bytes = bincode::serialize(&cipher).unwrap();
        let mut revived: Cipher = bincode::deserialize(&bytes).unwrap();
        revived.cycle(&mut rng, &keys[1]).unwrap();
        let out = revived.finalize().unwrap();
        assert_eq!(&out[..11], b"on the wire");
    }
}
