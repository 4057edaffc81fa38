//! Section key material.
//!
//! Key derivation is sha2 with domain-separated prefixes over the x25519
//! shared secret:
//!
//! - cipher key:  `SHA256("hopwire.section.key"   || shared)`
//! - nonce seed:  `SHA256("hopwire.section.nonce" || shared)`
//! - key check:   `LE32(SHA256("hopwire.section.check" || cipher_key)[..4])`
//!
//! The nonce seed never encrypts anything by itself: every sealed blob
//! gets its own nonce, `SHA256(seed || plaintext)[..12]`, carried in
//! front of the ciphertext (see the sealing module). Distinct plaintexts
//! therefore never share a (key, nonce) pair.
//!
//! Both sides of a section arrive at identical material: the client from
//! its ephemeral section secret and the hop's receiver key, the hop from
//! its receiver secret and the section public key carried on the wire.

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use hopwire_core::{NodeId, PublicKey, SectionPubKey};

use crate::Result;

const KEY_CONTEXT: &[u8] = b"hopwire.section.key";
const NONCE_CONTEXT: &[u8] = b"hopwire.section.nonce";
const CHECK_CONTEXT: &[u8] = b"hopwire.section.check";
const NODE_ID_CONTEXT: &[u8] = b"hopwire.node.id";

/// Network-wide identifier of a node, derived from its receiver key.
pub fn node_id(receiver_pubkey: &PublicKey) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(NODE_ID_CONTEXT);
    hasher.update(receiver_pubkey);
    hasher.finalize().into()
}

/// Long-lived receiver keypair of a node (x25519).
#[derive(Clone)]
pub struct ReceiverKeypair {
    secret: StaticSecret,
}

impl ReceiverKeypair {
    /// Generate a new random receiver keypair.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore a keypair from its 32 secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// The 32 secret bytes, for key persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// The public receiver key other nodes address this node by.
    pub fn public(&self) -> PublicKey {
        X25519Public::from(&self.secret).to_bytes()
    }

    /// Derive the section cipher as the receiving hop, from a section
    /// public key observed on the wire.
    pub fn derive_section(&self, section_pubkey: SectionPubKey) -> SectionKeys {
        let shared = self
            .secret
            .diffie_hellman(&X25519Public::from(section_pubkey));
        SectionKeys::from_shared(self.public(), section_pubkey, shared.as_bytes())
    }
}

/// Per-hop cryptographic material for one tunnel section. Immutable for
/// the life of the tunnel.
#[derive(Clone)]
pub struct SectionKeys {
    /// Receiver key identifying the hop.
    pub receiver_pubkey: PublicKey,
    /// Public key identifying this section instance.
    pub section_pubkey: SectionPubKey,
    pub(crate) cipher_key: [u8; 32],
    /// Seed for per-message nonce derivation; never used as a nonce
    /// directly.
    pub(crate) nonce_seed: [u8; 32],
    /// Integrity tag bound into every container sealed under this section.
    pub key_check: u32,
}

impl SectionKeys {
    /// Generate a fresh section against a hop's receiver key (client side).
    pub fn generate(receiver_pubkey: &PublicKey) -> Result<Self> {
        let section_secret = StaticSecret::random_from_rng(OsRng);
        let section_pubkey = X25519Public::from(&section_secret).to_bytes();
        let shared = section_secret.diffie_hellman(&X25519Public::from(*receiver_pubkey));
        Ok(Self::from_shared(
            *receiver_pubkey,
            section_pubkey,
            shared.as_bytes(),
        ))
    }

    fn from_shared(
        receiver_pubkey: PublicKey,
        section_pubkey: SectionPubKey,
        shared: &[u8; 32],
    ) -> Self {
        let cipher_key: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(KEY_CONTEXT);
            hasher.update(shared);
            hasher.finalize().into()
        };

        let nonce_seed: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(NONCE_CONTEXT);
            hasher.update(shared);
            hasher.finalize().into()
        };

        let check_full: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(CHECK_CONTEXT);
            hasher.update(cipher_key);
            hasher.finalize().into()
        };
        let key_check =
            u32::from_le_bytes([check_full[0], check_full[1], check_full[2], check_full[3]]);

        Self {
            receiver_pubkey,
            section_pubkey,
            cipher_key,
            nonce_seed,
            key_check,
        }
    }
}

impl std::fmt::Debug for SectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionKeys")
            .field("receiver_pubkey", &self.receiver_pubkey)
            .field("section_pubkey", &self.section_pubkey)
            .field("key_check", &self.key_check)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_cipher() {
        let receiver = ReceiverKeypair::generate();
        let client = SectionKeys::generate(&receiver.public()).unwrap();
        let hop = receiver.derive_section(client.section_pubkey);

        assert_eq!(client.cipher_key, hop.cipher_key);
        assert_eq!(client.nonce_seed, hop.nonce_seed);
        assert_eq!(client.key_check, hop.key_check);
    }

    #[test]
    fn test_sections_are_unique_per_generation() {
        let receiver = ReceiverKeypair::generate();
        let a = SectionKeys::generate(&receiver.public()).unwrap();
        let b = SectionKeys::generate(&receiver.public()).unwrap();

        assert_ne!(a.section_pubkey, b.section_pubkey);
        assert_ne!(a.cipher_key, b.cipher_key);
        assert_ne!(a.nonce_seed, b.nonce_seed);
    }

    #[test]
    fn test_nonce_seed_is_not_the_cipher_key() {
        let receiver = ReceiverKeypair::generate();
        let keys = SectionKeys::generate(&receiver.public()).unwrap();
        assert_ne!(keys.nonce_seed, keys.cipher_key);
    }

    #[test]
    fn test_node_id_is_stable_and_distinct() {
        let a = ReceiverKeypair::generate();
        let b = ReceiverKeypair::generate();

        assert_eq!(node_id(&a.public()), node_id(&a.public()));
        assert_ne!(node_id(&a.public()), node_id(&b.public()));
        // Domain-separated, so never the raw key itself
        assert_ne!(node_id(&a.public()), a.public());
    }

    #[test]
    fn test_receiver_keypair_roundtrip() {
        let a = ReceiverKeypair::generate();
        let b = ReceiverKeypair::from_bytes(a.to_bytes());
        assert_eq!(a.public(), b.public());
    }
}
