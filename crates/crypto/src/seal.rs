//! Layer sealing and payload encryption.
//!
//! A ChaCha20-Poly1305 nonce must never repeat under the same key, and
//! one section seals many messages over a tunnel's lifetime. Each seal
//! therefore derives a synthetic nonce bound to the plaintext,
//! `SHA256(nonce_seed || plaintext)[..12]`, and carries it in front of
//! the ciphertext. Distinct messages get distinct nonces; identical
//! content re-seals to identical bytes, which is what lets a reassembled
//! message compare equal to its original.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

use hopwire_core::{
    decode_container, decode_payload, encode_container, encode_payload, EncryptedMessage,
    Instruction, InstructionsContainer, Payload, MIN_CONTAINER_LEN,
};

use crate::keys::SectionKeys;
use crate::{CryptoError, Result};

const NONCE_LEN: usize = 12;

fn derive_nonce(seed: &[u8; 32], plain: &[u8]) -> [u8; NONCE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(plain);
    let digest = hasher.finalize();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

fn seal(key: &[u8; 32], seed: &[u8; 32], plain: &[u8]) -> Result<Vec<u8>> {
    let nonce = derive_nonce(seed, plain);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

impl SectionKeys {
    /// Wrap `msg` in one more onion layer addressed to this section.
    ///
    /// The current instruction blob of `msg` becomes the trailing bytes
    /// behind the new container, and the whole plaintext is sealed under
    /// the section cipher. Layered messages are therefore built
    /// innermost-first.
    pub fn encrypt_instructions(
        &self,
        msg: &mut EncryptedMessage,
        instructions: Vec<Instruction>,
    ) -> Result<()> {
        let container = InstructionsContainer {
            key_check: self.key_check,
            list: instructions,
        };

        let mut plain = encode_container(&container)?;
        plain.extend_from_slice(&msg.instructions);

        msg.instructions = seal(&self.cipher_key, &self.nonce_seed, &plain)?;
        msg.section_pubkey = self.section_pubkey;
        Ok(())
    }

    /// Strip one onion layer: decrypt, validate, and split into the
    /// container and the inner layer's ciphertext.
    pub fn decrypt_instructions(&self, sealed: &[u8]) -> Result<(InstructionsContainer, Vec<u8>)> {
        let plain = open(&self.cipher_key, sealed)?;
        if plain.len() < MIN_CONTAINER_LEN {
            return Err(CryptoError::Corrupted(plain.len()));
        }

        let (container, rest) = decode_container(&plain)?;
        if container.key_check != self.key_check {
            return Err(CryptoError::KeyCheckMismatch {
                got: container.key_check,
                want: self.key_check,
            });
        }

        Ok((container, rest))
    }

    /// Encrypt an end-to-end payload frame under the section cipher.
    pub fn encrypt_payload(&self, payload: &Payload) -> Result<Vec<u8>> {
        let plain = encode_payload(payload)?;
        seal(&self.cipher_key, &self.nonce_seed, &plain)
    }

    /// Decrypt an end-to-end payload frame.
    pub fn decrypt_payload(&self, sealed: &[u8]) -> Result<Payload> {
        let plain = open(&self.cipher_key, sealed)?;
        Ok(decode_payload(&plain)?)
    }
}
