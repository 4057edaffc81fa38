//! Hopwire Crypto
//!
//! Per-section key material and onion-layer sealing.
//!
//! Every hop of a tunnel is addressed by a long-lived receiver key. For
//! each tunnel the client generates a fresh section keypair per hop and
//! derives a symmetric cipher from the x25519 shared secret; the hop
//! derives the same cipher from the section public key it sees on the
//! wire. Layers are sealed with ChaCha20-Poly1305 under a per-message
//! nonce carried in front of each ciphertext; the plaintext of each
//! layer is an instructions container followed by the next layer's
//! ciphertext as trailing bytes.

mod keys;
mod seal;

pub use keys::{node_id, ReceiverKeypair, SectionKeys};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Corrupted instructions, len {0}")]
    Corrupted(usize),

    #[error("Key check mismatch: got {got:#010x}, want {want:#010x}")]
    KeyCheckMismatch { got: u32, want: u32 },

    #[error("Codec error: {0}")]
    Codec(#[from] hopwire_core::CodecError),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
