use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;
use crate::types::SectionPubKey;

/// A layered onion message addressed to the section that can decrypt the
/// outermost instructions blob. Each decrypted layer yields an
/// [`InstructionsContainer`] plus the next layer's ciphertext as trailing
/// bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub section_pubkey: SectionPubKey,
    pub instructions: Vec<u8>,
    /// End-to-end encrypted payload; rides unchanged through every hop.
    pub payload: Vec<u8>,
}

/// A data frame dispatched through an already-built (cached) route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedMessageCached {
    pub section_pubkey: SectionPubKey,
    pub seqno: u32,
    pub payload: Vec<u8>,
}

/// What the transport collaborator actually puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TunnelMessage {
    Message(EncryptedMessage),
    Cached(EncryptedMessageCached),
}

/// Plaintext header of one onion layer: a key-check word binding the
/// container to the section cipher, then the instruction list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionsContainer {
    pub key_check: u32,
    pub list: Vec<Instruction>,
}
