//! Hopwire Core
//!
//! Wire-level types shared by every hopwire crate: the per-hop instruction
//! set, tunnel metadata, payload frames, and the encrypted message
//! containers that carry them between nodes.
//!
//! Instructions form a closed tagged sum consumed by relays and by the
//! client-side reassembler; a `match` on the variants replaces any runtime
//! type dispatch. Encoding is bincode throughout, with the instruction
//! container supporting trailing bytes so that each onion layer can carry
//! the next layer's ciphertext behind its own plaintext header.

mod codec;
mod instruction;
mod message;
mod payload;
mod types;

pub use codec::{
    decode_container, decode_payload, encode_container, encode_payload, MIN_CONTAINER_LEN,
};
pub use instruction::{
    BindOut, BuildRoute, CacheInstruction, DeliverInitiator, Instruction, Meta,
    PaymentInstruction, PingMeta, RouteInstruction, StateMeta,
};
pub use message::{EncryptedMessage, EncryptedMessageCached, InstructionsContainer, TunnelMessage};
pub use payload::{DeliverUdpPayload, OutBindDonePayload, Payload, SendOutPayload};
pub use types::{
    purpose_out, purpose_route, route_id, system_route, NodeId, PublicKey, SectionPubKey,
    Signature, PURPOSE_OUT, PURPOSE_ROUTE, STATE_CONFIGURING, STATE_DESTROYED, STATE_OPTIMIZED,
    STATE_OPTIMIZING_ROUTES,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Container too short: {0} bytes")]
    TooShort(usize),
}

pub type Result<T> = std::result::Result<T, CodecError>;
