use serde::{Deserialize, Serialize};

use crate::types::{NodeId, SectionPubKey};

/// One per-hop directive inside an instructions container.
///
/// Relays execute these in order; the client-side reassembler walks the
/// same variants to rebuild a layered message without touching relays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Establish (or refresh) a forwarding route to the next section.
    BuildRoute(BuildRoute),
    /// Forward the remaining bytes along a previously built route.
    Route(RouteInstruction),
    /// Memoize an instruction list under a version for cache-hit dispatch.
    Cache(CacheInstruction),
    /// Bind the egress gateway to the reverse-chain entry point.
    BindOut(BindOut),
    /// A signed virtual-channel state update paying for forwarding.
    Payment(PaymentInstruction),
    /// Deliver metadata back to the tunnel initiator.
    DeliverInitiator(DeliverInitiator),
    /// Tear down this hop's routes for the tunnel.
    Destroy,
    /// Emit the decrypted payload as a UDP datagram (cached at the egress).
    SendOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRoute {
    pub target_node_id: NodeId,
    pub target_section_pubkey: SectionPubKey,
    pub route_id: u32,
    pub price_per_packet: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteInstruction {
    pub route_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInstruction {
    /// Nanosecond version stamp; a hop keeps the highest version it has seen.
    pub version: u64,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindOut {
    pub inbound_node_id: NodeId,
    pub inbound_section_pubkey: SectionPubKey,
    /// Fully nested reverse-chain message, opaque to the gateway.
    pub inbound_instructions: Vec<u8>,
    /// Section key the gateway encrypts delivered payloads against.
    pub receiver_pubkey: SectionPubKey,
    pub price_per_packet: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    /// Public key of the virtual channel this state belongs to.
    pub channel_pub: [u8; 32],
    /// Serialized signed channel state.
    pub channel_state: Vec<u8>,
    /// Set when the channel is exhausted by this state; the hop must not
    /// expect further updates on it.
    pub is_final: bool,
    /// High 32 bits: purpose tag; low 32 bits: route id for route payments.
    pub purpose: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverInitiator {
    /// Local id of the initiator (first 4 bytes of its payload section key).
    pub from: u32,
    pub metadata: Meta,
}

/// Metadata delivered back to the initiator alongside an optional payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Meta {
    State(StateMeta),
    Ping(PingMeta),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateMeta {
    pub state: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingMeta {
    pub seqno: u64,
    pub with_payments: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_roundtrip() {
        let ins = Instruction::BuildRoute(BuildRoute {
            target_node_id: [1u8; 32],
            target_section_pubkey: [2u8; 32],
            route_id: 42,
            price_per_packet: 10,
        });

        let bytes = bincode::serialize(&ins).unwrap();
        let decoded: Instruction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, ins);
    }

    #[test]
    fn test_nested_cache_roundtrip() {
        let ins = Instruction::Cache(CacheInstruction {
            version: 123_456_789,
            instructions: vec![
                Instruction::Route(RouteInstruction { route_id: 7 }),
                Instruction::SendOut,
            ],
        });

        let bytes = bincode::serialize(&ins).unwrap();
        let decoded: Instruction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, ins);
    }

    #[test]
    fn test_meta_variants() {
        let ping = Meta::Ping(PingMeta {
            seqno: 5,
            with_payments: true,
        });
        let bytes = bincode::serialize(&ping).unwrap();
        assert_eq!(bincode::deserialize::<Meta>(&bytes).unwrap(), ping);

        let state = Meta::State(StateMeta { state: u32::MAX });
        let bytes = bincode::serialize(&state).unwrap();
        assert_eq!(bincode::deserialize::<Meta>(&bytes).unwrap(), state);
    }
}
