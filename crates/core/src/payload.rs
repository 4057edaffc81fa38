use serde::{Deserialize, Serialize};

/// End-to-end payload frames, encrypted under the tunnel's payload keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Client → egress: send these bytes as a UDP datagram.
    SendOut(SendOutPayload),
    /// Egress → client: a UDP datagram arrived at the external address.
    DeliverUdp(DeliverUdpPayload),
    /// Egress → client: the externally visible UDP bind address.
    OutBindDone(OutBindDonePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutPayload {
    pub seqno: u64,
    /// 4 (IPv4) or 16 (IPv6) bytes.
    pub ip: Vec<u8>,
    pub port: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverUdpPayload {
    pub seqno: u64,
    pub ip: Vec<u8>,
    pub port: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutBindDonePayload {
    /// The gateway's current outbound seqno; lower than ours means it
    /// restarted and our receive seqno must be pulled back.
    pub seqno: u64,
    pub ip: Vec<u8>,
    pub port: u32,
}
