//! Hopwire Tunnel
//!
//! Client-side orchestrator for multi-hop, onion-encrypted UDP tunnels
//! with per-packet payments.
//!
//! A [`Tunnel`] owns a forward chain (last hop is the egress gateway) and
//! an independent reverse chain (last hop is the local endpoint). It
//! brings the chains from uninitialized to operational with layered
//! configuration messages, keeps every paying hop funded through virtual
//! payment channels, and exposes a UDP-like endpoint: [`Tunnel::write_to`]
//! sends datagrams out through the egress, [`Tunnel::read_from`] receives
//! what comes back.
//!
//! ## Collaborators
//!
//! The wire transport and the payment network stay outside this crate,
//! behind the [`Transport`] and [`hopwire_payments::PaymentService`]
//! traits. Inbound messages are fed back by the transport's dispatcher
//! through [`Tunnel::process`].
//!
//! ## Example
//!
//! ```ignore
//! let tunnel = Tunnel::open(
//!     TunnelOptions::new(chain_to, chain_from, local_key, transport)
//!         .with_payments(payment_service),
//! )?;
//!
//! let (ip, port) = tunnel.wait_for_init(&ctx, None).await?;
//! tunnel.write_to(b"ping", "1.2.3.4:9000".parse()?).await?;
//! ```

mod assemble;
mod control;
mod pay;
mod peer;
mod section;
mod tunnel;

pub use peer::{Peer, Transport, TransportError};
pub use section::{ChannelSnapshot, PaymentInfo, SectionInfo};
pub use tunnel::{
    EventFn, Tunnel, TunnelOptions, TunnelStats, DEFAULT_CHANNEL_CAPACITY_PAYMENTS,
    DEFAULT_LIVENESS_TIMEOUT, DEFAULT_PACKETS_TO_PREPAY,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] hopwire_crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Payment error: {0}")]
    Payment(#[from] hopwire_payments::PaymentError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not enough packets prepaid, paid: {paid}, consumed: {consumed}")]
    PrepaidExhausted { paid: i64, consumed: i64 },

    #[error("Tunnel is not ready for sending")]
    NotReady,

    #[error("Tunnel is destroyed")]
    Destroyed,

    #[error("Inbound queue full")]
    QueueFull,

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Unix seconds, the time base for deadlines and liveness stamps.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Nanosecond stamp for cache-instruction versions.
pub(crate) fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
