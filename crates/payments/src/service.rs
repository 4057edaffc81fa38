use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;

use hopwire_core::PublicKey;

use crate::types::{ChainHop, CoinConfig, VirtualChannelState};
use crate::Result;

/// Lifecycle status of a virtual channel inside the payment service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Open requested, not yet confirmed end-to-end.
    Pending,
    /// Usable; signed states will be accepted.
    Active,
    /// Closed or settled.
    Closed,
}

/// Metadata of a virtual channel as known to the payment service.
#[derive(Debug, Clone)]
pub struct ChannelMeta {
    pub status: ChannelStatus,
}

/// The virtual-channel payment collaborator.
///
/// Implementations own wallets, ledgers and the payment network; the
/// tunnel only ever hands them a built chain and signed states.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Smallest per-hop TTL the service considers safe for settlement.
    fn min_safe_ttl(&self) -> Duration;

    /// Open a virtual channel end-to-end along `chain`, keyed by
    /// `channel_key`. The service generates whatever onion material it
    /// needs from the chain itself.
    async fn open_virtual_channel(
        &self,
        chain: &[ChainHop],
        channel_key: &SigningKey,
        token_master: Option<&str>,
        extra_currency_id: u32,
    ) -> Result<()>;

    /// Look up a channel; [`crate::PaymentError::NotFound`] is a
    /// distinguished, retryable error while the open propagates.
    async fn virtual_channel_meta(&self, channel_pub: PublicKey) -> Result<ChannelMeta>;

    /// Register a signed state so the hop can claim it.
    async fn add_virtual_channel_resolve(
        &self,
        channel_pub: PublicKey,
        state: &VirtualChannelState,
    ) -> Result<()>;

    /// Resolve the display coin for a hop's currency configuration.
    fn resolve_coin_config(
        &self,
        token_master: Option<&str>,
        extra_currency_id: u32,
    ) -> Result<CoinConfig>;
}
