//! Hopwire Payments
//!
//! Off-chain virtual payment channels for per-packet tunnel fees.
//!
//! A virtual channel is a unilateral, monotonic-amount channel to one
//! paying hop: the client signs strictly increasing cumulative amounts
//! with the channel key, and the hop can claim up to the last signed
//! amount before the channel deadline. Opening a channel requires routing
//! capacity through every intermediate payment hop; the chain-build
//! algorithm in [`chain`] computes per-hop fees and capacities so that no
//! hop's own cap is exceeded.
//!
//! The actual money system lives behind the [`PaymentService`] trait;
//! hopwire never talks to a ledger directly.

mod chain;
mod service;
mod types;

pub use chain::build_payments_chain;
pub use service::{ChannelMeta, ChannelStatus, PaymentService};
pub use types::{
    ChainHop, CoinConfig, Coins, PaymentChainSection, VirtualChannelState, VirtualPaymentChannel,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Virtual channel not found")]
    NotFound,

    #[error("Min capacity on the way cannot cover fees")]
    InsufficientCapacity,

    #[error("Amount overflow in payment chain")]
    AmountOverflow,

    #[error("Empty payment chain")]
    EmptyChain,

    #[error("Open channel failed: {0}")]
    OpenChannelFailed(String),

    #[error("Wrong channel state: {0:?}")]
    WrongState(ChannelStatus),

    #[error("Rejected by payment service: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
