use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use hopwire_core::{PublicKey, Signature};

use crate::{PaymentError, Result};

/// Domain prefix for channel-state signatures.
const STATE_CONTEXT: &[u8] = b"hopwire.channel.state";

/// One hop of a payment chain as configured: who to pay through and what
/// it charges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentChainSection {
    /// Target's channel key.
    pub key: PublicKey,
    /// Minimum absolute fee per opened channel, in nano units.
    pub min_fee: u128,
    /// Proportional fee in basis points (1/100 of a percent) of the
    /// routed amount. Integer so fee math stays exact at any capacity.
    pub fee_bps: u32,
    /// Hard cap on the capacity this hop will carry.
    pub max_capacity: u128,
}

/// One hop of a built payment chain: concrete capacity, cumulative fee
/// and deadline computed by [`crate::build_payments_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHop {
    pub target: PublicKey,
    /// Capacity this hop must route (payload + downstream fees).
    pub capacity: u128,
    /// Cumulative fee from this hop to the end of the chain.
    pub fee: u128,
    /// Unix seconds; later hops get tighter deadlines.
    pub deadline: u64,
}

/// An open off-chain channel to one paying hop.
#[derive(Clone)]
pub struct VirtualPaymentChannel {
    /// Private signing key of the channel.
    pub key: SigningKey,
    /// Cumulative signed amount so far; never decreases.
    pub last_amount: u128,
    /// Hard cap; once `last_amount` reaches it the channel is exhausted.
    pub capacity: u128,
    /// Unix seconds after which the channel must not be used.
    pub safe_deadline: u64,
}

impl VirtualPaymentChannel {
    pub fn public_key(&self) -> PublicKey {
        self.key.verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for VirtualPaymentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPaymentChannel")
            .field("channel_pub", &self.public_key())
            .field("last_amount", &self.last_amount)
            .field("capacity", &self.capacity)
            .field("safe_deadline", &self.safe_deadline)
            .finish()
    }
}

/// A signed cumulative channel amount, the unit of payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualChannelState {
    pub amount: u128,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl VirtualChannelState {
    fn signable(amount: u128) -> Vec<u8> {
        let mut data = Vec::with_capacity(STATE_CONTEXT.len() + 16);
        data.extend_from_slice(STATE_CONTEXT);
        data.extend_from_slice(&amount.to_le_bytes());
        data
    }

    /// Sign a new cumulative amount with the channel key.
    pub fn sign(key: &SigningKey, amount: u128) -> Self {
        let signature: DalekSignature = key.sign(&Self::signable(amount));
        Self {
            amount,
            signature: signature.to_bytes(),
        }
    }

    /// Verify this state against the channel's public key.
    pub fn verify(&self, channel_pub: &PublicKey) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(channel_pub) else {
            return false;
        };
        let signature = DalekSignature::from_bytes(&self.signature);
        key.verify(&Self::signable(self.amount), &signature).is_ok()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PaymentError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| PaymentError::Serialization(e.to_string()))
    }
}

/// Display configuration of the coin a hop is paid in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinConfig {
    pub symbol: String,
    pub decimals: u32,
}

/// A nano-denominated amount with its display precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coins {
    pub nano: u128,
    pub decimals: u32,
}

impl Coins {
    pub fn new(nano: u128, decimals: u32) -> Self {
        Self { nano, decimals }
    }
}

impl std::fmt::Display for Coins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base = 10u128.pow(self.decimals);
        let whole = self.nano / base;
        let frac = self.nano % base;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let frac = format!("{:0width$}", frac, width = self.decimals as usize);
        write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
    }
}
