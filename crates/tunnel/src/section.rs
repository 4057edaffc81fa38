//! Tunnel sections and per-hop payment state.

use std::sync::Arc;

use parking_lot::Mutex;

use hopwire_core::PaymentInstruction;
use hopwire_crypto::SectionKeys;
use hopwire_payments::{PaymentChainSection, VirtualPaymentChannel};

/// One hop of a tunnel chain: its key material and, when the hop charges
/// for forwarding, the payment configuration and accounting.
pub struct SectionInfo {
    pub keys: SectionKeys,
    /// Shared so the embedder can keep a handle for fee reporting.
    pub payment: Option<Arc<PaymentInfo>>,
}

impl SectionInfo {
    pub fn new(keys: SectionKeys) -> Self {
        Self {
            keys,
            payment: None,
        }
    }

    pub fn with_payment(keys: SectionKeys, payment: Arc<PaymentInfo>) -> Self {
        Self {
            keys,
            payment: Some(payment),
        }
    }
}

/// Payment configuration and runtime accounting for one paying hop.
pub struct PaymentInfo {
    /// Price the hop charges per forwarded packet, in nano units.
    pub price_per_packet: u64,
    /// Token contract the hop is paid in; `None` means the base coin.
    pub token_master: Option<String>,
    pub extra_currency_id: u32,
    /// Payment chain used to reach this hop when opening channels.
    pub chain: Vec<PaymentChainSection>,

    pub(crate) state: Mutex<PayerState>,
    /// Guarded separately so paid-amount reporting can run concurrently
    /// with the control loop.
    pub(crate) paid_channel_fee: Mutex<u128>,
}

impl PaymentInfo {
    pub fn new(price_per_packet: u64, chain: Vec<PaymentChainSection>) -> Self {
        Self {
            price_per_packet,
            token_master: None,
            extra_currency_id: 0,
            chain,
            state: Mutex::new(PayerState::default()),
            paid_channel_fee: Mutex::new(0),
        }
    }

    pub fn with_token(mut self, token_master: String, extra_currency_id: u32) -> Self {
        self.token_master = Some(token_master);
        self.extra_currency_id = extra_currency_id;
        self
    }

    /// Packets prepaid at this hop so far.
    pub fn paid_packets(&self) -> i64 {
        self.state.lock().paid_packets
    }

    /// Channel fees accumulated across every channel opened to this hop.
    pub fn paid_channel_fee(&self) -> u128 {
        *self.paid_channel_fee.lock()
    }

    /// Snapshot of the active channel, if any.
    pub fn channel_snapshot(&self) -> Option<ChannelSnapshot> {
        self.state
            .lock()
            .current_channel
            .as_ref()
            .map(|c| ChannelSnapshot {
                channel_pub: c.public_key(),
                last_amount: c.last_amount,
                capacity: c.capacity,
                safe_deadline: c.safe_deadline,
            })
    }

    /// Whether an emitted payment still awaits server confirmation.
    pub fn has_unconfirmed_payment(&self) -> bool {
        self.state.lock().latest_instruction.is_some()
    }
}

/// Read-only view of a virtual channel for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel_pub: [u8; 32],
    pub last_amount: u128,
    pub capacity: u128,
    pub safe_deadline: u64,
}

/// Mutable payment accounting of one hop. Only touched inside the
/// tunnel's prepare critical section.
#[derive(Default)]
pub(crate) struct PayerState {
    pub paid_packets: i64,
    pub current_channel: Option<VirtualPaymentChannel>,
    /// Most recent emitted payment, kept for resend until confirmed.
    pub latest_instruction: Option<PaymentInstruction>,
    pub latest_channel_deadline: u64,
    pub latest_paid_on_seqno: u64,
    pub latest_packets_paid: i64,
}
