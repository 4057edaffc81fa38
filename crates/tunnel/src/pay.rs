//! The payment controller: keeps every paying hop funded and emits
//! signed channel states inside control messages.
//!
//! Payment-state mutations are queued while the layered message is being
//! assembled and applied only after every layer encrypted successfully;
//! a failure mid-assembly must not leave half the hops advanced (that
//! would double-spend on the retry).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::{debug, warn};

use hopwire_core::{
    purpose_out, purpose_route, route_id, system_route, DeliverInitiator, EncryptedMessage,
    Instruction, Meta, PaymentInstruction, PingMeta, RouteInstruction,
};
use hopwire_payments::{
    build_payments_chain, ChannelStatus, PaymentError, PaymentService, VirtualChannelState,
    VirtualPaymentChannel,
};

use crate::section::{PaymentInfo, SectionInfo};
use crate::tunnel::Tunnel;
use crate::{unix_now, Result, TunnelError};

/// TTL of the first hop of a payment chain when opening a channel.
const CHANNEL_BASE_TTL: Duration = Duration::from_secs(3600);

const META_POLL_NOT_FOUND: Duration = Duration::from_secs(1);
const META_POLL_PENDING: Duration = Duration::from_millis(100);

/// A payment emitted into a message but not yet accounted; applied as a
/// batch once the whole message has been assembled.
pub(crate) struct PendingPayment {
    node_index: usize,
    pay_for: i64,
    instruction: PaymentInstruction,
    channel_deadline: u64,
    paid_on_seqno: u64,
    new_amount: u128,
    is_final: bool,
}

impl Tunnel {
    fn node_at(&self, index: usize) -> &SectionInfo {
        if index < self.chain_to.len() {
            &self.chain_to[index]
        } else {
            &self.chain_from[index - self.chain_to.len()]
        }
    }

    fn payment_service(&self) -> Result<&Arc<dyn PaymentService>> {
        self.payments
            .as_ref()
            .ok_or_else(|| TunnelError::Configuration("payments are not enabled".into()))
    }

    /// Assemble a control (ping) message through the system routes,
    /// attaching payment instructions for hops that need funding.
    pub(crate) async fn prepare_control_message(
        &self,
        with_payments: bool,
        force_payments: bool,
    ) -> Result<EncryptedMessage> {
        let _guard = self.mx.write().await;

        let consumed_out = self.packets_consumed_out.load(Ordering::Relaxed);
        let consumed_in = self.packets_consumed_in.load(Ordering::Relaxed);
        let consumed_max = consumed_out.max(consumed_in);

        let total = self.chain_to.len() + self.chain_from.len();
        let next_seqno = self.control_seqno.load(Ordering::Relaxed) + 1;

        let mut msg = EncryptedMessage::default();
        let mut pending: Vec<PendingPayment> = Vec::new();

        for i in (0..total).rev() {
            if i == total - 1 {
                // deliver the ping to ourselves
                self.node_at(i).keys.encrypt_instructions(
                    &mut msg,
                    vec![Instruction::DeliverInitiator(DeliverInitiator {
                        from: self.local_id,
                        metadata: Meta::Ping(PingMeta {
                            seqno: next_seqno,
                            with_payments,
                        }),
                    })],
                )?;
                continue;
            }

            let route = route_id(&self.node_at(i + 1).keys.section_pubkey);
            let mut instructions = Vec::new();

            if with_payments {
                if let Some(payment) = self.node_at(i).payment.clone() {
                    if payment.price_per_packet > 0 {
                        let is_out_gate = i == self.chain_to.len() - 1;
                        let consumed = if i >= self.chain_to.len() {
                            consumed_in
                        } else if is_out_gate {
                            consumed_max
                        } else {
                            consumed_out
                        };

                        if let Some(p) = self
                            .attach_hop_payment(
                                i,
                                &payment,
                                route,
                                is_out_gate,
                                consumed,
                                force_payments,
                                next_seqno,
                                &mut instructions,
                            )
                            .await?
                        {
                            pending.push(p);
                        }
                    }
                }
            }

            instructions.push(Instruction::Route(RouteInstruction {
                route_id: system_route(route),
            }));
            self.node_at(i)
                .keys
                .encrypt_instructions(&mut msg, instructions)?;
        }

        if pending.is_empty() {
            debug!("new payments not needed");
        }

        self.control_seqno.store(next_seqno, Ordering::Relaxed);
        for payment in pending {
            self.apply_pending_payment(payment);
        }

        self.recompute_min_paid();

        debug!(seqno = next_seqno, "control instructions prepared");
        Ok(msg)
    }

    /// Decide what (if anything) this hop gets paid in the current
    /// control message, per the prepay-balance rules.
    #[allow(clippy::too_many_arguments)]
    async fn attach_hop_payment(
        &self,
        node_index: usize,
        payment: &PaymentInfo,
        route: u32,
        is_out_gate: bool,
        consumed: i64,
        force_payments: bool,
        next_seqno: u64,
        instructions: &mut Vec<Instruction>,
    ) -> Result<Option<PendingPayment>> {
        let now = unix_now();
        let section_key = hex::encode(self.node_at(node_index).keys.section_pubkey);

        // An unconfirmed earlier payment is reattached instead of minting
        // a new state, as long as its channel is still acceptable.
        {
            let mut st = payment.state.lock();
            if st.latest_instruction.is_some()
                && st.latest_paid_on_seqno > self.control_paid_seqno_received.load(Ordering::Acquire)
            {
                if st.latest_channel_deadline > now {
                    if let Some(latest) = st.latest_instruction.clone() {
                        instructions.push(Instruction::Payment(latest));
                    }
                    debug!(
                        section_key = %section_key,
                        "reattaching latest virtual channel payment state to resend"
                    );
                    return Ok(None);
                }

                // Past the safe deadline the state can no longer be
                // accepted; the signed funds are lost, re-account them.
                warn!(section_key = %section_key, "payment channel expired, will make a new payment");
                let lost = st.latest_packets_paid;
                st.latest_instruction = None;
                st.paid_packets -= lost;
            }
        }

        let balance = payment.state.lock().paid_packets - consumed;
        if balance > self.packets_to_prepay / 2 && !force_payments {
            return Ok(None);
        }
        let prepay = (self.packets_to_prepay - balance).max(0);

        let price = payment.price_per_packet as u128;

        let channel = {
            let st = payment.state.lock();
            st.current_channel.clone()
        };
        let channel = match channel {
            Some(channel) if channel.safe_deadline > now => channel,
            _ => {
                let regular_amount = self.packets_to_prepay as u128 * price;
                // capacity for several prepay rounds; intermediate hops may
                // still clamp it down
                let want_capacity = regular_amount * self.channel_capacity_payments as u128;
                let opened = self.open_virtual_channel(payment, want_capacity).await?;
                payment.state.lock().current_channel = Some(opened.clone());
                opened
            }
        };

        let room = ((channel.capacity - channel.last_amount) / price).min(i64::MAX as u128) as i64;
        let mut is_final = true;
        let mut pay_for = room;
        if pay_for > prepay {
            is_final = false;
            pay_for = prepay;
        }

        if prepay - pay_for > 0 {
            debug!(
                packets_num = prepay - pay_for,
                section_key = %section_key, "part of the debt moved to pay later, channel is too small"
            );
        }

        let amount = pay_for as u128 * price;
        let new_amount = channel.last_amount + amount;

        let state = VirtualChannelState::sign(&channel.key, new_amount);
        let state_bytes = state.to_bytes()?;

        self.payment_service()?
            .add_virtual_channel_resolve(channel.public_key(), &state)
            .await?;

        let instruction = PaymentInstruction {
            channel_pub: channel.public_key(),
            channel_state: state_bytes,
            is_final,
            purpose: if is_out_gate {
                purpose_out()
            } else {
                purpose_route(route)
            },
        };

        if force_payments {
            // after a reinit the previous payment may have been lost on the
            // wire; reattach it when it belongs to an older channel
            let st = payment.state.lock();
            if let Some(latest) = &st.latest_instruction {
                if st.latest_channel_deadline > now
                    && st.latest_channel_deadline != channel.safe_deadline
                {
                    instructions.push(Instruction::Payment(latest.clone()));
                    debug!(
                        section_key = %section_key,
                        "adding previous virtual channel payment state instruction"
                    );
                }
            }
        }

        instructions.push(Instruction::Payment(instruction.clone()));
        debug!(amount, section_key = %section_key, "adding virtual channel payment state instruction");

        Ok(Some(PendingPayment {
            node_index,
            pay_for,
            instruction,
            channel_deadline: channel.safe_deadline,
            paid_on_seqno: next_seqno,
            new_amount,
            is_final,
        }))
    }

    fn apply_pending_payment(&self, pending: PendingPayment) {
        let Some(payment) = &self.node_at(pending.node_index).payment else {
            return;
        };

        let mut st = payment.state.lock();
        st.paid_packets += pending.pay_for;
        st.latest_packets_paid = pending.pay_for;
        st.latest_instruction = Some(pending.instruction);
        st.latest_channel_deadline = pending.channel_deadline;
        st.latest_paid_on_seqno = pending.paid_on_seqno;

        if let Some(channel) = st.current_channel.as_mut() {
            channel.last_amount = pending.new_amount;
        }
        if pending.is_final {
            st.current_channel = None;
        }
    }

    /// Recompute the lowest prepaid balance per direction; `write_to`
    /// and inbound delivery gate on these.
    fn recompute_min_paid(&self) {
        let total = self.chain_to.len() + self.chain_from.len();
        let mut min_paid_in = i64::MAX;
        let mut min_paid_out = i64::MAX;

        for i in 0..total {
            if i == total - 1 {
                // ourselves
                continue;
            }
            let Some(payment) = &self.node_at(i).payment else {
                continue;
            };
            let paid = payment.state.lock().paid_packets;

            if i >= self.chain_to.len() {
                min_paid_in = min_paid_in.min(paid);
            } else if i == self.chain_to.len() - 1 {
                // out gate carries both directions
                min_paid_out = min_paid_out.min(paid);
                min_paid_in = min_paid_in.min(paid);
            } else {
                min_paid_out = min_paid_out.min(paid);
            }
        }

        self.packets_min_paid_in.store(min_paid_in, Ordering::Relaxed);
        self.packets_min_paid_out
            .store(min_paid_out, Ordering::Relaxed);
    }

    /// Open a fresh virtual channel to a hop, sized for `capacity`.
    pub(crate) async fn open_virtual_channel(
        &self,
        payment: &PaymentInfo,
        capacity: u128,
    ) -> Result<VirtualPaymentChannel> {
        let service = self.payment_service()?;
        debug!(
            price_per_packet = payment.price_per_packet,
            capacity, "opening virtual channel"
        );

        let hop_ttl = service.min_safe_ttl();
        let chain = build_payments_chain(
            &payment.chain,
            capacity,
            CHANNEL_BASE_TTL,
            hop_ttl,
            unix_now(),
        )?;

        let channel_key = SigningKey::generate(&mut OsRng);
        service
            .open_virtual_channel(
                &chain,
                &channel_key,
                payment.token_master.as_deref(),
                payment.extra_currency_id,
            )
            .await?;

        let channel_pub = channel_key.verifying_key().to_bytes();
        loop {
            match service.virtual_channel_meta(channel_pub).await {
                Err(PaymentError::NotFound) => {
                    self.cancellable_sleep(META_POLL_NOT_FOUND).await?;
                }
                Err(err) => return Err(TunnelError::Payment(err)),
                Ok(meta) => match meta.status {
                    ChannelStatus::Pending => {
                        self.cancellable_sleep(META_POLL_PENDING).await?;
                    }
                    ChannelStatus::Active => break,
                    status => {
                        return Err(TunnelError::Payment(PaymentError::WrongState(status)));
                    }
                },
            }
        }

        {
            let mut fee = payment.paid_channel_fee.lock();
            *fee += chain[0].fee;
        }

        let last = &chain[chain.len() - 1];
        Ok(VirtualPaymentChannel {
            key: channel_key,
            last_amount: 0,
            capacity: last.capacity,
            safe_deadline: last.deadline.saturating_sub(hop_ttl.as_secs()),
        })
    }

    async fn cancellable_sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
