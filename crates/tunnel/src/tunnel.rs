//! The tunnel itself: lifecycle, endpoint surface and inbound dispatch.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hopwire_core::{
    route_id, DeliverUdpPayload, EncryptedMessageCached, Meta, OutBindDonePayload, Payload,
    PublicKey, SendOutPayload, TunnelMessage, STATE_CONFIGURING, STATE_DESTROYED, STATE_OPTIMIZED,
    STATE_OPTIMIZING_ROUTES,
};
use hopwire_crypto::SectionKeys;
use hopwire_payments::{Coins, PaymentService};

use crate::peer::{Peer, Transport};
use crate::section::SectionInfo;
use crate::{control, unix_now, Result, TunnelError};

/// Default prepaid headroom targeted at every paying hop.
pub const DEFAULT_PACKETS_TO_PREPAY: i64 = 200_000;
/// Default number of prepay quanta a new channel provisions capacity for.
pub const DEFAULT_CHANNEL_CAPACITY_PAYMENTS: i64 = 30;
/// Liveness: reconfigure when no fresh control/state reply for this long.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);
const READ_QUEUE_CAPACITY: usize = 512 * 1024;
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const CLOSE_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with progress milestones during [`Tunnel::wait_for_init`].
pub type EventFn = dyn Fn(&str) + Send + Sync;

type OutAddressHandler = Box<dyn Fn(SocketAddr) + Send + Sync>;

/// Construction parameters for a tunnel.
pub struct TunnelOptions {
    pub chain_to: Vec<SectionInfo>,
    pub chain_from: Vec<SectionInfo>,
    /// Receiver key of the local endpoint; must match the last
    /// `chain_from` section.
    pub local_receiver_key: PublicKey,
    pub transport: Arc<dyn Transport>,
    pub payments: Option<Arc<dyn PaymentService>>,
    pub packets_to_prepay: i64,
    pub channel_capacity_payments: i64,
    pub liveness_timeout: Duration,
}

impl TunnelOptions {
    pub fn new(
        chain_to: Vec<SectionInfo>,
        chain_from: Vec<SectionInfo>,
        local_receiver_key: PublicKey,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            chain_to,
            chain_from,
            local_receiver_key,
            transport,
            payments: None,
            packets_to_prepay: DEFAULT_PACKETS_TO_PREPAY,
            channel_capacity_payments: DEFAULT_CHANNEL_CAPACITY_PAYMENTS,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }

    pub fn with_payments(mut self, payments: Arc<dyn PaymentService>) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn with_prepay_target(mut self, packets: i64) -> Self {
        self.packets_to_prepay = packets;
        self
    }

    pub fn with_channel_capacity_payments(mut self, quanta: i64) -> Self {
        self.channel_capacity_payments = quanta;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }
}

/// Counter snapshot for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelStats {
    pub state: u32,
    pub seqno_send: u64,
    pub seqno_recv: u64,
    pub seqno_forward: u32,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub packets_recv_paid_consumed: u64,
    pub packets_dropped: u64,
    pub control_seqno: u64,
    pub control_seqno_received: u64,
    pub control_paid_seqno_received: u64,
    pub packets_consumed_in: i64,
    pub packets_consumed_out: i64,
    pub packets_min_paid_in: i64,
    pub packets_min_paid_out: i64,
    pub payments_confirmed: bool,
}

#[derive(Default)]
struct Deadlines {
    read: Option<SystemTime>,
    write: Option<SystemTime>,
}

/// A bidirectional UDP-like endpoint over two onion-encrypted chains.
pub struct Tunnel {
    pub(crate) local_id: u32,
    pub(crate) peer: Peer,
    pub(crate) payments: Option<Arc<dyn PaymentService>>,
    pub(crate) use_payments: bool,

    pub(crate) chain_to: Vec<SectionInfo>,
    pub(crate) chain_from: Vec<SectionInfo>,
    pub(crate) payload_keys: SectionKeys,

    pub(crate) state: AtomicU32,
    pub(crate) want_destroy: AtomicBool,
    pub(crate) payments_confirmed: AtomicU32,

    control_signal: mpsc::Sender<()>,
    read_tx: mpsc::Sender<DeliverUdpPayload>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<DeliverUdpPayload>>,

    external: Mutex<Option<(IpAddr, u16)>>,
    on_out_address_changed: Mutex<Option<OutAddressHandler>>,

    pub(crate) seqno_send: AtomicU64,
    pub(crate) seqno_recv: AtomicU64,
    pub(crate) seqno_forward: AtomicU32,
    pub(crate) packets_sent: AtomicU64,
    pub(crate) packets_recv: AtomicU64,
    pub(crate) packets_recv_paid_consumed: AtomicU64,
    pub(crate) packets_dropped: AtomicU64,

    pub(crate) control_seqno: AtomicU64,
    pub(crate) control_seqno_received: AtomicU64,
    pub(crate) control_paid_seqno_received: AtomicU64,

    pub(crate) packets_to_prepay: i64,
    pub(crate) channel_capacity_payments: i64,
    pub(crate) liveness_timeout: Duration,

    pub(crate) packets_consumed_in: AtomicI64,
    pub(crate) packets_consumed_out: AtomicI64,
    pub(crate) packets_min_paid_in: AtomicI64,
    pub(crate) packets_min_paid_out: AtomicI64,

    pub(crate) last_fully_checked_at: AtomicI64,

    deadlines: Mutex<Deadlines>,
    local_addr: SocketAddr,

    pub(crate) cancel: CancellationToken,
    /// Guards instruction (re)assembly and payment planning.
    pub(crate) mx: tokio::sync::RwLock<()>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Build a tunnel over the given chains and start its control loop.
    ///
    /// Must be called inside a tokio runtime. The returned tunnel is in
    /// the configuring state; use [`Tunnel::wait_for_init`] to block
    /// until it is operational.
    pub fn open(options: TunnelOptions) -> Result<Arc<Self>> {
        let TunnelOptions {
            chain_to,
            chain_from,
            local_receiver_key,
            transport,
            payments,
            packets_to_prepay,
            channel_capacity_payments,
            liveness_timeout,
        } = options;

        if chain_to.is_empty() || chain_from.is_empty() {
            return Err(TunnelError::Configuration(
                "chains should have at least one node".into(),
            ));
        }

        let last_from = &chain_from[chain_from.len() - 1];
        if last_from.keys.receiver_pubkey != local_receiver_key {
            return Err(TunnelError::Configuration(
                "last 'chain from' section must be the local endpoint".into(),
            ));
        }

        let mut seen = HashSet::new();
        for info in chain_to.iter().chain(chain_from.iter()) {
            if !seen.insert(info.keys.section_pubkey) {
                return Err(TunnelError::Configuration(
                    "section keys must be distinct across both chains".into(),
                ));
            }
        }

        let use_payments = chain_to
            .iter()
            .chain(chain_from.iter())
            .any(|info| info.payment.is_some());
        if use_payments && payments.is_none() {
            return Err(TunnelError::Configuration(
                "payments are not enabled".into(),
            ));
        }

        let egress = &chain_to[chain_to.len() - 1];
        let payload_keys = SectionKeys::generate(&egress.keys.receiver_pubkey)?;
        let local_id = route_id(&payload_keys.section_pubkey);

        let (control_signal, control_signal_rx) = mpsc::channel(1);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_CAPACITY);

        let peer = Peer::new(transport);
        peer.add_reference();

        let tunnel = Arc::new(Self {
            local_id,
            peer,
            payments,
            use_payments,
            chain_to,
            chain_from,
            payload_keys,
            state: AtomicU32::new(STATE_CONFIGURING),
            want_destroy: AtomicBool::new(false),
            payments_confirmed: AtomicU32::new(0),
            control_signal,
            read_tx,
            read_rx: tokio::sync::Mutex::new(read_rx),
            external: Mutex::new(None),
            on_out_address_changed: Mutex::new(None),
            seqno_send: AtomicU64::new(0),
            seqno_recv: AtomicU64::new(0),
            seqno_forward: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            packets_recv: AtomicU64::new(0),
            packets_recv_paid_consumed: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            control_seqno: AtomicU64::new(0),
            control_seqno_received: AtomicU64::new(0),
            control_paid_seqno_received: AtomicU64::new(0),
            packets_to_prepay,
            channel_capacity_payments,
            liveness_timeout,
            packets_consumed_in: AtomicI64::new(0),
            packets_consumed_out: AtomicI64::new(0),
            packets_min_paid_in: AtomicI64::new(0),
            packets_min_paid_out: AtomicI64::new(0),
            last_fully_checked_at: AtomicI64::new(unix_now() as i64),
            deadlines: Mutex::new(Deadlines::default()),
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(255, 0, 0, 0)), 1),
            cancel: CancellationToken::new(),
            mx: tokio::sync::RwLock::new(()),
        });

        tokio::spawn(control::run_control_loop(
            Arc::clone(&tunnel),
            control_signal_rx,
        ));

        Ok(tunnel)
    }

    pub(crate) fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Current lifecycle state value (see the `STATE_*` constants).
    pub fn tunnel_state(&self) -> u32 {
        self.state()
    }

    /// Token cancelled when the tunnel dies; collaborators can select on
    /// it to abandon work tied to this tunnel.
    pub fn alive_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Schedule at least one more control-loop iteration. Coalesces: the
    /// signal channel holds a single pending wakeup.
    pub fn request_control_message(&self) {
        let _ = self.control_signal.try_send(());
    }

    /// Register a callback for changes of the discovered egress address.
    pub fn set_out_address_changed_handler(
        &self,
        handler: impl Fn(SocketAddr) + Send + Sync + 'static,
    ) {
        *self.on_out_address_changed.lock() = Some(Box::new(handler));
    }

    /// The externally visible address reported by the egress gateway.
    pub fn external_addr(&self) -> Option<(IpAddr, u16)> {
        *self.external.lock()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_deadline(&self, deadline: SystemTime) {
        let mut d = self.deadlines.lock();
        d.read = Some(deadline);
        d.write = Some(deadline);
    }

    pub fn set_read_deadline(&self, deadline: SystemTime) {
        self.deadlines.lock().read = Some(deadline);
    }

    pub fn set_write_deadline(&self, deadline: SystemTime) {
        self.deadlines.lock().write = Some(deadline);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            state: self.state(),
            seqno_send: self.seqno_send.load(Ordering::Relaxed),
            seqno_recv: self.seqno_recv.load(Ordering::Relaxed),
            seqno_forward: self.seqno_forward.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_recv: self.packets_recv.load(Ordering::Relaxed),
            packets_recv_paid_consumed: self.packets_recv_paid_consumed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            control_seqno: self.control_seqno.load(Ordering::Relaxed),
            control_seqno_received: self.control_seqno_received.load(Ordering::Relaxed),
            control_paid_seqno_received: self.control_paid_seqno_received.load(Ordering::Relaxed),
            packets_consumed_in: self.packets_consumed_in.load(Ordering::Relaxed),
            packets_consumed_out: self.packets_consumed_out.load(Ordering::Relaxed),
            packets_min_paid_in: self.packets_min_paid_in.load(Ordering::Relaxed),
            packets_min_paid_out: self.packets_min_paid_out.load(Ordering::Relaxed),
            payments_confirmed: self.payments_confirmed.load(Ordering::Acquire) != 0,
        }
    }

    /// Send a datagram to `addr` through the egress gateway.
    ///
    /// Fails with [`TunnelError::NotReady`] until the tunnel is
    /// optimized, and with [`TunnelError::PrepaidExhausted`] when a
    /// paying hop runs out of prepaid packets; back off and retry once
    /// the control loop has topped the balance up.
    pub async fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if self.state() < STATE_OPTIMIZED {
            return Err(TunnelError::NotReady);
        }
        if self.want_destroy.load(Ordering::Acquire) {
            return Err(TunnelError::Destroyed);
        }

        if self.use_payments {
            let paid = self.packets_min_paid_out.load(Ordering::Relaxed);
            let consumed = self.packets_consumed_out.load(Ordering::Relaxed);
            if paid < consumed {
                return Err(TunnelError::PrepaidExhausted { paid, consumed });
            }

            let consumed = self.packets_consumed_out.fetch_add(1, Ordering::Relaxed) + 1;
            if paid - consumed < self.packets_to_prepay / 2 {
                self.request_control_message();
            }
        }

        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };

        let payload = Payload::SendOut(SendOutPayload {
            seqno: self.seqno_send.fetch_add(1, Ordering::Relaxed) + 1,
            ip,
            port: addr.port() as u32,
            payload: data.to_vec(),
        });
        let sealed = self.payload_keys.encrypt_payload(&payload)?;

        self.peer
            .send_custom_message(TunnelMessage::Cached(EncryptedMessageCached {
                section_pubkey: self.chain_to[0].keys.section_pubkey,
                seqno: self.seqno_forward.fetch_add(1, Ordering::Relaxed) + 1,
                payload: sealed,
            }))
            .await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);

        Ok(data.len())
    }

    /// Receive the next inbound datagram, blocking until one arrives or
    /// the tunnel is destroyed.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut rx = self.read_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TunnelError::Destroyed),
            packet = rx.recv() => {
                let packet = packet.ok_or(TunnelError::Destroyed)?;
                Ok(Self::copy_packet(&packet, buf))
            }
        }
    }

    /// Like [`Tunnel::read_from`], but also returns when `ctx` is
    /// cancelled.
    pub async fn read_from_with_timeout(
        &self,
        ctx: &CancellationToken,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddr)> {
        let mut rx = self.read_rx.lock().await;
        tokio::select! {
            _ = ctx.cancelled() => Err(TunnelError::Cancelled),
            _ = self.cancel.cancelled() => Err(TunnelError::Destroyed),
            packet = rx.recv() => {
                let packet = packet.ok_or(TunnelError::Destroyed)?;
                Ok(Self::copy_packet(&packet, buf))
            }
        }
    }

    fn copy_packet(packet: &DeliverUdpPayload, buf: &mut [u8]) -> (usize, SocketAddr) {
        let n = buf.len().min(packet.payload.len());
        buf[..n].copy_from_slice(&packet.payload[..n]);
        let ip = ip_from_bytes(&packet.ip).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        (n, SocketAddr::new(ip, packet.port as u16))
    }

    /// Block until the tunnel is operational (and, for paying tunnels,
    /// until the first payment round-trip is confirmed). Returns the
    /// externally visible egress address.
    pub async fn wait_for_init(
        &self,
        ctx: &CancellationToken,
        events: Option<&EventFn>,
    ) -> Result<(IpAddr, u16)> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
                _ = self.cancel.cancelled() => return Err(TunnelError::Destroyed),
                _ = tokio::time::sleep(INIT_POLL_INTERVAL) => {}
            }

            if self.state() != STATE_OPTIMIZED {
                continue;
            }

            if self.use_payments {
                if let Some(events) = events {
                    events("Tunnel configured, sending payments...");
                }
                self.request_control_message();
                info!("tunnel initialized, waiting payment confirmation");

                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
                        _ = self.cancel.cancelled() => return Err(TunnelError::Destroyed),
                        _ = tokio::time::sleep(INIT_POLL_INTERVAL) => {}
                    }
                    if self.payments_confirmed.load(Ordering::Acquire) != 0 {
                        break;
                    }
                }
            }

            if let Some(events) = events {
                events("Tunnel initialized");
            }

            let external = *self.external.lock();
            let (ip, port) =
                external.unwrap_or((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            return Ok((ip, port));
        }
    }

    /// Handle an inbound delivery from the transport dispatcher.
    pub async fn process(&self, payload: &[u8], meta: Meta) -> Result<()> {
        match meta {
            Meta::State(m) => self.process_state(payload, m.state).await,
            Meta::Ping(m) => self.process_ping(m.seqno, m.with_payments).await,
        }
    }

    async fn process_state(&self, payload: &[u8], state: u32) -> Result<()> {
        if state == STATE_DESTROYED && self.want_destroy.load(Ordering::Acquire) {
            self.cancel.cancel();
            info!("tunnel gracefully destroyed");
            return Ok(());
        }

        let current = self.state();
        if current < STATE_OPTIMIZED {
            match state {
                STATE_CONFIGURING => {
                    let msg = self.prepare_init_message(STATE_OPTIMIZING_ROUTES)?;
                    if self
                        .state
                        .compare_exchange(
                            STATE_CONFIGURING,
                            STATE_OPTIMIZING_ROUTES,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        info!("configuration message received, optimizing routes");
                    }
                    self.peer
                        .send_custom_message(TunnelMessage::Message(msg))
                        .await?;
                }
                STATE_OPTIMIZING_ROUTES => {
                    if self
                        .state
                        .compare_exchange(
                            STATE_OPTIMIZING_ROUTES,
                            STATE_OPTIMIZED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        info!("route optimized, ready to use");
                        self.request_control_message();
                    }
                }
                _ => {
                    return Err(TunnelError::Protocol(format!(
                        "unknown tunnel state: {}",
                        state
                    )));
                }
            }
            self.last_fully_checked_at
                .store(unix_now() as i64, Ordering::Relaxed);
        }

        if payload.is_empty() {
            return Ok(());
        }

        match self.payload_keys.decrypt_payload(payload)? {
            Payload::DeliverUdp(p) => self.deliver_udp(p),
            Payload::OutBindDone(p) => self.out_bind_done(p).await,
            other => Err(TunnelError::Protocol(format!(
                "incorrect payload type: {:?}",
                std::mem::discriminant(&other)
            ))),
        }
    }

    fn deliver_udp(&self, p: DeliverUdpPayload) -> Result<()> {
        if p.ip.len() != 4 && p.ip.len() != 16 {
            return Err(TunnelError::Protocol(format!(
                "invalid ip len {}",
                p.ip.len()
            )));
        }
        if p.port > u16::MAX as u32 {
            return Err(TunnelError::Protocol(format!("invalid port {}", p.port)));
        }

        self.packets_recv.fetch_add(1, Ordering::Relaxed);

        let mut seqno_diff = 0u64;
        let prev = self.seqno_recv.load(Ordering::Acquire);
        if prev < p.seqno
            && self
                .seqno_recv
                .compare_exchange(prev, p.seqno, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            seqno_diff = p.seqno - prev;
        }

        if self.use_payments && seqno_diff > 0 {
            self.packets_recv_paid_consumed
                .fetch_add(seqno_diff, Ordering::Relaxed);

            let paid = self.packets_min_paid_in.load(Ordering::Relaxed);
            let consumed = self
                .packets_consumed_in
                .fetch_add(seqno_diff as i64, Ordering::Relaxed)
                + seqno_diff as i64;
            if paid - consumed < self.packets_to_prepay / 2 {
                self.request_control_message();
            }
        }

        let seqno = p.seqno;
        match self.read_tx.try_send(p) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(seqno, "inbound queue full, dropping packet");
                Err(TunnelError::QueueFull)
            }
        }
    }

    async fn out_bind_done(&self, p: OutBindDonePayload) -> Result<()> {
        let _guard = self.mx.write().await;

        if self.seqno_recv.load(Ordering::Acquire) > p.seqno {
            // out gateway restarted, pull receive seqno back in sync
            self.seqno_recv.store(p.seqno, Ordering::Release);
        }

        if p.port > u16::MAX as u32 {
            return Err(TunnelError::Protocol(format!("invalid port {}", p.port)));
        }
        let ip = ip_from_bytes(&p.ip)
            .ok_or_else(|| TunnelError::Protocol(format!("invalid ip len {}", p.ip.len())))?;
        let port = p.port as u16;

        {
            let mut external = self.external.lock();
            if *external == Some((ip, port)) {
                return Ok(());
            }
            *external = Some((ip, port));
        }

        if let Some(handler) = self.on_out_address_changed.lock().as_ref() {
            handler(SocketAddr::new(ip, port));
        }

        info!(%ip, port, "out gateway address updated");
        Ok(())
    }

    async fn process_ping(&self, seqno: u64, with_payments: bool) -> Result<()> {
        loop {
            let seen = self.control_seqno_received.load(Ordering::Acquire);
            if seen >= seqno {
                break;
            }
            if self
                .control_seqno_received
                .compare_exchange(seen, seqno, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            self.last_fully_checked_at
                .store(unix_now() as i64, Ordering::Relaxed);

            if with_payments {
                if self
                    .payments_confirmed
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    info!(seqno, "initiating payments confirmed");
                }
                self.control_paid_seqno_received
                    .store(seqno, Ordering::Release);
            }
            debug!(seqno, "control message returned successfully");

            if self.state() == STATE_CONFIGURING {
                // a concurrent liveness check pulled us back; re-init
                let msg = self.prepare_init_message(STATE_CONFIGURING)?;
                self.peer
                    .send_custom_message(TunnelMessage::Message(msg))
                    .await?;
            }
            break;
        }
        Ok(())
    }

    /// Per-coin total paid through this tunnel (packets plus channel fees).
    pub async fn calc_paid_amount(&self) -> HashMap<String, Coins> {
        let _guard = self.mx.read().await;

        let mut totals: HashMap<String, Coins> = HashMap::new();
        let Some(service) = &self.payments else {
            return totals;
        };

        for section in self.chain_to.iter().chain(self.chain_from.iter()) {
            let Some(payment) = &section.payment else {
                continue;
            };
            let Ok(coin) =
                service.resolve_coin_config(payment.token_master.as_deref(), payment.extra_currency_id)
            else {
                continue;
            };

            let mut amount = payment.paid_packets().max(0) as u128
                * payment.price_per_packet as u128;
            amount += payment.paid_channel_fee();

            totals
                .entry(coin.symbol)
                .and_modify(|c| c.nano += amount)
                .or_insert(Coins::new(amount, coin.decimals));
        }

        totals
    }

    /// Graceful close: run the destroy handshake against every hop, then
    /// tear the tunnel down and release the transport peer. Waits at most
    /// `deadline` (default 15 s) for the destroy echo.
    pub async fn stop(&self, deadline: Option<Duration>) {
        self.want_destroy.store(true, Ordering::Release);

        let timeout = deadline.unwrap_or(DEFAULT_CLOSE_TIMEOUT);
        let deadline = tokio::time::Instant::now() + timeout;

        if self.state() > STATE_CONFIGURING {
            loop {
                let msg = match self.prepare_close_message().await {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(%err, "prepare tunnel close message failed");
                        break;
                    }
                };

                if let Err(err) = self
                    .peer
                    .send_custom_message(TunnelMessage::Message(msg))
                    .await
                {
                    warn!(%err, "send tunnel close message failed");
                    break;
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = tokio::time::sleep(CLOSE_RESEND_INTERVAL) => continue,
                }
            }
        }

        self.cancel.cancel();
        self.peer.dereference();
    }

    /// Close with the default deadline.
    pub async fn close(&self) {
        self.stop(None).await;
    }
}

pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
