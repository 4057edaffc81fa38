//! Shared test harness: an in-process relay network that decrypts onion
//! layers with real hop keys, interprets routing instructions, and loops
//! initiator deliveries back into the tunnel.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use hopwire_core::{
    DeliverUdpPayload, EncryptedMessage, EncryptedMessageCached, Instruction, Meta,
    OutBindDonePayload, Payload, PaymentInstruction, SectionPubKey, SendOutPayload, TunnelMessage,
};
use hopwire_crypto::{ReceiverKeypair, SectionKeys};
use hopwire_payments::{
    ChainHop, ChannelMeta, ChannelStatus, CoinConfig, PaymentError, PaymentService,
    VirtualChannelState,
};
use hopwire_tunnel::{Transport, TransportError, Tunnel};

/// The external address the simulated egress reports.
pub const EGRESS_IP: [u8; 4] = [203, 0, 113, 7];
pub const EGRESS_PORT: u32 = 51820;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Transport that forwards every message into a channel the test drains.
pub struct MockTransport {
    tx: mpsc::UnboundedSender<TunnelMessage>,
    pub connected: std::sync::atomic::AtomicBool,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TunnelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                connected: std::sync::atomic::AtomicBool::new(true),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_custom_message(&self, msg: TunnelMessage) -> Result<(), TransportError> {
        if !self.connected.load(std::sync::atomic::Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(msg)
            .map_err(|_| TransportError::Other("test network gone".into()))
    }
}

// ---------------------------------------------------------------------------
// Relay network
// ---------------------------------------------------------------------------

/// A metadata delivery destined for the tunnel initiator.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub meta: Meta,
}

#[derive(Clone)]
struct RouteTarget {
    section_pubkey: SectionPubKey,
}

struct Binding {
    inbound_section_pubkey: SectionPubKey,
    inbound_instructions: Vec<u8>,
    payload_cipher: SectionKeys,
}

/// Simulated chain of relays. Interprets `BuildRoute`, `Cache`, `Route`,
/// `BindOut`, `Payment`, `Destroy` and `SendOut` the way real hops would,
/// and produces the deliveries a real reverse chain would hand to the
/// transport dispatcher.
pub struct RelayNet {
    hops: Vec<ReceiverKeypair>,
    routes: HashMap<u32, RouteTarget>,
    caches: HashMap<SectionPubKey, Vec<Instruction>>,
    binding: Option<Binding>,

    out_seqno: u64,
    /// Datagrams the egress sent to the open internet.
    pub sent_out: Vec<SendOutPayload>,
    /// Every payment instruction observed at any hop, in arrival order.
    pub seen_payments: Vec<PaymentInstruction>,
    /// Destroy instructions observed (close handshake).
    pub destroys: usize,

    /// Drop everything (simulated network freeze).
    pub mute_all: bool,
    /// Drop only ping echoes (simulated lost pongs).
    pub mute_pings: bool,
}

impl RelayNet {
    /// `hops` must contain every receiver on both chains, the local
    /// endpoint included.
    pub fn new(hops: Vec<ReceiverKeypair>) -> Self {
        Self {
            hops,
            routes: HashMap::new(),
            caches: HashMap::new(),
            binding: None,
            out_seqno: 0,
            sent_out: Vec::new(),
            seen_payments: Vec::new(),
            destroys: 0,
            mute_all: false,
            mute_pings: false,
        }
    }

    pub fn handle(&mut self, msg: TunnelMessage) -> Vec<Delivery> {
        let deliveries = match msg {
            TunnelMessage::Message(m) => self.dispatch(m),
            TunnelMessage::Cached(c) => {
                self.dispatch_cached(c);
                Vec::new()
            }
        };

        if self.mute_all {
            return Vec::new();
        }
        if self.mute_pings {
            return deliveries
                .into_iter()
                .filter(|d| !matches!(d.meta, Meta::Ping(_)))
                .collect();
        }
        deliveries
    }

    fn decrypt_at_hop(
        &self,
        msg: &EncryptedMessage,
    ) -> Option<(usize, SectionKeys, hopwire_core::InstructionsContainer, Vec<u8>)> {
        for (i, hop) in self.hops.iter().enumerate() {
            let keys = hop.derive_section(msg.section_pubkey);
            if let Ok((container, rest)) = keys.decrypt_instructions(&msg.instructions) {
                return Some((i, keys, container, rest));
            }
        }
        None
    }

    fn dispatch(&mut self, msg: EncryptedMessage) -> Vec<Delivery> {
        let (hop_index, _keys, container, rest) = self
            .decrypt_at_hop(&msg)
            .expect("no hop can decrypt message");

        let mut deliveries = Vec::new();
        let mut forward: Option<RouteTarget> = None;

        for instruction in container.list {
            match instruction {
                Instruction::BuildRoute(build) => {
                    self.routes.insert(
                        build.route_id,
                        RouteTarget {
                            section_pubkey: build.target_section_pubkey,
                        },
                    );
                }
                Instruction::Cache(cache) => {
                    self.caches.insert(msg.section_pubkey, cache.instructions);
                }
                Instruction::Route(route) => {
                    let target = self
                        .routes
                        .get(&route.route_id)
                        .unwrap_or_else(|| panic!("route {:#x} not built", route.route_id))
                        .clone();
                    forward = Some(target);
                }
                Instruction::BindOut(bind) => {
                    let payload_cipher =
                        self.hops[hop_index].derive_section(bind.receiver_pubkey);
                    self.binding = Some(Binding {
                        inbound_section_pubkey: bind.inbound_section_pubkey,
                        inbound_instructions: bind.inbound_instructions.clone(),
                        payload_cipher,
                    });

                    // A real gateway reports its external bind right away.
                    deliveries.extend(self.send_out_bind_done(self.out_seqno));
                }
                Instruction::Payment(payment) => {
                    self.seen_payments.push(payment);
                }
                Instruction::DeliverInitiator(deliver) => {
                    deliveries.push(Delivery {
                        payload: msg.payload.clone(),
                        meta: deliver.metadata,
                    });
                }
                Instruction::Destroy => {
                    self.destroys += 1;
                }
                Instruction::SendOut => {}
            }
        }

        if let Some(target) = forward {
            deliveries.extend(self.dispatch(EncryptedMessage {
                section_pubkey: target.section_pubkey,
                instructions: rest,
                payload: msg.payload,
            }));
        }

        deliveries
    }

    fn dispatch_cached(&mut self, msg: EncryptedMessageCached) {
        let mut section = msg.section_pubkey;
        loop {
            let cached = self
                .caches
                .get(&section)
                .unwrap_or_else(|| panic!("no cache for section {}", hex(&section)))
                .clone();

            let mut next = None;
            for instruction in &cached {
                match instruction {
                    Instruction::Route(route) => {
                        next = Some(
                            self.routes
                                .get(&route.route_id)
                                .expect("cached route not built")
                                .clone(),
                        );
                    }
                    Instruction::SendOut => {
                        let binding = self.binding.as_ref().expect("send out before bind");
                        if let Ok(Payload::SendOut(p)) =
                            binding.payload_cipher.decrypt_payload(&msg.payload)
                        {
                            self.sent_out.push(p);
                        }
                    }
                    _ => {}
                }
            }

            match next {
                Some(target) => section = target.section_pubkey,
                None => break,
            }
        }
    }

    fn inbound(&mut self, payload: Vec<u8>) -> Vec<Delivery> {
        let binding = self.binding.as_ref().expect("no bind-out yet");
        let msg = EncryptedMessage {
            section_pubkey: binding.inbound_section_pubkey,
            instructions: binding.inbound_instructions.clone(),
            payload,
        };
        self.dispatch(msg)
    }

    fn send_out_bind_done(&mut self, seqno: u64) -> Vec<Delivery> {
        let binding = self.binding.as_ref().expect("no bind-out yet");
        let sealed = binding
            .payload_cipher
            .encrypt_payload(&Payload::OutBindDone(OutBindDonePayload {
                seqno,
                ip: EGRESS_IP.to_vec(),
                port: EGRESS_PORT,
            }))
            .expect("seal out bind done");
        self.inbound(sealed)
    }

    /// Deliver a datagram arriving at the egress's external address.
    pub fn inject_udp(&mut self, ip: Vec<u8>, port: u32, data: Vec<u8>) -> Vec<Delivery> {
        self.inject_udp_with_seqno(self.out_seqno + 1, ip, port, data)
    }

    /// Deliver a datagram with an explicit gateway seqno (a jump forward
    /// simulates packets lost on the reverse path).
    pub fn inject_udp_with_seqno(
        &mut self,
        seqno: u64,
        ip: Vec<u8>,
        port: u32,
        data: Vec<u8>,
    ) -> Vec<Delivery> {
        self.out_seqno = seqno;
        let binding = self.binding.as_ref().expect("no bind-out yet");
        let sealed = binding
            .payload_cipher
            .encrypt_payload(&Payload::DeliverUdp(DeliverUdpPayload {
                seqno,
                ip,
                port,
                payload: data,
            }))
            .expect("seal deliver udp");
        self.inbound(sealed)
    }

    /// Seal a payload under the egress's payload cipher, as the gateway
    /// would before delivering it.
    pub fn seal_payload(&self, payload: &Payload) -> Vec<u8> {
        self.binding
            .as_ref()
            .expect("no bind-out yet")
            .payload_cipher
            .encrypt_payload(payload)
            .expect("seal payload")
    }

    /// Re-announce the external bind with an explicit seqno (gateway
    /// restart when lower than what the tunnel already saw).
    pub fn inject_out_bind_done(&mut self, seqno: u64) -> Vec<Delivery> {
        self.out_seqno = seqno;
        self.send_out_bind_done(seqno)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Payment service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockPayState {
    pub opened: Vec<(Vec<ChainHop>, [u8; 32])>,
    pub resolves: Vec<([u8; 32], VirtualChannelState)>,
    channels: HashMap<[u8; 32], ChannelStatus>,
}

/// Payment service that opens channels instantly and records every
/// signed state it is handed.
pub struct MockPaymentService {
    pub state: Mutex<MockPayState>,
    fail_opens: std::sync::atomic::AtomicBool,
    fail_resolves: std::sync::atomic::AtomicBool,
    min_ttl: Duration,
}

impl MockPaymentService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockPayState::default()),
            fail_opens: std::sync::atomic::AtomicBool::new(false),
            fail_resolves: std::sync::atomic::AtomicBool::new(false),
            min_ttl: Duration::from_secs(300),
        })
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opened.len()
    }

    pub fn resolve_count(&self) -> usize {
        self.state.lock().resolves.len()
    }

    pub fn last_resolve(&self) -> Option<([u8; 32], VirtualChannelState)> {
        self.state.lock().resolves.last().cloned()
    }

    /// Make every further channel open fail.
    pub fn set_fail_opens(&self, fail: bool) {
        self.fail_opens
            .store(fail, std::sync::atomic::Ordering::Release);
    }

    /// Make every further state registration fail.
    pub fn set_fail_resolves(&self, fail: bool) {
        self.fail_resolves
            .store(fail, std::sync::atomic::Ordering::Release);
    }
}

#[async_trait]
impl PaymentService for MockPaymentService {
    fn min_safe_ttl(&self) -> Duration {
        self.min_ttl
    }

    async fn open_virtual_channel(
        &self,
        chain: &[ChainHop],
        channel_key: &ed25519_dalek::SigningKey,
        _token_master: Option<&str>,
        _extra_currency_id: u32,
    ) -> Result<(), PaymentError> {
        if self.fail_opens.load(std::sync::atomic::Ordering::Acquire) {
            return Err(PaymentError::OpenChannelFailed("service refused".into()));
        }
        let channel_pub = channel_key.verifying_key().to_bytes();
        let mut state = self.state.lock();
        state.opened.push((chain.to_vec(), channel_pub));
        state.channels.insert(channel_pub, ChannelStatus::Active);
        Ok(())
    }

    async fn virtual_channel_meta(
        &self,
        channel_pub: [u8; 32],
    ) -> Result<ChannelMeta, PaymentError> {
        self.state
            .lock()
            .channels
            .get(&channel_pub)
            .map(|status| ChannelMeta { status: *status })
            .ok_or(PaymentError::NotFound)
    }

    async fn add_virtual_channel_resolve(
        &self,
        channel_pub: [u8; 32],
        state: &VirtualChannelState,
    ) -> Result<(), PaymentError> {
        if self.fail_resolves.load(std::sync::atomic::Ordering::Acquire) {
            return Err(PaymentError::Rejected("resolve refused".into()));
        }
        if !state.verify(&channel_pub) {
            return Err(PaymentError::Rejected("bad state signature".into()));
        }
        self.state.lock().resolves.push((channel_pub, state.clone()));
        Ok(())
    }

    fn resolve_coin_config(
        &self,
        token_master: Option<&str>,
        _extra_currency_id: u32,
    ) -> Result<CoinConfig, PaymentError> {
        Ok(CoinConfig {
            symbol: token_master.unwrap_or("NANO").to_string(),
            decimals: 9,
        })
    }
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

/// Drain the transport channel into the relay network, feeding resulting
/// deliveries back into the tunnel, until the tunnel dies.
pub fn spawn_pump(
    tunnel: Arc<Tunnel>,
    net: Arc<Mutex<RelayNet>>,
    mut rx: mpsc::UnboundedReceiver<TunnelMessage>,
) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let deliveries = net.lock().handle(msg);
            for delivery in deliveries {
                let _ = tunnel.process(&delivery.payload, delivery.meta).await;
            }
        }
    });
}

/// Feed a batch of deliveries into the tunnel.
pub async fn deliver_all(tunnel: &Tunnel, deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        let _ = tunnel.process(&delivery.payload, delivery.meta).await;
    }
}

/// Poll until `cond` holds or the timeout elapses; panics on timeout.
pub async fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Test bed
// ---------------------------------------------------------------------------

use hopwire_payments::PaymentChainSection;
use hopwire_tunnel::{PaymentInfo, SectionInfo, TunnelOptions};

pub struct TestConfig {
    /// Forward hops, egress included.
    pub forward_hops: usize,
    /// Reverse relays between the egress and the local endpoint.
    pub reverse_hops: usize,
    /// Per-packet price at the egress hop; 0 disables payments.
    pub egress_price: u64,
    /// Per-packet price at the first forward relay; 0 keeps it free.
    pub route_price: u64,
    /// Capacity cap of the single payment-chain hop toward the egress.
    pub chain_max_capacity: u128,
    pub prepay_target: i64,
    pub channel_capacity_payments: i64,
    pub liveness_timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            forward_hops: 2,
            reverse_hops: 0,
            egress_price: 0,
            route_price: 0,
            chain_max_capacity: 1_000_000_000_000_000_000,
            prepay_target: hopwire_tunnel::DEFAULT_PACKETS_TO_PREPAY,
            channel_capacity_payments: hopwire_tunnel::DEFAULT_CHANNEL_CAPACITY_PAYMENTS,
            liveness_timeout: hopwire_tunnel::DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

pub struct TestBed {
    pub tunnel: Arc<Tunnel>,
    pub net: Arc<Mutex<RelayNet>>,
    pub transport: Arc<MockTransport>,
    pub service: Arc<MockPaymentService>,
    /// Handle to the egress hop's payment accounting, when paying.
    pub egress_payment: Option<Arc<PaymentInfo>>,
    /// Handle to the first relay's payment accounting, when paying.
    pub route_payment: Option<Arc<PaymentInfo>>,
}

/// Build the tunnel and network without draining the transport; the test
/// owns the receiver (for message inspection or a later pump).
pub fn start_unpumped(
    config: TestConfig,
) -> (TestBed, mpsc::UnboundedReceiver<TunnelMessage>) {
    hopwire_logging::init_for_tests();

    let mut receivers: Vec<ReceiverKeypair> = (0..config.forward_hops + config.reverse_hops)
        .map(|_| ReceiverKeypair::generate())
        .collect();
    let local = ReceiverKeypair::generate();

    let payment_chain = |config: &TestConfig| {
        vec![PaymentChainSection {
            key: [42u8; 32],
            min_fee: 1,
            fee_bps: 50,
            max_capacity: config.chain_max_capacity,
        }]
    };

    let mut egress_payment = None;
    let mut route_payment = None;
    let mut chain_to = Vec::new();
    for (i, receiver) in receivers.iter().take(config.forward_hops).enumerate() {
        let keys = SectionKeys::generate(&receiver.public()).unwrap();
        let is_egress = i == config.forward_hops - 1;
        if is_egress && config.egress_price > 0 {
            let payment = Arc::new(PaymentInfo::new(
                config.egress_price,
                payment_chain(&config),
            ));
            egress_payment = Some(payment.clone());
            chain_to.push(SectionInfo::with_payment(keys, payment));
        } else if i == 0 && !is_egress && config.route_price > 0 {
            let payment = Arc::new(PaymentInfo::new(
                config.route_price,
                payment_chain(&config),
            ));
            route_payment = Some(payment.clone());
            chain_to.push(SectionInfo::with_payment(keys, payment));
        } else {
            chain_to.push(SectionInfo::new(keys));
        }
    }

    let mut chain_from = Vec::new();
    for receiver in receivers.iter().skip(config.forward_hops) {
        chain_from.push(SectionInfo::new(
            SectionKeys::generate(&receiver.public()).unwrap(),
        ));
    }
    chain_from.push(SectionInfo::new(
        SectionKeys::generate(&local.public()).unwrap(),
    ));

    let (transport, rx) = MockTransport::new();
    let service = MockPaymentService::new();

    let mut options = TunnelOptions::new(chain_to, chain_from, local.public(), transport.clone())
        .with_prepay_target(config.prepay_target)
        .with_channel_capacity_payments(config.channel_capacity_payments)
        .with_liveness_timeout(config.liveness_timeout);
    if config.egress_price > 0 || config.route_price > 0 {
        options = options.with_payments(service.clone());
    }

    let tunnel = Tunnel::open(options).unwrap();

    receivers.push(local);
    let net = Arc::new(Mutex::new(RelayNet::new(receivers)));

    (
        TestBed {
            tunnel,
            net,
            transport,
            service,
            egress_payment,
            route_payment,
        },
        rx,
    )
}

/// Build the tunnel, network and pump task.
pub fn start(config: TestConfig) -> TestBed {
    let (bed, rx) = start_unpumped(config);
    spawn_pump(bed.tunnel.clone(), bed.net.clone(), rx);
    bed
}
