//! Layered instruction assembly and reassembly.
//!
//! Messages are built innermost-first: the terminal hop's instructions
//! are encrypted, then each outer section wraps routing instructions in
//! front of the previous ciphertext. Reassembly walks the same layers in
//! decrypt order and re-encrypts them, producing an equivalent message
//! without contacting any hop.

use tracing::debug;

use hopwire_core::{
    route_id, system_route, BindOut, BuildRoute, CacheInstruction, DeliverInitiator,
    EncryptedMessage, Instruction, Meta, RouteInstruction, SectionPubKey, StateMeta,
    STATE_CONFIGURING, STATE_DESTROYED, STATE_OPTIMIZING_ROUTES,
};
use hopwire_crypto::node_id;

use crate::section::SectionInfo;
use crate::tunnel::Tunnel;
use crate::{now_nanos, Result, TunnelError};

/// Encrypt one routing layer of a chain onto `msg`.
///
/// On the initial configuring message the hop also gets a `BuildRoute`
/// for the next section, a cache of the plain route dispatch, and a
/// second `BuildRoute` for the parallel system route that keeps control
/// and payment traffic off the paid budget.
pub(crate) fn build_route(
    initial: bool,
    msg: &mut EncryptedMessage,
    current: &SectionInfo,
    next: &SectionInfo,
    prepare_system_route: bool,
) -> Result<()> {
    let target_node_id = node_id(&next.keys.receiver_pubkey);
    let route = route_id(&next.keys.section_pubkey);

    let mut instructions = Vec::new();
    if initial {
        let price = current
            .payment
            .as_ref()
            .map(|p| p.price_per_packet)
            .unwrap_or(0);

        instructions.push(Instruction::BuildRoute(BuildRoute {
            target_node_id,
            target_section_pubkey: next.keys.section_pubkey,
            route_id: route,
            price_per_packet: price,
        }));
        instructions.push(Instruction::Cache(CacheInstruction {
            version: now_nanos(),
            instructions: vec![Instruction::Route(RouteInstruction { route_id: route })],
        }));

        if prepare_system_route {
            instructions.push(Instruction::BuildRoute(BuildRoute {
                target_node_id,
                target_section_pubkey: next.keys.section_pubkey,
                route_id: system_route(route),
                price_per_packet: price,
            }));
        }
    }

    instructions.push(Instruction::Route(RouteInstruction { route_id: route }));

    current.keys.encrypt_instructions(msg, instructions)?;
    Ok(())
}

impl Tunnel {
    /// Build the layered configuration message for `state`.
    ///
    /// Up to `OptimizingRoutes` the egress layer carries the `BindOut`
    /// coupling with the fully nested reverse-chain message; afterwards
    /// only the cached `SendOut` dispatch is refreshed.
    pub(crate) fn prepare_init_message(&self, state: u32) -> Result<EncryptedMessage> {
        let mut msg = EncryptedMessage::default();

        let n = self.chain_to.len();
        for i in (0..n).rev() {
            if i == n - 1 {
                // out gate
                if state <= STATE_OPTIMIZING_ROUTES {
                    let back_msg = self.prepare_inbound_message(state)?;

                    let inbound_node_id = node_id(&self.chain_from[0].keys.receiver_pubkey);
                    let price = self.chain_to[i]
                        .payment
                        .as_ref()
                        .map(|p| p.price_per_packet)
                        .unwrap_or(0);

                    self.chain_to[i].keys.encrypt_instructions(
                        &mut msg,
                        vec![
                            // system route toward the reverse chain, for
                            // control replies and payments
                            Instruction::BuildRoute(BuildRoute {
                                target_node_id: inbound_node_id,
                                target_section_pubkey: back_msg.section_pubkey,
                                route_id: system_route(route_id(&back_msg.section_pubkey)),
                                price_per_packet: price,
                            }),
                            Instruction::BindOut(BindOut {
                                inbound_node_id,
                                inbound_section_pubkey: back_msg.section_pubkey,
                                inbound_instructions: back_msg.instructions,
                                receiver_pubkey: self.payload_keys.section_pubkey,
                                price_per_packet: price,
                            }),
                            Instruction::Cache(CacheInstruction {
                                version: now_nanos(),
                                instructions: vec![Instruction::SendOut],
                            }),
                        ],
                    )?;
                    continue;
                }

                self.chain_to[i].keys.encrypt_instructions(
                    &mut msg,
                    vec![Instruction::Cache(CacheInstruction {
                        version: now_nanos(),
                        instructions: vec![Instruction::SendOut],
                    })],
                )?;
                continue;
            }

            build_route(
                state == STATE_CONFIGURING,
                &mut msg,
                &self.chain_to[i],
                &self.chain_to[i + 1],
                true,
            )?;
        }

        debug!(state, "init message prepared");
        Ok(msg)
    }

    /// Nest the reverse chain: every hop routes inward, the local
    /// endpoint receives (and caches) the state delivery.
    fn prepare_inbound_message(&self, state: u32) -> Result<EncryptedMessage> {
        let mut back_msg = EncryptedMessage::default();

        let m = self.chain_from.len();
        for y in (0..m).rev() {
            if y == m - 1 {
                // ourselves
                let deliver = Instruction::DeliverInitiator(DeliverInitiator {
                    from: self.local_id,
                    metadata: Meta::State(StateMeta { state }),
                });
                self.chain_from[y].keys.encrypt_instructions(
                    &mut back_msg,
                    vec![
                        deliver.clone(),
                        Instruction::Cache(CacheInstruction {
                            version: now_nanos(),
                            instructions: vec![deliver],
                        }),
                    ],
                )?;
                continue;
            }

            build_route(
                state == STATE_CONFIGURING,
                &mut back_msg,
                &self.chain_from[y],
                &self.chain_from[y + 1],
                true,
            )?;
        }

        Ok(back_msg)
    }

    /// Build the close-handshake message: every intermediate hop destroys
    /// its routes via the system route, the terminal delivers the
    /// destroyed state back to us.
    pub(crate) async fn prepare_close_message(&self) -> Result<EncryptedMessage> {
        let _guard = self.mx.write().await;

        let nodes: Vec<&SectionInfo> =
            self.chain_to.iter().chain(self.chain_from.iter()).collect();

        let mut msg = EncryptedMessage::default();
        for i in (0..nodes.len()).rev() {
            if i == nodes.len() - 1 {
                nodes[i].keys.encrypt_instructions(
                    &mut msg,
                    vec![Instruction::DeliverInitiator(DeliverInitiator {
                        from: self.local_id,
                        metadata: Meta::State(StateMeta {
                            state: STATE_DESTROYED,
                        }),
                    })],
                )?;
                continue;
            }

            let route = route_id(&nodes[i + 1].keys.section_pubkey);
            nodes[i].keys.encrypt_instructions(
                &mut msg,
                vec![
                    Instruction::Route(RouteInstruction {
                        route_id: system_route(route),
                    }),
                    Instruction::Destroy,
                ],
            )?;
        }

        Ok(msg)
    }

    /// Rebuild a layered message under the same section keys.
    ///
    /// The reassembled message decrypts to byte-identical containers; a
    /// different container count means the instruction chain is malformed
    /// and the tunnel state is unusable, so that is a hard abort.
    pub async fn reassemble_instructions(
        &self,
        msg: &EncryptedMessage,
    ) -> Result<EncryptedMessage> {
        let _guard = self.mx.write().await;

        let byte_len = msg.instructions.len();
        debug!(
            len = byte_len,
            section = %hex::encode(msg.section_pubkey),
            "reassemble instructions"
        );

        let reassembled = self.reassemble_inner(msg)?;

        assert_eq!(
            reassembled.instructions.len(),
            byte_len,
            "reassembled instruction blob length diverged"
        );

        Ok(reassembled)
    }

    fn reassemble_inner(&self, msg: &EncryptedMessage) -> Result<EncryptedMessage> {
        let mut containers = Vec::new();
        let mut sections: Vec<&SectionInfo> = Vec::new();

        let mut section_key = msg.section_pubkey;
        let mut rest = msg.instructions.clone();

        loop {
            let (section, next_section) = self.resolve_section(&section_key).ok_or_else(|| {
                TunnelError::Protocol(format!("section {} not found", hex::encode(section_key)))
            })?;

            let (mut container, trailing) = section.keys.decrypt_instructions(&rest)?;
            rest = trailing;

            let mut more = false;
            for instruction in container.list.iter_mut() {
                match instruction {
                    Instruction::Route(_) => {
                        if let Some(next) = next_section {
                            more = true;
                            section_key = next.keys.section_pubkey;
                        }
                    }
                    Instruction::BindOut(bind) => {
                        let inner = EncryptedMessage {
                            section_pubkey: bind.inbound_section_pubkey,
                            instructions: bind.inbound_instructions.clone(),
                            payload: Vec::new(),
                        };
                        let inner = self.reassemble_inner(&inner)?;
                        bind.inbound_instructions = inner.instructions;
                    }
                    _ => {}
                }
            }

            containers.push(container);
            sections.push(section);

            if !more {
                break;
            }
        }

        let mut out = EncryptedMessage::default();
        for i in (0..containers.len()).rev() {
            sections[i]
                .keys
                .encrypt_instructions(&mut out, containers[i].list.clone())?;
        }
        out.payload = msg.payload.clone();

        Ok(out)
    }

    /// Find a section by its public key, along with the section that
    /// follows it on the combined forward-then-reverse path.
    fn resolve_section(
        &self,
        section_pubkey: &SectionPubKey,
    ) -> Option<(&SectionInfo, Option<&SectionInfo>)> {
        for (i, info) in self.chain_to.iter().enumerate() {
            if info.keys.section_pubkey == *section_pubkey {
                let next = if i + 1 < self.chain_to.len() {
                    Some(&self.chain_to[i + 1])
                } else {
                    self.chain_from.first()
                };
                return Some((info, next));
            }
        }

        for (i, info) in self.chain_from.iter().enumerate() {
            if info.keys.section_pubkey == *section_pubkey {
                return Some((info, self.chain_from.get(i + 1)));
            }
        }

        None
    }
}
