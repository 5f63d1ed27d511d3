//! Per-round resolution of the next messages to relay.
//!
//! Once both path ends are in sync, each round reads the merged caches and
//! decides, per destination chain, which packet-flow, handshake, and
//! client-update messages to assemble and submit next.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{ChannelKey, ConnectionKey};
use crate::error::Error;
use crate::ident::ChainId;
use crate::lifecycle::MessageLifecycle;
use crate::msgs::{
    short_action, MSG_ACKNOWLEDGEMENT, MSG_CHANNEL_CLOSE_CONFIRM, MSG_CHANNEL_CLOSE_INIT,
    MSG_CHANNEL_OPEN_ACK, MSG_CHANNEL_OPEN_CONFIRM, MSG_CHANNEL_OPEN_INIT, MSG_CHANNEL_OPEN_TRY,
    MSG_CONNECTION_OPEN_ACK, MSG_CONNECTION_OPEN_CONFIRM, MSG_CONNECTION_OPEN_INIT,
    MSG_CONNECTION_OPEN_TRY, MSG_RECV_PACKET, MSG_TIMEOUT, MSG_TIMEOUT_ON_CLOSE, MSG_TRANSFER,
};
use crate::processor::PathProcessor;
use crate::provider::{
    AnyMsg, ChainProvider, ChannelInfo, ConnectionInfo, LatestBlock, PacketInfo, Proof,
};
use crate::runtime::PathEndRuntime;

/// A packet message to be assembled and submitted to one path end, with
/// the channel key from that path end's perspective.
#[derive(Clone, Debug)]
pub(crate) struct PacketIbcMessage {
    pub(crate) channel_key: ChannelKey,
    pub(crate) action: String,
    pub(crate) info: PacketInfo,
}

/// A channel handshake message to be assembled and submitted to one path
/// end, with the channel key from that path end's perspective.
#[derive(Clone, Debug)]
pub(crate) struct ChannelIbcMessage {
    pub(crate) channel_key: ChannelKey,
    pub(crate) action: String,
    pub(crate) info: ChannelInfo,
}

/// A connection handshake message to be assembled and submitted to one
/// path end, with the connection key from that path end's perspective.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionIbcMessage {
    pub(crate) connection_key: ConnectionKey,
    pub(crate) action: String,
    pub(crate) info: ConnectionInfo,
}

/// Everything destined for one path end in one round.
#[derive(Default)]
struct PathEndMessages {
    packet_messages: Vec<PacketIbcMessage>,
    connection_messages: Vec<ConnectionIbcMessage>,
    channel_messages: Vec<ChannelIbcMessage>,
}

impl PathEndMessages {
    fn is_empty(&self) -> bool {
        self.packet_messages.is_empty()
            && self.connection_messages.is_empty()
            && self.channel_messages.is_empty()
    }
}

/// The packet-flow observations relevant to one channel in one direction;
/// src is the chain the packets were sent from.
struct PacketFlowMessages {
    src_channel_key: ChannelKey,
    src_msg_transfer: BTreeMap<u64, PacketInfo>,
    dst_msg_recv_packet: BTreeMap<u64, PacketInfo>,
    src_msg_acknowledgement: BTreeMap<u64, PacketInfo>,
    src_msg_timeout: BTreeMap<u64, PacketInfo>,
    src_msg_timeout_on_close: BTreeMap<u64, PacketInfo>,
}

impl PacketFlowMessages {
    fn gather(
        src: &PathEndRuntime,
        dst: &PathEndRuntime,
        src_key: &ChannelKey,
        dst_key: &ChannelKey,
    ) -> Self {
        let src_flow = src.message_cache.packet_flow.get(src_key);
        let dst_flow = dst.message_cache.packet_flow.get(dst_key);
        let sequences = |flow: Option<&crate::cache::PacketMessagesCache>, action: &str| {
            flow.and_then(|mc| mc.get(action))
                .map(|sc| sc.0.clone())
                .unwrap_or_default()
        };
        Self {
            src_channel_key: src_key.clone(),
            src_msg_transfer: sequences(src_flow, MSG_TRANSFER),
            dst_msg_recv_packet: sequences(dst_flow, MSG_RECV_PACKET),
            src_msg_acknowledgement: sequences(src_flow, MSG_ACKNOWLEDGEMENT),
            src_msg_timeout: sequences(src_flow, MSG_TIMEOUT),
            src_msg_timeout_on_close: sequences(src_flow, MSG_TIMEOUT_ON_CLOSE),
        }
    }
}

#[derive(Default)]
struct PacketFlowResponse {
    /// Messages toward the packet source chain (acks, timeouts).
    src_messages: Vec<PacketIbcMessage>,
    /// Messages toward the packet destination chain (receives).
    dst_messages: Vec<PacketIbcMessage>,
    to_delete_src: BTreeMap<String, Vec<u64>>,
    to_delete_dst: BTreeMap<String, Vec<u64>>,
}

fn packet_timed_out(packet: &PacketInfo, dst_latest: LatestBlock) -> bool {
    // A zero timeout height or timestamp means no timeout of that kind.
    (packet.timeout_height > 0 && dst_latest.height >= packet.timeout_height)
        || (packet.timeout_timestamp > 0 && dst_latest.time >= packet.timeout_timestamp)
}

/// For each packet sent from src, decide the next packet-phase message, or
/// mark the flow's cache entries deletable once a terminal message has
/// been observed. Candidates come out in ascending sequence order.
fn unrelayed_packet_flow_messages(
    messages: &PacketFlowMessages,
    dst_latest: LatestBlock,
    dst_channel_open: bool,
) -> PacketFlowResponse {
    let mut response = PacketFlowResponse::default();

    for (&sequence, transfer) in &messages.src_msg_transfer {
        if messages.src_msg_acknowledgement.contains_key(&sequence) {
            // Acknowledged on the source; the whole flow is complete.
            response
                .to_delete_src
                .entry(MSG_TRANSFER.to_string())
                .or_default()
                .push(sequence);
            response
                .to_delete_src
                .entry(MSG_ACKNOWLEDGEMENT.to_string())
                .or_default()
                .push(sequence);
            response
                .to_delete_dst
                .entry(MSG_RECV_PACKET.to_string())
                .or_default()
                .push(sequence);
            continue;
        }

        let timeout_action = if messages.src_msg_timeout.contains_key(&sequence) {
            Some(MSG_TIMEOUT)
        } else if messages.src_msg_timeout_on_close.contains_key(&sequence) {
            Some(MSG_TIMEOUT_ON_CLOSE)
        } else {
            None
        };
        if let Some(timeout_action) = timeout_action {
            // Timed out on the source; the flow is complete.
            response
                .to_delete_src
                .entry(MSG_TRANSFER.to_string())
                .or_default()
                .push(sequence);
            response
                .to_delete_src
                .entry(timeout_action.to_string())
                .or_default()
                .push(sequence);
            continue;
        }

        if let Some(recv) = messages.dst_msg_recv_packet.get(&sequence) {
            // Received but not acknowledged: the recv observation carries
            // the acknowledgement to submit back to the source.
            response.src_messages.push(PacketIbcMessage {
                channel_key: messages.src_channel_key.clone(),
                action: MSG_ACKNOWLEDGEMENT.to_string(),
                info: recv.clone(),
            });
            continue;
        }

        if packet_timed_out(transfer, dst_latest) {
            let action = if dst_channel_open {
                MSG_TIMEOUT
            } else {
                MSG_TIMEOUT_ON_CLOSE
            };
            response.src_messages.push(PacketIbcMessage {
                channel_key: messages.src_channel_key.clone(),
                action: action.to_string(),
                info: transfer.clone(),
            });
        } else if dst_channel_open {
            response.dst_messages.push(PacketIbcMessage {
                channel_key: messages.src_channel_key.counterparty(),
                action: MSG_RECV_PACKET.to_string(),
                info: transfer.clone(),
            });
        }
    }

    // Terminal messages whose transfer is already gone are stale.
    for sequence in messages.src_msg_acknowledgement.keys() {
        if !messages.src_msg_transfer.contains_key(sequence) {
            response
                .to_delete_src
                .entry(MSG_ACKNOWLEDGEMENT.to_string())
                .or_default()
                .push(*sequence);
            response
                .to_delete_dst
                .entry(MSG_RECV_PACKET.to_string())
                .or_default()
                .push(*sequence);
        }
    }
    for (timeout_action, cache) in [
        (MSG_TIMEOUT, &messages.src_msg_timeout),
        (MSG_TIMEOUT_ON_CLOSE, &messages.src_msg_timeout_on_close),
    ] {
        for sequence in cache.keys() {
            if !messages.src_msg_transfer.contains_key(sequence) {
                response
                    .to_delete_src
                    .entry(timeout_action.to_string())
                    .or_default()
                    .push(*sequence);
            }
        }
    }

    response
}

/// The connection-handshake observations in one orientation; src is the
/// chain the handshake was initiated on.
struct ConnectionHandshakeMessages {
    src_msg_connection_open_init: BTreeMap<ConnectionKey, ConnectionInfo>,
    dst_msg_connection_open_try: BTreeMap<ConnectionKey, ConnectionInfo>,
    src_msg_connection_open_ack: BTreeMap<ConnectionKey, ConnectionInfo>,
    dst_msg_connection_open_confirm: BTreeMap<ConnectionKey, ConnectionInfo>,
}

impl ConnectionHandshakeMessages {
    fn gather(src: &PathEndRuntime, dst: &PathEndRuntime) -> Self {
        let entries = |runtime: &PathEndRuntime, action: &str| {
            runtime
                .message_cache
                .connection_handshake
                .get(action)
                .map(|c| c.0.clone())
                .unwrap_or_default()
        };
        Self {
            src_msg_connection_open_init: entries(src, MSG_CONNECTION_OPEN_INIT),
            dst_msg_connection_open_try: entries(dst, MSG_CONNECTION_OPEN_TRY),
            src_msg_connection_open_ack: entries(src, MSG_CONNECTION_OPEN_ACK),
            dst_msg_connection_open_confirm: entries(dst, MSG_CONNECTION_OPEN_CONFIRM),
        }
    }
}

#[derive(Default)]
struct ConnectionHandshakeResponse {
    src_messages: Vec<ConnectionIbcMessage>,
    dst_messages: Vec<ConnectionIbcMessage>,
    to_delete_src: BTreeMap<String, Vec<ConnectionKey>>,
    to_delete_dst: BTreeMap<String, Vec<ConnectionKey>>,
}

/// Walk each handshake initiated on src and emit the step its
/// counterparty has not observed yet; fully confirmed handshakes become
/// deletable on both sides.
fn unrelayed_connection_handshake_messages(
    messages: &ConnectionHandshakeMessages,
) -> ConnectionHandshakeResponse {
    let mut response = ConnectionHandshakeResponse::default();

    for (init_key, init_info) in &messages.src_msg_connection_open_init {
        // The init message does not know the counterparty connection ID,
        // so candidates are matched on the init form of their key.
        let found_try = messages
            .dst_msg_connection_open_try
            .iter()
            .find(|(try_key, _)| try_key.counterparty().msg_init_key() == *init_key);

        let Some((try_key, try_info)) = found_try else {
            response.dst_messages.push(ConnectionIbcMessage {
                connection_key: init_key.counterparty(),
                action: MSG_CONNECTION_OPEN_TRY.to_string(),
                info: init_info.clone(),
            });
            continue;
        };

        let src_key = try_key.counterparty();
        let Some(ack_info) = messages.src_msg_connection_open_ack.get(&src_key) else {
            response.src_messages.push(ConnectionIbcMessage {
                connection_key: src_key,
                action: MSG_CONNECTION_OPEN_ACK.to_string(),
                info: try_info.clone(),
            });
            continue;
        };

        if !messages.dst_msg_connection_open_confirm.contains_key(try_key) {
            response.dst_messages.push(ConnectionIbcMessage {
                connection_key: try_key.clone(),
                action: MSG_CONNECTION_OPEN_CONFIRM.to_string(),
                info: ack_info.clone(),
            });
            continue;
        }

        // Handshake complete on both sides; all four entries deletable.
        response
            .to_delete_src
            .entry(MSG_CONNECTION_OPEN_INIT.to_string())
            .or_default()
            .push(init_key.clone());
        response
            .to_delete_src
            .entry(MSG_CONNECTION_OPEN_ACK.to_string())
            .or_default()
            .push(src_key);
        response
            .to_delete_dst
            .entry(MSG_CONNECTION_OPEN_TRY.to_string())
            .or_default()
            .push(try_key.clone());
        response
            .to_delete_dst
            .entry(MSG_CONNECTION_OPEN_CONFIRM.to_string())
            .or_default()
            .push(try_key.clone());
    }

    response
}

/// The channel-handshake observations in one orientation; src is the
/// chain the handshake (or close) was initiated on.
struct ChannelHandshakeMessages {
    src_msg_channel_open_init: BTreeMap<ChannelKey, ChannelInfo>,
    dst_msg_channel_open_try: BTreeMap<ChannelKey, ChannelInfo>,
    src_msg_channel_open_ack: BTreeMap<ChannelKey, ChannelInfo>,
    dst_msg_channel_open_confirm: BTreeMap<ChannelKey, ChannelInfo>,
    src_msg_channel_close_init: BTreeMap<ChannelKey, ChannelInfo>,
    dst_msg_channel_close_confirm: BTreeMap<ChannelKey, ChannelInfo>,
}

impl ChannelHandshakeMessages {
    fn gather(src: &PathEndRuntime, dst: &PathEndRuntime) -> Self {
        let entries = |runtime: &PathEndRuntime, action: &str| {
            runtime
                .message_cache
                .channel_handshake
                .get(action)
                .map(|c| c.0.clone())
                .unwrap_or_default()
        };
        Self {
            src_msg_channel_open_init: entries(src, MSG_CHANNEL_OPEN_INIT),
            dst_msg_channel_open_try: entries(dst, MSG_CHANNEL_OPEN_TRY),
            src_msg_channel_open_ack: entries(src, MSG_CHANNEL_OPEN_ACK),
            dst_msg_channel_open_confirm: entries(dst, MSG_CHANNEL_OPEN_CONFIRM),
            src_msg_channel_close_init: entries(src, MSG_CHANNEL_CLOSE_INIT),
            dst_msg_channel_close_confirm: entries(dst, MSG_CHANNEL_CLOSE_CONFIRM),
        }
    }
}

#[derive(Default)]
struct ChannelHandshakeResponse {
    src_messages: Vec<ChannelIbcMessage>,
    dst_messages: Vec<ChannelIbcMessage>,
    to_delete_src: BTreeMap<String, Vec<ChannelKey>>,
    to_delete_dst: BTreeMap<String, Vec<ChannelKey>>,
}

/// Channel analogue of [`unrelayed_connection_handshake_messages`], also
/// covering the close flow: a close init unmatched by a close confirm on
/// the counterparty emits the confirm.
fn unrelayed_channel_handshake_messages(
    messages: &ChannelHandshakeMessages,
) -> ChannelHandshakeResponse {
    let mut response = ChannelHandshakeResponse::default();

    for (init_key, init_info) in &messages.src_msg_channel_open_init {
        let found_try = messages
            .dst_msg_channel_open_try
            .iter()
            .find(|(try_key, _)| try_key.counterparty().msg_init_key() == *init_key);

        let Some((try_key, try_info)) = found_try else {
            response.dst_messages.push(ChannelIbcMessage {
                channel_key: init_key.counterparty(),
                action: MSG_CHANNEL_OPEN_TRY.to_string(),
                info: init_info.clone(),
            });
            continue;
        };

        let src_key = try_key.counterparty();
        let Some(ack_info) = messages.src_msg_channel_open_ack.get(&src_key) else {
            response.src_messages.push(ChannelIbcMessage {
                channel_key: src_key,
                action: MSG_CHANNEL_OPEN_ACK.to_string(),
                info: try_info.clone(),
            });
            continue;
        };

        if !messages.dst_msg_channel_open_confirm.contains_key(try_key) {
            response.dst_messages.push(ChannelIbcMessage {
                channel_key: try_key.clone(),
                action: MSG_CHANNEL_OPEN_CONFIRM.to_string(),
                info: ack_info.clone(),
            });
            continue;
        }

        response
            .to_delete_src
            .entry(MSG_CHANNEL_OPEN_INIT.to_string())
            .or_default()
            .push(init_key.clone());
        response
            .to_delete_src
            .entry(MSG_CHANNEL_OPEN_ACK.to_string())
            .or_default()
            .push(src_key);
        response
            .to_delete_dst
            .entry(MSG_CHANNEL_OPEN_TRY.to_string())
            .or_default()
            .push(try_key.clone());
        response
            .to_delete_dst
            .entry(MSG_CHANNEL_OPEN_CONFIRM.to_string())
            .or_default()
            .push(try_key.clone());
    }

    for (close_key, close_info) in &messages.src_msg_channel_close_init {
        let counterparty_key = close_key.counterparty();
        if messages
            .dst_msg_channel_close_confirm
            .contains_key(&counterparty_key)
        {
            response
                .to_delete_src
                .entry(MSG_CHANNEL_CLOSE_INIT.to_string())
                .or_default()
                .push(close_key.clone());
            response
                .to_delete_dst
                .entry(MSG_CHANNEL_CLOSE_CONFIRM.to_string())
                .or_default()
                .push(counterparty_key);
        } else {
            response.dst_messages.push(ChannelIbcMessage {
                channel_key: counterparty_key,
                action: MSG_CHANNEL_CLOSE_CONFIRM.to_string(),
                info: close_info.clone(),
            });
        }
    }

    response
}

enum OutgoingMessage {
    Packet(PacketIbcMessage),
    Connection(ConnectionIbcMessage),
    Channel(ChannelIbcMessage),
}

impl PathProcessor {
    /// Process the latest message cache state from both path ends: resolve
    /// the next messages in every sub-protocol, then assemble and send
    /// them per destination.
    pub(crate) fn process_latest_messages(
        &mut self,
        lifecycle: Option<&MessageLifecycle>,
    ) -> Result<(), Error> {
        self.send_initial_message_if_necessary(lifecycle)?;

        let mut to_end_1 = PathEndMessages::default();
        let mut to_end_2 = PathEndMessages::default();

        // Connection handshakes, each side viewed as the initiator.
        let handshake = ConnectionHandshakeMessages::gather(&self.path_end_1, &self.path_end_2);
        let response = unrelayed_connection_handshake_messages(&handshake);
        to_end_1.connection_messages.extend(response.src_messages);
        to_end_2.connection_messages.extend(response.dst_messages);
        self.path_end_1
            .message_cache
            .connection_handshake
            .delete_cached_messages(&response.to_delete_src);
        self.path_end_2
            .message_cache
            .connection_handshake
            .delete_cached_messages(&response.to_delete_dst);

        let handshake = ConnectionHandshakeMessages::gather(&self.path_end_2, &self.path_end_1);
        let response = unrelayed_connection_handshake_messages(&handshake);
        to_end_2.connection_messages.extend(response.src_messages);
        to_end_1.connection_messages.extend(response.dst_messages);
        self.path_end_2
            .message_cache
            .connection_handshake
            .delete_cached_messages(&response.to_delete_src);
        self.path_end_1
            .message_cache
            .connection_handshake
            .delete_cached_messages(&response.to_delete_dst);

        // Channel handshakes and closes, each side viewed as the initiator.
        let handshake = ChannelHandshakeMessages::gather(&self.path_end_1, &self.path_end_2);
        let response = unrelayed_channel_handshake_messages(&handshake);
        to_end_1.channel_messages.extend(response.src_messages);
        to_end_2.channel_messages.extend(response.dst_messages);
        self.path_end_1
            .message_cache
            .channel_handshake
            .delete_cached_messages(&response.to_delete_src);
        self.path_end_2
            .message_cache
            .channel_handshake
            .delete_cached_messages(&response.to_delete_dst);

        let handshake = ChannelHandshakeMessages::gather(&self.path_end_2, &self.path_end_1);
        let response = unrelayed_channel_handshake_messages(&handshake);
        to_end_2.channel_messages.extend(response.src_messages);
        to_end_1.channel_messages.extend(response.dst_messages);
        self.path_end_2
            .message_cache
            .channel_handshake
            .delete_cached_messages(&response.to_delete_src);
        self.path_end_1
            .message_cache
            .channel_handshake
            .delete_cached_messages(&response.to_delete_dst);

        // Packet flows per open channel pair, in both directions.
        for pair in self.channel_pairs() {
            let open_1 = self
                .path_end_1
                .channel_state_cache
                .read()
                .get(&pair.path_end_1_channel_key)
                .copied()
                .unwrap_or(true);
            let open_2 = self
                .path_end_2
                .channel_state_cache
                .read()
                .get(&pair.path_end_2_channel_key)
                .copied()
                .unwrap_or(true);

            let flow = PacketFlowMessages::gather(
                &self.path_end_1,
                &self.path_end_2,
                &pair.path_end_1_channel_key,
                &pair.path_end_2_channel_key,
            );
            let response =
                unrelayed_packet_flow_messages(&flow, self.path_end_2.latest_block, open_2);
            to_end_1.packet_messages.extend(response.src_messages);
            to_end_2.packet_messages.extend(response.dst_messages);
            if let Some(mc) = self
                .path_end_1
                .message_cache
                .packet_flow
                .get_mut(&pair.path_end_1_channel_key)
            {
                mc.delete_cached_messages(&response.to_delete_src);
            }
            if let Some(mc) = self
                .path_end_2
                .message_cache
                .packet_flow
                .get_mut(&pair.path_end_2_channel_key)
            {
                mc.delete_cached_messages(&response.to_delete_dst);
            }

            let flow = PacketFlowMessages::gather(
                &self.path_end_2,
                &self.path_end_1,
                &pair.path_end_2_channel_key,
                &pair.path_end_1_channel_key,
            );
            let response =
                unrelayed_packet_flow_messages(&flow, self.path_end_1.latest_block, open_1);
            to_end_2.packet_messages.extend(response.src_messages);
            to_end_1.packet_messages.extend(response.dst_messages);
            if let Some(mc) = self
                .path_end_2
                .message_cache
                .packet_flow
                .get_mut(&pair.path_end_2_channel_key)
            {
                mc.delete_cached_messages(&response.to_delete_src);
            }
            if let Some(mc) = self
                .path_end_1
                .message_cache
                .packet_flow
                .get_mut(&pair.path_end_1_channel_key)
            {
                mc.delete_cached_messages(&response.to_delete_dst);
            }
        }

        // Both destinations are processed every round, side 1 first; the
        // first error is surfaced after both have run.
        let result_1 = self.assemble_and_send(true, to_end_1);
        let result_2 = self.assemble_and_send(false, to_end_2);
        result_1?;
        result_2
    }

    /// Submit the configured initial lifecycle message once, on the first
    /// round after both sides are in sync.
    fn send_initial_message_if_necessary(
        &mut self,
        lifecycle: Option<&MessageLifecycle>,
    ) -> Result<(), Error> {
        if self.sent_initial_msg {
            return Ok(());
        }
        let Some(lifecycle) = lifecycle else {
            return Ok(());
        };

        match lifecycle {
            MessageLifecycle::Packet(lc) => {
                if let Some(initial) = &lc.initial {
                    let Some(provider) = self.provider_for_chain(&initial.chain_id)? else {
                        warn!(chain_id = %initial.chain_id, "initial message for unknown chain");
                        self.sent_initial_msg = true;
                        return Ok(());
                    };
                    let msg = provider
                        .packet_message(&initial.action, &initial.info, Proof::default())
                        .map_err(|e| {
                            Error::initial_message(initial.chain_id.clone(), initial.action.clone(), e)
                        })?;
                    provider.send_messages(vec![msg]).map_err(|e| {
                        Error::initial_message(initial.chain_id.clone(), initial.action.clone(), e)
                    })?;
                    info!(
                        chain_id = %initial.chain_id,
                        action = %short_action(&initial.action),
                        "sent initial message",
                    );
                }
            }
            MessageLifecycle::Connection(lc) => {
                if let Some(initial) = &lc.initial {
                    let Some(provider) = self.provider_for_chain(&initial.chain_id)? else {
                        warn!(chain_id = %initial.chain_id, "initial message for unknown chain");
                        self.sent_initial_msg = true;
                        return Ok(());
                    };
                    let msg = provider
                        .connection_message(&initial.action, &initial.info, Proof::default())
                        .map_err(|e| {
                            Error::initial_message(initial.chain_id.clone(), initial.action.clone(), e)
                        })?;
                    provider.send_messages(vec![msg]).map_err(|e| {
                        Error::initial_message(initial.chain_id.clone(), initial.action.clone(), e)
                    })?;
                    info!(
                        chain_id = %initial.chain_id,
                        action = %short_action(&initial.action),
                        "sent initial message",
                    );
                }
            }
            MessageLifecycle::Channel(lc) => {
                if let Some(initial) = &lc.initial {
                    let Some(provider) = self.provider_for_chain(&initial.chain_id)? else {
                        warn!(chain_id = %initial.chain_id, "initial message for unknown chain");
                        self.sent_initial_msg = true;
                        return Ok(());
                    };
                    let msg = provider
                        .channel_message(&initial.action, &initial.info, Proof::default())
                        .map_err(|e| {
                            Error::initial_message(initial.chain_id.clone(), initial.action.clone(), e)
                        })?;
                    provider.send_messages(vec![msg]).map_err(|e| {
                        Error::initial_message(initial.chain_id.clone(), initial.action.clone(), e)
                    })?;
                    info!(
                        chain_id = %initial.chain_id,
                        action = %short_action(&initial.action),
                        "sent initial message",
                    );
                }
            }
        }

        self.sent_initial_msg = true;
        Ok(())
    }

    /// Provider for the side matching `chain_id`; `Ok(None)` when neither
    /// side matches.
    fn provider_for_chain(
        &self,
        chain_id: &ChainId,
    ) -> Result<Option<Arc<dyn ChainProvider>>, Error> {
        let runtime = if self.path_end_1.info.chain_id == *chain_id {
            &self.path_end_1
        } else if self.path_end_2.info.chain_id == *chain_id {
            &self.path_end_2
        } else {
            return Ok(None);
        };
        match runtime.chain_provider.clone() {
            Some(provider) => Ok(Some(provider)),
            None => Err(Error::no_chain_provider(chain_id.clone())),
        }
    }

    fn assemble_and_send(
        &mut self,
        destination_is_end_1: bool,
        messages: PathEndMessages,
    ) -> Result<(), Error> {
        if messages.is_empty() {
            return Ok(());
        }
        let (dst, src) = if destination_is_end_1 {
            (&mut self.path_end_1, &mut self.path_end_2)
        } else {
            (&mut self.path_end_2, &mut self.path_end_1)
        };
        assemble_and_send_messages(dst, src, messages)
    }
}

/// Assemble the round's messages for one destination, prepending a client
/// update when the destination's view of the source does not cover the
/// proof height, and broadcast them as a single transaction.
fn assemble_and_send_messages(
    dst: &mut PathEndRuntime,
    src: &mut PathEndRuntime,
    messages: PathEndMessages,
) -> Result<(), Error> {
    // Retry gating first, so abandoned messages drop out before any proof
    // queries happen.
    let packet_messages: Vec<PacketIbcMessage> = messages
        .packet_messages
        .into_iter()
        .filter(|m| dst.should_send_packet_message(m, src))
        .collect();
    let connection_messages: Vec<ConnectionIbcMessage> = messages
        .connection_messages
        .into_iter()
        .filter(|m| dst.should_send_connection_message(m, src))
        .collect();
    let channel_messages: Vec<ChannelIbcMessage> = messages
        .channel_messages
        .into_iter()
        .filter(|m| dst.should_send_channel_message(m, src))
        .collect();

    if packet_messages.is_empty() && connection_messages.is_empty() && channel_messages.is_empty() {
        return Ok(());
    }

    let dst_provider = dst
        .chain_provider
        .clone()
        .ok_or_else(|| Error::no_chain_provider(dst.info.chain_id.clone()))?;
    let src_provider = src
        .chain_provider
        .clone()
        .ok_or_else(|| Error::no_chain_provider(src.info.chain_id.clone()))?;

    let proof_height = src.latest_block.height;
    let mut batch: Vec<AnyMsg> = Vec::new();

    // The destination's client of the source must cover the proof height
    // before any proof-bearing message verifies.
    let trusted_height = dst
        .client_state
        .as_ref()
        .map(|cs| cs.consensus_height)
        .unwrap_or(0);
    if trusted_height < proof_height {
        let Some(header) = src.ibc_header_cache.get(&proof_height).cloned() else {
            for message in &packet_messages {
                dst.track_processing_packet_message(message, false, false);
            }
            for message in &connection_messages {
                dst.track_processing_connection_message(message, false, false);
            }
            for message in &channel_messages {
                dst.track_processing_channel_message(message, false, false);
            }
            return Err(Error::missing_header(src.info.chain_id.clone(), proof_height));
        };
        let update = dst_provider
            .update_client_message(&dst.info.client_id, trusted_height, header.as_ref())
            .map_err(|e| Error::update_client(dst.info.chain_id.clone(), e))?;
        batch.push(update);
    }

    let mut outgoing: Vec<OutgoingMessage> = Vec::new();

    for message in packet_messages {
        let assembled = src_provider
            .packet_proof(&message.action, &message.info, proof_height)
            .and_then(|proof| dst_provider.packet_message(&message.action, &message.info, proof));
        match assembled {
            Ok(msg) => {
                dst.track_processing_packet_message(&message, true, false);
                batch.push(msg);
                outgoing.push(OutgoingMessage::Packet(message));
            }
            Err(e) => {
                debug!(
                    action = %short_action(&message.action),
                    sequence = message.info.sequence,
                    "deferring packet message: {}", e,
                );
                dst.track_processing_packet_message(&message, false, false);
            }
        }
    }

    for message in connection_messages {
        let assembled = src_provider
            .connection_proof(&message.action, &message.info, proof_height)
            .and_then(|proof| {
                dst_provider.connection_message(&message.action, &message.info, proof)
            });
        match assembled {
            Ok(msg) => {
                dst.track_processing_connection_message(&message, true, false);
                batch.push(msg);
                outgoing.push(OutgoingMessage::Connection(message));
            }
            Err(e) => {
                debug!(
                    action = %short_action(&message.action),
                    connection = %message.connection_key,
                    "deferring connection handshake message: {}", e,
                );
                dst.track_processing_connection_message(&message, false, false);
            }
        }
    }

    for message in channel_messages {
        let assembled = src_provider
            .channel_proof(&message.action, &message.info, proof_height)
            .and_then(|proof| dst_provider.channel_message(&message.action, &message.info, proof));
        match assembled {
            Ok(msg) => {
                dst.track_processing_channel_message(&message, true, false);
                batch.push(msg);
                outgoing.push(OutgoingMessage::Channel(message));
            }
            Err(e) => {
                debug!(
                    action = %short_action(&message.action),
                    channel = %message.channel_key,
                    "deferring channel handshake message: {}", e,
                );
                dst.track_processing_channel_message(&message, false, false);
            }
        }
    }

    if outgoing.is_empty() {
        // Everything deferred; a bare client update is not worth a tx.
        return Ok(());
    }

    let count = batch.len();
    if let Err(e) = dst_provider.send_messages(batch) {
        for message in &outgoing {
            match message {
                OutgoingMessage::Packet(m) => dst.track_processing_packet_message(m, true, true),
                OutgoingMessage::Connection(m) => {
                    dst.track_processing_connection_message(m, true, true)
                }
                OutgoingMessage::Channel(m) => dst.track_processing_channel_message(m, true, true),
            }
        }
        return Err(Error::send(dst.info.chain_id.clone(), count, e));
    }

    debug!(chain_id = %dst.info.chain_id, count, "submitted messages");

    for message in &outgoing {
        match message {
            OutgoingMessage::Packet(m) => dst.notify_packet_subscribers(&m.action, &m.info),
            OutgoingMessage::Connection(m) => dst.notify_connection_subscribers(&m.action, &m.info),
            OutgoingMessage::Channel(m) => dst.notify_channel_subscribers(&m.action, &m.info),
        }
    }

    Ok(())
}
