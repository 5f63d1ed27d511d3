//! Per-chain mirror of observed state inside a path processor.
//!
//! A [`PathEndRuntime`] is owned and mutated exclusively by its path
//! processor's worker loop. The channel and connection state caches are
//! shared behind locks so that handle predicates can read them from other
//! threads; everything else is private to the loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{error, info};

use crate::cache::{
    channel_info_channel_key, connection_info_connection_key, packet_info_channel_key, ChannelKey,
    ChannelStateCache, ConnectionKey, ConnectionStateCache, IbcHeaderCache, IbcMessagesCache,
};
use crate::ident::ConnectionId;
use crate::lifecycle::MessageLifecycle;
use crate::msgs::{
    short_action, MSG_ACKNOWLEDGEMENT, MSG_CHANNEL_CLOSE_CONFIRM, MSG_CHANNEL_CLOSE_INIT,
    MSG_CHANNEL_OPEN_ACK, MSG_CHANNEL_OPEN_CONFIRM, MSG_CHANNEL_OPEN_INIT, MSG_CHANNEL_OPEN_TRY,
    MSG_CONNECTION_OPEN_ACK, MSG_CONNECTION_OPEN_CONFIRM, MSG_CONNECTION_OPEN_INIT,
    MSG_CONNECTION_OPEN_TRY, MSG_RECV_PACKET, MSG_TIMEOUT, MSG_TIMEOUT_ON_CLOSE, MSG_TRANSFER,
};
use crate::path::PathEnd;
use crate::processor::{
    BLOCKS_TO_RETRY_ASSEMBLY_AFTER, BLOCKS_TO_RETRY_SEND_AFTER, IBC_HEADERS_TO_CACHE,
    MAX_MESSAGE_SEND_RETRIES,
};
use crate::provider::{
    AnyIbcHeader, ChainProvider, ChannelInfo, ClientState, ConnectionInfo, LatestBlock, PacketInfo,
};
use crate::resolve::{ChannelIbcMessage, ConnectionIbcMessage, PacketIbcMessage};
use crate::util::cancel::CancellationToken;
use crate::util::shared::SharedCache;

/// The data sent from a chain processor to the path processors it feeds,
/// keeping them up to date with the latest observations from the chain.
#[derive(Clone, Debug, Default)]
pub struct ChainProcessorCacheData {
    pub ibc_messages_cache: IbcMessagesCache,
    pub in_sync: bool,
    pub client_state: Option<ClientState>,
    pub connection_state_cache: ConnectionStateCache,
    pub channel_state_cache: ChannelStateCache,
    pub latest_block: Option<LatestBlock>,
    pub latest_header: Option<AnyIbcHeader>,
    pub ibc_header_cache: IbcHeaderCache,
}

/// Retry bookkeeping for one in-flight message.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ProcessingMessage {
    pub(crate) retry_count: u64,
    pub(crate) last_processed_height: u64,
    pub(crate) assembled: bool,
}

type PacketProcessingCache = BTreeMap<ChannelKey, BTreeMap<String, BTreeMap<u64, ProcessingMessage>>>;
type ChannelProcessingCache = BTreeMap<String, BTreeMap<ChannelKey, ProcessingMessage>>;
type ConnectionProcessingCache = BTreeMap<String, BTreeMap<ConnectionKey, ProcessingMessage>>;

pub(crate) type PacketMessageSubscriber = Box<dyn Fn(&PacketInfo) + Send + Sync>;
pub(crate) type ChannelMessageSubscriber = Box<dyn Fn(&ChannelInfo) + Send + Sync>;
pub(crate) type ConnectionMessageSubscriber = Box<dyn Fn(&ConnectionInfo) + Send + Sync>;

pub(crate) struct PathEndRuntime {
    pub(crate) info: PathEnd,
    pub(crate) chain_provider: Option<Arc<dyn ChainProvider>>,

    pub(crate) incoming_tx: Sender<ChainProcessorCacheData>,
    pub(crate) incoming_rx: Receiver<ChainProcessorCacheData>,

    pub(crate) message_cache: IbcMessagesCache,
    pub(crate) connection_state_cache: SharedCache<ConnectionStateCache>,
    pub(crate) channel_state_cache: SharedCache<ChannelStateCache>,
    pub(crate) ibc_header_cache: IbcHeaderCache,

    pub(crate) client_state: Option<ClientState>,
    pub(crate) latest_block: LatestBlock,
    pub(crate) latest_header: Option<AnyIbcHeader>,
    pub(crate) in_sync: bool,

    packet_processing: PacketProcessingCache,
    connection_processing: ConnectionProcessingCache,
    channel_processing: ChannelProcessingCache,

    pub(crate) packet_subscribers: BTreeMap<String, Vec<PacketMessageSubscriber>>,
    pub(crate) channel_subscribers: BTreeMap<String, Vec<ChannelMessageSubscriber>>,
    pub(crate) connection_subscribers: BTreeMap<String, Vec<ConnectionMessageSubscriber>>,
}

impl PathEndRuntime {
    pub(crate) fn new(info: PathEnd) -> Self {
        let (incoming_tx, incoming_rx) = unbounded();
        Self {
            info,
            chain_provider: None,
            incoming_tx,
            incoming_rx,
            message_cache: IbcMessagesCache::new(),
            connection_state_cache: SharedCache::default(),
            channel_state_cache: SharedCache::default(),
            ibc_header_cache: IbcHeaderCache::default(),
            client_state: None,
            latest_block: LatestBlock::default(),
            latest_header: None,
            in_sync: false,
            packet_processing: PacketProcessingCache::default(),
            connection_processing: ConnectionProcessingCache::default(),
            channel_processing: ChannelProcessingCache::default(),
            packet_subscribers: BTreeMap::new(),
            channel_subscribers: BTreeMap::new(),
            connection_subscribers: BTreeMap::new(),
        }
    }

    /// Merge one chain processor update into this runtime, checking the
    /// incoming messages against the lifecycle termination condition.
    pub(crate) fn merge_cache_data(
        &mut self,
        cancel: &CancellationToken,
        data: ChainProcessorCacheData,
        lifecycle: Option<&MessageLifecycle>,
    ) {
        if data.in_sync && !self.in_sync {
            info!(chain_id = %self.info.chain_id, "chain processor in sync");
        }
        self.in_sync = data.in_sync;

        if let Some(client_state) = data.client_state {
            self.client_state = Some(client_state);
        }
        if let Some(latest_block) = data.latest_block {
            self.latest_block = latest_block;
        }
        if let Some(latest_header) = data.latest_header {
            self.latest_header = Some(latest_header);
        }

        self.check_for_termination(&data.ibc_messages_cache, lifecycle, cancel);

        self.message_cache.merge(data.ibc_messages_cache);
        self.connection_state_cache
            .write()
            .merge(data.connection_state_cache);
        self.channel_state_cache
            .write()
            .merge(data.channel_state_cache);
        self.ibc_header_cache.merge(data.ibc_header_cache);
        self.ibc_header_cache.prune(IBC_HEADERS_TO_CACHE);
    }

    fn check_for_termination(
        &self,
        messages: &IbcMessagesCache,
        lifecycle: Option<&MessageLifecycle>,
        cancel: &CancellationToken,
    ) {
        let Some(lifecycle) = lifecycle else { return };

        match lifecycle {
            MessageLifecycle::Packet(lc) => {
                let Some(termination) = &lc.termination else {
                    return;
                };
                if termination.chain_id != self.info.chain_id {
                    return;
                }
                let Some(key) = packet_info_channel_key(&termination.action, &termination.info)
                else {
                    return;
                };
                let observed = messages
                    .packet_flow
                    .get(&key)
                    .and_then(|mc| mc.get(termination.action.as_str()))
                    .map_or(false, |sc| sc.contains_key(&termination.info.sequence));
                if observed {
                    info!(
                        chain_id = %self.info.chain_id,
                        action = %short_action(&termination.action),
                        sequence = termination.info.sequence,
                        "found termination condition for packet flow",
                    );
                    cancel.cancel();
                }
            }
            MessageLifecycle::Connection(lc) => {
                let Some(termination) = &lc.termination else {
                    return;
                };
                if termination.chain_id != self.info.chain_id {
                    return;
                }
                let tk = connection_info_connection_key(&termination.info);
                let Some(cache) = messages.connection_handshake.get(termination.action.as_str())
                else {
                    return;
                };
                for key in cache.keys() {
                    let matches = (tk.client_id.is_empty() || key.client_id == tk.client_id)
                        && (tk.connection_id.is_empty() || key.connection_id == tk.connection_id)
                        && (tk.counterparty_client_id.is_empty()
                            || key.counterparty_client_id == tk.counterparty_client_id)
                        && (tk.counterparty_connection_id.is_empty()
                            || key.counterparty_connection_id == tk.counterparty_connection_id);
                    if matches {
                        info!(
                            chain_id = %self.info.chain_id,
                            action = %short_action(&termination.action),
                            connection = %key,
                            "found termination condition for connection handshake",
                        );
                        cancel.cancel();
                        break;
                    }
                }
            }
            MessageLifecycle::Channel(lc) => {
                let Some(termination) = &lc.termination else {
                    return;
                };
                if termination.chain_id != self.info.chain_id {
                    return;
                }
                let tk = channel_info_channel_key(&termination.info);
                let Some(cache) = messages.channel_handshake.get(termination.action.as_str())
                else {
                    return;
                };
                for key in cache.keys() {
                    let matches = (tk.channel_id.is_empty() || key.channel_id == tk.channel_id)
                        && (tk.port_id.is_empty() || key.port_id == tk.port_id)
                        && (tk.counterparty_channel_id.is_empty()
                            || key.counterparty_channel_id == tk.counterparty_channel_id)
                        && (tk.counterparty_port_id.is_empty()
                            || key.counterparty_port_id == tk.counterparty_port_id);
                    if matches {
                        info!(
                            chain_id = %self.info.chain_id,
                            action = %short_action(&termination.action),
                            channel = %key,
                            "found termination condition for channel handshake",
                        );
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }

    /// Whether a connection with this ID is tracked on this path end and
    /// belongs to the path's client.
    pub(crate) fn is_relevant_connection(&self, connection_id: &ConnectionId) -> bool {
        self.connection_state_cache
            .read()
            .keys()
            .any(|k| &k.connection_id == connection_id && k.client_id == self.info.client_id)
    }

    /// Whether a packet message destined for this path end should be sent
    /// this round, based on its retry bookkeeping. After too many retries
    /// the message is abandoned and the flow is dropped from both sides'
    /// caches.
    pub(crate) fn should_send_packet_message(
        &mut self,
        message: &PacketIbcMessage,
        counterparty: &mut PathEndRuntime,
    ) -> bool {
        let action = message.action.as_str();
        let sequence = message.info.sequence;

        let Some(in_progress) = self
            .packet_processing
            .get(&message.channel_key)
            .and_then(|c| c.get(action))
            .and_then(|c| c.get(&sequence))
            .copied()
        else {
            return true;
        };

        let blocks_since = self
            .latest_block
            .height
            .saturating_sub(in_progress.last_processed_height);
        if in_progress.assembled {
            if blocks_since < BLOCKS_TO_RETRY_SEND_AFTER {
                return false;
            }
        } else if blocks_since < BLOCKS_TO_RETRY_ASSEMBLY_AFTER {
            return false;
        }

        if in_progress.retry_count >= MAX_MESSAGE_SEND_RETRIES {
            error!(
                chain_id = %self.info.chain_id,
                action = %short_action(action),
                sequence,
                retries = in_progress.retry_count,
                "giving up on packet message after max retries",
            );

            let counterparty_key = message.channel_key.counterparty();
            let mut to_delete: BTreeMap<String, Vec<u64>> = BTreeMap::new();
            let mut to_delete_counterparty: BTreeMap<String, Vec<u64>> = BTreeMap::new();
            match action {
                MSG_RECV_PACKET => {
                    to_delete_counterparty.insert(MSG_TRANSFER.to_string(), vec![sequence]);
                }
                MSG_ACKNOWLEDGEMENT => {
                    to_delete.insert(MSG_TRANSFER.to_string(), vec![sequence]);
                    to_delete_counterparty.insert(MSG_RECV_PACKET.to_string(), vec![sequence]);
                }
                MSG_TIMEOUT | MSG_TIMEOUT_ON_CLOSE => {
                    to_delete.insert(MSG_TRANSFER.to_string(), vec![sequence]);
                }
                _ => {}
            }
            if let Some(mc) = self.message_cache.packet_flow.get_mut(&message.channel_key) {
                mc.delete_cached_messages(&to_delete);
            }
            if let Some(mc) = counterparty
                .message_cache
                .packet_flow
                .get_mut(&counterparty_key)
            {
                mc.delete_cached_messages(&to_delete_counterparty);
            }
            self.clear_packet_tracking(&message.channel_key, action, sequence);

            return false;
        }

        true
    }

    pub(crate) fn track_processing_packet_message(
        &mut self,
        message: &PacketIbcMessage,
        assembled: bool,
        count_retry: bool,
    ) {
        let entry = self
            .packet_processing
            .entry(message.channel_key.clone())
            .or_default()
            .entry(message.action.clone())
            .or_default()
            .entry(message.info.sequence)
            .or_default();
        if count_retry {
            entry.retry_count += 1;
        }
        entry.last_processed_height = self.latest_block.height;
        entry.assembled = assembled;
    }

    fn clear_packet_tracking(&mut self, channel_key: &ChannelKey, action: &str, sequence: u64) {
        if let Some(actions) = self.packet_processing.get_mut(channel_key) {
            if let Some(sequences) = actions.get_mut(action) {
                sequences.remove(&sequence);
            }
        }
    }

    /// Connection-handshake analogue of
    /// [`should_send_packet_message`](Self::should_send_packet_message).
    pub(crate) fn should_send_connection_message(
        &mut self,
        message: &ConnectionIbcMessage,
        counterparty: &mut PathEndRuntime,
    ) -> bool {
        let action = message.action.as_str();

        let Some(in_progress) = self
            .connection_processing
            .get(action)
            .and_then(|c| c.get(&message.connection_key))
            .copied()
        else {
            return true;
        };

        let blocks_since = self
            .latest_block
            .height
            .saturating_sub(in_progress.last_processed_height);
        if in_progress.assembled {
            if blocks_since < BLOCKS_TO_RETRY_SEND_AFTER {
                return false;
            }
        } else if blocks_since < BLOCKS_TO_RETRY_ASSEMBLY_AFTER {
            return false;
        }

        if in_progress.retry_count >= MAX_MESSAGE_SEND_RETRIES {
            error!(
                chain_id = %self.info.chain_id,
                action = %short_action(action),
                connection = %message.connection_key,
                retries = in_progress.retry_count,
                "giving up on connection handshake message after max retries",
            );

            let counterparty_key = message.connection_key.counterparty();
            let mut to_delete_counterparty: BTreeMap<String, Vec<ConnectionKey>> = BTreeMap::new();
            match action {
                MSG_CONNECTION_OPEN_TRY => {
                    to_delete_counterparty.insert(
                        MSG_CONNECTION_OPEN_INIT.to_string(),
                        vec![counterparty_key.msg_init_key()],
                    );
                }
                MSG_CONNECTION_OPEN_ACK => {
                    to_delete_counterparty
                        .insert(MSG_CONNECTION_OPEN_TRY.to_string(), vec![counterparty_key]);
                }
                MSG_CONNECTION_OPEN_CONFIRM => {
                    to_delete_counterparty
                        .insert(MSG_CONNECTION_OPEN_ACK.to_string(), vec![counterparty_key]);
                }
                _ => {}
            }
            counterparty
                .message_cache
                .connection_handshake
                .delete_cached_messages(&to_delete_counterparty);
            if let Some(keys) = self.connection_processing.get_mut(action) {
                keys.remove(&message.connection_key);
            }

            return false;
        }

        true
    }

    pub(crate) fn track_processing_connection_message(
        &mut self,
        message: &ConnectionIbcMessage,
        assembled: bool,
        count_retry: bool,
    ) {
        let entry = self
            .connection_processing
            .entry(message.action.clone())
            .or_default()
            .entry(message.connection_key.clone())
            .or_default();
        if count_retry {
            entry.retry_count += 1;
        }
        entry.last_processed_height = self.latest_block.height;
        entry.assembled = assembled;
    }

    /// Channel-handshake analogue of
    /// [`should_send_packet_message`](Self::should_send_packet_message).
    pub(crate) fn should_send_channel_message(
        &mut self,
        message: &ChannelIbcMessage,
        counterparty: &mut PathEndRuntime,
    ) -> bool {
        let action = message.action.as_str();

        let Some(in_progress) = self
            .channel_processing
            .get(action)
            .and_then(|c| c.get(&message.channel_key))
            .copied()
        else {
            return true;
        };

        let blocks_since = self
            .latest_block
            .height
            .saturating_sub(in_progress.last_processed_height);
        if in_progress.assembled {
            if blocks_since < BLOCKS_TO_RETRY_SEND_AFTER {
                return false;
            }
        } else if blocks_since < BLOCKS_TO_RETRY_ASSEMBLY_AFTER {
            return false;
        }

        if in_progress.retry_count >= MAX_MESSAGE_SEND_RETRIES {
            error!(
                chain_id = %self.info.chain_id,
                action = %short_action(action),
                channel = %message.channel_key,
                retries = in_progress.retry_count,
                "giving up on channel handshake message after max retries",
            );

            let counterparty_key = message.channel_key.counterparty();
            let mut to_delete_counterparty: BTreeMap<String, Vec<ChannelKey>> = BTreeMap::new();
            match action {
                MSG_CHANNEL_OPEN_TRY => {
                    to_delete_counterparty.insert(
                        MSG_CHANNEL_OPEN_INIT.to_string(),
                        vec![counterparty_key.msg_init_key()],
                    );
                }
                MSG_CHANNEL_OPEN_ACK => {
                    to_delete_counterparty
                        .insert(MSG_CHANNEL_OPEN_TRY.to_string(), vec![counterparty_key]);
                }
                MSG_CHANNEL_OPEN_CONFIRM => {
                    to_delete_counterparty
                        .insert(MSG_CHANNEL_OPEN_ACK.to_string(), vec![counterparty_key]);
                }
                MSG_CHANNEL_CLOSE_CONFIRM => {
                    to_delete_counterparty
                        .insert(MSG_CHANNEL_CLOSE_INIT.to_string(), vec![counterparty_key]);
                }
                _ => {}
            }
            counterparty
                .message_cache
                .channel_handshake
                .delete_cached_messages(&to_delete_counterparty);
            if let Some(keys) = self.channel_processing.get_mut(action) {
                keys.remove(&message.channel_key);
            }

            return false;
        }

        true
    }

    pub(crate) fn track_processing_channel_message(
        &mut self,
        message: &ChannelIbcMessage,
        assembled: bool,
        count_retry: bool,
    ) {
        let entry = self
            .channel_processing
            .entry(message.action.clone())
            .or_default()
            .entry(message.channel_key.clone())
            .or_default();
        if count_retry {
            entry.retry_count += 1;
        }
        entry.last_processed_height = self.latest_block.height;
        entry.assembled = assembled;
    }

    pub(crate) fn notify_packet_subscribers(&self, action: &str, info: &PacketInfo) {
        if let Some(subscribers) = self.packet_subscribers.get(action) {
            for subscriber in subscribers {
                subscriber(info);
            }
        }
    }

    pub(crate) fn notify_channel_subscribers(&self, action: &str, info: &ChannelInfo) {
        if let Some(subscribers) = self.channel_subscribers.get(action) {
            for subscriber in subscribers {
                subscriber(info);
            }
        }
    }

    pub(crate) fn notify_connection_subscribers(&self, action: &str, info: &ConnectionInfo) {
        if let Some(subscribers) = self.connection_subscribers.get(action) {
            for subscriber in subscribers {
                subscriber(info);
            }
        }
    }
}
