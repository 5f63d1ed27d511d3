//! In-memory caches of observed IBC messages and object state.
//!
//! Each path end runtime owns one set of these caches; chain processors
//! ship incremental copies of the same shapes, which are merged in with
//! last-write-wins semantics at the leaves. External readers must work on
//! clones, never on the live maps.

use core::fmt::{Display, Error as FmtError, Formatter};
use core::ops::{Deref, DerefMut};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::ident::{ChannelId, ClientId, ConnectionId, PortId};
use crate::msgs::{
    MSG_ACKNOWLEDGEMENT, MSG_RECV_PACKET, MSG_TIMEOUT, MSG_TIMEOUT_ON_CLOSE, MSG_TRANSFER,
};
use crate::processor::PathProcessors;
use crate::provider::{AnyIbcHeader, ChannelInfo, ConnectionInfo, PacketInfo};

/// The key identifying a channel between chain processors and path
/// processors, from the perspective of the chain the messages were
/// observed on.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    pub channel_id: ChannelId,
    pub port_id: PortId,
    pub counterparty_channel_id: ChannelId,
    pub counterparty_port_id: PortId,
}

impl ChannelKey {
    /// Flips the key to the perspective of the counterparty chain.
    pub fn counterparty(&self) -> ChannelKey {
        ChannelKey {
            channel_id: self.counterparty_channel_id.clone(),
            port_id: self.counterparty_port_id.clone(),
            counterparty_channel_id: self.channel_id.clone(),
            counterparty_port_id: self.port_id.clone(),
        }
    }

    /// Form used when comparing against channel open init messages, which
    /// do not have a counterparty channel ID yet.
    pub(crate) fn msg_init_key(&self) -> ChannelKey {
        ChannelKey {
            channel_id: self.channel_id.clone(),
            port_id: self.port_id.clone(),
            counterparty_channel_id: ChannelId::default(),
            counterparty_port_id: self.counterparty_port_id.clone(),
        }
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}/{} -> {}/{}",
            self.port_id, self.channel_id, self.counterparty_port_id, self.counterparty_channel_id
        )
    }
}

/// The key identifying a connection between chain processors and path
/// processors, from the perspective of the chain the messages were
/// observed on.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionKey {
    pub client_id: ClientId,
    pub connection_id: ConnectionId,
    pub counterparty_client_id: ClientId,
    pub counterparty_connection_id: ConnectionId,
}

impl ConnectionKey {
    /// Flips the key to the perspective of the counterparty chain.
    pub fn counterparty(&self) -> ConnectionKey {
        ConnectionKey {
            client_id: self.counterparty_client_id.clone(),
            connection_id: self.counterparty_connection_id.clone(),
            counterparty_client_id: self.client_id.clone(),
            counterparty_connection_id: self.connection_id.clone(),
        }
    }

    /// Form used when comparing against connection open init messages,
    /// which do not have a counterparty connection ID yet.
    pub(crate) fn msg_init_key(&self) -> ConnectionKey {
        ConnectionKey {
            client_id: self.client_id.clone(),
            connection_id: self.connection_id.clone(),
            counterparty_client_id: self.counterparty_client_id.clone(),
            counterparty_connection_id: ConnectionId::default(),
        }
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}/{} -> {}/{}",
            self.client_id, self.connection_id, self.counterparty_client_id,
            self.counterparty_connection_id
        )
    }
}

macro_rules! map_newtype {
    ($name:ident, $key:ty, $value:ty) => {
        impl Deref for $name {
            type Target = BTreeMap<$key, $value>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }

        impl FromIterator<($key, $value)> for $name {
            fn from_iter<I: IntoIterator<Item = ($key, $value)>>(iter: I) -> Self {
                Self(iter.into_iter().collect())
            }
        }
    };
}

/// All message caches a chain processor ships in one update.
#[derive(Clone, Debug, Default)]
pub struct IbcMessagesCache {
    pub packet_flow: ChannelPacketMessagesCache,
    pub connection_handshake: ConnectionMessagesCache,
    pub channel_handshake: ChannelMessagesCache,
}

impl IbcMessagesCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges another message cache into this one.
    pub fn merge(&mut self, other: IbcMessagesCache) {
        self.packet_flow.merge(other.packet_flow);
        self.connection_handshake.merge(other.connection_handshake);
        self.channel_handshake.merge(other.channel_handshake);
    }
}

/// Caches a [`PacketMessagesCache`] for a given IBC channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelPacketMessagesCache(pub BTreeMap<ChannelKey, PacketMessagesCache>);
map_newtype!(ChannelPacketMessagesCache, ChannelKey, PacketMessagesCache);

impl ChannelPacketMessagesCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (channel_key, message_cache) in other.0 {
            match self.0.entry(channel_key) {
                Entry::Vacant(e) => {
                    e.insert(message_cache);
                }
                Entry::Occupied(mut e) => e.get_mut().merge(message_cache),
            }
        }
    }

    /// Returns true if the packet is applicable to the channels for path
    /// processors that are subscribed to this chain processor, and the
    /// sequence is not already cached.
    pub fn should_retain_sequence(
        &self,
        path_processors: &PathProcessors,
        k: &ChannelKey,
        chain_id: &crate::ident::ChainId,
        action: &str,
        sequence: u64,
    ) -> bool {
        if !path_processors.is_relayed_channel(k, chain_id) {
            return false;
        }
        // There can be multiple MsgRecvPacket, MsgAcknowledgement, MsgTimeout,
        // and MsgTimeoutOnClose for the same packet from different relayers.
        match self.0.get(k).and_then(|mc| mc.get(action)) {
            Some(sequence_cache) => !sequence_cache.contains_key(&sequence),
            None => true,
        }
    }

    /// Creates the cache path if it doesn't exist, then caches the message.
    pub fn retain(&mut self, k: &ChannelKey, action: &str, message: PacketInfo) {
        self.0
            .entry(k.clone())
            .or_default()
            .0
            .entry(action.to_string())
            .or_default()
            .0
            .insert(message.sequence, message);
    }
}

/// Caches a [`PacketSequenceCache`] for a given IBC message type.
#[derive(Clone, Debug, Default)]
pub struct PacketMessagesCache(pub BTreeMap<String, PacketSequenceCache>);
map_newtype!(PacketMessagesCache, String, PacketSequenceCache);

impl PacketMessagesCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (action, sequence_cache) in other.0 {
            match self.0.entry(action) {
                Entry::Vacant(e) => {
                    e.insert(sequence_cache);
                }
                Entry::Occupied(mut e) => e.get_mut().merge(sequence_cache),
            }
        }
    }

    /// Deletes the given sequences per message type.
    pub fn delete_cached_messages(&mut self, to_delete: &BTreeMap<String, Vec<u64>>) {
        for (action, sequences) in to_delete {
            if let Some(sequence_cache) = self.0.get_mut(action) {
                for sequence in sequences {
                    sequence_cache.remove(sequence);
                }
            }
        }
    }
}

/// Caches an observed packet message for a given packet sequence.
#[derive(Clone, Debug, Default)]
pub struct PacketSequenceCache(pub BTreeMap<u64, PacketInfo>);
map_newtype!(PacketSequenceCache, u64, PacketInfo);

impl PacketSequenceCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (sequence, info) in other.0 {
            self.0.insert(sequence, info);
        }
    }
}

/// Caches a [`ChannelMessageCache`] for a given IBC message type.
#[derive(Clone, Debug, Default)]
pub struct ChannelMessagesCache(pub BTreeMap<String, ChannelMessageCache>);
map_newtype!(ChannelMessagesCache, String, ChannelMessageCache);

impl ChannelMessagesCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (action, message_cache) in other.0 {
            match self.0.entry(action) {
                Entry::Vacant(e) => {
                    e.insert(message_cache);
                }
                Entry::Occupied(mut e) => e.get_mut().merge(message_cache),
            }
        }
    }

    /// Creates the cache path if it doesn't exist, then caches the message.
    pub fn retain(&mut self, action: &str, message: ChannelInfo) {
        self.0
            .entry(action.to_string())
            .or_default()
            .0
            .insert(channel_info_channel_key(&message), message);
    }

    /// Deletes the given channel keys per message type.
    pub fn delete_cached_messages(&mut self, to_delete: &BTreeMap<String, Vec<ChannelKey>>) {
        for (action, keys) in to_delete {
            if let Some(message_cache) = self.0.get_mut(action) {
                for key in keys {
                    message_cache.remove(key);
                }
            }
        }
    }
}

/// Caches channel handshake messages for a given IBC channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelMessageCache(pub BTreeMap<ChannelKey, ChannelInfo>);
map_newtype!(ChannelMessageCache, ChannelKey, ChannelInfo);

impl ChannelMessageCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (key, info) in other.0 {
            self.0.insert(key, info);
        }
    }
}

/// Caches a [`ConnectionMessageCache`] for a given IBC message type.
#[derive(Clone, Debug, Default)]
pub struct ConnectionMessagesCache(pub BTreeMap<String, ConnectionMessageCache>);
map_newtype!(ConnectionMessagesCache, String, ConnectionMessageCache);

impl ConnectionMessagesCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (action, message_cache) in other.0 {
            match self.0.entry(action) {
                Entry::Vacant(e) => {
                    e.insert(message_cache);
                }
                Entry::Occupied(mut e) => e.get_mut().merge(message_cache),
            }
        }
    }

    /// Creates the cache path if it doesn't exist, then caches the message.
    pub fn retain(&mut self, action: &str, message: ConnectionInfo) {
        self.0
            .entry(action.to_string())
            .or_default()
            .0
            .insert(connection_info_connection_key(&message), message);
    }

    /// Deletes the given connection keys per message type.
    pub fn delete_cached_messages(&mut self, to_delete: &BTreeMap<String, Vec<ConnectionKey>>) {
        for (action, keys) in to_delete {
            if let Some(message_cache) = self.0.get_mut(action) {
                for key in keys {
                    message_cache.remove(key);
                }
            }
        }
    }
}

/// Caches connection handshake messages for a given IBC connection.
#[derive(Clone, Debug, Default)]
pub struct ConnectionMessageCache(pub BTreeMap<ConnectionKey, ConnectionInfo>);
map_newtype!(ConnectionMessageCache, ConnectionKey, ConnectionInfo);

impl ConnectionMessageCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (key, info) in other.0 {
            self.0.insert(key, info);
        }
    }
}

/// Maintains channel open state for multiple channels.
#[derive(Clone, Debug, Default)]
pub struct ChannelStateCache(pub BTreeMap<ChannelKey, bool>);
map_newtype!(ChannelStateCache, ChannelKey, bool);

impl ChannelStateCache {
    /// Merges another cache into this one, updating the open state.
    pub fn merge(&mut self, other: Self) {
        for (key, open) in other.0 {
            self.0.insert(key, open);
        }
    }

    /// The channels which route through a connection owned by `client_id`,
    /// resolved via the channel -> connection -> client mappings.
    pub fn filter_for_client(
        &self,
        client_id: &ClientId,
        channel_connections: &BTreeMap<ChannelId, ConnectionId>,
        connection_clients: &BTreeMap<ConnectionId, ClientId>,
    ) -> ChannelStateCache {
        let mut filtered = ChannelStateCache::default();
        for (key, open) in &self.0 {
            let Some(connection) = channel_connections.get(&key.channel_id) else {
                continue;
            };
            let Some(client) = connection_clients.get(connection) else {
                continue;
            };
            if client == client_id {
                filtered.0.insert(key.clone(), *open);
            }
        }
        filtered
    }
}

/// Maintains connection open state for multiple connections.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStateCache(pub BTreeMap<ConnectionKey, bool>);
map_newtype!(ConnectionStateCache, ConnectionKey, bool);

impl ConnectionStateCache {
    /// Merges another cache into this one, updating the open state.
    pub fn merge(&mut self, other: Self) {
        for (key, open) in other.0 {
            self.0.insert(key, open);
        }
    }

    /// All connections owned by `client_id`.
    pub fn filter_for_client(&self, client_id: &ClientId) -> ConnectionStateCache {
        let mut filtered = ConnectionStateCache::default();
        for (key, open) in &self.0 {
            if &key.client_id == client_id {
                filtered.0.insert(key.clone(), *open);
            }
        }
        filtered
    }
}

/// Holds a mapping of IBC headers by block height.
#[derive(Clone, Debug, Default)]
pub struct IbcHeaderCache(pub BTreeMap<u64, AnyIbcHeader>);
map_newtype!(IbcHeaderCache, u64, AnyIbcHeader);

impl IbcHeaderCache {
    /// Merges another cache into this one.
    pub fn merge(&mut self, other: Self) {
        for (height, header) in other.0 {
            self.0.insert(height, header);
        }
    }

    /// Deletes all entries except for the most recent `keep`. A cache at
    /// `keep + 1` entries is left untouched.
    pub fn prune(&mut self, keep: usize) {
        if self.0.len() > keep + 1 {
            let cutoff = self.0.len() - keep;
            let remove: Vec<u64> = self.0.keys().take(cutoff).copied().collect();
            for height in remove {
                self.0.remove(&height);
            }
        }
    }
}

/// The applicable [`ChannelKey`] for the chain a packet message was
/// observed on, based on the message action. Returns `None` for actions
/// that are not packet-flow messages.
pub fn packet_info_channel_key(action: &str, info: &PacketInfo) -> Option<ChannelKey> {
    let source_key = ChannelKey {
        channel_id: info.source_channel.clone(),
        port_id: info.source_port.clone(),
        counterparty_channel_id: info.dest_channel.clone(),
        counterparty_port_id: info.dest_port.clone(),
    };
    match action {
        MSG_RECV_PACKET => Some(source_key.counterparty()),
        MSG_TRANSFER | MSG_ACKNOWLEDGEMENT | MSG_TIMEOUT | MSG_TIMEOUT_ON_CLOSE => Some(source_key),
        _ => None,
    }
}

/// The applicable [`ChannelKey`] for a [`ChannelInfo`].
pub fn channel_info_channel_key(info: &ChannelInfo) -> ChannelKey {
    ChannelKey {
        channel_id: info.channel_id.clone(),
        port_id: info.port_id.clone(),
        counterparty_channel_id: info.counterparty_channel_id.clone(),
        counterparty_port_id: info.counterparty_port_id.clone(),
    }
}

/// The applicable [`ConnectionKey`] for a [`ConnectionInfo`].
pub fn connection_info_connection_key(info: &ConnectionInfo) -> ConnectionKey {
    ConnectionKey {
        client_id: info.client_id.clone(),
        connection_id: info.connection_id.clone(),
        counterparty_client_id: info.counterparty_client_id.clone(),
        counterparty_connection_id: info.counterparty_connection_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::any::Any;
    use std::sync::Arc;

    use crate::ident::ChainId;
    use crate::provider::IbcHeader;

    fn channel_key() -> ChannelKey {
        ChannelKey {
            channel_id: ChannelId::new("channel-0"),
            port_id: PortId::new("transfer"),
            counterparty_channel_id: ChannelId::new("channel-1"),
            counterparty_port_id: PortId::new("transfer"),
        }
    }

    fn packet(sequence: u64, height: u64) -> PacketInfo {
        PacketInfo {
            sequence,
            source_port: PortId::new("transfer"),
            source_channel: ChannelId::new("channel-0"),
            dest_port: PortId::new("transfer"),
            dest_channel: ChannelId::new("channel-1"),
            height,
            ..Default::default()
        }
    }

    #[test]
    fn channel_key_counterparty_involution() {
        let k = channel_key();
        assert_eq!(k.counterparty().counterparty(), k);

        let conn = ConnectionKey {
            client_id: ClientId::new("07-tendermint-0"),
            connection_id: ConnectionId::new("connection-0"),
            counterparty_client_id: ClientId::new("07-tendermint-5"),
            counterparty_connection_id: ConnectionId::new("connection-7"),
        };
        assert_eq!(conn.counterparty().counterparty(), conn);
    }

    #[test]
    fn msg_init_key_zeroes_only_the_counterparty_id() {
        let k = channel_key();
        let init = k.msg_init_key();
        assert!(init.counterparty_channel_id.is_empty());
        assert_eq!(init.channel_id, k.channel_id);
        assert_eq!(init.port_id, k.port_id);
        assert_eq!(init.counterparty_port_id, k.counterparty_port_id);

        // Both perspectives reduce to the same init key only when they
        // agree on channel, port, and counterparty port.
        let flipped = k.counterparty();
        assert_ne!(k.msg_init_key(), flipped.msg_init_key());
    }

    #[test]
    fn merge_is_last_write_wins_at_the_leaves() {
        let k = channel_key();

        let mut base = ChannelPacketMessagesCache::default();
        base.retain(&k, MSG_TRANSFER, packet(1, 100));
        base.retain(&k, MSG_TRANSFER, packet(2, 100));

        let mut update = ChannelPacketMessagesCache::default();
        update.retain(&k, MSG_TRANSFER, packet(2, 105));
        update.retain(&k, MSG_RECV_PACKET, packet(3, 106));

        base.merge(update);

        let messages = &base.0[&k];
        assert_eq!(messages.0[MSG_TRANSFER].0[&1].height, 100);
        assert_eq!(messages.0[MSG_TRANSFER].0[&2].height, 105);
        assert_eq!(messages.0[MSG_RECV_PACKET].0[&3].height, 106);
    }

    #[test]
    fn merge_of_empty_cache_is_a_noop() {
        let k = channel_key();
        let mut base = ChannelPacketMessagesCache::default();
        base.retain(&k, MSG_TRANSFER, packet(1, 100));
        let snapshot = base.clone();

        base.merge(ChannelPacketMessagesCache::default());

        assert_eq!(base.0.len(), snapshot.0.len());
        assert_eq!(base.0[&k].0[MSG_TRANSFER].0.len(), 1);
    }

    #[test]
    fn retain_is_idempotent() {
        let k = channel_key();
        let mut cache = ChannelPacketMessagesCache::default();
        cache.retain(&k, MSG_RECV_PACKET, packet(7, 100));
        cache.retain(&k, MSG_RECV_PACKET, packet(7, 100));

        assert_eq!(cache.0[&k].0[MSG_RECV_PACKET].0.len(), 1);
    }

    #[test]
    fn delete_cached_messages_removes_sequences() {
        let k = channel_key();
        let mut cache = ChannelPacketMessagesCache::default();
        cache.retain(&k, MSG_TRANSFER, packet(1, 100));
        cache.retain(&k, MSG_TRANSFER, packet(2, 100));
        cache.retain(&k, MSG_ACKNOWLEDGEMENT, packet(1, 101));

        let mut to_delete = BTreeMap::new();
        to_delete.insert(MSG_TRANSFER.to_string(), vec![1]);
        to_delete.insert(MSG_ACKNOWLEDGEMENT.to_string(), vec![1]);
        cache
            .0
            .get_mut(&k)
            .expect("channel entry")
            .delete_cached_messages(&to_delete);

        let messages = &cache.0[&k];
        assert!(!messages.0[MSG_TRANSFER].0.contains_key(&1));
        assert!(messages.0[MSG_TRANSFER].0.contains_key(&2));
        assert!(messages.0[MSG_ACKNOWLEDGEMENT].0.is_empty());
    }

    #[test]
    fn state_cache_clone_is_independent() {
        let k = channel_key();
        let mut cache = ChannelStateCache::default();
        cache.0.insert(k.clone(), true);

        let mut cloned = cache.clone();
        cloned.0.insert(k.counterparty(), false);
        cloned.0.insert(k.clone(), false);

        assert_eq!(cache.0.len(), 1);
        assert_eq!(cache.0[&k], true);
    }

    #[test]
    fn connection_state_filter_returns_all_matching_entries() {
        let client = ClientId::new("07-tendermint-0");
        let mut cache = ConnectionStateCache::default();
        for i in 0..3 {
            cache.0.insert(
                ConnectionKey {
                    client_id: client.clone(),
                    connection_id: ConnectionId::new(format!("connection-{i}")),
                    counterparty_client_id: ClientId::new("07-tendermint-9"),
                    counterparty_connection_id: ConnectionId::new(format!("connection-{i}")),
                },
                true,
            );
        }
        cache.0.insert(
            ConnectionKey {
                client_id: ClientId::new("07-tendermint-3"),
                connection_id: ConnectionId::new("connection-8"),
                counterparty_client_id: ClientId::new("07-tendermint-9"),
                counterparty_connection_id: ConnectionId::new("connection-8"),
            },
            true,
        );

        let filtered = cache.filter_for_client(&client);
        assert_eq!(filtered.0.len(), 3);
        assert!(filtered.0.keys().all(|k| k.client_id == client));
    }

    #[test]
    fn channel_state_filter_resolves_through_connection_and_client() {
        let client = ClientId::new("07-tendermint-0");
        let key = channel_key();
        let other = ChannelKey {
            channel_id: ChannelId::new("channel-7"),
            ..channel_key()
        };

        let mut cache = ChannelStateCache::default();
        cache.0.insert(key.clone(), true);
        cache.0.insert(other.clone(), true);

        let mut channel_connections = BTreeMap::new();
        channel_connections.insert(key.channel_id.clone(), ConnectionId::new("connection-0"));
        channel_connections.insert(other.channel_id.clone(), ConnectionId::new("connection-5"));
        let mut connection_clients = BTreeMap::new();
        connection_clients.insert(ConnectionId::new("connection-0"), client.clone());
        connection_clients.insert(
            ConnectionId::new("connection-5"),
            ClientId::new("07-tendermint-9"),
        );

        let filtered = cache.filter_for_client(&client, &channel_connections, &connection_clients);
        assert_eq!(filtered.0.len(), 1);
        assert!(filtered.0.contains_key(&key));
    }

    #[derive(Debug)]
    struct TestHeader(u64);

    impl IbcHeader for TestHeader {
        fn height(&self) -> u64 {
            self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn header_cache_prune_keeps_newest() {
        let mut cache = IbcHeaderCache::default();
        for height in 1..=20 {
            cache.0.insert(height, Arc::new(TestHeader(height)) as AnyIbcHeader);
        }

        cache.prune(10);

        assert_eq!(cache.0.len(), 10);
        assert_eq!(cache.0.keys().copied().collect::<Vec<_>>(), (11..=20).collect::<Vec<_>>());
    }

    #[test]
    fn header_cache_prune_leaves_keep_plus_one() {
        let mut cache = IbcHeaderCache::default();
        for height in 1..=11 {
            cache.0.insert(height, Arc::new(TestHeader(height)) as AnyIbcHeader);
        }

        cache.prune(10);
        assert_eq!(cache.0.len(), 11);

        cache.0.insert(12, Arc::new(TestHeader(12)) as AnyIbcHeader);
        cache.prune(10);
        assert_eq!(cache.0.len(), 10);
        assert_eq!(*cache.0.keys().next().expect("nonempty"), 3);
    }

    #[test]
    fn packet_info_channel_key_flips_for_recv() {
        let info = packet(4, 100);

        let transfer_key = packet_info_channel_key(MSG_TRANSFER, &info).expect("packet action");
        assert_eq!(transfer_key.channel_id, info.source_channel);

        let recv_key = packet_info_channel_key(MSG_RECV_PACKET, &info).expect("packet action");
        assert_eq!(recv_key, transfer_key.counterparty());

        assert!(packet_info_channel_key(crate::msgs::MSG_UPDATE_CLIENT, &info).is_none());
    }

    #[test]
    fn should_retain_sequence_respects_subscriptions_and_duplicates() {
        use crate::path::PathEnd;
        use crate::processor::PathProcessor;

        let chain_a = ChainId::new("chain-a");
        let chain_b = ChainId::new("chain-b");
        let pp = PathProcessor::new(
            PathEnd::new(
                chain_a.clone(),
                ClientId::new("07-tendermint-0"),
                ConnectionId::new("connection-0"),
            ),
            PathEnd::new(
                chain_b.clone(),
                ClientId::new("07-tendermint-1"),
                ConnectionId::new("connection-1"),
            ),
        );
        let processors = PathProcessors(vec![pp.handle()]);

        let k = channel_key();
        let mut cache = ChannelPacketMessagesCache::default();

        // No cached entry yet: retain.
        assert!(cache.should_retain_sequence(&processors, &k, &chain_a, MSG_RECV_PACKET, 7));

        cache.retain(&k, MSG_RECV_PACKET, packet(7, 100));

        // Already cached: skip.
        assert!(!cache.should_retain_sequence(&processors, &k, &chain_a, MSG_RECV_PACKET, 7));
        // Different sequence or action: retain.
        assert!(cache.should_retain_sequence(&processors, &k, &chain_a, MSG_RECV_PACKET, 8));
        assert!(cache.should_retain_sequence(&processors, &k, &chain_a, MSG_ACKNOWLEDGEMENT, 7));

        // Chain unknown to every path processor: drop.
        let other = ChainId::new("chain-x");
        assert!(!cache.should_retain_sequence(&processors, &k, &other, MSG_RECV_PACKET, 8));
    }
}
