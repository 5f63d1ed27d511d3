//! Description of one endpoint of a relayed path.

use serde::{Deserialize, Serialize};

use crate::cache::ChannelKey;
use crate::filter::ChannelPolicy;
use crate::ident::{ChainId, ClientId, ConnectionId};

/// The objects on one chain a path processor is responsible for: the
/// chain itself, the client and connection used for the path, and the
/// channel filter applied to packet traffic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathEnd {
    pub chain_id: ChainId,
    pub client_id: ClientId,
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub filter: ChannelPolicy,
}

impl PathEnd {
    /// A path end relaying all channels.
    pub fn new(chain_id: ChainId, client_id: ClientId, connection_id: ConnectionId) -> Self {
        Self {
            chain_id,
            client_id,
            connection_id,
            filter: ChannelPolicy::AllowAll,
        }
    }

    pub fn with_filter(mut self, filter: ChannelPolicy) -> Self {
        self.filter = filter;
        self
    }

    /// Whether packets on this channel should be relayed for this path.
    pub fn should_relay_channel(&self, key: &ChannelKey) -> bool {
        self.filter.is_allowed(&key.port_id, &key.channel_id)
    }
}
