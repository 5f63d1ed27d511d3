//! The interface between a path processor and the chains it submits to.
//!
//! A [`ChainProvider`] knows how to query proofs on its chain, build the
//! signable form of an IBC message, and broadcast a batch of messages. The
//! observation types in this module are the parsed facts a chain processor
//! extracts from on-chain events and ships to the path processor.

use core::any::Any;
use core::fmt::Debug;
use std::sync::Arc;

use flex_error::define_error;
use serde::{Deserialize, Serialize};

use crate::ident::{ChainId, ChannelId, ClientId, ConnectionId, PortId};

define_error! {
    #[derive(Debug, Clone)]
    ProviderError {
        Rpc
            { reason: String }
            |e| { format!("rpc failure: {}", e.reason) },

        ProofQuery
            { action: String, height: u64, reason: String }
            |e| {
                format!(
                    "failed to query proof for {} at height {}: {}",
                    e.action, e.height, e.reason
                )
            },

        MessageBuild
            { action: String, reason: String }
            |e| { format!("failed to build {}: {}", e.action, e.reason) },

        Broadcast
            { reason: String }
            |e| { format!("failed to broadcast transaction: {}", e.reason) },
    }
}

/// Height and time of the most recently observed block on a chain.
/// Time is UNIX nanoseconds, the unit packet timeout timestamps use.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LatestBlock {
    pub height: u64,
    pub time: u64,
}

/// Last observed state of the counterparty light client hosted on a chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientState {
    pub client_id: ClientId,
    /// Highest counterparty height the client has a consensus state for.
    pub consensus_height: u64,
}

/// Header of a chain, opaque to the path processor except for its height.
///
/// Providers recover their concrete header type through
/// [`as_any`](IbcHeader::as_any) when assembling client updates.
pub trait IbcHeader: Debug + Send + Sync {
    fn height(&self) -> u64;

    fn as_any(&self) -> &dyn Any;
}

pub type AnyIbcHeader = Arc<dyn IbcHeader>;

/// Ordering constraint of a channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Order {
    #[default]
    Unordered,
    Ordered,
}

/// A packet-flow event parsed from a chain, in the terms the emitting
/// message used: source is the chain the packet was sent from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub sequence: u64,
    pub source_port: PortId,
    pub source_channel: ChannelId,
    pub dest_port: PortId,
    pub dest_channel: ChannelId,
    pub data: Vec<u8>,
    /// Zero if the packet has no height timeout.
    pub timeout_height: u64,
    /// UNIX nanoseconds; zero if the packet has no timestamp timeout.
    pub timeout_timestamp: u64,
    /// Acknowledgement bytes, filled for receive observations.
    pub ack: Vec<u8>,
    /// Height at which the event was observed.
    pub height: u64,
}

/// A channel-handshake event parsed from a chain, keyed from the
/// perspective of the chain it was observed on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub counterparty_port_id: PortId,
    pub counterparty_channel_id: ChannelId,
    pub connection_id: ConnectionId,
    pub order: Order,
    pub version: String,
    pub height: u64,
}

/// A connection-handshake event parsed from a chain, keyed from the
/// perspective of the chain it was observed on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_id: ClientId,
    pub connection_id: ConnectionId,
    pub counterparty_client_id: ClientId,
    pub counterparty_connection_id: ConnectionId,
    pub height: u64,
}

/// Merkle proof of membership or non-membership, queried at a height.
///
/// An empty default proof is used for handshake init steps and initial
/// lifecycle messages, which carry no proof.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Proof {
    pub bytes: Vec<u8>,
    pub height: u64,
}

/// A signable IBC message in protobuf `Any` form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnyMsg {
    pub type_url: String,
    pub value: Vec<u8>,
}

/// Signs, broadcasts, and queries one chain on behalf of path processors.
///
/// Proof queries run on the chain the underlying object lives on; message
/// builders run on the chain the message will be submitted to. Observation
/// info is always passed in the terms of the chain it was observed on, and
/// builders flip perspective as their message requires.
///
/// Implementations must be safe to call from the path processor worker
/// thread while chain processors run elsewhere.
pub trait ChainProvider: Send + Sync {
    fn chain_id(&self) -> &ChainId;

    /// Proof backing the packet message `action`, queried on this chain at
    /// `height`: the commitment for a receive, the acknowledgement for an
    /// ack, the receipt absence for a timeout.
    fn packet_proof(
        &self,
        action: &str,
        info: &PacketInfo,
        height: u64,
    ) -> Result<Proof, ProviderError>;

    fn packet_message(
        &self,
        action: &str,
        info: &PacketInfo,
        proof: Proof,
    ) -> Result<AnyMsg, ProviderError>;

    /// Proof of the connection end (and its client state) on this chain.
    fn connection_proof(
        &self,
        action: &str,
        info: &ConnectionInfo,
        height: u64,
    ) -> Result<Proof, ProviderError>;

    fn connection_message(
        &self,
        action: &str,
        info: &ConnectionInfo,
        proof: Proof,
    ) -> Result<AnyMsg, ProviderError>;

    /// Proof of the channel end on this chain.
    fn channel_proof(
        &self,
        action: &str,
        info: &ChannelInfo,
        height: u64,
    ) -> Result<Proof, ProviderError>;

    fn channel_message(
        &self,
        action: &str,
        info: &ChannelInfo,
        proof: Proof,
    ) -> Result<AnyMsg, ProviderError>;

    /// Client update submitting `header` to `client_id` on this chain,
    /// trusting the client's current consensus state at `trusted_height`.
    fn update_client_message(
        &self,
        client_id: &ClientId,
        trusted_height: u64,
        header: &dyn IbcHeader,
    ) -> Result<AnyMsg, ProviderError>;

    /// Sign and broadcast an ordered batch of messages as one transaction.
    fn send_messages(&self, msgs: Vec<AnyMsg>) -> Result<(), ProviderError>;
}
