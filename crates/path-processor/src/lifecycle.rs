//! Stop conditions for a path processor.
//!
//! A lifecycle carries an optional initial message, submitted once after
//! both sides are in sync, and an optional termination message; the
//! processor shuts itself down once the termination is observed on chain.

use crate::ident::ChainId;
use crate::provider::{ChannelInfo, ConnectionInfo, PacketInfo};

#[derive(Clone, Debug)]
pub struct PacketMessage {
    pub chain_id: ChainId,
    pub action: String,
    pub info: PacketInfo,
}

#[derive(Clone, Debug)]
pub struct ConnectionMessage {
    pub chain_id: ChainId,
    pub action: String,
    pub info: ConnectionInfo,
}

#[derive(Clone, Debug)]
pub struct ChannelMessage {
    pub chain_id: ChainId,
    pub action: String,
    pub info: ChannelInfo,
}

/// Sends the initial message, then stops the path processor once it
/// observes the termination message, e.g. a `MsgAcknowledgement` for a
/// packet flow started with a `MsgTransfer`.
#[derive(Clone, Debug, Default)]
pub struct PacketMessageLifecycle {
    pub initial: Option<PacketMessage>,
    pub termination: Option<PacketMessage>,
}

/// Sends the initial message, then stops the path processor once it
/// observes the termination message, e.g. a `MsgConnectionOpenConfirm`.
///
/// For channel and connection terminations, empty identifier fields match
/// any observed value.
#[derive(Clone, Debug, Default)]
pub struct ConnectionMessageLifecycle {
    pub initial: Option<ConnectionMessage>,
    pub termination: Option<ConnectionMessage>,
}

/// Sends the initial message, then stops the path processor once it
/// observes the termination message, e.g. a `MsgChannelOpenConfirm`.
#[derive(Clone, Debug, Default)]
pub struct ChannelMessageLifecycle {
    pub initial: Option<ChannelMessage>,
    pub termination: Option<ChannelMessage>,
}

/// A stop condition for the path processor, one variant per message family.
#[derive(Clone, Debug)]
pub enum MessageLifecycle {
    Packet(PacketMessageLifecycle),
    Connection(ConnectionMessageLifecycle),
    Channel(ChannelMessageLifecycle),
}
