//! IBC message type identifiers.
//!
//! These are the possible message actions produced when parsing chain
//! events. They are shared keys between chain processors and path
//! processors, and are the canonical protobuf full names prefixed with `/`.

// Packet messages
pub const MSG_TRANSFER: &str = "/ibc.applications.transfer.v1.MsgTransfer";
pub const MSG_RECV_PACKET: &str = "/ibc.core.channel.v1.MsgRecvPacket";
pub const MSG_ACKNOWLEDGEMENT: &str = "/ibc.core.channel.v1.MsgAcknowledgement";
pub const MSG_TIMEOUT: &str = "/ibc.core.channel.v1.MsgTimeout";
pub const MSG_TIMEOUT_ON_CLOSE: &str = "/ibc.core.channel.v1.MsgTimeoutOnClose";

// Connection messages
pub const MSG_CONNECTION_OPEN_INIT: &str = "/ibc.core.connection.v1.MsgConnectionOpenInit";
pub const MSG_CONNECTION_OPEN_TRY: &str = "/ibc.core.connection.v1.MsgConnectionOpenTry";
pub const MSG_CONNECTION_OPEN_ACK: &str = "/ibc.core.connection.v1.MsgConnectionOpenAck";
pub const MSG_CONNECTION_OPEN_CONFIRM: &str = "/ibc.core.connection.v1.MsgConnectionOpenConfirm";

// Channel messages
pub const MSG_CHANNEL_OPEN_INIT: &str = "/ibc.core.channel.v1.MsgChannelOpenInit";
pub const MSG_CHANNEL_OPEN_TRY: &str = "/ibc.core.channel.v1.MsgChannelOpenTry";
pub const MSG_CHANNEL_OPEN_ACK: &str = "/ibc.core.channel.v1.MsgChannelOpenAck";
pub const MSG_CHANNEL_OPEN_CONFIRM: &str = "/ibc.core.channel.v1.MsgChannelOpenConfirm";

pub const MSG_CHANNEL_CLOSE_INIT: &str = "/ibc.core.channel.v1.MsgChannelCloseInit";
pub const MSG_CHANNEL_CLOSE_CONFIRM: &str = "/ibc.core.channel.v1.MsgChannelCloseConfirm";

// Client messages
pub const MSG_CREATE_CLIENT: &str = "/ibc.core.client.v1.MsgCreateClient";
pub const MSG_UPDATE_CLIENT: &str = "/ibc.core.client.v1.MsgUpdateClient";
pub const MSG_UPGRADE_CLIENT: &str = "/ibc.core.client.v1.MsgUpgradeClient";
pub const MSG_SUBMIT_MISBEHAVIOUR: &str = "/ibc.core.client.v1.MsgSubmitMisbehaviour";

/// Short name for an IBC message action, i.e. the substring after the
/// final `.` of its type URL.
pub fn short_action(action: &str) -> &str {
    action.rsplit('.').next().unwrap_or(action)
}
