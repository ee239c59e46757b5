//! Error types for mqttc.

use std::io;

use crate::types::ConnectReturnCode;

/// Result type alias for mqttc.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttc operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Not enough bytes to decode a complete packet.
    #[error("incomplete packet: {needed} more bytes needed")]
    Incomplete { needed: usize },

    /// Encode buffer too small for the packet.
    #[error("buffer too small: required {required}, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Packet exceeds the maximum packet size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Unknown control packet type.
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// QoS field outside 0..=2.
    #[error("invalid qos: {0}")]
    InvalidQoS(u8),

    /// Unsupported protocol level in CONNECT.
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(u8),

    /// Malformed UTF-8 string.
    #[error("invalid utf-8 string")]
    InvalidUtf8,

    /// Broker violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection refused by broker (CONNACK return code).
    #[error("connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Session was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
