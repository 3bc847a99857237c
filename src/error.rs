use thiserror::Error;

use crate::types::DeviceId;

/// Errors that can occur while bridging sauna devices to the message bus
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Socket level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound datagram could not be decoded
    #[error("Failed to decode message: {0}")]
    Decode(String),

    /// The session port is already bound to another device
    #[error("Port {port} is bound to device {bound}, refusing to connect device {requested}")]
    PortInUse {
        /// Session port
        port: u16,
        /// Device currently holding the port
        bound: DeviceId,
        /// Device that asked for the port
        requested: DeviceId,
    },

    /// Calendar commands only address the date programs 1..=21
    #[error("Invalid calendar index {0}, expected 1..=21")]
    InvalidCalendarIndex(u8),

    /// Device has never been announced
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    /// Invalid runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal channel was closed while the gateway was running
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Check if this error is a usage error that must abort the operation
    #[must_use]
    pub const fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::PortInUse { .. } | Self::InvalidCalendarIndex(_)
        )
    }

    /// Check if the event loop can keep running after this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::UnknownDevice(_) | Self::InvalidCalendarIndex(_)
        )
    }
}
