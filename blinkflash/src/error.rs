//! Error types for blinkflash.

use std::io;
use thiserror::Error;

/// Result type for blinkflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for blinkflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (compiler output, temporary files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Host Bluetooth stack error.
    #[cfg(feature = "ble")]
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No device matched the discovery filter.
    #[error("Device not found")]
    DeviceNotFound,

    /// Device selection was cancelled by the user.
    #[error("Device selection cancelled")]
    DiscoveryCancelled,

    /// The transport failed while opening or using the link.
    #[error("Link error: {0}")]
    Link(String),

    /// No link is currently established.
    #[error("Not connected to device")]
    NotConnected,

    /// A required GATT endpoint is missing on the device.
    #[error("Endpoint unavailable: {0}")]
    EndpointUnavailable(&'static str),

    /// Malformed frame or unexpected device data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A Data frame write failed; the transfer was aborted at `offset`.
    #[error("Send [D]ata failed at offset {offset}: {source}")]
    ChunkWrite {
        /// Image offset of the chunk that failed.
        offset: usize,
        /// Underlying transport error.
        source: Box<Error>,
    },

    /// A control frame (Program, Reload, Reset) write failed.
    #[error("Send {frame} failed: {source}")]
    FrameWrite {
        /// Frame label, e.g. `[P]rogram`.
        frame: &'static str,
        /// Underlying transport error.
        source: Box<Error>,
    },

    /// Image does not fit the 16-bit length field of the wire format.
    #[error("Image too large: {0} bytes (maximum 65535)")]
    ImageTooLarge(usize),

    /// Slot index outside 1..=2.
    #[error("Invalid slot {0}: expected 1 or 2")]
    InvalidSlot(u8),

    /// Negotiated MTU leaves no room for a Data payload.
    #[error("MTU {0} is too small for a Data frame")]
    MtuTooSmall(u16),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was superseded by a user disconnect or shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// The session task has stopped.
    #[error("Session closed")]
    SessionClosed,

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The compiler rejected the source.
    #[error("Compile error: {0}")]
    Compile(String),
}

impl Error {
    /// Render the error as a single human-readable status line.
    ///
    /// Transport-level failures map to actionable hints; everything else
    /// falls back to the `Display` text.
    pub fn status_line(&self) -> String {
        match self {
            Self::DeviceNotFound => {
                "Device not found. Please make sure your OpenBlink device is turned on and nearby."
                    .to_string()
            },
            Self::DiscoveryCancelled => "Connection cancelled: No device selected".to_string(),
            Self::NotConnected => {
                "Device not connected. Please connect to a device first.".to_string()
            },
            Self::EndpointUnavailable(_) => {
                "Program characteristic not available. Please reconnect.".to_string()
            },
            Self::Timeout(_) => "The operation timed out. Please try again.".to_string(),
            Self::Cancelled => "The operation was cancelled.".to_string(),
            Self::Link(msg) if msg.contains("GATT") => {
                "Bluetooth communication error. Please try reconnecting.".to_string()
            },
            Self::Link(msg) if msg.contains("adapter") => {
                "Bluetooth adapter not available. Please check if Bluetooth is enabled."
                    .to_string()
            },
            other => format!("Error: {other}"),
        }
    }
}
