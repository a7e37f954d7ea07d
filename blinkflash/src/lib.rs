//! # blinkflash
//!
//! Connection and bytecode transfer engine for OpenBlink devices.
//!
//! OpenBlink devices run mruby and accept compiled bytecode over a small
//! Bluetooth LE GATT service. This crate provides:
//!
//! - The frame codec and CRC-16 checksum of the transfer protocol
//! - MTU negotiation with fallback
//! - A connection session with bounded automatic reconnection
//! - The transfer orchestrator (Data frames, Program commit, Reload)
//! - Device console decoding
//!
//! ## Backends
//!
//! - **sim** (always available): an in-process simulated device
//! - **ble** (feature `ble`): the host Bluetooth stack via `btleplug`
//!
//! ## Features
//!
//! - `ble`: native Bluetooth LE backend
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use blinkflash::link::sim::SimCentral;
//! use blinkflash::{FirmwareImage, Session, SessionConfig, Slot};
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (central, _device) = SimCentral::with_default_device();
//!     let session = Session::spawn(Arc::new(central), SessionConfig::default());
//!
//!     session.connect().await?;
//!
//!     let bytecode = std::fs::read("app.mrb")?;
//!     let image = FirmwareImage::new(bytecode, Slot::Two)?;
//!     session
//!         .send_firmware(&image, |sent, total| println!("{sent}/{total}"))
//!         .await?;
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compiler;
pub mod console;
pub mod error;
pub mod event;
pub mod link;
pub mod mtu;
pub mod protocol;
pub mod session;
pub mod transfer;

// Re-exports for convenience
pub use {
    compiler::{BuildReport, CompileResult, Compiler, build_and_send},
    console::{ConsoleDecoder, clean_console_text, drain_utf8_lossy, prefix_lines},
    error::{Error, Result},
    event::{EventSink, SessionEvent},
    link::{Central, DeviceInfo, DiscoveryFilter, Link},
    mtu::{MtuPolicy, MtuSource, NegotiatedMtu},
    protocol::{TransferFrame, crc16},
    session::{ConnectOutcome, ConnectionState, ReconnectPolicy, Session, SessionConfig},
    transfer::{FirmwareImage, Slot, TransferOutcome},
};
