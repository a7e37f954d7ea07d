//! Transport abstraction for the OpenBlink GATT service.
//!
//! The engine never talks to a Bluetooth stack directly. It sees two
//! traits:
//!
//! - [`Central`]: finds devices and opens links to them.
//! - [`Link`]: one open connection exposing the three endpoints of the
//!   OpenBlink service.
//!
//! ```text
//! +------------------------+
//! |  Session / Transfer    |
//! +-----------+------------+
//!             |
//!             v
//! +-----------+------------+
//! |  Central + Link traits |
//! +-----------+------------+
//!             |
//!      +------+------+
//!      v             v
//! +----+-----+  +----+------+
//! | ble      |  | sim       |
//! | btleplug |  | in-memory |
//! +----------+  +-----------+
//! ```
//!
//! Implementations exist for:
//!
//! - The host Bluetooth stack via `btleplug` (feature `ble`)
//! - An in-process simulated device ([`sim`]), used by tests and dry runs

#[cfg(feature = "ble")]
pub mod ble;
pub mod sim;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::{Uuid, uuid};

use crate::error::Result;

/// OpenBlink GATT service.
pub const SERVICE_UUID: Uuid = uuid!("227da52c-e13a-412b-befb-ba2256bb7fbe");

/// Program endpoint (write): receives transfer frames.
pub const PROGRAM_CHARACTERISTIC_UUID: Uuid = uuid!("ad9fdd56-1135-4a84-923c-ce5a244385e7");

/// Console endpoint (read/notify): device console text.
pub const CONSOLE_CHARACTERISTIC_UUID: Uuid = uuid!("a015b3de-185a-4252-aa04-7a87d38ce148");

/// MTU-report endpoint (read): u16 LE link MTU as seen by the device.
pub const MTU_CHARACTERISTIC_UUID: Uuid = uuid!("ca141151-3113-448b-b21a-6a6203d253ff");

/// Advertised name prefix of OpenBlink devices.
pub const DEVICE_NAME_PREFIX: &str = "OpenBlink";

/// Opaque identity of one open link.
///
/// Every successful connect yields a fresh id, so events from a link that
/// has since been replaced can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// A discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Backend-specific identifier (address or platform id).
    pub id: String,
    /// Advertised local name.
    pub name: String,
}

impl DeviceInfo {
    /// Create a device description.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Which advertisements count as OpenBlink devices.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryFilter {
    /// Advertised name prefix.
    pub name_prefix: String,
    /// Advertised service; a device matches on either name or service.
    pub service: Uuid,
    /// How long a scan may run before giving up.
    pub scan_timeout: Duration,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            service: SERVICE_UUID,
            scan_timeout: Duration::from_secs(5),
        }
    }
}

impl DiscoveryFilter {
    /// Set the name prefix.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the scan timeout.
    #[must_use]
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Check an advertisement against the filter.
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        name.is_some_and(|n| n.starts_with(&self.name_prefix)) || services.contains(&self.service)
    }
}

/// How a frame is written to the program endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write without response when the endpoint allows it, otherwise fall
    /// back to an acknowledged write.
    Fast,
    /// Always wait for the device acknowledgement.
    Acknowledged,
}

/// Destination for console notifications.
///
/// The id identifies the listener, so a link can replace a previous
/// registration of the same sink instead of adding a second one.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConsoleSink {
    /// Create a sink and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (sink, rx)
    }

    /// Listener identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver one notification payload. Returns `false` once the receiver
    /// is gone.
    pub fn deliver(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(bytes).is_ok()
    }
}

/// Device discovery and link establishment.
#[async_trait]
pub trait Central: Send + Sync {
    /// Scan for devices matching `filter`.
    ///
    /// Returns an empty list when nothing was found before the filter's
    /// scan timeout.
    async fn scan(&self, filter: &DiscoveryFilter) -> Result<Vec<DeviceInfo>>;

    /// Open a link to a previously discovered device and resolve the
    /// OpenBlink endpoints.
    async fn connect(&self, device: &DeviceInfo) -> Result<Arc<dyn Link>>;
}

/// One open connection to an OpenBlink device.
#[async_trait]
pub trait Link: Send + Sync {
    /// Connection identity.
    fn id(&self) -> LinkId;

    /// The device this link is connected to.
    fn device(&self) -> &DeviceInfo;

    /// Whether the transport can negotiate the MTU on request.
    fn can_request_mtu(&self) -> bool;

    /// Ask the transport for `preferred` bytes per write; returns the
    /// granted value.
    async fn request_mtu(&self, preferred: u16) -> Result<u16>;

    /// Read the raw value of the MTU-report endpoint.
    async fn read_mtu_report(&self) -> Result<Vec<u8>>;

    /// Write one encoded frame to the program endpoint and wait for the
    /// write to complete.
    async fn write_program(&self, frame: &[u8], mode: WriteMode) -> Result<()>;

    /// Start console notifications into `sink`.
    ///
    /// A sink that is already registered is replaced, never duplicated.
    async fn subscribe_console(&self, sink: ConsoleSink) -> Result<()>;

    /// Detach the console listener with the given sink id.
    async fn unsubscribe_console(&self, sink_id: u64) -> Result<()>;

    /// Whether the transport still reports the link as up.
    fn is_connected(&self) -> bool;

    /// Resolves once the link has gone down, for whatever reason.
    async fn closed(&self);

    /// Tear the link down. Safe to call on a link that already dropped.
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_constants() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "227da52c-e13a-412b-befb-ba2256bb7fbe"
        );
        assert_ne!(PROGRAM_CHARACTERISTIC_UUID, CONSOLE_CHARACTERISTIC_UUID);
        assert_ne!(CONSOLE_CHARACTERISTIC_UUID, MTU_CHARACTERISTIC_UUID);
    }

    #[test]
    fn test_link_ids_are_unique() {
        let a = LinkId::next();
        let b = LinkId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_filter_matches_name_or_service() {
        let filter = DiscoveryFilter::default();
        assert!(filter.matches(Some("OpenBlink-A1B2"), &[]));
        assert!(filter.matches(None, &[SERVICE_UUID]));
        assert!(filter.matches(Some("Other"), &[SERVICE_UUID]));
        assert!(!filter.matches(Some("Other"), &[]));
        assert!(!filter.matches(None, &[]));
    }

    #[test]
    fn test_console_sink_delivery() {
        let (sink, mut rx) = ConsoleSink::channel();
        let (other, _other_rx) = ConsoleSink::channel();
        assert_ne!(sink.id(), other.id());

        assert!(sink.deliver(b"hi".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), b"hi".to_vec());

        drop(rx);
        assert!(!sink.deliver(b"gone".to_vec()));
    }
}
