//! In-process simulated OpenBlink device.
//!
//! [`SimDevice`] models the device side of the protocol: it reassembles Data
//! frames, checks the Program checksum, stores accepted images per slot and
//! prints to its console like the firmware does. Fault injection hooks
//! (refused connects, failed writes, link drops, MTU behaviours) let tests
//! drive every recovery path without hardware.
//!
//! ## Example
//!
//! ```rust
//! use blinkflash::link::sim::{SimCentral, SimDevice};
//! use blinkflash::link::{Central, DiscoveryFilter};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let device = SimDevice::new("OpenBlink-SIM");
//! let central = SimCentral::new(vec![device.clone()]);
//!
//! let found = central.scan(&DiscoveryFilter::default()).await.unwrap();
//! let link = central.connect(&found[0]).await.unwrap();
//! assert!(link.is_connected());
//! # });
//! ```

use async_trait::async_trait;
use log::{debug, trace};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Central, ConsoleSink, DeviceInfo, DiscoveryFilter, Link, LinkId, WriteMode};
use crate::error::{Error, Result};
use crate::protocol::{TransferFrame, crc16};

/// MTU reported by a fresh simulated device (a typical BLE 4.2+ ATT MTU).
pub const SIM_REPORTED_MTU: u16 = 247;

/// How the simulated transport answers MTU requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuCapability {
    /// The transport has no MTU request API.
    Unsupported,
    /// Requests succeed with this value.
    Grant(u16),
    /// Requests exist but fail.
    Fail,
}

#[derive(Debug)]
struct Listener {
    sink: ConsoleSink,
    link: LinkId,
}

#[derive(Debug)]
struct DeviceState {
    mtu_capability: MtuCapability,
    mtu_report: Option<Vec<u8>>,
    mtu_requests: Vec<u16>,
    refuse_connects: bool,
    connect_failures: u32,
    connect_delay: Duration,
    connects: usize,
    link: Option<(LinkId, CancellationToken)>,
    writes: Vec<(Vec<u8>, WriteMode)>,
    fail_write_at: Option<usize>,
    drop_at_write: Option<usize>,
    staging: Vec<u8>,
    slots: [Option<Vec<u8>>; 2],
    reloads: usize,
    resets: usize,
    listeners: Vec<Listener>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            mtu_capability: MtuCapability::Unsupported,
            mtu_report: Some(SIM_REPORTED_MTU.to_le_bytes().to_vec()),
            mtu_requests: Vec::new(),
            refuse_connects: false,
            connect_failures: 0,
            connect_delay: Duration::ZERO,
            connects: 0,
            link: None,
            writes: Vec::new(),
            fail_write_at: None,
            drop_at_write: None,
            staging: Vec::new(),
            slots: [None, None],
            reloads: 0,
            resets: 0,
            listeners: Vec::new(),
        }
    }
}

/// A simulated OpenBlink device.
#[derive(Debug)]
pub struct SimDevice {
    info: DeviceInfo,
    state: Mutex<DeviceState>,
}

impl SimDevice {
    /// Create a device advertising `name`.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            info: DeviceInfo::new(format!("sim:{name}"), name),
            state: Mutex::new(DeviceState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Discovery record of this device.
    pub fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    /// Configure MTU request behaviour.
    pub fn set_mtu_capability(&self, capability: MtuCapability) {
        self.lock().mtu_capability = capability;
    }

    /// Configure the raw MTU-report value; `None` makes reads fail.
    pub fn set_mtu_report(&self, raw: Option<Vec<u8>>) {
        self.lock().mtu_report = raw;
    }

    /// Refuse every connect attempt until turned off.
    pub fn set_refuse_connects(&self, refuse: bool) {
        self.lock().refuse_connects = refuse;
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// Make every connect take `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Fail the `nth` program write from now (0 = the next one).
    pub fn fail_write(&self, nth: usize) {
        let mut state = self.lock();
        state.fail_write_at = Some(state.writes.len() + nth);
    }

    /// Drop the link while performing the `nth` program write from now.
    pub fn drop_on_write(&self, nth: usize) {
        let mut state = self.lock();
        state.drop_at_write = Some(state.writes.len() + nth);
    }

    /// Simulate a transport drop of the current link.
    pub fn drop_link(&self) {
        if let Some((id, token)) = self.lock().link.take() {
            debug!("sim: dropping {id}");
            token.cancel();
        }
    }

    /// Print `text` on the device console.
    pub fn emit_console(&self, text: &str) {
        Self::print(&mut self.lock(), text);
    }

    fn print(state: &mut DeviceState, text: &str) {
        state
            .listeners
            .retain(|l| l.sink.deliver(text.as_bytes().to_vec()));
    }

    /// Whether a link is currently up.
    pub fn is_linked(&self) -> bool {
        self.lock().link.is_some()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Number of registered console listeners.
    pub fn console_listeners(&self) -> usize {
        self.lock().listeners.len()
    }

    /// MTU values requested so far.
    pub fn mtu_requests(&self) -> Vec<u16> {
        self.lock().mtu_requests.clone()
    }

    /// Every frame written to the program endpoint that the device accepted.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .map(|(bytes, _)| bytes.clone())
            .collect()
    }

    /// Write mode used for each accepted frame.
    pub fn write_modes(&self) -> Vec<WriteMode> {
        self.lock().writes.iter().map(|(_, mode)| *mode).collect()
    }

    /// Image committed to `slot` (1 or 2).
    pub fn slot(&self, slot: u8) -> Option<Vec<u8>> {
        let index = usize::from(slot.checked_sub(1)?);
        self.lock().slots.get(index)?.clone()
    }

    /// Number of Reload frames received.
    pub fn reloads(&self) -> usize {
        self.lock().reloads
    }

    /// Number of Reset frames received.
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    fn accept_connect(&self) -> Result<(LinkId, CancellationToken)> {
        let mut state = self.lock();
        if state.refuse_connects {
            return Err(Error::Link("GATT connect refused".into()));
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(Error::Link("GATT connect failed".into()));
        }
        if let Some((_, old)) = state.link.take() {
            old.cancel();
        }
        let id = LinkId::next();
        let token = CancellationToken::new();
        state.link = Some((id, token.clone()));
        state.connects += 1;
        debug!("sim: {} connected as {id}", self.info.name);
        Ok((id, token))
    }

    fn release(&self, id: LinkId) {
        let mut state = self.lock();
        if state.link.as_ref().is_some_and(|(current, _)| *current == id) {
            if let Some((_, token)) = state.link.take() {
                token.cancel();
            }
        }
    }

    fn receive(&self, id: LinkId, frame: &[u8], mode: WriteMode) -> Result<()> {
        let mut state = self.lock();
        if !state.link.as_ref().is_some_and(|(current, _)| *current == id) {
            return Err(Error::Link("GATT server is disconnected".into()));
        }

        let index = state.writes.len();
        if state.drop_at_write == Some(index) {
            state.drop_at_write = None;
            if let Some((_, token)) = state.link.take() {
                token.cancel();
            }
            return Err(Error::Link("GATT server is disconnected".into()));
        }
        if state.fail_write_at == Some(index) {
            state.fail_write_at = None;
            return Err(Error::Link("GATT operation failed".into()));
        }

        trace!("sim: received {frame:02X?}");
        let decoded = TransferFrame::decode(frame)?;
        state.writes.push((frame.to_vec(), mode));

        match decoded {
            TransferFrame::Reset => {
                state.resets += 1;
                state.staging.clear();
                Self::print(&mut state, "Reset\n");
            },
            TransferFrame::Reload => {
                state.reloads += 1;
                Self::print(&mut state, "Reload\n");
            },
            TransferFrame::Data { offset, payload } => {
                let start = usize::from(offset);
                let end = start + payload.len();
                if state.staging.len() < end {
                    state.staging.resize(end, 0);
                }
                state.staging[start..end].copy_from_slice(payload);
            },
            TransferFrame::Program {
                total_length,
                checksum,
                slot,
            } => {
                let len = usize::from(total_length);
                let staged = std::mem::take(&mut state.staging);
                let message = if staged.len() < len {
                    format!("Program error: received {} of {len} bytes\n", staged.len())
                } else if crc16(&staged[..len]) != checksum {
                    format!("Program error: CRC mismatch (expected {checksum:04x})\n")
                } else if !(1..=2).contains(&slot) {
                    format!("Program error: invalid slot {slot}\n")
                } else {
                    state.slots[usize::from(slot - 1)] = Some(staged[..len].to_vec());
                    format!("Program stored: slot={slot}, length={len}, crc={checksum:04x}\n")
                };
                Self::print(&mut state, &message);
            },
        }

        Ok(())
    }
}

/// Central that discovers a fixed set of simulated devices.
#[derive(Debug, Clone, Default)]
pub struct SimCentral {
    devices: Vec<Arc<SimDevice>>,
}

impl SimCentral {
    /// Create a central seeing `devices`.
    pub fn new(devices: Vec<Arc<SimDevice>>) -> Self {
        Self { devices }
    }

    /// A central with a single device named `OpenBlink-SIM`.
    pub fn with_default_device() -> (Self, Arc<SimDevice>) {
        let device = SimDevice::new("OpenBlink-SIM");
        (Self::new(vec![device.clone()]), device)
    }
}

#[async_trait]
impl Central for SimCentral {
    async fn scan(&self, filter: &DiscoveryFilter) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .iter()
            .filter(|d| filter.matches(Some(&d.info.name), &[]))
            .map(|d| d.info())
            .collect())
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<Arc<dyn Link>> {
        let sim = self
            .devices
            .iter()
            .find(|d| d.info.id == device.id)
            .ok_or(Error::DeviceNotFound)?
            .clone();
        let delay = sim.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (id, closed) = sim.accept_connect()?;
        Ok(Arc::new(SimLink {
            id,
            info: sim.info(),
            device: sim,
            closed,
        }))
    }
}

/// Link to a [`SimDevice`].
#[derive(Debug)]
pub struct SimLink {
    id: LinkId,
    info: DeviceInfo,
    device: Arc<SimDevice>,
    closed: CancellationToken,
}

#[async_trait]
impl Link for SimLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn can_request_mtu(&self) -> bool {
        !matches!(self.device.lock().mtu_capability, MtuCapability::Unsupported)
    }

    async fn request_mtu(&self, preferred: u16) -> Result<u16> {
        let mut state = self.device.lock();
        state.mtu_requests.push(preferred);
        match state.mtu_capability {
            MtuCapability::Grant(value) => Ok(value.min(preferred)),
            MtuCapability::Fail => Err(Error::Link("MTU exchange failed".into())),
            MtuCapability::Unsupported => Err(Error::Link("MTU request not supported".into())),
        }
    }

    async fn read_mtu_report(&self) -> Result<Vec<u8>> {
        if self.closed.is_cancelled() {
            return Err(Error::NotConnected);
        }
        self.device
            .lock()
            .mtu_report
            .clone()
            .ok_or(Error::Link("GATT read failed".into()))
    }

    async fn write_program(&self, frame: &[u8], mode: WriteMode) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Link("GATT server is disconnected".into()));
        }
        self.device.receive(self.id, frame, mode)
    }

    async fn subscribe_console(&self, sink: ConsoleSink) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::NotConnected);
        }
        let mut state = self.device.lock();
        state.listeners.retain(|l| l.sink.id() != sink.id());
        state.listeners.push(Listener {
            sink,
            link: self.id,
        });
        Ok(())
    }

    async fn unsubscribe_console(&self, sink_id: u64) -> Result<()> {
        self.device
            .lock()
            .listeners
            .retain(|l| !(l.sink.id() == sink_id && l.link == self.id));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn disconnect(&self) -> Result<()> {
        self.device.release(self.id);
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(device: &Arc<SimDevice>) -> Arc<dyn Link> {
        SimCentral::new(vec![device.clone()])
            .connect(&device.info())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_scan_filters_by_name_prefix() {
        let a = SimDevice::new("OpenBlink-A");
        let b = SimDevice::new("Thermostat");
        let central = SimCentral::new(vec![a, b]);

        let found = central.scan(&DiscoveryFilter::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "OpenBlink-A");
    }

    #[tokio::test]
    async fn test_refused_and_failing_connects() {
        let device = SimDevice::new("OpenBlink-B");
        let central = SimCentral::new(vec![device.clone()]);

        device.fail_next_connects(1);
        assert!(central.connect(&device.info()).await.is_err());
        assert!(central.connect(&device.info()).await.is_ok());

        device.set_refuse_connects(true);
        assert!(central.connect(&device.info()).await.is_err());
        assert_eq!(device.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_closes_link() {
        let device = SimDevice::new("OpenBlink-C");
        let link = connect(&device).await;
        assert!(link.is_connected());

        device.drop_link();
        link.closed().await;
        assert!(!link.is_connected());
        assert!(link.write_program(&[0x01, b'L'], WriteMode::Fast).await.is_err());
    }

    #[tokio::test]
    async fn test_device_stores_valid_program() {
        let device = SimDevice::new("OpenBlink-D");
        let link = connect(&device).await;
        let image = b"RITE0300";

        for (offset, chunk) in [(0u16, &image[..5]), (5, &image[5..])] {
            let frame = TransferFrame::Data {
                offset,
                payload: chunk,
            };
            link.write_program(&frame.encode().unwrap(), WriteMode::Fast)
                .await
                .unwrap();
        }
        let program = TransferFrame::Program {
            total_length: 8,
            checksum: crc16(image),
            slot: 2,
        };
        link.write_program(&program.encode().unwrap(), WriteMode::Fast)
            .await
            .unwrap();

        assert_eq!(device.slot(2).as_deref(), Some(&image[..]));
        assert_eq!(device.slot(1), None);
    }

    #[tokio::test]
    async fn test_device_rejects_bad_checksum() {
        let device = SimDevice::new("OpenBlink-E");
        let link = connect(&device).await;
        let (sink, mut rx) = ConsoleSink::channel();
        link.subscribe_console(sink).await.unwrap();

        let data = TransferFrame::Data {
            offset: 0,
            payload: b"abc",
        };
        link.write_program(&data.encode().unwrap(), WriteMode::Fast)
            .await
            .unwrap();
        let program = TransferFrame::Program {
            total_length: 3,
            checksum: 0x0000,
            slot: 1,
        };
        link.write_program(&program.encode().unwrap(), WriteMode::Fast)
            .await
            .unwrap();

        assert_eq!(device.slot(1), None);
        let text = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(text.contains("CRC mismatch"));
    }

    #[tokio::test]
    async fn test_same_sink_is_never_registered_twice() {
        let device = SimDevice::new("OpenBlink-F");
        let link = connect(&device).await;
        let (sink, _rx) = ConsoleSink::channel();

        link.subscribe_console(sink.clone()).await.unwrap();
        link.subscribe_console(sink.clone()).await.unwrap();
        assert_eq!(device.console_listeners(), 1);

        link.unsubscribe_console(sink.id()).await.unwrap();
        assert_eq!(device.console_listeners(), 0);
    }

    #[tokio::test]
    async fn test_injected_write_failure_is_one_shot() {
        let device = SimDevice::new("OpenBlink-G");
        let link = connect(&device).await;

        device.fail_write(0);
        assert!(link.write_program(&[0x01, b'R'], WriteMode::Acknowledged).await.is_err());
        assert!(link.write_program(&[0x01, b'R'], WriteMode::Acknowledged).await.is_ok());
        assert_eq!(device.resets(), 1);
        assert_eq!(device.write_modes(), vec![WriteMode::Acknowledged]);
    }
}
