//! Host Bluetooth LE backend built on `btleplug`.
//!
//! Endpoints are resolved once per connect. Console notifications are pumped
//! from the peripheral's notification stream into the registered
//! [`ConsoleSink`] by a task owned by the link; link drops are detected from
//! the adapter's `DeviceDisconnected` events.
//!
//! `btleplug` exposes no MTU request, so negotiation always goes through the
//! device's MTU-report endpoint.

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, trace, warn};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    CONSOLE_CHARACTERISTIC_UUID, Central, ConsoleSink, DeviceInfo, DiscoveryFilter, Link, LinkId,
    MTU_CHARACTERISTIC_UUID, PROGRAM_CHARACTERISTIC_UUID, WriteMode,
};
use crate::error::{Error, Result};

/// Central backed by the first Bluetooth adapter of the host.
#[derive(Debug, Clone)]
pub struct BleCentral {
    adapter: Adapter,
}

impl BleCentral {
    /// Open the first available adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Link("no Bluetooth adapter found".into()))?;
        Ok(Self { adapter })
    }

    async fn find(&self, device: &DeviceInfo) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral_key(&peripheral) == device.id {
                return Ok(peripheral);
            }
        }
        Err(Error::DeviceNotFound)
    }

    /// Resolve the OpenBlink endpoints on a connected peripheral.
    async fn open(&self, device: &DeviceInfo, peripheral: &Peripheral) -> Result<BleLink> {
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let lookup = |uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let program =
            lookup(PROGRAM_CHARACTERISTIC_UUID).ok_or(Error::EndpointUnavailable("program"))?;
        let console =
            lookup(CONSOLE_CHARACTERISTIC_UUID).ok_or(Error::EndpointUnavailable("console"))?;
        let mtu = lookup(MTU_CHARACTERISTIC_UUID);
        if mtu.is_none() {
            warn!("{device} has no MTU characteristic");
        }

        let closed = CancellationToken::new();
        watch_disconnect(&self.adapter, peripheral, closed.clone()).await?;

        Ok(BleLink {
            id: LinkId::next(),
            info: device.clone(),
            peripheral: peripheral.clone(),
            program,
            console,
            mtu,
            closed,
            pump: Mutex::new(None),
        })
    }
}

fn peripheral_key(peripheral: &Peripheral) -> String {
    format!("{:?}", peripheral.id())
}

#[async_trait]
impl Central for BleCentral {
    async fn scan(&self, filter: &DiscoveryFilter) -> Result<Vec<DeviceInfo>> {
        // Name-prefix matches may not advertise the service, so scan
        // unfiltered and match locally.
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(filter.scan_timeout).await;
        self.adapter.stop_scan().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let name = props.local_name.as_deref();
            if filter.matches(name, &props.services) {
                let info = DeviceInfo::new(
                    peripheral_key(&peripheral),
                    name.unwrap_or("(unnamed)"),
                );
                trace!("Found {info} rssi={:?}", props.rssi);
                found.push(info);
            }
        }
        debug!("Scan found {} device(s)", found.len());
        Ok(found)
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<Arc<dyn Link>> {
        let peripheral = self.find(device).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        let link = disconnect_on_error(self.open(device, &peripheral), || async {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect of {device} after failed setup failed: {e}");
            }
        })
        .await?;
        Ok(Arc::new(link))
    }
}

/// Await `setup`, running `disconnect` before returning its error.
async fn disconnect_on_error<T, S, D, F>(setup: S, disconnect: D) -> Result<T>
where
    S: Future<Output = Result<T>>,
    D: FnOnce() -> F,
    F: Future<Output = ()>,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(e) => {
            disconnect().await;
            Err(e)
        },
    }
}

/// Cancel `closed` when the adapter reports the peripheral gone.
async fn watch_disconnect(
    adapter: &Adapter,
    peripheral: &Peripheral,
    closed: CancellationToken,
) -> Result<()> {
    let mut events = adapter.events().await?;
    let id = peripheral.id();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                        debug!("Adapter reports {gone:?} disconnected");
                        closed.cancel();
                        break;
                    }
                    Some(_) => {}
                    None => {
                        closed.cancel();
                        break;
                    }
                },
                () = closed.cancelled() => break,
            }
        }
    });
    Ok(())
}

/// Link to a peripheral exposing the OpenBlink service.
#[derive(Debug)]
pub struct BleLink {
    id: LinkId,
    info: DeviceInfo,
    peripheral: Peripheral,
    program: Characteristic,
    console: Characteristic,
    mtu: Option<Characteristic>,
    closed: CancellationToken,
    pump: Mutex<Option<(u64, CancellationToken)>>,
}

impl BleLink {
    fn replace_pump(&self, next: Option<(u64, CancellationToken)>) -> Option<(u64, CancellationToken)> {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *pump, next)
    }

    fn write_type(&self, mode: WriteMode) -> WriteType {
        match mode {
            WriteMode::Fast
                if self
                    .program
                    .properties
                    .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) =>
            {
                WriteType::WithoutResponse
            },
            _ => WriteType::WithResponse,
        }
    }
}

#[async_trait]
impl Link for BleLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn can_request_mtu(&self) -> bool {
        false
    }

    async fn request_mtu(&self, _preferred: u16) -> Result<u16> {
        Err(Error::Link("MTU request not supported by this backend".into()))
    }

    async fn read_mtu_report(&self) -> Result<Vec<u8>> {
        let mtu = self
            .mtu
            .as_ref()
            .ok_or(Error::EndpointUnavailable("mtu"))?;
        Ok(self.peripheral.read(mtu).await?)
    }

    async fn write_program(&self, frame: &[u8], mode: WriteMode) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Link("GATT server is disconnected".into()));
        }
        self.peripheral
            .write(&self.program, frame, self.write_type(mode))
            .await?;
        Ok(())
    }

    async fn subscribe_console(&self, sink: ConsoleSink) -> Result<()> {
        if let Some((_, stop)) = self.replace_pump(None) {
            stop.cancel();
        }

        self.peripheral.subscribe(&self.console).await?;
        let mut notifications = self.peripheral.notifications().await?;

        let stop = self.closed.child_token();
        self.replace_pump(Some((sink.id(), stop.clone())));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    n = notifications.next() => match n {
                        Some(n) if n.uuid == CONSOLE_CHARACTERISTIC_UUID => {
                            if !sink.deliver(n.value) {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    () = stop.cancelled() => break,
                }
            }
        });
        Ok(())
    }

    async fn unsubscribe_console(&self, sink_id: u64) -> Result<()> {
        let current = self.replace_pump(None);
        match current {
            Some((id, stop)) if id == sink_id => {
                stop.cancel();
                if !self.closed.is_cancelled() {
                    self.peripheral.unsubscribe(&self.console).await?;
                }
            },
            other => {
                self.replace_pump(other);
            },
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn disconnect(&self) -> Result<()> {
        let result = if self.closed.is_cancelled() {
            Ok(())
        } else {
            self.peripheral.disconnect().await.map_err(Error::from)
        };
        self.closed.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_failed_setup_disconnects() {
        let disconnects = AtomicUsize::new(0);
        let result: Result<()> = disconnect_on_error(
            async { Err(Error::EndpointUnavailable("console")) },
            || async {
                disconnects.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(matches!(result, Err(Error::EndpointUnavailable("console"))));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_setup_keeps_connection() {
        let disconnects = AtomicUsize::new(0);
        let result = disconnect_on_error(async { Ok(7) }, || async {
            disconnects.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }
}
