//! Bytecode transfer.
//!
//! A transfer streams the image as Data frames sized to the negotiated MTU,
//! then commits it with a Program frame and makes the device pick it up with
//! a Reload frame:
//!
//! ```text
//! host                                   device
//!  |-- 01 'D' off=0   len=n  payload ----->|
//!  |-- 01 'D' off=n   len=n  payload ----->|
//!  |   ...                                 |
//!  |-- 01 'P' total crc16 slot 00 -------->|
//!  |-- 01 'L' ---------------------------->|
//! ```
//!
//! Every write is awaited before the next frame is built. Nothing is
//! resent; the first failure aborts the transfer.

use log::{debug, info};
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::event::EventSink;
use crate::link::{Link, WriteMode};
use crate::mtu::NegotiatedMtu;
use crate::protocol::{TransferFrame, crc16};

/// Largest image the 16-bit length field can describe.
pub const MAX_IMAGE_SIZE: usize = u16::MAX as usize;

/// Program slot on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Slot {
    /// Slot 1.
    One = 1,
    /// Slot 2.
    #[default]
    Two = 2,
}

impl Slot {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Slot {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(Error::InvalidSlot(other)),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Compiled bytecode bound for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    slot: Slot,
}

impl FirmwareImage {
    /// Wrap `bytes` for `slot`.
    ///
    /// # Errors
    ///
    /// [`Error::ImageTooLarge`] when the image exceeds [`MAX_IMAGE_SIZE`].
    pub fn new(bytes: impl Into<Vec<u8>>, slot: Slot) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > MAX_IMAGE_SIZE {
            return Err(Error::ImageTooLarge(bytes.len()));
        }
        Ok(Self { bytes, slot })
    }

    /// Image contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Target slot.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// CRC-16 of the whole image, as carried by the Program frame.
    pub fn checksum(&self) -> u16 {
        crc16(&self.bytes)
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Image length.
    pub total_bytes: usize,
    /// Data frames sent.
    pub chunks: usize,
    /// Checksum sent in the Program frame.
    pub checksum: u16,
    /// Slot the image was committed to.
    pub slot: Slot,
    /// MTU the frames were sized for.
    pub mtu: u16,
    /// Wall-clock time from the first Data frame to the acknowledged Reload.
    pub elapsed: Duration,
}

/// Byte ranges of the Data frames for an image of `len` bytes.
pub fn chunk_ranges(len: usize, payload: usize) -> impl Iterator<Item = Range<usize>> {
    let step = payload.max(1);
    (0..len)
        .step_by(step)
        .map(move |start| start..(start + step).min(len))
}

/// Stream `image` over `link`.
///
/// `progress` is called with `(bytes_sent, total)` after every Data frame.
///
/// # Errors
///
/// - [`Error::MtuTooSmall`] when the MTU leaves no room for a payload; nothing is sent.
/// - [`Error::ChunkWrite`] with the failing offset; no Program frame is sent.
/// - [`Error::FrameWrite`] when the Program or Reload frame fails.
pub async fn send_firmware<F>(
    link: &dyn Link,
    mtu: NegotiatedMtu,
    image: &FirmwareImage,
    events: &EventSink,
    mut progress: F,
) -> Result<TransferOutcome>
where
    F: FnMut(usize, usize) + Send,
{
    let payload = mtu.payload_size().ok_or(Error::MtuTooSmall(mtu.value))?;
    let total = image.len();
    let checksum = image.checksum();
    let slot = image.slot();

    events.status(format!(
        "Sending bytecode: slot={slot}, length={total}bytes, CRC16={checksum:x}, MTU={}",
        mtu.value
    ));

    let started = Instant::now();
    let mut chunks = 0;

    for range in chunk_ranges(total, payload) {
        let offset = range.start;
        let size = range.len();
        let frame = TransferFrame::Data {
            offset: wire_u16(offset)?,
            payload: &image.bytes()[range],
        };
        let encoded = frame.encode()?;
        link.write_program(&encoded, WriteMode::Fast)
            .await
            .map_err(|e| {
                events.status(format!("Send [D]ata Error: Offset={offset}, Error: {e}"));
                Error::ChunkWrite {
                    offset,
                    source: Box::new(e),
                }
            })?;
        chunks += 1;
        events.status(format!("Send [D]ata Ok: Offset={offset}, Size={size}"));
        progress(offset + size, total);
    }

    let program = TransferFrame::Program {
        total_length: wire_u16(total)?,
        checksum,
        slot: slot.as_u8(),
    };
    write_control(link, &program, WriteMode::Fast, events).await?;
    write_control(link, &TransferFrame::Reload, WriteMode::Fast, events).await?;

    let elapsed = started.elapsed();
    info!(
        "Transferred {total} bytes in {chunks} chunks to slot {slot} ({:.2}ms)",
        elapsed.as_secs_f64() * 1000.0
    );

    Ok(TransferOutcome {
        total_bytes: total,
        chunks,
        checksum,
        slot,
        mtu: mtu.value,
        elapsed,
    })
}

/// Ask the device to reset. Uses an acknowledged write.
///
/// # Errors
///
/// [`Error::FrameWrite`] when the write fails.
pub async fn send_reset(link: &dyn Link, events: &EventSink) -> Result<()> {
    write_control(link, &TransferFrame::Reset, WriteMode::Acknowledged, events).await
}

/// Ask the device to reload its program.
///
/// # Errors
///
/// [`Error::FrameWrite`] when the write fails.
pub async fn send_reload(link: &dyn Link, events: &EventSink) -> Result<()> {
    write_control(link, &TransferFrame::Reload, WriteMode::Fast, events).await
}

async fn write_control(
    link: &dyn Link,
    frame: &TransferFrame<'_>,
    mode: WriteMode,
    events: &EventSink,
) -> Result<()> {
    let label = frame.command().label();
    let encoded = frame.encode()?;
    debug!("--> {label} {encoded:02X?}");

    match link.write_program(&encoded, mode).await {
        Ok(()) => {
            events.status(format!("Send {label} Complete"));
            Ok(())
        },
        Err(e) => {
            events.status(format!("Send {label} Error: {e}"));
            Err(Error::FrameWrite {
                frame: label,
                source: Box::new(e),
            })
        },
    }
}

fn wire_u16(value: usize) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::ImageTooLarge(value))
}
