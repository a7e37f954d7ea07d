//! OpenBlink program-endpoint frames.
//!
//! Every frame written to the program endpoint starts with the protocol
//! version and a one-byte ASCII command tag.
//!
//! ## Frame Format
//!
//! ```text
//! Reset    +------+-----+
//! Reload   | 0x01 | 'R' |   ('L' for Reload)
//!          +------+-----+
//!
//! Data     +------+-----+--------+--------+-------------+
//!          | 0x01 | 'D' | offset | length |   payload   |
//!          +------+-----+--------+--------+-------------+
//!          |  1   |  1  | u16 LE | u16 LE |   length    |
//!
//! Program  +------+-----+-----------+----------+------+----------+
//!          | 0x01 | 'P' | total len | checksum | slot | reserved |
//!          +------+-----+-----------+----------+------+----------+
//!          |  1   |  1  |  u16 LE   |  u16 LE  |  u8  |  u8 = 0  |
//! ```

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
};

/// Protocol version byte at the start of every frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of a Reset or Reload frame.
pub const COMMAND_FRAME_SIZE: usize = 2;

/// Size of the Data frame header preceding the payload.
pub const DATA_HEADER_SIZE: usize = 6;

/// Size of a Program frame.
pub const PROGRAM_FRAME_SIZE: usize = 8;

/// Command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Restart the device.
    Reset = b'R',
    /// Activate the program stored in the selected slot.
    Reload = b'L',
    /// One chunk of the bytecode image.
    Data = b'D',
    /// Commit the streamed image to a slot.
    Program = b'P',
}

impl Command {
    /// Parse a command tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'R' => Some(Self::Reset),
            b'L' => Some(Self::Reload),
            b'D' => Some(Self::Data),
            b'P' => Some(Self::Program),
            _ => None,
        }
    }

    /// Frame label used in status lines, e.g. `[D]ata`.
    pub fn label(self) -> &'static str {
        match self {
            Self::Reset => "[R]eset",
            Self::Reload => "re[L]oad",
            Self::Data => "[D]ata",
            Self::Program => "[P]rogram",
        }
    }
}

/// A single frame on the program endpoint.
///
/// Data frames borrow their payload from the image being sent, so building a
/// frame never copies more than the encoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFrame<'a> {
    /// Restart the device.
    Reset,
    /// Activate the stored program.
    Reload,
    /// One chunk of the image at `offset`.
    Data {
        /// Byte offset of this chunk within the image.
        offset: u16,
        /// Chunk bytes; the length field is derived from this slice.
        payload: &'a [u8],
    },
    /// Finalization record.
    Program {
        /// Total image length.
        total_length: u16,
        /// CRC16 over the whole image.
        checksum: u16,
        /// Target slot.
        slot: u8,
    },
}

impl TransferFrame<'_> {
    /// Get the command type.
    pub fn command(&self) -> Command {
        match self {
            Self::Reset => Command::Reset,
            Self::Reload => Command::Reload,
            Self::Data { .. } => Command::Data,
            Self::Program { .. } => Command::Program,
        }
    }

    /// Number of bytes `encode` produces.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Reset | Self::Reload => COMMAND_FRAME_SIZE,
            Self::Data { payload, .. } => DATA_HEADER_SIZE + payload.len(),
            Self::Program { .. } => PROGRAM_FRAME_SIZE,
        }
    }

    /// Build the wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(PROTOCOL_VERSION);
        buf.push(self.command() as u8);

        match *self {
            Self::Reset | Self::Reload => {},
            Self::Data { offset, payload } => {
                let length = u16::try_from(payload.len()).map_err(|_| {
                    Error::Protocol(format!(
                        "Data payload of {} bytes exceeds the 16-bit length field",
                        payload.len()
                    ))
                })?;
                buf.write_u16::<LittleEndian>(offset)?;
                buf.write_u16::<LittleEndian>(length)?;
                buf.extend_from_slice(payload);
            },
            Self::Program {
                total_length,
                checksum,
                slot,
            } => {
                buf.write_u16::<LittleEndian>(total_length)?;
                buf.write_u16::<LittleEndian>(checksum)?;
                buf.push(slot);
                buf.push(0); // reserved
            },
        }

        Ok(buf)
    }
}

impl<'a> TransferFrame<'a> {
    /// Parse a frame as the device sees it.
    ///
    /// The host never needs this; it backs the simulated device and lets
    /// tests inspect what went over the wire.
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        if data.len() < COMMAND_FRAME_SIZE {
            return Err(Error::Protocol(format!("frame too short: {} bytes", data.len())));
        }
        if data[0] != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version 0x{:02X}",
                data[0]
            )));
        }
        let command = Command::from_tag(data[1])
            .ok_or_else(|| Error::Protocol(format!("unknown command tag 0x{:02X}", data[1])))?;

        match command {
            Command::Reset => Ok(Self::Reset),
            Command::Reload => Ok(Self::Reload),
            Command::Data => {
                let header = DataHeader::parse(data)?;
                let end = DATA_HEADER_SIZE + usize::from(header.length);
                if data.len() != end {
                    return Err(Error::Protocol(format!(
                        "Data length field {} does not match payload of {} bytes",
                        header.length,
                        data.len() - DATA_HEADER_SIZE
                    )));
                }
                Ok(Self::Data {
                    offset: header.offset,
                    payload: &data[DATA_HEADER_SIZE..end],
                })
            },
            Command::Program => {
                if data.len() != PROGRAM_FRAME_SIZE {
                    return Err(Error::Protocol(format!(
                        "Program frame must be {PROGRAM_FRAME_SIZE} bytes, got {}",
                        data.len()
                    )));
                }
                Ok(Self::Program {
                    total_length: LittleEndian::read_u16(&data[2..4]),
                    checksum: LittleEndian::read_u16(&data[4..6]),
                    slot: data[6],
                })
            },
        }
    }
}

/// Offset and length fields of a Data frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Chunk offset within the image.
    pub offset: u16,
    /// Payload length.
    pub length: u16,
}

impl DataHeader {
    /// Read the header fields from the first six bytes of a Data frame.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DATA_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "Data header needs {DATA_HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        if data[1] != Command::Data as u8 {
            return Err(Error::Protocol("not a Data frame".into()));
        }
        Ok(Self {
            offset: LittleEndian::read_u16(&data[2..4]),
            length: LittleEndian::read_u16(&data[4..6]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_reload_frames() {
        assert_eq!(TransferFrame::Reset.encode().unwrap(), vec![0x01, b'R']);
        assert_eq!(TransferFrame::Reload.encode().unwrap(), vec![0x01, b'L']);
    }

    #[test]
    fn test_data_frame_layout() {
        let payload = [0xAA, 0xBB, 0xCC];
        let frame = TransferFrame::Data {
            offset: 0x1234,
            payload: &payload,
        };
        let data = frame.encode().unwrap();

        assert_eq!(data.len(), DATA_HEADER_SIZE + 3);
        assert_eq!(data.len(), frame.encoded_len());
        assert_eq!(&data[..2], &[0x01, b'D']);
        assert_eq!(&data[2..4], &[0x34, 0x12]);
        assert_eq!(&data[4..6], &[0x03, 0x00]);
        assert_eq!(&data[6..], &payload);
    }

    #[test]
    fn test_data_header_parse_recovers_fields() {
        let payload = vec![7u8; 17];
        for offset in [0u16, 17, 255, 256, 0xFFEE] {
            let data = TransferFrame::Data {
                offset,
                payload: &payload,
            }
            .encode()
            .unwrap();
            let header = DataHeader::parse(&data).unwrap();
            assert_eq!(header.offset, offset);
            assert_eq!(header.length, 17);
        }
    }

    #[test]
    fn test_program_frame_layout() {
        let frame = TransferFrame::Program {
            total_length: 100,
            checksum: 0xBEEF,
            slot: 2,
        };
        let data = frame.encode().unwrap();
        assert_eq!(data, vec![0x01, b'P', 100, 0, 0xEF, 0xBE, 2, 0]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        let frame = TransferFrame::Data {
            offset: 0,
            payload: &payload,
        };
        assert!(matches!(frame.encode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_program() {
        let bytes = [0x01, b'P', 0x10, 0x00, 0x34, 0x12, 1, 0];
        assert_eq!(
            TransferFrame::decode(&bytes).unwrap(),
            TransferFrame::Program {
                total_length: 16,
                checksum: 0x1234,
                slot: 1,
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_version_and_tag() {
        assert!(TransferFrame::decode(&[0x02, b'R']).is_err());
        assert!(TransferFrame::decode(&[0x01, b'X']).is_err());
        assert!(TransferFrame::decode(&[0x01]).is_err());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        // Length field says 4, only 2 payload bytes present.
        let bytes = [0x01, b'D', 0x00, 0x00, 0x04, 0x00, 0xAA, 0xBB];
        assert!(TransferFrame::decode(&bytes).is_err());
    }

    #[test]
    fn test_command_labels() {
        assert_eq!(Command::Data.label(), "[D]ata");
        assert_eq!(Command::Reload.label(), "re[L]oad");
        assert_eq!(Command::from_tag(b'P'), Some(Command::Program));
        assert_eq!(Command::from_tag(b'Z'), None);
    }
}
