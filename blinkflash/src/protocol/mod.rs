//! Wire protocol: frame codec and image checksum.

pub mod crc;
pub mod frame;

// Re-export common types
pub use crc::crc16;
pub use frame::{
    COMMAND_FRAME_SIZE, Command, DATA_HEADER_SIZE, DataHeader, PROGRAM_FRAME_SIZE,
    PROTOCOL_VERSION, TransferFrame,
};
