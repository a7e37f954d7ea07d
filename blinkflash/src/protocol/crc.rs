//! CRC16 checksum carried by the Program frame.
//!
//! Polynomial 0xD175 in reflected (LSB-first) form, seed 0xFFFF, no final
//! XOR. The device recomputes the same value over the received image before
//! committing it to a slot.

/// Reflected polynomial.
pub const CRC16_POLY: u16 = 0xD175;

/// Initial register value. Also the checksum of an empty buffer.
pub const CRC16_SEED: u16 = 0xFFFF;

/// Calculate the image checksum.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_reflect(CRC16_POLY, CRC16_SEED, data)
}

/// Reflected CRC16 over `data` with an arbitrary polynomial and seed.
pub fn crc16_reflect(poly: u16, seed: u16, data: &[u8]) -> u16 {
    let mut crc = seed;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_empty_is_seed() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc16_deterministic() {
        let data = b"puts 'hello'";
        assert_eq!(crc16(data), crc16(data));
    }

    #[test]
    fn test_crc16_known_answers() {
        assert_eq!(crc16(b"123456789"), 0x97DE);
        assert_eq!(crc16(&[0x00]), 0xEFE9);
        assert_eq!(crc16(b"RITE0300"), 0xECFB);
    }

    #[test]
    fn test_crc16_detects_single_bit_flip() {
        let data = vec![0x5Au8; 100];
        let mut flipped = data.clone();
        flipped[42] ^= 0x01;
        assert_ne!(crc16(&data), crc16(&flipped));
    }

    #[test]
    fn test_crc16_order_sensitive() {
        assert_ne!(crc16(b"AB"), crc16(b"BA"));
    }

    #[test]
    fn test_crc16_reflect_zero_poly_is_shift() {
        // With a zero polynomial the register just shifts out one byte per input.
        assert_eq!(crc16_reflect(0, 0xFFFF, &[0x00]), 0x00FF);
    }
}
