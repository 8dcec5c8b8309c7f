// src/checksum.rs
//! ISO/IEC 14443-3 type A frame CRC (CRC_A).
//!
//! Reflected CCITT: polynomial 0x8408 in LSB-first form (0x1021 normal), the
//! register starting at 0x6363, no final XOR. Appended low byte first.

use crc::{CRC_16_ISO_IEC_14443_3_A, Crc};

const CRC_A: Crc<u16> = Crc::<u16>::new(&CRC_16_ISO_IEC_14443_3_A);

pub fn crc16(data: &[u8]) -> u16 {
    CRC_A.checksum(data)
}

/// Returns `data` followed by its CRC_A, little-endian.
pub fn append_crc(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&crc16(data).to_le_bytes());
    frame
}

/// Splits a framed command into its body, or `None` if the trailing CRC is
/// missing or wrong.
pub fn strip_crc(frame: &[u8]) -> Option<&[u8]> {
    let split = frame.len().checked_sub(2)?;
    let (body, crc) = frame.split_at(split);
    (crc16(body).to_le_bytes() == crc).then_some(body)
}
