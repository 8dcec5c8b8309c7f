// src/reader.rs
//! PC/SC driver for the transport.
//!
//! Contactless readers speaking PC/SC part 3 (ACR122U and friends) do their
//! own framing, so raw MIFARE commands are mapped onto the storage-card
//! pseudo-APDUs:
//!
//! * `30 pp`            -> `FF B0 00 pp 10`  (READ BINARY, 16 bytes)
//! * `A2 pp d0..d3 crc` -> `FF D6 00 pp 04 d0..d3` (UPDATE BINARY, one page)
//!
//! The CRC on write commands is checked and dropped here; the reader appends
//! its own on the air interface.
use log::{debug, warn};
use pcsc::{Card, MAX_BUFFER_SIZE};

use crate::checksum::strip_crc;
use crate::error::ExchangeError;
use crate::transport::{CMD_READ, CMD_WRITE, Exchange, PAGE_SIZE, READ_BLOCK_SIZE, TagFamily};

// Legacy "last ATR byte" markers, kept as a fallback for readers that do not
// report a PC/SC part 3 ATR.
pub const CARD_TYPE_MIFARE_1K: u8 = 0x6A;
pub const CARD_TYPE_NTAG: u8 = 0x68;

const PCSC_RID: [u8; 5] = [0xA0, 0x00, 0x00, 0x03, 0x06];
const DESFIRE_ATR: [u8; 6] = [0x3B, 0x81, 0x80, 0x01, 0x80, 0x80];

/// Reader-to-host ACK for a completed page write.
const WRITE_ACK: u8 = 0x0A;

/// Chip family from an ATR.
///
/// Storage-card ATRs carry a two-byte card name after the PC/SC RID:
/// `3B 8F 80 01 80 4F 0C A0 00 00 03 06 SS NN NN 00 00 00 00 TCK`.
pub fn family_from_atr(atr: &[u8]) -> TagFamily {
    if atr.starts_with(&DESFIRE_ATR) {
        return TagFamily::Desfire;
    }
    if atr.len() >= 15 && atr[7..12] == PCSC_RID {
        return match u16::from_be_bytes([atr[13], atr[14]]) {
            0x0001 | 0x0002 | 0x0026 => TagFamily::Classic,
            0x0003 | 0x003A => TagFamily::Ultralight,
            0x0036..=0x0039 => TagFamily::Plus,
            _ => TagFamily::Unknown,
        };
    }
    match atr.last() {
        Some(&CARD_TYPE_NTAG) => TagFamily::Ultralight,
        Some(&CARD_TYPE_MIFARE_1K) => TagFamily::Classic,
        _ => TagFamily::Unknown,
    }
}

pub fn read_binary_apdu(page: u8, length: u8) -> [u8; 5] {
    [0xFF, 0xB0, 0x00, page, length]
}

pub fn update_binary_apdu(page: u8, data: &[u8]) -> Vec<u8> {
    let mut apdu = vec![0xFF, 0xD6, 0x00, page, data.len() as u8];
    apdu.extend_from_slice(data);
    apdu
}

/// Strips the status word, failing unless it is `90 00`.
pub fn check_status(resp: &[u8]) -> Result<&[u8], ExchangeError> {
    match resp {
        [data @ .., 0x90, 0x00] => Ok(data),
        [.., sw1, sw2] => Err(ExchangeError::Status(*sw1, *sw2)),
        _ => Err(ExchangeError::Status(0, 0)),
    }
}

fn transmit(card: &Card, apdu: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let mut recv_buffer = [0u8; MAX_BUFFER_SIZE];
    let resp = card.transmit(apdu, &mut recv_buffer).map_err(|e| match e {
        pcsc::Error::RemovedCard | pcsc::Error::ResetCard | pcsc::Error::NoSmartcard => {
            ExchangeError::SessionLost
        }
        other => ExchangeError::Pcsc(other),
    })?;
    Ok(check_status(resp)?.to_vec())
}

/// One connected card, exposed as an [`Exchange`] link.
pub struct PcscLink<'a> {
    card: &'a Card,
    family: TagFamily,
}

impl<'a> PcscLink<'a> {
    pub fn new(card: &'a Card) -> Self {
        let mut names_buf = [0u8; 128];
        let mut atr_buf = [0u8; 64];
        let family = match card.status2(&mut names_buf, &mut atr_buf) {
            Ok(status) => {
                debug!("ATR {}", hex::encode(status.atr()));
                family_from_atr(status.atr())
            }
            Err(e) => {
                warn!("Could not read card status: {}", e);
                TagFamily::Unknown
            }
        };
        Self { card, family }
    }
}

impl Exchange for PcscLink<'_> {
    fn family(&self) -> TagFamily {
        self.family
    }

    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        match command {
            [CMD_READ, page] => {
                transmit(self.card, &read_binary_apdu(*page, READ_BLOCK_SIZE as u8))
            }
            [CMD_WRITE, ..] => {
                let body = strip_crc(command).ok_or(ExchangeError::Checksum)?;
                if body.len() != 2 + PAGE_SIZE {
                    return Err(ExchangeError::UnsupportedCommand(CMD_WRITE));
                }
                transmit(self.card, &update_binary_apdu(body[1], &body[2..]))?;
                Ok(vec![WRITE_ACK])
            }
            [op, ..] => Err(ExchangeError::UnsupportedCommand(*op)),
            [] => Err(ExchangeError::UnsupportedCommand(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ultralight_atr() {
        let atr = hex::decode("3b8f8001804f0ca0000003060300030000000068").unwrap();
        assert_eq!(family_from_atr(&atr), TagFamily::Ultralight);
    }

    #[test]
    fn classic_atr() {
        let atr = hex::decode("3b8f8001804f0ca000000306030001000000006a").unwrap();
        assert_eq!(family_from_atr(&atr), TagFamily::Classic);
    }

    #[test]
    fn desfire_and_fallback() {
        assert_eq!(
            family_from_atr(&[0x3B, 0x81, 0x80, 0x01, 0x80, 0x80]),
            TagFamily::Desfire
        );
        assert_eq!(family_from_atr(&[0x3B, 0x00, 0x68]), TagFamily::Ultralight);
        assert_eq!(family_from_atr(&[]), TagFamily::Unknown);
    }

    #[test]
    fn apdus() {
        assert_eq!(read_binary_apdu(4, 16), [0xFF, 0xB0, 0x00, 0x04, 0x10]);
        assert_eq!(
            update_binary_apdu(9, &[1, 2, 3, 4]),
            vec![0xFF, 0xD6, 0x00, 0x09, 0x04, 1, 2, 3, 4]
        );
    }

    #[test]
    fn status_words() {
        assert_eq!(check_status(&[0xAB, 0x90, 0x00]).unwrap(), &[0xAB]);
        assert!(check_status(&[0x90, 0x00]).unwrap().is_empty());
        assert!(matches!(
            check_status(&[0x63, 0x00]),
            Err(ExchangeError::Status(0x63, 0x00))
        ));
        assert!(matches!(check_status(&[0x90]), Err(ExchangeError::Status(0, 0))));
    }
}
