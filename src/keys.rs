// src/keys.rs
//! Retail master keys.
//!
//! The key file is the 160-byte blob amiitool calls `key_retail.bin`: two
//! 80-byte master keys back to back, `data` ("unfixed infos") first and
//! `tag` ("locked secret") second. Each master key is laid out as
//!
//! ```text
//! 0x00  hmac_key     16  DRBG key
//! 0x10  type_string  14  NUL-terminated
//! 0x1E  rfu           1
//! 0x1F  magic_len     1  <= 16
//! 0x20  magic        16
//! 0x30  xor_pad      32
//! ```
//!
//! A [`KeyBundle`] can only be obtained through the validating loaders, so
//! holding one means both halves were fully read.

use std::fs;
use std::path::Path;

use crate::error::KeyLoadError;

pub const MASTER_KEY_SIZE: usize = 80;
pub const KEY_FILE_SIZE: usize = MASTER_KEY_SIZE * 2;

#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    pub(crate) hmac_key: [u8; 16],
    pub(crate) type_string: [u8; 14],
    pub(crate) magic_len: u8,
    pub(crate) magic: [u8; 16],
    pub(crate) xor_pad: [u8; 32],
}

impl MasterKey {
    fn parse(name: &'static str, raw: &[u8; MASTER_KEY_SIZE]) -> Result<Self, KeyLoadError> {
        let mut hmac_key = [0u8; 16];
        let mut type_string = [0u8; 14];
        let mut magic = [0u8; 16];
        let mut xor_pad = [0u8; 32];
        hmac_key.copy_from_slice(&raw[0x00..0x10]);
        type_string.copy_from_slice(&raw[0x10..0x1E]);
        let magic_len = raw[0x1F];
        magic.copy_from_slice(&raw[0x20..0x30]);
        xor_pad.copy_from_slice(&raw[0x30..0x50]);

        if magic_len > 16 {
            return Err(KeyLoadError::MagicLength { key: name, len: magic_len });
        }
        if !type_string.contains(&0) {
            return Err(KeyLoadError::TypeString { key: name });
        }

        Ok(Self {
            hmac_key,
            type_string,
            magic_len,
            magic,
            xor_pad,
        })
    }

    /// Type string including its terminating NUL.
    pub fn type_string(&self) -> &[u8] {
        let end = self
            .type_string
            .iter()
            .position(|&b| b == 0)
            .map_or(self.type_string.len(), |p| p + 1);
        &self.type_string[..end]
    }

    pub fn magic(&self) -> &[u8] {
        &self.magic[..self.magic_len as usize]
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("type_string", &String::from_utf8_lossy(self.type_string()))
            .field("magic_len", &self.magic_len)
            .finish_non_exhaustive()
    }
}

/// Both master keys needed by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    pub data: MasterKey,
    pub tag: MasterKey,
}

impl KeyBundle {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, KeyLoadError> {
        let raw: &[u8; KEY_FILE_SIZE] = raw.try_into().map_err(|_| KeyLoadError::Length {
            expected: KEY_FILE_SIZE,
            actual: raw.len(),
        })?;
        let mut data = [0u8; MASTER_KEY_SIZE];
        let mut tag = [0u8; MASTER_KEY_SIZE];
        data.copy_from_slice(&raw[..MASTER_KEY_SIZE]);
        tag.copy_from_slice(&raw[MASTER_KEY_SIZE..]);

        Ok(Self {
            data: MasterKey::parse("data", &data)?,
            tag: MasterKey::parse("tag", &tag)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyLoadError> {
        let raw = fs::read(path)?;
        Self::from_bytes(&raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn master(type_string: &[u8], magic_len: u8, fill: u8) -> [u8; MASTER_KEY_SIZE] {
        let mut raw = [0u8; MASTER_KEY_SIZE];
        for (i, b) in raw[0x00..0x10].iter_mut().enumerate() {
            *b = fill.wrapping_add(i as u8);
        }
        raw[0x10..0x10 + type_string.len()].copy_from_slice(type_string);
        raw[0x1F] = magic_len;
        for (i, b) in raw[0x20..0x30].iter_mut().enumerate() {
            *b = 0xD0 ^ fill ^ i as u8;
        }
        for (i, b) in raw[0x30..0x50].iter_mut().enumerate() {
            *b = fill.wrapping_mul(3).wrapping_add(i as u8 * 7);
        }
        raw
    }

    /// Synthetic key file with the retail shape (not the retail secrets).
    pub(crate) fn test_key_file() -> Vec<u8> {
        let mut raw = Vec::with_capacity(KEY_FILE_SIZE);
        raw.extend_from_slice(&master(b"unfixed infos\0", 14, 0x10));
        raw.extend_from_slice(&master(b"locked secret\0", 16, 0x40));
        raw
    }

    pub(crate) fn test_keys() -> KeyBundle {
        KeyBundle::from_bytes(&test_key_file()).unwrap()
    }

    #[test]
    fn parses_both_halves() {
        let keys = test_keys();
        assert_eq!(keys.data.type_string(), b"unfixed infos\0");
        assert_eq!(keys.tag.type_string(), b"locked secret\0");
        assert_eq!(keys.data.magic().len(), 14);
        assert_eq!(keys.tag.magic().len(), 16);
        assert_eq!(keys.data.hmac_key[0], 0x10);
        assert_eq!(keys.tag.xor_pad[1], 0x40u8.wrapping_mul(3) + 7);
    }

    #[test]
    fn rejects_truncated_file() {
        let raw = test_key_file();
        let err = KeyBundle::from_bytes(&raw[..159]).unwrap_err();
        assert!(matches!(err, KeyLoadError::Length { expected: 160, actual: 159 }));
    }

    #[test]
    fn rejects_oversized_magic() {
        let mut raw = test_key_file();
        raw[MASTER_KEY_SIZE + 0x1F] = 17;
        let err = KeyBundle::from_bytes(&raw).unwrap_err();
        assert!(matches!(err, KeyLoadError::MagicLength { key: "tag", len: 17 }));
    }

    #[test]
    fn rejects_unterminated_type_string() {
        let mut raw = test_key_file();
        raw[0x10..0x1E].copy_from_slice(b"unfixed infosX");
        let err = KeyBundle::from_bytes(&raw).unwrap_err();
        assert!(matches!(err, KeyLoadError::TypeString { key: "data" }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KeyBundle::load(dir.path().join("key_retail.bin")).unwrap_err();
        assert!(matches!(err, KeyLoadError::Io(_)));
    }

    #[test]
    fn debug_hides_key_material() {
        let out = format!("{:?}", test_keys());
        assert!(out.contains("locked secret"));
        assert!(!out.contains("hmac_key"));
    }
}
