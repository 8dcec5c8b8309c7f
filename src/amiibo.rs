// src/amiibo.rs
//! Encrypted tag image <-> plaintext codec.
//!
//! The on-tag dump ([`EncryptedImage`], 540 bytes) is first rearranged into
//! the "internal" layout used for key derivation and signing, then the
//! payload region is run through AES-128-CTR. [`PlaintextImage`] (520 bytes)
//! is that decrypted internal layout.
//!
//! Two HMAC-SHA256 tags protect the image:
//! * the tag HMAC covers the identity window, model info and keygen salt
//!   (`0x1D4..0x208`);
//! * the data HMAC covers `0x029..0x208`, which includes the tag HMAC, so the
//!   tag HMAC must always be computed first.
//!
//! Verification failure is reported, not raised: blank and test tags are
//! common and still need to decode.

use std::fmt;
use std::ops::Range;

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::keygen::{self, DerivedKeys, SEED_SIZE, hmac_sha256};
use crate::keys::KeyBundle;

pub const NTAG215_SIZE: usize = 540;
pub const AMIIBO_SIZE: usize = 520;

const HMAC_POS_DATA: usize = 0x008;
const HMAC_POS_TAG: usize = 0x1B4;
const HMAC_SIZE: usize = 32;

const PAYLOAD: Range<usize> = 0x02C..0x1B4;
const TAG_SIGNED: Range<usize> = 0x1D4..0x208;
const DATA_SIGNED: Range<usize> = 0x029..0x208;

const WRITE_COUNTER: usize = 0x029;
const SETTINGS_FLAGS: usize = 0x02C;
const COUNTRY_CODE: usize = 0x02D;
const NICKNAME: Range<usize> = 0x038..0x04C;
const MODEL_INFO: Range<usize> = 0x1DC..0x1E4;
const KEYGEN_SALT: Range<usize> = 0x1E8..0x208;

const FLAG_USER_DATA_INITIALIZED: u8 = 0x10;

/// Offset of the 8-byte identity window (raw tag pages 0 and 1).
pub const IDENTITY_OFFSET: usize = 0x1D4;
pub const IDENTITY_SIZE: usize = 8;

/// `(tag offset, internal offset, length)` for every block that moves.
const LAYOUT: [(usize, usize, usize); 7] = [
    (0x008, 0x000, 0x008),
    (0x080, 0x008, 0x020),
    (0x010, 0x028, 0x024),
    (0x0A0, 0x04C, 0x168),
    (0x034, 0x1B4, 0x020),
    (0x000, 0x1D4, 0x008),
    (0x054, 0x1DC, 0x02C),
];

/// Raw 540-byte NTAG215 dump as stored on the tag.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedImage(Box<[u8; NTAG215_SIZE]>);

impl EncryptedImage {
    pub fn new(bytes: [u8; NTAG215_SIZE]) -> Self {
        Self(Box::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; NTAG215_SIZE] =
            bytes.try_into().map_err(|_| Error::MalformedBufferLength {
                expected: NTAG215_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NTAG215_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; NTAG215_SIZE] {
        &mut self.0
    }

    /// Four bytes of page `page`, or `None` past the end of the dump.
    pub fn page(&self, page: u8) -> Option<[u8; 4]> {
        let start = page as usize * 4;
        self.0
            .get(start..start + 4)
            .map(|p| [p[0], p[1], p[2], p[3]])
    }
}

impl fmt::Debug for EncryptedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedImage")
            .field("header", &hex::encode(&self.0[..8]))
            .finish_non_exhaustive()
    }
}

/// Decrypted 520-byte amiibo data in internal layout.
#[derive(Clone, PartialEq, Eq)]
pub struct PlaintextImage(Box<[u8; AMIIBO_SIZE]>);

impl PlaintextImage {
    pub fn new(bytes: [u8; AMIIBO_SIZE]) -> Self {
        Self(Box::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; AMIIBO_SIZE] =
            bytes.try_into().map_err(|_| Error::MalformedBufferLength {
                expected: AMIIBO_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; AMIIBO_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; AMIIBO_SIZE] {
        &mut self.0
    }

    /// Raw copy of tag pages 0..1 this image was signed for.
    pub fn identity(&self) -> [u8; IDENTITY_SIZE] {
        let mut out = [0u8; IDENTITY_SIZE];
        out.copy_from_slice(&self.0[IDENTITY_OFFSET..IDENTITY_OFFSET + IDENTITY_SIZE]);
        out
    }

    pub fn set_identity(&mut self, identity: &[u8; IDENTITY_SIZE]) {
        self.0[IDENTITY_OFFSET..IDENTITY_OFFSET + IDENTITY_SIZE].copy_from_slice(identity);
    }

    /// 7-byte UID, skipping BCC0 at window byte 3.
    pub fn uid(&self) -> [u8; 7] {
        let id = self.identity();
        [id[0], id[1], id[2], id[4], id[5], id[6], id[7]]
    }

    /// Character/variant/series block, the "amiibo id".
    pub fn model_info(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[MODEL_INFO]);
        out
    }

    pub fn keygen_salt(&self) -> &[u8] {
        &self.0[KEYGEN_SALT]
    }

    pub fn write_counter(&self) -> u16 {
        u16::from_be_bytes([self.0[WRITE_COUNTER], self.0[WRITE_COUNTER + 1]])
    }

    pub fn settings_flags(&self) -> u8 {
        self.0[SETTINGS_FLAGS]
    }

    pub fn country_code(&self) -> u8 {
        self.0[COUNTRY_CODE]
    }

    pub fn is_user_data_initialized(&self) -> bool {
        self.settings_flags() & FLAG_USER_DATA_INITIALIZED != 0
    }

    /// Owner-assigned nickname (UTF-16BE, NUL padded).
    pub fn nickname(&self) -> String {
        let units: Vec<u16> = self.0[NICKNAME]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    pub fn info(&self) -> AmiiboInfo {
        AmiiboInfo {
            uid: hex::encode(self.uid()),
            model_info: hex::encode(self.model_info()),
            nickname: self.nickname(),
            write_counter: self.write_counter(),
            initialized: self.is_user_data_initialized(),
        }
    }
}

impl fmt::Debug for PlaintextImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaintextImage")
            .field("uid", &hex::encode(self.uid()))
            .field("model_info", &hex::encode(self.model_info()))
            .finish_non_exhaustive()
    }
}

/// Summary of a decoded image, as reported to clients.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AmiiboInfo {
    pub uid: String,
    pub model_info: String,
    pub nickname: String,
    pub write_counter: u16,
    pub initialized: bool,
}

/// Result of [`unpack`]. `verified` is false when either HMAC did not match.
#[derive(Clone, Debug)]
pub struct Unpacked {
    pub plaintext: PlaintextImage,
    pub verified: bool,
}

impl Unpacked {
    /// Strict variant: refuse plaintext whose signature did not check out.
    pub fn into_verified(self) -> Result<PlaintextImage> {
        if self.verified {
            Ok(self.plaintext)
        } else {
            Err(Error::VerificationMismatch)
        }
    }
}

fn tag_to_internal(tag: &[u8; NTAG215_SIZE]) -> [u8; AMIIBO_SIZE] {
    let mut internal = [0u8; AMIIBO_SIZE];
    for &(tag_off, int_off, len) in LAYOUT.iter() {
        internal[int_off..int_off + len].copy_from_slice(&tag[tag_off..tag_off + len]);
    }
    internal
}

fn internal_to_tag(internal: &[u8; AMIIBO_SIZE]) -> [u8; NTAG215_SIZE] {
    let mut tag = [0u8; NTAG215_SIZE];
    for &(tag_off, int_off, len) in LAYOUT.iter() {
        tag[tag_off..tag_off + len].copy_from_slice(&internal[int_off..int_off + len]);
    }
    tag
}

fn base_seed(internal: &[u8; AMIIBO_SIZE]) -> [u8; SEED_SIZE] {
    let mut seed = [0u8; SEED_SIZE];
    seed[0x00..0x02].copy_from_slice(&internal[WRITE_COUNTER..WRITE_COUNTER + 2]);
    seed[0x10..0x18].copy_from_slice(&internal[IDENTITY_OFFSET..IDENTITY_OFFSET + 8]);
    seed[0x18..0x20].copy_from_slice(&internal[IDENTITY_OFFSET..IDENTITY_OFFSET + 8]);
    seed[0x20..0x40].copy_from_slice(&internal[KEYGEN_SALT]);
    seed
}

// AES-128-CTR with a 128-bit big-endian counter starting at `iv`.
fn aes_ctr(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let cipher = Aes128::new(key.into());
    let mut counter = u128::from_be_bytes(*iv);
    for chunk in data.chunks_mut(16) {
        let mut keystream = counter.to_be_bytes();
        cipher.encrypt_block((&mut keystream).into());
        for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
            *b ^= k;
        }
        counter = counter.wrapping_add(1);
    }
}

/// Transforms the payload and copies the cleartext regions. Both HMAC slots
/// are left zeroed.
fn cipher(keys: &DerivedKeys, input: &[u8; AMIIBO_SIZE]) -> [u8; AMIIBO_SIZE] {
    let mut out = [0u8; AMIIBO_SIZE];
    out[PAYLOAD].copy_from_slice(&input[PAYLOAD]);
    aes_ctr(&keys.aes_key, &keys.aes_iv, &mut out[PAYLOAD]);

    out[0x000..0x008].copy_from_slice(&input[0x000..0x008]);
    out[0x028..0x02C].copy_from_slice(&input[0x028..0x02C]);
    out[TAG_SIGNED].copy_from_slice(&input[TAG_SIGNED]);
    out
}

/// Decrypts `image` and checks both signatures.
pub fn unpack(image: &EncryptedImage, keys: &KeyBundle) -> Unpacked {
    let internal = tag_to_internal(image.as_bytes());
    let seed = base_seed(&internal);
    let data_keys = keygen::derive(&keys.data, &seed);
    let tag_keys = keygen::derive(&keys.tag, &seed);

    let mut plain = cipher(&data_keys, &internal);

    let tag_hmac = hmac_sha256(&tag_keys.hmac_key, &[&plain[TAG_SIGNED]]);
    plain[HMAC_POS_TAG..HMAC_POS_TAG + HMAC_SIZE].copy_from_slice(&tag_hmac);

    let data_hmac = hmac_sha256(&data_keys.hmac_key, &[&plain[DATA_SIGNED]]);
    plain[HMAC_POS_DATA..HMAC_POS_DATA + HMAC_SIZE].copy_from_slice(&data_hmac);

    let verified = internal[HMAC_POS_DATA..HMAC_POS_DATA + HMAC_SIZE] == data_hmac
        && internal[HMAC_POS_TAG..HMAC_POS_TAG + HMAC_SIZE] == tag_hmac;

    Unpacked {
        plaintext: PlaintextImage::new(plain),
        verified,
    }
}

/// Encrypts and signs `plain`. Pages 130..134 (lock, config, PWD, PACK) come
/// out zeroed; the transport never writes them.
pub fn pack(plain: &PlaintextImage, keys: &KeyBundle) -> EncryptedImage {
    let plain = plain.as_bytes();
    let seed = base_seed(plain);
    let tag_keys = keygen::derive(&keys.tag, &seed);
    let data_keys = keygen::derive(&keys.data, &seed);

    let tag_hmac = hmac_sha256(&tag_keys.hmac_key, &[&plain[TAG_SIGNED]]);
    let data_hmac = hmac_sha256(
        &data_keys.hmac_key,
        &[&plain[DATA_SIGNED.start..HMAC_POS_TAG], &tag_hmac[..], &plain[TAG_SIGNED]],
    );

    let mut internal = cipher(&data_keys, plain);
    internal[HMAC_POS_TAG..HMAC_POS_TAG + HMAC_SIZE].copy_from_slice(&tag_hmac);
    internal[HMAC_POS_DATA..HMAC_POS_DATA + HMAC_SIZE].copy_from_slice(&data_hmac);

    EncryptedImage::new(internal_to_tag(&internal))
}

/// [`unpack`] over a raw buffer, which must be exactly 540 bytes.
pub fn unpack_bytes(image: &[u8], keys: &KeyBundle) -> Result<Unpacked> {
    Ok(unpack(&EncryptedImage::from_slice(image)?, keys))
}

/// [`pack`] over a raw buffer, which must be exactly 520 bytes.
pub fn pack_bytes(plain: &[u8], keys: &KeyBundle) -> Result<EncryptedImage> {
    Ok(pack(&PlaintextImage::from_slice(plain)?, keys))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::tests::test_keys;

    /// Deterministic plaintext with every field populated.
    pub(crate) fn sample_plaintext() -> PlaintextImage {
        let mut bytes = [0u8; AMIIBO_SIZE];
        let mut x: u32 = 0x1234_5678;
        for b in bytes.iter_mut() {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            *b = x as u8;
        }
        bytes[0x028] = 0xA5;
        bytes[WRITE_COUNTER..WRITE_COUNTER + 2].copy_from_slice(&0x0102u16.to_be_bytes());
        bytes[SETTINGS_FLAGS] = FLAG_USER_DATA_INITIALIZED;
        bytes[NICKNAME].fill(0);
        for (i, u) in "Link".encode_utf16().enumerate() {
            bytes[NICKNAME.start + i * 2..NICKNAME.start + i * 2 + 2]
                .copy_from_slice(&u.to_be_bytes());
        }
        bytes[IDENTITY_OFFSET..IDENTITY_OFFSET + 8]
            .copy_from_slice(&[0x04, 0xA1, 0xB2, 0x9F, 0xC3, 0xD4, 0xE5, 0xF6]);
        PlaintextImage::new(bytes)
    }

    fn without_hmacs(bytes: &[u8; AMIIBO_SIZE]) -> Vec<u8> {
        let mut v = bytes.to_vec();
        v[HMAC_POS_DATA..HMAC_POS_DATA + HMAC_SIZE].fill(0);
        v[HMAC_POS_TAG..HMAC_POS_TAG + HMAC_SIZE].fill(0);
        v
    }

    #[test]
    fn layout_conversion_is_inverse() {
        let mut tag = [0u8; NTAG215_SIZE];
        for (i, b) in tag.iter_mut().enumerate().take(AMIIBO_SIZE) {
            *b = (i * 7) as u8;
        }
        let back = internal_to_tag(&tag_to_internal(&tag));
        assert_eq!(&back[..AMIIBO_SIZE], &tag[..AMIIBO_SIZE]);
    }

    #[test]
    fn layout_covers_internal_buffer_once() {
        let mut seen = [0u8; AMIIBO_SIZE];
        for &(_, int_off, len) in LAYOUT.iter() {
            for s in &mut seen[int_off..int_off + len] {
                *s += 1;
            }
        }
        assert!(seen.iter().all(|&s| s == 1));
    }

    #[test]
    fn ctr_counter_carries_across_bytes() {
        // Two calls that straddle a counter carry must equal one long call.
        let key = [0x2Bu8; 16];
        let mut iv = [0xFFu8; 16];
        iv[0] = 0x00;
        let mut whole = [0u8; 48];
        aes_ctr(&key, &iv, &mut whole);

        let mut next = u128::from_be_bytes(iv).wrapping_add(1).to_be_bytes();
        let mut tail = [0u8; 32];
        aes_ctr(&key, &next, &mut tail);
        assert_eq!(&whole[16..], &tail);
        assert_eq!(next[0], 0x01);
        next[0] = 0;
        assert!(next.iter().all(|&b| b == 0));
    }

    #[test]
    fn aes_block_matches_fips197() {
        // FIPS-197 C.1 via CTR: keystream block 0 is E(key, iv).
        let key: [u8; 16] = core::array::from_fn(|i| i as u8);
        let iv: [u8; 16] = core::array::from_fn(|i| (i as u8) * 0x11);
        let mut block = [0u8; 16];
        aes_ctr(&key, &iv, &mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn round_trip_verifies() {
        let keys = test_keys();
        let plain = sample_plaintext();

        let first = unpack(&pack(&plain, &keys), &keys);
        assert!(first.verified);
        assert_eq!(without_hmacs(first.plaintext.as_bytes()), without_hmacs(plain.as_bytes()));

        let second = unpack(&pack(&first.plaintext, &keys), &keys);
        assert!(second.verified);
        assert_eq!(second.plaintext, first.plaintext);
    }

    #[test]
    fn pack_encrypts_payload_and_keeps_identity_in_clear() {
        let keys = test_keys();
        let plain = sample_plaintext();
        let image = pack(&plain, &keys);
        let tag = image.as_bytes();

        assert_eq!(&tag[0..8], &plain.identity());
        assert_eq!(&tag[0x54..0x5C], &plain.model_info());
        // internal 0x04C.. lands at tag 0x0A0 and is ciphertext
        assert_ne!(&tag[0x0A0..0x0C0], &plain.as_bytes()[0x04C..0x06C]);
        assert!(tag[0x208..].iter().all(|&b| b == 0));
    }

    #[test]
    fn tamper_is_flagged_not_raised() {
        let keys = test_keys();
        let image = pack(&sample_plaintext(), &keys);

        // Everything except pages 2..3, the 0xA5 magic and the config tail is signed.
        let signed = (0x000..0x008).chain(0x011..0x208);
        for offset in signed.step_by(5) {
            let mut tampered = image.clone();
            tampered.as_bytes_mut()[offset] ^= 0x01;
            let out = unpack(&tampered, &keys);
            assert!(!out.verified, "flip at {offset:#05x} went unnoticed");
        }
    }

    #[test]
    fn unverified_plaintext_still_decodes() {
        let keys = test_keys();
        let out = unpack(&EncryptedImage::new([0u8; NTAG215_SIZE]), &keys);
        assert!(!out.verified);
        assert_eq!(out.plaintext.as_bytes().len(), AMIIBO_SIZE);
        assert!(matches!(out.into_verified(), Err(Error::VerificationMismatch)));
    }

    #[test]
    fn rejects_wrong_lengths() {
        let keys = test_keys();
        let err = unpack_bytes(&[0u8; 539], &keys).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedBufferLength { expected: 540, actual: 539 }
        ));
        let err = pack_bytes(&[0u8; 540], &keys).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedBufferLength { expected: 520, actual: 540 }
        ));
        assert!(pack_bytes(&[0u8; 520], &keys).is_ok());
    }

    #[test]
    fn field_accessors() {
        let plain = sample_plaintext();
        assert_eq!(plain.uid(), [0x04, 0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);
        assert_eq!(plain.write_counter(), 0x0102);
        assert_eq!(plain.nickname(), "Link");
        assert!(plain.is_user_data_initialized());

        let info = plain.info();
        assert_eq!(info.uid, "04a1b2c3d4e5f6");
        assert_eq!(info.nickname, "Link");
    }
}
