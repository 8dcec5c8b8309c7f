// src/keygen.rs
//! Per-tag key derivation.
//!
//! A master key and a 64-byte seed taken from the tag are combined into a
//! "prepared seed", which keys nothing by itself: it is the message fed to an
//! HMAC-SHA256 counter DRBG keyed with the master key's `hmac_key`. Output
//! block `i` is `HMAC(hmac_key, be16(i) || prepared_seed)`; the first 48 bytes
//! of the stream become the AES key, the CTR IV and the HMAC key.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::MasterKey;

type HmacSha256 = Hmac<Sha256>;

pub const SEED_SIZE: usize = 64;
const DRBG_OUTPUT_SIZE: usize = 32;

/// Short-lived key material for one pack/unpack call.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
    pub hmac_key: [u8; 16],
}

impl DerivedKeys {
    fn from_stream(stream: &[u8; 48]) -> Self {
        let mut keys = Self {
            aes_key: [0; 16],
            aes_iv: [0; 16],
            hmac_key: [0; 16],
        };
        keys.aes_key.copy_from_slice(&stream[0..16]);
        keys.aes_iv.copy_from_slice(&stream[16..32]);
        keys.hmac_key.copy_from_slice(&stream[32..48]);
        keys
    }
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

struct Drbg<'a> {
    key: &'a [u8],
    seed: &'a [u8],
    iteration: u16,
}

impl<'a> Drbg<'a> {
    fn new(key: &'a [u8], seed: &'a [u8]) -> Self {
        Self {
            key,
            seed,
            iteration: 0,
        }
    }

    fn step(&mut self) -> [u8; DRBG_OUTPUT_SIZE] {
        let counter = self.iteration.to_be_bytes();
        self.iteration = self.iteration.wrapping_add(1);
        hmac_sha256(self.key, &[&counter[..], self.seed])
    }

    fn fill(&mut self, out: &mut [u8]) {
        for chunk in out.chunks_mut(DRBG_OUTPUT_SIZE) {
            let block = self.step();
            chunk.copy_from_slice(&block[..chunk.len()]);
        }
    }
}

fn prepare_seed(master: &MasterKey, seed: &[u8; SEED_SIZE]) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + 16 + 16 + 32);
    out.extend_from_slice(master.type_string());

    let leading = 16 - master.magic().len();
    out.extend_from_slice(&seed[..leading]);
    out.extend_from_slice(master.magic());
    out.extend_from_slice(&seed[0x10..0x20]);
    out.extend(
        seed[0x20..0x40]
            .iter()
            .zip(master.xor_pad.iter())
            .map(|(s, p)| s ^ p),
    );
    out
}

pub fn derive(master: &MasterKey, seed: &[u8; SEED_SIZE]) -> DerivedKeys {
    let prepared = prepare_seed(master, seed);
    let mut stream = [0u8; 48];
    Drbg::new(&master.hmac_key, &prepared).fill(&mut stream);
    DerivedKeys::from_stream(&stream)
}
