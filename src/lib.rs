// src/lib.rs
//! Amiibo image codec and NTAG215 writer.
//!
//! [`amiibo`] turns 540-byte tag dumps into plaintext and back using the
//! retail keys from [`keys`]. [`transport`] moves images on and off a tag
//! over any [`transport::Exchange`] link; [`reader`] provides that link for
//! PC/SC readers. The rest wires this into a small WebSocket service.

pub mod amiibo;
pub mod checksum;
pub mod config;
pub mod error;
pub mod keygen;
pub mod keys;
pub mod library;
pub mod nfc_service;
pub mod reader;
pub mod transport;
pub mod types;
pub mod ws;

pub use error::{Error, Result};
