// src/types.rs
use serde::{Deserialize, Serialize};

use crate::amiibo::AmiiboInfo;

// Messages sent TO the WebSocket client
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingMessage {
    ReaderStatus { success: bool },
    CardStatus { success: bool, message: String },
    ImageList { images: Vec<String> },
    ImageSelected { name: String, info: AmiiboInfo, verified: bool },
    WriteArmed { armed: bool },
    TagRead { info: AmiiboInfo, verified: bool },
    ReadError { error: String, page: Option<u8> },
    WriteSuccess { message: String },
    WriteError { error: String, page: Option<u8> },
    ReaderError { error: String },
    Error { error: String },
}

// Messages received FROM the WebSocket client
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingMessage {
    GetReaderStatus,
    ListImages,
    SelectImage { name: String },
    ArmWrite,
    Disarm,
}

// Internal commands sent from WS Server -> NFC Thread
#[derive(Debug, PartialEq, Eq)]
pub enum NfcCommand {
    CheckReaderStatus,
    ListImages,
    Select { name: String },
    Arm(bool),
}

impl From<IncomingMessage> for NfcCommand {
    fn from(msg: IncomingMessage) -> Self {
        match msg {
            IncomingMessage::GetReaderStatus => NfcCommand::CheckReaderStatus,
            IncomingMessage::ListImages => NfcCommand::ListImages,
            IncomingMessage::SelectImage { name } => NfcCommand::Select { name },
            IncomingMessage::ArmWrite => NfcCommand::Arm(true),
            IncomingMessage::Disarm => NfcCommand::Arm(false),
        }
    }
}
