// src/nfc_service.rs
use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use pcsc::{Context, PNP_NOTIFICATION, Protocols, ReaderState, Scope, ShareMode, State};
use std::ffi::{CStr, CString};
use std::sync::Arc;
use std::time::Duration;

use crate::amiibo::{self, PlaintextImage};
use crate::error::Result;
use crate::keys::KeyBundle;
use crate::library::ImageLibrary;
use crate::reader::PcscLink;
use crate::transport::{Exchange, TagSession};
use crate::types::{NfcCommand, OutgoingMessage};

/// Image queued for writing, already decoded.
#[derive(Debug, Clone)]
pub struct Selected {
    pub name: String,
    pub plaintext: PlaintextImage,
}

/// Everything the NFC thread owns. Only this thread touches the reader, so
/// tag sessions never overlap.
pub struct ServiceState {
    keys: Arc<KeyBundle>,
    library: ImageLibrary,
    selected: Option<Selected>,
    write_armed: bool,
}

impl ServiceState {
    pub fn new(keys: Arc<KeyBundle>, library: ImageLibrary) -> Self {
        Self {
            keys,
            library,
            selected: None,
            write_armed: false,
        }
    }

    pub fn selected(&self) -> Option<&Selected> {
        self.selected.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.write_armed
    }

    pub fn list_images(&self) -> OutgoingMessage {
        match self.library.list() {
            Ok(images) => OutgoingMessage::ImageList { images },
            Err(e) => OutgoingMessage::Error {
                error: e.to_string(),
            },
        }
    }

    /// Loads and decodes `name` from the library and makes it the write
    /// source. An unverified image is still selected.
    pub fn select(&mut self, name: &str) -> Result<OutgoingMessage> {
        let image = self.library.load(name)?;
        let unpacked = amiibo::unpack(&image, &self.keys);
        if !unpacked.verified {
            warn!("Tag signature was NOT valid for {}", name);
        }
        let info = unpacked.plaintext.info();
        info!("{} selected", name);
        self.selected = Some(Selected {
            name: name.to_owned(),
            plaintext: unpacked.plaintext,
        });
        Ok(OutgoingMessage::ImageSelected {
            name: name.to_owned(),
            info,
            verified: unpacked.verified,
        })
    }

    pub fn arm(&mut self, armed: bool) -> OutgoingMessage {
        if armed && self.selected.is_none() {
            return OutgoingMessage::Error {
                error: "No image selected".into(),
            };
        }
        self.write_armed = armed;
        OutgoingMessage::WriteArmed { armed }
    }

    /// Runs one tag contact: writes the selected image when armed, otherwise
    /// dumps and decodes the tag. A successful write disarms.
    pub fn process_tag<E: Exchange>(&mut self, link: E) -> OutgoingMessage {
        let mut session = TagSession::new(link);
        if let Err(e) = session.connect() {
            return OutgoingMessage::CardStatus {
                success: false,
                message: e.to_string(),
            };
        }

        let selected = match (&self.selected, self.write_armed) {
            (Some(selected), true) => selected,
            _ => return self.read_tag(&mut session),
        };

        match session.write_plaintext(&selected.plaintext, &self.keys) {
            Ok(()) => {
                let _ = session.finish();
                let message = format!("Wrote {}", selected.name);
                info!("{}", message);
                self.write_armed = false;
                OutgoingMessage::WriteSuccess { message }
            }
            Err(e) => {
                error!("Write of {} failed: {}", selected.name, e);
                OutgoingMessage::WriteError {
                    error: e.to_string(),
                    page: e.page(),
                }
            }
        }
    }

    fn read_tag<E: Exchange>(&self, session: &mut TagSession<E>) -> OutgoingMessage {
        let image = match session.read_image() {
            Ok(image) => image,
            Err(e) => {
                return OutgoingMessage::ReadError {
                    error: e.to_string(),
                    page: e.page(),
                };
            }
        };
        let _ = session.finish();

        let unpacked = amiibo::unpack(&image, &self.keys);
        if !unpacked.verified {
            warn!("Tag signature was NOT valid");
        }
        OutgoingMessage::TagRead {
            info: unpacked.plaintext.info(),
            verified: unpacked.verified,
        }
    }

    fn handle_command(
        &mut self,
        cmd: NfcCommand,
        ctx: &Context,
        readers_buf: &mut [u8],
        reader_names: &mut Vec<CString>,
        tx: &Sender<OutgoingMessage>,
    ) {
        let reply = match cmd {
            NfcCommand::CheckReaderStatus => match ctx.list_readers(readers_buf) {
                Ok(iter) => {
                    *reader_names = iter.map(CString::from).collect();
                    OutgoingMessage::ReaderStatus {
                        success: !reader_names.is_empty(),
                    }
                }
                Err(_) => {
                    reader_names.clear();
                    OutgoingMessage::ReaderStatus { success: false }
                }
            },
            NfcCommand::ListImages => self.list_images(),
            NfcCommand::Select { name } => match self.select(&name) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("Couldn't load {}: {}", name, e);
                    OutgoingMessage::Error {
                        error: e.to_string(),
                    }
                }
            },
            NfcCommand::Arm(armed) => self.arm(armed),
        };
        let _ = tx.send(reply);
    }

    fn handle_card_insertion(&mut self, ctx: &Context, reader_name: &CStr, tx: &Sender<OutgoingMessage>) {
        let _ = tx.send(OutgoingMessage::CardStatus {
            success: true,
            message: "Card detected!".into(),
        });

        match ctx.connect(reader_name, ShareMode::Exclusive, Protocols::ANY) {
            Ok(card) => {
                let reply = self.process_tag(PcscLink::new(&card));
                let _ = tx.send(reply);
            }
            Err(e) => {
                error!("Failed to connect to card: {}", e);
                let _ = tx.send(OutgoingMessage::CardStatus {
                    success: false,
                    message: e.to_string(),
                });
            }
        }
    }
}

pub fn run(mut state: ServiceState, tx: Sender<OutgoingMessage>, rx: Receiver<NfcCommand>) {
    info!("Starting NFC Service (Event Driven)...");

    let ctx = match Context::establish(Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("Failed to establish context: {}", err);
            let _ = tx.send(OutgoingMessage::ReaderError {
                error: err.to_string(),
            });
            return;
        }
    };

    let mut readers_buf = [0; 2048];
    let mut reader_names: Vec<CString> = Vec::new();
    let mut reader_states = vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)];

    loop {
        // 1. Wait for state change
        if let Err(err) = ctx.get_status_change(Duration::from_millis(500), &mut reader_states) {
            if err != pcsc::Error::Timeout {
                error!("PCSC Error: {}", err);
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        }

        // 2. Commands queued between card events
        while let Ok(cmd) = rx.try_recv() {
            state.handle_command(cmd, &ctx, &mut readers_buf, &mut reader_names, &tx);
        }

        // 3. Events
        let mut readers_changed = false;

        if reader_states[0].event_state().intersects(State::CHANGED) {
            info!("Hardware change detected");
            readers_changed = true;
            reader_states[0].sync_current_state();
        }

        for i in 1..reader_states.len() {
            let rs = &reader_states[i];
            if !rs.event_state().intersects(State::CHANGED) {
                continue;
            }
            let name = rs.name().to_owned();
            let current = rs.event_state();
            let previous = rs.current_state();

            if current.intersects(State::PRESENT) && !previous.intersects(State::PRESENT) {
                info!("Card Inserted on {:?}", name);
                state.handle_card_insertion(&ctx, &name, &tx);
            }

            if current.intersects(State::EMPTY) && previous.intersects(State::PRESENT) {
                info!("Card Removed from {:?}", name);
                let _ = tx.send(OutgoingMessage::CardStatus {
                    success: false,
                    message: "Card removed!".into(),
                });
            }

            reader_states[i].sync_current_state();
        }

        // 4. Refresh reader list
        if readers_changed {
            reader_states.truncate(1);
            match ctx.list_readers(&mut readers_buf) {
                Ok(iter) => {
                    reader_names = iter.map(CString::from).collect();
                    for name in &reader_names {
                        reader_states.push(ReaderState::new(name.clone(), State::UNAWARE));
                    }
                    let _ = tx.send(OutgoingMessage::ReaderStatus {
                        success: !reader_names.is_empty(),
                    });
                }
                Err(_) => {
                    reader_names.clear();
                    let _ = tx.send(OutgoingMessage::ReaderStatus { success: false });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amiibo::tests::sample_plaintext;
    use crate::amiibo::{EncryptedImage, pack};
    use crate::keys::tests::test_keys;
    use crate::transport::TagFamily;
    use crate::transport::tests::{FakeTag, UID_PAGES};

    fn state_with_image(dir: &std::path::Path) -> ServiceState {
        let keys = Arc::new(test_keys());
        let image = pack(&sample_plaintext(), &keys);
        std::fs::write(dir.join("link.bin"), image.as_bytes()).unwrap();
        std::fs::write(dir.join("blank.bin"), [0u8; 540]).unwrap();
        ServiceState::new(keys, ImageLibrary::new(dir))
    }

    #[test]
    fn select_reports_verification() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_with_image(dir.path());

        match state.select("link.bin").unwrap() {
            OutgoingMessage::ImageSelected { verified, info, .. } => {
                assert!(verified);
                assert_eq!(info.nickname, "Link");
            }
            other => panic!("unexpected {other:?}"),
        }

        // blank dumps are still selectable, just flagged
        match state.select("blank.bin").unwrap() {
            OutgoingMessage::ImageSelected { verified, .. } => assert!(!verified),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.selected().unwrap().name, "blank.bin");
    }

    #[test]
    fn arming_requires_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_with_image(dir.path());
        assert!(matches!(state.arm(true), OutgoingMessage::Error { .. }));
        assert!(!state.is_armed());

        state.select("link.bin").unwrap();
        assert_eq!(state.arm(true), OutgoingMessage::WriteArmed { armed: true });
        assert!(state.is_armed());
    }

    #[test]
    fn unarmed_contact_reads_tag() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_with_image(dir.path());
        let mut tag = FakeTag::new();

        match state.process_tag(&mut tag) {
            OutgoingMessage::TagRead { verified, info } => {
                assert!(!verified);
                assert_eq!(info.uid, "04112233445566");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tag.commands.len(), 33);
    }

    #[test]
    fn armed_contact_writes_then_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_with_image(dir.path());
        state.select("link.bin").unwrap();
        state.arm(true);

        let mut tag = FakeTag::new();
        assert!(matches!(
            state.process_tag(&mut tag),
            OutgoingMessage::WriteSuccess { .. }
        ));
        assert!(!state.is_armed());

        let out = amiibo::unpack(&EncryptedImage::new(tag.memory), &test_keys());
        assert!(out.verified);
        assert_eq!(out.plaintext.identity(), UID_PAGES);
        assert_eq!(out.plaintext.nickname(), "Link");
    }

    #[test]
    fn failed_write_keeps_arm_and_reports_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_with_image(dir.path());
        state.select("link.bin").unwrap();
        state.arm(true);

        let mut tag = FakeTag::new();
        // call 1 is the identity read, so call 11 is the tenth page write
        tag.fail_on_call = Some(11);
        match state.process_tag(&mut tag) {
            OutgoingMessage::WriteError { page, .. } => assert_eq!(page, Some(13)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(state.is_armed());
        assert_eq!(tag.commands.len(), 11);
    }

    #[test]
    fn wrong_family_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_with_image(dir.path());
        let mut tag = FakeTag::new();
        tag.family = TagFamily::Desfire;
        assert!(matches!(
            state.process_tag(&mut tag),
            OutgoingMessage::CardStatus { success: false, .. }
        ));
        assert!(tag.commands.is_empty());
    }
}
