// src/transport.rs
//! Paged NTAG215 transport.
//!
//! Everything here runs over an injected [`Exchange`] link: one raw command
//! out, one response back, strictly in order. A [`TagSession`] covers one
//! physical contact and walks
//!
//! ```text
//! Idle -> Connected -> Reading/Writing -> Connected -> Done
//!      \-> Rejected                    \-> Failed
//! ```
//!
//! Only user memory (pages 4..=129) is ever written. The capability
//! container, configuration and password pages are left alone so lock and
//! auth bits cannot be clobbered by accident.

use log::{debug, info, trace, warn};

use crate::amiibo::{self, EncryptedImage, IDENTITY_SIZE, NTAG215_SIZE, PlaintextImage};
use crate::checksum::append_crc;
use crate::error::{Error, ExchangeError, Result};
use crate::keys::KeyBundle;

pub const CMD_READ: u8 = 0x30;
pub const CMD_WRITE: u8 = 0xA2;

pub const PAGE_SIZE: usize = 4;
/// A READ returns four consecutive pages.
pub const READ_BLOCK_SIZE: usize = 16;

pub const PAGE_CAPABILITY_CONTAINER: u8 = 3;
pub const USER_MEMORY_FIRST: u8 = 4;
pub const USER_MEMORY_LAST: u8 = 129;
pub const PAGE_CFG0: u8 = 131;
pub const PAGE_CFG1: u8 = 132;
pub const PAGE_PWD: u8 = 133;

const MIFARE_ACK: u8 = 0x0A;
const CASCADE_TAG: u8 = 0x88;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFamily {
    Ultralight,
    Classic,
    Plus,
    Desfire,
    Unknown,
}

/// Raw command channel to a tag, supplied by the reader driver.
pub trait Exchange {
    /// Chip family reported when the tag was detected.
    fn family(&self) -> TagFamily;

    /// Sends one command frame and waits for its response.
    fn exchange(&mut self, command: &[u8]) -> std::result::Result<Vec<u8>, ExchangeError>;
}

impl<E: Exchange + ?Sized> Exchange for &mut E {
    fn family(&self) -> TagFamily {
        (**self).family()
    }

    fn exchange(&mut self, command: &[u8]) -> std::result::Result<Vec<u8>, ExchangeError> {
        (**self).exchange(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Reading,
    Writing,
    Done,
    Rejected,
    Failed,
}

/// Raw bytes of pages 0 and 1: `UID0 UID1 UID2 BCC0 UID3 UID4 UID5 UID6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagIdentity([u8; IDENTITY_SIZE]);

impl TagIdentity {
    pub fn new(window: [u8; IDENTITY_SIZE]) -> Self {
        Self(window)
    }

    /// Takes the first two pages of a READ 0 response.
    pub fn from_read_block(block: &[u8; READ_BLOCK_SIZE]) -> Self {
        let mut window = [0u8; IDENTITY_SIZE];
        window.copy_from_slice(&block[..IDENTITY_SIZE]);
        Self(window)
    }

    pub fn window(&self) -> &[u8; IDENTITY_SIZE] {
        &self.0
    }

    pub fn uid(&self) -> [u8; 7] {
        let w = &self.0;
        [w[0], w[1], w[2], w[4], w[5], w[6], w[7]]
    }

    /// BCC0 = CT ^ UID0 ^ UID1 ^ UID2.
    pub fn has_valid_bcc(&self) -> bool {
        CASCADE_TAG ^ self.0[0] ^ self.0[1] ^ self.0[2] == self.0[3]
    }
}

/// Overwrites the identity window of `plain` with the scanned tag's pages
/// 0..1, so an image dumped from one tag re-signs for another.
pub fn substitute_identity(plain: &mut PlaintextImage, identity: &TagIdentity) {
    plain.set_identity(identity.window());
}

/// `[0xA2, page, d0..d3, crc_lo, crc_hi]`
pub fn write_command(page: u8, data: &[u8; PAGE_SIZE]) -> Vec<u8> {
    append_crc(&[CMD_WRITE, page, data[0], data[1], data[2], data[3]])
}

pub fn read_command(page: u8) -> [u8; 2] {
    [CMD_READ, page]
}

fn is_ack(response: &[u8]) -> bool {
    match response.first() {
        None => true,
        Some(b) => b & 0x0F == MIFARE_ACK,
    }
}

/// State for one physical tag contact.
pub struct TagSession<E: Exchange> {
    link: E,
    state: SessionState,
    identity: Option<TagIdentity>,
    cursor: u8,
    last_completed: Option<u8>,
}

impl<E: Exchange> TagSession<E> {
    pub fn new(link: E) -> Self {
        Self {
            link,
            state: SessionState::Idle,
            identity: None,
            cursor: 0,
            last_completed: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&TagIdentity> {
        self.identity.as_ref()
    }

    /// Page the current or most recent paged operation was working on.
    pub fn cursor(&self) -> u8 {
        self.cursor
    }

    /// Validates the chip family. Anything but Ultralight-class ends the
    /// session before any I/O.
    pub fn connect(&mut self) -> Result<()> {
        self.require(SessionState::Idle)?;
        let family = self.link.family();
        if family != TagFamily::Ultralight {
            info!("Ignoring non-ultralight tag ({:?})", family);
            self.state = SessionState::Rejected;
            return Err(Error::UnsupportedTagFamily(family));
        }
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Reads pages 0..3 and records the tag identity.
    pub fn read_identity(&mut self) -> Result<TagIdentity> {
        self.require(SessionState::Connected)?;
        self.state = SessionState::Reading;
        self.last_completed = None;
        self.cursor = 0;

        let block = self.read_block(0)?;
        let identity = self.record_identity(&block);
        self.state = SessionState::Connected;
        Ok(identity)
    }

    /// Dumps pages 0..=129 four at a time and pads the result to a full
    /// 540-byte image. The trailing configuration pages are not read back.
    pub fn read_image(&mut self) -> Result<EncryptedImage> {
        self.require(SessionState::Connected)?;
        self.state = SessionState::Reading;
        self.last_completed = None;
        self.cursor = 0;

        let mut dump = Vec::with_capacity(NTAG215_SIZE);
        while self.cursor <= USER_MEMORY_LAST {
            let page = self.cursor;
            debug!("Read page {}", page);
            let block = self.read_block(page)?;
            if page == 0 {
                self.record_identity(&block);
            }
            dump.extend_from_slice(&block);
            self.last_completed = Some(page + 3);
            self.cursor += 4;
        }
        dump.resize(NTAG215_SIZE, 0);

        self.state = SessionState::Connected;
        info!("Read {} pages", self.cursor);
        EncryptedImage::from_slice(&dump)
    }

    /// Writes user pages 4..=129 of `image` in order, each after the previous
    /// one was acknowledged.
    ///
    /// The first failure aborts the whole write and is reported with its page
    /// index. Pages already written stay written: the tag is then left with a
    /// mix of old and new contents, and the caller has to start a fresh
    /// session to try again.
    pub fn write_image(&mut self, image: &EncryptedImage) -> Result<()> {
        self.require(SessionState::Connected)?;
        self.state = SessionState::Writing;
        self.last_completed = None;

        for page in USER_MEMORY_FIRST..=USER_MEMORY_LAST {
            self.cursor = page;
            let data = image.page(page).ok_or(Error::PageOutOfRange(page))?;
            self.write_page(page, &data)?;
            self.last_completed = Some(page);
        }

        self.state = SessionState::Connected;
        info!("Wrote pages {}..={}", USER_MEMORY_FIRST, USER_MEMORY_LAST);
        Ok(())
    }

    /// Re-signs `plain` for this tag and writes it.
    ///
    /// The tag's identity is read first if this session has not seen it yet;
    /// `plain` itself is left untouched.
    pub fn write_plaintext(&mut self, plain: &PlaintextImage, keys: &KeyBundle) -> Result<()> {
        let identity = match self.identity {
            Some(identity) => identity,
            None => self.read_identity()?,
        };

        let mut plain = plain.clone();
        substitute_identity(&mut plain, &identity);
        let image = amiibo::pack(&plain, keys);
        self.write_image(&image)
    }

    /// Ends a session that completed normally.
    pub fn finish(&mut self) -> Result<()> {
        self.require(SessionState::Connected)?;
        self.state = SessionState::Done;
        Ok(())
    }

    pub fn into_link(self) -> E {
        self.link
    }

    fn require(&self, state: SessionState) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::SessionState(self.state))
        }
    }

    fn record_identity(&mut self, block: &[u8; READ_BLOCK_SIZE]) -> TagIdentity {
        let identity = TagIdentity::from_read_block(block);
        if !identity.has_valid_bcc() {
            warn!("BCC0 mismatch in UID {}", hex::encode(identity.uid()));
        }
        self.identity = Some(identity);
        identity
    }

    fn read_block(&mut self, page: u8) -> Result<[u8; READ_BLOCK_SIZE]> {
        let response = match self.link.exchange(&read_command(page)) {
            Ok(response) => response,
            Err(source) => return Err(self.fail(page, source)),
        };
        let block: [u8; READ_BLOCK_SIZE] = match response.as_slice().try_into() {
            Ok(block) => block,
            Err(_) => {
                self.state = SessionState::Failed;
                return Err(Error::UnexpectedResponse {
                    page,
                    len: response.len(),
                });
            }
        };
        trace!("Page {} {}", page, hex::encode(block));
        Ok(block)
    }

    fn write_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if !(USER_MEMORY_FIRST..=USER_MEMORY_LAST).contains(&page) {
            self.state = SessionState::Failed;
            return Err(Error::PageOutOfRange(page));
        }

        debug!("Write page {} {}", page, hex::encode(data));
        let response = match self.link.exchange(&write_command(page, data)) {
            Ok(response) => response,
            Err(source) => return Err(self.fail(page, source)),
        };
        if !is_ack(&response) {
            return Err(self.fail(page, ExchangeError::Nak(response[0])));
        }
        Ok(())
    }

    fn fail(&mut self, page: u8, source: ExchangeError) -> Error {
        warn!("Error at page {}: {}", page, source);
        self.state = SessionState::Failed;
        Error::Exchange {
            page,
            last_completed: self.last_completed,
            source,
        }
    }
}
