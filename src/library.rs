// src/library.rs
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::amiibo::EncryptedImage;
use crate::error::{Error, Result};

/// Directory of raw 540-byte tag dumps, addressed by file name.
#[derive(Debug, Clone)]
pub struct ImageLibrary {
    dir: PathBuf,
}

impl ImageLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of the non-hidden regular files in the directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        debug!("Found {} images in {}", names.len(), self.dir.display());
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<EncryptedImage> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(Error::ImageName(name.to_owned()));
        }
        let raw = fs::read(self.dir.join(name))?;
        EncryptedImage::from_slice(&raw)
    }
}
