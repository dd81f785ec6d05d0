use std::path::{Path, PathBuf};

use crate::TransferError;
use crate::cipher::{DEFAULT_IV, TAG_LEN};

/// A file on local storage taking part in a transfer.
///
/// `expected_size` counts bytes on the wire, so it includes the
/// authentication tag when a key is bound. 0 means unknown.
#[derive(Debug, Clone)]
pub struct TransferFile {
    path: PathBuf,
    expected_size: u64,
    key: Option<[u8; 32]>,
    iv: Vec<u8>,
}

impl TransferFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            expected_size: 0,
            key: None,
            iv: DEFAULT_IV.to_vec(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn set_expected_size(&mut self, size: u64) {
        self.expected_size = size;
    }

    pub fn key(&self) -> Option<&[u8; 32]> {
        self.key.as_ref()
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Binds key material: 48 bytes (16-byte IV then key), 44 bytes (12-byte
    /// IV then key) or 32 bytes (key only, default IV).
    pub fn set_key_material(&mut self, material: &[u8]) -> Result<(), TransferError> {
        if self.key.is_some() {
            return Err(TransferError::KeyAlreadyBound);
        }
        let (iv, key) = match material.len() {
            48 => material.split_at(16),
            44 => material.split_at(12),
            32 => (&DEFAULT_IV[..], material),
            n => return Err(TransferError::InvalidKeyLength(n)),
        };
        let mut bound = [0u8; 32];
        bound.copy_from_slice(key);
        self.key = Some(bound);
        self.iv = iv.to_vec();
        Ok(())
    }

    /// Hex of `IV || key`, the fragment carried by `aesgcm://` URLs.
    pub fn key_fragment(&self) -> Option<String> {
        self.key.map(|key| {
            let mut material = self.iv.clone();
            material.extend_from_slice(&key);
            hex::encode(material)
        })
    }

    /// Plaintext size derived from `expected_size`.
    pub fn plaintext_size(&self) -> u64 {
        if self.has_key() {
            self.expected_size.saturating_sub(TAG_LEN as u64)
        } else {
            self.expected_size
        }
    }

    /// Lower-cased extension of the local path, if any.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Current length on disk, 0 when the file does not exist.
    pub fn len_on_disk(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}
