//! Streaming AES-256-GCM.
//!
//! Bodies are encrypted and decrypted chunk by chunk while they move over
//! HTTP, so the one-shot AEAD interface does not fit. GCM is assembled from
//! its parts instead: AES-256 for the hash key and tag mask, a 32-bit
//! big-endian counter for the keystream and GHASH over the ciphertext. No
//! associated data is used. The 16-byte tag trails the ciphertext.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ghash::GHash;
use ghash::universal_hash::UniversalHash;
use tracing::debug;

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// IV used when key material carries no IV of its own.
pub const DEFAULT_IV: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];

type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;
type Block = aes::Block;

fn inc32(block: &mut Block) {
    let mut counter = [0u8; 4];
    counter.copy_from_slice(&block[12..]);
    let next = u32::from_be_bytes(counter).wrapping_add(1);
    block[12..].copy_from_slice(&next.to_be_bytes());
}

fn length_block(bits: u64) -> Block {
    let mut block = Block::default();
    block[8..].copy_from_slice(&bits.to_be_bytes());
    block
}

/// Pre-counter block: `IV || 0^31 || 1` for 96-bit IVs, GHASH of the IV otherwise.
fn derive_j0(h: &Block, iv: &[u8]) -> Block {
    if iv.len() == 12 {
        let mut j0 = Block::default();
        j0[..12].copy_from_slice(iv);
        j0[15] = 1;
        return j0;
    }
    let mut g = GHash::new(h);
    g.update_padded(iv);
    g.update(&[length_block(iv.len() as u64 * 8)]);
    g.finalize()
}

struct GcmState {
    keystream: Aes256Ctr32,
    ghash: GHash,
    partial: [u8; 16],
    partial_len: usize,
    tag_mask: Block,
    processed: u64,
}

impl GcmState {
    fn new(key: &[u8; 32], iv: &[u8]) -> Result<Self, TransferError> {
        if iv.is_empty() {
            return Err(TransferError::InvalidIv(0));
        }
        let aes = Aes256::new(GenericArray::from_slice(key));
        let mut h = Block::default();
        aes.encrypt_block(&mut h);

        let j0 = derive_j0(&h, iv);
        let mut tag_mask = j0;
        aes.encrypt_block(&mut tag_mask);
        let mut counter = j0;
        inc32(&mut counter);

        Ok(Self {
            keystream: Aes256Ctr32::new(GenericArray::from_slice(key), &counter),
            ghash: GHash::new(&h),
            partial: [0u8; 16],
            partial_len: 0,
            tag_mask,
            processed: 0,
        })
    }

    /// Feeds ciphertext into GHASH, holding back an incomplete trailing block.
    fn absorb(&mut self, mut data: &[u8]) {
        self.processed += data.len() as u64;

        if self.partial_len > 0 {
            let take = (16 - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < 16 {
                return;
            }
            self.ghash.update(&[Block::clone_from_slice(&self.partial)]);
            self.partial_len = 0;
        }

        let mut blocks = data.chunks_exact(16);
        for block in &mut blocks {
            self.ghash.update(&[Block::clone_from_slice(block)]);
        }
        let rest = blocks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    fn tag(mut self) -> [u8; TAG_LEN] {
        if self.partial_len > 0 {
            self.ghash.update_padded(&self.partial[..self.partial_len]);
        }
        self.ghash.update(&[length_block(self.processed * 8)]);
        let s = self.ghash.finalize();

        let mut tag = [0u8; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = s[i] ^ self.tag_mask[i];
        }
        tag
    }
}

/// Encrypts a byte stream in place, chunk by chunk.
pub struct GcmEncryptor {
    state: GcmState,
}

impl GcmEncryptor {
    pub fn new(key: &[u8; 32], iv: &[u8]) -> Result<Self, TransferError> {
        Ok(Self {
            state: GcmState::new(key, iv)?,
        })
    }

    /// Encrypts the next chunk. Chunks may have any length.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.state.keystream.apply_keystream(buf);
        self.state.absorb(buf);
    }

    /// Consumes the encryptor and returns the tag to append after the last chunk.
    pub fn finalize(self) -> [u8; TAG_LEN] {
        self.state.tag()
    }
}

/// Decrypts a byte stream in place. The trailing tag must be split off by
/// the caller and handed to [`verify`](Self::verify).
pub struct GcmDecryptor {
    state: GcmState,
}

impl GcmDecryptor {
    pub fn new(key: &[u8; 32], iv: &[u8]) -> Result<Self, TransferError> {
        Ok(Self {
            state: GcmState::new(key, iv)?,
        })
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.state.absorb(buf);
        self.state.keystream.apply_keystream(buf);
    }

    /// Checks the received tag against everything decrypted so far.
    pub fn verify(self, tag: &[u8]) -> Result<(), TransferError> {
        let expected = self.state.tag();
        if tag.len() != TAG_LEN {
            return Err(TransferError::TagMismatch);
        }
        let diff = expected
            .iter()
            .zip(tag)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(TransferError::TagMismatch)
        }
    }
}

/// One-shot encryption: returns `ciphertext || tag`.
pub fn seal(key: &[u8; 32], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
    let mut enc = GcmEncryptor::new(key, iv)?;
    let mut out = plaintext.to_vec();
    enc.encrypt(&mut out);
    out.extend_from_slice(&enc.finalize());
    Ok(out)
}

/// One-shot decryption of `ciphertext || tag`.
pub fn open(key: &[u8; 32], iv: &[u8], sealed: &[u8]) -> Result<Vec<u8>, TransferError> {
    if sealed.len() < TAG_LEN {
        return Err(TransferError::Truncated(sealed.len() as u64));
    }
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    let mut dec = GcmDecryptor::new(key, iv)?;
    let mut out = body.to_vec();
    dec.decrypt(&mut out);
    dec.verify(tag)?;
    Ok(out)
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".decrypting");
    dest.with_file_name(name)
}

/// Decrypts the `ciphertext || tag` file at `src` into `dest`.
///
/// Plaintext goes to a staging file beside `dest` that is renamed into place
/// only after the tag verifies; on any failure the staging file is removed
/// and `dest` is left untouched. `src` is never modified. Returns the
/// plaintext length.
pub fn decrypt_file(
    src: &Path,
    dest: &Path,
    key: &[u8; 32],
    iv: &[u8],
) -> Result<u64, TransferError> {
    let mut input = File::open(src)?;
    let total = input.metadata()?.len();
    if total < TAG_LEN as u64 {
        return Err(TransferError::Truncated(total));
    }
    let body_len = total - TAG_LEN as u64;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = staging_path(dest);
    match decrypt_into(&mut input, body_len, &staging, key, iv) {
        Ok(()) => {
            std::fs::rename(&staging, dest)?;
            debug!(src = %src.display(), dest = %dest.display(), bytes = body_len, "decrypted file");
            Ok(body_len)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&staging);
            Err(e)
        }
    }
}

fn decrypt_into(
    input: &mut File,
    body_len: u64,
    staging: &Path,
    key: &[u8; 32],
    iv: &[u8],
) -> Result<(), TransferError> {
    let mut dec = GcmDecryptor::new(key, iv)?;
    let mut out = BufWriter::new(File::create(staging)?);
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    let mut remaining = body_len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        input.read_exact(&mut buf[..want])?;
        dec.decrypt(&mut buf[..want]);
        out.write_all(&buf[..want])?;
        remaining -= want as u64;
    }

    let mut tag = [0u8; TAG_LEN];
    input.read_exact(&mut tag)?;
    dec.verify(&tag)?;

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}
