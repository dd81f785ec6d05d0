use sha2::{Digest, Sha256};

/// SHA-256 of a file's plaintext, fed chunk by chunk as the file streams
/// out, so hashing costs no extra read.
#[derive(Clone, Default)]
pub struct PlaintextDigest {
    hasher: Sha256,
    len: u64,
}

impl PlaintextDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must see the plaintext, before any encryption is applied.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
