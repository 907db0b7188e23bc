use sha2::{Digest as ShaDigest, Sha256};

pub type Digest = [u8; 32];

pub trait Hashable {
    fn hash(&self) -> Digest;
}

/// Incremental hasher over length-prefixed fields, so that adjacent fields
/// can never collide by shifting bytes between them.
pub struct FieldHasher {
    inner: Sha256,
}

impl FieldHasher {
    pub fn new() -> Self {
        FieldHasher {
            inner: Sha256::new(),
        }
    }

    pub fn field(mut self, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        self.inner.update((bytes.len() as u64).to_be_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn finish(self) -> Digest {
        let result = self.inner.finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

impl Default for FieldHasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}
