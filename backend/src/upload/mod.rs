pub mod signature;
pub mod validator;

use sha2::{Digest, Sha256};

pub use validator::{Rejection, UploadLimits, UploadValidator, UploadedFile};

/// Length of the digest prefix reported to clients.
pub const SHORT_HASH_LEN: usize = 8;

/// Hex SHA-256 of the uploaded bytes, used to correlate requests in logs.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn short_hash(digest: &str) -> &str {
    &digest[..digest.len().min(SHORT_HASH_LEN)]
}
