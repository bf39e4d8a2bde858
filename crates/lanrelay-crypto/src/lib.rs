//! LanRelay Crypto -- SHA-256 password digests, MD5 file content digests.
//!
//! Neither digest is a security boundary. The password hash is a coarse group
//! join filter; the MD5 digest detects corruption in transferred files.

use std::io::{Read, Seek, SeekFrom};

use md5::Md5;
use sha2::{Digest, Sha256};

/// Read size used while hashing streams.
const HASH_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// SHA-256 hash of data, returned as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Group password digest: lowercase hex SHA-256 of the UTF-8 password.
pub fn hash_password(password: &str) -> String {
    sha256_hex(password.as_bytes())
}

/// MD5 of data, returned as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// MD5 of everything from the start of `reader` to EOF, lowercase hex.
///
/// The reader is rewound to offset 0 afterwards so the same handle can be
/// streamed to a peer.
pub fn md5_hex_reader<R: Read + Seek>(reader: &mut R) -> Result<String, CryptoError> {
    reader.seek(SeekFrom::Start(0))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    reader.seek(SeekFrom::Start(0))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two hex digests ignoring ASCII case.
pub fn digest_eq_ignore_case(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
