//! Passphrase-based streaming encryption.
//!
//! File layout:
//!
//! ```text
//! magic "IBKENC01" | salt (16) | nonce prefix (7) | chunk*
//! chunk = ciphertext length (u32 BE) | AES-256-GCM ciphertext
//! ```
//!
//! The key is derived with Argon2id from the passphrase and the random salt.
//! Plaintext is sealed in 1 MiB chunks; each nonce is the prefix, a big-endian
//! chunk counter and a final-chunk flag, so reordered, dropped or truncated
//! chunks fail authentication.

use crate::config::EncryptionConfig;
use crate::secret::Secret;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use thiserror::Error;

pub const MAGIC: &[u8; 8] = b"IBKENC01";
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
pub const CHUNK_SIZE: usize = 1024 * 1024;
pub const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_PREFIX_LEN;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("no encryption passphrase configured")]
    MissingKey,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("not an encrypted artifact (bad header)")]
    BadHeader,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed at chunk {0}: wrong passphrase or corrupted data")]
    Decrypt(u32),

    #[error("encrypted stream is truncated")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl From<&EncryptionConfig> for KdfParams {
    fn from(cfg: &EncryptionConfig) -> Self {
        Self {
            memory_kib: cfg.argon2_memory_kib,
            iterations: cfg.argon2_iterations,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

fn derive_key(passphrase: &Secret, salt: &[u8], params: KdfParams) -> Result<[u8; 32], CryptoError> {
    let argon_params = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = [0u8; 32];
    argon
        .hash_password_into(passphrase.expose().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Fill `buf` as far as the reader allows; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt `src` into `dest`. Blocking.
pub fn encrypt_file(src: &Path, dest: &Path, passphrase: &Secret, params: KdfParams) -> Result<(), CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut prefix);

    let key = derive_key(passphrase, &salt, params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&salt)?;
    writer.write_all(&prefix)?;

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut counter: u32 = 0;

    loop {
        // Look ahead one chunk to know whether this one is final
        let next_len = if current_len == CHUNK_SIZE {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = chunk_nonce(&prefix, counter, last);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), &current[..current_len])
            .map_err(|_| CryptoError::Encrypt)?;
        writer.write_all(&(sealed.len() as u32).to_be_bytes())?;
        writer.write_all(&sealed)?;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        counter = counter.checked_add(1).ok_or(CryptoError::Encrypt)?;
    }

    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

/// Decrypt `src`, writing plaintext to `out`. Returns plaintext bytes written.
/// Blocking. Pass `std::io::sink()` to test decryptability without keeping output.
pub fn decrypt_to<W: Write>(src: &Path, out: &mut W, passphrase: &Secret, params: KdfParams) -> Result<u64, CryptoError> {
    let mut reader = BufReader::new(File::open(src)?);

    let mut header = [0u8; HEADER_LEN];
    if read_full(&mut reader, &mut header)? != HEADER_LEN || &header[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::BadHeader);
    }
    let salt = &header[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    prefix.copy_from_slice(&header[MAGIC.len() + SALT_LEN..]);

    let key = derive_key(passphrase, salt, params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut pending = read_chunk(&mut reader)?.ok_or(CryptoError::Truncated)?;
    let mut counter: u32 = 0;
    let mut written = 0u64;

    loop {
        let following = read_chunk(&mut reader)?;
        let last = following.is_none();

        let nonce = chunk_nonce(&prefix, counter, last);
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), pending.as_slice())
            .map_err(|_| {
                if last && counter > 0 {
                    // A non-final chunk at the end means chunks were cut off
                    CryptoError::Truncated
                } else {
                    CryptoError::Decrypt(counter)
                }
            })?;
        out.write_all(&plain)?;
        written += plain.len() as u64;

        match following {
            Some(chunk) => {
                pending = chunk;
                counter = counter.checked_add(1).ok_or(CryptoError::Truncated)?;
            }
            None => break,
        }
    }

    out.flush()?;
    Ok(written)
}

fn read_chunk<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, CryptoError> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(None),
        4 => {}
        _ => return Err(CryptoError::Truncated),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
        return Err(CryptoError::Truncated);
    }
    let mut chunk = vec![0u8; len];
    if read_full(reader, &mut chunk)? != len {
        return Err(CryptoError::Truncated);
    }
    Ok(Some(chunk))
}

/// Whether a file starts with the encrypted-artifact header.
pub fn has_header(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; MAGIC.len()];
    Ok(read_full(&mut file, &mut magic)? == MAGIC.len() && &magic == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Cheap parameters keep the tests fast
    const FAST: KdfParams = KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    fn encrypt_bytes(dir: &TempDir, data: &[u8], pass: &str) -> std::path::PathBuf {
        let src = dir.path().join("plain");
        let dest = dir.path().join("plain.enc");
        std::fs::write(&src, data).unwrap();
        encrypt_file(&src, &dest, &Secret::new(pass), FAST).unwrap();
        dest
    }

    #[test]
    fn test_correct_passphrase_decrypts() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect();
        let enc = encrypt_bytes(&dir, &data, "correct horse");

        let mut out = Vec::new();
        let n = decrypt_to(&enc, &mut out, &Secret::new("correct horse"), FAST).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
        assert!(has_header(&enc).unwrap());
    }

    #[test]
    fn test_wrong_passphrase_fails_deterministically() {
        let dir = TempDir::new().unwrap();
        let enc = encrypt_bytes(&dir, b"secret rows", "right");
        for _ in 0..2 {
            let err = decrypt_to(&enc, &mut std::io::sink(), &Secret::new("wrong"), FAST).unwrap_err();
            assert!(matches!(err, CryptoError::Decrypt(0)));
        }
    }

    #[test]
    fn test_empty_input_round_trips() {
        let dir = TempDir::new().unwrap();
        let enc = encrypt_bytes(&dir, b"", "p");
        let n = decrypt_to(&enc, &mut std::io::sink(), &Secret::new("p"), FAST).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_dropped_final_chunk_is_detected() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; CHUNK_SIZE + 10];
        let enc = encrypt_bytes(&dir, &data, "p");

        // Keep the header and the first sealed chunk only
        let bytes = std::fs::read(&enc).unwrap();
        let first_len = u32::from_be_bytes(bytes[HEADER_LEN..HEADER_LEN + 4].try_into().unwrap()) as usize;
        let cut = dir.path().join("cut.enc");
        std::fs::write(&cut, &bytes[..HEADER_LEN + 4 + first_len]).unwrap();

        let err = decrypt_to(&cut, &mut std::io::sink(), &Secret::new("p"), FAST).unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt(0) | CryptoError::Truncated));
    }

    #[test]
    fn test_plain_file_has_no_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"not encrypted").unwrap();
        assert!(!has_header(&path).unwrap());
        let err = decrypt_to(&path, &mut std::io::sink(), &Secret::new("p"), FAST).unwrap_err();
        assert!(matches!(err, CryptoError::BadHeader));
    }
}
