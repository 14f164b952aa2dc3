//! Passphrase-based authenticated encryption for database backups.
//!
//! File layout, bit-exact: `salt[16] || nonce[12] || AES-256-GCM ciphertext`
//! where the ciphertext carries the standard trailing 16-byte tag. The key is
//! derived with Argon2id (t=3, m=64 MiB, p=4), so both derive and seal are
//! CPU-heavy; callers run them on a blocking thread.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
/// Smallest possible ciphertext: prefix plus the tag of an empty plaintext.
pub const MIN_CIPHERTEXT_LEN: usize = SALT_SIZE + NONCE_SIZE + TAG_SIZE;

const ARGON2_M_COST: u32 = 64 * 1024; // KiB
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext shorter than `salt || nonce || tag`.
    #[error("ciphertext too short")]
    TooShort,

    /// Authentication failed: tampered data or wrong passphrase.
    #[error("decryption failed: data is corrupt or the passphrase is wrong")]
    CorruptOrWrongKey,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Derive a 32-byte key from a passphrase and salt. Deterministic for the
/// same inputs; changing either yields an independent key.
pub fn derive_key(passphrase: &str, salt: &[u8; SALT_SIZE]) -> Result<[u8; KEY_SIZE]> {
    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(KEY_SIZE))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Generate a random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypt `plaintext` under the key derived from `passphrase` and `salt`,
/// with a fresh nonce. Empty plaintexts are valid; the output still carries
/// the 28-byte prefix and the 16-byte tag.
pub fn encrypt(plaintext: &[u8], passphrase: &str, salt: &[u8; SALT_SIZE]) -> Result<Vec<u8>> {
    let key = derive_key(passphrase, salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::CorruptOrWrongKey)?;

    let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + sealed.len());
    out.extend_from_slice(salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a `salt || nonce || ciphertext` blob produced by [`encrypt`].
pub fn decrypt(ciphertext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    if ciphertext.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::TooShort);
    }

    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&ciphertext[..SALT_SIZE]);
    let nonce = &ciphertext[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let sealed = &ciphertext[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::CorruptOrWrongKey)
}
