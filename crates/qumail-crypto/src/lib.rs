//! Per-field cipher engine and key-material slicing.
//!
//! Every message field (subject, body, optional attachment) is encrypted
//! independently with AES-256-GCM, each field keyed from a disjoint region
//! of one key-material buffer. The slices are one-time-use by construction:
//! no two fields share key bytes, so a slice cross-applied to another
//! field's ciphertext fails authentication instead of decrypting.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Smallest key-material request, independent of content size.
pub const KEY_LENGTH_FLOOR: usize = 128;
/// Multiplier applied to the longer text field when sizing a key request.
pub const TEXT_KEY_MULTIPLIER: usize = 8;
/// AES-256 key size.
pub const FIELD_KEY_BYTES: usize = 32;
/// AEAD nonce size.
pub const NONCE_BYTES: usize = 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("insufficient key material: need {required} bytes, have {available}")]
    InsufficientKeyMaterial { required: usize, available: usize },
    #[error("key slice too short to derive a field key")]
    KeyTooShort,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Plaintext byte counts of the three encryptable fields of one message.
///
/// The counts drive both the key-length request at send time and the slice
/// boundaries at reveal time, which is why they are persisted with the
/// record: ciphertext length alone (tag included) does not recover them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLengths {
    pub subject: usize,
    pub body: usize,
    pub attachment: usize,
}

impl FieldLengths {
    pub fn new(subject: usize, body: usize, attachment: usize) -> Self {
        Self {
            subject,
            body,
            attachment,
        }
    }

    /// Total bytes consumed by the three slices.
    pub fn total(&self) -> usize {
        self.subject + self.body + self.attachment
    }

    /// Key-length policy: the floor or eight times the longer text field,
    /// whichever is larger, plus one key byte per attachment byte. The floor
    /// keeps a safety margin even for very short text fields.
    pub fn required_key_length(&self) -> usize {
        KEY_LENGTH_FLOOR.max(TEXT_KEY_MULTIPLIER * self.subject.max(self.body)) + self.attachment
    }
}

/// Disjoint views into one key-material buffer, one per field.
#[derive(Debug, PartialEq, Eq)]
pub struct KeySlices<'a> {
    pub subject: &'a [u8],
    pub body: &'a [u8],
    pub attachment: &'a [u8],
}

/// Partition `key_material` at the plaintext-length boundaries: subject gets
/// `[0, s)`, body `[s, s+b)`, attachment `[s+b, s+b+a)`.
pub fn slice_key<'a>(
    key_material: &'a [u8],
    lengths: &FieldLengths,
) -> Result<KeySlices<'a>, CryptoError> {
    let required = lengths.total();
    if key_material.len() < required {
        return Err(CryptoError::InsufficientKeyMaterial {
            required,
            available: key_material.len(),
        });
    }
    let (subject, rest) = key_material.split_at(lengths.subject);
    let (body, rest) = rest.split_at(lengths.body);
    let (attachment, _) = rest.split_at(lengths.attachment);
    Ok(KeySlices {
        subject,
        body,
        attachment,
    })
}

/// One encrypted field at rest: nonce and ciphertext as lowercase hex,
/// stored separately, never concatenated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    pub iv: String,
    pub ciphertext: String,
}

/// Resize a key slice to the cipher key size. Slices of at least 32 bytes
/// contribute their leading 32 bytes; shorter non-empty slices are stretched
/// with SHA-256 so decryption can re-derive the same key from the stored
/// material. An empty slice has no material to derive from.
fn field_key(key_slice: &[u8]) -> Result<[u8; FIELD_KEY_BYTES], CryptoError> {
    match key_slice.len() {
        0 => Err(CryptoError::KeyTooShort),
        len if len >= FIELD_KEY_BYTES => {
            let mut key = [0u8; FIELD_KEY_BYTES];
            key.copy_from_slice(&key_slice[..FIELD_KEY_BYTES]);
            Ok(key)
        }
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(key_slice);
            Ok(hasher.finalize().into())
        }
    }
}

/// Encrypt one field with AES-256-GCM under the given key slice, generating
/// a fresh random nonce on every call.
pub fn encrypt_field(plaintext: &[u8], key_slice: &[u8]) -> Result<EncryptedField, CryptoError> {
    let key = field_key(key_slice)?;
    let cipher = Aes256Gcm::new(&key.into());
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(EncryptedField {
        iv: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

/// Deterministic inverse of [`encrypt_field`]. Any encoding, length or
/// authentication failure surfaces as `DecryptionFailed`; no partial
/// plaintext is ever returned.
pub fn decrypt_field(field: &EncryptedField, key_slice: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = field_key(key_slice)?;
    let nonce = hex::decode(&field.iv).map_err(|_| CryptoError::DecryptionFailed)?;
    if nonce.len() != NONCE_BYTES {
        return Err(CryptoError::DecryptionFailed);
    }
    let ciphertext = hex::decode(&field.ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
    let cipher = Aes256Gcm::new(&key.into());
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}
