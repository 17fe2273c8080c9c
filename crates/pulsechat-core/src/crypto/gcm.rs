//! Authenticated envelope for realtime-channel frames
//!
//! Wire record: `iv (16) || aad (16) || ciphertext || tag (16)`. The base64
//! cipher key delivered over the channel selects AES-GCM-128/192/256.

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit, Nonce, Payload},
    aes::{Aes128, Aes192, Aes256},
    AesGcm,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};

use crate::errors::EnvelopeError;

pub const IV_LEN: usize = 16;
pub const AAD_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
/// Smallest record that can hold IV, AAD and tag
pub const MIN_RECORD_LEN: usize = IV_LEN + AAD_LEN + TAG_LEN;

type Gcm128 = AesGcm<Aes128, U16>;
type Gcm192 = AesGcm<Aes192, U16>;
type Gcm256 = AesGcm<Aes256, U16>;

// ----------------------------------------------------------------------------
// Wire Record
// ----------------------------------------------------------------------------

/// Borrowed view over a parsed wire record
#[derive(Debug, Clone, Copy)]
pub struct CipherRecord<'a> {
    pub iv: &'a [u8],
    pub aad: &'a [u8],
    /// Ciphertext followed by the 16-byte tag
    pub sealed: &'a [u8],
}

impl<'a> CipherRecord<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, EnvelopeError> {
        if data.len() < MIN_RECORD_LEN {
            return Err(EnvelopeError::DataTooShort {
                len: data.len(),
                min: MIN_RECORD_LEN,
            });
        }
        let (iv, rest) = data.split_at(IV_LEN);
        let (aad, sealed) = rest.split_at(AAD_LEN);
        Ok(Self { iv, aad, sealed })
    }

    /// Serialize back into wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.iv.len() + self.aad.len() + self.sealed.len());
        out.extend_from_slice(self.iv);
        out.extend_from_slice(self.aad);
        out.extend_from_slice(self.sealed);
        out
    }
}

// ----------------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------------

/// Decode a base64 cipher key and check its size
pub fn decode_key(key_b64: &str) -> Result<Vec<u8>, EnvelopeError> {
    let key = STANDARD
        .decode(key_b64.trim())
        .map_err(|_| EnvelopeError::InvalidKeyEncoding)?;
    match key.len() {
        16 | 24 | 32 => Ok(key),
        len => Err(EnvelopeError::InvalidKeySize { len }),
    }
}

fn open<C: KeyInit + Aead>(key: &[u8], record: &CipherRecord<'_>) -> Result<Vec<u8>, EnvelopeError> {
    let cipher =
        C::new_from_slice(key).map_err(|_| EnvelopeError::InvalidKeySize { len: key.len() })?;
    cipher
        .decrypt(
            Nonce::<C>::from_slice(record.iv),
            Payload {
                msg: record.sealed,
                aad: record.aad,
            },
        )
        .map_err(|_| EnvelopeError::DecryptionFailed)
}

fn close<C: KeyInit + Aead>(
    key: &[u8],
    iv: &[u8; IV_LEN],
    aad: &[u8; AAD_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let cipher =
        C::new_from_slice(key).map_err(|_| EnvelopeError::InvalidKeySize { len: key.len() })?;
    cipher
        .encrypt(
            Nonce::<C>::from_slice(&iv[..]),
            Payload {
                msg: plaintext,
                aad: &aad[..],
            },
        )
        .map_err(|_| EnvelopeError::EncryptionFailed)
}

// ----------------------------------------------------------------------------
// Envelope Operations
// ----------------------------------------------------------------------------

/// Decrypt a wire record with a base64 cipher key
pub fn decrypt(key_b64: &str, data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let key = decode_key(key_b64)?;
    decrypt_with_key(&key, data)
}

/// Decrypt a wire record with raw key bytes
pub fn decrypt_with_key(key: &[u8], data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let record = CipherRecord::parse(data)?;
    match key.len() {
        16 => open::<Gcm128>(key, &record),
        24 => open::<Gcm192>(key, &record),
        32 => open::<Gcm256>(key, &record),
        len => Err(EnvelopeError::InvalidKeySize { len }),
    }
}

/// Seal a plaintext into a wire record with a fresh random IV and AAD
pub fn seal(key_b64: &str, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let key = decode_key(key_b64)?;
    let mut iv = [0u8; IV_LEN];
    let mut aad = [0u8; AAD_LEN];
    OsRng.fill_bytes(&mut iv);
    OsRng.fill_bytes(&mut aad);
    seal_with(&key, &iv, &aad, plaintext)
}

/// Seal with caller-chosen IV and AAD
pub fn seal_with(
    key: &[u8],
    iv: &[u8; IV_LEN],
    aad: &[u8; AAD_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let sealed = match key.len() {
        16 => close::<Gcm128>(key, iv, aad, plaintext)?,
        24 => close::<Gcm192>(key, iv, aad, plaintext)?,
        32 => close::<Gcm256>(key, iv, aad, plaintext)?,
        len => return Err(EnvelopeError::InvalidKeySize { len }),
    };
    Ok(CipherRecord {
        iv: &iv[..],
        aad: &aad[..],
        sealed: &sealed,
    }
    .to_bytes())
}
