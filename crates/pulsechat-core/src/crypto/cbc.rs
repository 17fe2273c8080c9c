//! Block-cipher envelope
//!
//! AES-CBC with an all-zero IV and PKCS7 padding, used for HTTP bodies and
//! for key derivation. The key length selects AES-128/192/256.

use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use percent_encoding::percent_decode_str;

use crate::errors::EnvelopeError;

pub const BLOCK_SIZE: usize = 16;
const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

// ----------------------------------------------------------------------------
// Key and Output Encodings
// ----------------------------------------------------------------------------

/// How a CBC key is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbcKey<'a> {
    /// Raw UTF-8 bytes of a textual key (the protocol uses 32-character strings)
    Text(&'a str),
    /// Binary key carried as standard base64
    Base64(&'a str),
}

impl CbcKey<'_> {
    /// Resolve the raw key bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            CbcKey::Text(key) => Ok(key.as_bytes().to_vec()),
            CbcKey::Base64(key) => STANDARD
                .decode(key.trim())
                .map_err(|_| EnvelopeError::InvalidKeyEncoding),
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, CbcKey::Text(_))
    }
}

/// Text encoding of ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEncoding {
    Hex,
    HexUpper,
    Base64,
}

impl OutputEncoding {
    fn encode(self, bytes: &[u8]) -> String {
        match self {
            OutputEncoding::Hex => hex::encode(bytes),
            OutputEncoding::HexUpper => hex::encode_upper(bytes),
            OutputEncoding::Base64 => STANDARD.encode(bytes),
        }
    }

    fn decode(self, text: &str) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            OutputEncoding::Hex | OutputEncoding::HexUpper => {
                hex::decode(text.trim()).map_err(|_| EnvelopeError::InvalidCiphertextEncoding)
            }
            OutputEncoding::Base64 => STANDARD
                .decode(text.trim())
                .map_err(|_| EnvelopeError::InvalidCiphertextEncoding),
        }
    }
}

// ----------------------------------------------------------------------------
// Padding
// ----------------------------------------------------------------------------

/// Append PKCS7 padding up to the next block boundary
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip PKCS7 padding, returning the input unchanged when it is not valid padding.
///
/// The server occasionally sends bodies that are already unpadded; the
/// protocol clients accept them as-is, so malformed padding is not an error.
pub fn pkcs7_unpad(data: &[u8]) -> Vec<u8> {
    let Some(&last) = data.last() else {
        return Vec::new();
    };
    let pad = last as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return data.to_vec();
    }
    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().all(|&b| b == last) {
        body.to_vec()
    } else {
        data.to_vec()
    }
}

// ----------------------------------------------------------------------------
// Raw Byte Operations
// ----------------------------------------------------------------------------

/// Encrypt raw bytes; the output always carries PKCS7 padding
pub fn encrypt_bytes(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let invalid = |_| EnvelopeError::InvalidKeySize { len: key.len() };
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        len => return Err(EnvelopeError::InvalidKeySize { len }),
    };
    Ok(ciphertext)
}

/// Decrypt raw bytes and strip padding tolerantly
pub fn decrypt_bytes(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if ciphertext.is_empty() {
        return Ok(Vec::new());
    }
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(EnvelopeError::InvalidBlockLength {
            len: ciphertext.len(),
        });
    }
    let invalid = |_| EnvelopeError::InvalidKeySize { len: key.len() };
    let padded = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        len => return Err(EnvelopeError::InvalidKeySize { len }),
    }
    .map_err(|_| EnvelopeError::DecryptionFailed)?;
    Ok(pkcs7_unpad(&padded))
}

// ----------------------------------------------------------------------------
// Text Envelope
// ----------------------------------------------------------------------------

/// Encrypt a UTF-8 plaintext and encode the ciphertext as text
pub fn encrypt(
    key: CbcKey<'_>,
    plaintext: &str,
    encoding: OutputEncoding,
) -> Result<String, EnvelopeError> {
    let key = key.to_bytes()?;
    let ciphertext = encrypt_bytes(&key, plaintext.as_bytes())?;
    Ok(encoding.encode(&ciphertext))
}

/// Decrypt text-encoded ciphertext back to a UTF-8 plaintext.
///
/// Ciphertext produced for a textual key arrives URL-encoded from the server,
/// so that path percent-decodes before the binary decode step.
pub fn decrypt(
    key: CbcKey<'_>,
    ciphertext: &str,
    encoding: OutputEncoding,
) -> Result<String, EnvelopeError> {
    let raw_key = key.to_bytes()?;
    let bytes = if key.is_text() {
        let decoded = percent_decode_str(ciphertext)
            .decode_utf8()
            .map_err(|_| EnvelopeError::InvalidCiphertextEncoding)?;
        encoding.decode(&decoded)?
    } else {
        encoding.decode(ciphertext)?
    };
    let plaintext = decrypt_bytes(&raw_key, &bytes)?;
    String::from_utf8(plaintext).map_err(|_| EnvelopeError::InvalidUtf8)
}
