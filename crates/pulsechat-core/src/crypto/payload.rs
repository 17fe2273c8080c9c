//! Realtime event payload decoding
//!
//! Frame bodies carry `{"data": <string>, "encrypt": <mode>}`:
//!
//! | mode | pipeline |
//! |------|----------|
//! | 0 | `data` is JSON text |
//! | 1 | base64 → zlib inflate |
//! | 2 | percent-decode → base64 → authenticated decrypt → zlib inflate |
//! | 3 | percent-decode → base64 → authenticated decrypt |

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::gcm;
use crate::errors::EnvelopeError;

/// Encoding applied to an event body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Plain,
    Compressed,
    EncryptedCompressed,
    Encrypted,
}

impl PayloadEncoding {
    pub fn from_mode(mode: u64) -> Result<Self, EnvelopeError> {
        match mode {
            0 => Ok(PayloadEncoding::Plain),
            1 => Ok(PayloadEncoding::Compressed),
            2 => Ok(PayloadEncoding::EncryptedCompressed),
            3 => Ok(PayloadEncoding::Encrypted),
            mode => Err(EnvelopeError::UnsupportedMode { mode }),
        }
    }

    pub fn mode(self) -> u64 {
        match self {
            PayloadEncoding::Plain => 0,
            PayloadEncoding::Compressed => 1,
            PayloadEncoding::EncryptedCompressed => 2,
            PayloadEncoding::Encrypted => 3,
        }
    }

    fn is_encrypted(self) -> bool {
        matches!(
            self,
            PayloadEncoding::EncryptedCompressed | PayloadEncoding::Encrypted
        )
    }

    fn is_compressed(self) -> bool {
        matches!(
            self,
            PayloadEncoding::Compressed | PayloadEncoding::EncryptedCompressed
        )
    }
}

/// Wire shape of an encoded event body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedPayload {
    pub data: String,
    #[serde(default)]
    pub encrypt: u64,
}

// ----------------------------------------------------------------------------
// Decode
// ----------------------------------------------------------------------------

/// Decode an event body into JSON using the current cipher key
pub fn decode(payload: &EncodedPayload, cipher_key: Option<&str>) -> Result<Value, EnvelopeError> {
    let encoding = PayloadEncoding::from_mode(payload.encrypt)?;
    if encoding == PayloadEncoding::Plain {
        return parse_json(payload.data.as_bytes());
    }

    let text = if encoding.is_encrypted() {
        percent_decode_str(&payload.data)
            .decode_utf8()
            .map_err(|_| EnvelopeError::InvalidCiphertextEncoding)?
            .into_owned()
    } else {
        payload.data.clone()
    };
    let mut bytes = STANDARD
        .decode(text.trim())
        .map_err(|_| EnvelopeError::InvalidCiphertextEncoding)?;

    if encoding.is_encrypted() {
        let key = cipher_key.ok_or(EnvelopeError::MissingCipherKey)?;
        bytes = gcm::decrypt(key, &bytes)?;
    }
    if encoding.is_compressed() {
        bytes = inflate(&bytes)?;
    }
    parse_json(&bytes)
}

/// Decode a raw JSON body value (the shape found inside frames)
pub fn decode_value(body: &Value, cipher_key: Option<&str>) -> Result<Value, EnvelopeError> {
    let payload: EncodedPayload =
        serde_json::from_value(body.clone()).map_err(|e| EnvelopeError::InvalidJson {
            reason: e.to_string(),
        })?;
    decode(&payload, cipher_key)
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|_| EnvelopeError::DecompressionFailed)?;
    Ok(out)
}

fn parse_json(bytes: &[u8]) -> Result<Value, EnvelopeError> {
    let text = core::str::from_utf8(bytes).map_err(|_| EnvelopeError::InvalidUtf8)?;
    serde_json::from_str(text).map_err(|e| EnvelopeError::InvalidJson {
        reason: e.to_string(),
    })
}

// ----------------------------------------------------------------------------
// Encode
// ----------------------------------------------------------------------------

/// Encode a JSON value the way the server does (used for outbound frames and fixtures)
pub fn encode(
    value: &Value,
    encoding: PayloadEncoding,
    cipher_key: Option<&str>,
) -> Result<EncodedPayload, EnvelopeError> {
    let json = value.to_string();
    if encoding == PayloadEncoding::Plain {
        return Ok(EncodedPayload {
            data: json,
            encrypt: encoding.mode(),
        });
    }

    let mut bytes = json.into_bytes();
    if encoding.is_compressed() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&bytes)
            .map_err(|_| EnvelopeError::EncryptionFailed)?;
        bytes = encoder
            .finish()
            .map_err(|_| EnvelopeError::EncryptionFailed)?;
    }
    if encoding.is_encrypted() {
        let key = cipher_key.ok_or(EnvelopeError::MissingCipherKey)?;
        bytes = gcm::seal(key, &bytes)?;
    }
    Ok(EncodedPayload {
        data: STANDARD.encode(&bytes),
        encrypt: encoding.mode(),
    })
}
