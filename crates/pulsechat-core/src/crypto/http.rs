//! HTTP body helpers over the block-cipher envelope
//!
//! Endpoint wrappers encrypt a JSON parameter object with the session secret
//! key and unwrap `{error_code, error_message, data}` responses whose `data`
//! is itself an encrypted JSON document of the same shape.

use serde::Deserialize;
use serde_json::Value;

use super::cbc::{self, CbcKey, OutputEncoding};
use crate::errors::{PulseError, PulseResult};

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Encrypt request parameters with the session secret key (base64 in, base64 out)
pub fn encode_params(secret_key: &str, params: &Value) -> PulseResult<String> {
    let plaintext = params.to_string();
    Ok(cbc::encrypt(
        CbcKey::Base64(secret_key),
        &plaintext,
        OutputEncoding::Base64,
    )?)
}

/// Decrypt and unwrap an encrypted HTTP response body
pub fn decode_response(secret_key: &str, body: &str) -> PulseResult<Value> {
    let outer: ResponseEnvelope = serde_json::from_str(body)?;
    check_code(&outer)?;

    let encrypted = match &outer.data {
        Value::String(s) => s,
        Value::Null => return Err(PulseError::api(-1, "response carried no data")),
        other => return Ok(other.clone()),
    };

    let plaintext = cbc::decrypt(
        CbcKey::Base64(secret_key),
        encrypted,
        OutputEncoding::Base64,
    )?;
    let inner: ResponseEnvelope = serde_json::from_str(&plaintext)?;
    check_code(&inner)?;
    Ok(inner.data)
}

fn check_code(envelope: &ResponseEnvelope) -> PulseResult<()> {
    if envelope.error_code == 0 {
        return Ok(());
    }
    let message = envelope
        .error_message
        .clone()
        .unwrap_or_else(|| "request failed".to_string());
    Err(PulseError::api(envelope.error_code, message))
}
