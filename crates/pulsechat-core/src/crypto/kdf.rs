//! Login-time key derivation
//!
//! The server only accepts a login whose parameters are encrypted under a key
//! derived from the device fingerprint by a fixed character interleaving. The
//! interleaving is an obfuscation contract with the server, not a primitive,
//! and must match bit for bit.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use super::cbc::{self, CbcKey, OutputEncoding};
use crate::errors::EnvelopeError;

/// Shared textual key used to derive the device fingerprint
pub const FINGERPRINT_KEY: &str = "3FC4F0D2AB50057BCE0D90D9187A22B1";
/// Encryption version tag sent alongside the derived material
pub const PROTOCOL_VERSION: &str = "v2";

const EXTENSION_MIN_LEN: usize = 6;
const EXTENSION_MAX_LEN: usize = 12;
const MAX_DERIVATION_RETRIES: usize = 3;

// ----------------------------------------------------------------------------
// Key Material
// ----------------------------------------------------------------------------

/// Ephemeral material for one login attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Uppercase hex device fingerprint
    pub fingerprint: String,
    /// Random lowercase hex extension
    pub extension: String,
    /// 32-character textual key for login parameter encryption
    pub encrypt_key: String,
    /// Protocol version tag
    pub version: &'static str,
}

impl KeyMaterial {
    /// Derive material with the thread-local RNG
    pub fn derive(
        api_type: u32,
        device_id: &str,
        first_launch_time: u64,
    ) -> Result<Self, EnvelopeError> {
        Self::derive_with_rng(api_type, device_id, first_launch_time, &mut rand::thread_rng())
    }

    /// Derive material with a caller-supplied RNG
    pub fn derive_with_rng<R: Rng + ?Sized>(
        api_type: u32,
        device_id: &str,
        first_launch_time: u64,
        rng: &mut R,
    ) -> Result<Self, EnvelopeError> {
        let fingerprint = derive_fingerprint(api_type, device_id, first_launch_time)?;

        for attempt in 0..=MAX_DERIVATION_RETRIES {
            let extension = random_extension(rng);
            if let Some(encrypt_key) = derive_encrypt_key(&extension, &fingerprint) {
                return Ok(Self {
                    fingerprint,
                    extension,
                    encrypt_key,
                    version: PROTOCOL_VERSION,
                });
            }
            debug!(attempt, extension = %extension, "Derived key too short, retrying");
        }

        Err(EnvelopeError::KeyDerivationFailed)
    }

    /// Encrypt login parameters under the derived key (base64 output)
    pub fn encrypt_params(&self, params: &Value) -> Result<String, EnvelopeError> {
        let plaintext = params.to_string();
        cbc::encrypt(
            CbcKey::Text(&self.encrypt_key),
            &plaintext,
            OutputEncoding::Base64,
        )
    }

    /// Decrypt a login response body encrypted under the derived key
    pub fn decrypt_response(&self, data: &str) -> Result<Value, EnvelopeError> {
        let plaintext = cbc::decrypt(
            CbcKey::Text(&self.encrypt_key),
            data,
            OutputEncoding::Base64,
        )?;
        serde_json::from_str(&plaintext).map_err(|e| EnvelopeError::InvalidJson {
            reason: e.to_string(),
        })
    }

    /// Query parameters carried by an encrypted login request
    pub fn request_params(&self, params: &Value) -> Result<BTreeMap<String, String>, EnvelopeError> {
        let mut out = BTreeMap::new();
        out.insert("zcid".to_string(), self.fingerprint.clone());
        out.insert("zcid_ext".to_string(), self.extension.clone());
        out.insert("enc_ver".to_string(), self.version.to_string());
        out.insert("params".to_string(), self.encrypt_params(params)?);
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// Derivation Steps
// ----------------------------------------------------------------------------

/// Uppercase hex CBC encryption of `"<type>,<device-id>,<first-launch-time>"`
pub fn derive_fingerprint(
    api_type: u32,
    device_id: &str,
    first_launch_time: u64,
) -> Result<String, EnvelopeError> {
    let message = format!("{api_type},{device_id},{first_launch_time}");
    cbc::encrypt(
        CbcKey::Text(FINGERPRINT_KEY),
        &message,
        OutputEncoding::HexUpper,
    )
}

/// Random lowercase hex string of length 6..=12
pub fn random_extension<R: Rng + ?Sized>(rng: &mut R) -> String {
    let len = rng.gen_range(EXTENSION_MIN_LEN..=EXTENSION_MAX_LEN);
    (0..len)
        .map(|_| {
            let nibble: u32 = rng.gen_range(0..16);
            char::from_digit(nibble, 16).unwrap_or('0')
        })
        .collect()
}

/// Split a string into its even-index and odd-index characters
fn split_even_odd(s: &str) -> (Vec<char>, Vec<char>) {
    let mut even = Vec::with_capacity(s.len() / 2 + 1);
    let mut odd = Vec::with_capacity(s.len() / 2);
    for (i, c) in s.chars().enumerate() {
        if i % 2 == 0 {
            even.push(c);
        } else {
            odd.push(c);
        }
    }
    (even, odd)
}

/// Interleave the MD5 of the extension with the fingerprint.
///
/// Returns `None` when either input is too short to supply the required
/// characters.
pub fn derive_encrypt_key(extension: &str, fingerprint: &str) -> Option<String> {
    let digest = hex::encode_upper(Md5::digest(extension.as_bytes()));
    let (digest_even, _) = split_even_odd(&digest);
    let (fp_even, fp_odd) = split_even_odd(fingerprint);

    if digest_even.len() < 8 || fp_even.len() < 12 || fp_odd.len() < 12 {
        return None;
    }

    let mut key = String::with_capacity(32);
    key.extend(&digest_even[..8]);
    key.extend(&fp_even[..12]);
    key.extend(fp_odd.iter().rev().take(12));
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_split_even_odd() {
        let (even, odd) = split_even_odd("ABCDEFG");
        assert_eq!(even.iter().collect::<String>(), "ACEG");
        assert_eq!(odd.iter().collect::<String>(), "BDF");
    }

    #[test]
    fn test_encrypt_key_interleaving() {
        // 32-char fingerprint: even = 0..f doubled pattern, odd = reversed letters
        let fingerprint = "0a1b2c3d4e5f6g7h8i9jAkBlCmDnEoFp";
        let key = derive_encrypt_key("abc123", fingerprint).unwrap();

        let digest = hex::encode_upper(Md5::digest(b"abc123"));
        let digest_even: String = digest.chars().step_by(2).take(8).collect();

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..8], digest_even);
        assert_eq!(&key[8..20], "0123456789AB");
        assert_eq!(&key[20..], "ponmlkjihgfe");
    }

    #[test]
    fn test_encrypt_key_rejects_short_fingerprint() {
        assert!(derive_encrypt_key("abc123", "ABCDEF").is_none());
    }

    #[test]
    fn test_extension_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let ext = random_extension(&mut rng);
            assert!((6..=12).contains(&ext.len()));
            assert!(ext.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_fingerprint_is_uppercase_hex_and_deterministic() {
        let a = derive_fingerprint(30, "device-1", 1_700_000_000_000).unwrap();
        let b = derive_fingerprint(30, "device-1", 1_700_000_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len() % 32, 0);
        assert!(a.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[test]
    fn test_material_encrypts_params() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let material = KeyMaterial::derive_with_rng(30, "device-1", 1, &mut rng).unwrap();
        assert_eq!(material.encrypt_key.len(), 32);
        assert_eq!(material.version, "v2");

        let params = serde_json::json!({"imei": "device-1", "language": "vi"});
        let encrypted = material.encrypt_params(&params).unwrap();
        assert_eq!(material.decrypt_response(&encrypted).unwrap(), params);

        let query = material.request_params(&params).unwrap();
        assert_eq!(query["enc_ver"], "v2");
        assert_eq!(query["zcid"], material.fingerprint);
    }
}
