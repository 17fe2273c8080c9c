//! Cryptographic envelope
//!
//! - `cbc`: block-cipher envelope for HTTP bodies and key derivation
//! - `gcm`: authenticated envelope for realtime frames
//! - `kdf`: login-time key derivation material
//! - `signing`: request signatures
//! - `payload`: realtime event body decoding
//! - `http`: encrypted request/response helpers

pub mod cbc;
pub mod gcm;
pub mod http;
pub mod kdf;
pub mod payload;
pub mod signing;

pub use cbc::{CbcKey, OutputEncoding};
pub use kdf::KeyMaterial;
pub use payload::{EncodedPayload, PayloadEncoding};
pub use signing::{sign, sign_json};
