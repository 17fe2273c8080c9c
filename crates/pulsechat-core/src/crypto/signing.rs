//! Request signing
//!
//! `md5("zsecure" + <type> + <values ordered by parameter name>)`, lowercase
//! hex. The signature depends only on the (type, parameters) pair, never on
//! the caller's insertion order.

use md5::{Digest, Md5};
use serde_json::{Map, Value};

/// Prefix mixed into every signature
pub const SIGN_NAMESPACE: &str = "zsecure";

/// Sign a request from string parameters
pub fn sign<I, K, V>(request_type: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(K, V)> = params.into_iter().collect();
    pairs.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

    let mut hasher = Md5::new();
    hasher.update(SIGN_NAMESPACE.as_bytes());
    hasher.update(request_type.as_bytes());
    for (_, value) in &pairs {
        hasher.update(value.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Sign a request from a JSON object; strings contribute their raw text,
/// other values their JSON rendering
pub fn sign_json(request_type: &str, params: &Map<String, Value>) -> String {
    sign(
        request_type,
        params.iter().map(|(k, v)| (k.as_str(), value_text(v))),
    )
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
