//! Login collaborator
//!
//! The HTTP login flow lives outside the runtime behind [`LoginProvider`].
//! [`LoginRequest`] prepares what every implementation needs to send: the
//! derived key material, the encrypted parameter set and its signature.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use pulsechat_core::crypto::{sign_json, KeyMaterial};
use pulsechat_core::{AccountId, Credentials, PulseError, PulseResult, Session};
use serde_json::{json, Value};

use crate::cookie_store::CookieStoreHandle;

/// Performs the login exchange for one account
#[async_trait]
pub trait LoginProvider: Send + Sync {
    async fn login(
        &self,
        account: &AccountId,
        credentials: &Credentials,
        cookies: &CookieStoreHandle,
    ) -> PulseResult<Session>;
}

/// Provider used when the runtime was built without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoginProvider;

#[async_trait]
impl LoginProvider for NoLoginProvider {
    async fn login(
        &self,
        account: &AccountId,
        _credentials: &Credentials,
        _cookies: &CookieStoreHandle,
    ) -> PulseResult<Session> {
        Err(PulseError::auth(format!(
            "no login provider configured for account {account}"
        )))
    }
}

// ----------------------------------------------------------------------------
// Login Request Preparation
// ----------------------------------------------------------------------------

/// Signed, encrypted login parameters for one attempt
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub material: KeyMaterial,
    /// Query parameters: `zcid`, `zcid_ext`, `enc_ver`, `params`, `type`, `client_version`, `signkey`
    pub query: BTreeMap<String, String>,
}

impl LoginRequest {
    /// Request type signed into the `signkey` parameter
    pub const SIGN_TYPE: &'static str = "getlogininfo";

    /// Prepare a login request using the current wall clock as first-launch time
    pub fn prepare(credentials: &Credentials) -> PulseResult<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::prepare_at(credentials, now)
    }

    pub fn prepare_at(credentials: &Credentials, first_launch_time: u64) -> PulseResult<Self> {
        let material = KeyMaterial::derive(
            credentials.api_type(),
            credentials.device_id(),
            first_launch_time,
        )?;

        let params = json!({
            "computer_name": "Web",
            "imei": credentials.device_id(),
            "language": credentials.language(),
            "ts": first_launch_time,
        });
        let mut query = material.request_params(&params)?;
        query.insert("type".into(), credentials.api_type().to_string());
        query.insert("client_version".into(), credentials.api_version().to_string());

        let signed: serde_json::Map<String, Value> = query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        query.insert("signkey".into(), sign_json(Self::SIGN_TYPE, &signed));

        Ok(Self { material, query })
    }

    /// Decrypt the `data` field of a login response
    pub fn decode_response(&self, data: &str) -> PulseResult<Value> {
        Ok(self.material.decrypt_response(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie_store::{CookieJar, CookieStoreHandle};
    use pulsechat_core::crypto::sign;

    fn credentials() -> Credentials {
        Credentials::builder()
            .device_id("device-1")
            .cookie("a=1")
            .user_agent("ua")
            .build()
            .unwrap()
    }

    #[test]
    fn test_prepare_signs_every_parameter() {
        let request = LoginRequest::prepare_at(&credentials(), 1_700_000_000_000).unwrap();
        let query = &request.query;
        assert_eq!(query["type"], "30");
        assert_eq!(query["client_version"], "665");
        assert_eq!(query["enc_ver"], "v2");

        let unsigned: Vec<(&str, &str)> = query
            .iter()
            .filter(|(k, _)| k.as_str() != "signkey")
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(query["signkey"], sign(LoginRequest::SIGN_TYPE, unsigned));
    }

    #[test]
    fn test_params_decrypt_with_material() {
        let request = LoginRequest::prepare_at(&credentials(), 1).unwrap();
        let params = request.decode_response(&request.query["params"]).unwrap();
        assert_eq!(params["imei"], "device-1");
        assert_eq!(params["language"], "vi");
    }

    #[tokio::test]
    async fn test_no_login_provider_fails_with_auth() {
        let account = AccountId::new("acc1").unwrap();
        let (cookies, _task) = CookieStoreHandle::spawn(account.clone(), CookieJar::default(), 4);
        let err = NoLoginProvider
            .login(&account, &credentials(), &cookies)
            .await
            .unwrap_err();
        assert!(err.requires_reauth());
        assert!(!err.is_retryable());
    }
}
