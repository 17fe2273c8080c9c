//! Cookie Store
//!
//! Domain-scoped cookie jar owned by one task per account. Seeded from the
//! credential cookie blob, which is either a `Cookie` header string or a JSON
//! export (`[{domain, name, value}]` or `{"cookies": [...]}`).

use std::collections::BTreeMap;

use pulsechat_core::{AccountId, PulseError, PulseResult};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Domain key for cookies that apply to every host
const ANY_DOMAIN: &str = "";

// ----------------------------------------------------------------------------
// Jar
// ----------------------------------------------------------------------------

/// In-memory cookie jar: domain → name → value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    domains: BTreeMap<String, BTreeMap<String, String>>,
}

impl CookieJar {
    /// Build a jar from a credential cookie blob
    pub fn from_blob(blob: &str) -> Self {
        let mut jar = Self::default();
        let trimmed = blob.trim();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                jar.load_json(&value);
                return jar;
            }
        }
        jar.load_header(ANY_DOMAIN, trimmed);
        jar
    }

    fn load_json(&mut self, value: &Value) {
        let entries: &[Value] = match value {
            Value::Array(entries) => entries.as_slice(),
            Value::Object(map) => match map.get("cookies") {
                Some(Value::Array(entries)) => entries.as_slice(),
                _ => &[],
            },
            _ => &[],
        };
        for entry in entries {
            let name = entry.get("name").or_else(|| entry.get("key")).and_then(Value::as_str);
            let value = entry.get("value").and_then(Value::as_str);
            if let (Some(name), Some(value)) = (name, value) {
                let domain = entry.get("domain").and_then(Value::as_str).unwrap_or(ANY_DOMAIN);
                self.set(domain, name, value);
            }
        }
    }

    fn load_header(&mut self, domain: &str, header: &str) {
        for pair in header.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.set(domain, name, value.trim());
                }
            }
        }
    }

    pub fn set(&mut self, domain: &str, name: &str, value: &str) {
        self.domains
            .entry(normalize_domain(domain))
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, domain: &str, name: &str) -> Option<&str> {
        self.domains
            .get(&normalize_domain(domain))
            .and_then(|cookies| cookies.get(name))
            .map(String::as_str)
    }

    pub fn remove(&mut self, domain: &str, name: &str) -> Option<String> {
        self.domains
            .get_mut(&normalize_domain(domain))
            .and_then(|cookies| cookies.remove(name))
    }

    pub fn len(&self) -> usize {
        self.domains.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the `Cookie` header for a host; more specific domains win
    pub fn header_for(&self, host: &str) -> String {
        let host = host.to_ascii_lowercase();
        let mut matched: BTreeMap<&str, &str> = BTreeMap::new();

        let mut applicable: Vec<(&String, &BTreeMap<String, String>)> = self
            .domains
            .iter()
            .filter(|(domain, _)| domain_matches(domain, &host))
            .collect();
        applicable.sort_by_key(|(domain, _)| domain.len());

        for (_, cookies) in applicable {
            for (name, value) in cookies {
                matched.insert(name, value);
            }
        }

        matched
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn domain_matches(domain: &str, host: &str) -> bool {
    domain.is_empty()
        || host == domain
        || (host.ends_with(domain) && host[..host.len() - domain.len()].ends_with('.'))
}

/// Host part of a URL such as `wss://chat.example.com:443/ws?x=1`
pub fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    authority.split(':').next().unwrap_or(authority)
}

// ----------------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------------

enum CookieCommand {
    Set {
        domain: String,
        name: String,
        value: String,
    },
    Get {
        domain: String,
        name: String,
        reply: oneshot::Sender<Option<String>>,
    },
    HeaderFor {
        url: String,
        reply: oneshot::Sender<String>,
    },
    Snapshot {
        reply: oneshot::Sender<CookieJar>,
    },
    Clear,
}

/// Handle to an account's cookie store task
#[derive(Clone)]
pub struct CookieStoreHandle {
    sender: mpsc::Sender<CookieCommand>,
}

impl CookieStoreHandle {
    /// Spawn a store task seeded with `jar`
    pub fn spawn(
        account: AccountId,
        jar: CookieJar,
        mailbox_size: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(mailbox_size.max(1));
        let task = tokio::spawn(run(account, jar, receiver));
        (Self { sender }, task)
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub async fn set(&self, domain: &str, name: &str, value: &str) -> PulseResult<()> {
        self.sender
            .send(CookieCommand::Set {
                domain: domain.to_string(),
                name: name.to_string(),
                value: value.to_string(),
            })
            .await
            .map_err(|_| PulseError::closed("cookie store"))
    }

    pub async fn get(&self, domain: &str, name: &str) -> PulseResult<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.call(
            CookieCommand::Get {
                domain: domain.to_string(),
                name: name.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// `Cookie` header value for requests to `url`
    pub async fn header_for(&self, url: &str) -> PulseResult<String> {
        let (reply, rx) = oneshot::channel();
        self.call(
            CookieCommand::HeaderFor {
                url: url.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn snapshot(&self) -> PulseResult<CookieJar> {
        let (reply, rx) = oneshot::channel();
        self.call(CookieCommand::Snapshot { reply }, rx).await
    }

    pub async fn clear(&self) -> PulseResult<()> {
        self.sender
            .send(CookieCommand::Clear)
            .await
            .map_err(|_| PulseError::closed("cookie store"))
    }

    async fn call<T>(&self, command: CookieCommand, rx: oneshot::Receiver<T>) -> PulseResult<T> {
        self.sender
            .send(command)
            .await
            .map_err(|_| PulseError::closed("cookie store"))?;
        rx.await.map_err(|_| PulseError::closed("cookie store"))
    }
}

async fn run(account: AccountId, mut jar: CookieJar, mut receiver: mpsc::Receiver<CookieCommand>) {
    info!(account = %account, cookies = jar.len(), "Cookie store started");
    while let Some(command) = receiver.recv().await {
        match command {
            CookieCommand::Set {
                domain,
                name,
                value,
            } => {
                debug!(account = %account, domain = %domain, name = %name, "Cookie set");
                jar.set(&domain, &name, &value);
            }
            CookieCommand::Get {
                domain,
                name,
                reply,
            } => {
                let _ = reply.send(jar.get(&domain, &name).map(str::to_string));
            }
            CookieCommand::HeaderFor { url, reply } => {
                let _ = reply.send(jar.header_for(host_of(&url)));
            }
            CookieCommand::Snapshot { reply } => {
                let _ = reply.send(jar.clone());
            }
            CookieCommand::Clear => jar = CookieJar::default(),
        }
    }
    debug!(account = %account, "Cookie store stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_blob() {
        let jar = CookieJar::from_blob("zpw_sek=abc; zpsid=xyz ;  broken");
        assert_eq!(jar.len(), 2);
        assert_eq!(jar.header_for("chat.example.com"), "zpsid=xyz; zpw_sek=abc");
    }

    #[test]
    fn test_json_blob_scopes_domains() {
        let jar = CookieJar::from_blob(
            r#"{"cookies": [
                {"domain": ".example.com", "name": "a", "value": "1"},
                {"domain": "chat.example.com", "name": "a", "value": "2"},
                {"domain": "other.net", "name": "b", "value": "3"}
            ]}"#,
        );
        assert_eq!(jar.header_for("chat.example.com"), "a=2");
        assert_eq!(jar.header_for("file.example.com"), "a=1");
        assert_eq!(jar.header_for("badexample.com"), "");
        assert_eq!(jar.header_for("other.net"), "b=3");
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("wss://ws1.example.com:443/ws?x=1"), "ws1.example.com");
        assert_eq!(host_of("http://127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(host_of("example.com/path"), "example.com");
    }

    #[tokio::test]
    async fn test_store_actor() {
        let account = AccountId::new("acc1").unwrap();
        let (store, _task) = CookieStoreHandle::spawn(account, CookieJar::from_blob("a=1"), 8);
        store.set("example.com", "b", "2").await.unwrap();
        assert_eq!(store.get("example.com", "b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.header_for("wss://ws.example.com/").await.unwrap(), "a=1; b=2");

        store.clear().await.unwrap();
        assert!(store.snapshot().await.unwrap().is_empty());
        assert!(store.is_alive());
    }
}
