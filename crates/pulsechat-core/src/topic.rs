//! Bus topic model
//!
//! Topics are `"ns:<account-id>:<event-type>[:<sub-type>]"`. Event and sub
//! types are closed enumerations; parsing never fabricates a variant for an
//! unknown string.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::TopicError;
use crate::types::AccountId;

/// Literal namespace prefix of every topic
pub const NAMESPACE: &str = "ns";

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// Closed set of events published on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Connection lifecycle
    Connected,
    Disconnected,
    Closed,
    Error,
    Ready,
    RuntimeStarted,
    LoginStart,
    // Domain events
    Message,
    OldMessages,
    Reaction,
    OldReactions,
    Typing,
    Seen,
    Delivered,
    FriendEvent,
    GroupEvent,
    UploadAttachment,
    Undo,
    CipherKey,
}

impl EventType {
    pub const ALL: [EventType; 19] = [
        EventType::Connected,
        EventType::Disconnected,
        EventType::Closed,
        EventType::Error,
        EventType::Ready,
        EventType::RuntimeStarted,
        EventType::LoginStart,
        EventType::Message,
        EventType::OldMessages,
        EventType::Reaction,
        EventType::OldReactions,
        EventType::Typing,
        EventType::Seen,
        EventType::Delivered,
        EventType::FriendEvent,
        EventType::GroupEvent,
        EventType::UploadAttachment,
        EventType::Undo,
        EventType::CipherKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Disconnected => "disconnected",
            EventType::Closed => "closed",
            EventType::Error => "error",
            EventType::Ready => "ready",
            EventType::RuntimeStarted => "runtime_started",
            EventType::LoginStart => "login_start",
            EventType::Message => "message",
            EventType::OldMessages => "old_messages",
            EventType::Reaction => "reaction",
            EventType::OldReactions => "old_reactions",
            EventType::Typing => "typing",
            EventType::Seen => "seen",
            EventType::Delivered => "delivered",
            EventType::FriendEvent => "friend_event",
            EventType::GroupEvent => "group_event",
            EventType::UploadAttachment => "upload_attachment",
            EventType::Undo => "undo",
            EventType::CipherKey => "cipher_key",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| TopicError::UnknownEventType { value: s.to_string() })
    }
}

/// Closed set of event sub-types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubType {
    User,
    Group,
}

impl SubType {
    pub const ALL: [SubType; 2] = [SubType::User, SubType::Group];

    pub fn as_str(self) -> &'static str {
        match self {
            SubType::User => "user",
            SubType::Group => "group",
        }
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubType {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(SubType::User),
            "group" => Ok(SubType::Group),
            other => Err(TopicError::UnknownSubType {
                value: other.to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Topic
// ----------------------------------------------------------------------------

/// Decomposed bus address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub account: AccountId,
    pub event: EventType,
    pub sub: Option<SubType>,
}

impl Topic {
    pub fn new(account: AccountId, event: EventType) -> Self {
        Self {
            account,
            event,
            sub: None,
        }
    }

    pub fn with_sub(account: AccountId, event: EventType, sub: SubType) -> Self {
        Self {
            account,
            event,
            sub: Some(sub),
        }
    }

    /// Parse a topic string, rejecting anything outside the closed vocabulary
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let mut parts = topic.split(':');
        let (namespace, account, event) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(account), Some(event)) => (ns, account, event),
            _ => {
                return Err(TopicError::Malformed {
                    topic: topic.to_string(),
                })
            }
        };
        let sub = parts.next();
        if parts.next().is_some() {
            return Err(TopicError::Malformed {
                topic: topic.to_string(),
            });
        }

        if namespace != NAMESPACE {
            return Err(TopicError::UnknownNamespace {
                namespace: namespace.to_string(),
            });
        }

        Ok(Self {
            account: AccountId::new(account)?,
            event: event.parse::<EventType>()?,
            sub: sub.map(str::parse::<SubType>).transpose()?,
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", NAMESPACE, self.account, self.event)?;
        if let Some(sub) = self.sub {
            write!(f, ":{sub}")?;
        }
        Ok(())
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Topic::parse(&s).map_err(serde::de::Error::custom)
    }
}
