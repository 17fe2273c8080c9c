//! Realtime frame codec and command routing
//!
//! Every frame is a 4-byte header followed by a UTF-8 JSON body:
//!
//! ```text
//! +---------+-----------------+---------+----------------------+
//! | version | cmd (u16, LE)   | sub_cmd | body (UTF-8 JSON)    |
//! | 1 byte  | 2 bytes         | 1 byte  | remaining bytes      |
//! +---------+-----------------+---------+----------------------+
//! ```

use serde_json::{json, Value};

use crate::errors::FrameError;
use crate::topic::{EventType, SubType};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const HEADER_LEN: usize = 4;
pub const FRAME_VERSION: u8 = 1;

pub const CMD_CIPHER_KEY: u16 = 1;
pub const CMD_PING: u16 = 2;
pub const CMD_DUPLICATE: u16 = 3000;
pub const CMD_MESSAGE_USER: u16 = 501;
pub const CMD_SEEN_USER: u16 = 502;
pub const CMD_DELIVERED_USER: u16 = 503;
pub const CMD_UNDO: u16 = 504;
pub const CMD_OLD_MESSAGES_USER: u16 = 510;
pub const CMD_OLD_MESSAGES_GROUP: u16 = 511;
pub const CMD_MESSAGE_GROUP: u16 = 521;
pub const CMD_SEEN_GROUP: u16 = 522;
pub const CMD_DELIVERED_GROUP: u16 = 523;
pub const CMD_CONTROL: u16 = 601;
pub const CMD_TYPING: u16 = 602;
pub const CMD_OLD_REACTIONS_USER: u16 = 610;
pub const CMD_OLD_REACTIONS_GROUP: u16 = 611;
pub const CMD_REACTION: u16 = 612;

/// Normal closure; the peer is done with us
pub const CLOSE_NORMAL: u16 = 1000;
/// The account was opened elsewhere
pub const CLOSE_DUPLICATE: u16 = 3000;

/// Whether a close with this code should be followed by a reconnect
pub fn is_retryable_close(code: Option<u16>) -> bool {
    !matches!(code, Some(CLOSE_NORMAL) | Some(CLOSE_DUPLICATE))
}

// ----------------------------------------------------------------------------
// Frame Codec
// ----------------------------------------------------------------------------

/// Fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    pub version: u8,
    pub cmd: u16,
    pub sub_cmd: u8,
}

impl FrameHeader {
    pub fn new(cmd: u16, sub_cmd: u8) -> Self {
        Self {
            version: FRAME_VERSION,
            cmd,
            sub_cmd,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let cmd = self.cmd.to_le_bytes();
        [self.version, cmd[0], cmd[1], self.sub_cmd]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                header: HEADER_LEN,
            });
        }
        Ok(Self {
            version: bytes[0],
            cmd: u16::from_le_bytes([bytes[1], bytes[2]]),
            sub_cmd: bytes[3],
        })
    }
}

/// One realtime frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    /// JSON body; `Null` when the frame carried no body bytes
    pub body: Value,
}

impl Frame {
    pub fn new(cmd: u16, sub_cmd: u8, body: Value) -> Self {
        Self {
            header: FrameHeader::new(cmd, sub_cmd),
            body,
        }
    }

    pub fn cmd(&self) -> u16 {
        self.header.cmd
    }

    pub fn sub_cmd(&self) -> u8 {
        self.header.sub_cmd
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = match &self.body {
            Value::Null => Vec::new(),
            body => body.to_string().into_bytes(),
        };
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&body);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::from_bytes(bytes)?;
        let text =
            core::str::from_utf8(&bytes[HEADER_LEN..]).map_err(|_| FrameError::InvalidUtf8)?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(text).map_err(|e| FrameError::InvalidBody {
                reason: e.to_string(),
            })?
        };
        Ok(Self { header, body })
    }

    /// Route this frame through the closed command table
    pub fn route(&self) -> Route {
        route(self.header.cmd, self.header.sub_cmd)
    }

    /// Correlation id carried in the frame body, if any
    pub fn req_id(&self) -> Option<&str> {
        self.body.get("req_id").and_then(Value::as_str)
    }

    // ---- Outbound frames ----------------------------------------------------

    /// Keepalive ping
    pub fn ping(event_id: u64) -> Self {
        Frame::new(CMD_PING, 1, json!({ "eventId": event_id }))
    }

    /// History request for messages before `last_id`
    pub fn old_messages(sub: SubType, last_id: Option<&str>, req_id: &str) -> Self {
        let cmd = match sub {
            SubType::User => CMD_OLD_MESSAGES_USER,
            SubType::Group => CMD_OLD_MESSAGES_GROUP,
        };
        Frame::new(cmd, 1, history_body(last_id, req_id))
    }

    /// History request for reactions before `last_id`
    pub fn old_reactions(sub: SubType, last_id: Option<&str>, req_id: &str) -> Self {
        let cmd = match sub {
            SubType::User => CMD_OLD_REACTIONS_USER,
            SubType::Group => CMD_OLD_REACTIONS_GROUP,
        };
        Frame::new(cmd, 1, history_body(last_id, req_id))
    }
}

fn history_body(last_id: Option<&str>, req_id: &str) -> Value {
    json!({
        "first": true,
        "lastId": last_id.unwrap_or_default(),
        "preIds": [],
        "req_id": req_id,
    })
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

/// Destination of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Body carries the session cipher key; the channel becomes ready
    CipherKey,
    Ping,
    /// The server closed this connection in favour of another one
    Duplicate,
    /// A domain event published directly on the bus
    Event {
        event: EventType,
        sub: Option<SubType>,
    },
    /// A batch of control entries split by [`ControlKind`]
    Control,
    Unknown,
}

/// Closed routing table for `(cmd, sub_cmd)`
pub fn route(cmd: u16, sub_cmd: u8) -> Route {
    use SubType::{Group, User};

    let event = |event, sub| Route::Event { event, sub };
    match (cmd, sub_cmd) {
        (CMD_CIPHER_KEY, 1) => Route::CipherKey,
        (CMD_PING, _) => Route::Ping,
        (CMD_DUPLICATE, _) => Route::Duplicate,
        (CMD_MESSAGE_USER, 0) => event(EventType::Message, Some(User)),
        (CMD_MESSAGE_GROUP, 0) => event(EventType::Message, Some(Group)),
        (CMD_OLD_MESSAGES_USER, 1) => event(EventType::OldMessages, Some(User)),
        (CMD_OLD_MESSAGES_GROUP, 1) => event(EventType::OldMessages, Some(Group)),
        (CMD_REACTION, _) => event(EventType::Reaction, None),
        (CMD_OLD_REACTIONS_USER, 1) => event(EventType::OldReactions, Some(User)),
        (CMD_OLD_REACTIONS_GROUP, 1) => event(EventType::OldReactions, Some(Group)),
        (CMD_TYPING, 0) => event(EventType::Typing, None),
        (CMD_SEEN_USER, 0) => event(EventType::Seen, Some(User)),
        (CMD_SEEN_GROUP, 0) => event(EventType::Seen, Some(Group)),
        (CMD_DELIVERED_USER, 0) => event(EventType::Delivered, Some(User)),
        (CMD_DELIVERED_GROUP, 0) => event(EventType::Delivered, Some(Group)),
        (CMD_CONTROL, 0) => Route::Control,
        (CMD_UNDO, 0) => event(EventType::Undo, None),
        _ => Route::Unknown,
    }
}

/// Kind of a control entry, keyed by its `act_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Friend,
    Group,
    UploadAttachment,
}

impl ControlKind {
    pub fn from_act_type(act_type: &str) -> Option<Self> {
        match act_type {
            "fr" => Some(ControlKind::Friend),
            "group" => Some(ControlKind::Group),
            "file_done" => Some(ControlKind::UploadAttachment),
            _ => None,
        }
    }

    pub fn event(self) -> EventType {
        match self {
            ControlKind::Friend => EventType::FriendEvent,
            ControlKind::Group => EventType::GroupEvent,
            ControlKind::UploadAttachment => EventType::UploadAttachment,
        }
    }
}

/// Split a decoded control payload into per-entry events
///
/// Accepts `{"controls": [...]}` or `{"data": {"controls": [...]}}`; each entry
/// names its kind in `content.act_type`. Entries with an unknown kind are
/// skipped.
pub fn split_controls(payload: &Value) -> Vec<(EventType, Value)> {
    let controls = payload
        .get("controls")
        .or_else(|| payload.get("data").and_then(|d| d.get("controls")))
        .and_then(Value::as_array);

    let Some(controls) = controls else {
        return Vec::new();
    };

    controls
        .iter()
        .filter_map(|control| {
            let act_type = control
                .get("content")
                .and_then(|c| c.get("act_type"))
                .and_then(Value::as_str)?;
            let kind = ControlKind::from_act_type(act_type)?;
            Some((kind.event(), control.clone()))
        })
        .collect()
}
