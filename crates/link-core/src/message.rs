//! Messages and the wire envelope.
//!
//! A message is an arbitrary JSON value plus an optional tag naming the
//! logical protocol it belongs to. On the wire, exactly one frame travels per
//! TCP connection and the connection close marks its end:
//!
//! ```text
//! {"from":"1","tag":"HeartbeatRequest","msg":{"mid":4}}
//! ```
//!
//! `from` and `tag` are decoded once at the transport boundary. Frames of the
//! older shape `{"msg":["MT:HeartbeatRequest", ...]}` are still accepted: the
//! sender then comes from the connection's source address and the tag from
//! the `"MT:"` marker in the first element of the body. Frames that carry
//! `from` never have their tag inferred.

use crate::ProcessId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Maximum inbound frame size (50MB) to bound memory use per connection.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// Marker that older peers put in front of a tag name in the first body element.
pub const LEGACY_TAG_PREFIX: &str = "MT:";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Cannot identify sender of frame from {0}")]
    UnknownSender(String),

    #[error("Read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Tag must be a non-empty string")]
pub struct TagError;

/// Discriminant routing a message to one logical protocol at the Perfect Link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    pub const HEARTBEAT_REQUEST: &'static str = "HeartbeatRequest";
    pub const HEARTBEAT_REPLY: &'static str = "HeartbeatReply";

    pub fn new(name: impl Into<String>) -> Result<Self, TagError> {
        let name = name.into();
        if name.is_empty() {
            Err(TagError)
        } else {
            Ok(Self(name))
        }
    }

    pub fn heartbeat_request() -> Self {
        Self(Self::HEARTBEAT_REQUEST.to_string())
    }

    pub fn heartbeat_reply() -> Self {
        Self(Self::HEARTBEAT_REPLY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover a tag from the older in-body convention.
    ///
    /// The body must be an array whose first element is a string `"MT:<name>"`
    /// with a non-empty name. Anything else (not an array, empty, first element
    /// not a string, bare prefix) is untagged.
    pub fn from_legacy_body(body: &Value) -> Option<Self> {
        let first = body.as_array()?.first()?.as_str()?;
        let name = first.strip_prefix(LEGACY_TAG_PREFIX)?;
        Self::new(name).ok()
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Tag {
    type Error = TagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

/// A message handed to or delivered by a link.
///
/// Equality is structural over tag and body. Two messages with the same
/// content are the same message, so applications that need one delivery per
/// logical event must embed their own identifier in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    tag: Option<Tag>,
    body: Value,
}

impl Message {
    /// An untagged application message. It stays untagged end to end, even
    /// if the body starts with an `"MT:"` marker.
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            tag: None,
            body: body.into(),
        }
    }

    /// A message for the protocol named by `tag`.
    pub fn tagged(tag: Tag, body: impl Into<Value>) -> Self {
        Self {
            tag: Some(tag),
            body: body.into(),
        }
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "[{}] {}", tag, self.body),
            None => write!(f, "{}", self.body),
        }
    }
}

// serde_json::Value has no Hash impl; its compact serialization is canonical
// (object keys are sorted) and agrees with Value's equality.
impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.body.to_string().hash(state);
    }
}

/// Serialized envelope, one per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ProcessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub msg: Value,
}

impl WireFrame {
    /// Wrap an outbound message sent by `from`.
    pub fn outbound(from: &ProcessId, message: Message) -> Self {
        Self {
            from: Some(from.clone()),
            tag: message.tag,
            msg: message.body,
        }
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("WireFrame serialization should not fail")
    }

    /// Parse a complete frame, enforcing the size limit.
    pub fn from_json(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_slice(data)?)
    }

    /// Turn the frame into the message it carries.
    ///
    /// Only frames of the older shape (no `from`, no `tag`) have their tag
    /// inferred from the body. A frame with `from` is current: no `tag`
    /// means the message was sent untagged.
    pub fn into_message(self) -> (Option<ProcessId>, Message) {
        let tag = match (self.tag, &self.from) {
            (Some(tag), _) => Some(tag),
            (None, None) => Tag::from_legacy_body(&self.msg),
            (None, Some(_)) => None,
        };
        (
            self.from,
            Message {
                tag,
                body: self.msg,
            },
        )
    }
}
