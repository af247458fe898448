//! Queue data models.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::WireFormat;
use crate::error::Result;

/// Field of a stream entry holding the encoded envelope.
pub const MESSAGE_FIELD: &str = "message";

/// Backend-assigned id of a stream entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-side id of a message still waiting in the delay set.
///
/// Thirteen hex digits of wall-clock microseconds, a dot, then an eight digit
/// sequence number. It cannot be acknowledged; the message gets an [`EntryId`]
/// once it is moved into the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyntheticId(String);

impl SyntheticId {
    pub const SEQUENCE_MODULUS: u32 = 100_000_000;

    pub fn new(micros: i64, sequence: u32) -> Self {
        Self(format!(
            "{:013x}.{:08}",
            micros.max(0),
            sequence % Self::SEQUENCE_MODULUS
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyntheticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id returned by `add`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Appended to the stream right away.
    Stream(EntryId),
    /// Parked in the delay set.
    Delayed(SyntheticId),
}

impl MessageId {
    /// The stream entry id, if the message is already in the stream.
    pub fn entry_id(&self) -> Option<&EntryId> {
        match self {
            MessageId::Stream(id) => Some(id),
            MessageId::Delayed(_) => None,
        }
    }

    pub fn is_delayed(&self) -> bool {
        matches!(self, MessageId::Delayed(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Stream(id) => id.fmt(f),
            MessageId::Delayed(id) => id.fmt(f),
        }
    }
}

/// Payload stored in a stream entry: an encoded body plus free-form headers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(body: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            body: body.into(),
            headers,
        }
    }

    /// Encode for storage in the `message` field.
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>> {
        Ok(match format {
            WireFormat::Json => serde_json::to_vec(self)?,
            WireFormat::Bincode => bincode::serialize(self)?,
        })
    }

    /// Decode a stored `message` field.
    pub fn decode(raw: &[u8], format: WireFormat) -> Result<Self> {
        Ok(match format {
            WireFormat::Json => serde_json::from_slice(raw)?,
            WireFormat::Bincode => bincode::deserialize(raw)?,
        })
    }

    /// JSON text, the form handed to receivers.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A message returned by `get`, still serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: EntryId,
    /// `message` maps to the envelope as JSON text. Empty when the entry's
    /// payload is gone or unreadable.
    pub data: BTreeMap<String, String>,
}

impl ReceivedMessage {
    /// The envelope JSON text, if present.
    pub fn message(&self) -> Option<&str> {
        self.data.get(MESSAGE_FIELD).map(String::as_str)
    }
}
