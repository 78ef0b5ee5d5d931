//! Wire format for messages exchanged between nodes.
//!
//! Every node reads and writes newline-delimited JSON objects of the form:
//!
//! ```text
//! {"Source":"c1","Destination":"n1","Type":"echo","Id":"1","Body":{...}}
//! ```
//!
//! The router only ever looks at `Destination`. `Body` is opaque and the
//! router forwards the exact line it read, so payload bytes are never
//! re-encoded in transit.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Type of the first envelope every node receives.
pub const INIT_TYPE: &str = "init";

/// Errors produced when a line cannot be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The line is not a JSON object of the expected shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The line parsed but carries no `Type`.
    #[error("envelope has no Type")]
    MissingType,
}

/// One routable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Source", default)]
    pub source: String,

    #[serde(rename = "Destination", default)]
    pub destination: String,

    #[serde(rename = "Type", default)]
    pub kind: String,

    #[serde(rename = "Id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(
        rename = "InResponseTo",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub in_response_to: String,

    /// `None` when the field is absent. A present `null` is `Some(Value::Null)`.
    #[serde(
        rename = "Body",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_body"
    )]
    pub body: Option<Value>,
}

fn present_body<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Payload of the `init` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitBody {
    #[serde(rename = "Name")]
    pub name: String,
}

impl Envelope {
    /// Build a bare envelope with no id and no body.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind: kind.into(),
            id: String::new(),
            in_response_to: String::new(),
            body: None,
        }
    }

    /// Attach a sender-assigned id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// The envelope that tells a freshly started node its assigned name.
    pub fn init(source: impl Into<String>, name: &str) -> Self {
        let body = serde_json::json!({ "Name": name });
        Self::new(source, name, INIT_TYPE).with_body(body)
    }

    /// Build a response to `request`, addressed back to its sender and
    /// correlated through `InResponseTo`.
    pub fn reply_to(
        request: &Envelope,
        source: impl Into<String>,
        kind: impl Into<String>,
        body: Option<Value>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: request.source.clone(),
            kind: kind.into(),
            id: String::new(),
            in_response_to: request.id.clone(),
            body,
        }
    }

    pub fn is_init(&self) -> bool {
        self.kind == INIT_TYPE
    }

    /// Decode the body of an `init` envelope.
    pub fn init_body(&self) -> Option<InitBody> {
        if !self.is_init() {
            return None;
        }
        self.body
            .as_ref()
            .and_then(|b| serde_json::from_value(b.clone()).ok())
    }
}

/// Serialize an envelope as one line of compact JSON (no trailing newline).
pub fn encode(envelope: &Envelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}

/// Parse one line into an envelope.
pub fn decode(line: &str) -> Result<Envelope, DecodeError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    if envelope.kind.is_empty() {
        return Err(DecodeError::MissingType);
    }
    Ok(envelope)
}
