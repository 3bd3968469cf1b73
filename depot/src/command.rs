//! Commands that flow through the replicated log.
//!
//! The payload is a small JSON object (`{"Method":"SET","Key":..,"Value":..}`).
//! JSON keeps the framing self-describing, so a node can tell a corrupt entry
//! apart from a well-formed entry carrying a method it does not know.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation tag carried in the `Method` field of an encoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Set,
    Del,
}

impl Method {
    /// Wire name, as written into the log.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Set => "SET",
            Method::Del => "DEL",
        }
    }
}

/// A mutation of the key-value state, built once by the gateway and never
/// modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not a command envelope at all. Applying past this point
    /// could diverge from peers, so the FSM treats it as fatal.
    #[error("malformed command payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The envelope parsed but names a method this node does not implement.
    #[error("unknown command method {0:?}")]
    UnknownMethod(String),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    method: String,
    key: String,
    #[serde(default)]
    value: String,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    /// The method name this command is logged under.
    pub fn method(&self) -> Method {
        match self {
            Command::Set { .. } => Method::Set,
            Command::Delete { .. } => Method::Del,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }

    /// Serializes the command into a log entry payload. The same command
    /// always encodes to the same bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let envelope = match self {
            Command::Set { key, value } => Envelope {
                method: Method::Set.as_str().to_string(),
                key: key.clone(),
                value: value.clone(),
            },
            Command::Delete { key } => Envelope {
                method: Method::Del.as_str().to_string(),
                key: key.clone(),
                value: String::new(),
            },
        };
        serde_json::to_vec(&envelope)
    }

    /// Parses a log entry payload. A deletion ignores any `Value` field.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let Envelope { method, key, value } = serde_json::from_slice(bytes)?;
        match method.as_str() {
            "SET" => Ok(Command::Set { key, value }),
            "DEL" => Ok(Command::Delete { key }),
            _ => Err(DecodeError::UnknownMethod(method)),
        }
    }
}
