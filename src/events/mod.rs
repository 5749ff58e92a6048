//! Event and stream model.
//!
//! Immutable value types: stream identities, pending and committed events,
//! stream metadata and the transient [`StreamAction`] unit of work.

mod event;
mod stream;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};

pub use event::{default_event_type, DomainEvent, Event, EventMetadata, PendingEvent};
pub use stream::{ConcurrencyMode, StreamAction, StreamActionKind, StreamState};

/// How streams are identified. Fixed per store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamIdentity {
    #[default]
    Guid,
    Key,
}

impl StreamIdentity {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamIdentity::Guid => "guid",
            StreamIdentity::Key => "key",
        }
    }
}

/// Identity of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamId {
    Guid(Uuid),
    Key(String),
}

impl StreamId {
    /// A fresh random guid identity.
    pub fn new_guid() -> Self {
        StreamId::Guid(Uuid::new_v4())
    }

    pub fn identity(&self) -> StreamIdentity {
        match self {
            StreamId::Guid(_) => StreamIdentity::Guid,
            StreamId::Key(_) => StreamIdentity::Key,
        }
    }

    /// Column representation.
    pub fn as_text(&self) -> String {
        match self {
            StreamId::Guid(id) => id.hyphenated().to_string(),
            StreamId::Key(key) => key.clone(),
        }
    }

    /// Parse a stored identity under the given mode.
    pub fn parse(identity: StreamIdentity, text: &str) -> Result<Self> {
        match identity {
            StreamIdentity::Guid => Ok(StreamId::Guid(Uuid::parse_str(text)?)),
            StreamIdentity::Key => Ok(StreamId::Key(text.to_string())),
        }
    }

    /// Reject identities that don't match the store's mode.
    pub fn ensure_identity(&self, identity: StreamIdentity) -> Result<()> {
        let valid = match (self, identity) {
            (StreamId::Guid(_), StreamIdentity::Guid) => true,
            (StreamId::Key(key), StreamIdentity::Key) => !key.is_empty(),
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidStreamIdentity {
                stream_id: self.clone(),
                expected: identity.as_str(),
            })
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Guid(id) => write!(f, "{}", id.hyphenated()),
            StreamId::Key(key) => f.write_str(key),
        }
    }
}

impl From<Uuid> for StreamId {
    fn from(id: Uuid) -> Self {
        StreamId::Guid(id)
    }
}

impl From<&str> for StreamId {
    fn from(key: &str) -> Self {
        StreamId::Key(key.to_string())
    }
}

impl From<String> for StreamId {
    fn from(key: String) -> Self {
        StreamId::Key(key)
    }
}
