//! Pending and committed events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StreamId;
use crate::error::Result;
use crate::serializer::{self, Serializer};
use crate::storage::tombstone::TOMBSTONE_EVENT_TYPE;

/// A payload type that can be stored as an event.
///
/// The stored type name defaults to the snake_case form of the type's own
/// name (`MembersJoined` becomes `members_joined`). Override `event_type` to
/// pin a name that survives renames.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn event_type() -> String {
        default_event_type::<Self>()
    }
}

/// Snake_case name of a Rust type's final path segment, generics stripped.
pub fn default_event_type<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    let short = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    to_snake_case(short)
}

fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Correlation data carried alongside a payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, serde_json::Value>,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none() && self.causation_id.is_none() && self.headers.is_empty()
    }
}

/// An event authored in a session, not yet numbered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub id: Uuid,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: EventMetadata,
}

impl PendingEvent {
    /// Serialize a typed payload.
    pub fn new<E: DomainEvent>(payload: &E, serializer: &dyn Serializer) -> Result<Self> {
        Ok(Self::raw(E::event_type(), serializer::to_bytes(serializer, payload)?))
    }

    /// An event from an already-encoded payload.
    pub fn raw(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.metadata.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.headers.insert(key.into(), value);
        self
    }
}

/// A committed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub stream_id: StreamId,
    /// 1-based position within the stream.
    pub version: i64,
    /// Store-wide position.
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Vec<u8>,
    pub tenant_id: String,
    pub stream_type: Option<String>,
    pub metadata: EventMetadata,
    pub is_archived: bool,
}

impl Event {
    pub fn decode<E: DomainEvent>(&self, serializer: &dyn Serializer) -> Result<E> {
        serializer::from_bytes(serializer, &self.data)
    }

    pub fn is<E: DomainEvent>(&self) -> bool {
        self.event_type == E::event_type()
    }

    pub fn is_tombstone(&self) -> bool {
        self.event_type == TOMBSTONE_EVENT_TYPE
    }
}
