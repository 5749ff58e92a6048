//! Live and point-in-time aggregation.
//!
//! Folds an aggregate straight from a stream's events without reading or
//! writing its stored document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::aggregation::{AggregateState, Aggregation};
use crate::error::Result;
use crate::events::StreamId;
use crate::serializer::Serializer;
use crate::storage::reader::{EventReader, FetchOptions};

/// Which slice of a stream to fold.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateQuery {
    pub to_version: Option<i64>,
    pub as_of: Option<DateTime<Utc>>,
    pub include_archived: bool,
}

impl AggregateQuery {
    /// Every event currently in the stream.
    pub fn latest() -> Self {
        Self::default()
    }

    /// Events up to and including `version`.
    pub fn at_version(version: i64) -> Self {
        Self {
            to_version: Some(version),
            ..Self::default()
        }
    }

    /// Events recorded at or before `timestamp`.
    pub fn as_of(timestamp: DateTime<Utc>) -> Self {
        Self {
            as_of: Some(timestamp),
            ..Self::default()
        }
    }

    /// Also fold events of an archived stream.
    pub fn include_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            from_version: None,
            to_version: self.to_version,
            as_of: self.as_of,
            include_archived: self.include_archived,
        }
    }
}

/// Fold a stream as of `query`. `None` when no event qualifies or the
/// aggregate ends up uninitialized or deleted.
pub async fn aggregate_stream<S, R>(
    reader: &R,
    aggregation: &Aggregation<S>,
    stream_id: &StreamId,
    query: AggregateQuery,
    serializer: &dyn Serializer,
) -> Result<Option<S>>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: EventReader + ?Sized,
{
    let events = reader.fetch_stream(stream_id, query.fetch_options()).await?;
    if events.is_empty() {
        return Ok(None);
    }
    let state = aggregation.fold(AggregateState::Uninitialized, &events, serializer)?;
    Ok(state.into_live())
}
