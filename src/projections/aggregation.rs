//! Aggregations: per-stream documents folded from events.
//!
//! The author lists which event types construct, evolve, delete or revive
//! the aggregate; nothing is discovered at runtime. The fold itself is a
//! pure function over [`AggregateState`], shared by inline projection,
//! async catch-up and live point-in-time reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::debug;

use super::aggregate_store::{self, AggregateDocument, DocumentStatus};
use super::{Projection, ProjectionContext, ProjectionLifecycle};
use crate::error::{Result, StoreError};
use crate::events::{DomainEvent, Event, StreamId};
use crate::serializer::{self, Serializer};
use crate::storage::reader::{select_stream_events, FetchOptions};

type Construct<S> = Arc<dyn Fn(&Event, &dyn Serializer) -> Result<S> + Send + Sync>;
type Evolve<S> = Arc<dyn Fn(&mut S, &Event, &dyn Serializer) -> Result<()> + Send + Sync>;
type Initial<S> = Arc<dyn Fn() -> S + Send + Sync>;

/// Where one aggregate instance is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateState<S> {
    /// No constructing event seen yet.
    Uninitialized,
    Live(S),
    /// Terminal until a revive event arrives.
    Deleted,
}

impl<S> AggregateState<S> {
    pub fn into_live(self) -> Option<S> {
        match self {
            AggregateState::Live(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, AggregateState::Deleted)
    }
}

/// What the fold does with an event type nothing was registered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownEventPolicy {
    #[default]
    Ignore,
    /// Fail the fold with `UnhandledEvent`.
    Error,
}

/// A projection materializing one `S` document per stream.
pub struct Aggregation<S> {
    name: String,
    lifecycle: ProjectionLifecycle,
    stream_type: Option<String>,
    unknown: UnknownEventPolicy,
    initial: Option<Initial<S>>,
    create: HashMap<String, Construct<S>>,
    apply: HashMap<String, Evolve<S>>,
    delete: HashSet<String>,
    revive: HashMap<String, Construct<S>>,
    catch_all: Option<Evolve<S>>,
}

impl<S> Aggregation<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> AggregationBuilder<S> {
        AggregationBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_type(&self) -> Option<&str> {
        self.stream_type.as_deref()
    }

    /// Fold events over a starting state.
    pub fn fold(
        &self,
        state: AggregateState<S>,
        events: &[Event],
        serializer: &dyn Serializer,
    ) -> Result<AggregateState<S>> {
        events
            .iter()
            .try_fold(state, |state, event| self.fold_event(state, event, serializer))
    }

    fn fold_event(
        &self,
        state: AggregateState<S>,
        event: &Event,
        serializer: &dyn Serializer,
    ) -> Result<AggregateState<S>> {
        if event.is_tombstone() {
            return Ok(state);
        }
        let event_type = event.event_type.as_str();

        match state {
            AggregateState::Deleted => match self.revive.get(event_type) {
                Some(revive) => Ok(AggregateState::Live(revive(event, serializer)?)),
                None => Ok(AggregateState::Deleted),
            },
            AggregateState::Uninitialized => {
                if self.delete.contains(event_type) {
                    return Ok(AggregateState::Deleted);
                }
                if let Some(create) = self.create.get(event_type).or_else(|| self.revive.get(event_type)) {
                    return Ok(AggregateState::Live(create(event, serializer)?));
                }
                match &self.initial {
                    Some(initial) if self.evolves(event_type) => {
                        let mut value = initial();
                        self.evolve(&mut value, event, serializer)?;
                        Ok(AggregateState::Live(value))
                    }
                    _ => {
                        self.check_unknown(event)?;
                        Ok(AggregateState::Uninitialized)
                    }
                }
            }
            AggregateState::Live(mut value) => {
                if self.delete.contains(event_type) {
                    return Ok(AggregateState::Deleted);
                }
                if self.evolves(event_type) {
                    self.evolve(&mut value, event, serializer)?;
                } else {
                    self.check_unknown(event)?;
                }
                Ok(AggregateState::Live(value))
            }
        }
    }

    fn evolves(&self, event_type: &str) -> bool {
        self.apply.contains_key(event_type) || self.catch_all.is_some()
    }

    fn evolve(&self, value: &mut S, event: &Event, serializer: &dyn Serializer) -> Result<()> {
        match self.apply.get(event.event_type.as_str()).or(self.catch_all.as_ref()) {
            Some(rule) => rule(value, event, serializer),
            None => Ok(()),
        }
    }

    /// Registered under any rule.
    fn knows(&self, event_type: &str) -> bool {
        self.create.contains_key(event_type)
            || self.apply.contains_key(event_type)
            || self.delete.contains(event_type)
            || self.revive.contains_key(event_type)
    }

    fn check_unknown(&self, event: &Event) -> Result<()> {
        if self.unknown == UnknownEventPolicy::Error && !self.knows(&event.event_type) && self.catch_all.is_none() {
            return Err(StoreError::UnhandledEvent {
                projection: self.name.clone(),
                event_type: event.event_type.clone(),
            });
        }
        Ok(())
    }

    /// Whether a stream's batch concerns this aggregation at all.
    fn is_relevant(&self, events: &[&Event], has_document: bool) -> bool {
        if let Some(stream_type) = &self.stream_type {
            return events
                .iter()
                .any(|e| e.stream_type.as_deref() == Some(stream_type.as_str()));
        }
        has_document
            || self.catch_all.is_some()
            || events.iter().any(|e| self.knows(&e.event_type))
    }

    /// Rehydrate a stored document.
    pub fn state_from_document(
        &self,
        document: &AggregateDocument,
        serializer: &dyn Serializer,
    ) -> Result<AggregateState<S>> {
        match (document.status, &document.data) {
            (DocumentStatus::Deleted, _) => Ok(AggregateState::Deleted),
            (DocumentStatus::Live, Some(bytes)) => {
                Ok(AggregateState::Live(serializer::from_bytes(serializer, bytes)?))
            }
            (DocumentStatus::Live, None) => Err(StoreError::Serialization(format!(
                "aggregate '{}' of stream {} is live but has no data",
                self.name, document.stream_id
            ))),
        }
    }

    async fn fold_stream(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ProjectionContext,
        tenant_id: &str,
        stream_id: &StreamId,
        batch: &[&Event],
    ) -> Result<()> {
        let serializer = ctx.serializer.as_ref();
        let document = aggregate_store::load_document(&mut *conn, &self.name, tenant_id, stream_id).await?;
        if !self.is_relevant(batch, document.is_some()) {
            return Ok(());
        }

        let seen = document.as_ref().map(|d| d.version).unwrap_or(0);
        let fresh: Vec<Event> = batch
            .iter()
            .filter(|e| e.version > seen)
            .map(|e| (*e).clone())
            .collect();
        let Some(first) = fresh.first() else {
            return Ok(());
        };

        let (state, events) = match &document {
            Some(document) => (self.state_from_document(document, serializer)?, fresh),
            None if first.version > 1 => {
                // no document yet for a stream already in flight: replay its history
                let options = FetchOptions::new()
                    .to_version(first.version - 1)
                    .include_archived();
                let mut history =
                    select_stream_events(&mut *conn, ctx.identity, stream_id, Some(tenant_id), &options).await?;
                history.extend(fresh);
                (AggregateState::Uninitialized, history)
            }
            None => (AggregateState::Uninitialized, fresh),
        };

        let Some(last) = events.last() else {
            return Ok(());
        };
        let (version, last_sequence) = (last.version, last.sequence);

        let (status, data) = match self.fold(state, &events, serializer)? {
            AggregateState::Uninitialized => return Ok(()),
            AggregateState::Live(value) => (DocumentStatus::Live, Some(serializer::to_bytes(serializer, &value)?)),
            AggregateState::Deleted => (DocumentStatus::Deleted, None),
        };

        aggregate_store::save_document(
            conn,
            &AggregateDocument {
                projection: self.name.clone(),
                tenant_id: tenant_id.to_string(),
                stream_id: stream_id.as_text(),
                version,
                last_sequence,
                status,
                data,
            },
        )
        .await?;

        debug!(projection = %self.name, stream_id = %stream_id, version, "Aggregate folded");
        Ok(())
    }
}

#[async_trait]
impl<S> Projection for Aggregation<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> ProjectionLifecycle {
        self.lifecycle
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ProjectionContext,
        events: &[Event],
    ) -> Result<()> {
        // group by stream, keeping first-seen order
        let mut groups: Vec<((&str, &StreamId), Vec<&Event>)> = Vec::new();
        for event in events.iter().filter(|e| !e.is_tombstone()) {
            let key = (event.tenant_id.as_str(), &event.stream_id);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, batch)) => batch.push(event),
                None => groups.push((key, vec![event])),
            }
        }

        for ((tenant_id, stream_id), batch) in groups {
            self.fold_stream(conn, ctx, tenant_id, stream_id, &batch).await?;
        }
        Ok(())
    }

    async fn reset(&self, conn: &mut SqliteConnection) -> Result<()> {
        let removed = aggregate_store::delete_documents(conn, &self.name).await?;
        debug!(projection = %self.name, removed, "Aggregate documents cleared");
        Ok(())
    }
}

/// Registration API for an [`Aggregation`].
pub struct AggregationBuilder<S> {
    name: String,
    lifecycle: ProjectionLifecycle,
    stream_type: Option<String>,
    unknown: UnknownEventPolicy,
    initial: Option<Initial<S>>,
    create: HashMap<String, Construct<S>>,
    apply: HashMap<String, Evolve<S>>,
    delete: HashSet<String>,
    revive: HashMap<String, Construct<S>>,
    catch_all: Option<Evolve<S>>,
    registered: HashSet<String>,
    errors: Vec<String>,
}

impl<S> AggregationBuilder<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: ProjectionLifecycle::Inline,
            stream_type: None,
            unknown: UnknownEventPolicy::Ignore,
            initial: None,
            create: HashMap::new(),
            apply: HashMap::new(),
            delete: HashSet::new(),
            revive: HashMap::new(),
            catch_all: None,
            registered: HashSet::new(),
            errors: Vec::new(),
        }
    }

    fn register(&mut self, event_type: &str) -> bool {
        if self.registered.insert(event_type.to_string()) {
            true
        } else {
            self.errors
                .push(format!("event type '{event_type}' registered more than once"));
            false
        }
    }

    /// Starting value for streams whose first event has an apply rule.
    pub fn initial(mut self, initial: impl Fn() -> S + Send + Sync + 'static) -> Self {
        self.initial = Some(Arc::new(initial));
        self
    }

    /// Construct the aggregate from an event of type `E`.
    pub fn create<E: DomainEvent>(mut self, create: impl Fn(E) -> S + Send + Sync + 'static) -> Self {
        let event_type = E::event_type();
        if self.register(&event_type) {
            let rule: Construct<S> = Arc::new(move |event: &Event, serializer: &dyn Serializer| Ok(create(event.decode::<E>(serializer)?)));
            self.create.insert(event_type, rule);
        }
        self
    }

    /// Evolve a live aggregate with an event of type `E`.
    pub fn apply<E: DomainEvent>(mut self, apply: impl Fn(&mut S, E) + Send + Sync + 'static) -> Self {
        let event_type = E::event_type();
        if self.register(&event_type) {
            let rule: Evolve<S> = Arc::new(move |state: &mut S, event: &Event, serializer: &dyn Serializer| {
                apply(state, event.decode::<E>(serializer)?);
                Ok(())
            });
            self.apply.insert(event_type, rule);
        }
        self
    }

    /// Delete the aggregate when an `E` arrives.
    pub fn delete_on<E: DomainEvent>(mut self) -> Self {
        let event_type = E::event_type();
        if self.register(&event_type) {
            self.delete.insert(event_type);
        }
        self
    }

    /// Bring a deleted aggregate back with an `E`.
    pub fn revive_on<E: DomainEvent>(mut self, revive: impl Fn(E) -> S + Send + Sync + 'static) -> Self {
        let event_type = E::event_type();
        if self.register(&event_type) {
            let rule: Construct<S> = Arc::new(move |event: &Event, serializer: &dyn Serializer| Ok(revive(event.decode::<E>(serializer)?)));
            self.revive.insert(event_type, rule);
        }
        self
    }

    /// Receives every live-state event that has no specific rule.
    pub fn catch_all(mut self, catch_all: impl Fn(&mut S, &Event) + Send + Sync + 'static) -> Self {
        if self.catch_all.is_some() {
            self.errors.push("catch-all rule registered more than once".into());
        }
        self.catch_all = Some(Arc::new(move |state: &mut S, event: &Event, _: &dyn Serializer| {
            catch_all(state, event);
            Ok(())
        }));
        self
    }

    pub fn unknown_events(mut self, policy: UnknownEventPolicy) -> Self {
        self.unknown = policy;
        self
    }

    /// Only fold streams started with this aggregate type tag.
    pub fn for_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    pub fn lifecycle(mut self, lifecycle: ProjectionLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn build(self) -> Result<Aggregation<S>> {
        let mut errors = self.errors;
        if self.name.trim().is_empty() {
            errors.push("aggregation name must not be empty".into());
        }
        if self.initial.is_none() && self.create.is_empty() {
            errors.push("no initial value and no create rule".into());
        }
        if !self.revive.is_empty() && self.delete.is_empty() {
            errors.push("revive rules require a delete rule".into());
        }
        if !errors.is_empty() {
            return Err(StoreError::Configuration(format!(
                "aggregation '{}': {}",
                self.name,
                errors.join("; ")
            )));
        }

        Ok(Aggregation {
            name: self.name,
            lifecycle: self.lifecycle,
            stream_type: self.stream_type,
            unknown: self.unknown,
            initial: self.initial,
            create: self.create,
            apply: self.apply,
            delete: self.delete,
            revive: self.revive,
            catch_all: self.catch_all,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::events::{EventMetadata, StreamId};
    use crate::serializer::JsonSerializer;
    use crate::storage::helpers::now;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Party {
        members: Vec<String>,
    }

    #[derive(Serialize, Deserialize)]
    struct Joined {
        members: Vec<String>,
    }
    impl DomainEvent for Joined {}

    #[derive(Serialize, Deserialize)]
    struct Departed {
        members: Vec<String>,
    }
    impl DomainEvent for Departed {}

    #[derive(Serialize, Deserialize)]
    struct Disbanded {}
    impl DomainEvent for Disbanded {}

    #[derive(Serialize, Deserialize)]
    struct Reformed {
        members: Vec<String>,
    }
    impl DomainEvent for Reformed {}

    fn event<E: DomainEvent>(version: i64, payload: &E) -> Event {
        Event {
            id: uuid::Uuid::new_v4(),
            stream_id: StreamId::from("party-1"),
            version,
            sequence: version,
            timestamp: now(),
            event_type: E::event_type(),
            data: serializer::to_bytes(&JsonSerializer, payload).unwrap(),
            tenant_id: "t".into(),
            stream_type: None,
            metadata: EventMetadata::default(),
            is_archived: false,
        }
    }

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn party() -> Aggregation<Party> {
        Aggregation::<Party>::builder("party")
            .initial(Party::default)
            .apply(|p: &mut Party, e: Joined| p.members.extend(e.members))
            .apply(|p: &mut Party, e: Departed| p.members.retain(|m| !e.members.contains(m)))
            .delete_on::<Disbanded>()
            .revive_on(|e: Reformed| Party { members: e.members })
            .build()
            .unwrap()
    }

    #[test]
    fn test_fold_joined_then_departed() {
        let events = vec![
            event(1, &Joined { members: members(&["Rand", "Mat"]) }),
            event(2, &Departed { members: members(&["Mat"]) }),
        ];
        let state = party()
            .fold(AggregateState::Uninitialized, &events, &JsonSerializer)
            .unwrap();
        assert_eq!(state.into_live().unwrap().members, members(&["Rand"]));
    }

    #[test]
    fn test_deleted_is_terminal_until_revived() {
        let aggregation = party();
        let events = vec![
            event(1, &Joined { members: members(&["Rand"]) }),
            event(2, &Disbanded {}),
            event(3, &Joined { members: members(&["Perrin"]) }),
        ];
        let state = aggregation
            .fold(AggregateState::Uninitialized, &events, &JsonSerializer)
            .unwrap();
        assert!(state.is_deleted());

        let revived = aggregation
            .fold(state, &[event(4, &Reformed { members: members(&["Egwene"]) })], &JsonSerializer)
            .unwrap();
        assert_eq!(revived.into_live().unwrap().members, members(&["Egwene"]));
    }

    #[test]
    fn test_unknown_events_follow_policy() {
        let strict = Aggregation::<Party>::builder("strict")
            .initial(Party::default)
            .apply(|p: &mut Party, e: Joined| p.members.extend(e.members))
            .unknown_events(UnknownEventPolicy::Error)
            .build()
            .unwrap();
        let events = vec![
            event(1, &Joined { members: members(&["Rand"]) }),
            event(2, &Departed { members: members(&["Rand"]) }),
        ];
        let err = strict
            .fold(AggregateState::Uninitialized, &events, &JsonSerializer)
            .unwrap_err();
        assert!(matches!(err, StoreError::UnhandledEvent { .. }));

        let lenient = Aggregation::<Party>::builder("lenient")
            .initial(Party::default)
            .apply(|p: &mut Party, e: Joined| p.members.extend(e.members))
            .build()
            .unwrap();
        let state = lenient
            .fold(AggregateState::Uninitialized, &events, &JsonSerializer)
            .unwrap();
        assert_eq!(state.into_live().unwrap().members, members(&["Rand"]));
    }

    #[test]
    fn test_catch_all_sees_unmapped_events() {
        let counting = Aggregation::<Party>::builder("counting")
            .create(|e: Joined| Party { members: e.members })
            .catch_all(|p: &mut Party, e: &Event| p.members.push(e.event_type.clone()))
            .unknown_events(UnknownEventPolicy::Error)
            .build()
            .unwrap();
        let events = vec![
            event(1, &Joined { members: members(&["Rand"]) }),
            event(2, &Departed { members: members(&["Rand"]) }),
        ];
        let state = counting
            .fold(AggregateState::Uninitialized, &events, &JsonSerializer)
            .unwrap();
        assert_eq!(state.into_live().unwrap().members, members(&["Rand", "departed"]));
    }

    #[test]
    fn test_build_rejects_invalid_registrations() {
        let duplicate = Aggregation::<Party>::builder("dup")
            .initial(Party::default)
            .apply(|_: &mut Party, _: Joined| {})
            .apply(|_: &mut Party, _: Joined| {})
            .build();
        assert!(matches!(duplicate, Err(StoreError::Configuration(_))));

        let no_constructor = Aggregation::<Party>::builder("none")
            .apply(|_: &mut Party, _: Joined| {})
            .build();
        assert!(no_constructor.is_err());

        let revive_without_delete = Aggregation::<Party>::builder("revive")
            .initial(Party::default)
            .revive_on(|e: Reformed| Party { members: e.members })
            .build();
        assert!(revive_without_delete.is_err());
    }
}
