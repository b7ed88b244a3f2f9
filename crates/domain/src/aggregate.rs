//! Aggregate runtime: identity, versioning, uncommitted events and the
//! internal event-handler registry.

use std::collections::HashMap;
use std::fmt;

use common::AggregateId;
use event_store::{EventEnvelope, EventStream, Version};
use serde::{Serialize, de::DeserializeOwned};

use crate::command::CommandEnvelope;
use crate::error::DomainError;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Returns the event type name.
    ///
    /// Used as the key into the aggregate's [`EventHandlers`] and stored
    /// next to the payload.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates in an event-sourced system.
///
/// The implementing type is the aggregate's business state. Identity,
/// version and uncommitted events live in the surrounding [`AggregateRoot`].
/// State only changes through the handlers returned by
/// [`Aggregate::event_handlers`].
pub trait Aggregate:
    Default + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    ///
    /// Used to route commands and recorded on every stream.
    fn aggregate_type() -> &'static str;

    /// Builds the registry of internal event handlers.
    fn event_handlers() -> EventHandlers<Self>;
}

/// Applies one event to an aggregate's state. Must be deterministic.
pub type EventHandlerFn<A> = fn(&mut A, &<A as Aggregate>::Event);

/// Static registry mapping event type names to state-transition functions.
///
/// Built once at startup and never mutated afterwards.
pub struct EventHandlers<A: Aggregate> {
    handlers: HashMap<&'static str, EventHandlerFn<A>>,
}

impl<A: Aggregate> EventHandlers<A> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for `event_type`.
    pub fn on(mut self, event_type: &'static str, handler: EventHandlerFn<A>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    /// Returns true when a handler is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    fn lookup(&self, event_type: &str) -> Result<EventHandlerFn<A>, DomainError> {
        self.handlers
            .get(event_type)
            .copied()
            .ok_or_else(|| DomainError::EventHandlerNotFound {
                aggregate_type: A::aggregate_type(),
                event_type: event_type.to_owned(),
            })
    }
}

impl<A: Aggregate> Default for EventHandlers<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> Clone for EventHandlers<A> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

/// An aggregate instance together with its identity, version and
/// not-yet-persisted events.
///
/// The id can be assigned once, and only while the aggregate has no
/// history. The version advances by exactly one per committed stream.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: Option<AggregateId>,
    version: Version,
    state: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> Default for AggregateRoot<A> {
    fn default() -> Self {
        Self {
            id: None,
            version: Version::initial(),
            state: A::default(),
            uncommitted: Vec::new(),
        }
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates an empty aggregate with no id and no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores an aggregate from snapshotted state.
    pub fn restore(id: AggregateId, version: Version, state: A) -> Self {
        Self {
            id: Some(id),
            version,
            state,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<&AggregateId> {
        self.id.as_ref()
    }

    /// The string form of the aggregate id.
    pub fn unique_id(&self) -> Option<&str> {
        self.id.as_ref().map(AggregateId::as_str)
    }

    /// Assigns the aggregate id.
    ///
    /// Fails if an id was already assigned or the aggregate has history.
    pub fn assign_id(&mut self, id: AggregateId) -> Result<(), DomainError> {
        if let Some(current) = &self.id {
            return Err(DomainError::IdAlreadyAssigned(current.clone()));
        }
        if self.version.is_committed() {
            return Err(DomainError::IdAfterHistory {
                id,
                version: self.version,
            });
        }
        self.id = Some(id);
        Ok(())
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn into_state(self) -> A {
        self.state
    }

    /// Events raised since the last commit, in order.
    pub fn uncommitted_events(&self) -> &[A::Event] {
        &self.uncommitted
    }

    /// Applies freshly raised events to the state and buffers them.
    ///
    /// Every event type is checked against the registry before any state
    /// changes, so a missing handler leaves the aggregate untouched.
    pub fn raise(
        &mut self,
        events: Vec<A::Event>,
        handlers: &EventHandlers<A>,
    ) -> Result<(), DomainError> {
        let resolved = events
            .iter()
            .map(|event| handlers.lookup(event.event_type()))
            .collect::<Result<Vec<_>, _>>()?;

        for (handler, event) in resolved.into_iter().zip(events) {
            handler(&mut self.state, &event);
            self.uncommitted.push(event);
        }
        Ok(())
    }

    /// Applies a stored stream during rehydration.
    ///
    /// The stream must be exactly one version ahead of the aggregate.
    pub fn replay(
        &mut self,
        stream: &EventStream,
        handlers: &EventHandlers<A>,
    ) -> Result<(), DomainError> {
        if self.id.is_none() {
            self.assign_id(stream.aggregate_id().clone())?;
        }
        if let Some(id) = &self.id
            && id != stream.aggregate_id()
        {
            return Err(DomainError::ForeignStream {
                expected: id.clone(),
                found: stream.aggregate_id().clone(),
            });
        }

        let expected = self.version.next();
        if stream.version() != expected {
            return Err(DomainError::StreamOutOfOrder {
                aggregate_id: stream.aggregate_id().clone(),
                expected,
                found: stream.version(),
            });
        }

        for envelope in stream.events() {
            let handler = handlers.lookup(envelope.event_type())?;
            let event: A::Event = envelope.decode()?;
            handler(&mut self.state, &event);
        }
        self.version = stream.version();
        Ok(())
    }

    /// Packages the uncommitted events as the stream for `command`, one
    /// version past the current one.
    ///
    /// Returns `None` when nothing was raised.
    pub fn stage(&self, command: &CommandEnvelope) -> Result<Option<EventStream>, DomainError> {
        if self.uncommitted.is_empty() {
            return Ok(None);
        }
        let id = self
            .id
            .clone()
            .ok_or(DomainError::MissingId(A::aggregate_type()))?;
        let version = self.version.next();

        let events = self
            .uncommitted
            .iter()
            .map(|event| -> Result<EventEnvelope, DomainError> {
                Ok(EventEnvelope::new(
                    id.clone(),
                    version,
                    event.event_type(),
                    serde_json::to_value(event)?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let stream = EventStream::new(
            command.command_id().clone(),
            id,
            A::aggregate_type(),
            version,
            events,
        )?
        .with_process_id(command.process_id().cloned())
        .with_items(command.items().clone());

        Ok(Some(stream))
    }

    /// Marks the uncommitted events as persisted at `version`.
    pub fn commit(&mut self, version: Version) {
        self.version = version;
        self.uncommitted.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::command::Command;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub enum CounterEvent {
        Incremented { by: i64 },
        Reset,
        Renamed { name: String },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Incremented { .. } => "Incremented",
                CounterEvent::Reset => "Reset",
                CounterEvent::Renamed { .. } => "Renamed",
            }
        }
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Counter {
        pub value: i64,
    }

    impl Counter {
        fn on_incremented(&mut self, event: &CounterEvent) {
            if let CounterEvent::Incremented { by } = event {
                self.value += by;
            }
        }

        fn on_reset(&mut self, _event: &CounterEvent) {
            self.value = 0;
        }
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        // "Renamed" has no handler.
        fn event_handlers() -> EventHandlers<Self> {
            EventHandlers::new()
                .on("Incremented", Counter::on_incremented)
                .on("Reset", Counter::on_reset)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Increment {
        pub counter_id: String,
        pub by: i64,
    }

    impl Command for Increment {
        type Aggregate = Counter;

        fn command_type() -> &'static str {
            "Increment"
        }

        fn aggregate_id(&self) -> AggregateId {
            AggregateId::from(self.counter_id.as_str())
        }
    }

    fn increment_command(id: &str) -> CommandEnvelope {
        CommandEnvelope::new(&Increment {
            counter_id: id.to_string(),
            by: 1,
        })
        .unwrap()
    }

    fn committed_root(id: &str, increments: &[i64]) -> AggregateRoot<Counter> {
        let handlers = Counter::event_handlers();
        let mut root = AggregateRoot::<Counter>::new();
        root.assign_id(AggregateId::from(id)).unwrap();
        for by in increments {
            root.raise(vec![CounterEvent::Incremented { by: *by }], &handlers)
                .unwrap();
            let stream = root.stage(&increment_command(id)).unwrap().unwrap();
            root.commit(stream.version());
        }
        root
    }

    #[test]
    fn id_can_only_be_assigned_once() {
        let mut root = AggregateRoot::<Counter>::new();
        root.assign_id(AggregateId::from("c-1")).unwrap();

        let err = root.assign_id(AggregateId::from("c-2")).unwrap_err();
        assert!(matches!(err, DomainError::IdAlreadyAssigned(_)));
        assert_eq!(root.unique_id(), Some("c-1"));
    }

    #[test]
    fn id_cannot_be_assigned_after_history() {
        let mut root = AggregateRoot::restore(AggregateId::from("c-1"), Version::new(2), Counter::default());
        root.id = None;

        let err = root.assign_id(AggregateId::from("c-1")).unwrap_err();
        assert!(matches!(err, DomainError::IdAfterHistory { .. }));
    }

    #[test]
    fn raise_applies_and_buffers_events() {
        let handlers = Counter::event_handlers();
        let mut root = AggregateRoot::<Counter>::new();
        root.assign_id(AggregateId::from("c-1")).unwrap();

        root.raise(
            vec![
                CounterEvent::Incremented { by: 2 },
                CounterEvent::Incremented { by: 3 },
            ],
            &handlers,
        )
        .unwrap();

        assert_eq!(root.state().value, 5);
        assert_eq!(root.uncommitted_events().len(), 2);
        assert_eq!(root.version(), Version::initial());
    }

    #[test]
    fn raise_without_handler_leaves_state_untouched() {
        let handlers = Counter::event_handlers();
        let mut root = AggregateRoot::<Counter>::new();
        root.assign_id(AggregateId::from("c-1")).unwrap();

        let err = root
            .raise(
                vec![
                    CounterEvent::Incremented { by: 2 },
                    CounterEvent::Renamed {
                        name: "x".to_string(),
                    },
                ],
                &handlers,
            )
            .unwrap_err();

        assert!(matches!(err, DomainError::EventHandlerNotFound { .. }));
        assert_eq!(root.state().value, 0);
        assert!(root.uncommitted_events().is_empty());
    }

    #[test]
    fn stage_builds_one_stream_at_next_version() {
        let handlers = Counter::event_handlers();
        let mut root = committed_root("c-1", &[1, 1]);

        root.raise(
            vec![CounterEvent::Incremented { by: 1 }, CounterEvent::Reset],
            &handlers,
        )
        .unwrap();
        let stream = root.stage(&increment_command("c-1")).unwrap().unwrap();

        assert_eq!(stream.version(), Version::new(3));
        assert_eq!(stream.events().len(), 2);
        assert!(stream.events().iter().all(|e| e.version() == Version::new(3)));
        assert_eq!(stream.aggregate_type(), "Counter");

        root.commit(stream.version());
        assert_eq!(root.version(), Version::new(3));
        assert!(root.uncommitted_events().is_empty());
    }

    #[test]
    fn stage_without_events_is_none() {
        let root = committed_root("c-1", &[]);
        assert!(root.stage(&increment_command("c-1")).unwrap().is_none());
    }

    #[test]
    fn replay_reproduces_committed_state() {
        let handlers = Counter::event_handlers();
        let mut source = AggregateRoot::<Counter>::new();
        source.assign_id(AggregateId::from("c-1")).unwrap();

        let mut streams = Vec::new();
        for by in [4, 5, 6] {
            source
                .raise(vec![CounterEvent::Incremented { by }], &handlers)
                .unwrap();
            let stream = source.stage(&increment_command("c-1")).unwrap().unwrap();
            source.commit(stream.version());
            streams.push(stream);
        }

        let mut replayed = AggregateRoot::<Counter>::new();
        for stream in &streams {
            replayed.replay(stream, &handlers).unwrap();
        }

        assert_eq!(replayed.version(), source.version());
        assert_eq!(replayed.state(), source.state());
        assert_eq!(replayed.unique_id(), Some("c-1"));
    }

    #[test]
    fn replay_rejects_version_gap() {
        let id = AggregateId::from("c-1");
        let event = EventEnvelope::new(
            id.clone(),
            Version::new(3),
            "Incremented",
            serde_json::to_value(CounterEvent::Incremented { by: 1 }).unwrap(),
        );
        let stream = EventStream::new(
            event_store::CommandId::new(),
            id,
            "Counter",
            Version::new(3),
            vec![event],
        )
        .unwrap();

        let mut root = AggregateRoot::<Counter>::new();
        let err = root.replay(&stream, &Counter::event_handlers()).unwrap_err();
        assert!(matches!(
            err,
            DomainError::StreamOutOfOrder { expected, .. } if expected == Version::first()
        ));
    }

    #[test]
    fn replay_rejects_unknown_event_type() {
        let id = AggregateId::from("c-1");
        let event = EventEnvelope::new(
            id.clone(),
            Version::first(),
            "Renamed",
            serde_json::to_value(CounterEvent::Renamed {
                name: "x".to_string(),
            })
            .unwrap(),
        );
        let stream = EventStream::new(
            event_store::CommandId::new(),
            id,
            "Counter",
            Version::first(),
            vec![event],
        )
        .unwrap();

        let mut root = AggregateRoot::<Counter>::new();
        let err = root.replay(&stream, &Counter::event_handlers()).unwrap_err();
        assert!(matches!(err, DomainError::EventHandlerNotFound { .. }));
    }

    #[test]
    fn replay_rejects_foreign_stream() {
        let handlers = Counter::event_handlers();
        let mut other = AggregateRoot::<Counter>::new();
        other.assign_id(AggregateId::from("c-2")).unwrap();
        other
            .raise(vec![CounterEvent::Incremented { by: 1 }], &handlers)
            .unwrap();
        let stream = other.stage(&increment_command("c-2")).unwrap().unwrap();

        let mut root = AggregateRoot::<Counter>::new();
        root.assign_id(AggregateId::from("c-1")).unwrap();
        let err = root.replay(&stream, &handlers).unwrap_err();
        assert!(matches!(err, DomainError::ForeignStream { .. }));
    }
}
