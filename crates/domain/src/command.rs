//! Command model and the command-handler registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use common::{AggregateId, CommandId, Items, ProcessId};
use event_store::EventId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::Aggregate;
use crate::error::DomainError;

/// Trait for commands that can be executed against an aggregate.
///
/// Commands represent an intention to perform an action. They may be rejected
/// if the aggregate's current state doesn't allow the action.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The type of aggregate this command targets.
    type Aggregate: Aggregate;

    /// Returns the command type name used for routing.
    fn command_type() -> &'static str;

    /// Returns the ID of the aggregate this command targets.
    fn aggregate_id(&self) -> AggregateId;
}

/// A command in transit through the pipeline.
///
/// Carries the serialized command plus everything needed to route it,
/// deduplicate it and record it in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    command_id: CommandId,
    aggregate_id: AggregateId,
    aggregate_type: String,
    command_type: String,
    payload: serde_json::Value,
    process_id: Option<ProcessId>,
    source_event_id: Option<EventId>,
    #[serde(default)]
    items: Items,
    #[serde(skip)]
    timeout: Option<Duration>,
}

impl CommandEnvelope {
    /// Wraps a typed command under a fresh command id.
    pub fn new<C: Command>(command: &C) -> Result<Self, DomainError> {
        Ok(Self {
            command_id: CommandId::new(),
            aggregate_id: command.aggregate_id(),
            aggregate_type: C::Aggregate::aggregate_type().to_owned(),
            command_type: C::command_type().to_owned(),
            payload: serde_json::to_value(command)?,
            process_id: None,
            source_event_id: None,
            items: Items::new(),
            timeout: None,
        })
    }

    /// Uses a caller-chosen command id, which makes resubmission idempotent.
    pub fn with_command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = command_id;
        self
    }

    pub fn with_process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub fn with_source_event_id(mut self, event_id: EventId) -> Self {
        self.source_event_id = Some(event_id);
        self
    }

    pub fn with_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.insert(key.into(), value.into());
        self
    }

    /// Bounds how long the caller waits for the outcome.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn process_id(&self) -> Option<&ProcessId> {
        self.process_id.as_ref()
    }

    pub fn source_event_id(&self) -> Option<EventId> {
        self.source_event_id
    }

    pub fn items(&self) -> &Items {
        &self.items
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Deserializes the payload back into the typed command.
    pub fn decode<C: Command>(&self) -> Result<C, DomainError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

type BoxedHandler<A> = Arc<
    dyn Fn(&A, &CommandEnvelope) -> Result<Vec<<A as Aggregate>::Event>, DomainError>
        + Send
        + Sync,
>;

/// A registered command handler.
pub struct CommandHandler<A: Aggregate> {
    handler: BoxedHandler<A>,
    creates: bool,
}

impl<A: Aggregate> CommandHandler<A> {
    /// Whether the handler may run against an aggregate with no history.
    pub fn creates_aggregate(&self) -> bool {
        self.creates
    }

    /// Runs business logic against the current state, returning the events
    /// to raise. An empty list means the command changes nothing.
    pub fn handle(&self, state: &A, command: &CommandEnvelope) -> Result<Vec<A::Event>, DomainError> {
        (self.handler)(state, command)
    }
}

impl<A: Aggregate> Clone for CommandHandler<A> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            creates: self.creates,
        }
    }
}

/// Static registry mapping command type names to handlers for one
/// aggregate type.
pub struct CommandHandlers<A: Aggregate> {
    handlers: HashMap<&'static str, CommandHandler<A>>,
}

impl<A: Aggregate> CommandHandlers<A> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for a command that targets an existing aggregate.
    pub fn on<C, F, E>(self, handler: F) -> Self
    where
        C: Command<Aggregate = A>,
        F: Fn(&A, &C) -> Result<Vec<A::Event>, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        self.register::<C, F, E>(handler, false)
    }

    /// Registers a handler for a command that may create its aggregate.
    pub fn creating<C, F, E>(self, handler: F) -> Self
    where
        C: Command<Aggregate = A>,
        F: Fn(&A, &C) -> Result<Vec<A::Event>, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        self.register::<C, F, E>(handler, true)
    }

    fn register<C, F, E>(mut self, handler: F, creates: bool) -> Self
    where
        C: Command<Aggregate = A>,
        F: Fn(&A, &C) -> Result<Vec<A::Event>, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let handler: BoxedHandler<A> = Arc::new(move |state: &A, envelope: &CommandEnvelope| {
            let command: C = envelope.decode()?;
            handler(state, &command).map_err(|e| DomainError::Rejected(e.to_string()))
        });
        self.handlers
            .insert(C::command_type(), CommandHandler { handler, creates });
        self
    }

    /// Looks up the handler for a command type.
    pub fn get(&self, command_type: &str) -> Result<&CommandHandler<A>, DomainError> {
        self.handlers
            .get(command_type)
            .ok_or_else(|| DomainError::CommandHandlerNotFound {
                aggregate_type: A::aggregate_type(),
                command_type: command_type.to_owned(),
            })
    }
}

impl<A: Aggregate> Default for CommandHandlers<A> {
    fn default() -> Self {
        Self::new()
    }
}
