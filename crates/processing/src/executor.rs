//! Runs one command against one aggregate and appends the result.

use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use domain::{Aggregate, CommandEnvelope, CommandHandlers};
use event_store::{AppendResult, EventStore, EventStream, SnapshotStore, Version};
use serde::Serialize;

use crate::error::{ProcessingError, Result};
use crate::repository::EventSourcingRepository;

/// What happened when a command was executed once.
#[derive(Debug, Clone)]
pub enum Execution {
    /// A new stream was appended.
    Committed(EventStream),
    /// The handler raised no events. Nothing was stored.
    NoChanges { version: Version },
    /// The event store already holds a stream from this command.
    Duplicate { stream: Option<EventStream> },
    /// Another stream took the version first. The cache entry was dropped.
    Conflict,
}

/// Current state of an aggregate, for diagnostics and read endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateView {
    pub aggregate_id: AggregateId,
    pub aggregate_type: &'static str,
    pub version: Version,
    pub state: serde_json::Value,
}

/// Type-erased executor for one aggregate type, so the command service can
/// route to many aggregate types through one table.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    fn aggregate_type(&self) -> &'static str;

    /// Whether a handler is registered for `command_type`.
    fn handles(&self, command_type: &str) -> bool;

    /// Loads the aggregate, runs the handler and appends the new stream.
    ///
    /// Must only be called from the aggregate's mailbox worker.
    async fn execute(&self, command: &CommandEnvelope) -> Result<Execution>;

    /// Replays the aggregate from its full history into the cache.
    async fn rebuild(&self, aggregate_id: &AggregateId) -> Result<Option<Version>>;

    /// Reads the aggregate without populating the cache.
    async fn view(&self, aggregate_id: &AggregateId) -> Result<Option<AggregateView>>;
}

/// [`CommandExecutor`] backed by an [`EventSourcingRepository`].
pub struct AggregateCommandExecutor<A: Aggregate> {
    repository: EventSourcingRepository<A>,
    commands: CommandHandlers<A>,
    event_store: Arc<dyn EventStore>,
    snapshot_interval: u64,
}

impl<A: Aggregate> AggregateCommandExecutor<A> {
    pub fn new(event_store: Arc<dyn EventStore>, commands: CommandHandlers<A>) -> Self {
        Self {
            repository: EventSourcingRepository::new(Arc::clone(&event_store)),
            commands,
            event_store,
            snapshot_interval: 0,
        }
    }

    /// Saves a snapshot every `interval` versions. Zero disables snapshots.
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>, interval: u64) -> Self {
        self.repository = self.repository.with_snapshots(snapshots);
        self.snapshot_interval = interval;
        self
    }

    pub fn repository(&self) -> &EventSourcingRepository<A> {
        &self.repository
    }

    fn snapshot_due(&self, version: Version) -> bool {
        self.snapshot_interval > 0
            && version.is_committed()
            && (version.as_i64() as u64) % self.snapshot_interval == 0
    }
}

#[async_trait]
impl<A: Aggregate> CommandExecutor for AggregateCommandExecutor<A> {
    fn aggregate_type(&self) -> &'static str {
        A::aggregate_type()
    }

    fn handles(&self, command_type: &str) -> bool {
        self.commands.get(command_type).is_ok()
    }

    #[tracing::instrument(
        skip(self, command),
        fields(
            aggregate_type = A::aggregate_type(),
            aggregate_id = %command.aggregate_id(),
            command_type = command.command_type()
        )
    )]
    async fn execute(&self, command: &CommandEnvelope) -> Result<Execution> {
        let handler = self.commands.get(command.command_type())?;
        let aggregate_id = command.aggregate_id();

        let mut root = self
            .repository
            .get(aggregate_id, handler.creates_aggregate())
            .await?;
        if root.id().is_none() {
            root.assign_id(aggregate_id.clone())?;
        }

        let events = handler.handle(root.state(), command)?;
        if events.is_empty() {
            return Ok(Execution::NoChanges {
                version: root.version(),
            });
        }

        root.raise(events, self.repository.handlers())?;
        let Some(stream) = root.stage(command)? else {
            return Ok(Execution::NoChanges {
                version: root.version(),
            });
        };

        match self.event_store.append(&stream).await? {
            AppendResult::Success => {
                root.commit(stream.version());
                if self.snapshot_due(stream.version()) {
                    self.repository.save_snapshot(&root).await;
                }
                self.repository.update(root);
                tracing::debug!(version = %stream.version(), "stream committed");
                Ok(Execution::Committed(stream))
            }
            AppendResult::DuplicateCommand => {
                self.repository.invalidate(aggregate_id);
                let stream = self
                    .event_store
                    .find_by_command(aggregate_id, command.command_id())
                    .await?;
                tracing::debug!("command already committed");
                Ok(Execution::Duplicate { stream })
            }
            AppendResult::DuplicateEventVersion => {
                self.repository.invalidate(aggregate_id);
                tracing::debug!(version = %stream.version(), "version already taken");
                Ok(Execution::Conflict)
            }
        }
    }

    async fn rebuild(&self, aggregate_id: &AggregateId) -> Result<Option<Version>> {
        self.repository.rebuild(aggregate_id).await
    }

    async fn view(&self, aggregate_id: &AggregateId) -> Result<Option<AggregateView>> {
        let Some(root) = self.repository.peek(aggregate_id).await? else {
            return Ok(None);
        };
        let state = serde_json::to_value(root.state())
            .map_err(|e| ProcessingError::Serialization(e.to_string()))?;
        Ok(Some(AggregateView {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: A::aggregate_type(),
            version: root.version(),
            state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use common::CommandId;
    use domain::Command;
    use event_store::{EventEnvelope, InMemoryEventStore, InMemorySnapshotStore};

    use super::*;
    use crate::testing::{Counter, counter_handlers, increment, reset};

    /// Lets another writer take the next version right before the first
    /// append goes through.
    struct RacingStore {
        inner: InMemoryEventStore,
        armed: AtomicBool,
    }

    impl RacingStore {
        fn new(inner: InMemoryEventStore) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl EventStore for RacingStore {
        async fn append(&self, stream: &EventStream) -> event_store::Result<AppendResult> {
            if self.armed.swap(false, Ordering::SeqCst) {
                let event = EventEnvelope::new(
                    stream.aggregate_id().clone(),
                    stream.version(),
                    "Incremented",
                    serde_json::json!({"type": "Incremented", "data": {"by": 100}}),
                );
                let winner = EventStream::new(
                    CommandId::new(),
                    stream.aggregate_id().clone(),
                    "Counter",
                    stream.version(),
                    vec![event],
                )?;
                self.inner.append(&winner).await?;
            }
            self.inner.append(stream).await
        }

        async fn read_stream(
            &self,
            aggregate_id: &AggregateId,
            from: Version,
            to: Option<Version>,
        ) -> event_store::Result<Vec<EventStream>> {
            self.inner.read_stream(aggregate_id, from, to).await
        }

        async fn find_by_command(
            &self,
            aggregate_id: &AggregateId,
            command_id: &CommandId,
        ) -> event_store::Result<Option<EventStream>> {
            self.inner.find_by_command(aggregate_id, command_id).await
        }

        async fn current_version(&self, aggregate_id: &AggregateId) -> event_store::Result<Version> {
            self.inner.current_version(aggregate_id).await
        }
    }

    fn envelope<C: Command>(command: &C) -> CommandEnvelope {
        CommandEnvelope::new(command).unwrap()
    }

    fn executor(store: Arc<dyn EventStore>) -> AggregateCommandExecutor<Counter> {
        AggregateCommandExecutor::new(store, counter_handlers())
    }

    #[tokio::test]
    async fn commits_consecutive_versions() {
        let store = Arc::new(InMemoryEventStore::new());
        let executor = executor(store.clone());

        for expected in 1..=3 {
            let execution = executor.execute(&envelope(&increment("c-1", 2))).await.unwrap();
            let Execution::Committed(stream) = execution else {
                panic!("expected a commit, got {execution:?}");
            };
            assert_eq!(stream.version(), Version::new(expected));
        }

        let view = executor.view(&AggregateId::from("c-1")).await.unwrap().unwrap();
        assert_eq!(view.version, Version::new(3));
        assert_eq!(view.state, serde_json::json!({"value": 6}));
        assert_eq!(store.stream_count().await, 3);
    }

    #[tokio::test]
    async fn no_events_means_no_changes() {
        let store = Arc::new(InMemoryEventStore::new());
        let executor = executor(store.clone());

        executor.execute(&envelope(&increment("c-1", 1))).await.unwrap();
        executor.execute(&envelope(&reset("c-1"))).await.unwrap();

        let execution = executor.execute(&envelope(&reset("c-1"))).await.unwrap();
        assert!(matches!(
            execution,
            Execution::NoChanges { version } if version == Version::new(2)
        ));
        assert_eq!(store.stream_count().await, 2);
    }

    #[tokio::test]
    async fn non_creating_command_needs_history() {
        let executor = executor(Arc::new(InMemoryEventStore::new()));

        let err = executor.execute(&envelope(&reset("c-1"))).await.unwrap_err();
        assert!(matches!(err, ProcessingError::AggregateNotFound { .. }));
    }

    #[tokio::test]
    async fn rejection_leaves_cached_state_untouched() {
        let executor = executor(Arc::new(InMemoryEventStore::new()));
        executor.execute(&envelope(&increment("c-1", 3))).await.unwrap();

        let err = executor.execute(&envelope(&increment("c-1", -1))).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Rejected(reason) if reason.contains("positive")));

        let root = executor
            .repository()
            .get(&AggregateId::from("c-1"), false)
            .await
            .unwrap();
        assert_eq!(root.state().value, 3);
        assert!(root.uncommitted_events().is_empty());
    }

    #[tokio::test]
    async fn same_command_id_is_reported_as_duplicate() {
        let store = Arc::new(InMemoryEventStore::new());
        let executor = executor(store.clone());
        let command = envelope(&increment("c-1", 1)).with_command_id(CommandId::from("cmd-1"));

        assert!(matches!(
            executor.execute(&command).await.unwrap(),
            Execution::Committed(_)
        ));
        let Execution::Duplicate { stream } = executor.execute(&command).await.unwrap() else {
            panic!("expected a duplicate");
        };
        assert_eq!(stream.unwrap().version(), Version::first());
        assert_eq!(store.stream_count().await, 1);
    }

    #[tokio::test]
    async fn conflict_invalidates_cache_and_retry_sees_winner() {
        let inner = InMemoryEventStore::new();
        let store = Arc::new(RacingStore::new(inner.clone()));
        let executor = executor(store);
        let id = AggregateId::from("c-1");

        let command = envelope(&increment("c-1", 1));
        assert!(matches!(
            executor.execute(&command).await.unwrap(),
            Execution::Conflict
        ));
        assert_eq!(executor.repository().cached(), 0);

        let Execution::Committed(stream) = executor.execute(&command).await.unwrap() else {
            panic!("expected the retry to commit");
        };
        assert_eq!(stream.version(), Version::new(2));

        let root = executor.repository().get(&id, false).await.unwrap();
        assert_eq!(root.state().value, 101);
        assert_eq!(inner.current_version(&id).await.unwrap(), Version::new(2));
    }

    #[tokio::test]
    async fn snapshots_follow_the_interval() {
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let executor = executor(Arc::new(InMemoryEventStore::new()))
            .with_snapshots(snapshots.clone(), 2);
        let id = AggregateId::from("c-1");

        executor.execute(&envelope(&increment("c-1", 1))).await.unwrap();
        assert!(snapshots.load(&id).await.unwrap().is_none());

        executor.execute(&envelope(&increment("c-1", 1))).await.unwrap();
        executor.execute(&envelope(&increment("c-1", 1))).await.unwrap();
        let snapshot = snapshots.load(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.version, Version::new(2));
    }

    #[tokio::test]
    async fn routing_information() {
        let executor = executor(Arc::new(InMemoryEventStore::new()));
        assert_eq!(executor.aggregate_type(), "Counter");
        assert!(executor.handles("Increment"));
        assert!(!executor.handles("Decrement"));
        assert!(executor.view(&AggregateId::from("none")).await.unwrap().is_none());
    }
}
