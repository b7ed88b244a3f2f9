use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, AppendResult, CommandAddResult, CommandId, CommandStore, EventStore,
    EventStream, HandledCommand, PublishProgressStore, Result, Snapshot, SnapshotStore, Version,
};

/// In-memory event store.
///
/// Streams are kept per aggregate, ordered by version. The write lock makes
/// the duplicate checks and the insert a single atomic step, which matches
/// the unique-key behaviour of the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<AggregateId, BTreeMap<Version, EventStream>>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of streams stored.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.values().map(BTreeMap::len).sum()
    }

    /// Clears all streams.
    pub async fn clear(&self) {
        self.streams.write().await.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, stream: &EventStream) -> Result<AppendResult> {
        stream.verify()?;

        let mut store = self.streams.write().await;
        let history = store.entry(stream.aggregate_id().clone()).or_default();

        if history
            .values()
            .any(|existing| existing.command_id() == stream.command_id())
        {
            return Ok(AppendResult::DuplicateCommand);
        }
        if history.contains_key(&stream.version()) {
            metrics::counter!("event_store_version_conflicts_total").increment(1);
            return Ok(AppendResult::DuplicateEventVersion);
        }

        history.insert(stream.version(), stream.clone());
        Ok(AppendResult::Success)
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from: Version,
        to: Option<Version>,
    ) -> Result<Vec<EventStream>> {
        let store = self.streams.read().await;
        let Some(history) = store.get(aggregate_id) else {
            return Ok(Vec::new());
        };

        Ok(history
            .range(from..)
            .take_while(|(version, _)| to.is_none_or(|to| **version <= to))
            .map(|(_, stream)| stream.clone())
            .collect())
    }

    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: &CommandId,
    ) -> Result<Option<EventStream>> {
        let store = self.streams.read().await;
        Ok(store.get(aggregate_id).and_then(|history| {
            history
                .values()
                .find(|stream| stream.command_id() == command_id)
                .cloned()
        }))
    }

    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        let store = self.streams.read().await;
        Ok(store
            .get(aggregate_id)
            .and_then(|history| history.keys().next_back().copied())
            .unwrap_or(Version::initial()))
    }
}

/// In-memory handled-command ledger.
#[derive(Clone, Default)]
pub struct InMemoryCommandStore {
    commands: Arc<RwLock<HashMap<CommandId, HandledCommand>>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of recorded commands.
    pub async fn len(&self) -> usize {
        self.commands.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.commands.read().await.is_empty()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn insert(&self, command: &HandledCommand) -> Result<CommandAddResult> {
        let mut commands = self.commands.write().await;
        if commands.contains_key(&command.command_id) {
            return Ok(CommandAddResult::DuplicateCommand);
        }
        commands.insert(command.command_id.clone(), command.clone());
        Ok(CommandAddResult::Success)
    }

    async fn find(&self, command_id: &CommandId) -> Result<Option<HandledCommand>> {
        Ok(self.commands.read().await.get(command_id).cloned())
    }

    async fn remove(&self, command_id: &CommandId) -> Result<bool> {
        Ok(self.commands.write().await.remove(command_id).is_some())
    }
}

/// In-memory snapshot store keeping the latest snapshot per aggregate.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<AggregateId, Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        // Never replace a newer snapshot with an older one.
        if let Some(existing) = snapshots.get(&snapshot.aggregate_id)
            && existing.version >= snapshot.version
        {
            return Ok(());
        }
        snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.read().await.get(aggregate_id).cloned())
    }
}

/// In-memory publish progress.
#[derive(Clone, Default)]
pub struct InMemoryPublishProgressStore {
    versions: Arc<RwLock<HashMap<AggregateId, Version>>>,
}

impl InMemoryPublishProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublishProgressStore for InMemoryPublishProgressStore {
    async fn published_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        Ok(self
            .versions
            .read()
            .await
            .get(aggregate_id)
            .copied()
            .unwrap_or(Version::initial()))
    }

    async fn record_published(&self, aggregate_id: &AggregateId, version: Version) -> Result<()> {
        let mut versions = self.versions.write().await;
        let recorded = versions.entry(aggregate_id.clone()).or_default();
        if version > *recorded {
            *recorded = version;
        }
        Ok(())
    }
}
