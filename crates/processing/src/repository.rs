//! Loads aggregates from the memory cache or by replaying their history.

use std::sync::Arc;

use common::AggregateId;
use domain::{Aggregate, AggregateRoot, EventHandlers};
use event_store::{EventStore, Snapshot, SnapshotStore, Version};

use crate::error::{ProcessingError, Result};
use crate::memory_cache::MemoryCache;

/// Event-sourcing repository for one aggregate type.
///
/// A cache hit is returned as is. On a miss the aggregate is rebuilt from
/// the latest snapshot (when a snapshot store is configured) plus every
/// stream committed after it, then cached.
pub struct EventSourcingRepository<A: Aggregate> {
    event_store: Arc<dyn EventStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    cache: MemoryCache<A>,
    handlers: EventHandlers<A>,
}

impl<A: Aggregate> EventSourcingRepository<A> {
    pub fn new(event_store: Arc<dyn EventStore>) -> Self {
        Self {
            event_store,
            snapshots: None,
            cache: MemoryCache::new(),
            handlers: A::event_handlers(),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// The aggregate's internal event handlers.
    pub fn handlers(&self) -> &EventHandlers<A> {
        &self.handlers
    }

    /// Returns the current instance of an aggregate.
    ///
    /// An aggregate without history is returned empty when `create` is set,
    /// and is otherwise an [`ProcessingError::AggregateNotFound`]. Empty
    /// instances are never cached.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn get(&self, aggregate_id: &AggregateId, create: bool) -> Result<AggregateRoot<A>> {
        if let Some(root) = self.cache.get(aggregate_id) {
            metrics::counter!("memory_cache_hits_total", "aggregate_type" => A::aggregate_type())
                .increment(1);
            return Ok(root);
        }
        metrics::counter!("memory_cache_misses_total", "aggregate_type" => A::aggregate_type())
            .increment(1);

        let root = self.replay(aggregate_id, true).await?;
        if !root.version().is_committed() {
            if create {
                return Ok(AggregateRoot::new());
            }
            return Err(ProcessingError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id: aggregate_id.clone(),
            });
        }

        self.cache.set(aggregate_id.clone(), root.clone());
        Ok(root)
    }

    /// Returns the cached instance, or replays one without populating the
    /// cache. Safe to call outside the owning mailbox.
    pub async fn peek(&self, aggregate_id: &AggregateId) -> Result<Option<AggregateRoot<A>>> {
        if let Some(root) = self.cache.get(aggregate_id) {
            return Ok(Some(root));
        }
        let root = self.replay(aggregate_id, true).await?;
        Ok(root.version().is_committed().then_some(root))
    }

    /// Drops the cached instance and replays the full history, ignoring
    /// snapshots. Returns the rebuilt version, `None` for an unknown id.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn rebuild(&self, aggregate_id: &AggregateId) -> Result<Option<Version>> {
        self.cache.remove(aggregate_id);

        let root = self.replay(aggregate_id, false).await?;
        if !root.version().is_committed() {
            return Ok(None);
        }

        let version = root.version();
        self.cache.set(aggregate_id.clone(), root);
        tracing::info!(%version, "aggregate rebuilt");
        Ok(Some(version))
    }

    /// Forgets the cached instance so the next load replays from storage.
    pub fn invalidate(&self, aggregate_id: &AggregateId) {
        if self.cache.remove(aggregate_id) {
            tracing::debug!(%aggregate_id, "cached aggregate invalidated");
        }
    }

    /// Stores a freshly committed instance.
    pub fn update(&self, root: AggregateRoot<A>) {
        if let Some(id) = root.id().cloned() {
            self.cache.set(id, root);
        }
    }

    /// Persists a snapshot of `root`. Failures are logged, not returned.
    pub async fn save_snapshot(&self, root: &AggregateRoot<A>) {
        let (Some(store), Some(id)) = (&self.snapshots, root.id()) else {
            return;
        };

        let snapshot =
            match Snapshot::from_state(id.clone(), A::aggregate_type(), root.version(), root.state()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(aggregate_id = %id, error = %e, "failed to serialize snapshot");
                    return;
                }
            };

        match store.save(snapshot).await {
            Ok(()) => tracing::debug!(aggregate_id = %id, version = %root.version(), "snapshot saved"),
            Err(e) => tracing::warn!(aggregate_id = %id, error = %e, "failed to save snapshot"),
        }
    }

    /// Number of cached instances.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    async fn replay(&self, aggregate_id: &AggregateId, use_snapshot: bool) -> Result<AggregateRoot<A>> {
        let snapshot = if use_snapshot {
            self.load_snapshot(aggregate_id).await
        } else {
            None
        };
        let mut root = snapshot.unwrap_or_default();

        let streams = self
            .event_store
            .read_stream(aggregate_id, root.version().next(), None)
            .await?;
        for stream in &streams {
            root.replay(stream, &self.handlers)?;
        }

        metrics::counter!("aggregate_replays_total", "aggregate_type" => A::aggregate_type())
            .increment(1);
        tracing::debug!(
            %aggregate_id,
            streams = streams.len(),
            version = %root.version(),
            "aggregate replayed"
        );
        Ok(root)
    }

    /// Loads the latest snapshot. An unreadable snapshot falls back to a
    /// full replay.
    async fn load_snapshot(&self, aggregate_id: &AggregateId) -> Option<AggregateRoot<A>> {
        let store = self.snapshots.as_ref()?;
        let snapshot = match store.load(aggregate_id).await {
            Ok(snapshot) => snapshot?,
            Err(e) => {
                tracing::warn!(%aggregate_id, error = %e, "failed to load snapshot");
                return None;
            }
        };

        let version = snapshot.version;
        match snapshot.into_state::<A>() {
            Ok(state) => Some(AggregateRoot::restore(aggregate_id.clone(), version, state)),
            Err(e) => {
                tracing::warn!(%aggregate_id, error = %e, "discarding unreadable snapshot");
                None
            }
        }
    }
}
