//! At-least-once, per-aggregate ordered publishing of committed streams.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use event_store::{EventStore, EventStream, PublishProgressStore};

use crate::config::ProcessingConfig;
use crate::error::Result;
use crate::mailbox::{Delivery, MailboxHandler, Mailboxes};
use crate::outcome::CommandOutcome;
use crate::processing_cache::ProcessingCommandCache;
use crate::publisher::{EventMessage, EventPublisher};

/// A stream waiting to be published, plus the command result to release
/// once it is out.
struct PublishJob {
    stream: EventStream,
    completion: Option<CommandOutcome>,
}

struct PublishWorker {
    publisher: Arc<dyn EventPublisher>,
    progress: Arc<dyn PublishProgressStore>,
    processing: Arc<ProcessingCommandCache>,
    base_delay: Duration,
    max_delay: Duration,
}

impl PublishWorker {
    /// Retries `attempt` with exponential backoff until it succeeds.
    async fn with_backoff<T, E, F, Fut>(
        &self,
        aggregate_id: &AggregateId,
        operation: &'static str,
        attempt: F,
    ) -> T
    where
        E: fmt::Display,
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut delay = self.base_delay;
        loop {
            match attempt().await {
                Ok(value) => return value,
                Err(e) => {
                    metrics::counter!("publish_failures_total", "operation" => operation)
                        .increment(1);
                    tracing::warn!(
                        %aggregate_id,
                        operation,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "publish step failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, self.max_delay);
                }
            }
        }
    }
}

/// Doubles `delay` up to `max`.
fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

#[async_trait]
impl MailboxHandler<AggregateId, PublishJob> for PublishWorker {
    async fn handle(&self, aggregate_id: &AggregateId, job: PublishJob, _delivery: Delivery) {
        let version = job.stream.version();
        let published = self
            .with_backoff(aggregate_id, "read_progress", || {
                self.progress.published_version(aggregate_id)
            })
            .await;

        if version <= published {
            tracing::debug!(%aggregate_id, %version, "stream already published");
        } else {
            match EventMessage::new(job.stream).to_bytes() {
                Ok(bytes) => {
                    self.with_backoff(aggregate_id, "publish", || {
                        self.publisher.publish(aggregate_id.as_str(), &bytes)
                    })
                    .await;
                    self.with_backoff(aggregate_id, "record_progress", || {
                        self.progress.record_published(aggregate_id, version)
                    })
                    .await;
                    metrics::counter!("events_published_total").increment(1);
                    tracing::debug!(%aggregate_id, %version, "stream published");
                }
                Err(e) => {
                    tracing::error!(
                        %aggregate_id,
                        %version,
                        error = %e,
                        "failed to serialize event message"
                    );
                }
            }
        }

        if let Some(outcome) = job.completion {
            let command_id = outcome.command_id.clone();
            self.processing.complete(&command_id, Ok(outcome));
        }
    }
}

/// Publishes committed streams on dedicated per-aggregate mailboxes, so a
/// stalled transport never blocks command execution.
#[derive(Clone)]
pub struct PublishService {
    mailboxes: Mailboxes<AggregateId, PublishJob>,
    event_store: Arc<dyn EventStore>,
    progress: Arc<dyn PublishProgressStore>,
}

impl PublishService {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        event_store: Arc<dyn EventStore>,
        progress: Arc<dyn PublishProgressStore>,
        processing: Arc<ProcessingCommandCache>,
        config: &ProcessingConfig,
    ) -> Self {
        let worker: Arc<dyn MailboxHandler<AggregateId, PublishJob>> = Arc::new(PublishWorker {
            publisher,
            progress: Arc::clone(&progress),
            processing,
            base_delay: config.publish_retry_base_delay,
            max_delay: config.publish_retry_max_delay.max(config.publish_retry_base_delay),
        });

        Self {
            mailboxes: Mailboxes::new(
                "publish",
                worker,
                config.mailbox_depth,
                config.mailbox_idle_timeout,
            ),
            event_store,
            progress,
        }
    }

    /// Queues a committed stream. `completion` is released to the command's
    /// callers after the transport accepts the stream.
    pub fn publish(&self, stream: EventStream, completion: Option<CommandOutcome>) {
        self.mailboxes.force_enqueue(
            stream.aggregate_id().clone(),
            PublishJob { stream, completion },
        );
    }

    /// Queues every committed stream above the recorded publish progress.
    ///
    /// Returns how many streams were queued.
    pub async fn republish_pending(&self, aggregate_id: &AggregateId) -> Result<usize> {
        let published = self.progress.published_version(aggregate_id).await?;
        let streams = self
            .event_store
            .read_stream(aggregate_id, published.next(), None)
            .await?;

        let count = streams.len();
        for stream in streams {
            self.publish(stream, None);
        }
        if count > 0 {
            tracing::info!(%aggregate_id, count, "republishing pending streams");
        }
        Ok(count)
    }

    pub fn active_mailboxes(&self) -> usize {
        self.mailboxes.active()
    }
}

#[cfg(test)]
mod tests {
    use common::CommandId;
    use event_store::{EventEnvelope, InMemoryEventStore, InMemoryPublishProgressStore, Version};

    use super::*;
    use crate::processing_cache::Admission;
    use crate::publisher::InMemoryEventPublisher;

    struct Fixture {
        service: PublishService,
        publisher: InMemoryEventPublisher,
        store: Arc<InMemoryEventStore>,
        progress: Arc<InMemoryPublishProgressStore>,
        processing: Arc<ProcessingCommandCache>,
    }

    fn fixture() -> Fixture {
        let publisher = InMemoryEventPublisher::new();
        let store = Arc::new(InMemoryEventStore::new());
        let progress = Arc::new(InMemoryPublishProgressStore::new());
        let processing = Arc::new(ProcessingCommandCache::new());
        let config = ProcessingConfig {
            publish_retry_base_delay: Duration::from_millis(10),
            publish_retry_max_delay: Duration::from_millis(40),
            ..ProcessingConfig::default()
        };
        let service = PublishService::new(
            Arc::new(publisher.clone()),
            store.clone(),
            progress.clone(),
            Arc::clone(&processing),
            &config,
        );
        Fixture {
            service,
            publisher,
            store,
            progress,
            processing,
        }
    }

    fn stream(id: &str, version: i64) -> EventStream {
        let aggregate_id = AggregateId::from(id);
        let event = EventEnvelope::new(
            aggregate_id.clone(),
            Version::new(version),
            "Incremented",
            serde_json::json!({"type": "Incremented", "data": {"by": 1}}),
        );
        EventStream::new(
            CommandId::new(),
            aggregate_id,
            "Counter",
            Version::new(version),
            vec![event],
        )
        .unwrap()
    }

    async fn wait_for_messages(publisher: &InMemoryEventPublisher, count: usize) {
        while publisher.message_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_millis(40);
        assert_eq!(next_delay(Duration::from_millis(10), max), Duration::from_millis(20));
        assert_eq!(next_delay(Duration::from_millis(30), max), max);

        let huge = Duration::from_secs(u64::MAX / 2 + 1);
        assert_eq!(next_delay(huge, Duration::MAX), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_in_version_order_despite_failures() {
        let f = fixture();
        f.publisher.fail_next(3);

        for version in 1..=3 {
            f.service.publish(stream("c-1", version), None);
        }
        wait_for_messages(&f.publisher, 3).await;

        let versions: Vec<_> = f
            .publisher
            .messages_for("c-1")
            .iter()
            .map(|m| m.stream.version())
            .collect();
        assert_eq!(versions, vec![Version::new(1), Version::new(2), Version::new(3)]);
        assert_eq!(f.publisher.attempts(), 6);

        let id = AggregateId::from("c-1");
        while f.progress.published_version(&id).await.unwrap() < Version::new(3) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completion_is_released_after_publish() {
        let f = fixture();
        f.publisher.fail_next(2);
        let command_id = CommandId::from("cmd-1");
        let aggregate_id = AggregateId::from("c-1");

        let Admission::Admitted(receiver) = f.processing.try_admit(&command_id, &aggregate_id)
        else {
            panic!("expected admission");
        };
        let outcome = CommandOutcome::applied(command_id, aggregate_id, Version::first());
        f.service.publish(stream("c-1", 1), Some(outcome.clone()));

        assert_eq!(receiver.await.unwrap().unwrap(), outcome);
        assert_eq!(f.publisher.message_count(), 1);
        assert_eq!(f.processing.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn already_published_streams_are_skipped() {
        let f = fixture();
        let id = AggregateId::from("c-1");
        f.progress.record_published(&id, Version::new(2)).await.unwrap();

        f.service.publish(stream("c-1", 2), None);
        f.service.publish(stream("c-1", 3), None);
        wait_for_messages(&f.publisher, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = f.publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].stream.version(), Version::new(3));
    }

    #[tokio::test(start_paused = true)]
    async fn republish_pending_covers_unpublished_tail() {
        let f = fixture();
        let id = AggregateId::from("c-1");
        for version in 1..=4 {
            f.store.append(&stream("c-1", version)).await.unwrap();
        }
        f.progress.record_published(&id, Version::new(2)).await.unwrap();

        assert_eq!(f.service.republish_pending(&id).await.unwrap(), 2);
        wait_for_messages(&f.publisher, 2).await;

        let versions: Vec<_> = f
            .publisher
            .messages()
            .iter()
            .map(|m| m.stream.version())
            .collect();
        assert_eq!(versions, vec![Version::new(3), Version::new(4)]);

        while f.progress.published_version(&id).await.unwrap() < Version::new(4) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.service.republish_pending(&id).await.unwrap(), 0);
    }
}
