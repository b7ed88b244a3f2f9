//! The command service: admission, per-aggregate execution, retries and
//! result delivery.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use common::AggregateId;
use domain::{Aggregate, Command, CommandEnvelope, CommandHandlers};
use event_store::{
    CommandAddResult, CommandStore, EventStore, EventStream, HandledCommand,
    InMemoryPublishProgressStore, PublishProgressStore, SnapshotStore, Version,
};
use serde::Serialize;
use tokio::sync::{Semaphore, oneshot};

use crate::config::ProcessingConfig;
use crate::error::{ProcessingError, Result};
use crate::executor::{AggregateCommandExecutor, AggregateView, CommandExecutor, Execution};
use crate::mailbox::{Delivery, MailboxHandler, Mailboxes};
use crate::outcome::{CommandOutcome, CommandResult};
use crate::processing_cache::{Admission, ProcessingCommandCache};
use crate::publish::PublishService;
use crate::publisher::{EventPublisher, InMemoryEventPublisher};
use crate::retry::RetryService;

/// A command on its way through the pipeline.
#[derive(Clone)]
struct ProcessingCommand {
    envelope: Arc<CommandEnvelope>,
    executor: Arc<dyn CommandExecutor>,
    retry_count: u32,
}

/// A conflicted command waiting for the next retry tick.
///
/// The mailbox worker that ran it stays parked on the other end of
/// `resume`, so later commands for the aggregate wait behind it.
struct PendingRetry {
    command: ProcessingCommand,
    resume: oneshot::Sender<ProcessingCommand>,
}

/// Where one attempt left the command.
enum Attempt {
    Finished(CommandOutcome),
    /// Released by the publish service.
    Publishing,
    Retrying(oneshot::Receiver<ProcessingCommand>),
}

enum MailboxMessage {
    Command(ProcessingCommand),
    Rebuild {
        executor: Arc<dyn CommandExecutor>,
        reply: oneshot::Sender<Result<Option<Version>>>,
    },
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub active_mailboxes: usize,
    pub in_flight_commands: usize,
    pub queued_retries: usize,
    pub active_publish_mailboxes: usize,
}

type ExecutorFactory = Box<
    dyn FnOnce(Arc<dyn EventStore>, Option<Arc<dyn SnapshotStore>>, u64) -> Arc<dyn CommandExecutor>
        + Send,
>;

/// Configures and starts a [`CommandService`].
pub struct CommandServiceBuilder {
    event_store: Arc<dyn EventStore>,
    command_store: Arc<dyn CommandStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    progress_store: Option<Arc<dyn PublishProgressStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    config: ProcessingConfig,
    factories: Vec<ExecutorFactory>,
}

impl CommandServiceBuilder {
    pub fn config(mut self, config: ProcessingConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables snapshots, taken every `config.snapshot_interval` versions.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Where publish progress is kept. Defaults to memory.
    pub fn progress_store(mut self, store: Arc<dyn PublishProgressStore>) -> Self {
        self.progress_store = Some(store);
        self
    }

    /// The downstream transport. Defaults to [`InMemoryEventPublisher`].
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Registers an aggregate type and the commands it handles.
    pub fn aggregate<A: Aggregate>(mut self, commands: CommandHandlers<A>) -> Self {
        let factory: ExecutorFactory = Box::new(
            move |event_store: Arc<dyn EventStore>,
                  snapshots: Option<Arc<dyn SnapshotStore>>,
                  interval: u64|
                  -> Arc<dyn CommandExecutor> {
                let executor = AggregateCommandExecutor::new(event_store, commands);
                match snapshots {
                    Some(store) => Arc::new(executor.with_snapshots(store, interval)),
                    None => Arc::new(executor),
                }
            },
        );
        self.factories.push(factory);
        self
    }

    /// Starts the service. Must be called from within a tokio runtime.
    pub fn build(self) -> CommandService {
        let config = self.config;

        let mut executors: HashMap<&'static str, Arc<dyn CommandExecutor>> = HashMap::new();
        for factory in self.factories {
            let executor = factory(
                Arc::clone(&self.event_store),
                self.snapshot_store.clone(),
                config.snapshot_interval,
            );
            let aggregate_type = executor.aggregate_type();
            if executors.insert(aggregate_type, executor).is_some() {
                tracing::warn!(aggregate_type, "aggregate registered twice, keeping the last one");
            }
        }

        let processing = Arc::new(ProcessingCommandCache::new());
        let publish = PublishService::new(
            self.publisher
                .unwrap_or_else(|| Arc::new(InMemoryEventPublisher::new())),
            Arc::clone(&self.event_store),
            self.progress_store
                .unwrap_or_else(|| Arc::new(InMemoryPublishProgressStore::new())),
            Arc::clone(&processing),
            &config,
        );

        let inner = Arc::new_cyclic(|service: &Weak<ServiceInner>| {
            let worker: Arc<dyn MailboxHandler<AggregateId, MailboxMessage>> =
                Arc::new(CommandWorker {
                    service: service.clone(),
                });
            let mailboxes = Mailboxes::new(
                "command",
                worker,
                config.mailbox_depth,
                config.mailbox_idle_timeout,
            );

            let retries = RetryService::start(
                config.retry_executor_count,
                config.retry_interval,
                |retry: PendingRetry| {
                    // A dropped receiver means the worker is gone.
                    let _ = retry.resume.send(retry.command);
                },
            );

            ServiceInner {
                command_permits: Semaphore::new(config.command_executor_count.max(1)),
                waiting_permits: Semaphore::new(config.waiting_executor_count.max(1)),
                config,
                executors,
                command_store: self.command_store,
                processing,
                mailboxes,
                retries,
                publish,
            }
        });

        tracing::info!(
            aggregates = inner.executors.len(),
            command_executors = inner.config.command_executor_count,
            waiting_executors = inner.config.waiting_executor_count,
            retry_executors = inner.config.retry_executor_count,
            "command service started"
        );
        CommandService { inner }
    }
}

/// Entry point of the pipeline.
///
/// Commands for the same aggregate id run one at a time in arrival order.
/// Commands for different ids run concurrently, bounded by the executor
/// permits. Cloning is cheap and every clone drives the same pipeline.
#[derive(Clone)]
pub struct CommandService {
    inner: Arc<ServiceInner>,
}

impl CommandService {
    pub fn builder(
        event_store: Arc<dyn EventStore>,
        command_store: Arc<dyn CommandStore>,
    ) -> CommandServiceBuilder {
        CommandServiceBuilder {
            event_store,
            command_store,
            snapshot_store: None,
            progress_store: None,
            publisher: None,
            config: ProcessingConfig::default(),
            factories: Vec::new(),
        }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.inner.config
    }

    /// Admits a command and returns a receiver for its result.
    ///
    /// Submitting a command id that is already in flight attaches to it
    /// instead of running it twice.
    pub fn submit(&self, envelope: CommandEnvelope) -> Result<oneshot::Receiver<CommandResult>> {
        let executor = self.inner.route(&envelope)?;
        metrics::counter!("commands_submitted_total", "aggregate_type" => executor.aggregate_type())
            .increment(1);

        let command_id = envelope.command_id().clone();
        let aggregate_id = envelope.aggregate_id().clone();
        let receiver = match self.inner.processing.try_admit(&command_id, &aggregate_id) {
            Admission::Admitted(receiver) => receiver,
            Admission::AlreadyInFlight(receiver) => {
                tracing::debug!(%command_id, "command already in flight");
                return Ok(receiver);
            }
        };

        let command = ProcessingCommand {
            envelope: Arc::new(envelope),
            executor,
            retry_count: 0,
        };
        if self
            .inner
            .mailboxes
            .enqueue(aggregate_id.clone(), MailboxMessage::Command(command))
            .is_err()
        {
            let err = ProcessingError::MailboxFull(aggregate_id);
            tracing::warn!(%command_id, error = %err, "command refused");
            self.inner.processing.complete(&command_id, Err(err.clone()));
            return Err(err);
        }
        Ok(receiver)
    }

    /// Submits a command and waits for its result.
    ///
    /// The envelope's timeout, or else the configured default, bounds the
    /// wait. A timed-out command keeps running.
    pub async fn execute(&self, envelope: CommandEnvelope) -> CommandResult {
        let command_id = envelope.command_id().clone();
        let timeout = envelope
            .timeout()
            .or(self.inner.config.default_command_timeout);
        let receiver = self.submit(envelope)?;

        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, receiver)
                .await
                .map_err(|_| ProcessingError::Timeout(command_id))?,
            None => receiver.await,
        };
        received.map_err(|_| ProcessingError::ShutDown)?
    }

    /// Wraps a typed command under a fresh id and executes it.
    pub async fn send<C: Command>(&self, command: &C) -> CommandResult {
        self.execute(CommandEnvelope::new(command)?).await
    }

    /// Replays an aggregate from its full history, refreshing the cache.
    ///
    /// Runs on the aggregate's mailbox so it never races a command.
    pub async fn rebuild(
        &self,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<Version>> {
        let executor = Arc::clone(self.inner.executor(aggregate_type)?);
        let (reply, receiver) = oneshot::channel();
        self.inner
            .mailboxes
            .force_enqueue(aggregate_id.clone(), MailboxMessage::Rebuild { executor, reply });
        receiver.await.map_err(|_| ProcessingError::ShutDown)?
    }

    /// Current state of an aggregate, `None` if it has no history.
    pub async fn aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<AggregateView>> {
        self.inner.executor(aggregate_type)?.view(aggregate_id).await
    }

    /// Re-delivers committed but unpublished streams, e.g. after a restart.
    pub async fn republish_pending(&self, aggregate_id: &AggregateId) -> Result<usize> {
        self.inner.publish.republish_pending(aggregate_id).await
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_mailboxes: self.inner.mailboxes.active(),
            in_flight_commands: self.inner.processing.in_flight_count(),
            queued_retries: self.inner.retries.queued(),
            active_publish_mailboxes: self.inner.publish.active_mailboxes(),
        }
    }
}

struct ServiceInner {
    config: ProcessingConfig,
    executors: HashMap<&'static str, Arc<dyn CommandExecutor>>,
    command_store: Arc<dyn CommandStore>,
    processing: Arc<ProcessingCommandCache>,
    mailboxes: Mailboxes<AggregateId, MailboxMessage>,
    retries: RetryService<PendingRetry>,
    publish: PublishService,
    command_permits: Semaphore,
    waiting_permits: Semaphore,
}

impl ServiceInner {
    fn executor(&self, aggregate_type: &str) -> Result<&Arc<dyn CommandExecutor>> {
        self.executors.get(aggregate_type).ok_or_else(|| {
            ProcessingError::HandlerNotFound(format!("no aggregate registered as {aggregate_type}"))
        })
    }

    fn route(&self, envelope: &CommandEnvelope) -> Result<Arc<dyn CommandExecutor>> {
        let executor = self.executor(envelope.aggregate_type())?;
        if !executor.handles(envelope.command_type()) {
            return Err(ProcessingError::HandlerNotFound(format!(
                "no handler for command {} on {}",
                envelope.command_type(),
                envelope.aggregate_type()
            )));
        }
        Ok(Arc::clone(executor))
    }

    fn permits(&self, delivery: Delivery) -> &Semaphore {
        match delivery {
            Delivery::Immediate => &self.command_permits,
            Delivery::Queued => &self.waiting_permits,
        }
    }

    /// Runs a command on its mailbox until it resolves, retries included.
    ///
    /// The mailbox stays parked between attempts, which keeps a retried
    /// command ahead of later arrivals for the same aggregate. No executor
    /// permit is held while parked.
    async fn drive(&self, mut command: ProcessingCommand, mut delivery: Delivery) {
        let command_id = command.envelope.command_id().clone();
        loop {
            let resume = {
                // The semaphores are never closed.
                let Ok(_permit) = self.permits(delivery).acquire().await else {
                    return;
                };
                self.process(command).await
            };
            let Some(resume) = resume else {
                return;
            };

            match resume.await {
                Ok(retry) => {
                    command = retry;
                    delivery = Delivery::Queued;
                }
                Err(_) => {
                    self.processing
                        .complete(&command_id, Err(ProcessingError::ShutDown));
                    return;
                }
            }
        }
    }

    /// Runs one attempt and settles its result. Returns the resume handle
    /// when the command waits for a retry.
    #[tracing::instrument(
        skip_all,
        fields(
            command_id = %command.envelope.command_id(),
            aggregate_id = %command.envelope.aggregate_id(),
            retry = command.retry_count
        )
    )]
    async fn process(
        &self,
        command: ProcessingCommand,
    ) -> Option<oneshot::Receiver<ProcessingCommand>> {
        let started = Instant::now();
        let aggregate_type = command.executor.aggregate_type();
        let command_id = command.envelope.command_id().clone();

        let mut resume = None;
        match self.run(&command).await {
            Ok(Attempt::Finished(outcome)) => {
                self.processing.complete(&command_id, Ok(outcome));
            }
            Ok(Attempt::Publishing) => {}
            Ok(Attempt::Retrying(receiver)) => resume = Some(receiver),
            Err(err) => {
                if matches!(err, ProcessingError::ConcurrencyConflictExhausted { .. }) {
                    metrics::counter!("commands_exhausted_total", "aggregate_type" => aggregate_type)
                        .increment(1);
                } else {
                    metrics::counter!("commands_failed_total", "aggregate_type" => aggregate_type)
                        .increment(1);
                }
                tracing::warn!(error = %err, "command failed");
                self.processing.complete(&command_id, Err(err));
            }
        }

        metrics::histogram!("command_duration_seconds", "aggregate_type" => aggregate_type)
            .record(started.elapsed().as_secs_f64());
        resume
    }

    async fn run(&self, command: &ProcessingCommand) -> Result<Attempt> {
        let envelope = &command.envelope;
        let aggregate_type = command.executor.aggregate_type();
        let command_id = envelope.command_id().clone();
        let aggregate_id = envelope.aggregate_id().clone();

        if let Some(handled) = self.command_store.find(&command_id).await? {
            metrics::counter!("commands_duplicate_total", "aggregate_type" => aggregate_type)
                .increment(1);
            tracing::debug!("command found in ledger");
            self.republish(&aggregate_id).await;
            return Ok(Attempt::Finished(CommandOutcome::duplicate(
                command_id,
                aggregate_id,
                handled.version,
            )));
        }

        match command.executor.execute(envelope).await? {
            Execution::Committed(stream) => {
                let version = stream.version();
                self.record(envelope, Some(version)).await;
                metrics::counter!("commands_applied_total", "aggregate_type" => aggregate_type)
                    .increment(1);
                let outcome = CommandOutcome::applied(command_id, aggregate_id, version);
                self.publish.publish(stream, Some(outcome));
                Ok(Attempt::Publishing)
            }
            Execution::NoChanges { version } => {
                self.record(envelope, None).await;
                Ok(Attempt::Finished(CommandOutcome::no_changes(
                    command_id,
                    aggregate_id,
                    version,
                )))
            }
            Execution::Duplicate { stream } => {
                let version = stream.as_ref().map(EventStream::version);
                self.record(envelope, version).await;
                metrics::counter!("commands_duplicate_total", "aggregate_type" => aggregate_type)
                    .increment(1);
                self.republish(&aggregate_id).await;
                Ok(Attempt::Finished(CommandOutcome::duplicate(
                    command_id,
                    aggregate_id,
                    version,
                )))
            }
            Execution::Conflict => {
                metrics::counter!("command_conflicts_total", "aggregate_type" => aggregate_type)
                    .increment(1);
                if command.retry_count >= self.config.max_retries {
                    return Err(ProcessingError::ConcurrencyConflictExhausted {
                        aggregate_id,
                        attempts: command.retry_count + 1,
                    });
                }

                self.processing.record_retry(&command_id);
                let retry = ProcessingCommand {
                    retry_count: command.retry_count + 1,
                    ..command.clone()
                };
                let (resume, parked) = oneshot::channel();
                if !self.retries.schedule(PendingRetry {
                    command: retry,
                    resume,
                }) {
                    return Err(ProcessingError::ShutDown);
                }
                metrics::counter!("command_retries_total", "aggregate_type" => aggregate_type)
                    .increment(1);
                tracing::debug!("conflict, retry scheduled");
                Ok(Attempt::Retrying(parked))
            }
        }
    }

    /// Adds the command to the ledger. Failures are logged; the store-level
    /// duplicate check still catches a replay.
    async fn record(&self, envelope: &CommandEnvelope, version: Option<Version>) {
        let record = HandledCommand {
            command_id: envelope.command_id().clone(),
            aggregate_id: envelope.aggregate_id().clone(),
            aggregate_type: envelope.aggregate_type().to_owned(),
            command_type: envelope.command_type().to_owned(),
            process_id: envelope.process_id().cloned(),
            source_event_id: envelope.source_event_id(),
            version,
            payload: envelope.payload().clone(),
            items: envelope.items().clone(),
            timestamp: Utc::now(),
        };

        match self.command_store.insert(&record).await {
            Ok(CommandAddResult::Success) => {}
            Ok(CommandAddResult::DuplicateCommand) => {
                tracing::debug!("command already in ledger");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to record handled command");
            }
        }
    }

    async fn republish(&self, aggregate_id: &AggregateId) {
        if let Err(e) = self.publish.republish_pending(aggregate_id).await {
            tracing::warn!(%aggregate_id, error = %e, "failed to queue pending streams");
        }
    }
}

/// Mailbox handler that runs commands and rebuilds under an executor permit.
struct CommandWorker {
    service: Weak<ServiceInner>,
}

#[async_trait]
impl MailboxHandler<AggregateId, MailboxMessage> for CommandWorker {
    async fn handle(&self, aggregate_id: &AggregateId, message: MailboxMessage, delivery: Delivery) {
        let Some(service) = self.service.upgrade() else {
            return;
        };

        match message {
            MailboxMessage::Command(command) => service.drive(command, delivery).await,
            MailboxMessage::Rebuild { executor, reply } => {
                let Ok(_permit) = service.permits(delivery).acquire().await else {
                    return;
                };
                let _ = reply.send(executor.rebuild(aggregate_id).await);
            }
        }
    }
}
