//! Command processing pipeline for event-sourced aggregates.
//!
//! A submitted command is admitted by the [`ProcessingCommandCache`], queued
//! on its aggregate's mailbox and executed by a single worker per aggregate:
//! load from the [`MemoryCache`] or by replay, run the handler, append the
//! new stream under optimistic concurrency. Conflicts go through the
//! [`RetryService`]; committed streams go through the [`PublishService`],
//! which releases the caller's result once the transport accepts them.
//!
//! [`CommandService`] wires all of it together.

pub mod config;
pub mod error;
pub mod executor;
pub mod mailbox;
pub mod memory_cache;
pub mod outcome;
pub mod processing_cache;
pub mod publish;
pub mod publisher;
pub mod repository;
pub mod retry;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::ProcessingConfig;
pub use error::{ProcessingError, Result};
pub use executor::{AggregateCommandExecutor, AggregateView, CommandExecutor, Execution};
pub use mailbox::{Delivery, MailboxFull, MailboxHandler, Mailboxes};
pub use memory_cache::MemoryCache;
pub use outcome::{CommandOutcome, CommandResult, CommandStatus};
pub use processing_cache::{Admission, ProcessingCommandCache, ProcessingEntry};
pub use publish::PublishService;
pub use publisher::{EventMessage, EventPublisher, InMemoryEventPublisher, PublishError};
pub use repository::EventSourcingRepository;
pub use retry::RetryService;
pub use service::{CommandService, CommandServiceBuilder, ServiceStats};
