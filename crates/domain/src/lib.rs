//! Domain layer for the command-processing framework.
//!
//! This crate provides the building blocks business code plugs into:
//! - [`Aggregate`] and [`DomainEvent`] traits for event-sourced entities
//! - [`EventHandlers`], the per-aggregate registry of internal event handlers
//! - [`AggregateRoot`], which tracks id, version and uncommitted events
//! - [`Command`], [`CommandEnvelope`] and the [`CommandHandlers`] registry

pub mod aggregate;
pub mod command;
pub mod error;

pub use aggregate::{Aggregate, AggregateRoot, DomainEvent, EventHandlers};
pub use command::{Command, CommandEnvelope, CommandHandler, CommandHandlers};
pub use error::DomainError;
