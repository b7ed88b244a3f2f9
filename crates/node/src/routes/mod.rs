//! HTTP route handlers.

pub mod aggregates;
pub mod notes;
pub mod system;
