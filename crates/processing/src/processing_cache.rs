//! Tracks commands from admission to their terminal outcome.

use std::time::Instant;

use common::{AggregateId, CommandId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::outcome::CommandResult;

/// Result of trying to admit a command.
#[derive(Debug)]
pub enum Admission {
    /// First submission of this id; the caller must enqueue it.
    Admitted(oneshot::Receiver<CommandResult>),
    /// The id is already being processed; the receiver resolves with the
    /// result of the original submission.
    AlreadyInFlight(oneshot::Receiver<CommandResult>),
}

struct InFlight {
    aggregate_id: AggregateId,
    enqueued_at: Instant,
    retry_count: u32,
    waiters: Vec<oneshot::Sender<CommandResult>>,
}

/// Read-only view of an in-flight command.
#[derive(Debug, Clone)]
pub struct ProcessingEntry {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    pub waiters: usize,
}

/// In-flight command registry with result fan-out.
#[derive(Default)]
pub struct ProcessingCommandCache {
    entries: DashMap<CommandId, InFlight>,
}

impl ProcessingCommandCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a command, or attaches to the in-flight one with the same id.
    pub fn try_admit(&self, command_id: &CommandId, aggregate_id: &AggregateId) -> Admission {
        let (sender, receiver) = oneshot::channel();
        match self.entries.entry(command_id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().waiters.push(sender);
                Admission::AlreadyInFlight(receiver)
            }
            Entry::Vacant(entry) => {
                entry.insert(InFlight {
                    aggregate_id: aggregate_id.clone(),
                    enqueued_at: Instant::now(),
                    retry_count: 0,
                    waiters: vec![sender],
                });
                Admission::Admitted(receiver)
            }
        }
    }

    /// Bumps the retry count, returning the new value.
    pub fn record_retry(&self, command_id: &CommandId) -> Option<u32> {
        self.entries.get_mut(command_id).map(|mut entry| {
            entry.retry_count += 1;
            entry.retry_count
        })
    }

    /// Removes the entry and delivers `result` to every waiter.
    ///
    /// Returns how many waiters were still listening.
    pub fn complete(&self, command_id: &CommandId, result: CommandResult) -> usize {
        let Some((_, entry)) = self.entries.remove(command_id) else {
            return 0;
        };
        entry
            .waiters
            .into_iter()
            .map(|waiter| waiter.send(result.clone()))
            .filter(Result::is_ok)
            .count()
    }

    pub fn get(&self, command_id: &CommandId) -> Option<ProcessingEntry> {
        self.entries.get(command_id).map(|entry| ProcessingEntry {
            command_id: command_id.clone(),
            aggregate_id: entry.aggregate_id.clone(),
            enqueued_at: entry.enqueued_at,
            retry_count: entry.retry_count,
            waiters: entry.waiters.len(),
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use event_store::Version;

    use super::*;
    use crate::error::ProcessingError;
    use crate::outcome::CommandOutcome;

    fn ids() -> (CommandId, AggregateId) {
        (CommandId::from("cmd-1"), AggregateId::from("acct-1"))
    }

    #[tokio::test]
    async fn first_submission_is_admitted() {
        let cache = ProcessingCommandCache::new();
        let (command_id, aggregate_id) = ids();

        assert!(matches!(
            cache.try_admit(&command_id, &aggregate_id),
            Admission::Admitted(_)
        ));
        let entry = cache.get(&command_id).unwrap();
        assert_eq!(entry.aggregate_id, aggregate_id);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(cache.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_submission_shares_the_result() {
        let cache = ProcessingCommandCache::new();
        let (command_id, aggregate_id) = ids();

        let Admission::Admitted(first) = cache.try_admit(&command_id, &aggregate_id) else {
            panic!("expected admission");
        };
        let Admission::AlreadyInFlight(second) = cache.try_admit(&command_id, &aggregate_id)
        else {
            panic!("expected in-flight attachment");
        };

        let outcome = CommandOutcome::applied(command_id.clone(), aggregate_id, Version::new(4));
        assert_eq!(cache.complete(&command_id, Ok(outcome.clone())), 2);

        assert_eq!(first.await.unwrap().unwrap(), outcome);
        assert_eq!(second.await.unwrap().unwrap(), outcome);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn complete_tolerates_dropped_waiters() {
        let cache = ProcessingCommandCache::new();
        let (command_id, aggregate_id) = ids();

        drop(cache.try_admit(&command_id, &aggregate_id));
        assert_eq!(cache.complete(&command_id, Err(ProcessingError::ShutDown)), 0);
        assert_eq!(cache.complete(&command_id, Err(ProcessingError::ShutDown)), 0);
    }

    #[tokio::test]
    async fn retries_are_counted() {
        let cache = ProcessingCommandCache::new();
        let (command_id, aggregate_id) = ids();
        let _admission = cache.try_admit(&command_id, &aggregate_id);

        assert_eq!(cache.record_retry(&command_id), Some(1));
        assert_eq!(cache.record_retry(&command_id), Some(2));
        assert_eq!(cache.get(&command_id).unwrap().retry_count, 2);
        assert_eq!(cache.record_retry(&CommandId::from("unknown")), None);
    }

    #[tokio::test]
    async fn id_can_be_admitted_again_after_completion() {
        let cache = ProcessingCommandCache::new();
        let (command_id, aggregate_id) = ids();

        let _first = cache.try_admit(&command_id, &aggregate_id);
        cache.complete(&command_id, Err(ProcessingError::ShutDown));

        assert!(matches!(
            cache.try_admit(&command_id, &aggregate_id),
            Admission::Admitted(_)
        ));
    }
}
