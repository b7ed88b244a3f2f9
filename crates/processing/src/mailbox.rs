//! Keyed mailboxes: one ordered queue and at most one worker per key.
//!
//! A mailbox is created on the first message for its key and retires after
//! sitting idle and empty. Enqueueing and retirement both take the map's
//! shard lock for the key, so a message can never be stranded in a retiring
//! mailbox and two workers never run for the same key.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Returned when a mailbox already holds its maximum number of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mailbox is full")]
pub struct MailboxFull;

/// How a message reached its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The worker was idle when the message arrived.
    Immediate,
    /// The message waited behind earlier messages for the same key.
    Queued,
}

/// Processes the messages of one key, one at a time.
#[async_trait]
pub trait MailboxHandler<K, M>: Send + Sync + 'static {
    async fn handle(&self, key: &K, message: M, delivery: Delivery);
}

struct Slot<M> {
    sender: mpsc::UnboundedSender<M>,
    pending: Arc<AtomicUsize>,
    generation: u64,
}

struct Registry<K, M> {
    slots: DashMap<K, Slot<M>>,
    handler: Arc<dyn MailboxHandler<K, M>>,
    depth: usize,
    idle_timeout: Duration,
    generations: AtomicU64,
    kind: &'static str,
}

impl<K, M> Registry<K, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Send + 'static,
{
    /// Removes the slot if it still belongs to `generation` and is empty.
    ///
    /// Returns true when the worker should exit.
    fn retire(&self, key: &K, generation: u64) -> bool {
        let removed = self
            .slots
            .remove_if(key, |_, slot| {
                slot.generation == generation && slot.pending.load(Ordering::Acquire) == 0
            })
            .is_some();

        removed
            || !self
                .slots
                .get(key)
                .is_some_and(|slot| slot.generation == generation)
    }
}

/// A set of keyed mailboxes sharing one handler.
pub struct Mailboxes<K, M> {
    registry: Arc<Registry<K, M>>,
}

impl<K, M> Clone for Mailboxes<K, M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K, M> Mailboxes<K, M>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Display + 'static,
    M: Send + 'static,
{
    /// Creates an empty set of mailboxes.
    ///
    /// `kind` labels the `mailboxes_active` gauge. `depth` is clamped to at
    /// least one.
    pub fn new(
        kind: &'static str,
        handler: Arc<dyn MailboxHandler<K, M>>,
        depth: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(Registry {
                slots: DashMap::new(),
                handler,
                depth: depth.max(1),
                idle_timeout,
                generations: AtomicU64::new(0),
                kind,
            }),
        }
    }

    /// Queues a message, failing with [`MailboxFull`] at capacity.
    pub fn enqueue(&self, key: K, message: M) -> Result<(), MailboxFull> {
        self.push(key, message, Some(self.registry.depth))
    }

    /// Queues a message regardless of capacity.
    pub fn force_enqueue(&self, key: K, message: M) {
        // Without a limit the push cannot fail.
        let _ = self.push(key, message, None);
    }

    /// Number of mailboxes that currently have a worker.
    pub fn active(&self) -> usize {
        self.registry.slots.len()
    }

    /// Messages queued for `key` and not yet picked up by its worker.
    pub fn pending(&self, key: &K) -> usize {
        self.registry
            .slots
            .get(key)
            .map(|slot| slot.pending.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn push(&self, key: K, mut message: M, limit: Option<usize>) -> Result<(), MailboxFull> {
        loop {
            let mut spawn = None;
            let sent = {
                let slot = match self.registry.slots.entry(key.clone()) {
                    Entry::Occupied(entry) => entry.into_ref(),
                    Entry::Vacant(entry) => {
                        let (sender, receiver) = mpsc::unbounded_channel();
                        let pending = Arc::new(AtomicUsize::new(0));
                        let generation = self.registry.generations.fetch_add(1, Ordering::Relaxed);
                        spawn = Some((receiver, Arc::clone(&pending), generation));
                        entry.insert(Slot {
                            sender,
                            pending,
                            generation,
                        })
                    }
                };

                // A fresh slot is empty and the depth is at least one, so a
                // newly spawned worker is never left without its message.
                if let Some(limit) = limit
                    && slot.pending.load(Ordering::Acquire) >= limit
                {
                    return Err(MailboxFull);
                }

                slot.pending.fetch_add(1, Ordering::AcqRel);
                match slot.sender.send(message) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::SendError(returned)) => {
                        slot.pending.fetch_sub(1, Ordering::AcqRel);
                        Err((returned, slot.generation))
                    }
                }
            };

            if let Some((receiver, pending, generation)) = spawn {
                tokio::spawn(run_worker(
                    Arc::clone(&self.registry),
                    key.clone(),
                    receiver,
                    pending,
                    generation,
                ));
            }

            match sent {
                Ok(()) => return Ok(()),
                Err((returned, generation)) => {
                    // The worker died without retiring its slot.
                    tracing::warn!(kind = self.registry.kind, %key, "replacing dead mailbox");
                    self.registry
                        .slots
                        .remove_if(&key, |_, slot| slot.generation == generation);
                    message = returned;
                }
            }
        }
    }
}

async fn run_worker<K, M>(
    registry: Arc<Registry<K, M>>,
    key: K,
    mut receiver: mpsc::UnboundedReceiver<M>,
    pending: Arc<AtomicUsize>,
    generation: u64,
) where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Display + 'static,
    M: Send + 'static,
{
    metrics::gauge!("mailboxes_active", "kind" => registry.kind).increment(1.0);
    tracing::trace!(kind = registry.kind, %key, "mailbox started");

    let mut first = true;
    loop {
        let (message, delivery) = match receiver.try_recv() {
            Ok(message) if first => (message, Delivery::Immediate),
            Ok(message) => (message, Delivery::Queued),
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                match tokio::time::timeout(registry.idle_timeout, receiver.recv()).await {
                    Ok(Some(message)) => (message, Delivery::Immediate),
                    Ok(None) => break,
                    Err(_) => {
                        if registry.retire(&key, generation) {
                            break;
                        }
                        continue;
                    }
                }
            }
        };
        first = false;
        pending.fetch_sub(1, Ordering::AcqRel);
        registry.handler.handle(&key, message, delivery).await;
    }

    tracing::trace!(kind = registry.kind, %key, "mailbox retired");
    metrics::gauge!("mailboxes_active", "kind" => registry.kind).decrement(1.0);
}
