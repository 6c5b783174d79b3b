//! Queue bookkeeping, guarded by the queue's mutex.
//!
//! Invariants:
//! - a fingerprint appears in at most one queued or executing item;
//! - `depth` equals the items in the open batch plus the ready batches;
//! - every in-flight entry in the `Queued` stage has exactly one item in
//!   the open batch or a ready batch.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use inferline_core::{Fingerprint, Payload, Prediction, ServeError, deadline_after};

/// What a waiter receives when its item finishes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Served {
    pub prediction: Prediction,
    pub batch_size: usize,
    pub cache_hit: bool,
}

pub(crate) type Delivery = Result<Served, ServeError>;

pub(crate) struct Item {
    pub fingerprint: Fingerprint,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Queued,
    Executing,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Delivery>,
}

struct InFlight {
    stage: Stage,
    waiters: Vec<Waiter>,
}

struct OpenBatch {
    items: Vec<Item>,
    /// Admission time of each entry in `items`, same order.
    admitted: Vec<Instant>,
}

/// Handle for a registered waiter.
pub(crate) struct Ticket {
    pub id: u64,
    pub rx: oneshot::Receiver<Delivery>,
    /// A new open batch was started.
    pub opened: bool,
    /// The open batch filled and moved to the ready queue.
    pub closed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub batches_dispatched: u64,
    pub requests_coalesced: u64,
    pub requests_expired: u64,
    pub requests_rejected: u64,
}

pub(crate) struct QueueState {
    max_batch_size: usize,
    max_queue_depth: usize,
    open: Option<OpenBatch>,
    ready: VecDeque<Vec<Item>>,
    in_flight: HashMap<Fingerprint, InFlight>,
    depth: usize,
    next_waiter: u64,
    pub shutting_down: bool,
    pub counters: Counters,
}

impl QueueState {
    pub fn new(max_batch_size: usize, max_queue_depth: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_queue_depth,
            open: None,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            depth: 0,
            next_waiter: 0,
            shutting_down: false,
            counters: Counters::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn waiter(&mut self) -> (Waiter, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        self.next_waiter += 1;
        (
            Waiter {
                id: self.next_waiter,
                tx,
            },
            rx,
        )
    }

    /// Wait on work already queued or executing for `fingerprint`.
    pub fn attach(&mut self, fingerprint: &Fingerprint) -> Option<Ticket> {
        if !self.in_flight.contains_key(fingerprint) {
            return None;
        }
        let (waiter, rx) = self.waiter();
        let id = waiter.id;
        self.in_flight.get_mut(fingerprint)?.waiters.push(waiter);
        self.counters.requests_coalesced += 1;
        Some(Ticket {
            id,
            rx,
            opened: false,
            closed: false,
        })
    }

    /// Append a new item to the open batch.
    pub fn enqueue(&mut self, item: Item, now: Instant) -> Result<Ticket, ServeError> {
        if self.depth >= self.max_queue_depth {
            self.counters.requests_rejected += 1;
            return Err(ServeError::Overloaded {
                depth: self.depth,
                max: self.max_queue_depth,
            });
        }

        let (waiter, rx) = self.waiter();
        let id = waiter.id;
        self.in_flight.insert(
            item.fingerprint,
            InFlight {
                stage: Stage::Queued,
                waiters: vec![waiter],
            },
        );

        let opened = self.open.is_none();
        let open = self.open.get_or_insert_with(|| OpenBatch {
            items: Vec::new(),
            admitted: Vec::new(),
        });
        open.items.push(item);
        open.admitted.push(now);
        self.depth += 1;

        let closed = open.items.len() >= self.max_batch_size && self.close_open();
        Ok(Ticket {
            id,
            rx,
            opened,
            closed,
        })
    }

    /// When the oldest item still in the open batch has waited `max_wait`.
    pub fn open_closes_at(&self, max_wait: Duration) -> Option<Instant> {
        let oldest = self.open.as_ref()?.admitted.iter().min()?;
        Some(deadline_after(*oldest, max_wait))
    }

    /// Move the open batch to the ready queue. Returns false if there was
    /// nothing to move.
    pub fn close_open(&mut self) -> bool {
        match self.open.take() {
            Some(batch) if !batch.items.is_empty() => {
                self.ready.push_back(batch.items);
                true
            }
            _ => false,
        }
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Nothing left to dispatch.
    pub fn drained(&self) -> bool {
        self.open.is_none() && self.ready.is_empty()
    }

    /// Take the oldest ready batch for execution.
    pub fn take_ready(&mut self) -> Option<Vec<Item>> {
        let batch = self.ready.pop_front()?;
        for item in &batch {
            if let Some(entry) = self.in_flight.get_mut(&item.fingerprint) {
                entry.stage = Stage::Executing;
            }
        }
        self.depth -= batch.len();
        self.counters.batches_dispatched += 1;
        Some(batch)
    }

    /// Drop waiter `id` from `fingerprint`.
    ///
    /// A queued item left with no waiters is removed from its batch.
    /// Returns true if an item was removed.
    pub fn withdraw(&mut self, fingerprint: &Fingerprint, id: u64) -> bool {
        let Some(entry) = self.in_flight.get_mut(fingerprint) else {
            return false;
        };
        entry.waiters.retain(|w| w.id != id);
        if !entry.waiters.is_empty() || entry.stage == Stage::Executing {
            return false;
        }
        self.in_flight.remove(fingerprint);

        if let Some(open) = &mut self.open
            && let Some(pos) = open.items.iter().position(|i| &i.fingerprint == fingerprint)
        {
            open.items.remove(pos);
            open.admitted.remove(pos);
            if open.items.is_empty() {
                self.open = None;
            }
            self.depth -= 1;
            return true;
        }

        let found = self.ready.iter().enumerate().find_map(|(b, batch)| {
            batch
                .iter()
                .position(|i| &i.fingerprint == fingerprint)
                .map(|pos| (b, pos))
        });
        let Some((b, pos)) = found else {
            return false;
        };
        self.ready[b].remove(pos);
        if self.ready[b].is_empty() {
            self.ready.remove(b);
        }
        self.depth -= 1;
        true
    }

    /// Remove a finished fingerprint and hand back its waiters' senders.
    pub fn finish(&mut self, fingerprint: &Fingerprint) -> Vec<oneshot::Sender<Delivery>> {
        self.in_flight
            .remove(fingerprint)
            .map(|entry| entry.waiters.into_iter().map(|w| w.tx).collect())
            .unwrap_or_default()
    }

    /// Fail every queued item and every waiter with `err`.
    pub fn abort_all(&mut self, err: ServeError) -> usize {
        self.open = None;
        self.ready.clear();
        self.depth = 0;
        let mut failed = 0;
        for (_, entry) in self.in_flight.drain() {
            for w in entry.waiters {
                failed += 1;
                let _ = w.tx.send(Err(err.clone()));
            }
        }
        failed
    }
}
