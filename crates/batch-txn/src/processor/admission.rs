//! Admission queue and worker election state, guarded by the processor lock.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    thread::{self, ThreadId},
};

use tracing::*;

use crate::{
    channel::RestrictedHandoffChannel,
    errors::{BatchError, ProcessorFault},
    message::Message,
};

/// An admitted update waiting for its outcome.
#[derive(Debug)]
pub(crate) struct QueueItem<U, R> {
    /// Thread that submitted the update.
    pub(crate) caller: ThreadId,

    /// Admission ticket, unique per processor.
    pub(crate) seq: u64,

    /// Private channel the caller waits on.
    pub(crate) channel: Arc<RestrictedHandoffChannel<R>>,

    pub(crate) update: U,
}

/// Shared mutable state of a processor.
///
/// Outside of a critical section `worker.is_none() == queue.is_empty()`.
/// Items are only ever removed by the current worker, through
/// [`Admission::finish_batch`].
#[derive(Debug)]
pub(crate) struct Admission<U, R> {
    queue: VecDeque<Arc<QueueItem<U, R>>>,
    worker: Option<ThreadId>,
    poison: Option<Arc<ProcessorFault>>,
    next_seq: u64,
}

impl<U, R> Admission<U, R> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            worker: None,
            poison: None,
            next_seq: 0,
        }
    }

    /// Enqueues an update for the calling thread.  If nobody is working the
    /// caller is elected and its channel already holds `YourTurn`.
    pub(crate) fn admit(
        &mut self,
        update: U,
    ) -> Result<Arc<RestrictedHandoffChannel<R>>, BatchError> {
        if let Some(cause) = &self.poison {
            return Err(BatchError::Poisoned(cause.clone()));
        }

        let caller = thread::current().id();
        let seq = self.next_seq;
        self.next_seq += 1;

        let channel = Arc::new(RestrictedHandoffChannel::new());
        self.queue.push_back(Arc::new(QueueItem {
            caller,
            seq,
            channel: channel.clone(),
            update,
        }));

        if self.worker.is_none() {
            if let Err(e) = channel.send(Message::YourTurn) {
                self.queue.pop_back();
                return Err(BatchError::Fatal(Arc::new(e.into())));
            }

            trace!(%seq, ?caller, "elected worker on admission");
            self.worker = Some(caller);
        }

        Ok(channel)
    }

    /// Item at `idx` in admission order, if that many are queued.
    pub(crate) fn item_at(&self, idx: usize) -> Option<Arc<QueueItem<U, R>>> {
        self.queue.get(idx).cloned()
    }

    /// Oldest queued item whose ticket is not in `answered`.
    pub(crate) fn first_unanswered(&self, answered: &HashSet<u64>) -> Option<Arc<QueueItem<U, R>>> {
        self.queue
            .iter()
            .find(|item| !answered.contains(&item.seq))
            .cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn poison_cause(&self) -> Option<Arc<ProcessorFault>> {
        self.poison.clone()
    }

    /// Marks the processor poisoned.  The first cause wins.
    pub(crate) fn poison(&mut self, fault: Arc<ProcessorFault>) -> Arc<ProcessorFault> {
        self.poison.get_or_insert(fault).clone()
    }

    /// Removes the items the worker produced outcomes for and hands the
    /// worker role to the owner of the oldest remaining item.
    pub(crate) fn finish_batch(&mut self, done: &HashSet<u64>) {
        self.queue.retain(|item| !done.contains(&item.seq));
        self.elect_next();
    }

    fn elect_next(&mut self) {
        if self.poison.is_some() {
            self.abandon_queue();
            return;
        }

        let Some(next) = self.queue.front() else {
            self.worker = None;
            return;
        };

        if let Err(e) = next.channel.send(Message::YourTurn) {
            error!(err = %e, seq = %next.seq, "failed to hand over worker role");
            self.poison(Arc::new(e.into()));
            self.abandon_queue();
            return;
        }

        trace!(seq = %next.seq, caller = ?next.caller, "handed over worker role");
        self.worker = Some(next.caller);
    }

    /// Drops every queued item, waking its owner with a cancellation.
    fn abandon_queue(&mut self) {
        if !self.queue.is_empty() {
            warn!(abandoned = %self.queue.len(), "processor poisoned, abandoning queued updates");
        }

        for item in self.queue.drain(..) {
            item.channel.cancel();
        }

        self.worker = None;
    }

    pub(crate) fn check_invariant(&self) {
        debug_assert_eq!(
            self.worker.is_none(),
            self.queue.is_empty(),
            "batch-txn: worker slot out of sync with admission queue"
        );
    }
}
