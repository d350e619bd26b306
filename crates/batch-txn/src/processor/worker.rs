//! The batch loop run by whichever caller currently holds the worker role.

use std::{
    any::Any,
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
};

use tracing::*;

use super::{admission::QueueItem, BatchProcessor};
use crate::{
    errors::{PermanentFailure, ProcessorFault, TxnError},
    message::Message,
    retry::RetryHelper,
    transaction::{FactoryOutput, TransactionFactory, UpdateResult, UpdateTransaction},
};

/// Bookkeeping for one worker turn, carried across retries.
struct BatchRun<U, R> {
    /// Outcomes waiting on the current attempt's commit, in queue order.
    outcomes: Vec<(Arc<QueueItem<U, R>>, Message<R>)>,

    /// Tickets of rejected updates whose callers were already answered.
    answered: HashSet<u64>,
}

impl<U, R> BatchRun<U, R> {
    fn new() -> Self {
        Self {
            outcomes: Vec::new(),
            answered: HashSet::new(),
        }
    }

    /// Tickets of every item this turn produced an outcome for.
    fn finished(&self) -> HashSet<u64> {
        self.outcomes
            .iter()
            .map(|(item, _)| item.seq)
            .chain(self.answered.iter().copied())
            .collect()
    }
}

impl<U, F, H> BatchProcessor<U, F, H>
where
    F: TransactionFactory<U>,
    H: RetryHelper,
{
    /// Drives the queued updates through one transaction (plus retries),
    /// hands over the worker role and dispatches outcomes.
    ///
    /// On return, every item removed from the queue has its outcome in its
    /// channel, including the worker's own.
    pub(super) fn do_work(&self) -> Result<(), Arc<ProcessorFault>> {
        if self.with_admission(|adm| adm.is_empty()) {
            return Ok(());
        }

        let batch = self.stats.batches.fetch_add(1, Ordering::Relaxed) + 1;
        let span = debug_span!("batch-txn", %batch);
        let _g = span.enter();

        let mut run = BatchRun::new();
        // A panicking retry helper still has to reach the cleanup below.
        let res = guarded(|| self.retry.run(|| self.run_attempt(&mut run)));

        let fault = match res {
            Ok(()) => {
                let committed = run.outcomes.len() as u64;
                self.stats.committed.fetch_add(committed, Ordering::Relaxed);
                debug!(%committed, answered_early = %run.answered.len(), "batch committed");
                None
            }
            Err(e) => {
                let (failure, fault) = classify_failure(e);
                self.fail_batch(&mut run, failure);
                fault
            }
        };

        // Must happen on every path, or the remaining waiters have no worker.
        let finished = run.finished();
        self.with_admission(|adm| {
            if let Some(fault) = &fault {
                adm.poison(fault.clone());
            }
            adm.finish_batch(&finished);
        });

        let mut fault = fault;
        for (item, msg) in run.outcomes {
            if let Err(e) = item.channel.send(msg) {
                error!(err = %e, seq = %item.seq, "failed to deliver outcome");
                fault.get_or_insert_with(|| self.poison(e.into()));
            }
        }

        match fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// One transaction attempt over the live queue.
    fn run_attempt(&self, run: &mut BatchRun<U, FactoryOutput<U, F>>) -> Result<(), TxnError> {
        // Results from a failed attempt never committed.
        run.outcomes.clear();
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let mut txn = guarded(|| self.factory.begin_transaction()).map_err(no_backpressure)?;

        match self.fill_transaction(&mut txn, run) {
            Ok(()) => guarded(move || txn.commit()).map_err(no_backpressure),
            Err(e) => {
                Self::rollback_quietly(txn);
                Err(e)
            }
        }
    }

    /// Feeds queued updates to `txn` in admission order until the queue runs
    /// out or the transaction is full.
    fn fill_transaction(
        &self,
        txn: &mut F::Txn,
        run: &mut BatchRun<U, FactoryOutput<U, F>>,
    ) -> Result<(), TxnError> {
        let mut processed = 0usize;
        let mut idx = 0;

        while let Some(item) = self.with_admission(|adm| adm.item_at(idx)) {
            idx += 1;
            if run.answered.contains(&item.seq) {
                continue;
            }

            let res = guarded(|| txn.process_update(&item.update)).and_then(|res| {
                let rejected = guarded(|| Ok(res.is_rejected()))?;
                Ok((res, rejected))
            });

            match res {
                Ok((res, true)) => {
                    trace!(seq = %item.seq, "update rejected, answering early");
                    item.channel
                        .send(Message::Result(res))
                        .map_err(|e| TxnError::Fault(ProcessorFault::from(e).into()))?;
                    run.answered.insert(item.seq);
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }

                Ok((res, false)) => run.outcomes.push((item, Message::Result(res))),

                Err(TxnError::BatchTooLarge) => {
                    if processed == 0 {
                        return Err(TxnError::Fault(ProcessorFault::FirstUpdateTooLarge.into()));
                    }

                    debug!(%processed, "transaction full, deferring remaining updates");
                    return Ok(());
                }

                Err(TxnError::Fault(e)) => {
                    let failure = PermanentFailure::msg(format!("update failed unexpectedly: {e:#}"));
                    run.outcomes.push((item, Message::PermanentFailure(failure)));
                    return Err(TxnError::Fault(e));
                }

                Err(e) => return Err(e),
            }

            processed += 1;
        }

        Ok(())
    }

    /// Replaces every outcome of the current attempt with `failure`.  If the
    /// attempt has none, the oldest unanswered update is failed instead, so
    /// a batch that keeps failing still makes progress.
    fn fail_batch(&self, run: &mut BatchRun<U, FactoryOutput<U, F>>, failure: PermanentFailure) {
        if run.outcomes.is_empty() {
            let victim = self.with_admission(|adm| adm.first_unanswered(&run.answered));
            if let Some(item) = victim {
                run.outcomes.push((item, Message::YourTurn));
            }
        }

        for (_, msg) in run.outcomes.iter_mut() {
            *msg = Message::PermanentFailure(failure.clone());
        }

        let failed = run.outcomes.len() as u64;
        self.stats.failed.fetch_add(failed, Ordering::Relaxed);
        warn!(%failed, err = %failure, "batch failed");
    }

    fn rollback_quietly(txn: F::Txn) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || txn.rollback())) {
            error!(panic = %panic_message(payload.as_ref()), "transaction rollback panicked, ignoring");
        }
    }
}

/// Runs strategy code, turning panics into faults.
fn guarded<T>(f: impl FnOnce() -> Result<T, TxnError>) -> Result<T, TxnError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = panic_message(payload.as_ref());
        Err(TxnError::Fault(ProcessorFault::Panicked(msg).into()))
    })
}

/// Backpressure only makes sense from `process_update`.
fn no_backpressure(e: TxnError) -> TxnError {
    match e {
        TxnError::BatchTooLarge => TxnError::Fault(ProcessorFault::UnexpectedBatchTooLarge.into()),
        e => e,
    }
}

/// Splits a failed turn into the failure reported to callers and, if the
/// processor must be poisoned, the fault responsible.
fn classify_failure(e: TxnError) -> (PermanentFailure, Option<Arc<ProcessorFault>>) {
    let fault = match e {
        TxnError::Permanent(failure) => return (failure, None),
        // A helper that hands back a transient error has given up on it.
        TxnError::Retryable(e) => return (PermanentFailure::new(e), None),
        TxnError::BatchTooLarge => ProcessorFault::UnexpectedBatchTooLarge,
        TxnError::Fault(e) => match e.downcast::<ProcessorFault>() {
            Ok(fault) => fault,
            Err(e) => ProcessorFault::Strategy(e),
        },
    };

    let fault = Arc::new(fault);
    let failure = PermanentFailure::msg(format!("batch aborted: {fault}"));
    (failure, Some(fault))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
