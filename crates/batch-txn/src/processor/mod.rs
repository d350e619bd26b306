//! Batch processor: turns concurrent callers into batched transactions.
//!
//! Callers submit updates through [`BatchProcessor::process_update`].  The
//! first caller to arrive while nobody is working becomes the *worker*: it
//! drains the admission queue into one transaction (retrying it as the
//! [`RetryHelper`] decides), hands every other caller its outcome over that
//! caller's private handoff channel, and passes the worker role on to the
//! owner of the oldest update still queued.  Everyone else just waits on their
//! channel.  No background thread is involved.
//!
//! ```text
//!  caller ──admit──▶ queue ──▶ elected? ──yes──▶ do_work ──▶ own outcome
//!                                 │
//!                                 no
//!                                 ▼
//!                       wait on channel ◀── Result / PermanentFailure / YourTurn
//! ```
//!
//! Any unexpected error while driving a batch poisons the processor.  The
//! call that hit it gets [`BatchError::Fatal`], every later call gets
//! [`BatchError::Poisoned`] and the instance has to be replaced.

mod admission;
mod worker;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task;
use tracing::*;

use self::admission::Admission;
use crate::{
    channel::{ChannelState, RestrictedHandoffChannel},
    errors::{BatchError, HandoffError, ProcessorFault},
    message::{Message, MessageKind},
    retry::{BackoffRetryHelper, RetryHelper},
    transaction::{FactoryOutput, TransactionFactory},
};

/// Coordinates concurrent updates against one shared resource.
///
/// Create one per resource and share it (usually in an [`Arc`]) between all
/// threads issuing updates.
pub struct BatchProcessor<U, F: TransactionFactory<U>, H = BackoffRetryHelper> {
    factory: F,
    retry: H,
    admission: Mutex<Admission<U, FactoryOutput<U, F>>>,
    stats: Counters,
}

impl<U, F, H> BatchProcessor<U, F, H>
where
    F: TransactionFactory<U>,
    H: RetryHelper,
{
    pub fn new(factory: F, retry: H) -> Self {
        Self {
            factory,
            retry,
            admission: Mutex::new(Admission::new()),
            stats: Counters::default(),
        }
    }

    /// Applies `update` as part of some batch and returns its result.
    ///
    /// Blocks until the batch holding the update is finished.  The calling
    /// thread may end up driving that batch, and others, itself.
    pub fn process_update(&self, update: U) -> Result<FactoryOutput<U, F>, BatchError> {
        let channel = self.with_admission(|adm| adm.admit(update))?;

        match self.wait_for_message(&channel)? {
            Message::YourTurn => {}
            msg => return self.outcome_of(msg),
        }

        if let Err(fault) = self.do_work() {
            error!(err = %fault, "batch processor poisoned");
            return Err(BatchError::Fatal(fault));
        }

        // do_work always leaves our own outcome behind before returning.
        let msg = self.wait_for_message(&channel)?;
        self.outcome_of(msg)
    }

    /// Number of admitted updates whose batch has not finished yet.
    pub fn pending(&self) -> usize {
        self.admission.lock().len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.admission.lock().poison_cause().is_some()
    }

    /// The fault that poisoned this processor, if any.
    pub fn poison_cause(&self) -> Option<Arc<ProcessorFault>> {
        self.admission.lock().poison_cause()
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.snapshot()
    }

    pub fn retry_helper(&self) -> &H {
        &self.retry
    }

    /// Runs `f` under the admission lock.
    fn with_admission<T>(&self, f: impl FnOnce(&mut Admission<U, FactoryOutput<U, F>>) -> T) -> T {
        let mut adm = self.admission.lock();
        let res = f(&mut adm);
        adm.check_invariant();
        res
    }

    fn poison(&self, fault: ProcessorFault) -> Arc<ProcessorFault> {
        self.with_admission(|adm| adm.poison(Arc::new(fault)))
    }

    fn wait_for_message(
        &self,
        channel: &RestrictedHandoffChannel<FactoryOutput<U, F>>,
    ) -> Result<Message<FactoryOutput<U, F>>, BatchError> {
        channel.receive().map_err(|e| match self.poison_cause() {
            // We were abandoned by a worker that poisoned the processor.
            Some(cause) => BatchError::Poisoned(cause),
            None => {
                error!(err = %e, "handoff wait broken");
                BatchError::Fatal(self.poison(e.into()))
            }
        })
    }

    fn outcome_of(
        &self,
        msg: Message<FactoryOutput<U, F>>,
    ) -> Result<FactoryOutput<U, F>, BatchError> {
        msg.into_outcome().unwrap_or_else(|| {
            let fault = HandoffError::IllegalTransition {
                state: ChannelState::YourTurnReceived,
                kind: MessageKind::YourTurn,
            };
            Err(BatchError::Fatal(self.poison(fault.into())))
        })
    }
}

impl<U, F, H> BatchProcessor<U, F, H>
where
    U: Send + Sync + 'static,
    F: TransactionFactory<U> + Send + Sync + 'static,
    H: RetryHelper + Send + Sync + 'static,
    FactoryOutput<U, F>: Send + 'static,
{
    /// Async flavour of [`Self::process_update`].
    ///
    /// The protocol is blocking, so the call is moved onto the runtime's
    /// blocking pool where it may take the worker role like any other caller.
    pub async fn process_update_async(
        self: &Arc<Self>,
        update: U,
    ) -> Result<FactoryOutput<U, F>, BatchError> {
        let this = self.clone();
        match task::spawn_blocking(move || this.process_update(update)).await {
            Ok(res) => res,
            Err(e) => {
                error!(err = %e, "blocking update task failed");
                Err(BatchError::WorkerExited)
            }
        }
    }
}

impl<U, F, H> fmt::Debug for BatchProcessor<U, F, H>
where
    F: TransactionFactory<U>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adm = self.admission.lock();
        f.debug_struct("BatchProcessor")
            .field("pending", &adm.len())
            .field("poisoned", &adm.poison_cause().is_some())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Snapshot of a processor's lifetime counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BatchStats {
    /// Worker turns that found something to do.
    pub batches: u64,

    /// Transactions begun, including retries.
    pub attempts: u64,

    /// Updates whose transaction committed.
    pub committed: u64,

    /// Updates rejected by the transaction and answered early.
    pub rejected: u64,

    /// Updates answered with a permanent failure.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    attempts: AtomicU64,
    committed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BatchStats {
        BatchStats {
            batches: self.batches.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
