//! Error types for the batch transaction coordinator.

use std::{error, fmt, sync::Arc};

use thiserror::Error;

use crate::{channel::ChannelState, message::MessageKind};

/// Terminal failure of a batch, shared by every caller whose update was part
/// of it.
///
/// Cloning is cheap and preserves identity, so the same failure can be handed
/// to many callers and later compared with [`PermanentFailure::same_failure`].
#[derive(Clone)]
pub struct PermanentFailure {
    cause: Arc<anyhow::Error>,
}

impl PermanentFailure {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: Arc::new(cause.into()),
        }
    }

    /// Convenience constructor from a plain message.
    pub fn msg(msg: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(anyhow::Error::msg(msg))
    }

    /// The underlying cause.
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Returns true if both values were cloned from the same failure.
    pub fn same_failure(&self, other: &PermanentFailure) -> bool {
        Arc::ptr_eq(&self.cause, &other.cause)
    }
}

impl fmt::Debug for PermanentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PermanentFailure")
            .field(&format_args!("{:#}", self.cause))
            .finish()
    }
}

impl fmt::Display for PermanentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permanent failure: {:#}", self.cause)
    }
}

impl error::Error for PermanentFailure {}

/// Errors reported by an [`UpdateTransaction`](crate::UpdateTransaction) or a
/// [`TransactionFactory`](crate::TransactionFactory).
#[derive(Debug, Error)]
pub enum TxnError {
    /// The transaction declines to take on this update.  The update stays
    /// queued and is retried in a later transaction.
    #[error("batch too large")]
    BatchTooLarge,

    /// Transient failure, the whole attempt should be retried.
    #[error("retryable: {0:#}")]
    Retryable(anyhow::Error),

    /// Given up, surfaced to the callers in the batch.
    #[error(transparent)]
    Permanent(#[from] PermanentFailure),

    /// Anything the strategy did not expect.  Poisons the processor.
    #[error("unexpected: {0:#}")]
    Fault(anyhow::Error),
}

impl TxnError {
    /// Create a retryable failure.
    pub fn retryable(e: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(e.into())
    }

    /// Create a permanent failure.
    pub fn permanent(e: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(PermanentFailure::new(e))
    }

    /// Create an unexpected failure.
    pub fn fault(e: impl Into<anyhow::Error>) -> Self {
        Self::Fault(e.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Misuse of a handoff channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandoffError {
    /// A message is already waiting in the slot.
    #[error("handoff slot already holds an undelivered message")]
    Occupied,

    /// The message kind may not follow the channel's current state.
    #[error("illegal handoff message {kind:?} in state {state:?}")]
    IllegalTransition {
        state: ChannelState,
        kind: MessageKind,
    },

    /// The rendezvous was cancelled while (or before) waiting.
    #[error("handoff cancelled")]
    Cancelled,
}

/// Contract violations and unexpected errors that poison a processor.
#[derive(Debug, Error)]
pub enum ProcessorFault {
    /// A fresh transaction refused its very first update.
    #[error("transaction reported batch too large for its first update")]
    FirstUpdateTooLarge,

    /// `commit` or `begin_transaction` returned a backpressure signal.
    #[error("unexpected batch too large outside of process_update")]
    UnexpectedBatchTooLarge,

    #[error("handoff protocol violated: {0}")]
    Handoff(#[from] HandoffError),

    #[error("transaction strategy failed: {0:#}")]
    Strategy(anyhow::Error),

    #[error("transaction strategy panicked: {0}")]
    Panicked(String),
}

/// Errors returned to callers of
/// [`BatchProcessor::process_update`](crate::BatchProcessor::process_update).
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// The batch containing this update failed for good.
    #[error(transparent)]
    Permanent(#[from] PermanentFailure),

    /// This call hit a fault and poisoned the processor.
    #[error("batch processor failed fatally: {0}")]
    Fatal(Arc<ProcessorFault>),

    /// The processor was poisoned earlier and must be discarded.
    #[error("batch processor is poisoned: {0}")]
    Poisoned(Arc<ProcessorFault>),

    /// The blocking task driving an async call exited without a response.
    #[error("blocking worker exited without response")]
    WorkerExited,
}

impl BatchError {
    /// The permanent failure carried by this error, if any.
    pub fn permanent_failure(&self) -> Option<&PermanentFailure> {
        match self {
            Self::Permanent(f) => Some(f),
            _ => None,
        }
    }

    /// Returns true if the processor can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}
