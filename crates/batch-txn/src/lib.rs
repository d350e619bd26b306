//! Request-batching transaction coordinator.
//!
//! Many threads want to apply small updates to one shared resource, each
//! blocking until its own update is durable.  Running one transaction per
//! update is wasteful, so [`BatchProcessor`] coalesces whatever is queued into
//! a single transaction driven by one of the waiting callers, then hands each
//! caller its individual outcome.
//!
//! ## Architecture
//!
//! The owner of the resource plugs in two strategy traits:
//!
//! - [`TransactionFactory`]: begins a transaction per attempt
//! - [`UpdateTransaction`]: applies updates, then commits or rolls back
//!
//! Transient failures are retried through a [`RetryHelper`], by default
//! [`BackoffRetryHelper`].  Callers talk to the processor only through
//! [`BatchProcessor::process_update`] (or its async flavour); coordination
//! between callers happens over single-slot [`RestrictedHandoffChannel`]s.

mod channel;
mod errors;
mod message;
mod processor;
mod retry;
mod transaction;

pub use channel::{ChannelState, HandoffChannel, RestrictedHandoffChannel};
pub use errors::{BatchError, HandoffError, PermanentFailure, ProcessorFault, TxnError};
pub use message::{Message, MessageKind};
pub use processor::{BatchProcessor, BatchStats};
pub use retry::{BackoffRetryHelper, RetryConfig, RetryHelper};
pub use transaction::{FactoryOutput, TransactionFactory, UpdateResult, UpdateTransaction};

#[cfg(test)]
use proptest as _;
