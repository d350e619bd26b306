//! Strategy traits supplied by the owner of the shared resource.

use crate::errors::TxnError;

/// Result of applying one update.
pub trait UpdateResult {
    /// Returns true if the update was refused on its own merits.
    ///
    /// Rejected updates have not changed anything, so their caller is told
    /// right away instead of waiting for the batch to commit.
    fn is_rejected(&self) -> bool;
}

/// One attempt at applying a batch of updates to the shared resource.
///
/// A transaction is driven by exactly one worker thread: any number of
/// [`process_update`](UpdateTransaction::process_update) calls followed by
/// either [`commit`](UpdateTransaction::commit) or
/// [`rollback`](UpdateTransaction::rollback), both of which consume it.
pub trait UpdateTransaction<U> {
    type Output: UpdateResult;

    /// Applies one update within this transaction.
    ///
    /// May return [`TxnError::BatchTooLarge`] to stop accepting updates; the
    /// update is then deferred to a later transaction.  This must never
    /// happen for the first update handed to a fresh transaction, doing so
    /// poisons the processor.
    fn process_update(&mut self, update: &U) -> Result<Self::Output, TxnError>;

    /// Makes every accepted update durable.
    fn commit(self) -> Result<(), TxnError>;

    /// Discards the transaction.  Best effort, implementations log their own
    /// errors.
    fn rollback(self);
}

/// Creates transactions, once per attempt (so once per retry too).
pub trait TransactionFactory<U> {
    type Txn: UpdateTransaction<U>;

    fn begin_transaction(&self) -> Result<Self::Txn, TxnError>;
}

/// Shorthand for the result type produced by a factory's transactions.
pub type FactoryOutput<U, F> =
    <<F as TransactionFactory<U>>::Txn as UpdateTransaction<U>>::Output;
