//! In-memory account ledger acting as the shared resource.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use rand::Rng;
use strata_batch_txn::{TransactionFactory, TxnError, UpdateResult, UpdateTransaction};
use thiserror::Error;
use tracing::*;

use crate::config::LoadConfig;

#[derive(Debug, Error)]
pub(crate) enum LedgerError {
    #[error("write conflict on commit")]
    Conflict,

    #[error("ledger moved from version {expected} to {found} under an open transaction")]
    Stale { expected: u64, found: u64 },
}

/// Balance change for one account.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Adjust {
    pub account: u32,
    pub delta: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdjustOutcome {
    /// The change was applied, leaving this balance.
    Applied { balance: i64 },

    /// The change would overdraw the account.
    Overdrawn { balance: i64 },
}

impl UpdateResult for AdjustOutcome {
    fn is_rejected(&self) -> bool {
        matches!(self, AdjustOutcome::Overdrawn { .. })
    }
}

/// Committed ledger state.
#[derive(Debug, Default)]
pub(crate) struct LedgerState {
    balances: Mutex<Committed>,
    conflicts: AtomicU64,
}

#[derive(Debug, Default)]
struct Committed {
    version: u64,
    balances: HashMap<u32, i64>,
}

impl LedgerState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sum of all balances.
    pub(crate) fn total(&self) -> i64 {
        self.balances.lock().balances.values().sum()
    }

    pub(crate) fn version(&self) -> u64 {
        self.balances.lock().version
    }

    /// Simulated conflicts hit so far.
    pub(crate) fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    fn balance(&self, account: u32) -> i64 {
        self.balances
            .lock()
            .balances
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    fn apply(&self, base_version: u64, staged: HashMap<u32, i64>) -> Result<u64, LedgerError> {
        let mut committed = self.balances.lock();
        if committed.version != base_version {
            return Err(LedgerError::Stale {
                expected: base_version,
                found: committed.version,
            });
        }

        committed.balances.extend(staged);
        committed.version += 1;
        Ok(committed.version)
    }
}

/// Opens ledger transactions for the batch processor.
#[derive(Debug)]
pub(crate) struct LedgerFactory {
    state: Arc<LedgerState>,
    max_batch: usize,
    conflict_rate: f64,
}

impl LedgerFactory {
    pub(crate) fn new(state: Arc<LedgerState>, load: &LoadConfig) -> Self {
        Self {
            state,
            max_batch: load.max_batch,
            conflict_rate: load.conflict_rate,
        }
    }
}

impl TransactionFactory<Adjust> for LedgerFactory {
    type Txn = LedgerTxn;

    fn begin_transaction(&self) -> Result<LedgerTxn, TxnError> {
        Ok(LedgerTxn {
            state: self.state.clone(),
            base_version: self.state.version(),
            staged: HashMap::new(),
            taken: 0,
            max_batch: self.max_batch,
            conflict_rate: self.conflict_rate,
        })
    }
}

/// Ledger changes staged on top of one committed version.
#[derive(Debug)]
pub(crate) struct LedgerTxn {
    state: Arc<LedgerState>,
    base_version: u64,
    staged: HashMap<u32, i64>,
    taken: usize,
    max_batch: usize,
    conflict_rate: f64,
}

impl UpdateTransaction<Adjust> for LedgerTxn {
    type Output = AdjustOutcome;

    fn process_update(&mut self, update: &Adjust) -> Result<AdjustOutcome, TxnError> {
        if self.taken >= self.max_batch {
            return Err(TxnError::BatchTooLarge);
        }
        self.taken += 1;

        let balance = match self.staged.get(&update.account) {
            Some(staged) => *staged,
            None => self.state.balance(update.account),
        };

        let next = balance + update.delta;
        if next < 0 {
            return Ok(AdjustOutcome::Overdrawn { balance });
        }

        self.staged.insert(update.account, next);
        Ok(AdjustOutcome::Applied { balance: next })
    }

    fn commit(self) -> Result<(), TxnError> {
        if self.conflict_rate > 0.0 && rand::thread_rng().gen_bool(self.conflict_rate) {
            self.state.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(TxnError::retryable(LedgerError::Conflict));
        }

        let accounts = self.staged.len();
        let version = self
            .state
            .apply(self.base_version, self.staged)
            .map_err(TxnError::fault)?;
        trace!(%version, %accounts, updates = %self.taken, "ledger committed");
        Ok(())
    }

    fn rollback(self) {
        trace!(base_version = %self.base_version, staged = %self.staged.len(), "ledger rolled back");
    }
}
