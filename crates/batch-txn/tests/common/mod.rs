//! Scripted transaction strategy shared by the integration tests.

#![allow(unreachable_pub, reason = "test utilities")]
#![allow(dead_code, reason = "utilities used by different test files")]

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use strata_batch_txn::{
    BackoffRetryHelper, BatchError, BatchProcessor, RetryConfig, TransactionFactory, TxnError,
    UpdateResult, UpdateTransaction,
};

pub type TestProcessor = BatchProcessor<u32, StubFactory>;

/// Result handed back for every update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub update: u32,
    pub rejected: bool,

    /// Makes `is_rejected` panic.
    pub explodes: bool,
}

impl Applied {
    pub fn accepted(update: u32) -> Self {
        Self {
            update,
            rejected: false,
            explodes: false,
        }
    }

    pub fn rejected(update: u32) -> Self {
        Self {
            update,
            rejected: true,
            explodes: false,
        }
    }
}

impl UpdateResult for Applied {
    fn is_rejected(&self) -> bool {
        assert!(!self.explodes, "result of {} cannot be inspected", self.update);
        self.rejected
    }
}

/// How the stub transactions behave.
#[derive(Debug, Default)]
pub struct Script {
    /// Updates a transaction takes before answering `BatchTooLarge`.
    pub cap: Option<usize>,

    /// Updates refused on their own merits.
    pub reject: HashSet<u32>,

    /// Updates that make `process_update` return a fault.
    pub fault_on: HashSet<u32>,

    /// Updates that make `process_update` panic.
    pub panic_on: HashSet<u32>,

    /// Updates whose result panics when checked for rejection.
    pub check_panics_on: HashSet<u32>,

    /// Errors returned by successive `begin_transaction` calls.
    pub begin_failures: VecDeque<TxnError>,

    /// Errors returned by successive `commit` calls.
    pub commit_failures: VecDeque<TxnError>,

    /// Time spent inside each commit.
    pub commit_delay: Duration,
}

/// What the stub observed.
#[derive(Debug, Default)]
pub struct Ledger {
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub process_calls: AtomicUsize,

    /// Accepted updates of every committed transaction, in commit order.
    pub committed: Mutex<Vec<Vec<u32>>>,

    /// Set if two transactions were ever open at once.
    pub overlapped: AtomicBool,

    active: AtomicBool,
}

impl Ledger {
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<u32>> {
        self.committed.lock().clone()
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn open(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Holds `begin_transaction` until opened, so callers can pile up behind
/// the worker.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
    arrived: AtomicUsize,
}

impl Gate {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn opened() -> Self {
        Self {
            open: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    /// Number of `begin_transaction` calls that reached the gate.
    pub fn arrived(&self) -> usize {
        self.arrived.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        self.arrived.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }
}

#[derive(Debug, Default)]
pub struct Shared {
    pub script: Mutex<Script>,
    pub ledger: Ledger,
    pub gate: Gate,
}

#[derive(Debug, Clone)]
pub struct StubFactory(pub Arc<Shared>);

impl TransactionFactory<u32> for StubFactory {
    type Txn = StubTxn;

    fn begin_transaction(&self) -> Result<StubTxn, TxnError> {
        self.0.gate.pass();
        self.0.ledger.begins.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = self.0.script.lock().begin_failures.pop_front() {
            return Err(e);
        }

        self.0.ledger.open();
        Ok(StubTxn {
            shared: self.0.clone(),
            seen: 0,
            applied: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct StubTxn {
    shared: Arc<Shared>,
    seen: usize,
    applied: Vec<u32>,
}

impl UpdateTransaction<u32> for StubTxn {
    type Output = Applied;

    fn process_update(&mut self, update: &u32) -> Result<Applied, TxnError> {
        self.shared.ledger.process_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.shared.script.lock();

        if script.panic_on.contains(update) {
            drop(script);
            panic!("update {update} blew up");
        }

        if script.fault_on.contains(update) {
            return Err(TxnError::fault(anyhow::anyhow!("update {update} hit a bug")));
        }

        if script.cap.is_some_and(|cap| self.seen >= cap) {
            return Err(TxnError::BatchTooLarge);
        }

        self.seen += 1;
        if script.check_panics_on.contains(update) {
            return Ok(Applied {
                explodes: true,
                ..Applied::accepted(*update)
            });
        }

        if script.reject.contains(update) {
            return Ok(Applied::rejected(*update));
        }

        self.applied.push(*update);
        Ok(Applied::accepted(*update))
    }

    fn commit(self) -> Result<(), TxnError> {
        let (failure, delay) = {
            let mut script = self.shared.script.lock();
            (script.commit_failures.pop_front(), script.commit_delay)
        };

        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let ledger = &self.shared.ledger;
        ledger.close();
        if let Some(e) = failure {
            return Err(e);
        }

        ledger.commits.fetch_add(1, Ordering::SeqCst);
        ledger.committed.lock().push(self.applied);
        Ok(())
    }

    fn rollback(self) {
        self.shared.ledger.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.shared.ledger.close();
    }
}

/// Builds a processor retrying immediately, up to three times.
pub fn processor(script: Script, gate: Gate) -> (Arc<TestProcessor>, Arc<Shared>) {
    let shared = Arc::new(Shared {
        script: Mutex::new(script),
        ledger: Ledger::default(),
        gate,
    });

    let retry = BackoffRetryHelper::new(RetryConfig::no_delay(3));
    let proc = Arc::new(BatchProcessor::new(StubFactory(shared.clone()), retry));
    (proc, shared)
}

pub fn spawn_caller(
    proc: &Arc<TestProcessor>,
    update: u32,
) -> JoinHandle<Result<Applied, BatchError>> {
    let proc = proc.clone();
    thread::spawn(move || proc.process_update(update))
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Starts one caller that becomes the worker and parks at the gate, then
/// queues `rest` behind it.
pub fn pile_up(
    proc: &Arc<TestProcessor>,
    shared: &Shared,
    first: u32,
    rest: &[u32],
) -> Vec<JoinHandle<Result<Applied, BatchError>>> {
    let mut handles = vec![spawn_caller(proc, first)];
    wait_for("worker to reach the gate", || shared.gate.arrived() == 1);

    for &update in rest {
        handles.push(spawn_caller(proc, update));
    }

    let expected = rest.len() + 1;
    wait_for("callers to queue", || proc.pending() == expected);
    handles
}

pub fn join_all(
    handles: Vec<JoinHandle<Result<Applied, BatchError>>>,
) -> Vec<Result<Applied, BatchError>> {
    handles
        .into_iter()
        .map(|h| h.join().expect("caller thread panicked"))
        .collect()
}
