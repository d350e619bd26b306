//! Single-slot blocking rendezvous.

use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::errors::HandoffError;

struct Slot<T> {
    msg: Option<T>,
    cancelled: bool,
}

/// Blocking channel holding at most one undelivered message.
///
/// Meant for exactly one sender and one receiver at a time.  Senders block
/// while the slot is full, receivers block while it is empty.  Waits can only
/// be broken by [`HandoffChannel::cancel`], which is sticky.
pub struct HandoffChannel<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T> HandoffChannel<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                msg: None,
                cancelled: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Waits for the slot to be free, then deposits `msg`.
    pub fn send(&self, msg: T) -> Result<(), HandoffError> {
        let mut slot = self.slot.lock();
        while slot.msg.is_some() && !slot.cancelled {
            self.changed.wait(&mut slot);
        }

        if slot.cancelled {
            return Err(HandoffError::Cancelled);
        }

        slot.msg = Some(msg);
        self.changed.notify_all();
        Ok(())
    }

    /// Waits for a message, then removes and returns it.
    ///
    /// A message that was deposited before cancellation is still delivered.
    pub fn receive(&self) -> Result<T, HandoffError> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(msg) = slot.msg.take() {
                self.changed.notify_all();
                return Ok(msg);
            }

            if slot.cancelled {
                return Err(HandoffError::Cancelled);
            }

            self.changed.wait(&mut slot);
        }
    }

    /// Returns true if no message is waiting in the slot.
    pub fn is_empty(&self) -> bool {
        self.slot.lock().msg.is_none()
    }

    /// Cancels the rendezvous, waking every blocked sender and receiver.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.cancelled = true;
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.lock().cancelled
    }
}

impl<T> Default for HandoffChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandoffChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("HandoffChannel")
            .field("full", &slot.msg.is_some())
            .field("cancelled", &slot.cancelled)
            .finish()
    }
}
