//! Messages handed from a worker to the callers waiting on it.

use crate::errors::{BatchError, PermanentFailure};

/// Message delivered over a caller's private handoff channel.
#[derive(Debug, Clone)]
pub enum Message<R> {
    /// The receiver is now the worker and must drive the queued batch.
    YourTurn,

    /// The receiver's update was applied with this result.
    Result(R),

    /// The batch holding the receiver's update failed for good.
    PermanentFailure(PermanentFailure),
}

/// Payload-free discriminant of a [`Message`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MessageKind {
    YourTurn,
    Result,
    PermanentFailure,
}

impl<R> Message<R> {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::YourTurn => MessageKind::YourTurn,
            Message::Result(_) => MessageKind::Result,
            Message::PermanentFailure(_) => MessageKind::PermanentFailure,
        }
    }

    /// Converts an outcome message into the caller-facing result.
    ///
    /// Returns `None` for [`Message::YourTurn`], which is not an outcome.
    pub fn into_outcome(self) -> Option<Result<R, BatchError>> {
        match self {
            Message::YourTurn => None,
            Message::Result(r) => Some(Ok(r)),
            Message::PermanentFailure(f) => Some(Err(BatchError::Permanent(f))),
        }
    }
}

impl<R> From<Result<R, PermanentFailure>> for Message<R> {
    fn from(res: Result<R, PermanentFailure>) -> Self {
        match res {
            Ok(r) => Message::Result(r),
            Err(f) => Message::PermanentFailure(f),
        }
    }
}
