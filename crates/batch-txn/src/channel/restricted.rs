//! Handoff channel that only accepts legal message sequences.

use std::fmt;

use parking_lot::Mutex;

use super::HandoffChannel;
use crate::{
    errors::HandoffError,
    message::{Message, MessageKind},
};

/// Protocol state of a [`RestrictedHandoffChannel`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChannelState {
    /// Nothing sent yet.
    Initial,

    /// The owner has been made worker, its outcome is still to come.
    YourTurnReceived,

    /// The outcome was sent.  Terminal.
    Closed,
}

impl ChannelState {
    /// Returns the state after sending a message of kind `kind`, or `None` if
    /// that message may not be sent now.
    pub fn next(self, kind: MessageKind) -> Option<ChannelState> {
        use ChannelState::*;
        use MessageKind as K;

        match (self, kind) {
            (Initial, K::Result) => Some(Closed),
            (Initial, K::YourTurn) => Some(YourTurnReceived),
            (Initial, K::PermanentFailure) => Some(Closed),
            (YourTurnReceived, K::Result) => Some(Closed),
            (YourTurnReceived, K::PermanentFailure) => Some(Closed),
            _ => None,
        }
    }
}

/// Wraps a [`HandoffChannel`] carrying [`Message`]s, rejecting sends that
/// break the `YourTurn` / outcome protocol.
///
/// Every caller gets at most one `YourTurn` followed by exactly one outcome,
/// or just the outcome.  Only one message may be in flight at a time.
pub struct RestrictedHandoffChannel<R> {
    inner: HandoffChannel<Message<R>>,
    state: Mutex<ChannelState>,
}

impl<R> RestrictedHandoffChannel<R> {
    pub fn new() -> Self {
        Self {
            inner: HandoffChannel::new(),
            state: Mutex::new(ChannelState::Initial),
        }
    }

    /// Validates and sends a message.  Never blocks: the slot must be empty.
    pub fn send(&self, msg: Message<R>) -> Result<(), HandoffError> {
        let mut state = self.state.lock();

        if !self.inner.is_empty() {
            return Err(HandoffError::Occupied);
        }

        let kind = msg.kind();
        let next = state.next(kind).ok_or(HandoffError::IllegalTransition {
            state: *state,
            kind,
        })?;

        self.inner.send(msg)?;
        *state = next;
        Ok(())
    }

    pub fn receive(&self) -> Result<Message<R>, HandoffError> {
        self.inner.receive()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }
}

impl<R> Default for RestrictedHandoffChannel<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for RestrictedHandoffChannel<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestrictedHandoffChannel")
            .field("state", &self.state())
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PermanentFailure;

    #[test]
    fn test_transition_table() {
        use ChannelState::*;
        use MessageKind as K;

        assert_eq!(Initial.next(K::Result), Some(Closed));
        assert_eq!(Initial.next(K::YourTurn), Some(YourTurnReceived));
        assert_eq!(Initial.next(K::PermanentFailure), Some(Closed));
        assert_eq!(YourTurnReceived.next(K::Result), Some(Closed));
        assert_eq!(YourTurnReceived.next(K::PermanentFailure), Some(Closed));

        assert_eq!(YourTurnReceived.next(K::YourTurn), None);
        assert_eq!(Closed.next(K::YourTurn), None);
        assert_eq!(Closed.next(K::Result), None);
        assert_eq!(Closed.next(K::PermanentFailure), None);
    }

    #[test]
    fn test_worker_sequence() {
        let ch = RestrictedHandoffChannel::new();

        ch.send(Message::YourTurn).unwrap();
        assert_eq!(ch.state(), ChannelState::YourTurnReceived);
        assert_eq!(ch.receive().unwrap().kind(), MessageKind::YourTurn);

        ch.send(Message::Result(4u32)).unwrap();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert_eq!(ch.receive().unwrap().kind(), MessageKind::Result);
    }

    #[test]
    fn test_piggyback_failure() {
        let ch = RestrictedHandoffChannel::<u32>::new();
        ch.send(Message::PermanentFailure(PermanentFailure::msg("x")))
            .unwrap();
        assert_eq!(ch.state(), ChannelState::Closed);
    }

    #[test]
    fn test_rejects_second_outcome() {
        let ch = RestrictedHandoffChannel::new();
        ch.send(Message::Result(1u32)).unwrap();
        ch.receive().unwrap();

        assert_eq!(
            ch.send(Message::Result(2)),
            Err(HandoffError::IllegalTransition {
                state: ChannelState::Closed,
                kind: MessageKind::Result,
            })
        );
    }

    #[test]
    fn test_rejects_double_your_turn() {
        let ch = RestrictedHandoffChannel::<u32>::new();
        ch.send(Message::YourTurn).unwrap();
        ch.receive().unwrap();

        assert_eq!(
            ch.send(Message::YourTurn),
            Err(HandoffError::IllegalTransition {
                state: ChannelState::YourTurnReceived,
                kind: MessageKind::YourTurn,
            })
        );
    }

    #[test]
    fn test_rejects_send_while_occupied() {
        let ch = RestrictedHandoffChannel::new();
        ch.send(Message::YourTurn).unwrap();

        assert_eq!(ch.send(Message::Result(1u32)), Err(HandoffError::Occupied));
        // The failed send must not have advanced the state.
        assert_eq!(ch.state(), ChannelState::YourTurnReceived);
    }

    #[test]
    fn test_cancelled_send_keeps_state() {
        let ch = RestrictedHandoffChannel::<u32>::new();
        ch.cancel();

        assert_eq!(ch.send(Message::YourTurn), Err(HandoffError::Cancelled));
        assert_eq!(ch.state(), ChannelState::Initial);
        assert_eq!(ch.receive().unwrap_err(), HandoffError::Cancelled);
    }
}
