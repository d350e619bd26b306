//! Rendezvous channels used to hand work and outcomes between callers.

mod handoff;
mod restricted;

pub use handoff::HandoffChannel;
pub use restricted::{ChannelState, RestrictedHandoffChannel};
