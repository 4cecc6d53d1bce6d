//! Retention hooks for the Stubborn Link's pending set and the Perfect
//! Link's delivered set.
//!
//! Both sets grow for the whole life of the process by default. That is what
//! gives the textbook guarantees, but it costs memory and, for the pending
//! set, one retransmission per entry per tick. A `Retention` decides which
//! entries survive a pruning pass.

use crate::{Message, ProcessId};

/// Decides whether an entry stays in a link's bookkeeping set.
pub trait Retention: Send + 'static {
    /// `peer` is the destination (pending set) or the sender (delivered set).
    /// `age` counts the pruning passes the entry has already survived.
    fn retain(&mut self, peer: &ProcessId, message: &Message, age: u32) -> bool;
}

/// Never forget anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl Retention for KeepAll {
    fn retain(&mut self, _peer: &ProcessId, _message: &Message, _age: u32) -> bool {
        true
    }
}

/// Forget entries once they have survived `max_age` passes.
#[derive(Debug, Clone, Copy)]
pub struct MaxAge(pub u32);

impl Retention for MaxAge {
    fn retain(&mut self, _peer: &ProcessId, _message: &Message, age: u32) -> bool {
        age < self.0
    }
}

impl<F> Retention for F
where
    F: FnMut(&ProcessId, &Message, u32) -> bool + Send + 'static,
{
    fn retain(&mut self, peer: &ProcessId, message: &Message, age: u32) -> bool {
        self(peer, message, age)
    }
}
