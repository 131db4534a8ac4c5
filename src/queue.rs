//! FIFO queue of parsed incoming stanzas.
//!
//! The connection driver pushes every parsed stanza here and drains one per
//! loop pass, so a burst of stanzas arriving in a single read still yields
//! between dispatches.

use std::collections::VecDeque;

use crate::stanza::Stanza;

#[derive(Debug, Default)]
pub struct StanzaQueue {
    items: VecDeque<Stanza>,
}

impl StanzaQueue {
    pub fn new() -> Self {
        StanzaQueue::default()
    }

    pub fn push_tail(&mut self, stanza: Stanza) {
        self.items.push_back(stanza);
    }

    pub fn pop_head(&mut self) -> Option<Stanza> {
        self.items.pop_front()
    }

    /// Inspects the nth queued stanza without removing it.
    pub fn peek_nth(&self, n: usize) -> Option<&Stanza> {
        self.items.get(n)
    }

    /// Removes and returns the nth queued stanza, shifting later entries up.
    pub fn remove_nth(&mut self, n: usize) -> Option<Stanza> {
        self.items.remove(n)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
