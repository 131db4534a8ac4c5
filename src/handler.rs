//! Stanza handler registration and dispatch.
//!
//! Two kinds of handlers exist. Type handlers are persistent: they are
//! registered for a [`StanzaKind`] at a priority and run in descending
//! priority order (insertion order breaks ties) until one consumes the
//! stanza. Reply handlers are keyed by stanza id and fire at most once: the
//! first stanza carrying that id removes the handler before invoking it,
//! whatever the handler returns.

use std::collections::HashMap;
use std::sync::Arc;

use crate::stanza::{Stanza, StanzaKind};

/// What a handler wants done with the stanza after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerControl {
    /// Let lower-priority handlers see the stanza too.
    Continue,
    /// Stop dispatching this stanza.
    Consume,
}

/// Priority band for type handlers, checked from `First` down to `Last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerPriority {
    Last,
    Normal,
    First,
}

/// A callback invoked for incoming stanzas.
pub trait StanzaHandler: Send + Sync {
    fn handle(&self, stanza: &Stanza) -> HandlerControl;
}

impl<F> StanzaHandler for F
where
    F: Fn(&Stanza) -> HandlerControl + Send + Sync,
{
    fn handle(&self, stanza: &Stanza) -> HandlerControl {
        self(stanza)
    }
}

struct ChainEntry {
    priority: HandlerPriority,
    handler: Arc<dyn StanzaHandler>,
}

/// The routing plan for one stanza: the one-shot reply handler (already
/// removed from the registry) plus a snapshot of the matching type chain.
pub struct Dispatch {
    reply: Option<Arc<dyn StanzaHandler>>,
    chain: Vec<Arc<dyn StanzaHandler>>,
}

impl Dispatch {
    /// Runs the plan. The reply handler goes first; if it consumes the
    /// stanza the type chain never sees it.
    pub fn run(self, stanza: &Stanza) {
        if let Some(reply) = self.reply {
            if reply.handle(stanza) == HandlerControl::Consume {
                return;
            }
        }
        for handler in self.chain {
            if handler.handle(stanza) == HandlerControl::Consume {
                return;
            }
        }
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    chains: HashMap<StanzaKind, Vec<ChainEntry>>,
    reply_handlers: HashMap<String, Arc<dyn StanzaHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers a persistent handler for all stanzas of the given kind.
    /// Within a priority band, earlier registrations run first.
    pub fn register(
        &mut self,
        kind: StanzaKind,
        priority: HandlerPriority,
        handler: Arc<dyn StanzaHandler>,
    ) {
        let chain = self.chains.entry(kind).or_default();
        let pos = chain
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(chain.len());
        chain.insert(pos, ChainEntry { priority, handler });
    }

    /// Removes the first registered type handler matching by identity; a
    /// handler registered more than once needs one unregister per entry.
    pub fn unregister(&mut self, kind: StanzaKind, handler: &Arc<dyn StanzaHandler>) {
        if let Some(chain) = self.chains.get_mut(&kind) {
            if let Some(pos) = chain.iter().position(|e| Arc::ptr_eq(&e.handler, handler)) {
                chain.remove(pos);
            }
        }
    }

    /// Registers a one-shot handler for the stanza carrying this id.
    pub fn register_reply(&mut self, id: impl Into<String>, handler: Arc<dyn StanzaHandler>) {
        self.reply_handlers.insert(id.into(), handler);
    }

    /// Drops a pending reply handler, e.g. when the send that created it
    /// failed.
    pub fn cancel_reply(&mut self, id: &str) {
        self.reply_handlers.remove(id);
    }

    /// Builds the routing plan for a stanza. The matching reply handler, if
    /// any, is removed here so it cannot fire twice.
    pub fn route(&mut self, stanza: &Stanza) -> Dispatch {
        let reply = stanza.id().and_then(|id| self.reply_handlers.remove(id));
        let chain = self
            .chains
            .get(&stanza.kind())
            .map(|c| c.iter().map(|e| Arc::clone(&e.handler)).collect())
            .unwrap_or_default();
        Dispatch { reply, chain }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
        control: HandlerControl,
    ) -> Arc<dyn StanzaHandler> {
        let log = Arc::clone(log);
        Arc::new(move |_: &Stanza| {
            log.lock().unwrap().push(tag);
            control
        })
    }

    fn message() -> Stanza {
        Stanza::new("message").with_attribute("id", "m1")
    }

    #[test]
    fn test_priority_order_is_descending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        reg.register(
            StanzaKind::Message,
            HandlerPriority::Last,
            recorder(&log, "last", HandlerControl::Continue),
        );
        reg.register(
            StanzaKind::Message,
            HandlerPriority::First,
            recorder(&log, "first", HandlerControl::Continue),
        );
        reg.register(
            StanzaKind::Message,
            HandlerPriority::Normal,
            recorder(&log, "normal", HandlerControl::Continue),
        );

        let msg = message();
        reg.route(&msg).run(&msg);
        assert_eq!(*log.lock().unwrap(), vec!["first", "normal", "last"]);
    }

    #[test]
    fn test_equal_priority_ties_keep_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        for tag in ["a", "b", "c"] {
            reg.register(
                StanzaKind::Message,
                HandlerPriority::Normal,
                recorder(&log, tag, HandlerControl::Continue),
            );
        }

        let msg = message();
        reg.route(&msg).run(&msg);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_consume_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        reg.register(
            StanzaKind::Message,
            HandlerPriority::First,
            recorder(&log, "eater", HandlerControl::Consume),
        );
        reg.register(
            StanzaKind::Message,
            HandlerPriority::Normal,
            recorder(&log, "starved", HandlerControl::Continue),
        );

        let msg = message();
        reg.route(&msg).run(&msg);
        assert_eq!(*log.lock().unwrap(), vec!["eater"]);
    }

    #[test]
    fn test_reply_handler_fires_once_then_falls_to_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        reg.register(
            StanzaKind::Iq,
            HandlerPriority::Normal,
            recorder(&log, "chain", HandlerControl::Continue),
        );
        reg.register_reply("q1", recorder(&log, "reply", HandlerControl::Consume));

        let iq = Stanza::new_iq("result").with_attribute("id", "q1");
        reg.route(&iq).run(&iq);
        // Same id again: the one-shot handler is gone, only the chain runs.
        reg.route(&iq).run(&iq);
        assert_eq!(*log.lock().unwrap(), vec!["reply", "chain"]);
    }

    #[test]
    fn test_reply_handler_continue_reaches_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        reg.register(
            StanzaKind::Iq,
            HandlerPriority::Normal,
            recorder(&log, "chain", HandlerControl::Continue),
        );
        reg.register_reply("q2", recorder(&log, "reply", HandlerControl::Continue));

        let iq = Stanza::new_iq("result").with_attribute("id", "q2");
        reg.route(&iq).run(&iq);
        assert_eq!(*log.lock().unwrap(), vec!["reply", "chain"]);
    }

    #[test]
    fn test_unregister_by_identity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        let keep = recorder(&log, "keep", HandlerControl::Continue);
        let drop_me = recorder(&log, "drop", HandlerControl::Continue);
        reg.register(StanzaKind::Message, HandlerPriority::Normal, Arc::clone(&keep));
        reg.register(StanzaKind::Message, HandlerPriority::Normal, Arc::clone(&drop_me));
        reg.unregister(StanzaKind::Message, &drop_me);

        let msg = message();
        reg.route(&msg).run(&msg);
        assert_eq!(*log.lock().unwrap(), vec!["keep"]);
    }

    #[test]
    fn test_unregister_removes_one_entry_per_call() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        let twice = recorder(&log, "twice", HandlerControl::Continue);
        reg.register(StanzaKind::Message, HandlerPriority::Normal, Arc::clone(&twice));
        reg.register(StanzaKind::Message, HandlerPriority::Normal, Arc::clone(&twice));
        reg.unregister(StanzaKind::Message, &twice);

        // One registration survives the single unregister.
        let msg = message();
        reg.route(&msg).run(&msg);
        assert_eq!(*log.lock().unwrap(), vec!["twice"]);

        reg.unregister(StanzaKind::Message, &twice);
        reg.route(&msg).run(&msg);
        assert_eq!(*log.lock().unwrap(), vec!["twice"]);
    }

    #[test]
    fn test_cancel_reply() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        reg.register_reply("q3", recorder(&log, "reply", HandlerControl::Consume));
        reg.cancel_reply("q3");

        let iq = Stanza::new_iq("result").with_attribute("id", "q3");
        reg.route(&iq).run(&iq);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_kinds_do_not_cross() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        reg.register(
            StanzaKind::Presence,
            HandlerPriority::Normal,
            recorder(&log, "presence", HandlerControl::Continue),
        );

        let msg = Stanza::new("message");
        reg.route(&msg).run(&msg);
        assert!(log.lock().unwrap().is_empty());
    }
}
