//! Routing of inbound messages to receivers.
//!
//! Receivers register under a receiver name, optionally scoped to one
//! destination id. Lookup prefers the destination-scoped registration and
//! falls back to the receiver-wide one.

use super::protocol::Envelope;
use crate::types::ProcessId;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A handler for messages arriving from workers.
pub trait MessageReceiver {
    fn did_receive_message(&mut self, from: ProcessId, message: &Envelope);

    /// Answer a sync or async request. The default replies with `null`.
    fn did_receive_sync_message(&mut self, from: ProcessId, message: &Envelope) -> Value {
        self.did_receive_message(from, message);
        Value::Null
    }
}

/// Shared handle to an external receiver.
pub type SharedReceiver = Rc<RefCell<dyn MessageReceiver>>;

/// Map from (receiver name, optional destination) to a route.
#[derive(Debug)]
pub struct MessageReceiverMap<R> {
    global: HashMap<String, R>,
    scoped: HashMap<(String, u64), R>,
}

impl<R: Clone> MessageReceiverMap<R> {
    pub fn new() -> Self {
        Self {
            global: HashMap::new(),
            scoped: HashMap::new(),
        }
    }

    /// Register a receiver-wide route. Returns the route it replaced.
    pub fn add_receiver(&mut self, name: impl Into<String>, route: R) -> Option<R> {
        self.global.insert(name.into(), route)
    }

    /// Register a destination-scoped route. Returns the route it replaced.
    pub fn add_scoped_receiver(
        &mut self,
        name: impl Into<String>,
        destination: u64,
        route: R,
    ) -> Option<R> {
        self.scoped.insert((name.into(), destination), route)
    }

    pub fn remove_receiver(&mut self, name: &str) -> Option<R> {
        self.global.remove(name)
    }

    pub fn remove_scoped_receiver(&mut self, name: &str, destination: u64) -> Option<R> {
        self.scoped.remove(&(name.to_string(), destination))
    }

    /// Most specific route for `message`, if any.
    pub fn lookup(&self, message: &Envelope) -> Option<R> {
        if let Some(destination) = message.destination
            && let Some(route) = self.scoped.get(&(message.receiver.clone(), destination))
        {
            return Some(route.clone());
        }
        self.global.get(&message.receiver).cloned()
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.scoped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Clone> Default for MessageReceiverMap<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(receiver: &str, destination: Option<u64>) -> Envelope {
        let mut envelope = Envelope::new(receiver, "Anything");
        envelope.destination = destination;
        envelope
    }

    #[test]
    fn test_scoped_before_global() {
        let mut map = MessageReceiverMap::new();
        map.add_receiver("Page", "global");
        map.add_scoped_receiver("Page", 7, "page-7");

        assert_eq!(map.lookup(&message("Page", Some(7))), Some("page-7"));
        assert_eq!(map.lookup(&message("Page", Some(8))), Some("global"));
        assert_eq!(map.lookup(&message("Page", None)), Some("global"));
        assert_eq!(map.lookup(&message("Other", None)), None);
    }

    #[test]
    fn test_remove_routes() {
        let mut map = MessageReceiverMap::new();
        map.add_scoped_receiver("Page", 1, 1u32);
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove_scoped_receiver("Page", 1), Some(1));
        assert!(map.is_empty());
        assert_eq!(map.lookup(&message("Page", Some(1))), None);
    }

    struct Recorder(Vec<String>);

    impl MessageReceiver for Recorder {
        fn did_receive_message(&mut self, _from: ProcessId, message: &Envelope) {
            self.0.push(message.name.clone());
        }
    }

    #[test]
    fn test_default_sync_reply_is_null() {
        let mut recorder = Recorder(Vec::new());
        let reply = recorder.did_receive_sync_message(ProcessId(1), &message("X", None));
        assert!(reply.is_null());
        assert_eq!(recorder.0, vec!["Anything"]);
    }
}
