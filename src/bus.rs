//! Message bus boundary. The transport itself (websocket, unix socket,
//! in-process) is an external collaborator; this crate only depends on
//! the publish/subscribe contract, with an in-process `FakeBus` so the
//! crate is runnable standalone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: String,
    pub data: Value,
    pub context: Value,
}

impl Message {
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            context: Value::Object(Default::default()),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

pub type Handler = Box<dyn Fn(&Message) + Send + Sync>;

pub trait Bus: Send + Sync {
    fn emit(&self, message: Message);
    fn on(&self, msg_type: &str, handler: Handler);
}

/// An in-process bus: handlers registered for a `msg_type` run
/// synchronously on `emit`. Useful standalone and for tests; mirrors the
/// source's `FakeBus` default used when no real transport is wired.
#[derive(Default, Clone)]
pub struct FakeBus {
    handlers: Arc<Mutex<HashMap<String, Vec<Handler>>>>,
    log: Arc<Mutex<Vec<Message>>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages emitted so far, in order. Intended for test assertions.
    pub fn emitted(&self) -> Vec<Message> {
        self.log.lock().expect("fake bus log poisoned").clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().expect("fake bus log poisoned").clear();
    }
}

impl Bus for FakeBus {
    fn emit(&self, message: Message) {
        self.log.lock().expect("fake bus log poisoned").push(message.clone());
        if let Some(handlers) = self.handlers.lock().expect("fake bus handlers poisoned").get(&message.msg_type) {
            for handler in handlers {
                handler(&message);
            }
        }
    }

    fn on(&self, msg_type: &str, handler: Handler) {
        self.handlers
            .lock()
            .expect("fake bus handlers poisoned")
            .entry(msg_type.to_string())
            .or_default()
            .push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_without_handler_just_logs() {
        let bus = FakeBus::new();
        bus.emit(Message::new("recognizer_loop:record_begin", Value::Null));
        assert_eq!(bus.emitted().len(), 1);
    }

    #[test]
    fn handler_runs_synchronously_on_emit() {
        let bus = FakeBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.on(
            "mic.mute",
            Box::new(move |_msg| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.emit(Message::new("mic.mute", Value::Null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
