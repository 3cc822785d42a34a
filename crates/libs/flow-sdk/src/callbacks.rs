use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use crate::error::FlowError;
use crate::event::Notification;
use crate::queue::BoundedQueue;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler = Box<dyn FnMut(&str, &JsonValue) -> HandlerResult + Send>;

/// Per-session table of notification handlers, one per type tag.
///
/// The table lock is held across routing (check then enqueue) and dispatch
/// (lookup then invoke), so registration is totally ordered against both.
/// A handler must not register or unregister callbacks on its own session:
/// the lock is not reentrant.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: Mutex<HashMap<String, Handler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `event_type`, replacing any previous one.
    pub fn register<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: FnMut(&str, &JsonValue) -> HandlerResult + Send + 'static,
    {
        let event_type = event_type.into();
        let mut handlers = self.handlers.lock().expect("callback registry mutex poisoned");
        if handlers.insert(event_type.clone(), Box::new(handler)).is_some() {
            log::debug!("callbacks: replaced handler for '{event_type}'");
        }
    }

    pub fn unregister(&self, event_type: &str) -> Result<(), FlowError> {
        let mut handlers = self.handlers.lock().expect("callback registry mutex poisoned");
        handlers
            .remove(event_type)
            .map(|_| ())
            .ok_or_else(|| FlowError::callback_not_registered(event_type))
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.handlers.lock().expect("callback registry mutex poisoned").contains_key(event_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types = self
            .handlers
            .lock()
            .expect("callback registry mutex poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        types.sort();
        types
    }

    /// Enqueues every change in `changes` whose type currently has a handler.
    ///
    /// `changes` is either a single change object or an array of them. Changes
    /// without a handler are dropped. Returns the number enqueued.
    pub fn route(&self, changes: JsonValue, queue: &BoundedQueue<Notification>) -> usize {
        let changes = match changes {
            JsonValue::Array(changes) => changes,
            single => vec![single],
        };
        let handlers = self.handlers.lock().expect("callback registry mutex poisoned");
        let mut queued = 0;
        for change in &changes {
            let Some(notification) = Notification::from_change(change) else {
                continue;
            };
            if handlers.contains_key(notification.event_type.as_str()) {
                queue.push(notification);
                queued += 1;
            }
        }
        queued
    }

    /// Invokes the handler registered for `notification`.
    ///
    /// Handler errors and panics come back as [`FlowError::Handler`]; a type
    /// whose handler was removed after enqueue yields
    /// [`FlowError::CallbackNotRegistered`].
    pub fn dispatch(&self, notification: &Notification) -> Result<(), FlowError> {
        let mut handlers = self.handlers.lock().expect("callback registry mutex poisoned");
        let event_type = notification.event_type.as_str();
        let handler = handlers
            .get_mut(event_type)
            .ok_or_else(|| FlowError::callback_not_registered(event_type))?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler(event_type, &notification.data))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FlowError::Handler {
                event_type: event_type.to_owned(),
                message: err.to_string(),
            }),
            Err(payload) => Err(FlowError::Handler {
                event_type: event_type.to_owned(),
                message: format!("handler panicked: {}", panic_message(payload.as_ref())),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_owned()
}
