use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::callbacks::{CallbackRegistry, HandlerResult};
use crate::error::FlowError;
use crate::event::Notification;
use crate::poller::{NotificationPoller, NotificationSource, PollerState};
use crate::queue::BoundedQueue;

/// Default time a drain call blocks on an empty queue.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Backend-assigned session identifier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Cancellation flag for a drain loop. Clones share the same flag, so one can
/// be handed to a handler or another thread to end the loop.
#[derive(Clone, Debug)]
pub struct StopFlag {
    keep_going: Arc<AtomicBool>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        Self { keep_going: Arc::new(AtomicBool::new(true)) }
    }

    pub fn stop(&self) {
        self.keep_going.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        !self.keep_going.load(Ordering::SeqCst)
    }
}

/// State shared between a session and its poller worker.
pub(crate) struct Inbox {
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) notifications: BoundedQueue<Notification>,
    pub(crate) errors: BoundedQueue<String>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: CallbackRegistry::new(),
            notifications: BoundedQueue::new("notification"),
            errors: BoundedQueue::new("error"),
        }
    }

    pub(crate) fn deliver(&self, changes: JsonValue) -> usize {
        self.callbacks.route(changes, &self.notifications)
    }
}

/// One conversation context with the backend: its handlers, its two bounded
/// queues and the poller feeding them.
pub struct Session {
    sid: SessionId,
    inbox: Arc<Inbox>,
    poller: NotificationPoller,
}

impl Session {
    pub fn new(sid: SessionId) -> Self {
        Self { sid, inbox: Arc::new(Inbox::new()), poller: NotificationPoller::new(sid) }
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub fn register_callback<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: FnMut(&str, &JsonValue) -> HandlerResult + Send + 'static,
    {
        self.inbox.callbacks.register(event_type, handler);
    }

    pub fn unregister_callback(&self, event_type: &str) -> Result<(), FlowError> {
        self.inbox.callbacks.unregister(event_type)
    }

    pub fn has_callback(&self, event_type: &str) -> bool {
        self.inbox.callbacks.is_registered(event_type)
    }

    /// Routes raw changes as the poller would: only registered types are queued.
    pub fn deliver(&self, changes: JsonValue) -> usize {
        self.inbox.deliver(changes)
    }

    /// Pops at most one notification and runs its handler.
    ///
    /// Returns `false` when nothing arrived within `timeout`. Handler failures
    /// and notifications whose handler has since been removed are logged and
    /// still count as consumed.
    pub fn process_one(&self, timeout: Duration) -> bool {
        let Some(notification) = self.inbox.notifications.pop(timeout) else {
            return false;
        };
        match self.inbox.callbacks.dispatch(&notification) {
            Ok(()) => {}
            Err(err @ FlowError::CallbackNotRegistered { .. }) => {
                log::debug!("session({}): {err}", self.sid);
            }
            Err(err) => {
                log::warn!("session({}): {err}", self.sid);
            }
        }
        true
    }

    /// Runs [`Session::process_one`] until `stop` is stopped.
    pub fn process_loop(&self, timeout: Duration, stop: &StopFlag) {
        while !stop.is_stopped() {
            self.process_one(timeout);
        }
    }

    pub fn get_queued_error(&self, timeout: Duration) -> Option<String> {
        self.inbox.errors.pop(timeout)
    }

    pub fn pending_notifications(&self) -> usize {
        self.inbox.notifications.len()
    }

    pub fn pending_errors(&self) -> usize {
        self.inbox.errors.len()
    }

    /// Starts the notification poller for this session.
    pub fn activate(&self, source: Arc<dyn NotificationSource>) -> Result<(), FlowError> {
        self.poller.start(source, Arc::clone(&self.inbox))
    }

    pub fn poller_state(&self) -> PollerState {
        self.poller.state()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    /// Stops and joins the poller, then discards anything still buffered.
    pub fn close(&self) {
        self.poller.stop();
        let notifications = self.inbox.notifications.clear();
        let errors = self.inbox.errors.clear();
        if notifications > 0 || errors > 0 {
            log::debug!(
                "session({}): closed, dropped {notifications} notification(s), {errors} error(s)",
                self.sid
            );
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("poller", &self.poller.state())
            .field("callbacks", &self.inbox.callbacks.registered_types())
            .finish()
    }
}
