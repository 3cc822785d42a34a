use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::FlowError;
use crate::session::{Inbox, SessionId};

/// What a poller needs from the backend: the blocking wait call and a way to
/// tell a dead backend from a transient failure.
pub trait NotificationSource: Send + Sync {
    /// Blocks until the backend has at least one change for `sid`. Never
    /// subject to a client-side timeout.
    fn wait_for_notification(&self, sid: SessionId) -> Result<JsonValue, FlowError>;

    /// Returns `true` once the backend process is gone for good.
    fn backend_exited(&self) -> bool;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Dedicated worker thread that keeps a session's wait call outstanding.
///
/// `stop` is cooperative: the flag is checked once per loop iteration, so it
/// may have to wait out one in-flight wait call.
pub struct NotificationPoller {
    sid: SessionId,
    listen: Arc<AtomicBool>,
    state: Arc<Mutex<PollerState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationPoller {
    pub fn new(sid: SessionId) -> Self {
        Self {
            sid,
            listen: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(PollerState::Idle)),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock().expect("poller state mutex poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == PollerState::Running
    }

    /// Launches the worker. A running poller is left alone; a stopped one
    /// cannot be restarted.
    pub(crate) fn start(
        &self,
        source: Arc<dyn NotificationSource>,
        inbox: Arc<Inbox>,
    ) -> Result<(), FlowError> {
        let mut state = self.state.lock().expect("poller state mutex poisoned");
        match *state {
            PollerState::Idle => {}
            PollerState::Running => {
                log::debug!("poller({}): already running", self.sid);
                return Ok(());
            }
            PollerState::Stopping | PollerState::Stopped => {
                return Err(FlowError::invalid_state(format!(
                    "poller for session {} has been stopped",
                    self.sid
                )));
            }
        }

        self.listen.store(true, Ordering::SeqCst);
        let worker = PollWorker {
            sid: self.sid,
            listen: Arc::clone(&self.listen),
            state: Arc::clone(&self.state),
            source,
            inbox,
        };
        let handle = thread::Builder::new()
            .name(format!("flow-poller-{}", self.sid))
            .spawn(move || worker.run())
            .map_err(|err| {
                self.listen.store(false, Ordering::SeqCst);
                FlowError::process(format!("failed to spawn notification poller: {err}"))
            })?;
        *state = PollerState::Running;
        drop(state);

        *self.worker.lock().expect("poller worker mutex poisoned") = Some(handle);
        log::debug!("poller({}): started", self.sid);
        Ok(())
    }

    /// Clears the listen flag and joins the worker. Safe to call repeatedly.
    pub fn stop(&self) {
        self.listen.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().expect("poller worker mutex poisoned").take();
        if let Some(handle) = handle {
            self.set_state(PollerState::Stopping);
            if handle.join().is_err() {
                log::warn!("poller({}): worker thread panicked", self.sid);
            }
        }
        self.set_state(PollerState::Stopped);
    }

    fn set_state(&self, next: PollerState) {
        *self.state.lock().expect("poller state mutex poisoned") = next;
    }
}

impl Drop for NotificationPoller {
    fn drop(&mut self) {
        // Joining here could block on an outstanding wait call; the worker
        // exits on its own once that call returns.
        self.listen.store(false, Ordering::SeqCst);
    }
}

struct PollWorker {
    sid: SessionId,
    listen: Arc<AtomicBool>,
    state: Arc<Mutex<PollerState>>,
    source: Arc<dyn NotificationSource>,
    inbox: Arc<Inbox>,
}

impl PollWorker {
    fn run(self) {
        while self.listen.load(Ordering::SeqCst) {
            match self.source.wait_for_notification(self.sid) {
                Ok(changes) => {
                    let queued = self.inbox.deliver(changes);
                    if queued > 0 {
                        log::debug!("poller({}): queued {queued} notification(s)", self.sid);
                    }
                }
                Err(err) => {
                    if self.source.backend_exited() {
                        log::info!("poller({}): backend exited, stopping: {err}", self.sid);
                        break;
                    }
                    // No backoff: the wait call is long-polling, a fast failure
                    // is usually a reset connection.
                    log::debug!("poller({}): wait for notification failed: {err}", self.sid);
                    self.inbox.errors.push(err.to_string());
                }
            }
        }
        let mut state = self.state.lock().expect("poller state mutex poisoned");
        if *state == PollerState::Running {
            *state = PollerState::Stopped;
        }
        log::debug!("poller({}): exited", self.sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Replays scripted results, then blocks on `gate` until released.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<JsonValue, FlowError>>>,
        gate: Mutex<mpsc::Receiver<Result<JsonValue, FlowError>>>,
        exited: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(
            script: Vec<Result<JsonValue, FlowError>>,
        ) -> (Arc<Self>, mpsc::Sender<Result<JsonValue, FlowError>>) {
            let (tx, rx) = mpsc::channel();
            let source = Arc::new(Self {
                script: Mutex::new(VecDeque::from(script)),
                gate: Mutex::new(rx),
                exited: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            });
            (source, tx)
        }
    }

    impl NotificationSource for ScriptedSource {
        fn wait_for_notification(&self, _sid: SessionId) -> Result<JsonValue, FlowError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return next;
            }
            match self.gate.lock().unwrap().recv() {
                Ok(next) => next,
                Err(_) => Err(FlowError::transport("gate closed")),
            }
        }

        fn backend_exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }
    }

    fn inbox_with(types: &[&str]) -> Arc<Inbox> {
        let inbox = Arc::new(Inbox::new());
        for event_type in types {
            inbox.callbacks.register(*event_type, |_: &str, _: &JsonValue| Ok(()));
        }
        inbox
    }

    /// Unblocks the in-flight wait call shortly after `stop` has cleared the flag.
    fn release_later(gate: mpsc::Sender<Result<JsonValue, FlowError>>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = gate.send(Ok(JsonValue::Null));
        })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn delivers_single_and_batched_changes() {
        let (source, gate) = ScriptedSource::new(vec![
            Ok(json!({"type": "message", "data": "a"})),
            Ok(json!([{"type": "message", "data": "b"}, {"type": "org", "data": "x"}])),
        ]);
        let inbox = inbox_with(&["message"]);
        let poller = NotificationPoller::new(SessionId(1));
        poller.start(source.clone(), Arc::clone(&inbox)).unwrap();
        assert_eq!(poller.state(), PollerState::Running);

        wait_until(|| inbox.notifications.len() == 2);
        let first = inbox.notifications.try_pop().unwrap();
        let second = inbox.notifications.try_pop().unwrap();
        assert_eq!((first.data, second.data), (json!("a"), json!("b")));

        let releaser = release_later(gate);
        poller.stop();
        assert_eq!(poller.state(), PollerState::Stopped);
        releaser.join().unwrap();
    }

    #[test]
    fn transient_errors_are_queued_and_polling_continues() {
        let (source, gate) = ScriptedSource::new(vec![
            Err(FlowError::transport("connection reset")),
            Err(FlowError::transport("connection reset")),
            Ok(json!({"type": "message", "data": "after"})),
        ]);
        let inbox = inbox_with(&["message"]);
        let poller = NotificationPoller::new(SessionId(2));
        poller.start(source.clone(), Arc::clone(&inbox)).unwrap();

        wait_until(|| inbox.notifications.len() == 1);
        assert_eq!(inbox.errors.len(), 2);
        assert_eq!(
            inbox.errors.try_pop(),
            Some("transport error: connection reset".to_owned())
        );
        assert!(poller.is_running());

        let releaser = release_later(gate);
        poller.stop();
        releaser.join().unwrap();
    }

    #[test]
    fn backend_exit_stops_the_worker_without_queuing_an_error() {
        let (source, gate) = ScriptedSource::new(Vec::new());
        let inbox = inbox_with(&["message"]);
        let poller = NotificationPoller::new(SessionId(3));
        poller.start(source.clone(), Arc::clone(&inbox)).unwrap();

        wait_until(|| source.calls.load(Ordering::SeqCst) == 1);
        source.exited.store(true, Ordering::SeqCst);
        gate.send(Err(FlowError::transport("connection refused"))).unwrap();

        wait_until(|| poller.state() == PollerState::Stopped);
        assert!(inbox.errors.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        poller.stop();
        assert_eq!(poller.state(), PollerState::Stopped);
    }

    #[test]
    fn stop_is_idempotent() {
        let (source, gate) = ScriptedSource::new(Vec::new());
        let poller = NotificationPoller::new(SessionId(4));
        poller.start(source.clone(), inbox_with(&[])).unwrap();
        wait_until(|| source.calls.load(Ordering::SeqCst) == 1);

        let releaser = release_later(gate);
        let started = Instant::now();
        poller.stop();
        poller.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(poller.state(), PollerState::Stopped);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        releaser.join().unwrap();
    }

    #[test]
    fn stop_before_start_and_restart_after_stop() {
        let (source, _gate) = ScriptedSource::new(Vec::new());
        let poller = NotificationPoller::new(SessionId(5));
        assert_eq!(poller.state(), PollerState::Idle);
        poller.stop();
        assert_eq!(poller.state(), PollerState::Stopped);

        let err = poller.start(source, inbox_with(&[])).unwrap_err();
        assert!(matches!(err, FlowError::InvalidState { .. }));
    }

    #[test]
    fn second_start_is_a_no_op() {
        let (source, gate) = ScriptedSource::new(Vec::new());
        let inbox = inbox_with(&[]);
        let poller = NotificationPoller::new(SessionId(6));
        poller.start(source.clone(), Arc::clone(&inbox)).unwrap();
        poller.start(source.clone(), inbox).unwrap();

        wait_until(|| source.calls.load(Ordering::SeqCst) >= 1);
        let releaser = release_later(gate);
        poller.stop();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        releaser.join().unwrap();
    }
}
