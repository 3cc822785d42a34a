use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::backend::BackendProcess;
use crate::callbacks::HandlerResult;
use crate::config::{FlowConfig, DEFAULT_TERMINATE_TIMEOUT_SECS};
use crate::error::FlowError;
use crate::event::NotificationKind;
use crate::manager::SessionManager;
use crate::rpc::{HttpTransport, Liveness, RpcClient};
use crate::session::{SessionId, StopFlag};

mod methods;

pub use methods::{AccountRequest, DeviceRequest};

/// Handle to a running backend and its sessions.
///
/// Cloning is cheap and every clone drives the same backend. Dropping the last
/// clone of a launched client terminates the backend and closes its sessions.
/// Handlers are stored inside the session, so a handler that calls back into
/// the client should capture a [`WeakFlow`] from [`Flow::downgrade`]; a strong
/// clone held there keeps everything alive until [`Flow::terminate`] is called.
/// A handler must not register or unregister callbacks on the session it is
/// running for.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

/// Non-owning [`Flow`] handle for use inside handlers.
#[derive(Clone, Debug)]
pub struct WeakFlow {
    inner: Weak<FlowInner>,
}

impl WeakFlow {
    /// Returns `None` once every [`Flow`] clone has been dropped.
    pub fn upgrade(&self) -> Option<Flow> {
        self.inner.upgrade().map(|inner| Flow { inner })
    }

    /// Like [`WeakFlow::upgrade`], as an error a handler can propagate with `?`.
    pub fn get(&self) -> Result<Flow, FlowError> {
        self.upgrade().ok_or_else(|| FlowError::invalid_state("flow client has been dropped"))
    }
}

struct FlowInner {
    rpc: Arc<RpcClient>,
    sessions: SessionManager,
    backend: Option<Arc<BackendProcess>>,
    server_uri: String,
    terminate_timeout: Duration,
    terminated: AtomicBool,
}

impl Flow {
    /// Spawns the backend, configures it and opens the initial session.
    ///
    /// When `config.username` is set that account is started up as well. If
    /// anything after the spawn fails the backend is shut down again.
    pub fn launch(config: FlowConfig) -> Result<Self, FlowError> {
        config.prepare_dirs()?;
        let backend = Arc::new(BackendProcess::spawn(&config)?);
        let liveness: Arc<dyn Liveness> = backend.clone();
        let rpc = RpcClient::new(HttpTransport::local(backend.port()), backend.token())
            .with_liveness(liveness)
            .with_api_timeout(config.api_timeout());

        let flow = Self::assemble(
            rpc,
            Some(backend),
            config.server_uri.clone(),
            config.terminate_timeout(),
        );
        if let Err(err) = flow.initialise(&config) {
            log::warn!("flow: startup failed, shutting backend down: {err}");
            if let Err(shutdown) = flow.terminate() {
                log::warn!("flow: {shutdown}");
            }
            return Err(err);
        }
        Ok(flow)
    }

    /// Attaches to a backend that is already running and opens a session on it.
    /// The process itself is not supervised.
    pub fn connect(rpc: RpcClient, server_uri: impl Into<String>) -> Result<Self, FlowError> {
        let flow = Self::assemble(
            rpc,
            None,
            server_uri.into(),
            Duration::from_secs(DEFAULT_TERMINATE_TIMEOUT_SECS),
        );
        let sid = flow.new_session(None)?;
        flow.set_current_session(sid);
        Ok(flow)
    }

    fn assemble(
        rpc: RpcClient,
        backend: Option<Arc<BackendProcess>>,
        server_uri: String,
        terminate_timeout: Duration,
    ) -> Self {
        let rpc = Arc::new(rpc);
        Self {
            inner: Arc::new(FlowInner {
                sessions: SessionManager::new(Arc::clone(&rpc)),
                rpc,
                backend,
                server_uri,
                terminate_timeout,
                terminated: AtomicBool::new(false),
            }),
        }
    }

    fn initialise(&self, config: &FlowConfig) -> Result<(), FlowError> {
        self.configure(config, None)?;
        let sid = self.new_session(None)?;
        self.set_current_session(sid);
        if let Some(username) = config.username.as_deref().filter(|name| !name.is_empty()) {
            self.start_up(Some(username), None)?;
        }
        Ok(())
    }

    pub fn downgrade(&self) -> WeakFlow {
        WeakFlow { inner: Arc::downgrade(&self.inner) }
    }

    pub fn server_uri(&self) -> &str {
        &self.inner.server_uri
    }

    pub fn backend(&self) -> Option<&BackendProcess> {
        self.inner.backend.as_deref()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn set_api_timeout(&self, timeout: Option<Duration>) {
        self.inner.rpc.set_api_timeout(timeout);
    }

    /// Issues any backend method by name, adding `SessionID` for the resolved
    /// session. The named wrappers all go through here.
    pub fn call(
        &self,
        method: &str,
        params: JsonMap<String, JsonValue>,
        sid: Option<SessionId>,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, FlowError> {
        let sid = self.inner.sessions.resolve(sid)?;
        self.inner.rpc.call_session(method, sid, params, timeout)
    }

    /// Same as [`Flow::call`] for the few methods that take no session.
    pub fn call_global(
        &self,
        method: &str,
        params: JsonMap<String, JsonValue>,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, FlowError> {
        self.inner.rpc.call(method, params, timeout)
    }

    pub fn new_session(&self, timeout: Option<Duration>) -> Result<SessionId, FlowError> {
        self.inner.sessions.create_session(timeout)
    }

    pub fn set_current_session(&self, sid: SessionId) {
        self.inner.sessions.set_current(sid);
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.inner.sessions.current()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.session_ids()
    }

    /// Starts polling for the session; done implicitly by the account calls.
    pub fn activate(&self, sid: Option<SessionId>) -> Result<(), FlowError> {
        let sid = self.inner.sessions.resolve(sid)?;
        self.inner.sessions.activate(sid)
    }

    /// Stops the session's poller and forgets the session. Anything still
    /// queued for it is discarded.
    pub fn close_session(&self, sid: Option<SessionId>) -> Result<(), FlowError> {
        let sid = self.inner.sessions.resolve(sid)?;
        self.inner.sessions.close(sid)
    }

    pub fn register_callback<F>(
        &self,
        event_type: impl Into<String>,
        handler: F,
        sid: Option<SessionId>,
    ) -> Result<(), FlowError>
    where
        F: FnMut(&str, &JsonValue) -> HandlerResult + Send + 'static,
    {
        self.inner.sessions.session(sid)?.register_callback(event_type, handler);
        Ok(())
    }

    /// Registers `handler` for `kind` on the current session.
    pub fn on<F>(&self, kind: NotificationKind, handler: F) -> Result<(), FlowError>
    where
        F: FnMut(&str, &JsonValue) -> HandlerResult + Send + 'static,
    {
        self.register_callback(kind.as_str(), handler, None)
    }

    pub fn unregister_callback(
        &self,
        event_type: &str,
        sid: Option<SessionId>,
    ) -> Result<(), FlowError> {
        self.inner.sessions.session(sid)?.unregister_callback(event_type)
    }

    /// Handles at most one queued notification. `Ok(false)` means nothing
    /// arrived within `timeout`.
    pub fn process_one_notification(
        &self,
        timeout: Duration,
        sid: Option<SessionId>,
    ) -> Result<bool, FlowError> {
        Ok(self.inner.sessions.session(sid)?.process_one(timeout))
    }

    /// Handles notifications until `stop` is stopped.
    pub fn process_notifications(
        &self,
        timeout: Duration,
        sid: Option<SessionId>,
        stop: &StopFlag,
    ) -> Result<(), FlowError> {
        let session = self.inner.sessions.session(sid)?;
        session.process_loop(timeout, stop);
        Ok(())
    }

    /// Pops one queued polling error. An unknown session simply has none.
    pub fn get_notification_error(
        &self,
        timeout: Duration,
        sid: Option<SessionId>,
    ) -> Option<String> {
        let session = self.inner.sessions.session(sid).ok()?;
        session.get_queued_error(timeout)
    }

    /// Truncates the backend's stderr log. A no-op when attached with
    /// [`Flow::connect`].
    pub fn clear_backend_log(&self) -> Result<(), FlowError> {
        match &self.inner.backend {
            Some(backend) => backend.clear_log(),
            None => Ok(()),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Shuts the backend down (gracefully, then by force) and closes every
    /// session. Later calls return immediately.
    pub fn terminate(&self) -> Result<(), FlowError> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let outcome = match &self.inner.backend {
            Some(backend) => backend.terminate(self.inner.terminate_timeout),
            None => Ok(()),
        };
        self.inner.sessions.terminate_all();
        log::info!("flow: terminated");
        outcome
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        // An attached backend is not ours to stop, and joining its pollers
        // could block on an outstanding wait call.
        if Arc::strong_count(&self.inner) == 1 && self.inner.backend.is_some() {
            if let Err(err) = self.terminate() {
                log::warn!("flow: shutdown on drop: {err}");
            }
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("server_uri", &self.inner.server_uri)
            .field("backend_pid", &self.inner.backend.as_ref().map(|backend| backend.pid()))
            .field("sessions", &self.inner.sessions.session_ids())
            .field("current", &self.inner.sessions.current())
            .finish()
    }
}
