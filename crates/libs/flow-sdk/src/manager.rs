use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::FlowError;
use crate::poller::NotificationSource;
use crate::rpc::RpcClient;
use crate::session::{Session, SessionId};

/// Owns every live session and the "current session" default.
pub struct SessionManager {
    rpc: Arc<RpcClient>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    current: Mutex<Option<SessionId>>,
}

impl SessionManager {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self { rpc, sessions: Mutex::new(HashMap::new()), current: Mutex::new(None) }
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    /// Asks the backend for a new session and registers it with an idle poller.
    pub fn create_session(&self, timeout: Option<Duration>) -> Result<SessionId, FlowError> {
        let result = self.rpc.call("NewSession", JsonMap::new(), timeout)?;
        let sid = parse_session_id(&result)?;

        let previous = self
            .sessions
            .lock()
            .expect("sessions mutex poisoned")
            .insert(sid, Arc::new(Session::new(sid)));
        if let Some(previous) = previous {
            log::warn!("session({sid}): backend reissued a live session id, closing the old one");
            previous.close();
        }
        log::debug!("session({sid}): created");
        Ok(sid)
    }

    pub fn get(&self, sid: SessionId) -> Result<Arc<Session>, FlowError> {
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .get(&sid)
            .cloned()
            .ok_or(FlowError::UnknownSession { sid })
    }

    /// Resolves an optional explicit id against the current session.
    pub fn resolve(&self, sid: Option<SessionId>) -> Result<SessionId, FlowError> {
        match sid {
            Some(sid) => Ok(sid),
            None => self.current().ok_or(FlowError::NoCurrentSession),
        }
    }

    /// Like [`SessionManager::resolve`], then looks the session up.
    pub fn session(&self, sid: Option<SessionId>) -> Result<Arc<Session>, FlowError> {
        self.get(self.resolve(sid)?)
    }

    /// No check that `sid` is live.
    pub fn set_current(&self, sid: SessionId) {
        *self.current.lock().expect("current session mutex poisoned") = Some(sid);
    }

    pub fn current(&self) -> Option<SessionId> {
        *self.current.lock().expect("current session mutex poisoned")
    }

    /// Starts polling for `sid`. A session that is already polling is left alone.
    pub fn activate(&self, sid: SessionId) -> Result<(), FlowError> {
        let session = self.get(sid)?;
        let source: Arc<dyn NotificationSource> = self.rpc.clone();
        session.activate(source)
    }

    /// Stops the session's poller, waiting for the worker to exit, then forgets it.
    pub fn close(&self, sid: SessionId) -> Result<(), FlowError> {
        let session = self.get(sid)?;
        session.close();
        self.sessions.lock().expect("sessions mutex poisoned").remove(&sid);
        log::debug!("session({sid}): closed");
        Ok(())
    }

    pub fn terminate_all(&self) {
        for sid in self.session_ids() {
            if let Err(err) = self.close(sid) {
                log::debug!("session({sid}): close during shutdown: {err}");
            }
        }
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids = self
            .sessions
            .lock()
            .expect("sessions mutex poisoned")
            .keys()
            .copied()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("sessions mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_session_id(result: &JsonValue) -> Result<SessionId, FlowError> {
    result
        .get("SessionID")
        .and_then(JsonValue::as_u64)
        .map(SessionId)
        .ok_or_else(|| FlowError::protocol(format!("NewSession returned no SessionID: {result}")))
}
