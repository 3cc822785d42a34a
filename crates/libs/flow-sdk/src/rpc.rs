use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::FlowError;
use crate::poller::NotificationSource;
use crate::session::SessionId;

pub mod http;

pub use http::HttpTransport;

/// The long-poll method. It is never given a default timeout.
pub const WAIT_FOR_NOTIFICATION: &str = "WaitForNotification";

/// Request body sent to the backend: named params wrapped in a one-element list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<JsonValue>,
    pub token: String,
}

impl RpcRequest {
    pub fn new(
        method: impl Into<String>,
        params: JsonMap<String, JsonValue>,
        token: impl Into<String>,
    ) -> Self {
        Self { method: method.into(), params: vec![JsonValue::Object(params)], token: token.into() }
    }
}

/// Synchronous request/response primitive to the local backend.
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the parsed response document, before any
    /// `result`/`error` interpretation. `None` means no client-side timeout.
    fn post(&self, request: &RpcRequest, timeout: Option<Duration>) -> Result<JsonValue, FlowError>;
}

/// Exit check for the process behind a transport.
pub trait Liveness: Send + Sync {
    fn has_exited(&self) -> bool;
}

/// Liveness for a backend this client does not supervise: never reported dead.
pub struct Unsupervised;

impl Liveness for Unsupervised {
    fn has_exited(&self) -> bool {
        false
    }
}

/// Issues named-parameter calls and unwraps the backend's response envelope.
pub struct RpcClient {
    transport: Box<dyn Transport>,
    token: String,
    api_timeout: RwLock<Option<Duration>>,
    liveness: Arc<dyn Liveness>,
    next_request_id: AtomicU64,
}

impl RpcClient {
    pub fn new(transport: impl Transport + 'static, token: impl Into<String>) -> Self {
        Self {
            transport: Box::new(transport),
            token: token.into(),
            api_timeout: RwLock::new(None),
            liveness: Arc::new(Unsupervised),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_api_timeout(self, timeout: Option<Duration>) -> Self {
        self.set_api_timeout(timeout);
        self
    }

    /// Sets the default timeout for every request except `WaitForNotification`.
    pub fn set_api_timeout(&self, timeout: Option<Duration>) {
        *self.api_timeout.write().expect("api_timeout rwlock poisoned") = timeout;
    }

    pub fn api_timeout(&self) -> Option<Duration> {
        *self.api_timeout.read().expect("api_timeout rwlock poisoned")
    }

    /// An explicit timeout wins; otherwise the API default, except for the
    /// long-poll call which gets none.
    pub fn effective_timeout(&self, method: &str, explicit: Option<Duration>) -> Option<Duration> {
        if explicit.is_some() {
            return explicit;
        }
        if method == WAIT_FOR_NOTIFICATION {
            return None;
        }
        self.api_timeout()
    }

    pub fn backend_exited(&self) -> bool {
        self.liveness.has_exited()
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn call(
        &self,
        method: &str,
        params: JsonMap<String, JsonValue>,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, FlowError> {
        let request = RpcRequest::new(method, params, self.token.as_str());
        let request_id = self.next_request_id();
        let timeout = self.effective_timeout(method, timeout);
        log::debug!("rpc: request id={request_id} method={method} params={:?}", request.params);

        let started = Instant::now();
        let response = self.transport.post(&request, timeout).map_err(|err| {
            log::debug!(
                "rpc: failure id={request_id} method={method} lat={:.2}s: {err}",
                started.elapsed().as_secs_f64()
            );
            err
        })?;
        log::debug!(
            "rpc: response id={request_id} method={method} lat={:.2}s {response}",
            started.elapsed().as_secs_f64()
        );
        interpret_response(response)
    }

    /// Same as [`RpcClient::call`] with `SessionID` added to the params.
    pub fn call_session(
        &self,
        method: &str,
        sid: SessionId,
        mut params: JsonMap<String, JsonValue>,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, FlowError> {
        params.insert("SessionID".to_owned(), json!(sid.0));
        self.call(method, params, timeout)
    }
}

impl NotificationSource for RpcClient {
    fn wait_for_notification(&self, sid: SessionId) -> Result<JsonValue, FlowError> {
        self.call_session(WAIT_FOR_NOTIFICATION, sid, JsonMap::new(), None)
    }

    fn backend_exited(&self) -> bool {
        RpcClient::backend_exited(self)
    }
}

/// Unwraps a response document: a non-empty `error` (or the legacy `Error`)
/// becomes [`FlowError::Backend`], otherwise `result` is returned, falling back
/// to the whole document when there is no `result` key.
pub fn interpret_response(response: JsonValue) -> Result<JsonValue, FlowError> {
    let mut fields = match response {
        JsonValue::Object(fields) => fields,
        other => return Ok(other),
    };
    for key in ["error", "Error"] {
        if let Some(message) = fields.get(key).and_then(error_message) {
            return Err(FlowError::backend(message));
        }
    }
    if let Some(result) = fields.remove("result") {
        return Ok(result);
    }
    Ok(JsonValue::Object(fields))
}

fn error_message(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(message) if message.is_empty() => None,
        JsonValue::String(message) => Some(message.clone()),
        JsonValue::Array(items) if items.is_empty() => None,
        JsonValue::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// Builds a params map from `(name, value)` pairs.
pub fn params<I, K>(pairs: I) -> JsonMap<String, JsonValue>
where
    I: IntoIterator<Item = (K, JsonValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(key, value)| (key.into(), value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        responses: Mutex<VecDeque<Result<JsonValue, FlowError>>>,
        requests: Arc<Mutex<Vec<(RpcRequest, Option<Duration>)>>>,
    }

    impl RecordingTransport {
        fn replying(responses: Vec<Result<JsonValue, FlowError>>) -> Self {
            Self { responses: Mutex::new(VecDeque::from(responses)), ..Self::default() }
        }
    }

    impl Transport for RecordingTransport {
        fn post(
            &self,
            request: &RpcRequest,
            timeout: Option<Duration>,
        ) -> Result<JsonValue, FlowError> {
            self.requests.lock().unwrap().push((request.clone(), timeout));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"result": null})))
        }
    }

    #[test]
    fn request_wraps_named_params_and_token() {
        let transport = RecordingTransport::default();
        let requests = Arc::clone(&transport.requests);
        let client = RpcClient::new(transport, "secret-token");

        client
            .call_session("GetChannel", SessionId(9), params([("ChannelID", json!("c1"))]), None)
            .unwrap();

        let recorded = requests.lock().unwrap();
        let (request, timeout) = &recorded[0];
        assert_eq!(request.method, "GetChannel");
        assert_eq!(request.token, "secret-token");
        assert_eq!(request.params, vec![json!({"ChannelID": "c1", "SessionID": 9})]);
        assert_eq!(*timeout, None);
        assert_eq!(
            serde_json::to_value(request).unwrap(),
            json!({
                "method": "GetChannel",
                "params": [{"ChannelID": "c1", "SessionID": 9}],
                "token": "secret-token"
            })
        );
    }

    #[test]
    fn api_timeout_applies_to_everything_but_the_wait_call() {
        let transport = RecordingTransport::default();
        let requests = Arc::clone(&transport.requests);
        let client =
            RpcClient::new(transport, "t").with_api_timeout(Some(Duration::from_secs(3)));

        client.call("AccountId", JsonMap::new(), None).unwrap();
        client.wait_for_notification(SessionId(1)).unwrap();
        client.call("AccountId", JsonMap::new(), Some(Duration::from_millis(250))).unwrap();
        client.set_api_timeout(None);
        client.call("AccountId", JsonMap::new(), None).unwrap();

        let timeouts = requests.lock().unwrap().iter().map(|(_, t)| *t).collect::<Vec<_>>();
        assert_eq!(
            timeouts,
            vec![Some(Duration::from_secs(3)), None, Some(Duration::from_millis(250)), None]
        );
    }

    #[test]
    fn both_error_casings_map_to_backend_errors() {
        assert_eq!(
            interpret_response(json!({"error": "bad session"})),
            Err(FlowError::backend("bad session"))
        );
        assert_eq!(
            interpret_response(json!({"Error": "no account started"})),
            Err(FlowError::backend("no account started"))
        );
        assert_eq!(
            interpret_response(json!({"error": "", "Error": "late"})),
            Err(FlowError::backend("late"))
        );
    }

    #[test]
    fn result_is_unwrapped_and_other_documents_pass_through() {
        assert_eq!(
            interpret_response(json!({"result": {"SessionID": 4}})),
            Ok(json!({"SessionID": 4}))
        );
        assert_eq!(interpret_response(json!({"error": "", "result": 5})), Ok(json!(5)));
        assert_eq!(interpret_response(json!({"status": "ok"})), Ok(json!({"status": "ok"})));
        assert_eq!(interpret_response(json!({"error": null})), Ok(json!({"error": null})));
        assert_eq!(interpret_response(json!([1, 2])), Ok(json!([1, 2])));
    }

    #[test]
    fn transport_errors_propagate_unchanged() {
        let client = RpcClient::new(
            RecordingTransport::replying(vec![Err(FlowError::timeout("AccountId"))]),
            "t",
        );
        assert_eq!(
            client.call("AccountId", JsonMap::new(), None),
            Err(FlowError::timeout("AccountId"))
        );
    }

    #[test]
    fn liveness_defaults_to_alive() {
        struct Dead;
        impl Liveness for Dead {
            fn has_exited(&self) -> bool {
                true
            }
        }

        let client = RpcClient::new(RecordingTransport::default(), "t");
        assert!(!client.backend_exited());
        let client = client.with_liveness(Arc::new(Dead));
        assert!(client.backend_exited());
    }
}
