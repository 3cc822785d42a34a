use serde_json::Value as JsonValue;
use std::io::{self, Read};
use std::time::Duration;
use ureq::ErrorKind;

use crate::error::FlowError;
use crate::rpc::{RpcRequest, Transport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// JSON-over-HTTP transport to a backend listening on localhost.
///
/// The agent only carries a connect timeout. Read and write limits are set
/// per request so the long-poll call can block for as long as it needs.
#[derive(Debug)]
pub struct HttpTransport {
    url: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn local(port: u16) -> Self {
        Self::new(&format!("127.0.0.1:{port}"))
    }

    pub fn new(rpc_addr: &str) -> Self {
        let base_url = if rpc_addr.starts_with("http://") || rpc_addr.starts_with("https://") {
            rpc_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{rpc_addr}")
        };
        Self {
            url: format!("{base_url}/rpc"),
            agent: ureq::AgentBuilder::new().timeout_connect(CONNECT_TIMEOUT).build(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    fn post(
        &self,
        request: &RpcRequest,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, FlowError> {
        let body = serde_json::to_string(request)
            .map_err(|err| FlowError::protocol(format!("failed to encode request: {err}")))?;

        let mut call = self.agent.post(&self.url).set("Content-Type", "application/json");
        if let Some(timeout) = timeout {
            call = call.timeout(timeout);
        }

        let response = match call.send_string(&body) {
            Ok(response) => response,
            // The backend reports failures in the body; a non-2xx status alone
            // does not make the response unreadable.
            Err(ureq::Error::Status(code, response)) => {
                log::debug!("rpc: http status {code} from {} for {}", self.url, request.method);
                response
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(map_transport_error(&request.method, &transport));
            }
        };

        let mut text = String::new();
        response.into_reader().read_to_string(&mut text).map_err(|err| {
            if is_timeout_io(&err) {
                FlowError::timeout(request.method.as_str())
            } else {
                FlowError::transport(format!("failed to read response body: {err}"))
            }
        })?;
        serde_json::from_str(&text).map_err(|err| {
            FlowError::protocol(format!("response to {} is not JSON: {err}", request.method))
        })
    }
}

fn map_transport_error(method: &str, transport: &ureq::Transport) -> FlowError {
    let timed_out = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(is_timeout_io)
        || transport
            .message()
            .is_some_and(|message| message.to_ascii_lowercase().contains("timed out"));
    if timed_out {
        return FlowError::timeout(method);
    }
    FlowError::transport(summarize_transport_error(transport))
}

fn is_timeout_io(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn summarize_transport_error(transport: &ureq::Transport) -> String {
    let category = match transport.kind() {
        ErrorKind::ConnectionFailed => "connection refused or backend unavailable",
        ErrorKind::Dns => "dns lookup failed",
        ErrorKind::Io => "network i/o error",
        ErrorKind::InvalidUrl => "invalid rpc url",
        ErrorKind::UnknownScheme => "unsupported rpc url scheme",
        ErrorKind::TooManyRedirects => "too many redirects",
        ErrorKind::ProxyConnect => "proxy connect failed",
        ErrorKind::ProxyUnauthorized => "proxy authentication failed",
        ErrorKind::InvalidProxyUrl => "invalid proxy url",
        ErrorKind::BadStatus => "bad status line from backend",
        ErrorKind::BadHeader => "bad header from backend",
        ErrorKind::InsecureRequestHttpsOnly => "insecure request blocked by https-only setting",
        ErrorKind::HTTP => "http status error",
    };

    let mut details = Vec::new();
    if let Some(message) = transport.message() {
        let cleaned = message.trim();
        if !cleaned.is_empty() {
            details.push(cleaned.to_string());
        }
    }
    if let Some(source) = std::error::Error::source(transport) {
        let cleaned = source.to_string();
        if !cleaned.is_empty() && !details.iter().any(|existing| existing == &cleaned) {
            details.push(cleaned);
        }
    }

    if details.is_empty() {
        category.to_string()
    } else {
        format!("{category}: {}", details.join(": "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_normalised() {
        assert_eq!(HttpTransport::local(8080).url(), "http://127.0.0.1:8080/rpc");
        assert_eq!(HttpTransport::new("http://localhost:9/").url(), "http://localhost:9/rpc");
        assert_eq!(HttpTransport::new("127.0.0.1:1").url(), "http://127.0.0.1:1/rpc");
    }

    #[test]
    fn io_timeouts_are_recognised() {
        assert!(is_timeout_io(&io::Error::new(io::ErrorKind::TimedOut, "slow")));
        assert!(is_timeout_io(&io::Error::new(io::ErrorKind::WouldBlock, "slow")));
        assert!(!is_timeout_io(&io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
    }
}
