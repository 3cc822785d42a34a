use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::time::Duration;

use super::Flow;
use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::rpc::{params, WAIT_FOR_NOTIFICATION};
use crate::session::SessionId;

const GENERATED_DIGITS: usize = 15;

/// Fields for `CreateAccount`. Empty optional fields are generated or
/// defaulted from the running host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountRequest {
    pub username: String,
    pub password: String,
    pub device_name: Option<String>,
    pub phone_number: Option<String>,
    pub platform: Option<String>,
    pub os_release: Option<String>,
    pub email_confirm_code: String,
    pub totp_verifier: Option<String>,
}

impl AccountRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into(), ..Self::default() }
    }
}

/// Fields for `CreateDevice`, adding this host to an existing account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRequest {
    pub username: String,
    pub password: String,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    pub os_release: Option<String>,
}

impl DeviceRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into(), ..Self::default() }
    }
}

impl Flow {
    /// Sends the server and local storage settings to the backend.
    pub fn configure(
        &self,
        config: &FlowConfig,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, FlowError> {
        self.call_global(
            "Config",
            params([
                ("FlowServHost", json!(config.host)),
                ("FlowServPort", json!(config.port.to_string())),
                ("FlowLocalDatabaseDir", json!(config.db_dir.display().to_string())),
                ("FlowLocalSchemaDir", json!(config.schema_dir.display().to_string())),
                ("FlowLocalAttachmentDir", json!(config.attachment_dir.display().to_string())),
                ("FlowUseTLS", json!(config.use_tls)),
            ]),
            timeout,
        )
    }

    /// Starts an account already set up on this host and begins polling.
    ///
    /// Without a username the first local account is used.
    pub fn start_up(
        &self,
        username: Option<&str>,
        sid: Option<SessionId>,
    ) -> Result<(), FlowError> {
        let username = match username.filter(|name| !name.is_empty()) {
            Some(name) => name.to_owned(),
            None => first_local_username(&self.enumerate_local_accounts()?).unwrap_or_default(),
        };
        let sid = self.sessions().resolve(sid)?;
        self.call(
            "StartUp",
            params([
                ("Username", json!(username)),
                ("ServerURI", json!(self.server_uri())),
            ]),
            Some(sid),
            None,
        )?;
        self.sessions().activate(sid)
    }

    /// Creates an account with this host as its first device and begins polling.
    pub fn create_account(
        &self,
        request: &AccountRequest,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        let sid = self.sessions().resolve(sid)?;
        let result = self.call(
            "CreateAccount",
            params([
                ("PhoneNumber", json!(or_generated(&request.phone_number, random_digits))),
                ("DeviceName", json!(or_generated(&request.device_name, device_name))),
                ("Username", json!(request.username)),
                ("ServerURI", json!(self.server_uri())),
                ("Platform", json!(or_generated(&request.platform, platform))),
                ("OSRelease", json!(or_generated(&request.os_release, os_release))),
                ("Password", json!(request.password)),
                ("TotpVerifier", json!(or_generated(&request.totp_verifier, random_digits))),
                ("EmailConfirmCode", json!(request.email_confirm_code)),
                ("NotifyToken", json!("")),
            ]),
            Some(sid),
            None,
        )?;
        self.sessions().activate(sid)?;
        Ok(result)
    }

    /// Registers this host as a new device of an existing account and begins polling.
    pub fn create_device(
        &self,
        request: &DeviceRequest,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        let sid = self.sessions().resolve(sid)?;
        let result = self.call(
            "CreateDevice",
            params([
                ("Username", json!(request.username)),
                ("ServerURI", json!(self.server_uri())),
                ("DeviceName", json!(or_generated(&request.device_name, device_name))),
                ("Password", json!(request.password)),
                ("Platform", json!(or_generated(&request.platform, platform))),
                ("OSRelease", json!(or_generated(&request.os_release, os_release))),
            ]),
            Some(sid),
            None,
        )?;
        self.sessions().activate(sid)?;
        Ok(result)
    }

    /// Direct long-poll call, bypassing the session's poller.
    pub fn wait_for_notification(
        &self,
        sid: Option<SessionId>,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, FlowError> {
        self.call(WAIT_FOR_NOTIFICATION, JsonMap::new(), sid, timeout)
    }

    pub fn account_id(&self, sid: Option<SessionId>) -> Result<String, FlowError> {
        let result = self.call("AccountId", JsonMap::new(), sid, None)?;
        expect_string("AccountId", result)
    }

    pub fn device_id(&self, sid: Option<SessionId>) -> Result<String, FlowError> {
        let result = self.call("DeviceId", JsonMap::new(), sid, None)?;
        expect_string("DeviceId", result)
    }

    pub fn enumerate_local_accounts(&self) -> Result<JsonValue, FlowError> {
        self.call_global("EnumerateLocalAccounts", JsonMap::new(), None)
    }

    pub fn new_org(
        &self,
        name: &str,
        discoverable: bool,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call(
            "NewOrg",
            params([("Name", json!(name)), ("Discoverable", json!(discoverable))]),
            sid,
            None,
        )
    }

    pub fn enumerate_orgs(&self, sid: Option<SessionId>) -> Result<JsonValue, FlowError> {
        self.call("EnumerateOrgs", JsonMap::new(), sid, None)
    }

    pub fn new_channel(
        &self,
        org_id: &str,
        name: &str,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call(
            "NewChannel",
            params([("OrgID", json!(org_id)), ("Name", json!(name))]),
            sid,
            None,
        )
    }

    pub fn enumerate_channels(
        &self,
        org_id: &str,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call("EnumerateChannels", params([("OrgID", json!(org_id))]), sid, None)
    }

    pub fn get_channel(
        &self,
        channel_id: &str,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call("GetChannel", params([("ChannelID", json!(channel_id))]), sid, None)
    }

    pub fn org_add_member(
        &self,
        org_id: &str,
        account_id: &str,
        member_state: &str,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call(
            "OrgAddMember",
            params([
                ("OrgID", json!(org_id)),
                ("MemberAccountID", json!(account_id)),
                ("MemberState", json!(member_state)),
            ]),
            sid,
            None,
        )
    }

    pub fn channel_add_member(
        &self,
        org_id: &str,
        channel_id: &str,
        account_id: &str,
        member_state: &str,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call(
            "ChannelAddMember",
            params([
                ("OrgID", json!(org_id)),
                ("ChannelID", json!(channel_id)),
                ("MemberAccountID", json!(account_id)),
                ("MemberState", json!(member_state)),
            ]),
            sid,
            None,
        )
    }

    /// Sends `text` to a channel. `other_data` and `attachments` go out as
    /// JSON null when absent.
    pub fn send_message(
        &self,
        org_id: &str,
        channel_id: &str,
        text: &str,
        other_data: Option<JsonValue>,
        attachments: Option<JsonValue>,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call(
            "SendMessage",
            params([
                ("OrgID", json!(org_id)),
                ("ChannelID", json!(channel_id)),
                ("Text", json!(text)),
                ("OtherData", other_data.unwrap_or(JsonValue::Null)),
                ("Attachments", attachments.unwrap_or(JsonValue::Null)),
            ]),
            sid,
            None,
        )
    }

    pub fn enumerate_messages(
        &self,
        org_id: &str,
        channel_id: &str,
        filters: Option<JsonValue>,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call(
            "EnumerateMessages",
            params([
                ("OrgID", json!(org_id)),
                ("ChannelID", json!(channel_id)),
                ("Filters", filters.unwrap_or(JsonValue::Null)),
            ]),
            sid,
            None,
        )
    }

    pub fn get_peer(&self, username: &str, sid: Option<SessionId>) -> Result<JsonValue, FlowError> {
        self.call("GetPeer", params([("PeerUsername", json!(username))]), sid, None)
    }

    pub fn get_peer_from_id(
        &self,
        account_id: &str,
        sid: Option<SessionId>,
    ) -> Result<JsonValue, FlowError> {
        self.call("GetPeerFromID", params([("PeerID", json!(account_id))]), sid, None)
    }

    /// Tells the backend the client is going idle.
    pub fn pause(&self, sid: Option<SessionId>) -> Result<JsonValue, FlowError> {
        self.call("Pause", JsonMap::new(), sid, None)
    }

    pub fn resume(&self, sid: Option<SessionId>) -> Result<JsonValue, FlowError> {
        self.call("Resume", JsonMap::new(), sid, None)
    }
}

fn first_local_username(accounts: &JsonValue) -> Option<String> {
    accounts
        .as_array()?
        .first()?
        .get("username")
        .and_then(JsonValue::as_str)
        .map(str::to_owned)
}

fn expect_string(method: &str, result: JsonValue) -> Result<String, FlowError> {
    match result {
        JsonValue::String(value) => Ok(value),
        other => Err(FlowError::protocol(format!("{method} returned {other}, expected a string"))),
    }
}

fn or_generated(value: &Option<String>, generate: fn() -> String) -> String {
    match value.as_deref() {
        Some(value) if !value.is_empty() => value.to_owned(),
        _ => generate(),
    }
}

/// Decimal digits from the OS RNG, used for placeholder phone numbers and
/// TOTP verifiers.
pub(crate) fn random_digits() -> String {
    // Largest multiple of ten that fits, so `% 10` stays uniform.
    const LIMIT: u32 = u32::MAX - u32::MAX % 10;
    let mut digits = String::with_capacity(GENERATED_DIGITS);
    while digits.len() < GENERATED_DIGITS {
        let value = OsRng.next_u32();
        if value < LIMIT {
            digits.push(char::from(b'0' + (value % 10) as u8));
        }
    }
    digits
}

pub(crate) fn device_name() -> String {
    format!("dev-{}", random_digits())
}

fn platform() -> String {
    std::env::consts::OS.to_owned()
}

/// Kernel release when the host exposes it, otherwise empty.
fn os_release() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|release| release.trim().to_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_values_have_the_expected_shape() {
        let digits = random_digits();
        assert_eq!(digits.len(), 15);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));

        let name = device_name();
        assert!(name.starts_with("dev-"));
        assert_eq!(name.len(), 4 + 15);
    }

    #[test]
    fn explicit_values_are_not_replaced() {
        assert_eq!(or_generated(&Some("555".into()), random_digits), "555");
        assert_eq!(or_generated(&Some(String::new()), || "gen".into()), "gen");
        assert_eq!(or_generated(&None, || "gen".into()), "gen");
    }

    #[test]
    fn first_local_username_reads_the_first_entry() {
        let accounts = json!([{"username": "alice"}, {"username": "bob"}]);
        assert_eq!(first_local_username(&accounts), Some("alice".to_owned()));
        assert_eq!(first_local_username(&json!([])), None);
        assert_eq!(first_local_username(&JsonValue::Null), None);
    }
}
