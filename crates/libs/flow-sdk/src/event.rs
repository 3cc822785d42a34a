use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Notification type tags pushed by the backend through `WaitForNotification`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum NotificationKind {
    Org,
    Channel,
    Message,
    Hwm,
    #[serde(rename = "channel-member-event")]
    ChannelMember,
    #[serde(rename = "org-member-event")]
    OrgMember,
    OrgJoinRequest,
    PeerVerification,
    Profile,
    #[serde(rename = "upload-start-event")]
    UploadStart,
    #[serde(rename = "upload-progress-event")]
    UploadProgress,
    #[serde(rename = "upload-complete-event")]
    UploadComplete,
    #[serde(rename = "upload-error-event")]
    UploadError,
    #[serde(rename = "download-start-event")]
    DownloadStart,
    #[serde(rename = "download-progress-event")]
    DownloadProgress,
    #[serde(rename = "download-complete-event")]
    DownloadComplete,
    #[serde(rename = "download-error-event")]
    DownloadError,
    ChannelSessionKey,
    ChannelSessionKeyShare,
    LdapBindRequest,
    NotifyEvent,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 21] = [
        Self::Org,
        Self::Channel,
        Self::Message,
        Self::Hwm,
        Self::ChannelMember,
        Self::OrgMember,
        Self::OrgJoinRequest,
        Self::PeerVerification,
        Self::Profile,
        Self::UploadStart,
        Self::UploadProgress,
        Self::UploadComplete,
        Self::UploadError,
        Self::DownloadStart,
        Self::DownloadProgress,
        Self::DownloadComplete,
        Self::DownloadError,
        Self::ChannelSessionKey,
        Self::ChannelSessionKeyShare,
        Self::LdapBindRequest,
        Self::NotifyEvent,
    ];

    /// Wire tag carried in the `type` field of a change.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Org => "org",
            Self::Channel => "channel",
            Self::Message => "message",
            Self::Hwm => "hwm",
            Self::ChannelMember => "channel-member-event",
            Self::OrgMember => "org-member-event",
            Self::OrgJoinRequest => "org-join-request",
            Self::PeerVerification => "peer-verification",
            Self::Profile => "profile",
            Self::UploadStart => "upload-start-event",
            Self::UploadProgress => "upload-progress-event",
            Self::UploadComplete => "upload-complete-event",
            Self::UploadError => "upload-error-event",
            Self::DownloadStart => "download-start-event",
            Self::DownloadProgress => "download-progress-event",
            Self::DownloadComplete => "download-complete-event",
            Self::DownloadError => "download-error-event",
            Self::ChannelSessionKey => "channel-session-key",
            Self::ChannelSessionKeyShare => "channel-session-key-share",
            Self::LdapBindRequest => "ldap-bind-request",
            Self::NotifyEvent => "notify-event",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown notification type '{value}'"))
    }
}

impl AsRef<str> for NotificationKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// A single change delivered by the backend.
///
/// `data` is passed through to the handler untouched.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl Notification {
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self { event_type: event_type.into(), data }
    }

    /// Builds a notification from a raw change object. Returns `None` for
    /// nulls, non-objects and objects without a string `type`.
    pub fn from_change(change: &JsonValue) -> Option<Self> {
        let event_type = change.get("type")?.as_str()?;
        let data = change.get("data").cloned().unwrap_or(JsonValue::Null);
        Some(Self::new(event_type, data))
    }

    pub fn kind(&self) -> Option<NotificationKind> {
        self.event_type.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_round_trip_through_from_str_and_serde() {
        for kind in NotificationKind::ALL {
            assert_eq!(kind.as_str().parse::<NotificationKind>(), Ok(kind));
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, json!(kind.as_str()));
        }
        assert!("nope".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn from_change_requires_string_type() {
        let change = json!({"type": "message", "data": {"text": "hi"}});
        let notification = Notification::from_change(&change).expect("notification");
        assert_eq!(notification.event_type, "message");
        assert_eq!(notification.data, json!({"text": "hi"}));
        assert_eq!(notification.kind(), Some(NotificationKind::Message));

        assert!(Notification::from_change(&JsonValue::Null).is_none());
        assert!(Notification::from_change(&json!({"data": 1})).is_none());
        assert!(Notification::from_change(&json!({"type": 3})).is_none());
        assert!(Notification::from_change(&json!("message")).is_none());
    }

    #[test]
    fn missing_data_becomes_null() {
        let notification =
            Notification::from_change(&json!({"type": "hwm"})).expect("notification");
        assert_eq!(notification.data, JsonValue::Null);
    }
}
