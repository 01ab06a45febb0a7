//! Dialog and application-start types
//!
//! An [`AppStart`] is what the ARI proxy publishes when a call needs an
//! application; a [`Dialog`] is the identity the listener builds from it.

use serde::{Deserialize, Serialize};

/// Application-start notification published by the ARI proxy
///
/// Field names follow the proxy's wire format and are matched exactly
/// (`DialogID`, not `dialogId`).
///
/// `DialogID` is required: a payload without it fails to decode and the
/// requester receives the decode error text instead of `"ok"`. Older
/// listeners acknowledged such payloads and started a session with an empty
/// dialog id, so publishers relying on that must now send the field.
/// `ChannelID` and `Application` default to empty when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStart {
    /// Unique identifier of the new dialog
    #[serde(rename = "DialogID")]
    pub dialog_id: String,

    /// Channel (call leg) the dialog is bound to
    #[serde(rename = "ChannelID", default)]
    pub channel_id: String,

    /// Target application name
    #[serde(rename = "Application", default)]
    pub application: String,
}

impl AppStart {
    /// Decode a notification payload
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encode the notification as the proxy would
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Session identity correlating a call leg to a handler invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dialog {
    /// Dialog identifier
    pub id: String,
    /// Channel the dialog was started for
    pub channel_id: String,
    /// Identifier of the dialog this one was spawned from, if any
    pub parent: Option<String>,
}

impl Dialog {
    pub fn new(id: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            id: id.into(),
            channel_id: String::new(),
            parent,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }
}

impl From<&AppStart> for Dialog {
    fn from(start: &AppStart) -> Self {
        Dialog::new(start.dialog_id.clone(), None).with_channel(start.channel_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_proxy_payload() {
        let start =
            AppStart::decode(br#"{"DialogID":"d1","ChannelID":"c1","Application":"app1"}"#)
                .unwrap();

        assert_eq!(
            start,
            AppStart {
                dialog_id: "d1".to_string(),
                channel_id: "c1".to_string(),
                application: "app1".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_dialog_id_is_rejected() {
        let err = AppStart::decode(br#"{"ChannelID":"c1"}"#).unwrap_err();
        assert!(err.to_string().contains("DialogID"));
    }

    #[test]
    fn test_optional_fields_default() {
        let start = AppStart::decode(br#"{"DialogID":"d2"}"#).unwrap();
        assert_eq!(start.channel_id, "");
        assert_eq!(start.application, "");
    }

    #[test]
    fn test_dialog_from_app_start() {
        let start = AppStart {
            dialog_id: "d1".to_string(),
            channel_id: "c1".to_string(),
            application: "app1".to_string(),
        };
        let dialog = Dialog::from(&start);

        assert_eq!(dialog.id, "d1");
        assert_eq!(dialog.channel_id, "c1");
        assert_eq!(dialog.parent, None);
    }
}
