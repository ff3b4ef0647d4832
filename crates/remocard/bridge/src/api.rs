//! JSON payloads exchanged with remote clients
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// Protocol version reported by `/`
pub const PROTOCOL_VERSION: &str = "1.2";

/// Operations advertised by `/`
pub const SUPPORTED_COMMANDS: [&str; 6] = [
    "sendRawApdu",
    "sendApdu",
    "openChannel",
    "closeChannel",
    "listSlots",
    "listChannels",
];

/// Version and capability descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub device_name: String,
    pub supported_commands: Vec<String>,
    pub encryption_required: bool,
    pub session_supported: bool,
}

impl VersionInfo {
    /// Describe a bridge running with `settings`
    pub fn new(settings: &Settings) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_owned(),
            device_name: settings.device_name.clone(),
            supported_commands: SUPPORTED_COMMANDS.iter().map(|c| (*c).to_owned()).collect(),
            encryption_required: settings.encryption_enabled(),
            session_supported: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub client_nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub session_id: String,
    pub server_nonce: String,
}

/// One reader as reported by `/listSlots`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEntry {
    pub name: String,
    pub is_present: bool,
    /// Chip identifier, when slot detection found one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<String>,
    /// First application id that could be selected during slot detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSlotsResponse {
    pub slots: Vec<SlotEntry>,
}

/// Body of `/openChannel` and `/closeChannel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub aids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<String>,
}

impl OpenChannelResponse {
    pub fn opened(aid: String, reader: String) -> Self {
        Self {
            success: true,
            aid: Some(aid),
            reader: Some(reader),
        }
    }

    pub const fn failed() -> Self {
        Self {
            success: false,
            aid: None,
            reader: None,
        }
    }
}

/// Body of `/sendApdu` and `/sendRawApdu`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApduRequest {
    /// Command APDU as hex
    pub apdu: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitResponse {
    /// Response APDU (payload and status word) as lowercase hex
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SuccessResponse {
    pub const fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListChannelsResponse {
    /// Open channel keys, `reader:AID`
    pub channels: Vec<String>,
}

/// Body of `/updateSettings`; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_channel: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_readers: Option<Vec<String>>,
}

/// Error payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_version_info_shape() {
        let settings = Settings {
            password: "secret".into(),
            device_name: "bench".into(),
            ..Settings::default()
        };
        let value = serde_json::to_value(VersionInfo::new(&settings)).unwrap();

        assert_eq!(value["version"], "1.2");
        assert_eq!(value["deviceName"], "bench");
        assert_eq!(value["encryptionRequired"], true);
        assert_eq!(value["sessionSupported"], true);
        assert_eq!(value["supportedCommands"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let slot = SlotEntry {
            name: "SIM1".into(),
            is_present: true,
            eid: None,
            aid: Some("A0000005591010FFFFFFFF8900000100".into()),
        };
        assert_eq!(
            serde_json::to_value(slot).unwrap(),
            json!({ "name": "SIM1", "isPresent": true, "aid": "A0000005591010FFFFFFFF8900000100" })
        );
        assert_eq!(
            serde_json::to_value(OpenChannelResponse::failed()).unwrap(),
            json!({ "success": false })
        );
    }

    #[test]
    fn test_requests_tolerate_missing_and_unknown_fields() {
        let request: ApduRequest =
            serde_json::from_value(json!({ "apdu": "00A4", "extra": 1 })).unwrap();
        assert_eq!(request.aid, None);
        assert_eq!(request.reader, None);

        let request: SettingsRequest =
            serde_json::from_value(json!({ "singleChannel": true, "useAes": true })).unwrap();
        assert_eq!(request.single_channel, Some(true));
        assert_eq!(request.port, None);
    }
}
