use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::model::TabId;
use crate::mutation::Mutation;
use crate::store::{Commit, StateSnapshot};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const HUB_SENDER_ID: &str = "tabsync-hub";
pub const HUB_PORT_BASE: u16 = 42000;
pub const HUB_PORT_SPAN: u32 = 2000;

/// Stable per-session port so hub and clients agree without configuration.
pub fn derive_port(session_id: &str) -> u16 {
    let mut hash: u32 = 2166136261;
    for byte in session_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    HUB_PORT_BASE + (hash % HUB_PORT_SPAN) as u16
}

pub fn default_hub_addr(session_id: &str) -> String {
    format!("127.0.0.1:{}", derive_port(session_id))
}

/// `TABSYNC_SESSION_ID` when set, otherwise a per-process id.
pub fn resolve_session_id() -> String {
    match std::env::var("TABSYNC_SESSION_ID") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => format!("pid-{}", std::process::id()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = match RawVersion::deserialize(deserializer)? {
            RawVersion::Number(value) => u16::try_from(value).map_err(|_| {
                serde::de::Error::custom(format!("protocol version out of range: {value}"))
            })?,
            RawVersion::Text(value) => value
                .trim()
                .trim_start_matches('v')
                .parse::<u16>()
                .map_err(|err| {
                    serde::de::Error::custom(format!("invalid protocol version '{value}': {err}"))
                })?,
        };
        Ok(Self(version))
    }
}

/// Marks server pushes so clients never mistake a broadcast for the
/// answer to one of their own requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Client,
    Hub,
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub session_id: String,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub source: Option<MessageSource>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(session_id: &str, sender_id: &str, source: MessageSource, msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: None,
            source: Some(source),
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.source == Some(MessageSource::Broadcast)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Snapshot(StateSnapshot),
    Mutate(Mutation),
    MutateResult(MutateResultPayload),
    Broadcast(Commit),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Snapshot(_) => "snapshot",
            Self::Mutate(_) => "mutate",
            Self::MutateResult(_) => "mutate_result",
            Self::Broadcast(_) => "broadcast",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutateResultPayload {
    pub status: ResultStatus,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub created_id: Option<TabId>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

impl MutateResultPayload {
    pub fn ok(seq: u64, created_id: Option<TabId>) -> Self {
        Self {
            status: ResultStatus::Ok,
            seq: Some(seq),
            created_id,
            error: None,
        }
    }

    pub fn error(error: ErrorInfo) -> Self {
        Self {
            status: ResultStatus::Error,
            seq: None,
            created_id: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// One envelope per websocket text message.
pub fn encode_message(
    envelope: &WireEnvelope,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_message(raw: &str, max_frame_bytes: usize) -> Result<WireEnvelope, FrameError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partial::Partial;
    use serde_json::{json, Value};

    fn mutate_envelope() -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            session_id: "session-alpha".to_string(),
            sender_id: "tab-1".to_string(),
            timestamp: "2026-02-07T21:00:00Z".to_string(),
            request_id: Some("req-1".to_string()),
            source: Some(MessageSource::Client),
            msg: WireMsg::Mutate(Mutation::UpdateProjectTab {
                tab_id: TabId::new("p1"),
                partial: Partial::new().with("userPrompt", "hello"),
            }),
        }
    }

    #[test]
    fn mutate_envelope_wire_shape() {
        let encoded = encode_message(&mutate_envelope(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["type"], "mutate");
        assert_eq!(value["version"], "1");
        assert_eq!(value["source"], "client");
        assert_eq!(
            value["payload"],
            json!({"type": "update_project_tab", "tabId": "p1", "partial": {"userPrompt": "hello"}})
        );

        let decoded = decode_message(&encoded, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, mutate_envelope());
    }

    #[test]
    fn version_accepts_numbers_and_prefixed_strings() {
        for raw in [json!(1), json!("1"), json!("v1")] {
            let version: ProtocolVersion = serde_json::from_value(raw).expect("version");
            assert_eq!(version, ProtocolVersion::CURRENT);
        }
        assert!(serde_json::from_value::<ProtocolVersion>(json!(70_000)).is_err());
        assert!(serde_json::from_value::<ProtocolVersion>(json!("latest")).is_err());
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let encoded = encode_message(&mutate_envelope(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(matches!(
            encode_message(&mutate_envelope(), 16),
            Err(FrameError::OversizedFrame { .. })
        ));
        assert!(matches!(
            decode_message(&encoded, 16),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn broadcasts_are_marked() {
        let envelope = WireEnvelope::new(
            "session-alpha",
            HUB_SENDER_ID,
            MessageSource::Broadcast,
            WireMsg::Broadcast(Commit {
                seq: 4,
                mutation: "delete_chat_tab".to_string(),
                origin: None,
                created_id: None,
                changes: Vec::new(),
            }),
        );
        assert!(envelope.is_broadcast());
        assert_eq!(envelope.msg.kind(), "broadcast");
    }

    #[test]
    fn derived_ports_are_stable_and_in_range() {
        let port = derive_port("session-alpha");
        assert_eq!(port, derive_port("session-alpha"));
        assert!((HUB_PORT_BASE..HUB_PORT_BASE + HUB_PORT_SPAN as u16).contains(&port));
        assert_eq!(default_hub_addr("session-alpha"), format!("127.0.0.1:{port}"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_message("{not json", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
    }
}
