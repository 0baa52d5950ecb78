use serde::{Deserialize, Serialize};

/// A `{type, value}` message on the `control` data channel (spec §4.6/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    #[serde(default)]
    pub value: Option<ControlValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    SetBitrate,
    SetFps,
    RequestKeyframe,
    ListMonitors,
    ToggleAudio,
    SwitchMonitor,
}

/// The payload carried in a control message's `value` field. Untagged so a
/// bare number or bool deserializes directly, matching how viewers
/// naturally send `{"type":"set_bitrate","value":4000000}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl ControlValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ControlValue::Number(n) if *n >= 0.0 => Some(*n as u32),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ControlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Reply to `list_monitors`: `{type:"monitors", monitors:[...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorsReply {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub monitors: Vec<MonitorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub index: u32,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
}

impl MonitorsReply {
    pub fn new(monitors: Vec<MonitorInfo>) -> Self {
        Self {
            kind: "monitors",
            monitors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bitrate_value_parses_as_number() {
        let raw = r#"{"type":"set_bitrate","value":4000000}"#;
        let msg: ControlMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, ControlKind::SetBitrate);
        assert_eq!(msg.value.unwrap().as_u32(), Some(4_000_000));
    }

    #[test]
    fn request_keyframe_has_no_value() {
        let raw = r#"{"type":"request_keyframe"}"#;
        let msg: ControlMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, ControlKind::RequestKeyframe);
        assert!(msg.value.is_none());
    }

    #[test]
    fn toggle_audio_value_parses_as_bool() {
        let raw = r#"{"type":"toggle_audio","value":true}"#;
        let msg: ControlMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.value.unwrap().as_bool(), Some(true));
    }
}
