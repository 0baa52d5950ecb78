use serde::{Deserialize, Serialize};

/// Discriminant for [`InputEvent::kind`] — matches the `type` field of the
/// flat JSON payload on the `input` data channel (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputEventKind {
    MouseMove,
    MouseButton,
    MouseWheel,
    KeyEvent,
}

/// A single input event received on the `input` data channel
/// (viewer → agent). Intentionally a single flat struct — the wire shape
/// in spec §6 is `{type, x, y, button, delta, key, modifiers[]}`, one
/// envelope with optional fields per event kind, not a per-kind schema.
/// Coordinates are in viewer-space pixels; the session's desktop-offset is
/// applied before the event reaches an input-synthesis collaborator
/// (input synthesis itself is out of scope for this core — spec §1
/// Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputEvent {
    #[serde(rename = "type")]
    pub kind: InputEventKind,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub button: Option<u8>,
    #[serde(default)]
    pub pressed: Option<bool>,
    #[serde(default)]
    pub delta: Option<f64>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

impl InputEvent {
    /// True for event kinds that should clear idle mode and latch
    /// `input_active` in the capture loop (spec §4.3 step 2).
    pub fn is_activity(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_move_round_trips() {
        let ev = InputEvent {
            kind: InputEventKind::MouseMove,
            x: Some(10.5),
            y: Some(20.0),
            button: None,
            pressed: None,
            delta: None,
            key: None,
            modifiers: vec![],
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: InputEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, InputEventKind::MouseMove);
        assert_eq!(back.x, Some(10.5));
        assert_eq!(back.y, Some(20.0));
    }

    #[test]
    fn key_event_parses_from_viewer_json() {
        let raw = r#"{"type":"key_event","key":"a","pressed":true,"modifiers":["shift"]}"#;
        let ev: InputEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.kind, InputEventKind::KeyEvent);
        assert_eq!(ev.key.as_deref(), Some("a"));
        assert_eq!(ev.pressed, Some(true));
        assert_eq!(ev.modifiers, vec!["shift".to_string()]);
    }
}
