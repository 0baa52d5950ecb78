use serde::{Deserialize, Serialize};

/// `{x, y, v}` payload on the unordered, zero-retransmit `cursor` data
/// channel (agent → viewer, spec §6). Sent only on change, at up to 120 Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub x: i32,
    pub y: i32,
    /// 1 = visible, 0 = hidden. Kept as an integer (not bool) to match the
    /// compact wire shape in spec §6 exactly.
    pub v: u8,
}

impl CursorUpdate {
    pub fn visible(x: i32, y: i32) -> Self {
        Self { x, y, v: 1 }
    }

    pub fn hidden(x: i32, y: i32) -> Self {
        Self { x, y, v: 0 }
    }

    pub fn is_visible(&self) -> bool {
        self.v != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_compact_shape() {
        let update = CursorUpdate::visible(12, 34);
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"x":12,"y":34,"v":1}"#);
    }
}
