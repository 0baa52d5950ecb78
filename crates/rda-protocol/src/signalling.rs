use serde::{Deserialize, Serialize};

/// One entry of the `ice_servers` array in a `start` call (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    /// Either a single URL or a list, per the ICE server config shape used
    /// by WebRTC signalling (`urls: string|string[]`).
    pub urls: IceServerUrls,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceServerUrls {
    Single(String),
    Many(Vec<String>),
}

impl IceServerUrls {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            IceServerUrls::Single(s) => vec![s],
            IceServerUrls::Many(v) => v,
        }
    }
}

/// `start(session_id, sdp_offer, ice_servers, display_index?)` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub session_id: String,
    pub sdp_offer: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub display_index: Option<u32>,
}

/// `start(...)` response: the local SDP answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub sdp_answer: String,
}

/// `add_ice_candidate(session_id, candidate)` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddIceCandidateRequest {
    pub session_id: String,
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// `stop(session_id)` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_server_urls_accepts_single_string() {
        let raw = r#"{"urls":"stun:stun.example.com:3478"}"#;
        let server: IceServer = serde_json::from_str(raw).unwrap();
        assert_eq!(
            server.urls.into_vec(),
            vec!["stun:stun.example.com:3478".to_string()]
        );
    }

    #[test]
    fn ice_server_urls_accepts_array() {
        let raw = r#"{"urls":["turn:a","turn:b"],"username":"u","credential":"p"}"#;
        let server: IceServer = serde_json::from_str(raw).unwrap();
        assert_eq!(server.urls.into_vec().len(), 2);
        assert_eq!(server.username.as_deref(), Some("u"));
    }
}
