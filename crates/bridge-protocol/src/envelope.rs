//! Signaling wire envelope: JSON messages exchanged over the cloud
//! signaling WebSocket, discriminated by `messageType`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// ICE server entry in the "full" shape: `{URLs, Username?, Credential?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerEntry {
    #[serde(rename = "URLs")]
    pub urls: Vec<String>,
    #[serde(rename = "Username", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "Credential", skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Legacy ICE config shape: a single STUN URL, a single TURN URL, and one
/// set of long-term credentials shared by the TURN entry.
#[derive(Debug, Clone, Deserialize)]
struct LegacyIceServerInfo {
    #[serde(rename = "Stun")]
    stun: String,
    #[serde(rename = "Turn")]
    turn: String,
    #[serde(rename = "Credentials")]
    credentials: LegacyCredentials,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyCredentials {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Password")]
    password: String,
}

/// `{ICEServers: [...]}` list shape.
#[derive(Debug, Clone, Deserialize)]
struct FullIceServerInfo {
    #[serde(rename = "ICEServers")]
    ice_servers: Vec<IceServerEntry>,
}

/// Tolerant parse of the `iceServerInfo` payload: accepts either the full
/// `{ICEServers:[...]}` shape or the legacy `{Stun,Turn,Credentials}` shape,
/// expanding the latter into two entries.
pub fn parse_ice_server_info(value: &serde_json::Value) -> Result<Vec<IceServerEntry>, ParseError> {
    if let Ok(full) = serde_json::from_value::<FullIceServerInfo>(value.clone()) {
        return Ok(full.ice_servers);
    }
    if let Ok(legacy) = serde_json::from_value::<LegacyIceServerInfo>(value.clone()) {
        return Ok(vec![
            IceServerEntry { urls: vec![legacy.stun], username: None, credential: None },
            IceServerEntry {
                urls: vec![legacy.turn],
                username: Some(legacy.credentials.username),
                credential: Some(legacy.credentials.password),
            },
        ]);
    }
    Err(ParseError::Malformed("iceServerInfo matched neither known shape".into()))
}

/// SDP session description, `{sdp, type}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

/// The caller's identity for a peer-connection offer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerType {
    pub peer_connection_id: String,
    pub is_primary: bool,
    pub browsing_context_id: String,
}

/// Inbound signaling messages, recognized by `messageType`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "messageType")]
pub enum InboundEnvelope {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "iceServerInfo")]
    IceServerInfo { #[serde(rename = "iceServerInfo")] ice_server_info: serde_json::Value },
    #[serde(rename = "offer")]
    Offer {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: String,
        #[serde(rename = "isPrimary")]
        is_primary: bool,
        #[serde(rename = "browsingContextId")]
        browsing_context_id: String,
        offer: SessionDescriptionPayload,
    },
    #[serde(rename = "canOffer")]
    CanOffer {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: String,
        #[serde(rename = "isPrimary")]
        is_primary: bool,
        #[serde(rename = "browsingContextId")]
        browsing_context_id: String,
    },
    #[serde(rename = "close")]
    Close {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: String,
        #[serde(rename = "isPrimary")]
        is_primary: bool,
    },
}

impl InboundEnvelope {
    /// Parse a raw WebSocket text frame. Unrecognized `messageType` values
    /// and structurally invalid payloads both yield `ParseError` — callers
    /// log and continue rather than treat this as fatal.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        // Validate the discriminator exists before deferring to serde so an
        // unknown messageType produces `Unknown` instead of a generic serde error.
        let raw: HashMap<String, serde_json::Value> =
            serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let message_type = raw
            .get("messageType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::Malformed("missing messageType".into()))?
            .to_string();

        serde_json::from_str(text).map_err(|e| match message_type.as_str() {
            "ping" | "iceServerInfo" | "offer" | "canOffer" | "close" => ParseError::Malformed(e.to_string()),
            other => ParseError::UnknownType(other.to_string()),
        })
    }

    /// Extract the peer identity from an `Offer` or `CanOffer` envelope.
    pub fn to_peer_type(&self) -> Option<PeerType> {
        match self {
            InboundEnvelope::Offer { peer_connection_id, is_primary, browsing_context_id, .. }
            | InboundEnvelope::CanOffer { peer_connection_id, is_primary, browsing_context_id, .. } => {
                Some(PeerType {
                    peer_connection_id: peer_connection_id.clone(),
                    is_primary: *is_primary,
                    browsing_context_id: browsing_context_id.clone(),
                })
            }
            _ => None,
        }
    }

    /// Re-marshal the nested `offer` field of an `Offer` envelope into an SDP payload.
    pub fn to_session_description(&self) -> Option<&SessionDescriptionPayload> {
        match self {
            InboundEnvelope::Offer { offer, .. } => Some(offer),
            _ => None,
        }
    }
}

/// Outbound signaling messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "messageType")]
pub enum OutboundEnvelope {
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: String,
        err: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        answer: Option<SessionDescriptionPayload>,
    },
    #[serde(rename = "canOffer")]
    CanOffer {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: String,
        state: String,
    },
}

impl OutboundEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("OutboundEnvelope always serializes")
    }

    pub fn success_answer(peer_connection_id: impl Into<String>, sdp: String) -> Self {
        OutboundEnvelope::Answer {
            peer_connection_id: peer_connection_id.into(),
            err: false,
            state: None,
            answer: Some(SessionDescriptionPayload { sdp, sdp_type: "answer".to_string() }),
        }
    }

    pub fn failing_answer(peer_connection_id: impl Into<String>, state: impl Into<String>) -> Self {
        OutboundEnvelope::Answer {
            peer_connection_id: peer_connection_id.into(),
            err: true,
            state: Some(state.into()),
            answer: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown messageType: {0}")]
    UnknownType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ping() {
        let env = InboundEnvelope::parse(r#"{"messageType":"ping"}"#).unwrap();
        assert!(matches!(env, InboundEnvelope::Ping));
    }

    #[test]
    fn parse_unknown_type_is_non_fatal() {
        let err = InboundEnvelope::parse(r#"{"messageType":"frobnicate"}"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownType(t) if t == "frobnicate"));
    }

    #[test]
    fn parse_malformed_offer_is_non_fatal() {
        let err = InboundEnvelope::parse(r#"{"messageType":"offer","peerConnectionId":"A"}"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn to_peer_type_extracts_offer_fields() {
        let json = r#"{"messageType":"offer","peerConnectionId":"A","isPrimary":true,"browsingContextId":"ctx-1","offer":{"sdp":"v=0","type":"offer"}}"#;
        let env = InboundEnvelope::parse(json).unwrap();
        let pt = env.to_peer_type().unwrap();
        assert_eq!(pt.peer_connection_id, "A");
        assert!(pt.is_primary);
        assert_eq!(pt.browsing_context_id, "ctx-1");
        assert_eq!(env.to_session_description().unwrap().sdp, "v=0");
    }

    #[test]
    fn ice_server_info_full_shape() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"ICEServers":[{"URLs":["stun:stun.example.com:19302"]}]}"#,
        )
        .unwrap();
        let servers = parse_ice_server_info(&value).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls[0], "stun:stun.example.com:19302");
    }

    #[test]
    fn ice_server_info_legacy_shape_expands_to_two_entries() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"Stun":"stun:stun.example.com:19302","Turn":"turn:turn.example.com:3478","Credentials":{"Username":"u","Password":"p"}}"#,
        )
        .unwrap();
        let servers = parse_ice_server_info(&value).unwrap();
        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_none());
        assert_eq!(servers[1].username.as_deref(), Some("u"));
        assert_eq!(servers[1].credential.as_deref(), Some("p"));
    }

    #[test]
    fn outbound_pong_serializes() {
        assert_eq!(OutboundEnvelope::Pong.to_json(), r#"{"messageType":"pong"}"#);
    }

    #[test]
    fn outbound_failing_answer_carries_state() {
        let env = OutboundEnvelope::failing_answer("A", "OBSOLETE");
        let json = env.to_json();
        assert!(json.contains(r#""err":true"#));
        assert!(json.contains(r#""state":"OBSOLETE""#));
    }

    #[test]
    fn outbound_success_answer_envelope_roundtrips_to_session_description() {
        let env = OutboundEnvelope::success_answer("A", "v=0\r\n".to_string());
        let json = env.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["answer"]["type"], "answer");
        assert_eq!(value["err"], false);
    }
}
