//! Error taxonomy mirroring the classes in the error-handling design: most
//! variants are logged at their boundary and never propagate past a single
//! loop iteration. Only `ConfigurationFatal` is allowed to end the process,
//! and only at startup, before any routine is spawned.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("signaling transport error: {0}")]
    TransportWs(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("retry budget exhausted")]
    RetryExhausted,

    #[error("drone starvation: no video or flight data within the health-check window")]
    DroneStarvation,

    #[error("peer displaced: {0}")]
    PeerDisplaced(String),

    #[error("peer obsolete: browsing context {0} was already displaced")]
    PeerObsolete(String),

    #[error("configuration error: {0}")]
    ConfigurationFatal(String),
}

impl BridgeError {
    /// The `state` string carried in a failing `answer` envelope.
    pub fn as_peer_state(&self) -> Option<&'static str> {
        match self {
            BridgeError::PeerDisplaced(_) => Some("EXIST"),
            BridgeError::PeerObsolete(_) => Some("OBSOLETE"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_state_mapping() {
        assert_eq!(BridgeError::PeerDisplaced("c1".into()).as_peer_state(), Some("EXIST"));
        assert_eq!(BridgeError::PeerObsolete("c1".into()).as_peer_state(), Some("OBSOLETE"));
        assert_eq!(BridgeError::RetryExhausted.as_peer_state(), None);
    }
}
