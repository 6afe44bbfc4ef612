//! Primary/audience peer bookkeeping: one primary, N audiences, and
//! obsolete-browsing-context tracking across displacement.

use drone_bridge_protocol::PeerType;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Empty,
    Same,
    Exist,
    Obsolete,
}

pub struct AudienceInfo {
    pub stop_signal: Arc<Notify>,
}

impl AudienceInfo {
    fn new() -> Self {
        Self { stop_signal: Arc::new(Notify::new()) }
    }
}

/// Mutations are serialized by holding `&mut self` through an outer mutex
/// owned by the caller (the signaling session's offer-mutex).
#[derive(Default)]
pub struct PeerRegistry {
    primary: Option<String>,
    last_primary_browsing_context: Option<String>,
    audiences: HashMap<String, AudienceInfo>,
    obsolete_browsing_contexts: HashSet<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_obsolete(&self, browsing_context_id: &str) -> bool {
        self.obsolete_browsing_contexts.contains(browsing_context_id)
    }

    pub fn mark_obsolete(&mut self, browsing_context_id: String) {
        self.obsolete_browsing_contexts.insert(browsing_context_id);
    }

    /// `DecidePeerState` — the only place that may displace a primary.
    /// Returns the resulting state and, if a primary was displaced, its
    /// browsing-context id (the caller adds it to the obsolete set).
    pub fn decide(&mut self, peer: &PeerType) -> (PeerState, Option<String>) {
        if peer.is_primary {
            match &self.primary {
                None => {
                    self.primary = Some(peer.peer_connection_id.clone());
                    self.last_primary_browsing_context = Some(peer.browsing_context_id.clone());
                    (PeerState::Empty, None)
                }
                Some(current) if *current == peer.peer_connection_id => (PeerState::Same, None),
                Some(_) => {
                    let displaced = self.last_primary_browsing_context.clone();
                    self.primary = Some(peer.peer_connection_id.clone());
                    self.last_primary_browsing_context = Some(peer.browsing_context_id.clone());
                    (PeerState::Exist, displaced)
                }
            }
        } else if self.audiences.contains_key(&peer.peer_connection_id) {
            (PeerState::Same, None)
        } else {
            self.audiences.insert(peer.peer_connection_id.clone(), AudienceInfo::new());
            (PeerState::Empty, None)
        }
    }

    pub fn primary_id(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    pub fn audience_ids(&self) -> impl Iterator<Item = &str> {
        self.audiences.keys().map(String::as_str)
    }

    pub fn audience(&self, id: &str) -> Option<&AudienceInfo> {
        self.audiences.get(id)
    }

    pub fn audience_stop_signal(&self, id: &str) -> Option<Arc<Notify>> {
        self.audiences.get(id).map(|info| Arc::clone(&info.stop_signal))
    }

    /// `SendAudienceStop`: closes the per-audience stop signal without removing it.
    pub fn send_audience_stop(&self, id: &str) {
        if let Some(info) = self.audiences.get(id) {
            info.stop_signal.notify_waiters();
        }
    }

    /// `DeleteAudience`: closes the stop signal and removes the map entry.
    pub fn delete_audience(&mut self, id: &str) {
        if let Some(info) = self.audiences.remove(id) {
            info.stop_signal.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, primary: bool, ctx: &str) -> PeerType {
        PeerType {
            peer_connection_id: id.to_string(),
            is_primary: primary,
            browsing_context_id: ctx.to_string(),
        }
    }

    #[test]
    fn never_has_two_primaries_simultaneously() {
        let mut reg = PeerRegistry::new();
        let (s1, _) = reg.decide(&peer("A", true, "ctx-a"));
        assert_eq!(s1, PeerState::Empty);
        assert_eq!(reg.primary_id(), Some("A"));

        let (s2, displaced) = reg.decide(&peer("B", true, "ctx-b"));
        assert_eq!(s2, PeerState::Exist);
        assert_eq!(displaced.as_deref(), Some("ctx-a"));
        assert_eq!(reg.primary_id(), Some("B"));
    }

    #[test]
    fn repeat_offer_from_same_primary_is_same() {
        let mut reg = PeerRegistry::new();
        reg.decide(&peer("A", true, "ctx-a"));
        let (state, displaced) = reg.decide(&peer("A", true, "ctx-a"));
        assert_eq!(state, PeerState::Same);
        assert!(displaced.is_none());
    }

    #[test]
    fn audience_empty_then_same() {
        let mut reg = PeerRegistry::new();
        let (s1, _) = reg.decide(&peer("A1", false, "ctx-1"));
        assert_eq!(s1, PeerState::Empty);
        let (s2, _) = reg.decide(&peer("A1", false, "ctx-1"));
        assert_eq!(s2, PeerState::Same);
    }

    #[test]
    fn delete_audience_removes_and_notifies() {
        let mut reg = PeerRegistry::new();
        reg.decide(&peer("A1", false, "ctx-1"));
        assert!(reg.audience("A1").is_some());
        reg.delete_audience("A1");
        assert!(reg.audience("A1").is_none());
    }

    #[test]
    fn obsolete_browsing_context_is_tracked() {
        let mut reg = PeerRegistry::new();
        assert!(!reg.is_obsolete("ctx-a"));
        reg.mark_obsolete("ctx-a".to_string());
        assert!(reg.is_obsolete("ctx-a"));
    }
}
