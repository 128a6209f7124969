//! Room roster: the single source of truth for which peers may be
//! (re)connected.

use peerdrop_discovery::{Member, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared view of the current room membership, excluding the local peer.
///
/// Cloning yields another handle to the same roster.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: Arc<RwLock<HashMap<PeerId, Member>>>,
}

impl Roster {
    /// Create an empty roster
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `peer` is currently present
    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.members.read().await.contains_key(peer)
    }

    /// Add or refresh a member. Returns true if the member is new.
    pub async fn insert(&self, member: Member) -> bool {
        self.members
            .write()
            .await
            .insert(member.id.clone(), member)
            .is_none()
    }

    /// Remove a member. Returns the removed entry.
    pub async fn remove(&self, peer: &PeerId) -> Option<Member> {
        self.members.write().await.remove(peer)
    }

    /// Replace the whole roster, skipping `local`. Returns the ids that
    /// were removed.
    pub async fn replace(&self, members: Vec<Member>, local: &PeerId) -> Vec<PeerId> {
        let mut current = self.members.write().await;
        let next: HashMap<PeerId, Member> = members
            .into_iter()
            .filter(|member| &member.id != local)
            .map(|member| (member.id.clone(), member))
            .collect();
        let removed = current
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        *current = next;
        removed
    }

    /// Current member ids
    pub async fn ids(&self) -> Vec<PeerId> {
        self.members.read().await.keys().cloned().collect()
    }

    /// Current members
    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    /// Number of members
    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether the roster is empty
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}
