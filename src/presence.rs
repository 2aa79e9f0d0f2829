//! Ephemeral presence: who is in the room and what they are doing.
//!
//! The registry keeps the merged local state (the replay cache for
//! reconnects) and one entry per remote client. Entries live only as long
//! as their client is joined; a leave event removes them immediately, so
//! no stale collaborator ever stays visible. Nothing here is persisted.

use std::collections::HashMap;

use crate::protocol::{ClientId, CollaboratorState, ElementId, Point, RoomEvent, UserProfile};

/// Partial update merged into the local collaborator state.
///
/// Unset fields keep their current value; `cursor` distinguishes
/// "unchanged" from an explicit clear.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub user: Option<UserProfile>,
    pub cursor: Option<Option<Point>>,
    pub selection: Option<Vec<ElementId>>,
}

impl StatePatch {
    pub fn cursor(position: Point) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    pub fn clear_cursor() -> Self {
        Self {
            cursor: Some(None),
            ..Self::default()
        }
    }

    pub fn selection(elements: Vec<ElementId>) -> Self {
        Self {
            selection: Some(elements),
            ..Self::default()
        }
    }

    pub fn user(user: UserProfile) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, position: Point) -> Self {
        self.cursor = Some(Some(position));
        self
    }

    pub fn with_selection(mut self, elements: Vec<ElementId>) -> Self {
        self.selection = Some(elements);
        self
    }
}

/// Presence state for one room, keyed by client id.
pub struct PresenceRegistry {
    local_id: ClientId,
    /// Merged local state; doubles as the replay cache broadcast again
    /// after every reconnect, since the transport retains nothing across
    /// a dropped session.
    local_state: Option<CollaboratorState>,
    peers: HashMap<ClientId, CollaboratorState>,
}

impl PresenceRegistry {
    pub fn new(local_id: ClientId, user: UserProfile) -> Self {
        Self {
            local_id,
            local_state: Some(CollaboratorState::new(user)),
            peers: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    pub fn local_state(&self) -> Option<&CollaboratorState> {
        self.local_state.as_ref()
    }

    /// Merge a patch into the local state and build the awareness
    /// broadcast announcing it.
    pub fn set_local_state(&mut self, patch: StatePatch) -> RoomEvent {
        let state = self.local_state.get_or_insert_with(|| {
            // Cleared earlier; restart from the patch's profile or a blank one
            let user = patch
                .user
                .clone()
                .unwrap_or_else(|| UserProfile::new(String::new()));
            CollaboratorState::new(user)
        });

        if let Some(user) = patch.user {
            state.user = user;
        }
        if let Some(cursor) = patch.cursor {
            state.cursor = cursor;
        }
        if let Some(selection) = patch.selection {
            state.selection = selection;
        }

        RoomEvent::Awareness {
            client_id: self.local_id,
            state: Some(state.clone()),
        }
    }

    /// Clear the local state and build the null broadcast that removes
    /// our entry on every peer.
    pub fn clear_local_state(&mut self) -> RoomEvent {
        self.local_state = None;
        RoomEvent::Awareness {
            client_id: self.local_id,
            state: None,
        }
    }

    /// The broadcast to replay after a reconnect, if any state is cached.
    pub fn replay_event(&self) -> Option<RoomEvent> {
        self.local_state.as_ref().map(|state| RoomEvent::Awareness {
            client_id: self.local_id,
            state: Some(state.clone()),
        })
    }

    /// Merge a remote awareness broadcast. Returns true when the peer map
    /// changed (self-echoes never change it).
    pub fn apply_remote(&mut self, client_id: ClientId, state: Option<CollaboratorState>) -> bool {
        if client_id == self.local_id {
            return false;
        }
        match state {
            Some(state) => {
                self.peers.insert(client_id, state);
                true
            }
            None => self.peers.remove(&client_id).is_some(),
        }
    }

    /// Remove entries for clients that left. Returns true when any entry
    /// was removed.
    pub fn remove_peers(&mut self, keys: &[ClientId]) -> bool {
        let mut changed = false;
        for key in keys {
            changed |= self.peers.remove(key).is_some();
        }
        changed
    }

    /// Drop all remote entries. Used when our own session is lost and we
    /// can no longer observe leaves.
    pub fn clear_peers(&mut self) -> bool {
        if self.peers.is_empty() {
            return false;
        }
        self.peers.clear();
        true
    }

    /// Snapshot of all remote collaborators, excluding self.
    pub fn collaborators(&self) -> Vec<CollaboratorState> {
        self.peers.values().cloned().collect()
    }

    /// Snapshot of the full peer map, keyed by client id.
    pub fn peer_map(&self) -> HashMap<ClientId, CollaboratorState> {
        self.peers.clone()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.peers.contains_key(&client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(ClientId::new(1), UserProfile::new("Alice"))
    }

    fn remote_state(name: &str) -> CollaboratorState {
        CollaboratorState::new(UserProfile::new(name))
    }

    #[test]
    fn test_set_cursor_broadcasts_merged_state() {
        let mut presence = registry();

        let event = presence.set_local_state(StatePatch::cursor(Point::new(1.0, 2.0)));
        match event {
            RoomEvent::Awareness { client_id, state: Some(state) } => {
                assert_eq!(client_id, ClientId::new(1));
                assert_eq!(state.cursor, Some(Point::new(1.0, 2.0)));
                assert_eq!(state.user.display_name, "Alice");
            }
            other => panic!("Expected Awareness, got {other:?}"),
        }
    }

    #[test]
    fn test_patch_merge_keeps_unset_fields() {
        let mut presence = registry();
        let selection = vec![Uuid::new_v4()];

        presence.set_local_state(StatePatch::cursor(Point::new(5.0, 5.0)));
        presence.set_local_state(StatePatch::selection(selection.clone()));

        let state = presence.local_state().unwrap();
        assert_eq!(state.cursor, Some(Point::new(5.0, 5.0)));
        assert_eq!(state.selection, selection);
    }

    #[test]
    fn test_clear_cursor_is_explicit() {
        let mut presence = registry();
        presence.set_local_state(StatePatch::cursor(Point::new(5.0, 5.0)));
        presence.set_local_state(StatePatch::clear_cursor());

        assert_eq!(presence.local_state().unwrap().cursor, None);
    }

    #[test]
    fn test_clear_local_state_broadcasts_null() {
        let mut presence = registry();
        presence.set_local_state(StatePatch::cursor(Point::new(1.0, 1.0)));

        let event = presence.clear_local_state();
        assert!(matches!(
            event,
            RoomEvent::Awareness { state: None, .. }
        ));
        assert!(presence.local_state().is_none());
        assert!(presence.replay_event().is_none());
    }

    #[test]
    fn test_replay_event_matches_cache() {
        let mut presence = registry();
        presence.set_local_state(StatePatch::cursor(Point::new(1.0, 2.0)));

        match presence.replay_event() {
            Some(RoomEvent::Awareness { state: Some(state), .. }) => {
                assert_eq!(state.cursor, Some(Point::new(1.0, 2.0)));
            }
            other => panic!("Expected cached awareness, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_upsert_and_remove() {
        let mut presence = registry();
        let peer = ClientId::new(7);

        assert!(presence.apply_remote(peer, Some(remote_state("Bob"))));
        assert!(presence.contains(peer));

        assert!(presence.apply_remote(peer, None));
        assert!(!presence.contains(peer));
    }

    #[test]
    fn test_self_echo_ignored() {
        let mut presence = registry();
        let changed = presence.apply_remote(ClientId::new(1), Some(remote_state("Me?")));

        assert!(!changed);
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_leave_removes_entry_without_awareness_broadcast() {
        let mut presence = registry();
        let peer = ClientId::new(7);
        presence.apply_remote(peer, Some(remote_state("Bob")));

        assert!(presence.remove_peers(&[peer]));
        assert!(presence.collaborators().is_empty());
    }

    #[test]
    fn test_remove_unknown_peer_is_noop() {
        let mut presence = registry();
        assert!(!presence.remove_peers(&[ClientId::new(99)]));
    }

    #[test]
    fn test_collaborators_excludes_self() {
        let mut presence = registry();
        presence.set_local_state(StatePatch::cursor(Point::new(0.0, 0.0)));
        presence.apply_remote(ClientId::new(2), Some(remote_state("Bob")));

        let collaborators = presence.collaborators();
        assert_eq!(collaborators.len(), 1);
        assert_eq!(collaborators[0].user.display_name, "Bob");
    }

    #[test]
    fn test_clear_peers() {
        let mut presence = registry();
        presence.apply_remote(ClientId::new(2), Some(remote_state("Bob")));
        presence.apply_remote(ClientId::new(3), Some(remote_state("Eve")));

        assert!(presence.clear_peers());
        assert_eq!(presence.peer_count(), 0);
        assert!(!presence.clear_peers());
    }
}
