use std::collections::BTreeMap;

use crate::player::{PlaybackStatus, PlayerId, PlayerRecord};

#[derive(Debug, Default)]
struct Entry {
    status: PlaybackStatus,
    identity: Option<String>,
}

/// Known players and the last status observed for each.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: BTreeMap<PlayerId, Entry>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a whole record, identity included.
    pub fn insert(&mut self, record: PlayerRecord) {
        self.players.insert(
            record.id,
            Entry {
                status: record.status,
                identity: record.identity,
            },
        );
    }

    /// Sets the status, keeping whatever identity is already known.
    pub fn upsert(&mut self, id: PlayerId, status: PlaybackStatus) {
        self.players.entry(id).or_default().status = status;
    }

    /// Vanish events can race a previous removal, so a missing id is fine.
    pub fn remove(&mut self, id: &PlayerId) -> Option<PlaybackStatus> {
        self.players.remove(id).map(|entry| entry.status)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &PlayerId) -> bool {
        self.players.contains_key(id)
    }

    pub fn status(&self, id: &PlayerId) -> Option<PlaybackStatus> {
        self.players.get(id).map(|entry| entry.status)
    }

    pub fn any_playing(&self) -> bool {
        self.players.values().any(|entry| entry.status.is_playing())
    }

    /// Display names of the players currently reported as playing.
    pub fn playing(&self) -> impl Iterator<Item = &str> {
        self.players
            .iter()
            .filter(|(_, entry)| entry.status.is_playing())
            .map(|(id, entry)| entry.identity.as_deref().unwrap_or_else(|| id.short_name()))
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Records ordered by player id.
    pub fn snapshot(&self) -> Vec<PlayerRecord> {
        self.players
            .iter()
            .map(|(id, entry)| PlayerRecord {
                id: id.clone(),
                status: entry.status,
                identity: entry.identity.clone(),
            })
            .collect()
    }
}

impl FromIterator<PlayerRecord> for PlayerRegistry {
    fn from_iter<I: IntoIterator<Item = PlayerRecord>>(iter: I) -> Self {
        let mut registry = Self::new();
        for record in iter {
            registry.insert(record);
        }
        registry
    }
}
