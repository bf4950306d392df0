//! Session snapshot data model.
//!
//! A session is one matchmaking lobby as last reported by the session
//! service. Snapshots are never edited in place once cached: a newer
//! snapshot replaces the old one wholesale.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque session identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// Participant identity; equals the authenticated client identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(SessionId);
string_id!(ParticipantId);

/// Who can read a data entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to anyone, including lobby browsers
    #[default]
    Public,
    /// Visible to session members only
    Member,
}

/// A single scoped value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub value: String,
    pub visibility: Visibility,
}

impl DataEntry {
    pub fn new(value: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            value: value.into(),
            visibility,
        }
    }

    pub fn public(value: impl Into<String>) -> Self {
        Self::new(value, Visibility::Public)
    }

    pub fn member(value: impl Into<String>) -> Self {
        Self::new(value, Visibility::Member)
    }
}

/// Wire shape of a data map: one flat string map per visibility scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireData {
    #[serde(default)]
    pub public: BTreeMap<String, String>,
    #[serde(default)]
    pub member: BTreeMap<String, String>,
}

/// Key/value data with a visibility per key. Keys are unique across scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataMap {
    entries: BTreeMap<String, DataEntry>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>, visibility: Visibility) -> Self {
        self.insert(key, DataEntry::new(value, visibility));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: DataEntry) -> Option<DataEntry> {
        self.entries.insert(key.into(), entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<DataEntry> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&DataEntry> {
        self.entries.get(key)
    }

    /// Raw string value for a key.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    /// Parse a value into a richer type. Callers serialize such values
    /// themselves when writing.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.value(key).and_then(|v| v.parse().ok())
    }

    /// Read a boolean flag; accepts `true`/`false` and `1`/`0`.
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.value(key)? {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries visible at the given scope only.
    pub fn scoped(&self, visibility: Visibility) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.visibility == visibility)
            .map(|(k, e)| (k.as_str(), e.value.as_str()))
    }

    /// Apply a last-writer-wins patch.
    pub fn apply_patch(&mut self, patch: &DataPatch) {
        for (key, change) in &patch.changes {
            match change {
                Some(entry) => {
                    self.entries.insert(key.clone(), entry.clone());
                }
                None => {
                    self.entries.remove(key);
                }
            }
        }
    }

    /// Build from the wire representation. A key present in both scopes
    /// keeps the member-scoped value.
    pub fn from_wire(wire: &WireData) -> Self {
        let mut map = Self::new();
        for (k, v) in &wire.public {
            map.insert(k.clone(), DataEntry::public(v.clone()));
        }
        for (k, v) in &wire.member {
            map.insert(k.clone(), DataEntry::member(v.clone()));
        }
        map
    }

    pub fn to_wire(&self) -> WireData {
        let mut wire = WireData::default();
        for (key, entry) in &self.entries {
            let scope = match entry.visibility {
                Visibility::Public => &mut wire.public,
                Visibility::Member => &mut wire.member,
            };
            scope.insert(key.clone(), entry.value.clone());
        }
        wire
    }
}

impl FromIterator<(String, DataEntry)> for DataMap {
    fn from_iter<I: IntoIterator<Item = (String, DataEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Set/remove operations merged into a data map, last writer wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPatch {
    changes: BTreeMap<String, Option<DataEntry>>,
}

impl DataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>, visibility: Visibility) -> Self {
        self.changes
            .insert(key.into(), Some(DataEntry::new(value, visibility)));
        self
    }

    #[must_use]
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.changes.insert(key.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changes(&self) -> impl Iterator<Item = (&str, Option<&DataEntry>)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }
}

/// A client's membership record within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,

    /// Per-participant data (ready flag, team, display name, ...)
    #[serde(default)]
    pub data: DataMap,

    /// When the service accepted this participant
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(id: ParticipantId, data: DataMap) -> Self {
        Self {
            id,
            data,
            joined_at: Utc::now(),
        }
    }

    /// Display name, if the participant published one under `name`.
    pub fn display_name(&self) -> Option<&str> {
        self.data.value("name")
    }
}

/// One matchmaking lobby as reported by the session service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Short shareable code, stable for the session's lifetime
    pub join_code: String,

    /// Current authoritative participant
    pub host_id: ParticipantId,

    /// Service-supplied counter, bumped on every change
    pub version: u64,

    pub name: String,
    pub max_participants: usize,
    pub is_private: bool,

    #[serde(default)]
    pub shared_data: DataMap,

    /// Members in join order
    pub participants: Vec<Participant>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Get a participant by id.
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    /// Check if a participant is a member.
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }

    /// Check if a participant is the host.
    pub fn is_host(&self, id: &ParticipantId) -> bool {
        &self.host_id == id
    }

    /// Participant ids in join order.
    pub fn participant_ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.participants.iter().map(|p| &p.id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    pub fn available_slots(&self) -> usize {
        self.max_participants.saturating_sub(self.participants.len())
    }

    /// Whether `host_id` names a current member. False only while the
    /// service is migrating the host.
    pub fn has_valid_host(&self) -> bool {
        self.contains(&self.host_id)
    }

    /// Check if a newer snapshot may replace this one.
    pub fn is_superseded_by(&self, other: &Session) -> bool {
        other.id == self.id && other.version >= self.version
    }

    /// Convert to JSON for UI layers.
    pub fn to_json(&self) -> serde_json::Value {
        let participants: Vec<serde_json::Value> = self
            .participants
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id.as_str(),
                    "is_host": self.is_host(&p.id),
                    "data": p.data.to_wire(),
                    "joined_at": p.joined_at.to_rfc3339(),
                })
            })
            .collect();

        serde_json::json!({
            "session_id": self.id.as_str(),
            "join_code": self.join_code,
            "name": self.name,
            "host_id": self.host_id.as_str(),
            "version": self.version,
            "is_private": self.is_private,
            "max_participants": self.max_participants,
            "available_slots": self.available_slots(),
            "shared_data": self.shared_data.to_wire(),
            "participants": participants,
        })
    }
}

/// Filter for browsing sessions. Evaluated by the session service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuery {
    /// Case-insensitive substring of the session name
    pub name_contains: Option<String>,

    /// Skip sessions with no free slot
    pub open_only: bool,

    /// Include private sessions (normally hidden from browsing)
    pub include_private: bool,

    /// Public shared data that must match exactly
    pub shared_equals: BTreeMap<String, String>,
}

impl SessionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name_contains(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    #[must_use]
    pub fn open_only(mut self) -> Self {
        self.open_only = true;
        self
    }

    #[must_use]
    pub fn include_private(mut self) -> Self {
        self.include_private = true;
        self
    }

    #[must_use]
    pub fn shared_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.shared_equals.insert(key.into(), value.into());
        self
    }

    /// Check whether a session passes this filter.
    pub fn matches(&self, session: &Session) -> bool {
        if session.is_private && !self.include_private {
            return false;
        }
        if self.open_only && session.is_full() {
            return false;
        }
        if let Some(needle) = &self.name_contains {
            if !session
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        self.shared_equals.iter().all(|(key, expected)| {
            session
                .shared_data
                .get(key)
                .is_some_and(|e| e.visibility == Visibility::Public && &e.value == expected)
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn participant(id: &str) -> Participant {
        Participant::new(
            ParticipantId::from(id),
            DataMap::new().with("name", id, Visibility::Public),
        )
    }

    pub fn session(host: &str, members: &[&str]) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::from("session-1"),
            join_code: "ABC123".to_string(),
            host_id: ParticipantId::from(host),
            version: 1,
            name: "Arena".to_string(),
            max_participants: 4,
            is_private: false,
            shared_data: DataMap::new(),
            participants: members.iter().map(|m| participant(m)).collect(),
            created_at: now,
            updated_at: now,
        }
    }
}
