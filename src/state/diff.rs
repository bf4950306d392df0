//! Snapshot reconciliation.
//!
//! Compares two snapshots of the same session and derives the change
//! events a refresh should publish.

use std::collections::BTreeSet;

use crate::events::SessionEvent;

use super::session::{DataMap, ParticipantId, Session};

/// Changes between two snapshots of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub left: Vec<ParticipantId>,
    pub joined: Vec<ParticipantId>,
    /// `(participant, key, old, new)` for members present in both snapshots
    pub participant_data: Vec<(ParticipantId, String, Option<String>, Option<String>)>,
    /// `(key, old, new)`
    pub shared_data: Vec<(String, Option<String>, Option<String>)>,
    /// New host, if it changed
    pub new_host: Option<ParticipantId>,
}

impl SnapshotDiff {
    /// Diff `old` against `new`. Joined/left follow `new`'s join order and
    /// `old`'s join order respectively.
    pub fn between(old: &Session, new: &Session) -> Self {
        let old_ids: BTreeSet<&ParticipantId> = old.participant_ids().collect();
        let new_ids: BTreeSet<&ParticipantId> = new.participant_ids().collect();

        let left = old
            .participant_ids()
            .filter(|id| !new_ids.contains(id))
            .cloned()
            .collect();
        let joined = new
            .participant_ids()
            .filter(|id| !old_ids.contains(id))
            .cloned()
            .collect();

        let mut participant_data = Vec::new();
        for after in &new.participants {
            if let Some(before) = old.participant(&after.id) {
                for (key, old_value, new_value) in diff_data(&before.data, &after.data) {
                    participant_data.push((after.id.clone(), key, old_value, new_value));
                }
            }
        }

        let new_host = (old.host_id != new.host_id).then(|| new.host_id.clone());

        Self {
            left,
            joined,
            participant_data,
            shared_data: diff_data(&old.shared_data, &new.shared_data),
            new_host,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
            && self.joined.is_empty()
            && self.participant_data.is_empty()
            && self.shared_data.is_empty()
            && self.new_host.is_none()
    }

    /// Events in publish order: departures, arrivals, participant data,
    /// shared data, host change.
    pub fn into_events(self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        events.extend(self.left.into_iter().map(SessionEvent::ParticipantLeft));
        events.extend(self.joined.into_iter().map(SessionEvent::ParticipantJoined));
        events.extend(self.participant_data.into_iter().map(
            |(participant_id, key, old_value, new_value)| SessionEvent::ParticipantDataChanged {
                participant_id,
                key,
                old_value,
                new_value,
            },
        ));
        events.extend(
            self.shared_data
                .into_iter()
                .map(|(key, old_value, new_value)| SessionEvent::SharedDataChanged {
                    key,
                    old_value,
                    new_value,
                }),
        );
        if let Some(host) = self.new_host {
            events.push(SessionEvent::HostMigrated(host));
        }
        events
    }
}

/// Key-by-key comparison. A visibility change with an unchanged value is
/// still reported so scoped readers can re-fetch.
fn diff_data(old: &DataMap, new: &DataMap) -> Vec<(String, Option<String>, Option<String>)> {
    let keys: BTreeSet<&str> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|key| old.get(key) != new.get(key))
        .map(|key| {
            (
                key.to_string(),
                old.value(key).map(str::to_string),
                new.value(key).map(str::to_string),
            )
        })
        .collect()
}
