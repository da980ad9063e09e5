//! Presence reconciliation.
//!
//! The server tracks who is present on a topic as a map from presence key
//! (usually a user id) to a list of metas, one per connection, each
//! identified by its `phx_ref`. Clients receive a full snapshot on join and
//! incremental diffs afterwards, and the two can arrive in either order.
//! [`Presence`] folds both into one local map, deduplicating metas by ref.
//!
//! A leave can name metas that are not known locally yet, because it raced
//! ahead of the snapshot that contains them. Such leaves are dropped: the
//! snapshot is authoritative, and a meta it still lists is present.

use parking_lot::Mutex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::channel::Channel;

/// Default event carrying a full presence snapshot.
pub const STATE_EVENT: &str = "presence_state";

/// Default event carrying a presence diff.
pub const DIFF_EVENT: &str = "presence_diff";

/// Metadata for one connection under a presence key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Unique reference of this meta; its identity for reconciliation.
    #[serde(rename = "phx_ref")]
    pub reference: String,
    /// Application fields.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Meta {
    /// Create a meta. Non-object `data` is ignored.
    pub fn new(reference: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            reference: reference.into(),
            data,
        }
    }
}

/// Every meta under one presence key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub metas: Vec<Meta>,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(metas: Vec<Meta>) -> Self {
        Self { metas }
    }

    /// Whether a meta with `reference` is present.
    #[must_use]
    pub fn contains(&self, reference: &str) -> bool {
        self.metas.iter().any(|meta| meta.reference == reference)
    }

    /// Refs of every meta, in order.
    pub fn refs(&self) -> impl Iterator<Item = &str> {
        self.metas.iter().map(|meta| meta.reference.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Metas of `self` whose ref does not appear in `other`.
    fn only_new(&self, other: &PresenceEntry) -> Vec<Meta> {
        let known: HashSet<&str> = other.refs().collect();
        self.metas
            .iter()
            .filter(|meta| !known.contains(meta.reference.as_str()))
            .cloned()
            .collect()
    }
}

/// Presence map, keyed by presence key, in insertion order.
///
/// Equality compares content and ignores key order.
#[derive(Debug, Clone, Default)]
pub struct PresenceState {
    keys: Vec<String>,
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a map as sent by the server.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a map of `{metas: [...]}` entries.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PresenceEntry> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace the entry for `key`. A replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, entry: PresenceEntry) -> Option<PresenceEntry> {
        let key = key.into();
        if !self.entries.contains_key(&key) {
            self.keys.push(key.clone());
        }
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<PresenceEntry> {
        let removed = self.entries.remove(key)?;
        self.keys.retain(|k| k != key);
        Some(removed)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PresenceEntry)> {
        self.keys
            .iter()
            .filter_map(|key| self.entries.get(key).map(|entry| (key.as_str(), entry)))
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut PresenceEntry> {
        self.entries.get_mut(key)
    }
}

impl PartialEq for PresenceState {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl FromIterator<(String, PresenceEntry)> for PresenceState {
    fn from_iter<I: IntoIterator<Item = (String, PresenceEntry)>>(iter: I) -> Self {
        let mut state = Self::new();
        for (key, entry) in iter {
            state.insert(key, entry);
        }
        state
    }
}

impl IntoIterator for PresenceState {
    type Item = (String, PresenceEntry);
    type IntoIter = std::vec::IntoIter<(String, PresenceEntry)>;

    fn into_iter(mut self) -> Self::IntoIter {
        self.keys
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry)))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl Serialize for PresenceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, entry) in self.iter() {
            map.serialize_entry(key, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PresenceState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StateVisitor;

        impl<'de> Visitor<'de> for StateVisitor {
            type Value = PresenceState;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of presence entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut state = PresenceState::new();
                while let Some((key, entry)) = access.next_entry::<String, PresenceEntry>()? {
                    state.insert(key, entry);
                }
                Ok(state)
            }
        }

        deserializer.deserialize_map(StateVisitor)
    }
}

/// An incremental presence update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

impl PresenceDiff {
    /// Parse a diff as sent by the server.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a `{joins, leaves}` object.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

type JoinHook = Box<dyn FnMut(&str, Option<&PresenceEntry>, &PresenceEntry) + Send>;
type LeaveHook = Box<dyn FnMut(&str, &PresenceEntry, &PresenceEntry) + Send>;
type ChangeHook = Box<dyn FnMut(&PresenceState, &PresenceState) + Send>;

/// Local replica of a topic's presence map.
#[derive(Default)]
pub struct Presence {
    state: PresenceState,
    join_hooks: Vec<JoinHook>,
    leave_hooks: Vec<LeaveHook>,
    change_hooks: Vec<ChangeHook>,
}

impl Presence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing map, without firing hooks.
    #[must_use]
    pub fn from_state(state: PresenceState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Run `hook(key, previous, joined)` when metas join a key.
    ///
    /// `previous` is the entry before the join, if the key existed; `joined`
    /// holds only the newly added metas.
    pub fn on_join(
        &mut self,
        hook: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + 'static,
    ) {
        self.join_hooks.push(Box::new(hook));
    }

    /// Run `hook(key, remaining, left)` when metas leave a key.
    ///
    /// `remaining` is empty when the key was removed entirely.
    pub fn on_leave(
        &mut self,
        hook: impl FnMut(&str, &PresenceEntry, &PresenceEntry) + Send + 'static,
    ) {
        self.leave_hooks.push(Box::new(hook));
    }

    /// Run `hook(current, previous)` once after every sync.
    pub fn on_change(&mut self, hook: impl FnMut(&PresenceState, &PresenceState) + Send + 'static) {
        self.change_hooks.push(Box::new(hook));
    }

    #[must_use]
    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    /// Reconcile with an authoritative snapshot.
    pub fn sync_state(&mut self, snapshot: PresenceState) {
        let mut joins = PresenceState::new();
        let mut leaves = PresenceState::new();

        for (key, current) in self.state.iter() {
            if !snapshot.contains_key(key) {
                leaves.insert(key, current.clone());
            }
        }
        for (key, incoming) in snapshot {
            match self.state.get(&key) {
                Some(current) => {
                    let joined = incoming.only_new(current);
                    let left = current.only_new(&incoming);
                    if !joined.is_empty() {
                        joins.insert(key.clone(), PresenceEntry::new(joined));
                    }
                    if !left.is_empty() {
                        leaves.insert(key, PresenceEntry::new(left));
                    }
                }
                None => {
                    joins.insert(key, incoming);
                }
            }
        }

        trace!(joins = joins.len(), leaves = leaves.len(), "Presence snapshot diffed");
        self.apply(joins, leaves);
    }

    /// Apply an incremental diff.
    pub fn sync_diff(&mut self, diff: PresenceDiff) {
        self.apply(diff.joins, diff.leaves);
    }

    /// Every entry, in map order.
    #[must_use]
    pub fn list(&self) -> Vec<PresenceEntry> {
        self.state.iter().map(|(_, entry)| entry.clone()).collect()
    }

    /// `chooser(key, entry)` for every entry, in map order.
    pub fn list_by<T>(&self, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        self.state
            .iter()
            .map(|(key, entry)| chooser(key, entry))
            .collect()
    }

    fn apply(&mut self, joins: PresenceState, leaves: PresenceState) {
        let previous = self.state.clone();
        let mut state = previous.clone();

        for (key, incoming) in joins {
            let current = state.get(&key).cloned();
            let added = match &current {
                Some(current) => incoming.only_new(current),
                None => incoming.metas,
            };
            if added.is_empty() {
                continue;
            }

            let joined = PresenceEntry::new(added);
            let mut merged = current.clone().unwrap_or_default();
            merged.metas.extend(joined.metas.iter().cloned());
            state.insert(key.clone(), merged);

            for hook in &mut self.join_hooks {
                hook(&key, current.as_ref(), &joined);
            }
        }

        for (key, left) in leaves {
            let Some(current) = state.get_mut(&key) else {
                trace!(key = %key, "Dropping leave for unknown presence");
                continue;
            };
            let removed: Vec<Meta> = left
                .metas
                .into_iter()
                .filter(|meta| current.contains(&meta.reference))
                .collect();
            if removed.is_empty() {
                continue;
            }

            let gone: HashSet<&str> = removed.iter().map(|meta| meta.reference.as_str()).collect();
            current.metas.retain(|meta| !gone.contains(meta.reference.as_str()));
            let remaining = current.clone();
            if remaining.is_empty() {
                state.remove(&key);
            }

            let removed = PresenceEntry::new(removed);
            for hook in &mut self.leave_hooks {
                hook(&key, &remaining, &removed);
            }
        }

        self.state = state;
        for hook in &mut self.change_hooks {
            hook(&self.state, &previous);
        }
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presence")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A [`Presence`] fed by a channel's presence events.
///
/// Hooks run on the socket task while the presence is locked; they receive
/// everything they need as arguments and must not call back into this handle.
#[derive(Clone)]
pub struct ChannelPresence {
    inner: Arc<Mutex<Presence>>,
}

impl ChannelPresence {
    /// Track `channel` using the `presence_state` and `presence_diff` events.
    pub fn new(channel: &Channel) -> Self {
        Self::with_events(channel, STATE_EVENT, DIFF_EVENT)
    }

    /// Track `channel` using custom event names.
    pub fn with_events(channel: &Channel, state_event: &str, diff_event: &str) -> Self {
        let inner = Arc::new(Mutex::new(Presence::new()));

        let presence = Arc::clone(&inner);
        let topic = channel.topic().to_string();
        channel.on(state_event, move |payload| {
            match PresenceState::from_value(payload) {
                Ok(snapshot) => presence.lock().sync_state(snapshot),
                Err(e) => warn!(topic = %topic, error = %e, "Dropping malformed presence state"),
            }
        });

        let presence = Arc::clone(&inner);
        let topic = channel.topic().to_string();
        channel.on(diff_event, move |payload| match PresenceDiff::from_value(payload) {
            Ok(diff) => presence.lock().sync_diff(diff),
            Err(e) => warn!(topic = %topic, error = %e, "Dropping malformed presence diff"),
        });

        Self { inner }
    }

    pub fn on_join(
        &self,
        hook: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + 'static,
    ) {
        self.inner.lock().on_join(hook);
    }

    pub fn on_leave(&self, hook: impl FnMut(&str, &PresenceEntry, &PresenceEntry) + Send + 'static) {
        self.inner.lock().on_leave(hook);
    }

    pub fn on_change(&self, hook: impl FnMut(&PresenceState, &PresenceState) + Send + 'static) {
        self.inner.lock().on_change(hook);
    }

    /// Snapshot of the current map.
    #[must_use]
    pub fn state(&self) -> PresenceState {
        self.inner.lock().state().clone()
    }

    #[must_use]
    pub fn list(&self) -> Vec<PresenceEntry> {
        self.inner.lock().list()
    }

    pub fn list_by<T>(&self, chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        self.inner.lock().list_by(chooser)
    }
}

impl fmt::Debug for ChannelPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelPresence").field(&*self.inner.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> PresenceState {
        PresenceState::from_value(&value).unwrap()
    }

    fn fixture() -> PresenceState {
        state(json!({
            "u1": {"metas": [{"id": 1, "phx_ref": "1"}]},
            "u2": {"metas": [{"id": 2, "phx_ref": "2"}]},
            "u3": {"metas": [{"id": 3, "phx_ref": "3"}]}
        }))
    }

    #[test]
    fn test_state_keeps_insertion_order() {
        let mut s = PresenceState::new();
        s.insert("b", PresenceEntry::default());
        s.insert("a", PresenceEntry::default());
        s.insert("c", PresenceEntry::default());
        s.insert("b", PresenceEntry::new(vec![Meta::new("1", json!({}))]));
        assert_eq!(s.keys().collect::<Vec<_>>(), vec!["b", "a", "c"]);

        s.remove("a");
        assert_eq!(s.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(
            serde_json::to_value(&s).unwrap(),
            json!({"b": {"metas": [{"phx_ref": "1"}]}, "c": {"metas": []}})
        );
    }

    #[test]
    fn test_meta_keeps_application_fields() {
        let meta: Meta = serde_json::from_value(json!({"phx_ref": "x", "name": "ada", "n": 2})).unwrap();
        assert_eq!(meta.reference, "x");
        assert_eq!(meta.data.get("name"), Some(&json!("ada")));
        assert_eq!(
            serde_json::to_value(&meta).unwrap(),
            json!({"phx_ref": "x", "name": "ada", "n": 2})
        );
    }

    #[test]
    fn test_diff_adds_meta_and_removes_empty_key() {
        let mut presence = Presence::from_state(fixture());
        presence.sync_diff(PresenceDiff {
            joins: state(json!({"u1": {"metas": [{"id": 1, "phx_ref": "1.2"}]}})),
            leaves: state(json!({"u2": {"metas": [{"id": 2, "phx_ref": "2"}]}})),
        });

        assert_eq!(
            presence.state(),
            &state(json!({
                "u1": {"metas": [{"id": 1, "phx_ref": "1"}, {"id": 1, "phx_ref": "1.2"}]},
                "u3": {"metas": [{"id": 3, "phx_ref": "3"}]}
            }))
        );
    }

    #[test]
    fn test_diff_keeps_key_while_metas_remain() {
        let mut presence = Presence::from_state(state(json!({
            "u1": {"metas": [{"id": 1, "phx_ref": "1"}, {"id": 1, "phx_ref": "1.2"}]}
        })));
        let left = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&left);
        presence.on_leave(move |key, remaining, removed| {
            seen.lock()
                .push((key.to_string(), remaining.clone(), removed.clone()));
        });

        presence.sync_diff(PresenceDiff {
            joins: PresenceState::new(),
            leaves: state(json!({"u1": {"metas": [{"id": 1, "phx_ref": "1"}]}})),
        });

        assert_eq!(
            presence.state(),
            &state(json!({"u1": {"metas": [{"id": 1, "phx_ref": "1.2"}]}}))
        );
        let left = left.lock();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "u1");
        assert_eq!(left[0].1.refs().collect::<Vec<_>>(), vec!["1.2"]);
        assert_eq!(left[0].2.refs().collect::<Vec<_>>(), vec!["1"]);
    }

    #[test]
    fn test_join_hook_sees_only_new_metas() {
        let mut presence = Presence::from_state(state(json!({
            "u3": {"metas": [{"id": 3, "phx_ref": "3"}]}
        })));
        let joined = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&joined);
        presence.on_join(move |key, previous, added| {
            seen.lock().push((
                key.to_string(),
                previous.map(|p| p.refs().map(str::to_string).collect::<Vec<_>>()),
                added.refs().map(str::to_string).collect::<Vec<_>>(),
            ));
        });

        presence.sync_state(state(json!({
            "u3": {"metas": [{"id": 3, "phx_ref": "3"}, {"id": 3, "phx_ref": "3.new"}]}
        })));

        assert_eq!(
            *joined.lock(),
            vec![(
                "u3".to_string(),
                Some(vec!["3".to_string()]),
                vec!["3.new".to_string()]
            )]
        );
    }

    #[test]
    fn test_change_hook_fires_once_per_sync() {
        let mut presence = Presence::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&changes);
        presence.on_change(move |current, previous| {
            seen.lock().push((current.len(), previous.len()));
        });

        presence.sync_state(fixture());
        presence.sync_diff(PresenceDiff::default());

        assert_eq!(*changes.lock(), vec![(3, 0), (3, 3)]);
    }

    #[test]
    fn test_list_by_picks_first_meta() {
        let presence = Presence::from_state(state(json!({
            "u1": {"metas": [{"id": 1, "phx_ref": "1.first"}, {"id": 1, "phx_ref": "1.second"}]}
        })));
        let firsts = presence.list_by(|_, entry| entry.metas.first().map(|m| m.reference.clone()));
        assert_eq!(firsts, vec![Some("1.first".to_string())]);
        assert_eq!(presence.list().len(), 1);
    }

    #[test]
    fn test_unknown_leaves_are_dropped() {
        let mut presence = Presence::new();
        let left = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&left);
        presence.on_leave(move |_, _, _| *seen.lock() += 1);
        let leave = |r: &str| PresenceDiff {
            joins: PresenceState::new(),
            leaves: state(json!({"u9": {"metas": [{"phx_ref": r}]}})),
        };
        presence.sync_diff(leave("a"));
        presence.sync_diff(leave("b"));
        assert!(presence.state().is_empty());

        let snapshot = state(json!({"u9": {"metas": [{"phx_ref": "a"}]}}));
        presence.sync_state(snapshot.clone());
        assert_eq!(presence.state(), &snapshot);
        assert_eq!(*left.lock(), 0);
    }

    #[test]
    fn test_malformed_payloads_fail_to_parse() {
        assert!(PresenceState::from_value(&json!([1, 2])).is_err());
        assert!(PresenceState::from_value(&json!({"u1": {"metas": [{"id": 1}]}})).is_err());
        assert!(PresenceDiff::from_value(&json!({"joins": 3})).is_err());
        assert_eq!(
            PresenceDiff::from_value(&json!({})).unwrap(),
            PresenceDiff::default()
        );
    }
}
