use std::collections::HashMap;
use std::sync::Arc;

use super::{ClientSink, ConnectionId};

/// Identity set of attached clients. Callers serialize access through the
/// relay lock; nothing in here blocks or awaits.
#[derive(Default)]
pub(crate) struct ConnectionSet {
    entries: HashMap<ConnectionId, Arc<dyn ClientSink>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub inserted: bool,
    /// The set went from empty to non-empty.
    pub first: bool,
    pub active: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub removed: bool,
    /// This removal emptied the set.
    pub last: bool,
    pub active: usize,
}

impl ConnectionSet {
    pub(crate) fn add(&mut self, connection: Arc<dyn ClientSink>) -> AddOutcome {
        let was_empty = self.entries.is_empty();
        let id = connection.id();
        let inserted = if self.entries.contains_key(&id) {
            false
        } else {
            self.entries.insert(id, connection);
            true
        };

        AddOutcome {
            inserted,
            first: inserted && was_empty,
            active: self.entries.len(),
        }
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> RemoveOutcome {
        let removed = self.entries.remove(&id).is_some();
        RemoveOutcome {
            removed,
            last: removed && self.entries.is_empty(),
            active: self.entries.len(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            connections: self.entries.values().cloned().collect(),
        }
    }
}

/// Owned copy of the registered connections, safe to iterate while the
/// registry keeps changing.
#[derive(Clone, Default)]
pub struct Snapshot {
    connections: Vec<Arc<dyn ClientSink>>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ClientSink>> {
        self.connections.iter()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| c.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::RecordingSink;

    #[test_timeout::timeout(5)]
    fn first_and_last_transitions_are_reported_once() {
        let mut set = ConnectionSet::default();
        let a = RecordingSink::new();
        let b = RecordingSink::new();

        let added_a = set.add(a.clone());
        assert!(added_a.inserted && added_a.first);
        let added_b = set.add(b.clone());
        assert!(added_b.inserted && !added_b.first);
        assert_eq!(added_b.active, 2);

        let removed_a = set.remove(a.id());
        assert!(removed_a.removed && !removed_a.last);
        let removed_b = set.remove(b.id());
        assert!(removed_b.removed && removed_b.last);
        assert_eq!(set.len(), 0);
    }

    #[test_timeout::timeout(5)]
    fn duplicate_add_does_not_double_count() {
        let mut set = ConnectionSet::default();
        let a = RecordingSink::new();

        assert!(set.add(a.clone()).first);
        let again = set.add(a.clone());
        assert!(!again.inserted);
        assert!(!again.first);
        assert_eq!(again.active, 1);

        assert!(set.remove(a.id()).last);
        assert_eq!(set.len(), 0);
    }

    #[test_timeout::timeout(5)]
    fn removing_absent_connection_is_a_no_op() {
        let mut set = ConnectionSet::default();
        let present = RecordingSink::new();
        let absent = RecordingSink::new();
        set.add(present.clone());

        let outcome = set.remove(absent.id());
        assert!(!outcome.removed);
        assert!(!outcome.last);
        assert_eq!(outcome.active, 1);

        set.remove(present.id());
        let again = set.remove(present.id());
        assert!(!again.removed && !again.last);
        assert_eq!(again.active, 0);
    }

    #[test_timeout::timeout(5)]
    fn snapshot_is_detached_from_later_mutation() {
        let mut set = ConnectionSet::default();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        set.add(a.clone());
        set.add(b.clone());

        let snapshot = set.snapshot();
        set.remove(a.id());

        assert_eq!(snapshot.len(), 2);
        let mut ids = snapshot.ids();
        ids.sort();
        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(set.snapshot().ids(), vec![b.id()]);
    }
}
