//! Request timeout index.
//!
//! An ordered map from absolute deadline (milliseconds) to the outstanding
//! request and its connection. The event loop peeks the minimum each tick
//! to size its poll timeout and fails expired requests externally; the
//! engine only guarantees an accurate `min` and idempotent removal.
//! Deadlines tie-break on message id, which makes keys unique without
//! promising any ordering between equal deadlines.

use std::collections::BTreeMap;

use crate::message::{ConnId, MsgToken};

/// Index key: the absolute deadline, disambiguated by message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TmoKey {
    pub deadline_ms: u64,
    pub msg_id: u64,
}

#[derive(Default)]
pub struct TimeoutIndex {
    tree: BTreeMap<TmoKey, (MsgToken, ConnId)>,
}

impl TimeoutIndex {
    pub fn new() -> Self {
        TimeoutIndex {
            tree: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: TmoKey, msg: MsgToken, conn: ConnId) {
        let prev = self.tree.insert(key, (msg, conn));
        debug_assert!(prev.is_none(), "duplicate timeout key");
    }

    pub fn remove(&mut self, key: TmoKey) {
        self.tree.remove(&key);
    }

    /// Entry with the earliest deadline.
    pub fn min(&self) -> Option<(TmoKey, MsgToken, ConnId)> {
        self.tree
            .iter()
            .next()
            .map(|(k, (m, c))| (*k, *m, *c))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
