//! Finger table routing entries

use crate::common::{Id, ModRange, M};
use crate::{Error, Result};

/// One finger table entry.
///
/// `start` and `interval` are fixed at construction from the owning node's id
/// and the 1-indexed entry number; `node` is the best known owner of
/// `start` and is updated for the node's entire lifetime.
#[derive(Clone, Copy, Debug)]
pub struct FingerEntry {
    /// `(n + 2^(k-1)) mod 2^M`
    pub start: Id,
    /// `[start, next entry's start)`, wrapping back to `n` for the last entry.
    pub interval: ModRange,
    /// Best known owner of `start`.
    pub node: Option<Id>,
}

impl FingerEntry {
    /// Build entry `k` (1-indexed, `1..=M`) for the node `n`.
    pub fn new(n: Id, k: usize) -> Result<FingerEntry> {
        if k < 1 || k > M {
            return Err(Error::InvalidFingerIndex(k));
        }

        let start = n.wrapping_add(1 << (k - 1));
        let next_start = if k < M { n.wrapping_add(1 << k) } else { n };

        Ok(FingerEntry {
            start,
            interval: ModRange::ring(start, next_start),
            node: None,
        })
    }
}

/// A node's routing table: `M` entries whose `start` offsets double each
/// step. Entry 1's node doubles as the node's immediate successor.
#[derive(Debug)]
pub struct FingerTable {
    entries: Vec<FingerEntry>,
}

impl FingerTable {
    /// Build the table for node `n` with every `node` field unset.
    pub fn new(n: Id) -> Result<FingerTable> {
        let entries = (1..=M)
            .map(|k| FingerEntry::new(n, k))
            .collect::<Result<Vec<_>>>()?;

        Ok(FingerTable { entries })
    }

    /// Entry `k` (1-indexed). None outside `[1, M]`.
    pub fn get(&self, k: usize) -> Option<&FingerEntry> {
        if k < 1 || k > M {
            return None;
        }

        self.entries.get(k - 1)
    }

    /// Set entry `k`'s node. Out-of-range indices are ignored.
    pub fn set_node(&mut self, k: usize, node: Id) {
        if let Some(entry) = self.entries.get_mut(k.wrapping_sub(1)) {
            entry.node = Some(node);
        }
    }

    /// The immediate successor, entry 1's node.
    pub fn successor(&self) -> Option<Id> {
        self.entries[0].node
    }

    /// Point every entry at `n` itself (sole member of a new ring).
    pub fn point_at_self(&mut self, n: Id) {
        for entry in self.entries.iter_mut() {
            entry.node = Some(n);
        }
    }

    /// Every set node, in entry order, duplicates included.
    pub fn nodes(&self) -> Vec<Id> {
        self.entries.iter().filter_map(|entry| entry.node).collect()
    }

    /// True iff any entry currently points at `id`.
    pub fn references(&self, id: Id) -> bool {
        self.entries.iter().any(|entry| entry.node == Some(id))
    }
}
