//! Fragment registry — reconciles multi-part entries across archive pieces.
//!
//! Each logical entry with payload owns one node keyed by name (path, or
//! device path for images).  Workers insert the fragment ranges they have
//! verified or restored; an entry is complete once the merged ranges cover
//! exactly `[0, totalSize)`.
//!
//! Locking: the map itself is behind a coarse lock taken only for
//! insert/remove/lookup; each node carries its own lock for range updates,
//! so workers on different entries never contend.  Nodes reference the map
//! by value only — no back-references.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};

/// Half-open byte range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub len: u64,
}

impl Range {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Per-entry fragment state, guarded by its own lock.
#[derive(Debug)]
pub struct FragmentNode {
    pub name: String,
    pub total_size: u64,
    /// Non-overlapping, sorted by offset; adjacent ranges are merged.
    ranges: Vec<Range>,
}

impl FragmentNode {
    /// Insert a range, merging with any overlapping or adjacent ones.
    pub fn add_range(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let new = Range { offset, len };
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut pending = new;
        let mut placed = false;
        for r in &self.ranges {
            if r.end() < pending.offset || pending.end() < r.offset {
                if r.offset > pending.end() && !placed {
                    merged.push(pending);
                    placed = true;
                }
                merged.push(*r);
            } else {
                let start = r.offset.min(pending.offset);
                let end = r.end().max(pending.end());
                pending = Range { offset: start, len: end - start };
            }
        }
        if !placed {
            merged.push(pending);
        }
        merged.sort_by_key(|r| r.offset);
        self.ranges = merged;
    }

    /// True iff the ranges reduce to exactly `[0, totalSize)`.
    /// A zero-size entry is complete as soon as its node exists.
    pub fn is_complete(&self) -> bool {
        if self.total_size == 0 {
            return true;
        }
        self.ranges.len() == 1
            && self.ranges[0].offset == 0
            && self.ranges[0].len == self.total_size
    }

    /// Covered byte count.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|r| r.len).sum()
    }

    /// Uncovered ranges, for incomplete-entry reporting.
    pub fn uncovered(&self) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for r in &self.ranges {
            if r.offset > cursor {
                gaps.push(Range { offset: cursor, len: r.offset - cursor });
            }
            cursor = cursor.max(r.end());
        }
        if cursor < self.total_size {
            gaps.push(Range { offset: cursor, len: self.total_size - cursor });
        }
        gaps
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }
}

/// Shared handle to one node.
pub type FragmentRef = Arc<Mutex<FragmentNode>>;

/// Thread-safe registry of fragment nodes, iterable in insertion order.
#[derive(Default)]
pub struct FragmentRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    nodes: HashMap<String, FragmentRef>,
    order: Vec<String>,
}

impl FragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent on (name, totalSize); a conflicting size reports
    /// `ENTRY_SIZE_MISMATCH`.
    pub fn find_or_create(&self, name: &str, total_size: u64) -> Result<FragmentRef> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get(name) {
            let existing = node.lock().unwrap().total_size;
            if existing != total_size {
                return Err(Error::EntrySizeMismatch {
                    name: name.to_string(),
                    expected: existing,
                    actual: total_size,
                });
            }
            return Ok(Arc::clone(node));
        }
        let node = Arc::new(Mutex::new(FragmentNode {
            name: name.to_string(),
            total_size,
            ranges: Vec::new(),
        }));
        inner.nodes.insert(name.to_string(), Arc::clone(&node));
        inner.order.push(name.to_string());
        Ok(node)
    }

    /// Remove a node from the map.  Safe after completion; outstanding
    /// references stay valid.
    pub fn discard(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(name);
        inner.order.retain(|n| n != name);
    }

    /// Snapshot of nodes in insertion order, for reporting.
    pub fn iter_in_order(&self) -> Vec<FragmentRef> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|name| inner.nodes.get(name).cloned())
            .collect()
    }

    /// Names of entries whose ranges do not yet cover [0, totalSize).
    pub fn incomplete(&self) -> Vec<(String, Vec<Range>)> {
        self.iter_in_order()
            .into_iter()
            .filter_map(|node| {
                let node = node.lock().unwrap();
                if node.is_complete() {
                    None
                } else {
                    Some((node.name.clone(), node.uncovered()))
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Human-readable uncovered-range list, e.g. `[3145728,10485760)`.
pub fn format_ranges(ranges: &[Range]) -> String {
    ranges
        .iter()
        .map(|r| format!("[{},{})", r.offset, r.end()))
        .collect::<Vec<_>>()
        .join(" ")
}
