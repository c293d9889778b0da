//! Authority-scoped last-value cache
//!
//! Two partitions (static, dynamic), each mapping authority -> edge key ->
//! the last transform sent for that edge. Entries are written only by
//! successful sends, never expire on their own, and are cleared wholesale
//! on shutdown. Each partition has its own lock; nothing is held across
//! publish calls.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::transform::{Transform, TransformKind};

/// Cache key for one edge of the frame graph.
///
/// Bare concatenation, matching the established wire ecosystem: the pairs
/// ("ab", "c") and ("a", "bc") collide. Known ambiguity, kept for cache-key
/// compatibility rather than silently changed.
pub fn edge_key(frame_parent: &str, frame_child: &str) -> String {
    format!("{}{}", frame_parent, frame_child)
}

type Partition = HashMap<String, HashMap<String, Transform>>;

pub struct AuthorityCache {
    statics: Mutex<Partition>,
    dynamics: Mutex<Partition>,
}

impl AuthorityCache {
    pub fn new() -> Self {
        Self {
            statics: Mutex::new(HashMap::new()),
            dynamics: Mutex::new(HashMap::new()),
        }
    }

    fn partition(&self, kind: TransformKind) -> Option<&Mutex<Partition>> {
        match kind {
            TransformKind::Static => Some(&self.statics),
            TransformKind::Dynamic => Some(&self.dynamics),
            TransformKind::Unknown(_) => None,
        }
    }

    /// Store the last value for the transform's edge under the given
    /// authority. Last-write-wins in call order; the transform's own stamp
    /// plays no part. Returns false (and mutates nothing) for an
    /// unrecognized kind.
    pub fn store(&self, authority: &str, transform: &Transform) -> bool {
        let partition = match self.partition(transform.kind()) {
            Some(p) => p,
            None => return false,
        };
        let key = edge_key(transform.frame_parent(), transform.frame_child());
        partition
            .lock()
            .unwrap()
            .entry(authority.to_string())
            .or_default()
            .insert(key, transform.clone());
        true
    }

    /// Look up the cached transform for one edge.
    pub fn get(
        &self,
        kind: TransformKind,
        authority: &str,
        frame_parent: &str,
        frame_child: &str,
    ) -> Option<Transform> {
        let partition = self.partition(kind)?;
        let guard = partition.lock().unwrap();
        guard
            .get(authority)?
            .get(&edge_key(frame_parent, frame_child))
            .cloned()
    }

    /// Clone one partition out for flooding: (authority, transforms) pairs,
    /// sorted by authority so floods are deterministic. The lock is released
    /// before anything is published.
    pub fn snapshot(&self, kind: TransformKind) -> Vec<(String, Vec<Transform>)> {
        let partition = match self.partition(kind) {
            Some(p) => p,
            None => return Vec::new(),
        };
        let guard = partition.lock().unwrap();
        let mut entries: Vec<(String, Vec<Transform>)> = guard
            .iter()
            .map(|(authority, edges)| {
                let mut transforms: Vec<(&String, &Transform)> = edges.iter().collect();
                transforms.sort_by(|a, b| a.0.cmp(b.0));
                (
                    authority.clone(),
                    transforms.into_iter().map(|(_, t)| t.clone()).collect(),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of authorities with at least one cached edge.
    pub fn authority_count(&self, kind: TransformKind) -> usize {
        match self.partition(kind) {
            Some(p) => p.lock().unwrap().len(),
            None => 0,
        }
    }

    /// Total cached edges in one partition.
    pub fn edge_count(&self, kind: TransformKind) -> usize {
        match self.partition(kind) {
            Some(p) => p.lock().unwrap().values().map(HashMap::len).sum(),
            None => 0,
        }
    }

    pub fn clear(&self) {
        self.statics.lock().unwrap().clear();
        self.dynamics.lock().unwrap().clear();
    }
}

impl Default for AuthorityCache {
    fn default() -> Self {
        Self::new()
    }
}
