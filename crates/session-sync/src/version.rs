//! Per-client logical clocks.
//!
//! A [`VersionVector`] maps client ids to monotonically increasing counters. A client
//! with no entry is at counter 0. Zero counters are never stored, so an explicit zero
//! entry and a missing entry are indistinguishable, equality included.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVectorEntry {
    pub client_id: String,
    pub counter: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<VersionVectorEntry>", into = "Vec<VersionVectorEntry>")]
pub struct VersionVector {
    counters: BTreeMap<String, u64>,
}

/// Causal relation of the left operand to the right one.
///
/// `Concurrent` covers both "identical" and "neither dominates"; callers must never
/// read it as equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CausalOrder {
    Before,
    Concurrent,
    After,
}

impl CausalOrder {
    pub fn as_i8(self) -> i8 {
        match self {
            CausalOrder::Before => -1,
            CausalOrder::Concurrent => 0,
            CausalOrder::After => 1,
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::Concurrent => CausalOrder::Concurrent,
            CausalOrder::After => CausalOrder::Before,
        }
    }
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector with a single entry; the usual starting point for a freshly published session.
    pub fn single(client_id: impl Into<String>, counter: u64) -> Self {
        let mut vector = Self::new();
        vector.observe(client_id.into(), counter);
        vector
    }

    pub fn counter(&self, client_id: &str) -> u64 {
        self.counters.get(client_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = VersionVectorEntry> + '_ {
        self.counters
            .iter()
            .map(|(client_id, counter)| VersionVectorEntry {
                client_id: client_id.clone(),
                counter: *counter,
            })
    }

    pub fn compare(&self, other: &VersionVector) -> CausalOrder {
        compare(self, other)
    }

    pub fn incremented(&self, client_id: &str) -> SyncResult<VersionVector> {
        increment(self, client_id)
    }

    pub fn merged(&self, other: &VersionVector) -> VersionVector {
        merge(self, other)
    }

    pub fn dominates(&self, other: &VersionVector) -> bool {
        compare(self, other) == CausalOrder::After
    }

    // Duplicate ids keep the larger counter so counters never move backwards.
    fn observe(&mut self, client_id: String, counter: u64) {
        if counter == 0 {
            return;
        }
        let slot = self.counters.entry(client_id).or_insert(0);
        *slot = (*slot).max(counter);
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut vector = VersionVector::new();
        for (client_id, counter) in iter {
            vector.observe(client_id.into(), counter);
        }
        vector
    }
}

impl From<Vec<VersionVectorEntry>> for VersionVector {
    fn from(entries: Vec<VersionVectorEntry>) -> Self {
        entries
            .into_iter()
            .map(|e| (e.client_id, e.counter))
            .collect()
    }
}

impl From<VersionVector> for Vec<VersionVectorEntry> {
    fn from(vector: VersionVector) -> Self {
        vector.entries().collect()
    }
}

/// Vector-clock comparison over the union of client ids.
pub fn compare(a: &VersionVector, b: &VersionVector) -> CausalOrder {
    let clients: BTreeSet<&String> = a.counters.keys().chain(b.counters.keys()).collect();
    let mut a_greater = false;
    let mut b_greater = false;
    for client in clients {
        let left = a.counter(client);
        let right = b.counter(client);
        if left > right {
            a_greater = true;
        } else if right > left {
            b_greater = true;
        }
    }
    match (a_greater, b_greater) {
        (true, false) => CausalOrder::After,
        (false, true) => CausalOrder::Before,
        _ => CausalOrder::Concurrent,
    }
}

/// Copy of `vector` with `client_id` advanced by one. A counter at `u64::MAX` cannot
/// advance without breaking monotonicity, so that is an error rather than a wrap.
pub fn increment(vector: &VersionVector, client_id: &str) -> SyncResult<VersionVector> {
    let next_counter = vector
        .counter(client_id)
        .checked_add(1)
        .ok_or_else(|| SyncError::CounterExhausted(client_id.to_string()))?;
    let mut next = vector.clone();
    next.counters.insert(client_id.to_string(), next_counter);
    Ok(next)
}

/// Coordinate-wise maximum (the vector-clock join).
pub fn merge(a: &VersionVector, b: &VersionVector) -> VersionVector {
    let mut merged = a.clone();
    for (client_id, counter) in &b.counters {
        merged.observe(client_id.clone(), *counter);
    }
    merged
}
