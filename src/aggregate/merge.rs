use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::expr::{Direction, SortOrder, Value};
use crate::record::Record;

/// Head of one batch in the merge heap.
struct Head {
    key: Value,
    batch: usize,
    record: Record,
    direction: Direction,
}

impl Head {
    /// Merge precedence: sort key in the requested direction, then the
    /// batch index (endpoint discovery order).
    fn precedence(&self, other: &Self) -> Ordering {
        self.direction
            .apply(self.key.cmp(&other.key))
            .then_with(|| self.batch.cmp(&other.batch))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.precedence(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    // BinaryHeap pops the greatest element, so invert precedence.
    fn cmp(&self, other: &Self) -> Ordering {
        other.precedence(self)
    }
}

/// Merges per-endpoint batches into one sequence ordered by `order`,
/// truncated to `limit`.
///
/// Batches may arrive unordered; each is stably sorted first. Records with
/// equal keys come out in endpoint order, then in their order within the
/// peer's batch. A record identical to one already emitted with the same
/// key is dropped.
pub fn merge(batches: Vec<Vec<Record>>, order: &SortOrder, limit: usize) -> Vec<Record> {
    if limit == 0 {
        return Vec::new();
    }

    let direction = order.direction();
    let mut cursors = Vec::with_capacity(batches.len());
    for batch in batches {
        let mut keyed: Vec<(Value, Record)> = batch
            .into_iter()
            .map(|record| (order.key(&record), record))
            .collect();
        keyed.sort_by(|a, b| order.compare_keys(&a.0, &b.0));
        cursors.push(keyed.into_iter());
    }

    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (batch, cursor) in cursors.iter_mut().enumerate() {
        if let Some((key, record)) = cursor.next() {
            heap.push(Head {
                key,
                batch,
                record,
                direction,
            });
        }
    }

    let mut merged: Vec<Record> = Vec::new();
    // Serialized bodies already emitted under the current key. Object keys
    // serialize sorted, so equal records give equal text.
    let mut run_seen: HashSet<String> = HashSet::new();
    let mut run_key: Option<Value> = None;

    while let Some(head) = heap.pop() {
        let next = cursors
            .get_mut(head.batch)
            .and_then(|cursor| cursor.next());
        if let Some((key, record)) = next {
            heap.push(Head {
                key,
                batch: head.batch,
                record,
                direction,
            });
        }

        if run_key.as_ref() != Some(&head.key) {
            run_seen.clear();
            run_key = Some(head.key);
        }
        if !run_seen.insert(head.record.raw().to_string()) {
            continue;
        }

        merged.push(head.record);
        if merged.len() >= limit {
            break;
        }
    }

    merged
}
