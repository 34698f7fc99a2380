//! Restores canonical source order after out-of-order measurement.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Emitter, Stage};
use crate::entity::{Entity, SourceGroup};
use crate::error::{Error, Result};
use crate::plugins::detection::SourceId;
use crate::progress::ProgressMediator;

pub const PROGRESS_LABEL: &str = "Sorter buffer";

/// A batch carrying a contiguous run of canonical keys.
pub trait OrderedBatch {
    fn ordering_keys(&self) -> Vec<u64>;

    /// How far the batch advances the expected key.
    fn cardinality(&self) -> u64 {
        self.ordering_keys().len() as u64
    }
}

impl OrderedBatch for SourceGroup {
    fn ordering_keys(&self) -> Vec<u64> {
        self.sources()
            .iter()
            .filter_map(|source| source.peek_property::<SourceId>())
            .map(|id| id.0)
            .collect()
    }

    fn cardinality(&self) -> u64 {
        self.len() as u64
    }
}

impl OrderedBatch for Vec<u64> {
    fn ordering_keys(&self) -> Vec<u64> {
        self.clone()
    }
}

/// Buffers batches until the one holding the next expected key arrives.
///
/// A batch is keyed by its smallest key and advances the expected key by
/// its cardinality. Batches without keys pass straight through. A batch
/// whose key was already released or buffered is dropped and reported by
/// [`ReorderBuffer::finish`].
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, (T, u64)>,
    duplicates: Vec<(u64, u64)>,
}

impl<T: OrderedBatch> ReorderBuffer<T> {
    pub fn new(first_key: u64) -> Self {
        Self {
            next: first_key,
            pending: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn next_key(&self) -> u64 {
        self.next
    }

    /// Adds a batch and returns every batch that can now be released, in
    /// key order.
    pub fn push(&mut self, batch: T) -> Vec<T> {
        let keys = batch.ordering_keys();
        let Some(&first) = keys.iter().min() else {
            return vec![batch];
        };
        let count = batch.cardinality().max(1);
        if first < self.next || self.pending.contains_key(&first) {
            tracing::error!(
                key = first,
                expected = self.next,
                "batch key already seen, dropping batch"
            );
            self.duplicates.push((first, first + count - 1));
            return Vec::new();
        }
        self.pending.insert(first, (batch, count));

        let mut released = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next {
                break;
            }
            let (batch, count) = entry.remove();
            self.next += count;
            released.push(batch);
        }
        released
    }

    /// Number of buffered batches.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn buffered_keys(&self) -> Vec<u64> {
        self.pending
            .iter()
            .flat_map(|(&first, (_, count))| first..first + count)
            .collect()
    }

    /// Key ranges of dropped duplicate batches.
    pub fn duplicates(&self) -> &[(u64, u64)] {
        &self.duplicates
    }

    /// Fails if a duplicate batch was seen or any batch is still waiting
    /// for a predecessor.
    pub fn finish(&mut self) -> Result<()> {
        if !self.duplicates.is_empty() {
            let ranges = self
                .duplicates
                .iter()
                .map(|(first, last)| format!("{}..={}", first, last))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::DuplicateKey {
                ranges: format!("[{}]", ranges),
            });
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        let available = self
            .pending
            .iter()
            .map(|(&first, (_, count))| format!("{}..={}", first, first + count - 1))
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::OrderingStall {
            expected: self.next,
            available: format!("[{}]", available),
        })
    }
}

pub struct Sorter {
    buffer: ReorderBuffer<SourceGroup>,
    progress: Option<Arc<ProgressMediator>>,
}

impl Sorter {
    pub fn new(first_source_id: u64) -> Self {
        Self {
            buffer: ReorderBuffer::new(first_source_id),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressMediator>) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl Stage for Sorter {
    type Input = SourceGroup;
    type Output = SourceGroup;

    fn name(&self) -> &'static str {
        "sorter"
    }

    fn handle(&mut self, group: SourceGroup, out: &Emitter<SourceGroup>) -> Result<()> {
        for released in self.buffer.push(group) {
            out.emit(released)?;
        }
        if let Some(progress) = &self.progress {
            progress.update(PROGRESS_LABEL, self.buffer.len() as i64, -1);
        }
        Ok(())
    }

    fn finish(&mut self, _out: &Emitter<SourceGroup>) -> Result<()> {
        self.buffer.finish()
    }
}
