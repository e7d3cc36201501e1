//! Translog - durable operation history of one shard copy
//!
//! Every stamped operation is appended to the current generation before
//! it is acknowledged. A commit rolls to a new generation; generations
//! whose operations are all at or below the retention point are deleted.
//!
//! ```text
//! translog-1.tlog  [0..=41]   ◄── trimmed once min(lc, gc) >= 41
//! translog-2.tlog  [42..=97]
//! translog-3.tlog  [98..]     ◄── current
//! ```
//!
//! Reads merge all generations, keep the highest primary term when the
//! same seqNo appears twice (a resync after promotion rewrites history
//! above the old global checkpoint) and return operations in seqNo order.

mod entry;

pub use entry::{TranslogEntry, TRANSLOG_ENTRY_OVERHEAD, TRANSLOG_HEADER_SIZE};

use crate::config::TranslogDurability;
use crate::seqno::{SeqNo, NO_OPS_PERFORMED};
use crate::shard::Operation;
use crate::store::{is_translog_file, Store, StoreError, TRANSLOG_PREFIX, TRANSLOG_SUFFIX};
use std::collections::BTreeMap;

/// Error type for translog operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslogError {
    Store(StoreError),
    Corruption(String),
}

impl std::fmt::Display for TranslogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslogError::Store(e) => write!(f, "translog store error: {}", e),
            TranslogError::Corruption(msg) => write!(f, "translog corruption: {}", msg),
        }
    }
}

impl std::error::Error for TranslogError {}

impl From<StoreError> for TranslogError {
    fn from(e: StoreError) -> Self {
        TranslogError::Store(e)
    }
}

pub fn translog_file_name(generation: u64) -> String {
    format!("{}{}{}", TRANSLOG_PREFIX, generation, TRANSLOG_SUFFIX)
}

fn parse_translog_generation(name: &str) -> Option<u64> {
    name.strip_prefix(TRANSLOG_PREFIX)?
        .strip_suffix(TRANSLOG_SUFFIX)?
        .parse()
        .ok()
}

/// Seqno range held by one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GenerationInfo {
    min_seq_no: SeqNo,
    max_seq_no: SeqNo,
    operations: usize,
}

impl GenerationInfo {
    fn empty() -> Self {
        GenerationInfo {
            min_seq_no: SeqNo::MAX,
            max_seq_no: NO_OPS_PERFORMED,
            operations: 0,
        }
    }

    fn record(&mut self, seq_no: SeqNo) {
        self.min_seq_no = self.min_seq_no.min(seq_no);
        self.max_seq_no = self.max_seq_no.max(seq_no);
        self.operations += 1;
    }
}

/// Translog over a shard store
#[derive(Debug)]
pub struct Translog {
    store: Store,
    durability: TranslogDurability,
    current_generation: u64,
    generations: BTreeMap<u64, GenerationInfo>,
}

impl Translog {
    /// Open the translog in `store`, scanning existing generations.
    ///
    /// Always starts a fresh generation; a torn tail in an older one is
    /// never appended to.
    pub fn open(store: Store, durability: TranslogDurability) -> Result<Self, TranslogError> {
        let mut generations = BTreeMap::new();
        for name in store.list_matching(is_translog_file) {
            let Some(generation) = parse_translog_generation(&name) else {
                continue;
            };
            let data = store.read_file(&name)?;
            let header_generation = entry::decode_header(&data)?;
            if header_generation != generation {
                return Err(TranslogError::Corruption(format!(
                    "{} carries generation {}",
                    name, header_generation
                )));
            }
            let mut info = GenerationInfo::empty();
            for e in entry::decode_entries(&data) {
                info.record(e.seq_no);
            }
            generations.insert(generation, info);
        }

        let current_generation = generations.keys().next_back().copied().unwrap_or(0) + 1;
        let mut translog = Translog {
            store,
            durability,
            current_generation,
            generations,
        };
        translog.start_generation(current_generation)?;
        Ok(translog)
    }

    /// Delete every translog generation in `store`
    pub fn wipe(store: &Store) -> Result<usize, TranslogError> {
        let names = store.list_matching(is_translog_file);
        for name in &names {
            store.delete(name)?;
        }
        Ok(names.len())
    }

    fn start_generation(&mut self, generation: u64) -> Result<(), TranslogError> {
        self.store
            .write_file(&translog_file_name(generation), &entry::encode_header(generation))?;
        self.generations.insert(generation, GenerationInfo::empty());
        self.current_generation = generation;
        Ok(())
    }

    /// Append a stamped operation to the current generation
    pub fn add(&mut self, op: &Operation) -> Result<(), TranslogError> {
        let entry = TranslogEntry::from_operation(op)?;
        let name = translog_file_name(self.current_generation);
        self.store.append(&name, &entry.encode())?;
        if self.durability == TranslogDurability::Request {
            self.store.sync(&name)?;
        }
        if let Some(info) = self.generations.get_mut(&self.current_generation) {
            info.record(op.seq_no);
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), TranslogError> {
        self.store.sync(&translog_file_name(self.current_generation))?;
        Ok(())
    }

    /// Seal the current generation and start the next one
    pub fn roll_generation(&mut self) -> Result<u64, TranslogError> {
        self.sync()?;
        let next = self.current_generation + 1;
        self.start_generation(next)?;
        Ok(next)
    }

    /// Delete sealed generations whose operations are all `<= retain_above`.
    /// Returns the number of generations deleted.
    pub fn trim_below(&mut self, retain_above: SeqNo) -> Result<usize, TranslogError> {
        let doomed: Vec<u64> = self
            .generations
            .iter()
            .filter(|(generation, info)| {
                **generation != self.current_generation && info.max_seq_no <= retain_above
            })
            .map(|(generation, _)| *generation)
            .collect();
        for generation in &doomed {
            self.store.delete(&translog_file_name(*generation))?;
            self.generations.remove(generation);
        }
        Ok(doomed.len())
    }

    /// All retained operations with `seq_no >= from`, in seqNo order
    pub fn read_operations(&self, from: SeqNo) -> Result<Vec<Operation>, TranslogError> {
        let mut by_seq_no: BTreeMap<SeqNo, Operation> = BTreeMap::new();
        for generation in self.generations.keys() {
            let data = self.store.read_file(&translog_file_name(*generation))?;
            for e in entry::decode_entries(&data) {
                if e.seq_no < from {
                    continue;
                }
                let op = e.to_operation()?;
                match by_seq_no.get(&op.seq_no) {
                    Some(existing) if existing.primary_term >= op.primary_term => {}
                    _ => {
                        by_seq_no.insert(op.seq_no, op);
                    }
                }
            }
        }
        Ok(by_seq_no.into_values().collect())
    }

    /// Whether every seqNo in `from..=to` is retained
    pub fn has_complete_history(&self, from: SeqNo, to: SeqNo) -> Result<bool, TranslogError> {
        if from > to {
            return Ok(true);
        }
        let ops = self.read_operations(from)?;
        let mut expected = from;
        for op in ops.iter().take_while(|op| op.seq_no <= to) {
            if op.seq_no != expected {
                return Ok(false);
            }
            expected += 1;
        }
        Ok(expected > to)
    }

    pub fn current_generation(&self) -> u64 {
        self.current_generation
    }

    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    /// Operations appended across all retained generations
    pub fn total_operations(&self) -> usize {
        self.generations.values().map(|g| g.operations).sum()
    }

    /// Operations appended since the last roll
    pub fn uncommitted_operations(&self) -> usize {
        self.generations
            .get(&self.current_generation)
            .map(|g| g.operations)
            .unwrap_or(0)
    }

    /// Highest retained seqNo
    pub fn max_seq_no(&self) -> SeqNo {
        self.generations
            .values()
            .map(|g| g.max_seq_no)
            .max()
            .unwrap_or(NO_OPS_PERFORMED)
    }

    /// Lowest retained seqNo, if any operation is retained
    pub fn min_retained_seq_no(&self) -> Option<SeqNo> {
        self.generations
            .values()
            .filter(|g| g.operations > 0)
            .map(|g| g.min_seq_no)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(seq: SeqNo, term: u64) -> Operation {
        Operation::index(format!("doc-{}", seq), &b"{}"[..]).stamped(seq, term)
    }

    #[test]
    fn test_add_and_read_in_seq_order() {
        let store = Store::new();
        let mut translog = Translog::open(store, TranslogDurability::Request).unwrap();
        for seq in [2, 0, 1] {
            translog.add(&op(seq, 1)).unwrap();
        }
        let seqs: Vec<_> = translog
            .read_operations(0)
            .unwrap()
            .iter()
            .map(|o| o.seq_no)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(translog.has_complete_history(0, 2).unwrap());
        assert!(!translog.has_complete_history(0, 3).unwrap());
    }

    #[test]
    fn test_higher_term_wins_on_duplicate_seq_no() {
        let store = Store::new();
        let mut translog = Translog::open(store, TranslogDurability::Request).unwrap();
        translog.add(&op(4, 1)).unwrap();
        translog.add(&Operation::no_op(4, 2, "resync")).unwrap();
        let ops = translog.read_operations(0).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].primary_term, 2);
        assert!(ops[0].is_no_op());
    }

    #[test]
    fn test_trim_keeps_current_and_unretained() {
        let store = Store::new();
        let mut translog = Translog::open(store.clone(), TranslogDurability::Request).unwrap();
        for seq in 0..5 {
            translog.add(&op(seq, 1)).unwrap();
        }
        translog.roll_generation().unwrap();
        for seq in 5..8 {
            translog.add(&op(seq, 1)).unwrap();
        }
        translog.roll_generation().unwrap();

        assert_eq!(translog.trim_below(6).unwrap(), 1);
        assert_eq!(translog.min_retained_seq_no(), Some(5));
        assert!(!translog.has_complete_history(0, 7).unwrap());
        assert!(translog.has_complete_history(5, 7).unwrap());
        assert_eq!(translog.generation_count(), 2);
    }

    #[test]
    fn test_reopen_recovers_synced_operations() {
        let store = Store::new();
        {
            let mut translog = Translog::open(store.clone(), TranslogDurability::Async).unwrap();
            translog.add(&op(0, 1)).unwrap();
            translog.sync().unwrap();
            translog.add(&op(1, 1)).unwrap();
        }
        store.simulate_crash();

        let translog = Translog::open(store, TranslogDurability::Async).unwrap();
        let ops = translog.read_operations(0).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].seq_no, 0);
        assert_eq!(translog.current_generation(), 2);
    }

    #[test]
    fn test_wipe_removes_all_generations() {
        let store = Store::new();
        let mut translog = Translog::open(store.clone(), TranslogDurability::Request).unwrap();
        translog.add(&op(0, 1)).unwrap();
        translog.roll_generation().unwrap();
        assert_eq!(Translog::wipe(&store).unwrap(), 2);
        assert!(store.list_matching(is_translog_file).is_empty());
    }
}
