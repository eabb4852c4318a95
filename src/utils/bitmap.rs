//! Lock-free completion bitmap keyed by command ID.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::LoadError;

/// Command ID type, matching the 4-byte signed ID on the wire.
pub type CommandId = i32;

const WORD_BITS: usize = u64::BITS as usize;

/// Result of marking a command ID as seen.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MarkOutcome {
    /// First time this ID is seen.
    First,
    /// This ID had already been marked seen.
    Duplicate,
    /// ID falls outside the map.
    OutOfRange,
}

/// Dense bitmap from command ID -> "reply seen" flag, sized to every command
/// ID a run dispatches. Bits are set with atomic `fetch_or`, so concurrent
/// reply collectors can share one map behind an `Arc` without locking, and a
/// duplicate is detected by exactly the second marker.
pub struct CompletionMap {
    words: Vec<AtomicU64>,
    len: usize,
}

impl CompletionMap {
    /// Creates a new map of given size with all slots unseen.
    pub fn new(len: usize) -> Self {
        let nwords = len.div_ceil(WORD_BITS);
        CompletionMap {
            words: (0..nwords).map(|_| AtomicU64::new(0)).collect(),
            len,
        }
    }

    /// Returns the number of slots in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map has no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn slot(&self, id: CommandId) -> Option<(usize, u64)> {
        let idx = usize::try_from(id).ok()?;
        if idx >= self.len {
            return None;
        }
        Some((idx / WORD_BITS, 1u64 << (idx % WORD_BITS)))
    }

    /// Marks given command ID as seen.
    pub fn mark(&self, id: CommandId) -> MarkOutcome {
        match self.slot(id) {
            None => MarkOutcome::OutOfRange,
            Some((w, mask)) => {
                let prev = self.words[w].fetch_or(mask, Ordering::AcqRel);
                if prev & mask != 0 {
                    MarkOutcome::Duplicate
                } else {
                    MarkOutcome::First
                }
            }
        }
    }

    /// Gets the seen flag of given command ID.
    pub fn is_seen(&self, id: CommandId) -> Result<bool, LoadError> {
        match self.slot(id) {
            None => Err(LoadError::msg(format!("index {} out of bound", id))),
            Some((w, mask)) => {
                Ok(self.words[w].load(Ordering::Acquire) & mask != 0)
            }
        }
    }

    /// Resets every slot in given index range to unseen. The range is
    /// clipped to the map size.
    pub fn reset_range(&self, range: Range<usize>) {
        for idx in range.start..range.end.min(self.len) {
            let mask = 1u64 << (idx % WORD_BITS);
            self.words[idx / WORD_BITS].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Collects the indices in given range that are still unseen. The range
    /// is clipped to the map size.
    pub fn unseen_in(&self, range: Range<usize>) -> Vec<usize> {
        (range.start..range.end.min(self.len))
            .filter(|&idx| {
                let mask = 1u64 << (idx % WORD_BITS);
                self.words[idx / WORD_BITS].load(Ordering::Acquire) & mask
                    == 0
            })
            .collect()
    }

    /// Returns the number of seen slots in the whole map.
    pub fn count_seen(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

// Implement `Debug` trait manually for shorter trace printing.
impl fmt::Debug for CompletionMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; seen {}}}", self.len, self.count_seen())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mark_first_and_duplicate() -> Result<(), LoadError> {
        let map = CompletionMap::new(130);
        assert_eq!(map.mark(0), MarkOutcome::First);
        assert_eq!(map.mark(129), MarkOutcome::First);
        assert_eq!(map.mark(129), MarkOutcome::Duplicate);
        assert!(map.is_seen(129)?);
        assert!(!map.is_seen(64)?);
        assert_eq!(map.count_seen(), 2);
        Ok(())
    }

    #[test]
    fn mark_out_of_range() {
        let map = CompletionMap::new(10);
        assert_eq!(map.mark(10), MarkOutcome::OutOfRange);
        assert_eq!(map.mark(-1), MarkOutcome::OutOfRange);
        assert!(map.is_seen(10).is_err());
        assert_eq!(map.count_seen(), 0);
    }

    #[test]
    fn reset_and_unseen() {
        let map = CompletionMap::new(100);
        for id in 0..100 {
            map.mark(id);
        }
        map.reset_range(60..70);
        assert_eq!(map.unseen_in(0..100), (60..70).collect::<Vec<_>>());
        assert_eq!(map.unseen_in(0..60), Vec::<usize>::new());
        // clipped at map size
        map.reset_range(95..200);
        assert_eq!(map.unseen_in(90..200), (95..100).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_markers_see_one_first() {
        let map = Arc::new(CompletionMap::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = map.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .filter(|&id| map.mark(id) == MarkOutcome::First)
                        .count()
                })
            })
            .collect();
        let firsts: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(firsts, 1000);
        assert_eq!(map.count_seen(), 1000);
    }
}
