//! Side table for uses whose read range is a strict subset of the covering
//! def. Only a few percent of uses are partial, so a sparse open-addressed
//! table is far cheaper than widening every entry of the dense `uses` vector.

use std::path::{Path, PathBuf};

use crate::graph::Def;
use crate::mmvec::{MmVec, Mode, Pod};
use crate::{Error, Word};

/// Slot marker for an unoccupied entry.
const EMPTY: u32 = u32::MAX;

/// One slot: the owning use index and the refined address range.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PartialUse<W> {
    pub use_index: u32,
    pub range: Def<W>,
}

unsafe impl<W: Word> Pod for PartialUse<W> {}

/// Open-addressed, linearly probed hash table persisted in an [`MmVec`].
///
/// The table size is always prime and at least 11; occupancy never exceeds
/// half, so probing always terminates on a match or an empty slot.
pub struct PartialUses<W: Word> {
    entries: MmVec<PartialUse<W>>,
    load: usize,
    max_load: usize,
    path: PathBuf,
}

impl<W: Word> PartialUses<W> {
    pub fn init(path: &Path, mode: Mode) -> Result<Self, Error> {
        let mut entries = MmVec::init(path, mode)?;
        if mode != Mode::Open {
            entries.resize(11, PartialUse::vacant())?;
        }
        let max_load = entries.len() / 2;
        Ok(Self {
            entries,
            load: 0,
            max_load,
            path: path.to_owned(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, use_index: u32) -> Option<&Def<W>> {
        let slot = &self.entries[self.slot_for(use_index)];
        (slot.use_index == use_index).then_some(&slot.range)
    }

    /// Inserts or overwrites the refined range for `use_index`, rehashing
    /// whenever occupancy passes one half.
    pub fn set(&mut self, use_index: u32, range: Def<W>) -> Result<(), Error> {
        let index = self.slot_for(use_index);
        let slot = &mut self.entries[index];
        if slot.use_index == use_index {
            slot.range = range;
            return Ok(());
        }
        slot.use_index = use_index;
        slot.range = range;
        self.load += 1;
        if self.load > self.max_load {
            self.grow(self.load * 2)?;
        }
        Ok(())
    }

    /// Rehashes so that at least `n` entries fit under the load limit. The
    /// old contents are staged in an unlinked scratch vector while the
    /// primary is resized in place.
    pub fn grow(&mut self, n: usize) -> Result<(), Error> {
        let size = next_prime(n * 2);
        if size <= self.entries.len() {
            return Ok(());
        }
        let mut staged: MmVec<PartialUse<W>> = MmVec::init(&self.path, Mode::Temporary)?;
        staged.extend_from_slice(&self.entries)?;
        self.entries.resize(size, PartialUse::vacant())?;
        for slot in self.entries.iter_mut() {
            slot.use_index = EMPTY;
        }
        for old in staged.iter().filter(|slot| slot.use_index != EMPTY) {
            let index = self.slot_for(old.use_index);
            self.entries[index] = *old;
        }
        self.max_load = size / 2;
        Ok(())
    }

    /// Index of the slot holding `use_index`, or of the empty slot where it
    /// would be inserted. Probes forward from the hash position and wraps.
    fn slot_for(&self, use_index: u32) -> usize {
        let len = self.entries.len();
        let start = use_index as usize % len;
        let scan = |range: std::ops::Range<usize>| {
            range.into_iter().find(|&i| {
                let slot = &self.entries[i];
                slot.use_index == use_index || slot.use_index == EMPTY
            })
        };
        match scan(start..len).or_else(|| scan(0..start)) {
            Some(index) => index,
            // Occupancy is capped at len/2, so an empty slot always exists.
            None => unreachable!("partial-use table has no free slot"),
        }
    }
}

impl<W: Word> PartialUse<W> {
    fn vacant() -> Self {
        Self {
            use_index: EMPTY,
            range: Def {
                start: W::ZERO,
                end: W::ZERO,
            },
        }
    }
}

/// Least prime greater than or equal to `value` (and at least 3).
fn next_prime(value: usize) -> usize {
    let mut candidate = value | 1;
    loop {
        if is_prime(candidate) {
            return candidate;
        }
        candidate += 2;
    }
}

fn is_prime(n: usize) -> bool {
    if n < 3 {
        return false;
    }
    let mut divisor = 3;
    while divisor * divisor <= n {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}
