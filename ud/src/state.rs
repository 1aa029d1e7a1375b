//! Per-address-space live-writer index.
//!
//! An in-core ordered map tracks, for every byte of the address space, the
//! most recent def covering it. Reads are appended to the `uses` vector as
//! def references; writes carve their range out of the map and append a new
//! def. The map is keyed by *end* address so a `range(start+1..)` walk visits
//! exactly the intervals overlapping a query range.

use std::collections::BTreeMap;
use std::ops::Bound;

use tracing::trace;

use crate::graph::{Def, InsnInTrace};
use crate::mmvec::{MmVec, Mode};
use crate::partial::PartialUses;
use crate::{Error, PathTemplate, Word};

/// Upper bound on live intervals a single write may overlap; the recorder
/// never emits an access wider than 32 bytes, so more means a corrupt trace.
pub const MAX_AFFECTED: usize = 32;

/// A live interval's payload: its start address and owning def.
#[derive(Debug, Copy, Clone)]
struct LiveDef<W> {
    start: W,
    def_index: u32,
}

/// Sizing hints used to pre-reserve the backing vectors.
#[derive(Debug, Copy, Clone, Default)]
pub struct Expected {
    pub uses: usize,
    pub defs: usize,
    pub partial_uses: usize,
}

pub struct UdState<W: Word> {
    uses: MmVec<u32>,
    defs: MmVec<Def<W>>,
    partial_uses: PartialUses<W>,
    // end address -> live writer; intervals are disjoint and cover the full
    // address space once the catch-all def is installed.
    live: BTreeMap<W, LiveDef<W>>,
}

impl<W: Word> UdState<W> {
    /// Opens the three backing vectors named `{space}uses`, `{space}defs` and
    /// `{space}partial-uses` under `template`.
    pub fn init(
        template: &PathTemplate,
        space: &str,
        mode: Mode,
        expected: Expected,
    ) -> Result<Self, Error> {
        let mut uses = MmVec::init(&template.path(&format!("{space}uses")), mode)?;
        let mut defs = MmVec::init(&template.path(&format!("{space}defs")), mode)?;
        let mut partial_uses =
            PartialUses::init(&template.path(&format!("{space}partial-uses")), mode)?;
        if mode != Mode::Open {
            uses.reserve(expected.uses)?;
            defs.reserve(expected.defs)?;
            partial_uses.grow(expected.partial_uses)?;
        }
        Ok(Self {
            uses,
            defs,
            partial_uses,
            live: BTreeMap::new(),
        })
    }

    pub fn use_count(&self) -> usize {
        self.uses.len()
    }

    pub fn def_count(&self) -> usize {
        self.defs.len()
    }

    pub fn uses(&self) -> &[u32] {
        &self.uses
    }

    pub fn defs(&self) -> &[Def<W>] {
        &self.defs
    }

    pub fn partial_use(&self, use_index: u32) -> Option<&Def<W>> {
        self.partial_uses.lookup(use_index)
    }

    /// Records a read of `[start, start+size)`: one use per live interval it
    /// overlaps, plus a refined range wherever the overlap is strict.
    pub fn add_uses(&mut self, start: u64, size: u64) -> Result<(), Error> {
        let end = W::from_u64(start.wrapping_add(size));
        let start = W::from_u64(start);
        trace!(start = start.to_u64(), size, "add_uses");
        for (&interval_end, live) in self.live.range((Bound::Excluded(start), Bound::Unbounded)) {
            if live.start >= end {
                break;
            }
            let use_index = self.uses.len() as u32;
            self.uses.push(live.def_index)?;
            let def = self.defs[live.def_index as usize];
            let clip_start = start.max(live.start);
            let clip_end = end.min(interval_end);
            if def.start != clip_start || def.end != clip_end {
                self.partial_uses.set(
                    use_index,
                    Def {
                        start: clip_start,
                        end: clip_end,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Records a write of `[start, start+size)`: evicts the overlapped parts
    /// of the live map, keeping non-overlapping residues, then installs a
    /// fresh def over the whole range.
    pub fn add_defs(&mut self, start: u64, size: u64) -> Result<(), Error> {
        let end = W::from_u64(start.wrapping_add(size));
        let start = W::from_u64(start);
        trace!(start = start.to_u64(), size, "add_defs");

        let mut affected = Vec::with_capacity(MAX_AFFECTED);
        for (&interval_end, &live) in self.live.range((Bound::Excluded(start), Bound::Unbounded)) {
            if live.start >= end {
                break;
            }
            if affected.len() == MAX_AFFECTED {
                return Err(Error::TooManyOverlaps);
            }
            affected.push((interval_end, live));
        }
        for &(interval_end, _) in &affected {
            self.live.remove(&interval_end);
        }
        for (interval_end, live) in affected {
            if start <= live.start {
                if end < interval_end {
                    // Left overlap: the tail of the old interval survives.
                    self.live.insert(
                        interval_end,
                        LiveDef {
                            start: end,
                            def_index: live.def_index,
                        },
                    );
                }
                // Outer overlap: the old interval is gone entirely.
            } else if end < interval_end {
                // Inner overlap: both flanks survive.
                self.live.insert(
                    start,
                    LiveDef {
                        start: live.start,
                        def_index: live.def_index,
                    },
                );
                self.live.insert(
                    interval_end,
                    LiveDef {
                        start: end,
                        def_index: live.def_index,
                    },
                );
            } else {
                // Right overlap: the head survives.
                self.live.insert(
                    start,
                    LiveDef {
                        start: live.start,
                        def_index: live.def_index,
                    },
                );
            }
        }
        self.add_def(start, end)
    }

    /// Appends a def and marks it live over `[start, end)` unconditionally.
    /// Used by [`add_defs`](Self::add_defs) and for the catch-all seed.
    pub fn add_def(&mut self, start: W, end: W) -> Result<(), Error> {
        let def_index = self.defs.len() as u32;
        self.defs.push(Def { start, end })?;
        self.live.insert(end, LiveDef { start, def_index });
        Ok(())
    }

    /// Resolves a use to its effective range and the dynamic instruction that
    /// produced it. `def_start` selects this state's start-def field of
    /// [`InsnInTrace`].
    pub fn resolve_use(
        &self,
        use_index: u32,
        trace: &[InsnInTrace],
        def_start: fn(&InsnInTrace) -> u32,
    ) -> (Def<W>, u32) {
        let def_index = self.uses[use_index as usize];
        let def = match self.partial_uses.lookup(use_index) {
            Some(range) => *range,
            None => self.defs[def_index as usize],
        };
        // Start-def indices grow with the trace, so the producer is the last
        // entry whose start index does not exceed the def.
        let upper = trace.partition_point(|entry| def_start(entry) <= def_index);
        (def, (upper - 1) as u32)
    }

    /// Number of live intervals; test and diagnostic aid.
    pub fn live_ranges(&self) -> usize {
        self.live.len()
    }
}
