//! Use-definition analysis over execution traces.
//!
//! The analyzer replays a trace against two byte-granular "live writer"
//! indexes (register file and main memory), records every read as a
//! reference to the def that produced its bytes, and persists the resulting
//! graph in a set of file-backed vectors so that analyses larger than RAM
//! stay feasible and results can be reopened for querying.

use std::path::PathBuf;

pub mod disasm;
pub mod dump;
pub mod graph;
pub mod mmvec;
pub mod partial;
pub mod state;

pub use disasm::{machine_check, Disassemble, NullDisasm, UNKNOWN_INSN};
pub use graph::{Def, InsnInCode, InsnInTrace, Ud, UdGraph};
pub use mmvec::{MmVec, Mode, Pod};
pub use state::{UdState, MAX_AFFECTED};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("path template {0:?} must contain a single {{}} placeholder")]
    InvalidTemplate(String),

    #[error("unsupported machine/endianness/word-size combination")]
    UnsupportedMachine,

    #[error("write overlaps more than {MAX_AFFECTED} live ranges")]
    TooManyOverlaps,

    #[error("instruction record {seq} does not extend the code table of {len} entries")]
    InsnOutOfOrder { seq: u32, len: usize },

    #[error("failed to grow file-backed storage")]
    Alloc(#[source] std::io::Error),

    #[error("file-backed vector {0} is shorter than its recorded length")]
    ShortFile(PathBuf),

    #[error("malformed analysis header")]
    BadHeader,

    #[error(transparent)]
    Trace(#[from] trace::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A path pattern with one `{}` hole, filled per backing file.
///
/// `ud-{}.bin` names `ud-trace.bin`, `ud-reg-uses.bin` and so on.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    before: String,
    after: String,
}

impl PathTemplate {
    pub fn new(template: &str) -> Result<Self, Error> {
        let Some(split) = template.find("{}") else {
            return Err(Error::InvalidTemplate(template.to_owned()));
        };
        let (before, rest) = template.split_at(split);
        let after = &rest[2..];
        if after.contains("{}") {
            return Err(Error::InvalidTemplate(template.to_owned()));
        }
        Ok(Self {
            before: before.to_owned(),
            after: after.to_owned(),
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("{}{}{}", self.before, name, self.after))
    }
}

/// Address arithmetic width of an analyzed trace. Implemented for `u32` and
/// `u64`; the word size is picked at file-open time and monomorphizes the
/// whole analyzer.
pub trait Word:
    Copy + Clone + Ord + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static
{
    const SIZE: trace::WordSize;
    const MAX: Self;
    const ZERO: Self;

    /// Truncating conversion, wrapping exactly like the traced program's own
    /// address arithmetic.
    fn from_u64(value: u64) -> Self;
    fn to_u64(self) -> u64;
}

impl Word for u32 {
    const SIZE: trace::WordSize = trace::WordSize::Four;
    const MAX: Self = u32::MAX;
    const ZERO: Self = 0;

    #[inline]
    fn from_u64(value: u64) -> Self {
        value as u32
    }

    #[inline]
    fn to_u64(self) -> u64 {
        self as u64
    }
}

impl Word for u64 {
    const SIZE: trace::WordSize = trace::WordSize::Eight;
    const MAX: Self = u64::MAX;
    const ZERO: Self = 0;

    #[inline]
    fn from_u64(value: u64) -> Self {
        value
    }

    #[inline]
    fn to_u64(self) -> u64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_splits_on_placeholder() {
        let template = PathTemplate::new("out/ud-{}.bin").unwrap();
        assert_eq!(template.path("trace"), PathBuf::from("out/ud-trace.bin"));
        assert_eq!(
            template.path("reg-uses"),
            PathBuf::from("out/ud-reg-uses.bin")
        );
    }

    #[test]
    fn template_requires_exactly_one_placeholder() {
        assert!(matches!(
            PathTemplate::new("no-placeholder"),
            Err(Error::InvalidTemplate(_))
        ));
        assert!(matches!(
            PathTemplate::new("{}-twice-{}"),
            Err(Error::InvalidTemplate(_))
        ));
    }
}
