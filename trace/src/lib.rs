//! Zero-copy reader for binary execution traces.
//!
//! A trace is a stream of word-aligned TLV records in one of four
//! (endianness, word size) flavors, discriminated by the two-byte magic that
//! opens the file. The reader memory-maps the file and yields borrowed
//! [`record::Record`] views; it never copies payload bytes.

use std::fs;
use std::path::Path;

use memmap2::Mmap;

pub mod record;

pub use record::{Endianness, Layout, MachineType, Record, Tag, WordSize};

use record::TLV_LEN;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unrecognized trace magic {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("truncated record at offset {0:#x}")]
    Truncated(usize),

    #[error("unknown record tag {tag:#06x} at offset {offset:#x}")]
    UnknownTag { tag: u16, offset: usize },

    #[error("unknown machine type {0:#x}")]
    UnknownMachine(u16),

    #[error("mapping name is not NUL-terminated")]
    MissingNul,

    #[error("no such instruction")]
    NotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shifts a record-relative truncation offset to a stream offset.
    pub(crate) fn rebase(self, base: usize) -> Self {
        match self {
            Self::Truncated(offset) => Self::Truncated(base + offset),
            other => other,
        }
    }
}

/// A memory-mapped trace file.
pub struct Trace {
    mmap: Mmap,
}

impl Trace {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        // SAFETY: the mapping is read-only and the recorder has finished
        // writing the file by the time it is analyzed.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Validates the header and returns a cursor positioned at the first
    /// body record.
    pub fn reader(&self) -> Result<TraceReader<'_>, Error> {
        TraceReader::new(&self.mmap)
    }
}

/// Cursor over the records of a trace buffer.
///
/// [`TraceReader::next_entry`] distinguishes clean end-of-stream (`Ok(None)`)
/// from a malformed stream (`Err`). The cursor always advances by a record's
/// aligned length.
pub struct TraceReader<'d> {
    data: &'d [u8],
    layout: Layout,
    machine: MachineType,
    body: usize,
    pos: usize,
}

impl<'d> TraceReader<'d> {
    /// Creates a reader over raw trace bytes, validating magic and header.
    pub fn new(data: &'d [u8]) -> Result<Self, Error> {
        if data.len() < TLV_LEN + 2 {
            return Err(Error::Truncated(0));
        }
        let layout = Layout::from_magic([data[0], data[1]])?;
        let len = layout.u16([data[2], data[3]]) as usize;
        let machine = MachineType::try_from(layout.u16([data[4], data[5]]))?;
        let aligned = layout.align(len);
        if aligned < TLV_LEN + 2 || aligned > data.len() {
            return Err(Error::Truncated(0));
        }
        Ok(Self {
            data,
            layout,
            machine,
            body: aligned,
            pos: aligned,
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn machine(&self) -> MachineType {
        self.machine
    }

    /// Current byte offset of the cursor.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Total length of the underlying buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Rewinds the cursor to the first record after the header.
    pub fn rewind(&mut self) {
        self.pos = self.body;
    }

    /// Decodes the record under the cursor and advances past it.
    pub fn next_entry(&mut self) -> Result<Option<Record<'d>>, Error> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let offset = self.pos;
        let rest = &self.data[offset..];
        if rest.len() < TLV_LEN {
            return Err(Error::Truncated(offset));
        }
        let raw_tag = self.layout.u16([rest[0], rest[1]]);
        let len = self.layout.u16([rest[2], rest[3]]) as usize;
        let aligned = self.layout.align(len);
        if len < TLV_LEN || aligned > rest.len() {
            return Err(Error::Truncated(offset));
        }
        let tag = Tag::from_wire(raw_tag).ok_or(Error::UnknownTag {
            tag: raw_tag,
            offset,
        })?;
        let record = Record::parse(self.layout, tag, &rest[..len], offset)?;
        self.pos = offset + aligned;
        Ok(Some(record))
    }

    /// Positions the cursor at the first record of the `index`-th dynamic
    /// instruction.
    ///
    /// Dynamic instructions are counted by distinct consecutive `insn_seq`
    /// values over the sequenced record kinds; `INSN` and `MMAP` records do
    /// not advance the count. The matching record itself is *not* consumed:
    /// the next [`next_entry`](Self::next_entry) call yields it.
    pub fn seek_insn(&mut self, index: u32) -> Result<(), Error> {
        self.rewind();
        // Wraps to 0 at the first sequenced record.
        let mut insn_index = u64::MAX;
        let mut prev_seq = u32::MAX;
        loop {
            let record_pos = self.pos;
            let record = self.next_entry()?.ok_or(Error::NotFound)?;
            let seq = match record {
                Record::Load(e)
                | Record::Store(e)
                | Record::Reg(e)
                | Record::GetReg(e)
                | Record::PutReg(e) => Some(e.insn_seq()),
                Record::InsnExec(e) => Some(e.insn_seq()),
                Record::GetRegNx(e) | Record::PutRegNx(e) => Some(e.insn_seq()),
                Record::Insn(_) | Record::Mmap(_) => None,
            };
            if let Some(seq) = seq {
                if seq != prev_seq {
                    insn_index = insn_index.wrapping_add(1);
                    prev_seq = seq;
                }
            }
            if insn_index == u64::from(index) {
                self.pos = record_pos;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use record::{emit_header, InsnExec, LdSt, LdStNx};

    fn layout() -> Layout {
        Layout::new(Endianness::Little, WordSize::Four)
    }

    fn sample_trace() -> Vec<u8> {
        let layout = layout();
        let mut buffer = Vec::new();
        emit_header(layout, MachineType::X86_64, &mut buffer);
        Record::PutReg(LdSt::new(1, 0x0, &[0xef, 0xbe, 0xad, 0xde])).emit(layout, &mut buffer);
        Record::InsnExec(InsnExec::new(1)).emit(layout, &mut buffer);
        Record::GetRegNx(LdStNx::new(2, 0x0, 4)).emit(layout, &mut buffer);
        Record::InsnExec(InsnExec::new(2)).emit(layout, &mut buffer);
        Record::InsnExec(InsnExec::new(3)).emit(layout, &mut buffer);
        buffer
    }

    #[test]
    fn walk_covers_whole_file() {
        let data = sample_trace();
        let mut reader = TraceReader::new(&data).unwrap();
        let mut entries = 0;
        while reader.next_entry().unwrap().is_some() {
            entries += 1;
        }
        assert_eq!(entries, 5);
        // The sum of aligned record lengths lands exactly on end-of-file.
        assert_eq!(reader.offset(), data.len());
    }

    #[test]
    fn load_maps_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.out");
        std::fs::write(&path, sample_trace()).unwrap();
        let trace = Trace::load(&path).unwrap();
        let mut reader = trace.reader().unwrap();
        assert_eq!(reader.machine(), MachineType::X86_64);
        let mut entries = 0;
        while reader.next_entry().unwrap().is_some() {
            entries += 1;
        }
        assert_eq!(entries, 5);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = sample_trace();
        data[0] = b'X';
        data[1] = b'X';
        assert!(matches!(TraceReader::new(&data), Err(Error::BadMagic(_))));
    }

    #[test]
    fn rejects_truncated_record() {
        let data = sample_trace();
        let cut = &data[..data.len() - 2];
        let mut reader = TraceReader::new(cut).unwrap();
        let terminal = loop {
            match reader.next_entry() {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        assert!(matches!(terminal, Err(Error::Truncated(_))));
    }

    #[test]
    fn rejects_unknown_tag() {
        let layout = layout();
        let mut data = Vec::new();
        emit_header(layout, MachineType::X86_64, &mut data);
        data.extend_from_slice(&[0x41, 0x41, 8, 0, 0, 0, 0, 0]);
        let mut reader = TraceReader::new(&data).unwrap();
        assert!(matches!(
            reader.next_entry(),
            Err(Error::UnknownTag { tag: 0x4141, .. })
        ));
    }

    #[test]
    fn seek_finds_each_instruction() {
        let data = sample_trace();
        let mut reader = TraceReader::new(&data).unwrap();
        for (index, expected_seq) in [(0u32, 1u32), (1, 2), (2, 3)] {
            reader.seek_insn(index).unwrap();
            let record = reader.next_entry().unwrap().unwrap();
            assert_eq!(record.insn_seq(), Some(expected_seq));
        }
    }

    #[test]
    fn seek_lands_on_first_record_of_instruction() {
        let data = sample_trace();
        let mut reader = TraceReader::new(&data).unwrap();
        reader.seek_insn(1).unwrap();
        // Instruction 1 starts at the GET_REG_NX record, not its INSN_EXEC.
        let record = reader.next_entry().unwrap().unwrap();
        assert!(matches!(record, Record::GetRegNx(_)));
    }

    #[test]
    fn seek_past_end_is_not_found() {
        let data = sample_trace();
        let mut reader = TraceReader::new(&data).unwrap();
        assert!(matches!(reader.seek_insn(3), Err(Error::NotFound)));
    }

    #[test]
    fn mmap_and_insn_do_not_advance_seek_count() {
        let layout = layout();
        let mut data = Vec::new();
        emit_header(layout, MachineType::X86_64, &mut data);
        Record::Mmap(record::Mmap::new(0x1000, 0x1fff, 5, b"a.out")).emit(layout, &mut data);
        Record::PutReg(LdSt::new(0, 0x0, &[1, 2, 3, 4])).emit(layout, &mut data);
        Record::Insn(record::Insn::new(0, 0x400000, &[0x90])).emit(layout, &mut data);
        Record::InsnExec(InsnExec::new(0)).emit(layout, &mut data);
        let mut reader = TraceReader::new(&data).unwrap();
        reader.seek_insn(0).unwrap();
        let record = reader.next_entry().unwrap().unwrap();
        assert!(matches!(record, Record::PutReg(_)));
        assert!(matches!(reader.seek_insn(1), Err(Error::NotFound)));
    }
}
