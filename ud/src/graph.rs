//! Builder and query surface of the persisted use-definition graph.
//!
//! Building replays trace records through a per-instruction open/flush
//! cycle: the open trace entry accumulates use/def counter ranges and is
//! sealed when a record for a different `insn_seq` arrives. Querying works
//! over the same file-backed vectors, reopened read-only in spirit (the
//! mappings stay writable for the rehash path, but no query mutates).

use std::fs;

use tracing::debug;

use trace::record::Insn;
use trace::{Endianness, Layout, MachineType, Record, TraceReader, WordSize};

use crate::disasm::{Disassemble, NullDisasm, UNKNOWN_INSN};
use crate::mmvec::{MmVec, Mode, Pod};
use crate::state::{Expected, UdState};
use crate::{Error, PathTemplate, Word};

/// A half-open byte range written by one dynamic instruction.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Def<W> {
    pub start: W,
    pub end: W,
}

unsafe impl<W: Word> Pod for Def<W> {}

/// One static instruction: its address and opcode bytes in the `text` pool.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InsnInCode<W> {
    pub pc: W,
    pub text_index: u32,
    pub text_size: u32,
}

unsafe impl<W: Word> Pod for InsnInCode<W> {}

/// One dynamic instruction: its static instruction plus the half-open
/// use/def index intervals it produced in each address space.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InsnInTrace {
    pub code_index: u32,
    pub reg_use_start: u32,
    pub reg_use_end: u32,
    pub mem_use_start: u32,
    pub mem_use_end: u32,
    pub reg_def_start: u32,
    pub reg_def_end: u32,
    pub mem_def_start: u32,
    pub mem_def_end: u32,
}

unsafe impl Pod for InsnInTrace {}

/// Average trace bytes per executed instruction, used to pre-size the
/// backing vectors from the input length.
const TRACE_BYTES_PER_INSN: usize = 128;

/// Size of the header file: 2-byte magic, 2-byte machine, 2-byte endianness.
const HEADER_LEN: usize = 6;

pub struct Ud<W: Word> {
    machine: MachineType,
    endianness: Endianness,
    mode: Mode,
    template: PathTemplate,
    code: MmVec<InsnInCode<W>>,
    text: MmVec<u8>,
    disasm: Vec<String>,
    trace: MmVec<InsnInTrace>,
    reg: UdState<W>,
    mem: UdState<W>,
    engine: Box<dyn Disassemble>,
}

impl<W: Word> Ud<W> {
    /// Attaches the backing vectors under `template` and, unless reopening,
    /// seeds the catch-all state: `code[0]` is the unknown instruction,
    /// `trace[0]` is open against it, and both address spaces carry a def
    /// spanning everything so early reads resolve deterministically.
    pub fn init(
        template: PathTemplate,
        mode: Mode,
        machine: MachineType,
        endianness: Endianness,
        expected_insns: usize,
        engine: Box<dyn Disassemble>,
    ) -> Result<Self, Error> {
        let trace_table = MmVec::init(&template.path("trace"), mode)?;
        let code = MmVec::init(&template.path("code"), mode)?;
        let text = MmVec::init(&template.path("text"), mode)?;
        // Per-instruction averages measured on real workloads: 1.69 register
        // uses, 1.61 register defs, 0.4 memory uses, 0.22 memory defs.
        let reg = UdState::init(
            &template,
            "reg-",
            mode,
            Expected {
                uses: expected_insns * 7 / 4,
                defs: expected_insns * 5 / 3,
                partial_uses: expected_insns / 10,
            },
        )?;
        let mem = UdState::init(
            &template,
            "mem-",
            mode,
            Expected {
                uses: expected_insns / 2,
                defs: expected_insns / 4,
                partial_uses: expected_insns / 20,
            },
        )?;
        let mut ud = Self {
            machine,
            endianness,
            mode,
            template,
            code,
            text,
            disasm: Vec::new(),
            trace: trace_table,
            reg,
            mem,
            engine,
        };
        if mode != Mode::Open {
            ud.code.push(InsnInCode {
                pc: W::ZERO,
                text_index: 0,
                text_size: 0,
            })?;
            ud.disasm.push(UNKNOWN_INSN.to_owned());
            ud.trace.reserve(expected_insns)?;
            ud.open_trace(0)?;
            ud.reg.add_def(W::ZERO, W::MAX)?;
            ud.mem.add_def(W::ZERO, W::MAX)?;
        }
        Ok(ud)
    }

    /// Builds a graph by draining `reader` from its current position.
    pub fn build(
        reader: &mut TraceReader<'_>,
        template: PathTemplate,
        mode: Mode,
        engine: Box<dyn Disassemble>,
    ) -> Result<Self, Error> {
        let expected_insns = reader.len() / TRACE_BYTES_PER_INSN;
        let mut ud = Self::init(
            template,
            mode,
            reader.machine(),
            reader.layout().endianness,
            expected_insns,
            engine,
        )?;
        while let Some(record) = reader.next_entry()? {
            ud.process(&record)?;
        }
        ud.finish()?;
        Ok(ud)
    }

    /// Reattaches a persisted graph for querying.
    pub fn open(
        template: PathTemplate,
        machine: MachineType,
        endianness: Endianness,
        engine: Box<dyn Disassemble>,
    ) -> Result<Self, Error> {
        Self::init(template, Mode::Open, machine, endianness, 0, engine)
    }

    /// Applies one trace record to the graph.
    pub fn process(&mut self, record: &Record<'_>) -> Result<(), Error> {
        match record {
            Record::Load(e) => {
                self.handle_insn_seq(e.insn_seq())?;
                self.mem.add_uses(e.addr(), e.value().len() as u64)
            }
            Record::Store(e) => {
                self.handle_insn_seq(e.insn_seq())?;
                self.mem.add_defs(e.addr(), e.value().len() as u64)
            }
            // Register value snapshot: sequenced, but no use/def effect.
            Record::Reg(e) => self.handle_insn_seq(e.insn_seq()),
            Record::GetReg(e) => {
                self.handle_insn_seq(e.insn_seq())?;
                self.reg.add_uses(e.addr(), e.value().len() as u64)
            }
            Record::PutReg(e) => {
                self.handle_insn_seq(e.insn_seq())?;
                self.reg.add_defs(e.addr(), e.value().len() as u64)
            }
            Record::Insn(e) => self.add_code(e),
            Record::InsnExec(e) => self.handle_insn_seq(e.insn_seq()),
            Record::GetRegNx(e) => {
                self.handle_insn_seq(e.insn_seq())?;
                self.reg.add_uses(e.addr(), e.size())
            }
            Record::PutRegNx(e) => {
                self.handle_insn_seq(e.insn_seq())?;
                self.reg.add_defs(e.addr(), e.size())
            }
            // Consumed by external views only.
            Record::Mmap(_) => Ok(()),
        }
    }

    /// Seals the last open trace entry and, for persistent graphs, writes
    /// the header file describing this binary's format.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.flush();
        if self.mode == Mode::Create {
            self.write_header()?;
        }
        Ok(())
    }

    fn add_code(&mut self, insn: &Insn<'_>) -> Result<(), Error> {
        let seq = insn.insn_seq();
        if seq as usize != self.code.len() {
            return Err(Error::InsnOutOfOrder {
                seq,
                len: self.code.len(),
            });
        }
        let text_index = self.text.len() as u32;
        self.text.extend_from_slice(insn.bytes())?;
        self.code.push(InsnInCode {
            pc: W::from_u64(insn.pc()),
            text_index,
            text_size: insn.bytes().len() as u32,
        })?;
        let text = self
            .engine
            .disasm(insn.bytes(), insn.pc())
            .unwrap_or_else(|| UNKNOWN_INSN.to_owned());
        self.disasm.push(text);
        Ok(())
    }

    fn handle_insn_seq(&mut self, seq: u32) -> Result<(), Error> {
        if let Some(open) = self.trace.as_slice().last() {
            if open.code_index == seq {
                return Ok(());
            }
        }
        self.flush();
        self.open_trace(seq)
    }

    fn flush(&mut self) {
        let reg_use_end = self.reg.use_count() as u32;
        let mem_use_end = self.mem.use_count() as u32;
        let reg_def_end = self.reg.def_count() as u32;
        let mem_def_end = self.mem.def_count() as u32;
        let trace_index = self.trace.len();
        if let Some(open) = self.trace.as_mut_slice().last_mut() {
            open.reg_use_end = reg_use_end;
            open.mem_use_end = mem_use_end;
            open.reg_def_end = reg_def_end;
            open.mem_def_end = mem_def_end;
            debug!(
                trace_index = trace_index - 1,
                code_index = open.code_index,
                reg_uses = open.reg_use_end - open.reg_use_start,
                reg_defs = open.reg_def_end - open.reg_def_start,
                mem_uses = open.mem_use_end - open.mem_use_start,
                mem_defs = open.mem_def_end - open.mem_def_start,
                "flush"
            );
        }
    }

    fn open_trace(&mut self, code_index: u32) -> Result<(), Error> {
        let reg_use = self.reg.use_count() as u32;
        let mem_use = self.mem.use_count() as u32;
        let reg_def = self.reg.def_count() as u32;
        let mem_def = self.mem.def_count() as u32;
        self.trace.push(InsnInTrace {
            code_index,
            reg_use_start: reg_use,
            reg_use_end: reg_use,
            mem_use_start: mem_use,
            mem_use_end: mem_use,
            reg_def_start: reg_def,
            reg_def_end: reg_def,
            mem_def_start: mem_def,
            mem_def_end: mem_def,
        })
    }

    fn write_header(&self) -> Result<(), Error> {
        let digit = match W::SIZE {
            WordSize::Four => b'4',
            WordSize::Eight => b'8',
        };
        // Host byte order on purpose: the magic doubles as an endianness
        // probe of the producing host when the graph is reopened.
        let magic = u16::from(b'M') << 8 | u16::from(digit);
        let mut bytes = Vec::with_capacity(6);
        bytes.extend_from_slice(&magic.to_ne_bytes());
        bytes.extend_from_slice(&(self.machine as u16).to_ne_bytes());
        bytes.extend_from_slice(&(self.endianness as u16).to_ne_bytes());
        fs::write(self.template.path("header"), bytes)?;
        Ok(())
    }

    pub fn machine(&self) -> MachineType {
        self.machine
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn trace_len(&self) -> usize {
        self.trace.len()
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    pub fn reg(&self) -> &UdState<W> {
        &self.reg
    }

    pub fn mem(&self) -> &UdState<W> {
        &self.mem
    }

    pub(crate) fn trace_table(&self) -> &[InsnInTrace] {
        &self.trace
    }

    /// All static instructions at `pc`. Linear; the code table is small
    /// compared to the trace.
    pub fn codes_for_pc(&self, pc: u64) -> Vec<u32> {
        let pc = W::from_u64(pc);
        self.code
            .iter()
            .enumerate()
            .filter(|(_, code)| code.pc == pc)
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn pc_for_code(&self, code: u32) -> u64 {
        self.code[code as usize].pc.to_u64()
    }

    pub fn text_for_code(&self, code: u32) -> &[u8] {
        let entry = self.code[code as usize];
        &self.text[entry.text_index as usize..][..entry.text_size as usize]
    }

    pub fn disasm_for_code(&mut self, code: u32) -> String {
        let entry = self.code[code as usize];
        let bytes = self.text[entry.text_index as usize..][..entry.text_size as usize].to_vec();
        self.engine
            .disasm(&bytes, entry.pc.to_u64())
            .unwrap_or_else(|| UNKNOWN_INSN.to_owned())
    }

    /// Disassembly text for dump output: the string cached at build time, or
    /// a fresh decode when the graph was reopened.
    pub(crate) fn disasm_text(&mut self, code: u32) -> String {
        match self.disasm.get(code as usize) {
            Some(text) => text.clone(),
            None => self.disasm_for_code(code),
        }
    }

    /// All dynamic instructions executing static instruction `code`. Linear
    /// over the trace table.
    pub fn traces_for_code(&self, code: u32) -> Vec<u32> {
        self.trace
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.code_index == code)
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn code_for_trace(&self, trace: u32) -> u32 {
        self.trace[trace as usize].code_index
    }

    pub fn reg_uses_for_trace(&self, trace: u32) -> std::ops::Range<u32> {
        let entry = &self.trace[trace as usize];
        entry.reg_use_start..entry.reg_use_end
    }

    pub fn mem_uses_for_trace(&self, trace: u32) -> std::ops::Range<u32> {
        let entry = &self.trace[trace as usize];
        entry.mem_use_start..entry.mem_use_end
    }

    /// Dynamic instruction whose def produced the bytes read by register
    /// use `reg_use`.
    pub fn trace_for_reg_use(&self, reg_use: u32) -> u32 {
        self.reg
            .resolve_use(reg_use, &self.trace, |entry| entry.reg_def_start)
            .1
    }

    /// Dynamic instruction whose def produced the bytes read by memory use
    /// `mem_use`.
    pub fn trace_for_mem_use(&self, mem_use: u32) -> u32 {
        self.mem
            .resolve_use(mem_use, &self.trace, |entry| entry.mem_def_start)
            .1
    }
}

macro_rules! dispatch {
    ($self:ident, $ud:ident => $body:expr) => {
        match $self {
            UdGraph::U32($ud) => $body,
            UdGraph::U64($ud) => $body,
        }
    };
}

/// Word-size-erased handle over a [`Ud`] graph; one variant per trace word
/// width, dispatched by `match` rather than a vtable.
pub enum UdGraph {
    U32(Ud<u32>),
    U64(Ud<u64>),
}

impl UdGraph {
    /// Builds a graph from a loaded trace, persisting it under `template`
    /// when `mode` is [`Mode::Create`].
    pub fn build(
        trace_file: &trace::Trace,
        template: &str,
        mode: Mode,
        engine: Box<dyn Disassemble>,
    ) -> Result<Self, Error> {
        let template = PathTemplate::new(template)?;
        let mut reader = trace_file.reader()?;
        match reader.layout().word_size {
            WordSize::Four => Ok(Self::U32(Ud::build(&mut reader, template, mode, engine)?)),
            WordSize::Eight => Ok(Self::U64(Ud::build(&mut reader, template, mode, engine)?)),
        }
    }

    pub fn load(template: &str) -> Result<Self, Error> {
        Self::load_with(template, Box::new(NullDisasm))
    }

    /// Reopens a persisted graph, discriminating word size from the header
    /// magic. Both byte orders of the magic are accepted so that a graph
    /// written on a host of either endianness reopens anywhere; the
    /// remaining header fields are read in the producer's byte order.
    pub fn load_with(template: &str, engine: Box<dyn Disassemble>) -> Result<Self, Error> {
        let template = PathTemplate::new(template)?;
        let bytes = fs::read(template.path("header"))?;
        if bytes.len() != HEADER_LEN {
            return Err(Error::BadHeader);
        }
        let (word_size, producer) = match [bytes[0], bytes[1]] {
            [b'M', b'4'] => (WordSize::Four, Endianness::Big),
            [b'M', b'8'] => (WordSize::Eight, Endianness::Big),
            [b'4', b'M'] => (WordSize::Four, Endianness::Little),
            [b'8', b'M'] => (WordSize::Eight, Endianness::Little),
            _ => return Err(Error::BadHeader),
        };
        let layout = Layout::new(producer, word_size);
        let machine = MachineType::try_from(layout.u16([bytes[2], bytes[3]]))
            .map_err(|_| Error::BadHeader)?;
        let endianness = match layout.u16([bytes[4], bytes[5]]) {
            0 => Endianness::Little,
            1 => Endianness::Big,
            _ => return Err(Error::BadHeader),
        };
        match word_size {
            WordSize::Four => Ok(Self::U32(Ud::open(template, machine, endianness, engine)?)),
            WordSize::Eight => Ok(Self::U64(Ud::open(template, machine, endianness, engine)?)),
        }
    }

    pub fn word_size(&self) -> WordSize {
        match self {
            Self::U32(_) => WordSize::Four,
            Self::U64(_) => WordSize::Eight,
        }
    }

    pub fn machine(&self) -> MachineType {
        dispatch!(self, ud => ud.machine())
    }

    pub fn endianness(&self) -> Endianness {
        dispatch!(self, ud => ud.endianness())
    }

    pub fn trace_len(&self) -> usize {
        dispatch!(self, ud => ud.trace_len())
    }

    pub fn code_len(&self) -> usize {
        dispatch!(self, ud => ud.code_len())
    }

    pub fn codes_for_pc(&self, pc: u64) -> Vec<u32> {
        dispatch!(self, ud => ud.codes_for_pc(pc))
    }

    pub fn pc_for_code(&self, code: u32) -> u64 {
        dispatch!(self, ud => ud.pc_for_code(code))
    }

    pub fn disasm_for_code(&mut self, code: u32) -> String {
        dispatch!(self, ud => ud.disasm_for_code(code))
    }

    pub fn traces_for_code(&self, code: u32) -> Vec<u32> {
        dispatch!(self, ud => ud.traces_for_code(code))
    }

    pub fn code_for_trace(&self, trace: u32) -> u32 {
        dispatch!(self, ud => ud.code_for_trace(trace))
    }

    pub fn reg_uses_for_trace(&self, trace: u32) -> std::ops::Range<u32> {
        dispatch!(self, ud => ud.reg_uses_for_trace(trace))
    }

    pub fn mem_uses_for_trace(&self, trace: u32) -> std::ops::Range<u32> {
        dispatch!(self, ud => ud.mem_uses_for_trace(trace))
    }

    pub fn trace_for_reg_use(&self, reg_use: u32) -> u32 {
        dispatch!(self, ud => ud.trace_for_reg_use(reg_use))
    }

    pub fn trace_for_mem_use(&self, mem_use: u32) -> u32 {
        dispatch!(self, ud => ud.trace_for_mem_use(mem_use))
    }

    pub fn dump_dot<Out: std::io::Write>(&mut self, out: &mut Out) -> Result<(), Error> {
        dispatch!(self, ud => ud.dump_dot(out))
    }

    pub fn dump_html<Out: std::io::Write>(&mut self, out: &mut Out) -> Result<(), Error> {
        dispatch!(self, ud => ud.dump_html(out))
    }

    pub fn dump_csv(&mut self, template: &str) -> Result<(), Error> {
        let template = PathTemplate::new(template)?;
        dispatch!(self, ud => ud.dump_csv(&template))
    }
}
