use crate::Error;

/// Enumeration of record tags.
///
/// Tag values are two ASCII characters so that records are recognizable in a
/// hex dump of the trace.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    Load = 0x4c4c,     /* "LL" */
    Store = 0x5353,    /* "SS" */
    Reg = 0x5252,      /* "RR" */
    Insn = 0x4949,     /* "II" */
    GetReg = 0x4747,   /* "GG" */
    PutReg = 0x5050,   /* "PP" */
    InsnExec = 0x5858, /* "XX" */
    GetRegNx = 0x6767, /* "gg" */
    PutRegNx = 0x7070, /* "pp" */
    Mmap = 0x4d4d,     /* "MM" */
}

impl Tag {
    pub(crate) fn from_wire(value: u16) -> Option<Self> {
        match value {
            0x4c4c => Some(Self::Load),
            0x5353 => Some(Self::Store),
            0x5252 => Some(Self::Reg),
            0x4949 => Some(Self::Insn),
            0x4747 => Some(Self::GetReg),
            0x5050 => Some(Self::PutReg),
            0x5858 => Some(Self::InsnExec),
            0x6767 => Some(Self::GetRegNx),
            0x7070 => Some(Self::PutRegNx),
            0x4d4d => Some(Self::Mmap),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Reg => "REG",
            Self::Insn => "INSN",
            Self::GetReg => "GET_REG",
            Self::PutReg => "PUT_REG",
            Self::InsnExec => "INSN_EXEC",
            Self::GetRegNx => "GET_REG_NX",
            Self::PutRegNx => "PUT_REG_NX",
            Self::Mmap => "MMAP",
        };
        write!(f, "{}", name)
    }
}

/// ELF machine type of the traced program, stored in the header record.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MachineType {
    X86 = 3,
    Mips = 8,
    Ppc = 20,
    Ppc64 = 21,
    S390 = 22,
    Arm = 40,
    X86_64 = 62,
    AArch64 = 183,
    NanoMips = 249,
}

impl TryFrom<u16> for MachineType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        match value {
            3 => Ok(Self::X86),
            8 => Ok(Self::Mips),
            20 => Ok(Self::Ppc),
            21 => Ok(Self::Ppc64),
            22 => Ok(Self::S390),
            40 => Ok(Self::Arm),
            62 => Ok(Self::X86_64),
            183 => Ok(Self::AArch64),
            249 => Ok(Self::NanoMips),
            n => Err(Error::UnknownMachine(n)),
        }
    }
}

impl std::fmt::Display for MachineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::X86 => "EM_386",
            Self::Mips => "EM_MIPS",
            Self::Ppc => "EM_PPC",
            Self::Ppc64 => "EM_PPC64",
            Self::S390 => "EM_S390",
            Self::Arm => "EM_ARM",
            Self::X86_64 => "EM_X86_64",
            Self::AArch64 => "EM_AARCH64",
            Self::NanoMips => "EM_NANOMIPS",
        };
        write!(f, "{}", name)
    }
}

/// Byte order of all multi-byte fields in a trace.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little = 0,
    Big = 1,
}

impl Endianness {
    /// One-character struct-format spelling, used by the dumpers.
    pub fn symbol(&self) -> char {
        match self {
            Self::Little => '<',
            Self::Big => '>',
        }
    }
}

/// Width of address and size fields in a trace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WordSize {
    Four,
    Eight,
}

impl WordSize {
    #[inline]
    pub fn bytes(&self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    fn digit(&self) -> u8 {
        match self {
            Self::Four => b'4',
            Self::Eight => b'8',
        }
    }
}

/// The (endianness, word size) pair of a trace, fixed by its two-byte magic.
///
/// All field readers branch on the endianness once per integer; nothing in the
/// hot path goes through dynamic dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Layout {
    pub endianness: Endianness,
    pub word_size: WordSize,
}

impl Layout {
    pub fn new(endianness: Endianness, word_size: WordSize) -> Self {
        Self {
            endianness,
            word_size,
        }
    }

    /// Picks the layout from the first two bytes of a trace file.
    ///
    /// `M4`/`M8` are big-endian traces with 4/8-byte words, `4M`/`8M` are the
    /// little-endian counterparts. The magic doubles as the tag field of the
    /// header record.
    pub fn from_magic(magic: [u8; 2]) -> Result<Self, Error> {
        match magic {
            [b'M', b'4'] => Ok(Self::new(Endianness::Big, WordSize::Four)),
            [b'M', b'8'] => Ok(Self::new(Endianness::Big, WordSize::Eight)),
            [b'4', b'M'] => Ok(Self::new(Endianness::Little, WordSize::Four)),
            [b'8', b'M'] => Ok(Self::new(Endianness::Little, WordSize::Eight)),
            other => Err(Error::BadMagic(other)),
        }
    }

    pub fn magic(&self) -> [u8; 2] {
        match self.endianness {
            Endianness::Big => [b'M', self.word_size.digit()],
            Endianness::Little => [self.word_size.digit(), b'M'],
        }
    }

    #[inline]
    pub fn u16(&self, bytes: [u8; 2]) -> u16 {
        match self.endianness {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big => u16::from_be_bytes(bytes),
        }
    }

    #[inline]
    pub fn u32(&self, bytes: [u8; 4]) -> u32 {
        match self.endianness {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    }

    #[inline]
    pub fn u64(&self, bytes: [u8; 8]) -> u64 {
        match self.endianness {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        }
    }

    /// Rounds a record length up to the word-aligned cursor stride.
    #[inline]
    pub fn align(&self, len: usize) -> usize {
        let mask = self.word_size.bytes() - 1;
        (len + mask) & !mask
    }

    fn put_u16(&self, buffer: &mut Vec<u8>, value: u16) {
        match self.endianness {
            Endianness::Little => buffer.extend_from_slice(&value.to_le_bytes()),
            Endianness::Big => buffer.extend_from_slice(&value.to_be_bytes()),
        }
    }

    fn put_u32(&self, buffer: &mut Vec<u8>, value: u32) {
        match self.endianness {
            Endianness::Little => buffer.extend_from_slice(&value.to_le_bytes()),
            Endianness::Big => buffer.extend_from_slice(&value.to_be_bytes()),
        }
    }

    fn put_word(&self, buffer: &mut Vec<u8>, value: u64) {
        match (self.endianness, self.word_size) {
            (Endianness::Little, WordSize::Four) => {
                buffer.extend_from_slice(&(value as u32).to_le_bytes())
            }
            (Endianness::Little, WordSize::Eight) => {
                buffer.extend_from_slice(&value.to_le_bytes())
            }
            (Endianness::Big, WordSize::Four) => {
                buffer.extend_from_slice(&(value as u32).to_be_bytes())
            }
            (Endianness::Big, WordSize::Eight) => buffer.extend_from_slice(&value.to_be_bytes()),
        }
    }
}

/// Tag and length fields that start every record.
pub const TLV_LEN: usize = 4;

fn take<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], Error> {
    let mut buffer = [0u8; N];
    let slice = bytes
        .get(offset..offset + N)
        .ok_or(Error::Truncated(offset))?;
    buffer.copy_from_slice(slice);
    Ok(buffer)
}

fn read_word(layout: Layout, bytes: &[u8], offset: usize) -> Result<u64, Error> {
    match layout.word_size {
        WordSize::Four => Ok(layout.u32(take::<4>(bytes, offset)?) as u64),
        WordSize::Eight => Ok(layout.u64(take::<8>(bytes, offset)?)),
    }
}

/// A decoded record borrowing its payload from the trace buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Record<'d> {
    Load(LdSt<'d>),
    Store(LdSt<'d>),
    Reg(LdSt<'d>),
    GetReg(LdSt<'d>),
    PutReg(LdSt<'d>),
    Insn(Insn<'d>),
    InsnExec(InsnExec),
    GetRegNx(LdStNx),
    PutRegNx(LdStNx),
    Mmap(Mmap<'d>),
}

impl<'d> Record<'d> {
    /// Returns the corresponding [`Tag`] for this record.
    pub fn tag(&self) -> Tag {
        match self {
            Self::Load(_) => Tag::Load,
            Self::Store(_) => Tag::Store,
            Self::Reg(_) => Tag::Reg,
            Self::GetReg(_) => Tag::GetReg,
            Self::PutReg(_) => Tag::PutReg,
            Self::Insn(_) => Tag::Insn,
            Self::InsnExec(_) => Tag::InsnExec,
            Self::GetRegNx(_) => Tag::GetRegNx,
            Self::PutRegNx(_) => Tag::PutRegNx,
            Self::Mmap(_) => Tag::Mmap,
        }
    }

    /// Returns the instruction sequence number, for the tags that carry one.
    pub fn insn_seq(&self) -> Option<u32> {
        match self {
            Self::Load(e)
            | Self::Store(e)
            | Self::Reg(e)
            | Self::GetReg(e)
            | Self::PutReg(e) => Some(e.insn_seq()),
            Self::Insn(e) => Some(e.insn_seq()),
            Self::InsnExec(e) => Some(e.insn_seq()),
            Self::GetRegNx(e) | Self::PutRegNx(e) => Some(e.insn_seq()),
            Self::Mmap(_) => None,
        }
    }

    /// Parses one record from `bytes`, a slice covering exactly the record's
    /// unaligned length. `offset` is the record's position in the stream and
    /// is only used for error reporting.
    pub(crate) fn parse(
        layout: Layout,
        tag: Tag,
        bytes: &'d [u8],
        offset: usize,
    ) -> Result<Self, Error> {
        let record = match tag {
            Tag::Load => LdSt::parse(layout, bytes).map(Self::Load),
            Tag::Store => LdSt::parse(layout, bytes).map(Self::Store),
            Tag::Reg => LdSt::parse(layout, bytes).map(Self::Reg),
            Tag::GetReg => LdSt::parse(layout, bytes).map(Self::GetReg),
            Tag::PutReg => LdSt::parse(layout, bytes).map(Self::PutReg),
            Tag::Insn => Insn::parse(layout, bytes).map(Self::Insn),
            Tag::InsnExec => InsnExec::parse(layout, bytes).map(Self::InsnExec),
            Tag::GetRegNx => LdStNx::parse(layout, bytes).map(Self::GetRegNx),
            Tag::PutRegNx => LdStNx::parse(layout, bytes).map(Self::PutRegNx),
            Tag::Mmap => Mmap::parse(layout, bytes).map(Self::Mmap),
        };
        record.map_err(|e| e.rebase(offset))
    }

    /// Serializes the record, including its word-alignment padding.
    ///
    /// `emit` is the byte-exact inverse of parsing and exists so that tests
    /// and tools can synthesize traces.
    pub fn emit(&self, layout: Layout, buffer: &mut Vec<u8>) {
        let start = buffer.len();
        match self {
            Self::Load(e)
            | Self::Store(e)
            | Self::Reg(e)
            | Self::GetReg(e)
            | Self::PutReg(e) => e.emit(self.tag(), layout, buffer),
            Self::Insn(e) => e.emit(layout, buffer),
            Self::InsnExec(e) => e.emit(layout, buffer),
            Self::GetRegNx(e) | Self::PutRegNx(e) => e.emit(self.tag(), layout, buffer),
            Self::Mmap(e) => e.emit(layout, buffer),
        }
        let aligned = layout.align(buffer.len() - start);
        buffer.resize(start + aligned, 0);
    }
}

/// Memory or register access with the transferred bytes attached.
///
/// # Format
///
/// `| tag: u16 | len: u16 | insn_seq: u32 | addr: word | value: [u8] |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LdSt<'d> {
    insn_seq: u32,
    addr: u64,
    value: &'d [u8],
}

impl<'d> LdSt<'d> {
    pub fn new(insn_seq: u32, addr: u64, value: &'d [u8]) -> Self {
        Self {
            insn_seq,
            addr,
            value,
        }
    }

    pub fn insn_seq(&self) -> u32 {
        self.insn_seq
    }

    /// Start address of the access, in the trace's register or memory space.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The bytes that were transferred; the access size is `value().len()`.
    pub fn value(&self) -> &'d [u8] {
        self.value
    }

    fn parse(layout: Layout, bytes: &'d [u8]) -> Result<Self, Error> {
        let word = layout.word_size.bytes();
        let insn_seq = layout.u32(take::<4>(bytes, TLV_LEN)?);
        let addr = read_word(layout, bytes, TLV_LEN + 4)?;
        let value = bytes
            .get(TLV_LEN + 4 + word..)
            .ok_or(Error::Truncated(TLV_LEN + 4 + word))?;
        Ok(Self {
            insn_seq,
            addr,
            value,
        })
    }

    fn emit(&self, tag: Tag, layout: Layout, buffer: &mut Vec<u8>) {
        let word = layout.word_size.bytes();
        layout.put_u16(buffer, tag as u16);
        layout.put_u16(buffer, (TLV_LEN + 4 + word + self.value.len()) as u16);
        layout.put_u32(buffer, self.insn_seq);
        layout.put_word(buffer, self.addr);
        buffer.extend_from_slice(self.value);
    }
}

/// Static instruction definition: its address and opcode bytes.
///
/// # Format
///
/// `| tag: u16 | len: u16 | insn_seq: u32 | pc: word | opcode: [u8] |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Insn<'d> {
    insn_seq: u32,
    pc: u64,
    bytes: &'d [u8],
}

impl<'d> Insn<'d> {
    pub fn new(insn_seq: u32, pc: u64, bytes: &'d [u8]) -> Self {
        Self {
            insn_seq,
            pc,
            bytes,
        }
    }

    pub fn insn_seq(&self) -> u32 {
        self.insn_seq
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn bytes(&self) -> &'d [u8] {
        self.bytes
    }

    fn parse(layout: Layout, bytes: &'d [u8]) -> Result<Self, Error> {
        let word = layout.word_size.bytes();
        let insn_seq = layout.u32(take::<4>(bytes, TLV_LEN)?);
        let pc = read_word(layout, bytes, TLV_LEN + 4)?;
        let opcode = bytes
            .get(TLV_LEN + 4 + word..)
            .ok_or(Error::Truncated(TLV_LEN + 4 + word))?;
        Ok(Self {
            insn_seq,
            pc,
            bytes: opcode,
        })
    }

    fn emit(&self, layout: Layout, buffer: &mut Vec<u8>) {
        let word = layout.word_size.bytes();
        layout.put_u16(buffer, Tag::Insn as u16);
        layout.put_u16(buffer, (TLV_LEN + 4 + word + self.bytes.len()) as u16);
        layout.put_u32(buffer, self.insn_seq);
        layout.put_word(buffer, self.pc);
        buffer.extend_from_slice(self.bytes);
    }
}

/// Marks one execution of a static instruction.
///
/// # Format
///
/// `| tag: u16 | len: u16 | insn_seq: u32 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InsnExec {
    insn_seq: u32,
}

impl InsnExec {
    pub fn new(insn_seq: u32) -> Self {
        Self { insn_seq }
    }

    pub fn insn_seq(&self) -> u32 {
        self.insn_seq
    }

    fn parse(layout: Layout, bytes: &[u8]) -> Result<Self, Error> {
        let insn_seq = layout.u32(take::<4>(bytes, TLV_LEN)?);
        Ok(Self { insn_seq })
    }

    fn emit(&self, layout: Layout, buffer: &mut Vec<u8>) {
        layout.put_u16(buffer, Tag::InsnExec as u16);
        layout.put_u16(buffer, (TLV_LEN + 4) as u16);
        layout.put_u32(buffer, self.insn_seq);
    }
}

/// Register access recorded without its value bytes.
///
/// # Format
///
/// `| tag: u16 | len: u16 | insn_seq: u32 | addr: word | size: word |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LdStNx {
    insn_seq: u32,
    addr: u64,
    size: u64,
}

impl LdStNx {
    pub fn new(insn_seq: u32, addr: u64, size: u64) -> Self {
        Self {
            insn_seq,
            addr,
            size,
        }
    }

    pub fn insn_seq(&self) -> u32 {
        self.insn_seq
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn parse(layout: Layout, bytes: &[u8]) -> Result<Self, Error> {
        let word = layout.word_size.bytes();
        let insn_seq = layout.u32(take::<4>(bytes, TLV_LEN)?);
        let addr = read_word(layout, bytes, TLV_LEN + 4)?;
        let size = read_word(layout, bytes, TLV_LEN + 4 + word)?;
        Ok(Self {
            insn_seq,
            addr,
            size,
        })
    }

    fn emit(&self, tag: Tag, layout: Layout, buffer: &mut Vec<u8>) {
        let word = layout.word_size.bytes();
        layout.put_u16(buffer, tag as u16);
        layout.put_u16(buffer, (TLV_LEN + 4 + 2 * word) as u16);
        layout.put_u32(buffer, self.insn_seq);
        layout.put_word(buffer, self.addr);
        layout.put_word(buffer, self.size);
    }
}

/// A region mapped into the traced program's address space.
///
/// The `end` address is inclusive. Flag bits are POSIX `PROT_*`: bit 0 read,
/// bit 1 write, bit 2 execute.
///
/// # Format
///
/// `| tag: u16 | len: u16 | pad to word | start: word | end: word |
///  flags: word | name: [u8] NUL |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Mmap<'d> {
    start: u64,
    end: u64,
    flags: u64,
    name: &'d [u8],
}

impl<'d> Mmap<'d> {
    pub fn new(start: u64, end: u64, flags: u64, name: &'d [u8]) -> Self {
        Self {
            start,
            end,
            flags,
            name,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Region name without the trailing NUL.
    pub fn name(&self) -> &'d [u8] {
        self.name
    }

    fn parse(layout: Layout, bytes: &'d [u8]) -> Result<Self, Error> {
        let word = layout.word_size.bytes();
        let start = read_word(layout, bytes, word)?;
        let end = read_word(layout, bytes, 2 * word)?;
        let flags = read_word(layout, bytes, 3 * word)?;
        let raw_name = bytes.get(4 * word..).ok_or(Error::MissingNul)?;
        let nul = raw_name
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::MissingNul)?;
        Ok(Self {
            start,
            end,
            flags,
            name: &raw_name[..nul],
        })
    }

    fn emit(&self, layout: Layout, buffer: &mut Vec<u8>) {
        let word = layout.word_size.bytes();
        let start = buffer.len();
        layout.put_u16(buffer, Tag::Mmap as u16);
        layout.put_u16(buffer, (4 * word + self.name.len() + 1) as u16);
        buffer.resize(start + word, 0);
        layout.put_word(buffer, self.start);
        layout.put_word(buffer, self.end);
        layout.put_word(buffer, self.flags);
        buffer.extend_from_slice(self.name);
        buffer.push(0);
    }
}

/// Serializes the header record that opens every trace. Its tag bytes are the
/// file magic itself.
pub fn emit_header(layout: Layout, machine: MachineType, buffer: &mut Vec<u8>) {
    let start = buffer.len();
    buffer.extend_from_slice(&layout.magic());
    layout.put_u16(buffer, layout.align(TLV_LEN + 2) as u16);
    layout.put_u16(buffer, machine as u16);
    let aligned = layout.align(buffer.len() - start);
    buffer.resize(start + aligned, 0);
}
