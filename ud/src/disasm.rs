//! Disassembler seam.
//!
//! The analyzer only consumes disassembly as `(bytes, pc) -> text`; wiring a
//! real engine in is a tooling concern. [`NullDisasm`] is the default and
//! renders every instruction as [`UNKNOWN_INSN`].

use trace::{Endianness, MachineType, WordSize};

use crate::Error;

/// Rendered when an engine cannot decode an instruction.
pub const UNKNOWN_INSN: &str = "<unknown>";

pub trait Disassemble {
    /// Decodes one instruction, returning `mnemonic operands` text.
    fn disasm(&mut self, bytes: &[u8], pc: u64) -> Option<String>;
}

/// Engine that decodes nothing.
#[derive(Debug, Default)]
pub struct NullDisasm;

impl Disassemble for NullDisasm {
    fn disasm(&mut self, _bytes: &[u8], _pc: u64) -> Option<String> {
        None
    }
}

/// Validates that a `(machine, endianness, word size)` triple names a real
/// instruction set an engine could be initialized for.
pub fn machine_check(
    machine: MachineType,
    endianness: Endianness,
    word_size: WordSize,
) -> Result<(), Error> {
    use Endianness::{Big, Little};
    use WordSize::{Eight, Four};

    let supported = match machine {
        MachineType::X86 => endianness == Little && word_size == Four,
        MachineType::X86_64 => endianness == Little && word_size == Eight,
        MachineType::Ppc => false,
        MachineType::Ppc64 => word_size == Eight,
        MachineType::Arm => word_size == Four,
        MachineType::AArch64 => word_size == Eight,
        MachineType::S390 => endianness == Big,
        MachineType::Mips => true,
        MachineType::NanoMips => false,
    };
    if supported {
        Ok(())
    } else {
        Err(Error::UnsupportedMachine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_impossible_triples() {
        assert!(machine_check(MachineType::X86_64, Endianness::Little, WordSize::Eight).is_ok());
        assert!(machine_check(MachineType::X86, Endianness::Big, WordSize::Four).is_err());
        assert!(machine_check(MachineType::X86, Endianness::Little, WordSize::Eight).is_err());
        assert!(machine_check(MachineType::S390, Endianness::Big, WordSize::Eight).is_ok());
        assert!(machine_check(MachineType::S390, Endianness::Little, WordSize::Eight).is_err());
        assert!(machine_check(MachineType::Mips, Endianness::Big, WordSize::Four).is_ok());
        assert!(machine_check(MachineType::Ppc, Endianness::Big, WordSize::Four).is_err());
    }
}
