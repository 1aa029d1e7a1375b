use anyhow::Result;
use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use std::fs;
use std::io::{self, BufWriter, Write};

use trace::{Layout, Record, Trace, WordSize};
use ud::{Disassemble, NullDisasm, UNKNOWN_INSN};

/// Prints the trace as text.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input trace file.
    #[arg(short, long, default_value_t = String::from("trace.out"))]
    input: String,

    /// Output file or '-' to use stdout.
    #[arg(short, long, default_value_t = String::from("-"))]
    output: String,

    /// Index of the first entry to print (inclusive).
    #[arg(long, default_value_t = 0)]
    start: u64,

    /// Index of the last entry to print (exclusive).
    #[arg(long, default_value_t = u64::MAX)]
    end: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("UT_LOG"))
        .with_writer(io::stderr)
        .init();
    let args = Args::parse();

    let trace = Trace::load(&args.input)?;
    let mut output = open_output(args.output.as_str())?;
    dump(&trace, &mut *output, args.start, args.end)?;
    Ok(())
}

fn dump(trace: &Trace, out: &mut dyn Write, start: u64, end: u64) -> Result<()> {
    let mut reader = trace.reader()?;
    let layout = reader.layout();
    let word = match layout.word_size {
        WordSize::Four => "I",
        WordSize::Eight => "Q",
    };
    writeln!(out, "Endian            : {}", layout.endianness.symbol())?;
    writeln!(out, "Word              : {}", word)?;
    writeln!(out, "Word size         : {}", layout.word_size.bytes())?;
    writeln!(out, "Machine           : {}", reader.machine())?;

    let mut engine = NullDisasm;
    let mut index = 0u64;
    let mut insn_count = 0u64;
    while let Some(record) = reader.next_entry()? {
        if index >= start && index < end {
            print_record(out, layout, index, &record, &mut engine)?;
            if matches!(record, Record::InsnExec(_)) {
                insn_count += 1;
            }
        }
        index += 1;
    }
    writeln!(out, "Insns             : {}", insn_count)?;
    Ok(())
}

fn print_record(
    out: &mut dyn Write,
    layout: Layout,
    index: u64,
    record: &Record<'_>,
    engine: &mut dyn Disassemble,
) -> io::Result<()> {
    let tag = record.tag();
    match record {
        Record::Load(e)
        | Record::Store(e)
        | Record::Reg(e)
        | Record::GetReg(e)
        | Record::PutReg(e) => writeln!(
            out,
            "[{:10}] 0x{:08x}: {} uint{}_t [0x{:x}] {}",
            index,
            e.insn_seq(),
            tag,
            e.value().len() * 8,
            e.addr(),
            render_value(layout, e.value()),
        ),
        Record::Insn(e) => {
            let disasm = engine
                .disasm(e.bytes(), e.pc())
                .unwrap_or_else(|| UNKNOWN_INSN.to_owned());
            write!(
                out,
                "[{:10}] 0x{:08x}: {} 0x{:016x} ",
                index,
                e.insn_seq(),
                tag,
                e.pc()
            )?;
            for byte in e.bytes() {
                write!(out, "{:02x}", byte)?;
            }
            writeln!(out, " {}", disasm)
        }
        Record::InsnExec(e) => {
            writeln!(out, "[{:10}] 0x{:08x}: {}", index, e.insn_seq(), tag)
        }
        Record::GetRegNx(e) | Record::PutRegNx(e) => writeln!(
            out,
            "[{:10}] 0x{:08x}: {} uint{}_t [0x{:x}]",
            index,
            e.insn_seq(),
            tag,
            e.size() * 8,
            e.addr(),
        ),
        Record::Mmap(e) => writeln!(
            out,
            "[{:10}] {} {:016x}-{:016x} {}{}{} {}",
            index,
            tag,
            e.start(),
            e.end().wrapping_add(1),
            if e.flags() & 1 != 0 { 'r' } else { '-' },
            if e.flags() & 2 != 0 { 'w' } else { '-' },
            if e.flags() & 4 != 0 { 'x' } else { '-' },
            String::from_utf8_lossy(e.name()),
        ),
    }
}

/// Power-of-two sizes read as one integer in the trace's byte order;
/// anything else prints as escaped bytes.
fn render_value(layout: Layout, bytes: &[u8]) -> String {
    match bytes.len() {
        1 => format!("0x{:x}", bytes[0]),
        2 => {
            let mut raw = [0u8; 2];
            raw.copy_from_slice(bytes);
            format!("0x{:x}", layout.u16(raw))
        }
        4 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(bytes);
            format!("0x{:x}", layout.u32(raw))
        }
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            format!("0x{:x}", layout.u64(raw))
        }
        _ => {
            let mut repr = String::from("b'");
            for byte in bytes {
                repr.push_str(&format!("\\x{:02x}", byte));
            }
            repr.push('\'');
            repr
        }
    }
}

fn open_output(output: &str) -> io::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    Ok(Box::new(BufWriter::new(fs::File::create(output)?)))
}
