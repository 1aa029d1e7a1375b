//! End-to-end builds over synthesized traces, plus reopen-and-query checks.

use trace::record::{emit_header, Insn, InsnExec, LdSt, Mmap};
use trace::{Endianness, Layout, MachineType, Record, TraceReader, WordSize};
use ud::{Def, Error, Mode, NullDisasm, PathTemplate, Ud, UdGraph};

fn layout() -> Layout {
    Layout::new(Endianness::Little, WordSize::Four)
}

fn template_in(dir: &tempfile::TempDir) -> (PathTemplate, String) {
    let text = dir
        .path()
        .join("ud-{}.bin")
        .to_str()
        .expect("tempdir path is valid unicode")
        .to_owned();
    (PathTemplate::new(&text).unwrap(), text)
}

/// The five-record scenario: a register write, its instruction, and a second
/// instruction reading the value back.
fn put_get_trace() -> Vec<u8> {
    let layout = layout();
    let mut bytes = Vec::new();
    emit_header(layout, MachineType::X86_64, &mut bytes);
    Record::PutReg(LdSt::new(1, 0x0, &[0xef, 0xbe, 0xad, 0xde])).emit(layout, &mut bytes);
    Record::Insn(Insn::new(1, 0x400000, &[0x90])).emit(layout, &mut bytes);
    Record::InsnExec(InsnExec::new(1)).emit(layout, &mut bytes);
    Record::GetReg(LdSt::new(2, 0x0, &[0xef, 0xbe, 0xad, 0xde])).emit(layout, &mut bytes);
    Record::InsnExec(InsnExec::new(2)).emit(layout, &mut bytes);
    bytes
}

/// Like [`put_get_trace`], but with an `INSN` record for every sequence so
/// that every trace entry has resolvable code. The dumpers need this; the
/// analyzer itself does not.
fn full_trace() -> Vec<u8> {
    let layout = layout();
    let mut bytes = Vec::new();
    emit_header(layout, MachineType::X86_64, &mut bytes);
    Record::PutReg(LdSt::new(1, 0x0, &[0xef, 0xbe, 0xad, 0xde])).emit(layout, &mut bytes);
    Record::Insn(Insn::new(1, 0x400000, &[0x90])).emit(layout, &mut bytes);
    Record::InsnExec(InsnExec::new(1)).emit(layout, &mut bytes);
    Record::GetReg(LdSt::new(2, 0x0, &[0xef, 0xbe, 0xad, 0xde])).emit(layout, &mut bytes);
    Record::Insn(Insn::new(2, 0x400001, &[0x90])).emit(layout, &mut bytes);
    Record::InsnExec(InsnExec::new(2)).emit(layout, &mut bytes);
    bytes
}

fn build(bytes: &[u8], template: &PathTemplate, mode: Mode) -> Result<Ud<u32>, Error> {
    let mut reader = TraceReader::new(bytes).unwrap();
    Ud::build(&mut reader, template.clone(), mode, Box::new(NullDisasm))
}

#[test]
fn put_then_get_resolves_to_the_writer() {
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let ud = build(&put_get_trace(), &template, Mode::Temporary).unwrap();

    // Seed entry plus one per instruction sequence.
    assert_eq!(ud.trace_len(), 3);
    // Seed entry plus the single INSN record.
    assert_eq!(ud.code_len(), 2);
    assert_eq!(ud.pc_for_code(1), 0x400000);

    // Catch-all plus the PUT_REG def.
    assert_eq!(ud.reg().defs().len(), 2);
    assert_eq!(ud.reg().defs()[1], Def { start: 0, end: 4 });
    assert_eq!(ud.reg().uses(), &[1]);
    // The read covers the def exactly, so no refinement is recorded.
    assert_eq!(ud.reg().partial_use(0), None);

    // The GET_REG's single use resolves to the PUT_REG's instruction.
    assert_eq!(ud.trace_for_reg_use(0), 1);
    assert_eq!(ud.reg_uses_for_trace(2), 0..1);
    assert_eq!(ud.code_for_trace(1), 1);
}

#[test]
fn header_only_trace_builds_the_seed_graph() {
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let mut bytes = Vec::new();
    emit_header(layout(), MachineType::X86_64, &mut bytes);
    let ud = build(&bytes, &template, Mode::Temporary).unwrap();

    assert_eq!(ud.trace_len(), 1);
    assert_eq!(ud.code_len(), 1);
    assert_eq!(ud.reg().use_count(), 0);
    assert_eq!(ud.mem().use_count(), 0);
    assert_eq!(ud.reg().def_count(), 1);
    assert_eq!(ud.mem().def_count(), 1);
}

#[test]
fn straddling_load_resolves_to_both_writers() {
    let layout = layout();
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let mut bytes = Vec::new();
    emit_header(layout, MachineType::X86_64, &mut bytes);
    Record::Store(LdSt::new(1, 0x1000, &[1, 2, 3, 4])).emit(layout, &mut bytes);
    Record::InsnExec(InsnExec::new(1)).emit(layout, &mut bytes);
    Record::Load(LdSt::new(2, 0x1002, &[3, 4, 0, 0])).emit(layout, &mut bytes);
    Record::InsnExec(InsnExec::new(2)).emit(layout, &mut bytes);
    let ud = build(&bytes, &template, Mode::Temporary).unwrap();

    assert_eq!(ud.mem().uses(), &[1, 0]);
    assert_eq!(
        ud.mem().partial_use(0),
        Some(&Def {
            start: 0x1002,
            end: 0x1004
        })
    );
    assert_eq!(
        ud.mem().partial_use(1),
        Some(&Def {
            start: 0x1004,
            end: 0x1006
        })
    );
    // First half came from the store, second half from initial state.
    assert_eq!(ud.trace_for_mem_use(0), 1);
    assert_eq!(ud.trace_for_mem_use(1), 0);
}

#[test]
fn uses_always_resolve_to_strictly_earlier_traces() {
    let layout = layout();
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let mut bytes = Vec::new();
    emit_header(layout, MachineType::X86_64, &mut bytes);
    // Reads precede writes within an instruction, as the recorder emits them.
    for seq in 1..=8u32 {
        let addr = u64::from(seq % 3) * 8;
        Record::GetReg(LdSt::new(seq, addr + 2, &[0; 4])).emit(layout, &mut bytes);
        Record::Load(LdSt::new(seq, 0x2000, &[0; 8])).emit(layout, &mut bytes);
        Record::PutReg(LdSt::new(seq, addr, &[seq as u8; 4])).emit(layout, &mut bytes);
        Record::Store(LdSt::new(seq, 0x2000 + addr, &[seq as u8; 2])).emit(layout, &mut bytes);
        Record::InsnExec(InsnExec::new(seq)).emit(layout, &mut bytes);
    }
    let ud = build(&bytes, &template, Mode::Temporary).unwrap();

    for trace_index in 0..ud.trace_len() as u32 {
        for reg_use in ud.reg_uses_for_trace(trace_index) {
            assert!(ud.trace_for_reg_use(reg_use) < trace_index);
        }
        for mem_use in ud.mem_uses_for_trace(trace_index) {
            assert!(ud.trace_for_mem_use(mem_use) < trace_index);
        }
    }
}

#[test]
fn persisted_graph_reopens_with_identical_answers() {
    let dir = tempfile::tempdir().unwrap();
    let (template, text) = template_in(&dir);
    let expected = {
        let ud = build(&put_get_trace(), &template, Mode::Create).unwrap();
        (
            ud.trace_len(),
            ud.code_len(),
            ud.codes_for_pc(0x400000),
            ud.trace_for_reg_use(0),
            ud.reg_uses_for_trace(2),
            ud.traces_for_code(1),
        )
    };

    let mut reopened = UdGraph::load(&text).unwrap();
    assert_eq!(reopened.word_size(), WordSize::Four);
    assert_eq!(reopened.machine(), MachineType::X86_64);
    assert_eq!(reopened.endianness(), Endianness::Little);
    assert_eq!(reopened.trace_len(), expected.0);
    assert_eq!(reopened.code_len(), expected.1);
    assert_eq!(reopened.codes_for_pc(0x400000), expected.2);
    assert_eq!(reopened.trace_for_reg_use(0), expected.3);
    assert_eq!(reopened.reg_uses_for_trace(2), expected.4);
    assert_eq!(reopened.traces_for_code(1), expected.5);
    assert_eq!(reopened.disasm_for_code(1), "<unknown>");
}

#[test]
fn load_accepts_the_foreign_magic_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let (template, text) = template_in(&dir);
    build(&put_get_trace(), &template, Mode::Create).unwrap();

    // Rewrite the header the way a big-endian producer would have: magic
    // bytes swapped and the remaining fields in its byte order.
    let machine = MachineType::X86_64 as u16;
    let header = [
        b'M',
        b'4',
        (machine >> 8) as u8,
        machine as u8,
        0,
        0, // little-endian trace
    ];
    std::fs::write(template.path("header"), header).unwrap();

    let reopened = UdGraph::load(&text).unwrap();
    assert_eq!(reopened.word_size(), WordSize::Four);
    assert_eq!(reopened.machine(), MachineType::X86_64);
    assert_eq!(reopened.endianness(), Endianness::Little);
}

#[test]
fn load_rejects_a_garbled_header() {
    let dir = tempfile::tempdir().unwrap();
    let (template, text) = template_in(&dir);
    build(&put_get_trace(), &template, Mode::Create).unwrap();
    std::fs::write(template.path("header"), b"XX\x00\x00\x00\x00").unwrap();
    assert!(matches!(UdGraph::load(&text), Err(Error::BadHeader)));
}

#[test]
fn insn_records_must_arrive_in_code_order() {
    let layout = layout();
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let mut bytes = Vec::new();
    emit_header(layout, MachineType::X86_64, &mut bytes);
    // The code table holds only the seed, so seq 5 cannot extend it.
    Record::Insn(Insn::new(5, 0x400000, &[0x90])).emit(layout, &mut bytes);
    assert!(matches!(
        build(&bytes, &template, Mode::Temporary),
        Err(Error::InsnOutOfOrder { seq: 5, .. })
    ));
}

#[test]
fn mmap_records_have_no_ud_effect() {
    let layout = layout();
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let mut bytes = Vec::new();
    emit_header(layout, MachineType::X86_64, &mut bytes);
    Record::Mmap(Mmap::new(0x1000, 0x1fff, 5, b"a.out")).emit(layout, &mut bytes);
    Record::PutReg(LdSt::new(1, 0x0, &[1, 2, 3, 4])).emit(layout, &mut bytes);
    Record::InsnExec(InsnExec::new(1)).emit(layout, &mut bytes);
    let ud = build(&bytes, &template, Mode::Temporary).unwrap();
    assert_eq!(ud.trace_len(), 2);
    assert_eq!(ud.mem().def_count(), 1);
    assert_eq!(ud.reg().def_count(), 2);
}

#[test]
fn dot_dump_names_every_edge() {
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let mut ud = build(&full_trace(), &template, Mode::Temporary).unwrap();
    let mut out = Vec::new();
    ud.dump_dot(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("digraph ud {"));
    assert!(text.contains("2 -> 1 [label=\"r0x0-0x4\"]"));
    assert!(text.ends_with("}\n"));
}

#[test]
fn csv_dump_writes_the_three_tables() {
    let dir = tempfile::tempdir().unwrap();
    let (template, _) = template_in(&dir);
    let mut ud = build(&full_trace(), &template, Mode::Temporary).unwrap();
    let csv_text = dir
        .path()
        .join("ud-{}.csv")
        .to_str()
        .expect("tempdir path is valid unicode")
        .to_owned();
    let csv_template = PathTemplate::new(&csv_text).unwrap();
    ud.dump_csv(&csv_template).unwrap();

    let trace_csv = std::fs::read_to_string(csv_template.path("trace")).unwrap();
    assert_eq!(trace_csv, "0,0\n1,1\n2,2\n");
    let uses_csv = std::fs::read_to_string(csv_template.path("uses")).unwrap();
    assert_eq!(uses_csv, "2,1,r,0,4\n");
    let code_csv = std::fs::read_to_string(csv_template.path("code")).unwrap();
    assert!(code_csv.contains("1,4194304,90,<unknown>"));
}
