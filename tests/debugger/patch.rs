use crate::common::{finish, reg, session, Program, TestAssembler, TestInfo, NOP};
use vmstalker::debugger::{Error, PatchFit, Register, Span, WatchSize};

#[test]
fn test_patch_shrink() {
    let mut program = Program::new();
    program.add(Register::Rg0, 0x10).hlt();
    let info = TestInfo::default();
    let mut session = session(&program, &info);

    let (fit, next) = session
        .patch_instruction(0, "INC rg1", &TestAssembler)
        .unwrap();
    assert_eq!(fit, PatchFit::Shrink { padding: 2 });
    assert_eq!(next, 2);

    let map = session.instruction_map();
    let spans: Vec<Span> = map.spans().take(4).collect();
    assert_eq!(
        spans,
        vec![
            Span::new(0, 2),
            Span::new(2, 1),
            Span::new(3, 1),
            Span::new(4, 1)
        ]
    );
    assert_eq!(map.line(0).unwrap().text, "INC rg1");
    assert_eq!(map.line(2).unwrap().text, "NOP");
    assert_eq!(map.line(3).unwrap().text, "NOP");
    assert_eq!(session.read_memory(2, WatchSize::Bytes2).unwrap(), 0x0101);

    session.continue_execution().unwrap();
    assert!(finish(&mut session).halted);
    assert_eq!(reg(&session, Register::Rg1), 1);
    assert_eq!(reg(&session, Register::Rg0), 0);
}

#[test]
fn test_patch_over_nops() {
    let mut program = Program::new();
    program.inc(Register::Rg0).nop().nop().hlt();
    let info = TestInfo::default();
    let mut session = session(&program, &info);

    let (fit, next) = session
        .patch_instruction(0, "ADD rg0, 0x100", &TestAssembler)
        .unwrap();
    assert_eq!(fit, PatchFit::NopOverwrite { consumed: 2 });
    assert_eq!(next, 4);
    assert_eq!(session.render_line(0).unwrap(), "ADD rg0, 0x100");
    assert_eq!(session.render_line(4).unwrap(), "HLT");
    assert!(!session.instruction_map().is_known_start(2));

    let (fit, _) = session
        .patch_instruction(0, "ADD rg1, 1", &TestAssembler)
        .unwrap();
    assert_eq!(fit, PatchFit::SameSize);

    session.continue_execution().unwrap();
    finish(&mut session);
    assert_eq!(reg(&session, Register::Rg1), 1);
}

#[test]
fn test_patch_too_large() {
    let mut program = Program::new();
    program.inc(Register::Rg0).nop().hlt();
    let info = TestInfo::default();
    let mut session = session(&program, &info);

    let err = session
        .patch_instruction(0, "JMP 0x10", &TestAssembler)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TooLarge {
            size: 9,
            available: 3
        }
    ));
    assert!(!err.is_fatal());
    // nothing changed
    assert_eq!(session.render_line(0).unwrap(), "INC rg0");
    assert_eq!(session.read_memory(2, WatchSize::Bytes1).unwrap(), NOP as u64);
}

#[test]
fn test_patch_with_label() {
    let mut program = Program::new();
    program.inc(Register::Rg0);
    for _ in 0..9 {
        program.nop();
    }
    program.hlt();
    let info = TestInfo::default();
    let mut session = session(&program, &info);

    assert!(matches!(
        session.patch_instruction(0, "JMP :end", &TestAssembler),
        Err(Error::UnknownLabel(label)) if label == "end"
    ));
    assert_eq!(session.render_line(0).unwrap(), "INC rg0");

    session.add_label("end", 11).unwrap();
    let (fit, next) = session
        .patch_instruction(0, "JMP :end", &TestAssembler)
        .unwrap();
    assert_eq!(fit, PatchFit::NopOverwrite { consumed: 7 });
    assert_eq!(next, 9);
    assert_eq!(
        session.render_line(0).unwrap(),
        "JMP 0xB  ; 0xB -> :end"
    );
    assert_eq!(session.read_memory(1, WatchSize::Bytes8).unwrap(), 11);
    // NOPs left after the jump are decoded again
    assert_eq!(session.render_line(9).unwrap(), "NOP");
    assert_eq!(session.render_line(10).unwrap(), "NOP");

    session.continue_execution().unwrap();
    let outcome = finish(&mut session);
    assert!(outcome.halted);
    assert_eq!(info.halted_at.take(), Some(11));
    assert_eq!(reg(&session, Register::Rg0), 0);
}

#[test]
fn test_patch_invalid_statement() {
    let mut program = Program::new();
    program.inc(Register::Rg0).hlt();
    let info = TestInfo::default();
    let mut session = session(&program, &info);

    assert!(matches!(
        session.patch_instruction(0, "   ", &TestAssembler),
        Err(Error::Assemble(_))
    ));
    assert!(matches!(
        session.patch_instruction(0, "FOO rg0", &TestAssembler),
        Err(Error::Assemble(_))
    ));
    assert_eq!(session.render_line(0).unwrap(), "INC rg0");
}

#[test]
fn test_patch_inside_data() {
    // 0xEE isn't an instruction and is kept as a data byte
    let mut program = Program::new();
    program.bad().bad().hlt();
    let info = TestInfo::default();
    let mut session = session(&program, &info);
    assert!(session.instruction_map().line(1).unwrap().is_raw_data());

    let fit = session.patch_bytes(1, &[NOP]).unwrap();
    assert_eq!(fit, PatchFit::SameSize);
    assert_eq!(session.render_line(0).unwrap(), "%DAT 0xEE");
    assert_eq!(session.render_line(1).unwrap(), "NOP");
    assert!(session.instruction_map().is_contiguous(256));
}
