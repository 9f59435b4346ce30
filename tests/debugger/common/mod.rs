use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::sync::Arc;
use vmstalker::debugger::processor::{read_u64, write_le};
use vmstalker::debugger::register::REGISTER_COUNT;
use vmstalker::debugger::{
    Assembled, Assembler, Completion, Config, Decoded, Disassembler, Error, EventHook, Processor,
    Register, RegisterMap, RunOutcome, Session, SessionBuilder, StatusFlags, StepIo, StopReason,
};

pub const HLT: u8 = 0x00;
pub const NOP: u8 = 0x01;
pub const JMP: u8 = 0x02;
pub const INC: u8 = 0x10;
pub const SET: u8 = 0x11;
pub const STB: u8 = 0x12;
pub const RD: u8 = 0x13;
pub const WR: u8 = 0x14;
pub const ADD: u8 = 0x20;
pub const CAL: u8 = 0xB0;
pub const RET: u8 = 0xBA;
pub const BAD: u8 = 0xEE;

/// Encoded length of an instruction, `None` for unknown opcodes.
fn instruction_len(opcode: u8) -> Option<usize> {
    Some(match opcode {
        HLT | NOP | RET => 1,
        INC | RD | WR => 2,
        ADD => 4,
        JMP | CAL => 9,
        SET | STB => 10,
        _ => return None,
    })
}

/// Minimal virtual CPU.
///
/// | opcode | instruction    | size |
/// |--------|----------------|------|
/// | 0x00   | HLT            | 1    |
/// | 0x01   | NOP            | 1    |
/// | 0x02   | JMP addr64     | 9    |
/// | 0x10   | INC reg        | 2    |
/// | 0x11   | SET reg, imm64 | 10   |
/// | 0x12   | STB addr64, b  | 10   |
/// | 0x13   | RD reg         | 2    |
/// | 0x14   | WR reg         | 2    |
/// | 0x20   | ADD reg, imm16 | 4    |
/// | 0xB0   | CAL addr64     | 9    |
/// | 0xBA   | RET            | 1    |
///
/// Anything else is a fault.
pub struct TestCpu {
    registers: [u64; REGISTER_COUNT],
    memory: Vec<u8>,
    program_len: u64,
    legacy: bool,
}

impl TestCpu {
    pub fn new(program: &[u8], memory_len: usize) -> Self {
        let mut memory = vec![0; memory_len];
        memory[..program.len()].copy_from_slice(program);
        let mut registers = [0; REGISTER_COUNT];
        registers[Register::Rso.index()] = memory_len as u64;
        registers[Register::Rsb.index()] = memory_len as u64;
        Self {
            registers,
            memory,
            program_len: program.len() as u64,
            legacy: false,
        }
    }

    pub fn legacy(self) -> Self {
        Self {
            legacy: true,
            ..self
        }
    }

    fn operand_u64(&self, at: u64) -> anyhow::Result<u64> {
        read_u64(&self.memory, at).ok_or_else(|| anyhow::anyhow!("operand out of memory at {at:#X}"))
    }

    fn byte(&self, at: u64) -> anyhow::Result<u8> {
        self.memory
            .get(at as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("read out of memory at {at:#X}"))
    }

    fn reg_operand(&self, at: u64) -> anyhow::Result<usize> {
        let idx = self.byte(at)? as usize;
        anyhow::ensure!(idx < REGISTER_COUNT, "invalid register {idx}");
        Ok(idx)
    }

    fn push(&mut self, value: u64) -> anyhow::Result<()> {
        let rso = self.register(Register::Rso) - 8;
        anyhow::ensure!(write_le(&mut self.memory, rso, 8, value), "stack overflow");
        self.set_register(Register::Rso, rso);
        Ok(())
    }
}

impl Processor for TestCpu {
    fn step(&mut self, io: StepIo<'_>) -> anyhow::Result<bool> {
        let pc = self.register(Register::Rpo);
        let opcode = self.byte(pc)?;
        let next = pc + instruction_len(opcode).unwrap_or(1) as u64;

        match opcode {
            HLT => return Ok(true),
            NOP => {}
            JMP => {
                let target = self.operand_u64(pc + 1)?;
                self.set_register(Register::Rpo, target);
                return Ok(false);
            }
            INC => {
                let reg = self.reg_operand(pc + 1)?;
                self.registers[reg] = self.registers[reg].wrapping_add(1);
            }
            SET => {
                let reg = self.reg_operand(pc + 1)?;
                self.registers[reg] = self.operand_u64(pc + 2)?;
            }
            STB => {
                let addr = self.operand_u64(pc + 1)?;
                let value = self.byte(pc + 9)?;
                anyhow::ensure!(
                    write_le(&mut self.memory, addr, 1, value as u64),
                    "write out of memory at {addr:#X}"
                );
            }
            RD => {
                let reg = self.reg_operand(pc + 1)?;
                let mut buf = [0u8; 1];
                if io.input.read(&mut buf)? == 0 {
                    let flags = StatusFlags::from_bits_retain(self.register(Register::Rsf))
                        | StatusFlags::FILE_END;
                    self.set_register(Register::Rsf, flags.bits());
                } else {
                    self.registers[reg] = buf[0] as u64;
                }
            }
            WR => {
                let reg = self.reg_operand(pc + 1)?;
                io.output.write_all(&[self.registers[reg] as u8])?;
            }
            ADD => {
                let reg = self.reg_operand(pc + 1)?;
                let imm = u16::from_le_bytes([self.byte(pc + 2)?, self.byte(pc + 3)?]);
                self.registers[reg] = self.registers[reg].wrapping_add(imm as u64);
            }
            CAL => {
                let target = self.operand_u64(pc + 1)?;
                let rsb = self.register(Register::Rsb);
                if self.legacy {
                    let rso = self.register(Register::Rso);
                    self.push(next)?;
                    self.push(rsb)?;
                    self.push(rso)?;
                } else {
                    self.push(next)?;
                    self.push(rsb)?;
                }
                let base = self.register(Register::Rso);
                self.set_register(Register::Rsb, base);
                self.set_register(Register::Rpo, target);
                return Ok(false);
            }
            RET => {
                let base = self.register(Register::Rsb);
                let size = self.frame_record_size();
                let ret = self.operand_u64(base + size - 8)?;
                let caller_rsb = self.operand_u64(base + size - 16)?;
                self.set_register(Register::Rpo, ret);
                self.set_register(Register::Rsb, caller_rsb);
                self.set_register(Register::Rso, base + size);
                return Ok(false);
            }
            other => anyhow::bail!("invalid opcode {other:#04X} at {pc:#X}"),
        }

        self.set_register(Register::Rpo, next);
        Ok(false)
    }

    fn registers(&self) -> &[u64] {
        &self.registers
    }

    fn registers_mut(&mut self) -> &mut [u64] {
        &mut self.registers
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn mapped_ranges(&self) -> Vec<Range<u64>> {
        let memory_len = self.memory.len() as u64;
        let stack_top = self.register(Register::Rso).min(memory_len);
        let mut ranges = vec![0..self.program_len];
        if stack_top < memory_len {
            ranges.push(stack_top..memory_len);
        }
        ranges
    }

    fn use_legacy_call_stack(&self) -> bool {
        self.legacy
    }
}

fn register_name(idx: u8) -> String {
    Register::from_repr(idx as usize)
        .map(|r| r.to_string())
        .unwrap_or_else(|| format!("r?{idx}"))
}

pub struct TestDisassembler;

impl Disassembler for TestDisassembler {
    fn decode_one(&self, bytes: &[u8]) -> Decoded {
        let opcode = bytes[0];
        let raw = || Decoded {
            text: format!("%DAT 0x{opcode:02X}"),
            length: 1,
            references: SmallVec::new(),
        };
        let Some(len) = instruction_len(opcode) else {
            return raw();
        };
        if bytes.len() < len {
            return raw();
        }

        let u64_at = |at: usize| u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        let (text, references) = match opcode {
            HLT => ("HLT".to_string(), vec![]),
            NOP => ("NOP".to_string(), vec![]),
            RET => ("RET".to_string(), vec![]),
            JMP => (format!("JMP 0x{:X}", u64_at(1)), vec![u64_at(1)]),
            CAL => (format!("CAL 0x{:X}", u64_at(1)), vec![u64_at(1)]),
            INC => (format!("INC {}", register_name(bytes[1])), vec![]),
            RD => (format!("RD {}", register_name(bytes[1])), vec![]),
            WR => (format!("WR {}", register_name(bytes[1])), vec![]),
            SET => (
                format!("SET {}, 0x{:X}", register_name(bytes[1]), u64_at(2)),
                vec![],
            ),
            STB => (
                format!("STB 0x{:X}, 0x{:X}", u64_at(1), bytes[9]),
                vec![u64_at(1)],
            ),
            ADD => (
                format!(
                    "ADD {}, 0x{:X}",
                    register_name(bytes[1]),
                    u16::from_le_bytes([bytes[2], bytes[3]])
                ),
                vec![],
            ),
            _ => unreachable!(),
        };

        Decoded {
            text,
            length: len as u64,
            references: SmallVec::from_vec(references),
        }
    }
}

/// Assembler for a subset of the test instruction set:
/// `HLT`, `NOP`, `RET`, `INC reg`, `ADD reg, imm`, `JMP target`, `CAL target`,
/// where a target is either a number or a `:label`.
pub struct TestAssembler;

fn parse_number(text: &str) -> anyhow::Result<u64> {
    let text = text.trim();
    Ok(match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => text.parse()?,
    })
}

fn parse_register(text: &str) -> anyhow::Result<u8> {
    let register: Register = text.trim().parse()?;
    Ok(register.index() as u8)
}

impl Assembler for TestAssembler {
    fn assemble(&self, line: &str) -> anyhow::Result<Assembled> {
        let line = line.trim();
        let (mnemonic, operands) = line.split_once(' ').unwrap_or((line, ""));
        let operands: Vec<&str> = operands
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .collect();

        let mut assembled = Assembled::default();
        match (mnemonic.to_uppercase().as_str(), operands.as_slice()) {
            ("HLT", []) => assembled.bytes.push(HLT),
            ("NOP", []) => assembled.bytes.push(NOP),
            ("RET", []) => assembled.bytes.push(RET),
            ("INC", [reg]) => assembled.bytes.extend([INC, parse_register(reg)?]),
            ("ADD", [reg, imm]) => {
                let imm = u16::try_from(parse_number(imm)?)?;
                assembled.bytes.extend([ADD, parse_register(reg)?]);
                assembled.bytes.extend(imm.to_le_bytes());
            }
            (op @ ("JMP" | "CAL"), [target]) => {
                assembled.bytes.push(if op == "JMP" { JMP } else { CAL });
                match target.strip_prefix(':') {
                    Some(label) => {
                        assembled.label_references.push((label.to_string(), 1));
                        assembled.bytes.extend([0; 8]);
                    }
                    None => assembled.bytes.extend(parse_number(target)?.to_le_bytes()),
                }
            }
            _ => anyhow::bail!("unknown statement: {line}"),
        }
        Ok(assembled)
    }
}

/// Program text builder.
#[derive(Default)]
pub struct Program {
    bytes: Vec<u8>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn here(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hlt(&mut self) -> &mut Self {
        self.bytes.push(HLT);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.bytes.push(NOP);
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.bytes.push(RET);
        self
    }

    pub fn bad(&mut self) -> &mut Self {
        self.bytes.push(BAD);
        self
    }

    pub fn jmp(&mut self, target: u64) -> &mut Self {
        self.bytes.push(JMP);
        self.bytes.extend(target.to_le_bytes());
        self
    }

    pub fn cal(&mut self, target: u64) -> &mut Self {
        self.bytes.push(CAL);
        self.bytes.extend(target.to_le_bytes());
        self
    }

    pub fn inc(&mut self, reg: Register) -> &mut Self {
        self.bytes.extend([INC, reg.index() as u8]);
        self
    }

    pub fn rd(&mut self, reg: Register) -> &mut Self {
        self.bytes.extend([RD, reg.index() as u8]);
        self
    }

    pub fn wr(&mut self, reg: Register) -> &mut Self {
        self.bytes.extend([WR, reg.index() as u8]);
        self
    }

    pub fn add(&mut self, reg: Register, imm: u16) -> &mut Self {
        self.bytes.extend([ADD, reg.index() as u8]);
        self.bytes.extend(imm.to_le_bytes());
        self
    }

    pub fn set(&mut self, reg: Register, value: u64) -> &mut Self {
        self.bytes.extend([SET, reg.index() as u8]);
        self.bytes.extend(value.to_le_bytes());
        self
    }

    pub fn stb(&mut self, address: u64, value: u8) -> &mut Self {
        self.bytes.push(STB);
        self.bytes.extend(address.to_le_bytes());
        self.bytes.push(value);
        self
    }
}

#[derive(Clone, Default)]
pub struct TestInfo {
    pub pc: Arc<Cell<Option<u64>>>,
    pub reason: Arc<RefCell<Option<StopReason>>>,
    pub halted_at: Arc<Cell<Option<u64>>>,
    pub fault: Arc<RefCell<Option<String>>>,
    pub instructions: Arc<Cell<usize>>,
    pub last_registers: Arc<Cell<Option<RegisterMap>>>,
}

#[derive(Default)]
pub struct TestHooks {
    info: TestInfo,
}

impl TestHooks {
    pub fn new(info: TestInfo) -> Self {
        Self { info }
    }
}

impl EventHook for TestHooks {
    fn on_instruction(&self, registers: &RegisterMap) {
        self.info.instructions.set(self.info.instructions.get() + 1);
        self.info.last_registers.set(Some(*registers));
    }

    fn on_break(&self, pc: u64, reason: &StopReason) -> anyhow::Result<()> {
        self.info.pc.set(Some(pc));
        self.info.reason.replace(Some(reason.clone()));
        Ok(())
    }

    fn on_halt(&self, pc: u64) {
        self.info.halted_at.set(Some(pc));
    }

    fn on_fault(&self, error: &Error) {
        self.info.fault.replace(Some(error.to_string()));
    }
}

pub const MEMORY_LEN: usize = 256;

pub fn session_with(cpu: TestCpu, info: &TestInfo, config: Config) -> Session {
    SessionBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .with_config(config)
        .build(Box::new(cpu), Box::new(TestDisassembler))
}

/// Load `program` into a processor with [`MEMORY_LEN`] bytes of memory.
pub fn session(program: &Program, info: &TestInfo) -> Session {
    session_with(
        TestCpu::new(program.bytes(), MEMORY_LEN),
        info,
        Config::default(),
    )
}

pub fn rpo(session: &Session) -> u64 {
    session.registers().unwrap().value(Register::Rpo)
}

pub fn reg(session: &Session, register: Register) -> u64 {
    session.registers().unwrap().value(register)
}

/// Wait for the run in flight and return its outcome, panic on a fault.
pub fn finish(session: &mut Session) -> RunOutcome {
    match session.wait() {
        Some(Completion::Finished(outcome)) => outcome,
        other => panic!("expected finished run, got {other:?}"),
    }
}

/// Wait for the run in flight, it must end with a fault.
pub fn fault(session: &mut Session) -> Error {
    match session.wait() {
        Some(Completion::Fault(err)) => err,
        other => panic!("expected fault, got {other:?}"),
    }
}

/// Address of `f` in [`nested_calls`].
pub const F: u64 = 12;
/// Address of `g` in [`nested_calls`].
pub const G: u64 = 24;

/// ```text
/// 0x00: CAL f
/// 0x09: INC rg0
/// 0x0B: HLT
/// f:
/// 0x0C: CAL g
/// 0x15: INC rg1
/// 0x17: RET
/// g:
/// 0x18: INC rg2
/// 0x1A: RET
/// ```
pub fn nested_calls() -> Program {
    let mut program = Program::new();
    program.cal(F).inc(Register::Rg0).hlt();
    assert_eq!(program.here(), F);
    program.cal(G).inc(Register::Rg1).ret();
    assert_eq!(program.here(), G);
    program.inc(Register::Rg2).ret();
    program
}
