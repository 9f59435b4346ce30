//! Opcode level knowledge about control flow: return instructions, jumps and their conditions.

use crate::debugger::processor::read_u64;
use crate::debugger::register::StatusFlags;
use std::fmt::{Display, Formatter};

/// Opcode prefix telling that the next two bytes are extension set and instruction code.
pub const FULLY_QUALIFIED_MARKER: u8 = 0xFF;
/// Encoding of the `NOP` instruction.
pub const NOP: u8 = 0x01;
/// Encoding of the `HLT` instruction.
pub const HALT: u8 = 0x00;
/// First bytes of instructions that return from a subroutine.
pub const RETURN_OPCODES: [u8; 5] = [0xBA, 0xBB, 0xBC, 0xBD, 0xBE];

#[inline(always)]
pub fn is_return(byte: u8) -> bool {
    RETURN_OPCODES.contains(&byte)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Opcode {
    pub extension_set: u8,
    pub code: u8,
}

impl Opcode {
    pub const fn new(extension_set: u8, code: u8) -> Self {
        Self {
            extension_set,
            code,
        }
    }

    /// Parse an opcode at `address`.
    /// Returns the opcode and the address of its first operand byte.
    pub fn parse(memory: &[u8], address: u64) -> Option<(Opcode, u64)> {
        let at = usize::try_from(address).ok()?;
        let first = *memory.get(at)?;
        if first != FULLY_QUALIFIED_MARKER {
            return Some((Opcode::new(0x00, first), address + 1));
        }
        let extension_set = *memory.get(at + 1)?;
        let code = *memory.get(at + 2)?;
        Some((Opcode::new(extension_set, code), address + 3))
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}:{:02X}", self.extension_set, self.code)
    }
}

/// Flag condition of a conditional jump, jump is taken if `rsf & mask == flags`
/// for any condition in the list.
type Condition = (StatusFlags, StatusFlags);

const UNCONDITIONAL_JUMPS: [Opcode; 2] = [Opcode::new(0x00, 0x02), Opcode::new(0x00, 0x03)];

const EMPTY: StatusFlags = StatusFlags::empty();
const ZERO_AND_CARRY: StatusFlags = StatusFlags::ZERO.union(StatusFlags::CARRY);
const SIGN_AND_OVERFLOW: StatusFlags = StatusFlags::SIGN.union(StatusFlags::OVERFLOW);
const SIGN_OVERFLOW_ZERO: StatusFlags = SIGN_AND_OVERFLOW.union(StatusFlags::ZERO);

const CONDITIONAL_JUMPS: &[(Opcode, &[Condition])] = &[
    // jeq/jzo
    (Opcode::new(0x00, 0x04), &[(StatusFlags::ZERO, StatusFlags::ZERO)]),
    // jne/jnz
    (Opcode::new(0x00, 0x06), &[(EMPTY, StatusFlags::ZERO)]),
    // jlt/jca
    (Opcode::new(0x00, 0x08), &[(StatusFlags::CARRY, StatusFlags::CARRY)]),
    // jle
    (
        Opcode::new(0x00, 0x0A),
        &[
            (StatusFlags::CARRY, StatusFlags::CARRY),
            (StatusFlags::ZERO, StatusFlags::ZERO),
        ],
    ),
    // jgt
    (Opcode::new(0x00, 0x0C), &[(EMPTY, ZERO_AND_CARRY)]),
    // jge
    (Opcode::new(0x00, 0x0E), &[(EMPTY, StatusFlags::CARRY)]),
    // signed jlt
    (
        Opcode::new(0x01, 0x00),
        &[
            (StatusFlags::SIGN, SIGN_AND_OVERFLOW),
            (StatusFlags::OVERFLOW, SIGN_AND_OVERFLOW),
        ],
    ),
    // signed jle
    (
        Opcode::new(0x01, 0x02),
        &[
            (StatusFlags::SIGN, SIGN_AND_OVERFLOW),
            (StatusFlags::OVERFLOW, SIGN_AND_OVERFLOW),
            (StatusFlags::ZERO, StatusFlags::ZERO),
        ],
    ),
    // signed jgt
    (
        Opcode::new(0x01, 0x04),
        &[
            (SIGN_AND_OVERFLOW, SIGN_OVERFLOW_ZERO),
            (EMPTY, SIGN_OVERFLOW_ZERO),
        ],
    ),
    // signed jge
    (
        Opcode::new(0x01, 0x06),
        &[
            (SIGN_AND_OVERFLOW, SIGN_AND_OVERFLOW),
            (EMPTY, SIGN_AND_OVERFLOW),
        ],
    ),
    // jsi
    (Opcode::new(0x01, 0x08), &[(StatusFlags::SIGN, StatusFlags::SIGN)]),
    // jns
    (Opcode::new(0x01, 0x0A), &[(EMPTY, StatusFlags::SIGN)]),
    // jov
    (Opcode::new(0x01, 0x0C), &[(StatusFlags::OVERFLOW, StatusFlags::OVERFLOW)]),
    // jno
    (Opcode::new(0x01, 0x0E), &[(EMPTY, StatusFlags::OVERFLOW)]),
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JumpKind {
    Unconditional,
    /// Conditional jump, `satisfied` is `true` if the current flags make the jump taken.
    Conditional { satisfied: bool },
}

/// Jump instruction found at some address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Branch {
    pub source: u64,
    pub target: u64,
    pub kind: JumpKind,
}

impl Branch {
    pub fn will_jump(&self) -> bool {
        match self.kind {
            JumpKind::Unconditional => true,
            JumpKind::Conditional { satisfied } => satisfied,
        }
    }
}

/// Return the flag conditions of a conditional jump opcode.
pub fn jump_conditions(opcode: Opcode) -> Option<&'static [Condition]> {
    CONDITIONAL_JUMPS
        .iter()
        .find(|(op, _)| *op == opcode)
        .map(|(_, conditions)| *conditions)
}

/// Inspect the instruction at `address`. Returns `None` if it's not a jump or if memory
/// ends before its target operand.
pub fn analyze_branch(memory: &[u8], address: u64, flags: StatusFlags) -> Option<Branch> {
    let (opcode, operand) = Opcode::parse(memory, address)?;

    let kind = if UNCONDITIONAL_JUMPS.contains(&opcode) {
        JumpKind::Unconditional
    } else {
        let conditions = jump_conditions(opcode)?;
        let satisfied = conditions
            .iter()
            .any(|(expected, mask)| flags.matches(*expected, *mask));
        JumpKind::Conditional { satisfied }
    };

    let target = read_u64(memory, operand)?;
    Some(Branch {
        source: address,
        target,
        kind,
    })
}
