use core::fmt;

use crate::{InvalidOpcode, Opcode};

/// An instruction in its undecoded 32-bit wire form.
pub type RawInstruction = u32;

/// Number of bits available for the argument base index.
const ARGS_BASE_BITS: u32 = 24;

/// Largest representable argument base index.
const ARGS_BASE_MAX: u32 = (1 << ARGS_BASE_BITS) - 1;

static_assertions::const_assert_eq!(ARGS_BASE_BITS + 8, 32);

/// A decoded instruction: an [`Opcode`] in the low 8 bits and the index
/// into the argument array where the instruction's operands begin in the
/// upper 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    opcode: Opcode,
    args_base: u32,
}

/// The word can't be decoded into an [`Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvalidInstruction {
    /// The offending word.
    pub raw: RawInstruction,
    /// The opcode failure underneath.
    pub source: InvalidOpcode,
}

impl fmt::Display for InvalidInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid instruction word {:#010x}: {}", self.raw, self.source)
    }
}

impl std::error::Error for InvalidInstruction {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl Instruction {
    /// Size of an encoded instruction, in bytes.
    pub const LEN: usize = 4;

    /// Build an instruction. Aborts if `args_base` does not fit its 24 bits;
    /// the compiler collaborator guarantees argument arrays stay below that
    /// bound.
    #[track_caller]
    pub fn new(opcode: Opcode, args_base: u32) -> Self {
        assert!(args_base <= ARGS_BASE_MAX, "argument base index out of range");
        Instruction { opcode, args_base }
    }

    /// The operation.
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Index into the argument array where the operands begin.
    pub const fn args_base(&self) -> usize {
        self.args_base as usize
    }
}

impl From<Instruction> for RawInstruction {
    fn from(inst: Instruction) -> RawInstruction {
        (inst.args_base << 8) | inst.opcode as u32
    }
}

impl TryFrom<RawInstruction> for Instruction {
    type Error = InvalidInstruction;

    fn try_from(raw: RawInstruction) -> Result<Self, Self::Error> {
        let opcode = Opcode::try_from((raw & 0xff) as u8)
            .map_err(|source| InvalidInstruction { raw, source })?;
        Ok(Instruction {
            opcode,
            args_base: raw >> 8,
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{}", self.opcode.mnemonic(), self.args_base)
    }
}
