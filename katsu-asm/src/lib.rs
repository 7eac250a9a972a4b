//! Bytecode primitives of the KatsuVM.
//!
//! An instruction is one 32-bit word: the low 8 bits are the [`Opcode`],
//! the upper 24 bits index into the code object's argument array where the
//! instruction's operands begin. Operands are full values and live outside
//! the instruction stream.

#![warn(missing_docs)]

mod condition;
mod instruction;
mod opcode;

pub use condition::ConditionTag;
pub use instruction::{Instruction, InvalidInstruction, RawInstruction};
pub use opcode::{InvalidOpcode, Opcode};
