use core::fmt;

/// Operation of a single bytecode instruction.
///
/// Stack effects are written `before -- after` with the top of the data
/// stack to the right. Operands come from the code object's argument array
/// starting at the instruction's argument base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Opcode {
    /// Operand: register index `k`. `( -- regs[k])`
    LoadReg = 0x00,
    /// Operand: register index `k`. `(x -- )`, storing `x` into `regs[k]`.
    StoreReg = 0x01,
    /// Operand: register index `k`; `regs[k]` must hold a ref.
    /// `( -- regs[k].referent)`
    LoadRef = 0x02,
    /// Operand: register index `k`; `regs[k]` must hold a ref.
    /// `(x -- )`, storing `x` through the ref.
    StoreRef = 0x03,
    /// Operand: a literal value `v`. `( -- v)`
    LoadValue = 0x04,
    /// Operand: register index `k`. `(x -- )`, placing a fresh ref holding
    /// `x` into `regs[k]`.
    InitRef = 0x05,
    /// Operand: a module ref-slot. `( -- slot.referent)`
    LoadModule = 0x06,
    /// Operand: a module ref-slot. `(x -- )`, storing `x` into the slot.
    StoreModule = 0x07,
    /// Operands: a multimethod and an argument count `n`.
    /// `(a1 .. an -- result)`
    Invoke = 0x08,
    /// As [`Opcode::Invoke`], but the current frame is unwound before the
    /// callee frame is created.
    InvokeTail = 0x09,
    /// `(x -- )`
    Drop = 0x0a,
    /// Operand: component count `n`. `(x1 .. xn -- tuple)`
    MakeTuple = 0x0b,
    /// Operand: component count `n`. `(x1 .. xn -- array)`
    MakeArray = 0x0c,
    /// Operand: component count `n`. `(x1 .. xn -- vector)`
    MakeVector = 0x0d,
    /// Operand: a code template. Pops as many captured values as the code's
    /// upreg map names; pushes the closure.
    MakeClosure = 0x0e,
    /// Operand: slot count `n`. `(x1 .. xn type -- instance)`; the type's
    /// total slot count must equal `n`.
    MakeInstance = 0x0f,
    /// `(x -- x)`, signalling a condition unless `x` is a type.
    VerifyIsType = 0x10,
    /// Operand: slot index `i`. `(instance -- instance.slots[i])`
    GetSlot = 0x11,
    /// Operand: slot index `i`. `(instance x -- )`, storing `x` into slot
    /// `i`.
    SetSlot = 0x12,
}

/// The byte can't be mapped to any known [`Opcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvalidOpcode(pub u8);

impl fmt::Display for InvalidOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid opcode byte {:#04x}", self.0)
    }
}

impl std::error::Error for InvalidOpcode {}

impl Opcode {
    /// Number of distinct opcodes.
    pub const COUNT: usize = 19;

    /// Mnemonic used by disassembly.
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::LoadReg => "load_reg",
            Opcode::StoreReg => "store_reg",
            Opcode::LoadRef => "load_ref",
            Opcode::StoreRef => "store_ref",
            Opcode::LoadValue => "load_value",
            Opcode::InitRef => "init_ref",
            Opcode::LoadModule => "load_module",
            Opcode::StoreModule => "store_module",
            Opcode::Invoke => "invoke",
            Opcode::InvokeTail => "invoke_tail",
            Opcode::Drop => "drop",
            Opcode::MakeTuple => "make_tuple",
            Opcode::MakeArray => "make_array",
            Opcode::MakeVector => "make_vector",
            Opcode::MakeClosure => "make_closure",
            Opcode::MakeInstance => "make_instance",
            Opcode::VerifyIsType => "verify_is_type",
            Opcode::GetSlot => "get_slot",
            Opcode::SetSlot => "set_slot",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match byte {
            0x00 => LoadReg,
            0x01 => StoreReg,
            0x02 => LoadRef,
            0x03 => StoreRef,
            0x04 => LoadValue,
            0x05 => InitRef,
            0x06 => LoadModule,
            0x07 => StoreModule,
            0x08 => Invoke,
            0x09 => InvokeTail,
            0x0a => Drop,
            0x0b => MakeTuple,
            0x0c => MakeArray,
            0x0d => MakeVector,
            0x0e => MakeClosure,
            0x0f => MakeInstance,
            0x10 => VerifyIsType,
            0x11 => GetSlot,
            0x12 => SetSlot,
            _ => return Err(InvalidOpcode(byte)),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}
