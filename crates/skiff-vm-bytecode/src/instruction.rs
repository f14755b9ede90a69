//! Bytecode instructions (opcodes) and the packed-word codec

use crate::error::BytecodeError;
use crate::operand::{
    A_SHIFT, B_SHIFT, BX_MASK, BX_SHIFT, C_SHIFT, OP_MASK, REG_MASK, SBX_BIAS,
};

/// Bytecode opcodes
///
/// Register-based instruction set. Registers (`rA`, `rB`, `rC`) name slots in
/// the current call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ==================== Loads ====================
    /// rA = rB.symbols\[rC\] (field / method / module-variable lookup)
    LoadSymbol = 0,
    /// Bx = 0: rA = true; 1: false; 2: null; 3: current module;
    /// >= 4: rA = constants\[Bx - 4\]
    LoadBasic,

    // ==================== Stores ====================
    /// rA = r\[Bx\] (direct register copy; Bx is a register index)
    StoreMove,
    /// rA.symbols\[rB\] = rC
    StoreSymbol,

    // ==================== Memory ====================
    /// rA = new instance of the class in r\[Bx\]; applies field initializers
    NewInstance,

    // ==================== Arithmetic ====================
    /// rA = rB + rC (numbers add; a string operand concatenates)
    Add,
    /// rA = rB - rC
    Sub,
    /// rA = rB * rC
    Mul,
    /// rA = rB / rC
    Div,

    // ==================== Comparison ====================
    /// rA = rB == rC
    Eq,
    /// rA = rB != rC
    Ne,
    /// rA = rB < rC
    Lt,
    /// rA = rB <= rC
    Le,
    /// rA = rB > rC
    Gt,
    /// rA = rB >= rC
    Ge,

    // ==================== Logical ====================
    /// rA = truthy(rB) && truthy(rC) (short-circuit is a compiler-emitted jump)
    And,
    /// rA = truthy(rB) || truthy(rC)
    Or,
    /// rA = !truthy(r\[Bx\])
    Not,

    // ==================== Control Flow ====================
    /// Call the value in r\[B\] with C positional args laid out from r\[A\];
    /// the return value lands in r\[A\]
    Call,
    /// ip += sBx
    Jump,
    /// if truthy(rA): ip += sBx
    JumpIf,
    /// if !truthy(rA): ip += sBx
    JumpIfNot,
    /// End the frame; copy r\[Bx\] into the frame's result slot (r0)
    Return,
}

/// `LoadBasic` action values carried in the `Bx` operand.
pub mod basic {
    /// rA = true
    pub const TRUE: u32 = 0;
    /// rA = false
    pub const FALSE: u32 = 1;
    /// rA = null
    pub const NULL: u32 = 2;
    /// rA = the module the executing function belongs to
    pub const CURRENT_MODULE: u32 = 3;
    /// rA = constants\[Bx - CONSTANT_BASE\] for Bx >= CONSTANT_BASE
    pub const CONSTANT_BASE: u32 = 4;
}

impl Opcode {
    /// Number of defined opcodes.
    pub const COUNT: u8 = 23;

    /// Decode an opcode from the low bits of an instruction word.
    #[inline]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Opcode::LoadSymbol,
            1 => Opcode::LoadBasic,
            2 => Opcode::StoreMove,
            3 => Opcode::StoreSymbol,
            4 => Opcode::NewInstance,
            5 => Opcode::Add,
            6 => Opcode::Sub,
            7 => Opcode::Mul,
            8 => Opcode::Div,
            9 => Opcode::Eq,
            10 => Opcode::Ne,
            11 => Opcode::Lt,
            12 => Opcode::Le,
            13 => Opcode::Gt,
            14 => Opcode::Ge,
            15 => Opcode::And,
            16 => Opcode::Or,
            17 => Opcode::Not,
            18 => Opcode::Call,
            19 => Opcode::Jump,
            20 => Opcode::JumpIf,
            21 => Opcode::JumpIfNot,
            22 => Opcode::Return,
            _ => return None,
        })
    }

    /// Mnemonic used by the disassembler.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::LoadSymbol => "LOAD_SYMBOL",
            Opcode::LoadBasic => "LOAD_BASIC",
            Opcode::StoreMove => "STORE_MOVE",
            Opcode::StoreSymbol => "STORE_SYMBOL",
            Opcode::NewInstance => "NEW_INSTANCE",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Eq => "CMP_EQ",
            Opcode::Ne => "CMP_NE",
            Opcode::Lt => "CMP_LT",
            Opcode::Le => "CMP_LE",
            Opcode::Gt => "CMP_GT",
            Opcode::Ge => "CMP_GE",
            Opcode::And => "CMP_AND",
            Opcode::Or => "CMP_OR",
            Opcode::Not => "NOT",
            Opcode::Call => "CALL",
            Opcode::Jump => "JUMP",
            Opcode::JumpIf => "JUMP_IF",
            Opcode::JumpIfNot => "JUMP_IF_NOT",
            Opcode::Return => "RETURN",
        }
    }
}

/// One packed 32-bit instruction word.
///
/// Layout: `[5-bit opcode | 9-bit A | 9-bit B | 9-bit C]`, with the `B`/`C`
/// fields alternately read as an 18-bit `Bx` or biased-signed `sBx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Placeholder word emitted for `break`; patched into a forward `Jump`
    /// when the enclosing loop closes. Decodes to no valid opcode.
    pub const INVALID: Instruction = Instruction(0xFFFF_FFFF);

    /// Encode an `op rA, rB, rC` instruction.
    #[inline]
    pub fn abc(op: Opcode, a: u16, b: u16, c: u16) -> Self {
        debug_assert!((a as u32) <= REG_MASK, "operand A out of range");
        debug_assert!((b as u32) <= REG_MASK, "operand B out of range");
        debug_assert!((c as u32) <= REG_MASK, "operand C out of range");
        Self(
            (op as u32 & OP_MASK)
                | ((a as u32 & REG_MASK) << A_SHIFT)
                | ((b as u32 & REG_MASK) << B_SHIFT)
                | ((c as u32 & REG_MASK) << C_SHIFT),
        )
    }

    /// Encode an `op rA, Bx` instruction.
    #[inline]
    pub fn abx(op: Opcode, a: u16, bx: u32) -> Self {
        debug_assert!((a as u32) <= REG_MASK, "operand A out of range");
        debug_assert!(bx <= BX_MASK, "operand Bx out of range");
        Self((op as u32 & OP_MASK) | ((a as u32 & REG_MASK) << A_SHIFT) | ((bx & BX_MASK) << BX_SHIFT))
    }

    /// Encode an `op rA, sBx` instruction (signed, biased storage).
    #[inline]
    pub fn asbx(op: Opcode, a: u16, sbx: i32) -> Self {
        let biased = (sbx + SBX_BIAS) as u32;
        debug_assert!(biased <= BX_MASK, "operand sBx out of range");
        Self::abx(op, a, biased)
    }

    /// Decode the opcode field.
    #[inline]
    pub fn op(self) -> Result<Opcode, BytecodeError> {
        let byte = (self.0 & OP_MASK) as u8;
        Opcode::from_u8(byte).ok_or(BytecodeError::InvalidOpcode(byte))
    }

    /// Decode the `A` field.
    #[inline]
    pub const fn a(self) -> u32 {
        (self.0 >> A_SHIFT) & REG_MASK
    }

    /// Decode the `B` field.
    #[inline]
    pub const fn b(self) -> u32 {
        (self.0 >> B_SHIFT) & REG_MASK
    }

    /// Decode the `C` field.
    #[inline]
    pub const fn c(self) -> u32 {
        (self.0 >> C_SHIFT) & REG_MASK
    }

    /// Decode the wide `Bx` field.
    #[inline]
    pub const fn bx(self) -> u32 {
        (self.0 >> BX_SHIFT) & BX_MASK
    }

    /// Decode the biased-signed `sBx` field.
    #[inline]
    pub const fn sbx(self) -> i32 {
        self.bx() as i32 - SBX_BIAS
    }

    /// Replace the opcode field, keeping all operands.
    #[inline]
    pub fn patch_op(&mut self, op: Opcode) {
        self.0 = (self.0 & !OP_MASK) | (op as u32 & OP_MASK);
    }

    /// Replace the `C` field, keeping everything else.
    #[inline]
    pub fn patch_c(&mut self, c: u16) {
        self.0 = (self.0 & !(REG_MASK << C_SHIFT)) | ((c as u32 & REG_MASK) << C_SHIFT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{MAX_OPERAND_SBX, MIN_OPERAND_SBX};

    #[test]
    fn test_abc_round_trip() {
        let inst = Instruction::abc(Opcode::Add, 3, 500, 511);
        assert_eq!(inst.op().unwrap(), Opcode::Add);
        assert_eq!(inst.a(), 3);
        assert_eq!(inst.b(), 500);
        assert_eq!(inst.c(), 511);
    }

    #[test]
    fn test_abx_round_trip() {
        let inst = Instruction::abx(Opcode::LoadBasic, 511, 262_143);
        assert_eq!(inst.op().unwrap(), Opcode::LoadBasic);
        assert_eq!(inst.a(), 511);
        assert_eq!(inst.bx(), 262_143);
    }

    #[test]
    fn test_asbx_round_trip_extremes() {
        for sbx in [MIN_OPERAND_SBX, -1, 0, 1, MAX_OPERAND_SBX] {
            let inst = Instruction::asbx(Opcode::Jump, 0, sbx);
            assert_eq!(inst.op().unwrap(), Opcode::Jump);
            assert_eq!(inst.sbx(), sbx, "sbx {sbx} did not round trip");
        }
    }

    #[test]
    fn test_encode_decode_identity() {
        // encode(decode(w)) == w for every produced instruction shape
        for op in 0..Opcode::COUNT {
            let op = Opcode::from_u8(op).unwrap();
            let w = Instruction::abc(op, 7, 8, 9);
            let rebuilt = Instruction::abc(w.op().unwrap(), w.a() as u16, w.b() as u16, w.c() as u16);
            assert_eq!(w, rebuilt);
        }
    }

    #[test]
    fn test_invalid_word_has_no_opcode() {
        assert!(Instruction::INVALID.op().is_err());
    }

    #[test]
    fn test_patch_op_and_c() {
        let mut inst = Instruction::abc(Opcode::LoadSymbol, 1, 2, 3);
        inst.patch_op(Opcode::StoreSymbol);
        inst.patch_c(42);
        assert_eq!(inst.op().unwrap(), Opcode::StoreSymbol);
        assert_eq!(inst.a(), 1);
        assert_eq!(inst.b(), 2);
        assert_eq!(inst.c(), 42);
    }

    #[test]
    fn test_opcode_from_u8_rejects_out_of_range() {
        assert_eq!(Opcode::from_u8(Opcode::COUNT), None);
        assert_eq!(Opcode::from_u8(31), None);
    }
}
