//! Bytecode disassembly
//!
//! Renders instruction words for diagnostics and the CLI's `--dump-bytecode`
//! flag.

use std::fmt::Write;

use crate::instruction::{Instruction, Opcode};

/// Operand shape of an opcode, used to pick the printed fields.
enum Shape {
    Abc,
    Abx,
    Asbx,
}

fn shape(op: Opcode) -> Shape {
    match op {
        Opcode::LoadSymbol
        | Opcode::StoreSymbol
        | Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Eq
        | Opcode::Ne
        | Opcode::Lt
        | Opcode::Le
        | Opcode::Gt
        | Opcode::Ge
        | Opcode::And
        | Opcode::Or
        | Opcode::Call => Shape::Abc,
        Opcode::LoadBasic
        | Opcode::StoreMove
        | Opcode::NewInstance
        | Opcode::Not
        | Opcode::Return => Shape::Abx,
        Opcode::Jump | Opcode::JumpIf | Opcode::JumpIfNot => Shape::Asbx,
    }
}

/// Render one instruction word.
pub fn disassemble_instruction(inst: Instruction) -> String {
    match inst.op() {
        Ok(op) => match shape(op) {
            Shape::Abc => format!(
                "{:12} a:{:3} b:{:3} c:{:3}",
                op.mnemonic(),
                inst.a(),
                inst.b(),
                inst.c()
            ),
            Shape::Abx => format!("{:12} a:{:3} bx:{:6}", op.mnemonic(), inst.a(), inst.bx()),
            Shape::Asbx => format!("{:12} a:{:3} sbx:{:+6}", op.mnemonic(), inst.a(), inst.sbx()),
        },
        Err(_) => format!("??           0x{:08X}", inst.0),
    }
}

/// Render an instruction sequence, one line per word, with an optional
/// source-line sidecar.
pub fn disassemble(code: &[Instruction], lines: Option<&[u16]>) -> String {
    let mut out = String::new();
    for (i, inst) in code.iter().enumerate() {
        if let Some(lines) = lines {
            let line = lines.get(i).copied().unwrap_or(0);
            let _ = write!(out, "line[{line:3}] ");
        }
        let _ = writeln!(out, "{i:04} | 0x{:08X} | {}", inst.0, disassemble_instruction(*inst));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_names_every_opcode() {
        for byte in 0..Opcode::COUNT {
            let op = Opcode::from_u8(byte).unwrap();
            let text = disassemble_instruction(Instruction::abc(op, 0, 0, 0));
            assert!(!text.starts_with("??"), "opcode {byte} rendered as unknown");
        }
    }

    #[test]
    fn test_disassemble_listing() {
        let code = [
            Instruction::abx(Opcode::LoadBasic, 0, 0),
            Instruction::abx(Opcode::Return, 0, 0),
        ];
        let lines = [1u16, 2u16];
        let text = disassemble(&code, Some(&lines));
        assert!(text.contains("LOAD_BASIC"));
        assert!(text.contains("RETURN"));
        assert!(text.contains("line[  1]"));
    }
}
