//! Bytecode error types

use thiserror::Error;

/// Errors produced while decoding instruction words.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BytecodeError {
    /// The opcode field does not name a defined opcode.
    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),
}
