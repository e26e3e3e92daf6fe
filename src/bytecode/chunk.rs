use crate::bytecode::OpCode;
use crate::lang::value::Value;
use serde::{Deserialize, Serialize};

/// Largest constant pool a chunk can address with a one-byte operand.
pub const MAX_CONSTANTS: usize = u8::MAX as usize + 1;

/// A compiled event handler: a flat byte stream plus its constant pool.
///
/// Chunks are built by the compiler and never mutated afterwards; every
/// runtime context bound to the owning script reads them in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `State.Event`, used in disassembly and fault reports.
    pub name: String,
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    /// Source line of every byte in `code`.
    pub lines: Vec<usize>,
}

impl Chunk {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write(op.as_byte(), line);
    }

    /// Interns `value`, returning its pool index.
    ///
    /// Identical literals share one slot. Returns `None` once the pool is
    /// full.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        if let Some(index) = self.constants.iter().position(|c| c.same_constant(&value)) {
            return u8::try_from(index).ok();
        }
        if self.constants.len() >= MAX_CONSTANTS {
            return None;
        }
        self.constants.push(value);
        u8::try_from(self.constants.len() - 1).ok()
    }

    pub fn constant(&self, index: u8) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    /// Reads a big-endian u16 operand at `offset`.
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let hi = *self.code.get(offset)?;
        let lo = *self.code.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Opcode sequence with operands stripped, for structural comparisons.
    pub fn opcodes(&self) -> Vec<OpCode> {
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < self.code.len() {
            let op = OpCode::from_byte(self.code[offset]);
            ops.push(op);
            offset += 1 + op.operand_width();
        }
        ops
    }
}
