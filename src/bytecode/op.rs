// =============================================================================
// OPCODE - one instruction's identifying byte
// =============================================================================

/// Every instruction the Zephyr VM understands.
///
/// Operands follow the opcode byte in the chunk's byte stream; see
/// [`OpCode::operand_width`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // literals
    /// Operand: u8 constant-pool index.
    Constant = 0x01,

    // arithmetic
    Add = 0x10,
    Subtract = 0x11,
    Multiply = 0x12,
    Divide = 0x13,
    Negate = 0x14,

    // comparison and logic
    Equal = 0x20,
    NotEqual = 0x21,
    Greater = 0x22,
    GreaterEqual = 0x23,
    Less = 0x24,
    LessEqual = 0x25,
    Not = 0x26,

    // variables
    /// Operand: u8 constant index of the variable name.
    GetVariable = 0x30,
    /// Operand: u8 constant index of the variable name. Leaves the value on
    /// the stack.
    SetVariable = 0x31,
    /// Operand: u8 constant index of the component name (`x` or `y`).
    GetComponent = 0x32,
    Pop = 0x33,

    // built-in actions
    /// Operands: u8 event name index, u8 flags (bit 0: target on stack),
    /// u8 argument count. Stack: `[target] (name, value)*`.
    FireEvent = 0x40,
    /// Operand: u8 constant index of the state name.
    ChangeState = 0x41,

    // control flow
    /// Operand: u16 forward offset from the next instruction.
    Jump = 0x50,
    /// Operand: u16 forward offset. Peeks the condition, does not pop it.
    JumpIfFalse = 0x51,

    Return = 0x60,

    /// Any byte that does not name an instruction.
    Unknown = 0xFF,
}

/// Flag bit on `FireEvent`: a target entity name sits below the arguments.
pub const FIRE_HAS_TARGET: u8 = 0b0000_0001;

impl OpCode {
    /// Checked decode. Never fails: unrecognized bytes map to `Unknown`.
    pub fn from_byte(byte: u8) -> OpCode {
        use OpCode::*;
        match byte {
            0x01 => Constant,
            0x10 => Add,
            0x11 => Subtract,
            0x12 => Multiply,
            0x13 => Divide,
            0x14 => Negate,
            0x20 => Equal,
            0x21 => NotEqual,
            0x22 => Greater,
            0x23 => GreaterEqual,
            0x24 => Less,
            0x25 => LessEqual,
            0x26 => Not,
            0x30 => GetVariable,
            0x31 => SetVariable,
            0x32 => GetComponent,
            0x33 => Pop,
            0x40 => FireEvent,
            0x41 => ChangeState,
            0x50 => Jump,
            0x51 => JumpIfFalse,
            0x60 => Return,
            _ => Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Number of operand bytes following the opcode.
    pub fn operand_width(self) -> usize {
        use OpCode::*;
        match self {
            Constant | GetVariable | SetVariable | GetComponent | ChangeState => 1,
            Jump | JumpIfFalse => 2,
            FireEvent => 3,
            _ => 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Constant => "CONSTANT",
            Add => "ADD",
            Subtract => "SUBTRACT",
            Multiply => "MULTIPLY",
            Divide => "DIVIDE",
            Negate => "NEGATE",
            Equal => "EQUAL",
            NotEqual => "NOT_EQUAL",
            Greater => "GREATER",
            GreaterEqual => "GREATER_EQUAL",
            Less => "LESS",
            LessEqual => "LESS_EQUAL",
            Not => "NOT",
            GetVariable => "GET_VARIABLE",
            SetVariable => "SET_VARIABLE",
            GetComponent => "GET_COMPONENT",
            Pop => "POP",
            FireEvent => "FIRE_EVENT",
            ChangeState => "CHANGE_STATE",
            Jump => "JUMP",
            JumpIfFalse => "JUMP_IF_FALSE",
            Return => "RETURN",
            Unknown => "UNKNOWN",
        }
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        OpCode::from_byte(byte)
    }
}
