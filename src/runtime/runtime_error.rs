use thiserror::Error;

/// Why a handler invocation was aborted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeFault {
    #[error("type mismatch: cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("type mismatch: '{op}' expects {expected}, got {got}")]
    UnaryTypeMismatch {
        op: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack overflow: more than {0} values")]
    StackOverflow(usize),

    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("truncated instruction: missing operand bytes")]
    TruncatedInstruction,

    #[error("bad constant index {0}")]
    BadConstant(u8),

    #[error("unknown state '{0}'")]
    UnknownState(String),

    #[error("unresolved target entity '{0}'")]
    UnresolvedTarget(String),

    #[error("entity '{0}' is already handling an event")]
    ReentrantDispatch(String),

    #[error("dispatch depth limit exceeded ({0})")]
    DispatchDepthExceeded(usize),

    #[error("execution step limit exceeded ({0})")]
    StepLimitExceeded(usize),

    #[error("'{component}' is not a component of {ty}")]
    NotAComponent {
        component: String,
        ty: &'static str,
    },
}

/// A fault located at the instruction that raised it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("runtime fault in '{chunk}' at {offset:04} (line {line}): {fault}")]
pub struct RuntimeError {
    pub chunk: String,
    pub offset: usize,
    pub line: usize,
    pub fault: RuntimeFault,
}
