//! # Zephyr
//!
//! An embeddable scripting toolchain for entity behavior. Source files
//! declare states and per-state event handlers; each handler compiles to a
//! bytecode chunk that a stack VM runs to completion against one entity's
//! [`RuntimeContext`].
//!
//! ```text
//! source ──lexer──▶ tokens ──compile──▶ ScriptDefinition ──Vm::dispatch──▶ effects
//! ```
//!
//! The VM reaches the host engine only through the traits in
//! [`runtime::host`].

pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;

use std::rc::Rc;

pub use bytecode::compile::compile;
pub use bytecode::compile_error::{CompileError, Diagnostic, DiagnosticKind};
pub use bytecode::{Chunk, OpCode};
pub use lang::value::{Value, ValueType};
pub use runtime::host::{EntityId, EntityLookup, EventSink, HostBridge, NullHost};
pub use runtime::queue::EventQueue;
pub use runtime::registry::{RegistryError, ScriptRegistry};
pub use runtime::runtime_error::{RuntimeError, RuntimeFault};
pub use runtime::script::{ArgBag, RuntimeContext, ScriptDefinition};
pub use runtime::vm_bc::{DispatchOutcome, Vm, VmConfig};

/// Allocates a fresh context for `definition` in `initial_state`.
pub fn create_instance(
    definition: Rc<ScriptDefinition>,
    initial_state: &str,
) -> Result<RuntimeContext, RuntimeFault> {
    RuntimeContext::new(definition, initial_state)
}

/// Runs one event against `ctx` on a throwaway default VM.
///
/// Only the outcome of this handler is returned. Faults raised by handlers
/// it reaches through targeted `FireEvent` are logged and then discarded
/// with the VM. Hosts that need them, or that dispatch many events, should
/// keep their own [`Vm`] and call [`Vm::take_nested_faults`].
pub fn dispatch(
    ctx: &mut RuntimeContext,
    event: &str,
    args: &ArgBag,
    host: &mut dyn HostBridge,
) -> Result<DispatchOutcome, RuntimeError> {
    Vm::new().dispatch(ctx, event, args, host)
}

/// Text listing of a chunk, one instruction per line.
pub fn disassemble(chunk: &Chunk) -> String {
    bytecode::disasm::disassemble(chunk)
}
