use std::rc::Rc;

use tracing::{trace, warn};

use crate::bytecode::op::FIRE_HAS_TARGET;
use crate::bytecode::{Chunk, OpCode};
use crate::lang::value::Value;
use crate::runtime::host::HostBridge;
use crate::runtime::runtime_error::{RuntimeError, RuntimeFault};
use crate::runtime::script::{ArgBag, RuntimeContext};

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Dispatches that may be active at once, counting the outermost one.
    pub max_dispatch_depth: usize,
    pub max_stack_size: usize,
    /// Instruction budget per outermost dispatch. `None` runs to completion.
    pub max_steps: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_dispatch_depth: 64,
            max_stack_size: 1024,
            max_steps: None,
        }
    }
}

/// Result of a Dispatch that did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion.
    Handled,
    /// The current state has no handler for the event.
    NoHandler,
}

enum Flow {
    Next(usize),
    Return,
}

/// Stack-based interpreter. Runs one chunk at a time to completion.
pub struct Vm {
    stack: Vec<Value>,
    /// Stack height at entry of the running chunk; pops never go below it.
    base: usize,
    config: VmConfig,
    depth: usize,
    steps: usize,
    nested_faults: Vec<RuntimeError>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            stack: Vec::new(),
            base: 0,
            config,
            depth: 0,
            steps: 0,
            nested_faults: Vec::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Faults raised by handlers run through targeted `FireEvent`.
    ///
    /// Those abort only the nested handler, so they never reach the caller
    /// of [`Vm::dispatch`].
    pub fn take_nested_faults(&mut self) -> Vec<RuntimeError> {
        std::mem::take(&mut self.nested_faults)
    }

    /// Runs the handler for `event` in the context's current state.
    ///
    /// A missing handler is a no-op. `args` are readable as `args.NAME`
    /// for the duration of the handler.
    pub fn dispatch(
        &mut self,
        ctx: &mut RuntimeContext,
        event: &str,
        args: &ArgBag,
        host: &mut dyn HostBridge,
    ) -> Result<DispatchOutcome, RuntimeError> {
        let definition = Rc::clone(ctx.definition());
        let Some(chunk) = definition.handler(ctx.state(), event) else {
            trace!(state = ctx.state(), event, "no handler; dispatch ignored");
            return Ok(DispatchOutcome::NoHandler);
        };

        trace!(chunk = %chunk.name, depth = self.depth, "dispatch");
        let previous = ctx.bind_args(args);
        let result = self.run_chunk(chunk, ctx, host);
        ctx.restore_args(previous);

        result.map(|_| DispatchOutcome::Handled)
    }

    /// Executes `chunk` against `ctx` until it returns, runs off the end, or
    /// faults. A fault leaves the VM ready for the next call.
    pub fn run_chunk(
        &mut self,
        chunk: &Chunk,
        ctx: &mut RuntimeContext,
        host: &mut dyn HostBridge,
    ) -> Result<(), RuntimeError> {
        if self.depth == 0 {
            self.steps = 0;
        }
        self.depth += 1;
        let saved_base = self.base;
        self.base = self.stack.len();

        let result = self.execute(chunk, ctx, host);

        self.stack.truncate(self.base);
        self.base = saved_base;
        self.depth -= 1;

        result.map_err(|(offset, fault)| {
            let err = RuntimeError {
                chunk: chunk.name.clone(),
                offset,
                line: chunk.line_at(offset),
                fault,
            };
            warn!("{}", err);
            err
        })
    }

    // Execution

    fn execute(
        &mut self,
        chunk: &Chunk,
        ctx: &mut RuntimeContext,
        host: &mut dyn HostBridge,
    ) -> Result<(), (usize, RuntimeFault)> {
        let mut ip = 0;

        while ip < chunk.code.len() {
            let step = self
                .check_limits()
                .and_then(|_| self.step(chunk, ip, ctx, host));
            match step {
                Ok(Flow::Next(next)) => ip = next,
                Ok(Flow::Return) => break,
                Err(fault) => return Err((ip, fault)),
            }
        }

        Ok(())
    }

    fn check_limits(&mut self) -> Result<(), RuntimeFault> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeFault::StepLimitExceeded(max));
            }
        }

        Ok(())
    }

    fn step(
        &mut self,
        chunk: &Chunk,
        ip: usize,
        ctx: &mut RuntimeContext,
        host: &mut dyn HostBridge,
    ) -> Result<Flow, RuntimeFault> {
        let byte = chunk.code[ip];
        let op = OpCode::from_byte(byte);

        let width = op.operand_width();
        if width > 0 && ip + width >= chunk.code.len() {
            return Err(RuntimeFault::TruncatedInstruction);
        }
        let operand = |i: usize| chunk.code[ip + 1 + i];
        let mut next = ip + 1 + width;

        match op {
            // Literals
            OpCode::Constant => {
                let value = constant(chunk, operand(0))?.clone();
                self.push(value)?;
            }

            // Operators
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::Greater
            | OpCode::GreaterEqual
            | OpCode::Less
            | OpCode::LessEqual => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(binary(op, left, right)?)?;
            }
            OpCode::Negate => {
                let value = match self.pop()? {
                    Value::Number(n) => Value::Number(-n),
                    Value::Vec2 { x, y } => Value::vec2(-x, -y),
                    other => {
                        return Err(RuntimeFault::UnaryTypeMismatch {
                            op: "-",
                            expected: "number or vec2",
                            got: other.type_name(),
                        });
                    }
                };
                self.push(value)?;
            }
            OpCode::Not => {
                let value = match self.pop()? {
                    Value::Bool(b) => Value::Bool(!b),
                    other => {
                        return Err(RuntimeFault::UnaryTypeMismatch {
                            op: "!",
                            expected: "bool",
                            got: other.type_name(),
                        });
                    }
                };
                self.push(value)?;
            }

            // Variables
            OpCode::GetVariable => {
                let name = name_constant(chunk, operand(0))?;
                let value = match ctx.get(name) {
                    Some(value) => value.clone(),
                    None => ctx.definition().unset_value(name),
                };
                self.push(value)?;
            }
            OpCode::SetVariable => {
                let name = name_constant(chunk, operand(0))?;
                let value = self.peek()?.clone();
                ctx.set(name, value);
            }
            OpCode::GetComponent => {
                let name = name_constant(chunk, operand(0))?;
                let value = self.pop()?;
                let component = match (&value, name) {
                    (Value::Vec2 { x, .. }, "x") => *x,
                    (Value::Vec2 { y, .. }, "y") => *y,
                    _ => {
                        return Err(RuntimeFault::NotAComponent {
                            component: name.to_string(),
                            ty: value.type_name(),
                        });
                    }
                };
                self.push(Value::Number(component))?;
            }
            OpCode::Pop => {
                self.pop()?;
            }

            // Built-in actions
            OpCode::FireEvent => {
                self.fire_event(chunk, operand(0), operand(1), operand(2), ctx, host)?;
            }
            OpCode::ChangeState => {
                let state = name_constant(chunk, operand(0))?;
                trace!(from = ctx.state(), to = state, "change state");
                ctx.change_state(state)?;
            }

            // Control flow
            OpCode::Jump => {
                next += u16::from_be_bytes([operand(0), operand(1)]) as usize;
            }
            OpCode::JumpIfFalse => {
                let condition = match self.peek()? {
                    Value::Bool(b) => *b,
                    other => {
                        return Err(RuntimeFault::UnaryTypeMismatch {
                            op: "condition",
                            expected: "bool",
                            got: other.type_name(),
                        });
                    }
                };
                if !condition {
                    next += u16::from_be_bytes([operand(0), operand(1)]) as usize;
                }
            }

            OpCode::Return => return Ok(Flow::Return),

            OpCode::Unknown => return Err(RuntimeFault::UnknownOpcode(byte)),
        }

        Ok(Flow::Next(next))
    }

    fn fire_event(
        &mut self,
        chunk: &Chunk,
        name: u8,
        flags: u8,
        argc: u8,
        ctx: &mut RuntimeContext,
        host: &mut dyn HostBridge,
    ) -> Result<(), RuntimeFault> {
        let event = name_constant(chunk, name)?;

        let mut pairs = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            let value = self.pop()?;
            let key = self.pop_string("argument name")?;
            pairs.push((key, value));
        }
        let mut args = ArgBag::new();
        for (key, value) in pairs.into_iter().rev() {
            args.insert(key, value);
        }

        if flags & FIRE_HAS_TARGET == 0 {
            trace!(event, "fire global event");
            host.fire_event(event, &args);
            return Ok(());
        }

        let target = self.pop_string("target entity")?;
        let id = host
            .resolve(&target)
            .ok_or_else(|| RuntimeFault::UnresolvedTarget(target.clone()))?;

        if self.depth >= self.config.max_dispatch_depth {
            return Err(RuntimeFault::DispatchDepthExceeded(
                self.config.max_dispatch_depth,
            ));
        }

        trace!(event, entity = %target, "fire targeted event");
        if ctx.owner() == Some(id) {
            self.dispatch_nested(ctx, event, &args, host);
            return Ok(());
        }

        match host.take_context(id) {
            Some(mut target_ctx) => {
                self.dispatch_nested(&mut target_ctx, event, &args, host);
                host.return_context(id, target_ctx);
                Ok(())
            }
            None if host.has_script(id) => Err(RuntimeFault::ReentrantDispatch(target)),
            None => {
                trace!(entity = %target, event, "target has no script; event dropped");
                Ok(())
            }
        }
    }

    /// Runs a targeted event depth-first. Its faults stay with it.
    fn dispatch_nested(
        &mut self,
        ctx: &mut RuntimeContext,
        event: &str,
        args: &ArgBag,
        host: &mut dyn HostBridge,
    ) {
        if let Err(err) = self.dispatch(ctx, event, args, host) {
            self.nested_faults.push(err);
        }
    }

    // Stack operations

    fn push(&mut self, value: Value) -> Result<(), RuntimeFault> {
        if self.stack.len() >= self.config.max_stack_size {
            return Err(RuntimeFault::StackOverflow(self.config.max_stack_size));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeFault> {
        if self.stack.len() <= self.base {
            return Err(RuntimeFault::StackUnderflow);
        }
        self.stack.pop().ok_or(RuntimeFault::StackUnderflow)
    }

    fn peek(&self) -> Result<&Value, RuntimeFault> {
        if self.stack.len() <= self.base {
            return Err(RuntimeFault::StackUnderflow);
        }
        self.stack.last().ok_or(RuntimeFault::StackUnderflow)
    }

    fn pop_string(&mut self, what: &'static str) -> Result<String, RuntimeFault> {
        match self.pop()? {
            Value::String(s) => Ok(s),
            other => Err(RuntimeFault::UnaryTypeMismatch {
                op: what,
                expected: "string",
                got: other.type_name(),
            }),
        }
    }
}

fn constant(chunk: &Chunk, index: u8) -> Result<&Value, RuntimeFault> {
    chunk.constant(index).ok_or(RuntimeFault::BadConstant(index))
}

fn name_constant(chunk: &Chunk, index: u8) -> Result<&str, RuntimeFault> {
    constant(chunk, index)?
        .as_str()
        .ok_or(RuntimeFault::BadConstant(index))
}

fn symbol(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "+",
        OpCode::Subtract => "-",
        OpCode::Multiply => "*",
        OpCode::Divide => "/",
        OpCode::Equal => "==",
        OpCode::NotEqual => "!=",
        OpCode::Greater => ">",
        OpCode::GreaterEqual => ">=",
        OpCode::Less => "<",
        OpCode::LessEqual => "<=",
        _ => "?",
    }
}

/// Applies a binary operator. Operands must have compatible tags; nothing
/// is coerced.
fn binary(op: OpCode, left: Value, right: Value) -> Result<Value, RuntimeFault> {
    use Value::*;

    let value = match (op, &left, &right) {
        (OpCode::Add, Number(a), Number(b)) => Number(a + b),
        (OpCode::Add, Vec2 { x: ax, y: ay }, Vec2 { x: bx, y: by }) => Value::vec2(ax + bx, ay + by),
        (OpCode::Add, String(a), String(b)) => String(format!("{}{}", a, b)),

        (OpCode::Subtract, Number(a), Number(b)) => Number(a - b),
        (OpCode::Subtract, Vec2 { x: ax, y: ay }, Vec2 { x: bx, y: by }) => {
            Value::vec2(ax - bx, ay - by)
        }

        (OpCode::Multiply, Number(a), Number(b)) => Number(a * b),
        (OpCode::Multiply, Vec2 { x, y }, Number(s)) | (OpCode::Multiply, Number(s), Vec2 { x, y }) => {
            Value::vec2(x * s, y * s)
        }

        (OpCode::Divide, _, Number(b)) if *b == 0.0 && matches!(left, Number(_) | Vec2 { .. }) => {
            return Err(RuntimeFault::DivisionByZero);
        }
        (OpCode::Divide, Number(a), Number(b)) => Number(a / b),
        (OpCode::Divide, Vec2 { x, y }, Number(s)) => Value::vec2(x / s, y / s),

        (OpCode::Equal, _, _) if left.value_type() == right.value_type() => Bool(left == right),
        (OpCode::NotEqual, _, _) if left.value_type() == right.value_type() => Bool(left != right),

        (OpCode::Greater, Number(a), Number(b)) => Bool(a > b),
        (OpCode::GreaterEqual, Number(a), Number(b)) => Bool(a >= b),
        (OpCode::Less, Number(a), Number(b)) => Bool(a < b),
        (OpCode::LessEqual, Number(a), Number(b)) => Bool(a <= b),

        _ => {
            return Err(RuntimeFault::TypeMismatch {
                op: symbol(op),
                left: left.type_name(),
                right: right.type_name(),
            });
        }
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;
    use crate::runtime::host::{EntityLookup, NullHost};
    use crate::runtime::script::ScriptDefinition;
    use crate::runtime::test_host::FakeWorld;
    use proptest::prelude::*;

    // ============================================================
    // Test Helpers
    // ============================================================

    fn definition(source: &str) -> Rc<ScriptDefinition> {
        match compile("test.zephyr", source) {
            Ok(def) => Rc::new(def),
            Err(e) => panic!("{}", e),
        }
    }

    fn instance(source: &str) -> RuntimeContext {
        let def = definition(source);
        let initial = def.initial_state().to_string();
        RuntimeContext::new(def, &initial).unwrap()
    }

    /// Runs `body` as the `S.Run` handler and returns the context.
    fn run_body(body: &str) -> Result<RuntimeContext, RuntimeError> {
        let mut ctx = instance(&format!("State S {{ OnEvent Run {{ {} }} }}", body));
        Vm::new().dispatch(&mut ctx, "Run", &ArgBag::new(), &mut NullHost)?;
        Ok(ctx)
    }

    /// Evaluates `expr` and returns the stored result.
    fn eval(expr: &str) -> Value {
        let ctx = run_body(&format!("result = {};", expr)).expect("execution should succeed");
        ctx.get("result").cloned().expect("result should be set")
    }

    fn eval_fault(expr: &str) -> RuntimeFault {
        match run_body(&format!("result = {};", expr)) {
            Ok(ctx) => panic!("expected fault, got {:?}", ctx.get("result")),
            Err(e) => e.fault,
        }
    }

    fn chunk_from(bytes: &[u8], constants: Vec<Value>) -> Chunk {
        let mut chunk = Chunk::new("Raw.Bytes");
        for b in bytes {
            chunk.write(*b, 1);
        }
        chunk.constants = constants;
        chunk
    }

    fn run_raw(chunk: &Chunk) -> (Result<(), RuntimeError>, RuntimeContext) {
        let mut ctx = instance("State S { }");
        let result = Vm::new().run_chunk(chunk, &mut ctx, &mut NullHost);
        (result, ctx)
    }

    // ============================================================
    // Arithmetic and precedence
    // ============================================================

    #[test]
    fn test_precedence() {
        assert_eq!(eval("2 + 3 * 4"), Value::Number(14.0));
        assert_eq!(eval("(2 + 3) * 4"), Value::Number(20.0));
        assert_eq!(eval("10 - 4 - 3"), Value::Number(3.0));
        assert_eq!(eval("24 / 4 / 2"), Value::Number(3.0));
        assert_eq!(eval("-2 * 3 + 1"), Value::Number(-5.0));
        assert_eq!(eval("1 + 2 > 2 == true"), Value::Bool(true));
    }

    #[test]
    fn test_vec2_arithmetic() {
        assert_eq!(eval("1,2 + 3,4"), Value::vec2(4.0, 6.0));
        assert_eq!(eval("3,4 - 1,1"), Value::vec2(2.0, 3.0));
        assert_eq!(eval("1,2 * 3"), Value::vec2(3.0, 6.0));
        assert_eq!(eval("2 * 1,2"), Value::vec2(2.0, 4.0));
        assert_eq!(eval("4,2 / 2"), Value::vec2(2.0, 1.0));
        assert_eq!(eval("-(1,-2)"), Value::vec2(-1.0, 2.0));
        assert_eq!(eval("(3,4).y"), Value::Number(4.0));
        assert_eq!(eval("1,2 == 1,2"), Value::Bool(true));
    }

    #[test]
    fn test_minus_before_vec2_literal_negates_x_only() {
        assert_eq!(eval("-3,4"), Value::vec2(-3.0, 4.0));
        assert_eq!(eval("-1.5,-2"), Value::vec2(-1.5, -2.0));
        assert_eq!(eval("-1,0"), Value::vec2(-1.0, 0.0));
        assert_eq!(eval("-(3,4)"), Value::vec2(-3.0, -4.0));
        assert_eq!(eval("-3,4.x"), Value::Number(-3.0));
        assert_eq!(eval("-1,0 * 2"), Value::vec2(-2.0, 0.0));
        assert_eq!(eval("1,1 - -1,0"), Value::vec2(2.0, 1.0));
    }

    #[test]
    fn test_strings_and_bools() {
        assert_eq!(eval("\"fire\" + \"ball\""), Value::from("fireball"));
        assert_eq!(eval("\"a\" != \"b\""), Value::Bool(true));
        assert_eq!(eval("!false"), Value::Bool(true));
        assert_eq!(eval("3 >= 3 && 2 < 1"), Value::Bool(false));
        assert_eq!(eval("3 <= 2 || 1 > 0"), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_skips_right_operand() {
        // the right operand would fault if evaluated
        assert_eq!(eval("false && 1 / 0 == 1"), Value::Bool(false));
        assert_eq!(eval("true || 1 / 0 == 1"), Value::Bool(true));
    }

    #[test]
    fn test_type_mismatch_faults() {
        assert_eq!(
            eval_fault("1 + \"a\""),
            RuntimeFault::TypeMismatch {
                op: "+",
                left: "number",
                right: "string"
            }
        );
        assert!(matches!(
            eval_fault("1 == true"),
            RuntimeFault::TypeMismatch { op: "==", .. }
        ));
        assert!(matches!(
            eval_fault("\"a\" < \"b\""),
            RuntimeFault::TypeMismatch { .. }
        ));
        assert!(matches!(
            eval_fault("!1"),
            RuntimeFault::UnaryTypeMismatch { op: "!", .. }
        ));
        assert!(matches!(
            eval_fault("1 && true"),
            RuntimeFault::UnaryTypeMismatch { op: "condition", .. }
        ));
        assert!(matches!(
            eval_fault("(1).x"),
            RuntimeFault::NotAComponent { .. }
        ));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval_fault("1 / 0"), RuntimeFault::DivisionByZero);
        assert_eq!(eval_fault("1,1 / 0"), RuntimeFault::DivisionByZero);
    }

    // ============================================================
    // Variables and statements
    // ============================================================

    #[test]
    fn test_unset_variable_reads_zero() {
        assert_eq!(eval("missing + 1"), Value::Number(1.0));
    }

    #[test]
    fn test_unset_declared_variables_read_typed_defaults() {
        let mut ctx = instance(
            "State S {
               OnEvent Declare { var alive: Bool; var name: String; var dir: Vec2; }
               OnEvent Run {
                 if alive { hit = true; } else { hit = false; }
                 greeting = name + \"!\";
                 moved = dir + 1,2;
                 count = count + 1;
               }
             }",
        );
        Vm::new()
            .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut NullHost)
            .unwrap();
        assert_eq!(ctx.get("hit"), Some(&Value::Bool(false)));
        assert_eq!(ctx.get("greeting"), Some(&Value::from("!")));
        assert_eq!(ctx.get("moved"), Some(&Value::vec2(1.0, 2.0)));
        assert_eq!(ctx.get("count"), Some(&Value::Number(1.0)));
        assert_eq!(ctx.get("alive"), None);
    }

    #[test]
    fn test_typed_declarations_seed_defaults() {
        let ctx = run_body("var a: Vec2; var b: Bool; var c: String; var d;").unwrap();
        assert_eq!(ctx.get("a"), Some(&Value::vec2(0.0, 0.0)));
        assert_eq!(ctx.get("b"), Some(&Value::Bool(false)));
        assert_eq!(ctx.get("c"), Some(&Value::from("")));
        assert_eq!(ctx.get("d"), Some(&Value::Number(0.0)));
    }

    #[test]
    fn test_if_else_chain() {
        let body = "if x == 0 { r = \"zero\"; } else if x == 1 { r = \"one\"; } else { r = \"many\"; }";
        for (x, expected) in [(0.0, "zero"), (1.0, "one"), (7.0, "many")] {
            let mut ctx = instance(&format!("State S {{ OnEvent Run {{ {} }} }}", body));
            ctx.set("x", Value::Number(x));
            Vm::new()
                .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut NullHost)
                .unwrap();
            assert_eq!(ctx.get("r"), Some(&Value::from(expected)));
        }
    }

    #[test]
    fn test_chained_assignment() {
        let ctx = run_body("a = b = 3;").unwrap();
        assert_eq!(ctx.get("a"), Some(&Value::Number(3.0)));
        assert_eq!(ctx.get("b"), Some(&Value::Number(3.0)));
    }

    #[test]
    fn test_args_are_scoped_to_the_handler() {
        let mut ctx = instance("State S { OnEvent Hit { hp = 10 - args.damage; } }");
        let args = ArgBag::new().with("damage", 3.0);
        Vm::new()
            .dispatch(&mut ctx, "Hit", &args, &mut NullHost)
            .unwrap();
        assert_eq!(ctx.get("hp"), Some(&Value::Number(7.0)));
        assert_eq!(ctx.get("args.damage"), None);
    }

    #[test]
    fn test_stack_is_empty_after_dispatch() {
        let mut vm = Vm::new();
        let mut ctx = instance("State S { OnEvent Run { 1 + 2; x = 3; } }");
        vm.dispatch(&mut ctx, "Run", &ArgBag::new(), &mut NullHost)
            .unwrap();
        assert!(vm.stack.is_empty());
    }

    // ============================================================
    // Boundary and scenarios
    // ============================================================

    #[test]
    fn test_empty_handler_is_noop() {
        let mut ctx = instance("State Idle { OnEvent Start { } }");
        ctx.set("keep", Value::Bool(true));
        let before = ctx.variables().clone();
        let outcome = Vm::new()
            .dispatch(&mut ctx, "Start", &ArgBag::new().with("n", 1.0), &mut NullHost)
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(ctx.variables(), &before);
    }

    #[test]
    fn test_scenario_a() {
        let mut world = FakeWorld::new();
        let mut ctx = instance("State Idle { OnEvent Start { x = 4*2+2; FireEvent Done; } }");
        Vm::new()
            .dispatch(&mut ctx, "Start", &ArgBag::new(), &mut world)
            .unwrap();
        assert_eq!(ctx.get("x"), Some(&Value::Number(10.0)));
        assert_eq!(world.fired_names(), vec!["Done"]);
    }

    #[test]
    fn test_scenario_b_change_state() {
        let source = "State Idle { OnEvent Go { ChangeState(Moving); } }
                      State Moving { OnEvent Stop { stopped = true; ChangeState Idle; } }";
        let mut vm = Vm::new();

        let mut fresh = instance(source);
        let outcome = vm
            .dispatch(&mut fresh, "Stop", &ArgBag::new(), &mut NullHost)
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NoHandler);
        assert_eq!(fresh.state(), "Idle");
        assert_eq!(fresh.get("stopped"), None);

        let mut ctx = instance(source);
        vm.dispatch(&mut ctx, "Go", &ArgBag::new(), &mut NullHost)
            .unwrap();
        assert_eq!(ctx.state(), "Moving");
        let outcome = vm
            .dispatch(&mut ctx, "Stop", &ArgBag::new(), &mut NullHost)
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(ctx.get("stopped"), Some(&Value::Bool(true)));
        assert_eq!(ctx.state(), "Idle");
    }

    #[test]
    fn test_change_state_does_not_interrupt_handler() {
        let mut ctx = instance(
            "State A { OnEvent Go { ChangeState B; after = 1; } }
             State B { }",
        );
        Vm::new()
            .dispatch(&mut ctx, "Go", &ArgBag::new(), &mut NullHost)
            .unwrap();
        assert_eq!(ctx.state(), "B");
        assert_eq!(ctx.get("after"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn test_scenario_d_fault_keeps_variables() {
        let mut vm = Vm::new();
        let mut ctx = instance(
            "State S {
               OnEvent Run { a = 1; b = 5 / 0; c = 3; }
               OnEvent Next { d = 4; }
             }",
        );
        let before = ctx.variables().clone();
        let err = vm
            .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut NullHost)
            .unwrap_err();
        assert_eq!(err.fault, RuntimeFault::DivisionByZero);
        assert_eq!(err.chunk, "S.Run");
        assert_eq!(err.line, 2);

        // everything up to the faulting instruction stays, nothing after it
        let mut expected = before;
        expected.insert("a".to_string(), Value::Number(1.0));
        assert_eq!(ctx.variables(), &expected);

        // the VM and context remain usable
        vm.dispatch(&mut ctx, "Next", &ArgBag::new(), &mut NullHost)
            .unwrap();
        assert_eq!(ctx.get("d"), Some(&Value::Number(4.0)));
        assert!(vm.stack.is_empty());
    }

    // ============================================================
    // FireEvent and the host bridge
    // ============================================================

    #[test]
    fn test_fire_event_global_args() {
        let mut world = FakeWorld::new();
        let mut ctx = instance("State S { OnEvent Run { FireEvent(Boom, radius = 2 + 1, at = 1,2); } }");
        Vm::new()
            .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut world)
            .unwrap();
        let (name, args) = &world.fired[0];
        assert_eq!(name, "Boom");
        assert_eq!(args.get("radius"), Some(&Value::Number(3.0)));
        assert_eq!(args.get("at"), Some(&Value::vec2(1.0, 2.0)));
    }

    #[test]
    fn test_targeted_fire_is_depth_first() {
        let mut world = FakeWorld::new();
        let player = world.spawn_scripted(
            "Player",
            "State Alive { OnEvent Hit { hp = hp - args.damage; FireEvent Ouch; } }",
        );
        let mut orc = instance(
            "State Attack { OnEvent Swing { FireEvent(Hit, Player, damage = 3); FireEvent Swung; } }",
        );

        Vm::new()
            .dispatch(&mut orc, "Swing", &ArgBag::new(), &mut world)
            .unwrap();

        assert_eq!(world.fired_names(), vec!["Ouch", "Swung"]);
        assert_eq!(world.context(player).get("hp"), Some(&Value::Number(-3.0)));
    }

    #[test]
    fn test_unresolved_target_faults() {
        let mut world = FakeWorld::new();
        let mut ctx = instance("State S { OnEvent Run { FireEvent(Hit, Ghost); x = 1; } }");
        let err = Vm::new()
            .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut world)
            .unwrap_err();
        assert_eq!(err.fault, RuntimeFault::UnresolvedTarget("Ghost".to_string()));
        assert_eq!(ctx.get("x"), None);
    }

    #[test]
    fn test_target_without_script_is_dropped() {
        let mut world = FakeWorld::new();
        world.spawn("Rock");
        let mut ctx = instance("State S { OnEvent Run { FireEvent(Hit, Rock); x = 1; } }");
        Vm::new()
            .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut world)
            .unwrap();
        assert_eq!(ctx.get("x"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn test_self_targeted_event_reenters_own_context() {
        let mut world = FakeWorld::new();
        let me = world.spawn_scripted(
            "Me",
            "State S {
               OnEvent Run { FireEvent(Bump, Me, by = 2); after = args.tag; }
               OnEvent Bump { n = n + args.by; }
             }",
        );
        let mut ctx = world.take_context(me).unwrap();
        Vm::new()
            .dispatch(&mut ctx, "Run", &ArgBag::new().with("tag", "outer"), &mut world)
            .unwrap();
        assert_eq!(ctx.get("n"), Some(&Value::Number(2.0)));
        // the nested dispatch restored the outer arguments
        assert_eq!(ctx.get("after"), Some(&Value::from("outer")));
    }

    #[test]
    fn test_unbounded_self_recursion_hits_depth_limit() {
        let mut world = FakeWorld::new();
        let me = world.spawn_scripted(
            "Me",
            "State S { OnEvent Loop { count = count + 1; FireEvent(Loop, Me); } }",
        );
        let mut ctx = world.take_context(me).unwrap();
        let mut vm = Vm::with_config(VmConfig {
            max_dispatch_depth: 8,
            ..VmConfig::default()
        });

        vm.dispatch(&mut ctx, "Loop", &ArgBag::new(), &mut world)
            .unwrap();

        assert_eq!(ctx.get("count"), Some(&Value::Number(8.0)));
        let faults = vm.take_nested_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].fault, RuntimeFault::DispatchDepthExceeded(8));
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn test_reentrant_dispatch_faults() {
        let mut world = FakeWorld::new();
        let a = world.spawn_scripted("A", "State S { OnEvent Ping { FireEvent(Ping, B); } }");
        world.spawn_scripted("B", "State S { OnEvent Ping { FireEvent(Ping, A); } }");

        let mut ctx = world.take_context(a).unwrap();
        let mut vm = Vm::new();
        vm.dispatch(&mut ctx, "Ping", &ArgBag::new(), &mut world)
            .unwrap();

        let faults = vm.take_nested_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].chunk, "S.Ping");
        assert_eq!(faults[0].fault, RuntimeFault::ReentrantDispatch("A".to_string()));
    }

    #[test]
    fn test_nested_fault_does_not_abort_caller() {
        let mut world = FakeWorld::new();
        world.spawn_scripted("Bad", "State S { OnEvent Hit { x = 1 / 0; } }");
        let mut ctx = instance("State S { OnEvent Run { FireEvent(Hit, Bad); done = true; } }");
        let mut vm = Vm::new();
        vm.dispatch(&mut ctx, "Run", &ArgBag::new(), &mut world)
            .unwrap();
        assert_eq!(ctx.get("done"), Some(&Value::Bool(true)));
        assert_eq!(vm.take_nested_faults()[0].fault, RuntimeFault::DivisionByZero);
    }

    // ============================================================
    // Malformed bytecode
    // ============================================================

    #[test]
    fn test_unknown_opcode_faults() {
        let chunk = chunk_from(&[0xEE], vec![]);
        let (result, _) = run_raw(&chunk);
        let err = result.unwrap_err();
        assert_eq!(err.fault, RuntimeFault::UnknownOpcode(0xEE));
        assert_eq!(err.offset, 0);
        assert_eq!(err.chunk, "Raw.Bytes");
    }

    #[test]
    fn test_stack_underflow_faults() {
        let chunk = chunk_from(&[OpCode::Add.as_byte()], vec![]);
        assert_eq!(run_raw(&chunk).0.unwrap_err().fault, RuntimeFault::StackUnderflow);
    }

    #[test]
    fn test_truncated_and_bad_constant() {
        let chunk = chunk_from(&[OpCode::Jump.as_byte(), 0], vec![]);
        assert_eq!(
            run_raw(&chunk).0.unwrap_err().fault,
            RuntimeFault::TruncatedInstruction
        );

        let chunk = chunk_from(&[OpCode::Constant.as_byte(), 3], vec![]);
        assert_eq!(run_raw(&chunk).0.unwrap_err().fault, RuntimeFault::BadConstant(3));

        let chunk = chunk_from(&[OpCode::GetVariable.as_byte(), 0], vec![Value::Number(1.0)]);
        assert_eq!(run_raw(&chunk).0.unwrap_err().fault, RuntimeFault::BadConstant(0));
    }

    #[test]
    fn test_runs_off_the_end_without_return() {
        let chunk = chunk_from(
            &[OpCode::Constant.as_byte(), 0, OpCode::SetVariable.as_byte(), 1],
            vec![Value::Number(9.0), Value::from("v")],
        );
        let (result, ctx) = run_raw(&chunk);
        result.unwrap();
        assert_eq!(ctx.get("v"), Some(&Value::Number(9.0)));
    }

    #[test]
    fn test_jump_past_end_terminates() {
        let chunk = chunk_from(&[OpCode::Jump.as_byte(), 0xFF, 0xFF], vec![]);
        assert!(run_raw(&chunk).0.is_ok());
    }

    #[test]
    fn test_change_state_to_missing_state_faults() {
        let chunk = chunk_from(&[OpCode::ChangeState.as_byte(), 0], vec![Value::from("Nowhere")]);
        let (result, ctx) = run_raw(&chunk);
        assert_eq!(
            result.unwrap_err().fault,
            RuntimeFault::UnknownState("Nowhere".to_string())
        );
        assert_eq!(ctx.state(), "S");
    }

    #[test]
    fn test_limits() {
        let mut ctx = instance("State S { OnEvent Run { x = 1 + (2 + 3); } }");
        let mut vm = Vm::with_config(VmConfig {
            max_steps: Some(3),
            ..VmConfig::default()
        });
        let err = vm
            .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut NullHost)
            .unwrap_err();
        assert_eq!(err.fault, RuntimeFault::StepLimitExceeded(3));

        let mut vm = Vm::with_config(VmConfig {
            max_stack_size: 2,
            ..VmConfig::default()
        });
        let err = vm
            .dispatch(&mut ctx, "Run", &ArgBag::new(), &mut NullHost)
            .unwrap_err();
        assert_eq!(err.fault, RuntimeFault::StackOverflow(2));
    }

    // ============================================================
    // Properties
    // ============================================================

    /// Conventional evaluation: `*` binds tighter, `+`/`-` fold left.
    fn reference_eval(first: u8, rest: &[(char, u8)]) -> f64 {
        let mut total = 0.0;
        let mut sign = 1.0;
        let mut term = first as f64;
        for (op, n) in rest {
            let n = *n as f64;
            match op {
                '*' => term *= n,
                '+' => {
                    total += sign * term;
                    sign = 1.0;
                    term = n;
                }
                _ => {
                    total += sign * term;
                    sign = -1.0;
                    term = n;
                }
            }
        }
        total + sign * term
    }

    proptest! {
        #[test]
        fn prop_arithmetic_matches_conventional_precedence(
            first in 0u8..10,
            rest in prop::collection::vec((prop::sample::select(vec!['+', '-', '*']), 0u8..10), 0..8),
        ) {
            let mut expr = first.to_string();
            for (op, n) in &rest {
                expr.push_str(&format!(" {} {}", op, n));
            }
            prop_assert_eq!(eval(&expr), Value::Number(reference_eval(first, &rest)));
        }

        #[test]
        fn prop_compile_is_deterministic(
            first in 0u8..10,
            rest in prop::collection::vec((prop::sample::select(vec!['+', '-', '*', '/']), 0u8..10), 0..8),
        ) {
            let mut expr = first.to_string();
            for (op, n) in &rest {
                expr.push_str(&format!(" {} {}", op, n));
            }
            let source = format!("State S {{ OnEvent E {{ v = {}; }} }}", expr);
            let a = compile("a.zephyr", &source).unwrap();
            let b = compile("a.zephyr", &source).unwrap();
            prop_assert_eq!(a.handler("S", "E"), b.handler("S", "E"));
        }
    }
}
