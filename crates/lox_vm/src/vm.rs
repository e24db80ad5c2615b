use std::rc::Rc;

use crate::chunk::Chunk;
use crate::compiler::Compiler;
use crate::error::{InterpretError, RuntimeError, RuntimeResult};
use crate::interner::Interner;
use crate::natives;
use crate::object::{ObjClosure, ObjFunction, ObjNative, StrRef};
use crate::opcode::Op;
use crate::table::Table;
use crate::value::Value;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

/// One activation record: the closure being executed, the instruction
/// pointer into its chunk, and the base index into the value stack where
/// this frame's slots (callee followed by arguments and locals) begin.
struct CallFrame {
    closure: Rc<ObjClosure>,
    ip: usize,
    slots_base: usize,
}

impl CallFrame {
    fn function(&self) -> &Rc<ObjFunction> {
        &self.closure.function
    }
}

/// The stack-based bytecode interpreter. Owns the value stack, the call
/// frames, the global environment, and the string-intern pool that the
/// compiler also writes through while producing string constants.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table<Value>,
    interner: Interner,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            interner: Interner::new(),
        };
        vm.define_native("clock", natives::clock);
        vm
    }

    fn define_native(&mut self, name: &str, function: crate::object::NativeFn) {
        let interned = self.interner.intern(name);
        let native = ObjNative { name: Rc::clone(&interned), function };
        self.globals.set(interned, Value::Native(Rc::new(native)));
    }

    /// Compiles `source` and, on success, runs it to completion. A fresh
    /// top-level function is wrapped in a closure and pushed as the initial
    /// call frame, matching the calling convention every other call uses.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            Compiler::compile(source, &mut self.interner).map_err(InterpretError::Compile)?;
        let closure = Rc::new(ObjClosure { function: Rc::new(function) });
        self.stack.push(Value::Closure(Rc::clone(&closure)));
        self.frames.push(CallFrame { closure, ip: 0, slots_base: 0 });
        self.run().map_err(InterpretError::Runtime)
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("run() requires an active call frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("run() requires an active call frame")
    }

    fn read_byte(&mut self, function: &Rc<ObjFunction>) -> u8 {
        let frame = self.current_frame_mut();
        let byte = function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self, function: &Rc<ObjFunction>) -> u16 {
        let hi = self.read_byte(function) as u16;
        let lo = self.read_byte(function) as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, function: &Rc<ObjFunction>) -> Value {
        let idx = self.read_byte(function);
        function.chunk.constants[idx as usize].clone()
    }

    fn read_string(&mut self, function: &Rc<ObjFunction>) -> StrRef {
        match self.read_constant(function) {
            Value::Str(s) => s,
            other => unreachable!("name operand must be an interned string constant, got {other:?}"),
        }
    }

    fn run(&mut self) -> RuntimeResult<()> {
        loop {
            let function = Rc::clone(self.current_frame().function());
            let byte = self.read_byte(&function);
            let op = Op::from_u8(byte)
                .unwrap_or_else(|| panic!("compiler emitted an invalid opcode byte {byte}"));

            match op {
                Op::Constant => {
                    let value = self.read_constant(&function);
                    self.push(value)?;
                }
                Op::Nil => self.push(Value::Nil)?,
                Op::True => self.push(Value::Bool(true))?,
                Op::False => self.push(Value::Bool(false))?,
                Op::Pop => {
                    self.pop()?;
                }
                Op::GetLocal => {
                    let slot = self.read_byte(&function) as usize;
                    let base = self.current_frame().slots_base;
                    let value = self.stack[base + slot].clone();
                    self.push(value)?;
                }
                Op::SetLocal => {
                    let slot = self.read_byte(&function) as usize;
                    let base = self.current_frame().slots_base;
                    self.stack[base + slot] = self.peek(0)?.clone();
                }
                Op::DefineGlobal => {
                    let name = self.read_string(&function);
                    let value = self.pop()?;
                    self.globals.set(name, value);
                }
                Op::GetGlobal => {
                    let name = self.read_string(&function);
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value)?;
                        }
                        None => return Err(self.runtime_error(undefined_variable(&name))),
                    }
                }
                Op::SetGlobal => {
                    let name = self.read_string(&function);
                    let value = self.peek(0)?.clone();
                    // Insert first; an insert that reports "new" means the
                    // name was never defined, so undo it and fail.
                    if self.globals.set(Rc::clone(&name), value) {
                        self.globals.delete(&name);
                        return Err(self.runtime_error(undefined_variable(&name)));
                    }
                }
                Op::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b))?;
                }
                Op::Greater => self.number_comparison(|a, b| a > b)?,
                Op::Less => self.number_comparison(|a, b| a < b)?,
                Op::Add => self.add()?,
                Op::Subtract => self.number_binary(|a, b| a - b)?,
                Op::Multiply => self.number_binary(|a, b| a * b)?,
                Op::Divide => self.number_binary(|a, b| a / b)?,
                Op::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                Op::Negate => {
                    let value = self.peek(0)?.clone();
                    match value.as_number() {
                        Some(n) => {
                            self.pop()?;
                            self.push(Value::Number(-n))?;
                        }
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                Op::Print => {
                    let value = self.pop()?;
                    println!("{}", value);
                }
                Op::Jump => {
                    let offset = self.read_short(&function);
                    self.current_frame_mut().ip += offset as usize;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_short(&function);
                    if self.peek(0)?.is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                Op::Loop => {
                    let offset = self.read_short(&function);
                    self.current_frame_mut().ip -= offset as usize;
                }
                Op::Call => {
                    let argc = self.read_byte(&function) as usize;
                    self.call_value(argc)?;
                }
                Op::Closure => {
                    let constant = self.read_constant(&function);
                    match constant {
                        Value::Function(func) => {
                            let closure = Rc::new(ObjClosure { function: func });
                            self.push(Value::Closure(closure))?;
                        }
                        other => unreachable!("CLOSURE operand must name a function constant, got {other:?}"),
                    }
                }
                Op::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().expect("RETURN with no active call frame");
                    self.stack.truncate(frame.slots_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
            }
        }
    }

    // ---- calling convention -----------------------------------------------------

    fn call_value(&mut self, argc: usize) -> RuntimeResult<()> {
        let callee = self.peek(argc)?.clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::Function(function) => self.call_closure(Rc::new(ObjClosure { function }), argc),
            Value::Native(native) => {
                let start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[start..].to_vec();
                match (native.function)(&args) {
                    Ok(result) => {
                        self.stack.truncate(start - 1);
                        self.push(result)
                    }
                    Err(message) => Err(self.runtime_error(message)),
                }
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: Rc<ObjClosure>, argc: usize) -> RuntimeResult<()> {
        let arity = closure.function.arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {} arguments but got {}.", arity, argc)));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots_base });
        Ok(())
    }

    // ---- arithmetic helpers ------------------------------------------------------

    fn add(&mut self) -> RuntimeResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (&a, &b) {
            (Value::Str(sa), Value::Str(sb)) => {
                let joined = format!("{}{}", sa.chars, sb.chars);
                let interned = self.interner.intern(&joined);
                self.push(Value::Str(interned))
            }
            _ => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => self.push(Value::Number(x + y)),
                _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
            },
        }
    }

    fn number_binary(&mut self, op: impl FnOnce(f64, f64) -> f64) -> RuntimeResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.push(Value::Number(op(x, y))),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn number_comparison(&mut self, op: impl FnOnce(f64, f64) -> bool) -> RuntimeResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.push(Value::Bool(op(x, y))),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // ---- stack primitives ---------------------------------------------------------

    fn push(&mut self, value: Value) -> RuntimeResult<()> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> RuntimeResult<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.runtime_error("Stack underflow.")),
        }
    }

    fn peek(&self, distance: usize) -> RuntimeResult<&Value> {
        let len = self.stack.len();
        if distance >= len {
            return Err(RuntimeError::new("Stack underflow."));
        }
        Ok(&self.stack[len - 1 - distance])
    }

    /// Builds the error, appends the call-frame trace (innermost frame
    /// first, `script` naming the top-level frame), and resets the stack —
    /// runtime errors are not caught, so execution cannot resume mid-frame.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let chunk: &Chunk = &frame.function().chunk;
            let line = chunk.line_at(frame.ip.saturating_sub(1));
            let name = match &frame.function().name {
                Some(n) => n.chars.to_string(),
                None => "script".to_string(),
            };
            trace.push(format!("[line {}] in {}", line, name));
        }
        self.stack.clear();
        self.frames.clear();
        RuntimeError { message: message.into(), trace }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

fn undefined_variable(name: &StrRef) -> String {
    format!("Undefined variable '{}'.", name.chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new();
        vm.interpret(source).expect("expected successful interpretation");
        vm
    }

    #[test]
    fn arithmetic_precedence() {
        run_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn interned_strings_compare_equal() {
        run_ok("var a = \"hi\"; var b = \"hi\"; print a == b;");
    }

    #[test]
    fn for_loop_accumulates() {
        run_ok("var x = 0; for (var i = 0; i < 3; i = i + 1) x = x + i; print x;");
    }

    #[test]
    fn recursive_function_call() {
        run_ok("fun fib(n){ if (n<2) return n; return fib(n-1)+fib(n-2);} print fib(10);");
    }

    #[test]
    fn string_concatenation() {
        run_ok("print \"foo\" + \"bar\";");
    }

    #[test]
    fn uninitialized_global_is_nil() {
        run_ok("var a; print a;");
    }

    #[test]
    fn negating_non_number_is_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("print -true;").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert_eq!(e.message, "Operand must be a number."),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn reading_undefined_global_is_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("print x;").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert_eq!(e.message, "Undefined variable 'x'."),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn calling_with_wrong_arity_is_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("fun f(){} f(1);").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert_eq!(e.message, "Expected 0 arguments but got 1."),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn returning_from_top_level_is_compile_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("return 1;").unwrap_err();
        match err {
            InterpretError::Compile(errs) => {
                assert!(errs.iter().any(|e| e.message == "Can't return from top-level code."));
            }
            _ => panic!("expected a compile error"),
        }
    }

    #[test]
    fn clock_native_returns_a_number() {
        let mut vm = Vm::new();
        vm.interpret("print clock() >= 0.0;").expect("clock() should be callable");
    }

    #[test]
    fn runtime_error_resets_the_stack() {
        let mut vm = Vm::new();
        let _ = vm.interpret("print 1 + true;");
        // After a runtime error the VM is ready for the next interpret call.
        vm.interpret("print 1 + 1;").expect("vm must recover for the next call");
    }
}
