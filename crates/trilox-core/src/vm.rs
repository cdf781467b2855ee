//! Stack-based virtual machine
//!
//! No register file: every operand lives on an explicit [`Value`] stack,
//! addressed relative to the active [`CallFrame`]'s `slots` base. Dispatch
//! is a single `match` over [`Opcode`] reading one instruction at a time
//! from the active frame's chunk; calling a closure pushes a new frame
//! rather than recursing the Rust stack, so deep Trilox call chains don't
//! blow the host stack (only `frames_max` bounds recursion, per spec).

use crate::bytecode::{Chunk, Opcode, SWITCH_DEFAULT_KEY};
use crate::compiler;
use crate::config::VmConfig;
use crate::diagnostic::TraceFrame;
use crate::error::{internal_error, InterpretResult, RuntimeError};
use crate::gc::{GcRoots, Heap};
use crate::native::{self, NativeReturn, OutputWriter};
use crate::object::{ObjArray, ObjClosure, ObjKind, ReturnTag, UpvalueState};
use crate::object::GcRef;
use crate::table::Table;
use crate::value::{Logic, Value};

/// One active invocation: which closure is running, where its instruction
/// pointer sits in that closure's chunk, and the value-stack slot its
/// locals are based at (slot 0 is the closure itself).
#[derive(Clone, Copy)]
struct CallFrame {
    closure: GcRef,
    ip: usize,
    slots: usize,
}

impl CallFrame {
    fn chunk(&self) -> &Chunk {
        &self.closure.as_closure().unwrap().function.as_function().unwrap().chunk
    }
}

/// Supplies [`Heap::collect`] with every VM-owned root, without requiring
/// a `&Vm` borrow while `vm.heap` is already borrowed mutably — constructed
/// fresh from disjoint field borrows at each allocation site.
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: &'a [GcRef],
}

/// Free function, not a `&self` method: borrowing each field by name here
/// (rather than behind an opaque `&self` receiver) keeps the borrows
/// disjoint from `self.heap`, so `self.heap.alloc(..., &roots)` can still
/// borrow `heap` mutably while `roots` is alive.
fn vm_roots<'a>(
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: &'a [GcRef],
) -> VmRoots<'a> {
    VmRoots {
        stack,
        frames,
        globals,
        open_upvalues,
    }
}

impl GcRoots for VmRoots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for value in self.stack {
            heap.mark_value(value);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        for up in self.open_upvalues {
            heap.mark_object(*up);
        }
        for (key, value) in self.globals.iter() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
    }
}

/// Virtual machine: owns the heap, the value stack, the call-frame stack,
/// the open-upvalue list (sorted by descending stack slot) and the globals
/// table. One `Vm` executes one program to completion; the host constructs
/// a fresh one (or calls [`Vm::reset`]) between `interpret` calls, per
/// spec §4.2's "failure model".
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<GcRef>,
    globals: Table,
    config: VmConfig,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut vm = Vm {
            heap: Heap::new(&config),
            stack: Vec::with_capacity(config.stack_capacity().min(4096)),
            frames: Vec::with_capacity(config.frames_max),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            config,
        };
        vm.set_output_writer(native::stdout_writer());
        vm.install_builtins();
        vm
    }

    pub fn new_default() -> Self {
        Self::new(VmConfig::default())
    }

    /// Redirects the `disp` native's output — tests swap in an in-memory
    /// buffer instead of stdout.
    pub fn set_output_writer(&mut self, writer: OutputWriter) {
        native::set_disp_writer(writer);
    }

    fn install_builtins(&mut self) {
        for binding in native::builtins() {
            let roots = vm_roots(&self.stack, &self.frames, &self.globals, &self.open_upvalues);
            let native_ref = self
                .heap
                .alloc_native(binding.name, binding.return_tag, binding.func, &roots);
            let name_ref = self.heap.intern(binding.name, &roots);
            self.globals.set(name_ref, Value::Object(native_ref));
        }
    }

    // -- entry point ------------------------------------------------------

    /// Compiles `source` and runs it to completion (spec §6 entry point).
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compiler::compile(source, &mut self.heap) {
            Ok(handle) => handle,
            Err(diagnostics) => return InterpretResult::CompileError(diagnostics),
        };
        let roots = vm_roots(&self.stack, &self.frames, &self.globals, &self.open_upvalues);
        let closure = self.heap.alloc_closure(
            ObjClosure {
                function,
                upvalues: Vec::new(),
            },
            &roots,
        );
        self.push(Value::Object(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: 0,
        });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                let trace = self.build_trace();
                self.stack.clear();
                self.frames.clear();
                self.open_upvalues.clear();
                InterpretResult::RuntimeError {
                    message: err.to_string(),
                    trace,
                }
            }
        }
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let chunk = frame.chunk();
                let line = chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
                let function = frame.closure.as_closure().unwrap().function;
                let name = function
                    .as_function()
                    .unwrap()
                    .name
                    .and_then(|n| n.as_string().map(|s| s.chars.clone()));
                TraceFrame {
                    line: line as u32,
                    function_name: name,
                }
            })
            .collect()
    }

    // -- stack helpers ------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack
            .pop()
            .unwrap_or_else(|| internal_error!("stack underflow"))
    }

    fn peek(&self, distance: usize) -> Value {
        let len = self.stack.len();
        self.stack
            .get(len - 1 - distance)
            .copied()
            .unwrap_or_else(|| internal_error!("stack peek out of range"))
    }

    // -- instruction stream ---------------------------------------------

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.chunk().code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_op(&mut self) -> Opcode {
        let byte = self.read_u8();
        Opcode::from_u8(byte).unwrap_or_else(|| internal_error!("invalid opcode byte {byte}"))
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self, wide: bool) -> Value {
        let idx = if wide {
            self.read_u16() as usize
        } else {
            self.read_u8() as usize
        };
        let frame = self.frames.last().unwrap();
        frame
            .chunk()
            .constants
            .get(idx)
            .copied()
            .unwrap_or_else(|| internal_error!("constant index out of range"))
    }

    fn current_line(&self) -> i32 {
        let frame = self.frames.last().unwrap();
        frame
            .chunk()
            .lines
            .get(frame.ip.saturating_sub(1))
            .copied()
            .unwrap_or(0)
    }

    // -- dispatch loop ----------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = self.read_op();
            match op {
                Opcode::Nil => self.push(Value::Nil),
                Opcode::Push1 => self.push(Value::Number(1.0)),
                Opcode::False => self.push(Value::Logic(Logic::False)),
                Opcode::Unknown => self.push(Value::Logic(Logic::Unknown)),
                Opcode::True => self.push(Value::Logic(Logic::True)),
                Opcode::Constant => {
                    let v = self.read_constant(false);
                    self.push(v);
                }
                Opcode::Constant16 => {
                    let v = self.read_constant(true);
                    self.push(v);
                }
                Opcode::Pop => {
                    self.pop();
                }

                Opcode::Negate => {
                    let v = self.pop();
                    let n = v.as_number().ok_or(RuntimeError::NotANumber)?;
                    self.push(Value::Number(-n));
                }
                Opcode::Add => self.binary_add()?,
                Opcode::Subtract => self.numeric_binary(|a, b| a - b)?,
                Opcode::Multiply => self.numeric_binary(|a, b| a * b)?,
                Opcode::Divide => self.numeric_binary(|a, b| a / b)?,
                Opcode::Modulo => self.numeric_binary(|a, b| a % b)?,
                Opcode::Exponential => self.numeric_binary(f64::powf)?,

                Opcode::KpNot => {
                    let v = self.pop();
                    self.push(Value::Logic(v.not()));
                }
                Opcode::KpAnd => self.logic_binary(Value::kp_and),
                Opcode::KpOr => self.logic_binary(Value::kp_or),
                Opcode::KpXor => self.logic_binary(Value::kp_xor),
                Opcode::Compare => self.logic_binary(Value::compare),
                Opcode::KpLessThan => self.logic_binary(Value::less_than),
                Opcode::KpLtEqual => self.logic_binary(Value::less_or_equal),
                Opcode::KpGreatThan => self.logic_binary(Value::greater_than),
                Opcode::KpGtEqual => self.logic_binary(Value::greater_or_equal),
                Opcode::KpEqual => self.logic_binary(Value::equals),
                Opcode::KpNotEqual => self.logic_binary(Value::not_equals),

                Opcode::DefineGlobal => self.define_global(false),
                Opcode::DefineGlobal16 => self.define_global(true),
                Opcode::GetGlobal => self.get_global(false)?,
                Opcode::GetGlobal16 => self.get_global(true)?,
                Opcode::SetGlobal => self.set_global(false)?,
                Opcode::SetGlobal16 => self.set_global(true)?,

                Opcode::GetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames.last().unwrap().slots;
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames.last().unwrap().slots;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }
                Opcode::GetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let up = self.frames.last().unwrap().closure.as_closure().unwrap().upvalues[slot];
                    self.push(self.upvalue_value(up));
                }
                Opcode::SetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let up = self.frames.last().unwrap().closure.as_closure().unwrap().upvalues[slot];
                    let value = self.peek(0);
                    self.set_upvalue_value(up, value);
                }
                Opcode::CloseUpvalue => {
                    let boundary = self.stack.len() - 1;
                    self.close_upvalues(boundary);
                    self.pop();
                }

                Opcode::Collect => {
                    let count = self.read_u8() as usize;
                    self.collect(count)
                }
                Opcode::GetArray => self.get_array()?,
                Opcode::SetArray => self.set_array()?,
                Opcode::GetArrayLoop => self.get_array_loop()?,
                Opcode::GetArrayCount => self.get_array_count()?,

                Opcode::TableSet => self.table_set(false)?,
                Opcode::TableSet16 => self.table_set(true)?,
                Opcode::TableGet => self.table_get(false)?,
                Opcode::TableGet16 => self.table_get(true)?,
                Opcode::TableClcSet => self.table_clc_set()?,
                Opcode::TableClcGet => self.table_clc_get()?,

                Opcode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                Opcode::JumpIfFalse => self.conditional_jump(|l| l == Logic::True),
                Opcode::JumpIfUnknown => self.conditional_jump(|l| l == Logic::Unknown),
                Opcode::JumpIfTrue => self.conditional_jump(|l| l == Logic::False),
                Opcode::JumpIfNotTrue => self.conditional_jump(|l| l != Logic::False),
                Opcode::JumpTableJump => self.jump_table_jump()?,
                Opcode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }

                Opcode::Call => {
                    let argc = self.read_u8();
                    self.call(argc)?;
                }
                Opcode::Closure => self.closure(false),
                Opcode::Closure16 => self.closure(true),
                Opcode::Return => {
                    if self.do_return() {
                        return Ok(());
                    }
                }
            }
        }
    }

    // -- arithmetic & logic ------------------------------------------------

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (a, b) = (
            a.as_number().ok_or(RuntimeError::NotANumber)?,
            b.as_number().ok_or(RuntimeError::NotANumber)?,
        );
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn logic_binary(&mut self, op: impl Fn(&Value, &Value) -> Logic) {
        let b = self.pop();
        let a = self.pop();
        self.push(Value::Logic(op(&a, &b)));
    }

    fn binary_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(x + y));
                return Ok(());
            }
            _ => {}
        }
        match (a.as_string(), b.as_string()) {
            (Some(x), Some(y)) => {
                let combined = format!("{x}{y}");
                let roots = vm_roots(&self.stack, &self.frames, &self.globals, &self.open_upvalues);
                let interned = self.heap.intern(&combined, &roots);
                self.push(Value::Object(interned));
                Ok(())
            }
            _ => Err(RuntimeError::BadAddOperands),
        }
    }

    // -- globals ----------------------------------------------------------

    fn define_global(&mut self, wide: bool) {
        let name = self.read_constant(wide).as_object().unwrap();
        let value = self.pop();
        self.globals.set(name, value);
    }

    fn get_global(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let name = self.read_constant(wide).as_object().unwrap();
        let value = self
            .globals
            .get(name)
            .ok_or_else(|| RuntimeError::UndefinedGlobal(name.as_string().unwrap().chars.clone()))?;
        self.push(value);
        Ok(())
    }

    fn set_global(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let name = self.read_constant(wide).as_object().unwrap();
        let value = self.peek(0);
        if !self.globals.contains(name) {
            return Err(RuntimeError::UndefinedGlobal(
                name.as_string().unwrap().chars.clone(),
            ));
        }
        self.globals.set(name, value);
        Ok(())
    }

    // -- upvalues -----------------------------------------------------------

    fn upvalue_location(up: GcRef) -> usize {
        match &*up.as_upvalue().unwrap().state.borrow() {
            UpvalueState::Open(loc) => *loc,
            UpvalueState::Closed(_) => internal_error!("upvalue already closed in open list"),
        }
    }

    fn upvalue_value(&self, up: GcRef) -> Value {
        match &*up.as_upvalue().unwrap().state.borrow() {
            UpvalueState::Open(loc) => self.stack[*loc],
            UpvalueState::Closed(v) => *v,
        }
    }

    fn set_upvalue_value(&mut self, up: GcRef, value: Value) {
        let loc = match &*up.as_upvalue().unwrap().state.borrow() {
            UpvalueState::Open(loc) => Some(*loc),
            UpvalueState::Closed(_) => None,
        };
        match loc {
            Some(loc) => self.stack[loc] = value,
            None => *up.as_upvalue().unwrap().state.borrow_mut() = UpvalueState::Closed(value),
        }
    }

    /// Finds or creates the open upvalue for `location`, keeping
    /// `open_upvalues` sorted by strictly descending slot address.
    fn capture_upvalue(&mut self, location: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, up) in self.open_upvalues.iter().enumerate() {
            let loc = Self::upvalue_location(*up);
            if loc == location {
                return *up;
            }
            if loc < location {
                insert_at = i;
                break;
            }
        }
        let roots = vm_roots(&self.stack, &self.frames, &self.globals, &self.open_upvalues);
        let created = self.heap.alloc_upvalue(location, &roots);
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes (copies the value inline) every open upvalue whose location
    /// is at or above `boundary`, removing it from the open list.
    fn close_upvalues(&mut self, boundary: usize) {
        while let Some(&up) = self.open_upvalues.first() {
            let loc = Self::upvalue_location(up);
            if loc < boundary {
                break;
            }
            let value = self.stack[loc];
            *up.as_upvalue().unwrap().state.borrow_mut() = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // -- containers ---------------------------------------------------------

    fn collect(&mut self, count: usize) {
        let mut values = self.stack.split_off(self.stack.len() - count);
        let array_ref = self.peek(0).as_object().unwrap();
        std::mem::swap(&mut *array_ref.as_array().unwrap().values.borrow_mut(), &mut values);
        // `values` now holds whatever was previously in the (freshly
        // allocated, empty) array — discard it.
        let _ = values;
    }

    fn round_index(n: f64) -> i64 {
        n.round_ties_even() as i64
    }

    fn array_of(value: Value) -> Result<&'static ObjArray, RuntimeError> {
        // SAFETY: caller only holds this reference for the duration of the
        // borrow below; lifetime erasure here just avoids threading `self`
        // through every helper. The underlying allocation outlives the VM.
        match value {
            Value::Object(obj) => match &obj.deref().kind {
                ObjKind::Array(arr) => Ok(unsafe { std::mem::transmute::<&ObjArray, &'static ObjArray>(arr) }),
                _ => Err(RuntimeError::NotIndexable),
            },
            _ => Err(RuntimeError::NotIndexable),
        }
    }

    fn get_array(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let array_v = self.pop();
        let arr = Self::array_of(array_v)?;
        let idx = Self::round_index(index.as_number().ok_or(RuntimeError::NotANumber)?);
        if idx < 1 {
            return Err(RuntimeError::IndexOutOfRange);
        }
        let value = arr
            .values
            .borrow()
            .get((idx - 1) as usize)
            .copied()
            .ok_or(RuntimeError::IndexOutOfRange)?;
        self.push(value);
        Ok(())
    }

    fn set_array(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let array_v = self.pop();
        let arr = Self::array_of(array_v)?;
        let idx = Self::round_index(index.as_number().ok_or(RuntimeError::NotANumber)?);
        if idx < 1 {
            return Err(RuntimeError::IndexOutOfRange);
        }
        let idx = (idx - 1) as usize;
        let mut values = arr.values.borrow_mut();
        if idx < values.len() {
            values[idx] = value;
        } else {
            values.resize(idx, Value::Nil);
            values.push(value);
        }
        drop(values);
        self.push(value);
        Ok(())
    }

    fn get_array_count(&mut self) -> Result<(), RuntimeError> {
        let container = self.peek(0);
        let count = self.container_count(container)?;
        self.push(Value::Number(count as f64));
        Ok(())
    }

    /// Reads the N-th element (1-based) of the array/table sitting beneath
    /// the counter on the stack, without disturbing the container.
    fn get_array_loop(&mut self) -> Result<(), RuntimeError> {
        let counter = self.pop();
        let idx = Self::round_index(counter.as_number().ok_or(RuntimeError::NotANumber)?);
        if idx < 1 {
            return Err(RuntimeError::IndexOutOfRange);
        }
        let container = self.peek(0);
        let value = match container {
            Value::Object(obj) => match &obj.deref().kind {
                ObjKind::Array(arr) => arr
                    .values
                    .borrow()
                    .get((idx - 1) as usize)
                    .copied()
                    .ok_or(RuntimeError::IndexOutOfRange)?,
                ObjKind::Table(table) => {
                    table
                        .table
                        .borrow()
                        .nth((idx - 1) as usize)
                        .map(|(_, v)| v)
                        .ok_or(RuntimeError::IndexOutOfRange)?
                }
                _ => return Err(RuntimeError::NotIndexable),
            },
            _ => return Err(RuntimeError::NotIndexable),
        };
        self.push(value);
        Ok(())
    }

    fn container_count(&self, value: Value) -> Result<usize, RuntimeError> {
        match value {
            Value::Object(obj) => match &obj.deref().kind {
                ObjKind::Array(arr) => Ok(arr.values.borrow().len()),
                ObjKind::Table(table) => Ok(table.table.borrow().len()),
                _ => Err(RuntimeError::NotIndexable),
            },
            _ => Err(RuntimeError::NotIndexable),
        }
    }

    fn table_set(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let key = self.read_constant(wide).as_object().unwrap();
        let value = self.pop();
        let table_v = self.peek(0);
        let table_ref = table_v.as_object().filter(|o| o.as_table().is_some()).ok_or(RuntimeError::NotIndexable)?;
        table_ref.as_table().unwrap().table.borrow_mut().set(key, value);
        Ok(())
    }

    fn table_get(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let key = self.read_constant(wide).as_object().unwrap();
        let table_v = self.pop();
        let table_ref = table_v.as_object().filter(|o| o.as_table().is_some()).ok_or(RuntimeError::NotIndexable)?;
        let value = table_ref.as_table().unwrap().table.borrow().get(key).unwrap_or(Value::Nil);
        self.push(value);
        Ok(())
    }

    fn table_clc_set(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let key_v = self.pop();
        let table_v = self.pop();
        let key = key_v.as_object().filter(|o| o.as_string().is_some()).ok_or(RuntimeError::KeyMustBeString)?;
        let table_ref = table_v.as_object().filter(|o| o.as_table().is_some()).ok_or(RuntimeError::NotIndexable)?;
        table_ref.as_table().unwrap().table.borrow_mut().set(key, value);
        self.push(value);
        Ok(())
    }

    fn table_clc_get(&mut self) -> Result<(), RuntimeError> {
        let key_v = self.pop();
        let table_v = self.pop();
        let key = key_v.as_object().filter(|o| o.as_string().is_some()).ok_or(RuntimeError::KeyMustBeString)?;
        let table_ref = table_v.as_object().filter(|o| o.as_table().is_some()).ok_or(RuntimeError::NotIndexable)?;
        let value = table_ref.as_table().unwrap().table.borrow().get(key).unwrap_or(Value::Nil);
        self.push(value);
        Ok(())
    }

    // -- control flow -------------------------------------------------------

    /// Tests `NOT(top)` against `matches` without popping — callers emit an
    /// explicit `POP` in whichever arm they take, per spec §4.2.
    fn conditional_jump(&mut self, matches: impl Fn(Logic) -> bool) {
        let offset = self.read_u16();
        let top = self.peek(0);
        if matches(top.not()) {
            self.frames.last_mut().unwrap().ip += offset as usize;
        }
    }

    /// Leaves the switch value on the stack: exactly one of the landed-at
    /// case/default bodies pops it, matching the single-Pop each arm emits.
    fn jump_table_jump(&mut self) -> Result<(), RuntimeError> {
        let table_idx = self.read_u8() as usize;
        let switch_start = self.frames.last().unwrap().ip;
        let value = self.peek(0);
        let key = value
            .as_object()
            .filter(|o| o.as_string().is_some())
            .ok_or(RuntimeError::SwitchRequiresString)?;
        let jump_table = &self.frames.last().unwrap().chunk().jump_tables[table_idx];
        let offset = match jump_table.get(key) {
            Some(Value::Number(n)) => n,
            _ => {
                let roots = vm_roots(&self.stack, &self.frames, &self.globals, &self.open_upvalues);
                let default_key = self.heap.intern(SWITCH_DEFAULT_KEY, &roots);
                match self.frames.last().unwrap().chunk().jump_tables[table_idx].get(default_key) {
                    Some(Value::Number(n)) => n,
                    _ => return Err(RuntimeError::NoMatchingCase),
                }
            }
        };
        self.frames.last_mut().unwrap().ip = switch_start + offset as usize;
        Ok(())
    }

    // -- calling convention ---------------------------------------------

    fn call(&mut self, argc: u8) -> Result<(), RuntimeError> {
        let callee = self.peek(argc as usize);
        match callee {
            Value::Object(obj) if obj.as_closure().is_some() => {
                let closure = obj.as_closure().unwrap();
                let function = closure.function.as_function().unwrap();
                if function.arity != argc {
                    return Err(RuntimeError::WrongArity {
                        expected: function.arity,
                        got: argc,
                    });
                }
                if self.frames.len() >= self.config.frames_max {
                    return Err(RuntimeError::StackOverflow);
                }
                self.frames.push(CallFrame {
                    closure: obj,
                    ip: 0,
                    slots: self.stack.len() - argc as usize - 1,
                });
                Ok(())
            }
            Value::Object(obj) if obj.as_native().is_some() => {
                let native = obj.as_native().unwrap();
                let args_start = self.stack.len() - argc as usize;
                let result = (native.func)(&self.stack[args_start..]).map_err(RuntimeError::Native)?;
                let value = match (&native.return_tag, result) {
                    (ReturnTag::Nil, _) => Value::Nil,
                    (ReturnTag::Number, NativeReturn::Number(n)) => Value::Number(n),
                    (ReturnTag::String, NativeReturn::String(s)) => {
                        let roots =
                            vm_roots(&self.stack, &self.frames, &self.globals, &self.open_upvalues);
                        Value::Object(self.heap.intern(&s, &roots))
                    }
                    _ => Value::Nil,
                };
                self.stack.truncate(args_start - 1);
                self.push(value);
                Ok(())
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn closure(&mut self, wide: bool) {
        let function_ref = self.read_constant(wide).as_object().unwrap();
        let upvalue_count = function_ref.as_function().unwrap().upvalue_count;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_u8() != 0;
            let index = self.read_u8() as usize;
            let up = if is_local {
                let base = self.frames.last().unwrap().slots;
                self.capture_upvalue(base + index)
            } else {
                self.frames.last().unwrap().closure.as_closure().unwrap().upvalues[index]
            };
            upvalues.push(up);
        }
        let roots = vm_roots(&self.stack, &self.frames, &self.globals, &self.open_upvalues);
        let closure_ref = self.heap.alloc_closure(
            ObjClosure {
                function: function_ref,
                upvalues,
            },
            &roots,
        );
        self.push(Value::Object(closure_ref));
    }

    /// Returns `true` when the whole program has finished (the script's
    /// own frame returned).
    fn do_return(&mut self) -> bool {
        let result = self.pop();
        let frame = self.frames.pop().unwrap();
        self.close_upvalues(frame.slots);
        if self.frames.is_empty() {
            self.stack.clear();
            true
        } else {
            self.stack.truncate(frame.slots);
            self.push(result);
            false
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run_capture(source: &str) -> String {
        let mut vm = Vm::new_default();
        let buf: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        vm.set_output_writer(buf.clone());
        match vm.interpret(source) {
            InterpretResult::Ok => {}
            InterpretResult::CompileError(diags) => panic!("compile error: {diags:?}"),
            InterpretResult::RuntimeError { message, trace } => {
                panic!("runtime error: {message} ({trace:?})")
            }
        }
        let bytes = buf.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn arithmetic_and_disp() {
        assert_eq!(run_capture("var x = 1 + 2; disp(x)"), "3\n");
    }

    #[test]
    fn array_literal_and_index() {
        assert_eq!(run_capture("var a = [10, 20, 30]; disp(a[2])"), "20\n");
    }

    #[test]
    fn recursive_function() {
        assert_eq!(
            run_capture(
                "function f(n) var r = 1; if n > 1 do r = n * f(n - 1) end (r) disp(f(5))"
            ),
            "120\n"
        );
    }

    #[test]
    fn ternary_if_dispatches_unknown_branch() {
        assert_eq!(
            run_capture("if unknown do true: disp(\"t\") end unknown: disp(\"u\") end"),
            "u\n"
        );
    }

    #[test]
    fn switch_dispatches_by_jump_table() {
        assert_eq!(
            run_capture(
                "switch \"two\" do case \"one\" do disp(1); case \"two\" do disp(2); default do disp(0)"
            ),
            "2\n"
        );
    }

    #[test]
    fn each_sums_an_array() {
        assert_eq!(
            run_capture("var a = [1,2,3,4]; var s = 0; each x in a do s = s + x; disp(s)"),
            "10\n"
        );
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        let src = "function make() var n = 0; function inc() n = n + 1; disp(n) end inc(); inc() end make()";
        assert_eq!(run_capture(src), "1\n2\n");
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new_default();
        match vm.interpret("disp(nope)") {
            InterpretResult::RuntimeError { .. } => {}
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn wrong_arity_is_a_runtime_error() {
        let mut vm = Vm::new_default();
        match vm.interpret("function f(a, b) disp(a) end f(1)") {
            InterpretResult::RuntimeError { .. } => {}
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn stack_returns_to_starting_depth_after_a_call() {
        let mut vm = Vm::new_default();
        vm.interpret("function f(n) var r = 1; if n > 1 do r = n * f(n - 1) end (r) var s = f(6)");
        assert_eq!(vm.stack.len(), 0);
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn table_literal_and_dotted_read() {
        assert_eq!(
            run_capture("var t = :[x: 1, y: 2]; disp(t.y)"),
            "2\n"
        );
    }

    #[test]
    fn calculated_table_access_round_trips() {
        assert_eq!(
            run_capture("var t = :[x: 1]; var k = \"x\"; t:[k] = 9; disp(t:[k])"),
            "9\n"
        );
    }

    #[test]
    fn array_write_past_end_extends_with_nil() {
        assert_eq!(
            run_capture("var a = [1]; a[3] = 9; disp(a[2])"),
            "nil\n"
        );
    }

    /// Spec §8 invariant 2: `open_upvalues` stays sorted by strictly
    /// descending slot location at every point a capture could touch it.
    #[test]
    fn open_upvalues_stay_in_strictly_descending_order() {
        let mut vm = Vm::new_default();
        let src = "function make() var a = 1; var b = 2; var c = 3; \
                    function r() disp(a); disp(b); disp(c) end r() end make()";
        vm.interpret(src);
        let locations: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|up| Vm::upvalue_location(*up))
            .collect();
        let mut sorted = locations.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(locations, sorted);
    }

    const STACK_DISCIPLINE_CORPUS: &[&str] = &[
        "var x = 1 + 2; disp(x)",
        "function f(n) var r = 1; if n > 1 do r = n * f(n - 1) end (r) var s = f(6)",
        "var a = [1,2,3,4]; var s = 0; each x in a do s = s + x; disp(s)",
        "var t = :[x: 1]; var k = \"x\"; t:[k] = 9; disp(t:[k])",
        "switch \"two\" do case \"one\" do disp(1); case \"two\" do disp(2); default do disp(0)",
        "function make() var n = 0; function inc() n = n + 1; disp(n) end inc(); inc() end make()",
        "if unknown do true: disp(\"t\") end unknown: disp(\"u\") end",
        "var a = [1,2,3,4,5]; var s = 0; each x in a do { s = s + x; if x >= 3 do break } disp(s)",
    ];

    proptest::proptest! {
        /// Spec §8 invariant 4: for any well-typed terminating program, the
        /// value stack and call-frame stack return to their starting depth.
        #[test]
        fn stack_returns_to_starting_depth(index in 0..STACK_DISCIPLINE_CORPUS.len()) {
            let mut vm = Vm::new_default();
            let buf: OutputWriter = Rc::new(RefCell::new(Vec::new()));
            vm.set_output_writer(buf);
            match vm.interpret(STACK_DISCIPLINE_CORPUS[index]) {
                InterpretResult::Ok => {}
                other => panic!("expected Ok, got {other:?}"),
            }
            proptest::prop_assert_eq!(vm.stack.len(), 0);
            proptest::prop_assert!(vm.frames.is_empty());
        }
    }
}
