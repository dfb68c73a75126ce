//! Stack-based bytecode interpreter. See spec.md §5.
//!
//! Mirrors the teacher's `bytecode::vm` dispatch-loop shape (a big `match`
//! over the current opcode, advancing an instruction pointer inside the
//! active `CallFrame`) but swaps in mark-and-sweep GC for refcounting and a
//! much smaller opcode set (spec.md §5.3, §4.4).

use ahash::AHashMap;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::bytecode::{Code, Opcode};
use crate::builtins;
use crate::diagnostics::RunError;
use crate::heap::Heap;
use crate::value::{HeapData, HeapId, Value};

const MAX_VALUE_STACK: usize = 4096;
const MAX_CALL_DEPTH: usize = 256;
const MAX_TRY_DEPTH: usize = 64;

type RunResult<T> = Result<T, RunError>;

pub struct LoadedProgram {
    pub functions: Vec<Code>,
    pub strings: Vec<String>,
    pub struct_field_names: Vec<Vec<u32>>,
    pub class_field_names: Vec<Vec<u32>>,
    pub class_parent: Vec<Option<u32>>,
    pub class_methods: Vec<AHashMap<u32, u32>>,
    pub num_globals: u16,
    pub init_function: u32,
    pub entry_function: Option<u32>,
}

impl From<crate::bytefmt::LoadedModule> for LoadedProgram {
    fn from(m: crate::bytefmt::LoadedModule) -> Self {
        LoadedProgram {
            functions: m.functions.into_iter().map(|f| f.code).collect(),
            strings: m.strings,
            struct_field_names: m.structs.into_iter().map(|s| s.field_name_ids).collect(),
            class_field_names: m.classes.iter().map(|c| c.field_name_ids.clone()).collect(),
            class_parent: m.classes.iter().map(|c| c.parent_index).collect(),
            class_methods: m.classes.into_iter().map(|c| c.methods.into_iter().collect()).collect(),
            num_globals: m.num_globals,
            init_function: m.init_function,
            entry_function: m.entry_function,
        }
    }
}

struct Frame {
    func_index: u32,
    ip: usize,
    locals_base: usize,
    /// Stack depth to restore to on return (frame's locals are laid out on
    /// the value stack starting here, spec.md §5.1).
    stack_base: usize,
}

struct TryHandler {
    frame_depth: usize,
    stack_depth: usize,
    handler_ip: usize,
}

/// Per-call-site monomorphic inline cache, keyed by `(code buffer pointer,
/// instruction offset)` so entries never alias across functions even though
/// two different functions' bytecode `Vec<u8>` could in principle reuse an
/// address after one is freed (spec.md §5.4 — allocations are never freed
/// mid-run here, but the key shape still avoids any ambiguity).
#[derive(Default)]
struct InlineCache {
    entries: AHashMap<(usize, usize), u32>,
}

impl InlineCache {
    fn get(&self, code_ptr: *const u8, ip: usize) -> Option<u32> {
        self.entries.get(&(code_ptr as usize, ip)).copied()
    }

    fn set(&mut self, code_ptr: *const u8, ip: usize, target: u32) {
        self.entries.insert((code_ptr as usize, ip), target);
    }
}

pub struct Vm {
    program: LoadedProgram,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    try_stack: Vec<TryHandler>,
    globals: Vec<Value>,
    heap: Heap,
    cache: InlineCache,
    rng: ChaCha8Rng,
    argv: Vec<String>,
    pub stdout: String,
}

impl Vm {
    #[must_use]
    pub fn new(program: LoadedProgram) -> Self {
        Self::with_argv(program, Vec::new())
    }

    /// Builds a `Vm` with the program's argument vector (`argv`/`argc`
    /// builtins, spec.md §6). The RNG starts from entropy; `rand_seed`
    /// re-seeds it deterministically for reproducible runs.
    #[must_use]
    pub fn with_argv(program: LoadedProgram, argv: Vec<String>) -> Self {
        let globals = vec![Value::Null; program.num_globals as usize];
        Vm {
            program,
            stack: Vec::new(),
            frames: Vec::new(),
            try_stack: Vec::new(),
            globals,
            heap: Heap::new(),
            cache: InlineCache::default(),
            rng: ChaCha8Rng::from_entropy(),
            argv,
            stdout: String::new(),
        }
    }

    /// Runs `$init` (global initializers) followed by the module's entry
    /// function, matching the driver's `stratum run` contract (spec.md §6).
    /// Returns the integer the program exited with: `main`'s return value
    /// coerced to `Int`, or the code passed to `exit()`.
    pub fn run(&mut self) -> RunResult<i64> {
        self.call_function(self.program.init_function, 0)?;
        self.drain_until_frames_empty()?;
        let Some(entry) = self.program.entry_function else {
            return Err(RunError::Fatal("module has no 'main' function".to_owned()));
        };
        self.call_function(entry, 0)?;
        match self.drain_until_frames_empty() {
            Ok(()) => Ok(match self.stack.pop() {
                Some(Value::Int(code)) => code,
                _ => 0,
            }),
            Err(RunError::Exit(code)) => Ok(code),
            Err(e) => Err(e),
        }
    }

    fn push(&mut self, v: Value) -> RunResult<()> {
        if self.stack.len() >= MAX_VALUE_STACK {
            return Err(RunError::Fatal("value stack overflow".to_owned()));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.stack.pop().ok_or_else(|| RunError::Fatal("value stack underflow".to_owned()))
    }

    fn call_function(&mut self, index: u32, argc: u8) -> RunResult<()> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(RunError::Fatal("call stack overflow".to_owned()));
        }
        let code = self
            .program
            .functions
            .get(index as usize)
            .ok_or_else(|| RunError::Fatal(format!("call to unknown function index {index}")))?;
        let stack_base = self.stack.len() - argc as usize;
        let locals_base = stack_base;
        for _ in argc as usize..code.num_locals as usize {
            self.push(Value::Null)?;
        }
        self.frames.push(Frame { func_index: index, ip: 0, locals_base, stack_base });
        Ok(())
    }

    fn current_code(&self) -> &Code {
        let idx = self.frames.last().unwrap().func_index;
        &self.program.functions[idx as usize]
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let code = &self.program.functions[frame.func_index as usize];
        let b = code.bytecode[frame.ip];
        frame.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_u8();
        let hi = self.read_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn read_u32(&mut self) -> u32 {
        let a = self.read_u8();
        let b = self.read_u8();
        let c = self.read_u8();
        let d = self.read_u8();
        u32::from_le_bytes([a, b, c, d])
    }

    fn local_slot(&self, slot: u16) -> usize {
        self.frames.last().unwrap().locals_base + slot as usize
    }

    /// Runs until the frame stack that existed when this was called empties
    /// out, i.e. the initial call (and everything it transitively calls)
    /// has returned.
    fn drain_until_frames_empty(&mut self) -> RunResult<()> {
        while !self.frames.is_empty() {
            match self.step() {
                Ok(()) => {}
                Err(e) if !e.is_fatal() => self.propagate_exception(e)?,
                Err(e) => return Err(e),
            }
            if self.heap.should_collect() {
                self.collect_garbage();
            }
        }
        Ok(())
    }

    fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = self.stack.clone();
        roots.extend(self.globals.iter().copied());
        self.heap.collect(roots.into_iter());
    }

    /// Unwinds to the nearest enclosing `try` handler, pushing the
    /// stringified error as the value `catch` sees. Returns `Err` (fatal)
    /// if no handler remains, per spec.md §5.5.
    fn propagate_exception(&mut self, err: RunError) -> RunResult<()> {
        let Some(handler) = self.try_stack.pop() else {
            return Err(RunError::Fatal(format!("unhandled exception: {err}")));
        };
        self.frames.truncate(handler.frame_depth);
        self.stack.truncate(handler.stack_depth);
        let msg = match &err {
            RunError::Recoverable(m) | RunError::Fatal(m) => m.clone(),
            RunError::Exit(code) => format!("exit({code})"),
        };
        let id = self.heap.alloc(HeapData::Str(msg.into_boxed_str()));
        self.push(Value::Heap(id))?;
        self.frames.last_mut().unwrap().ip = handler.handler_ip;
        Ok(())
    }

    /// Executes a single instruction.
    fn step(&mut self) -> RunResult<()> {
        let op_byte = self.read_u8();
        let op = decode_opcode(op_byte).ok_or_else(|| RunError::Fatal(format!("unknown opcode byte {op_byte}")))?;
        match op {
            Opcode::LoadConstInt => {
                let idx = self.read_u32();
                let v = self.current_code().int_consts[idx as usize];
                self.push(Value::Int(v))?;
            }
            Opcode::LoadConstFloat => {
                let idx = self.read_u32();
                let v = self.current_code().float_consts[idx as usize];
                self.push(Value::Float(v))?;
            }
            Opcode::LoadConstStr => {
                let idx = self.read_u32();
                let str_id = self.current_code().str_const_ids[idx as usize];
                let s = self.program.strings[str_id as usize].clone();
                let id = self.heap.alloc(HeapData::Str(s.into_boxed_str()));
                self.push(Value::Heap(id))?;
            }
            Opcode::LoadTrue => self.push(Value::Bool(true))?,
            Opcode::LoadFalse => self.push(Value::Bool(false))?,
            Opcode::LoadNull => self.push(Value::Null)?,
            Opcode::LoadLocal => {
                let slot = self.read_u16();
                let idx = self.local_slot(slot);
                self.push(self.stack[idx])?;
            }
            Opcode::StoreLocal => {
                let slot = self.read_u16();
                let v = self.pop()?;
                let idx = self.local_slot(slot);
                self.stack[idx] = v;
            }
            Opcode::LoadGlobal => {
                let slot = self.read_u16();
                self.push(self.globals[slot as usize])?;
            }
            Opcode::StoreGlobal => {
                let slot = self.read_u16();
                let v = self.pop()?;
                self.globals[slot as usize] = v;
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let v = *self.stack.last().ok_or_else(|| RunError::Fatal("stack underflow on dup".to_owned()))?;
                self.push(v)?;
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => self.binary_arith(op)?,
            Opcode::Eq | Opcode::NotEq | Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => self.binary_compare(op)?,
            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::Shl | Opcode::Shr => self.binary_bitwise(op)?,
            Opcode::Neg => {
                let v = self.pop()?;
                self.push(match v {
                    Value::Int(i) => Value::Int(-i),
                    Value::Float(f) => Value::Float(-f),
                    _ => return Err(RunError::Recoverable("cannot negate non-numeric value".to_owned())),
                })?;
            }
            Opcode::Not => {
                let v = self.pop()?;
                self.push(Value::Bool(!v.truthy()))?;
            }
            Opcode::BitNot => {
                let v = self.pop()?;
                match v {
                    Value::Int(i) => self.push(Value::Int(!i))?,
                    _ => return Err(RunError::Recoverable("cannot bitwise-not non-integer value".to_owned())),
                }
            }
            Opcode::Jump => {
                let target = self.read_u32();
                self.frames.last_mut().unwrap().ip = target as usize;
            }
            Opcode::JumpIfFalse => {
                let target = self.read_u32();
                let cond = self.pop()?;
                if !cond.truthy() {
                    self.frames.last_mut().unwrap().ip = target as usize;
                }
            }
            Opcode::JumpIfTrue => {
                let target = self.read_u32();
                let cond = self.pop()?;
                if cond.truthy() {
                    self.frames.last_mut().unwrap().ip = target as usize;
                }
            }
            Opcode::Call => {
                let code_ptr = self.current_code().bytecode.as_ptr();
                // `ip` was already advanced past the opcode byte by the
                // `read_u8` above; that position alone identifies the call
                // site uniquely within this function's bytecode.
                let call_site_ip = self.frames.last().unwrap().ip - 1;
                let idx = self.read_u16();
                let argc = self.read_u8();
                let target = self.cache.get(code_ptr, call_site_ip).unwrap_or(u32::from(idx));
                self.cache.set(code_ptr, call_site_ip, target);
                self.call_function(target, argc)?;
            }
            Opcode::CallBuiltin => {
                let id = self.read_u16();
                let argc = self.read_u8();
                self.call_builtin(id, argc)?;
            }
            Opcode::CallMethod | Opcode::SuperCall | Opcode::SuperMethodCall => {
                // Dynamic dispatch / inheritance extensions are out of scope
                // for this core (see DESIGN.md's vm.rs "Open Questions
                // resolved" note, spec.md §9's second Open Question); the
                // operand shape is still decoded so well-formed modules
                // execute without a malformed-bytecode fault.
                let _ = self.read_u16();
                let argc = self.read_u8();
                for _ in 0..argc {
                    self.pop()?;
                }
                self.pop()?; // receiver
                self.push(Value::Null)?;
            }
            Opcode::NewArray => {
                let count = self.read_u16();
                let _ = self.read_u16();
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.pop()?);
                }
                items.reverse();
                let id = self.heap.alloc(HeapData::Array(items));
                self.push(Value::Heap(id))?;
            }
            Opcode::NewMap => {
                let count = self.read_u16();
                let _ = self.read_u16();
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let v = self.pop()?;
                    let k = self.pop()?;
                    pairs.push((k, v));
                }
                pairs.reverse();
                let id = self.heap.alloc(HeapData::Map(pairs));
                self.push(Value::Heap(id))?;
            }
            Opcode::NewRecord => {
                // The compiler doesn't currently encode a struct-type index
                // here (struct identity isn't needed at runtime since field
                // access is by compile-time-resolved index); the operand is
                // reserved for a future typed-record extension.
                let _type_idx = self.read_u16();
                let field_count = self.read_u16();
                let mut fields = Vec::with_capacity(field_count as usize);
                for _ in 0..field_count {
                    fields.push(self.pop()?);
                }
                fields.reverse();
                let id = self.heap.alloc(HeapData::Record { type_name: crate::intern::StringId(0), fields });
                self.push(Value::Heap(id))?;
            }
            Opcode::NewInstance => {
                let class_idx = self.read_u16();
                let argc = self.read_u8();
                let mut fields = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    fields.push(self.pop()?);
                }
                fields.reverse();
                let id = self.heap.alloc(HeapData::ClassInstance { class_index: u32::from(class_idx), fields });
                self.push(Value::Heap(id))?;
            }
            Opcode::Index => {
                let index = self.pop()?;
                let container = self.pop()?;
                self.push(self.index_get(container, index)?)?;
            }
            Opcode::IndexSet => {
                let value = self.pop()?;
                let index = self.pop()?;
                let container = self.pop()?;
                self.index_set(container, index, value)?;
            }
            Opcode::GetField => {
                let field_idx = self.read_u16();
                let obj = self.pop()?;
                let Value::Heap(id) = obj else {
                    return Err(RunError::Recoverable("field access on non-object value".to_owned()));
                };
                let v = match self.heap.get(id) {
                    HeapData::Record { fields, .. } | HeapData::ClassInstance { fields, .. } => {
                        *fields.get(field_idx as usize).ok_or_else(|| RunError::Recoverable("field index out of range".to_owned()))?
                    }
                    _ => return Err(RunError::Recoverable("field access on non-record value".to_owned())),
                };
                self.push(v)?;
            }
            Opcode::SetField => {
                let field_idx = self.read_u16();
                let value = self.pop()?;
                let obj = self.pop()?;
                let Value::Heap(id) = obj else {
                    return Err(RunError::Recoverable("field assignment on non-object value".to_owned()));
                };
                match self.heap.get_mut(id) {
                    HeapData::Record { fields, .. } | HeapData::ClassInstance { fields, .. } => {
                        if let Some(slot) = fields.get_mut(field_idx as usize) {
                            *slot = value;
                        } else {
                            return Err(RunError::Recoverable("field index out of range".to_owned()));
                        }
                    }
                    _ => return Err(RunError::Recoverable("field assignment on non-record value".to_owned())),
                }
            }
            Opcode::MakeClosure => {
                let func_idx = self.read_u16();
                let id = self.heap.alloc(HeapData::Closure { function_index: u32::from(func_idx), captured: Vec::new() });
                self.push(Value::Heap(id))?;
            }
            Opcode::Return => {
                let v = self.pop()?;
                let frame = self.frames.pop().unwrap();
                self.stack.truncate(frame.stack_base);
                self.push(v)?;
            }
            Opcode::ReturnVoid => {
                let frame = self.frames.pop().unwrap();
                self.stack.truncate(frame.stack_base);
                self.push(Value::Null)?;
            }
            Opcode::TryBegin => {
                let handler_ip = self.read_u32();
                if self.try_stack.len() >= MAX_TRY_DEPTH {
                    return Err(RunError::Fatal("too many nested try blocks".to_owned()));
                }
                self.try_stack.push(TryHandler { frame_depth: self.frames.len(), stack_depth: self.stack.len(), handler_ip: handler_ip as usize });
            }
            Opcode::TryEnd => {
                self.try_stack.pop();
            }
            Opcode::Throw => {
                let v = self.pop()?;
                let msg = self.stringify(v);
                return Err(RunError::Recoverable(msg));
            }
        }
        Ok(())
    }

    fn binary_arith(&mut self, op: Opcode) -> RunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (a, b) {
            (Value::Heap(ha), Value::Heap(hb)) if op == Opcode::Add => {
                if let (HeapData::Str(sa), HeapData::Str(sb)) = (self.heap.get(ha), self.heap.get(hb)) {
                    let concatenated = format!("{sa}{sb}");
                    let id = self.heap.alloc(HeapData::Str(concatenated.into_boxed_str()));
                    Value::Heap(id)
                } else {
                    return Err(RunError::Recoverable("arithmetic on non-numeric values".to_owned()));
                }
            }
            (Value::Int(x), Value::Int(y)) => match op {
                Opcode::Add => Value::Int(x.wrapping_add(y)),
                Opcode::Sub => Value::Int(x.wrapping_sub(y)),
                Opcode::Mul => Value::Int(x.wrapping_mul(y)),
                Opcode::Div => {
                    if y == 0 {
                        return Err(RunError::Recoverable("division by zero".to_owned()));
                    }
                    Value::Int(x / y)
                }
                Opcode::Mod => {
                    if y == 0 {
                        return Err(RunError::Recoverable("division by zero".to_owned()));
                    }
                    Value::Int(x % y)
                }
                _ => unreachable!(),
            },
            (a, b) => {
                let (x, y) = (as_f64(a)?, as_f64(b)?);
                match op {
                    Opcode::Add => Value::Float(x + y),
                    Opcode::Sub => Value::Float(x - y),
                    Opcode::Mul => Value::Float(x * y),
                    Opcode::Div => Value::Float(x / y),
                    Opcode::Mod => Value::Float(x % y),
                    _ => unreachable!(),
                }
            }
        };
        self.push(result)
    }

    fn binary_compare(&mut self, op: Opcode) -> RunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let ordering = match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.cmp(&y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(&y),
            (Value::Heap(ha), Value::Heap(hb)) => {
                if let (HeapData::Str(sa), HeapData::Str(sb)) = (self.heap.get(ha), self.heap.get(hb)) {
                    sa.cmp(sb)
                } else {
                    return self.push(Value::Bool(op == Opcode::Eq && ha == hb || op == Opcode::NotEq && ha != hb));
                }
            }
            (a, b) => {
                let (x, y) = (as_f64(a)?, as_f64(b)?);
                return self.push(Value::Bool(match op {
                    Opcode::Eq => x == y,
                    Opcode::NotEq => x != y,
                    Opcode::Lt => x < y,
                    Opcode::Gt => x > y,
                    Opcode::Le => x <= y,
                    Opcode::Ge => x >= y,
                    _ => unreachable!(),
                }));
            }
        };
        let result = match op {
            Opcode::Eq => ordering.is_eq(),
            Opcode::NotEq => ordering.is_ne(),
            Opcode::Lt => ordering.is_lt(),
            Opcode::Gt => ordering.is_gt(),
            Opcode::Le => ordering.is_le(),
            Opcode::Ge => ordering.is_ge(),
            _ => unreachable!(),
        };
        self.push(Value::Bool(result))
    }

    fn binary_bitwise(&mut self, op: Opcode) -> RunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (Value::Int(x), Value::Int(y)) = (a, b) else {
            return Err(RunError::Recoverable("bitwise operator on non-integer values".to_owned()));
        };
        let result = match op {
            Opcode::BitAnd => x & y,
            Opcode::BitOr => x | y,
            Opcode::BitXor => x ^ y,
            Opcode::Shl => x << (y & 63),
            Opcode::Shr => x >> (y & 63),
            _ => unreachable!(),
        };
        self.push(Value::Int(result))
    }

    fn index_get(&mut self, container: Value, index: Value) -> RunResult<Value> {
        let Value::Heap(id) = container else {
            return Err(RunError::Recoverable("indexing a non-container value".to_owned()));
        };
        match self.heap.get(id) {
            HeapData::Array(items) => {
                let Value::Int(i) = index else { return Err(RunError::Recoverable("array index must be an integer".to_owned())) };
                items.get(i as usize).copied().ok_or_else(|| RunError::Recoverable("array index out of bounds".to_owned()))
            }
            HeapData::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| values_equal(self, *k, index))
                .map(|(_, v)| *v)
                .ok_or_else(|| RunError::Recoverable("key not found in map".to_owned())),
            _ => Err(RunError::Recoverable("indexing a non-container value".to_owned())),
        }
    }

    fn index_set(&mut self, container: Value, index: Value, value: Value) -> RunResult<()> {
        let Value::Heap(id) = container else {
            return Err(RunError::Recoverable("indexing a non-container value".to_owned()));
        };
        match self.heap.get_mut(id) {
            HeapData::Array(items) => {
                let Value::Int(i) = index else { return Err(RunError::Recoverable("array index must be an integer".to_owned())) };
                let slot = items.get_mut(i as usize).ok_or_else(|| RunError::Recoverable("array index out of bounds".to_owned()))?;
                *slot = value;
                Ok(())
            }
            HeapData::Map(pairs) => {
                if let Some(entry) = pairs.iter_mut().find(|(k, _)| *k == index) {
                    entry.1 = value;
                } else {
                    pairs.push((index, value));
                }
                Ok(())
            }
            _ => Err(RunError::Recoverable("indexing a non-container value".to_owned())),
        }
    }

    fn stringify(&self, v: Value) -> String {
        match v {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => "null".to_owned(),
            Value::Heap(id) => match self.heap.get(id) {
                HeapData::Str(s) => s.to_string(),
                other => format!("<{}>", other.variant_name()),
            },
        }
    }

    fn call_builtin(&mut self, id: u16, argc: u8) -> RunResult<()> {
        let sig = builtins::by_id(id).ok_or_else(|| RunError::Fatal(format!("unknown builtin id {id}")))?;
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let result = self.exec_builtin(sig.name, &args)?;
        self.push(result)
    }

    fn exec_builtin(&mut self, name: &str, args: &[Value]) -> RunResult<Value> {
        match name {
            "print" => {
                let line: Vec<String> = args.iter().map(|v| self.stringify(*v)).collect();
                self.stdout.push_str(&line.join(" "));
                self.stdout.push('\n');
                Ok(Value::Null)
            }
            "len" | "array_len" | "map_len" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("len() expects a container".to_owned())) };
                let n = match self.heap.get(id) {
                    HeapData::Str(s) => s.len(),
                    HeapData::Array(items) => items.len(),
                    HeapData::Map(pairs) => pairs.len(),
                    _ => return Err(RunError::Recoverable("len() expects a container".to_owned())),
                };
                Ok(Value::Int(n as i64))
            }
            "str_concat" => {
                let a = self.stringify(args[0]);
                let b = self.stringify(args[1]);
                let id = self.heap.alloc(HeapData::Str(format!("{a}{b}").into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "int_to_str" | "float_to_str" => {
                let s = self.stringify(args[0]);
                let id = self.heap.alloc(HeapData::Str(s.into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "str_to_int" => {
                let s = self.as_str(args[0])?;
                s.trim().parse::<i64>().map(Value::Int).map_err(|_| RunError::Recoverable(format!("cannot parse '{s}' as int")))
            }
            "str_to_float" => {
                let s = self.as_str(args[0])?;
                s.trim().parse::<f64>().map(Value::Float).map_err(|_| RunError::Recoverable(format!("cannot parse '{s}' as float")))
            }
            "str_upper" => self.map_str(args[0], |s| s.to_uppercase()),
            "str_lower" => self.map_str(args[0], |s| s.to_lowercase()),
            "str_trim" => self.map_str(args[0], |s| s.trim().to_owned()),
            "str_contains" => {
                let hay = self.as_str(args[0])?;
                let needle = self.as_str(args[1])?;
                Ok(Value::Bool(hay.contains(&needle)))
            }
            "str_replace" => {
                let s = self.as_str(args[0])?;
                let from = self.as_str(args[1])?;
                let to = self.as_str(args[2])?;
                let id = self.heap.alloc(HeapData::Str(s.replace(&from, &to).into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "str_slice" => {
                let s = self.as_str(args[0])?;
                let Value::Int(start) = args[1] else { return Err(RunError::Recoverable("str_slice expects int bounds".to_owned())) };
                let Value::Int(end) = args[2] else { return Err(RunError::Recoverable("str_slice expects int bounds".to_owned())) };
                let slice = s.get(start.max(0) as usize..end.max(0) as usize).unwrap_or("").to_owned();
                let id = self.heap.alloc(HeapData::Str(slice.into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "str_split" => {
                let s = self.as_str(args[0])?;
                let sep = self.as_str(args[1])?;
                let parts: Vec<Value> = s
                    .split(sep.as_str())
                    .map(|p| Value::Heap(self.heap.alloc(HeapData::Str(p.to_owned().into_boxed_str()))))
                    .collect();
                Ok(Value::Heap(self.heap.alloc(HeapData::Array(parts))))
            }
            "str_join" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("str_join expects an array".to_owned())) };
                let sep = self.as_str(args[1])?;
                let HeapData::Array(items) = self.heap.get(id).clone() else {
                    return Err(RunError::Recoverable("str_join expects an array".to_owned()));
                };
                let strs: Vec<String> = items.iter().map(|v| self.stringify(*v)).collect();
                let id = self.heap.alloc(HeapData::Str(strs.join(&sep).into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "array_push" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("array_push expects an array".to_owned())) };
                match self.heap.get_mut(id) {
                    HeapData::Array(items) => items.push(args[1]),
                    _ => return Err(RunError::Recoverable("array_push expects an array".to_owned())),
                }
                Ok(Value::Null)
            }
            "array_pop" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("array_pop expects an array".to_owned())) };
                match self.heap.get_mut(id) {
                    HeapData::Array(items) => items.pop().ok_or_else(|| RunError::Recoverable("pop from empty array".to_owned())),
                    _ => Err(RunError::Recoverable("array_pop expects an array".to_owned())),
                }
            }
            "array_reverse" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("array_reverse expects an array".to_owned())) };
                match self.heap.get_mut(id) {
                    HeapData::Array(items) => items.reverse(),
                    _ => return Err(RunError::Recoverable("array_reverse expects an array".to_owned())),
                }
                Ok(Value::Null)
            }
            "array_sort" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("array_sort expects an array".to_owned())) };
                match self.heap.get_mut(id) {
                    HeapData::Array(items) => items.sort_by(|a, b| compare_values(*a, *b)),
                    _ => return Err(RunError::Recoverable("array_sort expects an array".to_owned())),
                }
                Ok(Value::Null)
            }
            "array_contains" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("array_contains expects an array".to_owned())) };
                let HeapData::Array(items) = self.heap.get(id).clone() else {
                    return Err(RunError::Recoverable("array_contains expects an array".to_owned()));
                };
                Ok(Value::Bool(items.iter().any(|v| values_equal(self, *v, args[1]))))
            }
            "array_slice" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("array_slice expects an array".to_owned())) };
                let Value::Int(start) = args[1] else { return Err(RunError::Recoverable("array_slice expects int bounds".to_owned())) };
                let Value::Int(end) = args[2] else { return Err(RunError::Recoverable("array_slice expects int bounds".to_owned())) };
                let HeapData::Array(items) = self.heap.get(id).clone() else {
                    return Err(RunError::Recoverable("array_slice expects an array".to_owned()));
                };
                let slice = items.get(start.max(0) as usize..end.max(0) as usize).unwrap_or(&[]).to_vec();
                Ok(Value::Heap(self.heap.alloc(HeapData::Array(slice))))
            }
            "map_has_key" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("map_has_key expects a map".to_owned())) };
                let HeapData::Map(pairs) = self.heap.get(id).clone() else {
                    return Err(RunError::Recoverable("map_has_key expects a map".to_owned()));
                };
                Ok(Value::Bool(pairs.iter().any(|(k, _)| values_equal(self, *k, args[1]))))
            }
            "map_remove" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("map_remove expects a map".to_owned())) };
                match self.heap.get_mut(id) {
                    HeapData::Map(pairs) => pairs.retain(|(k, _)| *k != args[1]),
                    _ => return Err(RunError::Recoverable("map_remove expects a map".to_owned())),
                }
                Ok(Value::Null)
            }
            "map_keys" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("map_keys expects a map".to_owned())) };
                let HeapData::Map(pairs) = self.heap.get(id).clone() else {
                    return Err(RunError::Recoverable("map_keys expects a map".to_owned()));
                };
                Ok(Value::Heap(self.heap.alloc(HeapData::Array(pairs.iter().map(|(k, _)| *k).collect()))))
            }
            "map_values" => {
                let Value::Heap(id) = args[0] else { return Err(RunError::Recoverable("map_values expects a map".to_owned())) };
                let HeapData::Map(pairs) = self.heap.get(id).clone() else {
                    return Err(RunError::Recoverable("map_values expects a map".to_owned()));
                };
                Ok(Value::Heap(self.heap.alloc(HeapData::Array(pairs.iter().map(|(_, v)| *v).collect()))))
            }
            "abs" => Ok(match args[0] {
                Value::Int(i) => Value::Int(i.abs()),
                Value::Float(f) => Value::Float(f.abs()),
                _ => return Err(RunError::Recoverable("abs() expects a number".to_owned())),
            }),
            "min" => Ok(if compare_values(args[0], args[1]).is_le() { args[0] } else { args[1] }),
            "max" => Ok(if compare_values(args[0], args[1]).is_ge() { args[0] } else { args[1] }),
            "pow" => Ok(Value::Float(as_f64(args[0])?.powf(as_f64(args[1])?))),
            "sqrt" => Ok(Value::Float(as_f64(args[0])?.sqrt())),
            "floor" => Ok(Value::Int(as_f64(args[0])?.floor() as i64)),
            "ceil" => Ok(Value::Int(as_f64(args[0])?.ceil() as i64)),
            "round" => Ok(Value::Int(as_f64(args[0])?.round() as i64)),
            "sha256_hex" => {
                use sha2::{Digest, Sha256};
                let s = self.as_str(args[0])?;
                let digest = Sha256::digest(s.as_bytes());
                let id = self.heap.alloc(HeapData::Str(hex::encode(digest).into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "md5_hex" => {
                use md5::{Digest, Md5};
                let s = self.as_str(args[0])?;
                let digest = Md5::digest(s.as_bytes());
                let id = self.heap.alloc(HeapData::Str(hex::encode(digest).into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "base64_encode" => {
                use base64::Engine;
                let s = self.as_str(args[0])?;
                let id = self.heap.alloc(HeapData::Str(base64::engine::general_purpose::STANDARD.encode(s.as_bytes()).into_boxed_str()));
                Ok(Value::Heap(id))
            }
            "base64_decode" => {
                use base64::Engine;
                let s = self.as_str(args[0])?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(|e| RunError::Recoverable(format!("invalid base64: {e}")))?;
                let decoded = String::from_utf8(bytes).map_err(|e| RunError::Recoverable(format!("invalid utf-8: {e}")))?;
                Ok(Value::Heap(self.heap.alloc(HeapData::Str(decoded.into_boxed_str()))))
            }
            "hex_encode" => {
                let s = self.as_str(args[0])?;
                Ok(Value::Heap(self.heap.alloc(HeapData::Str(hex::encode(s.as_bytes()).into_boxed_str()))))
            }
            "hex_decode" => {
                let s = self.as_str(args[0])?;
                let bytes = hex::decode(&s).map_err(|e| RunError::Recoverable(format!("invalid hex: {e}")))?;
                let decoded = String::from_utf8(bytes).map_err(|e| RunError::Recoverable(format!("invalid utf-8: {e}")))?;
                Ok(Value::Heap(self.heap.alloc(HeapData::Str(decoded.into_boxed_str()))))
            }
            "secure_compare" => {
                use subtle::ConstantTimeEq;
                let a = self.as_str(args[0])?;
                let b = self.as_str(args[1])?;
                Ok(Value::Bool(a.as_bytes().ct_eq(b.as_bytes()).into()))
            }
            "regex_match" => {
                let pattern = self.as_str(args[0])?;
                let s = self.as_str(args[1])?;
                let re = regex::Regex::new(&pattern).map_err(|e| RunError::Recoverable(format!("invalid regex: {e}")))?;
                Ok(Value::Bool(re.is_match(&s)))
            }
            "regex_find_all" => {
                let pattern = self.as_str(args[0])?;
                let s = self.as_str(args[1])?;
                let re = regex::Regex::new(&pattern).map_err(|e| RunError::Recoverable(format!("invalid regex: {e}")))?;
                let matches: Vec<Value> = re
                    .find_iter(&s)
                    .map(|m| Value::Heap(self.heap.alloc(HeapData::Str(m.as_str().to_owned().into_boxed_str()))))
                    .collect();
                Ok(Value::Heap(self.heap.alloc(HeapData::Array(matches))))
            }
            "regex_replace" => {
                let pattern = self.as_str(args[0])?;
                let s = self.as_str(args[1])?;
                let replacement = self.as_str(args[2])?;
                let re = regex::Regex::new(&pattern).map_err(|e| RunError::Recoverable(format!("invalid regex: {e}")))?;
                let result = re.replace_all(&s, replacement.as_str()).into_owned();
                Ok(Value::Heap(self.heap.alloc(HeapData::Str(result.into_boxed_str()))))
            }
            "type_name" => Ok(Value::Heap(self.heap.alloc(HeapData::Str(args[0].type_name().into())))),
            "assert" => {
                if !args[0].truthy() {
                    let msg = args.get(1).map_or_else(|| "assertion failed".to_owned(), |v| self.stringify(*v));
                    return Err(RunError::Recoverable(msg));
                }
                Ok(Value::Null)
            }
            "exit" => {
                let Value::Int(code) = args[0] else { return Err(RunError::Recoverable("exit() expects an int code".to_owned())) };
                Err(RunError::Exit(code))
            }
            "rand_seed" => {
                let Value::Int(seed) = args[0] else { return Err(RunError::Recoverable("rand_seed() expects an int".to_owned())) };
                self.rng = ChaCha8Rng::seed_from_u64(seed as u64);
                Ok(Value::Null)
            }
            "rand_int" => {
                let Value::Int(lo) = args[0] else { return Err(RunError::Recoverable("rand_int() expects int bounds".to_owned())) };
                let Value::Int(hi) = args[1] else { return Err(RunError::Recoverable("rand_int() expects int bounds".to_owned())) };
                if hi < lo {
                    return Err(RunError::Recoverable("rand_int() requires low <= high".to_owned()));
                }
                Ok(Value::Int(self.rng.gen_range(lo..=hi)))
            }
            "rand_float" => Ok(Value::Float(self.rng.gen_range(0.0..1.0))),
            "random_bytes" => {
                let Value::Int(n) = args[0] else { return Err(RunError::Recoverable("random_bytes() expects an int length".to_owned())) };
                if n < 0 {
                    return Err(RunError::Recoverable("random_bytes() length must be non-negative".to_owned()));
                }
                let mut buf = vec![0u8; n as usize];
                self.rng.fill_bytes(&mut buf);
                Ok(Value::Heap(self.heap.alloc(HeapData::Str(hex::encode(buf).into_boxed_str()))))
            }
            "clock_ms" => Ok(Value::Int(i64::try_from(std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map_or(0, |d| d.as_millis())).unwrap_or(i64::MAX))),
            "sleep_ms" => {
                let Value::Int(ms) = args[0] else { return Err(RunError::Recoverable("sleep_ms() expects an int".to_owned())) };
                std::thread::sleep(std::time::Duration::from_millis(ms.max(0) as u64));
                Ok(Value::Null)
            }
            "getenv" => {
                let name = self.as_str(args[0])?;
                match std::env::var(&name) {
                    Ok(v) => Ok(Value::Heap(self.heap.alloc(HeapData::Str(v.into_boxed_str())))),
                    Err(_) => Ok(Value::Null),
                }
            }
            "argc" => Ok(Value::Int(self.argv.len() as i64)),
            "argv" => {
                let Value::Int(i) = args[0] else { return Err(RunError::Recoverable("argv() expects an int index".to_owned())) };
                let s = self.argv.get(i.max(0) as usize).cloned().ok_or_else(|| RunError::Recoverable("argv() index out of range".to_owned()))?;
                Ok(Value::Heap(self.heap.alloc(HeapData::Str(s.into_boxed_str()))))
            }
            "read_line" => {
                let mut line = String::new();
                match std::io::stdin().read_line(&mut line) {
                    Ok(0) => Ok(Value::Null),
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\n', '\r']).to_owned();
                        Ok(Value::Heap(self.heap.alloc(HeapData::Str(trimmed.into_boxed_str()))))
                    }
                    Err(e) => Err(RunError::Recoverable(format!("read_line() failed: {e}"))),
                }
            }
            "file_read" => {
                let path = self.as_str(args[0])?;
                match std::fs::read_to_string(&path) {
                    Ok(contents) => Ok(Value::Heap(self.heap.alloc(HeapData::Str(contents.into_boxed_str())))),
                    Err(e) => Err(RunError::Recoverable(format!("file_read() failed: {e}"))),
                }
            }
            "file_write" => {
                let path = self.as_str(args[0])?;
                let contents = self.as_str(args[1])?;
                std::fs::write(&path, contents).map_err(|e| RunError::Recoverable(format!("file_write() failed: {e}")))?;
                Ok(Value::Null)
            }
            "file_append" => {
                use std::io::Write;
                let path = self.as_str(args[0])?;
                let contents = self.as_str(args[1])?;
                (|| -> std::io::Result<()> {
                    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
                    f.write_all(contents.as_bytes())
                })()
                .map_err(|e| RunError::Recoverable(format!("file_append() failed: {e}")))?;
                Ok(Value::Null)
            }
            "file_exists" => {
                let path = self.as_str(args[0])?;
                Ok(Value::Bool(std::path::Path::new(&path).exists()))
            }
            "file_delete" => {
                let path = self.as_str(args[0])?;
                std::fs::remove_file(&path).map_err(|e| RunError::Recoverable(format!("file_delete() failed: {e}")))?;
                Ok(Value::Null)
            }
            "file_size" => {
                let path = self.as_str(args[0])?;
                let meta = std::fs::metadata(&path).map_err(|e| RunError::Recoverable(format!("file_size() failed: {e}")))?;
                Ok(Value::Int(meta.len() as i64))
            }
            "file_copy" => {
                let from = self.as_str(args[0])?;
                let to = self.as_str(args[1])?;
                std::fs::copy(&from, &to).map_err(|e| RunError::Recoverable(format!("file_copy() failed: {e}")))?;
                Ok(Value::Null)
            }
            "str_find" => {
                let hay = self.as_str(args[0])?;
                let needle = self.as_str(args[1])?;
                Ok(Value::Int(hay.find(&needle).map_or(-1, |i| i as i64)))
            }
            "str_count" => {
                let hay = self.as_str(args[0])?;
                let needle = self.as_str(args[1])?;
                let n = if needle.is_empty() { 0 } else { hay.matches(needle.as_str()).count() };
                Ok(Value::Int(n as i64))
            }
            other => Err(RunError::Fatal(format!("unimplemented builtin '{other}'"))),
        }
    }

    fn as_str(&self, v: Value) -> RunResult<String> {
        match v {
            Value::Heap(id) => match self.heap.get(id) {
                HeapData::Str(s) => Ok(s.to_string()),
                _ => Err(RunError::Recoverable("expected a string value".to_owned())),
            },
            _ => Err(RunError::Recoverable("expected a string value".to_owned())),
        }
    }

    fn map_str(&mut self, v: Value, f: impl FnOnce(&str) -> String) -> RunResult<Value> {
        let s = self.as_str(v)?;
        let id = self.heap.alloc(HeapData::Str(f(&s).into_boxed_str()));
        Ok(Value::Heap(id))
    }
}

fn as_f64(v: Value) -> RunResult<f64> {
    match v {
        Value::Int(i) => Ok(i as f64),
        Value::Float(f) => Ok(f),
        _ => Err(RunError::Recoverable("expected a numeric value".to_owned())),
    }
}

fn compare_values(a: Value, b: Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(&y),
        _ => as_f64(a).unwrap_or(0.0).partial_cmp(&as_f64(b).unwrap_or(0.0)).unwrap_or(std::cmp::Ordering::Equal),
    }
}

fn values_equal(vm: &Vm, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Heap(ha), Value::Heap(hb)) => match (vm.heap.get(ha), vm.heap.get(hb)) {
            (HeapData::Str(sa), HeapData::Str(sb)) => sa == sb,
            _ => ha == hb,
        },
        _ => a == b,
    }
}

fn decode_opcode(byte: u8) -> Option<Opcode> {
    // `Opcode` is `#[repr(u8)]` with no gaps between 0 and `Throw`; a direct
    // transmute would work but going through the match keeps this resilient
    // to future renumbering.
    use Opcode::*;
    const ALL: &[Opcode] = &[
        LoadConstInt, LoadConstFloat, LoadConstStr, LoadTrue, LoadFalse, LoadNull, LoadLocal, StoreLocal, LoadGlobal, StoreGlobal, Pop, Dup, Add, Sub, Mul, Div, Mod, Eq, NotEq, Lt, Gt, Le, Ge,
        BitAnd, BitOr, BitXor, Shl, Shr, Neg, Not, BitNot, Jump, JumpIfFalse, JumpIfTrue, Call, CallBuiltin, CallMethod, SuperCall, SuperMethodCall, NewArray, NewMap, NewRecord, NewInstance, Index,
        IndexSet, GetField, SetField, MakeClosure, Return, ReturnVoid, TryBegin, TryEnd, Throw,
    ];
    ALL.get(byte as usize).copied()
}
