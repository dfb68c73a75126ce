//! AST-to-bytecode compiler. See spec.md §4.4.
//!
//! Each function (free function, method, or lambda) compiles to one
//! [`Code`] via a fresh [`CodeBuilder`]. Local variable names are assigned
//! stack slots as they come into scope; the slot map is a flat
//! `Vec<(StringId, u16)>` truncated on scope exit, mirroring the type
//! checker's own scope discipline in `typecheck.rs`. Global variables get a
//! module-wide slot index instead and are initialized by a synthesized
//! `$init` function the VM runs once before the program's entry point.

use crate::ast::*;
use crate::bytecode::{Code, CodeBuilder, Opcode};
use crate::intern::{Interner, StringId};
use crate::typecheck::{ClassInfo, EnumInfo, StructInfo};

use std::collections::HashMap;

/// Stand-in callee index for a `Call` whose real target is assigned only
/// once every linked module's function table has been merged; recorded
/// alongside the byte offset to patch in `FnCompiler::call_patches`.
const UNLINKED_CALLEE: u16 = 0;

/// What a recorded `Call` patch site still needs once every module in a
/// program has been compiled and laid out in one merged function table
/// (spec.md §4.7). A module compiled on its own always numbers its own
/// functions from zero, so even calls to functions *in the same module*
/// need their callee operand shifted once that module lands at a nonzero
/// offset in the merged table — not just calls that cross a module
/// boundary.
#[derive(Debug, Clone, Copy)]
pub enum CallTarget {
    /// Call to a function inside the same module, by its local (pre-merge)
    /// function-table index; becomes `module_offset + index` once merged.
    Local(u32),
    /// Call to another module's exported function, keyed by its qualified
    /// `module$function` name; resolved to a global index by `link::link_program`.
    CrossModule(StringId),
}

pub struct CompiledFunction {
    pub name: StringId,
    pub code: Code,
    /// Byte offsets into `code.bytecode` where a `Call` instruction's callee
    /// operand still needs a final, merge-time index patched in (spec.md
    /// §4.7). Empty only for bytecode that calls no named function at all
    /// (e.g. a module with no free functions).
    pub call_patches: Vec<(u32, CallTarget)>,
    /// Byte offsets into `code.bytecode` where a `LoadGlobal`/`StoreGlobal`
    /// operand holds a slot index relative to this module's own globals and
    /// needs this module's global-table offset added once every linked
    /// module's globals are concatenated into one table (spec.md §4.7).
    /// A single-module compile never shifts these (offset zero).
    pub global_patches: Vec<u32>,
}

pub struct CompiledStruct {
    pub name: StringId,
    pub field_names: Vec<StringId>,
}

pub struct CompiledClass {
    pub name: StringId,
    pub parent_index: Option<u32>,
    pub field_names: Vec<StringId>,
    /// method name -> function-table index
    pub methods: HashMap<StringId, u32>,
}

/// A fully compiled single module, ready either for direct VM execution or
/// for serialization via `bytefmt` (spec.md §4.5).
pub struct CompiledModule {
    pub functions: Vec<CompiledFunction>,
    pub structs: Vec<CompiledStruct>,
    pub classes: Vec<CompiledClass>,
    pub num_globals: u16,
    pub init_function: u32,
    pub entry_function: Option<u32>,
}

struct FnCompiler<'a> {
    interner: &'a mut Interner,
    builder: CodeBuilder,
    locals: Vec<(StringId, u16)>,
    globals: &'a HashMap<StringId, u16>,
    functions: &'a HashMap<StringId, u32>,
    enums: &'a HashMap<StringId, EnumInfo>,
    loop_stack: Vec<LoopCtx>,
    call_patches: Vec<(u32, CallTarget)>,
    global_patches: Vec<u32>,
}

struct LoopCtx {
    break_jumps: Vec<crate::bytecode::builder::JumpLabel>,
    continue_target: u32,
}

impl<'a> FnCompiler<'a> {
    fn new(
        interner: &'a mut Interner,
        num_params: u16,
        globals: &'a HashMap<StringId, u16>,
        functions: &'a HashMap<StringId, u32>,
        enums: &'a HashMap<StringId, EnumInfo>,
    ) -> Self {
        FnCompiler {
            interner,
            builder: CodeBuilder::new(num_params),
            locals: Vec::new(),
            globals,
            functions,
            enums,
            loop_stack: Vec::new(),
            call_patches: Vec::new(),
            global_patches: Vec::new(),
        }
    }

    fn declare_param(&mut self, name: StringId, slot: u16) {
        self.locals.push((name, slot));
    }

    fn declare_local(&mut self, name: StringId) -> u16 {
        let slot = self.builder.alloc_local();
        self.locals.push((name, slot));
        slot
    }

    fn resolve_local(&self, name: StringId) -> Option<u16> {
        self.locals.iter().rev().find(|(n, _)| *n == name).map(|(_, s)| *s)
    }

    fn compile_function_body(&mut self, params: &[(StringId, Type)], body: &[Stmt]) {
        for (i, (name, _)) in params.iter().enumerate() {
            self.declare_param(*name, i as u16);
        }
        for stmt in body {
            self.compile_stmt(stmt);
        }
        // Ensure every path has a terminator; bodies that fall off the end
        // implicitly return void (spec.md §4.3 return-type checking already
        // rejects this for non-void functions).
        self.builder.emit(Opcode::ReturnVoid);
    }

    fn compile_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { name, init, .. } => {
                self.compile_expr(init);
                let slot = self.declare_local(*name);
                self.builder.emit_u16(Opcode::StoreLocal, slot);
            }
            StmtKind::Assign { name, value } => {
                self.compile_expr(value);
                self.store_name(*name);
            }
            StmtKind::IndexAssign { container, index, value } => {
                self.compile_expr(container);
                self.compile_expr(index);
                self.compile_expr(value);
                self.builder.emit(Opcode::IndexSet);
            }
            StmtKind::FieldAssign { object, field_index, value, .. } => {
                self.compile_expr(object);
                self.compile_expr(value);
                self.builder.emit_u16(Opcode::SetField, field_index.unwrap_or(0) as u16);
            }
            StmtKind::ExprStmt(e) => {
                self.compile_expr(e);
                self.builder.emit(Opcode::Pop);
            }
            StmtKind::If { cond, then_block, else_block } => {
                self.compile_expr(cond);
                let else_jump = self.builder.emit_jump(Opcode::JumpIfFalse);
                for s in then_block {
                    self.compile_stmt(s);
                }
                let end_jump = self.builder.emit_jump(Opcode::Jump);
                self.builder.patch_jump(else_jump);
                for s in else_block {
                    self.compile_stmt(s);
                }
                self.builder.patch_jump(end_jump);
            }
            StmtKind::While { cond, body } => {
                let loop_start = self.builder.current_offset();
                self.compile_expr(cond);
                let exit_jump = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.loop_stack.push(LoopCtx { break_jumps: Vec::new(), continue_target: loop_start });
                for s in body {
                    self.compile_stmt(s);
                }
                self.builder.emit_jump_to(Opcode::Jump, loop_start);
                self.builder.patch_jump(exit_jump);
                let ctx = self.loop_stack.pop().unwrap();
                for j in ctx.break_jumps {
                    self.builder.patch_jump(j);
                }
            }
            StmtKind::ForRange { var, start, end, body } => {
                // Desugars to a counted while loop (spec.md does not define
                // a dedicated iterator opcode for integer ranges).
                self.compile_expr(start);
                let var_slot = self.declare_local(*var);
                self.builder.emit_u16(Opcode::StoreLocal, var_slot);
                self.compile_expr(end);
                let end_slot = self.declare_local(self.synthetic_name("$for_end"));
                self.builder.emit_u16(Opcode::StoreLocal, end_slot);

                let loop_start = self.builder.current_offset();
                self.builder.emit_u16(Opcode::LoadLocal, var_slot);
                self.builder.emit_u16(Opcode::LoadLocal, end_slot);
                self.builder.emit(Opcode::Lt);
                let exit_jump = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.loop_stack.push(LoopCtx { break_jumps: Vec::new(), continue_target: 0 });
                for s in body {
                    self.compile_stmt(s);
                }
                let continue_at = self.builder.current_offset();
                self.builder.emit_u16(Opcode::LoadLocal, var_slot);
                self.builder.emit_const_int(1);
                self.builder.emit(Opcode::Add);
                self.builder.emit_u16(Opcode::StoreLocal, var_slot);
                self.builder.emit_jump_to(Opcode::Jump, loop_start);
                self.builder.patch_jump(exit_jump);
                let ctx = self.loop_stack.pop().unwrap();
                for j in ctx.break_jumps {
                    self.builder.patch_jump(j);
                }
                let _ = continue_at;
            }
            StmtKind::ForIn { var, iterable, body } => {
                // Desugars to `for i in range(0, len(iterable)): var = iterable[i]`.
                self.compile_expr(iterable);
                let arr_slot = self.declare_local(self.synthetic_name("$for_arr"));
                self.builder.emit_u16(Opcode::StoreLocal, arr_slot);
                self.builder.emit_u16(Opcode::LoadLocal, arr_slot);
                self.builder.emit_call(Opcode::CallBuiltin, 1, 1, true); // len
                let idx_slot = self.declare_local(self.synthetic_name("$for_idx"));
                self.builder.emit_const_int(0);
                self.builder.emit_u16(Opcode::StoreLocal, idx_slot);
                let len_slot = self.declare_local(self.synthetic_name("$for_len"));
                self.builder.emit_u16(Opcode::StoreLocal, len_slot);

                let loop_start = self.builder.current_offset();
                self.builder.emit_u16(Opcode::LoadLocal, idx_slot);
                self.builder.emit_u16(Opcode::LoadLocal, len_slot);
                self.builder.emit(Opcode::Lt);
                let exit_jump = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.builder.emit_u16(Opcode::LoadLocal, arr_slot);
                self.builder.emit_u16(Opcode::LoadLocal, idx_slot);
                self.builder.emit(Opcode::Index);
                let var_slot = self.declare_local(*var);
                self.builder.emit_u16(Opcode::StoreLocal, var_slot);
                self.loop_stack.push(LoopCtx { break_jumps: Vec::new(), continue_target: 0 });
                for s in body {
                    self.compile_stmt(s);
                }
                self.builder.emit_u16(Opcode::LoadLocal, idx_slot);
                self.builder.emit_const_int(1);
                self.builder.emit(Opcode::Add);
                self.builder.emit_u16(Opcode::StoreLocal, idx_slot);
                self.builder.emit_jump_to(Opcode::Jump, loop_start);
                self.builder.patch_jump(exit_jump);
                let ctx = self.loop_stack.pop().unwrap();
                for j in ctx.break_jumps {
                    self.builder.patch_jump(j);
                }
            }
            StmtKind::Return(expr) => {
                match expr {
                    Some(e) => {
                        self.compile_expr(e);
                        self.builder.emit(Opcode::Return);
                    }
                    None => self.builder.emit(Opcode::ReturnVoid),
                }
            }
            StmtKind::Break => {
                let j = self.builder.emit_jump(Opcode::Jump);
                if let Some(ctx) = self.loop_stack.last_mut() {
                    ctx.break_jumps.push(j);
                }
            }
            StmtKind::Continue => {
                if let Some(ctx) = self.loop_stack.last() {
                    let target = ctx.continue_target;
                    self.builder.emit_jump_to(Opcode::Jump, target);
                }
            }
            StmtKind::Try { try_block, catch_var, catch_block, finally_block } => {
                let handler_jump = self.builder.emit_jump(Opcode::TryBegin);
                for s in try_block {
                    self.compile_stmt(s);
                }
                self.builder.emit(Opcode::TryEnd);
                let skip_catch = self.builder.emit_jump(Opcode::Jump);
                self.builder.patch_jump(handler_jump);
                if let Some(v) = catch_var {
                    let slot = self.declare_local(*v);
                    self.builder.emit_u16(Opcode::StoreLocal, slot);
                } else {
                    self.builder.emit(Opcode::Pop);
                }
                for s in catch_block {
                    self.compile_stmt(s);
                }
                self.builder.patch_jump(skip_catch);
                for s in finally_block {
                    self.compile_stmt(s);
                }
            }
            StmtKind::Throw(e) => {
                self.compile_expr(e);
                self.builder.emit(Opcode::Throw);
            }
            StmtKind::Match { scrutinee, cases, default } => {
                // Desugars to a chain of equality-tested ifs (spec.md does
                // not define a dedicated jump-table opcode).
                self.compile_expr(scrutinee);
                let scrutinee_slot = self.declare_local(self.synthetic_name("$match_val"));
                self.builder.emit_u16(Opcode::StoreLocal, scrutinee_slot);
                let mut end_jumps = Vec::new();
                for case in cases {
                    self.builder.emit_u16(Opcode::LoadLocal, scrutinee_slot);
                    self.compile_expr(&case.pattern);
                    self.builder.emit(Opcode::Eq);
                    let next_case = self.builder.emit_jump(Opcode::JumpIfFalse);
                    for s in &case.body {
                        self.compile_stmt(s);
                    }
                    end_jumps.push(self.builder.emit_jump(Opcode::Jump));
                    self.builder.patch_jump(next_case);
                }
                if let Some(d) = default {
                    for s in d {
                        self.compile_stmt(s);
                    }
                }
                for j in end_jumps {
                    self.builder.patch_jump(j);
                }
            }
        }
    }

    fn store_name(&mut self, name: StringId) {
        if let Some(slot) = self.resolve_local(name) {
            self.builder.emit_u16(Opcode::StoreLocal, slot);
        } else if let Some(&slot) = self.globals.get(&name) {
            let operand_offset = self.builder.current_offset() + 1;
            self.builder.emit_u16(Opcode::StoreGlobal, slot);
            self.global_patches.push(operand_offset);
        } else {
            // Unresolved at this point means a genuine compiler bug, not a
            // user error: the type checker rejects unknown assignment
            // targets before `compiler.rs` ever sees this AST.
            self.builder.emit_u16(Opcode::StoreGlobal, 0);
        }
    }

    fn compile_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Int(v) => self.builder.emit_const_int(*v),
            ExprKind::Float(v) => self.builder.emit_const_float(*v),
            ExprKind::Bool(b) => self.builder.emit(if *b { Opcode::LoadTrue } else { Opcode::LoadFalse }),
            ExprKind::Str(s) => {
                let id = self.interner.intern(s);
                self.builder.emit_const_str(id.0);
            }
            ExprKind::Null => self.builder.emit(Opcode::LoadNull),
            ExprKind::Var(name) => {
                if let Some(slot) = self.resolve_local(*name) {
                    self.builder.emit_u16(Opcode::LoadLocal, slot);
                } else if let Some(&slot) = self.globals.get(name) {
                    let operand_offset = self.builder.current_offset() + 1;
                    self.builder.emit_u16(Opcode::LoadGlobal, slot);
                    self.global_patches.push(operand_offset);
                } else {
                    self.builder.emit(Opcode::LoadNull);
                }
            }
            ExprKind::FString(parts) => {
                // Concatenate literal/expr pieces left-to-right via repeated
                // `str_concat` builtin calls (builtin id 2, spec.md §6),
                // stringifying each hole with the builtin matching its
                // type-checked type.
                let mut first = true;
                let mut push_piece = |fc: &mut Self, emit_piece: &dyn Fn(&mut Self)| {
                    emit_piece(fc);
                    if !first {
                        fc.builder.emit_call(Opcode::CallBuiltin, 2, 2, true);
                    }
                    first = false;
                };
                for part in parts {
                    if !part.literal.is_empty() {
                        let s = part.literal.clone();
                        push_piece(self, &move |fc| {
                            let id = fc.interner.intern(&s);
                            fc.builder.emit_const_str(id.0);
                        });
                    }
                    if let Some(e) = &part.expr {
                        let stringify_builtin = match e.ty {
                            Type::Str => None,
                            Type::Float => Some(14u16),
                            _ => Some(13u16),
                        };
                        push_piece(self, &move |fc| {
                            fc.compile_expr(e);
                            if let Some(id) = stringify_builtin {
                                fc.builder.emit_call(Opcode::CallBuiltin, id, 1, true);
                            }
                        });
                    }
                }
                if first {
                    let id = self.interner.intern("");
                    self.builder.emit_const_str(id.0);
                }
            }
            ExprKind::ArrayLit(items) => {
                for item in items {
                    self.compile_expr(item);
                }
                self.builder.emit_u16_u16(Opcode::NewArray, items.len() as u16, 0, 1 - items.len() as i32);
            }
            ExprKind::MapLit(pairs) => {
                for (k, v) in pairs {
                    self.compile_expr(k);
                    self.compile_expr(v);
                }
                self.builder.emit_u16_u16(Opcode::NewMap, pairs.len() as u16, 0, 1 - 2 * pairs.len() as i32);
            }
            ExprKind::Index { container, index } => {
                self.compile_expr(container);
                self.compile_expr(index);
                self.builder.emit(Opcode::Index);
            }
            ExprKind::RecordLit { type_name, fields } => {
                for (_, value) in fields {
                    self.compile_expr(value);
                }
                let _ = type_name;
                self.builder.emit_u16_u16(Opcode::NewRecord, 0, fields.len() as u16, 1 - fields.len() as i32);
            }
            ExprKind::Field { object, field_index, .. } => {
                self.compile_expr(object);
                self.builder.emit_u16(Opcode::GetField, field_index.unwrap_or(0) as u16);
            }
            ExprKind::MethodCall { object, args, .. } => {
                self.compile_expr(object);
                for a in args {
                    self.compile_expr(a);
                }
                self.builder.emit_call(Opcode::CallMethod, 0, args.len() as u8, true);
            }
            ExprKind::Unary { op, expr: inner } => {
                self.compile_expr(inner);
                self.builder.emit(match op {
                    UnOp::Neg => Opcode::Neg,
                    UnOp::Not => Opcode::Not,
                    UnOp::BitNot => Opcode::BitNot,
                });
            }
            ExprKind::Binary { op: BinOp::And, lhs, rhs } => {
                // Short-circuit: if `lhs` is false, leave it on the stack as
                // the result without ever evaluating `rhs` (spec.md §4.3).
                self.compile_expr(lhs);
                self.builder.emit(Opcode::Dup);
                let short_circuit = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.builder.emit(Opcode::Pop);
                self.compile_expr(rhs);
                self.builder.patch_jump(short_circuit);
            }
            ExprKind::Binary { op: BinOp::Or, lhs, rhs } => {
                // Short-circuit: if `lhs` is true, leave it on the stack as
                // the result without ever evaluating `rhs`.
                self.compile_expr(lhs);
                self.builder.emit(Opcode::Dup);
                let short_circuit = self.builder.emit_jump(Opcode::JumpIfTrue);
                self.builder.emit(Opcode::Pop);
                self.compile_expr(rhs);
                self.builder.patch_jump(short_circuit);
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.compile_expr(lhs);
                self.compile_expr(rhs);
                self.builder.emit(binop_opcode(*op));
            }
            ExprKind::Tuple(items) => {
                for item in items {
                    self.compile_expr(item);
                }
                self.builder.emit_u16_u16(Opcode::NewArray, items.len() as u16, 0, 1 - items.len() as i32);
            }
            ExprKind::Lambda { synth_name, .. } => {
                let idx = synth_name.and_then(|n| self.functions.get(&n)).copied().unwrap_or(0);
                self.builder.emit_u16(Opcode::MakeClosure, idx as u16);
            }
            ExprKind::New { class_name, args } => {
                for a in args {
                    self.compile_expr(a);
                }
                let _ = class_name;
                self.builder.emit_call(Opcode::NewInstance, 0, args.len() as u8, true);
            }
            ExprKind::SuperCall { args } => {
                for a in args {
                    self.compile_expr(a);
                }
                self.builder.emit_call(Opcode::SuperCall, 0, args.len() as u8, false);
            }
            ExprKind::SuperMethodCall { args, .. } => {
                for a in args {
                    self.compile_expr(a);
                }
                self.builder.emit_call(Opcode::SuperMethodCall, 0, args.len() as u8, true);
            }
            ExprKind::EnumMember { enum_name, variant } => {
                let discriminant = self.enums.get(enum_name).and_then(|info| info.variants.get(variant)).copied().unwrap_or(0);
                self.builder.emit_const_int(discriminant);
            }
            ExprKind::Call { name, args, fn_ref } => {
                for a in args {
                    self.compile_expr(a);
                }
                match fn_ref {
                    FnRef::Builtin(id) => self.builder.emit_call(Opcode::CallBuiltin, *id as u16, args.len() as u8, true),
                    // Already a valid same-module callee index for a
                    // standalone-module run; still recorded so a multi-module
                    // link can shift it once this module lands at a nonzero
                    // offset in the merged function table (spec.md §4.7).
                    FnRef::Index(idx) => {
                        let call_site = self.builder.current_offset();
                        self.builder.emit_call(Opcode::Call, *idx as u16, args.len() as u8, true);
                        self.call_patches.push((call_site + 1, CallTarget::Local(*idx)));
                    }
                    // Resolved to a concrete callee index only once every
                    // linked module's function table has been merged
                    // (spec.md §4.7); `link::link_program` patches the
                    // recorded offset in place once that index is known.
                    FnRef::CrossModule | FnRef::Unresolved => {
                        let call_site = self.builder.current_offset();
                        self.builder.emit_call(Opcode::Call, UNLINKED_CALLEE, args.len() as u8, true);
                        self.call_patches.push((call_site + 1, CallTarget::CrossModule(*name)));
                    }
                }
            }
        }
    }

    fn synthetic_name(&mut self, base: &str) -> StringId {
        self.interner.intern(base)
    }
}

fn binop_opcode(op: BinOp) -> Opcode {
    use BinOp::*;
    match op {
        Add => Opcode::Add,
        Sub => Opcode::Sub,
        Mul => Opcode::Mul,
        Div => Opcode::Div,
        Mod => Opcode::Mod,
        Eq => Opcode::Eq,
        NotEq => Opcode::NotEq,
        Lt => Opcode::Lt,
        Gt => Opcode::Gt,
        Le => Opcode::Le,
        Ge => Opcode::Ge,
        And => Opcode::BitAnd,
        Or => Opcode::BitOr,
        BitAnd => Opcode::BitAnd,
        BitOr => Opcode::BitOr,
        BitXor => Opcode::BitXor,
        Shl => Opcode::Shl,
        Shr => Opcode::Shr,
    }
}

/// Compiles a single type-checked module into bytecode. `struct_info` /
/// `class_info` / `enum_info` come from the same `TypeContext` tables
/// `typecheck::check_module` built, so field layout stays consistent between
/// the two passes.
pub fn compile_module(
    module: &Module,
    interner: &mut Interner,
    structs: &HashMap<StringId, StructInfo>,
    classes: &HashMap<StringId, ClassInfo>,
    enums: &HashMap<StringId, EnumInfo>,
) -> CompiledModule {
    let mut function_index: HashMap<StringId, u32> = HashMap::new();
    for (i, f) in module.functions.iter().enumerate() {
        function_index.insert(f.name, i as u32);
    }
    // Lambda function-table slots are assigned after every free function and
    // every class method, matching the push order in the loops below
    // (functions, then methods, then lambdas).
    let method_count: usize = module.classes.iter().map(|c| c.methods.len()).sum();
    let mut next_index = (module.functions.len() + method_count) as u32;
    let mut lambda_index: HashMap<StringId, u32> = HashMap::new();
    collect_lambda_names(module, &mut lambda_index, &mut next_index);
    function_index.extend(lambda_index.iter().map(|(k, v)| (*k, *v)));

    let mut global_slots: HashMap<StringId, u16> = HashMap::new();
    for (i, g) in module.globals.iter().enumerate() {
        global_slots.insert(g.name, i as u16);
    }

    let mut functions = Vec::new();
    for f in &module.functions {
        let mut fc = FnCompiler::new(interner, f.params.len() as u16, &global_slots, &function_index, enums);
        fc.compile_function_body(&f.params, &f.body);
        functions.push(CompiledFunction { name: f.name, code: fc.builder.build(), call_patches: fc.call_patches, global_patches: fc.global_patches });
    }

    let mut methods_flat = Vec::new();
    for c in &module.classes {
        for m in &c.methods {
            let mut fc = FnCompiler::new(interner, m.params.len() as u16, &global_slots, &function_index, enums);
            fc.compile_function_body(&m.params, &m.body);
            let idx = functions.len() as u32;
            functions.push(CompiledFunction { name: m.name, code: fc.builder.build(), call_patches: fc.call_patches, global_patches: fc.global_patches });
            methods_flat.push((c.name, m.name, idx));
        }
    }

    compile_lambdas(module, interner, &global_slots, &function_index, enums, &mut functions);

    let mut init_builder = FnCompiler::new(interner, 0, &global_slots, &function_index, enums);
    for g in &module.globals {
        init_builder.compile_expr(&g.init);
        let slot = global_slots[&g.name];
        let operand_offset = init_builder.builder.current_offset() + 1;
        init_builder.builder.emit_u16(Opcode::StoreGlobal, slot);
        init_builder.global_patches.push(operand_offset);
    }
    init_builder.builder.emit(Opcode::ReturnVoid);
    let init_index = functions.len() as u32;
    let init_name = interner.intern("$init");
    functions.push(CompiledFunction { name: init_name, code: init_builder.builder.build(), call_patches: init_builder.call_patches, global_patches: init_builder.global_patches });

    let entry_name = interner.intern("main");
    let entry_function = module.functions.iter().position(|f| f.name == entry_name).map(|i| i as u32);

    let compiled_structs = module
        .structs
        .iter()
        .map(|s| CompiledStruct { name: s.name, field_names: s.fields.iter().map(|(n, _)| *n).collect() })
        .collect();

    let mut compiled_classes = Vec::new();
    for c in &module.classes {
        let info = &classes[&c.name];
        let parent_index = c.parent.and_then(|p| classes.get(&p)).map(|i| i.index);
        let mut methods = HashMap::new();
        for (class_name, method_name, idx) in &methods_flat {
            if *class_name == c.name {
                methods.insert(*method_name, *idx);
            }
        }
        compiled_classes.push(CompiledClass {
            name: c.name,
            parent_index,
            field_names: info.fields.iter().map(|(n, _)| *n).collect(),
            methods,
        });
    }
    let _ = structs;

    CompiledModule {
        functions,
        structs: compiled_structs,
        classes: compiled_classes,
        num_globals: module.globals.len() as u16,
        init_function: init_index,
        entry_function,
    }
}

fn collect_lambda_names(module: &Module, out: &mut HashMap<StringId, u32>, next_index: &mut u32) {
    fn walk_block(stmts: &[Stmt], out: &mut HashMap<StringId, u32>, next_index: &mut u32) {
        for s in stmts {
            walk_stmt(s, out, next_index);
        }
    }
    fn walk_stmt(stmt: &Stmt, out: &mut HashMap<StringId, u32>, next_index: &mut u32) {
        match &stmt.kind {
            StmtKind::Let { init, .. } | StmtKind::ExprStmt(init) | StmtKind::Throw(init) => walk_expr(init, out, next_index),
            StmtKind::Assign { value, .. } => walk_expr(value, out, next_index),
            StmtKind::IndexAssign { container, index, value } => {
                walk_expr(container, out, next_index);
                walk_expr(index, out, next_index);
                walk_expr(value, out, next_index);
            }
            StmtKind::FieldAssign { object, value, .. } => {
                walk_expr(object, out, next_index);
                walk_expr(value, out, next_index);
            }
            StmtKind::If { cond, then_block, else_block } => {
                walk_expr(cond, out, next_index);
                walk_block(then_block, out, next_index);
                walk_block(else_block, out, next_index);
            }
            StmtKind::While { cond, body } => {
                walk_expr(cond, out, next_index);
                walk_block(body, out, next_index);
            }
            StmtKind::ForRange { start, end, body, .. } => {
                walk_expr(start, out, next_index);
                walk_expr(end, out, next_index);
                walk_block(body, out, next_index);
            }
            StmtKind::ForIn { iterable, body, .. } => {
                walk_expr(iterable, out, next_index);
                walk_block(body, out, next_index);
            }
            StmtKind::Return(Some(e)) => walk_expr(e, out, next_index),
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Try { try_block, catch_block, finally_block, .. } => {
                walk_block(try_block, out, next_index);
                walk_block(catch_block, out, next_index);
                walk_block(finally_block, out, next_index);
            }
            StmtKind::Match { scrutinee, cases, default } => {
                walk_expr(scrutinee, out, next_index);
                for c in cases {
                    walk_expr(&c.pattern, out, next_index);
                    walk_block(&c.body, out, next_index);
                }
                if let Some(d) = default {
                    walk_block(d, out, next_index);
                }
            }
        }
    }
    fn walk_expr(expr: &Expr, out: &mut HashMap<StringId, u32>, next_index: &mut u32) {
        if let ExprKind::Lambda { synth_name: Some(n), body, .. } = &expr.kind {
            out.insert(*n, *next_index);
            *next_index += 1;
            walk_block(body, out, next_index);
        }
    }

    for f in &module.functions {
        walk_block(&f.body, out, next_index);
    }
    for c in &module.classes {
        for m in &c.methods {
            walk_block(&m.body, out, next_index);
        }
    }
}

struct LambdaCompileCtx<'a> {
    interner: &'a mut Interner,
    globals: &'a HashMap<StringId, u16>,
    functions: &'a HashMap<StringId, u32>,
    enums: &'a HashMap<StringId, EnumInfo>,
    out: &'a mut Vec<CompiledFunction>,
}

fn compile_lambdas(module: &Module, interner: &mut Interner, globals: &HashMap<StringId, u16>, functions: &HashMap<StringId, u32>, enums: &HashMap<StringId, EnumInfo>, out: &mut Vec<CompiledFunction>) {
    fn walk_block(stmts: &[Stmt], ctx: &mut LambdaCompileCtx) {
        for s in stmts {
            walk_stmt(s, ctx);
        }
    }
    fn walk_stmt(stmt: &Stmt, ctx: &mut LambdaCompileCtx) {
        match &stmt.kind {
            StmtKind::Let { init, .. } | StmtKind::ExprStmt(init) | StmtKind::Throw(init) => walk_expr(init, ctx),
            StmtKind::Assign { value, .. } => walk_expr(value, ctx),
            StmtKind::IndexAssign { container, index, value } => {
                walk_expr(container, ctx);
                walk_expr(index, ctx);
                walk_expr(value, ctx);
            }
            StmtKind::FieldAssign { object, value, .. } => {
                walk_expr(object, ctx);
                walk_expr(value, ctx);
            }
            StmtKind::If { cond, then_block, else_block } => {
                walk_expr(cond, ctx);
                walk_block(then_block, ctx);
                walk_block(else_block, ctx);
            }
            StmtKind::While { cond, body } => {
                walk_expr(cond, ctx);
                walk_block(body, ctx);
            }
            StmtKind::ForRange { start, end, body, .. } => {
                walk_expr(start, ctx);
                walk_expr(end, ctx);
                walk_block(body, ctx);
            }
            StmtKind::ForIn { iterable, body, .. } => {
                walk_expr(iterable, ctx);
                walk_block(body, ctx);
            }
            StmtKind::Return(Some(e)) => walk_expr(e, ctx),
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Try { try_block, catch_block, finally_block, .. } => {
                walk_block(try_block, ctx);
                walk_block(catch_block, ctx);
                walk_block(finally_block, ctx);
            }
            StmtKind::Match { scrutinee, cases, default } => {
                walk_expr(scrutinee, ctx);
                for c in cases {
                    walk_expr(&c.pattern, ctx);
                    walk_block(&c.body, ctx);
                }
                if let Some(d) = default {
                    walk_block(d, ctx);
                }
            }
        }
    }
    fn walk_expr(expr: &Expr, ctx: &mut LambdaCompileCtx) {
        if let ExprKind::Lambda { params, body, synth_name: Some(name), .. } = &expr.kind {
            walk_block(body, ctx);
            let mut fc = FnCompiler::new(ctx.interner, params.len() as u16, ctx.globals, ctx.functions, ctx.enums);
            fc.compile_function_body(params, body);
            ctx.out.push(CompiledFunction { name: *name, code: fc.builder.build(), call_patches: fc.call_patches, global_patches: fc.global_patches });
        }
    }

    let mut ctx = LambdaCompileCtx { interner, globals, functions, enums, out };
    for f in &module.functions {
        walk_block(&f.body, &mut ctx);
    }
    for c in &module.classes {
        for m in &c.methods {
            walk_block(&m.body, &mut ctx);
        }
    }
}
