//! Multi-module compilation. See spec.md §4.7.
//!
//! Given an entry module and the modules it (transitively) imports, this
//! walks the import graph, topologically sorts it (a cycle is a
//! [`LinkError`]), rewrites each module's `object.method(...)` calls against
//! an imported module name into an ordinary qualified call, type-checks and
//! compiles every module independently, then merges the results into one
//! [`CompiledModule`]: function tables concatenate, cross-module call sites
//! get their callee patched to the merged index, and every module's globals
//! get a distinct slice of one combined global table.
//!
//! Every parsed module here shares the caller's single [`Interner`], so
//! (unlike the source language this mirrors) there is no separate
//! string-pool "rebuild and remap" step — qualified names and all other
//! strings are already deduplicated the moment they're interned.

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::compiler::{self, CallTarget, CompiledClass, CompiledFunction, CompiledModule, CompiledStruct};
use crate::diagnostics::LinkError;
use crate::intern::{Interner, StringId};
use crate::typecheck;

/// Links `entry` together with every module it imports (present in `units`,
/// keyed by module name) into one executable [`CompiledModule`].
///
/// `units` must contain an entry for `entry` and for every module
/// transitively reachable from its `import` statements; the caller (the
/// driver, per spec.md §6's file-I/O boundary) is responsible for reading
/// and parsing those source files.
pub fn link_program(entry: StringId, mut units: HashMap<StringId, Module>, interner: &mut Interner) -> Result<CompiledModule, LinkError> {
    let order = topo_sort(entry, &units)?;

    for name in &order {
        let aliases: HashSet<StringId> = units[name].imports.iter().map(|i| i.module_name).collect();
        if aliases.is_empty() {
            continue;
        }
        let module = units.get_mut(name).unwrap();
        rewrite_module(module, &aliases, interner);
    }

    let mut compiled: Vec<(StringId, u32, CompiledModule)> = Vec::with_capacity(order.len());
    for name in &order {
        let mut module = units.remove(name).unwrap();
        let free_fn_count = module.functions.len() as u32;
        let tables = typecheck::check_module(&mut module, interner).map_err(|e| LinkError { message: format!("in module '{}': {e}", interner.resolve(*name)) })?;
        let cm = compiler::compile_module(&module, interner, &tables.structs, &tables.classes, &tables.enums);
        compiled.push((*name, free_fn_count, cm));
    }

    Ok(merge(entry, compiled, interner))
}

/// Kahn's algorithm over the `import` edges (an edge `a -> b` means "a
/// imports b", so `b` must be linked before `a`). Returns modules in
/// link order: dependencies first, `entry` last.
fn topo_sort(entry: StringId, units: &HashMap<StringId, Module>) -> Result<Vec<StringId>, LinkError> {
    fn visit(name: StringId, units: &HashMap<StringId, Module>, state: &mut HashMap<StringId, u8>, out: &mut Vec<StringId>) -> Result<(), LinkError> {
        match state.get(&name) {
            Some(1) => return Ok(()),
            Some(2) => return Err(LinkError { message: "circular import graph".to_owned() }),
            _ => {}
        }
        state.insert(name, 2);
        let Some(module) = units.get(&name) else {
            return Err(LinkError { message: "unknown import: module not found".to_owned() });
        };
        for imp in &module.imports {
            visit(imp.module_name, units, state, out)?;
        }
        state.insert(name, 1);
        out.push(name);
        Ok(())
    }

    let mut state = HashMap::new();
    let mut out = Vec::new();
    visit(entry, units, &mut state, &mut out)?;
    Ok(out)
}

/// Rewrites `object.method(args)` into a plain `Call` with a
/// `module$method` qualified name whenever `object` is a bare reference to
/// one of `aliases` (an imported module name) — the only place the surface
/// grammar names another module (spec.md §4.7, §4.3's Field/EnumMember
/// rewrite note). Left as `FnRef::Unresolved`; `typecheck::check_call`
/// already falls back to `FnRef::CrossModule` for any name it can't resolve
/// locally, which a qualified name like this never is.
fn rewrite_module(module: &mut Module, aliases: &HashSet<StringId>, interner: &mut Interner) {
    for f in &mut module.functions {
        rewrite_block(&mut f.body, aliases, interner);
    }
    for c in &mut module.classes {
        for m in &mut c.methods {
            rewrite_block(&mut m.body, aliases, interner);
        }
    }
    for g in &mut module.globals {
        rewrite_expr(&mut g.init, aliases, interner);
    }
}

fn rewrite_block(stmts: &mut [Stmt], aliases: &HashSet<StringId>, interner: &mut Interner) {
    for s in stmts {
        rewrite_stmt(s, aliases, interner);
    }
}

fn rewrite_stmt(stmt: &mut Stmt, aliases: &HashSet<StringId>, interner: &mut Interner) {
    match &mut stmt.kind {
        StmtKind::Let { init, .. } | StmtKind::ExprStmt(init) | StmtKind::Throw(init) => rewrite_expr(init, aliases, interner),
        StmtKind::Assign { value, .. } => rewrite_expr(value, aliases, interner),
        StmtKind::IndexAssign { container, index, value } => {
            rewrite_expr(container, aliases, interner);
            rewrite_expr(index, aliases, interner);
            rewrite_expr(value, aliases, interner);
        }
        StmtKind::FieldAssign { object, value, .. } => {
            rewrite_expr(object, aliases, interner);
            rewrite_expr(value, aliases, interner);
        }
        StmtKind::If { cond, then_block, else_block } => {
            rewrite_expr(cond, aliases, interner);
            rewrite_block(then_block, aliases, interner);
            rewrite_block(else_block, aliases, interner);
        }
        StmtKind::While { cond, body } => {
            rewrite_expr(cond, aliases, interner);
            rewrite_block(body, aliases, interner);
        }
        StmtKind::ForRange { start, end, body, .. } => {
            rewrite_expr(start, aliases, interner);
            rewrite_expr(end, aliases, interner);
            rewrite_block(body, aliases, interner);
        }
        StmtKind::ForIn { iterable, body, .. } => {
            rewrite_expr(iterable, aliases, interner);
            rewrite_block(body, aliases, interner);
        }
        StmtKind::Return(Some(e)) => rewrite_expr(e, aliases, interner),
        StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
        StmtKind::Try { try_block, catch_block, finally_block, .. } => {
            rewrite_block(try_block, aliases, interner);
            rewrite_block(catch_block, aliases, interner);
            rewrite_block(finally_block, aliases, interner);
        }
        StmtKind::Match { scrutinee, cases, default } => {
            rewrite_expr(scrutinee, aliases, interner);
            for case in cases {
                rewrite_expr(&mut case.pattern, aliases, interner);
                rewrite_block(&mut case.body, aliases, interner);
            }
            if let Some(d) = default {
                rewrite_block(d, aliases, interner);
            }
        }
    }
}

fn rewrite_expr(expr: &mut Expr, aliases: &HashSet<StringId>, interner: &mut Interner) {
    match &mut expr.kind {
        ExprKind::Call { args, .. } => {
            for a in args {
                rewrite_expr(a, aliases, interner);
            }
        }
        ExprKind::FString(parts) => {
            for p in parts {
                if let Some(e) = &mut p.expr {
                    rewrite_expr(e, aliases, interner);
                }
            }
        }
        ExprKind::ArrayLit(items) | ExprKind::Tuple(items) => {
            for i in items {
                rewrite_expr(i, aliases, interner);
            }
        }
        ExprKind::MapLit(pairs) => {
            for (k, v) in pairs {
                rewrite_expr(k, aliases, interner);
                rewrite_expr(v, aliases, interner);
            }
        }
        ExprKind::Index { container, index } => {
            rewrite_expr(container, aliases, interner);
            rewrite_expr(index, aliases, interner);
        }
        ExprKind::RecordLit { fields, .. } => {
            for (_, v) in fields {
                rewrite_expr(v, aliases, interner);
            }
        }
        ExprKind::Field { object, .. } => rewrite_expr(object, aliases, interner),
        ExprKind::MethodCall { object, args, .. } => {
            rewrite_expr(object, aliases, interner);
            for a in args {
                rewrite_expr(a, aliases, interner);
            }
            // Rewrite this call itself once its object/arguments are done, so
            // the match arm below can still see the borrowed `object`/`method`.
        }
        ExprKind::Unary { expr: inner, .. } => rewrite_expr(inner, aliases, interner),
        ExprKind::Binary { lhs, rhs, .. } => {
            rewrite_expr(lhs, aliases, interner);
            rewrite_expr(rhs, aliases, interner);
        }
        ExprKind::Lambda { body, .. } => rewrite_block(body, aliases, interner),
        ExprKind::New { args, .. } | ExprKind::SuperCall { args } | ExprKind::SuperMethodCall { args, .. } => {
            for a in args {
                rewrite_expr(a, aliases, interner);
            }
        }
        ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::Str(_) | ExprKind::Null | ExprKind::Var(_) | ExprKind::EnumMember { .. } => {}
    }

    if let ExprKind::MethodCall { object, method, args } = &expr.kind {
        if let ExprKind::Var(alias) = &object.kind {
            if aliases.contains(alias) {
                let qualified = format!("{}${}", interner.resolve(*alias), interner.resolve(*method));
                let name = interner.intern(&qualified);
                let args = args.clone();
                expr.kind = ExprKind::Call { name, args, fn_ref: FnRef::Unresolved };
            }
        }
    }
}

/// Concatenates every module's function/struct/class tables into one
/// merged [`CompiledModule`], shifting each `Call`/`LoadGlobal`/
/// `StoreGlobal` operand recorded in `call_patches`/`global_patches` by
/// that module's offset in the merged tables (spec.md §4.7).
fn merge(entry: StringId, compiled: Vec<(StringId, u32, CompiledModule)>, interner: &mut Interner) -> CompiledModule {
    let mut function_offset: HashMap<StringId, u32> = HashMap::new();
    let mut global_offset: HashMap<StringId, u16> = HashMap::new();
    let mut class_offset: HashMap<StringId, u32> = HashMap::new();
    let mut qualified_index: HashMap<StringId, u32> = HashMap::new();

    let mut running_fns = 0u32;
    let mut running_globals = 0u16;
    let mut running_structs = 0u32;
    let mut running_classes = 0u32;
    for (name, free_fn_count, cm) in &compiled {
        function_offset.insert(*name, running_fns);
        global_offset.insert(*name, running_globals);
        class_offset.insert(*name, running_classes);

        if *name == entry {
            for (i, f) in cm.functions.iter().enumerate().take(*free_fn_count as usize) {
                qualified_index.insert(f.name, running_fns + i as u32);
            }
        } else {
            for (i, f) in cm.functions.iter().enumerate().take(*free_fn_count as usize) {
                let qualified = format!("{}${}", interner.resolve(*name), interner.resolve(f.name));
                let id = interner.intern(&qualified);
                qualified_index.insert(id, running_fns + i as u32);
            }
        }

        running_fns += cm.functions.len() as u32;
        running_globals += cm.num_globals;
        running_structs += cm.structs.len() as u32;
        running_classes += cm.classes.len() as u32;
    }

    let mut functions: Vec<CompiledFunction> = Vec::with_capacity(running_fns as usize);
    let mut structs: Vec<CompiledStruct> = Vec::with_capacity(running_structs as usize);
    let mut classes: Vec<CompiledClass> = Vec::with_capacity(running_classes as usize);
    let mut init_calls: Vec<u32> = Vec::with_capacity(compiled.len());
    let mut entry_function = None;

    for (name, _free_fn_count, cm) in compiled {
        let fn_off = function_offset[&name];
        let glob_off = global_offset[&name];
        let cls_off = class_offset[&name];

        init_calls.push(fn_off + cm.init_function);
        if name == entry {
            entry_function = cm.entry_function.map(|i| fn_off + i);
        }

        for mut f in cm.functions {
            for (byte_offset, target) in &f.call_patches {
                let new_callee = match target {
                    CallTarget::Local(idx) => fn_off + idx,
                    CallTarget::CrossModule(qualified_name) => *qualified_index.get(qualified_name).unwrap_or(&0),
                };
                patch_u16(&mut f.code.bytecode, *byte_offset, new_callee as u16);
            }
            for byte_offset in &f.global_patches {
                let existing = read_u16(&f.code.bytecode, *byte_offset);
                patch_u16(&mut f.code.bytecode, *byte_offset, existing + glob_off);
            }
            functions.push(f);
        }
        for s in cm.structs {
            structs.push(s);
        }
        for mut c in cm.classes {
            c.parent_index = c.parent_index.map(|p| p + cls_off);
            classes.push(c);
        }
    }

    let init_name = interner.intern("$link_init");
    let mut init_builder = crate::bytecode::CodeBuilder::new(0);
    for idx in init_calls {
        init_builder.emit_call(crate::bytecode::Opcode::Call, idx as u16, 0, true);
        init_builder.emit(crate::bytecode::Opcode::Pop);
    }
    init_builder.emit(crate::bytecode::Opcode::ReturnVoid);
    let init_index = functions.len() as u32;
    functions.push(CompiledFunction { name: init_name, code: init_builder.build(), call_patches: vec![], global_patches: vec![] });

    CompiledModule { functions, structs, classes, num_globals: running_globals, init_function: init_index, entry_function }
}

fn read_u16(bytes: &[u8], offset: u32) -> u16 {
    let o = offset as usize;
    u16::from_le_bytes([bytes[o], bytes[o + 1]])
}

fn patch_u16(bytes: &mut [u8], offset: u32, value: u16) {
    let o = offset as usize;
    bytes[o..o + 2].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str, interner: &mut Interner) -> Module {
        crate::parser::Parser::new(src, interner).parse_module().unwrap()
    }

    #[test]
    fn links_a_call_into_an_imported_module() {
        let mut interner = Interner::new();
        let math_name = interner.intern("mathlib");
        let main_name = interner.intern("main_mod");

        let math_src = "export def square(x: int) -> int:\n    return x * x\n";
        let main_src = "import mathlib\n\ndef main() -> int:\n    return mathlib.square(5)\n";

        let math_module = parse(math_src, &mut interner);
        let main_module = parse(main_src, &mut interner);

        let mut units = HashMap::new();
        units.insert(math_name, math_module);
        units.insert(main_name, main_module);

        let linked = link_program(main_name, units, &mut interner).unwrap();
        // main() + square() + $link_init, at minimum.
        assert!(linked.functions.len() >= 3);
        assert!(linked.entry_function.is_some());
    }

    #[test]
    fn detects_a_circular_import() {
        let mut interner = Interner::new();
        let a_name = interner.intern("a");
        let b_name = interner.intern("b");
        let a_module = parse("import b\ndef main() -> int:\n    return 0\n", &mut interner);
        let b_module = parse("import a\ndef helper() -> int:\n    return 0\n", &mut interner);
        let mut units = HashMap::new();
        units.insert(a_name, a_module);
        units.insert(b_name, b_module);

        let err = link_program(a_name, units, &mut interner).unwrap_err();
        assert!(err.message.contains("circular"));
    }
}
