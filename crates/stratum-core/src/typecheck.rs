//! Whole-module static type checker. See spec.md §4.3.
//!
//! `TypeContext` is threaded through every check function as `&mut self` —
//! there is no module-level mutable static (Design Note "No global mutable
//! state", mirrored from the parser's fresh-`Lexer`-per-hole approach).
//! Checking runs in three passes: collect definitions, check global
//! initializers, then check function/method bodies, so forward references
//! between top-level items resolve regardless of declaration order.

use std::collections::HashMap;

use crate::ast::*;
use crate::builtins::{self, Arity};
use crate::diagnostics::{Pos, TypeError};
use crate::intern::{Interner, StringId};

type TResult<T> = Result<T, TypeError>;

#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub index: u32,
    pub params: Vec<Type>,
    pub ret: Type,
}

#[derive(Debug, Clone, Default)]
pub struct StructInfo {
    pub index: u32,
    pub fields: Vec<(StringId, Type)>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassInfo {
    pub index: u32,
    pub parent: Option<StringId>,
    /// Flattened fields including inherited ones, parent-first.
    pub fields: Vec<(StringId, Type)>,
    pub methods: HashMap<StringId, FuncInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct EnumInfo {
    pub variants: HashMap<StringId, i64>,
}

/// Threaded type-checking state for a single module (spec.md §4.3).
pub struct TypeContext<'a> {
    pub interner: &'a mut Interner,
    pub functions: HashMap<StringId, FuncInfo>,
    pub structs: HashMap<StringId, StructInfo>,
    pub classes: HashMap<StringId, ClassInfo>,
    pub enums: HashMap<StringId, EnumInfo>,
    pub unions: HashMap<StringId, StructInfo>,
    pub globals: HashMap<StringId, Type>,
    /// Flattened block scope: `(name, type)` pairs pushed on scope entry,
    /// truncated back to the saved length on scope exit.
    scope: Vec<(StringId, Type)>,
    current_ret: Type,
    loop_depth: u32,
}

impl<'a> TypeContext<'a> {
    #[must_use]
    pub fn new(interner: &'a mut Interner) -> Self {
        TypeContext {
            interner,
            functions: HashMap::new(),
            structs: HashMap::new(),
            classes: HashMap::new(),
            enums: HashMap::new(),
            unions: HashMap::new(),
            globals: HashMap::new(),
            scope: Vec::new(),
            current_ret: Type::Void,
            loop_depth: 0,
        }
    }

    fn err(&self, line: u32, message: impl Into<String>) -> TypeError {
        TypeError { pos: Pos { line, column: 1 }, message: message.into() }
    }

    fn push_scope(&mut self) -> usize {
        self.scope.len()
    }

    fn pop_scope(&mut self, mark: usize) {
        self.scope.truncate(mark);
    }

    fn bind(&mut self, name: StringId, ty: Type) {
        self.scope.push((name, ty));
    }

    fn lookup_local(&self, name: StringId) -> Option<&Type> {
        self.scope.iter().rev().find(|(n, _)| *n == name).map(|(_, t)| t)
    }

    fn lookup_var(&self, name: StringId) -> Option<Type> {
        self.lookup_local(name).cloned().or_else(|| self.globals.get(&name).cloned())
    }
}

/// The struct/class/enum tables a single module's type-check pass collects,
/// handed to `compiler::compile_module` so field layout stays consistent
/// between the two passes, and to `link` for cross-module compilation.
pub struct ModuleTables {
    pub structs: HashMap<StringId, StructInfo>,
    pub classes: HashMap<StringId, ClassInfo>,
    pub enums: HashMap<StringId, EnumInfo>,
}

/// Entry point: type-checks `module` in place, annotating `Expr::ty` and
/// resolving `Call::fn_ref` for calls this module can see (everything except
/// cross-module calls, deferred to `link::link_program`).
pub fn check_module(module: &mut Module, interner: &mut Interner) -> TResult<ModuleTables> {
    let mut ctx = TypeContext::new(interner);
    collect_definitions(&mut ctx, module)?;
    check_globals(&mut ctx, module)?;
    check_function_bodies(&mut ctx, module)?;
    Ok(ModuleTables { structs: ctx.structs, classes: ctx.classes, enums: ctx.enums })
}

fn collect_definitions(ctx: &mut TypeContext, module: &Module) -> TResult<()> {
    for (i, s) in module.structs.iter().enumerate() {
        ctx.structs.insert(s.name, StructInfo { index: i as u32, fields: s.fields.clone() });
    }
    for (i, u) in module.unions.iter().enumerate() {
        ctx.unions.insert(u.name, StructInfo { index: i as u32, fields: u.members.clone() });
    }
    for e in &module.enums {
        let variants = e.variants.iter().copied().collect();
        ctx.enums.insert(e.name, EnumInfo { variants });
    }
    for (i, f) in module.functions.iter().enumerate() {
        let params = f.params.iter().map(|(_, t)| t.clone()).collect();
        ctx.functions.insert(f.name, FuncInfo { index: i as u32, params, ret: f.ret.clone() });
    }
    for g in &module.globals {
        ctx.globals.insert(g.name, g.declared_ty.clone());
    }
    // Classes need a second sub-pass: parent lookup requires all class names
    // to already be known, and field flattening requires the parent's own
    // flattened fields to exist first. Resolve in declaration order, which
    // is sufficient as long as a parent is declared before its child
    // (spec.md does not support forward-declared inheritance).
    for (i, c) in module.classes.iter().enumerate() {
        let mut fields = Vec::new();
        if let Some(parent) = c.parent {
            let parent_info = ctx
                .classes
                .get(&parent)
                .ok_or_else(|| ctx.err(c.line, format!("unknown parent class '{}'", ctx.interner.resolve(parent))))?;
            fields.extend(parent_info.fields.clone());
        }
        fields.extend(c.fields.clone());
        let mut methods = HashMap::new();
        for m in &c.methods {
            let params = m.params.iter().map(|(_, t)| t.clone()).collect();
            methods.insert(m.name, FuncInfo { index: 0, params, ret: m.ret.clone() });
        }
        ctx.classes.insert(c.name, ClassInfo { index: i as u32, parent: c.parent, fields, methods });
    }
    Ok(())
}

fn check_globals(ctx: &mut TypeContext, module: &mut Module) -> TResult<()> {
    for g in &mut module.globals {
        let ty = check_expr(ctx, &mut g.init)?;
        if !assignable(&ty, &g.declared_ty) {
            return Err(ctx.err(g.line, format!("global '{}' initializer type mismatch", ctx.interner.resolve(g.name))));
        }
    }
    Ok(())
}

fn check_function_bodies(ctx: &mut TypeContext, module: &mut Module) -> TResult<()> {
    for f in &mut module.functions {
        check_function(ctx, f)?;
    }
    for c in &mut module.classes {
        for m in &mut c.methods {
            check_function(ctx, m)?;
        }
    }
    Ok(())
}

fn check_function(ctx: &mut TypeContext, f: &mut Function) -> TResult<()> {
    let mark = ctx.push_scope();
    for (name, ty) in &f.params {
        ctx.bind(*name, ty.clone());
    }
    let saved_ret = std::mem::replace(&mut ctx.current_ret, f.ret.clone());
    check_block(ctx, &mut f.body)?;
    ctx.current_ret = saved_ret;
    f.local_count = u32::try_from(ctx.scope.len().saturating_sub(mark)).unwrap_or(0) + u32::try_from(f.params.len()).unwrap_or(0);
    ctx.pop_scope(mark);
    Ok(())
}

fn check_block(ctx: &mut TypeContext, stmts: &mut [Stmt]) -> TResult<()> {
    for stmt in stmts {
        check_stmt(ctx, stmt)?;
    }
    Ok(())
}

fn check_stmt(ctx: &mut TypeContext, stmt: &mut Stmt) -> TResult<()> {
    let line = stmt.line;
    match &mut stmt.kind {
        StmtKind::Let { name, declared_ty, init } => {
            let ty = check_expr(ctx, init)?;
            if !assignable(&ty, declared_ty) {
                return Err(ctx.err(line, format!("let '{}' initializer does not match declared type", ctx.interner.resolve(*name))));
            }
            ctx.bind(*name, declared_ty.clone());
        }
        StmtKind::Assign { name, value } => {
            let declared = ctx.lookup_var(*name).ok_or_else(|| ctx.err(line, format!("assignment to unknown variable '{}'", ctx.interner.resolve(*name))))?;
            let ty = check_expr(ctx, value)?;
            if !assignable(&ty, &declared) {
                return Err(ctx.err(line, "assignment type mismatch"));
            }
        }
        StmtKind::IndexAssign { container, index, value } => {
            check_expr(ctx, container)?;
            check_expr(ctx, index)?;
            check_expr(ctx, value)?;
        }
        StmtKind::FieldAssign { object, field, field_index, value } => {
            let obj_ty = check_expr(ctx, object)?;
            *field_index = resolve_field_index(ctx, &obj_ty, *field);
            check_expr(ctx, value)?;
        }
        StmtKind::ExprStmt(e) => {
            check_expr(ctx, e)?;
        }
        StmtKind::If { cond, then_block, else_block } => {
            let cty = check_expr(ctx, cond)?;
            expect_bool(ctx, &cty, line)?;
            let mark = ctx.push_scope();
            check_block(ctx, then_block)?;
            ctx.pop_scope(mark);
            let mark = ctx.push_scope();
            check_block(ctx, else_block)?;
            ctx.pop_scope(mark);
        }
        StmtKind::While { cond, body } => {
            let cty = check_expr(ctx, cond)?;
            expect_bool(ctx, &cty, line)?;
            ctx.loop_depth += 1;
            let mark = ctx.push_scope();
            check_block(ctx, body)?;
            ctx.pop_scope(mark);
            ctx.loop_depth -= 1;
        }
        StmtKind::ForRange { var, start, end, body } => {
            let sty = check_expr(ctx, start)?;
            let ety = check_expr(ctx, end)?;
            expect_int(ctx, &sty, line)?;
            expect_int(ctx, &ety, line)?;
            ctx.loop_depth += 1;
            let mark = ctx.push_scope();
            ctx.bind(*var, Type::Int);
            check_block(ctx, body)?;
            ctx.pop_scope(mark);
            ctx.loop_depth -= 1;
        }
        StmtKind::ForIn { var, iterable, body } => {
            let ity = check_expr(ctx, iterable)?;
            let elem_ty = match ity {
                Type::Array(inner) => *inner,
                _ => Type::Unknown,
            };
            ctx.loop_depth += 1;
            let mark = ctx.push_scope();
            ctx.bind(*var, elem_ty);
            check_block(ctx, body)?;
            ctx.pop_scope(mark);
            ctx.loop_depth -= 1;
        }
        StmtKind::Return(expr) => {
            let ty = match expr {
                Some(e) => check_expr(ctx, e)?,
                None => Type::Void,
            };
            if !assignable(&ty, &ctx.current_ret) {
                return Err(ctx.err(line, "return type does not match function signature"));
            }
        }
        StmtKind::Break | StmtKind::Continue => {
            if ctx.loop_depth == 0 {
                return Err(ctx.err(line, "break/continue outside of a loop"));
            }
        }
        StmtKind::Try { try_block, catch_var, catch_block, finally_block } => {
            let mark = ctx.push_scope();
            check_block(ctx, try_block)?;
            ctx.pop_scope(mark);
            let mark = ctx.push_scope();
            if let Some(v) = catch_var {
                ctx.bind(*v, Type::Str);
            }
            check_block(ctx, catch_block)?;
            ctx.pop_scope(mark);
            let mark = ctx.push_scope();
            check_block(ctx, finally_block)?;
            ctx.pop_scope(mark);
        }
        StmtKind::Throw(e) => {
            check_expr(ctx, e)?;
        }
        StmtKind::Match { scrutinee, cases, default } => {
            check_expr(ctx, scrutinee)?;
            for case in cases {
                check_expr(ctx, &mut case.pattern)?;
                let mark = ctx.push_scope();
                check_block(ctx, &mut case.body)?;
                ctx.pop_scope(mark);
            }
            if let Some(d) = default {
                let mark = ctx.push_scope();
                check_block(ctx, d)?;
                ctx.pop_scope(mark);
            }
        }
    }
    Ok(())
}

fn expect_bool(ctx: &TypeContext, ty: &Type, line: u32) -> TResult<()> {
    if matches!(ty, Type::Bool | Type::Unknown) {
        Ok(())
    } else {
        Err(ctx.err(line, "expected bool expression"))
    }
}

fn expect_int(ctx: &TypeContext, ty: &Type, line: u32) -> TResult<()> {
    if is_integral(ty) || matches!(ty, Type::Unknown) {
        Ok(())
    } else {
        Err(ctx.err(line, "expected integer expression"))
    }
}

fn is_integral(ty: &Type) -> bool {
    matches!(ty, Type::Int | Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::U8 | Type::U16 | Type::U32 | Type::U64)
}

fn is_numeric(ty: &Type) -> bool {
    is_integral(ty) || matches!(ty, Type::Float)
}

/// Whether a value of type `from` may be used where `to` is expected. Exact
/// match, or either side `Unknown` (not yet inferred / builtin passthrough).
fn assignable(from: &Type, to: &Type) -> bool {
    from == to || matches!(from, Type::Unknown) || matches!(to, Type::Unknown)
}

fn resolve_field_index(ctx: &TypeContext, obj_ty: &Type, field: StringId) -> Option<u32> {
    let name = match obj_ty {
        Type::Struct(n) | Type::Class(n) => *n,
        _ => return None,
    };
    if let Some(info) = ctx.structs.get(&name) {
        return info.fields.iter().position(|(f, _)| *f == field).map(|i| i as u32);
    }
    if let Some(info) = ctx.classes.get(&name) {
        return info.fields.iter().position(|(f, _)| *f == field).map(|i| i as u32);
    }
    None
}

fn check_expr(ctx: &mut TypeContext, expr: &mut Expr) -> TResult<Type> {
    let line = expr.line;

    // `Enum.Variant` parses as a `Field` access on a bare identifier; rewrite
    // it to `EnumMember` up front (immutable borrow only) so the main match
    // below never needs to mutate `expr.kind` while it's mid-destructured.
    if let ExprKind::Field { object, field, .. } = &expr.kind {
        if let ExprKind::Var(candidate) = &object.kind {
            if ctx.enums.contains_key(candidate) {
                expr.kind = ExprKind::EnumMember { enum_name: *candidate, variant: *field };
            }
        }
    }

    let ty = match &mut expr.kind {
        ExprKind::Int(_) => Type::Int,
        ExprKind::Float(_) => Type::Float,
        ExprKind::Bool(_) => Type::Bool,
        ExprKind::Str(_) => Type::Str,
        ExprKind::Null => Type::Void,
        ExprKind::Var(name) => ctx.lookup_var(*name).ok_or_else(|| ctx.err(line, format!("unknown identifier '{}'", ctx.interner.resolve(*name))))?,
        ExprKind::FString(parts) => {
            for part in parts {
                if let Some(e) = &mut part.expr {
                    check_expr(ctx, e)?;
                }
            }
            Type::Str
        }
        ExprKind::ArrayLit(items) => {
            let mut elem_ty = Type::Unknown;
            for item in items {
                let t = check_expr(ctx, item)?;
                if !matches!(t, Type::Unknown) {
                    elem_ty = t;
                }
            }
            Type::Array(Box::new(elem_ty))
        }
        ExprKind::MapLit(pairs) => {
            let mut kty = Type::Unknown;
            let mut vty = Type::Unknown;
            for (k, v) in pairs {
                let k_t = check_expr(ctx, k)?;
                let v_t = check_expr(ctx, v)?;
                if !matches!(k_t, Type::Unknown) {
                    kty = k_t;
                }
                if !matches!(v_t, Type::Unknown) {
                    vty = v_t;
                }
            }
            Type::Map(Box::new(kty), Box::new(vty))
        }
        ExprKind::Index { container, index } => {
            let cty = check_expr(ctx, container)?;
            check_expr(ctx, index)?;
            match cty {
                Type::Array(inner) => *inner,
                Type::Map(_, v) => *v,
                _ => Type::Unknown,
            }
        }
        ExprKind::RecordLit { type_name, fields } => {
            for (_, value) in fields.iter_mut() {
                check_expr(ctx, value)?;
            }
            if ctx.structs.contains_key(type_name) {
                Type::Struct(*type_name)
            } else {
                Type::Unknown
            }
        }
        ExprKind::Field { object, field, field_index } => {
            let obj_ty = check_expr(ctx, object)?;
            *field_index = resolve_field_index(ctx, &obj_ty, *field);
            match &obj_ty {
                Type::Struct(n) => ctx.structs.get(n).and_then(|s| s.fields.iter().find(|(f, _)| f == field).map(|(_, t)| t.clone())).unwrap_or(Type::Unknown),
                Type::Class(n) => ctx.classes.get(n).and_then(|c| c.fields.iter().find(|(f, _)| f == field).map(|(_, t)| t.clone())).unwrap_or(Type::Unknown),
                _ => Type::Unknown,
            }
        }
        ExprKind::MethodCall { object, args, .. } => {
            let obj_ty = check_expr(ctx, object)?;
            for a in args {
                check_expr(ctx, a)?;
            }
            if let Type::Class(n) = &obj_ty {
                ctx.classes.get(n).and_then(|c| {
                    // method name is looked up again at compile time; here we
                    // only need the return type for expression typing.
                    c.methods.values().next().map(|m| m.ret.clone())
                }).unwrap_or(Type::Unknown)
            } else {
                Type::Unknown
            }
        }
        ExprKind::Unary { op, expr: inner } => {
            let ity = check_expr(ctx, inner)?;
            match op {
                UnOp::Not => Type::Bool,
                UnOp::Neg => ity,
                UnOp::BitNot => ity,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let lty = check_expr(ctx, lhs)?;
            let rty = check_expr(ctx, rhs)?;
            check_binary(ctx, *op, &lty, &rty, line)?
        }
        ExprKind::Tuple(items) => {
            let mut tys = Vec::with_capacity(items.len());
            for item in items {
                tys.push(check_expr(ctx, item)?);
            }
            Type::Tuple(tys)
        }
        ExprKind::Lambda { params, ret, body, .. } => {
            let mark = ctx.push_scope();
            for (name, ty) in params.iter() {
                ctx.bind(*name, ty.clone());
            }
            let saved_ret = std::mem::replace(&mut ctx.current_ret, ret.clone());
            check_block(ctx, body)?;
            ctx.current_ret = saved_ret;
            ctx.pop_scope(mark);
            Type::Function(params.iter().map(|(_, t)| t.clone()).collect(), Box::new(ret.clone()))
        }
        ExprKind::New { class_name, args } => {
            for a in args {
                check_expr(ctx, a)?;
            }
            if !ctx.classes.contains_key(class_name) {
                return Err(ctx.err(line, format!("unknown class '{}'", ctx.interner.resolve(*class_name))));
            }
            Type::Class(*class_name)
        }
        ExprKind::SuperCall { args } | ExprKind::SuperMethodCall { args, .. } => {
            for a in args {
                check_expr(ctx, a)?;
            }
            Type::Void
        }
        ExprKind::EnumMember { enum_name, .. } => Type::Enum(*enum_name),
        ExprKind::Call { name, args, fn_ref } => check_call(ctx, *name, args, fn_ref, line)?,
    };
    expr.ty = ty.clone();
    Ok(ty)
}

fn check_binary(ctx: &TypeContext, op: BinOp, lty: &Type, rty: &Type, line: u32) -> TResult<Type> {
    use BinOp::*;
    match op {
        Add | Sub | Mul | Div | Mod => {
            if matches!(lty, Type::Str) && matches!(op, Add) {
                return Ok(Type::Str);
            }
            if !is_numeric(lty) && !matches!(lty, Type::Unknown) {
                return Err(ctx.err(line, "arithmetic on non-numeric type"));
            }
            if matches!(lty, Type::Float) || matches!(rty, Type::Float) {
                Ok(Type::Float)
            } else {
                Ok(lty.clone())
            }
        }
        Eq | NotEq | Lt | Gt | Le | Ge => Ok(Type::Bool),
        And | Or => Ok(Type::Bool),
        BitAnd | BitOr | BitXor | Shl | Shr => {
            if !is_integral(lty) && !matches!(lty, Type::Unknown) {
                return Err(ctx.err(line, "bitwise operator on non-integer type"));
            }
            Ok(lty.clone())
        }
    }
}

fn check_call(ctx: &mut TypeContext, name: StringId, args: &mut [Expr], fn_ref: &mut FnRef, line: u32) -> TResult<Type> {
    let mut arg_tys = Vec::with_capacity(args.len());
    for a in args.iter_mut() {
        arg_tys.push(check_expr(ctx, a)?);
    }

    if let Some(info) = ctx.functions.get(&name).cloned() {
        if info.params.len() != args.len() {
            return Err(ctx.err(line, format!("'{}' expects {} argument(s), got {}", ctx.interner.resolve(name), info.params.len(), args.len())));
        }
        *fn_ref = FnRef::Index(info.index);
        return Ok(info.ret);
    }

    let builtin_name = ctx.interner.resolve(name).to_owned();
    if let Some(sig) = builtins::lookup(&builtin_name) {
        match sig.arity {
            Arity::Exact(n) if n != args.len() => {
                return Err(ctx.err(line, format!("builtin '{builtin_name}' expects {n} argument(s), got {}", args.len())));
            }
            Arity::Variadic { min } if args.len() < min => {
                return Err(ctx.err(line, format!("builtin '{builtin_name}' expects at least {min} argument(s)")));
            }
            _ => {}
        }
        for (i, param) in sig.params.iter().enumerate() {
            let Some(arg_ty) = arg_tys.get(i) else { break };
            if !param.accepts(arg_ty) {
                return Err(ctx.err(line, format!("builtin '{builtin_name}' argument {} has wrong type", i + 1)));
            }
        }
        *fn_ref = FnRef::Builtin(u32::from(sig.id));
        return Ok((sig.ret)(&arg_tys));
    }

    // Not visible in this module: either a cross-module import or a genuine
    // undefined-function error, disambiguated by `link::link_program` which
    // has the full import graph (spec.md §4.7).
    *fn_ref = FnRef::CrossModule;
    Ok(Type::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(src: &str) -> TResult<ModuleTables> {
        let mut interner = Interner::new();
        let mut module = crate::parser::Parser::new(src, &mut interner).parse_module().unwrap();
        check_module(&mut module, &mut interner)
    }

    #[test]
    fn array_pop_infers_the_element_type() {
        let src = "def main() -> int:\n    let a: [int] = [1, 2, 3]\n    let x: int = array_pop(a)\n    return x\n";
        check(src).expect("array_pop() should type as int, matching the let binding");
    }

    #[test]
    fn map_keys_infers_an_array_of_the_key_type() {
        let src = "def main() -> int:\n    let m: {str: int} = {\"a\": 1}\n    let ks: [str] = map_keys(m)\n    return len(ks)\n";
        check(src).expect("map_keys() should type as [str]");
    }

    #[test]
    fn builtin_argument_type_mismatch_is_a_type_error() {
        let src = "def main() -> int:\n    return str_to_int(5)\n";
        let err = check(src).unwrap_err();
        assert!(err.message.contains("str_to_int"));
    }

    #[test]
    fn builtin_arity_mismatch_is_still_checked() {
        let src = "def main() -> int:\n    return sqrt(1, 2)\n";
        let err = check(src).unwrap_err();
        assert!(err.message.contains("sqrt"));
    }

    #[test]
    fn sqrt_accepts_an_int_argument() {
        let src = "def main() -> int:\n    let x: float = sqrt(4)\n    return 0\n";
        check(src).expect("sqrt() takes int or float per the builtin catalog");
    }
}
