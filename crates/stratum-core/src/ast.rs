//! In-memory program representation produced by the parser and annotated by
//! the type checker. See spec.md §3.
//!
//! Per Design Note "Recursive AST ownership": every node is owned exactly
//! once (by its parent, ultimately by the `Module`), and the type checker
//! annotates nodes in place as plain value fields rather than back-pointers.

use crate::intern::StringId;

/// A nominal or structural type, as produced by the parser's type
/// annotations and refined by the type checker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Struct(StringId),
    Enum(StringId),
    Class(StringId),
    Pointer(Box<Type>),
    Tuple(Vec<Type>),
    Function(Vec<Type>, Box<Type>),
    /// Inferred type not yet known (used transiently before type-check fills it in).
    Unknown,
}

/// Binary operator kinds recognized by the parser's precedence climber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

/// Sentinel values stored in a call node's resolved function index before
/// full resolution (spec.md §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnRef {
    Unresolved,
    Builtin(u32),
    /// Cross-module marker: resolved during multi-module linking (spec.md §4.7).
    CrossModule,
    Index(u32),
}

#[derive(Debug, Clone)]
pub struct FStringPart {
    pub literal: String,
    /// `None` for the trailing literal-only tail.
    pub expr: Option<Box<Expr>>,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
    Var(StringId),
    Call { name: StringId, args: Vec<Expr>, fn_ref: FnRef },
    FString(Vec<FStringPart>),
    ArrayLit(Vec<Expr>),
    MapLit(Vec<(Expr, Expr)>),
    Index { container: Box<Expr>, index: Box<Expr> },
    RecordLit { type_name: StringId, fields: Vec<(StringId, Expr)> },
    Field { object: Box<Expr>, field: StringId, field_index: Option<u32> },
    MethodCall { object: Box<Expr>, method: StringId, args: Vec<Expr> },
    Unary { op: UnOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Tuple(Vec<Expr>),
    Lambda { params: Vec<(StringId, Type)>, ret: Type, body: Vec<Stmt>, synth_name: Option<StringId> },
    New { class_name: StringId, args: Vec<Expr> },
    SuperCall { args: Vec<Expr> },
    SuperMethodCall { method: StringId, args: Vec<Expr> },
    EnumMember { enum_name: StringId, variant: StringId },
}

#[derive(Debug, Clone)]
pub struct MatchCase {
    pub pattern: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Let { name: StringId, declared_ty: Type, init: Expr },
    Assign { name: StringId, value: Expr },
    IndexAssign { container: Expr, index: Expr, value: Expr },
    FieldAssign { object: Expr, field: StringId, field_index: Option<u32>, value: Expr },
    ExprStmt(Expr),
    If { cond: Expr, then_block: Vec<Stmt>, else_block: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    ForRange { var: StringId, start: Expr, end: Expr, body: Vec<Stmt> },
    ForIn { var: StringId, iterable: Expr, body: Vec<Stmt> },
    Return(Option<Expr>),
    Break,
    Continue,
    Try { try_block: Vec<Stmt>, catch_var: Option<StringId>, catch_block: Vec<Stmt>, finally_block: Vec<Stmt> },
    Throw(Expr),
    Match { scrutinee: Expr, cases: Vec<MatchCase>, default: Option<Vec<Stmt>> },
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: StringId,
    pub params: Vec<(StringId, Type)>,
    pub ret: Type,
    pub body: Vec<Stmt>,
    pub exported: bool,
    pub line: u32,
    /// Filled in by the compiler; not part of the surface grammar.
    pub local_count: u32,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: StringId,
    pub fields: Vec<(StringId, Type)>,
    pub packed: bool,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: StringId,
    pub parent: Option<StringId>,
    pub fields: Vec<(StringId, Type)>,
    pub methods: Vec<Function>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: StringId,
    pub variants: Vec<(StringId, i64)>,
    pub line: u32,
}

/// A tagged union of nominal member types. The core does not generate code
/// for unions beyond storage layout (spec.md Non-goals exclude anything
/// deeper); they are carried through the AST and struct/class tables like
/// any other nominal type.
#[derive(Debug, Clone)]
pub struct UnionDef {
    pub name: StringId,
    pub members: Vec<(StringId, Type)>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct ExternDef {
    pub name: StringId,
    pub params: Vec<Type>,
    pub ret: Type,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct Import {
    pub module_name: StringId,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct GlobalLet {
    pub name: StringId,
    pub declared_ty: Type,
    pub init: Expr,
    pub line: u32,
}

/// A single parsed source file. Multiple modules are linked together by
/// `link::link_program` (spec.md §4.7).
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub structs: Vec<StructDef>,
    pub classes: Vec<ClassDef>,
    pub enums: Vec<EnumDef>,
    pub unions: Vec<UnionDef>,
    pub externs: Vec<ExternDef>,
    pub imports: Vec<Import>,
    pub globals: Vec<GlobalLet>,
}
