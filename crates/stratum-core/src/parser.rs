//! Recursive-descent parser with precedence climbing for binary expressions.
//! See spec.md §4.2.

use crate::ast::*;
use crate::diagnostics::{ParseError, Pos};
use crate::intern::{Interner, StringId};
use crate::lexer::{Keyword, Lexer, Op, Punct, Token, TokenKind};

type PResult<T> = Result<T, ParseError>;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    interner: &'a mut Interner,
    lambda_counter: u32,
}

/// Operator precedence, low to high (spec.md §4.2).
fn precedence(op: Op) -> Option<(u8, BinOp)> {
    use Op::*;
    Some(match op {
        Pipe => (1, BinOp::BitOr),
        Caret => (2, BinOp::BitXor),
        Amp => (3, BinOp::BitAnd),
        EqEq => (4, BinOp::Eq),
        NotEq => (4, BinOp::NotEq),
        Lt => (5, BinOp::Lt),
        Gt => (5, BinOp::Gt),
        Le => (5, BinOp::Le),
        Ge => (5, BinOp::Ge),
        Shl => (6, BinOp::Shl),
        Shr => (6, BinOp::Shr),
        Plus => (7, BinOp::Add),
        Minus => (7, BinOp::Sub),
        Star => (8, BinOp::Mul),
        Slash => (8, BinOp::Div),
        Percent => (8, BinOp::Mod),
        Eq => return None,
    })
}

// `and`/`or` sit below bitwise-or per spec.md §4.2's precedence table
// (logical-or, logical-and, bitwise-or, ...); handled as their own climb
// levels in `parse_or`/`parse_and` since they are keywords, not `Op` tokens.

impl<'a> Parser<'a> {
    #[must_use]
    pub fn new(src: &'a str, interner: &'a mut Interner) -> Self {
        Parser { lexer: Lexer::new(src), interner, lambda_counter: 0 }
    }

    fn peek(&mut self) -> PResult<&Token> {
        self.lexer.peek().map_err(|e| ParseError { pos: e.pos, message: e.message })
    }

    fn peek_kind(&mut self) -> PResult<TokenKind> {
        Ok(self.peek()?.kind.clone())
    }

    fn bump(&mut self) -> PResult<Token> {
        self.lexer.next_token().map_err(|e| ParseError { pos: e.pos, message: e.message })
    }

    fn pos(&mut self) -> Pos {
        self.peek().map(Token::pos).unwrap_or(Pos { line: 0, column: 0 })
    }

    fn error(&mut self, message: impl Into<String>) -> ParseError {
        ParseError { pos: self.pos(), message: message.into() }
    }

    fn expect_punct(&mut self, p: Punct) -> PResult<()> {
        let tok = self.bump()?;
        if tok.kind == TokenKind::Punct(p) {
            Ok(())
        } else {
            Err(ParseError { pos: tok.pos(), message: format!("expected {p:?}, found {:?}", tok.kind) })
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> PResult<()> {
        let tok = self.bump()?;
        if tok.kind == TokenKind::Keyword(kw) {
            Ok(())
        } else {
            Err(ParseError { pos: tok.pos(), message: format!("expected {kw:?}, found {:?}", tok.kind) })
        }
    }

    fn expect_ident(&mut self) -> PResult<StringId> {
        let tok = self.bump()?;
        match tok.kind {
            TokenKind::Ident(s) => Ok(self.interner.intern(&s)),
            other => Err(ParseError { pos: tok.pos(), message: format!("expected identifier, found {other:?}") }),
        }
    }

    fn at_keyword(&mut self, kw: Keyword) -> bool {
        matches!(self.peek_kind(), Ok(TokenKind::Keyword(k)) if k == kw)
    }

    fn at_punct(&mut self, p: Punct) -> bool {
        matches!(self.peek_kind(), Ok(TokenKind::Punct(k)) if k == p)
    }

    fn eat_newlines(&mut self) -> PResult<()> {
        while matches!(self.peek_kind()?, TokenKind::Newline) {
            self.bump()?;
        }
        Ok(())
    }

    // ---- top level -------------------------------------------------------

    pub fn parse_module(&mut self) -> PResult<Module> {
        let mut module = Module::default();
        self.eat_newlines()?;
        loop {
            if matches!(self.peek_kind()?, TokenKind::Eof) {
                break;
            }
            self.parse_top_level_item(&mut module)?;
            self.eat_newlines()?;
        }
        Ok(module)
    }

    fn parse_top_level_item(&mut self, module: &mut Module) -> PResult<()> {
        let mut packed = false;
        if self.at_punct(Punct::At) {
            self.bump()?;
            self.expect_keyword(Keyword::Packed)?;
            packed = true;
            self.eat_newlines()?;
        }

        let mut exported = false;
        if self.at_keyword(Keyword::Export) {
            self.bump()?;
            exported = true;
        }

        match self.peek_kind()? {
            TokenKind::Keyword(Keyword::Def) => {
                let f = self.parse_function(exported)?;
                module.functions.push(f);
            }
            TokenKind::Keyword(Keyword::Struct) => {
                module.structs.push(self.parse_struct(packed)?);
            }
            TokenKind::Keyword(Keyword::Class) => {
                module.classes.push(self.parse_class()?);
            }
            TokenKind::Keyword(Keyword::Enum) => {
                module.enums.push(self.parse_enum()?);
            }
            TokenKind::Keyword(Keyword::Union) => {
                module.unions.push(self.parse_union()?);
            }
            TokenKind::Keyword(Keyword::Import) => {
                module.imports.push(self.parse_import()?);
            }
            TokenKind::Keyword(Keyword::Extern) => {
                module.externs.push(self.parse_extern()?);
            }
            TokenKind::Keyword(Keyword::Let) => {
                module.globals.push(self.parse_global_let()?);
            }
            other => return Err(self.error(format!("unexpected top-level token {other:?}"))),
        }
        Ok(())
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_punct(Punct::Colon)?;
        if !matches!(self.peek_kind()?, TokenKind::Newline) {
            // Same-line compound-statement body (spec.md §4.2, e.g.
            // `if n < 2: return n`): the lexer only measures indentation at
            // the start of a new logical line, so a body sharing the `:`
            // line never gets an Indent/Dedent pair — parse one inline
            // statement instead of demanding an indented block.
            let stmt = self.parse_stmt()?;
            self.eat_newlines()?;
            return Ok(vec![stmt]);
        }
        self.eat_newlines()?;
        self.expect_tok(TokenKind::Indent)?;
        let mut stmts = Vec::new();
        self.eat_newlines()?;
        loop {
            if matches!(self.peek_kind()?, TokenKind::Dedent | TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_stmt()?);
            self.eat_newlines()?;
        }
        if matches!(self.peek_kind()?, TokenKind::Dedent) {
            self.bump()?;
        }
        Ok(stmts)
    }

    fn expect_tok(&mut self, kind: TokenKind) -> PResult<()> {
        let tok = self.bump()?;
        if std::mem::discriminant(&tok.kind) == std::mem::discriminant(&kind) {
            Ok(())
        } else {
            Err(ParseError { pos: tok.pos(), message: format!("expected {kind:?}, found {:?}", tok.kind) })
        }
    }

    fn parse_type(&mut self) -> PResult<Type> {
        if self.at_punct(Punct::LBracket) {
            self.bump()?;
            let inner = self.parse_type()?;
            self.expect_punct(Punct::RBracket)?;
            return Ok(Type::Array(Box::new(inner)));
        }
        if self.at_punct(Punct::LBrace) {
            self.bump()?;
            let k = self.parse_type()?;
            self.expect_punct(Punct::Colon)?;
            let v = self.parse_type()?;
            self.expect_punct(Punct::RBrace)?;
            return Ok(Type::Map(Box::new(k), Box::new(v)));
        }
        if self.at_punct(Punct::LParen) {
            self.bump()?;
            let mut elems = Vec::new();
            if !self.at_punct(Punct::RParen) {
                loop {
                    elems.push(self.parse_type()?);
                    if self.at_punct(Punct::Comma) {
                        self.bump()?;
                    } else {
                        break;
                    }
                }
            }
            self.expect_punct(Punct::RParen)?;
            if self.at_punct(Punct::Arrow) {
                self.bump()?;
                let ret = self.parse_type()?;
                return Ok(Type::Function(elems, Box::new(ret)));
            }
            return Ok(Type::Tuple(elems));
        }
        let name_tok = self.bump()?;
        let name = match &name_tok.kind {
            TokenKind::Ident(s) => s.clone(),
            TokenKind::Keyword(Keyword::SelfKw) => "self".to_owned(),
            other => return Err(ParseError { pos: name_tok.pos(), message: format!("expected type, found {other:?}") }),
        };
        Ok(match name.as_str() {
            "int" => Type::Int,
            "float" => Type::Float,
            "bool" => Type::Bool,
            "str" => Type::Str,
            "void" => Type::Void,
            "i8" => Type::I8,
            "i16" => Type::I16,
            "i32" => Type::I32,
            "i64" => Type::I64,
            "u8" => Type::U8,
            "u16" => Type::U16,
            "u32" => Type::U32,
            "u64" => Type::U64,
            other => {
                let id = self.interner.intern(other);
                // Disambiguated to Struct/Enum/Class during type-check; parser
                // records it provisionally as a struct reference.
                Type::Struct(id)
            }
        })
    }

    fn parse_params(&mut self) -> PResult<Vec<(StringId, Type)>> {
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        if !self.at_punct(Punct::RParen) {
            loop {
                let name = self.expect_ident()?;
                self.expect_punct(Punct::Colon)?;
                let ty = self.parse_type()?;
                params.push((name, ty));
                if self.at_punct(Punct::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen)?;
        Ok(params)
    }

    fn parse_function(&mut self, exported: bool) -> PResult<Function> {
        let line = self.pos().line;
        self.expect_keyword(Keyword::Def)?;
        let name = self.expect_ident()?;
        let params = self.parse_params()?;
        self.expect_punct(Punct::Arrow)?;
        let ret = self.parse_type()?;
        let body = self.parse_block()?;
        Ok(Function { name, params, ret, body, exported, line, local_count: 0 })
    }

    fn parse_struct(&mut self, packed: bool) -> PResult<StructDef> {
        let line = self.pos().line;
        self.expect_keyword(Keyword::Struct)?;
        let name = self.expect_ident()?;
        self.expect_punct(Punct::Colon)?;
        self.eat_newlines()?;
        self.expect_tok(TokenKind::Indent)?;
        let mut fields = Vec::new();
        self.eat_newlines()?;
        while !matches!(self.peek_kind()?, TokenKind::Dedent | TokenKind::Eof) {
            let fname = self.expect_ident()?;
            self.expect_punct(Punct::Colon)?;
            let fty = self.parse_type()?;
            fields.push((fname, fty));
            self.eat_newlines()?;
        }
        if matches!(self.peek_kind()?, TokenKind::Dedent) {
            self.bump()?;
        }
        Ok(StructDef { name, fields, packed, line })
    }

    fn parse_class(&mut self) -> PResult<ClassDef> {
        let line = self.pos().line;
        self.expect_keyword(Keyword::Class)?;
        let name = self.expect_ident()?;
        let parent = if self.at_punct(Punct::LParen) {
            self.bump()?;
            let p = self.expect_ident()?;
            self.expect_punct(Punct::RParen)?;
            Some(p)
        } else {
            None
        };
        self.expect_punct(Punct::Colon)?;
        self.eat_newlines()?;
        self.expect_tok(TokenKind::Indent)?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        self.eat_newlines()?;
        while !matches!(self.peek_kind()?, TokenKind::Dedent | TokenKind::Eof) {
            if self.at_keyword(Keyword::Def) {
                methods.push(self.parse_function(false)?);
            } else {
                let fname = self.expect_ident()?;
                self.expect_punct(Punct::Colon)?;
                let fty = self.parse_type()?;
                fields.push((fname, fty));
            }
            self.eat_newlines()?;
        }
        if matches!(self.peek_kind()?, TokenKind::Dedent) {
            self.bump()?;
        }
        Ok(ClassDef { name, parent, fields, methods, line })
    }

    fn parse_enum(&mut self) -> PResult<EnumDef> {
        let line = self.pos().line;
        self.expect_keyword(Keyword::Enum)?;
        let name = self.expect_ident()?;
        self.expect_punct(Punct::Colon)?;
        self.eat_newlines()?;
        self.expect_tok(TokenKind::Indent)?;
        let mut variants = Vec::new();
        let mut next_value = 0i64;
        self.eat_newlines()?;
        while !matches!(self.peek_kind()?, TokenKind::Dedent | TokenKind::Eof) {
            let vname = self.expect_ident()?;
            let value = next_value;
            variants.push((vname, value));
            next_value = value + 1;
            self.eat_newlines()?;
        }
        if matches!(self.peek_kind()?, TokenKind::Dedent) {
            self.bump()?;
        }
        Ok(EnumDef { name, variants, line })
    }

    fn parse_union(&mut self) -> PResult<UnionDef> {
        let line = self.pos().line;
        self.expect_keyword(Keyword::Union)?;
        let name = self.expect_ident()?;
        self.expect_punct(Punct::Colon)?;
        self.eat_newlines()?;
        self.expect_tok(TokenKind::Indent)?;
        let mut members = Vec::new();
        self.eat_newlines()?;
        while !matches!(self.peek_kind()?, TokenKind::Dedent | TokenKind::Eof) {
            let mname = self.expect_ident()?;
            self.expect_punct(Punct::Colon)?;
            let mty = self.parse_type()?;
            members.push((mname, mty));
            self.eat_newlines()?;
        }
        if matches!(self.peek_kind()?, TokenKind::Dedent) {
            self.bump()?;
        }
        Ok(UnionDef { name, members, line })
    }

    fn parse_import(&mut self) -> PResult<Import> {
        let line = self.pos().line;
        self.expect_keyword(Keyword::Import)?;
        let name = self.expect_ident()?;
        Ok(Import { module_name: name, line })
    }

    fn parse_extern(&mut self) -> PResult<ExternDef> {
        let line = self.pos().line;
        self.expect_keyword(Keyword::Extern)?;
        self.expect_keyword(Keyword::Def)?;
        let name = self.expect_ident()?;
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        if !self.at_punct(Punct::RParen) {
            loop {
                params.push(self.parse_type()?);
                if self.at_punct(Punct::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen)?;
        self.expect_punct(Punct::Arrow)?;
        let ret = self.parse_type()?;
        Ok(ExternDef { name, params, ret, line })
    }

    fn parse_global_let(&mut self) -> PResult<GlobalLet> {
        let line = self.pos().line;
        let (name, declared_ty, init) = self.parse_let_parts()?;
        Ok(GlobalLet { name, declared_ty, init, line })
    }

    // ---- statements --------------------------------------------------------

    fn parse_let_parts(&mut self) -> PResult<(StringId, Type, Expr)> {
        self.expect_keyword(Keyword::Let)?;
        let name = self.expect_ident()?;
        self.expect_punct(Punct::Colon)?;
        let ty = self.parse_type()?;
        let tok = self.bump()?;
        if tok.kind != TokenKind::Op(Op::Eq) {
            return Err(ParseError { pos: tok.pos(), message: "expected '=' in let binding".to_owned() });
        }
        let init = self.parse_expr()?;
        Ok((name, ty, init))
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let line = self.pos().line;
        let kind = match self.peek_kind()? {
            TokenKind::Keyword(Keyword::Let) => {
                let (name, declared_ty, init) = self.parse_let_parts()?;
                StmtKind::Let { name, declared_ty, init }
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if()?,
            TokenKind::Keyword(Keyword::While) => self.parse_while()?,
            TokenKind::Keyword(Keyword::For) => self.parse_for()?,
            TokenKind::Keyword(Keyword::Return) => {
                self.bump()?;
                if matches!(self.peek_kind()?, TokenKind::Newline | TokenKind::Dedent | TokenKind::Eof) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr()?))
                }
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.bump()?;
                StmtKind::Break
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.bump()?;
                StmtKind::Continue
            }
            TokenKind::Keyword(Keyword::Try) => self.parse_try()?,
            TokenKind::Keyword(Keyword::Throw) => {
                self.bump()?;
                StmtKind::Throw(self.parse_expr()?)
            }
            TokenKind::Keyword(Keyword::Match) => self.parse_match()?,
            _ => self.parse_expr_or_assign_stmt()?,
        };
        Ok(Stmt { kind, line })
    }

    fn parse_if(&mut self) -> PResult<StmtKind> {
        self.expect_keyword(Keyword::If)?;
        self.parse_if_tail()
    }

    /// Parses the condition/then/else portion shared by `if` and `elif`.
    /// `elif` desugars to a nested `if` in the else branch (spec.md §4.2).
    fn parse_if_tail(&mut self) -> PResult<StmtKind> {
        let cond = self.parse_expr()?;
        let then_block = self.parse_block()?;
        let else_block = if self.at_keyword(Keyword::Elif) {
            let line = self.bump()?.line;
            vec![Stmt { kind: self.parse_if_tail()?, line }]
        } else if self.at_keyword(Keyword::Else) {
            self.bump()?;
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { cond, then_block, else_block })
    }

    fn parse_while(&mut self) -> PResult<StmtKind> {
        self.expect_keyword(Keyword::While)?;
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(StmtKind::While { cond, body })
    }

    fn parse_for(&mut self) -> PResult<StmtKind> {
        self.expect_keyword(Keyword::For)?;
        let var = self.expect_ident()?;
        self.expect_keyword(Keyword::In)?;
        // `for v in range(a, b):` — recognized syntactically by callee name.
        if self.at_ident_eq("range") {
            self.bump()?;
            self.expect_punct(Punct::LParen)?;
            let start = self.parse_expr()?;
            self.expect_punct(Punct::Comma)?;
            let end = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            let body = self.parse_block()?;
            return Ok(StmtKind::ForRange { var, start, end, body });
        }
        let iterable = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(StmtKind::ForIn { var, iterable, body })
    }

    fn at_ident_eq(&mut self, s: &str) -> bool {
        matches!(self.peek_kind(), Ok(TokenKind::Ident(ref name)) if name == s)
    }

    fn parse_try(&mut self) -> PResult<StmtKind> {
        self.expect_keyword(Keyword::Try)?;
        let try_block = self.parse_block()?;
        let (catch_var, catch_block) = if self.at_keyword(Keyword::Catch) {
            self.bump()?;
            let var = if !self.at_punct(Punct::Colon) { Some(self.expect_ident()?) } else { None };
            (var, self.parse_block()?)
        } else {
            (None, Vec::new())
        };
        let finally_block = if self.at_keyword(Keyword::Finally) {
            self.bump()?;
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::Try { try_block, catch_var, catch_block, finally_block })
    }

    fn parse_match(&mut self) -> PResult<StmtKind> {
        self.expect_keyword(Keyword::Match)?;
        let scrutinee = self.parse_expr()?;
        self.expect_punct(Punct::Colon)?;
        self.eat_newlines()?;
        self.expect_tok(TokenKind::Indent)?;
        let mut cases = Vec::new();
        let mut default = None;
        self.eat_newlines()?;
        while !matches!(self.peek_kind()?, TokenKind::Dedent | TokenKind::Eof) {
            if self.at_keyword(Keyword::Default) {
                self.bump()?;
                default = Some(self.parse_block()?);
            } else {
                self.expect_keyword(Keyword::Case)?;
                let pattern = self.parse_expr()?;
                let body = self.parse_block()?;
                cases.push(MatchCase { pattern, body });
            }
            self.eat_newlines()?;
        }
        if matches!(self.peek_kind()?, TokenKind::Dedent) {
            self.bump()?;
        }
        Ok(StmtKind::Match { scrutinee, cases, default })
    }

    fn parse_expr_or_assign_stmt(&mut self) -> PResult<StmtKind> {
        let expr = self.parse_expr()?;
        if matches!(self.peek_kind()?, TokenKind::Op(Op::Eq)) {
            self.bump()?;
            let value = self.parse_expr()?;
            return Ok(match expr.kind {
                ExprKind::Var(name) => StmtKind::Assign { name, value },
                ExprKind::Index { container, index } => {
                    StmtKind::IndexAssign { container: *container, index: *index, value }
                }
                ExprKind::Field { object, field, field_index } => {
                    StmtKind::FieldAssign { object: *object, field, field_index, value }
                }
                _ => return Err(self.error("invalid assignment target")),
            });
        }
        Ok(StmtKind::ExprStmt(expr))
    }

    // ---- expressions -------------------------------------------------------

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.at_keyword(Keyword::Or) {
            let line = self.bump()?.line;
            let rhs = self.parse_and()?;
            lhs = Expr { kind: ExprKind::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) }, ty: Type::Unknown, line };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_binary(1)?;
        while self.at_keyword(Keyword::And) {
            let line = self.bump()?.line;
            let rhs = self.parse_binary(1)?;
            lhs = Expr { kind: ExprKind::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) }, ty: Type::Unknown, line };
        }
        Ok(lhs)
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind()? {
                TokenKind::Op(op) => op,
                _ => break,
            };
            let Some((prec, bin)) = precedence(op) else { break };
            if prec < min_prec {
                break;
            }
            let line = self.bump()?.line;
            // Left-associative: climb with prec + 1.
            let rhs = self.parse_binary(prec + 1)?;
            lhs = Expr { kind: ExprKind::Binary { op: bin, lhs: Box::new(lhs), rhs: Box::new(rhs) }, ty: Type::Unknown, line };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let line = self.pos().line;
        if self.at_keyword(Keyword::Not) {
            self.bump()?;
            let expr = self.parse_unary()?;
            return Ok(Expr { kind: ExprKind::Unary { op: UnOp::Not, expr: Box::new(expr) }, ty: Type::Unknown, line });
        }
        if matches!(self.peek_kind()?, TokenKind::Op(Op::Minus)) {
            self.bump()?;
            let expr = self.parse_unary()?;
            return Ok(Expr { kind: ExprKind::Unary { op: UnOp::Neg, expr: Box::new(expr) }, ty: Type::Unknown, line });
        }
        if matches!(self.peek_kind()?, TokenKind::Op(Op::Tilde)) {
            self.bump()?;
            let expr = self.parse_unary()?;
            return Ok(Expr { kind: ExprKind::Unary { op: UnOp::BitNot, expr: Box::new(expr) }, ty: Type::Unknown, line });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.at_punct(Punct::Dot) {
                let line = self.bump()?.line;
                let name = self.expect_ident()?;
                if self.at_punct(Punct::LParen) {
                    let args = self.parse_args()?;
                    expr = Expr { kind: ExprKind::MethodCall { object: Box::new(expr), method: name, args }, ty: Type::Unknown, line };
                } else {
                    expr = Expr { kind: ExprKind::Field { object: Box::new(expr), field: name, field_index: None }, ty: Type::Unknown, line };
                }
            } else if self.at_punct(Punct::LBracket) {
                let line = self.bump()?.line;
                let index = self.parse_expr()?;
                self.expect_punct(Punct::RBracket)?;
                expr = Expr { kind: ExprKind::Index { container: Box::new(expr), index: Box::new(index) }, ty: Type::Unknown, line };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> PResult<Vec<Expr>> {
        self.expect_punct(Punct::LParen)?;
        let mut args = Vec::new();
        if !self.at_punct(Punct::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.at_punct(Punct::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.bump()?;
        let line = tok.line;
        match tok.kind {
            TokenKind::Int(v) => Ok(Expr { kind: ExprKind::Int(v), ty: Type::Unknown, line }),
            TokenKind::Float(v) => Ok(Expr { kind: ExprKind::Float(v), ty: Type::Unknown, line }),
            TokenKind::Keyword(Keyword::True) => Ok(Expr { kind: ExprKind::Bool(true), ty: Type::Unknown, line }),
            TokenKind::Keyword(Keyword::False) => Ok(Expr { kind: ExprKind::Bool(false), ty: Type::Unknown, line }),
            TokenKind::Keyword(Keyword::Null) => Ok(Expr { kind: ExprKind::Null, ty: Type::Unknown, line }),
            TokenKind::Str(s) => Ok(Expr { kind: ExprKind::Str(s), ty: Type::Unknown, line }),
            TokenKind::FString(raw) => {
                let parts = self.parse_fstring_parts(&raw, line)?;
                Ok(Expr { kind: ExprKind::FString(parts), ty: Type::Unknown, line })
            }
            TokenKind::Punct(Punct::LParen) => {
                if self.at_punct(Punct::RParen) {
                    self.bump()?;
                    return Ok(Expr { kind: ExprKind::Tuple(Vec::new()), ty: Type::Unknown, line });
                }
                let first = self.parse_expr()?;
                if self.at_punct(Punct::Comma) {
                    let mut elems = vec![first];
                    while self.at_punct(Punct::Comma) {
                        self.bump()?;
                        if self.at_punct(Punct::RParen) {
                            break;
                        }
                        elems.push(self.parse_expr()?);
                    }
                    self.expect_punct(Punct::RParen)?;
                    Ok(Expr { kind: ExprKind::Tuple(elems), ty: Type::Unknown, line })
                } else {
                    self.expect_punct(Punct::RParen)?;
                    Ok(first)
                }
            }
            TokenKind::Punct(Punct::LBracket) => {
                let mut elems = Vec::new();
                if !self.at_punct(Punct::RBracket) {
                    loop {
                        elems.push(self.parse_expr()?);
                        if self.at_punct(Punct::Comma) {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::RBracket)?;
                Ok(Expr { kind: ExprKind::ArrayLit(elems), ty: Type::Unknown, line })
            }
            TokenKind::Punct(Punct::LBrace) => {
                let mut pairs = Vec::new();
                if !self.at_punct(Punct::RBrace) {
                    loop {
                        let k = self.parse_expr()?;
                        self.expect_punct(Punct::Colon)?;
                        let v = self.parse_expr()?;
                        pairs.push((k, v));
                        if self.at_punct(Punct::Comma) {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::RBrace)?;
                Ok(Expr { kind: ExprKind::MapLit(pairs), ty: Type::Unknown, line })
            }
            TokenKind::Keyword(Keyword::Fn) => self.parse_lambda(line),
            TokenKind::Keyword(Keyword::New) => {
                let name = self.expect_ident()?;
                let args = self.parse_args()?;
                Ok(Expr { kind: ExprKind::New { class_name: name, args }, ty: Type::Unknown, line })
            }
            TokenKind::Keyword(Keyword::Super) => {
                if self.at_punct(Punct::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr { kind: ExprKind::SuperCall { args }, ty: Type::Unknown, line })
                } else {
                    self.expect_punct(Punct::Dot)?;
                    let method = self.expect_ident()?;
                    let args = self.parse_args()?;
                    Ok(Expr { kind: ExprKind::SuperMethodCall { method, args }, ty: Type::Unknown, line })
                }
            }
            TokenKind::Keyword(Keyword::SelfKw) => {
                let id = self.interner.intern("self");
                Ok(Expr { kind: ExprKind::Var(id), ty: Type::Unknown, line })
            }
            TokenKind::Ident(name) => self.parse_ident_led(name, line),
            other => Err(ParseError { pos: Pos { line, column: tok.column }, message: format!("unexpected token {other:?}") }),
        }
    }

    fn parse_ident_led(&mut self, name: String, line: u32) -> PResult<Expr> {
        let id = self.interner.intern(&name);
        if self.at_punct(Punct::LParen) {
            let args = self.parse_args()?;
            return Ok(Expr { kind: ExprKind::Call { name: id, args, fn_ref: FnRef::Unresolved }, ty: Type::Unknown, line });
        }
        if self.at_punct(Punct::LBrace) {
            // Record literal `Name{field: value, ...}`.
            self.bump()?;
            let mut fields = Vec::new();
            if !self.at_punct(Punct::RBrace) {
                loop {
                    let fname = self.expect_ident()?;
                    self.expect_punct(Punct::Colon)?;
                    let fval = self.parse_expr()?;
                    fields.push((fname, fval));
                    if self.at_punct(Punct::Comma) {
                        self.bump()?;
                    } else {
                        break;
                    }
                }
            }
            self.expect_punct(Punct::RBrace)?;
            return Ok(Expr { kind: ExprKind::RecordLit { type_name: id, fields }, ty: Type::Unknown, line });
        }
        if self.at_punct(Punct::Colon) {
            // lookahead for `::` (enum member) is not part of this grammar;
            // enum members use dotted access `Enum.Variant`, disambiguated
            // from field access at type-check time by name resolution.
        }
        Ok(Expr { kind: ExprKind::Var(id), ty: Type::Unknown, line })
    }

    fn parse_lambda(&mut self, line: u32) -> PResult<Expr> {
        let params = self.parse_params()?;
        self.expect_punct(Punct::Arrow)?;
        let ret = self.parse_type()?;
        let body = self.parse_block()?;
        self.lambda_counter += 1;
        let synth = format!("$lambda{}", self.lambda_counter);
        let synth_name = self.interner.intern(&synth);
        Ok(Expr { kind: ExprKind::Lambda { params, ret, body, synth_name: Some(synth_name) }, ty: Type::Unknown, line })
    }

    /// Sub-lexes an f-string's raw content for `{...}` holes (spec.md §4.2,
    /// Design Note "Sub-lex for f-strings"). Brace pairs are balanced so
    /// nested braces inside an interpolated expression (e.g. a map literal)
    /// parse correctly. Each hole is parsed with a *fresh* `Lexer`/`Parser`
    /// over just its slice — no shared mutable lexer state.
    fn parse_fstring_parts(&mut self, raw: &str, line: u32) -> PResult<Vec<FStringPart>> {
        let mut parts = Vec::new();
        let bytes = raw.as_bytes();
        let mut i = 0;
        let mut literal = String::new();
        while i < bytes.len() {
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => {
                    literal.push('{');
                    i += 2;
                }
                b'}' if bytes.get(i + 1) == Some(&b'}') => {
                    literal.push('}');
                    i += 2;
                }
                b'{' => {
                    let start = i + 1;
                    let mut depth = 1usize;
                    let mut j = start;
                    while j < bytes.len() && depth > 0 {
                        match bytes[j] {
                            b'{' => depth += 1,
                            b'}' => depth -= 1,
                            _ => {}
                        }
                        if depth == 0 {
                            break;
                        }
                        j += 1;
                    }
                    if depth != 0 {
                        return Err(ParseError { pos: Pos { line, column: 1 }, message: "unbalanced '{' in f-string".to_owned() });
                    }
                    let hole_src = &raw[start..j];
                    let mut sub_parser = Parser::new(hole_src, self.interner);
                    sub_parser.lambda_counter = self.lambda_counter;
                    let expr = sub_parser.parse_expr()?;
                    self.lambda_counter = sub_parser.lambda_counter;
                    parts.push(FStringPart { literal: std::mem::take(&mut literal), expr: Some(Box::new(expr)) });
                    i = j + 1;
                }
                b => {
                    literal.push(b as char);
                    i += 1;
                }
            }
        }
        parts.push(FStringPart { literal, expr: None });
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Module {
        let mut interner = Interner::new();
        Parser::new(src, &mut interner).parse_module().unwrap()
    }

    #[test]
    fn if_accepts_a_same_line_inline_body() {
        // spec.md §8 scenario 1: `if n < 2: return n` shares its body with
        // the `:` on one physical line, so the lexer never emits an
        // Indent/Dedent pair for it.
        let module = parse("def fib(n: int) -> int:\n    if n < 2: return n\n    return fib(n-1) + fib(n-2)\n");
        let body = &module.functions[0].body;
        assert_eq!(body.len(), 2);
        match &body[0].kind {
            StmtKind::If { then_block, else_block, .. } => {
                assert_eq!(then_block.len(), 1);
                assert!(matches!(then_block[0].kind, StmtKind::Return(Some(_))));
                assert!(else_block.is_empty());
            }
            other => panic!("expected an if statement, got {other:?}"),
        }
    }

    #[test]
    fn if_still_accepts_an_indented_multi_statement_body() {
        let module = parse("def main() -> int:\n    if true:\n        let x: int = 1\n        return x\n    return 0\n");
        match &module.functions[0].body[0].kind {
            StmtKind::If { then_block, .. } => assert_eq!(then_block.len(), 2),
            other => panic!("expected an if statement, got {other:?}"),
        }
    }
}
