//! Lexer: byte stream → token stream with explicit INDENT/DEDENT tokens.
//!
//! See spec.md §4.1. The lexer is pull-based (`next_token`) and caches one
//! token of lookahead for `peek`. ASCII semantics only (Non-goals).

use crate::diagnostics::{LexError, Pos};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Def,
    Let,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    True,
    False,
    And,
    Or,
    Not,
    Try,
    Catch,
    Finally,
    Throw,
    Struct,
    Class,
    Enum,
    Union,
    Import,
    Export,
    Extern,
    Fn,
    Match,
    Case,
    Default,
    New,
    SelfKw,
    Super,
    From,
    As,
    Null,
    Packed,
}

impl Keyword {
    fn from_str(s: &str) -> Option<Keyword> {
        use Keyword::*;
        Some(match s {
            "def" => Def,
            "let" => Let,
            "if" => If,
            "elif" => Elif,
            "else" => Else,
            "while" => While,
            "for" => For,
            "in" => In,
            "return" => Return,
            "break" => Break,
            "continue" => Continue,
            "true" => True,
            "false" => False,
            "and" => And,
            "or" => Or,
            "not" => Not,
            "try" => Try,
            "catch" => Catch,
            "finally" => Finally,
            "throw" => Throw,
            "struct" => Struct,
            "class" => Class,
            "enum" => Enum,
            "union" => Union,
            "import" => Import,
            "export" => Export,
            "extern" => Extern,
            "fn" => Fn,
            "match" => Match,
            "case" => Case,
            "default" => Default,
            "new" => New,
            "self" => SelfKw,
            "super" => Super,
            "from" => From,
            "as" => As,
            "null" => Null,
            "packed" => Packed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Arrow,
    At,
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,
    Newline,
    Indent,
    Dedent,
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    FString(String),
    Keyword(Keyword),
    Punct(Punct),
    Op(Op),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
    pub column: u32,
}

impl Token {
    #[must_use]
    pub fn pos(&self) -> Pos {
        Pos { line: self.line, column: self.column }
    }
}

/// Scans a byte buffer into tokens, tracking the indentation-level stack.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    /// Indentation widths currently open; bottom is always 0.
    indents: Vec<u32>,
    /// DEDENT tokens still owed before resuming normal scanning (e.g. at EOF).
    pending_dedents: u32,
    /// True at the start of a logical line, before indentation has been measured.
    at_line_start: bool,
    peeked: Option<Token>,
}

const TAB_WIDTH: u32 = 4;

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            indents: vec![0],
            pending_dedents: 0,
            at_line_start: true,
            peeked: None,
        }
    }

    #[must_use]
    pub fn peek(&mut self) -> Result<&Token, LexError> {
        if self.peeked.is_none() {
            let tok = self.scan_token()?;
            self.peeked = Some(tok);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        if let Some(tok) = self.peeked.take() {
            return Ok(tok);
        }
        self.scan_token()
    }

    fn cur(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.cur()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else if b == b'\t' {
            self.col += TAB_WIDTH;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn make(&self, kind: TokenKind, lexeme: String, line: u32, column: u32) -> Token {
        Token { kind, lexeme, line, column }
    }

    /// Consumes leading whitespace/comments on a logical line and returns the
    /// measured indentation width in columns (tabs count as `TAB_WIDTH`), or
    /// `None` if the line is blank or comment-only (no indent change emitted).
    fn measure_indent(&mut self) -> Option<u32> {
        let mut width = 0u32;
        loop {
            match self.cur() {
                Some(b' ') => {
                    width += 1;
                    self.advance();
                }
                Some(b'\t') => {
                    width += TAB_WIDTH;
                    self.advance();
                }
                _ => break,
            }
        }
        match self.cur() {
            None => None,
            Some(b'\n') => {
                self.advance();
                None
            }
            Some(b'#') => {
                while let Some(b) = self.cur() {
                    if b == b'\n' {
                        break;
                    }
                    self.advance();
                }
                if self.cur() == Some(b'\n') {
                    self.advance();
                }
                None
            }
            _ => Some(width),
        }
    }

    fn scan_token(&mut self) -> Result<Token, LexError> {
        if self.pending_dedents > 0 {
            self.pending_dedents -= 1;
            return Ok(self.make(TokenKind::Dedent, String::new(), self.line, self.col));
        }

        if self.at_line_start {
            loop {
                let line = self.line;
                match self.measure_indent() {
                    None => {
                        if self.cur().is_none() {
                            break;
                        }
                        continue;
                    }
                    Some(width) => {
                        let top = *self.indents.last().unwrap();
                        if width > top {
                            self.indents.push(width);
                            self.at_line_start = false;
                            return Ok(self.make(TokenKind::Indent, String::new(), line, 1));
                        } else if width < top {
                            let mut count = 0u32;
                            while *self.indents.last().unwrap() > width {
                                self.indents.pop();
                                count += 1;
                            }
                            if *self.indents.last().unwrap() != width {
                                return Err(LexError {
                                    pos: Pos { line, column: 1 },
                                    message: "inconsistent indentation".to_owned(),
                                });
                            }
                            self.at_line_start = false;
                            self.pending_dedents = count - 1;
                            return Ok(self.make(TokenKind::Dedent, String::new(), line, 1));
                        }
                        self.at_line_start = false;
                        break;
                    }
                }
            }
        }

        self.skip_inline_whitespace_and_comments();

        let line = self.line;
        let column = self.col;
        let Some(b) = self.cur() else {
            if self.indents.len() > 1 {
                let count = u32::try_from(self.indents.len() - 1).unwrap();
                self.indents.truncate(1);
                self.pending_dedents = count - 1;
                return Ok(self.make(TokenKind::Dedent, String::new(), line, column));
            }
            return Ok(self.make(TokenKind::Eof, String::new(), line, column));
        };

        if b == b'\n' {
            self.advance();
            self.at_line_start = true;
            return Ok(self.make(TokenKind::Newline, "\n".to_owned(), line, column));
        }

        if b.is_ascii_digit() {
            return Ok(self.scan_number(line, column));
        }

        if b == b'"' {
            return self.scan_string(line, column, false);
        }

        if b == b'f' && self.at(1) == Some(b'"') {
            self.advance();
            return self.scan_string(line, column, true);
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            return Ok(self.scan_ident_or_keyword(line, column));
        }

        self.scan_punct_or_op(line, column)
    }

    fn skip_inline_whitespace_and_comments(&mut self) {
        loop {
            match self.cur() {
                Some(b' ' | b'\t') => {
                    self.advance();
                }
                Some(b'#') => {
                    while let Some(b) = self.cur() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_number(&mut self, line: u32, column: u32) -> Token {
        let start = self.pos;
        while self.cur().is_some_and(|b| b.is_ascii_digit()) {
            self.advance();
        }
        let mut is_float = false;
        if self.cur() == Some(b'.') && self.at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while self.cur().is_some_and(|b| b.is_ascii_digit()) {
                self.advance();
            }
        }
        let lexeme = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        let kind = if is_float {
            TokenKind::Float(lexeme.parse().unwrap_or(0.0))
        } else {
            TokenKind::Int(lexeme.parse().unwrap_or(0))
        };
        self.make(kind, lexeme, line, column)
    }

    fn scan_ident_or_keyword(&mut self, line: u32, column: u32) -> Token {
        let start = self.pos;
        while self.cur().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_') {
            self.advance();
        }
        let lexeme = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        let kind = match Keyword::from_str(&lexeme) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(lexeme.clone()),
        };
        self.make(kind, lexeme, line, column)
    }

    /// Scans a `"..."` literal (or `f"..."` when `is_fstring`). The cooked
    /// value for f-strings is the *raw* content between quotes — re-scanning
    /// for `{…}` holes happens later in the parser (spec.md §4.2).
    fn scan_string(&mut self, line: u32, column: u32, is_fstring: bool) -> Result<Token, LexError> {
        let quote_col = self.col;
        self.advance(); // opening quote
        let mut cooked = String::new();
        let mut raw = String::from(if is_fstring { "f\"" } else { "\"" });
        loop {
            match self.cur() {
                None => {
                    return Err(LexError {
                        pos: Pos { line, column: quote_col },
                        message: "unterminated string literal".to_owned(),
                    });
                }
                Some(b'"') => {
                    self.advance();
                    raw.push('"');
                    break;
                }
                Some(b'\\') => {
                    self.advance();
                    raw.push('\\');
                    match self.cur() {
                        None => {
                            return Err(LexError {
                                pos: Pos { line, column: quote_col },
                                message: "unterminated escape sequence".to_owned(),
                            });
                        }
                        Some(esc) => {
                            self.advance();
                            raw.push(esc as char);
                            if is_fstring {
                                // raw form is re-lexed later; cooked tracking unused for f-strings.
                            } else {
                                cooked.push(match esc {
                                    b'n' => '\n',
                                    b't' => '\t',
                                    b'r' => '\r',
                                    b'"' => '"',
                                    b'\\' => '\\',
                                    other => other as char,
                                });
                            }
                        }
                    }
                }
                Some(b'\n') => {
                    return Err(LexError {
                        pos: Pos { line, column: quote_col },
                        message: "unterminated string literal".to_owned(),
                    });
                }
                Some(b) => {
                    self.advance();
                    raw.push(b as char);
                    if !is_fstring {
                        cooked.push(b as char);
                    }
                }
            }
        }
        let kind = if is_fstring {
            // Content between the quotes, after escape processing for literal braces is
            // left untouched: the parser's sub-lexer handles `{` / `}` and escapes.
            TokenKind::FString(raw[2..raw.len() - 1].to_owned())
        } else {
            TokenKind::Str(cooked)
        };
        Ok(self.make(kind, raw, line, column))
    }

    fn scan_punct_or_op(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        let b = self.advance().unwrap();
        macro_rules! tok {
            ($kind:expr, $lex:expr) => {
                Ok(self.make($kind, $lex.to_owned(), line, column))
            };
        }
        match b {
            b'(' => tok!(TokenKind::Punct(Punct::LParen), "("),
            b')' => tok!(TokenKind::Punct(Punct::RParen), ")"),
            b'{' => tok!(TokenKind::Punct(Punct::LBrace), "{"),
            b'}' => tok!(TokenKind::Punct(Punct::RBrace), "}"),
            b'[' => tok!(TokenKind::Punct(Punct::LBracket), "["),
            b']' => tok!(TokenKind::Punct(Punct::RBracket), "]"),
            b',' => tok!(TokenKind::Punct(Punct::Comma), ","),
            b':' => tok!(TokenKind::Punct(Punct::Colon), ":"),
            b'@' => tok!(TokenKind::Punct(Punct::At), "@"),
            b'?' => tok!(TokenKind::Punct(Punct::Question), "?"),
            b'.' => tok!(TokenKind::Punct(Punct::Dot), "."),
            b'~' => tok!(TokenKind::Op(Op::Tilde), "~"),
            b'+' => tok!(TokenKind::Op(Op::Plus), "+"),
            b'%' => tok!(TokenKind::Op(Op::Percent), "%"),
            b'^' => tok!(TokenKind::Op(Op::Caret), "^"),
            b'&' => tok!(TokenKind::Op(Op::Amp), "&"),
            b'|' => tok!(TokenKind::Op(Op::Pipe), "|"),
            b'*' => tok!(TokenKind::Op(Op::Star), "*"),
            b'/' => tok!(TokenKind::Op(Op::Slash), "/"),
            b'-' => {
                if self.cur() == Some(b'>') {
                    self.advance();
                    tok!(TokenKind::Punct(Punct::Arrow), "->")
                } else {
                    tok!(TokenKind::Op(Op::Minus), "-")
                }
            }
            b'=' => {
                if self.cur() == Some(b'=') {
                    self.advance();
                    tok!(TokenKind::Op(Op::EqEq), "==")
                } else {
                    tok!(TokenKind::Op(Op::Eq), "=")
                }
            }
            b'!' => {
                if self.cur() == Some(b'=') {
                    self.advance();
                    tok!(TokenKind::Op(Op::NotEq), "!=")
                } else {
                    Err(LexError {
                        pos: Pos { line, column },
                        message: "unexpected character '!'".to_owned(),
                    })
                }
            }
            b'<' => {
                if self.cur() == Some(b'=') {
                    self.advance();
                    tok!(TokenKind::Op(Op::Le), "<=")
                } else if self.cur() == Some(b'<') {
                    self.advance();
                    tok!(TokenKind::Op(Op::Shl), "<<")
                } else {
                    tok!(TokenKind::Op(Op::Lt), "<")
                }
            }
            b'>' => {
                if self.cur() == Some(b'=') {
                    self.advance();
                    tok!(TokenKind::Op(Op::Ge), ">=")
                } else if self.cur() == Some(b'>') {
                    self.advance();
                    tok!(TokenKind::Op(Op::Shr), ">>")
                } else {
                    tok!(TokenKind::Op(Op::Gt), ">")
                }
            }
            other => Err(LexError {
                pos: Pos { line, column },
                message: format!("illegal character {:?}", other as char),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lex = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let tok = lex.next_token().unwrap();
            let done = matches!(tok.kind, TokenKind::Eof);
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn indent_dedent_balanced() {
        let toks = kinds("def main() -> int:\n    return 1\n");
        let indents = toks.iter().filter(|k| matches!(k, TokenKind::Indent)).count();
        let dedents = toks.iter().filter(|k| matches!(k, TokenKind::Dedent)).count();
        assert_eq!(indents, dedents);
        assert_eq!(indents, 1);
    }

    #[test]
    fn blank_and_comment_lines_emit_no_indent_change() {
        let toks = kinds("def main() -> int:\n\n    # comment\n    return 1\n");
        let indents = toks.iter().filter(|k| matches!(k, TokenKind::Indent)).count();
        assert_eq!(indents, 1);
    }

    #[test]
    fn nested_dedents_pop_multiple_levels() {
        let toks = kinds("if true:\n    if true:\n        let x: int = 1\nlet y: int = 2\n");
        let dedent_count = toks.iter().filter(|k| matches!(k, TokenKind::Dedent)).count();
        assert_eq!(dedent_count, 2);
    }

    #[test]
    fn eof_flushes_exactly_one_dedent_per_open_level() {
        // Regression test: a program ending with no trailing less-indented
        // line (every block still open at EOF) must emit exactly one
        // Dedent per open indent level, not a triangular over-count.
        for depth in 1..=4 {
            let mut src = String::new();
            for d in 0..depth {
                src.push_str(&"    ".repeat(d));
                src.push_str("if true:\n");
            }
            src.push_str(&"    ".repeat(depth));
            src.push_str("return 1\n");
            let toks = kinds(&src);
            let indents = toks.iter().filter(|k| matches!(k, TokenKind::Indent)).count();
            let dedents = toks.iter().filter(|k| matches!(k, TokenKind::Dedent)).count();
            assert_eq!(indents, depth, "depth {depth}: expected {depth} Indent tokens");
            assert_eq!(dedents, depth, "depth {depth}: expected {depth} Dedent tokens, not a triangular over-count");
        }
    }

    #[test]
    fn string_escapes_are_cooked() {
        let toks = kinds("\"a\\nb\"");
        match &toks[0] {
            TokenKind::Str(s) => assert_eq!(s, "a\nb"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn fstring_keeps_raw_content_for_later_reparsing() {
        let toks = kinds("f\"hello {name}!\"");
        match &toks[0] {
            TokenKind::FString(s) => assert_eq!(s, "hello {name}!"),
            other => panic!("expected fstring, got {other:?}"),
        }
    }

    #[test]
    fn tabs_count_as_four_columns() {
        let mut lex = Lexer::new("if true:\n\tlet x: int = 1\n");
        let _ = lex.next_token().unwrap(); // if
        let _ = lex.next_token().unwrap(); // true
        let _ = lex.next_token().unwrap(); // :
        let _ = lex.next_token().unwrap(); // newline
        let tok = lex.next_token().unwrap();
        assert!(matches!(tok.kind, TokenKind::Indent));
    }

    #[test]
    fn inconsistent_indentation_is_an_error() {
        let mut lex = Lexer::new("if true:\n   let x: int = 1\n  let y: int = 2\n");
        let mut last = Ok(());
        loop {
            match lex.next_token() {
                Ok(tok) if matches!(tok.kind, TokenKind::Eof) => break,
                Ok(_) => continue,
                Err(e) => {
                    last = Err(e);
                    break;
                }
            }
        }
        assert!(last.is_err());
    }
}
