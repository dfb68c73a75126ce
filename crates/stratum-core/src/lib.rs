//! Lexer, parser, type checker, bytecode compiler, module linker, binary
//! module format, and stack VM for Stratum (spec.md §1-§6).
//!
//! The pipeline a driver (e.g. `stratum-cli`) wires together:
//!
//! ```text
//! source text --Lexer/Parser--> ast::Module
//!              --typecheck::check_module--> annotated ast::Module + ModuleTables
//!              --compiler::compile_module--> compiler::CompiledModule
//!              --link::link_program (multi-module only)--> compiler::CompiledModule
//!              --bytefmt::write_module--> bytes on disk
//!              --bytefmt::read_module--> bytefmt::LoadedModule
//!              --vm::LoadedProgram::from--> vm::Vm::run()
//! ```
//!
//! Resolving `import` statements to source text, argv parsing, and the
//! `compile`/`run` subcommand dispatch are deliberately left to the driver
//! crate (spec.md's "Deliberately OUT OF SCOPE" note in the overview); the
//! lexer/parser/typecheck/compiler/link stages above never touch `std::fs`
//! or `std::env` themselves. The VM's builtin catalog (`vm::Vm::exec_builtin`)
//! does use both, but only behind the fixed, type-checked builtin surface
//! (spec.md §6) — not as part of the compilation pipeline.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod bytefmt;
pub mod compiler;
pub mod diagnostics;
pub mod heap;
pub mod intern;
pub mod lexer;
pub mod link;
pub mod parser;
pub mod typecheck;
pub mod value;
pub mod vm;

use std::collections::HashMap;

use diagnostics::StratumError;
use intern::{Interner, StringId};

/// Parses and type-checks a single, import-free module, then compiles it.
/// Convenience wrapper for the common single-file case (spec.md §6's
/// "compile a standalone source file" path); programs with `import`
/// statements go through [`compile_program`] instead.
pub fn compile_source(src: &str, interner: &mut Interner) -> Result<compiler::CompiledModule, StratumError> {
    let mut module = parser::Parser::new(src, interner).parse_module()?;
    let tables = typecheck::check_module(&mut module, interner)?;
    Ok(compiler::compile_module(&module, interner, &tables.structs, &tables.classes, &tables.enums))
}

/// Links `entry` together with every module it (transitively) imports. The
/// caller is responsible for resolving `import` statements to source text
/// and parsing each into `units`, keyed by module name (spec.md §6's
/// file-I/O boundary — this crate never reads a filesystem itself).
pub fn compile_program(entry: StringId, units: HashMap<StringId, ast::Module>, interner: &mut Interner) -> Result<compiler::CompiledModule, StratumError> {
    Ok(link::link_program(entry, units, interner)?)
}
