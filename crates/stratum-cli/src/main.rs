use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use stratum_core::{
    ast, bytefmt, compile_program,
    intern::{Interner, StringId},
    parser::Parser,
    vm::{LoadedProgram, Vm},
};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("compile") => compile_cmd(&args[2..]),
        Some("run") => run_cmd(&args[2..]),
        _ => {
            eprintln!("usage: stratum compile SOURCE -o OUTPUT");
            eprintln!("       stratum run OUTPUT [args...]");
            ExitCode::FAILURE
        }
    }
}

fn compile_cmd(args: &[String]) -> ExitCode {
    let mut source = None;
    let mut output = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-o" => {
                i += 1;
                match args.get(i) {
                    Some(path) => output = Some(path.clone()),
                    None => {
                        eprintln!("error: -o requires an argument");
                        return ExitCode::FAILURE;
                    }
                }
            }
            other => source = Some(other.to_owned()),
        }
        i += 1;
    }
    let (Some(source), Some(output)) = (source, output) else {
        eprintln!("usage: stratum compile SOURCE -o OUTPUT");
        return ExitCode::FAILURE;
    };

    let mut interner = Interner::new();
    let mut units = HashMap::new();
    let entry = match load_module_graph(Path::new(&source), &mut interner, &mut units) {
        Ok(entry) => entry,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let compiled = match compile_program(entry, units, &mut interner) {
        Ok(cm) => cm,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let bytes = bytefmt::write_module(&compiled, &interner);
    if let Err(err) = fs::write(&output, bytes) {
        eprintln!("error writing {output}: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run_cmd(args: &[String]) -> ExitCode {
    let Some(input) = args.first() else {
        eprintln!("usage: stratum run OUTPUT [args...]");
        return ExitCode::FAILURE;
    };
    let program_args: Vec<String> = args[1..].to_vec();

    let bytes = match fs::read(input) {
        Ok(b) => b,
        Err(err) => {
            eprintln!("error reading {input}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let loaded = match bytefmt::read_module(&bytes) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let program: LoadedProgram = loaded.into();
    let mut vm = Vm::with_argv(program, program_args);
    match vm.run() {
        Ok(code) => {
            print!("{}", vm.stdout);
            let truncated = i32::try_from(code).unwrap_or(if code < 0 { i32::MIN } else { i32::MAX });
            std::process::exit(truncated);
        }
        Err(err) => {
            print!("{}", vm.stdout);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Parses `entry_path` and every module it (transitively) imports, resolving
/// each `import name` to a sibling file `name.stratum` next to `entry_path`
/// (spec.md §6's file-I/O boundary lives in the driver, not the core crate).
fn load_module_graph(entry_path: &Path, interner: &mut Interner, units: &mut HashMap<StringId, ast::Module>) -> Result<StringId, String> {
    let dir = entry_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let entry_stem = entry_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("bad source path: {}", entry_path.display()))?;
    let entry_name = interner.intern(entry_stem);

    let mut pending: Vec<(StringId, PathBuf)> = vec![(entry_name, entry_path.to_path_buf())];
    while let Some((name, path)) = pending.pop() {
        if units.contains_key(&name) {
            continue;
        }
        let src = fs::read_to_string(&path).map_err(|e| format!("reading {}: {e}", path.display()))?;
        let module = Parser::new(&src, interner).parse_module().map_err(|e| e.to_string())?;
        for imp in &module.imports {
            if !units.contains_key(&imp.module_name) {
                let file_name = format!("{}.stratum", interner.resolve(imp.module_name));
                pending.push((imp.module_name, dir.join(file_name)));
            }
        }
        units.insert(name, module);
    }
    Ok(entry_name)
}
