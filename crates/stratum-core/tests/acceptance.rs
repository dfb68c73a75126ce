//! End-to-end acceptance tests for the six concrete scenarios in spec.md §8.
//! Each drives the full pipeline a `stratum compile`/`stratum run` round
//! trip exercises: parse -> type-check -> compile -> write_module ->
//! read_module -> Vm::run, matching what the driver actually does.

use stratum_core::bytefmt;
use stratum_core::intern::Interner;
use stratum_core::vm::{LoadedProgram, Vm};

fn run(src: &str) -> (i64, String) {
    let mut interner = Interner::new();
    let compiled = stratum_core::compile_source(src, &mut interner).unwrap_or_else(|e| panic!("compile failed: {e}"));
    let bytes = bytefmt::write_module(&compiled, &interner);
    let loaded = bytefmt::read_module(&bytes).unwrap();
    let program: LoadedProgram = loaded.into();
    let mut vm = Vm::new(program);
    let code = vm.run().unwrap_or_else(|e| panic!("run failed: {e}"));
    (code, vm.stdout)
}

#[test]
fn fibonacci_of_ten_is_fifty_five() {
    let src = "def main() -> int:\n    return fib(10)\ndef fib(n: int) -> int:\n    if n < 2: return n\n    return fib(n-1) + fib(n-2)\n";
    let (code, _) = run(src);
    assert_eq!(code, 55);
}

#[test]
fn struct_field_sum_is_seven() {
    let src = "struct P:\n    x: int\n    y: int\ndef main() -> int:\n    let p: P = P{x: 3, y: 4}\n    return p.x + p.y\n";
    let (code, _) = run(src);
    assert_eq!(code, 7);
}

#[test]
fn thrown_exception_is_caught_and_printed() {
    let src = "def main() -> int:\n    try:\n        throw \"boom\"\n    catch e:\n        print(e)\n    return 0\n";
    let (code, stdout) = run(src);
    assert!(stdout.contains("boom\n"));
    assert_eq!(code, 0);
}

#[test]
fn map_insertion_updates_its_length() {
    let src = "def main() -> int:\n    let m: {str: int} = {\"a\": 1, \"b\": 2}\n    m[\"c\"] = 3\n    return map_len(m)\n";
    let (code, _) = run(src);
    assert_eq!(code, 3);
}

#[test]
fn array_push_then_index_sees_the_pushed_value() {
    let src = "def main() -> int:\n    let a: [int] = [1,2,3]\n    array_push(a, 4)\n    return a[3]\n";
    let (code, _) = run(src);
    assert_eq!(code, 4);
}

#[test]
fn fstring_interpolates_into_hello_world() {
    let src = "def main() -> int:\n    let name: str = \"world\"\n    print(f\"hello {name}!\")\n    return 0\n";
    let (_, stdout) = run(src);
    assert!(stdout.contains("hello world!\n"));
}
