//! Hand-rolled binary module format reader/writer. See spec.md §4.5, §6.
//!
//! Deliberately not serde/bincode/postcard: the wire format is a fixed,
//! versioned little-endian layout the VM can map almost directly onto its
//! in-memory `Code` buffers, the same way the teacher's own compiled
//! artifacts are a purpose-built byte layout rather than a serde blob.
//!
//! Layout (all multi-byte integers little-endian):
//! ```text
//! magic:        4 bytes, b"STRM"
//! version:      u16
//! string_pool:  u32 count, then count * (u32 len, bytes)
//! struct_table: u32 count, then count * (u32 name_id, u16 field_count, field_count * u32 name_id)
//! class_table:  u32 count, then count * (u32 name_id, i32 parent_index (-1 = none),
//!                                        u16 field_count, field_count * u32 name_id,
//!                                        u16 method_count, method_count * (u32 name_id, u32 fn_index))
//! function_table: u32 count, then count * (u32 name_id, u16 num_params, u16 num_locals, u16 max_stack,
//!                                           u32 int_const_count, int_const_count * i64,
//!                                           u32 float_const_count, float_const_count * f64,
//!                                           u32 str_const_count, str_const_count * u32 (string-pool index),
//!                                           u32 bytecode_len, bytecode bytes)
//! num_globals:  u16
//! init_function: u32
//! entry_index:  i32 (-1 = none)
//! ```

use crate::compiler::CompiledModule;
use crate::diagnostics::LinkError;
use crate::intern::Interner;

const MAGIC: &[u8; 4] = b"STRM";
const VERSION: u16 = 1;

pub fn write_module(module: &CompiledModule, interner: &Interner) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());

    let strings: Vec<&str> = interner.iter().collect();
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    for s in &strings {
        let bytes = s.as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }

    out.extend_from_slice(&(module.structs.len() as u32).to_le_bytes());
    for s in &module.structs {
        out.extend_from_slice(&s.name.0.to_le_bytes());
        out.extend_from_slice(&(s.field_names.len() as u16).to_le_bytes());
        for f in &s.field_names {
            out.extend_from_slice(&f.0.to_le_bytes());
        }
    }

    out.extend_from_slice(&(module.classes.len() as u32).to_le_bytes());
    for c in &module.classes {
        out.extend_from_slice(&c.name.0.to_le_bytes());
        let parent: i32 = c.parent_index.map_or(-1, |p| p as i32);
        out.extend_from_slice(&parent.to_le_bytes());
        out.extend_from_slice(&(c.field_names.len() as u16).to_le_bytes());
        for f in &c.field_names {
            out.extend_from_slice(&f.0.to_le_bytes());
        }
        out.extend_from_slice(&(c.methods.len() as u16).to_le_bytes());
        for (name, idx) in &c.methods {
            out.extend_from_slice(&name.0.to_le_bytes());
            out.extend_from_slice(&idx.to_le_bytes());
        }
    }

    out.extend_from_slice(&(module.functions.len() as u32).to_le_bytes());
    for f in &module.functions {
        out.extend_from_slice(&f.name.0.to_le_bytes());
        out.extend_from_slice(&f.code.num_params.to_le_bytes());
        out.extend_from_slice(&f.code.num_locals.to_le_bytes());
        out.extend_from_slice(&f.code.max_stack.to_le_bytes());
        out.extend_from_slice(&(f.code.int_consts.len() as u32).to_le_bytes());
        for v in &f.code.int_consts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(f.code.float_consts.len() as u32).to_le_bytes());
        for v in &f.code.float_consts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(f.code.str_const_ids.len() as u32).to_le_bytes());
        for v in &f.code.str_const_ids {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(f.code.bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&f.code.bytecode);
    }

    out.extend_from_slice(&module.num_globals.to_le_bytes());
    out.extend_from_slice(&module.init_function.to_le_bytes());
    let entry: i32 = module.entry_function.map_or(-1, |i| i as i32);
    out.extend_from_slice(&entry.to_le_bytes());

    out
}

pub struct LoadedFunction {
    pub name_id: u32,
    pub code: crate::bytecode::Code,
}

pub struct LoadedStruct {
    pub name_id: u32,
    pub field_name_ids: Vec<u32>,
}

pub struct LoadedClass {
    pub name_id: u32,
    pub parent_index: Option<u32>,
    pub field_name_ids: Vec<u32>,
    pub methods: Vec<(u32, u32)>,
}

pub struct LoadedModule {
    pub strings: Vec<String>,
    pub structs: Vec<LoadedStruct>,
    pub classes: Vec<LoadedClass>,
    pub functions: Vec<LoadedFunction>,
    pub num_globals: u16,
    pub init_function: u32,
    pub entry_function: Option<u32>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LinkError> {
        let end = self.pos + n;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| LinkError { message: "truncated module file".to_owned() })?;
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, LinkError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, LinkError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, LinkError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, LinkError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, LinkError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

pub fn read_module(bytes: &[u8]) -> Result<LoadedModule, LinkError> {
    let mut r = Reader::new(bytes);
    if r.take(4)? != MAGIC {
        return Err(LinkError { message: "bad magic number: not a Stratum module".to_owned() });
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(LinkError { message: format!("unsupported module version {version}") });
    }

    let string_count = r.u32()? as usize;
    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        let len = r.u32()? as usize;
        let bytes = r.take(len)?;
        strings.push(String::from_utf8(bytes.to_vec()).map_err(|_| LinkError { message: "invalid utf-8 in string pool".to_owned() })?);
    }
    let validate_str_id = |id: u32, strings: &[String]| -> Result<(), LinkError> {
        if (id as usize) >= strings.len() {
            Err(LinkError { message: format!("string constant index {id} out of range") })
        } else {
            Ok(())
        }
    };

    let struct_count = r.u32()? as usize;
    let mut structs = Vec::with_capacity(struct_count);
    for _ in 0..struct_count {
        let name_id = r.u32()?;
        validate_str_id(name_id, &strings)?;
        let field_count = r.u16()? as usize;
        let mut field_name_ids = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let id = r.u32()?;
            validate_str_id(id, &strings)?;
            field_name_ids.push(id);
        }
        structs.push(LoadedStruct { name_id, field_name_ids });
    }

    let class_count = r.u32()? as usize;
    let mut classes = Vec::with_capacity(class_count);
    for _ in 0..class_count {
        let name_id = r.u32()?;
        validate_str_id(name_id, &strings)?;
        let parent_raw = r.i32()?;
        let parent_index = if parent_raw < 0 { None } else { Some(parent_raw as u32) };
        let field_count = r.u16()? as usize;
        let mut field_name_ids = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let id = r.u32()?;
            validate_str_id(id, &strings)?;
            field_name_ids.push(id);
        }
        let method_count = r.u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let name_id = r.u32()?;
            validate_str_id(name_id, &strings)?;
            let idx = r.u32()?;
            methods.push((name_id, idx));
        }
        classes.push(LoadedClass { name_id, parent_index, field_name_ids, methods });
    }

    let func_count = r.u32()? as usize;
    let mut functions = Vec::with_capacity(func_count);
    for _ in 0..func_count {
        let name_id = r.u32()?;
        validate_str_id(name_id, &strings)?;
        let num_params = r.u16()?;
        let num_locals = r.u16()?;
        let max_stack = r.u16()?;
        let int_count = r.u32()? as usize;
        let mut int_consts = Vec::with_capacity(int_count);
        for _ in 0..int_count {
            int_consts.push(r.i64()?);
        }
        let float_count = r.u32()? as usize;
        let mut float_consts = Vec::with_capacity(float_count);
        for _ in 0..float_count {
            float_consts.push(r.f64()?);
        }
        let str_count = r.u32()? as usize;
        let mut str_const_ids = Vec::with_capacity(str_count);
        for _ in 0..str_count {
            let id = r.u32()?;
            validate_str_id(id, &strings)?;
            str_const_ids.push(id);
        }
        let code_len = r.u32()? as usize;
        let bytecode = r.take(code_len)?.to_vec();
        functions.push(LoadedFunction {
            name_id,
            code: crate::bytecode::Code { bytecode, int_consts, float_consts, str_const_ids, num_locals, max_stack, num_params },
        });
    }

    let num_globals = r.u16()?;
    let init_function = r.u32()?;
    let entry_raw = r.i32()?;
    let entry_function = if entry_raw < 0 { None } else { Some(entry_raw as u32) };

    Ok(LoadedModule { strings, structs, classes, functions, num_globals, init_function, entry_function })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompiledClass, CompiledFunction, CompiledStruct};
    use crate::bytecode::Code;

    #[test]
    fn round_trips_a_minimal_module() {
        let mut interner = Interner::new();
        let main_name = interner.intern("main");
        let module = CompiledModule {
            functions: vec![CompiledFunction {
                name: main_name,
                code: Code { bytecode: vec![3, 48], int_consts: vec![], float_consts: vec![], str_const_ids: vec![], num_locals: 0, max_stack: 1, num_params: 0 },
                call_patches: vec![],
                global_patches: vec![],
            }],
            structs: Vec::<CompiledStruct>::new(),
            classes: Vec::<CompiledClass>::new(),
            num_globals: 0,
            init_function: 0,
            entry_function: Some(0),
        };
        let bytes = write_module(&module, &interner);
        let loaded = read_module(&bytes).unwrap();
        assert_eq!(loaded.functions.len(), 1);
        assert_eq!(loaded.functions[0].code.bytecode, vec![3, 48]);
        assert_eq!(loaded.strings[main_name.0 as usize], "main");
        assert_eq!(loaded.entry_function, Some(0));
    }

    #[test]
    fn rejects_bad_magic() {
        let err = read_module(&[0, 0, 0, 0]).unwrap_err();
        assert!(err.message.contains("magic"));
    }
}
