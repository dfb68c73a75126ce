//! Runtime value representation. See spec.md §5.
//!
//! `Value` is a small tagged union: scalars are stored inline, everything
//! else (strings, arrays, maps, records, class instances) lives on the
//! [`crate::heap::Heap`] and is referenced by [`HeapId`].

use crate::intern::StringId;

/// A handle into the heap's object table. Stable across a GC cycle: the
/// mark-and-sweep collector (spec.md §5.3) never moves objects, it only frees
/// dead slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Heap(HeapId),
}

impl Value {
    #[must_use]
    pub fn truthy(self) -> bool {
        match self {
            Value::Int(i) => i != 0,
            Value::Float(f) => f != 0.0,
            Value::Bool(b) => b,
            Value::Null => false,
            Value::Heap(_) => true,
        }
    }

    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Heap(_) => "object",
        }
    }
}

/// Heap-allocated object payloads (spec.md §5.2). `HeapObject::mark_children`
/// (see `heap.rs`) walks the `Value`-typed fields of each variant during GC.
#[derive(Debug, Clone)]
pub enum HeapData {
    Str(Box<str>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// A struct or record literal instance: ordered field values, addressed
    /// by the struct's field index (assigned at type-check time).
    Record { type_name: StringId, fields: Vec<Value> },
    /// A class instance: fields plus the class-type index used for dynamic
    /// method dispatch and `super` resolution.
    ClassInstance { class_index: u32, fields: Vec<Value> },
    /// A bound closure value produced by a lambda literal.
    Closure { function_index: u32, captured: Vec<Value> },
}

impl HeapData {
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            HeapData::Str(_) => "str",
            HeapData::Array(_) => "array",
            HeapData::Map(_) => "map",
            HeapData::Record { .. } => "record",
            HeapData::ClassInstance { .. } => "instance",
            HeapData::Closure { .. } => "closure",
        }
    }
}
