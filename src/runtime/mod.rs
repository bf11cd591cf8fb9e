//! WebAssembly GC runtime core.
//!
//! This module provides the reference value model, the heap object store
//! for struct and array instances, the coinductive subtype matcher, and
//! the reference/GC instruction implementations that operate on the value
//! stack.

pub mod heap;
pub mod matcher;
pub mod ops;
pub mod segment;
pub mod stack;
pub mod value;

pub use heap::{ArrayInstance, Heap, SharedArray, SharedStruct, StructInstance};
pub use segment::{DataInstance, ElementInstance};
pub use stack::Stack;
pub use value::{FuncAddr, GcRef, RefValue, Value};

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("cast null reference to non-null")]
    CastNullToNonNull,
    #[error("length out of bounds")]
    LengthOutOfBounds,
    #[error("type index out of bounds: {0}")]
    TypeIndexOutOfBounds(u32),
    #[error("field index out of bounds: {0}")]
    FieldIndexOutOfBounds(u32),
}

/// Diagnostic context for a failing instruction, handed to the logger
/// alongside the error code.
#[derive(Debug, Clone, Copy)]
pub struct InstrInfo {
    pub opcode: &'static str,
    pub offset: u32,
}

impl InstrInfo {
    pub fn new(opcode: &'static str, offset: u32) -> InstrInfo {
        InstrInfo { opcode, offset }
    }
}

impl fmt::Display for InstrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset 0x{:08x}", self.opcode, self.offset)
    }
}
