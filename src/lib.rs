//! A WebAssembly GC runtime core written in Rust.
//!
//! wagc implements the type system, heap-object model, and reference
//! operation semantics of the WebAssembly GC proposal: recursion groups
//! and subtype chains, structs and arrays with packed storage, i31
//! references, extern conversions, and the coinductive subtype matcher
//! that governs runtime casts and tests.
//!
//! # Modules
//!
//! - [`parser`] -- Binary format decoder. Reads `.wasm` bytes into a
//!   [`parser::module::Module`], with full decoding of the GC type
//!   section.
//! - [`encoder`] -- Binary encoder. Serialises a `Module` back to
//!   `.wasm` bytes; canonical binaries round-trip exactly.
//! - [`runtime`] -- Reference values, the heap object store, the subtype
//!   matcher, and the `ref.*`/`struct.*`/`array.*` operations.
//!
//! # Example
//!
//! Parse a module holding a single array type and allocate an instance
//! of it:
//!
//! ```
//! use wagc::parser::{self, reader::Reader};
//! use wagc::runtime::ops::reference;
//! use wagc::runtime::{Heap, Stack, Value};
//!
//! // (module (type (array (mut i16))))
//! let bytes = vec![
//!     0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00,
//!     0x01, 0x04, 0x01, 0x5e, 0x77, 0x01,
//! ];
//! let module = parser::parse("demo", &mut Reader::new(bytes)).unwrap();
//!
//! let heap = Heap::new();
//! let mut stack = Stack::new();
//! stack.push(Value::I32(4));
//! reference::array_new_default(&mut stack, &heap, &module.types.types, 0).unwrap();
//! reference::array_len(&mut stack, &wagc::runtime::InstrInfo::new("array.len", 0)).unwrap();
//! assert_eq!(stack.pop().unwrap(), Value::I32(4));
//! ```

pub mod encoder;
pub mod parser;
pub mod runtime;
