//! Encodes a [`Module`] to WebAssembly binary format (`.wasm`).
//!
//! This is the conceptual inverse of [`crate::parser::parse`]. The type
//! section is emitted from its semantic form (recursion groups, subtype
//! chains, composite bodies); sections that the parser captured as raw
//! payloads are written back verbatim.
//!
//! # Canonical form
//!
//! The encoder produces minimal LEB128 for all integers, unwraps singleton
//! recursion groups (no `rec` prefix), and uses the shorthand byte for
//! nullable abstract reference types. Parsing a canonical binary and
//! re-encoding it reproduces the input bytes.

use std::fmt;

use crate::parser::encoding::{
    write_vu32, write_vs33, DATA_ACTIVE, DATA_ACTIVE_EXPLICIT, DATA_PASSIVE, HEAP_ANY, HEAP_ARRAY,
    HEAP_EQ, HEAP_EXTERN, HEAP_FUNC, HEAP_I31, HEAP_NOEXTERN, HEAP_NOFUNC, HEAP_NONE, HEAP_STRUCT,
    MAGIC, MODULE_VERSION, MUT_CONST, MUT_VAR, PACK_I16, PACK_I8, REF_NON_NULLABLE, REF_NULLABLE,
    SECTION_CODE, SECTION_DATA, SECTION_DATA_COUNT, SECTION_ELEMENT, SECTION_EXPORT,
    SECTION_FUNCTION, SECTION_GLOBAL, SECTION_IMPORT, SECTION_MEMORY, SECTION_START, SECTION_TABLE,
    SECTION_TYPE, TYPE_ARRAY, TYPE_FUNC, TYPE_REC, TYPE_STRUCT, TYPE_SUB, TYPE_SUB_FINAL,
    VT_F32, VT_F64, VT_I32, VT_I64, VT_V128,
};
use crate::parser::module::{
    AbsHeapType, CompositeType, DataMode, FieldType, HeapType, Module, Mutability, PackType,
    StorageType, SubType, ValType,
};

// ===========================================================================
// Error type
// ===========================================================================

/// Errors that can occur during binary encoding.
#[derive(Debug)]
pub enum EncodeError {
    /// The type section's recursion-group sizes do not cover its type list.
    InconsistentRecGroups { covered: usize, total: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::InconsistentRecGroups { covered, total } => {
                write!(
                    f,
                    "recursion groups cover {covered} of {total} type entries"
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

// ===========================================================================
// Public API
// ===========================================================================

/// Encodes a WebAssembly module to binary format.
///
/// The inverse of [`crate::parser::parse`].
pub fn encode(module: &Module) -> Result<Vec<u8>, EncodeError> {
    let covered: usize = module.types.rec_sizes.iter().map(|&n| n as usize).sum();
    if covered != module.types.len() {
        return Err(EncodeError::InconsistentRecGroups {
            covered,
            total: module.types.len(),
        });
    }

    let mut buf = Vec::new();

    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&MODULE_VERSION);

    // Sections in wire order; raw-captured sections slot in by id.
    encode_type_section(&mut buf, module);
    encode_raw_sections(&mut buf, module, SECTION_IMPORT);
    encode_function_section(&mut buf, module);
    encode_raw_sections(&mut buf, module, SECTION_TABLE);
    encode_raw_sections(&mut buf, module, SECTION_MEMORY);
    encode_raw_sections(&mut buf, module, SECTION_GLOBAL);
    encode_raw_sections(&mut buf, module, SECTION_EXPORT);
    encode_raw_sections(&mut buf, module, SECTION_START);
    encode_raw_sections(&mut buf, module, SECTION_ELEMENT);
    encode_raw_sections(&mut buf, module, SECTION_DATA_COUNT);
    encode_raw_sections(&mut buf, module, SECTION_CODE);
    encode_data_section(&mut buf, module);
    encode_raw_sections(&mut buf, module, 0);

    Ok(buf)
}

/// Writes a section header and length-prefixed payload.
fn write_section(buf: &mut Vec<u8>, id: u8, payload: &[u8]) {
    buf.push(id);
    write_vu32(buf, payload.len() as u32);
    buf.extend_from_slice(payload);
}

fn encode_raw_sections(buf: &mut Vec<u8>, module: &Module, id: u8) {
    for section in module.raw_sections.iter().filter(|s| s.id == id) {
        write_section(buf, id, &section.bytes);
    }
}

// ===========================================================================
// Type section
// ===========================================================================

fn encode_type_section(buf: &mut Vec<u8>, module: &Module) {
    if module.types.is_empty() {
        return;
    }

    let mut payload = Vec::new();
    write_vu32(&mut payload, module.types.rec_sizes.len() as u32);
    for (_, group) in module.types.groups() {
        if group.len() > 1 {
            payload.push(TYPE_REC);
            write_vu32(&mut payload, group.len() as u32);
        }
        for subtype in group {
            write_sub_type(&mut payload, subtype);
        }
    }

    write_section(buf, SECTION_TYPE, &payload);
}

fn write_sub_type(buf: &mut Vec<u8>, subtype: &SubType) {
    if !subtype.is_final || !subtype.supertypes.is_empty() {
        buf.push(if subtype.is_final { TYPE_SUB_FINAL } else { TYPE_SUB });
        write_vu32(buf, subtype.supertypes.len() as u32);
        for &index in &subtype.supertypes {
            write_vu32(buf, index);
        }
    }
    write_composite_type(buf, &subtype.composite);
}

fn write_composite_type(buf: &mut Vec<u8>, composite: &CompositeType) {
    match composite {
        CompositeType::Array(field) => {
            buf.push(TYPE_ARRAY);
            write_field_type(buf, field);
        }
        CompositeType::Struct(fields) => {
            buf.push(TYPE_STRUCT);
            write_vu32(buf, fields.len() as u32);
            for field in fields {
                write_field_type(buf, field);
            }
        }
        CompositeType::Func(ftype) => {
            buf.push(TYPE_FUNC);
            write_vu32(buf, ftype.parameters.len() as u32);
            for param in &ftype.parameters {
                write_val_type(buf, param);
            }
            write_vu32(buf, ftype.return_types.len() as u32);
            for ret in &ftype.return_types {
                write_val_type(buf, ret);
            }
        }
    }
}

fn write_field_type(buf: &mut Vec<u8>, field: &FieldType) {
    write_storage_type(buf, &field.storage);
    buf.push(match field.mutability {
        Mutability::Const => MUT_CONST,
        Mutability::Var => MUT_VAR,
    });
}

fn write_storage_type(buf: &mut Vec<u8>, storage: &StorageType) {
    match storage {
        StorageType::Packed(PackType::I8) => buf.push(PACK_I8),
        StorageType::Packed(PackType::I16) => buf.push(PACK_I16),
        StorageType::Val(vt) => write_val_type(buf, vt),
    }
}

fn write_val_type(buf: &mut Vec<u8>, vt: &ValType) {
    match vt {
        ValType::I32 => buf.push(VT_I32),
        ValType::I64 => buf.push(VT_I64),
        ValType::F32 => buf.push(VT_F32),
        ValType::F64 => buf.push(VT_F64),
        ValType::V128 => buf.push(VT_V128),
        ValType::Ref(rt) => match rt.heap {
            // Canonical shorthand for nullable abstract references.
            HeapType::Abstract(code) if rt.nullable => buf.push(abs_heap_type_byte(code)),
            _ => {
                buf.push(if rt.nullable { REF_NULLABLE } else { REF_NON_NULLABLE });
                write_heap_type(buf, &rt.heap);
            }
        },
    }
}

fn write_heap_type(buf: &mut Vec<u8>, heap: &HeapType) {
    match heap {
        HeapType::Abstract(code) => buf.push(abs_heap_type_byte(*code)),
        HeapType::Defined(index) => write_vs33(buf, *index),
    }
}

fn abs_heap_type_byte(code: AbsHeapType) -> u8 {
    match code {
        AbsHeapType::Any => HEAP_ANY,
        AbsHeapType::Eq => HEAP_EQ,
        AbsHeapType::I31 => HEAP_I31,
        AbsHeapType::Struct => HEAP_STRUCT,
        AbsHeapType::Array => HEAP_ARRAY,
        AbsHeapType::None => HEAP_NONE,
        AbsHeapType::Func => HEAP_FUNC,
        AbsHeapType::NoFunc => HEAP_NOFUNC,
        AbsHeapType::Extern => HEAP_EXTERN,
        AbsHeapType::NoExtern => HEAP_NOEXTERN,
    }
}

// ===========================================================================
// Function and data sections
// ===========================================================================

fn encode_function_section(buf: &mut Vec<u8>, module: &Module) {
    if module.functions.functions.is_empty() {
        return;
    }

    let mut payload = Vec::new();
    write_vu32(&mut payload, module.functions.functions.len() as u32);
    for function in &module.functions.functions {
        write_vu32(&mut payload, function.ftype_index);
    }

    write_section(buf, SECTION_FUNCTION, &payload);
}

fn encode_data_section(buf: &mut Vec<u8>, module: &Module) {
    if module.data.data.is_empty() {
        return;
    }

    let mut payload = Vec::new();
    write_vu32(&mut payload, module.data.data.len() as u32);
    for segment in &module.data.data {
        match &segment.mode {
            DataMode::Active {
                memory_index: 0,
                offset_expr,
            } => {
                write_vu32(&mut payload, DATA_ACTIVE);
                payload.extend_from_slice(offset_expr);
            }
            DataMode::Active {
                memory_index,
                offset_expr,
            } => {
                write_vu32(&mut payload, DATA_ACTIVE_EXPLICIT);
                write_vu32(&mut payload, *memory_index);
                payload.extend_from_slice(offset_expr);
            }
            DataMode::Passive => {
                write_vu32(&mut payload, DATA_PASSIVE);
            }
        }
        write_vu32(&mut payload, segment.init.len() as u32);
        payload.extend_from_slice(&segment.init);
    }

    write_section(buf, SECTION_DATA, &payload);
}
