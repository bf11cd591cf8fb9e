//! Binary format decoder.
//!
//! Reads `.wasm` bytes into a [`module::Module`]. Every section is framed
//! (id byte, LEB128 size); the type, function, and data sections are
//! decoded into structured form, everything else is captured as an opaque
//! payload. The type section decoder understands the GC proposal's
//! recursion groups, subtype chains, and composite bodies.

pub mod encoding;
pub mod module;
pub mod reader;

use encoding::*;
use module::{
    AbsHeapType, CompositeType, Data, DataMode, DataSection, FieldType, Function, FunctionSection,
    FunctionType, HeapType, Module, Mutability, PackType, RawSection, RefType, SectionPosition,
    StorageType, SubType, TypeSection, ValType,
};
use reader::Reader;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed magic header")]
    MalformedMagic,
    #[error("malformed version")]
    MalformedVersion,
    #[error("malformed type sort: {0:#04x}")]
    MalformedSort(u8),
    #[error("malformed section: {0}")]
    MalformedSection(String),
    #[error("malformed value type: {0:#04x}")]
    MalformedValType(u8),
    #[error("component model is not supported")]
    Terminated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parses a WebAssembly binary into a [`Module`].
pub fn parse(name: &str, bytes: &mut Reader) -> Result<Module, ParseError> {
    let mut module = Module::new(name);

    read_header(bytes, &mut module)?;

    while bytes.has_at_least(1) {
        let sec_id = bytes.read_byte()?;
        let sec_len = bytes.read_vu32()? as usize;

        if !bytes.has_at_least(sec_len) {
            return Err(ParseError::MalformedSection(format!(
                "not enough bytes left for section {}, expected {}, got {}",
                sec_id,
                sec_len,
                bytes.remaining()
            )));
        }

        let start = bytes.pos();
        let end = start + sec_len;

        match sec_id {
            SECTION_TYPE => {
                read_section_type(bytes, &mut module.types)?;
                module.types.position = SectionPosition::new(start as u32, end as u32);
            }
            SECTION_FUNCTION => {
                read_section_function(bytes, &mut module.functions, module.types.len())?;
                module.functions.position = SectionPosition::new(start as u32, end as u32);
            }
            SECTION_DATA => {
                read_section_data(bytes, &mut module.data)?;
                module.data.position = SectionPosition::new(start as u32, end as u32);
            }
            SECTION_CUSTOM => {
                let payload = bytes.read_bytes(sec_len)?;
                let name = Reader::new(payload.clone()).read_string().ok();
                module.raw_sections.push(RawSection {
                    id: sec_id,
                    name,
                    bytes: payload,
                });
            }
            SECTION_IMPORT | SECTION_TABLE | SECTION_MEMORY | SECTION_GLOBAL | SECTION_EXPORT
            | SECTION_START | SECTION_ELEMENT | SECTION_CODE | SECTION_DATA_COUNT => {
                let payload = bytes.read_bytes(sec_len)?;
                module.raw_sections.push(RawSection {
                    id: sec_id,
                    name: None,
                    bytes: payload,
                });
            }
            _ => {
                return Err(ParseError::MalformedSection(format!(
                    "unknown section id {sec_id}"
                )));
            }
        }

        if bytes.pos() != end {
            return Err(ParseError::MalformedSection(format!(
                "section {} size mismatch: declared {}, consumed {}",
                sec_id,
                sec_len,
                bytes.pos() - start
            )));
        }
    }

    Ok(module)
}

fn read_header(bytes: &mut Reader, module: &mut Module) -> Result<(), ParseError> {
    let magic = bytes.read_bytes(4).map_err(|_| ParseError::MalformedMagic)?;
    if magic != MAGIC {
        return Err(ParseError::MalformedMagic);
    }
    let version = bytes
        .read_bytes(4)
        .map_err(|_| ParseError::MalformedVersion)?;
    if version == COMPONENT_VERSION {
        log::warn!("component preamble recognized; component model sections are not supported");
        return Err(ParseError::Terminated);
    }
    if version != MODULE_VERSION {
        return Err(ParseError::MalformedVersion);
    }

    module.magic = u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]);
    module.version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    Ok(())
}

// ===========================================================================
// Type encodings
// ===========================================================================

fn abs_heap_type_from(byte: u8) -> Option<AbsHeapType> {
    match byte {
        HEAP_ANY => Some(AbsHeapType::Any),
        HEAP_EQ => Some(AbsHeapType::Eq),
        HEAP_I31 => Some(AbsHeapType::I31),
        HEAP_STRUCT => Some(AbsHeapType::Struct),
        HEAP_ARRAY => Some(AbsHeapType::Array),
        HEAP_NONE => Some(AbsHeapType::None),
        HEAP_FUNC => Some(AbsHeapType::Func),
        HEAP_NOFUNC => Some(AbsHeapType::NoFunc),
        HEAP_EXTERN => Some(AbsHeapType::Extern),
        HEAP_NOEXTERN => Some(AbsHeapType::NoExtern),
        _ => None,
    }
}

fn read_heap_type(bytes: &mut Reader) -> Result<HeapType, ParseError> {
    let byte = bytes.peek_byte()?;
    if let Some(code) = abs_heap_type_from(byte) {
        bytes.read_byte()?;
        return Ok(HeapType::Abstract(code));
    }
    let index = bytes.read_vs33()?;
    if index < 0 {
        return Err(ParseError::MalformedValType(byte));
    }
    Ok(HeapType::Defined(index as u32))
}

fn read_val_type(bytes: &mut Reader) -> Result<ValType, ParseError> {
    let byte = bytes.read_byte()?;
    match byte {
        VT_I32 => Ok(ValType::I32),
        VT_I64 => Ok(ValType::I64),
        VT_F32 => Ok(ValType::F32),
        VT_F64 => Ok(ValType::F64),
        VT_V128 => Ok(ValType::V128),
        REF_NULLABLE => Ok(ValType::Ref(RefType::nullable(read_heap_type(bytes)?))),
        REF_NON_NULLABLE => Ok(ValType::Ref(RefType::non_nullable(read_heap_type(bytes)?))),
        _ => match abs_heap_type_from(byte) {
            // Shorthand: a bare abstract heap-type code is a nullable ref.
            Some(code) => Ok(ValType::Ref(RefType::nullable(HeapType::Abstract(code)))),
            None => Err(ParseError::MalformedValType(byte)),
        },
    }
}

fn read_storage_type(bytes: &mut Reader) -> Result<StorageType, ParseError> {
    match bytes.peek_byte()? {
        PACK_I8 => {
            bytes.read_byte()?;
            Ok(StorageType::Packed(PackType::I8))
        }
        PACK_I16 => {
            bytes.read_byte()?;
            Ok(StorageType::Packed(PackType::I16))
        }
        _ => Ok(StorageType::Val(read_val_type(bytes)?)),
    }
}

fn read_field_type(bytes: &mut Reader) -> Result<FieldType, ParseError> {
    let storage = read_storage_type(bytes)?;
    let mutability = match bytes.read_byte()? {
        MUT_CONST => Mutability::Const,
        MUT_VAR => Mutability::Var,
        byte => return Err(ParseError::MalformedValType(byte)),
    };
    Ok(FieldType::new(storage, mutability))
}

fn read_result_types(bytes: &mut Reader) -> Result<Vec<ValType>, ParseError> {
    let count = bytes.read_vu32()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(read_val_type(bytes)?);
    }
    Ok(types)
}

fn read_composite_type(bytes: &mut Reader) -> Result<CompositeType, ParseError> {
    let byte = bytes.read_byte()?;
    match byte {
        TYPE_ARRAY => Ok(CompositeType::Array(read_field_type(bytes)?)),
        TYPE_STRUCT => {
            let count = bytes.read_vu32()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                fields.push(read_field_type(bytes)?);
            }
            Ok(CompositeType::Struct(fields))
        }
        TYPE_FUNC => {
            let parameters = read_result_types(bytes)?;
            let return_types = read_result_types(bytes)?;
            Ok(CompositeType::Func(FunctionType {
                parameters,
                return_types,
            }))
        }
        _ => Err(ParseError::MalformedSort(byte)),
    }
}

fn read_sub_type(bytes: &mut Reader) -> Result<SubType, ParseError> {
    match bytes.peek_byte()? {
        marker @ (TYPE_SUB | TYPE_SUB_FINAL) => {
            bytes.read_byte()?;
            let count = bytes.read_vu32()?;
            let mut supertypes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                supertypes.push(bytes.read_vu32()?);
            }
            Ok(SubType {
                is_final: marker == TYPE_SUB_FINAL,
                supertypes,
                composite: read_composite_type(bytes)?,
            })
        }
        _ => Ok(SubType::from_composite(read_composite_type(bytes)?)),
    }
}

// ===========================================================================
// Section readers
// ===========================================================================

fn read_section_type(bytes: &mut Reader, types: &mut TypeSection) -> Result<(), ParseError> {
    let count = bytes.read_vu32()?;

    for _ in 0..count {
        if bytes.peek_byte()? == TYPE_REC {
            bytes.read_byte()?;
            let size = bytes.read_vu32()?;
            let mut group = Vec::with_capacity(size as usize);
            for _ in 0..size {
                group.push(read_sub_type(bytes)?);
            }
            types.push_group(group);
        } else {
            types.push_group(vec![read_sub_type(bytes)?]);
        }
    }

    Ok(())
}

fn read_section_function(
    bytes: &mut Reader,
    functions: &mut FunctionSection,
    type_count: usize,
) -> Result<(), ParseError> {
    let count = bytes.read_vu32()?;

    for _ in 0..count {
        let ftype_index = bytes.read_vu32()?;
        if ftype_index as usize >= type_count {
            return Err(ParseError::MalformedSection(format!(
                "function type index out of range, expected < {type_count}, got {ftype_index}"
            )));
        }
        functions.push(Function { ftype_index });
    }

    Ok(())
}

/// Captures a constant expression as raw bytes, terminator included.
fn read_const_expr(bytes: &mut Reader) -> Result<Vec<u8>, ParseError> {
    let start = bytes.pos();
    loop {
        let opcode = bytes.read_byte()?;
        match opcode {
            OP_END => break,
            0x41 => {
                bytes.read_vs32()?;
            }
            0x42 => {
                bytes.read_vs64()?;
            }
            0x43 => {
                bytes.read_bytes(4)?;
            }
            0x44 => {
                bytes.read_bytes(8)?;
            }
            // global.get / ref.func
            0x23 | 0xD2 => {
                bytes.read_vu32()?;
            }
            // ref.null
            0xD0 => {
                read_heap_type(bytes)?;
            }
            _ => {
                return Err(ParseError::MalformedSection(format!(
                    "unsupported constant expression opcode {opcode:#04x}"
                )));
            }
        }
    }
    Ok(bytes.bytes_between(start, bytes.pos()))
}

fn read_section_data(bytes: &mut Reader, data: &mut DataSection) -> Result<(), ParseError> {
    let count = bytes.read_vu32()?;

    for _ in 0..count {
        let flags = bytes.read_vu32()?;
        let mode = match flags {
            DATA_ACTIVE => DataMode::Active {
                memory_index: 0,
                offset_expr: read_const_expr(bytes)?,
            },
            DATA_PASSIVE => DataMode::Passive,
            DATA_ACTIVE_EXPLICIT => {
                let memory_index = bytes.read_vu32()?;
                DataMode::Active {
                    memory_index,
                    offset_expr: read_const_expr(bytes)?,
                }
            }
            _ => {
                return Err(ParseError::MalformedSection(format!(
                    "invalid data segment flags: {flags}"
                )));
            }
        };
        let size = bytes.read_vu32()?;
        let init = bytes.read_bytes(size as usize)?;
        data.push(Data { mode, init });
    }

    Ok(())
}
