//! Data and element segment instances.
//!
//! `array.new_data` sources packed numeric values from a data segment's
//! bytes; `array.new_elem` sources reference values from an element
//! segment. Both are bounds-checked by the operation before any value is
//! read.

use byteorder::{ByteOrder, LittleEndian};
use crate::parser::module::{PackType, StorageType, ValType};
use crate::runtime::value::{RefValue, Value};
use crate::runtime::RuntimeError;

/// A data segment's bytes, byte-addressable for array initialization.
#[derive(Debug, Default)]
pub struct DataInstance {
    data: Vec<u8>,
}

impl DataInstance {
    pub fn new(data: Vec<u8>) -> DataInstance {
        DataInstance { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Loads one element of the given storage type at a byte offset.
    ///
    /// Packed storage loads zero-extended into an i32 slot; the stored
    /// form is already packed. Reference storage cannot be sourced from
    /// bytes.
    pub fn load_value(&self, offset: u32, storage: &StorageType) -> Result<Value, RuntimeError> {
        let width = (storage.bit_width() / 8) as usize;
        let start = offset as usize;
        let bytes = self
            .data
            .get(start..start + width)
            .ok_or(RuntimeError::LengthOutOfBounds)?;

        let value = match storage {
            StorageType::Packed(PackType::I8) => Value::I32(bytes[0] as i32),
            StorageType::Packed(PackType::I16) => Value::I32(LittleEndian::read_u16(bytes) as i32),
            StorageType::Val(ValType::I32) => Value::I32(LittleEndian::read_u32(bytes) as i32),
            StorageType::Val(ValType::I64) => Value::I64(LittleEndian::read_u64(bytes) as i64),
            StorageType::Val(ValType::F32) => Value::F32(LittleEndian::read_f32(bytes)),
            StorageType::Val(ValType::F64) => Value::F64(LittleEndian::read_f64(bytes)),
            StorageType::Val(ValType::V128) => Value::V128(LittleEndian::read_u128(bytes)),
            StorageType::Val(ValType::Ref(_)) => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "numeric or vector storage".to_string(),
                    actual: format!("{storage}"),
                });
            }
        };
        Ok(value)
    }
}

/// An element segment's reference values.
#[derive(Debug, Default)]
pub struct ElementInstance {
    refs: Vec<RefValue>,
}

impl ElementInstance {
    pub fn new(refs: Vec<RefValue>) -> ElementInstance {
        ElementInstance { refs }
    }

    pub fn refs(&self) -> &[RefValue] {
        &self.refs
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
