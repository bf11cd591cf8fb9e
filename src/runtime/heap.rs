//! Heap object store for struct and array instances.
//!
//! The store is the single owner of every allocated object. Allocation is
//! serialized under a mutex so host-side threads cannot race on the
//! growable backing vectors; the returned shared handle is the stable
//! object pointer for the object's lifetime. Reference values clone the
//! handle, which keeps the object resident while any live reference can
//! still reach it. Dropping the heap releases the store's owning handles.
//!
//! Field mutation on a shared object is serialized per object; cross-field
//! ordering between mutators is the caller's responsibility.

use crate::parser::module::{CompositeType, FieldType, StorageType};
use crate::runtime::value::Value;
use crate::runtime::RuntimeError;
use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedStruct = Arc<Mutex<StructInstance>>;
pub type SharedArray = Arc<Mutex<ArrayInstance>>;

/// Recovers the guard from a poisoned lock; instance state is plain data
/// and stays consistent across panics in field code.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An allocated struct. The composite type is fixed at allocation; the
/// data vector always has exactly one slot per declared field.
#[derive(Debug)]
pub struct StructInstance {
    type_index: u32,
    storages: Vec<StorageType>,
    data: Vec<Value>,
}

impl StructInstance {
    /// The defining type's index in the owning module's type list.
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn field_count(&self) -> u32 {
        self.data.len() as u32
    }

    /// Get field data in struct instance.
    pub fn get_data(&self, index: u32) -> Result<&Value, RuntimeError> {
        self.data
            .get(index as usize)
            .ok_or(RuntimeError::FieldIndexOutOfBounds(index))
    }

    pub fn set_data(&mut self, index: u32, value: Value) -> Result<(), RuntimeError> {
        match self.data.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::FieldIndexOutOfBounds(index)),
        }
    }

    /// Get field storage type in struct type.
    pub fn storage(&self, index: u32) -> Result<&StorageType, RuntimeError> {
        self.storages
            .get(index as usize)
            .ok_or(RuntimeError::FieldIndexOutOfBounds(index))
    }
}

/// An allocated array. The element type is fixed at allocation; the data
/// vector has exactly the stored length.
#[derive(Debug)]
pub struct ArrayInstance {
    type_index: u32,
    storage: StorageType,
    data: Vec<Value>,
}

impl ArrayInstance {
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Get array length.
    pub fn length(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn get_data(&self, index: u32) -> Result<&Value, RuntimeError> {
        self.data
            .get(index as usize)
            .ok_or(RuntimeError::LengthOutOfBounds)
    }

    pub fn set_data(&mut self, index: u32, value: Value) -> Result<(), RuntimeError> {
        match self.data.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::LengthOutOfBounds),
        }
    }

    /// Get element storage type in array type.
    pub fn storage(&self) -> &StorageType {
        &self.storage
    }
}

/// The heap object store.
///
/// Scoped per engine instance; no process-global state. Objects allocated
/// here are destroyed with the heap unless a reference still co-owns them.
#[derive(Debug, Default)]
pub struct Heap {
    structs: Mutex<Vec<SharedStruct>>,
    arrays: Mutex<Vec<SharedArray>>,
}

fn struct_fields(composite: &CompositeType) -> Result<&[FieldType], RuntimeError> {
    match composite {
        CompositeType::Struct(_) => Ok(composite.field_types()),
        other => Err(RuntimeError::TypeMismatch {
            expected: "struct type".to_string(),
            actual: format!("{other}"),
        }),
    }
}

fn array_storage(composite: &CompositeType) -> Result<StorageType, RuntimeError> {
    match composite {
        CompositeType::Array(field) => Ok(field.storage),
        other => Err(RuntimeError::TypeMismatch {
            expected: "array type".to_string(),
            actual: format!("{other}"),
        }),
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    /// Allocates a struct with default-initialized fields: numeric zero,
    /// null reference.
    pub fn new_struct(
        &self,
        type_index: u32,
        composite: &CompositeType,
    ) -> Result<SharedStruct, RuntimeError> {
        let fields = struct_fields(composite)?;
        let data = fields
            .iter()
            .map(|field| Value::default_for(&field.storage))
            .collect();
        Ok(self.publish_struct(StructInstance {
            type_index,
            storages: fields.iter().map(|field| field.storage).collect(),
            data,
        }))
    }

    /// Allocates a struct from explicit field values. The values must
    /// already be packed for their storage types.
    pub fn new_struct_with(
        &self,
        type_index: u32,
        composite: &CompositeType,
        values: Vec<Value>,
    ) -> Result<SharedStruct, RuntimeError> {
        let fields = struct_fields(composite)?;
        if values.len() != fields.len() {
            return Err(RuntimeError::TypeMismatch {
                expected: format!("{} field values", fields.len()),
                actual: format!("{}", values.len()),
            });
        }
        Ok(self.publish_struct(StructInstance {
            type_index,
            storages: fields.iter().map(|field| field.storage).collect(),
            data: values,
        }))
    }

    /// Allocates a default-initialized array of the given length.
    pub fn new_array(
        &self,
        type_index: u32,
        composite: &CompositeType,
        length: u32,
    ) -> Result<SharedArray, RuntimeError> {
        let storage = array_storage(composite)?;
        let init = Value::default_for(&storage);
        Ok(self.publish_array(ArrayInstance {
            type_index,
            storage,
            data: vec![init; length as usize],
        }))
    }

    /// Allocates an array of the given length with every element set to
    /// `init` (already packed).
    pub fn new_array_splat(
        &self,
        type_index: u32,
        composite: &CompositeType,
        length: u32,
        init: Value,
    ) -> Result<SharedArray, RuntimeError> {
        let storage = array_storage(composite)?;
        Ok(self.publish_array(ArrayInstance {
            type_index,
            storage,
            data: vec![init; length as usize],
        }))
    }

    /// Allocates an array from explicit element values (already packed).
    pub fn new_array_with(
        &self,
        type_index: u32,
        composite: &CompositeType,
        values: Vec<Value>,
    ) -> Result<SharedArray, RuntimeError> {
        let storage = array_storage(composite)?;
        Ok(self.publish_array(ArrayInstance {
            type_index,
            storage,
            data: values,
        }))
    }

    fn publish_struct(&self, instance: StructInstance) -> SharedStruct {
        let shared = Arc::new(Mutex::new(instance));
        lock(&self.structs).push(Arc::clone(&shared));
        shared
    }

    fn publish_array(&self, instance: ArrayInstance) -> SharedArray {
        let shared = Arc::new(Mutex::new(instance));
        lock(&self.arrays).push(Arc::clone(&shared));
        shared
    }

    pub fn struct_count(&self) -> usize {
        lock(&self.structs).len()
    }

    pub fn array_count(&self) -> usize {
        lock(&self.arrays).len()
    }
}
