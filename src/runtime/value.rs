//! WebAssembly value representation.
//!
//! Values are fixed-size tagged slots. Numeric variants carry their
//! natural width; the reference variant carries its runtime type and
//! either a null marker or a handle to a heap object. Copying a value is
//! a cheap handle duplication, never a deep clone.

use crate::parser::module::{AbsHeapType, HeapType, RefType, StorageType, ValType};
use crate::runtime::heap::{SharedArray, SharedStruct};
use fhex::ToHex;
use std::fmt;
use std::sync::Arc;

/// Global function address, allocated by the embedder's function space.
///
/// The instruction dispatcher resolves a module-local function index to a
/// `FuncAddr` before `ref.func` executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncAddr(pub usize);

/// Handle to a heap object.
///
/// `I31` occupies the reference payload with its value stored inline (the
/// pointer-bits scheme), so `ref.eq` and `ref.test` treat it uniformly
/// with allocated objects.
#[derive(Debug, Clone)]
pub enum GcRef {
    Struct(SharedStruct),
    Array(SharedArray),
    Func(FuncAddr),
    I31(u32),
}

impl GcRef {
    /// Pointer identity: true iff both handles designate the same object.
    pub fn same(&self, other: &GcRef) -> bool {
        match (self, other) {
            (GcRef::Struct(a), GcRef::Struct(b)) => Arc::ptr_eq(a, b),
            (GcRef::Array(a), GcRef::Array(b)) => Arc::ptr_eq(a, b),
            (GcRef::Func(a), GcRef::Func(b)) => a == b,
            (GcRef::I31(a), GcRef::I31(b)) => a == b,
            _ => false,
        }
    }
}

/// A reference value: runtime type plus payload.
///
/// The runtime type records nullability and the heap type the reference
/// was produced at; `ref.cast` and `ref.as_non_null` re-tag the type while
/// keeping the payload, so identity survives casts.
#[derive(Debug, Clone)]
pub struct RefValue {
    ty: ValType,
    payload: Option<GcRef>,
}

impl RefValue {
    /// A null reference of the given reference type.
    pub fn null(ty: ValType) -> RefValue {
        RefValue { ty, payload: None }
    }

    /// A null reference of the nullable form of the given heap type.
    pub fn null_of(heap: HeapType) -> RefValue {
        RefValue::null(ValType::Ref(RefType::nullable(heap)))
    }

    pub fn new(ty: ValType, payload: GcRef) -> RefValue {
        RefValue {
            ty,
            payload: Some(payload),
        }
    }

    /// A non-null i31 reference holding the low 31 bits of `value`.
    pub fn i31(value: u32) -> RefValue {
        RefValue::new(
            ValType::Ref(RefType::non_nullable(HeapType::Abstract(AbsHeapType::I31))),
            GcRef::I31(value & 0x7FFF_FFFF),
        )
    }

    pub fn is_null(&self) -> bool {
        self.payload.is_none()
    }

    pub fn val_type(&self) -> &ValType {
        &self.ty
    }

    pub fn payload(&self) -> Option<&GcRef> {
        self.payload.as_ref()
    }

    /// The same payload under a different static type.
    pub fn retyped(&self, ty: ValType) -> RefValue {
        RefValue {
            ty,
            payload: self.payload.clone(),
        }
    }

    pub fn as_struct(&self) -> Option<&SharedStruct> {
        match self.payload.as_ref() {
            Some(GcRef::Struct(inst)) => Some(inst),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&SharedArray> {
        match self.payload.as_ref() {
            Some(GcRef::Array(inst)) => Some(inst),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<FuncAddr> {
        match self.payload.as_ref() {
            Some(GcRef::Func(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_i31(&self) -> Option<u32> {
        match self.payload.as_ref() {
            Some(GcRef::I31(value)) => Some(*value),
            _ => None,
        }
    }

    /// `ref.eq` semantics: same object, or both null.
    pub fn same_identity(&self, other: &RefValue) -> bool {
        match (self.payload.as_ref(), other.payload.as_ref()) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same(b),
            _ => false,
        }
    }
}

impl PartialEq for RefValue {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(other)
    }
}

/// Runtime representation of WebAssembly values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    Ref(RefValue),
}

impl Value {
    /// Get the WebAssembly type of this value.
    pub fn typ(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
            Value::Ref(r) => *r.val_type(),
        }
    }

    /// Convert to i32, returning None if wrong type.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to i64, returning None if wrong type.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to f32, returning None if wrong type.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to f64, returning None if wrong type.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the reference payload, returning None if not a reference.
    pub fn as_ref_value(&self) -> Option<&RefValue> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// The default (zero or null) value for a field's storage type.
    pub fn default_for(storage: &StorageType) -> Value {
        match storage.unpacked() {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
            ValType::V128 => Value::V128(0),
            ValType::Ref(rt) => Value::Ref(RefValue::null_of(rt.heap)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "i32:{v}"),
            Value::I64(v) => write!(f, "i64:{v}"),
            Value::F32(v) => write!(f, "f32:{}", v.to_hex()),
            Value::F64(v) => write!(f, "f64:{}", v.to_hex()),
            Value::V128(v) => write!(f, "v128:0x{v:032x}"),
            Value::Ref(r) => {
                if r.is_null() {
                    write!(f, "{}:null", r.val_type())
                } else {
                    write!(f, "{}:obj", r.val_type())
                }
            }
        }
    }
}
