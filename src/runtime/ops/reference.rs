//! Reference operations: `ref.*`, `struct.*`, `array.*`, i31, and the
//! extern conversions.
//!
//! Value packing: a value written to a packed field is masked to the
//! storage width and held zero-extended in an i32 slot. Reads re-extend
//! per the `_s`/`_u` accessor; the unsuffixed accessor on a packed field
//! is a type error.

use super::*;
use crate::parser::module::PackType;
use crate::runtime::matcher;

/// Masks a value to its packed storage width; identity for full-width
/// storage.
pub fn pack_val(storage: &StorageType, val: Value) -> Value {
    match (storage, &val) {
        (StorageType::Packed(PackType::I8), Value::I32(v)) => Value::I32(v & 0xFF),
        (StorageType::Packed(PackType::I16), Value::I32(v)) => Value::I32(v & 0xFFFF),
        _ => val,
    }
}

/// Elementwise [`pack_val`].
pub fn pack_vals(storage: &StorageType, vals: Vec<Value>) -> Vec<Value> {
    vals.into_iter().map(|v| pack_val(storage, v)).collect()
}

/// How a read widens packed storage back to i32.
#[derive(Clone, Copy, PartialEq)]
enum FieldExt {
    /// Unsuffixed accessor; only valid on full-width storage.
    Plain,
    Signed,
    Unsigned,
}

fn unpack_val(storage: &StorageType, val: Value, ext: FieldExt) -> Result<Value, RuntimeError> {
    let pack = match storage {
        StorageType::Packed(pack) => *pack,
        StorageType::Val(_) => return Ok(val),
    };
    let v = match val {
        Value::I32(v) => v,
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "i32 slot for packed storage".to_string(),
                actual: format!("{}", other.typ()),
            });
        }
    };
    match (pack, ext) {
        (_, FieldExt::Plain) => Err(RuntimeError::TypeMismatch {
            expected: "unpacked storage".to_string(),
            actual: format!("{storage}"),
        }),
        (PackType::I8, FieldExt::Signed) => Ok(Value::I32(v as u8 as i8 as i32)),
        (PackType::I8, FieldExt::Unsigned) => Ok(Value::I32(v & 0xFF)),
        (PackType::I16, FieldExt::Signed) => Ok(Value::I32(v as u16 as i16 as i32)),
        (PackType::I16, FieldExt::Unsigned) => Ok(Value::I32(v & 0xFFFF)),
    }
}

/// Logs the diagnostic context for a failing operation and passes the
/// error through.
fn trap(err: RuntimeError, instr: &InstrInfo) -> RuntimeError {
    log::error!("{instr}: {err}");
    err
}

fn subtype<'a>(types: &'a [SubType], type_index: u32) -> Result<&'a SubType, RuntimeError> {
    types
        .get(type_index as usize)
        .ok_or(RuntimeError::TypeIndexOutOfBounds(type_index))
}

/// The reference type a freshly allocated object of a defined type
/// carries.
fn defined_ref(type_index: u32) -> ValType {
    ValType::Ref(RefType::non_nullable(HeapType::Defined(type_index)))
}

fn peek_i32(stack: &Stack, depth: usize) -> Result<i32, RuntimeError> {
    match stack.peek_at(depth) {
        Some(Value::I32(v)) => Ok(*v),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "i32".to_string(),
            actual: format!("{}", other.typ()),
        }),
        None => Err(RuntimeError::StackUnderflow),
    }
}

fn peek_ref(stack: &Stack, depth: usize) -> Result<&RefValue, RuntimeError> {
    match stack.peek_at(depth) {
        Some(Value::Ref(r)) => Ok(r),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "reference".to_string(),
            actual: format!("{}", other.typ()),
        }),
        None => Err(RuntimeError::StackUnderflow),
    }
}

// ===========================================================================
// ref.* operations
// ===========================================================================

/// `ref.null t` - push a null reference of the given heap type.
pub fn ref_null(stack: &mut Stack, types: &[SubType], heap: HeapType) -> Result<(), RuntimeError> {
    if let HeapType::Defined(index) = heap {
        if index as usize >= types.len() {
            return Err(RuntimeError::TypeIndexOutOfBounds(index));
        }
    }
    stack.push(Value::Ref(RefValue::null_of(heap)));
    Ok(())
}

/// `ref.is_null` - pop a reference, push 1 if null else 0.
pub fn ref_is_null(stack: &mut Stack) -> Result<(), RuntimeError> {
    let r = stack.pop_ref()?;
    stack.push(Value::I32(r.is_null() as i32));
    Ok(())
}

/// `ref.func i` - push a non-null funcref for the resolved function.
///
/// The dispatcher resolves the module-local function index to a global
/// [`FuncAddr`] and the function's defined type index.
pub fn ref_func(stack: &mut Stack, addr: FuncAddr, type_index: u32) -> Result<(), RuntimeError> {
    stack.push(Value::Ref(RefValue::new(
        defined_ref(type_index),
        GcRef::Func(addr),
    )));
    Ok(())
}

/// `ref.eq` - pointer identity of two references; both-null counts as
/// equal.
pub fn ref_eq(stack: &mut Stack) -> Result<(), RuntimeError> {
    let eq = {
        let b = peek_ref(stack, 0)?;
        let a = peek_ref(stack, 1)?;
        a.same_identity(b)
    };
    stack.drop_n(2)?;
    stack.push(Value::I32(eq as i32));
    Ok(())
}

/// `ref.as_non_null` - re-tag the reference as non-nullable, keeping its
/// payload and identity. Traps on null.
pub fn ref_as_non_null(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    let retagged = {
        let r = peek_ref(stack, 0)?;
        if r.is_null() {
            return Err(trap(RuntimeError::CastNullToNonNull, instr));
        }
        r.retyped(r.val_type().to_non_nullable())
    };
    *stack.top_mut()? = Value::Ref(retagged);
    Ok(())
}

/// `ref.test rt` - pop a reference, push 1 if its runtime type matches
/// the target reference type. Never traps.
pub fn ref_test(
    stack: &mut Stack,
    types: &[SubType],
    expected: &ValType,
) -> Result<(), RuntimeError> {
    let r = stack.pop_ref()?;
    let matched = matcher::match_val_type(types, expected, types, r.val_type());
    stack.push(Value::I32(matched as i32));
    Ok(())
}

/// `ref.cast rt` - as `ref.test`, but traps on mismatch and re-tags the
/// reference with the target type on success.
pub fn ref_cast(
    stack: &mut Stack,
    types: &[SubType],
    expected: &ValType,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    let retagged = {
        let r = peek_ref(stack, 0)?;
        if !matcher::match_val_type(types, expected, types, r.val_type()) {
            return Err(trap(RuntimeError::CastNullToNonNull, instr));
        }
        r.retyped(*expected)
    };
    *stack.top_mut()? = Value::Ref(retagged);
    Ok(())
}

// ===========================================================================
// struct.* operations
// ===========================================================================

/// `struct.new ct` / `struct.new_default ct`.
///
/// For the non-default form, field initializers are popped from the stack
/// (field 0 deepest) and packed per their storage types before
/// allocation.
pub fn struct_new(
    stack: &mut Stack,
    heap: &Heap,
    types: &[SubType],
    type_index: u32,
    is_default: bool,
) -> Result<(), RuntimeError> {
    let sub = subtype(types, type_index)?;
    let composite = sub.composite();
    let instance = if is_default {
        heap.new_struct(type_index, composite)?
    } else {
        let fields = match composite {
            CompositeType::Struct(fields) => fields,
            other => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "struct type".to_string(),
                    actual: format!("{other}"),
                });
            }
        };
        let mut values = stack.pop_n(fields.len())?;
        for (value, field) in values.iter_mut().zip(fields.iter()) {
            *value = pack_val(&field.storage, value.clone());
        }
        heap.new_struct_with(type_index, composite, values)?
    };
    stack.push(Value::Ref(RefValue::new(
        defined_ref(type_index),
        GcRef::Struct(instance),
    )));
    Ok(())
}

/// `struct.get` - read an unpacked field.
pub fn struct_get(
    stack: &mut Stack,
    field_index: u32,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    struct_get_ext(stack, field_index, FieldExt::Plain, instr)
}

/// `struct.get_s` - read a packed field, sign-extended to i32.
pub fn struct_get_s(
    stack: &mut Stack,
    field_index: u32,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    struct_get_ext(stack, field_index, FieldExt::Signed, instr)
}

/// `struct.get_u` - read a packed field, zero-extended to i32.
pub fn struct_get_u(
    stack: &mut Stack,
    field_index: u32,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    struct_get_ext(stack, field_index, FieldExt::Unsigned, instr)
}

fn struct_get_ext(
    stack: &mut Stack,
    field_index: u32,
    ext: FieldExt,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    let value = {
        let r = peek_ref(stack, 0)?;
        let instance = match r.as_struct() {
            Some(instance) => instance.clone(),
            None if r.is_null() => return Err(trap(RuntimeError::CastNullToNonNull, instr)),
            None => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "struct reference".to_string(),
                    actual: format!("{}", r.val_type()),
                });
            }
        };
        let guard = lock(&instance);
        let raw = guard.get_data(field_index)?.clone();
        unpack_val(guard.storage(field_index)?, raw, ext)?
    };
    *stack.top_mut()? = value;
    Ok(())
}

/// `struct.set` - write a field, packing the value per its storage type.
pub fn struct_set(
    stack: &mut Stack,
    field_index: u32,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    {
        let value = stack.peek_at(0).ok_or(RuntimeError::StackUnderflow)?.clone();
        let r = peek_ref(stack, 1)?;
        let instance = match r.as_struct() {
            Some(instance) => instance.clone(),
            None if r.is_null() => return Err(trap(RuntimeError::CastNullToNonNull, instr)),
            None => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "struct reference".to_string(),
                    actual: format!("{}", r.val_type()),
                });
            }
        };
        let mut guard = lock(&instance);
        let packed = pack_val(guard.storage(field_index)?, value);
        guard.set_data(field_index, packed)?;
    }
    stack.drop_n(2)?;
    Ok(())
}

// ===========================================================================
// array.* operations
// ===========================================================================

fn array_type<'a>(
    types: &'a [SubType],
    type_index: u32,
) -> Result<(&'a CompositeType, StorageType), RuntimeError> {
    let composite = subtype(types, type_index)?.composite();
    match composite {
        CompositeType::Array(field) => Ok((composite, field.storage)),
        other => Err(RuntimeError::TypeMismatch {
            expected: "array type".to_string(),
            actual: format!("{other}"),
        }),
    }
}

fn push_array(stack: &mut Stack, type_index: u32, instance: crate::runtime::heap::SharedArray) {
    stack.push(Value::Ref(RefValue::new(
        defined_ref(type_index),
        GcRef::Array(instance),
    )));
}

/// `array.new ct` - pop `v, n`, allocate length `n` with every element
/// the packed `v`.
pub fn array_new(
    stack: &mut Stack,
    heap: &Heap,
    types: &[SubType],
    type_index: u32,
) -> Result<(), RuntimeError> {
    let (composite, storage) = array_type(types, type_index)?;
    let length = peek_i32(stack, 0)? as u32;
    let init = stack.peek_at(1).ok_or(RuntimeError::StackUnderflow)?.clone();
    let instance =
        heap.new_array_splat(type_index, composite, length, pack_val(&storage, init))?;
    stack.drop_n(2)?;
    push_array(stack, type_index, instance);
    Ok(())
}

/// `array.new_default ct` - pop `n`, allocate zero/null-filled.
pub fn array_new_default(
    stack: &mut Stack,
    heap: &Heap,
    types: &[SubType],
    type_index: u32,
) -> Result<(), RuntimeError> {
    let (composite, _) = array_type(types, type_index)?;
    let length = peek_i32(stack, 0)? as u32;
    let instance = heap.new_array(type_index, composite, length)?;
    stack.drop_n(1)?;
    push_array(stack, type_index, instance);
    Ok(())
}

/// `array.new_fixed ct k` - pop `k` initializers (element 0 deepest),
/// pack each, allocate.
pub fn array_new_fixed(
    stack: &mut Stack,
    heap: &Heap,
    types: &[SubType],
    type_index: u32,
    count: u32,
) -> Result<(), RuntimeError> {
    let (composite, storage) = array_type(types, type_index)?;
    let values = pack_vals(&storage, stack.pop_n(count as usize)?);
    let instance = heap.new_array_with(type_index, composite, values)?;
    push_array(stack, type_index, instance);
    Ok(())
}

/// `array.new_data ct d` - pop `s, n`, read `n` elements from the data
/// segment starting at byte offset `s`.
///
/// The source range is bounds-checked with strict inequality: the last
/// sourced byte may be the segment's last byte.
pub fn array_new_data(
    stack: &mut Stack,
    heap: &Heap,
    types: &[SubType],
    type_index: u32,
    data: &DataInstance,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    let (composite, storage) = array_type(types, type_index)?;
    let count = peek_i32(stack, 0)? as u32;
    let offset = peek_i32(stack, 1)? as u32;
    let width = storage.bit_width() / 8;

    if offset as u64 + count as u64 * width as u64 > data.len() as u64 {
        return Err(trap(RuntimeError::LengthOutOfBounds, instr));
    }

    // Values load already packed; no further masking.
    let mut values = Vec::with_capacity(count as usize);
    for i in 0..count {
        values.push(data.load_value(offset + i * width, &storage)?);
    }
    let instance = heap.new_array_with(type_index, composite, values)?;
    stack.drop_n(2)?;
    push_array(stack, type_index, instance);
    Ok(())
}

/// `array.new_elem ct e` - pop `s, n`, source `n` references from the
/// element segment starting at index `s`.
pub fn array_new_elem(
    stack: &mut Stack,
    heap: &Heap,
    types: &[SubType],
    type_index: u32,
    elem: &ElementInstance,
    instr: &InstrInfo,
) -> Result<(), RuntimeError> {
    let (composite, _) = array_type(types, type_index)?;
    let count = peek_i32(stack, 0)? as u32;
    let offset = peek_i32(stack, 1)? as u32;

    if offset as u64 + count as u64 > elem.len() as u64 {
        return Err(trap(RuntimeError::LengthOutOfBounds, instr));
    }

    let values = elem.refs()[offset as usize..(offset + count) as usize]
        .iter()
        .map(|r| Value::Ref(r.clone()))
        .collect();
    let instance = heap.new_array_with(type_index, composite, values)?;
    stack.drop_n(2)?;
    push_array(stack, type_index, instance);
    Ok(())
}

/// `array.len` - replace the array reference with its stored length.
/// Traps on null.
pub fn array_len(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    let length = {
        let r = peek_ref(stack, 0)?;
        let instance = match r.as_array() {
            Some(instance) => instance.clone(),
            None if r.is_null() => return Err(trap(RuntimeError::CastNullToNonNull, instr)),
            None => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "array reference".to_string(),
                    actual: format!("{}", r.val_type()),
                });
            }
        };
        let len = lock(&instance).length();
        len
    };
    *stack.top_mut()? = Value::I32(length as i32);
    Ok(())
}

/// `array.get` - read an unpacked element.
pub fn array_get(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    array_get_ext(stack, FieldExt::Plain, instr)
}

/// `array.get_s` - read a packed element, sign-extended to i32.
pub fn array_get_s(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    array_get_ext(stack, FieldExt::Signed, instr)
}

/// `array.get_u` - read a packed element, zero-extended to i32.
pub fn array_get_u(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    array_get_ext(stack, FieldExt::Unsigned, instr)
}

fn array_get_ext(stack: &mut Stack, ext: FieldExt, instr: &InstrInfo) -> Result<(), RuntimeError> {
    let value = {
        let index = peek_i32(stack, 0)? as u32;
        let r = peek_ref(stack, 1)?;
        let instance = match r.as_array() {
            Some(instance) => instance.clone(),
            None if r.is_null() => return Err(trap(RuntimeError::CastNullToNonNull, instr)),
            None => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "array reference".to_string(),
                    actual: format!("{}", r.val_type()),
                });
            }
        };
        let guard = lock(&instance);
        let raw = guard.get_data(index).map_err(|e| trap(e, instr))?.clone();
        unpack_val(guard.storage(), raw, ext)?
    };
    stack.drop_n(2)?;
    stack.push(value);
    Ok(())
}

/// `array.set` - write an element, packing the value per the element
/// storage type.
pub fn array_set(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    {
        let value = stack.peek_at(0).ok_or(RuntimeError::StackUnderflow)?.clone();
        let index = peek_i32(stack, 1)? as u32;
        let r = peek_ref(stack, 2)?;
        let instance = match r.as_array() {
            Some(instance) => instance.clone(),
            None if r.is_null() => return Err(trap(RuntimeError::CastNullToNonNull, instr)),
            None => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "array reference".to_string(),
                    actual: format!("{}", r.val_type()),
                });
            }
        };
        let mut guard = lock(&instance);
        let packed = pack_val(guard.storage(), value);
        guard.set_data(index, packed).map_err(|e| trap(e, instr))?;
    }
    stack.drop_n(3)?;
    Ok(())
}

// ===========================================================================
// Conversions and i31
// ===========================================================================

fn extern_convert(stack: &mut Stack, target: AbsHeapType) -> Result<(), RuntimeError> {
    let converted = {
        let r = peek_ref(stack, 0)?;
        if r.is_null() {
            RefValue::null_of(HeapType::Abstract(target))
        } else {
            // Rewrap under the target family without changing identity.
            r.retyped(ValType::Ref(RefType::non_nullable(HeapType::Abstract(
                target,
            ))))
        }
    };
    *stack.top_mut()? = Value::Ref(converted);
    Ok(())
}

/// `extern.convert_any` - rewrap an internal reference as an externref.
pub fn extern_convert_any(stack: &mut Stack) -> Result<(), RuntimeError> {
    extern_convert(stack, AbsHeapType::Extern)
}

/// `any.convert_extern` - rewrap an externref as an internal reference.
pub fn any_convert_extern(stack: &mut Stack) -> Result<(), RuntimeError> {
    extern_convert(stack, AbsHeapType::Any)
}

/// `ref.i31` - pop an i32, push a non-null i31ref holding its low 31
/// bits.
pub fn ref_i31(stack: &mut Stack) -> Result<(), RuntimeError> {
    let v = peek_i32(stack, 0)?;
    *stack.top_mut()? = Value::Ref(RefValue::i31(v as u32));
    Ok(())
}

/// `i31.get_s` - the stored 31 bits, sign-extended to i32.
pub fn i31_get_s(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    i31_get(stack, true, instr)
}

/// `i31.get_u` - the stored 31 bits, zero-extended to i32.
pub fn i31_get_u(stack: &mut Stack, instr: &InstrInfo) -> Result<(), RuntimeError> {
    i31_get(stack, false, instr)
}

fn i31_get(stack: &mut Stack, signed: bool, instr: &InstrInfo) -> Result<(), RuntimeError> {
    let value = {
        let r = peek_ref(stack, 0)?;
        match r.as_i31() {
            Some(v) if signed => ((v << 1) as i32) >> 1,
            Some(v) => v as i32,
            None if r.is_null() => return Err(trap(RuntimeError::CastNullToNonNull, instr)),
            None => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "i31 reference".to_string(),
                    actual: format!("{}", r.val_type()),
                });
            }
        }
    };
    *stack.top_mut()? = Value::I32(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::module::{FieldType, Mutability, PackType};

    const STRUCT_I8_I32: u32 = 0;
    const ARRAY_I16: u32 = 1;
    const STRUCT_A: u32 = 2;
    const STRUCT_B: u32 = 3;
    const ARRAY_ANYREF: u32 = 4;

    fn instr() -> InstrInfo {
        InstrInfo::new("test-op", 0)
    }

    /// Type list used throughout: a struct with a packed field, a packed
    /// array, a declared subtype pair, and a reference array.
    fn test_types() -> Vec<SubType> {
        let anyref = ValType::Ref(RefType::nullable(HeapType::Abstract(AbsHeapType::Any)));
        vec![
            // 0: struct { (mut i8), i32 }
            SubType::from_composite(CompositeType::Struct(vec![
                FieldType::new(StorageType::Packed(PackType::I8), Mutability::Var),
                FieldType::new(StorageType::Val(ValType::I32), Mutability::Const),
            ])),
            // 1: array (mut i16)
            SubType::from_composite(CompositeType::Array(FieldType::new(
                StorageType::Packed(PackType::I16),
                Mutability::Var,
            ))),
            // 2: sub struct { i32 }
            SubType {
                is_final: false,
                supertypes: vec![],
                composite: CompositeType::Struct(vec![FieldType::new(
                    StorageType::Val(ValType::I32),
                    Mutability::Const,
                )]),
            },
            // 3: sub final 2 struct { i32, f64 }
            SubType {
                is_final: true,
                supertypes: vec![STRUCT_A],
                composite: CompositeType::Struct(vec![
                    FieldType::new(StorageType::Val(ValType::I32), Mutability::Const),
                    FieldType::new(StorageType::Val(ValType::F64), Mutability::Const),
                ]),
            },
            // 4: array (mut anyref)
            SubType::from_composite(CompositeType::Array(FieldType::new(
                StorageType::Val(anyref),
                Mutability::Var,
            ))),
        ]
    }

    fn dup_top(stack: &mut Stack) {
        let top = stack.peek().unwrap().clone();
        stack.push(top);
    }

    #[test]
    fn test_struct_new_packs_fields() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        stack.push(Value::I32(0x1FF));
        stack.push(Value::I32(42));
        struct_new(&mut stack, &heap, &types, STRUCT_I8_I32, false).unwrap();
        assert_eq!(stack.depth(), 1);

        // Field 0 was masked to its storage width at allocation.
        let r = stack.peek().unwrap().as_ref_value().unwrap().clone();
        let inst = r.as_struct().unwrap();
        let guard = lock(inst);
        assert_eq!(*guard.get_data(0).unwrap(), Value::I32(0xFF));
        assert_eq!(*guard.get_data(1).unwrap(), Value::I32(42));
        drop(guard);

        // `_u` reads back zero-extended, `_s` sign-extended.
        dup_top(&mut stack);
        struct_get_u(&mut stack, 0, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0xFF));

        dup_top(&mut stack);
        struct_get_s(&mut stack, 0, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(-1));

        dup_top(&mut stack);
        struct_get(&mut stack, 1, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(42));
    }

    #[test]
    fn test_struct_new_default() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        struct_new(&mut stack, &heap, &types, STRUCT_I8_I32, true).unwrap();
        dup_top(&mut stack);
        struct_get_u(&mut stack, 0, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0));
        struct_get(&mut stack, 1, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0));
    }

    #[test]
    fn test_plain_get_on_packed_field_rejected() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        struct_new(&mut stack, &heap, &types, STRUCT_I8_I32, true).unwrap();
        assert!(matches!(
            struct_get(&mut stack, 0, &instr()),
            Err(RuntimeError::TypeMismatch { .. })
        ));
        // The operand is still there.
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_struct_set_packs() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        struct_new(&mut stack, &heap, &types, STRUCT_I8_I32, true).unwrap();
        dup_top(&mut stack);
        stack.push(Value::I32(0x1AB));
        struct_set(&mut stack, 0, &instr()).unwrap();
        assert_eq!(stack.depth(), 1);

        struct_get_u(&mut stack, 0, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0xAB));
    }

    #[test]
    fn test_struct_field_index_out_of_bounds() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        struct_new(&mut stack, &heap, &types, STRUCT_I8_I32, true).unwrap();
        assert!(matches!(
            struct_get_u(&mut stack, 9, &instr()),
            Err(RuntimeError::FieldIndexOutOfBounds(9))
        ));
    }

    #[test]
    fn test_struct_access_through_null() {
        let mut stack = Stack::new();
        stack.push(Value::Ref(RefValue::null_of(HeapType::Abstract(
            AbsHeapType::Struct,
        ))));
        assert!(matches!(
            struct_get_u(&mut stack, 0, &instr()),
            Err(RuntimeError::CastNullToNonNull)
        ));
        stack.push(Value::I32(1));
        assert!(matches!(
            struct_set(&mut stack, 0, &instr()),
            Err(RuntimeError::CastNullToNonNull)
        ));
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn test_array_new_splats_packed_value() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        stack.push(Value::I32(0x1_0001));
        stack.push(Value::I32(3));
        array_new(&mut stack, &heap, &types, ARRAY_I16).unwrap();
        assert_eq!(stack.depth(), 1);

        dup_top(&mut stack);
        array_len(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(3));

        dup_top(&mut stack);
        stack.push(Value::I32(2));
        array_get_u(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(1));
    }

    #[test]
    fn test_array_new_fixed_packs_each() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        stack.push(Value::I32(0x1_FFFF));
        stack.push(Value::I32(0x2));
        array_new_fixed(&mut stack, &heap, &types, ARRAY_I16, 2).unwrap();

        dup_top(&mut stack);
        stack.push(Value::I32(0));
        array_get_u(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0xFFFF));

        stack.push(Value::I32(1));
        array_get_s(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(2));
    }

    #[test]
    fn test_array_new_data_reads_packed_elements() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();
        let data = DataInstance::new(vec![0x01, 0x00, 0x02, 0x00, 0x03, 0x00]);

        stack.push(Value::I32(0)); // s
        stack.push(Value::I32(3)); // n
        array_new_data(&mut stack, &heap, &types, ARRAY_I16, &data, &instr()).unwrap();
        assert_eq!(stack.depth(), 1);

        for (i, expected) in [1, 2, 3].into_iter().enumerate() {
            dup_top(&mut stack);
            stack.push(Value::I32(i as i32));
            array_get_u(&mut stack, &instr()).unwrap();
            assert_eq!(stack.pop().unwrap(), Value::I32(expected));
        }
    }

    #[test]
    fn test_array_new_data_strict_bound() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();
        let data = DataInstance::new(vec![0x01, 0x00, 0x02, 0x00, 0x03, 0x00]);

        // Needs 6 bytes starting at offset 1; only 5 remain.
        stack.push(Value::I32(1));
        stack.push(Value::I32(3));
        let result = array_new_data(&mut stack, &heap, &types, ARRAY_I16, &data, &instr());
        assert!(matches!(result, Err(RuntimeError::LengthOutOfBounds)));

        // A failing op consumes no operands.
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.peek_at(0), Some(&Value::I32(3)));
        assert_eq!(stack.peek_at(1), Some(&Value::I32(1)));
    }

    #[test]
    fn test_array_new_data_last_byte_inclusive() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();
        let data = DataInstance::new(vec![0xAA, 0xBB]);

        // One i16 element consuming exactly the whole segment is in
        // bounds.
        stack.push(Value::I32(0));
        stack.push(Value::I32(1));
        array_new_data(&mut stack, &heap, &types, ARRAY_I16, &data, &instr()).unwrap();
        stack.push(Value::I32(0));
        array_get_u(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0xBBAA));
    }

    #[test]
    fn test_array_new_elem() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();
        let elem = ElementInstance::new(vec![
            RefValue::i31(1),
            RefValue::null_of(HeapType::Abstract(AbsHeapType::Any)),
            RefValue::i31(2),
        ]);

        stack.push(Value::I32(1));
        stack.push(Value::I32(2));
        array_new_elem(&mut stack, &heap, &types, ARRAY_ANYREF, &elem, &instr()).unwrap();

        dup_top(&mut stack);
        array_len(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(2));

        dup_top(&mut stack);
        stack.push(Value::I32(0));
        array_get(&mut stack, &instr()).unwrap();
        match stack.pop().unwrap() {
            Value::Ref(r) => assert!(r.is_null()),
            other => panic!("expected reference, got {other}"),
        }

        stack.push(Value::I32(1));
        array_get(&mut stack, &instr()).unwrap();
        match stack.pop().unwrap() {
            Value::Ref(r) => assert_eq!(r.as_i31(), Some(2)),
            other => panic!("expected reference, got {other}"),
        }
    }

    #[test]
    fn test_array_new_elem_bound() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();
        let elem = ElementInstance::new(vec![RefValue::i31(1), RefValue::i31(2)]);

        stack.push(Value::I32(1));
        stack.push(Value::I32(2));
        let result = array_new_elem(&mut stack, &heap, &types, ARRAY_ANYREF, &elem, &instr());
        assert!(matches!(result, Err(RuntimeError::LengthOutOfBounds)));
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn test_array_len_on_null() {
        let mut stack = Stack::new();
        stack.push(Value::Ref(RefValue::null_of(HeapType::Abstract(
            AbsHeapType::Array,
        ))));
        assert!(matches!(
            array_len(&mut stack, &instr()),
            Err(RuntimeError::CastNullToNonNull)
        ));
        // Operand left in place.
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_array_get_out_of_bounds() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        stack.push(Value::I32(2));
        array_new_default(&mut stack, &heap, &types, ARRAY_I16).unwrap();
        stack.push(Value::I32(2));
        assert!(matches!(
            array_get_u(&mut stack, &instr()),
            Err(RuntimeError::LengthOutOfBounds)
        ));
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn test_array_set_packs() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        stack.push(Value::I32(2));
        array_new_default(&mut stack, &heap, &types, ARRAY_I16).unwrap();
        dup_top(&mut stack);
        stack.push(Value::I32(1));
        stack.push(Value::I32(0xAB_CDEF));
        array_set(&mut stack, &instr()).unwrap();
        assert_eq!(stack.depth(), 1);

        stack.push(Value::I32(1));
        array_get_u(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0xCDEF));
    }

    #[test]
    fn test_ref_null_and_is_null() {
        let types = test_types();
        let mut stack = Stack::new();

        ref_null(&mut stack, &types, HeapType::Abstract(AbsHeapType::Any)).unwrap();
        ref_is_null(&mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(1));

        ref_null(&mut stack, &types, HeapType::Defined(STRUCT_A)).unwrap();
        ref_is_null(&mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(1));
    }

    #[test]
    fn test_ref_null_validates_index() {
        let types = test_types();
        let mut stack = Stack::new();
        assert!(matches!(
            ref_null(&mut stack, &types, HeapType::Defined(99)),
            Err(RuntimeError::TypeIndexOutOfBounds(99))
        ));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_ref_as_non_null() {
        let types = test_types();
        let mut stack = Stack::new();

        // Null traps and leaves the operand.
        ref_null(&mut stack, &types, HeapType::Abstract(AbsHeapType::Any)).unwrap();
        assert!(matches!(
            ref_as_non_null(&mut stack, &instr()),
            Err(RuntimeError::CastNullToNonNull)
        ));
        assert_eq!(stack.depth(), 1);
        stack.clear();

        // Non-null is re-tagged, identity kept.
        stack.push(Value::I32(5));
        ref_i31(&mut stack).unwrap();
        ref_as_non_null(&mut stack, &instr()).unwrap();
        let r = stack.pop().unwrap().as_ref_value().unwrap().clone();
        assert_eq!(r.as_i31(), Some(5));
        assert!(!r.val_type().ref_type().unwrap().nullable);
    }

    #[test]
    fn test_ref_func() {
        let mut stack = Stack::new();
        ref_func(&mut stack, FuncAddr(7), 0).unwrap();
        let r = stack.peek().unwrap().as_ref_value().unwrap().clone();
        assert_eq!(r.as_func(), Some(FuncAddr(7)));
        ref_is_null(&mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0));
    }

    #[test]
    fn test_ref_eq_identity() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        // Same object compares equal.
        struct_new(&mut stack, &heap, &types, STRUCT_A, true).unwrap();
        dup_top(&mut stack);
        ref_eq(&mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(1));

        // Distinct allocations compare unequal even with equal contents.
        struct_new(&mut stack, &heap, &types, STRUCT_A, true).unwrap();
        struct_new(&mut stack, &heap, &types, STRUCT_A, true).unwrap();
        ref_eq(&mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0));

        // Two nulls compare equal.
        ref_null(&mut stack, &types, HeapType::Abstract(AbsHeapType::Any)).unwrap();
        ref_null(&mut stack, &types, HeapType::Abstract(AbsHeapType::Func)).unwrap();
        ref_eq(&mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(1));
    }

    #[test]
    fn test_ref_test_subtype_chain() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        // r: ref $B tested against (ref $A) succeeds via the declared
        // supertype.
        struct_new(&mut stack, &heap, &types, STRUCT_B, true).unwrap();
        let target = ValType::Ref(RefType::non_nullable(HeapType::Defined(STRUCT_A)));
        ref_test(&mut stack, &types, &target).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(1));

        // The converse direction fails.
        struct_new(&mut stack, &heap, &types, STRUCT_A, true).unwrap();
        let target = ValType::Ref(RefType::non_nullable(HeapType::Defined(STRUCT_B)));
        ref_test(&mut stack, &types, &target).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0));
    }

    #[test]
    fn test_ref_test_never_traps_on_null() {
        let types = test_types();
        let mut stack = Stack::new();
        ref_null(&mut stack, &types, HeapType::Abstract(AbsHeapType::None)).unwrap();
        let target = ValType::Ref(RefType::non_nullable(HeapType::Abstract(AbsHeapType::Any)));
        ref_test(&mut stack, &types, &target).unwrap();
        // null does not satisfy a non-nullable target
        assert_eq!(stack.pop().unwrap(), Value::I32(0));
    }

    #[test]
    fn test_ref_cast() {
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();

        struct_new(&mut stack, &heap, &types, STRUCT_B, true).unwrap();
        let before = stack.peek().unwrap().as_ref_value().unwrap().clone();
        let target = ValType::Ref(RefType::non_nullable(HeapType::Defined(STRUCT_A)));
        ref_cast(&mut stack, &types, &target, &instr()).unwrap();
        let after = stack.pop().unwrap().as_ref_value().unwrap().clone();
        assert_eq!(*after.val_type(), target);
        assert!(before.same_identity(&after));

        // Failed cast traps and leaves the operand untouched.
        struct_new(&mut stack, &heap, &types, STRUCT_A, true).unwrap();
        let target = ValType::Ref(RefType::non_nullable(HeapType::Defined(ARRAY_I16)));
        assert!(matches!(
            ref_cast(&mut stack, &types, &target, &instr()),
            Err(RuntimeError::CastNullToNonNull)
        ));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_ref_i31_masks_high_bit() {
        let mut stack = Stack::new();
        stack.push(Value::I32(-1)); // 0xFFFF_FFFF
        ref_i31(&mut stack).unwrap();

        let r = stack.peek().unwrap().as_ref_value().unwrap().clone();
        assert!(!r.is_null());
        assert_eq!(r.as_i31(), Some(0x7FFF_FFFF));

        dup_top(&mut stack);
        i31_get_u(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(0x7FFF_FFFF));
        i31_get_s(&mut stack, &instr()).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(-1));
    }

    #[test]
    fn test_extern_conversions_keep_identity() {
        let types = test_types();
        let mut stack = Stack::new();

        // Null converts to a null of the target type.
        ref_null(&mut stack, &types, HeapType::Abstract(AbsHeapType::None)).unwrap();
        extern_convert_any(&mut stack).unwrap();
        let r = stack.pop().unwrap().as_ref_value().unwrap().clone();
        assert!(r.is_null());
        let rt = r.val_type().ref_type().unwrap();
        assert!(rt.nullable);
        assert_eq!(rt.heap, HeapType::Abstract(AbsHeapType::Extern));

        // Non-null rewraps without changing identity, both directions.
        stack.push(Value::I32(17));
        ref_i31(&mut stack).unwrap();
        dup_top(&mut stack);
        extern_convert_any(&mut stack).unwrap();
        let wrapped = stack.peek().unwrap().as_ref_value().unwrap().clone();
        assert_eq!(
            wrapped.val_type().ref_type().unwrap().heap,
            HeapType::Abstract(AbsHeapType::Extern)
        );
        any_convert_extern(&mut stack).unwrap();
        ref_eq(&mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::I32(1));
    }

    #[test]
    fn test_pack_val_idempotent_and_fits() {
        let samples = [0, 1, -1, 0x7F, 0x80, 0xFF, 0x100, 0xFFFF, 0x1_0000, i32::MIN, i32::MAX];
        for storage in [
            StorageType::Packed(PackType::I8),
            StorageType::Packed(PackType::I16),
        ] {
            let mask = (1i64 << storage.bit_width()) - 1;
            for v in samples {
                let once = pack_val(&storage, Value::I32(v));
                let twice = pack_val(&storage, once.clone());
                assert_eq!(once, twice);
                let packed = once.as_i32().unwrap() as i64;
                assert!(packed >= 0 && packed <= mask, "{packed} exceeds {mask}");
            }
        }
        // Full-width storage is untouched.
        assert_eq!(
            pack_val(&StorageType::Val(ValType::I64), Value::I64(-1)),
            Value::I64(-1)
        );
    }

    #[test]
    fn test_struct_new_matches_packed_inputs() {
        // getData(newStruct(c, vs), i) == packVal(c.fields[i].storage, vs[i])
        let types = test_types();
        let heap = Heap::new();
        let mut stack = Stack::new();
        let inputs = [Value::I32(0x1234), Value::I32(-7)];

        stack.push_all(inputs.clone());
        struct_new(&mut stack, &heap, &types, STRUCT_I8_I32, false).unwrap();
        let r = stack.pop().unwrap().as_ref_value().unwrap().clone();
        let inst = r.as_struct().unwrap();
        let guard = lock(inst);
        let fields = types[STRUCT_I8_I32 as usize].composite().field_types();
        for (i, input) in inputs.into_iter().enumerate() {
            assert_eq!(
                *guard.get_data(i as u32).unwrap(),
                pack_val(&fields[i].storage, input)
            );
        }
    }
}
