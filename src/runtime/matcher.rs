//! Subtype matching over the GC type system.
//!
//! Decides the relation "got ≤ expected" between value types, heap types,
//! and defined composite types. Matching over defined types is coinductive:
//! a visited `(expected_index, got_index)` pair encountered again during
//! the traversal is assumed equal at the cut and treated as success, so
//! cycles in the type-index graph terminate.

use crate::parser::module::{
    AbsHeapType, CompositeType, FieldType, HeapType, Mutability, StorageType, SubType, ValType,
};
use std::collections::HashSet;

type Seen = HashSet<(u32, u32)>;

/// Decides `got ≤ expected` for two value types.
///
/// `exp_types` and `got_types` are the type lists of the modules the two
/// types belong to; defined-type indices resolve against them.
pub fn match_val_type(
    exp_types: &[SubType],
    exp: &ValType,
    got_types: &[SubType],
    got: &ValType,
) -> bool {
    let mut seen = Seen::new();
    val_types(exp_types, exp, got_types, got, &mut seen)
}

/// Decides `got ≤ expected` for two defined-type indices.
pub fn match_defined(
    exp_types: &[SubType],
    exp_index: u32,
    got_types: &[SubType],
    got_index: u32,
) -> bool {
    let mut seen = Seen::new();
    defined(exp_types, exp_index, got_types, got_index, &mut seen)
}

/// Decides `got ≤ expected` for two composite bodies.
pub fn match_composite(
    exp_types: &[SubType],
    exp: &CompositeType,
    got_types: &[SubType],
    got: &CompositeType,
) -> bool {
    let mut seen = Seen::new();
    composites(exp_types, exp, got_types, got, &mut seen)
}

/// Decides `got ≤ expected` on the abstract heap-type lattice:
///
/// ```text
/// none    ≤ i31, struct, array ≤ eq ≤ any
/// nofunc  ≤ func
/// noextern ≤ extern
/// ```
///
/// `any`, `func`, and `extern` head three disjoint families; any
/// cross-family pair is false.
pub fn match_heap_type(exp: AbsHeapType, got: AbsHeapType) -> bool {
    use AbsHeapType::*;

    if exp == got {
        return true;
    }

    // The func family: nofunc ≤ func.
    if exp == Func || exp == NoFunc {
        return got == NoFunc;
    }
    if got == Func || got == NoFunc {
        return false;
    }

    // The extern family: noextern ≤ extern.
    if exp == Extern || exp == NoExtern {
        return got == NoExtern;
    }
    if got == Extern || got == NoExtern {
        return false;
    }

    // The any family: none ≤ i31 | struct | array ≤ eq ≤ any.
    match exp {
        I31 | Struct | Array => got == None,
        Eq => got != Any,
        Any => true,
        _ => false,
    }
}

fn val_types(
    exp_types: &[SubType],
    exp: &ValType,
    got_types: &[SubType],
    got: &ValType,
    seen: &mut Seen,
) -> bool {
    match (exp, got) {
        (ValType::Ref(exp_rt), ValType::Ref(got_rt)) => {
            // Nullability: a possibly-null got only matches a nullable
            // expected.
            if !(exp_rt.nullable || !got_rt.nullable) {
                return false;
            }
            match (&exp_rt.heap, &got_rt.heap) {
                (HeapType::Abstract(exp_code), HeapType::Abstract(got_code)) => {
                    match_heap_type(*exp_code, *got_code)
                }
                (HeapType::Abstract(exp_code), HeapType::Defined(got_index)) => {
                    match got_types.get(*got_index as usize) {
                        Some(got_sub) => match_heap_type(*exp_code, got_sub.composite().expand()),
                        None => false,
                    }
                }
                (HeapType::Defined(exp_index), HeapType::Abstract(got_code)) => {
                    // Only the bottom types sit below a defined type; check
                    // the expected type against the bottom's family top.
                    let expanded = match exp_types.get(*exp_index as usize) {
                        Some(exp_sub) => exp_sub.composite().expand(),
                        None => return false,
                    };
                    match got_code {
                        AbsHeapType::None => match_heap_type(AbsHeapType::Any, expanded),
                        AbsHeapType::NoFunc => match_heap_type(AbsHeapType::Func, expanded),
                        AbsHeapType::NoExtern => match_heap_type(AbsHeapType::Extern, expanded),
                        _ => false,
                    }
                }
                (HeapType::Defined(exp_index), HeapType::Defined(got_index)) => {
                    defined(exp_types, *exp_index, got_types, *got_index, seen)
                }
            }
        }
        (exp, got) if !exp.is_ref() && !got.is_ref() => exp == got,
        _ => false,
    }
}

fn defined(
    exp_types: &[SubType],
    exp_index: u32,
    got_types: &[SubType],
    got_index: u32,
    seen: &mut Seen,
) -> bool {
    if exp_index == got_index {
        return true;
    }
    // Coinductive cut: a recurring pair is assumed equal.
    if !seen.insert((exp_index, got_index)) {
        return true;
    }

    let got_sub = match got_types.get(got_index as usize) {
        Some(sub) => sub,
        None => return false,
    };
    for &super_index in &got_sub.supertypes {
        if defined(exp_types, exp_index, got_types, super_index, seen) {
            return true;
        }
    }

    let exp_sub = match exp_types.get(exp_index as usize) {
        Some(sub) => sub,
        None => return false,
    };
    composites(
        exp_types,
        exp_sub.composite(),
        got_types,
        got_sub.composite(),
        seen,
    )
}

fn composites(
    exp_types: &[SubType],
    exp: &CompositeType,
    got_types: &[SubType],
    got: &CompositeType,
    seen: &mut Seen,
) -> bool {
    match (exp, got) {
        (CompositeType::Func(exp_f), CompositeType::Func(got_f)) => {
            // Parameters are contravariant, results covariant.
            val_type_lists(
                got_types,
                &got_f.parameters,
                exp_types,
                &exp_f.parameters,
                seen,
            ) && val_type_lists(
                exp_types,
                &exp_f.return_types,
                got_types,
                &got_f.return_types,
                seen,
            )
        }
        (CompositeType::Struct(exp_fields), CompositeType::Struct(got_fields)) => {
            // Width subtyping: got may append fields; shared prefix matches
            // pointwise.
            if got_fields.len() < exp_fields.len() {
                return false;
            }
            exp_fields
                .iter()
                .zip(got_fields.iter())
                .all(|(exp_field, got_field)| {
                    fields(exp_types, exp_field, got_types, got_field, seen)
                })
        }
        (CompositeType::Array(exp_field), CompositeType::Array(got_field)) => {
            fields(exp_types, exp_field, got_types, got_field, seen)
        }
        _ => false,
    }
}

fn fields(
    exp_types: &[SubType],
    exp: &FieldType,
    got_types: &[SubType],
    got: &FieldType,
    seen: &mut Seen,
) -> bool {
    if exp.mutability != got.mutability {
        return false;
    }
    let mut is_match = storages(exp_types, &exp.storage, got_types, &got.storage, seen);
    if exp.mutability == Mutability::Var {
        // Mutable fields are invariant: the storages must match both ways.
        is_match &= storages(got_types, &got.storage, exp_types, &exp.storage, seen);
    }
    is_match
}

fn storages(
    exp_types: &[SubType],
    exp: &StorageType,
    got_types: &[SubType],
    got: &StorageType,
    seen: &mut Seen,
) -> bool {
    match (exp, got) {
        (StorageType::Packed(exp_pack), StorageType::Packed(got_pack)) => exp_pack == got_pack,
        (StorageType::Val(exp_vt), StorageType::Val(got_vt)) => {
            val_types(exp_types, exp_vt, got_types, got_vt, seen)
        }
        _ => false,
    }
}

fn val_type_lists(
    exp_types: &[SubType],
    exp: &[ValType],
    got_types: &[SubType],
    got: &[ValType],
    seen: &mut Seen,
) -> bool {
    exp.len() == got.len()
        && exp
            .iter()
            .zip(got.iter())
            .all(|(exp_vt, got_vt)| val_types(exp_types, exp_vt, got_types, got_vt, seen))
}
