//! Parsed module representation and the GC type model.
//!
//! The type model follows the function-references/GC proposal: a module's
//! type section is a flat list of [`SubType`] entries partitioned into
//! recursion groups, each subtype wrapping a [`CompositeType`] body that is
//! a function, struct, or array shape.

use std::fmt;

// ===========================================================================
// Heap types
// ===========================================================================

/// Abstract heap types of the GC proposal.
///
/// `Func`, `Struct`, and `Array` double as the concrete codes a
/// [`CompositeType`] expands to (`funcref`, `structref`, `arrayref`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsHeapType {
    Any,
    Eq,
    I31,
    Struct,
    Array,
    None,
    Func,
    NoFunc,
    Extern,
    NoExtern,
}

impl fmt::Display for AbsHeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbsHeapType::Any => "any",
            AbsHeapType::Eq => "eq",
            AbsHeapType::I31 => "i31",
            AbsHeapType::Struct => "struct",
            AbsHeapType::Array => "array",
            AbsHeapType::None => "none",
            AbsHeapType::Func => "func",
            AbsHeapType::NoFunc => "nofunc",
            AbsHeapType::Extern => "extern",
            AbsHeapType::NoExtern => "noextern",
        };
        write!(f, "{name}")
    }
}

/// The referent category of a reference: an abstract code or an index into
/// the module's type list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapType {
    Abstract(AbsHeapType),
    Defined(u32),
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::Abstract(code) => write!(f, "{code}"),
            HeapType::Defined(idx) => write!(f, "{idx}"),
        }
    }
}

/// A reference type: nullability plus heap type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

impl RefType {
    pub fn nullable(heap: HeapType) -> RefType {
        RefType { nullable: true, heap }
    }

    pub fn non_nullable(heap: HeapType) -> RefType {
        RefType { nullable: false, heap }
    }

    pub fn to_non_nullable(self) -> RefType {
        RefType {
            nullable: false,
            heap: self.heap,
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "(ref null {})", self.heap)
        } else {
            write!(f, "(ref {})", self.heap)
        }
    }
}

// ===========================================================================
// Value, storage, and field types
// ===========================================================================

/// A full value type: numbers, vectors, or references.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    Ref(RefType),
}

impl ValType {
    pub fn is_ref(&self) -> bool {
        matches!(self, ValType::Ref(_))
    }

    pub fn ref_type(&self) -> Option<&RefType> {
        match self {
            ValType::Ref(rt) => Some(rt),
            _ => None,
        }
    }

    /// Strips nullability from a reference type; identity on all others.
    pub fn to_non_nullable(self) -> ValType {
        match self {
            ValType::Ref(rt) => ValType::Ref(rt.to_non_nullable()),
            other => other,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::V128 => write!(f, "v128"),
            ValType::Ref(rt) => write!(f, "{rt}"),
        }
    }
}

/// Packed storage codes. These never appear as full value types; fields
/// using them occupy an i32 slot at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType {
    I8,
    I16,
}

/// The storage type of a struct field or array element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageType {
    Val(ValType),
    Packed(PackType),
}

impl StorageType {
    pub fn is_packed(&self) -> bool {
        matches!(self, StorageType::Packed(_))
    }

    /// Width of the in-memory representation in bits. References are
    /// handle-sized.
    pub fn bit_width(&self) -> u32 {
        match self {
            StorageType::Packed(PackType::I8) => 8,
            StorageType::Packed(PackType::I16) => 16,
            StorageType::Val(ValType::I32) | StorageType::Val(ValType::F32) => 32,
            StorageType::Val(ValType::I64) | StorageType::Val(ValType::F64) => 64,
            StorageType::Val(ValType::V128) => 128,
            StorageType::Val(ValType::Ref(_)) => 64,
        }
    }

    /// The value type a read of this storage produces. Packed codes widen
    /// to i32.
    pub fn unpacked(&self) -> ValType {
        match self {
            StorageType::Val(vt) => *vt,
            StorageType::Packed(_) => ValType::I32,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Val(vt) => write!(f, "{vt}"),
            StorageType::Packed(PackType::I8) => write!(f, "i8"),
            StorageType::Packed(PackType::I16) => write!(f, "i16"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    Const,
    Var,
}

/// A struct field or array element declaration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldType {
    pub storage: StorageType,
    pub mutability: Mutability,
}

impl FieldType {
    pub fn new(storage: StorageType, mutability: Mutability) -> FieldType {
        FieldType { storage, mutability }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mutability {
            Mutability::Const => write!(f, "{}", self.storage),
            Mutability::Var => write!(f, "(mut {})", self.storage),
        }
    }
}

// ===========================================================================
// Composite and sub types
// ===========================================================================

/// A function signature. Equality is structural on parameter and result
/// vectors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionType {
    pub parameters: Vec<ValType>,
    pub return_types: Vec<ValType>,
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> (")?;
        for (i, ret) in self.return_types.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ret}")?;
        }
        write!(f, ")")
    }
}

/// The body of a subtype: a function, struct, or array shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositeType {
    Func(FunctionType),
    Struct(Vec<FieldType>),
    Array(FieldType),
}

impl CompositeType {
    pub fn is_func(&self) -> bool {
        matches!(self, CompositeType::Func(_))
    }

    pub fn func_type(&self) -> Option<&FunctionType> {
        match self {
            CompositeType::Func(ft) => Some(ft),
            _ => None,
        }
    }

    /// Field declarations of a struct or array body; empty for functions.
    pub fn field_types(&self) -> &[FieldType] {
        match self {
            CompositeType::Struct(fields) => fields,
            CompositeType::Array(field) => std::slice::from_ref(field),
            CompositeType::Func(_) => &[],
        }
    }

    /// The concrete heap-type code a reference to this composite carries.
    pub fn expand(&self) -> AbsHeapType {
        match self {
            CompositeType::Func(_) => AbsHeapType::Func,
            CompositeType::Struct(_) => AbsHeapType::Struct,
            CompositeType::Array(_) => AbsHeapType::Array,
        }
    }
}

impl fmt::Display for CompositeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositeType::Func(ft) => write!(f, "func {ft}"),
            CompositeType::Struct(fields) => {
                write!(f, "struct {{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {field}")?;
                }
                write!(f, " }}")
            }
            CompositeType::Array(field) => write!(f, "array {field}"),
        }
    }
}

/// A type-section entry: finality, declared supertype indices, and the
/// composite body. Current Wasm allows at most one supertype; the model
/// keeps the general list.
#[derive(Debug, Clone, PartialEq)]
pub struct SubType {
    pub is_final: bool,
    pub supertypes: Vec<u32>,
    pub composite: CompositeType,
}

impl SubType {
    /// A final subtype with no declared supertypes.
    pub fn from_composite(composite: CompositeType) -> SubType {
        SubType {
            is_final: true,
            supertypes: Vec::new(),
            composite,
        }
    }

    pub fn composite(&self) -> &CompositeType {
        &self.composite
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.supertypes.is_empty() {
            write!(f, "sub ")?;
            if self.is_final {
                write!(f, "final ")?;
            }
            for idx in &self.supertypes {
                write!(f, "{idx} ")?;
            }
        }
        write!(f, "{}", self.composite)
    }
}

// ===========================================================================
// Sections
// ===========================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct SectionPosition {
    pub start: u32,
    pub end: u32,
}

impl SectionPosition {
    pub fn new(start: u32, end: u32) -> SectionPosition {
        SectionPosition { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The type section: a flat subtype list plus the recursion-group
/// partition over it.
///
/// `rec_sizes[k]` is the number of consecutive entries in `types` that the
/// k-th recursion group spans; a singleton group has size 1. The group is
/// the unit of equi-recursive identity and of (de)serialization.
#[derive(Debug, Default)]
pub struct TypeSection {
    pub types: Vec<SubType>,
    pub rec_sizes: Vec<u32>,
    pub position: SectionPosition,
}

impl TypeSection {
    pub fn new() -> TypeSection {
        TypeSection::default()
    }

    /// Appends one recursion group.
    pub fn push_group(&mut self, group: Vec<SubType>) {
        self.rec_sizes.push(group.len() as u32);
        self.types.extend(group);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&SubType> {
        self.types.get(index as usize)
    }

    /// Iterates `(first_index, group_slice)` pairs over the recursion
    /// groups.
    pub fn groups(&self) -> impl Iterator<Item = (u32, &[SubType])> + '_ {
        let mut start = 0usize;
        self.rec_sizes.iter().map(move |&size| {
            let first = start;
            start += size as usize;
            (first as u32, &self.types[first..first + size as usize])
        })
    }

    pub fn to_details_string(&self) -> String {
        let mut result = String::new();
        result.push_str(&format!("Type[{}]:\n", self.types.len()));
        for (first, group) in self.groups() {
            if group.len() > 1 {
                result.push_str(&format!(" - rec[{}]:\n", group.len()));
            }
            for (i, subtype) in group.iter().enumerate() {
                result.push_str(&format!(" - type[{}] {}\n", first as usize + i, subtype));
            }
        }
        result
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Function {
    pub ftype_index: u32,
}

#[derive(Debug, Default)]
pub struct FunctionSection {
    pub functions: Vec<Function>,
    pub position: SectionPosition,
}

impl FunctionSection {
    pub fn new() -> FunctionSection {
        FunctionSection::default()
    }

    pub fn push(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn get(&self, index: u32) -> Option<&Function> {
        self.functions.get(index as usize)
    }
}

/// Placement of a data segment.
#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    /// Copied into a memory at instantiation; the offset expression is kept
    /// as raw constant-expression bytes (terminator included).
    Active { memory_index: u32, offset_expr: Vec<u8> },
    /// Available to `memory.init` and `array.new_data`.
    Passive,
}

#[derive(Debug, Clone)]
pub struct Data {
    pub mode: DataMode,
    pub init: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DataSection {
    pub data: Vec<Data>,
    pub position: SectionPosition,
}

impl DataSection {
    pub fn new() -> DataSection {
        DataSection::default()
    }

    pub fn push(&mut self, data: Data) {
        self.data.push(data);
    }

    pub fn get(&self, index: u32) -> Option<&Data> {
        self.data.get(index as usize)
    }
}

/// A section carried as an opaque payload. The decoder frames every
/// section (id byte, LEB128 size); only the sections the type system needs
/// are decoded further.
#[derive(Debug, Clone)]
pub struct RawSection {
    pub id: u8,
    /// Present for custom sections (id 0).
    pub name: Option<String>,
    pub bytes: Vec<u8>,
}

// ===========================================================================
// Module
// ===========================================================================

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub magic: u32,
    pub version: u32,

    pub types: TypeSection,
    pub functions: FunctionSection,
    pub data: DataSection,
    /// All other sections, in encounter order.
    pub raw_sections: Vec<RawSection>,
}

impl Module {
    pub fn new(name: &str) -> Module {
        Module {
            name: name.to_string(),
            magic: 0,
            version: 0,
            types: TypeSection::new(),
            functions: FunctionSection::new(),
            data: DataSection::new(),
            raw_sections: Vec::new(),
        }
    }
}
