//! The runtime type table.
//!
//! Every value carries a [`TypeId`], a dense index into this table. Struct
//! and sum types have nominal identity (each declaration registers a fresh
//! type); tuples, function types, arrays, and maps are structural and
//! deduplicated so the table exposes a single canonical id per shape.

use std::collections::HashMap;

pub use smalls_parser::ast::TypeId;

/// Index into the struct definition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructId(pub u32);

/// Index into the tuple definition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleId(pub u32);

/// Index into the sum definition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SumId(pub u32);

/// Index into the function signature table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Int,
    Float,
    Bool,
    String,
    Void,
    Object,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Primitive(PrimitiveKind),
    Struct(StructId),
    Tuple(TupleId),
    Sum(SumId),
    Function(FunctionId),
    Array { elem: TypeId },
    FixedArray { elem: TypeId, len: i32 },
    Map { key: TypeId, value: TypeId },
    Newtype { wrapped: TypeId },
    /// Game-object subtype; values carry an [`ObjectHandle`](super::value::ObjectHandle)
    /// whose tag must match.
    ObjectSubtype { tag: u32 },
    /// Placeholder for an uninstantiated generic type parameter.
    GenericParam { index: u32 },
}

#[derive(Debug, Clone)]
pub struct Type {
    pub name: String,
    pub kind: TypeKind,
    /// Byte size when stored inline (aggregate layout).
    pub size: u32,
    pub alignment: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub type_id: TypeId,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub size: u32,
    pub alignment: u32,
    pub fields: Vec<FieldDef>,
    /// `[[value_type]]` structs live inline on the frame stack.
    pub value_type: bool,
}

impl StructDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct TupleDef {
    pub size: u32,
    pub alignment: u32,
    pub element_types: Vec<TypeId>,
    pub offsets: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantDef {
    pub name: String,
    /// Discriminant value (0, 1, 2, …).
    pub tag_value: u32,
    /// Payload type; `TypeId::INVALID` for unit variants.
    pub payload_type: TypeId,
    /// Byte offset of the payload within the union.
    pub payload_offset: u32,
}

#[derive(Debug, Clone)]
pub struct SumDef {
    pub name: String,
    /// Total size: tag + padding + union.
    pub size: u32,
    pub alignment: u32,
    pub variants: Vec<VariantDef>,
    pub tag_offset: u32,
    pub union_offset: u32,
    pub union_size: u32,
    pub value_type: bool,
}

impl SumDef {
    pub fn find_variant(&self, name: &str) -> Option<&VariantDef> {
        self.variants.iter().find(|v| v.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSig {
    pub param_types: Vec<TypeId>,
    pub return_type: TypeId,
}

/// Registry of all runtime types plus the layout tables behind them.
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<Type>,
    structs: Vec<StructDef>,
    tuples: Vec<TupleDef>,
    sums: Vec<SumDef>,
    functions: Vec<FunctionSig>,

    tuple_index: HashMap<Vec<TypeId>, TypeId>,
    function_index: HashMap<FunctionSig, TypeId>,
    array_index: HashMap<TypeId, TypeId>,
    fixed_array_index: HashMap<(TypeId, i32), TypeId>,
    map_index: HashMap<(TypeId, TypeId), TypeId>,
    generic_param_index: HashMap<u32, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tid: TypeId) -> Option<&Type> {
        if !tid.is_valid() {
            return None;
        }
        self.types.get(tid.0 as usize)
    }

    pub fn struct_def(&self, id: StructId) -> Option<&StructDef> {
        self.structs.get(id.0 as usize)
    }

    pub fn tuple_def(&self, id: TupleId) -> Option<&TupleDef> {
        self.tuples.get(id.0 as usize)
    }

    pub fn sum_def(&self, id: SumId) -> Option<&SumDef> {
        self.sums.get(id.0 as usize)
    }

    pub fn function_sig(&self, id: FunctionId) -> Option<&FunctionSig> {
        self.functions.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn push(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub fn register_primitive(&mut self, name: &str, kind: PrimitiveKind) -> TypeId {
        let (size, alignment) = match kind {
            PrimitiveKind::Int | PrimitiveKind::Float => (4, 4),
            PrimitiveKind::Bool => (1, 1),
            PrimitiveKind::String => (4, 4),
            PrimitiveKind::Object => (8, 8),
            PrimitiveKind::Void => (0, 1),
            PrimitiveKind::Any => (8, 8),
        };
        self.push(Type {
            name: name.to_string(),
            kind: TypeKind::Primitive(kind),
            size,
            alignment,
        })
    }

    /// The size and alignment a value of `tid` occupies inside an aggregate
    /// byte layout. Fixed arrays nest inline; every other aggregate (value
    /// structs included) is stored as a 4-byte heap handle and copied on
    /// store to keep value semantics.
    pub fn storage_size_align(&self, tid: TypeId) -> (u32, u32) {
        let Some(ty) = self.get(tid) else {
            return (4, 4);
        };
        match &ty.kind {
            TypeKind::Primitive(_) => (ty.size.max(0), ty.alignment.max(1)),
            TypeKind::FixedArray { .. } => (ty.size, ty.alignment),
            TypeKind::Newtype { wrapped } => self.storage_size_align(*wrapped),
            TypeKind::ObjectSubtype { .. } => (8, 8),
            _ => (4, 4),
        }
    }

    /// Register a nominal struct type. Field offsets are computed here.
    pub fn register_struct_type(
        &mut self,
        name: &str,
        fields: &[(String, TypeId)],
        value_type: bool,
    ) -> TypeId {
        let mut offset = 0u32;
        let mut alignment = 1u32;
        let mut defs = Vec::with_capacity(fields.len());
        for (fname, ftid) in fields {
            let (fsize, falign) = self.storage_size_align(*ftid);
            offset = align_up(offset, falign);
            defs.push(FieldDef {
                name: fname.clone(),
                type_id: *ftid,
                offset,
            });
            offset += fsize;
            alignment = alignment.max(falign);
        }
        let size = align_up(offset.max(1), alignment);

        let struct_id = StructId(self.structs.len() as u32);
        self.structs.push(StructDef {
            name: name.to_string(),
            size,
            alignment,
            fields: defs,
            value_type,
        });
        self.push(Type {
            name: name.to_string(),
            kind: TypeKind::Struct(struct_id),
            size,
            alignment,
        })
    }

    /// Canonical tuple type for an element sequence.
    pub fn register_tuple_type(&mut self, element_types: &[TypeId]) -> TypeId {
        if let Some(tid) = self.tuple_index.get(element_types) {
            return *tid;
        }

        let mut offset = 0u32;
        let mut alignment = 1u32;
        let mut offsets = Vec::with_capacity(element_types.len());
        for elem in element_types {
            let (esize, ealign) = self.storage_size_align(*elem);
            offset = align_up(offset, ealign);
            offsets.push(offset);
            offset += esize;
            alignment = alignment.max(ealign);
        }
        let size = align_up(offset.max(1), alignment);

        let tuple_id = TupleId(self.tuples.len() as u32);
        self.tuples.push(TupleDef {
            size,
            alignment,
            element_types: element_types.to_vec(),
            offsets,
        });
        let name = format!(
            "({})",
            element_types
                .iter()
                .map(|t| self.type_name(*t))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let tid = self.push(Type {
            name,
            kind: TypeKind::Tuple(tuple_id),
            size,
            alignment,
        });
        self.tuple_index.insert(element_types.to_vec(), tid);
        tid
    }

    /// Register a nominal sum type. Tag is a u32 at offset 0; the payload
    /// union follows after alignment padding.
    pub fn register_sum_type(
        &mut self,
        name: &str,
        variants: &[(String, TypeId)],
        value_type: bool,
    ) -> TypeId {
        let mut union_size = 0u32;
        let mut union_align = 1u32;
        for (_, payload) in variants {
            if payload.is_valid() {
                let (psize, palign) = self.storage_size_align(*payload);
                union_size = union_size.max(psize);
                union_align = union_align.max(palign);
            }
        }
        let alignment = union_align.max(4);
        let union_offset = align_up(4, union_align.max(1));
        let size = align_up(union_offset + union_size, alignment);

        let defs = variants
            .iter()
            .enumerate()
            .map(|(i, (vname, payload))| VariantDef {
                name: vname.clone(),
                tag_value: i as u32,
                payload_type: *payload,
                payload_offset: union_offset,
            })
            .collect();

        let sum_id = SumId(self.sums.len() as u32);
        self.sums.push(SumDef {
            name: name.to_string(),
            size,
            alignment,
            variants: defs,
            tag_offset: 0,
            union_offset,
            union_size,
            value_type,
        });
        self.push(Type {
            name: name.to_string(),
            kind: TypeKind::Sum(sum_id),
            size,
            alignment,
        })
    }

    /// Canonical function type for a signature.
    pub fn register_function_type(&mut self, param_types: &[TypeId], return_type: TypeId) -> TypeId {
        let sig = FunctionSig {
            param_types: param_types.to_vec(),
            return_type,
        };
        if let Some(tid) = self.function_index.get(&sig) {
            return *tid;
        }
        let function_id = FunctionId(self.functions.len() as u32);
        self.functions.push(sig.clone());
        let name = format!(
            "fn({}): {}",
            param_types
                .iter()
                .map(|t| self.type_name(*t))
                .collect::<Vec<_>>()
                .join(", "),
            self.type_name(return_type)
        );
        let tid = self.push(Type {
            name,
            kind: TypeKind::Function(function_id),
            size: 4,
            alignment: 4,
        });
        self.function_index.insert(sig, tid);
        tid
    }

    pub fn register_array_type(&mut self, elem: TypeId) -> TypeId {
        if let Some(tid) = self.array_index.get(&elem) {
            return *tid;
        }
        let name = format!("{}[]", self.type_name(elem));
        let tid = self.push(Type {
            name,
            kind: TypeKind::Array { elem },
            size: 4,
            alignment: 4,
        });
        self.array_index.insert(elem, tid);
        tid
    }

    pub fn register_fixed_array_type(&mut self, elem: TypeId, len: i32) -> TypeId {
        if let Some(tid) = self.fixed_array_index.get(&(elem, len)) {
            return *tid;
        }
        let (esize, ealign) = self.storage_size_align(elem);
        let name = format!("{}[{}]", self.type_name(elem), len);
        let tid = self.push(Type {
            name,
            kind: TypeKind::FixedArray { elem, len },
            size: esize * len.max(0) as u32,
            alignment: ealign,
        });
        self.fixed_array_index.insert((elem, len), tid);
        tid
    }

    pub fn register_map_type(&mut self, key: TypeId, value: TypeId) -> TypeId {
        if let Some(tid) = self.map_index.get(&(key, value)) {
            return *tid;
        }
        let name = format!("{{{}: {}}}", self.type_name(key), self.type_name(value));
        let tid = self.push(Type {
            name,
            kind: TypeKind::Map { key, value },
            size: 4,
            alignment: 4,
        });
        self.map_index.insert((key, value), tid);
        tid
    }

    /// Nominal wrapper type with the wrapped type's representation.
    pub fn register_newtype(&mut self, name: &str, wrapped: TypeId) -> TypeId {
        let (size, alignment) = self.storage_size_align(wrapped);
        self.push(Type {
            name: name.to_string(),
            kind: TypeKind::Newtype { wrapped },
            size,
            alignment,
        })
    }

    pub fn register_object_subtype(&mut self, name: &str, tag: u32) -> TypeId {
        self.push(Type {
            name: name.to_string(),
            kind: TypeKind::ObjectSubtype { tag },
            size: 8,
            alignment: 8,
        })
    }

    /// Placeholder type for generic parameter `index` (T = 0, U = 1, …).
    pub fn generic_param_type(&mut self, index: u32) -> TypeId {
        if let Some(tid) = self.generic_param_index.get(&index) {
            return *tid;
        }
        let tid = self.push(Type {
            name: format!("${}", index),
            kind: TypeKind::GenericParam { index },
            size: 4,
            alignment: 4,
        });
        self.generic_param_index.insert(index, tid);
        tid
    }

    pub fn type_name(&self, tid: TypeId) -> String {
        self.get(tid)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "<invalid>".to_string())
    }
}

pub fn align_up(offset: u32, alignment: u32) -> u32 {
    let alignment = alignment.max(1);
    (offset + alignment - 1) & !(alignment - 1)
}
