//! The Smalls runtime: type table, garbage-collected heap, string interner,
//! module directory, external function registry, script operator registry,
//! and the generic-instantiation cache.
//!
//! The runtime is single-threaded; the compiler and VM reach it through
//! `&mut` borrows. Concurrent scripts run in separate VM instances sharing
//! one runtime.

pub mod heap;
pub mod interner;
pub mod ops;
pub mod types;
pub mod value;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use smalls_parser::ast::{Ast, BinaryOp, CmpOp, LogicalOp, TypeId, UnaryOp};

use crate::bytecode::{BytecodeModule, CompiledFunction, UNRESOLVED_EXTERNAL};
use crate::context::Context;
use heap::{Closure, Heap, HeapData, MapKey, MapObject, StringObject, UpvalueCell, UpvalueState};
use interner::{StringInterner, Symbol};
use ops::{OperatorRegistry, ScriptFunctionRef};
use types::{
    FunctionSig, PrimitiveKind, StructDef, SumDef, TupleDef, Type, TypeKind, TypeTable,
};
use value::{HeapPtr, ObjectHandle, Value, ValueRepr};

/// Index into the runtime's module directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

#[derive(Debug)]
pub struct ModuleEntry {
    pub bytecode: BytecodeModule,
    /// Resolved AST kept for cross-module generic instantiation.
    pub ast: Option<Rc<Ast>>,
}

/// Host function callable from bytecode. Receives the runtime and the
/// calling VM (supporting re-entrant `execute` from host code); a returned
/// error becomes a VM failure naming the function.
pub type NativeFn =
    Rc<dyn Fn(&mut Runtime, &mut crate::vm::VirtualMachine, &[Value]) -> Result<Value, String>>;

pub struct NativeEntry {
    pub name: String,
    pub func: NativeFn,
}

impl fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEntry").field("name", &self.name).finish()
    }
}

/// Entry in the external function registry, reached through `CALLEXT`.
pub enum ExternalFunction {
    Native { name: Symbol, func: NativeFn },
    Script { module: ModuleId, func_idx: u32 },
}

impl ExternalFunction {
    pub fn is_native(&self) -> bool {
        matches!(self, ExternalFunction::Native { .. })
    }
}

impl fmt::Debug for ExternalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalFunction::Native { name, .. } => {
                f.debug_struct("Native").field("name", name).finish()
            }
            ExternalFunction::Script { module, func_idx } => f
                .debug_struct("Script")
                .field("module", module)
                .field("func_idx", func_idx)
                .finish(),
        }
    }
}

/// Result of instantiating a generic function for a set of type arguments.
#[derive(Debug, Clone)]
pub enum GenericInstantiation {
    /// Compiled into the calling module at this function index.
    Local { func_idx: u32 },
    /// Compiled into the defining module; call through this qualified name.
    External { qualified: String },
}

/// Live map iterator backing the `MapIterBegin/Next/End` intrinsic triple.
#[derive(Debug)]
struct MapIter {
    map: HeapPtr,
    keys: Vec<MapKey>,
    pos: usize,
}

/// How a field type is stored inside an aggregate byte layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
    Int,
    Float,
    Bool,
    Str,
    Object,
    /// Inline element bytes.
    FixedArray,
    /// 4-byte heap handle.
    Handle,
}

/// A prepared write into an aggregate byte layout.
#[derive(Debug, Clone)]
pub enum SlotWrite {
    W1(u8),
    W4(u32),
    W8(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy)]
struct PrimitiveIds {
    int: TypeId,
    float: TypeId,
    boolean: TypeId,
    string: TypeId,
    void: TypeId,
    object: TypeId,
    any: TypeId,
}

#[derive(Debug)]
pub struct Runtime {
    pub types: TypeTable,
    pub heap: Heap,
    pub interner: StringInterner,
    pub ops: OperatorRegistry,
    modules: Vec<ModuleEntry>,
    module_index: HashMap<String, ModuleId>,
    externals: Vec<ExternalFunction>,
    external_index: HashMap<Symbol, u32>,
    natives: Vec<NativeEntry>,
    map_iters: Vec<Option<MapIter>>,
    generic_cache: HashMap<(String, String, Vec<TypeId>), GenericInstantiation>,
    prim: PrimitiveIds,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        let mut types = TypeTable::new();
        let prim = PrimitiveIds {
            int: types.register_primitive("int", PrimitiveKind::Int),
            float: types.register_primitive("float", PrimitiveKind::Float),
            boolean: types.register_primitive("bool", PrimitiveKind::Bool),
            string: types.register_primitive("string", PrimitiveKind::String),
            void: types.register_primitive("void", PrimitiveKind::Void),
            object: types.register_primitive("object", PrimitiveKind::Object),
            any: types.register_primitive("any", PrimitiveKind::Any),
        };
        Self {
            types,
            heap: Heap::new(),
            interner: StringInterner::new(),
            ops: OperatorRegistry::new(),
            modules: Vec::new(),
            module_index: HashMap::new(),
            externals: Vec::new(),
            external_index: HashMap::new(),
            natives: Vec::new(),
            map_iters: Vec::new(),
            generic_cache: HashMap::new(),
            prim,
        }
    }

    // ---- primitive type ids -----------------------------------------------

    pub fn int_type(&self) -> TypeId {
        self.prim.int
    }

    pub fn float_type(&self) -> TypeId {
        self.prim.float
    }

    pub fn bool_type(&self) -> TypeId {
        self.prim.boolean
    }

    pub fn string_type(&self) -> TypeId {
        self.prim.string
    }

    pub fn void_type(&self) -> TypeId {
        self.prim.void
    }

    pub fn object_type(&self) -> TypeId {
        self.prim.object
    }

    pub fn any_type(&self) -> TypeId {
        self.prim.any
    }

    pub fn make_int(&self, v: i32) -> Value {
        Value::make_int_typed(v, self.prim.int)
    }

    pub fn make_float(&self, v: f32) -> Value {
        Value::make_float_typed(v, self.prim.float)
    }

    pub fn make_bool(&self, v: bool) -> Value {
        Value::make_bool_typed(v, self.prim.boolean)
    }

    pub fn make_string(&mut self, s: &str) -> Value {
        let ptr = self.alloc_string(s);
        Value::make_heap(ptr, self.prim.string)
    }

    // ---- type queries ------------------------------------------------------

    pub fn get_type(&self, tid: TypeId) -> Option<&Type> {
        self.types.get(tid)
    }

    pub fn type_name(&self, tid: TypeId) -> String {
        self.types.type_name(tid)
    }

    pub fn struct_def_of(&self, tid: TypeId) -> Option<&StructDef> {
        match self.types.get(tid)?.kind {
            TypeKind::Struct(sid) => self.types.struct_def(sid),
            _ => None,
        }
    }

    pub fn sum_def_of(&self, tid: TypeId) -> Option<&SumDef> {
        match self.types.get(tid)?.kind {
            TypeKind::Sum(sid) => self.types.sum_def(sid),
            _ => None,
        }
    }

    pub fn tuple_def_of(&self, tid: TypeId) -> Option<&TupleDef> {
        match self.types.get(tid)?.kind {
            TypeKind::Tuple(tid_) => self.types.tuple_def(tid_),
            _ => None,
        }
    }

    pub fn function_sig_of(&self, tid: TypeId) -> Option<&FunctionSig> {
        match self.types.get(tid)?.kind {
            TypeKind::Function(fid) => self.types.function_sig(fid),
            _ => None,
        }
    }

    pub fn function_return_type(&self, tid: TypeId) -> TypeId {
        self.function_sig_of(tid)
            .map(|sig| sig.return_type)
            .unwrap_or(TypeId::INVALID)
    }

    pub fn is_object_like_type(&self, tid: TypeId) -> bool {
        matches!(
            self.types.get(tid).map(|t| &t.kind),
            Some(TypeKind::Primitive(PrimitiveKind::Object)) | Some(TypeKind::ObjectSubtype { .. })
        )
    }

    pub fn object_subtype_tag(&self, tid: TypeId) -> Option<u32> {
        match self.types.get(tid)?.kind {
            TypeKind::ObjectSubtype { tag } => Some(tag),
            _ => None,
        }
    }

    /// Whether values of this type live on the frame's byte stack.
    pub fn is_value_type(&self, tid: TypeId) -> bool {
        match self.types.get(tid).map(|t| &t.kind) {
            Some(TypeKind::FixedArray { .. }) => true,
            Some(TypeKind::Struct(sid)) => self
                .types
                .struct_def(*sid)
                .map(|d| d.value_type)
                .unwrap_or(false),
            Some(TypeKind::Sum(sid)) => self
                .types
                .sum_def(*sid)
                .map(|d| d.value_type)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The newtype-unwrapped base of a type.
    pub fn unwrap_newtype(&self, mut tid: TypeId) -> TypeId {
        while let Some(TypeKind::Newtype { wrapped }) = self.types.get(tid).map(|t| &t.kind) {
            tid = *wrapped;
        }
        tid
    }

    pub fn slot_class(&self, tid: TypeId) -> SlotClass {
        let base = self.unwrap_newtype(tid);
        match self.types.get(base).map(|t| &t.kind) {
            Some(TypeKind::Primitive(PrimitiveKind::Int)) => SlotClass::Int,
            Some(TypeKind::Primitive(PrimitiveKind::Float)) => SlotClass::Float,
            Some(TypeKind::Primitive(PrimitiveKind::Bool)) => SlotClass::Bool,
            Some(TypeKind::Primitive(PrimitiveKind::String)) => SlotClass::Str,
            Some(TypeKind::Primitive(PrimitiveKind::Object))
            | Some(TypeKind::ObjectSubtype { .. }) => SlotClass::Object,
            Some(TypeKind::FixedArray { .. }) => SlotClass::FixedArray,
            _ => SlotClass::Handle,
        }
    }

    // ---- heap allocation ---------------------------------------------------

    pub fn alloc_string(&mut self, s: &str) -> HeapPtr {
        self.heap
            .allocate(self.prim.string, HeapData::Str(StringObject::new(s)))
    }

    pub fn alloc_string_obj(&mut self, s: StringObject) -> HeapPtr {
        self.heap.allocate(self.prim.string, HeapData::Str(s))
    }

    /// The characters behind a string value; empty for null handles.
    pub fn get_string_view(&self, ptr: HeapPtr) -> &str {
        self.heap.get_string(ptr).map(|s| s.as_str()).unwrap_or("")
    }

    pub fn alloc_struct(&mut self, tid: TypeId) -> Option<HeapPtr> {
        let size = self.struct_def_of(tid)?.size as usize;
        Some(self.heap.allocate(tid, HeapData::Bytes(vec![0; size])))
    }

    pub fn alloc_tuple(&mut self, tid: TypeId) -> Option<HeapPtr> {
        let size = self.tuple_def_of(tid)?.size as usize;
        Some(self.heap.allocate(tid, HeapData::Bytes(vec![0; size])))
    }

    pub fn alloc_sum(&mut self, tid: TypeId) -> Option<HeapPtr> {
        let size = self.sum_def_of(tid)?.size as usize;
        Some(self.heap.allocate(tid, HeapData::Bytes(vec![0; size])))
    }

    /// Box a raw byte image of `tid` (used when value-type aggregates cross
    /// into heap storage).
    pub fn alloc_boxed_bytes(&mut self, tid: TypeId, bytes: Vec<u8>) -> HeapPtr {
        self.heap.allocate(tid, HeapData::Bytes(bytes))
    }

    /// Allocate a dynamic array of `count` default-initialized elements.
    /// `array_tid` must be an array type.
    pub fn alloc_array(&mut self, array_tid: TypeId, count: u32) -> Option<HeapPtr> {
        let TypeKind::Array { elem } = self.types.get(array_tid)?.kind else {
            return None;
        };
        let mut elems = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let v = self.default_value(elem);
            elems.push(v);
        }
        Some(self.heap.allocate(array_tid, HeapData::Array(elems)))
    }

    pub fn alloc_map(&mut self, map_tid: TypeId) -> Option<HeapPtr> {
        let TypeKind::Map { key, value } = self.types.get(map_tid)?.kind else {
            return None;
        };
        Some(self.heap.allocate(
            map_tid,
            HeapData::Map(MapObject {
                key_type: key,
                value_type: value,
                entries: HashMap::new(),
            }),
        ))
    }

    pub fn alloc_closure(
        &mut self,
        function_type: TypeId,
        function: Rc<CompiledFunction>,
        module: ModuleId,
        upvalue_capacity: usize,
    ) -> HeapPtr {
        self.heap.allocate(
            function_type,
            HeapData::Closure(Closure {
                module,
                function,
                upvalues: Vec::with_capacity(upvalue_capacity),
            }),
        )
    }

    pub fn alloc_upvalue(&mut self, absolute_register: u32) -> HeapPtr {
        self.heap.allocate(
            TypeId::INVALID,
            HeapData::Upvalue(UpvalueCell {
                state: UpvalueState::Open(absolute_register),
            }),
        )
    }

    /// Default value for a freshly created slot of `tid`.
    pub fn default_value(&mut self, tid: TypeId) -> Value {
        let base = self.unwrap_newtype(tid);
        match self.types.get(base).map(|t| t.kind.clone()) {
            Some(TypeKind::Primitive(PrimitiveKind::Int)) => Value::make_int_typed(0, tid),
            Some(TypeKind::Primitive(PrimitiveKind::Float)) => Value::make_float_typed(0.0, tid),
            Some(TypeKind::Primitive(PrimitiveKind::Bool)) => Value::make_bool_typed(false, tid),
            Some(TypeKind::Primitive(PrimitiveKind::String)) => {
                let ptr = self.alloc_string("");
                Value::make_heap(ptr, tid)
            }
            Some(TypeKind::Primitive(PrimitiveKind::Object))
            | Some(TypeKind::ObjectSubtype { .. }) => {
                Value::make_object(ObjectHandle::default(), tid)
            }
            _ => Value {
                type_id: tid,
                repr: ValueRepr::Nil,
            },
        }
    }

    // ---- aggregate byte layouts -------------------------------------------

    /// Read one field slot out of an aggregate byte image. `stack_base` is
    /// the image's base offset in the current frame stack when the container
    /// lives there; heap-boxed containers pass `None`, making nested
    /// fixed-array reads copy into fresh boxes.
    pub fn read_slot_from(
        &mut self,
        bytes: &[u8],
        offset: u32,
        field_tid: TypeId,
        stack_base: Option<u32>,
    ) -> Option<Value> {
        let off = offset as usize;
        match self.slot_class(field_tid) {
            SlotClass::Int => {
                let v = i32::from_le_bytes(bytes.get(off..off + 4)?.try_into().ok()?);
                Some(Value::make_int_typed(v, field_tid))
            }
            SlotClass::Float => {
                let v = f32::from_le_bytes(bytes.get(off..off + 4)?.try_into().ok()?);
                Some(Value::make_float_typed(v, field_tid))
            }
            SlotClass::Bool => Some(Value::make_bool_typed(*bytes.get(off)? != 0, field_tid)),
            SlotClass::Str => {
                let raw = u32::from_le_bytes(bytes.get(off..off + 4)?.try_into().ok()?);
                Some(Value::make_heap(HeapPtr(raw), field_tid))
            }
            SlotClass::Object => {
                let tag = u32::from_le_bytes(bytes.get(off..off + 4)?.try_into().ok()?);
                let id = u32::from_le_bytes(bytes.get(off + 4..off + 8)?.try_into().ok()?);
                Some(Value::make_object(ObjectHandle { tag, id }, field_tid))
            }
            SlotClass::FixedArray => match stack_base {
                Some(base) => Some(Value::make_stack(base + offset, field_tid)),
                None => {
                    let (size, _) = self.types.storage_size_align(field_tid);
                    let image = bytes.get(off..off + size as usize)?.to_vec();
                    let ptr = self.alloc_boxed_bytes(field_tid, image);
                    Some(Value::make_heap(ptr, field_tid))
                }
            },
            SlotClass::Handle => {
                let raw = u32::from_le_bytes(bytes.get(off..off + 4)?.try_into().ok()?);
                Some(Value::make_heap(HeapPtr(raw), field_tid))
            }
        }
    }

    /// Prepare a slot write: resolves coercions and value-type boxing.
    /// `frame_stack` supplies the source bytes when `val` is a stack value.
    pub fn prepare_slot_write(
        &mut self,
        field_tid: TypeId,
        val: Value,
        frame_stack: Option<&[u8]>,
    ) -> Result<SlotWrite, String> {
        match self.slot_class(field_tid) {
            SlotClass::Int => match val.repr {
                ValueRepr::Int(v) => Ok(SlotWrite::W4(v as u32)),
                ValueRepr::Bool(b) => Ok(SlotWrite::W4(b as u32)),
                _ => Err("type mismatch writing int field".to_string()),
            },
            SlotClass::Float => match val.repr {
                ValueRepr::Float(v) => Ok(SlotWrite::W4(v.to_bits())),
                ValueRepr::Int(v) => Ok(SlotWrite::W4((v as f32).to_bits())),
                _ => Err("type mismatch writing float field".to_string()),
            },
            SlotClass::Bool => match val.repr {
                ValueRepr::Bool(b) => Ok(SlotWrite::W1(b as u8)),
                ValueRepr::Int(v) => Ok(SlotWrite::W1((v != 0) as u8)),
                _ => Err("type mismatch writing bool field".to_string()),
            },
            SlotClass::Str => match val.repr {
                ValueRepr::Heap(ptr) => Ok(SlotWrite::W4(ptr.0)),
                ValueRepr::Nil => Ok(SlotWrite::W4(0)),
                _ => Err("type mismatch writing string field".to_string()),
            },
            SlotClass::Object => match val.repr {
                ValueRepr::Object(handle) => {
                    Ok(SlotWrite::W8(((handle.id as u64) << 32) | handle.tag as u64))
                }
                _ => Err("type mismatch writing object field".to_string()),
            },
            SlotClass::FixedArray => {
                let (size, _) = self.types.storage_size_align(field_tid);
                let image = self.value_bytes(val, size, frame_stack)?;
                Ok(SlotWrite::Bytes(image))
            }
            SlotClass::Handle => match val.repr {
                ValueRepr::Heap(ptr) => {
                    // Value-type aggregates keep copy semantics by re-boxing.
                    if self.is_value_type(val.type_id) {
                        let image = self
                            .heap
                            .get_bytes(ptr)
                            .cloned()
                            .ok_or_else(|| "value-type payload missing".to_string())?;
                        let boxed = self.alloc_boxed_bytes(val.type_id, image);
                        Ok(SlotWrite::W4(boxed.0))
                    } else {
                        Ok(SlotWrite::W4(ptr.0))
                    }
                }
                ValueRepr::Stack(_) => {
                    let (size, _) = self.types.storage_size_align(val.type_id);
                    let size = self
                        .get_type(val.type_id)
                        .map(|t| t.size)
                        .unwrap_or(size);
                    let image = self.value_bytes(val, size, frame_stack)?;
                    let boxed = self.alloc_boxed_bytes(val.type_id, image);
                    Ok(SlotWrite::W4(boxed.0))
                }
                ValueRepr::Nil => Ok(SlotWrite::W4(0)),
                _ => Err("type mismatch writing field".to_string()),
            },
        }
    }

    /// The raw byte image behind a stack or boxed value.
    fn value_bytes(
        &self,
        val: Value,
        size: u32,
        frame_stack: Option<&[u8]>,
    ) -> Result<Vec<u8>, String> {
        match val.repr {
            ValueRepr::Stack(offset) => {
                let stack =
                    frame_stack.ok_or_else(|| "stack value without frame stack".to_string())?;
                let start = offset as usize;
                stack
                    .get(start..start + size as usize)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| "stack value out of range".to_string())
            }
            ValueRepr::Heap(ptr) => self
                .heap
                .get_bytes(ptr)
                .cloned()
                .ok_or_else(|| "heap value is not an aggregate".to_string()),
            _ => Err("expected aggregate value".to_string()),
        }
    }

    /// Read a field of a heap struct by index (slow `GETFIELD` path).
    pub fn read_struct_field_by_index(&mut self, ptr: HeapPtr, field_idx: usize) -> Option<Value> {
        let tid = self.heap.type_of(ptr);
        let field = self.struct_def_of(tid)?.fields.get(field_idx)?.clone();
        let bytes = self.heap.get_bytes(ptr)?.clone();
        self.read_slot_from(&bytes, field.offset, field.type_id, None)
    }

    /// Write a field of a heap struct by index (slow `SETFIELD` path).
    pub fn write_struct_field_by_index(
        &mut self,
        ptr: HeapPtr,
        field_idx: usize,
        val: Value,
        frame_stack: Option<&[u8]>,
    ) -> Result<(), String> {
        let tid = self.heap.type_of(ptr);
        let field = self
            .struct_def_of(tid)
            .and_then(|d| d.fields.get(field_idx))
            .cloned()
            .ok_or_else(|| "struct field index out of range".to_string())?;
        let write = self.prepare_slot_write(field.type_id, val, frame_stack)?;
        let bytes = self
            .heap
            .get_bytes_mut(ptr)
            .ok_or_else(|| "not a struct object".to_string())?;
        apply_slot_write(bytes, field.offset, &write);
        Ok(())
    }

    pub fn read_tuple_element_by_index(&mut self, ptr: HeapPtr, index: usize) -> Option<Value> {
        let tid = self.heap.type_of(ptr);
        let def = self.tuple_def_of(tid)?;
        let elem_tid = *def.element_types.get(index)?;
        let offset = *def.offsets.get(index)?;
        let bytes = self.heap.get_bytes(ptr)?.clone();
        self.read_slot_from(&bytes, offset, elem_tid, None)
    }

    pub fn write_tuple_element_by_index(
        &mut self,
        ptr: HeapPtr,
        index: usize,
        val: Value,
        frame_stack: Option<&[u8]>,
    ) -> Result<(), String> {
        let tid = self.heap.type_of(ptr);
        let (elem_tid, offset) = {
            let def = self
                .tuple_def_of(tid)
                .ok_or_else(|| "not a tuple object".to_string())?;
            (
                *def.element_types
                    .get(index)
                    .ok_or_else(|| "tuple index out of range".to_string())?,
                def.offsets[index],
            )
        };
        let write = self.prepare_slot_write(elem_tid, val, frame_stack)?;
        let bytes = self
            .heap
            .get_bytes_mut(ptr)
            .ok_or_else(|| "not a tuple object".to_string())?;
        apply_slot_write(bytes, offset, &write);
        Ok(())
    }

    pub fn tuple_element_count(&self, tid: TypeId) -> usize {
        self.tuple_def_of(tid)
            .map(|d| d.element_types.len())
            .unwrap_or(0)
    }

    // ---- sum values --------------------------------------------------------

    pub fn read_sum_tag(bytes: &[u8], def: &SumDef) -> u32 {
        let off = def.tag_offset as usize;
        bytes
            .get(off..off + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or(u32::MAX)
    }

    pub fn write_sum_tag(bytes: &mut [u8], def: &SumDef, tag: u32) {
        let off = def.tag_offset as usize;
        if let Some(slot) = bytes.get_mut(off..off + 4) {
            slot.copy_from_slice(&tag.to_le_bytes());
        }
    }

    // ---- dynamic arrays ----------------------------------------------------

    pub fn array_get(&self, ptr: HeapPtr, index: u32) -> Option<Value> {
        self.heap.get_array(ptr)?.get(index as usize).copied()
    }

    pub fn array_set(&mut self, ptr: HeapPtr, index: u32, val: Value) -> bool {
        match self
            .heap
            .get_array_mut(ptr)
            .and_then(|a| a.get_mut(index as usize))
        {
            Some(slot) => {
                *slot = val;
                true
            }
            None => false,
        }
    }

    // ---- maps --------------------------------------------------------------

    pub fn map_key_from_value(&self, val: Value) -> Result<MapKey, String> {
        match val.repr {
            ValueRepr::Int(v) => Ok(MapKey::Int(v)),
            ValueRepr::Bool(b) => Ok(MapKey::Bool(b)),
            ValueRepr::Object(h) => Ok(MapKey::Object(((h.id as u64) << 32) | h.tag as u64)),
            ValueRepr::Heap(ptr) if val.type_id == self.prim.string => {
                Ok(MapKey::Str(self.get_string_view(ptr).to_string()))
            }
            _ => Err(format!(
                "invalid map key type: {}",
                self.type_name(val.type_id)
            )),
        }
    }

    fn map_key_to_value(&mut self, key: &MapKey, key_tid: TypeId) -> Value {
        match key {
            MapKey::Int(v) => Value::make_int_typed(*v, key_tid),
            MapKey::Bool(b) => Value::make_bool_typed(*b, key_tid),
            MapKey::Object(raw) => Value::make_object(
                ObjectHandle {
                    tag: (*raw & 0xFFFF_FFFF) as u32,
                    id: (*raw >> 32) as u32,
                },
                key_tid,
            ),
            MapKey::Str(s) => {
                let s = s.clone();
                let ptr = self.alloc_string(&s);
                Value::make_heap(ptr, key_tid)
            }
        }
    }

    pub fn map_get(&self, ptr: HeapPtr, key: Value) -> Result<Option<Value>, String> {
        let key = self.map_key_from_value(key)?;
        Ok(self
            .heap
            .get_map(ptr)
            .and_then(|m| m.entries.get(&key))
            .copied())
    }

    pub fn map_set(&mut self, ptr: HeapPtr, key: Value, val: Value) -> Result<(), String> {
        let key = self.map_key_from_value(key)?;
        let map = self
            .heap
            .get_map_mut(ptr)
            .ok_or_else(|| "not a map object".to_string())?;
        map.entries.insert(key, val);
        Ok(())
    }

    pub fn map_iter_begin(&mut self, ptr: HeapPtr) -> Result<i32, String> {
        let map = self
            .heap
            .get_map(ptr)
            .ok_or_else(|| "not a map object".to_string())?;
        let keys: Vec<MapKey> = map.entries.keys().cloned().collect();
        let iter = MapIter { map: ptr, keys, pos: 0 };
        if let Some(slot) = self.map_iters.iter().position(Option::is_none) {
            self.map_iters[slot] = Some(iter);
            Ok(slot as i32)
        } else {
            self.map_iters.push(Some(iter));
            Ok(self.map_iters.len() as i32 - 1)
        }
    }

    /// Advance an iterator. Returns `(key, value)`; keys removed since the
    /// snapshot are skipped.
    pub fn map_iter_next(&mut self, handle: i32) -> Result<Option<(Value, Value)>, String> {
        loop {
            let (map_ptr, key) = {
                let iter = self
                    .map_iters
                    .get_mut(handle as usize)
                    .and_then(Option::as_mut)
                    .ok_or_else(|| "invalid map iterator".to_string())?;
                if iter.pos >= iter.keys.len() {
                    return Ok(None);
                }
                let key = iter.keys[iter.pos].clone();
                iter.pos += 1;
                (iter.map, key)
            };
            let Some(map) = self.heap.get_map(map_ptr) else {
                return Ok(None);
            };
            let key_tid = map.key_type;
            if let Some(value) = map.entries.get(&key).copied() {
                let key_val = self.map_key_to_value(&key, key_tid);
                return Ok(Some((key_val, value)));
            }
        }
    }

    pub fn map_iter_end(&mut self, handle: i32) {
        if let Some(slot) = self.map_iters.get_mut(handle as usize) {
            *slot = None;
        }
    }

    // ---- module directory --------------------------------------------------

    /// Install a compiled module and register its functions as externally
    /// callable under `module.function` qualified names.
    pub fn add_module(&mut self, bytecode: BytecodeModule, ast: Option<Rc<Ast>>) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        for (idx, func) in bytecode.functions.iter().enumerate() {
            let qualified = format!("{}.{}", bytecode.name, func.name);
            let sym = self.interner.intern(&qualified);
            let ext_idx = self.externals.len() as u32;
            self.externals.push(ExternalFunction::Script {
                module: id,
                func_idx: idx as u32,
            });
            self.external_index.insert(sym, ext_idx);
        }
        self.module_index.insert(bytecode.name.clone(), id);
        self.modules.push(ModuleEntry { bytecode, ast });
        id
    }

    pub fn get_module(&self, name: &str) -> Option<ModuleId> {
        self.module_index.get(name).copied()
    }

    pub fn module(&self, id: ModuleId) -> &BytecodeModule {
        &self.modules[id.0 as usize].bytecode
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut BytecodeModule {
        &mut self.modules[id.0 as usize].bytecode
    }

    pub fn module_ast(&self, id: ModuleId) -> Option<Rc<Ast>> {
        self.modules[id.0 as usize].ast.clone()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Fill a module's external-index slots by interned-name lookup. Each
    /// slot is written at most once; missing names are reported.
    pub fn resolve_module_externals(&mut self, id: ModuleId) -> Result<(), String> {
        let entry = &mut self.modules[id.0 as usize].bytecode;
        for (i, sym) in entry.external_refs.iter().enumerate() {
            if entry.external_indices[i] != UNRESOLVED_EXTERNAL {
                continue;
            }
            match self.external_index.get(sym) {
                Some(ext_idx) => entry.external_indices[i] = *ext_idx,
                None => {
                    return Err(format!(
                        "unresolved external function: {}",
                        self.interner.resolve(*sym)
                    ))
                }
            }
        }
        tracing::debug!(module = %entry.name, "resolved external references");
        Ok(())
    }

    /// Register a host function; callable via `CALLNATIVE` by index and via
    /// `CALLEXT` by qualified name.
    pub fn register_native_function(&mut self, qualified_name: &str, func: NativeFn) -> u32 {
        let native_idx = self.natives.len() as u32;
        self.natives.push(NativeEntry {
            name: qualified_name.to_string(),
            func: Rc::clone(&func),
        });
        let sym = self.interner.intern(qualified_name);
        let ext_idx = self.externals.len() as u32;
        self.externals.push(ExternalFunction::Native { name: sym, func });
        self.external_index.insert(sym, ext_idx);
        native_idx
    }

    pub fn find_external_function(&self, qualified_name: &str) -> Option<u32> {
        let sym = self.interner.lookup(qualified_name)?;
        self.external_index.get(&sym).copied()
    }

    pub fn get_external_function(&self, idx: u32) -> Option<&ExternalFunction> {
        self.externals.get(idx as usize)
    }

    pub fn get_native_function(&self, idx: u32) -> Option<&NativeEntry> {
        self.natives.get(idx as usize)
    }

    // ---- script operators --------------------------------------------------

    pub fn find_script_binary_op(
        &self,
        op: BinaryOp,
        lhs: TypeId,
        rhs: TypeId,
    ) -> Option<&ScriptFunctionRef> {
        self.ops.find_binary(op, lhs, rhs)
    }

    pub fn find_script_comparison_op(
        &self,
        op: ops::RegisteredCmp,
        lhs: TypeId,
        rhs: TypeId,
    ) -> Option<&ScriptFunctionRef> {
        self.ops.find_comparison(op, lhs, rhs)
    }

    pub fn find_script_unary_op(&self, op: UnaryOp, operand: TypeId) -> Option<&ScriptFunctionRef> {
        self.ops.find_unary(op, operand)
    }

    pub fn find_str_op(&self, operand: TypeId) -> Option<&ScriptFunctionRef> {
        self.ops.find_str(operand)
    }

    pub fn find_hash_op(&self, operand: TypeId) -> Option<&ScriptFunctionRef> {
        self.ops.find_hash(operand)
    }

    // ---- generic value operations -----------------------------------------

    /// Generic binary arithmetic with int/float promotion and string
    /// concatenation. Returns None for unsupported operand combinations and
    /// division by zero.
    pub fn execute_binary_op(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
        use ValueRepr::{Float, Heap, Int};
        match (lhs.repr, rhs.repr) {
            (Int(a), Int(b)) => {
                let v = match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Div => {
                        if b == 0 {
                            return None;
                        }
                        a.wrapping_div(b)
                    }
                    BinaryOp::Mod => {
                        if b == 0 {
                            return None;
                        }
                        a.wrapping_rem(b)
                    }
                };
                Some(self.make_int(v))
            }
            (Float(a), Float(b)) => self.float_arith(op, a, b),
            (Int(a), Float(b)) => self.float_arith(op, a as f32, b),
            (Float(a), Int(b)) => self.float_arith(op, a, b as f32),
            (Heap(a), Heap(b))
                if op == BinaryOp::Add
                    && lhs.type_id == self.prim.string
                    && rhs.type_id == self.prim.string =>
            {
                let joined = format!("{}{}", self.get_string_view(a), self.get_string_view(b));
                Some(self.make_string(&joined))
            }
            _ => None,
        }
    }

    fn float_arith(&self, op: BinaryOp, a: f32, b: f32) -> Option<Value> {
        let v = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b == 0.0 {
                    return None;
                }
                a / b
            }
            BinaryOp::Mod => {
                if b == 0.0 {
                    return None;
                }
                a % b
            }
        };
        Some(self.make_float(v))
    }

    pub fn execute_cmp_op(&self, op: CmpOp, lhs: Value, rhs: Value) -> Option<Value> {
        use std::cmp::Ordering;
        use ValueRepr::{Bool, Float, Heap, Int, Object};

        let ordering: Option<Ordering> = match (lhs.repr, rhs.repr) {
            (Int(a), Int(b)) => a.partial_cmp(&b),
            (Float(a), Float(b)) => a.partial_cmp(&b),
            (Int(a), Float(b)) => (a as f32).partial_cmp(&b),
            (Float(a), Int(b)) => a.partial_cmp(&(b as f32)),
            (Bool(a), Bool(b)) => a.partial_cmp(&b),
            (Heap(a), Heap(b))
                if lhs.type_id == self.prim.string && rhs.type_id == self.prim.string =>
            {
                self.get_string_view(a).partial_cmp(self.get_string_view(b))
            }
            (Object(a), Object(b)) => {
                if matches!(op, CmpOp::Eq | CmpOp::Ne) {
                    Some(if a == b { Ordering::Equal } else { Ordering::Less })
                } else {
                    None
                }
            }
            (Heap(a), Heap(b)) if lhs.type_id == rhs.type_id => {
                if matches!(op, CmpOp::Eq | CmpOp::Ne) {
                    Some(if a == b { Ordering::Equal } else { Ordering::Less })
                } else {
                    None
                }
            }
            _ => None,
        };

        let ordering = ordering?;
        let result = match op {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        };
        Some(self.make_bool(result))
    }

    pub fn execute_logical_op(&self, op: LogicalOp, lhs: Value, rhs: Value) -> Option<Value> {
        use ValueRepr::{Bool, Int};
        match (lhs.repr, rhs.repr) {
            (Bool(a), Bool(b)) => Some(self.make_bool(match op {
                LogicalOp::And => a && b,
                LogicalOp::Or => a || b,
            })),
            (Int(a), Int(b)) => Some(self.make_int(match op {
                LogicalOp::And => (a != 0 && b != 0) as i32,
                LogicalOp::Or => (a != 0 || b != 0) as i32,
            })),
            _ => None,
        }
    }

    pub fn execute_unary_op(&self, op: UnaryOp, operand: Value) -> Option<Value> {
        use ValueRepr::{Bool, Float, Int};
        match (op, operand.repr) {
            (UnaryOp::Neg, Int(v)) => Some(self.make_int(v.wrapping_neg())),
            (UnaryOp::Neg, Float(v)) => Some(self.make_float(-v)),
            (UnaryOp::Not, Bool(b)) => Some(self.make_bool(!b)),
            (UnaryOp::Not, Int(v)) => Some(self.make_bool(v == 0)),
            _ => None,
        }
    }

    // ---- generic instantiation cache --------------------------------------

    pub fn generic_cache_get(
        &self,
        module: &str,
        function: &str,
        type_args: &[TypeId],
    ) -> Option<GenericInstantiation> {
        self.generic_cache
            .get(&(module.to_string(), function.to_string(), type_args.to_vec()))
            .cloned()
    }

    pub fn generic_cache_insert(
        &mut self,
        module: &str,
        function: &str,
        type_args: &[TypeId],
        inst: GenericInstantiation,
    ) {
        self.generic_cache.insert(
            (module.to_string(), function.to_string(), type_args.to_vec()),
            inst,
        );
    }

    /// Mangled name of a generic instantiation, e.g. `id$int`.
    pub fn mangle_generic_name(&self, name: &str, type_args: &[TypeId]) -> String {
        let args = type_args
            .iter()
            .map(|t| self.type_name(*t))
            .collect::<Vec<_>>()
            .join("_");
        format!("{}${}", name, args)
    }

    /// Rewrite a type by substituting generic parameter placeholders.
    pub fn substitute_type(&mut self, tid: TypeId, args: &[TypeId]) -> TypeId {
        let Some(ty) = self.types.get(tid) else {
            return tid;
        };
        match ty.kind.clone() {
            TypeKind::GenericParam { index } => {
                args.get(index as usize).copied().unwrap_or(tid)
            }
            TypeKind::Array { elem } => {
                let sub = self.substitute_type(elem, args);
                if sub == elem {
                    tid
                } else {
                    self.types.register_array_type(sub)
                }
            }
            TypeKind::FixedArray { elem, len } => {
                let sub = self.substitute_type(elem, args);
                if sub == elem {
                    tid
                } else {
                    self.types.register_fixed_array_type(sub, len)
                }
            }
            TypeKind::Map { key, value } => {
                let sk = self.substitute_type(key, args);
                let sv = self.substitute_type(value, args);
                if sk == key && sv == value {
                    tid
                } else {
                    self.types.register_map_type(sk, sv)
                }
            }
            TypeKind::Function(fid) => {
                let sig = self.types.function_sig(fid).cloned();
                let Some(sig) = sig else { return tid };
                let params: Vec<TypeId> = sig
                    .param_types
                    .iter()
                    .map(|p| self.substitute_type(*p, args))
                    .collect();
                let ret = self.substitute_type(sig.return_type, args);
                if params == sig.param_types && ret == sig.return_type {
                    tid
                } else {
                    self.types.register_function_type(&params, ret)
                }
            }
            TypeKind::Tuple(tup) => {
                let elems = self.types.tuple_def(tup).map(|d| d.element_types.clone());
                let Some(elems) = elems else { return tid };
                let subs: Vec<TypeId> =
                    elems.iter().map(|e| self.substitute_type(*e, args)).collect();
                if subs == elems {
                    tid
                } else {
                    self.types.register_tuple_type(&subs)
                }
            }
            _ => tid,
        }
    }

    /// Instantiate a generic function defined in another module. Compiles
    /// the instantiation into the defining module and returns the qualified
    /// name to call through `CALLEXT`.
    pub fn ensure_generic_instantiation_external(
        &mut self,
        provider: &str,
        function: &str,
        type_args: &[TypeId],
        ctx: &Context,
    ) -> Result<String, String> {
        if let Some(GenericInstantiation::External { qualified }) =
            self.generic_cache_get(provider, function, type_args)
        {
            return Ok(qualified);
        }

        let id = self
            .get_module(provider)
            .ok_or_else(|| format!("unknown module: {}", provider))?;
        let ast = self
            .module_ast(id)
            .ok_or_else(|| format!("module {} has no source for instantiation", provider))?;

        let mut bytecode = std::mem::take(&mut self.modules[id.0 as usize].bytecode);
        let result =
            crate::compile::instantiate_generic_in_module(self, ctx, &ast, &mut bytecode, function, type_args);
        let new_func = match &result {
            Ok(func_idx) => Some((*func_idx, bytecode.functions[*func_idx as usize].name.clone())),
            Err(_) => None,
        };
        self.modules[id.0 as usize].bytecode = bytecode;
        result?;

        let Some((func_idx, mangled)) = new_func else {
            return Err("failed to instantiate generic function".to_string());
        };
        let qualified = format!("{}.{}", provider, mangled);
        let sym = self.interner.intern(&qualified);
        let ext_idx = self.externals.len() as u32;
        self.externals.push(ExternalFunction::Script {
            module: id,
            func_idx,
        });
        self.external_index.insert(sym, ext_idx);
        self.generic_cache_insert(
            provider,
            function,
            type_args,
            GenericInstantiation::External {
                qualified: qualified.clone(),
            },
        );
        Ok(qualified)
    }

    // ---- garbage collection -----------------------------------------------

    /// Mark-and-sweep over the typed heap. Roots come from the given VMs
    /// (registers, frame stacks, upvalues) and from module globals. Returns
    /// the number of objects collected.
    pub fn collect_garbage(&mut self, vms: &[&crate::vm::VirtualMachine]) -> usize {
        self.heap.clear_marks();

        let mut worklist: Vec<HeapPtr> = Vec::new();
        for vm in vms {
            let mut visitor = RootCollector {
                roots: &mut worklist,
            };
            vm.enumerate_roots(self, &mut visitor);
        }
        for entry in &self.modules {
            for global in &entry.bytecode.globals {
                if let ValueRepr::Heap(ptr) = global.repr {
                    worklist.push(ptr);
                }
            }
        }

        while let Some(ptr) = worklist.pop() {
            if !self.heap.mark(ptr) {
                continue;
            }
            collect_children(&self.heap, &self.types, ptr, &mut worklist);
        }

        self.heap.sweep()
    }

    /// Enumerate heap references inside an aggregate byte image.
    pub fn scan_value_heap_refs(&self, tid: TypeId, bytes: &[u8], out: &mut Vec<HeapPtr>) {
        scan_bytes(&self.types, tid, bytes, out);
    }
}

/// Visitor handed to [`crate::vm::VirtualMachine::enumerate_roots`].
pub trait GcRootVisitor {
    fn visit_root(&mut self, ptr: HeapPtr);
}

struct RootCollector<'a> {
    roots: &'a mut Vec<HeapPtr>,
}

impl GcRootVisitor for RootCollector<'_> {
    fn visit_root(&mut self, ptr: HeapPtr) {
        if !ptr.is_null() {
            self.roots.push(ptr);
        }
    }
}

pub fn apply_slot_write(bytes: &mut [u8], offset: u32, write: &SlotWrite) {
    let off = offset as usize;
    match write {
        SlotWrite::W1(v) => {
            if let Some(slot) = bytes.get_mut(off) {
                *slot = *v;
            }
        }
        SlotWrite::W4(v) => {
            if let Some(slot) = bytes.get_mut(off..off + 4) {
                slot.copy_from_slice(&v.to_le_bytes());
            }
        }
        SlotWrite::W8(v) => {
            if let Some(slot) = bytes.get_mut(off..off + 8) {
                slot.copy_from_slice(&v.to_le_bytes());
            }
        }
        SlotWrite::Bytes(image) => {
            if let Some(slot) = bytes.get_mut(off..off + image.len()) {
                slot.copy_from_slice(image);
            }
        }
    }
}

fn push_value_ptr(val: &Value, out: &mut Vec<HeapPtr>) {
    if let ValueRepr::Heap(ptr) = val.repr {
        if !ptr.is_null() {
            out.push(ptr);
        }
    }
}

fn collect_children(heap: &Heap, types: &TypeTable, ptr: HeapPtr, out: &mut Vec<HeapPtr>) {
    let Some(obj) = heap.get(ptr) else { return };
    match &obj.data {
        HeapData::Bytes(bytes) => scan_bytes(types, obj.type_id, bytes, out),
        HeapData::Str(_) => {}
        HeapData::Array(elems) => {
            for elem in elems {
                push_value_ptr(elem, out);
            }
        }
        HeapData::Map(map) => {
            for value in map.entries.values() {
                push_value_ptr(value, out);
            }
        }
        HeapData::Closure(closure) => {
            for upvalue in &closure.upvalues {
                if !upvalue.is_null() {
                    out.push(*upvalue);
                }
            }
        }
        HeapData::Upvalue(cell) => {
            if let UpvalueState::Closed(val) = &cell.state {
                push_value_ptr(val, out);
            }
        }
    }
}

fn scan_bytes(types: &TypeTable, tid: TypeId, bytes: &[u8], out: &mut Vec<HeapPtr>) {
    let Some(ty) = types.get(tid) else { return };
    match &ty.kind {
        TypeKind::Struct(sid) => {
            if let Some(def) = types.struct_def(*sid) {
                for field in &def.fields {
                    scan_slot(types, field.type_id, bytes, field.offset, out);
                }
            }
        }
        TypeKind::Tuple(tup) => {
            if let Some(def) = types.tuple_def(*tup) {
                for (elem, offset) in def.element_types.iter().zip(&def.offsets) {
                    scan_slot(types, *elem, bytes, *offset, out);
                }
            }
        }
        TypeKind::Sum(sid) => {
            if let Some(def) = types.sum_def(*sid) {
                let tag = Runtime::read_sum_tag(bytes, def);
                if let Some(variant) = def.variants.iter().find(|v| v.tag_value == tag) {
                    if variant.payload_type.is_valid() {
                        scan_slot(types, variant.payload_type, bytes, variant.payload_offset, out);
                    }
                }
            }
        }
        TypeKind::FixedArray { elem, len } => {
            let (stride, _) = types.storage_size_align(*elem);
            for i in 0..*len as u32 {
                scan_slot(types, *elem, bytes, i * stride, out);
            }
        }
        _ => {}
    }
}

fn scan_slot(types: &TypeTable, tid: TypeId, bytes: &[u8], offset: u32, out: &mut Vec<HeapPtr>) {
    let mut base = tid;
    while let Some(TypeKind::Newtype { wrapped }) = types.get(base).map(|t| &t.kind) {
        base = *wrapped;
    }
    let off = offset as usize;
    match types.get(base).map(|t| &t.kind) {
        Some(TypeKind::Primitive(PrimitiveKind::String)) | Some(TypeKind::Struct(_))
        | Some(TypeKind::Sum(_)) | Some(TypeKind::Tuple(_)) | Some(TypeKind::Array { .. })
        | Some(TypeKind::Map { .. }) | Some(TypeKind::Function(_))
        | Some(TypeKind::Primitive(PrimitiveKind::Any)) => {
            if let Some(raw) = bytes
                .get(off..off + 4)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_le_bytes)
            {
                if raw != 0 {
                    out.push(HeapPtr(raw));
                }
            }
        }
        Some(TypeKind::FixedArray { .. }) => {
            let (size, _) = types.storage_size_align(base);
            if let Some(slice) = bytes.get(off..off + size as usize) {
                scan_bytes(types, base, slice, out);
            }
        }
        _ => {}
    }
}
