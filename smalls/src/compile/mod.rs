//! The AST-to-bytecode compiler.
//!
//! Lowers a resolved AST into a [`BytecodeModule`] in four passes: global
//! slot assignment, function skeletons, the synthetic `__init` body, and
//! function bodies. Expression and statement lowering live in the sibling
//! modules; this one owns the driver, instruction emission, the register
//! file, field-access emitters, and generic instantiation.

mod const_eval;
mod expr;
mod registers;
mod stmt;

pub use const_eval::ConstEvaluator;
pub use registers::{RegisterAllocator, MAX_REGISTERS};

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use smalls_parser::ast::{
    has_annotation, Ast, Decl, Expr, FunctionDef, LambdaExpr, Stmt, TypeId, VarDecl,
};
use smalls_parser::span::Span;

use crate::bytecode::{
    BytecodeModule, CompiledFunction, Constant, ConstantData, Instruction, Opcode,
};
use crate::context::{Context, DebugLevel};
use crate::runtime::value::Value;
use crate::runtime::{GenericInstantiation, Runtime, SlotClass};

/// Compilation failure: the first error latched, with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.span.start_line > 0 {
            write!(
                f,
                "{} at line {}:{}",
                self.message, self.span.start_line, self.span.start_column
            )
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VariableInfo {
    pub register: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalInfo {
    pub slot: u16,
    pub is_const: bool,
}

/// Loop or switch scope collecting pending jumps for back-patching.
#[derive(Debug, Default)]
pub(crate) struct ControlScope {
    pub is_loop: bool,
    pub is_sum_switch: bool,
    pub is_object_switch: bool,
    pub target_reg: u8,
    pub sum_type_id: TypeId,
    pub break_jumps: Vec<u32>,
    pub continue_jumps: Vec<u32>,
    /// Value cases: cloned label expression plus its body pc.
    pub cases: Vec<(Expr, u32)>,
    /// Sum pattern cases: variant name plus body pc.
    pub pattern_cases: Vec<(String, u32)>,
    /// Object-subtype cases: case type plus body pc.
    pub object_pattern_cases: Vec<(TypeId, u32)>,
    pub default_pc: Option<u32>,
}

/// Hint left by path lowering so a following index expression can address a
/// fixed-array field directly instead of materializing the array.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PendingFixedArrayField {
    pub active: bool,
    pub struct_reg: u8,
    pub field_offset: u32,
    pub elem_size: u32,
    pub array_size: i32,
    pub elem_type_id: TypeId,
    pub is_heap_struct: bool,
}

pub struct Compiler<'a> {
    pub(crate) ast: &'a Ast,
    pub(crate) runtime: &'a mut Runtime,
    pub(crate) ctx: &'a Context,
    pub(crate) module: BytecodeModule,
    /// Functions built during this session; final indices are offset by the
    /// number of functions the module already holds.
    pub(crate) funcs: Vec<CompiledFunction>,
    pub(crate) func_base: usize,
    pub(crate) current: Option<usize>,

    pub(crate) registers: RegisterAllocator,
    pub(crate) local_vars: HashMap<String, VariableInfo>,
    pub(crate) upvalue_indices: HashMap<String, u8>,
    pub(crate) module_globals: HashMap<String, GlobalInfo>,
    pub(crate) control_stack: Vec<ControlScope>,
    pub(crate) block_terminated: bool,
    pub(crate) pending_fixed_array: PendingFixedArrayField,
    pub(crate) allow_fixed_array_short_circuit: bool,
    pub(crate) current_span: Span,
    pub(crate) lambda_counter: u32,
    pub(crate) generic_instantiation_count: u32,
    pub(crate) error: Option<CompileError>,
}

impl fmt::Debug for Compiler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("module", &self.module.name)
            .field("funcs", &self.funcs.len())
            .finish()
    }
}

/// Compile a resolved AST into a new bytecode module.
pub fn compile_module(
    name: &str,
    ast: &Ast,
    runtime: &mut Runtime,
    ctx: &Context,
) -> Result<BytecodeModule, CompileError> {
    let mut compiler = Compiler::new(name, ast, runtime, ctx);
    compiler.compile()?;
    Ok(compiler.finish())
}

/// Compile one generic instantiation into an already-installed module.
/// Used by the runtime when a caller in another module instantiates a
/// generic defined here. Returns the new function's index.
pub(crate) fn instantiate_generic_in_module(
    runtime: &mut Runtime,
    ctx: &Context,
    ast: &Ast,
    module: &mut BytecodeModule,
    function: &str,
    type_args: &[TypeId],
) -> Result<u32, String> {
    let mut compiler = Compiler::for_module(ast, runtime, ctx, std::mem::take(module));
    let result = compiler.instantiate_generic(function, type_args);
    let finished = compiler.finish_with_error();
    *module = finished.0;
    match (result, finished.1) {
        (Ok(idx), None) => Ok(idx),
        (_, Some(err)) => Err(err.message),
        (Err(err), None) => Err(err.message),
    }
}

impl<'a> Compiler<'a> {
    pub fn new(name: &str, ast: &'a Ast, runtime: &'a mut Runtime, ctx: &'a Context) -> Self {
        Self::for_module(ast, runtime, ctx, BytecodeModule::new(name))
    }

    fn for_module(
        ast: &'a Ast,
        runtime: &'a mut Runtime,
        ctx: &'a Context,
        module: BytecodeModule,
    ) -> Self {
        let func_base = module.functions.len();
        let mut module_globals = HashMap::new();
        for (name, info) in collect_global_slots(ast) {
            module_globals.insert(name, info);
        }
        Self {
            ast,
            runtime,
            ctx,
            module,
            funcs: Vec::new(),
            func_base,
            current: None,
            registers: RegisterAllocator::new(),
            local_vars: HashMap::new(),
            upvalue_indices: HashMap::new(),
            module_globals,
            control_stack: Vec::new(),
            block_terminated: false,
            pending_fixed_array: PendingFixedArrayField::default(),
            allow_fixed_array_short_circuit: false,
            current_span: Span::default(),
            lambda_counter: 0,
            generic_instantiation_count: 0,
            error: None,
        }
    }

    // ---- driver ------------------------------------------------------------

    pub fn compile(&mut self) -> Result<(), CompileError> {
        let node_cap = self.ctx.limits.max_ast_nodes;
        if node_cap != 0 && count_ast_nodes(self.ast) > node_cap as usize {
            return Err(CompileError {
                message: "AST node limit exceeded".to_string(),
                span: Span::default(),
            });
        }

        // Pass 0: global slots were collected at construction.
        let global_count = self.module_globals.len() as u16;
        self.module.global_count = global_count;

        // Pass 1: function skeletons for every non-generic definition.
        for decl in &self.ast.decls {
            if let Decl::Function(func) = decl {
                if func.is_generic() {
                    continue;
                }
                self.add_skeleton(func);
            }
        }
        if global_count > 0 {
            let mut init = CompiledFunction::new("__init");
            init.return_type = self.runtime.void_type();
            self.funcs.push(init);
        }

        // Pass 2: the __init body from top-level initializers.
        if global_count > 0 {
            self.compile_init_body();
        }

        // Pass 3: function bodies.
        for decl in &self.ast.decls {
            if self.error.is_some() {
                break;
            }
            if let Decl::Function(func) = decl {
                if func.is_generic() || self.is_native_function(func) {
                    continue;
                }
                let idx = self
                    .function_index(&func.name)
                    .expect("skeleton registered in pass 1");
                self.compile_function_body(func, idx);
            }
        }

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn finish(mut self) -> BytecodeModule {
        self.seal_module();
        self.module
    }

    fn finish_with_error(mut self) -> (BytecodeModule, Option<CompileError>) {
        self.seal_module();
        let err = self.error.take();
        (self.module, err)
    }

    fn seal_module(&mut self) {
        for func in self.funcs.drain(..) {
            self.module.functions.push(Rc::new(func));
        }
        let needed = self.module.global_count as usize;
        if self.module.globals.len() < needed {
            self.module.globals.resize(needed, Value::default());
        }
    }

    fn is_native_function(&self, func: &FunctionDef) -> bool {
        func.block.is_none()
            || has_annotation(&func.annotations, "native")
            || has_annotation(&func.annotations, "intrinsic")
    }

    fn add_skeleton(&mut self, func: &FunctionDef) -> usize {
        let mut compiled = CompiledFunction::new(func.name.clone());
        compiled.param_count = func.params.len() as u8;
        compiled.register_count = compiled.param_count as u16;
        compiled.return_type = func
            .return_type
            .as_ref()
            .map(|t| t.info.type_id)
            .unwrap_or_else(|| self.runtime.void_type());
        compiled.function_type = self.resolve_function_value_type(func);
        let idx = self.func_base + self.funcs.len();
        self.funcs.push(compiled);
        idx
    }

    fn resolve_function_value_type(&mut self, func: &FunctionDef) -> TypeId {
        let mut param_types = Vec::with_capacity(func.params.len());
        for param in &func.params {
            if !param.info.type_id.is_valid() {
                return TypeId::INVALID;
            }
            param_types.push(param.info.type_id);
        }
        let return_type = func
            .return_type
            .as_ref()
            .map(|t| t.info.type_id)
            .unwrap_or_else(|| self.runtime.void_type());
        if !return_type.is_valid() {
            return TypeId::INVALID;
        }
        self.runtime
            .types
            .register_function_type(&param_types, return_type)
    }

    fn compile_init_body(&mut self) {
        let idx = self
            .function_index("__init")
            .expect("__init skeleton exists");
        self.current = Some(idx);
        self.registers.reset();
        self.local_vars.clear();
        self.upvalue_indices.clear();

        let decls: Vec<&VarDecl> = self
            .ast
            .decls
            .iter()
            .flat_map(|d| match d {
                Decl::Var(var) => vec![var],
                Decl::VarList(list) => list.decls.iter().collect(),
                _ => vec![],
            })
            .collect();

        for var in decls {
            if self.error.is_some() {
                break;
            }
            let Some(info) = self.module_globals.get(&var.name).copied() else {
                continue;
            };
            if let Some(init) = &var.init {
                let src = self.emit_expr(init);
                self.emit_abx(Opcode::SetGlobal, src, info.slot);
                self.free_reg(src);
            } else {
                let tmp = self.alloc_reg();
                self.emit_abc(Opcode::LoadNil, tmp, 0, 0);
                self.emit_abx(Opcode::SetGlobal, tmp, info.slot);
                self.free_reg(tmp);
            }
        }

        self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
        self.emit_abc(Opcode::RetVoid, 0, 0, 0);
        let high_water = self.registers.high_water_mark();
        self.current_func_mut().register_count = high_water;
        self.current = None;
    }

    pub(crate) fn compile_function_body(&mut self, func: &FunctionDef, idx: usize) {
        self.current = Some(idx);
        self.registers.reset();
        self.local_vars.clear();
        self.upvalue_indices.clear();
        self.block_terminated = false;

        for (i, param) in func.params.iter().enumerate() {
            let reg = i as u8;
            self.registers.mark_used(reg);
            self.local_vars
                .insert(param.name.clone(), VariableInfo { register: reg });
        }

        if let Some(block) = &func.block {
            self.emit_block(block);
        }

        self.ensure_terminator();

        let high_water = self.registers.high_water_mark();
        let param_count = func.params.len() as u16;
        self.current_func_mut().register_count = high_water.max(param_count);
        self.current = None;
    }

    pub(crate) fn ensure_terminator(&mut self) {
        let needs = match self.current_func().instructions.last() {
            Some(instr) => !matches!(instr.opcode(), Some(Opcode::Ret) | Some(Opcode::RetVoid)),
            None => true,
        };
        if needs {
            self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
            self.emit_abc(Opcode::RetVoid, 0, 0, 0);
        }
    }

    // ---- function bookkeeping ----------------------------------------------

    pub(crate) fn function_index(&self, name: &str) -> Option<usize> {
        if let Some(idx) = self.module.get_function_index(name) {
            return Some(idx);
        }
        self.funcs
            .iter()
            .position(|f| f.name == name)
            .map(|i| self.func_base + i)
    }

    pub(crate) fn function_at(&self, idx: usize) -> Option<&CompiledFunction> {
        if idx < self.func_base {
            self.module.functions.get(idx).map(Rc::as_ref)
        } else {
            self.funcs.get(idx - self.func_base)
        }
    }

    pub(crate) fn current_func(&self) -> &CompiledFunction {
        let idx = self.current.expect("inside a function");
        &self.funcs[idx - self.func_base]
    }

    pub(crate) fn current_func_mut(&mut self) -> &mut CompiledFunction {
        let idx = self.current.expect("inside a function");
        &mut self.funcs[idx - self.func_base]
    }

    pub(crate) fn current_pc(&self) -> u32 {
        self.current_func().instructions.len() as u32
    }

    // ---- emission ----------------------------------------------------------

    pub(crate) fn emit(&mut self, instr: Instruction) {
        if self.error.is_some() || self.current.is_none() {
            return;
        }
        let span = self.current_span;
        let debug = self.ctx.diagnostics.debug_level != DebugLevel::None;
        let func = self.current_func_mut();
        func.instructions.push(instr);
        if debug {
            func.debug_locations.push(span);
        }
    }

    pub(crate) fn emit_abc(&mut self, op: Opcode, a: u8, b: u8, c: u8) {
        self.emit(Instruction::make_abc(op, a, b, c));
    }

    pub(crate) fn emit_abx(&mut self, op: Opcode, a: u8, bx: u16) {
        self.emit(Instruction::make_abx(op, a, bx));
    }

    pub(crate) fn emit_asbx(&mut self, op: Opcode, a: u8, sbx: i16) {
        self.emit(Instruction::make_asbx(op, a, sbx));
    }

    pub(crate) fn emit_jump(&mut self, op: Opcode, offset: i32) -> u32 {
        let idx = self.current_pc();
        self.emit(Instruction::make_jump(op, offset));
        idx
    }

    pub(crate) fn patch_jump(&mut self, instr_idx: u32, target_pc: u32) {
        if self.error.is_some() || self.current.is_none() {
            return;
        }
        if instr_idx as usize >= self.current_func().instructions.len() {
            self.fail("invalid jump patch");
            return;
        }
        let offset = target_pc as i32 - (instr_idx as i32 + 1);
        let instr = self.current_func().instructions[instr_idx as usize];
        let patched = match instr.opcode() {
            Some(Opcode::Jmp) => Instruction::make_jump(Opcode::Jmp, offset),
            Some(op @ (Opcode::JmpF | Opcode::JmpT)) => {
                if !(-32768..=32767).contains(&offset) {
                    self.fail(format!(
                        "jump offset {} out of range for conditional jump",
                        offset
                    ));
                    return;
                }
                Instruction::make_asbx(op, instr.a(), offset as i16)
            }
            _ => {
                self.fail("attempting to patch non-jump instruction");
                return;
            }
        };
        self.current_func_mut().instructions[instr_idx as usize] = patched;
    }

    // ---- constants ---------------------------------------------------------

    pub(crate) fn add_constant_int(&mut self, val: i32) -> u32 {
        let type_id = self.runtime.int_type();
        self.module.add_constant(Constant {
            type_id,
            data: ConstantData::Int(val),
        })
    }

    pub(crate) fn add_constant_float(&mut self, val: f32) -> u32 {
        let type_id = self.runtime.float_type();
        self.module.add_constant(Constant {
            type_id,
            data: ConstantData::Float(val),
        })
    }

    pub(crate) fn add_constant_string(&mut self, val: &str) -> u32 {
        let type_id = self.runtime.string_type();
        let string_idx = self.module.add_string(val);
        self.module.add_constant(Constant {
            type_id,
            data: ConstantData::StringIdx(string_idx),
        })
    }

    /// Load an integer, choosing `LOADI` or the constant pool by magnitude.
    pub(crate) fn emit_load_int(&mut self, dest: u8, val: i32) {
        if (-32768..=32767).contains(&val) {
            self.emit_asbx(Opcode::LoadI, dest, val as i16);
        } else {
            let k_idx = self.add_constant_int(val);
            if k_idx > u16::MAX as u32 {
                self.fail("constant pool overflow");
                return;
            }
            self.emit_abx(Opcode::LoadK, dest, k_idx as u16);
        }
    }

    // ---- failure and registers ---------------------------------------------

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(CompileError {
                message: message.into(),
                span: self.current_span,
            });
        }
    }

    pub(crate) fn alloc_reg(&mut self) -> u8 {
        match self.registers.allocate() {
            Ok(reg) => reg,
            Err(_) => {
                self.fail("register overflow: function needs more than 256 registers");
                0
            }
        }
    }

    pub(crate) fn alloc_contiguous(&mut self, count: u8) -> u8 {
        match self.registers.allocate_contiguous(count) {
            Ok(reg) => reg,
            Err(_) => {
                self.fail("register overflow: function needs more than 256 registers");
                0
            }
        }
    }

    pub(crate) fn free_reg(&mut self, reg: u8) {
        self.registers.free(reg);
    }

    pub(crate) fn allocate_local(&mut self, name: &str) -> u8 {
        if let Some(info) = self.local_vars.get(name) {
            return info.register;
        }
        let reg = self.alloc_reg();
        self.local_vars
            .insert(name.to_string(), VariableInfo { register: reg });
        reg
    }

    pub(crate) fn get_local_register(&mut self, name: &str) -> u8 {
        match self.local_vars.get(name) {
            Some(info) => info.register,
            None => {
                self.fail(format!("undefined variable: {}", name));
                0
            }
        }
    }

    pub(crate) fn is_captured_variable(&self, name: &str) -> bool {
        self.upvalue_indices.contains_key(name)
    }

    pub(crate) fn get_upvalue_index(&mut self, name: &str) -> u8 {
        match self.upvalue_indices.get(name) {
            Some(idx) => *idx,
            None => {
                self.fail(format!("unknown upvalue: {}", name));
                0
            }
        }
    }

    pub(crate) fn with_span<T>(&mut self, span: Span, f: impl FnOnce(&mut Self) -> T) -> T {
        let prev = if span.start > 0 || span.end > 0 || span.start_line > 0 {
            std::mem::replace(&mut self.current_span, span)
        } else {
            self.current_span
        };
        let out = f(self);
        self.current_span = prev;
        out
    }

    // ---- field access emission ---------------------------------------------

    pub(crate) fn is_value_type(&self, tid: TypeId) -> bool {
        self.runtime.is_value_type(tid)
    }

    fn field_opcodes(&self, tid: TypeId) -> Option<(Opcode, Opcode)> {
        match self.runtime.slot_class(tid) {
            SlotClass::Int => Some((Opcode::FieldGetI, Opcode::FieldSetI)),
            SlotClass::Float => Some((Opcode::FieldGetF, Opcode::FieldSetF)),
            SlotClass::Bool => Some((Opcode::FieldGetB, Opcode::FieldSetB)),
            SlotClass::Str => Some((Opcode::FieldGetS, Opcode::FieldSetS)),
            SlotClass::Object => Some((Opcode::FieldGetO, Opcode::FieldSetO)),
            SlotClass::Handle => Some((Opcode::FieldGetH, Opcode::FieldSetH)),
            SlotClass::FixedArray => None,
        }
    }

    fn field_opcodes_r(&self, tid: TypeId) -> (Opcode, Opcode) {
        match self.runtime.slot_class(tid) {
            SlotClass::Int => (Opcode::FieldGetIR, Opcode::FieldSetIR),
            SlotClass::Float => (Opcode::FieldGetFR, Opcode::FieldSetFR),
            SlotClass::Bool => (Opcode::FieldGetBR, Opcode::FieldSetBR),
            SlotClass::Str => (Opcode::FieldGetSR, Opcode::FieldSetSR),
            SlotClass::Object => (Opcode::FieldGetOR, Opcode::FieldSetOR),
            _ => (Opcode::FieldGetHR, Opcode::FieldSetHR),
        }
    }

    pub(crate) fn field_offset_get_opcode(&self, tid: TypeId) -> Opcode {
        match self.runtime.slot_class(tid) {
            SlotClass::Int => Opcode::FieldGetIOffR,
            SlotClass::Float => Opcode::FieldGetFOffR,
            SlotClass::Bool => Opcode::FieldGetBOffR,
            SlotClass::Str => Opcode::FieldGetSOffR,
            SlotClass::Object => Opcode::FieldGetOOffR,
            _ => Opcode::FieldGetHOffR,
        }
    }

    pub(crate) fn field_offset_set_opcode(&self, tid: TypeId) -> Opcode {
        match self.runtime.slot_class(tid) {
            SlotClass::Int => Opcode::FieldSetIOffR,
            SlotClass::Float => Opcode::FieldSetFOffR,
            SlotClass::Bool => Opcode::FieldSetBOffR,
            SlotClass::Str => Opcode::FieldSetSOffR,
            SlotClass::Object => Opcode::FieldSetOOffR,
            _ => Opcode::FieldSetHOffR,
        }
    }

    /// Read a field of a heap struct. Fixed-array fields fall back to the
    /// slow indexed opcode since they have no single-slot representation.
    pub(crate) fn emit_field_get(
        &mut self,
        dest: u8,
        struct_reg: u8,
        offset: u32,
        type_id: TypeId,
        field_idx: usize,
    ) {
        let Some((get_op, _)) = self.field_opcodes(type_id) else {
            self.emit_abc(Opcode::GetField, dest, struct_reg, field_idx as u8);
            return;
        };
        let ref_idx = self.module.add_field_ref(offset, type_id);
        if ref_idx <= 255 {
            self.emit_abc(get_op, dest, struct_reg, ref_idx as u8);
        } else {
            let (get_r, _) = self.field_opcodes_r(type_id);
            let idx_reg = self.alloc_reg();
            self.emit_load_int(idx_reg, ref_idx as i32);
            self.emit_abc(get_r, dest, struct_reg, idx_reg);
            self.free_reg(idx_reg);
        }
    }

    pub(crate) fn emit_field_set(
        &mut self,
        struct_reg: u8,
        offset: u32,
        type_id: TypeId,
        val_reg: u8,
        field_idx: usize,
    ) {
        let Some((_, set_op)) = self.field_opcodes(type_id) else {
            self.emit_abc(Opcode::SetField, struct_reg, field_idx as u8, val_reg);
            return;
        };
        let ref_idx = self.module.add_field_ref(offset, type_id);
        if ref_idx <= 255 {
            self.emit_abc(set_op, struct_reg, ref_idx as u8, val_reg);
        } else {
            let (_, set_r) = self.field_opcodes_r(type_id);
            let idx_reg = self.alloc_reg();
            self.emit_load_int(idx_reg, ref_idx as i32);
            self.emit_abc(set_r, struct_reg, idx_reg, val_reg);
            self.free_reg(idx_reg);
        }
    }

    pub(crate) fn emit_stack_field_get(
        &mut self,
        dest: u8,
        base_reg: u8,
        offset: u32,
        type_id: TypeId,
    ) {
        let ref_idx = self.module.add_field_ref(offset, type_id);
        if ref_idx <= 255 {
            self.emit_abc(Opcode::StackFieldGet, dest, base_reg, ref_idx as u8);
        } else {
            let idx_reg = self.alloc_reg();
            self.emit_load_int(idx_reg, ref_idx as i32);
            self.emit_abc(Opcode::StackFieldGetR, dest, base_reg, idx_reg);
            self.free_reg(idx_reg);
        }
    }

    pub(crate) fn emit_stack_field_set(
        &mut self,
        base_reg: u8,
        offset: u32,
        type_id: TypeId,
        val_reg: u8,
    ) {
        let ref_idx = self.module.add_field_ref(offset, type_id);
        if ref_idx <= 255 {
            self.emit_abc(Opcode::StackFieldSet, base_reg, ref_idx as u8, val_reg);
        } else {
            let idx_reg = self.alloc_reg();
            self.emit_load_int(idx_reg, ref_idx as i32);
            self.emit_abc(Opcode::StackFieldSetR, base_reg, idx_reg, val_reg);
            self.free_reg(idx_reg);
        }
    }

    /// Emit `offset_reg = base_offset + idx * elem_size` for fixed-array
    /// element addressing.
    pub(crate) fn emit_fixed_array_element_offset(
        &mut self,
        idx_reg: u8,
        base_offset: u32,
        elem_size: u32,
    ) -> u8 {
        let offset_reg = self.alloc_reg();
        let base_reg = self.alloc_reg();
        self.emit_load_int(base_reg, base_offset as i32);

        if elem_size == 1 {
            self.emit_abc(Opcode::Add, offset_reg, idx_reg, base_reg);
        } else {
            let size_reg = self.alloc_reg();
            self.emit_load_int(size_reg, elem_size as i32);
            let scaled = self.alloc_reg();
            self.emit_abc(Opcode::Mul, scaled, idx_reg, size_reg);
            self.emit_abc(Opcode::Add, offset_reg, scaled, base_reg);
            self.free_reg(scaled);
            self.free_reg(size_reg);
        }

        self.free_reg(base_reg);
        offset_reg
    }

    // ---- generic instantiation ---------------------------------------------

    /// Instantiate a generic function from this AST into the module being
    /// built. Returns the local function index.
    pub(crate) fn instantiate_generic(
        &mut self,
        name: &str,
        type_args: &[TypeId],
    ) -> Result<u32, CompileError> {
        let module_name = self.module.name.clone();
        if let Some(GenericInstantiation::Local { func_idx }) =
            self.runtime.generic_cache_get(&module_name, name, type_args)
        {
            return Ok(func_idx);
        }

        let Some(template) = self.ast.find_function(name) else {
            return Err(CompileError {
                message: format!("unknown generic function: {}", name),
                span: self.current_span,
            });
        };
        if !template.is_generic() {
            return Err(CompileError {
                message: format!("function {} is not generic", name),
                span: self.current_span,
            });
        }

        let mut inst = template.clone();
        inst.name = self.runtime.mangle_generic_name(name, type_args);
        inst.type_params.clear();
        substitute_function_types(self.runtime, &mut inst, type_args);

        let idx = self.add_skeleton(&inst);
        self.runtime.generic_cache_insert(
            &module_name,
            name,
            type_args,
            GenericInstantiation::Local {
                func_idx: idx as u32,
            },
        );

        // Compile the instantiated body with fresh per-function state.
        let saved_registers = std::mem::take(&mut self.registers);
        let saved_locals = std::mem::take(&mut self.local_vars);
        let saved_upvalues = std::mem::take(&mut self.upvalue_indices);
        let saved_current = self.current;
        let saved_terminated = self.block_terminated;

        self.compile_function_body(&inst, idx);

        self.registers = saved_registers;
        self.local_vars = saved_locals;
        self.upvalue_indices = saved_upvalues;
        self.current = saved_current;
        self.block_terminated = saved_terminated;

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(idx as u32),
        }
    }

    // ---- lambdas -----------------------------------------------------------

    /// Compile a lambda body as a new function in the module; returns its
    /// function index. Upvalue descriptors are computed against the state of
    /// the enclosing function.
    pub(crate) fn compile_lambda(&mut self, lambda: &LambdaExpr) -> u16 {
        let lambda_name = format!("$lambda_{}", self.lambda_counter);
        self.lambda_counter += 1;

        let mut compiled = CompiledFunction::new(lambda_name);
        compiled.param_count = lambda.params.len() as u8;
        compiled.return_type = lambda
            .return_type
            .as_ref()
            .map(|t| t.info.type_id)
            .unwrap_or_else(|| self.runtime.function_return_type(lambda.info.type_id));
        compiled.upvalue_count = lambda.captures.len() as u8;
        compiled.function_type = lambda.info.type_id;

        for capture in &lambda.captures {
            let descriptor = if let Some(info) = self.local_vars.get(&capture.name) {
                (info.register << 1) | 0x01
            } else if let Some(upval) = self.upvalue_indices.get(&capture.name) {
                upval << 1
            } else {
                self.fail(format!("unresolved capture: {}", capture.name));
                0
            };
            compiled.upvalue_descriptors.push(descriptor);
        }

        let func_idx = self.func_base + self.funcs.len();
        self.funcs.push(compiled);

        let saved_registers = std::mem::take(&mut self.registers);
        let saved_locals = std::mem::take(&mut self.local_vars);
        let saved_upvalues = std::mem::take(&mut self.upvalue_indices);
        let saved_current = self.current;
        let saved_terminated = self.block_terminated;

        self.current = Some(func_idx);
        self.block_terminated = false;
        for (i, capture) in lambda.captures.iter().enumerate() {
            self.upvalue_indices.insert(capture.name.clone(), i as u8);
        }
        for (i, param) in lambda.params.iter().enumerate() {
            let reg = i as u8;
            self.registers.mark_used(reg);
            self.local_vars
                .insert(param.name.clone(), VariableInfo { register: reg });
        }

        self.emit_block(&lambda.body);
        self.ensure_terminator();
        let high_water = self.registers.high_water_mark();
        let param_count = lambda.params.len() as u16;
        self.current_func_mut().register_count = high_water.max(param_count);

        self.registers = saved_registers;
        self.local_vars = saved_locals;
        self.upvalue_indices = saved_upvalues;
        self.current = saved_current;
        self.block_terminated = saved_terminated;

        func_idx as u16
    }

    // ---- statements entry (implemented in stmt.rs) -------------------------

    pub(crate) fn emit_block(&mut self, block: &smalls_parser::ast::Block) {
        let outer_terminated = self.block_terminated;
        self.block_terminated = false;
        for node in &block.nodes {
            if self.error.is_some() || self.block_terminated {
                break;
            }
            self.emit_stmt(node);
        }
        self.block_terminated = outer_terminated;
    }
}

/// Approximate node count used by the adversarial-input cap: statements and
/// expressions, counted by walking the tree.
fn count_ast_nodes(ast: &Ast) -> usize {
    fn count_expr(expr: &Expr) -> usize {
        1 + match expr {
            Expr::Literal(_) | Expr::Identifier(_) | Expr::Empty(_) => 0,
            Expr::FString(e) => e.exprs.iter().map(count_expr).sum(),
            Expr::Path(e) => e.parts.iter().map(count_expr).sum(),
            Expr::Tuple(e) => e.elements.iter().map(count_expr).sum(),
            Expr::Grouping(e) => count_expr(&e.expr),
            Expr::Unary(e) => count_expr(&e.rhs),
            Expr::Binary(e) => count_expr(&e.lhs) + count_expr(&e.rhs),
            Expr::Comparison(e) => count_expr(&e.lhs) + count_expr(&e.rhs),
            Expr::Logical(e) => count_expr(&e.lhs) + count_expr(&e.rhs),
            Expr::Conditional(e) => {
                count_expr(&e.test) + count_expr(&e.true_branch) + count_expr(&e.false_branch)
            }
            Expr::Assign(e) => count_expr(&e.lhs) + count_expr(&e.rhs),
            Expr::Call(e) => count_expr(&e.callee) + e.args.iter().map(count_expr).sum::<usize>(),
            Expr::Index(e) => count_expr(&e.target) + count_expr(&e.index),
            Expr::Cast(e) => count_expr(&e.expr),
            Expr::BraceInit(e) => e
                .items
                .iter()
                .map(|item| {
                    item.key.as_ref().map(count_expr).unwrap_or(0) + count_expr(&item.value)
                })
                .sum(),
            Expr::Lambda(e) => count_block(&e.body),
        }
    }

    fn count_stmt(stmt: &Stmt) -> usize {
        1 + match stmt {
            Stmt::Block(block) => count_block(block),
            Stmt::Empty(_) => 0,
            Stmt::Expr(s) => count_expr(&s.expr),
            Stmt::If(s) => {
                count_expr(&s.cond)
                    + count_block(&s.then_block)
                    + s.else_block.as_ref().map(count_block).unwrap_or(0)
            }
            Stmt::For(s) => {
                s.init.as_ref().map(|i| count_stmt(i)).unwrap_or(0)
                    + s.check.as_ref().map(count_expr).unwrap_or(0)
                    + s.inc.as_ref().map(count_expr).unwrap_or(0)
                    + count_block(&s.block)
            }
            Stmt::ForEach(s) => count_expr(&s.collection) + count_block(&s.block),
            Stmt::Jump(s) => s.exprs.iter().map(count_expr).sum(),
            Stmt::Label(s) => s.expr.as_ref().map(count_expr).unwrap_or(0),
            Stmt::Switch(s) => count_expr(&s.target) + count_block(&s.block),
            Stmt::Decl(Decl::Var(var)) => var.init.as_ref().map(count_expr).unwrap_or(0),
            Stmt::Decl(Decl::VarList(list)) => list
                .decls
                .iter()
                .map(|d| d.init.as_ref().map(count_expr).unwrap_or(0))
                .sum(),
            Stmt::Decl(_) => 0,
        }
    }

    fn count_block(block: &smalls_parser::ast::Block) -> usize {
        block.nodes.iter().map(count_stmt).sum()
    }

    ast.decls
        .iter()
        .map(|decl| match decl {
            Decl::Function(func) => 1 + func.block.as_ref().map(count_block).unwrap_or(0),
            Decl::Var(var) => 1 + var.init.as_ref().map(count_expr).unwrap_or(0),
            Decl::VarList(list) => list
                .decls
                .iter()
                .map(|d| 1 + d.init.as_ref().map(count_expr).unwrap_or(0))
                .sum(),
            _ => 1,
        })
        .sum()
}

fn collect_global_slots(ast: &Ast) -> Vec<(String, GlobalInfo)> {
    let mut out = Vec::new();
    let mut slot = 0u16;
    for decl in &ast.decls {
        match decl {
            Decl::Var(var) => {
                out.push((
                    var.name.clone(),
                    GlobalInfo {
                        slot,
                        is_const: var.info.is_const,
                    },
                ));
                slot += 1;
            }
            Decl::VarList(list) => {
                for var in &list.decls {
                    out.push((
                        var.name.clone(),
                        GlobalInfo {
                            slot,
                            is_const: var.info.is_const,
                        },
                    ));
                    slot += 1;
                }
            }
            _ => {}
        }
    }
    out
}

/// Rewrite every type id in an instantiated generic function.
fn substitute_function_types(runtime: &mut Runtime, func: &mut FunctionDef, args: &[TypeId]) {
    func.info.type_id = runtime.substitute_type(func.info.type_id, args);
    for param in &mut func.params {
        substitute_var_decl(runtime, param, args);
    }
    if let Some(ret) = &mut func.return_type {
        ret.info.type_id = runtime.substitute_type(ret.info.type_id, args);
    }
    if let Some(block) = &mut func.block {
        substitute_block(runtime, block, args);
    }
}

fn substitute_var_decl(runtime: &mut Runtime, var: &mut VarDecl, args: &[TypeId]) {
    var.info.type_id = runtime.substitute_type(var.info.type_id, args);
    if let Some(ty) = &mut var.ty {
        ty.info.type_id = runtime.substitute_type(ty.info.type_id, args);
    }
    if let Some(init) = &mut var.init {
        substitute_expr(runtime, init, args);
    }
}

fn substitute_block(runtime: &mut Runtime, block: &mut smalls_parser::ast::Block, args: &[TypeId]) {
    for node in &mut block.nodes {
        substitute_stmt(runtime, node, args);
    }
}

fn substitute_stmt(runtime: &mut Runtime, stmt: &mut Stmt, args: &[TypeId]) {
    match stmt {
        Stmt::Block(block) => substitute_block(runtime, block, args),
        Stmt::Empty(_) => {}
        Stmt::Expr(e) => substitute_expr(runtime, &mut e.expr, args),
        Stmt::If(s) => {
            substitute_expr(runtime, &mut s.cond, args);
            substitute_block(runtime, &mut s.then_block, args);
            if let Some(else_block) = &mut s.else_block {
                substitute_block(runtime, else_block, args);
            }
        }
        Stmt::For(s) => {
            if let Some(init) = &mut s.init {
                substitute_stmt(runtime, init, args);
            }
            if let Some(check) = &mut s.check {
                substitute_expr(runtime, check, args);
            }
            if let Some(inc) = &mut s.inc {
                substitute_expr(runtime, inc, args);
            }
            substitute_block(runtime, &mut s.block, args);
        }
        Stmt::ForEach(s) => {
            for var in [&mut s.var, &mut s.key_var, &mut s.value_var]
                .into_iter()
                .flatten()
            {
                substitute_var_decl(runtime, var, args);
            }
            substitute_expr(runtime, &mut s.collection, args);
            substitute_block(runtime, &mut s.block, args);
            s.element_type = runtime.substitute_type(s.element_type, args);
            s.key_type = runtime.substitute_type(s.key_type, args);
            s.value_type = runtime.substitute_type(s.value_type, args);
        }
        Stmt::Jump(s) => {
            for e in &mut s.exprs {
                substitute_expr(runtime, e, args);
            }
        }
        Stmt::Label(s) => {
            if let Some(e) = &mut s.expr {
                substitute_expr(runtime, e, args);
            }
            for binding in &mut s.bindings {
                substitute_var_decl(runtime, binding, args);
            }
        }
        Stmt::Switch(s) => {
            substitute_expr(runtime, &mut s.target, args);
            substitute_block(runtime, &mut s.block, args);
        }
        Stmt::Decl(Decl::Var(var)) => substitute_var_decl(runtime, var, args),
        Stmt::Decl(Decl::VarList(list)) => {
            for var in &mut list.decls {
                substitute_var_decl(runtime, var, args);
            }
        }
        Stmt::Decl(_) => {}
    }
}

fn substitute_expr(runtime: &mut Runtime, expr: &mut Expr, args: &[TypeId]) {
    let tid = expr.info().type_id;
    expr.info_mut().type_id = runtime.substitute_type(tid, args);
    match expr {
        Expr::Literal(_) | Expr::Identifier(_) | Expr::Empty(_) => {}
        Expr::FString(e) => {
            for sub in &mut e.exprs {
                substitute_expr(runtime, sub, args);
            }
        }
        Expr::Path(e) => {
            for part in &mut e.parts {
                substitute_expr(runtime, part, args);
            }
        }
        Expr::Tuple(e) => {
            for elem in &mut e.elements {
                substitute_expr(runtime, elem, args);
            }
        }
        Expr::Grouping(e) => substitute_expr(runtime, &mut e.expr, args),
        Expr::Unary(e) => substitute_expr(runtime, &mut e.rhs, args),
        Expr::Binary(e) => {
            substitute_expr(runtime, &mut e.lhs, args);
            substitute_expr(runtime, &mut e.rhs, args);
        }
        Expr::Comparison(e) => {
            substitute_expr(runtime, &mut e.lhs, args);
            substitute_expr(runtime, &mut e.rhs, args);
        }
        Expr::Logical(e) => {
            substitute_expr(runtime, &mut e.lhs, args);
            substitute_expr(runtime, &mut e.rhs, args);
        }
        Expr::Conditional(e) => {
            substitute_expr(runtime, &mut e.test, args);
            substitute_expr(runtime, &mut e.true_branch, args);
            substitute_expr(runtime, &mut e.false_branch, args);
        }
        Expr::Assign(e) => {
            substitute_expr(runtime, &mut e.lhs, args);
            substitute_expr(runtime, &mut e.rhs, args);
        }
        Expr::Call(e) => {
            substitute_expr(runtime, &mut e.callee, args);
            for arg in &mut e.args {
                substitute_expr(runtime, arg, args);
            }
            for t in &mut e.inferred_type_args {
                *t = runtime.substitute_type(*t, args);
            }
            e.newtype_target = runtime.substitute_type(e.newtype_target, args);
        }
        Expr::Index(e) => {
            substitute_expr(runtime, &mut e.target, args);
            substitute_expr(runtime, &mut e.index, args);
        }
        Expr::Cast(e) => {
            substitute_expr(runtime, &mut e.expr, args);
            e.target.info.type_id = runtime.substitute_type(e.target.info.type_id, args);
        }
        Expr::BraceInit(e) => {
            if let Some(ty) = &mut e.ty {
                ty.info.type_id = runtime.substitute_type(ty.info.type_id, args);
            }
            for item in &mut e.items {
                if let Some(key) = &mut item.key {
                    substitute_expr(runtime, key, args);
                }
                substitute_expr(runtime, &mut item.value, args);
            }
        }
        Expr::Lambda(e) => {
            for param in &mut e.params {
                substitute_var_decl(runtime, param, args);
            }
            if let Some(ret) = &mut e.return_type {
                ret.info.type_id = runtime.substitute_type(ret.info.type_id, args);
            }
            substitute_block(runtime, &mut e.body, args);
            for capture in &mut e.captures {
                capture.type_id = runtime.substitute_type(capture.type_id, args);
            }
        }
    }
}
