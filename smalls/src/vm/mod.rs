//! The register virtual machine.
//!
//! 8192 global registers shared across call frames via base-offset indexing,
//! a 64-frame call-depth limit, optional gas and step limits, and latched
//! failure with stack-trace capture. Execution is single-threaded and
//! re-entrant: `execute` may be called while frames are live; the entry
//! frame's register 0 is saved and restored around the nested run.

mod frame;
mod intrinsics_exec;

pub use frame::{CallFrame, StackSlot};

use std::rc::Rc;

use smalls_parser::ast::{BinaryOp, CmpOp, IntrinsicId, LogicalOp, TypeId, UnaryOp};

use crate::bytecode::{
    BytecodeModule, CompiledFunction, ConstantData, Opcode, SUMINIT_NO_PAYLOAD,
    UNRESOLVED_EXTERNAL,
};
use crate::runtime::types::TypeKind;
use crate::runtime::value::{HeapPtr, Value, ValueRepr};
use crate::runtime::{
    apply_slot_write, ExternalFunction, GcRootVisitor, ModuleId, Runtime, SlotClass,
};
use crate::verifier::verify_bytecode_module;

pub const MAX_REGISTERS: usize = 8192;
pub const MAX_CALL_DEPTH: usize = 64;

#[derive(Debug)]
pub struct VirtualMachine {
    registers: Vec<Value>,
    /// First free register above all live frames.
    stack_top: usize,
    frames: Vec<CallFrame>,
    /// Cached base register of the innermost frame.
    current_base: u32,

    last_result: Value,
    failed: bool,
    error_message: String,

    step_limit_enabled: bool,
    remaining_steps: u64,
    gas_enabled: bool,
    remaining_gas: u64,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self {
            registers: vec![Value::default(); MAX_REGISTERS],
            stack_top: 0,
            frames: Vec::with_capacity(MAX_CALL_DEPTH),
            current_base: 0,
            last_result: Value::default(),
            failed: false,
            error_message: String::new(),
            step_limit_enabled: false,
            remaining_steps: 0,
            gas_enabled: false,
            remaining_gas: 0,
        }
    }

    pub fn reset(&mut self, rt: &mut Runtime) {
        while let Some(frame) = self.frames.pop() {
            Self::close_frame_upvalues(&self.registers, rt, &frame);
        }
        self.stack_top = 0;
        self.current_base = 0;
        self.failed = false;
        self.error_message.clear();
        self.gas_enabled = false;
        self.remaining_gas = 0;
    }

    /// Bound total dispatched instructions; used by fuzzing harnesses.
    pub fn set_step_limit(&mut self, max_steps: u64) {
        self.step_limit_enabled = true;
        self.remaining_steps = max_steps;
    }

    pub fn clear_step_limit(&mut self) {
        self.step_limit_enabled = false;
        self.remaining_steps = 0;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Abort the script. The first failure latches; the dispatch loop keeps
    /// draining but observable effects are short-circuited.
    pub fn fail(&mut self, rt: &Runtime, msg: impl Into<String>) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.error_message = msg.into();
        let trace = self.get_stack_trace(rt);
        tracing::error!("[vm] {}\n{}", self.error_message, trace);
    }

    fn init_gas(&mut self, gas_limit: u64) {
        self.gas_enabled = gas_limit != 0;
        self.remaining_gas = gas_limit;
    }

    fn consume_gas(&mut self, rt: &Runtime) -> bool {
        if !self.gas_enabled {
            return true;
        }
        if self.remaining_gas == 0 {
            self.fail(rt, "Script exceeded execution limit");
            return false;
        }
        self.remaining_gas -= 1;
        true
    }

    // ---- registers ---------------------------------------------------------

    fn reg(&self, r: u8) -> Value {
        self.registers[(self.current_base + r as u32) as usize]
    }

    fn set_reg(&mut self, r: u8, v: Value) {
        self.registers[(self.current_base + r as u32) as usize] = v;
    }

    // ---- frames ------------------------------------------------------------

    fn push_frame(
        &mut self,
        rt: &Runtime,
        module: ModuleId,
        func: Rc<CompiledFunction>,
        ret_reg: u32,
        closure: HeapPtr,
    ) {
        if !self.consume_gas(rt) {
            return;
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            self.fail(rt, "Stack overflow: max call depth reached");
            return;
        }

        let base = self.stack_top as u32;
        if base as usize + func.register_count as usize > MAX_REGISTERS {
            self.fail(rt, "Register stack overflow");
            return;
        }
        self.stack_top = base as usize + func.register_count as usize;

        self.frames
            .push(CallFrame::new(module, func, base, ret_reg, closure));
        self.current_base = base;
    }

    fn pop_frame(&mut self, rt: &mut Runtime) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        Self::close_frame_upvalues(&self.registers, rt, &frame);
        self.stack_top = frame.base_register as usize;
        self.current_base = self.frames.last().map(|f| f.base_register).unwrap_or(0);
    }

    fn close_frame_upvalues(registers: &[Value], rt: &mut Runtime, frame: &CallFrame) {
        for ptr in &frame.open_upvalues {
            if let Some(cell) = rt.heap.get_upvalue_mut(*ptr) {
                if let crate::runtime::heap::UpvalueState::Open(abs) = cell.state {
                    cell.state =
                        crate::runtime::heap::UpvalueState::Closed(registers[abs as usize]);
                }
            }
        }
    }

    fn close_upvalues_of_current(&mut self, rt: &mut Runtime) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        for ptr in frame.open_upvalues.drain(..) {
            if let Some(cell) = rt.heap.get_upvalue_mut(ptr) {
                if let crate::runtime::heap::UpvalueState::Open(abs) = cell.state {
                    cell.state =
                        crate::runtime::heap::UpvalueState::Closed(self.registers[abs as usize]);
                }
            }
        }
    }

    fn get_or_create_upvalue(&mut self, rt: &mut Runtime, frame_idx: usize, reg_idx: u8) -> HeapPtr {
        let abs = self.frames[frame_idx].base_register + reg_idx as u32;
        for ptr in &self.frames[frame_idx].open_upvalues {
            if let Some(cell) = rt.heap.get_upvalue(*ptr) {
                if matches!(cell.state, crate::runtime::heap::UpvalueState::Open(a) if a == abs) {
                    return *ptr;
                }
            }
        }
        let ptr = rt.alloc_upvalue(abs);
        self.frames[frame_idx].open_upvalues.push(ptr);
        ptr
    }

    // ---- entry points ------------------------------------------------------

    /// Execute a function of a module. Returns the result value, or an
    /// invalid value on failure. Gas applies only to top-level entries.
    pub fn execute(
        &mut self,
        rt: &mut Runtime,
        module_id: ModuleId,
        function_name: &str,
        args: &[Value],
        gas_limit: u64,
    ) -> Value {
        let entry_depth = self.frames.len();
        let saved_reg0 = (entry_depth > 0).then(|| self.reg(0));

        if entry_depth == 0 {
            self.reset(rt);
            self.init_gas(gas_limit);
        }

        if !self.prepare_module(rt, module_id) {
            return Value::default();
        }

        // Module globals are written once by __init before any other
        // function of the module runs.
        if function_name != "__init" && !self.run_module_init(rt, module_id, entry_depth) {
            return Value::default();
        }

        let Some(func) = rt.module(module_id).get_function(function_name).cloned() else {
            self.fail(rt, format!("Function not found: {}", function_name));
            return Value::default();
        };

        if args.len() != func.param_count as usize {
            self.fail(
                rt,
                format!(
                    "Argument count mismatch for {}: expected {}, got {}",
                    function_name, func.param_count, args.len()
                ),
            );
            return Value::default();
        }

        self.push_frame(rt, module_id, func, 0, HeapPtr::NULL);
        if self.failed {
            return Value::default();
        }
        for (i, arg) in args.iter().enumerate() {
            self.set_reg(i as u8, *arg);
        }

        let success = self.run(rt, entry_depth);
        self.finish_entry(success, entry_depth, saved_reg0)
    }

    /// Execute a closure value directly.
    pub fn execute_closure(
        &mut self,
        rt: &mut Runtime,
        closure_ptr: HeapPtr,
        args: &[Value],
        gas_limit: u64,
    ) -> Value {
        let Some(closure) = rt.heap.get_closure(closure_ptr) else {
            self.fail(rt, "execute_closure: invalid closure");
            return Value::default();
        };
        let module_id = closure.module;
        let func = Rc::clone(&closure.function);

        let entry_depth = self.frames.len();
        let saved_reg0 = (entry_depth > 0).then(|| self.reg(0));
        if entry_depth == 0 {
            self.reset(rt);
            self.init_gas(gas_limit);
        }

        if !self.prepare_module(rt, module_id) {
            return Value::default();
        }

        if args.len() != func.param_count as usize {
            self.fail(
                rt,
                format!(
                    "Argument count mismatch: expected {}, got {}",
                    func.param_count,
                    args.len()
                ),
            );
            return Value::default();
        }

        self.push_frame(rt, module_id, func, 0, closure_ptr);
        if self.failed {
            return Value::default();
        }
        for (i, arg) in args.iter().enumerate() {
            self.set_reg(i as u8, *arg);
        }

        let success = self.run(rt, entry_depth);
        self.finish_entry(success, entry_depth, saved_reg0)
    }

    fn finish_entry(
        &mut self,
        success: bool,
        entry_depth: usize,
        saved_reg0: Option<Value>,
    ) -> Value {
        if success {
            if entry_depth > 0 && !self.frames.is_empty() {
                // Reentrant call: the result landed in the entry frame's r0.
                let result = self.reg(0);
                if let Some(saved) = saved_reg0 {
                    self.set_reg(0, saved);
                }
                return result;
            }
            return self.last_result;
        }

        if entry_depth > 0 && !self.frames.is_empty() {
            if let Some(saved) = saved_reg0 {
                self.set_reg(0, saved);
            }
        }
        Value::default()
    }

    /// Resolve externals and verify the module before first execution.
    fn prepare_module(&mut self, rt: &mut Runtime, module_id: ModuleId) -> bool {
        if let Err(err) = rt.resolve_module_externals(module_id) {
            self.fail(rt, err);
            return false;
        }
        if !rt.module(module_id).verified {
            if let Err(err) = verify_bytecode_module(rt.module(module_id)) {
                self.fail(rt, err);
                return false;
            }
            rt.module_mut(module_id).verified = true;
        }
        true
    }

    fn run_module_init(&mut self, rt: &mut Runtime, module_id: ModuleId, entry_depth: usize) -> bool {
        let module = rt.module(module_id);
        if module.global_count == 0 || module.globals_initialized {
            return true;
        }
        let Some(init) = module.get_function("__init").cloned() else {
            return true;
        };
        rt.module_mut(module_id).globals_initialized = true;

        self.push_frame(rt, module_id, init, 0, HeapPtr::NULL);
        if self.failed {
            return false;
        }
        self.run(rt, entry_depth)
    }

    // ---- the dispatch loop -------------------------------------------------

    pub fn run(&mut self, rt: &mut Runtime, entry_depth: usize) -> bool {
        while self.frames.len() > entry_depth && !self.failed {
            if self.step_limit_enabled {
                if self.remaining_steps == 0 {
                    self.fail(rt, "Script exceeded execution limit");
                    break;
                }
                self.remaining_steps -= 1;
            }

            let frame_idx = self.frames.len() - 1;
            let (instr, frame_module) = {
                let frame = &mut self.frames[frame_idx];
                if frame.pc as usize >= frame.function.instructions.len() {
                    self.pop_frame(rt);
                    continue;
                }
                let instr = frame.function.instructions[frame.pc as usize];
                frame.pc += 1;
                (instr, frame.module)
            };

            let Some(op) = instr.opcode() else {
                self.fail(rt, format!("Unimplemented opcode: {}", instr.opcode_raw()));
                break;
            };
            let a = instr.a();
            let b = instr.b();
            let c = instr.c();

            match op {
                Opcode::Move => {
                    let v = self.reg(b);
                    self.set_reg(a, v);
                }

                Opcode::LoadK => {
                    let bx = instr.bx() as usize;
                    let module = rt.module(frame_module);
                    let Some(k) = module.constants.get(bx).copied() else {
                        self.fail(rt, "Constant index out of range");
                        continue;
                    };
                    let val = match k.data {
                        ConstantData::Int(v) => rt.make_int(v),
                        ConstantData::Float(v) => rt.make_float(v),
                        ConstantData::StringIdx(idx) => {
                            let text = rt
                                .module(frame_module)
                                .get_string(idx)
                                .unwrap_or_default()
                                .to_string();
                            rt.make_string(&text)
                        }
                    };
                    self.set_reg(a, val);
                }

                Opcode::LoadI => self.set_reg(a, rt.make_int(instr.sbx() as i32)),
                Opcode::LoadB => self.set_reg(a, rt.make_bool(b != 0)),
                Opcode::LoadNil => self.set_reg(a, Value::default()),

                Opcode::Jmp => {
                    let off = instr.jump_offset();
                    if off < 0 && self.gas_enabled && !self.consume_gas(rt) {
                        continue;
                    }
                    let frame = &mut self.frames[frame_idx];
                    frame.pc = (frame.pc as i32 + off) as u32;
                }

                Opcode::JmpT | Opcode::JmpF => {
                    let val = self.reg(a);
                    let Some(truth) = self.evaluate_truthiness(rt, val, "JMP") else {
                        continue;
                    };
                    let take = if op == Opcode::JmpT { truth } else { !truth };
                    if take {
                        let off = instr.sbx() as i32;
                        if off < 0 && self.gas_enabled && !self.consume_gas(rt) {
                            continue;
                        }
                        let frame = &mut self.frames[frame_idx];
                        frame.pc = (frame.pc as i32 + off) as u32;
                    }
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    self.op_arithmetic(rt, op, a, b, c);
                }

                Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    self.op_comparison(rt, op, a, b, c);
                }

                Opcode::IsEq
                | Opcode::IsNe
                | Opcode::IsLt
                | Opcode::IsLe
                | Opcode::IsGt
                | Opcode::IsGe => {
                    self.op_test_and_skip(rt, op, a, b, frame_idx);
                }

                Opcode::And | Opcode::Or => self.op_logical(rt, op, a, b, c),

                Opcode::Neg => {
                    let operand = self.reg(b);
                    let result = match operand.repr {
                        ValueRepr::Int(v) => Some(rt.make_int(v.wrapping_neg())),
                        ValueRepr::Float(v) => Some(rt.make_float(-v)),
                        _ => rt.execute_unary_op(UnaryOp::Neg, operand),
                    };
                    match result {
                        Some(v) => self.set_reg(a, v),
                        None => self.fail(rt, "Negation failed"),
                    }
                }

                Opcode::Not => {
                    let operand = self.reg(b);
                    match rt.execute_unary_op(UnaryOp::Not, operand) {
                        Some(v) => self.set_reg(a, v),
                        None => self.fail(rt, "Logical not failed"),
                    }
                }

                Opcode::TypeOf => {
                    let operand = self.reg(b);
                    self.set_reg(a, rt.make_int(operand.type_id.0 as i32));
                }

                Opcode::Call => {
                    let module = rt.module(frame_module);
                    let Some(callee) = module.functions.get(b as usize).cloned() else {
                        self.fail(rt, "Function index out of range");
                        continue;
                    };
                    self.setup_script_call(rt, a, c, frame_module, callee, HeapPtr::NULL);
                }

                Opcode::CallNative => {
                    if !self.consume_gas(rt) {
                        continue;
                    }
                    let Some(native) = rt.get_native_function(b as u32) else {
                        self.fail(rt, "Native function index out of range");
                        continue;
                    };
                    let func = Rc::clone(&native.func);
                    let name = native.name.clone();
                    self.call_native_wrapper(rt, &func, &name, a, c);
                }

                Opcode::CallExt => {
                    self.op_call_ext(rt, frame_module, a, b, c);
                }

                Opcode::CallExtR => {
                    let idx_val = self.reg(b);
                    let Some(ext_idx) = idx_val.as_int() else {
                        self.fail(rt, "External index must be int");
                        continue;
                    };
                    self.dispatch_external(rt, ext_idx as u32, a, c);
                }

                Opcode::CallIntr => {
                    if !self.consume_gas(rt) {
                        continue;
                    }
                    let Some(id) = IntrinsicId::from_raw(b as u16) else {
                        self.fail(rt, format!("Unknown intrinsic id: {}", b));
                        continue;
                    };
                    self.call_intrinsic(rt, id, a, c);
                }

                Opcode::CallIntrR => {
                    if !self.consume_gas(rt) {
                        continue;
                    }
                    let id_val = self.reg(b);
                    let Some(raw) = id_val.as_int() else {
                        self.fail(rt, "Intrinsic id must be int");
                        continue;
                    };
                    let Some(id) = IntrinsicId::from_raw(raw as u16) else {
                        self.fail(rt, format!("Unknown intrinsic id: {}", raw));
                        continue;
                    };
                    self.call_intrinsic(rt, id, a, c);
                }

                Opcode::CallClosure => {
                    let callee = self.reg(b);
                    let Some(ptr) = callee.heap_ptr().filter(|p| !p.is_null()) else {
                        self.fail(rt, "CALLCLOSURE expects a heap value");
                        continue;
                    };
                    if !matches!(
                        rt.get_type(callee.type_id).map(|t| &t.kind),
                        Some(TypeKind::Function(_))
                    ) {
                        self.fail(rt, "CALLCLOSURE expects a function value");
                        continue;
                    }
                    let Some(closure) = rt.heap.get_closure(ptr) else {
                        self.fail(rt, "CALLCLOSURE has invalid closure");
                        continue;
                    };
                    let target_module = closure.module;
                    let func = Rc::clone(&closure.function);
                    self.setup_script_call(rt, a, c, target_module, func, ptr);
                }

                Opcode::Ret => self.op_ret(rt, a),

                Opcode::RetVoid => {
                    self.pop_frame(rt);
                    if self.frames.is_empty() {
                        self.last_result = Value {
                            type_id: rt.void_type(),
                            repr: ValueRepr::Nil,
                        };
                    }
                }

                Opcode::NewArray => {
                    let Some(tid) = self.resolve_type_ref(rt, frame_module, instr.bx()) else {
                        continue;
                    };
                    let size_val = self.reg(a);
                    let Some(count) = size_val.as_int() else {
                        self.fail(rt, "Array size must be an integer");
                        continue;
                    };
                    if count < 0 {
                        self.fail(rt, "Array size must be non-negative");
                        continue;
                    }
                    match rt.alloc_array(tid, count as u32) {
                        Some(ptr) => self.set_reg(a, Value::make_heap(ptr, tid)),
                        None => self.fail(rt, "NEWARRAY called with non-array type"),
                    }
                }

                Opcode::GetArray => {
                    let arr = self.reg(b);
                    let idx = self.reg(c);
                    let Some(index) = idx.as_int() else {
                        self.fail(rt, "Array index must be integer");
                        continue;
                    };
                    let Some(ptr) = arr.heap_ptr() else {
                        self.fail(rt, "Array access on non-array value");
                        continue;
                    };
                    match rt.array_get(ptr, index.max(0) as u32) {
                        Some(v) if index >= 0 => self.set_reg(a, v),
                        _ => self.fail(rt, "Array access failed (index out of bounds?)"),
                    }
                }

                Opcode::SetArray => {
                    let arr = self.reg(a);
                    let idx = self.reg(b);
                    let val = self.reg(c);
                    let Some(index) = idx.as_int() else {
                        self.fail(rt, "Array index must be integer");
                        continue;
                    };
                    let Some(ptr) = arr.heap_ptr() else {
                        self.fail(rt, "Array access on non-array value");
                        continue;
                    };
                    if index < 0 || !rt.array_set(ptr, index as u32, val) {
                        self.fail(rt, "Array set failed");
                    }
                }

                Opcode::NewMap => {
                    let Some(tid) = self.resolve_type_ref(rt, frame_module, instr.bx()) else {
                        continue;
                    };
                    match rt.alloc_map(tid) {
                        Some(ptr) => self.set_reg(a, Value::make_heap(ptr, tid)),
                        None => self.fail(rt, "NEWMAP called with non-map type"),
                    }
                }

                Opcode::MapGet => {
                    let map = self.reg(b);
                    let key = self.reg(c);
                    let Some(ptr) = map.heap_ptr() else {
                        self.fail(rt, "Map access on non-map value");
                        continue;
                    };
                    match rt.map_get(ptr, key) {
                        Ok(Some(v)) => self.set_reg(a, v),
                        Ok(None) => self.set_reg(a, Value::default()),
                        Err(err) => self.fail(rt, err),
                    }
                }

                Opcode::MapSet => {
                    let map = self.reg(a);
                    let key = self.reg(b);
                    let val = self.reg(c);
                    let Some(ptr) = map.heap_ptr() else {
                        self.fail(rt, "Map access on non-map value");
                        continue;
                    };
                    if let Err(err) = rt.map_set(ptr, key, val) {
                        self.fail(rt, err);
                    }
                }

                Opcode::NewStruct => {
                    let Some(tid) = self.resolve_type_ref(rt, frame_module, instr.bx()) else {
                        continue;
                    };
                    match rt.alloc_struct(tid) {
                        Some(ptr) => self.set_reg(a, Value::make_heap(ptr, tid)),
                        None => self.fail(rt, "Failed to allocate struct"),
                    }
                }

                Opcode::GetField => {
                    let target = self.reg(b);
                    let Some(ptr) = target.heap_ptr() else {
                        self.fail(rt, "GETFIELD called on non-struct");
                        continue;
                    };
                    match rt.read_struct_field_by_index(ptr, c as usize) {
                        Some(v) => self.set_reg(a, v),
                        None => self.fail(rt, "Failed to read struct field"),
                    }
                }

                Opcode::SetField => {
                    let target = self.reg(a);
                    let val = self.reg(c);
                    let Some(ptr) = target.heap_ptr() else {
                        self.fail(rt, "SETFIELD called on non-struct");
                        continue;
                    };
                    let frame = &self.frames[frame_idx];
                    if let Err(err) =
                        rt.write_struct_field_by_index(ptr, b as usize, val, Some(&frame.stack))
                    {
                        self.fail(rt, err);
                    }
                }

                Opcode::NewTuple => {
                    let count = b as usize;
                    let mut element_types = Vec::with_capacity(count);
                    let mut elements = Vec::with_capacity(count);
                    for i in 0..count {
                        let v = self.reg(a + 1 + i as u8);
                        element_types.push(v.type_id);
                        elements.push(v);
                    }
                    let tuple_tid = rt.types.register_tuple_type(&element_types);
                    let Some(ptr) = rt.alloc_tuple(tuple_tid) else {
                        self.fail(rt, "Failed to allocate tuple");
                        continue;
                    };
                    let frame_stack: Vec<u8> = self.frames[frame_idx].stack.clone();
                    let mut ok = true;
                    for (i, v) in elements.into_iter().enumerate() {
                        if let Err(err) =
                            rt.write_tuple_element_by_index(ptr, i, v, Some(&frame_stack))
                        {
                            self.fail(rt, err);
                            ok = false;
                            break;
                        }
                    }
                    if ok {
                        self.set_reg(a, Value::make_heap(ptr, tuple_tid));
                    }
                }

                Opcode::GetTuple => {
                    let target = self.reg(b);
                    let Some(ptr) = target.heap_ptr() else {
                        self.fail(rt, "GETTUPLE called on non-tuple");
                        continue;
                    };
                    match rt.read_tuple_element_by_index(ptr, c as usize) {
                        Some(v) => self.set_reg(a, v),
                        None => self.fail(rt, "Failed to read tuple element"),
                    }
                }

                Opcode::NewSum => {
                    let Some(tid) = self.resolve_type_ref(rt, frame_module, instr.bx()) else {
                        continue;
                    };
                    match rt.alloc_sum(tid) {
                        Some(ptr) => self.set_reg(a, Value::make_heap(ptr, tid)),
                        None => self.fail(rt, "Failed to allocate sum type"),
                    }
                }

                Opcode::SumInit => self.op_sum_init(rt, frame_idx, a, b, c),
                Opcode::SumGetTag => self.op_sum_get_tag(rt, frame_idx, a, b),
                Opcode::SumGetPayload => self.op_sum_get_payload(rt, frame_idx, a, b, c),

                Opcode::FieldGetI
                | Opcode::FieldGetF
                | Opcode::FieldGetB
                | Opcode::FieldGetS
                | Opcode::FieldGetO
                | Opcode::FieldGetH
                | Opcode::FieldSetI
                | Opcode::FieldSetF
                | Opcode::FieldSetB
                | Opcode::FieldSetS
                | Opcode::FieldSetO
                | Opcode::FieldSetH
                | Opcode::FieldGetIR
                | Opcode::FieldGetFR
                | Opcode::FieldGetBR
                | Opcode::FieldGetSR
                | Opcode::FieldGetOR
                | Opcode::FieldGetHR
                | Opcode::FieldSetIR
                | Opcode::FieldSetFR
                | Opcode::FieldSetBR
                | Opcode::FieldSetSR
                | Opcode::FieldSetOR
                | Opcode::FieldSetHR
                | Opcode::FieldGetIOffR
                | Opcode::FieldGetFOffR
                | Opcode::FieldGetBOffR
                | Opcode::FieldGetSOffR
                | Opcode::FieldGetOOffR
                | Opcode::FieldGetHOffR
                | Opcode::FieldSetIOffR
                | Opcode::FieldSetFOffR
                | Opcode::FieldSetBOffR
                | Opcode::FieldSetSOffR
                | Opcode::FieldSetOOffR
                | Opcode::FieldSetHOffR => {
                    self.op_field_access(rt, frame_module, frame_idx, op, a, b, c);
                }

                Opcode::Cast => self.op_cast(rt, frame_module, a, instr.bx()),
                Opcode::Is => self.op_is(rt, frame_module, a, instr.bx()),

                Opcode::StackAlloc => {
                    let Some(tid) = self.resolve_type_ref(rt, frame_module, instr.bx()) else {
                        continue;
                    };
                    let Some(ty) = rt.get_type(tid) else {
                        self.fail(rt, "Invalid type in STACK_ALLOC");
                        continue;
                    };
                    let (size, alignment) = (ty.size, ty.alignment);
                    let frame = &mut self.frames[frame_idx];
                    let offset = frame.stack_alloc(size, alignment, tid);
                    self.set_reg(a, Value::make_stack(offset, tid));
                }

                Opcode::StackCopy => {
                    let dst = self.reg(a);
                    let src = self.reg(b);
                    let (Some(dst_off), Some(src_off)) = (dst.stack_offset(), src.stack_offset())
                    else {
                        self.fail(rt, "STACK_COPY requires stack values");
                        continue;
                    };
                    let Some(size) = rt.get_type(src.type_id).map(|t| t.size as usize) else {
                        self.fail(rt, "Invalid type in STACK_COPY");
                        continue;
                    };
                    let frame = &mut self.frames[frame_idx];
                    let (dst_off, src_off) = (dst_off as usize, src_off as usize);
                    if dst_off + size > frame.stack.len() || src_off + size > frame.stack.len() {
                        self.fail(rt, "STACK_COPY out of range");
                        continue;
                    }
                    frame.stack.copy_within(src_off..src_off + size, dst_off);
                }

                Opcode::StackFieldGet | Opcode::StackFieldGetR => {
                    let field_idx = if op == Opcode::StackFieldGet {
                        c as u32
                    } else {
                        match self.reg(c).as_int() {
                            Some(v) => v as u32,
                            None => {
                                self.fail(rt, "Field reference index must be int");
                                continue;
                            }
                        }
                    };
                    self.op_stack_field_get(rt, frame_module, frame_idx, a, b, field_idx);
                }

                Opcode::StackFieldSet | Opcode::StackFieldSetR => {
                    let field_idx = if op == Opcode::StackFieldSet {
                        b as u32
                    } else {
                        match self.reg(b).as_int() {
                            Some(v) => v as u32,
                            None => {
                                self.fail(rt, "Field reference index must be int");
                                continue;
                            }
                        }
                    };
                    self.op_stack_field_set(rt, frame_module, frame_idx, a, field_idx, c);
                }

                Opcode::StackIndexGet => self.op_stack_index(rt, frame_idx, a, b, c, true),
                Opcode::StackIndexSet => self.op_stack_index(rt, frame_idx, a, b, c, false),

                Opcode::GetGlobal => {
                    let slot = instr.bx() as usize;
                    let module = rt.module(frame_module);
                    if slot >= module.global_count as usize {
                        self.fail(rt, "GETGLOBAL slot out of range");
                        continue;
                    }
                    let val = module.globals.get(slot).copied().unwrap_or_default();
                    self.set_reg(a, val);
                }

                Opcode::SetGlobal => {
                    let slot = instr.bx() as usize;
                    let val = self.reg(a);
                    if slot >= rt.module(frame_module).global_count as usize {
                        self.fail(rt, "SETGLOBAL slot out of range");
                        continue;
                    }
                    rt.module_mut(frame_module).globals[slot] = val;
                }

                Opcode::Closure => self.op_closure(rt, frame_module, frame_idx, a, instr.bx()),

                Opcode::GetUpval => {
                    let Some(val) = self.read_upvalue(rt, frame_idx, b) else {
                        continue;
                    };
                    self.set_reg(a, val);
                }

                Opcode::SetUpval => {
                    let val = self.reg(a);
                    self.write_upvalue(rt, frame_idx, b, val);
                }

                Opcode::CloseUpvals => self.close_upvalues_of_current(rt),
            }
        }

        !self.failed
    }

    // ---- helpers -----------------------------------------------------------

    fn resolve_type_ref(&mut self, rt: &Runtime, module: ModuleId, type_idx: u16) -> Option<TypeId> {
        match rt.module(module).type_refs.get(type_idx as usize) {
            Some(tid) => Some(*tid),
            None => {
                self.fail(rt, "Type index out of range");
                None
            }
        }
    }

    fn evaluate_truthiness(&mut self, rt: &Runtime, val: Value, opcode_name: &str) -> Option<bool> {
        match val.repr {
            ValueRepr::Bool(b) => Some(b),
            ValueRepr::Int(v) => Some(v != 0),
            _ => {
                if matches!(
                    rt.get_type(val.type_id).map(|t| &t.kind),
                    Some(TypeKind::Function(_))
                ) {
                    return Some(matches!(val.repr, ValueRepr::Heap(p) if !p.is_null()));
                }
                self.fail(
                    rt,
                    format!("{} condition must be bool, int, or closure", opcode_name),
                );
                None
            }
        }
    }

    fn op_arithmetic(&mut self, rt: &mut Runtime, op: Opcode, a: u8, b: u8, c: u8) {
        let lv = self.reg(b);
        let rv = self.reg(c);

        if matches!(op, Opcode::Div | Opcode::Mod) {
            match rv.repr {
                ValueRepr::Int(0) => {
                    let msg = if op == Opcode::Div {
                        "Division by zero"
                    } else {
                        "Modulo by zero"
                    };
                    self.fail(rt, msg);
                    return;
                }
                ValueRepr::Float(v) if v == 0.0 => {
                    self.fail(rt, "Division by zero");
                    return;
                }
                _ => {}
            }
        }

        // Fast paths: int op int, float op float.
        if let (ValueRepr::Int(x), ValueRepr::Int(y)) = (lv.repr, rv.repr) {
            let v = match op {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div => x.wrapping_div(y),
                Opcode::Mod => x.wrapping_rem(y),
                _ => unreachable!("arithmetic dispatch"),
            };
            self.set_reg(a, rt.make_int(v));
            return;
        }
        if let (ValueRepr::Float(x), ValueRepr::Float(y)) = (lv.repr, rv.repr) {
            let v = match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div => x / y,
                Opcode::Mod => x % y,
                _ => unreachable!("arithmetic dispatch"),
            };
            self.set_reg(a, rt.make_float(v));
            return;
        }

        let bin_op = match op {
            Opcode::Add => BinaryOp::Add,
            Opcode::Sub => BinaryOp::Sub,
            Opcode::Mul => BinaryOp::Mul,
            Opcode::Div => BinaryOp::Div,
            Opcode::Mod => BinaryOp::Mod,
            _ => unreachable!("arithmetic dispatch"),
        };
        match rt.execute_binary_op(bin_op, lv, rv) {
            Some(v) => self.set_reg(a, v),
            None => self.fail(rt, "Arithmetic operation failed"),
        }
    }

    fn cmp_of(op: Opcode) -> CmpOp {
        match op {
            Opcode::Eq | Opcode::IsEq => CmpOp::Eq,
            Opcode::Ne | Opcode::IsNe => CmpOp::Ne,
            Opcode::Lt | Opcode::IsLt => CmpOp::Lt,
            Opcode::Le | Opcode::IsLe => CmpOp::Le,
            Opcode::Gt | Opcode::IsGt => CmpOp::Gt,
            _ => CmpOp::Ge,
        }
    }

    fn op_comparison(&mut self, rt: &mut Runtime, op: Opcode, a: u8, b: u8, c: u8) {
        let lv = self.reg(b);
        let rv = self.reg(c);
        match rt.execute_cmp_op(Self::cmp_of(op), lv, rv) {
            Some(v) => self.set_reg(a, v),
            None => self.fail(rt, "Comparison failed"),
        }
    }

    fn op_test_and_skip(&mut self, rt: &mut Runtime, op: Opcode, a: u8, b: u8, frame_idx: usize) {
        let lv = self.reg(a);
        let rv = self.reg(b);
        match rt.execute_cmp_op(Self::cmp_of(op), lv, rv) {
            Some(v) => {
                if v.as_bool().unwrap_or(false) {
                    self.frames[frame_idx].pc += 1;
                }
            }
            None => self.fail(rt, "Comparison failed in test_and_skip"),
        }
    }

    fn op_logical(&mut self, rt: &mut Runtime, op: Opcode, a: u8, b: u8, c: u8) {
        let lv = self.reg(b);
        let rv = self.reg(c);
        let logical_op = if op == Opcode::And {
            LogicalOp::And
        } else {
            LogicalOp::Or
        };
        match rt.execute_logical_op(logical_op, lv, rv) {
            Some(v) => self.set_reg(a, v),
            None => self.fail(rt, "Logical operation failed"),
        }
    }

    fn op_call_ext(&mut self, rt: &mut Runtime, frame_module: ModuleId, a: u8, b: u8, c: u8) {
        let module = rt.module(frame_module);
        let Some(ext_idx) = module.external_indices.get(b as usize).copied() else {
            self.fail(rt, "External ref index out of range");
            return;
        };
        if ext_idx == UNRESOLVED_EXTERNAL {
            let name = module
                .external_refs
                .get(b as usize)
                .map(|sym| rt.interner.resolve(*sym).to_string())
                .unwrap_or_default();
            self.fail(rt, format!("Unresolved external function: {}", name));
            return;
        }
        self.dispatch_external(rt, ext_idx, a, c);
    }

    fn dispatch_external(&mut self, rt: &mut Runtime, ext_idx: u32, dest_reg: u8, argc: u8) {
        match rt.get_external_function(ext_idx) {
            Some(ExternalFunction::Native { name, func }) => {
                if !self.consume_gas(rt) {
                    return;
                }
                let name = rt.interner.resolve(*name).to_string();
                let func = Rc::clone(func);
                self.call_native_wrapper(rt, &func, &name, dest_reg, argc);
            }
            Some(ExternalFunction::Script { module, func_idx }) => {
                let target_module = *module;
                let func_idx = *func_idx as usize;
                let Some(callee) = rt.module(target_module).functions.get(func_idx).cloned()
                else {
                    self.fail(rt, "External script function index out of range");
                    return;
                };
                self.setup_script_call(rt, dest_reg, argc, target_module, callee, HeapPtr::NULL);
            }
            None => self.fail(rt, "External function index out of range"),
        }
    }

    /// Host errors become VM failures naming the function.
    fn call_native_wrapper(
        &mut self,
        rt: &mut Runtime,
        func: &crate::runtime::NativeFn,
        name: &str,
        dest_reg: u8,
        argc: u8,
    ) {
        let args: Vec<Value> = (0..argc).map(|i| self.reg(dest_reg + 1 + i)).collect();
        match func(rt, self, &args) {
            Ok(result) => self.set_reg(dest_reg, result),
            Err(err) => self.fail(rt, format!("Native function '{}' failed: {}", name, err)),
        }
    }

    fn setup_script_call(
        &mut self,
        rt: &mut Runtime,
        dest_reg: u8,
        argc: u8,
        target_module: ModuleId,
        callee: Rc<CompiledFunction>,
        closure: HeapPtr,
    ) {
        let mut args: Vec<Value> = (0..argc).map(|i| self.reg(dest_reg + 1 + i)).collect();
        let caller_idx = self.frames.len() - 1;

        self.push_frame(rt, target_module, callee, dest_reg as u32, closure);
        if self.failed {
            return;
        }

        let new_base = self.current_base;
        let mut copy_error: Option<&'static str> = None;
        {
            let split = self.frames.len() - 1;
            let (callers, callees) = self.frames.split_at_mut(split);
            let caller_frame = &callers[caller_idx];
            let callee_frame = &mut callees[0];

            // Stack arguments are frame-relative; copy the payload into the
            // callee's byte stack and rewrite the offset.
            for arg in args.iter_mut() {
                if let ValueRepr::Stack(offset) = arg.repr {
                    let Some((size, alignment)) =
                        rt.get_type(arg.type_id).map(|t| (t.size, t.alignment))
                    else {
                        copy_error = Some("Call argument has invalid type");
                        break;
                    };
                    let dst = callee_frame.stack_alloc(size, alignment, arg.type_id);
                    let src = offset as usize;
                    let Some(payload) = caller_frame.stack.get(src..src + size as usize) else {
                        copy_error = Some("Call argument stack offset out of range");
                        break;
                    };
                    callee_frame.stack[dst as usize..(dst + size) as usize]
                        .copy_from_slice(payload);
                    *arg = Value::make_stack(dst, arg.type_id);
                }
            }
        }
        if let Some(msg) = copy_error {
            self.fail(rt, msg);
            return;
        }

        for (i, arg) in args.iter().enumerate() {
            self.registers[(new_base + i as u32) as usize] = *arg;
        }
    }

    fn op_ret(&mut self, rt: &mut Runtime, a: u8) {
        let mut val = self.reg(a);
        let frame_idx = self.frames.len() - 1;
        let ret_reg = self.frames[frame_idx].return_register;

        // Stack payloads must not outlive the frame: copy up into the
        // caller's byte stack, or materialize on the heap at the VM entry.
        if let ValueRepr::Stack(offset) = val.repr {
            let Some((size, alignment)) = rt.get_type(val.type_id).map(|t| (t.size, t.alignment))
            else {
                self.fail(rt, "RET has invalid value type");
                return;
            };
            let src = offset as usize;

            if self.frames.len() >= 2 {
                let payload = {
                    let frame = &self.frames[frame_idx];
                    frame.stack.get(src..src + size as usize).map(<[u8]>::to_vec)
                };
                let Some(payload) = payload else {
                    self.fail(rt, "RET stack offset out of range");
                    return;
                };
                let caller_frame = &mut self.frames[frame_idx - 1];
                let dst = caller_frame.stack_alloc(size, alignment, val.type_id);
                caller_frame.stack[dst as usize..(dst + size) as usize]
                    .copy_from_slice(&payload);
                val = Value::make_stack(dst, val.type_id);
            } else {
                let frame = &self.frames[frame_idx];
                let Some(payload) = frame.stack.get(src..src + size as usize) else {
                    self.fail(rt, "RET stack offset out of range");
                    return;
                };
                let image = payload.to_vec();
                let ptr = rt.alloc_boxed_bytes(val.type_id, image);
                val = Value::make_heap(ptr, val.type_id);
            }
        }

        self.pop_frame(rt);
        if self.frames.is_empty() {
            self.last_result = val;
        } else {
            self.set_reg(ret_reg as u8, val);
        }
    }

    fn op_cast(&mut self, rt: &mut Runtime, frame_module: ModuleId, a: u8, type_idx: u16) {
        let Some(target_tid) = self.resolve_type_ref(rt, frame_module, type_idx) else {
            return;
        };
        let val = self.reg(a);

        if val.type_id == target_tid {
            return;
        }

        if target_tid == rt.float_type() {
            if let Some(v) = val.as_int() {
                self.set_reg(a, rt.make_float(v as f32));
                return;
            }
        }
        if target_tid == rt.int_type() {
            if let Some(v) = val.as_float() {
                self.set_reg(a, rt.make_int(v as i32));
                return;
            }
        }

        if rt.is_object_like_type(target_tid) && rt.is_object_like_type(val.type_id) {
            let valid = if target_tid == rt.object_type() {
                true
            } else if let Some(expected) = rt.object_subtype_tag(target_tid) {
                val.as_object().map(|h| h.tag == expected).unwrap_or(false)
            } else {
                false
            };
            if valid {
                self.set_reg(
                    a,
                    Value {
                        type_id: target_tid,
                        repr: val.repr,
                    },
                );
            } else {
                self.fail(
                    rt,
                    format!(
                        "Invalid cast from {} to {}",
                        rt.type_name(val.type_id),
                        rt.type_name(target_tid)
                    ),
                );
            }
            return;
        }

        // Nil to a function type gives a null closure slot.
        if !val.type_id.is_valid() {
            if matches!(
                rt.get_type(target_tid).map(|t| &t.kind),
                Some(TypeKind::Function(_))
            ) {
                self.set_reg(a, Value::make_heap(HeapPtr::NULL, target_tid));
                return;
            }
        }

        // Newtype wrap/unwrap keeps the representation.
        let target_kind = rt.get_type(target_tid).map(|t| t.kind.clone());
        if let Some(TypeKind::Newtype { wrapped }) = target_kind {
            if val.type_id == wrapped {
                self.set_reg(
                    a,
                    Value {
                        type_id: target_tid,
                        repr: val.repr,
                    },
                );
                return;
            }
        }
        let source_kind = rt.get_type(val.type_id).map(|t| t.kind.clone());
        if let Some(TypeKind::Newtype { wrapped }) = source_kind {
            if wrapped == target_tid {
                self.set_reg(
                    a,
                    Value {
                        type_id: target_tid,
                        repr: val.repr,
                    },
                );
                return;
            }
        }

        self.fail(
            rt,
            format!(
                "Invalid cast from {} to {}",
                rt.type_name(val.type_id),
                rt.type_name(target_tid)
            ),
        );
    }

    fn op_is(&mut self, rt: &mut Runtime, frame_module: ModuleId, a: u8, type_idx: u16) {
        let Some(target_tid) = self.resolve_type_ref(rt, frame_module, type_idx) else {
            return;
        };
        let val = self.reg(a);

        let result = if rt.is_object_like_type(target_tid) && rt.is_object_like_type(val.type_id) {
            if target_tid == rt.object_type() {
                true
            } else if let Some(expected) = rt.object_subtype_tag(target_tid) {
                val.as_object().map(|h| h.tag == expected).unwrap_or(false)
            } else {
                false
            }
        } else {
            val.type_id == target_tid
        };

        self.set_reg(a, rt.make_bool(result));
    }

    // ---- sum values --------------------------------------------------------

    /// The byte image behind a sum value, wherever it lives.
    fn sum_bytes(
        &mut self,
        rt: &Runtime,
        frame_idx: usize,
        val: Value,
        opcode_name: &str,
    ) -> Option<(Vec<u8>, crate::runtime::types::SumDef)> {
        let Some(def) = rt.sum_def_of(val.type_id).cloned() else {
            self.fail(rt, format!("{} called on non-sum type", opcode_name));
            return None;
        };
        let bytes = match val.repr {
            ValueRepr::Stack(offset) => {
                let frame = &self.frames[frame_idx];
                let start = offset as usize;
                frame.stack.get(start..start + def.size as usize)?.to_vec()
            }
            ValueRepr::Heap(ptr) => rt.heap.get_bytes(ptr)?.clone(),
            _ => {
                self.fail(rt, format!("{} called on non-sum value", opcode_name));
                return None;
            }
        };
        Some((bytes, def))
    }

    fn write_sum_bytes(&mut self, rt: &mut Runtime, frame_idx: usize, val: Value, bytes: &[u8]) {
        match val.repr {
            ValueRepr::Stack(offset) => {
                let frame = &mut self.frames[frame_idx];
                let start = offset as usize;
                if let Some(slot) = frame.stack.get_mut(start..start + bytes.len()) {
                    slot.copy_from_slice(bytes);
                }
            }
            ValueRepr::Heap(ptr) => {
                if let Some(slot) = rt.heap.get_bytes_mut(ptr) {
                    slot.copy_from_slice(bytes);
                }
            }
            _ => {}
        }
    }

    fn op_sum_init(&mut self, rt: &mut Runtime, frame_idx: usize, a: u8, tag: u8, payload_reg: u8) {
        let sum_val = self.reg(a);
        let Some((mut bytes, def)) = self.sum_bytes(rt, frame_idx, sum_val, "SUMINIT") else {
            return;
        };
        if tag as usize >= def.variants.len() {
            self.fail(rt, "Invalid sum variant index");
            return;
        }

        Runtime::write_sum_tag(&mut bytes, &def, tag as u32);

        if payload_reg != SUMINIT_NO_PAYLOAD {
            let payload = self.reg(payload_reg);
            let variant = def.variants[tag as usize].clone();
            let frame_stack: Vec<u8> = self.frames[frame_idx].stack.clone();
            match rt.prepare_slot_write(variant.payload_type, payload, Some(&frame_stack)) {
                Ok(write) => apply_slot_write(&mut bytes, variant.payload_offset, &write),
                Err(err) => {
                    self.fail(rt, err);
                    return;
                }
            }
        }

        self.write_sum_bytes(rt, frame_idx, sum_val, &bytes);
    }

    fn op_sum_get_tag(&mut self, rt: &mut Runtime, frame_idx: usize, a: u8, b: u8) {
        let sum_val = self.reg(b);
        let Some((bytes, def)) = self.sum_bytes(rt, frame_idx, sum_val, "SUMGETTAG") else {
            return;
        };
        let tag = Runtime::read_sum_tag(&bytes, &def);
        if tag as usize >= def.variants.len() {
            self.fail(
                rt,
                format!(
                    "SUMGETTAG: tag {} out of range (variant_count={})",
                    tag,
                    def.variants.len()
                ),
            );
            return;
        }
        self.set_reg(a, rt.make_int(tag as i32));
    }

    fn op_sum_get_payload(
        &mut self,
        rt: &mut Runtime,
        frame_idx: usize,
        a: u8,
        b: u8,
        variant_idx: u8,
    ) {
        let sum_val = self.reg(b);
        let Some((bytes, def)) = self.sum_bytes(rt, frame_idx, sum_val, "SUMGETPAYLOAD") else {
            return;
        };
        let Some(variant) = def.variants.get(variant_idx as usize).cloned() else {
            self.fail(rt, "Invalid sum variant index");
            return;
        };
        if !variant.payload_type.is_valid() {
            self.set_reg(a, Value::default());
            return;
        }
        let stack_base = sum_val.stack_offset();
        match rt.read_slot_from(&bytes, variant.payload_offset, variant.payload_type, None) {
            Some(mut v) => {
                // A payload read from a stack-resident sum stays
                // frame-relative when it is itself a value aggregate.
                if let (Some(base), ValueRepr::Heap(_)) = (stack_base, v.repr) {
                    if rt.slot_class(variant.payload_type) == SlotClass::FixedArray {
                        v = Value::make_stack(base + variant.payload_offset, variant.payload_type);
                    }
                }
                self.set_reg(a, v);
            }
            None => self.fail(rt, "Failed to read sum payload"),
        }
    }

    // ---- fast field access -------------------------------------------------

    fn op_field_access(
        &mut self,
        rt: &mut Runtime,
        frame_module: ModuleId,
        frame_idx: usize,
        op: Opcode,
        a: u8,
        b: u8,
        c: u8,
    ) {
        use Opcode::*;
        let is_get = matches!(
            op,
            FieldGetI
                | FieldGetF
                | FieldGetB
                | FieldGetS
                | FieldGetO
                | FieldGetH
                | FieldGetIR
                | FieldGetFR
                | FieldGetBR
                | FieldGetSR
                | FieldGetOR
                | FieldGetHR
                | FieldGetIOffR
                | FieldGetFOffR
                | FieldGetBOffR
                | FieldGetSOffR
                | FieldGetOOffR
                | FieldGetHOffR
        );
        let is_offset_form = matches!(
            op,
            FieldGetIOffR
                | FieldGetFOffR
                | FieldGetBOffR
                | FieldGetSOffR
                | FieldGetOOffR
                | FieldGetHOffR
                | FieldSetIOffR
                | FieldSetFOffR
                | FieldSetBOffR
                | FieldSetSOffR
                | FieldSetOOffR
                | FieldSetHOffR
        );
        let is_reg_ref = matches!(
            op,
            FieldGetIR
                | FieldGetFR
                | FieldGetBR
                | FieldGetSR
                | FieldGetOR
                | FieldGetHR
                | FieldSetIR
                | FieldSetFR
                | FieldSetBR
                | FieldSetSR
                | FieldSetOR
                | FieldSetHR
        );

        // Operand roles: GET has dest in A and struct in B; SET has the
        // struct in B for the offset form, otherwise in A.
        let (struct_reg, payload_reg) = if is_get {
            (b, a)
        } else if is_offset_form {
            (b, a)
        } else {
            (a, c)
        };

        let struct_val = self.reg(struct_reg);
        let Some(ptr) = struct_val.heap_ptr().filter(|p| !p.is_null()) else {
            self.fail(rt, "Field access on non-struct value");
            return;
        };

        if is_offset_form {
            let offset_reg = c;
            let Some(offset) = self.reg(offset_reg).as_int().filter(|v| *v >= 0) else {
                self.fail(rt, "Field offset must be a non-negative int");
                return;
            };
            self.field_access_by_offset(rt, op, ptr, offset as u32, payload_reg, is_get);
            return;
        }

        let ref_idx = if is_reg_ref {
            let reg = if is_get { c } else { b };
            match self.reg(reg).as_int() {
                Some(v) if v >= 0 => v as u32,
                _ => {
                    self.fail(rt, "Field reference index must be int");
                    return;
                }
            }
        } else if is_get {
            c as u32
        } else {
            b as u32
        };

        let module = rt.module(frame_module);
        let (Some(offset), Some(field_tid)) = (
            module.field_offsets.get(ref_idx as usize).copied(),
            module.field_types.get(ref_idx as usize).copied(),
        ) else {
            self.fail(rt, "Field reference index out of range");
            return;
        };

        if is_get {
            let Some(bytes) = rt.heap.get_bytes(ptr).cloned() else {
                self.fail(rt, "Field access on non-aggregate object");
                return;
            };
            match rt.read_slot_from(&bytes, offset, field_tid, None) {
                Some(v) => self.set_reg(payload_reg, v),
                None => self.fail(rt, "Failed to read struct field"),
            }
        } else {
            let val = self.reg(payload_reg);
            let frame_stack: Vec<u8> = self.frames[frame_idx].stack.clone();
            match rt.prepare_slot_write(field_tid, val, Some(&frame_stack)) {
                Ok(write) => {
                    let Some(bytes) = rt.heap.get_bytes_mut(ptr) else {
                        self.fail(rt, "Field access on non-aggregate object");
                        return;
                    };
                    apply_slot_write(bytes, offset, &write);
                }
                Err(err) => self.fail(rt, err),
            }
        }
    }

    /// Offset-form field access carries the element class in the opcode
    /// rather than a field-ref entry.
    fn field_access_by_offset(
        &mut self,
        rt: &mut Runtime,
        op: Opcode,
        ptr: HeapPtr,
        offset: u32,
        payload_reg: u8,
        is_get: bool,
    ) {
        use Opcode::*;
        let off = offset as usize;

        if is_get {
            let Some(bytes) = rt.heap.get_bytes(ptr) else {
                self.fail(rt, "Field access on non-aggregate object");
                return;
            };
            let read4 = |bytes: &[u8]| {
                bytes
                    .get(off..off + 4)
                    .and_then(|s| <[u8; 4]>::try_from(s).ok())
                    .map(u32::from_le_bytes)
            };
            let val = match op {
                FieldGetIOffR => read4(bytes).map(|raw| rt.make_int(raw as i32)),
                FieldGetFOffR => read4(bytes).map(|raw| rt.make_float(f32::from_bits(raw))),
                FieldGetBOffR => bytes.get(off).map(|b| rt.make_bool(*b != 0)),
                FieldGetSOffR => {
                    read4(bytes).map(|raw| Value::make_heap(HeapPtr(raw), rt.string_type()))
                }
                FieldGetOOffR => {
                    let tag = read4(bytes);
                    let id = bytes
                        .get(off + 4..off + 8)
                        .and_then(|s| <[u8; 4]>::try_from(s).ok())
                        .map(u32::from_le_bytes);
                    match (tag, id) {
                        (Some(tag), Some(id)) => Some(Value::make_object(
                            crate::runtime::value::ObjectHandle { tag, id },
                            rt.object_type(),
                        )),
                        _ => None,
                    }
                }
                _ => read4(bytes).map(|raw| {
                    let ptr = HeapPtr(raw);
                    let tid = rt.heap.type_of(ptr);
                    Value::make_heap(ptr, tid)
                }),
            };
            match val {
                Some(v) => self.set_reg(payload_reg, v),
                None => self.fail(rt, "Field access out of range"),
            }
        } else {
            let val = self.reg(payload_reg);
            let Some(bytes) = rt.heap.get_bytes_mut(ptr) else {
                self.fail(rt, "Field access on non-aggregate object");
                return;
            };
            let ok = match op {
                FieldSetIOffR => match val.repr {
                    ValueRepr::Int(v) => write4(bytes, off, v as u32),
                    ValueRepr::Bool(b) => write4(bytes, off, b as u32),
                    _ => false,
                },
                FieldSetFOffR => match val.repr {
                    ValueRepr::Float(v) => write4(bytes, off, v.to_bits()),
                    ValueRepr::Int(v) => write4(bytes, off, (v as f32).to_bits()),
                    _ => false,
                },
                FieldSetBOffR => match val.repr {
                    ValueRepr::Bool(v) => write1(bytes, off, v as u8),
                    ValueRepr::Int(v) => write1(bytes, off, (v != 0) as u8),
                    _ => false,
                },
                _ => match val.repr {
                    ValueRepr::Heap(p) => write4(bytes, off, p.0),
                    ValueRepr::Nil => write4(bytes, off, 0),
                    ValueRepr::Object(h) => {
                        write4(bytes, off, h.tag) && write4(bytes, off + 4, h.id)
                    }
                    _ => false,
                },
            };
            if !ok {
                self.fail(rt, "Type mismatch in field write");
            }
        }
    }

    // ---- stack value types -------------------------------------------------

    /// Resolve a value-type container to (bytes, stack base). Stack values
    /// read the frame's byte stack in place; heap boxes are cloned.
    fn aggregate_bytes(
        &mut self,
        rt: &Runtime,
        frame_idx: usize,
        val: Value,
        opcode_name: &str,
    ) -> Option<(Vec<u8>, Option<u32>)> {
        match val.repr {
            ValueRepr::Stack(offset) => {
                let frame = &self.frames[frame_idx];
                Some((frame.stack.clone(), Some(offset)))
            }
            ValueRepr::Heap(ptr) => {
                let bytes = rt.heap.get_bytes(ptr)?.clone();
                Some((bytes, None))
            }
            _ => {
                self.fail(rt, format!("{} requires a value-type aggregate", opcode_name));
                None
            }
        }
    }

    fn op_stack_field_get(
        &mut self,
        rt: &mut Runtime,
        frame_module: ModuleId,
        frame_idx: usize,
        dest: u8,
        base_reg: u8,
        field_idx: u32,
    ) {
        let module = rt.module(frame_module);
        let (Some(field_offset), Some(field_tid)) = (
            module.field_offsets.get(field_idx as usize).copied(),
            module.field_types.get(field_idx as usize).copied(),
        ) else {
            self.fail(rt, "Field reference index out of range in STACK_FIELDGET");
            return;
        };

        let base = self.reg(base_reg);
        let Some((bytes, stack_base)) = self.aggregate_bytes(rt, frame_idx, base, "STACK_FIELDGET")
        else {
            return;
        };
        let abs_offset = stack_base.map(|b| b + field_offset).unwrap_or(field_offset);
        match rt.read_slot_from(&bytes, abs_offset, field_tid, stack_base.map(|_| 0)) {
            Some(v) => self.set_reg(dest, v),
            None => self.fail(rt, "Failed to read stack field"),
        }
    }

    fn op_stack_field_set(
        &mut self,
        rt: &mut Runtime,
        frame_module: ModuleId,
        frame_idx: usize,
        base_reg: u8,
        field_idx: u32,
        val_reg: u8,
    ) {
        let module = rt.module(frame_module);
        let (Some(field_offset), Some(field_tid)) = (
            module.field_offsets.get(field_idx as usize).copied(),
            module.field_types.get(field_idx as usize).copied(),
        ) else {
            self.fail(rt, "Field reference index out of range in STACK_FIELDSET");
            return;
        };

        let base = self.reg(base_reg);
        let val = self.reg(val_reg);
        let frame_stack: Vec<u8> = self.frames[frame_idx].stack.clone();
        let write = match rt.prepare_slot_write(field_tid, val, Some(&frame_stack)) {
            Ok(write) => write,
            Err(err) => {
                self.fail(rt, err);
                return;
            }
        };

        match base.repr {
            ValueRepr::Stack(offset) => {
                let frame = &mut self.frames[frame_idx];
                apply_slot_write(&mut frame.stack, offset + field_offset, &write);
            }
            ValueRepr::Heap(ptr) => {
                let Some(bytes) = rt.heap.get_bytes_mut(ptr) else {
                    self.fail(rt, "STACK_FIELDSET on non-aggregate object");
                    return;
                };
                apply_slot_write(bytes, field_offset, &write);
            }
            _ => self.fail(rt, "STACK_FIELDSET requires a value-type aggregate"),
        }
    }

    fn op_stack_index(
        &mut self,
        rt: &mut Runtime,
        frame_idx: usize,
        a: u8,
        b: u8,
        c: u8,
        is_get: bool,
    ) {
        let (base_reg, idx_reg) = if is_get { (b, c) } else { (a, b) };
        let base = self.reg(base_reg);
        let idx_val = self.reg(idx_reg);
        let Some(index) = idx_val.as_int() else {
            self.fail(rt, "Fixed array index must be integer");
            return;
        };

        let Some(TypeKind::FixedArray { elem, len }) =
            rt.get_type(base.type_id).map(|t| t.kind.clone())
        else {
            self.fail(rt, "Fixed array operation on non-array value");
            return;
        };
        if index < 0 || index >= len {
            self.fail(rt, "Fixed array index out of bounds");
            return;
        }
        let (elem_size, _) = rt.types.storage_size_align(elem);
        let offset = index as u32 * elem_size;

        if is_get {
            let Some((bytes, stack_base)) =
                self.aggregate_bytes(rt, frame_idx, base, "STACK_INDEXGET")
            else {
                return;
            };
            let abs_offset = stack_base.map(|b| b + offset).unwrap_or(offset);
            match rt.read_slot_from(&bytes, abs_offset, elem, stack_base.map(|_| 0)) {
                Some(v) => self.set_reg(a, v),
                None => self.fail(rt, "Failed to read fixed array element"),
            }
        } else {
            let val = self.reg(c);
            let frame_stack: Vec<u8> = self.frames[frame_idx].stack.clone();
            let write = match rt.prepare_slot_write(elem, val, Some(&frame_stack)) {
                Ok(write) => write,
                Err(err) => {
                    self.fail(rt, err);
                    return;
                }
            };
            match base.repr {
                ValueRepr::Stack(base_offset) => {
                    let frame = &mut self.frames[frame_idx];
                    apply_slot_write(&mut frame.stack, base_offset + offset, &write);
                }
                ValueRepr::Heap(ptr) => {
                    let Some(bytes) = rt.heap.get_bytes_mut(ptr) else {
                        self.fail(rt, "STACK_INDEXSET on non-aggregate object");
                        return;
                    };
                    apply_slot_write(bytes, offset, &write);
                }
                _ => self.fail(rt, "STACK_INDEXSET requires a value-type aggregate"),
            }
        }
    }

    // ---- closures ----------------------------------------------------------

    fn op_closure(
        &mut self,
        rt: &mut Runtime,
        frame_module: ModuleId,
        frame_idx: usize,
        dest: u8,
        func_idx: u16,
    ) {
        let module = rt.module(frame_module);
        let Some(callee) = module.functions.get(func_idx as usize).cloned() else {
            self.fail(rt, "Closure function index out of range");
            return;
        };
        if !callee.function_type.is_valid() {
            self.fail(rt, "Closure missing function type");
            return;
        }

        let closure_ptr = rt.alloc_closure(
            callee.function_type,
            Rc::clone(&callee),
            frame_module,
            callee.upvalue_count as usize,
        );

        let upvalue_count = callee.upvalue_count as usize;
        let words = upvalue_count.div_ceil(4);
        let mut upvalues = Vec::with_capacity(upvalue_count);
        let parent_closure = self.frames[frame_idx].closure;

        let mut up_idx = 0usize;
        for _ in 0..words {
            let raw = {
                let frame = &mut self.frames[frame_idx];
                if frame.pc as usize >= frame.function.instructions.len() {
                    self.fail(rt, "Closure upvalue descriptor out of range");
                    return;
                }
                let raw = frame.function.instructions[frame.pc as usize].0;
                frame.pc += 1;
                raw
            };
            let mut i = 0;
            while i < 4 && up_idx < upvalue_count {
                let desc = ((raw >> (8 * i)) & 0xFF) as u8;
                let is_local = (desc & 0x1) != 0;
                let index = desc >> 1;

                if is_local {
                    let ptr = self.get_or_create_upvalue(rt, frame_idx, index);
                    upvalues.push(ptr);
                } else {
                    let Some(parent) = rt.heap.get_closure(parent_closure) else {
                        self.fail(rt, "Closure upvalue index out of range");
                        return;
                    };
                    let Some(ptr) = parent.upvalues.get(index as usize).copied() else {
                        self.fail(rt, "Closure upvalue index out of range");
                        return;
                    };
                    upvalues.push(ptr);
                }
                i += 1;
                up_idx += 1;
            }
        }

        if let Some(closure) = rt.heap.get_closure_mut(closure_ptr) {
            closure.upvalues = upvalues;
        }
        self.set_reg(dest, Value::make_heap(closure_ptr, callee.function_type));
    }

    fn read_upvalue(&mut self, rt: &Runtime, frame_idx: usize, index: u8) -> Option<Value> {
        let closure_ptr = self.frames[frame_idx].closure;
        if closure_ptr.is_null() {
            self.fail(rt, "GETUPVAL used without active closure");
            return None;
        }
        let Some(closure) = rt.heap.get_closure(closure_ptr) else {
            self.fail(rt, "GETUPVAL used without active closure");
            return None;
        };
        let Some(ptr) = closure.upvalues.get(index as usize).copied() else {
            self.fail(rt, "Upvalue index out of range");
            return None;
        };
        match rt.heap.get_upvalue(ptr).map(|cell| &cell.state) {
            Some(crate::runtime::heap::UpvalueState::Open(abs)) => {
                Some(self.registers[*abs as usize])
            }
            Some(crate::runtime::heap::UpvalueState::Closed(val)) => Some(*val),
            None => {
                self.fail(rt, "Upvalue is null");
                None
            }
        }
    }

    fn write_upvalue(&mut self, rt: &mut Runtime, frame_idx: usize, index: u8, val: Value) {
        let closure_ptr = self.frames[frame_idx].closure;
        if closure_ptr.is_null() {
            self.fail(rt, "SETUPVAL used without active closure");
            return;
        }
        let Some(closure) = rt.heap.get_closure(closure_ptr) else {
            self.fail(rt, "SETUPVAL used without active closure");
            return;
        };
        let Some(ptr) = closure.upvalues.get(index as usize).copied() else {
            self.fail(rt, "Upvalue index out of range");
            return;
        };
        match rt.heap.get_upvalue_mut(ptr).map(|cell| &mut cell.state) {
            Some(crate::runtime::heap::UpvalueState::Open(abs)) => {
                let abs = *abs;
                self.registers[abs as usize] = val;
            }
            Some(state @ crate::runtime::heap::UpvalueState::Closed(_)) => {
                *state = crate::runtime::heap::UpvalueState::Closed(val);
            }
            None => self.fail(rt, "Upvalue is null"),
        }
    }

    // ---- diagnostics -------------------------------------------------------

    /// Frame-by-frame trace from the innermost call outward, with a source
    /// excerpt and caret for the top frame when debug info allows.
    pub fn get_stack_trace(&self, rt: &Runtime) -> String {
        if self.frames.is_empty() {
            return "Stack trace: (no frames)\n".to_string();
        }

        let mut trace = String::from("Stack trace:\n");
        for (depth, frame) in self.frames.iter().rev().enumerate() {
            let module: &BytecodeModule = rt.module(frame.module);
            let qualified = format!("{}::{}", module.name, frame.function.name);

            let loc = (frame.pc > 0)
                .then(|| frame.function.debug_locations.get(frame.pc as usize - 1))
                .flatten()
                .filter(|span| span.start_line > 0);

            match loc {
                Some(span) => {
                    trace.push_str(&format!(
                        "  #{}: {} at line {}, column {}\n",
                        depth, qualified, span.start_line, span.start_column
                    ));
                    if depth == 0 {
                        if let Some(source) = &module.source {
                            if let Some(line) = source.lines().nth(span.start_line - 1) {
                                trace.push_str(&format!("      {}\n      ", line));
                                for (i, ch) in line.chars().enumerate() {
                                    if i + 1 >= span.start_column {
                                        break;
                                    }
                                    trace.push(if ch == '\t' { '\t' } else { ' ' });
                                }
                                trace.push_str("^\n");
                            }
                        }
                    }
                }
                None => {
                    trace.push_str(&format!("  #{}: {} at <unknown location>\n", depth, qualified));
                }
            }
        }
        trace
    }

    /// Walk every live root: registers under the frame windows, frame byte
    /// stacks (per-slot, type-driven), and open upvalues.
    pub fn enumerate_roots(&self, rt: &Runtime, visitor: &mut dyn GcRootVisitor) {
        for frame in &self.frames {
            let mut refs = Vec::new();
            for slot in &frame.stack_layout {
                let start = slot.offset as usize;
                if let Some(ty) = rt.get_type(slot.type_id) {
                    if let Some(bytes) = frame.stack.get(start..start + ty.size as usize) {
                        rt.scan_value_heap_refs(slot.type_id, bytes, &mut refs);
                    }
                }
            }
            for ptr in refs {
                visitor.visit_root(ptr);
            }

            for ptr in &frame.open_upvalues {
                visitor.visit_root(*ptr);
            }

            if !frame.closure.is_null() {
                visitor.visit_root(frame.closure);
            }
        }

        for value in self.registers.iter().take(self.stack_top) {
            if let ValueRepr::Heap(ptr) = value.repr {
                if !ptr.is_null() {
                    visitor.visit_root(ptr);
                }
            }
        }
    }
}

fn write4(bytes: &mut [u8], off: usize, v: u32) -> bool {
    match bytes.get_mut(off..off + 4) {
        Some(slot) => {
            slot.copy_from_slice(&v.to_le_bytes());
            true
        }
        None => false,
    }
}

fn write1(bytes: &mut [u8], off: usize, v: u8) -> bool {
    match bytes.get_mut(off) {
        Some(slot) => {
            *slot = v;
            true
        }
        None => false,
    }
}
