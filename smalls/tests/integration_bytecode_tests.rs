//! Hand-assembled modules: opcodes the compiler does not emit, the
//! verifier gate, and instruction-level behavior.

mod common;

use std::rc::Rc;

use common::Harness;
use pretty_assertions::assert_eq;
use smalls::bytecode::{BytecodeModule, CompiledFunction, Instruction, Opcode};
use smalls::Value;
use smalls_parser::IntrinsicId;

fn install(h: &mut Harness, module: BytecodeModule) -> smalls::ModuleId {
    h.rt.add_module(module, None)
}

fn function(name: &str, register_count: u16, instructions: Vec<Instruction>) -> CompiledFunction {
    let mut func = CompiledFunction::new(name);
    func.register_count = register_count;
    func.instructions = instructions;
    func
}

#[test]
fn test_vm_refuses_invalid_module() {
    let mut h = Harness::new();
    let mut module = BytecodeModule::new("bad");
    // ADD touching a register past register_count.
    module.functions.push(Rc::new(function(
        "f",
        1,
        vec![Instruction::make_abc(Opcode::Add, 0, 200, 0)],
    )));
    let id = install(&mut h, module);
    let result = h.vm.execute(&mut h.rt, id, "f", &[], 0);
    assert!(h.vm.failed());
    assert!(!result.is_valid());
    assert!(
        h.vm.error_message().contains("register out of range"),
        "{}",
        h.vm.error_message()
    );
}

#[test]
fn test_typeof_reads_type_id() {
    let mut h = Harness::new();
    let mut module = BytecodeModule::new("m");
    module.functions.push(Rc::new(function(
        "f",
        2,
        vec![
            Instruction::make_asbx(Opcode::LoadI, 1, 7),
            Instruction::make_abc(Opcode::TypeOf, 0, 1, 0),
            Instruction::make_abc(Opcode::Ret, 0, 0, 0),
        ],
    )));
    let id = install(&mut h, module);
    let result = h.vm.execute(&mut h.rt, id, "f", &[], 0);
    assert!(!h.vm.failed(), "{}", h.vm.error_message());
    assert_eq!(result.as_int(), Some(h.rt.int_type().0 as i32));
}

#[test]
fn test_callnative_by_index() {
    let mut h = Harness::new();
    let native_idx = h.rt.register_native_function(
        "host.seven",
        Rc::new(|rt, _vm, _args| Ok(rt.make_int(7))),
    );

    let mut module = BytecodeModule::new("m");
    module.functions.push(Rc::new(function(
        "f",
        1,
        vec![
            Instruction::make_abc(Opcode::CallNative, 0, native_idx as u8, 0),
            Instruction::make_abc(Opcode::Ret, 0, 0, 0),
        ],
    )));
    let id = install(&mut h, module);
    let result = h.vm.execute(&mut h.rt, id, "f", &[], 0);
    assert!(!h.vm.failed(), "{}", h.vm.error_message());
    assert_eq!(result.as_int(), Some(7));
}

#[test]
fn test_callintr_r_dispatches_by_register_id() {
    let mut h = Harness::new();
    let mut module = BytecodeModule::new("m");
    // r1 = id of string_len; r2 = "abcd"; CALLINTR_R r1 with arg window at r2.
    let string_idx = module.add_string("abcd");
    module.add_constant(smalls::bytecode::Constant {
        type_id: smalls::TypeId(3),
        data: smalls::bytecode::ConstantData::StringIdx(string_idx),
    });
    module.functions.push(Rc::new(function(
        "f",
        4,
        vec![
            Instruction::make_asbx(Opcode::LoadI, 0, IntrinsicId::StringLen as i16),
            Instruction::make_abx(Opcode::LoadK, 2, 0),
            Instruction::make_abc(Opcode::CallIntrR, 1, 0, 1),
            Instruction::make_abc(Opcode::Ret, 1, 0, 0),
        ],
    )));
    let id = install(&mut h, module);
    let result = h.vm.execute(&mut h.rt, id, "f", &[], 0);
    assert!(!h.vm.failed(), "{}", h.vm.error_message());
    assert_eq!(result.as_int(), Some(4));
}

#[test]
fn test_test_and_skip_comparisons() {
    let mut h = Harness::new();
    let mut module = BytecodeModule::new("m");
    // r0 = 1; r1 = 2; ISLT skips the "return 0" when r0 < r1.
    module.functions.push(Rc::new(function(
        "f",
        2,
        vec![
            Instruction::make_asbx(Opcode::LoadI, 0, 1),
            Instruction::make_asbx(Opcode::LoadI, 1, 2),
            Instruction::make_abc(Opcode::IsLt, 0, 1, 0),
            Instruction::make_abc(Opcode::Ret, 1, 0, 0), // skipped
            Instruction::make_asbx(Opcode::LoadI, 0, 99),
            Instruction::make_abc(Opcode::Ret, 0, 0, 0),
        ],
    )));
    let id = install(&mut h, module);
    let result = h.vm.execute(&mut h.rt, id, "f", &[], 0);
    assert!(!h.vm.failed(), "{}", h.vm.error_message());
    assert_eq!(result.as_int(), Some(99));
}

#[test]
fn test_unknown_opcode_fails_verification() {
    let mut h = Harness::new();
    let mut module = BytecodeModule::new("m");
    module
        .functions
        .push(Rc::new(function("f", 1, vec![Instruction(0xFE)])));
    let id = install(&mut h, module);
    h.vm.execute(&mut h.rt, id, "f", &[], 0);
    assert!(h.vm.failed());
    assert!(
        h.vm.error_message().contains("unknown opcode"),
        "{}",
        h.vm.error_message()
    );
}

#[test]
fn test_missing_function_fails() {
    let mut h = Harness::new();
    let module = BytecodeModule::new("m");
    let id = install(&mut h, module);
    h.vm.execute(&mut h.rt, id, "nope", &[], 0);
    assert!(h.vm.failed());
    assert!(
        h.vm.error_message().contains("Function not found"),
        "{}",
        h.vm.error_message()
    );
}

#[test]
fn test_module_verified_flag_set_once() {
    let mut h = Harness::new();
    let mut module = BytecodeModule::new("m");
    module.functions.push(Rc::new(function(
        "f",
        1,
        vec![
            Instruction::make_asbx(Opcode::LoadI, 0, 1),
            Instruction::make_abc(Opcode::Ret, 0, 0, 0),
        ],
    )));
    let id = install(&mut h, module);
    assert!(!h.rt.module(id).verified);
    let v = h.vm.execute(&mut h.rt, id, "f", &[], 0);
    assert_eq!(v.as_int(), Some(1));
    assert!(h.rt.module(id).verified);
}

#[test]
fn test_jump_one_past_end_terminates_frame() {
    let mut h = Harness::new();
    let mut module = BytecodeModule::new("m");
    module.functions.push(Rc::new(function(
        "f",
        1,
        vec![Instruction::make_jump(Opcode::Jmp, 0)],
    )));
    let id = install(&mut h, module);
    let result = h.vm.execute(&mut h.rt, id, "f", &[], 0);
    // The frame drains without a RET; the entry result is untouched.
    assert!(!h.vm.failed(), "{}", h.vm.error_message());
    assert!(!result.is_valid());
}

#[test]
fn test_garbage_cycle_is_collected() {
    // Closures whose upvalues point back at themselves form a cycle; the
    // tracing collector frees it once unreachable.
    let mut h = Harness::new();
    let int = h.int();
    let fn_tid = h.rt.types.register_function_type(&[], int);
    let func = Rc::new(function("f", 1, vec![]));

    let closure_ptr = h.rt.alloc_closure(fn_tid, func, smalls::ModuleId(0), 1);
    let upvalue_ptr = h.rt.alloc_upvalue(0);
    // Close the cell over the closure itself.
    if let Some(cell) = h.rt.heap.get_upvalue_mut(upvalue_ptr) {
        cell.state = smalls::runtime::heap::UpvalueState::Closed(Value::make_heap(
            closure_ptr,
            fn_tid,
        ));
    }
    if let Some(closure) = h.rt.heap.get_closure_mut(closure_ptr) {
        closure.upvalues.push(upvalue_ptr);
    }

    let live_before = h.rt.heap.live_count();
    let collected = h.rt.collect_garbage(&[&h.vm]);
    assert_eq!(collected, 2, "the whole cycle goes at once");
    assert_eq!(h.rt.heap.live_count(), live_before - 2);
}
