//! Static verification of a finished bytecode module.
//!
//! Runs once before a module's first execution. Checks every instruction of
//! every function: opcode validity, register operand ranges, table-index
//! bounds (constants, type refs, field refs, externals, globals, functions),
//! jump targets, and closure descriptor words. The first failing check
//! produces the error; the VM refuses to run an unverified module.

use crate::bytecode::{
    BytecodeModule, CompiledFunction, Opcode, SUMINIT_NO_PAYLOAD,
};

fn check_reg(r: u8, reg_count: u16, ctx: &str) -> Result<(), String> {
    if (r as u16) >= reg_count {
        return Err(format!(
            "{}: register out of range: r{} (reg_count={})",
            ctx, r, reg_count
        ));
    }
    Ok(())
}

fn check_reg_range(first: u16, last: u16, reg_count: u16, ctx: &str) -> Result<(), String> {
    if first >= reg_count || last >= reg_count || last < first {
        return Err(format!(
            "{}: register range out of range: r{}..r{} (reg_count={})",
            ctx, first, last, reg_count
        ));
    }
    Ok(())
}

fn check_jump_target(pc: usize, offset: i32, count: usize, ctx: &str) -> Result<(), String> {
    let target = pc as i64 + 1 + offset as i64;
    // One past the end is allowed and terminates the frame.
    if target < 0 || target > count as i64 {
        return Err(format!("{}: jump target out of range: {}", ctx, target));
    }
    Ok(())
}

fn verify_function(module: &BytecodeModule, func: &CompiledFunction) -> Result<(), String> {
    let reg_count = func.register_count;
    if reg_count < func.param_count as u16 {
        return Err(format!(
            "verify: {}: register_count {} < param_count {}",
            func.name, reg_count, func.param_count
        ));
    }

    let n = func.instructions.len();
    let mut pc = 0usize;
    while pc < n {
        let instr = func.instructions[pc];
        let ctx = format!("verify: {}: pc {}", func.name, pc);
        let Some(op) = instr.opcode() else {
            return Err(format!("{}: unknown opcode {}", ctx, instr.opcode_raw()));
        };
        let a = instr.a();
        let b = instr.b();
        let c = instr.c();

        use Opcode::*;
        match op {
            // rA = rB op rC
            Add | Sub | Mul | Div | Mod | And | Or | Eq | Ne | Lt | Le | Gt | Ge | GetArray
            | SetArray | MapGet | MapSet | StackIndexGet | StackIndexSet => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                check_reg(c, reg_count, &ctx)?;
            }

            // rA = op rB
            Neg | Not | TypeOf | Move | StackCopy | SumGetTag | SumGetPayload => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
            }

            LoadNil | LoadI | LoadB => check_reg(a, reg_count, &ctx)?,

            LoadK => {
                check_reg(a, reg_count, &ctx)?;
                let k = instr.bx() as usize;
                if k >= module.constants.len() {
                    return Err(format!(
                        "{}: constant index out of range: {} (constants={})",
                        ctx,
                        k,
                        module.constants.len()
                    ));
                }
            }

            Jmp => check_jump_target(pc, instr.jump_offset(), n, &ctx)?,

            JmpT | JmpF => {
                check_reg(a, reg_count, &ctx)?;
                check_jump_target(pc, instr.sbx() as i32, n, &ctx)?;
            }

            IsEq | IsNe | IsLt | IsLe | IsGt | IsGe => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
            }

            GetField | GetTuple => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
            }
            SetField => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(c, reg_count, &ctx)?;
            }

            // fast field access, immediate ref index in the third operand
            FieldGetI | FieldGetF | FieldGetB | FieldGetS | FieldGetO | FieldGetH => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                if c as usize >= module.field_offsets.len() {
                    return Err(format!("{}: field ref index out of range: {}", ctx, c));
                }
            }
            FieldSetI | FieldSetF | FieldSetB | FieldSetS | FieldSetO | FieldSetH => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(c, reg_count, &ctx)?;
                if b as usize >= module.field_offsets.len() {
                    return Err(format!("{}: field ref index out of range: {}", ctx, b));
                }
            }

            // register-indexed and offset variants are pure register forms
            FieldGetIR | FieldGetFR | FieldGetBR | FieldGetSR | FieldGetOR | FieldGetHR
            | FieldSetIR | FieldSetFR | FieldSetBR | FieldSetSR | FieldSetOR | FieldSetHR
            | FieldGetIOffR | FieldGetFOffR | FieldGetBOffR | FieldGetSOffR | FieldGetOOffR
            | FieldGetHOffR | FieldSetIOffR | FieldSetFOffR | FieldSetBOffR | FieldSetSOffR
            | FieldSetOOffR | FieldSetHOffR => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                check_reg(c, reg_count, &ctx)?;
            }

            Call | CallNative | CallExt | CallIntr => {
                check_reg(a, reg_count, &ctx)?;
                let argc = c as u16;
                if argc > 0 {
                    check_reg_range(a as u16 + 1, a as u16 + argc, reg_count, &ctx)?;
                }
                if op == Call && b as usize >= module.functions.len() {
                    return Err(format!(
                        "{}: function index out of range: {} (functions={})",
                        ctx,
                        b,
                        module.functions.len()
                    ));
                }
                if op == CallExt && b as usize >= module.external_indices.len() {
                    return Err(format!(
                        "{}: external ref index out of range: {} (externals={})",
                        ctx,
                        b,
                        module.external_indices.len()
                    ));
                }
            }

            CallExtR | CallIntrR => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                let argc = c as u16;
                if argc > 0 {
                    check_reg_range(a as u16 + 1, a as u16 + argc, reg_count, &ctx)?;
                }
            }

            CallClosure => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                let argc = c as u16;
                if argc > 0 {
                    check_reg_range(a as u16 + 1, a as u16 + argc, reg_count, &ctx)?;
                }
            }

            Ret => check_reg(a, reg_count, &ctx)?,
            RetVoid => {}

            NewArray | NewMap | NewStruct | NewSum | Cast | Is | StackAlloc => {
                check_reg(a, reg_count, &ctx)?;
                let type_idx = instr.bx() as usize;
                if type_idx >= module.type_refs.len() {
                    return Err(format!(
                        "{}: type index out of range: {} (type_refs={})",
                        ctx,
                        type_idx,
                        module.type_refs.len()
                    ));
                }
            }

            NewTuple => {
                check_reg(a, reg_count, &ctx)?;
                let count = b as u16;
                if count > 0 {
                    check_reg_range(a as u16 + 1, a as u16 + count, reg_count, &ctx)?;
                }
            }

            StackFieldGet => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                if c as usize >= module.field_offsets.len() {
                    return Err(format!("{}: field ref index out of range: {}", ctx, c));
                }
            }
            StackFieldGetR => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                check_reg(c, reg_count, &ctx)?;
            }
            StackFieldSet => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(c, reg_count, &ctx)?;
                if b as usize >= module.field_offsets.len() {
                    return Err(format!("{}: field ref index out of range: {}", ctx, b));
                }
            }
            StackFieldSetR => {
                check_reg(a, reg_count, &ctx)?;
                check_reg(b, reg_count, &ctx)?;
                check_reg(c, reg_count, &ctx)?;
            }

            SumInit => {
                check_reg(a, reg_count, &ctx)?;
                if c != SUMINIT_NO_PAYLOAD {
                    check_reg(c, reg_count, &ctx)?;
                }
            }

            GetGlobal | SetGlobal => {
                check_reg(a, reg_count, &ctx)?;
                let slot = instr.bx();
                if slot >= module.global_count {
                    return Err(format!(
                        "{}: global slot out of range: {} (globals={})",
                        ctx, slot, module.global_count
                    ));
                }
            }

            CloseUpvals => {}

            Closure => {
                check_reg(a, reg_count, &ctx)?;
                let func_idx = instr.bx() as usize;
                if func_idx >= module.functions.len() {
                    return Err(format!(
                        "{}: closure function index out of range: {} (functions={})",
                        ctx,
                        func_idx,
                        module.functions.len()
                    ));
                }

                let callee = &module.functions[func_idx];
                let upc = callee.upvalue_count as usize;
                let words = upc.div_ceil(4);
                if pc + words >= n {
                    return Err(format!(
                        "{}: missing closure descriptor words: need {}",
                        ctx, words
                    ));
                }

                let mut up_idx = 0usize;
                for w in 0..words {
                    let raw = func.instructions[pc + 1 + w].0;
                    let mut i = 0;
                    while i < 4 && up_idx < upc {
                        let desc = ((raw >> (8 * i)) & 0xFF) as u8;
                        let is_local = (desc & 0x1) != 0;
                        let index = desc >> 1;
                        if is_local {
                            if (index as u16) >= reg_count {
                                return Err(format!(
                                    "{}: closure local upvalue reg out of range: r{}",
                                    ctx, index
                                ));
                            }
                        } else {
                            // Capturing from the enclosing closure's upvalues.
                            if func.upvalue_count == 0 {
                                return Err(format!(
                                    "{}: closure captures non-local upvalue but enclosing function has no upvalues",
                                    ctx
                                ));
                            }
                            if index >= func.upvalue_count {
                                return Err(format!(
                                    "{}: closure upvalue index out of range: {} (enclosing upvalues={})",
                                    ctx, index, func.upvalue_count
                                ));
                            }
                        }
                        i += 1;
                        up_idx += 1;
                    }
                }
                pc += words;
            }

            GetUpval | SetUpval => check_reg(a, reg_count, &ctx)?,
        }
        pc += 1;
    }

    Ok(())
}

/// Verify every function of a module. Go/no-go for the VM.
pub fn verify_bytecode_module(module: &BytecodeModule) -> Result<(), String> {
    if module.external_refs.len() != module.external_indices.len() {
        return Err("verify: external reference tables out of sync".to_string());
    }
    if module.field_offsets.len() != module.field_types.len() {
        return Err("verify: field reference tables out of sync".to_string());
    }
    if module.globals.len() < module.global_count as usize {
        return Err("verify: globals vector smaller than global_count".to_string());
    }
    for func in &module.functions {
        verify_function(module, func)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, ConstantData, Instruction};
    use smalls_parser::ast::TypeId;
    use std::rc::Rc;

    fn module_with(instructions: Vec<Instruction>, register_count: u16) -> BytecodeModule {
        let mut module = BytecodeModule::new("test");
        let mut func = CompiledFunction::new("f");
        func.register_count = register_count;
        func.instructions = instructions;
        module.functions.push(Rc::new(func));
        module
    }

    #[test]
    fn test_accepts_simple_function() {
        let module = module_with(
            vec![
                Instruction::make_asbx(Opcode::LoadI, 0, 42),
                Instruction::make_abc(Opcode::Ret, 0, 0, 0),
            ],
            1,
        );
        assert!(verify_bytecode_module(&module).is_ok());
    }

    #[test]
    fn test_rejects_register_out_of_range() {
        let module = module_with(vec![Instruction::make_abc(Opcode::Add, 3, 0, 0)], 2);
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("register out of range"), "{err}");
    }

    #[test]
    fn test_rejects_unknown_opcode() {
        let module = module_with(vec![Instruction(0xFE)], 1);
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("unknown opcode"), "{err}");
    }

    #[test]
    fn test_rejects_constant_index_out_of_range() {
        let mut module = module_with(vec![Instruction::make_abx(Opcode::LoadK, 0, 1)], 1);
        module.constants.push(Constant {
            type_id: TypeId(0),
            data: ConstantData::Int(1),
        });
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("constant index out of range"), "{err}");
    }

    #[test]
    fn test_jump_one_past_end_is_allowed() {
        let module = module_with(vec![Instruction::make_jump(Opcode::Jmp, 0)], 1);
        assert!(verify_bytecode_module(&module).is_ok());
    }

    #[test]
    fn test_rejects_jump_before_start() {
        let module = module_with(vec![Instruction::make_jump(Opcode::Jmp, -2)], 1);
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("jump target out of range"), "{err}");
    }

    #[test]
    fn test_rejects_call_arg_window_overflow() {
        let mut module = module_with(
            vec![Instruction::make_abc(Opcode::Call, 0, 0, 3)],
            2,
        );
        // Call target exists; the argument window r1..r3 does not fit.
        module.functions.push(Rc::new(CompiledFunction::new("g")));
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("register range out of range"), "{err}");
    }

    #[test]
    fn test_rejects_global_slot_out_of_range() {
        let mut module = module_with(vec![Instruction::make_abx(Opcode::SetGlobal, 0, 2)], 1);
        module.global_count = 2;
        module.globals = vec![Default::default(); 2];
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("global slot out of range"), "{err}");
    }

    #[test]
    fn test_rejects_missing_closure_descriptors() {
        let mut callee = CompiledFunction::new("lambda");
        callee.upvalue_count = 2;
        let mut module = module_with(vec![Instruction::make_abx(Opcode::Closure, 0, 1)], 1);
        module.functions.push(Rc::new(callee));
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("missing closure descriptor"), "{err}");
    }

    #[test]
    fn test_closure_descriptor_register_checked() {
        let mut callee = CompiledFunction::new("lambda");
        callee.upvalue_count = 1;
        // descriptor: is_local with register 9, out of range for reg_count 1
        let desc = (9u32 << 1) | 1;
        let mut module = module_with(
            vec![
                Instruction::make_abx(Opcode::Closure, 0, 1),
                Instruction::raw(desc),
                Instruction::make_abc(Opcode::RetVoid, 0, 0, 0),
            ],
            1,
        );
        module.functions.push(Rc::new(callee));
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("closure local upvalue reg out of range"), "{err}");
    }

    #[test]
    fn test_suminit_unit_sentinel_skips_payload_check() {
        let mut module = module_with(
            vec![Instruction::make_abc(Opcode::SumInit, 0, 1, SUMINIT_NO_PAYLOAD)],
            1,
        );
        module.type_refs.push(TypeId(0));
        assert!(verify_bytecode_module(&module).is_ok());
    }

    #[test]
    fn test_parallel_table_invariants() {
        let mut module = module_with(vec![], 0);
        module.field_offsets.push(0);
        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.contains("field reference tables"), "{err}");
    }
}
