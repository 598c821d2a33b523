//! Expression lowering.
//!
//! Each helper returns the register holding the expression's result. The
//! caller owns that register and frees it when the value is dead.

use smalls_parser::ast::*;

use crate::bytecode::{Instruction, Opcode, SUMINIT_NO_PAYLOAD};
use crate::runtime::types::TypeKind;

use super::const_eval::{truthy, ConstEvaluator};
use super::Compiler;

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
    }
}

fn comparison_opcode(op: CmpOp) -> Opcode {
    match op {
        CmpOp::Eq => Opcode::Eq,
        CmpOp::Ne => Opcode::Ne,
        CmpOp::Lt => Opcode::Lt,
        CmpOp::Le => Opcode::Le,
        CmpOp::Gt => Opcode::Gt,
        CmpOp::Ge => Opcode::Ge,
    }
}

impl Compiler<'_> {
    pub(crate) fn emit_expr(&mut self, expr: &Expr) -> u8 {
        let span = expr.span();
        self.with_span(span, |c| c.emit_expr_inner(expr))
    }

    fn emit_expr_inner(&mut self, expr: &Expr) -> u8 {
        if expr.is_const() {
            if let Some(reg) = self.try_emit_const(expr) {
                return reg;
            }
        }
        match expr {
            Expr::Literal(lit) => self.emit_literal(lit),
            Expr::FString(fs) => self.emit_fstring(fs),
            Expr::Identifier(ident) => self.emit_identifier(ident),
            Expr::Path(path) => self.emit_path(path),
            Expr::Tuple(tuple) => self.emit_tuple(tuple),
            Expr::Grouping(group) => self.emit_expr(&group.expr),
            Expr::Unary(unary) => self.emit_unary(unary),
            Expr::Binary(binary) => self.emit_binary(binary),
            Expr::Comparison(cmp) => self.emit_comparison(cmp),
            Expr::Logical(logical) => self.emit_logical(expr, logical),
            Expr::Conditional(cond) => self.emit_conditional(cond),
            Expr::Assign(assign) => self.emit_assign(assign),
            Expr::Call(call) => self.emit_call(call),
            Expr::Index(index) => self.emit_index(index),
            Expr::Cast(cast) => self.emit_cast(cast),
            Expr::BraceInit(init) => self.emit_brace_init(init),
            Expr::Lambda(lambda) => self.emit_lambda(lambda),
            Expr::Empty(_) => {
                let reg = self.alloc_reg();
                self.emit_abc(Opcode::LoadNil, reg, 0, 0);
                reg
            }
        }
    }

    /// Fold a constant expression into a single load. Returns the result
    /// register on success; None falls through to normal lowering.
    pub(crate) fn try_emit_const(&mut self, expr: &Expr) -> Option<u8> {
        if !expr.is_const() {
            return None;
        }
        let ast = self.ast;
        let result = ConstEvaluator::new(ast, self.runtime).eval(expr)?;

        let reg = self.alloc_reg();
        if result.type_id == self.runtime.int_type() {
            let val = result.as_int()?;
            self.emit_load_int(reg, val);
        } else if result.type_id == self.runtime.float_type() {
            let k_idx = self.add_constant_float(result.as_float()?);
            if k_idx > u16::MAX as u32 {
                self.fail("constant pool overflow");
                return Some(reg);
            }
            self.emit_abx(Opcode::LoadK, reg, k_idx as u16);
        } else if result.type_id == self.runtime.bool_type() {
            self.emit_abc(Opcode::LoadB, reg, result.as_bool()? as u8, 0);
        } else if result.type_id == self.runtime.string_type() {
            let text = self
                .runtime
                .get_string_view(result.heap_ptr()?)
                .to_string();
            let k_idx = self.add_constant_string(&text);
            if k_idx > u16::MAX as u32 {
                self.fail("constant pool overflow");
                return Some(reg);
            }
            self.emit_abx(Opcode::LoadK, reg, k_idx as u16);
        } else {
            self.free_reg(reg);
            return None;
        }
        Some(reg)
    }

    /// Constant evaluation of an index expression down to an int.
    pub(crate) fn try_eval_const_int(&mut self, expr: &Expr) -> Option<i32> {
        if let Expr::Literal(lit) = expr {
            if let LiteralValue::Int(v) = lit.value {
                return Some(v);
            }
        }
        let ast = self.ast;
        let val = ConstEvaluator::new(ast, self.runtime).eval(expr)?;
        val.as_int()
    }

    pub(crate) fn const_truthiness(&mut self, expr: &Expr) -> Option<bool> {
        if !expr.is_const() {
            return None;
        }
        let ast = self.ast;
        let val = ConstEvaluator::new(ast, self.runtime).eval(expr)?;
        truthy(&val)
    }

    fn emit_literal(&mut self, lit: &LiteralExpr) -> u8 {
        let reg = self.alloc_reg();
        match &lit.value {
            LiteralValue::Int(v) => self.emit_load_int(reg, *v),
            LiteralValue::Float(v) => {
                let k_idx = self.add_constant_float(*v);
                if k_idx > u16::MAX as u32 {
                    self.fail("constant pool overflow");
                    return reg;
                }
                self.emit_abx(Opcode::LoadK, reg, k_idx as u16);
            }
            LiteralValue::Bool(v) => self.emit_abc(Opcode::LoadB, reg, *v as u8, 0),
            LiteralValue::Str(s) => {
                let s = s.clone();
                let k_idx = self.add_constant_string(&s);
                if k_idx > u16::MAX as u32 {
                    self.fail("constant pool overflow");
                    return reg;
                }
                self.emit_abx(Opcode::LoadK, reg, k_idx as u16);
            }
        }
        reg
    }

    fn emit_identifier(&mut self, ident: &IdentifierExpr) -> u8 {
        // Module globals first.
        if let Some(info) = self.module_globals.get(&ident.name).copied() {
            let reg = self.alloc_reg();
            self.emit_abx(Opcode::GetGlobal, reg, info.slot);
            return reg;
        }

        if self.is_captured_variable(&ident.name) {
            let upval_idx = self.get_upvalue_index(&ident.name);
            let reg = self.alloc_reg();
            self.emit_abc(Opcode::GetUpval, reg, upval_idx, 0);
            return reg;
        }

        // A module function used as a value materializes a closure.
        if !self.local_vars.contains_key(&ident.name) {
            if let Some(func_idx) = self.function_index(&ident.name) {
                if func_idx > u16::MAX as usize {
                    self.fail(format!("function index too large for closure: {}", ident.name));
                    return 0;
                }
                let reg = self.alloc_reg();
                self.emit_abx(Opcode::Closure, reg, func_idx as u16);
                return reg;
            }
        }

        let var_reg = self.get_local_register(&ident.name);
        let reg = self.alloc_reg();
        self.emit_abc(Opcode::Move, reg, var_reg, 0);
        reg
    }

    pub(crate) fn emit_path(&mut self, path: &PathExpr) -> u8 {
        if path.parts.is_empty() {
            self.fail("empty path expression");
            return 0;
        }

        // `Sum::Variant` as a unit-variant value.
        if path.is_variant_path && path.parts.len() == 2 {
            return self.emit_unit_variant(path);
        }

        if path.parts.len() == 1 {
            return self.emit_expr(&path.parts[0]);
        }

        let mut current_reg = self.emit_expr(&path.parts[0]);
        let mut current_type = path.parts[0].type_id();

        for part in &path.parts[1..] {
            let Some(ident) = part.as_identifier() else {
                self.fail("path segment must be identifier");
                return current_reg;
            };
            let Some(def) = self.runtime.struct_def_of(current_type).cloned() else {
                self.fail("path operator on non-struct");
                return current_reg;
            };
            let Some(field_idx) = def.field_index(&ident.name) else {
                self.fail(format!("unknown field: {}", ident.name));
                return current_reg;
            };
            let field = def.fields[field_idx].clone();

            // Fixed-array fields of heap structs leave a hint so a following
            // index lowers to a single offset-addressed access.
            if self.allow_fixed_array_short_circuit && !self.is_value_type(current_type) {
                if let Some(TypeKind::FixedArray { elem, len }) = self
                    .runtime
                    .get_type(field.type_id)
                    .map(|t| t.kind.clone())
                {
                    let (elem_size, _) = self.runtime.types.storage_size_align(elem);
                    self.pending_fixed_array = super::PendingFixedArrayField {
                        active: true,
                        struct_reg: current_reg,
                        field_offset: field.offset,
                        elem_size,
                        array_size: len,
                        elem_type_id: elem,
                        is_heap_struct: true,
                    };
                    return current_reg;
                }
            }

            let dest = self.alloc_reg();
            if self.is_value_type(current_type) {
                self.emit_stack_field_get(dest, current_reg, field.offset, field.type_id);
            } else {
                self.emit_field_get(dest, current_reg, field.offset, field.type_id, field_idx);
            }
            self.free_reg(current_reg);
            current_reg = dest;
            current_type = field.type_id;
        }

        current_reg
    }

    fn emit_unit_variant(&mut self, path: &PathExpr) -> u8 {
        let sum_tid = path.info.type_id;
        let Some(variant_name) = path.last_identifier().map(|i| i.name.clone()) else {
            self.fail("invalid sum variant path");
            return 0;
        };
        let Some(def) = self.runtime.sum_def_of(sum_tid).cloned() else {
            self.fail("variant path on non-sum type");
            return 0;
        };
        let Some(variant) = def.find_variant(&variant_name) else {
            self.fail(format!("variant '{}' not found", variant_name));
            return 0;
        };
        let tag = variant.tag_value as u8;

        let type_idx = self.module.add_type_ref(sum_tid);
        let dest = self.alloc_reg();
        if self.is_value_type(sum_tid) {
            self.emit_abx(Opcode::StackAlloc, dest, type_idx);
        } else {
            self.emit_abx(Opcode::NewSum, dest, type_idx);
        }
        self.emit_abc(Opcode::SumInit, dest, tag, SUMINIT_NO_PAYLOAD);
        dest
    }

    fn emit_tuple(&mut self, tuple: &TupleExpr) -> u8 {
        let count = tuple.elements.len() as u8;
        let base_reg = self.alloc_contiguous(count + 1);

        for (i, elem) in tuple.elements.iter().enumerate() {
            let value_reg = self.emit_expr(elem);
            let target = base_reg + 1 + i as u8;
            if value_reg != target {
                self.emit_abc(Opcode::Move, target, value_reg, 0);
                self.free_reg(value_reg);
            }
        }

        self.emit_abc(Opcode::NewTuple, base_reg, count, 0);
        for i in 0..count {
            self.free_reg(base_reg + 1 + i);
        }
        base_reg
    }

    fn emit_unary(&mut self, unary: &UnaryExpr) -> u8 {

        let operand_reg = self.emit_expr(&unary.rhs);

        if unary.op == UnaryOp::Neg {
            if let Some(op_ref) = self
                .runtime
                .find_script_unary_op(UnaryOp::Neg, unary.rhs.type_id())
                .cloned()
            {
                let result = self.emit_script_operator_call(&op_ref.qualified_name(), &[operand_reg]);
                self.free_reg(operand_reg);
                return result;
            }
        }

        let result = self.alloc_reg();
        let op = match unary.op {
            UnaryOp::Neg => Opcode::Neg,
            UnaryOp::Not => Opcode::Not,
        };
        self.emit_abc(op, result, operand_reg, 0);
        self.free_reg(operand_reg);
        result
    }

    fn emit_binary(&mut self, binary: &BinaryExpr) -> u8 {

        let lhs_reg = self.emit_expr(&binary.lhs);
        let rhs_reg = self.emit_expr(&binary.rhs);

        if let Some(op_ref) = self
            .runtime
            .find_script_binary_op(binary.op, binary.lhs.type_id(), binary.rhs.type_id())
            .cloned()
        {
            let result =
                self.emit_script_operator_call(&op_ref.qualified_name(), &[lhs_reg, rhs_reg]);
            self.free_reg(lhs_reg);
            self.free_reg(rhs_reg);
            return result;
        }

        let result = self.alloc_reg();
        self.emit_abc(binary_opcode(binary.op), result, lhs_reg, rhs_reg);
        self.free_reg(lhs_reg);
        self.free_reg(rhs_reg);
        result
    }

    fn emit_comparison(&mut self, cmp: &ComparisonExpr) -> u8 {
        use crate::runtime::ops::RegisteredCmp;


        let lhs_reg = self.emit_expr(&cmp.lhs);
        let rhs_reg = self.emit_expr(&cmp.rhs);

        let lhs_tid = cmp.lhs.type_id();
        let rhs_tid = cmp.rhs.type_id();

        // `!=` is `==` + NOT, `>` is `<` with swapped arguments. `<=`/`>=`
        // stay opcodes so the VM's fast paths decide.
        let (op_ref, negate, swap_args) = match cmp.op {
            CmpOp::Eq => (
                self.runtime
                    .find_script_comparison_op(RegisteredCmp::Eq, lhs_tid, rhs_tid)
                    .cloned(),
                false,
                false,
            ),
            CmpOp::Ne => (
                self.runtime
                    .find_script_comparison_op(RegisteredCmp::Eq, lhs_tid, rhs_tid)
                    .cloned(),
                true,
                false,
            ),
            CmpOp::Lt => (
                self.runtime
                    .find_script_comparison_op(RegisteredCmp::Lt, lhs_tid, rhs_tid)
                    .cloned(),
                false,
                false,
            ),
            CmpOp::Gt => (
                self.runtime
                    .find_script_comparison_op(RegisteredCmp::Lt, rhs_tid, lhs_tid)
                    .cloned(),
                false,
                true,
            ),
            CmpOp::Le | CmpOp::Ge => (None, false, false),
        };

        if let Some(op_ref) = op_ref {
            let args = if swap_args {
                [rhs_reg, lhs_reg]
            } else {
                [lhs_reg, rhs_reg]
            };
            let call_result = self.emit_script_operator_call(&op_ref.qualified_name(), &args);
            self.free_reg(lhs_reg);
            self.free_reg(rhs_reg);

            if negate {
                let neg_result = self.alloc_reg();
                self.emit_abc(Opcode::Not, neg_result, call_result, 0);
                self.free_reg(call_result);
                return neg_result;
            }
            return call_result;
        }

        let result = self.alloc_reg();
        self.emit_abc(comparison_opcode(cmp.op), result, lhs_reg, rhs_reg);
        self.free_reg(lhs_reg);
        self.free_reg(rhs_reg);
        result
    }

    fn emit_logical(&mut self, expr: &Expr, logical: &LogicalExpr) -> u8 {

        let bool_result = expr.type_id() == self.runtime.bool_type()
            || !expr.type_id().is_valid();

        // Constant LHS short-circuits at compile time.
        if let Some(lhs_val) = self.const_truthiness(&logical.lhs) {
            let result = self.alloc_reg();
            let short = match logical.op {
                LogicalOp::And => !lhs_val,
                LogicalOp::Or => lhs_val,
            };
            if short {
                let literal = matches!(logical.op, LogicalOp::Or);
                self.emit_logical_literal(result, literal, bool_result);
            } else {
                let rhs_reg = self.emit_expr(&logical.rhs);
                self.emit_abc(Opcode::Move, result, rhs_reg, 0);
                self.free_reg(rhs_reg);
            }
            return result;
        }

        let lhs_reg = self.emit_expr(&logical.lhs);
        let result = self.alloc_reg();

        match logical.op {
            LogicalOp::And => {
                let jmp_false_idx = self.current_pc();
                self.emit_asbx(Opcode::JmpF, lhs_reg, 0);

                let rhs_reg = self.emit_expr(&logical.rhs);
                self.emit_abc(Opcode::Move, result, rhs_reg, 0);
                self.free_reg(rhs_reg);
                let jmp_end_idx = self.emit_jump(Opcode::Jmp, 0);

                let false_pc = self.current_pc();
                self.patch_jump(jmp_false_idx, false_pc);
                self.emit_logical_literal(result, false, bool_result);
                let end_pc = self.current_pc();
                self.patch_jump(jmp_end_idx, end_pc);
            }
            LogicalOp::Or => {
                let jmp_true_idx = self.current_pc();
                self.emit_asbx(Opcode::JmpT, lhs_reg, 0);

                let rhs_reg = self.emit_expr(&logical.rhs);
                self.emit_abc(Opcode::Move, result, rhs_reg, 0);
                self.free_reg(rhs_reg);
                let jmp_end_idx = self.emit_jump(Opcode::Jmp, 0);

                let true_pc = self.current_pc();
                self.patch_jump(jmp_true_idx, true_pc);
                self.emit_logical_literal(result, true, bool_result);
                let end_pc = self.current_pc();
                self.patch_jump(jmp_end_idx, end_pc);
            }
        }

        self.free_reg(lhs_reg);
        result
    }

    fn emit_logical_literal(&mut self, reg: u8, value: bool, bool_result: bool) {
        if bool_result {
            self.emit_abc(Opcode::LoadB, reg, value as u8, 0);
        } else {
            self.emit_asbx(Opcode::LoadI, reg, value as i16);
        }
    }

    fn emit_conditional(&mut self, cond: &ConditionalExpr) -> u8 {

        // Constant condition compiles only the taken branch.
        if let Some(test) = self.const_truthiness(&cond.test) {
            return if test {
                self.emit_expr(&cond.true_branch)
            } else {
                self.emit_expr(&cond.false_branch)
            };
        }

        let cond_reg = self.emit_expr(&cond.test);
        let final_result = self.alloc_reg();

        let jmp_to_false = self.current_pc();
        self.emit_asbx(Opcode::JmpF, cond_reg, 0);
        self.free_reg(cond_reg);

        let true_reg = self.emit_expr(&cond.true_branch);
        self.emit_abc(Opcode::Move, final_result, true_reg, 0);
        self.free_reg(true_reg);
        let jmp_to_end = self.emit_jump(Opcode::Jmp, 0);

        let false_pc = self.current_pc();
        self.patch_jump(jmp_to_false, false_pc);
        let false_reg = self.emit_expr(&cond.false_branch);
        self.emit_abc(Opcode::Move, final_result, false_reg, 0);
        self.free_reg(false_reg);

        let end_pc = self.current_pc();
        self.patch_jump(jmp_to_end, end_pc);
        final_result
    }

    fn emit_cast(&mut self, cast: &CastExpr) -> u8 {

        let src_reg = self.emit_expr(&cast.expr);
        let type_idx = self.module.add_type_ref(cast.target.info.type_id);
        let dest_reg = self.alloc_reg();
        if dest_reg != src_reg {
            self.emit_abc(Opcode::Move, dest_reg, src_reg, 0);
        }
        match cast.op {
            CastOp::As => self.emit_abx(Opcode::Cast, dest_reg, type_idx),
            CastOp::Is => self.emit_abx(Opcode::Is, dest_reg, type_idx),
        }
        self.free_reg(src_reg);
        dest_reg
    }

    fn emit_lambda(&mut self, lambda: &LambdaExpr) -> u8 {
        let func_idx = self.compile_lambda(lambda);
        if self.error.is_some() {
            return 0;
        }

        let descriptors = self
            .function_at(func_idx as usize)
            .map(|f| f.upvalue_descriptors.clone())
            .unwrap_or_default();

        let dest = self.alloc_reg();
        self.emit_abx(Opcode::Closure, dest, func_idx);

        // Packed 8-bit descriptors, four per raw word.
        for chunk in descriptors.chunks(4) {
            let mut word = 0u32;
            for (j, desc) in chunk.iter().enumerate() {
                word |= (*desc as u32) << (8 * j);
            }
            self.emit(Instruction::raw(word));
        }

        dest
    }

    fn emit_fstring(&mut self, fs: &FStringExpr) -> u8 {
        let mut total_args = 0u8;
        for (i, part) in fs.parts.iter().enumerate() {
            if !part.is_empty() || (total_args == 0 && fs.exprs.is_empty()) {
                total_args += 1;
            }
            if i < fs.exprs.len() {
                total_args += 1;
            }
        }

        let base_reg = self.alloc_contiguous(total_args + 1);
        let dest_reg = base_reg;
        let mut arg_idx = 0u8;

        for (i, part) in fs.parts.iter().enumerate() {
            if !part.is_empty() || (arg_idx == 0 && fs.exprs.is_empty()) {
                let k_idx = self.add_constant_string(part);
                if k_idx > u16::MAX as u32 {
                    self.fail("constant pool overflow in f-string");
                    return dest_reg;
                }
                let target = base_reg + 1 + arg_idx;
                self.emit_abx(Opcode::LoadK, target, k_idx as u16);
                arg_idx += 1;
            }

            if let Some(interp) = fs.exprs.get(i) {
                let mut expr_reg = self.emit_expr(interp);

                // Interpolated values with a script str operator go through it.
                if let Some(str_ref) = self.runtime.find_str_op(interp.type_id()).cloned() {
                    let str_result =
                        self.emit_script_operator_call(&str_ref.qualified_name(), &[expr_reg]);
                    self.free_reg(expr_reg);
                    expr_reg = str_result;
                }

                let target = base_reg + 1 + arg_idx;
                if expr_reg != target {
                    self.emit_abc(Opcode::Move, target, expr_reg, 0);
                }
                self.free_reg(expr_reg);
                arg_idx += 1;
            }
        }

        self.emit_abc(
            Opcode::CallIntr,
            dest_reg,
            IntrinsicId::StringConcat as u8,
            total_args,
        );
        for i in 0..total_args {
            self.free_reg(base_reg + 1 + i);
        }
        dest_reg
    }

    pub(crate) fn emit_brace_init(&mut self, init: &BraceInitExpr) -> u8 {
        let tid = init.info.type_id;
        if !tid.is_valid() {
            self.fail("brace initialization missing type");
            return 0;
        }
        let Some(kind) = self.runtime.get_type(tid).map(|t| t.kind.clone()) else {
            self.fail("unknown type for brace initialization");
            return 0;
        };

        let type_idx = self.module.add_type_ref(tid);
        let dest_reg = self.alloc_reg();

        match kind {
            TypeKind::Struct(sid) => {
                let Some(def) = self.runtime.types.struct_def(sid).cloned() else {
                    self.fail("missing struct definition");
                    return dest_reg;
                };
                let use_stack = self.is_value_type(tid);
                if use_stack {
                    self.emit_abx(Opcode::StackAlloc, dest_reg, type_idx);
                } else {
                    self.emit_abx(Opcode::NewStruct, dest_reg, type_idx);
                }

                match init.kind {
                    BraceInitKind::Field => {
                        for item in &init.items {
                            let Some(name) =
                                item.key.as_ref().and_then(|k| k.as_identifier()).map(|i| i.name.clone())
                            else {
                                continue;
                            };
                            let Some(field_idx) = def.field_index(&name) else {
                                self.fail(format!("unknown field: {}", name));
                                return dest_reg;
                            };
                            let field = def.fields[field_idx].clone();
                            let val_reg = self.emit_expr(&item.value);
                            if use_stack {
                                self.emit_stack_field_set(
                                    dest_reg,
                                    field.offset,
                                    field.type_id,
                                    val_reg,
                                );
                            } else {
                                self.emit_abc(
                                    Opcode::SetField,
                                    dest_reg,
                                    field_idx as u8,
                                    val_reg,
                                );
                            }
                            self.free_reg(val_reg);
                        }
                    }
                    BraceInitKind::List => {
                        for (i, item) in init.items.iter().enumerate() {
                            let Some(field) = def.fields.get(i).cloned() else {
                                self.fail("too many positional initializers");
                                return dest_reg;
                            };
                            let val_reg = self.emit_expr(&item.value);
                            if use_stack {
                                self.emit_stack_field_set(
                                    dest_reg,
                                    field.offset,
                                    field.type_id,
                                    val_reg,
                                );
                            } else {
                                self.emit_abc(Opcode::SetField, dest_reg, i as u8, val_reg);
                            }
                            self.free_reg(val_reg);
                        }
                    }
                    BraceInitKind::KeyValue => {
                        self.fail("key-value initializer on a struct type");
                    }
                }
            }

            TypeKind::Map { .. } => {
                self.emit_abx(Opcode::NewMap, dest_reg, type_idx);
                for item in &init.items {
                    let Some(key) = &item.key else {
                        self.fail("map initializer requires keys");
                        return dest_reg;
                    };
                    let key_reg = self.emit_expr(key);
                    let val_reg = self.emit_expr(&item.value);
                    self.emit_abc(Opcode::MapSet, dest_reg, key_reg, val_reg);
                    self.free_reg(val_reg);
                    self.free_reg(key_reg);
                }
            }

            TypeKind::FixedArray { elem, len } => {
                let (elem_size, _) = self.runtime.types.storage_size_align(elem);
                self.emit_abx(Opcode::StackAlloc, dest_reg, type_idx);
                let limit = init.items.len().min(len.max(0) as usize);
                for (i, item) in init.items.iter().take(limit).enumerate() {
                    let val_reg = self.emit_expr(&item.value);
                    let offset = i as u32 * elem_size;
                    self.emit_stack_field_set(dest_reg, offset, elem, val_reg);
                    self.free_reg(val_reg);
                }
            }

            TypeKind::Array { .. } => {
                let size = init.items.len() as i32;
                self.emit_load_int(dest_reg, size);
                self.emit_abx(Opcode::NewArray, dest_reg, type_idx);
                for (i, item) in init.items.iter().enumerate() {
                    let val_reg = self.emit_expr(&item.value);
                    let idx_reg = self.alloc_reg();
                    self.emit_load_int(idx_reg, i as i32);
                    self.emit_abc(Opcode::SetArray, dest_reg, idx_reg, val_reg);
                    self.free_reg(idx_reg);
                    self.free_reg(val_reg);
                }
            }

            _ => {
                self.fail("brace initialization only supported for structs, maps, and arrays");
            }
        }

        dest_reg
    }

    pub(crate) fn emit_index(&mut self, index: &IndexExpr) -> u8 {
        self.pending_fixed_array.active = false;


        let prev = self.allow_fixed_array_short_circuit;
        self.allow_fixed_array_short_circuit = true;
        let target_reg = self.emit_expr(&index.target);
        self.allow_fixed_array_short_circuit = prev;

        let Some(kind) = self
            .runtime
            .get_type(index.target.type_id())
            .map(|t| t.kind.clone())
        else {
            self.fail("index on invalid type");
            return target_reg;
        };

        match kind {
            TypeKind::Tuple(_) => {
                let Some(index_val) = self.try_eval_const_int(&index.index) else {
                    self.fail("tuple index must be a constant integer 0-255");
                    return target_reg;
                };
                if !(0..=255).contains(&index_val) {
                    self.fail("tuple index must be a constant integer 0-255");
                    return target_reg;
                }
                let dest = self.alloc_reg();
                self.emit_abc(Opcode::GetTuple, dest, target_reg, index_val as u8);
                self.free_reg(target_reg);
                dest
            }

            TypeKind::FixedArray { elem, len } => {
                if self.pending_fixed_array.active && self.pending_fixed_array.is_heap_struct {
                    return self.emit_pending_fixed_array_get(index);
                }

                let (elem_size, _) = self.runtime.types.storage_size_align(elem);
                let dest = self.alloc_reg();
                if let Some(index_val) = self.try_eval_const_int(&index.index) {
                    if index_val < 0 || index_val >= len {
                        self.fail("fixed array index out of bounds");
                        return dest;
                    }
                    let offset = index_val as u32 * elem_size;
                    self.emit_stack_field_get(dest, target_reg, offset, elem);
                    self.free_reg(target_reg);
                } else {
                    let idx_reg = self.emit_expr(&index.index);
                    self.emit_abc(Opcode::StackIndexGet, dest, target_reg, idx_reg);
                    self.free_reg(idx_reg);
                    self.free_reg(target_reg);
                }
                dest
            }

            TypeKind::Array { .. } => {
                let idx_reg = self.emit_expr(&index.index);
                let dest = self.alloc_reg();
                self.emit_abc(Opcode::GetArray, dest, target_reg, idx_reg);
                self.free_reg(idx_reg);
                self.free_reg(target_reg);
                dest
            }

            TypeKind::Map { .. } => {
                let key_reg = self.emit_expr(&index.index);
                let dest = self.alloc_reg();
                self.emit_abc(Opcode::MapGet, dest, target_reg, key_reg);
                self.free_reg(key_reg);
                self.free_reg(target_reg);
                dest
            }

            _ => {
                self.fail("indexing not supported on this type");
                target_reg
            }
        }
    }

    /// Fixed-array field of a heap struct, addressed directly at the field's
    /// computed offset without materializing the array.
    fn emit_pending_fixed_array_get(&mut self, index: &IndexExpr) -> u8 {
        let pending = self.pending_fixed_array;
        self.pending_fixed_array.active = false;

        let dest = self.alloc_reg();
        if let Some(index_val) = self.try_eval_const_int(&index.index) {
            if index_val < 0 || index_val >= pending.array_size {
                self.fail("fixed array index out of bounds");
                self.free_reg(pending.struct_reg);
                return dest;
            }
            let effective_offset = pending.field_offset + index_val as u32 * pending.elem_size;
            let get_op = self.field_offset_get_opcode(pending.elem_type_id);
            let off_reg = self.alloc_reg();
            self.emit_load_int(off_reg, effective_offset as i32);
            self.emit_abc(get_op, dest, pending.struct_reg, off_reg);
            self.free_reg(off_reg);
            self.free_reg(pending.struct_reg);
        } else {
            let idx_reg = self.emit_expr(&index.index);
            let offset_reg = self.emit_fixed_array_element_offset(
                idx_reg,
                pending.field_offset,
                pending.elem_size,
            );
            self.free_reg(idx_reg);
            let get_op = self.field_offset_get_opcode(pending.elem_type_id);
            self.emit_abc(get_op, dest, pending.struct_reg, offset_reg);
            self.free_reg(offset_reg);
            self.free_reg(pending.struct_reg);
        }
        dest
    }

    pub(crate) fn emit_script_operator_call(&mut self, qualified: &str, arg_regs: &[u8]) -> u8 {
        let sym = self.runtime.interner.intern(qualified);
        let ext_idx = self.module.add_external_ref(sym);
        if ext_idx > 255 {
            self.fail("external ref index > 255 for script operator");
            return 0;
        }

        let argc = arg_regs.len() as u8;
        let base_reg = self.alloc_contiguous(argc + 1);
        for (i, arg) in arg_regs.iter().enumerate() {
            self.emit_abc(Opcode::Move, base_reg + 1 + i as u8, *arg, 0);
        }
        self.emit_abc(Opcode::CallExt, base_reg, ext_idx as u8, argc);
        for i in 0..argc {
            self.free_reg(base_reg + 1 + i);
        }
        base_reg
    }

    // ---- calls -------------------------------------------------------------

    fn emit_call(&mut self, call: &CallExpr) -> u8 {
        // Explicit str()/hash() on a type with a registered operator.
        if call.args.len() == 1 && call.intrinsic.is_none() {
            if let Some(ident) = call.callee.as_identifier() {
                let op_ref = match ident.name.as_str() {
                    "str" => self.runtime.find_str_op(call.args[0].type_id()).cloned(),
                    "hash" => self.runtime.find_hash_op(call.args[0].type_id()).cloned(),
                    _ => None,
                };
                if let Some(op_ref) = op_ref {
                    let arg_reg = self.emit_expr(&call.args[0]);
                    let result =
                        self.emit_script_operator_call(&op_ref.qualified_name(), &[arg_reg]);
                    self.free_reg(arg_reg);
                    return result;
                }
            }
        }

        // Sum-variant constructor: `R::Ok(x)`.
        if let Expr::Path(path) = call.callee.as_ref() {
            if path.is_variant_path && self.runtime.sum_def_of(call.info.type_id).is_some() {
                return self.emit_variant_call(call, path);
            }
        }

        // Newtype "constructor" lowers to a cast.
        if call.newtype_target.is_valid() {
            if call.args.len() != 1 {
                self.fail("newtype constructor expects 1 argument");
                return 0;
            }
            let src_reg = self.emit_expr(&call.args[0]);
            let type_idx = self.module.add_type_ref(call.newtype_target);
            self.emit_abx(Opcode::Cast, src_reg, type_idx);
            return src_reg;
        }

        if let Some(intrinsic) = call.intrinsic {
            return self.emit_intrinsic_call(call, intrinsic);
        }

        // Function-typed values (locals, upvalues, arbitrary expressions)
        // dispatch through CALLCLOSURE.
        let is_local_function_value = call
            .callee
            .as_identifier()
            .map(|ident| {
                self.local_vars.contains_key(&ident.name)
                    || self.upvalue_indices.contains_key(&ident.name)
            })
            .unwrap_or(false);
        let is_direct_symbol_call = match call.callee.as_ref() {
            Expr::Identifier(_) => true,
            Expr::Path(path) => {
                path.parts.len() <= 2 && path.parts.iter().all(|p| p.as_identifier().is_some())
            }
            _ => false,
        };
        let callee_is_function_value = matches!(
            self.runtime.get_type(call.callee.type_id()).map(|t| &t.kind),
            Some(TypeKind::Function(_))
        );

        if is_local_function_value || (!is_direct_symbol_call && callee_is_function_value) {
            let closure_reg = self.emit_expr(&call.callee);
            let argc = call.args.len() as u8;
            let base_reg = self.alloc_contiguous(argc + 1);
            for (i, arg) in call.args.iter().enumerate() {
                let value_reg = self.emit_expr(arg);
                let target = base_reg + 1 + i as u8;
                if value_reg != target {
                    self.emit_abc(Opcode::Move, target, value_reg, 0);
                    self.free_reg(value_reg);
                }
            }
            self.emit_abc(Opcode::CallClosure, base_reg, closure_reg, argc);
            for i in 0..argc {
                self.free_reg(base_reg + 1 + i);
            }
            self.free_reg(closure_reg);
            return base_reg;
        }

        if !call.inferred_type_args.is_empty() {
            return self.emit_generic_call(call);
        }

        self.emit_direct_call(call)
    }

    fn emit_variant_call(&mut self, call: &CallExpr, path: &PathExpr) -> u8 {
        let sum_tid = call.info.type_id;
        let Some(variant_name) = path.last_identifier().map(|i| i.name.clone()) else {
            self.fail("invalid sum variant call");
            return 0;
        };
        let Some(def) = self.runtime.sum_def_of(sum_tid).cloned() else {
            self.fail("variant call on non-sum type");
            return 0;
        };
        let Some(variant) = def.find_variant(&variant_name) else {
            self.fail(format!("variant '{}' not found", variant_name));
            return 0;
        };
        let tag = variant.tag_value as u8;

        let type_idx = self.module.add_type_ref(sum_tid);
        let dest = self.alloc_reg();
        if self.is_value_type(sum_tid) {
            self.emit_abx(Opcode::StackAlloc, dest, type_idx);
        } else {
            self.emit_abx(Opcode::NewSum, dest, type_idx);
        }

        if call.args.len() == 1 {
            let payload_reg = self.emit_expr(&call.args[0]);
            self.emit_abc(Opcode::SumInit, dest, tag, payload_reg);
            self.free_reg(payload_reg);
        } else {
            self.emit_abc(Opcode::SumInit, dest, tag, SUMINIT_NO_PAYLOAD);
        }
        dest
    }

    fn emit_intrinsic_call(&mut self, call: &CallExpr, intrinsic: IntrinsicId) -> u8 {
        let intrinsic_raw = intrinsic as u16;
        let argc = call.args.len() as u8;
        let base_reg = self.alloc_contiguous(argc + 1);
        let dest_reg = base_reg;

        for (i, arg) in call.args.iter().enumerate() {
            let value_reg = self.emit_expr(arg);
            let target = base_reg + 1 + i as u8;
            if value_reg != target {
                self.emit_abc(Opcode::Move, target, value_reg, 0);
                self.free_reg(value_reg);
            }
        }

        if intrinsic_raw <= u8::MAX as u16 {
            self.emit_abc(Opcode::CallIntr, dest_reg, intrinsic_raw as u8, argc);
        } else {
            let id_reg = self.alloc_reg();
            self.emit_load_int(id_reg, intrinsic_raw as i32);
            self.emit_abc(Opcode::CallIntrR, dest_reg, id_reg, argc);
            self.free_reg(id_reg);
        }

        for i in 0..argc {
            self.free_reg(base_reg + 1 + i);
        }
        dest_reg
    }

    fn callee_name(&mut self, call: &CallExpr) -> Option<(String, Option<String>)> {
        if let Some(name) = &call.resolved_func {
            return Some((name.clone(), call.resolved_provider.clone()));
        }
        match call.callee.as_ref() {
            Expr::Identifier(ident) => Some((ident.name.clone(), call.resolved_provider.clone())),
            Expr::Path(path) if path.parts.len() == 1 => path
                .parts[0]
                .as_identifier()
                .map(|i| (i.name.clone(), call.resolved_provider.clone())),
            Expr::Path(path) if path.parts.len() == 2 => {
                let first = path.parts[0].as_identifier()?.name.clone();
                let second = path.parts[1].as_identifier()?.name.clone();
                let provider = call.resolved_provider.clone().or(Some(first));
                Some((second, provider))
            }
            _ => None,
        }
    }

    fn emit_generic_call(&mut self, call: &CallExpr) -> u8 {
        let Some((name, provider)) = self.callee_name(call) else {
            self.fail("indirect calls not supported");
            return 0;
        };
        let type_args = call.inferred_type_args.clone();

        // Per-compilation instantiation cap.
        let cap = self.ctx.limits.max_generic_instantiations;
        self.generic_instantiation_count += 1;
        if cap != 0 && self.generic_instantiation_count > cap {
            self.fail("generic function instantiation limit exceeded");
            return 0;
        }

        enum Target {
            Local(u32),
            External(u32),
        }

        let target = match provider.filter(|p| *p != self.module.name) {
            Some(provider_name) => {
                match self.runtime.ensure_generic_instantiation_external(
                    &provider_name,
                    &name,
                    &type_args,
                    self.ctx,
                ) {
                    Ok(qualified) => {
                        let sym = self.runtime.interner.intern(&qualified);
                        let ext_idx = self.module.add_external_ref(sym);
                        if ext_idx > 255 {
                            self.fail("external ref index > 255 (too many external calls in module)");
                            return 0;
                        }
                        Target::External(ext_idx)
                    }
                    Err(message) => {
                        self.fail(message);
                        return 0;
                    }
                }
            }
            None => match self.instantiate_generic(&name, &type_args) {
                Ok(func_idx) => {
                    if func_idx > u8::MAX as u32 {
                        self.fail("instantiated function index too large for CALL");
                        return 0;
                    }
                    Target::Local(func_idx)
                }
                Err(err) => {
                    self.fail(err.message);
                    return 0;
                }
            },
        };

        let template = self.ast.find_function(&name);
        let total_args = template
            .map(|f| f.params.len())
            .unwrap_or(call.args.len())
            .max(call.args.len());

        let base_reg = self.alloc_contiguous(total_args as u8 + 1);
        let dest_reg = base_reg;
        self.emit_call_args(call, template, base_reg, total_args);

        match target {
            Target::Local(idx) => {
                self.emit_abc(Opcode::Call, dest_reg, idx as u8, total_args as u8)
            }
            Target::External(idx) => {
                self.emit_abc(Opcode::CallExt, dest_reg, idx as u8, total_args as u8)
            }
        }

        for i in 0..total_args {
            self.free_reg(base_reg + 1 + i as u8);
        }
        dest_reg
    }

    /// Compile provided arguments into the call window, then fill missing
    /// trailing arguments from the callee's parameter defaults.
    fn emit_call_args(
        &mut self,
        call: &CallExpr,
        callee_def: Option<&FunctionDef>,
        base_reg: u8,
        total_args: usize,
    ) {
        for (i, arg) in call.args.iter().enumerate() {
            let value_reg = self.emit_expr(arg);
            let target = base_reg + 1 + i as u8;
            if value_reg != target {
                self.emit_abc(Opcode::Move, target, value_reg, 0);
                self.free_reg(value_reg);
            }
        }

        if let Some(def) = callee_def {
            let defaults: Vec<Expr> = def
                .params
                .iter()
                .skip(call.args.len())
                .take(total_args - call.args.len())
                .filter_map(|p| p.init.clone())
                .collect();
            for (offset, default) in defaults.iter().enumerate() {
                let value_reg = self.emit_expr(default);
                let target = base_reg + 1 + (call.args.len() + offset) as u8;
                if value_reg != target {
                    self.emit_abc(Opcode::Move, target, value_reg, 0);
                    self.free_reg(value_reg);
                }
            }
        }
    }

    fn emit_direct_call(&mut self, call: &CallExpr) -> u8 {
        let Some((name, provider)) = self.callee_name(call) else {
            self.fail("indirect calls not supported");
            return 0;
        };

        enum Target {
            Local(usize),
            External(u32),
        }

        let module_name = self.module.name.clone();
        let callee_def = self.ast.find_function(&name);
        let callee_is_native = callee_def
            .map(|f| f.block.is_none() || has_annotation(&f.annotations, "native"))
            .unwrap_or(false);

        let target = if let Some(provider_name) = provider.filter(|p| *p != module_name) {
            let qualified = format!("{}.{}", provider_name, name);
            let sym = self.runtime.interner.intern(&qualified);
            Target::External(self.module.add_external_ref(sym))
        } else if callee_is_native {
            // Local native declaration resolves through the external table.
            let qualified = format!("{}.{}", module_name, name);
            if self.runtime.find_external_function(&qualified).is_some() {
                let sym = self.runtime.interner.intern(&qualified);
                Target::External(self.module.add_external_ref(sym))
            } else if self.runtime.find_external_function(&name).is_some() {
                let sym = self.runtime.interner.intern(&name);
                Target::External(self.module.add_external_ref(sym))
            } else {
                self.fail(format!("unknown native function: {}", name));
                return 0;
            }
        } else if let Some(local_idx) = self.function_index(&name) {
            Target::Local(local_idx)
        } else if self.runtime.find_external_function(&name).is_some() {
            let sym = self.runtime.interner.intern(&name);
            Target::External(self.module.add_external_ref(sym))
        } else {
            let qualified = format!("{}.{}", module_name, name);
            if self.runtime.find_external_function(&qualified).is_some() {
                let sym = self.runtime.interner.intern(&qualified);
                Target::External(self.module.add_external_ref(sym))
            } else {
                self.fail(format!("unknown function: {}", name));
                return 0;
            }
        };

        if let Target::Local(idx) = &target {
            if *idx > 255 {
                self.fail("local function index too large for CALL instruction");
                return 0;
            }
        }
        if let Target::External(idx) = &target {
            if *idx > 255 {
                self.fail("external ref index > 255 (too many external calls in module)");
                return 0;
            }
        }

        let total_args = callee_def
            .map(|f| f.params.len())
            .unwrap_or(call.args.len())
            .max(call.args.len());

        let base_reg = self.alloc_contiguous(total_args as u8 + 1);
        let dest_reg = base_reg;
        self.emit_call_args(call, callee_def, base_reg, total_args);

        match target {
            Target::Local(idx) => {
                self.emit_abc(Opcode::Call, dest_reg, idx as u8, total_args as u8)
            }
            Target::External(idx) => {
                self.emit_abc(Opcode::CallExt, dest_reg, idx as u8, total_args as u8)
            }
        }

        for i in 0..total_args {
            self.free_reg(base_reg + 1 + i as u8);
        }
        dest_reg
    }

    // ---- assignment --------------------------------------------------------

    pub(crate) fn emit_assign(&mut self, assign: &AssignExpr) -> u8 {
        self.pending_fixed_array.active = false;
        let compound = assign.op.binary_op();

        if compound.is_some() && matches!(assign.lhs.as_ref(), Expr::Tuple(_)) {
            self.fail("tuple assignment does not support compound operators");
            return 0;
        }

        let rhs_reg = self.emit_expr(&assign.rhs);

        match assign.lhs.as_ref() {
            Expr::Tuple(tuple_lhs) => self.emit_tuple_assign(assign, tuple_lhs, rhs_reg),
            Expr::Identifier(_) => self.emit_name_assign(assign, compound, rhs_reg),
            Expr::Path(path) if path.parts.len() == 1 => {
                self.emit_name_assign(assign, compound, rhs_reg)
            }
            Expr::Path(path) => self.emit_field_assign(assign, path, compound, rhs_reg),
            Expr::Index(index) => self.emit_index_assign(assign, index, compound, rhs_reg),
            _ => {
                self.fail("only variable, field, and index assignment is supported");
                rhs_reg
            }
        }
    }

    fn emit_tuple_assign(&mut self, assign: &AssignExpr, tuple_lhs: &TupleExpr, rhs_reg: u8) -> u8 {
        let rhs_tid = assign.rhs.type_id();
        let element_count = self.runtime.tuple_element_count(rhs_tid);
        if rhs_tid.is_valid() && element_count != 0 && element_count != tuple_lhs.elements.len() {
            self.fail("tuple assignment element count mismatch");
            return rhs_reg;
        }

        for (i, element) in tuple_lhs.elements.iter().enumerate() {
            if i > 255 {
                self.fail("tuple index must be a constant integer 0-255");
                return rhs_reg;
            }
            let Some(ident) = element.as_identifier() else {
                self.fail("tuple assignment only supports variable targets");
                return rhs_reg;
            };
            let name = ident.name.clone();

            if let Some(info) = self.module_globals.get(&name).copied() {
                if info.is_const {
                    self.fail(format!("cannot assign to const global '{}'", name));
                    return rhs_reg;
                }
                let temp = self.alloc_reg();
                self.emit_abc(Opcode::GetTuple, temp, rhs_reg, i as u8);
                self.emit_abx(Opcode::SetGlobal, temp, info.slot);
                self.free_reg(temp);
            } else if self.is_captured_variable(&name) {
                let upval_idx = self.get_upvalue_index(&name);
                let temp = self.alloc_reg();
                self.emit_abc(Opcode::GetTuple, temp, rhs_reg, i as u8);
                self.emit_abc(Opcode::SetUpval, temp, upval_idx, 0);
                self.free_reg(temp);
            } else {
                let var_reg = self.get_local_register(&name);
                self.emit_abc(Opcode::GetTuple, var_reg, rhs_reg, i as u8);
            }
        }
        rhs_reg
    }

    fn emit_name_assign(
        &mut self,
        assign: &AssignExpr,
        compound: Option<BinaryOp>,
        rhs_reg: u8,
    ) -> u8 {
        let Some(ident) = assign.lhs.as_identifier() else {
            self.fail("assignment target must be identifier");
            return rhs_reg;
        };
        let name = ident.name.clone();

        let global = self.module_globals.get(&name).copied();
        if let Some(info) = global {
            if info.is_const {
                self.fail(format!("cannot assign to const global '{}'", name));
                return rhs_reg;
            }
        }

        if let Some(op) = compound {
            let current_reg = self.alloc_reg();
            if let Some(info) = global {
                self.emit_abx(Opcode::GetGlobal, current_reg, info.slot);
            } else if self.is_captured_variable(&name) {
                let upval_idx = self.get_upvalue_index(&name);
                self.emit_abc(Opcode::GetUpval, current_reg, upval_idx, 0);
            } else {
                let var_reg = self.get_local_register(&name);
                self.emit_abc(Opcode::Move, current_reg, var_reg, 0);
            }

            let value_reg = self.alloc_reg();
            self.emit_compound_op(op, value_reg, current_reg, rhs_reg, &assign.lhs, &assign.rhs);

            if let Some(info) = global {
                self.emit_abx(Opcode::SetGlobal, value_reg, info.slot);
            } else if self.is_captured_variable(&name) {
                let upval_idx = self.get_upvalue_index(&name);
                self.emit_abc(Opcode::SetUpval, value_reg, upval_idx, 0);
            } else {
                let var_reg = self.get_local_register(&name);
                self.emit_abc(Opcode::Move, var_reg, value_reg, 0);
            }

            self.free_reg(current_reg);
            self.free_reg(rhs_reg);
            value_reg
        } else {
            if let Some(info) = global {
                self.emit_abx(Opcode::SetGlobal, rhs_reg, info.slot);
            } else if self.is_captured_variable(&name) {
                let upval_idx = self.get_upvalue_index(&name);
                self.emit_abc(Opcode::SetUpval, rhs_reg, upval_idx, 0);
            } else {
                let var_reg = self.get_local_register(&name);
                self.emit_abc(Opcode::Move, var_reg, rhs_reg, 0);
            }
            rhs_reg
        }
    }

    /// Compound assignment operator application, honoring script operators.
    fn emit_compound_op(
        &mut self,
        op: BinaryOp,
        dest: u8,
        current: u8,
        rhs: u8,
        lhs_expr: &Expr,
        rhs_expr: &Expr,
    ) {
        if let Some(op_ref) = self
            .runtime
            .find_script_binary_op(op, lhs_expr.type_id(), rhs_expr.type_id())
            .cloned()
        {
            let result = self.emit_script_operator_call(&op_ref.qualified_name(), &[current, rhs]);
            self.emit_abc(Opcode::Move, dest, result, 0);
            self.free_reg(result);
        } else {
            self.emit_abc(binary_opcode(op), dest, current, rhs);
        }
    }

    fn emit_field_assign(
        &mut self,
        assign: &AssignExpr,
        path: &PathExpr,
        compound: Option<BinaryOp>,
        rhs_reg: u8,
    ) -> u8 {
        let mut struct_reg = self.emit_expr(&path.parts[0]);
        let mut current_type = path.parts[0].type_id();

        // Walk intermediate segments.
        for part in &path.parts[1..path.parts.len() - 1] {
            let Some(ident) = part.as_identifier() else {
                self.fail("path segment must be identifier");
                return rhs_reg;
            };
            let Some(def) = self.runtime.struct_def_of(current_type).cloned() else {
                self.fail("field assignment on non-struct");
                return rhs_reg;
            };
            let Some(field_idx) = def.field_index(&ident.name) else {
                self.fail(format!("unknown field: {}", ident.name));
                return rhs_reg;
            };
            let field = def.fields[field_idx].clone();

            let dest = self.alloc_reg();
            if self.is_value_type(current_type) {
                self.emit_stack_field_get(dest, struct_reg, field.offset, field.type_id);
            } else {
                self.emit_field_get(dest, struct_reg, field.offset, field.type_id, field_idx);
            }
            self.free_reg(struct_reg);
            struct_reg = dest;
            current_type = field.type_id;
        }

        let Some(last_ident) = path.parts.last().and_then(|p| p.as_identifier()) else {
            self.fail("expected field name in path");
            return rhs_reg;
        };
        let Some(def) = self.runtime.struct_def_of(current_type).cloned() else {
            self.fail("field assignment on non-struct");
            return rhs_reg;
        };
        let Some(field_idx) = def.field_index(&last_ident.name) else {
            self.fail(format!("unknown field: {}", last_ident.name));
            return rhs_reg;
        };
        let field = def.fields[field_idx].clone();

        let mut value_reg = rhs_reg;
        if let Some(op) = compound {
            let current_reg = self.alloc_reg();
            if self.is_value_type(current_type) {
                self.emit_stack_field_get(current_reg, struct_reg, field.offset, field.type_id);
            } else {
                self.emit_field_get(current_reg, struct_reg, field.offset, field.type_id, field_idx);
            }
            value_reg = self.alloc_reg();
            self.emit_compound_op(op, value_reg, current_reg, rhs_reg, &assign.lhs, &assign.rhs);
            self.free_reg(current_reg);
            self.free_reg(rhs_reg);
        }

        if self.is_value_type(current_type) {
            self.emit_stack_field_set(struct_reg, field.offset, field.type_id, value_reg);
        } else {
            self.emit_field_set(struct_reg, field.offset, field.type_id, value_reg, field_idx);
        }

        self.free_reg(struct_reg);
        value_reg
    }

    fn emit_index_assign(
        &mut self,
        assign: &AssignExpr,
        index: &IndexExpr,
        compound: Option<BinaryOp>,
        rhs_reg: u8,
    ) -> u8 {
        let prev = self.allow_fixed_array_short_circuit;
        self.allow_fixed_array_short_circuit = true;
        let target_reg = self.emit_expr(&index.target);
        self.allow_fixed_array_short_circuit = prev;

        let Some(kind) = self
            .runtime
            .get_type(index.target.type_id())
            .map(|t| t.kind.clone())
        else {
            self.fail("assignment to unknown type");
            return rhs_reg;
        };

        if let TypeKind::FixedArray { elem, len } = kind {
            if self.pending_fixed_array.active && self.pending_fixed_array.is_heap_struct {
                return self.emit_pending_fixed_array_set(assign, index, compound, rhs_reg);
            }

            let (elem_size, _) = self.runtime.types.storage_size_align(elem);

            if let Some(index_val) = self.try_eval_const_int(&index.index) {
                if index_val < 0 || index_val >= len {
                    self.fail("fixed array index out of bounds");
                    return rhs_reg;
                }
                let offset = index_val as u32 * elem_size;
                let mut value_reg = rhs_reg;
                if let Some(op) = compound {
                    let current_reg = self.alloc_reg();
                    self.emit_stack_field_get(current_reg, target_reg, offset, elem);
                    value_reg = self.alloc_reg();
                    self.emit_compound_op(op, value_reg, current_reg, rhs_reg, &assign.lhs, &assign.rhs);
                    self.free_reg(current_reg);
                    self.free_reg(rhs_reg);
                }
                self.emit_stack_field_set(target_reg, offset, elem, value_reg);
                self.free_reg(target_reg);
                return value_reg;
            }

            let idx_reg = self.emit_expr(&index.index);
            let mut value_reg = rhs_reg;
            if let Some(op) = compound {
                let current_reg = self.alloc_reg();
                self.emit_abc(Opcode::StackIndexGet, current_reg, target_reg, idx_reg);
                value_reg = self.alloc_reg();
                self.emit_compound_op(op, value_reg, current_reg, rhs_reg, &assign.lhs, &assign.rhs);
                self.free_reg(current_reg);
                self.free_reg(rhs_reg);
            }
            self.emit_abc(Opcode::StackIndexSet, target_reg, idx_reg, value_reg);
            self.free_reg(idx_reg);
            self.free_reg(target_reg);
            return value_reg;
        }

        let key_reg = self.emit_expr(&index.index);
        let mut value_reg = rhs_reg;
        if let Some(op) = compound {
            let current_reg = self.alloc_reg();
            match kind {
                TypeKind::Map { .. } => {
                    self.emit_abc(Opcode::MapGet, current_reg, target_reg, key_reg)
                }
                TypeKind::Array { .. } => {
                    self.emit_abc(Opcode::GetArray, current_reg, target_reg, key_reg)
                }
                _ => {
                    self.fail("index assignment only supported for maps and arrays");
                    self.free_reg(current_reg);
                    return rhs_reg;
                }
            }
            value_reg = self.alloc_reg();
            self.emit_compound_op(op, value_reg, current_reg, rhs_reg, &assign.lhs, &assign.rhs);
            self.free_reg(current_reg);
            self.free_reg(rhs_reg);
        }

        match kind {
            TypeKind::Map { .. } => self.emit_abc(Opcode::MapSet, target_reg, key_reg, value_reg),
            TypeKind::Array { .. } => {
                self.emit_abc(Opcode::SetArray, target_reg, key_reg, value_reg)
            }
            _ => self.fail("index assignment only supported for maps and arrays"),
        }

        self.free_reg(key_reg);
        self.free_reg(target_reg);
        value_reg
    }

    fn emit_pending_fixed_array_set(
        &mut self,
        assign: &AssignExpr,
        index: &IndexExpr,
        compound: Option<BinaryOp>,
        rhs_reg: u8,
    ) -> u8 {
        let pending = self.pending_fixed_array;
        self.pending_fixed_array.active = false;

        if let Some(index_val) = self.try_eval_const_int(&index.index) {
            if index_val < 0 || index_val >= pending.array_size {
                self.fail("fixed array index out of bounds");
                self.free_reg(pending.struct_reg);
                return rhs_reg;
            }
            let effective_offset = pending.field_offset + index_val as u32 * pending.elem_size;
            let off_reg = self.alloc_reg();
            self.emit_load_int(off_reg, effective_offset as i32);

            let mut value_reg = rhs_reg;
            if let Some(op) = compound {
                let current_reg = self.alloc_reg();
                let get_op = self.field_offset_get_opcode(pending.elem_type_id);
                self.emit_abc(get_op, current_reg, pending.struct_reg, off_reg);
                value_reg = self.alloc_reg();
                self.emit_compound_op(op, value_reg, current_reg, rhs_reg, &assign.lhs, &assign.rhs);
                self.free_reg(current_reg);
                self.free_reg(rhs_reg);
            }

            let set_op = self.field_offset_set_opcode(pending.elem_type_id);
            self.emit_abc(set_op, value_reg, pending.struct_reg, off_reg);
            self.free_reg(off_reg);
            self.free_reg(pending.struct_reg);
            return value_reg;
        }

        let idx_reg = self.emit_expr(&index.index);
        let offset_reg =
            self.emit_fixed_array_element_offset(idx_reg, pending.field_offset, pending.elem_size);

        let mut value_reg = rhs_reg;
        if let Some(op) = compound {
            let current_reg = self.alloc_reg();
            let get_op = self.field_offset_get_opcode(pending.elem_type_id);
            self.emit_abc(get_op, current_reg, pending.struct_reg, offset_reg);
            value_reg = self.alloc_reg();
            self.emit_compound_op(op, value_reg, current_reg, rhs_reg, &assign.lhs, &assign.rhs);
            self.free_reg(current_reg);
            self.free_reg(rhs_reg);
        }

        let set_op = self.field_offset_set_opcode(pending.elem_type_id);
        self.emit_abc(set_op, value_reg, pending.struct_reg, offset_reg);
        self.free_reg(offset_reg);
        self.free_reg(idx_reg);
        self.free_reg(pending.struct_reg);
        value_reg
    }
}
