//! Statement lowering.
//!
//! Loops push a control scope collecting break/continue jump indices that
//! are back-patched when the loop shape is known. Switch bodies are emitted
//! first and the dispatch block after, jumping back into the case labels.

use smalls_parser::ast::*;

use crate::bytecode::Opcode;
use crate::runtime::types::TypeKind;

use super::{Compiler, ControlScope};

impl Compiler<'_> {
    pub(crate) fn emit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(block) => self.emit_block(block),
            Stmt::Empty(_) => {}
            Stmt::Expr(expr_stmt) => {
                let reg = self.emit_expr(&expr_stmt.expr);
                self.free_reg(reg);
            }
            Stmt::If(if_stmt) => self.emit_if(if_stmt),
            Stmt::For(for_stmt) => self.emit_for(for_stmt),
            Stmt::ForEach(foreach) => self.emit_foreach(foreach),
            Stmt::Jump(jump) => self.emit_jump_stmt(jump),
            Stmt::Label(label) => self.emit_label(label),
            Stmt::Switch(switch) => self.emit_switch(switch),
            Stmt::Decl(decl) => self.emit_decl_stmt(decl),
        }
    }

    fn emit_decl_stmt(&mut self, decl: &Decl) {
        match decl {
            Decl::Var(var) => self.emit_var_decl(var),
            Decl::VarList(list) => self.emit_decl_list(list),
            // Type and import declarations emit no code.
            _ => {}
        }
    }

    fn emit_var_decl(&mut self, var: &VarDecl) {
        let var_reg = self.allocate_local(&var.name);
        let tid = var.info.type_id;

        if let Some(init) = &var.init {
            let is_val_type = self.is_value_type(tid);
            let is_brace_init = matches!(init, Expr::BraceInit(_));

            if is_val_type && !is_brace_init {
                // Copy-initialize fresh stack storage from the source value.
                let type_idx = self.module.add_type_ref(tid);
                self.emit_abx(Opcode::StackAlloc, var_reg, type_idx);
                let src_reg = self.emit_expr(init);
                self.emit_abc(Opcode::StackCopy, var_reg, src_reg, 0);
                self.free_reg(src_reg);
            } else {
                let src_reg = self.emit_expr(init);
                if src_reg != var_reg {
                    self.emit_abc(Opcode::Move, var_reg, src_reg, 0);
                    self.free_reg(src_reg);
                }
            }
            return;
        }

        // No initializer: value types get zeroed stack storage, strings an
        // empty literal, collections a fresh container, everything else nil.
        if self.is_value_type(tid) {
            let type_idx = self.module.add_type_ref(tid);
            self.emit_abx(Opcode::StackAlloc, var_reg, type_idx);
            return;
        }

        let kind = self.runtime.get_type(tid).map(|t| t.kind.clone());
        match kind {
            Some(TypeKind::Primitive(crate::runtime::types::PrimitiveKind::String)) => {
                let k_idx = self.add_constant_string("");
                self.emit_abx(Opcode::LoadK, var_reg, k_idx as u16);
            }
            Some(TypeKind::Array { .. }) => {
                self.emit_asbx(Opcode::LoadI, var_reg, 0);
                let type_idx = self.module.add_type_ref(tid);
                self.emit_abx(Opcode::NewArray, var_reg, type_idx);
            }
            Some(TypeKind::Map { .. }) => {
                let type_idx = self.module.add_type_ref(tid);
                self.emit_abx(Opcode::NewMap, var_reg, type_idx);
            }
            Some(TypeKind::Function(_)) => {
                self.emit_abc(Opcode::LoadNil, var_reg, 0, 0);
                let type_idx = self.module.add_type_ref(tid);
                self.emit_abx(Opcode::Cast, var_reg, type_idx);
            }
            _ => {
                self.emit_abc(Opcode::LoadNil, var_reg, 0, 0);
            }
        }
    }

    fn emit_decl_list(&mut self, list: &DeclList) {
        // A shared initializer is tuple destructuring.
        let shared_init = list.decls.first().and_then(|d| d.init.as_ref());
        let all_share = list.decls.len() > 1
            && shared_init.is_some()
            && list.decls.iter().all(|d| d.init.is_some());

        if all_share {
            let init = shared_init.expect("checked above").clone();
            let tuple_reg = self.emit_expr(&init);

            let element_count = self.runtime.tuple_element_count(init.type_id());
            if init.type_id().is_valid()
                && element_count != 0
                && element_count < list.decls.len()
            {
                self.fail("tuple destructuring has more variables than tuple elements");
                return;
            }

            for (i, decl) in list.decls.iter().enumerate() {
                if i > 255 {
                    self.fail("tuple index must be a constant integer 0-255");
                    return;
                }
                let var_reg = self.allocate_local(&decl.name);
                self.emit_abc(Opcode::GetTuple, var_reg, tuple_reg, i as u8);
            }
            self.free_reg(tuple_reg);
            return;
        }

        for decl in &list.decls {
            self.emit_var_decl(decl);
        }
    }

    fn emit_if(&mut self, stmt: &IfStmt) {
        // DCE: constant condition compiles only the taken branch.
        if let Some(cond) = self.const_truthiness(&stmt.cond) {
            if cond {
                self.emit_block(&stmt.then_block);
            } else if let Some(else_block) = &stmt.else_block {
                self.emit_block(else_block);
            }
            return;
        }

        let cond_reg = self.emit_expr(&stmt.cond);
        let jmp_to_else = self.current_pc();
        self.emit_asbx(Opcode::JmpF, cond_reg, 0);
        self.free_reg(cond_reg);

        self.emit_block(&stmt.then_block);

        if let Some(else_block) = &stmt.else_block {
            let jmp_to_end = self.emit_jump(Opcode::Jmp, 0);
            let else_pc = self.current_pc();
            self.patch_jump(jmp_to_else, else_pc);
            self.emit_block(else_block);
            let end_pc = self.current_pc();
            self.patch_jump(jmp_to_end, end_pc);
        } else {
            let end_pc = self.current_pc();
            self.patch_jump(jmp_to_else, end_pc);
        }
    }

    fn emit_for(&mut self, stmt: &ForStmt) {
        // DCE: provably-false condition drops the body. The init clause
        // still runs for its bindings and side effects.
        if let Some(check) = &stmt.check {
            if let Some(false) = self.const_truthiness(check) {
                if let Some(init) = &stmt.init {
                    self.emit_stmt(init);
                }
                return;
            }
        }

        if let Some(init) = &stmt.init {
            self.emit_stmt(init);
        }

        let loop_start = self.current_pc();
        self.control_stack.push(ControlScope {
            is_loop: true,
            ..ControlScope::default()
        });

        let mut exit_jump = None;
        if let Some(check) = &stmt.check {
            let cond_reg = self.emit_expr(check);
            exit_jump = Some(self.current_pc());
            self.emit_asbx(Opcode::JmpF, cond_reg, 0);
            self.free_reg(cond_reg);
        }

        self.emit_block(&stmt.block);

        // Close per-iteration captures before the increment so closures made
        // in the body snapshot this iteration's variables.
        let continue_target = self.current_pc();
        self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
        let continues = std::mem::take(
            &mut self
                .control_stack
                .last_mut()
                .expect("loop scope pushed above")
                .continue_jumps,
        );
        for idx in continues {
            self.patch_jump(idx, continue_target);
        }

        if let Some(inc) = &stmt.inc {
            let reg = self.emit_expr(inc);
            self.free_reg(reg);
        }

        let back_jump = self.emit_jump(Opcode::Jmp, 0);
        self.patch_jump(back_jump, loop_start);

        let loop_end = self.current_pc();
        if let Some(idx) = exit_jump {
            self.patch_jump(idx, loop_end);
        }
        let scope = self.control_stack.pop().expect("loop scope pushed above");
        for idx in scope.break_jumps {
            self.patch_jump(idx, loop_end);
        }
    }

    fn emit_foreach(&mut self, stmt: &ForEachStmt) {
        let collection_reg = self.emit_expr(&stmt.collection);
        if stmt.is_map_iteration {
            self.emit_foreach_map(stmt, collection_reg);
        } else {
            self.emit_foreach_array(stmt, collection_reg);
        }
        self.free_reg(collection_reg);
    }

    /// Map iteration through the MapIterBegin/Next/End intrinsic triple.
    /// Iter-next writes (valid, key, value) into a three-register window.
    fn emit_foreach_map(&mut self, stmt: &ForEachStmt, collection_reg: u8) {
        let iter_reg = self.alloc_contiguous(2);
        self.emit_abc(Opcode::Move, iter_reg + 1, collection_reg, 0);
        self.emit_abc(
            Opcode::CallIntr,
            iter_reg,
            IntrinsicId::MapIterBegin as u8,
            1,
        );
        self.free_reg(iter_reg + 1);

        let key_var = stmt.key_var.as_ref().expect("map iteration has key var");
        let value_var = stmt.value_var.as_ref().expect("map iteration has value var");
        let key_reg = self.allocate_local(&key_var.name);
        let val_reg = self.allocate_local(&value_var.name);

        let loop_start = self.current_pc();
        self.control_stack.push(ControlScope {
            is_loop: true,
            ..ControlScope::default()
        });

        // Three-register result window for (valid, key, value).
        let res_base = self.alloc_contiguous(3);
        self.emit_abc(Opcode::Move, res_base + 1, iter_reg, 0);
        self.emit_abc(Opcode::CallIntr, res_base, IntrinsicId::MapIterNext as u8, 1);

        let exit_jump = self.current_pc();
        self.emit_asbx(Opcode::JmpF, res_base, 0);

        self.emit_abc(Opcode::Move, key_reg, res_base + 1, 0);
        self.emit_abc(Opcode::Move, val_reg, res_base + 2, 0);
        self.free_reg(res_base + 2);
        self.free_reg(res_base + 1);
        self.free_reg(res_base);

        self.emit_block(&stmt.block);

        let continue_target = self.current_pc();
        self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
        let continues = std::mem::take(
            &mut self
                .control_stack
                .last_mut()
                .expect("loop scope pushed above")
                .continue_jumps,
        );
        for idx in continues {
            self.patch_jump(idx, continue_target);
        }

        let back_jump = self.emit_jump(Opcode::Jmp, 0);
        self.patch_jump(back_jump, loop_start);

        // Cleanup: break and exit both release the iterator.
        let cleanup_pc = self.current_pc();
        let cleanup_reg = self.alloc_contiguous(3);
        self.emit_abc(Opcode::Move, cleanup_reg + 1, collection_reg, 0);
        self.emit_abc(Opcode::Move, cleanup_reg + 2, iter_reg, 0);
        self.emit_abc(Opcode::CallIntr, cleanup_reg, IntrinsicId::MapIterEnd as u8, 2);
        self.free_reg(cleanup_reg + 2);
        self.free_reg(cleanup_reg + 1);
        self.free_reg(cleanup_reg);

        self.patch_jump(exit_jump, cleanup_pc);
        let scope = self.control_stack.pop().expect("loop scope pushed above");
        for idx in scope.break_jumps {
            self.patch_jump(idx, cleanup_pc);
        }

        self.free_reg(iter_reg);
    }

    /// Array iteration by index with a bounds test per step.
    fn emit_foreach_array(&mut self, stmt: &ForEachStmt, collection_reg: u8) {
        let index_reg = self.alloc_reg();
        self.emit_asbx(Opcode::LoadI, index_reg, 0);

        let loop_start = self.current_pc();
        self.control_stack.push(ControlScope {
            is_loop: true,
            ..ControlScope::default()
        });

        let len_reg = self.alloc_contiguous(2);
        self.emit_abc(Opcode::Move, len_reg + 1, collection_reg, 0);
        self.emit_abc(Opcode::CallIntr, len_reg, IntrinsicId::ArrayLen as u8, 1);
        self.free_reg(len_reg + 1);

        let cmp_reg = self.alloc_reg();
        self.emit_abc(Opcode::Lt, cmp_reg, index_reg, len_reg);
        let exit_jump = self.current_pc();
        self.emit_asbx(Opcode::JmpF, cmp_reg, 0);
        self.free_reg(cmp_reg);
        self.free_reg(len_reg);

        let elem_var = stmt.var.as_ref().expect("array iteration has loop var");
        let elem_reg = self.allocate_local(&elem_var.name);
        self.emit_abc(Opcode::GetArray, elem_reg, collection_reg, index_reg);

        self.emit_block(&stmt.block);

        let continue_target = self.current_pc();
        self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
        let continues = std::mem::take(
            &mut self
                .control_stack
                .last_mut()
                .expect("loop scope pushed above")
                .continue_jumps,
        );
        for idx in continues {
            self.patch_jump(idx, continue_target);
        }

        let one_reg = self.alloc_reg();
        self.emit_asbx(Opcode::LoadI, one_reg, 1);
        self.emit_abc(Opcode::Add, index_reg, index_reg, one_reg);
        self.free_reg(one_reg);

        let back_jump = self.emit_jump(Opcode::Jmp, 0);
        self.patch_jump(back_jump, loop_start);

        let loop_end = self.current_pc();
        self.patch_jump(exit_jump, loop_end);
        let scope = self.control_stack.pop().expect("loop scope pushed above");
        for idx in scope.break_jumps {
            self.patch_jump(idx, loop_end);
        }

        self.free_reg(index_reg);
    }

    fn emit_jump_stmt(&mut self, stmt: &JumpStmt) {
        match stmt.kind {
            JumpKind::Return => {
                if stmt.exprs.is_empty() {
                    self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
                    self.emit_abc(Opcode::RetVoid, 0, 0, 0);
                } else if stmt.exprs.len() == 1 {
                    let reg = self.emit_expr(&stmt.exprs[0]);
                    self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
                    self.emit_abc(Opcode::Ret, reg, 0, 0);
                    self.free_reg(reg);
                } else {
                    // Multiple return values build a tuple.
                    let mut value_regs = Vec::with_capacity(stmt.exprs.len());
                    for expr in &stmt.exprs {
                        value_regs.push(self.emit_expr(expr));
                    }

                    let count = value_regs.len() as u8;
                    let tuple_reg = self.alloc_contiguous(count + 1);
                    for (i, value_reg) in value_regs.iter().enumerate() {
                        let target = tuple_reg + 1 + i as u8;
                        if *value_reg != target {
                            self.emit_abc(Opcode::Move, target, *value_reg, 0);
                        }
                        self.free_reg(*value_reg);
                    }

                    self.emit_abc(Opcode::NewTuple, tuple_reg, count, 0);
                    self.emit_abc(Opcode::CloseUpvals, 0, 0, 0);
                    self.emit_abc(Opcode::Ret, tuple_reg, 0, 0);
                    self.free_reg(tuple_reg);
                }
                self.block_terminated = true;
            }
            JumpKind::Break => {
                if self.control_stack.is_empty() {
                    self.fail("break statement outside of control structure");
                    return;
                }
                let idx = self.emit_jump(Opcode::Jmp, 0);
                self.control_stack
                    .last_mut()
                    .expect("checked non-empty")
                    .break_jumps
                    .push(idx);
                self.block_terminated = true;
            }
            JumpKind::Continue => {
                let Some(scope_idx) = self
                    .control_stack
                    .iter()
                    .rposition(|scope| scope.is_loop)
                else {
                    self.fail("continue statement outside of loop");
                    return;
                };
                let idx = self.emit_jump(Opcode::Jmp, 0);
                self.control_stack[scope_idx].continue_jumps.push(idx);
                self.block_terminated = true;
            }
        }
    }

    fn emit_switch(&mut self, stmt: &SwitchStmt) {
        let target_reg = self.emit_expr(&stmt.target);
        let target_tid = stmt.target.type_id();

        let is_sum_switch = self.runtime.sum_def_of(target_tid).is_some();
        let is_object_switch = self.runtime.is_object_like_type(target_tid);

        // Body first; the dispatch block goes at the end and jumps back in.
        let jump_to_dispatch = self.emit_jump(Opcode::Jmp, 0);

        self.control_stack.push(ControlScope {
            is_loop: false,
            is_sum_switch,
            is_object_switch,
            target_reg,
            sum_type_id: target_tid,
            ..ControlScope::default()
        });

        // No implicit fallthrough: each case's statements get a break after
        // the label's body run.
        let mut last_was_label = false;
        for node in &stmt.block.nodes {
            if self.error.is_some() {
                break;
            }
            if let Stmt::Label(_) = node {
                last_was_label = true;
                self.emit_stmt(node);
            } else {
                let was_terminated = self.block_terminated;
                self.block_terminated = false;
                self.emit_stmt(node);
                let terminated = self.block_terminated;
                self.block_terminated = was_terminated;
                if last_was_label && !terminated {
                    let break_idx = self.emit_jump(Opcode::Jmp, 0);
                    self.control_stack
                        .last_mut()
                        .expect("switch scope pushed above")
                        .break_jumps
                        .push(break_idx);
                }
                last_was_label = false;
            }
        }

        let jump_to_end = self.emit_jump(Opcode::Jmp, 0);

        // Dispatch block.
        let dispatch_start = self.current_pc();
        self.patch_jump(jump_to_dispatch, dispatch_start);

        let scope = self.control_stack.pop().expect("switch scope pushed above");

        if is_sum_switch {
            self.emit_sum_dispatch(&scope);
        } else if is_object_switch {
            self.emit_object_dispatch(&scope);
        } else {
            self.emit_value_dispatch(&scope);
        }

        if let Some(default_pc) = scope.default_pc {
            let offset = default_pc as i32 - (self.current_pc() as i32 + 1);
            self.emit_jump(Opcode::Jmp, offset);
        }

        let end_pc = self.current_pc();
        self.patch_jump(jump_to_end, end_pc);
        for idx in &scope.break_jumps {
            self.patch_jump(*idx, end_pc);
        }

        self.free_reg(target_reg);
    }

    fn emit_sum_dispatch(&mut self, scope: &ControlScope) {
        let Some(def) = self.runtime.sum_def_of(scope.sum_type_id).cloned() else {
            self.fail("switch dispatch on non-sum type");
            return;
        };

        let tag_reg = self.alloc_reg();
        self.emit_abc(Opcode::SumGetTag, tag_reg, scope.target_reg, 0);

        for (variant_name, label_pc) in &scope.pattern_cases {
            let Some(variant) = def.find_variant(variant_name) else {
                continue;
            };
            let expected_reg = self.alloc_reg();
            self.emit_asbx(Opcode::LoadI, expected_reg, variant.tag_value as i16);
            self.emit_abc(Opcode::IsEq, tag_reg, expected_reg, 0);
            self.free_reg(expected_reg);

            // Not equal: fall through to the next check. Equal: skip into
            // the case body.
            let skip_jump = self.emit_jump(Opcode::Jmp, 0);
            let offset = *label_pc as i32 - (self.current_pc() as i32 + 1);
            self.emit_jump(Opcode::Jmp, offset);
            let next_pc = self.current_pc();
            self.patch_jump(skip_jump, next_pc);
        }

        self.free_reg(tag_reg);
    }

    fn emit_object_dispatch(&mut self, scope: &ControlScope) {
        for (case_tid, label_pc) in &scope.object_pattern_cases {
            if !case_tid.is_valid() {
                continue;
            }
            let type_idx = self.module.add_type_ref(*case_tid);
            let test_reg = self.alloc_reg();
            self.emit_abc(Opcode::Move, test_reg, scope.target_reg, 0);
            self.emit_abx(Opcode::Is, test_reg, type_idx);
            let skip_jump = self.current_pc();
            self.emit_asbx(Opcode::JmpF, test_reg, 0);
            self.free_reg(test_reg);

            let offset = *label_pc as i32 - (self.current_pc() as i32 + 1);
            self.emit_jump(Opcode::Jmp, offset);
            let next_pc = self.current_pc();
            self.patch_jump(skip_jump, next_pc);
        }
    }

    fn emit_value_dispatch(&mut self, scope: &ControlScope) {
        for (case_expr, label_pc) in &scope.cases {
            let case_reg = self.emit_expr(case_expr);
            self.emit_abc(Opcode::IsEq, scope.target_reg, case_reg, 0);

            let skip_jump = self.emit_jump(Opcode::Jmp, 0);
            let offset = *label_pc as i32 - (self.current_pc() as i32 + 1);
            self.emit_jump(Opcode::Jmp, offset);
            let next_pc = self.current_pc();
            self.patch_jump(skip_jump, next_pc);

            self.free_reg(case_reg);
        }
    }

    fn emit_label(&mut self, stmt: &LabelStmt) {
        let Some(scope) = self.control_stack.last() else {
            self.fail("case/default label outside of switch statement");
            return;
        };
        if scope.is_loop {
            self.fail("case/default label outside of switch statement");
            return;
        }

        let current_pc = self.current_pc();

        if stmt.kind == LabelKind::Default {
            self.control_stack
                .last_mut()
                .expect("checked above")
                .default_pc = Some(current_pc);
            return;
        }

        let is_sum = scope.is_sum_switch;
        let is_object = scope.is_object_switch;
        let target_reg = scope.target_reg;
        let sum_tid = scope.sum_type_id;

        if is_sum && stmt.is_pattern_match {
            let variant_name = stmt
                .expr
                .as_ref()
                .and_then(|e| match e {
                    Expr::Path(p) => p.last_identifier().map(|i| i.name.clone()),
                    Expr::Identifier(i) => Some(i.name.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            if variant_name.is_empty() {
                self.fail("invalid pattern case label");
                return;
            }
            self.control_stack
                .last_mut()
                .expect("checked above")
                .pattern_cases
                .push((variant_name.clone(), current_pc));

            // Payload extraction and binding at the head of the case body.
            if !stmt.bindings.is_empty() {
                let Some(def) = self.runtime.sum_def_of(sum_tid).cloned() else {
                    self.fail("pattern case on non-sum type");
                    return;
                };
                let Some(variant) = def.find_variant(&variant_name) else {
                    self.fail(format!("variant '{}' not found", variant_name));
                    return;
                };
                if variant.payload_type.is_valid() {
                    let tag = variant.tag_value as u8;
                    let payload_reg = self.alloc_reg();
                    self.emit_abc(Opcode::SumGetPayload, payload_reg, target_reg, tag);

                    if stmt.bindings.len() == 1 {
                        let var_reg = self.allocate_local(&stmt.bindings[0].name);
                        self.emit_abc(Opcode::Move, var_reg, payload_reg, 0);
                    } else {
                        // Multiple bindings destructure a tuple payload.
                        for (i, binding) in stmt.bindings.iter().enumerate() {
                            let var_reg = self.allocate_local(&binding.name);
                            self.emit_abc(Opcode::GetTuple, var_reg, payload_reg, i as u8);
                        }
                    }
                    self.free_reg(payload_reg);
                }
            }
            return;
        }

        if is_object && stmt.is_pattern_match {
            let case_tid = stmt
                .expr
                .as_ref()
                .map(|e| e.type_id())
                .unwrap_or_default();
            self.control_stack
                .last_mut()
                .expect("checked above")
                .object_pattern_cases
                .push((case_tid, current_pc));

            if stmt.bindings.len() == 1 {
                let binding = &stmt.bindings[0];
                let var_reg = self.allocate_local(&binding.name);
                self.emit_abc(Opcode::Move, var_reg, target_reg, 0);
                if binding.info.type_id.is_valid() {
                    let type_idx = self.module.add_type_ref(binding.info.type_id);
                    self.emit_abx(Opcode::Cast, var_reg, type_idx);
                }
            }
            return;
        }

        // Plain value case.
        let Some(expr) = stmt.expr.clone() else {
            self.fail("case label requires an expression");
            return;
        };
        self.control_stack
            .last_mut()
            .expect("checked above")
            .cases
            .push((expr, current_pc));
    }
}
