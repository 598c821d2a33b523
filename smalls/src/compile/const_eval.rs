//! Compile-time constant evaluation.
//!
//! A tree walker invoked at emit time for expressions whose `is_const` flag
//! is set. Arithmetic delegates to the runtime's generic value ops; struct,
//! tuple, and sum constants are materialized on the heap (evaluation runs
//! before any user code, so the in-progress fold is the only root that
//! matters). Any unsupported shape aborts the fold and the compiler falls
//! back to normal lowering.

use smalls_parser::ast::{
    Ast, BraceInitKind, CastOp, Decl, Expr, LiteralValue, LogicalOp, TypeId,
};

use crate::runtime::types::TypeKind;
use crate::runtime::value::{Value, ValueRepr};
use crate::runtime::Runtime;

const MAX_FOLD_DEPTH: u32 = 64;

pub struct ConstEvaluator<'a> {
    ast: &'a Ast,
    runtime: &'a mut Runtime,
}

impl<'a> ConstEvaluator<'a> {
    pub fn new(ast: &'a Ast, runtime: &'a mut Runtime) -> Self {
        Self { ast, runtime }
    }

    /// Evaluate an expression to a constant value, or None when the fold
    /// fails (the caller then lowers normally).
    pub fn eval(&mut self, expr: &Expr) -> Option<Value> {
        self.eval_at(expr, 0)
    }

    fn eval_at(&mut self, expr: &Expr, depth: u32) -> Option<Value> {
        if depth > MAX_FOLD_DEPTH {
            return None;
        }
        match expr {
            Expr::Literal(lit) => Some(match &lit.value {
                LiteralValue::Int(v) => self.runtime.make_int(*v),
                LiteralValue::Float(v) => self.runtime.make_float(*v),
                LiteralValue::Bool(v) => self.runtime.make_bool(*v),
                LiteralValue::Str(s) => {
                    let s = s.clone();
                    self.runtime.make_string(&s)
                }
            }),

            Expr::Grouping(g) => self.eval_at(&g.expr, depth + 1),

            Expr::Unary(u) => {
                let operand = self.eval_at(&u.rhs, depth + 1)?;
                self.runtime.execute_unary_op(u.op, operand)
            }

            Expr::Binary(b) => {
                let lhs = self.eval_at(&b.lhs, depth + 1)?;
                let rhs = self.eval_at(&b.rhs, depth + 1)?;
                self.runtime.execute_binary_op(b.op, lhs, rhs)
            }

            Expr::Comparison(c) => {
                let lhs = self.eval_at(&c.lhs, depth + 1)?;
                let rhs = self.eval_at(&c.rhs, depth + 1)?;
                self.runtime.execute_cmp_op(c.op, lhs, rhs)
            }

            Expr::Logical(l) => {
                let lhs = self.eval_at(&l.lhs, depth + 1)?;
                let lhs_true = truthy(&lhs)?;
                match l.op {
                    LogicalOp::And if !lhs_true => Some(self.runtime.make_bool(false)),
                    LogicalOp::Or if lhs_true => Some(self.runtime.make_bool(true)),
                    _ => {
                        let rhs = self.eval_at(&l.rhs, depth + 1)?;
                        let rhs_true = truthy(&rhs)?;
                        Some(self.runtime.make_bool(rhs_true))
                    }
                }
            }

            Expr::Conditional(c) => {
                let test = self.eval_at(&c.test, depth + 1)?;
                if truthy(&test)? {
                    self.eval_at(&c.true_branch, depth + 1)
                } else {
                    self.eval_at(&c.false_branch, depth + 1)
                }
            }

            Expr::Identifier(ident) => self.eval_identifier(&ident.name, depth),

            Expr::Path(path) => {
                if path.is_variant_path {
                    return self.eval_unit_variant(expr.type_id(), path.last_identifier()?.name.as_str());
                }
                if path.parts.len() == 1 {
                    return self.eval_at(&path.parts[0], depth + 1);
                }
                // Walk struct fields off a constant base.
                let mut current = self.eval_at(&path.parts[0], depth + 1)?;
                for part in &path.parts[1..] {
                    let field_name = part.as_identifier()?.name.clone();
                    let ptr = current.heap_ptr()?;
                    let tid = self.runtime.heap.type_of(ptr);
                    let idx = self.runtime.struct_def_of(tid)?.field_index(&field_name)?;
                    current = self.runtime.read_struct_field_by_index(ptr, idx)?;
                }
                Some(current)
            }

            Expr::Index(ix) => {
                let target = self.eval_at(&ix.target, depth + 1)?;
                let index = self.eval_at(&ix.index, depth + 1)?.as_int()?;
                let ptr = target.heap_ptr()?;
                let tid = self.runtime.heap.type_of(ptr);
                match self.runtime.get_type(tid).map(|t| t.kind.clone())? {
                    TypeKind::Tuple(_) => {
                        self.runtime.read_tuple_element_by_index(ptr, index as usize)
                    }
                    _ => None,
                }
            }

            Expr::Cast(cast) => {
                let val = self.eval_at(&cast.expr, depth + 1)?;
                if cast.op != CastOp::As {
                    return None;
                }
                self.eval_cast(val, cast.target.info.type_id)
            }

            Expr::BraceInit(init) => {
                let tid = init.info.type_id;
                let kind = self.runtime.get_type(tid).map(|t| t.kind.clone())?;
                match kind {
                    TypeKind::Struct(sid) => {
                        let def = self.runtime.types.struct_def(sid)?.clone();
                        let ptr = self.runtime.alloc_struct(tid)?;
                        match init.kind {
                            BraceInitKind::Field => {
                                for item in &init.items {
                                    let name = item.key.as_ref()?.as_identifier()?.name.clone();
                                    let idx = def.field_index(&name)?;
                                    let val = self.eval_at(&item.value, depth + 1)?;
                                    self.runtime
                                        .write_struct_field_by_index(ptr, idx, val, None)
                                        .ok()?;
                                }
                            }
                            BraceInitKind::List => {
                                for (idx, item) in init.items.iter().enumerate() {
                                    let val = self.eval_at(&item.value, depth + 1)?;
                                    self.runtime
                                        .write_struct_field_by_index(ptr, idx, val, None)
                                        .ok()?;
                                }
                            }
                            BraceInitKind::KeyValue => return None,
                        }
                        Some(Value::make_heap(ptr, tid))
                    }
                    _ => None,
                }
            }

            Expr::Tuple(tuple) => {
                let tid = tuple.info.type_id;
                self.runtime.tuple_def_of(tid)?;
                let ptr = self.runtime.alloc_tuple(tid)?;
                for (idx, elem) in tuple.elements.iter().enumerate() {
                    let val = self.eval_at(elem, depth + 1)?;
                    self.runtime
                        .write_tuple_element_by_index(ptr, idx, val, None)
                        .ok()?;
                }
                Some(Value::make_heap(ptr, tid))
            }

            Expr::FString(fs) => {
                let mut out = String::new();
                for (i, part) in fs.parts.iter().enumerate() {
                    out.push_str(part);
                    if let Some(e) = fs.exprs.get(i) {
                        let val = self.eval_at(e, depth + 1)?;
                        out.push_str(&self.format_value(&val)?);
                    }
                }
                Some(self.runtime.make_string(&out))
            }

            Expr::Call(call) => {
                // Sum-variant construction is the only foldable call form.
                let Expr::Path(path) = call.callee.as_ref() else {
                    return None;
                };
                if !path.is_variant_path || call.args.len() != 1 {
                    return None;
                }
                let variant = path.last_identifier()?.name.clone();
                let payload = self.eval_at(&call.args[0], depth + 1)?;
                self.eval_payload_variant(call.info.type_id, &variant, payload)
            }

            _ => None,
        }
    }

    /// Follow a name to the initializer of a const declaration, locally or
    /// in a dependency module's AST.
    fn eval_identifier(&mut self, name: &str, depth: u32) -> Option<Value> {
        for decl in &self.ast.decls {
            match decl {
                Decl::Var(var) if var.name == name => {
                    if !var.info.is_const {
                        return None;
                    }
                    return self.eval_at(var.init.as_ref()?, depth + 1);
                }
                Decl::VarList(list) => {
                    if let Some(var) = list.decls.iter().find(|d| d.name == name) {
                        if !var.info.is_const {
                            return None;
                        }
                        return self.eval_at(var.init.as_ref()?, depth + 1);
                    }
                }
                Decl::ImportSelective(import) => {
                    if import.symbols.iter().any(|s| s == name) {
                        let module = self.runtime.get_module(&import.module_path)?;
                        let dep_ast = self.runtime.module_ast(module)?;
                        let mut dep_eval = ConstEvaluator::new(&dep_ast, self.runtime);
                        return dep_eval.eval_identifier(name, depth + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn eval_cast(&mut self, val: Value, target: TypeId) -> Option<Value> {
        if val.type_id == target {
            return Some(val);
        }
        if target == self.runtime.float_type() {
            if let Some(i) = val.as_int() {
                return Some(self.runtime.make_float(i as f32));
            }
        }
        if target == self.runtime.int_type() {
            if let Some(f) = val.as_float() {
                return Some(self.runtime.make_int(f as i32));
            }
        }
        // Newtype wrap/unwrap keeps the representation.
        let target_kind = self.runtime.get_type(target).map(|t| t.kind.clone())?;
        if let TypeKind::Newtype { wrapped } = target_kind {
            if val.type_id == wrapped {
                return Some(Value {
                    type_id: target,
                    repr: val.repr,
                });
            }
        }
        let source_kind = self.runtime.get_type(val.type_id).map(|t| t.kind.clone())?;
        if let TypeKind::Newtype { wrapped } = source_kind {
            if wrapped == target {
                return Some(Value {
                    type_id: target,
                    repr: val.repr,
                });
            }
        }
        None
    }

    fn eval_unit_variant(&mut self, sum_tid: TypeId, variant: &str) -> Option<Value> {
        let def = self.runtime.sum_def_of(sum_tid)?.clone();
        let v = def.find_variant(variant)?;
        if v.payload_type.is_valid() {
            return None;
        }
        let tag = v.tag_value;
        let ptr = self.runtime.alloc_sum(sum_tid)?;
        let bytes = self.runtime.heap.get_bytes_mut(ptr)?;
        Runtime::write_sum_tag(bytes, &def, tag);
        Some(Value::make_heap(ptr, sum_tid))
    }

    fn eval_payload_variant(
        &mut self,
        sum_tid: TypeId,
        variant: &str,
        payload: Value,
    ) -> Option<Value> {
        let def = self.runtime.sum_def_of(sum_tid)?.clone();
        let v = def.find_variant(variant)?.clone();
        if !v.payload_type.is_valid() {
            return None;
        }
        let ptr = self.runtime.alloc_sum(sum_tid)?;
        let write = self
            .runtime
            .prepare_slot_write(v.payload_type, payload, None)
            .ok()?;
        let bytes = self.runtime.heap.get_bytes_mut(ptr)?;
        Runtime::write_sum_tag(bytes, &def, v.tag_value);
        crate::runtime::apply_slot_write(bytes, v.payload_offset, &write);
        Some(Value::make_heap(ptr, sum_tid))
    }

    fn format_value(&self, val: &Value) -> Option<String> {
        match val.repr {
            ValueRepr::Int(v) => Some(v.to_string()),
            ValueRepr::Float(v) => Some(format!("{}", v)),
            ValueRepr::Bool(v) => Some(v.to_string()),
            ValueRepr::Heap(ptr) if val.type_id == self.runtime.string_type() => {
                Some(self.runtime.get_string_view(ptr).to_string())
            }
            _ => None,
        }
    }
}

/// Truthiness of a folded constant: bool, int, or float.
pub fn truthy(val: &Value) -> Option<bool> {
    match val.repr {
        ValueRepr::Bool(b) => Some(b),
        ValueRepr::Int(v) => Some(v != 0),
        ValueRepr::Float(v) => Some(v != 0.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smalls_parser::ast::BinaryOp;
    use smalls_parser::builders as b;

    fn eval_in(rt: &mut Runtime, expr: &Expr) -> Option<Value> {
        let ast = Ast::new();
        ConstEvaluator::new(&ast, rt).eval(expr)
    }

    #[test]
    fn test_fold_arithmetic() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let expr = b::binary(
            BinaryOp::Add,
            b::lit_int(40, int),
            b::lit_int(2, int),
            int,
        );
        assert_eq!(eval_in(&mut rt, &expr).unwrap().as_int(), Some(42));
    }

    #[test]
    fn test_fold_division_by_zero_fails() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let expr = b::binary(BinaryOp::Div, b::lit_int(1, int), b::lit_int(0, int), int);
        assert!(eval_in(&mut rt, &expr).is_none());
    }

    #[test]
    fn test_fold_logical_short_circuit() {
        let mut rt = Runtime::new();
        let boolean = rt.bool_type();
        let int = rt.int_type();
        // false && (1/0) folds to false without evaluating the bad side.
        let bad = b::binary(BinaryOp::Div, b::lit_int(1, int), b::lit_int(0, int), int);
        let expr = b::logical(
            smalls_parser::ast::LogicalOp::And,
            b::lit_bool(false, boolean),
            bad,
            boolean,
        );
        assert_eq!(eval_in(&mut rt, &expr).unwrap().as_bool(), Some(false));
    }

    #[test]
    fn test_fold_conditional() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let boolean = rt.bool_type();
        let expr = b::conditional(
            b::lit_bool(true, boolean),
            b::lit_int(1, int),
            b::lit_int(2, int),
            int,
        );
        assert_eq!(eval_in(&mut rt, &expr).unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_fold_const_identifier() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let mut ast = Ast::new();
        ast.decls.push(Decl::Var(b::const_decl(
            "K",
            int,
            b::binary(BinaryOp::Mul, b::lit_int(6, int), b::lit_int(7, int), int),
        )));
        let expr = b::mark_const(b::ident("K", int));
        let val = ConstEvaluator::new(&ast, &mut rt).eval(&expr).unwrap();
        assert_eq!(val.as_int(), Some(42));
    }

    #[test]
    fn test_fold_struct_init_and_field_path() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let tid = rt
            .types
            .register_struct_type("P", &[("x".to_string(), int), ("y".to_string(), int)], false);
        let init = b::brace_field_init(
            tid,
            vec![("x", b::lit_int(3, int)), ("y", b::lit_int(4, int))],
        );
        let expr = b::path(vec![init, b::ident("y", int)], int);
        assert_eq!(eval_in(&mut rt, &expr).unwrap().as_int(), Some(4));
    }

    #[test]
    fn test_fold_fstring() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let string = rt.string_type();
        let expr = b::fstring(
            vec!["n = ", "!"],
            vec![b::binary(
                BinaryOp::Add,
                b::lit_int(1, int),
                b::lit_int(2, int),
                int,
            )],
            string,
        );
        let val = eval_in(&mut rt, &expr).unwrap();
        assert_eq!(rt.get_string_view(val.heap_ptr().unwrap()), "n = 3!");
    }

    #[test]
    fn test_fold_newtype_cast() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let feat = rt.types.register_newtype("Feat", int);
        let expr = b::cast(b::lit_int(12, int), feat, feat);
        let val = eval_in(&mut rt, &expr).unwrap();
        assert_eq!(val.type_id, feat);
        assert_eq!(val.as_int(), Some(12));
    }

    #[test]
    fn test_fold_sum_variant() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let sum = rt.types.register_sum_type(
            "R",
            &[("Ok".to_string(), int), ("Empty".to_string(), TypeId::INVALID)],
            false,
        );
        let expr = b::variant_call("R", "Ok", b::lit_int(9, int), sum);
        let val = eval_in(&mut rt, &expr).unwrap();
        let bytes = rt.heap.get_bytes(val.heap_ptr().unwrap()).unwrap().clone();
        let def = rt.sum_def_of(sum).unwrap().clone();
        assert_eq!(Runtime::read_sum_tag(&bytes, &def), 0);
    }

    #[test]
    fn test_unsupported_shape_fails_fold() {
        let mut rt = Runtime::new();
        let int = rt.int_type();
        let expr = b::call_local("f", vec![], int);
        assert!(eval_in(&mut rt, &expr).is_none());
    }
}
