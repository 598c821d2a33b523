//! Script-defined operator registry.
//!
//! Scripts may overload binary arithmetic, equality/ordering, unary minus,
//! and the `str`/`hash` conversions for their own types. The compiler looks
//! operators up here and lowers matches to `CALLEXT` against the operator
//! function's interned qualified name.

use std::collections::HashMap;

use smalls_parser::ast::{BinaryOp, CmpOp, TypeId, UnaryOp};

/// Reference to a script function implementing an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFunctionRef {
    pub module_path: String,
    pub function_name: String,
}

impl ScriptFunctionRef {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module_path, self.function_name)
    }
}

/// Comparison operators scripts can register directly. `!=` is synthesized
/// from `==` plus `NOT`, and `>` from `<` with swapped arguments; `<=`/`>=`
/// stay opcodes so the VM can pick its own path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisteredCmp {
    Eq,
    Lt,
}

impl RegisteredCmp {
    pub fn from_cmp(op: CmpOp) -> Option<RegisteredCmp> {
        match op {
            CmpOp::Eq => Some(RegisteredCmp::Eq),
            CmpOp::Lt => Some(RegisteredCmp::Lt),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct OperatorRegistry {
    binary: HashMap<(BinaryOp, TypeId, TypeId), ScriptFunctionRef>,
    comparison: HashMap<(RegisteredCmp, TypeId, TypeId), ScriptFunctionRef>,
    unary: HashMap<(UnaryOp, TypeId), ScriptFunctionRef>,
    str_ops: HashMap<TypeId, ScriptFunctionRef>,
    hash_ops: HashMap<TypeId, ScriptFunctionRef>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_binary(
        &mut self,
        op: BinaryOp,
        lhs: TypeId,
        rhs: TypeId,
        func: ScriptFunctionRef,
    ) {
        self.binary.insert((op, lhs, rhs), func);
    }

    pub fn register_comparison(
        &mut self,
        op: RegisteredCmp,
        lhs: TypeId,
        rhs: TypeId,
        func: ScriptFunctionRef,
    ) {
        self.comparison.insert((op, lhs, rhs), func);
    }

    pub fn register_unary(&mut self, op: UnaryOp, operand: TypeId, func: ScriptFunctionRef) {
        self.unary.insert((op, operand), func);
    }

    pub fn register_str(&mut self, operand: TypeId, func: ScriptFunctionRef) {
        self.str_ops.insert(operand, func);
    }

    pub fn register_hash(&mut self, operand: TypeId, func: ScriptFunctionRef) {
        self.hash_ops.insert(operand, func);
    }

    pub fn find_binary(&self, op: BinaryOp, lhs: TypeId, rhs: TypeId) -> Option<&ScriptFunctionRef> {
        self.binary.get(&(op, lhs, rhs))
    }

    pub fn find_comparison(
        &self,
        op: RegisteredCmp,
        lhs: TypeId,
        rhs: TypeId,
    ) -> Option<&ScriptFunctionRef> {
        self.comparison.get(&(op, lhs, rhs))
    }

    pub fn find_unary(&self, op: UnaryOp, operand: TypeId) -> Option<&ScriptFunctionRef> {
        self.unary.get(&(op, operand))
    }

    pub fn find_str(&self, operand: TypeId) -> Option<&ScriptFunctionRef> {
        self.str_ops.get(&operand)
    }

    pub fn find_hash(&self, operand: TypeId) -> Option<&ScriptFunctionRef> {
        self.hash_ops.get(&operand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_add() -> ScriptFunctionRef {
        ScriptFunctionRef {
            module_path: "core.math".into(),
            function_name: "vec_add".into(),
        }
    }

    #[test]
    fn test_binary_lookup_is_type_pair_exact() {
        let mut ops = OperatorRegistry::new();
        let vec_tid = TypeId(9);
        let int_tid = TypeId(0);
        ops.register_binary(BinaryOp::Add, vec_tid, vec_tid, vec_add());

        assert_eq!(
            ops.find_binary(BinaryOp::Add, vec_tid, vec_tid),
            Some(&vec_add())
        );
        assert_eq!(ops.find_binary(BinaryOp::Add, vec_tid, int_tid), None);
        assert_eq!(ops.find_binary(BinaryOp::Sub, vec_tid, vec_tid), None);
    }

    #[test]
    fn test_registered_cmp_subset() {
        assert_eq!(RegisteredCmp::from_cmp(CmpOp::Eq), Some(RegisteredCmp::Eq));
        assert_eq!(RegisteredCmp::from_cmp(CmpOp::Lt), Some(RegisteredCmp::Lt));
        assert_eq!(RegisteredCmp::from_cmp(CmpOp::Le), None);
        assert_eq!(RegisteredCmp::from_cmp(CmpOp::Gt), None);
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(vec_add().qualified_name(), "core.math.vec_add");
    }
}
