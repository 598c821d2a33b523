//! Resolved-AST construction helpers for test code.
//!
//! The bytecode compiler consumes ASTs whose resolution slots are already
//! populated. These helpers build such trees directly, standing in for the
//! resolver in integration tests.

use crate::ast::*;
use crate::intrinsics::IntrinsicId;

fn info(type_id: TypeId) -> NodeInfo {
    NodeInfo {
        type_id,
        is_const: false,
        span: Default::default(),
    }
}

pub fn lit_int(value: i32, int_tid: TypeId) -> Expr {
    Expr::Literal(LiteralExpr {
        info: NodeInfo {
            is_const: true,
            ..info(int_tid)
        },
        value: LiteralValue::Int(value),
    })
}

pub fn lit_float(value: f32, float_tid: TypeId) -> Expr {
    Expr::Literal(LiteralExpr {
        info: NodeInfo {
            is_const: true,
            ..info(float_tid)
        },
        value: LiteralValue::Float(value),
    })
}

pub fn lit_bool(value: bool, bool_tid: TypeId) -> Expr {
    Expr::Literal(LiteralExpr {
        info: NodeInfo {
            is_const: true,
            ..info(bool_tid)
        },
        value: LiteralValue::Bool(value),
    })
}

pub fn lit_str(value: &str, string_tid: TypeId) -> Expr {
    Expr::Literal(LiteralExpr {
        info: NodeInfo {
            is_const: true,
            ..info(string_tid)
        },
        value: LiteralValue::Str(value.to_string()),
    })
}

pub fn ident(name: &str, type_id: TypeId) -> Expr {
    Expr::Identifier(IdentifierExpr {
        info: info(type_id),
        name: name.to_string(),
    })
}

/// `base.field` or longer chains; `type_id` is the type of the full path.
pub fn path(parts: Vec<Expr>, type_id: TypeId) -> Expr {
    Expr::Path(PathExpr {
        info: info(type_id),
        parts,
        is_variant_path: false,
    })
}

/// `Sum::Variant` as a value (unit variants).
pub fn variant_path(sum_name: &str, variant: &str, sum_tid: TypeId) -> Expr {
    Expr::Path(PathExpr {
        info: info(sum_tid),
        parts: vec![ident(sum_name, TypeId::INVALID), ident(variant, TypeId::INVALID)],
        is_variant_path: true,
    })
}

/// `Sum::Variant(payload)` constructor call.
pub fn variant_call(sum_name: &str, variant: &str, payload: Expr, sum_tid: TypeId) -> Expr {
    Expr::Call(CallExpr {
        info: info(sum_tid),
        callee: Box::new(variant_path(sum_name, variant, sum_tid)),
        args: vec![payload],
        type_args: Vec::new(),
        inferred_type_args: Vec::new(),
        intrinsic: None,
        resolved_func: None,
        resolved_provider: None,
        newtype_target: TypeId::INVALID,
    })
}

pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, type_id: TypeId) -> Expr {
    Expr::Binary(BinaryExpr {
        info: info(type_id),
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr, bool_tid: TypeId) -> Expr {
    Expr::Comparison(ComparisonExpr {
        info: info(bool_tid),
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn logical(op: LogicalOp, lhs: Expr, rhs: Expr, bool_tid: TypeId) -> Expr {
    Expr::Logical(LogicalExpr {
        info: info(bool_tid),
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn unary(op: UnaryOp, rhs: Expr, type_id: TypeId) -> Expr {
    Expr::Unary(UnaryExpr {
        info: info(type_id),
        op,
        rhs: Box::new(rhs),
    })
}

pub fn conditional(test: Expr, true_branch: Expr, false_branch: Expr, type_id: TypeId) -> Expr {
    Expr::Conditional(ConditionalExpr {
        info: info(type_id),
        test: Box::new(test),
        true_branch: Box::new(true_branch),
        false_branch: Box::new(false_branch),
    })
}

pub fn assign(lhs: Expr, rhs: Expr) -> Expr {
    assign_op(AssignOp::Assign, lhs, rhs)
}

pub fn assign_op(op: AssignOp, lhs: Expr, rhs: Expr) -> Expr {
    let type_id = rhs.type_id();
    Expr::Assign(AssignExpr {
        info: info(type_id),
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

/// Direct call to a function in the same module.
pub fn call_local(name: &str, args: Vec<Expr>, return_tid: TypeId) -> Expr {
    Expr::Call(CallExpr {
        info: info(return_tid),
        callee: Box::new(ident(name, TypeId::INVALID)),
        args,
        type_args: Vec::new(),
        inferred_type_args: Vec::new(),
        intrinsic: None,
        resolved_func: Some(name.to_string()),
        resolved_provider: None,
        newtype_target: TypeId::INVALID,
    })
}

/// Cross-module call: `provider.name(args)`.
pub fn call_external(provider: &str, name: &str, args: Vec<Expr>, return_tid: TypeId) -> Expr {
    Expr::Call(CallExpr {
        info: info(return_tid),
        callee: Box::new(ident(name, TypeId::INVALID)),
        args,
        type_args: Vec::new(),
        inferred_type_args: Vec::new(),
        intrinsic: None,
        resolved_func: None,
        resolved_provider: Some(provider.to_string()),
        newtype_target: TypeId::INVALID,
    })
}

/// Call through a function-typed value (local, upvalue, or expression).
pub fn call_value(callee: Expr, args: Vec<Expr>, return_tid: TypeId) -> Expr {
    Expr::Call(CallExpr {
        info: info(return_tid),
        callee: Box::new(callee),
        args,
        type_args: Vec::new(),
        inferred_type_args: Vec::new(),
        intrinsic: None,
        resolved_func: None,
        resolved_provider: None,
        newtype_target: TypeId::INVALID,
    })
}

pub fn call_intrinsic(id: IntrinsicId, args: Vec<Expr>, return_tid: TypeId) -> Expr {
    Expr::Call(CallExpr {
        info: info(return_tid),
        callee: Box::new(ident(crate::intrinsics::intrinsic_name(id), TypeId::INVALID)),
        args,
        type_args: Vec::new(),
        inferred_type_args: Vec::new(),
        intrinsic: Some(id),
        resolved_func: None,
        resolved_provider: None,
        newtype_target: TypeId::INVALID,
    })
}

/// Call to a generic function with inferred type arguments.
pub fn call_generic(
    name: &str,
    args: Vec<Expr>,
    type_args: Vec<TypeId>,
    return_tid: TypeId,
) -> Expr {
    Expr::Call(CallExpr {
        info: info(return_tid),
        callee: Box::new(ident(name, TypeId::INVALID)),
        args,
        type_args: Vec::new(),
        inferred_type_args: type_args,
        intrinsic: None,
        resolved_func: Some(name.to_string()),
        resolved_provider: None,
        newtype_target: TypeId::INVALID,
    })
}

/// Newtype constructor call, e.g. `Feat(x)`.
pub fn newtype_call(name: &str, arg: Expr, newtype_tid: TypeId) -> Expr {
    Expr::Call(CallExpr {
        info: info(newtype_tid),
        callee: Box::new(ident(name, TypeId::INVALID)),
        args: vec![arg],
        type_args: Vec::new(),
        inferred_type_args: Vec::new(),
        intrinsic: None,
        resolved_func: None,
        resolved_provider: None,
        newtype_target: newtype_tid,
    })
}

pub fn index(target: Expr, idx: Expr, type_id: TypeId) -> Expr {
    Expr::Index(IndexExpr {
        info: info(type_id),
        target: Box::new(target),
        index: Box::new(idx),
    })
}

pub fn cast(expr: Expr, target_tid: TypeId, result_tid: TypeId) -> Expr {
    Expr::Cast(CastExpr {
        info: info(result_tid),
        expr: Box::new(expr),
        op: CastOp::As,
        target: type_ref(target_tid),
    })
}

pub fn is_type(expr: Expr, target_tid: TypeId, bool_tid: TypeId) -> Expr {
    Expr::Cast(CastExpr {
        info: info(bool_tid),
        expr: Box::new(expr),
        op: CastOp::Is,
        target: type_ref(target_tid),
    })
}

/// A type expression resolved to a concrete runtime type.
pub fn type_ref(type_id: TypeId) -> TypeExpr {
    TypeExpr {
        info: info(type_id),
        name: String::new(),
        params: Vec::new(),
        fixed_size: None,
        is_function: false,
        return_type: None,
    }
}

pub fn brace_field_init(type_id: TypeId, fields: Vec<(&str, Expr)>) -> Expr {
    Expr::BraceInit(BraceInitExpr {
        info: info(type_id),
        ty: Some(type_ref(type_id)),
        kind: BraceInitKind::Field,
        items: fields
            .into_iter()
            .map(|(name, value)| BraceInitItem {
                key: Some(ident(name, TypeId::INVALID)),
                value,
            })
            .collect(),
    })
}

pub fn brace_list_init(type_id: TypeId, values: Vec<Expr>) -> Expr {
    Expr::BraceInit(BraceInitExpr {
        info: info(type_id),
        ty: Some(type_ref(type_id)),
        kind: BraceInitKind::List,
        items: values
            .into_iter()
            .map(|value| BraceInitItem { key: None, value })
            .collect(),
    })
}

pub fn brace_map_init(type_id: TypeId, entries: Vec<(Expr, Expr)>) -> Expr {
    Expr::BraceInit(BraceInitExpr {
        info: info(type_id),
        ty: Some(type_ref(type_id)),
        kind: BraceInitKind::KeyValue,
        items: entries
            .into_iter()
            .map(|(key, value)| BraceInitItem {
                key: Some(key),
                value,
            })
            .collect(),
    })
}

pub fn tuple(elements: Vec<Expr>, tuple_tid: TypeId) -> Expr {
    Expr::Tuple(TupleExpr {
        info: info(tuple_tid),
        elements,
    })
}

pub fn fstring(parts: Vec<&str>, exprs: Vec<Expr>, string_tid: TypeId) -> Expr {
    Expr::FString(FStringExpr {
        info: info(string_tid),
        parts: parts.into_iter().map(str::to_string).collect(),
        exprs,
    })
}

pub fn lambda(
    params: Vec<VarDecl>,
    return_tid: TypeId,
    body: Block,
    captures: Vec<CapturedVar>,
    function_tid: TypeId,
) -> Expr {
    Expr::Lambda(LambdaExpr {
        info: info(function_tid),
        params,
        return_type: Some(type_ref(return_tid)),
        body,
        captures,
    })
}

pub fn capture(name: &str, type_id: TypeId) -> CapturedVar {
    CapturedVar {
        name: name.to_string(),
        type_id,
        is_upvalue_in_parent: false,
    }
}

/// Mark any expression as compile-time constant.
pub fn mark_const(mut expr: Expr) -> Expr {
    expr.info_mut().is_const = true;
    expr
}

// ---- statements ------------------------------------------------------------

pub fn block(nodes: Vec<Stmt>) -> Block {
    Block {
        info: NodeInfo::default(),
        nodes,
    }
}

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::Expr(ExprStmt {
        info: NodeInfo::default(),
        expr,
    })
}

pub fn ret(expr: Expr) -> Stmt {
    Stmt::Jump(JumpStmt {
        info: NodeInfo::default(),
        kind: JumpKind::Return,
        exprs: vec![expr],
    })
}

pub fn ret_many(exprs: Vec<Expr>) -> Stmt {
    Stmt::Jump(JumpStmt {
        info: NodeInfo::default(),
        kind: JumpKind::Return,
        exprs,
    })
}

pub fn ret_void() -> Stmt {
    Stmt::Jump(JumpStmt {
        info: NodeInfo::default(),
        kind: JumpKind::Return,
        exprs: Vec::new(),
    })
}

pub fn brk() -> Stmt {
    Stmt::Jump(JumpStmt {
        info: NodeInfo::default(),
        kind: JumpKind::Break,
        exprs: Vec::new(),
    })
}

pub fn cont() -> Stmt {
    Stmt::Jump(JumpStmt {
        info: NodeInfo::default(),
        kind: JumpKind::Continue,
        exprs: Vec::new(),
    })
}

pub fn if_stmt(cond: Expr, then_block: Block, else_block: Option<Block>) -> Stmt {
    Stmt::If(IfStmt {
        info: NodeInfo::default(),
        cond,
        then_block,
        else_block,
    })
}

pub fn for_stmt(init: Option<Stmt>, check: Option<Expr>, inc: Option<Expr>, body: Block) -> Stmt {
    Stmt::For(ForStmt {
        info: NodeInfo::default(),
        init: init.map(Box::new),
        check,
        inc,
        block: body,
    })
}

pub fn foreach_array(var: VarDecl, element_type: TypeId, collection: Expr, body: Block) -> Stmt {
    Stmt::ForEach(ForEachStmt {
        info: NodeInfo::default(),
        var: Some(var),
        key_var: None,
        value_var: None,
        collection,
        block: body,
        is_map_iteration: false,
        element_type,
        key_type: TypeId::INVALID,
        value_type: TypeId::INVALID,
    })
}

pub fn foreach_map(
    key_var: VarDecl,
    value_var: VarDecl,
    key_type: TypeId,
    value_type: TypeId,
    collection: Expr,
    body: Block,
) -> Stmt {
    Stmt::ForEach(ForEachStmt {
        info: NodeInfo::default(),
        var: None,
        key_var: Some(key_var),
        value_var: Some(value_var),
        collection,
        block: body,
        is_map_iteration: true,
        element_type: TypeId::INVALID,
        key_type,
        value_type,
    })
}

pub fn switch(target: Expr, body: Block) -> Stmt {
    Stmt::Switch(SwitchStmt {
        info: NodeInfo::default(),
        target,
        block: body,
    })
}

pub fn case_value(expr: Expr) -> Stmt {
    Stmt::Label(LabelStmt {
        info: NodeInfo::default(),
        kind: LabelKind::Case,
        expr: Some(expr),
        bindings: Vec::new(),
        is_pattern_match: false,
    })
}

/// `case Sum::Variant(bindings…):`
pub fn case_pattern(sum_name: &str, variant: &str, bindings: Vec<VarDecl>) -> Stmt {
    Stmt::Label(LabelStmt {
        info: NodeInfo::default(),
        kind: LabelKind::Case,
        expr: Some(path(
            vec![
                ident(sum_name, TypeId::INVALID),
                ident(variant, TypeId::INVALID),
            ],
            TypeId::INVALID,
        )),
        bindings,
        is_pattern_match: true,
    })
}

pub fn case_default() -> Stmt {
    Stmt::Label(LabelStmt {
        info: NodeInfo::default(),
        kind: LabelKind::Default,
        expr: None,
        bindings: Vec::new(),
        is_pattern_match: false,
    })
}

// ---- declarations ----------------------------------------------------------

pub fn var_decl(name: &str, type_id: TypeId, init: Option<Expr>) -> VarDecl {
    VarDecl {
        info: info(type_id),
        name: name.to_string(),
        ty: None,
        init,
        annotations: Vec::new(),
    }
}

pub fn const_decl(name: &str, type_id: TypeId, init: Expr) -> VarDecl {
    VarDecl {
        info: NodeInfo {
            is_const: true,
            ..info(type_id)
        },
        name: name.to_string(),
        ty: None,
        init: Some(init),
        annotations: Vec::new(),
    }
}

pub fn param(name: &str, type_id: TypeId) -> VarDecl {
    var_decl(name, type_id, None)
}

pub fn param_default(name: &str, type_id: TypeId, default: Expr) -> VarDecl {
    var_decl(name, type_id, Some(default))
}

pub fn function(name: &str, params: Vec<VarDecl>, return_tid: TypeId, body: Block) -> FunctionDef {
    FunctionDef {
        info: info(return_tid),
        name: name.to_string(),
        params,
        return_type: Some(type_ref(return_tid)),
        block: Some(body),
        type_params: Vec::new(),
        annotations: Vec::new(),
    }
}

pub fn generic_function(
    name: &str,
    type_params: Vec<&str>,
    params: Vec<VarDecl>,
    return_tid: TypeId,
    body: Block,
) -> FunctionDef {
    FunctionDef {
        info: info(return_tid),
        name: name.to_string(),
        params,
        return_type: Some(type_ref(return_tid)),
        block: Some(body),
        type_params: type_params.into_iter().map(str::to_string).collect(),
        annotations: Vec::new(),
    }
}
