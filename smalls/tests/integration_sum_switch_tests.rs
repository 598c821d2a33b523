//! Sum types: construction, tag/payload round trips, and switch dispatch.

mod common;

use common::{single_function_ast, Harness};
use pretty_assertions::assert_eq;
use smalls::TypeId;
use smalls_parser::ast::{Decl, Stmt};
use smalls_parser::builders as b;

fn result_sum(h: &mut Harness) -> TypeId {
    let int = h.int();
    let string = h.string();
    h.rt.types.register_sum_type(
        "R",
        &[("Ok".to_string(), int), ("Err".to_string(), string)],
        false,
    )
}

#[test]
fn test_sum_payload_round_trip() {
    let mut h = Harness::new();
    let int = h.int();
    let sum = result_sum(&mut h);

    // fn main(): int { var r = R::Ok(42); switch r { case Ok(x): return x;
    // case Err(e): return -1; } }
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "r",
                sum,
                Some(b::variant_call("R", "Ok", b::lit_int(42, int), sum)),
            ))),
            b::switch(
                b::ident("r", sum),
                b::block(vec![
                    b::case_pattern("R", "Ok", vec![b::var_decl("x", int, None)]),
                    b::ret(b::ident("x", int)),
                    b::case_pattern("R", "Err", vec![b::var_decl("e", h.string(), None)]),
                    b::ret(b::lit_int(-1, int)),
                ]),
            ),
            b::ret(b::lit_int(-2, int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 42);
}

#[test]
fn test_switch_selects_err_arm() {
    let mut h = Harness::new();
    let int = h.int();
    let string = h.string();
    let sum = result_sum(&mut h);

    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "r",
                sum,
                Some(b::variant_call(
                    "R",
                    "Err",
                    b::lit_str("boom", string),
                    sum,
                )),
            ))),
            b::switch(
                b::ident("r", sum),
                b::block(vec![
                    b::case_pattern("R", "Ok", vec![b::var_decl("x", int, None)]),
                    b::ret(b::ident("x", int)),
                    b::case_pattern("R", "Err", vec![b::var_decl("e", string, None)]),
                    b::ret(b::lit_int(-1, int)),
                ]),
            ),
            b::ret(b::lit_int(-2, int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), -1);
}

#[test]
fn test_unit_variant_dispatch() {
    let mut h = Harness::new();
    let int = h.int();
    let sum = h.rt.types.register_sum_type(
        "State",
        &[
            ("Idle".to_string(), TypeId::INVALID),
            ("Running".to_string(), int),
        ],
        false,
    );

    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "s",
                sum,
                Some(b::variant_path("State", "Idle", sum)),
            ))),
            b::switch(
                b::ident("s", sum),
                b::block(vec![
                    b::case_pattern("State", "Idle", vec![]),
                    b::ret(b::lit_int(10, int)),
                    b::case_pattern("State", "Running", vec![b::var_decl("n", int, None)]),
                    b::ret(b::ident("n", int)),
                ]),
            ),
            b::ret(b::lit_int(-1, int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 10);
}

#[test]
fn test_sum_returned_across_calls() {
    let mut h = Harness::new();
    let int = h.int();
    let sum = result_sum(&mut h);

    let mut ast = single_function_ast(
        "make",
        vec![],
        sum,
        b::block(vec![b::ret(b::variant_call(
            "R",
            "Ok",
            b::lit_int(7, int),
            sum,
        ))]),
    );
    ast.decls.push(Decl::Function(b::function(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "r",
                sum,
                Some(b::call_local("make", vec![], sum)),
            ))),
            b::switch(
                b::ident("r", sum),
                b::block(vec![
                    b::case_pattern("R", "Ok", vec![b::var_decl("x", int, None)]),
                    b::ret(b::ident("x", int)),
                    b::case_default(),
                    b::ret(b::lit_int(-1, int)),
                ]),
            ),
            b::ret(b::lit_int(-2, int)),
        ]),
    )));
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 7);
}

#[test]
fn test_value_switch_with_default() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "classify",
        vec![b::param("n", int)],
        int,
        b::block(vec![
            b::switch(
                b::ident("n", int),
                b::block(vec![
                    b::case_value(b::lit_int(1, int)),
                    b::ret(b::lit_int(100, int)),
                    b::case_value(b::lit_int(2, int)),
                    b::ret(b::lit_int(200, int)),
                    b::case_default(),
                    b::ret(b::lit_int(0, int)),
                ]),
            ),
            b::ret(b::lit_int(-1, int)),
        ]),
    );
    let module = h.compile("m", ast);
    let one = h.rt.make_int(1);
    let two = h.rt.make_int(2);
    let nine = h.rt.make_int(9);
    assert_eq!(h.run_int(module, "classify", &[one]), 100);
    assert_eq!(h.run_int(module, "classify", &[two]), 200);
    assert_eq!(h.run_int(module, "classify", &[nine]), 0);
}

#[test]
fn test_switch_case_body_without_return_breaks() {
    let mut h = Harness::new();
    let int = h.int();
    // Case bodies that do not return fall to the statement after the switch
    // rather than into the next case.
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "x",
                int,
                Some(b::lit_int(0, int)),
            ))),
            b::switch(
                b::lit_int(1, int),
                b::block(vec![
                    b::case_value(b::lit_int(1, int)),
                    b::expr_stmt(b::assign(b::ident("x", int), b::lit_int(10, int))),
                    b::case_value(b::lit_int(2, int)),
                    b::expr_stmt(b::assign(b::ident("x", int), b::lit_int(20, int))),
                ]),
            ),
            b::ret(b::ident("x", int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 10);
}

#[test]
fn test_object_subtype_switch() {
    use smalls_parser::ast::{LabelKind, LabelStmt, NodeInfo};

    let mut h = Harness::new();
    let int = h.int();
    let object = h.rt.object_type();
    let creature = h.rt.types.register_object_subtype("Creature", 5);
    let item = h.rt.types.register_object_subtype("Item", 6);

    let case_label = |tid: TypeId, binding: &str| {
        Stmt::Label(LabelStmt {
            info: NodeInfo::default(),
            kind: LabelKind::Case,
            expr: Some(b::ident("unused", tid)),
            bindings: vec![b::var_decl(binding, tid, None)],
            is_pattern_match: true,
        })
    };

    let ast = single_function_ast(
        "kind",
        vec![b::param("obj", object)],
        int,
        b::block(vec![
            b::switch(
                b::ident("obj", object),
                b::block(vec![
                    case_label(creature, "c"),
                    b::ret(b::lit_int(1, int)),
                    case_label(item, "i"),
                    b::ret(b::lit_int(2, int)),
                    b::case_default(),
                    b::ret(b::lit_int(0, int)),
                ]),
            ),
            b::ret(b::lit_int(-1, int)),
        ]),
    );
    let module = h.compile("m", ast);

    let creature_val = smalls::Value::make_object(smalls::ObjectHandle::new(5, 77), object);
    let item_val = smalls::Value::make_object(smalls::ObjectHandle::new(6, 78), object);
    let other_val = smalls::Value::make_object(smalls::ObjectHandle::new(9, 79), object);
    assert_eq!(h.run_int(module, "kind", &[creature_val]), 1);
    assert_eq!(h.run_int(module, "kind", &[item_val]), 2);
    assert_eq!(h.run_int(module, "kind", &[other_val]), 0);
}

#[test]
fn test_value_type_sum_lives_on_frame_stack() {
    let mut h = Harness::new();
    let int = h.int();
    let sum = h
        .rt
        .types
        .register_sum_type("Opt", &[("Some".to_string(), int), ("None".to_string(), TypeId::INVALID)], true);
    assert!(h.rt.is_value_type(sum));

    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "o",
                sum,
                Some(b::variant_call("Opt", "Some", b::lit_int(5, int), sum)),
            ))),
            b::switch(
                b::ident("o", sum),
                b::block(vec![
                    b::case_pattern("Opt", "Some", vec![b::var_decl("v", int, None)]),
                    b::ret(b::ident("v", int)),
                    b::case_default(),
                    b::ret(b::lit_int(-1, int)),
                ]),
            ),
            b::ret(b::lit_int(-2, int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 5);
    // The value-type sum was stack-allocated, not heap-allocated.
    let main = h.rt.module(module).get_function("main").unwrap().clone();
    assert!(main
        .instructions
        .iter()
        .any(|i| matches!(i.opcode(), Some(smalls::Opcode::StackAlloc))));
    assert!(main
        .instructions
        .iter()
        .all(|i| !matches!(i.opcode(), Some(smalls::Opcode::NewSum))));
}
