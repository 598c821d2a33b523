//! Closures and upvalues: capture, closing, sharing, and closure calls.

mod common;

use common::{single_function_ast, Harness};
use pretty_assertions::assert_eq;
use smalls_parser::ast::{BinaryOp, CmpOp, Decl, Stmt};
use smalls_parser::builders as b;

#[test]
fn test_lambda_called_through_local() {
    let mut h = Harness::new();
    let int = h.int();
    let fn_tid = h.rt.types.register_function_type(&[int], int);

    // var double = fn(x: int): int { return x * 2; }; return double(21);
    let lambda = b::lambda(
        vec![b::param("x", int)],
        int,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Mul,
            b::ident("x", int),
            b::lit_int(2, int),
            int,
        ))]),
        vec![],
        fn_tid,
    );
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl("double", fn_tid, Some(lambda)))),
            b::ret(b::call_value(
                b::ident("double", fn_tid),
                vec![b::lit_int(21, int)],
                int,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 42);
}

#[test]
fn test_closure_reads_and_writes_captured_slot_after_close() {
    let mut h = Harness::new();
    let int = h.int();
    let void = h.void();
    let getter_tid = h.rt.types.register_function_type(&[], int);
    let bumper_tid = h.rt.types.register_function_type(&[], void);
    let pair_tid = h.rt.types.register_tuple_type(&[getter_tid, bumper_tid]);

    // fn make(): (fn(): int, fn(): void) {
    //   var x = 10;
    //   var get = fn(): int { return x; };
    //   var bump = fn(): void { x = x + 1; };
    //   return get, bump;
    // }
    let get_lambda = b::lambda(
        vec![],
        int,
        b::block(vec![b::ret(b::ident("x", int))]),
        vec![b::capture("x", int)],
        getter_tid,
    );
    let bump_lambda = b::lambda(
        vec![],
        void,
        b::block(vec![b::expr_stmt(b::assign(
            b::ident("x", int),
            b::binary(BinaryOp::Add, b::ident("x", int), b::lit_int(1, int), int),
        ))]),
        vec![b::capture("x", int)],
        bumper_tid,
    );
    let ast = single_function_ast(
        "make",
        vec![],
        pair_tid,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl("x", int, Some(b::lit_int(10, int))))),
            Stmt::Decl(Decl::Var(b::var_decl("get", getter_tid, Some(get_lambda)))),
            Stmt::Decl(Decl::Var(b::var_decl("bump", bumper_tid, Some(bump_lambda)))),
            b::ret_many(vec![
                b::ident("get", getter_tid),
                b::ident("bump", bumper_tid),
            ]),
        ]),
    );
    let module = h.compile("m", ast);
    let pair = h.run(module, "make", &[]);
    let pair_ptr = pair.heap_ptr().expect("tuple result");

    let get = h.rt.read_tuple_element_by_index(pair_ptr, 0).unwrap();
    let bump = h.rt.read_tuple_element_by_index(pair_ptr, 1).unwrap();
    let get_ptr = get.heap_ptr().expect("getter closure");
    let bump_ptr = bump.heap_ptr().expect("bumper closure");

    // The enclosing frame is gone; the upvalue is closed but shared.
    let first = h.vm.execute_closure(&mut h.rt, get_ptr, &[], 0);
    assert_eq!(first.as_int(), Some(10));

    h.vm.execute_closure(&mut h.rt, bump_ptr, &[], 0);
    h.vm.execute_closure(&mut h.rt, bump_ptr, &[], 0);
    let after = h.vm.execute_closure(&mut h.rt, get_ptr, &[], 0);
    assert!(!h.vm.failed(), "{}", h.vm.error_message());
    assert_eq!(after.as_int(), Some(12), "both closures share one cell");
}

#[test]
fn test_closures_over_loop_variable_capture_per_iteration() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    let fn_tid = h.rt.types.register_function_type(&[], int);
    let arr_tid = h.rt.types.register_array_type(fn_tid);

    // var closures = {}; for (var i = 0; i < 3; i = i + 1) {
    //   array_push(closures, fn(): int { return i; });
    // } return closures;
    let lambda = b::lambda(
        vec![],
        int,
        b::block(vec![b::ret(b::ident("i", int))]),
        vec![b::capture("i", int)],
        fn_tid,
    );
    let ast = single_function_ast(
        "main",
        vec![],
        arr_tid,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "closures",
                arr_tid,
                Some(b::brace_list_init(arr_tid, vec![])),
            ))),
            b::for_stmt(
                Some(Stmt::Decl(Decl::Var(b::var_decl(
                    "i",
                    int,
                    Some(b::lit_int(0, int)),
                )))),
                Some(b::cmp(
                    CmpOp::Lt,
                    b::ident("i", int),
                    b::lit_int(3, int),
                    boolean,
                )),
                Some(b::assign(
                    b::ident("i", int),
                    b::binary(BinaryOp::Add, b::ident("i", int), b::lit_int(1, int), int),
                )),
                b::block(vec![b::expr_stmt(b::call_intrinsic(
                    smalls_parser::IntrinsicId::ArrayPush,
                    vec![b::ident("closures", arr_tid), lambda],
                    h.rt.void_type(),
                ))]),
            ),
            b::ret(b::ident("closures", arr_tid)),
        ]),
    );
    let module = h.compile("m", ast);
    let closures = h.run(module, "main", &[]);
    let arr_ptr = closures.heap_ptr().expect("array result");

    let mut seen = Vec::new();
    for i in 0..3 {
        let closure = h.rt.array_get(arr_ptr, i).unwrap();
        let ptr = closure.heap_ptr().expect("closure element");
        let result = h.vm.execute_closure(&mut h.rt, ptr, &[], 0);
        assert!(!h.vm.failed(), "{}", h.vm.error_message());
        seen.push(result.as_int().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2], "each iteration captures independently");
}

#[test]
fn test_module_function_as_closure_value() {
    let mut h = Harness::new();
    let int = h.int();
    let fn_tid = h.rt.types.register_function_type(&[int], int);

    let mut ast = single_function_ast(
        "inc",
        vec![b::param("x", int)],
        int,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Add,
            b::ident("x", int),
            b::lit_int(1, int),
            int,
        ))]),
    );
    // fn apply(f: fn(int): int, x: int): int { return f(x); }
    ast.decls.push(Decl::Function(b::function(
        "apply",
        vec![b::param("f", fn_tid), b::param("x", int)],
        int,
        b::block(vec![b::ret(b::call_value(
            b::ident("f", fn_tid),
            vec![b::ident("x", int)],
            int,
        ))]),
    )));
    // fn main(): int { return apply(inc, 41); }
    ast.decls.push(Decl::Function(b::function(
        "main",
        vec![],
        int,
        b::block(vec![b::ret(b::call_local(
            "apply",
            vec![b::ident("inc", fn_tid), b::lit_int(41, int)],
            int,
        ))]),
    )));
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 42);
}

#[test]
fn test_nested_closure_captures_through_parent() {
    let mut h = Harness::new();
    let int = h.int();
    let inner_tid = h.rt.types.register_function_type(&[], int);
    let outer_tid = h.rt.types.register_function_type(&[], inner_tid);

    // fn make(): fn(): fn(): int {
    //   var x = 42;
    //   return fn(): fn(): int { return fn(): int { return x; }; };
    // }
    let innermost = b::lambda(
        vec![],
        int,
        b::block(vec![b::ret(b::ident("x", int))]),
        vec![smalls_parser::ast::CapturedVar {
            name: "x".into(),
            type_id: int,
            is_upvalue_in_parent: true,
        }],
        inner_tid,
    );
    let outer = b::lambda(
        vec![],
        inner_tid,
        b::block(vec![b::ret(innermost)]),
        vec![b::capture("x", int)],
        outer_tid,
    );
    let ast = single_function_ast(
        "make",
        vec![],
        outer_tid,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl("x", int, Some(b::lit_int(42, int))))),
            b::ret(outer),
        ]),
    );
    let module = h.compile("m", ast);

    let outer_val = h.run(module, "make", &[]);
    let outer_ptr = outer_val.heap_ptr().expect("outer closure");
    let inner_val = h.vm.execute_closure(&mut h.rt, outer_ptr, &[], 0);
    let inner_ptr = inner_val.heap_ptr().expect("inner closure");
    let result = h.vm.execute_closure(&mut h.rt, inner_ptr, &[], 0);
    assert!(!h.vm.failed(), "{}", h.vm.error_message());
    assert_eq!(result.as_int(), Some(42));
}

#[test]
fn test_calling_nil_closure_fails() {
    let mut h = Harness::new();
    let int = h.int();
    let fn_tid = h.rt.types.register_function_type(&[], int);

    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl("f", fn_tid, None))),
            b::ret(b::call_value(b::ident("f", fn_tid), vec![], int)),
        ]),
    );
    let module = h.compile("m", ast);
    let message = h.run_expect_fail(module, "main", &[]);
    assert!(message.contains("CALLCLOSURE"), "{message}");
}
