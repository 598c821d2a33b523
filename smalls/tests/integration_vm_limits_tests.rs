//! Bounded execution, re-entrancy, call depth, and GC integration.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{single_function_ast, Harness};
use pretty_assertions::assert_eq;
use smalls_parser::ast::{BinaryOp, CmpOp, Decl, Stmt};
use smalls_parser::builders as b;

/// Endless counting loop for limit tests.
fn endless_loop_ast(h: &Harness) -> smalls_parser::ast::Ast {
    let int = h.int();
    let boolean = h.boolean();
    single_function_ast(
        "spin",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl("i", int, Some(b::lit_int(0, int))))),
            b::for_stmt(
                None,
                Some(b::cmp(
                    CmpOp::Ge,
                    b::ident("i", int),
                    b::lit_int(0, int),
                    boolean,
                )),
                Some(b::assign(
                    b::ident("i", int),
                    b::binary(BinaryOp::Add, b::ident("i", int), b::lit_int(1, int), int),
                )),
                b::block(vec![]),
            ),
            b::ret(b::ident("i", int)),
        ]),
    )
}

#[test]
fn test_step_limit_halts_runaway_program() {
    let mut h = Harness::new();
    let ast = endless_loop_ast(&h);
    let module = h.compile("m", ast);

    h.vm.set_step_limit(1000);
    let result = h.vm.execute(&mut h.rt, module, "spin", &[], 0);
    assert!(h.vm.failed());
    assert!(!result.is_valid());
    assert!(
        h.vm.error_message().contains("exceeded execution limit"),
        "{}",
        h.vm.error_message()
    );
}

#[test]
fn test_gas_limit_counts_backward_jumps() {
    let mut h = Harness::new();
    let ast = endless_loop_ast(&h);
    let module = h.compile("m", ast);

    let result = h.vm.execute(&mut h.rt, module, "spin", &[], 500);
    assert!(h.vm.failed());
    assert!(!result.is_valid());
    assert!(
        h.vm.error_message().contains("exceeded execution limit"),
        "{}",
        h.vm.error_message()
    );
}

#[test]
fn test_gas_limit_counts_calls() {
    let mut h = Harness::new();
    let int = h.int();
    // Unbounded recursion; gas gives out long before frame depth would.
    let ast = single_function_ast(
        "recurse",
        vec![b::param("n", int)],
        int,
        b::block(vec![b::ret(b::call_local(
            "recurse",
            vec![b::binary(
                BinaryOp::Add,
                b::ident("n", int),
                b::lit_int(1, int),
                int,
            )],
            int,
        ))]),
    );
    let module = h.compile("m", ast);
    let zero = h.rt.make_int(0);
    let result = h.vm.execute(&mut h.rt, module, "recurse", &[zero], 20);
    assert!(h.vm.failed());
    assert!(!result.is_valid());
    assert!(
        h.vm.error_message().contains("exceeded execution limit"),
        "{}",
        h.vm.error_message()
    );
}

#[test]
fn test_zero_gas_means_unlimited() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    let ast = single_function_ast(
        "count",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl("i", int, Some(b::lit_int(0, int))))),
            b::for_stmt(
                None,
                Some(b::cmp(
                    CmpOp::Lt,
                    b::ident("i", int),
                    b::lit_int(10000, int),
                    boolean,
                )),
                Some(b::assign(
                    b::ident("i", int),
                    b::binary(BinaryOp::Add, b::ident("i", int), b::lit_int(1, int), int),
                )),
                b::block(vec![]),
            ),
            b::ret(b::ident("i", int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "count", &[]), 10000);
}

#[test]
fn test_call_depth_limit() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "recurse",
        vec![b::param("n", int)],
        int,
        b::block(vec![b::ret(b::call_local(
            "recurse",
            vec![b::ident("n", int)],
            int,
        ))]),
    );
    let module = h.compile("m", ast);
    let zero = h.rt.make_int(0);
    let message = h.run_expect_fail(module, "recurse", &[zero]);
    assert!(message.contains("Stack overflow"), "{message}");
}

/// A native function re-enters the VM while the outer frame is live; the
/// outer execution resumes with its register state intact.
#[test]
fn test_reentrant_execute() {
    let mut h = Harness::new();
    let int = h.int();

    let mut ast = single_function_ast(
        "inner",
        vec![],
        int,
        b::block(vec![b::ret(b::lit_int(2, int))]),
    );
    // fn outer(): int { var x = 40; return reenter() + x; }
    ast.decls.push(Decl::Function(b::function(
        "outer",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl("x", int, Some(b::lit_int(40, int))))),
            b::ret(b::binary(
                BinaryOp::Add,
                b::call_external("host", "reenter", vec![], int),
                b::ident("x", int),
                int,
            )),
        ]),
    )));

    // Register the native before compiling so the external resolves.
    let module_slot: Rc<Cell<Option<smalls::ModuleId>>> = Rc::new(Cell::new(None));
    let module_for_native = Rc::clone(&module_slot);
    h.rt.register_native_function(
        "host.reenter",
        Rc::new(move |rt, vm, _args| {
            let module = module_for_native.get().expect("module installed");
            let depth_before = vm.frame_depth();
            let result = vm.execute(rt, module, "inner", &[], 0);
            assert_eq!(vm.frame_depth(), depth_before, "nested run drained to entry");
            Ok(result)
        }),
    );

    let module = h.compile("m", ast);
    module_slot.set(Some(module));
    assert_eq!(h.run_int(module, "outer", &[]), 42);
}

#[test]
fn test_garbage_collection_frees_unreachable_keeps_globals() {
    let mut h = Harness::new();
    let int = h.int();
    let string = h.string();
    let boolean = h.boolean();

    // A module global keeps one string alive across collections.
    let mut ast = smalls_parser::ast::Ast::new();
    ast.decls.push(Decl::Var(b::var_decl(
        "keep",
        string,
        Some(b::lit_str("kept", string)),
    )));
    // fn churn(): int — builds and drops strings in a loop.
    ast.decls.push(Decl::Function(b::function(
        "churn",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "i",
                int,
                Some(b::lit_int(0, int)),
            ))),
            b::for_stmt(
                None,
                Some(b::cmp(
                    CmpOp::Lt,
                    b::ident("i", int),
                    b::lit_int(50, int),
                    boolean,
                )),
                Some(b::assign(
                    b::ident("i", int),
                    b::binary(BinaryOp::Add, b::ident("i", int), b::lit_int(1, int), int),
                )),
                b::block(vec![
                    Stmt::Decl(Decl::Var(b::var_decl(
                        "s",
                        string,
                        Some(b::lit_str("garbage", string)),
                    ))),
                    b::expr_stmt(b::ident("s", string)),
                ]),
            ),
            b::ret(b::ident("i", int)),
        ]),
    )));

    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "churn", &[]), 50);

    let live_before = h.rt.heap.live_count();
    let collected = h.rt.collect_garbage(&[&h.vm]);
    assert!(collected > 0, "loop garbage was collected");
    assert!(h.rt.heap.live_count() < live_before);

    // The global survived and still reads correctly.
    let global = h.rt.module(module).globals[0];
    let ptr = global.heap_ptr().expect("global string");
    assert_eq!(h.rt.get_string_view(ptr), "kept");
}

#[test]
fn test_globals_initialized_once_before_first_call() {
    let mut h = Harness::new();
    let int = h.int();

    let mut ast = smalls_parser::ast::Ast::new();
    ast.decls.push(Decl::Var(b::var_decl(
        "counter",
        int,
        Some(b::lit_int(5, int)),
    )));
    // fn bump(): int { counter = counter + 1; return counter; }
    ast.decls.push(Decl::Function(b::function(
        "bump",
        vec![],
        int,
        b::block(vec![
            b::expr_stmt(b::assign(
                b::ident("counter", int),
                b::binary(
                    BinaryOp::Add,
                    b::ident("counter", int),
                    b::lit_int(1, int),
                    int,
                ),
            )),
            b::ret(b::ident("counter", int)),
        ]),
    )));
    let module = h.compile("m", ast);

    // __init runs exactly once; state persists across entries.
    assert_eq!(h.run_int(module, "bump", &[]), 6);
    assert_eq!(h.run_int(module, "bump", &[]), 7);
    assert_eq!(h.run_int(module, "bump", &[]), 8);
}

#[test]
fn test_assigning_const_global_fails_to_compile() {
    let mut h = Harness::new();
    let int = h.int();

    let mut ast = smalls_parser::ast::Ast::new();
    ast.decls
        .push(Decl::Var(b::const_decl("K", int, b::lit_int(1, int))));
    ast.decls.push(Decl::Function(b::function(
        "bad",
        vec![],
        int,
        b::block(vec![
            b::expr_stmt(b::assign(b::ident("K", int), b::lit_int(2, int))),
            b::ret(b::ident("K", int)),
        ]),
    )));
    let err = h.compile_err("m", &ast);
    assert!(
        err.message.contains("cannot assign to const global"),
        "{}",
        err.message
    );
}

#[test]
fn test_ast_node_limit_rejects_compilation() {
    let mut h = Harness::new();
    h.ctx.limits.max_ast_nodes = 2;
    let int = h.int();
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Add,
            b::lit_int(1, int),
            b::lit_int(2, int),
            int,
        ))]),
    );
    let err = h.compile_err("m", &ast);
    assert!(err.message.contains("AST node limit"), "{}", err.message);
}

#[test]
fn test_failure_latches_first_message() {
    let mut h = Harness::new();
    let int = h.int();
    // Two failing operations in sequence; only the first latches.
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            b::expr_stmt(b::binary(
                BinaryOp::Div,
                b::lit_int(1, int),
                b::lit_int(0, int),
                int,
            )),
            b::expr_stmt(b::binary(
                BinaryOp::Mod,
                b::lit_int(1, int),
                b::lit_int(0, int),
                int,
            )),
            b::ret(b::lit_int(0, int)),
        ]),
    );
    let module = h.compile("m", ast);
    let message = h.run_expect_fail(module, "main", &[]);
    assert_eq!(message, "Division by zero");
}
