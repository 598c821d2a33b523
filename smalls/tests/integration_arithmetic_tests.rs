//! Arithmetic, constant folding, control flow, and failure basics.

mod common;

use common::{single_function_ast, Harness};
use pretty_assertions::assert_eq;
use smalls::Opcode;
use smalls_parser::ast::{BinaryOp, CmpOp, Decl, LogicalOp, UnaryOp};
use smalls_parser::builders as b;
use smalls_parser::Span;

#[test]
fn test_add_two_literals() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Add,
            b::lit_int(40, int),
            b::lit_int(2, int),
            int,
        ))]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 42);
}

#[test]
fn test_parameter_arithmetic() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "mul",
        vec![b::param("a", int), b::param("b", int)],
        int,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Mul,
            b::ident("a", int),
            b::ident("b", int),
            int,
        ))]),
    );
    let module = h.compile("m", ast);
    let six = h.rt.make_int(6);
    let seven = h.rt.make_int(7);
    assert_eq!(h.run_int(module, "mul", &[six, seven]), 42);
}

#[test]
fn test_float_arithmetic_and_mixed_promotion() {
    let mut h = Harness::new();
    let float = h.float();
    let int = h.int();
    let ast = single_function_ast(
        "main",
        vec![],
        float,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Add,
            b::lit_float(1.25, float),
            b::binary(
                BinaryOp::Mul,
                b::lit_int(2, int),
                b::lit_float(0.5, float),
                float,
            ),
            float,
        ))]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_float(module, "main", &[]), 2.25);
}

/// Constant folding must agree with execution: the same expression, folded
/// and unfolded, produces the same value.
#[test]
fn test_constant_folding_is_sound() {
    let mut h = Harness::new();
    let int = h.int();

    let build = |folded: bool| {
        let expr = b::binary(
            BinaryOp::Sub,
            b::binary(
                BinaryOp::Mul,
                b::lit_int(6, int),
                b::lit_int(8, int),
                int,
            ),
            b::lit_int(6, int),
            int,
        );
        let expr = if folded { b::mark_const(expr) } else { expr };
        single_function_ast("main", vec![], int, b::block(vec![b::ret(expr)]))
    };

    let folded_mod = h.compile("folded", build(true));
    let unfolded_mod = h.compile("unfolded", build(false));
    let folded = h.run_int(folded_mod, "main", &[]);
    let unfolded = h.run_int(unfolded_mod, "main", &[]);
    assert_eq!(folded, 42);
    assert_eq!(folded, unfolded);

    // The folded module carries no arithmetic opcodes for the expression.
    let module = h.rt.module(folded_mod);
    let main = module.get_function("main").unwrap();
    assert!(main
        .instructions
        .iter()
        .all(|i| !matches!(i.opcode(), Some(Opcode::Mul) | Some(Opcode::Sub))));
}

#[test]
fn test_conditional_expression() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    let ast = single_function_ast(
        "pick",
        vec![b::param("flag", boolean)],
        int,
        b::block(vec![b::ret(b::conditional(
            b::ident("flag", boolean),
            b::lit_int(1, int),
            b::lit_int(2, int),
            int,
        ))]),
    );
    let module = h.compile("m", ast);
    let t = h.rt.make_bool(true);
    let f = h.rt.make_bool(false);
    assert_eq!(h.run_int(module, "pick", &[t]), 1);
    assert_eq!(h.run_int(module, "pick", &[f]), 2);
}

#[test]
fn test_short_circuit_logical() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    // n != 0 && 10 / n > 1 — short circuit keeps the division safe.
    let ast = single_function_ast(
        "safe",
        vec![b::param("n", int)],
        boolean,
        b::block(vec![b::ret(b::logical(
            LogicalOp::And,
            b::cmp(CmpOp::Ne, b::ident("n", int), b::lit_int(0, int), boolean),
            b::cmp(
                CmpOp::Gt,
                b::binary(BinaryOp::Div, b::lit_int(10, int), b::ident("n", int), int),
                b::lit_int(1, int),
                boolean,
            ),
            boolean,
        ))]),
    );
    let module = h.compile("m", ast);
    let zero = h.rt.make_int(0);
    let two = h.rt.make_int(2);
    let nine = h.rt.make_int(9);
    assert!(!h.run_bool(module, "safe", &[zero]));
    assert!(h.run_bool(module, "safe", &[two]));
    assert!(!h.run_bool(module, "safe", &[nine]));
}

#[test]
fn test_unary_operators() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    let neg = single_function_ast(
        "neg",
        vec![b::param("x", int)],
        int,
        b::block(vec![b::ret(b::unary(UnaryOp::Neg, b::ident("x", int), int))]),
    );
    let module = h.compile("m", neg);
    let five = h.rt.make_int(5);
    assert_eq!(h.run_int(module, "neg", &[five]), -5);

    let not = single_function_ast(
        "not",
        vec![b::param("x", boolean)],
        boolean,
        b::block(vec![b::ret(b::unary(
            UnaryOp::Not,
            b::ident("x", boolean),
            boolean,
        ))]),
    );
    let module = h.compile("m2", not);
    let t = h.rt.make_bool(true);
    assert!(!h.run_bool(module, "not", &[t]));
}

#[test]
fn test_for_loop_sums() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    // total = 0; for (i = 0; i < 10; i = i + 1) total += i; return total;
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            smalls_parser::ast::Stmt::Decl(Decl::Var(b::var_decl(
                "total",
                int,
                Some(b::lit_int(0, int)),
            ))),
            b::for_stmt(
                Some(smalls_parser::ast::Stmt::Decl(Decl::Var(b::var_decl(
                    "i",
                    int,
                    Some(b::lit_int(0, int)),
                )))),
                Some(b::cmp(
                    CmpOp::Lt,
                    b::ident("i", int),
                    b::lit_int(10, int),
                    boolean,
                )),
                Some(b::assign(
                    b::ident("i", int),
                    b::binary(BinaryOp::Add, b::ident("i", int), b::lit_int(1, int), int),
                )),
                b::block(vec![b::expr_stmt(b::assign(
                    b::ident("total", int),
                    b::binary(
                        BinaryOp::Add,
                        b::ident("total", int),
                        b::ident("i", int),
                        int,
                    ),
                ))]),
            ),
            b::ret(b::ident("total", int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 45);
}

#[test]
fn test_break_and_continue() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    // Sum odd numbers below 10, stopping at 7: 1 + 3 + 5 = 9.
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            smalls_parser::ast::Stmt::Decl(Decl::Var(b::var_decl(
                "total",
                int,
                Some(b::lit_int(0, int)),
            ))),
            b::for_stmt(
                Some(smalls_parser::ast::Stmt::Decl(Decl::Var(b::var_decl(
                    "i",
                    int,
                    Some(b::lit_int(0, int)),
                )))),
                Some(b::cmp(
                    CmpOp::Lt,
                    b::ident("i", int),
                    b::lit_int(10, int),
                    boolean,
                )),
                Some(b::assign(
                    b::ident("i", int),
                    b::binary(BinaryOp::Add, b::ident("i", int), b::lit_int(1, int), int),
                )),
                b::block(vec![
                    b::if_stmt(
                        b::cmp(
                            CmpOp::Eq,
                            b::binary(
                                BinaryOp::Mod,
                                b::ident("i", int),
                                b::lit_int(2, int),
                                int,
                            ),
                            b::lit_int(0, int),
                            boolean,
                        ),
                        b::block(vec![b::cont()]),
                        None,
                    ),
                    b::if_stmt(
                        b::cmp(CmpOp::Eq, b::ident("i", int), b::lit_int(7, int), boolean),
                        b::block(vec![b::brk()]),
                        None,
                    ),
                    b::expr_stmt(b::assign(
                        b::ident("total", int),
                        b::binary(
                            BinaryOp::Add,
                            b::ident("total", int),
                            b::ident("i", int),
                            int,
                        ),
                    )),
                ]),
            ),
            b::ret(b::ident("total", int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 9);
}

#[test]
fn test_division_by_zero_fails_with_trace() {
    let mut h = Harness::new();
    let int = h.int();

    let mut divide = b::binary(
        BinaryOp::Div,
        b::lit_int(1, int),
        b::lit_int(0, int),
        int,
    );
    divide.info_mut().span = Span::new(0, 0, 3, 3, 12, 15);

    let ast = single_function_ast("main", vec![], int, b::block(vec![b::ret(divide)]));
    let module = h.compile("m", ast);
    h.rt.module_mut(module).source =
        Some("// source kept for traces\nfn main(): int {\n    return 1 / 0;\n}\n".to_string());
    let message = h.run_expect_fail(module, "main", &[]);
    assert_eq!(message, "Division by zero");

    let trace = h.vm.get_stack_trace(&h.rt);
    assert!(trace.contains("m::main"), "trace was: {trace}");
    assert!(trace.contains("line 3"), "trace was: {trace}");
    assert!(trace.contains("column 12"), "trace was: {trace}");
    assert!(trace.contains("return 1 / 0;"), "trace was: {trace}");
    assert!(trace.contains('^'), "trace was: {trace}");
}

#[test]
fn test_modulo_by_zero_message() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Mod,
            b::lit_int(5, int),
            b::lit_int(0, int),
            int,
        ))]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_expect_fail(module, "main", &[]), "Modulo by zero");
}

#[test]
fn test_dead_code_after_return_is_dropped() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            b::ret(b::lit_int(1, int)),
            b::ret(b::lit_int(2, int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 1);
    // Only one return sequence was emitted.
    let main = h.rt.module(module).get_function("main").unwrap().clone();
    let rets = main
        .instructions
        .iter()
        .filter(|i| matches!(i.opcode(), Some(Opcode::Ret)))
        .count();
    assert_eq!(rets, 1);
}

#[test]
fn test_constant_false_if_drops_branch() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            b::if_stmt(
                b::lit_bool(false, boolean),
                b::block(vec![b::ret(b::lit_int(1, int))]),
                Some(b::block(vec![b::ret(b::lit_int(2, int))])),
            ),
            b::ret(b::lit_int(3, int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 2);
    let main = h.rt.module(module).get_function("main").unwrap().clone();
    // The constant condition never materializes a conditional jump.
    assert!(main
        .instructions
        .iter()
        .all(|i| !matches!(i.opcode(), Some(Opcode::JmpF))));
}

#[test]
fn test_string_comparison_and_concat() {
    let mut h = Harness::new();
    let boolean = h.boolean();
    let string = h.string();
    let cmp_ast = single_function_ast(
        "less",
        vec![b::param("a", string), b::param("b", string)],
        boolean,
        b::block(vec![b::ret(b::cmp(
            CmpOp::Lt,
            b::ident("a", string),
            b::ident("b", string),
            boolean,
        ))]),
    );
    let module = h.compile("m", cmp_ast);
    let abc = h.rt.make_string("abc");
    let abd = h.rt.make_string("abd");
    assert!(h.run_bool(module, "less", &[abc, abd]));

    let concat_ast = single_function_ast(
        "join",
        vec![b::param("a", string), b::param("b", string)],
        string,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Add,
            b::ident("a", string),
            b::ident("b", string),
            string,
        ))]),
    );
    let module2 = h.compile("m2", concat_ast);
    let foo = h.rt.make_string("foo");
    let bar = h.rt.make_string("bar");
    assert_eq!(h.run_string(module2, "join", &[foo, bar]), "foobar");
}

#[test]
fn test_default_parameter_fills_missing_argument() {
    let mut h = Harness::new();
    let int = h.int();
    let mut ast = single_function_ast(
        "add",
        vec![
            b::param("a", int),
            b::param_default("b", int, b::lit_int(3, int)),
        ],
        int,
        b::block(vec![b::ret(b::binary(
            BinaryOp::Add,
            b::ident("a", int),
            b::ident("b", int),
            int,
        ))]),
    );
    ast.decls.push(Decl::Function(b::function(
        "main",
        vec![],
        int,
        b::block(vec![b::ret(b::call_local(
            "add",
            vec![b::lit_int(39, int)],
            int,
        ))]),
    )));
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 42);
    let two = h.rt.make_int(2);
    let four = h.rt.make_int(4);
    assert_eq!(h.run_int(module, "add", &[two, four]), 6);
}

#[test]
fn test_argument_count_mismatch_fails() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "f",
        vec![b::param("a", int)],
        int,
        b::block(vec![b::ret(b::ident("a", int))]),
    );
    let module = h.compile("m", ast);
    let message = h.run_expect_fail(module, "f", &[]);
    assert!(message.contains("Argument count mismatch"), "{message}");
    // The VM recovers on the next top-level entry.
    let one = h.rt.make_int(1);
    assert_eq!(h.run_int(module, "f", &[one]), 1);
}
