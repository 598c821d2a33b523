//! Dynamic arrays, maps, map iteration, strings, and f-strings.

mod common;

use common::{single_function_ast, Harness};
use pretty_assertions::assert_eq;
use smalls_parser::ast::{BinaryOp, Decl, Stmt};
use smalls_parser::builders as b;
use smalls_parser::IntrinsicId;

#[test]
fn test_array_literal_index_and_push() {
    let mut h = Harness::new();
    let int = h.int();
    let arr = h.rt.types.register_array_type(int);

    // var a = {10, 20}; array_push(a, 30); a[0] = a[0] + 2;
    // return a[0] + a[2] + array_len(a);
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "a",
                arr,
                Some(b::brace_list_init(
                    arr,
                    vec![b::lit_int(10, int), b::lit_int(20, int)],
                )),
            ))),
            b::expr_stmt(b::call_intrinsic(
                IntrinsicId::ArrayPush,
                vec![b::ident("a", arr), b::lit_int(30, int)],
                h.rt.void_type(),
            )),
            b::expr_stmt(b::assign(
                b::index(b::ident("a", arr), b::lit_int(0, int), int),
                b::binary(
                    BinaryOp::Add,
                    b::index(b::ident("a", arr), b::lit_int(0, int), int),
                    b::lit_int(2, int),
                    int,
                ),
            )),
            b::ret(b::binary(
                BinaryOp::Add,
                b::binary(
                    BinaryOp::Add,
                    b::index(b::ident("a", arr), b::lit_int(0, int), int),
                    b::index(b::ident("a", arr), b::lit_int(2, int), int),
                    int,
                ),
                b::call_intrinsic(IntrinsicId::ArrayLen, vec![b::ident("a", arr)], int),
                int,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 12 + 30 + 3);
}

#[test]
fn test_array_out_of_bounds_fails() {
    let mut h = Harness::new();
    let int = h.int();
    let arr = h.rt.types.register_array_type(int);
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "a",
                arr,
                Some(b::brace_list_init(arr, vec![b::lit_int(1, int)])),
            ))),
            b::ret(b::index(b::ident("a", arr), b::lit_int(5, int), int)),
        ]),
    );
    let module = h.compile("m", ast);
    let message = h.run_expect_fail(module, "main", &[]);
    assert!(message.contains("Array access failed"), "{message}");
}

#[test]
fn test_foreach_over_array() {
    let mut h = Harness::new();
    let int = h.int();
    let arr = h.rt.types.register_array_type(int);

    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "a",
                arr,
                Some(b::brace_list_init(
                    arr,
                    vec![
                        b::lit_int(1, int),
                        b::lit_int(2, int),
                        b::lit_int(3, int),
                    ],
                )),
            ))),
            Stmt::Decl(Decl::Var(b::var_decl(
                "total",
                int,
                Some(b::lit_int(0, int)),
            ))),
            b::foreach_array(
                b::var_decl("x", int, None),
                int,
                b::ident("a", arr),
                b::block(vec![b::expr_stmt(b::assign(
                    b::ident("total", int),
                    b::binary(
                        BinaryOp::Add,
                        b::ident("total", int),
                        b::ident("x", int),
                        int,
                    ),
                ))]),
            ),
            b::ret(b::ident("total", int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 6);
}

#[test]
fn test_map_literal_get_set() {
    let mut h = Harness::new();
    let int = h.int();
    let string = h.string();
    let map = h.rt.types.register_map_type(int, string);

    // var m = {1: "a", 2: "b"}; m[3] = "c"; return m[3];
    let ast = single_function_ast(
        "main",
        vec![],
        string,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "m",
                map,
                Some(b::brace_map_init(
                    map,
                    vec![
                        (b::lit_int(1, int), b::lit_str("a", string)),
                        (b::lit_int(2, int), b::lit_str("b", string)),
                    ],
                )),
            ))),
            b::expr_stmt(b::assign(
                b::index(b::ident("m", map), b::lit_int(3, int), string),
                b::lit_str("c", string),
            )),
            b::ret(b::index(b::ident("m", map), b::lit_int(3, int), string)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_string(module, "main", &[]), "c");
}

/// Map iteration accumulates every key exactly once, order-independent.
#[test]
fn test_foreach_over_map_accumulates_keys() {
    let mut h = Harness::new();
    let int = h.int();
    let string = h.string();
    let map = h.rt.types.register_map_type(int, string);

    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "m",
                map,
                Some(b::brace_map_init(
                    map,
                    vec![
                        (b::lit_int(1, int), b::lit_str("a", string)),
                        (b::lit_int(2, int), b::lit_str("b", string)),
                    ],
                )),
            ))),
            Stmt::Decl(Decl::Var(b::var_decl(
                "total",
                int,
                Some(b::lit_int(0, int)),
            ))),
            b::foreach_map(
                b::var_decl("k", int, None),
                b::var_decl("v", string, None),
                int,
                string,
                b::ident("m", map),
                b::block(vec![b::expr_stmt(b::assign(
                    b::ident("total", int),
                    b::binary(
                        BinaryOp::Add,
                        b::ident("total", int),
                        b::ident("k", int),
                        int,
                    ),
                ))]),
            ),
            b::ret(b::ident("total", int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 3);
}

#[test]
fn test_map_intrinsics() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    let map = h.rt.types.register_map_type(int, int);

    // m = {1: 10}; has = map_has(m, 1); map_remove(m, 1);
    // return has && map_len(m) == 0 ? 1 : 0;
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "m",
                map,
                Some(b::brace_map_init(
                    map,
                    vec![(b::lit_int(1, int), b::lit_int(10, int))],
                )),
            ))),
            Stmt::Decl(Decl::Var(b::var_decl(
                "has",
                boolean,
                Some(b::call_intrinsic(
                    IntrinsicId::MapHas,
                    vec![b::ident("m", map), b::lit_int(1, int)],
                    boolean,
                )),
            ))),
            b::expr_stmt(b::call_intrinsic(
                IntrinsicId::MapRemove,
                vec![b::ident("m", map), b::lit_int(1, int)],
                boolean,
            )),
            b::ret(b::conditional(
                b::logical(
                    smalls_parser::ast::LogicalOp::And,
                    b::ident("has", boolean),
                    b::cmp(
                        smalls_parser::ast::CmpOp::Eq,
                        b::call_intrinsic(IntrinsicId::MapLen, vec![b::ident("m", map)], int),
                        b::lit_int(0, int),
                        boolean,
                    ),
                    boolean,
                ),
                b::lit_int(1, int),
                b::lit_int(0, int),
                int,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 1);
}

#[test]
fn test_string_intrinsics() {
    let mut h = Harness::new();
    let int = h.int();
    let string = h.string();

    let call1 = |id, s: &str, tid| b::call_intrinsic(id, vec![b::lit_str(s, string)], tid);

    let ast = single_function_ast(
        "upper",
        vec![],
        string,
        b::block(vec![b::ret(call1(IntrinsicId::StringToUpper, "abc", string))]),
    );
    let module = h.compile("m1", ast);
    assert_eq!(h.run_string(module, "upper", &[]), "ABC");

    let ast = single_function_ast(
        "len",
        vec![],
        int,
        b::block(vec![b::ret(call1(IntrinsicId::StringLen, "hello", int))]),
    );
    let module = h.compile("m2", ast);
    assert_eq!(h.run_int(module, "len", &[]), 5);

    let ast = single_function_ast(
        "find",
        vec![],
        int,
        b::block(vec![b::ret(b::call_intrinsic(
            IntrinsicId::StringFind,
            vec![b::lit_str("hello world", string), b::lit_str("world", string)],
            int,
        ))]),
    );
    let module = h.compile("m3", ast);
    assert_eq!(h.run_int(module, "find", &[]), 6);

    let ast = single_function_ast(
        "sub",
        vec![],
        string,
        b::block(vec![b::ret(b::call_intrinsic(
            IntrinsicId::StringSubstr,
            vec![
                b::lit_str("substring", string),
                b::lit_int(3, int),
                b::lit_int(6, int),
            ],
            string,
        ))]),
    );
    let module = h.compile("m4", ast);
    assert_eq!(h.run_string(module, "sub", &[]), "string");

    let ast = single_function_ast(
        "toint",
        vec![],
        int,
        b::block(vec![b::ret(call1(IntrinsicId::StringToInt, " 42 ", int))]),
    );
    let module = h.compile("m5", ast);
    assert_eq!(h.run_int(module, "toint", &[]), 42);
}

#[test]
fn test_string_split_and_join_round_trip() {
    let mut h = Harness::new();
    let string = h.string();
    let arr = h.rt.types.register_array_type(string);

    let ast = single_function_ast(
        "main",
        vec![],
        string,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "parts",
                arr,
                Some(b::call_intrinsic(
                    IntrinsicId::StringSplit,
                    vec![b::lit_str("a,b,c", string), b::lit_str(",", string)],
                    arr,
                )),
            ))),
            b::ret(b::call_intrinsic(
                IntrinsicId::StringJoin,
                vec![b::ident("parts", arr), b::lit_str("-", string)],
                string,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_string(module, "main", &[]), "a-b-c");
}

#[test]
fn test_bit_intrinsics() {
    let mut h = Harness::new();
    let int = h.int();
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![b::ret(b::call_intrinsic(
            IntrinsicId::BitOr,
            vec![
                b::call_intrinsic(
                    IntrinsicId::BitShl,
                    vec![b::lit_int(1, int), b::lit_int(5, int)],
                    int,
                ),
                b::call_intrinsic(
                    IntrinsicId::BitAnd,
                    vec![b::lit_int(0xFF, int), b::lit_int(0x0A, int)],
                    int,
                ),
            ],
            int,
        ))]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 32 | 10);
}

#[test]
fn test_fstring_interpolation() {
    let mut h = Harness::new();
    let int = h.int();
    let string = h.string();
    // f"sum is {a + b}!"
    let ast = single_function_ast(
        "fmt",
        vec![b::param("a", int), b::param("b", int)],
        string,
        b::block(vec![b::ret(b::fstring(
            vec!["sum is ", "!"],
            vec![b::binary(
                BinaryOp::Add,
                b::ident("a", int),
                b::ident("b", int),
                int,
            )],
            string,
        ))]),
    );
    let module = h.compile("m", ast);
    let a = h.rt.make_int(40);
    let bb = h.rt.make_int(2);
    assert_eq!(h.run_string(module, "fmt", &[a, bb]), "sum is 42!");
}

#[test]
fn test_fstring_uses_registered_str_operator() {
    use smalls::runtime::ops::ScriptFunctionRef;

    let mut h = Harness::new();
    let int = h.int();
    let string = h.string();
    let feat = h.rt.types.register_newtype("Feat", int);

    // A library module provides str(Feat).
    let lib = single_function_ast(
        "feat_str",
        vec![b::param("f", feat)],
        string,
        b::block(vec![b::ret(b::fstring(
            vec!["Feat#", ""],
            vec![b::cast(b::ident("f", feat), int, int)],
            string,
        ))]),
    );
    h.compile("featlib", lib);
    h.rt.ops.register_str(
        feat,
        ScriptFunctionRef {
            module_path: "featlib".into(),
            function_name: "feat_str".into(),
        },
    );

    let ast = single_function_ast(
        "fmt",
        vec![b::param("f", feat)],
        string,
        b::block(vec![b::ret(b::fstring(
            vec!["got ", ""],
            vec![b::ident("f", feat)],
            string,
        ))]),
    );
    let module = h.compile("m", ast);
    let feat_val = smalls::Value::make_int_typed(7, feat);
    assert_eq!(h.run_string(module, "fmt", &[feat_val]), "got Feat#7");
}
