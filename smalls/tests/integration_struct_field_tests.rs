//! Structs, field access opcodes, fixed arrays, tuples, and value types.

mod common;

use common::{single_function_ast, Harness};
use pretty_assertions::assert_eq;
use smalls::{Opcode, TypeId};
use smalls_parser::ast::{BinaryOp, Decl, Stmt};
use smalls_parser::builders as b;

fn point_struct(h: &mut Harness, value_type: bool) -> TypeId {
    let int = h.int();
    let float = h.float();
    h.rt.types.register_struct_type(
        if value_type { "VPoint" } else { "Point" },
        &[("x".to_string(), int), ("y".to_string(), float)],
        value_type,
    )
}

#[test]
fn test_heap_struct_field_round_trip() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let point = point_struct(&mut h, false);

    // var p = Point{x = 3, y = 1.5}; p.x = 9; return p.x;
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "p",
                point,
                Some(b::brace_field_init(
                    point,
                    vec![("x", b::lit_int(3, int)), ("y", b::lit_float(1.5, float))],
                )),
            ))),
            b::expr_stmt(b::assign(
                b::path(vec![b::ident("p", point), b::ident("x", int)], int),
                b::lit_int(9, int),
            )),
            b::ret(b::path(
                vec![b::ident("p", point), b::ident("x", int)],
                int,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 9);

    // Primitive fields go through the fast field opcodes.
    let main = h.rt.module(module).get_function("main").unwrap().clone();
    assert!(main
        .instructions
        .iter()
        .any(|i| matches!(i.opcode(), Some(Opcode::FieldGetI))));
    assert!(main
        .instructions
        .iter()
        .any(|i| matches!(i.opcode(), Some(Opcode::FieldSetI))));
}

#[test]
fn test_struct_fields_of_every_primitive_class() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let boolean = h.boolean();
    let string = h.string();
    let mixed = h.rt.types.register_struct_type(
        "Mixed",
        &[
            ("i".to_string(), int),
            ("f".to_string(), float),
            ("b".to_string(), boolean),
            ("s".to_string(), string),
        ],
        false,
    );

    let ast = single_function_ast(
        "main",
        vec![],
        string,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "m",
                mixed,
                Some(b::brace_field_init(
                    mixed,
                    vec![
                        ("i", b::lit_int(7, int)),
                        ("f", b::lit_float(2.5, float)),
                        ("b", b::lit_bool(true, boolean)),
                        ("s", b::lit_str("tag", string)),
                    ],
                )),
            ))),
            b::ret(b::path(
                vec![b::ident("m", mixed), b::ident("s", string)],
                string,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_string(module, "main", &[]), "tag");
}

/// Fixed-array field of a heap struct: single offset-addressed access, no
/// array copy.
#[test]
fn test_fixed_array_field_of_heap_struct() {
    let mut h = Harness::new();
    let int = h.int();
    let arr4 = h.rt.types.register_fixed_array_type(int, 4);
    let s = h
        .rt
        .types
        .register_struct_type("S", &[("a".to_string(), arr4)], false);

    // var s = S{}; s.a[2] = 9; return s.a[2];
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "s",
                s,
                Some(b::brace_field_init(s, vec![])),
            ))),
            b::expr_stmt(b::assign(
                b::index(
                    b::path(vec![b::ident("s", s), b::ident("a", arr4)], arr4),
                    b::lit_int(2, int),
                    int,
                ),
                b::lit_int(9, int),
            )),
            b::ret(b::index(
                b::path(vec![b::ident("s", s), b::ident("a", arr4)], arr4),
                b::lit_int(2, int),
                int,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 9);

    let main = h.rt.module(module).get_function("main").unwrap().clone();
    let has = |op: Opcode| main.instructions.iter().any(|i| i.opcode() == Some(op));
    assert!(has(Opcode::FieldGetIOffR), "element read is offset-addressed");
    assert!(has(Opcode::FieldSetIOffR), "element write is offset-addressed");
    assert!(
        !has(Opcode::GetField),
        "the array itself is never materialized"
    );
}

#[test]
fn test_fixed_array_variable_index() {
    let mut h = Harness::new();
    let int = h.int();
    let arr4 = h.rt.types.register_fixed_array_type(int, 4);
    let s = h
        .rt
        .types
        .register_struct_type("S", &[("a".to_string(), arr4)], false);

    // fn get(s: S, i: int): int { return s.a[i]; }
    let mut ast = single_function_ast(
        "get",
        vec![b::param("s", s), b::param("i", int)],
        int,
        b::block(vec![b::ret(b::index(
            b::path(vec![b::ident("s", s), b::ident("a", arr4)], arr4),
            b::ident("i", int),
            int,
        ))]),
    );
    ast.decls.push(Decl::Function(b::function(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "s",
                s,
                Some(b::brace_field_init(s, vec![])),
            ))),
            b::expr_stmt(b::assign(
                b::index(
                    b::path(vec![b::ident("s", s), b::ident("a", arr4)], arr4),
                    b::lit_int(3, int),
                    int,
                ),
                b::lit_int(77, int),
            )),
            b::ret(b::call_local(
                "get",
                vec![b::ident("s", s), b::lit_int(3, int)],
                int,
            )),
        ]),
    )));
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 77);
}

#[test]
fn test_value_struct_on_frame_stack() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let vpoint = point_struct(&mut h, true);
    assert!(h.rt.is_value_type(vpoint));

    // var p = VPoint{x = 4, y = 0.5}; p.x = p.x + 1; return p.x;
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "p",
                vpoint,
                Some(b::brace_field_init(
                    vpoint,
                    vec![("x", b::lit_int(4, int)), ("y", b::lit_float(0.5, float))],
                )),
            ))),
            b::expr_stmt(b::assign(
                b::path(vec![b::ident("p", vpoint), b::ident("x", int)], int),
                b::binary(
                    BinaryOp::Add,
                    b::path(vec![b::ident("p", vpoint), b::ident("x", int)], int),
                    b::lit_int(1, int),
                    int,
                ),
            )),
            b::ret(b::path(
                vec![b::ident("p", vpoint), b::ident("x", int)],
                int,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 5);

    let main = h.rt.module(module).get_function("main").unwrap().clone();
    let has = |op: Opcode| main.instructions.iter().any(|i| i.opcode() == Some(op));
    assert!(has(Opcode::StackAlloc));
    assert!(has(Opcode::StackFieldGet));
    assert!(has(Opcode::StackFieldSet));
    assert!(!has(Opcode::NewStruct));
}

/// Returning a stack value copies it up into the caller's byte stack.
#[test]
fn test_stack_value_survives_return() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let vpoint = point_struct(&mut h, true);

    let mut ast = single_function_ast(
        "make",
        vec![],
        vpoint,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "p",
                vpoint,
                Some(b::brace_field_init(
                    vpoint,
                    vec![
                        ("x", b::lit_int(21, int)),
                        ("y", b::lit_float(3.25, float)),
                    ],
                )),
            ))),
            b::ret(b::ident("p", vpoint)),
        ]),
    );
    ast.decls.push(Decl::Function(b::function(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "p",
                vpoint,
                Some(b::call_local("make", vec![], vpoint)),
            ))),
            b::ret(b::binary(
                BinaryOp::Add,
                b::path(vec![b::ident("p", vpoint), b::ident("x", int)], int),
                b::path(vec![b::ident("p", vpoint), b::ident("x", int)], int),
                int,
            )),
        ]),
    )));
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 42);
}

/// Returning a stack value out of the VM entry materializes it on the heap.
#[test]
fn test_stack_value_materializes_at_vm_boundary() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let vpoint = point_struct(&mut h, true);

    let ast = single_function_ast(
        "make",
        vec![],
        vpoint,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "p",
                vpoint,
                Some(b::brace_field_init(
                    vpoint,
                    vec![("x", b::lit_int(8, int)), ("y", b::lit_float(0.0, float))],
                )),
            ))),
            b::ret(b::ident("p", vpoint)),
        ]),
    );
    let module = h.compile("m", ast);
    let result = h.run(module, "make", &[]);
    let ptr = result.heap_ptr().expect("boxed at the boundary");
    let bytes = h.rt.heap.get_bytes(ptr).expect("byte image").clone();
    let x = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    assert_eq!(x, 8);
}

#[test]
fn test_stack_value_passed_as_argument() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let vpoint = point_struct(&mut h, true);

    // fn xof(p: VPoint): int { return p.x; }
    let mut ast = single_function_ast(
        "xof",
        vec![b::param("p", vpoint)],
        int,
        b::block(vec![b::ret(b::path(
            vec![b::ident("p", vpoint), b::ident("x", int)],
            int,
        ))]),
    );
    ast.decls.push(Decl::Function(b::function(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "p",
                vpoint,
                Some(b::brace_field_init(
                    vpoint,
                    vec![("x", b::lit_int(33, int)), ("y", b::lit_float(1.0, float))],
                )),
            ))),
            b::ret(b::call_local("xof", vec![b::ident("p", vpoint)], int)),
        ]),
    )));
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 33);
}

#[test]
fn test_tuple_literal_and_index() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let tup = h.rt.types.register_tuple_type(&[int, float]);

    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "t",
                tup,
                Some(b::tuple(
                    vec![b::lit_int(5, int), b::lit_float(2.0, float)],
                    tup,
                )),
            ))),
            b::ret(b::index(
                b::ident("t", tup),
                b::mark_const(b::lit_int(0, int)),
                int,
            )),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 5);
}

#[test]
fn test_multi_value_return_destructures() {
    let mut h = Harness::new();
    let int = h.int();
    let tup = h.rt.types.register_tuple_type(&[int, int]);

    let mut ast = single_function_ast(
        "pair",
        vec![],
        tup,
        b::block(vec![b::ret_many(vec![
            b::lit_int(40, int),
            b::lit_int(2, int),
        ])]),
    );
    // var a, b = pair(); return a + b;
    let shared_init = b::call_local("pair", vec![], tup);
    ast.decls.push(Decl::Function(b::function(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::VarList(smalls_parser::ast::DeclList {
                info: Default::default(),
                decls: vec![
                    b::var_decl("a", int, Some(shared_init.clone())),
                    b::var_decl("b", int, Some(shared_init)),
                ],
            })),
            b::ret(b::binary(
                BinaryOp::Add,
                b::ident("a", int),
                b::ident("b", int),
                int,
            )),
        ]),
    )));
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 42);
}

#[test]
fn test_newtype_constructor_and_unwrap() {
    let mut h = Harness::new();
    let int = h.int();
    let feat = h.rt.types.register_newtype("Feat", int);

    // fn main(): int { var f = Feat(12); return f as int; }
    let ast = single_function_ast(
        "main",
        vec![],
        int,
        b::block(vec![
            Stmt::Decl(Decl::Var(b::var_decl(
                "f",
                feat,
                Some(b::newtype_call("Feat", b::lit_int(12, int), feat)),
            ))),
            b::ret(b::cast(b::ident("f", feat), int, int)),
        ]),
    );
    let module = h.compile("m", ast);
    assert_eq!(h.run_int(module, "main", &[]), 12);

    // The constructor is a CAST, not a call.
    let main = h.rt.module(module).get_function("main").unwrap().clone();
    assert!(main
        .instructions
        .iter()
        .all(|i| !matches!(i.opcode(), Some(Opcode::Call) | Some(Opcode::CallExt))));
}

#[test]
fn test_is_operator() {
    let mut h = Harness::new();
    let int = h.int();
    let boolean = h.boolean();
    let ast = single_function_ast(
        "main",
        vec![],
        boolean,
        b::block(vec![b::ret(b::is_type(b::lit_int(1, int), int, boolean))]),
    );
    let module = h.compile("m", ast);
    assert!(h.run_bool(module, "main", &[]));
}

#[test]
fn test_int_float_casts() {
    let mut h = Harness::new();
    let int = h.int();
    let float = h.float();
    let to_float = single_function_ast(
        "tofloat",
        vec![b::param("x", int)],
        float,
        b::block(vec![b::ret(b::cast(b::ident("x", int), float, float))]),
    );
    let module = h.compile("m", to_float);
    let three = h.rt.make_int(3);
    assert_eq!(h.run_float(module, "tofloat", &[three]), 3.0);

    let to_int = single_function_ast(
        "toint",
        vec![b::param("x", float)],
        int,
        b::block(vec![b::ret(b::cast(b::ident("x", float), int, int))]),
    );
    let module2 = h.compile("m2", to_int);
    let pi = h.rt.make_float(3.7);
    assert_eq!(h.run_int(module2, "toint", &[pi]), 3);
}
