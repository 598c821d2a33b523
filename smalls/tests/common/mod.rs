//! Shared harness for the integration suites: owns a runtime, a context,
//! and a VM, and compiles resolved ASTs built with the parser crate's
//! testing builders.

use std::rc::Rc;

use smalls::compile::{compile_module, CompileError};
use smalls::runtime::{ModuleId, Runtime};
use smalls::vm::VirtualMachine;
use smalls::{Context, TypeId, Value};
use smalls_parser::ast::Ast;

pub struct Harness {
    pub rt: Runtime,
    pub ctx: Context,
    pub vm: VirtualMachine,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self {
            rt: Runtime::new(),
            ctx: Context::default(),
            vm: VirtualMachine::new(),
        }
    }

    pub fn int(&self) -> TypeId {
        self.rt.int_type()
    }

    pub fn float(&self) -> TypeId {
        self.rt.float_type()
    }

    pub fn boolean(&self) -> TypeId {
        self.rt.bool_type()
    }

    pub fn string(&self) -> TypeId {
        self.rt.string_type()
    }

    pub fn void(&self) -> TypeId {
        self.rt.void_type()
    }

    /// Compile and install a module; panics on compile errors.
    pub fn compile(&mut self, name: &str, ast: Ast) -> ModuleId {
        let module = match compile_module(name, &ast, &mut self.rt, &self.ctx) {
            Ok(module) => module,
            Err(err) => panic!("compilation of {} failed: {}", name, err),
        };
        self.rt.add_module(module, Some(Rc::new(ast)))
    }

    pub fn compile_err(&mut self, name: &str, ast: &Ast) -> CompileError {
        match compile_module(name, ast, &mut self.rt, &self.ctx) {
            Ok(_) => panic!("expected compilation of {} to fail", name),
            Err(err) => err,
        }
    }

    /// Run a function and assert the VM did not fail.
    pub fn run(&mut self, module: ModuleId, func: &str, args: &[Value]) -> Value {
        let result = self.vm.execute(&mut self.rt, module, func, args, 0);
        assert!(
            !self.vm.failed(),
            "vm failed running {}: {}",
            func,
            self.vm.error_message()
        );
        result
    }

    pub fn run_int(&mut self, module: ModuleId, func: &str, args: &[Value]) -> i32 {
        let result = self.run(module, func, args);
        result
            .as_int()
            .unwrap_or_else(|| panic!("expected int result from {}, got {:?}", func, result))
    }

    pub fn run_float(&mut self, module: ModuleId, func: &str, args: &[Value]) -> f32 {
        let result = self.run(module, func, args);
        result
            .as_float()
            .unwrap_or_else(|| panic!("expected float result from {}, got {:?}", func, result))
    }

    pub fn run_bool(&mut self, module: ModuleId, func: &str, args: &[Value]) -> bool {
        let result = self.run(module, func, args);
        result
            .as_bool()
            .unwrap_or_else(|| panic!("expected bool result from {}, got {:?}", func, result))
    }

    pub fn run_string(&mut self, module: ModuleId, func: &str, args: &[Value]) -> String {
        let result = self.run(module, func, args);
        let ptr = result
            .heap_ptr()
            .unwrap_or_else(|| panic!("expected string result from {}, got {:?}", func, result));
        self.rt.get_string_view(ptr).to_string()
    }

    /// Run a function expecting a VM failure; returns the error message.
    pub fn run_expect_fail(&mut self, module: ModuleId, func: &str, args: &[Value]) -> String {
        let result = self.vm.execute(&mut self.rt, module, func, args, 0);
        assert!(
            self.vm.failed(),
            "expected {} to fail but it returned {:?}",
            func,
            result
        );
        assert!(!result.is_valid(), "failed execution must yield an invalid value");
        self.vm.error_message().to_string()
    }
}

/// One-function module: `fn <name>(): <ret> { body }`.
#[allow(dead_code)]
pub fn single_function_ast(
    name: &str,
    params: Vec<smalls_parser::ast::VarDecl>,
    return_tid: TypeId,
    body: smalls_parser::ast::Block,
) -> Ast {
    use smalls_parser::ast::Decl;
    use smalls_parser::builders as b;
    let mut ast = Ast::new();
    ast.decls
        .push(Decl::Function(b::function(name, params, return_tid, body)));
    ast
}
