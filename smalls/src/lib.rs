//! The Smalls scripting core: bytecode compiler, verifier, and register VM.
//!
//! The pipeline runs source text → tokens → AST (produced by the
//! [`smalls_parser`] crate and resolved externally) → [`compile`] →
//! [`bytecode::BytecodeModule`] → [`verifier`] → [`vm::VirtualMachine`].
//! The [`runtime::Runtime`] supplies the type table, the garbage-collected
//! heap, script operators, the module directory, and generic instantiation;
//! the compiler consults it while lowering and the VM on every allocation,
//! cross-boundary field access, external call, and GC root walk.

pub mod bytecode;
pub mod compile;
pub mod context;
pub mod runtime;
pub mod verifier;
pub mod vm;

pub use smalls_parser::ast;
pub use smalls_parser::intrinsics::{intrinsic_id_from_string, intrinsic_name, IntrinsicId};
pub use smalls_parser::TypeId;

pub use bytecode::{BytecodeModule, CompiledFunction, Instruction, Opcode};
pub use compile::{compile_module, CompileError, Compiler};
pub use context::{Context, DebugLevel, Limits};
pub use runtime::value::{HeapPtr, ObjectHandle, Value, ValueRepr, ValueStorage};
pub use runtime::{ModuleId, Runtime};
pub use verifier::verify_bytecode_module;
pub use vm::VirtualMachine;
