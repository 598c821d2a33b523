//! Lexer and parser for the Smalls scripting language.
//!
//! The crate turns source text into an [`ast::Ast`]. Resolution slots on the
//! tree (`type_id`, `is_const`, captures, intrinsic ids) are produced with
//! defaults and populated by a resolver before compilation.
//!
//! ```
//! let ast = smalls_parser::parse("fn main(): int { return 40 + 2; }").unwrap();
//! assert!(ast.find_function("main").is_some());
//! ```

pub mod ast;
#[cfg(any(test, feature = "testing"))]
pub mod builders;
pub mod error;
pub mod intrinsics;
pub mod lexer;
pub mod parser;
pub mod span;
pub mod token;

pub use ast::{Ast, TypeId};
pub use error::{ParseError, ParseErrors, ParseResult};
pub use intrinsics::{intrinsic_id_from_string, intrinsic_name, IntrinsicId};
pub use lexer::Lexer;
pub use parser::{parse, parse_expression};
pub use span::{SourceMap, Span};
pub use token::Token;
