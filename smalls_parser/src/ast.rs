//! The Smalls abstract syntax tree.
//!
//! Nodes are tagged variants rather than a class hierarchy; the compiler
//! dispatches with exhaustive matches. Every expression carries a [`NodeInfo`]
//! with its resolved type, constness, and source span. The parser produces
//! nodes with default (unresolved) info; a resolver is expected to populate
//! `type_id`, `is_const`, capture lists, intrinsic ids, and provider names
//! before the tree reaches the bytecode compiler.

use serde::{Deserialize, Serialize};

pub use crate::intrinsics::IntrinsicId;

use crate::span::Span;

/// Dense index into the runtime's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const INVALID: TypeId = TypeId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for TypeId {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Resolution metadata common to every AST node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub type_id: TypeId,
    pub is_const: bool,
    pub span: Span,
}

impl NodeInfo {
    pub fn at(span: Span) -> Self {
        Self {
            span,
            ..Self::default()
        }
    }
}

// ---- Expressions -----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Literal(LiteralExpr),
    FString(FStringExpr),
    Identifier(IdentifierExpr),
    Path(PathExpr),
    Tuple(TupleExpr),
    Grouping(GroupingExpr),
    Unary(UnaryExpr),
    Binary(BinaryExpr),
    Comparison(ComparisonExpr),
    Logical(LogicalExpr),
    Conditional(ConditionalExpr),
    Assign(AssignExpr),
    Call(CallExpr),
    Index(IndexExpr),
    Cast(CastExpr),
    BraceInit(BraceInitExpr),
    Lambda(LambdaExpr),
    Empty(NodeInfo),
}

impl Expr {
    pub fn info(&self) -> &NodeInfo {
        match self {
            Expr::Literal(e) => &e.info,
            Expr::FString(e) => &e.info,
            Expr::Identifier(e) => &e.info,
            Expr::Path(e) => &e.info,
            Expr::Tuple(e) => &e.info,
            Expr::Grouping(e) => &e.info,
            Expr::Unary(e) => &e.info,
            Expr::Binary(e) => &e.info,
            Expr::Comparison(e) => &e.info,
            Expr::Logical(e) => &e.info,
            Expr::Conditional(e) => &e.info,
            Expr::Assign(e) => &e.info,
            Expr::Call(e) => &e.info,
            Expr::Index(e) => &e.info,
            Expr::Cast(e) => &e.info,
            Expr::BraceInit(e) => &e.info,
            Expr::Lambda(e) => &e.info,
            Expr::Empty(info) => info,
        }
    }

    pub fn info_mut(&mut self) -> &mut NodeInfo {
        match self {
            Expr::Literal(e) => &mut e.info,
            Expr::FString(e) => &mut e.info,
            Expr::Identifier(e) => &mut e.info,
            Expr::Path(e) => &mut e.info,
            Expr::Tuple(e) => &mut e.info,
            Expr::Grouping(e) => &mut e.info,
            Expr::Unary(e) => &mut e.info,
            Expr::Binary(e) => &mut e.info,
            Expr::Comparison(e) => &mut e.info,
            Expr::Logical(e) => &mut e.info,
            Expr::Conditional(e) => &mut e.info,
            Expr::Assign(e) => &mut e.info,
            Expr::Call(e) => &mut e.info,
            Expr::Index(e) => &mut e.info,
            Expr::Cast(e) => &mut e.info,
            Expr::BraceInit(e) => &mut e.info,
            Expr::Lambda(e) => &mut e.info,
            Expr::Empty(info) => info,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.info().type_id
    }

    pub fn is_const(&self) -> bool {
        self.info().is_const
    }

    pub fn span(&self) -> Span {
        self.info().span
    }

    /// The identifier this expression names, looking through single-segment
    /// paths and grouping.
    pub fn as_identifier(&self) -> Option<&IdentifierExpr> {
        match self {
            Expr::Identifier(id) => Some(id),
            Expr::Path(path) if path.parts.len() == 1 => path.parts[0].as_identifier(),
            Expr::Grouping(g) => g.expr.as_identifier(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteralExpr {
    pub info: NodeInfo,
    pub value: LiteralValue,
}

/// `f"text {expr} more"`. `parts` always has one more element than `exprs`
/// (leading/trailing text pieces may be empty strings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FStringExpr {
    pub info: NodeInfo,
    pub parts: Vec<String>,
    pub exprs: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierExpr {
    pub info: NodeInfo,
    pub name: String,
}

/// `a.b.c` or `Sum::Variant`. When the resolver determines the path names a
/// sum variant (rather than a chain of field accesses) it sets
/// `is_variant_path` and the node's `type_id` to the sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathExpr {
    pub info: NodeInfo,
    pub parts: Vec<Expr>,
    pub is_variant_path: bool,
}

impl PathExpr {
    pub fn last_identifier(&self) -> Option<&IdentifierExpr> {
        self.parts.last().and_then(|p| p.as_identifier())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleExpr {
    pub info: NodeInfo,
    pub elements: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingExpr {
    pub info: NodeInfo,
    pub expr: Box<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnaryExpr {
    pub info: NodeInfo,
    pub op: UnaryOp,
    pub rhs: Box<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryExpr {
    pub info: NodeInfo,
    pub op: BinaryOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonExpr {
    pub info: NodeInfo,
    pub op: CmpOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalExpr {
    pub info: NodeInfo,
    pub op: LogicalOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalExpr {
    pub info: NodeInfo,
    pub test: Box<Expr>,
    pub true_branch: Box<Expr>,
    pub false_branch: Box<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
}

impl AssignOp {
    /// The arithmetic half of a compound assignment, if any.
    pub fn binary_op(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::AddAssign => Some(BinaryOp::Add),
            AssignOp::SubAssign => Some(BinaryOp::Sub),
            AssignOp::MulAssign => Some(BinaryOp::Mul),
            AssignOp::DivAssign => Some(BinaryOp::Div),
            AssignOp::ModAssign => Some(BinaryOp::Mod),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignExpr {
    pub info: NodeInfo,
    pub op: AssignOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallExpr {
    pub info: NodeInfo,
    pub callee: Box<Expr>,
    pub args: Vec<Expr>,
    /// Explicit type arguments as parsed (`id!(int)(…)`).
    pub type_args: Vec<TypeExpr>,
    /// Type arguments after inference; non-empty marks a generic call.
    pub inferred_type_args: Vec<TypeId>,
    /// Set when the callee is an intrinsic.
    pub intrinsic: Option<IntrinsicId>,
    /// Name of the callee's definition within the defining AST, when known.
    /// Used to fill missing trailing arguments from parameter defaults and to
    /// locate generic templates.
    pub resolved_func: Option<String>,
    /// Module that provides the callee when the call crosses modules.
    pub resolved_provider: Option<String>,
    /// Set when this "call" is actually a newtype constructor.
    pub newtype_target: TypeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexExpr {
    pub info: NodeInfo,
    pub target: Box<Expr>,
    pub index: Box<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastOp {
    /// `expr as T`
    As,
    /// `expr is T`
    Is,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastExpr {
    pub info: NodeInfo,
    pub expr: Box<Expr>,
    pub op: CastOp,
    pub target: TypeExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BraceInitKind {
    /// `{ name = value, … }` struct fields
    Field,
    /// `{ key: value, … }` maps
    KeyValue,
    /// `{ value, value, … }` arrays and positional struct init
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraceInitItem {
    pub key: Option<Expr>,
    pub value: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraceInitExpr {
    pub info: NodeInfo,
    pub ty: Option<TypeExpr>,
    pub kind: BraceInitKind,
    pub items: Vec<BraceInitItem>,
}

/// Captured variable info for closures, populated by the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedVar {
    pub name: String,
    pub type_id: TypeId,
    /// True when the enclosing function itself captures this variable, so the
    /// closure must chain through the parent's upvalue rather than a register.
    pub is_upvalue_in_parent: bool,
}

/// `fn(x: int): int { … }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaExpr {
    pub info: NodeInfo,
    pub params: Vec<VarDecl>,
    pub return_type: Option<TypeExpr>,
    pub body: Block,
    pub captures: Vec<CapturedVar>,
}

/// Parsed type name. The resolver stamps `info.type_id` with the canonical
/// runtime type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeExpr {
    pub info: NodeInfo,
    pub name: String,
    pub params: Vec<TypeExpr>,
    /// `T[N]` fixed arrays.
    pub fixed_size: Option<i32>,
    /// `fn(T…): R` function types; `params` holds the parameter types.
    pub is_function: bool,
    pub return_type: Option<Box<TypeExpr>>,
}

impl TypeExpr {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            info: NodeInfo::default(),
            name: name.into(),
            params: Vec::new(),
            fixed_size: None,
            is_function: false,
            return_type: None,
        }
    }
}

// ---- Statements ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    Block(Block),
    Empty(NodeInfo),
    Expr(ExprStmt),
    If(IfStmt),
    For(ForStmt),
    ForEach(ForEachStmt),
    Jump(JumpStmt),
    Label(LabelStmt),
    Switch(SwitchStmt),
    Decl(Decl),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Block {
    pub info: NodeInfo,
    pub nodes: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExprStmt {
    pub info: NodeInfo,
    pub expr: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfStmt {
    pub info: NodeInfo,
    pub cond: Expr,
    pub then_block: Block,
    pub else_block: Option<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForStmt {
    pub info: NodeInfo,
    pub init: Option<Box<Stmt>>,
    pub check: Option<Expr>,
    pub inc: Option<Expr>,
    pub block: Block,
}

/// `for (x in arr)` or `for (k, v in map)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachStmt {
    pub info: NodeInfo,
    pub var: Option<VarDecl>,
    pub key_var: Option<VarDecl>,
    pub value_var: Option<VarDecl>,
    pub collection: Expr,
    pub block: Block,
    pub is_map_iteration: bool,
    pub element_type: TypeId,
    pub key_type: TypeId,
    pub value_type: TypeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpKind {
    Return,
    Break,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpStmt {
    pub info: NodeInfo,
    pub kind: JumpKind,
    /// Return values; more than one builds a tuple.
    pub exprs: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelKind {
    Case,
    Default,
}

/// `case expr:` / `case Variant(x):` / `default:` inside a switch body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelStmt {
    pub info: NodeInfo,
    pub kind: LabelKind,
    pub expr: Option<Expr>,
    pub bindings: Vec<VarDecl>,
    pub is_pattern_match: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchStmt {
    pub info: NodeInfo,
    pub target: Expr,
    pub block: Block,
}

// ---- Declarations ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Decl {
    Function(FunctionDef),
    Struct(StructDecl),
    Sum(SumDecl),
    Var(VarDecl),
    VarList(DeclList),
    TypeAlias(TypeAliasDecl),
    Newtype(NewtypeDecl),
    Opaque(OpaqueTypeDecl),
    ImportAliased(AliasedImportDecl),
    ImportSelective(SelectiveImportDecl),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub args: Vec<Expr>,
    pub span: Span,
}

pub fn has_annotation(annotations: &[Annotation], name: &str) -> bool {
    annotations.iter().any(|a| a.name == name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub info: NodeInfo,
    pub name: String,
    pub params: Vec<VarDecl>,
    pub return_type: Option<TypeExpr>,
    pub block: Option<Block>,
    pub type_params: Vec<String>,
    pub annotations: Vec<Annotation>,
}

impl FunctionDef {
    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDecl {
    pub info: NodeInfo,
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
    pub annotations: Vec<Annotation>,
}

/// Comma-separated declaration list, e.g. `var a, b = pair();`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclList {
    pub info: NodeInfo,
    pub decls: Vec<VarDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDecl {
    pub info: NodeInfo,
    pub name: String,
    pub fields: Vec<VarDecl>,
    pub type_params: Vec<String>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantDecl {
    pub info: NodeInfo,
    pub name: String,
    pub payload: Option<TypeExpr>,
}

impl VariantDecl {
    pub fn is_unit(&self) -> bool {
        self.payload.is_none()
    }
}

/// `type R = Ok(int) | Err(string);`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SumDecl {
    pub info: NodeInfo,
    pub name: String,
    pub variants: Vec<VariantDecl>,
    pub type_params: Vec<String>,
    pub annotations: Vec<Annotation>,
}

/// `type Gold = int;`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeAliasDecl {
    pub info: NodeInfo,
    pub name: String,
    pub aliased: TypeExpr,
}

/// `type Feat(int);`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewtypeDecl {
    pub info: NodeInfo,
    pub name: String,
    pub wrapped: TypeExpr,
}

/// `type Name;`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaqueTypeDecl {
    pub info: NodeInfo,
    pub name: String,
}

/// `import core.math.vector as vec;`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasedImportDecl {
    pub info: NodeInfo,
    pub module_path: String,
    pub alias: String,
}

/// `from core.math.vector import { A, B };`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectiveImportDecl {
    pub info: NodeInfo,
    pub module_path: String,
    pub symbols: Vec<String>,
}

/// A source comment kept for tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub text: String,
    pub span: Span,
}

/// One parsed compilation unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ast {
    pub decls: Vec<Decl>,
    pub comments: Vec<Comment>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locate a top-level function definition by name.
    pub fn find_function(&self, name: &str) -> Option<&FunctionDef> {
        self.decls.iter().find_map(|d| match d {
            Decl::Function(f) if f.name == name => Some(f),
            _ => None,
        })
    }

    /// Debug dump of the tree as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
