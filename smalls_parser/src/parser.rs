//! Recursive-descent parser for Smalls.
//!
//! Produces an [`Ast`] whose resolution slots (`type_id`, `is_const`,
//! captures, intrinsic ids) are left at their defaults for a resolver to
//! fill in.

use crate::ast::*;
use crate::error::{ParseError, ParseErrors, ParseResult};
use crate::lexer::{unescape_string, Lexer, SpannedToken};
use crate::span::Span;
use crate::token::Token;

/// Parse a full compilation unit.
pub fn parse(source: &str) -> Result<Ast, ParseErrors> {
    let mut parser = Parser::new(source)?;
    parser.parse_program()
}

/// Parse a single expression (used for f-string interpolations and tests).
pub fn parse_expression(source: &str) -> ParseResult<Expr> {
    let mut parser = Parser::new(source).map_err(|e| {
        e.take()
            .pop()
            .unwrap_or_else(|| ParseError::unexpected_eof("expression", Span::empty()))
    })?;
    parser.parse_expr()
}

struct Parser<'a> {
    tokens: Vec<SpannedToken<'a>>,
    pos: usize,
    errors: ParseErrors,
    /// Suppresses `Ident { … }` brace-init parsing (switch targets).
    no_brace_init: bool,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, ParseErrors> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        let mut errors = ParseErrors::new();
        while let Some(result) = lexer.next_token() {
            match result {
                Ok(tok) => tokens.push(tok),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            tokens,
            pos: 0,
            errors: ParseErrors::new(),
            no_brace_init: false,
        })
    }

    // ---- token plumbing ----------------------------------------------------

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).map(|t| t.token)
    }

    fn peek_at(&self, n: usize) -> Option<Token> {
        self.tokens.get(self.pos + n).map(|t| t.token)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| t.span)
            .or_else(|| self.tokens.last().map(|t| t.span))
            .unwrap_or_default()
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.span)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> ParseResult<SpannedToken<'a>> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ParseError::unexpected_eof("token", self.eof_span()))?;
        self.pos += 1;
        Ok(tok)
    }

    fn eof_span(&self) -> Span {
        self.tokens.last().map(|t| t.span).unwrap_or_default()
    }

    fn check(&self, token: Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, expected: &str) -> ParseResult<SpannedToken<'a>> {
        match self.tokens.get(self.pos) {
            Some(t) if t.token == token => {
                self.pos += 1;
                Ok(self.tokens[self.pos - 1].clone())
            }
            Some(t) => Err(ParseError::unexpected_token(
                t.token.describe(),
                expected,
                t.span,
            )),
            None => Err(ParseError::unexpected_eof(expected, self.eof_span())),
        }
    }

    fn expect_identifier(&mut self, expected: &str) -> ParseResult<(String, Span)> {
        let tok = self.expect(Token::Identifier, expected)?;
        Ok((tok.text.to_string(), tok.span))
    }

    /// Skip to the next statement boundary after an error.
    fn synchronize(&mut self) {
        while let Some(tok) = self.peek() {
            self.pos += 1;
            if tok == Token::Semicolon || tok == Token::BraceClose {
                return;
            }
        }
    }

    // ---- program / declarations --------------------------------------------

    fn parse_program(&mut self) -> Result<Ast, ParseErrors> {
        let mut ast = Ast::new();
        while self.peek().is_some() {
            match self.parse_decl() {
                Ok(decl) => ast.decls.push(decl),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        if self.errors.is_empty() {
            Ok(ast)
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn parse_annotations(&mut self) -> ParseResult<Vec<Annotation>> {
        let mut annotations = Vec::new();
        while self.check(Token::AnnotationOpen) {
            let open = self.advance()?;
            let (name, _) = self.expect_identifier("annotation name")?;
            let mut args = Vec::new();
            if self.eat(Token::ParenOpen) {
                while !self.check(Token::ParenClose) {
                    args.push(self.parse_expr()?);
                    if !self.eat(Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::ParenClose, "')'")?;
            }
            let close = self.expect(Token::AnnotationClose, "']]'")?;
            annotations.push(Annotation {
                name,
                args,
                span: open.span.merge(&close.span),
            });
        }
        Ok(annotations)
    }

    fn parse_decl(&mut self) -> ParseResult<Decl> {
        let annotations = self.parse_annotations()?;
        match self.peek() {
            Some(Token::KwVar) | Some(Token::KwConst) => self.parse_var_decl_stmt(annotations),
            Some(Token::KwFn) | Some(Token::KwExtern) => self.parse_function(annotations),
            Some(Token::KwType) => self.parse_type_decl(annotations),
            Some(Token::KwImport) => self.parse_aliased_import(),
            Some(Token::KwFrom) => self.parse_selective_import(),
            Some(other) => Err(ParseError::unexpected_token(
                other.describe(),
                "declaration",
                self.current_span(),
            )),
            None => Err(ParseError::unexpected_eof("declaration", self.eof_span())),
        }
    }

    /// `var a = 1;` / `const b: int = 2;` / `var a, b = pair();`
    fn parse_var_decl_stmt(&mut self, annotations: Vec<Annotation>) -> ParseResult<Decl> {
        let kw = self.advance()?;
        let is_const = kw.token == Token::KwConst;

        let mut decls = Vec::new();
        loop {
            let (name, name_span) = self.expect_identifier("variable name")?;
            let ty = if self.eat(Token::Colon) {
                Some(self.parse_type()?)
            } else {
                None
            };
            decls.push(VarDecl {
                info: NodeInfo {
                    is_const,
                    ..NodeInfo::at(kw.span.merge(&name_span))
                },
                name,
                ty,
                init: None,
                annotations: annotations.clone(),
            });
            if !self.eat(Token::Comma) {
                break;
            }
        }

        let init = if self.eat(Token::Eq) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(Token::Semicolon, "';'")?;

        if decls.len() == 1 {
            let mut decl = decls.pop().expect("one decl");
            decl.init = init;
            Ok(Decl::Var(decl))
        } else {
            // A shared initializer is tuple destructuring; each decl aliases it.
            for decl in &mut decls {
                decl.init = init.clone();
            }
            let span = kw.span.merge(&self.prev_span());
            Ok(Decl::VarList(DeclList {
                info: NodeInfo::at(span),
                decls,
            }))
        }
    }

    /// `fn name(params): ret { … }` with optional `!(T, U)` type parameters
    /// and an optional `extern` prefix for bodiless native declarations.
    fn parse_function(&mut self, mut annotations: Vec<Annotation>) -> ParseResult<Decl> {
        let is_extern = self.eat(Token::KwExtern);
        let kw = self.expect(Token::KwFn, "'fn'")?;
        let (name, _) = self.expect_identifier("function name")?;

        let mut type_params = Vec::new();
        if self.eat(Token::Not) {
            self.expect(Token::ParenOpen, "'('")?;
            while !self.check(Token::ParenClose) {
                let (param, _) = self.expect_identifier("type parameter")?;
                type_params.push(param);
                if !self.eat(Token::Comma) {
                    break;
                }
            }
            self.expect(Token::ParenClose, "')'")?;
        }

        let params = self.parse_params()?;
        let return_type = if self.eat(Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let block = if is_extern {
            self.expect(Token::Semicolon, "';'")?;
            if !has_annotation(&annotations, "native") {
                annotations.push(Annotation {
                    name: "native".into(),
                    args: Vec::new(),
                    span: kw.span,
                });
            }
            None
        } else {
            Some(self.parse_block()?)
        };

        Ok(Decl::Function(FunctionDef {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            name,
            params,
            return_type,
            block,
            type_params,
            annotations,
        }))
    }

    fn parse_params(&mut self) -> ParseResult<Vec<VarDecl>> {
        self.expect(Token::ParenOpen, "'('")?;
        let mut params = Vec::new();
        while !self.check(Token::ParenClose) {
            let (name, name_span) = self.expect_identifier("parameter name")?;
            let ty = if self.eat(Token::Colon) {
                Some(self.parse_type()?)
            } else {
                None
            };
            let init = if self.eat(Token::Eq) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(VarDecl {
                info: NodeInfo::at(name_span),
                name,
                ty,
                init,
                annotations: Vec::new(),
            });
            if !self.eat(Token::Comma) {
                break;
            }
        }
        self.expect(Token::ParenClose, "')'")?;
        Ok(params)
    }

    /// All `type` declarations: opaque, newtype, alias, struct, sum.
    fn parse_type_decl(&mut self, annotations: Vec<Annotation>) -> ParseResult<Decl> {
        let kw = self.expect(Token::KwType, "'type'")?;
        let (name, _) = self.expect_identifier("type name")?;

        let mut type_params = Vec::new();
        if self.eat(Token::Not) {
            self.expect(Token::ParenOpen, "'('")?;
            while !self.check(Token::ParenClose) {
                let (param, _) = self.expect_identifier("type parameter")?;
                type_params.push(param);
                if !self.eat(Token::Comma) {
                    break;
                }
            }
            self.expect(Token::ParenClose, "')'")?;
        }

        // `type Name;` — opaque
        if self.eat(Token::Semicolon) {
            return Ok(Decl::Opaque(OpaqueTypeDecl {
                info: NodeInfo::at(kw.span.merge(&self.prev_span())),
                name,
            }));
        }

        // `type Name(int);` — newtype
        if self.eat(Token::ParenOpen) {
            let wrapped = self.parse_type()?;
            self.expect(Token::ParenClose, "')'")?;
            self.expect(Token::Semicolon, "';'")?;
            return Ok(Decl::Newtype(NewtypeDecl {
                info: NodeInfo::at(kw.span.merge(&self.prev_span())),
                name,
                wrapped,
            }));
        }

        self.expect(Token::Eq, "'='")?;

        // `type Name = struct { … };`
        if self.check(Token::Identifier) && self.tokens[self.pos].text == "struct" {
            self.pos += 1;
            self.expect(Token::BraceOpen, "'{'")?;
            let mut fields = Vec::new();
            while !self.check(Token::BraceClose) {
                let (fname, fspan) = self.expect_identifier("field name")?;
                self.expect(Token::Colon, "':'")?;
                let fty = self.parse_type()?;
                fields.push(VarDecl {
                    info: NodeInfo::at(fspan),
                    name: fname,
                    ty: Some(fty),
                    init: None,
                    annotations: Vec::new(),
                });
                if !self.eat(Token::Comma) {
                    break;
                }
            }
            self.expect(Token::BraceClose, "'}'")?;
            self.expect(Token::Semicolon, "';'")?;
            return Ok(Decl::Struct(StructDecl {
                info: NodeInfo::at(kw.span.merge(&self.prev_span())),
                name,
                fields,
                type_params,
                annotations,
            }));
        }

        // Sum when the right side is `Variant(payload)?` alternatives.
        if self.looks_like_sum() {
            let mut variants = Vec::new();
            loop {
                let (vname, vspan) = self.expect_identifier("variant name")?;
                let payload = if self.eat(Token::ParenOpen) {
                    let p = self.parse_type()?;
                    self.expect(Token::ParenClose, "')'")?;
                    Some(p)
                } else {
                    None
                };
                variants.push(VariantDecl {
                    info: NodeInfo::at(vspan),
                    name: vname,
                    payload,
                });
                if !self.eat(Token::Pipe) {
                    break;
                }
            }
            self.expect(Token::Semicolon, "';'")?;
            return Ok(Decl::Sum(SumDecl {
                info: NodeInfo::at(kw.span.merge(&self.prev_span())),
                name,
                variants,
                type_params,
                annotations,
            }));
        }

        // `type Gold = int;` — alias
        let aliased = self.parse_type()?;
        self.expect(Token::Semicolon, "';'")?;
        Ok(Decl::TypeAlias(TypeAliasDecl {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            name,
            aliased,
        }))
    }

    /// After `type N =`, decide between a sum body and a plain alias.
    fn looks_like_sum(&self) -> bool {
        if self.peek() != Some(Token::Identifier) {
            return false;
        }
        match self.peek_at(1) {
            Some(Token::Pipe) => true,
            Some(Token::ParenOpen) => {
                // `Ident(type)` then `|` or `;` is a payload variant.
                let mut depth = 0usize;
                let mut i = 1;
                while let Some(tok) = self.peek_at(i) {
                    match tok {
                        Token::ParenOpen => depth += 1,
                        Token::ParenClose => {
                            depth -= 1;
                            if depth == 0 {
                                return matches!(
                                    self.peek_at(i + 1),
                                    Some(Token::Pipe) | Some(Token::Semicolon)
                                );
                            }
                        }
                        Token::Semicolon => return false,
                        _ => {}
                    }
                    i += 1;
                }
                false
            }
            _ => false,
        }
    }

    fn parse_module_path(&mut self) -> ParseResult<String> {
        let (first, _) = self.expect_identifier("module path")?;
        let mut path = first;
        while self.eat(Token::Dot) {
            let (seg, _) = self.expect_identifier("module path segment")?;
            path.push('.');
            path.push_str(&seg);
        }
        Ok(path)
    }

    fn parse_aliased_import(&mut self) -> ParseResult<Decl> {
        let kw = self.expect(Token::KwImport, "'import'")?;
        let module_path = self.parse_module_path()?;
        let alias = if self.eat(Token::KwAs) {
            self.expect_identifier("import alias")?.0
        } else {
            module_path
                .rsplit('.')
                .next()
                .unwrap_or(&module_path)
                .to_string()
        };
        self.expect(Token::Semicolon, "';'")?;
        Ok(Decl::ImportAliased(AliasedImportDecl {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            module_path,
            alias,
        }))
    }

    fn parse_selective_import(&mut self) -> ParseResult<Decl> {
        let kw = self.expect(Token::KwFrom, "'from'")?;
        let module_path = self.parse_module_path()?;
        self.expect(Token::KwImport, "'import'")?;
        self.expect(Token::BraceOpen, "'{'")?;
        let mut symbols = Vec::new();
        while !self.check(Token::BraceClose) {
            symbols.push(self.expect_identifier("imported symbol")?.0);
            if !self.eat(Token::Comma) {
                break;
            }
        }
        self.expect(Token::BraceClose, "'}'")?;
        self.expect(Token::Semicolon, "';'")?;
        Ok(Decl::ImportSelective(SelectiveImportDecl {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            module_path,
            symbols,
        }))
    }

    // ---- types -------------------------------------------------------------

    fn parse_type(&mut self) -> ParseResult<TypeExpr> {
        // `fn(T, U): R`
        if self.eat(Token::KwFn) {
            let start = self.prev_span();
            self.expect(Token::ParenOpen, "'('")?;
            let mut params = Vec::new();
            while !self.check(Token::ParenClose) {
                params.push(self.parse_type()?);
                if !self.eat(Token::Comma) {
                    break;
                }
            }
            self.expect(Token::ParenClose, "')'")?;
            let return_type = if self.eat(Token::Colon) {
                Some(Box::new(self.parse_type()?))
            } else {
                None
            };
            return Ok(TypeExpr {
                info: NodeInfo::at(start.merge(&self.prev_span())),
                name: String::new(),
                params,
                fixed_size: None,
                is_function: true,
                return_type,
            });
        }

        // `{K: V}` map type
        if self.eat(Token::BraceOpen) {
            let start = self.prev_span();
            let key = self.parse_type()?;
            self.expect(Token::Colon, "':'")?;
            let value = self.parse_type()?;
            self.expect(Token::BraceClose, "'}'")?;
            return Ok(TypeExpr {
                info: NodeInfo::at(start.merge(&self.prev_span())),
                name: "{}".into(),
                params: vec![key, value],
                fixed_size: None,
                is_function: false,
                return_type: None,
            });
        }

        let (first, start) = self.expect_identifier("type name")?;
        let mut name = first;
        while self.eat(Token::Dot) {
            let (seg, _) = self.expect_identifier("type path segment")?;
            name.push('.');
            name.push_str(&seg);
        }

        let mut ty = TypeExpr {
            info: NodeInfo::at(start.merge(&self.prev_span())),
            name,
            params: Vec::new(),
            fixed_size: None,
            is_function: false,
            return_type: None,
        };

        // `T[N]` fixed arrays and `T[]` dynamic arrays; suffixes stack.
        while self.eat(Token::BracketOpen) {
            if self.eat(Token::BracketClose) {
                ty = TypeExpr {
                    info: NodeInfo::at(start.merge(&self.prev_span())),
                    name: "[]".into(),
                    params: vec![ty],
                    fixed_size: None,
                    is_function: false,
                    return_type: None,
                };
            } else {
                let size_tok = self.expect(Token::IntegerLiteral, "array size")?;
                let size = parse_int_literal(size_tok.text, size_tok.span)?;
                self.expect(Token::BracketClose, "']'")?;
                ty = TypeExpr {
                    info: NodeInfo::at(start.merge(&self.prev_span())),
                    name: "[N]".into(),
                    params: vec![ty],
                    fixed_size: Some(size),
                    is_function: false,
                    return_type: None,
                };
            }
        }
        Ok(ty)
    }

    // ---- statements --------------------------------------------------------

    fn parse_block(&mut self) -> ParseResult<Block> {
        let open = self.expect(Token::BraceOpen, "'{'")?;
        let mut nodes = Vec::new();
        while !self.check(Token::BraceClose) {
            if self.peek().is_none() {
                return Err(ParseError::unexpected_eof("'}'", self.eof_span()));
            }
            nodes.push(self.parse_stmt()?);
        }
        let close = self.expect(Token::BraceClose, "'}'")?;
        Ok(Block {
            info: NodeInfo::at(open.span.merge(&close.span)),
            nodes,
        })
    }

    fn parse_stmt(&mut self) -> ParseResult<Stmt> {
        match self.peek() {
            Some(Token::BraceOpen) => Ok(Stmt::Block(self.parse_block()?)),
            Some(Token::Semicolon) => {
                let span = self.current_span();
                self.pos += 1;
                Ok(Stmt::Empty(NodeInfo::at(span)))
            }
            Some(Token::KwVar) | Some(Token::KwConst) => {
                Ok(Stmt::Decl(self.parse_var_decl_stmt(Vec::new())?))
            }
            Some(Token::KwIf) => self.parse_if(),
            Some(Token::KwFor) => self.parse_for(),
            Some(Token::KwSwitch) => self.parse_switch(),
            Some(Token::KwReturn) => {
                let kw = self.advance()?;
                let mut exprs = Vec::new();
                if !self.check(Token::Semicolon) {
                    exprs.push(self.parse_expr()?);
                    while self.eat(Token::Comma) {
                        exprs.push(self.parse_expr()?);
                    }
                }
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Jump(JumpStmt {
                    info: NodeInfo::at(kw.span.merge(&self.prev_span())),
                    kind: JumpKind::Return,
                    exprs,
                }))
            }
            Some(Token::KwBreak) => {
                let kw = self.advance()?;
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Jump(JumpStmt {
                    info: NodeInfo::at(kw.span),
                    kind: JumpKind::Break,
                    exprs: Vec::new(),
                }))
            }
            Some(Token::KwContinue) => {
                let kw = self.advance()?;
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Jump(JumpStmt {
                    info: NodeInfo::at(kw.span),
                    kind: JumpKind::Continue,
                    exprs: Vec::new(),
                }))
            }
            Some(Token::KwCase) | Some(Token::KwDefault) => self.parse_label(),
            _ => {
                let expr = self.parse_expr()?;
                let span = expr.span();
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Expr(ExprStmt {
                    info: NodeInfo::at(span),
                    expr,
                }))
            }
        }
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let kw = self.expect(Token::KwIf, "'if'")?;
        self.expect(Token::ParenOpen, "'('")?;
        let cond = self.parse_expr()?;
        self.expect(Token::ParenClose, "')'")?;
        let then_block = self.parse_block()?;
        let else_block = if self.eat(Token::KwElse) {
            if self.check(Token::KwIf) {
                // else-if chains nest as a single-statement block
                let nested = self.parse_if()?;
                let span = self.prev_span();
                Some(Block {
                    info: NodeInfo::at(span),
                    nodes: vec![nested],
                })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Stmt::If(IfStmt {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            cond,
            then_block,
            else_block,
        }))
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let kw = self.expect(Token::KwFor, "'for'")?;
        self.expect(Token::ParenOpen, "'('")?;

        if let Some(stmt) = self.try_parse_foreach(kw.span)? {
            return Ok(stmt);
        }

        let init = if self.eat(Token::Semicolon) {
            None
        } else if self.check(Token::KwVar) || self.check(Token::KwConst) {
            Some(Box::new(Stmt::Decl(self.parse_var_decl_stmt(Vec::new())?)))
        } else {
            let expr = self.parse_expr()?;
            let span = expr.span();
            self.expect(Token::Semicolon, "';'")?;
            Some(Box::new(Stmt::Expr(ExprStmt {
                info: NodeInfo::at(span),
                expr,
            })))
        };

        let check = if self.check(Token::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Token::Semicolon, "';'")?;

        let inc = if self.check(Token::ParenClose) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Token::ParenClose, "')'")?;

        let block = self.parse_block()?;
        Ok(Stmt::For(ForStmt {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            init,
            check,
            inc,
            block,
        }))
    }

    /// Detect `for (x in …)` / `for (var x in …)` / `for (k, v in …)` after
    /// the opening parenthesis. Returns None (without consuming) for C-style
    /// loops.
    fn try_parse_foreach(&mut self, kw_span: Span) -> ParseResult<Option<Stmt>> {
        let saved = self.pos;
        self.eat(Token::KwVar);

        let mut names = Vec::new();
        loop {
            if !self.check(Token::Identifier) {
                self.pos = saved;
                return Ok(None);
            }
            let tok = self.advance()?;
            names.push((tok.text.to_string(), tok.span));
            if !self.eat(Token::Comma) {
                break;
            }
        }

        if !self.eat(Token::KwIn) {
            self.pos = saved;
            return Ok(None);
        }

        let collection = self.parse_expr()?;
        self.expect(Token::ParenClose, "')'")?;
        let block = self.parse_block()?;

        let make_decl = |(name, span): (String, Span)| VarDecl {
            info: NodeInfo::at(span),
            name,
            ty: None,
            init: None,
            annotations: Vec::new(),
        };

        let (var, key_var, value_var, is_map) = match names.len() {
            1 => (Some(make_decl(names.remove(0))), None, None, false),
            2 => {
                let key = make_decl(names.remove(0));
                let value = make_decl(names.remove(0));
                (None, Some(key), Some(value), true)
            }
            _ => {
                return Err(ParseError::invalid_syntax(
                    "for-each expects one or two loop variables",
                    kw_span,
                ))
            }
        };

        Ok(Some(Stmt::ForEach(ForEachStmt {
            info: NodeInfo::at(kw_span.merge(&self.prev_span())),
            var,
            key_var,
            value_var,
            collection,
            block,
            is_map_iteration: is_map,
            element_type: TypeId::INVALID,
            key_type: TypeId::INVALID,
            value_type: TypeId::INVALID,
        })))
    }

    fn parse_switch(&mut self) -> ParseResult<Stmt> {
        let kw = self.expect(Token::KwSwitch, "'switch'")?;
        let target = if self.eat(Token::ParenOpen) {
            let t = self.parse_expr()?;
            self.expect(Token::ParenClose, "')'")?;
            t
        } else {
            let prev = self.no_brace_init;
            self.no_brace_init = true;
            let t = self.parse_expr();
            self.no_brace_init = prev;
            t?
        };
        let block = self.parse_block()?;
        Ok(Stmt::Switch(SwitchStmt {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            target,
            block,
        }))
    }

    fn parse_label(&mut self) -> ParseResult<Stmt> {
        let kw = self.advance()?;
        if kw.token == Token::KwDefault {
            self.expect(Token::Colon, "':'")?;
            return Ok(Stmt::Label(LabelStmt {
                info: NodeInfo::at(kw.span),
                kind: LabelKind::Default,
                expr: None,
                bindings: Vec::new(),
                is_pattern_match: false,
            }));
        }

        let expr = self.parse_expr()?;
        self.expect(Token::Colon, "':'")?;

        // `case Ok(x):` parses as a call with bare-identifier arguments;
        // rewrite it into a pattern with bindings.
        let (expr, bindings, is_pattern) = match expr {
            Expr::Call(call) if call.args.iter().all(|a| a.as_identifier().is_some()) => {
                let bindings = call
                    .args
                    .iter()
                    .map(|a| {
                        let ident = a.as_identifier().expect("checked above");
                        VarDecl {
                            info: NodeInfo::at(ident.info.span),
                            name: ident.name.clone(),
                            ty: None,
                            init: None,
                            annotations: Vec::new(),
                        }
                    })
                    .collect();
                (*call.callee, bindings, true)
            }
            other => (other, Vec::new(), false),
        };

        Ok(Stmt::Label(LabelStmt {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            kind: LabelKind::Case,
            expr: Some(expr),
            bindings,
            is_pattern_match: is_pattern,
        }))
    }

    // ---- expressions -------------------------------------------------------

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> ParseResult<Expr> {
        let lhs = self.parse_conditional()?;

        let op = match self.peek() {
            Some(Token::Eq) => AssignOp::Assign,
            Some(Token::PlusEq) => AssignOp::AddAssign,
            Some(Token::MinusEq) => AssignOp::SubAssign,
            Some(Token::TimesEq) => AssignOp::MulAssign,
            Some(Token::DivEq) => AssignOp::DivAssign,
            Some(Token::ModEq) => AssignOp::ModAssign,
            _ => return Ok(lhs),
        };
        self.pos += 1;

        let rhs = self.parse_assignment()?;
        let span = lhs.span().merge(&rhs.span());
        Ok(Expr::Assign(AssignExpr {
            info: NodeInfo::at(span),
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }))
    }

    fn parse_conditional(&mut self) -> ParseResult<Expr> {
        let test = self.parse_logical_or()?;
        if !self.eat(Token::Question) {
            return Ok(test);
        }
        let true_branch = self.parse_expr()?;
        self.expect(Token::Colon, "':'")?;
        let false_branch = self.parse_conditional()?;
        let span = test.span().merge(&false_branch.span());
        Ok(Expr::Conditional(ConditionalExpr {
            info: NodeInfo::at(span),
            test: Box::new(test),
            true_branch: Box::new(true_branch),
            false_branch: Box::new(false_branch),
        }))
    }

    fn parse_logical_or(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_logical_and()?;
        while self.eat(Token::OrOr) {
            let rhs = self.parse_logical_and()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Logical(LogicalExpr {
                info: NodeInfo::at(span),
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_logical_and(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(Token::AndAnd) {
            let rhs = self.parse_comparison()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Logical(LogicalExpr {
                info: NodeInfo::at(span),
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::Ne,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::LtEq) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::GtEq) => CmpOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Comparison(ComparisonExpr {
                info: NodeInfo::at(span),
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                info: NodeInfo::at(span),
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Times) => BinaryOp::Mul,
                Some(Token::Div) => BinaryOp::Div,
                Some(Token::Mod) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                info: NodeInfo::at(span),
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Not) => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let start = self.current_span();
            self.pos += 1;
            let rhs = self.parse_unary()?;
            let span = start.merge(&rhs.span());
            return Ok(Expr::Unary(UnaryExpr {
                info: NodeInfo::at(span),
                op,
                rhs: Box::new(rhs),
            }));
        }
        self.parse_cast()
    }

    fn parse_cast(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_postfix()?;
        loop {
            let op = match self.peek() {
                Some(Token::KwAs) => CastOp::As,
                Some(Token::KwIs) => CastOp::Is,
                _ => return Ok(expr),
            };
            self.pos += 1;
            let target = self.parse_type()?;
            let span = expr.span().merge(&target.info.span);
            expr = Expr::Cast(CastExpr {
                info: NodeInfo::at(span),
                expr: Box::new(expr),
                op,
                target,
            });
        }
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::ParenOpen) => {
                    expr = self.finish_call(expr, Vec::new())?;
                }
                Some(Token::Not)
                    if self.peek_at(1) == Some(Token::ParenOpen)
                        && expr.as_identifier().is_some() =>
                {
                    // `name!(T)(args)` — generic call with explicit type args
                    self.pos += 1;
                    self.expect(Token::ParenOpen, "'('")?;
                    let mut type_args = Vec::new();
                    while !self.check(Token::ParenClose) {
                        type_args.push(self.parse_type()?);
                        if !self.eat(Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::ParenClose, "')'")?;
                    expr = self.finish_call(expr, type_args)?;
                }
                Some(Token::BracketOpen) => {
                    self.pos += 1;
                    let index = self.parse_expr()?;
                    let close = self.expect(Token::BracketClose, "']'")?;
                    let span = expr.span().merge(&close.span);
                    expr = Expr::Index(IndexExpr {
                        info: NodeInfo::at(span),
                        target: Box::new(expr),
                        index: Box::new(index),
                    });
                }
                Some(Token::Dot) | Some(Token::ColonColon) => {
                    self.pos += 1;
                    let (name, name_span) = self.expect_identifier("path segment")?;
                    let segment = Expr::Identifier(IdentifierExpr {
                        info: NodeInfo::at(name_span),
                        name,
                    });
                    let span = expr.span().merge(&name_span);
                    expr = match expr {
                        Expr::Path(mut path) => {
                            path.parts.push(segment);
                            path.info.span = span;
                            Expr::Path(path)
                        }
                        other => Expr::Path(PathExpr {
                            info: NodeInfo::at(span),
                            parts: vec![other, segment],
                            is_variant_path: false,
                        }),
                    };
                }
                Some(Token::BraceOpen) if !self.no_brace_init => {
                    if let Some(ty_name) = brace_init_type_name(&expr) {
                        expr = self.parse_brace_init(Some(ty_name), expr.span())?;
                    } else {
                        return Ok(expr);
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn finish_call(&mut self, callee: Expr, type_args: Vec<TypeExpr>) -> ParseResult<Expr> {
        self.expect(Token::ParenOpen, "'('")?;
        let mut args = Vec::new();
        while !self.check(Token::ParenClose) {
            args.push(self.parse_expr()?);
            if !self.eat(Token::Comma) {
                break;
            }
        }
        let close = self.expect(Token::ParenClose, "')'")?;
        let span = callee.span().merge(&close.span);
        Ok(Expr::Call(CallExpr {
            info: NodeInfo::at(span),
            callee: Box::new(callee),
            args,
            type_args,
            inferred_type_args: Vec::new(),
            intrinsic: None,
            resolved_func: None,
            resolved_provider: None,
            newtype_target: TypeId::INVALID,
        }))
    }

    fn parse_brace_init(&mut self, ty: Option<TypeExpr>, start: Span) -> ParseResult<Expr> {
        self.expect(Token::BraceOpen, "'{'")?;

        let mut kind = BraceInitKind::List;
        let mut items = Vec::new();
        let mut first = true;
        while !self.check(Token::BraceClose) {
            if first
                && self.check(Token::Identifier)
                && self.peek_at(1) == Some(Token::Eq)
            {
                kind = BraceInitKind::Field;
            }
            first = false;

            match kind {
                BraceInitKind::Field => {
                    let (name, name_span) = self.expect_identifier("field name")?;
                    self.expect(Token::Eq, "'='")?;
                    let value = self.parse_expr()?;
                    items.push(BraceInitItem {
                        key: Some(Expr::Identifier(IdentifierExpr {
                            info: NodeInfo::at(name_span),
                            name,
                        })),
                        value,
                    });
                }
                _ => {
                    let key_or_value = self.parse_expr()?;
                    if self.eat(Token::Colon) {
                        kind = BraceInitKind::KeyValue;
                        let value = self.parse_expr()?;
                        items.push(BraceInitItem {
                            key: Some(key_or_value),
                            value,
                        });
                    } else {
                        items.push(BraceInitItem {
                            key: None,
                            value: key_or_value,
                        });
                    }
                }
            }

            if !self.eat(Token::Comma) {
                break;
            }
        }
        let close = self.expect(Token::BraceClose, "'}'")?;

        Ok(Expr::BraceInit(BraceInitExpr {
            info: NodeInfo::at(start.merge(&close.span)),
            ty,
            kind,
            items,
        }))
    }

    fn parse_lambda(&mut self) -> ParseResult<Expr> {
        let kw = self.expect(Token::KwFn, "'fn'")?;
        let params = self.parse_params()?;
        let return_type = if self.eat(Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(Expr::Lambda(LambdaExpr {
            info: NodeInfo::at(kw.span.merge(&self.prev_span())),
            params,
            return_type,
            body,
            captures: Vec::new(),
        }))
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.peek() {
            Some(Token::IntegerLiteral) => {
                let tok = self.advance()?;
                let value = parse_int_literal(tok.text, tok.span)?;
                Ok(Expr::Literal(LiteralExpr {
                    info: NodeInfo::at(tok.span),
                    value: LiteralValue::Int(value),
                }))
            }
            Some(Token::FloatLiteral) => {
                let tok = self.advance()?;
                let text = tok.text.trim_end_matches('f');
                let value: f32 = text.parse().map_err(|_| ParseError::InvalidNumber {
                    literal: tok.text.to_string(),
                    span: tok.span,
                })?;
                Ok(Expr::Literal(LiteralExpr {
                    info: NodeInfo::at(tok.span),
                    value: LiteralValue::Float(value),
                }))
            }
            Some(Token::True) | Some(Token::False) => {
                let tok = self.advance()?;
                Ok(Expr::Literal(LiteralExpr {
                    info: NodeInfo::at(tok.span),
                    value: LiteralValue::Bool(tok.token == Token::True),
                }))
            }
            Some(Token::StringLiteral) | Some(Token::RawStringLiteral) => {
                let tok = self.advance()?;
                let value = unescape_string(tok.text, tok.span)?;
                Ok(Expr::Literal(LiteralExpr {
                    info: NodeInfo::at(tok.span),
                    value: LiteralValue::Str(value),
                }))
            }
            Some(Token::FStringLiteral) => {
                let tok = self.advance()?;
                self.parse_fstring(tok)
            }
            Some(Token::Identifier) => {
                let tok = self.advance()?;
                Ok(Expr::Identifier(IdentifierExpr {
                    info: NodeInfo::at(tok.span),
                    name: tok.text.to_string(),
                }))
            }
            Some(Token::KwFn) => self.parse_lambda(),
            Some(Token::BraceOpen) if !self.no_brace_init => {
                // Untyped brace init: map or array literal.
                let span = self.current_span();
                self.parse_brace_init(None, span)
            }
            Some(Token::ParenOpen) => {
                let open = self.advance()?;
                if self.eat(Token::ParenClose) {
                    return Ok(Expr::Tuple(TupleExpr {
                        info: NodeInfo::at(open.span.merge(&self.prev_span())),
                        elements: Vec::new(),
                    }));
                }
                let first = self.parse_expr()?;
                if self.eat(Token::Comma) {
                    let mut elements = vec![first];
                    while !self.check(Token::ParenClose) {
                        elements.push(self.parse_expr()?);
                        if !self.eat(Token::Comma) {
                            break;
                        }
                    }
                    let close = self.expect(Token::ParenClose, "')'")?;
                    Ok(Expr::Tuple(TupleExpr {
                        info: NodeInfo::at(open.span.merge(&close.span)),
                        elements,
                    }))
                } else {
                    let close = self.expect(Token::ParenClose, "')'")?;
                    Ok(Expr::Grouping(GroupingExpr {
                        info: NodeInfo::at(open.span.merge(&close.span)),
                        expr: Box::new(first),
                    }))
                }
            }
            Some(other) => Err(ParseError::unexpected_token(
                other.describe(),
                "expression",
                self.current_span(),
            )),
            None => Err(ParseError::unexpected_eof("expression", self.eof_span())),
        }
    }

    /// Split `f"a {x} b"` into text parts and interpolated expressions.
    fn parse_fstring(&mut self, tok: SpannedToken<'a>) -> ParseResult<Expr> {
        let body = &tok.text[2..tok.text.len() - 1];
        let mut parts = Vec::new();
        let mut exprs = Vec::new();
        let mut current = String::new();
        let mut chars = body.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    let escaped = format!("\\{}", chars.next().map(|(_, c)| c).unwrap_or(' '));
                    let decoded =
                        unescape_string(&format!("\"{}\"", escaped), tok.span)?;
                    current.push_str(&decoded);
                }
                '{' => {
                    let mut depth = 1usize;
                    let start = i + 1;
                    let mut end = None;
                    for (j, c2) in chars.by_ref() {
                        match c2 {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    end = Some(j);
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    let Some(end) = end else {
                        return Err(ParseError::UnbalancedFString { span: tok.span });
                    };
                    parts.push(std::mem::take(&mut current));
                    exprs.push(parse_expression(&body[start..end])?);
                }
                '}' => {
                    return Err(ParseError::UnbalancedFString { span: tok.span });
                }
                _ => current.push(c),
            }
        }
        parts.push(current);

        Ok(Expr::FString(FStringExpr {
            info: NodeInfo::at(tok.span),
            parts,
            exprs,
        }))
    }
}

fn parse_int_literal(text: &str, span: Span) -> ParseResult<i32> {
    let parsed = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).map(|v| v as i32)
    } else {
        text.parse::<i32>()
    };
    parsed.map_err(|_| ParseError::InvalidNumber {
        literal: text.to_string(),
        span,
    })
}

/// The type a `Name { … }` brace init names, when the prefix expression is a
/// plain identifier or path.
fn brace_init_type_name(expr: &Expr) -> Option<TypeExpr> {
    match expr {
        Expr::Identifier(ident) => Some(TypeExpr::named(ident.name.clone())),
        Expr::Path(path) => {
            let mut name = String::new();
            for part in &path.parts {
                let ident = part.as_identifier()?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&ident.name);
            }
            Some(TypeExpr::named(name))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Ast {
        match parse(src) {
            Ok(ast) => ast,
            Err(errors) => panic!("parse failed:\n{}", errors.format_all(src)),
        }
    }

    #[test]
    fn test_var_decl_with_init() {
        let ast = parse_ok("var x = 1 + 2;");
        assert_eq!(ast.decls.len(), 1);
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var decl");
        };
        assert_eq!(var.name, "x");
        assert!(matches!(var.init, Some(Expr::Binary(_))));
    }

    #[test]
    fn test_const_flag() {
        let ast = parse_ok("const k: int = 3;");
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var decl");
        };
        assert!(var.info.is_const);
        assert_eq!(var.ty.as_ref().unwrap().name, "int");
    }

    #[test]
    fn test_comma_decl_list() {
        let ast = parse_ok("var a, b = pair();");
        let Decl::VarList(list) = &ast.decls[0] else {
            panic!("expected decl list");
        };
        assert_eq!(list.decls.len(), 2);
        assert!(list.decls.iter().all(|d| d.init.is_some()));
    }

    #[test]
    fn test_function_with_default_param() {
        let ast = parse_ok("fn add(a: int, b: int = 3): int { return a + b; }");
        let Decl::Function(func) = &ast.decls[0] else {
            panic!("expected function");
        };
        assert_eq!(func.name, "add");
        assert_eq!(func.params.len(), 2);
        assert!(func.params[1].init.is_some());
        assert!(!func.is_generic());
    }

    #[test]
    fn test_generic_function() {
        let ast = parse_ok("fn id!(T)(x: T): T { return x; }");
        let Decl::Function(func) = &ast.decls[0] else {
            panic!("expected function");
        };
        assert_eq!(func.type_params, vec!["T"]);
        assert!(func.is_generic());
    }

    #[test]
    fn test_extern_function_is_native() {
        let ast = parse_ok("extern fn roll(dice: int): int;");
        let Decl::Function(func) = &ast.decls[0] else {
            panic!("expected function");
        };
        assert!(func.block.is_none());
        assert!(has_annotation(&func.annotations, "native"));
    }

    #[test]
    fn test_sum_decl() {
        let ast = parse_ok("type R = Ok(int) | Err(string);");
        let Decl::Sum(sum) = &ast.decls[0] else {
            panic!("expected sum, got {:?}", ast.decls[0]);
        };
        assert_eq!(sum.variants.len(), 2);
        assert_eq!(sum.variants[0].name, "Ok");
        assert!(!sum.variants[0].is_unit());
    }

    #[test]
    fn test_sum_with_unit_variant() {
        let ast = parse_ok("type State = Idle | Running(int);");
        let Decl::Sum(sum) = &ast.decls[0] else {
            panic!("expected sum");
        };
        assert!(sum.variants[0].is_unit());
    }

    #[test]
    fn test_alias_newtype_opaque() {
        let ast = parse_ok("type Gold = int; type Feat(int); type Blob;");
        assert!(matches!(ast.decls[0], Decl::TypeAlias(_)));
        assert!(matches!(ast.decls[1], Decl::Newtype(_)));
        assert!(matches!(ast.decls[2], Decl::Opaque(_)));
    }

    #[test]
    fn test_struct_decl_with_annotation() {
        let ast = parse_ok("[[value_type]] type V = struct { x: int, y: float };");
        let Decl::Struct(s) = &ast.decls[0] else {
            panic!("expected struct");
        };
        assert_eq!(s.fields.len(), 2);
        assert!(has_annotation(&s.annotations, "value_type"));
    }

    #[test]
    fn test_fixed_array_type() {
        let ast = parse_ok("type S = struct { a: int[4] };");
        let Decl::Struct(s) = &ast.decls[0] else {
            panic!("expected struct");
        };
        let field_ty = s.fields[0].ty.as_ref().unwrap();
        assert_eq!(field_ty.fixed_size, Some(4));
        assert_eq!(field_ty.params[0].name, "int");
    }

    #[test]
    fn test_imports() {
        let ast = parse_ok(
            "import core.math.vector as vec;\nfrom core.util import { A, B };",
        );
        let Decl::ImportAliased(a) = &ast.decls[0] else {
            panic!("expected aliased import");
        };
        assert_eq!(a.module_path, "core.math.vector");
        assert_eq!(a.alias, "vec");
        let Decl::ImportSelective(s) = &ast.decls[1] else {
            panic!("expected selective import");
        };
        assert_eq!(s.symbols, vec!["A", "B"]);
    }

    fn body_of(ast: &Ast, name: &str) -> Block {
        ast.find_function(name).unwrap().block.clone().unwrap()
    }

    #[test]
    fn test_for_loop() {
        let ast = parse_ok("fn f() { for (var i = 0; i < 3; i = i + 1) { g(i); } }");
        let body = body_of(&ast, "f");
        let Stmt::For(for_stmt) = &body.nodes[0] else {
            panic!("expected for");
        };
        assert!(for_stmt.init.is_some());
        assert!(for_stmt.check.is_some());
        assert!(for_stmt.inc.is_some());
    }

    #[test]
    fn test_foreach_array_and_map() {
        let ast = parse_ok("fn f() { for (x in arr) { } for (k, v in m) { } }");
        let body = body_of(&ast, "f");
        let Stmt::ForEach(fe) = &body.nodes[0] else {
            panic!("expected foreach");
        };
        assert!(!fe.is_map_iteration);
        assert_eq!(fe.var.as_ref().unwrap().name, "x");
        let Stmt::ForEach(fe) = &body.nodes[1] else {
            panic!("expected foreach");
        };
        assert!(fe.is_map_iteration);
        assert_eq!(fe.key_var.as_ref().unwrap().name, "k");
        assert_eq!(fe.value_var.as_ref().unwrap().name, "v");
    }

    #[test]
    fn test_switch_with_patterns() {
        let ast = parse_ok(
            "fn f(r: R): int { switch r { case Ok(x): return x; case Err(e): return 0 - 1; } }",
        );
        let body = body_of(&ast, "f");
        let Stmt::Switch(sw) = &body.nodes[0] else {
            panic!("expected switch");
        };
        let Stmt::Label(label) = &sw.block.nodes[0] else {
            panic!("expected label");
        };
        assert!(label.is_pattern_match);
        assert_eq!(label.bindings[0].name, "x");
    }

    #[test]
    fn test_conditional_and_logical_precedence() {
        let ast = parse_ok("var x = a && b || c ? 1 : 2;");
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var");
        };
        let Some(Expr::Conditional(cond)) = &var.init else {
            panic!("expected conditional at top, got {:?}", var.init);
        };
        let Expr::Logical(or) = cond.test.as_ref() else {
            panic!("expected logical test");
        };
        assert_eq!(or.op, LogicalOp::Or);
    }

    #[test]
    fn test_path_and_index_postfix() {
        let ast = parse_ok("var v = s.a[2];");
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var");
        };
        let Some(Expr::Index(index)) = &var.init else {
            panic!("expected index");
        };
        assert!(matches!(index.target.as_ref(), Expr::Path(_)));
    }

    #[test]
    fn test_variant_path_with_coloncolon() {
        let ast = parse_ok("var r = R::Ok(42);");
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var");
        };
        let Some(Expr::Call(call)) = &var.init else {
            panic!("expected call");
        };
        let Expr::Path(path) = call.callee.as_ref() else {
            panic!("expected path callee");
        };
        assert_eq!(path.parts.len(), 2);
    }

    #[test]
    fn test_generic_call_type_args() {
        let ast = parse_ok("var x = id!(int)(7);");
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var");
        };
        let Some(Expr::Call(call)) = &var.init else {
            panic!("expected call");
        };
        assert_eq!(call.type_args.len(), 1);
        assert_eq!(call.type_args[0].name, "int");
    }

    #[test]
    fn test_brace_init_forms() {
        let ast = parse_ok("var a = Rect{w = 1, h = 2}; var b = {1: \"a\"}; var c = {1, 2};");
        let inits: Vec<_> = ast
            .decls
            .iter()
            .map(|d| match d {
                Decl::Var(v) => v.init.clone().unwrap(),
                _ => panic!("expected var"),
            })
            .collect();
        let Expr::BraceInit(rect) = &inits[0] else {
            panic!("expected brace init");
        };
        assert_eq!(rect.kind, BraceInitKind::Field);
        assert_eq!(rect.ty.as_ref().unwrap().name, "Rect");
        let Expr::BraceInit(map) = &inits[1] else {
            panic!("expected brace init");
        };
        assert_eq!(map.kind, BraceInitKind::KeyValue);
        let Expr::BraceInit(arr) = &inits[2] else {
            panic!("expected brace init");
        };
        assert_eq!(arr.kind, BraceInitKind::List);
    }

    #[test]
    fn test_lambda_expression() {
        let ast = parse_ok("var f = fn(x: int): int { return x; };");
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var");
        };
        let Some(Expr::Lambda(lambda)) = &var.init else {
            panic!("expected lambda");
        };
        assert_eq!(lambda.params.len(), 1);
        assert!(lambda.return_type.is_some());
    }

    #[test]
    fn test_fstring_parts() {
        let ast = parse_ok("var s = f\"a {x} b {y + 1}\";");
        let Decl::Var(var) = &ast.decls[0] else {
            panic!("expected var");
        };
        let Some(Expr::FString(fs)) = &var.init else {
            panic!("expected f-string");
        };
        assert_eq!(fs.parts, vec!["a ", " b ", ""]);
        assert_eq!(fs.exprs.len(), 2);
        assert!(matches!(fs.exprs[1], Expr::Binary(_)));
    }

    #[test]
    fn test_cast_and_is() {
        let ast = parse_ok("var a = x as float; var b = x is int;");
        for (decl, op) in ast.decls.iter().zip([CastOp::As, CastOp::Is]) {
            let Decl::Var(var) = decl else {
                panic!("expected var");
            };
            let Some(Expr::Cast(cast)) = &var.init else {
                panic!("expected cast");
            };
            assert_eq!(cast.op, op);
        }
    }

    #[test]
    fn test_error_recovery_collects_multiple() {
        let result = parse("var = 1;\nvar ok = 2;\nfn () {}");
        let errors = result.unwrap_err();
        assert!(errors.len() >= 2);
    }

    #[test]
    fn test_tuple_literal_and_grouping() {
        let ast = parse_ok("var t = (1, 2); var g = (1);");
        let Decl::Var(t) = &ast.decls[0] else {
            panic!("expected var");
        };
        assert!(matches!(t.init, Some(Expr::Tuple(_))));
        let Decl::Var(g) = &ast.decls[1] else {
            panic!("expected var");
        };
        assert!(matches!(g.init, Some(Expr::Grouping(_))));
    }
}
