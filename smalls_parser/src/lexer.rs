//! Lexer for Smalls source code.
//!
//! Wraps the logos-generated lexer with peeking, nested block comment
//! scanning, and span construction.

use logos::Logos;

use crate::error::ParseError;
use crate::span::{SourceMap, Span};
use crate::token::Token;

/// A token with its span and source text.
#[derive(Debug, Clone)]
pub struct SpannedToken<'a> {
    pub token: Token,
    pub span: Span,
    pub text: &'a str,
}

/// Smalls lexer.
pub struct Lexer<'a> {
    source: &'a str,
    inner: logos::Lexer<'a, Token>,
    source_map: SourceMap,
    peeked: Option<Result<SpannedToken<'a>, ParseError>>,
    /// Offset from original source, used after restarting the inner lexer.
    offset: usize,
}

impl<'a> std::fmt::Debug for Lexer<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lexer").field("offset", &self.offset).finish()
    }
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            inner: Token::lexer(source),
            source_map: SourceMap::new(source),
            peeked: None,
            offset: 0,
        }
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    pub fn source_map(&self) -> &SourceMap {
        &self.source_map
    }

    fn make_span(&self, start: usize, end: usize) -> Span {
        self.source_map.span(start, end)
    }

    /// Peek at the next non-comment token without consuming it.
    pub fn peek(&mut self) -> Option<&Result<SpannedToken<'a>, ParseError>> {
        if self.peeked.is_none() {
            self.peeked = self.next_significant();
        }
        self.peeked.as_ref()
    }

    /// Get the next non-comment token.
    pub fn next_token(&mut self) -> Option<Result<SpannedToken<'a>, ParseError>> {
        if let Some(peeked) = self.peeked.take() {
            return Some(peeked);
        }
        self.next_significant()
    }

    fn next_significant(&mut self) -> Option<Result<SpannedToken<'a>, ParseError>> {
        loop {
            match self.next_raw()? {
                Ok(tok) if tok.token.is_comment() => continue,
                other => return Some(other),
            }
        }
    }

    fn next_raw(&mut self) -> Option<Result<SpannedToken<'a>, ParseError>> {
        let result = self.inner.next()?;
        let raw_span = self.inner.span();
        let start = self.offset + raw_span.start;
        let end = self.offset + raw_span.end;

        match result {
            Ok(Token::BlockCommentStart) => match self.scan_block_comment(end) {
                Ok(comment_end) => {
                    self.restart_from(comment_end);
                    let span = self.make_span(start, comment_end);
                    let text = &self.source[start..comment_end];
                    Some(Ok(SpannedToken {
                        token: Token::LineComment,
                        span,
                        text,
                    }))
                }
                Err(e) => {
                    self.restart_from(self.source.len());
                    Some(Err(e))
                }
            },
            Ok(token) => {
                let span = self.make_span(start, end);
                let text = &self.source[start..end];
                Some(Ok(SpannedToken { token, span, text }))
            }
            Err(_) => Some(Err(ParseError::LexerError {
                span: self.make_span(start, end),
            })),
        }
    }

    /// Scan past a (possibly nested) block comment. `pos` sits just after the
    /// opening `/*`. Returns the offset after the closing `*/`.
    fn scan_block_comment(&self, mut pos: usize) -> Result<usize, ParseError> {
        let bytes = self.source.as_bytes();
        let mut depth = 1usize;
        while depth > 0 {
            let Some(star) = memchr::memchr2(b'*', b'/', &bytes[pos..]) else {
                return Err(ParseError::UnterminatedBlockComment {
                    span: self.make_span(pos.saturating_sub(2), self.source.len()),
                });
            };
            let at = pos + star;
            if bytes[at] == b'*' && bytes.get(at + 1) == Some(&b'/') {
                depth -= 1;
                pos = at + 2;
            } else if bytes[at] == b'/' && bytes.get(at + 1) == Some(&b'*') {
                depth += 1;
                pos = at + 2;
            } else {
                pos = at + 1;
            }
        }
        Ok(pos)
    }

    fn restart_from(&mut self, pos: usize) {
        self.inner = Token::lexer(&self.source[pos..]);
        self.offset = pos;
    }
}

/// Decode the escapes of a quoted string lexeme (including the surrounding
/// quotes and optional `r`/`f` prefix).
pub fn unescape_string(lexeme: &str, span: Span) -> Result<String, ParseError> {
    let raw = lexeme.starts_with('r');
    let body_start = if raw || lexeme.starts_with('f') { 2 } else { 1 };
    let body = &lexeme[body_start..lexeme.len() - 1];
    if raw {
        return Ok(body.to_string());
    }

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('{') => out.push('{'),
            Some('}') => out.push('}'),
            other => {
                return Err(ParseError::InvalidEscape {
                    sequence: format!("\\{}", other.unwrap_or(' ')),
                    span,
                })
            }
        }
    }
    Ok(out)
}
