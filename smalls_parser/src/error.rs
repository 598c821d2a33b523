//! Parse error types.

use crate::span::Span;
use thiserror::Error;

/// Parse error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Unexpected token
    #[error("unexpected token {found} at line {}:{}, expected {expected}", .span.start_line, .span.start_column)]
    UnexpectedToken {
        found: String,
        expected: String,
        span: Span,
    },

    /// Unexpected end of input
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String, span: Span },

    /// Invalid escape sequence
    #[error("invalid escape sequence '{sequence}' at line {}:{}", .span.start_line, .span.start_column)]
    InvalidEscape { sequence: String, span: Span },

    /// Unterminated string
    #[error("unterminated string literal starting at line {}:{}", .span.start_line, .span.start_column)]
    UnterminatedString { span: Span },

    /// Unterminated block comment
    #[error("unterminated block comment starting at line {}:{}", .span.start_line, .span.start_column)]
    UnterminatedBlockComment { span: Span },

    /// Invalid number literal
    #[error("invalid number literal '{literal}' at line {}:{}", .span.start_line, .span.start_column)]
    InvalidNumber { literal: String, span: Span },

    /// Unbalanced interpolation braces in an f-string
    #[error("unbalanced braces in f-string at line {}:{}", .span.start_line, .span.start_column)]
    UnbalancedFString { span: Span },

    /// Invalid syntax
    #[error("{message} at line {}:{}", .span.start_line, .span.start_column)]
    InvalidSyntax { message: String, span: Span },

    /// Lexer error
    #[error("unrecognized token at line {}:{}", .span.start_line, .span.start_column)]
    LexerError { span: Span },
}

impl ParseError {
    pub fn span(&self) -> &Span {
        match self {
            ParseError::UnexpectedToken { span, .. } => span,
            ParseError::UnexpectedEof { span, .. } => span,
            ParseError::InvalidEscape { span, .. } => span,
            ParseError::UnterminatedString { span } => span,
            ParseError::UnterminatedBlockComment { span } => span,
            ParseError::InvalidNumber { span, .. } => span,
            ParseError::UnbalancedFString { span } => span,
            ParseError::InvalidSyntax { span, .. } => span,
            ParseError::LexerError { span } => span,
        }
    }

    pub fn unexpected_token(
        found: impl Into<String>,
        expected: impl Into<String>,
        span: Span,
    ) -> Self {
        ParseError::UnexpectedToken {
            found: found.into(),
            expected: expected.into(),
            span,
        }
    }

    pub fn unexpected_eof(expected: impl Into<String>, span: Span) -> Self {
        ParseError::UnexpectedEof {
            expected: expected.into(),
            span,
        }
    }

    pub fn invalid_syntax(message: impl Into<String>, span: Span) -> Self {
        ParseError::InvalidSyntax {
            message: message.into(),
            span,
        }
    }

    /// Render the offending source line with a caret marker underneath.
    pub fn format_with_context(&self, source: &str) -> String {
        let span = self.span();
        let lines: Vec<&str> = source.lines().collect();
        let line_idx = span.start_line.saturating_sub(1);
        let Some(line) = lines.get(line_idx) else {
            return String::new();
        };

        let col = span.start_column.saturating_sub(1);
        let len = if span.start_line == span.end_line {
            span.end_column.saturating_sub(span.start_column).max(1)
        } else {
            1
        };
        let marker = "^".repeat(len.min(line.len().saturating_sub(col)).max(1));

        format!(
            "  {} | {}\n  {} | {}{}",
            span.start_line,
            line,
            " ".repeat(span.start_line.to_string().len()),
            " ".repeat(col),
            marker
        )
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Collection of parse errors for error recovery.
#[derive(Debug, Default)]
pub struct ParseErrors {
    errors: Vec<ParseError>,
}

impl ParseErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, error: ParseError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    pub fn first(&self) -> Option<&ParseError> {
        self.errors.first()
    }

    pub fn take(self) -> Vec<ParseError> {
        self.errors
    }

    /// Format all errors, each with its source context.
    pub fn format_all(&self, source: &str) -> String {
        self.errors
            .iter()
            .enumerate()
            .map(|(i, e)| format!("Error {}: {}\n{}", i + 1, e, e.format_with_context(source)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl IntoIterator for ParseErrors {
    type Item = ParseError;
    type IntoIter = std::vec::IntoIter<ParseError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_token_message() {
        let span = Span::new(4, 5, 1, 1, 5, 6);
        let err = ParseError::unexpected_token("'='", "';'", span);
        let msg = err.to_string();
        assert!(msg.contains("'='"));
        assert!(msg.contains("';'"));
        assert!(msg.contains("1:5"));
    }

    #[test]
    fn test_format_with_context_points_at_column() {
        let source = "var x = ;";
        let span = Span::new(8, 9, 1, 1, 9, 10);
        let err = ParseError::unexpected_token("';'", "expression", span);
        let ctx = err.format_with_context(source);
        assert!(ctx.contains("var x = ;"));
        assert!(ctx.lines().nth(1).unwrap().ends_with('^'));
    }

    #[test]
    fn test_error_collection() {
        let mut errors = ParseErrors::new();
        assert!(errors.is_empty());
        errors.push(ParseError::unexpected_eof("expression", Span::empty()));
        assert_eq!(errors.len(), 1);
        assert!(errors.first().is_some());
    }
}
