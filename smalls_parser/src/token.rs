//! Token definitions for the Smalls lexer.

use logos::Logos;
use serde::{Deserialize, Serialize};

/// Smalls tokens.
///
/// Strings, f-strings, and block comments are captured as whole lexemes; the
/// lexer wrapper post-processes escapes and nesting.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token {
    // ==================== Keywords ====================
    #[token("as")]
    KwAs,
    #[token("break")]
    KwBreak,
    #[token("case")]
    KwCase,
    #[token("const")]
    KwConst,
    #[token("continue")]
    KwContinue,
    #[token("default")]
    KwDefault,
    #[token("else")]
    KwElse,
    #[token("extern")]
    KwExtern,
    #[token("for")]
    KwFor,
    #[token("from")]
    KwFrom,
    #[token("fn")]
    KwFn,
    #[token("if")]
    KwIf,
    #[token("import")]
    KwImport,
    #[token("in")]
    KwIn,
    #[token("is")]
    KwIs,
    #[token("return")]
    KwReturn,
    #[token("switch")]
    KwSwitch,
    #[token("type")]
    KwType,
    #[token("var")]
    KwVar,

    // ==================== Literals ====================
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?f?", priority = 3)]
    FloatLiteral,
    #[regex(r"0[xX][0-9a-fA-F]+|[0-9]+")]
    IntegerLiteral,
    #[regex(r#""([^"\\\n]|\\.)*""#)]
    StringLiteral,
    #[regex(r#"r"[^"\n]*""#)]
    RawStringLiteral,
    #[regex(r#"f"([^"\\\n]|\\.)*""#)]
    FStringLiteral,

    // ==================== Identifiers / comments ====================
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Identifier,
    #[regex(r"//[^\n]*")]
    LineComment,
    #[token("/*")]
    BlockCommentStart,

    // ==================== Punctuation ====================
    #[token("(")]
    ParenOpen,
    #[token(")")]
    ParenClose,
    #[token("{")]
    BraceOpen,
    #[token("}")]
    BraceClose,
    #[token("[[")]
    AnnotationOpen,
    #[token("]]")]
    AnnotationClose,
    #[token("[")]
    BracketOpen,
    #[token("]")]
    BracketClose,
    #[token(",")]
    Comma,
    #[token("::")]
    ColonColon,
    #[token(":")]
    Colon,
    #[token("?")]
    Question,
    #[token(";")]
    Semicolon,
    #[token(".")]
    Dot,

    // ==================== Operators ====================
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("|")]
    Pipe,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("=")]
    Eq,
    #[token("<=")]
    LtEq,
    #[token("<")]
    Lt,
    #[token(">=")]
    GtEq,
    #[token(">")]
    Gt,
    #[token("+=")]
    PlusEq,
    #[token("+")]
    Plus,
    #[token("->")]
    Arrow,
    #[token("-=")]
    MinusEq,
    #[token("-")]
    Minus,
    #[token("*=")]
    TimesEq,
    #[token("*")]
    Times,
    #[token("/=")]
    DivEq,
    #[token("/")]
    Div,
    #[token("%=")]
    ModEq,
    #[token("%")]
    Mod,
    #[token("!")]
    Not,
}

impl Token {
    /// Human-readable token name for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Token::KwAs => "'as'",
            Token::KwBreak => "'break'",
            Token::KwCase => "'case'",
            Token::KwConst => "'const'",
            Token::KwContinue => "'continue'",
            Token::KwDefault => "'default'",
            Token::KwElse => "'else'",
            Token::KwExtern => "'extern'",
            Token::KwFor => "'for'",
            Token::KwFrom => "'from'",
            Token::KwFn => "'fn'",
            Token::KwIf => "'if'",
            Token::KwImport => "'import'",
            Token::KwIn => "'in'",
            Token::KwIs => "'is'",
            Token::KwReturn => "'return'",
            Token::KwSwitch => "'switch'",
            Token::KwType => "'type'",
            Token::KwVar => "'var'",
            Token::True => "'true'",
            Token::False => "'false'",
            Token::FloatLiteral => "float literal",
            Token::IntegerLiteral => "integer literal",
            Token::StringLiteral => "string literal",
            Token::RawStringLiteral => "raw string literal",
            Token::FStringLiteral => "f-string literal",
            Token::Identifier => "identifier",
            Token::LineComment => "comment",
            Token::BlockCommentStart => "comment",
            Token::ParenOpen => "'('",
            Token::ParenClose => "')'",
            Token::BraceOpen => "'{'",
            Token::BraceClose => "'}'",
            Token::AnnotationOpen => "'[['",
            Token::AnnotationClose => "']]'",
            Token::BracketOpen => "'['",
            Token::BracketClose => "']'",
            Token::Comma => "','",
            Token::ColonColon => "'::'",
            Token::Colon => "':'",
            Token::Question => "'?'",
            Token::Semicolon => "';'",
            Token::Dot => "'.'",
            Token::AndAnd => "'&&'",
            Token::OrOr => "'||'",
            Token::Pipe => "'|'",
            Token::EqEq => "'=='",
            Token::NotEq => "'!='",
            Token::Eq => "'='",
            Token::LtEq => "'<='",
            Token::Lt => "'<'",
            Token::GtEq => "'>='",
            Token::Gt => "'>'",
            Token::PlusEq => "'+='",
            Token::Plus => "'+'",
            Token::Arrow => "'->'",
            Token::MinusEq => "'-='",
            Token::Minus => "'-'",
            Token::TimesEq => "'*='",
            Token::Times => "'*'",
            Token::DivEq => "'/='",
            Token::Div => "'/'",
            Token::ModEq => "'%='",
            Token::Mod => "'%'",
            Token::Not => "'!'",
        }
    }

    pub fn is_comment(&self) -> bool {
        matches!(self, Token::LineComment | Token::BlockCommentStart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos::Logos;

    fn lex_all(src: &str) -> Vec<Token> {
        Token::lexer(src).map(|t| t.unwrap()) .collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            lex_all("var x fn return"),
            vec![
                Token::KwVar,
                Token::Identifier,
                Token::KwFn,
                Token::KwReturn
            ]
        );
    }

    #[test]
    fn test_compound_operators_win_over_singles() {
        assert_eq!(
            lex_all("== != <= >= += && || ::"),
            vec![
                Token::EqEq,
                Token::NotEq,
                Token::LtEq,
                Token::GtEq,
                Token::PlusEq,
                Token::AndAnd,
                Token::OrOr,
                Token::ColonColon,
            ]
        );
    }

    #[test]
    fn test_numeric_literals() {
        assert_eq!(lex_all("42 0xFF 1.5 2.0e3"), vec![
            Token::IntegerLiteral,
            Token::IntegerLiteral,
            Token::FloatLiteral,
            Token::FloatLiteral,
        ]);
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(
            lex_all(r#""a" r"b\c" f"x {y}""#),
            vec![
                Token::StringLiteral,
                Token::RawStringLiteral,
                Token::FStringLiteral
            ]
        );
    }

    #[test]
    fn test_annotation_brackets() {
        assert_eq!(
            lex_all("[[value_type]] [1]"),
            vec![
                Token::AnnotationOpen,
                Token::Identifier,
                Token::AnnotationClose,
                Token::BracketOpen,
                Token::IntegerLiteral,
                Token::BracketClose,
            ]
        );
    }
}
