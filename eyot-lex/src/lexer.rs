#![forbid(unsafe_code)]

use logos::Logos;
use miette::Diagnostic;
use thiserror::Error;

use eyot_ast::{span, Span};

use crate::token::{Token, TokenKind};

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(eyot::lex))]
pub struct LexError {
    pub message: String,
    #[label]
    pub span: Span,
    pub line: u32,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
enum RawToken {
    #[token("\n")]
    Newline,
    #[regex(r"//[^\n]*")]
    LineComment,
    #[regex(r"/\*([^*]|\*+[^*/])*\*+/")]
    BlockComment,

    // Two-character operators
    #[token("==")]
    Equality,
    #[token("!=")]
    Inequality,
    #[token("<=")]
    LessThanOrEqual,
    #[token(">=")]
    GreaterThanOrEqual,
    #[token("+=")]
    PlusEquals,
    #[token("-=")]
    MinusEquals,
    #[token("*=")]
    TimesEquals,
    #[token("/=")]
    DivideEquals,
    #[token("::")]
    ScopeResolution,

    // One-character operators
    #[token("=")]
    Equals,
    #[token("(")]
    OpenCurved,
    #[token(")")]
    CloseCurved,
    #[token("[")]
    OpenSquare,
    #[token("]")]
    CloseSquare,
    #[token("{")]
    OpenCurly,
    #[token("}")]
    CloseCurly,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Multiply,
    #[token("/")]
    Divide,
    #[token("<")]
    LessThan,
    #[token(">")]
    GreaterThan,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token("%")]
    Percent,

    // Keywords
    #[token("partial")]
    Partial,
    #[token("_", priority = 3)]
    Placeholder,
    #[token("struct")]
    Struct,
    #[token("self")]
    SelfKeyword,
    #[token("as")]
    As,
    #[token("new")]
    New,
    #[token("fn")]
    Function,
    #[token("null")]
    Null,
    #[token("break")]
    Break,
    #[token("range")]
    Range,
    #[token("let")]
    Let,
    #[token("const")]
    Const,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("i64")]
    IntegerKeyword,
    #[token("f32")]
    Float32Keyword,
    #[token("f64")]
    Float64Keyword,
    #[token("bool")]
    BoolKeyword,
    #[token("char")]
    CharKeyword,
    #[token("string")]
    StringKeyword,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("elseif")]
    ElseIf,
    #[token("while")]
    While,
    #[token("and")]
    And,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("send")]
    Send,
    #[token("receive")]
    Receive,
    #[token("pipeline")]
    Pipeline,
    #[token("cpu")]
    Cpu,
    #[token("gpu")]
    Gpu,
    #[token("gpu_builtin")]
    GpuBuiltin,
    #[token("worker")]
    Worker,
    #[token("drain")]
    Drain,
    #[token("import")]
    Import,
    #[token("export")]
    Export,
    #[token("for")]
    Foreach,

    // Literals
    #[regex(r"[0-9]+\.[0-9]+f?")]
    FloatLit,
    #[regex(r"[0-9]+f")]
    Float32Whole,
    #[regex(r"[0-9]+")]
    IntLit,
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Identifier,
    #[regex(r#""[^"]*""#)]
    StringLit,
    #[regex(r"'(\\.|[^\\'])'")]
    CharLit,
}

/// Whether a newline after a token of this kind terminates a statement.
fn ends_statement(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Integer
            | TokenKind::Float32
            | TokenKind::Float64
            | TokenKind::Identifier
            | TokenKind::Character
            | TokenKind::Str
            | TokenKind::CloseCurly
            | TokenKind::CloseCurved
            | TokenKind::CloseSquare
            | TokenKind::Colon
            | TokenKind::True
            | TokenKind::False
            | TokenKind::IntegerKeyword
            | TokenKind::Float32Keyword
            | TokenKind::Float64Keyword
            | TokenKind::BoolKeyword
            | TokenKind::CharKeyword
            | TokenKind::StringKeyword
            | TokenKind::SelfKeyword
    )
}

fn digits_value(digits: &str) -> i64 {
    digits
        .bytes()
        .fold(0i64, |acc, b| acc.wrapping_mul(10).wrapping_add((b - b'0') as i64))
}

/// A short window of source around a failure point, for the error text.
fn surround(src: &str, at: usize) -> (String, String, String) {
    const WINDOW: usize = 10;
    let chars: Vec<char> = src.chars().collect();

    // Map the byte offset to a character index.
    let mut char_at = 0usize;
    let mut bytes = 0usize;
    for (i, c) in chars.iter().enumerate() {
        if bytes >= at {
            char_at = i;
            break;
        }
        bytes += c.len_utf8();
        char_at = i + 1;
    }

    let lead_start = char_at.saturating_sub(WINDOW);
    let lead: String = chars[lead_start..char_at].iter().collect();
    let mid: String = chars.get(char_at).map(|c| c.to_string()).unwrap_or_default();
    let tail_start = (char_at + 1).min(chars.len());
    let tail_end = (char_at + 1 + WINDOW).min(chars.len());
    let tail: String = chars[tail_start..tail_end].iter().collect();

    (lead, mid, tail)
}

fn float_token(slice: &str, line: u32, sp: Span) -> Token {
    let (body, width32) = match slice.strip_suffix('f') {
        Some(body) => (body, true),
        None => (slice, false),
    };

    let (int_digits, frac_digits) = match body.split_once('.') {
        Some((l, r)) => (l, r),
        None => (body, ""),
    };

    let zeros = frac_digits.len() - frac_digits.trim_start_matches('0').len();
    let frac_rest = &frac_digits[zeros..];

    let mut tok = Token::bare(
        if width32 {
            TokenKind::Float32
        } else {
            TokenKind::Float64
        },
        line,
        sp,
    );
    tok.ival = digits_value(int_digits);
    tok.fval_zeros = zeros as i64;
    tok.fval = digits_value(frac_rest);
    tok
}

fn char_token(slice: &str, line: u32, sp: Span) -> Result<Token, LexError> {
    let inner = &slice[1..slice.len() - 1];
    let mut chars = inner.chars();
    let first = chars.next().unwrap_or('\0');

    let code_point = if first == '\\' {
        let escape = chars.next().unwrap_or('\0');
        match escape {
            'n' => 10,
            'r' => 13,
            't' => 9,
            other => {
                return Err(LexError {
                    message: format!("Do not recognise escape sequence '\\{other}'"),
                    span: sp,
                    line,
                })
            }
        }
    } else {
        first as i64
    };

    let mut tok = Token::bare(TokenKind::Character, line, sp);
    tok.ival = code_point;
    Ok(tok)
}

/// Lex a whole source text into tokens, ending with a single `Eof` token.
///
/// Newlines insert a synthetic semicolon when the previous token could
/// validly end a statement; comments are skipped but still counted for
/// line numbers.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = RawToken::lexer(src);
    let mut out: Vec<Token> = Vec::new();
    let mut line: u32 = 1;
    let mut last_kind = TokenKind::Eof;
    let mut pending_semicolon = false;

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let sp = span(range.start, range.end - range.start);

        let raw = match result {
            Ok(raw) => raw,
            Err(_) => {
                let (lead, mid, tail) = surround(src, range.start);
                return Err(LexError {
                    message: format!("Unable to tokenise '{lead}|{mid}|{tail}'"),
                    span: sp,
                    line,
                });
            }
        };

        let slice = lexer.slice();

        match raw {
            RawToken::Newline => {
                if ends_statement(last_kind) {
                    pending_semicolon = true;
                }
                line += 1;
                continue;
            }
            RawToken::LineComment => continue,
            RawToken::BlockComment => {
                line += slice.matches('\n').count() as u32;
                continue;
            }
            _ => {}
        }

        if pending_semicolon {
            out.push(Token::bare(TokenKind::Semicolon, line, sp));
            pending_semicolon = false;
        }

        let token = match raw {
            RawToken::FloatLit => float_token(slice, line, sp),
            RawToken::Float32Whole => {
                let mut tok = Token::bare(TokenKind::Float32, line, sp);
                tok.ival = digits_value(&slice[..slice.len() - 1]);
                tok
            }
            RawToken::IntLit => {
                let mut tok = Token::bare(TokenKind::Integer, line, sp);
                tok.ival = digits_value(slice);
                tok
            }
            RawToken::Identifier => {
                let mut tok = Token::bare(TokenKind::Identifier, line, sp);
                tok.text = slice.to_string();
                tok
            }
            RawToken::StringLit => {
                let contents = &slice[1..slice.len() - 1];
                let mut tok = Token::bare(TokenKind::Str, line, sp);
                tok.text = contents.to_string();
                line += contents.matches('\n').count() as u32;
                tok
            }
            RawToken::CharLit => char_token(slice, line, sp)?,
            simple => Token::bare(simple_kind(&simple), line, sp),
        };

        last_kind = token.kind;
        out.push(token);
    }

    let end = span(src.len(), 0);
    if pending_semicolon {
        out.push(Token::bare(TokenKind::Semicolon, line, end));
    }
    out.push(Token::bare(TokenKind::Eof, line, end));

    Ok(out)
}

fn simple_kind(raw: &RawToken) -> TokenKind {
    match raw {
        RawToken::Equality => TokenKind::Equality,
        RawToken::Inequality => TokenKind::Inequality,
        RawToken::LessThanOrEqual => TokenKind::LessThanOrEqual,
        RawToken::GreaterThanOrEqual => TokenKind::GreaterThanOrEqual,
        RawToken::PlusEquals => TokenKind::PlusEquals,
        RawToken::MinusEquals => TokenKind::MinusEquals,
        RawToken::TimesEquals => TokenKind::TimesEquals,
        RawToken::DivideEquals => TokenKind::DivideEquals,
        RawToken::ScopeResolution => TokenKind::ScopeResolution,
        RawToken::Equals => TokenKind::Equals,
        RawToken::OpenCurved => TokenKind::OpenCurved,
        RawToken::CloseCurved => TokenKind::CloseCurved,
        RawToken::OpenSquare => TokenKind::OpenSquare,
        RawToken::CloseSquare => TokenKind::CloseSquare,
        RawToken::OpenCurly => TokenKind::OpenCurly,
        RawToken::CloseCurly => TokenKind::CloseCurly,
        RawToken::Comma => TokenKind::Comma,
        RawToken::Semicolon => TokenKind::Semicolon,
        RawToken::Plus => TokenKind::Plus,
        RawToken::Minus => TokenKind::Minus,
        RawToken::Multiply => TokenKind::Multiply,
        RawToken::Divide => TokenKind::Divide,
        RawToken::LessThan => TokenKind::LessThan,
        RawToken::GreaterThan => TokenKind::GreaterThan,
        RawToken::Colon => TokenKind::Colon,
        RawToken::Dot => TokenKind::Dot,
        RawToken::Percent => TokenKind::Percent,
        RawToken::Partial => TokenKind::Partial,
        RawToken::Placeholder => TokenKind::Placeholder,
        RawToken::Struct => TokenKind::Struct,
        RawToken::SelfKeyword => TokenKind::SelfKeyword,
        RawToken::As => TokenKind::As,
        RawToken::New => TokenKind::New,
        RawToken::Function => TokenKind::Function,
        RawToken::Null => TokenKind::Null,
        RawToken::Break => TokenKind::Break,
        RawToken::Range => TokenKind::Range,
        RawToken::Let => TokenKind::Let,
        RawToken::Const => TokenKind::Const,
        RawToken::True => TokenKind::True,
        RawToken::False => TokenKind::False,
        RawToken::IntegerKeyword => TokenKind::IntegerKeyword,
        RawToken::Float32Keyword => TokenKind::Float32Keyword,
        RawToken::Float64Keyword => TokenKind::Float64Keyword,
        RawToken::BoolKeyword => TokenKind::BoolKeyword,
        RawToken::CharKeyword => TokenKind::CharKeyword,
        RawToken::StringKeyword => TokenKind::StringKeyword,
        RawToken::Return => TokenKind::Return,
        RawToken::If => TokenKind::If,
        RawToken::Else => TokenKind::Else,
        RawToken::ElseIf => TokenKind::ElseIf,
        RawToken::While => TokenKind::While,
        RawToken::And => TokenKind::And,
        RawToken::Not => TokenKind::Not,
        RawToken::Or => TokenKind::Or,
        RawToken::Send => TokenKind::Send,
        RawToken::Receive => TokenKind::Receive,
        RawToken::Pipeline => TokenKind::Pipeline,
        RawToken::Cpu => TokenKind::Cpu,
        RawToken::Gpu => TokenKind::Gpu,
        RawToken::GpuBuiltin => TokenKind::GpuBuiltin,
        RawToken::Worker => TokenKind::Worker,
        RawToken::Drain => TokenKind::Drain,
        RawToken::Import => TokenKind::Import,
        RawToken::Export => TokenKind::Export,
        RawToken::Foreach => TokenKind::Foreach,
        RawToken::Newline
        | RawToken::LineComment
        | RawToken::BlockComment
        | RawToken::FloatLit
        | RawToken::Float32Whole
        | RawToken::IntLit
        | RawToken::Identifier
        | RawToken::StringLit
        | RawToken::CharLit => TokenKind::Eof,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn hello_world_token_stream() {
        let src = "fn main() {\n\tprint_ln(\"Hello World!\");\n} == != <= >= a.b";
        assert_eq!(
            kinds(src),
            vec![
                TokenKind::Function,
                TokenKind::Identifier,
                TokenKind::OpenCurved,
                TokenKind::CloseCurved,
                TokenKind::OpenCurly,
                TokenKind::Identifier,
                TokenKind::OpenCurved,
                TokenKind::Str,
                TokenKind::CloseCurved,
                TokenKind::Semicolon,
                TokenKind::CloseCurly,
                TokenKind::Equality,
                TokenKind::Inequality,
                TokenKind::LessThanOrEqual,
                TokenKind::GreaterThanOrEqual,
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn newlines_insert_semicolons() {
        let src = "fn main() {\n\tprint_ln(\"Hello World!\")\n}\n";
        assert_eq!(
            kinds(src),
            vec![
                TokenKind::Function,
                TokenKind::Identifier,
                TokenKind::OpenCurved,
                TokenKind::CloseCurved,
                TokenKind::OpenCurly,
                TokenKind::Identifier,
                TokenKind::OpenCurved,
                TokenKind::Str,
                TokenKind::CloseCurved,
                TokenKind::Semicolon,
                TokenKind::CloseCurly,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn inserted_count_matches_newline_rule() {
        // One explicit semicolon, two insertion points.
        let explicit = tokenize("a; b\nc\n").unwrap();
        let semis = explicit
            .iter()
            .filter(|t| t.kind == TokenKind::Semicolon)
            .count();
        assert_eq!(semis, 3);
    }

    #[test]
    fn integers_survive_comments() {
        for src in ["12 345", "12 // hello \n345", "12 /* junk \n */ 345"] {
            let tokens: Vec<Token> = tokenize(src)
                .unwrap()
                .into_iter()
                .filter(|t| t.kind != TokenKind::Semicolon)
                .collect();
            assert_eq!(tokens.len(), 3, "source {src:?}");
            assert_eq!(tokens[0].kind, TokenKind::Integer);
            assert_eq!(tokens[0].ival, 12);
            assert_eq!(tokens[1].kind, TokenKind::Integer);
            assert_eq!(tokens[1].ival, 345);
            assert_eq!(tokens[2].kind, TokenKind::Eof);
        }
    }

    #[test]
    fn comments_still_count_lines() {
        let tokens = tokenize("12 /* junk \n */ 345").unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn float_widths() {
        let tokens = tokenize("1.0 23.45").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Float64);
        assert_eq!((tokens[0].ival, tokens[0].fval_zeros, tokens[0].fval), (1, 1, 0));
        assert_eq!(tokens[1].kind, TokenKind::Float64);
        assert_eq!((tokens[1].ival, tokens[1].fval_zeros, tokens[1].fval), (23, 0, 45));

        let tokens = tokenize("1f 23.45f").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Float32);
        assert_eq!((tokens[0].ival, tokens[0].fval_zeros, tokens[0].fval), (1, 0, 0));
        assert_eq!(tokens[1].kind, TokenKind::Float32);
        assert_eq!((tokens[1].ival, tokens[1].fval_zeros, tokens[1].fval), (23, 0, 45));
    }

    #[test]
    fn leading_fraction_zeros_are_preserved() {
        let tokens = tokenize("0.007").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].kind, TokenKind::Float64);
        assert_eq!(tokens[0].ival, 0);
        assert_eq!(tokens[0].fval_zeros, 2);
        assert_eq!(tokens[0].fval, 7);
    }

    #[test]
    fn character_escapes() {
        let tokens = tokenize(r"'a' '\n' '\t' '\r'").unwrap();
        let points: Vec<i64> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Character)
            .map(|t| t.ival)
            .collect();
        assert_eq!(points, vec![97, 10, 9, 13]);
    }

    #[test]
    fn unknown_escape_is_an_error() {
        let err = tokenize(r"'\x'").unwrap_err();
        assert!(err.message.contains("escape sequence"));
    }

    #[test]
    fn unknown_byte_reports_context() {
        let err = tokenize("let a = £").unwrap_err();
        assert!(err.message.contains("Unable to tokenise"));
        assert!(err.message.contains('|'));
    }

    #[test]
    fn keywords_are_not_identifiers() {
        let tokens = tokenize("for fortune").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Foreach);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].text, "fortune");
    }

    #[test]
    fn placeholder_and_underscored_names() {
        let tokens = tokenize("_ _x").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Placeholder);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
    }
}
