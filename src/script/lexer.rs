use std::ops::Range;

use logos::Logos;

use crate::error::{CodegenError, SourcePos};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", number)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", number)]
    Number(f32),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("=")]
    Assign,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    /// Newline or `;`.
    #[token("\n")]
    #[token(";")]
    Separator,
    /// Appended by [`tokenize`], never lexed.
    Eof,
}

fn number(lex: &mut logos::Lexer<Token>) -> Option<f32> {
    lex.slice().parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Range<usize>,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, CodegenError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let token = result.map_err(|()| {
            let message = match lexer.slice().chars().next() {
                Some(c) if c.is_ascii_digit() || c == '.' => {
                    format!("invalid number `{}`", lexer.slice())
                }
                Some(c) => format!("unexpected character `{}`", c),
                None => "unexpected end of input".to_string(),
            };
            CodegenError::Parse {
                message,
                pos: SourcePos::span(span.clone()),
            }
        })?;
        tokens.push(Spanned { token, span });
    }

    tokens.push(Spanned {
        token: Token::Eof,
        span: source.len()..source.len(),
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn operators_and_numbers() {
        assert_eq!(
            kinds("out:num = 1.5e1 <= x # note\n"),
            vec![
                Token::Ident("out".into()),
                Token::Colon,
                Token::Ident("num".into()),
                Token::Assign,
                Token::Number(15.0),
                Token::LessEq,
                Token::Ident("x".into()),
                Token::Separator,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn spans_are_byte_ranges() {
        let tokens = tokenize("a = foo").unwrap();
        assert_eq!(tokens[2].span, 4..7);
    }

    #[test]
    fn rejects_stray_characters() {
        let err = tokenize("a = 1 $ 2").unwrap_err();
        assert_eq!(err.pos().span, Some(6..7));
    }

    #[test]
    fn comments_and_semicolons() {
        assert_eq!(
            kinds("a=.5;b # c = 1\n"),
            vec![
                Token::Ident("a".into()),
                Token::Assign,
                Token::Number(0.5),
                Token::Separator,
                Token::Ident("b".into()),
                Token::Separator,
                Token::Eof,
            ]
        );
    }
}
