//! Inline plain-text grammar for titles and chat-like text
//!
//! Syntax:
//! - `**bold**`, `_italics_`, `^^highlight^^`, `~~strike~~`
//! - `[text](href)` links, `![alt](src)` images
//! - bare `http://` / `https://` URLs become links over themselves
//!
//! Unmatched markers stay literal. When more than one plain run still holds
//! a bare `*` or `_`, parsing fails with [`TextError::AmbiguousEmphasis`]
//! rather than guessing which markers were meant to pair.

use crate::{Annotation, AnnotationKind, InitialSchema, Result, TextError, SENTINEL};
use regex::Regex;
use std::sync::OnceLock;

static URL: OnceLock<Regex> = OnceLock::new();

fn url_pattern() -> &'static Regex {
    URL.get_or_init(|| Regex::new(r"^https?://[^\s()\[\]<>]+").unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Url(String),
    DoubleStar,
    Underscore,
    DoubleCaret,
    DoubleTilde,
    ImageOpen,
    OpenBracket,
    CloseBracket,
    OpenParen,
    CloseParen,
}

impl Token {
    fn literal(&self) -> &str {
        match self {
            Token::Text(text) | Token::Url(text) => text,
            Token::DoubleStar => "**",
            Token::Underscore => "_",
            Token::DoubleCaret => "^^",
            Token::DoubleTilde => "~~",
            Token::ImageOpen => "![",
            Token::OpenBracket => "[",
            Token::CloseBracket => "]",
            Token::OpenParen => "(",
            Token::CloseParen => ")",
        }
    }

    fn emphasis(&self) -> Option<AnnotationKind> {
        match self {
            Token::DoubleStar => Some(AnnotationKind::Bold),
            Token::Underscore => Some(AnnotationKind::Italics),
            Token::DoubleCaret => Some(AnnotationKind::Highlighting),
            Token::DoubleTilde => Some(AnnotationKind::Strikethrough),
            _ => None,
        }
    }
}

/// Split inline text into tokens. Adjacent plain text is merged.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];

        if let Some(url) = url_pattern().find(rest) {
            flush(&mut text, &mut tokens);
            tokens.push(Token::Url(url.as_str().to_string()));
            pos += url.end();
            continue;
        }

        let (token, width) = if rest.starts_with("**") {
            (Some(Token::DoubleStar), 2)
        } else if rest.starts_with("^^") {
            (Some(Token::DoubleCaret), 2)
        } else if rest.starts_with("~~") {
            (Some(Token::DoubleTilde), 2)
        } else if rest.starts_with("![") {
            (Some(Token::ImageOpen), 2)
        } else {
            match rest.chars().next() {
                Some('_') => (Some(Token::Underscore), 1),
                Some('[') => (Some(Token::OpenBracket), 1),
                Some(']') => (Some(Token::CloseBracket), 1),
                Some('(') => (Some(Token::OpenParen), 1),
                Some(')') => (Some(Token::CloseParen), 1),
                Some(c) => {
                    text.push(c);
                    (None, c.len_utf8())
                }
                None => break,
            }
        };

        if let Some(token) = token {
            flush(&mut text, &mut tokens);
            tokens.push(token);
        }
        pos += width;
    }

    flush(&mut text, &mut tokens);
    tokens
}

fn flush(text: &mut String, tokens: &mut Vec<Token>) {
    if !text.is_empty() {
        tokens.push(Token::Text(std::mem::take(text)));
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Inline {
    Text(String),
    Marked(AnnotationKind, Vec<Inline>),
    Image { src: String, alt: String },
}

/// Parse inline text into a schema
pub fn parse(input: &str) -> Result<InitialSchema> {
    let tokens = tokenize(input);
    let (nodes, _, _) = parse_sequence(&tokens, 0, None);

    let mut schema = InitialSchema::default();
    let mut len = 0;
    for node in &nodes {
        flatten(node, &mut schema, &mut len);
    }

    if ambiguous_runs(&nodes) > 1 {
        tracing::debug!(input, "rejecting inline text with ambiguous emphasis");
        return Err(TextError::AmbiguousEmphasis);
    }
    Ok(schema)
}

/// Returns the parsed nodes, the position after the stop token, and whether
/// the stop token was found.
fn parse_sequence(tokens: &[Token], mut pos: usize, stop: Option<&Token>) -> (Vec<Inline>, usize, bool) {
    let mut nodes = Vec::new();

    while pos < tokens.len() {
        let token = &tokens[pos];
        if stop == Some(token) {
            return (nodes, pos + 1, true);
        }

        match token {
            Token::Text(text) => {
                push_text(&mut nodes, text);
                pos += 1;
            }
            Token::Url(url) => {
                nodes.push(Inline::Marked(
                    AnnotationKind::Link { href: url.clone() },
                    vec![Inline::Text(url.clone())],
                ));
                pos += 1;
            }
            Token::OpenBracket => match parse_link(tokens, pos) {
                Some((node, next)) => {
                    nodes.push(node);
                    pos = next;
                }
                None => {
                    push_text(&mut nodes, token.literal());
                    pos += 1;
                }
            },
            Token::ImageOpen => match parse_image(tokens, pos) {
                Some((node, next)) => {
                    nodes.push(node);
                    pos = next;
                }
                None => {
                    push_text(&mut nodes, token.literal());
                    pos += 1;
                }
            },
            delimiter => match delimiter.emphasis() {
                Some(kind) => {
                    let (inner, next, closed) = parse_sequence(tokens, pos + 1, Some(delimiter));
                    if closed && !inner.is_empty() {
                        nodes.push(Inline::Marked(kind, inner));
                        pos = next;
                    } else {
                        push_text(&mut nodes, delimiter.literal());
                        pos += 1;
                    }
                }
                None => {
                    push_text(&mut nodes, delimiter.literal());
                    pos += 1;
                }
            },
        }
    }

    (nodes, pos, false)
}

fn parse_link(tokens: &[Token], open: usize) -> Option<(Inline, usize)> {
    let (inner, next, closed) = parse_sequence(tokens, open + 1, Some(&Token::CloseBracket));
    if !closed || inner.is_empty() {
        return None;
    }
    let (href, next) = parse_target(tokens, next)?;
    Some((Inline::Marked(AnnotationKind::Link { href }, inner), next))
}

fn parse_image(tokens: &[Token], open: usize) -> Option<(Inline, usize)> {
    let mut alt = String::new();
    let mut pos = open + 1;
    loop {
        match tokens.get(pos)? {
            Token::CloseBracket => break,
            token => alt.push_str(token.literal()),
        }
        pos += 1;
    }
    let (src, next) = parse_target(tokens, pos + 1)?;
    Some((Inline::Image { src, alt }, next))
}

/// `(target)` right after a closing bracket
fn parse_target(tokens: &[Token], pos: usize) -> Option<(String, usize)> {
    if tokens.get(pos) != Some(&Token::OpenParen) {
        return None;
    }
    let mut target = String::new();
    let mut pos = pos + 1;
    loop {
        match tokens.get(pos)? {
            Token::CloseParen => return Some((target, pos + 1)),
            token => target.push_str(token.literal()),
        }
        pos += 1;
    }
}

fn push_text(nodes: &mut Vec<Inline>, text: &str) {
    if let Some(Inline::Text(last)) = nodes.last_mut() {
        last.push_str(text);
    } else {
        nodes.push(Inline::Text(text.to_string()));
    }
}

fn flatten(node: &Inline, schema: &mut InitialSchema, len: &mut usize) {
    match node {
        Inline::Text(text) => {
            schema.content.push_str(text);
            *len += text.chars().count();
        }
        Inline::Marked(kind, children) => {
            let index = schema.annotations.len();
            schema.annotations.push(Annotation::new(*len, *len, kind.clone()));
            for child in children {
                flatten(child, schema, len);
            }
            schema.annotations[index].end = *len;
        }
        Inline::Image { src, alt } => {
            let start = *len;
            if alt.is_empty() {
                schema.content.push(SENTINEL);
                *len += 1;
            } else {
                schema.content.push_str(alt);
                *len += alt.chars().count();
            }
            schema.annotations.push(Annotation::new(
                start,
                *len,
                AnnotationKind::Image { src: src.clone() },
            ));
        }
    }
}

fn ambiguous_runs(nodes: &[Inline]) -> usize {
    nodes
        .iter()
        .filter(|node| matches!(node, Inline::Text(text) if text.contains(['*', '_'])))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_markers() {
        assert_eq!(
            tokenize("**a** _b_"),
            vec![
                Token::DoubleStar,
                Token::Text("a".to_string()),
                Token::DoubleStar,
                Token::Text(" ".to_string()),
                Token::Underscore,
                Token::Text("b".to_string()),
                Token::Underscore,
            ]
        );
    }

    #[test]
    fn test_tokenize_url() {
        assert_eq!(
            tokenize("go https://folio.dev/x now"),
            vec![
                Token::Text("go ".to_string()),
                Token::Url("https://folio.dev/x".to_string()),
                Token::Text(" now".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_emphasis() {
        let schema = parse("a **bold** and ^^lit^^ ~~gone~~ _it_").unwrap();
        assert_eq!(schema.content, "a bold and lit gone it");
        assert_eq!(
            schema.annotations,
            vec![
                Annotation::new(2, 6, AnnotationKind::Bold),
                Annotation::new(11, 14, AnnotationKind::Highlighting),
                Annotation::new(15, 19, AnnotationKind::Strikethrough),
                Annotation::new(20, 22, AnnotationKind::Italics),
            ]
        );
    }

    #[test]
    fn test_parse_nested_emphasis() {
        let schema = parse("**bold _both_**").unwrap();
        assert_eq!(schema.content, "bold both");
        assert_eq!(
            schema.annotations,
            vec![
                Annotation::new(0, 9, AnnotationKind::Bold),
                Annotation::new(5, 9, AnnotationKind::Italics),
            ]
        );
    }

    #[test]
    fn test_parse_link_and_image() {
        let schema = parse("[Folio](https://folio.dev) ![](cat.png)").unwrap();
        let expected_content = format!("Folio {}", SENTINEL);
        assert_eq!(schema.content, expected_content);
        assert_eq!(
            schema.annotations,
            vec![
                Annotation::new(
                    0,
                    5,
                    AnnotationKind::Link {
                        href: "https://folio.dev".to_string()
                    }
                ),
                Annotation::new(
                    6,
                    7,
                    AnnotationKind::Image {
                        src: "cat.png".to_string()
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_parse_image_with_alt() {
        let schema = parse("![a cat](cat.png)").unwrap();
        assert_eq!(schema.content, "a cat");
        assert_eq!(schema.annotations[0].end, 5);
    }

    #[test]
    fn test_bare_url_becomes_link() {
        let schema = parse("see https://folio.dev").unwrap();
        assert_eq!(schema.content, "see https://folio.dev");
        assert_eq!(
            schema.annotations,
            vec![Annotation::new(
                4,
                21,
                AnnotationKind::Link {
                    href: "https://folio.dev".to_string()
                }
            )]
        );
    }

    #[test]
    fn test_unmatched_markers_are_literal() {
        let schema = parse("2 * 3 = 6 and [not a link").unwrap();
        assert_eq!(schema.content, "2 * 3 = 6 and [not a link");
        assert!(schema.annotations.is_empty());

        let schema = parse("snake_case").unwrap();
        assert_eq!(schema.content, "snake_case");
    }

    #[test]
    fn test_ambiguous_emphasis_fails_closed() {
        assert_eq!(
            parse("2*3 **bold** 4*5"),
            Err(TextError::AmbiguousEmphasis)
        );
    }

    #[test]
    fn test_single_run_with_bare_star_is_fine() {
        let schema = parse("**x** rated 5*").unwrap();
        assert_eq!(schema.content, "x rated 5*");
    }

    #[test]
    fn test_empty_emphasis_is_literal() {
        let schema = parse("****").unwrap();
        assert_eq!(schema.content, "****");
        assert!(schema.annotations.is_empty());
    }
}
