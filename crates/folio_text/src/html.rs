//! Rich-text markup rendering and parsing
//!
//! The markup is a small HTML dialect designed to round-trip losslessly:
//!
//! | Annotation | Markup |
//! |------------|--------|
//! | block (bullet) | `<ul data-level="1"><li>…</li></ul>` |
//! | block (numbered) | `<ol data-level="1"><li>…</li></ol>` |
//! | block (document) | `<div data-level="1">…</div>` |
//! | bold / italics / strikethrough / highlighting | `<strong>` / `<em>` / `<del>` / `<mark>` |
//! | link | `<a href="…">…</a>` |
//! | image | `<img src="…" alt="…" />` |
//! | reference | `<span class="folio-reference" data-notebook-uuid data-notebook-page-id title="uuid:page">…</span>` |
//! | metadata | `<section data-title="…" data-parent="…">…</section>` |
//!
//! Images and empty references stand on the [`SENTINEL`] character.

use crate::tree::{build_tree, AnnotationNode};
use crate::{Annotation, AnnotationKind, InitialSchema, Result, TextError, ViewType, SENTINEL};

const REFERENCE_CLASS: &str = "folio-reference";

/// Render a schema to markup.
///
/// Annotations are put in document order before the forest is built.
pub fn to_rich_text(schema: &InitialSchema) -> String {
    let normalized = schema.normalized();
    let chars: Vec<char> = normalized.content.chars().collect();
    let forest = build_tree(&normalized.annotations);

    let mut out = String::with_capacity(normalized.content.len() * 2);
    render_children(&chars, 0, chars.len(), &forest, &mut out);
    out
}

/// Render one annotation node (and its subtree) to markup
pub fn render_node(node: &AnnotationNode, chars: &[char], out: &mut String) {
    let annotation = &node.annotation;
    let start = annotation.start.min(chars.len());
    let end = annotation.end.min(chars.len()).max(start);

    match &annotation.kind {
        AnnotationKind::Block { level, view_type } => {
            let (open, close) = match view_type {
                ViewType::Bullet => (format!("<ul data-level=\"{}\"><li>", level), "</li></ul>"),
                ViewType::Numbered => (format!("<ol data-level=\"{}\"><li>", level), "</li></ol>"),
                ViewType::Document => (format!("<div data-level=\"{}\">", level), "</div>"),
            };
            out.push_str(&open);
            render_children(chars, start, end, &node.children, out);
            out.push_str(close);
        }
        AnnotationKind::Bold => wrap("strong", chars, start, end, node, out),
        AnnotationKind::Italics => wrap("em", chars, start, end, node, out),
        AnnotationKind::Strikethrough => wrap("del", chars, start, end, node, out),
        AnnotationKind::Highlighting => wrap("mark", chars, start, end, node, out),
        AnnotationKind::Link { href } => {
            out.push_str(&format!("<a href=\"{}\">", escape_attr(href)));
            render_children(chars, start, end, &node.children, out);
            out.push_str("</a>");
        }
        AnnotationKind::Image { src } => {
            let alt: String = if is_sentinel(&chars[start..end]) {
                String::new()
            } else {
                chars[start..end].iter().collect()
            };
            out.push_str(&format!(
                "<img src=\"{}\" alt=\"{}\" />",
                escape_attr(src),
                escape_attr(&alt)
            ));
        }
        AnnotationKind::Reference {
            notebook_uuid,
            notebook_page_id,
        } => {
            out.push_str(&format!(
                "<span class=\"{}\" data-notebook-uuid=\"{}\" data-notebook-page-id=\"{}\" title=\"{}:{}\">",
                REFERENCE_CLASS,
                escape_attr(notebook_uuid),
                escape_attr(notebook_page_id),
                escape_attr(notebook_uuid),
                escape_attr(notebook_page_id),
            ));
            if !(node.children.is_empty() && is_sentinel(&chars[start..end])) {
                render_children(chars, start, end, &node.children, out);
            }
            out.push_str("</span>");
        }
        AnnotationKind::Metadata { title, parent } => {
            out.push_str(&format!("<section data-title=\"{}\"", escape_attr(title)));
            if let Some(parent) = parent {
                out.push_str(&format!(" data-parent=\"{}\"", escape_attr(parent)));
            }
            out.push('>');
            render_children(chars, start, end, &node.children, out);
            out.push_str("</section>");
        }
    }
}

fn wrap(tag: &str, chars: &[char], start: usize, end: usize, node: &AnnotationNode, out: &mut String) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    render_children(chars, start, end, &node.children, out);
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

fn render_children(chars: &[char], start: usize, end: usize, children: &[AnnotationNode], out: &mut String) {
    let end = end.min(chars.len());
    let mut cursor = start.min(end);
    for child in children {
        let child_start = child.annotation.start.clamp(cursor, end);
        push_text(&chars[cursor..child_start], out);
        render_node(child, chars, out);
        cursor = child.annotation.end.clamp(child_start, end);
    }
    push_text(&chars[cursor..end], out);
}

fn is_sentinel(chars: &[char]) -> bool {
    chars.len() == 1 && chars[0] == SENTINEL
}

fn push_text(chars: &[char], out: &mut String) {
    for &c in chars {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Parse markup back into a schema.
///
/// Inverse of [`to_rich_text`]: `from_rich_text(&to_rich_text(x)) == x` for
/// any valid `x` whose annotations are already in document order.
/// Unknown elements are transparent: their text is kept, the tag dropped.
pub fn from_rich_text(markup: &str) -> Result<InitialSchema> {
    let mut parser = MarkupParser::new(markup);
    parser.run()?;
    Ok(parser.finish())
}

struct OpenElement {
    tag: String,
    annotation: Option<usize>,
    sentinel_if_empty: bool,
}

struct MarkupParser<'a> {
    input: &'a str,
    pos: usize,
    content: String,
    len: usize,
    annotations: Vec<Annotation>,
    stack: Vec<OpenElement>,
}

impl<'a> MarkupParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            content: String::with_capacity(input.len()),
            len: 0,
            annotations: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<()> {
        while self.pos < self.input.len() {
            let rest = &self.input[self.pos..];
            match rest.find(['<', '&']) {
                Some(0) => {
                    if rest.starts_with('<') {
                        self.tag()?;
                    } else {
                        self.entity();
                    }
                }
                Some(offset) => {
                    let text = &rest[..offset];
                    self.push_str(text);
                    self.pos += offset;
                }
                None => {
                    self.push_str(rest);
                    self.pos = self.input.len();
                }
            }
        }

        if let Some(open) = self.stack.last() {
            return Err(TextError::Markup {
                offset: self.pos,
                message: format!("unclosed <{}>", open.tag),
            });
        }
        Ok(())
    }

    fn finish(mut self) -> InitialSchema {
        self.annotations.retain(|a| a.end > a.start);
        InitialSchema {
            content: self.content,
            annotations: self.annotations,
        }
    }

    fn push_char(&mut self, c: char) {
        self.content.push(c);
        self.len += 1;
    }

    fn push_str(&mut self, s: &str) {
        self.content.push_str(s);
        self.len += s.chars().count();
    }

    fn entity(&mut self) {
        let rest = &self.input[self.pos..];
        let decoded = rest
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| decode_entity(&rest[1..end]).map(|c| (c, end + 1)));

        match decoded {
            Some((c, consumed)) => {
                self.push_char(c);
                self.pos += consumed;
            }
            None => {
                self.push_char('&');
                self.pos += 1;
            }
        }
    }

    fn tag(&mut self) -> Result<()> {
        let start = self.pos;
        let rest = &self.input[start..];
        let close = rest.find('>').ok_or_else(|| TextError::Markup {
            offset: start,
            message: "unterminated tag".to_string(),
        })?;
        let inner = &rest[1..close];
        self.pos = start + close + 1;

        if inner.starts_with('!') || inner.starts_with('?') {
            return Ok(());
        }

        if let Some(name) = inner.strip_prefix('/') {
            return self.close_tag(&name.trim().to_ascii_lowercase(), start);
        }

        let self_closing = inner.ends_with('/');
        let inner = inner.trim_end_matches('/');
        let (name, attrs) = match inner.find(char::is_whitespace) {
            Some(split) => (&inner[..split], parse_attributes(&inner[split..])),
            None => (inner, Vec::new()),
        };
        let name = name.to_ascii_lowercase();
        if name.is_empty() {
            return Err(TextError::Markup {
                offset: start,
                message: "empty tag name".to_string(),
            });
        }

        self.open_tag(&name, &attrs, self_closing);
        Ok(())
    }

    fn open_tag(&mut self, name: &str, attrs: &[(String, String)], self_closing: bool) {
        let attr = |key: &str| {
            attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let level = || {
            attr("data-level")
                .and_then(|l| l.parse::<u32>().ok())
                .unwrap_or(1)
        };

        match name {
            "img" => {
                let start = self.len;
                let alt = attr("alt").unwrap_or_default();
                if alt.is_empty() {
                    self.push_char(SENTINEL);
                } else {
                    self.push_str(&alt);
                }
                self.annotations.push(Annotation::new(
                    start,
                    self.len,
                    AnnotationKind::Image {
                        src: attr("src").unwrap_or_default(),
                    },
                ));
                return;
            }
            "br" => {
                self.push_char('\n');
                return;
            }
            "hr" | "meta" | "input" | "wbr" => return,
            _ => {}
        }

        let mut sentinel_if_empty = false;
        let kind = match name {
            "strong" | "b" => Some(AnnotationKind::Bold),
            "em" | "i" => Some(AnnotationKind::Italics),
            "del" | "s" | "strike" => Some(AnnotationKind::Strikethrough),
            "mark" => Some(AnnotationKind::Highlighting),
            "a" => Some(AnnotationKind::Link {
                href: attr("href").unwrap_or_default(),
            }),
            "ul" => Some(AnnotationKind::Block {
                level: level(),
                view_type: ViewType::Bullet,
            }),
            "ol" => Some(AnnotationKind::Block {
                level: level(),
                view_type: ViewType::Numbered,
            }),
            "div" if attr("data-level").is_some() => Some(AnnotationKind::Block {
                level: level(),
                view_type: ViewType::Document,
            }),
            "span" if attr("class").is_some_and(|c| c.split_whitespace().any(|c| c == REFERENCE_CLASS)) => {
                sentinel_if_empty = true;
                Some(reference_kind(
                    attr("data-notebook-uuid"),
                    attr("data-notebook-page-id"),
                    attr("title"),
                ))
            }
            "section" if attr("data-title").is_some() => Some(AnnotationKind::Metadata {
                title: attr("data-title").unwrap_or_default(),
                parent: attr("data-parent"),
            }),
            _ => None,
        };

        let annotation = kind.map(|kind| {
            self.annotations.push(Annotation::new(self.len, self.len, kind));
            self.annotations.len() - 1
        });

        self.stack.push(OpenElement {
            tag: name.to_string(),
            annotation,
            sentinel_if_empty,
        });

        if self_closing {
            self.pop_element();
        }
    }

    fn close_tag(&mut self, name: &str, offset: usize) -> Result<()> {
        let index = self
            .stack
            .iter()
            .rposition(|open| open.tag == name)
            .ok_or_else(|| TextError::Markup {
                offset,
                message: format!("unexpected </{}>", name),
            })?;

        while self.stack.len() > index {
            self.pop_element();
        }
        Ok(())
    }

    fn pop_element(&mut self) {
        let Some(open) = self.stack.pop() else {
            return;
        };
        let Some(index) = open.annotation else {
            return;
        };
        if open.sentinel_if_empty && self.annotations[index].start == self.len {
            self.push_char(SENTINEL);
        }
        self.annotations[index].end = self.len;
    }
}

fn reference_kind(uuid: Option<String>, page: Option<String>, title: Option<String>) -> AnnotationKind {
    let (title_uuid, title_page) = title
        .as_deref()
        .and_then(|t| t.split_once(':'))
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .unwrap_or_default();

    AnnotationKind::Reference {
        notebook_uuid: uuid.unwrap_or(title_uuid),
        notebook_page_id: page.unwrap_or(title_page),
    }
}

fn parse_attributes(source: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut chars = source.char_indices().peekable();

    loop {
        while chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            chars.next();
        }
        let Some(&(name_start, _)) = chars.peek() else {
            break;
        };

        let mut name_end = source.len();
        while let Some(&(i, c)) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                name_end = i;
                break;
            }
            chars.next();
        }
        let name = source[name_start..name_end].to_ascii_lowercase();

        while chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().map(|&(_, c)| c) != Some('=') {
            if !name.is_empty() {
                attrs.push((name, String::new()));
            }
            continue;
        }
        chars.next();
        while chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            chars.next();
        }

        let value = match chars.peek().map(|&(_, c)| c) {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                let mut raw = String::new();
                for (_, c) in chars.by_ref() {
                    if c == quote {
                        break;
                    }
                    raw.push(c);
                }
                raw
            }
            _ => {
                let mut raw = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    raw.push(c);
                    chars.next();
                }
                raw
            }
        };

        attrs.push((name, decode_entities(&value)));
    }

    attrs
}

fn decode_entities(value: &str) -> String {
    let mut decoded = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        decoded.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match tail
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| decode_entity(&tail[1..end]).map(|c| (c, end + 1)))
        {
            Some((c, consumed)) => {
                decoded.push(c);
                rest = &tail[consumed..];
            }
            None => {
                decoded.push('&');
                rest = &tail[1..];
            }
        }
    }
    decoded.push_str(rest);
    decoded
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}
