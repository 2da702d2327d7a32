//! # Folio Annotated Text
//!
//! The data structure exchanged between a notebook's local page and the
//! replicated shared document: a content string plus an ordered list of
//! annotations over half-open character ranges.
//!
//! - [`tree`]: build the containment forest used for rendering
//! - [`html`]: lossless render to / parse from rich-text markup
//! - [`lexer`]: inline plain-text grammar (`**bold**`, `[link](href)`, ...)
//!
//! All offsets are `char` offsets into `content`.

pub mod html;
pub mod lexer;
pub mod tree;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use html::{from_rich_text, to_rich_text};
pub use lexer::{parse as parse_inline, tokenize, Token};
pub use tree::{build_tree, AnnotationNode};

/// Placeholder content for annotations that carry no text of their own
/// (an image without alt text, an empty reference), so ranges are never
/// zero-length.
pub const SENTINEL: char = '\u{FFFC}';

/// Tag stored alongside replicated documents
pub const SCHEMA_VERSION: &str = "folio/annotated-text;v1";

/// Errors produced while validating or parsing annotated text
#[derive(Debug, Error, PartialEq)]
pub enum TextError {
    #[error("annotation {index} has invalid range [{start}, {end}) for content of length {len}")]
    InvalidRange {
        index: usize,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("annotations {first} and {second} partially overlap")]
    PartialOverlap { first: usize, second: usize },

    #[error("block annotations {first} and {second} are not strictly nested")]
    BlockOverlap { first: usize, second: usize },

    #[error("markup error at offset {offset}: {message}")]
    Markup { offset: usize, message: String },

    #[error("ambiguous emphasis: more than one plain run contains a bare '*' or '_'")]
    AmbiguousEmphasis,

    #[error("unknown annotation type '{0}'")]
    UnknownType(String),

    #[error("invalid annotation attributes: {0}")]
    Attributes(String),
}

pub type Result<T> = std::result::Result<T, TextError>;

/// How a block renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    Bullet,
    Numbered,
    Document,
}

/// The closed set of annotation types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnnotationKind {
    Block {
        level: u32,
        #[serde(rename = "viewType")]
        view_type: ViewType,
    },
    Bold,
    Italics,
    Strikethrough,
    Highlighting,
    Link {
        href: String,
    },
    Image {
        src: String,
    },
    Reference {
        #[serde(rename = "notebookUuid")]
        notebook_uuid: String,
        #[serde(rename = "notebookPageId")]
        notebook_page_id: String,
    },
    Metadata {
        title: String,
        #[serde(default)]
        parent: Option<String>,
    },
}

impl AnnotationKind {
    /// The `type` tag used on the wire and in the replicated document
    pub fn type_name(&self) -> &'static str {
        match self {
            AnnotationKind::Block { .. } => "block",
            AnnotationKind::Bold => "bold",
            AnnotationKind::Italics => "italics",
            AnnotationKind::Strikethrough => "strikethrough",
            AnnotationKind::Highlighting => "highlighting",
            AnnotationKind::Link { .. } => "link",
            AnnotationKind::Image { .. } => "image",
            AnnotationKind::Reference { .. } => "reference",
            AnnotationKind::Metadata { .. } => "metadata",
        }
    }

    /// Type-specific fields as a JSON object (empty for plain marks)
    pub fn attributes(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("type");
                serde_json::Value::Object(map)
            }
            _ => serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Inverse of [`type_name`](Self::type_name) + [`attributes`](Self::attributes)
    pub fn from_parts(type_name: &str, attributes: serde_json::Value) -> Result<Self> {
        let mut map = match attributes {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => return Err(TextError::Attributes(format!("expected object, got {}", other))),
        };
        map.insert("type".to_string(), serde_json::Value::String(type_name.to_string()));

        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
            if e.to_string().contains("unknown variant") {
                TextError::UnknownType(type_name.to_string())
            } else {
                TextError::Attributes(e.to_string())
            }
        })
    }

    pub fn is_block(&self) -> bool {
        matches!(self, AnnotationKind::Block { .. })
    }
}

/// One annotation over the half-open range `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub start: usize,
    pub end: usize,
    #[serde(flatten)]
    pub kind: AnnotationKind,
}

impl Annotation {
    pub fn new(start: usize, end: usize, kind: AnnotationKind) -> Self {
        Self { start, end, kind }
    }

    /// Whether `other` lies fully inside this range (equal ranges count)
    pub fn contains(&self, other: &Annotation) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn is_disjoint(&self, other: &Annotation) -> bool {
        self.end <= other.start || other.end <= self.start
    }

    /// Whether the two can sit in one forest: disjoint, or one inside the
    /// other, and never two blocks over the same range
    pub fn nests_with(&self, other: &Annotation) -> bool {
        if self.is_disjoint(other) {
            return true;
        }
        let same_range = self.start == other.start && self.end == other.end;
        (self.contains(other) || other.contains(self))
            && !(same_range && self.kind.is_block() && other.kind.is_block())
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A page as content plus annotations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSchema {
    pub content: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl InitialSchema {
    pub fn new(content: impl Into<String>, annotations: Vec<Annotation>) -> Self {
        Self {
            content: content.into(),
            annotations,
        }
    }

    /// Plain text without annotations
    pub fn plain(content: impl Into<String>) -> Self {
        Self::new(content, Vec::new())
    }

    /// Content length in chars
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Check ranges and the forest invariant
    pub fn validate(&self) -> Result<()> {
        let len = self.char_len();
        for (index, annotation) in self.annotations.iter().enumerate() {
            if annotation.start >= annotation.end || annotation.end > len {
                return Err(TextError::InvalidRange {
                    index,
                    start: annotation.start,
                    end: annotation.end,
                    len,
                });
            }
        }

        for (i, a) in self.annotations.iter().enumerate() {
            for (j, b) in self.annotations.iter().enumerate().skip(i + 1) {
                if a.is_disjoint(b) {
                    continue;
                }
                if !a.contains(b) && !b.contains(a) {
                    return Err(TextError::PartialOverlap { first: i, second: j });
                }
                if a.kind.is_block() && b.kind.is_block() && a.start == b.start && a.end == b.end {
                    return Err(TextError::BlockOverlap { first: i, second: j });
                }
            }
        }
        Ok(())
    }

    /// Clamp ranges to the content, then drop annotations that are empty or
    /// do not nest with one kept before them. The result always validates,
    /// and equal inputs give equal outputs.
    pub fn repaired(&self) -> Self {
        let len = self.char_len();
        let mut kept: Vec<Annotation> = Vec::with_capacity(self.annotations.len());
        for annotation in &self.annotations {
            let candidate = Annotation::new(
                annotation.start,
                annotation.end.min(len),
                annotation.kind.clone(),
            );
            if candidate.is_empty() || !kept.iter().all(|other| other.nests_with(&candidate)) {
                tracing::debug!(
                    start = annotation.start,
                    end = annotation.end,
                    "dropping annotation that no longer fits"
                );
                continue;
            }
            kept.push(candidate);
        }
        Self {
            content: self.content.clone(),
            annotations: kept,
        }
    }

    /// Annotations in document order: `start` ascending, enclosing first.
    /// The sort is stable so same-range annotations keep their order.
    pub fn normalized(&self) -> Self {
        let mut annotations = self.annotations.clone();
        annotations.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        Self {
            content: self.content.clone(),
            annotations,
        }
    }

    /// The chars of `content` in `[start, end)`
    pub fn slice(&self, start: usize, end: usize) -> String {
        self.content
            .chars()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bold(start: usize, end: usize) -> Annotation {
        Annotation::new(start, end, AnnotationKind::Bold)
    }

    #[test]
    fn test_annotation_json_shape() {
        let link = Annotation::new(
            0,
            4,
            AnnotationKind::Link {
                href: "https://folio.dev".to_string(),
            },
        );
        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"start": 0, "end": 4, "type": "link", "href": "https://folio.dev"})
        );

        let back: Annotation = serde_json::from_value(json).unwrap();
        assert_eq!(back, link);
    }

    #[test]
    fn test_block_json_uses_view_type() {
        let block = Annotation::new(
            0,
            3,
            AnnotationKind::Block {
                level: 2,
                view_type: ViewType::Numbered,
            },
        );
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["viewType"], "numbered");
        assert_eq!(json["level"], 2);
    }

    #[test]
    fn test_parts_roundtrip() {
        let kind = AnnotationKind::Reference {
            notebook_uuid: "nb-1".to_string(),
            notebook_page_id: "page-7".to_string(),
        };
        let rebuilt = AnnotationKind::from_parts(kind.type_name(), kind.attributes()).unwrap();
        assert_eq!(rebuilt, kind);

        let mark = AnnotationKind::from_parts("italics", serde_json::Value::Null).unwrap();
        assert_eq!(mark, AnnotationKind::Italics);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = AnnotationKind::from_parts("underline", serde_json::json!({})).unwrap_err();
        assert_eq!(err, TextError::UnknownType("underline".to_string()));
    }

    #[test]
    fn test_validate_accepts_nesting() {
        let schema = InitialSchema::new("hello world", vec![bold(0, 11), bold(0, 5), bold(6, 11)]);
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_partial_overlap() {
        let schema = InitialSchema::new("hello world", vec![bold(0, 6), bold(3, 9)]);
        assert_eq!(
            schema.validate(),
            Err(TextError::PartialOverlap { first: 0, second: 1 })
        );
    }

    #[test]
    fn test_validate_rejects_empty_and_out_of_bounds() {
        let empty = InitialSchema::new("abc", vec![bold(1, 1)]);
        assert!(matches!(empty.validate(), Err(TextError::InvalidRange { .. })));

        let beyond = InitialSchema::new("abc", vec![bold(1, 4)]);
        assert!(matches!(beyond.validate(), Err(TextError::InvalidRange { .. })));
    }

    #[test]
    fn test_validate_rejects_identical_blocks() {
        let block = |level| {
            Annotation::new(
                0,
                3,
                AnnotationKind::Block {
                    level,
                    view_type: ViewType::Bullet,
                },
            )
        };
        let schema = InitialSchema::new("abc", vec![block(1), block(2)]);
        assert_eq!(
            schema.validate(),
            Err(TextError::BlockOverlap { first: 0, second: 1 })
        );
    }

    #[test]
    fn test_repaired_clamps_and_drops() {
        let schema = InitialSchema::new(
            "ZZZZZZZZZZabc",
            vec![bold(10, 16), bold(2, 2), bold(8, 12), bold(20, 30), bold(11, 13)],
        );
        let repaired = schema.repaired();
        assert!(repaired.validate().is_ok());
        assert_eq!(repaired.annotations, vec![bold(10, 13), bold(11, 13)]);
    }

    #[test]
    fn test_repaired_keeps_valid_schema() {
        let schema = InitialSchema::new("hello world", vec![bold(0, 11), bold(0, 5), bold(6, 11)]);
        assert_eq!(schema.repaired(), schema);
    }

    #[test]
    fn test_normalized_orders_enclosing_first() {
        let schema = InitialSchema::new("hello world", vec![bold(6, 11), bold(0, 5), bold(0, 11)]);
        let starts: Vec<(usize, usize)> = schema
            .normalized()
            .annotations
            .iter()
            .map(|a| (a.start, a.end))
            .collect();
        assert_eq!(starts, vec![(0, 11), (0, 5), (6, 11)]);
    }

    #[test]
    fn test_slice_counts_chars() {
        let schema = InitialSchema::plain("héllo wörld");
        assert_eq!(schema.slice(6, 11), "wörld");
        assert_eq!(schema.char_len(), 11);
    }
}
