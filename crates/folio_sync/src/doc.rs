//! CRDT document wrapper around automerge
//!
//! Document layout:
//!
//! ```text
//! ROOT
//! ├── schemaVersion : str
//! ├── content       : Text
//! └── annotations   : List<Map { type, start, end, attributes }>
//! ```
//!
//! `attributes` is stored as a JSON string so that the annotation kind stays
//! one atomic register. Offsets are Unicode scalar indices into `content`.
//!
//! Offsets are plain registers, so concurrent edits can merge to ranges
//! that overrun the text or cross each other. [`SharedDocument::to_schema`]
//! repairs them deterministically, and local edits clamp stored offsets
//! before shifting them.

use crate::{Result, SyncError};
use automerge::transaction::Transactable;
use automerge::{ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};
use folio_common::Notebook;
use folio_text::{Annotation, AnnotationKind, InitialSchema, SCHEMA_VERSION};
use sha2::{Digest, Sha256};

/// Deterministic actor id derived from the notebook identity
pub fn actor_for(notebook: &Notebook) -> ActorId {
    let digest = Sha256::digest(notebook.key().as_bytes());
    ActorId::from(digest[..16].to_vec())
}

/// Hex form of change hashes, sorted
pub fn hex_heads(heads: &[ChangeHash]) -> Vec<String> {
    let mut out: Vec<String> = heads
        .iter()
        .map(|h| h.0.iter().map(|b| format!("{:02x}", b)).collect())
        .collect();
    out.sort();
    out
}

/// A shared page held as an automerge document
pub struct SharedDocument {
    doc: AutoCommit,
    content: ObjId,
    annotations: ObjId,
}

impl SharedDocument {
    /// Seed a new document from a page snapshot
    pub fn from_schema(notebook: &Notebook, schema: &InitialSchema) -> Result<Self> {
        schema.validate()?;

        let mut doc = AutoCommit::new().with_actor(actor_for(notebook));
        doc.put(ROOT, "schemaVersion", SCHEMA_VERSION)?;
        let content = doc.put_object(ROOT, "content", ObjType::Text)?;
        doc.splice_text(&content, 0, 0, &schema.content)?;
        let annotations = doc.put_object(ROOT, "annotations", ObjType::List)?;

        let mut shared = Self {
            doc,
            content,
            annotations,
        };
        for (index, annotation) in schema.normalized().annotations.iter().enumerate() {
            shared.insert_annotation(index, annotation)?;
        }
        Ok(shared)
    }

    /// Load a saved binary state, acting as `notebook` for further edits
    pub fn load(notebook: &Notebook, bytes: &[u8]) -> Result<Self> {
        let doc = AutoCommit::load(bytes)?.with_actor(actor_for(notebook));
        let content = object_at(&doc, "content", ObjType::Text)?;
        let annotations = object_at(&doc, "annotations", ObjType::List)?;
        Ok(Self {
            doc,
            content,
            annotations,
        })
    }

    /// Full binary state
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Changes made since `heads`, as one incremental blob
    pub fn changes_since(&mut self, heads: &[ChangeHash]) -> Vec<u8> {
        self.doc.save_after(heads)
    }

    pub fn heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Apply remote change blobs. Blobs already seen are no-ops, and blobs
    /// whose dependencies are missing wait until those arrive.
    pub fn apply_changes(&mut self, changes: &[Vec<u8>]) -> Result<()> {
        for blob in changes {
            self.doc.load_incremental(blob)?;
        }
        Ok(())
    }

    /// Insert `text` at char `index`, shifting annotations behind it
    pub fn insert_text(&mut self, index: usize, text: &str) -> Result<()> {
        let len = self.doc.length(&self.content);
        if index > len {
            return Err(SyncError::InvalidDocument(format!(
                "insert at {} past end {}",
                index, len
            )));
        }
        let added = text.chars().count();
        if added == 0 {
            return Ok(());
        }

        self.doc.splice_text(&self.content, index, 0, text)?;
        self.remap_annotations(len, |pos, is_end| {
            if pos > index || (pos == index && !is_end) {
                pos + added
            } else {
                pos
            }
        })
    }

    /// Delete `count` chars at `index`; annotations collapsing to nothing are removed
    pub fn delete_text(&mut self, index: usize, count: usize) -> Result<()> {
        let len = self.doc.length(&self.content);
        if index + count > len {
            return Err(SyncError::InvalidDocument(format!(
                "delete {}..{} past end {}",
                index,
                index + count,
                len
            )));
        }
        if count == 0 {
            return Ok(());
        }

        self.doc
            .splice_text(&self.content, index, count as _, "")?;
        let end = index + count;
        self.remap_annotations(len, |pos, _| {
            if pos <= index {
                pos
            } else if pos >= end {
                pos - count
            } else {
                index
            }
        })
    }

    /// Bring the document to `schema` with a single content splice and, if
    /// they differ, a rewrite of the annotation list
    pub fn replace_with(&mut self, schema: &InitialSchema) -> Result<()> {
        schema.validate()?;

        let current: Vec<char> = self.doc.text(&self.content)?.chars().collect();
        let target: Vec<char> = schema.content.chars().collect();

        let prefix = current
            .iter()
            .zip(&target)
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = current[prefix..]
            .iter()
            .rev()
            .zip(target[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let removed = current.len() - prefix - suffix;
        let inserted: String = target[prefix..target.len() - suffix].iter().collect();
        if removed > 0 || !inserted.is_empty() {
            self.doc
                .splice_text(&self.content, prefix, removed as _, &inserted)?;
        }

        let wanted = schema.normalized().annotations;
        if self.annotations()? != wanted {
            for index in (0..self.doc.length(&self.annotations)).rev() {
                self.doc.delete(&self.annotations, index)?;
            }
            for (index, annotation) in wanted.iter().enumerate() {
                self.insert_annotation(index, annotation)?;
            }
        }
        Ok(())
    }

    pub fn content(&self) -> Result<String> {
        Ok(self.doc.text(&self.content)?)
    }

    pub fn annotations(&self) -> Result<Vec<Annotation>> {
        let mut out = Vec::new();
        for index in 0..self.doc.length(&self.annotations) {
            let map = match self.doc.get(&self.annotations, index)? {
                Some((Value::Object(ObjType::Map), id)) => id,
                _ => {
                    return Err(SyncError::InvalidDocument(format!(
                        "annotation {} is not a map",
                        index
                    )))
                }
            };

            let type_name = read_str(&self.doc, &map, "type")?;
            let attributes = serde_json::from_str(&read_str(&self.doc, &map, "attributes")?)?;
            let kind = AnnotationKind::from_parts(&type_name, attributes)?;
            out.push(Annotation::new(
                read_index(&self.doc, &map, "start")?,
                read_index(&self.doc, &map, "end")?,
                kind,
            ));
        }
        Ok(out)
    }

    /// Materialize the current state. Merged offsets are clamped and
    /// conflicting annotations dropped, so the result always validates.
    pub fn to_schema(&self) -> Result<InitialSchema> {
        Ok(InitialSchema::new(self.content()?, self.annotations()?).repaired())
    }

    pub fn schema_version(&self) -> Result<Option<String>> {
        match self.doc.get(ROOT, "schemaVersion")? {
            Some((Value::Scalar(s), _)) => match &*s {
                ScalarValue::Str(v) => Ok(Some(v.to_string())),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn insert_annotation(&mut self, index: usize, annotation: &Annotation) -> Result<()> {
        let map = self
            .doc
            .insert_object(&self.annotations, index, ObjType::Map)?;
        self.doc.put(&map, "type", annotation.kind.type_name())?;
        self.doc.put(&map, "start", annotation.start as u64)?;
        self.doc.put(&map, "end", annotation.end as u64)?;
        self.doc
            .put(&map, "attributes", annotation.kind.attributes().to_string())?;
        Ok(())
    }

    /// Rewrite annotation offsets through `map(pos, is_end)`, writing only
    /// fields that change and dropping annotations that become empty.
    /// Offsets are first clamped to `len`, the content length before the edit.
    fn remap_annotations(&mut self, len: usize, map: impl Fn(usize, bool) -> usize) -> Result<()> {
        let count = self.doc.length(&self.annotations);
        for index in (0..count).rev() {
            let obj = match self.doc.get(&self.annotations, index)? {
                Some((Value::Object(ObjType::Map), id)) => id,
                _ => continue,
            };
            let start = read_index(&self.doc, &obj, "start")?;
            let end = read_index(&self.doc, &obj, "end")?;
            let (new_start, new_end) = (map(start.min(len), false), map(end.min(len), true));

            if new_start >= new_end {
                self.doc.delete(&self.annotations, index)?;
                continue;
            }
            if new_start != start {
                self.doc.put(&obj, "start", new_start as u64)?;
            }
            if new_end != end {
                self.doc.put(&obj, "end", new_end as u64)?;
            }
        }
        Ok(())
    }
}

fn object_at(doc: &AutoCommit, key: &str, expected: ObjType) -> Result<ObjId> {
    match doc.get(ROOT, key)? {
        Some((Value::Object(kind), id)) if kind == expected => Ok(id),
        _ => Err(SyncError::InvalidDocument(format!(
            "missing {:?} object '{}'",
            expected, key
        ))),
    }
}

fn read_str(doc: &AutoCommit, obj: &ObjId, key: &str) -> Result<String> {
    match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match &*s {
            ScalarValue::Str(v) => Ok(v.to_string()),
            other => Err(SyncError::InvalidDocument(format!(
                "'{}' is not a string: {:?}",
                key, other
            ))),
        },
        _ => Err(SyncError::InvalidDocument(format!("missing '{}'", key))),
    }
}

fn read_index(doc: &AutoCommit, obj: &ObjId, key: &str) -> Result<usize> {
    match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match &*s {
            ScalarValue::Uint(n) => Ok(*n as usize),
            ScalarValue::Int(n) if *n >= 0 => Ok(*n as usize),
            other => Err(SyncError::InvalidDocument(format!(
                "'{}' is not an offset: {:?}",
                key, other
            ))),
        },
        _ => Err(SyncError::InvalidDocument(format!("missing '{}'", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_text::ViewType;

    fn alice() -> Notebook {
        Notebook::new(1, "alice")
    }

    fn bob() -> Notebook {
        Notebook::new(1, "bob")
    }

    fn sample() -> InitialSchema {
        InitialSchema::new(
            "Hello world",
            vec![
                Annotation::new(
                    0,
                    11,
                    AnnotationKind::Block {
                        level: 1,
                        view_type: ViewType::Document,
                    },
                ),
                Annotation::new(6, 11, AnnotationKind::Bold),
            ],
        )
    }

    /// Materialized state plus heads, which identify the change set
    fn snapshot(doc: &mut SharedDocument) -> (InitialSchema, Vec<String>) {
        let heads = hex_heads(&doc.heads());
        (doc.to_schema().unwrap(), heads)
    }

    #[test]
    fn test_seed_and_materialize() {
        let mut doc = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        assert_eq!(doc.to_schema().unwrap(), sample());
        assert_eq!(doc.schema_version().unwrap().as_deref(), Some(SCHEMA_VERSION));

        let bytes = doc.save();
        let loaded = SharedDocument::load(&bob(), &bytes).unwrap();
        assert_eq!(loaded.to_schema().unwrap(), sample());
    }

    #[test]
    fn test_actor_is_stable_per_notebook() {
        assert_eq!(actor_for(&alice()), actor_for(&alice()));
        assert_ne!(actor_for(&alice()), actor_for(&bob()));
    }

    #[test]
    fn test_invalid_schema_is_rejected() {
        let schema = InitialSchema::new("abc", vec![Annotation::new(1, 9, AnnotationKind::Bold)]);
        assert!(SharedDocument::from_schema(&alice(), &schema).is_err());
    }

    #[test]
    fn test_insert_shifts_annotations() {
        let mut doc = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        doc.insert_text(0, ">> ").unwrap();

        let schema = doc.to_schema().unwrap();
        assert_eq!(schema.content, ">> Hello world");
        assert_eq!(schema.annotations[0].start, 3);
        assert_eq!(schema.annotations[1].start, 9);
        assert_eq!(schema.annotations[1].end, 14);
    }

    #[test]
    fn test_insert_at_annotation_end_does_not_extend_it() {
        let mut doc = SharedDocument::from_schema(
            &alice(),
            &InitialSchema::new("ab", vec![Annotation::new(0, 2, AnnotationKind::Bold)]),
        )
        .unwrap();
        doc.insert_text(2, "cd").unwrap();
        assert_eq!(doc.annotations().unwrap()[0].end, 2);
    }

    #[test]
    fn test_delete_collapses_covered_annotation() {
        let mut doc = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        doc.delete_text(5, 6).unwrap();

        let schema = doc.to_schema().unwrap();
        assert_eq!(schema.content, "Hello");
        assert_eq!(schema.annotations.len(), 1);
        assert_eq!(schema.annotations[0].end, 5);
    }

    #[test]
    fn test_out_of_range_edit_fails() {
        let mut doc = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        assert!(doc.insert_text(50, "x").is_err());
        assert!(doc.delete_text(10, 5).is_err());
    }

    #[test]
    fn test_replace_with_reaches_target() {
        let mut doc = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        let target = InitialSchema::new(
            "Hello brave world",
            vec![Annotation::new(6, 11, AnnotationKind::Italics)],
        );
        doc.replace_with(&target).unwrap();
        assert_eq!(doc.to_schema().unwrap(), target);
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut a = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        let mut b = SharedDocument::load(&bob(), &a.save()).unwrap();

        let a_base = a.heads();
        a.insert_text(0, "A:").unwrap();
        let a_diff = a.changes_since(&a_base);

        let b_base = b.heads();
        b.insert_text(11, "!").unwrap();
        b.delete_text(0, 1).unwrap();
        let b_diff = b.changes_since(&b_base);

        a.apply_changes(&[b_diff]).unwrap();
        b.apply_changes(&[a_diff]).unwrap();

        let (schema_a, heads_a) = snapshot(&mut a);
        let (schema_b, heads_b) = snapshot(&mut b);
        assert_eq!(schema_a, schema_b);
        assert_eq!(heads_a, heads_b);
        assert_eq!(schema_a.content, "A:ello world!");
    }

    #[test]
    fn test_reapplying_changes_is_idempotent() {
        let mut a = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        let mut b = SharedDocument::load(&bob(), &a.save()).unwrap();

        let base = a.heads();
        a.insert_text(5, ",").unwrap();
        let diff = a.changes_since(&base);

        b.apply_changes(&[diff.clone()]).unwrap();
        let once = snapshot(&mut b);
        b.apply_changes(&[diff.clone(), diff]).unwrap();
        assert_eq!(snapshot(&mut b), once);
    }

    #[test]
    fn test_out_of_order_diffs_converge() {
        let mut a = SharedDocument::from_schema(&alice(), &sample()).unwrap();
        let mut b = SharedDocument::load(&bob(), &a.save()).unwrap();

        let h0 = a.heads();
        a.insert_text(0, "1").unwrap();
        let first = a.changes_since(&h0);
        let h1 = a.heads();
        a.insert_text(0, "2").unwrap();
        let second = a.changes_since(&h1);

        b.apply_changes(&[second]).unwrap();
        b.apply_changes(&[first]).unwrap();
        assert_eq!(snapshot(&mut b), snapshot(&mut a));
    }

    #[test]
    fn test_concurrent_delete_and_insert_stay_valid() {
        let base = InitialSchema::new("abcdef", vec![Annotation::new(0, 6, AnnotationKind::Bold)]);
        let mut a = SharedDocument::from_schema(&alice(), &base).unwrap();
        let mut b = SharedDocument::load(&bob(), &a.save()).unwrap();

        let a_base = a.heads();
        a.delete_text(3, 3).unwrap();
        let a_diff = a.changes_since(&a_base);

        let b_base = b.heads();
        b.insert_text(0, "ZZZZZZZZZZ").unwrap();
        let b_diff = b.changes_since(&b_base);

        a.apply_changes(&[b_diff]).unwrap();
        b.apply_changes(&[a_diff]).unwrap();

        let (schema_a, heads_a) = snapshot(&mut a);
        let (schema_b, heads_b) = snapshot(&mut b);
        assert_eq!(heads_a, heads_b);
        assert_eq!(schema_a, schema_b);
        assert_eq!(schema_a.content, "ZZZZZZZZZZabc");
        assert!(schema_a.validate().is_ok());

        // the repaired snapshot can be written back, as a host sync does
        a.replace_with(&schema_a).unwrap();
        a.insert_text(13, "!").unwrap();
        let after = a.to_schema().unwrap();
        assert!(after.validate().is_ok());
        assert!(after.annotations.iter().all(|annotation| annotation.end <= 13));
    }

    #[test]
    fn test_load_rejects_foreign_document() {
        let mut other = AutoCommit::new();
        other.put(ROOT, "unrelated", "x").unwrap();
        assert!(SharedDocument::load(&alice(), &other.save()).is_err());
    }
}
