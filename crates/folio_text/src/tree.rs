//! Containment forest over annotations

use crate::Annotation;

/// An annotation with the annotations nested inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationNode {
    pub annotation: Annotation,
    pub children: Vec<AnnotationNode>,
}

impl AnnotationNode {
    fn leaf(annotation: Annotation) -> Self {
        Self {
            annotation,
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including self
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(AnnotationNode::size).sum::<usize>()
    }
}

/// Build the containment forest in arrival order.
///
/// Each annotation goes under the lowest existing node that contains it,
/// picking the first containing node at every level; otherwise it becomes a
/// new root. Output is deterministic only when the input is start-sorted
/// (see [`InitialSchema::normalized`](crate::InitialSchema::normalized)).
pub fn build_tree(annotations: &[Annotation]) -> Vec<AnnotationNode> {
    let mut roots = Vec::new();
    for annotation in annotations {
        insert(&mut roots, annotation.clone());
    }
    roots
}

fn insert(nodes: &mut Vec<AnnotationNode>, annotation: Annotation) {
    match nodes
        .iter()
        .position(|node| node.annotation.contains(&annotation))
    {
        Some(index) => insert(&mut nodes[index].children, annotation),
        None => nodes.push(AnnotationNode::leaf(annotation)),
    }
}
