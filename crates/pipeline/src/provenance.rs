//! Provenance graph
//!
//! Every generated row names its inputs. Walking those references from a
//! row down to the source documents yields a DAG; `verify_acyclic` is also
//! used to validate a job's unit dependency graph before dispatch.

use filingforge_common::errors::{AppError, Result};
use filingforge_common::store::PipelineStore;
use filingforge_common::types::{Document, GeneratedContent, InputRef};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use uuid::Uuid;

/// Edge from a generated row to one of its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProvenanceEdge {
    pub consumer: Uuid,
    pub input: InputRef,
}

/// Lineage of one generated row down to its source documents
#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceGraph {
    pub root: Uuid,
    documents: BTreeMap<Uuid, Document>,
    contents: BTreeMap<Uuid, GeneratedContent>,
    edges: Vec<ProvenanceEdge>,
}

impl ProvenanceGraph {
    /// Walk `inputs` from the root row down to document leaves
    pub async fn load(store: &dyn PipelineStore, root: Uuid) -> Result<Self> {
        let root_content = store
            .get_content(root)
            .await?
            .ok_or_else(|| AppError::ContentNotFound { id: root.to_string() })?;

        let mut graph = Self {
            root,
            documents: BTreeMap::new(),
            contents: BTreeMap::new(),
            edges: Vec::new(),
        };

        let mut queue = VecDeque::from([root_content]);
        while let Some(content) = queue.pop_front() {
            if graph.contents.contains_key(&content.id) {
                continue;
            }

            for input in &content.inputs {
                graph.edges.push(ProvenanceEdge {
                    consumer: content.id,
                    input: *input,
                });

                match input {
                    InputRef::Document(id) => {
                        if graph.documents.contains_key(id) {
                            continue;
                        }
                        let doc = store
                            .get_document(*id)
                            .await?
                            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })?;
                        graph.documents.insert(doc.id, doc);
                    }
                    InputRef::Content(id) => {
                        if graph.contents.contains_key(id) {
                            continue;
                        }
                        let upstream = store
                            .get_content(*id)
                            .await?
                            .ok_or_else(|| AppError::ContentNotFound { id: id.to_string() })?;
                        queue.push_back(upstream);
                    }
                }
            }

            graph.contents.insert(content.id, content);
        }

        Ok(graph)
    }

    /// Source documents, by id
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Generated rows including the root, by id
    pub fn contents(&self) -> impl Iterator<Item = &GeneratedContent> {
        self.contents.values()
    }

    pub fn edges(&self) -> &[ProvenanceEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.documents.len() + self.contents.len()
    }

    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_ok()
    }

    /// Node ids ordered inputs-first: documents, then each row after its inputs
    pub fn topological_order(&self) -> Result<Vec<Uuid>> {
        let nodes = self.documents.keys().chain(self.contents.keys()).copied();
        let edges = self.edges.iter().map(|e| (e.input.id(), e.consumer));
        verify_acyclic(nodes, edges)
    }
}

/// Kahn's algorithm over `(from, to)` edges, where `from` must precede `to`.
/// Returns a deterministic topological order, or `AppError::Validation`
/// naming the nodes left on a cycle.
pub fn verify_acyclic(
    nodes: impl IntoIterator<Item = Uuid>,
    edges: impl IntoIterator<Item = (Uuid, Uuid)>,
) -> Result<Vec<Uuid>> {
    let mut indegree: BTreeMap<Uuid, usize> = nodes.into_iter().map(|n| (n, 0)).collect();
    let mut outgoing: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for (from, to) in edges {
        if !indegree.contains_key(&from) || !indegree.contains_key(&to) {
            return Err(AppError::Validation {
                message: format!("edge {} -> {} references an unknown node", from, to),
                field: None,
            });
        }
        outgoing.entry(from).or_default().push(to);
        *indegree.entry(to).or_default() += 1;
    }

    let mut ready: BTreeSet<Uuid> = indegree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(indegree.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for next in outgoing.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if order.len() != indegree.len() {
        let stuck: Vec<String> = indegree
            .iter()
            .filter(|&(_, &d)| d > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        return Err(AppError::Validation {
            message: format!("dependency cycle through {}", stuck.join(", ")),
            field: None,
        });
    }

    Ok(order)
}
