//! The typed DAG model: node identity, edges, and build-time validation.
//!
//! A [`Graph`] is produced only by [`crate::core::builder::GraphBuilder::build`],
//! which runs the checks described here and refuses to hand back anything
//! that violates them.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Stable identifier for a node. Cheap to clone (reference-counted string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId::new(value)
    }
}

/// The three node kinds a graph can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// No input; has at least one outgoing edge once validated.
    Source,
    /// Exactly one input type and one output type.
    Transform,
    /// No output; has at least one incoming edge once validated.
    Sink,
}

/// A port name on the consuming side of an edge. Most transforms have a
/// single implicit input port (`"in"`); multi-input nodes (join) declare
/// additional named ports, of which at most one may be a declared *merge
/// port* accepting more than one incoming edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortId(Arc<str>);

impl PortId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PortId {
    /// The implicit single input/output port most nodes use.
    fn default() -> Self {
        PortId::new("in")
    }
}

impl From<&str> for PortId {
    fn from(value: &str) -> Self {
        PortId::new(value)
    }
}

/// Declared node metadata recorded in the graph: its kind and the element
/// type ids it produces/consumes, used for the producer/consumer type-match
/// check at build time. Sources have no input type; sinks have no output
/// type.
#[derive(Debug, Clone)]
pub struct NodeDecl {
    pub id: NodeId,
    pub kind: NodeKind,
    pub input_type: Option<TypeId>,
    pub output_type: Option<TypeId>,
    pub merge_ports: HashSet<PortId>,
}

/// A directed edge `(from_id, output_port) -> (to_id, input_port)`.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub to_port: PortId,
    pub pipe_capacity_override: Option<usize>,
}

/// The reason a [`Graph`] failed to validate. Exactly one violation class
/// is reported per failed build — the first one the validator encounters.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("edge references unknown node id '{0}'")]
    UnknownId(String),

    #[error("duplicate node id '{0}'")]
    DuplicateId(String),

    #[error("edge {from} -> {to}.{port} has mismatched element types")]
    TypeMismatch {
        from: String,
        to: String,
        port: String,
    },

    #[error("graph contains a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("node '{0}' has no outgoing edge but is declared as a source")]
    OrphanSource(String),

    #[error("node '{0}' has no incoming edge but is declared as a sink")]
    OrphanSink(String),

    #[error("transform '{0}' is missing {1}")]
    OrphanTransform(String, &'static str),

    #[error("port {to}.{port} already has a producer and is not declared as a merge port")]
    MultiProducer { to: String, port: String },
}

/// A validated, frozen DAG of nodes and edges. The only way to get one is
/// through [`crate::core::builder::GraphBuilder::build`].
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) nodes: HashMap<NodeId, NodeDecl>,
    pub(crate) edges: Vec<Edge>,
}

impl Graph {
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeDecl> {
        self.nodes.get(id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges from a node, in the order they were added.
    pub fn outgoing(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| &e.from == id)
    }

    /// Incoming edges to `(id, port)`.
    pub fn incoming(&self, id: &NodeId, port: &PortId) -> impl Iterator<Item = &Edge> {
        self.edges
            .iter()
            .filter(move |e| &e.to == id && &e.to_port == port)
    }

    /// A reverse-topological ordering of node ids (sinks first, sources
    /// last). Used by the runner to start consumer drivers before producer
    /// drivers, as an optimisation — pipes buffer regardless of start
    /// order, so this is never required for correctness.
    pub fn reverse_topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<NodeId, usize> = self
            .nodes
            .keys()
            .map(|id| (id.clone(), 0))
            .collect();
        for edge in &self.edges {
            *in_degree.entry(edge.from.clone()).or_insert(0) += 1;
        }

        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(id.clone());
            for edge in self.incoming_all(&id) {
                if let Some(degree) = in_degree.get_mut(&edge.from) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(edge.from.clone());
                    }
                }
            }
        }
        order
    }

    fn incoming_all(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| &e.to == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_equality_and_display() {
        let a = NodeId::from("a");
        let b = NodeId::from("a".to_string());
        assert_eq!(a, b);
        assert_eq!(format!("{a}"), "a");
    }

    #[test]
    fn default_port_is_in() {
        assert_eq!(PortId::default().as_str(), "in");
    }
}
