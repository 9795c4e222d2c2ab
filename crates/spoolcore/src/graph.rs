use crate::workflow::{Connection, NodeId, NodeKind, WorkflowDefinition};
use std::collections::HashMap;

static NO_EDGES: &[Connection] = &[];

/// Adjacency index over a validated definition, keyed by opaque node
/// ids. Built once per run; the definition itself stays flat.
pub struct GraphIndex {
    inbound: HashMap<NodeId, Vec<Connection>>,
    outbound: HashMap<NodeId, Vec<Connection>>,
    roots: Vec<NodeId>,
}

impl GraphIndex {
    pub fn new(workflow: &WorkflowDefinition) -> Self {
        let mut inbound: HashMap<NodeId, Vec<Connection>> = HashMap::new();
        let mut outbound: HashMap<NodeId, Vec<Connection>> = HashMap::new();
        for conn in &workflow.connections {
            outbound
                .entry(conn.source_node)
                .or_default()
                .push(conn.clone());
            inbound
                .entry(conn.target_node)
                .or_default()
                .push(conn.clone());
        }
        let roots = workflow
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Trigger)
            .map(|n| n.id)
            .collect();
        Self {
            inbound,
            outbound,
            roots,
        }
    }

    pub fn inbound(&self, node: NodeId) -> &[Connection] {
        self.inbound.get(&node).map(Vec::as_slice).unwrap_or(NO_EDGES)
    }

    pub fn outbound(&self, node: NodeId) -> &[Connection] {
        self.outbound.get(&node).map(Vec::as_slice).unwrap_or(NO_EDGES)
    }

    /// Trigger nodes: the initial ready set.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }
}
