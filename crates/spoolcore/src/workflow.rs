use crate::error::ValidationError;
use crate::handler::{PortSpec, PortType, RetryPolicy};
use crate::value::Value;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;
pub type ConnectionId = Uuid;

/// Complete workflow definition: the node set and the directed
/// connection graph over it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub version: u32,
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub connections: Vec<Connection>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        source_node: NodeId,
        source_port: impl Into<String>,
        target_node: NodeId,
        target_port: impl Into<String>,
    ) -> ConnectionId {
        self.connect_inner(source_node, source_port, target_node, target_port, None)
    }

    /// Connect one branch of a condition node to a successor.
    pub fn connect_branch(
        &mut self,
        source_node: NodeId,
        branch: BranchLabel,
        target_node: NodeId,
        target_port: impl Into<String>,
    ) -> ConnectionId {
        self.connect_inner(
            source_node,
            branch.port_name(),
            target_node,
            target_port,
            Some(branch),
        )
    }

    fn connect_inner(
        &mut self,
        source_node: NodeId,
        source_port: impl Into<String>,
        target_node: NodeId,
        target_port: impl Into<String>,
        branch: Option<BranchLabel>,
    ) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.push(Connection {
            id,
            source_node,
            source_port: source_port.into(),
            target_node,
            target_port: target_port.into(),
            branch,
            extra: HashMap::new(),
        });
        id
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Remove a node and every connection touching it.
    pub fn remove_node(&mut self, id: NodeId) {
        self.nodes.retain(|n| n.id != id);
        self.connections
            .retain(|c| c.source_node != id && c.target_node != id);
    }

    /// Check structural invariants. Returns every problem found; an
    /// empty list is required before a run may start. Pure: the graph
    /// is never partially validated.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut by_id: HashMap<NodeId, &NodeSpec> = HashMap::new();
        for node in &self.nodes {
            if by_id.insert(node.id, node).is_some() {
                errors.push(ValidationError::DuplicateNodeId(node.id));
            }
        }

        for conn in &self.connections {
            let source = by_id.get(&conn.source_node);
            let target = by_id.get(&conn.target_node);
            let (source, target) = match (source, target) {
                (Some(s), Some(t)) => (*s, *t),
                _ => {
                    errors.push(ValidationError::DanglingConnection(conn.id));
                    continue;
                }
            };

            let source_port = source.output_port(&conn.source_port);
            let target_port = target.input_port(&conn.target_port);
            // A node with no declared ports accepts any port name.
            if (!source.outputs.is_empty() && source_port.is_none())
                || (!target.inputs.is_empty() && target_port.is_none())
            {
                errors.push(ValidationError::DanglingConnection(conn.id));
                continue;
            }
            if let (Some(sp), Some(tp)) = (source_port, target_port) {
                if !sp.port_type.accepts(&tp.port_type) {
                    errors.push(ValidationError::PortTypeMismatch(conn.id));
                }
            }
        }

        for node in &self.nodes {
            let inbound = self
                .connections
                .iter()
                .filter(|c| c.target_node == node.id)
                .count();
            if node.kind != NodeKind::Trigger && inbound == 0 {
                errors.push(ValidationError::OrphanNode(node.id));
            }

            if node.kind == NodeKind::Condition {
                let outbound: Vec<_> = self
                    .connections
                    .iter()
                    .filter(|c| c.source_node == node.id)
                    .collect();
                let trues = outbound
                    .iter()
                    .filter(|c| c.branch == Some(BranchLabel::True))
                    .count();
                let falses = outbound
                    .iter()
                    .filter(|c| c.branch == Some(BranchLabel::False))
                    .count();
                if outbound.len() != 2 || trues != 1 || falses != 1 {
                    errors.push(ValidationError::MalformedConditionBranches(node.id));
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            errors.push(ValidationError::CycleDetected(cycle));
        }

        errors
    }

    fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut graph = DiGraph::<NodeId, ()>::new();
        let mut index_of = HashMap::new();
        for node in &self.nodes {
            index_of.insert(node.id, graph.add_node(node.id));
        }
        for conn in &self.connections {
            if let (Some(&from), Some(&to)) = (
                index_of.get(&conn.source_node),
                index_of.get(&conn.target_node),
            ) {
                graph.add_edge(from, to, ());
            }
        }
        if toposort(&graph, None).is_ok() {
            return None;
        }
        // Report the members of the first non-trivial strongly
        // connected component.
        for scc in tarjan_scc(&graph) {
            if scc.len() > 1 {
                return Some(scc.iter().map(|idx| graph[*idx]).collect());
            }
            let idx = scc[0];
            if graph.find_edge(idx, idx).is_some() {
                return Some(vec![graph[idx]]);
            }
        }
        None
    }
}

/// The role a node plays in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Trigger,
    Action,
    Condition,
    Delay,
}

/// A single node in a workflow definition. Immutable once a run has
/// started against the definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Key into the handler catalog. None for trigger and delay nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_kind: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// UI-only fields carried through persistence untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl NodeSpec {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            action_kind: None,
            name: None,
            config: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            continue_on_error: false,
            retry: None,
            timeout_ms: None,
            position: None,
            extra: HashMap::new(),
        }
    }

    pub fn trigger() -> Self {
        Self::new(NodeKind::Trigger)
    }

    pub fn action(action_kind: impl Into<String>) -> Self {
        let mut spec = Self::new(NodeKind::Action);
        spec.action_kind = Some(action_kind.into());
        spec
    }

    pub fn condition() -> Self {
        let mut spec = Self::new(NodeKind::Condition);
        spec.outputs = vec![
            PortSpec::new("true", PortType::Any),
            PortSpec::new("false", PortType::Any),
        ];
        spec
    }

    pub fn delay(delay_ms: u64) -> Self {
        Self::new(NodeKind::Delay).with_config("delay_ms", delay_ms as i64)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, port_type: PortType) -> Self {
        self.inputs.push(PortSpec::new(name, port_type));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, port_type: PortType) -> Self {
        self.outputs.push(PortSpec::new(name, port_type));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// Edge in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source_node: NodeId,
    pub source_port: String,
    pub target_node: NodeId,
    pub target_port: String,
    /// Set only on condition-node outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchLabel>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Which side of a condition node an edge belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchLabel {
    True,
    False,
}

impl BranchLabel {
    pub fn port_name(&self) -> &'static str {
        match self {
            BranchLabel::True => "true",
            BranchLabel::False => "false",
        }
    }
}

/// Canvas position, opaque to the engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}
