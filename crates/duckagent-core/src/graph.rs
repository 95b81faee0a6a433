//! Executable dependency graph compiled from a [`Decision`].

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use duckagent_types::{AgentError, NodeStatus, Result};

use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::decision::{Decision, StepInvocation};
use crate::intent::Hints;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Sequential,
    FallbackBranch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// What a backend must offer to run a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRequirements {
    pub sandbox: bool,
    pub query_engine: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub invocation: StepInvocation,
    pub capability: CapabilityDescriptor,
    pub status: NodeStatus,
    pub requirements: BackendRequirements,
    /// Hints from the decision, consulted by the validator.
    pub hints: Hints,
    /// Id of the node this one replaces, for substitute nodes.
    pub substitute_for: Option<String>,
}

impl Node {
    pub fn step(&self) -> &str {
        &self.invocation.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionGraph {
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    order: Vec<String>,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// One node per invocation, chained by sequential edges.
pub fn build_graph(decision: &Decision, registry: &CapabilityRegistry) -> Result<ExecutionGraph> {
    if decision.steps.is_empty() {
        return Err(AgentError::GraphConstruction(
            "decision contains no steps".into(),
        ));
    }

    let mut graph = ExecutionGraph {
        nodes: HashMap::new(),
        edges: Vec::new(),
        order: Vec::new(),
    };

    for (i, invocation) in decision.steps.iter().enumerate() {
        let capability = registry.descriptor(&invocation.name).ok_or_else(|| {
            AgentError::GraphConstruction(format!("unknown step '{}'", invocation.name))
        })?;
        let id = format!("node_{i}_{}", invocation.name);
        let node = Node {
            id: id.clone(),
            invocation: StepInvocation {
                capability: Some(capability.clone()),
                ..invocation.clone()
            },
            requirements: BackendRequirements {
                sandbox: capability.requires_sandbox,
                query_engine: capability.requires_query_engine,
            },
            capability,
            status: NodeStatus::Pending,
            hints: decision.hints.clone(),
            substitute_for: None,
        };
        if let Some(prev) = graph.order.last() {
            graph.edges.push(Edge {
                from: prev.clone(),
                to: id.clone(),
                kind: EdgeKind::Sequential,
            });
        }
        graph.order.push(id.clone());
        graph.nodes.insert(id, node);
    }

    tracing::debug!(nodes = graph.len(), edges = graph.edges.len(), "Graph built");
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Queries and mutation
// ---------------------------------------------------------------------------

impl ExecutionGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Node ids in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// The single node without incoming edges.
    pub fn entry(&self) -> Option<&Node> {
        let mut entries = self
            .order
            .iter()
            .filter(|id| !self.edges.iter().any(|e| &e.to == *id));
        let first = entries.next()?;
        if entries.next().is_some() {
            return None;
        }
        self.nodes.get(first)
    }

    pub fn incoming(&self, id: &str) -> impl Iterator<Item = &Edge> {
        let id = id.to_string();
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        let id = id.to_string();
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    pub fn set_status(&mut self, id: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = status;
        }
    }

    /// Insert `invocation` as a substitute for `original`, placed right after
    /// it in execution order. The original's sequential successor is rewired
    /// to follow the substitute.
    pub fn attach_fallback(
        &mut self,
        original: &str,
        invocation: StepInvocation,
        capability: CapabilityDescriptor,
    ) -> Result<String> {
        let Some(position) = self.order.iter().position(|id| id == original) else {
            return Err(AgentError::GraphConstruction(format!(
                "cannot attach fallback to unknown node '{original}'"
            )));
        };
        let hints = self
            .nodes
            .get(original)
            .map(|n| n.hints.clone())
            .unwrap_or_default();

        let id = format!("node_{}_{}", self.nodes.len(), invocation.name);
        let node = Node {
            id: id.clone(),
            invocation: StepInvocation {
                capability: Some(capability.clone()),
                ..invocation
            },
            requirements: BackendRequirements {
                sandbox: capability.requires_sandbox,
                query_engine: capability.requires_query_engine,
            },
            capability,
            status: NodeStatus::Pending,
            hints,
            substitute_for: Some(original.to_string()),
        };

        for edge in self
            .edges
            .iter_mut()
            .filter(|e| e.from == original && e.kind == EdgeKind::Sequential)
        {
            edge.from = id.clone();
        }
        self.edges.push(Edge {
            from: original.to_string(),
            to: id.clone(),
            kind: EdgeKind::FallbackBranch,
        });
        self.order.insert(position + 1, id.clone());
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    /// Kahn's algorithm over the edge list.
    pub fn is_acyclic(&self) -> bool {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        for e in &self.edges {
            if let Some(d) = indegree.get_mut(e.to.as_str()) {
                *d += 1;
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for e in self.edges.iter().filter(|e| e.from == id) {
                if let Some(d) = indegree.get_mut(e.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(e.to.as_str());
                    }
                }
            }
        }
        visited == self.nodes.len()
    }

    /// Whether every edge points forward in execution order.
    pub fn order_respects_edges(&self) -> bool {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        self.edges.iter().all(|e| {
            matches!(
                (position.get(e.from.as_str()), position.get(e.to.as_str())),
                (Some(a), Some(b)) if a < b
            )
        })
    }
}
