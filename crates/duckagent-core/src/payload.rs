//! Mapping from an execution graph to the hosted run-service payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::{ExecutionGraph, Node};
use crate::step::Params;

pub const PAYLOAD_NAME: &str = "duckagent_decision";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadInput {
    pub from: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadItem {
    pub id: String,
    pub name: String,
    pub params: Params,
    pub outputs: Vec<String>,
    pub depends_on: Vec<String>,
    pub inputs: Vec<PayloadInput>,
}

impl PayloadItem {
    fn from_node(node: &Node) -> Self {
        let outputs = if node.capability.provides.is_empty() {
            vec!["result".to_string()]
        } else {
            node.capability.provides.clone()
        };
        Self {
            id: node.id.clone(),
            name: node.step().to_string(),
            params: node.invocation.params.clone(),
            outputs,
            depends_on: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub name: String,
    pub items: Vec<PayloadItem>,
}

/// One item per node in execution order; dependencies follow the graph edges
/// and each dependency feeds its first declared output.
pub fn build_run_payload(graph: &ExecutionGraph) -> RunPayload {
    let items = graph
        .nodes()
        .map(|node| {
            let mut item = PayloadItem::from_node(node);
            for edge in graph.incoming(&node.id) {
                item.depends_on.push(edge.from.clone());
                let output = graph
                    .node(&edge.from)
                    .and_then(|dep| dep.capability.provides.first().cloned())
                    .unwrap_or_else(|| "result".to_string());
                item.inputs.push(PayloadInput {
                    from: edge.from.clone(),
                    output,
                });
            }
            item
        })
        .collect();
    RunPayload {
        name: PAYLOAD_NAME.to_string(),
        items,
    }
}

/// Single-node request sent to the hosted backend, with the context the
/// step may read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePayload {
    pub name: String,
    pub item: PayloadItem,
    pub context: HashMap<String, Value>,
}

impl NodePayload {
    pub fn for_node(node: &Node, context: HashMap<String, Value>) -> Self {
        Self {
            name: PAYLOAD_NAME.to_string(),
            item: PayloadItem::from_node(node),
            context,
        }
    }
}
