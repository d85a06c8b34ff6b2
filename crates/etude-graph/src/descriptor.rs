//! JSON graph descriptor
//!
//! The external build surface: a serde document that references operators
//! by type name in the operator registry and weights by LEF layer id
//! through the attached model. Edges are `"node"` or `"node:slot"`
//! strings in each node's `inputs` list.

use std::collections::HashMap;
use std::sync::Arc;

use etude_core::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::{Graph, NodeId};
use crate::ops::BuildCtx;
use crate::runtime::Runtime;

/// One node in the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub attrs: Value,
    /// `"producer"` or `"producer:slot"` references, in input order.
    #[serde(default)]
    pub inputs: Vec<String>,
}

/// A whole graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDescriptor {
    pub name: String,
    pub nodes: Vec<NodeDescriptor>,
    /// Names of nodes whose results the caller reads.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl GraphDescriptor {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::format(format!("graph descriptor: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::format(format!("graph descriptor: {e}")))
    }
}

fn parse_input_ref(reference: &str) -> Result<(&str, usize)> {
    match reference.rsplit_once(':') {
        None => Ok((reference, 0)),
        Some((name, slot)) => {
            let slot = slot.parse::<usize>().map_err(|_| {
                Error::format(format!("bad input reference '{reference}'"))
            })?;
            Ok((name, slot))
        }
    }
}

/// Materializes a descriptor into a graph: resolves operator names
/// through the registry, weights through `weights` (a loaded model's
/// layer map), wires edges, marks inputs/outputs, and rejects cycles.
/// The graph comes back unsorted.
pub fn build_graph(
    descriptor: &GraphDescriptor,
    runtime: &Runtime,
    weights: Option<&HashMap<u16, Arc<Tensor>>>,
) -> Result<Graph> {
    let ctx = BuildCtx { weights };
    let mut graph = Graph::new(descriptor.name.clone());
    let mut ids: HashMap<&str, NodeId> = HashMap::new();

    for node in &descriptor.nodes {
        let id = if node.op_type == "input" {
            graph.add_input(node.name.clone())?
        } else {
            graph.add_operator(runtime, node.name.clone(), &node.op_type, &node.attrs, &ctx)?
        };
        ids.insert(node.name.as_str(), id);
    }

    for node in &descriptor.nodes {
        let dst = ids[node.name.as_str()];
        for reference in &node.inputs {
            let (src_name, slot) = parse_input_ref(reference)?;
            let src = *ids.get(src_name).ok_or_else(|| {
                Error::invalid_state(format!(
                    "node '{}' references unknown predecessor '{src_name}'",
                    node.name
                ))
            })?;
            graph.connect(src, slot, dst)?;
        }
    }

    for name in &descriptor.outputs {
        let id = *ids.get(name.as_str()).ok_or_else(|| {
            Error::invalid_state(format!("unknown output node '{name}'"))
        })?;
        graph.mark_output(id)?;
    }

    graph.detect_cycle()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etude_core::MemoryPool;
    use serde_json::json;

    fn descriptor_json() -> String {
        json!({
            "name": "tiny",
            "nodes": [
                {"name": "x", "op_type": "input"},
                {
                    "name": "proj",
                    "op_type": "linear",
                    "attrs": {
                        "input_size": 2,
                        "output_size": 2,
                        "weight": [1.0, 0.0, 0.0, 1.0],
                        "bias": [1.0, -1.0],
                    },
                    "inputs": ["x"]
                },
                {"name": "act", "op_type": "relu", "inputs": ["proj"]},
                {"name": "y", "op_type": "output", "inputs": ["act"]}
            ],
            "outputs": ["y"]
        })
        .to_string()
    }

    #[test]
    fn test_round_trip_serde() {
        let desc = GraphDescriptor::from_json(&descriptor_json()).unwrap();
        assert_eq!(desc.name, "tiny");
        assert_eq!(desc.nodes.len(), 4);
        let text = desc.to_json().unwrap();
        let again = GraphDescriptor::from_json(&text).unwrap();
        assert_eq!(again.nodes.len(), 4);
    }

    #[test]
    fn test_build_and_execute() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let desc = GraphDescriptor::from_json(&descriptor_json()).unwrap();
        let mut graph = build_graph(&desc, &rt, None).unwrap();
        graph.topological_sort().unwrap();

        let input_id = graph.input_nodes()[0];
        let output_id = graph.output_nodes()[0];
        graph
            .bind_input(input_id, Tensor::from_f32(vec![1, 2], &[-3.0, 4.0]).unwrap())
            .unwrap();
        graph.execute(&rt, &pool).unwrap();
        // [-3+1, 4-1] -> relu -> [0, 3]
        assert_eq!(graph.output(output_id, 0).unwrap().as_f32().unwrap(), &[0.0, 3.0]);
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let rt = Runtime::new().unwrap();
        let desc = GraphDescriptor {
            name: "bad".into(),
            nodes: vec![NodeDescriptor {
                name: "n".into(),
                op_type: "warp_drive".into(),
                attrs: Value::Null,
                inputs: vec![],
            }],
            outputs: vec![],
        };
        assert!(matches!(
            build_graph(&desc, &rt, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_predecessor_rejected() {
        let rt = Runtime::new().unwrap();
        let desc = GraphDescriptor {
            name: "bad".into(),
            nodes: vec![NodeDescriptor {
                name: "act".into(),
                op_type: "relu".into(),
                attrs: json!({}),
                inputs: vec!["ghost".into()],
            }],
            outputs: vec![],
        };
        assert!(matches!(
            build_graph(&desc, &rt, None),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_slot_reference_parsing() {
        assert_eq!(parse_input_ref("stft:1").unwrap(), ("stft", 1));
        assert_eq!(parse_input_ref("plain").unwrap(), ("plain", 0));
        assert!(parse_input_ref("bad:slot").is_err());
    }

    #[test]
    fn test_cycle_in_descriptor_rejected() {
        let rt = Runtime::new().unwrap();
        let desc = GraphDescriptor {
            name: "loop".into(),
            nodes: vec![
                NodeDescriptor {
                    name: "a".into(),
                    op_type: "relu".into(),
                    attrs: json!({}),
                    inputs: vec!["b".into()],
                },
                NodeDescriptor {
                    name: "b".into(),
                    op_type: "relu".into(),
                    attrs: json!({}),
                    inputs: vec!["a".into()],
                },
            ],
            outputs: vec![],
        };
        assert!(matches!(
            build_graph(&desc, &rt, None),
            Err(Error::InvalidState(_))
        ));
    }
}
