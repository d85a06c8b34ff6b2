//! Operator DAG: nodes, edges, scheduling, execution
//!
//! Nodes are addressed by index into the graph's node vector (tombstoned
//! on delete), so rewiring during fusion and dead-code elimination is an
//! index edit rather than pointer surgery. `execution_order` is assigned
//! by a deterministic Kahn sort (insertion-order tie-break) and execution
//! walks it strictly; the output of step *i* is fully observable to step
//! *i + 1*.

use std::collections::BinaryHeap;

use etude_core::{Error, MemoryPool, Result, Tensor};
use log::debug;

use crate::ops::OpKernel;
use crate::runtime::Runtime;

/// Index of a node inside its owning graph. Stable across deletions.
pub type NodeId = usize;

/// One operator instance in the graph.
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op_type: String,

    /// The operator state; `None` for input placeholder nodes.
    pub(crate) kernel: Option<Box<dyn OpKernel>>,

    /// Output tensors, populated during execution. Slots are `None`
    /// before the first forward and after recycling.
    pub(crate) outputs: Vec<Option<Tensor>>,

    /// `(predecessor, output slot)` feeding each input, in input order.
    pub input_slots: Vec<(NodeId, usize)>,

    /// Distinct predecessors, consistent with `input_slots`.
    pub preds: Vec<NodeId>,

    /// Distinct successors, consistent with the predecessors' view.
    pub succs: Vec<NodeId>,

    /// Position in the schedule; set only after a topological sort.
    pub execution_order: Option<usize>,

    pub is_input: bool,
    pub is_output: bool,

    /// Set by the memory-optimization pass: reuse the input buffer as
    /// the output.
    pub(crate) in_place: bool,
}

/// Directed acyclic operator graph.
pub struct Graph {
    pub name: String,
    pub(crate) nodes: Vec<Option<Node>>,
    pub(crate) input_nodes: Vec<NodeId>,
    pub(crate) output_nodes: Vec<NodeId>,
    pub(crate) execution_order: Vec<NodeId>,
    pub(crate) is_sorted: bool,
    pub(crate) is_optimized: bool,
    /// Recycle tensors into the pool once their last consumer ran.
    pub(crate) lifetime_opt: bool,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            input_nodes: Vec::new(),
            output_nodes: Vec::new(),
            execution_order: Vec::new(),
            is_sorted: false,
            is_optimized: false,
            lifetime_opt: false,
        }
    }

    /// Adds a node. `kernel` is `None` only for input placeholders.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op_type: impl Into<String>,
        kernel: Option<Box<dyn OpKernel>>,
    ) -> Result<NodeId> {
        let name = name.into();
        if self.live_nodes().any(|n| n.name == name) {
            return Err(Error::invalid_state(format!("duplicate node name '{name}'")));
        }
        let id = self.nodes.len();
        self.nodes.push(Some(Node {
            id,
            name,
            op_type: op_type.into(),
            kernel,
            outputs: Vec::new(),
            input_slots: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            execution_order: None,
            is_input: false,
            is_output: false,
            in_place: false,
        }));
        self.invalidate();
        Ok(id)
    }

    /// Adds an input placeholder node (no kernel; tensor supplied via
    /// [`Graph::bind_input`]).
    pub fn add_input(&mut self, name: impl Into<String>) -> Result<NodeId> {
        let id = self.add_node(name, "input", None)?;
        self.node_mut(id)?.is_input = true;
        self.input_nodes.push(id);
        Ok(id)
    }

    /// Adds an operator node by looking `op_type` up in the runtime's
    /// operator registry.
    pub fn add_operator(
        &mut self,
        runtime: &Runtime,
        name: impl Into<String>,
        op_type: &str,
        attrs: &serde_json::Value,
        ctx: &crate::ops::BuildCtx<'_>,
    ) -> Result<NodeId> {
        let operator = runtime.operators.find(op_type)?;
        let kernel = operator.create(attrs, ctx)?;
        self.add_node(name, op_type, Some(kernel))
    }

    /// Connects output `src_output` of `src` to the next input slot of
    /// `dst`.
    pub fn connect(&mut self, src: NodeId, src_output: usize, dst: NodeId) -> Result<()> {
        if src == dst {
            return Err(Error::invalid_state("self-edge"));
        }
        self.node(src)?;
        self.node(dst)?;
        {
            let dst_node = self.node_mut(dst)?;
            dst_node.input_slots.push((src, src_output));
            if !dst_node.preds.contains(&src) {
                dst_node.preds.push(src);
            }
        }
        {
            let src_node = self.node_mut(src)?;
            if !src_node.succs.contains(&dst) {
                src_node.succs.push(dst);
            }
        }
        self.invalidate();
        Ok(())
    }

    /// Marks a node as a graph output; its tensors survive lifetime
    /// recycling and dead-code elimination starts from it.
    pub fn mark_output(&mut self, id: NodeId) -> Result<()> {
        self.node_mut(id)?.is_output = true;
        if !self.output_nodes.contains(&id) {
            self.output_nodes.push(id);
        }
        Ok(())
    }

    /// Binds the tensor an input placeholder produces.
    pub fn bind_input(&mut self, id: NodeId, tensor: Tensor) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_input {
            return Err(Error::invalid_state(format!(
                "node '{}' is not an input",
                node.name
            )));
        }
        node.outputs = vec![Some(tensor)];
        Ok(())
    }

    /// Removes a node. Fails with [`Error::InvalidState`] while another
    /// live node still consumes one of its outputs.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let node = self.nodes.get_mut(id).and_then(Option::take).ok_or_else(|| {
            Error::invalid_state(format!("node {id} does not exist"))
        })?;
        // Refuse (and restore) while a live node still consumes it, so a
        // failed removal leaves the graph untouched.
        let consumer = self
            .nodes
            .iter()
            .flatten()
            .find(|other| other.input_slots.iter().any(|&(p, _)| p == id))
            .map(|other| other.name.clone());
        if let Some(name) = consumer {
            self.nodes[id] = Some(node);
            return Err(Error::invalid_state(format!(
                "cannot remove node {id}: '{name}' still consumes it"
            )));
        }
        for other in self.nodes.iter_mut().flatten() {
            other.preds.retain(|&p| p != id);
            other.succs.retain(|&s| s != id);
        }
        self.input_nodes.retain(|&n| n != id);
        self.output_nodes.retain(|&n| n != id);
        self.invalidate();
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.live_nodes().count()
    }

    pub fn input_nodes(&self) -> &[NodeId] {
        &self.input_nodes
    }

    pub fn output_nodes(&self) -> &[NodeId] {
        &self.output_nodes
    }

    pub fn is_sorted(&self) -> bool {
        self.is_sorted
    }

    pub fn is_optimized(&self) -> bool {
        self.is_optimized
    }

    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    /// Any structural mutation clears both the sorted and optimized flags.
    pub(crate) fn invalidate(&mut self) {
        self.is_sorted = false;
        self.is_optimized = false;
        self.execution_order.clear();
    }

    /// Tri-color DFS cycle check. A back edge is an [`Error::InvalidState`].
    pub fn detect_cycle(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut colors = vec![Color::White; self.nodes.len()];

        // Iterative DFS; (node, next-successor-index) frames.
        for start in 0..self.nodes.len() {
            if self.nodes[start].is_none() || colors[start] != Color::White {
                continue;
            }
            let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
            colors[start] = Color::Gray;
            while let Some(&mut (node, next)) = stack.last_mut() {
                let succs = &self.node(node)?.succs;
                if next < succs.len() {
                    let succ = succs[next];
                    if let Some(frame) = stack.last_mut() {
                        frame.1 += 1;
                    }
                    match colors[succ] {
                        Color::Gray => {
                            return Err(Error::invalid_state(format!(
                                "cycle through node '{}'",
                                self.node(succ)?.name
                            )));
                        }
                        Color::White => {
                            colors[succ] = Color::Gray;
                            stack.push((succ, 0));
                        }
                        Color::Black => {}
                    }
                } else {
                    colors[node] = Color::Black;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Kahn topological sort with insertion-order (smallest id first)
    /// tie-break. Idempotent; a cycle is an [`Error::InvalidState`].
    pub fn topological_sort(&mut self) -> Result<()> {
        if self.is_sorted {
            return Ok(());
        }
        let live: Vec<NodeId> = self.live_nodes().map(|n| n.id).collect();
        let mut indegree = vec![0usize; self.nodes.len()];
        for &id in &live {
            indegree[id] = self.node(id)?.preds.len();
        }

        // Min-heap keyed on node id for deterministic ties.
        let mut ready: BinaryHeap<std::cmp::Reverse<NodeId>> = live
            .iter()
            .copied()
            .filter(|&id| indegree[id] == 0)
            .map(std::cmp::Reverse)
            .collect();

        let mut order = Vec::with_capacity(live.len());
        while let Some(std::cmp::Reverse(id)) = ready.pop() {
            order.push(id);
            for &succ in &self.node(id)?.succs.clone() {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    ready.push(std::cmp::Reverse(succ));
                }
            }
        }

        if order.len() != live.len() {
            return Err(Error::invalid_state(format!(
                "graph '{}' contains a cycle ({} of {} nodes schedulable)",
                self.name,
                order.len(),
                live.len()
            )));
        }

        for (position, &id) in order.iter().enumerate() {
            self.node_mut(id)?.execution_order = Some(position);
        }
        self.execution_order = order;
        self.is_sorted = true;
        debug!("graph '{}' sorted: {} nodes", self.name, self.execution_order.len());
        Ok(())
    }

    /// Runs every node in schedule order. Aborts at the first failing
    /// node, naming it in the returned error. Output tensors come from
    /// `pool`; when the memory-optimization pass enabled lifetime
    /// recycling, intermediates return to the pool right after their last
    /// consumer.
    pub fn execute(&mut self, runtime: &Runtime, pool: &MemoryPool) -> Result<()> {
        if !self.is_sorted {
            return Err(Error::invalid_state("graph must be sorted before execution"));
        }

        // Last schedule position that reads each node's outputs.
        let order = self.execution_order.clone();
        let mut last_use = vec![usize::MAX; self.nodes.len()];
        for (position, &id) in order.iter().enumerate() {
            for &(pred, _) in &self.node(id)?.input_slots {
                last_use[pred] = position;
            }
        }

        for (position, &id) in order.iter().enumerate() {
            self.execute_node(runtime, pool, id)?;

            if self.lifetime_opt {
                for pred in self.node(id)?.preds.clone() {
                    if last_use[pred] == position {
                        let pred_node = self.node_mut(pred)?;
                        if pred_node.is_output || pred_node.is_input {
                            continue;
                        }
                        for slot in pred_node.outputs.iter_mut() {
                            if let Some(tensor) = slot.take() {
                                pool.recycle(tensor);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn execute_node(&mut self, runtime: &Runtime, pool: &MemoryPool, id: NodeId) -> Result<()> {
        let (is_input, name) = {
            let node = self.node(id)?;
            (node.is_input, node.name.clone())
        };

        if is_input {
            let node = self.node(id)?;
            if node.outputs.iter().flatten().count() == 0 {
                return Err(Error::invalid_state("input tensor not bound").in_node(name));
            }
            return Ok(());
        }

        let mut kernel = self
            .node_mut(id)?
            .kernel
            .take()
            .ok_or_else(|| Error::invalid_state("node has no kernel").in_node(name.clone()))?;

        let in_place = {
            let node = self.node(id)?;
            node.in_place && node.input_slots.len() == 1 && kernel.supports_inplace()
        };

        let result = if in_place {
            let (pred, slot) = self.node(id)?.input_slots[0];
            let tensor = self
                .node_mut(pred)?
                .outputs
                .get_mut(slot)
                .and_then(Option::take)
                .ok_or_else(|| {
                    Error::invalid_state("in-place input tensor unavailable").in_node(name.clone())
                });
            match tensor {
                Ok(mut tensor) => kernel
                    .forward_inplace(runtime, &mut tensor)
                    .map(|()| vec![tensor]),
                Err(err) => Err(err),
            }
        } else {
            let slots = self.node(id)?.input_slots.clone();
            let mut inputs: Vec<&Tensor> = Vec::with_capacity(slots.len());
            for &(pred, slot) in &slots {
                let tensor = self
                    .node(pred)?
                    .outputs
                    .get(slot)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| {
                        Error::invalid_state(format!(
                            "predecessor output {slot} of node {pred} not materialized"
                        ))
                        .in_node(name.clone())
                    })?;
                inputs.push(tensor);
            }
            kernel.forward(runtime, &inputs, pool)
        };

        let node = self.node_mut(id)?;
        node.kernel = Some(kernel);
        match result {
            Ok(outputs) => {
                node.outputs = outputs.into_iter().map(Some).collect();
                Ok(())
            }
            Err(err @ Error::NodeExecution { .. }) => Err(err),
            Err(err) => Err(err.in_node(name)),
        }
    }

    /// Borrows an output tensor of a node.
    pub fn output(&self, id: NodeId, slot: usize) -> Result<&Tensor> {
        self.node(id)?
            .outputs
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found(format!("output {slot} of node {id}")))
    }

    /// Moves an output tensor out of the graph.
    pub fn take_output(&mut self, id: NodeId, slot: usize) -> Result<Tensor> {
        self.node_mut(id)?
            .outputs
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| Error::not_found(format!("output {slot} of node {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::BuildCtx;
    use etude_core::DType;
    use serde_json::json;

    fn runtime() -> Runtime {
        Runtime::new().unwrap()
    }

    fn relu_graph(rt: &Runtime) -> (Graph, NodeId, NodeId) {
        let mut graph = Graph::new("relu_only");
        let ctx = BuildCtx::default();
        let input = graph.add_input("x").unwrap();
        let relu = graph
            .add_operator(rt, "act", "relu", &json!({}), &ctx)
            .unwrap();
        graph.connect(input, 0, relu).unwrap();
        graph.mark_output(relu).unwrap();
        (graph, input, relu)
    }

    #[test]
    fn test_duplicate_node_name_rejected() {
        let mut graph = Graph::new("g");
        graph.add_input("x").unwrap();
        assert!(matches!(
            graph.add_input("x"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_topological_sort_linear_chain() {
        let rt = runtime();
        let (mut graph, input, relu) = relu_graph(&rt);
        graph.topological_sort().unwrap();
        assert!(graph.is_sorted());
        assert_eq!(graph.execution_order(), &[input, relu]);
        assert_eq!(graph.node(input).unwrap().execution_order, Some(0));
        assert_eq!(graph.node(relu).unwrap().execution_order, Some(1));
    }

    #[test]
    fn test_sort_is_idempotent() {
        let rt = runtime();
        let (mut graph, _, _) = relu_graph(&rt);
        graph.topological_sort().unwrap();
        let first = graph.execution_order().to_vec();
        graph.topological_sort().unwrap();
        assert_eq!(graph.execution_order(), first.as_slice());
    }

    #[test]
    fn test_cycle_rejected() {
        let rt = runtime();
        let ctx = BuildCtx::default();
        let mut graph = Graph::new("cyclic");
        let a = graph.add_operator(&rt, "a", "relu", &json!({}), &ctx).unwrap();
        let b = graph.add_operator(&rt, "b", "relu", &json!({}), &ctx).unwrap();
        let c = graph.add_operator(&rt, "c", "relu", &json!({}), &ctx).unwrap();
        graph.connect(a, 0, b).unwrap();
        graph.connect(b, 0, c).unwrap();
        graph.connect(c, 0, a).unwrap();

        assert!(matches!(graph.detect_cycle(), Err(Error::InvalidState(_))));
        assert!(matches!(graph.topological_sort(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_self_edge_rejected() {
        let rt = runtime();
        let ctx = BuildCtx::default();
        let mut graph = Graph::new("g");
        let a = graph.add_operator(&rt, "a", "relu", &json!({}), &ctx).unwrap();
        assert!(matches!(graph.connect(a, 0, a), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_mutation_clears_sorted_flag() {
        let rt = runtime();
        let (mut graph, _, relu) = relu_graph(&rt);
        graph.topological_sort().unwrap();
        assert!(graph.is_sorted());
        let ctx = BuildCtx::default();
        let extra = graph
            .add_operator(&rt, "extra", "relu", &json!({}), &ctx)
            .unwrap();
        assert!(!graph.is_sorted());
        graph.connect(relu, 0, extra).unwrap();
        graph.topological_sort().unwrap();
        assert!(graph.is_sorted());
    }

    #[test]
    fn test_execute_relu() {
        let rt = runtime();
        let pool = MemoryPool::new(1 << 20);
        let (mut graph, input, relu) = relu_graph(&rt);
        graph.topological_sort().unwrap();
        graph
            .bind_input(input, Tensor::from_f32(vec![4], &[-1.0, 2.0, -3.0, 4.0]).unwrap())
            .unwrap();
        graph.execute(&rt, &pool).unwrap();
        let out = graph.output(relu, 0).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_execute_unbound_input_names_node() {
        let rt = runtime();
        let pool = MemoryPool::new(1 << 20);
        let (mut graph, _, _) = relu_graph(&rt);
        graph.topological_sort().unwrap();
        let err = graph.execute(&rt, &pool).unwrap_err();
        match err {
            Error::NodeExecution { node, .. } => assert_eq!(node, "x"),
            other => panic!("expected NodeExecution, got {other:?}"),
        }
    }

    #[test]
    fn test_execute_requires_sort() {
        let rt = runtime();
        let pool = MemoryPool::new(1 << 20);
        let (mut graph, input, _) = relu_graph(&rt);
        graph
            .bind_input(input, Tensor::from_f32(vec![1], &[1.0]).unwrap())
            .unwrap();
        assert!(matches!(
            graph.execute(&rt, &pool),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_diamond_edge_order_invariant() {
        // input -> {a, b} -> c; every edge must respect the order.
        let rt = runtime();
        let ctx = BuildCtx::default();
        let mut graph = Graph::new("diamond");
        let input = graph.add_input("x").unwrap();
        let a = graph.add_operator(&rt, "a", "relu", &json!({}), &ctx).unwrap();
        let b = graph.add_operator(&rt, "b", "relu", &json!({}), &ctx).unwrap();
        let c = graph
            .add_operator(&rt, "c", "add", &json!({}), &ctx)
            .unwrap();
        graph.connect(input, 0, a).unwrap();
        graph.connect(input, 0, b).unwrap();
        graph.connect(a, 0, c).unwrap();
        graph.connect(b, 0, c).unwrap();
        graph.mark_output(c).unwrap();
        graph.topological_sort().unwrap();

        let position = |id: NodeId| graph.node(id).unwrap().execution_order.unwrap();
        for node in graph.live_nodes() {
            for &succ in &node.succs {
                assert!(position(node.id) < position(succ));
            }
        }
        // Permutation of all live nodes.
        assert_eq!(graph.execution_order().len(), graph.node_count());
    }

    #[test]
    fn test_pool_allocation_during_execute() {
        let rt = runtime();
        let pool = MemoryPool::new(1 << 20);
        let (mut graph, input, _) = relu_graph(&rt);
        graph.topological_sort().unwrap();
        let bound = pool.alloc(DType::F32, &[8]).unwrap();
        graph.bind_input(input, bound).unwrap();
        let before = pool.in_use();
        graph.execute(&rt, &pool).unwrap();
        assert!(pool.in_use() > before, "relu output should come from the pool");
    }
}
