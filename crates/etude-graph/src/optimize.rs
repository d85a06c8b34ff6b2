//! Graph-level optimization passes
//!
//! Enabled by a bit-flag set: peephole operator fusion (to fixpoint,
//! capped at 10 rounds), dead-code elimination from the output set, and
//! memory-access optimization (in-place rewriting of elementwise nodes
//! plus lifetime-driven recycling of intermediates). Optimization clears
//! `is_sorted`; callers re-sort before executing.

use std::collections::HashSet;

use etude_core::{Error, Result};
use flagset::{flags, FlagSet};
use log::debug;

use crate::graph::{Graph, NodeId};
use crate::ops::fused::FusedKernel;
use crate::ops::OpKernel;

flags! {
    /// Individual optimization passes.
    pub enum GraphOptFlag: u32 {
        OperatorFusion = 1,
        DeadCodeElimination = 2,
        MemoryOptimization = 4,
    }
}

/// Pass selection bit set.
pub type GraphOptFlags = FlagSet<GraphOptFlag>;

/// All passes enabled.
pub fn all_optimizations() -> GraphOptFlags {
    GraphOptFlag::OperatorFusion | GraphOptFlag::DeadCodeElimination
        | GraphOptFlag::MemoryOptimization
}

/// Fusable `(producer, consumer)` op-type pairs.
fn fusable(first: &str, second: &str) -> bool {
    matches!(
        (first, second),
        ("linear", "relu") | ("conv1d", "relu") | ("stft", "mel_scale")
    )
}

/// Elementwise single-in/single-out ops eligible for the in-place rewrite.
fn inplace_eligible(op_type: &str) -> bool {
    matches!(op_type, "relu" | "sigmoid" | "tanh")
}

impl Graph {
    /// Runs the selected passes. Idempotent: once `is_optimized` is set,
    /// further calls return immediately.
    pub fn optimize(&mut self, flags: GraphOptFlags) -> Result<()> {
        if self.is_optimized {
            return Ok(());
        }

        if flags.contains(GraphOptFlag::OperatorFusion) {
            for _round in 0..10 {
                let mut changed = false;
                while let Some((u, v)) = self.find_fusion_pair() {
                    self.fuse_pair(u, v)?;
                    changed = true;
                }
                if !changed {
                    break;
                }
            }
        }

        if flags.contains(GraphOptFlag::DeadCodeElimination) {
            self.dead_code_elimination()?;
        }

        if flags.contains(GraphOptFlag::MemoryOptimization) {
            self.memory_optimize()?;
        }

        self.is_sorted = false;
        self.execution_order.clear();
        self.is_optimized = true;
        Ok(())
    }

    /// Finds one legal peephole pair: the consumed node has exactly one
    /// predecessor and nothing else consumes the intermediate tensor.
    fn find_fusion_pair(&self) -> Option<(NodeId, NodeId)> {
        for consumer in self.live_nodes() {
            if consumer.preds.len() != 1 || consumer.input_slots.len() != 1 {
                continue;
            }
            let (producer_id, slot) = consumer.input_slots[0];
            // Fused kernels chain through the first output (the
            // magnitude plane for STFT).
            if slot != 0 {
                continue;
            }
            let Ok(producer) = self.node(producer_id) else {
                continue;
            };
            if !fusable(&producer.op_type, &consumer.op_type) {
                continue;
            }
            if producer.succs.len() != 1 || producer.is_output || producer.is_input {
                continue;
            }
            return Some((producer_id, consumer.id));
        }
        None
    }

    /// Collapses `consumer` into `producer`: the surviving node gets the
    /// composite kernel and absorbs the consumer's successors; the
    /// consumed node is deleted.
    fn fuse_pair(&mut self, producer_id: NodeId, consumer_id: NodeId) -> Result<()> {
        let consumer = self
            .nodes
            .get_mut(consumer_id)
            .and_then(Option::take)
            .ok_or_else(|| Error::invalid_state(format!("node {consumer_id} vanished")))?;

        {
            let producer = self.node_mut(producer_id)?;
            let first = producer
                .kernel
                .take()
                .ok_or_else(|| Error::invalid_state("fusion producer has no kernel"))?;
            let second = consumer
                .kernel
                .ok_or_else(|| Error::invalid_state("fusion consumer has no kernel"))?;
            let fused = FusedKernel::compose(&producer.op_type, &consumer.op_type, first, second)?;
            debug!(
                "fused '{}' + '{}' -> {}",
                producer.name,
                consumer.name,
                fused.op_type()
            );
            producer.op_type = fused.op_type().to_string();
            producer.kernel = Some(Box::new(fused));
            producer.succs = consumer.succs.clone();
            producer.is_output = producer.is_output || consumer.is_output;
        }

        for &succ_id in &consumer.succs {
            let succ = self.node_mut(succ_id)?;
            for slot in succ.input_slots.iter_mut() {
                if slot.0 == consumer_id {
                    slot.0 = producer_id;
                }
            }
            succ.preds.retain(|&p| p != consumer_id);
            if !succ.preds.contains(&producer_id) {
                succ.preds.push(producer_id);
            }
        }

        for id in self.output_nodes.iter_mut() {
            if *id == consumer_id {
                *id = producer_id;
            }
        }
        self.output_nodes.dedup();

        self.invalidate();
        Ok(())
    }

    /// Deletes every node not reachable from `output_nodes` through
    /// predecessor edges.
    fn dead_code_elimination(&mut self) -> Result<()> {
        let mut live: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = self.output_nodes.clone();
        while let Some(id) = stack.pop() {
            if live.insert(id) {
                stack.extend(self.node(id)?.preds.iter().copied());
            }
        }

        let mut dead: Vec<NodeId> = self
            .live_nodes()
            .map(|n| n.id)
            .filter(|id| !live.contains(id))
            .collect();
        if dead.is_empty() {
            return Ok(());
        }
        debug!("dead-code elimination removes {} nodes", dead.len());

        // Dead nodes only feed dead nodes; peel from the consumer side.
        while !dead.is_empty() {
            let before = dead.len();
            dead.retain(|&id| self.remove_node(id).is_err());
            if dead.len() == before {
                return Err(Error::invalid_state(
                    "dead-code elimination failed to converge",
                ));
            }
        }
        Ok(())
    }

    /// Marks in-place-eligible nodes and turns on lifetime recycling.
    fn memory_optimize(&mut self) -> Result<()> {
        self.lifetime_opt = true;

        let candidates: Vec<NodeId> = self
            .live_nodes()
            .filter(|n| {
                inplace_eligible(&n.op_type)
                    && n.input_slots.len() == 1
                    && n.kernel
                        .as_ref()
                        .map(|k| k.supports_inplace())
                        .unwrap_or(false)
            })
            .map(|n| n.id)
            .collect();

        for id in candidates {
            let (producer_id, _) = self.node(id)?.input_slots[0];
            let producer = self.node(producer_id)?;
            // The input buffer is reusable only when this node is its
            // sole consumer and the tensor is not a bound input or a
            // graph output.
            if producer.succs.len() == 1 && !producer.is_input && !producer.is_output {
                self.node_mut(id)?.in_place = true;
                debug!("in-place rewrite for node {id}");
            }
        }
        Ok(())
    }
}
