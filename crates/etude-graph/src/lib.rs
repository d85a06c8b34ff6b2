//! Computation-graph engine for the LibEtude runtime
//!
//! Composes registered kernels into a typed operator DAG:
//!
//! - [`runtime`]: the explicit context owning both registries
//! - [`ops`]: operator registry and the create/forward/drop contract
//! - [`graph`]: index-based DAG, cycle check, topological scheduling,
//!   execution
//! - [`optimize`]: fusion, dead-code elimination, memory optimization
//! - [`descriptor`]: the external JSON build surface
//!
//! Execution is single-threaded cooperative: nodes run strictly in
//! `execution_order`, and any parallelism lives inside individual
//! kernels.

pub mod descriptor;
pub mod graph;
pub mod ops;
pub mod optimize;
pub mod runtime;

pub use descriptor::{build_graph, GraphDescriptor, NodeDescriptor};
pub use graph::{Graph, Node, NodeId};
pub use optimize::{all_optimizations, GraphOptFlag, GraphOptFlags};
pub use runtime::Runtime;
