//! End-to-end pipeline: write a model container, load it, build a graph
//! from a descriptor that references layers by id, optimize, execute.

use std::io::Cursor;

use etude_core::{MemoryPool, Tensor};
use etude_graph::{all_optimizations, build_graph, GraphDescriptor, Runtime};
use etude_lef::{LayerKind, LayerSpec, LefReader, LefWriter, Model, ModelMetadata, WriterOptions};
use serde_json::json;

fn write_model() -> Model {
    let metadata = ModelMetadata {
        name: "pipeline-fixture".into(),
        version: "1.0".into(),
        input_dim: 2,
        output_dim: 2,
        hidden_dim: 2,
        ..Default::default()
    };
    let mut writer = LefWriter::new(metadata, WriterOptions::default());
    // Layer 0: (2, 2) weight; layer 1: bias.
    writer
        .add_layer(
            LayerSpec::f32(0, LayerKind::Linear, &[1.0, -1.0, 2.0, -2.0], &[2, 2]).unwrap(),
        )
        .unwrap();
    writer
        .add_layer(LayerSpec::f32(1, LayerKind::Linear, &[0.5, 0.5], &[2]).unwrap())
        .unwrap();

    let mut cursor = Cursor::new(Vec::new());
    writer.finalize(&mut cursor).unwrap();
    let reader = LefReader::from_bytes(cursor.into_inner()).unwrap();
    Model::from_reader(&reader).unwrap()
}

fn descriptor() -> GraphDescriptor {
    GraphDescriptor {
        name: "tiny-tts-head".into(),
        nodes: vec![
            etude_graph::NodeDescriptor {
                name: "x".into(),
                op_type: "input".into(),
                attrs: json!(null),
                inputs: vec![],
            },
            etude_graph::NodeDescriptor {
                name: "proj".into(),
                op_type: "linear".into(),
                attrs: json!({
                    "input_size": 2,
                    "output_size": 2,
                    "weight_layer": 0,
                    "bias_layer": 1,
                }),
                inputs: vec!["x".into()],
            },
            etude_graph::NodeDescriptor {
                name: "act".into(),
                op_type: "relu".into(),
                attrs: json!({}),
                inputs: vec!["proj".into()],
            },
            etude_graph::NodeDescriptor {
                name: "y".into(),
                op_type: "output".into(),
                attrs: json!({}),
                inputs: vec!["act".into()],
            },
        ],
        outputs: vec!["y".into()],
    }
}

fn run(optimize: bool) -> Vec<f32> {
    let rt = Runtime::new().unwrap();
    let model = write_model();
    let pool = MemoryPool::new(1 << 20);

    let mut graph = build_graph(&descriptor(), &rt, Some(model.weights())).unwrap();
    if optimize {
        graph.optimize(all_optimizations()).unwrap();
    }
    graph.topological_sort().unwrap();

    let input = graph.input_nodes()[0];
    let output = graph.output_nodes()[0];
    graph
        .bind_input(input, Tensor::from_f32(vec![1, 2], &[3.0, 1.0]).unwrap())
        .unwrap();
    graph.execute(&rt, &pool).unwrap();
    graph.output(output, 0).unwrap().to_f32_vec().unwrap()
}

#[test]
fn test_model_weights_flow_into_execution() {
    // x.W + b = [3*1 + 1*2 + 0.5, 3*-1 + 1*-2 + 0.5] = [5.5, -4.5]
    // relu -> [5.5, 0.0]
    assert_eq!(run(false), vec![5.5, 0.0]);
}

#[test]
fn test_optimized_graph_matches_unoptimized() {
    assert_eq!(run(true), run(false));
}

#[test]
fn test_fusion_shrinks_pipeline_node_count() {
    let rt = Runtime::new().unwrap();
    let model = write_model();
    let mut graph = build_graph(&descriptor(), &rt, Some(model.weights())).unwrap();
    assert_eq!(graph.node_count(), 4);
    graph.optimize(all_optimizations()).unwrap();
    assert_eq!(graph.node_count(), 3);
}
