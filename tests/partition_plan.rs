//! Partition planner scenarios: stage/layer assignment, GQA alignment, and
//! per-stage dimension coverage.

use repartir::plan::{create_partition_plan, parse_stage_defs, uniform_plan};

fn plan(ratios: &str, n_nodes: u32, n_layers: u32, heads: u32, kv: u32, vocab: u32, ffn: u32, dim: u32) -> repartir::plan::PartitionPlan {
    let defs = parse_stage_defs(ratios, n_nodes, n_layers).unwrap();
    create_partition_plan(&defs, n_layers, heads, kv, vocab, ffn, dim).unwrap()
}

#[test]
fn two_stages_split_layers_by_weight() {
    let plan = plan("1*1", 2, 8, 8, 8, 1000, 2048, 512);
    assert_eq!(plan.n_stages(), 2);
    assert_eq!(plan.stages[0].n_layers, 4);
    assert_eq!(plan.stages[1].n_layers, 4);
    assert_eq!(plan.stages[0].end_layer, plan.stages[1].start_layer);
    // Degenerate TP: each stage has a single node owning every dimension.
    assert_eq!(plan.head_split.lengths, vec![8, 8]);
    assert_eq!(plan.vocab_split.lengths, vec![1000, 1000]);
}

#[test]
fn stage_weights_scale_auto_layers() {
    // Stage weights derive from TP ratio sums: 1 vs 3.
    let plan = plan("1*3", 2, 8, 8, 8, 1000, 2048, 512);
    assert_eq!(plan.stages[0].n_layers, 2);
    assert_eq!(plan.stages[1].n_layers, 6);
}

#[test]
fn gqa_four_node_alignment() {
    let plan = plan("1,1,1,1", 4, 8, 32, 8, 32000, 11008, 4096);
    assert_eq!(plan.kv_head_split.lengths, vec![2, 2, 2, 2]);
    assert_eq!(plan.head_split.lengths, vec![8, 8, 8, 8]);
    for node in 0..4 {
        assert_eq!(
            plan.head_split.starts[node],
            plan.kv_head_split.starts[node] * 4
        );
        assert_eq!(
            plan.head_split.lengths[node],
            plan.kv_head_split.lengths[node] * 4
        );
    }
}

#[test]
fn uneven_two_level_plan() {
    // 2 stages, 4 nodes; stage 0 = ratios 1:1 over 10 layers, stage 1 =
    // ratios 2:3 over 14 layers.
    let plan = plan("1:2*1:1@10*2:3@14", 4, 24, 16, 8, 151_936, 3072, 1024);

    assert_eq!(plan.stages[0].n_layers, 10);
    assert_eq!(plan.stages[1].n_layers, 14);
    assert_eq!(plan.stages[1].root_node_index, 2);

    // Stage 0: even halves.
    assert_eq!(plan.kv_head_split.lengths[0..2], [4, 4]);
    assert_eq!(plan.head_split.lengths[0..2], [8, 8]);
    assert_eq!(plan.dim_split.lengths[0..2], [512, 512]);

    // Stage 1: kv 8 over 2:3 rounds to [3, 5].
    assert_eq!(plan.kv_head_split.lengths[2..4], [3, 5]);
    assert_eq!(plan.head_split.lengths[2..4], [6, 10]);

    // Hidden halves of stage 1: both at least 32, summing exactly to 1024.
    let d2 = plan.dim_split.lengths[2];
    let d3 = plan.dim_split.lengths[3];
    assert!(d2 >= 32 && d3 >= 32);
    assert_eq!(d2 + d3, 1024);
    assert_eq!(d2 % 32, 0);
}

#[test]
fn every_stage_owns_full_dimensions() {
    let plan = plan("1:2*1:1@10*2:3@14", 4, 24, 16, 8, 151_936, 3072, 1024);
    for stage in &plan.stages {
        let lo = stage.root_node_index as usize;
        let hi = lo + stage.n_nodes as usize;
        assert_eq!(plan.kv_head_split.total(lo..hi), 8);
        assert_eq!(plan.head_split.total(lo..hi), 16);
        assert_eq!(plan.vocab_split.total(lo..hi), 151_936);
        assert_eq!(plan.ffn_split.total(lo..hi), 3072);
        assert_eq!(plan.dim_split.total(lo..hi), 1024);
    }
    let layer_total: u32 = plan.stages.iter().map(|s| s.n_layers).sum();
    assert_eq!(layer_total, 24);
}

#[test]
fn node_indices_are_contiguous_and_complete() {
    let plan = plan("1:1*1:1:1*1", 6, 12, 12, 6, 32000, 4096, 768);
    let mut all: Vec<u32> = plan
        .stages
        .iter()
        .flat_map(|s| s.node_indices.clone())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..6).collect::<Vec<_>>());
    for stage in &plan.stages {
        assert_eq!(stage.root_node_index, stage.node_indices[0]);
    }
}

#[test]
fn explicit_layers_must_cover_model() {
    // Explicit counts summing past the model are rejected.
    assert!(parse_stage_defs("1@20*1@20", 2, 24).is_err());
    // Explicit counts that underfill with no auto stage are rejected.
    assert!(parse_stage_defs("1@10*1@10", 2, 24).is_err());
    // One auto stage absorbs the remainder.
    let defs = parse_stage_defs("1@10*1", 2, 24).unwrap();
    assert_eq!(defs[1].n_layers, 14);
}

#[test]
fn gqa_divisibility_is_enforced() {
    let defs = parse_stage_defs("1", 1, 4).unwrap();
    assert!(create_partition_plan(&defs, 4, 30, 7, 1000, 512, 256).is_err());
}

#[test]
fn wrong_node_count_is_diagnosed() {
    assert!(parse_stage_defs("1:1:1", 4, 8).is_err());
}

#[test]
fn trivial_singleton_plan() {
    let plan = uniform_plan(1, 4, 8, 8, 1000, 512, 256).unwrap();
    assert_eq!(plan.n_stages(), 1);
    assert_eq!(plan.stages[0].start_layer, 0);
    assert_eq!(plan.stages[0].end_layer, 4);
    assert_eq!(plan.head_split.lengths, vec![8]);
    assert_eq!(plan.kv_head_split.lengths, vec![8]);
    assert_eq!(plan.vocab_split.lengths, vec![1000]);
    assert_eq!(plan.ffn_split.lengths, vec![512]);
    assert_eq!(plan.dim_split.lengths, vec![256]);
}

#[test]
fn uniform_plan_requires_divisibility() {
    // vocab 1000 does not divide by 3.
    assert!(uniform_plan(3, 6, 6, 6, 1000, 513, 255).is_err());
    let ok = uniform_plan(2, 6, 6, 6, 1000, 512, 256).unwrap();
    assert_eq!(ok.vocab_split.lengths, vec![500, 500]);
}
