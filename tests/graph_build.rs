//! Graph builder scenarios: segment schemas across stages, sync placement,
//! and the MoE/Qwen branches.

use std::sync::Arc;

use repartir::graph::{OpCode, PipeSlicing, SyncType};
use repartir::model::{build_llm_net, ArchType, HiddenAct, LlmHeader};
use repartir::plan::{create_partition_plan, parse_stage_defs, uniform_plan};
use repartir::slice::RopeType;
use repartir::tensor::FloatType;

fn header(arch: ArchType, n_layers: u32, sync_type: FloatType) -> LlmHeader {
    let (n_experts, n_active, moe_hidden) = if arch == ArchType::Qwen3Moe {
        (4, 2, 96)
    } else {
        (0, 0, 0)
    };
    LlmHeader {
        header_bytes: 256,
        version: 1,
        arch_type: arch,
        dim: 64,
        hidden_dim: 128,
        n_layers,
        n_heads: 4,
        n_kv_heads: 4,
        n_experts,
        n_active_experts: n_active,
        vocab_size: 96,
        seq_len: 32,
        orig_seq_len: 32,
        hidden_act: HiddenAct::Silu,
        rope_theta: 10000.0,
        weight_type: FloatType::F32,
        rope_scaling_factor: 1.0,
        rope_scaling_low_freq_factor: 1.0,
        rope_scaling_high_freq_factor: 1.0,
        rope_scaling_orig_max_seq_len: 0,
        rope_type: if arch == ArchType::Llama { RopeType::Llama } else { RopeType::Falcon },
        head_dim: 16,
        norm_epsilon: 1e-5,
        moe_hidden_dim: moe_hidden,
        q_dim: 64,
        kv_dim: 64,
        sync_type,
        file_size: 0,
    }
}

fn sync_count(node: &repartir::graph::NodeConfig, sync_type: SyncType) -> usize {
    node.segments
        .iter()
        .flat_map(|s| &s.syncs)
        .filter(|s| s.sync_type == sync_type)
        .count()
}

#[test]
fn pure_pp_two_nodes_one_seam() {
    let h = header(ArchType::Llama, 8, FloatType::F32);
    let defs = parse_stage_defs("1*1", 2, 8).unwrap();
    let plan = Arc::new(create_partition_plan(&defs, 8, 4, 4, 96, 128, 64).unwrap());
    let net = build_llm_net(&h, 2, 4, plan).unwrap();

    let node0 = &net.node_configs[0];
    let node1 = &net.node_configs[1];

    // One seam: a single PP_SEND on the first stage, a single PP_RECV on the
    // second; never one per layer.
    assert_eq!(sync_count(node0, SyncType::PpSend), 1);
    assert_eq!(sync_count(node0, SyncType::PpRecv), 0);
    assert_eq!(sync_count(node1, SyncType::PpRecv), 1);
    assert_eq!(sync_count(node1, SyncType::PpSend), 0);

    // Singleton stages exchange no TP slices.
    assert_eq!(sync_count(node0, SyncType::NodeSlices), 0);
    assert_eq!(sync_count(node1, SyncType::NodeSlices), 0);

    // Node 0 owns layers 0..4, node 1 owns 4..8.
    let node0_layers: Vec<u32> = node0
        .segments
        .iter()
        .flat_map(|s| &s.ops)
        .filter(|o| o.name == "block_matmul_q")
        .map(|o| o.index)
        .collect();
    assert_eq!(node0_layers, vec![0, 1, 2, 3]);
    let node1_layers: Vec<u32> = node1
        .segments
        .iter()
        .flat_map(|s| &s.ops)
        .filter(|o| o.name == "block_matmul_q")
        .map(|o| o.index)
        .collect();
    assert_eq!(node1_layers, vec![4, 5, 6, 7]);

    // Only the last stage computes logits; node 0 still waits for them.
    assert!(node1.segments.iter().flat_map(|s| &s.ops).any(|o| o.name == "final_matmul_logits"));
    assert!(!node0.segments.iter().flat_map(|s| &s.ops).any(|o| o.name == "final_matmul_logits"));
    assert_eq!(sync_count(node0, SyncType::NodeSlicesExceptRoot), 1);
    assert_eq!(sync_count(node1, SyncType::NodeSlicesExceptRoot), 1);
}

#[test]
fn tp_pair_exchanges_slices_every_layer() {
    let h = header(ArchType::Llama, 4, FloatType::F32);
    let plan = Arc::new(uniform_plan(2, 4, 4, 4, 96, 128, 64).unwrap());
    let net = build_llm_net(&h, 2, 4, plan).unwrap();

    for node in &net.node_configs {
        // Two NodeSlices per layer: attention and FFN.
        assert_eq!(sync_count(node, SyncType::NodeSlices), 8);
        assert_eq!(sync_count(node, SyncType::PpSend), 0);
        assert_eq!(sync_count(node, SyncType::PpRecv), 0);
    }
}

#[test]
fn quantized_sync_inserts_casts() {
    let h = header(ArchType::Llama, 2, FloatType::Q80);
    let plan = Arc::new(uniform_plan(2, 2, 4, 4, 96, 128, 64).unwrap());
    let net = build_llm_net(&h, 2, 4, plan).unwrap();
    let node = &net.node_configs[0];

    let cast_names: Vec<&str> = node
        .segments
        .iter()
        .flat_map(|s| &s.ops)
        .filter(|o| o.code == OpCode::Cast)
        .map(|o| o.name.as_str())
        .collect();
    // Quantization casts exist for the matmul inputs.
    assert!(cast_names.contains(&"block_cast_y"));
    assert!(cast_names.contains(&"block_cast_d2"));

    // The exchange pipe itself is quantized.
    let zq = &net.net_config.pipes[net.zq_pipe as usize];
    assert_eq!(zq.size.float_type, FloatType::Q80);
    assert_eq!(zq.slicing, PipeSlicing::Uniform);
}

#[test]
fn moe_branch_emits_expert_pipeline() {
    let h = header(ArchType::Qwen3Moe, 2, FloatType::F32);
    let plan = Arc::new(uniform_plan(1, 2, 4, 4, 96, 96, 64).unwrap());
    let net = build_llm_net(&h, 1, 4, plan).unwrap();
    let node = &net.node_configs[0];

    let op_codes: Vec<OpCode> = node
        .segments
        .iter()
        .flat_map(|s| &s.ops)
        .map(|o| o.code)
        .collect();
    assert!(op_codes.contains(&OpCode::RepeatZ));
    assert!(op_codes.contains(&OpCode::MoeGate));
    assert!(op_codes.contains(&OpCode::Scale));
    assert!(op_codes.contains(&OpCode::MergeSum));
    assert!(op_codes.contains(&OpCode::Softmax));

    // Qwen arch carries per-head Q/K norms.
    let names: Vec<&str> = node
        .segments
        .iter()
        .flat_map(|s| &s.ops)
        .map(|o| o.name.as_str())
        .collect();
    assert!(names.contains(&"block_norm_q"));
    assert!(names.contains(&"block_norm_k"));

    // Expert matmuls carry the 3D expert weight shape.
    let w1 = node
        .segments
        .iter()
        .flat_map(|s| &s.ops)
        .find(|o| o.name == "block_matmul_w1")
        .unwrap();
    assert_eq!(w1.weight_size.z, 4);
}

#[test]
fn logits_pipe_is_plan_matched() {
    let h = header(ArchType::Llama, 4, FloatType::F32);
    let plan = Arc::new(uniform_plan(2, 4, 4, 4, 96, 128, 64).unwrap());
    let net = build_llm_net(&h, 2, 4, plan).unwrap();
    assert_eq!(
        net.net_config.pipes[net.logits_pipe as usize].slicing,
        PipeSlicing::PlanMatched
    );
    assert_eq!(
        net.net_config.pipes[net.zq_pipe as usize].size.x,
        64 * 2
    );
    assert_eq!(net.net_config.pre_syncs, vec![net.position_pipe]);
}
