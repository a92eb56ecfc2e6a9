//! Model file header and dataflow graph construction
//!
//! The model file is little-endian: `magic u32`, `headerSize u32`, then
//! `(key u32, value i32)` pairs filling the header region, then the weights
//! concatenated in the fixed order the loader walks. `headerSize` counts the
//! whole header region including the magic and size fields; weights start at
//! that offset.
//!
//! `build_llm_net` walks the transformer once per node and emits the fixed
//! segment schema: Start, optional PP-Recv, per-layer attention and FFN
//! segments, optional PP-Send, End (last stage), and a root-wait segment for
//! global node 0 when it is not on the last stage.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use crate::error::{RepartirError, Result};
use crate::graph::{
    NetConfig, NetConfigBuilder, NodeConfig, NodeConfigBuilder, OpCode, OpParams, PipeSlicing,
    PointerConfig, PointerSource, SegmentBuilder, SyncType,
};
use crate::plan::PartitionPlan;
use crate::slice::{
    slice_col_matmul, slice_kv_cache, slice_multihead_att, slice_rope, slice_row_matmul, RopeType,
};
use crate::tensor::{FloatType, Size3D};

/// Model file magic
pub const MODEL_MAGIC: u32 = 0x0A00_ABCD;
/// Magics of the retired format, rejected with a dedicated message
pub const OLD_MODEL_MAGICS: [u32; 2] = [0x00AB_CD00, 0x00AB_CD01];

/// Header keys (stored as `u32` in the file)
#[repr(u32)]
enum HeaderKey {
    Version = 0,
    ArchType = 1,
    Dim = 2,
    HiddenDim = 3,
    NLayers = 4,
    NHeads = 5,
    NKvHeads = 6,
    NExperts = 7,
    NActiveExperts = 8,
    VocabSize = 9,
    SeqLen = 10,
    HiddenAct = 11,
    RopeTheta = 12,
    WeightFloatType = 13,
    RopeScalingFactor = 14,
    RopeScalingLowFreqFactor = 15,
    RopeScalingHighFreqFactor = 16,
    RopeScalingOrigMaxSeqLen = 17,
    RopeType = 18,
    HeadDim = 19,
    NormEpsilon = 20,
    MoeHiddenDim = 21,
}

/// Transformer architecture family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArchType {
    /// LLaMA-style dense decoder
    Llama = 0x00AB_CD00,
    /// Qwen3 dense (per-head Q/K norms, Falcon RoPE)
    Qwen3 = 0x00AB_CD01,
    /// Qwen3 mixture-of-experts
    Qwen3Moe = 0x00AB_CD02,
}

impl ArchType {
    fn from_code(code: u32) -> Result<Self> {
        match code {
            0x00AB_CD00 => Ok(ArchType::Llama),
            0x00AB_CD01 => Ok(ArchType::Qwen3),
            0x00AB_CD02 => Ok(ArchType::Qwen3Moe),
            _ => Err(RepartirError::ModelFormat(format!(
                "Unsupported architecture code: 0x{code:X}"
            ))),
        }
    }

    /// Diagnostic name
    pub fn name(self) -> &'static str {
        match self {
            ArchType::Llama => "Llama",
            ArchType::Qwen3 => "Qwen3",
            ArchType::Qwen3Moe => "Qwen3 MoE",
        }
    }

    fn is_qwen(self) -> bool {
        matches!(self, ArchType::Qwen3 | ArchType::Qwen3Moe)
    }
}

/// FFN activation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HiddenAct {
    /// GELU
    Gelu = 0,
    /// SiLU
    Silu = 1,
}

/// Parsed model file header with derived dimensions
#[derive(Debug, Clone)]
pub struct LlmHeader {
    /// Byte offset where the weight region starts
    pub header_bytes: usize,
    /// Format version
    pub version: u32,
    /// Architecture family
    pub arch_type: ArchType,
    /// Hidden dimension
    pub dim: u32,
    /// Dense FFN dimension
    pub hidden_dim: u32,
    /// Transformer layer count
    pub n_layers: u32,
    /// Attention head count
    pub n_heads: u32,
    /// KV head count
    pub n_kv_heads: u32,
    /// Expert count (0 = dense)
    pub n_experts: u32,
    /// Active experts per token
    pub n_active_experts: u32,
    /// Vocabulary size
    pub vocab_size: u32,
    /// Effective sequence length (after `--max-seq-len` capping)
    pub seq_len: u32,
    /// Sequence length stored in the file
    pub orig_seq_len: u32,
    /// FFN activation
    pub hidden_act: HiddenAct,
    /// RoPE base frequency
    pub rope_theta: f32,
    /// Weight storage format
    pub weight_type: FloatType,
    /// LLaMA 3.1 rope scaling factor (1.0 = off)
    pub rope_scaling_factor: f32,
    /// Low-frequency scaling factor
    pub rope_scaling_low_freq_factor: f32,
    /// High-frequency scaling factor
    pub rope_scaling_high_freq_factor: f32,
    /// Original max sequence length used by scaling
    pub rope_scaling_orig_max_seq_len: u32,
    /// RoPE family
    pub rope_type: RopeType,
    /// Per-head dimension
    pub head_dim: u32,
    /// RMS norm epsilon
    pub norm_epsilon: f32,
    /// MoE FFN dimension (0 = dense)
    pub moe_hidden_dim: u32,
    /// Derived Q projection dimension (`headDim * nHeads`)
    pub q_dim: u32,
    /// Derived KV projection dimension (`headDim * nKvHeads`)
    pub kv_dim: u32,
    /// Inter-node activation exchange format
    pub sync_type: FloatType,
    /// Total file size in bytes
    pub file_size: usize,
}

fn convert_norm_epsilon(value: i32) -> Result<f32> {
    match value {
        5 => Ok(1e-5),
        6 => Ok(1e-6),
        _ => Err(RepartirError::ModelFormat(format!(
            "Unsupported norm epsilon code: {value}"
        ))),
    }
}

impl LlmHeader {
    /// The FFN dimension the graph actually uses (MoE models route through
    /// the expert FFN dimension)
    pub fn ffn_dim(&self) -> u32 {
        if self.arch_type == ArchType::Qwen3Moe {
            self.moe_hidden_dim
        } else {
            self.hidden_dim
        }
    }

    /// Parse the header of the model file at `path`.
    ///
    /// `max_seq_len` of 0 leaves the stored sequence length untouched;
    /// otherwise it caps it. `sync_type` records the requested inter-node
    /// exchange format.
    pub fn load(path: &str, max_seq_len: u32, sync_type: FloatType) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            RepartirError::ModelFormat(format!("Cannot open model file ({path}): {e}"))
        })?;
        let file_size = file.metadata()?.len() as usize;

        let mut word = [0u8; 4];
        file.read_exact(&mut word)?;
        let magic = u32::from_le_bytes(word);
        if OLD_MODEL_MAGICS.contains(&magic) {
            return Err(RepartirError::ModelFormat(
                "Old model format is not supported".to_string(),
            ));
        }
        if magic != MODEL_MAGIC {
            return Err(RepartirError::ModelFormat(format!(
                "Unsupported magic number: 0x{magic:X}"
            )));
        }

        file.read_exact(&mut word)?;
        let header_size = u32::from_le_bytes(word) as usize;
        if header_size < 8 || header_size > file_size || (header_size - 8) % 8 != 0 {
            return Err(RepartirError::ModelFormat(format!(
                "Bad header size: {header_size}"
            )));
        }
        let mut kv = vec![0u8; header_size - 8];
        file.read_exact(&mut kv)?;

        let mut version = 0u32;
        let mut arch_code = None;
        let mut dim = 0u32;
        let mut hidden_dim = 0u32;
        let mut n_layers = 0u32;
        let mut n_heads = 0u32;
        let mut n_kv_heads = 0u32;
        let mut n_experts = 0u32;
        let mut n_active_experts = 0u32;
        let mut vocab_size = 0u32;
        let mut seq_len = 0u32;
        let mut hidden_act = HiddenAct::Silu;
        let mut rope_theta = 10000.0f32;
        let mut weight_type = FloatType::Unk;
        let mut rope_scaling_factor = 1.0f32;
        let mut rope_scaling_low = 1.0f32;
        let mut rope_scaling_high = 1.0f32;
        let mut rope_scaling_orig = 0u32;
        let mut rope_type = RopeType::Llama;
        let mut head_dim = 0u32;
        let mut norm_epsilon = 1e-5f32;
        let mut moe_hidden_dim = 0u32;

        for pair in kv.chunks_exact(8) {
            let key = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let value = i32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
            let uvalue = value as u32;
            match key {
                k if k == HeaderKey::Version as u32 => version = uvalue,
                k if k == HeaderKey::ArchType as u32 => arch_code = Some(uvalue),
                k if k == HeaderKey::Dim as u32 => dim = uvalue,
                k if k == HeaderKey::HiddenDim as u32 => hidden_dim = uvalue,
                k if k == HeaderKey::NLayers as u32 => n_layers = uvalue,
                k if k == HeaderKey::NHeads as u32 => n_heads = uvalue,
                k if k == HeaderKey::NKvHeads as u32 => n_kv_heads = uvalue,
                k if k == HeaderKey::NExperts as u32 => n_experts = uvalue,
                k if k == HeaderKey::NActiveExperts as u32 => n_active_experts = uvalue,
                k if k == HeaderKey::VocabSize as u32 => vocab_size = uvalue,
                k if k == HeaderKey::SeqLen as u32 => seq_len = uvalue,
                k if k == HeaderKey::HiddenAct as u32 => {
                    hidden_act = match value {
                        0 => HiddenAct::Gelu,
                        1 => HiddenAct::Silu,
                        _ => {
                            return Err(RepartirError::ModelFormat(format!(
                                "Unsupported hidden act code: {value}"
                            )))
                        }
                    }
                }
                k if k == HeaderKey::RopeTheta as u32 => rope_theta = value as f32,
                k if k == HeaderKey::WeightFloatType as u32 => {
                    weight_type = FloatType::from_code(uvalue)?;
                }
                k if k == HeaderKey::RopeScalingFactor as u32 => rope_scaling_factor = value as f32,
                k if k == HeaderKey::RopeScalingLowFreqFactor as u32 => {
                    rope_scaling_low = value as f32;
                }
                k if k == HeaderKey::RopeScalingHighFreqFactor as u32 => {
                    rope_scaling_high = value as f32;
                }
                k if k == HeaderKey::RopeScalingOrigMaxSeqLen as u32 => rope_scaling_orig = uvalue,
                k if k == HeaderKey::RopeType as u32 => rope_type = RopeType::from_code(uvalue)?,
                k if k == HeaderKey::HeadDim as u32 => head_dim = uvalue,
                k if k == HeaderKey::NormEpsilon as u32 => norm_epsilon = convert_norm_epsilon(value)?,
                k if k == HeaderKey::MoeHiddenDim as u32 => moe_hidden_dim = uvalue,
                _ => {
                    return Err(RepartirError::ModelFormat(format!(
                        "Unsupported header key: {key}"
                    )))
                }
            }
        }

        let arch_type = ArchType::from_code(arch_code.ok_or_else(|| {
            RepartirError::ModelFormat("Model does not specify architecture".to_string())
        })?)?;
        if weight_type == FloatType::Unk {
            return Err(RepartirError::ModelFormat(
                "Model does not specify weight type".to_string(),
            ));
        }

        let orig_seq_len = seq_len;
        if max_seq_len > 0 && seq_len > max_seq_len {
            seq_len = max_seq_len;
        }
        if head_dim == 0 {
            head_dim = dim / n_heads;
        }
        if arch_type.is_qwen() {
            rope_type = RopeType::Falcon;
        }

        Ok(LlmHeader {
            header_bytes: header_size,
            version,
            arch_type,
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            n_experts,
            n_active_experts,
            vocab_size,
            seq_len,
            orig_seq_len,
            hidden_act,
            rope_theta,
            weight_type,
            rope_scaling_factor,
            rope_scaling_low_freq_factor: rope_scaling_low,
            rope_scaling_high_freq_factor: rope_scaling_high,
            rope_scaling_orig_max_seq_len: rope_scaling_orig,
            rope_type,
            head_dim,
            norm_epsilon,
            moe_hidden_dim,
            q_dim: head_dim * n_heads,
            kv_dim: head_dim * n_kv_heads,
            sync_type,
            file_size,
        })
    }

    /// Log a one-line-per-field summary of the model
    pub fn log_summary(&self) {
        tracing::info!(
            arch = self.arch_type.name(),
            dim = self.dim,
            head_dim = self.head_dim,
            hidden_dim = self.hidden_dim,
            vocab = self.vocab_size,
            layers = self.n_layers,
            heads = self.n_heads,
            kv_heads = self.n_kv_heads,
            seq_len = self.seq_len,
            weight_type = self.weight_type.name(),
            "model header"
        );
        if self.n_experts > 0 {
            tracing::info!(
                experts = self.n_experts,
                active = self.n_active_experts,
                moe_hidden_dim = self.moe_hidden_dim,
                "mixture of experts"
            );
        }
    }
}

/// The compiled network: shared pipes plus one node config per node
pub struct LlmNet {
    /// Model header the net was built from
    pub header: LlmHeader,
    /// Shared partition plan
    pub plan: Arc<PartitionPlan>,
    /// Net-level configuration
    pub net_config: NetConfig,
    /// One config per global node id
    pub node_configs: Vec<NodeConfig>,
    /// POS pipe index (pre-synced positions)
    pub position_pipe: u32,
    /// TOK pipe index (root-owned token ids)
    pub token_pipe: u32,
    /// X pipe index (stage-boundary activations)
    pub x_pipe: u32,
    /// LG pipe index (logits gathered to root)
    pub logits_pipe: u32,
    /// ZQ pipe index (TP partial-output exchange)
    pub zq_pipe: u32,
    /// Token embedding size (always F32)
    pub token_embedding_size: Size3D,
    /// RMS norm weight size
    pub rms_norm_size: Size3D,
    /// Per-head Q/K norm weight size (Qwen)
    pub qk_rms_norm_size: Size3D,
    /// MoE gate weight size
    pub moe_gate_size: Size3D,
}

/// Build the per-node operator DAG for every node against the plan.
pub fn build_llm_net(
    h: &LlmHeader,
    n_nodes: u32,
    n_batches: u32,
    plan: Arc<PartitionPlan>,
) -> Result<LlmNet> {
    let mut net_builder = NetConfigBuilder::new(n_nodes, n_batches);
    let position_pipe = net_builder.add_pipe(
        "POS",
        Size3D::d2(FloatType::F32, n_batches, 1),
        PipeSlicing::Uniform,
    );
    let token_pipe = net_builder.add_pipe(
        "TOK",
        Size3D::d2(FloatType::F32, n_batches, 1),
        PipeSlicing::Uniform,
    );
    let x_pipe = net_builder.add_pipe(
        "X",
        Size3D::d2(FloatType::F32, n_batches, h.dim),
        PipeSlicing::Uniform,
    );
    let logits_pipe = net_builder.add_pipe(
        "LG",
        Size3D::d2(FloatType::F32, n_batches, h.vocab_size),
        PipeSlicing::PlanMatched,
    );
    // Worst-case size so the same pipe holds any TP scatter without rebinding.
    let zq_pipe = net_builder.add_pipe(
        "ZQ",
        Size3D::d2(h.sync_type, n_batches, h.dim * n_nodes),
        PipeSlicing::Uniform,
    );
    net_builder.add_pre_sync(position_pipe);
    let net_config = net_builder.build();

    let mut net = LlmNet {
        header: h.clone(),
        plan: Arc::clone(&plan),
        net_config,
        node_configs: Vec::with_capacity(n_nodes as usize),
        position_pipe,
        token_pipe,
        x_pipe,
        logits_pipe,
        zq_pipe,
        token_embedding_size: Size3D::d2(FloatType::F32, h.vocab_size, h.dim),
        rms_norm_size: Size3D::d1(FloatType::F32, h.dim),
        qk_rms_norm_size: Size3D::d1(FloatType::F32, h.head_dim),
        moe_gate_size: Size3D::d2(FloatType::F32, h.dim, h.n_experts),
    };

    for node_index in 0..n_nodes {
        let config = build_llm_node(h, &net, &plan, n_batches, node_index)?;
        net.node_configs.push(config);
    }
    Ok(net)
}

#[allow(clippy::too_many_lines)]
fn build_llm_node(
    h: &LlmHeader,
    net: &LlmNet,
    plan: &Arc<PartitionPlan>,
    n_batches: u32,
    node_index: u32,
) -> Result<NodeConfig> {
    let stage = plan.stage_for_node(node_index).ok_or_else(|| {
        RepartirError::Config(format!("Node {node_index} is not a member of any stage"))
    })?;
    let start_layer = stage.start_layer;
    let end_layer = stage.end_layer;
    let is_first_stage = stage.stage_index == 0;
    let is_last_stage = stage.stage_index == plan.n_stages() - 1;
    let singleton_stage = stage.n_nodes == 1;
    let node = node_index as usize;

    let n_experts_or1 = h.n_experts.max(1);
    let n_active_or1 = h.n_active_experts.max(1);
    let ffn_dim = h.ffn_dim();
    let is_moe = h.arch_type == ArchType::Qwen3Moe;
    let wt = h.weight_type;

    let kv_cache = slice_kv_cache(h.seq_len, h.head_dim, &plan.kv_head_split, node);
    let att = slice_multihead_att(n_batches, h.n_heads, h.seq_len, &plan.head_split, node);
    let q_slice = slice_row_matmul(wt, h.dim, &plan.head_split, h.head_dim, h.q_dim, node);
    let k_slice = slice_row_matmul(wt, h.dim, &plan.kv_head_split, h.head_dim, h.kv_dim, node);
    let v_slice = slice_row_matmul(wt, h.dim, &plan.kv_head_split, h.head_dim, h.kv_dim, node);
    let wo_slice = slice_col_matmul(wt, h.q_dim, &plan.head_split, h.head_dim, h.dim, node);
    let w1_slice = slice_row_matmul(wt, h.dim, &plan.ffn_split, 1, ffn_dim, node);
    let w2_slice = slice_col_matmul(wt, ffn_dim, &plan.ffn_split, 1, h.dim, node);
    let w3_slice = slice_row_matmul(wt, h.dim, &plan.ffn_split, 1, ffn_dim, node);
    let wcls_slice = slice_row_matmul(wt, h.dim, &plan.vocab_split, 1, h.vocab_size, node);
    let rope_slice = slice_rope(
        h.rope_type,
        h.seq_len,
        h.kv_dim,
        h.n_kv_heads,
        h.head_dim,
        h.rope_theta,
        &plan.head_split,
        &plan.kv_head_split,
        node,
    )?;

    let (n_q_norm_cols, n_k_norm_cols) = if h.arch_type.is_qwen() {
        (q_slice.in_len / h.head_dim, k_slice.in_len / h.head_dim)
    } else {
        (1, 1)
    };
    let n_inv_cols = n_q_norm_cols.max(n_k_norm_cols);

    let mut b = NodeConfigBuilder::new(node_index, Arc::clone(plan));

    let x_buf = b.add_buffer("x", Size3D::d2(FloatType::F32, n_batches, h.dim));
    let y_buf = b.add_buffer("y", Size3D::d2(FloatType::F32, n_batches, h.dim));
    let yq_buf = if h.sync_type == FloatType::F32 {
        y_buf
    } else {
        b.add_buffer("q_y", Size3D::d2(h.sync_type, n_batches, h.dim))
    };

    let mha_out_buf = b.add_buffer("mha_out", Size3D::d2(FloatType::F32, n_batches, q_slice.in_len));
    let mha_out_q_buf = if h.sync_type == FloatType::F32 {
        mha_out_buf
    } else {
        b.add_buffer("q_mha_out", Size3D::d2(h.sync_type, n_batches, q_slice.in_len))
    };

    let q_buf = b.add_buffer("q", Size3D::d2(FloatType::F32, n_batches, q_slice.in_len));
    let k_temp_buf = b.add_buffer("k_temp", Size3D::d2(FloatType::F32, n_batches, k_slice.in_len));
    let v_temp_buf = b.add_buffer("v_temp", Size3D::d2(FloatType::F32, n_batches, v_slice.in_len));
    let inv_rms_buf = b.add_buffer("inv_rms", Size3D::d2(FloatType::F32, n_batches, n_inv_cols));
    let rope_cache_buf = b.add_buffer("rope_cache", rope_slice.cache_size);
    let att_buf = b.add_buffer("att", att.att_size);
    let logits_slice_buf = b.add_buffer("lg", Size3D::d2(FloatType::F32, n_batches, wcls_slice.in_len));

    let d_buf = b.add_buffer("d", Size3D::d2(FloatType::F32, n_batches, w1_slice.in_len));
    let dq_buf = if h.sync_type == FloatType::F32 {
        d_buf
    } else {
        b.add_buffer("q_d", Size3D::d2(h.sync_type, n_batches, w1_slice.in_len))
    };
    let l_buf = b.add_buffer("l", Size3D::d2(FloatType::F32, n_batches, w3_slice.in_len));

    let moe_gt_buf = b.add_buffer("gt", Size3D::d2(FloatType::F32, n_batches, n_experts_or1));
    let moe_ix_buf = b.add_buffer("act_exp_ix", Size3D::d2(FloatType::F32, n_batches, n_active_or1));
    let moe_y_buf = b.add_buffer("moe_y", Size3D::d3(FloatType::F32, n_active_or1, n_batches, h.dim));
    let moe_yq_buf = if h.sync_type == FloatType::F32 {
        moe_y_buf
    } else {
        b.add_buffer("q_moe_y", Size3D::d3(h.sync_type, n_active_or1, n_batches, h.dim))
    };
    let moe_d_buf = b.add_buffer(
        "moe_d",
        Size3D::d3(FloatType::F32, n_active_or1, n_batches, w1_slice.in_len),
    );
    let moe_dq_buf = if h.sync_type == FloatType::F32 {
        moe_d_buf
    } else {
        b.add_buffer("q_moe_d", Size3D::d3(h.sync_type, n_active_or1, n_batches, w1_slice.in_len))
    };
    let moe_l_buf = b.add_buffer(
        "moe_l",
        Size3D::d3(FloatType::F32, n_active_or1, n_batches, w3_slice.in_len),
    );
    let moe_s_buf = b.add_buffer("moe_s", Size3D::d3(FloatType::F32, n_active_or1, n_batches, 1));

    let act_code = match h.hidden_act {
        HiddenAct::Silu => OpCode::Silu,
        HiddenAct::Gelu => OpCode::Gelu,
    };
    let dense_matmul = OpParams::Matmul {
        n_experts: 0,
        n_active_experts: 0,
        indexes_buffer: moe_ix_buf,
    };

    // Start segment: embed on the first stage's global node 0, then share X
    // with the stage.
    let mut start = SegmentBuilder::new();
    if is_first_stage && node_index == 0 {
        start.add_op(
            OpCode::Embedding,
            "embedding",
            0,
            PointerConfig::batch(PointerSource::Pipe, net.token_pipe),
            PointerConfig::batch(PointerSource::Pipe, net.x_pipe),
            net.token_embedding_size,
            OpParams::None,
        );
    }
    if is_first_stage {
        start.add_sync(net.x_pipe, SyncType::WithRoot);
    }
    if !start.is_empty() {
        b.add_segment(start.build());
    }

    // PP-Recv segment: stage root pulls X from the previous stage, then
    // shares it with the stage.
    if !is_first_stage {
        let mut pp_recv = SegmentBuilder::new();
        pp_recv.add_sync(net.x_pipe, SyncType::PpRecv);
        pp_recv.add_sync(net.x_pipe, SyncType::WithRoot);
        b.add_segment(pp_recv.build());
    }

    for layer in start_layer..end_layer {
        let k_buf = b.add_buffer("k", kv_cache.key_size);
        let v_buf = b.add_buffer("v", kv_cache.value_size);

        let mut att_seg = SegmentBuilder::new();
        let mut ff_seg = SegmentBuilder::new();

        if layer == start_layer && (layer == 0 || !is_first_stage) {
            // Stage entry: X pipe carries the embedding or the PP handoff.
            att_seg.add_op(
                OpCode::Cast,
                "block_cast_x",
                layer,
                PointerConfig::batch(PointerSource::Pipe, net.x_pipe),
                PointerConfig::batch(PointerSource::Buffer, x_buf),
                Size3D::none(),
                OpParams::None,
            );
        } else {
            att_seg.add_op(
                OpCode::MergeAdd,
                "block_merge_add",
                layer,
                PointerConfig::batch(PointerSource::Pipe, net.zq_pipe),
                PointerConfig::batch(PointerSource::Buffer, x_buf),
                Size3D::none(),
                OpParams::None,
            );
        }

        att_seg.add_op(
            OpCode::InvRms,
            "block_norm_pre_0",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
            Size3D::none(),
            OpParams::InvRms { epsilon: h.norm_epsilon, n_columns: 1 },
        );
        att_seg.add_op(
            OpCode::RmsNorm,
            "block_norm_0",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            net.rms_norm_size,
            OpParams::RmsNorm { inv_rms_buffer: inv_rms_buf, n_columns: 1 },
        );
        if y_buf != yq_buf {
            att_seg.add_op(
                OpCode::Cast,
                "block_cast_y",
                layer,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                Size3D::none(),
                OpParams::None,
            );
        }
        att_seg.add_op(
            OpCode::Matmul,
            "block_matmul_q",
            layer,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, q_buf),
            q_slice.slice_size,
            dense_matmul.clone(),
        );
        att_seg.add_op(
            OpCode::Matmul,
            "block_matmul_k",
            layer,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            k_slice.slice_size,
            dense_matmul.clone(),
        );
        att_seg.add_op(
            OpCode::Matmul,
            "block_matmul_v",
            layer,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, v_temp_buf),
            v_slice.slice_size,
            dense_matmul.clone(),
        );

        if h.arch_type.is_qwen() {
            att_seg.add_op(
                OpCode::InvRms,
                "block_norm_pre_q",
                layer,
                PointerConfig::batch(PointerSource::Buffer, q_buf),
                PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
                Size3D::none(),
                OpParams::InvRms { epsilon: h.norm_epsilon, n_columns: n_q_norm_cols },
            );
            att_seg.add_op(
                OpCode::RmsNorm,
                "block_norm_q",
                layer,
                PointerConfig::batch(PointerSource::Buffer, q_buf),
                PointerConfig::batch(PointerSource::Buffer, q_buf),
                net.qk_rms_norm_size,
                OpParams::RmsNorm { inv_rms_buffer: inv_rms_buf, n_columns: n_q_norm_cols },
            );
            att_seg.add_op(
                OpCode::InvRms,
                "block_norm_pre_k",
                layer,
                PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
                PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
                Size3D::none(),
                OpParams::InvRms { epsilon: h.norm_epsilon, n_columns: n_k_norm_cols },
            );
            att_seg.add_op(
                OpCode::RmsNorm,
                "block_norm_k",
                layer,
                PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
                PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
                net.qk_rms_norm_size,
                OpParams::RmsNorm { inv_rms_buffer: inv_rms_buf, n_columns: n_k_norm_cols },
            );
        }

        let rope_params = |is_q: u32| OpParams::Rope {
            rope_type: h.rope_type,
            is_q,
            position_pipe: net.position_pipe,
            cache_buffer: rope_cache_buf,
            scaling_factor: h.rope_scaling_factor,
            scaling_low_freq: h.rope_scaling_low_freq_factor,
            scaling_high_freq: h.rope_scaling_high_freq_factor,
            scaling_orig_max_seq_len: h.rope_scaling_orig_max_seq_len,
            slice: rope_slice,
        };
        att_seg.add_op(
            OpCode::Rope,
            "block_rope_q",
            layer,
            PointerConfig::batch(PointerSource::Buffer, q_buf),
            PointerConfig::batch(PointerSource::Buffer, q_buf),
            Size3D::none(),
            rope_params(1),
        );
        att_seg.add_op(
            OpCode::Rope,
            "block_rope_k",
            layer,
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            Size3D::none(),
            rope_params(0),
        );
        att_seg.add_op(
            OpCode::Shift,
            "block_shift_k",
            layer,
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            PointerConfig::raw(PointerSource::Buffer, k_buf),
            Size3D::none(),
            OpParams::Shift { position_pipe: net.position_pipe },
        );
        att_seg.add_op(
            OpCode::Shift,
            "block_shift_v",
            layer,
            PointerConfig::batch(PointerSource::Buffer, v_temp_buf),
            PointerConfig::raw(PointerSource::Buffer, v_buf),
            Size3D::none(),
            OpParams::Shift { position_pipe: net.position_pipe },
        );
        att_seg.add_op(
            OpCode::MultiheadAtt,
            "block_multihead_att",
            layer,
            PointerConfig::batch(PointerSource::Buffer, mha_out_buf),
            PointerConfig::batch(PointerSource::Buffer, mha_out_buf),
            Size3D::none(),
            OpParams::MultiheadAtt {
                n_heads: att.n_heads,
                n_heads0: att.head_len,
                n_kv_heads: h.n_kv_heads,
                head_dim: h.head_dim,
                seq_len: h.seq_len,
                q_dim0: q_slice.in_len,
                kv_dim0: kv_cache.kv_len,
                position_pipe: net.position_pipe,
                query_buffer: q_buf,
                key_cache_buffer: k_buf,
                value_cache_buffer: v_buf,
                att_buffer: att_buf,
            },
        );
        if mha_out_buf != mha_out_q_buf {
            att_seg.add_op(
                OpCode::Cast,
                "block_cast_y2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, mha_out_buf),
                PointerConfig::batch(PointerSource::Buffer, mha_out_q_buf),
                Size3D::none(),
                OpParams::None,
            );
        }
        att_seg.add_op(
            OpCode::Matmul,
            "block_matmul_wo",
            layer,
            PointerConfig::batch(PointerSource::Buffer, mha_out_q_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            wo_slice.slice_size,
            dense_matmul.clone(),
        );
        att_seg.add_op(
            OpCode::Cast,
            "block_cast_d",
            layer,
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            PointerConfig::batched_slice(PointerSource::Pipe, net.zq_pipe),
            Size3D::none(),
            OpParams::None,
        );
        if !singleton_stage {
            att_seg.add_sync(net.zq_pipe, SyncType::NodeSlices);
        }

        // FFN segment
        ff_seg.add_op(
            OpCode::MergeAdd,
            "block_merge_add2",
            layer,
            PointerConfig::batch(PointerSource::Pipe, net.zq_pipe),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            Size3D::none(),
            OpParams::None,
        );
        ff_seg.add_op(
            OpCode::InvRms,
            "block_norm_pre_1",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
            Size3D::none(),
            OpParams::InvRms { epsilon: h.norm_epsilon, n_columns: 1 },
        );
        ff_seg.add_op(
            OpCode::RmsNorm,
            "block_norm_1",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            net.rms_norm_size,
            OpParams::RmsNorm { inv_rms_buffer: inv_rms_buf, n_columns: 1 },
        );

        if is_moe {
            let expert_matmul = OpParams::Matmul {
                n_experts: h.n_experts,
                n_active_experts: h.n_active_experts,
                indexes_buffer: moe_ix_buf,
            };
            ff_seg.add_op(
                OpCode::RepeatZ,
                "block_moe_y_repeat",
                layer,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_yq_buf),
                Size3D::none(),
                OpParams::None,
            );
            ff_seg.add_op(
                OpCode::Matmul,
                "block_moe_gate",
                layer,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_gt_buf),
                net.moe_gate_size,
                dense_matmul.clone(),
            );
            ff_seg.add_op(
                OpCode::Softmax,
                "block_moe_softmax",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_gt_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_gt_buf),
                Size3D::none(),
                OpParams::None,
            );
            ff_seg.add_op(
                OpCode::MoeGate,
                "block_moe_gate2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_gt_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_s_buf),
                Size3D::none(),
                OpParams::MoeGate { k: h.n_active_experts, norm_topk: 1, indexes_buffer: moe_ix_buf },
            );
            ff_seg.add_op(
                OpCode::Matmul,
                "block_matmul_w1",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_yq_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                Size3D::d3(wt, h.n_experts, w1_slice.n, w1_slice.in_len),
                expert_matmul.clone(),
            );
            ff_seg.add_op(
                OpCode::Matmul,
                "block_matmul_w3",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_yq_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_l_buf),
                Size3D::d3(wt, h.n_experts, w3_slice.n, w3_slice.in_len),
                expert_matmul.clone(),
            );
            ff_seg.add_op(
                act_code,
                "block_act",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                Size3D::none(),
                OpParams::None,
            );
            ff_seg.add_op(
                OpCode::Mul,
                "block_mul",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                Size3D::none(),
                OpParams::Mul { multiplier_buffer: moe_l_buf },
            );
            if moe_d_buf != moe_dq_buf {
                ff_seg.add_op(
                    OpCode::Cast,
                    "block_cast_d2",
                    layer,
                    PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                    PointerConfig::batch(PointerSource::Buffer, moe_dq_buf),
                    Size3D::none(),
                    OpParams::None,
                );
            }
            ff_seg.add_op(
                OpCode::Matmul,
                "block_matmul_w2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_dq_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                Size3D::d3(wt, h.n_experts, w2_slice.n0, w2_slice.d),
                expert_matmul,
            );
            ff_seg.add_op(
                OpCode::Scale,
                "block_moe_scale",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                Size3D::none(),
                OpParams::Scale { scale_buffer: moe_s_buf },
            );
            ff_seg.add_op(
                OpCode::MergeSum,
                "block_moe_merge_sum",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                Size3D::none(),
                OpParams::None,
            );
        } else {
            if y_buf != yq_buf {
                ff_seg.add_op(
                    OpCode::Cast,
                    "block_cast_y3",
                    layer,
                    PointerConfig::batch(PointerSource::Buffer, y_buf),
                    PointerConfig::batch(PointerSource::Buffer, yq_buf),
                    Size3D::none(),
                    OpParams::None,
                );
            }
            ff_seg.add_op(
                OpCode::Matmul,
                "block_matmul_w1",
                layer,
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                w1_slice.slice_size,
                dense_matmul.clone(),
            );
            ff_seg.add_op(
                OpCode::Matmul,
                "block_matmul_w3",
                layer,
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                PointerConfig::batch(PointerSource::Buffer, l_buf),
                w3_slice.slice_size,
                dense_matmul.clone(),
            );
            ff_seg.add_op(
                act_code,
                "block_act",
                layer,
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                Size3D::none(),
                OpParams::None,
            );
            ff_seg.add_op(
                OpCode::Mul,
                "block_mul",
                layer,
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                Size3D::none(),
                OpParams::Mul { multiplier_buffer: l_buf },
            );
            if d_buf != dq_buf {
                ff_seg.add_op(
                    OpCode::Cast,
                    "block_cast_d2",
                    layer,
                    PointerConfig::batch(PointerSource::Buffer, d_buf),
                    PointerConfig::batch(PointerSource::Buffer, dq_buf),
                    Size3D::none(),
                    OpParams::None,
                );
            }
            ff_seg.add_op(
                OpCode::Matmul,
                "block_matmul_w2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, dq_buf),
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                w2_slice.slice_size,
                dense_matmul.clone(),
            );
        }
        ff_seg.add_op(
            OpCode::Cast,
            "block_cast_d3",
            layer,
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            PointerConfig::batched_slice(PointerSource::Pipe, net.zq_pipe),
            Size3D::none(),
            OpParams::None,
        );
        if !singleton_stage {
            ff_seg.add_sync(net.zq_pipe, SyncType::NodeSlices);
        }

        b.add_segment(att_seg.build());
        b.add_segment(ff_seg.build());
    }

    // PP-Send segment: finish the last layer's residual, publish it on X,
    // then hand it to the next stage's root.
    if !is_last_stage {
        let mut pp_send = SegmentBuilder::new();
        pp_send.add_op(
            OpCode::MergeAdd,
            "pp_stage_merge",
            end_layer - 1,
            PointerConfig::batch(PointerSource::Pipe, net.zq_pipe),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            Size3D::none(),
            OpParams::None,
        );
        pp_send.add_op(
            OpCode::Cast,
            "pp_cast_out",
            end_layer - 1,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Pipe, net.x_pipe),
            Size3D::none(),
            OpParams::None,
        );
        pp_send.add_sync(net.x_pipe, SyncType::PpSend);
        b.add_segment(pp_send.build());
    }

    // End segment: final norm + logits on the last stage.
    if is_last_stage {
        let mut end = SegmentBuilder::new();
        end.add_op(
            OpCode::MergeAdd,
            "final_merge_add",
            0,
            PointerConfig::batch(PointerSource::Pipe, net.zq_pipe),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            Size3D::none(),
            OpParams::None,
        );
        end.add_op(
            OpCode::InvRms,
            "final_norm_pre",
            0,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
            Size3D::none(),
            OpParams::InvRms { epsilon: h.norm_epsilon, n_columns: 1 },
        );
        end.add_op(
            OpCode::RmsNorm,
            "final_norm",
            0,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            net.rms_norm_size,
            OpParams::RmsNorm { inv_rms_buffer: inv_rms_buf, n_columns: 1 },
        );
        if y_buf != yq_buf {
            end.add_op(
                OpCode::Cast,
                "final_cast_y",
                0,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                Size3D::none(),
                OpParams::None,
            );
        }
        end.add_op(
            OpCode::Matmul,
            "final_matmul_logits",
            0,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, logits_slice_buf),
            wcls_slice.slice_size,
            dense_matmul,
        );
        end.add_op(
            OpCode::Cast,
            "final_cast_logits",
            0,
            PointerConfig::batch(PointerSource::Buffer, logits_slice_buf),
            PointerConfig::batched_slice(PointerSource::Pipe, net.logits_pipe),
            Size3D::none(),
            OpParams::None,
        );
        end.add_sync(net.logits_pipe, SyncType::NodeSlicesExceptRoot);
        b.add_segment(end.build());
    }

    // Root-wait segment: global node 0 blocks for the gathered logits when it
    // is not on the last stage.
    if node_index == 0 && !is_last_stage {
        let mut wait = SegmentBuilder::new();
        wait.add_sync(net.logits_pipe, SyncType::NodeSlicesExceptRoot);
        b.add_segment(wait.build());
    }

    Ok(b.build())
}
