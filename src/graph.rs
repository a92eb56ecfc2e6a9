//! Dataflow graph configuration
//!
//! The compiled form of a model: net-level pipes and pre-syncs shared by all
//! nodes, plus a per-node list of buffers and segments. A segment is an
//! ordered list of operators followed by an ordered list of sync points; the
//! executor walks segments in order and the synchronizer runs between them.

use std::sync::Arc;

use crate::error::{RepartirError, Result};
use crate::plan::PartitionPlan;
use crate::slice::{RopeSlice, RopeType};
use crate::tensor::Size3D;

/// How per-node views of a pipe are derived.
///
/// The over-allocated exchange pipe uses fixed uniform slots; the logits pipe
/// is carved according to the owning stage's dimension split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PipeSlicing {
    /// Fixed `x / nNodes` slot per global node id
    Uniform = 0,
    /// Slot derived from the partition plan's split matching the x extent
    PlanMatched = 1,
}

impl PipeSlicing {
    /// Decode from a wire code
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(PipeSlicing::Uniform),
            1 => Ok(PipeSlicing::PlanMatched),
            _ => Err(RepartirError::Handshake(format!(
                "Unknown pipe slicing code: {code}"
            ))),
        }
    }
}

/// A shared inter-segment tensor slot
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Diagnostic name
    pub name: String,
    /// Shape (y = nBatches)
    pub size: Size3D,
    /// Per-node view derivation
    pub slicing: PipeSlicing,
}

/// A node-local tensor scratch slot
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Diagnostic name
    pub name: String,
    /// Shape
    pub size: Size3D,
}

/// Where a pointer config resolves from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PointerSource {
    /// A net-level pipe
    Pipe = 0,
    /// A node-local buffer
    Buffer = 1,
}

/// How a pointer config iterates its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PointerType {
    /// One pointer to the whole slot
    Raw = 0,
    /// One pointer per batch row
    Batch = 1,
    /// One pointer per batch row, shifted to this node's slice
    BatchedSlice = 2,
}

/// Tagged reference to a pipe or buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerConfig {
    /// Source kind
    pub source: PointerSource,
    /// Pipe or buffer index
    pub index: u32,
    /// Iteration mode
    pub ptr_type: PointerType,
}

impl PointerConfig {
    /// Batch-iterated pointer
    pub fn batch(source: PointerSource, index: u32) -> Self {
        PointerConfig { source, index, ptr_type: PointerType::Batch }
    }

    /// Batch-iterated pointer restricted to this node's slice
    pub fn batched_slice(source: PointerSource, index: u32) -> Self {
        PointerConfig { source, index, ptr_type: PointerType::BatchedSlice }
    }

    /// Raw whole-slot pointer
    pub fn raw(source: PointerSource, index: u32) -> Self {
        PointerConfig { source, index, ptr_type: PointerType::Raw }
    }

    /// Whether the resolved view is a single contiguous region
    pub fn has_continuous_memory(&self) -> bool {
        matches!(self.ptr_type, PointerType::Raw | PointerType::Batch)
    }
}

/// Operator codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpCode {
    /// Sum per-node slots of the input into the output
    MergeAdd = 0,
    /// Sum expert planes of the input into the output
    MergeSum = 1,
    /// Token id to embedding row lookup
    Embedding = 2,
    /// Inverse RMS over each row
    InvRms = 3,
    /// RMS normalization with a weight vector
    RmsNorm = 4,
    /// Matrix multiply against the op weight
    Matmul = 5,
    /// Rotary position embedding
    Rope = 6,
    /// Multi-head attention over the local KV cache
    MultiheadAtt = 7,
    /// GELU activation
    Gelu = 8,
    /// SiLU activation
    Silu = 9,
    /// Elementwise multiply by another buffer
    Mul = 10,
    /// Scale expert planes by gate scores
    Scale = 11,
    /// Format/location cast
    Cast = 12,
    /// Repeat a plane across the z axis
    RepeatZ = 13,
    /// Append rows into the KV cache at the current positions
    Shift = 14,
    /// Softmax over each row
    Softmax = 15,
    /// Top-k expert selection
    MoeGate = 16,
}

impl OpCode {
    /// Diagnostic name
    pub fn name(self) -> &'static str {
        match self {
            OpCode::MergeAdd => "MERGE_ADD",
            OpCode::MergeSum => "MERGE_SUM",
            OpCode::Embedding => "EMBEDDING",
            OpCode::InvRms => "INV_RMS",
            OpCode::RmsNorm => "RMS_NORM",
            OpCode::Matmul => "MATMUL",
            OpCode::Rope => "ROPE",
            OpCode::MultiheadAtt => "MULTIHEAD_ATT",
            OpCode::Gelu => "GELU",
            OpCode::Silu => "SILU",
            OpCode::Mul => "MUL",
            OpCode::Scale => "SCALE",
            OpCode::Cast => "CAST",
            OpCode::RepeatZ => "REPEAT_Z",
            OpCode::Shift => "SHIFT",
            OpCode::Softmax => "SOFTMAX",
            OpCode::MoeGate => "MOE_GATE",
        }
    }

    /// Decode from a wire code
    pub fn from_code(code: u32) -> Result<Self> {
        const TABLE: [OpCode; 17] = [
            OpCode::MergeAdd,
            OpCode::MergeSum,
            OpCode::Embedding,
            OpCode::InvRms,
            OpCode::RmsNorm,
            OpCode::Matmul,
            OpCode::Rope,
            OpCode::MultiheadAtt,
            OpCode::Gelu,
            OpCode::Silu,
            OpCode::Mul,
            OpCode::Scale,
            OpCode::Cast,
            OpCode::RepeatZ,
            OpCode::Shift,
            OpCode::Softmax,
            OpCode::MoeGate,
        ];
        TABLE
            .get(code as usize)
            .copied()
            .ok_or_else(|| RepartirError::Handshake(format!("Unknown op code: {code}")))
    }
}

/// Typed operator parameters (the wire codec tags and flattens these)
#[derive(Debug, Clone, PartialEq)]
pub enum OpParams {
    /// No parameters
    None,
    /// Inverse RMS: epsilon and per-row column group count
    InvRms {
        /// Normalization epsilon
        epsilon: f32,
        /// Column groups per row (for per-head norms)
        n_columns: u32,
    },
    /// RMS norm: source of the inverse factors and column group count
    RmsNorm {
        /// Buffer holding the inverse RMS factors
        inv_rms_buffer: u32,
        /// Column groups per row
        n_columns: u32,
    },
    /// Matmul: expert routing parameters (zeros for dense)
    Matmul {
        /// Total expert count (0 = dense)
        n_experts: u32,
        /// Active experts per token
        n_active_experts: u32,
        /// Buffer holding active expert indices
        indexes_buffer: u32,
    },
    /// RoPE: rotation family, role, pipes/buffers and scaling
    Rope {
        /// Rotation family
        rope_type: RopeType,
        /// 1 when rotating Q, 0 for K
        is_q: u32,
        /// Pipe holding the batch positions
        position_pipe: u32,
        /// Buffer holding the precomputed rotation cache
        cache_buffer: u32,
        /// LLaMA 3.1 scaling factor (1.0 = off)
        scaling_factor: f32,
        /// Low-frequency scaling factor
        scaling_low_freq: f32,
        /// High-frequency scaling factor
        scaling_high_freq: f32,
        /// Original max sequence length for scaling
        scaling_orig_max_seq_len: u32,
        /// This node's rotation band
        slice: RopeSlice,
    },
    /// Multi-head attention geometry and buffer wiring
    MultiheadAtt {
        /// Global head count
        n_heads: u32,
        /// Local head count
        n_heads0: u32,
        /// Global KV head count
        n_kv_heads: u32,
        /// Per-head dimension
        head_dim: u32,
        /// Sequence length
        seq_len: u32,
        /// Local Q extent in elements
        q_dim0: u32,
        /// Local KV extent in elements
        kv_dim0: u32,
        /// Pipe holding batch positions
        position_pipe: u32,
        /// Query buffer
        query_buffer: u32,
        /// Key cache buffer
        key_cache_buffer: u32,
        /// Value cache buffer
        value_cache_buffer: u32,
        /// Attention scratch buffer
        att_buffer: u32,
    },
    /// Elementwise multiply by this buffer
    Mul {
        /// Multiplier buffer
        multiplier_buffer: u32,
    },
    /// Scale expert planes by this buffer
    Scale {
        /// Per-plane scale buffer
        scale_buffer: u32,
    },
    /// KV cache append indexed by the positions pipe
    Shift {
        /// Pipe holding batch positions
        position_pipe: u32,
    },
    /// Top-k expert selection
    MoeGate {
        /// Experts to activate per token
        k: u32,
        /// 1 to renormalize the top-k scores
        norm_topk: u32,
        /// Buffer receiving active expert indices
        indexes_buffer: u32,
    },
}

/// One operator instance in a segment
#[derive(Debug, Clone)]
pub struct OpConfig {
    /// Operator code
    pub code: OpCode,
    /// Diagnostic name (weight loading keys off it)
    pub name: String,
    /// Disambiguating index (layer or expert)
    pub index: u32,
    /// Input reference
    pub input: PointerConfig,
    /// Output reference
    pub output: PointerConfig,
    /// Weight slot size (zero for weightless ops)
    pub weight_size: Size3D,
    /// Typed parameters
    pub params: OpParams,
}

/// Sync primitive selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncType {
    /// Group root broadcasts the whole pipe row
    WithRoot = 0,
    /// All-to-all exchange of per-node slices inside the group
    NodeSlices = 1,
    /// Workers gather their slices to the root; root does not send
    NodeSlicesExceptRoot = 2,
    /// Stage root sends the row to the next stage's root
    PpSend = 3,
    /// Stage root receives the row from the previous stage's root
    PpRecv = 4,
}

impl SyncType {
    /// Decode from a wire code
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(SyncType::WithRoot),
            1 => Ok(SyncType::NodeSlices),
            2 => Ok(SyncType::NodeSlicesExceptRoot),
            3 => Ok(SyncType::PpSend),
            4 => Ok(SyncType::PpRecv),
            _ => Err(RepartirError::Handshake(format!(
                "Unknown sync type code: {code}"
            ))),
        }
    }
}

/// One sync point at the end of a segment
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Pipe the primitive operates on
    pub pipe_index: u32,
    /// Primitive
    pub sync_type: SyncType,
}

/// Ordered ops followed by ordered syncs
#[derive(Debug, Clone, Default)]
pub struct SegmentConfig {
    /// Operators, executed in order by all threads
    pub ops: Vec<OpConfig>,
    /// Sync points, executed in order after the ops
    pub syncs: Vec<SyncConfig>,
}

/// Net-level configuration shared by every node
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Batch capacity of every pipe
    pub n_batches: u32,
    /// Total node count
    pub n_nodes: u32,
    /// Shared pipes
    pub pipes: Vec<PipeConfig>,
    /// Pipes replicated from root before every forward
    pub pre_syncs: Vec<u32>,
}

/// Per-node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Global node id
    pub node_index: u32,
    /// Node-local scratch buffers
    pub buffers: Vec<BufferConfig>,
    /// Execution segments in order
    pub segments: Vec<SegmentConfig>,
    /// Shared read-only partition plan
    pub plan: Arc<PartitionPlan>,
}

/// Builder for [`NetConfig`]
pub struct NetConfigBuilder {
    n_batches: u32,
    n_nodes: u32,
    pipes: Vec<PipeConfig>,
    pre_syncs: Vec<u32>,
}

impl NetConfigBuilder {
    /// Start a net config for `n_nodes` nodes and `n_batches` batch rows
    pub fn new(n_nodes: u32, n_batches: u32) -> Self {
        NetConfigBuilder {
            n_batches,
            n_nodes,
            pipes: Vec::new(),
            pre_syncs: Vec::new(),
        }
    }

    /// Register a pipe; returns its index
    pub fn add_pipe(&mut self, name: &str, size: Size3D, slicing: PipeSlicing) -> u32 {
        self.pipes.push(PipeConfig {
            name: name.to_string(),
            size,
            slicing,
        });
        (self.pipes.len() - 1) as u32
    }

    /// Mark a pipe as replicated before every forward
    pub fn add_pre_sync(&mut self, pipe_index: u32) {
        self.pre_syncs.push(pipe_index);
    }

    /// Finish the config
    pub fn build(self) -> NetConfig {
        NetConfig {
            n_batches: self.n_batches,
            n_nodes: self.n_nodes,
            pipes: self.pipes,
            pre_syncs: self.pre_syncs,
        }
    }
}

/// Builder for [`SegmentConfig`]
#[derive(Default)]
pub struct SegmentBuilder {
    ops: Vec<OpConfig>,
    syncs: Vec<SyncConfig>,
}

impl SegmentBuilder {
    /// Empty segment builder
    pub fn new() -> Self {
        SegmentBuilder::default()
    }

    /// Append an operator
    #[allow(clippy::too_many_arguments)]
    pub fn add_op(
        &mut self,
        code: OpCode,
        name: &str,
        index: u32,
        input: PointerConfig,
        output: PointerConfig,
        weight_size: Size3D,
        params: OpParams,
    ) {
        self.ops.push(OpConfig {
            code,
            name: name.to_string(),
            index,
            input,
            output,
            weight_size,
            params,
        });
    }

    /// Append a sync point
    pub fn add_sync(&mut self, pipe_index: u32, sync_type: SyncType) {
        self.syncs.push(SyncConfig { pipe_index, sync_type });
    }

    /// True when the segment has neither ops nor syncs
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.syncs.is_empty()
    }

    /// Finish the segment
    pub fn build(self) -> SegmentConfig {
        SegmentConfig {
            ops: self.ops,
            syncs: self.syncs,
        }
    }
}

/// Builder for [`NodeConfig`]
pub struct NodeConfigBuilder {
    node_index: u32,
    buffers: Vec<BufferConfig>,
    segments: Vec<SegmentConfig>,
    plan: Arc<PartitionPlan>,
}

impl NodeConfigBuilder {
    /// Start a node config bound to the shared plan
    pub fn new(node_index: u32, plan: Arc<PartitionPlan>) -> Self {
        NodeConfigBuilder {
            node_index,
            buffers: Vec::new(),
            segments: Vec::new(),
            plan,
        }
    }

    /// Register a buffer; returns its index
    pub fn add_buffer(&mut self, name: &str, size: Size3D) -> u32 {
        self.buffers.push(BufferConfig {
            name: name.to_string(),
            size,
        });
        (self.buffers.len() - 1) as u32
    }

    /// Append a segment
    pub fn add_segment(&mut self, segment: SegmentConfig) {
        self.segments.push(segment);
    }

    /// Finish the config
    pub fn build(self) -> NodeConfig {
        NodeConfig {
            node_index: self.node_index,
            buffers: self.buffers,
            segments: self.segments,
            plan: self.plan,
        }
    }
}

/// Total bytes a node needs for pipes, buffers, and op weights
pub fn node_required_bytes(net: &NetConfig, node: &NodeConfig) -> usize {
    let mut total: usize = net.pipes.iter().map(|p| p.size.n_bytes).sum();
    total += node.buffers.iter().map(|b| b.size.n_bytes).sum::<usize>();
    for segment in &node.segments {
        for op in &segment.ops {
            total += op.weight_size.n_bytes;
        }
    }
    total
}
