//! Wire protocol
//!
//! Fixed-layout binary packets and the config streaming codec. All
//! multi-byte fields are host-endian: the protocol assumes homogeneous
//! endianness across peers (a documented limitation of the cluster format).

use std::sync::Arc;

use crate::error::{RepartirError, Result};
use crate::graph::{
    BufferConfig, NetConfig, NodeConfig, OpCode, OpConfig, OpParams, PipeConfig, PipeSlicing,
    PointerConfig, PointerSource, PointerType, SegmentConfig, SyncConfig, SyncType,
};
use crate::net::{Network, ROOT_SOCKET_INDEX};
use crate::plan::PartitionPlan;
use crate::slice::{RopeSlice, RopeType};
use crate::tensor::{FloatType, Size3D};

/// Bootstrap packet magic (`DLBM` little-endian)
pub const BOOTSTRAP_MAGIC: u32 = 0x4d42_4c44;
/// Bootstrap protocol version
pub const BOOTSTRAP_VERSION: u32 = 2;
/// Bootstrap flag: a model path blob follows the packet
pub const BOOTSTRAP_HAS_MODEL_PATH: u32 = 1 << 0;
/// Bootstrap flag: a ratios blob follows the packet
pub const BOOTSTRAP_HAS_RATIOS: u32 = 1 << 1;

/// Control packet flag: workers must reply with a perf packet
pub const CTRL_PROFILE: u32 = 1 << 0;

/// The 12-byte per-forward control packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlPacket {
    /// Position of the first batch row (ignored when stopping)
    pub position: u32,
    /// Rows in this forward; 0 is the stop sentinel
    pub batch_size: u32,
    /// Control flags
    pub flags: u32,
}

impl ControlPacket {
    /// Serialized size
    pub const BYTES: usize = 12;

    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        out[0..4].copy_from_slice(&self.position.to_ne_bytes());
        out[4..8].copy_from_slice(&self.batch_size.to_ne_bytes());
        out[8..12].copy_from_slice(&self.flags.to_ne_bytes());
        out
    }

    /// Decode from wire bytes
    pub fn decode(bytes: &[u8; Self::BYTES]) -> Self {
        ControlPacket {
            position: u32::from_ne_bytes(bytes[0..4].try_into().expect("u32")),
            batch_size: u32::from_ne_bytes(bytes[4..8].try_into().expect("u32")),
            flags: u32::from_ne_bytes(bytes[8..12].try_into().expect("u32")),
        }
    }

    /// True when this packet tells the worker to stop
    pub fn is_stop(&self) -> bool {
        self.batch_size == 0
    }
}

/// Per-forward timing report from a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfPacket {
    /// Position of the measured forward
    pub position: u32,
    /// Batch size of the measured forward
    pub batch_size: u32,
    /// Reporting node
    pub node_index: u32,
    /// Reporting node's stage
    pub stage_index: u32,
    /// Microseconds in operator kernels
    pub exec_us: u32,
    /// Microseconds in collectives
    pub sync_us: u32,
}

impl PerfPacket {
    /// Serialized size
    pub const BYTES: usize = 24;

    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        for (i, v) in [
            self.position,
            self.batch_size,
            self.node_index,
            self.stage_index,
            self.exec_us,
            self.sync_us,
        ]
        .iter()
        .enumerate()
        {
            out[i * 4..(i + 1) * 4].copy_from_slice(&v.to_ne_bytes());
        }
        out
    }

    /// Decode from wire bytes
    pub fn decode(bytes: &[u8; Self::BYTES]) -> Self {
        let f = |i: usize| u32::from_ne_bytes(bytes[i * 4..(i + 1) * 4].try_into().expect("u32"));
        PerfPacket {
            position: f(0),
            batch_size: f(1),
            node_index: f(2),
            stage_index: f(3),
            exec_us: f(4),
            sync_us: f(5),
        }
    }
}

/// Bootstrap settings sent root to worker right after the mesh forms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPacket {
    /// Whether per-forward profiling is on cluster-wide
    pub benchmark_enabled: bool,
    /// Sequence length cap forwarded from the root's CLI
    pub max_seq_len: u32,
    /// Inter-node exchange format
    pub sync_type: FloatType,
    /// Model file path (workers load weights locally when present)
    pub model_path: Option<String>,
    /// Ratios string (workers rebuild the plan from it when present)
    pub ratios: Option<String>,
}

impl BootstrapPacket {
    /// Send the packet and its blobs over one socket
    pub fn write(&self, network: &Network, socket_index: usize) -> Result<()> {
        let mut flags = 0u32;
        let model_path_len = self.model_path.as_ref().map_or(0, |p| p.len() as u32 + 1);
        let ratios_len = self.ratios.as_ref().map_or(0, |r| r.len() as u32 + 1);
        if model_path_len > 0 {
            flags |= BOOTSTRAP_HAS_MODEL_PATH;
        }
        if ratios_len > 0 {
            flags |= BOOTSTRAP_HAS_RATIOS;
        }

        let mut fixed = [0u8; 32];
        for (i, v) in [
            BOOTSTRAP_MAGIC,
            BOOTSTRAP_VERSION,
            flags,
            u32::from(self.benchmark_enabled),
            self.max_seq_len,
            self.sync_type as u32,
            model_path_len,
            ratios_len,
        ]
        .iter()
        .enumerate()
        {
            fixed[i * 4..(i + 1) * 4].copy_from_slice(&v.to_ne_bytes());
        }
        network.write(socket_index, &fixed)?;
        if let Some(path) = &self.model_path {
            network.write(socket_index, path.as_bytes())?;
            network.write(socket_index, &[0u8])?;
        }
        if let Some(ratios) = &self.ratios {
            network.write(socket_index, ratios.as_bytes())?;
            network.write(socket_index, &[0u8])?;
        }
        Ok(())
    }

    /// Receive the packet from the root, rejecting version/magic mismatches
    pub fn read(network: &Network) -> Result<BootstrapPacket> {
        let mut fixed = [0u8; 32];
        network.read(ROOT_SOCKET_INDEX, &mut fixed)?;
        let f = |i: usize| u32::from_ne_bytes(fixed[i * 4..(i + 1) * 4].try_into().expect("u32"));
        if f(0) != BOOTSTRAP_MAGIC {
            return Err(RepartirError::Handshake(
                "Invalid bootstrap magic (root/worker binary mismatch)".to_string(),
            ));
        }
        if f(1) != BOOTSTRAP_VERSION {
            return Err(RepartirError::Handshake(
                "Unsupported bootstrap version (root/worker binary mismatch)".to_string(),
            ));
        }
        let flags = f(2);
        let model_path_len = f(6) as usize;
        let ratios_len = f(7) as usize;

        let read_blob = |len: usize| -> Result<String> {
            let mut blob = vec![0u8; len];
            network.read(ROOT_SOCKET_INDEX, &mut blob)?;
            while blob.last() == Some(&0) {
                blob.pop();
            }
            String::from_utf8(blob)
                .map_err(|_| RepartirError::Handshake("Bad bootstrap string".to_string()))
        };
        let model_path = if flags & BOOTSTRAP_HAS_MODEL_PATH != 0 {
            Some(read_blob(model_path_len)?)
        } else {
            None
        };
        let ratios = if flags & BOOTSTRAP_HAS_RATIOS != 0 {
            Some(read_blob(ratios_len)?)
        } else {
            None
        };

        Ok(BootstrapPacket {
            benchmark_enabled: f(3) != 0,
            max_seq_len: f(4),
            sync_type: FloatType::from_code(f(5))?,
            model_path,
            ratios,
        })
    }
}

// ---------------------------------------------------------------------------
// Config streaming
// ---------------------------------------------------------------------------

fn write_u32(network: &Network, socket: usize, value: u32) -> Result<()> {
    network.write(socket, &value.to_ne_bytes())
}

fn read_u32(network: &Network, socket: usize) -> Result<u32> {
    let mut buf = [0u8; 4];
    network.read(socket, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn write_f32(network: &Network, socket: usize, value: f32) -> Result<()> {
    network.write(socket, &value.to_ne_bytes())
}

fn read_f32(network: &Network, socket: usize) -> Result<f32> {
    let mut buf = [0u8; 4];
    network.read(socket, &mut buf)?;
    Ok(f32::from_ne_bytes(buf))
}

fn write_string(network: &Network, socket: usize, s: &str) -> Result<()> {
    write_u32(network, socket, s.len() as u32 + 1)?;
    network.write(socket, s.as_bytes())?;
    network.write(socket, &[0u8])
}

fn read_string(network: &Network, socket: usize) -> Result<String> {
    let len = read_u32(network, socket)? as usize;
    let mut bytes = vec![0u8; len];
    network.read(socket, &mut bytes)?;
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|_| RepartirError::Handshake("Bad string".to_string()))
}

fn write_size(network: &Network, socket: usize, size: &Size3D) -> Result<()> {
    write_u32(network, socket, size.float_type as u32)?;
    write_u32(network, socket, size.z)?;
    write_u32(network, socket, size.y)?;
    write_u32(network, socket, size.x)
}

fn read_size(network: &Network, socket: usize) -> Result<Size3D> {
    let float_type = FloatType::from_code(read_u32(network, socket)?)?;
    let z = read_u32(network, socket)?;
    let y = read_u32(network, socket)?;
    let x = read_u32(network, socket)?;
    if float_type == FloatType::Unk {
        return Ok(Size3D::none());
    }
    Ok(Size3D::d3(float_type, z, y, x))
}

fn write_pointer(network: &Network, socket: usize, p: &PointerConfig) -> Result<()> {
    write_u32(network, socket, p.source as u32)?;
    write_u32(network, socket, p.index)?;
    write_u32(network, socket, p.ptr_type as u32)
}

fn read_pointer(network: &Network, socket: usize) -> Result<PointerConfig> {
    let source = match read_u32(network, socket)? {
        0 => PointerSource::Pipe,
        1 => PointerSource::Buffer,
        other => {
            return Err(RepartirError::Handshake(format!(
                "Unknown pointer source: {other}"
            )))
        }
    };
    let index = read_u32(network, socket)?;
    let ptr_type = match read_u32(network, socket)? {
        0 => PointerType::Raw,
        1 => PointerType::Batch,
        2 => PointerType::BatchedSlice,
        other => {
            return Err(RepartirError::Handshake(format!(
                "Unknown pointer type: {other}"
            )))
        }
    };
    Ok(PointerConfig { source, index, ptr_type })
}

fn write_rope_slice(network: &Network, socket: usize, s: &RopeSlice) -> Result<()> {
    for v in [
        s.q_dim_start,
        s.q_dim_len,
        s.q_shift,
        s.kv_dim,
        s.kv_dim_start,
        s.kv_dim_len,
        s.slice_dim,
        s.seq_len,
        s.head_dim,
        s.n_kv_heads,
    ] {
        write_u32(network, socket, v)?;
    }
    write_f32(network, socket, s.rope_theta)?;
    write_size(network, socket, &s.cache_size)
}

fn read_rope_slice(network: &Network, socket: usize) -> Result<RopeSlice> {
    let mut vals = [0u32; 10];
    for v in &mut vals {
        *v = read_u32(network, socket)?;
    }
    let rope_theta = read_f32(network, socket)?;
    let cache_size = read_size(network, socket)?;
    Ok(RopeSlice {
        q_dim_start: vals[0],
        q_dim_len: vals[1],
        q_shift: vals[2],
        kv_dim: vals[3],
        kv_dim_start: vals[4],
        kv_dim_len: vals[5],
        slice_dim: vals[6],
        seq_len: vals[7],
        head_dim: vals[8],
        n_kv_heads: vals[9],
        rope_theta,
        cache_size,
    })
}

fn write_op_params(network: &Network, socket: usize, params: &OpParams) -> Result<()> {
    match params {
        OpParams::None => write_u32(network, socket, 0),
        OpParams::InvRms { epsilon, n_columns } => {
            write_u32(network, socket, 1)?;
            write_f32(network, socket, *epsilon)?;
            write_u32(network, socket, *n_columns)
        }
        OpParams::RmsNorm { inv_rms_buffer, n_columns } => {
            write_u32(network, socket, 2)?;
            write_u32(network, socket, *inv_rms_buffer)?;
            write_u32(network, socket, *n_columns)
        }
        OpParams::Matmul { n_experts, n_active_experts, indexes_buffer } => {
            write_u32(network, socket, 3)?;
            write_u32(network, socket, *n_experts)?;
            write_u32(network, socket, *n_active_experts)?;
            write_u32(network, socket, *indexes_buffer)
        }
        OpParams::Rope {
            rope_type,
            is_q,
            position_pipe,
            cache_buffer,
            scaling_factor,
            scaling_low_freq,
            scaling_high_freq,
            scaling_orig_max_seq_len,
            slice,
        } => {
            write_u32(network, socket, 4)?;
            write_u32(network, socket, *rope_type as u32)?;
            write_u32(network, socket, *is_q)?;
            write_u32(network, socket, *position_pipe)?;
            write_u32(network, socket, *cache_buffer)?;
            write_f32(network, socket, *scaling_factor)?;
            write_f32(network, socket, *scaling_low_freq)?;
            write_f32(network, socket, *scaling_high_freq)?;
            write_u32(network, socket, *scaling_orig_max_seq_len)?;
            write_rope_slice(network, socket, slice)
        }
        OpParams::MultiheadAtt {
            n_heads,
            n_heads0,
            n_kv_heads,
            head_dim,
            seq_len,
            q_dim0,
            kv_dim0,
            position_pipe,
            query_buffer,
            key_cache_buffer,
            value_cache_buffer,
            att_buffer,
        } => {
            write_u32(network, socket, 5)?;
            for v in [
                n_heads,
                n_heads0,
                n_kv_heads,
                head_dim,
                seq_len,
                q_dim0,
                kv_dim0,
                position_pipe,
                query_buffer,
                key_cache_buffer,
                value_cache_buffer,
                att_buffer,
            ] {
                write_u32(network, socket, *v)?;
            }
            Ok(())
        }
        OpParams::Mul { multiplier_buffer } => {
            write_u32(network, socket, 6)?;
            write_u32(network, socket, *multiplier_buffer)
        }
        OpParams::Scale { scale_buffer } => {
            write_u32(network, socket, 7)?;
            write_u32(network, socket, *scale_buffer)
        }
        OpParams::Shift { position_pipe } => {
            write_u32(network, socket, 8)?;
            write_u32(network, socket, *position_pipe)
        }
        OpParams::MoeGate { k, norm_topk, indexes_buffer } => {
            write_u32(network, socket, 9)?;
            write_u32(network, socket, *k)?;
            write_u32(network, socket, *norm_topk)?;
            write_u32(network, socket, *indexes_buffer)
        }
    }
}

fn read_op_params(network: &Network, socket: usize) -> Result<OpParams> {
    let tag = read_u32(network, socket)?;
    match tag {
        0 => Ok(OpParams::None),
        1 => Ok(OpParams::InvRms {
            epsilon: read_f32(network, socket)?,
            n_columns: read_u32(network, socket)?,
        }),
        2 => Ok(OpParams::RmsNorm {
            inv_rms_buffer: read_u32(network, socket)?,
            n_columns: read_u32(network, socket)?,
        }),
        3 => Ok(OpParams::Matmul {
            n_experts: read_u32(network, socket)?,
            n_active_experts: read_u32(network, socket)?,
            indexes_buffer: read_u32(network, socket)?,
        }),
        4 => Ok(OpParams::Rope {
            rope_type: RopeType::from_code(read_u32(network, socket)?)?,
            is_q: read_u32(network, socket)?,
            position_pipe: read_u32(network, socket)?,
            cache_buffer: read_u32(network, socket)?,
            scaling_factor: read_f32(network, socket)?,
            scaling_low_freq: read_f32(network, socket)?,
            scaling_high_freq: read_f32(network, socket)?,
            scaling_orig_max_seq_len: read_u32(network, socket)?,
            slice: read_rope_slice(network, socket)?,
        }),
        5 => {
            let mut vals = [0u32; 12];
            for v in &mut vals {
                *v = read_u32(network, socket)?;
            }
            Ok(OpParams::MultiheadAtt {
                n_heads: vals[0],
                n_heads0: vals[1],
                n_kv_heads: vals[2],
                head_dim: vals[3],
                seq_len: vals[4],
                q_dim0: vals[5],
                kv_dim0: vals[6],
                position_pipe: vals[7],
                query_buffer: vals[8],
                key_cache_buffer: vals[9],
                value_cache_buffer: vals[10],
                att_buffer: vals[11],
            })
        }
        6 => Ok(OpParams::Mul { multiplier_buffer: read_u32(network, socket)? }),
        7 => Ok(OpParams::Scale { scale_buffer: read_u32(network, socket)? }),
        8 => Ok(OpParams::Shift { position_pipe: read_u32(network, socket)? }),
        9 => Ok(OpParams::MoeGate {
            k: read_u32(network, socket)?,
            norm_topk: read_u32(network, socket)?,
            indexes_buffer: read_u32(network, socket)?,
        }),
        other => Err(RepartirError::Handshake(format!(
            "Unknown op params tag: {other}"
        ))),
    }
}

/// Stream a net config to one worker (ack-fenced)
pub fn write_net_config(network: &Network, socket: usize, config: &NetConfig) -> Result<()> {
    network.write_ack(socket)?;
    write_u32(network, socket, config.n_batches)?;
    write_u32(network, socket, config.n_nodes)?;
    write_u32(network, socket, config.pipes.len() as u32)?;
    for pipe in &config.pipes {
        write_size(network, socket, &pipe.size)?;
        write_u32(network, socket, pipe.slicing as u32)?;
        write_string(network, socket, &pipe.name)?;
    }
    write_u32(network, socket, config.pre_syncs.len() as u32)?;
    for &pre_sync in &config.pre_syncs {
        write_u32(network, socket, pre_sync)?;
    }
    network.read_ack(socket)
}

/// Read the net config from the root (ack-fenced)
pub fn read_net_config(network: &Network) -> Result<NetConfig> {
    let socket = ROOT_SOCKET_INDEX;
    network.read_ack(socket)?;
    let n_batches = read_u32(network, socket)?;
    let n_nodes = read_u32(network, socket)?;
    let n_pipes = read_u32(network, socket)?;
    let mut pipes = Vec::with_capacity(n_pipes as usize);
    for _ in 0..n_pipes {
        let size = read_size(network, socket)?;
        let slicing = PipeSlicing::from_code(read_u32(network, socket)?)?;
        let name = read_string(network, socket)?;
        pipes.push(PipeConfig { name, size, slicing });
    }
    let n_pre_syncs = read_u32(network, socket)?;
    let mut pre_syncs = Vec::with_capacity(n_pre_syncs as usize);
    for _ in 0..n_pre_syncs {
        pre_syncs.push(read_u32(network, socket)?);
    }
    network.write_ack(socket)?;
    Ok(NetConfig { n_batches, n_nodes, pipes, pre_syncs })
}

/// Stream a node config to one worker (ack-fenced)
pub fn write_node_config(network: &Network, socket: usize, config: &NodeConfig) -> Result<()> {
    network.write_ack(socket)?;
    write_u32(network, socket, config.node_index)?;
    write_u32(network, socket, config.buffers.len() as u32)?;
    write_u32(network, socket, config.segments.len() as u32)?;

    for buffer in &config.buffers {
        write_size(network, socket, &buffer.size)?;
        write_string(network, socket, &buffer.name)?;
    }
    for segment in &config.segments {
        write_u32(network, socket, segment.syncs.len() as u32)?;
        write_u32(network, socket, segment.ops.len() as u32)?;
        for sync in &segment.syncs {
            write_u32(network, socket, sync.pipe_index)?;
            write_u32(network, socket, sync.sync_type as u32)?;
        }
        for op in &segment.ops {
            write_u32(network, socket, op.code as u32)?;
            write_u32(network, socket, op.index)?;
            write_size(network, socket, &op.weight_size)?;
            write_string(network, socket, &op.name)?;
            write_pointer(network, socket, &op.input)?;
            write_pointer(network, socket, &op.output)?;
            write_op_params(network, socket, &op.params)?;
        }
    }
    network.read_ack(socket)
}

/// Read this worker's node config from the root (ack-fenced). The plan is
/// supplied by the worker, rebuilt from the bootstrap ratios.
pub fn read_node_config(network: &Network, plan: Arc<PartitionPlan>) -> Result<NodeConfig> {
    let socket = ROOT_SOCKET_INDEX;
    network.read_ack(socket)?;
    let node_index = read_u32(network, socket)?;
    let n_buffers = read_u32(network, socket)?;
    let n_segments = read_u32(network, socket)?;

    let mut buffers = Vec::with_capacity(n_buffers as usize);
    for _ in 0..n_buffers {
        let size = read_size(network, socket)?;
        let name = read_string(network, socket)?;
        buffers.push(BufferConfig { name, size });
    }

    let mut segments = Vec::with_capacity(n_segments as usize);
    for _ in 0..n_segments {
        let n_syncs = read_u32(network, socket)?;
        let n_ops = read_u32(network, socket)?;
        let mut syncs = Vec::with_capacity(n_syncs as usize);
        for _ in 0..n_syncs {
            let pipe_index = read_u32(network, socket)?;
            let sync_type = SyncType::from_code(read_u32(network, socket)?)?;
            syncs.push(SyncConfig { pipe_index, sync_type });
        }
        let mut ops = Vec::with_capacity(n_ops as usize);
        for _ in 0..n_ops {
            let code = OpCode::from_code(read_u32(network, socket)?)?;
            let index = read_u32(network, socket)?;
            let weight_size = read_size(network, socket)?;
            let name = read_string(network, socket)?;
            let input = read_pointer(network, socket)?;
            let output = read_pointer(network, socket)?;
            let params = read_op_params(network, socket)?;
            ops.push(OpConfig { code, name, index, input, output, weight_size, params });
        }
        segments.push(SegmentConfig { ops, syncs });
    }
    network.write_ack(socket)?;
    Ok(NodeConfig { node_index, buffers, segments, plan })
}

// ---------------------------------------------------------------------------
// Legacy weight distribution records
// ---------------------------------------------------------------------------

/// Stream one weight record to a worker:
/// `{nameLen, name, opIndex, offset, nBytes, payload}`
pub fn write_weight_record(
    network: &Network,
    socket: usize,
    op_name: &str,
    op_index: u32,
    offset: u64,
    payload: &[u8],
) -> Result<()> {
    write_u32(network, socket, op_name.len() as u32 + 1)?;
    network.write(socket, op_name.as_bytes())?;
    network.write(socket, &[0u8])?;
    write_u32(network, socket, op_index)?;
    network.write(socket, &offset.to_ne_bytes())?;
    network.write(socket, &(payload.len() as u64).to_ne_bytes())?;
    network.write(socket, payload)
}

/// Terminate a worker's weight stream (empty name, then wait for its ack)
pub fn finish_weight_stream(network: &Network, socket: usize) -> Result<()> {
    write_u32(network, socket, 0)?;
    network.read_ack(socket)
}

/// One parsed weight record, or `None` at the stream terminator
pub struct WeightRecord {
    /// Target op name
    pub op_name: String,
    /// Target op index
    pub op_index: u32,
    /// Destination offset inside the op's weight slot
    pub offset: u64,
    /// Weight bytes
    pub payload: Vec<u8>,
}

/// Read the next weight record from the root; acks and returns `None` at the
/// terminator.
pub fn read_weight_record(network: &Network) -> Result<Option<WeightRecord>> {
    let socket = ROOT_SOCKET_INDEX;
    let name_len = read_u32(network, socket)? as usize;
    if name_len == 0 {
        network.write_ack(socket)?;
        return Ok(None);
    }
    let mut name = vec![0u8; name_len];
    network.read(socket, &mut name)?;
    while name.last() == Some(&0) {
        name.pop();
    }
    let op_name = String::from_utf8(name)
        .map_err(|_| RepartirError::Handshake("Bad op name".to_string()))?;
    let op_index = read_u32(network, socket)?;
    let mut u64_buf = [0u8; 8];
    network.read(socket, &mut u64_buf)?;
    let offset = u64::from_ne_bytes(u64_buf);
    network.read(socket, &mut u64_buf)?;
    let n_bytes = u64::from_ne_bytes(u64_buf) as usize;
    let mut payload = vec![0u8; n_bytes];
    network.read(socket, &mut payload)?;
    Ok(Some(WeightRecord { op_name, op_index, offset, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_packet_roundtrip() {
        let packet = ControlPacket { position: 42, batch_size: 8, flags: CTRL_PROFILE };
        let decoded = ControlPacket::decode(&packet.encode());
        assert_eq!(decoded, packet);
        assert!(!decoded.is_stop());
    }

    #[test]
    fn test_stop_sentinel() {
        let stop = ControlPacket { position: 0, batch_size: 0, flags: 0 };
        assert!(ControlPacket::decode(&stop.encode()).is_stop());
    }

    #[test]
    fn test_perf_packet_roundtrip() {
        let packet = PerfPacket {
            position: 7,
            batch_size: 2,
            node_index: 3,
            stage_index: 1,
            exec_us: 1234,
            sync_us: 567,
        };
        assert_eq!(PerfPacket::decode(&packet.encode()), packet);
    }

    fn network_pair() -> (Network, Network) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = std::net::TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (
            Network::from_streams(vec![a], 0),
            Network::from_streams(vec![b], 1),
        )
    }

    #[test]
    fn test_bootstrap_packet_roundtrip() {
        let (root, worker) = network_pair();
        let packet = BootstrapPacket {
            benchmark_enabled: true,
            max_seq_len: 2048,
            sync_type: FloatType::Q80,
            model_path: Some("/models/llama.bin".to_string()),
            ratios: Some("1:1@10*2:3@14".to_string()),
        };
        let sent = packet.clone();
        let writer = std::thread::spawn(move || {
            sent.write(&root, 0).unwrap();
        });
        let received = BootstrapPacket::read(&worker).unwrap();
        writer.join().unwrap();
        assert_eq!(received, packet);
    }

    #[test]
    fn test_bootstrap_rejects_bad_magic() {
        let (root, worker) = network_pair();
        let writer = std::thread::spawn(move || {
            let mut garbage = [0u8; 32];
            garbage[0] = 0x12;
            root.write(0, &garbage).unwrap();
        });
        assert!(BootstrapPacket::read(&worker).is_err());
        writer.join().unwrap();
    }

    #[test]
    fn test_config_streaming_roundtrip() {
        use crate::model::{build_llm_net, ArchType, HiddenAct, LlmHeader};
        use crate::plan::uniform_plan;
        use crate::slice::RopeType;
        use std::sync::Arc;

        let header = LlmHeader {
            header_bytes: 256,
            version: 1,
            arch_type: ArchType::Llama,
            dim: 64,
            hidden_dim: 128,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            n_experts: 0,
            n_active_experts: 0,
            vocab_size: 100,
            seq_len: 32,
            orig_seq_len: 32,
            hidden_act: HiddenAct::Silu,
            rope_theta: 10000.0,
            weight_type: FloatType::F32,
            rope_scaling_factor: 1.0,
            rope_scaling_low_freq_factor: 1.0,
            rope_scaling_high_freq_factor: 1.0,
            rope_scaling_orig_max_seq_len: 0,
            rope_type: RopeType::Llama,
            head_dim: 16,
            norm_epsilon: 1e-5,
            moe_hidden_dim: 0,
            q_dim: 64,
            kv_dim: 32,
            sync_type: FloatType::F32,
            file_size: 0,
        };
        let plan = Arc::new(uniform_plan(2, 2, 4, 2, 100, 128, 64).unwrap());
        let net = build_llm_net(&header, 2, 4, Arc::clone(&plan)).unwrap();

        let (root, worker) = network_pair();
        let net_config = net.net_config.clone();
        let node_config = net.node_configs[1].clone();
        let writer = std::thread::spawn(move || {
            write_net_config(&root, 0, &net_config).unwrap();
            write_node_config(&root, 0, &node_config).unwrap();
        });

        let got_net = read_net_config(&worker).unwrap();
        let got_node = read_node_config(&worker, plan).unwrap();
        writer.join().unwrap();

        assert_eq!(got_net.n_batches, net.net_config.n_batches);
        assert_eq!(got_net.n_nodes, 2);
        assert_eq!(got_net.pipes.len(), net.net_config.pipes.len());
        for (sent, got) in net.net_config.pipes.iter().zip(got_net.pipes.iter()) {
            assert_eq!(sent.name, got.name);
            assert_eq!(sent.size, got.size);
            assert_eq!(sent.slicing, got.slicing);
        }
        assert_eq!(got_net.pre_syncs, net.net_config.pre_syncs);

        let sent_node = &net.node_configs[1];
        assert_eq!(got_node.node_index, 1);
        assert_eq!(got_node.buffers.len(), sent_node.buffers.len());
        assert_eq!(got_node.segments.len(), sent_node.segments.len());
        for (sent, got) in sent_node.segments.iter().zip(got_node.segments.iter()) {
            assert_eq!(sent.ops.len(), got.ops.len());
            assert_eq!(sent.syncs.len(), got.syncs.len());
            for (a, b) in sent.ops.iter().zip(got.ops.iter()) {
                assert_eq!(a.code, b.code);
                assert_eq!(a.name, b.name);
                assert_eq!(a.index, b.index);
                assert_eq!(a.input, b.input);
                assert_eq!(a.output, b.output);
                assert_eq!(a.weight_size, b.weight_size);
                assert_eq!(a.params, b.params);
            }
            for (a, b) in sent.syncs.iter().zip(got.syncs.iter()) {
                assert_eq!(a.pipe_index, b.pipe_index);
                assert_eq!(a.sync_type, b.sync_type);
            }
        }
    }

    #[test]
    fn test_weight_record_stream() {
        let (root, worker) = network_pair();
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        let sent = payload.clone();
        let writer = std::thread::spawn(move || {
            write_weight_record(&root, 0, "block_matmul_q", 3, 64, &sent).unwrap();
            finish_weight_stream(&root, 0).unwrap();
        });

        let record = read_weight_record(&worker).unwrap().unwrap();
        assert_eq!(record.op_name, "block_matmul_q");
        assert_eq!(record.op_index, 3);
        assert_eq!(record.offset, 64);
        assert_eq!(record.payload, payload);
        assert!(read_weight_record(&worker).unwrap().is_none());
        writer.join().unwrap();
    }
}
