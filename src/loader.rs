//! Weight loading
//!
//! Every node memory-maps the model file and seeks past the header. In local
//! mode (whenever a ratios string is present) each node reads exactly the
//! bytes it owns: row-sliced tensors come straight out of the mmap as one
//! contiguous range, column-sliced tensors are gathered stripe by stripe
//! into a scratch buffer. In the legacy network mode the root splits every
//! tensor and streams each worker its slice.
//!
//! After each layer the local loader audits that the bytes it walked match
//! the precomputed per-layer total; a mismatch is the dominant integration
//! bug and fails immediately.

use std::fs::File;

use memmap2::Mmap;
use rayon::prelude::*;

use crate::error::{RepartirError, Result};
use crate::executor::Executor;
use crate::model::{ArchType, LlmNet};
use crate::net::Network;
use crate::plan::PartitionPlan;
use crate::proto::{finish_weight_stream, read_weight_record, write_weight_record};
use crate::slice::{
    slice_col_matmul, slice_row_matmul, ColMatmulSlice, DimSplit, RowMatmulSlice,
};
use crate::tensor::FloatType;

/// Byte size of one transformer layer in the weight file
pub fn layer_bytes(net: &LlmNet) -> usize {
    let h = &net.header;
    let wt = h.weight_type;
    let ffn_dim = h.ffn_dim();
    let mut bytes = 0usize;

    // Q, K, V, Wo
    bytes += wt.bytes(h.dim as usize * h.q_dim as usize);
    bytes += wt.bytes(h.dim as usize * h.kv_dim as usize) * 2;
    bytes += wt.bytes(h.q_dim as usize * h.dim as usize);

    // FFN / MoE
    if h.n_experts > 0 {
        bytes += net.moe_gate_size.n_bytes;
        bytes += h.n_experts as usize
            * (wt.bytes(h.dim as usize * ffn_dim as usize) * 2
                + wt.bytes(ffn_dim as usize * h.dim as usize));
    } else {
        bytes += wt.bytes(h.dim as usize * ffn_dim as usize) * 2;
        bytes += wt.bytes(ffn_dim as usize * h.dim as usize);
    }

    // Norms
    if matches!(h.arch_type, ArchType::Qwen3 | ArchType::Qwen3Moe) {
        bytes += net.qk_rms_norm_size.n_bytes * 2;
    }
    bytes += net.rms_norm_size.n_bytes * 2;
    bytes
}

/// Byte size of the final norm + classifier block
pub fn final_block_bytes(net: &LlmNet) -> usize {
    let h = &net.header;
    net.rms_norm_size.n_bytes + h.weight_type.bytes(h.dim as usize * h.vocab_size as usize)
}

fn check_aligned(what: &'static str, value: u32, block: u32) -> Result<()> {
    if value % block != 0 {
        return Err(RepartirError::MisalignedSlice { what, value, block_size: block });
    }
    Ok(())
}

/// Gather a column slice out of the full tensor bytes, one stripe per output
/// column, in parallel.
fn gather_col_slice(slice: &ColMatmulSlice, tensor: &[u8], out: &mut [u8]) -> Result<()> {
    let block = slice.float_type.block_size();
    check_aligned("col slice start", slice.out_start, block)?;
    check_aligned("col slice len", slice.out_len, block)?;
    check_aligned("col slice input dim", slice.n, block)?;

    let row_bytes = slice.float_type.bytes(slice.n as usize);
    let row0_bytes = slice.float_type.bytes(slice.out_len as usize);
    let offset_bytes = slice.float_type.bytes(slice.out_start as usize);

    out.par_chunks_mut(row0_bytes).enumerate().for_each(|(d, chunk)| {
        let src = d * row_bytes + offset_bytes;
        chunk.copy_from_slice(&tensor[src..src + row0_bytes]);
    });
    Ok(())
}

/// Cursor over the mmap'd weight region
struct WeightWalker<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> WeightWalker<'a> {
    fn new(data: &'a [u8], header_bytes: usize) -> Self {
        WeightWalker { data, cursor: header_bytes }
    }

    fn take(&mut self, n_bytes: usize) -> Result<&'a [u8]> {
        if self.cursor + n_bytes > self.data.len() {
            return Err(RepartirError::ModelFormat(format!(
                "Weight file truncated: need {} bytes at offset {}, file has {}",
                n_bytes,
                self.cursor,
                self.data.len()
            )));
        }
        let slice = &self.data[self.cursor..self.cursor + n_bytes];
        self.cursor += n_bytes;
        Ok(slice)
    }

    fn skip(&mut self, n_bytes: usize) {
        self.cursor += n_bytes;
    }
}

struct LocalLoader<'a> {
    executor: &'a Executor,
    scratch: Vec<u8>,
}

impl<'a> LocalLoader<'a> {
    /// Load the node's rows of a row-sliced tensor straight from the mmap.
    /// Advances the walker by the tensor's *global* size.
    fn load_row_slices(
        &mut self,
        walker: &mut WeightWalker<'_>,
        op_name: &str,
        op_index: u32,
        expert_index: u32,
        slice: &RowMatmulSlice,
    ) -> Result<()> {
        let tensor = walker.take(slice.size.n_bytes)?;
        if self.executor.has_op(op_name, op_index) {
            let block = slice.float_type.block_size();
            check_aligned("row slice input dim", slice.n, block)?;
            let row_bytes = slice.float_type.bytes(slice.n as usize);
            let offset = slice.in_start as usize * row_bytes;
            let len = slice.in_len as usize * row_bytes;
            let device_offset = expert_index as usize * slice.slice_size.n_bytes;
            self.executor
                .load_weight(op_name, op_index, device_offset, &tensor[offset..offset + len])?;
        }
        Ok(())
    }

    /// Gather and load the node's columns of a column-sliced tensor.
    fn load_col_slices(
        &mut self,
        walker: &mut WeightWalker<'_>,
        op_name: &str,
        op_index: u32,
        expert_index: u32,
        slice: &ColMatmulSlice,
    ) -> Result<()> {
        let tensor = walker.take(slice.size.n_bytes)?;
        if self.executor.has_op(op_name, op_index) {
            if self.scratch.len() < slice.slice_size.n_bytes {
                self.scratch.resize(slice.slice_size.n_bytes, 0);
            }
            gather_col_slice(slice, tensor, &mut self.scratch[..slice.slice_size.n_bytes])?;
            let device_offset = expert_index as usize * slice.slice_size.n_bytes;
            self.executor.load_weight(
                op_name,
                op_index,
                device_offset,
                &self.scratch[..slice.slice_size.n_bytes],
            )?;
        }
        Ok(())
    }

    /// Load a whole (unsliced) tensor.
    fn load_all(
        &mut self,
        walker: &mut WeightWalker<'_>,
        op_name: &str,
        op_index: u32,
        n_bytes: usize,
    ) -> Result<()> {
        let tensor = walker.take(n_bytes)?;
        if self.executor.has_op(op_name, op_index) {
            self.executor.load_weight(op_name, op_index, 0, tensor)?;
        }
        Ok(())
    }
}

/// Per-node slicer bundle for one layer's tensors
struct NodeSlices {
    q: RowMatmulSlice,
    k: RowMatmulSlice,
    v: RowMatmulSlice,
    wo: ColMatmulSlice,
    w1: RowMatmulSlice,
    w2: ColMatmulSlice,
    w3: RowMatmulSlice,
    wcls: RowMatmulSlice,
}

fn node_slices(net: &LlmNet, plan: &PartitionPlan, node: usize) -> NodeSlices {
    let h = &net.header;
    let wt = h.weight_type;
    let ffn_dim = h.ffn_dim();
    NodeSlices {
        q: slice_row_matmul(wt, h.dim, &plan.head_split, h.head_dim, h.q_dim, node),
        k: slice_row_matmul(wt, h.dim, &plan.kv_head_split, h.head_dim, h.kv_dim, node),
        v: slice_row_matmul(wt, h.dim, &plan.kv_head_split, h.head_dim, h.kv_dim, node),
        wo: slice_col_matmul(wt, h.q_dim, &plan.head_split, h.head_dim, h.dim, node),
        w1: slice_row_matmul(wt, h.dim, &plan.ffn_split, 1, ffn_dim, node),
        w2: slice_col_matmul(wt, ffn_dim, &plan.ffn_split, 1, h.dim, node),
        w3: slice_row_matmul(wt, h.dim, &plan.ffn_split, 1, ffn_dim, node),
        wcls: slice_row_matmul(wt, h.dim, &plan.vocab_split, 1, h.vocab_size, node),
    }
}

/// Load this node's weight slices directly from the model file.
pub fn load_weights_local(
    path: &str,
    net: &LlmNet,
    executor: &Executor,
    node_index: u32,
) -> Result<()> {
    let h = &net.header;
    let plan = &net.plan;
    let stage = plan.stage_for_node(node_index).ok_or_else(|| {
        RepartirError::Config(format!("Node {node_index} is not in the partition plan"))
    })?;
    let is_first_stage = stage.stage_index == 0;
    let is_last_stage = stage.stage_index == plan.n_stages() - 1;
    tracing::info!(
        node = node_index,
        start_layer = stage.start_layer,
        end_layer = stage.end_layer,
        "loading weight slices locally"
    );

    let file = File::open(path).map_err(|e| {
        RepartirError::ModelFormat(format!("Cannot open model file ({path}): {e}"))
    })?;
    // SAFETY: the model file is treated as immutable for the process
    // lifetime; concurrent external mutation is outside the threat model.
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| RepartirError::ModelFormat(format!("Cannot mmap model file: {e}")))?;

    let mut walker = WeightWalker::new(&mmap, h.header_bytes);
    let mut loader = LocalLoader { executor, scratch: Vec::new() };
    let slices = node_slices(net, plan, node_index as usize);
    let per_layer = layer_bytes(net);

    if is_first_stage {
        loader.load_all(&mut walker, "embedding", 0, net.token_embedding_size.n_bytes)?;
    } else {
        walker.skip(net.token_embedding_size.n_bytes);
    }

    for layer in 0..h.n_layers {
        let is_my_layer = layer >= stage.start_layer && layer < stage.end_layer;
        if !is_my_layer {
            walker.skip(per_layer);
            continue;
        }

        let layer_start = walker.cursor;
        loader.load_row_slices(&mut walker, "block_matmul_q", layer, 0, &slices.q)?;
        loader.load_row_slices(&mut walker, "block_matmul_k", layer, 0, &slices.k)?;
        loader.load_row_slices(&mut walker, "block_matmul_v", layer, 0, &slices.v)?;
        loader.load_col_slices(&mut walker, "block_matmul_wo", layer, 0, &slices.wo)?;

        if h.n_experts > 0 {
            loader.load_all(&mut walker, "block_moe_gate", layer, net.moe_gate_size.n_bytes)?;
            for expert in 0..h.n_experts {
                loader.load_row_slices(&mut walker, "block_matmul_w1", layer, expert, &slices.w1)?;
                loader.load_col_slices(&mut walker, "block_matmul_w2", layer, expert, &slices.w2)?;
                loader.load_row_slices(&mut walker, "block_matmul_w3", layer, expert, &slices.w3)?;
            }
        } else {
            loader.load_row_slices(&mut walker, "block_matmul_w1", layer, 0, &slices.w1)?;
            loader.load_col_slices(&mut walker, "block_matmul_w2", layer, 0, &slices.w2)?;
            loader.load_row_slices(&mut walker, "block_matmul_w3", layer, 0, &slices.w3)?;
        }

        if matches!(h.arch_type, ArchType::Qwen3 | ArchType::Qwen3Moe) {
            loader.load_all(&mut walker, "block_norm_q", layer, net.qk_rms_norm_size.n_bytes)?;
            loader.load_all(&mut walker, "block_norm_k", layer, net.qk_rms_norm_size.n_bytes)?;
        }
        loader.load_all(&mut walker, "block_norm_0", layer, net.rms_norm_size.n_bytes)?;
        loader.load_all(&mut walker, "block_norm_1", layer, net.rms_norm_size.n_bytes)?;

        let walked = walker.cursor - layer_start;
        if walked != per_layer {
            return Err(RepartirError::LayerSizeMismatch {
                layer,
                expected: per_layer,
                actual: walked,
            });
        }
    }

    let final_bytes = final_block_bytes(net);
    if is_last_stage {
        let final_start = walker.cursor;
        loader.load_all(&mut walker, "final_norm", 0, net.rms_norm_size.n_bytes)?;
        loader.load_row_slices(&mut walker, "final_matmul_logits", 0, 0, &slices.wcls)?;
        if walker.cursor - final_start != final_bytes {
            return Err(RepartirError::ModelFormat(
                "Final norm/classifier block size mismatch".to_string(),
            ));
        }
    } else {
        walker.skip(final_bytes);
    }

    if walker.cursor != h.file_size {
        return Err(RepartirError::ModelFormat(format!(
            "Weight file walk ended at {} of {} bytes",
            walker.cursor, h.file_size
        )));
    }
    tracing::info!(node = node_index, "weights loaded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Legacy network distribution (uniform ratios only)
// ---------------------------------------------------------------------------

struct RootDistributor<'a> {
    executor: &'a Executor,
    network: &'a Network,
    n_nodes: u32,
    scratch: Vec<u8>,
}

impl<'a> RootDistributor<'a> {
    fn scratch_for(&mut self, n_bytes: usize) -> &mut [u8] {
        if self.scratch.len() < n_bytes {
            self.scratch.resize(n_bytes, 0);
        }
        &mut self.scratch[..n_bytes]
    }

    fn send_or_load(
        &mut self,
        node: u32,
        op_name: &str,
        op_index: u32,
        offset: usize,
        payload: &[u8],
    ) -> Result<()> {
        if node == 0 {
            if self.executor.has_op(op_name, op_index) {
                self.executor.load_weight(op_name, op_index, offset, payload)?;
            }
            Ok(())
        } else {
            write_weight_record(
                self.network,
                (node - 1) as usize,
                op_name,
                op_index,
                offset as u64,
                payload,
            )
        }
    }

    fn distribute_row(
        &mut self,
        walker: &mut WeightWalker<'_>,
        op_name: &str,
        op_index: u32,
        expert_index: u32,
        float_type: FloatType,
        global_in: u32,
        split: &DimSplit,
        unit: u32,
        global_out: u32,
    ) -> Result<()> {
        let full = slice_row_matmul(float_type, global_in, split, unit, global_out, 0);
        let tensor = walker.take(full.size.n_bytes)?;
        let row_bytes = float_type.bytes(global_in as usize);
        for node in 0..self.n_nodes {
            let slice = slice_row_matmul(float_type, global_in, split, unit, global_out, node as usize);
            let offset = slice.in_start as usize * row_bytes;
            let len = slice.in_len as usize * row_bytes;
            let device_offset = expert_index as usize * slice.slice_size.n_bytes;
            // Row slices are contiguous in the tensor, so no scratch is
            // needed even on the network path.
            let payload = &tensor[offset..offset + len];
            self.send_or_load(node, op_name, op_index, device_offset, payload)?;
        }
        Ok(())
    }

    fn distribute_col(
        &mut self,
        walker: &mut WeightWalker<'_>,
        op_name: &str,
        op_index: u32,
        expert_index: u32,
        float_type: FloatType,
        global_in: u32,
        split: &DimSplit,
        unit: u32,
        global_out: u32,
    ) -> Result<()> {
        let full = slice_col_matmul(float_type, global_in, split, unit, global_out, 0);
        let tensor = walker.take(full.size.n_bytes)?;
        for node in 0..self.n_nodes {
            let slice = slice_col_matmul(float_type, global_in, split, unit, global_out, node as usize);
            let n_bytes = slice.slice_size.n_bytes;
            let device_offset = expert_index as usize * n_bytes;
            gather_col_slice(&slice, tensor, self.scratch_for(n_bytes))?;
            let payload = self.scratch[..n_bytes].to_vec();
            self.send_or_load(node, op_name, op_index, device_offset, &payload)?;
        }
        Ok(())
    }

    fn distribute_all(
        &mut self,
        walker: &mut WeightWalker<'_>,
        op_name: &str,
        op_index: u32,
        n_bytes: usize,
    ) -> Result<()> {
        let tensor = walker.take(n_bytes)?;
        let owned = tensor.to_vec();
        for node in 0..self.n_nodes {
            self.send_or_load(node, op_name, op_index, 0, &owned)?;
        }
        Ok(())
    }
}

/// Root side of the legacy path: read the whole file, split every tensor,
/// stream each worker its slices, and load the root's own.
pub fn distribute_weights_root(
    path: &str,
    net: &LlmNet,
    executor: &Executor,
    network: &Network,
) -> Result<()> {
    let h = &net.header;
    let plan = &net.plan;
    let n_nodes = plan.n_nodes;
    let wt = h.weight_type;
    let ffn_dim = h.ffn_dim();

    let file = File::open(path).map_err(|e| {
        RepartirError::ModelFormat(format!("Cannot open model file ({path}): {e}"))
    })?;
    // SAFETY: see load_weights_local.
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| RepartirError::ModelFormat(format!("Cannot mmap model file: {e}")))?;
    tracing::info!("distributing weights over the network");

    let mut walker = WeightWalker::new(&mmap, h.header_bytes);
    let mut dist = RootDistributor { executor, network, n_nodes, scratch: Vec::new() };

    // Embedding stays on the root.
    let embedding = walker.take(net.token_embedding_size.n_bytes)?;
    if executor.has_op("embedding", 0) {
        executor.load_weight("embedding", 0, 0, embedding)?;
    }

    for layer in 0..h.n_layers {
        dist.distribute_row(&mut walker, "block_matmul_q", layer, 0, wt, h.dim, &plan.head_split, h.head_dim, h.q_dim)?;
        dist.distribute_row(&mut walker, "block_matmul_k", layer, 0, wt, h.dim, &plan.kv_head_split, h.head_dim, h.kv_dim)?;
        dist.distribute_row(&mut walker, "block_matmul_v", layer, 0, wt, h.dim, &plan.kv_head_split, h.head_dim, h.kv_dim)?;
        dist.distribute_col(&mut walker, "block_matmul_wo", layer, 0, wt, h.q_dim, &plan.head_split, h.head_dim, h.dim)?;

        if h.n_experts > 0 {
            dist.distribute_all(&mut walker, "block_moe_gate", layer, net.moe_gate_size.n_bytes)?;
            for expert in 0..h.n_experts {
                dist.distribute_row(&mut walker, "block_matmul_w1", layer, expert, wt, h.dim, &plan.ffn_split, 1, ffn_dim)?;
                dist.distribute_col(&mut walker, "block_matmul_w2", layer, expert, wt, ffn_dim, &plan.ffn_split, 1, h.dim)?;
                dist.distribute_row(&mut walker, "block_matmul_w3", layer, expert, wt, h.dim, &plan.ffn_split, 1, ffn_dim)?;
            }
        } else {
            dist.distribute_row(&mut walker, "block_matmul_w1", layer, 0, wt, h.dim, &plan.ffn_split, 1, ffn_dim)?;
            dist.distribute_col(&mut walker, "block_matmul_w2", layer, 0, wt, ffn_dim, &plan.ffn_split, 1, h.dim)?;
            dist.distribute_row(&mut walker, "block_matmul_w3", layer, 0, wt, h.dim, &plan.ffn_split, 1, ffn_dim)?;
        }

        if matches!(h.arch_type, ArchType::Qwen3 | ArchType::Qwen3Moe) {
            dist.distribute_all(&mut walker, "block_norm_q", layer, net.qk_rms_norm_size.n_bytes)?;
            dist.distribute_all(&mut walker, "block_norm_k", layer, net.qk_rms_norm_size.n_bytes)?;
        }
        dist.distribute_all(&mut walker, "block_norm_0", layer, net.rms_norm_size.n_bytes)?;
        dist.distribute_all(&mut walker, "block_norm_1", layer, net.rms_norm_size.n_bytes)?;
    }

    dist.distribute_all(&mut walker, "final_norm", 0, net.rms_norm_size.n_bytes)?;
    dist.distribute_row(&mut walker, "final_matmul_logits", 0, 0, wt, h.dim, &plan.vocab_split, 1, h.vocab_size)?;

    if walker.cursor != h.file_size {
        return Err(RepartirError::ModelFormat(format!(
            "Weight file walk ended at {} of {} bytes",
            walker.cursor, h.file_size
        )));
    }

    for socket in 0..(n_nodes - 1) as usize {
        finish_weight_stream(network, socket)?;
    }
    tracing::info!("weights distributed");
    Ok(())
}

/// Worker side of the legacy path: mirror-read records until the terminator.
pub fn receive_weights_worker(executor: &Executor, network: &Network) -> Result<()> {
    tracing::info!("waiting for weights from the root");
    while let Some(record) = read_weight_record(network)? {
        tracing::debug!(
            op = %record.op_name,
            index = record.op_index,
            kb = record.payload.len() / 1024,
            "weight record"
        );
        executor.load_weight(
            &record.op_name,
            record.op_index,
            record.offset as usize,
            &record.payload,
        )?;
    }
    tracing::info!("weights loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::create_dim_split;

    #[test]
    fn test_gather_col_slice_matches_serial() {
        let split = create_dim_split(64, &[1.0, 1.0], 1).unwrap();
        let slice = slice_col_matmul(FloatType::F32, 64, &split, 1, 4, 1);
        let tensor: Vec<u8> = (0..slice.size.n_bytes).map(|i| (i % 251) as u8).collect();

        let mut parallel = vec![0u8; slice.slice_size.n_bytes];
        gather_col_slice(&slice, &tensor, &mut parallel).unwrap();

        let mut serial = vec![0u8; slice.slice_size.n_bytes];
        crate::slice::split_col_matmul_weight(&slice, &tensor, &mut serial).unwrap();
        assert_eq!(parallel, serial);
    }

    #[test]
    fn test_walker_detects_truncation() {
        let data = vec![0u8; 100];
        let mut walker = WeightWalker::new(&data, 10);
        assert!(walker.take(90).is_ok());
        let mut walker2 = WeightWalker::new(&data, 10);
        assert!(walker2.take(91).is_err());
    }
}
