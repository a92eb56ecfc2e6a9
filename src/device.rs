//! CPU device
//!
//! Owns the node's scratch buffers and the compiled form of each segment:
//! resolved pointers, the kernel chosen from the `(code, quant)` table, and
//! the op's weight allocation. Pointer resolution for `BatchedSlice` views
//! consults the same slice resolver the collectives use, so the bytes a node
//! writes into a pipe land exactly where its peers expect them.

use crate::error::{RepartirError, Result};
use crate::executor::NetExecution;
use crate::graph::{NetConfig, NodeConfig, OpCode, PointerConfig, PointerSource, PointerType};
use crate::memory::AlignedBuffer;
use crate::ops::{get_op_forward, init_rope_cache, op_quant_type, OpContext, OpForward};
use crate::sync::resolve_pipe_slice;
use crate::tensor::Size3D;

struct DeviceOp {
    forward: OpForward,
    context: OpContext,
    // The context's weight pointer refers into this allocation.
    _weight: AlignedBuffer,
    name: String,
    index: u32,
}

struct DeviceSegment {
    ops: Vec<DeviceOp>,
}

/// CPU execution device for one node
pub struct CpuDevice {
    buffers: Vec<AlignedBuffer>,
    segments: Vec<DeviceSegment>,
}

// SAFETY: the raw pointers inside compiled op contexts refer to allocations
// owned by this device and the shared NetExecution; concurrent use follows
// the executor's shard/barrier discipline.
unsafe impl Send for CpuDevice {}
unsafe impl Sync for CpuDevice {}

impl CpuDevice {
    /// Compile every segment of `node_config` against the shared pipes.
    pub fn new(
        net_config: &NetConfig,
        node_config: &NodeConfig,
        execution: &NetExecution,
    ) -> Result<CpuDevice> {
        let buffers: Vec<AlignedBuffer> = node_config
            .buffers
            .iter()
            .map(|b| AlignedBuffer::new(b.size.n_bytes))
            .collect();
        let buffer_sizes: Vec<Size3D> = node_config.buffers.iter().map(|b| b.size).collect();

        let pipe_ptrs: Vec<*mut u8> = (0..net_config.pipes.len())
            .map(|i| execution.pipe_ptr(i as u32))
            .collect();
        let buffer_ptrs: Vec<*mut u8> = buffers.iter().map(AlignedBuffer::as_mut_ptr).collect();

        let mut segments = Vec::with_capacity(node_config.segments.len());
        for segment_config in &node_config.segments {
            let mut ops = Vec::with_capacity(segment_config.ops.len());
            for op_config in &segment_config.ops {
                let (input, input_size) = resolve_pointer(
                    &op_config.input,
                    net_config,
                    node_config,
                    &pipe_ptrs,
                    &buffer_ptrs,
                    &buffer_sizes,
                )?;
                let (output, output_size) = resolve_pointer(
                    &op_config.output,
                    net_config,
                    node_config,
                    &pipe_ptrs,
                    &buffer_ptrs,
                    &buffer_sizes,
                )?;

                let quant = op_quant_type(
                    input_size.float_type,
                    op_config.weight_size.float_type,
                    output_size.float_type,
                )?;
                let forward = get_op_forward(op_config.code, quant).ok_or_else(|| {
                    RepartirError::UnsupportedOp {
                        op: op_config.name.clone(),
                        quant: quant.name().to_string(),
                    }
                })?;

                let weight = AlignedBuffer::new(op_config.weight_size.n_bytes);
                let context = OpContext {
                    name: op_config.name.clone(),
                    params: op_config.params.clone(),
                    input,
                    input_size,
                    output,
                    output_size,
                    weight: weight.as_mut_ptr(),
                    weight_size: op_config.weight_size,
                    n_batches: net_config.n_batches,
                    pipes: pipe_ptrs.clone(),
                    pipe_sizes: execution.pipe_sizes.clone(),
                    buffers: buffer_ptrs.clone(),
                    buffer_sizes: buffer_sizes.clone(),
                };
                if op_config.code == OpCode::Rope {
                    init_rope_cache(&context);
                }
                ops.push(DeviceOp {
                    forward,
                    context,
                    _weight: weight,
                    name: op_config.name.clone(),
                    index: op_config.index,
                });
            }
            segments.push(DeviceSegment { ops });
        }

        Ok(CpuDevice { buffers, segments })
    }

    /// Op count of a segment
    pub fn n_ops(&self, segment_index: usize) -> usize {
        self.segments[segment_index].ops.len()
    }

    /// Run one op's shard for one thread
    pub fn forward_op(
        &self,
        segment_index: usize,
        op_index: usize,
        n_threads: u32,
        thread_index: u32,
        batch_size: u32,
    ) {
        let op = &self.segments[segment_index].ops[op_index];
        (op.forward)(&op.context, n_threads, thread_index, batch_size);
    }

    /// True when this device compiled `(op_name, op_index)`
    pub fn has_op(&self, op_name: &str, op_index: u32) -> bool {
        self.segments
            .iter()
            .flat_map(|s| &s.ops)
            .any(|op| op.name == op_name && op.index == op_index)
    }

    /// Copy weight bytes into `(op_name, op_index)` at `offset`.
    pub fn load_weight(
        &self,
        op_name: &str,
        op_index: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let op = self
            .segments
            .iter()
            .flat_map(|s| &s.ops)
            .find(|op| op.name == op_name && op.index == op_index)
            .ok_or_else(|| {
                RepartirError::Config(format!("Unknown weight target '{op_name}' ({op_index})"))
            })?;
        let allocated = op.context.weight_size.n_bytes;
        if offset + data.len() > allocated {
            return Err(RepartirError::WeightOverflow {
                op: op_name.to_string(),
                offset,
                n_bytes: data.len(),
                allocated,
            });
        }
        // SAFETY: bounds were checked against the weight allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), op.context.weight.add(offset), data.len());
        }
        Ok(())
    }

}

/// Resolve a pointer config into per-row pointers plus the effective size.
fn resolve_pointer(
    config: &PointerConfig,
    net_config: &NetConfig,
    node_config: &NodeConfig,
    pipe_ptrs: &[*mut u8],
    buffer_ptrs: &[*mut u8],
    buffer_sizes: &[Size3D],
) -> Result<(Vec<*mut u8>, Size3D)> {
    let (base, source_size, pipe_slicing) = match config.source {
        PointerSource::Pipe => {
            let pipe = &net_config.pipes[config.index as usize];
            (pipe_ptrs[config.index as usize], pipe.size, Some(pipe.slicing))
        }
        PointerSource::Buffer => (
            buffer_ptrs[config.index as usize],
            buffer_sizes[config.index as usize],
            None,
        ),
    };

    match config.ptr_type {
        PointerType::Raw => Ok((
            vec![base],
            Size3D::d1(source_size.float_type, source_size.length as u32),
        )),
        PointerType::Batch | PointerType::BatchedSlice => {
            if source_size.y != net_config.n_batches {
                return Err(RepartirError::Config(format!(
                    "Batch pointer over a slot with {} rows (expected {})",
                    source_size.y, net_config.n_batches
                )));
            }
            let row_bytes = source_size.row_bytes();
            let n_rows = (source_size.z * source_size.y) as usize;
            let mut rows: Vec<*mut u8> = (0..n_rows)
                // SAFETY: row r starts at r * rowBytes inside the slot.
                .map(|r| unsafe { base.add(r * row_bytes) })
                .collect();
            let mut size = source_size;

            if config.ptr_type == PointerType::BatchedSlice {
                let slicing = pipe_slicing.unwrap_or(crate::graph::PipeSlicing::Uniform);
                let slice = resolve_pipe_slice(
                    &node_config.plan,
                    node_config.plan.stage_for_node(node_config.node_index),
                    slicing,
                    source_size.x,
                    node_config.node_index,
                );
                let offset_bytes = source_size.float_type.bytes(slice.start as usize);
                for row in &mut rows {
                    // SAFETY: the slice lies inside the row.
                    *row = unsafe { row.add(offset_bytes) };
                }
                size = Size3D::d3(
                    source_size.float_type,
                    source_size.z,
                    source_size.y,
                    slice.length,
                );
            }
            Ok((rows, size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::NetExecution;
    use crate::graph::{
        NetConfigBuilder, NodeConfigBuilder, OpParams, PipeSlicing, SegmentBuilder, SyncType,
    };
    use crate::plan::uniform_plan;
    use crate::tensor::FloatType;
    use std::sync::Arc;

    fn tiny_net(n_nodes: u32, n_batches: u32) -> NetConfig {
        let mut b = NetConfigBuilder::new(n_nodes, n_batches);
        b.add_pipe(
            "X",
            Size3D::d2(FloatType::F32, n_batches, 8),
            PipeSlicing::Uniform,
        );
        b.add_pipe(
            "ZQ",
            Size3D::d2(FloatType::F32, n_batches, 8 * n_nodes),
            PipeSlicing::Uniform,
        );
        b.build()
    }

    #[test]
    fn test_cast_through_batched_slice() {
        let n_batches = 2u32;
        let net = tiny_net(2, n_batches);
        let plan = Arc::new(uniform_plan(2, 2, 4, 4, 64, 64, 8).unwrap());

        // Node 1 casts its x buffer into its ZQ slot.
        let mut node = NodeConfigBuilder::new(1, plan);
        let x_buf = node.add_buffer("x", Size3D::d2(FloatType::F32, n_batches, 8));
        let mut seg = SegmentBuilder::new();
        seg.add_op(
            OpCode::Cast,
            "cast_zq",
            0,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batched_slice(PointerSource::Pipe, 1),
            Size3D::none(),
            OpParams::None,
        );
        seg.add_sync(1, SyncType::NodeSlices);
        node.add_segment(seg.build());
        let node = node.build();

        let execution = NetExecution::new(&net);
        execution.set_batch_size(n_batches);
        let device = CpuDevice::new(&net, &node, &execution).unwrap();

        // Fill the x buffer through a second resolve (write directly).
        let x = device.buffers[0].as_mut_ptr().cast::<f32>();
        for i in 0..(n_batches * 8) as usize {
            unsafe { *x.add(i) = i as f32 };
        }
        device.forward_op(0, 0, 1, 0, n_batches);

        // Node 1's slot is the back half of each ZQ row.
        let zq = execution.pipe_f32(1);
        assert_eq!(zq[8], 0.0); // batch 0, slot of node 1, first value
        assert_eq!(zq[8..16], (0..8).map(|i| i as f32).collect::<Vec<_>>()[..]);
        assert_eq!(zq[24..32], (8..16).map(|i| i as f32).collect::<Vec<_>>()[..]);
        assert!(zq[0..8].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_weight_overflow_is_reported() {
        let net = tiny_net(1, 1);
        let plan = Arc::new(uniform_plan(1, 2, 4, 4, 64, 64, 8).unwrap());
        let mut node = NodeConfigBuilder::new(0, plan);
        let x_buf = node.add_buffer("x", Size3D::d2(FloatType::F32, 1, 8));
        let mut seg = SegmentBuilder::new();
        seg.add_op(
            OpCode::Matmul,
            "mm",
            0,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            Size3D::d2(FloatType::F32, 8, 8),
            OpParams::Matmul { n_experts: 0, n_active_experts: 0, indexes_buffer: 0 },
        );
        node.add_segment(seg.build());
        let node = node.build();

        let execution = NetExecution::new(&net);
        let device = CpuDevice::new(&net, &node, &execution).unwrap();

        let ok = device.load_weight("mm", 0, 0, &vec![0u8; 8 * 8 * 4]);
        assert!(ok.is_ok());
        let overflow = device.load_weight("mm", 0, 8, &vec![0u8; 8 * 8 * 4]);
        assert!(matches!(
            overflow,
            Err(RepartirError::WeightOverflow { .. })
        ));
        assert!(device.has_op("mm", 0));
        assert!(!device.has_op("mm", 1));
    }

    #[test]
    fn test_unsupported_quant_rejected() {
        let net = tiny_net(1, 1);
        let plan = Arc::new(uniform_plan(1, 2, 4, 4, 64, 64, 8).unwrap());
        let mut node = NodeConfigBuilder::new(0, plan);
        let x_buf = node.add_buffer("x", Size3D::d2(FloatType::F32, 1, 8));
        let q_buf = node.add_buffer("q", Size3D::d2(FloatType::Q80, 1, 32));
        let mut seg = SegmentBuilder::new();
        // ROPE over a Q80 buffer has no kernel.
        seg.add_op(
            OpCode::Rope,
            "bad_rope",
            0,
            PointerConfig::batch(PointerSource::Buffer, q_buf),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            Size3D::none(),
            OpParams::None,
        );
        node.add_segment(seg.build());
        let node = node.build();

        let execution = NetExecution::new(&net);
        let err = CpuDevice::new(&net, &node, &execution);
        assert!(err.is_err());
    }
}
