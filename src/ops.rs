//! CPU operator kernels
//!
//! Every kernel has the uniform signature `(ctx, nThreads, threadIndex,
//! batchSize)` and owns a deterministic shard of the op's output; the
//! executor guarantees a barrier between ops, so a kernel may read anything
//! written by earlier ops and must never touch rows outside its shard.
//!
//! Dispatch is a flat `(OpCode, OpQuantType)` table lookup returning a plain
//! function pointer; unsupported combinations surface as configuration
//! errors at segment-build time, never at forward time.

use crate::error::{RepartirError, Result};
use crate::graph::{OpCode, OpParams};
use crate::quantize::{
    dequantize_q80_to_f32, dot_f32_q40, dot_q80_q40, dot_q80_q80, quantize_f32_to_q80,
};
use crate::slice::RopeType;
use crate::tensor::{FloatType, Size3D};

/// Input/weight/output quantization tuple of one op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum OpQuantType {
    /// f32 input, f32 weight, f32 output
    F32_F32_F32,
    /// f32 input, Q40 weight, f32 output
    F32_Q40_F32,
    /// f32 input, Q40 weight, Q80 output
    F32_Q40_Q80,
    /// f32 input, f32 weight, Q80 output
    F32_F32_Q80,
    /// Q80 input, Q80 weight, Q80 output
    Q80_Q80_Q80,
    /// Q80 input, Q80 weight, f32 output
    Q80_Q80_F32,
    /// Q80 input, Q40 weight, f32 output
    Q80_Q40_F32,
    /// Q80 input, f32 weight, f32 output
    Q80_F32_F32,
}

impl OpQuantType {
    /// Diagnostic name
    pub fn name(self) -> &'static str {
        match self {
            OpQuantType::F32_F32_F32 => "F32_F32_F32",
            OpQuantType::F32_Q40_F32 => "F32_Q40_F32",
            OpQuantType::F32_Q40_Q80 => "F32_Q40_Q80",
            OpQuantType::F32_F32_Q80 => "F32_F32_Q80",
            OpQuantType::Q80_Q80_Q80 => "Q80_Q80_Q80",
            OpQuantType::Q80_Q80_F32 => "Q80_Q80_F32",
            OpQuantType::Q80_Q40_F32 => "Q80_Q40_F32",
            OpQuantType::Q80_F32_F32 => "Q80_F32_F32",
        }
    }
}

/// Resolve the quant tuple of an op. A weight of `Unk` means "no weight" and
/// classifies as `<input>_<input>_<output>`.
pub fn op_quant_type(input: FloatType, weight: FloatType, output: FloatType) -> Result<OpQuantType> {
    use FloatType::{F32, Q40, Q80, Unk};
    let q = match (input, weight, output) {
        (F32, Unk | F32, F32) => OpQuantType::F32_F32_F32,
        (F32, Q40, F32) => OpQuantType::F32_Q40_F32,
        (F32, Q40, Q80) => OpQuantType::F32_Q40_Q80,
        (F32, Unk | F32, Q80) => OpQuantType::F32_F32_Q80,
        (Q80, Unk | Q80, Q80) => OpQuantType::Q80_Q80_Q80,
        (Q80, Unk | Q80, F32) => OpQuantType::Q80_Q80_F32,
        (Q80, Q40, F32) => OpQuantType::Q80_Q40_F32,
        (Q80, F32, F32) => OpQuantType::Q80_F32_F32,
        _ => {
            return Err(RepartirError::UnsupportedOp {
                op: "quant tuple".to_string(),
                quant: format!("{}/{}/{}", input.name(), weight.name(), output.name()),
            })
        }
    };
    Ok(q)
}

/// Execution context of one op instance, shared read-only by all threads.
///
/// Raw pointers refer into device buffers and net pipes that outlive the
/// forward call; threads write disjoint shards, with a barrier between ops.
pub struct OpContext {
    /// Diagnostic name
    pub name: String,
    /// Typed parameters
    pub params: OpParams,
    /// Resolved input rows (z*nBatches entries for batch pointers, 1 for raw)
    pub input: Vec<*mut u8>,
    /// Effective input size (x = row extent)
    pub input_size: Size3D,
    /// Resolved output rows
    pub output: Vec<*mut u8>,
    /// Effective output size
    pub output_size: Size3D,
    /// Weight bytes (64-byte-aligned device allocation; null when weightless)
    pub weight: *mut u8,
    /// Weight slot size
    pub weight_size: Size3D,
    /// Batch capacity of pipes/buffers
    pub n_batches: u32,
    /// Base pointers of all net pipes
    pub pipes: Vec<*mut u8>,
    /// Sizes of all net pipes
    pub pipe_sizes: Vec<Size3D>,
    /// Base pointers of all node buffers
    pub buffers: Vec<*mut u8>,
    /// Sizes of all node buffers
    pub buffer_sizes: Vec<Size3D>,
}

// SAFETY: an OpContext is only ever used by the executor's thread pool, which
// assigns disjoint output shards per thread and separates ops with barriers.
unsafe impl Send for OpContext {}
unsafe impl Sync for OpContext {}

/// Kernel function signature
pub type OpForward = fn(&OpContext, u32, u32, u32);

#[inline]
fn f32_row<'a>(ptr: *mut u8, len: usize) -> &'a mut [f32] {
    // SAFETY: every slot a row pointer can land in is 64-byte aligned at its
    // base with row strides that are multiples of 4 for f32 content; shard
    // disjointness is the executor's contract.
    unsafe { std::slice::from_raw_parts_mut(ptr.cast::<f32>(), len) }
}

#[inline]
fn u8_row<'a>(ptr: *mut u8, len: usize) -> &'a mut [u8] {
    // SAFETY: see f32_row.
    unsafe { std::slice::from_raw_parts_mut(ptr, len) }
}

impl OpContext {
    /// f32 view of one pipe row
    fn pipe_row_f32(&self, pipe: u32, batch: u32) -> &[f32] {
        let size = &self.pipe_sizes[pipe as usize];
        let row_bytes = size.row_bytes();
        // SAFETY: batch < nBatches, the pipe allocation covers nBatches rows.
        let ptr = unsafe { self.pipes[pipe as usize].add(batch as usize * row_bytes) };
        f32_row(ptr, size.x as usize)
    }

    /// Position of one batch row, read from the positions pipe
    fn position(&self, pipe: u32, batch: u32) -> u32 {
        self.pipe_row_f32(pipe, batch)[0] as u32
    }

    /// Mutable f32 view of a whole buffer
    fn buffer_f32(&self, buffer: u32) -> &mut [f32] {
        let size = &self.buffer_sizes[buffer as usize];
        f32_row(self.buffers[buffer as usize], size.length)
    }

    /// Whole weight allocation as bytes
    fn weight_bytes(&self) -> &[u8] {
        u8_row(self.weight, self.weight_size.n_bytes)
    }

    /// Whole weight allocation as f32
    fn weight_f32(&self) -> &[f32] {
        f32_row(self.weight, self.weight_size.length)
    }

    /// Row count the kernels iterate: z planes x live batches
    fn active_rows(&self, batch_size: u32) -> u32 {
        self.input_size.z.max(1) * batch_size
    }

    /// Map an active-row ordinal to the pointer-list row index
    fn row_index(&self, ordinal: u32, batch_size: u32) -> usize {
        let z = ordinal / batch_size;
        let b = ordinal % batch_size;
        (z * self.n_batches + b) as usize
    }
}

/// Contiguous shard `[start, end)` of `total` items for one thread
#[inline]
fn shard(total: u32, n_threads: u32, thread_index: u32) -> (u32, u32) {
    let base = total / n_threads;
    let rem = total % n_threads;
    let start = thread_index * base + thread_index.min(rem);
    let len = base + u32::from(thread_index < rem);
    (start, start + len)
}

// ---------------------------------------------------------------------------
// Elementwise and normalization kernels
// ---------------------------------------------------------------------------

fn forward_embedding(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let dim = ctx.output_size.x as usize;
    let weight = ctx.weight_f32();
    for b in start..end {
        let token = f32_row(ctx.input[b as usize], 1)[0] as usize;
        let out = f32_row(ctx.output[b as usize], dim);
        out.copy_from_slice(&weight[token * dim..(token + 1) * dim]);
    }
}

fn forward_inv_rms(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::InvRms { epsilon, n_columns } = &ctx.params else {
        unreachable!("inv rms params")
    };
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    let group = x / n_columns as usize;
    for b in start..end {
        let input = f32_row(ctx.input[b as usize], x);
        let out = f32_row(ctx.output[b as usize], n_columns as usize);
        for c in 0..n_columns as usize {
            let row = &input[c * group..(c + 1) * group];
            let ss: f32 = row.iter().map(|v| v * v).sum::<f32>() / group as f32 + epsilon;
            out[c] = 1.0 / ss.sqrt();
        }
    }
}

fn forward_rms_norm(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::RmsNorm { inv_rms_buffer, n_columns } = &ctx.params else {
        unreachable!("rms norm params")
    };
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    let group = x / n_columns as usize;
    let weight = ctx.weight_f32();
    let inv_cols = ctx.buffer_sizes[inv_rms_buffer as usize].x as usize;
    for b in start..end {
        let input = f32_row(ctx.input[b as usize], x);
        let out = f32_row(ctx.output[b as usize], x);
        let inv = &ctx.buffer_f32(inv_rms_buffer)[b as usize * inv_cols..];
        for c in 0..n_columns as usize {
            let s = inv[c];
            for j in 0..group {
                out[c * group + j] = input[c * group + j] * s * weight[j % weight.len()];
            }
        }
    }
}

fn forward_silu(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let (start, end) = shard(rows, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    for r in start..end {
        let idx = ctx.row_index(r, batch_size);
        let row = f32_row(ctx.input[idx], x);
        for v in row.iter_mut() {
            *v *= 1.0 / (1.0 + (-*v).exp());
        }
    }
}

fn forward_gelu(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let (start, end) = shard(rows, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    for r in start..end {
        let idx = ctx.row_index(r, batch_size);
        let row = f32_row(ctx.input[idx], x);
        for v in row.iter_mut() {
            let t = SQRT_2_OVER_PI * (*v + 0.044_715 * *v * *v * *v);
            *v = 0.5 * *v * (1.0 + t.tanh());
        }
    }
}

fn forward_mul(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::Mul { multiplier_buffer } = &ctx.params else {
        unreachable!("mul params")
    };
    let rows = ctx.active_rows(batch_size);
    let (start, end) = shard(rows, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    let mul_row_len = ctx.buffer_sizes[multiplier_buffer as usize].x as usize;
    for r in start..end {
        let idx = ctx.row_index(r, batch_size);
        let row = f32_row(ctx.input[idx], x);
        let mul = &ctx.buffer_f32(multiplier_buffer)[idx * mul_row_len..idx * mul_row_len + x];
        for (v, m) in row.iter_mut().zip(mul.iter()) {
            *v *= m;
        }
    }
}

fn forward_scale(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::Scale { scale_buffer } = &ctx.params else {
        unreachable!("scale params")
    };
    let rows = ctx.active_rows(batch_size);
    let (start, end) = shard(rows, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    for r in start..end {
        let idx = ctx.row_index(r, batch_size);
        let row = f32_row(ctx.input[idx], x);
        let scale = ctx.buffer_f32(scale_buffer)[idx];
        for v in row.iter_mut() {
            *v *= scale;
        }
    }
}

fn forward_softmax(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    for b in start..end {
        let row = f32_row(ctx.input[b as usize], x);
        softmax_f32(row);
    }
}

/// In-place numerically stable softmax
pub fn softmax_f32(row: &mut [f32]) {
    let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

fn forward_repeat_z_f32(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let z = ctx.output_size.z.max(1);
    let (start, end) = shard(z * batch_size, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    for r in start..end {
        let b = r % batch_size;
        let idx = ctx.row_index(r, batch_size);
        let input = f32_row(ctx.input[b as usize], x);
        f32_row(ctx.output[idx], x).copy_from_slice(input);
    }
}

fn forward_repeat_z_q80(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let z = ctx.output_size.z.max(1);
    let (start, end) = shard(z * batch_size, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    let out_bytes = FloatType::Q80.bytes(x);
    for r in start..end {
        let b = r % batch_size;
        let idx = ctx.row_index(r, batch_size);
        let input = f32_row(ctx.input[b as usize], x);
        quantize_f32_to_q80(input, u8_row(ctx.output[idx], out_bytes));
    }
}

// ---------------------------------------------------------------------------
// Cast and merge kernels
// ---------------------------------------------------------------------------

fn forward_cast_copy(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let (start, end) = shard(rows, n_threads, thread_index);
    let row_bytes = ctx.input_size.float_type.bytes(ctx.input_size.x as usize);
    for r in start..end {
        let idx = ctx.row_index(r, batch_size);
        let src = &*u8_row(ctx.input[idx], row_bytes);
        u8_row(ctx.output[idx], row_bytes).copy_from_slice(src);
    }
}

fn forward_cast_quantize(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let (start, end) = shard(rows, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    let out_bytes = FloatType::Q80.bytes(x);
    for r in start..end {
        let idx = ctx.row_index(r, batch_size);
        let input = f32_row(ctx.input[idx], x);
        quantize_f32_to_q80(input, u8_row(ctx.output[idx], out_bytes));
    }
}

fn forward_merge_add_f32(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let out_x = ctx.output_size.x as usize;
    let n_slots = ctx.input_size.x as usize / out_x;
    for b in start..end {
        let input = f32_row(ctx.input[b as usize], ctx.input_size.x as usize);
        let out = f32_row(ctx.output[b as usize], out_x);
        out.copy_from_slice(&input[0..out_x]);
        for slot in 1..n_slots {
            for j in 0..out_x {
                out[j] += input[slot * out_x + j];
            }
        }
    }
}

fn forward_merge_add_q80(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let out_x = ctx.output_size.x as usize;
    let slot_bytes = FloatType::Q80.bytes(out_x);
    let n_slots = ctx.input_size.x as usize / out_x;
    let mut scratch = vec![0f32; out_x];
    for b in start..end {
        let input = &*u8_row(ctx.input[b as usize], n_slots * slot_bytes);
        let out = f32_row(ctx.output[b as usize], out_x);
        out.fill(0.0);
        for slot in 0..n_slots {
            dequantize_q80_to_f32(&input[slot * slot_bytes..(slot + 1) * slot_bytes], &mut scratch);
            for j in 0..out_x {
                out[j] += scratch[j];
            }
        }
    }
}

fn forward_merge_sum(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    let z = ctx.input_size.z.max(1);
    for b in start..end {
        let out = f32_row(ctx.output[b as usize], x);
        out.fill(0.0);
        for e in 0..z {
            let idx = (e * ctx.n_batches + b) as usize;
            let plane = &*f32_row(ctx.input[idx], x);
            for j in 0..x {
                out[j] += plane[j];
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Matmul kernels
// ---------------------------------------------------------------------------

/// Expert plane of the weight for an active-expert row, or the whole weight
/// for dense matmuls
fn weight_plane<'a>(ctx: &'a OpContext, ordinal: u32, batch_size: u32) -> &'a [u8] {
    let &OpParams::Matmul { n_experts, indexes_buffer, .. } = &ctx.params else {
        return ctx.weight_bytes();
    };
    if n_experts == 0 {
        return ctx.weight_bytes();
    }
    let e = (ordinal / batch_size) as usize;
    let b = (ordinal % batch_size) as usize;
    let k = ctx.buffer_sizes[indexes_buffer as usize].x as usize;
    let expert = ctx.buffer_f32(indexes_buffer)[b * k + e] as usize;
    let plane = ctx.weight_size.n_bytes_xy;
    &ctx.weight_bytes()[expert * plane..(expert + 1) * plane]
}

fn forward_matmul_f32_f32(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let d = ctx.output_size.x as usize;
    let n = ctx.input_size.x as usize;
    let (d_start, d_end) = shard(d as u32, n_threads, thread_index);
    for r in 0..rows {
        let idx = ctx.row_index(r, batch_size);
        let weight = weight_plane(ctx, r, batch_size);
        let input = &*f32_row(ctx.input[idx], n);
        let out = f32_row(ctx.output[idx], d);
        for o in d_start as usize..d_end as usize {
            let w = &*f32_row(weight[o * n * 4..].as_ptr().cast_mut(), n);
            out[o] = input.iter().zip(w.iter()).map(|(a, b)| a * b).sum();
        }
    }
}

fn forward_matmul_f32_q40(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let d = ctx.output_size.x as usize;
    let n = ctx.input_size.x as usize;
    let w_row_bytes = FloatType::Q40.bytes(n);
    let (d_start, d_end) = shard(d as u32, n_threads, thread_index);
    for r in 0..rows {
        let idx = ctx.row_index(r, batch_size);
        let weight = weight_plane(ctx, r, batch_size);
        let input = &*f32_row(ctx.input[idx], n);
        let out = f32_row(ctx.output[idx], d);
        for o in d_start as usize..d_end as usize {
            out[o] = dot_f32_q40(input, &weight[o * w_row_bytes..(o + 1) * w_row_bytes]);
        }
    }
}

fn forward_matmul_q80_q40(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let d = ctx.output_size.x as usize;
    let n = ctx.input_size.x as usize;
    let in_bytes = FloatType::Q80.bytes(n);
    let w_row_bytes = FloatType::Q40.bytes(n);
    let (d_start, d_end) = shard(d as u32, n_threads, thread_index);
    for r in 0..rows {
        let idx = ctx.row_index(r, batch_size);
        let weight = weight_plane(ctx, r, batch_size);
        let input = &*u8_row(ctx.input[idx], in_bytes);
        let out = f32_row(ctx.output[idx], d);
        for o in d_start as usize..d_end as usize {
            out[o] = dot_q80_q40(input, &weight[o * w_row_bytes..(o + 1) * w_row_bytes]);
        }
    }
}

fn forward_matmul_q80_q80(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let d = ctx.output_size.x as usize;
    let n = ctx.input_size.x as usize;
    let in_bytes = FloatType::Q80.bytes(n);
    let w_row_bytes = FloatType::Q80.bytes(n);
    let (d_start, d_end) = shard(d as u32, n_threads, thread_index);
    for r in 0..rows {
        let idx = ctx.row_index(r, batch_size);
        let weight = weight_plane(ctx, r, batch_size);
        let input = &*u8_row(ctx.input[idx], in_bytes);
        let out = f32_row(ctx.output[idx], d);
        for o in d_start as usize..d_end as usize {
            out[o] = dot_q80_q80(input, &weight[o * w_row_bytes..(o + 1) * w_row_bytes]);
        }
    }
}

fn forward_matmul_q80_f32(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let rows = ctx.active_rows(batch_size);
    let d = ctx.output_size.x as usize;
    let n = ctx.input_size.x as usize;
    let in_bytes = FloatType::Q80.bytes(n);
    let (d_start, d_end) = shard(d as u32, n_threads, thread_index);
    let mut dequant = vec![0f32; n];
    for r in 0..rows {
        let idx = ctx.row_index(r, batch_size);
        let weight = weight_plane(ctx, r, batch_size);
        dequantize_q80_to_f32(&*u8_row(ctx.input[idx], in_bytes), &mut dequant);
        let out = f32_row(ctx.output[idx], d);
        for o in d_start as usize..d_end as usize {
            let w = &*f32_row(weight[o * n * 4..].as_ptr().cast_mut(), n);
            out[o] = dequant.iter().zip(w.iter()).map(|(a, b)| a * b).sum();
        }
    }
}

// ---------------------------------------------------------------------------
// Attention kernels
// ---------------------------------------------------------------------------

fn forward_rope(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::Rope { rope_type, is_q, position_pipe, cache_buffer, slice, .. } = &ctx.params
    else {
        unreachable!("rope params")
    };
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let dim = if is_q == 1 { slice.q_dim_len } else { slice.kv_dim_len } as usize;
    let cache = &*ctx.buffer_f32(cache_buffer);

    for b in start..end {
        let pos = ctx.position(position_pipe, b) as usize;
        let row = f32_row(ctx.input[b as usize], dim);
        match rope_type {
            RopeType::Llama | RopeType::Llama31 => {
                let cache_row = &cache[pos * slice.slice_dim as usize..];
                let shift = if is_q == 1 { slice.q_shift as usize } else { 0 };
                for j in (0..dim).step_by(2) {
                    let fcr = cache_row[shift + j];
                    let fci = cache_row[shift + j + 1];
                    let v0 = row[j];
                    let v1 = row[j + 1];
                    row[j] = v0 * fcr - v1 * fci;
                    row[j + 1] = v0 * fci + v1 * fcr;
                }
            }
            RopeType::Falcon => {
                let hd = slice.head_dim as usize;
                let half = hd / 2;
                let cache_row = &cache[pos * hd..(pos + 1) * hd];
                for h in 0..dim / hd {
                    let head = &mut row[h * hd..(h + 1) * hd];
                    for j in 0..half {
                        let fcr = cache_row[j];
                        let fci = cache_row[j + half];
                        let v0 = head[j];
                        let v1 = head[j + half];
                        head[j] = v0 * fcr - v1 * fci;
                        head[j + half] = v0 * fci + v1 * fcr;
                    }
                }
            }
        }
    }
}

fn forward_shift(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::Shift { position_pipe } = &ctx.params else {
        unreachable!("shift params")
    };
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let x = ctx.input_size.x as usize;
    for b in start..end {
        let pos = ctx.position(position_pipe, b) as usize;
        let row = &*f32_row(ctx.input[b as usize], x);
        let cache = f32_row(ctx.output[0], ctx.output_size.length);
        cache[pos * x..(pos + 1) * x].copy_from_slice(row);
    }
}

fn forward_multihead_att(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::MultiheadAtt {
        n_heads,
        n_heads0,
        n_kv_heads,
        head_dim,
        seq_len,
        kv_dim0,
        position_pipe,
        query_buffer,
        key_cache_buffer,
        value_cache_buffer,
        att_buffer,
        ..
    } = &ctx.params
    else {
        unreachable!("multihead att params")
    };
    let gqa = n_heads / n_kv_heads;
    let hd = head_dim as usize;
    let q_row_len = (n_heads0 * head_dim) as usize;
    let kv_row_len = kv_dim0 as usize;
    let att_row_len = (n_heads0 * seq_len) as usize;

    let (start, end) = shard(batch_size * n_heads0, n_threads, thread_index);
    for work in start..end {
        let b = work / n_heads0;
        let h = work % n_heads0;
        let pos = ctx.position(position_pipe, b) as usize;
        let kv_h = (h / gqa) as usize;

        let q_all = &*ctx.buffer_f32(query_buffer);
        let q = &q_all[b as usize * q_row_len + h as usize * hd..][..hd];
        let keys = &*ctx.buffer_f32(key_cache_buffer);
        let values = &*ctx.buffer_f32(value_cache_buffer);
        let att_all = ctx.buffer_f32(att_buffer);
        let att = &mut att_all[b as usize * att_row_len + h as usize * seq_len as usize..][..pos + 1];

        let scale = 1.0 / (hd as f32).sqrt();
        for (t, slot) in att.iter_mut().enumerate() {
            let k = &keys[t * kv_row_len + kv_h * hd..][..hd];
            *slot = q.iter().zip(k.iter()).map(|(a, b)| a * b).sum::<f32>() * scale;
        }
        softmax_f32(att);

        let out = f32_row(ctx.output[b as usize], q_row_len);
        let out_head = &mut out[h as usize * hd..][..hd];
        out_head.fill(0.0);
        for (t, &a) in att.iter().enumerate() {
            let v = &values[t * kv_row_len + kv_h * hd..][..hd];
            for j in 0..hd {
                out_head[j] += a * v[j];
            }
        }
    }
}

fn forward_moe_gate(ctx: &OpContext, n_threads: u32, thread_index: u32, batch_size: u32) {
    let &OpParams::MoeGate { k, norm_topk, indexes_buffer } = &ctx.params else {
        unreachable!("moe gate params")
    };
    let (start, end) = shard(batch_size, n_threads, thread_index);
    let n_experts = ctx.input_size.x as usize;
    let k = k as usize;
    for b in start..end {
        let probs = &*f32_row(ctx.input[b as usize], n_experts);
        // Highest-probability experts first, stable by index on ties.
        let mut order: Vec<usize> = (0..n_experts).collect();
        order.sort_by(|&a, &c| probs[c].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));
        let chosen = &order[..k];

        let mut score_sum: f32 = chosen.iter().map(|&e| probs[e]).sum();
        if norm_topk == 0 || score_sum <= 0.0 {
            score_sum = 1.0;
        }

        let ix_cols = ctx.buffer_sizes[indexes_buffer as usize].x as usize;
        let indexes = ctx.buffer_f32(indexes_buffer);
        for (slot, &e) in chosen.iter().enumerate() {
            indexes[b as usize * ix_cols + slot] = e as f32;
            // moe scores are z-major: plane `slot`, row `b`, single column
            let out_idx = (slot as u32 * ctx.n_batches + b) as usize;
            f32_row(ctx.output[out_idx], 1)[0] = probs[e] / score_sum;
        }
    }
}

/// Precompute the RoPE rotation cache for an op (called once at segment
/// creation, before any forward).
pub fn init_rope_cache(ctx: &OpContext) {
    let &OpParams::Rope {
        rope_type,
        cache_buffer,
        scaling_factor,
        scaling_low_freq,
        scaling_high_freq,
        scaling_orig_max_seq_len,
        slice,
        ..
    } = &ctx.params
    else {
        return;
    };
    let cache = ctx.buffer_f32(cache_buffer);
    let hd = slice.head_dim as f32;

    match rope_type {
        RopeType::Llama | RopeType::Llama31 => {
            let apply_scaling = scaling_factor != 1.0;
            for pos in 0..slice.seq_len as usize {
                let mut i = slice.kv_dim_start;
                while i < slice.kv_dim_start + slice.slice_dim {
                    let h = (i % slice.head_dim) as f32;
                    let mut freq = 1.0 / slice.rope_theta.powf(h / hd);
                    if apply_scaling {
                        freq = scale_frequency_llama31(
                            freq,
                            scaling_factor,
                            scaling_low_freq,
                            scaling_high_freq,
                            scaling_orig_max_seq_len,
                        );
                    }
                    let val = pos as f32 * freq;
                    let base = pos * slice.slice_dim as usize + (i - slice.kv_dim_start) as usize;
                    cache[base] = val.cos();
                    cache[base + 1] = val.sin();
                    i += 2;
                }
            }
        }
        RopeType::Falcon => {
            let half = (slice.head_dim / 2) as usize;
            for pos in 0..slice.seq_len as usize {
                for j in 0..half {
                    let freq = 1.0 / slice.rope_theta.powf(2.0 * j as f32 / hd);
                    let val = pos as f32 * freq;
                    cache[pos * slice.head_dim as usize + j] = val.cos();
                    cache[pos * slice.head_dim as usize + j + half] = val.sin();
                }
            }
        }
    }
}

fn scale_frequency_llama31(
    freq: f32,
    factor: f32,
    low_freq_factor: f32,
    high_freq_factor: f32,
    orig_max_seq_len: u32,
) -> f32 {
    let wave_len = 2.0 * std::f32::consts::PI / freq;
    let high_freq_wavelen = orig_max_seq_len as f32 / high_freq_factor;
    if wave_len < high_freq_wavelen {
        return freq;
    }
    let low_freq_wavelen = orig_max_seq_len as f32 / low_freq_factor;
    if wave_len > low_freq_wavelen {
        return freq / factor;
    }
    let smooth = (orig_max_seq_len as f32 / wave_len - low_freq_factor)
        / (high_freq_factor - low_freq_factor);
    (1.0 - smooth) * freq / factor + smooth * freq
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Look up the kernel for `(code, quant)`; `None` means the combination is
/// unsupported and segment construction must fail.
pub fn get_op_forward(code: OpCode, quant: OpQuantType) -> Option<OpForward> {
    use OpQuantType::{
        F32_F32_F32, F32_F32_Q80, F32_Q40_F32, Q80_F32_F32, Q80_Q40_F32, Q80_Q80_F32, Q80_Q80_Q80,
    };
    match (code, quant) {
        (OpCode::Embedding, F32_F32_F32) => Some(forward_embedding),
        (OpCode::InvRms, F32_F32_F32) => Some(forward_inv_rms),
        (OpCode::RmsNorm, F32_F32_F32) => Some(forward_rms_norm),
        (OpCode::Matmul, F32_F32_F32) => Some(forward_matmul_f32_f32),
        (OpCode::Matmul, F32_Q40_F32) => Some(forward_matmul_f32_q40),
        (OpCode::Matmul, Q80_Q40_F32) => Some(forward_matmul_q80_q40),
        (OpCode::Matmul, Q80_Q80_F32) => Some(forward_matmul_q80_q80),
        (OpCode::Matmul, Q80_F32_F32) => Some(forward_matmul_q80_f32),
        (OpCode::Rope, F32_F32_F32) => Some(forward_rope),
        (OpCode::MultiheadAtt, F32_F32_F32) => Some(forward_multihead_att),
        (OpCode::Silu, F32_F32_F32) => Some(forward_silu),
        (OpCode::Gelu, F32_F32_F32) => Some(forward_gelu),
        (OpCode::Mul, F32_F32_F32) => Some(forward_mul),
        (OpCode::Scale, F32_F32_F32) => Some(forward_scale),
        (OpCode::Softmax, F32_F32_F32) => Some(forward_softmax),
        (OpCode::MoeGate, F32_F32_F32) => Some(forward_moe_gate),
        (OpCode::Shift, F32_F32_F32) => Some(forward_shift),
        (OpCode::RepeatZ, F32_F32_F32) => Some(forward_repeat_z_f32),
        (OpCode::RepeatZ, F32_F32_Q80) => Some(forward_repeat_z_q80),
        (OpCode::Cast, F32_F32_F32 | Q80_Q80_Q80) => Some(forward_cast_copy),
        (OpCode::Cast, F32_F32_Q80) => Some(forward_cast_quantize),
        (OpCode::MergeAdd, F32_F32_F32) => Some(forward_merge_add_f32),
        (OpCode::MergeAdd, Q80_Q80_F32) => Some(forward_merge_add_q80),
        (OpCode::MergeSum, F32_F32_F32) => Some(forward_merge_sum),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpParams;

    fn make_ctx(
        params: OpParams,
        input: Vec<*mut u8>,
        input_size: Size3D,
        output: Vec<*mut u8>,
        output_size: Size3D,
        n_batches: u32,
    ) -> OpContext {
        OpContext {
            name: "test".to_string(),
            params,
            input,
            input_size,
            output,
            output_size,
            weight: std::ptr::null_mut(),
            weight_size: Size3D::none(),
            n_batches,
            pipes: Vec::new(),
            pipe_sizes: Vec::new(),
            buffers: Vec::new(),
            buffer_sizes: Vec::new(),
        }
    }

    fn rows_of(data: &mut [f32], row_len: usize) -> Vec<*mut u8> {
        data.chunks_exact_mut(row_len)
            .map(|c| c.as_mut_ptr().cast::<u8>())
            .collect()
    }

    #[test]
    fn test_shard_covers_everything() {
        for total in [1u32, 7, 64, 100] {
            for n_threads in [1u32, 2, 3, 8] {
                let mut covered = vec![false; total as usize];
                for t in 0..n_threads {
                    let (s, e) = shard(total, n_threads, t);
                    for i in s..e {
                        assert!(!covered[i as usize]);
                        covered[i as usize] = true;
                    }
                }
                assert!(covered.iter().all(|&c| c));
            }
        }
    }

    #[test]
    fn test_quant_tuple_resolution() {
        use FloatType::{F32, Q40, Q80, Unk};
        assert_eq!(op_quant_type(F32, Unk, F32).unwrap(), OpQuantType::F32_F32_F32);
        assert_eq!(op_quant_type(F32, Q40, F32).unwrap(), OpQuantType::F32_Q40_F32);
        assert_eq!(op_quant_type(Q80, Unk, F32).unwrap(), OpQuantType::Q80_Q80_F32);
        assert_eq!(op_quant_type(Q80, Q40, F32).unwrap(), OpQuantType::Q80_Q40_F32);
        assert!(op_quant_type(FloatType::F16, Unk, F32).is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut row = vec![1.0f32, 2.0, 3.0, 4.0];
        softmax_f32(&mut row);
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(row[3] > row[0]);
    }

    #[test]
    fn test_merge_add_sums_slots() {
        let n_batches = 2u32;
        let mut input = vec![0f32; (n_batches * 6) as usize];
        input[0..6].copy_from_slice(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
        let mut output = vec![0f32; (n_batches * 3) as usize];
        let in_rows = rows_of(&mut input, 6);
        let out_rows = rows_of(&mut output, 3);
        let ctx = make_ctx(
            OpParams::None,
            in_rows,
            Size3D::d2(FloatType::F32, n_batches, 6),
            out_rows,
            Size3D::d2(FloatType::F32, n_batches, 3),
            n_batches,
        );
        forward_merge_add_f32(&ctx, 1, 0, 1);
        assert_eq!(&output[0..3], &[11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_matmul_f32_identity() {
        let n_batches = 1u32;
        let mut input = vec![1.0f32, 2.0, 3.0];
        let mut output = vec![0f32; 3];
        let mut ident = vec![1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let in_rows = rows_of(&mut input, 3);
        let out_rows = rows_of(&mut output, 3);
        let mut ctx = make_ctx(
            OpParams::Matmul { n_experts: 0, n_active_experts: 0, indexes_buffer: 0 },
            in_rows,
            Size3D::d2(FloatType::F32, n_batches, 3),
            out_rows,
            Size3D::d2(FloatType::F32, n_batches, 3),
            n_batches,
        );
        ctx.weight = ident.as_mut_ptr().cast::<u8>();
        ctx.weight_size = Size3D::d2(FloatType::F32, 3, 3);
        forward_matmul_f32_f32(&ctx, 1, 0, 1);
        assert_eq!(output, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_matmul_threaded_matches_single() {
        let n_batches = 1u32;
        let n = 8usize;
        let d = 6usize;
        let mut input: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
        let mut weight: Vec<f32> = (0..n * d).map(|i| (i as f32 * 0.1).sin()).collect();

        let mut out_single = vec![0f32; d];
        let mut out_multi = vec![0f32; d];
        for (out, threads) in [(&mut out_single, 1u32), (&mut out_multi, 3u32)] {
            let in_rows = rows_of(&mut input, n);
            let out_rows = rows_of(out, d);
            let mut ctx = make_ctx(
                OpParams::Matmul { n_experts: 0, n_active_experts: 0, indexes_buffer: 0 },
                in_rows,
                Size3D::d2(FloatType::F32, n_batches, n as u32),
                out_rows,
                Size3D::d2(FloatType::F32, n_batches, d as u32),
                n_batches,
            );
            ctx.weight = weight.as_mut_ptr().cast::<u8>();
            ctx.weight_size = Size3D::d2(FloatType::F32, n as u32, d as u32);
            for t in 0..threads {
                let f = get_op_forward(OpCode::Matmul, OpQuantType::F32_F32_F32).unwrap();
                f(&ctx, threads, t, 1);
            }
        }
        assert_eq!(out_single, out_multi);
    }

    #[test]
    fn test_silu_shape() {
        let mut data = vec![0.0f32, 1.0, -1.0, 5.0];
        let rows = rows_of(&mut data, 4);
        let ctx = make_ctx(
            OpParams::None,
            rows.clone(),
            Size3D::d2(FloatType::F32, 1, 4),
            rows,
            Size3D::d2(FloatType::F32, 1, 4),
            1,
        );
        forward_silu(&ctx, 1, 0, 1);
        assert_eq!(data[0], 0.0);
        assert!((data[1] - 0.731_058_6).abs() < 1e-5);
        assert!(data[2] > -0.3 && data[2] < 0.0);
    }

    #[test]
    fn test_dispatch_rejects_unknown() {
        assert!(get_op_forward(OpCode::Rope, OpQuantType::Q80_Q80_F32).is_none());
        assert!(get_op_forward(OpCode::Embedding, OpQuantType::F32_F32_F32).is_some());
    }
}
