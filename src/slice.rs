//! Slice algebra
//!
//! Deterministic slicing of attention heads, KV heads, FFN units, hidden
//! dimensions, and vocabulary over arbitrary per-node weight ratios.
//!
//! Two families share a style: *row* slicing partitions the **output** of a
//! matmul (Q/K/V/W1/W3/classifier), *column* slicing partitions the **input**
//! (Wo/W2) so partial outputs can be merged by addition across peers.

use crate::error::{RepartirError, Result};
use crate::tensor::{FloatType, Size3D};

/// RoPE family selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RopeType {
    /// Interleaved-pair rotation (LLaMA)
    Llama = 0,
    /// Split-half rotation (Falcon / NeoX)
    Falcon = 1,
    /// LLaMA with 3.1 frequency scaling
    Llama31 = 2,
}

impl RopeType {
    /// Decode from the integer stored in model headers
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(RopeType::Llama),
            1 => Ok(RopeType::Falcon),
            2 => Ok(RopeType::Llama31),
            _ => Err(RepartirError::ModelFormat(format!(
                "Unknown rope type code: {code}"
            ))),
        }
    }
}

/// Partition of a dimension over N peers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DimSplit {
    /// Start offset per peer (`starts[0] == 0` within a group)
    pub starts: Vec<u32>,
    /// Extent per peer; sums to the partitioned total
    pub lengths: Vec<u32>,
}

impl DimSplit {
    /// Sum of the lengths over a subrange of peers (0 when the split is
    /// empty or the range exceeds it)
    pub fn total(&self, range: std::ops::Range<usize>) -> u32 {
        self.lengths
            .get(range)
            .map_or(0, |lengths| lengths.iter().sum())
    }
}

/// Split `total` over `ratios` with optional alignment.
///
/// Every peer except the last gets `round(total * ratio / ratioSum)` snapped
/// to the nearest multiple of `align` (downward when the remainder is below
/// half a block); the last peer absorbs all rounding residue so the lengths
/// always sum to `total` exactly. When the dimension has headroom
/// (`total >= n * align`), no peer is rounded to zero.
pub fn create_dim_split(total: u32, ratios: &[f32], align: u32) -> Result<DimSplit> {
    let n = ratios.len();
    if n == 0 {
        return Err(RepartirError::Config("Ratio list cannot be empty".to_string()));
    }
    let ratio_sum: f32 = ratios.iter().sum();
    if ratio_sum < 1e-6 {
        return Err(RepartirError::Config(format!(
            "Ratio sum {ratio_sum} is too small"
        )));
    }

    let mut starts = vec![0u32; n];
    let mut lengths = vec![0u32; n];
    let mut current = 0u32;
    let mut remaining = total;

    for (i, &ratio) in ratios.iter().enumerate() {
        starts[i] = current;
        let len = if i == n - 1 {
            remaining
        } else {
            let ideal = f64::from(total) * f64::from(ratio) / f64::from(ratio_sum);
            let mut len = ideal.round() as u32;
            if align > 1 {
                let rem = len % align;
                if rem != 0 {
                    if rem >= align / 2 {
                        len += align - rem;
                    } else {
                        len -= rem;
                    }
                }
                if len == 0 && total >= n as u32 * align {
                    len = align;
                }
            }
            len.min(remaining)
        };
        lengths[i] = len;
        current += len;
        remaining -= len;
    }

    debug_assert_eq!(current, total);
    Ok(DimSplit { starts, lengths })
}

/// Per-node KV cache extents
#[derive(Debug, Clone, Copy)]
pub struct KvCacheSlice {
    /// Start of this node's KV band in elements
    pub kv_start: u32,
    /// Length of this node's KV band in elements
    pub kv_len: u32,
    /// Key cache size (`F32 x seqLen x kvLen`)
    pub key_size: Size3D,
    /// Value cache size (`F32 x seqLen x kvLen`)
    pub value_size: Size3D,
}

/// Slice of a row-partitioned matmul (output dimension split)
#[derive(Debug, Clone, Copy)]
pub struct RowMatmulSlice {
    /// Weight storage format
    pub float_type: FloatType,
    /// First output row owned by this node
    pub in_start: u32,
    /// Output rows owned by this node
    pub in_len: u32,
    /// Local output extent (same as `in_len`)
    pub d0: u32,
    /// Global input dimension (bytes per output row derive from it)
    pub n: u32,
    /// Full weight size
    pub size: Size3D,
    /// This node's slice size
    pub slice_size: Size3D,
}

/// Slice of a column-partitioned matmul (input dimension split)
#[derive(Debug, Clone, Copy)]
pub struct ColMatmulSlice {
    /// Weight storage format
    pub float_type: FloatType,
    /// First input column owned by this node
    pub out_start: u32,
    /// Input columns owned by this node
    pub out_len: u32,
    /// Global input dimension
    pub n: u32,
    /// Local input extent (same as `out_len`)
    pub n0: u32,
    /// Global output dimension
    pub d: u32,
    /// Full weight size
    pub size: Size3D,
    /// This node's slice size
    pub slice_size: Size3D,
}

/// Per-node RoPE extents and cache geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeSlice {
    /// Start of this node's Q band in elements
    pub q_dim_start: u32,
    /// Length of this node's Q band in elements
    pub q_dim_len: u32,
    /// Offset of the Q band within the combined rotation band
    pub q_shift: u32,
    /// Global KV dimension
    pub kv_dim: u32,
    /// Start of this node's KV band in elements
    pub kv_dim_start: u32,
    /// Length of this node's KV band in elements
    pub kv_dim_len: u32,
    /// Extent of the combined rotation band (`qDimEnd - kvDimStart`)
    pub slice_dim: u32,
    /// Sequence length the cache covers
    pub seq_len: u32,
    /// Per-head dimension
    pub head_dim: u32,
    /// Global KV head count
    pub n_kv_heads: u32,
    /// Rotation base frequency
    pub rope_theta: f32,
    /// RoPE cache size
    pub cache_size: Size3D,
}

/// Per-node attention extents
#[derive(Debug, Clone, Copy)]
pub struct MultiHeadAttSlice {
    /// First head owned by this node
    pub head_start: u32,
    /// Heads owned by this node
    pub head_len: u32,
    /// Global head count
    pub n_heads: u32,
    /// Attention scratch size (`F32 x nBatches x headLen*seqLen`)
    pub att_size: Size3D,
}

/// KV cache slice for `node` from the KV head split
pub fn slice_kv_cache(
    seq_len: u32,
    head_dim: u32,
    kv_head_split: &DimSplit,
    node: usize,
) -> KvCacheSlice {
    let kv_start = kv_head_split.starts[node] * head_dim;
    let kv_len = kv_head_split.lengths[node] * head_dim;
    KvCacheSlice {
        kv_start,
        kv_len,
        key_size: Size3D::d2(FloatType::F32, seq_len, kv_len),
        value_size: Size3D::d2(FloatType::F32, seq_len, kv_len),
    }
}

/// Row-partitioned matmul slice for `node`.
///
/// `unit` scales split entries into elements: `headDim` for head-based
/// splits, 1 for FFN/vocab splits.
pub fn slice_row_matmul(
    float_type: FloatType,
    global_in: u32,
    split: &DimSplit,
    unit: u32,
    global_out: u32,
    node: usize,
) -> RowMatmulSlice {
    let in_start = split.starts[node] * unit;
    let in_len = split.lengths[node] * unit;
    RowMatmulSlice {
        float_type,
        in_start,
        in_len,
        d0: in_len,
        n: global_in,
        size: Size3D::d2(float_type, global_in, global_out),
        slice_size: Size3D::d2(float_type, global_in, in_len),
    }
}

/// Column-partitioned matmul slice for `node`.
///
/// `global_in` is the full input dimension of the matmul (qDim for Wo, the
/// FFN dimension for W2); `unit` scales split entries into elements.
pub fn slice_col_matmul(
    float_type: FloatType,
    global_in: u32,
    split: &DimSplit,
    unit: u32,
    global_out: u32,
    node: usize,
) -> ColMatmulSlice {
    let out_start = split.starts[node] * unit;
    let out_len = split.lengths[node] * unit;
    ColMatmulSlice {
        float_type,
        out_start,
        out_len,
        n: global_in,
        n0: out_len,
        d: global_out,
        size: Size3D::d2(float_type, global_in, global_out),
        slice_size: Size3D::d2(float_type, out_len, global_out),
    }
}

/// RoPE slice for `node` from the head and KV head splits.
///
/// For the LLaMA families the rotation band spans `[kvDimStart, qDimEnd)` and
/// must have even extent; for Falcon the cache is node-local (`seqLen x
/// headDim`) with no cross-node alignment.
#[allow(clippy::too_many_arguments)]
pub fn slice_rope(
    rope_type: RopeType,
    seq_len: u32,
    global_kv_dim: u32,
    n_kv_heads: u32,
    head_dim: u32,
    rope_theta: f32,
    head_split: &DimSplit,
    kv_head_split: &DimSplit,
    node: usize,
) -> Result<RopeSlice> {
    let q_dim_start = head_split.starts[node] * head_dim;
    let q_dim_len = head_split.lengths[node] * head_dim;
    let kv_dim_start = kv_head_split.starts[node] * head_dim;
    let kv_dim_len = kv_head_split.lengths[node] * head_dim;

    let (q_shift, slice_dim, cache_size) = match rope_type {
        RopeType::Llama | RopeType::Llama31 => {
            let q_shift = q_dim_start - kv_dim_start;
            let slice_dim = (q_dim_start + q_dim_len) - kv_dim_start;
            if slice_dim % 2 != 0 {
                return Err(RepartirError::MisalignedSlice {
                    what: "rope slice dim",
                    value: slice_dim,
                    block_size: 2,
                });
            }
            (q_shift, slice_dim, Size3D::d2(FloatType::F32, seq_len, slice_dim))
        }
        RopeType::Falcon => (0, head_dim, Size3D::d2(FloatType::F32, seq_len, head_dim)),
    };

    Ok(RopeSlice {
        q_dim_start,
        q_dim_len,
        q_shift,
        kv_dim: global_kv_dim,
        kv_dim_start,
        kv_dim_len,
        slice_dim,
        seq_len,
        head_dim,
        n_kv_heads,
        rope_theta,
        cache_size,
    })
}

/// Attention slice for `node` from the head split
pub fn slice_multihead_att(
    n_batches: u32,
    global_n_heads: u32,
    seq_len: u32,
    head_split: &DimSplit,
    node: usize,
) -> MultiHeadAttSlice {
    let head_start = head_split.starts[node];
    let head_len = head_split.lengths[node];
    MultiHeadAttSlice {
        head_start,
        head_len,
        n_heads: global_n_heads,
        att_size: Size3D::d2(FloatType::F32, n_batches, head_len * seq_len),
    }
}

fn check_block_aligned(what: &'static str, value: u32, block_size: u32) -> Result<()> {
    if value % block_size != 0 {
        return Err(RepartirError::MisalignedSlice {
            what,
            value,
            block_size,
        });
    }
    Ok(())
}

/// Byte range of a row slice within the full weight tensor.
///
/// Row slices are contiguous in the file, so the loader can hand the range
/// straight out of an mmap without copying.
pub fn row_slice_byte_range(slice: &RowMatmulSlice) -> Result<(usize, usize)> {
    let block_size = slice.float_type.block_size();
    check_block_aligned("row matmul input dim", slice.n, block_size)?;
    let bytes_per_row = slice.float_type.bytes(slice.n as usize);
    Ok((
        slice.in_start as usize * bytes_per_row,
        slice.in_len as usize * bytes_per_row,
    ))
}

/// Copy this node's rows out of the full weight buffer (contiguous memcpy).
///
/// Returns the number of bytes copied.
pub fn split_row_matmul_weight(
    slice: &RowMatmulSlice,
    weight: &[u8],
    out: &mut [u8],
) -> Result<usize> {
    let (offset, len) = row_slice_byte_range(slice)?;
    out[..len].copy_from_slice(&weight[offset..offset + len]);
    Ok(len)
}

/// Gather this node's columns out of the full weight buffer (strided copy).
///
/// For each of the `d` output columns, copies the `outLen` input stripe at
/// `outStart` into the packed destination. Returns the bytes copied.
pub fn split_col_matmul_weight(
    slice: &ColMatmulSlice,
    weight: &[u8],
    out: &mut [u8],
) -> Result<usize> {
    let block_size = slice.float_type.block_size();
    check_block_aligned("col matmul out start", slice.out_start, block_size)?;
    check_block_aligned("col matmul out len", slice.out_len, block_size)?;
    check_block_aligned("col matmul input dim", slice.n, block_size)?;

    let row_bytes = slice.float_type.bytes(slice.n as usize);
    let row0_bytes = slice.float_type.bytes(slice.out_len as usize);
    let row_offset_bytes = slice.float_type.bytes(slice.out_start as usize);

    let mut copied = 0usize;
    for d in 0..slice.d as usize {
        let src = d * row_bytes + row_offset_bytes;
        let dst = d * row0_bytes;
        out[dst..dst + row0_bytes].copy_from_slice(&weight[src..src + row0_bytes]);
        copied += row0_bytes;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dim_split_sums_to_total() {
        let split = create_dim_split(1024, &[1.0, 1.0, 2.0], 32).unwrap();
        assert_eq!(split.lengths.iter().sum::<u32>(), 1024);
        assert_eq!(split.starts[0], 0);
        assert_eq!(split.starts[1], split.lengths[0]);
        assert_eq!(split.starts[2], split.lengths[0] + split.lengths[1]);
        for &len in &split.lengths[..2] {
            assert_eq!(len % 32, 0);
        }
    }

    #[test]
    fn test_dim_split_single_node() {
        let split = create_dim_split(100, &[1.0], 32).unwrap();
        assert_eq!(split.lengths, vec![100]);
        assert_eq!(split.starts, vec![0]);
    }

    #[test]
    fn test_dim_split_rejects_empty_and_zero() {
        assert!(create_dim_split(64, &[], 1).is_err());
        assert!(create_dim_split(64, &[0.0, 0.0], 1).is_err());
    }

    #[test]
    fn test_dim_split_headroom_guard() {
        // 8 units over 4 peers with align 1: everyone gets at least one
        let split = create_dim_split(8, &[1.0, 1.0, 1.0, 1.0], 1).unwrap();
        assert!(split.lengths.iter().all(|&l| l >= 1));
        assert_eq!(split.lengths.iter().sum::<u32>(), 8);
    }

    #[test]
    fn test_row_matmul_slice_geometry() {
        let split = create_dim_split(8, &[1.0, 1.0], 1).unwrap();
        // Q projection: 8 heads of dim 16, input dim 64
        let s = slice_row_matmul(FloatType::F32, 64, &split, 16, 128, 1);
        assert_eq!(s.in_start, 64);
        assert_eq!(s.in_len, 64);
        assert_eq!(s.size.n_bytes, 64 * 128 * 4);
        assert_eq!(s.slice_size.n_bytes, 64 * 64 * 4);
    }

    #[test]
    fn test_row_split_is_contiguous() {
        let split = create_dim_split(4, &[1.0, 1.0], 1).unwrap();
        let s = slice_row_matmul(FloatType::F32, 2, &split, 1, 4, 1);
        // 4 output rows x 2 f32 inputs = 32 bytes; node 1 owns rows 2..4
        let weight: Vec<u8> = (0u8..32).collect();
        let mut out = vec![0u8; 16];
        let copied = split_row_matmul_weight(&s, &weight, &mut out).unwrap();
        assert_eq!(copied, 16);
        assert_eq!(&out[..], &weight[16..32]);
    }

    #[test]
    fn test_col_split_is_strided() {
        let split = create_dim_split(4, &[1.0, 1.0], 1).unwrap();
        // 4 input cols x 3 output rows, f32; node 1 owns input cols 2..4
        let s = slice_col_matmul(FloatType::F32, 4, &split, 1, 3, 1);
        let weight: Vec<u8> = (0u8..48).collect();
        let mut out = vec![0u8; 24];
        let copied = split_col_matmul_weight(&s, &weight, &mut out).unwrap();
        assert_eq!(copied, 24);
        // each output row contributes its back half
        assert_eq!(&out[0..8], &weight[8..16]);
        assert_eq!(&out[8..16], &weight[24..32]);
        assert_eq!(&out[16..24], &weight[40..48]);
    }

    #[test]
    fn test_rope_slice_llama_even() {
        let head_split = create_dim_split(8, &[1.0, 1.0], 1).unwrap();
        let kv_split = create_dim_split(2, &[1.0, 1.0], 1).unwrap();
        let s = slice_rope(
            RopeType::Llama,
            128,
            2 * 16,
            2,
            16,
            10000.0,
            &head_split,
            &kv_split,
            1,
        )
        .unwrap();
        assert_eq!(s.q_dim_start, 64);
        assert_eq!(s.kv_dim_start, 16);
        assert_eq!(s.q_shift, 48);
        assert_eq!(s.slice_dim, 112);
        assert_eq!(s.cache_size.x, 112);
    }

    #[test]
    fn test_rope_slice_falcon_local() {
        let head_split = create_dim_split(8, &[1.0], 1).unwrap();
        let kv_split = create_dim_split(2, &[1.0], 1).unwrap();
        let s = slice_rope(
            RopeType::Falcon,
            64,
            32,
            2,
            16,
            10000.0,
            &head_split,
            &kv_split,
            0,
        )
        .unwrap();
        assert_eq!(s.cache_size.x, 16);
        assert_eq!(s.cache_size.y, 64);
    }

    #[test]
    fn test_kv_cache_slice() {
        let kv_split = create_dim_split(8, &[1.0, 3.0], 1).unwrap();
        let s = slice_kv_cache(256, 64, &kv_split, 1);
        assert_eq!(s.kv_start, kv_split.starts[1] * 64);
        assert_eq!(s.kv_len, kv_split.lengths[1] * 64);
        assert_eq!(s.key_size.y, 256);
        assert_eq!(s.key_size.x, s.kv_len);
    }

    #[test]
    fn test_misaligned_col_split_rejected() {
        let split = DimSplit {
            starts: vec![0, 48],
            lengths: vec![48, 16],
        };
        let s = slice_col_matmul(FloatType::Q40, 64, &split, 1, 4, 0);
        let weight = vec![0u8; s.size.n_bytes];
        let mut out = vec![0u8; s.slice_size.n_bytes.max(1)];
        assert!(split_col_matmul_weight(&s, &weight, &mut out).is_err());
    }
}
