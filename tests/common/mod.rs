//! Shared test support: synthetic model files in the engine's format.

use std::io::Write;
use std::path::Path;

/// Header key codes of the model format (kept in sync with the parser).
const VERSION: u32 = 0;
const ARCH_TYPE: u32 = 1;
const DIM: u32 = 2;
const HIDDEN_DIM: u32 = 3;
const N_LAYERS: u32 = 4;
const N_HEADS: u32 = 5;
const N_KV_HEADS: u32 = 6;
const VOCAB_SIZE: u32 = 9;
const SEQ_LEN: u32 = 10;
const HIDDEN_ACT: u32 = 11;
const ROPE_THETA: u32 = 12;
const WEIGHT_FLOAT_TYPE: u32 = 13;
const ROPE_TYPE: u32 = 18;
const HEAD_DIM: u32 = 19;
const NORM_EPSILON: u32 = 20;

const ARCH_LLAMA: u32 = 0x00AB_CD00;

/// Shape of a synthetic test model (dense LLaMA-style, F32 weights)
#[derive(Clone, Copy)]
pub struct TestModel {
    pub dim: u32,
    pub hidden_dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub vocab_size: u32,
    pub seq_len: u32,
    pub head_dim: u32,
}

impl TestModel {
    pub fn small() -> TestModel {
        TestModel {
            dim: 64,
            hidden_dim: 128,
            n_layers: 4,
            n_heads: 4,
            n_kv_heads: 4,
            vocab_size: 96,
            seq_len: 32,
            head_dim: 16,
        }
    }

    pub fn q_dim(&self) -> u32 {
        self.head_dim * self.n_heads
    }

    pub fn kv_dim(&self) -> u32 {
        self.head_dim * self.n_kv_heads
    }
}

/// Deterministic pseudo-random weight value for element `i` of tensor `salt`
pub fn weight_value(salt: u64, i: u64) -> f32 {
    let h = (salt.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(i))
        .wrapping_mul(0xBF58_476D_1CE4_E5B9);
    ((h >> 40) as u32 % 4001) as f32 / 20_000.0 - 0.1
}

fn push_tensor(out: &mut Vec<u8>, salt: u64, n: usize) {
    for i in 0..n {
        out.extend_from_slice(&weight_value(salt, i as u64).to_le_bytes());
    }
}

fn push_ones(out: &mut Vec<u8>, n: usize) {
    for _ in 0..n {
        out.extend_from_slice(&1.0f32.to_le_bytes());
    }
}

/// Serialize a complete model file (header + weights in the loader's walk
/// order) and return its bytes.
pub fn model_file_bytes(m: &TestModel) -> Vec<u8> {
    let pairs: Vec<(u32, i32)> = vec![
        (VERSION, 1),
        (ARCH_TYPE, ARCH_LLAMA as i32),
        (DIM, m.dim as i32),
        (HIDDEN_DIM, m.hidden_dim as i32),
        (N_LAYERS, m.n_layers as i32),
        (N_HEADS, m.n_heads as i32),
        (N_KV_HEADS, m.n_kv_heads as i32),
        (VOCAB_SIZE, m.vocab_size as i32),
        (SEQ_LEN, m.seq_len as i32),
        (HIDDEN_ACT, 1),
        (ROPE_THETA, 10_000),
        (WEIGHT_FLOAT_TYPE, 0),
        (ROPE_TYPE, 0),
        (HEAD_DIM, m.head_dim as i32),
        (NORM_EPSILON, 5),
    ];
    let header_size = 8 + pairs.len() * 8;

    let mut out = Vec::new();
    out.extend_from_slice(&0x0A00_ABCDu32.to_le_bytes());
    out.extend_from_slice(&(header_size as u32).to_le_bytes());
    for (key, value) in pairs {
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }

    let dim = m.dim as usize;
    let q_dim = m.q_dim() as usize;
    let kv_dim = m.kv_dim() as usize;
    let hidden = m.hidden_dim as usize;
    let vocab = m.vocab_size as usize;

    push_tensor(&mut out, 1, vocab * dim); // embedding
    for layer in 0..m.n_layers as u64 {
        let salt = 100 + layer * 10;
        push_tensor(&mut out, salt + 1, dim * q_dim); // q
        push_tensor(&mut out, salt + 2, dim * kv_dim); // k
        push_tensor(&mut out, salt + 3, dim * kv_dim); // v
        push_tensor(&mut out, salt + 4, q_dim * dim); // wo
        push_tensor(&mut out, salt + 5, dim * hidden); // w1
        push_tensor(&mut out, salt + 6, hidden * dim); // w2
        push_tensor(&mut out, salt + 7, dim * hidden); // w3
        push_ones(&mut out, dim); // norm_0
        push_ones(&mut out, dim); // norm_1
    }
    push_ones(&mut out, dim); // final norm
    push_tensor(&mut out, 2, dim * vocab); // classifier
    out
}

/// Write a model file into `dir` and return its path.
pub fn write_model_file(dir: &Path, m: &TestModel) -> std::path::PathBuf {
    let path = dir.join("model.bin");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&model_file_bytes(m)).unwrap();
    path
}
