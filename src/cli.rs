//! Command-line surface
//!
//! The first positional token selects the mode (`inference`, `chat`,
//! `perplexity`, `worker`); the remaining flags are shared between root and
//! worker roles. Unknown options are fatal.

use clap::{Parser, ValueEnum};

use crate::chat::ChatTemplateType;
use crate::error::{RepartirError, Result};
use crate::tensor::FloatType;

/// Run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Root: evaluate a prompt and generate tokens
    Inference,
    /// Root: interactive chat REPL
    Chat,
    /// Root: perplexity of the prompt
    Perplexity,
    /// Worker: serve a port and wait for a root
    Worker,
}

/// Distributed transformer inference over TCP
#[derive(Debug, Parser)]
#[command(name = "repartir", version, about, long_about = None)]
pub struct AppArgs {
    /// Run mode
    #[arg(value_enum)]
    pub mode: Mode,

    /// Model file
    #[arg(long)]
    pub model: Option<String>,

    /// Tokenizer file (inference/chat/perplexity)
    #[arg(long)]
    pub tokenizer: Option<String>,

    /// Input prompt
    #[arg(long)]
    pub prompt: Option<String>,

    /// Total forward steps
    #[arg(long, default_value_t = 0)]
    pub steps: u32,

    /// Thread-pool size
    #[arg(long = "nthreads", default_value_t = 1)]
    pub n_threads: u32,

    /// Worker addresses as host:port, one per worker
    #[arg(long, num_args = 1..)]
    pub workers: Vec<String>,

    /// Worker's listening port
    #[arg(long, default_value_t = 9990)]
    pub port: u16,

    /// Inter-node activation exchange format
    #[arg(long = "buffer-float-type", default_value = "f32")]
    pub buffer_float_type: String,

    /// Partition specification (stages and TP ratios)
    #[arg(long)]
    pub ratios: Option<String>,

    /// Cap on the model's sequence length (0 = keep the file's value)
    #[arg(long = "max-seq-len", default_value_t = 0)]
    pub max_seq_len: u32,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value_t = 0.8)]
    pub temperature: f32,

    /// Nucleus sampling threshold
    #[arg(long, default_value_t = 0.9)]
    pub topp: f32,

    /// Sampler seed (defaults to the wall clock)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Chat template selector (llama2, llama3, deepSeek3)
    #[arg(long = "chat-template")]
    pub chat_template: Option<String>,

    /// Enable per-node profiling (optionally 0/1)
    #[arg(long, num_args = 0..=1, default_missing_value = "1", default_value_t = 0)]
    pub benchmark: u8,

    /// GPU device index (requires a GPU build)
    #[arg(long = "gpu-index", default_value_t = -1)]
    pub gpu_index: i32,

    /// GPU segment range as from:to
    #[arg(long = "gpu-segments")]
    pub gpu_segments: Option<String>,

    /// Non-blocking sockets (1) or blocking (0)
    #[arg(long = "net-turbo", default_value_t = 1)]
    pub net_turbo: u8,

    /// Print help
    #[arg(long = "usage", action = clap::ArgAction::Help)]
    usage: Option<bool>,
}

impl AppArgs {
    /// The exchange format requested with `--buffer-float-type`
    pub fn sync_type(&self) -> Result<FloatType> {
        match self.buffer_float_type.as_str() {
            "f32" => Ok(FloatType::F32),
            "f16" => Ok(FloatType::F16),
            "q40" => Ok(FloatType::Q40),
            "q80" => Ok(FloatType::Q80),
            other => Err(RepartirError::Config(format!("Invalid float type: {other}"))),
        }
    }

    /// Worker addresses parsed into (host, port) pairs
    pub fn worker_addrs(&self) -> Result<Vec<(String, u16)>> {
        self.workers
            .iter()
            .map(|addr| {
                let (host, port) = addr.split_once(':').ok_or_else(|| {
                    RepartirError::Config(format!("Invalid worker address: {addr}"))
                })?;
                let port: u16 = port.parse().map_err(|_| {
                    RepartirError::Config(format!("Invalid worker port: {addr}"))
                })?;
                Ok((host.to_string(), port))
            })
            .collect()
    }

    /// Chat template selector, when given
    pub fn chat_template_type(&self) -> Result<Option<ChatTemplateType>> {
        self.chat_template
            .as_deref()
            .map(ChatTemplateType::parse)
            .transpose()
    }

    /// GPU segment range parsed from `from:to`
    pub fn gpu_segment_range(&self) -> Result<Option<(i32, i32)>> {
        self.gpu_segments
            .as_deref()
            .map(|value| {
                let (from, to) = value.split_once(':').ok_or_else(|| {
                    RepartirError::Config(
                        "GPU segments expected in the format <from>:<to>".to_string(),
                    )
                })?;
                let from: i32 = from
                    .parse()
                    .map_err(|_| RepartirError::Config("Bad GPU segment start".to_string()))?;
                let to: i32 = to
                    .parse()
                    .map_err(|_| RepartirError::Config("Bad GPU segment end".to_string()))?;
                Ok((from, to))
            })
            .transpose()
    }

    /// The effective sampler seed
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_secs())
        })
    }

    /// Whether profiling is on
    pub fn benchmark_enabled(&self) -> bool {
        self.benchmark != 0
    }

    /// Whether turbo sockets are requested
    pub fn net_turbo_enabled(&self) -> bool {
        self.net_turbo != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AppArgs {
        AppArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_mode_and_defaults() {
        let args = parse(&["repartir", "inference", "--model", "m.bin"]);
        assert_eq!(args.mode, Mode::Inference);
        assert_eq!(args.n_threads, 1);
        assert_eq!(args.port, 9990);
        assert!(args.net_turbo_enabled());
        assert!(!args.benchmark_enabled());
    }

    #[test]
    fn test_variadic_workers() {
        let args = parse(&[
            "repartir",
            "inference",
            "--workers",
            "10.0.0.1:9990",
            "10.0.0.2:9991",
            "--steps",
            "16",
        ]);
        let addrs = args.worker_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1], ("10.0.0.2".to_string(), 9991));
        assert_eq!(args.steps, 16);
    }

    #[test]
    fn test_bad_worker_address() {
        let args = parse(&["repartir", "inference", "--workers", "nocolon"]);
        assert!(args.worker_addrs().is_err());
    }

    #[test]
    fn test_buffer_float_type() {
        let args = parse(&["repartir", "worker", "--buffer-float-type", "q80"]);
        assert_eq!(args.sync_type().unwrap(), FloatType::Q80);
        let bad = parse(&["repartir", "worker", "--buffer-float-type", "i8"]);
        assert!(bad.sync_type().is_err());
    }

    #[test]
    fn test_benchmark_forms() {
        let flag = parse(&["repartir", "worker", "--benchmark"]);
        assert!(flag.benchmark_enabled());
        let explicit = parse(&["repartir", "worker", "--benchmark", "0"]);
        assert!(!explicit.benchmark_enabled());
    }

    #[test]
    fn test_gpu_segments() {
        let args = parse(&["repartir", "inference", "--gpu-segments", "2:5"]);
        assert_eq!(args.gpu_segment_range().unwrap(), Some((2, 5)));
        let bad = parse(&["repartir", "inference", "--gpu-segments", "25"]);
        assert!(bad.gpu_segment_range().is_err());
    }

    #[test]
    fn test_unknown_option_is_fatal() {
        assert!(AppArgs::try_parse_from(["repartir", "inference", "--bogus"]).is_err());
    }
}
