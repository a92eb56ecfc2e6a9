//! # Repartir
//!
//! Distributed transformer inference over TCP: autoregressive decoding of
//! large language models across a heterogeneous cluster of machines. One
//! node takes the *root* role (token input, sampling, and the first
//! pipeline stage); the remaining *worker* nodes participate as peers in
//! tensor-parallel and pipeline-parallel execution.
//!
//! ## Architecture
//!
//! - [`plan`]: maps layers, heads, KV heads, FFN, hidden, and vocabulary
//!   dimensions over pipeline stages and TP peers from a ratios string.
//! - [`model`] + [`graph`]: compile a per-node operator DAG whose shapes
//!   match each node's slice of every tensor.
//! - [`executor`] + [`device`] + [`ops`]: a barrier thread pool walking
//!   segments and invoking `(code, quant)`-dispatched CPU kernels.
//! - [`net`] + [`sync`] + [`proto`]: TCP transport, bootstrap handshake,
//!   and the four collectives (broadcast, all-to-all slices, gather to
//!   root, pipeline send/receive).
//! - [`loader`]: memory-maps the model file and reads exactly the bytes a
//!   node owns, or (legacy) distributes slices over the transport.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod app;
pub mod chat;
pub mod cli;
pub mod device;
pub mod error;
pub mod executor;
pub mod graph;
pub mod loader;
pub mod memory;
pub mod model;
pub mod net;
pub mod ops;
pub mod plan;
pub mod proto;
pub mod quantize;
pub mod sampler;
pub mod slice;
pub mod sync;
pub mod tensor;
pub mod tokenizer;

pub use error::{RepartirError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
