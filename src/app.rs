//! Application runtimes
//!
//! Wires the planner, graph builder, executor, transport, and loader into
//! the root and worker programs. The root drives forwards with control
//! packets and samples from the gathered logits; workers loop on control
//! packets and fall back to listening when a run ends or the transport
//! fails.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Instant;

use crate::chat::{ChatItem, ChatTemplateGenerator, ChatTemplateType};
use crate::cli::AppArgs;
use crate::device::CpuDevice;
use crate::error::{RepartirError, Result};
use crate::executor::{
    Executor, ExecutorDevice, FakeNodeSynchronizer, NetExecution, NodeSynchronizer, StepType,
};
use crate::loader::{distribute_weights_root, load_weights_local, receive_weights_worker};
use crate::model::{build_llm_net, LlmHeader, LlmNet};
use crate::net::{Network, ROOT_SOCKET_INDEX};
use crate::ops::softmax_f32;
use crate::plan::{
    create_partition_plan, opaque_uniform_plan, parse_stage_defs, uniform_plan, PartitionPlan,
};
use crate::proto::{
    read_net_config, read_node_config, write_net_config, write_node_config, BootstrapPacket,
    ControlPacket, PerfPacket, CTRL_PROFILE,
};
use crate::sampler::Sampler;
use crate::sync::NetworkSynchronizer;
use crate::tensor::FloatType;
use crate::tokenizer::Tokenizer;

/// Batch capacity of every pipe (prompt evaluation runs up to this many
/// positions per forward)
pub const N_BATCHES: u32 = 32;

/// Spin attempts for the worker's non-blocking control-packet poll
const CONTROL_READ_MAX_ATTEMPTS: u64 = 10_000;

fn build_plan(args_ratios: Option<&str>, n_nodes: u32, h: &LlmHeader) -> Result<PartitionPlan> {
    match args_ratios {
        Some(ratios) => {
            let defs = parse_stage_defs(ratios, n_nodes, h.n_layers)?;
            create_partition_plan(
                &defs,
                h.n_layers,
                h.n_heads,
                h.n_kv_heads,
                h.vocab_size,
                h.ffn_dim(),
                h.dim,
            )
        }
        None => uniform_plan(
            n_nodes,
            h.n_layers,
            h.n_heads,
            h.n_kv_heads,
            h.vocab_size,
            h.ffn_dim(),
            h.dim,
        ),
    }
}

fn resolve_devices(
    args: &AppArgs,
    net: &LlmNet,
    node_index: u32,
    execution: &NetExecution,
) -> Result<Vec<ExecutorDevice>> {
    if args.gpu_index >= 0 {
        return Err(RepartirError::Config(
            "This build does not support GPU devices".to_string(),
        ));
    }
    let device = CpuDevice::new(
        &net.net_config,
        &net.node_configs[node_index as usize],
        execution,
    )?;
    Ok(vec![ExecutorDevice::unbounded(device)])
}

fn resolve_worker_devices(
    args: &AppArgs,
    net_config: &crate::graph::NetConfig,
    node_config: &crate::graph::NodeConfig,
    execution: &NetExecution,
) -> Result<Vec<ExecutorDevice>> {
    if args.gpu_index >= 0 {
        return Err(RepartirError::Config(
            "This build does not support GPU devices".to_string(),
        ));
    }
    let device = CpuDevice::new(net_config, node_config, execution)?;
    Ok(vec![ExecutorDevice::unbounded(device)])
}

/// Root-side inference driver: owns the executor and the control plane
pub struct RootInference {
    execution: Arc<NetExecution>,
    executor: Executor,
    network: Option<Arc<Network>>,
    plan: Arc<PartitionPlan>,
    control: ControlPacket,
    profile: bool,
    seq_len: u32,
    position_pipe: u32,
    token_pipe: u32,
    logits_pipe: u32,
    vocab_size: u32,
    last_perf: Vec<PerfPacket>,
}

impl RootInference {
    fn new(
        net: &LlmNet,
        execution: Arc<NetExecution>,
        executor: Executor,
        network: Option<Arc<Network>>,
        profile: bool,
    ) -> Self {
        RootInference {
            execution,
            executor,
            network,
            plan: Arc::clone(&net.plan),
            control: ControlPacket {
                position: 0,
                batch_size: 0,
                flags: if profile { CTRL_PROFILE } else { 0 },
            },
            profile,
            seq_len: net.header.seq_len,
            position_pipe: net.position_pipe,
            token_pipe: net.token_pipe,
            logits_pipe: net.logits_pipe,
            vocab_size: net.header.vocab_size,
            last_perf: Vec::new(),
        }
    }

    /// Set the batch size of the next forward
    pub fn set_batch_size(&mut self, batch_size: u32) {
        self.execution.set_batch_size(batch_size);
        self.control.batch_size = batch_size;
    }

    /// Set the position of the first batch row (rows step by one)
    pub fn set_position(&mut self, position: u32) {
        assert!(position + self.control.batch_size <= self.seq_len);
        self.control.position = position;
        let positions = self.execution.pipe_f32(self.position_pipe);
        for i in 0..self.control.batch_size {
            positions[i as usize] = (position + i) as f32;
        }
    }

    /// Set the input token of one batch row
    pub fn set_token(&mut self, batch_index: u32, token: u32) {
        self.execution.pipe_f32(self.token_pipe)[batch_index as usize] = token as f32;
    }

    /// Run one forward; collects worker perf packets when profiling
    pub fn forward(&mut self) -> Result<()> {
        if let Some(network) = &self.network {
            network.write_all(&self.control.encode())?;
        }
        self.executor.forward()?;

        if !self.profile {
            return Ok(());
        }
        self.last_perf.clear();
        self.last_perf.push(PerfPacket {
            position: self.control.position,
            batch_size: self.control.batch_size,
            node_index: 0,
            stage_index: self.plan.stage_index_for_node(0),
            exec_us: self.executor.total_time(StepType::ExecuteOp),
            sync_us: self.executor.total_time(StepType::SyncNodes),
        });
        if let Some(network) = &self.network {
            for socket in 0..network.n_sockets() {
                let mut bytes = [0u8; PerfPacket::BYTES];
                network.read(socket, &mut bytes)?;
                self.last_perf.push(PerfPacket::decode(&bytes));
            }
        }
        Ok(())
    }

    /// Send the stop packet to every worker
    pub fn finish(&mut self) -> Result<()> {
        if let Some(network) = &self.network {
            // Stop packet: position is meaningless when batchSize == 0.
            let stop = ControlPacket { position: 0, batch_size: 0, flags: self.control.flags };
            network.write_all(&stop.encode())?;
        }
        Ok(())
    }

    /// Logits of batch row 0 after a forward
    pub fn logits(&mut self) -> &mut [f32] {
        &mut self.execution.pipe_f32(self.logits_pipe)[..self.vocab_size as usize]
    }

    /// Per-node timing of the last forward (profiling runs only)
    pub fn last_perf(&self) -> &[PerfPacket] {
        &self.last_perf
    }

    /// Executor time of the last forward in a bucket
    pub fn step_time(&self, step: StepType) -> u32 {
        self.executor.total_time(step)
    }

    /// Drain transport byte counters
    pub fn net_stats(&self) -> (u64, u64) {
        self.network.as_ref().map_or((0, 0), |n| n.take_stats())
    }
}

/// Everything an inference-mode handler needs
pub struct AppInferenceContext<'a> {
    /// Parsed CLI arguments
    pub args: &'a AppArgs,
    /// Model header
    pub header: &'a LlmHeader,
    /// Root inference driver
    pub inference: &'a mut RootInference,
    /// Tokenizer
    pub tokenizer: &'a Tokenizer,
    /// Sampler
    pub sampler: &'a mut Sampler,
}

/// Run the root program: bootstrap the cluster, load weights, hand control
/// to the mode handler, then stop the workers.
pub fn run_inference_app(
    args: &AppArgs,
    handler: fn(&mut AppInferenceContext<'_>) -> Result<()>,
) -> Result<()> {
    let model_path = args
        .model
        .as_deref()
        .ok_or_else(|| RepartirError::Config("--model is required".to_string()))?;
    let tokenizer_path = args
        .tokenizer
        .as_deref()
        .ok_or_else(|| RepartirError::Config("--tokenizer is required".to_string()))?;
    let sync_type = args.sync_type()?;
    let worker_addrs = args.worker_addrs()?;
    let n_nodes = worker_addrs.len() as u32 + 1;

    let header = LlmHeader::load(model_path, args.max_seq_len, sync_type)?;
    header.log_summary();
    if n_nodes > header.n_kv_heads {
        return Err(RepartirError::Config(format!(
            "More nodes ({}) than KV heads ({}) is not supported",
            n_nodes, header.n_kv_heads
        )));
    }

    let tokenizer = Tokenizer::load(tokenizer_path)?;
    if tokenizer.vocab_size != header.vocab_size {
        tracing::warn!(
            tokenizer_vocab = tokenizer.vocab_size,
            model_vocab = header.vocab_size,
            "tokenizer vocab size does not match the model"
        );
    }
    let mut sampler = Sampler::new(
        header.vocab_size as usize,
        args.temperature,
        args.topp,
        args.effective_seed(),
    );

    let plan = Arc::new(build_plan(args.ratios.as_deref(), n_nodes, &header)?);
    if args.ratios.is_some() {
        tracing::info!(ratios = args.ratios.as_deref().unwrap_or(""), "uneven partitioning");
        for stage in &plan.stages {
            tracing::info!(
                stage = stage.stage_index,
                layers = format!("{}..{}", stage.start_layer, stage.end_layer),
                nodes = ?stage.node_indices,
                "stage"
            );
        }
    }
    let net = build_llm_net(&header, n_nodes, N_BATCHES, Arc::clone(&plan))?;

    let execution = Arc::new(NetExecution::new(&net.net_config));
    let network = if n_nodes > 1 {
        Some(Arc::new(Network::connect(&worker_addrs)?))
    } else {
        None
    };

    let synchronizer: Arc<dyn NodeSynchronizer> = match &network {
        Some(network) => {
            // Bootstrap settings so workers need no CLI beyond --port.
            let boot = BootstrapPacket {
                benchmark_enabled: args.benchmark_enabled(),
                max_seq_len: args.max_seq_len,
                sync_type,
                model_path: Some(model_path.to_string()),
                ratios: args.ratios.clone(),
            };
            for socket in 0..network.n_sockets() {
                boot.write(network, socket)?;
            }
            Arc::new(NetworkSynchronizer::new(
                Arc::clone(network),
                Arc::clone(&execution),
                net.net_config.clone(),
                0,
                Arc::clone(&plan),
            ))
        }
        None => Arc::new(FakeNodeSynchronizer),
    };

    if let Some(network) = &network {
        for (worker, socket) in (1..n_nodes).zip(0..) {
            write_net_config(network, socket, &net.net_config)?;
            write_node_config(network, socket, &net.node_configs[worker as usize])?;
        }
    }

    let devices = resolve_devices(args, &net, 0, &execution)?;
    let executor = Executor::new(
        &net.net_config,
        &net.node_configs[0],
        devices,
        Arc::clone(&execution),
        synchronizer,
        args.n_threads,
    )?;

    if args.ratios.is_some() || n_nodes == 1 {
        load_weights_local(model_path, &net, &executor, 0)?;
    } else {
        let network = network.as_ref().expect("multi-node without network");
        distribute_weights_root(model_path, &net, &executor, network)?;
    }

    if let Some(network) = &network {
        network.take_stats();
        if args.net_turbo_enabled() {
            network.set_turbo(true)?;
            tracing::info!("network is in non-blocking mode");
        }
    }

    let mut inference = RootInference::new(
        &net,
        execution,
        executor,
        network,
        args.benchmark_enabled(),
    );
    let result = {
        let mut context = AppInferenceContext {
            args,
            header: &header,
            inference: &mut inference,
            tokenizer: &tokenizer,
            sampler: &mut sampler,
        };
        handler(&mut context)
    };
    inference.finish()?;
    result
}

/// Worker-side control-packet reader
struct WorkerControl {
    control: ControlPacket,
    is_finished: bool,
}

impl WorkerControl {
    /// Poll for the next control packet; applies positions and batch size
    /// when one arrives.
    fn try_read(
        &mut self,
        network: &Network,
        execution: &NetExecution,
        position_pipe: u32,
    ) -> Result<bool> {
        let mut bytes = [0u8; ControlPacket::BYTES];
        if !network.try_read_with_max_attempts(
            ROOT_SOCKET_INDEX,
            &mut bytes,
            CONTROL_READ_MAX_ATTEMPTS,
        )? {
            return Ok(false);
        }
        self.control = ControlPacket::decode(&bytes);
        if self.control.is_stop() {
            // Stop packet: position is ignored.
            tracing::info!("stop packet received");
            self.is_finished = true;
            return Ok(true);
        }
        let positions = execution.pipe_f32(position_pipe);
        for i in 0..self.control.batch_size {
            positions[i as usize] = (self.control.position + i) as f32;
        }
        execution.set_batch_size(self.control.batch_size);
        Ok(true)
    }
}

/// Run the worker program: serve the port, run inference loops, and return
/// to listening whenever a run ends.
pub fn run_worker_app(args: &AppArgs) -> Result<()> {
    loop {
        let network = Arc::new(Network::serve(args.port)?);
        if let Err(e) = run_worker_session(args, &network) {
            if e.is_transport() {
                tracing::warn!(error = %e, "network error; returning to listen");
                continue;
            }
            return Err(e);
        }
    }
}

fn run_worker_session(args: &AppArgs, network: &Arc<Network>) -> Result<()> {
    let boot = BootstrapPacket::read(network)?;
    let net_config = read_net_config(network)?;

    let use_local_loading = boot.model_path.is_some() && boot.ratios.is_some();
    let (plan, local_header) = if use_local_loading {
        let path = boot.model_path.as_deref().expect("model path");
        let mut header = LlmHeader::load(path, boot.max_seq_len, boot.sync_type)?;
        // Q40 weights exchange activations as Q80.
        if header.weight_type == FloatType::Q40 && header.sync_type != FloatType::Q80 {
            header.sync_type = FloatType::Q80;
        }
        let ratios = boot.ratios.as_deref().expect("ratios");
        let defs = parse_stage_defs(ratios, net_config.n_nodes, header.n_layers)?;
        let plan = create_partition_plan(
            &defs,
            header.n_layers,
            header.n_heads,
            header.n_kv_heads,
            header.vocab_size,
            header.ffn_dim(),
            header.dim,
        )?;
        (Arc::new(plan), Some(header))
    } else {
        (Arc::new(opaque_uniform_plan(net_config.n_nodes)), None)
    };

    let node_config = read_node_config(network, Arc::clone(&plan))?;
    let node_index = node_config.node_index;
    tracing::info!(node = node_index, "configuration received");

    let execution = Arc::new(NetExecution::new(&net_config));
    let devices = resolve_worker_devices(args, &net_config, &node_config, &execution)?;
    let synchronizer: Arc<dyn NodeSynchronizer> = Arc::new(NetworkSynchronizer::new(
        Arc::clone(network),
        Arc::clone(&execution),
        net_config.clone(),
        node_index,
        Arc::clone(&plan),
    ));
    let executor = Executor::new(
        &net_config,
        &node_config,
        devices,
        Arc::clone(&execution),
        synchronizer,
        args.n_threads,
    )?;

    if use_local_loading {
        let header = local_header.expect("header in local mode");
        let path = boot.model_path.as_deref().expect("model path");
        // A throwaway net supplies the tensor sizes for the loader walk.
        let temp_net = build_llm_net(&header, net_config.n_nodes, 1, Arc::clone(&plan))?;
        load_weights_local(path, &temp_net, &executor, node_index)?;
    } else {
        receive_weights_worker(&executor, network)?;
    }

    let position_pipe = net_config.pre_syncs.first().copied().unwrap_or(0);
    let mut control = WorkerControl {
        control: ControlPacket::default(),
        is_finished: false,
    };
    let mut is_first_attempt = true;
    let mut turbo_enabled = false;
    let mut idle_since = Instant::now();

    loop {
        if is_first_attempt {
            idle_since = Instant::now();
        }
        if !control.try_read(network, &execution, position_pipe)? {
            // Turbo sockets spin; fall back to blocking after a second idle.
            if turbo_enabled && !is_first_attempt && idle_since.elapsed().as_secs() >= 1 {
                network.set_turbo(false)?;
                turbo_enabled = false;
                tracing::info!("network is in blocking mode");
            }
            is_first_attempt = false;
            continue;
        }
        if control.is_finished {
            return Ok(());
        }
        if args.net_turbo_enabled() && !turbo_enabled {
            network.set_turbo(true)?;
            turbo_enabled = true;
            tracing::info!("network is in non-blocking mode");
        }

        executor.forward()?;

        // Root blocks on these when profiling is on, so reply whenever the
        // control packet requests it even if this worker wasn't started with
        // --benchmark.
        if control.control.flags & CTRL_PROFILE != 0 {
            let perf = PerfPacket {
                position: control.control.position,
                batch_size: control.control.batch_size,
                node_index,
                stage_index: plan.stage_index_for_node(node_index),
                exec_us: executor.total_time(StepType::ExecuteOp),
                sync_us: executor.total_time(StepType::SyncNodes),
            };
            network.write(ROOT_SOCKET_INDEX, &perf.encode())?;
        }
        is_first_attempt = true;
    }
}

// ---------------------------------------------------------------------------
// Mode handlers
// ---------------------------------------------------------------------------

#[derive(Default, Clone, Copy)]
struct NodePerfAgg {
    exec_us: u64,
    sync_us: u64,
    forwards: u64,
    tokens: u64,
    stage_index: u32,
}

fn aggregate_perf(agg: &mut [NodePerfAgg], perf: &[PerfPacket]) {
    for p in perf {
        let Some(slot) = agg.get_mut(p.node_index as usize) else {
            continue;
        };
        slot.exec_us += u64::from(p.exec_us);
        slot.sync_us += u64::from(p.sync_us);
        slot.forwards += 1;
        slot.tokens += u64::from(p.batch_size.max(1));
        slot.stage_index = p.stage_index;
    }
}

fn print_perf_summary(agg: &[NodePerfAgg]) {
    println!();
    println!("Stage/node profile");
    for (node, a) in agg.iter().enumerate() {
        if a.forwards == 0 || a.tokens == 0 {
            continue;
        }
        let per_fwd_exec = a.exec_us as f64 / 1000.0 / a.forwards as f64;
        let per_fwd_sync = a.sync_us as f64 / 1000.0 / a.forwards as f64;
        let per_tok_exec = a.exec_us as f64 / 1000.0 / a.tokens as f64;
        let per_tok_sync = a.sync_us as f64 / 1000.0 / a.tokens as f64;
        println!(
            "  stage {} node {}: per-fwd {:6.2} ms (exec {:6.2} sync {:6.2}) | per-tok {:6.2} ms (exec {:6.2} sync {:6.2})",
            a.stage_index,
            node,
            per_fwd_exec + per_fwd_sync,
            per_fwd_exec,
            per_fwd_sync,
            per_tok_exec + per_tok_sync,
            per_tok_exec,
            per_tok_sync,
        );
    }
}

/// `inference` mode: evaluate the prompt in batches, then generate
pub fn handle_inference(context: &mut AppInferenceContext<'_>) -> Result<()> {
    let prompt = context
        .args
        .prompt
        .as_deref()
        .ok_or_else(|| RepartirError::Config("--prompt is required".to_string()))?;
    if context.args.steps == 0 {
        return Err(RepartirError::Config("--steps is required".to_string()));
    }

    let input_tokens = context.tokenizer.encode(prompt, true)?;
    let n_input = input_tokens.len() as u32;
    if n_input > context.header.seq_len {
        return Err(RepartirError::Config(
            "The prompt is longer than the sequence length".to_string(),
        ));
    }
    if n_input > context.args.steps {
        return Err(RepartirError::Config(
            "The prompt is longer than the requested steps".to_string(),
        ));
    }

    let n_nodes = context.inference.plan.n_nodes;
    let mut perf_agg = vec![NodePerfAgg::default(); n_nodes as usize];
    let profile = context.args.benchmark_enabled();

    println!("{prompt}");
    let mut pos = 0u32;
    let mut eval_total_us = 0u64;

    // Evaluate the prompt except its last token.
    while pos + 1 < n_input {
        let batch_size = (n_input - 1 - pos).min(N_BATCHES);
        context.inference.set_batch_size(batch_size);
        context.inference.set_position(pos);
        for i in 0..batch_size {
            context.inference.set_token(i, input_tokens[(pos + i) as usize]);
        }
        context.inference.forward()?;
        if profile {
            aggregate_perf(&mut perf_agg, context.inference.last_perf());
        }

        pos += batch_size;
        let eval_us = context.inference.step_time(StepType::ExecuteOp);
        let sync_us = context.inference.step_time(StepType::SyncNodes);
        let (sent, recv) = context.inference.net_stats();
        println!(
            "eval {:4} ms sync {:4} ms | sent {:5} kB recv {:5} kB | ({} tokens)",
            eval_us / 1000,
            sync_us / 1000,
            sent / 1024,
            recv / 1024,
            batch_size
        );
        eval_total_us += u64::from(eval_us) + u64::from(sync_us);
    }

    // Generation starts from the prompt's last token.
    let mut token = input_tokens[(n_input - 1) as usize];
    let mut pred_total_us = 0u64;
    context.inference.set_batch_size(1);

    let max_pos = context.header.seq_len.min(context.args.steps);
    let n_eval_tokens = n_input - 1;
    while pos < max_pos {
        context.inference.set_position(pos);
        context.inference.set_token(0, token);
        context.inference.forward()?;
        if profile {
            aggregate_perf(&mut perf_agg, context.inference.last_perf());
        }

        token = context.sampler.sample(context.inference.logits());
        let piece = context.tokenizer.decode(token).to_string();

        let pred_us = context.inference.step_time(StepType::ExecuteOp);
        let sync_us = context.inference.step_time(StepType::SyncNodes);
        let (sent, recv) = context.inference.net_stats();
        println!(
            "pred {:4} ms sync {:4} ms | sent {:5} kB recv {:5} kB | {piece}",
            pred_us / 1000,
            sync_us / 1000,
            sent / 1024,
            recv / 1024
        );
        pred_total_us += u64::from(pred_us) + u64::from(sync_us);
        pos += 1;
    }

    let n_pred_tokens = pos - n_eval_tokens;
    println!();
    println!("Evaluation");
    println!("   nBatches: {N_BATCHES}");
    println!("    nTokens: {n_eval_tokens}");
    if eval_total_us > 0 {
        println!(
            "   tokens/s: {:.2} ({:.2} ms/tok)",
            n_eval_tokens as f64 * 1_000_000.0 / eval_total_us as f64,
            eval_total_us as f64 / 1000.0 / f64::from(n_eval_tokens.max(1)),
        );
    }
    println!("Prediction");
    println!("    nTokens: {n_pred_tokens}");
    if pred_total_us > 0 {
        println!(
            "   tokens/s: {:.2} ({:.2} ms/tok)",
            n_pred_tokens as f64 * 1_000_000.0 / pred_total_us as f64,
            pred_total_us as f64 / 1000.0 / f64::from(n_pred_tokens.max(1)),
        );
    }
    if profile {
        print_perf_summary(&perf_agg);
    }
    Ok(())
}

/// `perplexity` mode: log-probability of the prompt under the model
pub fn handle_perplexity(context: &mut AppInferenceContext<'_>) -> Result<()> {
    let prompt = context
        .args
        .prompt
        .as_deref()
        .ok_or_else(|| RepartirError::Config("--prompt is required".to_string()))?;
    let input_tokens = context.tokenizer.encode(prompt, true)?;
    if input_tokens.len() < 2 {
        return Err(RepartirError::Config(
            "Perplexity needs at least two prompt tokens".to_string(),
        ));
    }
    println!("Evaluating {} tokens...", input_tokens.len());

    let mut total_log_prob = 0.0f64;
    context.inference.set_batch_size(1);

    for pos in 0..input_tokens.len() - 1 {
        context.inference.set_position(pos as u32);
        context.inference.set_token(0, input_tokens[pos]);
        context.inference.forward()?;

        let logits = context.inference.logits();
        softmax_f32(logits);
        let prob = logits[input_tokens[pos + 1] as usize].max(1e-30);
        total_log_prob += f64::from(prob.ln());
        println!("{:5} / {}, prob={prob}", pos + 1, input_tokens.len() - 1);
    }

    let avg_log_prob = total_log_prob / (input_tokens.len() - 1) as f64;
    let perplexity = (-avg_log_prob).exp();
    println!();
    println!("Results");
    println!("   perplexity: {perplexity:.6} (lower = better)");
    println!("   avgLogProb: {avg_log_prob:.6}");
    println!("   bitPerToken: {:.6}", -avg_log_prob / std::f64::consts::LN_2);
    Ok(())
}

fn read_stdin(guide: &str) -> Result<String> {
    print!("{guide}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// `chat` mode: interactive REPL with chat-template framing
pub fn handle_chat(context: &mut AppInferenceContext<'_>) -> Result<()> {
    let template = context
        .args
        .chat_template_type()?
        .unwrap_or(ChatTemplateType::Llama3);
    let generator = ChatTemplateGenerator::new(template);
    let seq_len = context.header.seq_len;

    let system_prompt = read_stdin("System prompt (optional): ")?;
    let mut delta_items: Vec<ChatItem> = Vec::new();
    if !system_prompt.is_empty() {
        delta_items.push(ChatItem::new("system", &system_prompt));
    }

    let mut pos = 0u32;
    while pos < seq_len {
        let mut user_prompt = String::new();
        while user_prompt.is_empty() {
            user_prompt = read_stdin("\nUser\n> ")?;
        }
        delta_items.push(ChatItem::new("user", &user_prompt));

        let rendered = generator.generate(&delta_items, true);
        let input_tokens = context.tokenizer.encode(&rendered, pos == 0)?;
        let n_input = input_tokens.len() as u32;
        let prompt_end = seq_len.min(pos + n_input - 1);

        let mut consumed = 0u32;
        while pos < prompt_end {
            let batch_size = (prompt_end - pos).min(N_BATCHES);
            context.inference.set_batch_size(batch_size);
            context.inference.set_position(pos);
            for i in 0..batch_size {
                context
                    .inference
                    .set_token(i, input_tokens[(consumed + i) as usize]);
            }
            context.inference.forward()?;
            consumed += batch_size;
            pos += batch_size;
        }

        let mut token = input_tokens[(n_input - 1).min(consumed) as usize];
        context.inference.set_batch_size(1);
        println!("\nAssistant");
        while pos < seq_len {
            context.inference.set_position(pos);
            context.inference.set_token(0, token);
            context.inference.forward()?;
            token = context.sampler.sample(context.inference.logits());
            pos += 1;
            if context.tokenizer.is_eos(token) {
                break;
            }
            print!("{}", context.tokenizer.decode(token));
            std::io::stdout().flush()?;
        }
        println!();
        delta_items.clear();
    }
    println!("(end of context)");
    Ok(())
}
