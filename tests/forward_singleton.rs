//! Single-node end-to-end forwards: logits are finite, deterministic across
//! runs, and independent of the thread count.

mod common;

use std::sync::Arc;

use common::{write_model_file, TestModel};
use repartir::device::CpuDevice;
use repartir::executor::{Executor, ExecutorDevice, FakeNodeSynchronizer, NetExecution};
use repartir::loader::load_weights_local;
use repartir::model::{build_llm_net, LlmHeader, LlmNet};
use repartir::plan::uniform_plan;
use repartir::tensor::FloatType;

struct Stack {
    net: LlmNet,
    execution: Arc<NetExecution>,
    executor: Executor,
}

fn build_stack(path: &str, n_threads: u32) -> Stack {
    let header = LlmHeader::load(path, 0, FloatType::F32).unwrap();
    let plan = uniform_plan(
        1,
        header.n_layers,
        header.n_heads,
        header.n_kv_heads,
        header.vocab_size,
        header.hidden_dim,
        header.dim,
    )
    .unwrap();
    let net = build_llm_net(&header, 1, 4, Arc::new(plan)).unwrap();
    let execution = Arc::new(NetExecution::new(&net.net_config));
    let device = CpuDevice::new(&net.net_config, &net.node_configs[0], &execution).unwrap();
    let executor = Executor::new(
        &net.net_config,
        &net.node_configs[0],
        vec![ExecutorDevice::unbounded(device)],
        Arc::clone(&execution),
        Arc::new(FakeNodeSynchronizer),
        n_threads,
    )
    .unwrap();
    load_weights_local(path, &net, &executor, 0).unwrap();
    Stack { net, execution, executor }
}

fn forward_tokens(stack: &Stack, tokens: &[u32]) -> Vec<f32> {
    let vocab = stack.net.header.vocab_size as usize;
    let mut logits = Vec::new();
    for (pos, &token) in tokens.iter().enumerate() {
        stack.execution.set_batch_size(1);
        stack.execution.pipe_f32(stack.net.position_pipe)[0] = pos as f32;
        stack.execution.pipe_f32(stack.net.token_pipe)[0] = token as f32;
        stack.executor.forward().unwrap();
        logits = stack.execution.pipe_f32(stack.net.logits_pipe)[..vocab].to_vec();
    }
    logits
}

#[test]
fn logits_are_finite_and_responsive() {
    let dir = tempfile::tempdir().unwrap();
    let model = TestModel::small();
    let path = write_model_file(dir.path(), &model);
    let stack = build_stack(path.to_str().unwrap(), 1);

    let logits_a = forward_tokens(&stack, &[3]);
    assert_eq!(logits_a.len(), 96);
    assert!(logits_a.iter().all(|v| v.is_finite()));

    // A different token produces different logits.
    let stack2 = build_stack(path.to_str().unwrap(), 1);
    let logits_b = forward_tokens(&stack2, &[7]);
    assert_ne!(logits_a, logits_b);
}

#[test]
fn runs_are_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let model = TestModel::small();
    let path = write_model_file(dir.path(), &model);
    let path = path.to_str().unwrap();

    let prompt = [3u32, 11, 5, 2];
    let first = forward_tokens(&build_stack(path, 1), &prompt);
    let second = forward_tokens(&build_stack(path, 1), &prompt);
    assert_eq!(first, second);
}

#[test]
fn thread_count_does_not_change_results() {
    let dir = tempfile::tempdir().unwrap();
    let model = TestModel::small();
    let path = write_model_file(dir.path(), &model);
    let path = path.to_str().unwrap();

    let prompt = [9u32, 4, 17];
    let single = forward_tokens(&build_stack(path, 1), &prompt);
    let multi = forward_tokens(&build_stack(path, 4), &prompt);
    assert_eq!(single, multi);
}

#[test]
fn batched_prompt_matches_stepwise() {
    let dir = tempfile::tempdir().unwrap();
    let model = TestModel::small();
    let path = write_model_file(dir.path(), &model);
    let path = path.to_str().unwrap();

    let prompt = [3u32, 11, 5];

    // Step one token at a time.
    let stepwise = forward_tokens(&build_stack(path, 1), &prompt);

    // Evaluate the whole prompt in one batched forward; the logits of the
    // last row must match the stepwise run's final logits.
    let stack = build_stack(path, 1);
    let vocab = stack.net.header.vocab_size as usize;
    stack.execution.set_batch_size(prompt.len() as u32);
    for (i, &token) in prompt.iter().enumerate() {
        stack.execution.pipe_f32(stack.net.position_pipe)[i] = i as f32;
        stack.execution.pipe_f32(stack.net.token_pipe)[i] = token as f32;
    }
    stack.executor.forward().unwrap();
    let row = prompt.len() - 1;
    let batched = stack.execution.pipe_f32(stack.net.logits_pipe)
        [row * vocab..(row + 1) * vocab]
        .to_vec();

    for (a, b) in stepwise.iter().zip(batched.iter()) {
        assert!((a - b).abs() < 1e-4, "{a} vs {b}");
    }
}
