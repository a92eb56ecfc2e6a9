//! Two-node pipeline-parallel run over loopback TCP: the root's gathered
//! logits must match the single-node baseline.

mod common;

use std::sync::Arc;

use common::{write_model_file, TestModel};
use repartir::device::CpuDevice;
use repartir::executor::{
    Executor, ExecutorDevice, FakeNodeSynchronizer, NetExecution, NodeSynchronizer,
};
use repartir::loader::load_weights_local;
use repartir::model::{build_llm_net, LlmHeader, LlmNet};
use repartir::net::Network;
use repartir::plan::{create_partition_plan, parse_stage_defs, uniform_plan, PartitionPlan};
use repartir::sync::NetworkSynchronizer;
use repartir::tensor::FloatType;

const TEST_PORT: u16 = 29_871;

fn pp_plan(n_layers: u32) -> PartitionPlan {
    let defs = parse_stage_defs("1*1", 2, n_layers).unwrap();
    create_partition_plan(&defs, n_layers, 4, 4, 96, 128, 64).unwrap()
}

struct Stack {
    net: LlmNet,
    execution: Arc<NetExecution>,
    executor: Executor,
}

fn build_stack(
    path: &str,
    plan: PartitionPlan,
    n_nodes: u32,
    node_index: u32,
    network: Option<&Arc<Network>>,
) -> Stack {
    let header = LlmHeader::load(path, 0, FloatType::F32).unwrap();
    let plan = Arc::new(plan);
    let net = build_llm_net(&header, n_nodes, 4, Arc::clone(&plan)).unwrap();
    let execution = Arc::new(NetExecution::new(&net.net_config));
    let device = CpuDevice::new(
        &net.net_config,
        &net.node_configs[node_index as usize],
        &execution,
    )
    .unwrap();
    let synchronizer: Arc<dyn NodeSynchronizer> = match network {
        Some(network) => Arc::new(NetworkSynchronizer::new(
            Arc::clone(network),
            Arc::clone(&execution),
            net.net_config.clone(),
            node_index,
            plan,
        )),
        None => Arc::new(FakeNodeSynchronizer),
    };
    let executor = Executor::new(
        &net.net_config,
        &net.node_configs[node_index as usize],
        vec![ExecutorDevice::unbounded(device)],
        Arc::clone(&execution),
        synchronizer,
        1,
    )
    .unwrap();
    load_weights_local(path, &net, &executor, node_index).unwrap();
    Stack { net, execution, executor }
}

fn run_root(stack: &Stack, tokens: &[u32]) -> Vec<f32> {
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
fn pp_logits_match_singleton_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let model = TestModel::small();
    let path = write_model_file(dir.path(), &model);
    let path = path.to_str().unwrap().to_string();

    let tokens = [3u32, 11, 5, 2];

    // Baseline: one node owns everything.
    let baseline = {
        let plan = uniform_plan(1, 4, 4, 4, 96, 128, 64).unwrap();
        let stack = build_stack(&path, plan, 1, 0, None);
        run_root(&stack, &tokens)
    };

    // Distributed: stage 0 (layers 0..2) on the root, stage 1 (layers 2..4)
    // on the worker, connected over loopback TCP.
    let worker_path = path.clone();
    let n_forwards = tokens.len();
    let worker = std::thread::spawn(move || {
        let network = Arc::new(Network::serve(TEST_PORT).unwrap());
        let stack = build_stack(&worker_path, pp_plan(4), 2, 1, Some(&network));
        for _ in 0..n_forwards {
            stack.execution.set_batch_size(1);
            stack.executor.forward().unwrap();
        }
    });

    // Wait for the worker to start listening.
    let mut attempts = 0;
    let network = loop {
        std::thread::sleep(std::time::Duration::from_millis(100));
        match Network::connect(&[("127.0.0.1".to_string(), TEST_PORT)]) {
            Ok(network) => break Arc::new(network),
            Err(e) if attempts < 50 => {
                attempts += 1;
                let _ = e;
            }
            Err(e) => panic!("worker never started listening: {e}"),
        }
    };
    let root_stack = build_stack(&path, pp_plan(4), 2, 0, Some(&network));
    let distributed = run_root(&root_stack, &tokens);
    worker.join().unwrap();

    assert_eq!(baseline.len(), distributed.len());
    for (a, b) in baseline.iter().zip(distributed.iter()) {
        assert!((a - b).abs() < 1e-4, "baseline {a} vs distributed {b}");
    }
}
