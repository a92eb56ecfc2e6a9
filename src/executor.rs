//! Execution engine
//!
//! `NetExecution` owns the shared pipes and the live batch size. `Executor`
//! drives a fixed pool of threads through the node's segments: every thread
//! runs its shard of each op, threads rendezvous at a barrier between ops,
//! and the synchronizer runs between segments. The calling thread
//! participates as thread 0, which is also the thread that performs
//! point-to-point collectives.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::device::CpuDevice;
use crate::error::{RepartirError, Result};
use crate::graph::{NetConfig, NodeConfig, SyncConfig};
use crate::memory::AlignedBuffer;
use crate::tensor::Size3D;

/// Profiling bucket selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// Time spent inside operator kernels
    ExecuteOp,
    /// Time spent inside collectives
    SyncNodes,
}

/// Sync hook the executor calls between segments.
///
/// Implementations shard socket work over `(n_threads, thread_index)`; the
/// executor guarantees every thread calls every hook exactly once per pass.
pub trait NodeSynchronizer: Send + Sync {
    /// Replicate a pre-sync pipe from the root before segment 0
    fn pre_sync(
        &self,
        pipe_index: u32,
        batch_size: u32,
        n_threads: u32,
        thread_index: u32,
    ) -> Result<()>;

    /// Run a segment's sync points in order
    fn segment_sync(
        &self,
        syncs: &[SyncConfig],
        batch_size: u32,
        n_threads: u32,
        thread_index: u32,
    ) -> Result<()>;
}

/// Shared pipes plus the live batch size of the current forward
pub struct NetExecution {
    /// Batch capacity of every pipe
    pub n_batches: u32,
    batch_size: AtomicU32,
    pipes: Vec<AlignedBuffer>,
    /// Pipe shapes, indexed like the net config
    pub pipe_sizes: Vec<Size3D>,
}

impl NetExecution {
    /// Allocate all pipes for a net config (zero-initialized)
    pub fn new(net_config: &NetConfig) -> Self {
        let pipes: Vec<AlignedBuffer> = net_config
            .pipes
            .iter()
            .map(|p| AlignedBuffer::new(p.size.n_bytes))
            .collect();
        NetExecution {
            n_batches: net_config.n_batches,
            batch_size: AtomicU32::new(0),
            pipes,
            pipe_sizes: net_config.pipes.iter().map(|p| p.size).collect(),
        }
    }

    /// Set the batch size of the next forward (1..=nBatches)
    pub fn set_batch_size(&self, batch_size: u32) {
        assert!(batch_size <= self.n_batches);
        self.batch_size.store(batch_size, Ordering::Release);
    }

    /// Batch size of the current forward
    pub fn batch_size(&self) -> u32 {
        self.batch_size.load(Ordering::Acquire)
    }

    /// Raw base pointer of a pipe
    pub fn pipe_ptr(&self, pipe_index: u32) -> *mut u8 {
        self.pipes[pipe_index as usize].as_mut_ptr()
    }

    /// f32 view of a whole pipe.
    ///
    /// Callers may only use this between forwards (the pool is idle then).
    pub fn pipe_f32(&self, pipe_index: u32) -> &mut [f32] {
        let size = &self.pipe_sizes[pipe_index as usize];
        // SAFETY: the pipe allocation covers `length` f32 values and is
        // 64-byte aligned.
        unsafe {
            std::slice::from_raw_parts_mut(self.pipe_ptr(pipe_index).cast::<f32>(), size.length)
        }
    }
}

/// A device plus the segment range it executes (`-1` = unbounded)
pub struct ExecutorDevice {
    /// The device
    pub device: CpuDevice,
    /// First segment this device handles, or -1 for "from the start"
    pub segment_from: i32,
    /// Last segment this device handles, or -1 for "to the end"
    pub segment_to: i32,
}

impl ExecutorDevice {
    /// Device covering every segment
    pub fn unbounded(device: CpuDevice) -> Self {
        ExecutorDevice { device, segment_from: -1, segment_to: -1 }
    }

    fn covers(&self, segment_index: usize) -> bool {
        let i = segment_index as i32;
        (self.segment_from < 0 || i >= self.segment_from)
            && (self.segment_to < 0 || i <= self.segment_to)
    }
}

struct PoolState {
    generation: u64,
    shutdown: bool,
}

struct ExecutorInner {
    devices: Vec<ExecutorDevice>,
    segment_syncs: Vec<Vec<SyncConfig>>,
    pre_syncs: Vec<u32>,
    synchronizer: Arc<dyn NodeSynchronizer>,
    execution: Arc<NetExecution>,
    n_threads: u32,
    barrier: Barrier,
    state: Mutex<PoolState>,
    state_cv: Condvar,
    failed: AtomicBool,
    error: Mutex<Option<RepartirError>>,
    exec_us: AtomicU64,
    sync_us: AtomicU64,
}

impl ExecutorInner {
    fn device_for(&self, segment_index: usize) -> &ExecutorDevice {
        self.devices
            .iter()
            .find(|d| d.covers(segment_index))
            .expect("no device covers segment")
    }

    fn record_error(&self, err: RepartirError) {
        self.failed.store(true, Ordering::Release);
        let mut slot = self.error.lock().expect("error lock");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// One full pass over the segments, executed by every pool thread.
    ///
    /// All threads run the same barrier sequence regardless of failures so a
    /// transport error never strands a peer thread at a barrier.
    fn run_pass(&self, thread_index: u32) {
        self.barrier.wait();
        if thread_index == 0 {
            self.exec_us.store(0, Ordering::Relaxed);
            self.sync_us.store(0, Ordering::Relaxed);
        }
        let batch_size = self.execution.batch_size();

        for &pipe_index in &self.pre_syncs {
            if !self.failed.load(Ordering::Acquire) {
                if let Err(e) =
                    self.synchronizer
                        .pre_sync(pipe_index, batch_size, self.n_threads, thread_index)
                {
                    self.record_error(e);
                }
            }
        }
        self.barrier.wait();

        for (segment_index, syncs) in self.segment_syncs.iter().enumerate() {
            let device = self.device_for(segment_index);
            let n_ops = device.device.n_ops(segment_index);
            for op_index in 0..n_ops {
                let started = Instant::now();
                if !self.failed.load(Ordering::Acquire) {
                    device.device.forward_op(
                        segment_index,
                        op_index,
                        self.n_threads,
                        thread_index,
                        batch_size,
                    );
                }
                if thread_index == 0 {
                    self.exec_us
                        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                }
                self.barrier.wait();
            }
            if !syncs.is_empty() {
                let started = Instant::now();
                if !self.failed.load(Ordering::Acquire) {
                    if let Err(e) =
                        self.synchronizer
                            .segment_sync(syncs, batch_size, self.n_threads, thread_index)
                    {
                        self.record_error(e);
                    }
                }
                if thread_index == 0 {
                    self.sync_us
                        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                }
                self.barrier.wait();
            }
        }
    }
}

/// Thread-pooled, segment-by-segment operator executor
pub struct Executor {
    inner: Arc<ExecutorInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    /// Build the executor and start its worker threads.
    ///
    /// `devices` must cover every segment of `node_config`.
    pub fn new(
        net_config: &NetConfig,
        node_config: &NodeConfig,
        devices: Vec<ExecutorDevice>,
        execution: Arc<NetExecution>,
        synchronizer: Arc<dyn NodeSynchronizer>,
        n_threads: u32,
    ) -> Result<Executor> {
        if n_threads == 0 {
            return Err(RepartirError::Config(
                "Thread count must be at least 1".to_string(),
            ));
        }
        let inner = Arc::new(ExecutorInner {
            devices,
            segment_syncs: node_config.segments.iter().map(|s| s.syncs.clone()).collect(),
            pre_syncs: net_config.pre_syncs.clone(),
            synchronizer,
            execution,
            n_threads,
            barrier: Barrier::new(n_threads as usize),
            state: Mutex::new(PoolState { generation: 0, shutdown: false }),
            state_cv: Condvar::new(),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            exec_us: AtomicU64::new(0),
            sync_us: AtomicU64::new(0),
        });

        let mut workers = Vec::new();
        for thread_index in 1..n_threads {
            let inner = Arc::clone(&inner);
            workers.push(std::thread::spawn(move || {
                let mut seen = 0u64;
                loop {
                    {
                        let mut state = inner.state.lock().expect("pool lock");
                        while state.generation == seen && !state.shutdown {
                            state = inner.state_cv.wait(state).expect("pool wait");
                        }
                        if state.shutdown {
                            return;
                        }
                        seen = state.generation;
                    }
                    inner.run_pass(thread_index);
                }
            }));
        }

        Ok(Executor { inner, workers })
    }

    /// Run one forward over the current batch.
    pub fn forward(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("pool lock");
            state.generation += 1;
            self.inner.state_cv.notify_all();
        }
        self.inner.run_pass(0);

        if self.inner.failed.swap(false, Ordering::AcqRel) {
            let err = self
                .inner
                .error
                .lock()
                .expect("error lock")
                .take()
                .unwrap_or_else(|| RepartirError::Transport("unknown sync failure".to_string()));
            return Err(err);
        }
        Ok(())
    }

    /// Microseconds the last forward spent in the given bucket
    pub fn total_time(&self, step: StepType) -> u32 {
        let v = match step {
            StepType::ExecuteOp => self.inner.exec_us.load(Ordering::Relaxed),
            StepType::SyncNodes => self.inner.sync_us.load(Ordering::Relaxed),
        };
        v as u32
    }

    /// Copy weight bytes into the op identified by `(op_name, op_index)`.
    pub fn load_weight(
        &self,
        op_name: &str,
        op_index: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        for device in &self.inner.devices {
            if device.device.has_op(op_name, op_index) {
                return device.device.load_weight(op_name, op_index, offset, data);
            }
        }
        Err(RepartirError::Config(format!(
            "No op '{op_name}' (index {op_index}) to load weights into"
        )))
    }

    /// True when some device owns `(op_name, op_index)`
    pub fn has_op(&self, op_name: &str, op_index: u32) -> bool {
        self.inner
            .devices
            .iter()
            .any(|d| d.device.has_op(op_name, op_index))
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().expect("pool lock");
            state.shutdown = true;
            self.inner.state_cv.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Synchronizer for single-node runs: every hook is a no-op.
pub struct FakeNodeSynchronizer;

impl NodeSynchronizer for FakeNodeSynchronizer {
    fn pre_sync(&self, _pipe: u32, _batch: u32, _n_threads: u32, _thread: u32) -> Result<()> {
        Ok(())
    }

    fn segment_sync(
        &self,
        _syncs: &[SyncConfig],
        _batch: u32,
        _n_threads: u32,
        _thread: u32,
    ) -> Result<()> {
        Ok(())
    }
}
