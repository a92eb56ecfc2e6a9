//! Collective synchronization primitives
//!
//! Four primitives run at segment boundaries: broadcast-from-group-root,
//! all-to-all slice exchange, slice gather to the global root, and pipeline
//! point-to-point send/receive. Group-root computation and per-node slice
//! resolution live in exactly one place here; the CPU device consults the
//! same resolver for `BatchedSlice` pointers so senders and receivers can
//! never disagree about a slice layout.

use std::sync::Arc;

use crate::error::Result;
use crate::executor::{NetExecution, NodeSynchronizer};
use crate::graph::{NetConfig, PipeSlicing, SyncConfig, SyncType};
use crate::net::{Network, SocketIo};
use crate::plan::{PartitionPlan, StageConfig};
use crate::slice::DimSplit;
use crate::tensor::FloatType;

/// Per-node slice of a pipe row, in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSlice {
    /// Start offset in elements
    pub start: u32,
    /// Extent in elements
    pub length: u32,
}

fn try_match_split(split: &DimSplit, group: &StageConfig, x: u32, node: usize) -> Option<PipeSlice> {
    let lo = group.root_node_index as usize;
    let hi = lo + group.n_nodes as usize;
    let total = split.total(lo..hi);
    if total == 0 || x % total != 0 {
        return None;
    }
    let multiplier = x / total;
    Some(PipeSlice {
        start: split.starts[node] * multiplier,
        length: split.lengths[node] * multiplier,
    })
}

/// Resolve the slice of a pipe's x-dimension owned by `node`.
///
/// `Uniform` pipes use fixed `x / nNodes` slots indexed by global node id
/// (the last node absorbs any remainder). `PlanMatched` pipes probe the
/// plan's splits in priority order vocab, FFN, heads, KV heads, scoped to
/// the group (`node`'s stage unless an explicit group is given), and fall
/// back to the uniform slot when nothing matches.
pub fn resolve_pipe_slice(
    plan: &PartitionPlan,
    group: Option<&StageConfig>,
    slicing: PipeSlicing,
    x: u32,
    node: u32,
) -> PipeSlice {
    if slicing == PipeSlicing::PlanMatched {
        let group = group.or_else(|| plan.stage_for_node(node));
        if let Some(group) = group {
            let node_idx = node as usize;
            for split in [
                &plan.vocab_split,
                &plan.ffn_split,
                &plan.head_split,
                &plan.kv_head_split,
            ] {
                if let Some(slice) = try_match_split(split, group, x, node_idx) {
                    return slice;
                }
            }
        }
    }

    let n_nodes = plan.n_nodes;
    let slot = x / n_nodes;
    let start = slot * node;
    let length = if node == n_nodes - 1 { x - start } else { slot };
    PipeSlice { start, length }
}

fn slice_bytes(float_type: FloatType, slice: PipeSlice) -> (usize, usize) {
    (
        float_type.bytes(slice.start as usize),
        float_type.bytes(slice.length as usize),
    )
}

/// Contiguous shard of `total` items for one thread (same partitioning the
/// kernels use for their output rows)
fn thread_shard(total: usize, n_threads: u32, thread_index: u32) -> (usize, usize) {
    let base = total / n_threads as usize;
    let rem = total % n_threads as usize;
    let t = thread_index as usize;
    let start = t * base + t.min(rem);
    (start, start + base + usize::from(t < rem))
}

/// Synchronizer backed by the TCP mesh
pub struct NetworkSynchronizer {
    network: Arc<Network>,
    execution: Arc<NetExecution>,
    net_config: NetConfig,
    node_index: u32,
    plan: Arc<PartitionPlan>,
    my_stage: usize,
}

impl NetworkSynchronizer {
    /// Bind the synchronizer to this node's stage
    pub fn new(
        network: Arc<Network>,
        execution: Arc<NetExecution>,
        net_config: NetConfig,
        node_index: u32,
        plan: Arc<PartitionPlan>,
    ) -> Self {
        let my_stage = plan
            .stages
            .iter()
            .position(|s| s.contains(node_index))
            .unwrap_or(0);
        NetworkSynchronizer {
            network,
            execution,
            net_config,
            node_index,
            plan,
            my_stage,
        }
    }

    fn stage(&self) -> &StageConfig {
        &self.plan.stages[self.my_stage]
    }

    /// Pointer to one batch row of a pipe
    fn pipe_row(&self, pipe_index: u32, batch: u32) -> (*mut u8, usize) {
        let size = &self.execution.pipe_sizes[pipe_index as usize];
        let row_bytes = size.row_bytes();
        // SAFETY: batch < nBatches; the pipe covers nBatches rows.
        let ptr = unsafe { self.execution.pipe_ptr(pipe_index).add(batch as usize * row_bytes) };
        (ptr, row_bytes)
    }

    /// Broadcast a batch row from the group root to the group.
    ///
    /// `group` of `None` means the whole net rooted at global node 0.
    fn sync_with_root(
        &self,
        group: Option<&StageConfig>,
        row: *mut u8,
        n_bytes: usize,
        n_threads: u32,
        thread_index: u32,
    ) -> Result<()> {
        let group_root = group.map_or(0, |s| s.root_node_index);

        if self.node_index == group_root {
            let targets: Vec<u32> = match group {
                Some(stage) => stage
                    .node_indices
                    .iter()
                    .copied()
                    .filter(|&n| n != self.node_index)
                    .collect(),
                None => (0..self.net_config.n_nodes)
                    .filter(|&n| n != self.node_index)
                    .collect(),
            };
            let (start, end) = thread_shard(targets.len(), n_threads, thread_index);
            if start == end {
                return Ok(());
            }
            // SAFETY: the row covers n_bytes; collectives run while kernels
            // are quiescent (barrier before and after).
            let row_ref = unsafe { std::slice::from_raw_parts(row, n_bytes) };
            let mut ios: Vec<SocketIo<'_>> = targets[start..end]
                .iter()
                .map(|&n| SocketIo::write(self.network.socket_index_for_node(n), row_ref))
                .collect();
            self.network.write_many(&mut ios)
        } else {
            if let Some(stage) = group {
                if !stage.contains(self.node_index) {
                    return Ok(());
                }
            }
            if thread_index != 0 {
                return Ok(());
            }
            // SAFETY: only thread 0 of the receiver writes the row here.
            let row_mut = unsafe { std::slice::from_raw_parts_mut(row, n_bytes) };
            let socket = self.network.socket_index_for_node(group_root);
            let mut ios = [SocketIo::read(socket, row_mut)];
            self.network.read_many(&mut ios)
        }
    }

    /// All-to-all exchange of per-node slices inside this node's stage.
    fn sync_node_slices(
        &self,
        pipe_index: u32,
        row: *mut u8,
        n_threads: u32,
        thread_index: u32,
    ) -> Result<()> {
        let stage = self.stage();
        if stage.n_nodes == 1 {
            return Ok(());
        }
        let pipe = &self.net_config.pipes[pipe_index as usize];
        let peers: Vec<u32> = stage
            .node_indices
            .iter()
            .copied()
            .filter(|&n| n != self.node_index)
            .collect();
        let (start, end) = thread_shard(peers.len(), n_threads, thread_index);
        if start == end {
            return Ok(());
        }

        let my_slice = resolve_pipe_slice(
            &self.plan,
            Some(stage),
            pipe.slicing,
            pipe.size.x,
            self.node_index,
        );
        let (my_offset, my_len) = slice_bytes(pipe.size.float_type, my_slice);
        // SAFETY: slice offsets stay inside the pipe row and the per-node
        // slices are pairwise disjoint, so the shared view of our slice and
        // the mutable views of the peers' slices never overlap.
        let mine = unsafe { std::slice::from_raw_parts(row.add(my_offset), my_len) };

        let mut writes: Vec<SocketIo<'_>> = peers[start..end]
            .iter()
            .map(|&n| SocketIo::write(self.network.socket_index_for_node(n), mine))
            .collect();
        self.network.write_many(&mut writes)?;

        let mut reads: Vec<SocketIo<'_>> = Vec::with_capacity(end - start);
        for &peer in &peers[start..end] {
            let slice =
                resolve_pipe_slice(&self.plan, Some(stage), pipe.slicing, pipe.size.x, peer);
            let (offset, len) = slice_bytes(pipe.size.float_type, slice);
            // SAFETY: see above; peer slices are disjoint from ours and from
            // each other.
            let dest = unsafe { std::slice::from_raw_parts_mut(row.add(offset), len) };
            reads.push(SocketIo::read(self.network.socket_index_for_node(peer), dest));
        }
        self.network.read_many(&mut reads)
    }

    /// Gather the last stage's slices to global node 0; the root never
    /// sends and non-members do nothing.
    fn sync_node_slices_except_root(
        &self,
        pipe_index: u32,
        row: *mut u8,
        n_threads: u32,
        thread_index: u32,
    ) -> Result<()> {
        let pipe = &self.net_config.pipes[pipe_index as usize];
        let last_stage = self.plan.last_stage();

        if self.node_index == 0 {
            let senders: Vec<u32> = last_stage
                .node_indices
                .iter()
                .copied()
                .filter(|&n| n != 0)
                .collect();
            let (start, end) = thread_shard(senders.len(), n_threads, thread_index);
            if start == end {
                return Ok(());
            }
            let mut reads: Vec<SocketIo<'_>> = Vec::with_capacity(end - start);
            for &sender in &senders[start..end] {
                let slice = resolve_pipe_slice(
                    &self.plan,
                    Some(last_stage),
                    pipe.slicing,
                    pipe.size.x,
                    sender,
                );
                let (offset, len) = slice_bytes(pipe.size.float_type, slice);
                // SAFETY: sender slices are disjoint subranges of the row.
                let dest = unsafe { std::slice::from_raw_parts_mut(row.add(offset), len) };
                reads.push(SocketIo::read(self.network.socket_index_for_node(sender), dest));
            }
            self.network.read_many(&mut reads)
        } else if last_stage.contains(self.node_index) {
            if thread_index != 0 {
                return Ok(());
            }
            let slice = resolve_pipe_slice(
                &self.plan,
                Some(last_stage),
                pipe.slicing,
                pipe.size.x,
                self.node_index,
            );
            let (offset, len) = slice_bytes(pipe.size.float_type, slice);
            // SAFETY: this node's slice lies inside the row.
            let src = unsafe { std::slice::from_raw_parts(row.add(offset), len) };
            self.network.write(self.network.socket_index_for_node(0), src)
        } else {
            Ok(())
        }
    }

    /// Stage root hands the full row to the next stage's root.
    fn sync_pp_send(&self, row: *mut u8, n_bytes: usize) -> Result<()> {
        let stage = self.stage();
        if stage.root_node_index != self.node_index {
            return Ok(());
        }
        let Some(next) = self.plan.stages.get(self.my_stage + 1) else {
            return Ok(());
        };
        // SAFETY: the row covers n_bytes.
        let src = unsafe { std::slice::from_raw_parts(row, n_bytes) };
        self.network.send_to_node(next.root_node_index, src)
    }

    /// Stage root pulls the full row from the previous stage's root.
    fn sync_pp_recv(&self, row: *mut u8, n_bytes: usize) -> Result<()> {
        let stage = self.stage();
        if stage.root_node_index != self.node_index || self.my_stage == 0 {
            return Ok(());
        }
        let prev = &self.plan.stages[self.my_stage - 1];
        // SAFETY: the row covers n_bytes.
        let dest = unsafe { std::slice::from_raw_parts_mut(row, n_bytes) };
        self.network.recv_from_node(prev.root_node_index, dest)
    }
}

impl NodeSynchronizer for NetworkSynchronizer {
    fn pre_sync(
        &self,
        pipe_index: u32,
        batch_size: u32,
        n_threads: u32,
        thread_index: u32,
    ) -> Result<()> {
        for batch in 0..batch_size {
            let (row, row_bytes) = self.pipe_row(pipe_index, batch);
            self.sync_with_root(None, row, row_bytes, n_threads, thread_index)?;
        }
        Ok(())
    }

    fn segment_sync(
        &self,
        syncs: &[SyncConfig],
        batch_size: u32,
        n_threads: u32,
        thread_index: u32,
    ) -> Result<()> {
        for sync in syncs {
            for batch in 0..batch_size {
                let (row, row_bytes) = self.pipe_row(sync.pipe_index, batch);
                match sync.sync_type {
                    SyncType::WithRoot => {
                        self.sync_with_root(
                            Some(self.stage()),
                            row,
                            row_bytes,
                            n_threads,
                            thread_index,
                        )?;
                    }
                    SyncType::NodeSlices => {
                        self.sync_node_slices(sync.pipe_index, row, n_threads, thread_index)?;
                    }
                    SyncType::NodeSlicesExceptRoot => {
                        self.sync_node_slices_except_root(
                            sync.pipe_index,
                            row,
                            n_threads,
                            thread_index,
                        )?;
                    }
                    SyncType::PpSend => {
                        if thread_index == 0 {
                            self.sync_pp_send(row, row_bytes)?;
                        }
                    }
                    SyncType::PpRecv => {
                        if thread_index == 0 {
                            self.sync_pp_recv(row, row_bytes)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{create_partition_plan, parse_stage_defs, uniform_plan};

    fn two_stage_plan() -> PartitionPlan {
        let defs = parse_stage_defs("1:1*1:1", 4, 8).unwrap();
        create_partition_plan(&defs, 8, 16, 8, 32000, 4096, 1024).unwrap()
    }

    #[test]
    fn test_uniform_slots_by_global_node() {
        let plan = two_stage_plan();
        // ZQ-style pipe: x = dim * nNodes
        let x = 1024 * 4;
        for node in 0..4u32 {
            let s = resolve_pipe_slice(&plan, None, PipeSlicing::Uniform, x, node);
            assert_eq!(s.start, node * 1024);
            assert_eq!(s.length, 1024);
        }
    }

    #[test]
    fn test_uniform_last_node_absorbs_remainder() {
        let plan = crate::plan::opaque_uniform_plan(3);
        let x = 100;
        let s0 = resolve_pipe_slice(&plan, None, PipeSlicing::Uniform, x, 0);
        let s2 = resolve_pipe_slice(&plan, None, PipeSlicing::Uniform, x, 2);
        assert_eq!(s0.length, 33);
        assert_eq!(s2.start, 66);
        assert_eq!(s2.length, 34);
    }

    #[test]
    fn test_plan_matched_vocab_slices() {
        let plan = two_stage_plan();
        let last = plan.last_stage().clone();
        // Logits pipe: x = vocab
        let mut covered = 0;
        for &node in &last.node_indices {
            let s = resolve_pipe_slice(&plan, Some(&last), PipeSlicing::PlanMatched, 32000, node);
            assert_eq!(s.start, plan.vocab_split.starts[node as usize]);
            assert_eq!(s.length, plan.vocab_split.lengths[node as usize]);
            covered += s.length;
        }
        assert_eq!(covered, 32000);
    }

    #[test]
    fn test_plan_matched_head_multiplier() {
        let plan = uniform_plan(2, 2, 8, 4, 1024, 512, 256).unwrap();
        let stage = plan.stages[0].clone();
        // A pipe sized as heads * 16 elements matches the head split.
        let s0 = resolve_pipe_slice(&plan, Some(&stage), PipeSlicing::PlanMatched, 8 * 16, 0);
        let s1 = resolve_pipe_slice(&plan, Some(&stage), PipeSlicing::PlanMatched, 8 * 16, 1);
        assert_eq!(s0.length + s1.length, 128);
        assert_eq!(s1.start, s0.length);
    }

    #[test]
    fn test_plan_matched_falls_back_to_uniform() {
        let plan = two_stage_plan();
        let stage = plan.stages[0].clone();
        // x = 7 matches no split; uniform fallback over 4 nodes.
        let s = resolve_pipe_slice(&plan, Some(&stage), PipeSlicing::PlanMatched, 7, 3);
        assert_eq!(s.start, 3);
        assert_eq!(s.length, 4);
    }

    #[test]
    fn test_thread_shard_partition() {
        let mut seen = vec![false; 10];
        for t in 0..3 {
            let (s, e) = thread_shard(10, 3, t);
            for slot in seen.iter_mut().take(e).skip(s) {
                assert!(!*slot);
                *slot = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
