//! Partition planner
//!
//! Turns a stage specification (per-stage layer count + TP ratios) into a
//! complete plan: stage to layer range, node to stage membership, and
//! per-node head/KV-head/vocab/FFN/hidden splits.
//!
//! The ratios grammar accepts two forms, auto-detected:
//!
//! - Per-stage TP ratios: `"tp0*tp1*..."` where each `tp` is a `,`/`:`
//!   separated ratio list, optionally suffixed `@N` for an explicit layer
//!   count (legacy `r0,r1:N` also accepted when ratios use commas).
//! - Two-level: `"stageWeights*tpStage0*tpStage1*..."` used when the first
//!   form does not account for every node.
//!
//! `;` and `|` are accepted as stage separators and normalized to `*`.

use crate::error::{RepartirError, Result};
use crate::slice::{create_dim_split, DimSplit};

/// Hidden/FFN/vocab splits snap to multiples of this (except the tail peer)
pub const DIM_SPLIT_ALIGN: u32 = 32;

/// Requested shape of one pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageDef {
    /// Explicit layer count; 0 means "assign automatically"
    pub n_layers: u32,
    /// Tensor-parallel weight ratios, one per member node
    pub tp_ratios: Vec<f32>,
}

/// Resolved configuration of one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    /// Stage id (0-based, ascending along the pipeline)
    pub stage_index: u32,
    /// First layer owned by this stage (global index)
    pub start_layer: u32,
    /// One past the last layer owned by this stage
    pub end_layer: u32,
    /// Layer count (`end_layer - start_layer`)
    pub n_layers: u32,
    /// Global id of the stage root (lowest member id)
    pub root_node_index: u32,
    /// Member count
    pub n_nodes: u32,
    /// Global node ids, ascending
    pub node_indices: Vec<u32>,
}

impl StageConfig {
    /// True when `node` is a member of this stage
    pub fn contains(&self, node: u32) -> bool {
        self.node_indices.contains(&node)
    }
}

/// Complete partition of a model over pipeline stages and TP peers.
///
/// The five splits are indexed by global node id; starts are stage-local
/// (each stage owns a full, independent partition of every dimension).
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPlan {
    /// Total node count across all stages
    pub n_nodes: u32,
    /// Pipeline stages, ascending
    pub stages: Vec<StageConfig>,
    /// Q head split per node
    pub head_split: DimSplit,
    /// KV head split per node
    pub kv_head_split: DimSplit,
    /// Vocabulary split per node
    pub vocab_split: DimSplit,
    /// FFN dimension split per node
    pub ffn_split: DimSplit,
    /// Hidden dimension split per node
    pub dim_split: DimSplit,
}

impl PartitionPlan {
    /// Number of pipeline stages
    pub fn n_stages(&self) -> u32 {
        self.stages.len() as u32
    }

    /// Stage containing `node`
    pub fn stage_for_node(&self, node: u32) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.contains(node))
    }

    /// Stage index of `node` (0 when the plan does not know it)
    pub fn stage_index_for_node(&self, node: u32) -> u32 {
        self.stage_for_node(node).map_or(0, |s| s.stage_index)
    }

    /// The last pipeline stage
    pub fn last_stage(&self) -> &StageConfig {
        self.stages.last().expect("plan has at least one stage")
    }
}

fn parse_ratio_value(token: &str) -> Result<f32> {
    token
        .parse::<f32>()
        .map_err(|_| RepartirError::Config(format!("Invalid ratio value: {token}")))
}

/// Parse one stage segment into (ratios, explicit layer count or 0).
///
/// `@N` is the preferred layer suffix; a trailing `:N` is honored only when
/// the ratios themselves are comma-separated (the legacy form), because with
/// colon-separated ratios it would be ambiguous.
fn parse_ratios_and_layers(segment: &str) -> Result<(Vec<f32>, u32)> {
    let mut explicit_layers = 0u32;
    let mut ratio_part = segment;

    if let Some(at) = segment.rfind('@') {
        let tail = &segment[at + 1..];
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            explicit_layers = tail
                .parse()
                .map_err(|_| RepartirError::Config(format!("Invalid layer count: {tail}")))?;
            ratio_part = &segment[..at];
        }
    }

    if explicit_layers == 0 && segment.contains(',') {
        if let Some(colon) = segment.rfind(':') {
            let tail = &segment[colon + 1..];
            if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
                explicit_layers = tail.parse().unwrap_or(0);
                ratio_part = &segment[..colon];
            }
        }
    }

    let ratios: Vec<f32> = ratio_part
        .split([',', ':'])
        .filter(|t| !t.is_empty())
        .map(parse_ratio_value)
        .collect::<Result<_>>()?;
    if ratios.is_empty() {
        return Err(RepartirError::Config(format!(
            "Empty ratio list in segment: {segment}"
        )));
    }
    Ok((ratios, explicit_layers))
}

fn split_stage_segments(raw: &str) -> Vec<String> {
    raw.replace([';', '|'], "*")
        .split('*')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Distribute the layers not claimed by explicit `@N` counts over the auto
/// stages, proportionally to each stage's weight. The last auto stage absorbs
/// rounding residue; a near-zero weight sum falls back to a uniform spread
/// with the residue on trailing stages.
fn auto_assign_layers(stages: &mut [StageDef], stage_weights: &[f32], n_layers: u32) -> Result<()> {
    let explicit: u32 = stages.iter().map(|s| s.n_layers).sum();
    if explicit > n_layers {
        return Err(RepartirError::Config(format!(
            "Explicit layer counts sum to {explicit}, model has {n_layers}"
        )));
    }
    let remaining = n_layers - explicit;

    let auto: Vec<usize> = stages
        .iter()
        .enumerate()
        .filter(|(_, s)| s.n_layers == 0)
        .map(|(i, _)| i)
        .collect();
    if auto.is_empty() {
        if remaining != 0 {
            return Err(RepartirError::Config(format!(
                "Explicit layer counts cover {explicit} of {n_layers} layers"
            )));
        }
        return Ok(());
    }

    let weights: Vec<f32> = auto
        .iter()
        .map(|&i| stage_weights.get(i).copied().unwrap_or(0.0))
        .collect();
    let total_weight: f32 = weights.iter().sum();

    if total_weight <= 1e-6 {
        let base = remaining / auto.len() as u32;
        let rem = remaining % auto.len() as u32;
        let n = auto.len() as u32;
        for (pos, &idx) in auto.iter().enumerate() {
            let extra = u32::from(pos as u32 >= n - rem);
            stages[idx].n_layers = base + extra;
        }
    } else {
        let mut allocated = 0u32;
        for (pos, &idx) in auto.iter().enumerate() {
            let layers = if pos + 1 == auto.len() {
                remaining - allocated
            } else {
                let ideal = f64::from(remaining) * f64::from(weights[pos] / total_weight);
                (ideal.round() as u32).min(remaining - allocated)
            };
            stages[idx].n_layers = layers;
            allocated += layers;
        }
    }

    if let Some(empty) = stages.iter().position(|s| s.n_layers == 0) {
        return Err(RepartirError::Config(format!(
            "Stage {empty} was assigned zero layers; use explicit @N counts"
        )));
    }
    Ok(())
}

/// Parse a ratios string into stage definitions with resolved layer counts.
pub fn parse_stage_defs(ratios: &str, n_nodes: u32, n_layers: u32) -> Result<Vec<StageDef>> {
    let parts = split_stage_segments(ratios);
    if parts.is_empty() {
        return Err(RepartirError::Config("Ratios string is empty".to_string()));
    }

    // Pass 1: every segment is a per-stage TP ratio list.
    {
        let mut stages = Vec::with_capacity(parts.len());
        for seg in &parts {
            let (tp_ratios, n_layers) = parse_ratios_and_layers(seg)?;
            stages.push(StageDef { n_layers, tp_ratios });
        }
        let total_nodes: u32 = stages.iter().map(|s| s.tp_ratios.len() as u32).sum();
        if total_nodes == n_nodes {
            let weights: Vec<f32> = stages.iter().map(|s| s.tp_ratios.iter().sum()).collect();
            auto_assign_layers(&mut stages, &weights, n_layers)?;
            return Ok(stages);
        }
    }

    // Pass 2: first segment is stage weights, rest are per-stage TP ratios.
    if parts.len() < 2 {
        return Err(RepartirError::Config(format!(
            "Ratios \"{ratios}\" does not describe {n_nodes} nodes"
        )));
    }
    let (stage_weights, head_layers) = parse_ratios_and_layers(&parts[0])?;
    if head_layers != 0 {
        return Err(RepartirError::Config(
            "Stage-weights segment must not carry a layer count".to_string(),
        ));
    }
    if parts.len() != 1 + stage_weights.len() {
        return Err(RepartirError::Config(format!(
            "Two-level ratios expects 1+{} segments, got {} (format: stageWeights*tpStage0*tpStage1*...)",
            stage_weights.len(),
            parts.len()
        )));
    }

    let mut stages = Vec::with_capacity(stage_weights.len());
    for seg in &parts[1..] {
        let (tp_ratios, n_layers) = parse_ratios_and_layers(seg)?;
        stages.push(StageDef { n_layers, tp_ratios });
    }
    let total_nodes: u32 = stages.iter().map(|s| s.tp_ratios.len() as u32).sum();
    if total_nodes != n_nodes {
        return Err(RepartirError::Config(format!(
            "Ratios define {total_nodes} nodes, expected {n_nodes}"
        )));
    }
    auto_assign_layers(&mut stages, &stage_weights, n_layers)?;
    Ok(stages)
}

/// Build the partition plan from resolved stage definitions.
///
/// Each stage receives an independent, full TP partition of every dimension:
/// KV heads split with alignment 1, Q heads derived through the GQA group
/// size, and vocab/FFN/hidden split with alignment 32.
pub fn create_partition_plan(
    stage_defs: &[StageDef],
    n_layers: u32,
    n_heads: u32,
    n_kv_heads: u32,
    vocab_size: u32,
    ffn_dim: u32,
    dim: u32,
) -> Result<PartitionPlan> {
    if stage_defs.is_empty() {
        return Err(RepartirError::Config("No stages defined".to_string()));
    }
    if n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(RepartirError::Config(format!(
            "nHeads ({n_heads}) must be divisible by nKvHeads ({n_kv_heads})"
        )));
    }
    let gqa = n_heads / n_kv_heads;

    let layer_sum: u32 = stage_defs.iter().map(|s| s.n_layers).sum();
    if layer_sum != n_layers {
        return Err(RepartirError::Config(format!(
            "Stage layer counts sum to {layer_sum}, model has {n_layers}"
        )));
    }

    let n_nodes: u32 = stage_defs.iter().map(|s| s.tp_ratios.len() as u32).sum();
    let mut stages = Vec::with_capacity(stage_defs.len());
    let mut head_split = DimSplit::default();
    let mut kv_head_split = DimSplit::default();
    let mut vocab_split = DimSplit::default();
    let mut ffn_split = DimSplit::default();
    let mut dim_split = DimSplit::default();

    let mut node_offset = 0u32;
    let mut layer_offset = 0u32;

    for (s, def) in stage_defs.iter().enumerate() {
        if def.tp_ratios.is_empty() {
            return Err(RepartirError::Config(format!("Stage {s} has no nodes")));
        }
        if def.n_layers == 0 {
            return Err(RepartirError::Config(format!("Stage {s} has zero layers")));
        }
        let k = def.tp_ratios.len() as u32;

        stages.push(StageConfig {
            stage_index: s as u32,
            start_layer: layer_offset,
            end_layer: layer_offset + def.n_layers,
            n_layers: def.n_layers,
            root_node_index: node_offset,
            n_nodes: k,
            node_indices: (node_offset..node_offset + k).collect(),
        });

        let kv = create_dim_split(n_kv_heads, &def.tp_ratios, 1)?;
        for i in 0..k as usize {
            head_split.starts.push(kv.starts[i] * gqa);
            head_split.lengths.push(kv.lengths[i] * gqa);
        }
        kv_head_split.starts.extend_from_slice(&kv.starts);
        kv_head_split.lengths.extend_from_slice(&kv.lengths);

        for (global, local) in [
            (&mut vocab_split, create_dim_split(vocab_size, &def.tp_ratios, DIM_SPLIT_ALIGN)?),
            (&mut ffn_split, create_dim_split(ffn_dim, &def.tp_ratios, DIM_SPLIT_ALIGN)?),
            (&mut dim_split, create_dim_split(dim, &def.tp_ratios, DIM_SPLIT_ALIGN)?),
        ] {
            global.starts.extend_from_slice(&local.starts);
            global.lengths.extend_from_slice(&local.lengths);
        }

        node_offset += k;
        layer_offset += def.n_layers;
    }

    Ok(PartitionPlan {
        n_nodes,
        stages,
        head_split,
        kv_head_split,
        vocab_split,
        ffn_split,
        dim_split,
    })
}

fn exact_split(what: &'static str, total: u32, n_nodes: u32) -> Result<DimSplit> {
    if total % n_nodes != 0 {
        return Err(RepartirError::Config(format!(
            "{what} ({total}) is not divisible by the node count ({n_nodes}); use --ratios"
        )));
    }
    let len = total / n_nodes;
    Ok(DimSplit {
        starts: (0..n_nodes).map(|i| i * len).collect(),
        lengths: vec![len; n_nodes as usize],
    })
}

/// Trivial single-stage plan with exact equal splits, used when no ratios
/// string was given. Every dimension must divide evenly; weight distribution
/// then follows the legacy network path, whose workers assume uniform slots.
pub fn uniform_plan(
    n_nodes: u32,
    n_layers: u32,
    n_heads: u32,
    n_kv_heads: u32,
    vocab_size: u32,
    ffn_dim: u32,
    dim: u32,
) -> Result<PartitionPlan> {
    if n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(RepartirError::Config(format!(
            "nHeads ({n_heads}) must be divisible by nKvHeads ({n_kv_heads})"
        )));
    }
    Ok(PartitionPlan {
        n_nodes,
        stages: vec![StageConfig {
            stage_index: 0,
            start_layer: 0,
            end_layer: n_layers,
            n_layers,
            root_node_index: 0,
            n_nodes,
            node_indices: (0..n_nodes).collect(),
        }],
        head_split: exact_split("nHeads", n_heads, n_nodes)?,
        kv_head_split: exact_split("nKvHeads", n_kv_heads, n_nodes)?,
        vocab_split: exact_split("vocabSize", vocab_size, n_nodes)?,
        ffn_split: exact_split("ffnDim", ffn_dim, n_nodes)?,
        dim_split: exact_split("dim", dim, n_nodes)?,
    })
}

/// Plan stand-in for a worker on the legacy weight path, where the model
/// dimensions are unknown: one whole-net stage with empty splits, so every
/// split probe misses and slice resolution falls back to uniform slots.
pub fn opaque_uniform_plan(n_nodes: u32) -> PartitionPlan {
    PartitionPlan {
        n_nodes,
        stages: vec![StageConfig {
            stage_index: 0,
            start_layer: 0,
            end_layer: 0,
            n_layers: 0,
            root_node_index: 0,
            n_nodes,
            node_indices: (0..n_nodes).collect(),
        }],
        head_split: DimSplit::default(),
        kv_head_split: DimSplit::default(),
        vocab_split: DimSplit::default(),
        ffn_split: DimSplit::default(),
        dim_split: DimSplit::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_of(ratios: &str, n_nodes: u32, n_layers: u32) -> PartitionPlan {
        let defs = parse_stage_defs(ratios, n_nodes, n_layers).unwrap();
        create_partition_plan(&defs, n_layers, 32, 8, 32000, 11008, 4096).unwrap()
    }

    #[test]
    fn test_two_stages_one_node_each() {
        let plan = plan_of("1*1", 2, 8);
        assert_eq!(plan.n_stages(), 2);
        assert_eq!(plan.stages[0].start_layer, 0);
        assert_eq!(plan.stages[0].end_layer, 4);
        assert_eq!(plan.stages[1].start_layer, 4);
        assert_eq!(plan.stages[1].end_layer, 8);
        assert_eq!(plan.stages[0].node_indices, vec![0]);
        assert_eq!(plan.stages[1].node_indices, vec![1]);
        assert_eq!(plan.stages[1].root_node_index, 1);
    }

    #[test]
    fn test_explicit_layers_at_syntax() {
        let defs = parse_stage_defs("1:1@10*1:1@18", 4, 28).unwrap();
        assert_eq!(defs[0].n_layers, 10);
        assert_eq!(defs[1].n_layers, 18);
        assert_eq!(defs[0].tp_ratios.len(), 2);
    }

    #[test]
    fn test_legacy_comma_colon_layers() {
        let defs = parse_stage_defs("1,1:10*1,1:18", 4, 28).unwrap();
        assert_eq!(defs[0].n_layers, 10);
        assert_eq!(defs[1].n_layers, 18);
    }

    #[test]
    fn test_two_level_form() {
        // 4 nodes cannot be covered by "1:2" alone, so the first segment
        // becomes stage weights: stage0 = 1:1, stage1 = 2:3.
        let defs = parse_stage_defs("1:2*1:1*2:3", 4, 24).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].tp_ratios, vec![1.0, 1.0]);
        assert_eq!(defs[1].tp_ratios, vec![2.0, 3.0]);
        // weights 1:2 over 24 layers
        assert_eq!(defs[0].n_layers, 8);
        assert_eq!(defs[1].n_layers, 16);
    }

    #[test]
    fn test_explicit_exceeds_total_rejected() {
        assert!(parse_stage_defs("1@20*1@20", 2, 24).is_err());
    }

    #[test]
    fn test_layer_sum_invariant() {
        for ratios in ["1*1", "1:1*1:1", "1:2*1:1@10*2:3@14"] {
            let n_nodes = if ratios == "1*1" { 2 } else { 4 };
            let plan = plan_of(ratios, n_nodes, 24);
            let total: u32 = plan.stages.iter().map(|s| s.n_layers).sum();
            assert_eq!(total, 24, "ratios {ratios}");
        }
    }

    #[test]
    fn test_gqa_alignment_four_nodes() {
        let plan = plan_of("1,1,1,1", 4, 8);
        assert_eq!(plan.kv_head_split.lengths, vec![2, 2, 2, 2]);
        assert_eq!(plan.head_split.lengths, vec![8, 8, 8, 8]);
        for i in 0..4 {
            assert_eq!(plan.head_split.starts[i], plan.kv_head_split.starts[i] * 4);
        }
    }

    #[test]
    fn test_gqa_non_divisible_rejected() {
        let defs = parse_stage_defs("1", 1, 4).unwrap();
        assert!(create_partition_plan(&defs, 4, 30, 7, 1000, 512, 256).is_err());
    }

    #[test]
    fn test_per_stage_splits_cover_dims() {
        let plan = plan_of("1:2*1:1@10*2:3@14", 4, 24);
        for stage in &plan.stages {
            let lo = stage.root_node_index as usize;
            let hi = lo + stage.n_nodes as usize;
            assert_eq!(plan.kv_head_split.total(lo..hi), 8, "stage {}", stage.stage_index);
            assert_eq!(plan.head_split.total(lo..hi), 32);
            assert_eq!(plan.vocab_split.total(lo..hi), 32000);
            assert_eq!(plan.ffn_split.total(lo..hi), 11008);
            assert_eq!(plan.dim_split.total(lo..hi), 4096);
            // stage-local starts begin at zero
            assert_eq!(plan.dim_split.starts[lo], 0);
        }
    }

    #[test]
    fn test_alignment_of_non_tail_peers() {
        let plan = plan_of("1:2*1:1@10*2:3@14", 4, 24);
        for stage in &plan.stages {
            let lo = stage.root_node_index as usize;
            let hi = lo + stage.n_nodes as usize;
            for i in lo..hi - 1 {
                assert_eq!(plan.dim_split.lengths[i] % 32, 0);
                assert_eq!(plan.ffn_split.lengths[i] % 32, 0);
                assert_eq!(plan.vocab_split.lengths[i] % 32, 0);
            }
        }
    }

    #[test]
    fn test_uneven_two_level_scenario() {
        // H.nHeads=16, nKvHeads=8, dim=1024, hidden=3072, vocab=151936
        let defs = parse_stage_defs("1:2*1:1@10*2:3@14", 4, 24).unwrap();
        let plan = create_partition_plan(&defs, 24, 16, 8, 151936, 3072, 1024).unwrap();
        assert_eq!(plan.stages[0].n_layers, 10);
        assert_eq!(plan.stages[1].n_layers, 14);
        assert_eq!(plan.kv_head_split.lengths[0..2], [4, 4]);
        assert_eq!(plan.head_split.lengths[0..2], [8, 8]);
        assert_eq!(plan.dim_split.lengths[0..2], [512, 512]);
        // stage 1: kv 8 over ratios 2:3 -> [3, 5]
        assert_eq!(plan.kv_head_split.lengths[2] + plan.kv_head_split.lengths[3], 8);
        assert!(plan.kv_head_split.lengths[2] >= 1);
        // hidden split of stage 1 sums to 1024 with both halves >= 32
        let d2 = plan.dim_split.lengths[2];
        let d3 = plan.dim_split.lengths[3];
        assert_eq!(d2 + d3, 1024);
        assert!(d2 >= 32 && d3 >= 32);
    }

    #[test]
    fn test_uniform_plan_is_trivial_for_one_node() {
        let plan = uniform_plan(1, 4, 8, 8, 1000, 512, 256).unwrap();
        assert_eq!(plan.n_stages(), 1);
        assert_eq!(plan.stages[0].n_layers, 4);
        assert_eq!(plan.head_split.lengths, vec![8]);
        assert_eq!(plan.vocab_split.lengths, vec![1000]);
        assert_eq!(plan.dim_split.lengths, vec![256]);
    }

    #[test]
    fn test_stage_lookup() {
        let plan = plan_of("1:1*1:1", 4, 8);
        assert_eq!(plan.stage_index_for_node(0), 0);
        assert_eq!(plan.stage_index_for_node(3), 1);
        assert!(plan.stage_for_node(9).is_none());
        assert_eq!(plan.last_stage().stage_index, 1);
    }
}
