//! C8: the checkpoint engine. Freezes the writable stage into a new MLCSR
//! level, following the ten-step algorithm of §4.7: validate the loader
//! config, size the new level from per-node deltas, write edges, optionally
//! build reverse edges, and freeze every property's writable slot.

use llama_api::{pack_edge_id, unpack_edge_id, LevelId, LoaderConfig, NodeId};

use crate::error::Result;
use crate::mlcsr::{Mlcsr, VtMode};
use crate::property::{PropertyId, PropertyStore, PropertyValue};
use crate::writable::WritableStage;

/// Runs one checkpoint, consuming everything currently buffered in
/// `stage`. Returns the id of the newly committed level.
///
/// `stage`, `mlcsr`, and `properties` together form one database's mutable
/// state; this function takes them by reference rather than bundling them
/// into a type of its own so `Database` (the root object) stays the single
/// owner, per §9's "the database value is the sole root". `stream_forward`
/// names the edge property (if any) that records each superseded edge's
/// forward pointer (§0.5); pass `None` outside streaming mode.
pub fn run_checkpoint(
    mlcsr: &Mlcsr,
    properties: &PropertyStore,
    stage: &WritableStage,
    config: &LoaderConfig,
    stream_forward: Option<PropertyId>,
) -> Result<LevelId> {
    config.validate().map_err(crate::error::Error::UnsupportedConfig)?;

    // step 2: max_nodes = max_node_id_seen + 1, never shrinking relative to
    // the previous level (an empty checkpoint must reproduce its
    // predecessor's shape exactly, see §8 "Checkpoint with zero writable
    // mutations").
    let prev_level = mlcsr.levels().max_level();
    let prev_max_nodes = prev_level.and_then(|l| mlcsr.levels().get(l)).map(|l| l.max_nodes).unwrap_or(0);
    let seen = stage.max_node_seen();
    let max_nodes = prev_max_nodes.max(if seen < 0 { 0 } else { seen as usize + 1 });

    // step 3: per-node delta arrays.
    let deltas = stage.drain();
    let mut new_out_degree = vec![0u32; max_nodes];
    let mut deleted_count = vec![0u32; max_nodes];
    for (&node, delta) in deltas.iter() {
        let idx = node as usize;
        new_out_degree[idx] = delta.out_edges.len() as u32;
        deleted_count[idx] = if delta.tombstone {
            prev_level.map(|l| mlcsr.out_degree(node, l)).transpose()?.unwrap_or(0)
        } else {
            delta.deleted_count
        };
    }

    let mode = if prev_level.is_none() { VtMode::Dense } else { VtMode::Cow };

    // step 4
    let level_id = mlcsr.init_level_from_degrees(max_nodes, &new_out_degree, mode)?;

    // step 5: give every edge property a slot for this level before any
    // writes land.
    let max_edges: u64 = new_out_degree.iter().map(|&d| d as u64).sum();
    properties.init_edge_level(level_id, max_edges);

    // step 6: sweep touched nodes in ascending order, writing edges and
    // recording supersession pointers for streaming weight age-off.
    let mut supersessions = Vec::new();
    for (&node, delta) in deltas.iter() {
        let new_edges = new_out_degree[node as usize];
        let deleted = deleted_count[node as usize];
        if let Some(start) = mlcsr.init_node(node, new_edges, deleted)? {
            let targets: Vec<NodeId> = delta.out_edges.iter().map(|e| e.target).collect();
            mlcsr.write_edges(start, &targets)?;
            for (i, edge) in delta.out_edges.iter().enumerate() {
                if let Some(old) = edge.supersedes {
                    let new_edge = pack_edge_id(level_id, start + i as u64);
                    supersessions.push((old, new_edge));
                }
            }
        }
    }

    // forward-pointer chain for streaming weight age-off (§0.5): the
    // superseded edge's slot in `stream_forward` now points at its
    // replacement, so eviction can walk to the surviving descendant.
    if let Some(prop_id) = stream_forward {
        for (old, new) in &supersessions {
            if let Some((old_level, old_index)) = unpack_edge_id(*old) {
                properties.with_edge_property(prop_id, |p| {
                    p.set(*old, old_level, old_index, PropertyValue::Int(*new));
                })?;
            }
        }
    }

    // step 7
    mlcsr.finish_level_vertices()?;
    mlcsr.finish_level_edges()?;

    // step 8
    if config.reverse_edges {
        mlcsr.make_reverse_edges(config.reverse_maps)?;
    }

    // step 9: freeze every node property's writable slot at this level.
    properties.freeze_node_properties(level_id, max_nodes)?;

    Ok(level_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_checkpoint_produces_pointer_equal_vt() {
        let mlcsr = Mlcsr::new(8);
        let properties = PropertyStore::new(4);
        let stage = WritableStage::new();
        let config = LoaderConfig::default();

        stage.add_edge(1, 2, None);
        let l0 = run_checkpoint(&mlcsr, &properties, &stage, &config, None).unwrap();
        // second checkpoint with nothing buffered must reproduce l0's shape
        // exactly: no modified pages, an empty edge table.
        let l1 = run_checkpoint(&mlcsr, &properties, &stage, &config, None).unwrap();

        let level0 = mlcsr.levels().get(l0).unwrap();
        let level1 = mlcsr.levels().get(l1).unwrap();
        assert_eq!(level1.out_vt.modified_nodes(&level0.out_vt).unwrap(), Vec::<NodeId>::new());
        assert_eq!(level1.out_et.capacity(), 0);
        assert_eq!(mlcsr.out_degree(1, l1).unwrap(), 1);
    }

    #[test]
    fn streaming_supersession_records_forward_pointer() {
        let mlcsr = Mlcsr::new(8);
        let properties = PropertyStore::new(4);
        let forward = properties.create_edge_property("stream_forward").unwrap();
        let stage = WritableStage::new();
        let config = LoaderConfig::default();

        stage.add_edge(1, 2, None);
        let l0 = run_checkpoint(&mlcsr, &properties, &stage, &config, Some(forward)).unwrap();
        let old_edge = mlcsr.lookup_out_edge_id(1, l0).unwrap();

        stage.add_edge(1, 2, Some(old_edge));
        let l1 = run_checkpoint(&mlcsr, &properties, &stage, &config, Some(forward)).unwrap();
        let new_edge = mlcsr.lookup_out_edge_id(1, l1).unwrap();

        let (level, index) = unpack_edge_id(old_edge).unwrap();
        let recorded = properties.with_edge_property(forward, |p| p.get(level, index)).unwrap();
        assert_eq!(recorded.as_edge_id(), new_edge);
    }

    #[test]
    fn checkpoint_from_scenario_s1() {
        let mlcsr = Mlcsr::new(8);
        let properties = PropertyStore::new(4);
        let stage = WritableStage::new();
        let config = LoaderConfig::default();

        stage.add_edge(1, 2, None);
        stage.add_edge(1, 3, None);
        stage.add_edge(2, 3, None);

        let l0 = run_checkpoint(&mlcsr, &properties, &stage, &config, None).unwrap();
        assert_eq!(mlcsr.out_degree(1, l0).unwrap(), 2);
        assert_eq!(mlcsr.out_degree(2, l0).unwrap(), 1);
        let out1: Vec<_> = mlcsr.iter_out(1, l0, l0).collect();
        assert_eq!(out1.len(), 2);
    }

    #[test]
    fn checkpoint_builds_reverse_edges_when_configured() {
        let mlcsr = Mlcsr::new(8);
        let properties = PropertyStore::new(4);
        let stage = WritableStage::new();
        let config = LoaderConfig { reverse_edges: true, reverse_maps: true, ..Default::default() };

        stage.add_edge(1, 3, None);
        stage.add_edge(2, 3, None);
        let l0 = run_checkpoint(&mlcsr, &properties, &stage, &config, None).unwrap();
        assert_eq!(mlcsr.in_degree(3, l0).unwrap(), 2);
    }

    #[test]
    fn rejects_reverse_maps_without_reverse_edges() {
        let mlcsr = Mlcsr::new(8);
        let properties = PropertyStore::new(4);
        let stage = WritableStage::new();
        let config = LoaderConfig { reverse_maps: true, ..Default::default() };
        assert!(run_checkpoint(&mlcsr, &properties, &stage, &config, None).is_err());
    }
}
