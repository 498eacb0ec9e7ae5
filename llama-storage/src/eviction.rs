//! C9: eviction and streaming-weight age-off. Wraps
//! [`LevelCollection::set_min_level`] with the bookkeeping that must run
//! *before* a level's pages are released: precomputed-degree maintenance,
//! weight age-off along the forward-pointer chain, and telling every
//! property and translation map to drop the level.

use llama_api::{unpack_edge_id, EdgeId, LevelId};

use crate::error::{Error, Result};
use crate::mlcsr::Mlcsr;
use crate::property::{PropertyId, PropertyStore, PropertyValue};

/// Advances `min_level` to `m`, running the full §4.8 sequence for every
/// level being evicted, oldest first (eviction of L must strictly precede
/// L+1, so the loop never reorders this).
///
/// `stream_weight` / `stream_forward` name the optional streaming
/// properties (§0.5): when both are present, a weight on an edge about to
/// be evicted is walked forward along `stream_forward` and added onto the
/// surviving descendant before the edge's own level is dropped.
pub fn advance_min_level(
    mlcsr: &Mlcsr,
    properties: &PropertyStore,
    m: LevelId,
    stream_weight: Option<PropertyId>,
    stream_forward: Option<PropertyId>,
) -> Result<()> {
    let levels = mlcsr.levels();
    let max = levels.max_level().ok_or(Error::InvalidMinLevel { requested: m, max_level: 0 })?;
    if m > max {
        return Err(Error::InvalidMinLevel { requested: m, max_level: max });
    }
    let old_min = levels.min_level();

    for l in old_min..m {
        let Some(level) = levels.get(l) else { continue };
        if let (Some(weight_id), Some(forward_id)) = (stream_weight, stream_forward) {
            age_off_level_weights(properties, &level, weight_id, forward_id)?;
        }
        properties.delete_level(l)?;
        log::debug!("eviction: level {l} dropped from the visibility window");
    }

    levels.set_min_level(m)
}

/// `keep_only_recent_versions(k)`: the convenience wrapper of §4.8.
pub fn keep_only_recent_versions(mlcsr: &Mlcsr, properties: &PropertyStore, k: u32) -> Result<()> {
    let max = mlcsr.levels().max_level().ok_or(Error::InvalidMinLevel { requested: 0, max_level: 0 })?;
    let target = max.saturating_sub(k.saturating_sub(1));
    advance_min_level(mlcsr, properties, target, None, None)
}

/// For every out-edge this level owns, if it carries a forward pointer,
/// move its weight onto the edge it points to (walking multi-hop chains;
/// §9 notes this is correct for single-step forwarding and flags longer
/// chains as unverified in the original, which this loop still attempts).
fn age_off_level_weights(
    properties: &PropertyStore,
    level: &crate::level::Level,
    weight_id: PropertyId,
    forward_id: PropertyId,
) -> Result<()> {
    let capacity = level.out_et.capacity();
    for index in 0..capacity {
        let edge: EdgeId = llama_api::pack_edge_id(level.id, index);
        let forward = properties.with_edge_property(forward_id, |p| p.get(level.id, index))?;
        let Some(mut target) = (match forward {
            PropertyValue::Int(v) if v != llama_api::NIL_EDGE => Some(v),
            _ => None,
        }) else {
            continue;
        };
        let weight = properties.with_edge_property(weight_id, |p| p.get(level.id, index))?;
        let Some(amount) = weight.as_int() else { continue };
        if amount == 0 {
            continue;
        }

        // follow the chain to its current end, guarding against a cycle
        // with a bounded number of hops equal to the level count.
        let mut hops = 0u32;
        loop {
            let Some((t_level, t_index)) = unpack_edge_id(target) else { break };
            let next_forward = properties.with_edge_property(forward_id, |p| p.get(t_level, t_index))?;
            match next_forward {
                PropertyValue::Int(v) if v != llama_api::NIL_EDGE => {
                    target = v;
                    hops += 1;
                    if hops > 1_000_000 {
                        log::warn!(
                            "eviction: forward-pointer chain from edge {edge} exceeded 1,000,000 hops, aborting the walk"
                        );
                        break;
                    }
                }
                _ => break,
            }
        }
        if let Some((t_level, t_index)) = unpack_edge_id(target) {
            properties.with_edge_property(weight_id, |p| {
                let current = p.get(t_level, t_index).as_int().unwrap_or(0);
                p.set(edge, t_level, t_index, PropertyValue::Int(current + amount));
            })?;
        }
    }
    Ok(())
}
