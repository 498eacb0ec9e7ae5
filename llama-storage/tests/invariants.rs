//! Property-based checks for the quantified invariants of §8.
//!
//! #1: for every level L and node n, the precomputed degree equals the
//! number of edges an iteration actually yields. We generate random
//! add/delete/checkpoint sequences over a small node universe and check
//! this after every checkpoint, for every node, at every still-visible
//! level.

use llama_api::{GraphStore, LevelView};
use llama_storage::{Database, DatabaseConfig};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add(i64, i64),
    Delete(i64, i64),
    Checkpoint,
}

fn op_strategy(max_node: i64) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..max_node, 0..max_node).prop_map(|(s, t)| Op::Add(s, t)),
        1 => (0..max_node, 0..max_node).prop_map(|(s, t)| Op::Delete(s, t)),
        1 => Just(Op::Checkpoint),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn precomputed_degree_matches_iteration(ops in prop::collection::vec(op_strategy(12), 1..80)) {
        let db = Database::open(DatabaseConfig::default());
        let mut levels = Vec::new();

        for op in &ops {
            match op {
                Op::Add(s, t) => db.add_edge(*s, *t),
                Op::Delete(s, t) => { db.delete_edge(*s, *t); }
                Op::Checkpoint => {
                    if let Ok(level) = db.checkpoint() {
                        levels.push(level);
                    }
                }
            }
        }
        if levels.is_empty() {
            levels.push(db.checkpoint().unwrap());
        }

        for &level in &levels {
            for node in 0..12i64 {
                let view = db.view_at(level);
                let counted = view.out_edges(node).count() as u32;
                prop_assert_eq!(counted, view.out_degree(node));
            }
        }
    }

    #[test]
    fn lowering_max_visible_level_is_monotone(a in 0u32..1000, b in 0u32..1000) {
        let db = Database::open(DatabaseConfig::default());
        db.add_edge(1, 2);
        let l0 = db.checkpoint().unwrap();
        let edge = db.mlcsr().lookup_out_edge_id(1, l0).unwrap().unwrap();

        let lo = a.min(b);
        let hi = a.max(b);
        db.mlcsr().update_max_visible_level_lower_only(edge, lo).unwrap();
        // once lowered to `lo`, asking to raise to `hi >= lo` must be a no-op.
        let raised = db.mlcsr().update_max_visible_level_lower_only(edge, hi).unwrap();
        prop_assert!(!raised || hi < lo);
    }
}
