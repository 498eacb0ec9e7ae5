//! Walks through one ingestion/checkpoint/eviction cycle end to end,
//! following the literal scenarios of §8 (S1-S4): ingest a few edges,
//! checkpoint, delete one, checkpoint again, build reverse edges, and prune
//! the oldest snapshot.
//!
//! Run:
//!   cargo run --example checkpoint_walkthrough -p llama-storage

use llama_api::{GraphStore, LevelView, LoaderConfig};
use llama_storage::{Database, DatabaseConfig};

fn main() {
    let config = DatabaseConfig {
        loader: LoaderConfig { reverse_edges: true, reverse_maps: true, ..Default::default() },
        ..Default::default()
    };
    let db = Database::open(config);

    // S1: (1->2), (1->3), (2->3), checkpointed together.
    db.add_edge(1, 2);
    db.add_edge(1, 3);
    db.add_edge(2, 3);
    let l0 = db.checkpoint().expect("checkpoint");
    println!("level {l0}: out_degree(1) = {}", db.view_at(l0).out_degree(1));
    println!("level {l0}: in_degree(3)  = {}", db.view_at(l0).in_degree(3));

    // S2: delete (1->2), checkpoint again; the old snapshot is unaffected.
    db.delete_edge(1, 2);
    let l1 = db.checkpoint().expect("checkpoint");
    println!(
        "level {l1}: out(1) = {:?}",
        db.view_at(l1).out_edges(1).map(|e| db.view_at(l1).target(e)).collect::<Vec<_>>()
    );
    println!(
        "level {l0}: out(1) unchanged = {:?}",
        db.view_at(l0).out_edges(1).map(|e| db.view_at(l0).target(e)).collect::<Vec<_>>()
    );

    // S4: in-edges of node 3 after S1 (built above via reverse_edges = true).
    println!(
        "level {l0}: in(3) = {:?}",
        db.view_at(l0).in_edges(3).map(|e| db.view_at(l0).target(e)).collect::<Vec<_>>()
    );

    // S3: prune level 0, keeping only the most recent snapshot.
    db.set_min_level(l1).expect("set_min_level");
    println!("min_level is now {}", db.min_level());
    assert_eq!(db.view_at(0).out_edges(1).count(), 0);
}
