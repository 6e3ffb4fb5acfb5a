use std::collections::BTreeMap;

use shale::{Config, Direction, GraphEngine};
use tempfile::TempDir;

fn config_with_limit(dir: &TempDir, mem_limit_mb: u64) -> Config {
    Config {
        base_dir: dir.path().to_path_buf(),
        block_size: 4,
        batch_size: 4,
        hot_block_threshold: 2,
        max_hot_mem_bytes: 1 << 20,
        emergency_pool_bytes: 1 << 20,
        mem_limit_mb,
        monitor_interval_ms: 50,
        workers: 2,
        ..Config::default()
    }
}

fn mesh_input() -> String {
    let mut input = String::from("src,dst,edge_label,src_label,dst_label\n");
    for i in 0..10u32 {
        for j in 0..10u32 {
            if i != j {
                input.push_str(&format!("m{i},m{j},LINK,V,V\n"));
            }
        }
    }
    input
}

fn snapshot(engine: &GraphEngine) -> BTreeMap<(String, u8), Vec<String>> {
    let mut all = BTreeMap::new();
    for v in 0..engine.vertex_count() as u32 {
        let key = engine.vertex_key(v).expect("interned key");
        for direction in [Direction::Out, Direction::In] {
            let mut neighbors: Vec<String> = engine
                .neighbors(v, direction)
                .expect("neighbors")
                .into_iter()
                .map(|n| engine.vertex_key(n).expect("neighbor key"))
                .collect();
            neighbors.sort();
            all.insert((key.clone(), direction.to_byte()), neighbors);
        }
    }
    all
}

// A 1 MiB ceiling keeps the usage ratio far above the threshold, so every
// batch boundary takes the spill-and-shrink path; the result must match a
// build that never throttled.
#[test]
fn throttled_build_equals_unthrottled_build() {
    let throttled_dir = TempDir::new().expect("temp dir");
    let throttled = GraphEngine::open(config_with_limit(&throttled_dir, 1)).expect("open");
    let stats = throttled.ingest(mesh_input().as_bytes()).expect("ingest");
    assert!(
        stats.backpressure_events > 0,
        "a 1 MiB ceiling must trip the 0.9 threshold"
    );
    assert_eq!(stats.edges, 90);

    let relaxed_dir = TempDir::new().expect("temp dir");
    let relaxed = GraphEngine::open(config_with_limit(&relaxed_dir, 1 << 40)).expect("open");
    let relaxed_stats = relaxed.ingest(mesh_input().as_bytes()).expect("ingest");
    assert_eq!(relaxed_stats.backpressure_events, 0);
    assert_eq!(relaxed_stats.edges, 90);

    assert_eq!(snapshot(&throttled), snapshot(&relaxed));
}

#[test]
fn malformed_records_are_skipped_without_consuming_edge_ids() {
    let dir = TempDir::new().expect("temp dir");
    let engine = GraphEngine::open(config_with_limit(&dir, 1 << 40)).expect("open");
    let input = "src,dst,edge_label,src_label,dst_label\n\
                 a,b,K,P,P\n\
                 broken,record,only\n\
                 c,d,K,P,P\n";
    let stats = engine.ingest(input.as_bytes()).expect("ingest");

    assert_eq!(stats.records_parsed, 2);
    assert_eq!(stats.records_skipped, 1);
    assert_eq!(stats.edges, 2, "skipped records do not advance the counter");

    let mut edge_ids = Vec::new();
    for v in 0..engine.vertex_count() as u32 {
        for (edge, _) in engine.adjacency(v, Direction::Out).expect("iterator") {
            edge_ids.push(edge);
        }
    }
    edge_ids.sort_unstable();
    assert_eq!(edge_ids, vec![0, 1]);
}

#[test]
fn empty_trailing_fields_are_tolerated() {
    let dir = TempDir::new().expect("temp dir");
    let engine = GraphEngine::open(config_with_limit(&dir, 1 << 40)).expect("open");
    let input = "src,dst,edge_label,src_label,dst_label\n\
                 a,b,K,,\n";
    let stats = engine.ingest(input.as_bytes()).expect("ingest");
    assert_eq!(stats.records_parsed, 1);
    assert_eq!(engine.out_degree(0).expect("degree"), 1);
}

#[test]
fn ingest_stats_count_labels_and_blocks() {
    let dir = TempDir::new().expect("temp dir");
    let engine = GraphEngine::open(config_with_limit(&dir, 1 << 40)).expect("open");
    let input = "src,dst,edge_label,src_label,dst_label\n\
                 a,b,KNOWS,Person,Person\n\
                 b,c,LIKES,Person,Post\n\
                 c,d,LIKES,Post,Post\n";
    let stats = engine.ingest(input.as_bytes()).expect("ingest");

    assert_eq!(stats.distinct_vertices, 4);
    assert_eq!(stats.distinct_vertex_labels, 2);
    assert_eq!(stats.distinct_edge_labels, 2);
    // Four vertices fit in block 0, which sits under the hot threshold.
    assert_eq!(stats.hot_blocks, 1);
    assert_eq!(stats.cold_blocks, 0);
}

#[test]
fn label_space_exhaustion_aborts_ingest() {
    let dir = TempDir::new().expect("temp dir");
    let engine = GraphEngine::open(config_with_limit(&dir, 1 << 40)).expect("open");
    let mut input = String::from("src,dst,edge_label,src_label,dst_label\n");
    for i in 0..300 {
        input.push_str(&format!("a,b,EDGE_{i},P,P\n"));
    }
    let result = engine.ingest(input.as_bytes());
    assert!(matches!(
        result,
        Err(shale::GraphError::LabelSpaceExhausted)
    ));
}

#[test]
fn vertex_manifest_dedups_across_batches() {
    let dir = TempDir::new().expect("temp dir");
    let config = Config {
        write_vertex_manifest: true,
        // Force a run flush after nearly every record.
        vertex_run_bytes: 32,
        ..config_with_limit(&dir, 1 << 40)
    };
    let engine = GraphEngine::open(config).expect("open");
    let input = "src,dst,edge_label,src_label,dst_label\n\
                 a,b,K,P,Q\n\
                 b,c,K,Q,R\n\
                 a,c,K,P,R\n";
    let stats = engine.ingest(input.as_bytes()).expect("ingest");
    assert_eq!(stats.manifest_vertices, Some(3));

    let manifest = shale::storage::VertexManifest::open(dir.path()).expect("open manifest");
    let entries: Vec<(String, String)> = manifest
        .entries()
        .expect("entries")
        .map(|e| e.expect("entry"))
        .collect();
    let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"], "sorted and deduplicated");
}
