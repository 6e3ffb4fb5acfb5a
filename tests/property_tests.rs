use std::collections::{BTreeMap, HashMap};

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use shale::{Config, Direction, GraphEngine};
use tempfile::TempDir;

fn model_config(dir: &TempDir) -> Config {
    Config {
        base_dir: dir.path().to_path_buf(),
        block_size: 4,
        batch_size: 8,
        hot_block_threshold: 2,
        max_hot_mem_bytes: 1 << 20,
        emergency_pool_bytes: 1 << 20,
        mem_limit_mb: 1 << 40,
        monitor_interval_ms: 50,
        workers: 1,
        ..Config::default()
    }
}

fn build_input(edges: &[(u8, u8, u8)]) -> String {
    let mut input = String::from("src,dst,edge_label,src_label,dst_label\n");
    for &(src, dst, label) in edges {
        input.push_str(&format!("k{src},k{dst},L{label},V,V\n"));
    }
    input
}

// Extract every edge by iterating all vertices in both directions and
// grouping the halves by edge id.
fn extract_edges(engine: &GraphEngine) -> Vec<(String, String)> {
    let mut out_half: HashMap<u32, (u32, u32)> = HashMap::new();
    let mut in_half: HashMap<u32, (u32, u32)> = HashMap::new();
    for v in 0..engine.vertex_count() as u32 {
        let mut iter = engine.adjacency(v, Direction::Out).expect("out iterator");
        while iter.has_next() {
            let (edge, neighbor) = iter.get().expect("valid under has_next");
            out_half.insert(edge, (v, neighbor));
            iter.advance();
        }
        for (edge, neighbor) in engine.adjacency(v, Direction::In).expect("in iterator") {
            in_half.insert(edge, (neighbor, v));
        }
    }
    assert_eq!(out_half.len(), in_half.len(), "every edge has both halves");

    let mut edges = Vec::with_capacity(out_half.len());
    for (edge, (src, dst)) in &out_half {
        let matching = in_half.get(edge).expect("in-half exists");
        assert_eq!(matching, &(*src, *dst), "halves agree on endpoints");
        edges.push((
            engine.vertex_key(*src).expect("src key"),
            engine.vertex_key(*dst).expect("dst key"),
        ));
    }
    edges
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // The multiset of edges survives the build: extraction over every
    // vertex in both directions reproduces the input projected onto
    // (src_key, dst_key), and degrees match a naive adjacency model.
    #[test]
    fn build_preserves_the_edge_multiset(
        edges in prop::collection::vec((0u8..12, 0u8..12, 0u8..3), 1..40)
    ) {
        let dir = TempDir::new().expect("temp dir");
        let engine = GraphEngine::open(model_config(&dir)).expect("open");
        let stats = engine.ingest(build_input(&edges).as_bytes()).expect("ingest");
        prop_assert_eq!(stats.edges as usize, edges.len());

        // Naive model: per-key out and in neighbor multisets.
        let mut model_out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut model_in: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for &(src, dst, _) in &edges {
            model_out.entry(format!("k{src}")).or_default().push(format!("k{dst}"));
            model_in.entry(format!("k{dst}")).or_default().push(format!("k{src}"));
        }

        for v in 0..engine.vertex_count() as u32 {
            let key = engine.vertex_key(v).expect("key");
            let mut got_out: Vec<String> = engine
                .neighbors(v, Direction::Out)
                .expect("out neighbors")
                .into_iter()
                .map(|n| engine.vertex_key(n).expect("neighbor key"))
                .collect();
            got_out.sort();
            let mut want_out = model_out.remove(&key).unwrap_or_default();
            want_out.sort();
            prop_assert_eq!(got_out, want_out);

            let mut got_in: Vec<String> = engine
                .neighbors(v, Direction::In)
                .expect("in neighbors")
                .into_iter()
                .map(|n| engine.vertex_key(n).expect("neighbor key"))
                .collect();
            got_in.sort();
            let mut want_in = model_in.remove(&key).unwrap_or_default();
            want_in.sort();
            prop_assert_eq!(got_in, want_in);
        }
        prop_assert!(model_out.is_empty(), "no modeled vertex went unvisited");
        prop_assert!(model_in.is_empty());

        let extracted = extract_edges(&engine);
        prop_assert_eq!(extracted.len(), edges.len());
    }

    // Degrees always equal the offset deltas in the owning block.
    #[test]
    fn degrees_match_offset_deltas(
        edges in prop::collection::vec((0u8..10, 0u8..10, 0u8..2), 1..25)
    ) {
        let dir = TempDir::new().expect("temp dir");
        let engine = GraphEngine::open(model_config(&dir)).expect("open");
        engine.ingest(build_input(&edges).as_bytes()).expect("ingest");

        for v in 0..engine.vertex_count() as u32 {
            let block = engine.cache().get(v / 4).expect("block");
            let local = (v % 4) as usize;
            let out = (block.offsets_out[local + 1] - block.offsets_out[local]) as usize;
            let into = (block.offsets_in[local + 1] - block.offsets_in[local]) as usize;
            prop_assert_eq!(engine.out_degree(v).expect("out"), out);
            prop_assert_eq!(engine.in_degree(v).expect("in"), into);
        }
    }
}

// A seeded random graph pushed through a throttled, evicting build still
// matches an untouched rebuild of the same input.
#[test]
fn seeded_stress_round_trip() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut edges = Vec::with_capacity(300);
    for _ in 0..300 {
        let src: u8 = rng.gen_range(0..40);
        let dst: u8 = rng.gen_range(0..40);
        let label: u8 = rng.gen_range(0..5);
        edges.push((src, dst, label));
    }
    let input = build_input(&edges);

    let stressed_dir = TempDir::new().expect("temp dir");
    let stressed_config = Config {
        mem_limit_mb: 1,
        max_hot_mem_bytes: 512,
        batch_size: 16,
        workers: 2,
        ..model_config(&stressed_dir)
    };
    let stressed = GraphEngine::open(stressed_config).expect("open stressed");
    let stats = stressed.ingest(input.as_bytes()).expect("ingest stressed");
    assert_eq!(stats.edges, 300);
    assert!(stats.backpressure_events > 0);

    let calm_dir = TempDir::new().expect("temp dir");
    let calm = GraphEngine::open(model_config(&calm_dir)).expect("open calm");
    calm.ingest(input.as_bytes()).expect("ingest calm");

    let collect = |engine: &GraphEngine| {
        let mut all: BTreeMap<(String, u8), Vec<String>> = BTreeMap::new();
        for v in 0..engine.vertex_count() as u32 {
            let key = engine.vertex_key(v).expect("key");
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
    };
    assert_eq!(collect(&stressed), collect(&calm));
}
