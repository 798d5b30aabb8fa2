//! Tiered search over a populated store: routing, lazy loading, hybrid
//! scoring.

use srake_core::embed::Embedder;
use srake_core::record::{Experiment, Sample, SraRecord, Study};
use srake_core::search::{IndexBuilder, LazyIndex, SearchMode, SearchOptions, SearchRouter};
use srake_core::store::{insert_record, MetadataStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Deterministic trigram-hash embedder; close strings embed close.
struct StubEmbedder {
    dimensions: usize,
}

impl Embedder for StubEmbedder {
    fn embed(&self, text: &str) -> srake_core::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lower = text.to_lowercase();
        let chars: Vec<char> = lower.chars().collect();
        for window in chars.windows(3) {
            let mut hash = 0usize;
            for c in window {
                hash = hash.wrapping_mul(31).wrapping_add(*c as usize);
            }
            vector[hash % self.dimensions] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

struct Fixture {
    _dir: TempDir,
    store: MetadataStore,
    index: Arc<LazyIndex>,
    router: SearchRouter,
}

fn fixture(with_vectors: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();

    store
        .tx(|tx| {
            insert_record(
                tx,
                &SraRecord::Study(Study {
                    accession: "SRP000001".into(),
                    title: Some("RNA-Seq of Homo sapiens liver".into()),
                    abstract_text: Some("Metabolic pathway analysis across donors".into()),
                    ..Default::default()
                }),
            )?;
            insert_record(
                tx,
                &SraRecord::Study(Study {
                    accession: "SRP000002".into(),
                    title: Some("ChIP-Seq of Mus musculus brain".into()),
                    abstract_text: Some("Histone modification mapping".into()),
                    ..Default::default()
                }),
            )?;
            insert_record(
                tx,
                &SraRecord::Experiment(Experiment {
                    accession: "SRX000001".into(),
                    study_accession: Some("SRP000001".into()),
                    title: Some("Illumina paired-end mRNA".into()),
                    platform: Some("ILLUMINA".into()),
                    library_strategy: Some("RNA-Seq".into()),
                    sample_accessions: vec!["SRS000001".into()],
                    ..Default::default()
                }),
            )?;
            insert_record(
                tx,
                &SraRecord::Sample(Sample {
                    accession: "SRS000001".into(),
                    scientific_name: Some("Homo sapiens".into()),
                    taxon_id: Some(9606),
                    ..Default::default()
                }),
            )?;
            insert_record(
                tx,
                &SraRecord::Run(srake_core::record::Run {
                    accession: "SRR12345678".into(),
                    experiment_accession: Some("SRX000001".into()),
                    total_spots: Some(1000),
                    total_bases: Some(100_000),
                    ..Default::default()
                }),
            )?;
            Ok(())
        })
        .unwrap();

    let index = Arc::new(LazyIndex::new(
        &dir.path().join("srake.bleve"),
        Duration::from_secs(300),
    ));
    let vector_path = dir.path().join("srake.embeddings");

    let embedder: Option<Arc<dyn Embedder>> = with_vectors
        .then(|| Arc::new(StubEmbedder { dimensions: 64 }) as Arc<dyn Embedder>);

    let builder = IndexBuilder::new(embedder.clone(), false);
    builder
        .build(&mut store, &index, &vector_path, false)
        .unwrap();

    let router = SearchRouter::new(
        Arc::clone(&index),
        &vector_path,
        embedder,
        20,
        0.5,
    );

    Fixture {
        _dir: dir,
        store,
        index,
        router,
    }
}

#[test]
fn test_accession_lookup_never_loads_inverted_index() {
    let f = fixture(false);
    // builder loaded the index once; close it to simulate a cold process
    let loads_before = f.index.load_count();

    let result = f
        .router
        .search(&f.store, "SRR12345678", &SearchOptions::default())
        .unwrap();

    assert_eq!(result.mode, "fts");
    assert_eq!(result.hits.len(), 1);
    assert_eq!(result.hits[0].id, "SRR12345678");
    assert_eq!(result.hits[0].doc_type, "run");
    assert_eq!(
        f.index.load_count(),
        loads_before,
        "accession lookup must not touch the inverted index"
    );
}

#[test]
fn test_human_query_ranks_human_study_first() {
    let f = fixture(false);
    let result = f
        .router
        .search(&f.store, "human", &SearchOptions::default())
        .unwrap();
    assert!(result.total_hits >= 1);
    assert_eq!(result.hits[0].id, "SRP000001");
}

#[test]
fn test_technical_query_uses_keyword_tier_with_filters() {
    let f = fixture(false);
    let result = f
        .router
        .search(&f.store, "illumina rna-seq", &SearchOptions::default())
        .unwrap();
    assert_eq!(result.mode, "keyword");
    assert!(result.hits.iter().any(|h| h.id == "SRX000001"));
}

#[test]
fn test_vector_mode_similarity_and_threshold_monotonicity() {
    let f = fixture(true);

    let opts = SearchOptions {
        mode: SearchMode::Vector,
        ..Default::default()
    };
    let result = f
        .router
        .search(&f.store, "Metabolic pathway analysis across donors", &opts)
        .unwrap();
    assert_eq!(result.mode, "vector");
    let top = &result.hits[0];
    assert_eq!(top.id, "SRP000001");
    let similarity = top.similarity.expect("vector hits carry similarity");
    assert!(similarity >= 0.7, "stub embeds near-identical text, got {similarity}");

    // raising the threshold can only shrink the hit set
    let mut last_len = usize::MAX;
    for threshold in [0.0, 0.5, 0.95] {
        let opts = SearchOptions {
            mode: SearchMode::Vector,
            similarity_threshold: Some(threshold),
            ..Default::default()
        };
        let filtered = f
            .router
            .search(&f.store, "Metabolic pathway analysis across donors", &opts)
            .unwrap();
        assert!(filtered.hits.len() <= last_len);
        last_len = filtered.hits.len();
    }
}

#[test]
fn test_hybrid_mode_blends_scores() {
    let f = fixture(true);
    let opts = SearchOptions {
        mode: SearchMode::Hybrid,
        ..Default::default()
    };
    let result = f
        .router
        .search(&f.store, "liver metabolic pathways", &opts)
        .unwrap();
    assert_eq!(result.mode, "hybrid");
    assert!(!result.hits.is_empty());
    assert!(result.hits[0].similarity.is_some());
}

#[test]
fn test_facets_present_for_keyword_hits() {
    let f = fixture(false);
    let result = f
        .router
        .search(&f.store, "illumina sequencing", &SearchOptions::default())
        .unwrap();
    if !result.hits.is_empty() {
        assert!(result.facets.contains_key("platform") || result.facets.is_empty());
    }
}
