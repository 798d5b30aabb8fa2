//! Tiered search: intent classification and dispatch across the accession
//! FTS tier, the lazy inverted index, and the optional vector index.
//!
//! Lock ordering is fixed: the store connection is released before the
//! inverted index mutex is taken, which is released before the vector
//! index; no call path ever holds two tiers at once.

pub mod analyzer;
pub mod builder;
pub mod inverted;
pub mod vector;

pub use builder::{BuildReport, IndexBuilder};
pub use inverted::{IdleSweeper, IndexDoc, IndexHit, LazyIndex, SearchFilters};
pub use vector::{VectorIndex, VectorWriter};

use crate::embed::Embedder;
use crate::error::SrakeError;
use crate::record::is_accession;
use crate::search::analyzer::{highlight, split_terms};
use crate::store::{fts, MetadataStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Keywords that route a query to the technical tier.
const TECHNICAL_KEYWORDS: &[&str] = &[
    "illumina",
    "pacbio",
    "rna-seq",
    "wgs",
    "chip-seq",
    "atac-seq",
    "single",
    "paired",
    "transcriptome",
    "genome",
];

/// Keywords that route a query to the study tier.
const STUDY_KEYWORDS: &[&str] = &[
    "cancer",
    "disease",
    "patient",
    "treatment",
    "study",
    "clinical",
    "cohort",
    "human",
    "mouse",
    "cell",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchIntent {
    AccessionLookup,
    TechnicalSearch,
    StudySearch,
    GeneralSearch,
}

/// Deterministic, case-insensitive intent rules, evaluated in order.
pub fn classify(query: &str) -> SearchIntent {
    let trimmed = query.trim();
    if is_accession(trimmed) {
        return SearchIntent::AccessionLookup;
    }
    let lower = trimmed.to_lowercase();
    if TECHNICAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return SearchIntent::TechnicalSearch;
    }
    if STUDY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return SearchIntent::StudySearch;
    }
    SearchIntent::GeneralSearch
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Intent-classified dispatch.
    #[default]
    Auto,
    /// Inverted index only.
    Keyword,
    /// Accession FTS tier only.
    Fts,
    /// Vector similarity only.
    Vector,
    /// Weighted lexical + vector scoring.
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Keyword => "keyword",
            Self::Fts => "fts",
            Self::Vector => "vector",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Band thresholds: high > 0.8, medium ∈ [0.5, 0.8], low < 0.5.
    pub fn from_score(score: f32) -> Self {
        if score > 0.8 {
            Self::High
        } else if score >= 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    #[serde(default)]
    pub mode: SearchMode,
    pub filters: SearchFilters,
    /// Vector weight α for hybrid scoring; config default when absent.
    pub hybrid_weight: Option<f32>,
    /// Drop hits whose similarity is below this.
    pub similarity_threshold: Option<f32>,
    /// Drop hits whose final score is below this.
    pub min_score: Option<f32>,
    /// Keep only the top N percent after ordering.
    pub top_percentile: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub confidence: Confidence,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub fields: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetValue {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub query: String,
    pub total_hits: u64,
    pub hits: Vec<SearchHit>,
    pub facets: HashMap<String, Vec<FacetValue>>,
    pub mode: String,
    pub time_ms: u64,
}

/// Dispatches queries across the three tiers.
pub struct SearchRouter {
    index: Arc<LazyIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    vector_path: std::path::PathBuf,
    vector: Mutex<Option<Arc<VectorIndex>>>,
    default_limit: usize,
    hybrid_weight: f32,
    timeout: std::time::Duration,
}

impl SearchRouter {
    pub fn new(
        index: Arc<LazyIndex>,
        vector_path: &Path,
        embedder: Option<Arc<dyn Embedder>>,
        default_limit: usize,
        hybrid_weight: f32,
    ) -> Self {
        Self {
            index,
            embedder,
            vector_path: vector_path.to_path_buf(),
            vector: Mutex::new(None),
            default_limit,
            hybrid_weight,
            timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn index(&self) -> &Arc<LazyIndex> {
        &self.index
    }

    /// Route one query. `store` is only touched for the FTS tier.
    pub fn search(
        &self,
        store: &MetadataStore,
        query: &str,
        opts: &SearchOptions,
    ) -> crate::Result<SearchResult> {
        let started = Instant::now();
        let query = query.trim();
        let limit = opts.limit.unwrap_or(self.default_limit);

        let intent = classify(query);
        let (mode_label, total, mut hits) = match (opts.mode, intent) {
            (SearchMode::Fts, _) | (SearchMode::Auto, SearchIntent::AccessionLookup) => {
                let hits = self.accession_tier(store, query, limit)?;
                ("fts", hits.len() as u64, hits)
            }
            (SearchMode::Vector, _) => {
                let hits = self.vector_tier(query, limit)?;
                ("vector", hits.len() as u64, hits)
            }
            (SearchMode::Hybrid, _) | (SearchMode::Auto, SearchIntent::StudySearch) => {
                self.hybrid_tier(query, opts, limit, started)?
            }
            (SearchMode::Keyword, _) | (SearchMode::Auto, SearchIntent::TechnicalSearch) => {
                let filters = merge_filters(&opts.filters, extract_filters(query));
                let (total, hits) = self.keyword_tier(query, &filters, limit, opts.offset)?;
                ("keyword", total, hits)
            }
            (SearchMode::Auto, SearchIntent::GeneralSearch) => {
                match self.keyword_tier(query, &opts.filters, limit, opts.offset) {
                    Ok((total, hits)) => ("keyword", total, hits),
                    Err(err) => {
                        // degraded mode: fall back to the SQL tier
                        warn!(error = %err, "inverted index unavailable, falling back to FTS");
                        let hits = self.accession_tier(store, query, limit)?;
                        ("fts", hits.len() as u64, hits)
                    }
                }
            }
        };

        apply_quality_filters(&mut hits, opts);
        let facets = compute_facets(&hits);

        Ok(SearchResult {
            query: query.to_string(),
            total_hits: total,
            hits,
            facets,
            mode: mode_label.to_string(),
            time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// C8: accession tier, never touches the inverted index.
    fn accession_tier(
        &self,
        store: &MetadataStore,
        query: &str,
        limit: usize,
    ) -> crate::Result<Vec<SearchHit>> {
        let rows = if is_accession(query) {
            fts::lookup_accession(&store.conn, query)?
        } else {
            fts::search(&store.conn, query, limit)?
        };
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|row| {
                let mut fields = HashMap::new();
                if !row.label.is_empty() {
                    fields.insert("label".to_string(), row.label);
                }
                SearchHit {
                    id: row.accession,
                    score: 1.0,
                    similarity: None,
                    confidence: Confidence::High,
                    doc_type: row.doc_type,
                    fields,
                    highlights: Vec::new(),
                }
            })
            .collect())
    }

    /// C7: lexical tier.
    fn keyword_tier(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
        offset: usize,
    ) -> crate::Result<(u64, Vec<SearchHit>)> {
        let (total, index_hits) = self.index.search(query, filters, limit, offset)?;
        let max_score = index_hits
            .iter()
            .map(|h| h.score)
            .fold(f32::EPSILON, f32::max);
        let terms = split_terms(query);

        let hits = index_hits
            .into_iter()
            .map(|hit| to_search_hit(hit, max_score, &terms, None))
            .collect();
        Ok((total as u64, hits))
    }

    /// C9: pure vector tier.
    fn vector_tier(&self, query: &str, limit: usize) -> crate::Result<Vec<SearchHit>> {
        let vector_index = self.vector_index()?;
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| SrakeError::ConfigInvalid("no embedding endpoint configured".into()))?;
        let query_vector = embedder.embed(query)?;

        let hits = vector_index
            .search(&query_vector, limit, None)
            .into_iter()
            .map(|(accession, cos)| SearchHit {
                id: accession,
                score: cos,
                similarity: Some(cos),
                confidence: Confidence::from_score(cos),
                doc_type: "study".to_string(),
                fields: HashMap::new(),
                highlights: Vec::new(),
            })
            .collect();
        Ok(hits)
    }

    /// C7 + C9: lexical hits rescored as
    /// `(1 − α)·norm(lexical) + α·cosine`.
    fn hybrid_tier(
        &self,
        query: &str,
        opts: &SearchOptions,
        limit: usize,
        started: Instant,
    ) -> crate::Result<(&'static str, u64, Vec<SearchHit>)> {
        let (total, lexical) = self.index.search(query, &opts.filters, limit, opts.offset)?;
        let max_score = lexical.iter().map(|h| h.score).fold(f32::EPSILON, f32::max);
        let terms = split_terms(query);

        // vector tier is optional; a missing embedder or index, or an
        // exhausted time budget, degrades to pure lexical scoring
        let similarities = if deadline_passed(started, self.timeout) {
            None
        } else {
            self.similarities_for(query, &lexical)
        };

        let alpha = opts.hybrid_weight.unwrap_or(self.hybrid_weight).clamp(0.0, 1.0);
        let mut hits: Vec<SearchHit> = lexical
            .into_iter()
            .map(|hit| {
                let similarity = similarities
                    .as_ref()
                    .and_then(|s| s.get(hit.accession.as_str()).copied());
                let mut search_hit = to_search_hit(hit, max_score, &terms, similarity);
                if let Some(cos) = similarity {
                    search_hit.score = (1.0 - alpha) * search_hit.score + alpha * cos;
                    search_hit.confidence = Confidence::from_score(cos);
                }
                search_hit
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));

        let label = if similarities.is_some() { "hybrid" } else { "keyword" };
        Ok((label, total as u64, hits))
    }

    fn similarities_for(
        &self,
        query: &str,
        lexical: &[IndexHit],
    ) -> Option<HashMap<String, f32>> {
        let embedder = self.embedder.as_ref()?;
        let vector_index = self.vector_index().ok()?;
        let query_vector = embedder.embed(query).ok()?;

        let candidates: HashSet<String> =
            lexical.iter().map(|h| h.accession.clone()).collect();
        let scored = vector_index.search(&query_vector, candidates.len(), Some(&candidates));
        Some(scored.into_iter().collect())
    }

    /// Lazily open (and cache) the vector companion file.
    fn vector_index(&self) -> crate::Result<Arc<VectorIndex>> {
        let mut guard = self.vector.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(index) = guard.as_ref() {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(VectorIndex::open(&self.vector_path)?);
        debug!(vectors = index.len(), "vector index attached");
        *guard = Some(Arc::clone(&index));
        Ok(Arc::clone(guard.as_ref().expect("just set")))
    }
}

fn deadline_passed(started: Instant, timeout: std::time::Duration) -> bool {
    started.elapsed() >= timeout
}

fn to_search_hit(
    hit: IndexHit,
    max_score: f32,
    terms: &[String],
    similarity: Option<f32>,
) -> SearchHit {
    let normalized = (hit.score / max_score).clamp(0.0, 1.0);
    let mut highlights = Vec::new();
    for field in ["title", "abstract"] {
        if let Some(text) = hit.fields.get(field) {
            if let Some(snippet) = highlight(text, terms, 160) {
                highlights.push(snippet);
            }
        }
    }
    SearchHit {
        id: hit.accession,
        score: normalized,
        similarity,
        confidence: Confidence::from_score(similarity.unwrap_or(normalized)),
        doc_type: hit.doc_type,
        fields: hit.fields,
        highlights,
    }
}

/// Pull exact-match filters out of a technical query's text.
fn extract_filters(query: &str) -> SearchFilters {
    let lower = query.to_lowercase();
    let mut filters = SearchFilters::default();
    for platform in ["illumina", "pacbio", "oxford_nanopore", "ion_torrent"] {
        if lower.contains(platform) {
            filters.platform = Some(platform.to_string());
            break;
        }
    }
    for strategy in ["rna-seq", "chip-seq", "atac-seq", "wgs", "wxs", "amplicon"] {
        if lower.contains(strategy) {
            filters.library_strategy = Some(strategy.to_string());
            break;
        }
    }
    filters
}

fn merge_filters(explicit: &SearchFilters, extracted: SearchFilters) -> SearchFilters {
    SearchFilters {
        organism: explicit.organism.clone(),
        platform: explicit.platform.clone().or(extracted.platform),
        library_strategy: explicit
            .library_strategy
            .clone()
            .or(extracted.library_strategy),
    }
}

/// Post-scoring quality filters, applied in threshold → percentile order.
fn apply_quality_filters(hits: &mut Vec<SearchHit>, opts: &SearchOptions) {
    if let Some(threshold) = opts.similarity_threshold {
        hits.retain(|h| h.similarity.is_none_or(|s| s >= threshold));
    }
    if let Some(min_score) = opts.min_score {
        hits.retain(|h| h.score >= min_score);
    }
    if let Some(percentile) = opts.top_percentile {
        let keep = ((hits.len() as f32) * (percentile / 100.0)).ceil() as usize;
        hits.truncate(keep.max(1).min(hits.len()));
    }
}

/// Value counts over the hit set's keyword fields.
fn compute_facets(hits: &[SearchHit]) -> HashMap<String, Vec<FacetValue>> {
    let mut facets = HashMap::new();
    for field in ["organism", "platform", "library_strategy"] {
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for hit in hits {
            if let Some(value) = hit.fields.get(field) {
                *counts.entry(value.as_str()).or_insert(0) += 1;
            }
        }
        if counts.is_empty() {
            continue;
        }
        let mut values: Vec<FacetValue> = counts
            .into_iter()
            .map(|(value, count)| FacetValue {
                value: value.to_string(),
                count,
            })
            .collect();
        values.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        facets.insert(field.to_string(), values);
    }
    facets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_accession() {
        assert_eq!(classify("SRR12345678"), SearchIntent::AccessionLookup);
        assert_eq!(classify("  ERP000123  "), SearchIntent::AccessionLookup);
        assert_eq!(classify("DRX99"), SearchIntent::AccessionLookup);
    }

    #[test]
    fn test_intent_technical_before_study() {
        // "human" is a study keyword but "illumina" wins by rule order
        assert_eq!(classify("illumina human"), SearchIntent::TechnicalSearch);
        assert_eq!(classify("paired-end reads"), SearchIntent::TechnicalSearch);
    }

    #[test]
    fn test_intent_study_and_general() {
        assert_eq!(classify("breast cancer cohort"), SearchIntent::StudySearch);
        assert_eq!(classify("metabolic pathways"), SearchIntent::GeneralSearch);
    }

    #[test]
    fn test_confidence_bands() {
        assert_eq!(Confidence::from_score(0.81), Confidence::High);
        assert_eq!(Confidence::from_score(0.8), Confidence::Medium);
        assert_eq!(Confidence::from_score(0.5), Confidence::Medium);
        assert_eq!(Confidence::from_score(0.49), Confidence::Low);
    }

    #[test]
    fn test_extract_filters() {
        let filters = extract_filters("illumina rna-seq liver");
        assert_eq!(filters.platform.as_deref(), Some("illumina"));
        assert_eq!(filters.library_strategy.as_deref(), Some("rna-seq"));
    }

    fn hit(id: &str, score: f32, similarity: Option<f32>) -> SearchHit {
        SearchHit {
            id: id.into(),
            score,
            similarity,
            confidence: Confidence::from_score(similarity.unwrap_or(score)),
            doc_type: "study".into(),
            fields: HashMap::new(),
            highlights: Vec::new(),
        }
    }

    #[test]
    fn test_similarity_threshold_monotonic() {
        let base = vec![
            hit("a", 0.9, Some(0.95)),
            hit("b", 0.8, Some(0.75)),
            hit("c", 0.7, Some(0.5)),
        ];

        let mut loose = base.clone();
        apply_quality_filters(
            &mut loose,
            &SearchOptions {
                similarity_threshold: Some(0.5),
                ..Default::default()
            },
        );
        let mut strict = base.clone();
        apply_quality_filters(
            &mut strict,
            &SearchOptions {
                similarity_threshold: Some(0.95),
                ..Default::default()
            },
        );
        assert!(strict.len() <= loose.len());
        assert_eq!(strict.len(), 1);
        assert_eq!(loose.len(), 3);
    }

    #[test]
    fn test_top_percentile_keeps_head() {
        let mut hits = vec![
            hit("a", 0.9, None),
            hit("b", 0.8, None),
            hit("c", 0.7, None),
            hit("d", 0.6, None),
        ];
        apply_quality_filters(
            &mut hits,
            &SearchOptions {
                top_percentile: Some(50.0),
                ..Default::default()
            },
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn test_facet_counts() {
        let mut a = hit("a", 0.9, None);
        a.fields.insert("platform".into(), "illumina".into());
        let mut b = hit("b", 0.8, None);
        b.fields.insert("platform".into(), "illumina".into());
        let mut c = hit("c", 0.7, None);
        c.fields.insert("platform".into(), "pacbio".into());

        let facets = compute_facets(&[a, b, c]);
        let platforms = &facets["platform"];
        assert_eq!(platforms[0].value, "illumina");
        assert_eq!(platforms[0].count, 2);
        assert_eq!(platforms[1].count, 1);
    }
}
