//! Lazy inverted index over studies and experiments.
//!
//! The index is never loaded at process start. The first query opens it
//! and stamps a last-used time; an idle sweeper closes it again after the
//! configured timeout, and the next query transparently reopens it. Load
//! and close counters are observable so routing decisions (accession
//! lookups must not load this index) can be asserted.

use crate::error::SrakeError;
use crate::search::analyzer::{expand_synonyms, split_terms, text_analyzer, TEXT_ANALYZER};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info};

/// Memory budget handed to the tantivy writer.
const WRITER_MEM: usize = 50_000_000;

/// One document of the inverted index. Numeric run/sample statistics are
/// deliberately absent; they stay in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexDoc {
    pub accession: String,
    /// `study` or `experiment`.
    pub doc_type: String,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub organism: Option<String>,
    pub description: Option<String>,
    pub platform: Option<String>,
    pub library_strategy: Option<String>,
}

/// Exact-match keyword filters, lowercased.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub organism: Option<String>,
    pub platform: Option<String>,
    pub library_strategy: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.organism.is_none() && self.platform.is_none() && self.library_strategy.is_none()
    }
}

/// A lexical hit with its stored fields.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub accession: String,
    pub doc_type: String,
    pub score: f32,
    pub fields: HashMap<String, String>,
}

struct Fields {
    accession: Field,
    doc_type: Field,
    title: Field,
    abstract_text: Field,
    organism: Field,
    description: Field,
    platform: Field,
    library_strategy: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let text = || {
        TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(TEXT_ANALYZER)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored()
    };
    let text_unstored = || {
        TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TEXT_ANALYZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
    };

    let fields = Fields {
        accession: builder.add_text_field("accession", STRING | STORED),
        doc_type: builder.add_text_field("doc_type", STRING | STORED),
        title: builder.add_text_field("title", text()),
        abstract_text: builder.add_text_field("abstract", text()),
        organism: builder.add_text_field("organism", text()),
        description: builder.add_text_field("description", text_unstored()),
        platform: builder.add_text_field("platform", STRING | STORED),
        library_strategy: builder.add_text_field("library_strategy", STRING | STORED),
    };
    (builder.build(), fields)
}

struct OpenIndex {
    index: Index,
    reader: IndexReader,
    writer: Option<IndexWriter>,
    last_used: Instant,
}

enum IndexState {
    Closed,
    Open(Box<OpenIndex>),
}

pub struct LazyIndex {
    path: PathBuf,
    idle_timeout: Duration,
    state: Mutex<IndexState>,
    loads: AtomicU64,
    closes: AtomicU64,
}

impl LazyIndex {
    /// Create a handle; nothing is opened until the first operation.
    pub fn new(path: &Path, idle_timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            idle_timeout,
            state: Mutex::new(IndexState::Closed),
            loads: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Times the index has been (re)opened.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Times the idle sweep has closed the index.
    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), IndexState::Open(_))
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the index if closed; bump the idle clock either way.
    fn ensure<'a>(&self, guard: &'a mut MutexGuard<'_, IndexState>) -> crate::Result<&'a mut OpenIndex> {
        if matches!(**guard, IndexState::Closed) {
            std::fs::create_dir_all(&self.path)?;
            let directory = tantivy::directory::MmapDirectory::open(&self.path)
                .map_err(|e| SrakeError::Index(e.to_string()))?;
            let (schema, _) = build_schema();
            let index = Index::open_or_create(directory, schema)
                .map_err(|e| SrakeError::Index(e.to_string()))?;
            index.tokenizers().register(TEXT_ANALYZER, text_analyzer());
            let reader = index
                .reader_builder()
                .reload_policy(ReloadPolicy::Manual)
                .try_into()
                .map_err(|e: tantivy::TantivyError| SrakeError::Index(e.to_string()))?;

            self.loads.fetch_add(1, Ordering::Relaxed);
            info!(path = %self.path.display(), loads = self.load_count(), "inverted index opened");

            **guard = IndexState::Open(Box::new(OpenIndex {
                index,
                reader,
                writer: None,
                last_used: Instant::now(),
            }));
        }

        match &mut **guard {
            IndexState::Open(open) => {
                open.last_used = Instant::now();
                Ok(open)
            }
            IndexState::Closed => unreachable!("ensured open above"),
        }
    }

    /// Close the index when it has been idle past the timeout. Returns
    /// true if a close happened.
    pub fn close_if_idle(&self) -> bool {
        let mut guard = self.lock();
        let idle = match &*guard {
            IndexState::Open(open) => open.last_used.elapsed() >= self.idle_timeout,
            IndexState::Closed => false,
        };
        if idle {
            *guard = IndexState::Closed;
            self.closes.fetch_add(1, Ordering::Relaxed);
            debug!(path = %self.path.display(), "inverted index closed after idle timeout");
        }
        idle
    }

    /// Number of indexed documents.
    pub fn doc_count(&self) -> crate::Result<u64> {
        let mut guard = self.lock();
        let open = self.ensure(&mut guard)?;
        Ok(open.reader.searcher().num_docs())
    }

    /// Append documents to the current write batch (no commit).
    pub fn index_batch(&self, docs: &[IndexDoc]) -> crate::Result<()> {
        let mut guard = self.lock();
        let open = self.ensure(&mut guard)?;
        let (_, fields) = build_schema();

        if open.writer.is_none() {
            open.writer = Some(
                open.index
                    .writer(WRITER_MEM)
                    .map_err(|e| SrakeError::Index(e.to_string()))?,
            );
        }
        let writer = open.writer.as_mut().expect("writer created above");

        for d in docs {
            let mut document = doc!(
                fields.accession => d.accession.clone(),
                fields.doc_type => d.doc_type.clone(),
            );
            if let Some(v) = &d.title {
                document.add_text(fields.title, v);
            }
            if let Some(v) = &d.abstract_text {
                document.add_text(fields.abstract_text, v);
            }
            if let Some(v) = &d.organism {
                document.add_text(fields.organism, v);
            }
            if let Some(v) = &d.description {
                document.add_text(fields.description, v);
            }
            if let Some(v) = &d.platform {
                document.add_text(fields.platform, v.to_lowercase());
            }
            if let Some(v) = &d.library_strategy {
                document.add_text(fields.library_strategy, v.to_lowercase());
            }
            writer
                .add_document(document)
                .map_err(|e| SrakeError::Index(e.to_string()))?;
        }
        Ok(())
    }

    /// Commit pending writes and refresh the reader.
    pub fn commit(&self) -> crate::Result<()> {
        let mut guard = self.lock();
        let open = self.ensure(&mut guard)?;
        if let Some(writer) = open.writer.as_mut() {
            writer
                .commit()
                .map_err(|e| SrakeError::Index(e.to_string()))?;
        }
        open.reader
            .reload()
            .map_err(|e| SrakeError::Index(e.to_string()))?;
        Ok(())
    }

    /// Drop every document (start of a rebuild).
    pub fn clear(&self) -> crate::Result<()> {
        let mut guard = self.lock();
        let open = self.ensure(&mut guard)?;
        if open.writer.is_none() {
            open.writer = Some(
                open.index
                    .writer(WRITER_MEM)
                    .map_err(|e| SrakeError::Index(e.to_string()))?,
            );
        }
        let writer = open.writer.as_mut().expect("writer created above");
        writer
            .delete_all_documents()
            .map_err(|e| SrakeError::Index(e.to_string()))?;
        writer
            .commit()
            .map_err(|e| SrakeError::Index(e.to_string()))?;
        open.reader
            .reload()
            .map_err(|e| SrakeError::Index(e.to_string()))?;
        Ok(())
    }

    /// Lexical search: synonym-expanded text query plus exact keyword
    /// filters. Returns the total hit count and the requested page.
    pub fn search(
        &self,
        text: &str,
        filters: &SearchFilters,
        limit: usize,
        offset: usize,
    ) -> crate::Result<(usize, Vec<IndexHit>)> {
        let mut guard = self.lock();
        let open = self.ensure(&mut guard)?;
        let (_, fields) = build_schema();
        let searcher = open.reader.searcher();

        let query = build_query(&open.index, &fields, text, filters)?;
        let fetch = (limit + offset).max(1);
        let (top, total) = searcher
            .search(&query, &(TopDocs::with_limit(fetch), Count))
            .map_err(|e| SrakeError::Index(e.to_string()))?;

        let mut hits = collect_hits(&searcher, &fields, top.into_iter().skip(offset))?;

        // fuzzy fallback for single-term queries that found nothing
        if hits.is_empty() && total == 0 {
            let terms = split_terms(text);
            if terms.len() == 1 {
                let fuzzy = fuzzy_query(&fields, &terms[0]);
                let (top, fuzzy_total) = searcher
                    .search(&fuzzy, &(TopDocs::with_limit(limit.max(1)), Count))
                    .map_err(|e| SrakeError::Index(e.to_string()))?;
                hits = collect_hits(&searcher, &fields, top.into_iter())?;
                return Ok((fuzzy_total, hits));
            }
        }

        Ok((total, hits))
    }
}

fn build_query(
    index: &Index,
    fields: &Fields,
    text: &str,
    filters: &SearchFilters,
) -> crate::Result<Box<dyn Query>> {
    let default_fields = vec![
        fields.title,
        fields.abstract_text,
        fields.organism,
        fields.description,
    ];
    let parser = QueryParser::for_index(index, default_fields.clone());

    let expanded = expand_synonyms(text);
    let parsed: Box<dyn Query> = match parser.parse_query(&expanded) {
        Ok(query) => query,
        Err(_) => {
            // unparseable syntax: degrade to an OR over the bare terms
            let clauses: Vec<(Occur, Box<dyn Query>)> = split_terms(&expanded)
                .into_iter()
                .flat_map(|term| {
                    default_fields.iter().map(move |f| {
                        (
                            Occur::Should,
                            Box::new(TermQuery::new(
                                Term::from_field_text(*f, &term),
                                IndexRecordOption::WithFreqs,
                            )) as Box<dyn Query>,
                        )
                    })
                })
                .collect();
            Box::new(BooleanQuery::new(clauses))
        }
    };

    if filters.is_empty() {
        return Ok(parsed);
    }

    let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, parsed)];
    let keyword = |field: Field, value: &str| -> (Occur, Box<dyn Query>) {
        (
            Occur::Must,
            Box::new(TermQuery::new(
                Term::from_field_text(field, &value.to_lowercase()),
                IndexRecordOption::Basic,
            )),
        )
    };
    if let Some(organism) = &filters.organism {
        // organism is an analyzed field; require each term
        for term in split_terms(organism) {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(fields.organism, &term),
                    IndexRecordOption::Basic,
                )),
            ));
        }
    }
    if let Some(platform) = &filters.platform {
        clauses.push(keyword(fields.platform, platform));
    }
    if let Some(strategy) = &filters.library_strategy {
        clauses.push(keyword(fields.library_strategy, strategy));
    }
    Ok(Box::new(BooleanQuery::new(clauses)))
}

fn fuzzy_query(fields: &Fields, term: &str) -> BooleanQuery {
    let clauses: Vec<(Occur, Box<dyn Query>)> = [fields.title, fields.organism]
        .into_iter()
        .map(|field| {
            (
                Occur::Should,
                Box::new(FuzzyTermQuery::new(
                    Term::from_field_text(field, term),
                    1,
                    true,
                )) as Box<dyn Query>,
            )
        })
        .collect();
    BooleanQuery::new(clauses)
}

fn collect_hits(
    searcher: &tantivy::Searcher,
    fields: &Fields,
    top: impl Iterator<Item = (f32, tantivy::DocAddress)>,
) -> crate::Result<Vec<IndexHit>> {
    let mut hits = Vec::new();
    for (score, address) in top {
        let document: TantivyDocument = searcher
            .doc(address)
            .map_err(|e| SrakeError::Index(e.to_string()))?;
        let get = |field: Field| {
            document
                .get_first(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let Some(accession) = get(fields.accession) else {
            continue;
        };
        let mut stored = HashMap::new();
        for (name, field) in [
            ("title", fields.title),
            ("abstract", fields.abstract_text),
            ("organism", fields.organism),
            ("platform", fields.platform),
            ("library_strategy", fields.library_strategy),
        ] {
            if let Some(value) = get(field) {
                stored.insert(name.to_string(), value);
            }
        }

        hits.push(IndexHit {
            accession,
            doc_type: get(fields.doc_type).unwrap_or_else(|| "study".to_string()),
            score,
            fields: stored,
        });
    }
    Ok(hits)
}

/// Background thread that closes the index after idle expiry. Owned,
/// scoped: dropping the sweeper stops the thread.
pub struct IdleSweeper {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl IdleSweeper {
    pub fn start(index: Arc<LazyIndex>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let tick = (index.idle_timeout / 4).max(Duration::from_millis(100));
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(tick);
                index.close_if_idle();
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
