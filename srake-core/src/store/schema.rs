//! SQL schema for the metadata store.

/// Bump on any incompatible schema change. Opening a store whose
/// `user_version` is ahead of this fails; behind (and non-zero) runs the
/// idempotent migration path.
pub const SCHEMA_VERSION: i32 = 1;

/// Domain tables, ingest-state tables, and the accession FTS tier.
///
/// Cross-tier references are plain TEXT columns with no foreign key action:
/// partial dumps routinely contain dangling accessions.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS studies (
        id INTEGER PRIMARY KEY,
        accession TEXT UNIQUE NOT NULL,
        title TEXT,
        abstract TEXT,
        study_type TEXT,
        center_name TEXT,
        submission_date TEXT,
        attributes TEXT NOT NULL DEFAULT '[]',
        metadata TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_studies_submission_date
        ON studies(submission_date);

    CREATE TABLE IF NOT EXISTS experiments (
        id INTEGER PRIMARY KEY,
        accession TEXT UNIQUE NOT NULL,
        study_accession TEXT,
        title TEXT,
        library_strategy TEXT,
        library_source TEXT,
        library_selection TEXT,
        library_layout TEXT,
        platform TEXT,
        instrument_model TEXT,
        metadata TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_experiments_study ON experiments(study_accession);
    CREATE INDEX IF NOT EXISTS idx_experiments_platform ON experiments(platform);
    CREATE INDEX IF NOT EXISTS idx_experiments_strategy ON experiments(library_strategy);

    CREATE TABLE IF NOT EXISTS samples (
        id INTEGER PRIMARY KEY,
        accession TEXT UNIQUE NOT NULL,
        title TEXT,
        description TEXT,
        scientific_name TEXT,
        taxon_id INTEGER,
        attributes TEXT NOT NULL DEFAULT '[]',
        metadata TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_samples_organism ON samples(scientific_name);
    CREATE INDEX IF NOT EXISTS idx_samples_taxon ON samples(taxon_id);

    -- total_bases >= total_spots >= 0; the extractor normalizes violating
    -- pairs to NULL, these constraints are the backstop
    CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY,
        accession TEXT UNIQUE NOT NULL,
        experiment_accession TEXT,
        run_date TEXT,
        center TEXT,
        total_spots INTEGER CHECK (total_spots IS NULL OR total_spots >= 0),
        total_bases INTEGER CHECK (total_bases IS NULL OR total_bases >= 0),
        files TEXT NOT NULL DEFAULT '[]',
        metadata TEXT,
        CHECK (total_bases IS NULL OR total_spots IS NULL OR total_bases >= total_spots)
    );

    CREATE INDEX IF NOT EXISTS idx_runs_experiment ON runs(experiment_accession);

    CREATE TABLE IF NOT EXISTS experiment_samples (
        experiment_accession TEXT NOT NULL,
        sample_accession TEXT NOT NULL,
        PRIMARY KEY (experiment_accession, sample_accession)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS submissions (
        id INTEGER PRIMARY KEY,
        accession TEXT UNIQUE NOT NULL,
        center_name TEXT,
        lab_name TEXT,
        submission_date TEXT,
        metadata TEXT
    );

    CREATE TABLE IF NOT EXISTS analyses (
        id INTEGER PRIMARY KEY,
        accession TEXT UNIQUE NOT NULL,
        title TEXT,
        analysis_type TEXT,
        study_accession TEXT,
        metadata TEXT
    );

    -- Ingest state: one row per origin, one row per archive member,
    -- append-only checkpoints (pruned to the most recent N per source).
    CREATE TABLE IF NOT EXISTS sources (
        source_id TEXT PRIMARY KEY,
        origin_uri TEXT UNIQUE NOT NULL,
        content_length INTEGER,
        etag TEXT,
        state TEXT NOT NULL DEFAULT 'pending',
        started_at INTEGER NOT NULL,
        last_active_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS source_files (
        source_id TEXT NOT NULL,
        member_path TEXT NOT NULL,
        bytes_total INTEGER NOT NULL DEFAULT 0,
        bytes_done INTEGER NOT NULL DEFAULT 0,
        records_done INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT 'pending',
        PRIMARY KEY (source_id, member_path)
    );

    CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY,
        source_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        bytes_done INTEGER NOT NULL,
        records_done INTEGER NOT NULL,
        last_file TEXT,
        last_accession TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_checkpoints_source ON checkpoints(source_id, id);

    -- Index-builder progress, one row per document type.
    CREATE TABLE IF NOT EXISTS builder_state (
        doc_type TEXT PRIMARY KEY,
        last_rowid INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT 'idle',
        updated_at INTEGER NOT NULL
    );

    -- Accession tier: porter-stemmed FTS over the high-cardinality tables,
    -- consulted without touching the inverted index.
    CREATE VIRTUAL TABLE IF NOT EXISTS accession_fts USING fts5(
        accession,
        doc_type UNINDEXED,
        label,
        tokenize='porter unicode61'
    );
";
