use srake_core::search::{IdleSweeper, LazyIndex, SearchRouter};
use srake_core::{Config, MetadataStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub db_path: PathBuf,
    pub config: Config,
    pub router: SearchRouter,
    /// Keeps the idle-close thread alive for the server's lifetime.
    _sweeper: IdleSweeper,
}

impl AppState {
    pub fn new(db_path: &Path, config: Config) -> srake_core::Result<Self> {
        let index = Arc::new(LazyIndex::new(
            &srake_core::paths::index_path(db_path),
            config.idle_timeout(),
        ));
        let sweeper = IdleSweeper::start(Arc::clone(&index));

        let embedder = if config.vector_enabled() {
            Some(Arc::new(srake_core::embed::HttpEmbedder::new(&config.embedding)?)
                as Arc<dyn srake_core::embed::Embedder>)
        } else {
            None
        };

        let router = SearchRouter::new(
            index,
            &srake_core::paths::embeddings_path(db_path),
            embedder,
            config.search.default_limit,
            config.search.hybrid_weight,
        )
        .with_timeout(config.search_timeout());

        Ok(Self {
            db_path: db_path.to_path_buf(),
            config,
            router,
            _sweeper: sweeper,
        })
    }

    /// One read-only store handle per request; WAL readers never block
    /// each other.
    pub fn open_store(&self) -> srake_core::Result<MetadataStore> {
        MetadataStore::open_read(&self.db_path)
    }
}
