//! Default filesystem layout: store, index, embeddings, cache.
//!
//! Every location can be overridden by an `SRAKE_*` environment variable,
//! then by the corresponding XDG variable, then falls back to the platform
//! default. The index and embeddings directories are derived from the store
//! path so that the three artifacts always sit next to each other.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "srake";

/// Default store file name inside the data home.
pub const DB_FILE: &str = "srake.db";

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Data home: `SRAKE_DATA_HOME`, then `XDG_DATA_HOME/srake`, then the
/// platform data dir.
pub fn data_home() -> PathBuf {
    if let Some(dir) = env_path("SRAKE_DATA_HOME") {
        return dir;
    }
    if let Some(xdg) = env_path("XDG_DATA_HOME") {
        return xdg.join(APP_DIR);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Config home: `SRAKE_CONFIG_HOME`, then `XDG_CONFIG_HOME/srake`, then the
/// platform config dir.
pub fn config_home() -> PathBuf {
    if let Some(dir) = env_path("SRAKE_CONFIG_HOME") {
        return dir;
    }
    if let Some(xdg) = env_path("XDG_CONFIG_HOME") {
        return xdg.join(APP_DIR);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Cache home (download cache lives here): `SRAKE_CACHE_HOME`, then
/// `XDG_CACHE_HOME/srake`, then the platform cache dir.
pub fn cache_home() -> PathBuf {
    if let Some(dir) = env_path("SRAKE_CACHE_HOME") {
        return dir;
    }
    if let Some(xdg) = env_path("XDG_CACHE_HOME") {
        return xdg.join(APP_DIR);
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// State home: `SRAKE_STATE_HOME`, then `XDG_STATE_HOME/srake`, then the
/// data home.
pub fn state_home() -> PathBuf {
    if let Some(dir) = env_path("SRAKE_STATE_HOME") {
        return dir;
    }
    if let Some(xdg) = env_path("XDG_STATE_HOME") {
        return xdg.join(APP_DIR);
    }
    data_home()
}

/// Directory for downloaded embedding models.
pub fn models_home() -> PathBuf {
    env_path("SRAKE_MODELS_PATH").unwrap_or_else(|| data_home().join("models"))
}

/// Resolve the store path: explicit argument, `SRAKE_DB_PATH`, then
/// `data_home()/srake.db`.
pub fn db_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    env_path("SRAKE_DB_PATH").unwrap_or_else(|| data_home().join(DB_FILE))
}

/// Inverted index directory adjacent to the store (`srake.bleve` for a store
/// at `srake.db`), overridable with `SRAKE_INDEX_PATH`.
pub fn index_path(db: &Path) -> PathBuf {
    env_path("SRAKE_INDEX_PATH").unwrap_or_else(|| sibling(db, "bleve"))
}

/// Vector companion directory adjacent to the store, overridable with
/// `SRAKE_EMBEDDINGS_PATH`.
pub fn embeddings_path(db: &Path) -> PathBuf {
    env_path("SRAKE_EMBEDDINGS_PATH").unwrap_or_else(|| sibling(db, "embeddings"))
}

/// Replace the extension of the store path, keeping its basename.
fn sibling(db: &Path, ext: &str) -> PathBuf {
    let mut p = db.to_path_buf();
    p.set_extension(ext);
    p
}

/// `NO_COLOR` convention: any non-empty value disables styled output.
pub fn no_color() -> bool {
    std::env::var("NO_COLOR").is_ok_and(|v| !v.is_empty())
}
