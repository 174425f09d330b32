use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("unknown source: {0}")]
    #[diagnostic(help("run `parcel-harvest sources` to list configured sources"))]
    UnknownSource(String),

    #[error("cache is corrupted at {path}: {message}")]
    #[diagnostic(help("remove the file or run `parcel-harvest clear <source>`"))]
    CacheCorruption { path: String, message: String },

    #[error("missing config file parcel-harvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("ArcGIS client setup failed: {0}")]
    ArcgisHttp(String),

    #[error("fetch of {source_id} failed at offset {offset} after {attempts} attempt(s): {message}")]
    FetchFailed {
        source_id: String,
        offset: u64,
        attempts: usize,
        message: String,
    },

    #[error("malformed response for {source_id} at offset {offset}: {message}")]
    MalformedResponse {
        source_id: String,
        offset: u64,
        message: String,
    },

    #[error("failed to write output: {0}")]
    Output(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
