//! Error types for configuration and bundling

use std::path::PathBuf;

/// Problems found before any build work begins
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entry module not found: {}", .0.display())]
    EntryNotFound(PathBuf),

    #[error("Invalid output filename {0:?}: must be a plain file name")]
    InvalidFilename(String),

    #[error("Invalid library name {0:?}: must be a JavaScript identifier")]
    InvalidLibraryName(String),

    #[error("Invalid publicPath {0:?}: must start with '/'")]
    InvalidPublicPath(String),

    #[error(
        "devServer.contentBase ({}) must be the package directory ({})",
        content_base.display(),
        package_dir.display()
    )]
    RootMismatch {
        content_base: PathBuf,
        package_dir: PathBuf,
    },
}

/// Failures while transforming or writing the bundle
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to read module {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: cannot resolve import {specifier:?}", importer.display())]
    UnresolvedImport {
        importer: PathBuf,
        specifier: String,
        line: usize,
    },

    #[error("{}:{line}: {message}", module.display())]
    Syntax {
        module: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Invalid JSON module {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode source map: {0}")]
    SourceMap(#[from] sourcemap::Error),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can stop `bundle()`
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

pub type PackResult<T> = Result<T, PackError>;
