//! sdpack Core Library
//!
//! This crate provides the core functionality for sdpack:
//! - Project configuration (`sdpack.json`)
//! - Module graph resolution and ES module rewriting
//! - Bundle emission with optional source maps and production minification
//! - Plugin package (`.sdPlugin`) inspection

pub mod bundler;
pub mod config;
pub mod emit;
pub mod error;
pub mod graph;
pub mod minify;
pub mod package;
pub mod path_utils;
pub mod transform;

// Re-export commonly used types
pub use bundler::{bundle, BuildOutput, BuildStats, OutputArtifact};
pub use config::{
    DevServerConfig, LibraryConfig, LibraryType, Mode, OutputConfig, PackConfig, ResolvedConfig,
    ResolvedDevServer, ResolvedOutput, DEFAULT_CONFIG_FILE, PACKAGE_DIR_SUFFIX,
};
pub use error::{BuildError, ConfigError, PackError, PackResult};
pub use graph::ModuleGraph;
pub use package::{ManifestStatus, PackageLayout, PackageReport, PluginManifest, MANIFEST_FILE};
pub use path_utils::{normalize_path, path_to_string, sanitize_filename};
