//! sdpack project configuration
//!
//! Defines the `sdpack.json` format and its validated, path-resolved form.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::path_utils::{is_js_identifier, normalize_lexically};

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "sdpack.json";

/// Suffix the plugin host expects on package directories
pub const PACKAGE_DIR_SUFFIX: &str = ".sdPlugin";

/// The project configuration file (sdpack.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackConfig {
    /// Build mode (default: development)
    #[serde(default)]
    pub mode: Mode,

    /// Emit a companion source map. Unset means "on in development, off in production".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_map: Option<bool>,

    /// Path to the compiled entry module
    #[serde(default = "default_entry")]
    pub entry: PathBuf,

    /// Where and how the bundle is written
    #[serde(default)]
    pub output: OutputConfig,

    /// Development server settings
    #[serde(default)]
    pub dev_server: DevServerConfig,
}

fn default_entry() -> PathBuf {
    PathBuf::from("./src/index.js")
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            source_map: None,
            entry: default_entry(),
            output: OutputConfig::default(),
            dev_server: DevServerConfig::default(),
        }
    }
}

/// Build mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Readable output with per-module banners
    #[default]
    Development,
    /// Compact output
    Production,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    /// Package directory the bundle is written into
    #[serde(default = "default_output_path")]
    pub path: PathBuf,

    /// Bundle file name, relative to the package directory
    #[serde(default = "default_filename")]
    pub filename: String,

    /// Global binding for the entry module's exports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<LibraryConfig>,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("./bin/plugin.sdPlugin")
}

fn default_filename() -> String {
    "bundle.js".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            filename: default_filename(),
            library: None,
        }
    }
}

/// Named export binding for the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: LibraryType,
}

/// How the entry's exports attach to the host's global scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryType {
    /// `var Name = ...;`
    #[default]
    Var,
    /// `Name = ...;`
    Assign,
    /// `this["Name"] = ...;`
    This,
    /// `window["Name"] = ...;`
    Window,
    /// `self["Name"] = ...;`
    #[serde(rename = "self")]
    SelfScope,
    /// `globalThis["Name"] = ...;`
    Global,
}

impl LibraryType {
    /// Whether the name is emitted as a bare identifier rather than a property key
    pub fn needs_identifier(self) -> bool {
        matches!(self, LibraryType::Var | LibraryType::Assign)
    }
}

/// Development server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevServerConfig {
    /// URL prefix the package is served under
    #[serde(default = "default_public_path")]
    pub public_path: String,

    /// Served directory. Must be the package directory; defaults to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_base: Option<PathBuf>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_public_path() -> String {
    "/".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            public_path: default_public_path(),
            content_base: None,
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Configuration with every path made absolute and every option checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Directory relative paths were resolved against
    pub root: PathBuf,
    pub mode: Mode,
    pub source_map: bool,
    pub entry: PathBuf,
    pub output: ResolvedOutput,
    pub dev_server: ResolvedDevServer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub dir: PathBuf,
    pub filename: String,
    pub library: Option<LibraryConfig>,
}

impl ResolvedOutput {
    pub fn bundle_path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    pub fn map_filename(&self) -> String {
        format!("{}.map", self.filename)
    }

    pub fn map_path(&self) -> PathBuf {
        self.dir.join(self.map_filename())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevServer {
    pub host: String,
    pub port: u16,
    /// Always starts and ends with '/'
    pub public_path: String,
    pub root: PathBuf,
}

impl PackConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a config file and resolve it against the file's directory
    pub fn load_resolved(path: &Path) -> Result<ResolvedConfig, ConfigError> {
        let config = Self::load(path)?;
        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        config.resolve(&base)
    }

    /// Validate options and resolve relative paths against `base`
    pub fn resolve(&self, base: &Path) -> Result<ResolvedConfig, ConfigError> {
        let root = absolute(base);

        let entry = normalize_lexically(&root.join(&self.entry));
        if !entry.is_file() {
            return Err(ConfigError::EntryNotFound(entry));
        }

        let filename = self.output.filename.trim();
        if filename.is_empty()
            || filename == "."
            || filename == ".."
            || filename.contains(['/', '\\'])
        {
            return Err(ConfigError::InvalidFilename(self.output.filename.clone()));
        }

        if let Some(library) = &self.output.library {
            let valid = if library.kind.needs_identifier() {
                is_js_identifier(&library.name)
            } else {
                !library.name.is_empty()
            };
            if !valid {
                return Err(ConfigError::InvalidLibraryName(library.name.clone()));
            }
        }

        let package_dir = normalize_lexically(&root.join(&self.output.path));
        let served_root = match &self.dev_server.content_base {
            Some(content_base) => {
                let content_base = normalize_lexically(&root.join(content_base));
                if content_base != package_dir {
                    return Err(ConfigError::RootMismatch {
                        content_base,
                        package_dir,
                    });
                }
                content_base
            }
            None => package_dir.clone(),
        };

        let public_path = normalize_public_path(&self.dev_server.public_path)?;

        Ok(ResolvedConfig {
            root,
            mode: self.mode,
            source_map: self.source_map.unwrap_or(self.mode == Mode::Development),
            entry,
            output: ResolvedOutput {
                dir: package_dir,
                filename: filename.to_string(),
                library: self.output.library.clone(),
            },
            dev_server: ResolvedDevServer {
                host: self.dev_server.host.clone(),
                port: self.dev_server.port,
                public_path,
                root: served_root,
            },
        })
    }
}

/// Ensure a public path looks like `/`, `/plugin/` etc.
pub fn normalize_public_path(public_path: &str) -> Result<String, ConfigError> {
    let trimmed = public_path.trim();
    if !trimmed.starts_with('/') {
        return Err(ConfigError::InvalidPublicPath(public_path.to_string()));
    }
    if trimmed.ends_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}/", trimmed))
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_lexically(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_default();
        normalize_lexically(&cwd.join(path))
    }
}
