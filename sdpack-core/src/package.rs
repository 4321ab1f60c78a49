//! Plugin package directory
//!
//! The plugin host scans `<package-id>.sdPlugin` for `manifest.json`, which
//! names the code file (the bundle, or an HTML page that loads it) and the
//! property-inspector pages. The manifest itself is produced elsewhere; this
//! module only reads it to check that the bundle is wired in.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::config::PACKAGE_DIR_SUFFIX;
use crate::path_utils::{normalize_lexically, normalize_path, path_to_string};

pub const MANIFEST_FILE: &str = "manifest.json";

static SCRIPT_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<script\b[^>]*\bsrc\s*=\s*["']([^"']+)["']"#).unwrap()
});

/// The parts of the host manifest that reference files
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code_path: Option<String>,
    #[serde(default)]
    pub code_path_mac: Option<String>,
    #[serde(default)]
    pub code_path_win: Option<String>,
    #[serde(default)]
    pub property_inspector_path: Option<String>,
    #[serde(default)]
    pub actions: Vec<ManifestAction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestAction {
    #[serde(default, rename = "UUID")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub property_inspector_path: Option<String>,
}

impl PluginManifest {
    /// Every code path declared, deduplicated, in declaration order
    pub fn code_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for path in [&self.code_path, &self.code_path_mac, &self.code_path_win]
            .into_iter()
            .flatten()
        {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }

    /// Plugin-level and per-action property inspector pages
    pub fn property_inspector_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let per_action = self
            .actions
            .iter()
            .filter_map(|a| a.property_inspector_path.as_ref());
        for path in self.property_inspector_path.iter().chain(per_action) {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

/// State of `manifest.json` in the package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestStatus {
    Missing,
    Invalid(String),
    Present,
}

/// Result of inspecting a package directory
#[derive(Debug, Clone)]
pub struct PackageReport {
    pub root: PathBuf,
    pub package_id: Option<String>,
    pub manifest: ManifestStatus,
    /// Display name from the manifest
    pub plugin_name: Option<String>,
    /// Declared action UUIDs, in manifest order
    pub action_uuids: Vec<String>,
    pub code_paths: Vec<String>,
    pub property_inspectors: Vec<String>,
    pub bundle_present: bool,
    pub source_map_present: bool,
    /// A code path is the bundle, or an HTML code/inspector page loads it
    pub bundle_referenced: bool,
    /// Manifest-referenced files that do not exist
    pub missing_files: Vec<String>,
}

impl PackageReport {
    /// Whether the host could load the bundle from this package
    pub fn is_loadable(&self) -> bool {
        self.manifest == ManifestStatus::Present && self.bundle_referenced && self.bundle_present
    }
}

/// A `<package-id>.sdPlugin` directory
#[derive(Debug, Clone)]
pub struct PackageLayout {
    root: PathBuf,
}

impl PackageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `com.example.plugin` for `.../com.example.plugin.sdPlugin`
    pub fn package_id(&self) -> Option<String> {
        self.root
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(PACKAGE_DIR_SUFFIX))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Create the package directory if needed
    pub fn ensure_exists(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// Read `manifest.json`; `Ok(None)` when there is none
    pub fn read_manifest(&self) -> Result<Option<PluginManifest>, String> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| e.to_string())?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    /// Check the package against the bundle file name
    pub fn inspect(&self, bundle_filename: &str) -> PackageReport {
        let mut report = PackageReport {
            root: self.root.clone(),
            package_id: self.package_id(),
            manifest: ManifestStatus::Missing,
            plugin_name: None,
            action_uuids: Vec::new(),
            code_paths: Vec::new(),
            property_inspectors: Vec::new(),
            bundle_present: self.root.join(bundle_filename).is_file(),
            source_map_present: self.root.join(format!("{}.map", bundle_filename)).is_file(),
            bundle_referenced: false,
            missing_files: Vec::new(),
        };

        let manifest = match self.read_manifest() {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return report,
            Err(message) => {
                report.manifest = ManifestStatus::Invalid(message);
                return report;
            }
        };
        report.manifest = ManifestStatus::Present;
        report.action_uuids = manifest.actions.iter().filter_map(|a| a.uuid.clone()).collect();
        report.plugin_name = manifest.name.clone();
        report.code_paths = manifest.code_paths();
        report.property_inspectors = manifest.property_inspector_paths();

        let bundle = normalize_path(bundle_filename);
        for path in report.code_paths.iter().chain(&report.property_inspectors) {
            let full = self.root.join(path);
            if !full.is_file() {
                report.missing_files.push(path.clone());
                continue;
            }
            if package_relative(path) == bundle || self.html_loads(&full, &bundle) {
                report.bundle_referenced = true;
            }
        }

        // The bundle is about to be written, so a code path naming it is not "missing"
        report.missing_files.retain(|path| package_relative(path) != bundle);
        if report.code_paths.iter().any(|p| package_relative(p) == bundle) {
            report.bundle_referenced = true;
        }

        report
    }

    /// Whether an HTML file in the package has a `<script src>` pointing at the bundle
    fn html_loads(&self, html: &Path, bundle: &str) -> bool {
        let is_html = html
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"));
        if !is_html {
            return false;
        }
        let Ok(content) = fs::read_to_string(html) else {
            return false;
        };
        let html_dir = html.parent().unwrap_or(&self.root);

        SCRIPT_SRC_RE.captures_iter(&content).any(|caps| {
            let src = caps[1].split(['?', '#']).next().unwrap_or("");
            let target = if let Some(absolute) = src.strip_prefix('/') {
                self.root.join(absolute)
            } else {
                html_dir.join(src)
            };
            normalize_lexically(&target)
                .strip_prefix(normalize_lexically(&self.root))
                .map(|rel| path_to_string(rel) == bundle)
                .unwrap_or(false)
        })
    }
}

fn package_relative(path: &str) -> String {
    normalize_path(path)
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}
