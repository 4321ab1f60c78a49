//! Module graph
//!
//! Walks imports from the entry module, resolving each specifier to a file.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::path_utils::{module_id, normalize_lexically};
use crate::transform::ParsedModule;

/// Extensions tried, in order, for extensionless specifiers
const RESOLVE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "json"];

/// Files tried, in order, when a specifier names a directory
const INDEX_FILES: &[&str] = &["index.js", "index.mjs", "index.cjs", "index.json"];

/// A module in the graph
#[derive(Debug, Clone)]
pub struct GraphModule {
    /// Stable id, e.g. `./src/App.fs.js`
    pub id: String,
    pub path: PathBuf,
    pub parsed: ParsedModule,
    /// Specifier -> module id for this module's dependencies
    pub resolved: HashMap<String, String>,
}

/// Every module reachable from the entry, in discovery order
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    root: PathBuf,
    modules: Vec<GraphModule>,
}

impl ModuleGraph {
    /// Load the graph rooted at `entry`; ids are relative to `root`
    pub fn load(root: &Path, entry: &Path) -> Result<Self, BuildError> {
        let mut modules: Vec<GraphModule> = Vec::new();
        let mut visited: HashMap<PathBuf, usize> = HashMap::new();
        let mut stack = vec![normalize_lexically(entry)];

        while let Some(path) = stack.pop() {
            if visited.contains_key(&path) {
                continue;
            }

            let source = fs::read_to_string(&path).map_err(|source| BuildError::Read {
                path: path.clone(),
                source,
            })?;
            let parsed = ParsedModule::parse(&path, source)?;

            let mut resolved = HashMap::new();
            let mut pending = Vec::new();
            for dependency in parsed.dependencies() {
                if resolved.contains_key(&dependency.specifier) {
                    continue;
                }
                let target = resolve_specifier(&path, &dependency.specifier).ok_or_else(|| {
                    BuildError::UnresolvedImport {
                        importer: path.clone(),
                        specifier: dependency.specifier.clone(),
                        line: dependency.line,
                    }
                })?;
                tracing::debug!("Resolved {} -> {}", dependency.specifier, target.display());
                resolved.insert(dependency.specifier, module_id(root, &target));
                pending.push(target);
            }

            // Reverse so the first import is visited first
            stack.extend(pending.into_iter().rev());

            visited.insert(path.clone(), modules.len());
            modules.push(GraphModule {
                id: module_id(root, &path),
                path,
                parsed,
                resolved,
            });
        }

        Ok(Self {
            root: root.to_path_buf(),
            modules,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The entry module is always first
    pub fn entry(&self) -> &GraphModule {
        &self.modules[0]
    }

    pub fn modules(&self) -> &[GraphModule] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Directories containing at least one module
    pub fn source_dirs(&self) -> BTreeSet<PathBuf> {
        self.modules
            .iter()
            .filter_map(|m| m.path.parent().map(Path::to_path_buf))
            .collect()
    }
}

/// Resolve an import specifier relative to the importing module
pub fn resolve_specifier(importer: &Path, specifier: &str) -> Option<PathBuf> {
    let importer_dir = importer.parent().unwrap_or(Path::new("."));

    if specifier.starts_with("./") || specifier.starts_with("../") || specifier == "." || specifier == ".." {
        return resolve_file(&normalize_lexically(&importer_dir.join(specifier)));
    }
    if Path::new(specifier).is_absolute() {
        return resolve_file(&normalize_lexically(Path::new(specifier)));
    }

    resolve_package(importer_dir, specifier)
}

/// Try `path`, `path.<ext>`, then `path/index.<ext>`
fn resolve_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }

    let file_name = path.file_name()?.to_string_lossy().into_owned();
    for ext in RESOLVE_EXTENSIONS {
        let candidate = path.with_file_name(format!("{}.{}", file_name, ext));
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    if path.is_dir() {
        return INDEX_FILES
            .iter()
            .map(|index| path.join(index))
            .find(|candidate| candidate.is_file());
    }

    None
}

/// Resolve a bare specifier through `node_modules` directories
fn resolve_package(from_dir: &Path, specifier: &str) -> Option<PathBuf> {
    let (package, subpath) = split_package_specifier(specifier)?;

    for dir in from_dir.ancestors() {
        let package_dir = dir.join("node_modules").join(package);
        if !package_dir.is_dir() {
            continue;
        }

        if let Some(subpath) = subpath {
            return resolve_file(&normalize_lexically(&package_dir.join(subpath)));
        }

        return package_entry(&package_dir).or_else(|| resolve_file(&package_dir));
    }

    None
}

/// The `module` or `main` field of a package's package.json
fn package_entry(package_dir: &Path) -> Option<PathBuf> {
    let content = fs::read_to_string(package_dir.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&content).ok()?;

    ["module", "main"]
        .iter()
        .filter_map(|field| manifest.get(*field).and_then(|v| v.as_str()))
        .find_map(|entry| resolve_file(&normalize_lexically(&package_dir.join(entry))))
}

/// `lodash/fp` -> ("lodash", Some("fp")), `@scope/pkg/x` -> ("@scope/pkg", Some("x"))
fn split_package_specifier(specifier: &str) -> Option<(&str, Option<&str>)> {
    let name_end = if specifier.starts_with('@') {
        let scope_end = specifier.find('/')?;
        specifier[scope_end + 1..]
            .find('/')
            .map(|i| scope_end + 1 + i)
    } else {
        specifier.find('/')
    };

    match name_end {
        Some(end) => Some((&specifier[..end], Some(&specifier[end + 1..]))),
        None if !specifier.is_empty() => Some((specifier, None)),
        None => None,
    }
}
