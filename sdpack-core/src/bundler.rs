//! Bundler
//!
//! Bundles the entry module and everything it imports into a single script
//! inside the plugin package directory, with an optional source map.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::{ResolvedConfig, PACKAGE_DIR_SUFFIX};
use crate::emit::{emit_bundle, EmitOptions};
use crate::error::{BuildError, ConfigError, PackResult};
use crate::graph::ModuleGraph;
use crate::package::{ManifestStatus, PackageLayout};

/// Files written by a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub bundle_path: PathBuf,
    pub source_map_path: Option<PathBuf>,
}

/// Statistics from a build
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    /// Number of modules in the bundle
    pub modules: usize,
    pub bundle_bytes: usize,
    pub source_map_bytes: usize,
    pub duration: Duration,
}

/// Everything a caller needs after a build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub artifact: OutputArtifact,
    pub stats: BuildStats,
    /// Source files the bundle was built from, in bundle order
    pub sources: Vec<PathBuf>,
}

/// Build the bundle described by `config`
///
/// Nothing is written unless the whole bundle was produced. Each output file
/// is written to a temporary file in the package directory and renamed into
/// place, so readers see either the old or the new file.
pub fn bundle(config: &ResolvedConfig) -> PackResult<BuildOutput> {
    let started = Instant::now();

    if !config.entry.is_file() {
        return Err(ConfigError::EntryNotFound(config.entry.clone()).into());
    }

    tracing::info!("Bundling {} ({} mode)", config.entry.display(), config.mode.as_str());

    let graph = ModuleGraph::load(&config.root, &config.entry)?;
    let emitted = emit_bundle(
        &graph,
        &EmitOptions {
            mode: config.mode,
            library: config.output.library.as_ref(),
            filename: &config.output.filename,
            output_dir: &config.output.dir,
            source_map: config.source_map,
        },
    )?;

    let layout = PackageLayout::new(&config.output.dir);
    layout.ensure_exists().map_err(|source| BuildError::Write {
        path: config.output.dir.clone(),
        source,
    })?;

    let mut stats = BuildStats {
        modules: graph.len(),
        bundle_bytes: emitted.code.len(),
        ..Default::default()
    };

    // Map first, so a freshly renamed bundle never points at a stale map
    let source_map_path = match &emitted.source_map {
        Some(map) => {
            let path = config.output.map_path();
            write_atomic(&path, map.as_bytes())?;
            stats.source_map_bytes = map.len();
            Some(path)
        }
        None => None,
    };

    let bundle_path = config.output.bundle_path();
    write_atomic(&bundle_path, emitted.code.as_bytes())?;

    stats.duration = started.elapsed();
    tracing::info!(
        "Bundled {} modules into {} ({} bytes) in {:?}",
        stats.modules,
        bundle_path.display(),
        stats.bundle_bytes,
        stats.duration
    );

    check_package(&layout, &config.output.filename);

    Ok(BuildOutput {
        artifact: OutputArtifact {
            bundle_path,
            source_map_path,
        },
        stats,
        sources: graph.modules().iter().map(|m| m.path.clone()).collect(),
    })
}

/// Write `contents` to a temp file beside `path`, then rename it over `path`
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), BuildError> {
    let write_err = |source| BuildError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or(Path::new("."));

    let mut file = tempfile::Builder::new()
        .prefix(".sdpack-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    file.write_all(contents).map_err(write_err)?;
    file.as_file().sync_all().map_err(write_err)?;
    file.persist(path).map_err(|e| write_err(e.error))?;

    Ok(())
}

/// Warn about package problems the plugin host would reject later
fn check_package(layout: &PackageLayout, bundle_filename: &str) {
    if layout.package_id().is_none() {
        tracing::warn!(
            "Output directory {} does not end in {}; the plugin host will not load it",
            layout.root().display(),
            PACKAGE_DIR_SUFFIX
        );
    }

    let report = layout.inspect(bundle_filename);
    match &report.manifest {
        ManifestStatus::Missing => {
            tracing::warn!("No manifest.json in {}", layout.root().display());
        }
        ManifestStatus::Invalid(message) => {
            tracing::warn!("Unreadable manifest.json in {}: {}", layout.root().display(), message);
        }
        ManifestStatus::Present if !report.bundle_referenced => {
            tracing::warn!("manifest.json does not load {}", bundle_filename);
        }
        ManifestStatus::Present => {}
    }
    for missing in &report.missing_files {
        tracing::warn!("manifest.json references missing file {}", missing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LibraryConfig, LibraryType, Mode, PackConfig};
    use crate::error::PackError;
    use std::fs;
    use tempfile::TempDir;

    fn project(files: &[(&str, &str)]) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = temp_dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        temp_dir
    }

    fn plugin_config() -> PackConfig {
        let mut config = PackConfig {
            entry: PathBuf::from("./src/App.fs.js"),
            ..Default::default()
        };
        config.output.path = PathBuf::from("./bin/com.example.test.sdPlugin");
        config.output.library = Some(LibraryConfig {
            name: "SDPlugin".to_string(),
            kind: LibraryType::Var,
        });
        config
    }

    fn eval_global<T>(code: &str, expr: &str) -> T
    where
        T: for<'js> rquickjs::FromJs<'js>,
    {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            ctx.eval::<(), _>(code).unwrap();
            ctx.eval::<T, _>(expr).unwrap()
        })
    }

    #[test]
    fn test_build_writes_bundle_and_map() {
        let temp_dir = project(&[
            ("src/App.fs.js", "import { add } from \"./Math.js\";\nexport function connect(a, b) { return add(a, b); }\n"),
            ("src/Math.js", "export function add(a, b) { return a + b; }\n"),
        ]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();

        let output = bundle(&config).unwrap();
        let package_dir = temp_dir.path().join("bin/com.example.test.sdPlugin");
        assert_eq!(output.artifact.bundle_path, package_dir.join("bundle.js"));
        assert_eq!(output.artifact.source_map_path, Some(package_dir.join("bundle.js.map")));
        assert!(output.artifact.bundle_path.is_file());
        assert!(package_dir.join("bundle.js.map").is_file());
        assert_eq!(output.stats.modules, 2);
        assert_eq!(output.sources.len(), 2);

        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(&package_dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let temp_dir = project(&[("src/App.fs.js", "export const version = \"1.0\";\n")]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();

        let first = bundle(&config).unwrap();
        let first_bundle = fs::read(&first.artifact.bundle_path).unwrap();
        let first_map = fs::read(first.artifact.source_map_path.as_ref().unwrap()).unwrap();

        let second = bundle(&config).unwrap();
        assert_eq!(fs::read(&second.artifact.bundle_path).unwrap(), first_bundle);
        assert_eq!(
            fs::read(second.artifact.source_map_path.as_ref().unwrap()).unwrap(),
            first_map
        );
    }

    #[test]
    fn test_missing_entry_writes_nothing() {
        let temp_dir = project(&[("src/App.fs.js", "export const a = 1;\n")]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        fs::remove_file(temp_dir.path().join("src/App.fs.js")).unwrap();

        let err = bundle(&config).unwrap_err();
        assert!(matches!(err, PackError::Config(ConfigError::EntryNotFound(_))));
        assert!(!config.output.dir.exists());
    }

    #[test]
    fn test_build_error_keeps_previous_artifact() {
        let temp_dir = project(&[("src/App.fs.js", "export const a = 1;\n")]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        let output = bundle(&config).unwrap();
        let before = fs::read(&output.artifact.bundle_path).unwrap();

        fs::write(
            temp_dir.path().join("src/App.fs.js"),
            "import { b } from \"./missing.js\";\n",
        )
        .unwrap();
        let err = bundle(&config).unwrap_err();
        assert!(matches!(
            err,
            PackError::Build(BuildError::UnresolvedImport { .. })
        ));
        assert_eq!(fs::read(&output.artifact.bundle_path).unwrap(), before);
    }

    #[test]
    fn test_unrelated_package_files_survive() {
        let temp_dir = project(&[
            ("src/App.fs.js", "export const a = 1;\n"),
            ("bin/com.example.test.sdPlugin/manifest.json", r#"{ "CodePath": "bundle.js" }"#),
            ("bin/com.example.test.sdPlugin/images/icon.png", "png"),
        ]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        bundle(&config).unwrap();

        let package_dir = temp_dir.path().join("bin/com.example.test.sdPlugin");
        assert!(package_dir.join("manifest.json").is_file());
        assert_eq!(fs::read_to_string(package_dir.join("images/icon.png")).unwrap(), "png");
    }

    #[test]
    fn test_var_library_defines_global() {
        let temp_dir = project(&[
            (
                "src/App.fs.js",
                "import { add } from \"./Math.js\";\nimport greeting from \"./greeting.js\";\nexport function connect(a, b) { return add(a, b); }\nexport { greeting };\nexport * from \"./extra.js\";\n",
            ),
            ("src/Math.js", "export function add(a, b) { return a + b; }\n"),
            ("src/greeting.js", "export default \"hello\";\n"),
            ("src/extra.js", "export const extra = 42;\n"),
        ]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        let output = bundle(&config).unwrap();
        let code = fs::read_to_string(&output.artifact.bundle_path).unwrap();

        assert_eq!(eval_global::<i32>(&code, "SDPlugin.connect(2, 3)"), 5);
        assert_eq!(eval_global::<String>(&code, "SDPlugin.greeting"), "hello");
        assert_eq!(eval_global::<i32>(&code, "SDPlugin.extra"), 42);
        assert_eq!(eval_global::<String>(&code, "typeof SDPlugin"), "object");
    }

    #[test]
    fn test_circular_imports_see_hoisted_functions() {
        let temp_dir = project(&[
            (
                "src/App.fs.js",
                "import { isEven } from \"./even.js\";\nexport const result = isEven(10);\n",
            ),
            (
                "src/even.js",
                "import { isOdd } from \"./odd.js\";\nexport function isEven(n) { return n === 0 ? true : isOdd(n - 1); }\n",
            ),
            (
                "src/odd.js",
                "import * as even from \"./even.js\";\nexport function isOdd(n) { return n === 0 ? false : even.isEven(n - 1); }\n",
            ),
        ]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        let output = bundle(&config).unwrap();
        let code = fs::read_to_string(&output.artifact.bundle_path).unwrap();

        assert!(eval_global::<bool>(&code, "SDPlugin.result"));
    }

    #[test]
    fn test_circular_named_import_reads_class_after_init() {
        let temp_dir = project(&[
            (
                "src/App.fs.js",
                "import { make } from \"./factory.js\";\nexport class Msg {\n  constructor(text) { this.text = text; }\n}\nexport const out = make(\"hi\").text;\n",
            ),
            (
                "src/factory.js",
                "import { Msg } from \"./App.fs.js\";\nexport function make(text) { return new Msg(text); }\n",
            ),
        ]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        let output = bundle(&config).unwrap();
        let code = fs::read_to_string(&output.artifact.bundle_path).unwrap();

        assert_eq!(eval_global::<String>(&code, "SDPlugin.out"), "hi");
    }

    #[test]
    fn test_named_imports_are_live() {
        let temp_dir = project(&[
            (
                "src/App.fs.js",
                "import { count, inc } from \"./counter.js\";\ninc();\ninc();\nexport const seen = count;\nexport { count };\n",
            ),
            (
                "src/counter.js",
                "export let count = 0;\nexport function inc() { count++; }\n",
            ),
        ]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        let output = bundle(&config).unwrap();
        let code = fs::read_to_string(&output.artifact.bundle_path).unwrap();

        assert_eq!(eval_global::<i32>(&code, "SDPlugin.seen"), 2);
        assert_eq!(eval_global::<i32>(&code, "SDPlugin.count"), 2);
    }

    #[test]
    fn test_statements_sharing_lines_and_commented_imports() {
        let temp_dir = project(&[
            (
                "src/App.fs.js",
                "import { a } from \"./a.js\"; import { b } from \"./b.js\";\n/* import { gone } from \"./missing.js\"; */\n// import \"./also-missing.js\";\nexport const first = a, second = b;\n",
            ),
            ("src/a.js", "export const a = \"A\";\n"),
            ("src/b.js", "export const b = \"B\";\n"),
        ]);
        let config = plugin_config().resolve(temp_dir.path()).unwrap();
        let output = bundle(&config).unwrap();
        let code = fs::read_to_string(&output.artifact.bundle_path).unwrap();

        assert_eq!(output.stats.modules, 3);
        assert_eq!(eval_global::<String>(&code, "SDPlugin.first + SDPlugin.second"), "AB");
    }

    #[test]
    fn test_production_bundle_is_minified_and_runs() {
        let temp_dir = project(&[
            (
                "src/App.fs.js",
                "import { describe } from \"./describe.js\";\n// Entry for the plugin\nexport const label = describe(\"counter\");\n",
            ),
            (
                "src/describe.js",
                "export function describe(actionName) {\n  return actionName + \" action\";\n}\n",
            ),
        ]);
        let mut config = plugin_config();
        config.mode = Mode::Production;
        config.source_map = Some(true);
        let config = config.resolve(temp_dir.path()).unwrap();

        let output = bundle(&config).unwrap();
        let code = fs::read_to_string(&output.artifact.bundle_path).unwrap();
        assert!(!code.contains("Entry for the plugin"));
        assert!(!code.contains("actionName"));
        assert_eq!(eval_global::<String>(&code, "SDPlugin.label"), "counter action");

        let map_path = output.artifact.source_map_path.unwrap();
        let map = sourcemap::SourceMap::from_slice(&fs::read(map_path).unwrap()).unwrap();
        let sources: Vec<_> = map.sources().collect();
        assert_eq!(sources, vec!["../../src/App.fs.js", "../../src/describe.js"]);
    }

    #[test]
    fn test_production_mode_without_library() {
        let temp_dir = project(&[(
            "src/App.fs.js",
            "globalThis.env = process.env.NODE_ENV;\n",
        )]);
        let mut config = plugin_config();
        config.mode = Mode::Production;
        config.output.library = None;
        let config = config.resolve(temp_dir.path()).unwrap();

        let output = bundle(&config).unwrap();
        assert!(output.artifact.source_map_path.is_none());
        let code = fs::read_to_string(&output.artifact.bundle_path).unwrap();
        assert!(!code.contains("sourceMappingURL"));
        assert_eq!(eval_global::<String>(&code, "globalThis.env"), "production");
        assert_eq!(eval_global::<String>(&code, "typeof SDPlugin"), "undefined");
    }
}
