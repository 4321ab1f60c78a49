//! Bundle emitter
//!
//! Renders a [`ModuleGraph`] into one script: a module table, a small
//! require runtime and the library binding that exposes the entry's exports.

use std::path::Path;

use sourcemap::{SourceMap, SourceMapBuilder};

use crate::config::{LibraryConfig, LibraryType, Mode};
use crate::error::BuildError;
use crate::graph::ModuleGraph;
use crate::minify::minify_script;
use crate::path_utils::relative_path;
use crate::transform::{js_string, RewrittenModule, REQUIRE_FN};

const MODULES_VAR: &str = "__sdpack_modules";

/// Options that shape the emitted text
#[derive(Debug, Clone)]
pub struct EmitOptions<'a> {
    pub mode: Mode,
    pub library: Option<&'a LibraryConfig>,
    /// Bundle file name, recorded in the source map
    pub filename: &'a str,
    /// Directory the bundle is written to; map `sources` are relative to it
    pub output_dir: &'a Path,
    pub source_map: bool,
}

/// Emitted bundle text and optional source map JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedBundle {
    pub code: String,
    pub source_map: Option<String>,
}

/// Tracks the generated line while writing the bundle
struct Writer {
    out: String,
    line: u32,
    compact: bool,
}

impl Writer {
    fn line(&mut self, indent: usize, text: &str) {
        if !self.compact {
            for _ in 0..indent {
                self.out.push_str("  ");
            }
        }
        self.out.push_str(text);
        self.out.push('\n');
        self.line += 1;
    }

    /// Append a module body verbatim; returns the line it started on
    fn body(&mut self, body: &str) -> u32 {
        let start = self.line;
        self.out.push_str(body);
        if !body.ends_with('\n') {
            self.out.push('\n');
        }
        self.line += body.lines().count().max(1) as u32;
        start
    }
}

/// Render the bundle for `graph`
///
/// Development output copies module bodies line for line. Production output
/// minifies each module with oxc and rebases its codegen map onto the bundle.
pub fn emit_bundle(graph: &ModuleGraph, options: &EmitOptions<'_>) -> Result<EmittedBundle, BuildError> {
    let compact = options.mode == Mode::Production;
    let mut w = Writer {
        out: String::new(),
        line: 0,
        compact,
    };
    let mut map = options
        .source_map
        .then(|| SourceMapBuilder::new(Some(options.filename)));

    w.line(0, &format!("{}(function () {{", library_prefix(options.library)));
    w.line(1, "\"use strict\";");
    w.line(1, &format!("var {} = {{{}", MODULES_VAR, if compact { "};" } else { "" }));

    for module in graph.modules() {
        let rewritten = module.parsed.rewrite(&module.resolved, options.mode);
        let header = module_header(&rewritten);
        let src_id = map.as_mut().map(|builder| {
            let src_id = builder.add_source(&relative_path(options.output_dir, &module.path));
            builder.set_source_contents(src_id, Some(module.parsed.source()));
            src_id
        });
        let body_lines = rewritten.body.lines().count().max(1) as u32;

        if compact {
            let mut script = format!("{}[{}] = {}\n", MODULES_VAR, js_string(&module.id), header);
            script.push_str(&rewritten.body);
            if !rewritten.body.ends_with('\n') {
                script.push('\n');
            }
            script.push_str("};\n");

            let minified = minify_script(&module.path, &script, 1, map.is_some())?;
            let start = w.body(&minified.code);

            if let (Some(builder), Some(src_id), Some(module_map)) =
                (map.as_mut(), src_id, minified.source_map)
            {
                let module_map = SourceMap::from_slice(module_map.as_bytes())?;
                for token in module_map.tokens() {
                    // Script line 0 is the generated header
                    let src_line = token.get_src_line();
                    if !token.has_source() || src_line == 0 || src_line > body_lines {
                        continue;
                    }
                    builder.add_raw(
                        start + token.get_dst_line(),
                        token.get_dst_col(),
                        src_line - 1,
                        token.get_src_col(),
                        Some(src_id),
                        None,
                        false,
                    );
                }
            }
        } else {
            w.line(2, &format!("/* {} */", module.id));
            w.line(2, &format!("{}: {}", js_string(&module.id), header));
            let start = w.body(&rewritten.body);

            if let (Some(builder), Some(src_id)) = (map.as_mut(), src_id) {
                for offset in 0..body_lines {
                    builder.add_raw(start + offset, 0, offset, 0, Some(src_id), None, false);
                }
            }

            w.line(2, "},");
        }
    }

    if !compact {
        w.line(1, "};");
    }
    for line in RUNTIME.lines() {
        w.line(1, line);
    }

    let entry = js_string(&graph.entry().id);
    match options.library {
        Some(_) => w.line(1, &format!("return {}({});", REQUIRE_FN, entry)),
        None => w.line(1, &format!("{}({});", REQUIRE_FN, entry)),
    }
    w.line(0, "})();");

    let source_map = match map {
        Some(builder) => {
            w.out.push_str(&format!(
                "//# sourceMappingURL={}.map\n",
                options.filename
            ));
            let mut buf = Vec::new();
            builder.into_sourcemap().to_writer(&mut buf)?;
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        None => None,
    };

    Ok(EmittedBundle {
        code: w.out,
        source_map,
    })
}

/// Module function head: export getters, then the import prologue
fn module_header(rewritten: &RewrittenModule) -> String {
    let mut header = format!("function (module, exports, {}) {{", REQUIRE_FN);
    if rewritten.is_esm {
        let getters: Vec<String> = rewritten
            .exports
            .iter()
            .map(|(name, expr)| format!("{}: function () {{ return {}; }}", js_string(name), expr))
            .collect();
        header.push_str(&format!(" {}.d(exports, {{ {} }});", REQUIRE_FN, getters.join(", ")));
    }
    if !rewritten.prologue.is_empty() {
        header.push(' ');
        header.push_str(&rewritten.prologue);
    }
    header
}

/// Text placed before the bundle's IIFE to bind its result
fn library_prefix(library: Option<&LibraryConfig>) -> String {
    let Some(library) = library else {
        return String::new();
    };
    let key = js_string(&library.name);
    match library.kind {
        LibraryType::Var => format!("var {} = ", library.name),
        LibraryType::Assign => format!("{} = ", library.name),
        LibraryType::This => format!("this[{}] = ", key),
        LibraryType::Window => format!("window[{}] = ", key),
        LibraryType::SelfScope => format!("self[{}] = ", key),
        LibraryType::Global => format!("globalThis[{}] = ", key),
    }
}

/// Module cache, require and export helpers
const RUNTIME: &str = r#"var __sdpack_cache = {};
function __sdpack_require(id) {
  var cached = __sdpack_cache[id];
  if (cached !== undefined) return cached.exports;
  var module = (__sdpack_cache[id] = { exports: {} });
  __sdpack_modules[id](module, module.exports, __sdpack_require);
  return module.exports;
}
__sdpack_require.d = function (exports, getters) {
  Object.defineProperty(exports, "__esModule", { value: true });
  for (var key in getters) {
    Object.defineProperty(exports, key, { enumerable: true, get: getters[key] });
  }
};
__sdpack_require.i = function (exports) {
  return exports && exports.__esModule ? exports : { "default": exports };
};
__sdpack_require.r = function (target, source) {
  Object.keys(source).forEach(function (key) {
    if (key === "default" || Object.prototype.hasOwnProperty.call(target, key)) return;
    Object.defineProperty(target, key, { enumerable: true, get: function () { return source[key]; } });
  });
};"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn graph_for(files: &[(&str, &str)]) -> (TempDir, ModuleGraph) {
        let temp_dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = temp_dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let entry = temp_dir.path().join(files[0].0);
        let graph = ModuleGraph::load(temp_dir.path(), &entry).unwrap();
        (temp_dir, graph)
    }

    fn options<'a>(library: Option<&'a LibraryConfig>, dir: &'a Path, source_map: bool) -> EmitOptions<'a> {
        EmitOptions {
            mode: Mode::Development,
            library,
            filename: "bundle.js",
            output_dir: dir,
            source_map,
        }
    }

    #[test]
    fn test_var_library_prefix() {
        let (dir, graph) = graph_for(&[("src/App.js", "export const x = 1;\n")]);
        let library = LibraryConfig {
            name: "SDPlugin".to_string(),
            kind: LibraryType::Var,
        };
        let out = emit_bundle(&graph, &options(Some(&library), dir.path(), false)).unwrap();
        assert!(out.code.starts_with("var SDPlugin = (function () {\n"));
        assert!(out.code.contains("return __sdpack_require(\"./src/App.js\");"));
        assert!(out.code.ends_with("})();\n"));
        assert!(out.source_map.is_none());
    }

    #[test]
    fn test_library_prefixes() {
        let library = |kind| LibraryConfig {
            name: "SDPlugin".to_string(),
            kind,
        };
        assert_eq!(library_prefix(None), "");
        assert_eq!(library_prefix(Some(&library(LibraryType::Assign))), "SDPlugin = ");
        assert_eq!(library_prefix(Some(&library(LibraryType::This))), "this[\"SDPlugin\"] = ");
        assert_eq!(library_prefix(Some(&library(LibraryType::Window))), "window[\"SDPlugin\"] = ");
        assert_eq!(library_prefix(Some(&library(LibraryType::SelfScope))), "self[\"SDPlugin\"] = ");
        assert_eq!(
            library_prefix(Some(&library(LibraryType::Global))),
            "globalThis[\"SDPlugin\"] = "
        );
    }

    #[test]
    fn test_without_library_runs_for_side_effects() {
        let (dir, graph) = graph_for(&[("src/App.js", "console.log(1);\n")]);
        let out = emit_bundle(&graph, &options(None, dir.path(), false)).unwrap();
        assert!(out.code.starts_with("(function () {\n"));
        assert!(out.code.contains("\n  __sdpack_require(\"./src/App.js\");\n"));
        assert!(!out.code.contains("return __sdpack_require(\"./src/App.js\")"));
    }

    #[test]
    fn test_body_lines_follow_banner_and_header() {
        let (dir, graph) = graph_for(&[("src/App.js", "const a = 1;\nconst b = 2;\n")]);
        let out = emit_bundle(&graph, &options(None, dir.path(), false)).unwrap();
        let lines: Vec<_> = out.code.lines().collect();
        assert_eq!(lines[3], "    /* ./src/App.js */");
        assert_eq!(lines[5], "const a = 1;");
        assert_eq!(lines[6], "const b = 2;");
    }

    #[test]
    fn test_source_map_maps_body_lines() {
        let (dir, graph) = graph_for(&[("src/App.js", "const a = 1;\nconst b = 2;\n")]);
        let out_dir = dir.path().join("bin/plugin.sdPlugin");
        let out = emit_bundle(&graph, &options(None, &out_dir, true)).unwrap();
        assert!(out.code.ends_with("//# sourceMappingURL=bundle.js.map\n"));

        let map = sourcemap::SourceMap::from_slice(out.source_map.unwrap().as_bytes()).unwrap();
        assert_eq!(map.get_source(0), Some("../../src/App.js"));
        let token = map.lookup_token(6, 0).unwrap();
        assert_eq!(token.get_src_line(), 1);
        assert_eq!(map.get_source_contents(0), Some("const a = 1;\nconst b = 2;\n"));
    }

    fn eval_with<T>(setup: &str, code: &str, expr: &str) -> T
    where
        T: for<'js> rquickjs::FromJs<'js>,
    {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            ctx.eval::<(), _>(setup).unwrap();
            ctx.eval::<(), _>(code).unwrap();
            ctx.eval::<T, _>(expr).unwrap()
        })
    }

    #[test]
    fn test_every_library_type_binds_the_entry_exports() {
        let (dir, graph) = graph_for(&[("src/App.js", "export const answer = 42;\n")]);
        let browser_globals = "globalThis.window = globalThis; globalThis.self = globalThis;";
        for kind in [
            LibraryType::Var,
            LibraryType::Assign,
            LibraryType::This,
            LibraryType::Window,
            LibraryType::SelfScope,
            LibraryType::Global,
        ] {
            let library = LibraryConfig {
                name: "SDPlugin".to_string(),
                kind,
            };
            let out = emit_bundle(&graph, &options(Some(&library), dir.path(), false)).unwrap();
            assert_eq!(
                eval_with::<i32>(browser_globals, &out.code, "globalThis.SDPlugin.answer"),
                42,
                "library type {:?}",
                kind
            );
        }
    }

    #[test]
    fn test_production_is_minified() {
        let (dir, graph) = graph_for(&[(
            "src/App.js",
            "// entry point\nexport function add(first, second) {\n  return first + second;\n}\n",
        )]);
        let library = LibraryConfig {
            name: "SDPlugin".to_string(),
            kind: LibraryType::Var,
        };
        let mut opts = options(Some(&library), dir.path(), false);
        opts.mode = Mode::Production;
        let out = emit_bundle(&graph, &opts).unwrap();

        assert!(!out.code.contains("/* ./src/App.js */"));
        assert!(!out.code.contains("entry point"));
        assert!(!out.code.contains("first + second"));
        assert!(out.code.contains("var __sdpack_modules = {};"));
        assert_eq!(eval_with::<i32>("", &out.code, "SDPlugin.add(2, 3)"), 5);
    }

    #[test]
    fn test_production_source_map_points_into_module() {
        let source = "const unused = 0;\nexport const value = compute();\nfunction compute() { return 7; }\n";
        let (dir, graph) = graph_for(&[("src/App.js", source)]);
        let mut opts = options(None, dir.path(), true);
        opts.mode = Mode::Production;
        let out = emit_bundle(&graph, &opts).unwrap();
        assert!(out.code.ends_with("//# sourceMappingURL=bundle.js.map\n"));

        let map = sourcemap::SourceMap::from_slice(out.source_map.unwrap().as_bytes()).unwrap();
        assert_eq!(map.get_source(0), Some("src/App.js"));
        assert_eq!(map.get_source_contents(0), Some(source));
        let lines = source.lines().count() as u32;
        assert!(map.tokens().count() > 0);
        assert!(map
            .tokens()
            .all(|token| token.get_src_line() < lines && token.get_source() == Some("src/App.js")));
        assert!(map.tokens().any(|token| token.get_src_line() == 1));
    }
}
