//! Fixture projects for sdpack benchmarks
//!
//! Generates a layered module graph on disk: the entry imports every module of
//! the first layer, each module imports the next layer, and the last layer
//! pulls in a shared JSON file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sdpack_core::{PackConfig, ResolvedConfig};

/// Shape of a generated project
#[derive(Debug, Clone, Copy)]
pub struct FixtureShape {
    /// Number of import layers below the entry
    pub depth: usize,
    /// Modules per layer
    pub width: usize,
    /// Filler statements per module
    pub statements: usize,
}

impl FixtureShape {
    pub const SMALL: FixtureShape = FixtureShape { depth: 2, width: 5, statements: 20 };
    pub const LARGE: FixtureShape = FixtureShape { depth: 6, width: 25, statements: 80 };

    pub fn module_count(&self) -> usize {
        // entry + layers + shared json
        1 + self.depth * self.width + 1
    }
}

fn module_name(layer: usize, index: usize) -> String {
    format!("layer{}_mod{}", layer, index)
}

fn write_module(dir: &Path, layer: usize, index: usize, shape: &FixtureShape) -> io::Result<()> {
    let mut source = String::new();
    if layer + 1 < shape.depth {
        for next in 0..shape.width {
            let name = module_name(layer + 1, next);
            source.push_str(&format!("import {{ value as {0} }} from \"./{0}.js\";\n", name));
        }
    } else {
        source.push_str("import shared from \"./shared.json\";\n");
    }

    for i in 0..shape.statements {
        source.push_str(&format!("const item{0} = {{ id: {0}, label: \"item {0}\" }};\n", i));
    }

    let sum = if layer + 1 < shape.depth {
        (0..shape.width)
            .map(|next| module_name(layer + 1, next))
            .collect::<Vec<_>>()
            .join(" + ")
    } else {
        "shared.base".to_string()
    };
    source.push_str(&format!("export const value = {} + {};\n", sum, index));
    source.push_str("export function describe() {\n  return \"module\";\n}\n");

    fs::write(dir.join(format!("{}.js", module_name(layer, index))), source)
}

/// Write a project of the given shape under `root` and resolve its config
pub fn generate_project(root: &Path, shape: &FixtureShape) -> io::Result<ResolvedConfig> {
    let src = root.join("src");
    fs::create_dir_all(&src)?;
    fs::write(src.join("shared.json"), "{ \"base\": 1 }\n")?;

    for layer in 0..shape.depth {
        for index in 0..shape.width {
            write_module(&src, layer, index, shape)?;
        }
    }

    let mut entry = String::new();
    for index in 0..shape.width {
        entry.push_str(&format!(
            "import {{ value as {0} }} from \"./{0}.js\";\n",
            module_name(0, index)
        ));
    }
    let total = (0..shape.width)
        .map(|index| module_name(0, index))
        .collect::<Vec<_>>()
        .join(" + ");
    entry.push_str(&format!("export const total = {};\n", total));
    fs::write(src.join("index.js"), entry)?;

    PackConfig::default()
        .resolve(root)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Path of the generated entry module
pub fn entry_path(root: &Path) -> PathBuf {
    root.join("src").join("index.js")
}
