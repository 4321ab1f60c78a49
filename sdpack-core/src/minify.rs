//! Production minification
//!
//! Each module is minified on its own with oxc, so a module's source map
//! comes straight from oxc codegen and is rebased onto the bundle.

use std::path::Path;

use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_minifier::{Minifier, MinifierOptions};
use oxc_parser::Parser;
use oxc_span::SourceType;

use crate::error::BuildError;
use crate::transform::syntax_error;

/// Minified code and, when requested, its v3 source map JSON
#[derive(Debug, Clone)]
pub struct Minified {
    pub code: String,
    pub source_map: Option<String>,
}

/// Compress and mangle `source`, a script produced for module `path`
///
/// `wrapper_lines` is the number of generated lines in `source` before the
/// module's own first line; syntax errors are reported against the module.
pub fn minify_script(
    path: &Path,
    source: &str,
    wrapper_lines: usize,
    source_map: bool,
) -> Result<Minified, BuildError> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::cjs()).parse();
    if let Some(error) = parsed.errors.first() {
        return Err(syntax_error(path, source, error, wrapper_lines));
    }
    let mut program = parsed.program;

    let minified = Minifier::new(MinifierOptions::default()).minify(&allocator, &mut program);

    let options = CodegenOptions {
        source_map_path: source_map.then(|| path.to_path_buf()),
        ..CodegenOptions::minify()
    };
    let generated = Codegen::new()
        .with_options(options)
        .with_scoping(minified.scoping)
        .build(&program);

    Ok(Minified {
        code: generated.code,
        source_map: generated.map.map(|map| map.to_json_string()),
    })
}
