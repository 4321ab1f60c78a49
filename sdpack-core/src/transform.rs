//! ES module linking
//!
//! Parses a module with oxc and records the edits that turn its
//! `import`/`export` declarations and `require()` calls into calls against the
//! bundle runtime (`__sdpack_require`). A reference to an imported binding
//! becomes a property read on the imported module's exports object, so
//! imports stay live and circular imports see values once they exist.
//!
//! Edits never add or remove line breaks: line N of a rewritten module is
//! line N of its source. The development source map relies on this.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, CallExpression, Declaration, ExportAllDeclaration, ExportDefaultDeclaration,
    ExportDefaultDeclarationKind, ExportNamedDeclaration, Expression, IdentifierReference,
    ImportDeclaration, ImportDeclarationSpecifier, ObjectProperty, Program, Statement,
    StaticMemberExpression, TaggedTemplateExpression,
};
use oxc_ast_visit::{walk, Visit};
use oxc_diagnostics::OxcDiagnostic;
use oxc_parser::Parser;
use oxc_semantic::{Scoping, SemanticBuilder};
use oxc_span::{GetSpan, SourceType, Span};
use oxc_syntax::symbol::SymbolId;

use crate::config::Mode;
use crate::error::BuildError;
use crate::path_utils::is_js_identifier;

/// Name of the runtime require function inside the bundle
pub const REQUIRE_FN: &str = "__sdpack_require";

/// Local holding an `export default <expression>` value
const DEFAULT_LOCAL: &str = "__sdpack_default";

/// How a module's source is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Script,
    Json,
}

impl ModuleKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ModuleKind::Json,
            _ => ModuleKind::Script,
        }
    }
}

/// A module dependency as written in source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub specifier: String,
    /// 1-based line of the declaration or call
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Replacement {
    Text(String),
    /// `require("<specifier>")`, filled in with the resolved id
    Require(String),
    /// `process.env.NODE_ENV`, filled in with the mode name
    NodeEnv,
}

#[derive(Debug, Clone)]
struct Edit {
    start: usize,
    end: usize,
    replacement: Replacement,
}

/// A module required in the prologue, before the body runs
#[derive(Debug, Clone)]
struct ModuleImport {
    offset: usize,
    specifier: String,
    binding: String,
    /// Needs `<binding>_default` for default-import interop
    default_interop: bool,
    /// `export * from` this module
    reexport_all: bool,
}

/// A parsed module with the edits the bundler applies to it
#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub path: PathBuf,
    pub kind: ModuleKind,
    source: String,
    dependencies: Vec<Dependency>,
    imports: Vec<ModuleImport>,
    exports: Vec<(String, String)>,
    edits: Vec<Edit>,
    is_esm: bool,
}

/// Rewritten module body plus the exports it exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenModule {
    /// Single-line statements run before the body: requires of imported
    /// modules, default interop and `export *` forwarding
    pub prologue: String,
    pub body: String,
    /// (exported name, getter expression) in source order
    pub exports: Vec<(String, String)>,
    /// Whether the module used ES module syntax
    pub is_esm: bool,
}

impl ParsedModule {
    /// Parse `source` and record the declarations the bundler rewrites
    pub fn parse(path: &Path, source: String) -> Result<Self, BuildError> {
        let kind = ModuleKind::from_path(path);

        if kind == ModuleKind::Json {
            serde_json::from_str::<serde_json::Value>(&source).map_err(|source| {
                BuildError::Json {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            return Ok(Self {
                path: path.to_path_buf(),
                kind,
                source,
                dependencies: Vec::new(),
                imports: Vec::new(),
                exports: Vec::new(),
                edits: Vec::new(),
                is_esm: false,
            });
        }

        let linked = link_source(path, &source)?;
        let dependencies = linked
            .dependencies
            .into_iter()
            .map(|(offset, specifier)| Dependency {
                specifier,
                line: line_of(&source, offset),
            })
            .collect();
        let Linked {
            imports,
            exports,
            edits,
            is_esm,
            ..
        } = linked;

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            source,
            dependencies,
            imports,
            exports,
            edits,
            is_esm,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Module specifiers in order of appearance
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.dependencies.clone()
    }

    /// Rewrite the module against resolved dependency ids
    ///
    /// `resolved` maps each specifier from [`ParsedModule::dependencies`] to a module id.
    pub fn rewrite(&self, resolved: &HashMap<String, String>, mode: Mode) -> RewrittenModule {
        if self.kind == ModuleKind::Json {
            return RewrittenModule {
                prologue: String::new(),
                body: format!("module.exports = {};", self.source.trim_end()),
                exports: Vec::new(),
                is_esm: false,
            };
        }

        let mut body = String::with_capacity(self.source.len() + 256);
        let mut cursor = 0usize;
        for edit in &self.edits {
            body.push_str(&self.source[cursor..edit.start]);
            match &edit.replacement {
                Replacement::Text(text) => body.push_str(text),
                Replacement::Require(specifier) => body.push_str(&require_expr(specifier, resolved)),
                Replacement::NodeEnv => body.push_str(&js_string(mode.as_str())),
            }
            for _ in 0..self.source[edit.start..edit.end].matches('\n').count() {
                body.push('\n');
            }
            cursor = edit.end;
        }
        body.push_str(&self.source[cursor..]);

        let mut ordered: Vec<&ModuleImport> = self.imports.iter().collect();
        ordered.sort_by_key(|import| import.offset);
        let mut prologue = Vec::new();
        for import in ordered {
            prologue.push(format!(
                "var {} = {};",
                import.binding,
                require_expr(&import.specifier, resolved)
            ));
            if import.default_interop {
                prologue.push(format!(
                    "var {0}_default = {1}.i({0});",
                    import.binding, REQUIRE_FN
                ));
            }
            if import.reexport_all {
                prologue.push(format!("{}.r(exports, {});", REQUIRE_FN, import.binding));
            }
        }

        RewrittenModule {
            prologue: prologue.join(" "),
            body,
            exports: self.exports.clone(),
            is_esm: self.is_esm,
        }
    }
}

/// Output of linking one script
struct Linked {
    dependencies: Vec<(usize, String)>,
    imports: Vec<ModuleImport>,
    exports: Vec<(String, String)>,
    edits: Vec<Edit>,
    is_esm: bool,
}

fn link_source(path: &Path, source: &str) -> Result<Linked, BuildError> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, source_type_for(path)).parse();
    if let Some(error) = parsed.errors.first() {
        return Err(syntax_error(path, source, error, 0));
    }
    let semantic = SemanticBuilder::new().build(&parsed.program).semantic;

    let mut linker = Linker::new(semantic.scoping());
    linker.link(&parsed.program);
    let mut linked = Linked {
        dependencies: linker.dependencies,
        imports: linker.imports,
        exports: linker.exports,
        edits: linker.edits,
        is_esm: linker.is_esm,
    };
    linked.dependencies.sort_by_key(|(offset, _)| *offset);
    linked.edits.sort_by_key(|edit| (edit.start, edit.end));
    Ok(linked)
}

/// Walks one program, collecting edits, dependencies and exports
struct Linker<'s> {
    scoping: &'s Scoping,
    /// Imported binding -> expression that reads it
    bindings: HashMap<SymbolId, String>,
    /// Imported local name -> expression, for `export { local }`
    binding_names: HashMap<String, String>,
    dependencies: Vec<(usize, String)>,
    imports: Vec<ModuleImport>,
    exports: Vec<(String, String)>,
    edits: Vec<Edit>,
    is_esm: bool,
}

impl<'s> Linker<'s> {
    fn new(scoping: &'s Scoping) -> Self {
        Self {
            scoping,
            bindings: HashMap::new(),
            binding_names: HashMap::new(),
            dependencies: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            edits: Vec::new(),
            is_esm: false,
        }
    }

    fn link<'a>(&mut self, program: &Program<'a>) {
        // Import bindings are hoisted: collect them before any reference.
        for statement in &program.body {
            if let Statement::ImportDeclaration(decl) = statement {
                self.import_declaration(decl);
            }
        }
        for statement in &program.body {
            match statement {
                Statement::ImportDeclaration(_) => {}
                Statement::ExportNamedDeclaration(decl) => self.export_named(decl),
                Statement::ExportDefaultDeclaration(decl) => self.export_default(decl),
                Statement::ExportAllDeclaration(decl) => self.export_all(decl),
                other => self.visit_statement(other),
            }
        }
    }

    fn replace(&mut self, span: Span, replacement: Replacement) {
        self.edits.push(Edit {
            start: span.start as usize,
            end: span.end as usize,
            replacement,
        });
    }

    fn remove(&mut self, span: Span) {
        self.replace(span, Replacement::Text(String::new()));
    }

    fn add_import(&mut self, span: Span, specifier: &str, reexport_all: bool) -> usize {
        let index = self.imports.len();
        let offset = span.start as usize;
        self.is_esm = true;
        self.dependencies.push((offset, specifier.to_string()));
        self.imports.push(ModuleImport {
            offset,
            specifier: specifier.to_string(),
            binding: format!("__sdpack_imported_{}", index),
            default_interop: false,
            reexport_all,
        });
        index
    }

    /// Expression reading export `name` of import `index`
    fn import_member(&mut self, index: usize, name: &str) -> String {
        let import = &mut self.imports[index];
        if name == "default" {
            import.default_interop = true;
            format!("{}_default[\"default\"]", import.binding)
        } else {
            member(&import.binding, name)
        }
    }

    fn import_declaration(&mut self, decl: &ImportDeclaration<'_>) {
        let index = self.add_import(decl.span, &decl.source.value, false);
        if let Some(specifiers) = &decl.specifiers {
            for specifier in specifiers {
                let (local, expr) = match specifier {
                    ImportDeclarationSpecifier::ImportSpecifier(s) => {
                        (&s.local, self.import_member(index, &s.imported.name()))
                    }
                    ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => {
                        (&s.local, self.import_member(index, "default"))
                    }
                    ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => {
                        (&s.local, self.imports[index].binding.clone())
                    }
                };
                self.bindings.insert(local.symbol_id(), expr.clone());
                self.binding_names.insert(local.name.to_string(), expr);
            }
        }
        self.remove(decl.span);
    }

    fn export_named<'a>(&mut self, decl: &ExportNamedDeclaration<'a>) {
        self.is_esm = true;

        if let Some(declaration) = &decl.declaration {
            for name in declared_names(declaration) {
                push_export(&mut self.exports, name.clone(), name);
            }
            self.remove(Span::new(decl.span.start, declaration.span().start));
            self.visit_declaration(declaration);
            return;
        }

        match &decl.source {
            Some(source) => {
                let index = self.add_import(decl.span, &source.value, false);
                for specifier in &decl.specifiers {
                    let expr = self.import_member(index, &specifier.local.name());
                    push_export(&mut self.exports, specifier.exported.name().to_string(), expr);
                }
            }
            None => {
                for specifier in &decl.specifiers {
                    let local = specifier.local.name().to_string();
                    let expr = self.binding_names.get(&local).cloned().unwrap_or(local);
                    push_export(&mut self.exports, specifier.exported.name().to_string(), expr);
                }
            }
        }
        self.remove(decl.span);
    }

    fn export_default<'a>(&mut self, decl: &ExportDefaultDeclaration<'a>) {
        self.is_esm = true;

        let inner = decl.declaration.span();
        let prefix = Span::new(decl.span.start, inner.start);
        let declared = match &decl.declaration {
            ExportDefaultDeclarationKind::FunctionDeclaration(func) => {
                Some(func.id.as_ref().map(|id| id.name.to_string()))
            }
            ExportDefaultDeclarationKind::ClassDeclaration(class) => {
                Some(class.id.as_ref().map(|id| id.name.to_string()))
            }
            _ => None,
        };

        match declared {
            Some(Some(name)) => {
                self.remove(prefix);
                push_export(&mut self.exports, "default".to_string(), name);
            }
            Some(None) => {
                // Anonymous declaration becomes an expression statement
                self.replace(prefix, Replacement::Text(format!("var {} = ", DEFAULT_LOCAL)));
                self.replace(Span::new(inner.end, inner.end), Replacement::Text(";".to_string()));
                push_export(&mut self.exports, "default".to_string(), DEFAULT_LOCAL.to_string());
            }
            None => {
                self.replace(prefix, Replacement::Text(format!("var {} = ", DEFAULT_LOCAL)));
                push_export(&mut self.exports, "default".to_string(), DEFAULT_LOCAL.to_string());
            }
        }

        self.visit_export_default_declaration_kind(&decl.declaration);
    }

    fn export_all<'a>(&mut self, decl: &ExportAllDeclaration<'a>) {
        let index = self.add_import(decl.span, &decl.source.value, decl.exported.is_none());
        if let Some(exported) = &decl.exported {
            let binding = self.imports[index].binding.clone();
            push_export(&mut self.exports, exported.name().to_string(), binding);
        }
        self.remove(decl.span);
    }

    /// Expression for `ident` if it refers to an import binding
    fn imported(&self, ident: &IdentifierReference<'_>) -> Option<String> {
        let symbol = self.scoping.get_reference(ident.reference_id()).symbol_id()?;
        self.bindings.get(&symbol).cloned()
    }

    fn is_unbound(&self, ident: &IdentifierReference<'_>) -> bool {
        self.scoping
            .get_reference(ident.reference_id())
            .symbol_id()
            .is_none()
    }

    /// Specifier of a `require("x")` call to the free `require`
    fn require_specifier(&self, call: &CallExpression<'_>) -> Option<String> {
        let Expression::Identifier(callee) = &call.callee else {
            return None;
        };
        if callee.name.as_str() != "require" || !self.is_unbound(callee) || call.arguments.len() != 1 {
            return None;
        }
        match &call.arguments[0] {
            Argument::StringLiteral(literal) => Some(literal.value.to_string()),
            _ => None,
        }
    }

    /// `process.env.NODE_ENV` with a free `process`
    fn is_node_env(&self, expr: &StaticMemberExpression<'_>) -> bool {
        if expr.property.name.as_str() != "NODE_ENV" {
            return false;
        }
        let Expression::StaticMemberExpression(env) = &expr.object else {
            return false;
        };
        if env.property.name.as_str() != "env" {
            return false;
        }
        match &env.object {
            Expression::Identifier(process) => {
                process.name.as_str() == "process" && self.is_unbound(process)
            }
            _ => false,
        }
    }
}

impl<'a> Visit<'a> for Linker<'_> {
    fn visit_identifier_reference(&mut self, it: &IdentifierReference<'a>) {
        if let Some(expr) = self.imported(it) {
            self.replace(it.span, Replacement::Text(expr));
        }
    }

    fn visit_object_property(&mut self, it: &ObjectProperty<'a>) {
        if it.shorthand {
            if let Expression::Identifier(ident) = &it.value {
                if let Some(expr) = self.imported(ident) {
                    self.replace(ident.span, Replacement::Text(format!("{}: {}", ident.name, expr)));
                    return;
                }
            }
        }
        walk::walk_object_property(self, it);
    }

    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        if let Some(specifier) = self.require_specifier(it) {
            self.dependencies.push((it.span.start as usize, specifier.clone()));
            self.replace(it.span, Replacement::Require(specifier));
            return;
        }
        if let Expression::Identifier(callee) = &it.callee {
            // Imported functions are called without a `this`
            if let Some(expr) = self.imported(callee) {
                self.replace(callee.span, Replacement::Text(format!("(0, {})", expr)));
                self.visit_arguments(&it.arguments);
                return;
            }
        }
        walk::walk_call_expression(self, it);
    }

    fn visit_tagged_template_expression(&mut self, it: &TaggedTemplateExpression<'a>) {
        if let Expression::Identifier(tag) = &it.tag {
            if let Some(expr) = self.imported(tag) {
                self.replace(tag.span, Replacement::Text(format!("(0, {})", expr)));
                self.visit_template_literal(&it.quasi);
                return;
            }
        }
        walk::walk_tagged_template_expression(self, it);
    }

    fn visit_static_member_expression(&mut self, it: &StaticMemberExpression<'a>) {
        if self.is_node_env(it) {
            self.replace(it.span, Replacement::NodeEnv);
            return;
        }
        walk::walk_static_member_expression(self, it);
    }
}

/// Names bound by an exported declaration
fn declared_names(declaration: &Declaration<'_>) -> Vec<String> {
    match declaration {
        Declaration::VariableDeclaration(var) => var
            .declarations
            .iter()
            .flat_map(|declarator| declarator.id.get_binding_identifiers())
            .map(|ident| ident.name.to_string())
            .collect(),
        Declaration::FunctionDeclaration(func) => {
            func.id.iter().map(|id| id.name.to_string()).collect()
        }
        Declaration::ClassDeclaration(class) => {
            class.id.iter().map(|id| id.name.to_string()).collect()
        }
        _ => Vec::new(),
    }
}

fn source_type_for(path: &Path) -> SourceType {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mjs") => SourceType::mjs(),
        Some("cjs") => SourceType::cjs(),
        _ => SourceType::unambiguous(),
    }
}

/// Map a parser diagnostic to [`BuildError::Syntax`]
///
/// `line_shift` is subtracted from the reported line, for sources wrapped
/// in generated lines.
pub(crate) fn syntax_error(path: &Path, source: &str, error: &OxcDiagnostic, line_shift: usize) -> BuildError {
    let offset = error
        .labels
        .as_ref()
        .and_then(|labels| labels.first())
        .map_or(0, |label| label.offset());
    BuildError::Syntax {
        module: path.to_path_buf(),
        line: line_of(source, offset.min(source.len())).saturating_sub(line_shift).max(1),
        message: error.message.to_string(),
    }
}

fn push_export(exports: &mut Vec<(String, String)>, name: String, expr: String) {
    if !exports.iter().any(|(existing, _)| *existing == name) {
        exports.push((name, expr));
    }
}

fn require_expr(specifier: &str, resolved: &HashMap<String, String>) -> String {
    let id = resolved.get(specifier).map(String::as_str).unwrap_or(specifier);
    format!("{}({})", REQUIRE_FN, js_string(id))
}

fn member(object: &str, key: &str) -> String {
    if is_js_identifier(key) {
        format!("{}.{}", object, key)
    } else {
        format!("{}[{}]", object, js_string(key))
    }
}

/// Quote a string as a JavaScript literal
pub fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}
