//! Static validation and rewriting of untrusted plugin source.
//!
//! Pipeline, none of which executes code:
//! 1. Parse with oxc (module grammar, so import declarations are visible)
//! 2. Reject any module-import construct, static or dynamic
//! 3. Audit free identifiers against the sandbox allow-list
//! 4. Mangle identifiers scope-aware and emit minified source
//!
//! The whole pass is skippable (`minify = false`) for trusted re-imports of
//! source that already went through it; the sandbox's runtime interception
//! still applies in that case.

use crate::error::{HostResult, PluginHostError};
use oxc::ast::ast::{Program, Statement};
use oxc::codegen::{Codegen, CodegenOptions};
use oxc::minifier::{Minifier, MinifierOptions};
use oxc::parser::Parser;
use oxc::semantic::SemanticBuilder;
use oxc::span::SourceType;
use oxc::syntax::module_record::ModuleRecord;

/// Every name a plugin script may reference freely. Anything else fails the
/// audit; for scripts that skip the audit, the sandbox proxy denies it at
/// runtime. Must stay in sync with the container built by the sandbox
/// bootstrap.
pub(crate) const SANDBOX_GLOBALS: &[&str] = &[
    "Number",
    "Date",
    "Math",
    "RegExp",
    "JSON",
    "Promise",
    "undefined",
    "NaN",
    "Infinity",
    "isNull",
    "isUndefined",
    "isString",
    "isNumber",
    "isArray",
    "isDate",
    "isFunction",
    "setTimeout",
    "setInterval",
    "clearInterval",
    "parseQuery",
    "PLUGIN_TYPE",
    "console",
    "plugin",
];

/// Source text that passed (or explicitly skipped) static validation.
#[derive(Debug, Clone)]
pub struct PreparedSource {
    pub text: String,
    /// Whether the rewrite pass actually ran.
    pub minified: bool,
}

/// Validates and rewrites `source`.
///
/// With `minify = false` the source passes through untouched; this is the
/// trusted re-import path for already-rewritten persisted code.
pub fn prepare(source: &str, minify: bool) -> HostResult<PreparedSource> {
    if !minify {
        return Ok(PreparedSource {
            text: source.to_string(),
            minified: false,
        });
    }

    let allocator = oxc_allocator::Allocator::default();
    let parse_ret = Parser::new(&allocator, source, SourceType::mjs()).parse();

    if parse_ret.panicked || !parse_ret.errors.is_empty() {
        let errors: Vec<String> = parse_ret.errors.iter().map(|e| format!("{e}")).collect();
        return Err(PluginHostError::Validation(format!(
            "script parse error:\n{}",
            errors.join("\n")
        )));
    }

    let mut program = parse_ret.program;

    check_imports(source, &program, &parse_ret.module_record)?;
    audit_free_identifiers(source, &program)?;

    // Scope-aware identifier mangling plus whitespace minification. This
    // shrinks the persisted form and deters casual reverse-engineering; it
    // carries no security weight of its own.
    let minifier_ret = Minifier::new(MinifierOptions::default()).minify(&allocator, &mut program);
    let text = Codegen::new()
        .with_options(CodegenOptions {
            minify: true,
            ..CodegenOptions::default()
        })
        .with_scoping(minifier_ret.scoping)
        .build(&program)
        .code;

    Ok(PreparedSource {
        text,
        minified: true,
    })
}

/// Rejects module-import constructs: top-level `import … from …`
/// declarations by node kind, and `import(…)` expressions via the parser's
/// module record (they can appear at any depth).
fn check_imports(
    source: &str,
    program: &Program<'_>,
    module_record: &ModuleRecord<'_>,
) -> HostResult<()> {
    for stmt in &program.body {
        if let Statement::ImportDeclaration(decl) = stmt {
            let line = line_of(source, decl.span.start as usize);
            return Err(PluginHostError::Validation(format!(
                "import statements are not allowed in plugins (line {line})"
            )));
        }
    }

    if let Some(dynamic) = module_record.dynamic_imports.first() {
        let line = line_of(source, dynamic.span.start as usize);
        return Err(PluginHostError::Validation(format!(
            "dynamic import() is not allowed in plugins (line {line})"
        )));
    }

    Ok(())
}

/// Checks every unresolved (free) identifier reference against the sandbox
/// allow-list. Reads of unknown names and writes to any free name are
/// permission errors; the messages name the identifier.
fn audit_free_identifiers(_source: &str, program: &Program<'_>) -> HostResult<()> {
    let semantic_ret = SemanticBuilder::new().build(program);
    let scoping = semantic_ret.semantic.into_scoping();

    let mut names: Vec<&str> = scoping
        .root_unresolved_references()
        .keys()
        .map(|name| name.as_ref())
        .collect();
    names.sort_unstable();

    for name in &names {
        if !SANDBOX_GLOBALS.contains(name) {
            return Err(PluginHostError::PermissionDenied(format!(
                "identifier '{name}' is not available to plugins"
            )));
        }
    }

    // Allow-listed names are read-only from plugin code; the only writable
    // slot is the `exports` property of `plugin`, which is a member write
    // and never an unresolved-reference write.
    for (name, references) in scoping.root_unresolved_references() {
        let name: &str = name.as_ref();
        for reference_id in references {
            if scoping.get_reference(*reference_id).flags().is_write() {
                return Err(PluginHostError::PermissionDenied(format!(
                    "cannot assign to '{name}' from plugin code"
                )));
            }
        }
    }

    Ok(())
}

/// 1-based line number of a byte offset.
fn line_of(source: &str, offset: usize) -> usize {
    let clamped = offset.min(source.len());
    source[..clamped].bytes().filter(|&b| b == b'\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_minify_disabled() {
        let src = "import fs from \"fs\";\n";
        let prepared = prepare(src, false).unwrap();
        assert_eq!(prepared.text, src);
        assert!(!prepared.minified);
    }

    #[test]
    fn import_declaration_rejected_with_line() {
        let src = "var x = 1;\nimport fs from \"fs\";\n";
        let err = prepare(src, true).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("import statements are not allowed"), "got: {msg}");
        assert!(msg.contains("line 2"), "got: {msg}");
    }

    #[test]
    fn dynamic_import_rejected() {
        let src = "function f() {\n  return import(\"fs\");\n}\nplugin.exports = f;\n";
        let err = prepare(src, true).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dynamic import()"), "got: {msg}");
        assert!(msg.contains("line 2"), "got: {msg}");
    }

    #[test]
    fn import_text_in_strings_and_comments_allowed() {
        let src = "var s = \"import(x)\";\n// import(y)\nplugin.exports = s;\n";
        prepare(src, true).unwrap();
    }

    #[test]
    fn property_named_import_allowed() {
        let src = "var api = { import: function () { return 1; } };\nplugin.exports = api.import();\n";
        prepare(src, true).unwrap();
    }

    #[test]
    fn unknown_free_identifier_rejected_by_name() {
        let src = "plugin.exports = globalThis;\n";
        let err = prepare(src, true).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("permission denied"), "got: {msg}");
        assert!(msg.contains("'globalThis'"), "got: {msg}");
    }

    #[test]
    fn eval_rejected() {
        let src = "plugin.exports = eval(\"1\");\n";
        let err = prepare(src, true).unwrap_err();
        assert!(err.to_string().contains("'eval'"));
    }

    #[test]
    fn write_to_free_identifier_rejected() {
        let src = "Math = null;\nplugin.exports = 1;\n";
        let err = prepare(src, true).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cannot assign to 'Math'"), "got: {msg}");
    }

    #[test]
    fn allow_listed_names_pass() {
        let src = r#"
class Demo {
    search(keyword) {
        console.log(keyword);
        return JSON.stringify(parseQuery("a=1"));
    }
}
Demo.TYPE = PLUGIN_TYPE.SOURCE;
plugin.exports = Demo;
"#;
        let prepared = prepare(src, true).unwrap();
        assert!(prepared.minified);
    }

    #[test]
    fn locals_shadowing_unknown_globals_pass() {
        // `window` is a local here, not a free identifier.
        let src = "function f(window) { return window; }\nplugin.exports = f;\n";
        prepare(src, true).unwrap();
    }

    #[test]
    fn minified_output_shrinks_and_renames_locals() {
        let src = r#"
function buildResult(longArgumentName) {
    var somethingVeryLocal = longArgumentName + 1;
    return somethingVeryLocal;
}
plugin.exports = buildResult;
"#;
        let prepared = prepare(src, true).unwrap();
        assert!(prepared.text.len() < src.len());
        assert!(!prepared.text.contains("somethingVeryLocal"));
        // Free references survive mangling untouched.
        assert!(prepared.text.contains("plugin.exports"));
    }

    #[test]
    fn parse_error_is_validation_error() {
        let err = prepare("class {", true).unwrap_err();
        assert!(matches!(err, PluginHostError::Validation(_)));
    }

    #[test]
    fn line_of_counts_from_one() {
        assert_eq!(line_of("abc", 0), 1);
        assert_eq!(line_of("a\nb\nc", 2), 2);
        assert_eq!(line_of("a\nb\nc", 4), 3);
    }
}
