// Scripted Gateway - Derived Views
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Lint and dependency views of a source file. The file service only knows
// the Analyzer trait; payload shape belongs to the implementation.
// SourceAnalyzer is the built-in default: line checks plus a scan for
// require()/import/define() references.

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

pub trait Analyzer: Send + Sync {
    /// Diagnostics for a source file
    fn lint(&self, path: &Path, source: &str) -> Value;

    /// Resources referenced by a source file
    fn dependencies(&self, path: &Path, source: &str) -> Value;
}

// ============================================================================
// DEFAULT ANALYZER
// ============================================================================

const MAX_LINE_LEN: usize = 120;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub severity: &'static str,
    pub rule: &'static str,
    pub message: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceAnalyzer;

impl SourceAnalyzer {
    pub fn diagnostics(&self, source: &str) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let mut indent_style: Option<char> = None;

        for (idx, line) in source.lines().enumerate() {
            let line_no = idx + 1;

            let trimmed = line.trim_end();
            if trimmed.len() != line.len() {
                out.push(Diagnostic {
                    line: line_no,
                    column: trimmed.chars().count() + 1,
                    severity: "warning",
                    rule: "trailing-whitespace",
                    message: "Trailing whitespace".to_string(),
                });
            }

            let width = line.chars().count();
            if width > MAX_LINE_LEN {
                out.push(Diagnostic {
                    line: line_no,
                    column: MAX_LINE_LEN + 1,
                    severity: "info",
                    rule: "max-line-length",
                    message: format!("Line is {} characters (max {})", width, MAX_LINE_LEN),
                });
            }

            // First indented line sets the style for the file
            if let Some(first) = line.chars().next().filter(|c| *c == ' ' || *c == '\t') {
                let leading: Vec<char> = line.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
                let mixed_here = leading.iter().any(|c| *c != first);
                let style = *indent_style.get_or_insert(first);
                if mixed_here || style != first {
                    out.push(Diagnostic {
                        line: line_no,
                        column: 1,
                        severity: "warning",
                        rule: "mixed-indentation",
                        message: "Indentation mixes tabs and spaces".to_string(),
                    });
                }
            }
        }

        if !source.is_empty() && !source.ends_with('\n') {
            out.push(Diagnostic {
                line: source.lines().count().max(1),
                column: source.lines().last().map(|l| l.chars().count() + 1).unwrap_or(1),
                severity: "info",
                rule: "final-newline",
                message: "File does not end with a newline".to_string(),
            });
        }

        out
    }

    /// Module references, de-duplicated and sorted
    pub fn references(&self, source: &str) -> Vec<String> {
        let mut refs = BTreeSet::new();

        for cap in require_re().captures_iter(source) {
            refs.insert(cap[1].to_string());
        }
        for cap in import_re().captures_iter(source) {
            refs.insert(cap[1].to_string());
        }
        for cap in define_re().captures_iter(source) {
            for dep in quoted_re().captures_iter(&cap[1]) {
                refs.insert(dep[1].to_string());
            }
        }

        refs.into_iter().collect()
    }
}

impl Analyzer for SourceAnalyzer {
    fn lint(&self, path: &Path, source: &str) -> Value {
        let diagnostics = self.diagnostics(source);
        json!({
            "path": path.to_string_lossy(),
            "count": diagnostics.len(),
            "diagnostics": diagnostics,
        })
    }

    fn dependencies(&self, path: &Path, source: &str) -> Value {
        let refs = self.references(source);
        let dependencies: Vec<Value> = refs
            .into_iter()
            .map(|r| {
                let kind = if r.starts_with("./") || r.starts_with("../") { "relative" } else { "module" };
                json!({ "ref": r, "kind": kind })
            })
            .collect();
        json!({
            "path": path.to_string_lossy(),
            "dependencies": dependencies,
        })
    }
}

fn require_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("static regex"))
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\bimport\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"]"#).expect("static regex")
    })
}

fn define_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bdefine\s*\(\s*(?:['\x22][^'\x22]*['\x22]\s*,\s*)?\[([^\]]*)\]").expect("static regex"))
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("static regex"))
}

// ============================================================================
// TESTS
// ============================================================================
