//! The source indexer seam.
//!
//! An [`Indexer`] turns a [`SourceTree`] into an [`IndexDocument`]. Two
//! implementations ship:
//!
//! - **[`BuiltinIndexer`]**: a shallow, line-prefix scanner. It detects the
//!   language by extension, counts lines, takes the leading comment block as
//!   the summary, and records top-level declarations and imports. It does
//!   not parse grammars.
//! - **[`CommandIndexer`]**: runs an external program with the source root
//!   appended to its argv and parses stdout as Indexer Output JSON.
//!
//! Both emit `schema_version`, and command output goes through
//! [`parse_index_document`] so an unknown version is rejected.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use context_relay_core::models::{
    parse_index_document, IndexDocument, IndexMetadata, ModuleEntry, SCHEMA_VERSION,
};

use crate::config::IndexerConfig;
use crate::fingerprint::{SourceFile, SourceTree};

/// Longest summary kept from a leading comment block.
const MAX_SUMMARY_CHARS: usize = 240;

/// Produces an [`IndexDocument`] for a source tree.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Short label used in logs (`"builtin"`, `"command"`).
    fn name(&self) -> &str;

    async fn index(&self, tree: &SourceTree) -> Result<IndexDocument>;
}

/// Build the indexer described by config.
pub fn create_indexer(config: &IndexerConfig) -> Result<Arc<dyn Indexer>> {
    match config.kind.as_str() {
        "builtin" => Ok(Arc::new(BuiltinIndexer)),
        "command" => Ok(Arc::new(CommandIndexer::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        other => bail!("Unknown indexer kind: {}", other),
    }
}

// ============ Builtin ============

pub struct BuiltinIndexer;

#[async_trait]
impl Indexer for BuiltinIndexer {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn index(&self, tree: &SourceTree) -> Result<IndexDocument> {
        let tree = tree.clone();
        tokio::task::spawn_blocking(move || index_tree(&tree))
            .await
            .context("builtin indexer task panicked")?
    }
}

fn index_tree(tree: &SourceTree) -> Result<IndexDocument> {
    let files = tree.files()?;
    let mut modules = Vec::with_capacity(files.len());
    for file in &files {
        modules.push(index_file(file)?);
    }

    Ok(IndexDocument {
        schema_version: SCHEMA_VERSION,
        metadata: IndexMetadata {
            project_name: project_name(tree.root()),
            generated_at: Utc::now(),
            fingerprint_inputs: vec![
                format!("root: {}", tree.root().display()),
                format!("files: {}", files.len()),
            ],
        },
        modules,
    }
    .normalized())
}

fn project_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(root)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn index_file(file: &SourceFile) -> Result<ModuleEntry> {
    let bytes = std::fs::read(&file.absolute)
        .with_context(|| format!("Failed to read {}", file.absolute.display()))?;
    let body = String::from_utf8_lossy(&bytes);
    let language = language_for(&file.relative);

    Ok(ModuleEntry {
        path: file.relative.clone(),
        language: language.to_string(),
        symbols: extract_symbols(&body),
        dependencies: extract_dependencies(&body),
        summary: extract_summary(&body),
        line_count: body.lines().count(),
        tags: Vec::new(),
    })
}

pub fn language_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext {
        "rs" => "rust",
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" | "cxx" => "cpp",
        "rb" => "ruby",
        "sh" | "bash" => "shell",
        "toml" => "toml",
        "md" => "markdown",
        _ => "text",
    }
}

/// Leading comment block, joined into one line.
fn extract_summary(body: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut in_docstring = false;

    for raw in body.lines() {
        let line = raw.trim();
        if in_docstring {
            let (text, closed) = match line.find("\"\"\"") {
                Some(end) => (&line[..end], true),
                None => (line, false),
            };
            if !text.is_empty() {
                parts.push(text.to_string());
            }
            if closed {
                break;
            }
            continue;
        }
        if line.is_empty() {
            if parts.is_empty() {
                continue;
            }
            break;
        }
        if line.starts_with("#!") || line.starts_with("#[") || line.starts_with("#![") {
            continue;
        }
        if let Some(rest) = line.strip_prefix("\"\"\"") {
            match rest.find("\"\"\"") {
                Some(end) => {
                    parts.push(rest[..end].to_string());
                    break;
                }
                None => {
                    if !rest.is_empty() {
                        parts.push(rest.to_string());
                    }
                    in_docstring = true;
                    continue;
                }
            }
        }
        let stripped = ["//!", "///", "//", "/**", "/*", "*/", "*", "#"]
            .iter()
            .find_map(|p| line.strip_prefix(p));
        match stripped {
            Some(text) => {
                let text = text.trim().trim_end_matches("*/").trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            None => break,
        }
    }

    let mut summary = parts.join(" ");
    if summary.chars().count() > MAX_SUMMARY_CHARS {
        summary = summary.chars().take(MAX_SUMMARY_CHARS).collect();
        summary.push_str("...");
    }
    summary
}

/// Declaration keywords recognised at column zero, with the label kept in
/// the symbol (`"fn get_or_build"`).
const DECLARATIONS: &[(&str, &str)] = &[
    ("pub(crate) fn ", "fn"),
    ("pub async fn ", "fn"),
    ("pub fn ", "fn"),
    ("async fn ", "fn"),
    ("fn ", "fn"),
    ("pub struct ", "struct"),
    ("struct ", "struct"),
    ("pub enum ", "enum"),
    ("enum ", "enum"),
    ("pub trait ", "trait"),
    ("trait ", "trait"),
    ("pub mod ", "mod"),
    ("pub type ", "type"),
    ("async def ", "def"),
    ("def ", "def"),
    ("class ", "class"),
    ("export default function ", "function"),
    ("export async function ", "function"),
    ("export function ", "function"),
    ("async function ", "function"),
    ("function ", "function"),
    ("export class ", "class"),
    ("export interface ", "interface"),
    ("interface ", "interface"),
    ("export type ", "type"),
    ("func ", "func"),
];

fn extract_symbols(body: &str) -> Vec<String> {
    let mut symbols = Vec::new();
    for line in body.lines() {
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        for (prefix, label) in DECLARATIONS {
            if let Some(rest) = line.strip_prefix(prefix) {
                // Go methods: `func (r *T) Name(`
                let rest = if *label == "func" && rest.starts_with('(') {
                    rest.split_once(')').map(|(_, r)| r.trim_start()).unwrap_or(rest)
                } else {
                    rest
                };
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if !name.is_empty() {
                    symbols.push(format!("{} {}", label, name));
                }
                break;
            }
        }
    }
    symbols
}

fn extract_dependencies(body: &str) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        let dep = if let Some(rest) = line
            .strip_prefix("pub use ")
            .or_else(|| line.strip_prefix("use "))
        {
            rest.starts_with("crate::")
                .then(|| module_prefix(rest.trim_end_matches(';')))
        } else if let Some(rest) = line.strip_prefix("mod ") {
            let name = rest.trim_end_matches(';').trim();
            (!name.contains('{')).then(|| format!("self::{}", name))
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest.split_whitespace().next().map(|m| m.to_string())
        } else if let Some(rest) = line.strip_prefix("import ") {
            match quoted(rest) {
                Some(q) => Some(q),
                None => rest
                    .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
                    .next()
                    .filter(|m| !m.is_empty())
                    .map(|m| m.to_string()),
            }
        } else if line.starts_with("#include \"") {
            quoted(line)
        } else {
            None
        };

        if let Some(dep) = dep {
            let dep = dep.trim_start_matches("./").to_string();
            if !dep.is_empty() && !deps.contains(&dep) {
                deps.push(dep);
            }
        }
    }
    deps
}

/// `crate::cache::ValidityCache` → `crate::cache`.
fn module_prefix(path: &str) -> String {
    let segments: Vec<&str> = path
        .split("::")
        .take_while(|s| s.chars().all(|c| c.is_alphanumeric() || c == '_'))
        .collect();
    segments.iter().take(2).copied().collect::<Vec<_>>().join("::")
}

/// Contents of the last quoted string on the line.
fn quoted(line: &str) -> Option<String> {
    let quote = if line.contains('"') { '"' } else { '\'' };
    let end = line.rfind(quote)?;
    let start = line[..end].rfind(quote)?;
    Some(line[start + 1..end].to_string())
}

// ============ External command ============

/// Runs an external indexer that writes Indexer Output JSON to stdout.
pub struct CommandIndexer {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandIndexer {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            bail!("indexer command is empty");
        }
        Ok(Self { argv, timeout })
    }
}

#[async_trait]
impl Indexer for CommandIndexer {
    fn name(&self) -> &str {
        "command"
    }

    async fn index(&self, tree: &SourceTree) -> Result<IndexDocument> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.argv[0])
                .args(&self.argv[1..])
                .arg(tree.root())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("indexer timed out after {}s", self.timeout.as_secs()))?
        .with_context(|| format!("Failed to execute indexer: {}", self.argv[0]))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "indexer exited with status {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("indexer stdout is not UTF-8")?;
        Ok(parse_index_document(&stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_language_for() {
        assert_eq!(language_for("src/lib.rs"), "rust");
        assert_eq!(language_for("a/b.tsx"), "typescript");
        assert_eq!(language_for("Makefile"), "text");
    }

    #[test]
    fn test_summary_from_rust_doc_comment() {
        let body = "//! Validity cache.\n//! Persists records.\n\nuse std::fs;\n";
        assert_eq!(extract_summary(body), "Validity cache. Persists records.");
    }

    #[test]
    fn test_summary_from_python_docstring() {
        let body = "#!/usr/bin/env python\n\"\"\"Route tasks\nacross models.\"\"\"\nimport os\n";
        assert_eq!(extract_summary(body), "Route tasks across models.");
    }

    #[test]
    fn test_summary_empty_without_leading_comment() {
        assert_eq!(extract_summary("fn main() {}\n// late comment\n"), "");
    }

    #[test]
    fn test_symbols_top_level_only() {
        let body = "pub struct Cache;\nimpl Cache {\n    pub fn inner() {}\n}\npub async fn get_or_build() {}\nfunc (s *Server) Serve() {}\n";
        assert_eq!(
            extract_symbols(body),
            vec!["struct Cache", "fn get_or_build", "func Serve"]
        );
    }

    #[test]
    fn test_dependencies() {
        let body = "use crate::cache::ValidityCache;\nuse std::fs;\nmod router;\nfrom pkg.util import x\nimport { a } from './lib/a';\n#include \"util.h\"\n";
        assert_eq!(
            extract_dependencies(body),
            vec!["crate::cache", "self::router", "pkg.util", "lib/a", "util.h"]
        );
    }

    #[tokio::test]
    async fn test_builtin_indexes_tree() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(
            tmp.path().join("src/lib.rs"),
            "//! Library root.\npub mod cache;\npub fn run() {}\n",
        )
        .unwrap();
        fs::write(tmp.path().join("src/cache.rs"), "pub struct Cache;\n").unwrap();

        let tree = SourceTree::new(&Config::minimal(tmp.path()).cache).unwrap();
        let doc = BuiltinIndexer.index(&tree).await.unwrap();

        assert_eq!(doc.schema_version, SCHEMA_VERSION);
        let paths: Vec<&str> = doc.modules.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["src/cache.rs", "src/lib.rs"]);
        let lib = doc.module("src/lib.rs").unwrap();
        assert_eq!(lib.summary, "Library root.");
        assert_eq!(lib.line_count, 3);
        assert!(lib.symbols.contains(&"fn run".to_string()));
    }

    #[tokio::test]
    async fn test_command_indexer_rejects_unknown_schema() {
        let tmp = TempDir::new().unwrap();
        let tree = SourceTree::new(&Config::minimal(tmp.path()).cache).unwrap();
        let indexer = CommandIndexer::new(
            vec![
                "sh".into(),
                "-c".into(),
                r#"echo '{"schema_version": 99, "metadata": {}, "modules": []}'"#.into(),
            ],
            Duration::from_secs(10),
        )
        .unwrap();
        let err = indexer.index(&tree).await.unwrap_err();
        assert!(err.to_string().contains("schema_version 99"));
    }

    #[tokio::test]
    async fn test_command_indexer_failure_exit() {
        let tmp = TempDir::new().unwrap();
        let tree = SourceTree::new(&Config::minimal(tmp.path()).cache).unwrap();
        let indexer = CommandIndexer::new(
            vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()],
            Duration::from_secs(10),
        )
        .unwrap();
        let err = indexer.index(&tree).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
