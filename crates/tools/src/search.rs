//! Search tools: `grep` (regex content search) and `find` (glob paths).
//!
//! Both honor the workspace's `.gitignore` and always skip `.git`.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

use wuhu_domain::tool::ToolResult;

use crate::fs::resolve;

const MAX_GREP_MATCHES: usize = 200;
const DEFAULT_FIND_LIMIT: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// .gitignore handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compile the root `.gitignore` into a glob set. Negation patterns are
/// not supported; a line like `target/` ignores the whole subtree.
fn load_gitignore(root: &Path) -> Option<GlobSet> {
    let raw = std::fs::read_to_string(root.join(".gitignore")).ok()?;
    let mut builder = GlobSetBuilder::new();
    let mut any = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let pattern = line.trim_end_matches('/');
        let expanded = if pattern.contains('/') {
            format!("{}/**", pattern.trim_start_matches('/'))
        } else {
            format!("**/{pattern}/**")
        };
        for p in [pattern.trim_start_matches('/').to_string(), expanded] {
            if let Ok(glob) = GlobBuilder::new(&p).literal_separator(false).build() {
                builder.add(glob);
                any = true;
            }
        }
    }
    if any {
        builder.build().ok()
    } else {
        None
    }
}

fn is_ignored(rel: &Path, gitignore: &Option<GlobSet>) -> bool {
    if rel.components().any(|c| c.as_os_str() == ".git") {
        return true;
    }
    gitignore.as_ref().is_some_and(|set| set.is_match(rel))
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(512).any(|b| *b == 0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// grep
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct GrepRequest {
    pub pattern: String,
    #[serde(default)]
    pub path: Option<String>,
    /// Glob filter on file names, e.g. `*.rs`.
    #[serde(default)]
    pub include: Option<String>,
}

pub async fn grep(cwd: &Path, req: GrepRequest) -> ToolResult {
    let regex = match Regex::new(&req.pattern) {
        Ok(r) => r,
        Err(e) => return ToolResult::error(format!("invalid regex: {e}")),
    };

    let root = req
        .path
        .as_deref()
        .map(|p| resolve(cwd, p))
        .unwrap_or_else(|| cwd.to_path_buf());

    let include = match &req.include {
        Some(glob) => match GlobBuilder::new(glob).literal_separator(false).build() {
            Ok(g) => Some(g.compile_matcher()),
            Err(e) => return ToolResult::error(format!("invalid include glob: {e}")),
        },
        None => None,
    };

    let gitignore = load_gitignore(&root);
    let mut matches: Vec<String> = Vec::new();
    let mut hit_cap = false;

    'walk: for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        if is_ignored(rel, &gitignore) {
            continue;
        }
        if let Some(include) = &include {
            let name = entry.file_name().to_string_lossy();
            if !include.is_match(name.as_ref()) {
                continue;
            }
        }

        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if looks_binary(&bytes) {
            continue;
        }
        let content = String::from_utf8_lossy(&bytes);

        for (line_no, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{}:{}:{}", rel.display(), line_no + 1, line));
                if matches.len() >= MAX_GREP_MATCHES {
                    hit_cap = true;
                    break 'walk;
                }
            }
        }
    }

    if matches.is_empty() {
        return ToolResult::text("No matches found");
    }
    let mut text = matches.join("\n");
    if hit_cap {
        text.push_str(&format!("\n[capped at {MAX_GREP_MATCHES} matches]"));
    }
    ToolResult::text(text).with_details(serde_json::json!({
        "matches": matches.len(),
        "capped": hit_cap,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// find
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct FindRequest {
    /// Glob matched against workspace-relative paths, e.g. `src/**/*.rs`.
    pub pattern: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn find(cwd: &Path, req: FindRequest) -> ToolResult {
    let root = req
        .path
        .as_deref()
        .map(|p| resolve(cwd, p))
        .unwrap_or_else(|| cwd.to_path_buf());

    let matcher = match GlobBuilder::new(&req.pattern)
        .literal_separator(true)
        .build()
    {
        Ok(g) => g.compile_matcher(),
        Err(e) => return ToolResult::error(format!("invalid glob: {e}")),
    };

    let limit = req.limit.unwrap_or(DEFAULT_FIND_LIMIT);
    let gitignore = load_gitignore(&root);
    let mut found: Vec<PathBuf> = Vec::new();

    for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        if is_ignored(rel, &gitignore) {
            continue;
        }
        if matcher.is_match(rel) {
            found.push(rel.to_path_buf());
            if found.len() >= limit {
                break;
            }
        }
    }

    found.sort();
    if found.is_empty() {
        return ToolResult::text("No files matched");
    }
    let listing = found
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    ToolResult::text(listing).with_details(serde_json::json!({ "count": found.len() }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ws() -> TempDir {
        let ws = TempDir::new().unwrap();
        std::fs::create_dir_all(ws.path().join("src")).unwrap();
        std::fs::create_dir_all(ws.path().join("target/debug")).unwrap();
        std::fs::write(ws.path().join("src/main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        std::fs::write(ws.path().join("src/lib.rs"), "pub fn run() {}\n").unwrap();
        std::fs::write(ws.path().join("target/debug/junk.rs"), "fn run() {}\n").unwrap();
        std::fs::write(ws.path().join(".gitignore"), "target/\n").unwrap();
        ws
    }

    #[tokio::test]
    async fn grep_matches_with_line_numbers() {
        let ws = ws();
        let result = grep(
            ws.path(),
            GrepRequest {
                pattern: r"fn \w+".into(),
                path: None,
                include: None,
            },
        )
        .await;
        let text = result.joined_text();
        assert!(text.contains("src/main.rs:1:fn main() {"));
        assert!(text.contains("src/lib.rs:1:pub fn run() {}"));
    }

    #[tokio::test]
    async fn grep_honors_gitignore() {
        let ws = ws();
        let result = grep(
            ws.path(),
            GrepRequest {
                pattern: "run".into(),
                path: None,
                include: None,
            },
        )
        .await;
        assert!(!result.joined_text().contains("target/debug/junk.rs"));
    }

    #[tokio::test]
    async fn grep_include_filters_by_name() {
        let ws = ws();
        std::fs::write(ws.path().join("notes.md"), "run the tests\n").unwrap();
        let result = grep(
            ws.path(),
            GrepRequest {
                pattern: "run".into(),
                path: None,
                include: Some("*.md".into()),
            },
        )
        .await;
        let text = result.joined_text();
        assert!(text.contains("notes.md"));
        assert!(!text.contains("main.rs"));
    }

    #[tokio::test]
    async fn grep_invalid_regex_is_error() {
        let ws = ws();
        let result = grep(
            ws.path(),
            GrepRequest {
                pattern: "(unclosed".into(),
                path: None,
                include: None,
            },
        )
        .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn find_globs_relative_paths() {
        let ws = ws();
        let result = find(
            ws.path(),
            FindRequest {
                pattern: "src/*.rs".into(),
                path: None,
                limit: None,
            },
        )
        .await;
        assert_eq!(result.joined_text(), "src/lib.rs\nsrc/main.rs");
    }

    #[tokio::test]
    async fn find_honors_gitignore_and_limit() {
        let ws = ws();
        let result = find(
            ws.path(),
            FindRequest {
                pattern: "**/*.rs".into(),
                path: None,
                limit: Some(1),
            },
        )
        .await;
        let text = result.joined_text();
        assert!(!text.contains("target"));
        assert_eq!(text.lines().count(), 1);
    }
}
