//! File operation tools: `read`, `write`, `edit`, `ls`.
//!
//! Paths are resolved against the session's working directory; absolute
//! paths are accepted as-is (sessions own their environment).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs;

use wuhu_domain::tool::ToolResult;

/// Reads larger than this are truncated.
pub const MAX_READ_BYTES: usize = 256 * 1024;

pub(crate) fn resolve(cwd: &Path, requested: &str) -> PathBuf {
    let path = Path::new(requested);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ReadRequest {
    pub path: String,
    /// 1-indexed inclusive `[start, end]`.
    #[serde(default)]
    pub line_range: Option<(usize, usize)>,
}

pub async fn read(cwd: &Path, req: ReadRequest) -> ToolResult {
    let path = resolve(cwd, &req.path);
    let bytes = match fs::read(&path).await {
        Ok(b) => b,
        Err(e) => return ToolResult::error(format!("cannot read '{}': {e}", req.path)),
    };

    let truncated = bytes.len() > MAX_READ_BYTES;
    let slice = if truncated {
        &bytes[..MAX_READ_BYTES]
    } else {
        &bytes[..]
    };
    let content = String::from_utf8_lossy(slice);

    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();
    let (start, end) = match req.line_range {
        Some((start, end)) => {
            let start = start.max(1);
            let end = end.min(total_lines);
            if start > total_lines || end < start {
                return ToolResult::error(format!(
                    "line range is out of bounds for '{}' ({total_lines} lines)",
                    req.path
                ));
            }
            (start, end)
        }
        None => (1, total_lines),
    };

    let mut numbered = String::new();
    if total_lines > 0 {
        for (idx, line) in lines[start - 1..end].iter().enumerate() {
            numbered.push_str(&format!("{:>6}\t{}\n", start + idx, line));
        }
    }
    if truncated {
        numbered.push_str(&format!(
            "[truncated: file is {} bytes, showing first {}]\n",
            bytes.len(),
            MAX_READ_BYTES
        ));
    }

    ToolResult::text(numbered).with_details(serde_json::json!({
        "path": req.path,
        "total_lines": total_lines,
        "truncated": truncated,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// write
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    pub path: String,
    pub content: String,
}

pub async fn write(cwd: &Path, req: WriteRequest) -> ToolResult {
    let path = resolve(cwd, &req.path);

    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            return ToolResult::error(format!("cannot create parent directory: {e}"));
        }
    }

    match fs::write(&path, req.content.as_bytes()).await {
        Ok(()) => ToolResult::text(format!(
            "Wrote {} bytes to {}",
            req.content.len(),
            req.path
        ))
        .with_details(serde_json::json!({
            "path": req.path,
            "bytes_written": req.content.len(),
        })),
        Err(e) => ToolResult::error(format!("cannot write '{}': {e}", req.path)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// edit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct EditRequest {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

pub async fn edit(cwd: &Path, req: EditRequest) -> ToolResult {
    let path = resolve(cwd, &req.path);
    let content = match fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("cannot read '{}': {e}", req.path)),
    };

    let occurrences = content.matches(&req.old_string).count();
    if occurrences == 0 {
        return ToolResult::error(format!("old_string not found in '{}'", req.path));
    }
    if occurrences > 1 && !req.replace_all {
        return ToolResult::error(format!(
            "old_string occurs {occurrences} times in '{}'; pass replace_all or make it unique",
            req.path
        ));
    }

    let updated = if req.replace_all {
        content.replace(&req.old_string, &req.new_string)
    } else {
        content.replacen(&req.old_string, &req.new_string, 1)
    };

    match fs::write(&path, updated.as_bytes()).await {
        Ok(()) => {
            let replaced = if req.replace_all { occurrences } else { 1 };
            ToolResult::text(format!(
                "Replaced {replaced} occurrence(s) in {}",
                req.path
            ))
            .with_details(serde_json::json!({
                "path": req.path,
                "replacements": replaced,
            }))
        }
        Err(e) => ToolResult::error(format!("cannot write '{}': {e}", req.path)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct LsRequest {
    #[serde(default = "default_dot")]
    pub path: String,
}

fn default_dot() -> String {
    ".".into()
}

pub async fn ls(cwd: &Path, req: LsRequest) -> ToolResult {
    let path = resolve(cwd, &req.path);
    let mut read_dir = match fs::read_dir(&path).await {
        Ok(rd) => rd,
        Err(e) => return ToolResult::error(format!("cannot list '{}': {e}", req.path)),
    };

    let mut entries: Vec<String> = Vec::new();
    loop {
        match read_dir.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().to_string();
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                entries.push(if is_dir { format!("{name}/") } else { name });
            }
            Ok(None) => break,
            Err(e) => return ToolResult::error(format!("cannot list '{}': {e}", req.path)),
        }
    }

    entries.sort();
    ToolResult::text(entries.join("\n")).with_details(serde_json::json!({
        "path": req.path,
        "count": entries.len(),
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ws() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    #[tokio::test]
    async fn read_returns_numbered_lines() {
        let ws = ws();
        std::fs::write(ws.path().join("f.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let result = read(
            ws.path(),
            ReadRequest {
                path: "f.txt".into(),
                line_range: None,
            },
        )
        .await;
        assert!(!result.is_error);
        let text = result.joined_text();
        assert!(text.contains("     1\talpha"));
        assert!(text.contains("     3\tgamma"));
    }

    #[tokio::test]
    async fn read_line_range_is_inclusive() {
        let ws = ws();
        std::fs::write(ws.path().join("f.txt"), "a\nb\nc\nd\n").unwrap();
        let result = read(
            ws.path(),
            ReadRequest {
                path: "f.txt".into(),
                line_range: Some((2, 3)),
            },
        )
        .await;
        let text = result.joined_text();
        assert!(text.contains("     2\tb"));
        assert!(text.contains("     3\tc"));
        assert!(!text.contains("\ta"));
        assert!(!text.contains("\td"));
    }

    #[tokio::test]
    async fn read_missing_file_is_error() {
        let ws = ws();
        let result = read(
            ws.path(),
            ReadRequest {
                path: "ghost.txt".into(),
                line_range: None,
            },
        )
        .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn write_creates_intermediate_directories() {
        let ws = ws();
        let result = write(
            ws.path(),
            WriteRequest {
                path: "a/b/c.txt".into(),
                content: "nested".into(),
            },
        )
        .await;
        assert!(!result.is_error);
        assert_eq!(
            std::fs::read_to_string(ws.path().join("a/b/c.txt")).unwrap(),
            "nested"
        );
    }

    #[tokio::test]
    async fn edit_requires_unique_match() {
        let ws = ws();
        std::fs::write(ws.path().join("f.txt"), "x = 1\nx = 1\n").unwrap();

        let ambiguous = edit(
            ws.path(),
            EditRequest {
                path: "f.txt".into(),
                old_string: "x = 1".into(),
                new_string: "x = 2".into(),
                replace_all: false,
            },
        )
        .await;
        assert!(ambiguous.is_error);

        let all = edit(
            ws.path(),
            EditRequest {
                path: "f.txt".into(),
                old_string: "x = 1".into(),
                new_string: "x = 2".into(),
                replace_all: true,
            },
        )
        .await;
        assert!(!all.is_error);
        assert_eq!(
            std::fs::read_to_string(ws.path().join("f.txt")).unwrap(),
            "x = 2\nx = 2\n"
        );
    }

    #[tokio::test]
    async fn edit_missing_old_string_is_error() {
        let ws = ws();
        std::fs::write(ws.path().join("f.txt"), "hello").unwrap();
        let result = edit(
            ws.path(),
            EditRequest {
                path: "f.txt".into(),
                old_string: "absent".into(),
                new_string: "x".into(),
                replace_all: false,
            },
        )
        .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn ls_marks_directories() {
        let ws = ws();
        std::fs::write(ws.path().join("file.txt"), "x").unwrap();
        std::fs::create_dir(ws.path().join("sub")).unwrap();
        let result = ls(
            ws.path(),
            LsRequest { path: ".".into() },
        )
        .await;
        let text = result.joined_text();
        assert_eq!(text, "file.txt\nsub/");
    }
}
