//! Gathers context files from a directory tree. `.gitignore` handling is
//! intentionally out of scope here — this only does extension/size
//! filtering, skipping hidden directories the way [`ignore::WalkBuilder`]
//! does by default.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

const DEFAULT_MAX_FILE_BYTES: u64 = 1_000_000;
const DEFAULT_EXTENSIONS: &[&str] = &[
    "rs", "toml", "md", "txt", "json", "yaml", "yml", "py", "js", "ts", "go", "java", "c", "h",
    "cpp", "hpp",
];

#[derive(Debug, Clone)]
pub struct GatheredContext {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextStats {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Walks `root`, reading every UTF-8 file under `max_file_bytes` whose
/// extension is in `extensions`. Files that fail to decode as UTF-8 or
/// fail to read are skipped rather than failing the whole gather — a
/// single unreadable file in the tree shouldn't abort the run.
pub async fn gather(root: &Path, max_file_bytes: Option<u64>) -> (Vec<GatheredContext>, ContextStats) {
    let max_bytes = max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES);

    let walker = WalkBuilder::new(root).hidden(true).git_ignore(false).build();

    let mut paths = Vec::new();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| DEFAULT_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !matches_ext {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if meta.len() > max_bytes {
                continue;
            }
        }
        paths.push(path.to_path_buf());
    }
    paths.sort();

    let mut gathered = Vec::with_capacity(paths.len());
    let mut stats = ContextStats::default();
    for path in paths {
        match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => {
                    stats.file_count += 1;
                    stats.total_bytes += content.len() as u64;
                    gathered.push(GatheredContext { path, content });
                }
                Err(_) => continue,
            },
            Err(_) => continue,
        }
    }

    (gathered, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn gathers_matching_extensions_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("b.png"), [0u8, 1, 2]).unwrap();
        fs::write(dir.path().join("c.md"), "# notes").unwrap();

        let (files, stats) = gather(dir.path(), None).await;
        assert_eq!(stats.file_count, 2);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.path.extension().unwrap() != "png"));
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.rs"), "x".repeat(100)).unwrap();

        let (files, stats) = gather(dir.path(), Some(10)).await;
        assert!(files.is_empty());
        assert_eq!(stats.file_count, 0);
    }

    #[tokio::test]
    async fn empty_directory_yields_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let (files, stats) = gather(dir.path(), None).await;
        assert!(files.is_empty());
        assert_eq!(stats.file_count, 0);
        assert_eq!(stats.total_bytes, 0);
    }
}
