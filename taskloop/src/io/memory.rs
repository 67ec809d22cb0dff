//! Project memory lookups for prompts.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// A snippet of remembered project knowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryExcerpt {
    /// Where the excerpt came from (file name, note id).
    pub source: String,
    pub text: String,
    /// Higher is more relevant.
    pub score: f64,
}

/// Source of relevant excerpts. Lookups are time-bounded by the caller.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryExcerpt>>;
}

/// Markdown notes in a directory, split into paragraphs and scored by keyword
/// overlap with the query.
#[derive(Debug, Clone)]
pub struct NotesMemoryStore {
    dir: PathBuf,
}

impl NotesMemoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryExcerpt>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let terms = keywords(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("read {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
            .collect();
        entries.sort();

        let mut out = Vec::new();
        for path in entries {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read note {}", path.display()))?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            for paragraph in contents.split("\n\n") {
                let paragraph = paragraph.trim();
                if paragraph.is_empty() {
                    continue;
                }
                let words = keywords(paragraph);
                let hits = terms.intersection(&words).count();
                if hits == 0 {
                    continue;
                }
                out.push(MemoryExcerpt {
                    source: source.clone(),
                    text: paragraph.to_string(),
                    score: hits as f64 / terms.len() as f64,
                });
            }
        }
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out.truncate(limit);
        debug!(found = out.len(), "memory recall");
        Ok(out)
    }
}

#[async_trait]
impl MemoryStore for NotesMemoryStore {
    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryExcerpt>> {
        let store = self.clone();
        let query = query.to_string();
        crate::io::blocking(move || store.search(&query, limit)).await
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ranks_paragraphs_by_overlap() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("notes.md"),
            "The parser handles fenced code.\n\nRetry logic uses exponential backoff for the parser cache.\n\nUnrelated gardening tips.\n",
        )
        .expect("write");
        fs::write(temp.path().join("ignored.txt"), "parser parser").expect("write");

        let store = NotesMemoryStore::new(temp.path());
        let found = store
            .recall("fix parser cache retry", 5)
            .await
            .expect("recall");
        assert_eq!(found.len(), 2);
        assert!(found[0].text.starts_with("Retry logic"));
        assert!(found[0].score > found[1].score);
        assert_eq!(found[0].source, "notes.md");
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let store = NotesMemoryStore::new("/nonexistent/taskloop-notes");
        assert!(store.recall("anything", 3).await.expect("recall").is_empty());
    }
}
