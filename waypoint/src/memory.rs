//! Cross-session lesson memory.
//!
//! Lessons are advisory only: retrieval failures never block the loop, and
//! retrieved text is injected into prompts as a droppable section. Storage is
//! fire-and-forget so a slow or broken store cannot stall execution.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One recorded recovery lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub mission: String,
    pub task_description: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    /// What eventually worked, in one or two sentences.
    pub resolution: String,
    pub replan_count: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Pluggable lesson storage.
pub trait MemoryStore: Send + Sync {
    /// Lessons most relevant to `query`, best first.
    fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Lesson>>;
    fn store(&self, lesson: &Lesson) -> Result<()>;
}

/// Token-overlap similarity (Jaccard) over lowercased word sets.
pub fn similarity(a: &str, b: &str) -> f64 {
    let tokens_a: std::collections::BTreeSet<String> = tokenize(a);
    let tokens_b: std::collections::BTreeSet<String> = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

fn tokenize(text: &str) -> std::collections::BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Render retrieved lessons as a prompt block within `budget_bytes`.
///
/// Returns `None` when nothing fits; lessons are already ordered best first
/// so truncation drops the least relevant.
pub fn lessons_block(lessons: &[Lesson], budget_bytes: usize) -> Option<String> {
    let mut block = String::new();
    for lesson in lessons {
        let entry = format!(
            "- task: {} | tool: {} | worked: {}\n",
            lesson.task_description,
            lesson.tool_name.as_deref().unwrap_or("<none>"),
            lesson.resolution
        );
        if block.len() + entry.len() > budget_bytes {
            break;
        }
        block.push_str(&entry);
    }
    let block = block.trim_end().to_string();
    (!block.is_empty()).then_some(block)
}

/// Store a lesson on a detached thread. Failures are logged and dropped.
pub fn store_detached(store: std::sync::Arc<dyn MemoryStore>, lesson: Lesson) {
    std::thread::spawn(move || {
        if let Err(err) = store.store(&lesson) {
            warn!(err = %err, "failed to store lesson");
        }
    });
}

/// JSONL-backed store, one lesson per line.
pub struct JsonMemoryStore {
    path: PathBuf,
    // Appends are serialized so concurrent detached writers cannot interleave
    // partial lines.
    write_lock: Mutex<()>,
}

impl JsonMemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lessons(&self) -> Result<Vec<Lesson>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read lessons {}", self.path.display()))?;
        let mut lessons = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Lesson>(line) {
                Ok(lesson) => lessons.push(lesson),
                // Skip unreadable lines; a torn write must not poison recall.
                Err(err) => debug!(err = %err, "skipping unparseable lesson line"),
            }
        }
        Ok(lessons)
    }
}

impl MemoryStore for JsonMemoryStore {
    fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Lesson>> {
        let mut scored: Vec<(f64, Lesson)> = self
            .read_lessons()?
            .into_iter()
            .map(|lesson| {
                let text = format!("{} {}", lesson.task_description, lesson.mission);
                (similarity(query, &text), lesson)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, l)| l).collect())
    }

    fn store(&self, lesson: &Lesson) -> Result<()> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create lessons dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(lesson)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open lessons {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append lessons {}", self.path.display()))?;
        Ok(())
    }
}

/// A store that does nothing. Used when memory is disabled.
pub struct NullMemoryStore;

impl MemoryStore for NullMemoryStore {
    fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<Lesson>> {
        Ok(Vec::new())
    }

    fn store(&self, _lesson: &Lesson) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson(task: &str, resolution: &str) -> Lesson {
        Lesson {
            mission: "collect release metrics".to_string(),
            task_description: task.to_string(),
            tool_name: Some("http_get".to_string()),
            resolution: resolution.to_string(),
            replan_count: 1,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn similarity_rewards_shared_tokens() {
        let high = similarity("fetch the release index", "fetch release index page");
        let low = similarity("fetch the release index", "rotate database credentials");
        assert!(high > low);
        assert_eq!(similarity("", "anything"), 0.0);
    }

    #[test]
    fn retrieve_orders_by_relevance() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonMemoryStore::new(temp.path().join("lessons.jsonl"));
        store
            .store(&lesson("rotate database credentials", "used vault cli"))
            .expect("store");
        store
            .store(&lesson("fetch the release index", "retried with mirror url"))
            .expect("store");

        let results = store
            .retrieve("fetch release index from mirror", 5)
            .expect("retrieve");
        assert!(!results.is_empty());
        assert_eq!(results[0].task_description, "fetch the release index");
    }

    #[test]
    fn lessons_block_respects_budget() {
        let lessons = vec![
            lesson("fetch the release index", "retried with mirror url"),
            lesson("parse the entries", "switched to streaming parser"),
        ];
        let full = lessons_block(&lessons, 10_000).expect("block");
        assert!(full.contains("mirror url"));
        assert!(full.contains("streaming parser"));

        let tight = lessons_block(&lessons, 90).expect("block");
        assert!(tight.contains("mirror url"));
        assert!(!tight.contains("streaming parser"));

        assert!(lessons_block(&lessons, 4).is_none());
        assert!(lessons_block(&[], 10_000).is_none());
    }

    #[test]
    fn corrupt_lesson_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lessons.jsonl");
        let store = JsonMemoryStore::new(&path);
        store
            .store(&lesson("fetch the release index", "retried with mirror url"))
            .expect("store");
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).expect("open");
            writeln!(file, "{{torn line").expect("write");
        }
        let results = store.retrieve("fetch release index", 5).expect("retrieve");
        assert_eq!(results.len(), 1);
    }
}
