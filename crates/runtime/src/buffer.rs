//! Uncommitted changes accumulated since the last checkpoint.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypoint_exec::LineDelta;
use waypoint_llm::CategoryCounts;

use crate::classifier::ChangeCategory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub category: ChangeCategory,
    /// Current content hash; `None` once the path has been deleted.
    pub content_hash: Option<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn is_deletion(&self) -> bool {
        self.content_hash.is_none()
    }

    pub fn lines_changed(&self) -> u64 {
        self.lines_added + self.lines_removed
    }
}

/// What [`ChangeBuffer::observe`] did with an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Inserted,
    Updated,
    /// The path is back at its committed content; its record was dropped.
    Reverted,
    /// Nothing to record (e.g. an unseen path that already matches).
    Unchanged,
}

/// Ordered, path-unique collection of [`ChangeRecord`]s.
///
/// Records keep the order in which their paths were first observed.
#[derive(Debug, Clone, Default)]
pub struct ChangeBuffer {
    records: Vec<ChangeRecord>,
    index: HashMap<String, usize>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current state of `path`.
    ///
    /// `baseline` is the snapshot hash of the path (`None` when the path was
    /// not part of the last checkpoint).  When `hash` equals the baseline the
    /// path has returned to its committed content and is dropped.
    pub fn observe(
        &mut self,
        path: &str,
        category: ChangeCategory,
        hash: Option<String>,
        baseline: Option<&str>,
        now: DateTime<Utc>,
    ) -> Observation {
        if hash.as_deref() == baseline {
            return if self.remove(path) {
                Observation::Reverted
            } else {
                Observation::Unchanged
            };
        }

        match self.index.get(path) {
            Some(&position) => {
                let record = &mut self.records[position];
                record.category = category;
                record.content_hash = hash;
                record.last_seen_at = now;
                Observation::Updated
            }
            None => {
                self.index.insert(path.to_string(), self.records.len());
                self.records.push(ChangeRecord {
                    path: path.to_string(),
                    category,
                    content_hash: hash,
                    lines_added: 0,
                    lines_removed: 0,
                    first_seen_at: now,
                    last_seen_at: now,
                });
                Observation::Inserted
            }
        }
    }

    /// Replace the line statistics of a buffered path.  Statistics are
    /// measured against the last commit, so they are set, not accumulated.
    pub fn set_line_stats(&mut self, path: &str, delta: LineDelta) {
        if let Some(&position) = self.index.get(path) {
            let record = &mut self.records[position];
            record.lines_added = delta.added;
            record.lines_removed = delta.removed;
        }
    }

    pub fn get(&self, path: &str) -> Option<&ChangeRecord> {
        self.index.get(path).map(|&position| &self.records[position])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter()
    }

    pub fn paths(&self) -> Vec<String> {
        self.records.iter().map(|r| r.path.clone()).collect()
    }

    pub fn count(&self, category: ChangeCategory) -> usize {
        self.records.iter().filter(|r| r.category == category).count()
    }

    pub fn counts(&self) -> CategoryCounts {
        let mut counts = CategoryCounts::default();
        for record in &self.records {
            let slot = match record.category {
                ChangeCategory::Source => &mut counts.source,
                ChangeCategory::Test => &mut counts.test,
                ChangeCategory::Config => &mut counts.config,
                ChangeCategory::Doc => &mut counts.doc,
                ChangeCategory::Critical => &mut counts.critical,
                ChangeCategory::Other => &mut counts.other,
            };
            *slot += 1;
        }
        counts
    }

    pub fn total_lines(&self) -> u64 {
        self.records.iter().map(ChangeRecord::lines_changed).sum()
    }

    pub fn paths_in(&self, category: ChangeCategory) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.category == category)
            .map(|r| r.path.clone())
            .collect()
    }

    /// Drop every record whose content is covered by a checkpoint.  A record
    /// whose hash moved on after the commit captured it stays buffered.
    pub fn clear_committed<'a>(
        &mut self,
        committed: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
    ) -> usize {
        let covered: HashMap<&str, Option<&str>> = committed.into_iter().collect();
        let before = self.records.len();
        self.records.retain(|record| match covered.get(record.path.as_str()) {
            Some(hash) => record.content_hash.as_deref() != *hash,
            None => true,
        });
        self.reindex();
        before - self.records.len()
    }

    /// Content identity of the whole buffer, sorted by path.
    pub fn fingerprint(&self) -> Vec<(String, Option<String>)> {
        let mut pairs: Vec<_> = self
            .records
            .iter()
            .map(|r| (r.path.clone(), r.content_hash.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    /// Forget `path` entirely.
    pub fn remove(&mut self, path: &str) -> bool {
        let Some(position) = self.index.remove(path) else {
            return false;
        };
        self.records.remove(position);
        self.reindex();
        true
    }

    fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(position, record)| (record.path.clone(), position))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn one_record_per_path_in_first_seen_order() {
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        buffer.observe("b.rs", ChangeCategory::Source, h("1"), Some("0"), now);
        buffer.observe("a.rs", ChangeCategory::Source, h("2"), None, now);
        let later = now + chrono::Duration::seconds(10);
        assert_eq!(
            buffer.observe("b.rs", ChangeCategory::Source, h("3"), Some("0"), later),
            Observation::Updated
        );

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.paths(), vec!["b.rs", "a.rs"]);
        let b = buffer.get("b.rs").unwrap();
        assert_eq!(b.content_hash.as_deref(), Some("3"));
        assert_eq!(b.first_seen_at, now);
        assert_eq!(b.last_seen_at, later);
    }

    #[test]
    fn fingerprint_tracks_content_not_order() {
        let now = Utc::now();
        let mut first = ChangeBuffer::new();
        first.observe("b.rs", ChangeCategory::Source, h("1"), None, now);
        first.observe("a.rs", ChangeCategory::Source, h("2"), None, now);
        let mut second = ChangeBuffer::new();
        second.observe("a.rs", ChangeCategory::Source, h("2"), None, now);
        second.observe("b.rs", ChangeCategory::Source, h("1"), None, now);
        assert_eq!(first.fingerprint(), second.fingerprint());

        second.observe("b.rs", ChangeCategory::Source, h("3"), None, now);
        assert_ne!(first.fingerprint(), second.fingerprint());

        assert!(first.remove("a.rs"));
        assert!(!first.remove("a.rs"));
        assert_eq!(first.paths(), vec!["b.rs"]);
    }

    #[test]
    fn reverting_to_baseline_drops_the_record() {
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        buffer.observe("a.rs", ChangeCategory::Source, h("new"), Some("old"), now);
        buffer.observe("b.rs", ChangeCategory::Source, h("x"), Some("y"), now);
        assert_eq!(
            buffer.observe("a.rs", ChangeCategory::Source, h("old"), Some("old"), now),
            Observation::Reverted
        );
        assert_eq!(buffer.paths(), vec!["b.rs"]);
        assert!(buffer.get("b.rs").is_some());
    }

    #[test]
    fn created_then_deleted_file_disappears() {
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        buffer.observe("scratch.txt", ChangeCategory::Doc, h("1"), None, now);
        assert_eq!(
            buffer.observe("scratch.txt", ChangeCategory::Doc, None, None, now),
            Observation::Reverted
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn deletion_of_committed_file_is_recorded() {
        let mut buffer = ChangeBuffer::new();
        buffer.observe("old.rs", ChangeCategory::Source, None, Some("abc"), Utc::now());
        assert!(buffer.get("old.rs").unwrap().is_deletion());
    }

    #[test]
    fn counts_and_lines() {
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        buffer.observe("src/a.rs", ChangeCategory::Source, h("1"), None, now);
        buffer.observe("tests/a.rs", ChangeCategory::Test, h("2"), None, now);
        buffer.observe("tests/b.rs", ChangeCategory::Test, h("3"), None, now);
        buffer.set_line_stats("src/a.rs", LineDelta { added: 10, removed: 2 });
        buffer.set_line_stats("tests/a.rs", LineDelta { added: 5, removed: 0 });
        // Stats are replaced, not accumulated.
        buffer.set_line_stats("tests/a.rs", LineDelta { added: 7, removed: 1 });

        let counts = buffer.counts();
        assert_eq!(counts.source, 1);
        assert_eq!(counts.test, 2);
        assert_eq!(counts.total(), 3);
        assert_eq!(buffer.total_lines(), 20);
        assert_eq!(buffer.paths_in(ChangeCategory::Test), vec!["tests/a.rs", "tests/b.rs"]);
    }

    #[test]
    fn clear_committed_keeps_records_that_moved_on() {
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        buffer.observe("a.rs", ChangeCategory::Source, h("a1"), None, now);
        buffer.observe("b.rs", ChangeCategory::Source, h("b2"), None, now);
        buffer.observe("c.rs", ChangeCategory::Source, None, Some("c0"), now);
        buffer.observe("d.rs", ChangeCategory::Source, h("d1"), None, now);

        // b.rs was edited again after the commit captured "b1".
        let removed = buffer.clear_committed([("a.rs", Some("a1")), ("b.rs", Some("b1")), ("c.rs", None)]);
        assert_eq!(removed, 2);
        assert_eq!(buffer.paths(), vec!["b.rs", "d.rs"]);
        assert!(buffer.contains("d.rs"));
        assert!(!buffer.contains("a.rs"));
    }
}
