//! Session history directory
//!
//! Consumes batches from the global history feed and reconciles them into
//! the authoritative "most recent sighting per session" map. The feed is
//! append-only and may deliver duplicates or out-of-order entries; the
//! directory converges regardless via last-write-wins on the entry
//! timestamp. Derived views are pure recomputations over a snapshot.
//!
//! The directory does not manage the subscription lifecycle: the caller
//! opens the feed at startup, keeps it open across transport errors, and
//! cancels it at teardown.

use std::collections::HashMap;
use tracing::debug;

use streams_core::{leaf_folder, HistoryEntry, SessionRecord};

/// Number of sessions the recent listing is truncated to by default.
pub const DEFAULT_RECENT_LIMIT: usize = 100;

/// Sessions grouped by project leaf-folder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectGroup {
    pub name: String,
    pub count: usize,
}

/// The authoritative session map. Monotonically growing; records are
/// upserted, never deleted.
#[derive(Debug, Default)]
pub struct HistoryDirectory {
    sessions: HashMap<String, SessionRecord>,
}

impl HistoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one delivered batch, in order. Entries without a session id
    /// (heartbeats, malformed records) are skipped. An entry replaces the
    /// stored record only when its timestamp is strictly greater; an equal
    /// or lesser timestamp is ignored even if the entry arrived later, so
    /// re-ingesting an already-seen batch is a no-op.
    ///
    /// Returns the number of records inserted or replaced.
    pub fn ingest(&mut self, entries: &[HistoryEntry]) -> usize {
        let mut updated = 0;
        for entry in entries {
            let Some(session_id) = entry.session_id.as_deref() else {
                debug!("Skipping history entry without session id");
                continue;
            };

            match self.sessions.get(session_id) {
                Some(existing) if entry.timestamp <= existing.timestamp => {}
                _ => {
                    self.sessions.insert(
                        session_id.to_string(),
                        SessionRecord {
                            session_id: session_id.to_string(),
                            display: entry.display.clone(),
                            timestamp: entry.timestamp,
                            project: entry.project.clone(),
                        },
                    );
                    updated += 1;
                }
            }
        }
        updated
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionRecord> {
        self.sessions.get(session_id)
    }

    /// All sessions sorted by timestamp descending, truncated to `limit`.
    pub fn recent_sessions(&self, limit: usize) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions.truncate(limit);
        sessions
    }

    /// Session counts per project leaf folder over the recent slice, sorted
    /// by count descending then name ascending.
    pub fn project_groups(&self, limit: usize) -> Vec<ProjectGroup> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for session in self.recent_sessions(limit) {
            *counts.entry(session.project_leaf().to_string()).or_insert(0) += 1;
        }

        let mut groups: Vec<ProjectGroup> = counts
            .into_iter()
            .map(|(name, count)| ProjectGroup { name, count })
            .collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        groups
    }

    /// The recent slice narrowed by project filter and search query.
    ///
    /// A session passes when its leaf folder is in `project_filter` (an
    /// empty filter matches everything) and, if `query` is non-empty, the
    /// query case-insensitively matches its display text, project path, or
    /// session id.
    pub fn filtered(
        &self,
        query: &str,
        project_filter: &[String],
        limit: usize,
    ) -> Vec<SessionRecord> {
        let query = query.trim().to_lowercase();
        self.recent_sessions(limit)
            .into_iter()
            .filter(|session| {
                let matches_project = project_filter.is_empty()
                    || project_filter.iter().any(|p| p == session.project_leaf());
                if !matches_project {
                    return false;
                }

                if query.is_empty() {
                    return true;
                }
                session.display.to_lowercase().contains(&query)
                    || session
                        .project
                        .as_deref()
                        .is_some_and(|p| p.to_lowercase().contains(&query))
                    || session.session_id.to_lowercase().contains(&query)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, display: &str, ts: i64, project: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            session_id: Some(id.to_string()),
            display: display.to_string(),
            timestamp: ts,
            project: project.map(String::from),
        }
    }

    fn heartbeat() -> HistoryEntry {
        HistoryEntry {
            session_id: None,
            display: String::new(),
            timestamp: 0,
            project: None,
        }
    }

    #[test]
    fn ingest_skips_entries_without_session_id() {
        let mut dir = HistoryDirectory::new();
        let updated = dir.ingest(&[heartbeat(), entry("a", "one", 10, None)]);
        assert_eq!(updated, 1);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn last_write_wins_by_timestamp_not_arrival_order() {
        let e_old = entry("a", "old", 10, None);
        let e_new = entry("a", "new", 20, None);

        let mut forward = HistoryDirectory::new();
        forward.ingest(&[e_old.clone(), e_new.clone()]);

        let mut reverse = HistoryDirectory::new();
        reverse.ingest(&[e_new.clone(), e_old.clone()]);

        for dir in [&forward, &reverse] {
            let record = dir.get("a").unwrap();
            assert_eq!(record.display, "new");
            assert_eq!(record.timestamp, 20);
        }
    }

    #[test]
    fn equal_timestamp_is_ignored() {
        let mut dir = HistoryDirectory::new();
        dir.ingest(&[entry("a", "first", 10, None)]);
        let updated = dir.ingest(&[entry("a", "tied-later-arrival", 10, None)]);
        assert_eq!(updated, 0);
        assert_eq!(dir.get("a").unwrap().display, "first");
    }

    #[test]
    fn reingestion_is_idempotent() {
        let batch = vec![
            entry("a", "one", 10, Some("/w/alpha")),
            entry("b", "two", 20, Some("/w/beta")),
        ];
        let mut dir = HistoryDirectory::new();
        dir.ingest(&batch);
        let first = dir.recent_sessions(DEFAULT_RECENT_LIMIT);

        let updated = dir.ingest(&batch);
        assert_eq!(updated, 0);
        assert_eq!(dir.recent_sessions(DEFAULT_RECENT_LIMIT), first);
    }

    #[test]
    fn recent_sessions_sorted_desc_and_truncated() {
        let mut dir = HistoryDirectory::new();
        dir.ingest(&[
            entry("a", "oldest", 1, None),
            entry("b", "newest", 3, None),
            entry("c", "middle", 2, None),
        ]);

        let recent = dir.recent_sessions(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "b");
        assert_eq!(recent[1].session_id, "c");
    }

    #[test]
    fn project_groups_count_desc_then_name_asc() {
        let mut dir = HistoryDirectory::new();
        dir.ingest(&[
            entry("a", "one", 1, Some("/w/beta")),
            entry("b", "two", 2, Some("/w/alpha")),
            entry("c", "three", 3, Some("/w/beta")),
            entry("d", "four", 4, None),
        ]);

        let groups = dir.project_groups(DEFAULT_RECENT_LIMIT);
        assert_eq!(
            groups,
            vec![
                ProjectGroup { name: "beta".into(), count: 2 },
                ProjectGroup { name: "alpha".into(), count: 1 },
                ProjectGroup { name: "unknown".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn filtered_by_project_and_query() {
        let mut dir = HistoryDirectory::new();
        dir.ingest(&[
            entry("s1", "Fix the parser", 1, Some("/w/alpha")),
            entry("s2", "Write docs", 2, Some("/w/beta")),
            entry("s3", "Parser cleanup", 3, None),
        ]);

        let all = dir.filtered("", &[], DEFAULT_RECENT_LIMIT);
        assert_eq!(all.len(), 3);

        let alpha_only = dir.filtered("", &["alpha".to_string()], DEFAULT_RECENT_LIMIT);
        assert_eq!(alpha_only.len(), 1);
        assert_eq!(alpha_only[0].session_id, "s1");

        let unknown = dir.filtered("", &["unknown".to_string()], DEFAULT_RECENT_LIMIT);
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].session_id, "s3");

        let parser = dir.filtered("PARSER", &[], DEFAULT_RECENT_LIMIT);
        assert_eq!(parser.len(), 2);

        let by_id = dir.filtered("s2", &[], DEFAULT_RECENT_LIMIT);
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].session_id, "s2");

        let by_project_path = dir.filtered("/w/beta", &[], DEFAULT_RECENT_LIMIT);
        assert_eq!(by_project_path.len(), 1);
    }
}
