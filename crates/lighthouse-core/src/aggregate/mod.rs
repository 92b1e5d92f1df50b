//! Project aggregate: the shadow filesystem derived from the log.
//!
//! Folds `file.written`, `annotation.added`, `snapshot.created`, and
//! `pair.suggestion` events into a current-state view: path → latest content
//! hash, per-path ordered annotations, named snapshots, and per-pair
//! suggestion lists. The fold is idempotent per event (replaying an applied
//! sequence is a no-op), so duplicate delivery across subscriber reconnects
//! is harmless.
//!
//! Time travel ("state at sequence S") folds events with sequence ≤ S,
//! starting from the nearest checkpoint at or below S. Checkpoints are
//! caches: deleting them changes nothing but replay cost.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AggregateError, StoreError};
use crate::event::{Event, EventPayload};
use crate::store::EventStore;

/// Fold a checkpoint every this many applied events.
const CHECKPOINT_INTERVAL: u64 = 128;

/// Latest known state of one shadow path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub content_hash: String,
    pub size_bytes: u64,
    pub latest_sequence: u64,
}

/// A line-anchored annotation on a shadow path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub line: u32,
    pub category: String,
    pub message: String,
    pub author: String,
    pub sequence: u64,
}

/// A suggestion attached to a pair session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSuggestionRef {
    pub line: u32,
    pub text: String,
    pub author: String,
    pub sequence: u64,
}

/// The materialized view. Fully reconstructible from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectAggregate {
    pub files: BTreeMap<String, FileState>,
    /// Keyed by path; annotations in append order.
    pub annotations: BTreeMap<String, Vec<Annotation>>,
    /// Snapshot name → sequence it captures.
    pub snapshots: BTreeMap<String, u64>,
    /// Pair id → suggestions, in append order.
    pub pair_suggestions: BTreeMap<String, Vec<PairSuggestionRef>>,
    /// Highest sequence folded in.
    pub applied_through: u64,
}

impl ProjectAggregate {
    /// Fold one event. Idempotent: already-applied sequences are skipped.
    pub fn apply(&mut self, event: &Event) {
        if event.sequence <= self.applied_through {
            return;
        }
        match &event.payload {
            EventPayload::FileWritten {
                path,
                content_hash,
                size_bytes,
            } => {
                self.files.insert(
                    path.clone(),
                    FileState {
                        content_hash: content_hash.clone(),
                        size_bytes: *size_bytes,
                        latest_sequence: event.sequence,
                    },
                );
            }
            EventPayload::AnnotationAdded {
                path,
                line,
                category,
                message,
                author,
            } => {
                self.annotations.entry(path.clone()).or_default().push(
                    Annotation {
                        line: *line,
                        category: category.clone(),
                        message: message.clone(),
                        author: author.clone(),
                        sequence: event.sequence,
                    },
                );
            }
            EventPayload::SnapshotCreated { name, at_sequence } => {
                self.snapshots.insert(name.clone(), *at_sequence);
            }
            EventPayload::PairSuggestion {
                pair_id,
                line,
                text,
                author,
            } => {
                self.pair_suggestions.entry(pair_id.clone()).or_default().push(
                    PairSuggestionRef {
                        line: *line,
                        text: text.clone(),
                        author: author.clone(),
                        sequence: event.sequence,
                    },
                );
            }
            _ => {}
        }
        self.applied_through = event.sequence;
    }
}

/// Shadow search parameters. Narrowing predicates run before anything is
/// materialized, and a page never exceeds `page_size`.
#[derive(Debug, Clone, Default)]
pub struct ShadowSearchQuery {
    /// Match paths starting with this prefix.
    pub path_prefix: Option<String>,
    /// Match paths containing this substring.
    pub path_contains: Option<String>,
    /// Match file extension (without the dot).
    pub extension: Option<String>,
    pub page_size: usize,
    /// Resume after this path.
    pub cursor: Option<String>,
}

/// One shadow search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowEntry {
    pub path: String,
    pub content_hash: String,
    pub latest_sequence: u64,
}

/// A page of shadow search results.
#[derive(Debug, Clone)]
pub struct ShadowSearchPage {
    pub entries: Vec<ShadowEntry>,
    pub next_cursor: Option<String>,
}

/// Maintains the live view and answers time-travel queries.
pub struct Materializer {
    store: Arc<EventStore>,
    checkpoint_dir: PathBuf,
    live: RwLock<ProjectAggregate>,
    default_page_size: usize,
}

impl Materializer {
    #[must_use]
    pub fn new(store: Arc<EventStore>, data_dir: &std::path::Path, default_page_size: usize) -> Self {
        Self {
            store,
            checkpoint_dir: data_dir.join("checkpoints"),
            live: RwLock::new(ProjectAggregate::default()),
            default_page_size: default_page_size.max(1),
        }
    }

    /// Fold one live event, checkpointing on the configured cadence.
    pub fn apply_live(&self, event: &Event) {
        let mut live = self.write();
        live.apply(event);
        if live.applied_through % CHECKPOINT_INTERVAL == 0 && live.applied_through > 0 {
            if let Err(err) = self.write_checkpoint(&live) {
                // Checkpoints are caches; losing one only costs replay time.
                warn!(kind = %err.kind(), "failed to write aggregate checkpoint");
            }
        }
    }

    /// The current materialized view.
    #[must_use]
    pub fn current(&self) -> ProjectAggregate {
        self.read().clone()
    }

    /// Annotations for a path, in append order.
    #[must_use]
    pub fn annotations_for(&self, path: &str) -> Vec<Annotation> {
        self.read().annotations.get(path).cloned().unwrap_or_default()
    }

    /// Materialize the state as of `sequence`, checkpoint-accelerated.
    pub async fn state_at(&self, sequence: u64) -> Result<ProjectAggregate, StoreError> {
        let mut aggregate = self
            .load_checkpoint_at_or_below(sequence)
            .unwrap_or_default();
        for seq in (aggregate.applied_through + 1)..=sequence {
            match self.store.read_event(seq).await {
                Ok(event) => aggregate.apply(&event),
                Err(StoreError::NotFound { .. }) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(aggregate)
    }

    /// Materialize a named snapshot.
    pub async fn snapshot(&self, name: &str) -> Result<ProjectAggregate, crate::error::Error> {
        let at_sequence = self
            .read()
            .snapshots
            .get(name)
            .copied()
            .ok_or_else(|| AggregateError::UnknownSnapshot {
                name: name.to_string(),
            })?;
        Ok(self.state_at(at_sequence).await?)
    }

    /// Whether a snapshot name is taken.
    #[must_use]
    pub fn snapshot_exists(&self, name: &str) -> bool {
        self.read().snapshots.contains_key(name)
    }

    /// Path-first bounded search over the shadow tree.
    #[must_use]
    pub fn search(&self, query: &ShadowSearchQuery) -> ShadowSearchPage {
        let page_size = if query.page_size == 0 {
            self.default_page_size
        } else {
            query.page_size
        };
        let live = self.read();

        // Narrow by path prefix first: a range scan over the ordered tree.
        let range: Box<dyn Iterator<Item = (&String, &FileState)> + '_> = match &query.path_prefix {
            Some(prefix) => Box::new(
                live.files
                    .range(prefix.clone()..)
                    .take_while(move |(path, _)| path.starts_with(prefix.as_str())),
            ),
            None => Box::new(live.files.iter()),
        };

        let mut entries = Vec::new();
        let mut next_cursor = None;
        for (path, state) in range {
            if let Some(cursor) = &query.cursor {
                if path.as_str() <= cursor.as_str() {
                    continue;
                }
            }
            if let Some(contains) = &query.path_contains {
                if !path.contains(contains.as_str()) {
                    continue;
                }
            }
            if let Some(extension) = &query.extension {
                let matches = std::path::Path::new(path)
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(extension));
                if !matches {
                    continue;
                }
            }
            if entries.len() == page_size {
                // Page full: report where to resume and stop scanning.
                next_cursor = entries.last().map(|e: &ShadowEntry| e.path.clone());
                break;
            }
            entries.push(ShadowEntry {
                path: path.clone(),
                content_hash: state.content_hash.clone(),
                latest_sequence: state.latest_sequence,
            });
        }

        ShadowSearchPage {
            entries,
            next_cursor,
        }
    }

    fn load_checkpoint_at_or_below(&self, sequence: u64) -> Option<ProjectAggregate> {
        let mut best: Option<(u64, PathBuf)> = None;
        let dir = std::fs::read_dir(&self.checkpoint_dir).ok()?;
        for entry in dir.flatten() {
            let path = entry.path();
            let stem = path.file_stem()?.to_str()?.to_string();
            if let Ok(seq) = stem.parse::<u64>() {
                if seq <= sequence && best.as_ref().is_none_or(|(b, _)| seq > *b) {
                    best = Some((seq, path));
                }
            }
        }
        let (seq, path) = best?;
        let raw = std::fs::read(&path).ok()?;
        let aggregate: ProjectAggregate = serde_json::from_slice(&raw).ok()?;
        // A checkpoint claiming a different fold position is stale; ignore it.
        if aggregate.applied_through != seq {
            return None;
        }
        debug!(checkpoint = seq, "time travel from checkpoint");
        Some(aggregate)
    }

    fn write_checkpoint(&self, aggregate: &ProjectAggregate) -> Result<(), crate::error::Error> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        let path = self
            .checkpoint_dir
            .join(format!("{:08}.json", aggregate.applied_through));
        let raw = serde_json::to_vec(aggregate).map_err(|e| {
            crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ProjectAggregate> {
        self.live
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ProjectAggregate> {
        self.live
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
