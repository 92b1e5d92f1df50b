//! Secondary indices by aggregate id and event type.
//!
//! Append-only sidecar files (`index/aggregate`, `index/type`) mirroring the
//! primary log. They are caches: on open they are checked against the scanned
//! log and rewritten wholesale when they disagree, so a crash between a log
//! append and an index append costs a rebuild, never correctness.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::event::EventType;

const AGGREGATE_FILE: &str = "aggregate";
const TYPE_FILE: &str = "type";

/// One index entry derived from an appended event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub sequence: u64,
    pub aggregate_id: String,
    pub event_type: EventType,
}

/// In-memory index maps plus their backing files.
#[derive(Debug)]
pub struct IndexSet {
    by_aggregate: HashMap<String, Vec<u64>>,
    by_type: HashMap<EventType, Vec<u64>>,
    aggregate_writer: BufWriter<File>,
    type_writer: BufWriter<File>,
}

impl IndexSet {
    /// Open the index files, rebuilding them if they disagree with the log.
    pub fn open(index_dir: &Path, log_entries: &[IndexEntry]) -> Result<Self, StoreError> {
        std::fs::create_dir_all(index_dir)?;
        let aggregate_path = index_dir.join(AGGREGATE_FILE);
        let type_path = index_dir.join(TYPE_FILE);

        let loaded = load_both(&aggregate_path, &type_path);
        let matches = match &loaded {
            Some((agg, ty)) => entries_match(log_entries, agg, ty),
            None => false,
        };

        if !matches {
            tracing::info!(
                entries = log_entries.len(),
                "rebuilding secondary indices from the log"
            );
            rewrite(&aggregate_path, log_entries.iter().map(|e| {
                (e.aggregate_id.as_str(), e.sequence)
            }))?;
            rewrite(&type_path, log_entries.iter().map(|e| {
                (e.event_type.as_str(), e.sequence)
            }))?;
        }

        let mut by_aggregate: HashMap<String, Vec<u64>> = HashMap::new();
        let mut by_type: HashMap<EventType, Vec<u64>> = HashMap::new();
        for entry in log_entries {
            by_aggregate
                .entry(entry.aggregate_id.clone())
                .or_default()
                .push(entry.sequence);
            by_type
                .entry(entry.event_type)
                .or_default()
                .push(entry.sequence);
        }

        let aggregate_writer = BufWriter::new(open_append(&aggregate_path)?);
        let type_writer = BufWriter::new(open_append(&type_path)?);

        Ok(Self {
            by_aggregate,
            by_type,
            aggregate_writer,
            type_writer,
        })
    }

    /// Record an appended event in both indices.
    pub fn append(&mut self, entry: &IndexEntry) -> Result<(), StoreError> {
        write_entry(
            &mut self.aggregate_writer,
            &entry.aggregate_id,
            entry.sequence,
        )?;
        write_entry(
            &mut self.type_writer,
            entry.event_type.as_str(),
            entry.sequence,
        )?;
        self.aggregate_writer.flush()?;
        self.type_writer.flush()?;

        self.by_aggregate
            .entry(entry.aggregate_id.clone())
            .or_default()
            .push(entry.sequence);
        self.by_type
            .entry(entry.event_type)
            .or_default()
            .push(entry.sequence);
        Ok(())
    }

    /// Sequences recorded for an aggregate, in log order.
    #[must_use]
    pub fn sequences_for_aggregate(&self, aggregate_id: &str) -> &[u64] {
        self.by_aggregate
            .get(aggregate_id)
            .map_or(&[], Vec::as_slice)
    }

    /// Sequences recorded for an event type, in log order.
    #[must_use]
    pub fn sequences_for_type(&self, event_type: EventType) -> &[u64] {
        self.by_type.get(&event_type).map_or(&[], Vec::as_slice)
    }
}

fn open_append(path: &PathBuf) -> Result<File, StoreError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn write_entry(writer: &mut impl Write, key: &str, sequence: u64) -> Result<(), StoreError> {
    writer.write_all(&(key.len() as u32).to_le_bytes())?;
    writer.write_all(key.as_bytes())?;
    writer.write_all(&sequence.to_le_bytes())?;
    Ok(())
}

fn load_both(
    aggregate_path: &Path,
    type_path: &Path,
) -> Option<(Vec<(String, u64)>, Vec<(String, u64)>)> {
    Some((load_entries(aggregate_path)?, load_entries(type_path)?))
}

fn load_entries(path: &Path) -> Option<Vec<(String, u64)>> {
    let mut buf = Vec::new();
    File::open(path).ok()?.read_to_end(&mut buf).ok()?;

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        if buf.len() - pos < 4 {
            return None;
        }
        let key_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().ok()?) as usize;
        pos += 4;
        if buf.len() - pos < key_len + 8 {
            return None;
        }
        let key = String::from_utf8(buf[pos..pos + key_len].to_vec()).ok()?;
        pos += key_len;
        let seq = u64::from_le_bytes(buf[pos..pos + 8].try_into().ok()?);
        pos += 8;
        entries.push((key, seq));
    }
    Some(entries)
}

fn entries_match(
    log_entries: &[IndexEntry],
    aggregate: &[(String, u64)],
    types: &[(String, u64)],
) -> bool {
    if aggregate.len() != log_entries.len() || types.len() != log_entries.len() {
        return false;
    }
    log_entries.iter().zip(aggregate).zip(types).all(
        |((entry, (agg_key, agg_seq)), (ty_key, ty_seq))| {
            entry.aggregate_id == *agg_key
                && entry.sequence == *agg_seq
                && entry.event_type.as_str() == ty_key
                && entry.sequence == *ty_seq
        },
    )
}

fn rewrite<'a>(
    path: &Path,
    entries: impl Iterator<Item = (&'a str, u64)>,
) -> Result<(), StoreError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (key, seq) in entries {
        write_entry(&mut writer, key, seq)?;
    }
    writer.flush()?;
    Ok(())
}
