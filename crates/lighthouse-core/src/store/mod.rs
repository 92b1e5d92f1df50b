//! The event store: durable, append-only, authenticated log.
//!
//! One store instance owns a data directory (an advisory lock enforces the
//! single-writer-per-directory invariant across processes). Appends are
//! serialized through a single writer: sequence assignment, canonical
//! encoding, tag computation, the fsynced write, and index updates happen as
//! one unit under the writer lock. Reads copy candidate positions under the
//! lock and decode records outside it.
//!
//! Layout under the data directory:
//!
//! ```text
//! log/NNNN.dat   primary chained log segments
//! index/         aggregate and type indices (rebuildable caches)
//! checkpoints/   aggregate checkpoints (owned by the materializer)
//! keys/          expert key material, provisioned out-of-band; never written
//! ```
//!
//! On open the store replays the log, verifies the chain, truncates a torn
//! tail back to the last verified sequence (recording the truncation as a
//! `log.recovered` event), and rebuilds indices that disagree with the log.
//! A chain break anywhere before the tail is not recoverable and fails open
//! with `integrity_violation`.

pub mod causality;
pub mod chain;
pub mod index;
pub mod segment;
pub mod subscribe;

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fs2::FileExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::authz::{self, Permission};
use crate::encoding::{self, TAG_LEN};
use crate::error::StoreError;
use crate::event::{Event, EventDraft, EventType, generate_event_id};
use crate::identity::{AgentIdentity, IdentityRegistry, SYSTEM_AGENT_ID};
use crate::rate_limit::RateLimiter;
use crate::secret::AuthSecret;

use causality::CausalityWindow;
use chain::{GENESIS_TAG, chain_tag, verify_tag};
use index::{IndexEntry, IndexSet};
use segment::{DEFAULT_MAX_SEGMENT_BYTES, SegmentWriter};
use subscribe::{SubscriberRegistry, Subscription, SubscriptionFilter};

/// Tunables for a store instance.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub data_dir: PathBuf,
    pub max_segment_bytes: u64,
    pub subscriber_queue_bound: usize,
    pub causality_window: usize,
    pub rate_limit_per_minute: u32,
}

impl StoreOptions {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            subscriber_queue_bound: 256,
            causality_window: 1024,
            rate_limit_per_minute: 120,
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AppendReceipt {
    pub sequence: u64,
    /// Hex tag now at the head of the chain.
    pub integrity_tag: String,
}

/// Query parameters. Events come back in sequence order.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub aggregate_id: Option<String>,
    pub event_types: Option<Vec<EventType>>,
    /// Inclusive sequence bounds.
    pub sequence_range: Option<(u64, u64)>,
    pub limit: usize,
    /// Resume position from a previous page.
    pub cursor: Option<u64>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            aggregate_id: None,
            event_types: None,
            sequence_range: None,
            limit: 100,
            cursor: None,
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub events: Vec<Event>,
    pub next_cursor: Option<u64>,
}

/// What recovery did while opening the store.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// First sequence lost to torn-tail truncation, when any.
    pub truncated_from_sequence: Option<u64>,
    pub head_sequence: u64,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    segment_id: u32,
    offset: u64,
}

#[derive(Debug)]
struct WriterState {
    writer: SegmentWriter,
    next_sequence: u64,
    head_tag: [u8; TAG_LEN],
    /// `positions[seq - 1]` locates each record.
    positions: Vec<Position>,
    index: IndexSet,
    causality: CausalityWindow,
    subscribers: SubscriberRegistry,
    limiter: RateLimiter,
}

/// Append-only authenticated event store.
#[derive(Debug)]
pub struct EventStore {
    options: StoreOptions,
    secret: Arc<AuthSecret>,
    registry: Arc<IdentityRegistry>,
    inner: Mutex<WriterState>,
    halted: AtomicBool,
    recovery: RecoveryReport,
    _dir_lock: File,
}

impl EventStore {
    /// Open a data directory, running recovery as needed.
    pub fn open(
        options: StoreOptions,
        secret: Arc<AuthSecret>,
        registry: Arc<IdentityRegistry>,
    ) -> Result<Self, StoreError> {
        let log_dir = options.data_dir.join("log");
        let index_dir = options.data_dir.join("index");
        std::fs::create_dir_all(&log_dir)?;
        std::fs::create_dir_all(&index_dir)?;
        std::fs::create_dir_all(options.data_dir.join("checkpoints"))?;

        let dir_lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(options.data_dir.join(".lock"))?;
        dir_lock.try_lock_exclusive().map_err(|_| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "another writer owns this data directory",
            ))
        })?;

        let replay = replay_log(&log_dir, &secret, options.causality_window)?;

        let active_segment = replay.last_segment_id.unwrap_or(1);
        let writer = SegmentWriter::open(&log_dir, active_segment)?;
        let index = IndexSet::open(&index_dir, &replay.index_entries)?;

        let mut state = WriterState {
            writer,
            next_sequence: replay.head_sequence + 1,
            head_tag: replay.head_tag,
            positions: replay.positions,
            index,
            causality: replay.causality,
            subscribers: SubscriberRegistry::new(options.subscriber_queue_bound),
            limiter: RateLimiter::new(options.rate_limit_per_minute),
        };

        let mut recovery = RecoveryReport {
            truncated_from_sequence: replay.truncated_from_sequence,
            head_sequence: replay.head_sequence,
        };

        if let Some(truncated_from) = replay.truncated_from_sequence {
            warn!(
                truncated_from,
                head = replay.head_sequence,
                "torn tail truncated; recording recovery event"
            );
            let draft = EventDraft::new(
                "store:log",
                crate::event::EventPayload::LogRecovered {
                    truncated_from_sequence: truncated_from,
                    verified_tag: hex::encode(replay.head_tag),
                },
            );
            let (_, receipt) = append_locked(
                &mut state,
                &secret,
                &options,
                draft,
                SYSTEM_AGENT_ID.to_string(),
            )?;
            recovery.head_sequence = receipt.sequence;
        }

        info!(
            head = recovery.head_sequence,
            data_dir = %options.data_dir.display(),
            "event store open"
        );

        Ok(Self {
            options,
            secret,
            registry,
            inner: Mutex::new(state),
            halted: AtomicBool::new(false),
            recovery,
            _dir_lock: dir_lock,
        })
    }

    /// What recovery did during `open`.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Append an event on behalf of an authenticated caller.
    pub async fn append(
        &self,
        draft: EventDraft,
        agent_id: &str,
    ) -> Result<AppendReceipt, StoreError> {
        self.append_inner(draft, agent_id, true).await
    }

    /// Append under the process's own system identity: bootstrap events,
    /// coordinator decisions, recovery records. Skips the per-agent rate
    /// limit but validates everything else.
    pub async fn append_trusted(&self, draft: EventDraft) -> Result<AppendReceipt, StoreError> {
        self.append_inner(draft, SYSTEM_AGENT_ID, false).await
    }

    async fn append_inner(
        &self,
        draft: EventDraft,
        agent_id: &str,
        rate_limited: bool,
    ) -> Result<AppendReceipt, StoreError> {
        if self.halted.load(Ordering::Acquire) {
            return Err(StoreError::Halted);
        }

        // No auto-auth: an unknown agent id fails here and is NOT created.
        let identity = self
            .registry
            .authenticate(agent_id)
            .ok_or(StoreError::Unauthenticated)?;
        authz::authorize(&identity, Permission::EventAppend).map_err(|_| {
            StoreError::PermissionDenied {
                permission: Permission::EventAppend.as_str(),
            }
        })?;

        draft
            .validate()
            .map_err(|reason| StoreError::SchemaInvalid { reason })?;

        let mut state = self.inner.lock().await;

        if rate_limited && !state.limiter.check(agent_id) {
            return Err(StoreError::RateLimited);
        }

        let result = append_locked(
            &mut state,
            &self.secret,
            &self.options,
            draft,
            agent_id.to_string(),
        );

        match result {
            Ok((event, receipt)) => {
                state.subscribers.publish(&event);
                Ok(receipt)
            }
            Err(err) => {
                if matches!(err, StoreError::Io(_)) {
                    // Refuse further appends until a health check passes.
                    self.halted.store(true, Ordering::Release);
                    warn!("append failed with I/O error; store halted");
                }
                Err(err)
            }
        }
    }

    /// Query events, newest pages resumable via the returned cursor.
    /// Events the caller cannot read are filtered out.
    pub async fn query(
        &self,
        filter: &QueryFilter,
        identity: &AgentIdentity,
    ) -> Result<QueryPage, StoreError> {
        authz::authorize(identity, Permission::EventQuery).map_err(|_| {
            StoreError::PermissionDenied {
                permission: Permission::EventQuery.as_str(),
            }
        })?;

        let limit = filter.limit.max(1);
        let (candidates, positions) = {
            let state = self.inner.lock().await;
            let head = state.next_sequence - 1;
            (candidate_sequences(&state, filter, head), state.positions.clone())
        };

        let log_dir = self.options.data_dir.join("log");
        let mut events = Vec::new();
        let mut next_cursor = None;
        for seq in candidates {
            if events.len() == limit {
                next_cursor = Some(seq);
                break;
            }
            let event = read_event_at(&log_dir, &positions, seq)?;
            if let Some(types) = &filter.event_types {
                if !types.contains(&event.event_type) {
                    continue;
                }
            }
            if !authz::can_read_event(identity, &event) {
                continue;
            }
            events.push(event);
        }

        Ok(QueryPage { events, next_cursor })
    }

    /// Read a single event by sequence. Internal consumers only; callers on
    /// the adapter path go through [`EventStore::query`].
    pub async fn read_event(&self, sequence: u64) -> Result<Event, StoreError> {
        let positions = {
            let state = self.inner.lock().await;
            state.positions.clone()
        };
        read_event_at(&self.options.data_dir.join("log"), &positions, sequence)
    }

    /// All events for one aggregate up to `through` (inclusive), log order.
    pub async fn events_for_aggregate(
        &self,
        aggregate_id: &str,
        through: Option<u64>,
    ) -> Result<Vec<Event>, StoreError> {
        let (sequences, positions) = {
            let state = self.inner.lock().await;
            (
                state.index.sequences_for_aggregate(aggregate_id).to_vec(),
                state.positions.clone(),
            )
        };
        let log_dir = self.options.data_dir.join("log");
        let mut events = Vec::new();
        for seq in sequences {
            if through.is_some_and(|t| seq > t) {
                break;
            }
            events.push(read_event_at(&log_dir, &positions, seq)?);
        }
        Ok(events)
    }

    /// Replay every event through `visit`, in sequence order. Used at startup
    /// to fold derived state (identity registry, project aggregates).
    pub async fn replay(&self, mut visit: impl FnMut(&Event)) -> Result<(), StoreError> {
        let (head, positions) = {
            let state = self.inner.lock().await;
            (state.next_sequence - 1, state.positions.clone())
        };
        let log_dir = self.options.data_dir.join("log");
        for seq in 1..=head {
            let event = read_event_at(&log_dir, &positions, seq)?;
            visit(&event);
        }
        Ok(())
    }

    /// Subscribe to live events, optionally replaying from a past sequence.
    ///
    /// The backlog must fit the subscriber queue bound; restarts further back
    /// page through `query` first.
    pub async fn subscribe(
        &self,
        filter: SubscriptionFilter,
        from_sequence: Option<u64>,
    ) -> Result<Subscription, StoreError> {
        let mut state = self.inner.lock().await;
        let head = state.next_sequence - 1;
        let mut backlog = Vec::new();
        if let Some(from) = from_sequence {
            let positions = state.positions.clone();
            let log_dir = self.options.data_dir.join("log");
            for seq in from..=head {
                let event = read_event_at(&log_dir, &positions, seq)?;
                if filter.matches(&event) {
                    backlog.push(event);
                }
            }
        }
        state.subscribers.subscribe(filter, backlog)
    }

    /// Verify the chained tags across an inclusive sequence range.
    pub async fn integrity_check(&self, start: u64, end: u64) -> Result<bool, StoreError> {
        let (head, positions) = {
            let state = self.inner.lock().await;
            (state.next_sequence - 1, state.positions.clone())
        };
        let start = start.max(1);
        let end = end.min(head);
        if start > end {
            return Ok(true);
        }

        let log_dir = self.options.data_dir.join("log");
        let mut prev_tag = if start == 1 {
            GENESIS_TAG
        } else {
            read_raw_at(&log_dir, &positions, start - 1)?.tag
        };

        for seq in start..=end {
            let raw = read_raw_at(&log_dir, &positions, seq)?;
            if !verify_tag(&self.secret, &prev_tag, &raw.canonical, &raw.tag) {
                return Ok(false);
            }
            prev_tag = raw.tag;
        }
        Ok(true)
    }

    /// Current head sequence and tag.
    pub async fn head(&self) -> (u64, String) {
        let state = self.inner.lock().await;
        (state.next_sequence - 1, hex::encode(state.head_tag))
    }

    /// Probe the data directory; on success the store accepts appends again.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let probe = self.options.data_dir.join(".health");
        let mut file = File::create(&probe)?;
        file.write_all(b"ok")?;
        file.sync_data()?;
        self.halted.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether the store is refusing appends.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

struct ReplayOutcome {
    head_sequence: u64,
    head_tag: [u8; TAG_LEN],
    positions: Vec<Position>,
    index_entries: Vec<IndexEntry>,
    causality: CausalityWindow,
    last_segment_id: Option<u32>,
    truncated_from_sequence: Option<u64>,
}

/// Walk every segment, verifying the chain. A broken suffix in the final
/// segment is truncated; damage anywhere else is fatal.
fn replay_log(
    log_dir: &Path,
    secret: &AuthSecret,
    causality_window: usize,
) -> Result<ReplayOutcome, StoreError> {
    let segments = segment::list_segments(log_dir)?;
    let last_index = segments.len().checked_sub(1);

    let mut head_tag = GENESIS_TAG;
    let mut expected_sequence: u64 = 1;
    let mut positions = Vec::new();
    let mut index_entries = Vec::new();
    let mut causality = CausalityWindow::new(causality_window);
    let mut truncated_from_sequence = None;

    for (i, (segment_id, path)) in segments.iter().enumerate() {
        let scan = segment::scan_segment(path)?;
        let is_last = Some(i) == last_index;
        let mut truncate_at: Option<u64> = if scan.has_torn_tail() {
            Some(scan.valid_len)
        } else {
            None
        };

        for record in &scan.records {
            // Stop folding past a truncation point.
            if truncate_at.is_some_and(|at| record.offset >= at) {
                break;
            }
            let decoded = encoding::decode_canonical(&record.canonical).ok();
            let valid = verify_tag(secret, &head_tag, &record.canonical, &record.tag)
                && decoded
                    .as_ref()
                    .is_some_and(|e| e.sequence == expected_sequence);
            let Some(event) = decoded.filter(|_| valid) else {
                if is_last {
                    truncate_at = Some(record.offset);
                    break;
                }
                return Err(StoreError::Integrity {
                    sequence: expected_sequence,
                });
            };
            positions.push(Position {
                segment_id: *segment_id,
                offset: record.offset,
            });
            index_entries.push(IndexEntry {
                sequence: event.sequence,
                aggregate_id: event.aggregate_id.clone(),
                event_type: event.event_type,
            });
            causality.record(&event.event_id, event.causation_id.as_deref());
            head_tag = record.tag;
            expected_sequence += 1;
        }

        if let Some(at) = truncate_at {
            if !is_last {
                return Err(StoreError::Integrity {
                    sequence: expected_sequence,
                });
            }
            segment::truncate_segment(path, at)?;
            truncated_from_sequence = Some(expected_sequence);
        }
    }

    Ok(ReplayOutcome {
        head_sequence: expected_sequence - 1,
        head_tag,
        positions,
        index_entries,
        causality,
        last_segment_id: segments.last().map(|(id, _)| *id),
        truncated_from_sequence,
    })
}

/// The atomic unit: sequence assignment, encoding, tag, durable write, index
/// update. Runs under the writer lock.
fn append_locked(
    state: &mut WriterState,
    secret: &AuthSecret,
    options: &StoreOptions,
    draft: EventDraft,
    agent_id: String,
) -> Result<(Event, AppendReceipt), StoreError> {
    if let Some(pinned) = &draft.pinned_head_tag {
        let pinned = encoding::decode_tag(pinned)?;
        if pinned != state.head_tag {
            return Err(StoreError::HeadMismatch {
                head_sequence: state.next_sequence - 1,
            });
        }
    }

    let event_id = draft.event_id.clone().unwrap_or_else(generate_event_id);
    if state.causality.contains(&event_id) {
        return Err(StoreError::SchemaInvalid {
            reason: "duplicate event id in recent window".to_string(),
        });
    }
    if let Some(causation_id) = &draft.causation_id {
        if !state.causality.link_is_acyclic(&event_id, causation_id) {
            return Err(StoreError::CausationCycle {
                causation_id: causation_id.clone(),
            });
        }
    }

    let event = Event {
        sequence: state.next_sequence,
        event_id,
        event_type: draft.event_type,
        aggregate_id: draft.aggregate_id,
        agent_id,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        causation_id: draft.causation_id,
        payload: draft.payload,
        integrity_tag: String::new(),
    };

    let canonical = encoding::encode_canonical(&event);
    let tag = chain_tag(secret, &state.head_tag, &canonical);
    let offset = state.writer.append_record(&canonical, &tag)?;

    state.positions.push(Position {
        segment_id: state.writer.segment_id(),
        offset,
    });
    state.index.append(&IndexEntry {
        sequence: event.sequence,
        aggregate_id: event.aggregate_id.clone(),
        event_type: event.event_type,
    })?;
    state
        .causality
        .record(&event.event_id, event.causation_id.as_deref());
    state.head_tag = tag;
    state.next_sequence += 1;

    // Roll to a fresh segment once this one is past the threshold.
    if state.writer.len() >= options.max_segment_bytes {
        let next_segment = state.writer.segment_id() + 1;
        state.writer = SegmentWriter::open(&options.data_dir.join("log"), next_segment)?;
    }

    let mut event = event;
    event.integrity_tag = hex::encode(tag);
    let receipt = AppendReceipt {
        sequence: event.sequence,
        integrity_tag: event.integrity_tag.clone(),
    };
    Ok((event, receipt))
}

fn candidate_sequences(state: &WriterState, filter: &QueryFilter, head: u64) -> Vec<u64> {
    let mut start = filter.cursor.unwrap_or(1).max(1);
    let mut end = head;
    if let Some((range_start, range_end)) = filter.sequence_range {
        start = start.max(range_start);
        end = end.min(range_end);
    }
    if start > end {
        return Vec::new();
    }

    if let Some(aggregate_id) = &filter.aggregate_id {
        return state
            .index
            .sequences_for_aggregate(aggregate_id)
            .iter()
            .copied()
            .filter(|seq| (start..=end).contains(seq))
            .collect();
    }
    if let Some(types) = &filter.event_types {
        let mut sequences: Vec<u64> = types
            .iter()
            .flat_map(|ty| state.index.sequences_for_type(*ty).iter().copied())
            .filter(|seq| (start..=end).contains(seq))
            .collect();
        sequences.sort_unstable();
        sequences.dedup();
        return sequences;
    }
    (start..=end).collect()
}

fn read_raw_at(
    log_dir: &Path,
    positions: &[Position],
    sequence: u64,
) -> Result<segment::RawRecord, StoreError> {
    let position = positions
        .get((sequence.max(1) - 1) as usize)
        .ok_or(StoreError::NotFound { sequence })?;
    let path = log_dir.join(segment::segment_file_name(position.segment_id));
    segment::read_record_at(&path, position.offset)
}

fn read_event_at(
    log_dir: &Path,
    positions: &[Position],
    sequence: u64,
) -> Result<Event, StoreError> {
    let raw = read_raw_at(log_dir, positions, sequence)?;
    let mut event = encoding::decode_canonical(&raw.canonical)?;
    event.integrity_tag = hex::encode(raw.tag);
    Ok(event)
}
