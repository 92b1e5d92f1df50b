//! Causation acyclicity over a bounded recent window.
//!
//! `causation_id` links form a DAG. A cycle can only involve ids the writer
//! has seen recently (a new event's id must already be referenced for a cycle
//! to close), so the check walks causation edges within a fixed-size window
//! of the latest appends rather than the whole log.

use std::collections::{HashMap, VecDeque};

/// Sliding window of recent (event id → causation id) edges.
#[derive(Debug)]
pub struct CausalityWindow {
    capacity: usize,
    order: VecDeque<String>,
    edges: HashMap<String, Option<String>>,
}

impl CausalityWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            edges: HashMap::new(),
        }
    }

    /// Whether an event id is present in the window.
    #[must_use]
    pub fn contains(&self, event_id: &str) -> bool {
        self.edges.contains_key(event_id)
    }

    /// Check that linking `new_event_id` → `causation_id` keeps the window
    /// acyclic. Returns `false` when the link closes a cycle.
    #[must_use]
    pub fn link_is_acyclic(&self, new_event_id: &str, causation_id: &str) -> bool {
        if new_event_id == causation_id {
            return false;
        }
        // Follow causation edges from the referenced event; hitting the new
        // id means the new link would close a loop.
        let mut current = Some(causation_id.to_string());
        let mut hops = 0;
        while let Some(id) = current {
            if id == new_event_id {
                return false;
            }
            hops += 1;
            if hops > self.capacity {
                break;
            }
            current = self.edges.get(&id).and_then(Clone::clone);
        }
        true
    }

    /// Record an appended event's causation edge, evicting the oldest entry
    /// past capacity.
    pub fn record(&mut self, event_id: &str, causation_id: Option<&str>) {
        if self.edges.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.edges.remove(&evicted);
            }
        }
        self.order.push_back(event_id.to_string());
        self.edges
            .insert(event_id.to_string(), causation_id.map(ToString::to_string));
    }
}
