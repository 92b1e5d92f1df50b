//! Live subscriptions over the log.
//!
//! Each subscriber owns a bounded channel. The append path never waits on a
//! slow consumer: when a subscriber's queue is full it is dropped and its
//! next receive reports `lagging`. Restarting from an arbitrary sequence is
//! done by querying up to the head and resubscribing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::event::{Event, EventType};

/// What a subscriber wants to see.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub aggregate_id: Option<String>,
    pub event_types: Option<Vec<EventType>>,
}

impl SubscriptionFilter {
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(aggregate_id) = &self.aggregate_id {
            if event.aggregate_id != *aggregate_id {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        true
    }
}

/// Consumer handle for a subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
    lagged: Arc<AtomicBool>,
    bound: usize,
}

impl Subscription {
    /// Receive the next matching event.
    ///
    /// `Ok(None)` means the store shut down cleanly; `Err(Lagging)` means
    /// this subscriber fell behind its queue bound and was dropped.
    pub async fn recv(&mut self) -> Result<Option<Event>, StoreError> {
        match self.rx.recv().await {
            Some(event) => Ok(Some(event)),
            None => {
                if self.lagged.load(Ordering::Acquire) {
                    Err(StoreError::Lagging { bound: self.bound })
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[derive(Debug)]
struct SubscriberHandle {
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Event>,
    lagged: Arc<AtomicBool>,
}

/// Publisher-side registry of live subscribers.
#[derive(Debug)]
pub struct SubscriberRegistry {
    subscribers: Vec<SubscriberHandle>,
    bound: usize,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new(bound: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            bound: bound.max(1),
        }
    }

    /// Register a subscriber, pre-filling its queue with `backlog`.
    ///
    /// The backlog must fit the queue bound; larger restarts page through
    /// `query` first and resubscribe from the head.
    pub fn subscribe(
        &mut self,
        filter: SubscriptionFilter,
        backlog: Vec<Event>,
    ) -> Result<Subscription, StoreError> {
        if backlog.len() > self.bound {
            return Err(StoreError::Lagging { bound: self.bound });
        }
        let (sender, rx) = mpsc::channel(self.bound);
        for event in backlog {
            sender.try_send(event).expect("backlog fits the fresh queue");
        }
        let lagged = Arc::new(AtomicBool::new(false));
        self.subscribers.push(SubscriberHandle {
            filter,
            sender,
            lagged: Arc::clone(&lagged),
        });
        Ok(Subscription {
            rx,
            lagged,
            bound: self.bound,
        })
    }

    /// Fan an appended event out to matching subscribers. Slow subscribers
    /// are marked lagged and dropped; closed ones are pruned.
    pub fn publish(&mut self, event: &Event) {
        self.subscribers.retain(|sub| {
            if !sub.filter.matches(event) {
                return !sub.sender.is_closed();
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.lagged.store(true, Ordering::Release);
                    tracing::warn!("dropping lagging subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;

    fn event(seq: u64, aggregate: &str) -> Event {
        Event {
            sequence: seq,
            event_id: format!("ev_{seq}"),
            event_type: EventType::FileWritten,
            aggregate_id: aggregate.to_string(),
            agent_id: "alice".to_string(),
            timestamp_ms: 0,
            causation_id: None,
            payload: EventPayload::FileWritten {
                path: aggregate.trim_start_matches("file:").to_string(),
                content_hash: "h".to_string(),
                size_bytes: 0,
            },
            integrity_tag: String::new(),
        }
    }

    #[tokio::test]
    async fn delivers_matching_events() {
        let mut registry = SubscriberRegistry::new(8);
        let mut sub = registry
            .subscribe(
                SubscriptionFilter {
                    aggregate_id: Some("file:a.rs".to_string()),
                    event_types: None,
                },
                vec![],
            )
            .unwrap();

        registry.publish(&event(1, "file:a.rs"));
        registry.publish(&event(2, "file:b.rs"));
        registry.publish(&event(3, "file:a.rs"));
        drop(registry);

        assert_eq!(sub.recv().await.unwrap().unwrap().sequence, 1);
        assert_eq!(sub.recv().await.unwrap().unwrap().sequence, 3);
        assert!(sub.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backlog_is_delivered_first() {
        let mut registry = SubscriberRegistry::new(8);
        let mut sub = registry
            .subscribe(
                SubscriptionFilter::default(),
                vec![event(1, "file:a.rs"), event(2, "file:a.rs")],
            )
            .unwrap();
        registry.publish(&event(3, "file:a.rs"));
        drop(registry);

        let mut sequences = Vec::new();
        while let Some(e) = sub.recv().await.unwrap() {
            sequences.push(e.sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn oversized_backlog_is_lagging() {
        let mut registry = SubscriberRegistry::new(2);
        let err = registry
            .subscribe(
                SubscriptionFilter::default(),
                vec![
                    event(1, "file:a.rs"),
                    event(2, "file:a.rs"),
                    event(3, "file:a.rs"),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Lagging { bound: 2 }));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_as_lagging() {
        let mut registry = SubscriberRegistry::new(2);
        let mut sub = registry
            .subscribe(SubscriptionFilter::default(), vec![])
            .unwrap();

        // Fill the queue past its bound without draining.
        registry.publish(&event(1, "file:a.rs"));
        registry.publish(&event(2, "file:a.rs"));
        registry.publish(&event(3, "file:a.rs"));
        assert_eq!(registry.len(), 0, "subscriber dropped on overflow");

        // The queued events still drain, then the lag surfaces.
        assert_eq!(sub.recv().await.unwrap().unwrap().sequence, 1);
        assert_eq!(sub.recv().await.unwrap().unwrap().sequence, 2);
        let err = sub.recv().await.unwrap_err();
        assert!(matches!(err, StoreError::Lagging { bound: 2 }));
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let mut registry = SubscriberRegistry::new(4);
        let sub = registry
            .subscribe(SubscriptionFilter::default(), vec![])
            .unwrap();
        drop(sub);
        registry.publish(&event(1, "file:a.rs"));
        assert!(registry.is_empty());
    }
}
