//! Append-only in-memory event log.
//!
//! Single writer (the event pump), many readers. Retention keeps the last
//! 500 entries; overflow evicts the oldest non-sticky entry, so phase
//! transitions and iteration boundaries survive. Reads return snapshots
//! and never fail.

use chrono::{DateTime, Utc};
use opscenter_core::OfficeEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

pub const LOG_CAPACITY: usize = 500;

#[derive(Clone, Debug, serde::Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub iteration: u64,
    pub sticky: bool,
    pub kind: &'static str,
    pub event: OfficeEvent,
}

pub struct EventLog {
    entries: RwLock<VecDeque<LogEntry>>,
    next_seq: AtomicU64,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(LOG_CAPACITY))),
            next_seq: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&self, event: OfficeEvent, iteration: u64) {
        let mut entries = self.entries.write().unwrap();
        // Timestamps are monotonic even if the source clock regresses.
        let now = Utc::now();
        let ts = entries.back().map_or(now, |last| now.max(last.ts));
        entries.push_back(LogEntry {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            ts,
            iteration,
            sticky: event.is_sticky(),
            kind: event.kind(),
            event,
        });
        if entries.len() > self.capacity {
            if let Some(pos) = entries.iter().position(|e| !e.sticky) {
                entries.remove(pos);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().unwrap().iter().cloned().collect()
    }

    pub fn by_iteration(&self, iteration: u64) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.iteration == iteration)
            .cloned()
            .collect()
    }

    pub fn by_kind(&self, kind: &str) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn scheduling(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.event.is_scheduling())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commentary(n: usize) -> OfficeEvent {
        OfficeEvent::Commentary {
            text: format!("note {}", n),
        }
    }

    #[test]
    fn append_and_snapshot() {
        let log = EventLog::new();
        log.append(OfficeEvent::ManagerStarted, 0);
        log.append(commentary(1), 1);
        assert_eq!(log.len(), 2);

        let snapshot = log.snapshot();
        assert_eq!(snapshot[0].kind, "manager_started");
        assert!(snapshot[0].sticky);
        assert_eq!(snapshot[1].iteration, 1);
        assert!(!snapshot[1].sticky);
        assert!(snapshot[0].seq < snapshot[1].seq);
    }

    #[test]
    fn overflow_evicts_oldest_non_sticky() {
        let log = EventLog::with_capacity(4);
        log.append(OfficeEvent::ManagerStarted, 0); // sticky
        log.append(commentary(1), 1);
        log.append(commentary(2), 1);
        log.append(commentary(3), 1);
        log.append(commentary(4), 1); // evicts "note 1"

        assert_eq!(log.len(), 4);
        let kinds: Vec<_> = log.snapshot().iter().map(|e| e.kind).collect();
        assert_eq!(kinds[0], "manager_started");
        let texts: Vec<String> = log
            .snapshot()
            .iter()
            .filter_map(|e| match &e.event {
                OfficeEvent::Commentary { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["note 2", "note 3", "note 4"]);
    }

    #[test]
    fn sticky_entries_survive_heavy_overflow() {
        let log = EventLog::with_capacity(3);
        log.append(OfficeEvent::IterationStarted { iteration: 1 }, 1);
        for n in 0..50 {
            log.append(commentary(n), 1);
        }
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].kind, "iteration_started");
    }

    #[test]
    fn timestamps_never_decrease() {
        let log = EventLog::new();
        for n in 0..100 {
            log.append(commentary(n), 1);
        }
        let snapshot = log.snapshot();
        assert!(snapshot.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[test]
    fn queries_filter() {
        let log = EventLog::new();
        log.append(OfficeEvent::IterationStarted { iteration: 1 }, 1);
        log.append(
            OfficeEvent::TaskQueued {
                task_id: "t1".into(),
                position: 1,
            },
            1,
        );
        log.append(OfficeEvent::IterationStarted { iteration: 2 }, 2);
        log.append(commentary(1), 2);

        assert_eq!(log.by_iteration(1).len(), 2);
        assert_eq!(log.by_iteration(2).len(), 2);
        assert_eq!(log.by_kind("iteration_started").len(), 2);
        let scheduling = log.scheduling();
        assert_eq!(scheduling.len(), 1);
        assert_eq!(scheduling[0].kind, "task_queued");
    }
}
