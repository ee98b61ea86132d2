//! Structured lifecycle records for region-level allocator events.
//!
//! Allocators only record events that change their mapped footprint or list
//! layout (a region was mapped, re-filed, reset, a table grew). Per-allocation
//! events are never logged. Recording is off unless enabled in
//! [`KnightConfig`](crate::config::KnightConfig).
//!
//! The log is a ring: once it holds its capacity, each new record evicts the
//! oldest one. Hosts that need the full history drain it periodically.

use std::collections::VecDeque;

/// Records kept by a log built with [`LifecycleLog::new`].
pub const DEFAULT_LIFECYCLE_CAPACITY: usize = 1024;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRecord {
    /// Monotonic id within the owning allocator.
    pub decision_id: u64,
    /// `knight::<component>::<event>::<id>` correlation id.
    pub trace_id: String,
    pub level: LifecycleLevel,
    /// `page`, `lump`, `code_cache` or `hash_table`.
    pub component: &'static str,
    /// `region_mapped`, `region_refiled`, `map_failed`, `reset`, ...
    pub event: &'static str,
    /// Base address involved in the event, if any.
    pub addr: Option<usize>,
    /// Byte or entry count involved in the event, if any.
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form `key=value;...` details.
    pub details: String,
}

/// Per-allocator lifecycle log.
#[derive(Debug, Clone)]
pub struct LifecycleLog {
    component: &'static str,
    enabled: bool,
    next_decision_id: u64,
    capacity: usize,
    evicted: u64,
    records: VecDeque<LifecycleRecord>,
}

impl LifecycleLog {
    #[must_use]
    pub fn new(component: &'static str, enabled: bool) -> Self {
        Self::with_capacity(component, enabled, DEFAULT_LIFECYCLE_CAPACITY)
    }

    /// A log that keeps at most `capacity` records (at least one).
    #[must_use]
    pub fn with_capacity(component: &'static str, enabled: bool, capacity: usize) -> Self {
        Self {
            component,
            enabled,
            next_decision_id: 1,
            capacity: capacity.max(1),
            evicted: 0,
            records: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records pushed out of the ring since the log was created.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Append a record. `details` is only evaluated when recording is on.
    pub fn record<D: Into<String>>(
        &mut self,
        level: LifecycleLevel,
        event: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
        details: impl FnOnce() -> D,
    ) {
        if !self.enabled {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.evicted += 1;
        }
        self.records.push_back(LifecycleRecord {
            decision_id,
            trace_id: format!("knight::{}::{}::{:016x}", self.component, event, decision_id),
            level,
            component: self.component,
            event,
            addr,
            size,
            outcome,
            details: details().into(),
        });
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> impl ExactSizeIterator<Item = &LifecycleRecord> + '_ {
        self.records.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take every record, leaving the log empty.
    pub fn drain(&mut self) -> Vec<LifecycleRecord> {
        self.records.drain(..).collect()
    }

    /// Records whose event matches `event`.
    pub fn events<'a>(&'a self, event: &'a str) -> impl Iterator<Item = &'a LifecycleRecord> + 'a {
        self.records.iter().filter(move |r| r.event == event)
    }
}
