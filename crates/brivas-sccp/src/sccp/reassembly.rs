//! Reassembly of segmented XUDT messages (Q.714 4.1.1)
//!
//! One partial message per key. Admission and timer eviction both go through
//! the map's entry lock for the key, so a segment is never admitted into an
//! entry that is being evicted.

use crate::config::ReassemblyConfig;
use crate::errors::{Result, SccpError};
use crate::timer::{TimerHandle, TimerService};
use crate::types::{PointCode, Segmentation, Sls};
use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Identifies one segmented message in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReassemblyKey {
    pub opc: PointCode,
    pub sls: Sls,
    /// Segmentation local reference
    pub local_reference: u32,
}

/// Result of admitting a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// All segments present; the reassembled user data
    Complete(Bytes),
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// A partial message was discarded before completion
    Timeout { key: ReassemblyKey },
}

/// Where a segment sits in its message
#[derive(Debug, Clone, Copy)]
enum Position {
    Numbered { number: u32, more_data: bool },
    /// XUDT first segment: `remaining` segments follow
    First { remaining: u32 },
    /// XUDT later segment: `remaining` segments follow
    Following { remaining: u32 },
}

struct PartialMessage {
    segments: BTreeMap<u32, Bytes>,
    /// Number of the last segment, once seen
    terminal: Option<u32>,
    /// Segment count announced by an XUDT first segment
    total: Option<u32>,
    length: usize,
    generation: u64,
    timer: Option<TimerHandle>,
}

impl PartialMessage {
    fn new(generation: u64) -> Self {
        Self {
            segments: BTreeMap::new(),
            terminal: None,
            total: None,
            length: 0,
            generation,
            timer: None,
        }
    }

    /// Add a segment, returning true when the message is complete
    fn insert(&mut self, number: u32, more_data: bool, payload: Bytes, max_length: usize) -> Result<bool> {
        if let Some(terminal) = self.terminal {
            if number > terminal {
                return Err(SccpError::SegmentationMismatch(format!(
                    "segment {} after last segment {}",
                    number, terminal
                )));
            }
            if !more_data && number != terminal {
                return Err(SccpError::SegmentationMismatch(format!(
                    "second last segment {} (last was {})",
                    number, terminal
                )));
            }
        } else if !more_data {
            if let Some((&highest, _)) = self.segments.last_key_value() {
                if highest > number {
                    return Err(SccpError::SegmentationMismatch(format!(
                        "last segment {} below received segment {}",
                        number, highest
                    )));
                }
            }
        }

        if self.segments.contains_key(&number) {
            // Retransmission
            return Ok(false);
        }

        let length = self.length + payload.len();
        if length > max_length {
            return Err(SccpError::SegmentationMismatch(format!(
                "reassembled length {} exceeds {}",
                length, max_length
            )));
        }

        self.length = length;
        self.segments.insert(number, payload);
        if !more_data {
            self.terminal = Some(number);
        }

        Ok(self
            .terminal
            .map_or(false, |terminal| self.segments.len() as u64 == terminal as u64 + 1))
    }

    fn assemble(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.length);
        for segment in self.segments.into_values() {
            buf.extend_from_slice(&segment);
        }
        buf.freeze()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Sequence number for an XUDT segment
    fn resolve(&self, position: Position) -> Result<(u32, bool)> {
        match position {
            Position::Numbered { number, more_data } => Ok((number, more_data)),
            Position::First { remaining } => {
                if self.total.map_or(false, |total| total != remaining + 1) {
                    return Err(SccpError::SegmentationMismatch(
                        "first segment announces a different segment count".to_string(),
                    ));
                }
                Ok((0, remaining > 0))
            }
            Position::Following { remaining } => {
                let total = self.total.ok_or_else(|| {
                    SccpError::SegmentationMismatch("no first segment received".to_string())
                })?;
                if remaining + 1 >= total {
                    return Err(SccpError::SegmentationMismatch(format!(
                        "{} remaining segments out of {}",
                        remaining, total
                    )));
                }
                Ok((total - 1 - remaining, remaining > 0))
            }
        }
    }
}

/// Bounded cache of partially received messages
pub struct ReassemblyCache {
    entries: DashMap<ReassemblyKey, PartialMessage>,
    in_progress: AtomicUsize,
    next_generation: AtomicU64,
    max_entries: usize,
    max_length: usize,
    timers: Arc<dyn TimerService>,
    events: mpsc::Sender<ReassemblyEvent>,
}

impl ReassemblyCache {
    pub fn new(
        config: &ReassemblyConfig,
        timers: Arc<dyn TimerService>,
        events: mpsc::Sender<ReassemblyEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            in_progress: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
            max_entries: config.max_entries,
            max_length: config.max_message_length,
            timers,
            events,
        })
    }

    /// Admit segment `segment_number` of the message identified by `key`.
    ///
    /// The segment with `more_data == false` is the last one. The first
    /// segment of a new key schedules eviction at `deadline`.
    pub fn admit_segment(
        self: &Arc<Self>,
        key: ReassemblyKey,
        segment_number: u32,
        more_data: bool,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Admission> {
        self.admit(
            key,
            Position::Numbered { number: segment_number, more_data },
            payload,
            deadline,
        )
    }

    /// Admit a segment described by an XUDT segmentation parameter
    pub fn admit_xudt_segment(
        self: &Arc<Self>,
        key: ReassemblyKey,
        segmentation: &Segmentation,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Admission> {
        let remaining = segmentation.remaining_segments as u32;
        let position = if segmentation.first {
            Position::First { remaining }
        } else {
            Position::Following { remaining }
        };
        self.admit(key, position, payload, deadline)
    }

    fn admit(
        self: &Arc<Self>,
        key: ReassemblyKey,
        position: Position,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Admission> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let outcome = occupied
                    .get()
                    .resolve(position)
                    .and_then(|(number, more_data)| {
                        occupied.get_mut().insert(number, more_data, payload, self.max_length)
                    });
                match outcome {
                    Ok(false) => Ok(Admission::Pending),
                    Ok(true) => {
                        let mut partial = occupied.remove();
                        partial.cancel_timer();
                        self.release();
                        metrics::counter!("sccp_reassembly_completed").increment(1);
                        debug!(?key, length = partial.length, "Reassembly complete");
                        Ok(Admission::Complete(partial.assemble()))
                    }
                    Err(e) => {
                        let mut partial = occupied.remove();
                        partial.cancel_timer();
                        self.release();
                        metrics::counter!("sccp_reassembly_failures").increment(1);
                        warn!(?key, error = %e, "Reassembly discarded");
                        Err(e)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if let Position::Following { .. } = position {
                    return Err(SccpError::SegmentationMismatch(
                        "no first segment received".to_string(),
                    ));
                }
                self.reserve()?;

                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let mut partial = PartialMessage::new(generation);
                if let Position::First { remaining } = position {
                    partial.total = Some(remaining + 1);
                }

                let outcome = partial
                    .resolve(position)
                    .and_then(|(number, more_data)| {
                        partial.insert(number, more_data, payload, self.max_length)
                    });
                match outcome {
                    Ok(false) => {
                        partial.timer = Some(self.schedule_eviction(key, generation, deadline));
                        vacant.insert(partial);
                        debug!(?key, "Reassembly started");
                        Ok(Admission::Pending)
                    }
                    Ok(true) => {
                        self.release();
                        Ok(Admission::Complete(partial.assemble()))
                    }
                    Err(e) => {
                        self.release();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Discard the partial message for `key`. Returns false if there was none.
    pub fn evict(&self, key: &ReassemblyKey) -> bool {
        match self.entries.remove(key) {
            Some((key, mut partial)) => {
                partial.cancel_timer();
                self.release();
                self.report_timeout(key);
                true
            }
            None => false,
        }
    }

    fn expire(&self, key: ReassemblyKey, generation: u64) {
        if self
            .entries
            .remove_if(&key, |_, partial| partial.generation == generation)
            .is_some()
        {
            self.release();
            self.report_timeout(key);
        }
    }

    fn report_timeout(&self, key: ReassemblyKey) {
        metrics::counter!("sccp_reassembly_timeouts").increment(1);
        warn!(?key, "Reassembly timed out");
        if self.events.try_send(ReassemblyEvent::Timeout { key }).is_err() {
            debug!(?key, "Reassembly event dropped");
        }
    }

    fn schedule_eviction(self: &Arc<Self>, key: ReassemblyKey, generation: u64, deadline: Instant) -> TimerHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        self.timers.schedule_at(
            deadline,
            Box::new(move || {
                if let Some(cache) = cache.upgrade() {
                    cache.expire(key, generation);
                }
            }),
        )
    }

    fn reserve(&self) -> Result<()> {
        self.in_progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_entries).then_some(n + 1)
            })
            .map(|n| metrics::gauge!("sccp_reassembly_in_progress").set((n + 1) as f64))
            .map_err(|_| SccpError::ReassemblyCacheFull(self.max_entries))
    }

    fn release(&self) {
        let n = self.in_progress.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::gauge!("sccp_reassembly_in_progress").set(n as f64);
    }

    /// Drop every partial message and cancel its timer, without events
    pub fn clear(&self) {
        self.entries.retain(|_, partial| {
            partial.cancel_timer();
            self.in_progress.fetch_sub(1, Ordering::AcqRel);
            false
        });
    }

    /// Partial messages in progress
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ReassemblyKey) -> bool {
        self.entries.contains_key(key)
    }
}
