//! Remote signalling point and subsystem status
//!
//! Records are kept in an arena indexed by point code or (point code, SSN).
//! Each record has its own lock so transitions on one entity never wait on
//! another. Records are created on first reference and never removed.

use crate::timer::TimerHandle;
use crate::types::PointCode;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Signalling point availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalingPointState {
    Allowed,
    Restricted,
    Prohibited,
}

/// Remote subsystem availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubsystemState {
    Allowed,
    Prohibited,
}

/// Point-in-time view of a signalling point record
#[derive(Debug, Clone, Serialize)]
pub struct SignalingPointStatus {
    pub point_code: PointCode,
    pub state: SignalingPointState,
    pub congestion_level: u8,
    pub last_change: DateTime<Utc>,
    /// Local subsystems concerned with this point code
    pub concerned: Vec<u8>,
}

/// Point-in-time view of a remote subsystem record
#[derive(Debug, Clone, Serialize)]
pub struct SubsystemStatus {
    pub point_code: PointCode,
    pub ssn: u8,
    pub state: SubsystemState,
    pub last_change: DateTime<Utc>,
    pub consecutive_test_failures: u32,
}

/// Mutable signalling point record
#[derive(Debug)]
pub struct SignalingPointRecord {
    pub point_code: PointCode,
    pub state: SignalingPointState,
    pub congestion_level: u8,
    pub last_change: DateTime<Utc>,
}

impl SignalingPointRecord {
    fn new(point_code: PointCode) -> Self {
        Self {
            point_code,
            state: SignalingPointState::Allowed,
            congestion_level: 0,
            last_change: Utc::now(),
        }
    }

    /// Apply a transition, returning true if the state changed
    pub fn transition(&mut self, state: SignalingPointState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.last_change = Utc::now();
        true
    }
}

/// Mutable remote subsystem record
#[derive(Debug)]
pub struct SubsystemRecord {
    pub point_code: PointCode,
    pub ssn: u8,
    pub state: SubsystemState,
    pub last_change: DateTime<Utc>,
    /// Unanswered status tests since the subsystem became prohibited
    pub consecutive_test_failures: u32,
    /// A status test was sent and nothing has answered it yet
    pub test_outstanding: bool,
    /// Interval until the next status test
    pub test_interval: Duration,
    /// Pending status test, if any
    pub test_timer: Option<TimerHandle>,
    /// Bumped on every transition; stale timers compare against it
    pub generation: u64,
    /// Prohibited as a consequence of its signalling point becoming prohibited
    pub prohibited_by_point_code: bool,
}

impl SubsystemRecord {
    fn new(point_code: PointCode, ssn: u8) -> Self {
        Self {
            point_code,
            ssn,
            state: SubsystemState::Allowed,
            last_change: Utc::now(),
            consecutive_test_failures: 0,
            test_outstanding: false,
            test_interval: Duration::ZERO,
            test_timer: None,
            generation: 0,
            prohibited_by_point_code: false,
        }
    }

    /// Apply a transition, returning true if the state changed
    pub fn transition(&mut self, state: SubsystemState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.last_change = Utc::now();
        self.generation += 1;
        self.consecutive_test_failures = 0;
        self.test_outstanding = false;
        true
    }

    /// Cancel the pending status test
    pub fn cancel_test(&mut self) {
        if let Some(timer) = self.test_timer.take() {
            timer.cancel();
        }
    }

    pub fn snapshot(&self) -> SubsystemStatus {
        SubsystemStatus {
            point_code: self.point_code,
            ssn: self.ssn,
            state: self.state,
            last_change: self.last_change,
            consecutive_test_failures: self.consecutive_test_failures,
        }
    }
}

/// Arena of remote status records
#[derive(Default)]
pub struct RemoteStatusTable {
    points: DashMap<PointCode, Arc<Mutex<SignalingPointRecord>>>,
    subsystems: DashMap<(PointCode, u8), Arc<Mutex<SubsystemRecord>>>,
}

impl RemoteStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `pc`, created on first reference
    pub fn point(&self, pc: PointCode) -> Arc<Mutex<SignalingPointRecord>> {
        self.points
            .entry(pc)
            .or_insert_with(|| Arc::new(Mutex::new(SignalingPointRecord::new(pc))))
            .clone()
    }

    /// Record for (`pc`, `ssn`), created on first reference
    pub fn subsystem(&self, pc: PointCode, ssn: u8) -> Arc<Mutex<SubsystemRecord>> {
        self.subsystems
            .entry((pc, ssn))
            .or_insert_with(|| Arc::new(Mutex::new(SubsystemRecord::new(pc, ssn))))
            .clone()
    }

    /// Current state without creating a record; unknown points are Allowed
    pub fn point_state(&self, pc: PointCode) -> SignalingPointState {
        self.existing_point(pc)
            .map(|record| record.lock().state)
            .unwrap_or(SignalingPointState::Allowed)
    }

    /// Current state without creating a record; unknown subsystems are Allowed
    pub fn subsystem_state(&self, pc: PointCode, ssn: u8) -> SubsystemState {
        self.existing_subsystem(pc, ssn)
            .map(|record| record.lock().state)
            .unwrap_or(SubsystemState::Allowed)
    }

    pub fn is_point_prohibited(&self, pc: PointCode) -> bool {
        self.point_state(pc) == SignalingPointState::Prohibited
    }

    /// Known subsystem records at `pc`
    pub fn subsystems_at(&self, pc: PointCode) -> Vec<Arc<Mutex<SubsystemRecord>>> {
        self.subsystems
            .iter()
            .filter(|entry| entry.key().0 == pc)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All subsystem records
    pub fn all_subsystems(&self) -> Vec<Arc<Mutex<SubsystemRecord>>> {
        self.subsystems.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn point_snapshot(&self, pc: PointCode) -> Option<(SignalingPointState, u8, DateTime<Utc>)> {
        self.existing_point(pc).map(|record| {
            let record = record.lock();
            (record.state, record.congestion_level, record.last_change)
        })
    }

    pub fn subsystem_snapshot(&self, pc: PointCode, ssn: u8) -> Option<SubsystemStatus> {
        self.existing_subsystem(pc, ssn).map(|record| record.lock().snapshot())
    }

    // The shard guard is released before the record lock is taken, so a
    // caller holding a record lock may still create records.
    fn existing_point(&self, pc: PointCode) -> Option<Arc<Mutex<SignalingPointRecord>>> {
        self.points.get(&pc).map(|record| record.value().clone())
    }

    fn existing_subsystem(&self, pc: PointCode, ssn: u8) -> Option<Arc<Mutex<SubsystemRecord>>> {
        self.subsystems.get(&(pc, ssn)).map(|record| record.value().clone())
    }
}
