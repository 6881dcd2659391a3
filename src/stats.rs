//! Per-session detection counts.
//!
//! `CategoryFilter` is the only place that maps detector class ids to
//! categories; the detection adapter and `aggregate` both go through it.
//! Snapshots are keyed by session so concurrent viewers never overwrite each
//! other's counts.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::detect::{Category, Detection};

/// COCO class id for "person".
pub const PERSON_CLASS_ID: u32 = 0;
/// COCO class ids for car, motorcycle, bus and truck.
pub const VEHICLE_CLASS_IDS: [u32; 4] = [2, 3, 5, 7];
/// Minimum detector confidence kept by default.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.4;

/// Class ids of interest plus the confidence threshold.
///
/// Built once at start-up and shared read-only afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct CategoryFilter {
    person_class_id: u32,
    vehicle_class_ids: Vec<u32>,
    threshold: f32,
}

impl CategoryFilter {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!(
                "confidence threshold must be in (0, 1], got {}",
                threshold
            ));
        }
        Ok(Self {
            person_class_id: PERSON_CLASS_ID,
            vehicle_class_ids: VEHICLE_CLASS_IDS.to_vec(),
            threshold,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Category for a raw class id, `None` for classes outside the filter.
    pub fn category_of(&self, class_id: u32) -> Option<Category> {
        if class_id == self.person_class_id {
            Some(Category::Person)
        } else if self.vehicle_class_ids.contains(&class_id) {
            Some(Category::Vehicle)
        } else {
            None
        }
    }

    /// All class ids the detector should report, person first.
    pub fn class_ids(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(1 + self.vehicle_class_ids.len());
        ids.push(self.person_class_id);
        ids.extend_from_slice(&self.vehicle_class_ids);
        ids
    }

    pub fn allows(&self, class_id: u32, confidence: f32) -> bool {
        confidence >= self.threshold && self.category_of(class_id).is_some()
    }
}

impl Default for CategoryFilter {
    fn default() -> Self {
        Self {
            person_class_id: PERSON_CLASS_ID,
            vehicle_class_ids: VEHICLE_CLASS_IDS.to_vec(),
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// Counts for the last fully processed frame of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSnapshot {
    #[serde(rename = "personas")]
    pub person_count: u32,
    #[serde(rename = "vehiculos")]
    pub vehicle_count: u32,
}

impl AggregateSnapshot {
    pub fn new(person_count: u32, vehicle_count: u32) -> Self {
        Self {
            person_count,
            vehicle_count,
        }
    }
}

/// Tally one frame's detections. Pure: not accumulated across frames.
///
/// Categorisation goes through the class id, so a detection whose class is
/// outside the filter is ignored regardless of the category it carries.
pub fn aggregate(detections: &[Detection], filter: &CategoryFilter) -> AggregateSnapshot {
    let mut snapshot = AggregateSnapshot::default();
    for detection in detections {
        match filter.category_of(detection.class_id) {
            Some(Category::Person) => snapshot.person_count += 1,
            Some(Category::Vehicle) => snapshot.vehicle_count += 1,
            None => {}
        }
    }
    snapshot
}

// ----------------------------------------------------------------------------
// Session ids
// ----------------------------------------------------------------------------

const LIVE_SESSION: &str = "live";

/// Identifies one streaming session for the stats endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// The single live-device session.
    pub fn live() -> Self {
        SessionId(LIVE_SESSION.to_string())
    }

    /// Fresh random id for a file session.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        SessionId(hex::encode(bytes))
    }

    /// Parse an id presented by a client.
    pub fn parse(value: &str) -> Result<Self> {
        if value == LIVE_SESSION {
            return Ok(Self::live());
        }
        if value.len() != 16 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(anyhow!("session id must be 'live' or 16 hex digits"));
        }
        Ok(SessionId(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_live(&self) -> bool {
        self.0 == LIVE_SESSION
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Snapshot registry
// ----------------------------------------------------------------------------

type Slot = Arc<Mutex<AggregateSnapshot>>;

/// Latest snapshot per active session.
///
/// The outer lock only guards membership; each session writes its own slot,
/// so a reader waits at most for one copy of a snapshot.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    slots: RwLock<HashMap<SessionId, Slot>>,
}

impl SnapshotRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session with a zeroed snapshot. A stale entry with the same
    /// id is replaced.
    pub fn open(self: &Arc<Self>, id: SessionId) -> SnapshotPublisher {
        let slot: Slot = Arc::new(Mutex::new(AggregateSnapshot::default()));
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), slot.clone());
        SnapshotPublisher {
            id,
            slot,
            registry: Arc::clone(self),
        }
    }

    /// Latest published snapshot, zeroed when the session is unknown.
    pub fn latest(&self, id: &SessionId) -> AggregateSnapshot {
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        match slot {
            Some(slot) => *slot.lock().unwrap_or_else(PoisonError::into_inner),
            None => AggregateSnapshot::default(),
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Active sessions with their snapshots, sorted by id.
    pub fn active(&self) -> Vec<(SessionId, AggregateSnapshot)> {
        let slots: Vec<(SessionId, Slot)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut out: Vec<_> = slots
            .into_iter()
            .map(|(id, slot)| {
                let snapshot = *slot.lock().unwrap_or_else(PoisonError::into_inner);
                (id, snapshot)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn remove_if_owned(&self, id: &SessionId, slot: &Slot) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(id);
        }
    }
}

/// Write side of one session's snapshot. Dropping it unregisters the session.
#[derive(Debug)]
pub struct SnapshotPublisher {
    id: SessionId,
    slot: Slot,
    registry: Arc<SnapshotRegistry>,
}

impl SnapshotPublisher {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Replace the session's snapshot as a whole.
    pub fn publish(&self, snapshot: AggregateSnapshot) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        self.registry.remove_if_owned(&self.id, &self.slot);
    }
}
