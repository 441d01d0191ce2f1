// ===============================
// src/store.rs (Target State Store)
// ===============================
//
// Authoritative desired quantity per (instrument, side), derived from source
// snapshots. A key only drops to zero after `miss_threshold` consecutive
// snapshots without it, so one empty/failed poll can never close anything.
//
// Per-key lifecycle:
//   UNTRACKED -> TRACKED -> MISSING(1..n) -> ZEROED
//   MISSING(n) -> TRACKED   (row is back before threshold)
//   ZEROED     -> TRACKED   (a new position instance shows up)
//
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{PositionKey, SnapshotRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyState {
    Tracked,
    Missing(u32),
    Zeroed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetEntry {
    /// `None` while an adopted orphan has no source quantity yet (hold, never act).
    pub desired_quantity: Option<Decimal>,
    pub miss_streak: u32,
    /// Creation marker of the source position instance last seen for this key.
    pub opened_at: Option<String>,
    zeroed: bool,
    // every miss so far came from a snapshot that really omitted the key
    clean_absence: bool,
    replay_reported: bool,
}

impl TargetEntry {
    fn tracked(qty: Decimal, opened_at: Option<String>) -> Self {
        Self {
            desired_quantity: Some(qty),
            miss_streak: 0,
            opened_at,
            zeroed: false,
            clean_absence: true,
            replay_reported: false,
        }
    }

    pub fn state(&self) -> KeyState {
        if self.zeroed {
            KeyState::Zeroed
        } else if self.miss_streak > 0 {
            KeyState::Missing(self.miss_streak)
        } else {
            KeyState::Tracked
        }
    }
}

/// Result of one `apply_snapshot` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotDelta {
    /// Keys whose desired quantity changed (new, resized, or zeroed).
    pub changed: Vec<PositionKey>,
    /// Subset of `changed` that crossed the miss threshold this time.
    pub zeroed: Vec<PositionKey>,
    /// Rows ignored because they replay an instance that was already closed.
    pub replays_ignored: Vec<PositionKey>,
    /// Subset of `replays_ignored` seen for the first time since the key was zeroed.
    pub replays_first_seen: Vec<PositionKey>,
}

impl SnapshotDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.replays_ignored.is_empty()
    }
}

pub struct TargetStore {
    entries: Mutex<HashMap<PositionKey, TargetEntry>>,
    miss_threshold: u32,
}

impl TargetStore {
    pub fn new(miss_threshold: u32) -> Self {
        Self { entries: Mutex::new(HashMap::new()), miss_threshold: miss_threshold.max(1) }
    }

    pub fn miss_threshold(&self) -> u32 { self.miss_threshold }

    /// Applies one full source snapshot atomically. An empty slice counts as
    /// "every tracked key absent once".
    pub fn apply_snapshot(&self, rows: &[SnapshotRow]) -> SnapshotDelta {
        self.apply(rows, false)
    }

    /// A poll that failed outright. Counts as a miss for every key, like an
    /// empty snapshot, but a key zeroed with any such miss in its streak drops
    /// its creation marker: nothing proved that instance closed, so seeing it
    /// again after the outage tracks it again instead of ignoring it as a replay.
    pub fn apply_failed_fetch(&self) -> SnapshotDelta {
        self.apply(&[], true)
    }

    fn apply(&self, rows: &[SnapshotRow], fetch_failed: bool) -> SnapshotDelta {
        let present = aggregate(rows);
        let mut delta = SnapshotDelta::default();
        let mut entries = self.entries.lock();

        for (key, (qty, marker)) in &present {
            match entries.get_mut(key) {
                Some(e) if e.zeroed && e.opened_at.is_some() && e.opened_at == *marker => {
                    if e.replay_reported {
                        debug!(%key, marker = ?marker, "replay still ignored");
                    } else {
                        warn!(%key, marker = ?marker, "ignored replay of a closed position instance");
                        e.replay_reported = true;
                        delta.replays_first_seen.push(key.clone());
                    }
                    delta.replays_ignored.push(key.clone());
                }
                Some(e) => {
                    if e.desired_quantity != Some(*qty) || e.zeroed {
                        delta.changed.push(key.clone());
                    }
                    if e.miss_streak > 0 && !e.zeroed {
                        debug!(%key, misses = e.miss_streak, "key back before threshold");
                    }
                    *e = TargetEntry::tracked(*qty, marker.clone());
                }
                None => {
                    entries.insert(key.clone(), TargetEntry::tracked(*qty, marker.clone()));
                    delta.changed.push(key.clone());
                }
            }
        }

        for (key, e) in entries.iter_mut() {
            if present.contains_key(key) {
                continue;
            }
            if e.zeroed {
                continue;
            }
            e.miss_streak = e.miss_streak.saturating_add(1);
            if fetch_failed {
                e.clean_absence = false;
            }
            if e.miss_streak >= self.miss_threshold {
                info!(%key, misses = e.miss_streak, clean = e.clean_absence, "absence confirmed, desired -> 0");
                e.desired_quantity = Some(Decimal::ZERO);
                e.zeroed = true;
                if !e.clean_absence {
                    e.opened_at = None;
                }
                delta.changed.push(key.clone());
                delta.zeroed.push(key.clone());
            } else {
                debug!(%key, misses = e.miss_streak, "key absent from snapshot");
            }
        }

        delta.changed.sort();
        delta.zeroed.sort();
        delta.replays_ignored.sort();
        delta.replays_first_seen.sort();
        delta
    }

    /// Starts tracking a key that only exists on the mirror. Its desired
    /// quantity stays unknown until a row arrives or absence is confirmed.
    pub fn adopt_orphan(&self, key: &PositionKey) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(
            key.clone(),
            TargetEntry { desired_quantity: None, ..TargetEntry::tracked(Decimal::ZERO, None) },
        );
        true
    }

    pub fn get(&self, key: &PositionKey) -> Option<TargetEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<PositionKey> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn entries(&self) -> Vec<(PositionKey, TargetEntry)> {
        let mut all: Vec<_> = self.entries.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize { self.entries.lock().len() }

    pub fn is_empty(&self) -> bool { self.entries.lock().is_empty() }
}

/// Sums rows per key (quantity > 0 only) and joins their creation markers.
fn aggregate(rows: &[SnapshotRow]) -> HashMap<PositionKey, (Decimal, Option<String>)> {
    let mut sums: HashMap<PositionKey, (Decimal, Vec<String>)> = HashMap::new();
    for r in rows.iter().filter(|r| r.quantity > Decimal::ZERO) {
        let slot = sums.entry(r.key.clone()).or_insert((Decimal::ZERO, Vec::new()));
        slot.0 += r.quantity;
        if let Some(m) = &r.opened_at {
            slot.1.push(m.clone());
        }
    }
    sums.into_iter()
        .map(|(k, (qty, mut markers))| {
            markers.sort();
            let marker = if markers.is_empty() { None } else { Some(markers.join(",")) };
            (k, (qty, marker))
        })
        .collect()
}
