// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PosSide { Long, Short }

impl PosSide {
    /// Source venue reports BUY/SELL, some endpoints LONG/SHORT.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Some(PosSide::Long),
            "SELL" | "SHORT" => Some(PosSide::Short),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str { match self { PosSide::Long => "LONG", PosSide::Short => "SHORT" } }
}

/// Join key between source and mirror state. Exact match only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey { pub instrument: String, pub side: PosSide }

impl PositionKey {
    pub fn new(instrument: impl Into<String>, side: PosSide) -> Self {
        Self { instrument: instrument.into(), side }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.instrument, self.side.as_str())
    }
}

/// One open position line as reported by the source venue.
/// `opened_at` is the source's creation marker for this position instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow { pub key: PositionKey, pub quantity: Decimal, pub opened_at: Option<String>, pub ts_ms: i64 }

impl SnapshotRow {
    pub fn new(key: PositionKey, quantity: Decimal) -> Self {
        Self { key, quantity, opened_at: None, ts_ms: chrono::Utc::now().timestamp_millis() }
    }
    pub fn with_opened_at(mut self, marker: impl Into<String>) -> Self {
        self.opened_at = Some(marker.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction { Open, Close }

impl Direction {
    pub fn as_str(&self) -> &'static str { match self { Direction::Open => "open", Direction::Close => "close" } }
}

/// Produced and consumed within one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub key: PositionKey,
    pub direction: Direction,
    pub mirror_lots: Decimal,
    pub desired_quantity: Decimal,
    pub target_lots: Decimal,
    pub observed_lots: Decimal,
}

/// One mirror-side order ticket composing a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket { pub ticket_id: u64, pub lots: Decimal }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenFill { pub ticket_id: u64, pub filled_lots: Decimal, pub price: Decimal }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseFill { pub closed_lots: Decimal, pub price: Decimal }

// Journal entries (lihat recorder.rs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Snapshot { ts_ms: i64, rows: usize, changed: Vec<PositionKey> },
    Intent(Intent),
    Outcome { ts_ms: i64, key: PositionKey, outcome: String },
    Note(String),
}
