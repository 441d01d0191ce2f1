// ===============================
// src/errors.rs
// ===============================
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::PositionKey;

/// Per-key failures. None of these stop the loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReconcileError {
    #[error("no size metadata for instrument {0}")]
    UnmappedInstrument(String),
    #[error("no live quote for {0}")]
    QuoteUnavailable(String),
    #[error("order rejected for {key} after {attempts} attempt(s): {reason}")]
    OrderRejected { key: PositionKey, attempts: u32, reason: String },
    #[error("close shortfall on {key}: requested {requested}, closed {closed}")]
    PartialCloseShortfall { key: PositionKey, requested: Decimal, closed: Decimal },
    #[error("snapshot fetch failed: {0}")]
    SnapshotFetchFailed(String),
    #[error("mirror venue unavailable for {key}: {reason}")]
    MirrorUnavailable { key: PositionKey, reason: String },
}

impl ReconcileError {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::UnmappedInstrument(_) => "unmapped_instrument",
            ReconcileError::QuoteUnavailable(_) => "quote_unavailable",
            ReconcileError::OrderRejected { .. } => "order_rejected",
            ReconcileError::PartialCloseShortfall { .. } => "close_shortfall",
            ReconcileError::SnapshotFetchFailed(_) => "snapshot_fetch_failed",
            ReconcileError::MirrorUnavailable { .. } => "mirror_unavailable",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VenueError {
    #[error("no quote for {0}")]
    QuoteUnavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl VenueError {
    /// A missing quote will not change within the tick; everything else may.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, VenueError::QuoteUnavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("decode: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConvertError {
    #[error("no size metadata for instrument {0}")]
    UnmappedInstrument(String),
}

impl From<ConvertError> for ReconcileError {
    fn from(e: ConvertError) -> Self {
        match e {
            ConvertError::UnmappedInstrument(i) => ReconcileError::UnmappedInstrument(i),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("instruments file {path}: {reason}")]
    Instruments { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook: {0}")]
    Webhook(#[from] reqwest::Error),
    #[error("webhook status {0}")]
    Status(u16),
}
