// ===============================
// src/engine.rs (Reconciliation Loop)
// ===============================
//
// One pass = for every key in the target store or exposed on the mirror:
//   target   = to_mirror_lots(desired)
//   observed = live read from the mirror (never cached)
//   diff     = target - observed, ignored inside the hysteresis band
//   diff > 0 -> OPEN  ceil(diff/step)*step
//   diff < 0 -> CLOSE min(ceil(-diff/step)*step, observed), largest ticket first
// Keys run concurrently; a key still busy from an earlier pass is skipped.
//
use ahash::AHashSet as HashSet;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::convert::{quantize_up, InstrumentBook};
use crate::domain::{Direction, Event, Intent, PositionKey};
use crate::errors::{ReconcileError, VenueError};
use crate::gateway::MirrorVenue;
use crate::locks::KeyLocks;
use crate::metrics::{
    INTENTS, KEY_ERRORS, OBSERVED_LOTS, ORDERS, PASS_SECONDS, SHORTFALLS, SKIPPED_BUSY, TARGET_LOTS,
};
use crate::notifier::NotifyHandle;
use crate::retry::{with_retry, Exhausted, RetryPolicy};
use crate::store::TargetStore;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileCfg {
    /// Fraction of `lot_step` below which a gap is ignored.
    pub hysteresis_fraction: Decimal,
    pub retry: RetryPolicy,
}

/// What happened to one key in one pass.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    InSync,
    /// Desired quantity unknown (adopted orphan), no action.
    Held,
    /// Previous pass for this key still in flight.
    Busy,
    Opened { lots: Decimal, price: Decimal, ticket_id: u64 },
    Closed { lots: Decimal, price: Decimal },
    Failed(ReconcileError),
}

impl fmt::Display for KeyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOutcome::InSync => write!(f, "in_sync"),
            KeyOutcome::Held => write!(f, "held"),
            KeyOutcome::Busy => write!(f, "busy"),
            KeyOutcome::Opened { lots, price, ticket_id } => write!(f, "opened {lots} @ {price} (ticket {ticket_id})"),
            KeyOutcome::Closed { lots, price } => write!(f, "closed {lots} @ {price}"),
            KeyOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub intents: Vec<Intent>,
    pub outcomes: Vec<(PositionKey, KeyOutcome)>,
}

impl PassReport {
    pub fn outcome(&self, key: &PositionKey) -> Option<&KeyOutcome> {
        self.outcomes.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }

    pub fn count(&self, direction: Direction) -> usize {
        self.intents.iter().filter(|i| i.direction == direction).count()
    }
}

/// Pure decision step. `None` means "leave the key alone this tick".
///
/// Assumes `observed_lots` sits on the `lot_step` grid, as every lot the
/// engine itself opens does. A gap of exactly half a step (the band edge)
/// still acts and orders a full step, which overshoots by half a step. With
/// off-grid mirror exposure that can flip between OPEN and CLOSE every tick;
/// on-grid, gaps are whole steps and one order lands exactly on target.
pub fn plan(
    key: &PositionKey,
    desired_quantity: Decimal,
    target_lots: Decimal,
    observed_lots: Decimal,
    lot_step: Decimal,
    hysteresis_fraction: Decimal,
) -> Option<Intent> {
    let band = lot_step * hysteresis_fraction;
    let diff = target_lots - observed_lots;
    if diff.abs() < band || diff.is_zero() {
        return None;
    }
    let (direction, lots) = if diff > Decimal::ZERO {
        (Direction::Open, quantize_up(diff, lot_step))
    } else {
        (Direction::Close, quantize_up(-diff, lot_step).min(observed_lots))
    };
    if lots <= Decimal::ZERO {
        return None;
    }
    Some(Intent {
        key: key.clone(),
        direction,
        mirror_lots: lots,
        desired_quantity,
        target_lots,
        observed_lots,
    })
}

pub struct Reconciler {
    store: Arc<TargetStore>,
    book: Arc<InstrumentBook>,
    venue: Arc<dyn MirrorVenue>,
    locks: KeyLocks,
    notify: NotifyHandle,
    journal: Option<mpsc::Sender<Event>>,
    cfg: ReconcileCfg,
    // instruments already reported as unmapped
    unmapped_seen: Mutex<HashSet<String>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<TargetStore>,
        book: Arc<InstrumentBook>,
        venue: Arc<dyn MirrorVenue>,
        notify: NotifyHandle,
        cfg: ReconcileCfg,
    ) -> Self {
        Self {
            store,
            book,
            venue,
            locks: KeyLocks::new(),
            notify,
            journal: None,
            cfg,
            unmapped_seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<TargetStore> { &self.store }

    pub fn locks(&self) -> &KeyLocks { &self.locks }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }

    /// Keys from the store plus any mirror exposure we do not track yet
    /// (adopted as orphans).
    async fn pass_keys(&self) -> Vec<PositionKey> {
        let mut keys = self.store.keys();
        match self.venue.exposed_keys().await {
            Ok(exposed) => {
                for k in exposed {
                    if self.store.adopt_orphan(&k) {
                        warn!(key = %k, "mirror exposure without source row, adopted as orphan");
                        self.notify.warn(format!("orphan {k} on mirror: holding until absence is confirmed"));
                        keys.push(k);
                    }
                }
            }
            Err(e) => warn!(error = %e, "exposed_keys failed, reconciling tracked keys only"),
        }
        keys.sort();
        keys.dedup();
        keys
    }

    pub async fn run_pass(&self) -> PassReport {
        let started = Instant::now();
        let keys = self.pass_keys().await;
        let results = join_all(keys.iter().map(|k| self.reconcile_key(k))).await;

        let mut report = PassReport::default();
        for (key, (intent, outcome)) in keys.into_iter().zip(results) {
            if let KeyOutcome::Failed(e) = &outcome {
                KEY_ERRORS.with_label_values(&[e.kind()]).inc();
            }
            if !matches!(outcome, KeyOutcome::InSync | KeyOutcome::Held) {
                self.record(Event::Outcome {
                    ts_ms: chrono::Utc::now().timestamp_millis(),
                    key: key.clone(),
                    outcome: outcome.to_string(),
                });
            }
            if let Some(i) = intent {
                report.intents.push(i);
            }
            report.outcomes.push((key, outcome));
        }
        PASS_SECONDS.observe(started.elapsed().as_secs_f64());
        debug!(keys = report.outcomes.len(), intents = report.intents.len(), "reconcile pass done");
        report
    }

    async fn reconcile_key(&self, key: &PositionKey) -> (Option<Intent>, KeyOutcome) {
        let Some(_guard) = self.locks.try_acquire(key) else {
            SKIPPED_BUSY.inc();
            debug!(%key, "still in flight, skipped");
            return (None, KeyOutcome::Busy);
        };

        let Some(desired) = self.store.get(key).and_then(|e| e.desired_quantity) else {
            debug!(%key, "desired quantity unknown, holding");
            return (None, KeyOutcome::Held);
        };

        let spec = match self.book.spec(&key.instrument) {
            Ok(s) => s,
            Err(e) => {
                if self.unmapped_seen.lock().insert(key.instrument.clone()) {
                    warn!(%key, "no instrument metadata, key skipped");
                    self.notify.warn(format!("{key}: no instrument metadata, not mirrored"));
                } else {
                    debug!(%key, "no instrument metadata");
                }
                return (None, KeyOutcome::Failed(e.into()));
            }
        };
        let target = spec.lots_for(desired, self.book.leverage());

        let observed = match self.venue.observed_lots(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%key, error = %e, "observed lots unavailable");
                let err = ReconcileError::MirrorUnavailable { key: key.clone(), reason: e.to_string() };
                return (None, KeyOutcome::Failed(err));
            }
        };
        let label = key.to_string();
        TARGET_LOTS.with_label_values(&[&label]).set(target.to_f64().unwrap_or(0.0));
        OBSERVED_LOTS.with_label_values(&[&label]).set(observed.to_f64().unwrap_or(0.0));

        let Some(intent) = plan(key, desired, target, observed, spec.lot_step, self.cfg.hysteresis_fraction) else {
            debug!(%key, %target, %observed, "in sync");
            return (None, KeyOutcome::InSync);
        };

        INTENTS.with_label_values(&[intent.direction.as_str()]).inc();
        info!(
            %key,
            direction = intent.direction.as_str(),
            lots = %intent.mirror_lots,
            %target,
            %observed,
            "intent"
        );
        self.record(Event::Intent(intent.clone()));

        let outcome = match intent.direction {
            Direction::Open => self.execute_open(&intent, &spec.mirror_symbol).await,
            Direction::Close => self.execute_close(&intent, &spec.mirror_symbol).await,
        };
        (Some(intent), outcome)
    }

    async fn execute_open(&self, intent: &Intent, symbol: &str) -> KeyOutcome {
        let venue = &self.venue;
        let key = &intent.key;
        let lots = intent.mirror_lots;
        let res = with_retry(self.cfg.retry, "open", VenueError::is_retryable, move || venue.open(key, lots)).await;

        match res {
            Ok(fill) => {
                ORDERS.with_label_values(&["open", "ok"]).inc();
                info!(%key, lots = %fill.filled_lots, price = %fill.price, ticket = fill.ticket_id, "OPEN done");
                self.notify.info(format!(
                    "OPEN {symbol} {} {} lots @ {} (ticket {})",
                    key.side.as_str(),
                    fill.filled_lots,
                    fill.price,
                    fill.ticket_id
                ));
                KeyOutcome::Opened { lots: fill.filled_lots, price: fill.price, ticket_id: fill.ticket_id }
            }
            Err(ex) => KeyOutcome::Failed(self.submission_failed(key, Direction::Open, ex)),
        }
    }

    async fn execute_close(&self, intent: &Intent, symbol: &str) -> KeyOutcome {
        let key = &intent.key;
        let requested = intent.mirror_lots;

        let mut tickets = match self.venue.list_tickets(key).await {
            Ok(t) => t,
            Err(e) => {
                warn!(%key, error = %e, "list_tickets failed");
                return KeyOutcome::Failed(ReconcileError::MirrorUnavailable { key: key.clone(), reason: e.to_string() });
            }
        };
        // largest first; ties by ticket id so the order is stable
        tickets.sort_by(|a, b| b.lots.cmp(&a.lots).then(a.ticket_id.cmp(&b.ticket_id)));

        let mut remaining = requested;
        let mut closed = Decimal::ZERO;
        let mut last_price = None;
        let mut failure = None;
        for t in tickets {
            if remaining <= Decimal::ZERO {
                break;
            }
            let want = remaining.min(t.lots);
            let venue = &self.venue;
            let ticket_id = t.ticket_id;
            let res =
                with_retry(self.cfg.retry, "close", VenueError::is_retryable, move || venue.close(key, ticket_id, want))
                    .await;
            match res {
                Ok(fill) => {
                    ORDERS.with_label_values(&["close", "ok"]).inc();
                    debug!(%key, ticket = ticket_id, closed = %fill.closed_lots, "ticket closed");
                    closed += fill.closed_lots;
                    remaining -= fill.closed_lots;
                    last_price = Some(fill.price);
                }
                Err(ex) => {
                    failure = Some(self.submission_failed(key, Direction::Close, ex));
                    break;
                }
            }
        }

        if let Some(price) = last_price.filter(|_| closed > Decimal::ZERO) {
            info!(%key, %closed, %requested, %price, "CLOSE done");
            self.notify.info(format!("CLOSE {symbol} {} {closed} lots @ {price}", key.side.as_str()));
        }
        if let Some(err) = failure {
            return KeyOutcome::Failed(err);
        }
        match last_price {
            Some(price) if closed >= requested => KeyOutcome::Closed { lots: closed, price },
            _ => {
                SHORTFALLS.inc();
                warn!(%key, %requested, %closed, "close shortfall, not compensated");
                self.notify.warn(format!("{key}: close shortfall, requested {requested} lots, closed {closed}"));
                KeyOutcome::Failed(ReconcileError::PartialCloseShortfall { key: key.clone(), requested, closed })
            }
        }
    }

    fn submission_failed(&self, key: &PositionKey, direction: Direction, ex: Exhausted<VenueError>) -> ReconcileError {
        let dir = direction.as_str();
        match ex.error {
            VenueError::QuoteUnavailable(instr) => {
                ORDERS.with_label_values(&[dir, "no_quote"]).inc();
                warn!(%key, direction = dir, "no live quote, key aborted this tick");
                ReconcileError::QuoteUnavailable(instr)
            }
            other => {
                ORDERS.with_label_values(&[dir, "rejected"]).inc();
                error!(%key, direction = dir, attempts = ex.attempts, error = %other, "submission abandoned this tick");
                self.notify.warn(format!(
                    "{} {key} rejected after {} attempt(s): {other}",
                    dir.to_ascii_uppercase(),
                    ex.attempts
                ));
                ReconcileError::OrderRejected { key: key.clone(), attempts: ex.attempts, reason: other.to_string() }
            }
        }
    }

    /// Target vs observed for every key, without acting.
    pub async fn sync_report(&self) -> SyncReport {
        let mut report = SyncReport { ts_ms: chrono::Utc::now().timestamp_millis(), ..Default::default() };
        let mut seen = HashSet::new();

        for (key, entry) in self.store.entries() {
            let desired = match entry.desired_quantity {
                Some(q) if q > Decimal::ZERO => q,
                _ => continue,
            };
            seen.insert(key.clone());
            report.tracked += 1;
            let spec = match self.book.spec(&key.instrument) {
                Ok(s) => s,
                Err(_) => {
                    report.issues.push(SyncIssue::new(key, IssueKind::Unmapped, Decimal::ZERO, Decimal::ZERO));
                    continue;
                }
            };
            let target = spec.lots_for(desired, self.book.leverage());
            let observed = match self.venue.observed_lots(&key).await {
                Ok(v) => v,
                Err(_) => {
                    report.issues.push(SyncIssue::new(key, IssueKind::Unreadable, target, Decimal::ZERO));
                    continue;
                }
            };
            let band = spec.lot_step * self.cfg.hysteresis_fraction;
            if observed.is_zero() {
                report.issues.push(SyncIssue::new(key, IssueKind::MissingOnMirror, target, observed));
            } else if (target - observed).abs() >= band {
                report.issues.push(SyncIssue::new(key, IssueKind::LotDrift, target, observed));
            } else {
                report.matched += 1;
            }
        }
        report.mismatched = report.tracked - report.matched;

        if let Ok(exposed) = self.venue.exposed_keys().await {
            for key in exposed.into_iter().filter(|k| !seen.contains(k)) {
                let observed = self.venue.observed_lots(&key).await.unwrap_or(Decimal::ZERO);
                report.issues.push(SyncIssue::new(key, IssueKind::OnlyOnMirror, Decimal::ZERO, observed));
            }
        }
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    MissingOnMirror,
    OnlyOnMirror,
    LotDrift,
    Unmapped,
    Unreadable,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::MissingOnMirror => "missing on mirror",
            IssueKind::OnlyOnMirror => "only on mirror",
            IssueKind::LotDrift => "lot drift",
            IssueKind::Unmapped => "no instrument metadata",
            IssueKind::Unreadable => "mirror unreadable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncIssue {
    pub key: PositionKey,
    pub kind: IssueKind,
    pub target_lots: Decimal,
    pub observed_lots: Decimal,
}

impl SyncIssue {
    fn new(key: PositionKey, kind: IssueKind, target_lots: Decimal, observed_lots: Decimal) -> Self {
        Self { key, kind, target_lots, observed_lots }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub ts_ms: i64,
    /// Keys with a nonzero desired quantity.
    pub tracked: usize,
    pub matched: usize,
    pub mismatched: usize,
    pub issues: Vec<SyncIssue>,
}

impl SyncReport {
    /// Percent of tracked keys in sync; 100 when nothing is tracked.
    pub fn sync_rate(&self) -> Decimal {
        if self.tracked == 0 {
            return Decimal::ONE_HUNDRED;
        }
        (Decimal::from(self.matched) * Decimal::ONE_HUNDRED / Decimal::from(self.tracked)).round_dp(2)
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sync {}/{} matched ({}%), {} mismatched, {} issue(s)",
            self.matched,
            self.tracked,
            self.sync_rate(),
            self.mismatched,
            self.issues.len()
        )?;
        for i in &self.issues {
            write!(f, "\n  - {}: {} (target {}, observed {})", i.key, i.kind.as_str(), i.target_lots, i.observed_lots)?;
        }
        Ok(())
    }
}
