// ===============================
// src/scheduler.rs (periodic tasks)
// ===============================
//
// Three independent tickers share the target store and the mirror venue:
//   ingest    : fetch snapshot -> apply to store (failed fetch = empty snapshot)
//   reconcile : one pass per tick, spawned so a slow key never delays the next
//               tick (its key lock makes the next pass skip it instead)
//   sync      : optional periodic sync report through the notifier
// All of them stop at the next tick boundary once shutdown flips to true.
//
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::Event;
use crate::engine::{PassReport, Reconciler};
use crate::errors::ReconcileError;
use crate::metrics::{MISS_STREAK, REPLAYS_IGNORED, SNAPSHOTS, SNAPSHOT_ROWS, TRACKED_KEYS};
use crate::notifier::NotifyHandle;
use crate::source::SnapshotProvider;
use crate::store::{KeyState, SnapshotDelta, TargetStore};

pub struct Ingestor {
    source: Arc<dyn SnapshotProvider>,
    store: Arc<TargetStore>,
    notify: NotifyHandle,
    journal: Option<mpsc::Sender<Event>>,
}

impl Ingestor {
    pub fn new(source: Arc<dyn SnapshotProvider>, store: Arc<TargetStore>, notify: NotifyHandle) -> Self {
        Self { source, store, notify, journal: None }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    /// One fetch + apply. A failed fetch feeds the miss counter exactly like
    /// an empty snapshot; the threshold is what keeps it from closing anything.
    pub async fn tick(&self) -> SnapshotDelta {
        let (rows, delta) = match self.source.fetch_open_positions().await {
            Ok(rows) => {
                SNAPSHOTS.with_label_values(&["ok"]).inc();
                SNAPSHOT_ROWS.set(rows.len() as i64);
                let delta = self.store.apply_snapshot(&rows);
                (rows.len(), delta)
            }
            Err(e) => {
                SNAPSHOTS.with_label_values(&["failed"]).inc();
                let err = ReconcileError::SnapshotFetchFailed(e.to_string());
                warn!(error = %err, "treating this tick as an empty snapshot");
                self.journal(Event::Note(err.to_string()));
                (0, self.store.apply_failed_fetch())
            }
        };

        for key in &delta.zeroed {
            self.notify.info(format!("position closed at source: {key}, closing mirror"));
        }
        if !delta.replays_ignored.is_empty() {
            REPLAYS_IGNORED.inc_by(delta.replays_ignored.len() as u64);
        }
        for key in &delta.replays_first_seen {
            self.notify.warn(format!("source still reports closed position {key}, not mirroring it"));
        }

        let mut tracked = 0;
        for (key, entry) in self.store.entries() {
            if entry.state() != KeyState::Zeroed {
                tracked += 1;
            }
            MISS_STREAK.with_label_values(&[&key.to_string()]).set(entry.miss_streak as i64);
        }
        TRACKED_KEYS.set(tracked);

        if !delta.is_empty() {
            debug!(changed = delta.changed.len(), zeroed = delta.zeroed.len(), "snapshot applied");
        }
        self.journal(Event::Snapshot {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            rows,
            changed: delta.changed.clone(),
        });
        delta
    }

    fn journal(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }
}

fn ticker(every: Duration) -> tokio::time::Interval {
    let mut t = interval(every);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

pub async fn run_ingest(ingestor: Arc<Ingestor>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = ticker(every);
    loop {
        tokio::select! {
            _ = tick.tick() => { ingestor.tick().await; }
            _ = shutdown.changed() => break,
        }
    }
    info!("ingest loop stopped");
}

pub async fn run_reconcile(reconciler: Arc<Reconciler>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = ticker(every);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let r = reconciler.clone();
                tokio::spawn(async move {
                    r.run_pass().await;
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("reconcile loop stopped");
}

pub async fn run_sync_report(
    reconciler: Arc<Reconciler>,
    notify: NotifyHandle,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = ticker(every);
    // lewati tick pertama (langsung fire saat start)
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let report = reconciler.sync_report().await;
                info!(matched = report.matched, tracked = report.tracked, issues = report.issues.len(), "sync report");
                if report.issues.is_empty() {
                    notify.info(report.to_string());
                } else {
                    notify.warn(report.to_string());
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("sync report loop stopped");
}

/// Single ingest followed by a single pass (`--once`).
pub async fn run_once(ingestor: &Ingestor, reconciler: &Reconciler) -> PassReport {
    ingestor.tick().await;
    reconciler.run_pass().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PosSide, PositionKey, SnapshotRow};
    use crate::notifier::Level;
    use crate::source::ScriptedSource;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn failed_fetch_counts_as_a_miss() {
        let key = PositionKey::new("X", PosSide::Long);
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(vec![SnapshotRow::new(key.clone(), dec!(5))]),
            Err("503".into()),
            Err("503".into()),
        ]));
        let store = Arc::new(TargetStore::new(2));
        let (notify, mut rx) = NotifyHandle::channel(8);
        let ing = Ingestor::new(source, store.clone(), notify);

        ing.tick().await;
        assert!(ing.tick().await.zeroed.is_empty());
        assert_eq!(store.get(&key).unwrap().state(), KeyState::Missing(1));
        assert_eq!(ing.tick().await.zeroed, vec![key]);
        let n = rx.try_recv().unwrap();
        assert!(n.text.contains("closed at source"));
    }

    #[tokio::test]
    async fn replay_warns_once_then_stays_quiet() {
        let key = PositionKey::new("X", PosSide::Long);
        let row = SnapshotRow::new(key.clone(), dec!(5)).with_opened_at("t1");
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![row.clone()]), Ok(vec![]), Ok(vec![row])]));
        let store = Arc::new(TargetStore::new(1));
        let (notify, mut rx) = NotifyHandle::channel(8);
        let ing = Ingestor::new(source, store, notify);

        ing.tick().await;
        ing.tick().await;
        assert!(rx.try_recv().unwrap().text.contains("closed at source"));

        // the script keeps replaying its last snapshot
        for _ in 0..3 {
            assert_eq!(ing.tick().await.replays_ignored, vec![key.clone()]);
        }
        let n = rx.try_recv().unwrap();
        assert_eq!(n.level, Level::Warn);
        assert!(n.text.contains("not mirroring"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_fetch_is_journaled_as_a_note() {
        let source = Arc::new(ScriptedSource::new(vec![Err("timeout".into()), Ok(vec![])]));
        let store = Arc::new(TargetStore::new(3));
        let (notify, _rx) = NotifyHandle::channel(8);
        let (tx, mut journal) = mpsc::channel(8);
        let ing = Ingestor::new(source, store, notify).with_journal(tx);

        ing.tick().await;
        match journal.try_recv().unwrap() {
            Event::Note(text) => assert!(text.contains("timeout")),
            other => panic!("expected a note, got {other:?}"),
        }
        assert!(matches!(journal.try_recv().unwrap(), Event::Snapshot { rows: 0, .. }));
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let store = Arc::new(TargetStore::new(3));
        let (notify, _rx) = NotifyHandle::channel(8);
        let ing = Arc::new(Ingestor::new(source, store, notify));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_ingest(ing, Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
