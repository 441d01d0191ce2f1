// ===============================
// src/main.rs
// ===============================
/*
 # jalankan dengan mock source + paper mirror
 RUST_LOG=info cargo run -- --record-file data/journal.jsonl

 # satu pass saja
 cargo run -- --once

 # konfigurasi & aktivitas
 curl -s localhost:9898/metrics | egrep '^config_'
 curl -s localhost:9898/metrics | egrep '^(intents_total|orders_total|miss_streak)'
*/
/*
=============================================================================
Project : position_mirror: source-to-mirror position reconciliation engine
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls a source futures account, keeps a miss-confirmed target
          state per (instrument, side), and drives a mirror terminal's
          lots toward it with hysteresis, largest-first closes, bounded
          retries, notifications, Prometheus metrics and a JSONL journal.
=============================================================================
*/
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use position_mirror::config::{self, Cli, SourceMode};
use position_mirror::domain::Event;
use position_mirror::engine::{ReconcileCfg, Reconciler};
use position_mirror::gateway::{MirrorVenue, PaperVenue};
use position_mirror::notifier::{self, LogNotifier, Notifier, NotifyHandle, WebhookNotifier};
use position_mirror::scheduler::{self, Ingestor};
use position_mirror::source::{MockSource, RestSource, SnapshotProvider};
use position_mirror::store::TargetStore;
use position_mirror::{metrics, recorder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config (fatal on error) ----
    let cli = Cli::parse();
    let cfg = config::load(&cli).context("configuration")?;
    let book = Arc::new(cfg.instrument_book().context("instrument metadata")?);

    info!(
        source_mode = cfg.source_mode.as_str(),
        source_url = %cfg.source_base_url,
        snapshot_ms = cfg.snapshot_interval.as_millis() as u64,
        reconcile_ms = cfg.reconcile_interval.as_millis() as u64,
        miss_threshold = cfg.miss_threshold,
        hysteresis = %cfg.hysteresis_fraction,
        retries = cfg.order_max_retries,
        retry_delay_ms = cfg.order_retry_delay.as_millis() as u64,
        leverage = %cfg.leverage,
        instruments = book.len(),
        magic = cfg.mirror_magic,
        webhook = cfg.notify_webhook.is_some(),
        once = cfg.once,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_SOURCE_MODE.with_label_values(&[cfg.source_mode.as_str()]).set(1);
    metrics::CONFIG_MISS_THRESHOLD.set(cfg.miss_threshold as i64);
    if !cfg.once {
        tokio::spawn(metrics::serve_metrics(cfg.metrics_port));
    }

    // ---- Notifier ----
    let (notify, notify_rx) = NotifyHandle::channel(256);
    let mut sinks: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if let Some(url) = cfg.notify_webhook.clone() {
        sinks.push(Box::new(WebhookNotifier::new(url)));
    }
    let notifier_task = tokio::spawn(notifier::run(notify_rx, sinks));

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let recorder_task = cfg.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));

    // ---- Source / mirror ----
    let source: Arc<dyn SnapshotProvider> = match cfg.source_mode {
        SourceMode::Mock => Arc::new(MockSource::new(book.instruments())),
        SourceMode::Rest => Arc::new(
            RestSource::new(
                cfg.source_base_url.clone(),
                cfg.source_api_key.clone().unwrap_or_default(),
                cfg.source_api_secret.clone().unwrap_or_default(),
            )
            .context("source client")?,
        ),
    };
    let venue: Arc<dyn MirrorVenue> = Arc::new(PaperVenue::new(cfg.mirror_magic, cfg.paper_fill).with_price_walk());

    // ---- Core ----
    let store = Arc::new(TargetStore::new(cfg.miss_threshold));
    let mut ingestor = Ingestor::new(source, store.clone(), notify.clone());
    let mut reconciler = Reconciler::new(
        store,
        book,
        venue,
        notify.clone(),
        ReconcileCfg {
            hysteresis_fraction: cfg.hysteresis_fraction,
            retry: cfg.retry_policy(),
        },
    );
    if recorder_task.is_some() {
        ingestor = ingestor.with_journal(rec_tx.clone());
        reconciler = reconciler.with_journal(rec_tx.clone());
    }
    drop(rec_tx);

    if cfg.once {
        let report = scheduler::run_once(&ingestor, &reconciler).await;
        for (key, outcome) in &report.outcomes {
            info!(%key, %outcome, "once");
        }
        info!("{}", reconciler.sync_report().await);
        drop(ingestor);
        drop(reconciler);
    } else {
        notify.info("position mirror started");
        let ingestor = Arc::new(ingestor);
        let reconciler = Arc::new(reconciler);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = vec![
            tokio::spawn(scheduler::run_ingest(ingestor.clone(), cfg.snapshot_interval, shutdown_rx.clone())),
            tokio::spawn(scheduler::run_reconcile(reconciler.clone(), cfg.reconcile_interval, shutdown_rx.clone())),
        ];
        if let Some(every) = cfg.sync_report_interval {
            tasks.push(tokio::spawn(scheduler::run_sync_report(
                reconciler.clone(),
                notify.clone(),
                every,
                shutdown_rx.clone(),
            )));
        }

        tokio::signal::ctrl_c().await.context("ctrl_c handler")?;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
        for t in tasks {
            if let Err(e) = t.await {
                warn!(?e, "task ended abnormally");
            }
        }
        notify.info("position mirror stopped");
        // drop the engine's journal/notify handles so the sinks can drain
        drop(ingestor);
        drop(reconciler);
    }

    drop(notify);
    if let Some(t) = recorder_task {
        let _ = t.await;
    }
    let _ = notifier_task.await;
    Ok(())
}
