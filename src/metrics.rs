// ===============================
// src/metrics.rs
// ===============================
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static SNAPSHOTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snapshots_total", "source snapshots applied (label: result = ok|failed)"),
        &["result"],
    )
    .unwrap()
});

pub static SNAPSHOT_ROWS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("snapshot_rows", "rows in the last applied snapshot").unwrap());

pub static TRACKED_KEYS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("tracked_keys", "keys held by the target store").unwrap());

pub static MISS_STREAK: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("miss_streak", "consecutive snapshots a key was absent"), &["key"]).unwrap()
});

pub static REPLAYS_IGNORED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("replays_ignored_total", "rows replaying an already closed position").unwrap()
});

// -------- Reconciliation --------
pub static INTENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("intents_total", "reconcile intents emitted"), &["direction"]).unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "mirror submissions (labels: direction, status)"),
        &["direction", "status"],
    )
    .unwrap()
});

pub static KEY_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("key_errors_total", "per-key pass aborts by kind"), &["kind"]).unwrap()
});

pub static SKIPPED_BUSY: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("skipped_busy_total", "keys skipped because a previous pass was in flight").unwrap()
});

pub static SHORTFALLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("close_shortfalls_total", "closes that fell short").unwrap());

pub static TARGET_LOTS: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("target_lots", "target mirror lots per key"), &["key"]).unwrap()
});

pub static OBSERVED_LOTS: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("observed_lots", "observed mirror lots per key"), &["key"]).unwrap()
});

pub static PASS_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("reconcile_pass_seconds", "wall time of one reconcile pass"))
        .unwrap()
});

pub static NOTIFY_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("notify_dropped_total", "notices dropped because the queue was full").unwrap()
});

// ---- Config visibility ----
pub static CONFIG_SOURCE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_source_mode", "source mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_MISS_THRESHOLD: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("config_miss_threshold", "consecutive misses before a key is zeroed").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(SNAPSHOTS.clone())),
        REGISTRY.register(Box::new(SNAPSHOT_ROWS.clone())),
        REGISTRY.register(Box::new(TRACKED_KEYS.clone())),
        REGISTRY.register(Box::new(MISS_STREAK.clone())),
        REGISTRY.register(Box::new(REPLAYS_IGNORED.clone())),
        REGISTRY.register(Box::new(INTENTS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(KEY_ERRORS.clone())),
        REGISTRY.register(Box::new(SKIPPED_BUSY.clone())),
        REGISTRY.register(Box::new(SHORTFALLS.clone())),
        REGISTRY.register(Box::new(TARGET_LOTS.clone())),
        REGISTRY.register(Box::new(OBSERVED_LOTS.clone())),
        REGISTRY.register(Box::new(PASS_SECONDS.clone())),
        REGISTRY.register(Box::new(NOTIFY_DROPPED.clone())),
        REGISTRY.register(Box::new(CONFIG_SOURCE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_MISS_THRESHOLD.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Any path answers with the metrics page (GET / or /metrics)
async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut rsp = Response::new(Body::from(encode_metrics()));
    if let Ok(v) = TextEncoder::new().format_type().parse() {
        rsp.headers_mut().insert(CONTENT_TYPE, v);
    }
    Ok(rsp)
}

pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on http://{addr}/ (and /metrics)");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        init();
        SNAPSHOTS.with_label_values(&["ok"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("snapshots_total"));
    }
}
