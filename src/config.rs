// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : position_mirror: source-to-mirror position reconciliation engine
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls a source futures account, keeps a miss-confirmed target
          state per (instrument, side), and drives a mirror terminal's
          lots toward it with hysteresis, largest-first closes, bounded
          retries, notifications, Prometheus metrics and a JSONL journal.
=============================================================================
*/
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::{env, fs};
use tokio::time::Duration;
use url::Url;

use crate::convert::InstrumentBook;
use crate::errors::ConfigError;
use crate::retry::RetryPolicy;

pub const DEFAULT_SOURCE_URL: &str = "https://futuresopenapi.darkex.com";
pub const DEFAULT_MAGIC: u64 = 123456;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "position_mirror", version, about = "Mirror source venue positions onto a mirror terminal")]
pub struct Cli {
    /// .env file to load (default: ./.env if present)
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Run one ingest + reconcile pass and exit
    #[arg(long)]
    pub once: bool,
    /// Overrides METRICS_PORT
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Overrides RECORD_FILE
    #[arg(long)]
    pub record_file: Option<String>,
}

/// Sumber snapshot posisi
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceMode {
    Mock,
    Rest,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Mock => "mock",
            SourceMode::Rest => "rest",
        }
    }
}

impl FromStr for SourceMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(SourceMode::Mock),
            "rest" | "live" => Ok(SourceMode::Rest),
            other => Err(format!("expected mock|rest, got {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // timing
    pub snapshot_interval: Duration,
    pub reconcile_interval: Duration,
    pub sync_report_interval: Option<Duration>,

    // reconciliation
    pub miss_threshold: u32,
    pub hysteresis_fraction: Decimal,
    /// Retries after the first submission, not total attempts.
    pub order_max_retries: u32,
    pub order_retry_delay: Duration,
    pub leverage: Decimal,

    // source
    pub source_mode: SourceMode,
    pub source_base_url: Url,
    pub source_api_key: Option<String>,
    pub source_api_secret: Option<String>,
    pub instruments_file: Option<String>,

    // mirror (paper)
    pub mirror_magic: u64,
    pub paper_fill: Duration,

    // outputs
    pub notify_webhook: Option<Url>,
    pub metrics_port: u16,
    pub record_file: Option<String>,
    pub once: bool,
}

impl Config {
    /// Instruments file if configured, otherwise the built-in table.
    pub fn instrument_book(&self) -> Result<InstrumentBook, ConfigError> {
        match &self.instruments_file {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .map_err(|e| ConfigError::Instruments { path: path.clone(), reason: e.to_string() })?;
                InstrumentBook::from_json(&text, self.leverage)
                    .map_err(|reason| ConfigError::Instruments { path: path.clone(), reason })
            }
            None => InstrumentBook::builtin(self.leverage)
                .map_err(|reason| ConfigError::Instruments { path: "<builtin>".into(), reason }),
        }
    }

    /// First submission plus `ORDER_MAX_RETRIES` retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.order_max_retries.saturating_add(1), self.order_retry_delay)
    }
}

/// Loads `.env` (or `--env-file`) then reads the process environment.
pub fn load(cli: &Cli) -> Result<Config, ConfigError> {
    match &cli.env_file {
        Some(p) => {
            dotenvy::from_path(p).map_err(|e| ConfigError::Invalid { key: "--env-file", reason: e.to_string() })?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    from_lookup(|k| env::var(k).ok(), cli)
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(s) => s.parse().map_err(|e: T::Err| ConfigError::Invalid { key, reason: e.to_string() }),
        None => Ok(default),
    }
}

fn positive_ms(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let ms: u64 = parse_or(get, key, default)?;
    if ms == 0 {
        return Err(ConfigError::Invalid { key, reason: "must be > 0".into() });
    }
    Ok(Duration::from_millis(ms))
}

fn url_of(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Invalid { key, reason: e.to_string() })
}

fn non_empty(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Builds the config from any key lookup; CLI flags win over env.
pub fn from_lookup(get: impl Fn(&str) -> Option<String>, cli: &Cli) -> Result<Config, ConfigError> {
    let snapshot_interval = positive_ms(&get, "SNAPSHOT_INTERVAL_MS", 3000)?;
    let reconcile_interval = positive_ms(&get, "RECONCILE_INTERVAL_MS", 3000)?;
    let sync_secs: u64 = parse_or(&get, "SYNC_REPORT_INTERVAL_SECS", 0)?;
    let sync_report_interval = (sync_secs > 0).then(|| Duration::from_secs(sync_secs));

    let miss_threshold: u32 = parse_or(&get, "MISS_CONFIRM_THRESHOLD", 3)?;
    if miss_threshold == 0 {
        return Err(ConfigError::Invalid { key: "MISS_CONFIRM_THRESHOLD", reason: "must be >= 1".into() });
    }
    let hysteresis_fraction: Decimal = parse_or(&get, "HYSTERESIS_FRACTION", Decimal::new(5, 1))?;
    if hysteresis_fraction <= Decimal::ZERO || hysteresis_fraction > Decimal::ONE {
        return Err(ConfigError::Invalid { key: "HYSTERESIS_FRACTION", reason: "must be in (0, 1]".into() });
    }
    let order_max_retries: u32 = parse_or(&get, "ORDER_MAX_RETRIES", 3)?;
    let order_retry_delay = Duration::from_millis(parse_or(&get, "ORDER_RETRY_DELAY_MS", 250)?);
    let leverage: Decimal = parse_or(&get, "LEVERAGE_FACTOR", Decimal::ONE)?;
    if leverage <= Decimal::ZERO {
        return Err(ConfigError::Invalid { key: "LEVERAGE_FACTOR", reason: "must be > 0".into() });
    }

    // ===== Source =====
    let source_mode: SourceMode = parse_or(&get, "SOURCE_MODE", SourceMode::Mock)?;
    let source_base_url =
        url_of("SOURCE_BASE_URL", &non_empty(&get, "SOURCE_BASE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.into()))?;
    let source_api_key = non_empty(&get, "SOURCE_API_KEY");
    let source_api_secret = non_empty(&get, "SOURCE_API_SECRET");
    if source_mode == SourceMode::Rest {
        if source_api_key.is_none() {
            return Err(ConfigError::Missing("SOURCE_API_KEY"));
        }
        if source_api_secret.is_none() {
            return Err(ConfigError::Missing("SOURCE_API_SECRET"));
        }
    }
    let instruments_file = non_empty(&get, "INSTRUMENTS_FILE");

    // ===== Mirror =====
    let mirror_magic: u64 = parse_or(&get, "MIRROR_MAGIC", DEFAULT_MAGIC)?;
    let paper_fill = Duration::from_millis(parse_or(&get, "PAPER_FILL_MS", 50)?);

    // ===== Outputs =====
    let notify_webhook = non_empty(&get, "NOTIFY_WEBHOOK_URL")
        .map(|u| url_of("NOTIFY_WEBHOOK_URL", &u))
        .transpose()?;
    let metrics_port = match cli.metrics_port {
        Some(p) => p,
        None => parse_or(&get, "METRICS_PORT", 9898)?,
    };
    let record_file = cli.record_file.clone().or_else(|| non_empty(&get, "RECORD_FILE"));

    Ok(Config {
        snapshot_interval,
        reconcile_interval,
        sync_report_interval,
        miss_threshold,
        hysteresis_fraction,
        order_max_retries,
        order_retry_delay,
        leverage,
        source_mode,
        source_base_url,
        source_api_key,
        source_api_secret,
        instruments_file,
        mirror_magic,
        paper_fill,
        notify_webhook,
        metrics_port,
        record_file,
        once: cli.once,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;
    use rust_decimal_macros::dec;

    fn cfg(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        cfg_cli(pairs, &Cli::default())
    }

    fn cfg_cli(pairs: &[(&str, &str)], cli: &Cli) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        from_lookup(|k| map.get(k).cloned(), cli)
    }

    #[test]
    fn defaults() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.snapshot_interval, Duration::from_millis(3000));
        assert_eq!(c.reconcile_interval, Duration::from_millis(3000));
        assert_eq!(c.miss_threshold, 3);
        assert_eq!(c.hysteresis_fraction, dec!(0.5));
        assert_eq!(c.order_max_retries, 3);
        assert_eq!(c.leverage, dec!(1));
        assert_eq!(c.source_mode, SourceMode::Mock);
        assert_eq!(c.mirror_magic, 123456);
        assert_eq!(c.metrics_port, 9898);
        assert!(c.sync_report_interval.is_none());
        assert!(c.instrument_book().unwrap().len() >= 3);
    }

    #[test]
    fn rest_mode_requires_credentials() {
        assert!(matches!(cfg(&[("SOURCE_MODE", "rest")]), Err(ConfigError::Missing("SOURCE_API_KEY"))));
        assert!(matches!(
            cfg(&[("SOURCE_MODE", "rest"), ("SOURCE_API_KEY", "k")]),
            Err(ConfigError::Missing("SOURCE_API_SECRET"))
        ));
        let c = cfg(&[("SOURCE_MODE", "REST"), ("SOURCE_API_KEY", "k"), ("SOURCE_API_SECRET", "s")]).unwrap();
        assert_eq!(c.source_mode, SourceMode::Rest);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(cfg(&[("MISS_CONFIRM_THRESHOLD", "0")]).is_err());
        assert!(cfg(&[("HYSTERESIS_FRACTION", "1.5")]).is_err());
        assert!(cfg(&[("HYSTERESIS_FRACTION", "0")]).is_err());
        assert!(cfg(&[("SNAPSHOT_INTERVAL_MS", "0")]).is_err());
        assert!(cfg(&[("RECONCILE_INTERVAL_MS", "soon")]).is_err());
        assert!(cfg(&[("NOTIFY_WEBHOOK_URL", "not a url")]).is_err());
        assert!(cfg(&[("SOURCE_MODE", "carrier-pigeon")]).is_err());
    }

    #[test]
    fn cli_overrides_env() {
        let cli = Cli { once: true, metrics_port: Some(1234), record_file: Some("j.jsonl".into()), ..Default::default() };
        let c = cfg_cli(&[("METRICS_PORT", "9999"), ("RECORD_FILE", "other.jsonl")], &cli).unwrap();
        assert!(c.once);
        assert_eq!(c.metrics_port, 1234);
        assert_eq!(c.record_file.as_deref(), Some("j.jsonl"));
    }

    #[test]
    fn max_retries_counts_after_the_first_attempt() {
        assert_eq!(cfg(&[]).unwrap().retry_policy().attempts, 4);
        let p = cfg(&[("ORDER_MAX_RETRIES", "1"), ("ORDER_RETRY_DELAY_MS", "10")]).unwrap().retry_policy();
        assert_eq!(p.attempts, 2);
        assert_eq!(p.delay, Duration::from_millis(10));
        assert_eq!(cfg(&[("ORDER_MAX_RETRIES", "0")]).unwrap().retry_policy().attempts, 1);
    }

    #[test]
    fn missing_instruments_file_is_fatal() {
        let c = cfg(&[("INSTRUMENTS_FILE", "/nonexistent/instruments.json")]).unwrap();
        assert!(matches!(c.instrument_book(), Err(ConfigError::Instruments { .. })));
    }
}
