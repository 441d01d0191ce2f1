// ===============================
// src/source.rs (source venue snapshot providers)
// ===============================
//
// Adapters that return the full list of open (instrument, side, qty) rows:
// - RestSource     : signed REST poll of the source futures account
// - MockSource     : random-walk positions (~like feed mock, no network)
// - ScriptedSource : fixed sequence of snapshots, for tests and replays
//
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::VecDeque;
use tracing::debug;

use crate::domain::{PosSide, PositionKey, SnapshotRow};
use crate::errors::SourceError;

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_open_positions(&self) -> Result<Vec<SnapshotRow>, SourceError>;
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

const ACCOUNT_PATH: &str = "/fapi/v1/account";

/// hex(HMAC-SHA256(secret, ts + METHOD + path + body))
pub fn sign_request(secret: &str, ts_ms: &str, method: &str, path: &str, body: &str) -> Result<String, SourceError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| SourceError::Decode(e.to_string()))?;
    mac.update(ts_ms.as_bytes());
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub struct RestSource {
    http: reqwest::Client,
    base: url::Url,
    api_key: String,
    api_secret: String,
}

impl RestSource {
    pub fn new(base: url::Url, api_key: String, api_secret: String) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(std::time::Duration::from_secs(10)).build()?;
        Ok(Self { http, base, api_key, api_secret })
    }
}

#[async_trait]
impl SnapshotProvider for RestSource {
    async fn fetch_open_positions(&self) -> Result<Vec<SnapshotRow>, SourceError> {
        let ts = chrono::Utc::now().timestamp_millis().to_string();
        let sig = sign_request(&self.api_secret, &ts, "GET", ACCOUNT_PATH, "")?;
        let url = self.base.join(ACCOUNT_PATH).map_err(|e| SourceError::Decode(e.to_string()))?;

        let rsp = self
            .http
            .get(url)
            .header("X-CH-APIKEY", &self.api_key)
            .header("X-CH-TS", &ts)
            .header("X-CH-SIGN", sig)
            .header("Content-Type", "application/json")
            .send()
            .await?;
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            return Err(SourceError::Api { status: status.as_u16(), body });
        }
        parse_account(&body)
    }
}

#[derive(Debug, Deserialize)]
struct AccountRes {
    #[serde(default)]
    account: Vec<AccountVo>,
}

#[derive(Debug, Deserialize)]
struct AccountVo {
    #[serde(default, rename = "positionVos")]
    position_vos: Vec<PositionVo>,
}

#[derive(Debug, Deserialize)]
struct PositionVo {
    #[serde(rename = "contractName")]
    contract_name: String,
    #[serde(default)]
    positions: Vec<PositionRec>,
}

#[derive(Debug, Deserialize)]
struct PositionRec {
    side: String,
    volume: Decimal,
    #[serde(default)]
    ctime: Option<serde_json::Value>,
}

/// Account payload -> rows. Zero/negative volumes are dropped; an unknown
/// side is a decode error (better no snapshot than a wrong one).
pub fn parse_account(body: &str) -> Result<Vec<SnapshotRow>, SourceError> {
    let res: AccountRes = serde_json::from_str(body).map_err(|e| SourceError::Decode(e.to_string()))?;
    let now = chrono::Utc::now().timestamp_millis();
    let mut rows = Vec::new();
    for acct in res.account {
        for vo in acct.position_vos {
            for p in vo.positions {
                if p.volume <= Decimal::ZERO {
                    continue;
                }
                let side = PosSide::parse(&p.side)
                    .ok_or_else(|| SourceError::Decode(format!("unknown side {:?} on {}", p.side, vo.contract_name)))?;
                let opened_at = p.ctime.map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                });
                rows.push(SnapshotRow {
                    key: PositionKey::new(vo.contract_name.clone(), side),
                    quantity: p.volume,
                    opened_at,
                    ts_ms: now,
                });
            }
        }
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// Random walk over a fixed instrument list. Roughly 5% of polls fail so the
/// miss-counter gets exercised in demo runs.
pub struct MockSource {
    instruments: Vec<String>,
    book: Mutex<Vec<SnapshotRow>>,
    fail_pct: u32,
}

impl MockSource {
    pub fn new(instruments: Vec<String>) -> Self {
        Self { instruments, book: Mutex::new(Vec::new()), fail_pct: 5 }
    }

    fn step(&self) -> Result<Vec<SnapshotRow>, SourceError> {
        let mut rng = rand::thread_rng();
        if rng.gen_range(0..100) < self.fail_pct {
            return Err(SourceError::Api { status: 503, body: "mock: upstream hiccup".into() });
        }
        let mut book = self.book.lock();
        let now = chrono::Utc::now().timestamp_millis();

        // sesekali buka posisi baru
        if !self.instruments.is_empty() && rng.gen_range(0..10) == 0 {
            let inst = &self.instruments[rng.gen_range(0..self.instruments.len())];
            let side = if rng.gen_bool(0.5) { PosSide::Long } else { PosSide::Short };
            let key = PositionKey::new(inst.clone(), side);
            if !book.iter().any(|r| r.key == key) {
                book.push(SnapshotRow::new(key, Decimal::from(rng.gen_range(1..=50))).with_opened_at(now.to_string()));
            }
        }
        for r in book.iter_mut() {
            let step: i64 = rng.gen_range(-3..=3);
            r.quantity = (r.quantity + Decimal::from(step)).max(Decimal::ZERO);
            r.ts_ms = now;
        }
        book.retain(|r| r.quantity > Decimal::ZERO);
        debug!(rows = book.len(), "mock snapshot");
        Ok(book.clone())
    }
}

#[async_trait]
impl SnapshotProvider for MockSource {
    async fn fetch_open_positions(&self) -> Result<Vec<SnapshotRow>, SourceError> {
        self.step()
    }
}

// ---------------------------------------------------------------------------
// Scripted
// ---------------------------------------------------------------------------

/// Returns the queued snapshots in order, then keeps repeating the last one.
/// `Err` entries simulate failed polls.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<SnapshotRow>, String>>>,
    last: Mutex<Vec<SnapshotRow>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Vec<SnapshotRow>, String>>) -> Self {
        Self { script: Mutex::new(script.into()), last: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, step: Result<Vec<SnapshotRow>, String>) {
        self.script.lock().push_back(step);
    }
}

#[async_trait]
impl SnapshotProvider for ScriptedSource {
    async fn fetch_open_positions(&self) -> Result<Vec<SnapshotRow>, SourceError> {
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(rows)) => {
                *self.last.lock() = rows.clone();
                Ok(rows)
            }
            Some(Err(msg)) => Err(SourceError::Api { status: 503, body: msg }),
            None => Ok(self.last.lock().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_is_stable_hex() {
        let a = sign_request("secret", "1700000000000", "get", ACCOUNT_PATH, "").unwrap();
        let b = sign_request("secret", "1700000000000", "GET", ACCOUNT_PATH, "").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, sign_request("other", "1700000000000", "GET", ACCOUNT_PATH, "").unwrap());
    }

    #[test]
    fn parses_account_payload() {
        let body = r#"{"account":[{"positionVos":[
            {"contractName":"USDT1791-BTC-USDT","positions":[
                {"side":"BUY","volume":"12","ctime":1700000000123},
                {"side":"SELL","volume":0}
            ]},
            {"contractName":"USDT1791-ETH-USDT","positions":[
                {"side":"SELL","volume":3.5,"ctime":"2024-01-01T00:00:00"}
            ]}
        ]}]}"#;
        let rows = parse_account(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, PositionKey::new("USDT1791-BTC-USDT", PosSide::Long));
        assert_eq!(rows[0].quantity, dec!(12));
        assert_eq!(rows[0].opened_at.as_deref(), Some("1700000000123"));
        assert_eq!(rows[1].key.side, PosSide::Short);
        assert_eq!(rows[1].quantity, dec!(3.5));
        assert_eq!(rows[1].opened_at.as_deref(), Some("2024-01-01T00:00:00"));
    }

    #[test]
    fn empty_account_is_empty_snapshot() {
        assert!(parse_account(r#"{"account":[]}"#).unwrap().is_empty());
        assert!(parse_account(r#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn unknown_side_is_an_error() {
        let body = r#"{"account":[{"positionVos":[{"contractName":"X","positions":[{"side":"FLAT","volume":1}]}]}]}"#;
        assert!(matches!(parse_account(body), Err(SourceError::Decode(_))));
    }

    #[tokio::test]
    async fn scripted_source_plays_then_repeats() {
        let row = SnapshotRow::new(PositionKey::new("X", PosSide::Long), dec!(1));
        let src = ScriptedSource::new(vec![Ok(vec![row.clone()]), Err("boom".into())]);
        assert_eq!(src.fetch_open_positions().await.unwrap().len(), 1);
        assert!(src.fetch_open_positions().await.is_err());
        assert_eq!(src.fetch_open_positions().await.unwrap(), vec![row]);
    }

    #[tokio::test]
    async fn mock_source_never_reports_zero_rows() {
        let src = MockSource::new(vec!["A".into(), "B".into()]);
        for _ in 0..200 {
            if let Ok(rows) = src.fetch_open_positions().await {
                assert!(rows.iter().all(|r| r.quantity > Decimal::ZERO));
            }
        }
    }
}
