// ===============================
// src/convert.rs (source contracts -> mirror lots)
// ===============================
//
// Source venue counts contracts, the mirror terminal trades lots.
//   raw  = qty * contract_size * leverage / tick_contract_size
//   lots = ceil(raw / lot_step) * lot_step, bumped to lot_min when nonzero
// Rounding is always up so the mirror never under-hedges the source.
//
use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::PositionKey;
use crate::errors::ConvertError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Source instrument id, e.g. `USDT1791-BTC-USDT`
    pub source: String,
    /// Mirror terminal symbol, e.g. `BTCUSD`
    pub mirror_symbol: String,
    /// Source-native units per contract
    pub contract_size: Decimal,
    /// Source-native units per mirror lot
    pub tick_contract_size: Decimal,
    pub lot_step: Decimal,
    pub lot_min: Decimal,
}

impl InstrumentSpec {
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("contract_size", self.contract_size),
            ("tick_contract_size", self.tick_contract_size),
            ("lot_step", self.lot_step),
            ("lot_min", self.lot_min),
        ] {
            if v <= Decimal::ZERO {
                return Err(format!("{}: {} must be > 0 (got {})", self.source, name, v));
            }
        }
        // lot_min harus kelipatan lot_step, kalau tidak output tidak lagi kelipatan step
        if !(self.lot_min % self.lot_step).is_zero() {
            return Err(format!(
                "{}: lot_min {} is not a multiple of lot_step {}",
                self.source, self.lot_min, self.lot_step
            ));
        }
        Ok(())
    }

    pub fn lots_for(&self, source_qty: Decimal, leverage: Decimal) -> Decimal {
        if source_qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let raw = source_qty * self.contract_size * leverage / self.tick_contract_size;
        let lots = quantize_up(raw, self.lot_step);
        if !lots.is_zero() && lots < self.lot_min { self.lot_min } else { lots }
    }
}

/// Smallest multiple of `step` that is >= `raw`.
pub fn quantize_up(raw: Decimal, step: Decimal) -> Decimal {
    if raw <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((raw / step).ceil() * step).normalize()
}

/// Static instrument metadata plus the leverage factor applied to every conversion.
#[derive(Debug, Clone)]
pub struct InstrumentBook {
    by_source: HashMap<String, InstrumentSpec>,
    leverage: Decimal,
}

impl InstrumentBook {
    pub fn new(specs: Vec<InstrumentSpec>, leverage: Decimal) -> Result<Self, String> {
        if leverage <= Decimal::ZERO {
            return Err(format!("leverage must be > 0 (got {leverage})"));
        }
        let mut by_source = HashMap::new();
        for s in specs {
            s.validate()?;
            by_source.insert(s.source.clone(), s);
        }
        Ok(Self { by_source, leverage })
    }

    /// JSON array of `InstrumentSpec` (decimals as strings or numbers).
    pub fn from_json(text: &str, leverage: Decimal) -> Result<Self, String> {
        let specs: Vec<InstrumentSpec> = serde_json::from_str(text).map_err(|e| e.to_string())?;
        Self::new(specs, leverage)
    }

    /// Default table used when no instruments file is configured.
    pub fn builtin(leverage: Decimal) -> Result<Self, String> {
        let row = |source: &str, mirror: &str, contract_size: Decimal| InstrumentSpec {
            source: source.to_string(),
            mirror_symbol: mirror.to_string(),
            contract_size,
            tick_contract_size: dec!(1),
            lot_step: dec!(0.01),
            lot_min: dec!(0.01),
        };
        Self::new(
            vec![
                row("USDT1791-BTC-USDT", "BTCUSD", dec!(0.001)),
                row("USDT1791-ETH-USDT", "ETHUSD", dec!(0.001)),
                row("USDT1791-SOL-USDT", "SOLUSD", dec!(0.00001)),
            ],
            leverage,
        )
    }

    pub fn leverage(&self) -> Decimal { self.leverage }

    /// Source instrument ids, sorted.
    pub fn instruments(&self) -> Vec<String> {
        let mut v: Vec<String> = self.by_source.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn len(&self) -> usize { self.by_source.len() }

    pub fn is_empty(&self) -> bool { self.by_source.is_empty() }

    pub fn spec(&self, instrument: &str) -> Result<&InstrumentSpec, ConvertError> {
        self.by_source
            .get(instrument)
            .ok_or_else(|| ConvertError::UnmappedInstrument(instrument.to_string()))
    }

    pub fn to_mirror_lots(&self, key: &PositionKey, source_qty: Decimal) -> Result<Decimal, ConvertError> {
        Ok(self.spec(&key.instrument)?.lots_for(source_qty, self.leverage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PosSide;

    fn btc() -> InstrumentSpec {
        InstrumentSpec {
            source: "BTC".into(),
            mirror_symbol: "BTCUSD".into(),
            contract_size: dec!(0.001),
            tick_contract_size: dec!(1),
            lot_step: dec!(0.01),
            lot_min: dec!(0.01),
        }
    }

    #[test]
    fn ten_contracts_make_one_min_lot() {
        let book = InstrumentBook::new(vec![btc()], dec!(1)).unwrap();
        let lots = book.to_mirror_lots(&PositionKey::new("BTC", PosSide::Long), dec!(10)).unwrap();
        assert_eq!(lots, dec!(0.01));
    }

    #[test]
    fn rounds_up_never_down() {
        let s = btc();
        // 11 contracts -> 0.011 raw -> 0.02 lots
        assert_eq!(s.lots_for(dec!(11), dec!(1)), dec!(0.02));
        // 1 contract -> 0.001 raw -> 0.01 lots
        assert_eq!(s.lots_for(dec!(1), dec!(1)), dec!(0.01));
        assert_eq!(s.lots_for(dec!(0), dec!(1)), dec!(0));
    }

    #[test]
    fn lot_min_applies_only_to_nonzero() {
        let mut s = btc();
        s.lot_min = dec!(0.05);
        assert_eq!(s.lots_for(dec!(1), dec!(1)), dec!(0.05));
        assert_eq!(s.lots_for(dec!(0), dec!(1)), dec!(0));
        assert_eq!(s.lots_for(dec!(80), dec!(1)), dec!(0.08));
    }

    #[test]
    fn leverage_scales_raw() {
        assert_eq!(btc().lots_for(dec!(10), dec!(3)), dec!(0.03));
    }

    #[test]
    fn output_is_monotonic_multiple_of_step() {
        let s = btc();
        let mut prev = Decimal::ZERO;
        for i in 0..500 {
            let q = Decimal::new(i * 7, 1); // 0.0, 0.7, 1.4, ...
            let lots = s.lots_for(q, dec!(1));
            assert!(lots >= Decimal::ZERO);
            assert!((lots % s.lot_step).is_zero(), "{lots} not a multiple of step");
            assert!(lots >= prev, "q={q}: {lots} < {prev}");
            prev = lots;
        }
    }

    #[test]
    fn unmapped_instrument_errors() {
        let book = InstrumentBook::new(vec![btc()], dec!(1)).unwrap();
        let err = book.to_mirror_lots(&PositionKey::new("DOGE", PosSide::Short), dec!(1)).unwrap_err();
        assert_eq!(err, ConvertError::UnmappedInstrument("DOGE".into()));
    }

    #[test]
    fn rejects_bad_metadata() {
        let mut s = btc();
        s.lot_min = dec!(0.015);
        assert!(InstrumentBook::new(vec![s], dec!(1)).is_err());
        let mut s = btc();
        s.lot_step = dec!(0);
        assert!(InstrumentBook::new(vec![s], dec!(1)).is_err());
        assert!(InstrumentBook::new(vec![btc()], dec!(0)).is_err());
    }

    #[test]
    fn parses_json_table() {
        let text = r#"[{"source":"X","mirror_symbol":"XUSD","contract_size":"0.5",
            "tick_contract_size":"1","lot_step":"0.1","lot_min":"0.1"}]"#;
        let book = InstrumentBook::from_json(text, dec!(1)).unwrap();
        assert_eq!(book.spec("X").unwrap().mirror_symbol, "XUSD");
        assert_eq!(book.to_mirror_lots(&PositionKey::new("X", PosSide::Long), dec!(3)).unwrap(), dec!(1.5));
    }

    #[test]
    fn builtin_table_is_valid() {
        let book = InstrumentBook::builtin(dec!(1)).unwrap();
        assert_eq!(book.len(), 3);
        assert_eq!(book.instruments()[0], "USDT1791-BTC-USDT");
        assert_eq!(book.spec("USDT1791-ETH-USDT").unwrap().mirror_symbol, "ETHUSD");
    }
}
