use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;
use crate::types::Scope;

/// Where the entry price sits relative to the zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMethod {
    /// Near edge of the zone (zone_high for longs, zone_low for shorts)
    ZoneEdge,
    ZoneMid,
    /// Near edge pushed toward price by a fraction of ATR
    VolatilityBuffer,
}

impl EntryMethod {
    pub const ALL: [EntryMethod; 3] = [
        EntryMethod::ZoneEdge,
        EntryMethod::ZoneMid,
        EntryMethod::VolatilityBuffer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryMethod::ZoneEdge => "zone_edge",
            EntryMethod::ZoneMid => "zone_mid",
            EntryMethod::VolatilityBuffer => "volatility_buffer",
        }
    }
}

/// How the take-profit level is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpMethod {
    /// Entry plus `rr_target` times the stop distance
    FixedRr,
    /// Most recent swing extreme beyond entry
    Swing,
    /// Entry plus `rr_target` times ATR
    VolatilityMultiple,
}

impl TpMethod {
    pub const ALL: [TpMethod; 3] = [TpMethod::FixedRr, TpMethod::Swing, TpMethod::VolatilityMultiple];

    pub fn as_str(&self) -> &'static str {
        match self {
            TpMethod::FixedRr => "fixed_rr",
            TpMethod::Swing => "swing",
            TpMethod::VolatilityMultiple => "volatility_multiple",
        }
    }
}

impl FromStr for EntryMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unknown entry method '{s}'")))
    }
}

impl FromStr for TpMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TpMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unknown take-profit method '{s}'")))
    }
}

/// One point in the parameter space
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimulationParameters {
    pub rr_target: Decimal,
    /// Stop buffer beyond the zone, as a percentage of zone width
    pub sl_buffer_pct: Decimal,
    pub min_zone_pct: Decimal,
    pub entry_method: EntryMethod,
    pub tp_method: TpMethod,
    pub use_overlap_detection: bool,
}

impl SimulationParameters {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.rr_target <= Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "rr_target must be positive, got {}",
                self.rr_target
            )));
        }
        if self.sl_buffer_pct < Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "sl_buffer_pct must not be negative, got {}",
                self.sl_buffer_pct
            )));
        }
        if self.min_zone_pct < Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "min_zone_pct must not be negative, got {}",
                self.min_zone_pct
            )));
        }
        Ok(())
    }

    /// Canonical text form; scale-insensitive so `2` and `2.0` agree
    pub fn canonical(&self) -> String {
        format!(
            "rr={}|sl={}|zone={}|entry={}|tp={}|overlap={}",
            self.rr_target.normalize(),
            self.sl_buffer_pct.normalize(),
            self.min_zone_pct.normalize(),
            self.entry_method.as_str(),
            self.tp_method.as_str(),
            self.use_overlap_detection
        )
    }
}

impl fmt::Display for SimulationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RR {} | SL {}% | zone {}% | {} | {}{}",
            self.rr_target.normalize(),
            self.sl_buffer_pct.normalize(),
            self.min_zone_pct.normalize(),
            self.entry_method.as_str(),
            self.tp_method.as_str(),
            if self.use_overlap_detection { " | overlap" } else { "" }
        )
    }
}

/// SHA-256 of scope and parameters: identical inputs always map to the same run key
pub fn compute_run_key(scope: &Scope, params: &SimulationParameters) -> String {
    let input = format!(
        "{}:{}:{}:{}:{}:{}",
        scope.symbol,
        scope.timeframe.as_str(),
        scope.pattern_type.as_str(),
        scope.start,
        scope.end,
        params.canonical()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PatternType, Timeframe};
    use rust_decimal_macros::dec;

    fn params() -> SimulationParameters {
        SimulationParameters {
            rr_target: dec!(2),
            sl_buffer_pct: dec!(10),
            min_zone_pct: dec!(0.15),
            entry_method: EntryMethod::ZoneEdge,
            tp_method: TpMethod::FixedRr,
            use_overlap_detection: true,
        }
    }

    fn scope() -> Scope {
        Scope {
            symbol: "BTC/USDT".into(),
            timeframe: Timeframe::H1,
            pattern_type: PatternType::Fvg,
            start: 0,
            end: 1_000,
        }
    }

    #[test]
    fn test_run_key_is_stable_and_scale_insensitive() {
        let a = compute_run_key(&scope(), &params());
        let b = compute_run_key(
            &scope(),
            &SimulationParameters {
                rr_target: dec!(2.0),
                ..params()
            },
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_run_key_differs_per_scope() {
        let other = Scope {
            timeframe: Timeframe::H4,
            ..scope()
        };
        assert_ne!(
            compute_run_key(&scope(), &params()),
            compute_run_key(&other, &params())
        );
    }

    #[test]
    fn test_rejects_non_positive_rr() {
        let bad = SimulationParameters {
            rr_target: dec!(0),
            ..params()
        };
        assert!(matches!(bad.validate(), Err(EngineError::Config(_))));
        assert!(params().validate().is_ok());
    }

    #[test]
    fn test_serde_uses_snake_case_methods() {
        let json = serde_json::to_value(params()).unwrap();
        assert_eq!(json["entry_method"], "zone_edge");
        assert_eq!(json["tp_method"], "fixed_rr");
    }

    #[test]
    fn test_method_names_parse() {
        for m in EntryMethod::ALL {
            assert_eq!(m.as_str().parse::<EntryMethod>(), Ok(m));
        }
        for m in TpMethod::ALL {
            assert_eq!(m.as_str().parse::<TpMethod>(), Ok(m));
        }
        assert!(matches!("edge".parse::<EntryMethod>(), Err(EngineError::Config(_))));
    }
}
