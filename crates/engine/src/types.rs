use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// A single OHLCV candle. `timestamp` is the open time in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Price relationships hold (low <= body <= high) and prices are positive.
    pub fn is_well_formed(&self) -> bool {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        self.low > Decimal::ZERO && self.low <= body_low && body_high <= self.high
    }

    pub fn body(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Timeframe::M1 => MINUTE,
            Timeframe::M5 => 5 * MINUTE,
            Timeframe::M15 => 15 * MINUTE,
            Timeframe::M30 => 30 * MINUTE,
            Timeframe::H1 => 60 * MINUTE,
            Timeframe::H2 => 120 * MINUTE,
            Timeframe::H4 => 240 * MINUTE,
            Timeframe::D1 => 1440 * MINUTE,
        }
    }

    /// The timeframe replayed to settle same-candle SL/TP touches.
    pub fn finer(&self) -> Option<Timeframe> {
        match self {
            Timeframe::M1 => None,
            Timeframe::M5 | Timeframe::M15 => Some(Timeframe::M1),
            Timeframe::M30 | Timeframe::H1 => Some(Timeframe::M5),
            Timeframe::H2 | Timeframe::H4 => Some(Timeframe::M15),
            Timeframe::D1 => Some(Timeframe::H1),
        }
    }

    /// Candles an open trade may run before it is force-closed as expired.
    pub fn max_trade_candles(&self) -> u32 {
        match self {
            Timeframe::M1 => 1440,
            Timeframe::M5 => 1152,
            Timeframe::M15 | Timeframe::M30 => 960,
            Timeframe::H1 => 1000,
            Timeframe::H2 => 720,
            Timeframe::H4 => 540,
            Timeframe::D1 => 365,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unknown timeframe '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
        }
    }
}

impl FromStr for Direction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bullish" => Ok(Direction::Bullish),
            "bearish" => Ok(Direction::Bearish),
            other => Err(EngineError::Data(format!("unknown direction '{other}'"))),
        }
    }
}

/// Families of price-action geometry the detectors recognise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Fvg,
    OrderBlock,
    LiquiditySweep,
}

impl PatternType {
    pub const ALL: [PatternType; 3] = [
        PatternType::Fvg,
        PatternType::OrderBlock,
        PatternType::LiquiditySweep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Fvg => "fvg",
            PatternType::OrderBlock => "order_block",
            PatternType::LiquiditySweep => "liquidity_sweep",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatternType::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unknown pattern type '{s}'")))
    }
}

/// Market context sampled at the detection candle, used by the
/// volatility and swing based entry/exit methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneContext {
    pub atr: Option<Decimal>,
    pub swing_high: Option<Decimal>,
    pub swing_low: Option<Decimal>,
}

/// A directional price interval produced by a detector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternZone {
    pub pattern_type: PatternType,
    pub direction: Direction,
    pub zone_high: Decimal,
    pub zone_low: Decimal,
    /// Timestamp of the candle that completed the pattern
    pub detected_at: i64,
    #[serde(default)]
    pub context: ZoneContext,
}

impl PatternZone {
    pub fn width(&self) -> Decimal {
        self.zone_high - self.zone_low
    }

    pub fn midpoint(&self) -> Decimal {
        (self.zone_high + self.zone_low) / Decimal::TWO
    }

    /// Zone width as a percentage of the zone midpoint
    pub fn width_pct(&self) -> Decimal {
        let mid = self.midpoint();
        if mid <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.width() / mid * Decimal::ONE_HUNDRED
    }

    /// Stable reference used to tie trades back to their originating zone
    pub fn reference(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.pattern_type.as_str(),
            self.direction.as_str(),
            self.detected_at,
            self.zone_low.normalize(),
            self.zone_high.normalize()
        )
    }
}

/// Where a job's zones come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneSourceKind {
    /// Replay detection over the candle history
    #[default]
    Replay,
    /// Use zones persisted by live detection
    Production,
}

/// One evaluation scope: a single market, timeframe, pattern family and date range
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub pattern_type: PatternType,
    pub start: i64,
    pub end: i64,
}

/// The set of scopes a job spans (cartesian product of the lists)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSet {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub pattern_types: Vec<PatternType>,
    pub start: i64,
    pub end: i64,
    #[serde(default)]
    pub zone_source: ZoneSourceKind,
}

impl ScopeSet {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbols.is_empty() || self.timeframes.is_empty() || self.pattern_types.is_empty()
        {
            return Err(EngineError::Config(
                "scope set needs at least one symbol, timeframe and pattern type".into(),
            ));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::Config("empty symbol in scope set".into()));
        }
        if self.start >= self.end {
            return Err(EngineError::Config(format!(
                "scope start {} must precede end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Expand into individual scopes (symbol, then timeframe, then pattern type)
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes =
            Vec::with_capacity(self.symbols.len() * self.timeframes.len() * self.pattern_types.len());
        for symbol in &self.symbols {
            for &timeframe in &self.timeframes {
                for &pattern_type in &self.pattern_types {
                    scopes.push(Scope {
                        symbol: symbol.clone(),
                        timeframe,
                        pattern_type,
                        start: self.start,
                        end: self.end,
                    });
                }
            }
        }
        scopes
    }
}
