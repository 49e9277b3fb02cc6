use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Direction, PatternZone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeResult {
    Win,
    Loss,
    /// Force-closed at the maximum duration
    Expired,
}

/// How a candle touching both stop-loss and take-profit was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityResolution {
    IntrabarReplay,
    ConservativeLoss,
}

/// Entry, stop and target for one zone under one parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeLevels {
    pub entry: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

impl TradeLevels {
    pub fn risk(&self) -> Decimal {
        (self.entry - self.stop_loss).abs()
    }

    pub fn reward(&self) -> Decimal {
        (self.take_profit - self.entry).abs()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedTrade {
    pub pattern_ref: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub entry_time: i64,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<i64>,
    pub status: TradeStatus,
    pub result: Option<TradeResult>,
    /// Candles scanned since entry (so far, for open trades)
    pub duration: u32,
    pub rr_achieved: Option<Decimal>,
    pub profit_pct: Option<Decimal>,
    pub ambiguity: Option<AmbiguityResolution>,
}

impl SimulatedTrade {
    pub fn opened(zone: &PatternZone, levels: TradeLevels, entry_time: i64) -> Self {
        Self {
            pattern_ref: zone.reference(),
            direction: zone.direction,
            entry_price: levels.entry,
            entry_time,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            exit_price: None,
            exit_time: None,
            status: TradeStatus::Open,
            result: None,
            duration: 0,
            rr_achieved: None,
            profit_pct: None,
            ambiguity: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn levels(&self) -> TradeLevels {
        TradeLevels {
            entry: self.entry_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        }
    }

    /// Close the trade and derive realised R multiple and percentage move
    pub fn close(&mut self, exit_price: Decimal, exit_time: i64, result: TradeResult) {
        let signed_move = match self.direction {
            Direction::Bullish => exit_price - self.entry_price,
            Direction::Bearish => self.entry_price - exit_price,
        };
        let risk = self.levels().risk();
        let rr = match result {
            TradeResult::Loss => Decimal::NEGATIVE_ONE,
            _ if risk.is_zero() => Decimal::ZERO,
            _ => signed_move / risk,
        };

        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.status = TradeStatus::Closed;
        self.result = Some(result);
        self.rr_achieved = Some(rr.round_dp(4));
        self.profit_pct = Some((signed_move / self.entry_price * Decimal::ONE_HUNDRED).round_dp(6));
    }

    /// Chronological ordering key for closed trades
    pub fn sort_key(&self) -> (i64, i64, &str) {
        (
            self.exit_time.unwrap_or(i64::MAX),
            self.entry_time,
            self.pattern_ref.as_str(),
        )
    }
}

/// A zone whose entry has not triggered yet, carried into the next invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub zone: PatternZone,
    pub levels: TradeLevels,
    /// Candles examined since detection without a trigger
    pub waited: u32,
}

/// Sort closed trades chronologically and drop repeated identities
pub fn sort_and_dedup(trades: &mut Vec<SimulatedTrade>) {
    trades.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let mut seen = std::collections::HashSet::new();
    trades.retain(|t| seen.insert((t.pattern_ref.clone(), t.entry_time)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PatternType, ZoneContext};
    use rust_decimal_macros::dec;

    fn long_trade() -> SimulatedTrade {
        let zone = PatternZone {
            pattern_type: PatternType::Fvg,
            direction: Direction::Bullish,
            zone_high: dec!(100),
            zone_low: dec!(98),
            detected_at: 0,
            context: ZoneContext::default(),
        };
        SimulatedTrade::opened(
            &zone,
            TradeLevels {
                entry: dec!(100),
                stop_loss: dec!(97.8),
                take_profit: dec!(104.4),
            },
            60_000,
        )
    }

    #[test]
    fn test_close_win_records_rr_and_profit() {
        let mut trade = long_trade();
        trade.close(dec!(104.4), 120_000, TradeResult::Win);
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.rr_achieved, Some(dec!(2)));
        assert_eq!(trade.profit_pct, Some(dec!(4.4)));
    }

    #[test]
    fn test_close_loss_is_minus_one_r() {
        let mut trade = long_trade();
        trade.close(dec!(97.8), 120_000, TradeResult::Loss);
        assert_eq!(trade.rr_achieved, Some(dec!(-1)));
        assert_eq!(trade.profit_pct, Some(dec!(-2.2)));
    }

    #[test]
    fn test_sort_and_dedup() {
        let mut a = long_trade();
        a.close(dec!(104.4), 300_000, TradeResult::Win);
        let mut b = long_trade();
        b.entry_time = 0;
        b.close(dec!(97.8), 120_000, TradeResult::Loss);
        let mut trades = vec![a.clone(), b.clone(), a];
        sort_and_dedup(&mut trades);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0], b);
    }
}
