//! Performance statistics over closed trades
//!
//! Trades are folded into a `StatsAccumulator` in chronological exit order.
//! The accumulator is serialisable and stored with each run, so an
//! incremental invocation extends it with the newly closed trades instead of
//! re-reading the whole history.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;
use crate::trade::{SimulatedTrade, TradeResult};

/// Profit factor reported when there are profits but no losses
pub const PROFIT_FACTOR_CAP: Decimal = dec!(999.99);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub expired: u32,
    /// wins / total, in [0, 1]
    pub win_rate: Decimal,
    pub avg_rr: Decimal,
    pub total_profit_pct: Decimal,
    /// Largest fall of the cumulative profit curve, in percentage points
    pub max_drawdown: Decimal,
    pub sharpe_ratio: Decimal,
    pub profit_factor: Decimal,
    /// Mean candles held
    pub avg_duration: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsAccumulator {
    pub count: u32,
    pub wins: u32,
    pub losses: u32,
    pub expired: u32,
    pub sum_rr: Decimal,
    pub sum_profit: Decimal,
    pub sum_profit_sq: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub sum_duration: u64,
    pub equity: Decimal,
    pub peak: Decimal,
    pub max_drawdown: Decimal,
}

impl StatsAccumulator {
    /// Fold one closed trade; open trades are ignored
    pub fn push(&mut self, trade: &SimulatedTrade) {
        let Some(result) = trade.result else { return };
        let profit = trade.profit_pct.unwrap_or_default();

        self.count += 1;
        match result {
            TradeResult::Win => self.wins += 1,
            TradeResult::Loss => self.losses += 1,
            TradeResult::Expired => self.expired += 1,
        }
        self.sum_rr += trade.rr_achieved.unwrap_or_default();
        self.sum_profit += profit;
        self.sum_profit_sq += profit * profit;
        if profit > Decimal::ZERO {
            self.gross_profit += profit;
        } else {
            self.gross_loss += profit.abs();
        }
        self.sum_duration += u64::from(trade.duration);

        self.equity += profit;
        if self.equity > self.peak {
            self.peak = self.equity;
        }
        let drawdown = self.peak - self.equity;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }

    /// Fold trades that are already in chronological order
    pub fn extend<'a>(&mut self, trades: impl IntoIterator<Item = &'a SimulatedTrade>) {
        for trade in trades {
            self.push(trade);
        }
    }

    pub fn finalize(&self) -> Statistics {
        if self.count == 0 {
            return Statistics::default();
        }
        let n = Decimal::from(self.count);

        let profit_factor = if self.gross_loss > Decimal::ZERO {
            (self.gross_profit / self.gross_loss).round_dp(4)
        } else if self.gross_profit > Decimal::ZERO {
            PROFIT_FACTOR_CAP
        } else {
            Decimal::ZERO
        };

        Statistics {
            total_trades: self.count,
            wins: self.wins,
            losses: self.losses,
            expired: self.expired,
            win_rate: (Decimal::from(self.wins) / n).round_dp(4),
            avg_rr: (self.sum_rr / n).round_dp(4),
            total_profit_pct: self.sum_profit.round_dp(4),
            max_drawdown: self.max_drawdown.round_dp(4),
            sharpe_ratio: self.sharpe(),
            profit_factor,
            avg_duration: (Decimal::from(self.sum_duration) / n).round_dp(2),
        }
    }

    /// Mean over population standard deviation of per-trade profit
    fn sharpe(&self) -> Decimal {
        if self.count < 2 {
            return Decimal::ZERO;
        }
        let n = f64::from(self.count);
        let sum = self.sum_profit.to_f64().unwrap_or(0.0);
        let sum_sq = self.sum_profit_sq.to_f64().unwrap_or(0.0);

        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        let std_dev = variance.sqrt();
        if std_dev < 1e-10 {
            return Decimal::ZERO;
        }

        let sharpe = mean / std_dev;
        Decimal::from_str_exact(&format!("{:.2}", sharpe)).unwrap_or(Decimal::ZERO)
    }
}

/// Summary metrics for a set of closed trades, in any order
pub fn aggregate(closed_trades: &[SimulatedTrade]) -> Statistics {
    let mut ordered: Vec<&SimulatedTrade> = closed_trades.iter().filter(|t| !t.is_open()).collect();
    ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut acc = StatsAccumulator::default();
    acc.extend(ordered);
    acc.finalize()
}

// ============================================================================
// Ranking metric
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    TotalProfitPct,
    WinRate,
    SharpeRatio,
    ProfitFactor,
    AvgRr,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::TotalProfitPct,
        Metric::WinRate,
        Metric::SharpeRatio,
        Metric::ProfitFactor,
        Metric::AvgRr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::TotalProfitPct => "total_profit_pct",
            Metric::WinRate => "win_rate",
            Metric::SharpeRatio => "sharpe_ratio",
            Metric::ProfitFactor => "profit_factor",
            Metric::AvgRr => "avg_rr",
        }
    }

    pub fn value(&self, stats: &Statistics) -> Decimal {
        match self {
            Metric::TotalProfitPct => stats.total_profit_pct,
            Metric::WinRate => stats.win_rate,
            Metric::SharpeRatio => stats.sharpe_ratio,
            Metric::ProfitFactor => stats.profit_factor,
            Metric::AvgRr => stats.avg_rr,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unknown metric '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::{TradeLevels, TradeStatus};
    use crate::types::{Direction, PatternType, PatternZone, ZoneContext};

    fn closed(exit_time: i64, exit: Decimal, result: TradeResult) -> SimulatedTrade {
        let zone = PatternZone {
            pattern_type: PatternType::Fvg,
            direction: Direction::Bullish,
            zone_high: dec!(100),
            zone_low: dec!(98),
            detected_at: exit_time - 2,
            context: ZoneContext::default(),
        };
        let mut trade = SimulatedTrade::opened(
            &zone,
            TradeLevels {
                entry: dec!(100),
                stop_loss: dec!(97.8),
                take_profit: dec!(104.4),
            },
            exit_time - 1,
        );
        trade.duration = 4;
        trade.close(exit, exit_time, result);
        trade
    }

    fn win(t: i64) -> SimulatedTrade {
        closed(t, dec!(104.4), TradeResult::Win)
    }

    fn loss(t: i64) -> SimulatedTrade {
        closed(t, dec!(97.8), TradeResult::Loss)
    }

    #[test]
    fn test_empty_is_zeroed() {
        let stats = aggregate(&[]);
        assert_eq!(stats, Statistics::default());
        assert_eq!(stats.win_rate, Decimal::ZERO);
    }

    #[test]
    fn test_basic_metrics() {
        let stats = aggregate(&[win(10), loss(20), win(30), win(40)]);
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.wins, 3);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.win_rate, dec!(0.75));
        assert_eq!(stats.avg_rr, dec!(1.25));
        assert_eq!(stats.total_profit_pct, dec!(11));
        assert_eq!(stats.profit_factor, dec!(6));
        assert_eq!(stats.max_drawdown, dec!(2.2));
        assert_eq!(stats.avg_duration, dec!(4));
        assert!(stats.sharpe_ratio > Decimal::ZERO);
    }

    #[test]
    fn test_win_rate_bounded() {
        for trades in [vec![win(1)], vec![loss(1)], vec![win(1), loss(2), loss(3)]] {
            let stats = aggregate(&trades);
            assert!(stats.win_rate >= Decimal::ZERO && stats.win_rate <= Decimal::ONE);
        }
    }

    #[test]
    fn test_profit_factor_sentinel_without_losses() {
        let stats = aggregate(&[win(1), win(2)]);
        assert_eq!(stats.profit_factor, PROFIT_FACTOR_CAP);
        assert_eq!(stats.max_drawdown, Decimal::ZERO);
        // identical returns: no deviation, no sharpe
        assert_eq!(stats.sharpe_ratio, Decimal::ZERO);
    }

    #[test]
    fn test_drawdown_follows_chronological_order() {
        // supplied out of order; losses come first in time
        let stats = aggregate(&[win(30), loss(10), loss(20)]);
        assert_eq!(stats.max_drawdown, dec!(4.4));
    }

    #[test]
    fn test_open_trades_are_ignored() {
        let mut open = win(5);
        open.status = TradeStatus::Open;
        open.result = None;
        let stats = aggregate(&[open, loss(10)]);
        assert_eq!(stats.total_trades, 1);
    }

    #[test]
    fn test_incremental_accumulation_matches_batch() {
        let trades = vec![loss(1), win(2), closed(3, dec!(101), TradeResult::Expired), win(4)];
        let mut acc = StatsAccumulator::default();
        acc.extend(&trades[..2]);
        let json = serde_json::to_string(&acc).unwrap();
        let mut restored: StatsAccumulator = serde_json::from_str(&json).unwrap();
        restored.extend(&trades[2..]);
        assert_eq!(restored.finalize(), aggregate(&trades));
        assert_eq!(restored.finalize().expired, 1);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("win_rate".parse::<Metric>().unwrap(), Metric::WinRate);
        assert!("alpha".parse::<Metric>().is_err());
        let stats = aggregate(&[win(1), loss(2)]);
        assert_eq!(Metric::WinRate.value(&stats), dec!(0.5));
    }
}
