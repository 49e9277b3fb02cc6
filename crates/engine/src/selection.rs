//! Ranking completed runs and comparing parameter sets

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::job::{OptimizationRun, RunStatus};
use crate::params::SimulationParameters;
use crate::statistics::{Metric, Statistics};
use crate::types::Scope;

/// Winner of a best-parameter query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestParams {
    pub params: SimulationParameters,
    pub run_key: String,
    pub metric: Metric,
    pub value: Decimal,
    pub statistics: Statistics,
}

/// Compact view of a run for summaries and listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedRun {
    pub rank: usize,
    pub run_key: String,
    pub scope: Scope,
    pub params: SimulationParameters,
    pub statistics: Statistics,
}

/// Higher metric first, then more trades, then the smaller run key
fn rank(metric: Metric, a: &OptimizationRun, b: &OptimizationRun) -> Ordering {
    metric
        .value(&b.statistics)
        .cmp(&metric.value(&a.statistics))
        .then(b.statistics.total_trades.cmp(&a.statistics.total_trades))
        .then_with(|| a.run_key.cmp(&b.run_key))
}

fn eligible(run: &OptimizationRun, min_trades: u32) -> bool {
    run.status == RunStatus::Completed && run.statistics.total_trades >= min_trades
}

/// Best completed run by `metric`, ignoring runs with fewer than `min_trades`.
/// The result does not depend on the order of `runs`.
pub fn select_best<'a>(
    runs: impl IntoIterator<Item = &'a OptimizationRun>,
    metric: Metric,
    min_trades: u32,
) -> Option<BestParams> {
    runs.into_iter()
        .filter(|r| eligible(r, min_trades))
        .min_by(|a, b| rank(metric, a, b))
        .map(|run| BestParams {
            params: run.params.clone(),
            run_key: run.run_key.clone(),
            metric,
            value: metric.value(&run.statistics),
            statistics: run.statistics.clone(),
        })
}

pub fn top_runs<'a>(
    runs: impl IntoIterator<Item = &'a OptimizationRun>,
    metric: Metric,
    min_trades: u32,
    limit: usize,
) -> Vec<RankedRun> {
    let mut eligible: Vec<&OptimizationRun> =
        runs.into_iter().filter(|r| eligible(r, min_trades)).collect();
    eligible.sort_by(|a, b| rank(metric, a, b));
    eligible
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, run)| RankedRun {
            rank: i + 1,
            run_key: run.run_key.clone(),
            scope: run.scope.clone(),
            params: run.params.clone(),
            statistics: run.statistics.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preferred {
    A,
    B,
    Tie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric: String,
    pub a: Decimal,
    pub b: Decimal,
    /// b − a
    pub delta: Decimal,
    pub preferred: Preferred,
}

/// Where the statistics of one side of a comparison came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsOrigin {
    Stored,
    /// Backtested on demand; `intrabar_replay` is false when no finer candles
    /// were available, so same-candle touches fell back to a conservative loss
    Computed { intrabar_replay: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonSide {
    pub params: SimulationParameters,
    pub run_key: String,
    pub origin: StatsOrigin,
    pub statistics: Statistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub scope: Scope,
    pub a: ComparisonSide,
    pub b: ComparisonSide,
    pub metrics: Vec<MetricComparison>,
}

impl ComparisonReport {
    pub fn new(scope: Scope, a: ComparisonSide, b: ComparisonSide) -> Self {
        let mut metrics: Vec<MetricComparison> = Metric::ALL
            .iter()
            .map(|m| {
                compare(
                    m.as_str(),
                    m.value(&a.statistics),
                    m.value(&b.statistics),
                    true,
                )
            })
            .collect();
        metrics.push(compare(
            "max_drawdown",
            a.statistics.max_drawdown,
            b.statistics.max_drawdown,
            false,
        ));
        metrics.push(compare(
            "total_trades",
            Decimal::from(a.statistics.total_trades),
            Decimal::from(b.statistics.total_trades),
            true,
        ));
        Self { scope, a, b, metrics }
    }

    pub fn preferred(&self, metric: &str) -> Option<Preferred> {
        self.metrics
            .iter()
            .find(|m| m.metric == metric)
            .map(|m| m.preferred)
    }
}

fn compare(name: &str, a: Decimal, b: Decimal, higher_is_better: bool) -> MetricComparison {
    let preferred = match (a.cmp(&b), higher_is_better) {
        (Ordering::Equal, _) => Preferred::Tie,
        (Ordering::Greater, true) | (Ordering::Less, false) => Preferred::A,
        _ => Preferred::B,
    };
    MetricComparison {
        metric: name.to_string(),
        a,
        b,
        delta: b - a,
        preferred,
    }
}
