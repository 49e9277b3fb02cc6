//! Rolling measurements over candle series used by the detectors
//!
//! Every series returned here is causal: the value at index `i` only
//! depends on candles `0..=i` (swing points are confirmed `lookback`
//! candles later and are reported with that delay in mind by callers).

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use ta::indicators::AverageTrueRange;
use ta::Next;

use crate::types::Candle;

// ============================================================================
// Volatility
// ============================================================================

/// Average True Range at every index, `None` until `period` candles were seen
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<Decimal>> {
    let Ok(mut atr) = AverageTrueRange::new(period.max(1)) else {
        return vec![None; candles.len()];
    };

    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let bar = to_data_item(candle)?;
            let value = atr.next(&bar);
            if i + 1 < period {
                return None;
            }
            Decimal::from_f64(value).map(|d| d.round_dp(8))
        })
        .collect()
}

fn to_data_item(candle: &Candle) -> Option<ta::DataItem> {
    let open = candle.open.to_f64()?;
    let high = candle.high.to_f64()?;
    let low = candle.low.to_f64()?;
    let close = candle.close.to_f64()?;
    ta::DataItem::builder()
        .open(open)
        .high(high)
        .low(low)
        .close(close)
        .volume(candle.volume.to_f64().unwrap_or(0.0))
        .build()
        .ok()
}

// ============================================================================
// Candle bodies
// ============================================================================

/// Mean body size over the `window` candles ending at each index (inclusive).
/// `None` until a full window is available.
pub fn rolling_mean_body(candles: &[Candle], window: usize) -> Vec<Option<Decimal>> {
    let window = window.max(1);
    let divisor = Decimal::from(window as u64);
    let mut out = Vec::with_capacity(candles.len());
    let mut sum = Decimal::ZERO;

    for (i, candle) in candles.iter().enumerate() {
        sum += candle.body();
        if i >= window {
            sum -= candles[i - window].body();
        }
        out.push((i + 1 >= window).then(|| sum / divisor));
    }
    out
}

// ============================================================================
// Swing points
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwingPoint {
    pub index: usize,
    pub price: Decimal,
}

/// Strict swing highs and lows with `lookback` candles on each side
pub fn swing_points(candles: &[Candle], lookback: usize) -> (Vec<SwingPoint>, Vec<SwingPoint>) {
    let mut highs = Vec::new();
    let mut lows = Vec::new();
    if lookback == 0 || candles.len() < 2 * lookback + 1 {
        return (highs, lows);
    }

    for i in lookback..candles.len() - lookback {
        let c = &candles[i];
        let neighbours = (1..=lookback).flat_map(|j| [&candles[i - j], &candles[i + j]]);

        let mut is_high = true;
        let mut is_low = true;
        for n in neighbours {
            is_high &= c.high > n.high;
            is_low &= c.low < n.low;
        }

        if is_high {
            highs.push(SwingPoint {
                index: i,
                price: c.high,
            });
        }
        if is_low {
            lows.push(SwingPoint {
                index: i,
                price: c.low,
            });
        }
    }
    (highs, lows)
}

/// Highest high and lowest low over the `lookback` candles ending at `index`
pub fn recent_extremes(
    candles: &[Candle],
    index: usize,
    lookback: usize,
) -> Option<(Decimal, Decimal)> {
    let end = index.checked_add(1)?.min(candles.len());
    let start = end.saturating_sub(lookback.max(1));
    let window = candles.get(start..end)?;
    let high = window.iter().map(|c| c.high).max()?;
    let low = window.iter().map(|c| c.low).min()?;
    Some((high, low))
}
