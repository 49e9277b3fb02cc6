//! Parameter grid expansion
//!
//! A grid is a declarative list of values per parameter; expansion is the
//! cartesian product in a fixed nesting order so run keys are reproducible.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::Hash;

use crate::error::EngineError;
use crate::params::{EntryMethod, SimulationParameters, TpMethod};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterGrid {
    #[serde(default = "default_rr_targets")]
    pub rr_target: Vec<Decimal>,
    #[serde(default = "default_sl_buffers")]
    pub sl_buffer_pct: Vec<Decimal>,
    #[serde(default = "default_min_zones")]
    pub min_zone_pct: Vec<Decimal>,
    #[serde(default = "default_entry_methods")]
    pub entry_method: Vec<EntryMethod>,
    #[serde(default = "default_tp_methods")]
    pub tp_method: Vec<TpMethod>,
    #[serde(default = "default_overlap")]
    pub use_overlap_detection: Vec<bool>,
}

fn default_rr_targets() -> Vec<Decimal> {
    vec![dec!(1.5), dec!(2.0), dec!(2.5), dec!(3.0)]
}

fn default_sl_buffers() -> Vec<Decimal> {
    vec![dec!(5), dec!(10), dec!(15), dec!(20)]
}

fn default_min_zones() -> Vec<Decimal> {
    vec![dec!(0.1), dec!(0.15), dec!(0.2)]
}

fn default_entry_methods() -> Vec<EntryMethod> {
    vec![EntryMethod::ZoneEdge]
}

fn default_tp_methods() -> Vec<TpMethod> {
    vec![TpMethod::FixedRr]
}

fn default_overlap() -> Vec<bool> {
    vec![true]
}

impl Default for ParameterGrid {
    fn default() -> Self {
        Self {
            rr_target: default_rr_targets(),
            sl_buffer_pct: default_sl_buffers(),
            min_zone_pct: default_min_zones(),
            entry_method: default_entry_methods(),
            tp_method: default_tp_methods(),
            use_overlap_detection: default_overlap(),
        }
    }
}

impl ParameterGrid {
    /// Small grid for smoke tests and first looks at a market
    pub fn quick() -> Self {
        Self {
            rr_target: vec![dec!(2.0), dec!(3.0)],
            sl_buffer_pct: vec![dec!(10), dec!(15)],
            min_zone_pct: vec![dec!(0.15)],
            ..Self::default()
        }
    }

    /// Built-in grid by name
    pub fn named(name: &str) -> Result<Self, EngineError> {
        match name {
            "default" => Ok(Self::default()),
            "quick" => Ok(Self::quick()),
            other => Err(EngineError::Config(format!("unknown grid '{other}'"))),
        }
    }

    /// Number of combinations `expand` will produce
    pub fn combinations(&self) -> usize {
        self.rr_target.len()
            * self.sl_buffer_pct.len()
            * self.min_zone_pct.len()
            * self.entry_method.len()
            * self.tp_method.len()
            * self.use_overlap_detection.len()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        check_list("rr_target", &self.rr_target)?;
        check_list("sl_buffer_pct", &self.sl_buffer_pct)?;
        check_list("min_zone_pct", &self.min_zone_pct)?;
        check_list("entry_method", &self.entry_method)?;
        check_list("tp_method", &self.tp_method)?;
        check_list("use_overlap_detection", &self.use_overlap_detection)?;

        if let Some(rr) = self.rr_target.iter().find(|rr| **rr <= Decimal::ZERO) {
            return Err(EngineError::Config(format!(
                "rr_target values must be positive, got {rr}"
            )));
        }
        if let Some(sl) = self.sl_buffer_pct.iter().find(|sl| **sl < Decimal::ZERO) {
            return Err(EngineError::Config(format!(
                "sl_buffer_pct values must not be negative, got {sl}"
            )));
        }
        if let Some(z) = self.min_zone_pct.iter().find(|z| **z < Decimal::ZERO) {
            return Err(EngineError::Config(format!(
                "min_zone_pct values must not be negative, got {z}"
            )));
        }
        Ok(())
    }

    /// Cartesian product, `rr_target` outermost and `use_overlap_detection` innermost
    pub fn expand(&self) -> Vec<SimulationParameters> {
        let mut combos = Vec::with_capacity(self.combinations());
        for &rr_target in &self.rr_target {
            for &sl_buffer_pct in &self.sl_buffer_pct {
                for &min_zone_pct in &self.min_zone_pct {
                    for &entry_method in &self.entry_method {
                        for &tp_method in &self.tp_method {
                            for &use_overlap_detection in &self.use_overlap_detection {
                                combos.push(SimulationParameters {
                                    rr_target,
                                    sl_buffer_pct,
                                    min_zone_pct,
                                    entry_method,
                                    tp_method,
                                    use_overlap_detection,
                                });
                            }
                        }
                    }
                }
            }
        }
        combos
    }
}

/// Validate then expand
pub fn expand(grid: &ParameterGrid) -> Result<Vec<SimulationParameters>, EngineError> {
    grid.validate()?;
    Ok(grid.expand())
}

fn check_list<T: Hash + Eq + std::fmt::Debug>(name: &str, values: &[T]) -> Result<(), EngineError> {
    if values.is_empty() {
        return Err(EngineError::Config(format!("grid parameter '{name}' has no values")));
    }
    let mut seen = HashSet::with_capacity(values.len());
    for v in values {
        if !seen.insert(v) {
            return Err(EngineError::Config(format!(
                "grid parameter '{name}' repeats value {v:?}"
            )));
        }
    }
    Ok(())
}
