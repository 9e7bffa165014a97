//! Translation of a feature combination into the term specifications a fitter
//! consumes.

use crate::config::{CircularityConfig, PlotConfig, count_value};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_BASIS_COUNT: usize = 9;

/// Plot options that describe the rendered axis only and never reach a fitter.
const PLOT_ONLY_KEYS: [&str; 2] = ["xlim", "n"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermType {
    Linear,
    Spline,
    Factor,
    Tensor,
    /// Unrecognized alias, forwarded as written.
    Other(String),
}

impl TermType {
    pub fn from_alias(alias: &str) -> Self {
        match alias {
            "linear" | "parametric" => TermType::Linear,
            "spline" => TermType::Spline,
            "factor" => TermType::Factor,
            "tensor" => TermType::Tensor,
            other => TermType::Other(other.to_string()),
        }
    }

    pub fn supports_basis_count(&self) -> bool {
        !matches!(self, TermType::Linear)
    }
}

impl fmt::Display for TermType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermType::Linear => write!(f, "linear"),
            TermType::Spline => write!(f, "spline"),
            TermType::Factor => write!(f, "factor"),
            TermType::Tensor => write!(f, "tensor"),
            TermType::Other(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermSpec {
    /// Column of the combination's design this term reads.
    pub position: usize,
    pub term_type: TermType,
    pub basis_count: Option<usize>,
    pub extra_options: BTreeMap<String, Value>,
}

impl TermSpec {
    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.extra_options.get(key).and_then(Value::as_f64)
    }

    pub fn option_usize(&self, key: &str) -> Option<usize> {
        self.extra_options
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }
}

/// One spec per feature of `combination`, in the same order.
///
/// Plot overrides are merged after the configured options, minus the
/// axis-only keys; an override of `n_splines` replaces the basis count.
pub fn build_term_specs(
    config: &CircularityConfig,
    combination: &[String],
    plot_overrides: Option<&PlotConfig>,
) -> Vec<TermSpec> {
    combination
        .iter()
        .enumerate()
        .map(|(position, feature)| {
            let options = config.term_options(feature);
            let term_type = options
                .and_then(|o| o.term_type.as_deref())
                .map(TermType::from_alias)
                .unwrap_or(TermType::Spline);

            let mut basis_count = options.and_then(|o| o.n_splines);
            let mut extra_options = options.map(|o| o.extra.clone()).unwrap_or_default();

            if let Some(overrides) = plot_overrides.and_then(|p| p.overrides_for(feature)) {
                for (key, value) in overrides {
                    if PLOT_ONLY_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    match key.as_str() {
                        "n_splines" => basis_count = count_value(value),
                        _ => {
                            extra_options.insert(key.clone(), value.clone());
                        }
                    }
                }
            }

            if term_type.supports_basis_count() {
                basis_count = basis_count.or(Some(DEFAULT_BASIS_COUNT));
            } else {
                if basis_count.is_some() {
                    log::warn!("ignoring n_splines for linear term '{feature}'");
                }
                basis_count = None;
            }

            TermSpec {
                position,
                term_type,
                basis_count,
                extra_options,
            }
        })
        .collect()
}
