//! Typed configuration for a circularity test run.
//!
//! Configuration files are JSON. Every optional key has a documented default,
//! and [`CircularityConfig::validate`] runs once at load time so the algorithm
//! never re-checks presence of keys.

use crate::circularity::CircularityError;
use crate::types::{Distribution, LikelihoodFamily, LinkFunction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_FIT_THRESHOLD: f64 = 90.0;
pub const DEFAULT_NULLIFICATION_THRESHOLD: f64 = 1e-5;
pub const DEFAULT_SMOOTHING_LAMBDA: f64 = 0.6;

const COUNT_OVERRIDE_KEYS: [&str; 2] = ["n", "n_splines"];

/// Reads a non-negative integer, accepting integral floats such as `15.0`.
pub(crate) fn count_value(value: &Value) -> Option<usize> {
    if let Some(n) = value.as_u64() {
        return usize::try_from(n).ok();
    }
    value
        .as_f64()
        .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= usize::MAX as f64)
        .map(|v| v as usize)
}

fn default_fit_threshold() -> f64 {
    DEFAULT_FIT_THRESHOLD
}

fn default_nullification_threshold() -> f64 {
    DEFAULT_NULLIFICATION_THRESHOLD
}

fn default_lam() -> f64 {
    DEFAULT_SMOOTHING_LAMBDA
}

fn default_max_iter() -> usize {
    100
}

fn default_tol() -> f64 {
    1e-4
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircularityConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub features: Option<FeatureDeclaration>,
    pub target: TargetDeclaration,
    pub data: DataConfig,
    #[serde(default, rename = "GAM", alias = "gam")]
    pub gam: Option<GamOptions>,
    #[serde(default = "default_fit_threshold")]
    pub fit_threshold: f64,
    #[serde(default = "default_nullification_threshold", alias = "threshold")]
    pub nullification_threshold: f64,
    #[serde(default)]
    pub save_result_csv: Option<PathBuf>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub plot: Option<PlotConfig>,
    #[serde(default)]
    pub decision_function: Option<Value>,
}

/// Declared features: a plain list, or a mapping from name to term options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureDeclaration {
    List(Vec<String>),
    Mapping(BTreeMap<String, Option<TermOptions>>),
}

impl FeatureDeclaration {
    /// Feature names in lexicographic order.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self {
            FeatureDeclaration::List(names) => names.clone(),
            FeatureDeclaration::Mapping(map) => map.keys().cloned().collect(),
        };
        names.sort();
        names
    }

    pub fn options_for(&self, feature: &str) -> Option<&TermOptions> {
        match self {
            FeatureDeclaration::List(_) => None,
            FeatureDeclaration::Mapping(map) => map.get(feature).and_then(|o| o.as_ref()),
        }
    }
}

/// Per-feature term options as written in the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermOptions {
    #[serde(default)]
    pub term_type: Option<String>,
    #[serde(default)]
    pub n_splines: Option<usize>,
    /// Anything else is forwarded to the fitter untouched (`lam`, `spline_order`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetDeclaration {
    Single(String),
    Multiple(Vec<String>),
}

impl TargetDeclaration {
    /// The single response column. Additive models here have a scalar response.
    pub fn column(&self) -> Result<&str, CircularityError> {
        match self {
            TargetDeclaration::Single(name) => Ok(name.as_str()),
            TargetDeclaration::Multiple(names) if names.len() == 1 => Ok(names[0].as_str()),
            TargetDeclaration::Multiple(names) => Err(CircularityError::InvalidInput(format!(
                "exactly one target column is required, got {}",
                names.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub train: Option<PathBuf>,
    #[serde(default)]
    pub test: Option<PathBuf>,
    #[serde(default)]
    pub preprocess: Option<ReplaceSpec>,
    #[serde(default)]
    pub binarize: Option<BinarizeSpec>,
}

/// Replace raw cell values (e.g. `"yes"`/`"no"`) in the listed columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceSpec {
    pub columns: Vec<String>,
    pub replace: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinarizeSpec {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub combine: Option<CombineSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombineSpec {
    pub columns: Vec<String>,
    pub name: String,
}

/// Model-family options shared by every fitted combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamOptions {
    #[serde(default)]
    pub distribution: Distribution,
    #[serde(default)]
    pub link: Option<LinkFunction>,
    /// Smoothing parameter applied to every penalized term unless the term sets `lam`.
    #[serde(default = "default_lam")]
    pub lam: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(default = "default_true")]
    pub fit_intercept: bool,
}

impl Default for GamOptions {
    fn default() -> Self {
        Self {
            distribution: Distribution::Normal,
            link: None,
            lam: DEFAULT_SMOOTHING_LAMBDA,
            max_iter: default_max_iter(),
            tol: default_tol(),
            fit_intercept: true,
        }
    }
}

impl GamOptions {
    pub fn family(&self) -> Result<LikelihoodFamily, CircularityError> {
        LikelihoodFamily::resolve(self.distribution, self.link)
            .map_err(|e| CircularityError::InvalidInput(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlotKind {
    #[serde(rename = "circular")]
    Circular,
    #[serde(rename = "non_circular", alias = "non-circular")]
    NonCircular,
    #[serde(rename = "all")]
    All,
    #[serde(rename = "decision_function", alias = "decision-function")]
    DecisionFunction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlotConfig {
    #[serde(default)]
    pub types: Vec<PlotKind>,
    /// Directory for exported term curves. Nothing is exported when absent.
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
    /// Per-feature plotting options keyed by feature name, plus any other
    /// renderer settings, which are ignored here.
    #[serde(flatten)]
    pub entries: BTreeMap<String, Value>,
}

impl PlotConfig {
    /// Plot options for `feature`, if it has an object entry.
    pub fn overrides_for(&self, feature: &str) -> Option<&serde_json::Map<String, Value>> {
        self.entries.get(feature).and_then(Value::as_object)
    }

    /// Number of grid points requested for `feature` (`n`), default 100.
    pub fn grid_points_for(&self, feature: &str) -> Option<usize> {
        self.overrides_for(feature)
            .and_then(|o| o.get("n"))
            .and_then(count_value)
    }

    /// Count-valued overrides (`n`, `n_splines`) must be positive integers.
    fn validate(&self) -> Result<(), CircularityError> {
        for (feature, entry) in &self.entries {
            let Some(overrides) = entry.as_object() else {
                continue;
            };
            for key in COUNT_OVERRIDE_KEYS {
                match overrides.get(key) {
                    None => {}
                    Some(value) if count_value(value).is_some_and(|n| n > 0) => {}
                    Some(value) => {
                        return Err(CircularityError::InvalidInput(format!(
                            "plot.{feature}.{key} must be a positive integer, got {value}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl CircularityConfig {
    pub fn from_path(path: &Path) -> Result<Self, CircularityError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CircularityError::InvalidInput(format!(
                "failed to read config '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CircularityError> {
        let config: CircularityConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CircularityError> {
        if self.data.train.is_none() {
            return Err(CircularityError::InvalidInput(
                "a training data path is required under data.train".to_string(),
            ));
        }
        let target = self.target.column()?;
        if target.trim().is_empty() {
            return Err(CircularityError::InvalidInput(
                "target column name is empty".to_string(),
            ));
        }
        if !self.fit_threshold.is_finite() {
            return Err(CircularityError::InvalidInput(format!(
                "fit_threshold must be finite, got {}",
                self.fit_threshold
            )));
        }
        if !self.nullification_threshold.is_finite() || self.nullification_threshold < 0.0 {
            return Err(CircularityError::InvalidInput(format!(
                "nullification_threshold must be a finite non-negative number, got {}",
                self.nullification_threshold
            )));
        }
        let gam = self.gam_options();
        gam.family()?;
        if !(gam.lam >= 0.0 && gam.lam.is_finite()) {
            return Err(CircularityError::InvalidInput(format!(
                "GAM.lam must be finite and non-negative, got {}",
                gam.lam
            )));
        }
        if self.threads == Some(0) {
            return Err(CircularityError::InvalidInput(
                "threads must be at least 1".to_string(),
            ));
        }
        if let Some(plot) = &self.plot {
            plot.validate()?;
        }
        if let Some(features) = &self.features {
            let names = features.sorted_names();
            if names.is_empty() {
                return Err(CircularityError::InvalidInput(
                    "the feature set is empty".to_string(),
                ));
            }
            let unique: BTreeSet<&String> = names.iter().collect();
            if unique.len() != names.len() {
                return Err(CircularityError::InvalidInput(
                    "feature names must be unique".to_string(),
                ));
            }
            if names.iter().any(|n| n == target) {
                return Err(CircularityError::InvalidInput(format!(
                    "target column '{target}' is also declared as a feature"
                )));
            }
        }
        Ok(())
    }

    pub fn gam_options(&self) -> GamOptions {
        self.gam.clone().unwrap_or_default()
    }

    pub fn plot_config(&self) -> PlotConfig {
        self.plot.clone().unwrap_or_default()
    }

    /// Declared feature names, sorted. `None` when features are inferred from data.
    pub fn declared_features(&self) -> Option<Vec<String>> {
        self.features.as_ref().map(FeatureDeclaration::sorted_names)
    }

    pub fn term_options(&self, feature: &str) -> Option<&TermOptions> {
        self.features.as_ref().and_then(|f| f.options_for(feature))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("given config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "target": "y",
        "data": { "train": "train.csv" }
    }"#;

    #[test]
    fn defaults_are_applied() {
        let cfg = CircularityConfig::from_json_str(MINIMAL).expect("config");
        assert_eq!(cfg.fit_threshold, 90.0);
        assert_eq!(cfg.nullification_threshold, 1e-5);
        assert!(cfg.features.is_none());
        let gam = cfg.gam_options();
        assert_eq!(gam.distribution, Distribution::Normal);
        assert_eq!(gam.lam, 0.6);
        assert_eq!(gam.family().unwrap(), LikelihoodFamily::GaussianIdentity);
    }

    #[test]
    fn feature_mapping_with_term_options() {
        let cfg = CircularityConfig::from_json_str(
            r#"{
                "features": {
                    "zeta": null,
                    "alpha": { "term_type": "linear" },
                    "mid": { "n_splines": 12, "lam": 2.5 }
                },
                "target": ["y"],
                "data": { "train": "train.csv" },
                "GAM": { "distribution": "binomial" },
                "threshold": 1e-7
            }"#,
        )
        .expect("config");
        assert_eq!(
            cfg.declared_features().unwrap(),
            vec!["alpha".to_string(), "mid".to_string(), "zeta".to_string()]
        );
        assert_eq!(cfg.nullification_threshold, 1e-7);
        assert_eq!(
            cfg.term_options("alpha").and_then(|o| o.term_type.as_deref()),
            Some("linear")
        );
        let mid = cfg.term_options("mid").expect("mid options");
        assert_eq!(mid.n_splines, Some(12));
        assert_eq!(mid.extra.get("lam").and_then(Value::as_f64), Some(2.5));
        assert!(cfg.term_options("zeta").is_none());
        assert_eq!(
            cfg.gam_options().family().unwrap(),
            LikelihoodFamily::BinomialLogit
        );
    }

    #[test]
    fn missing_train_path_is_invalid_input() {
        let err = CircularityConfig::from_json_str(r#"{ "target": "y", "data": {} }"#)
            .expect_err("must fail");
        assert!(matches!(err, CircularityError::InvalidInput(_)));
    }

    #[test]
    fn multiple_targets_are_rejected() {
        let err = CircularityConfig::from_json_str(
            r#"{ "target": ["a", "b"], "data": { "train": "t.csv" } }"#,
        )
        .expect_err("must fail");
        assert!(matches!(err, CircularityError::InvalidInput(_)));
    }

    #[test]
    fn incompatible_link_is_rejected() {
        let err = CircularityConfig::from_json_str(
            r#"{ "target": "y", "data": { "train": "t.csv" },
                 "GAM": { "distribution": "normal", "link": "logit" } }"#,
        )
        .expect_err("must fail");
        assert!(matches!(err, CircularityError::InvalidInput(_)));
    }

    #[test]
    fn plot_entries_expose_feature_overrides() {
        let cfg = CircularityConfig::from_json_str(
            r#"{ "target": "y", "data": { "train": "t.csv" },
                 "plot": { "types": ["all", "non-circular"], "ylim": [0, 1],
                           "a": { "n": 50, "xlim": [0, 3], "n_splines": 20 } } }"#,
        )
        .expect("config");
        let plot = cfg.plot_config();
        assert_eq!(plot.types, vec![PlotKind::All, PlotKind::NonCircular]);
        assert_eq!(plot.grid_points_for("a"), Some(50));
        assert!(plot.overrides_for("ylim").is_none());
        assert!(plot.overrides_for("b").is_none());
    }

    #[test]
    fn count_overrides_accept_integral_floats_only() {
        let cfg = CircularityConfig::from_json_str(
            r#"{ "target": "y", "data": { "train": "t.csv" },
                 "plot": { "a": { "n": 40.0, "n_splines": 15.0 } } }"#,
        )
        .expect("config");
        assert_eq!(cfg.plot_config().grid_points_for("a"), Some(40));

        for bad in [r#""15""#, "15.5", "0", "-3"] {
            let raw = format!(
                r#"{{ "target": "y", "data": {{ "train": "t.csv" }},
                     "plot": {{ "a": {{ "n_splines": {bad} }} }} }}"#
            );
            let err = CircularityConfig::from_json_str(&raw).expect_err("must fail");
            assert!(
                matches!(err, CircularityError::InvalidInput(ref m) if m.contains("plot.a.n_splines")),
                "{bad}: {err}"
            );
        }
    }
}
