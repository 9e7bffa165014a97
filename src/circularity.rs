//! The circularity test.
//!
//! Every non-empty feature combination is fitted with the same term policy.
//! The best combination (highest rounded deviance explained, then lowest
//! effective degrees of freedom) must clear the fit threshold and be the most
//! parsimonious among equally good fits. Circularity is confirmed when exactly
//! the features it leaves out are flat in the full-feature model.

use crate::config::CircularityConfig;
use crate::model::{AdditiveModel, AdditiveModelFitter, ModelFitError};
use crate::nullification::check_nullification;
use crate::powerset::feature_powerset;
use crate::report::write_result_table;
use crate::selection::{FitResult, deviance_explained_pct, rank_results, select_candidate};
use crate::terms::build_term_specs;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CircularityError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Fitting the GAM on [{}] failed: {source}", .combination.join(", "))]
    ModelFit {
        combination: Vec<String>,
        #[source]
        source: ModelFitError,
    },

    #[error(
        "No GAM has a good fit for the data: the best combination [{}] explains {deviance_explained_pct}% of the deviance, which does not exceed the threshold of {threshold}%.",
        .best.join(", ")
    )]
    InsufficientFit {
        best: Vec<String>,
        deviance_explained_pct: i64,
        threshold: f64,
    },

    #[error(
        "Circularity assumption violated: [{}] (edf {best_dof:.4}) ranks first at {deviance_explained_pct}% deviance explained, but [{}] reaches the same fit with edf {other_dof:.4}.",
        .best.join(", "),
        .other.join(", ")
    )]
    CircularityAssumption {
        best: Vec<String>,
        best_dof: f64,
        other: Vec<String>,
        other_dof: f64,
        deviance_explained_pct: i64,
    },

    #[error("Configuration could not be parsed: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Result table error: {0}")]
    ResultTable(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to build the fitting thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl CircularityError {
    /// True for negative test results that are answers, not failures.
    pub fn is_test_outcome(&self) -> bool {
        matches!(self, CircularityError::InsufficientFit { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStage {
    Initialized,
    PowersetFitted,
    BestCandidateValidated,
    NullificationChecked,
    CircularityConfirmed,
    NoCircularityFound,
}

impl TestStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TestStage::CircularityConfirmed | TestStage::NoCircularityFound
        )
    }
}

impl fmt::Display for TestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestStage::Initialized => "initialized",
            TestStage::PowersetFitted => "powerset fitted",
            TestStage::BestCandidateValidated => "best candidate validated",
            TestStage::NullificationChecked => "nullification checked",
            TestStage::CircularityConfirmed => "circularity confirmed",
            TestStage::NoCircularityFound => "no circularity found",
        };
        f.write_str(name)
    }
}

/// The minimal sufficient feature combination, or empty when circularity was
/// not established.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircularityVerdict {
    pub circular_features: Vec<String>,
}

impl CircularityVerdict {
    pub fn is_circular(&self) -> bool {
        !self.circular_features.is_empty()
    }
}

/// Everything a completed test produced.
#[derive(Debug)]
pub struct CircularityReport<M> {
    /// The full feature set, sorted.
    pub features: Vec<String>,
    /// All fitted combinations in rank order.
    pub ranking: Vec<FitResult<M>>,
    /// Features flat in the full-feature model.
    pub nullified: Vec<String>,
    pub verdict: CircularityVerdict,
    pub stage: TestStage,
}

impl<M> CircularityReport<M> {
    pub fn candidate(&self) -> Option<&FitResult<M>> {
        self.ranking.first()
    }

    pub fn full_model(&self) -> Option<&FitResult<M>> {
        self.ranking
            .iter()
            .find(|r| r.combination == self.features)
    }

    /// Features outside the circular combination.
    pub fn non_circular_features(&self) -> Vec<String> {
        self.features
            .iter()
            .filter(|f| !self.verdict.circular_features.contains(f))
            .cloned()
            .collect()
    }
}

/// Columns of `x` (laid out as `features`) for `combination`, in combination order.
pub fn combination_columns(
    x: ArrayView2<'_, f64>,
    features: &[String],
    combination: &[String],
) -> Result<Array2<f64>, CircularityError> {
    let columns = combination
        .iter()
        .map(|name| {
            features.iter().position(|f| f == name).ok_or_else(|| {
                CircularityError::InvalidInput(format!("feature '{name}' has no data column"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(x.select(Axis(1), &columns))
}

pub struct CircularityEngine<'a, F> {
    config: &'a CircularityConfig,
    fitter: F,
    stage: TestStage,
}

impl<'a, F: AdditiveModelFitter> CircularityEngine<'a, F> {
    pub fn new(config: &'a CircularityConfig, fitter: F) -> Self {
        Self {
            config,
            fitter,
            stage: TestStage::Initialized,
        }
    }

    pub fn stage(&self) -> TestStage {
        self.stage
    }

    fn advance(&mut self, next: TestStage) {
        log::info!("circularity test: {} -> {}", self.stage, next);
        self.stage = next;
    }

    /// Runs the full test. Column `j` of `x` holds `features[j]`.
    pub fn run(
        &mut self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        features: &[String],
    ) -> Result<CircularityReport<F::Model>, CircularityError> {
        if self.stage.is_terminal() {
            return Err(CircularityError::InvalidInput(format!(
                "the test already finished ({})",
                self.stage
            )));
        }
        if x.ncols() != features.len() {
            return Err(CircularityError::InvalidInput(format!(
                "data has {} feature columns but {} features were declared",
                x.ncols(),
                features.len()
            )));
        }
        if x.nrows() == 0 || x.nrows() != y.len() {
            return Err(CircularityError::InvalidInput(format!(
                "data has {} rows but the target has {}",
                x.nrows(),
                y.len()
            )));
        }

        let combinations = feature_powerset(features)?;
        let Some(full_features) = combinations.last().cloned() else {
            return Err(CircularityError::InvalidInput(
                "no feature combinations were enumerated".to_string(),
            ));
        };
        log::info!(
            "fitting {} feature combinations for {}",
            combinations.len(),
            self.config.display_name()
        );
        let results = self.fit_combinations(&combinations, features, x, y)?;
        self.advance(TestStage::PowersetFitted);

        let ranking = rank_results(results);
        if let Some(path) = &self.config.save_result_csv {
            write_result_table(path, &ranking)?;
            log::info!("result table written to {}", path.display());
        }

        let top = ranking.first().ok_or_else(|| {
            CircularityError::InvalidInput("no fitted combinations to rank".to_string())
        })?;
        if !(top.deviance_explained_pct as f64 > self.config.fit_threshold) {
            return Err(CircularityError::InsufficientFit {
                best: top.combination.clone(),
                deviance_explained_pct: top.deviance_explained_pct,
                threshold: self.config.fit_threshold,
            });
        }
        let candidate = select_candidate(&ranking)?.combination.clone();
        self.advance(TestStage::BestCandidateValidated);

        let full = ranking
            .iter()
            .find(|r| r.combination == full_features)
            .ok_or_else(|| {
                CircularityError::InvalidInput(
                    "the full feature combination was not fitted".to_string(),
                )
            })?;
        let mut nullified = check_nullification(
            &full.model,
            &full.combination,
            self.config.nullification_threshold,
        )
        .map_err(|source| CircularityError::ModelFit {
            combination: full.combination.clone(),
            source,
        })?;
        self.advance(TestStage::NullificationChecked);

        nullified.sort();
        let mut excluded: Vec<String> = full_features
            .iter()
            .filter(|f| !candidate.contains(f))
            .cloned()
            .collect();
        excluded.sort();

        let verdict = if nullified == excluded {
            log::info!(
                "circular features: [{}], nullified: [{}]",
                candidate.join(", "),
                nullified.join(", ")
            );
            self.advance(TestStage::CircularityConfirmed);
            CircularityVerdict {
                circular_features: candidate,
            }
        } else {
            log::info!(
                "no circularity: candidate [{}] leaves out [{}] but [{}] are nullified",
                candidate.join(", "),
                excluded.join(", "),
                nullified.join(", ")
            );
            self.advance(TestStage::NoCircularityFound);
            CircularityVerdict::default()
        };

        Ok(CircularityReport {
            features: full_features,
            ranking,
            nullified,
            verdict,
            stage: self.stage,
        })
    }

    /// Fits every combination on the rayon pool. Results keep enumeration
    /// order and the first failure aborts the whole run.
    pub fn fit_combinations(
        &self,
        combinations: &[Vec<String>],
        features: &[String],
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<Vec<FitResult<F::Model>>, CircularityError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads.unwrap_or(0))
            .build()?;
        pool.install(|| {
            combinations
                .par_iter()
                .enumerate()
                .map(|(index, combination)| self.fit_combination(index, combination, features, x, y))
                .collect::<Result<Vec<_>, _>>()
        })
    }

    fn fit_combination(
        &self,
        index: usize,
        combination: &[String],
        features: &[String],
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<FitResult<F::Model>, CircularityError> {
        let x_sub = combination_columns(x, features, combination)?;
        let terms = build_term_specs(self.config, combination, None);
        let wrap = |source: ModelFitError| CircularityError::ModelFit {
            combination: combination.to_vec(),
            source,
        };

        let model = self
            .fitter
            .fit(&terms, &self.config.gam_options(), x_sub.view(), y)
            .map_err(wrap)?;
        let fraction = model.deviance_explained(x_sub.view(), y).map_err(wrap)?;
        let result = FitResult {
            combination: combination.to_vec(),
            deviance_explained_pct: deviance_explained_pct(fraction),
            effective_dof: model.effective_dof(),
            enumeration_index: index,
            model,
        };
        log::debug!(
            "[{}]: {}% deviance explained, edf {:.4}",
            result.combination.join(", "),
            result.deviance_explained_pct,
            result.effective_dof
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GamOptions;
    use crate::terms::TermSpec;
    use ndarray::Array1;
    use std::collections::BTreeMap;

    /// Column `j` of the test data is filled with `j + 1`, so a fitter can
    /// tell which features it was handed.
    fn id_data(n_features: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((8, n_features), |(_, j)| (j + 1) as f64);
        let y = Array1::linspace(0.0, 1.0, 8);
        (x, y)
    }

    #[derive(Clone, Copy, Debug)]
    struct Outcome {
        fraction: f64,
        dof: f64,
    }

    #[derive(Debug)]
    struct ScriptedModel {
        outcome: Outcome,
        flat: Vec<bool>,
    }

    /// Fits by lookup on the feature ids; features listed in `flat` have a
    /// constant partial dependence.
    struct ScriptedFitter {
        outcomes: BTreeMap<Vec<usize>, Outcome>,
        flat: Vec<usize>,
        fail_on: Option<Vec<usize>>,
    }

    impl AdditiveModelFitter for ScriptedFitter {
        type Model = ScriptedModel;

        fn fit(
            &self,
            terms: &[TermSpec],
            _options: &GamOptions,
            x: ArrayView2<'_, f64>,
            _y: ArrayView1<'_, f64>,
        ) -> Result<ScriptedModel, ModelFitError> {
            let ids: Vec<usize> = terms.iter().map(|t| x[[0, t.position]] as usize).collect();
            if self.fail_on.as_ref() == Some(&ids) {
                return Err(ModelFitError::PirlsDidNotConverge {
                    max_iterations: 100,
                    last_change: 1.0,
                });
            }
            let outcome = self.outcomes.get(&ids).copied().unwrap_or(Outcome {
                fraction: 0.1,
                dof: 3.0,
            });
            let flat = ids.iter().map(|id| self.flat.contains(id)).collect();
            Ok(ScriptedModel { outcome, flat })
        }
    }

    impl AdditiveModel for ScriptedModel {
        fn deviance_explained(
            &self,
            _x: ArrayView2<'_, f64>,
            _y: ArrayView1<'_, f64>,
        ) -> Result<f64, ModelFitError> {
            Ok(self.outcome.fraction)
        }

        fn effective_dof(&self) -> f64 {
            self.outcome.dof
        }

        fn num_terms(&self) -> usize {
            self.flat.len()
        }

        fn term_grid(&self, _term: usize, n_points: usize) -> Result<Array1<f64>, ModelFitError> {
            Ok(Array1::linspace(0.0, 1.0, n_points))
        }

        fn partial_dependence(
            &self,
            term: usize,
            grid: ArrayView1<'_, f64>,
        ) -> Result<Array1<f64>, ModelFitError> {
            let slope = if self.flat[term] { 0.0 } else { 1.0 };
            Ok(grid.mapv(|g| slope * g))
        }
    }

    fn outcome(fraction: f64, dof: f64) -> Outcome {
        Outcome { fraction, dof }
    }

    fn config(features: &[&str]) -> CircularityConfig {
        let raw = serde_json::json!({
            "features": features,
            "target": "y",
            "data": { "train": "unused.csv" },
            "threads": 2
        });
        CircularityConfig::from_json_str(&raw.to_string()).expect("config")
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_fits_pick_the_simpler_disjoint_subset() {
        let cfg = config(&["a", "b", "c", "d"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::from([
                (vec![1, 2], outcome(0.98, 7.5)),
                (vec![3, 4], outcome(0.98, 5.0)),
                (vec![1, 2, 3, 4], outcome(0.98, 12.0)),
            ]),
            flat: vec![1, 2],
            fail_on: None,
        };
        let (x, y) = id_data(4);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        let report = engine
            .run(x.view(), y.view(), &names(&["a", "b", "c", "d"]))
            .expect("run");
        assert_eq!(report.ranking.len(), 15);
        assert_eq!(report.candidate().map(|c| c.combination.clone()), Some(names(&["c", "d"])));
        assert_eq!(report.nullified, names(&["a", "b"]));
        assert_eq!(report.verdict.circular_features, names(&["c", "d"]));
        assert_eq!(report.non_circular_features(), names(&["a", "b"]));
        assert_eq!(report.stage, TestStage::CircularityConfirmed);
        assert_eq!(engine.stage(), TestStage::CircularityConfirmed);
        assert_eq!(
            report.full_model().map(|r| r.effective_dof),
            Some(12.0)
        );
    }

    #[test]
    fn partial_nullification_overlap_is_not_circularity() {
        let cfg = config(&["a", "b", "c"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::from([
                (vec![1], outcome(0.95, 3.0)),
                (vec![1, 2, 3], outcome(0.95, 9.0)),
            ]),
            flat: vec![2],
            fail_on: None,
        };
        let (x, y) = id_data(3);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        let report = engine
            .run(x.view(), y.view(), &names(&["a", "b", "c"]))
            .expect("run");
        assert_eq!(report.nullified, names(&["b"]));
        assert!(!report.verdict.is_circular());
        assert_eq!(report.stage, TestStage::NoCircularityFound);
    }

    #[test]
    fn full_set_as_candidate_is_circular_in_every_feature() {
        let cfg = config(&["a", "b"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::from([
                (vec![1], outcome(0.50, 3.0)),
                (vec![2], outcome(0.50, 3.0)),
                (vec![1, 2], outcome(0.99, 6.0)),
            ]),
            flat: vec![],
            fail_on: None,
        };
        let (x, y) = id_data(2);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        let report = engine
            .run(x.view(), y.view(), &names(&["a", "b"]))
            .expect("run");
        assert_eq!(
            report.candidate().map(|c| c.combination.clone()),
            Some(names(&["a", "b"]))
        );
        assert!(report.nullified.is_empty());
        assert_eq!(report.verdict.circular_features, names(&["a", "b"]));
        assert!(report.non_circular_features().is_empty());
        assert_eq!(report.stage, TestStage::CircularityConfirmed);
    }

    #[test]
    fn weak_best_fit_is_a_test_outcome() {
        let cfg = config(&["a", "b"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::from([(vec![1], outcome(0.90, 3.0))]),
            flat: vec![2],
            fail_on: None,
        };
        let (x, y) = id_data(2);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        let err = engine
            .run(x.view(), y.view(), &names(&["a", "b"]))
            .expect_err("must fail");
        assert!(err.is_test_outcome());
        match err {
            CircularityError::InsufficientFit {
                best,
                deviance_explained_pct,
                ..
            } => {
                assert_eq!(best, names(&["a"]));
                assert_eq!(deviance_explained_pct, 90);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.stage(), TestStage::PowersetFitted);
    }

    #[test]
    fn nan_dof_among_equal_fits_aborts() {
        let cfg = config(&["a", "b"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::from([
                (vec![1], outcome(0.99, f64::NAN)),
                (vec![1, 2], outcome(0.99, 4.0)),
            ]),
            flat: vec![2],
            fail_on: None,
        };
        let (x, y) = id_data(2);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        let err = engine
            .run(x.view(), y.view(), &names(&["a", "b"]))
            .expect_err("must fail");
        assert!(matches!(err, CircularityError::CircularityAssumption { .. }));
        assert!(!err.is_test_outcome());
    }

    #[test]
    fn fit_failures_name_the_combination() {
        let cfg = config(&["a", "b"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::new(),
            flat: vec![],
            fail_on: Some(vec![2]),
        };
        let (x, y) = id_data(2);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        let err = engine
            .run(x.view(), y.view(), &names(&["a", "b"]))
            .expect_err("must fail");
        match err {
            CircularityError::ModelFit {
                combination,
                source: ModelFitError::PirlsDidNotConverge { .. },
            } => assert_eq!(combination, names(&["b"])),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.stage(), TestStage::Initialized);
    }

    #[test]
    fn misaligned_columns_are_invalid_input() {
        let cfg = config(&["a", "b"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::new(),
            flat: vec![],
            fail_on: None,
        };
        let (x, y) = id_data(3);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        assert!(matches!(
            engine.run(x.view(), y.view(), &names(&["a", "b"])),
            Err(CircularityError::InvalidInput(_))
        ));
    }

    #[test]
    fn unsorted_feature_columns_are_mapped_by_name() {
        let cfg = config(&["a", "b"]);
        let fitter = ScriptedFitter {
            outcomes: BTreeMap::from([
                // Column 1 holds "a" here, so the id of "a" is 2.
                (vec![2], outcome(0.97, 3.0)),
                (vec![2, 1], outcome(0.97, 6.0)),
            ]),
            flat: vec![1],
            fail_on: None,
        };
        let (x, y) = id_data(2);
        let mut engine = CircularityEngine::new(&cfg, fitter);
        let report = engine
            .run(x.view(), y.view(), &names(&["b", "a"]))
            .expect("run");
        assert_eq!(report.verdict.circular_features, names(&["a"]));
        assert_eq!(report.nullified, names(&["b"]));
    }
}
