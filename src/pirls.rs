//! Penalized IRLS for additive models with fixed smoothing parameters.
//!
//! Every term contributes a block of columns to a single design matrix and a
//! matching penalty block; the intercept is unpenalized. The Gaussian/identity
//! family needs a single weighted solve. The Bernoulli/logit family iterates
//! working-response solves, halving any step that raises the penalized
//! deviance, until the relative change drops below the configured tolerance.
//! Logit fits carry a small fixed ridge so separable classes still converge.

use crate::basis::{BSplineBasis, create_difference_penalty_matrix, sum_to_zero_transform};
use crate::config::GamOptions;
use crate::faer_ndarray::factorize_symmetric;
use crate::model::{AdditiveModel, AdditiveModelFitter, ModelFitError};
use crate::terms::{DEFAULT_BASIS_COUNT, TermSpec, TermType};
use crate::types::{Coefficients, LikelihoodFamily, LinearPredictor, LinkFunction};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use std::ops::Range;

const DEFAULT_SPLINE_ORDER: usize = 3;
const SMOOTH_PENALTY_ORDER: usize = 2;
/// Linear predictor magnitude beyond which a logit fit is reported as saturated.
const SATURATION_ETA_LIMIT: f64 = 30.0;
const LOGIT_STABILIZATION_RIDGE: f64 = 1e-3;
const MAX_STEP_HALVINGS: usize = 30;
const MIN_WORKING_WEIGHT: f64 = 1e-10;

/// Fitter for the built-in spline/linear/factor terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct PenalizedSplineFitter;

/// How one term maps its input column to design columns.
#[derive(Debug, Clone)]
enum TermDesign {
    /// Uniform B-spline basis constrained to sum to zero on the training rows.
    Smooth {
        basis: BSplineBasis,
        constraint: Array2<f64>,
    },
    /// Centered raw column.
    Linear { center: f64, range: (f64, f64) },
    /// One indicator per observed level, constrained to sum to zero.
    Factor {
        levels: Vec<f64>,
        constraint: Array2<f64>,
    },
}

impl TermDesign {
    fn build(spec: &TermSpec, column: ArrayView1<'_, f64>) -> Result<(Self, Array2<f64>), ModelFitError> {
        match &spec.term_type {
            TermType::Spline | TermType::Tensor => {
                let range = column_range(column)?;
                let num_basis = spec.basis_count.unwrap_or(DEFAULT_BASIS_COUNT);
                let degree = spec.option_usize("spline_order").unwrap_or(DEFAULT_SPLINE_ORDER);
                let basis = BSplineBasis::new(range, num_basis, degree)?;
                let raw = basis.evaluate(column);
                let constraint = sum_to_zero_transform(raw.view())?;
                let order = SMOOTH_PENALTY_ORDER.min(num_basis - 1);
                let s = create_difference_penalty_matrix(num_basis, order)?;
                let penalty = constraint.t().dot(&s).dot(&constraint);
                Ok((TermDesign::Smooth { basis, constraint }, penalty))
            }
            TermType::Linear => {
                let range = column_range(column)?;
                let center = column.mean().unwrap_or(0.0);
                Ok((
                    TermDesign::Linear { center, range },
                    Array2::zeros((1, 1)),
                ))
            }
            TermType::Factor => {
                let mut levels: Vec<f64> = column.to_vec();
                levels.sort_by(f64::total_cmp);
                levels.dedup();
                let indicators = factor_indicators(&levels, column);
                let constraint = sum_to_zero_transform(indicators.view())?;
                let k = constraint.ncols();
                Ok((TermDesign::Factor { levels, constraint }, Array2::eye(k)))
            }
            TermType::Other(name) => Err(ModelFitError::UnsupportedTerm(name.clone())),
        }
    }

    fn ncols(&self) -> usize {
        match self {
            TermDesign::Smooth { constraint, .. } | TermDesign::Factor { constraint, .. } => {
                constraint.ncols()
            }
            TermDesign::Linear { .. } => 1,
        }
    }

    fn design(&self, x: ArrayView1<'_, f64>) -> Array2<f64> {
        match self {
            TermDesign::Smooth { basis, constraint } => basis.evaluate(x).dot(constraint),
            TermDesign::Linear { center, .. } => x.mapv(|v| v - center).insert_axis(Axis(1)),
            TermDesign::Factor { levels, constraint } => {
                factor_indicators(levels, x).dot(constraint)
            }
        }
    }

    fn grid(&self, n_points: usize) -> Array1<f64> {
        match self {
            TermDesign::Smooth { basis, .. } => {
                let (lo, hi) = basis.data_range();
                Array1::linspace(lo, hi, n_points)
            }
            TermDesign::Linear { range, .. } => Array1::linspace(range.0, range.1, n_points),
            TermDesign::Factor { levels, .. } => Array1::from(levels.clone()),
        }
    }
}

/// Indicator matrix; values outside `levels` get an all-zero row.
fn factor_indicators(levels: &[f64], x: ArrayView1<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((x.len(), levels.len()));
    for (i, &v) in x.iter().enumerate() {
        if let Ok(j) = levels.binary_search_by(|l| l.total_cmp(&v)) {
            out[[i, j]] = 1.0;
        }
    }
    out
}

fn column_range(column: ArrayView1<'_, f64>) -> Result<(f64, f64), ModelFitError> {
    let (lo, hi) = column
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !(lo.is_finite() && hi.is_finite()) {
        return Err(ModelFitError::InvalidInput(
            "term column is empty or contains non-finite values".to_string(),
        ));
    }
    Ok((lo, hi))
}

#[derive(Debug, Clone)]
struct FittedTerm {
    position: usize,
    design: TermDesign,
    coefficients: Range<usize>,
}

/// A fitted penalized additive model.
#[derive(Debug, Clone)]
pub struct PenalizedSplineModel {
    family: LikelihoodFamily,
    intercept: bool,
    terms: Vec<FittedTerm>,
    beta: Coefficients,
    edf: f64,
    deviance: f64,
    iterations: usize,
}

impl PenalizedSplineModel {
    pub fn coefficients(&self) -> &Coefficients {
        &self.beta
    }

    pub fn family(&self) -> LikelihoodFamily {
        self.family
    }

    /// Training deviance at convergence.
    pub fn deviance(&self) -> f64 {
        self.deviance
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn linear_predictor(&self, x: ArrayView2<'_, f64>) -> Result<LinearPredictor, ModelFitError> {
        let design = assemble_design(&self.terms, self.intercept, x)?;
        Ok(LinearPredictor::new(design.dot(&self.beta.0)))
    }

    pub fn predict_mean(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelFitError> {
        Ok(self.linear_predictor(x)?.mean(self.family.link()))
    }

    fn term(&self, term: usize) -> Result<&FittedTerm, ModelFitError> {
        self.terms.get(term).ok_or(ModelFitError::TermOutOfRange {
            index: term,
            num_terms: self.terms.len(),
        })
    }
}

fn assemble_design(
    terms: &[FittedTerm],
    intercept: bool,
    x: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, ModelFitError> {
    let n = x.nrows();
    let offset = usize::from(intercept);
    let p = offset + terms.iter().map(|t| t.coefficients.len()).sum::<usize>();
    let mut design = Array2::<f64>::zeros((n, p));
    if intercept {
        design.column_mut(0).fill(1.0);
    }
    for term in terms {
        if term.position >= x.ncols() {
            return Err(ModelFitError::InvalidInput(format!(
                "term reads column {} but the data has {} columns",
                term.position,
                x.ncols()
            )));
        }
        let block = term.design.design(x.column(term.position));
        design
            .slice_mut(s![.., term.coefficients.clone()])
            .assign(&block);
    }
    Ok(design)
}

/// Deviance of `mu` against `y`: residual sum of squares for the identity
/// link, binomial deviance for the logit link.
pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>, link: LinkFunction) -> f64 {
    const EPS: f64 = 1e-8;
    match link {
        LinkFunction::Logit => {
            let total = ndarray::Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
                let mui_c = mui.clamp(EPS, 1.0 - EPS);
                let term1 = if yi > EPS {
                    yi * (yi.ln() - mui_c.ln())
                } else {
                    0.0
                };
                let term2 = if yi < 1.0 - EPS {
                    (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui_c).ln())
                } else {
                    0.0
                };
                acc + term1 + term2
            });
            2.0 * total
        }
        LinkFunction::Identity => ndarray::Zip::from(y)
            .and(mu)
            .fold(0.0, |acc, &yi, &mui| acc + (yi - mui) * (yi - mui)),
    }
}

/// `X' W X` for diagonal `W`.
fn weighted_gram(x: &Array2<f64>, w: &Array1<f64>) -> Array2<f64> {
    let wx = x * &w.view().insert_axis(Axis(1));
    x.t().dot(&wx)
}

fn validate_response(family: LikelihoodFamily, y: ArrayView1<'_, f64>) -> Result<(), ModelFitError> {
    if y.iter().any(|v| !v.is_finite()) {
        return Err(ModelFitError::InvalidInput(
            "response contains non-finite values".to_string(),
        ));
    }
    if family == LikelihoodFamily::BinomialLogit && y.iter().any(|&v| !(0.0..=1.0).contains(&v)) {
        return Err(ModelFitError::InvalidInput(
            "binomial response must lie in [0, 1]".to_string(),
        ));
    }
    Ok(())
}

impl AdditiveModelFitter for PenalizedSplineFitter {
    type Model = PenalizedSplineModel;

    fn fit(
        &self,
        terms: &[TermSpec],
        options: &GamOptions,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<Self::Model, ModelFitError> {
        let family = LikelihoodFamily::resolve(options.distribution, options.link)
            .map_err(|e| ModelFitError::InvalidInput(e.to_string()))?;
        let n = x.nrows();
        if n == 0 || y.len() != n {
            return Err(ModelFitError::InvalidInput(format!(
                "design has {n} rows but the response has {}",
                y.len()
            )));
        }
        if terms.is_empty() {
            return Err(ModelFitError::InvalidInput("no terms to fit".to_string()));
        }
        validate_response(family, y)?;

        let intercept = options.fit_intercept;
        let mut offset = usize::from(intercept);
        let mut fitted_terms = Vec::with_capacity(terms.len());
        let mut penalties = Vec::with_capacity(terms.len());
        for spec in terms {
            if spec.position >= x.ncols() {
                return Err(ModelFitError::InvalidInput(format!(
                    "term position {} exceeds {} data columns",
                    spec.position,
                    x.ncols()
                )));
            }
            let (design, penalty) = TermDesign::build(spec, x.column(spec.position))?;
            let lam = spec.option_f64("lam").unwrap_or(options.lam);
            if !(lam.is_finite() && lam >= 0.0) {
                return Err(ModelFitError::InvalidInput(format!(
                    "smoothing parameter must be finite and non-negative, got {lam}"
                )));
            }
            let width = design.ncols();
            fitted_terms.push(FittedTerm {
                position: spec.position,
                design,
                coefficients: offset..offset + width,
            });
            penalties.push(penalty * lam);
            offset += width;
        }

        let p = offset;
        let mut s_lambda = Array2::<f64>::zeros((p, p));
        for (term, penalty) in fitted_terms.iter().zip(&penalties) {
            let r = term.coefficients.clone();
            s_lambda.slice_mut(s![r.clone(), r]).assign(penalty);
        }
        let design = assemble_design(&fitted_terms, intercept, x)?;

        let outcome = match family {
            LikelihoodFamily::GaussianIdentity => solve_gaussian(&design, &s_lambda, y)?,
            LikelihoodFamily::BinomialLogit => {
                solve_logit(&design, &s_lambda, usize::from(intercept), y, options)?
            }
        };
        log::debug!(
            "fitted {} terms ({} coefficients): edf {:.3}, deviance {:.4e}, {} iteration(s)",
            fitted_terms.len(),
            p,
            outcome.edf,
            outcome.deviance,
            outcome.iterations
        );

        Ok(PenalizedSplineModel {
            family,
            intercept,
            terms: fitted_terms,
            beta: outcome.beta,
            edf: outcome.edf,
            deviance: outcome.deviance,
            iterations: outcome.iterations,
        })
    }
}

struct PirlsOutcome {
    beta: Coefficients,
    edf: f64,
    deviance: f64,
    iterations: usize,
}

/// Solves `(X'WX + S) beta = X'Wz` and returns `beta` with
/// `edf = tr((X'WX + S)^-1 X'WX)`.
fn penalized_step(
    design: &Array2<f64>,
    s_lambda: &Array2<f64>,
    weights: &Array1<f64>,
    z: &Array1<f64>,
) -> Result<(Coefficients, f64), ModelFitError> {
    let xtwx = weighted_gram(design, weights);
    let h = &xtwx + s_lambda;
    let factor = factorize_symmetric(&h)?;
    let rhs = design.t().dot(&(weights * z));
    let beta = factor.solve_vec(&rhs)?;
    let edf = factor.solve_mat(&xtwx)?.diag().sum();
    Ok((Coefficients::new(beta), edf))
}

fn solve_gaussian(
    design: &Array2<f64>,
    s_lambda: &Array2<f64>,
    y: ArrayView1<'_, f64>,
) -> Result<PirlsOutcome, ModelFitError> {
    let weights = Array1::<f64>::ones(y.len());
    let (beta, edf) = penalized_step(design, s_lambda, &weights, &y.to_owned())?;
    let mu = design.dot(&beta.0);
    let deviance = calculate_deviance(y, &mu, LinkFunction::Identity);
    Ok(PirlsOutcome {
        beta,
        edf,
        deviance,
        iterations: 1,
    })
}

fn solve_logit(
    design: &Array2<f64>,
    s_lambda: &Array2<f64>,
    first_penalized: usize,
    y: ArrayView1<'_, f64>,
    options: &GamOptions,
) -> Result<PirlsOutcome, ModelFitError> {
    let link = LinkFunction::Logit;
    // Explicit ridge on every non-intercept coefficient; keeps the optimum
    // finite when the classes are separable along the unpenalized directions.
    let mut s_fit = s_lambda.clone();
    for i in first_penalized..s_fit.nrows() {
        s_fit[[i, i]] += LOGIT_STABILIZATION_RIDGE;
    }
    let penalized = |beta: &Array1<f64>, mu: &Array1<f64>| {
        calculate_deviance(y, mu, link) + beta.dot(&s_fit.dot(beta))
    };

    let mut mu = y.mapv(|yi| (yi + 0.5) / 2.0);
    let mut eta = mu.mapv(|m: f64| (m / (1.0 - m)).ln());
    let mut beta: Option<Array1<f64>> = None;
    let mut last_objective = f64::INFINITY;
    let mut last_change = f64::INFINITY;

    for iteration in 1..=options.max_iter.max(1) {
        let weights = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WORKING_WEIGHT));
        let z = ndarray::Zip::from(&eta)
            .and(&mu)
            .and(y)
            .and(&weights)
            .map_collect(|&e, &m, &yi, &w| e + (yi - m) / w);
        let (step, edf) = penalized_step(design, &s_fit, &weights, &z)?;

        let mut candidate = step.0;
        let mut halvings = 0;
        let (candidate_eta, candidate_mu, objective) = loop {
            let eta_c = design.dot(&candidate);
            let mu_c = eta_c.mapv(|e| link.inverse(e));
            let objective = penalized(&candidate, &mu_c);
            let Some(previous) = beta.as_ref() else {
                break (eta_c, mu_c, objective);
            };
            if objective.is_finite() && objective <= last_objective {
                break (eta_c, mu_c, objective);
            }
            if halvings == MAX_STEP_HALVINGS {
                // No decrease along this direction: stay at the previous iterate.
                candidate = previous.clone();
                break (eta.clone(), mu.clone(), last_objective);
            }
            candidate = (&candidate + previous) * 0.5;
            halvings += 1;
        };
        if halvings > 0 {
            log::trace!("P-IRLS iteration {iteration}: {halvings} step halving(s)");
        }

        eta = candidate_eta;
        mu = candidate_mu;
        last_change = (objective - last_objective).abs() / (objective.abs() + 0.1);
        log::trace!(
            "P-IRLS iteration {iteration}: penalized deviance {objective:.6e}, change {last_change:.3e}"
        );
        last_objective = objective;
        if last_change < options.tol {
            let max_abs_eta = eta.iter().fold(0.0_f64, |m, e| m.max(e.abs()));
            if max_abs_eta > SATURATION_ETA_LIMIT {
                log::warn!(
                    "logit fit is quasi-separated: |eta| reaches {max_abs_eta:.1}; fitted probabilities saturate"
                );
            }
            return Ok(PirlsOutcome {
                deviance: calculate_deviance(y, &mu, link),
                beta: Coefficients::new(candidate),
                edf,
                iterations: iteration,
            });
        }
        beta = Some(candidate);
    }

    Err(ModelFitError::PirlsDidNotConverge {
        max_iterations: options.max_iter,
        last_change,
    })
}

impl AdditiveModel for PenalizedSplineModel {
    fn deviance_explained(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<f64, ModelFitError> {
        if x.nrows() != y.len() || y.is_empty() {
            return Err(ModelFitError::InvalidInput(format!(
                "design has {} rows but the response has {}",
                x.nrows(),
                y.len()
            )));
        }
        let link = self.family.link();
        let mu = self.predict_mean(x)?;
        let deviance = calculate_deviance(y, &mu, link);
        let y_mean = y.mean().unwrap_or(0.0);
        let null_mu = Array1::from_elem(y.len(), y_mean);
        let null_deviance = calculate_deviance(y, &null_mu, link);
        if null_deviance <= f64::EPSILON {
            return Err(ModelFitError::InvalidInput(
                "response is constant; deviance explained is undefined".to_string(),
            ));
        }
        Ok(1.0 - deviance / null_deviance)
    }

    fn effective_dof(&self) -> f64 {
        self.edf
    }

    fn num_terms(&self) -> usize {
        self.terms.len()
    }

    fn term_grid(&self, term: usize, n_points: usize) -> Result<Array1<f64>, ModelFitError> {
        if n_points == 0 {
            return Err(ModelFitError::InvalidInput(
                "grid needs at least one point".to_string(),
            ));
        }
        Ok(self.term(term)?.design.grid(n_points))
    }

    fn partial_dependence(
        &self,
        term: usize,
        grid: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, ModelFitError> {
        let fitted = self.term(term)?;
        let block = fitted.design.design(grid);
        let beta = self.beta.slice(s![fitted.coefficients.clone()]);
        Ok(block.dot(&beta))
    }
}
