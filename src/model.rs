//! The additive-model capability the circularity test is written against.
//!
//! A fitter turns term specifications plus data into a fitted model; a fitted
//! model answers the four questions the test asks of it. Any backend (the
//! in-crate penalized spline fitter, a bound native library, a scripted test
//! double) plugs in by implementing these two traits.

use crate::basis::BasisError;
use crate::config::GamOptions;
use crate::faer_ndarray::FaerLinalgError;
use crate::terms::TermSpec;
use ndarray::{Array1, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelFitError {
    #[error("Basis construction failed: {0}")]
    Basis(#[from] BasisError),

    #[error("Penalized system could not be solved: {0}")]
    LinearSystemSolveFailed(FaerLinalgError),

    #[error(
        "P-IRLS failed to converge after {max_iterations} iterations (last relative deviance change {last_change:.3e})."
    )]
    PirlsDidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("Unsupported term type '{0}'.")]
    UnsupportedTerm(String),

    #[error("Invalid model input: {0}")]
    InvalidInput(String),

    #[error("Term index {index} is out of range for a model with {num_terms} terms.")]
    TermOutOfRange { index: usize, num_terms: usize },
}

impl From<FaerLinalgError> for ModelFitError {
    fn from(err: FaerLinalgError) -> Self {
        ModelFitError::LinearSystemSolveFailed(err)
    }
}

/// Fits an additive model over the columns of `x`, one term per spec.
///
/// `terms[i].position` indexes the columns of `x`, which only ever contains the
/// features of the combination being fitted.
pub trait AdditiveModelFitter: Sync {
    type Model: AdditiveModel;

    fn fit(
        &self,
        terms: &[TermSpec],
        options: &GamOptions,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<Self::Model, ModelFitError>;
}

/// A fitted additive model.
pub trait AdditiveModel: Send + Sync {
    /// Fraction of null deviance explained on `(x, y)`, in `[0, 1]` for in-sample data.
    fn deviance_explained(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<f64, ModelFitError>;

    fn effective_dof(&self) -> f64;

    fn num_terms(&self) -> usize;

    /// Sampling grid over the domain of term `term`.
    fn term_grid(&self, term: usize, n_points: usize) -> Result<Array1<f64>, ModelFitError>;

    /// Contribution of term `term` alone at each grid value, on the link scale.
    fn partial_dependence(
        &self,
        term: usize,
        grid: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, ModelFitError>;
}
