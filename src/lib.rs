#![deny(dead_code)]

pub mod basis;
pub mod circularity;
pub mod config;
pub mod curves;
pub mod data;
pub mod faer_ndarray;
pub mod model;
pub mod nullification;
pub mod pirls;
pub mod powerset;
pub mod report;
pub mod selection;
pub mod terms;
pub mod types;

pub use circularity::{
    CircularityEngine, CircularityError, CircularityReport, CircularityVerdict, TestStage,
};
pub use config::{CircularityConfig, GamOptions, PlotConfig, PlotKind};
pub use curves::{CurveSet, PlotRequest, TermCurve, export_curves, resolve_plot_requests};
pub use data::{Dataset, Partition, TrainTestData, load_data};
pub use model::{AdditiveModel, AdditiveModelFitter, ModelFitError};
pub use nullification::{DEFAULT_GRID_POINTS, check_nullification};
pub use pirls::{PenalizedSplineFitter, PenalizedSplineModel};
pub use powerset::feature_powerset;
pub use report::{ResultRow, ranking_table, read_result_table, write_result_table};
pub use selection::{FitResult, rank_results, select_candidate};
pub use terms::{TermSpec, TermType, build_term_specs};
pub use types::{Distribution, LikelihoodFamily, LinkFunction};
