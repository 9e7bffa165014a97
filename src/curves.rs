//! Term curves for plotting.
//!
//! Nothing is rendered here. Each requested plot kind becomes a refit of the
//! GAM on its feature set (with per-feature plot overrides applied to the
//! terms), sampled into `(x, partial dependence)` curves and written as CSV for
//! an external renderer.

use crate::circularity::{CircularityError, combination_columns};
use crate::config::{CircularityConfig, PlotKind};
use crate::model::{AdditiveModel, AdditiveModelFitter, ModelFitError};
use crate::nullification::DEFAULT_GRID_POINTS;
use crate::selection::deviance_explained_pct;
use crate::terms::build_term_specs;
use csv::WriterBuilder;
use ndarray::{Array1, ArrayView1, ArrayView2};
use std::fs;
use std::path::{Path, PathBuf};

/// A plot kind resolved to the features it shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotRequest {
    pub kind: PlotKind,
    pub features: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TermCurve {
    pub feature: String,
    pub grid: Array1<f64>,
    pub partial_dependence: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct CurveSet {
    pub kind: PlotKind,
    pub title: String,
    pub deviance_explained_pct: i64,
    pub curves: Vec<TermCurve>,
}

fn kind_name(kind: PlotKind) -> &'static str {
    match kind {
        PlotKind::Circular => "circular",
        PlotKind::NonCircular => "non_circular",
        PlotKind::All => "all",
        PlotKind::DecisionFunction => "decision_function",
    }
}

/// Maps the configured plot kinds (default: `all`) to feature sets. Kinds that
/// need circular features are skipped when there are none, and
/// `decision_function` also needs a configured decision function.
pub fn resolve_plot_requests(
    config: &CircularityConfig,
    full_features: &[String],
    circular_features: &[String],
) -> Vec<PlotRequest> {
    let plot = config.plot_config();
    let kinds = if plot.types.is_empty() {
        vec![PlotKind::All]
    } else {
        plot.types
    };

    let mut requests = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let features = match kind {
            PlotKind::All => full_features.to_vec(),
            PlotKind::NonCircular => full_features
                .iter()
                .filter(|f| !circular_features.contains(f))
                .cloned()
                .collect(),
            PlotKind::Circular | PlotKind::DecisionFunction if circular_features.is_empty() => {
                log::info!(
                    "no circular features were found; skipping the '{}' plot",
                    kind_name(kind)
                );
                continue;
            }
            PlotKind::DecisionFunction if config.decision_function.is_none() => {
                log::warn!("no decision_function is configured; skipping the 'decision_function' plot");
                continue;
            }
            PlotKind::Circular | PlotKind::DecisionFunction => circular_features.to_vec(),
        };
        if features.is_empty() {
            log::info!("'{}' plot has no features; skipping", kind_name(kind));
            continue;
        }
        requests.push(PlotRequest { kind, features });
    }
    requests
}

fn plot_title(
    features: &[String],
    full_features: &[String],
    circular_features: &[String],
    versus_decision_function: bool,
    pct: i64,
) -> String {
    let mut sorted = features.to_vec();
    sorted.sort();
    let which = if features == full_features {
        "with all features".to_string()
    } else if !circular_features.is_empty() && sorted == circular_features {
        "with circular features".to_string()
    } else if !circular_features.is_empty()
        && !features.iter().any(|f| circular_features.contains(f))
    {
        "without circular features".to_string()
    } else {
        format!("with {}", features.join(", "))
    };
    let suffix = if versus_decision_function {
        " vs. decision function"
    } else {
        ""
    };
    format!("GAM {which}{suffix}, D²: {pct}%")
}

/// Refits on `request.features` with plot overrides and samples every term.
pub fn term_curves<F: AdditiveModelFitter>(
    config: &CircularityConfig,
    fitter: &F,
    request: &PlotRequest,
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    full_features: &[String],
    circular_features: &[String],
) -> Result<CurveSet, CircularityError> {
    let plot = config.plot_config();
    let x_sub = combination_columns(x, full_features, &request.features)?;
    let terms = build_term_specs(config, &request.features, Some(&plot));
    let wrap = |source: ModelFitError| CircularityError::ModelFit {
        combination: request.features.clone(),
        source,
    };

    let model = fitter
        .fit(&terms, &config.gam_options(), x_sub.view(), y)
        .map_err(wrap)?;
    let pct = deviance_explained_pct(model.deviance_explained(x_sub.view(), y).map_err(wrap)?);

    let mut curves = Vec::with_capacity(request.features.len());
    for (term, feature) in request.features.iter().enumerate() {
        let n = plot.grid_points_for(feature).unwrap_or(DEFAULT_GRID_POINTS);
        let grid = model.term_grid(term, n).map_err(wrap)?;
        let partial_dependence = model.partial_dependence(term, grid.view()).map_err(wrap)?;
        curves.push(TermCurve {
            feature: feature.clone(),
            grid,
            partial_dependence,
        });
    }

    Ok(CurveSet {
        kind: request.kind,
        title: plot_title(
            &request.features,
            full_features,
            circular_features,
            request.kind == PlotKind::DecisionFunction,
            pct,
        ),
        deviance_explained_pct: pct,
        curves,
    })
}

pub fn write_curves_csv(path: &Path, curve_set: &CurveSet) -> Result<(), CircularityError> {
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;
    wtr.write_record(["feature", "x", "partial_dependence"])?;
    for curve in &curve_set.curves {
        for (x, pd) in curve.grid.iter().zip(curve.partial_dependence.iter()) {
            wtr.write_record([curve.feature.clone(), format!("{x:.12}"), format!("{pd:.12}")])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Computes and writes every requested curve set into `plot.out_dir`,
/// returning the written paths. Does nothing without an output directory.
pub fn export_curves<F: AdditiveModelFitter>(
    config: &CircularityConfig,
    fitter: &F,
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    full_features: &[String],
    circular_features: &[String],
) -> Result<Vec<(PathBuf, CurveSet)>, CircularityError> {
    let Some(out_dir) = config.plot_config().out_dir else {
        return Ok(Vec::new());
    };
    fs::create_dir_all(&out_dir)?;

    let mut written = Vec::new();
    for request in resolve_plot_requests(config, full_features, circular_features) {
        let curve_set = term_curves(
            config,
            fitter,
            &request,
            x,
            y,
            full_features,
            circular_features,
        )?;
        let path = out_dir.join(format!("curves_{}.csv", kind_name(request.kind)));
        write_curves_csv(&path, &curve_set)?;
        log::info!("{} written to {}", curve_set.title, path.display());
        written.push((path, curve_set));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pirls::PenalizedSplineFitter;
    use ndarray::Array2;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn config(extra: serde_json::Value) -> CircularityConfig {
        let mut raw = serde_json::json!({
            "features": ["a", "b"],
            "target": "y",
            "data": { "train": "unused.csv" }
        });
        if let (Some(base), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        CircularityConfig::from_json_str(&raw.to_string()).expect("config")
    }

    #[test]
    fn default_plot_kind_is_all() {
        let cfg = config(serde_json::json!({}));
        let requests = resolve_plot_requests(&cfg, &names(&["a", "b"]), &[]);
        assert_eq!(
            requests,
            vec![PlotRequest {
                kind: PlotKind::All,
                features: names(&["a", "b"]),
            }]
        );
    }

    #[test]
    fn circular_kinds_need_circular_features() {
        let cfg = config(serde_json::json!({
            "plot": { "types": ["circular", "non_circular", "decision_function"] }
        }));
        let full = names(&["a", "b"]);
        let none = resolve_plot_requests(&cfg, &full, &[]);
        assert_eq!(none.len(), 1);
        assert_eq!(none[0].kind, PlotKind::NonCircular);
        assert_eq!(none[0].features, full);

        let found = resolve_plot_requests(&cfg, &full, &names(&["a"]));
        let kinds: Vec<PlotKind> = found.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![PlotKind::Circular, PlotKind::NonCircular]);
        assert_eq!(found[1].features, names(&["b"]));

        let with_df = config(serde_json::json!({
            "plot": { "types": ["decision-function"] },
            "decision_function": { "expression": "a > 0.5" }
        }));
        let df = resolve_plot_requests(&with_df, &full, &names(&["a"]));
        assert_eq!(df[0].kind, PlotKind::DecisionFunction);
        assert_eq!(df[0].features, names(&["a"]));
    }

    #[test]
    fn titles_follow_the_feature_set() {
        let full = names(&["a", "b", "c"]);
        let circ = names(&["a"]);
        assert_eq!(plot_title(&full, &full, &circ, false, 97), "GAM with all features, D²: 97%");
        assert_eq!(plot_title(&circ, &full, &circ, false, 95), "GAM with circular features, D²: 95%");
        assert_eq!(
            plot_title(&names(&["b", "c"]), &full, &circ, false, 40),
            "GAM without circular features, D²: 40%"
        );
        assert_eq!(
            plot_title(&names(&["c"]), &full, &circ, false, 35),
            "GAM without circular features, D²: 35%"
        );
        assert_eq!(
            plot_title(&names(&["a", "c"]), &full, &circ, false, 60),
            "GAM with a, c, D²: 60%"
        );
        assert_eq!(
            plot_title(&names(&["b", "c"]), &full, &[], false, 50),
            "GAM with b, c, D²: 50%"
        );
    }

    #[test]
    fn decision_function_titles_carry_the_suffix() {
        let full = names(&["a", "b"]);
        let circ = names(&["a"]);
        assert_eq!(
            plot_title(&circ, &full, &circ, true, 100),
            "GAM with circular features vs. decision function, D²: 100%"
        );
        let unsorted = names(&["c", "a"]);
        let circ_ac = names(&["a", "c"]);
        assert_eq!(
            plot_title(&unsorted, &names(&["a", "b", "c"]), &circ_ac, false, 90),
            "GAM with circular features, D²: 90%"
        );
    }

    #[test]
    fn curves_use_the_plot_grid_size() {
        let n = 50;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                i as f64 / (n - 1) as f64
            } else {
                ((i * 17) % n) as f64 / n as f64
            }
        });
        let y = x.column(0).mapv(|a| (3.0 * a).sin());
        let cfg = config(serde_json::json!({
            "plot": { "a": { "n": 30, "xlim": [0, 1] } }
        }));
        let request = PlotRequest {
            kind: PlotKind::All,
            features: names(&["a", "b"]),
        };
        let set = term_curves(
            &cfg,
            &PenalizedSplineFitter,
            &request,
            x.view(),
            y.view(),
            &names(&["a", "b"]),
            &[],
        )
        .expect("curves");
        assert_eq!(set.curves.len(), 2);
        assert_eq!(set.curves[0].grid.len(), 30);
        assert_eq!(set.curves[1].grid.len(), DEFAULT_GRID_POINTS);
        assert!(set.title.starts_with("GAM with all features, D²: "));
        assert!(set.deviance_explained_pct > 90);
    }
}
