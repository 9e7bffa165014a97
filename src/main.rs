use circularity::{
    CircularityConfig, CircularityEngine, CircularityError, PenalizedSplineFitter, export_curves,
    load_data, ranking_table,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "circularity")]
#[command(
    about = "Test whether some features are circular (derivable from the others) with respect to a target",
    long_about = None
)]
struct Cli {
    /// JSON configuration file.
    #[arg(long = "config-path", alias = "config_path")]
    config_path: PathBuf,
    /// Do not export plotting curves even if `plot.out_dir` is configured.
    #[arg(long = "skip-curves")]
    skip_curves: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let config = CircularityConfig::from_path(&cli.config_path).map_err(|e| e.to_string())?;
    let data = load_data(&config).map_err(|e| e.to_string())?;
    println!(
        "running the circularity test for {} on {} rows and {} features",
        config.display_name(),
        data.train.x.nrows(),
        data.features.len()
    );

    let mut engine = CircularityEngine::new(&config, PenalizedSplineFitter);
    let report = match engine.run(data.train.x.view(), data.train.y.view(), &data.features) {
        Ok(report) => report,
        Err(e @ CircularityError::InsufficientFit { .. }) => {
            println!("No GAM has a good fit for the data");
            println!("{e}");
            return Ok(());
        }
        Err(e) => return Err(e.to_string()),
    };

    println!("{}", ranking_table(&report.ranking));
    if let Some(path) = &config.save_result_csv {
        println!("result table: {}", path.display());
    }
    if report.verdict.is_circular() {
        println!(
            "Circular features found: {}",
            report.verdict.circular_features.join(", ")
        );
    } else {
        println!("No circular features were found.");
    }

    if cli.skip_curves {
        return Ok(());
    }
    let written = export_curves(
        &config,
        &PenalizedSplineFitter,
        data.train.x.view(),
        data.train.y.view(),
        &data.features,
        &report.verdict.circular_features,
    )
    .map_err(|e| e.to_string())?;
    for (path, curve_set) in written {
        println!("{}: {}", curve_set.title, path.display());
    }
    Ok(())
}
