use clap::{Parser, Subcommand};
use kdensity::data::{load_points, write_scores};
use kdensity::model::{FitConfig, TrainedDensity};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "kdensity",
    version,
    about = "Fit and evaluate kernel exponential family densities",
    long_about = "Fits an unnormalised log-density by score matching, with the function space \
                 restricted to kernel derivatives at a Nystrom basis of the training points."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a density to training points
    #[command(about = "Fit a density model (outputs: model.toml)")]
    Fit {
        /// Path to a TSV (or .csv) file with one training point per row
        data: PathBuf,

        /// Path to the fit configuration (.toml)
        #[arg(long)]
        config: PathBuf,

        /// Where to write the fitted model
        #[arg(long, default_value = "model.toml")]
        output: PathBuf,
    },

    /// Evaluate a fitted density at new points
    #[command(about = "Score points with a fitted model (outputs: scores.tsv)")]
    Score {
        /// Path to a TSV (or .csv) file with one query point per row
        data: PathBuf,

        /// Path to the fitted model file (.toml)
        #[arg(long)]
        model: PathBuf,

        /// Where to write log densities and gradients
        #[arg(long, default_value = "scores.tsv")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit {
            data,
            config,
            output,
        } => fit_command(&data, &config, &output),
        Commands::Score {
            data,
            model,
            output,
        } => score_command(&data, &model, &output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn fit_command(
    data_path: &Path,
    config_path: &Path,
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = FitConfig::load(config_path)?;
    let points = Arc::new(load_points(data_path)?);
    println!(
        "Loaded {} points of dimension {} from: {}",
        points.ncols(),
        points.nrows(),
        data_path.display()
    );

    let mut estimator = config.estimator(points)?;
    estimator.fit()?;
    if let Some(strategy) = estimator.solve_strategy() {
        println!("Solved {} coefficients with {}", estimator.system_size(), strategy);
    }
    if estimator.params().base_measure_cov_ridge == 0.0 {
        println!("Training objective: {:.6e}", estimator.objective()?);
    }

    let trained = TrainedDensity::from_estimator(config.kernel, &estimator)?;
    trained.save(output_path)?;
    println!("Model saved to: {}", output_path.display());
    Ok(())
}

fn score_command(
    data_path: &Path,
    model_path: &Path,
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let trained = TrainedDensity::load(model_path)?;
    let points = Arc::new(load_points(data_path)?);

    let estimator = trained.estimator_for(points)?;
    let log_pdfs = estimator.log_pdf_multiple()?;
    let gradients = estimator.grad_multiple()?;

    write_scores(output_path, log_pdfs.view(), gradients.view())?;
    println!(
        "Scored {} points, written to: {}",
        log_pdfs.len(),
        output_path.display()
    );
    Ok(())
}
