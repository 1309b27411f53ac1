#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use delinq::config::PipelineConfig;
use delinq::data::load_observations;
use delinq::export::write_artifacts;
use delinq::pipeline::{PipelineOutcome, run_pipeline};
use delinq::reclassify::reclassify;

#[derive(Args)]
pub struct InputArgs {
    /// Performance table: entity id, reporting period, delinquency status
    pub performance: PathBuf,

    /// Origination table: entity id, tier covariate (e.g. credit score)
    pub origination: PathBuf,

    /// TOML configuration file; every field is optional
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Cumulative-frequency threshold for collapsing rare statuses
    #[arg(long, value_name = "X")]
    pub threshold: Option<f64>,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Directory receiving the prediction and transition CSVs and report.toml
    #[arg(long, value_name = "DIR", default_value = "delinq_output")]
    pub out_dir: PathBuf,

    /// Seed for both the entity split and the classifier
    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Fit the partitions concurrently
    #[arg(long)]
    pub parallel: bool,
}

#[derive(Parser)]
#[command(
    name = "delinq",
    about = "Forecast delinquency state transitions and score their calibration"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and write artifacts
    Run(RunArgs),
    /// Print the status frequency table and the chosen cut point
    Summarize(InputArgs),
}

fn load_config(input: &InputArgs) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &input.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            PipelineConfig::load(path)?
        }
        None => PipelineConfig::default(),
    };
    if let Some(threshold) = input.threshold {
        config.reclassify.threshold = threshold;
    }
    Ok(config)
}

fn print_outcome(outcome: &PipelineOutcome) {
    println!();
    println!("{}", outcome.status_summary);
    println!(
        "Retained codes 0..={}{}",
        outcome.retained_max,
        if outcome.collapsed {
            format!("; higher codes collapsed to {}", outcome.retained_max + 1)
        } else {
            String::new()
        }
    );
    println!(
        "{} observations -> {} pairs over states {:?}; {} train / {} test entities",
        outcome.observations,
        outcome.pairs,
        outcome.states,
        outcome.train_entities,
        outcome.test_entities
    );

    for partition in &outcome.partitions {
        println!();
        println!(
            "=== Partition '{}' ({} train rows, {} test rows) ===",
            partition.name, partition.train_rows, partition.test_rows
        );
        println!(
            "Fit: {:?} after {} epochs (loss {:.6})",
            partition.fit.status, partition.fit.epochs, partition.fit.final_loss
        );
        println!("Transition matrix");
        print!("{}", partition.transition.table(&outcome.states));
        println!("{}", partition.calibration);
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(&args.input)?;
    if let Some(seed) = args.seed {
        config.split.seed = seed;
        config.classifier.seed = seed;
    }
    if args.parallel {
        config.parallel = true;
    }
    config.validate()?;

    let loaded = load_observations(
        &args.input.performance,
        &args.input.origination,
        &config.input,
    )?;
    println!("Loaded {} observations", loaded.observations.len());

    let outcome = run_pipeline(&loaded.observations, &loaded.covariate_names, &config)?;
    print_outcome(&outcome);

    let written = write_artifacts(&outcome, &args.out_dir)?;
    println!();
    for path in written
        .prediction_files
        .iter()
        .chain(&written.transition_files)
    {
        println!("Wrote {}", path.display());
    }
    println!("Report saved to: {}", written.report.display());
    Ok(())
}

fn summarize(args: InputArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    config.validate()?;
    let loaded = load_observations(&args.performance, &args.origination, &config.input)?;
    let reclassified = reclassify(&loaded.observations, &config.reclassify)?;

    println!("{}", reclassified.summary);
    println!(
        "Threshold {} keeps codes 0..={}; states after collapsing: {:?}",
        config.reclassify.threshold,
        reclassified.retained_max,
        reclassified.state_space()
    );
    println!(
        "{} of {} observations dropped for a missing status, the '{}' sentinel, or a missing tier covariate",
        reclassified.dropped_rows,
        loaded.observations.len(),
        config.reclassify.sentinel
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Summarize(args)) => summarize(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
