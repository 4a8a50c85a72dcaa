use clap::{Args, Parser, Subcommand, ValueEnum};
use margins::replicate::write_draws_tsv;
use margins::report::write_tsv;
use margins::{
    By, Call, Dataset, Estimates, FittedModel, InferenceOptions, ModelRegistry, inferences,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "margins",
    version,
    about = "Adjusted predictions, comparisons and slopes with replicate-based uncertainty."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model and print its coefficient table
    Fit(ModelArgs),

    #[command(about = "Compute predictions, comparisons or slopes (prints a table; --output writes TSV)")]
    Estimate(EstimateArgs),

    #[command(about = "Write replicate draws of a quantity (outputs: draws.tsv unless --output is given)")]
    Draws(EstimateArgs),
}

#[derive(Args)]
struct ModelArgs {
    /// Path to a tab-separated data file with a header row
    data: PathBuf,

    /// Model formula, e.g. "y ~ x1 * x2"
    #[arg(long)]
    formula: String,

    /// Registered model tag (lm, logit, poisson)
    #[arg(long, default_value = "lm")]
    model: String,

    /// Column holding case weights for the fit
    #[arg(long)]
    weights: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum QuantityCli {
    Predictions,
    Comparisons,
    Slopes,
}

#[derive(Args)]
struct EstimateArgs {
    #[command(flatten)]
    model: ModelArgs,

    #[arg(long, value_enum, default_value_t = QuantityCli::Predictions)]
    quantity: QuantityCli,

    /// Focal variable for comparisons and slopes
    #[arg(long)]
    variable: Option<String>,

    /// Average within groups defined by these columns
    #[arg(long, num_args = 1.., conflicts_with = "average")]
    by: Vec<String>,

    /// Average over all rows
    #[arg(long)]
    average: bool,

    /// Replication method (simulation, boot, rsample, fwb)
    #[arg(long)]
    method: Option<String>,

    /// Number of replicates
    #[arg(long, default_value = "500")]
    replicates: usize,

    /// Seed for the replicate stream; overrides the options file
    #[arg(long)]
    seed: Option<u64>,

    /// TOML file with inference options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output path for the TSV table
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let start_time = Instant::now();

    let result = match cli.command {
        Commands::Fit(args) => run_fit(args),
        Commands::Estimate(args) => run_estimate(args),
        Commands::Draws(args) => run_draws(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    log::info!("Finished in {:.2?}", start_time.elapsed());
}

fn fit_model(args: &ModelArgs) -> Result<Arc<FittedModel>, Box<dyn std::error::Error>> {
    let data = Arc::new(Dataset::from_tsv(&args.data)?);
    log::info!(
        "Loaded {} rows and {} columns from '{}'",
        data.nrows(),
        data.ncols(),
        args.data.display()
    );
    let model =
        ModelRegistry::default().fit(&args.model, &args.formula, data, args.weights.as_deref())?;
    Ok(Arc::new(model))
}

fn run_fit(args: ModelArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = fit_model(&args)?;
    println!("{model}");
    Ok(())
}

fn build_call(args: &EstimateArgs) -> Result<Call, Box<dyn std::error::Error>> {
    let variable = || {
        args.variable
            .clone()
            .ok_or("--variable is required for comparisons and slopes")
    };
    let call = match args.quantity {
        QuantityCli::Predictions => Call::predictions(),
        QuantityCli::Comparisons => Call::comparisons(variable()?),
        QuantityCli::Slopes => Call::slopes(variable()?),
    };
    let by = if args.average {
        By::Average
    } else if !args.by.is_empty() {
        By::Columns(args.by.clone())
    } else {
        By::None
    };
    Ok(call.by(by))
}

fn load_options(args: &EstimateArgs) -> Result<InferenceOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.config {
        Some(path) => InferenceOptions::from_toml_file(path)?,
        None => InferenceOptions::default(),
    };
    if args.seed.is_some() {
        options.seed = args.seed;
    }
    options.progress = true;
    Ok(options)
}

fn replicate(
    args: &EstimateArgs,
    estimates: &Estimates,
    method: &str,
) -> Result<Estimates, Box<dyn std::error::Error>> {
    let options = load_options(args)?;
    Ok(inferences(estimates, method, args.replicates, &options)?)
}

fn run_estimate(args: EstimateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = fit_model(&args.model)?;
    let mut estimates = Estimates::compute(model, build_call(&args)?)?;
    if let Some(method) = &args.method {
        estimates = replicate(&args, &estimates, method)?;
    }

    println!("{estimates}");
    if let Some(path) = &args.output {
        write_tsv(&estimates, path)?;
    }
    Ok(())
}

fn run_draws(args: EstimateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let method = args
        .method
        .clone()
        .ok_or("--method is required to produce draws")?;
    let model = fit_model(&args.model)?;
    let estimates = Estimates::compute(model, build_call(&args)?)?;
    let estimates = replicate(&args, &estimates, &method)?;

    let path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("draws.tsv"));
    write_draws_tsv(&estimates, &path)?;
    Ok(())
}
