use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use digit_classifier::{config::AppConfig, utils, Dataset, Trainer};
use tracing::info;

/// Train and test a one hidden layer classifier on idx image data
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a network, report its accuracy and save it
    Train {
        #[command(flatten)]
        settings: Settings,
        /// Start from a saved network instead of random weights
        #[arg(long, value_name = "PATH")]
        load: Option<PathBuf>,
        /// Log every batch and every test sample
        #[arg(short, long)]
        verbose: bool,
    },
    /// Measure the accuracy of a saved network
    Eval {
        #[command(flatten)]
        settings: Settings,
        #[arg(short, long, value_name = "PATH")]
        model: PathBuf,
        /// Also evaluate on the training set
        #[arg(long)]
        train_set: bool,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the first images of the test set as braille
    Show {
        #[command(flatten)]
        settings: Settings,
        #[arg(short, long, default_value_t = 4)]
        count: usize,
        #[arg(long, default_value_t = 0.5)]
        threshold: f64,
    },
}

#[derive(Args)]
struct Settings {
    /// YAML file with defaults for the options below
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, value_name = "INT")]
    hidden: Option<usize>,
    #[arg(long, value_name = "INT")]
    sample_factor: Option<usize>,
    #[arg(long, value_name = "INT")]
    batch_size: Option<usize>,
    #[arg(long, value_name = "INT")]
    batch_count: Option<usize>,
    #[arg(long, value_name = "FLOAT")]
    rate: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(short, long, value_name = "INT")]
    threads: Option<usize>,
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

impl Settings {
    fn resolve(self) -> anyhow::Result<AppConfig> {
        let file = match &self.config {
            Some(path) => AppConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => AppConfig::default(),
        };

        Ok(file.merge(AppConfig {
            data_dir: self.data_dir,
            hidden_layer_size: self.hidden,
            sample_factor: self.sample_factor,
            batch_size: self.batch_size,
            batch_count: self.batch_count,
            base_rate: self.rate,
            seed: self.seed,
            threads: self.threads,
            output: self.output,
        }))
    }
}

fn main() -> anyhow::Result<()> {
    utils::install_logger()?;
    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            settings,
            load,
            verbose,
        } => {
            let config = settings.resolve()?;
            let mut trainer = Trainer::init(&config.trainer_config()?).context("loading data")?;
            if let Some(path) = load {
                trainer
                    .load_network(&path)
                    .with_context(|| format!("loading network {}", path.display()))?;
            }

            trainer.train(&config.train_params(verbose))?;

            let test = trainer.test(verbose)?;
            info!(accuracy = test, "test data");
            info!("testing on training data ...");
            let train = trainer.test_on_train(false)?;
            info!(accuracy = train, "training data");

            let output = config.output();
            trainer
                .save_network(&output)
                .with_context(|| format!("saving network to {}", output.display()))?;
            info!("the network has been saved to {}", output.display());
        }
        Command::Eval {
            settings,
            model,
            train_set,
            verbose,
        } => {
            let config = settings.resolve()?;
            let mut trainer = Trainer::init(&config.trainer_config()?).context("loading data")?;
            trainer
                .load_network(&model)
                .with_context(|| format!("loading network {}", model.display()))?;

            info!(accuracy = trainer.test(verbose)?, "test data");
            if train_set {
                info!(accuracy = trainer.test_on_train(false)?, "training data");
            }
        }
        Command::Show {
            settings,
            count,
            threshold,
        } => {
            let config = settings.resolve()?.trainer_config()?;
            let data = Dataset::load(&config.test_images, &config.test_labels, config.sample_factor)
                .context("loading data")?;

            for i in 0..count.min(data.len()) {
                print!("[{}] label {}:\n{}", i, data.labels()[i], data.render(i, threshold));
            }
        }
    }

    Ok(())
}
