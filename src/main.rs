//! CLI entry point for action-fusion-rs.

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use action_fusion_rs::{FusionConfig, Result, Trainer};

#[derive(Parser)]
#[command(name = "action-fusion")]
#[command(about = "Multi-stream fusion training for video action recognition")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Run-control flags that override the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Resume from checkpoint
    #[arg(long)]
    resume: Option<String>,
    /// Run one validation pass and exit
    #[arg(long)]
    evaluate: bool,
    /// First epoch to run
    #[arg(long)]
    start_epoch: Option<usize>,
    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,
    /// Clips per batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Initial learning rate
    #[arg(long)]
    lr: Option<f64>,
}

impl Overrides {
    fn apply(self, config: &mut FusionConfig) {
        let training = &mut config.training;
        if let Some(resume) = self.resume {
            training.resume = Some(resume);
        }
        if self.evaluate {
            training.evaluate = true;
        }
        if let Some(start_epoch) = self.start_epoch {
            training.start_epoch = start_epoch;
        }
        if let Some(epochs) = self.epochs {
            training.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            training.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            training.learning_rate = lr;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Evaluate a checkpoint on the validation split
    Evaluate {
        /// Path to configuration file
        config: String,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "fusion.yaml")]
        output: String,
        /// Preset (sub-jhmdb, tiny)
        #[arg(long, default_value = "sub-jhmdb")]
        preset: String,
    },
}

fn run_training(config: &str, overrides: Overrides, evaluate: bool) -> Result<()> {
    let mut config = FusionConfig::from_file(config)?;
    overrides.apply(&mut config);
    if evaluate {
        config.training.evaluate = true;
    }

    let mut trainer = Trainer::new(config)?;
    let summary = trainer.run()?;
    if let Some(last) = summary.last {
        println!(
            "Prec@1 {:.3}  Prec@5 {:.3}  Loss {:.4}  ({} videos)",
            last.top1, last.top5, last.loss, last.videos
        );
    }
    if !trainer.config().training.evaluate {
        println!(
            "✓ {} epochs on {}, best Prec@1 {:.3}, checkpoints in {}",
            summary.epochs_run,
            if trainer.device().is_cuda() { "cuda" } else { "cpu" },
            summary.best_prec1,
            trainer.checkpoints().dir().display()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = FusionConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            for stream in &config.model.streams {
                println!(
                    "  Stream: {} ({}, {} frames/stack)",
                    stream.modality, stream.arch, stream.nb_per_stack
                );
            }
            println!("  Classes: {}", config.model.nb_classes);
            println!("  Trainable: {:?}", config.training.trainable);
            println!("  Run directory: {}", config.run_dir().display());
        }
        Commands::Train { config, overrides } => {
            tracing::info!("Starting training with config: {}", config);
            run_training(&config, overrides, false)?;
        }
        Commands::Evaluate { config, overrides } => {
            tracing::info!("Evaluating with config: {}", config);
            run_training(&config, overrides, true)?;
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = FusionConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
