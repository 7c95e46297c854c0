use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use voice_tamper_detector::{
    feature_extractor::feature_names,
    server::{self, AppState},
    AppConfig, ClassificationOutcome, FakeGenerator, FeatureExtractor, InferenceService,
    Result, TrainingPipeline,
};

/// Detects voice recordings that have been manipulated
#[derive(Parser, Debug)]
#[command(name = "voice_tamper_detector", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "VOICE_TAMPER_CONFIG")]
    config: Option<PathBuf>,

    /// Model path (overrides the configured one); `.onnx` needs the onnx feature
    #[arg(short, long, global = true)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the feature vector of one audio file
    Extract {
        file: PathBuf,
        /// Emit a JSON array instead of one named value per line
        #[arg(long)]
        json: bool,
    },
    /// Train on the real/fake folders and write the model artifact
    Train {
        #[arg(long)]
        real_dir: Option<PathBuf>,
        #[arg(long)]
        fake_dir: Option<PathBuf>,
    },
    /// Classify one audio file
    Classify {
        file: PathBuf,
        /// Emit the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the upload server
    Serve {
        /// Address to bind, e.g. 0.0.0.0:5000
        #[arg(long)]
        bind: Option<String>,
    },
    /// Write slowed, sped-up, pitch-shifted and noisy copies of the real clips
    GenerateFakes {
        #[arg(long)]
        real_dir: Option<PathBuf>,
        #[arg(long)]
        fake_dir: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.model_path.0 = model;
    }

    match cli.command {
        Command::Extract { file, json } => extract(&config, file, json),
        Command::Train { real_dir, fake_dir } => {
            if let Some(dir) = real_dir {
                config.training.real_dir = dir;
            }
            if let Some(dir) = fake_dir {
                config.training.fake_dir = dir;
            }
            train(config)
        }
        Command::Classify { file, json } => classify(&config, file, json),
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            serve(config).await
        }
        Command::GenerateFakes {
            real_dir,
            fake_dir,
            seed,
        } => {
            let mut generator = FakeGenerator::new(
                config.features.sample_rate,
                real_dir.unwrap_or(config.training.real_dir),
                fake_dir.unwrap_or(config.training.fake_dir),
                config.training.extensions,
            );
            if let Some(seed) = seed {
                generator = generator.with_seed(seed);
            }
            let summary = generator.run()?;
            println!(
                "Generated {} fake files from {} clips ({} skipped)",
                summary.created,
                summary.processed,
                summary.skipped.len()
            );
            Ok(())
        }
    }
}

fn extract(config: &AppConfig, file: PathBuf, json: bool) -> Result<()> {
    let extractor = FeatureExtractor::new(config.features.clone())?;
    let features = extractor
        .extract(&file)
        .with_context(|| format!("Failed to extract features from {}", file.display()))?;

    if json {
        println!("{}", serde_json::to_string(&features)?);
    } else {
        for (name, value) in feature_names(extractor.config()).iter().zip(features.as_slice()) {
            println!("{name:>16} {value:.6}");
        }
    }
    Ok(())
}

fn train(config: AppConfig) -> Result<()> {
    info!(
        "Training from {} (original) and {} (manipulated)",
        config.training.real_dir.display(),
        config.training.fake_dir.display()
    );
    let extractor = FeatureExtractor::new(config.features)?;
    let pipeline = TrainingPipeline::new(extractor, config.training);
    let outcome = pipeline.run(&config.model_path.0)?;

    match &outcome.report {
        Some(report) => println!("{report}"),
        None => println!("No held-out samples; evaluation skipped"),
    }
    println!(
        "\nModel saved to {} ({} train, {} test, {} files skipped)",
        outcome.artifact_path.display(),
        outcome.n_train,
        outcome.n_test,
        outcome.n_failures
    );
    Ok(())
}

fn classify(config: &AppConfig, file: PathBuf, json: bool) -> Result<()> {
    let service = InferenceService::from_artifact(&config.model_path.0, config.features.clone())
        .with_context(|| format!("Failed to load model {}", config.model_path.0.display()))?;
    let outcome = service.classify(&file);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}: {}", file.display(), outcome);
    }

    if let ClassificationOutcome::Failed { .. } = outcome {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let service = InferenceService::from_artifact(&config.model_path.0, config.features.clone())
        .with_context(|| format!("Failed to load model {}", config.model_path.0.display()))?;
    let bind_addr = config.server.bind_addr.clone();
    let state = AppState::new(service, config.server)
        .context("Failed to prepare upload directory")?;
    server::serve(state, &bind_addr)
        .await
        .with_context(|| format!("Server on {} stopped", bind_addr))?;
    Ok(())
}
