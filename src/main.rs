use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use embed_lib::configs::{DownloadConfig, PipelineConfig};
use embed_lib::datasets::download::download_extract;
use embed_lib::{pipeline, Configure};

#[derive(Parser)]
#[command(name = "coastal-embed")]
#[command(version, about = "Embedding + k-NN classification of coastal imagery", long_about = None)]
struct Cli {
    /// Debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Class counts, mean/median images and channel histograms of the training split
    Stats {
        /// Pipeline config (RON), defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Train (or reload) the embedding model, fit k-NN and evaluate
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Load the checkpoint instead of training
        #[arg(long)]
        skip_train: bool,
    },
    /// Download and extract the data archives
    Download {
        /// Archive list (RON), the default release archives when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Directory the archives are fetched into
        #[arg(default_value = ".")]
        base_dir: PathBuf,
    },
    /// Write the default pipeline config
    InitConfig {
        path: PathBuf,
        /// Write the default archive list instead
        #[arg(long)]
        download: bool,
    },
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load<C: Configure + Default>(path: Option<PathBuf>) -> Result<C> {
    match path {
        Some(path) => C::from_file(path),
        None => Ok(C::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Stats { config } => {
            let config: PipelineConfig = load(config)?;
            pipeline::run_stats(&config).context("Failed to compute dataset statistics")?;
        }
        Commands::Run { config, skip_train } => {
            let mut config: PipelineConfig = load(config)?;
            if skip_train {
                config.train.do_train = false;
            }
            let summary = pipeline::run(&config, None).context("Pipeline run failed")?;
            if let Some(history) = &summary.history {
                info!(
                    "trained {} epochs, best epoch {:?}, stopped early: {}",
                    history.epochs(),
                    history.best_epoch,
                    history.stopped_early
                );
            }
        }
        Commands::Download { config, base_dir } => {
            let config: DownloadConfig = load(config)?;
            download_extract(&base_dir, &config).context("Download failed")?;
        }
        Commands::InitConfig { path, download } => {
            if download {
                DownloadConfig::default().save(&path)?;
            } else {
                PipelineConfig::default().save(&path)?;
            }
            info!("wrote {}", path.display());
        }
    }
    Ok(())
}
