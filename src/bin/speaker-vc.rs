//! speaker-vc CLI: configuration check.
//!
//! Loads an experiment configuration, builds the train and test losses and the
//! speaker autoencoder, then runs one synthetic batch through model and loss.
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"train_loss":"MSELoss","test_loss":"MSELoss","loss":0.0123,"output_shape":[2,1,16384]}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use speaker_vc::{
    config::{ExperimentConfig, Stage},
    device::preferred_device,
    losses::Losses,
    model::{SpeakerAutoencoder, SpeakerParameters},
};

#[derive(Parser, Debug)]
#[command(name = "speaker-vc", about = "Speaker-conditioned voice conversion tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration and run one synthetic step.
    Check {
        /// Experiment configuration (JSON).
        #[arg(long, short = 'c')]
        config: std::path::PathBuf,

        /// Force the CPU even when an accelerator is available.
        #[arg(long)]
        cpu: bool,

        /// Synthetic batch size.
        #[arg(long, default_value_t = 2)]
        batch: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Args::parse().command {
        Command::Check { config, cpu, batch } => check(&config, cpu, batch),
    }
}

fn check(path: &std::path::Path, cpu: bool, batch: usize) -> anyhow::Result<()> {
    if batch == 0 {
        anyhow::bail!("batch must be at least 1");
    }
    let cfg = ExperimentConfig::from_json_file(path)
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;

    let device = if cpu { Device::Cpu } else { preferred_device(0) };
    tracing::info!("Using device: {:?}", device);

    let train = Losses::from_config(&cfg, Stage::Train, &device)?;
    let test = Losses::from_config(&cfg, Stage::Test, &device)?;

    let model = if cfg.model.ae_path.is_some() {
        SpeakerAutoencoder::load(&cfg.model, &device)?.0
    } else {
        tracing::warn!("model.ae_path is not set, using randomly initialised weights");
        SpeakerAutoencoder::new(&cfg.model, &SpeakerParameters::new(), &device)?
    };

    let block = cfg.dataset.block_size;
    let input = Tensor::randn(0f32, 0.1, (batch, 1, block), &device)?;
    let target = Tensor::randn(0f32, 0.1, (batch, 1, block), &device)?;
    let dvec = Tensor::randn(0f32, 1.0, (batch, cfg.model.emb_size), &device)?;
    let norm = dvec.sqr()?.sum_keepdim(1)?.sqrt()?;
    let dvec = dvec.broadcast_div(&norm)?;

    let predicted = model.forward_t(&input, &dvec, false)?;
    let loss = train
        .forward(&predicted, &target, Some(&dvec))?
        .to_scalar::<f32>()?;

    println!(
        r#"{{"train_loss":"{train}","test_loss":"{test}","loss":{loss},"output_shape":{shape:?}}}"#,
        train = train.kind(),
        test = test.kind(),
        shape = predicted.dims(),
    );
    Ok(())
}
