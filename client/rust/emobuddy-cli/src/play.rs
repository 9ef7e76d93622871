use anyhow::{Context, Result};
use clap::Args;
use emobuddy_live::config::DEFAULT_OUTPUT_SAMPLE_RATE_HZ;
use emobuddy_live::{CpalOutput, play_buffer};
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct PlayArgs {
    /// Raw little-endian PCM16 mono file
    pub path: PathBuf,

    /// Sample rate of the file in Hz
    #[arg(long, default_value_t = DEFAULT_OUTPUT_SAMPLE_RATE_HZ)]
    pub sample_rate: u32,
}

pub async fn run_play(args: PlayArgs) -> Result<()> {
    let bytes = tokio::fs::read(&args.path)
        .await
        .with_context(|| format!("Failed to read {}", args.path.display()))?;

    let output = CpalOutput::default();
    let played = play_buffer(&output, &bytes, args.sample_rate)
        .await
        .context("Playback failed")?;

    info!(seconds = played.as_secs_f64(), path = %args.path.display(), "played buffer");
    Ok(())
}
