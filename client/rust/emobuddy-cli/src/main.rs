use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod auth;
mod live;
mod play;

#[derive(Parser, Debug)]
#[command(author, version, about = "EmoBuddy live voice client")]
struct Cli {
    /// Log as JSON lines instead of text
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Talk to EmoBuddy through the microphone and speakers
    Live(live::LiveArgs),
    /// Play a raw PCM16 mono file once
    Play(play::PlayArgs),
}

fn tracing_init(json: bool) {
    use std::io::IsTerminal;
    use tracing_subscriber::fmt::time::ChronoLocal;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());

    // stderr only; stdout and the level meter line belong to the session.
    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(false)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    tracing_init(cli.log_json);

    match cli.command {
        Commands::Live(args) => live::run_live(args).await,
        Commands::Play(args) => {
            play::run_play(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
