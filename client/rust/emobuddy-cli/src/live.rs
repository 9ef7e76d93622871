use crate::auth;

use anyhow::{Context, Result};
use clap::Args;
use emobuddy_live::audio::level::DB_FLOOR;
use emobuddy_live::transport::{build_ws_url, redact_ws_url};
use emobuddy_live::{
    ConnectionController, ConnectionState, CpalCapture, CpalOutput, FailureKind, ResampleQuality,
    SessionConfig, SessionEvent, VolumeSample,
};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

const LEVEL_RENDER_INTERVAL: Duration = Duration::from_millis(50);
const BAR_WIDTH: usize = 40;

#[derive(Args, Debug)]
pub struct LiveArgs {
    /// WebSocket URL of the live endpoint (overrides the config file)
    #[arg(long, env = "EMOBUDDY_URL")]
    pub url: Option<String>,

    /// Session configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// API key; falls back to EMOBUDDY_API_KEY, API_KEY, then .env files
    #[arg(long)]
    pub api_key: Option<String>,

    /// Send the API key as a `token` query parameter instead of a header
    #[arg(long)]
    pub query_auth: bool,

    /// Environment name for loading .env.<env>
    #[arg(long, env = "ENV")]
    pub env: Option<String>,

    /// Input device name (default device if omitted)
    #[arg(long)]
    pub device: Option<String>,

    /// Use high-quality resampling
    #[arg(long)]
    pub hq_resample: bool,

    /// Also meter EmoBuddy's voice, not only the microphone
    #[arg(long)]
    pub meter_output: bool,

    /// Hide the level meter
    #[arg(long)]
    pub no_level: bool,
}

fn load_config(args: &LiveArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(url) = &args.url {
        config.endpoint.url = url.clone();
    }
    if args.hq_resample {
        config.capture.resample_quality = ResampleQuality::High;
    }
    if args.meter_output {
        config.meter_output = true;
    }

    let base_dir = std::env::current_dir()?;
    let api_key = auth::resolve_api_key(args.api_key.as_deref(), &base_dir, args.env.as_deref())?;
    if let Some(key) = api_key {
        if args.query_auth {
            config.endpoint.query_token = Some(key);
        } else {
            config.endpoint.auth_token = Some(key);
        }
    }

    if config.endpoint.url.trim().is_empty() {
        anyhow::bail!("no endpoint: pass --url, set EMOBUDDY_URL or endpoint.url in --config");
    }
    Ok(config)
}

pub async fn run_live(args: LiveArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let endpoint = config.endpoint.clone();
    let shown_url = build_ws_url(&endpoint)
        .map(|url| redact_ws_url(&url))
        .unwrap_or_else(|_| endpoint.url.clone());

    let capture = match &args.device {
        Some(name) => CpalCapture::with_device(name.clone()),
        None => CpalCapture::new(),
    };
    let output = CpalOutput::new(config.playback.max_buffer_ms);
    let controller = ConnectionController::new(config, Arc::new(capture), Arc::new(output));

    let stderr_is_tty = std::io::stderr().is_terminal();
    let show_level = !args.no_level && stderr_is_tty;

    eprintln!("Connecting to {shown_url}...");
    if let Err(err) = controller.connect(&endpoint).await {
        eprintln!("Could not start session: {err}");
        eprintln!("{}", advice(err.kind()));
        return Ok(ExitCode::from(exit_status(err.kind())));
    }
    eprintln!("Connected! Say hello to EmoBuddy... (Ctrl+C to stop)");

    let level_task = show_level.then(|| spawn_level_task(controller.subscribe_volume()));
    let mut states = controller.subscribe_state();
    let mut events = controller.subscribe_events();

    let status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                clear_status_line(show_level);
                eprintln!("Disconnecting...");
                controller.disconnect().await;
                break 0;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break 0;
                }
                let state = states.borrow_and_update().clone();
                clear_status_line(show_level);
                match state {
                    ConnectionState::Failed(err) => {
                        eprintln!("Session failed: {err}");
                        eprintln!("{}", advice(err.kind()));
                        break exit_status(err.kind());
                    }
                    ConnectionState::Closed => break 0,
                    other => eprintln!("state: {other:?}"),
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Control(kind)) => {
                    clear_status_line(show_level);
                    eprintln!("event: {kind:?}");
                }
                Ok(SessionEvent::RemoteError { code, message }) => {
                    clear_status_line(show_level);
                    eprintln!("server error {code}: {message}");
                }
                Ok(SessionEvent::ChunkDropped { reason }) => debug!(?reason, "chunk dropped"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break 0,
            },
        }
    };

    if let Some(task) = level_task {
        task.abort();
        let _ = task.await;
    }
    clear_status_line(show_level);

    // A failed session may still be playing out its last words.
    controller.wait_released().await;
    Ok(ExitCode::from(status))
}

fn exit_status(kind: FailureKind) -> u8 {
    match kind {
        FailureKind::UserActionRequired => 2,
        FailureKind::RetryLater => 3,
        FailureKind::ServiceUnavailable => 4,
    }
}

fn advice(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::UserActionRequired => {
            "Check microphone permissions, audio devices and your API key."
        }
        FailureKind::RetryLater => "Please try again in a moment.",
        FailureKind::ServiceUnavailable => "The voice service is unavailable right now.",
    }
}

fn clear_status_line(show_level: bool) {
    if show_level {
        eprint!("\r\x1b[2K");
        let _ = std::io::stderr().flush();
    }
}

fn level_bar(db: f32) -> String {
    let normalized = ((db - DB_FLOOR) / -DB_FLOOR).clamp(0.0, 1.0);
    let filled = (normalized * BAR_WIDTH as f32) as usize;
    let mut bar = String::with_capacity(BAR_WIDTH * 3);
    for i in 0..BAR_WIDTH {
        bar.push(if i < filled { '█' } else { '░' });
    }
    bar
}

fn render_level_meter(sample: &VolumeSample) {
    let db = sample.to_db();
    eprint!("\r\x1b[2KLevel: [{}] {:6.1} dB", level_bar(db), db);
    let _ = std::io::stderr().flush();
}

fn spawn_level_task(mut rx: watch::Receiver<VolumeSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(LEVEL_RENDER_INTERVAL);
        loop {
            ticker.tick().await;
            let sample = *rx.borrow_and_update();
            render_level_meter(&sample);
        }
    })
}
