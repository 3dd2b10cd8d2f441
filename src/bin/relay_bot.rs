#![forbid(unsafe_code)]

//! Scheduled relay: picks up new items from a channel, downloads them and
//! pushes them to the configured destination.

use anyhow::{Context, Result};
use channel_relay::config::{RelayConfig, RelayOverrides, resolve_config};
use channel_relay::cookies::CookieFile;
use channel_relay::fetch::DownloadEngine;
use channel_relay::http::api_agent;
use channel_relay::ledger::{GitCommitter, Ledger, LedgerStore, RemoteCommitter};
use channel_relay::model::RunSummary;
use channel_relay::pacing::ThreadSleeper;
use channel_relay::runner::{HttpThumbnails, RunController, RunLimits};
use channel_relay::translate::{FALLBACK_TITLE_FILE, TitleTranslator, build_chain};
use channel_relay::upload::build_destination;
use channel_relay::ytdlp::{YtDlp, run_with_timeout};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "relay_bot")]
#[command(about = "Relay new channel uploads to Dropbox or YouTube")]
struct Cli {
    /// Dotenv-style file with settings (default: .env)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Channel page to watch (overrides CHANNEL_URL)
    #[arg(long)]
    channel_url: Option<String>,

    /// Successful uploads to stop after (overrides MAX_VIDEOS)
    #[arg(long)]
    max_videos: Option<usize>,

    /// Failed candidates tolerated before stopping (overrides SKIP_LIMIT)
    #[arg(long)]
    skip_limit: Option<usize>,

    /// Download attempts per candidate (overrides DOWNLOAD_RETRIES)
    #[arg(long)]
    retries: Option<u32>,

    /// Directory holding the ledger files (overrides STATE_DIR)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Scratch directory for downloads (overrides WORK_DIR)
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

impl From<Cli> for RelayOverrides {
    fn from(cli: Cli) -> Self {
        RelayOverrides {
            channel_url: cli.channel_url,
            success_quota: cli.max_videos,
            skip_budget: cli.skip_limit,
            retry_budget: cli.retries,
            state_dir: cli.state_dir,
            work_dir: cli.work_dir,
            env_path: cli.env_file,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = resolve_config(Cli::parse().into())?;

    println!("===================================");
    println!("Channel Relay");
    println!("===================================");
    println!("Channel: {}", config.channel_url);
    println!("Destination: {}", config.destination.label());
    println!(
        "Quota: {} | Skip limit: {} | Retries: {}",
        config.success_quota, config.skip_budget, config.retry_budget
    );
    println!("State directory: {}", config.state_dir.display());
    println!("Work directory: {}", config.work_dir.display());
    println!();

    let summary = relay(&config)?;

    println!();
    println!("===================================");
    println!("Run finished: {}", summary.stop.describe());
    println!("===================================");
    print_summary(&summary);
    Ok(())
}

fn relay(config: &RelayConfig) -> Result<RunSummary> {
    fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("creating {}", config.work_dir.display()))?;
    fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating {}", config.state_dir.display()))?;

    let cookies = CookieFile::install(&config.work_dir, config.cookies.as_ref())?;
    let yt_dlp = YtDlp::new(&config.yt_dlp, config.user_agent.clone())
        .with_cookies(cookies.as_ref().map(|guard| guard.path().to_path_buf()));
    let version = yt_dlp.ensure_available()?;
    info!("Using yt-dlp {}", version);
    warn_if_ffmpeg_missing();

    let destination = build_destination(&config.destination, &config.user_agent);
    destination
        .prepare()
        .with_context(|| format!("preparing {} destination", destination.name()))?;

    let git = config
        .git_remote
        .clone()
        .map(|remote| GitCommitter::new(remote, &config.state_dir));
    if git.is_none() {
        info!("No git token configured; ledger changes stay local");
    }
    let ledger = Ledger::new(
        LedgerStore::new(&config.state_dir),
        git.as_ref().map(|committer| committer as &dyn RemoteCommitter),
    );

    let sleeper = ThreadSleeper;
    let agent = api_agent(&config.user_agent);
    let translator = TitleTranslator::new(build_chain(&config.translation, &agent), &sleeper)
        .with_fallback_file(config.state_dir.join(FALLBACK_TITLE_FILE));
    let engine = DownloadEngine::new(&yt_dlp, &sleeper, &config.work_dir);
    let thumbnails = HttpThumbnails::new(agent.clone());

    let controller = RunController {
        lister: &yt_dlp,
        engine: &engine,
        translator: &translator,
        destination: destination.as_ref(),
        ledger: &ledger,
        thumbnails: &thumbnails,
        sleeper: &sleeper,
        limits: RunLimits {
            success_quota: config.success_quota,
            skip_budget: config.skip_budget,
            retry_budget: config.retry_budget,
        },
    };
    let summary = controller.run(&config.channel_url, config.max_checks);
    drop(cookies);
    Ok(summary)
}

fn warn_if_ffmpeg_missing() {
    let mut command = Command::new("ffmpeg");
    command.arg("-version");
    match run_with_timeout(command, Duration::from_secs(15)) {
        Ok(output) if output.success() => {}
        _ => warn!("ffmpeg not found; yt-dlp may not be able to merge formats"),
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Uploaded: {}", summary.successes);
    for id in &summary.processed {
        println!("  + {}", id);
    }
    println!("Skipped: {}", summary.skips);
    for id in &summary.skipped {
        println!("  - {}", id);
    }
}
