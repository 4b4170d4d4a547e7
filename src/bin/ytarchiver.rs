#![forbid(unsafe_code)]

//! Daemon that keeps a local archive of YouTube channels up to date.
//!
//! Archives once at startup and then on every interval tick. `SIGALRM` runs a
//! pass right away, `SIGHUP` reloads the configuration, and `SIGINT`/`SIGTERM`
//! stop after the downloads in flight finish.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use newtube_archiver::{
    Archiver,
    api::YouTubeClient,
    config::{ConfigOverrides, load_settings},
    download::{Downloader, Fetcher},
    error::ArchiveError,
    logging,
    preflight::{check_api_key, check_download_directory, check_downloader, ensure_not_root},
};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type Engine = Archiver<YouTubeClient>;

#[derive(Debug, Parser)]
#[command(name = "ytarchiver", version, about = "Incrementally archive YouTube channels")]
struct Args {
    /// Configuration file; defaults to the first of ./ytarchive.toml,
    /// /etc/ytarchive.toml and /usr/share/ytarchive/ytarchive.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dotenv file holding YTARCHIVE_API_KEY / YTARCHIVE_ROOT.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,

    /// Archive root, overriding every other source.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Run a single archiving pass and exit.
    #[arg(long)]
    once: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config.clone(),
            env_path: self.env_file.clone(),
            root: self.root.clone(),
        }
    }
}

/// Loads the configuration, runs the preflight checks and builds the channel
/// cache. Blocking: talks to the API and the filesystem.
fn initialize(overrides: &ConfigOverrides) -> Result<(Engine, Duration)> {
    let settings = load_settings(overrides.clone())?;
    info!(
        config = %settings.source.display(),
        root = %settings.archiver.root.display(),
        channels = settings.channels.len(),
        workers = settings.archiver.max_parallel,
        "loaded configuration"
    );

    check_api_key(&settings.api_key)?;
    check_downloader(&settings.archiver.downloader)?;
    check_download_directory(&settings.archiver.root)?;

    let fetcher: Arc<dyn Fetcher> = Arc::new(Downloader::from_config(&settings.archiver));
    let api = YouTubeClient::new(settings.api_key);
    let archiver = Archiver::new(
        settings.archiver,
        api,
        settings.channels,
        settings.selectors,
        fetcher,
    )
    .context("starting archiver")?;
    Ok((archiver, settings.interval))
}

async fn initialize_blocking(overrides: &ConfigOverrides) -> Result<(Engine, Duration)> {
    let overrides = overrides.clone();
    task::spawn_blocking(move || initialize(&overrides))
        .await
        .context("startup task panicked")?
}

/// Runs one pass on the blocking pool. When `stop` fires mid-run the archiver
/// is cancelled and the pass is awaited so in-flight downloads are accounted
/// for.
async fn run_pass(
    mut archiver: Engine,
    stop: &CancellationToken,
) -> Result<(Engine, Result<(), ArchiveError>)> {
    let shutdown = archiver.shutdown_token();
    let mut pass = task::spawn_blocking(move || {
        let result = archiver.archive();
        (archiver, result)
    });

    let joined = tokio::select! {
        joined = &mut pass => joined,
        _ = stop.cancelled() => {
            info!("stopping after in-flight downloads finish");
            shutdown.cancel();
            pass.await
        }
    };
    joined.context("archive task panicked")
}

fn report(result: &Result<(), ArchiveError>) {
    match result {
        Ok(()) => info!("archive pass finished without errors"),
        Err(err) => error!("{err}"),
    }
}

/// Cancels the returned token on the first `SIGINT` or `SIGTERM`.
fn watch_for_stop() -> Result<CancellationToken> {
    let stop = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let token = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("SIGINT received"),
                Err(err) => warn!("failed to listen for Ctrl+C: {err}"),
            },
        }
        token.cancel();
    });
    Ok(stop)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init();
    ensure_not_root("ytarchiver")?;

    let overrides = args.overrides();
    let (mut archiver, mut interval) = initialize_blocking(&overrides).await?;
    let stop = watch_for_stop()?;

    if args.once {
        let (_, result) = run_pass(archiver, &stop).await?;
        report(&result);
        return result.map_err(anyhow::Error::from);
    }

    let mut run_now = signal(SignalKind::alarm()).context("installing SIGALRM handler")?;
    let mut reload = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "archiver started");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
            _ = run_now.recv() => info!("SIGALRM received, archiving now"),
            _ = reload.recv() => {
                info!("SIGHUP received, reloading configuration");
                match initialize_blocking(&overrides).await {
                    Ok((fresh, fresh_interval)) => {
                        archiver = fresh;
                        if fresh_interval != interval {
                            interval = fresh_interval;
                            ticker = time::interval_at(Instant::now() + interval, interval);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                        info!(interval_secs = interval.as_secs(), "configuration reloaded");
                    }
                    Err(err) => error!("reload failed, keeping previous configuration: {err:#}"),
                }
                continue;
            }
        }

        let (returned, result) = run_pass(archiver, &stop).await?;
        archiver = returned;
        report(&result);
        if stop.is_cancelled() {
            break;
        }
    }

    info!("archiver stopped");
    Ok(())
}
