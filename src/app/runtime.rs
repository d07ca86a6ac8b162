use std::io::{self, IsTerminal};

use anyhow::{Context, Result};
use blogcrawl_core::{BlogRunner, RunStatus, RuntimeEnvironment};
use clap::Parser;
use tracing::{debug, error, info, warn};

use crate::ProcessExit;
use crate::app::progress_manager;
use crate::app_config::{self, FileConfig};
use crate::cli::Args;

pub(crate) async fn run_blogcrawl() -> Result<ProcessExit> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let file_config = app_config::load_config(args.config.as_deref())?;
    init_tracing(&args, file_config.as_ref());

    debug!(?args, "CLI arguments parsed");
    info!(blogs = args.blogs.len(), "blogcrawl starting");

    let settings = args.settings(file_config.as_ref())?;
    let use_spinner = io::stderr().is_terminal() && !args.quiet;
    let (progress, spinner) = progress_manager::progress_sink(use_spinner);

    let env = RuntimeEnvironment::connect(&settings)
        .context("Failed to prepare the HTTP session")?
        .with_progress(progress);

    let stop = env.stop_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            stop.cancel();
        }
    });

    let runner = BlogRunner::new(settings, env);
    let results = runner.run_all(&args.blogs, &args.overrides()).await;

    if let Some(spinner) = spinner {
        spinner.finish();
    }

    let mut failed = 0usize;
    for (blog, result) in &results {
        match result {
            Ok(outcome) => {
                info!(
                    blog = %blog,
                    status = ?outcome.status,
                    downloaded = outcome.downloaded,
                    duplicates = outcome.duplicates,
                    last_id = outcome.last_id,
                    "Blog finished"
                );
                if matches!(
                    outcome.status,
                    RunStatus::Incomplete | RunStatus::NotLoggedIn
                ) {
                    failed += 1;
                }
            }
            Err(e) => {
                error!(blog = %blog, error = %e, "Blog failed");
                failed += 1;
            }
        }
    }

    if runner.environment().stop_token().is_cancelled() {
        warn!("Stopped. Run again to continue.");
        return Ok(ProcessExit::Failure);
    }
    if failed > 0 {
        warn!(failed, total = results.len(), "Some blogs did not finish");
        return Ok(ProcessExit::Failure);
    }
    Ok(ProcessExit::Success)
}

/// Installs the fmt subscriber.
///
/// Priority: `RUST_LOG` > `--quiet` > `-v` count > config verbosity > info.
fn init_tracing(args: &Args, file_config: Option<&FileConfig>) {
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => file_config
                .and_then(|cfg| cfg.verbosity)
                .map_or("info", |v| v.filter()),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
