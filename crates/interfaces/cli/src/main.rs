use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sitewatch_config::AppConfig;
use sitewatch_monitor::{
    HttpFetcher, MonitorContext, MonitorSettings, Reconciler, SmtpNotifier, TargetSource,
};

#[derive(Debug, Parser)]
#[command(
    name = "sitewatch",
    version,
    about = "Watch web pages and send an email when their content changes"
)]
struct Cli {
    /// Target file: a JSON array of `{"url", "selector"? | "xpath"?}` objects, or one URL
    /// per line.  Edits are picked up while running.
    #[arg(short = 't', long = "target", value_name = "PATH", default_value = "target.json")]
    target: PathBuf,

    /// JSON config with the `monitor` and `email` sections.
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // A broken config aborts before any monitor starts.
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let fetcher = HttpFetcher::new(config.monitor.fetch_timeout(), &config.monitor.user_agent)
        .context("failed to build HTTP client")?;
    let ctx = MonitorContext {
        fetcher: Arc::new(fetcher),
        notifier: Arc::new(SmtpNotifier::new(config.email.clone())),
        settings: MonitorSettings::from_config(&config.monitor),
    };

    let mut reconciler = Reconciler::new(
        TargetSource::new(&cli.target),
        ctx,
        config.monitor.watch_interval(),
    );
    let summary = reconciler.start().await;
    info!(
        targets = summary.added.len(),
        check_interval_secs = config.monitor.check_interval,
        watch_interval_secs = config.monitor.watch_interval,
        target_file = %cli.target.display(),
        "sitewatch running"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(err) => warn!(?err, "cannot listen for Ctrl-C; run until killed"),
            }
        });
    }

    reconciler.run(shutdown).await;
    Ok(())
}
