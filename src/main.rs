use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use wechat_callback::api::ApiClient;
use wechat_callback::config::Config;
use wechat_callback::dispatch::Dispatcher;
use wechat_callback::responder::EchoResponder;
use wechat_callback::server;
use wechat_callback::session::Sessions;

#[derive(Debug, Parser)]
#[command(about, version)]
struct Args {
    /// Path to the config file; the default locations are searched if not set
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Raises the log level to debug (`-v`) or trace (`-vv`)
    #[arg(short, long = "verbose", action = clap::ArgAction::Count)]
    verbosity: u8,
    /// Writes the log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Overrides the listen address of the config
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Does not push the configured menu on startup
    #[arg(long)]
    no_menu: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = init_logging(&args)?;
    log_panics::init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_installed()?.ok_or_else(|| {
            anyhow!("no config found, pass --config or create ~/.wechat-callback.toml")
        })?,
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    info!(?config, "loaded config");

    if !args.no_menu {
        if let Some(menu) = config.read_menu()? {
            push_menu(&config, &menu).await;
        }
    }

    let dispatcher = Dispatcher::new(&config, EchoResponder, Sessions::new())
        .context("failed to initialize the message codec")?;
    server::serve(&config, Arc::new(dispatcher)).await
}

/// Menu failures are not fatal; the callback works without a menu.
async fn push_menu(config: &Config, menu: &str) {
    let result = match ApiClient::new(config) {
        Ok(client) => client.create_menu(menu).await,
        Err(error) => Err(error),
    };
    match result {
        Ok(()) => info!("menu created"),
        Err(error) => error!(%error, "failed to create menu"),
    }
}

fn init_logging(args: &Args) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = match args.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(log_file) = &args.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("invalid log file {}", log_file.display()))?;
    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}
