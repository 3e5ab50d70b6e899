use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gated_relay::{FileConfig, Overrides, ProxyConfig, load_config, start_server};

/// TCP relay gated by a client IP allow-list
#[derive(Parser, Debug)]
#[command(name = "gated-relay", version, about)]
struct Cli {
    /// TOML config file; command-line flags take precedence over it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stdout
    #[arg(short = 'l', long, global = true)]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the relay
    Start(StartArgs),
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Exposed port, e.g. 443
    #[arg(short, long)]
    from: Option<u16>,

    /// Port to relay allowed clients to, e.g. 8379
    #[arg(short, long)]
    to: Option<u16>,

    /// Allow-list file path [default: whiteip.json]
    #[arg(short, long)]
    whiteip: Option<PathBuf>,

    /// Enrollment path that adds the caller's IP; random if unset
    #[arg(short, long)]
    auth: Option<String>,

    /// HTML page served to filtered clients
    #[arg(short = 'H', long)]
    html: Option<PathBuf>,

    /// Log all relayed data
    #[arg(long)]
    dump: bool,
}

impl From<StartArgs> for Overrides {
    fn from(args: StartArgs) -> Self {
        Self {
            listen_port: args.from,
            target_port: args.to,
            allowlist_file: args.whiteip,
            page_file: args.html,
            enroll_path: args.auth,
            dump: args.dump,
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let file = match &cli.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };
    let Command::Start(args) = cli.command;
    let config = ProxyConfig::resolve(file, args.into())?;

    info!(
        config_file = ?cli.config,
        listen_addr = %config.listen_addr(),
        target_addr = %config.target_addr(),
        allowlist_file = %config.allowlist_file.display(),
        page_file = ?config.page_file,
        enroll_path = %config.enroll_path,
        dump = config.dump,
        "Starting relay"
    );

    start_server(config).await
}
