use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mediaflow::config::{ReceiveConfig, SourceConfig};
use mediaflow::elements::StageRegistry;
use mediaflow::errors::ConfigError;
use mediaflow::observability::{init_subscriber, LogFormat, LogSettings};
use mediaflow::pipeline::ControlLoop;
use mediaflow::roles::{build_receive_pipeline, build_source_pipeline, run_pipeline_with, Role};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mediaflow", about = "RTP over UDP video sender and receiver", version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Log one JSON object per line.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a media URI to a host.
    Send(SendArgs),
    /// Receive a stream and render it.
    Receive(ReceiveArgs),
}

#[derive(Args)]
struct SendArgs {
    #[arg(long)]
    uri: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Encoder bitrate in kbps.
    #[arg(long)]
    bitrate: Option<u32>,
    /// Output height: 720, 1080 or 2160.
    #[arg(long)]
    resolution: Option<u32>,
    /// TOML file with a [send] table.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl SendArgs {
    fn into_config(self) -> anyhow::Result<SourceConfig> {
        let mut config = match &self.config {
            Some(path) => SourceConfig::load(path)?,
            None => SourceConfig::default(),
        };
        if let Some(uri) = self.uri {
            config.uri = uri;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bitrate) = self.bitrate {
            config.bitrate = bitrate;
        }
        if let Some(resolution) = self.resolution {
            config.resolution = resolution;
        }
        Ok(config)
    }
}

#[derive(Args)]
struct ReceiveArgs {
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// End the stream after this much silence; 0 waits forever.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// TOML file with a [receive] table.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl ReceiveArgs {
    fn into_config(self) -> anyhow::Result<ReceiveConfig> {
        let mut config = match &self.config {
            Some(path) => ReceiveConfig::load(path)?,
            None => ReceiveConfig::default(),
        };
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.idle_timeout_ms = timeout_ms;
        }
        Ok(config)
    }
}

fn run(command: Command) -> anyhow::Result<u8> {
    let registry = StageRegistry::with_builtins();
    let (pipeline, role) = match command {
        Command::Send(args) => {
            let config = args.into_config()?;
            if let Err(err @ ConfigError::UnsupportedResolution(_)) = config.resolution() {
                warn!(%err, "refusing to build the send pipeline");
                println!("illegal resolution");
                return Ok(0);
            }
            let pipeline = build_source_pipeline(&config, &registry)
                .context("could not build the send pipeline")?;
            (pipeline, Role::Send)
        }
        Command::Receive(args) => {
            let config = args.into_config()?;
            let pipeline = build_receive_pipeline(&config, &registry)
                .context("could not build the receive pipeline")?;
            (pipeline, Role::Receive)
        }
    };

    let status = run_pipeline_with(&pipeline, &ControlLoop::new(), Some(role))
        .with_context(|| format!("{role} pipeline failed to start"))?;
    info!(%role, %status, "done");
    Ok(status.exit_code())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    let settings = LogSettings::default()
        .with_level(cli.log_level)
        .with_format(format);
    if let Err(err) = init_subscriber(&settings) {
        eprintln!("could not install log subscriber: {err}");
    }

    match run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
