//! Geoghost CLI - 虚拟定位命令行入口

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use location_logic::{LinkConfig, LocationService};
use serde::Serialize;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Geoghost CLI
#[derive(Parser, Debug)]
#[command(name = "geoghost")]
#[command(version, about = "Simulate the GPS location of an attached iOS device")]
struct Args {
    /// External tool (defaults to $GEOGHOST_TOOL or pymobiledevice3)
    #[arg(long)]
    tool: Option<String>,

    /// tunneld status port (defaults to $GEOGHOST_TUNNELD_PORT or 49151)
    #[arg(long)]
    daemon_port: Option<u16>,

    /// Settle window for location commands, in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the attached device
    Status,
    /// List attached devices
    Devices,
    /// Set the simulated location and hold it until Ctrl+C
    Set {
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lng: f64,
    },
    /// Restore the real location
    Reset,
    /// Establish a tunnel and hold it until Ctrl+C
    Tunnel,
    /// Show the current tunnel
    TunnelStatus,
    /// Check whether the tunnel daemon needs a password to start
    DaemonCheck,
    /// Start the tunnel daemon (password read from stdin) and hold it until Ctrl+C
    DaemonStart,
}

impl Args {
    fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig::default();
        if let Some(tool) = &self.tool {
            config.tool.program = tool.clone();
        }
        if let Some(port) = self.daemon_port {
            config.daemon_port = port;
        }
        if let Some(ms) = self.settle_ms {
            config.timeouts.settle = Duration::from_millis(ms);
        }
        config
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn read_secret() -> Result<String> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// 长驻命令：等 Ctrl+C 后再关闭，进程退出会终止子进程
async fn hold(service: &LocationService) -> Result<()> {
    info!("Holding. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    service.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // 初始化日志（stderr，stdout 只输出 JSON）
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.link_config();
    info!("Using tool: {}", config.tool.program);
    let service = LocationService::new(config)?;

    let code = match args.command {
        Command::Status => {
            let status = service.get_device_status().await;
            print_json(&status)?;
            exit_code(status.connected)
        }
        Command::Devices => {
            print_json(&service.list_devices().await)?;
            ExitCode::SUCCESS
        }
        Command::Set { lat, lng } => {
            let resp = service.set_location(lat, lng).await;
            print_json(&resp)?;
            if resp.ok {
                hold(&service).await?;
            }
            exit_code(resp.ok)
        }
        Command::Reset => {
            let resp = service.reset_location().await;
            print_json(&resp)?;
            exit_code(resp.ok)
        }
        Command::Tunnel => {
            let resp = service.start_tunnel().await;
            print_json(&resp)?;
            if resp.ok {
                hold(&service).await?;
            }
            exit_code(resp.ok)
        }
        Command::TunnelStatus => {
            print_json(&service.tunnel_status().await)?;
            ExitCode::SUCCESS
        }
        Command::DaemonCheck => {
            print_json(&service.check_daemon().await)?;
            ExitCode::SUCCESS
        }
        Command::DaemonStart => {
            let secret = read_secret().await?;
            let resp = service.start_daemon(&secret).await;
            print_json(&resp)?;
            if resp.ok && resp.already_running != Some(true) {
                hold(&service).await?;
            }
            exit_code(resp.ok)
        }
    };

    service.shutdown().await;
    Ok(code)
}
