use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lan_device_discovery::{
    EngineConfig, IpRange, OuiTable, ScanEvent, ScanManager, ScanMode, ScanSnapshot,
};

#[derive(Parser)]
#[command(name = "lan-discovery")]
#[command(about = "Discover and fingerprint cameras, NVRs and other hosts on the local network")]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep a scope and print what was found
    Scan(ScanArgs),
}

#[derive(Args)]
struct ScanArgs {
    /// JSON engine configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Subnet to scan (defaults to the active interface's subnet)
    #[arg(long)]
    cidr: Option<String>,

    /// First address of an explicit range
    #[arg(long, requires = "range_end")]
    range_start: Option<Ipv4Addr>,

    /// Last address of an explicit range
    #[arg(long, requires = "range_start")]
    range_end: Option<Ipv4Addr>,

    /// Allow targets outside the active subnet
    #[arg(long)]
    allow_remote: bool,

    /// Keep sweeping until interrupted
    #[arg(long)]
    continuous: bool,

    /// Seconds to pause between continuous sweeps
    #[arg(long)]
    interval: Option<u64>,

    #[arg(long)]
    no_onvif: bool,

    /// Skip SSDP and Bonjour
    #[arg(long)]
    no_services: bool,

    #[arg(long)]
    no_arp_warmup: bool,

    /// Disable safe mode (allows RTSP probing and ONVIF stream URI fetches)
    #[arg(long = "unsafe")]
    unsafe_mode: bool,

    /// Probe RTSP paths on every device after each sweep (needs --unsafe)
    #[arg(long)]
    probe_rtsp: bool,

    /// Username used for RTSP and ONVIF on every device
    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    /// OUI table (IEEE oui.csv or `AA-BB-CC<TAB>Vendor` lines)
    #[arg(long)]
    oui_file: Option<PathBuf>,

    /// Print full JSON snapshots instead of a summary
    #[arg(long)]
    json: bool,
}

impl ScanArgs {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(cidr) = &self.cidr {
            config.scope.cidr = cidr.clone();
        }
        if let (Some(start), Some(end)) = (self.range_start, self.range_end) {
            config.scope.ip_range = Some(IpRange { start, end });
        }
        if self.allow_remote {
            config.scope.only_local_subnet = false;
        }
        if self.continuous {
            config.mode = ScanMode::Continuous;
        }
        if self.interval.is_some() {
            config.scan_interval_secs = self.interval;
        }
        config.enable_onvif_discovery &= !self.no_onvif;
        config.enable_service_discovery &= !self.no_services;
        config.enable_arp_warmup &= !self.no_arp_warmup;
        if self.unsafe_mode {
            config.safe_mode = false;
        }
        Ok(config)
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lan_device_discovery={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Scan(args) => scan(args).await,
    }
}

async fn scan(args: ScanArgs) -> Result<()> {
    let config = args.engine_config()?;
    if args.probe_rtsp && config.safe_mode {
        bail!("--probe-rtsp needs --unsafe");
    }

    let mut manager = ScanManager::new(config.clone());
    if let Some(path) = &args.oui_file {
        let table = OuiTable::load(path).with_context(|| format!("loading {}", path.display()))?;
        manager = manager.with_vendor_lookup(Arc::new(table));
    }

    let interrupt = CancellationToken::new();
    let handler_token = interrupt.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("installing Ctrl-C handler")?;

    let mut events = manager.subscribe();
    manager
        .start_scan(
            config.enable_onvif_discovery,
            config.enable_service_discovery,
            config.enable_arp_warmup,
            config.scope.clone(),
            config.mode,
        )
        .await
        .context("starting scan")?;

    loop {
        let event = tokio::select! {
            _ = interrupt.cancelled() => {
                info!("Interrupted");
                manager.stop_scan().await;
                break;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(ScanEvent::SweepFinished(_)) => {
                if args.probe_rtsp {
                    probe_devices(&manager, &args).await;
                }
                report(&manager.snapshot().await, args.json)?;
                if config.mode == ScanMode::OneShot {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    manager.wait().await;
    if interrupt.is_cancelled() {
        report(&manager.snapshot().await, args.json)?;
    }
    Ok(())
}

async fn probe_devices(manager: &ScanManager, args: &ScanArgs) {
    for device in manager.snapshot().await.devices {
        if let (Some(user), Some(pass)) = (&args.username, &args.password)
            && let Err(e) = manager.update_credentials(device.ip, user, pass).await
        {
            warn!(ip = %device.ip, error = %e, "Could not set credentials");
        }
        if let Err(e) = manager.probe_rtsp(device.ip).await {
            warn!(ip = %device.ip, error = %e, "RTSP probe failed");
        }
    }
}

fn report(snapshot: &ScanSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    let summary = &snapshot.summary;
    println!(
        "{} [{}] {} candidates, {} alive, {} devices (safe mode {})",
        summary.scope,
        summary.status,
        summary.candidate_count,
        summary.alive_hosts,
        summary.interesting_devices,
        if summary.safe_mode { "on" } else { "off" }
    );
    for note in &snapshot.capability_notes {
        println!("  note: {}", note);
    }

    for host in snapshot.hosts.iter().filter(|h| h.alive) {
        let ports: Vec<String> = host.open_ports.iter().map(u16::to_string).collect();
        println!(
            "{:<15} {:>3} {:<6} {:<17} {:<24} {:<24} ports [{}]",
            host.ip,
            host.host_confidence.score,
            format!("{:?}", host.host_confidence.tier).to_lowercase(),
            host.mac.as_deref().unwrap_or("-"),
            host.vendor.as_deref().unwrap_or("-"),
            host.hostname.as_deref().unwrap_or("-"),
            ports.join(",")
        );
    }

    for device in &snapshot.devices {
        if let Some(uri) = device.best_rtsp_uri.as_ref().or(device.onvif_rtsp_uri.as_ref()) {
            println!("  {} stream {}", device.ip, uri);
        }
        if let Some(summary) = &device.rtsp_summary {
            println!("  {} rtsp: {}", device.ip, summary);
        }
        if device.onvif_requires_auth {
            println!("  {} onvif: auth required", device.ip);
        }
    }
    Ok(())
}
