//! `satip` - discover SAT>IP tuner servers, inspect them and tune channels.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use satip_client::{
    CallbackHandler, ClientBuilder, ClientEvent, Device, Playlist, SatIpClient, TransportMode,
    TuningParams,
};
use satip_core::BroadcastStandard;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "satip", about = "SAT>IP client: discovery, tuning and reception telemetry")]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List SAT>IP servers on the local network
    Discover {
        /// Seconds to wait for answers
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },
    /// Print the channels of an M3U playlist
    Playlist {
        file: PathBuf,
    },
    /// Tune a channel and report reception until stopped
    Tune(TuneArgs),
    /// Show the SDP description of a server
    Describe {
        /// Device uuid, or `first`
        #[arg(long)]
        device: String,
        /// Seconds to wait for discovery answers
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },
}

#[derive(Args)]
struct TuneArgs {
    /// Device uuid, or `first`
    #[arg(long, default_value = "first")]
    device: String,
    /// Tuning query, e.g. `src=1&freq=11494&pol=h&msys=dvbs2&sr=22000&pids=0`
    #[arg(long, conflicts_with_all = ["playlist", "channel"], required_unless_present = "playlist")]
    query: Option<String>,
    /// Playlist to take the channel from
    #[arg(long, requires = "channel")]
    playlist: Option<PathBuf>,
    /// Channel name, or 1-based position in the playlist
    #[arg(long, requires = "playlist")]
    channel: Option<String>,
    /// Ask for multicast delivery
    #[arg(long)]
    multicast: bool,
    /// Seconds to stay tuned; 0 waits for Ctrl-C
    #[arg(long, default_value_t = 0)]
    duration: u64,
    /// Seconds to wait for discovery answers
    #[arg(long, default_value_t = 3)]
    timeout: u64,
}

fn setup_logging(log_file: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref())?;

    match cli.command {
        Command::Discover { timeout } => discover(Duration::from_secs(timeout)).await,
        Command::Playlist { file } => print_playlist(&file),
        Command::Tune(args) => tune(args).await,
        Command::Describe { device, timeout } => {
            describe(&device, Duration::from_secs(timeout)).await
        }
    }
}

async fn discover(timeout: Duration) -> Result<()> {
    let client = ClientBuilder::new().build()?;
    let devices = client.discover(timeout).await?;

    if devices.is_empty() {
        println!("No SAT>IP servers found");
    }
    for device in &devices {
        print_device(device);
    }

    client.shutdown().await;
    Ok(())
}

fn print_device(device: &Device) {
    println!("{}", device.friendly_name);
    println!("  id:        {}", device.id);
    println!("  rtsp:      {}", device.rtsp_base_url());
    println!("  location:  {}", device.location);
    if let Some(model) = &device.model_name {
        println!("  model:     {}", model);
    }
    if let Some(manufacturer) = &device.manufacturer {
        println!("  vendor:    {}", manufacturer);
    }
    let caps = &device.capabilities;
    println!(
        "  tuners:    {} (DVB-S {}, DVB-T {}, DVB-C {})",
        caps.raw.as_deref().unwrap_or("none advertised"),
        caps.tuner_count(BroadcastStandard::Satellite),
        caps.tuner_count(BroadcastStandard::Terrestrial),
        caps.tuner_count(BroadcastStandard::Cable),
    );
    if let Some(m3u) = &device.m3u_url {
        println!("  channels:  {}", m3u);
    }
}

fn print_playlist(file: &Path) -> Result<()> {
    let playlist = Playlist::load(file)?;
    if playlist.is_empty() {
        println!("{}: no channels", file.display());
    }
    for (index, channel) in playlist.channels.iter().enumerate() {
        println!("{:4}  {:<32} {}", index + 1, channel.name, channel.params.to_query());
    }
    Ok(())
}

/// Tuning parameters from `--query` or from a playlist channel.
fn tuning_params(args: &TuneArgs) -> Result<TuningParams> {
    if let Some(query) = &args.query {
        return Ok(TuningParams::parse(query));
    }

    let (Some(path), Some(wanted)) = (&args.playlist, &args.channel) else {
        bail!("either --query or --playlist with --channel is required");
    };
    let playlist = Playlist::load(path)?;
    let channel = match wanted.parse::<usize>() {
        Ok(position) if position >= 1 => playlist.channels.get(position - 1),
        _ => playlist.find(wanted),
    };
    channel
        .map(|c| c.params.clone())
        .ok_or_else(|| anyhow!("channel {} not in {}", wanted, path.display()))
}

/// Resolve `first` or a uuid against the discovered devices.
fn pick_device(client: &SatIpClient, devices: &[Device], wanted: &str) -> Result<Device> {
    let device = if wanted.eq_ignore_ascii_case("first") {
        devices.first().cloned()
    } else {
        client.device(wanted)
    };
    device.ok_or_else(|| anyhow!("device {} not found", wanted))
}

async fn tune(args: TuneArgs) -> Result<()> {
    let params = tuning_params(&args)?;
    let mode = if args.multicast {
        TransportMode::Multicast
    } else {
        TransportMode::Unicast
    };

    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
    let client = ClientBuilder::new()
        .transport_mode(mode)
        .event_handler(CallbackHandler::new(move |event| match event {
            ClientEvent::ReceptionChanged { info, .. } => println!(
                "lock={} level={}% quality={}%",
                info.locked, info.level, info.quality
            ),
            ClientEvent::SessionClosed { device, reason } => {
                println!("Session on {} closed: {}", device, reason);
                let _ = closed_tx.send(());
            }
            _ => {}
        }))
        .build()?;

    let devices = client.discover(Duration::from_secs(args.timeout)).await?;
    let device = pick_device(&client, &devices, &args.device)?;
    info!("Tuning {} with {}", device, params.to_query());

    let session = client.tune(device.id.as_str(), &params).await?;
    println!(
        "Tuned {} stream {} session {}",
        device.friendly_name,
        session.stream_id.as_deref().unwrap_or("?"),
        session.session_id.as_deref().unwrap_or("?")
    );
    if let Some(ports) = session.client_ports {
        println!("RTP on local ports {}", ports);
    }
    if let (Some(group), Some(ports)) = (&session.destination, session.multicast_ports) {
        println!("RTP on {}:{}", group, ports);
    }

    let stay = async {
        if args.duration == 0 {
            let _ = tokio::signal::ctrl_c().await;
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration)).await;
        }
    };
    tokio::select! {
        _ = stay => {}
        _ = closed_rx.recv() => {}
    }

    client.shutdown().await;
    Ok(())
}

async fn describe(wanted: &str, timeout: Duration) -> Result<()> {
    let client = ClientBuilder::new().build()?;
    let devices = client.discover(timeout).await?;
    let device = pick_device(&client, &devices, wanted)?;

    let description = client.describe(device.id.as_str()).await?;
    println!("{}", description.sdp.trim_end());
    match description.reception {
        Some(info) => println!(
            "\nlock={} level={}% quality={}%",
            info.locked, info.level, info.quality
        ),
        None => println!("\nno tuner status in description"),
    }

    client.shutdown().await;
    Ok(())
}
