//! CAN Stream Server CLI
//!
//! - `serve`: run the WebSocket distributor over a simulated frame source
//! - `monitor`: connect to a server and print (optionally decoded) frames
//! - `decode`: decode a JSON frame dump against DBC files

use anyhow::{bail, Context, Result};
use can_frame_decoder::{AnalysisConfig, CanFrame, Decoder};
use can_stream_server::client::{ClientEvent, ConnectionState, ReconnectingClient};
use can_stream_server::config::{self, AppConfig};
use can_stream_server::protocol::ServerMessage;
use can_stream_server::server;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// CAN Stream Server - decode CAN frames and stream them to WebSocket clients
#[derive(Parser, Debug)]
#[command(name = "can-stream-server")]
#[command(about = "Decode CAN frames and stream them to WebSocket observers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve frames from the simulated source at /ws
    Serve(ServeArgs),
    /// Connect to a server and print incoming frames
    Monitor(MonitorArgs),
    /// Decode a JSON frame dump
    Decode(DecodeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// DBC file(s) used to synthesize payloads (can be repeated)
    #[arg(long, value_name = "FILE")]
    dbc: Vec<PathBuf>,

    /// Frame IDs to simulate, decimal or 0x-hex (can be repeated)
    #[arg(long, value_name = "ID", value_parser = parse_can_id)]
    id: Vec<u32>,

    /// Milliseconds between simulated frames
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Server URL, e.g. ws://127.0.0.1:8080/ws
    #[arg(short, long)]
    url: Option<String>,

    /// Only receive these frame IDs (can be repeated)
    #[arg(long, value_name = "ID", value_parser = parse_can_id)]
    subscribe: Vec<u32>,

    /// DBC file(s) used to decode incoming frames (can be repeated)
    #[arg(long, value_name = "FILE")]
    dbc: Vec<PathBuf>,

    /// Exit after this many frames
    #[arg(long, value_name = "COUNT")]
    max_frames: Option<usize>,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// JSON file with frames: an array or one object per line
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// DBC file(s) (can be repeated)
    #[arg(long, value_name = "FILE", required = true)]
    dbc: Vec<PathBuf>,

    /// Only decode these frame IDs (can be repeated)
    #[arg(long, value_name = "ID", value_parser = parse_can_id)]
    id: Vec<u32>,

    /// Only keep these signals (can be repeated)
    #[arg(long, value_name = "NAME")]
    signal: Vec<String>,

    /// Ignore frames before this timestamp (ms)
    #[arg(long)]
    start: Option<u64>,

    /// Ignore frames after this timestamp (ms)
    #[arg(long)]
    end: Option<u64>,

    /// Drop NaN and infinite physical values
    #[arg(long)]
    exclude_non_finite: bool,

    /// Write decoded values as JSON to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);

    log::info!("CAN Stream Server v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using decoder library v{}", can_frame_decoder::VERSION);

    let app_config = match &cli.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    match cli.command {
        Command::Serve(args) => serve(app_config, args).await,
        Command::Monitor(args) => monitor(app_config, args).await,
        Command::Decode(args) => decode(&args),
    }
}

async fn serve(mut app_config: AppConfig, args: ServeArgs) -> Result<()> {
    if let Some(bind) = args.bind {
        app_config.server.bind = bind;
    }
    if let Some(port) = args.port {
        app_config.server.port = port;
    }
    if !args.dbc.is_empty() {
        app_config.source.dbc_files = args.dbc;
    }
    if !args.id.is_empty() {
        app_config.source.ids = args.id;
    }
    if let Some(interval) = args.interval_ms {
        app_config.source.interval_ms = interval;
    }
    app_config.validate()?;

    let source = app_config.source.build_source()?;
    let handle = server::start(app_config.server.to_server_config(), source)
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                app_config.server.bind, app_config.server.port
            )
        })?;

    println!("Streaming on {}  (Ctrl+C to stop)", handle.ws_url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    log::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn monitor(mut app_config: AppConfig, args: MonitorArgs) -> Result<()> {
    if let Some(url) = args.url {
        app_config.client.url = url;
    }
    app_config.validate()?;

    let decoder = load_decoder(&args.dbc)?;
    let mut client = ReconnectingClient::new(app_config.client.to_client_config());
    let Some(mut events) = client.take_events() else {
        bail!("Client event channel unavailable");
    };
    client.connect();

    let mut seen = 0usize;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            ClientEvent::State(state) => {
                println!("-- {}", state);
                if state == ConnectionState::Connected && !args.subscribe.is_empty() {
                    if let Err(e) = client.subscribe(args.subscribe.clone()) {
                        log::warn!("Subscribe failed: {}", e);
                    }
                }
                if matches!(state, ConnectionState::Error(_)) && client.gave_up().await {
                    bail!("{}", state);
                }
            }
            ClientEvent::Batch(frames) => {
                for frame in &frames {
                    print_frame(frame, decoder.as_ref());
                    seen += 1;
                    if args.max_frames.is_some_and(|max| seen >= max) {
                        client.disconnect().await;
                        return Ok(());
                    }
                }
            }
            ClientEvent::Message(ServerMessage::Error { error }) => eprintln!("server error: {}", error),
            ClientEvent::Message(message) => log::debug!("{:?}", message),
        }
    }

    client.disconnect().await;
    let stats = client.stats().await;
    println!(
        "\n{} frames in {} batches, {} connections",
        stats.frames_received, stats.batches_flushed, stats.connections
    );
    Ok(())
}

fn decode(args: &DecodeArgs) -> Result<()> {
    let decoder = load_decoder(&args.dbc)?.context("At least one DBC file is required")?;
    let frames = read_frames(&args.input)?;

    let result = decoder.parse_data_set(&frames, &analysis_config(args));

    match &args.output {
        Some(path) => {
            let json = serde_json::to_string_pretty(&result.values)?;
            fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {} values to {:?}", result.values.len(), path);
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for value in &result.values {
                let unit = value.unit.as_deref().unwrap_or("");
                match &value.description {
                    Some(text) => writeln!(
                        out,
                        "{:>12} {:<24} {:<24} {} ({})",
                        value.timestamp, value.message_name, value.signal_name, value.physical_value, text
                    )?,
                    None => writeln!(
                        out,
                        "{:>12} {:<24} {:<24} {} {}",
                        value.timestamp, value.message_name, value.signal_name, value.physical_value, unit
                    )?,
                }
            }
        }
    }

    let summary = result.summary;
    println!("\nSummary:");
    println!("  Frames:          {}", summary.total_frames);
    println!("  Analyzed:        {}", summary.analyzed_frames);
    println!("  Values:          {}", summary.decoded_values);
    println!("  Unknown frames:  {}", summary.unknown_frames);
    println!("  Frame errors:    {}", summary.frame_errors);
    Ok(())
}

/// Filters from the `decode` flags; absent flags leave the filter unset
fn analysis_config(args: &DecodeArgs) -> AnalysisConfig {
    let mut analysis = AnalysisConfig::new()
        .with_time_range(args.start, args.end)
        .with_exclude_non_finite(args.exclude_non_finite);
    if !args.id.is_empty() {
        analysis = analysis.with_target_ids(args.id.clone());
    }
    if !args.signal.is_empty() {
        analysis = analysis.with_signal_filter(args.signal.iter().cloned());
    }
    analysis
}

fn load_decoder(paths: &[PathBuf]) -> Result<Option<Decoder>> {
    if paths.is_empty() {
        return Ok(None);
    }
    let mut decoder = Decoder::new();
    for path in paths {
        decoder
            .add_dbc(path)
            .with_context(|| format!("Failed to load DBC file: {:?}", path))?;
    }
    let stats = decoder.database_stats();
    log::info!("Signal database: {} messages, {} signals", stats.num_messages, stats.num_signals);
    Ok(Some(decoder))
}

/// Accepts a JSON array of frames or JSON Lines
fn read_frames(path: &Path) -> Result<Vec<CanFrame>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path));
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("{:?} line {}", path, index + 1))
        })
        .collect()
}

fn print_frame(frame: &CanFrame, decoder: Option<&Decoder>) {
    let data: Vec<String> = frame.data.iter().map(|b| format!("{:02X}", b)).collect();
    println!("{:>12}  0x{:<8X} [{}] {}", frame.timestamp, frame.id, frame.dlc, data.join(" "));

    let Some(decoder) = decoder else {
        return;
    };
    let parsed = decoder.parse_frame(frame);
    for value in &parsed.signals {
        println!(
            "              {}.{} = {} {}",
            value.message_name,
            value.signal_name,
            value.physical_value,
            value.unit.as_deref().unwrap_or("")
        );
    }
}

fn parse_can_id(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid CAN id '{}': {}", s, e))
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
