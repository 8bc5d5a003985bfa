use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use std::process::{ExitCode, ExitStatus};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use wfd_session::{
    config::{self, Config, StreamConfig},
    interface, interrupt, ops, BackendSelector, Interrupt, NetOps, PrepareReport, PreparedSession,
    RestoreReport, SessionError, SessionOptions, SessionRecord, SessionStore, StreamBackend,
    StreamRequest, StreamSupervisor, SystemNetOps,
};

const STREAM_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "wfd-session")]
#[command(about = "Prepare a wireless interface for WiFi Display and restore it afterwards")]
#[command(version)]
struct Cli {
    /// Debug logging, and keep the streaming backend's output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture the interface's network state and make it ready for P2P
    Prepare {
        /// Wireless interface (e.g. wlan0)
        interface: String,
    },

    /// Restore the network state saved by `prepare`
    Restore,

    /// Prepare, stream the screen to a sink, and restore on exit
    Cast {
        /// Wireless interface (e.g. wlan0)
        interface: String,

        /// Sink address
        #[arg(short, long)]
        target: String,

        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Stream the screen to a sink without touching the network
    Stream {
        /// Sink address
        target: String,

        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Show leftover session records and network service state
    Status,

    /// List wireless interfaces and whether they support P2P
    Interfaces,

    /// List streaming backends in priority order
    Backends,

    /// Show the effective configuration
    Config,
}

#[derive(Args)]
struct StreamArgs {
    /// RTP port on the sink
    #[arg(short, long)]
    port: Option<u16>,

    /// Output width (needs --height; default keeps the screen size)
    #[arg(long)]
    width: Option<u32>,

    /// Output height
    #[arg(long)]
    height: Option<u32>,

    #[arg(short, long)]
    fps: Option<u32>,

    /// Video bitrate in kbit/s
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Do not stream audio
    #[arg(long)]
    no_audio: bool,

    /// Backend to use: gstreamer, vlc or ffmpeg (default: first installed)
    #[arg(long)]
    backend: Option<StreamBackend>,
}

impl StreamArgs {
    fn request(&self, target: &str, defaults: &StreamConfig) -> StreamRequest {
        StreamRequest {
            target: target.to_string(),
            port: self.port.unwrap_or(defaults.port),
            width: self.width.unwrap_or(0),
            height: self.height.unwrap_or(0),
            fps: self.fps.unwrap_or(defaults.fps),
            bitrate: self.bitrate.unwrap_or(defaults.bitrate),
            audio: defaults.audio && !self.no_audio,
        }
    }
}

enum StreamEnd {
    Interrupted(i32),
    Exited(ExitStatus),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = Config::load()?;

    match cli.command {
        Commands::Prepare { interface } => cmd_prepare(&cfg, interface, cli.json).await,
        Commands::Restore => cmd_restore(&cfg, cli.json),
        Commands::Cast {
            interface,
            target,
            stream,
        } => cmd_cast(&cfg, interface, &target, &stream, cli.verbose, cli.json).await,
        Commands::Stream { target, stream } => {
            cmd_stream(&cfg, &target, &stream, cli.verbose, cli.json).await
        }
        Commands::Status => cmd_status(&cfg),
        Commands::Interfaces => cmd_interfaces(cli.json),
        Commands::Backends => cmd_backends(&cfg),
        Commands::Config => cmd_show_config(&cfg),
    }
}

fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        return Err(SessionError::NotRoot.into());
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Exit status for a failed prepare; an interrupt has already been rolled
/// back by the time it gets here.
fn prepare_failure(e: anyhow::Error) -> Result<ExitCode> {
    if let Some(SessionError::Interrupted(signo)) = e.downcast_ref::<SessionError>() {
        eprintln!("Interrupted, previous network configuration restored.");
        return Ok(ExitCode::from(interrupt::exit_code(*signo) as u8));
    }
    Err(e)
}

async fn cmd_prepare(cfg: &Config, interface: String, json: bool) -> Result<ExitCode> {
    interface::validate_interface_name(&interface)?;
    require_root()?;

    let options = SessionOptions::from_config(&cfg.session);
    let interrupt = Interrupt::new();
    let listener = interrupt::listen(interrupt.clone());

    let irq = interrupt.clone();
    let result = tokio::task::spawn_blocking(move || {
        wfd_session::prepare(&SystemNetOps, &options, &interface, &irq)
    })
    .await
    .context("prepare task failed")?;
    listener.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => return prepare_failure(e),
    };

    if json {
        print_json(&report)?;
    } else {
        display_prepare(&report);
        println!();
        println!("Run `wfd-session restore` to put the previous configuration back.");
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_restore(cfg: &Config, json: bool) -> Result<ExitCode> {
    require_root()?;
    let options = SessionOptions::from_config(&cfg.session);
    let report = wfd_session::restore(&SystemNetOps, &options)?;

    if json {
        print_json(&report)?;
    } else {
        display_restore(&report);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cast(
    cfg: &Config,
    interface: String,
    target: &str,
    stream: &StreamArgs,
    verbose: bool,
    json: bool,
) -> Result<ExitCode> {
    interface::validate_interface_name(&interface)?;
    let request = stream.request(target, &cfg.stream);
    request.validate_ranges()?;
    require_root()?;

    let options = SessionOptions::from_config(&cfg.session);
    let interrupt = Interrupt::new();
    let listener = interrupt::listen(interrupt.clone());

    let irq = interrupt.clone();
    let begun = tokio::task::spawn_blocking(move || {
        PreparedSession::begin(SystemNetOps, options, &interface, &irq)
    })
    .await
    .context("prepare task failed")?;

    let session = match begun {
        Ok(session) => session,
        Err(e) => {
            listener.abort();
            return prepare_failure(e);
        }
    };

    if !json {
        display_prepare(session.report());
        println!();
    }

    let mut supervisor = new_supervisor(cfg, stream, verbose);
    let end = match supervisor.start_stream(&request) {
        Ok(pid) => {
            if !json {
                println!("Streaming to {} with PID {} (Ctrl-C to stop)", target, pid);
            }
            Some(wait_for_stream_end(&mut supervisor, &interrupt).await)
        }
        Err(e) => {
            eprintln!("Stream failed ({:?}): {}", e.code, e);
            None
        }
    };
    supervisor.cleanup();
    listener.abort();

    let restored = tokio::task::spawn_blocking(move || session.finish())
        .await
        .context("restore task failed")??;

    if json {
        print_json(&restored)?;
    } else {
        println!();
        display_restore(&restored);
    }

    Ok(match end {
        Some(StreamEnd::Interrupted(signo)) => ExitCode::from(interrupt::exit_code(signo) as u8),
        Some(StreamEnd::Exited(status)) if status.success() && restored.is_clean() => {
            ExitCode::SUCCESS
        }
        _ => ExitCode::FAILURE,
    })
}

async fn cmd_stream(
    cfg: &Config,
    target: &str,
    stream: &StreamArgs,
    verbose: bool,
    json: bool,
) -> Result<ExitCode> {
    let request = stream.request(target, &cfg.stream);
    request.validate_ranges()?;

    let interrupt = Interrupt::new();
    let listener = interrupt::listen(interrupt.clone());
    let mut supervisor = new_supervisor(cfg, stream, verbose);

    let pid = supervisor.start_stream(&request)?;
    if json {
        print_json(&supervisor.current())?;
    } else if let Some(info) = supervisor.current() {
        println!(
            "Using {} for streaming to {}:{} (resolution: {}, fps: {}, bitrate: {})",
            info.backend,
            info.params.target,
            info.params.port,
            info.params.resolution_label(),
            info.params.fps,
            info.params.bitrate
        );
        println!("Started with PID {} (Ctrl-C to stop)", pid);
    }

    let end = wait_for_stream_end(&mut supervisor, &interrupt).await;
    supervisor.cleanup();
    listener.abort();

    Ok(match end {
        StreamEnd::Interrupted(signo) => {
            println!("Stopped screen streaming");
            ExitCode::from(interrupt::exit_code(signo) as u8)
        }
        StreamEnd::Exited(status) if status.success() => ExitCode::SUCCESS,
        StreamEnd::Exited(status) => {
            eprintln!("Streaming backend exited: {}", status);
            ExitCode::FAILURE
        }
    })
}

fn new_supervisor(cfg: &Config, stream: &StreamArgs, verbose: bool) -> StreamSupervisor {
    let mut supervisor = StreamSupervisor::new(BackendSelector::new());
    supervisor.set_backend(stream.backend.or(cfg.stream.backend));
    supervisor.set_verbose(verbose);
    supervisor
}

async fn wait_for_stream_end(supervisor: &mut StreamSupervisor, interrupt: &Interrupt) -> StreamEnd {
    loop {
        if let Some(signo) = interrupt.raised() {
            return StreamEnd::Interrupted(signo);
        }
        if let Some(status) = supervisor.try_reap() {
            return StreamEnd::Exited(status);
        }
        tokio::time::sleep(STREAM_POLL).await;
    }
}

fn cmd_status(cfg: &Config) -> Result<ExitCode> {
    let dir = cfg.session.record_dir();
    let records = SessionStore::list(&dir)?;

    println!("Session records in {}:", dir.display());
    if records.is_empty() {
        println!("  (none)");
    }
    for path in &records {
        match SessionStore::open(path).load() {
            Ok(record) => println!("  {}  {}", path.display(), summarize_record(&record)),
            Err(e) => println!("  {}  unreadable: {:#}", path.display(), e),
        }
    }

    println!();
    for service in ["NetworkManager", "wpa_supplicant"] {
        let state = if ops::service_active(service) { "Running" } else { "Stopped" };
        println!("{:<16} {}", format!("{}:", service), state);
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_interfaces(json: bool) -> Result<ExitCode> {
    let interfaces = interface::list_wifi_interfaces()?;

    if json {
        let rows: Vec<_> = interfaces
            .iter()
            .map(|i| {
                serde_json::json!({
                    "name": i.name,
                    "state": i.state,
                    "phy": i.phy,
                    "p2p": SystemNetOps.supports_p2p(&i.name).ok(),
                })
            })
            .collect();
        print_json(&rows)?;
        return Ok(ExitCode::SUCCESS);
    }

    if interfaces.is_empty() {
        println!("No wireless interfaces found.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<16} {:<10} {:<8} {}", "INTERFACE", "STATE", "PHY", "P2P");
    println!("{}", "-".repeat(40));

    for iface in interfaces {
        let p2p = match SystemNetOps.supports_p2p(&iface.name) {
            Ok(true) => "yes",
            Ok(false) => "no",
            Err(_) => "?",
        };
        let phy = iface.phy.as_deref().unwrap_or("-");
        println!("{:<16} {:<10} {:<8} {}", iface.name, iface.state, phy, p2p);
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_backends(cfg: &Config) -> Result<ExitCode> {
    let selector = BackendSelector::new();
    let selected = selector.select(cfg.stream.backend);

    println!("{:<3} {:<10} {}", "", "BACKEND", "EXECUTABLE");
    println!("{}", "-".repeat(50));
    for backend in StreamBackend::PRIORITY {
        let marker = if backend == selected { "*" } else { "" };
        let location = selector
            .locate(backend)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not installed)".to_string());
        println!("{:<3} {:<10} {}", marker, backend.display_name(), location);
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_show_config(cfg: &Config) -> Result<ExitCode> {
    let path = config::config_path()?;
    println!("Config file: {}", path.display());
    if !path.exists() {
        println!("(not present, showing defaults)");
    }
    println!();
    print!("{}", cfg.to_toml()?);
    Ok(ExitCode::SUCCESS)
}

fn summarize_record(record: &SessionRecord) -> String {
    let mut parts = vec![format!("interface={}", record.interface)];
    if record.nm_was_active {
        parts.push(format!(
            "nm=managed({})",
            record.ssid.as_deref().unwrap_or("no network")
        ));
    }
    if record.wpa_was_active {
        parts.push("wpa_supplicant=stopped".to_string());
    }
    if let Some(ip) = &record.prior_ip {
        parts.push(format!("ip={}", ip));
    }
    parts.join(" ")
}

fn display_prepare(report: &PrepareReport) {
    let rec = &report.captured;
    println!("Prepared {} for P2P", report.interface);
    println!("Record:          {}", report.record_path.display());
    println!("IPv4:            {}", rec.prior_ip.as_deref().unwrap_or("(none)"));

    if rec.nm_was_active {
        let network = rec.ssid.as_deref().unwrap_or("not connected");
        let secret = if report.secret_captured { ", secret saved" } else { "" };
        println!("NetworkManager:  released ({}{})", network, secret);
    } else {
        println!("NetworkManager:  not managing this interface");
    }

    match (rec.wpa_was_active, rec.wpa_pid) {
        (true, Some(pid)) => println!("wpa_supplicant:  stopped PID {}", pid),
        _ => println!("wpa_supplicant:  not running for this interface"),
    }

    for warning in &report.warnings {
        println!("Warning: {} failed: {}", warning.step, warning.message);
    }
}

fn display_restore(report: &RestoreReport) {
    println!("Restored {}", report.interface);
    for step in &report.steps {
        match &step.error {
            None => println!("  ok      {}", step.step),
            Some(err) => println!("  FAILED  {}: {}", step.step, err),
        }
    }
    if let Some(state) = &report.reconnect_state {
        println!("Connection state: {}", state);
    }
}
