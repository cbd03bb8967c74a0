use clap::Parser;
use grblproxy::{init_tracing, Service, Verbosity, VERSION};
use grblproxy_config::{CliOverrides, ProxyConfig};
use std::path::PathBuf;
use std::process::ExitCode;

/// A bidirectional TCP-to-serial proxy for GRBL-compatible CNC motion
/// controllers.
#[derive(Parser, Debug)]
#[command(name = "grblproxy", version = VERSION, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration to the config path and exit.
    #[arg(long)]
    generate_config: bool,

    /// Run without a serial device, acknowledging every GCode command with `ok`.
    #[arg(long)]
    dry_run: bool,

    /// TCP port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// TCP address to bind to.
    #[arg(long)]
    address: Option<String>,

    /// Maximum number of commands admitted before new ones are rejected.
    #[arg(long)]
    queue_limit: Option<usize>,

    /// USB vendor:product id (hex, e.g. `1a86:7523`) to locate the device by.
    #[arg(long, short = 'd')]
    usb_id: Option<String>,

    /// Serial device path, as an alternative to `--usb-id`.
    #[arg(long = "dev-path", visible_alias = "dev")]
    dev_path: Option<String>,

    /// Serial baud rate.
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Delay after opening the serial port before use, in milliseconds.
    #[arg(long)]
    serial_delay: Option<u64>,

    /// Device response timeout, in milliseconds.
    #[arg(long)]
    response_timeout: Option<u64>,

    /// Liveness status-poll interval, in milliseconds (0 disables it).
    #[arg(long)]
    liveness_period: Option<u64>,

    /// Discard the `ok` a liveness poll's `?` sometimes provokes.
    #[arg(long)]
    swallow_realtime_ok: Option<bool>,

    /// Accepted for config compatibility; any value other than `forward` is rejected.
    #[arg(long, default_value = "forward")]
    status_behavior: String,

    /// Append every serial line exchanged with the device to this file.
    #[arg(long)]
    gcode_log_file: Option<String>,

    /// Append every TCP line exchanged with clients to this file.
    #[arg(long)]
    tcp_log_file: Option<String>,

    /// Increase log verbosity (`-v` = debug, `-vv` = trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all but error-level logging. Wins over `-v`.
    #[arg(short, long)]
    quiet: bool,
}

impl From<&Cli> for CliOverrides {
    fn from(cli: &Cli) -> Self {
        CliOverrides {
            port: cli.port,
            address: cli.address.clone(),
            queue_limit: cli.queue_limit,
            usb_id: cli.usb_id.clone(),
            dev_path: cli.dev_path.clone(),
            baud_rate: cli.baud_rate,
            serial_delay: cli.serial_delay,
            response_timeout: cli.response_timeout,
            liveness_period: cli.liveness_period,
            swallow_realtime_ok: cli.swallow_realtime_ok,
            gcode_log_file: cli.gcode_log_file.clone(),
            tcp_log_file: cli.tcp_log_file.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.status_behavior != "forward" {
        eprintln!(
            "error: --status-behavior only supports 'forward' in this build (got '{}')",
            cli.status_behavior
        );
        return ExitCode::FAILURE;
    }

    let verbosity = Verbosity::from_counts(cli.verbose, cli.quiet);
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async_main(cli, verbosity))
}

async fn async_main(cli: Cli, verbosity: Verbosity) -> ExitCode {
    let skip_device_validation = cli.dry_run;
    let overrides = CliOverrides::from(&cli);
    let config = match ProxyConfig::load(cli.config.as_deref(), overrides, skip_device_validation) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.generate_config {
        if let Err(e) = config.save(cli.config.as_deref()) {
            eprintln!("error: failed to write config: {e}");
            return ExitCode::FAILURE;
        }
        println!("configuration written");
        return ExitCode::SUCCESS;
    }

    let gcode_log_file = config.gcode_log_file.as_deref().map(std::path::Path::new);
    let tcp_log_file = config.tcp_log_file.as_deref().map(std::path::Path::new);
    let _guards = match init_tracing(verbosity, gcode_log_file, tcp_log_file) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("error: failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        address = %config.server.address,
        port = config.server.port,
        queue_limit = config.server.queue_limit,
        usb_id = ?config.device.usb_id,
        path = ?config.device.path,
        dry_run = cli.dry_run,
        "starting grblproxy",
    );

    let service = match Service::start(&config, cli.dry_run).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to start service");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = wait_for_shutdown_signal().await {
        tracing::error!(error = %e, "failed to install shutdown signal handlers");
        service.stop().await;
        return ExitCode::FAILURE;
    }

    tracing::info!("shutdown signal received, stopping");
    service.stop().await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
