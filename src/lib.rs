//! The GRBL GCode proxy service.
//!
//! Wires a loaded [`grblproxy_config::ProxyConfig`] into a compiled
//! trigger table, a device engine (real serial or a dry-run stub), a
//! connection manager, and a TCP server, and owns their combined
//! startup/shutdown sequence.

pub mod logging;

pub use logging::{init_tracing, Verbosity};

use grblproxy_config::ProxyConfig;
use grblproxy_device::{DeviceEngineConfig, DeviceHandle, DeviceTarget};
use grblproxy_net::{ConnectionManager, TcpServer};
use grblproxy_triggers::TriggerTable;
use std::net::SocketAddr;
use std::sync::Arc;

/// Library version, reported by `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A fully wired, running instance of the proxy.
///
/// Call [`Service::stop`] for graceful shutdown. Dropping this without
/// stopping leaves the accept loop, connection manager, and device
/// engine running in the background.
pub struct Service {
    device: DeviceHandle,
    connections: ConnectionManager,
    server: TcpServer,
}

impl Service {
    /// Build and start every subsystem described by `config`.
    ///
    /// `dry_run` replaces the serial device engine with a stub that
    /// acknowledges every `GCodeTask` with `ok` and never opens a
    /// serial port, for exercising the TCP/trigger/connection layers
    /// without hardware.
    pub async fn start(config: &ProxyConfig, dry_run: bool) -> anyhow::Result<Self> {
        let triggers = Arc::new(TriggerTable::compile(&config.custom_triggers)?);
        let connections = ConnectionManager::spawn();
        let response_sink: Arc<dyn grblproxy_device::ResponseSink> = Arc::new(connections.clone());

        let device = if dry_run {
            grblproxy_device::spawn_dry_run(config.server.queue_limit, response_sink)
        } else {
            let engine_cfg = DeviceEngineConfig {
                target: device_target(config)?,
                baud_rate: config.device.baud_rate,
                serial_delay_ms: config.device.serial_delay,
                queue_limit: config.server.queue_limit,
                liveness_period_ms: config.device.liveness_period,
                swallow_realtime_ok: config.device.swallow_realtime_ok,
                ..DeviceEngineConfig::default()
            };
            grblproxy_device::spawn(engine_cfg, response_sink, triggers.clone())
        };

        let addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port).parse()?;
        let server = TcpServer::bind(addr, connections.clone(), device.clone(), triggers).await?;

        tracing::info!(
            %addr,
            queue_limit = config.server.queue_limit,
            dry_run,
            "proxy service started",
        );

        Ok(Self {
            device,
            connections,
            server,
        })
    }

    /// Stop the server (cancelling in-flight connection tasks), then
    /// the connection manager (closing every writer), then disconnect
    /// the device. Completes even if the device never connected.
    pub async fn stop(self) {
        self.server.stop().await;
        self.connections.stop();
        self.device.stop();
    }
}

fn device_target(config: &ProxyConfig) -> anyhow::Result<DeviceTarget> {
    let usb_id = config.device.usb_id.as_deref().filter(|s| !s.trim().is_empty());
    let path = config.device.path.as_deref().filter(|s| !s.trim().is_empty());
    match (usb_id, path) {
        (Some(usb_id), _) => Ok(DeviceTarget::UsbId(usb_id.to_string())),
        (None, Some(path)) => Ok(DeviceTarget::DevPath(path.to_string())),
        (None, None) => anyhow::bail!("device target is required outside dry-run mode"),
    }
}
