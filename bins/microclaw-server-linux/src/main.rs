use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use microclaw_core::{DeviceCommand, FileConfigStorage};
use microclaw_server::{
    Coordinator, CoordinatorConfig, LinkOpener, MemoryOpener, OrchestratorConfig, SystemSerial,
    ToolCommand,
};
use microclaw_web::{create_router, ServerState, WebConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_PORT: &str = "/dev/ttyDEMO0";

/// Serial link server for a MicroClaw device.
#[derive(Debug, Parser)]
#[command(name = "microclaw-server", version)]
struct Args {
    /// Address to serve the HTTP API and log stream on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Stored device configuration, replayed after a build and flash.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Firmware project directory handed to the build tool.
    #[arg(long, default_value = "firmware")]
    project_dir: PathBuf,

    /// Build tool program; runs as `<program> run` in the project directory.
    #[arg(long, default_value = "pio")]
    build_tool: String,

    /// Python interpreter used to run `-m esptool`.
    #[arg(long, default_value = "python3")]
    python: String,

    /// Dashboard directory served at `/`.
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Staging directory for uploaded firmware images.
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    /// Seconds between device status requests.
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,

    /// Simulate a device instead of opening real serial ports.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,microclaw_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("MicroClaw server starting...");

    let demo = args.demo.then(demo_device);
    let opener: Arc<dyn LinkOpener> = match &demo {
        Some(device) => Arc::new(device.clone()),
        None => Arc::new(SystemSerial),
    };

    let config = CoordinatorConfig {
        poll_interval: Duration::from_secs(args.poll_secs.max(1)),
        orchestrator: OrchestratorConfig {
            build_tool: ToolCommand::new(args.build_tool.clone(), ["run"]),
            flash_tool: ToolCommand::new(args.python.clone(), ["-m", "esptool"]),
            project_dir: args.project_dir.clone(),
            ..Default::default()
        },
    };
    let storage = Arc::new(FileConfigStorage::new(&args.config));
    let coordinator = Arc::new(Coordinator::new(opener, storage, config));
    let tasks = coordinator.start();

    let demo_handle = demo.map(|device| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(generate_demo_output(device, coordinator))
    });

    let mut web = WebConfig {
        static_dir: args.static_dir.clone(),
        ..Default::default()
    };
    if let Some(dir) = &args.upload_dir {
        web.upload_dir = dir.clone();
    }
    let app = create_router(ServerState::new(Arc::clone(&coordinator), web));

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("MicroClaw server ready");
    tracing::info!("   HTTP API:   http://{}/api/status", args.bind);
    tracing::info!("   Log stream: ws://{}/ws/logs", args.bind);
    tracing::info!("   Config:     {}", args.config.display());
    if args.demo {
        tracing::info!("   Demo device on {}", DEMO_PORT);
    }

    let server = axum::serve(listener, app).into_future();

    // Wait for shutdown signal
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
    }

    if let Some(handle) = demo_handle {
        handle.abort();
    }
    coordinator.disconnect().await;
    tasks.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// In-memory device answering the query commands.
fn demo_device() -> MemoryOpener {
    let device = MemoryOpener::new([DEMO_PORT]);
    device.auto_reply(
        DeviceCommand::SystemInfo.verb(),
        r#"{"heap_free": 183456, "uptime_s": 42, "wifi": "connected", "provider": "gemini"}"#,
    );
    device.auto_reply(
        DeviceCommand::ConfigShow.verb(),
        r#"{"wifi_ssid": "demo", "provider": "gemini"}"#,
    );
    device.auto_reply(
        DeviceCommand::WifiScan.verb(),
        "I (0) wifi: found 2 networks: demo (-48), guest (-71)",
    );
    device
}

/// Simulated device chatter while the demo link is open.
async fn generate_demo_output(device: MemoryOpener, coordinator: Arc<Coordinator>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3));
    let mut tick: u64 = 0;

    loop {
        interval.tick().await;
        // The demo device has no use for what it was sent.
        device.take_written();
        if !coordinator.session().is_open().await {
            continue;
        }
        tick += 1;

        let line = match tick % 4 {
            0 => format!(
                r#"{{"thought": "Checking the schedule", "action": "none", "tick": {}}}"#,
                tick
            ),
            1 => format!("I ({}) microclaw: telegram poll ok", tick * 3000),
            2 => format!("I ({}) wifi: rssi -{}", tick * 3000, 50 + tick % 20),
            _ => format!("I ({}) agent: idle", tick * 3000),
        };
        device.push_incoming(format!("{}\n", line).as_bytes());
    }
}
