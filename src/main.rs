//! Binary entry point: wires configuration, storage, the certificate
//! authority, and the two TCP listeners together. Grounded on
//! `original_source/main.go`'s startup sequence.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use devproxy::ca::{cert_path_from_env, key_path_from_env, CertificateAuthority};
use devproxy::config::{config_file_path, load_from_file, spawn_signal_save_task, SharedConfig};
use devproxy::control::{self, ControlState};
use devproxy::engine::{self, EngineContext};
use devproxy::events::EventBus;
use devproxy::live_body::LiveBodies;
use devproxy::process_info;
use devproxy::store;

#[derive(Parser, Debug)]
#[command(name = "devproxy", about = "Interactive MITM-capable HTTP/HTTPS forward proxy")]
struct Cli {
    /// Port the proxy listener binds to.
    #[arg(long, env = "PROXY_PORT", default_value_t = 8000)]
    proxy_port: u16,

    /// Port the loopback control surface binds to.
    #[arg(long, env = "PROXY_CONTROL_PORT", default_value_t = 8001)]
    control_port: u16,

    /// SQLite database file holding request metadata and bodies.
    #[arg(long, env = "PROXY_DB_FILE", default_value = "cap.db")]
    db_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = config_file_path();
    let config = SharedConfig::new(load_from_file(&config_path));
    spawn_signal_save_task(config.clone(), config_path);

    let ca = match CertificateAuthority::load(&cert_path_from_env(), &key_path_from_env(), {
        config.snapshot().await.certificate_lifetime
    }) {
        Ok(ca) => Some(Arc::new(ca)),
        Err(err) => {
            tracing::warn!(error = %err, "no usable CA material, MITM interception disabled");
            None
        }
    };

    let (bodies, metadata) = store::open(&cli.db_file)?;
    let bus = EventBus::new();

    let own_pid = std::process::id();
    let own_local_ip = process_info::discover_local_ip().await;

    let spill_dir = std::env::temp_dir().join("devproxy-spill");
    std::fs::create_dir_all(&spill_dir)?;

    let live_bodies = LiveBodies::new();

    let ctx = Arc::new(EngineContext {
        config: config.clone(),
        ca: ca.clone(),
        bodies: bodies.clone(),
        metadata: metadata.clone(),
        bus: bus.clone(),
        live_bodies: live_bodies.clone(),
        spill_dir,
        own_pid,
        own_local_ip,
    });

    let control_state = ControlState {
        config: config.clone(),
        bus: bus.clone(),
        bodies,
        metadata,
        live_bodies,
        ca,
    };
    let control_router = control::router(control_state);

    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], cli.proxy_port));
    let control_addr = SocketAddr::from(([127, 0, 0, 1], cli.control_port));

    let proxy_listener = tokio::net::TcpListener::bind(proxy_addr).await?;
    let control_listener = tokio::net::TcpListener::bind(control_addr).await?;

    tracing::info!(%proxy_addr, %control_addr, mitm_available = ctx.ca.is_some(), "devproxy starting");

    let control_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(control_listener, control_router).await {
            tracing::error!(error = %err, "control listener exited");
        }
    });

    let proxy_task = tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match proxy_listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept proxy connection");
                    continue;
                }
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                engine::handle_connection(stream, peer_addr, ctx).await;
            });
        }
    });

    tokio::select! {
        _ = control_task => {}
        _ = proxy_task => {}
    }

    Ok(())
}
