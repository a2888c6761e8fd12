//! The per-session bridge binary, exec'd by the auth broker with the
//! client socket on the inherited fd.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use linuxio_bridge::handlers::{self, HandlerDeps};
use linuxio_bridge::{
    BridgeConfig, BridgeRuntime, BusManager, RegistryBuilder, SessionInfo,
};
use tokio_util::sync::CancellationToken;

/// Per-session privileged bridge (internal; exec'd by `linuxio broker`).
#[derive(Parser)]
#[command(name = "linuxio-bridge")]
#[command(version)]
struct BridgeArgs {
    /// Session id this bridge serves
    #[arg(long)]
    session_id: String,

    /// Reconnect socket path
    #[arg(long)]
    bridge_socket: Option<PathBuf>,

    /// Deployment mode: production or development
    #[arg(long, default_value = "production")]
    env: String,

    /// The session is privileged
    #[arg(long)]
    privileged: bool,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = BridgeArgs::parse();

    let default_filter = if args.verbose || args.env == "development" {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(args).await {
        tracing::error!(error = %err, "bridge failed");
        std::process::exit(1);
    }
}

async fn run(args: BridgeArgs) -> anyhow::Result<()> {
    let secret = std::env::var(linuxio_auth::ENV_BRIDGE_SECRET).unwrap_or_default();

    // The broker already switched us to the target identity.
    let uid = nix::unistd::Uid::effective();
    let account = nix::unistd::User::from_uid(uid)?
        .ok_or_else(|| anyhow::anyhow!("no passwd entry for uid {uid}"))?;

    let session = SessionInfo {
        session_id: args.session_id.clone(),
        user: account.name,
        uid: uid.as_raw(),
        gid: account.gid.as_raw(),
        privileged: args.privileged,
    };
    tracing::info!(
        session = %session.session_id,
        user = %session.user,
        uid = session.uid,
        privileged = session.privileged,
        "bridge starting"
    );

    let shutdown = CancellationToken::new();
    let deps = HandlerDeps {
        bus: Arc::new(BusManager::system()),
        shutdown: shutdown.clone(),
    };
    let mut builder = RegistryBuilder::new();
    handlers::install(&mut builder, &deps);

    let mut config = BridgeConfig::new(session, secret);
    config.server_base_url =
        std::env::var(linuxio_auth::ENV_SERVER_BASE_URL).unwrap_or_default();
    config.server_cert = std::env::var(linuxio_auth::ENV_SERVER_CERT).unwrap_or_default();
    config.bridge_socket = args.bridge_socket;
    let runtime = BridgeRuntime::with_shutdown_token(config, builder.freeze(), shutdown.clone());

    // Orderly exit on SIGTERM/SIGINT: drain, then go.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("install SIGINT handler");
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            tracing::info!("signal received, draining");
            shutdown.cancel();
        });
    }

    runtime.serve_inherited().await?;
    Ok(())
}
