//! LinuxIO operator CLI: run the auth broker, list sessions, poke
//! handlers for debugging.
//!
//! Exit codes: 0 success, 1 execution failure, 2 invalid usage (clap),
//! 130 on interrupt.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use linuxio_auth::{AuthBroker, BrokerConfig, ExecBridgeSpawner, ShadowVerifier};
use linuxio_client::{AuthOptions, BridgeClient};
use linuxio_mux::MuxConfig;
use linuxio_proto::{AuthResponse, EnvMode};
use linuxio_session::generate_token;

use config::Config;

/// Local web-based Linux administration console - IPC core CLI.
#[derive(Parser)]
#[command(name = "linuxio")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the privileged auth broker daemon
    Broker {
        /// Listening socket, overriding the config file
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Bridge binary to exec per session, overriding the config file
        #[arg(long)]
        bridge_binary: Option<PathBuf>,
    },

    /// Sign in and list the active sessions reachable from that sign-in
    Sessions {
        /// Account to sign in as (password prompted)
        #[arg(short, long)]
        user: String,

        /// Broker socket, overriding the config file
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Sign in and invoke one handler, printing progress and result
    Call {
        /// Account to sign in as (password prompted)
        #[arg(short, long)]
        user: String,

        /// Handler namespace
        namespace: String,

        /// Handler command
        command: String,

        /// Handler arguments
        args: Vec<String>,

        /// Broker socket, overriding the config file
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Sign in and ping the session bridge
    Ping {
        /// Account to sign in as (password prompted)
        #[arg(short, long)]
        user: String,

        /// Broker socket, overriding the config file
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("linuxio: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Broker {
            socket,
            bridge_binary,
        } => run_broker(config, socket, bridge_binary).await,
        Commands::Sessions { user, socket } => run_sessions(config, socket, user).await,
        Commands::Call {
            user,
            namespace,
            command,
            args,
            socket,
        } => run_call(config, socket, user, &namespace, &command, args).await,
        Commands::Ping { user, socket } => {
            run_call(config, socket, user, "control", "ping", vec![]).await
        }
        Commands::Version => {
            println!("linuxio {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

async fn run_broker(
    config: Config,
    socket: Option<PathBuf>,
    bridge_binary: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let socket_path = socket.unwrap_or(config.socket);
    let bridge_binary = bridge_binary.unwrap_or(config.bridge_binary);

    let broker = AuthBroker::new(
        BrokerConfig {
            socket_path: socket_path.clone(),
            admin_group: config.admin_group,
            motd_path: config.motd,
            ..BrokerConfig::default()
        },
        Arc::new(ShadowVerifier::new()),
        Arc::new(ExecBridgeSpawner::new(bridge_binary, socket_path)),
    );

    tokio::select! {
        result = broker.run() => {
            result?;
            Ok(0)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(130)
        }
    }
}

/// Prompt for the password, sign in, and hand back the bridge client.
async fn sign_in(
    config: &Config,
    socket: Option<PathBuf>,
    user: String,
) -> anyhow::Result<(BridgeClient, AuthResponse)> {
    let socket_path = socket.unwrap_or_else(|| config.socket.clone());
    let password = rpassword::prompt_password(format!("password for {user}: "))?;

    let account = nix::unistd::User::from_name(&user)?
        .ok_or_else(|| anyhow::anyhow!("no such user: {user}"))?;
    let token = generate_token();
    let bridge_path =
        linuxio_auth::bridge_socket_path(&config.runtime_dir, account.uid.as_raw(), &token);

    let options = AuthOptions {
        socket_path,
        user,
        password,
        session_id: generate_token(),
        bridge_path: bridge_path.to_string_lossy().into_owned(),
        secret: generate_token(),
        env_mode: EnvMode::Production,
        verbose: false,
        server_base_url: String::new(),
        server_cert: String::new(),
    };

    let (client, response) = BridgeClient::connect(&options, MuxConfig::default()).await?;
    if !response.motd.is_empty() {
        eprintln!("{}", response.motd.trim_end());
    }
    Ok((client, response))
}

async fn run_sessions(
    config: Config,
    socket: Option<PathBuf>,
    user: String,
) -> anyhow::Result<i32> {
    let (client, _response) = sign_in(&config, socket, user).await?;

    let outcome = client.call("control", "sessions", vec![]).await?;
    let sessions = outcome
        .result
        .data
        .as_ref()
        .and_then(|data| data.get("sessions"))
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
    println!("{}", serde_json::to_string_pretty(&sessions)?);

    client.shutdown();
    if outcome.result.is_ok() { Ok(0) } else { Ok(1) }
}

async fn run_call(
    config: Config,
    socket: Option<PathBuf>,
    user: String,
    namespace: &str,
    command: &str,
    args: Vec<String>,
) -> anyhow::Result<i32> {
    let (client, _response) = sign_in(&config, socket, user).await?;

    let outcome = client.call(namespace, command, args).await?;
    for progress in &outcome.progress {
        eprintln!("progress: {progress}");
    }
    println!("{}", serde_json::to_string_pretty(&outcome.result)?);

    client.shutdown();
    if outcome.result.is_ok() { Ok(0) } else { Ok(1) }
}
