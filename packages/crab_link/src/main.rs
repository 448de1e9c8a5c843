use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crab_link::{
    ClientConfig, ClientMessage, Connection, ConnectionState, MessageRouter, SessionFilter,
    Subscription, default_config_dir, load_config,
};
use futures::StreamExt;
use futures::stream::{BoxStream, select_all};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "crab-link")]
#[command(about = "Stream and drive Crab City sessions over a reconnecting WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (defaults to ~/.crablink)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Connect with wss://
    #[arg(long, global = true)]
    tls: bool,

    /// Bearer token for the handshake
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print inbound messages as JSON lines until interrupted
    Tail(TailArgs),

    /// Send one line of input to a session
    Send(SendArgs),
}

#[derive(Parser)]
struct TailArgs {
    /// Only print messages for this session
    #[arg(short, long)]
    session: Option<String>,
}

#[derive(Parser)]
struct SendArgs {
    /// Target session
    #[arg(short, long)]
    session: String,

    /// Text to send
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    let default_directive = if cli.verbose {
        "crab_link=debug,warn"
    } else {
        "crab_link=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = resolve_config(&cli)?;
    let conn = Arc::new(Connection::from_config(&config).context("Invalid server endpoint")?);

    match cli.command {
        Commands::Tail(args) => tail(conn, args.session).await,
        Commands::Send(args) => send(conn, args).await,
    }
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => default_config_dir().context("Could not determine home directory")?,
    };
    let mut config: ClientConfig = load_config(&config_dir)
        .extract()
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.tls {
        config.tls = true;
    }
    if let Some(token) = &cli.token {
        config.auth_token = Some(token.clone());
    }
    Ok(config)
}

/// One stdout line per inbound message.
#[derive(Serialize)]
struct Line<T> {
    channel: &'static str,
    message: T,
}

fn lines<T>(channel: &'static str, feed: Subscription<T>) -> BoxStream<'static, String>
where
    T: Serialize + Send + 'static,
{
    feed.filter_map(move |message| async move { to_line(channel, message) })
        .boxed()
}

fn filtered_lines<T>(channel: &'static str, feed: SessionFilter<T>) -> BoxStream<'static, String>
where
    T: Serialize + crab_link::SessionScoped + Send + 'static,
{
    feed.filter_map(move |message| async move { to_line(channel, message) })
        .boxed()
}

fn to_line<T: Serialize>(channel: &'static str, message: T) -> Option<String> {
    match serde_json::to_string(&Line { channel, message }) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!(channel, error = %e, "failed to encode message");
            None
        }
    }
}

async fn tail(conn: Arc<Connection>, session: Option<String>) -> Result<()> {
    let router = MessageRouter::new(conn.clone());
    let feeds = match &session {
        Some(id) => vec![
            filtered_lines("chat_output", router.cli_outputs_for(id)),
            filtered_lines("session_state", router.session_states_for(id)),
            filtered_lines("prompt_request", router.prompt_requests_for(id)),
            filtered_lines("error", router.errors_for(id)),
            filtered_lines("sync", router.syncs_for(id)),
        ],
        None => vec![
            lines("chat_output", router.cli_outputs()),
            lines("session_state", router.session_states()),
            lines("prompt_request", router.prompt_requests()),
            lines("error", router.errors()),
            lines("sync", router.syncs()),
        ],
    };
    let mut output = select_all(feeds);
    let mut states = conn.state_changes();
    router.start();

    conn.connect().await.context("Failed to connect")?;
    info!(session = session.as_deref().unwrap_or("*"), "tailing");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = output.next() => match line {
                Some(line) => println!("{line}"),
                None => break,
            },
            state = states.recv() => match state {
                Some(ConnectionState::Failed { reason }) => {
                    router.stop();
                    conn.disconnect().await;
                    bail!("Connection failed: {reason}");
                }
                Some(state) => eprintln!("[{state}]"),
                None => break,
            },
        }
    }

    router.stop();
    conn.disconnect().await;
    Ok(())
}

async fn send(conn: Arc<Connection>, args: SendArgs) -> Result<()> {
    conn.connect().await.context("Failed to connect")?;
    let result = conn
        .send_message(&ClientMessage::Input {
            session_id: args.session.clone(),
            text: args.text,
        })
        .await;
    conn.disconnect().await;
    result.with_context(|| format!("Failed to send to session {}", args.session))?;
    info!(session = %args.session, "sent");
    Ok(())
}
