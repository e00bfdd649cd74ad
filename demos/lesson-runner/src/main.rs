//! Command-line runner for lesson programs.
//!
//! Run a program once, printing every host event as a JSON line:
//!
//! ```text
//! lesson-runner run --plugin chat --code hello.lua
//! ```
//!
//! Lines typed on stdin are parsed as JSON and sent to the module, so a chat
//! answer is `{"contents":"text","text":"Ada"}`.
//!
//! Or serve the WebSocket transport: `lesson-runner serve --addr 127.0.0.1:3000`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use playground_core::{ContextVariant, HostEvent, OutputHub, SandboxConfig};
use playground_host::{ExecutionSender, HostController};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lesson-runner", version, about)]
struct Cli {
    /// Sandbox settings as JSON; unset fields keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one program and exit when it finishes.
    Run(RunArgs),
    /// Serve the WebSocket transport.
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Module source file.
    #[arg(long, conflicts_with = "plugin", required_unless_present = "plugin")]
    module: Option<PathBuf>,

    /// Built-in module: chat, planets or music.
    #[arg(long)]
    plugin: Option<String>,

    /// User program.
    #[arg(long)]
    code: PathBuf,

    /// Overrides the configured context variant.
    #[arg(long)]
    variant: Option<ContextVariant>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout carries events, so logs go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Serve { addr } => serve(config, addr).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<SandboxConfig> {
    let Some(path) = path else {
        return Ok(SandboxConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn builtin_module(name: &str) -> anyhow::Result<&'static str> {
    Ok(match name {
        "chat" => playground_plugins::chat::MODULE,
        "planets" => playground_plugins::planets::MODULE,
        "music" => playground_plugins::music::MODULE,
        other => bail!("unknown plugin {other:?}"),
    })
}

async fn run(mut config: SandboxConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(variant) = args.variant {
        config.variant = variant;
    }
    let module_code = match (&args.module, &args.plugin) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("reading module {}", path.display()))?,
        (None, Some(name)) => builtin_module(name)?.to_string(),
        (None, None) => bail!("either --module or --plugin is required"),
    };
    let user_code = std::fs::read_to_string(&args.code)
        .with_context(|| format!("reading program {}", args.code.display()))?;

    let hub = Arc::new(OutputHub::new());
    let mut controller = HostController::new(config, hub.sink())?;
    tokio::spawn(forward_stdin(controller.sender()));
    controller.start_execution(&user_code, &module_code)?;

    // The start event is already in the backlog and replays on subscribe.
    let (_, mut events) = hub.stream();
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
        if event == HostEvent::Finished {
            break;
        }
    }
    controller.terminate();
    Ok(())
}

/// Send each stdin line to the running module.
async fn forward_stdin(sender: ExecutionSender) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("stdin closed: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let contents = match serde_json::from_str(&line) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("ignoring input that is not JSON: {e}");
                continue;
            }
        };
        if let Err(e) = sender.send_module(contents) {
            tracing::warn!("cannot deliver input: {e}");
            return;
        }
    }
}

async fn serve(config: SandboxConfig, addr: SocketAddr) -> anyhow::Result<()> {
    let app = playground_transport::create_ws_router(config);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Server listening on ws://{addr}/ws");
    axum::serve(listener, app).await?;
    Ok(())
}
