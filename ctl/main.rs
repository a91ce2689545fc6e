#![forbid(unsafe_code)]

//! `companion-ctl`: command-line client for `companion-bridge`.
//!
//! Connects through the library's connection manager and prints JSON
//! results. The bearer token comes from `--token` or `COMPANION_AUTH_TOKEN`.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use companion_bridge::client::discovery;
use companion_bridge::client::{ClientOptions, ConnectionManager};
use companion_bridge::config::AUTH_TOKEN_ENV;
use companion_bridge::models::endpoint::Endpoint;
use companion_bridge::models::frame::ServerFrame;
use companion_bridge::models::response::ResponseFormat;
use companion_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Format {
    Json,
    Text,
    Markdown,
}

impl From<Format> for ResponseFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => Self::Json,
            Format::Text => Self::Text,
            Format::Markdown => Self::Markdown,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "companion-ctl",
    about = "Command-line client for companion-bridge",
    version,
    long_about = None
)]
struct Cli {
    /// Server host name or address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Bearer token; defaults to the `COMPANION_AUTH_TOKEN` env var.
    #[arg(long)]
    token: Option<String>,

    /// Force TLS (`https` / `wss`); inferred from port 443 otherwise.
    #[arg(long)]
    secure: bool,

    /// Probe and handshake timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe server liveness.
    Health,

    /// Show server capabilities.
    Info,

    /// One-shot prompt.
    Ask {
        /// Prompt text.
        prompt: String,
        /// Continue this session instead of creating one.
        #[arg(long)]
        session: Option<String>,
        /// Output format.
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Prompt over the streaming channel, printing partial output live.
    Stream {
        /// Prompt text.
        prompt: String,
        /// Continue this session instead of creating one.
        #[arg(long)]
        session: Option<String>,
        /// Output format.
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Start a streaming session over HTTP.
    Start {
        /// Initial prompt.
        prompt: String,
        /// Working directory for the session.
        #[arg(long)]
        working_directory: Option<PathBuf>,
    },

    /// List live sessions.
    Sessions,

    /// Show one session.
    Show {
        /// Session id.
        session: String,
    },

    /// Close a session.
    Close {
        /// Session id.
        session: String,
    },

    /// Answer a pending permission request.
    Permission {
        /// Session id.
        session: String,
        /// Response: y, n, abort, or free text.
        response: String,
    },

    /// Attach to a session and print its frames until interrupted.
    Watch {
        /// Session id.
        session: String,
    },

    /// Probe a range of ports on one or more hosts.
    Discover {
        /// Hosts to probe.
        #[arg(long = "candidate", default_value = "127.0.0.1")]
        hosts: Vec<String>,
        /// First port of the range.
        #[arg(long, default_value_t = 3000)]
        from_port: u16,
        /// Last port of the range.
        #[arg(long, default_value_t = 3010)]
        to_port: u16,
    },
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        std::process::exit(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("Error ({}): {err}", err.kind());
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let token = args
        .token
        .clone()
        .or_else(|| std::env::var(AUTH_TOKEN_ENV).ok());
    let timeout = Duration::from_secs(args.timeout);

    if let Command::Discover {
        ref hosts,
        from_port,
        to_port,
    } = args.command
    {
        let ports: Vec<u16> = (from_port..=to_port).collect();
        let found =
            discovery::discover(discovery::candidates(hosts, &ports, token.as_deref()), timeout)
                .await;
        let rows: Vec<serde_json::Value> = found
            .iter()
            .map(|server| {
                serde_json::json!({
                    "address": server.endpoint.address(),
                    "port": server.endpoint.port(),
                    "status": server.report.status,
                    "version": server.report.version,
                })
            })
            .collect();
        return print_json(&rows);
    }

    let endpoint = if args.secure {
        Endpoint::new(&args.host, args.port, token, true)
    } else {
        Endpoint::infer(&args.host, args.port, token)
    };
    let manager = ConnectionManager::new(ClientOptions {
        probe_timeout: timeout,
        ..ClientOptions::default()
    });
    manager.connect(endpoint).await?;

    let outcome = execute(&manager, args.command).await;
    manager.disconnect();
    outcome
}

async fn execute(manager: &ConnectionManager, command: Command) -> Result<()> {
    match command {
        Command::Health => print_json(&manager.health_check().await?),
        Command::Info => print_json(&manager.server_info().await?),
        Command::Ask {
            prompt,
            session,
            format,
        } => print_json(
            &manager
                .send_prompt(&prompt, session.as_deref(), format.into())
                .await?,
        ),
        Command::Stream {
            prompt,
            session,
            format,
        } => {
            let response = manager
                .send_streaming_prompt(&prompt, session.as_deref(), format.into(), |chunk| {
                    print!("{}", chunk.text);
                    let _ = std::io::stdout().flush();
                })
                .await?;
            println!();
            eprintln!(
                "session {} · {} partials · {} ms",
                response.session_id, response.partial_count, response.duration_ms
            );
            Ok(())
        }
        Command::Start {
            prompt,
            working_directory,
        } => print_json(
            &manager
                .start_session(&prompt, working_directory, ResponseFormat::Text)
                .await?,
        ),
        Command::Sessions => print_json(&manager.list_sessions().await?),
        Command::Show { session } => print_json(&manager.get_session(&session).await?),
        Command::Close { session } => print_json(&manager.close_session(&session).await?),
        Command::Permission { session, response } => print_json(
            &manager
                .respond_to_permission(&session, &response)
                .await?,
        ),
        Command::Watch { session } => watch(manager, &session).await,
        Command::Discover { .. } => Ok(()),
    }
}

async fn watch(manager: &ConnectionManager, session_id: &str) -> Result<()> {
    let mut events = manager.events();
    let mut status = manager.watch_status();
    manager.subscribe(session_id).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            changed = status.changed() => {
                if changed.is_err() || !manager.is_connected() {
                    return Err(AppError::Network("channel closed".into()));
                }
            }
            event = events.recv() => match event {
                Ok(frame) => {
                    if frame.session_id().is_some_and(|id| id != session_id) {
                        continue;
                    }
                    print_json(&frame)?;
                    if matches!(frame, ServerFrame::SessionClosed { .. }) {
                        return Ok(());
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("skipped {skipped} frames");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(AppError::Network("channel closed".into()));
                }
            }
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
