use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use simrelay::message::FIELD_TYPE;
use simrelay::{ClientSession, ConfigError, Message, Server, ServerContext, ServerError, Settings};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("failed to read stdin: {0}")]
    Stdin(#[from] std::io::Error),
    #[error("failed to encode status: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "simrelay", about = "Real-time messaging relay server and client")]
struct Cli {
    /// YAML config file (defaults to config/simrelay.yaml when present).
    #[arg(long, env = "SIMRELAY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server until Ctrl-C.
    Serve(ServeArgs),
    /// Run a client session that sends stdin JSON lines.
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    ws_port: Option<u16>,

    /// Answer `echo` messages with `echo_response`.
    #[arg(long, default_value_t = false)]
    echo: bool,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    client_type: Option<String>,

    /// Print inbound messages of this type. Repeatable.
    #[arg(long = "watch", value_name = "TYPE")]
    watch: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings.log_level);

    match cli.command {
        Command::Serve(args) => run_serve(settings, args).await,
        Command::Connect(args) => run_connect(settings, args).await,
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// SERVE
// =============================================================================

async fn run_serve(mut settings: Settings, args: ServeArgs) -> Result<(), CliError> {
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if args.ws_port.is_some() {
        settings.server.ws_port = args.ws_port;
    }
    settings.validate()?;

    let server = Server::new(settings.server);
    if args.echo {
        server.register_sync_handler("echo", echo);
    }
    server.start().await?;
    info!(tcp = ?server.local_addr(), ws = ?server.ws_local_addr(), echo = args.echo, "simrelay serving");

    shutdown_signal().await;
    info!(connections = server.connection_count(), "shutdown requested");
    server.stop().await;
    Ok(())
}

fn echo(ctx: ServerContext, msg: &Message) -> simrelay::dispatch::HandlerResult {
    let mut payload = msg.payload().clone();
    payload.remove(FIELD_TYPE);
    if !ctx.reply(Message::new("echo_response").with_payload(payload)) {
        debug!(connection_id = %ctx.connection_id, "echo reply not delivered");
    }
    Ok(())
}

// =============================================================================
// CONNECT
// =============================================================================

async fn run_connect(mut settings: Settings, args: ConnectArgs) -> Result<(), CliError> {
    if let Some(url) = args.url {
        settings.client.url = url;
    }
    if let Some(client_type) = args.client_type {
        settings.client.client_type = client_type;
    }
    settings.validate()?;

    let session = ClientSession::new(settings.client);
    for kind in &args.watch {
        session.register_sync_handler(kind.as_str(), |_session, msg| {
            println!("{}", msg.to_json()?);
            Ok(())
        });
    }

    if !session.start().await {
        warn!(url = %session.config().url, "initial connect failed; retrying in background");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match Message::parse(line.as_bytes()) {
                    Ok(msg) => {
                        if !session.send(msg).await {
                            debug!(queued = session.queue_len(), "message not sent immediately");
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping invalid input line"),
                }
            }
            () = &mut shutdown => {
                interrupted = true;
                break;
            }
        }
    }

    // Keep printing watched messages after stdin closes.
    if !interrupted && !args.watch.is_empty() {
        shutdown.await;
    }

    session.stop().await;
    println!("{}", serde_json::to_string_pretty(&session.status())?);
    Ok(())
}
