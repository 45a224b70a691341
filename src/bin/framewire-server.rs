//! Stand-alone frame server backed by in-memory databases.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use framewire::config::NetConfig;
use framewire::frames::MemoryBackend;
use framewire::server::ServerDispatcher;

#[derive(Debug, Parser)]
#[command(version, about = "FramepaC-compatible frame server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen port (default 5924, or 5925 in peer mode)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long, value_name = "ADDR")]
    host: Option<String>,

    /// Identify as a peer-to-peer node instead of a dedicated server
    #[arg(long, action)]
    peer: bool,

    /// Create an empty database with this name at startup (repeatable)
    #[arg(short, long = "database", value_name = "NAME")]
    databases: Vec<String>,

    /// Log level used when `RUST_LOG` is not set
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    log_level: String,
}

async fn serve(args: Args) -> framewire::Result<()> {
    let mut config = NetConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if args.peer {
        config.peer_mode = true;
    }

    let backend = args
        .databases
        .iter()
        .fold(MemoryBackend::new(), |backend, name| {
            backend.with_database(name, Vec::new())
        });

    let mut server = ServerDispatcher::bind(config, backend).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = framewire::logging::init(&args.log_level) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    match serve(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
