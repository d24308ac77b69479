use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lobbychat::supervisor::Launcher;
use lobbychat::{
    Client, Master, MasterConfig, ProcessLauncher, RoomConfig, Supervisor, TaskLauncher, Validator, WorkerKind,
    room, store,
};

#[derive(Parser)]
#[command(name = "lobbychat")]
#[command(about = "Lobby server, room servers and terminal client for a two-tier chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// SQLite URL of the shared store, or `memory`
    #[arg(long, env = "LOBBYCHAT_DATABASE", default_value = "sqlite://lobbychat.db")]
    database: String,

    /// JSON file with {"banned_words": [...]} for username checks
    #[arg(long, env = "LOBBYCHAT_BANNED_WORDS")]
    banned_words: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lobby server
    Master {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// How rooms are started
        #[arg(long, value_enum, default_value_t = WorkerKind::Process)]
        worker: WorkerKind,

        /// Time a new room gets before its liveness is checked
        #[arg(long, default_value_t = 200)]
        startup_grace_ms: u64,

        #[command(flatten)]
        store: StoreArgs,
    },
    /// Run one room server (normally started by the master)
    Room {
        #[arg(long)]
        name: String,

        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,

        #[command(flatten)]
        store: StoreArgs,
    },
    /// Connect to a lobby from the terminal
    Client {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

fn validator(path: Option<&PathBuf>) -> anyhow::Result<Validator> {
    match path {
        Some(path) => Ok(Validator::from_json_file(path)?),
        None => Ok(Validator::default()),
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            return;
        }
        info!("shutting down");
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lobbychat=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Master {
            host,
            port,
            worker,
            startup_grace_ms,
            store,
        } => {
            let validator = validator(store.banned_words.as_ref())?;
            let db = store::open(&store.database)
                .await
                .with_context(|| format!("opening store {}", store.database))?;
            let shutdown = shutdown_on_ctrl_c();

            let launcher: Box<dyn Launcher> = match worker {
                WorkerKind::Process => Box::new(ProcessLauncher::current_exe(
                    store.database.clone(),
                    store.banned_words.clone(),
                )?),
                WorkerKind::Task => Box::new(TaskLauncher::new(db.clone(), validator, shutdown.clone())),
            };
            let config = MasterConfig::builder()
                .host(host)
                .port(port)
                .worker(worker)
                .startup_grace(Duration::from_millis(startup_grace_ms))
                .build();
            let supervisor = Supervisor::new(launcher, config.startup_grace);

            let master = Arc::new(Master::new(config, db, supervisor)?);
            master.run(shutdown).await?;
        }
        Command::Room {
            name,
            host,
            port,
            store,
        } => {
            let validator = validator(store.banned_words.as_ref())?;
            let db = store::open(&store.database)
                .await
                .with_context(|| format!("opening store {}", store.database))?;
            let config = RoomConfig::builder(name).host(host).port(port).build();
            room::run(config, db, validator, shutdown_on_ctrl_c()).await?;
        }
        Command::Client { host, port } => {
            let stdin = BufReader::new(tokio::io::stdin());
            let mut client = Client::new(stdin, tokio::io::stdout());
            client.run(&format!("{host}:{port}")).await?;
        }
    }

    Ok(())
}
