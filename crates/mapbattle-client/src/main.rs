mod app;
mod event;
mod input;
mod network;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use uuid::Uuid;

use mapbattle_common::model::{QuestionMode, TURN_SECONDS};
use mapbattle_common::{Session, SessionConfig, SharedStore};

use crate::network::RemoteStore;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Flag,
    Name,
}

impl From<Mode> for QuestionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Flag => QuestionMode::Flag,
            Mode::Name => QuestionMode::Name,
        }
    }
}

/// Mapbattle client - turn-based geography quiz for the terminal
#[derive(Parser, Debug)]
#[command(name = "mapbattle-client", version, about)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:7878")]
    server: String,

    /// Stable user id; reuse it to rejoin a room after a restart
    #[arg(short, long)]
    user: Option<Uuid>,

    /// Player name
    #[arg(short, long, default_value = "Player")]
    name: String,

    /// Question mode for rooms you create
    #[arg(long, value_enum, default_value_t = Mode::Flag)]
    mode: Mode,

    /// Seconds per turn
    #[arg(long, default_value_t = TURN_SECONDS)]
    turn_seconds: u32,

    /// Pause after a question nobody answered, in milliseconds
    #[arg(long, default_value_t = 3000)]
    settle_ms: u64,

    /// Do not submit a timeout when the turn clock runs out
    #[arg(long)]
    no_auto_timeout: bool,

    /// Seed for question picks (random when unset)
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mapbattle_client=info,mapbattle_common=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let user_id = args.user.unwrap_or_else(Uuid::new_v4);
    let mode = QuestionMode::from(args.mode);

    let config = SessionConfig {
        settle_delay: Duration::from_millis(args.settle_ms),
        turn_seconds: args.turn_seconds,
        auto_timeout: !args.no_auto_timeout,
        mode,
        seed: args.seed,
        ..SessionConfig::default()
    };

    let remote = Arc::new(RemoteStore::connect(&args.server, user_id).await?);
    let store: SharedStore = remote.clone();
    let (session, session_rx) = Session::new(store, user_id, args.name, config);

    let result = app::run(session, session_rx, mode).await;
    remote.disconnect().await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }

    Ok(())
}
