use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use tg_purge::checkpoint::CheckpointStore;
use tg_purge::config;
use tg_purge::db;
use tg_purge::engine::{self, CancelFlag, EngineSettings, MissionContext};
use tg_purge::pause::TokioPause;
use tg_purge::remote::http::GatewayClient;
use tg_purge::whitelist::PreferenceStore;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Whitelist entry (username, t.me link, display name or numeric id).
    /// Entries are stored for the session and apply to later runs too.
    #[arg(long = "keep", value_name = "ID", value_delimiter = ',')]
    keep: Vec<String>,

    /// Forget previous progress and start a new mission
    #[arg(long)]
    reset_checkpoint: bool,

    /// Dispatch conversations that previously ended in failure again
    #[arg(long, conflicts_with = "reset_checkpoint")]
    retry_failed: bool,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_example: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let mut checkpoint = CheckpointStore::load(pool.clone(), &cfg.app.session).await?;
    if args.reset_checkpoint {
        checkpoint.clear().await?;
    } else if args.retry_failed {
        checkpoint.clear_failures().await?;
    }

    let mut preferences = PreferenceStore::load(pool.clone(), &cfg.app.session).await?;
    preferences.merge(&cfg.whitelist);

    let mut keep = args.keep;
    keep.extend(config::env_whitelist());

    let remote = GatewayClient::from_config(&cfg.remote)?;

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current conversation");
            on_signal.cancel();
        }
    });

    info!(session = %cfg.app.session, resumed = checkpoint.len(), "starting cleanup mission");
    let report = engine::run_mission(
        &remote,
        &keep,
        MissionContext {
            checkpoint: &mut checkpoint,
            preferences: &mut preferences,
            pause: &TokioPause,
            settings: EngineSettings::from(&cfg.cleanup),
            cancel,
            log_dir: Some(PathBuf::from(&cfg.app.log_dir)),
        },
    )
    .await?;

    println!("{report}");
    pool.close().await;
    Ok(())
}
