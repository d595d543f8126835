use anyhow::Result;
use botflow::{
    config::RuntimeConfig,
    engine::FlowEngine,
    logger::init_tracing,
    registry::{BotDefinition, BotRegistry},
    store::MemoryStore,
    telegram::TelegramApi,
    webhook,
};
use clap::{Args, Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "botflow",
    about = "Flow execution runtime for visually built Telegram chatbots",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook runtime
    Run(RunArgs),

    /// Emit the JSON Schema for bot-definition files
    Schema,

    /// Validate one bot-definition file
    Validate { file: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Listen address; overrides BOTFLOW_BIND
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Directory of bot definitions; overrides BOTFLOW_BOTS_DIR
    #[arg(long)]
    bots_dir: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        bind: None,
        bots_dir: None,
        log_level: "info".to_string(),
        log_dir: None,
    })) {
        Commands::Run(args) => run(args).await,
        Commands::Schema => {
            let schema = schemars::schema_for!(BotDefinition);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Validate { file } => {
            let def = BotDefinition::from_path(&file)?;
            println!(
                "✅ Bot definition `{}` is valid ({} nodes, {} edges).",
                def.bot.id,
                def.nodes.len(),
                def.edges.len()
            );
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(bots_dir) = args.bots_dir {
        config.bots_dir = bots_dir;
    }

    let _guard = init_tracing(&args.log_level, args.log_dir)?;
    info!("botflow runtime starting up");

    let store = MemoryStore::new(config.session_ttl_secs);
    let registry = BotRegistry::new(store.clone());
    let loaded = registry.load_dir(&config.bots_dir)?;
    info!(loaded, dir = %config.bots_dir.display(), "bot definitions loaded");
    let watcher = registry.watch(config.bots_dir.clone());

    let api = TelegramApi::new(config.api_base.clone(), config.provider_token.clone())?;
    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(api),
        config.dedup_ttl_secs,
    ));

    let app = webhook::router(engine);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!("webhook listening on http://{}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("botflow runtime shutting down");
    watcher.abort();
    Ok(())
}
