use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use plhub_storage::PgEntityStore;
use plhub_sync::{load_aliases, Canonical, Canonicalizer, NameKind, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "plhub")]
#[command(about = "Premier League export ingest and identity reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Load every recognised export in the data directory
    Sync {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Alias table overriding the built-in one
        #[arg(long)]
        aliases: Option<PathBuf>,
    },
    /// Create the schema if it does not exist
    InitDb,
    /// Show how a raw name would be canonicalized
    ResolveName {
        #[arg(long, value_enum, default_value_t = KindArg::Team)]
        kind: KindArg,
        #[arg(long)]
        aliases: Option<PathBuf>,
        name: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Team,
    Position,
}

impl From<KindArg> for NameKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Team => NameKind::Team,
            KindArg::Position => NameKind::Position,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        data_dir: None,
        aliases: None,
    }) {
        Commands::Sync { data_dir, aliases } => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if aliases.is_some() {
                config.aliases_path = aliases;
            }
            let pipeline = plhub_sync::connect_pipeline(config).await?;

            let control = pipeline.control();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight writes and stopping");
                    control.cancel();
                }
            });

            let summary = pipeline.run_once().await?;
            println!("{}", summary.one_line());
        }
        Commands::InitDb => {
            let store = PgEntityStore::connect(&config.store_config())
                .await
                .context("connecting to the entity store")?;
            store
                .ensure_schema()
                .await
                .context("applying bootstrap schema")?;
            info!("schema ready");
            println!("schema ready");
        }
        Commands::ResolveName {
            kind,
            aliases,
            name,
        } => {
            if aliases.is_some() {
                config.aliases_path = aliases;
            }
            let canonicalizer = Canonicalizer::new(Arc::new(load_aliases(&config)?));
            let threshold = config.team_threshold;
            match canonicalizer.canonicalize(kind.into(), &name, threshold) {
                Canonical::Resolved { name: canonical, score, via } => {
                    println!("{name:?} -> {canonical:?} (via {via:?}, score {score})");
                }
                Canonical::Unresolved { raw, best } => match best {
                    Some((candidate, score)) => println!(
                        "{raw:?} unresolved; closest {candidate:?} scored {score} (threshold {threshold})"
                    ),
                    None => println!("{raw:?} unresolved; no candidates"),
                },
            }
        }
    }

    Ok(())
}
