use anyhow::{bail, Context, Result};
use atsync_core::DEFAULT_TABLE_NAME;
use atsync_storage::PgCandidateSink;
use atsync_sync::{BridgeConfig, BridgeRuntime, SyncScope, DEFAULT_PAGE_SIZE};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "atsync")]
#[command(about = "Sync Merge ATS candidates into a relational store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Fetch, normalize and upsert candidates for one account.
    Sync {
        #[command(flatten)]
        account: AccountArgs,
        #[arg(long, default_value = DEFAULT_TABLE_NAME)]
        table: String,
        /// Follow offset pagination until a short page instead of one page.
        #[arg(long)]
        all_pages: bool,
    },
    /// Print the first normalized rows without persisting anything.
    Preview {
        #[command(flatten)]
        account: AccountArgs,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Print one raw page of candidates.
    Fetch {
        #[command(flatten)]
        account: AccountArgs,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Create the candidate table in the DATABASE_URL database.
    Migrate {
        #[arg(long, default_value = DEFAULT_TABLE_NAME)]
        table: String,
    },
}

#[derive(Debug, Args)]
struct AccountArgs {
    #[arg(long, env = "MERGE_ACCOUNT_TOKEN", hide_env_values = true)]
    account_token: String,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

fn init_tracing(config: &BridgeConfig) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("atsync={0},atsync_sync={0},atsync_adapters={0},atsync_storage={0},atsync_web={0}", config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BridgeConfig::from_env()?;
    init_tracing(&config);
    info!("starting atsync v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = BridgeRuntime::from_config(config).await?;
            atsync_web::serve(runtime).await?;
        }
        Commands::Sync {
            account,
            table,
            all_pages,
        } => {
            let runtime = BridgeRuntime::from_config(config).await?;
            let scope = if all_pages {
                SyncScope::AllPages
            } else {
                SyncScope::FirstPage
            };
            let result = runtime
                .pipeline
                .sync_scoped(&account.account_token, &table, scope)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!("sync failed: {}", result.message);
            }
        }
        Commands::Preview { account, page } => {
            let runtime = BridgeRuntime::from_config(config).await?;
            let preview = runtime
                .pipeline
                .preview(&account.account_token, page.limit, page.offset)
                .await?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        Commands::Fetch { account, page } => {
            let runtime = BridgeRuntime::from_config(config).await?;
            let candidates = runtime
                .pipeline
                .fetch(&account.account_token, page.limit, page.offset)
                .await?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }
        Commands::Migrate { table } => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let sink = PgCandidateSink::connect(database_url).await?;
            sink.ensure_table(&table).await?;
            println!("table {table} ready");
        }
    }

    Ok(())
}
