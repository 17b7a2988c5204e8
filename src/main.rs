use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use labsync::db::models::Provider;

#[derive(Debug, Parser)]
#[command(name = "labsync", version, about = "Medical record ingestion from mailboxes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the OAuth callback and job status HTTP server
    Serve(ServeArgs),
    /// Sync one mailbox now using its stored token
    Sync(SyncArgs),
    /// Show the status rows of a sync job
    Status { job_id: String },
    /// List records owned by a user
    Records {
        #[arg(long)]
        user: String,
    },
    /// Manage the labs used to filter mailbox searches
    Labs {
        #[command(subcommand)]
        command: LabCommands,
    },
    /// Print the provider consent URL for a user
    AuthUrl(SyncArgs),
    /// Show record and job counts
    Stats,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Overrides LABSYNC_LISTEN_ADDR
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    provider: Provider,
}

#[derive(Debug, Subcommand)]
enum LabCommands {
    /// Add a lab for a user
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// List a user's labs
    List {
        #[arg(long)]
        user: String,
    },
    /// Remove a lab by id
    Remove {
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{anyhow, bail, Context, Result};

    use labsync::config::AppConfig;
    use labsync::connectors::ProviderRegistry;
    use labsync::db::{self, Database, SharedDatabase};
    use labsync::labs::SqliteLabDirectory;
    use labsync::linking::SqliteRecordLinker;
    use labsync::output::{self, OutputFormat, SyncReport};
    use labsync::records::RecordPersister;
    use labsync::server::{self, AppState};
    use labsync::status::StatusTracker;
    use labsync::sync::{SyncCredential, SyncOrchestrator, SyncRequest};
    use labsync::tokens::SqliteTokenStore;

    use super::{Cli, Commands, LabCommands, ServeArgs, SyncArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        match cli.command {
            Commands::Serve(args) => handle_serve(args).await,
            Commands::Sync(args) => handle_sync(args, format).await,
            Commands::Status { job_id } => handle_status(&job_id, format),
            Commands::Records { user } => handle_records(&user, format),
            Commands::Labs { command } => handle_labs(command, format),
            Commands::AuthUrl(args) => handle_auth_url(args),
            Commands::Stats => handle_stats(format),
        }
    }

    fn load_config() -> Result<AppConfig> {
        AppConfig::from_env().context("load labsync configuration")
    }

    fn open_database(config: &AppConfig) -> Result<SharedDatabase> {
        let db = Database::open(&config.db_path)
            .with_context(|| format!("open labsync database at {}", config.db_path.display()))?;
        Ok(db::shared(db))
    }

    fn build_orchestrator(config: &AppConfig, db: &SharedDatabase) -> Result<SyncOrchestrator> {
        let registry = ProviderRegistry::from_config(config).context("build provider registry")?;
        if registry.all().is_empty() {
            eprintln!("warning: no mailbox providers configured (set LABSYNC_<PROVIDER>_CLIENT_ID and friends)");
        }

        Ok(SyncOrchestrator::new(
            Arc::new(registry),
            Arc::new(SqliteTokenStore::new(db.clone(), config.token_cipher.clone())),
            Arc::new(SqliteLabDirectory::new(db.clone())),
            Arc::new(SqliteRecordLinker::new(db.clone())),
            Arc::new(RecordPersister::new(db.clone(), config.record_dir.clone())),
            StatusTracker::new(db.clone()),
        ))
    }

    async fn handle_serve(args: ServeArgs) -> Result<()> {
        let config = load_config()?;
        let db = open_database(&config)?;
        let orchestrator = build_orchestrator(&config, &db)?;

        let state = AppState {
            orchestrator,
            post_sync_redirect: config.post_sync_redirect.clone(),
        };
        server::serve(args.listen.unwrap_or(config.listen_addr), state).await
    }

    async fn handle_sync(args: SyncArgs, format: OutputFormat) -> Result<()> {
        let config = load_config()?;
        let db = open_database(&config)?;
        let orchestrator = build_orchestrator(&config, &db)?;

        let outcome = orchestrator
            .run(SyncRequest {
                user_id: args.user.clone(),
                provider: args.provider,
                credential: SyncCredential::Stored,
            })
            .await
            .with_context(|| format!("start {} sync for user {}", args.provider, args.user))?;

        let report = SyncReport::from(&outcome);
        println!("{}", output::format_sync_report(format, &report)?);
        if let Some(error) = outcome.fatal {
            bail!("sync job {} aborted: {error}", outcome.job_id);
        }
        Ok(())
    }

    fn handle_status(job_id: &str, format: OutputFormat) -> Result<()> {
        let config = load_config()?;
        let db = open_database(&config)?;
        let rows = StatusTracker::new(db).job_rows(job_id)?;
        if rows.is_empty() {
            return Err(anyhow!("no status rows for job '{job_id}'"));
        }
        println!("{}", output::format_status_rows(format, &rows)?);
        Ok(())
    }

    fn handle_records(user_id: &str, format: OutputFormat) -> Result<()> {
        let config = load_config()?;
        let db = open_database(&config)?;
        let records = db::lock(&db)?.records_for_user(user_id)?;
        println!("{}", output::format_records(format, &records)?);
        Ok(())
    }

    fn handle_labs(command: LabCommands, format: OutputFormat) -> Result<()> {
        let config = load_config()?;
        let db = open_database(&config)?;
        let directory = SqliteLabDirectory::new(db.clone());

        match command {
            LabCommands::Add { user, name, email } => {
                let lab = directory
                    .add_lab(&user, &name, email.as_deref())
                    .with_context(|| format!("add lab '{name}' for user {user}"))?;
                println!("{}", output::format_labs(format, std::slice::from_ref(&lab))?);
            }
            LabCommands::List { user } => {
                let labs = db::lock(&db)?.labs_for_user(&user)?;
                println!("{}", output::format_labs(format, &labs)?);
            }
            LabCommands::Remove { id } => {
                if !directory.remove_lab(id)? {
                    bail!("lab not found for id {id}");
                }
                println!("Removed lab {id}");
            }
        }
        Ok(())
    }

    fn handle_auth_url(args: SyncArgs) -> Result<()> {
        let config = load_config()?;
        let registry = ProviderRegistry::from_config(&config).context("build provider registry")?;
        let entry = registry
            .get(args.provider)
            .ok_or_else(|| anyhow!("provider {} is not configured", args.provider))?;
        println!("{}", entry.broker.authorization_url(&args.user));
        Ok(())
    }

    fn handle_stats(format: OutputFormat) -> Result<()> {
        let config = load_config()?;
        let db = open_database(&config)?;
        let stats = db::lock(&db)?.get_stats()?;
        println!("{}", output::format_stats(format, &stats)?);
        Ok(())
    }
}
