use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use kvstore::{HealthProbe, KvService, RawListParams, ServiceConfig, WriteKind};
use serde::Serialize;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "kvstore")]
#[command(about = "Admin tool for the self-provisioning JSON key-value store")]
struct Cli {
    /// Container (instance) id
    #[arg(long, global = true, env = "KV_CONTAINER")]
    container: Option<String>,

    /// Database id inside the container
    #[arg(long, global = true, env = "KV_DATABASE")]
    database: Option<String>,

    /// Record table name
    #[arg(long, global = true, env = "KV_TABLE")]
    table: Option<String>,

    /// `memory://`, `file://<path>` or `spanner://<project>[?emulator=<host:port>]`
    #[arg(long, global = true, env = "KV_CONNECTION")]
    connection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create whatever of container, database and table is missing
    Provision,
    /// Store a JSON document under a key
    Put { key: String, json: String },
    /// Print the record stored under a key
    Get { key: String },
    /// List records
    List {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        limit: Option<String>,
        #[arg(long)]
        offset: Option<String>,
    },
    /// Round-trip the backing store
    Health,
}

impl Cli {
    fn config(&self) -> Result<ServiceConfig> {
        let flag = |name: &str| -> Option<String> {
            match name {
                "KV_CONTAINER" => self.container.clone(),
                "KV_DATABASE" => self.database.clone(),
                "KV_TABLE" => self.table.clone(),
                "KV_CONNECTION" => self.connection.clone(),
                other => std::env::var(other).ok(),
            }
        };
        let config = ServiceConfig::from_lookup(flag).map_err(|e| anyhow!(e))?;
        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvstore=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render output")?
    );
    Ok(())
}

async fn start(config: ServiceConfig) -> Result<KvService> {
    KvService::start(config)
        .await
        .context("Provisioning failed")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.config()?;

    match cli.command {
        Command::Health => {
            let backend = config
                .connect_backend()
                .await
                .context("Failed to open backing store")?;
            let status = HealthProbe::from_config(backend, &config).check().await;
            print_json(&status)?;
            if !status.is_healthy() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Provision => {
            let service = start(config).await?;
            print_json(&service.provision_report())?;
        }
        Command::Put { key, json } => {
            let service = start(config).await?;
            let receipt = service
                .put(&key, &json)
                .await
                .with_context(|| format!("Failed to store '{}'", key))?;
            print_json(&serde_json::json!({
                "key": key,
                "created": receipt.kind == WriteKind::Inserted,
                "commit_timestamp": receipt.commit_timestamp.to_rfc3339(),
            }))?;
        }
        Command::Get { key } => {
            let service = start(config).await?;
            let record = service
                .get(&key)
                .await
                .with_context(|| format!("Failed to read '{}'", key))?;
            match record {
                Some(record) => print_json(&record)?,
                None => {
                    eprintln!("No record stored under '{}'", key);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::List {
            prefix,
            sort,
            limit,
            offset,
        } => {
            let service = start(config).await?;
            let raw = RawListParams {
                limit,
                offset,
                prefix,
                sort,
            };
            let page = service.list(&raw).await.context("Failed to list records")?;
            print_json(&page)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
