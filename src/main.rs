use anyhow::{anyhow, bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use inventory_sync::config::{self, Config};
use inventory_sync::connectivity::{self, ConnectivityMonitor};
use inventory_sync::db;
use inventory_sync::model::{Mutation, ProductFields, ReplayOutcome};
use inventory_sync::remote::{HttpInventoryClient, InventoryApi};
use inventory_sync::worker::{self, Trigger};
use inventory_sync::SyncQueue;

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline-first product sync for the inventory service")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print an example config file
    ExampleConfig,
    /// Probe the service and replay the queue in the background until Ctrl-C
    Run,
    /// Run one replay pass now and exit
    Flush,
    /// Show counts of queued and poisoned changes
    Status,
    /// List queued changes in replay order
    Pending,
    /// List cached products
    Products,
    /// Queue a new product
    Add(FieldArgs),
    /// Queue changes to a product; unset fields keep their cached values
    Update {
        id: String,
        #[command(flatten)]
        fields: PartialFieldArgs,
    },
    /// Queue deletion of a product
    Delete { id: String },
    /// Drop a poisoned change
    Discard { entry_id: Uuid },
    /// Give a poisoned change a fresh retry budget
    Requeue { entry_id: Uuid },
}

#[derive(Debug, ClapArgs)]
struct FieldArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    price: f64,
    #[arg(long)]
    quantity: i64,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "")]
    sku: String,
    #[arg(long, default_value = "")]
    category: String,
    #[arg(long)]
    image_url: Option<String>,
}

#[derive(Debug, ClapArgs)]
struct PartialFieldArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    price: Option<f64>,
    #[arg(long)]
    quantity: Option<i64>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    sku: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    image_url: Option<String>,
}

impl From<FieldArgs> for ProductFields {
    fn from(a: FieldArgs) -> Self {
        ProductFields {
            name: a.name,
            description: a.description,
            price: a.price,
            quantity: a.quantity,
            sku: a.sku,
            category: a.category,
            image_url: a.image_url,
        }
    }
}

impl PartialFieldArgs {
    fn merge_into(self, base: Option<ProductFields>) -> Result<ProductFields> {
        let base = match base {
            Some(base) => base,
            None => ProductFields {
                name: self
                    .name
                    .clone()
                    .ok_or_else(|| anyhow!("--name is required for an uncached product"))?,
                description: String::new(),
                price: self
                    .price
                    .ok_or_else(|| anyhow!("--price is required for an uncached product"))?,
                quantity: self
                    .quantity
                    .ok_or_else(|| anyhow!("--quantity is required for an uncached product"))?,
                sku: String::new(),
                category: String::new(),
                image_url: None,
            },
        };
        Ok(ProductFields {
            name: self.name.unwrap_or(base.name),
            description: self.description.unwrap_or(base.description),
            price: self.price.unwrap_or(base.price),
            quantity: self.quantity.unwrap_or(base.quantity),
            sku: self.sku.unwrap_or(base.sku),
            category: self.category.unwrap_or(base.category),
            image_url: self.image_url.or(base.image_url),
        })
    }
}

fn validate_fields(fields: &ProductFields) -> Result<()> {
    if fields.name.trim().is_empty() {
        bail!("product name must be non-empty");
    }
    if !fields.price.is_finite() || fields.price < 0.0 {
        bail!("price must be a non-negative number");
    }
    if fields.quantity < 0 {
        bail!("quantity must be non-negative");
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let client = Arc::new(HttpInventoryClient::from_config(&cfg)?);
    let monitor = Arc::new(ConnectivityMonitor::new(false));
    let queue = Arc::new(
        SyncQueue::new(
            pool,
            client.clone() as Arc<dyn InventoryApi>,
            monitor.subscribe(),
        )
        .with_max_retries(cfg.app.max_retries),
    );

    match args.command {
        Command::ExampleConfig => {}
        Command::Run => run_daemon(&cfg, queue, monitor, client).await?,
        Command::Flush => {
            connectivity::probe_once(&*monitor, &*client).await;
            match worker::run_pass(&queue, Trigger::Manual).await {
                Some(ReplayOutcome::Completed(report)) => print_json(&report)?,
                Some(ReplayOutcome::Offline) => println!("offline; nothing replayed"),
                Some(ReplayOutcome::AlreadyRunning) => println!("a replay is already running"),
                None => bail!("replay failed; see log"),
            }
        }
        Command::Status => print_json(&queue.status().await?)?,
        Command::Pending => {
            let entries: Vec<_> = queue.pending().try_collect().await?;
            print_json(&entries)?;
        }
        Command::Products => print_json(&queue.products().await?)?,
        Command::Add(fields) => {
            let fields = ProductFields::from(fields);
            validate_fields(&fields)?;
            let entry = queue.enqueue(Mutation::Create { id: None, fields }).await?;
            print_json(&entry)?;
        }
        Command::Update { id, fields } => {
            let cached = queue.product(&id).await?.map(|p| p.fields);
            let fields = fields.merge_into(cached)?;
            validate_fields(&fields)?;
            let entry = queue.enqueue(Mutation::Update { id, fields }).await?;
            print_json(&entry)?;
        }
        Command::Delete { id } => {
            let entry = queue.enqueue(Mutation::Delete { id }).await?;
            print_json(&entry)?;
        }
        Command::Discard { entry_id } => {
            if !queue.discard(entry_id).await? {
                bail!("entry {} is not a poisoned entry", entry_id);
            }
            println!("discarded {}", entry_id);
        }
        Command::Requeue { entry_id } => {
            if !queue.requeue(entry_id).await? {
                bail!("entry {} is not a poisoned entry", entry_id);
            }
            println!("requeued {}", entry_id);
        }
    }

    Ok(())
}

async fn run_daemon(
    cfg: &Config,
    queue: Arc<SyncQueue>,
    monitor: Arc<ConnectivityMonitor>,
    client: Arc<HttpInventoryClient>,
) -> Result<()> {
    let probe_every = Duration::from_millis(cfg.connectivity.probe_interval_ms);
    let replay_every = Duration::from_millis(cfg.app.replay_interval_ms);
    let conn = monitor.subscribe();

    // Probe task owns the monitor; the worker follows its transitions.
    let probe = tokio::spawn(async move {
        connectivity::probe_loop(&*monitor, &*client, probe_every).await;
    });
    let worker_queue = queue.clone();
    let replay = tokio::spawn(async move {
        worker::run(&worker_queue, conn, replay_every).await;
    });

    info!("inventory sync running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    probe.abort();
    replay.abort();
    Ok(())
}
