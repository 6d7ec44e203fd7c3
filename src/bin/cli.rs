//! Operator CLI for the pub/sub broker
//!
//! Creates the listener registry, inspects and sweeps it, publishes one-off
//! messages and tails channels.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pg_pubsub::{logging, PubSub, PubSubConfig};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pg-pubsub-cli")]
#[command(about = "Manage and exercise a PostgreSQL pub/sub broker")]
#[command(version)]
struct Cli {
    /// Database connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Configuration file path (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the registry schema and table
    Migrate,
    /// Show live listeners of the configured class
    Status(StatusArgs),
    /// Delete registry rows left behind by dead listeners
    Sweep,
    /// Publish a JSON array to a channel
    Publish(PublishArgs),
    /// Print messages arriving on one or more channels
    Listen(ListenArgs),
}

#[derive(Args)]
struct StatusArgs {
    /// List every registry row with its liveness
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct PublishArgs {
    /// Logical channel name
    channel: String,

    /// Positional data as a JSON array, e.g. '["order-42", {"total": 10}]'
    data: String,
}

#[derive(Args)]
struct ListenArgs {
    /// Logical channel names
    #[arg(required = true)]
    channels: Vec<String>,

    /// Exit after this many messages
    #[arg(short = 'n', long)]
    count: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();

    let config = PubSubConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let database_url = cli
        .database_url
        .context("no database url: pass --database-url or set DATABASE_URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("connecting to database")?;

    let broker = PubSub::new(pool, config)?;

    match cli.command {
        Commands::Migrate => {
            broker.migrate().await?;
            println!("Registry ready in schema \"{}\"", broker.config().schema);
        }
        Commands::Status(args) => status(&broker, args).await?,
        Commands::Sweep => {
            let removed = broker.sweep().await?;
            println!("Removed {} dead listener(s)", removed);
        }
        Commands::Publish(args) => publish(&broker, args).await?,
        Commands::Listen(args) => listen(&broker, args).await?,
    }

    Ok(())
}

async fn status(broker: &PubSub, args: StatusArgs) -> Result<()> {
    let status = broker.status().await?;
    println!(
        "{} (class {}): {} live listener(s)",
        broker.config().name,
        broker.class_id(),
        status.live_listeners
    );

    if args.verbose {
        for record in broker.listeners().await? {
            println!(
                "  #{:<6} {:<5} {}",
                record.id,
                if record.live { "live" } else { "dead" },
                record.channels.join(", ")
            );
        }
    }

    Ok(())
}

async fn publish(broker: &PubSub, args: PublishArgs) -> Result<()> {
    let data: Vec<Value> =
        serde_json::from_str(&args.data).context("data must be a JSON array")?;
    let notified = broker.publish(&args.channel, &data).await?;
    println!("Notified {} listener(s) on {}", notified, args.channel);
    Ok(())
}

async fn listen(broker: &PubSub, args: ListenArgs) -> Result<()> {
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();

    let mut subscriptions = Vec::with_capacity(args.channels.len());
    for channel in &args.channels {
        subscriptions.push(broker.subscribe(channel).await?);
    }
    eprintln!(
        "Listening on {} as listener #{}",
        args.channels.join(", "),
        broker.listener_id().unwrap_or_default()
    );

    for mut subscription in subscriptions {
        let sender = sender.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if sender.send(message).is_err() {
                    break;
                }
            }
        });
    }
    drop(sender);

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = receiver.recv() => {
                let Some(message) = message else { break };
                let message = message?;
                println!("{}", serde_json::to_string(&message)?);
                seen += 1;
                if args.count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
        }
    }

    broker.shutdown().await;
    Ok(())
}
