use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dealfeed_core::parse_notify_time;
use dealfeed_jobs::{JobsConfig, SourceRegistry};
use dealfeed_storage::DiscountStore;

#[derive(Debug, Parser)]
#[command(name = "dealfeed")]
#[command(about = "Discount ingestion and notification pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Scrape every enabled source once and refresh the catalog.
    Ingest,
    /// Run one notification pass for subscriptions due at a minute.
    Tick {
        /// Minute to deliver for, as HH:MM; defaults to the current minute.
        #[arg(long)]
        at: Option<String>,
    },
    /// Nightly ingestion plus the minutely notification tick, until ctrl-c.
    Run,
    /// Scrape one source right now and print offers at or above a threshold.
    Discounts {
        source: String,
        #[arg(long, default_value_t = 0)]
        threshold: i32,
    },
    /// Catalog entries a user has not been notified about yet.
    Unseen { user: i64, source: String },
    /// Create or replace a daily subscription.
    Subscribe {
        user: i64,
        source: String,
        #[arg(long, default_value_t = 0)]
        threshold: i32,
        /// Daily notify time, as HH:MM.
        #[arg(long, default_value = "09:00")]
        time: String,
    },
    /// Remove a subscription.
    Unsubscribe { user: i64, source: String },
    /// List a user's subscriptions.
    Subscriptions { user: i64 },
    /// User, subscription, and delivery counts.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            let config = JobsConfig::from_env();
            dealfeed_jobs::migrate_from_env(&config).await?;
            println!("database schema is up to date");
        }
        Commands::Ingest => {
            let summary = dealfeed_jobs::run_ingest_once_from_env().await?;
            let upserted: usize = summary.sources.iter().map(|r| r.upserted).sum();
            println!(
                "ingest complete: run_id={} sources={} upserted={}",
                summary.run_id,
                summary.sources.len(),
                upserted
            );
            for record in &summary.sources {
                let status = if record.failed { "failed" } else { "ok" };
                println!(
                    "  {}: {} offers, {} upserted ({status})",
                    record.source_name, record.offers, record.upserted
                );
            }
        }
        Commands::Tick { at } => {
            let minute = match at {
                Some(raw) => Some(
                    parse_notify_time(&raw)
                        .with_context(|| format!("invalid --at value {raw:?}, expected HH:MM"))?,
                ),
                None => None,
            };
            let summary = dealfeed_jobs::run_tick_once_from_env(minute).await?;
            println!(
                "tick complete: minute={} due={} delivered={} empty={} failed={}",
                summary.minute, summary.due, summary.delivered, summary.empty, summary.failed
            );
        }
        Commands::Run => {
            dealfeed_jobs::run_scheduler_from_env().await?;
        }
        Commands::Discounts { source, threshold } => {
            let config = JobsConfig::from_env();
            let registry = SourceRegistry::load(&config.sources_path).await?;
            let fetcher = dealfeed_jobs::fetcher_from_config(&config)?;
            let offers =
                dealfeed_jobs::get_discounts(&fetcher, &registry, &source, threshold).await?;
            for offer in &offers {
                let old_price = offer.old_price.as_deref().unwrap_or("-");
                let discount = offer.discount.as_deref().unwrap_or("-");
                println!("{} | {} | was {old_price} | {discount}", offer.name, offer.price);
            }
        }
        Commands::Unseen { user, source } => {
            let config = JobsConfig::from_env();
            let store = dealfeed_jobs::store_from_env(&config).await?;
            let entries = dealfeed_jobs::get_unseen(&store, user, &source).await?;
            if entries.is_empty() {
                println!("nothing unseen for user {user} in {source}");
            }
            for entry in &entries {
                let old_price = entry.old_price.as_deref().unwrap_or("-");
                println!(
                    "#{} {} | {} | was {old_price} | {}%",
                    entry.id, entry.product_name, entry.price, entry.discount_percent
                );
            }
        }
        Commands::Subscribe {
            user,
            source,
            threshold,
            time,
        } => {
            let notify_time = parse_notify_time(&time)
                .with_context(|| format!("invalid --time value {time:?}, expected HH:MM"))?;
            let config = JobsConfig::from_env();
            let store = dealfeed_jobs::store_from_env(&config).await?;
            store
                .upsert_subscription(user, &source, threshold, notify_time)
                .await?;
            println!("user {user} subscribed to {source} at >= {threshold}%, daily at {notify_time}");
        }
        Commands::Unsubscribe { user, source } => {
            let config = JobsConfig::from_env();
            let store = dealfeed_jobs::store_from_env(&config).await?;
            if store.remove_subscription(user, &source).await? {
                println!("user {user} unsubscribed from {source}");
            } else {
                println!("user {user} had no subscription to {source}");
            }
        }
        Commands::Subscriptions { user } => {
            let config = JobsConfig::from_env();
            let store = dealfeed_jobs::store_from_env(&config).await?;
            let subs = store.subscriptions_for(user).await?;
            if subs.is_empty() {
                println!("user {user} has no subscriptions");
            }
            for sub in &subs {
                println!(
                    "{} | >= {}% | daily at {}",
                    sub.source_name, sub.threshold, sub.notify_time
                );
            }
        }
        Commands::Stats => {
            let config = JobsConfig::from_env();
            let store = dealfeed_jobs::store_from_env(&config).await?;
            let stats = store.stats().await?;
            println!(
                "users={} subscriptions={} deliveries={}",
                stats.users, stats.subscriptions, stats.deliveries
            );
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
