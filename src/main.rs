mod browser;
mod config;
mod context;
mod error;
mod export;
mod models;
mod pipeline;
mod pricing;
mod scheduler;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::browser::ChromeLauncher;
use crate::config::AppConfig;
use crate::models::{ExtractionResult, ItemFilter};
use crate::pipeline::{Pipeline, RunOutcome};
use crate::scheduler::ScheduleRunner;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "pricewatch", about = "Product price monitoring", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print outcomes as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape a product page and show what was found, without saving
    Preview {
        url: String,
        #[arg(short, long, env = "PRICEWATCH_USER", default_value = "cli")]
        user: String,
        /// Also append the extraction to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Scrape, save and schedule recurring checks for a product page
    Track {
        url: String,
        /// minutes, hourly, daily, monthly, or a number of hours
        #[arg(short, long, default_value = "daily")]
        frequency: String,
        #[arg(short, long, env = "PRICEWATCH_USER", default_value = "cli")]
        user: String,
    },

    /// Run the price check of one item now
    Run { item_id: i64 },

    /// Change how often an item is checked
    Frequency { item_id: i64, frequency: String },

    /// Stop checking an item, keeping its schedule
    Pause { item_id: i64 },

    /// Resume checking a paused item
    Resume { item_id: i64 },

    /// Delete an item and its schedule
    Delete { item_id: i64 },

    /// List monitored items
    List {
        #[arg(short, long)]
        user: Option<String>,
        /// Lowest current price to include
        #[arg(long)]
        min_price: Option<f64>,
        /// Highest current price to include
        #[arg(long)]
        max_price: Option<f64>,
        /// Only items created on or after this day (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Only items created on or before this day (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// List recurring check schedules
    Schedules,

    /// Fire due checks until interrupted
    Daemon,

    /// Show database statistics
    Stats,

    /// Apply schema migrations
    Migrate,

    /// Suggest a selling price from cost, margin and competitor prices
    Recommend {
        #[arg(long)]
        cost: f64,
        /// Target margin in percent
        #[arg(long)]
        margin: f64,
        /// Competitor prices, comma separated
        #[arg(long, value_delimiter = ',')]
        competitors: Vec<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "pricewatch=info,warn",
        1 => "pricewatch=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Preview { url, user, csv } => {
            let _t = utils::Timer::start("Preview");
            let repo = open_repo(&config)?;
            let outcome = build_pipeline(&config, &repo).preview(&user, &url).await?;

            if let Some(path) = csv {
                if let RunOutcome::Preview { result } | RunOutcome::Incomplete { result, .. } =
                    &outcome
                {
                    export::append_extraction(&path, result, Utc::now().naive_utc())?;
                }
            }
            print_outcome(&outcome, cli.json)?;
        }

        Command::Track { url, frequency, user } => {
            let _t = utils::Timer::start("Track");
            let repo = open_repo(&config)?;
            let outcome = build_pipeline(&config, &repo)
                .save_and_automate(&user, &url, &frequency)
                .await?;
            print_outcome(&outcome, cli.json)?;
        }

        Command::Run { item_id } => {
            let _t = utils::Timer::start(format!("Check of item {}", item_id));
            let repo = open_repo(&config)?;
            let outcome = build_pipeline(&config, &repo).run_scheduled(item_id).await?;
            print_outcome(&outcome, cli.json)?;
        }

        Command::Frequency { item_id, frequency } => {
            let repo = open_repo(&config)?;
            let reconciled = build_pipeline(&config, &repo)
                .update_frequency(item_id, &frequency)
                .await?;
            let entry = reconciled.entry();
            println!("{}: {}", entry.name, entry.period);
        }

        Command::Pause { item_id } => {
            let repo = open_repo(&config)?;
            build_pipeline(&config, &repo).set_active(item_id, false).await?;
            println!("Item {} paused.", item_id);
        }

        Command::Resume { item_id } => {
            let repo = open_repo(&config)?;
            build_pipeline(&config, &repo).set_active(item_id, true).await?;
            println!("Item {} resumed.", item_id);
        }

        Command::Delete { item_id } => {
            let repo = open_repo(&config)?;
            if build_pipeline(&config, &repo).delete_item(item_id).await? {
                println!("Item {} deleted.", item_id);
            } else {
                println!("No item {}.", item_id);
            }
        }

        Command::List { user, min_price, max_price, from, to } => {
            let filter = ItemFilter {
                user_identifier: user,
                min_price,
                max_price,
                created_from: from.map(|d| d.and_time(NaiveTime::MIN)),
                // inclusive of the whole last day
                created_to: to.map(|d| {
                    d.and_time(NaiveTime::MIN) + Duration::days(1) - Duration::microseconds(1)
                }),
            };
            let repo = open_repo(&config)?;
            let items = build_pipeline(&config, &repo).list(&filter).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("No items. Run `pricewatch track <url>` first.");
            } else {
                println!("{} items:", items.len());
                for item in &items {
                    println!(
                        "  #{:<4} {:<40} {:>14} (was {}) {:<8} {}{}",
                        item.id,
                        utils::ellipsize(&item.name, 40),
                        item.current_price,
                        item.previous_price
                            .as_ref()
                            .map(|p| p.display())
                            .unwrap_or("N/A"),
                        item.frequency.to_string(),
                        item.url,
                        if item.is_active { "" } else { " [paused]" },
                    );
                }
            }
        }

        Command::Schedules => {
            let entries = open_repo(&config)?.list_schedules()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No schedules.");
            } else {
                for e in &entries {
                    println!(
                        "  {:<20} {:<22} next {}  last {}",
                        e.name,
                        e.period.to_string(),
                        e.next_run().map(|t| t.to_string()).unwrap_or("—".into()),
                        e.last_run_at.map(|t| t.to_string()).unwrap_or("—".into()),
                    );
                }
            }
        }

        Command::Daemon => {
            let repo = open_repo(&config)?;
            let runner =
                ScheduleRunner::new(build_pipeline(&config, &repo), repo.clone(), &config.scheduler);
            runner
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Could not listen for ctrl-c: {}", e);
                    }
                })
                .await?;
            info!("Daemon stopped.");
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let stats = build_pipeline(&config, &repo).stats().await?;
            println!("─────────────────────────────────");
            println!("  pricewatch — Database Stats");
            println!("─────────────────────────────────");
            println!("  Items     : {}", utils::fmt_number(stats.items));
            println!("  Active    : {}", utils::fmt_number(stats.active_items));
            println!("  Schedules : {}", utils::fmt_number(stats.schedules));
            println!("  Runs      : {}", utils::fmt_number(stats.runs));
            println!("  Failed    : {}", utils::fmt_number(stats.failed_runs));
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }

        Command::Recommend { cost, margin, competitors } => {
            let rec = pricing::recommend_price(cost, margin, &competitors);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&rec)?);
            } else {
                println!("{:.2}  ({})", rec.price, rec.reason);
            }
        }
    }

    Ok(())
}

fn open_repo(config: &AppConfig) -> Result<Arc<Repository>> {
    let repo = Repository::open(&config.storage.db_path).context("Failed to open DuckDB")?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(Arc::new(repo))
}

fn build_pipeline(config: &AppConfig, repo: &Arc<Repository>) -> Pipeline {
    Pipeline::new(
        config,
        Arc::new(ChromeLauncher::new(&config.browser)),
        repo.clone(),
        repo.clone(),
    )
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    match outcome {
        RunOutcome::Preview { result } => print_result(result),
        RunOutcome::Incomplete { result, missing } => {
            print_result(result);
            println!("Incomplete: missing {}. Nothing was saved.", missing.join(", "));
        }
        RunOutcome::Saved { item, schedule } => {
            println!("Saved item #{} ({}) at {}", item.id, item.name, item.current_price);
            println!("Scheduled {} ({})", schedule.name, schedule.period);
        }
        RunOutcome::SavedWithoutSchedule { item, error } => {
            println!("Saved item #{} ({}) at {}", item.id, item.name, item.current_price);
            println!("Could not schedule checks: {}", error);
        }
        RunOutcome::Updated { item } => {
            println!(
                "Item #{} now {} (was {})",
                item.id,
                item.current_price,
                item.previous_price
                    .as_ref()
                    .map(|p| p.display())
                    .unwrap_or("N/A")
            );
        }
        RunOutcome::TargetGone { item_id, schedule_removed } => {
            println!(
                "Item #{} no longer exists{}",
                item_id,
                if *schedule_removed { "; its schedule was removed" } else { "" }
            );
        }
        RunOutcome::Skipped { item_id } => println!("Item #{} is paused; skipped.", item_id),
    }
    Ok(())
}

fn print_result(result: &ExtractionResult) {
    println!("  URL            : {}", result.url);
    println!("  Name           : {}", result.name);
    println!("  Current price  : {}", result.price);
    println!("  Previous price : {}", result.previous_price);
    println!("  Discount       : {}", result.discount);
    println!("  Description    : {}", result.description);
}
