//! # Context Relay CLI (`relay`)
//!
//! The `relay` binary indexes a source tree, assembles budgeted context
//! packages from it, and delegates tasks to configured LLM backends.
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay index` | Build or refresh the cached index |
//! | `relay status` | Show cache state and freshness |
//! | `relay search "<query>"` | Keyword search over the index |
//! | `relay context` | Assemble a context package for a scenario |
//! | `relay delegate "<task>"` | Send one task to the best-fitting model |
//! | `relay batch <tasks.toml>` | Run a file of tasks through the queue |
//! | `relay models` | List configured models and backends |
//! | `relay log stats` | Summarise the delegation log |
//!
//! ## Examples
//!
//! ```bash
//! # Package context about the cache for the "focused" scenario
//! relay context --query cache --scenario focused
//!
//! # See which model would take a task, without calling it
//! relay delegate "explain the retry policy" --query retry --dry-run
//!
//! # Run a batch, four tasks at a time
//! relay batch tasks.toml --concurrency 4
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use context_relay::cache::CacheStatus;
use context_relay::config;
use context_relay::engine::{ContextQuery, Engine};
use context_relay::fingerprint::compute_fingerprint;
use context_relay::progress::ProgressMode;
use context_relay::queue::{load_batch_file, QueueReport, TaskStatus};
use context_relay::router::RoutePlan;
use context_relay::stats;
use context_relay_core::routing::cheapest_first;

/// Context Relay CLI: budgeted source context and multi-model delegation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/relay.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "relay",
    about = "Context Relay: budgeted source context and multi-model task delegation",
    version,
    long_about = "Context Relay indexes a source tree into a cached structural summary, \
    assembles token-budgeted context packages from it for named scenarios, and routes \
    tasks to the best-fitting configured model with retries, fallback and chunking."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index, or reuse the cached one if the tree is unchanged.
    Index {
        /// Re-index even when the fingerprint matches.
        #[arg(long)]
        force: bool,
    },

    /// Show the cached record and whether it matches the tree.
    Status,

    /// Keyword search over the index.
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Assemble a context package and print it.
    ///
    /// The package text goes to stdout; a budget summary and optimisation
    /// hints go to stderr.
    Context {
        #[arg(long)]
        scenario: Option<String>,

        #[arg(long)]
        query: Option<String>,

        /// Path of the file being worked on, as it appears in the index.
        #[arg(long)]
        active_file: Option<String>,

        /// Print the whole package as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delegate a single task.
    Delegate {
        /// Task description sent ahead of the context.
        task: String,

        #[arg(long)]
        scenario: Option<String>,

        #[arg(long)]
        query: Option<String>,

        #[arg(long)]
        active_file: Option<String>,

        /// Restrict candidates to these models, in this order. Repeatable.
        #[arg(long = "model")]
        models: Vec<String>,

        /// Domain tags matched against model strengths. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Show the routing plan without calling any model.
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },

    /// Run a TOML file of `[[tasks]]` through the batch queue.
    Batch {
        file: PathBuf,

        #[arg(long)]
        dry_run: bool,

        /// Maximum in-flight tasks (defaults to `queue.concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Progress on stderr: `auto`, `human`, `json` or `off`.
        #[arg(long, default_value = "auto")]
        progress: String,

        #[arg(long)]
        json: bool,
    },

    /// List configured models, cheapest first.
    Models,

    /// Inspect the delegation log.
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
}

#[derive(Subcommand)]
enum LogAction {
    /// Per-model attempts, success rate, latency and token cost.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "context_relay=info".into()))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    // Needs no engine: only reads the log file.
    if let Commands::Log {
        action: LogAction::Stats { json },
    } = &cli.command
    {
        return stats::run_log_stats(&cfg, *json);
    }

    let engine = Engine::new(cfg)?;

    match cli.command {
        Commands::Index { force } => {
            if force {
                engine.cache().invalidate();
            }
            let lookup = engine.cache().get_or_build().await?;
            println!(
                "{}: {} modules, fingerprint {}",
                status_label(&lookup.status),
                lookup.document().modules.len(),
                short(lookup.fingerprint())
            );
            if let CacheStatus::StaleButAvailable { reason } = &lookup.status {
                eprintln!("warning: indexer failed, serving previous index: {}", reason);
            }
        }
        Commands::Status => {
            let report = engine.cache().status();
            let current = compute_fingerprint(&engine.config().cache)?;
            println!("Cache:        {}", report.path.display());
            println!("Source root:  {}", report.source_root.display());
            println!("Persisted:    {:?}", report.persisted);
            match &report.fingerprint {
                Some(fp) => {
                    let fresh = *fp == current.digest && !report.invalidated;
                    println!("Fingerprint:  {} ({})", short(fp), if fresh { "fresh" } else { "stale" });
                    if let Some(at) = report.generated_at {
                        println!("Generated:    {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                    println!("Modules:      {}", report.module_count);
                }
                None => println!("Fingerprint:  none (run `relay index`)"),
            }
            println!("Tree files:   {}", current.file_count);
        }
        Commands::Search { query, limit, json } => {
            let lookup = engine.cache().get_or_build().await?;
            let hits = lookup.search(&query, limit, engine.estimator());
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No modules match \"{}\".", query);
            } else {
                for hit in &hits {
                    println!(
                        "{:>4}  {}  ({} lines, ~{} tokens)",
                        hit.score, hit.path, hit.line_count, hit.fragment.tokens
                    );
                }
            }
        }
        Commands::Context {
            scenario,
            query,
            active_file,
            json,
        } => {
            let outcome = engine
                .context(&ContextQuery {
                    scenario,
                    query,
                    active_file,
                })
                .await?;
            let package = &outcome.package;
            if json {
                println!("{}", serde_json::to_string_pretty(package)?);
            } else {
                println!("{}", package.render());
            }
            eprintln!(
                "{}: {} fragments, {} / {} tokens, {} rejected ({} tokens)",
                package.scenario,
                package.fragments.len(),
                package.total_tokens_used,
                package.budget_tokens,
                package.rejected.len(),
                package.rejected_tokens()
            );
            for hint in package.suggestions() {
                eprintln!("hint: {}", hint);
            }
        }
        Commands::Delegate {
            task,
            scenario,
            query,
            active_file,
            models,
            tags,
            dry_run,
            json,
        } => {
            let query = ContextQuery {
                scenario,
                query,
                active_file,
            };
            let task = engine.prepare_task(&task, &query, &models, tags).await?;
            let queue = Arc::new(engine.queue());
            let id = queue.enqueue(task);

            if dry_run {
                let report = queue.process(true, 1).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else if let Some(entry) = report.tasks.first() {
                    print_plan(&entry.plan);
                }
                return Ok(());
            }

            cancel_on_ctrl_c(queue.clone());
            queue.process(false, 1).await?;
            let Some(done) = queue.get(&id) else {
                bail!("task {} vanished from the queue", id);
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&done)?);
            } else if let Some(result) = &done.result {
                println!("{}", result.merged_output);
                eprintln!(
                    "{}: {} chunk(s), {} tokens, {} ms",
                    result.model_used, result.chunks_executed, result.token_cost, result.wall_time_ms
                );
            }
            if let Some(err) = &done.error {
                bail!("{}", err.message);
            }
            if done.status != TaskStatus::Succeeded {
                bail!("task {} ended {} without a result", id, done.status.as_str());
            }
        }
        Commands::Batch {
            file,
            dry_run,
            concurrency,
            progress,
            json,
        } => {
            let Some(mode) = ProgressMode::parse(&progress) else {
                bail!("--progress must be one of auto, human, json, off");
            };
            let batch = load_batch_file(&file)?;
            let queue = Arc::new(
                engine
                    .queue()
                    .with_progress(Arc::from(mode.reporter())),
            );
            let ids = engine.enqueue_batch(&queue, &batch).await?;
            tracing::info!(tasks = ids.len(), dry_run, "batch enqueued");

            if !dry_run {
                cancel_on_ctrl_c(queue.clone());
            }
            let concurrency = concurrency.unwrap_or(engine.config().queue.concurrency);
            let report = queue.process(dry_run, concurrency).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            let failed = report
                .tasks
                .iter()
                .filter(|t| !report.dry_run && t.status != TaskStatus::Succeeded)
                .count();
            if failed > 0 {
                bail!("{} of {} task(s) did not succeed", failed, report.tasks.len());
            }
        }
        Commands::Models => {
            let mut models = engine.models().snapshot().as_ref().clone();
            models.sort_by(cheapest_first);
            if models.is_empty() {
                println!("No models configured.");
            } else {
                println!(
                    "{:<20} {:<10} {:>10} {:<8} {:>9} {:<8}  {}",
                    "NAME", "PROVIDER", "WINDOW", "COST", "LATENCY", "CHUNKS", "STRENGTHS"
                );
                for m in &models {
                    println!(
                        "{:<20} {:<10} {:>10} {:<8} {:>7}ms {:<8}  {}",
                        m.name,
                        m.provider,
                        m.max_context_tokens,
                        m.cost_class.to_string(),
                        m.average_latency_ms,
                        if m.supports_chunking { "yes" } else { "no" },
                        m.strengths.join(", ")
                    );
                }
            }
        }
        Commands::Log { .. } => {
            // Handled above (before the engine is built)
        }
    }

    Ok(())
}

/// Cancel every task on the queue when Ctrl-C arrives.
fn cancel_on_ctrl_c(queue: Arc<context_relay::queue::BatchQueue>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling tasks");
            for task in queue.list(None) {
                queue.cancel(&task.id);
            }
        }
    });
}

fn print_plan(plan: &RoutePlan) {
    println!(
        "Package: {} fragments, {} tokens (+{} for the task description)",
        plan.fragment_count, plan.package_tokens, plan.description_tokens
    );
    for name in &plan.filtered_out {
        println!("  skip    {:<20} window too small, no chunking", name);
    }
    for c in &plan.candidates {
        match (&c.plan, &c.rejection) {
            (Some(p), _) => println!(
                "  ok      {:<20} {} call(s), ~{} prompt tokens",
                c.model,
                p.chunk_count(),
                c.estimated_prompt_tokens
            ),
            (None, Some(err)) => println!("  reject  {:<20} {}", c.model, err),
            (None, None) => {}
        }
    }
    match plan.selected() {
        Some(c) => println!("Selected: {}", c.model),
        None => println!("Selected: none (every candidate is unsuitable)"),
    }
}

fn print_report(report: &QueueReport) {
    println!(
        "{:<10} {:<20} {:<20} {:>6} {:>9}  {}",
        "TASK", "STATUS", "MODEL", "CHUNKS", "TOKENS", "DESCRIPTION"
    );
    for t in &report.tasks {
        println!(
            "{:<10} {:<20} {:<20} {:>6} {:>9}  {}",
            short(&t.task_id),
            t.status.as_str(),
            t.selected_model.as_deref().unwrap_or("-"),
            t.chunk_count,
            t.token_cost.unwrap_or(t.estimated_prompt_tokens),
            t.description
        );
        if let Some(err) = &t.error {
            println!("           {}", err.message);
        }
    }
    if report.dry_run {
        println!(
            "\nDry run: {} task(s), ~{} prompt tokens, no models called.",
            report.tasks.len(),
            report.estimated_prompt_tokens()
        );
    }
}

fn status_label(status: &CacheStatus) -> &'static str {
    match status {
        CacheStatus::Hit => "up to date",
        CacheStatus::Built => "built",
        CacheStatus::Rebuilt => "rebuilt",
        CacheStatus::StaleButAvailable { .. } => "stale",
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
