use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use translation_compiler::compiler::{Compiler, StatusReport, SyncOptions, SyncReport};
use translation_compiler::config::{Config, DEFAULT_CONFIG_FILE};
use translation_compiler::ledger::Ledger;
use translation_compiler::provider::{create_provider, TranslationProvider};
use translation_compiler::retry::RetryPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental LLM translation compiler", long_about = None)]
struct Args {
    /// Path to the project config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate new and changed strings.
    Sync {
        /// Plan only; no provider calls and no ledger writes
        #[arg(long)]
        dry_run: bool,

        /// Regenerate everything in scope, including manual overrides
        #[arg(long)]
        force: bool,

        /// Limit the run to these target locales
        #[arg(short, long = "lang")]
        languages: Vec<String>,
    },

    /// Retry pairs whose last translation failed.
    Retry {
        #[arg(short, long = "lang")]
        languages: Vec<String>,
    },

    /// Record existing target files in the ledger without translating.
    Import,

    /// Show ledger statistics and recent runs.
    Status,

    /// Prune run history.
    History {
        /// Number of most recent runs to keep
        #[arg(long)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("translation_compiler=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let ledger_path = config.ledger_path();
    let ledger = Ledger::open(&ledger_path)
        .with_context(|| format!("Failed to open ledger at {}", ledger_path.display()))?;

    let outcome = run(&config, &ledger, args.command).await;
    ledger.close().context("Failed to close ledger")?;
    outcome
}

async fn run(config: &Config, ledger: &Ledger, command: Command) -> Result<()> {
    let compiler = Compiler::new(config, ledger);

    match command {
        Command::Sync {
            dry_run,
            force,
            languages,
        } => {
            let options = SyncOptions {
                dry_run,
                force,
                languages,
                only_failed: false,
            };
            // A dry run never calls the provider, so it needs no API key
            let report = if dry_run {
                compiler.plan_only(&options)?
            } else {
                let provider = build_provider(config)?;
                compiler.sync(provider.as_ref(), &options).await?
            };
            print_sync_report(&report);
        }
        Command::Retry { languages } => {
            let provider = build_provider(config)?;
            let report = compiler.retry(provider.as_ref(), languages).await?;
            print_sync_report(&report);
        }
        Command::Import => {
            let summary = compiler.import_existing()?;
            println!(
                "Imported {} translations ({} already tracked, {} errors)",
                summary.imported, summary.skipped, summary.errors
            );
        }
        Command::Status => {
            let status = compiler.status()?;
            print_status(&status);
        }
        Command::History { keep } => {
            let removed = compiler.prune_history(keep)?;
            println!("Removed {} run history entries", removed);
        }
    }

    Ok(())
}

fn build_provider(config: &Config) -> Result<Box<dyn TranslationProvider>> {
    Ok(create_provider(
        &config.provider,
        config.api_key()?,
        RetryPolicy::provider_call(config.advanced.max_retries),
    ))
}

fn print_sync_report(report: &SyncReport) {
    for lang in &report.languages {
        println!(
            "{:>6}: {} new, {} modified, {} retry, {} manual, {} up to date",
            lang.lang_code, lang.new_keys, lang.modified, lang.retries, lang.manual_protected, lang.up_to_date
        );
    }

    if report.dry_run {
        println!(
            "Dry run: {} units would be translated (estimated ${:.4})",
            report.planned_units, report.estimated_cost
        );
        return;
    }

    println!(
        "Translated {} units, {} failed, {} skipped, {} manual overrides kept",
        report.translated_units, report.failed_units, report.skipped_units, report.manual_overrides
    );
    println!(
        "Tokens: {} in / {} out, cost ${:.4}",
        report.tokens_in, report.tokens_out, report.cost_usd
    );

    if report.failed_units > 0 {
        warn!("{} units failed; run `retry` to try them again", report.failed_units);
    } else {
        info!("Sync complete");
    }
}

fn print_status(status: &StatusReport) {
    println!(
        "{} source keys, {} manual overrides",
        status.project.total_keys, status.project.manual_count
    );

    for lang in &status.languages {
        println!(
            "{:>6}: {} translated, {} pending, {} failed, {} manual",
            lang.lang_code,
            lang.stats.translated,
            lang.stats.pending,
            lang.stats.failed,
            lang.stats.manual
        );
    }

    if !status.failed.is_empty() {
        println!("\nFailed:");
        for item in &status.failed {
            println!("  {} ({})", item.key_path, item.lang_code);
        }
    }

    if !status.recent_runs.is_empty() {
        println!("\nRecent runs:");
        for run in &status.recent_runs {
            println!(
                "  {}  {}  {} in / {} out  ${:.4}{}",
                run.run_id,
                run.model_used,
                run.tokens_in,
                run.tokens_out,
                run.cost_estimate_usd,
                if run.finished_at.is_none() { "  (unfinished)" } else { "" }
            );
        }
    }
}
