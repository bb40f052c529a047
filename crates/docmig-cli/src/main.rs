use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use docmig_engine::{write_run_report, EngineConfig, Mode, RunOptions, Runner, TaskFile};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "docmig")]
#[command(about = "Reconcile, merge and link document collections")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    flags: Flags,
}

#[derive(Debug, Args)]
struct Flags {
    /// Plan and log every write without touching the store.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Print the counts as JSON on stdout; the text summary moves to stderr.
    #[arg(long, global = true)]
    json: bool,
    /// Overwrite result fields that already hold an identifier.
    #[arg(long, global = true)]
    force_relink: bool,
    /// Fail when two reference records share a display name.
    #[arg(long, global = true)]
    strict_names: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Attach identifiers to records that only carry a display name.
    LinkByName,
    /// Fold legacy field names into their canonical names.
    BackfillRole,
    /// Absorb the secondary collection into the primary one.
    MergeCollections,
    /// Delete records sharing a key field, keeping the newest.
    DedupeRecords,
    /// Create reference records for names nobody defined yet.
    SeedReferences,
    /// Add expected fields with default values where missing.
    BackfillDefaults,
    /// Preview every pass and check for leftovers; writes nothing.
    VerifyOnly,
}

impl From<&Commands> for Mode {
    fn from(command: &Commands) -> Self {
        match command {
            Commands::LinkByName => Mode::LinkByName,
            Commands::BackfillRole => Mode::BackfillRole,
            Commands::MergeCollections => Mode::MergeCollections,
            Commands::DedupeRecords => Mode::DedupeRecords,
            Commands::SeedReferences => Mode::SeedReferences,
            Commands::BackfillDefaults => Mode::BackfillDefaults,
            Commands::VerifyOnly => Mode::VerifyOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let tasks = TaskFile::load(&config.tasks_file)?;
    let store = config.open_store().await?;

    let options = RunOptions {
        dry_run: cli.flags.dry_run || config.dry_run,
        force_relink: cli.flags.force_relink,
        strict_names: cli.flags.strict_names,
    };
    let mode = Mode::from(&cli.command);
    let outcome = Runner::new(store.as_ref(), tasks, options)
        .run(mode)
        .await
        .with_context(|| format!("{mode} failed"))?;

    if !outcome.dry_run {
        match write_run_report(&config.reports_dir, &outcome).await {
            Ok(dir) => info!(reports = %dir.display(), "run report written"),
            Err(err) => warn!(error = %err, "could not write run report"),
        }
    }

    if cli.flags.json {
        eprint!("{outcome}");
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome.summary).context("serializing run summary")?
        );
    } else {
        print!("{outcome}");
    }

    if let Some(reason) = &outcome.aborted {
        anyhow::bail!("{mode} aborted: {reason}");
    }
    Ok(())
}
