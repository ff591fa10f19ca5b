//! embr: version control for vector embeddings
//!
//! # Usage
//!
//! ```bash
//! # Create a repository in the current directory
//! embr init
//!
//! # Track an embedding of docs/a.txt produced by model m1
//! embr store vectors/a.npy docs/a.txt --model m1
//!
//! # Inspect and restore history
//! embr log --path docs/a.txt
//! embr status docs/a.txt
//! embr rollback 3fa2 docs/a.txt --model m1
//!
//! # Sync with a remote
//! embr remote add origin s3://bucket/prefix?region=eu-west-1
//! embr push origin
//! embr pull origin --prune
//! ```

use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use embr_core::gc::{Expiry, GcOptions, DEFAULT_EXPIRE};
use embr_core::remote::{PullOptions, PushOptions, RemoteOptions, RemoteSession, Remotes};
use embr_core::repository::LogQuery;
use embr_core::{MergeStrategy, Repository};

#[derive(Parser, Debug)]
#[command(name = "embr")]
#[command(author = "Embr Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Version control for vector embeddings")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a repository in the current directory
    Init,

    /// Store an embedding payload for a source file
    Store {
        /// Payload file (raw f32, .npy, or JSON text); `-` reads stdin
        payload: String,
        /// Source file the embedding was computed from
        source: PathBuf,
        /// Model that produced the embedding
        #[arg(short, long, default_value = "unknown")]
        model: String,
    },

    /// Show history of the current set, newest first
    Log {
        #[arg(short, long)]
        path: Option<PathBuf>,
        #[arg(short, long)]
        model: Option<String>,
        /// Show at most N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Set to read (default: current)
        #[arg(long)]
        set: Option<String>,
    },

    /// Show the current embedding of a source file for every model
    Status { path: PathBuf },

    /// Compare two embeddings
    Diff { a: String, b: String },

    /// Point a source file back at an earlier embedding
    Rollback {
        /// Hash or unique prefix
        hash: String,
        path: PathBuf,
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Stop tracking a source file
    Rm {
        path: PathBuf,
        #[arg(short, long)]
        model: Option<String>,
        /// Keep the objects; only drop the bindings
        #[arg(long)]
        cached: bool,
    },

    /// Write an object's payload to a file
    Get {
        hash: String,
        output: PathBuf,
        #[arg(short, long)]
        force: bool,
    },

    /// Manage sets
    #[command(subcommand)]
    Set(SetCommands),

    /// Merge another set into the current (or given) set
    Merge {
        source: String,
        #[arg(long)]
        into: Option<String>,
        /// union, mean, max, or weighted
        #[arg(short, long, default_value = "union")]
        strategy: String,
    },

    /// Delete unreferenced objects
    Gc {
        /// Only objects older than this (N.<unit>.ago, now, never)
        #[arg(long, default_value = DEFAULT_EXPIRE)]
        prune: String,
        #[arg(long)]
        aggressive: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Manage remotes
    #[command(subcommand)]
    Remote(RemoteCommands),

    /// Upload a set to a remote
    Push {
        remote: String,
        #[arg(long)]
        set: Option<String>,
        /// Delete remote documents not in the local history
        #[arg(short, long)]
        force: bool,
    },

    /// Download a set from a remote
    Pull {
        remote: String,
        #[arg(long)]
        set: Option<String>,
        /// Offer to delete local objects the remote does not have
        #[arg(long)]
        prune: bool,
        /// Delete prune candidates without asking
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SetCommands {
    Create { name: String },
    List,
    Switch { name: String },
    Delete {
        name: String,
        #[arg(short, long)]
        force: bool,
    },
    Status { name: Option<String> },
}

#[derive(Subcommand, Debug)]
enum RemoteCommands {
    Add {
        name: String,
        url: String,
        /// Bearer token, stored in .embr/config.local
        #[arg(long)]
        token: Option<String>,
        /// Request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,
        /// Interchange format
        #[arg(long)]
        format: Option<String>,
    },
    Remove { name: String },
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let directive = if cli.verbose { "embr=debug" } else { "embr=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let cwd = std::env::current_dir().context("cannot read current directory")?;
    let repo = match command {
        Commands::Init => {
            Repository::init(&cwd)?;
            println!("Initialized embr repository in {}", cwd.join(embr_core::MARKER_DIR).display());
            return Ok(());
        }
        _ => Repository::open(&cwd)?,
    };

    match command {
        Commands::Init => Ok(()),
        Commands::Store { payload, source, model } => cmd_store(&repo, &payload, &cwd.join(source), &model),
        Commands::Log { path, model, limit, set } => {
            let path = path.map(|p| repo.layout().resolve(&cwd, &p)).transpose()?;
            cmd_log(&repo, path, model, limit, set)
        }
        Commands::Status { path } => cmd_status(&repo, &cwd.join(path)),
        Commands::Diff { a, b } => cmd_diff(&repo, &a, &b),
        Commands::Rollback { hash, path, model } => {
            let full = repo.rollback(&hash, &cwd.join(&path), model.as_deref())?;
            println!("Rolled back {} to {}", path.display(), full);
            Ok(())
        }
        Commands::Rm { path, model, cached } => {
            let report = repo.remove(&cwd.join(&path), model.as_deref(), cached)?;
            println!(
                "Removed {} ({} binding(s), {} object(s) deleted)",
                path.display(),
                report.unbound.len(),
                report.deleted.len()
            );
            Ok(())
        }
        Commands::Get { hash, output, force } => {
            let full = repo.export(&hash, &output, force)?;
            println!("Wrote {} to {}", full.short(12), output.display());
            Ok(())
        }
        Commands::Set(cmd) => cmd_set(&repo, cmd),
        Commands::Merge { source, into, strategy } => cmd_merge(&repo, &source, into, &strategy),
        Commands::Gc {
            prune,
            aggressive,
            dry_run,
        } => {
            let report = repo.gc(&GcOptions {
                expire: Expiry::parse(&prune)?,
                dry_run,
                aggressive,
            })?;
            if dry_run {
                for hash in &report.candidates {
                    println!("would remove {}", hash);
                }
            }
            println!("{}", report.message);
            Ok(())
        }
        Commands::Remote(cmd) => cmd_remote(&repo, cmd),
        Commands::Push { remote, set, force } => cmd_push(&repo, &remote, set, force).await,
        Commands::Pull {
            remote,
            set,
            prune,
            yes,
        } => cmd_pull(&repo, &remote, set, prune, yes).await,
    }
}

fn cmd_store(repo: &Repository, payload: &str, source: &Path, model: &str) -> Result<()> {
    let data = if payload == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        std::fs::read(payload).with_context(|| format!("cannot read payload '{}'", payload))?
    };
    let outcome = repo.store_embedding(&data, source, model)?;
    if outcome.existed {
        println!("{} {} ({}, unchanged object)", outcome.hash, outcome.path, outcome.model);
    } else {
        println!("{} {} ({})", outcome.hash, outcome.path, outcome.model);
    }
    Ok(())
}

fn cmd_log(
    repo: &Repository,
    path: Option<String>,
    model: Option<String>,
    limit: Option<usize>,
    set: Option<String>,
) -> Result<()> {
    let entries = repo.log(&LogQuery { set, path, model, limit })?;
    for entry in entries {
        let when = chrono::DateTime::from_timestamp(entry.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| entry.timestamp.to_string());
        println!("{}  {}  {}  {}", entry.hash.short(12), when, entry.path, entry.model_or_unknown());
    }
    Ok(())
}

fn cmd_status(repo: &Repository, path: &Path) -> Result<()> {
    let status = repo.status(path)?;
    println!("{} (set {})", status.path, status.set);
    for model in &status.models {
        let current = model
            .current
            .map(|h| h.short(12))
            .unwrap_or_else(|| "(none)".to_string());
        let since = model
            .current_timestamp()
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|t| format!(", since {}", t.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_default();
        println!("  {}: {} ({} version(s){})", model.model, current, model.history.len(), since);
    }
    Ok(())
}

fn cmd_diff(repo: &Repository, a: &str, b: &str) -> Result<()> {
    let report = repo.diff(a, b)?;
    println!("{} vs {}", report.a.short(12), report.b.short(12));
    println!("  dimensions:           {}", report.dimensions);
    println!("  cosine similarity:    {:.1}%", report.similarity_percent());
    println!("  euclidean distance:   {:.6}", report.euclidean_distance);
    println!("  euclidean similarity: {:.6}", report.euclidean_similarity);
    Ok(())
}

fn cmd_set(repo: &Repository, cmd: SetCommands) -> Result<()> {
    match cmd {
        SetCommands::Create { name } => {
            repo.create_set(&name)?;
            println!("Created set '{}'", name);
        }
        SetCommands::List => {
            for set in repo.list_sets()? {
                let marker = if set.current { "*" } else { " " };
                println!("{} {} ({} entries)", marker, set.name, set.entries);
            }
        }
        SetCommands::Switch { name } => {
            repo.switch_set(&name)?;
            println!("Switched to set '{}'", name);
        }
        SetCommands::Delete { name, force } => {
            repo.delete_set(&name, force)?;
            println!("Deleted set '{}'", name);
        }
        SetCommands::Status { name } => {
            let status = repo.set_status(name.as_deref())?;
            println!("Set: {}{}", status.name, if status.current { " (current)" } else { "" });
            println!("  index entries: {}", status.index_entries);
            println!("  log entries:   {}", status.log_entries);
            println!("  models:        {}", status.models.join(", "));
            if let Some(ts) = status.last_updated.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)) {
                println!("  last updated:  {}", ts.format("%Y-%m-%d %H:%M:%S"));
            }
        }
    }
    Ok(())
}

fn cmd_merge(repo: &Repository, source: &str, into: Option<String>, strategy: &str) -> Result<()> {
    let strategy: MergeStrategy = strategy.parse()?;
    let report = repo.merge(source, into.as_deref(), strategy)?;
    println!(
        "Merged '{}' ({}): {} new, {} updated, {} conflict(s), {} error(s)",
        source,
        strategy,
        report.new,
        report.updated,
        report.conflicts.len(),
        report.errors
    );
    for conflict in &report.conflicts {
        println!("  conflict: {} ({}): {}", conflict.path, conflict.model, conflict.reason);
    }
    Ok(())
}

fn cmd_remote(repo: &Repository, cmd: RemoteCommands) -> Result<()> {
    let remotes = Remotes::new(repo.layout());
    match cmd {
        RemoteCommands::Add {
            name,
            url,
            token,
            timeout,
            insecure,
            format,
        } => {
            let options = RemoteOptions {
                token,
                timeout,
                verify_ssl: if insecure { Some(false) } else { None },
                format,
            };
            remotes.add(&name, &url, options)?;
            println!("Added remote '{}' -> {}", name, url);
        }
        RemoteCommands::Remove { name } => {
            remotes.remove(&name)?;
            println!("Removed remote '{}'", name);
        }
        RemoteCommands::List => {
            for remote in remotes.list()? {
                println!("{}\t{}", remote.name, remote.url);
            }
        }
    }
    Ok(())
}

fn progress_printer() -> Arc<embr_core::remote::ProgressFn> {
    Arc::new(|event: &embr_core::remote::ProgressEvent| {
        if event.total > 0 {
            eprint!(
                "\r{}: {}/{} bytes ({:.0}%)",
                event.key,
                event.transferred,
                event.total,
                event.transferred as f64 * 100.0 / event.total as f64
            );
            if event.transferred >= event.total {
                eprintln!();
            }
        }
    })
}

async fn cmd_push(repo: &Repository, remote: &str, set: Option<String>, force: bool) -> Result<()> {
    let mut session = RemoteSession::open(repo, remote)?.with_progress(progress_printer());
    let report = session.push(&PushOptions { set, force }).await?;
    session.shutdown()?;
    println!(
        "Pushed set '{}' to '{}': {} uploaded, {} already present, {} missing locally, {} deleted ({} bytes)",
        report.set, remote, report.uploaded, report.skipped, report.missing, report.deleted, report.bytes
    );
    Ok(())
}

async fn cmd_pull(repo: &Repository, remote: &str, set: Option<String>, prune: bool, yes: bool) -> Result<()> {
    let mut session = RemoteSession::open(repo, remote)?;
    let report = session.pull(&PullOptions { set, prune }).await?;
    println!(
        "Pulled set '{}' from '{}': {} downloaded, {} already present{}",
        report.set,
        remote,
        report.downloaded,
        report.skipped,
        if report.rebuilt { ", history rebuilt" } else { "" }
    );

    if prune && !report.prune_candidates.is_empty() {
        println!("{} local object(s) are not on the remote:", report.prune_candidates.len());
        for hash in &report.prune_candidates {
            println!("  {}", hash);
        }
        if yes || confirm("Proceed? [y/N] ")? {
            let removed = session.prune(&report.prune_candidates)?;
            println!("Pruned {} object(s)", removed);
        } else {
            println!("Prune cancelled");
        }
    }
    session.shutdown()?;
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
