//! fwsync - declarative packet-filter rule reconciliation
//!
//! # Usage
//!
//! ```bash
//! fwsync reconcile rules.json            # Converge every scope named in rules.json
//! fwsync reconcile rules.json --dry-run  # Show the delta without applying it
//! fwsync list -t filter -c INPUT --page 1 --limit 20
//! fwsync rules -t filter -c INPUT        # Managed rules as JSON
//! fwsync delete -t filter -c INPUT --id web-allow
//! fwsync --backend nft --ipv6 list -t filter -c FORWARD
//! fwsync config --init                   # Write default config.json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fwsync::config::{self, AppConfig};
use fwsync::core::desired;
use fwsync::core::reconcile::{ScopeReport, group_by_scope};
use fwsync::core::rule::Family;
use fwsync::{BackendKind, Error, Reconciler, Result, RuleId};

#[derive(Parser)]
#[command(name = "fwsync")]
#[command(about = "Converge iptables/nftables chains to a declared rule set", long_about = None)]
struct Cli {
    /// Backend to use (iptables, nft, netlink); overrides config
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Manage the IPv6 family (ip6tables / nft ip6)
    #[arg(long, global = true)]
    ipv6: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write logs to <state_dir>/fwsync.log
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every scope named in a desired-rules JSON file
    Reconcile {
        /// JSON array of rules, or an object with a "rules" array
        file: PathBuf,
        /// Print the additions and removals without applying them
        #[arg(long)]
        dry_run: bool,
    },
    /// Show one page of raw chain rows
    List {
        #[arg(short, long)]
        table: String,
        #[arg(short, long)]
        chain: String,
        /// 0-based page number
        #[arg(long, default_value_t = 0)]
        page: u64,
        /// Rows per page (default: config page_limit)
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Print the managed rules of a chain as JSON
    Rules {
        #[arg(short, long)]
        table: String,
        #[arg(short, long)]
        chain: String,
    },
    /// Delete one managed rule by ID (no-op if absent)
    Delete {
        #[arg(short, long)]
        table: String,
        #[arg(short, long)]
        chain: String,
        #[arg(long)]
        id: String,
    },
    /// Show the effective configuration
    Config {
        /// Write a default config.json
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let _ = fwsync::utils::ensure_dirs();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let mut config = config::load_config().await;
        if let Some(kind) = cli.backend {
            config.backend = kind;
        }
        if cli.ipv6 {
            config.family = Family::Ipv6;
        }
        init_logging(cli.verbose, cli.log_file || config.log_to_file);

        match handle_cli(cli.command, &config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                report_error(&e);
                ExitCode::FAILURE
            }
        }
    })
}

fn init_logging(verbose: u8, to_file: bool) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if to_file && let Some(mut log_path) = fwsync::utils::get_state_dir() {
        log_path.push("fwsync.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(e: &Error) {
    eprintln!("Error: {e}");
    let translation = e.translate();
    eprintln!("  {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  - {suggestion}");
    }
    if let Some(url) = &translation.help_url {
        eprintln!("  See: {url}");
    }
    if let Some(stderr) = e.stderr().map(str::trim).filter(|s| !s.is_empty()) {
        eprintln!("Backend output:");
        for line in stderr.lines() {
            eprintln!("  | {line}");
        }
    }
}

async fn handle_cli(command: Commands, config: &AppConfig) -> Result<()> {
    let reconciler = Reconciler::new(config.to_settings());
    let run_id = Uuid::new_v4();

    match command {
        Commands::Reconcile { file, dry_run } => {
            let rules = desired::load(&file).await?;

            if dry_run {
                for (scope, scoped) in group_by_scope(&rules)? {
                    let delta = reconciler
                        .preview(scope.table().as_str(), scope.chain().as_str(), &scoped)
                        .await?;
                    println!("{scope}: +{} -{}", delta.add.len(), delta.remove.len());
                    for rule in &delta.remove {
                        println!("  - {} {}", rule.id, rule.action);
                    }
                    for rule in &delta.add {
                        println!("  + {} {}", rule.id, rule.action);
                    }
                }
                return Ok(());
            }

            let result = reconciler.reconcile_all(&rules).await;
            if config.audit_enabled {
                let (reports, error): (&[ScopeReport], _) = match &result {
                    Ok(reports) => (reports.as_slice(), None),
                    Err(e) => (&[], Some(e.to_string())),
                };
                fwsync::audit::log_reconcile(run_id, reports, error).await;
            }

            for report in result? {
                let s = report.summary;
                let state = if s.changed { "changed" } else { "unchanged" };
                println!("{}: {state} (+{} -{})", report.scope, s.added, s.removed);
            }
        }
        Commands::List {
            table,
            chain,
            page,
            limit,
            json,
        } => {
            let limit = limit.unwrap_or_else(|| config.effective_page_limit());
            let page_rows = reconciler.list_paged(&table, &chain, page, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page_rows)?);
            } else {
                for row in &page_rows.rows {
                    let handle = row.handle.map_or_else(|| "-".to_string(), |h| h.to_string());
                    println!("{:>5} {handle:>6}  {}", row.row_no, row.row);
                }
                if page_rows.has_more {
                    println!("-- more: --page {} --", page + 1);
                }
            }
        }
        Commands::Rules { table, chain } => {
            let rules = reconciler.list(&table, &chain).await?;
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
        Commands::Delete { table, chain, id } => {
            let id = RuleId::parse(&id)?;
            let result = reconciler.delete(&table, &chain, id.clone()).await;
            if config.audit_enabled {
                let scope = format!("{table}/{chain}");
                let removed = matches!(result, Ok(true));
                let error = result.as_ref().err().map(ToString::to_string);
                fwsync::audit::log_delete(run_id, &scope, &id, removed, error).await;
            }
            if result? {
                println!("Deleted {id}");
            } else {
                println!("No rule with ID {id}");
            }
        }
        Commands::Config { init } => {
            if init {
                config::save_config(&AppConfig::default()).await?;
                if let Some(path) = config::config_path() {
                    println!("Wrote {}", path.display());
                }
            } else {
                if let Some(path) = config::config_path() {
                    println!("# {}", path.display());
                }
                println!("{}", serde_json::to_string_pretty(config)?);
            }
        }
    }
    Ok(())
}
