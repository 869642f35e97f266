//! skywatch: poll Bluesky author timelines for pattern matches.
//!
//! Designed for repeated, intermittent invocation from an external scheduler.
//! Each configured scan keeps a persisted cursor so a run notifies exactly
//! once per newly observed matching post: no re-notification for posts
//! already processed, no silent skips for posts that arrived between runs,
//! and never more than 24 hours of backlog on a fresh scan.
//!
//! # Commands
//!
//! ```bash
//! # Run all configured scans (or one by name)
//! skywatch scan
//! skywatch scan crypto_watch
//!
//! # Show persisted cursors
//! skywatch status
//!
//! # Forget a cursor; the next run re-scans the 24h window
//! skywatch reset crypto_watch
//! skywatch reset --all
//!
//! # Try a scan's pattern against one specific post, without touching state
//! skywatch test crypto_watch --uri at://did:plc:abc/app.bsky.feed.post/3k1 --execute
//! ```

pub mod core;

use crate::core::config::{self, Config};
use crate::core::engine::ScanEngine;
use crate::core::error::SkywatchError;
use crate::core::feed::FeedClient;
use crate::core::matcher::PatternMatcher;
use crate::core::notify::{MatchResult, NotificationPayload, Notifier, Notify};
use crate::core::output::compact_line;
use crate::core::state::StateStore;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "skywatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Scan Bluesky author timelines for matching posts"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run configured scans. With SCAN_NAME, run only that scan.
    Scan {
        scan_name: Option<String>,
        /// Path to config file
        #[clap(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Show persisted state of scans. With SCAN_NAME, only that scan.
    Status {
        scan_name: Option<String>,
        #[clap(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Delete persisted scan state so the next run starts fresh.
    Reset {
        scan_name: Option<String>,
        /// Reset every scan
        #[clap(long)]
        all: bool,
        #[clap(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Fetch one post and test it against a scan's pattern, without touching
    /// the persisted cursor.
    Test {
        scan_name: String,
        /// at:// uri of the post to fetch
        #[clap(long)]
        uri: String,
        /// Also dispatch the scan's notifications on a match
        #[clap(long)]
        execute: bool,
        #[clap(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

pub fn run() -> Result<(), SkywatchError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Scan { scan_name, config } => cmd_scan(scan_name.as_deref(), &config),
        Command::Status { scan_name, config } => cmd_status(scan_name.as_deref(), &config),
        Command::Reset {
            scan_name,
            all,
            config,
        } => cmd_reset(scan_name.as_deref(), all, &config),
        Command::Test {
            scan_name,
            uri,
            execute,
            config,
        } => cmd_test(&scan_name, &uri, execute, &config),
    }
}

fn open_store(cfg: &Config) -> Result<StateStore, SkywatchError> {
    StateStore::open(Path::new(&cfg.storage.database))
}

fn logged_in_client(cfg: &Config) -> Result<FeedClient, SkywatchError> {
    let mut client = FeedClient::new(&cfg.bluesky.service);
    client.login(&cfg.bluesky.username, &cfg.bluesky.password)?;
    Ok(client)
}

fn cmd_scan(scan_name: Option<&str>, config_path: &Path) -> Result<(), SkywatchError> {
    let cfg = config::load(config_path)?;
    let scans = cfg.select_scans(scan_name)?;
    let store = open_store(&cfg)?;
    let mut client = logged_in_client(&cfg)?;
    let notifier = Notifier::new();
    let mut engine = ScanEngine::new(
        &mut client,
        &store,
        &notifier,
        cfg.engine.commit_on_notify_failure,
    );

    let reports = engine.run_all(&scans)?;

    let mut failed = 0usize;
    for report in &reports {
        if let Some(error) = &report.error {
            failed += 1;
            eprintln!(
                "{} {}: {}",
                "✗".bright_red(),
                report.scan_name.bright_white().bold(),
                error
            );
            continue;
        }
        println!(
            "{} {}: {} post(s) scanned, {} match(es)",
            "✓".bright_green(),
            report.scan_name.bright_white().bold(),
            report.scanned_posts,
            report.matches.len()
        );
        for m in &report.matches {
            println!(
                "    {} {}  {}",
                "▸".bright_cyan(),
                m.created_at.bright_black(),
                compact_line(&m.text, 80)
            );
        }
        for warning in &report.warnings {
            eprintln!("    {} {}", "⚠".bright_yellow(), warning);
        }
        if !report.warnings.is_empty() && !report.committed {
            eprintln!(
                "    {} boundary not advanced; this window will be retried",
                "⚠".bright_yellow()
            );
        }
    }

    if failed > 0 {
        return Err(SkywatchError::ScanFailures(failed));
    }
    Ok(())
}

fn cmd_status(scan_name: Option<&str>, config_path: &Path) -> Result<(), SkywatchError> {
    let cfg = config::load(config_path)?;
    let store = open_store(&cfg)?;
    let states = store.list(scan_name)?;

    if states.is_empty() {
        match scan_name {
            Some(name) => println!("No status found for scan '{}'", name),
            None => println!("No scan status found. Run a scan first."),
        }
        return Ok(());
    }

    // Plain text: ANSI escapes would break the column widths.
    println!(
        "{:<20} {:<24} {:<25} {:<25}",
        "Name", "Handle", "Last Read", "Last Run"
    );
    println!("{}", "-".repeat(96));
    for state in states {
        let last_read = state.last_boundary_created_at.to_rfc3339();
        let last_run = state
            .last_run_at
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "Never".to_string());
        println!(
            "{:<20} {:<24} {:<25} {:<25}",
            state.scan_name, state.handle, last_read, last_run
        );
    }
    Ok(())
}

fn cmd_reset(scan_name: Option<&str>, all: bool, config_path: &Path) -> Result<(), SkywatchError> {
    if scan_name.is_none() && !all {
        return Err(SkywatchError::Config(
            "specify a SCAN_NAME or --all".to_string(),
        ));
    }
    let cfg = config::load(config_path)?;
    let store = open_store(&cfg)?;
    let deleted = store.reset(scan_name)?;
    match scan_name {
        Some(name) if deleted == 0 => println!("No state to reset for scan '{}'", name),
        Some(name) => println!("Reset scan '{}'", name),
        None => println!("Reset {} scan(s)", deleted),
    }
    Ok(())
}

fn cmd_test(
    scan_name: &str,
    uri: &str,
    execute: bool,
    config_path: &Path,
) -> Result<(), SkywatchError> {
    let cfg = config::load(config_path)?;
    let selected = cfg.select_scans(Some(scan_name))?;
    let scan = selected[0];
    let matcher = PatternMatcher::compile(&scan.pattern)?;

    let mut client = logged_in_client(&cfg)?;
    let post = client.get_post(uri)?;

    if !matcher.is_match(&post.text) {
        println!(
            "{} no match for pattern '{}'",
            "✗".bright_red(),
            scan.pattern
        );
        println!("    {}", compact_line(&post.text, 120));
        return Ok(());
    }

    println!("{} match for pattern '{}'", "✓".bright_green(), scan.pattern);
    println!("    {}", compact_line(&post.text, 120));

    if execute {
        let notifier = Notifier::new();
        let matches = vec![MatchResult::from_post(&post, matcher.pattern())];
        let payload = NotificationPayload::new(&scan.name, matches, 1);
        let warnings = notifier.dispatch(scan, &payload);
        if warnings.is_empty() {
            println!("{} notifications dispatched", "✓".bright_green());
        } else {
            for warning in warnings {
                eprintln!("    {} {}", "⚠".bright_yellow(), warning);
            }
        }
    }
    Ok(())
}
