//! followgraph - optimistic social graph cache
//!
//! Main entry point for the followgraph CLI.

use clap::{Parser, Subcommand};
use followgraph::cache::{CacheChange, SocialGraphCache, StatsPatch};
use followgraph::config::{validate_config_result, FollowGraphConfig};
use followgraph::persistence::open_store;
use followgraph::remote::{HttpFollowService, InMemoryFollowService, RemoteFollowService};
use followgraph::{FollowGraphError, MutationOutcome};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// followgraph - cached follow relationships with optimistic writes
#[derive(Parser, Debug)]
#[command(name = "followgraph")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/followgraph/config.yaml)
    #[arg(short, long)]
    config: Option<String>,

    /// Use an in-process backend instead of the configured remote
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the cached follow state for a pair (no network)
    Status {
        /// Follower user id
        follower: String,

        /// Followed user id
        target: String,
    },

    /// Show the follow state for a pair, asking the backend on a cache miss
    Resolve {
        /// Follower user id
        follower: String,

        /// Followed user id
        target: String,
    },

    /// Follow a user
    Follow {
        /// Acting user id
        follower: String,

        /// User to follow
        target: String,
    },

    /// Unfollow a user
    Unfollow {
        /// Acting user id
        follower: String,

        /// User to unfollow
        target: String,
    },

    /// Show cached follower/following counters for a user
    Stats {
        /// User id
        user: String,
    },

    /// Store follower/following counters for a user
    SeedStats {
        /// User id
        user: String,

        /// Followers count
        #[arg(long)]
        followers: Option<u64>,

        /// Following count
        #[arg(long)]
        following: Option<u64>,
    },

    /// Drop a cached follow fact, or a user's counters when no target is given
    Invalidate {
        /// Follower user id (or the user whose stats to drop)
        follower: String,

        /// Followed user id
        target: Option<String>,
    },

    /// Remove expired entries now
    Sweep,

    /// Subscribe to push events for a user and print cache changes
    Watch {
        /// User id to subscribe for
        user: String,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Print the cache snapshot as JSON
    Dump {
        /// Print Prometheus metrics instead
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = followgraph::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> followgraph::Result<()> {
    if let Commands::Init { force } = cli.command {
        return handle_init_command(&cli.config, force);
    }

    let config = load_config(&cli.config)?;
    validate_config_result(&config)?;

    let remote: Arc<dyn RemoteFollowService> = if cli.offline {
        tracing::info!("Using in-process follow backend");
        Arc::new(InMemoryFollowService::new())
    } else {
        Arc::new(HttpFollowService::from_config(&config.remote)?)
    };
    let store = open_store(&config.persistence)?;
    let cache = SocialGraphCache::new(remote, store, config.cache.settings());

    match cli.command {
        // Handled before the cache is built
        Commands::Init { .. } => {}

        Commands::Status { follower, target } => {
            let state = cache.get_follow_status(&follower, &target);
            println!("{} -> {}: {}", follower, target, describe_state(state));
        }

        Commands::Resolve { follower, target } => {
            let following = cache.resolve_follow_status(&follower, &target).await?;
            println!("{} -> {}: {}", follower, target, describe_state(Some(following)));
        }

        Commands::Follow { follower, target } => {
            let outcome = cache.follow_user(&follower, &target).await?;
            print_outcome("follow", &follower, &target, &outcome);
            if !outcome.success {
                process::exit(2);
            }
        }

        Commands::Unfollow { follower, target } => {
            let outcome = cache.unfollow_user(&follower, &target).await?;
            print_outcome("unfollow", &follower, &target, &outcome);
            if !outcome.success {
                process::exit(2);
            }
        }

        Commands::Stats { user } => match cache.get_user_stats(&user) {
            Some(stats) => {
                println!("{}", user);
                println!("  Followers: {}", stats.followers_count);
                println!("  Following: {}", stats.following_count);
                println!("  Updated:   {}", format_millis(stats.last_updated));
            }
            None => println!("{}: no cached stats", user),
        },

        Commands::SeedStats {
            user,
            followers,
            following,
        } => {
            let patch = StatsPatch {
                followers_count: followers,
                following_count: following,
            };
            cache.update_user_stats(&user, patch)?;
            if let Some(stats) = cache.get_user_stats(&user) {
                println!(
                    "✓ {}: {} followers, {} following",
                    user, stats.followers_count, stats.following_count
                );
            }
        }

        Commands::Invalidate { follower, target } => match target {
            Some(target) => {
                cache.invalidate_follow_status(&follower, &target);
                println!("✓ Dropped cached state for {} -> {}", follower, target);
            }
            None => {
                cache.invalidate_user_stats(&follower);
                println!("✓ Dropped cached stats for {}", follower);
            }
        },

        Commands::Sweep => {
            let report = cache.clear_expired_cache();
            println!(
                "Removed {} follow states and {} user stats",
                report.follow_states_removed, report.user_stats_removed
            );
        }

        Commands::Watch { user, seconds } => {
            watch(&cache, &user, seconds.map(Duration::from_secs)).await?;
        }

        Commands::Dump { metrics } => {
            if metrics {
                print!("{}", followgraph::metrics::encode_metrics());
            } else {
                let snapshot = cache.snapshot();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }
    }

    Ok(())
}

fn load_config(path: &Option<String>) -> followgraph::Result<FollowGraphConfig> {
    if let Some(path) = path {
        return FollowGraphConfig::load(path);
    }

    match FollowGraphConfig::load_default() {
        Ok(config) => Ok(config),
        Err(FollowGraphError::Config(msg)) if msg.contains("Config file not found") => {
            tracing::debug!("No configuration file, using defaults");
            Ok(FollowGraphConfig::default())
        }
        Err(e) => Err(e),
    }
}

fn handle_init_command(path: &Option<String>, force: bool) -> followgraph::Result<()> {
    let path = path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(FollowGraphConfig::default_path);

    if path.exists() && !force {
        println!("Configuration already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    FollowGraphConfig::default().save(&path)?;
    println!("✓ Wrote configuration to {}", path.display());
    println!();
    println!("Set remote.base_url (and remote.api_key) before running without --offline.");
    Ok(())
}

async fn watch(
    cache: &SocialGraphCache,
    user: &str,
    limit: Option<Duration>,
) -> followgraph::Result<()> {
    let mut changes = cache.changes();
    cache.initialize();
    cache.subscribe_to_user(user, None)?;
    println!("Watching follow events for {} (Ctrl-C to stop)", user);

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            change = changes.recv() => match change {
                Ok(change) => print_change(&change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    cache.cleanup();
    Ok(())
}

fn describe_state(state: Option<bool>) -> &'static str {
    match state {
        Some(true) => "following",
        Some(false) => "not following",
        None => "unknown (not cached or expired)",
    }
}

fn print_outcome(action: &str, follower: &str, target: &str, outcome: &MutationOutcome) {
    if outcome.success {
        println!("✓ {} {} -> {}", action, follower, target);
    } else {
        println!(
            "✗ {} {} -> {} failed: {}",
            action,
            follower,
            target,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn print_change(change: &CacheChange) {
    match change {
        CacheChange::FollowStatus {
            key,
            is_following,
            origin,
        } => println!("{:?}: {} = {}", origin, key, is_following),
        CacheChange::FollowStatusInvalidated(key) => println!("invalidated: {}", key),
        CacheChange::UserStats { user_id, stats } => println!(
            "stats: {} followers={} following={}",
            user_id, stats.followers_count, stats.following_count
        ),
        CacheChange::UserStatsInvalidated(user_id) => println!("stats invalidated: {}", user_id),
        CacheChange::Swept(report) => println!("swept: {} entries", report.total()),
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
