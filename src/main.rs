use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use music_locker::cache::{CacheStats, CategoryUsage};
use music_locker::queue::{DrainSummary, Priority, QueueItem};
use music_locker::{
    scheduler, Action, ActionOptions, ActionQueue, ApiClient, CacheStore, Clock, Config, DrainOutcome,
    NetworkMonitor, PreferenceStore, QueueEvent, SystemClock,
};

/// Offline cache and sync queue for Music Locker
#[derive(Parser, Debug)]
#[command(name = "music-locker", version, about)]
struct Args {
    /// Config file (default: <config dir>/music-locker/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show queue summary and cache usage
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sync queued actions now if the server is reachable
    Sync,
    /// Queue an action, e.g. '{"action":"toggle_favorite","payload":{"entry_id":42}}'
    Enqueue {
        action: String,
        #[arg(short, long, default_value = "normal")]
        priority: Priority,
        /// Free-form JSON stored with the item
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Move failed actions back to pending and sync them
    RetryFailed,
    /// Remove actions from the queue
    Clear(ClearArgs),
    /// Purge old finished actions and expired cache entries
    Cleanup,
    /// Show preferences, or shallow-merge a JSON patch into them
    Prefs {
        patch: Option<String>,
        /// Restore defaults
        #[arg(long, conflicts_with = "patch")]
        reset: bool,
    },
    /// Stay running: probe connectivity, sync on reconnect, run maintenance
    Watch {
        /// Seconds between reachability probes
        #[arg(long, default_value_t = 30)]
        probe_secs: u64,
    },
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct ClearArgs {
    #[arg(long)]
    completed: bool,
    #[arg(long)]
    failed: bool,
    #[arg(long)]
    all: bool,
}

struct App {
    config: Config,
    store: Arc<CacheStore>,
    client: Arc<ApiClient>,
    network: Arc<NetworkMonitor>,
    queue: Arc<ActionQueue>,
    events: mpsc::UnboundedReceiver<QueueEvent>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let path = config.storage_path()?;
        let store = Arc::new(CacheStore::open(
            &path,
            config.storage.quota_bytes,
            config.cache.options(),
            clock.clone(),
        ));
        store.clean_expired_cache();

        let client = Arc::new(ApiClient::new(&config.api)?);
        let network = Arc::new(NetworkMonitor::new(false));
        let (queue, events) = ActionQueue::new(
            store.clone(),
            client.clone(),
            network.clone(),
            clock,
            config.queue.clone(),
        );

        Ok(Self {
            config,
            store,
            client,
            network,
            queue: Arc::new(queue),
            events,
        })
    }

    fn require_token(&self) -> Result<()> {
        if !self.client.has_csrf_token() {
            bail!("No CSRF token configured. Set api.csrf_token in the config file or MUSIC_LOCKER_CSRF_TOKEN");
        }
        Ok(())
    }

    async fn probe(&self) -> bool {
        let online = self.client.is_reachable().await;
        self.network.set_online(online);
        online
    }

    /// Probe, then drain and print what happened.
    async fn sync(&mut self) -> Result<()> {
        self.require_token()?;
        if !self.probe().await {
            println!("{} is unreachable; actions stay queued", self.client.base_url());
            return Ok(());
        }
        match self.queue.process_queue().await {
            DrainOutcome::Idle => println!("Nothing to sync"),
            DrainOutcome::Offline => println!("Offline; actions stay queued"),
            DrainOutcome::AlreadyRunning => println!("A sync is already running"),
            DrainOutcome::Finished(_) => self.print_events(),
        }
        Ok(())
    }

    fn print_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            print_event(&event);
        }
    }
}

fn print_event(event: &QueueEvent) {
    match event {
        QueueEvent::Enqueued { id, action } => println!("  queued    {action} ({id})"),
        QueueEvent::Synced { id, action } => println!("  synced    {action} ({id})"),
        QueueEvent::RetryScheduled { id, action, retries, .. } => {
            println!("  retrying  {action} ({id}), attempt {retries}")
        }
        QueueEvent::Failed { id, action, error } => println!("  failed    {action} ({id}): {error}"),
        QueueEvent::Discarded { id, action, reason } => println!("  discarded {action} ({id}): {reason}"),
        QueueEvent::DrainFinished(summary) => print_summary(summary),
        QueueEvent::Cleared { removed } => println!("Removed {removed} actions"),
        QueueEvent::Cleanup { removed } => println!("Cleaned up {removed} old actions"),
    }
}

fn print_summary(summary: &DrainSummary) {
    println!(
        "Synced {}, retrying {}, failed {}, discarded {}",
        summary.succeeded, summary.retried, summary.failed, summary.discarded
    );
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn print_status(items: &[QueueItem], stats: &CacheStats, app: &App) {
    let summary = app.queue.get_summary();
    println!("Queue: {} total, {} pending, {} failed", summary.total, summary.pending, summary.failed);
    for item in items {
        let mut line = format!("  {:<8} {:<6} {:<16} {}", item.status, item.priority, item.action, item.id);
        if item.retries > 0 {
            line.push_str(&format!("  retries={}", item.retries));
        }
        if let Some(error) = &item.error {
            line.push_str(&format!("  error={error}"));
        }
        println!("{line}");
    }

    if !app.store.is_enabled() {
        println!("Cache: disabled (storage unavailable)");
        return;
    }
    println!(
        "Cache: {} in {} entries ({:.1}% of {})",
        format_bytes(stats.total_bytes),
        stats.entry_count,
        stats.usage_percent,
        format_bytes(stats.soft_cap_bytes)
    );
    let rows: [(&str, CategoryUsage); 5] = [
        ("collection", stats.collection),
        ("spotify", stats.lookups),
        ("preferences", stats.preferences),
        ("queue", stats.queue),
        ("other", stats.other),
    ];
    for (name, usage) in rows {
        if usage.entries > 0 {
            println!("  {:<12} {:>4} entries  {}", name, usage.entries, format_bytes(usage.bytes));
        }
    }
}

async fn watch(mut app: App, probe_secs: u64) -> Result<()> {
    app.require_token()?;
    let listener = scheduler::spawn_network_listener(app.queue.clone(), app.network.subscribe());
    let maintenance = scheduler::spawn_maintenance(app.queue.clone(), app.store.clone(), &app.config.queue);
    let mut probe = tokio::time::interval(Duration::from_secs(probe_secs.max(1)));

    info!("Watching {} (Ctrl-C to stop)", app.client.base_url());
    loop {
        tokio::select! {
            _ = probe.tick() => {
                app.probe().await;
            }
            Some(event) = app.events.recv() => {
                print_event(&event);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    listener.abort();
    maintenance.abort();
    if app.queue.is_processing() {
        warn!("Stopped during a sync pass; unsent actions remain queued");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "music_locker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let mut app = App::open(config)?;

    match args.command {
        Command::Status { json } => {
            let items = app.queue.items();
            let stats = app.store.cache_stats();
            if json {
                let out = serde_json::json!({
                    "queue": items,
                    "cache": stats,
                    "cache_enabled": app.store.is_enabled(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                print_status(&items, &stats, &app);
            }
        }
        Command::Sync => app.sync().await?,
        Command::Enqueue { action, priority, metadata } => {
            let action: Action = serde_json::from_str(&action)
                .context("Action must look like {\"action\": \"<name>\", \"payload\": {...}}")?;
            let metadata = metadata
                .map(|m| serde_json::from_str::<Value>(&m))
                .transpose()
                .context("Metadata must be valid JSON")?;
            let options = ActionOptions {
                priority,
                metadata,
                sync_now: false,
            };
            let id = app.queue.add_action(action, options);
            println!("Queued {id}");
            if app.client.has_csrf_token() {
                app.sync().await?;
            }
        }
        Command::RetryFailed => {
            let reset = app.queue.reset_failed();
            println!("Reset {reset} failed actions");
            if reset > 0 {
                app.sync().await?;
            }
        }
        Command::Clear(which) => {
            let removed = if which.all {
                app.queue.clear_all()
            } else if which.failed {
                app.queue.clear_failed()
            } else {
                app.queue.clear_completed()
            };
            println!("Removed {removed} actions");
        }
        Command::Cleanup => {
            let items = app.queue.cleanup_old_items();
            let entries = app.store.clean_expired_cache();
            println!("Removed {items} old actions and {entries} expired cache entries");
        }
        Command::Prefs { patch, reset } => {
            let prefs = PreferenceStore::new(app.store.clone());
            if reset {
                prefs.reset();
            } else if let Some(patch) = patch {
                let patch: Value = serde_json::from_str(&patch).context("Patch must be valid JSON")?;
                if !prefs.patch(&patch) {
                    bail!("Preferences were not saved (invalid values or storage unavailable)");
                }
            }
            println!("{}", serde_json::to_string_pretty(&prefs.get())?);
        }
        Command::Watch { probe_secs } => watch(app, probe_secs).await?,
    }

    Ok(())
}
