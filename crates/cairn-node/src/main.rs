use std::sync::Arc;

use anyhow::Context;
use cairn_core::CairnConfig;
use cairn_jobstore::{ChannelSignaler, JobDetail, JobStore, Key, Schedule, Trigger};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

mod runner;

#[derive(Parser, Debug)]
#[command(name = "cairn-node", version, about = "Run a Cairn job-store node")]
struct Cli {
    /// Path to cairn.toml (defaults to CAIRN_CONFIG, then ~/.cairn/cairn.toml).
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and exit.
    Init,
    /// Print counts and cluster membership.
    Status,
    /// Store a job with a repeating trigger.
    Schedule {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "DEFAULT")]
        group: String,
        /// Name the executor resolves to an implementation.
        #[arg(long, default_value = "log")]
        job_class: String,
        #[arg(long, default_value_t = 60)]
        every_secs: i64,
        /// -1 repeats forever.
        #[arg(long, default_value_t = -1)]
        repeat: i32,
        #[arg(long)]
        no_concurrent: bool,
        #[arg(long)]
        recover: bool,
    },
    /// Acquire, fire and complete triggers until interrupted.
    Run {
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        /// Longest wait between acquisitions when nothing is due.
        #[arg(long, default_value_t = 1_000)]
        idle_wait_ms: u64,
        /// Acquire triggers due this far ahead.
        #[arg(long, default_value_t = 0)]
        time_window_ms: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cairn_node=info,cairn_jobstore=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("CAIRN_CONFIG").ok());
    let config = CairnConfig::load(config_path.as_deref())?;

    ensure_parent_dir(&config.database.path)?;
    info!(path = %config.database.path, "opening job store");

    let (signaler, events) = ChannelSignaler::channel(1024);
    let store = JobStore::open(&config, Arc::new(signaler))?;

    match cli.command {
        Command::Init => {
            info!(scheduler = %store.scheduler_name(), "schema ready");
        }
        Command::Status => print_status(&store)?,
        Command::Schedule {
            name,
            group,
            job_class,
            every_secs,
            repeat,
            no_concurrent,
            recover,
        } => {
            let job = JobDetail::new(Key::new(name.clone(), group.clone()), job_class)
                .with_durability(true)
                .with_concurrent_execution_disallowed(no_concurrent)
                .with_requests_recovery(recover);
            let trigger = Trigger::new(
                Key::new(name, group),
                job.key.clone(),
                Schedule::every(chrono::Duration::seconds(every_secs), repeat),
                Utc::now(),
            );
            store.store_job(&job, true)?;
            store.store_trigger(&trigger, true)?;
            info!(job = %job.key, next = ?trigger.next_fire_time, "scheduled");
        }
        Command::Run {
            batch_size,
            idle_wait_ms,
            time_window_ms,
        } => {
            let options = runner::RunOptions {
                batch_size,
                idle_wait: std::time::Duration::from_millis(idle_wait_ms),
                time_window: chrono::Duration::milliseconds(time_window_ms),
            };
            runner::run(Arc::clone(&store), events, options).await?;
        }
    }
    Ok(())
}

fn print_status(store: &JobStore) -> anyhow::Result<()> {
    let paused = store.get_paused_trigger_groups()?;
    println!("scheduler:  {}", store.scheduler_name());
    println!("instance:   {}", store.instance_id());
    println!("clustered:  {}", store.is_clustered());
    println!("jobs:       {}", store.get_number_of_jobs()?);
    println!("triggers:   {}", store.get_number_of_triggers()?);
    println!("calendars:  {}", store.get_number_of_calendars()?);
    println!("paused:     {}", paused.len());
    for state in store.get_scheduler_states()? {
        println!(
            "member {:<40} last check-in {} (every {} ms)",
            state.instance_id, state.checkin_timestamp, state.checkin_interval_ms
        );
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dir_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("nested/deeper/cairn.db");
        ensure_parent_dir(db.to_str().unwrap()).unwrap();
        assert!(dir.path().join("nested/deeper").is_dir());
    }

    #[test]
    fn blocked_parent_dir_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();
        let db = file.join("cairn.db");
        let err = ensure_parent_dir(db.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("creating database directory"));
    }
}
