use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sharelock::retry::{AcceptOverride, OverridePrompt, TerminalPrompt};
use sharelock::{
    AcquireOutcome, Cli, Commands, DeviceIdentity, FileLockCoordinator, HeartbeatOutcome,
    LockConfig, LockCoordinator, ReleaseOutcome, RetryOrchestrator,
};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbosity: u8, json: bool) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve the target into a coordinator plus its default lease duration
fn coordinator(
    cli: &Cli,
    config: &LockConfig,
    identity: DeviceIdentity,
) -> anyhow::Result<(Arc<LockCoordinator>, Duration)> {
    if let Some(db) = &cli.target.db {
        let c = LockCoordinator::for_database(db, config.db_grace_period(), identity)?;
        return Ok((Arc::new(c), config.db_lock_duration()));
    }

    match (&cli.target.dir, &cli.target.file) {
        (Some(dir), Some(file)) => {
            let files = FileLockCoordinator::new(dir, identity)?
                .with_grace_period(config.file_grace_period())
                .with_default_duration(config.file_lock_duration());
            Ok((files.coordinator(file)?, files.default_duration()))
        }
        _ => anyhow::bail!("either --db or --dir with --file is required"),
    }
}

fn print_info(c: &LockCoordinator) -> anyhow::Result<()> {
    match c.info()? {
        Some(record) => {
            println!("{}: {}", c.resource(), record);
            let left =
                record.time_remaining(chrono::Utc::now(), c.grace_period(), c.duration_fallback());
            if let Some(left) = left {
                println!("  fresh for another {}s", left.as_secs());
            } else {
                println!("  stale");
            }
        }
        None => println!("{}: unlocked", c.resource()),
    }
    Ok(())
}

async fn run_command(
    c: Arc<LockCoordinator>,
    config: &LockConfig,
    duration: Duration,
    yes: bool,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let prompt: Arc<dyn OverridePrompt> = if yes {
        Arc::new(AcceptOverride)
    } else {
        Arc::new(TerminalPrompt)
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = RetryOrchestrator::new(config.retry_policy(), prompt).with_events(tx);

    let label = command.join(" ");
    let handle = orchestrator.run_with_lock(c, duration, label.clone(), move || async move {
        let (program, args) = command.split_first().context("empty command")?;
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to start {}", program))?;
        anyhow::ensure!(status.success(), "{} exited with {}", program, status);
        Ok::<(), anyhow::Error>(())
    });

    let status_bar = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            eprintln!("{}", event.status_message());
        }
    });

    let outcome = handle.outcome().await;
    drop(orchestrator);
    let _ = status_bar.await;
    outcome.into_result(&label)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity, cli.json);

    let config = match &cli.config {
        Some(path) => LockConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LockConfig::from_env()?,
    };
    debug!(?config, "configuration loaded");

    let nickname = cli
        .nickname
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "sharelock".to_string());
    let identity = DeviceIdentity::load_or_create(&config.identity_path, &nickname)?;
    info!(device_id = %identity.device_id, nickname = %identity.nickname, "identity loaded");

    let (c, default_duration) = coordinator(&cli, &config, identity)?;
    let duration_or_default =
        |secs: Option<u64>| secs.map(Duration::from_secs).unwrap_or(default_duration);

    match cli.command {
        Commands::Info => print_info(&c)?,
        Commands::Status => {
            if c.is_locked()? {
                println!("locked");
                std::process::exit(1);
            }
            println!("free");
        }
        Commands::Acquire { duration, operation } => {
            match c.acquire(duration_or_default(duration), &operation)? {
                AcquireOutcome::Acquired(record) => println!("acquired: {}", record),
                AcquireOutcome::Busy(record) => anyhow::bail!("busy: {}", record),
                AcquireOutcome::StaleDetected(Some(record)) => {
                    anyhow::bail!("stale lease found ({}); use force-acquire to override", record)
                }
                AcquireOutcome::StaleDetected(None) => {
                    anyhow::bail!("lease file is unreadable; use force-acquire to override")
                }
            }
        }
        Commands::ForceAcquire { duration, operation } => {
            let record = c.force_acquire(duration_or_default(duration), &operation)?;
            println!("forced: {}", record);
        }
        Commands::Heartbeat => match c.heartbeat()? {
            HeartbeatOutcome::Updated(record) => println!("refreshed: {}", record),
            HeartbeatOutcome::NotOwner(record) => anyhow::bail!("not the holder: {}", record),
            HeartbeatOutcome::NotFound => anyhow::bail!("no lease to refresh"),
        },
        Commands::Release => match c.release()? {
            ReleaseOutcome::Released => println!("released"),
            ReleaseOutcome::AlreadyUnlocked => println!("already unlocked"),
            ReleaseOutcome::NotOwner(record) => anyhow::bail!("not the holder: {}", record),
        },
        Commands::Run { duration, yes, command } => {
            run_command(c, &config, duration_or_default(duration), yes, command).await?
        }
    }

    Ok(())
}
