use anyhow::{bail, Context};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use speedwatch::config::{
    AppPaths, CliArgs, Command, ExportFormat, CANCEL_POLL_INTERVAL, SCHEDULER_MAX_WAIT_SLICE,
    SCHEDULER_SHUTDOWN_GRACE, WORKER_JOIN_TIMEOUT,
};
use speedwatch::history::{ResultStore, StoredRecord};
use speedwatch::measurement::http::{HttpEndpoint, HttpProvider};
use speedwatch::measurement::{SpeedTestEngine, TestOutcome};
use speedwatch::runner::AsyncRunner;
use speedwatch::scheduler::Scheduler;
use speedwatch::settings::SpeedTestConfig;
use speedwatch::validator;

// The blocking HTTP client must not live inside an async runtime, so main
// stays synchronous and tokio only drives the signal watcher thread.
fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let _log_guard = init_tracing(args.log_file.as_deref())?;
    let paths = AppPaths::from_args(&args);

    match &args.command {
        Command::Run => run_once(&args, &paths),
        Command::Schedule {
            interval_minutes,
            max_runtime_minutes,
            immediate,
        } => run_schedule(&args, &paths, *interval_minutes, *max_runtime_minutes, *immediate),
        Command::Stats { days } => {
            let store = ResultStore::open(&paths.database)?;
            let stats = store.statistics(Some(*days))?;
            if stats.count == 0 {
                println!("No valid results in the last {} days", days);
                return Ok(());
            }
            println!("Results in the last {} days: {}", days, stats.count);
            println!(
                "First: {}  Last: {}",
                stats.first_test.as_deref().unwrap_or("-"),
                stats.last_test.as_deref().unwrap_or("-")
            );
            for (label, unit, metric) in [
                ("Download", "Mbps", &stats.download),
                ("Upload", "Mbps", &stats.upload),
                ("Ping", "ms", &stats.ping),
            ] {
                if let Some(m) = metric {
                    println!(
                        "{:<9} min {:>8.2}  max {:>8.2}  mean {:>8.2}  median {:>8.2} {}",
                        label, m.min, m.max, m.mean, m.median, unit
                    );
                }
            }
            Ok(())
        }
        Command::History {
            days,
            failures,
            limit,
        } => {
            let store = ResultStore::open(&paths.database)?;
            let mut records = match (*failures, *days, *limit) {
                (false, None, Some(n)) => store.recent(n)?,
                (false, since, _) => store.query(since)?,
                (true, since, _) => store.failures(since)?,
            };
            if let Some(n) = limit {
                records.truncate(*n);
            }
            for record in &records {
                print_record(record);
            }
            println!("{} record(s)", records.len());
            Ok(())
        }
        Command::Export {
            format,
            output,
            days,
        } => {
            let store = ResultStore::open(&paths.database)?;
            let count = match format {
                ExportFormat::Csv => store.export_csv(output, *days)?,
                ExportFormat::Json => store.export_json(output, *days)?,
            };
            println!("Exported {} result(s) to {}", count, output.display());
            Ok(())
        }
        Command::Import { path } => {
            let store = ResultStore::open(&paths.database)?;
            let count = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("csv") => store.import_csv(path)?,
                Some(ext) if ext.eq_ignore_ascii_case("json") => store.import_json(path)?,
                _ => bail!("Cannot tell the format of {:?}; expected .csv or .json", path),
            };
            println!("Imported {} result(s)", count);
            Ok(())
        }
        Command::Cleanup { keep_days } => {
            let store = ResultStore::open(&paths.database)?;
            let deleted = store.cleanup(*keep_days)?;
            println!("Deleted {} result(s) older than {} days", deleted, keep_days);
            Ok(())
        }
        Command::Info => {
            let store = ResultStore::open(&paths.database)?;
            let info = store.database_info()?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            if let Some(record) = store.cached_latest()? {
                print!("Latest valid: ");
                print_record(&record);
            }
            Ok(())
        }
        Command::ValidateConfig { path } => {
            if !path.exists() {
                bail!("Configuration file not found: {}", path.display());
            }
            let (config, warnings) = validator::load_config_file(path);
            if warnings.is_empty() {
                println!("Configuration is valid");
            } else {
                for w in &warnings {
                    println!("warning: {}", w);
                }
            }
            println!("{}", serde_json::to_string_pretty(&config.to_document())?);
            if !warnings.is_empty() {
                bail!("{} configuration problem(s) found", warnings.len());
            }
            Ok(())
        }
        Command::InitConfig => {
            validator::write_sample_config(&paths.config_file)
                .with_context(|| format!("writing {}", paths.config_file.display()))?;
            println!("Wrote {}", paths.config_file.display());
            Ok(())
        }
        Command::Schema => {
            println!("{}", validator::schema_documentation());
            Ok(())
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "speedwatch=info".into());

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .context("log file path has no file name")?;
    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

fn load_config(paths: &AppPaths) -> SpeedTestConfig {
    let (config, warnings) = validator::load_config_file(&paths.config_file);
    for w in &warnings {
        warn!("Config: {}", w);
    }
    config
}

fn build_engine(args: &CliArgs, config: SpeedTestConfig) -> anyhow::Result<SpeedTestEngine> {
    let timeout = config.attempt_timeout();
    let provider = if args.servers.is_empty() {
        HttpProvider::with_default_servers(timeout)?
    } else {
        let endpoints = args
            .servers
            .iter()
            .map(|s| HttpEndpoint::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        HttpProvider::new(endpoints, timeout)?
    };
    Ok(SpeedTestEngine::new(Arc::new(provider), config))
}

fn open_store(paths: &AppPaths, config: &SpeedTestConfig) -> anyhow::Result<Option<ResultStore>> {
    if !config.save_results_to_database {
        info!("Result storage disabled by configuration");
        return Ok(None);
    }
    Ok(Some(ResultStore::open(&paths.database)?))
}

fn run_once(args: &CliArgs, paths: &AppPaths) -> anyhow::Result<()> {
    let config = load_config(paths);
    let store = open_store(paths, &config)?;
    let engine = Arc::new(build_engine(args, config)?);
    let mut runner = AsyncRunner::new(engine);

    let cancel = runner.cancel_token();
    spawn_signal_watcher(move || cancel.cancel())?;

    runner.start()?;
    let outcome = loop {
        while let Some(progress) = runner.poll_progress() {
            println!("{}", progress);
        }
        if let Some(outcome) = runner.wait_result(CANCEL_POLL_INTERVAL) {
            break outcome;
        }
    };
    runner.shutdown(WORKER_JOIN_TIMEOUT);

    print_outcome(&outcome);
    if !outcome.is_cancelled() {
        if let Some(store) = &store {
            let id = store.save(&outcome.result)?;
            store.cache_latest(&outcome.result, id)?;
        }
    }
    if !outcome.is_success() {
        bail!("Speed test did not succeed: {}", outcome.classification());
    }
    Ok(())
}

fn run_schedule(
    args: &CliArgs,
    paths: &AppPaths,
    interval_minutes: u64,
    max_runtime_minutes: Option<u64>,
    immediate: bool,
) -> anyhow::Result<()> {
    let config = load_config(paths);
    let store = open_store(paths, &config)?;
    let engine = Arc::new(build_engine(args, config)?);

    let mut handle = Scheduler::new(engine, store, Duration::from_secs(interval_minutes * 60))?
        .with_max_runtime(max_runtime_minutes.map(|m| Duration::from_secs(m * 60)))
        .with_immediate(immediate)
        .spawn()?;

    let shutdown = handle.shutdown_event();
    let on_signal = shutdown.clone();
    spawn_signal_watcher(move || on_signal.set())?;

    while !handle.is_finished() {
        if shutdown.wait_timeout(SCHEDULER_MAX_WAIT_SLICE) {
            break;
        }
    }
    let status = handle.stop(SCHEDULER_SHUTDOWN_GRACE);
    println!(
        "Scheduler stopped: {} cycle(s), {} completed, {} failed, {} missed slot(s), ran {:.0}s",
        status.cycles,
        status.tests_completed,
        status.tests_failed,
        status.missed_slots,
        status.runtime_seconds
    );
    Ok(())
}

/// Run `on_signal` once SIGINT or SIGTERM arrives.
fn spawn_signal_watcher<F>(on_signal: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            if rt.block_on(shutdown_signal()) {
                on_signal();
            }
        })?;
    Ok(())
}

async fn shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return tokio::signal::ctrl_c().await.is_ok();
            }
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    return false;
                }
                info!("Received SIGINT, shutting down");
            }
            _ = term.recv() => info!("Received SIGTERM, shutting down"),
        }
        true
    }
    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                true
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                false
            }
        }
    }
}

fn print_outcome(outcome: &TestOutcome) {
    println!(
        "Result: {} ({}) after {} attempt(s)",
        outcome.classification(),
        outcome.reason,
        outcome.attempts
    );
    let r = &outcome.result;
    if outcome.is_success() || r.download_mbps > 0.0 {
        println!(
            "  Download {:.2} Mbps  Upload {:.2} Mbps  Ping {:.1} ms  Server {}",
            r.download_mbps, r.upload_mbps, r.ping_ms, r.server_info
        );
    }
    for w in &r.warnings {
        println!("  warning: {}", w);
    }
}

fn print_record(record: &StoredRecord) {
    println!(
        "#{:<6} {}  down {:>8.2} Mbps  up {:>8.2} Mbps  ping {:>7.1} ms  {}{}",
        record.id,
        record.test_date,
        record.download_mbps,
        record.upload_mbps,
        record.ping_ms,
        record.server_info,
        if record.is_valid { "" } else { "  [invalid]" }
    );
}
