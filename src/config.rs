use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Speedwatch: unattended network speed measurement with local history.
#[derive(Parser, Debug, Clone)]
#[command(name = "speedwatch")]
pub struct CliArgs {
    /// Path to the measurement configuration document (JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Path to the results database
    #[arg(long = "db")]
    pub db: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Measurement endpoint in the form name=url (repeatable)
    #[arg(long = "server")]
    pub servers: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a single speed test
    Run,
    /// Run speed tests on a fixed interval until interrupted
    Schedule {
        #[arg(long = "interval-minutes", default_value_t = DEFAULT_SCHEDULE_INTERVAL_MINUTES)]
        interval_minutes: u64,
        /// Stop automatically after this many minutes
        #[arg(long = "max-runtime-minutes")]
        max_runtime_minutes: Option<u64>,
        /// Run the first test immediately instead of after one interval
        #[arg(long = "immediate")]
        immediate: bool,
    },
    /// Show aggregate statistics
    Stats {
        #[arg(long = "days", default_value_t = DEFAULT_STATS_DAYS)]
        days: u32,
    },
    /// List stored results
    History {
        #[arg(long = "days")]
        days: Option<u32>,
        /// Include invalid (failed or implausible) runs
        #[arg(long = "failures")]
        failures: bool,
        /// Show at most this many of the newest records
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Export stored results
    Export {
        #[arg(long = "format", value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long = "days")]
        days: Option<u32>,
    },
    /// Import a previous CSV or JSON export
    Import { path: PathBuf },
    /// Delete results older than the retention window
    Cleanup {
        #[arg(long = "keep-days", default_value_t = DEFAULT_KEEP_DAYS)]
        keep_days: u32,
    },
    /// Show database information
    Info,
    /// Validate a configuration document
    ValidateConfig { path: PathBuf },
    /// Write a configuration document with default values
    InitConfig,
    /// Print the configuration schema
    Schema,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

// File names
pub const CONFIG_FILE_NAME: &str = "speedtest_config.json";
pub const DATABASE_FILE_NAME: &str = "speedtest_history.db";
pub const APP_DIR_NAME: &str = "speedwatch";

// Storage constants
pub const DB_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);
pub const EXPORT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_KEEP_DAYS: u32 = 365;
pub const DEFAULT_STATS_DAYS: u32 = 30;

// Engine constants
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const ATTEMPT_GRACE: Duration = Duration::from_secs(5);

// Runner constants
pub const RESULT_CHANNEL_CAPACITY: usize = 4;
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// Scheduler constants
pub const DEFAULT_SCHEDULE_INTERVAL_MINUTES: u64 = 60;
pub const SCHEDULER_MAX_WAIT_SLICE: Duration = Duration::from_secs(1);
pub const SCHEDULER_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const SCHEDULER_FIRE_HISTORY: usize = 100;

// Default HTTP measurement endpoints: (name, base url)
pub const DEFAULT_SERVERS: &[(&str, &str)] = &[("cloudflare", "https://speed.cloudflare.com")];
pub const DOWNLOAD_BYTES: u64 = 25_000_000;
pub const UPLOAD_BYTES: u64 = 10_000_000;
pub const LATENCY_SAMPLES: usize = 3;

/// Resolved process-level paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub database: PathBuf,
}

impl AppPaths {
    pub fn from_args(args: &CliArgs) -> Self {
        let config_file = args.config.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .map(|d| d.join(APP_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from("."))
                .join(CONFIG_FILE_NAME)
        });
        let database = args.db.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join(APP_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DATABASE_FILE_NAME)
        });
        AppPaths {
            config_file,
            database,
        }
    }
}
