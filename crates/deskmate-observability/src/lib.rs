//! Process logging for the engine and the CLI: a console layer on stderr, a daily JSONL file
//! under `<state_dir>/logs`, and one structured event shape for everything that matters to an
//! operator (turns, tool calls, startup).

use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "deskmate.obs";
const LOG_SUFFIX: &str = "jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }

    /// Files are named `deskmate.<process>.YYYY-MM-DD.jsonl`.
    fn log_prefix(self) -> String {
        format!("deskmate.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// One operator-facing event. Empty fields are written as empty strings so every JSONL record
/// has the same keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub correlation_id: Option<&'a str>,
    pub thread_id: Option<&'a str>,
    pub tool_name: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

macro_rules! obs_event {
    ($level:expr, $process:expr, $event:expr) => {
        tracing::event!(
            target: OBS_TARGET,
            $level,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            correlation_id = $event.correlation_id.unwrap_or_default(),
            thread_id = $event.thread_id.unwrap_or_default(),
            tool_name = $event.tool_name.unwrap_or_default(),
            model_id = $event.model_id.unwrap_or_default(),
            status = $event.status.unwrap_or_default(),
            error_code = $event.error_code.unwrap_or_default(),
            detail = $event.detail.unwrap_or_default(),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        obs_event!(Level::ERROR, process, event);
    } else if level == Level::WARN {
        obs_event!(Level::WARN, process, event);
    } else if level == Level::INFO {
        obs_event!(Level::INFO, process, event);
    } else {
        obs_event!(Level::DEBUG, process, event);
    }
}

/// Stands in for text that may hold credentials or private notes: its length and a hash, so
/// two log lines can still be matched up.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted chars={} hash={}]",
        trimmed.chars().count(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info` filter. Calling it a
/// second time keeps the first subscriber. The returned guard must outlive the process's work,
/// or buffered file lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let pruned_files = prune_expired_logs(
        logs_dir,
        process,
        retention_days,
        Utc::now().date_naive(),
    )?;

    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(process.log_prefix())
        .filename_suffix(LOG_SUFFIX)
        .build(logs_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    // stdout carries `run` output
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Ok((
        guard,
        LoggingInitInfo {
            process,
            logs_dir: logs_dir.to_path_buf(),
            retention_days,
            pruned_files,
            initialized_at: Utc::now(),
        },
    ))
}

fn log_file_date(file_name: &str, process: ProcessKind) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(&process.log_prefix())?
        .strip_prefix('.')?
        .strip_suffix(LOG_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Deletes this process's log files dated more than `retention_days` before `today`. Files of
/// other processes and files that do not follow the naming scheme are left alone.
fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    let keep_from = today - chrono::Days::new(retention_days);
    let expired = fs::read_dir(logs_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| log_file_date(name, process))
                .is_some_and(|date| date < keep_from)
        })
        .collect::<Vec<_>>();

    let mut removed = 0;
    for path in expired {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => eprintln!("could not remove old log {}: {err}", path.display()),
        }
    }
    Ok(removed)
}
