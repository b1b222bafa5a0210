use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Result;

/// Keeps the non-blocking file writer alive; drop it on shutdown to flush.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. When `log_dir` is
/// given, events are also appended to `vmedia-boot.log` inside it.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<LogGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_guard = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, "vmedia-boot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .ok();
            None
        }
    };
    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Append-only audit trail of completed virtual media phases.
#[derive(Debug)]
pub struct OpsLogger {
    file: Mutex<std::fs::File>,
}

impl OpsLogger {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn log_line(&self, action: &str, detail: impl AsRef<str>) -> Result<()> {
        let ts = Utc::now().to_rfc3339();
        let line = format!("{ts} [{action}] {}\n", detail.as_ref());
        let mut guard = self.file.lock().expect("logger mutex poisoned");
        guard.write_all(line.as_bytes())?;
        Ok(())
    }
}
