use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn log_file_name(date: NaiveDate) -> String {
    format!("fundex_{}.log", date.format("%Y%m%d"))
}

/// Console plus `log_dir/fundex_<YYYYMMDD>.log`, filtered by `RUST_LOG` (default `info`).
pub fn init_logging(log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let path = log_dir.join(log_file_name(Local::now().date_naive()));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .with(filter)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(path)
}
