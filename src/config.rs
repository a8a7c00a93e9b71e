use anyhow::{Result, anyhow};
use std::path::PathBuf;

/// Scheduling model for the gateway runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerMode {
    /// Multi-threaded runtime with the default thread count.
    Auto,
    /// Multi-threaded runtime sized by `--threads` / `--workers`.
    Threaded,
    /// Single-threaded (current-thread) runtime.
    Async,
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub mode: ServerMode,
    pub workers: usize,
    pub threads: usize,
    pub tokens_path: PathBuf,
    pub scratch_dir: Option<PathBuf>,
}

impl ServeConfig {
    pub fn new(
        host: String,
        port: u16,
        mode: ServerMode,
        workers: usize,
        threads: usize,
        tokens_path: PathBuf,
        scratch_dir: Option<PathBuf>,
    ) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(anyhow!("bind host must not be empty"));
        }
        if port == 0 {
            return Err(anyhow!("port must be non-zero"));
        }

        Ok(Self {
            host,
            port,
            mode,
            workers,
            threads,
            tokens_path,
            scratch_dir,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Runtime sizing: `--threads` wins, then `--workers`, else the tokio
    /// default.
    pub fn worker_threads(&self) -> Option<usize> {
        if self.threads > 0 {
            Some(self.threads)
        } else if self.workers > 0 {
            Some(self.workers)
        } else {
            None
        }
    }
}
