use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LINES_PER_WRITE: i64 = 10_000;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("missed log io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot expand ~ without a HOME directory")]
    NoHome,
}

/// Append-only record of ids the crawl gave up on.
pub trait MissedLedger: Send + Sync {
    /// Records every id in `[start, end)`.
    fn record_missed_range<'a>(
        &'a self,
        start: i64,
        end: i64,
    ) -> BoxFuture<'a, Result<(), LedgerError>>;

    fn record_missed<'a>(&'a self, instance_id: i64) -> BoxFuture<'a, Result<(), LedgerError>> {
        self.record_missed_range(instance_id, instance_id + 1)
    }
}

impl<T> MissedLedger for Arc<T>
where
    T: MissedLedger + ?Sized,
{
    fn record_missed_range<'a>(
        &'a self,
        start: i64,
        end: i64,
    ) -> BoxFuture<'a, Result<(), LedgerError>> {
        (**self).record_missed_range(start, end)
    }
}

/// Writes one id per line to a local file.
pub struct FileMissedLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileMissedLedger {
    /// Expands a leading `~` and creates missing parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = expand_home(path.as_ref(), std::env::var_os("HOME").map(PathBuf::from))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LedgerError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, start: i64, end: i64) -> Result<(), LedgerError> {
        if start >= end {
            return Ok(());
        }
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;

        let mut chunk_start = start;
        while chunk_start < end {
            let chunk_end = end.min(chunk_start.saturating_add(LINES_PER_WRITE));
            let mut lines = String::new();
            for id in chunk_start..chunk_end {
                let _ = writeln!(lines, "{id}");
            }
            file.write_all(lines.as_bytes()).await.map_err(io_err)?;
            chunk_start = chunk_end;
        }
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

impl MissedLedger for FileMissedLedger {
    fn record_missed_range<'a>(
        &'a self,
        start: i64,
        end: i64,
    ) -> BoxFuture<'a, Result<(), LedgerError>> {
        Box::pin(self.append(start, end))
    }
}

fn expand_home(path: &Path, home: Option<PathBuf>) -> Result<PathBuf, LedgerError> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home.ok_or(LedgerError::NoHome)?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}
