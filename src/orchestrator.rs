use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::client::{WoClient, WoResult};
use crate::upload::ChunkUploader;

/// Upstream tolerates very little concurrency per account; two workers is
/// already pushing it.
pub const MAX_PARALLEL: usize = 2;

/// How much of an upstream error ends up in the per-item status line.
const ERROR_PREVIEW_CHARS: usize = 50;

/// One file queued for upload. `relative` uses forward-slash segments no
/// matter the platform.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub absolute: PathBuf,
    pub relative: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Waiting,
    Uploading,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemStatus {
    pub state: ItemState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live view of a running job, keyed by relative path. UIs poll this; the
/// orchestrator only ever moves items forward (waiting → uploading →
/// success/failed).
#[derive(Debug, Default)]
pub struct JobStatus {
    entries: DashMap<String, ItemStatus>,
}

impl JobStatus {
    fn init(items: &[UploadItem]) -> Self {
        let status = Self::default();
        for item in items {
            status.entries.insert(
                item.relative.clone(),
                ItemStatus {
                    state: ItemState::Waiting,
                    progress: 0,
                    error: None,
                },
            );
        }
        status
    }

    fn set_state(&self, relative: &str, state: ItemState) {
        if let Some(mut entry) = self.entries.get_mut(relative) {
            entry.state = state;
        }
    }

    fn set_progress(&self, relative: &str, progress: u8) {
        if let Some(mut entry) = self.entries.get_mut(relative) {
            entry.progress = progress;
        }
    }

    fn finish(&self, relative: &str, result: Result<(), String>) {
        if let Some(mut entry) = self.entries.get_mut(relative) {
            match result {
                Ok(()) => {
                    entry.state = ItemState::Success;
                    entry.progress = 100;
                }
                Err(message) => {
                    entry.state = ItemState::Failed;
                    entry.error = Some(message);
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(String, ItemStatus)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// `(completed, total)` across the whole job.
    pub fn overall(&self) -> (usize, usize) {
        let total = self.entries.len();
        let completed = self
            .entries
            .iter()
            .filter(|entry| matches!(entry.state, ItemState::Success | ItemState::Failed))
            .count();
        (completed, total)
    }
}

/// Terminal outcome for one item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub filename: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobReport {
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<ItemReport>,
}

impl JobReport {
    pub fn summary(&self) -> String {
        format!(
            "upload finished: {}/{} succeeded",
            self.succeeded,
            self.results.len()
        )
    }
}

/// Turn a local path into the job's item list. A regular file becomes a
/// single item named by its basename; a directory is walked in sorted
/// order so two runs produce the same list.
pub fn collect_items(local: &Path) -> anyhow::Result<Vec<UploadItem>> {
    let metadata = std::fs::metadata(local)?;

    if metadata.is_file() {
        let relative = local
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("{}: no file name", local.display()))?
            .to_string_lossy()
            .to_string();
        return Ok(vec![UploadItem {
            absolute: local.to_path_buf(),
            relative,
            size: metadata.len(),
        }]);
    }

    let mut items = Vec::new();
    for entry in WalkDir::new(local).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(local)?
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        items.push(UploadItem {
            absolute: entry.path().to_path_buf(),
            relative,
            size: entry.metadata()?.len(),
        });
    }
    Ok(items)
}

/// Drives one upload job: materialises the remote directory tree, then runs
/// per-file chunk uploads with bounded parallelism. Per-file failures are
/// isolated; only a dying worker task drops the job into sequential mode.
pub struct UploadJob {
    client: Arc<WoClient>,
    uploader: Arc<ChunkUploader>,
    items: Vec<UploadItem>,
    dir_cache: Mutex<HashMap<String, String>>,
    status: Arc<JobStatus>,
}

impl UploadJob {
    pub fn new(
        client: Arc<WoClient>,
        uploader: Arc<ChunkUploader>,
        items: Vec<UploadItem>,
        remote_parent: &str,
    ) -> Arc<Self> {
        let status = Arc::new(JobStatus::init(&items));
        let mut cache = HashMap::new();
        cache.insert(String::new(), remote_parent.to_string());
        Arc::new(Self {
            client,
            uploader,
            items,
            dir_cache: Mutex::new(cache),
            status,
        })
    }

    pub fn status(&self) -> Arc<JobStatus> {
        self.status.clone()
    }

    pub async fn run(self: Arc<Self>) -> JobReport {
        let total = self.items.len();
        let mut results: Vec<Option<ItemReport>> = (0..total).map(|_| None).collect();

        if total > 0 {
            let workers = total.min(MAX_PARALLEL);
            info!(files = total, workers, "starting upload job");

            let semaphore = Arc::new(Semaphore::new(workers));
            let mut set = JoinSet::new();
            for (idx, item) in self.items.iter().cloned().enumerate() {
                let job = self.clone();
                let semaphore = semaphore.clone();
                set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    (idx, job.upload_one(&item).await)
                });
            }

            let mut executor_failed = false;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, report)) => results[idx] = Some(report),
                    Err(err) => {
                        executor_failed = true;
                        warn!(error = %err, "upload worker died");
                    }
                }
            }

            if executor_failed {
                warn!("parallel upload degraded, finishing remaining files sequentially");
                for (idx, item) in self.items.iter().enumerate() {
                    if results[idx].is_none() {
                        results[idx] = Some(self.upload_one(item).await);
                    }
                }
            }
        }

        let results: Vec<ItemReport> = results.into_iter().flatten().collect();
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        info!(succeeded, failed, "upload job finished");
        JobReport {
            succeeded,
            failed,
            results,
        }
    }

    async fn upload_one(&self, item: &UploadItem) -> ItemReport {
        self.status.set_state(&item.relative, ItemState::Uploading);
        debug!(
            file = %item.relative,
            size = %bytesize::ByteSize::b(item.size),
            "uploading"
        );

        let directory_id = match self.ensure_remote_dir(&item.relative).await {
            Ok(id) => id,
            Err(err) => {
                let message = format!("directory creation failed: {}", preview(&err.to_string()));
                self.status.finish(&item.relative, Err(message.clone()));
                return ItemReport {
                    filename: item.relative.clone(),
                    success: false,
                    message,
                    fid: None,
                };
            }
        };

        let status = self.status.clone();
        let relative = item.relative.clone();
        let outcome = self
            .uploader
            .upload(&item.absolute, &directory_id, move |pct| {
                status.set_progress(&relative, pct);
            })
            .await;

        match outcome {
            Ok(fid) => {
                self.status.finish(&item.relative, Ok(()));
                ItemReport {
                    filename: item.relative.clone(),
                    success: true,
                    message: "uploaded".to_string(),
                    fid: Some(fid),
                }
            }
            Err(err) => {
                let message = preview(&err.to_string());
                self.status.finish(&item.relative, Err(message.clone()));
                ItemReport {
                    filename: item.relative.clone(),
                    success: false,
                    message,
                    fid: None,
                }
            }
        }
    }

    /// Resolve (creating as needed) the remote directory an item lands in.
    /// The whole segment walk holds the job mutex so items sharing a prefix
    /// never race to create the same directory; the cache is append-only.
    async fn ensure_remote_dir(&self, relative: &str) -> WoResult<String> {
        let mut cache = self.dir_cache.lock().await;
        let root = cache
            .get("")
            .cloned()
            .unwrap_or_else(|| crate::client::ROOT_DIRECTORY_ID.to_string());

        let Some((dir_path, _)) = relative.rsplit_once('/') else {
            return Ok(root);
        };

        let mut current = root;
        let mut prefix = String::new();
        for segment in dir_path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);

            if let Some(id) = cache.get(&prefix) {
                current = id.clone();
                continue;
            }
            let id = self.client.create_directory(&current, segment).await?;
            debug!(path = %prefix, id = %id, "created remote directory");
            cache.insert(prefix.clone(), id.clone());
            current = id;
        }
        Ok(current)
    }
}

fn preview(message: &str) -> String {
    if message.chars().count() <= ERROR_PREVIEW_CHARS {
        message.to_string()
    } else {
        let mut short: String = message.chars().take(ERROR_PREVIEW_CHARS).collect();
        short.push_str("...");
        short
    }
}
