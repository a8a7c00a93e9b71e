use std::path::Path;
use std::time::Duration;

use rand::RngExt;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::{USER_AGENT, WEB_ORIGIN, WoError, WoResult};
use crate::crypto::EnvelopeCodec;
use crate::protocol::{CHANNEL_WO_HOME, compact_json};

/// Chunk endpoint; plain multipart, no AES envelope.
pub const UPLOAD_URL: &str = "https://tjupload.pan.wo.cn/openapi/client/upload2C";

/// Routing tag carried in the chunk form, distinct from the control plane.
pub const CHANNEL_WO_CLOUD: &str = "wocloud";

pub const CHUNK_BYTES: u64 = 32 * 1024 * 1024;

const UPLOAD_ATTEMPTS: u32 = 3;
const RETRY_STATUS: [u16; 5] = [429, 500, 502, 503, 504];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Extension class the upstream wants inside `fileInfo`. Matching is
/// case-insensitive on the final dot-suffix.
pub fn file_kind(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv" | "webm" => "video",
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" => "image",
        "mp3" | "wav" | "flac" | "aac" | "ogg" => "audio",
        "pdf" | "doc" | "docx" | "txt" | "xlsx" | "ppt" | "pptx" => "text",
        "zip" | "rar" | "7z" | "tar" | "gz" => "zip",
        _ => "other",
    }
}

/// Number of parts a file of `size` bytes decomposes into. Empty files are
/// sent as a single empty chunk so they still materialise upstream.
pub fn chunk_count(size: u64) -> u64 {
    if size == 0 { 1 } else { size.div_ceil(CHUNK_BYTES) }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<UploadData>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    #[serde(default)]
    fid: Option<String>,
}

/// Chunked uploader for one account token. Keeps its own connection pool;
/// chunk-level reconnection dominates upload time otherwise.
pub struct ChunkUploader {
    http: reqwest::Client,
    token: String,
    codec: EnvelopeCodec,
}

impl ChunkUploader {
    pub fn new(token: &str) -> WoResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(WEB_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static("https://pan.wo.cn/"));

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;

        Ok(Self {
            http,
            token: token.to_string(),
            codec: EnvelopeCodec::with_token(token),
        })
    }

    /// Upload one local file into the remote directory, reporting whole
    /// percentages at chunk boundaries. Returns the upstream file handle.
    ///
    /// The `fid` shows up on whichever part the upstream feels like, so every
    /// part's value is adopted and the terminal part wins.
    pub async fn upload(
        &self,
        path: &Path,
        directory_id: &str,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> WoResult<String> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| WoError::Decode(format!("{}: no file name", path.display())))?;
        let file_size = tokio::fs::metadata(path).await?.len();
        let total_parts = chunk_count(file_size);

        let unique_id = format!(
            "{}_{}",
            chrono::Utc::now().timestamp_millis(),
            random_letters(6)
        );
        let batch_no = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        let file_info = serde_json::json!({
            "spaceType": "0",
            "directoryId": directory_id,
            "batchNo": batch_no,
            "fileName": file_name,
            "fileSize": file_size,
            "fileType": file_kind(&file_name),
        });
        let file_info = self.codec.encrypt(&compact_json(&file_info), CHANNEL_WO_HOME);

        debug!(
            file = %file_name,
            size = %bytesize::ByteSize::b(file_size),
            parts = total_parts,
            "starting chunked upload"
        );

        let mut file = tokio::fs::File::open(path).await?;
        let mut uploaded: u64 = 0;
        let mut fid = String::new();

        for part_index in 1..=total_parts {
            let part_size = (file_size - uploaded).min(CHUNK_BYTES);
            let mut chunk = vec![0u8; part_size as usize];
            tokio::io::AsyncReadExt::read_exact(&mut file, &mut chunk).await?;

            let frame = PartFrame {
                unique_id: &unique_id,
                file_name: &file_name,
                file_info: &file_info,
                directory_id,
                file_size,
                total_parts,
                part_index,
                part_size,
            };
            if let Some(part_fid) = self.send_part(&frame, chunk).await? {
                fid = part_fid;
            }

            uploaded += part_size;
            let pct = if file_size == 0 {
                100
            } else {
                (uploaded * 100 / file_size) as u8
            };
            on_progress(pct);
        }

        if fid.is_empty() {
            return Err(WoError::Decode(
                "upload finished but upstream returned no file id".into(),
            ));
        }
        Ok(fid)
    }

    /// One chunk: up to three attempts, exponential back-off, retry on
    /// transport errors and HTTP 429/500/502/503/504. Returns the `fid`
    /// when this part's response carries one.
    async fn send_part(&self, frame: &PartFrame<'_>, chunk: Vec<u8>) -> WoResult<Option<String>> {
        let part_tag = format!("part {}/{}", frame.part_index, frame.total_parts);

        for attempt in 1..=UPLOAD_ATTEMPTS {
            let file_part = Part::bytes(chunk.clone())
                .file_name(frame.file_name.to_string())
                .mime_str("application/octet-stream")?;
            let form = Form::new()
                .text("uniqueId", frame.unique_id.to_string())
                .text("accessToken", self.token.clone())
                .text("fileName", frame.file_name.to_string())
                .text("psToken", "undefined")
                .text("fileSize", frame.file_size.to_string())
                .text("totalPart", frame.total_parts.to_string())
                .text("channel", CHANNEL_WO_CLOUD)
                .text("directoryId", frame.directory_id.to_string())
                .text("fileInfo", frame.file_info.to_string())
                .text("partSize", frame.part_size.to_string())
                .text("partIndex", frame.part_index.to_string())
                .part("file", file_part);

            let response = match self.http.post(UPLOAD_URL).multipart(form).send().await {
                Ok(response) => response,
                Err(err) if attempt < UPLOAD_ATTEMPTS => {
                    warn!(%part_tag, attempt, error = %err, "chunk send failed, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                Err(err) => return Err(WoError::Transport(format!("{part_tag}: {err}"))),
            };

            let status = response.status();
            if RETRY_STATUS.contains(&status.as_u16()) && attempt < UPLOAD_ATTEMPTS {
                warn!(%part_tag, attempt, %status, "retriable upstream status");
                tokio::time::sleep(backoff(attempt)).await;
                continue;
            }
            if !status.is_success() {
                return Err(WoError::Transport(format!("{part_tag}: HTTP {status}")));
            }

            let parsed: UploadResponse = response
                .json()
                .await
                .map_err(|err| WoError::Decode(format!("{part_tag}: {err}")))?;
            if parsed.code != "0000" {
                return Err(WoError::Api {
                    code: parsed.code,
                    desc: format!("{part_tag}: {}", parsed.msg.unwrap_or_default()),
                });
            }
            return Ok(parsed
                .data
                .and_then(|data| data.fid)
                .filter(|fid| !fid.is_empty()));
        }

        Err(WoError::Transport(format!("{part_tag}: retries exhausted")))
    }
}

struct PartFrame<'a> {
    unique_id: &'a str,
    file_name: &'a str,
    file_info: &'a str,
    directory_id: &'a str,
    file_size: u64,
    total_parts: u64,
    part_index: u64,
    part_size: u64,
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1))
}

fn random_letters(count: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::rng();
    (0..count)
        .map(|_| LETTERS[rng.random_range(0..LETTERS.len())] as char)
        .collect()
}
