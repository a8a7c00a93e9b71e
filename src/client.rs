use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::crypto::EnvelopeCodec;
use crate::protocol::{CHANNEL_WO_HOME, CLIENT_ID, Envelope, RawResponse};

pub const BASE_URL: &str = "https://panservice.mail.wo.cn";
pub const WEB_ORIGIN: &str = "https://pan.wo.cn";
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36 Edg/114.0.1823.37";

/// Identifier of the account root directory.
pub const ROOT_DIRECTORY_ID: &str = "0";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure kinds the adapter can surface. Nothing panics across this
/// boundary; the gateway maps each kind onto the legacy response shape.
#[derive(Debug, Error)]
pub enum WoError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("upstream status {status}: {msg}")]
    Envelope { status: String, msg: String },
    #[error("upstream rejected call ({code}): {desc}")]
    Api { code: String, desc: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for WoError {
    fn from(err: reqwest::Error) -> Self {
        WoError::Transport(err.to_string())
    }
}

pub type WoResult<T> = Result<T, WoError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// One entry of a remote listing. Directories carry `id`, files carry `fid`.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteNode {
    pub id: String,
    pub fid: String,
    pub name: String,
    pub size: u64,
    pub kind: NodeKind,
    pub create_time: String,
    pub file_type: String,
}

impl RemoteNode {
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    id: String,
    #[serde(default)]
    fid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type", default = "default_file_kind")]
    kind: i64,
    #[serde(rename = "createTime", default)]
    create_time: String,
    #[serde(rename = "fileType", default)]
    file_type: String,
}

fn default_file_kind() -> i64 {
    1
}

impl From<RawFile> for RemoteNode {
    fn from(raw: RawFile) -> Self {
        RemoteNode {
            id: raw.id,
            fid: raw.fid,
            name: raw.name,
            size: raw.size,
            kind: if raw.kind == 0 {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            create_time: raw.create_time,
            file_type: raw.file_type,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadLink {
    pub fid: String,
    pub url: String,
}

/// Typed operations over the dispatcher endpoint. One client wraps one
/// account token and the session headers the upstream insists on.
pub struct WoClient {
    http: reqwest::Client,
    token: String,
    codec: EnvelopeCodec,
}

impl WoClient {
    pub fn new(token: &str) -> WoResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ORIGIN, HeaderValue::from_static(WEB_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static("https://pan.wo.cn/"));
        headers.insert(
            "Accesstoken",
            HeaderValue::from_str(token)
                .map_err(|_| WoError::Transport("token is not a valid header value".into()))?,
        );

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(CONTROL_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            token: token.to_string(),
            codec: EnvelopeCodec::with_token(token),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// POST one framed operation and unwrap the decrypted `DATA` payload.
    async fn dispatch(&self, key: &str, param: serde_json::Value) -> WoResult<serde_json::Value> {
        let envelope = Envelope::new(&self.codec, CHANNEL_WO_HOME, key, Some(&param));
        let url = format!("{BASE_URL}/{CHANNEL_WO_HOME}/dispatcher");

        let response = self.http.post(&url).json(&envelope).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WoError::Transport(format!("HTTP {status}")));
        }

        let raw: RawResponse = response
            .json()
            .await
            .map_err(|err| WoError::Decode(format!("{key}: {err}")))?;
        if raw.status != "200" {
            return Err(WoError::Envelope {
                status: raw.status,
                msg: raw.msg.unwrap_or_default(),
            });
        }
        let rsp = raw
            .rsp
            .ok_or_else(|| WoError::Decode(format!("{key}: response has no RSP")))?;
        let code = rsp.code.unwrap_or_default();
        if code != "0000" {
            return Err(WoError::Api {
                code,
                desc: rsp.desc.unwrap_or_default(),
            });
        }

        match rsp.data {
            Some(serde_json::Value::String(ciphertext)) => {
                let plain = self.codec.decrypt(&ciphertext, CHANNEL_WO_HOME);
                serde_json::from_str(&plain)
                    .map_err(|err| WoError::Decode(format!("{key}: {err}")))
            }
            Some(value) => Ok(value),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// List the children of a directory; `"0"` is the account root.
    pub async fn list_children(&self, parent_id: &str) -> WoResult<Vec<RemoteNode>> {
        self.list_children_with(parent_id, 100, 1, "0").await
    }

    pub async fn list_children_with(
        &self,
        parent_id: &str,
        page_size: u32,
        sort_rule: u32,
        space_type: &str,
    ) -> WoResult<Vec<RemoteNode>> {
        let param = json!({
            "spaceType": space_type,
            "parentDirectoryId": parent_id,
            "pageNum": 0,
            "pageSize": page_size,
            "sortRule": sort_rule,
            "clientId": CLIENT_ID,
        });
        let data = self.dispatch("QueryAllFiles", param).await?;

        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            files: Vec<RawFile>,
        }
        let listing: Listing = serde_json::from_value(data)
            .map_err(|err| WoError::Decode(format!("QueryAllFiles: {err}")))?;
        Ok(listing.files.into_iter().map(RemoteNode::from).collect())
    }

    /// Resolve direct download URLs for a set of file handles. The V2 call
    /// is primary; when the upstream rejects it, retry once through the
    /// legacy operation.
    pub async fn get_download_urls(&self, fids: &[String]) -> WoResult<Vec<DownloadLink>> {
        match self.download_urls_v2(fids).await {
            Ok(links) => Ok(links),
            Err(WoError::Api { code, desc }) => {
                warn!(code, desc, "GetDownloadUrlV2 rejected, trying legacy operation");
                self.download_urls_legacy(fids).await
            }
            Err(err) => Err(err),
        }
    }

    async fn download_urls_v2(&self, fids: &[String]) -> WoResult<Vec<DownloadLink>> {
        let param = json!({
            "type": "1",
            "fidList": fids,
            "clientId": CLIENT_ID,
        });
        let data = self.dispatch("GetDownloadUrlV2", param).await?;
        parse_download_list(data)
    }

    async fn download_urls_legacy(&self, fids: &[String]) -> WoResult<Vec<DownloadLink>> {
        let param = json!({
            "fidList": fids,
            "clientId": CLIENT_ID,
            "spaceType": "0",
        });
        let data = self.dispatch("GetDownloadUrl", param).await?;
        parse_download_list(data)
    }

    /// Create one directory under `parent_id`, returning the new handle.
    pub async fn create_directory(&self, parent_id: &str, name: &str) -> WoResult<String> {
        self.create_directory_in("0", parent_id, name, "").await
    }

    pub async fn create_directory_in(
        &self,
        space_type: &str,
        parent_id: &str,
        name: &str,
        family_id: &str,
    ) -> WoResult<String> {
        let mut param = json!({
            "spaceType": space_type,
            "parentDirectoryId": parent_id,
            "directoryName": name,
            "clientId": CLIENT_ID,
        });
        if !family_id.is_empty() {
            param["familyId"] = json!(family_id);
        }
        let data = self.dispatch("CreateDirectory", param).await?;

        match data.get("id") {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
            _ => Err(WoError::Decode(
                "CreateDirectory: response has no directory id".into(),
            )),
        }
    }

    /// Delete directories and/or files in one call.
    pub async fn delete(&self, directory_ids: &[String], file_ids: &[String]) -> WoResult<()> {
        let param = json!({
            "spaceType": "0",
            "vipLevel": "0",
            "dirList": directory_ids,
            "fileList": file_ids,
            "clientId": CLIENT_ID,
        });
        self.dispatch("DeleteFile", param).await?;
        Ok(())
    }
}

fn parse_download_list(data: serde_json::Value) -> WoResult<Vec<DownloadLink>> {
    #[derive(Deserialize)]
    struct RawLink {
        #[serde(default)]
        fid: String,
        #[serde(rename = "downloadUrl", default)]
        download_url: String,
    }
    #[derive(Deserialize)]
    struct Listing {
        #[serde(default)]
        list: Vec<RawLink>,
    }

    let listing: Listing = serde_json::from_value(data)
        .map_err(|err| WoError::Decode(format!("download list: {err}")))?;
    Ok(listing
        .list
        .into_iter()
        .map(|raw| DownloadLink {
            fid: raw.fid,
            url: raw.download_url,
        })
        .collect())
}
