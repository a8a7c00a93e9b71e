use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::client::{ROOT_DIRECTORY_ID, RemoteNode, WoClient, WoError};
use crate::config::ServeConfig;
use crate::orchestrator::{UploadItem, UploadJob};
use crate::pool::{Strategy, TokenPool};
use crate::upload::ChunkUploader;

/// Matches the original deployment's 16 GiB request ceiling.
const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024 * 1024;

/// Session header for the web-UI flow started by `/api/connect`.
const SESSION_HEADER: &str = "x-session-id";

pub struct AppState {
    pool: Arc<TokenPool>,
    sessions: DashMap<String, String>,
    scratch_root: PathBuf,
    // Keeps the auto-created scratch directory alive (and unique) for the
    // lifetime of this gateway instance.
    _scratch_guard: Option<tempfile::TempDir>,
}

impl AppState {
    pub fn new(pool: TokenPool, scratch_dir: Option<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let (scratch_root, guard) = match scratch_dir {
            Some(path) => {
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("creating scratch dir {}", path.display()))?;
                (path, None)
            }
            None => {
                let dir = tempfile::tempdir().context("creating scratch dir")?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        Ok(Arc::new(Self {
            pool: Arc::new(pool),
            sessions: DashMap::new(),
            scratch_root,
            _scratch_guard: guard,
        }))
    }

    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }

    /// Token for this request: the session's own token when the caller
    /// presents a known session id, otherwise the best pool token.
    fn lease_token(&self, headers: &HeaderMap) -> Result<String, Response> {
        if let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
            && let Some(token) = self.sessions.get(session_id)
        {
            return Ok(token.value().clone());
        }
        self.pool
            .acquire(Strategy::Best)
            .map(|acquired| acquired.token)
            .ok_or_else(pool_empty)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/test", get(api_test))
        .route("/api/connect", post(connect))
        .route("/api/browse/{id}", get(browse))
        .route("/api/folders", get(folders))
        .route("/api/files", get(files))
        .route("/api/download/", get(download_by_path))
        .route("/api/download/{fid}", get(download_by_fid))
        .route("/api/upload", post(upload))
        .route("/api/delete", post(delete_item))
        .route("/api/create_folder", post(create_folder))
        .route("/api/token/get", get(token_get))
        .route("/api/token/report", post(token_report))
        .route("/api/token/stats", get(token_stats))
        .route("/api/token/add", post(token_add))
        .route("/api/token/remove", delete(token_remove))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
                .layer(DefaultBodyLimit::disable())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Run the gateway until clean shutdown or interrupt. Returns `true` when
/// the server stopped on Ctrl-C.
pub async fn serve(config: ServeConfig) -> anyhow::Result<bool> {
    let pool = TokenPool::load(&config.tokens_path)?;
    let state = AppState::new(pool, config.scratch_dir.clone())?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!("listening on http://{}", listener.local_addr()?);
    info!("  GET  /api/download/?url=dir/.../file  direct download link");
    info!("  GET  /api/folders                     root directory names");
    info!("  GET  /api/files?folder=name           first-level listing");
    info!("  POST /api/upload                      multipart upload");
    info!("  GET  /api/token/get?strategy=         pool acquisition for peers");
    info!("  GET  /health                          liveness");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
            flag.store(true, Ordering::SeqCst);
        })
        .await?;

    Ok(interrupted.load(Ordering::SeqCst))
}

// ─── Response helpers ────────────────────────────────────────────────────────

/// Legacy failure shape: every failure body carries `code: 401` no matter
/// the transport status. Deployed consumers key on it, so it stays.
fn failure(status: StatusCode, error: &str, message: impl ToString) -> Response {
    (
        status,
        Json(json!({
            "code": 401,
            "success": false,
            "error": error,
            "message": message.to_string(),
        })),
    )
        .into_response()
}

fn not_found_file(message: impl ToString) -> Response {
    failure(StatusCode::NOT_FOUND, "文件未找到", message)
}

fn pool_empty() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "code": 404,
            "success": false,
            "error": "no token available",
            "message": "token pool has no active tokens",
        })),
    )
        .into_response()
}

fn upstream_failure(err: &WoError) -> Response {
    let error = match err {
        WoError::Transport(_) | WoError::Io(_) => "transport error",
        WoError::Envelope { .. } => "upstream status error",
        WoError::Api { .. } => "upstream api error",
        WoError::Decode(_) => "decode error",
    };
    failure(StatusCode::INTERNAL_SERVER_ERROR, error, err)
}

fn new_client(token: &str) -> Result<WoClient, Response> {
    WoClient::new(token).map_err(|err| upstream_failure(&err))
}

/// Listing entry in the shape the original web endpoints used.
fn node_json(node: &RemoteNode) -> Value {
    json!({
        "id": node.id,
        "fid": node.fid,
        "name": node.name,
        "size": node.size,
        "type": if node.is_directory() { "folder" } else { "file" },
        "create_time": node.create_time,
        "file_type": node.file_type,
        "is_folder": node.is_directory(),
    })
}

// ─── Liveness ────────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "wogate",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_test() -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "API ready",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ─── Session flow ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConnectBody {
    #[serde(default)]
    token: String,
}

/// Validate a caller-supplied token by listing the account root, then issue
/// a session id that pins later calls to this token.
async fn connect(State(state): State<Arc<AppState>>, Json(body): Json<ConnectBody>) -> Response {
    let token = body.token.trim().to_string();
    if token.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "missing token", "token is required");
    }

    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };
    match client.list_children(ROOT_DIRECTORY_ID).await {
        Ok(nodes) => {
            state.pool.report_success(&token);
            let session_id = uuid::Uuid::new_v4().to_string();
            state.sessions.insert(session_id.clone(), token);
            Json(json!({
                "code": 200,
                "success": true,
                "message": "connected",
                "session_id": session_id,
                "files": nodes.iter().map(node_json).collect::<Vec<_>>(),
                "current_folder_id": ROOT_DIRECTORY_ID,
            }))
            .into_response()
        }
        Err(err) => {
            state.pool.report_error(&token, &err.to_string());
            failure(StatusCode::UNAUTHORIZED, "connect failed", err)
        }
    }
}

// ─── Browsing ────────────────────────────────────────────────────────────────

async fn browse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let token = match state.lease_token(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };

    match client.list_children(&id).await {
        Ok(nodes) => {
            state.pool.report_success(&token);
            Json(json!({
                "code": 200,
                "success": true,
                "files": nodes.iter().map(node_json).collect::<Vec<_>>(),
                "current_folder_id": id,
            }))
            .into_response()
        }
        Err(err) => {
            state.pool.report_error(&token, &err.to_string());
            upstream_failure(&err)
        }
    }
}

async fn folders(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let token = match state.lease_token(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };

    match client.list_children(ROOT_DIRECTORY_ID).await {
        Ok(nodes) => {
            state.pool.report_success(&token);
            let names: Vec<&str> = nodes
                .iter()
                .filter(|node| node.is_directory())
                .map(|node| node.name.as_str())
                .collect();
            Json(json!({
                "code": 200,
                "success": true,
                "data": names,
                "count": names.len(),
            }))
            .into_response()
        }
        Err(err) => {
            state.pool.report_error(&token, &err.to_string());
            upstream_failure(&err)
        }
    }
}

#[derive(Deserialize)]
struct FilesQuery {
    #[serde(default)]
    folder: String,
}

async fn files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FilesQuery>,
) -> Response {
    if query.folder.is_empty() {
        return failure(
            StatusCode::BAD_REQUEST,
            "missing parameter",
            "folder query parameter is required",
        );
    }

    let token = match state.lease_token(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };

    let listing: Result<Option<Vec<RemoteNode>>, WoError> = async {
        let root = client.list_children(ROOT_DIRECTORY_ID).await?;
        let Some(target) = root
            .iter()
            .find(|node| node.is_directory() && node.name == query.folder)
        else {
            return Ok(None);
        };
        let children = client.list_children(&target.id).await?;
        Ok(Some(children))
    }
    .await;

    match listing {
        Ok(Some(children)) => {
            state.pool.report_success(&token);
            Json(json!({
                "code": 200,
                "success": true,
                "data": {
                    "folder": query.folder,
                    "file_count": children.len(),
                    "files": children.iter().map(node_json).collect::<Vec<_>>(),
                },
            }))
            .into_response()
        }
        Ok(None) => {
            state.pool.report_error(&token, "文件未找到");
            not_found_file(format!("root has no directory named '{}'", query.folder))
        }
        Err(err) => {
            state.pool.report_error(&token, &err.to_string());
            upstream_failure(&err)
        }
    }
}

// ─── Download links ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    url: String,
}

/// `?url=seg1/seg2/…/filename`: walk each directory segment by exact name,
/// then resolve the final file to a direct download URL. The locate walk
/// and the URL fetch each report to the pool once.
async fn download_by_path(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let segments: Vec<&str> = query.url.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return failure(
            StatusCode::BAD_REQUEST,
            "invalid url",
            "expected url=dir/.../filename with at least two segments",
        );
    }

    let token = match state.lease_token(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };

    // Locate stage.
    let mut current = ROOT_DIRECTORY_ID.to_string();
    for segment in &segments[..segments.len() - 1] {
        let nodes = match client.list_children(&current).await {
            Ok(nodes) => nodes,
            Err(err) => {
                state.pool.report_error(&token, &err.to_string());
                return upstream_failure(&err);
            }
        };
        match nodes
            .iter()
            .find(|node| node.is_directory() && node.name == **segment)
        {
            Some(dir) => current = dir.id.clone(),
            None => {
                state.pool.report_error(&token, "文件未找到");
                return not_found_file(format!("no directory named '{segment}'"));
            }
        }
    }

    let file_name = segments[segments.len() - 1];
    let fid = match client.list_children(&current).await {
        Ok(nodes) => {
            match nodes
                .iter()
                .find(|node| !node.is_directory() && node.name == file_name)
            {
                Some(file) => file.fid.clone(),
                None => {
                    state.pool.report_error(&token, "文件未找到");
                    return not_found_file(format!("no file named '{file_name}'"));
                }
            }
        }
        Err(err) => {
            state.pool.report_error(&token, &err.to_string());
            return upstream_failure(&err);
        }
    };
    state.pool.report_success(&token);

    // Download-URL stage.
    resolve_download_url(&state, &client, &token, &fid).await
}

async fn download_by_fid(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(fid): Path<String>,
) -> Response {
    let token = match state.lease_token(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };
    resolve_download_url(&state, &client, &token, &fid).await
}

async fn resolve_download_url(
    state: &AppState,
    client: &WoClient,
    token: &str,
    fid: &str,
) -> Response {
    match client.get_download_urls(&[fid.to_string()]).await {
        Ok(links) => match links.iter().find(|link| !link.url.is_empty()) {
            Some(link) => {
                state.pool.report_success(token);
                Json(json!({ "code": 200, "url": link.url })).into_response()
            }
            None => {
                state.pool.report_error(token, "empty download url");
                failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "empty download url",
                    "upstream returned no usable link",
                )
            }
        },
        Err(err) => {
            state.pool.report_error(token, &err.to_string());
            upstream_failure(&err)
        }
    }
}

// ─── Upload ──────────────────────────────────────────────────────────────────

async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let scratch = state
        .scratch_root
        .join(uuid::Uuid::new_v4().simple().to_string());
    let response = upload_inner(&state, &headers, multipart, &scratch).await;
    if tokio::fs::remove_dir_all(&scratch).await.is_err() && scratch.exists() {
        warn!(path = %scratch.display(), "failed to remove scratch dir");
    }
    response
}

async fn upload_inner(
    state: &AppState,
    headers: &HeaderMap,
    mut multipart: Multipart,
    scratch: &std::path::Path,
) -> Response {
    if let Err(err) = tokio::fs::create_dir_all(scratch).await {
        return failure(StatusCode::INTERNAL_SERVER_ERROR, "scratch error", err);
    }

    // Stream every part to disk first; `folder_id` may arrive before or
    // after the file parts.
    let mut folder_id = ROOT_DIRECTORY_ID.to_string();
    let mut items: Vec<UploadItem> = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return failure(StatusCode::BAD_REQUEST, "invalid multipart", err),
        };
        let name = field.name().map(str::to_string);
        let file_name = field.file_name().map(sanitize_filename);

        if let Some(file_name) = file_name {
            let path = scratch.join(&file_name);
            match save_field(field, &path).await {
                Ok(size) => items.push(UploadItem {
                    absolute: path,
                    relative: file_name,
                    size,
                }),
                Err(err) => {
                    return failure(StatusCode::INTERNAL_SERVER_ERROR, "scratch error", err);
                }
            }
        } else if name.as_deref() == Some("folder_id") {
            match field.text().await {
                Ok(text) if !text.trim().is_empty() => folder_id = text.trim().to_string(),
                Ok(_) => {}
                Err(err) => return failure(StatusCode::BAD_REQUEST, "invalid multipart", err),
            }
        }
    }

    if items.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "no files", "no file parts in request");
    }

    let token = match state.lease_token(headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };
    let uploader = match ChunkUploader::new(&token) {
        Ok(uploader) => uploader,
        Err(err) => return upstream_failure(&err),
    };

    let job = UploadJob::new(Arc::new(client), Arc::new(uploader), items, &folder_id);
    let report = job.run().await;

    for result in &report.results {
        if result.success {
            state.pool.report_success(&token);
        } else {
            state.pool.report_error(&token, &result.message);
        }
    }

    Json(json!({
        "code": 200,
        "success": report.succeeded > 0,
        "message": report.summary(),
        "results": report.results,
    }))
    .into_response()
}

async fn save_field(mut field: axum::extract::multipart::Field<'_>, path: &std::path::Path) -> anyhow::Result<u64> {
    let mut out = tokio::fs::File::create(path).await?;
    let mut size: u64 = 0;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(size)
}

/// Strip path traversal from client-supplied filenames.
fn sanitize_filename(name: &str) -> String {
    let safe: String = name.replace("..", "").replace(['/', '\\'], "");
    if safe.is_empty() {
        format!("upload-{}", uuid::Uuid::new_v4().simple())
    } else {
        safe
    }
}

// ─── Mutations ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DeleteBody {
    #[serde(default)]
    file_id: String,
    #[serde(default)]
    is_folder: bool,
}

async fn delete_item(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Response {
    if body.file_id.is_empty() {
        return failure(
            StatusCode::BAD_REQUEST,
            "missing parameter",
            "file_id is required",
        );
    }

    let token = match state.lease_token(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };

    let (dirs, files) = if body.is_folder {
        (vec![body.file_id.clone()], Vec::new())
    } else {
        (Vec::new(), vec![body.file_id.clone()])
    };

    match client.delete(&dirs, &files).await {
        Ok(()) => {
            state.pool.report_success(&token);
            Json(json!({
                "code": 200,
                "success": true,
                "message": "deleted",
            }))
            .into_response()
        }
        Err(err) => {
            state.pool.report_error(&token, &err.to_string());
            upstream_failure(&err)
        }
    }
}

#[derive(Deserialize)]
struct CreateFolderBody {
    #[serde(default)]
    folder_name: String,
    #[serde(default = "default_parent_id")]
    parent_id: String,
}

fn default_parent_id() -> String {
    ROOT_DIRECTORY_ID.to_string()
}

async fn create_folder(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateFolderBody>,
) -> Response {
    let name = body.folder_name.trim();
    if name.is_empty() {
        return failure(
            StatusCode::BAD_REQUEST,
            "missing parameter",
            "folder_name is required",
        );
    }

    let token = match state.lease_token(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let client = match new_client(&token) {
        Ok(client) => client,
        Err(response) => return response,
    };

    match client.create_directory(&body.parent_id, name).await {
        Ok(folder_id) => {
            state.pool.report_success(&token);
            Json(json!({
                "code": 200,
                "success": true,
                "message": "created",
                "folder_id": folder_id,
            }))
            .into_response()
        }
        Err(err) => {
            state.pool.report_error(&token, &err.to_string());
            upstream_failure(&err)
        }
    }
}

// ─── Token pool surface ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StrategyQuery {
    #[serde(default)]
    strategy: String,
}

async fn token_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StrategyQuery>,
) -> Response {
    match state.pool.acquire(Strategy::parse(&query.strategy)) {
        Some(acquired) => Json(json!({
            "code": 200,
            "success": true,
            "data": acquired,
        }))
        .into_response(),
        None => pool_empty(),
    }
}

#[derive(Deserialize)]
struct ReportBody {
    #[serde(default)]
    token: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: String,
}

async fn token_report(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReportBody>,
) -> Response {
    if body.token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": 400,
                "success": false,
                "error": "missing token parameter",
            })),
        )
            .into_response();
    }

    if body.success {
        state.pool.report_success(&body.token);
    } else {
        state.pool.report_error(&body.token, &body.error);
    }
    Json(json!({
        "code": 200,
        "success": true,
        "message": "recorded",
    }))
    .into_response()
}

async fn token_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "code": 200,
        "success": true,
        "data": state.pool.stats(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct TokenAddBody {
    #[serde(default)]
    token: String,
    #[serde(default)]
    name: Option<String>,
}

async fn token_add(State(state): State<Arc<AppState>>, Json(body): Json<TokenAddBody>) -> Response {
    if body.token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": 400,
                "success": false,
                "error": "missing token parameter",
            })),
        )
            .into_response();
    }

    if state.pool.add(&body.token, body.name) {
        Json(json!({
            "code": 200,
            "success": true,
            "message": "token added",
        }))
        .into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({
                "code": 409,
                "success": false,
                "error": "token already exists",
            })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct TokenRemoveBody {
    #[serde(default)]
    token: String,
}

async fn token_remove(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenRemoveBody>,
) -> Response {
    if state.pool.remove(&body.token) {
        Json(json!({
            "code": 200,
            "success": true,
            "message": "token removed",
        }))
        .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "code": 404,
                "success": false,
                "error": "token not found",
            })),
        )
            .into_response()
    }
}
