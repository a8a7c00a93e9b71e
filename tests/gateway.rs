use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use wogate::pool::TokenPool;
use wogate::server::{self, AppState};

const TWO_TOKENS: &str = r#"{"tokens":[
    {"token":"tok-a","name":"A","is_active":true},
    {"token":"tok-b","name":"B","is_active":true}
]}"#;

fn app_with(dir: &tempfile::TempDir, tokens: &str) -> Router {
    let path = dir.path().join("tokens.json");
    std::fs::write(&path, tokens).unwrap();
    let pool = TokenPool::load(path).unwrap();
    let state = AppState::new(pool, Some(dir.path().join("scratch"))).unwrap();
    server::router(state)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "wogate");
}

#[tokio::test]
async fn test_token_get_round_robin_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, first) = get_json(&app, "/api/token/get?strategy=round_robin").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["code"], 200);
    assert_eq!(first["data"]["token"], "tok-a");

    let (_, second) = get_json(&app, "/api/token/get?strategy=round_robin").await;
    assert_eq!(second["data"]["token"], "tok-b");

    let (_, third) = get_json(&app, "/api/token/get?strategy=round_robin").await;
    assert_eq!(third["data"]["token"], "tok-a");
}

#[tokio::test]
async fn test_token_get_best_prefers_unused() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    // Stamp tok-a and give it a perfect record; tok-b's unused bonus wins.
    let (_, first) = get_json(&app, "/api/token/get?strategy=round_robin").await;
    assert_eq!(first["data"]["token"], "tok-a");
    for _ in 0..3 {
        send_json(
            &app,
            "POST",
            "/api/token/report",
            r#"{"token":"tok-a","success":true}"#,
        )
        .await;
    }

    let (_, best) = get_json(&app, "/api/token/get?strategy=best").await;
    assert_eq!(best["data"]["token"], "tok-b");
}

#[tokio::test]
async fn test_token_get_on_empty_pool() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, r#"{"tokens":[]}"#);

    let (status, body) = get_json(&app, "/api/token/get").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_token_report_updates_stats() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    for _ in 0..2 {
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/token/report",
            r#"{"token":"tok-a","success":true}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }
    send_json(
        &app,
        "POST",
        "/api/token/report",
        r#"{"token":"tok-b","success":false,"error":"upstream rejected"}"#,
    )
    .await;

    let (status, body) = get_json(&app, "/api/token/stats").await;
    assert_eq!(status, StatusCode::OK);
    let stats = &body["data"];
    assert_eq!(stats["total_requests"], 3);
    assert_eq!(stats["total_success"], 2);
    assert_eq!(stats["total_errors"], 1);

    let tokens = stats["tokens"].as_array().unwrap();
    let b = tokens.iter().find(|t| t["token"] == "tok-b").unwrap();
    assert_eq!(b["error_count"], 1);
    assert_eq!(b["last_error"], "upstream rejected");
}

#[tokio::test]
async fn test_token_report_requires_token() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, body) = send_json(&app, "POST", "/api/token/report", r#"{"success":true}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn test_token_add_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, r#"{"tokens":[]}"#);

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/token/add",
        r#"{"token":"tok-new","name":"New"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/token/add",
        r#"{"token":"tok-new"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);

    // The addition is visible to acquisition straight away.
    let (_, acquired) = get_json(&app, "/api/token/get").await;
    assert_eq!(acquired["data"]["token"], "tok-new");
    assert_eq!(acquired["data"]["name"], "New");

    let (status, body) = send_json(
        &app,
        "DELETE",
        "/api/token/remove",
        r#"{"token":"tok-new"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = send_json(
        &app,
        "DELETE",
        "/api/token/remove",
        r#"{"token":"tok-new"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn test_download_requires_url_parameter() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, body) = get_json(&app, "/api/download/").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    // Legacy convention: failures carry code 401 whatever the cause.
    assert_eq!(body["code"], 401);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_download_rejects_single_segment_path() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, body) = get_json(&app, "/api/download/?url=lonely.mp4").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 401);
    assert_eq!(body["error"], "invalid url");
}

#[tokio::test]
async fn test_download_with_empty_pool_reports_no_token() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, r#"{"tokens":[]}"#);

    let (status, body) = get_json(&app, "/api/download/?url=movies/a.mp4").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
    assert_eq!(body["error"], "no token available");
}

#[tokio::test]
async fn test_connect_requires_token() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, body) = send_json(&app, "POST", "/api/connect", r#"{"token":"  "}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 401);
    assert_eq!(body["error"], "missing token");
}

#[tokio::test]
async fn test_upload_rejects_empty_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let body_text = "--boundary--\r\n";
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/upload")
                .header(
                    header::CONTENT_TYPE,
                    "multipart/form-data; boundary=boundary",
                )
                .body(Body::from(body_text))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], 401);
    assert_eq!(body["error"], "no files");
}

#[tokio::test]
async fn test_create_folder_requires_name() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/create_folder",
        r#"{"folder_name":"","parent_id":"0"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn test_delete_requires_file_id() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, TWO_TOKENS);

    let (status, body) = send_json(&app, "POST", "/api/delete", r#"{"is_folder":false}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 401);
}
