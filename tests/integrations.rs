use std::sync::Arc;

use chrono::{Duration, Utc};

use wogate::client::WoClient;
use wogate::crypto::{CHANNEL_API_USER, EnvelopeCodec};
use wogate::orchestrator::{ItemState, UploadJob, collect_items};
use wogate::pool::{Strategy, TokenPool, TokenRecord};
use wogate::protocol::{
    CHANNEL_WO_HOME, Envelope, RequestHeader, compact_json, md5_hex, sign_request,
};
use wogate::upload::{CHUNK_BYTES, ChunkUploader, chunk_count, file_kind};

const TEST_TOKEN: &str = "c4be61c9-3566-4d18-becd-d99f3d0e949e";

#[test]
fn test_envelope_roundtrip() {
    let codec = EnvelopeCodec::with_token(TEST_TOKEN);

    let plain = r#"{"spaceType":"0","parentDirectoryId":"0"}"#;
    let encrypted = codec.encrypt(plain, CHANNEL_WO_HOME);
    assert_ne!(encrypted, plain);
    assert_eq!(codec.decrypt(&encrypted, CHANNEL_WO_HOME), plain);

    // The api-user channel uses the fixed key regardless of the token.
    let encrypted_user = codec.encrypt(plain, CHANNEL_API_USER);
    assert_eq!(codec.decrypt(&encrypted_user, CHANNEL_API_USER), plain);
    assert_ne!(encrypted_user, encrypted);
}

#[test]
fn test_unbound_codec_falls_back_to_user_key() {
    let unbound = EnvelopeCodec::new();
    let bound = EnvelopeCodec::with_token(TEST_TOKEN);

    let plain = "fallback check";
    // Without an access key every channel degrades to the user key.
    assert_eq!(
        unbound.encrypt(plain, CHANNEL_WO_HOME),
        bound.encrypt(plain, CHANNEL_API_USER)
    );
}

#[test]
fn test_decrypt_tolerates_missing_base64_padding() {
    let codec = EnvelopeCodec::with_token(TEST_TOKEN);
    let encrypted = codec.encrypt("padding survives stripping", CHANNEL_WO_HOME);
    let stripped = encrypted.trim_end_matches('=');
    assert_ne!(stripped.len() % 4, 0, "fixture must actually lose padding");
    assert_eq!(
        codec.decrypt(stripped, CHANNEL_WO_HOME),
        "padding survives stripping"
    );
}

#[test]
fn test_decrypt_passes_garbage_through() {
    let codec = EnvelopeCodec::with_token(TEST_TOKEN);
    assert_eq!(codec.decrypt("not base64 at all!", CHANNEL_WO_HOME), "not base64 at all!");
    // Valid base64 that is not a ciphertext comes back unchanged too.
    assert_eq!(codec.decrypt("aGVsbG8=", CHANNEL_WO_HOME), "aGVsbG8=");
}

#[test]
fn test_signature_matches_literal_concatenation() {
    let header = RequestHeader::with_parts(CHANNEL_WO_HOME, "QueryAllFiles", 1_700_000_000_000, 100_500);
    let concat = format!("QueryAllFiles{}{}wohome", 1_700_000_000_000i64, 100_500u32);
    assert_eq!(header.sign, md5_hex(concat.as_bytes()));
    assert_eq!(header.version, "");

    // Deterministic for fixed parts.
    let again = RequestHeader::with_parts(CHANNEL_WO_HOME, "QueryAllFiles", 1_700_000_000_000, 100_500);
    assert_eq!(header.sign, again.sign);

    // Different sequence, different signature.
    assert_ne!(
        sign_request("QueryAllFiles", 1_700_000_000_000, 100_500, "wohome", ""),
        sign_request("QueryAllFiles", 1_700_000_000_000, 100_501, "wohome", "")
    );

    // Known md5 vector, so the hex digest itself is trustworthy.
    assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
}

#[test]
fn test_request_sequence_stays_in_range() {
    for _ in 0..200 {
        let header = RequestHeader::new(CHANNEL_WO_HOME, "QueryAllFiles");
        assert!((100_000..=108_999).contains(&header.req_seq));
    }
}

#[test]
fn test_param_json_is_compact() {
    let value = serde_json::json!({"spaceType": "0", "pageNum": 0, "fidList": ["a", "b"]});
    let compact = compact_json(&value);
    assert!(!compact.contains(' '));
    assert!(!compact.contains('\n'));
}

#[test]
fn test_empty_param_body_is_bare_secret() {
    let codec = EnvelopeCodec::with_token(TEST_TOKEN);
    let envelope = Envelope::new(&codec, CHANNEL_WO_HOME, "QueryAllFiles", None);
    let body = serde_json::to_value(&envelope).unwrap();
    assert_eq!(body["body"], serde_json::json!({"secret": true}));

    let with_param = Envelope::new(
        &codec,
        CHANNEL_WO_HOME,
        "QueryAllFiles",
        Some(&serde_json::json!({"pageNum": 0})),
    );
    let body = serde_json::to_value(&with_param).unwrap();
    assert_eq!(body["body"]["secret"], serde_json::json!(true));
    assert!(body["body"]["param"].is_string());
}

#[test]
fn test_file_kind_classifier() {
    assert_eq!(file_kind("movie.mp4"), "video");
    assert_eq!(file_kind("CLIP.MKV"), "video");
    assert_eq!(file_kind("photo.JPEG"), "image");
    assert_eq!(file_kind("song.flac"), "audio");
    assert_eq!(file_kind("report.Docx"), "text");
    assert_eq!(file_kind("backup.tar"), "zip");
    assert_eq!(file_kind("binary.iso"), "other");
    assert_eq!(file_kind("no_extension"), "other");
    assert_eq!(file_kind("archive.tar.gz"), "zip");
}

#[test]
fn test_chunk_count_boundaries() {
    // Empty files still send one (empty) part.
    assert_eq!(chunk_count(0), 1);
    assert_eq!(chunk_count(1), 1);
    assert_eq!(chunk_count(CHUNK_BYTES), 1);
    assert_eq!(chunk_count(CHUNK_BYTES + 1), 2);
    // An exact multiple produces exactly that many parts.
    assert_eq!(chunk_count(3 * CHUNK_BYTES), 3);
}

fn pool_with(dir: &tempfile::TempDir, content: &str) -> TokenPool {
    let path = dir.path().join("tokens.json");
    std::fs::write(&path, content).unwrap();
    TokenPool::load(path).unwrap()
}

const TWO_TOKENS: &str = r#"{"tokens":[
    {"token":"tok-a","name":"A","is_active":true},
    {"token":"tok-b","name":"B","is_active":true}
]}"#;

#[test]
fn test_pool_creates_default_file_on_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let pool = TokenPool::load(&path).unwrap();

    assert!(path.exists());
    let stats = pool.stats();
    assert_eq!(stats.total_tokens, 1);
    assert_eq!(stats.active_tokens, 1);
}

#[test]
fn test_pool_round_robin_order() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(&dir, TWO_TOKENS);

    let first = pool.acquire(Strategy::RoundRobin).unwrap();
    let second = pool.acquire(Strategy::RoundRobin).unwrap();
    let third = pool.acquire(Strategy::RoundRobin).unwrap();
    assert_eq!(first.token, "tok-a");
    assert_eq!(second.token, "tok-b");
    assert_eq!(third.token, "tok-a");

    // Acquisition stamps last_used.
    let stats = pool.stats();
    assert!(stats.tokens.iter().all(|t| t.last_used.is_some()));
}

#[test]
fn test_pool_add_remove_add_is_idempotent_modulo_counts() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(&dir, r#"{"tokens":[]}"#);

    assert!(pool.add("tok-x", Some("X".into())));
    assert!(!pool.add("tok-x", Some("again".into())), "duplicates rejected");
    pool.report_success("tok-x");
    assert!(pool.remove("tok-x"));
    assert!(!pool.remove("tok-x"));
    assert!(pool.add("tok-x", Some("X".into())));

    let stats = pool.stats();
    assert_eq!(stats.total_tokens, 1);
    assert_eq!(stats.tokens[0].success_count, 0, "counts are session-local");
    assert!(stats.tokens[0].is_active);
}

#[test]
fn test_pool_accounting_invariant() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(&dir, TWO_TOKENS);

    for _ in 0..7 {
        pool.report_success("tok-a");
    }
    for _ in 0..3 {
        pool.report_error("tok-a", "boom");
    }
    let stats = pool.stats();
    let a = stats.tokens.iter().find(|t| t.token == "tok-a").unwrap();
    assert_eq!(a.success_count + a.error_count, 10);
    assert!((a.success_rate - 70.0).abs() < 1e-9);
    assert_eq!(a.last_error.as_deref(), Some("boom"));
}

#[test]
fn test_best_scores_match_the_formula() {
    let now = Utc::now();
    let seasoned = TokenRecord {
        token: "a".into(),
        name: "A".into(),
        is_active: true,
        last_used: Some(now - Duration::minutes(5)),
        success_count: 100,
        error_count: 0,
        last_error: None,
    };
    let fresh = TokenRecord {
        token: "b".into(),
        name: "B".into(),
        is_active: true,
        last_used: None,
        success_count: 0,
        error_count: 0,
        last_error: None,
    };

    // 100% rate + 5 idle minutes × 0.1 = 100.5; unused bonus beats it.
    assert!((seasoned.score(now) - 100.5).abs() < 1e-9);
    assert!((fresh.score(now) - 110.0).abs() < 1e-9);
}

#[test]
fn test_best_strategy_prefers_unused_token() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(&dir, TWO_TOKENS);

    // Make tok-a the seasoned veteran and stamp its last_used.
    for _ in 0..100 {
        pool.report_success("tok-a");
    }
    let first = pool.acquire(Strategy::RoundRobin).unwrap();
    assert_eq!(first.token, "tok-a");

    // tok-b has never been handed out, so its flat bonus of 10 wins.
    let best = pool.acquire(Strategy::Best).unwrap();
    assert_eq!(best.token, "tok-b");
}

#[test]
fn test_repeated_errors_deactivate_token() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(&dir, TWO_TOKENS);

    for i in 0..11 {
        pool.report_error("tok-a", &format!("error {i}"));
    }

    let stats = pool.stats();
    let a = stats.tokens.iter().find(|t| t.token == "tok-a").unwrap();
    assert!(!a.is_active);
    assert_eq!(stats.active_tokens, 1);

    // The dead token is skipped by every subsequent acquisition.
    for _ in 0..4 {
        assert_eq!(pool.acquire(Strategy::RoundRobin).unwrap().token, "tok-b");
    }

    // The flag change is persisted, the counters are not.
    let reloaded = TokenPool::load(dir.path().join("tokens.json")).unwrap();
    let stats = reloaded.stats();
    let a = stats.tokens.iter().find(|t| t.token == "tok-a").unwrap();
    assert!(!a.is_active);
    assert_eq!(a.error_count, 0);
}

#[test]
fn test_pool_empty_when_nothing_active() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(
        &dir,
        r#"{"tokens":[{"token":"tok-a","name":"A","is_active":false}]}"#,
    );
    assert!(pool.acquire(Strategy::RoundRobin).is_none());
    assert!(pool.acquire(Strategy::Best).is_none());
}

#[test]
fn test_collect_items_walks_directories_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tree");
    std::fs::create_dir_all(root.join("sub/inner")).unwrap();
    std::fs::write(root.join("b.txt"), b"bb").unwrap();
    std::fs::write(root.join("a.txt"), b"a").unwrap();
    std::fs::write(root.join("sub/c.bin"), b"ccc").unwrap();
    std::fs::write(root.join("sub/inner/d.bin"), b"dddd").unwrap();

    let items = collect_items(&root).unwrap();
    let relatives: Vec<&str> = items.iter().map(|i| i.relative.as_str()).collect();
    assert_eq!(relatives, vec!["a.txt", "b.txt", "sub/c.bin", "sub/inner/d.bin"]);
    assert_eq!(items[0].size, 1);
    assert_eq!(items[3].size, 4);

    // Two walks of the same tree agree.
    let again = collect_items(&root).unwrap();
    let relatives_again: Vec<&str> = again.iter().map(|i| i.relative.as_str()).collect();
    assert_eq!(relatives, relatives_again);
}

#[test]
fn test_collect_items_single_file_uses_basename() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("lonely.mp4");
    std::fs::write(&file, b"0123456789").unwrap();

    let items = collect_items(&file).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].relative, "lonely.mp4");
    assert_eq!(items[0].size, 10);
}

#[tokio::test]
async fn test_upload_job_starts_with_waiting_items() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tree");
    std::fs::create_dir_all(root.join("sub")).unwrap();
    std::fs::write(root.join("one.txt"), b"1").unwrap();
    std::fs::write(root.join("sub/two.txt"), b"22").unwrap();

    let items = collect_items(&root).unwrap();
    let client = Arc::new(WoClient::new(TEST_TOKEN).unwrap());
    let uploader = Arc::new(ChunkUploader::new(TEST_TOKEN).unwrap());
    let job = UploadJob::new(client, uploader, items, "0");

    let status = job.status();
    let (completed, total) = status.overall();
    assert_eq!((completed, total), (0, 2));
    assert!(
        status
            .snapshot()
            .iter()
            .all(|(_, item)| item.state == ItemState::Waiting && item.progress == 0)
    );
}
