use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Errors past this count (with a success rate below 50%) deactivate a
/// token. This is the richer-variant threshold the shipped services used.
const DEACTIVATE_ERRORS: u64 = 5;

/// Health record for one account token. Counters and timestamps are
/// session-local; only identity and the active flag survive a restart.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token: String,
    pub name: String,
    pub is_active: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl TokenRecord {
    fn new(token: String, name: String, is_active: bool) -> Self {
        Self {
            token,
            name,
            is_active,
            last_used: None,
            success_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    /// Percentage of successful reports; 100 when nothing was reported yet.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            100.0
        } else {
            self.success_count as f64 * 100.0 / total as f64
        }
    }

    /// Best-strategy score: success rate plus a freshness bonus. Never-used
    /// tokens get a flat 10; otherwise idle minutes count 0.1 each, capped
    /// at 5.
    pub fn score(&self, now: DateTime<Utc>) -> f64 {
        let bonus = match self.last_used {
            None => 10.0,
            Some(last) => {
                let idle_minutes = now.signed_duration_since(last).num_seconds() as f64 / 60.0;
                (idle_minutes * 0.1).min(5.0)
            }
        };
        self.success_rate() + bonus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Best,
}

impl Strategy {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("best") {
            Strategy::Best
        } else {
            Strategy::RoundRobin
        }
    }
}

/// What `acquire` hands out.
#[derive(Debug, Clone, Serialize)]
pub struct AcquiredToken {
    pub token: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub total_tokens: usize,
    pub active_tokens: usize,
    pub total_requests: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub overall_success_rate: f64,
    pub tokens: Vec<TokenStats>,
}

#[derive(Debug, Serialize)]
pub struct TokenStats {
    pub token: String,
    pub name: String,
    pub is_active: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub success_rate: f64,
}

/// On-disk shape of `tokens.json`. Counters are deliberately left out so a
/// transient error burst cannot poison a token across restarts.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedPool {
    tokens: Vec<PersistedToken>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedToken {
    token: String,
    name: String,
    is_active: bool,
}

struct PoolInner {
    tokens: Vec<TokenRecord>,
    cursor: usize,
}

/// Load-balancing token pool. One mutex covers the record list and the
/// round-robin cursor; persistence happens inside the same critical section
/// so admin actions and in-flight reports cannot interleave around a write.
pub struct TokenPool {
    inner: Mutex<PoolInner>,
    path: PathBuf,
}

impl TokenPool {
    /// Load the pool from `tokens.json`, writing a default file with a
    /// single placeholder entry when none exists yet.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();

        if !path.exists() {
            let default = PersistedPool {
                tokens: vec![PersistedToken {
                    token: "replace-with-your-token".to_string(),
                    name: "Primary".to_string(),
                    is_active: true,
                }],
            };
            write_pool_file(&path, &default)?;
            info!(path = %path.display(), "created default token file");
        }

        let raw = std::fs::read_to_string(&path)?;
        let persisted: PersistedPool = serde_json::from_str(&raw)?;
        let tokens = persisted
            .tokens
            .into_iter()
            .map(|entry| TokenRecord::new(entry.token, entry.name, entry.is_active))
            .collect::<Vec<_>>();
        info!(count = tokens.len(), "loaded token pool");

        Ok(Self {
            inner: Mutex::new(PoolInner { tokens, cursor: 0 }),
            path,
        })
    }

    /// Hand out an active token, or `None` when the pool has none left.
    pub fn acquire(&self, strategy: Strategy) -> Option<AcquiredToken> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let active: Vec<usize> = inner
            .tokens
            .iter()
            .enumerate()
            .filter(|(_, record)| record.is_active)
            .map(|(idx, _)| idx)
            .collect();
        if active.is_empty() {
            return None;
        }

        let chosen = match strategy {
            Strategy::RoundRobin => {
                if inner.cursor >= active.len() {
                    inner.cursor = 0;
                }
                let idx = active[inner.cursor];
                inner.cursor = (inner.cursor + 1) % active.len();
                idx
            }
            Strategy::Best => {
                let mut best = active[0];
                let mut best_score = inner.tokens[best].score(now);
                for &idx in &active[1..] {
                    let score = inner.tokens[idx].score(now);
                    if score > best_score {
                        best = idx;
                        best_score = score;
                    }
                }
                best
            }
        };

        let record = &mut inner.tokens[chosen];
        record.last_used = Some(now);
        Some(AcquiredToken {
            token: record.token.clone(),
            name: record.name.clone(),
        })
    }

    pub fn report_success(&self, token: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.tokens.iter_mut().find(|r| r.token == token) {
            record.success_count += 1;
        }
    }

    /// Record a failure. Tokens that keep failing with a success rate under
    /// 50% are taken out of rotation; the flag change is persisted.
    pub fn report_error(&self, token: &str, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.tokens.iter_mut().find(|r| r.token == token) else {
            return;
        };
        record.error_count += 1;
        record.last_error = Some(error.to_string());

        if record.is_active
            && record.error_count > DEACTIVATE_ERRORS
            && record.success_rate() < 50.0
        {
            record.is_active = false;
            warn!(name = %record.name, "token deactivated after repeated errors");
            persist(&self.path, &inner);
        }
    }

    /// Add a token. Duplicate secrets (exact string match) are rejected.
    pub fn add(&self, token: &str, name: Option<String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.tokens.iter().any(|r| r.token == token) {
            return false;
        }
        let name = name.unwrap_or_else(|| format!("Token-{}", inner.tokens.len() + 1));
        info!(%name, "token added");
        inner
            .tokens
            .push(TokenRecord::new(token.to_string(), name, true));
        persist(&self.path, &inner);
        true
    }

    pub fn remove(&self, token: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.tokens.iter().position(|r| r.token == token) else {
            return false;
        };
        let removed = inner.tokens.remove(idx);
        info!(name = %removed.name, "token removed");
        persist(&self.path, &inner);
        true
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let total_success: u64 = inner.tokens.iter().map(|r| r.success_count).sum();
        let total_errors: u64 = inner.tokens.iter().map(|r| r.error_count).sum();
        let total_requests = total_success + total_errors;

        PoolStats {
            total_tokens: inner.tokens.len(),
            active_tokens: inner.tokens.iter().filter(|r| r.is_active).count(),
            total_requests,
            total_success,
            total_errors,
            overall_success_rate: if total_requests == 0 {
                100.0
            } else {
                total_success as f64 * 100.0 / total_requests as f64
            },
            tokens: inner
                .tokens
                .iter()
                .map(|record| TokenStats {
                    token: record.token.clone(),
                    name: record.name.clone(),
                    is_active: record.is_active,
                    last_used: record.last_used,
                    success_count: record.success_count,
                    error_count: record.error_count,
                    last_error: record.last_error.clone(),
                    success_rate: record.success_rate(),
                })
                .collect(),
        }
    }
}

fn persist(path: &Path, inner: &PoolInner) {
    let persisted = PersistedPool {
        tokens: inner
            .tokens
            .iter()
            .map(|record| PersistedToken {
                token: record.token.clone(),
                name: record.name.clone(),
                is_active: record.is_active,
            })
            .collect(),
    };
    if let Err(err) = write_pool_file(path, &persisted) {
        error!(path = %path.display(), error = %err, "failed to save token file");
    }
}

fn write_pool_file(path: &Path, pool: &PersistedPool) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(pool)?;
    std::fs::write(path, json)?;
    Ok(())
}
