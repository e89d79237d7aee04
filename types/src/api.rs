//! Request and response bodies for the HTTP surface.
//!
//! Submission requests are deserialized permissively (`serde_json::Value`
//! fields) and sanitized by the API layer: string truncation and numeric
//! coercion happen before anything reaches the core, so a malformed field
//! is a validation failure rather than a deserialization error.

use crate::{time, MAX_PLAYER_ID_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `POST /api/score` body.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitScoreRequest {
    pub player_id: Option<serde_json::Value>,
    pub score: Option<serde_json::Value>,
    pub ts: Option<String>,
}

/// `POST /api/score` response.
#[derive(Debug, Serialize)]
pub struct SubmitScoreResponse {
    pub ok: bool,
    /// Whether this submission equals the player's best score.
    pub best: bool,
    pub prize_code: Option<String>,
    pub rank: Option<u32>,
    pub total_players: u32,
    pub pub_code: String,
}

/// One leaderboard row, in either mode.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub player_id: String,
    pub score: u32,
    #[serde(with = "time::ts_millis")]
    pub ts: DateTime<Utc>,
    pub code: Option<String>,
    pub pub_code: String,
}

/// `GET /api/leaderboard` response.
#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub ok: bool,
    pub leaderboard: Vec<LeaderboardRow>,
}

/// `POST /api/issue-code` body.
#[derive(Debug, Deserialize)]
pub struct IssueCodeRequest {
    pub player_id: Option<String>,
    pub rank: Option<i64>,
}

/// `POST /api/issue-code` response.
#[derive(Debug, Serialize)]
pub struct IssueCodeResponse {
    pub ok: bool,
    pub code: String,
    #[serde(with = "time::ts_millis")]
    pub expires_at: DateTime<Utc>,
}

/// `POST /api/verify-code` body.
#[derive(Debug, Deserialize)]
pub struct VerifyCodeRequest {
    pub code: Option<String>,
}

/// `POST /api/verify-code` response. Fields beyond `status` are populated
/// per status; absent ones are omitted.
#[derive(Debug, Default, Serialize)]
pub struct VerifyCodeResponse {
    pub ok: bool,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(with = "time::ts_millis_opt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "time::ts_millis_opt", skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

/// `POST /api/use-code` body.
#[derive(Debug, Deserialize)]
pub struct UseCodeRequest {
    pub code: Option<String>,
    pub used_by: Option<String>,
}

/// `POST /api/use-code` response.
#[derive(Debug, Serialize)]
pub struct UseCodeResponse {
    pub ok: bool,
    #[serde(with = "time::ts_millis")]
    pub used_at: DateTime<Utc>,
}

/// One winner row, as returned by finalize and winners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WinnerRow {
    pub rank: u32,
    pub player_id: String,
    pub score: u32,
    pub code: Option<String>,
}

/// `POST /api/finalize` response.
#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub ok: bool,
    pub cutoff: String,
    pub winners: Vec<WinnerRow>,
    pub issued_count: u32,
}

/// `GET /api/winners` response.
#[derive(Debug, Serialize)]
pub struct WinnersResponse {
    pub ok: bool,
    pub cutoff: String,
    pub winners: Vec<WinnerRow>,
}

/// Uniform error body: `{ "ok": false, "error": "..." }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(error: &'static str) -> Self {
        Self {
            ok: false,
            error,
            code: None,
        }
    }

    /// `already_issued` responses carry the original code.
    pub fn with_code(error: &'static str, code: String) -> Self {
        Self {
            ok: false,
            error,
            code: Some(code),
        }
    }
}

/// Coerce a permissive JSON field to a player identifier: strings pass
/// through, numbers are rendered, everything else is empty. The result is
/// truncated before validation.
pub fn coerce_player_id(value: Option<&serde_json::Value>) -> String {
    let raw = match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    truncate(&raw, MAX_PLAYER_ID_LEN)
}

/// Coerce a permissive JSON field to an integral score. Floats with a
/// fractional part and non-numeric strings are `None`, which the store
/// rejects as non-finite input.
pub fn coerce_score(value: Option<&serde_json::Value>) -> Option<i64> {
    match value {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        None => Some(0),
        _ => None,
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
