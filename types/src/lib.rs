//! Common types for the dreamrun leaderboard and prize-code backend.
//!
//! The persisted state is a single document of four append-mostly
//! collections: score submissions, prize codes, leaderboard snapshots, and
//! the audit log. Everything else (player bests, ranks, public display
//! codes) is derived on demand and never stored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub mod api;
pub mod time;

/// Maximum accepted score per submission.
pub const MAX_SCORE: u32 = 1_000_000;

/// Player identifiers are truncated to this length before validation.
pub const MAX_PLAYER_ID_LEN: usize = 64;

/// Leaderboard queries are clamped to this many rows.
pub const MAX_LEADERBOARD_LIMIT: usize = 100;

/// One accepted score submission. Entries are append-only: corrections
/// happen by submitting new entries, never by editing old ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScoreEntry {
    /// Sequential append order, 1-based.
    pub id: u64,
    pub player_id: String,
    pub score: u32,
    #[serde(with = "time::ts_millis")]
    pub ts: DateTime<Utc>,
    pub ip: Option<String>,
    pub ua: Option<String>,
}

/// A player's standing derived from a log prefix. Never stored; recomputed
/// from the live log on every request so it always reflects the latest
/// submissions up to the given cutoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlayerBest {
    pub player_id: String,
    pub score: u32,
    /// Timestamp of the earliest entry achieving the best score.
    #[serde(with = "time::ts_millis")]
    pub ts: DateTime<Utc>,
    /// Total entries by this player at or before the cutoff.
    pub attempts: u32,
}

/// A redeemable prize credential. At most one per player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrizeCode {
    pub code: String,
    pub rank: u32,
    pub player_id: String,
    #[serde(with = "time::ts_millis")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "time::ts_millis")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "time::ts_millis_opt")]
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<String>,
    pub notes: Option<String>,
}

impl PrizeCode {
    /// Expiry is a property of the clock, not a stored transition.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Result of looking up a prize code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeStatus {
    NotFound,
    Valid {
        rank: u32,
        player_id: String,
        expires_at: DateTime<Utc>,
    },
    Used {
        used_at: DateTime<Utc>,
        used_by: Option<String>,
        rank: u32,
        player_id: String,
    },
    Expired {
        rank: u32,
        player_id: String,
    },
}

/// One row of a finalized leaderboard. Rows for a given cutoff are written
/// exactly once; re-finalizing the same cutoff never duplicates them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SnapshotRow {
    pub id: u64,
    #[serde(with = "time::ts_millis")]
    pub cutoff_at: DateTime<Utc>,
    pub rank: u32,
    pub player_id: String,
    pub score: u32,
    pub code: Option<String>,
}

/// One audit record. Appended for every accepted or rejected mutating
/// action, independent of the HTTP response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub id: u64,
    #[serde(with = "time::ts_millis")]
    pub ts: DateTime<Utc>,
    pub action: String,
    pub player_id: Option<String>,
    pub detail: Option<String>,
    pub ip: Option<String>,
    pub ua: Option<String>,
}

/// Leaderboard presentation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderboardMode {
    /// One row per player, collapsed to their best score.
    Best,
    /// One row per submission.
    Attempts,
}

impl LeaderboardMode {
    /// Anything other than `attempts` falls back to the default mode.
    pub fn parse(value: &str) -> Self {
        match value {
            "attempts" => Self::Attempts,
            _ => Self::Best,
        }
    }
}

/// Malformed or out-of-range input. Always a client-facing 400; nothing is
/// written when validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("player_id must be non-empty")]
    EmptyPlayerId,
    #[error("score {0} outside [0, {MAX_SCORE}]")]
    ScoreOutOfRange(i64),
    #[error("score is not a finite integer")]
    ScoreNotNumeric,
}

/// Failure modes of prize-code issuance.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IssueError {
    /// The player already holds a code; the original code is returned so
    /// callers can surface it.
    #[error("player {player_id} already holds code {code}")]
    AlreadyIssued { player_id: String, code: String },
    /// The collision-retry budget ran out. Treated as a fatal internal
    /// error; it should never happen at realistic registry sizes.
    #[error("code space exhausted after {0} attempts")]
    CodeSpaceExhausted(u32),
}

/// Failure modes of prize-code redemption.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RedeemError {
    #[error("unknown code")]
    NotFound,
    #[error("code already used at {0}")]
    AlreadyUsed(DateTime<Utc>),
    #[error("code expired at {0}")]
    Expired(DateTime<Utc>),
}
