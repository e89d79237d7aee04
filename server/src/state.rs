//! The injected store: configuration, the ledger behind a lock, and one
//! method per external operation.
//!
//! Mutating operations hold the write lock for their whole
//! read-validate-mutate-persist cycle, so two concurrent issuances for the
//! same player cannot both pass the "already issued" check. Read-only
//! operations take the read lock and share it freely, since ranking is a
//! pure function of the log snapshot. Durable writes happen inside the
//! locked section; a request is only acknowledged once its rows are on
//! disk.

use crate::metrics::OpsMetrics;
use crate::persistence::Persistence;
use chrono::{DateTime, Utc};
use dreamrun_engine::{pubcode, ranking, FinalizeOutcome, Ledger};
use dreamrun_types::{
    api::LeaderboardRow, time, CodeStatus, IssueError, LeaderboardMode, RedeemError,
    ValidationError,
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, warn};

const DEFAULT_SUBMIT_WINDOW_SECS: u64 = 15;
const DEFAULT_SUBMIT_BURST: u32 = 3;
const DEFAULT_LEADERBOARD_LIMIT: usize = 10;
const DEFAULT_BODY_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// SQLite document path; in-memory only when omitted.
    pub db_path: Option<PathBuf>,
    /// Shared admin secret. Unset blocks all admin operations.
    pub admin_token: Option<String>,
    /// Optional token guarding the metrics endpoints.
    pub metrics_token: Option<String>,
    /// Salt for public display codes.
    pub public_salt: String,
    /// Submission rate-limit window per client IP.
    pub submit_window_secs: u64,
    /// Submissions allowed per window.
    pub submit_burst: u32,
    pub http_body_limit_bytes: Option<usize>,
    pub default_leaderboard_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            admin_token: None,
            metrics_token: None,
            public_salt: "pub_salt_change_me".to_string(),
            submit_window_secs: DEFAULT_SUBMIT_WINDOW_SECS,
            submit_burst: DEFAULT_SUBMIT_BURST,
            http_body_limit_bytes: Some(DEFAULT_BODY_LIMIT_BYTES),
            default_leaderboard_limit: DEFAULT_LEADERBOARD_LIMIT,
        }
    }
}

/// Request context recorded with every audited action.
#[derive(Clone, Debug, Default)]
pub struct Actor {
    pub ip: Option<String>,
    pub ua: Option<String>,
}

#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Issue(#[from] IssueError),
    #[error(transparent)]
    Redeem(#[from] RedeemError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// What submit reports back to the player.
#[derive(Clone, Debug)]
pub struct SubmitOutcome {
    pub best: bool,
    pub prize_code: Option<String>,
    pub rank: Option<u32>,
    pub total_players: u32,
    pub pub_code: String,
}

pub struct Backend {
    pub config: ServerConfig,
    ledger: RwLock<Ledger>,
    db: Option<Mutex<Persistence>>,
    metrics: OpsMetrics,
}

impl Backend {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let (db, ledger) = match &config.db_path {
            Some(path) => {
                let db = Persistence::open(path)?;
                let ledger = db.load()?;
                tracing::info!(
                    path = %path.display(),
                    scores = ledger.scores.len(),
                    prize_codes = ledger.codes.len(),
                    snapshots = ledger.snapshots.len(),
                    "loaded leaderboard document"
                );
                (Some(Mutex::new(db)), ledger)
            }
            None => {
                warn!("no --db configured; running with a non-durable in-memory document");
                (None, Ledger::default())
            }
        };

        Ok(Self {
            config,
            ledger: RwLock::new(ledger),
            db,
            metrics: OpsMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &OpsMetrics {
        &self.metrics
    }

    /// Accept one score submission.
    ///
    /// `score` arrives post-coercion; `None` means the raw field was not an
    /// integer. `ts` is the client timestamp when it parsed, otherwise the
    /// server clock stands in.
    pub async fn submit_score(
        &self,
        player_id: &str,
        score: Option<i64>,
        ts: Option<DateTime<Utc>>,
        actor: &Actor,
    ) -> Result<SubmitOutcome, OpError> {
        let now = Utc::now();
        let ts = ts.unwrap_or(now);
        let mut ledger = self.ledger.write().await;

        let rejected = |ledger: &mut Ledger, err: ValidationError| {
            let detail = serde_json::json!({
                "player_id": player_id,
                "score": score,
                "error": err.to_string(),
            })
            .to_string();
            ledger
                .record_audit(
                    "score_reject",
                    Some(player_id.to_string()),
                    Some(detail),
                    actor.ip.clone(),
                    actor.ua.clone(),
                    now,
                )
                .clone()
        };

        let Some(score) = score else {
            let record = rejected(&mut ledger, ValidationError::ScoreNotNumeric);
            self.persist_audit(&record).await;
            self.metrics.inc_scores_rejected();
            return Err(ValidationError::ScoreNotNumeric.into());
        };

        let entry = match ledger.append_score(
            player_id,
            score,
            ts,
            actor.ip.clone(),
            actor.ua.clone(),
        ) {
            Ok(entry) => entry.clone(),
            Err(err) => {
                let record = rejected(&mut ledger, err.clone());
                self.persist_audit(&record).await;
                self.metrics.inc_scores_rejected();
                return Err(err.into());
            }
        };

        if let Err(err) = self.persist(|db| db.append_score(&entry)).await {
            // Drop the unpersisted entry so memory matches disk.
            ledger.scores.pop();
            let record = ledger
                .record_audit(
                    "score_error",
                    Some(entry.player_id.clone()),
                    Some(err.to_string()),
                    actor.ip.clone(),
                    actor.ua.clone(),
                    now,
                )
                .clone();
            self.persist_audit(&record).await;
            return Err(OpError::Storage(err));
        }

        let record = ledger
            .record_audit(
                "score_submit",
                Some(entry.player_id.clone()),
                Some(serde_json::json!({ "score": entry.score }).to_string()),
                actor.ip.clone(),
                actor.ua.clone(),
                now,
            )
            .clone();
        self.persist_audit(&record).await;
        self.metrics.inc_scores_accepted();

        let best = ledger.best_for(&entry.player_id) == Some(entry.score);
        let prize_code = ledger
            .codes
            .for_player(&entry.player_id)
            .map(|c| c.code.clone());
        let (rank, total_players) = match ranking::rank_of(&ledger.scores, &entry.player_id, None) {
            Some((rank, total)) => (Some(rank), total),
            None => (None, 0),
        };
        Ok(SubmitOutcome {
            best,
            prize_code,
            rank,
            total_players,
            pub_code: pubcode::public_code(&self.config.public_salt, &entry.player_id),
        })
    }

    /// Rank the live log for display. Pure read; no audit, no mutation.
    pub async fn leaderboard(
        &self,
        limit: usize,
        cutoff: Option<DateTime<Utc>>,
        mode: LeaderboardMode,
    ) -> Vec<LeaderboardRow> {
        let ledger = self.ledger.read().await;
        let rows: Vec<LeaderboardRow> = match mode {
            LeaderboardMode::Attempts => ranking::rank_entries(&ledger.scores, cutoff)
                .into_iter()
                .take(limit)
                .enumerate()
                .map(|(idx, entry)| LeaderboardRow {
                    rank: idx as u32 + 1,
                    player_id: entry.player_id.clone(),
                    score: entry.score,
                    ts: entry.ts,
                    code: ledger
                        .codes
                        .for_player(&entry.player_id)
                        .map(|c| c.code.clone()),
                    pub_code: pubcode::public_code(&self.config.public_salt, &entry.player_id),
                })
                .collect(),
            LeaderboardMode::Best => ranking::rank_players(&ledger.scores, cutoff)
                .into_iter()
                .take(limit)
                .enumerate()
                .map(|(idx, best)| LeaderboardRow {
                    rank: idx as u32 + 1,
                    code: ledger
                        .codes
                        .for_player(&best.player_id)
                        .map(|c| c.code.clone()),
                    pub_code: pubcode::public_code(&self.config.public_salt, &best.player_id),
                    player_id: best.player_id,
                    score: best.score,
                    ts: best.ts,
                })
                .collect(),
        };
        rows
    }

    pub async fn issue_code(
        &self,
        player_id: &str,
        rank: u32,
        actor: &Actor,
    ) -> Result<(String, DateTime<Utc>), OpError> {
        let now = Utc::now();
        let mut ledger = self.ledger.write().await;

        let issue_result = ledger.codes.issue(player_id, rank, now, &mut rand::thread_rng());
        let issued = match issue_result {
            Ok(code) => (code.code.clone(), code.expires_at),
            Err(err) => {
                if matches!(err, IssueError::CodeSpaceExhausted(_)) {
                    self.metrics.inc_code_space_exhausted();
                }
                let record = ledger
                    .record_audit(
                        "issue_reject",
                        Some(player_id.to_string()),
                        Some(err.to_string()),
                        actor.ip.clone(),
                        actor.ua.clone(),
                        now,
                    )
                    .clone();
                self.persist_audit(&record).await;
                return Err(err.into());
            }
        };

        let row = ledger
            .codes
            .lookup(&issued.0)
            .expect("issued code is present")
            .clone();
        self.persist(|db| db.upsert_code(&row)).await?;

        let record = ledger
            .record_audit(
                "issue_code",
                Some(player_id.to_string()),
                Some(issued.0.clone()),
                actor.ip.clone(),
                actor.ua.clone(),
                now,
            )
            .clone();
        self.persist_audit(&record).await;
        self.metrics.inc_codes_issued();
        Ok(issued)
    }

    /// Pure lookup; expiry is evaluated against the call-time clock.
    pub async fn verify_code(&self, code: &str) -> CodeStatus {
        let ledger = self.ledger.read().await;
        ledger.codes.verify(code, Utc::now())
    }

    pub async fn use_code(
        &self,
        code: &str,
        used_by: Option<&str>,
        actor: &Actor,
    ) -> Result<DateTime<Utc>, OpError> {
        let now = Utc::now();
        let mut ledger = self.ledger.write().await;

        let used_at = match ledger.codes.redeem(code, used_by, now) {
            Ok(used_at) => used_at,
            Err(err) => {
                let record = ledger
                    .record_audit(
                        "use_reject",
                        None,
                        Some(format!("{code}: {err}")),
                        actor.ip.clone(),
                        actor.ua.clone(),
                        now,
                    )
                    .clone();
                self.persist_audit(&record).await;
                return Err(err.into());
            }
        };

        let row = ledger.codes.lookup(code).expect("redeemed code is present");
        let (player_id, used_by_stored) = (row.player_id.clone(), row.used_by.clone());
        self.persist(|db| db.mark_used(code, used_at, used_by_stored.as_deref()))
            .await?;

        let record = ledger
            .record_audit(
                "use_code",
                Some(player_id),
                Some(code.to_string()),
                actor.ip.clone(),
                actor.ua.clone(),
                now,
            )
            .clone();
        self.persist_audit(&record).await;
        self.metrics.inc_codes_redeemed();
        Ok(used_at)
    }

    pub async fn finalize(
        &self,
        cutoff: DateTime<Utc>,
        top_n: usize,
        actor: &Actor,
    ) -> Result<FinalizeOutcome, OpError> {
        let now = Utc::now();
        let mut ledger = self.ledger.write().await;

        let finalize_result = ledger.finalize(cutoff, top_n, now, &mut rand::thread_rng());
        let outcome = match finalize_result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics.inc_code_space_exhausted();
                let record = ledger
                    .record_audit(
                        "finalize_reject",
                        None,
                        Some(err.to_string()),
                        actor.ip.clone(),
                        actor.ua.clone(),
                        now,
                    )
                    .clone();
                self.persist_audit(&record).await;
                return Err(err.into());
            }
        };

        if outcome.snapshot_written {
            let rows: Vec<_> = ledger
                .snapshots
                .iter()
                .filter(|s| s.cutoff_at == cutoff)
                .cloned()
                .collect();
            self.persist(|db| db.insert_snapshot_rows(&rows)).await?;
        }
        for issued in &outcome.issued {
            if let Some(code) = issued.code.as_deref().and_then(|c| ledger.codes.lookup(c)) {
                let row = code.clone();
                self.persist(|db| db.upsert_code(&row)).await?;
            }
        }

        let record = ledger
            .record_audit(
                "finalize",
                None,
                Some(
                    serde_json::json!({
                        "cutoff": time::format_ts(cutoff),
                        "top": top_n,
                        "issued": outcome.issued_count(),
                    })
                    .to_string(),
                ),
                actor.ip.clone(),
                actor.ua.clone(),
                now,
            )
            .clone();
        self.persist_audit(&record).await;
        for issued in &outcome.issued {
            if let Some(code) = &issued.code {
                let record = ledger
                    .record_audit(
                        "issue_code_finalize",
                        Some(issued.player_id.clone()),
                        Some(code.clone()),
                        actor.ip.clone(),
                        actor.ua.clone(),
                        now,
                    )
                    .clone();
                self.persist_audit(&record).await;
            }
        }

        self.metrics.inc_finalize_runs();
        self.metrics.add_codes_issued(u64::from(outcome.issued_count()));
        Ok(outcome)
    }

    /// Stored winners for a finalized cutoff. Read-only.
    pub async fn winners(&self, cutoff: DateTime<Utc>) -> Vec<dreamrun_types::api::WinnerRow> {
        let ledger = self.ledger.read().await;
        ledger.winners_of(cutoff)
    }

    /// Audit a mutating request that was rejected before reaching the
    /// core (unauthorized, malformed input).
    pub async fn record_rejected(&self, action: &str, detail: &str, actor: &Actor) {
        let now = Utc::now();
        let mut ledger = self.ledger.write().await;
        let record = ledger
            .record_audit(
                action,
                None,
                Some(detail.to_string()),
                actor.ip.clone(),
                actor.ua.clone(),
                now,
            )
            .clone();
        self.persist_audit(&record).await;
    }

    async fn persist<F>(&self, write: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Persistence) -> anyhow::Result<()>,
    {
        match &self.db {
            Some(db) => {
                let mut db = db.lock().await;
                write(&mut db).inspect_err(|err| error!("durable write failed: {err:#}"))
            }
            None => Ok(()),
        }
    }

    /// Audit rows are best-effort: a failed write is logged and the
    /// operation proceeds rather than failing the caller.
    async fn persist_audit(&self, record: &dreamrun_types::AuditRecord) {
        if let Some(db) = &self.db {
            let db = db.lock().await;
            if let Err(err) = db.append_audit(record) {
                warn!(action = %record.action, "audit write failed: {err:#}");
            }
        }
    }
}
