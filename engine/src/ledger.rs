//! The in-memory form of the persisted document.
//!
//! Four collections: scores and the audit log are pure append, prize codes
//! accept the single redemption update, snapshots are written once per
//! cutoff. The ledger itself does no I/O and never reads the clock; the
//! server serializes mutations around it and persists each change before
//! acknowledging.

use crate::codes::CodeBook;
use crate::ranking;
use chrono::{DateTime, Utc};
use dreamrun_types::{
    api::WinnerRow, AuditRecord, IssueError, ScoreEntry, SnapshotRow, ValidationError,
    MAX_PLAYER_ID_LEN, MAX_SCORE,
};
use rand::Rng;

/// How many ranked players receive a prize code on finalize.
pub const WINNER_COUNT: usize = 3;

#[derive(Clone, Debug, Default)]
pub struct Ledger {
    pub scores: Vec<ScoreEntry>,
    pub codes: CodeBook,
    pub snapshots: Vec<SnapshotRow>,
    pub audit: Vec<AuditRecord>,
}

/// What a finalize run did: the top rows after issuance, the codes this
/// call newly created, and whether this call wrote the snapshot (false
/// when the cutoff had already been finalized).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub winners: Vec<WinnerRow>,
    pub issued: Vec<WinnerRow>,
    pub snapshot_written: bool,
}

impl FinalizeOutcome {
    pub fn issued_count(&self) -> u32 {
        self.issued.len() as u32
    }
}

impl Ledger {
    /// Append one validated score submission.
    ///
    /// `player_id` is truncated to [`MAX_PLAYER_ID_LEN`] characters and must
    /// be non-empty afterwards; `score` must be an integer in
    /// `[0, MAX_SCORE]`. Nothing is written when validation fails.
    pub fn append_score(
        &mut self,
        player_id: &str,
        score: i64,
        ts: DateTime<Utc>,
        ip: Option<String>,
        ua: Option<String>,
    ) -> Result<&ScoreEntry, ValidationError> {
        let player_id: String = player_id.chars().take(MAX_PLAYER_ID_LEN).collect();
        if player_id.is_empty() {
            return Err(ValidationError::EmptyPlayerId);
        }
        if score < 0 || score > MAX_SCORE as i64 {
            return Err(ValidationError::ScoreOutOfRange(score));
        }

        self.scores.push(ScoreEntry {
            id: self.scores.len() as u64 + 1,
            player_id,
            score: score as u32,
            ts,
            ip,
            ua,
        });
        Ok(self.scores.last().expect("just pushed"))
    }

    /// The player's best score over the whole log, if they have any entries.
    pub fn best_for(&self, player_id: &str) -> Option<u32> {
        self.scores
            .iter()
            .filter(|s| s.player_id == player_id)
            .map(|s| s.score)
            .max()
    }

    /// Append one audit record. Every accepted or rejected mutating action
    /// lands here, whatever the outcome of the operation itself.
    pub fn record_audit(
        &mut self,
        action: &str,
        player_id: Option<String>,
        detail: Option<String>,
        ip: Option<String>,
        ua: Option<String>,
        ts: DateTime<Utc>,
    ) -> &AuditRecord {
        self.audit.push(AuditRecord {
            id: self.audit.len() as u64 + 1,
            ts,
            action: action.to_string(),
            player_id,
            detail,
            ip,
            ua,
        });
        self.audit.last().expect("just pushed")
    }

    /// Freeze the ranking at `cutoff` and issue codes to the top finishers.
    ///
    /// The snapshot write is guarded by cutoff identity: a second finalize
    /// with the same cutoff never duplicates rows. Code issuance runs on
    /// every call and only creates codes for winners who lack one, so a
    /// retry reports `issued_count = 0` instead of failing.
    pub fn finalize(
        &mut self,
        cutoff: DateTime<Utc>,
        top_n: usize,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Result<FinalizeOutcome, IssueError> {
        let top: Vec<_> = ranking::rank_players(&self.scores, Some(cutoff))
            .into_iter()
            .take(top_n)
            .collect();

        let snapshot_written = !self.snapshots.iter().any(|s| s.cutoff_at == cutoff);
        if snapshot_written {
            for (idx, row) in top.iter().enumerate() {
                self.snapshots.push(SnapshotRow {
                    id: self.snapshots.len() as u64 + 1,
                    cutoff_at: cutoff,
                    rank: idx as u32 + 1,
                    player_id: row.player_id.clone(),
                    score: row.score,
                    code: self.codes.for_player(&row.player_id).map(|c| c.code.clone()),
                });
            }
        }

        let mut issued = Vec::new();
        for (idx, winner) in top.iter().take(WINNER_COUNT).enumerate() {
            if self.codes.for_player(&winner.player_id).is_none() {
                let code = self
                    .codes
                    .issue(&winner.player_id, idx as u32 + 1, now, rng)?;
                issued.push(WinnerRow {
                    rank: idx as u32 + 1,
                    player_id: winner.player_id.clone(),
                    score: winner.score,
                    code: Some(code.code.clone()),
                });
            }
        }

        let winners = top
            .iter()
            .take(WINNER_COUNT)
            .enumerate()
            .map(|(idx, row)| WinnerRow {
                rank: idx as u32 + 1,
                player_id: row.player_id.clone(),
                score: row.score,
                code: self.codes.for_player(&row.player_id).map(|c| c.code.clone()),
            })
            .collect();

        Ok(FinalizeOutcome {
            winners,
            issued,
            snapshot_written,
        })
    }

    /// The stored top rows for a finalized cutoff, best-first. Empty when
    /// the cutoff was never finalized.
    pub fn winners_of(&self, cutoff: DateTime<Utc>) -> Vec<WinnerRow> {
        let mut rows: Vec<&SnapshotRow> = self
            .snapshots
            .iter()
            .filter(|s| s.cutoff_at == cutoff)
            .collect();
        rows.sort_by_key(|s| s.rank);
        rows.into_iter()
            .take(WINNER_COUNT)
            .map(|s| WinnerRow {
                rank: s.rank,
                player_id: s.player_id.clone(),
                score: s.score,
                code: s.code.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn at_minute(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(99)
    }

    #[test]
    fn append_accepts_score_boundaries_inclusive() {
        let mut ledger = Ledger::default();
        ledger.append_score("p1", 0, noon(), None, None).unwrap();
        ledger
            .append_score("p1", MAX_SCORE as i64, noon(), None, None)
            .unwrap();
        assert_eq!(ledger.scores.len(), 2);
    }

    #[test]
    fn append_rejects_out_of_range_scores_without_writing() {
        let mut ledger = Ledger::default();
        assert_eq!(
            ledger.append_score("p1", -5, noon(), None, None),
            Err(ValidationError::ScoreOutOfRange(-5))
        );
        assert_eq!(
            ledger.append_score("p1", 2_000_000, noon(), None, None),
            Err(ValidationError::ScoreOutOfRange(2_000_000))
        );
        assert!(ledger.scores.is_empty());
    }

    #[test]
    fn append_truncates_then_requires_player_id() {
        let mut ledger = Ledger::default();
        assert_eq!(
            ledger.append_score("", 10, noon(), None, None),
            Err(ValidationError::EmptyPlayerId)
        );
        let long = "p".repeat(80);
        let entry = ledger.append_score(&long, 10, noon(), None, None).unwrap();
        assert_eq!(entry.player_id.len(), MAX_PLAYER_ID_LEN);
    }

    #[test]
    fn identical_payloads_append_distinct_entries() {
        let mut ledger = Ledger::default();
        let first = ledger.append_score("p1", 10, noon(), None, None).unwrap().id;
        let second = ledger.append_score("p1", 10, noon(), None, None).unwrap().id;
        assert_ne!(first, second);
        assert_eq!(ledger.scores.len(), 2);
    }

    #[test]
    fn finalize_is_idempotent_per_cutoff() {
        let mut ledger = Ledger::default();
        let mut rng = rng();
        for (player, score, minute) in [("p1", 100, 0), ("p2", 150, 1), ("p3", 50, 2)] {
            ledger
                .append_score(player, score, at_minute(minute), None, None)
                .unwrap();
        }
        let cutoff = at_minute(10);

        let first = ledger.finalize(cutoff, 10, at_minute(11), &mut rng).unwrap();
        assert!(first.snapshot_written);
        assert_eq!(first.issued_count(), 3);
        assert_eq!(ledger.snapshots.len(), 3);

        let second = ledger.finalize(cutoff, 10, at_minute(12), &mut rng).unwrap();
        assert!(!second.snapshot_written);
        assert_eq!(second.issued_count(), 0);
        assert!(second.issued.is_empty());
        assert_eq!(ledger.snapshots.len(), 3);
        // The retry still reports the same winners, codes included.
        assert_eq!(first.winners, second.winners);
    }

    #[test]
    fn finalize_with_fewer_players_than_winners() {
        let mut ledger = Ledger::default();
        let mut rng = rng();
        ledger.append_score("solo", 10, at_minute(0), None, None).unwrap();
        let cutoff = at_minute(5);
        let outcome = ledger.finalize(cutoff, 10, at_minute(6), &mut rng).unwrap();
        assert_eq!(outcome.winners.len(), 1);
        assert_eq!(outcome.issued_count(), 1);
        assert_eq!(ledger.winners_of(cutoff).len(), 1);
    }

    #[test]
    fn finalize_orders_winners_by_ranking() {
        let mut ledger = Ledger::default();
        let mut rng = rng();
        // P1 ties P2 on score but got there first.
        ledger.append_score("p1", 100, at_minute(0), None, None).unwrap();
        ledger.append_score("p1", 150, at_minute(1), None, None).unwrap();
        ledger.append_score("p2", 150, at_minute(2), None, None).unwrap();
        let outcome = ledger
            .finalize(at_minute(10), 10, at_minute(11), &mut rng)
            .unwrap();
        assert_eq!(outcome.winners[0].player_id, "p1");
        assert_eq!(outcome.winners[1].player_id, "p2");
        assert_eq!(ledger.winners_of(at_minute(10))[0].player_id, "p1");
    }

    #[test]
    fn finalize_skips_existing_codes_but_snapshots_everyone() {
        let mut ledger = Ledger::default();
        let mut rng = rng();
        ledger.append_score("p1", 100, at_minute(0), None, None).unwrap();
        ledger.append_score("p2", 90, at_minute(1), None, None).unwrap();
        let held = ledger
            .codes
            .issue("p1", 1, at_minute(2), &mut rng)
            .unwrap()
            .code
            .clone();

        let outcome = ledger
            .finalize(at_minute(10), 10, at_minute(11), &mut rng)
            .unwrap();
        assert_eq!(outcome.issued_count(), 1); // only p2 was missing a code
        assert_eq!(outcome.issued[0].player_id, "p2");
        assert_eq!(outcome.winners[0].code.as_deref(), Some(held.as_str()));
        // p1 already held a code at snapshot time, so the stored row carries it.
        let stored = ledger.winners_of(at_minute(10));
        assert_eq!(stored[0].code.as_deref(), Some(held.as_str()));
        assert_eq!(stored[1].code, None);
    }

    #[test]
    fn winners_of_unknown_cutoff_is_empty() {
        let ledger = Ledger::default();
        assert!(ledger.winners_of(noon()).is_empty());
    }

    #[test]
    fn audit_ids_are_sequential() {
        let mut ledger = Ledger::default();
        let first = ledger
            .record_audit("score_submit", Some("p1".into()), None, None, None, noon())
            .id;
        let second = ledger
            .record_audit("score_reject", Some("p2".into()), None, None, None, noon())
            .id;
        assert_eq!((first, second), (1, 2));
    }
}
