//! Deterministic ranking over the append-only score log.
//!
//! Rankings are pure functions of `(log, cutoff)`: the engine re-reads the
//! full log on every call rather than maintaining derived state, so a
//! ranking is always consistent with the latest accepted submissions. The
//! ordering `(score desc, ts asc, attempts asc, player_id asc)` is total,
//! so two calls over the same inputs always produce the same sequence.

use chrono::{DateTime, Utc};
use dreamrun_types::{PlayerBest, ScoreEntry};
use std::collections::HashMap;

/// Collapse the log to one [`PlayerBest`] per player, ordered best-first.
///
/// Only entries at or before `cutoff` qualify; no cutoff means the whole
/// log. A player's best is their maximum score, held by the earliest entry
/// achieving it; ties across players break by earlier timestamp, then by
/// fewer total attempts.
pub fn rank_players(entries: &[ScoreEntry], cutoff: Option<DateTime<Utc>>) -> Vec<PlayerBest> {
    let mut attempts: HashMap<&str, u32> = HashMap::new();
    for entry in qualifying(entries, cutoff) {
        *attempts.entry(entry.player_id.as_str()).or_default() += 1;
    }

    let mut best: HashMap<&str, PlayerBest> = HashMap::new();
    for entry in qualifying(entries, cutoff) {
        let candidate = best.entry(entry.player_id.as_str());
        let candidate = candidate.or_insert_with(|| PlayerBest {
            player_id: entry.player_id.clone(),
            score: entry.score,
            ts: entry.ts,
            attempts: attempts[entry.player_id.as_str()],
        });
        if entry.score > candidate.score || (entry.score == candidate.score && entry.ts < candidate.ts)
        {
            candidate.score = entry.score;
            candidate.ts = entry.ts;
        }
    }

    let mut ranked: Vec<PlayerBest> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.ts.cmp(&b.ts))
            .then_with(|| a.attempts.cmp(&b.attempts))
            .then_with(|| a.player_id.cmp(&b.player_id))
    });
    ranked
}

/// The 1-based rank of `player_id` in the best-score ordering, together with
/// the number of distinct players considered. `None` when the player has no
/// qualifying entries.
pub fn rank_of(
    entries: &[ScoreEntry],
    player_id: &str,
    cutoff: Option<DateTime<Utc>>,
) -> Option<(u32, u32)> {
    let ranked = rank_players(entries, cutoff);
    let total = ranked.len() as u32;
    ranked
        .iter()
        .position(|r| r.player_id == player_id)
        .map(|idx| (idx as u32 + 1, total))
}

/// Rank raw submissions without collapsing per player ("attempts" mode).
/// Every qualifying entry is its own row, ordered `(score desc, ts asc)`.
pub fn rank_entries(entries: &[ScoreEntry], cutoff: Option<DateTime<Utc>>) -> Vec<&ScoreEntry> {
    let mut rows: Vec<&ScoreEntry> = qualifying(entries, cutoff).collect();
    rows.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.ts.cmp(&b.ts)));
    rows
}

fn qualifying(
    entries: &[ScoreEntry],
    cutoff: Option<DateTime<Utc>>,
) -> impl Iterator<Item = &ScoreEntry> {
    entries
        .iter()
        .filter(move |entry| cutoff.is_none_or(|cutoff| entry.ts <= cutoff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: u64, player: &str, score: u32, minute: u32) -> ScoreEntry {
        ScoreEntry {
            id,
            player_id: player.to_string(),
            score,
            ts: Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap(),
            ip: None,
            ua: None,
        }
    }

    #[test]
    fn empty_log_ranks_nobody() {
        assert!(rank_players(&[], None).is_empty());
        assert_eq!(rank_of(&[], "p1", None), None);
    }

    #[test]
    fn earlier_timestamp_wins_score_tie() {
        // P1 reaches 150 before P2 does; P1 must rank first at any cutoff
        // covering both.
        let log = vec![
            entry(1, "p1", 100, 0),
            entry(2, "p1", 150, 1),
            entry(3, "p2", 150, 2),
        ];
        let ranked = rank_players(&log, None);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].player_id, "p1");
        assert_eq!(ranked[0].score, 150);
        assert_eq!(ranked[0].ts, log[1].ts);
        assert_eq!(ranked[1].player_id, "p2");
    }

    #[test]
    fn fewer_attempts_wins_full_tie() {
        let log = vec![
            entry(1, "grinder", 50, 0),
            entry(2, "grinder", 200, 1),
            entry(3, "oneshot", 200, 1),
        ];
        let ranked = rank_players(&log, None);
        assert_eq!(ranked[0].player_id, "oneshot");
        assert_eq!(ranked[0].attempts, 1);
        assert_eq!(ranked[1].player_id, "grinder");
        assert_eq!(ranked[1].attempts, 2);
    }

    #[test]
    fn best_keeps_earliest_achieving_entry() {
        // The same player repeats their best; the first occurrence is the
        // one that counts for tie-breaking.
        let log = vec![
            entry(1, "p1", 300, 0),
            entry(2, "p1", 300, 5),
            entry(3, "p1", 100, 6),
        ];
        let ranked = rank_players(&log, None);
        assert_eq!(ranked[0].ts, log[0].ts);
        assert_eq!(ranked[0].attempts, 3);
    }

    #[test]
    fn cutoff_excludes_later_entries() {
        let log = vec![entry(1, "p1", 100, 0), entry(2, "p1", 500, 10)];
        let cutoff = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        let ranked = rank_players(&log, Some(cutoff));
        assert_eq!(ranked[0].score, 100);
        assert_eq!(ranked[0].attempts, 1);

        // Inclusive boundary: an entry exactly at the cutoff qualifies.
        let at_boundary = Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap();
        let ranked = rank_players(&log, Some(at_boundary));
        assert_eq!(ranked[0].score, 500);
    }

    #[test]
    fn ranking_is_deterministic() {
        let log = vec![
            entry(1, "a", 100, 0),
            entry(2, "b", 100, 0),
            entry(3, "c", 100, 0),
        ];
        let first = rank_players(&log, None);
        let second = rank_players(&log, None);
        assert_eq!(first, second);
    }

    #[test]
    fn rank_of_reports_position_and_total() {
        let log = vec![
            entry(1, "p1", 100, 0),
            entry(2, "p2", 150, 1),
            entry(3, "p3", 50, 2),
        ];
        assert_eq!(rank_of(&log, "p2", None), Some((1, 3)));
        assert_eq!(rank_of(&log, "p1", None), Some((2, 3)));
        assert_eq!(rank_of(&log, "p3", None), Some((3, 3)));
        assert_eq!(rank_of(&log, "ghost", None), None);

        // A player whose entries all fall after the cutoff is not found.
        let cutoff = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();
        assert_eq!(rank_of(&log, "p3", Some(cutoff)), None);
        assert_eq!(rank_of(&log, "p1", Some(cutoff)), Some((2, 2)));
    }

    #[test]
    fn attempts_mode_keeps_every_submission() {
        let log = vec![
            entry(1, "p1", 100, 0),
            entry(2, "p1", 150, 1),
            entry(3, "p2", 150, 2),
        ];
        let rows = rank_entries(&log, None);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, 2); // 150 at the earlier timestamp
        assert_eq!(rows[1].id, 3);
        assert_eq!(rows[2].id, 1);
    }
}
