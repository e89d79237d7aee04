//! SQLite persistence for the four-collection document.
//!
//! One database file holds `scores`, `prize_codes`, `leaderboard_snapshots`,
//! and `logs`. Scores and logs are pure append; prize codes take the single
//! redemption update in place; snapshot rows are inserted once per cutoff.
//! The whole document is loaded at boot and written through synchronously:
//! a mutating request is only acknowledged after its rows are on disk.

use anyhow::Context;
use chrono::{DateTime, Utc};
use dreamrun_engine::{CodeBook, Ledger};
use dreamrun_types::{time, AuditRecord, PrizeCode, ScoreEntry, SnapshotRow};
use rusqlite::{params, Connection};
use std::path::Path;

pub struct Persistence {
    conn: Connection,
}

impl Persistence {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open leaderboard db")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Read the full document back into a [`Ledger`].
    pub fn load(&self) -> anyhow::Result<Ledger> {
        Ok(Ledger {
            scores: self.load_scores()?,
            codes: CodeBook::from_rows(self.load_codes()?),
            snapshots: self.load_snapshots()?,
            audit: self.load_audit()?,
        })
    }

    pub fn append_score(&self, entry: &ScoreEntry) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO scores (id, player_id, score, ts, ip, ua) VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    entry.id as i64,
                    entry.player_id,
                    entry.score as i64,
                    time::format_ts(entry.ts),
                    entry.ip,
                    entry.ua,
                ],
            )
            .context("persist score entry")?;
        Ok(())
    }

    pub fn upsert_code(&self, code: &PrizeCode) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO prize_codes
                 (code, rank, player_id, issued_at, expires_at, used_at, used_by, notes)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    code.code,
                    code.rank as i64,
                    code.player_id,
                    time::format_ts(code.issued_at),
                    time::format_ts(code.expires_at),
                    code.used_at.map(time::format_ts),
                    code.used_by,
                    code.notes,
                ],
            )
            .context("persist prize code")?;
        Ok(())
    }

    pub fn mark_used(
        &self,
        code: &str,
        used_at: DateTime<Utc>,
        used_by: Option<&str>,
    ) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE prize_codes SET used_at = ?, used_by = ? WHERE code = ?",
                params![time::format_ts(used_at), used_by, code],
            )
            .context("persist code redemption")?;
        Ok(())
    }

    /// Insert a finalized row-set atomically: either every row for the
    /// cutoff lands or none does.
    pub fn insert_snapshot_rows(&mut self, rows: &[SnapshotRow]) -> anyhow::Result<()> {
        let tx = self.conn.transaction().context("begin snapshot write")?;
        for row in rows {
            tx.execute(
                "INSERT INTO leaderboard_snapshots (id, cutoff_at, rank, player_id, score, code)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    row.id as i64,
                    time::format_ts(row.cutoff_at),
                    row.rank as i64,
                    row.player_id,
                    row.score as i64,
                    row.code,
                ],
            )
            .context("persist snapshot row")?;
        }
        tx.commit().context("commit snapshot write")?;
        Ok(())
    }

    pub fn append_audit(&self, record: &AuditRecord) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO logs (id, ts, action, player_id, detail, ip, ua)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.id as i64,
                    time::format_ts(record.ts),
                    record.action,
                    record.player_id,
                    record.detail,
                    record.ip,
                    record.ua,
                ],
            )
            .context("persist audit record")?;
        Ok(())
    }

    fn load_scores(&self) -> anyhow::Result<Vec<ScoreEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, player_id, score, ts, ip, ua FROM scores ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut scores = Vec::new();
        for row in rows {
            let (id, player_id, score, ts, ip, ua) = row?;
            scores.push(ScoreEntry {
                id: id as u64,
                player_id,
                score: score as u32,
                ts: parse_stored_ts(&ts)?,
                ip,
                ua,
            });
        }
        Ok(scores)
    }

    fn load_codes(&self) -> anyhow::Result<Vec<PrizeCode>> {
        let mut stmt = self.conn.prepare(
            "SELECT code, rank, player_id, issued_at, expires_at, used_at, used_by, notes
             FROM prize_codes ORDER BY issued_at ASC, code ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut codes = Vec::new();
        for row in rows {
            let (code, rank, player_id, issued_at, expires_at, used_at, used_by, notes) = row?;
            codes.push(PrizeCode {
                code,
                rank: rank as u32,
                player_id,
                issued_at: parse_stored_ts(&issued_at)?,
                expires_at: parse_stored_ts(&expires_at)?,
                used_at: used_at.as_deref().map(parse_stored_ts).transpose()?,
                used_by,
                notes,
            });
        }
        Ok(codes)
    }

    fn load_snapshots(&self) -> anyhow::Result<Vec<SnapshotRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, cutoff_at, rank, player_id, score, code
             FROM leaderboard_snapshots ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (id, cutoff_at, rank, player_id, score, code) = row?;
            snapshots.push(SnapshotRow {
                id: id as u64,
                cutoff_at: parse_stored_ts(&cutoff_at)?,
                rank: rank as u32,
                player_id,
                score: score as u32,
                code,
            });
        }
        Ok(snapshots)
    }

    fn load_audit(&self) -> anyhow::Result<Vec<AuditRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, ts, action, player_id, detail, ip, ua FROM logs ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut audit = Vec::new();
        for row in rows {
            let (id, ts, action, player_id, detail, ip, ua) = row?;
            audit.push(AuditRecord {
                id: id as u64,
                ts: parse_stored_ts(&ts)?,
                action,
                player_id,
                detail,
                ip,
                ua,
            });
        }
        Ok(audit)
    }
}

fn parse_stored_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    time::parse_ts(raw).with_context(|| format!("corrupt stored timestamp: {raw}"))
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS scores (
             id INTEGER PRIMARY KEY,
             player_id TEXT NOT NULL,
             score INTEGER NOT NULL,
             ts TEXT NOT NULL,
             ip TEXT,
             ua TEXT
         );
         CREATE TABLE IF NOT EXISTS prize_codes (
             code TEXT PRIMARY KEY,
             rank INTEGER NOT NULL,
             player_id TEXT NOT NULL,
             issued_at TEXT NOT NULL,
             expires_at TEXT NOT NULL,
             used_at TEXT,
             used_by TEXT,
             notes TEXT
         );
         CREATE TABLE IF NOT EXISTS leaderboard_snapshots (
             id INTEGER PRIMARY KEY,
             cutoff_at TEXT NOT NULL,
             rank INTEGER NOT NULL,
             player_id TEXT NOT NULL,
             score INTEGER NOT NULL,
             code TEXT
         );
         CREATE INDEX IF NOT EXISTS snapshots_cutoff ON leaderboard_snapshots(cutoff_at);
         CREATE TABLE IF NOT EXISTS logs (
             id INTEGER PRIMARY KEY,
             ts TEXT NOT NULL,
             action TEXT NOT NULL,
             player_id TEXT,
             detail TEXT,
             ip TEXT,
             ua TEXT
         );",
    )
    .context("init leaderboard schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn at_minute(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn document_round_trips_through_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("board.db");
        let mut rng = StdRng::seed_from_u64(5);

        let mut ledger = Ledger::default();
        ledger
            .append_score("p1", 100, at_minute(0), Some("127.0.0.1".into()), Some("ua".into()))
            .unwrap();
        ledger.append_score("p2", 90, at_minute(1), None, None).unwrap();
        ledger.codes.issue("p1", 1, at_minute(2), &mut rng).unwrap();
        let outcome = ledger
            .finalize(at_minute(10), 10, at_minute(11), &mut rng)
            .unwrap();
        ledger.record_audit(
            "score_submit",
            Some("p1".into()),
            Some("{\"score\":100}".into()),
            Some("127.0.0.1".into()),
            Some("ua".into()),
            at_minute(0),
        );

        {
            let mut db = Persistence::open(&path).unwrap();
            for entry in &ledger.scores {
                db.append_score(entry).unwrap();
            }
            for code in ledger.codes.rows() {
                db.upsert_code(code).unwrap();
            }
            db.insert_snapshot_rows(&ledger.snapshots).unwrap();
            for record in &ledger.audit {
                db.append_audit(record).unwrap();
            }
        }

        let db = Persistence::open(&path).unwrap();
        let loaded = db.load().unwrap();
        assert_eq!(loaded.scores, ledger.scores);
        assert_eq!(loaded.codes.rows(), ledger.codes.rows());
        assert_eq!(loaded.snapshots, ledger.snapshots);
        assert_eq!(loaded.audit, ledger.audit);
        assert_eq!(loaded.winners_of(at_minute(10)).len(), outcome.winners.len());
    }

    #[test]
    fn redemption_update_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("board.db");
        let mut rng = StdRng::seed_from_u64(6);

        let mut book = CodeBook::default();
        let code = book.issue("p1", 1, at_minute(0), &mut rng).unwrap().code.clone();
        {
            let db = Persistence::open(&path).unwrap();
            db.upsert_code(book.lookup(&code).unwrap()).unwrap();
            let used_at = book.redeem(&code, Some("booth"), at_minute(3)).unwrap();
            db.mark_used(&code, used_at, Some("booth")).unwrap();
        }

        let db = Persistence::open(&path).unwrap();
        let loaded = db.load().unwrap();
        let row = loaded.codes.lookup(&code).unwrap();
        assert_eq!(row.used_at, Some(at_minute(3)));
        assert_eq!(row.used_by.as_deref(), Some("booth"));
    }

    #[test]
    fn empty_database_loads_empty_document() {
        let dir = tempdir().unwrap();
        let db = Persistence::open(&dir.path().join("board.db")).unwrap();
        let ledger = db.load().unwrap();
        assert!(ledger.scores.is_empty());
        assert!(ledger.codes.is_empty());
        assert!(ledger.snapshots.is_empty());
        assert!(ledger.audit.is_empty());
    }
}
