//! Prize-code registry: issuance, lookup, and redemption.
//!
//! Codes are short human-readable credentials: a `DRM-` prefix plus four
//! symbols from a 32-symbol alphabet that excludes the visually ambiguous
//! `0/O/I/1`. A player holds at most one code ever, regardless of how many
//! times they qualify. Expiry is computed against the caller's clock at
//! read time; nothing flips a stored flag when a code ages out.

use chrono::{DateTime, Duration, Utc};
use dreamrun_types::{CodeStatus, IssueError, PrizeCode, RedeemError, MAX_PLAYER_ID_LEN};
use rand::Rng;

/// Code symbols, minus `0/O/I/1`.
pub const CODE_ALPHABET: &[u8; 32] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Symbols per code, after the prefix.
pub const CODE_LEN: usize = 4;

/// Prefix on every issued prize code.
pub const PRIZE_CODE_PREFIX: &str = "DRM-";

/// Codes expire this long after issuance, never extended.
pub const CODE_TTL_DAYS: i64 = 7;

/// Generation retries before issuance gives up with
/// [`IssueError::CodeSpaceExhausted`].
pub const MAX_GENERATION_ATTEMPTS: u32 = 10;

/// The `prize_codes` collection. Append-mostly: rows are only ever mutated
/// by redemption, which sets `used_at`/`used_by` exactly once.
#[derive(Clone, Debug, Default)]
pub struct CodeBook {
    codes: Vec<PrizeCode>,
}

impl CodeBook {
    pub fn from_rows(codes: Vec<PrizeCode>) -> Self {
        Self { codes }
    }

    pub fn rows(&self) -> &[PrizeCode] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// The code held by `player_id`, if any.
    pub fn for_player(&self, player_id: &str) -> Option<&PrizeCode> {
        self.codes.iter().find(|c| c.player_id == player_id)
    }

    pub fn lookup(&self, code: &str) -> Option<&PrizeCode> {
        self.codes.iter().find(|c| c.code == code)
    }

    /// Issue a fresh code for `player_id` at leaderboard position `rank`.
    ///
    /// Issuance is keyed by player: a second call for the same player fails
    /// with [`IssueError::AlreadyIssued`] carrying the original code.
    /// Candidate generation retries a bounded number of times on collision
    /// and never stores a duplicate.
    pub fn issue(
        &mut self,
        player_id: &str,
        rank: u32,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Result<&PrizeCode, IssueError> {
        if let Some(existing) = self.for_player(player_id) {
            return Err(IssueError::AlreadyIssued {
                player_id: player_id.to_string(),
                code: existing.code.clone(),
            });
        }

        let mut candidate = None;
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let code = random_code(rng);
            if self.lookup(&code).is_none() {
                candidate = Some(code);
                break;
            }
        }
        let Some(code) = candidate else {
            tracing::error!(
                player_id,
                attempts = MAX_GENERATION_ATTEMPTS,
                registry_size = self.codes.len(),
                "prize code generation exhausted retry budget"
            );
            return Err(IssueError::CodeSpaceExhausted(MAX_GENERATION_ATTEMPTS));
        };

        self.codes.push(PrizeCode {
            code,
            rank,
            player_id: player_id.to_string(),
            issued_at: now,
            expires_at: now + Duration::days(CODE_TTL_DAYS),
            used_at: None,
            used_by: None,
            notes: None,
        });
        Ok(self.codes.last().expect("just pushed"))
    }

    /// Classify a code without mutating anything. Expiry is evaluated
    /// against `now`, so the same row can report `valid` before the
    /// boundary and `expired` after it.
    pub fn verify(&self, code: &str, now: DateTime<Utc>) -> CodeStatus {
        let Some(pc) = self.lookup(code) else {
            return CodeStatus::NotFound;
        };
        if let Some(used_at) = pc.used_at {
            return CodeStatus::Used {
                used_at,
                used_by: pc.used_by.clone(),
                rank: pc.rank,
                player_id: pc.player_id.clone(),
            };
        }
        if pc.is_expired(now) {
            return CodeStatus::Expired {
                rank: pc.rank,
                player_id: pc.player_id.clone(),
            };
        }
        CodeStatus::Valid {
            rank: pc.rank,
            player_id: pc.player_id.clone(),
            expires_at: pc.expires_at,
        }
    }

    /// Redeem a code. The transition to used is terminal: a second attempt
    /// fails with [`RedeemError::AlreadyUsed`] and nothing about the row
    /// changes.
    pub fn redeem(
        &mut self,
        code: &str,
        used_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RedeemError> {
        let pc = self
            .codes
            .iter_mut()
            .find(|c| c.code == code)
            .ok_or(RedeemError::NotFound)?;
        if let Some(used_at) = pc.used_at {
            return Err(RedeemError::AlreadyUsed(used_at));
        }
        if now > pc.expires_at {
            return Err(RedeemError::Expired(pc.expires_at));
        }
        pc.used_at = Some(now);
        pc.used_by = used_by
            .map(|u| u.chars().take(MAX_PLAYER_ID_LEN).collect::<String>())
            .filter(|u| !u.is_empty());
        Ok(now)
    }
}

fn random_code(rng: &mut impl Rng) -> String {
    let mut code = String::with_capacity(PRIZE_CODE_PREFIX.len() + CODE_LEN);
    code.push_str(PRIZE_CODE_PREFIX);
    for _ in 0..CODE_LEN {
        let idx = rng.gen_range(0..CODE_ALPHABET.len());
        code.push(CODE_ALPHABET[idx] as char);
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::mock::StepRng;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn rng() -> rand::rngs::StdRng {
        use rand::SeedableRng;
        rand::rngs::StdRng::seed_from_u64(17)
    }

    #[test]
    fn issued_codes_use_the_safe_alphabet() {
        let mut book = CodeBook::default();
        let code = book.issue("p1", 1, noon(), &mut rng()).unwrap().code.clone();
        let suffix = code.strip_prefix(PRIZE_CODE_PREFIX).unwrap();
        assert_eq!(suffix.len(), CODE_LEN);
        assert!(suffix.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn second_issue_for_player_returns_original_code() {
        let mut book = CodeBook::default();
        let mut rng = rng();
        let first = book.issue("p1", 1, noon(), &mut rng).unwrap().code.clone();
        // Qualifying again at a different rank changes nothing.
        let err = book.issue("p1", 3, noon(), &mut rng).unwrap_err();
        assert_eq!(
            err,
            IssueError::AlreadyIssued {
                player_id: "p1".to_string(),
                code: first,
            }
        );
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn exhausted_retry_budget_is_surfaced_not_duplicated() {
        // A constant RNG produces the same candidate every attempt; once
        // that candidate exists, issuance must fail rather than store a
        // duplicate.
        let mut constant = StepRng::new(0, 0);
        let mut book = CodeBook::default();
        book.issue("p1", 1, noon(), &mut constant).unwrap();
        let err = book.issue("p2", 2, noon(), &mut constant).unwrap_err();
        assert_eq!(err, IssueError::CodeSpaceExhausted(MAX_GENERATION_ATTEMPTS));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn expiry_is_seven_days_and_boundary_exclusive() {
        let mut book = CodeBook::default();
        let issued = book.issue("p1", 1, noon(), &mut rng()).unwrap();
        let expires_at = issued.expires_at;
        assert_eq!(expires_at, noon() + Duration::days(7));
        let code = issued.code.clone();

        // Exactly at the boundary the code is still valid; one millisecond
        // past it, it is expired.
        assert!(matches!(
            book.verify(&code, expires_at),
            CodeStatus::Valid { .. }
        ));
        assert!(matches!(
            book.verify(&code, expires_at + Duration::milliseconds(1)),
            CodeStatus::Expired { .. }
        ));
    }

    #[test]
    fn verify_reports_all_states_without_mutating() {
        let mut book = CodeBook::default();
        assert_eq!(book.verify("DRM-ZZZZ", noon()), CodeStatus::NotFound);

        let code = book.issue("p1", 2, noon(), &mut rng()).unwrap().code.clone();
        assert_eq!(
            book.verify(&code, noon()),
            CodeStatus::Valid {
                rank: 2,
                player_id: "p1".to_string(),
                expires_at: noon() + Duration::days(7),
            }
        );

        let used_at = book.redeem(&code, Some("booth"), noon()).unwrap();
        assert_eq!(
            book.verify(&code, noon()),
            CodeStatus::Used {
                used_at,
                used_by: Some("booth".to_string()),
                rank: 2,
                player_id: "p1".to_string(),
            }
        );
        // A used code stays used even past its expiry.
        assert!(matches!(
            book.verify(&code, noon() + Duration::days(30)),
            CodeStatus::Used { .. }
        ));
    }

    #[test]
    fn redeem_is_terminal() {
        let mut book = CodeBook::default();
        let code = book.issue("p1", 1, noon(), &mut rng()).unwrap().code.clone();
        let used_at = book.redeem(&code, Some("ops"), noon()).unwrap();
        assert_eq!(
            book.redeem(&code, Some("ops"), noon() + Duration::hours(1)),
            Err(RedeemError::AlreadyUsed(used_at))
        );
    }

    #[test]
    fn redeem_rejects_unknown_and_expired() {
        let mut book = CodeBook::default();
        assert_eq!(
            book.redeem("DRM-ZZZZ", None, noon()),
            Err(RedeemError::NotFound)
        );
        let code = book.issue("p1", 1, noon(), &mut rng()).unwrap().code.clone();
        let late = noon() + Duration::days(8);
        assert_eq!(
            book.redeem(&code, None, late),
            Err(RedeemError::Expired(noon() + Duration::days(7)))
        );
        // The failed redemption left the row untouched.
        assert!(book.lookup(&code).unwrap().used_at.is_none());
    }

    #[test]
    fn redeem_truncates_and_normalizes_used_by() {
        let mut book = CodeBook::default();
        let mut rng = rng();
        let code = book.issue("p1", 1, noon(), &mut rng).unwrap().code.clone();
        let long = "b".repeat(80);
        book.redeem(&code, Some(&long), noon()).unwrap();
        assert_eq!(book.lookup(&code).unwrap().used_by.as_ref().unwrap().len(), 64);

        let code2 = book.issue("p2", 2, noon(), &mut rng).unwrap().code.clone();
        book.redeem(&code2, Some(""), noon()).unwrap();
        assert_eq!(book.lookup(&code2).unwrap().used_by, None);
    }
}
