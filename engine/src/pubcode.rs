//! Public display codes.
//!
//! A public code is a cosmetic label for a player: `PLY-` plus four
//! symbols derived from a salted one-way hash of the player id. It is
//! deliberately kept apart from the prize-code registry: it is
//! deterministic, not secret, and must never be consulted for
//! authorization.

use crate::codes::{CODE_ALPHABET, CODE_LEN};
use sha2::{Digest, Sha256};

/// Prefix on every public display code.
pub const PUBLIC_CODE_PREFIX: &str = "PLY-";

/// Derive the display code for `player_id` under the server's salt.
pub fn public_code(salt: &str, player_id: &str) -> String {
    let digest = Sha256::digest(format!("{salt}|{player_id}").as_bytes());
    let mut code = String::with_capacity(PUBLIC_CODE_PREFIX.len() + CODE_LEN);
    code.push_str(PUBLIC_CODE_PREFIX);
    for byte in digest.iter().take(CODE_LEN) {
        let idx = (*byte as usize) % CODE_ALPHABET.len();
        code.push(CODE_ALPHABET[idx] as char);
    }
    code
}
