//! Core logic for the dreamrun leaderboard backend.
//!
//! Everything here is deterministic and I/O-free: callers supply the clock
//! (`now`) and the randomness source, which keeps expiry boundaries and
//! code-generation collisions directly testable. The [`ledger::Ledger`] is
//! the in-memory form of the persisted document; the API layer owns locking
//! and durability around it.

pub mod codes;
pub mod ledger;
pub mod pubcode;
pub mod ranking;

pub use codes::CodeBook;
pub use ledger::{FinalizeOutcome, Ledger};
