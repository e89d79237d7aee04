//! HTTP backend for the dreamrun leaderboard and prize-code service.
//!
//! The server owns one [`Backend`]: the in-memory ledger behind a
//! reader-writer lock, plus a SQLite document it writes through before any
//! mutating request is acknowledged. Handlers never touch shared state
//! directly; every operation goes through an explicit `Backend` method that
//! serializes the read-modify-write cycle.

mod api;
pub use api::Api;

mod metrics;
pub use metrics::{OpsMetrics, OpsMetricsSnapshot};

mod persistence;
pub use persistence::Persistence;

mod state;
pub use state::{Actor, Backend, OpError, ServerConfig};
