pub mod db;
pub mod tracker;

pub use db::{PresenceDb, StoredInterval};
pub use tracker::{PresenceChange, PresenceError, PresenceInterval, PresenceTracker};
